pub mod api;
pub mod auth;
pub mod blob;
pub mod cli;
pub mod config;
pub mod credits;
pub mod deadletter;
pub mod docstore;
pub mod humanize;
pub mod idempotency;
pub mod imageprep;
pub mod kv;
pub mod moderation;
pub mod observability;
pub mod ops;
pub mod provider;
pub mod queue;
pub mod ratelimit;
pub mod retry;
pub mod trace;
pub mod worker;
