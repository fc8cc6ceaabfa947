pub mod admission;
pub mod error;
pub mod models;
mod server;
pub mod services;
pub mod state;
mod stream;

pub use server::{Runtime, build, router, run, run_worker};
