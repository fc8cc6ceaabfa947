//! Process-local metrics and the readiness latency sample

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter handles shared between the API front and the worker pool
#[derive(Debug, Default)]
pub struct Metrics {
    jobs_accepted: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_replayed: AtomicU64,
    tasks_retried: AtomicU64,
    moderation_rejected: AtomicU64,
    credits_denied: AtomicU64,
    rate_limited: AtomicU64,
    idempotent_replays: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_accepted(&self) {
        self.jobs_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_replayed(&self) {
        self.jobs_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn moderation_rejected(&self) {
        self.moderation_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn credits_denied(&self) {
        self.credits_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idempotent_replay(&self) {
        self.idempotent_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_accepted: self.jobs_accepted.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_replayed: self.jobs_replayed.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            moderation_rejected: self.moderation_rejected.load(Ordering::Relaxed),
            credits_denied: self.credits_denied.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            idempotent_replays: self.idempotent_replays.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub jobs_accepted: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_replayed: u64,
    pub tasks_retried: u64,
    pub moderation_rejected: u64,
    pub credits_denied: u64,
    pub rate_limited: u64,
    pub idempotent_replays: u64,
}

/// Fixed-size ring of recent request latencies, summarized by the readiness
/// probe. Capacity follows `HEALTH_METRIC_SAMPLE_SIZE`.
#[derive(Debug)]
pub struct LatencySampler {
    samples: Mutex<VecDeque<u32>>,
    capacity: usize,
}

impl LatencySampler {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, millis: u32) {
        let mut samples = self.samples.lock().expect("latency sampler poisoned");
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(millis);
    }

    pub fn summary(&self) -> LatencySummary {
        let samples = self.samples.lock().expect("latency sampler poisoned");
        if samples.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted: Vec<u32> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let pick = |q: f64| sorted[((sorted.len() - 1) as f64 * q).round() as usize];
        LatencySummary {
            count: sorted.len(),
            p50_ms: pick(0.5),
            p95_ms: pick(0.95),
            max_ms: *sorted.last().expect("non-empty"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub p50_ms: u32,
    pub p95_ms: u32,
    pub max_ms: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.job_accepted();
        metrics.job_accepted();
        metrics.job_failed();
        let snap = metrics.snapshot();
        assert_eq!(snap.jobs_accepted, 2);
        assert_eq!(snap.jobs_failed, 1);
        assert_eq!(snap.jobs_succeeded, 0);
    }

    #[test]
    fn sampler_keeps_bounded_window() {
        let sampler = LatencySampler::new(3);
        for ms in [10, 20, 30, 40] {
            sampler.record(ms);
        }
        let summary = sampler.summary();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.max_ms, 40);
        assert_eq!(summary.p50_ms, 30);
    }

    #[test]
    fn empty_sampler_is_zeroed() {
        let summary = LatencySampler::new(8).summary();
        assert_eq!(summary.count, 0);
        assert_eq!(summary.max_ms, 0);
    }
}
