// Performance metrics module
//
// Lightweight counters for monitoring captioning throughput across runs

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Process-wide captioning metrics
///
/// Uses atomic operations so per-item tasks can record without locks.
/// Unlike the run state, these survive `start()` and accumulate for the
/// lifetime of the orchestrator.
#[derive(Debug)]
pub struct Metrics {
    /// Images captioned successfully
    pub images_captioned: AtomicUsize,

    /// Images whose captioning failed
    pub images_failed: AtomicUsize,

    /// Results dropped because the run had already stopped
    pub results_discarded: AtomicUsize,

    /// Total time spent inside per-item tasks, in milliseconds
    pub total_caption_time_ms: AtomicU64,

    /// Tokens reported by providers
    pub tokens_used: AtomicU64,

    /// Runs started
    pub runs_started: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            images_captioned: AtomicUsize::new(0),
            images_failed: AtomicUsize::new(0),
            results_discarded: AtomicUsize::new(0),
            total_caption_time_ms: AtomicU64::new(0),
            tokens_used: AtomicU64::new(0),
            runs_started: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_image_captioned(&self) {
        self.images_captioned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_image_failed(&self) {
        self.images_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result_discarded(&self) {
        self.results_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record wall time spent on one image
    pub fn record_caption_time(&self, duration: Duration) {
        self.total_caption_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_tokens(&self, tokens: u64) {
        self.tokens_used.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average time per attempted image in milliseconds
    pub fn avg_caption_time_ms(&self) -> f64 {
        let total = self.total_caption_time_ms.load(Ordering::Relaxed);
        let count = self.images_captioned.load(Ordering::Relaxed)
            + self.images_failed.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        let uptime = self.uptime();
        tracing::info!("=== Captioning Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", uptime.as_secs_f64());
        tracing::info!(
            "Runs: {}, images: {} captioned, {} failed, {} discarded after stop",
            self.runs_started.load(Ordering::Relaxed),
            self.images_captioned.load(Ordering::Relaxed),
            self.images_failed.load(Ordering::Relaxed),
            self.results_discarded.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Total caption time: {:.2}s (avg: {:.2}ms per image)",
            self.total_caption_time_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            self.avg_caption_time_ms()
        );
        tracing::info!("Tokens used: {}", self.tokens_used.load(Ordering::Relaxed));
    }

    /// Log periodic metrics (for long-running operations)
    pub fn log_periodic(&self) {
        tracing::info!(
            "Metrics: {} images processed, {} tokens, uptime {:.0}s",
            self.images_captioned.load(Ordering::Relaxed)
                + self.images_failed.load(Ordering::Relaxed),
            self.tokens_used.load(Ordering::Relaxed),
            self.uptime().as_secs_f64()
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
