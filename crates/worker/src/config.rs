use std::time::Duration;

/// Tuning knobs shared by the job processor and worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Additional attempts after the first failure of a retryable error.
    pub max_retries: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Ceiling for the exponential backoff.
    pub max_backoff: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
    /// Lease taken on a job claim while processing it.
    pub lock_lease: Duration,
    /// How long an idle worker sleeps before polling the queue again.
    pub poll_interval: Duration,
    /// Skip jobs whose (workflow, step, subscriber, transaction) already
    /// completed, so replayed triggers do not deliver twice.
    pub dedupe_transactions: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            lock_lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            dedupe_transactions: true,
        }
    }
}

impl WorkerConfig {
    /// Backoff before retry number `attempt` (zero-based), exponential
    /// and capped at `max_backoff`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = backoff_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = WorkerConfig::default();
        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(2000));
        // Far past the cap
        assert_eq!(config.backoff_for_attempt(20), Duration::from_secs(60));
    }
}
