use std::time::Duration;

/// Retry budget and backoff for outbox dispatch
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: i32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 2000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Delay before the next attempt, given how many attempts already failed
    pub fn delay_after_failures(&self, failures: i32) -> Duration {
        let exponent = failures.saturating_sub(1).max(0);
        let base_delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Failures so far for an entry with `remaining` retries left
    pub fn failures_for(&self, remaining: i32) -> i32 {
        (self.max_retries - remaining).max(0)
    }
}
