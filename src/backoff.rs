//! Exponential backoff for retrying LLM API requests.

use std::time::Duration;

/// Doubling delay between attempts, capped at `max`, for a bounded number of retries.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
    max_attempts: u32,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at `initial`, capping at `max`, allowing
    /// `max_attempts` retries.
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempts: 0,
            max_attempts,
        }
    }

    /// Delay before the next retry, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }

    /// Retries used so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30), 3)
    }
}

/// Statuses worth retrying: rate limiting, overload and server errors.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 529) || (500..600).contains(&status)
}
