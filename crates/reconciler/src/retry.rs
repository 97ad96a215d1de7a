//! Retry policy for failed outbox events.
//!
//! Exponential backoff with jitter. A failed event is parked by pushing its
//! lease expiry into the future instead of sleeping in the worker.

use std::time::Duration;

use rand::Rng;

/// What to do with an event whose reconcile attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Claimable again on the next poll.
    Immediate,
    /// Claimable again after the delay.
    After(Duration),
    /// Out of attempts; retire the event.
    DeadLetter,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay between retries (caps exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0).
    pub multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub jitter: bool,
    /// Total attempts before dead-lettering; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Failed events are claimable again on the very next poll.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64)
    }

    /// Backoff before retry number `attempt`, with jitter applied.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
        Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
    }

    /// Decide the fate of an event that has failed `attempts_so_far` times
    /// before this failure.
    #[must_use]
    pub fn decide(&self, attempts_so_far: u32) -> RetryDecision {
        let attempts = attempts_so_far.saturating_add(1);
        if self.max_attempts.is_some_and(|max| attempts >= max) {
            return RetryDecision::DeadLetter;
        }

        match self.delay_for(attempts) {
            delay if delay.is_zero() => RetryDecision::Immediate,
            delay => RetryDecision::After(delay),
        }
    }
}
