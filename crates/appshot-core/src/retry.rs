use std::time::Duration;

use rand::Rng;

use crate::job::DEFAULT_MAX_ATTEMPTS;

/// Result of a single scrape attempt, as handed to the retry controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrapeOutcome {
    Success(Vec<String>),
    RetryableFailure(String),
    PermanentFailure(String),
}

/// What the worker must do next with a job.
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    Complete {
        result: Vec<String>,
    },
    /// Reschedule the message with `attempt` prior attempts after `delay`.
    Retry {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Fail {
        error: String,
    },
}

/// Exponential backoff with additive jitter.
///
/// Delay schedule (defaults): 60s, 120s, 240s, ... capped at `max_delay`,
/// plus `0..=max_jitter` seconds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(60),
            max_jitter: Duration::from_secs(10),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, without jitter (1-indexed).
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }

    /// Delay including a uniformly random jitter in `[0, max_jitter]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.base_delay_for(attempt).saturating_add(jitter)
    }

    /// Decide the next step for a job that has made `attempt_count` of
    /// `max_attempts` attempts and produced `outcome`.
    pub fn next_action(
        &self,
        attempt_count: u32,
        max_attempts: u32,
        outcome: ScrapeOutcome,
    ) -> NextAction {
        match outcome {
            ScrapeOutcome::Success(result) => NextAction::Complete { result },
            ScrapeOutcome::PermanentFailure(error) => NextAction::Fail { error },
            ScrapeOutcome::RetryableFailure(error) if attempt_count >= max_attempts => {
                NextAction::Fail {
                    error: format!("{error} (gave up after {attempt_count} attempts)"),
                }
            }
            ScrapeOutcome::RetryableFailure(error) => NextAction::Retry {
                attempt: attempt_count,
                delay: self.delay_for(attempt_count),
                error,
            },
        }
    }
}
