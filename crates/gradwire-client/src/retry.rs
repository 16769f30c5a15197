//! Retry and backpressure policies for the future engine.

use rand::Rng;
use std::time::Duration;

/// Retry policy for transport failures.
///
/// Bounded exponential backoff: `initial_delay * multiplier^retry_count`,
/// capped at `max_delay`, plus up to `jitter` (as a fraction) of extra delay.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first failed attempt.
    pub max_retries: u32,
    /// Initial delay before first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential backoff).
    pub multiplier: f64,
    /// Extra random delay as a fraction of the computed delay (0.0 disables jitter).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy without jitter.
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self { max_retries, initial_delay, max_delay, multiplier, jitter: 0.0 }
    }

    /// Sets the jitter fraction.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `failed_attempts` consecutive failures.
    pub fn allows_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts <= self.max_retries
    }

    /// Calculate the delay for a given retry attempt, without jitter.
    ///
    /// Uses exponential backoff: initial_delay * multiplier^retry_count, capped at max_delay.
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let delay_ms = (self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent))
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// The delay to sleep before retry number `retry_count`, jittered and capped.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        apply_jitter(self.calculate_delay(retry_count), self.jitter).min(self.max_delay)
    }
}

/// Policy for server-reported backpressure (`TryAgain` replies).
///
/// `max_attempts: None` waits for as long as the server keeps asking, which
/// suits long-running training jobs; callers who prefer a hard failure set a bound.
#[derive(Debug, Clone, PartialEq)]
pub struct BackpressurePolicy {
    /// Lower bound on the delay between attempts, whatever the server suggests.
    pub min_delay: Duration,
    /// Maximum number of try-again replies tolerated per future.
    pub max_attempts: Option<u32>,
    /// Extra random delay as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self { min_delay: Duration::from_secs(1), max_attempts: None, jitter: 0.1 }
    }
}

impl BackpressurePolicy {
    /// An unbounded policy with the given minimum delay and no jitter.
    pub fn new(min_delay: Duration) -> Self {
        Self { min_delay, max_attempts: None, jitter: 0.0 }
    }

    /// Bounds the number of try-again replies.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Sets the jitter fraction.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether `attempts` try-again replies exhaust the policy.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// `max(server_hint, min_delay)` plus jitter.
    pub fn next_delay(&self, server_hint: Option<Duration>) -> Duration {
        let base = server_hint.map_or(self.min_delay, |hint| hint.max(self.min_delay));
        apply_jitter(base, self.jitter)
    }
}

/// Adds up to `jitter * delay` of random extra delay.
///
/// Jitter only ever lengthens a delay so a server-suggested wait is never undercut.
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.0..=jitter);
    delay + delay.mul_f64(factor)
}
