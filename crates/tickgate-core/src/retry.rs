//! Retry logic with exponential backoff and jitter.
//!
//! Failures are classified by their textual description. Only descriptions
//! that look like transient network or anti-scraping conditions are retried;
//! everything else is surfaced on the attempt that produced it.

use std::fmt::Display;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::clock::{Clock, Jitter, RandomJitter, SystemClock};
use crate::config::duration_secs;
use crate::error::ConfigError;

/// Substrings (lowercase) that mark a failure as transient.
pub const DEFAULT_RETRYABLE_KEYWORDS: [&str; 10] = [
    "connection",
    "timeout",
    "reset",
    "refused",
    "403",
    "429",
    "rate limit",
    "too many request",
    "forbidden",
    "network",
];

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Retry parameters. Replaced as a whole on reconfiguration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    /// Add a random addend from `[jitter_min, jitter_max)` after capping.
    pub jitter: bool,
    #[serde(with = "duration_secs")]
    pub jitter_min: Duration,
    #[serde(with = "duration_secs")]
    pub jitter_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            jitter: true,
            jitter_min: Duration::from_secs(1),
            jitter_max: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Default delays with the given retry count.
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// A `base_delay` above `max_delay` is allowed; every backoff is then
    /// `max_delay`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jitter_min > self.jitter_max {
            return Err(ConfigError::InvertedJitterRange {
                low: self.jitter_min,
                high: self.jitter_max,
            });
        }
        Ok(())
    }

    /// Capped exponential delay after the `attempt`-th failure (0-based),
    /// before any jitter: `min(base_delay * 2^attempt, max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let scaled = 1u128
            .checked_shl(attempt)
            .and_then(|factor| self.base_delay.as_nanos().checked_mul(factor));
        match scaled {
            Some(nanos) if nanos < self.max_delay.as_nanos() => Duration::new(
                (nanos / NANOS_PER_SEC) as u64,
                (nanos % NANOS_PER_SEC) as u32,
            ),
            _ => self.max_delay,
        }
    }

    /// Full sleep before the next attempt, jitter included when enabled.
    pub fn delay_for_attempt(&self, attempt: u32, jitter: &dyn Jitter) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter {
            delay.saturating_add(jitter.between(self.jitter_min, self.jitter_max))
        } else {
            delay
        }
    }
}

/// Decides whether a failure description is worth retrying.
pub trait ErrorClassifier: Send + Sync {
    fn is_retryable(&self, description: &str) -> bool;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_retryable(&self, description: &str) -> bool {
        self(description)
    }
}

/// Case-insensitive substring classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordClassifier {
    keywords: Vec<String>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_RETRYABLE_KEYWORDS)
    }
}

impl KeywordClassifier {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|keyword| keyword.as_ref().to_lowercase())
                .filter(|keyword| !keyword.is_empty())
                .collect(),
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }
}

impl ErrorClassifier for KeywordClassifier {
    fn is_retryable(&self, description: &str) -> bool {
        let description = description.to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| description.contains(keyword.as_str()))
    }
}

/// Terminal outcome of [`Retrier::execute`]. Both variants carry the last
/// failure the operation produced.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("non-retryable failure on attempt {attempt}: {error}")]
    Rejected { error: E, attempt: u32 },
    #[error("retries exhausted after {attempts} attempt(s): {error}")]
    Exhausted { error: E, attempts: u32 },
}

impl<E> RetryError<E> {
    /// True when the failure was transient and simply outlived the retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Rejected { attempt, .. } => *attempt,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn error(&self) -> &E {
        match self {
            Self::Rejected { error, .. } | Self::Exhausted { error, .. } => error,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            Self::Rejected { error, .. } | Self::Exhausted { error, .. } => error,
        }
    }
}

/// Runs a fallible operation with classified, exponentially backed-off retries.
pub struct Retrier {
    policy: RwLock<Arc<RetryPolicy>>,
    classifier: Arc<dyn ErrorClassifier>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock), Arc::new(RandomJitter))
    }

    pub fn with_clock(policy: RetryPolicy, clock: Arc<dyn Clock>, jitter: Arc<dyn Jitter>) -> Self {
        Self {
            policy: RwLock::new(Arc::new(policy)),
            classifier: Arc::new(KeywordClassifier::default()),
            clock,
            jitter,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Current policy snapshot.
    pub fn policy(&self) -> Arc<RetryPolicy> {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps in a new policy. In-flight executions keep the one they started with.
    pub fn set_policy(&self, policy: RetryPolicy) -> Result<(), ConfigError> {
        policy.validate()?;
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(policy);
        Ok(())
    }

    pub fn is_retryable(&self, description: &str) -> bool {
        self.classifier.is_retryable(description)
    }

    /// Runs `operation` up to `max_retries + 1` times.
    ///
    /// Returns the first success. A non-retryable failure is returned at once
    /// without sleeping; a retryable failure on the final attempt is returned
    /// as [`RetryError::Exhausted`].
    pub fn execute<T, E, F>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: Display,
    {
        let policy = self.policy();
        let total = policy.max_retries.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            let failure = match operation() {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };
            let description = failure.to_string();

            if !self.classifier.is_retryable(&description) {
                warn!(attempt = attempt + 1, error = %description, "non-retryable failure");
                return Err(RetryError::Rejected {
                    error: failure,
                    attempt: attempt + 1,
                });
            }

            if attempt >= policy.max_retries {
                error!(
                    attempts = total,
                    error = %description,
                    "retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    error: failure,
                    attempts: attempt + 1,
                });
            }

            let delay = policy.delay_for_attempt(attempt, self.jitter.as_ref());
            warn!(
                attempt = attempt + 1,
                total,
                delay_ms = delay.as_millis() as u64,
                error = %description,
                "retryable failure, backing off"
            );
            self.clock.sleep(delay);
            attempt += 1;
        }
    }
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("policy", &self.policy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedJitter, ManualClock};

    fn policy(max_retries: u32, base: u64, max: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_secs(base),
            max_delay: Duration::from_secs(max),
            ..RetryPolicy::default()
        }
        .without_jitter()
    }

    fn manual_retrier(policy: RetryPolicy) -> (Retrier, ManualClock) {
        let clock = ManualClock::new();
        let retrier = Retrier::with_clock(policy, Arc::new(clock.clone()), Arc::new(FixedJitter(0.0)));
        (retrier, clock)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy(3, 5, 60);

        let delays = (0..6).map(|k| policy.backoff(k).as_secs()).collect::<Vec<_>>();

        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn backoff_saturates_for_huge_attempts() {
        let policy = policy(3, 5, 60);

        assert_eq!(policy.backoff(40), Duration::from_secs(60));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn backoff_is_exact_below_the_cap_for_late_attempts() {
        let zero = policy(3, 0, 60);
        assert_eq!(zero.backoff(0), Duration::ZERO);
        assert_eq!(zero.backoff(200), Duration::ZERO);

        let tiny = RetryPolicy {
            base_delay: Duration::from_nanos(1),
            ..policy(3, 0, 60)
        };
        assert_eq!(tiny.backoff(32), Duration::from_nanos(1 << 32));
        assert_eq!(tiny.backoff(36), Duration::from_secs(60));
    }

    #[test]
    fn base_above_cap_always_waits_the_cap() {
        let policy = policy(3, 90, 60);

        policy.validate().expect("accepted");
        assert_eq!(policy.backoff(0), Duration::from_secs(60));
        assert_eq!(policy.backoff(3), Duration::from_secs(60));
    }

    #[test]
    fn jitter_on_an_unbounded_cap_saturates() {
        let policy = RetryPolicy {
            max_delay: Duration::MAX,
            ..RetryPolicy::default()
        };

        policy.validate().expect("accepted");
        assert_eq!(policy.delay_for_attempt(70, &FixedJitter(0.5)), Duration::MAX);
    }

    #[test]
    fn jitter_is_added_after_the_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(40),
            max_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };

        assert_eq!(
            policy.delay_for_attempt(1, &FixedJitter(0.5)),
            Duration::from_secs(62)
        );
        assert_eq!(
            policy.delay_for_attempt(0, &FixedJitter(0.0)),
            Duration::from_secs(41)
        );
    }

    #[test]
    fn keyword_classifier_matches_case_insensitively() {
        let classifier = KeywordClassifier::default();

        assert!(classifier.is_retryable("Connection reset by peer"));
        assert!(classifier.is_retryable("HTTP 429 Too Many Requests"));
        assert!(classifier.is_retryable("read TIMEOUT"));
        assert!(classifier.is_retryable("403 Forbidden"));
        assert!(classifier.is_retryable("upstream rate limit hit"));
        assert!(!classifier.is_retryable("KeyError: 'data'"));
        assert!(!classifier.is_retryable("malformed JSON payload"));
    }

    #[test]
    fn custom_keywords_ignore_empty_entries() {
        let classifier = KeywordClassifier::new(["", "Busy"]);

        assert_eq!(classifier.keywords(), &[String::from("busy")]);
        assert!(classifier.is_retryable("server busy"));
        assert!(!classifier.is_retryable("anything else"));
    }

    #[test]
    fn exhausts_after_max_retries_plus_one_attempts() {
        let (retrier, clock) = manual_retrier(policy(3, 5, 60));
        let mut calls = 0;

        let result: Result<(), _> = retrier.execute(|| {
            calls += 1;
            Err(format!("connection reset (call {calls})"))
        });

        let failure = result.expect_err("always failing operation");
        assert_eq!(calls, 4);
        assert!(failure.is_retryable());
        assert_eq!(failure.attempts(), 4);
        assert_eq!(failure.into_inner(), "connection reset (call 4)");
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20)
            ]
        );
    }

    #[test]
    fn non_retryable_failure_short_circuits_without_sleeping() {
        let (retrier, clock) = manual_retrier(policy(3, 5, 60));
        let mut calls = 0;

        let result: Result<(), _> = retrier.execute(|| {
            calls += 1;
            Err("unexpected payload shape")
        });

        let failure = result.expect_err("non-retryable failure");
        assert_eq!(calls, 1);
        assert!(!failure.is_retryable());
        assert_eq!(failure.attempts(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn zero_retries_means_single_attempt() {
        let (retrier, clock) = manual_retrier(RetryPolicy::no_retry());
        let mut calls = 0;

        let result: Result<(), _> = retrier.execute(|| {
            calls += 1;
            Err("network unreachable")
        });

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert_eq!(calls, 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn returns_first_success() {
        let (retrier, clock) = manual_retrier(policy(3, 5, 60));
        let mut calls = 0;

        let value = retrier
            .execute(|| {
                calls += 1;
                if calls < 3 {
                    Err("429 too many requests")
                } else {
                    Ok(calls)
                }
            })
            .expect("third attempt succeeds");

        assert_eq!(value, 3);
        assert_eq!(calls, 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(5), Duration::from_secs(10)]
        );
    }

    #[test]
    fn closure_classifier_can_replace_keywords() {
        let (retrier, _clock) = manual_retrier(policy(1, 1, 1));
        let retrier = retrier.with_classifier(Arc::new(|description: &str| description.starts_with("E503")));
        let mut calls = 0;

        let result: Result<(), _> = retrier.execute(|| {
            calls += 1;
            Err("E503 service unavailable")
        });

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 2, .. })));
        assert!(!retrier.is_retryable("connection reset"));
    }

    #[test]
    fn set_policy_replaces_whole_policy() {
        let (retrier, _clock) = manual_retrier(RetryPolicy::default());

        retrier
            .set_policy(policy(1, 2, 4))
            .expect("valid policy");

        assert_eq!(*retrier.policy(), policy(1, 2, 4));
    }

    #[test]
    fn set_policy_rejects_inverted_jitter_range() {
        let (retrier, _clock) = manual_retrier(RetryPolicy::default());
        let inverted = RetryPolicy {
            jitter_min: Duration::from_secs(3),
            jitter_max: Duration::from_secs(1),
            ..RetryPolicy::default()
        };

        let error = retrier
            .set_policy(inverted)
            .expect_err("inverted jitter range rejected");

        assert!(matches!(error, ConfigError::InvertedJitterRange { .. }));
        assert_eq!(*retrier.policy(), RetryPolicy::default());
    }
}
