use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{Clock, Jitter, RandomJitter, SystemClock};
use crate::config::duration_secs;
use crate::error::ConfigError;
use crate::headers::SessionProvider;

/// Spacing bounds between outbound requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    #[serde(with = "duration_secs")]
    pub min_interval: Duration,
    #[serde(with = "duration_secs")]
    pub max_interval: Duration,
    /// Draw each wait uniformly from `[min_interval, max_interval)` instead of
    /// waiting exactly `min_interval`.
    pub randomized: bool,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(3),
            randomized: true,
        }
    }
}

impl PacingConfig {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            min_interval: interval,
            max_interval: interval,
            randomized: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_interval > self.max_interval {
            return Err(ConfigError::InvertedPacingBounds {
                min: self.min_interval,
                max: self.max_interval,
            });
        }
        Ok(())
    }
}

/// Limiter bookkeeping, guarded by a single mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateState {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub randomized: bool,
    /// Instant the previous caller was released; `None` before the first request.
    pub last_request_at: Option<Instant>,
}

/// Serializes outbound calls so that consecutive releases are at least
/// `min_interval` apart.
///
/// The sleep happens while holding the state lock, which is what makes the
/// spacing global across threads. The network call itself runs after
/// [`PacingLimiter::wait`] returns, outside the lock.
pub struct PacingLimiter {
    state: Mutex<RateState>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
    session: Option<Arc<dyn SessionProvider>>,
}

impl PacingLimiter {
    pub fn new(config: &PacingConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock), Arc::new(RandomJitter))
    }

    pub fn with_clock(config: &PacingConfig, clock: Arc<dyn Clock>, jitter: Arc<dyn Jitter>) -> Self {
        Self {
            state: Mutex::new(RateState {
                min_interval: config.min_interval,
                max_interval: config.max_interval.max(config.min_interval),
                randomized: config.randomized,
                last_request_at: None,
            }),
            clock,
            jitter,
            session: None,
        }
    }

    /// Attaches the identity hook run before every paced request.
    pub fn with_session(mut self, session: Arc<dyn SessionProvider>) -> Self {
        self.session = Some(session);
        self
    }

    /// Blocks until the next request may go out and returns the release instant.
    pub fn wait(&self) -> Instant {
        if let Some(session) = &self.session {
            session.prepare();
        }

        let mut state = self.lock();
        if let Some(last) = state.last_request_at {
            let elapsed = self.clock.now().saturating_duration_since(last);
            if elapsed < state.min_interval {
                let target = if state.randomized {
                    self.jitter.between(state.min_interval, state.max_interval)
                } else {
                    state.min_interval
                };
                let delay = target.saturating_sub(elapsed);
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "pacing outbound request");
                    self.clock.sleep(delay);
                }
            }
        }

        let released = self.clock.now();
        let released = match state.last_request_at {
            Some(last) if last > released => last,
            _ => released,
        };
        state.last_request_at = Some(released);
        released
    }

    /// Replaces both bounds at once; takes effect on the next `wait`.
    pub fn set_interval(&self, min_interval: Duration, max_interval: Duration) -> Result<(), ConfigError> {
        let mut state = self.lock();
        let config = PacingConfig {
            min_interval,
            max_interval,
            randomized: state.randomized,
        };
        config.validate()?;
        state.min_interval = min_interval;
        state.max_interval = max_interval;
        Ok(())
    }

    /// Replaces bounds and the randomization flag from a full config.
    pub fn apply(&self, config: &PacingConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let mut state = self.lock();
        state.min_interval = config.min_interval;
        state.max_interval = config.max_interval;
        state.randomized = config.randomized;
        Ok(())
    }

    pub fn state(&self) -> RateState {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, RateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PacingLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacingLimiter")
            .field("state", &self.state())
            .field("has_session", &self.session.is_some())
            .finish_non_exhaustive()
    }
}
