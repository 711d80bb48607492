//! Time and randomness sources used by the governance components.
//!
//! Every component that sleeps or draws a random delay receives its clock and
//! jitter source explicitly, so tests can swap in [`ManualClock`] and
//! [`FixedJitter`] and observe exactly how long the pipeline would have slept.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Monotonic time source with a blocking sleep primitive.
pub trait Clock: Send + Sync {
    /// Returns the current monotonic instant.
    fn now(&self) -> Instant;

    /// Blocks the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by `std::time` and `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

#[derive(Debug)]
struct ManualState {
    origin: Instant,
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

/// Virtual clock for deterministic tests.
///
/// `sleep` returns immediately after advancing virtual time by the requested
/// duration and recording it, so a test can assert on the exact sequence of
/// delays a component asked for. Clones share the same timeline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Moves virtual time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.elapsed += duration;
    }

    /// Virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    /// Every duration passed to [`Clock::sleep`], in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    /// Sum of all recorded sleeps.
    pub fn total_slept(&self) -> Duration {
        self.lock().sleeps.iter().sum()
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.lock();
        state.origin + state.elapsed
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.lock();
        state.elapsed += duration;
        state.sleeps.push(duration);
    }
}

/// Source of uniformly distributed delays.
pub trait Jitter: Send + Sync {
    /// Returns a duration in `[low, high)`. Returns `low` when the range is empty.
    fn between(&self, low: Duration, high: Duration) -> Duration;
}

/// Jitter backed by a thread-local `fastrand` generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn between(&self, low: Duration, high: Duration) -> Duration {
        fraction_of(low, high, fastrand::f64())
    }
}

/// Deterministic jitter that always lands at `fraction` of the way through the range.
///
/// `FixedJitter(0.0)` always yields the lower bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedJitter(pub f64);

impl Jitter for FixedJitter {
    fn between(&self, low: Duration, high: Duration) -> Duration {
        fraction_of(low, high, self.0.clamp(0.0, 1.0))
    }
}

/// `low + (high - low) * fraction`, saturating at `high` for spans too large
/// to scale through `f64`.
fn fraction_of(low: Duration, high: Duration, fraction: f64) -> Duration {
    if high <= low {
        return low;
    }
    let span = high - low;
    let offset = Duration::try_from_secs_f64(span.as_secs_f64() * fraction).unwrap_or(span);
    low.saturating_add(offset.min(span))
}
