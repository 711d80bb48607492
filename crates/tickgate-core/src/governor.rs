//! Governed request pipeline.
//!
//! Every request follows the same sequence:
//!
//! 1. cache lookup (a hit returns immediately, touching nothing else)
//! 2. pacing wait
//! 3. retry-wrapped fetch against the selected source
//! 4. on exhausted retries, fail over to the next untried candidate
//! 5. on success, cache write with the operation's TTL
//!
//! Failover is bounded by the sources already tried in the current request,
//! not only by the router's shared failure memory, so a concurrent
//! `mark_success` or `reset` cannot make one request loop: it makes at most
//! one attempt per distinct configured source.

use std::fmt::Display;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info_span, warn};
use uuid::Uuid;

use crate::cache::{CacheConfig, CacheKey, CacheMode, TtlCache};
use crate::clock::{Clock, Jitter, RandomJitter, SystemClock};
use crate::config::GovernanceConfig;
use crate::error::ConfigError;
use crate::headers::{BrowserHeaders, SessionProvider};
use crate::retry::{ErrorClassifier, Retrier, RetryError};
use crate::routing::SourceRouter;
use crate::throttling::PacingLimiter;

/// Description of one governed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernedRequest {
    operation: String,
    preferred: Option<String>,
    cache_key: Option<CacheKey>,
    ttl: Option<Duration>,
    cache_mode: CacheMode,
}

impl GovernedRequest {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            preferred: None,
            cache_key: None,
            ttl: None,
            cache_mode: CacheMode::Use,
        }
    }

    /// Source to try first. For operations without configured candidates this
    /// is the only source used, and no failover happens.
    pub fn prefer(mut self, source: impl Into<String>) -> Self {
        self.preferred = Some(source.into());
        self
    }

    /// Enables caching under `key`. Requests without a key are never cached.
    pub fn cache_key(mut self, key: CacheKey) -> Self {
        self.cache_key = Some(key);
        self
    }

    /// Overrides the operation's configured TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn preferred(&self) -> Option<&str> {
        self.preferred.as_deref()
    }
}

/// Successful governed call.
#[derive(Debug, Clone)]
pub struct Governed<V> {
    pub data: V,
    /// Source that produced `data`; `None` for cache hits.
    pub selected_source: Option<String>,
    /// Every source attempted, in order.
    pub source_chain: Vec<String>,
    pub from_cache: bool,
    pub request_id: Uuid,
    pub latency_ms: u64,
    pub warnings: Vec<String>,
}

/// Terminal failure of a governed call.
#[derive(Debug, Error)]
pub enum GovernError<E> {
    /// The last relevant upstream failure: non-retryable, or retryable with no
    /// alternate source left to try.
    #[error("operation '{operation}' failed on source '{source_id}': {error}")]
    Upstream {
        operation: String,
        source_id: String,
        source_chain: Vec<String>,
        error: RetryError<E>,
    },
    /// Every candidate source for the operation is currently marked failed.
    #[error("no source available for operation '{operation}'")]
    NoSourceAvailable { operation: String },
}

impl<E> GovernError<E> {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { error, .. } => error.is_retryable(),
            Self::NoSourceAvailable { .. } => false,
        }
    }

    pub fn source_chain(&self) -> &[String] {
        match self {
            Self::Upstream { source_chain, .. } => source_chain,
            Self::NoSourceAvailable { .. } => &[],
        }
    }

    /// The fetch function's own failure, if one occurred.
    pub fn into_upstream(self) -> Option<E> {
        match self {
            Self::Upstream { error, .. } => Some(error.into_inner()),
            Self::NoSourceAvailable { .. } => None,
        }
    }
}

/// A source that failed during a best-effort probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: String,
    pub message: String,
    pub retryable: bool,
}

/// Per-source results of [`Governor::probe_sources`].
#[derive(Debug, Clone)]
pub struct ProbeReport<V> {
    pub operation: String,
    pub successes: Vec<(String, V)>,
    pub failures: Vec<SourceFailure>,
}

impl<V> ProbeReport<V> {
    /// True when every probed source answered.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Result from the highest-priority source that answered.
    pub fn first(&self) -> Option<&V> {
        self.successes.first().map(|(_, value)| value)
    }
}

/// Owns the pacing limiter, retrier, cache and router and runs requests
/// through them.
///
/// Values are cached as `V`; the default is JSON, matching what the
/// provider adapters produce.
pub struct Governor<V = serde_json::Value> {
    limiter: PacingLimiter,
    retrier: Retrier,
    cache: TtlCache<V>,
    router: SourceRouter,
    ttls: RwLock<CacheConfig>,
    headers: Option<Arc<BrowserHeaders>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> Governor<V> {
    /// Production governor: system clock, random jitter, browser headers.
    pub fn new(config: GovernanceConfig) -> Result<Self, ConfigError> {
        GovernorBuilder::new(config).build()
    }

    /// Runs `fetch` through the governed pipeline. `fetch` receives the
    /// source identifier to call.
    pub fn execute<E, F>(
        &self,
        request: &GovernedRequest,
        mut fetch: F,
    ) -> Result<Governed<V>, GovernError<E>>
    where
        F: FnMut(&str) -> Result<V, E>,
        E: Display,
    {
        let started = self.clock.now();
        let request_id = Uuid::new_v4();
        let operation = request.operation.as_str();
        let span = info_span!("governed_request", operation, request_id = %request_id);
        let _entered = span.enter();

        let cache_key = request.cache_key.as_ref();
        if let Some(data) = self.cached(request) {
            return Ok(Governed {
                data,
                selected_source: None,
                source_chain: Vec::new(),
                from_cache: true,
                request_id,
                latency_ms: self.elapsed_ms(started),
                warnings: Vec::new(),
            });
        }

        let routed = self.router.is_routed(operation);
        let first = if routed {
            self.router.get_source(operation, request.preferred())
        } else {
            request.preferred().map(str::to_owned)
        };
        let Some(mut source) = first else {
            warn!("no source available");
            return Err(GovernError::NoSourceAvailable {
                operation: operation.to_owned(),
            });
        };

        let mut source_chain = Vec::new();
        let mut warnings = Vec::new();

        loop {
            source_chain.push(source.clone());
            self.limiter.wait();
            debug!(source = %source, "fetching upstream");

            let error = match self.retrier.execute(|| fetch(&source)) {
                Ok(data) => {
                    if let Some(key) = cache_key.filter(|_| request.cache_mode.writes()) {
                        let ttl = request.ttl.unwrap_or_else(|| self.ttl_for(operation));
                        self.cache.set(key.as_str(), data.clone(), ttl);
                    }
                    if source_chain.len() > 1 {
                        warnings.push(format!(
                            "source fallback succeeded with '{}' after {} failed attempt(s)",
                            source,
                            source_chain.len() - 1
                        ));
                    }
                    return Ok(Governed {
                        data,
                        selected_source: Some(source),
                        source_chain,
                        from_cache: false,
                        request_id,
                        latency_ms: self.elapsed_ms(started),
                        warnings,
                    });
                }
                Err(error) => error,
            };

            let alternate = if routed && error.is_retryable() {
                self.router.next_source(operation, None, &source_chain)
            } else {
                None
            };
            let Some(next) = alternate else {
                return Err(GovernError::Upstream {
                    operation: operation.to_owned(),
                    source_id: source,
                    source_chain,
                    error,
                });
            };

            self.router.mark_failed(operation, &source);
            warn!(failed = %source, next = %next, error = %error, "failing over to alternate source");
            warnings.push(format!("source '{source}' failed: {error}"));

            // Another caller may have filled the entry while this one was retrying.
            if let Some(data) = self.cached(request) {
                debug!("cache filled during failover");
                return Ok(Governed {
                    data,
                    selected_source: None,
                    source_chain,
                    from_cache: true,
                    request_id,
                    latency_ms: self.elapsed_ms(started),
                    warnings,
                });
            }
            source = next;
        }
    }

    /// Probes every available candidate for `operation` through pacing and
    /// retry, without cache or failover. Failures are collected, not raised,
    /// and do not touch the router's failure memory.
    pub fn probe_sources<E, F>(&self, operation: &str, mut fetch: F) -> ProbeReport<V>
    where
        F: FnMut(&str) -> Result<V, E>,
        E: Display,
    {
        let span = info_span!("probe_sources", operation);
        let _entered = span.enter();
        let mut report = ProbeReport {
            operation: operation.to_owned(),
            successes: Vec::new(),
            failures: Vec::new(),
        };

        for source in self.router.available_sources(operation) {
            self.limiter.wait();
            match self.retrier.execute(|| fetch(&source)) {
                Ok(value) => report.successes.push((source, value)),
                Err(error) => {
                    debug!(source = %source, error = %error, "probe failed");
                    report.failures.push(SourceFailure {
                        retryable: error.is_retryable(),
                        message: error.into_inner().to_string(),
                        source,
                    });
                }
            }
        }

        report
    }

    /// Applies a complete configuration. Nothing changes if it is invalid.
    pub fn reconfigure(&self, config: &GovernanceConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.limiter.apply(&config.pacing)?;
        self.retrier.set_policy(config.retry.clone())?;
        *self.ttls.write().unwrap_or_else(PoisonError::into_inner) = config.cache.clone();
        self.router.set_sources(config.sources.clone());
        Ok(())
    }

    pub fn ttl_for(&self, operation: &str) -> Duration {
        self.ttls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ttl_for(operation)
    }

    pub fn limiter(&self) -> &PacingLimiter {
        &self.limiter
    }

    pub fn retrier(&self) -> &Retrier {
        &self.retrier
    }

    pub fn cache(&self) -> &TtlCache<V> {
        &self.cache
    }

    pub fn router(&self) -> &SourceRouter {
        &self.router
    }

    /// Browser header set rotated before each paced request, for fetch
    /// functions to attach to their HTTP calls.
    pub fn headers(&self) -> Option<&Arc<BrowserHeaders>> {
        self.headers.as_ref()
    }

    fn cached(&self, request: &GovernedRequest) -> Option<V> {
        let key = request.cache_key.as_ref().filter(|_| request.cache_mode.reads())?;
        self.cache.get(key.as_str())
    }

    fn elapsed_ms(&self, started: Instant) -> u64 {
        let elapsed = self.clock.now().saturating_duration_since(started);
        elapsed.as_millis().min(u128::from(u64::MAX)) as u64
    }
}

impl<V> std::fmt::Debug for Governor<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("limiter", &self.limiter)
            .field("retrier", &self.retrier)
            .field("cache", &self.cache)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Governor`] with injectable time, randomness, error
/// classification and session handling.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tickgate_core::{FixedJitter, GovernanceConfig, Governor, GovernorBuilder, ManualClock};
///
/// let clock = ManualClock::new();
/// let governor: Governor = GovernorBuilder::new(GovernanceConfig::default())
///     .clock(Arc::new(clock.clone()))
///     .jitter(Arc::new(FixedJitter(0.0)))
///     .without_session()
///     .build()
///     .expect("default config is valid");
/// assert!(governor.headers().is_none());
/// ```
pub struct GovernorBuilder {
    config: GovernanceConfig,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
    classifier: Option<Arc<dyn ErrorClassifier>>,
    headers: Option<Arc<BrowserHeaders>>,
    session: Option<Arc<dyn SessionProvider>>,
    use_session: bool,
}

impl GovernorBuilder {
    pub fn new(config: GovernanceConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            jitter: Arc::new(RandomJitter),
            classifier: None,
            headers: None,
            session: None,
            use_session: true,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Uses a caller-owned header set as the session provider.
    pub fn browser_headers(mut self, headers: Arc<BrowserHeaders>) -> Self {
        self.headers = Some(headers);
        self.use_session = true;
        self
    }

    /// Uses a custom session provider instead of browser headers.
    pub fn session(mut self, session: Arc<dyn SessionProvider>) -> Self {
        self.session = Some(session);
        self.use_session = true;
        self
    }

    /// No identity hook before paced requests.
    pub fn without_session(mut self) -> Self {
        self.headers = None;
        self.session = None;
        self.use_session = false;
        self
    }

    pub fn build<V: Clone>(self) -> Result<Governor<V>, ConfigError> {
        self.config.validate()?;

        let headers = match (&self.headers, &self.session) {
            (Some(headers), _) => Some(Arc::clone(headers)),
            (None, None) if self.use_session => Some(Arc::new(BrowserHeaders::new())),
            _ => None,
        };
        let session: Option<Arc<dyn SessionProvider>> = match self.session {
            Some(session) => Some(session),
            None => headers
                .clone()
                .map(|headers| headers as Arc<dyn SessionProvider>),
        };

        let mut limiter = PacingLimiter::with_clock(
            &self.config.pacing,
            Arc::clone(&self.clock),
            Arc::clone(&self.jitter),
        );
        if let Some(session) = session {
            limiter = limiter.with_session(session);
        }

        let mut retrier = Retrier::with_clock(
            self.config.retry.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.jitter),
        );
        if let Some(classifier) = self.classifier {
            retrier = retrier.with_classifier(classifier);
        }

        Ok(Governor {
            limiter,
            retrier,
            cache: TtlCache::with_clock(Arc::clone(&self.clock)),
            router: SourceRouter::new(self.config.sources.clone()),
            ttls: RwLock::new(self.config.cache.clone()),
            headers,
            clock: self.clock,
        })
    }
}
