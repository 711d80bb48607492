//! # Tickgate Core
//!
//! Request governance for scraping-style market data providers that
//! rate-limit or block aggressive clients.
//!
//! ## Overview
//!
//! Every outbound request passes through one [`Governor`], which combines:
//!
//! - **Pacing** so consecutive upstream calls are spaced by a randomized interval
//! - **Retry** with exponential backoff for transient, anti-scraping failures
//! - **Caching** of results by content-derived key with per-operation TTLs
//! - **Source routing** with failover between equivalent upstream sources
//! - **Browser headers** rotated before each paced request
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | TTL cache, cache keys and cache modes |
//! | [`clock`] | Time and jitter seams (system and manual implementations) |
//! | [`config`] | Configuration file and environment loading |
//! | [`error`] | Core error types |
//! | [`governor`] | The governed request pipeline |
//! | [`headers`] | Browser-like header sets and user-agent rotation |
//! | [`retry`] | Retry policy, error classification and the retrier |
//! | [`routing`] | Per-operation source priority and failure memory |
//! | [`throttling`] | Process-wide pacing limiter |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tickgate_core::{CacheKey, GovernanceConfig, GovernedRequest, Governor};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GovernanceConfig::default().with_env_overrides()?;
//!     let governor: Governor = Governor::new(config)?;
//!
//!     let key = CacheKey::builder("spot").arg("600519")?.build()?;
//!     let request = GovernedRequest::new("spot").cache_key(key);
//!
//!     let quote = governor.execute(&request, |source| {
//!         // Call the upstream named by `source` here.
//!         Ok::<_, String>(serde_json::json!({ "source": source, "price": 1688.0 }))
//!     })?;
//!
//!     println!("{} via {:?}", quote.data, quote.selected_source);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Caller fetch   │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐  hit  ┌──────────────────┐
//! │    Governor     │──────▶│    TTL Cache     │
//! └────────┬────────┘       └──────────────────┘
//!          │ miss
//!          ▼
//! ┌─────────────────┐       ┌──────────────────┐
//! │ Pacing Limiter  │──────▶│ Browser Headers  │
//! └────────┬────────┘       └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐       ┌──────────────────┐
//! │    Retrier      │──────▶│  Source Router   │
//! │ (backoff+jitter)│ fail  │   (failover)     │
//! └─────────────────┘ over  └──────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! All components are `Send + Sync` and internally locked; share a governor
//! with `Arc`. The pacing limiter sleeps while holding its lock, so the
//! spacing between releases holds across threads.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod governor;
pub mod headers;
pub mod retry;
pub mod routing;
pub mod throttling;

// Caching
pub use cache::{CacheConfig, CacheKey, CacheKeyBuilder, CacheMode, TtlCache};

// Time and randomness
pub use clock::{Clock, FixedJitter, Jitter, ManualClock, RandomJitter, SystemClock};

// Configuration
pub use config::GovernanceConfig;

// Error types
pub use error::{ConfigError, CoreError};

// Orchestration
pub use governor::{
    GovernError, Governed, GovernedRequest, Governor, GovernorBuilder, ProbeReport, SourceFailure,
};

// Headers
pub use headers::{BrowserHeaders, SessionProvider, USER_AGENTS};

// Retry logic
pub use retry::{
    ErrorClassifier, KeywordClassifier, Retrier, RetryError, RetryPolicy,
    DEFAULT_RETRYABLE_KEYWORDS,
};

// Routing
pub use routing::{RouterTable, SourceRouter, SourceSnapshot, SourceStatus};

// Pacing
pub use throttling::{PacingConfig, PacingLimiter, RateState};
