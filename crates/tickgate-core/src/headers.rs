//! Browser-like request identity for outbound provider calls.
//!
//! The pacing limiter calls [`SessionProvider::prepare`] before each paced
//! request. [`BrowserHeaders`] answers that call by lazily building a header
//! set that looks like a desktop browser and rotating its user agent, which
//! makes scraped endpoints less likely to flag the traffic. Fetch functions
//! read the current set through [`BrowserHeaders::headers`].

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

/// Hook invoked before every paced request to refresh the caller's identity.
///
/// Implementations must tolerate repeated calls; the first call initializes.
pub trait SessionProvider: Send + Sync {
    fn prepare(&self);
}

/// Desktop browser user agents the rotation draws from.
pub const USER_AGENTS: [&str; 12] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36 Edg/119.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

const USER_AGENT: &str = "user-agent";

#[derive(Debug)]
struct HeaderState {
    rng: fastrand::Rng,
    headers: Option<BTreeMap<String, String>>,
}

/// Shared browser header set with user-agent rotation.
#[derive(Debug)]
pub struct BrowserHeaders {
    state: Mutex<HeaderState>,
    referer: String,
}

impl Default for BrowserHeaders {
    fn default() -> Self {
        Self::new()
    }
}

impl BrowserHeaders {
    pub fn new() -> Self {
        Self::with_rng(fastrand::Rng::new())
    }

    /// Deterministic rotation order, for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(fastrand::Rng::with_seed(seed))
    }

    fn with_rng(rng: fastrand::Rng) -> Self {
        Self {
            state: Mutex::new(HeaderState { rng, headers: None }),
            referer: String::from("https://www.eastmoney.com/"),
        }
    }

    /// Sets the referer/origin pair used when the header set is first built.
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = referer.into();
        self
    }

    /// Builds the header set if it does not exist yet. Repeated calls are no-ops.
    pub fn init(&self) {
        let mut state = self.lock();
        self.ensure_initialized(&mut state);
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().headers.is_some()
    }

    /// Replaces the user agent with a random entry from [`USER_AGENTS`].
    pub fn rotate_user_agent(&self) {
        let mut state = self.lock();
        let agent = pick_user_agent(&mut state.rng);
        if let Some(headers) = state.headers.as_mut() {
            headers.insert(String::from(USER_AGENT), agent.to_owned());
        }
    }

    /// Overrides or adds a single header. Names are stored lowercase.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        let mut state = self.lock();
        let headers = self.ensure_initialized(&mut state);
        headers.insert(name.into().to_ascii_lowercase(), value.into());
    }

    /// Snapshot of the current header set, initializing it on first use.
    pub fn headers(&self) -> BTreeMap<String, String> {
        let mut state = self.lock();
        self.ensure_initialized(&mut state).clone()
    }

    pub fn user_agent(&self) -> Option<String> {
        self.lock()
            .headers
            .as_ref()
            .and_then(|headers| headers.get(USER_AGENT).cloned())
    }

    fn ensure_initialized<'a>(
        &self,
        state: &'a mut HeaderState,
    ) -> &'a mut BTreeMap<String, String> {
        if state.headers.is_none() {
            let agent = pick_user_agent(&mut state.rng);
            state.headers = Some(self.default_headers(agent));
            info!("browser request headers initialized");
        }
        state.headers.get_or_insert_with(BTreeMap::new)
    }

    fn default_headers(&self, agent: &str) -> BTreeMap<String, String> {
        let origin = self.referer.trim_end_matches('/').to_owned();
        [
            (USER_AGENT, agent),
            (
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
            ("accept-language", "zh-CN,zh;q=0.9,en;q=0.8"),
            ("accept-encoding", "gzip, deflate, br"),
            ("connection", "keep-alive"),
            ("upgrade-insecure-requests", "1"),
            ("sec-fetch-dest", "document"),
            ("sec-fetch-mode", "navigate"),
            ("sec-fetch-site", "none"),
            ("sec-fetch-user", "?1"),
            ("cache-control", "max-age=0"),
            ("referer", self.referer.as_str()),
            ("origin", origin.as_str()),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HeaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionProvider for BrowserHeaders {
    fn prepare(&self) {
        self.init();
        self.rotate_user_agent();
        debug!("user agent rotated");
    }
}

fn pick_user_agent(rng: &mut fastrand::Rng) -> &'static str {
    USER_AGENTS[rng.usize(..USER_AGENTS.len())]
}
