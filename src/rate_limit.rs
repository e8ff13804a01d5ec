//! Per-client sliding-window limits for the write endpoints.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Write endpoints that are limited independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    CreatePost,
    Vote,
    Upload,
}

impl Action {
    fn env_prefix(self) -> &'static str {
        match self {
            Action::CreatePost => "RL_POST",
            Action::Vote => "RL_VOTE",
            Action::Upload => "RL_UPLOAD",
        }
    }
}

/// At most `max_hits` requests in any `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub max_hits: usize,
    pub window: Duration,
}

impl Limit {
    pub const fn per_secs(max_hits: usize, secs: u64) -> Self {
        Self { max_hits, window: Duration::from_secs(secs) }
    }

    /// Reads `<prefix>_LIMIT` and `<prefix>_WINDOW` (seconds).
    fn from_env(prefix: &str, default: Limit) -> Self {
        let read = |suffix: &str| std::env::var(format!("{prefix}_{suffix}")).ok().and_then(|v| v.parse::<u64>().ok());
        Self {
            max_hits: read("LIMIT").map(|n| n as usize).unwrap_or(default.max_hits),
            window: read("WINDOW").map(Duration::from_secs).unwrap_or(default.window),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub create_post: Limit,
    pub vote: Limit,
    pub upload: Limit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            create_post: Limit::per_secs(5, 300),
            vote: Limit::per_secs(120, 60),
            upload: Limit::per_secs(10, 3600),
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            create_post: Limit::from_env(Action::CreatePost.env_prefix(), defaults.create_post),
            vote: Limit::from_env(Action::Vote.env_prefix(), defaults.vote),
            upload: Limit::from_env(Action::Upload.env_prefix(), defaults.upload),
        }
    }

    pub fn limit(&self, action: Action) -> Limit {
        match action {
            Action::CreatePost => self.create_post,
            Action::Vote => self.vote,
            Action::Upload => self.upload,
        }
    }
}

/// Process-local limiter; counters are lost on restart and not shared
/// between replicas.
#[derive(Clone)]
pub struct RateLimiter {
    hits: Arc<DashMap<(Action, String), VecDeque<Instant>>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { hits: Arc::new(DashMap::new()), config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Records the request and returns false once `client` is over its limit.
    pub fn allow(&self, action: Action, client: &str) -> bool {
        self.allow_at(action, client, Instant::now())
    }

    fn allow_at(&self, action: Action, client: &str, now: Instant) -> bool {
        let limit = self.config.limit(action);
        let mut hits = self.hits.entry((action, client.to_owned())).or_default();
        let expired = hits.iter().take_while(|t| now.saturating_duration_since(**t) >= limit.window).count();
        hits.drain(..expired);
        if hits.len() >= limit.max_hits {
            tracing::debug!(?action, client, "rate limited");
            return false;
        }
        hits.push_back(now);
        true
    }
}
