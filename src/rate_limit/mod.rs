//! Tiered request rate limiting.
//!
//! Fixed-window counters per (tier, principal, minute). The principal is the
//! authenticated user when present, otherwise the remote address. A denied
//! request never increments its counter.

#[cfg(feature = "redis-backend")]
pub mod redis;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Serialize;

use crate::config::Settings;

/// TTL on counter keys; two windows so a straggling read still sees them.
const COUNTER_TTL: Duration = Duration::from_secs(120);

/// Named rate limit budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Critical,
    Export,
    Search,
    Standard,
    Readonly,
    Health,
}

impl Tier {
    pub const ALL: [Tier; 6] = [
        Tier::Critical,
        Tier::Export,
        Tier::Search,
        Tier::Standard,
        Tier::Readonly,
        Tier::Health,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Export => "export",
            Self::Search => "search",
            Self::Standard => "standard",
            Self::Readonly => "readonly",
            Self::Health => "health",
        }
    }

    pub fn limit(&self, settings: &Settings) -> u32 {
        match self {
            Self::Critical => settings.rate_limit_critical,
            Self::Export => settings.rate_limit_export,
            Self::Search => settings.rate_limit_search,
            Self::Standard => settings.rate_limit_default,
            Self::Readonly => settings.rate_limit_readonly,
            Self::Health => settings.rate_limit_health,
        }
    }

    /// Window name, parsed into Retry-After seconds.
    pub fn window(&self) -> &'static str {
        "minute"
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Critical => "Mutating job and recovery operations",
            Self::Export => "Export generation",
            Self::Search => "Search queries",
            Self::Standard => "General API traffic",
            Self::Readonly => "Read-only listings and lookups",
            Self::Health => "Health and liveness probes",
        }
    }

    /// Tier for a request path. Mutations on jobs are critical; reads are
    /// readonly; probes are health; everything else standard.
    pub fn for_request(method: &axum::http::Method, path: &str) -> Tier {
        if path == "/health" {
            return Tier::Health;
        }
        if path.starts_with("/search") {
            return Tier::Search;
        }
        if path.starts_with("/export") {
            return Tier::Export;
        }
        if *method == axum::http::Method::GET {
            return Tier::Readonly;
        }
        if path.starts_with("/jobs") {
            return Tier::Critical;
        }
        Tier::Standard
    }
}

/// Seconds until a tier's window rolls over: minute -> 60, hour -> 3600,
/// second -> 1, anything else 60.
pub fn parse_retry_after(window: &str) -> u64 {
    if window.contains("minute") {
        60
    } else if window.contains("hour") {
        3600
    } else if window.contains("second") {
        1
    } else {
        60
    }
}

/// The rate-limit principal: authenticated user id when present, otherwise
/// the client address (honouring the configured forwarded-for header).
pub fn extract_key(
    user_id: Option<&str>,
    headers: &HeaderMap,
    remote_addr: Option<&str>,
    forwarded_for_header: &str,
) -> String {
    if let Some(user_id) = user_id {
        if !user_id.is_empty() {
            return format!("user:{user_id}");
        }
    }
    if let Some(forwarded) = headers
        .get(forwarded_for_header)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    remote_addr.unwrap_or("unknown").to_string()
}

/// Verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow {
        limit: u32,
        remaining: u32,
    },
    Deny {
        limit: u32,
        /// Epoch seconds when the window resets.
        reset_at: i64,
        retry_after_secs: u64,
    },
}

/// Fixed-window counter storage.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    async fn get(&self, key: &str) -> u64;
    /// Increment and return the new value; sets the TTL on first write.
    async fn incr(&self, key: &str, ttl: Duration) -> u64;
}

#[async_trait]
impl<T: CounterBackend> CounterBackend for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> u64 {
        (**self).get(key).await
    }

    async fn incr(&self, key: &str, ttl: Duration) -> u64 {
        (**self).incr(key, ttl).await
    }
}

/// In-process counters with lazy expiry.
pub struct MemoryCounters {
    counters: Mutex<HashMap<String, (u64, std::time::Instant)>>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterBackend for MemoryCounters {
    async fn get(&self, key: &str) -> u64 {
        let counters = self.counters.lock().expect("counter lock poisoned");
        counters
            .get(key)
            .filter(|(_, expires)| std::time::Instant::now() < *expires)
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> u64 {
        let mut counters = self.counters.lock().expect("counter lock poisoned");
        let now = std::time::Instant::now();
        if counters.len() > 4096 {
            counters.retain(|_, (_, expires)| now < *expires);
        }
        let entry = counters
            .entry(key.to_string())
            .and_modify(|(count, expires)| {
                if now >= *expires {
                    *count = 0;
                    *expires = now + ttl;
                }
            })
            .or_insert((0, now + ttl));
        entry.0 += 1;
        entry.0
    }
}

/// Per-tier status entry for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TierStatus {
    pub limit: u32,
    pub window: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub key: String,
    pub tiers: HashMap<&'static str, TierStatus>,
    pub storage: &'static str,
}

pub struct RateLimiter {
    backend: Box<dyn CounterBackend>,
    settings: std::sync::Arc<Settings>,
    storage_name: &'static str,
}

impl RateLimiter {
    pub fn new(
        backend: Box<dyn CounterBackend>,
        settings: std::sync::Arc<Settings>,
        storage_name: &'static str,
    ) -> Self {
        Self {
            backend,
            settings,
            storage_name,
        }
    }

    fn counter_key(tier: Tier, key: &str, minute_epoch: i64) -> String {
        format!("ratelimit:{}:{}:{}", tier.as_str(), key, minute_epoch)
    }

    /// Decide one request. Disabled limiting always allows with a full
    /// window.
    pub async fn check(&self, key: &str, tier: Tier) -> Decision {
        let limit = tier.limit(&self.settings);
        if !self.settings.rate_limit_enabled {
            return Decision::Allow {
                limit,
                remaining: limit,
            };
        }

        let now = Utc::now().timestamp();
        let minute_epoch = now / 60;
        let counter_key = Self::counter_key(tier, key, minute_epoch);

        let current = self.backend.get(&counter_key).await;
        if current >= limit as u64 {
            return Decision::Deny {
                limit,
                reset_at: (minute_epoch + 1) * 60,
                retry_after_secs: parse_retry_after(tier.window()),
            };
        }

        let count = self.backend.incr(&counter_key, COUNTER_TTL).await;
        Decision::Allow {
            limit,
            remaining: (limit as u64).saturating_sub(count) as u32,
        }
    }

    pub fn status(&self, key: &str) -> RateLimitStatus {
        let tiers = Tier::ALL
            .iter()
            .map(|tier| {
                (
                    tier.as_str(),
                    TierStatus {
                        limit: tier.limit(&self.settings),
                        window: tier.window(),
                        description: tier.description(),
                    },
                )
            })
            .collect();
        RateLimitStatus {
            key: key.to_string(),
            tiers,
            storage: self.storage_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            Box::new(MemoryCounters::new()),
            Arc::new(Settings::default()),
            "memory",
        )
    }

    #[test]
    fn test_tier_limits_match_configuration() {
        let settings = Settings::default();
        assert_eq!(Tier::Critical.limit(&settings), 30);
        assert_eq!(Tier::Export.limit(&settings), 20);
        assert_eq!(Tier::Search.limit(&settings), 60);
        assert_eq!(Tier::Standard.limit(&settings), 100);
        assert_eq!(Tier::Readonly.limit(&settings), 120);
        assert_eq!(Tier::Health.limit(&settings), 300);
        assert!(Tier::ALL.iter().all(|t| t.window() == "minute"));
    }

    #[test]
    fn test_retry_after_parsing() {
        assert_eq!(parse_retry_after("minute"), 60);
        assert_eq!(parse_retry_after("per 1 hour"), 3600);
        assert_eq!(parse_retry_after("second"), 1);
        assert_eq!(parse_retry_after("fortnight"), 60);
    }

    #[test]
    fn test_key_prefers_user_then_forwarded_then_addr() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            extract_key(Some("user-123-abc"), &headers, Some("1.2.3.4"), "x-forwarded-for"),
            "user:user-123-abc"
        );

        headers.insert("x-forwarded-for", "10.0.0.9, 172.16.0.1".parse().unwrap());
        assert_eq!(
            extract_key(None, &headers, Some("1.2.3.4"), "x-forwarded-for"),
            "10.0.0.9"
        );

        let empty = HeaderMap::new();
        assert_eq!(
            extract_key(None, &empty, Some("192.168.1.100"), "x-forwarded-for"),
            "192.168.1.100"
        );
    }

    #[tokio::test]
    async fn test_thirty_first_critical_request_denied() {
        let limiter = limiter();
        for i in 0..30 {
            match limiter.check("user:x", Tier::Critical).await {
                Decision::Allow { remaining, .. } => {
                    assert_eq!(remaining, 29 - i);
                }
                Decision::Deny { .. } => panic!("request {i} should be allowed"),
            }
        }

        match limiter.check("user:x", Tier::Critical).await {
            Decision::Deny {
                limit,
                retry_after_secs,
                reset_at,
            } => {
                assert_eq!(limit, 30);
                assert_eq!(retry_after_secs, 60);
                assert!(reset_at > Utc::now().timestamp());
            }
            Decision::Allow { .. } => panic!("31st request must be denied"),
        }
    }

    #[tokio::test]
    async fn test_denied_request_does_not_consume() {
        let counters = Arc::new(MemoryCounters::new());
        let limiter = RateLimiter::new(
            Box::new(counters.clone()),
            Arc::new(Settings::default()),
            "memory",
        );
        for _ in 0..30 {
            limiter.check("user:x", Tier::Critical).await;
        }

        let minute = Utc::now().timestamp() / 60;
        let counter_key = RateLimiter::counter_key(Tier::Critical, "user:x", minute);
        assert_eq!(counters.get(&counter_key).await, 30);

        assert!(matches!(
            limiter.check("user:x", Tier::Critical).await,
            Decision::Deny { .. }
        ));
        assert!(matches!(
            limiter.check("user:x", Tier::Critical).await,
            Decision::Deny { .. }
        ));
        // Rejected calls left the window untouched.
        assert_eq!(counters.get(&counter_key).await, 30);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter();
        for _ in 0..30 {
            limiter.check("user:a", Tier::Critical).await;
        }
        assert!(matches!(
            limiter.check("user:a", Tier::Critical).await,
            Decision::Deny { .. }
        ));
        assert!(matches!(
            limiter.check("user:b", Tier::Critical).await,
            Decision::Allow { .. }
        ));
        // Same key on another tier has its own budget.
        assert!(matches!(
            limiter.check("user:a", Tier::Standard).await,
            Decision::Allow { .. }
        ));
    }

    #[test]
    fn test_status_lists_all_tiers() {
        let limiter = limiter();
        let status = limiter.status("user:user-456");
        assert_eq!(status.key, "user:user-456");
        assert_eq!(status.storage, "memory");
        for tier in Tier::ALL {
            let entry = status.tiers.get(tier.as_str()).expect(tier.as_str());
            assert!(entry.limit > 0);
            assert_eq!(entry.window, "minute");
            assert!(!entry.description.is_empty());
        }
    }

    #[test]
    fn test_tier_routing() {
        use axum::http::Method;
        assert_eq!(Tier::for_request(&Method::GET, "/health"), Tier::Health);
        assert_eq!(Tier::for_request(&Method::GET, "/jobs"), Tier::Readonly);
        assert_eq!(
            Tier::for_request(&Method::POST, "/jobs/abc/retry"),
            Tier::Critical
        );
        assert_eq!(Tier::for_request(&Method::GET, "/search/q"), Tier::Search);
        assert_eq!(Tier::for_request(&Method::POST, "/export/x"), Tier::Export);
        assert_eq!(Tier::for_request(&Method::POST, "/other"), Tier::Standard);
    }
}
