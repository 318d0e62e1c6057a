//! Processing-time ETA estimation.
//!
//! A rolling window of `page_count:time_ms` completion samples feeds a
//! page-weighted average; the prediction is a confidence-banded range, not a
//! point estimate. The window lives in a hot store shared by all workers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Hot-store keys, shared with the redis backend.
pub const HISTORY_KEY: &str = "metrics:processing_time:history";
pub const AVG_KEY: &str = "metrics:processing_time:avg";
/// Cached average TTL.
pub const AVG_TTL: Duration = Duration::from_secs(60);

/// Confidence bands derived from sample count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// ETA prediction range in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtaResult {
    pub min_seconds: u64,
    pub max_seconds: u64,
    pub best_guess_seconds: u64,
    pub confidence: Confidence,
    /// The inputs behind the numbers, for display and debugging.
    pub factors: serde_json::Value,
}

/// A pending document as the estimator sees it.
#[derive(Debug, Clone)]
pub struct PendingDoc {
    pub page_count: u32,
}

/// Rolling-window metrics storage. Entries are `"page_count:time_ms"`,
/// newest first, bounded by the window size.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn push_history(&self, entry: &str, window: usize);
    async fn history(&self, window: usize) -> Vec<String>;
    async fn cached_avg(&self) -> Option<String>;
    async fn set_cached_avg(&self, value: &str, ttl: Duration);
    async fn invalidate_avg(&self);
}

/// In-process metrics backend: a bounded deque plus a TTL'd average slot.
pub struct MemoryMetrics {
    history: Mutex<VecDeque<String>>,
    avg: Mutex<Option<(String, Instant)>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(VecDeque::new()),
            avg: Mutex::new(None),
        }
    }
}

impl Default for MemoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsBackend for MemoryMetrics {
    async fn push_history(&self, entry: &str, window: usize) {
        let mut history = self.history.lock().expect("metrics lock poisoned");
        history.push_front(entry.to_string());
        history.truncate(window);
    }

    async fn history(&self, window: usize) -> Vec<String> {
        let history = self.history.lock().expect("metrics lock poisoned");
        history.iter().take(window).cloned().collect()
    }

    async fn cached_avg(&self) -> Option<String> {
        let avg = self.avg.lock().expect("metrics lock poisoned");
        avg.as_ref().and_then(|(value, expires)| {
            if Instant::now() < *expires {
                Some(value.clone())
            } else {
                None
            }
        })
    }

    async fn set_cached_avg(&self, value: &str, ttl: Duration) {
        let mut avg = self.avg.lock().expect("metrics lock poisoned");
        *avg = Some((value.to_string(), Instant::now() + ttl));
    }

    async fn invalidate_avg(&self) {
        let mut avg = self.avg.lock().expect("metrics lock poisoned");
        *avg = None;
    }
}

/// Source of the live worker count used for parallelism adjustment.
#[async_trait]
pub trait WorkerCountProvider: Send + Sync {
    /// None when the pool cannot be observed.
    async fn active_workers(&self) -> Option<usize>;
}

/// Fixed worker count (tests, single-process deployments).
pub struct FixedWorkerCount(pub usize);

#[async_trait]
impl WorkerCountProvider for FixedWorkerCount {
    async fn active_workers(&self) -> Option<usize> {
        Some(self.0)
    }
}

pub struct EtaEstimator {
    backend: Box<dyn MetricsBackend>,
    workers: Box<dyn WorkerCountProvider>,
    window: usize,
    fallback_sec_per_page: f64,
    min_high_confidence_samples: usize,
}

impl EtaEstimator {
    pub fn new(
        backend: Box<dyn MetricsBackend>,
        workers: Box<dyn WorkerCountProvider>,
        window: usize,
        fallback_sec_per_page: f64,
        min_high_confidence_samples: usize,
    ) -> Self {
        Self {
            backend,
            workers,
            window: window.max(1),
            fallback_sec_per_page,
            min_high_confidence_samples,
        }
    }

    /// Record a completion sample and invalidate the cached average.
    pub async fn record_completion(&self, page_count: u32, processing_time_ms: u64) {
        if page_count == 0 || processing_time_ms == 0 {
            warn!(page_count, processing_time_ms, "eta sample ignored");
            return;
        }
        let entry = format!("{page_count}:{processing_time_ms}");
        self.backend.push_history(&entry, self.window).await;
        self.backend.invalidate_avg().await;
        debug!(
            page_count,
            processing_time_ms,
            sec_per_page = processing_time_ms as f64 / 1000.0 / page_count as f64,
            "eta completion recorded"
        );
    }

    /// Page-weighted average seconds per page and the sample count behind it.
    pub async fn weighted_avg(&self) -> (f64, usize) {
        if let Some(cached) = self.backend.cached_avg().await {
            if let Some((avg, count)) = cached.split_once(':') {
                if let (Ok(avg), Ok(count)) = (avg.parse(), count.parse()) {
                    return (avg, count);
                }
            }
        }

        let history = self.backend.history(self.window).await;
        if history.is_empty() {
            return (self.fallback_sec_per_page, 0);
        }

        let mut total_pages = 0u64;
        let mut total_time_ms = 0u64;
        let mut samples = 0usize;
        for entry in &history {
            if let Some((pages, time_ms)) = entry.split_once(':') {
                if let (Ok(pages), Ok(time_ms)) = (pages.parse::<u64>(), time_ms.parse::<u64>()) {
                    total_pages += pages;
                    total_time_ms += time_ms;
                    samples += 1;
                }
            }
        }
        if total_pages == 0 {
            return (self.fallback_sec_per_page, samples);
        }

        let avg = (total_time_ms as f64 / 1000.0) / total_pages as f64;
        self.backend
            .set_cached_avg(&format!("{avg}:{samples}"), AVG_TTL)
            .await;
        (avg, samples)
    }

    /// Confidence-banded ETA for a matter's pending documents.
    pub async fn processing_eta(&self, matter_id: &str, pending: &[PendingDoc]) -> EtaResult {
        let total_pages: u64 = pending.iter().map(|d| d.page_count as u64).sum();
        if total_pages == 0 {
            return EtaResult {
                min_seconds: 0,
                max_seconds: 0,
                best_guess_seconds: 0,
                confidence: Confidence::High,
                factors: serde_json::json!({ "reason": "no_pending_docs" }),
            };
        }

        let (avg_sec_per_page, sample_count) = self.weighted_avg().await;
        let worker_count = self.workers.active_workers().await.unwrap_or(2).max(1);

        let (confidence, variance_factor) = if sample_count >= self.min_high_confidence_samples {
            (Confidence::High, 1.3)
        } else if sample_count >= 5 {
            (Confidence::Medium, 1.5)
        } else {
            (Confidence::Low, 2.0)
        };

        let base_seconds = total_pages as f64 * avg_sec_per_page / worker_count as f64;
        let min_seconds = ((base_seconds / variance_factor) as u64).max(30);
        let best_guess_seconds = (base_seconds as u64).max(min_seconds);
        let max_seconds = ((base_seconds * variance_factor) as u64).max(best_guess_seconds);

        debug!(
            matter_id,
            total_pages,
            worker_count,
            sample_count,
            avg_sec_per_page,
            "eta calculated"
        );

        EtaResult {
            min_seconds,
            max_seconds,
            best_guess_seconds,
            confidence,
            factors: serde_json::json!({
                "total_pages": total_pages,
                "pending_docs": pending.len(),
                "avg_seconds_per_page": (avg_sec_per_page * 100.0).round() / 100.0,
                "worker_count": worker_count,
                "sample_count": sample_count,
            }),
        }
    }
}

#[cfg(feature = "redis-backend")]
pub mod redis_backend {
    //! Redis-backed metrics window shared across worker processes.

    use super::{MetricsBackend, HISTORY_KEY, AVG_KEY};
    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;
    use std::time::Duration;
    use tracing::warn;

    pub struct RedisMetrics {
        conn: ConnectionManager,
    }

    impl RedisMetrics {
        pub async fn new(redis_url: &str) -> anyhow::Result<Self> {
            let client = redis::Client::open(redis_url)?;
            let conn = ConnectionManager::new(client).await?;
            Ok(Self { conn })
        }
    }

    #[async_trait]
    impl MetricsBackend for RedisMetrics {
        async fn push_history(&self, entry: &str, window: usize) {
            let mut conn = self.conn.clone();
            let result: redis::RedisResult<()> = redis::pipe()
                .lpush(HISTORY_KEY, entry)
                .ltrim(HISTORY_KEY, 0, window as isize - 1)
                .query_async(&mut conn)
                .await;
            if let Err(e) = result {
                warn!(error = %e, "metrics history push failed");
            }
        }

        async fn history(&self, window: usize) -> Vec<String> {
            let mut conn = self.conn.clone();
            conn.lrange(HISTORY_KEY, 0, window as isize - 1)
                .await
                .unwrap_or_default()
        }

        async fn cached_avg(&self) -> Option<String> {
            let mut conn = self.conn.clone();
            conn.get(AVG_KEY).await.ok()
        }

        async fn set_cached_avg(&self, value: &str, ttl: Duration) {
            let mut conn = self.conn.clone();
            let result: redis::RedisResult<()> =
                conn.set_ex(AVG_KEY, value, ttl.as_secs()).await;
            if let Err(e) = result {
                warn!(error = %e, "metrics avg cache failed");
            }
        }

        async fn invalidate_avg(&self) {
            let mut conn = self.conn.clone();
            let result: redis::RedisResult<()> = conn.del(AVG_KEY).await;
            if let Err(e) = result {
                warn!(error = %e, "metrics avg invalidation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator(workers: usize) -> EtaEstimator {
        EtaEstimator::new(
            Box::new(MemoryMetrics::new()),
            Box::new(FixedWorkerCount(workers)),
            100,
            3.0,
            10,
        )
    }

    #[tokio::test]
    async fn test_zero_pages_high_confidence_zeroes() {
        let eta = estimator(2);
        for pending in [vec![], vec![PendingDoc { page_count: 0 }]] {
            let result = eta.processing_eta("m", &pending).await;
            assert_eq!(result.min_seconds, 0);
            assert_eq!(result.max_seconds, 0);
            assert_eq!(result.best_guess_seconds, 0);
            assert_eq!(result.confidence, Confidence::High);
        }
    }

    #[tokio::test]
    async fn test_no_history_uses_fallback_low_confidence() {
        let eta = estimator(1);
        let result = eta
            .processing_eta("m", &[PendingDoc { page_count: 10 }])
            .await;
        assert_eq!(result.confidence, Confidence::Low);
        // 10 pages * 3 s/page / 1 worker = 30s base.
        assert_eq!(result.best_guess_seconds, 30);
        assert_eq!(result.max_seconds, 60);
    }

    #[tokio::test]
    async fn test_twenty_samples_three_workers_fifty_pages() {
        let eta = estimator(3);
        // 20 samples averaging 4s/page.
        for _ in 0..20 {
            eta.record_completion(10, 40_000).await;
        }
        let result = eta
            .processing_eta("m", &[PendingDoc { page_count: 50 }])
            .await;

        assert_eq!(result.confidence, Confidence::High);
        // base = 50 * 4 / 3 = 66.67s
        assert!((result.best_guess_seconds as i64 - 66).abs() <= 1);
        assert!((result.min_seconds as i64 - 51).abs() <= 1);
        assert!((result.max_seconds as i64 - 86).abs() <= 1);
        assert_eq!(result.factors["sample_count"], 20);
        assert_eq!(result.factors["worker_count"], 3);
    }

    #[tokio::test]
    async fn test_record_invalidates_cached_avg() {
        let eta = estimator(1);
        eta.record_completion(10, 20_000).await; // 2 s/page
        let (avg, n) = eta.weighted_avg().await;
        assert!((avg - 2.0).abs() < 1e-9);
        assert_eq!(n, 1);

        // New sample changes the weighted average immediately.
        eta.record_completion(10, 60_000).await; // window now 2s and 6s per page
        let (avg, n) = eta.weighted_avg().await;
        assert!((avg - 4.0).abs() < 1e-9);
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn test_window_bounded() {
        let backend = MemoryMetrics::new();
        for i in 0..150 {
            backend.push_history(&format!("1:{i}"), 100).await;
        }
        let history = backend.history(100).await;
        assert_eq!(history.len(), 100);
        // Newest first.
        assert_eq!(history[0], "1:149");
    }

    #[tokio::test]
    async fn test_minimum_floor_thirty_seconds() {
        let eta = estimator(8);
        eta.record_completion(100, 1_000).await; // extremely fast: 0.01 s/page
        let result = eta
            .processing_eta("m", &[PendingDoc { page_count: 1 }])
            .await;
        assert_eq!(result.min_seconds, 30);
        assert!(result.best_guess_seconds >= 30);
        assert!(result.max_seconds >= result.best_guess_seconds);
    }
}
