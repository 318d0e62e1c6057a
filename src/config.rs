//! Runtime configuration loaded from the environment.
//!
//! Every knob has a compiled default; deployment overrides come from
//! environment variables (a `.env` file is honoured via dotenvy in main).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default page-range size for OCR chunking.
pub const DEFAULT_PAGE_CHUNK_SIZE: u32 = 25;

/// Settings for the job engine, server, and sweepers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// SQLite database path.
    pub database_path: PathBuf,
    /// Root directory for blob storage (the filesystem blob backend).
    pub blob_dir: PathBuf,

    // Job recovery
    /// Minutes a PROCESSING job may go without heartbeat before recovery.
    pub job_stale_timeout_minutes: i64,
    /// Maximum automatic recovery attempts before a job is failed.
    pub job_max_recovery_retries: u32,
    /// Master switch for the stale-job sweeper.
    pub job_recovery_enabled: bool,
    /// Minutes a QUEUED job may sit before the redispatcher picks it up.
    pub stuck_queued_timeout_minutes: i64,
    /// Minutes of staleness before the drift reconciler inspects a job.
    pub drift_timeout_minutes: i64,

    // OCR chunking
    /// Hours completed chunk artifacts are retained before GC.
    pub chunk_retention_hours: i64,
    /// Pages per OCR chunk.
    pub page_chunk_size: u32,
    /// Documents at or below this page count skip chunk fan-out.
    pub ocr_fanout_threshold_pages: u32,
    /// Soft wall-clock budget for one external OCR call.
    pub ocr_timeout_soft: Duration,
    /// Hard wall-clock budget for one external OCR call.
    pub ocr_timeout_hard: Duration,

    // Pipeline retry policy
    /// Max retries per job before FAILED.
    pub job_max_retries: u32,
    /// Backoff base for stage re-dispatch.
    pub retry_backoff_base: Duration,
    /// Backoff ceiling for stage re-dispatch.
    pub retry_backoff_max: Duration,
    /// Worker heartbeat cadence while a stage runs.
    pub heartbeat_interval: Duration,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_critical: u32,
    pub rate_limit_export: u32,
    pub rate_limit_search: u32,
    pub rate_limit_default: u32,
    pub rate_limit_readonly: u32,
    pub rate_limit_health: u32,
    /// Header consulted for the client address behind a proxy.
    pub forwarded_for_header: String,

    // ETA estimation
    pub eta_window_size: usize,
    pub eta_fallback_sec_per_page: f64,
    pub eta_min_high_confidence_samples: usize,

    /// Worker pool size for the `worker` command.
    pub worker_count: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("lexpipe.db"),
            blob_dir: PathBuf::from("blobs"),
            job_stale_timeout_minutes: 30,
            job_max_recovery_retries: 3,
            job_recovery_enabled: true,
            stuck_queued_timeout_minutes: 10,
            drift_timeout_minutes: 30,
            chunk_retention_hours: 24,
            page_chunk_size: DEFAULT_PAGE_CHUNK_SIZE,
            ocr_fanout_threshold_pages: DEFAULT_PAGE_CHUNK_SIZE,
            ocr_timeout_soft: Duration::from_secs(25 * 60),
            ocr_timeout_hard: Duration::from_secs(30 * 60),
            job_max_retries: 3,
            retry_backoff_base: Duration::from_secs(5),
            retry_backoff_max: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(30),
            rate_limit_enabled: true,
            rate_limit_critical: 30,
            rate_limit_export: 20,
            rate_limit_search: 60,
            rate_limit_default: 100,
            rate_limit_readonly: 120,
            rate_limit_health: 300,
            forwarded_for_header: "x-forwarded-for".to_string(),
            eta_window_size: 100,
            eta_fallback_sec_per_page: 3.0,
            eta_min_high_confidence_samples: 10,
            worker_count: 2,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            database_path: env_parse("LEXPIPE_DATABASE_PATH", d.database_path),
            blob_dir: env_parse("LEXPIPE_BLOB_DIR", d.blob_dir),
            job_stale_timeout_minutes: env_parse(
                "JOB_STALE_TIMEOUT_MINUTES",
                d.job_stale_timeout_minutes,
            ),
            job_max_recovery_retries: env_parse(
                "JOB_MAX_RECOVERY_RETRIES",
                d.job_max_recovery_retries,
            ),
            job_recovery_enabled: env_bool("JOB_RECOVERY_ENABLED", d.job_recovery_enabled),
            stuck_queued_timeout_minutes: env_parse(
                "STUCK_QUEUED_TIMEOUT_MINUTES",
                d.stuck_queued_timeout_minutes,
            ),
            drift_timeout_minutes: env_parse("DRIFT_TIMEOUT_MINUTES", d.drift_timeout_minutes),
            chunk_retention_hours: env_parse("CHUNK_RETENTION_HOURS", d.chunk_retention_hours),
            page_chunk_size: env_parse("PAGE_CHUNK_SIZE", d.page_chunk_size).max(1),
            ocr_fanout_threshold_pages: env_parse(
                "OCR_FANOUT_THRESHOLD_PAGES",
                d.ocr_fanout_threshold_pages,
            ),
            ocr_timeout_soft: Duration::from_millis(env_parse(
                "OCR_TIMEOUT_SOFT_MS",
                d.ocr_timeout_soft.as_millis() as u64,
            )),
            ocr_timeout_hard: Duration::from_millis(env_parse(
                "OCR_TIMEOUT_HARD_MS",
                d.ocr_timeout_hard.as_millis() as u64,
            )),
            job_max_retries: env_parse("JOB_MAX_RETRIES", d.job_max_retries),
            retry_backoff_base: Duration::from_secs(env_parse(
                "RETRY_BACKOFF_BASE_SECONDS",
                d.retry_backoff_base.as_secs(),
            )),
            retry_backoff_max: Duration::from_secs(env_parse(
                "RETRY_BACKOFF_MAX_SECONDS",
                d.retry_backoff_max.as_secs(),
            )),
            heartbeat_interval: Duration::from_secs(env_parse(
                "HEARTBEAT_INTERVAL_SECONDS",
                d.heartbeat_interval.as_secs(),
            )),
            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED", d.rate_limit_enabled),
            rate_limit_critical: env_parse("RATE_LIMIT_CRITICAL", d.rate_limit_critical),
            rate_limit_export: env_parse("RATE_LIMIT_EXPORT", d.rate_limit_export),
            rate_limit_search: env_parse("RATE_LIMIT_SEARCH", d.rate_limit_search),
            rate_limit_default: env_parse("RATE_LIMIT_DEFAULT", d.rate_limit_default),
            rate_limit_readonly: env_parse("RATE_LIMIT_READONLY", d.rate_limit_readonly),
            rate_limit_health: env_parse("RATE_LIMIT_HEALTH", d.rate_limit_health),
            forwarded_for_header: env_parse("FORWARDED_FOR_HEADER", d.forwarded_for_header),
            eta_window_size: env_parse("ETA_WINDOW_SIZE", d.eta_window_size).max(1),
            eta_fallback_sec_per_page: env_parse(
                "ETA_FALLBACK_SEC_PER_PAGE",
                d.eta_fallback_sec_per_page,
            ),
            eta_min_high_confidence_samples: env_parse(
                "ETA_MIN_HIGH_CONFIDENCE_SAMPLES",
                d.eta_min_high_confidence_samples,
            ),
            worker_count: env_parse("WORKER_COUNT", d.worker_count).max(1),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.job_stale_timeout_minutes, 30);
        assert_eq!(s.job_max_recovery_retries, 3);
        assert!(s.job_recovery_enabled);
        assert_eq!(s.chunk_retention_hours, 24);
        assert_eq!(s.page_chunk_size, 25);
        assert_eq!(s.rate_limit_default, 100);
        assert_eq!(s.rate_limit_critical, 30);
        assert_eq!(s.eta_window_size, 100);
        assert_eq!(s.eta_fallback_sec_per_page, 3.0);
        assert_eq!(s.eta_min_high_confidence_samples, 10);
        assert_eq!(s.retry_backoff_base, Duration::from_secs(5));
        assert_eq!(s.retry_backoff_max, Duration::from_secs(600));
    }
}
