//! Job store: persistent CRUD over processing jobs and stage history.
//!
//! This is the single source of truth for job state. Progress writers go
//! through `update`; sweepers use the guarded compare-and-swap helpers so a
//! concurrent worker cannot be trampled.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{parse_datetime, parse_datetime_opt, to_option, RepositoryError, Result};
use crate::models::{
    JobMetadata, JobStageHistory, JobStatus, JobType, JobUpdate, ProcessingJob, QueueStats,
    StageStatus,
};

/// Filter for paginated job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub matter_id: Option<String>,
    pub status: Option<JobStatus>,
    pub document_id: Option<String>,
    /// 1-based page number.
    pub page: usize,
    pub per_page: usize,
}

/// One page of jobs plus the total row count for pagination metadata.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<ProcessingJob>,
    pub total: u64,
}

/// Repository for `processing_jobs` and `job_stage_history`.
#[derive(Clone)]
pub struct JobRepository {
    db_path: PathBuf,
}

fn row_to_job(row: &Row) -> rusqlite::Result<ProcessingJob> {
    let job_type: String = row.get("job_type")?;
    let status: String = row.get("status")?;
    let metadata: String = row.get("metadata")?;
    Ok(ProcessingJob {
        id: row.get("id")?,
        matter_id: row.get("matter_id")?,
        document_id: row.get("document_id")?,
        job_type: JobType::from_str(&job_type).unwrap_or(JobType::DocumentProcessing),
        status: JobStatus::from_str(&status).unwrap_or(JobStatus::Queued),
        current_stage: row.get("current_stage")?,
        total_stages: row.get("total_stages")?,
        completed_stages: row.get("completed_stages")?,
        progress_pct: row.get::<_, i64>("progress_pct")?.clamp(0, 100) as u8,
        estimated_completion: parse_datetime_opt(row.get("estimated_completion")?),
        error_message: row.get("error_message")?,
        error_code: row.get("error_code")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        metadata: JobMetadata::from_json(Some(&metadata)),
        heartbeat_at: parse_datetime_opt(row.get("heartbeat_at")?),
        started_at: parse_datetime_opt(row.get("started_at")?),
        completed_at: parse_datetime_opt(row.get("completed_at")?),
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
    })
}

fn row_to_history(row: &Row) -> rusqlite::Result<JobStageHistory> {
    let status: String = row.get("status")?;
    let metadata: String = row.get("metadata")?;
    Ok(JobStageHistory {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        stage_name: row.get("stage_name")?,
        status: StageStatus::from_str(&status).unwrap_or(StageStatus::Pending),
        started_at: parse_datetime_opt(row.get("started_at")?),
        completed_at: parse_datetime_opt(row.get("completed_at")?),
        error_message: row.get("error_message")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
    })
}

impl JobRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        super::init_schema(db_path)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    fn connect(&self) -> Result<Connection> {
        super::connect(&self.db_path)
    }

    /// Insert a new job with status QUEUED and zero progress.
    pub fn create(
        &self,
        matter_id: &str,
        document_id: Option<&str>,
        job_type: JobType,
        max_retries: u32,
        metadata: JobMetadata,
    ) -> Result<ProcessingJob> {
        let conn = self.connect()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            r#"
            INSERT INTO processing_jobs
                (id, matter_id, document_id, job_type, status, max_retries, metadata,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'QUEUED', ?5, ?6, ?7, ?7)
            "#,
            params![
                id,
                matter_id,
                document_id,
                job_type.as_str(),
                max_retries,
                metadata.to_json(),
                now
            ],
        )?;

        self.get_required(&id)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<ProcessingJob>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT * FROM processing_jobs WHERE id = ?",
            params![job_id],
            row_to_job,
        ))
    }

    pub fn get_required(&self, job_id: &str) -> Result<ProcessingJob> {
        self.get(job_id)?
            .ok_or_else(|| RepositoryError::NotFound(format!("job {job_id}")))
    }

    /// Apply a sparse patch. Always touches `updated_at`; a terminal status
    /// also sets `completed_at` when the patch does not carry one.
    pub fn update(&self, job_id: &str, patch: JobUpdate) -> Result<ProcessingJob> {
        let conn = self.connect()?;
        let now = Utc::now();

        let mut sets: Vec<String> = vec!["updated_at = ?".to_string()];
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(now.to_rfc3339())];

        if let Some(status) = patch.status {
            sets.push("status = ?".into());
            values.push(Box::new(status.as_str().to_string()));
            if status.is_terminal() && patch.completed_at.is_none() {
                sets.push("completed_at = ?".into());
                values.push(Box::new(now.to_rfc3339()));
            }
        }
        if let Some(stage) = patch.current_stage {
            sets.push("current_stage = ?".into());
            values.push(Box::new(stage));
        }
        if let Some(completed_stages) = patch.completed_stages {
            sets.push("completed_stages = ?".into());
            values.push(Box::new(completed_stages));
        }
        if let Some(pct) = patch.progress_pct {
            sets.push("progress_pct = ?".into());
            values.push(Box::new(pct.min(100)));
        }
        if let Some(eta) = patch.estimated_completion {
            sets.push("estimated_completion = ?".into());
            values.push(Box::new(eta.map(|t| t.to_rfc3339())));
        }
        if let Some(msg) = patch.error_message {
            sets.push("error_message = ?".into());
            values.push(Box::new(msg));
        }
        if let Some(code) = patch.error_code {
            sets.push("error_code = ?".into());
            values.push(Box::new(code));
        }
        if let Some(retry_count) = patch.retry_count {
            sets.push("retry_count = ?".into());
            values.push(Box::new(retry_count));
        }
        if let Some(started_at) = patch.started_at {
            sets.push("started_at = ?".into());
            values.push(Box::new(started_at.map(|t| t.to_rfc3339())));
        }
        if let Some(completed_at) = patch.completed_at {
            sets.push("completed_at = ?".into());
            values.push(Box::new(completed_at.map(|t| t.to_rfc3339())));
        }
        if let Some(metadata) = patch.metadata {
            sets.push("metadata = ?".into());
            values.push(Box::new(metadata.to_json()));
        }

        let sql = format!(
            "UPDATE processing_jobs SET {} WHERE id = ?",
            sets.join(", ")
        );
        values.push(Box::new(job_id.to_string()));

        let changed = conn.execute(
            &sql,
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        if changed == 0 {
            return Err(RepositoryError::NotFound(format!("job {job_id}")));
        }

        self.get_required(job_id)
    }

    /// Record worker liveness. Does not touch `updated_at`.
    pub fn heartbeat(&self, job_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE processing_jobs SET heartbeat_at = ? WHERE id = ?",
            params![Utc::now().to_rfc3339(), job_id],
        )?;
        Ok(())
    }

    pub fn append_stage_history(
        &self,
        job_id: &str,
        stage_name: &str,
        status: StageStatus,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<JobStageHistory> {
        let conn = self.connect()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let (started_at, completed_at) = match status {
            StageStatus::InProgress => (Some(now.clone()), None),
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped => {
                (None, Some(now.clone()))
            }
            StageStatus::Pending => (None, None),
        };

        conn.execute(
            r#"
            INSERT INTO job_stage_history
                (id, job_id, stage_name, status, started_at, completed_at,
                 error_message, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                id,
                job_id,
                stage_name,
                status.as_str(),
                started_at,
                completed_at,
                error_message,
                metadata
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "{}".to_string()),
                now
            ],
        )?;

        let history = conn.query_row(
            "SELECT * FROM job_stage_history WHERE id = ?",
            params![id],
            row_to_history,
        )?;
        Ok(history)
    }

    pub fn stage_history(&self, job_id: &str) -> Result<Vec<JobStageHistory>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM job_stage_history WHERE job_id = ? ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], row_to_history)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Counts per status plus mean completed-job wall time for one matter.
    pub fn stats_by_matter(&self, matter_id: &str) -> Result<QueueStats> {
        let conn = self.connect()?;
        let mut stats = QueueStats::default();

        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM processing_jobs WHERE matter_id = ? GROUP BY status",
        )?;
        let counts = stmt
            .query_map(params![matter_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (status, count) in counts {
            match JobStatus::from_str(&status) {
                Some(JobStatus::Queued) => stats.queued = count,
                Some(JobStatus::Processing) => stats.processing = count,
                Some(JobStatus::Completed) => stats.completed = count,
                Some(JobStatus::Failed) => stats.failed = count,
                Some(JobStatus::Cancelled) => stats.cancelled = count,
                Some(JobStatus::Skipped) => stats.skipped = count,
                None => {}
            }
        }

        let avg_ms: Option<f64> = conn.query_row(
            r#"
            SELECT AVG((julianday(completed_at) - julianday(started_at)) * 86400000.0)
            FROM processing_jobs
            WHERE matter_id = ? AND status = 'COMPLETED'
              AND started_at IS NOT NULL AND completed_at IS NOT NULL
            "#,
            params![matter_id],
            |row| row.get(0),
        )?;
        stats.avg_processing_time_ms = avg_ms.unwrap_or(0.0).max(0.0) as u64;

        Ok(stats)
    }

    /// Paginated listing, newest first.
    pub fn list(&self, filter: &JobFilter) -> Result<JobPage> {
        let conn = self.connect()?;
        let per_page = filter.per_page.clamp(1, 100);
        let page = filter.page.max(1);
        let offset = (page - 1) * per_page;

        let mut wheres: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(matter_id) = &filter.matter_id {
            wheres.push("matter_id = ?");
            values.push(Box::new(matter_id.clone()));
        }
        if let Some(status) = filter.status {
            wheres.push("status = ?");
            values.push(Box::new(status.as_str().to_string()));
        }
        if let Some(document_id) = &filter.document_id {
            wheres.push("document_id = ?");
            values.push(Box::new(document_id.clone()));
        }
        let where_clause = if wheres.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", wheres.join(" AND "))
        };

        let total: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM processing_jobs {where_clause}"),
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT * FROM processing_jobs {where_clause} ORDER BY created_at DESC, id DESC LIMIT {per_page} OFFSET {offset}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
                row_to_job,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(JobPage { jobs, total })
    }

    /// Most recent job of a type for a document, regardless of status.
    pub fn latest_for_document(
        &self,
        document_id: &str,
        job_type: JobType,
    ) -> Result<Option<ProcessingJob>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            r#"
            SELECT * FROM processing_jobs
            WHERE document_id = ? AND job_type = ?
            ORDER BY created_at DESC, id DESC LIMIT 1
            "#,
            params![document_id, job_type.as_str()],
            row_to_job,
        ))
    }

    /// PROCESSING jobs whose last activity (heartbeat, else update) is older
    /// than the cutoff. Staleness is judged in code because it depends on
    /// whichever of the two timestamps is present.
    pub fn find_stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProcessingJob>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM processing_jobs WHERE status = 'PROCESSING'")?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs
            .into_iter()
            .filter(|job| job.last_activity() < cutoff)
            .collect())
    }

    /// QUEUED jobs not updated since the cutoff.
    pub fn find_stuck_queued(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProcessingJob>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM processing_jobs WHERE status = 'QUEUED' AND updated_at < ?",
        )?;
        let jobs = stmt
            .query_map(params![cutoff.to_rfc3339()], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// QUEUED or PROCESSING jobs not updated since the cutoff (drift sweep).
    pub fn find_stale_active(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProcessingJob>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM processing_jobs
            WHERE status IN ('QUEUED', 'PROCESSING') AND updated_at < ?
            "#,
        )?;
        let jobs = stmt
            .query_map(params![cutoff.to_rfc3339()], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Jobs recovered since the cutoff, judged by `last_recovery_at` in metadata.
    pub fn count_recovered_since(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.connect()?;
        let count: u64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM processing_jobs
            WHERE json_extract(metadata, '$.last_recovery_at') >= ?
            "#,
            params![cutoff.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Guarded PROCESSING -> QUEUED transition for the recovery sweeper.
    ///
    /// Only succeeds while the row is still PROCESSING; a worker that woke up
    /// and moved the job on wins the race.
    pub fn requeue_if_still_processing(
        &self,
        job_id: &str,
        metadata: &JobMetadata,
    ) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            r#"
            UPDATE processing_jobs
            SET status = 'QUEUED', metadata = ?1, error_message = NULL, updated_at = ?2
            WHERE id = ?3 AND status = 'PROCESSING'
            "#,
            params![metadata.to_json(), Utc::now().to_rfc3339(), job_id],
        )?;
        if changed == 0 {
            return Err(RepositoryError::Conflict(format!(
                "job {job_id} no longer PROCESSING"
            )));
        }
        Ok(())
    }

    /// Guarded QUEUED -> PROCESSING claim used by workers picking up a job.
    pub fn mark_processing_if_queued(&self, job_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            r#"
            UPDATE processing_jobs
            SET status = 'PROCESSING', started_at = COALESCE(started_at, ?1),
                heartbeat_at = ?1, updated_at = ?1
            WHERE id = ?2 AND status = 'QUEUED'
            "#,
            params![now, job_id],
        )?;
        Ok(changed > 0)
    }

    /// Touch `updated_at` without changing anything else (used by the
    /// stuck-queued dispatcher to suppress immediate re-dispatch).
    pub fn touch(&self, job_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE processing_jobs SET updated_at = ? WHERE id = ?",
            params![Utc::now().to_rfc3339(), job_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo() -> (TempDir, JobRepository) {
        let dir = TempDir::new().unwrap();
        let repo = JobRepository::new(&dir.path().join("test.db")).unwrap();
        (dir, repo)
    }

    const MATTER: &str = "1f0e2ab4-9c7d-4e2f-8a61-3bb1c0de9f12";

    #[test]
    fn test_create_defaults() {
        let (_dir, repo) = repo();
        let job = repo
            .create(
                MATTER,
                Some("doc-1"),
                JobType::DocumentProcessing,
                3,
                JobMetadata::default(),
            )
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress_pct, 0);
        assert_eq!(job.total_stages, 7);
        assert_eq!(job.retry_count, 0);
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_update_terminal_sets_completed_at() {
        let (_dir, repo) = repo();
        let job = repo
            .create(MATTER, None, JobType::Ocr, 3, JobMetadata::default())
            .unwrap();
        let updated = repo
            .update(
                &job.id,
                JobUpdate {
                    status: Some(JobStatus::Completed),
                    progress_pct: Some(100),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.status, JobStatus::Completed);
        assert!(updated.completed_at.is_some());
    }

    #[test]
    fn test_heartbeat_does_not_touch_updated_at() {
        let (_dir, repo) = repo();
        let job = repo
            .create(MATTER, None, JobType::Ocr, 3, JobMetadata::default())
            .unwrap();
        let before = repo.get_required(&job.id).unwrap().updated_at;
        repo.heartbeat(&job.id).unwrap();
        let after = repo.get_required(&job.id).unwrap();
        assert_eq!(after.updated_at, before);
        assert!(after.heartbeat_at.is_some());
    }

    #[test]
    fn test_requeue_guard_rejects_non_processing() {
        let (_dir, repo) = repo();
        let job = repo
            .create(MATTER, None, JobType::Ocr, 3, JobMetadata::default())
            .unwrap();
        // Still QUEUED, so the CAS must fail.
        let err = repo
            .requeue_if_still_processing(&job.id, &JobMetadata::default())
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[test]
    fn test_mark_processing_claims_once() {
        let (_dir, repo) = repo();
        let job = repo
            .create(MATTER, None, JobType::Ocr, 3, JobMetadata::default())
            .unwrap();
        assert!(repo.mark_processing_if_queued(&job.id).unwrap());
        assert!(!repo.mark_processing_if_queued(&job.id).unwrap());
        let job = repo.get_required(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_list_pagination_and_filters() {
        let (_dir, repo) = repo();
        for _ in 0..5 {
            repo.create(MATTER, None, JobType::Ocr, 3, JobMetadata::default())
                .unwrap();
        }
        let other = "9e8d7c6b-5a49-4382-9170-ffeeddccbbaa";
        repo.create(other, None, JobType::Ocr, 3, JobMetadata::default())
            .unwrap();

        let page = repo
            .list(&JobFilter {
                matter_id: Some(MATTER.into()),
                page: 1,
                per_page: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.jobs.len(), 2);
        assert!(page.jobs.iter().all(|j| j.matter_id == MATTER));
    }

    #[test]
    fn test_stage_history_ordering() {
        let (_dir, repo) = repo();
        let job = repo
            .create(MATTER, None, JobType::Ocr, 3, JobMetadata::default())
            .unwrap();
        repo.append_stage_history(&job.id, "ocr", StageStatus::InProgress, None, None)
            .unwrap();
        repo.append_stage_history(&job.id, "ocr", StageStatus::Completed, None, None)
            .unwrap();

        let history = repo.stage_history(&job.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, StageStatus::InProgress);
        assert_eq!(history[1].status, StageStatus::Completed);
    }

    #[test]
    fn test_stats_by_matter_counts() {
        let (_dir, repo) = repo();
        let a = repo
            .create(MATTER, None, JobType::Ocr, 3, JobMetadata::default())
            .unwrap();
        repo.create(MATTER, None, JobType::Ocr, 3, JobMetadata::default())
            .unwrap();
        repo.update(
            &a.id,
            JobUpdate {
                status: Some(JobStatus::Failed),
                ..Default::default()
            },
        )
        .unwrap();

        let stats = repo.stats_by_matter(MATTER).unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_find_stuck_queued_respects_cutoff() {
        let (_dir, repo) = repo();
        let job = repo
            .create(MATTER, None, JobType::Ocr, 3, JobMetadata::default())
            .unwrap();

        let future = Utc::now() + chrono::Duration::minutes(1);
        let stuck = repo.find_stuck_queued(future).unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, job.id);

        let past = Utc::now() - chrono::Duration::minutes(10);
        assert!(repo.find_stuck_queued(past).unwrap().is_empty());
    }
}
