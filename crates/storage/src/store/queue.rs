#![forbid(unsafe_code)]

use super::*;
use parking_lot::Mutex;
use pl_core::jobs::{IndexJob, JobPriority};
use pl_sync::clients::{EnqueueRequest, JobQueue};
use pl_sync::error::QueueError;

const MAX_ERROR_LEN: usize = 2_000;
/// How long a claim stays exclusive before another worker may take the job over.
pub const DEFAULT_CLAIM_LEASE_MS: i64 = 5 * 60 * 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimedJob {
    pub request: EnqueueRequest,
    /// Including the current one.
    pub attempts: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub queued: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

/// Index jobs persisted next to the plans. Delivery is at least once: a job
/// that fails is requeued until it has used up its attempts, and a job whose
/// worker vanished is claimable again once its lease has expired.
pub struct SqliteJobQueue {
    conn: Mutex<Connection>,
    lease_ms: i64,
}

impl SqliteJobQueue {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = open_connection(storage_dir.as_ref())?;
        schema::install_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            lease_ms: DEFAULT_CLAIM_LEASE_MS,
        })
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        self
    }

    pub fn push(&self, request: &EnqueueRequest) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(&request.job)?;
        let now_ms = now_ms();
        let inserted = self.conn.lock().execute(
            r#"
            INSERT OR IGNORE INTO index_jobs(job_id, queue_name, delegate, priority, payload_json, status, attempts, created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, 'QUEUED', 0, ?6, ?6)
            "#,
            params![
                request.job.job_id.as_str(),
                request.queue_name,
                request.delegate,
                request.priority.as_str(),
                payload,
                now_ms
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Marks the next claimable job of `queue_name` as running under a fresh
    /// lease. Front jobs come first (newest first), then normal jobs in
    /// enqueue order. Running jobs whose lease has expired count as claimable.
    pub fn claim_next(
        &self,
        queue_name: &str,
        worker_id: &str,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        let now_ms = now_ms();
        let claim_expires_at_ms = now_ms.saturating_add(self.lease_ms);
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let next: Option<(i64, String, String, String, i64, Option<String>)> = tx
            .query_row(
                r#"
                SELECT seq, delegate, priority, payload_json, attempts, CASE status WHEN 'RUNNING' THEN worker END
                FROM index_jobs
                WHERE queue_name=?1
                  AND (status='QUEUED'
                       OR (status='RUNNING' AND (claim_expires_at_ms IS NULL OR claim_expires_at_ms <= ?2)))
                ORDER BY CASE priority WHEN 'front' THEN 0 ELSE 1 END ASC,
                         CASE priority WHEN 'front' THEN -seq ELSE seq END ASC
                LIMIT 1
                "#,
                params![queue_name, now_ms],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((seq, delegate, priority, payload, attempts, stale_worker)) = next else {
            return Ok(None);
        };

        let changed = tx.execute(
            r#"
            UPDATE index_jobs
            SET status='RUNNING', worker=?2, attempts=attempts + 1, claim_expires_at_ms=?4, updated_at_ms=?3
            WHERE seq=?1
              AND (status='QUEUED'
                   OR (status='RUNNING' AND (claim_expires_at_ms IS NULL OR claim_expires_at_ms <= ?3)))
            "#,
            params![seq, worker_id, now_ms, claim_expires_at_ms],
        )?;
        if changed != 1 {
            return Ok(None);
        }
        tx.commit()?;
        if let Some(stale_worker) = stale_worker {
            tracing::warn!(seq, stale_worker = %stale_worker, worker = worker_id, "reclaimed job with expired lease");
        }

        let job: IndexJob = serde_json::from_str(&payload)?;
        Ok(Some(ClaimedJob {
            request: EnqueueRequest {
                queue_name: queue_name.to_string(),
                delegate,
                job,
                priority: JobPriority::parse(&priority).unwrap_or_default(),
            },
            attempts: attempts + 1,
        }))
    }

    pub fn complete(&self, job_id: &str) -> Result<(), StoreError> {
        let changed = self.conn.lock().execute(
            "UPDATE index_jobs SET status='DONE', last_error=NULL, claim_expires_at_ms=NULL, updated_at_ms=?2 WHERE job_id=?1",
            params![job_id, now_ms()],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownJob(job_id.to_string()));
        }
        Ok(())
    }

    /// Records a failed attempt. The job goes back to the queue unless it has
    /// already been tried `max_attempts` times.
    pub fn fail(
        &self,
        job_id: &str,
        error: &str,
        max_attempts: i64,
    ) -> Result<JobStatus, StoreError> {
        let conn = self.conn.lock();
        let attempts: i64 = conn
            .query_row(
                "SELECT attempts FROM index_jobs WHERE job_id=?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))?;

        let status = if attempts >= max_attempts {
            JobStatus::Failed
        } else {
            JobStatus::Queued
        };
        let error = error.chars().take(MAX_ERROR_LEN).collect::<String>();
        conn.execute(
            "UPDATE index_jobs SET status=?2, last_error=?3, worker=NULL, claim_expires_at_ms=NULL, updated_at_ms=?4 WHERE job_id=?1",
            params![job_id, status.as_str(), error, now_ms()],
        )?;
        Ok(status)
    }

    pub fn status(&self, job_id: &str) -> Result<Option<JobStatus>, StoreError> {
        let raw: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT status FROM index_jobs WHERE job_id=?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.as_deref().and_then(parse_status))
    }

    pub fn counts(&self, queue_name: &str) -> Result<QueueCounts, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(1) FROM index_jobs WHERE queue_name=?1 GROUP BY status",
        )?;
        let mut rows = stmt.query(params![queue_name])?;
        let mut counts = QueueCounts::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count = usize::try_from(row.get::<_, i64>(1)?).unwrap_or(0);
            match parse_status(&status) {
                Some(JobStatus::Queued) => counts.queued = count,
                Some(JobStatus::Running) => counts.running = count,
                Some(JobStatus::Done) => counts.done = count,
                Some(JobStatus::Failed) => counts.failed = count,
                None => {}
            }
        }
        Ok(counts)
    }
}

impl JobQueue for SqliteJobQueue {
    fn enqueue(&self, request: EnqueueRequest) -> Result<(), QueueError> {
        match self.push(&request) {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::debug!(job_id = %request.job.job_id, "job already queued");
                Ok(())
            }
            Err(StoreError::Json(err)) => Err(QueueError::Rejected {
                job_id: request.job.job_id.to_string(),
                reason: err.to_string(),
            }),
            Err(err) => Err(QueueError::Unavailable(err.to_string())),
        }
    }
}

fn parse_status(raw: &str) -> Option<JobStatus> {
    match raw {
        "QUEUED" => Some(JobStatus::Queued),
        "RUNNING" => Some(JobStatus::Running),
        "DONE" => Some(JobStatus::Done),
        "FAILED" => Some(JobStatus::Failed),
        _ => None,
    }
}
