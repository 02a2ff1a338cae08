#![forbid(unsafe_code)]

use pl_core::ids::{EntityId, EntityType};
use pl_storage::local::FsSearchIndex;
use pl_storage::{
    JobStatus, PLAN_ENTITY, PLAN_INDEX_DELEGATE, PlanProjector, SqliteJobQueue, SqliteStore,
    StoreError,
};
use pl_sync::error::{IndexError, SearchError};
use pl_sync::{IndexReport, IndexWriter, OperationRegistry};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const SEARCH_DIR: &str = "search";

#[derive(Debug, thiserror::Error)]
pub(crate) enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("invalid entity type {0:?}")]
    EntityType(&'static str),
}

/// Everything a worker process opens under one storage directory.
pub(crate) struct Services {
    pub(crate) store: SqliteStore,
    pub(crate) queue: SqliteJobQueue,
    pub(crate) writer: Arc<IndexWriter>,
    pub(crate) operations: OperationRegistry,
}

impl Services {
    pub(crate) fn open(storage_dir: &Path) -> Result<Self, WorkerError> {
        let store = SqliteStore::open(storage_dir)?;
        let queue = SqliteJobQueue::open(storage_dir)?;
        let projector = Arc::new(PlanProjector::open(storage_dir)?);
        let search = Arc::new(FsSearchIndex::open(storage_dir.join(SEARCH_DIR))?);

        let plan =
            EntityType::try_new(PLAN_ENTITY).map_err(|_| WorkerError::EntityType(PLAN_ENTITY))?;
        let writer = Arc::new(IndexWriter::new(plan, search, projector));
        let mut operations = OperationRegistry::new();
        operations.register(PLAN_INDEX_DELEGATE, writer.clone());

        Ok(Self {
            store,
            queue,
            writer,
            operations,
        })
    }

    pub(crate) fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.queue = self.queue.with_claim_lease(lease);
        self
    }

    /// Re-projects plans straight into the index. With `id`, only that plan;
    /// otherwise plans in id order starting at `offset`, at most `limit` of them.
    pub(crate) fn reindex(
        &self,
        batch_size: usize,
        id: Option<i64>,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<usize, WorkerError> {
        if let Some(id) = id {
            return Ok(self.writer.reindex(&[id], batch_size)?);
        }

        let total = self.store.plan_count()?;
        let end = match limit {
            Some(limit) => total.min(offset.saturating_add(limit)),
            None => total,
        };
        tracing::info!(total, offset, end, batch_size, "reindexing plans");

        let mut submitted = 0usize;
        let mut cursor = offset;
        while cursor < end {
            let page = batch_size.min(end - cursor);
            let ids: Vec<EntityId> = self.store.plan_ids(cursor, page)?;
            if ids.is_empty() {
                break;
            }
            submitted += self.writer.reindex(&ids, batch_size)?;
            cursor += ids.len();
        }
        Ok(submitted)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RunStats {
    pub(crate) completed: usize,
    pub(crate) retried: usize,
    pub(crate) failed: usize,
}

pub(crate) enum Step {
    Idle,
    Ran {
        job_id: String,
        outcome: Result<IndexReport, JobStatus>,
    },
}

pub(crate) struct Worker {
    services: Services,
    queue_name: String,
    worker_id: String,
    max_attempts: i64,
}

impl Worker {
    pub(crate) fn new(
        services: Services,
        queue_name: String,
        worker_id: String,
        max_attempts: i64,
    ) -> Self {
        Self {
            services,
            queue_name,
            worker_id,
            max_attempts,
        }
    }

    #[cfg(test)]
    pub(crate) fn services(&self) -> &Services {
        &self.services
    }

    /// Claims and applies at most one job.
    pub(crate) fn run_once(&self) -> Result<Step, WorkerError> {
        let Some(claimed) = self
            .services
            .queue
            .claim_next(&self.queue_name, &self.worker_id)?
        else {
            return Ok(Step::Idle);
        };
        let request = &claimed.request;
        let job_id = request.job.job_id.to_string();

        match self.services.operations.run(&request.delegate, &request.job) {
            Ok(report) => {
                self.services.queue.complete(&job_id)?;
                tracing::info!(
                    job_id = %job_id,
                    indexed = report.indexed,
                    missing = report.missing,
                    removed = report.removed,
                    already_absent = report.already_absent,
                    "index job done"
                );
                Ok(Step::Ran {
                    job_id,
                    outcome: Ok(report),
                })
            }
            Err(err) => {
                let status = self
                    .services
                    .queue
                    .fail(&job_id, &err.to_string(), self.max_attempts)?;
                tracing::warn!(
                    job_id = %job_id,
                    attempts = claimed.attempts,
                    status = status.as_str(),
                    error = %err,
                    "index job failed"
                );
                Ok(Step::Ran {
                    job_id,
                    outcome: Err(status),
                })
            }
        }
    }

    /// Processes jobs until the queue is empty (`once`) or forever, sleeping
    /// `poll` whenever there is nothing to claim.
    pub(crate) fn run(&self, poll: Duration, once: bool) -> Result<RunStats, WorkerError> {
        let mut stats = RunStats::default();
        loop {
            match self.run_once()? {
                Step::Ran { job_id, outcome } => match outcome {
                    Ok(_) => stats.completed += 1,
                    Err(JobStatus::Failed) => {
                        tracing::error!(job_id = %job_id, "index job gave up");
                        stats.failed += 1;
                    }
                    Err(_) => stats.retried += 1,
                },
                Step::Idle if once => return Ok(stats),
                Step::Idle => std::thread::sleep(poll),
            }
        }
    }
}
