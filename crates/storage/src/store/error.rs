#![forbid(unsafe_code)]

use pl_core::ids::EntityId;
use pl_sync::error::SyncError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("revision mismatch (expected={expected}, actual={actual})")]
    RevisionMismatch { expected: i64, actual: i64 },
    #[error("unknown plan {0}")]
    UnknownPlan(EntityId),
    #[error("unknown file {file_no} of plan {plan_id}")]
    UnknownFile { plan_id: EntityId, file_no: i64 },
    #[error("plan {plan_id} already has {max} files")]
    TooManyFiles { plan_id: EntityId, max: i64 },
    #[error("unknown job {0}")]
    UnknownJob(String),
    /// A hook refused a change at flush time; the unit of work was rolled back.
    #[error("side effect failed: {0}")]
    SideEffect(#[from] SyncError),
    #[error("unit of work already finished")]
    Finished,
}
