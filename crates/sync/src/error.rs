#![forbid(unsafe_code)]

use pl_core::content::ContentAddressError;
use pl_core::ids::{EntityId, EntityType};

#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("no mutation set attached for entity type {0}")]
    Untracked(EntityType),
    #[error("session is not registered for side-effect synchronization")]
    Detached,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("queue rejected job {job_id}: {reason}")]
    Rejected { job_id: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Remove of a document that is not in the index.
    #[error("no document matches {field}={value}")]
    NotFound { field: String, value: String },
    #[error("search engine transport: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("no such object {container}/{key}")]
    NotFound { container: String, key: String },
    #[error("blob store transport: {0}")]
    Transport(String),
    #[error("blob store io: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("token provider: {0}")]
pub struct TokenError(pub String);

#[derive(Debug, thiserror::Error)]
#[error("projection of {id} failed: {message}")]
pub struct ProjectionError {
    pub id: EntityId,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("indexing {entity_type} {id} failed: {source}")]
    Search {
        entity_type: EntityType,
        id: EntityId,
        #[source]
        source: SearchError,
    },
    #[error("bulk indexing failed: {0}")]
    Bulk(#[source] SearchError),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error("no index operation registered as {0}")]
    UnknownDelegate(String),
    #[error("job targets {actual} but the writer indexes {expected}")]
    WrongEntityType {
        expected: EntityType,
        actual: EntityType,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Address(#[from] ContentAddressError),
}

/// Failure surfaced through the unit-of-work hook interface.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Tracking(#[from] TrackingError),
    #[error("dispatch for {entity_type} failed: {source}")]
    Dispatch {
        entity_type: EntityType,
        #[source]
        source: DispatchError,
    },
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Staging(#[from] StagingError),
}
