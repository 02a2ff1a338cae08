#![forbid(unsafe_code)]

//! Contracts of the external collaborators: work queue, search engine, blob
//! store, token provider and document projection. Implementations must be
//! safe to share across threads; the subsystem adds no locking of its own.

use crate::error::{BlobError, ProjectionError, QueueError, SearchError, TokenError};
use pl_core::ids::EntityId;
use pl_core::jobs::{IndexJob, JobPriority};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::io::Read;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub queue_name: String,
    /// Name of the operation the worker resolves to apply the job.
    pub delegate: String,
    pub job: IndexJob,
    pub priority: JobPriority,
}

pub trait JobQueue: Send + Sync {
    /// Enqueueing a job id that is already present must not create a second copy.
    fn enqueue(&self, request: EnqueueRequest) -> Result<(), QueueError>;
}

pub trait SearchEngine: Send + Sync {
    /// Upsert keyed by `doc_id`.
    fn add_to_index(&self, doc_id: &str, document: &JsonValue) -> Result<(), SearchError>;

    /// Returns [`SearchError::NotFound`] when nothing matched.
    fn remove_from_index_by_query(&self, field: &str, value: EntityId) -> Result<(), SearchError>;

    fn bulk_add_to_index(&self, documents: &[(String, JsonValue)]) -> Result<(), SearchError>;
}

/// Maps a relational aggregate to a flat indexable document.
pub trait DocumentProjector: Send + Sync {
    /// `Ok(None)` means the row no longer exists.
    fn project(&self, id: EntityId) -> Result<Option<JsonValue>, ProjectionError>;

    fn project_attachments(&self, id: EntityId) -> Result<Option<JsonValue>, ProjectionError> {
        let _ = id;
        Ok(None)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

pub trait TokenProvider: Send + Sync {
    fn system_token(&self) -> Result<AuthToken, TokenError>;
}

pub type ObjectMetadata = BTreeMap<String, String>;

pub type ByteStream = Box<dyn Read + Send>;

pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under a generated key and returns it.
    fn update_object_and_key(
        &self,
        container: &str,
        bytes: &[u8],
        token: &AuthToken,
    ) -> Result<String, BlobError>;

    fn copy_object(
        &self,
        src_container: &str,
        src_key: &str,
        dst_container: &str,
        dst_key: &str,
        token: &AuthToken,
    ) -> Result<(), BlobError>;

    fn update_object(
        &self,
        container: &str,
        key: &str,
        bytes: &[u8],
        token: &AuthToken,
    ) -> Result<(), BlobError>;

    fn delete_object(&self, container: &str, key: &str, token: &AuthToken)
    -> Result<(), BlobError>;

    fn get_object_metadata(
        &self,
        container: &str,
        key: &str,
        token: &AuthToken,
    ) -> Result<ObjectMetadata, BlobError>;

    fn get_object_streaming(
        &self,
        container: &str,
        key: &str,
        token: &AuthToken,
    ) -> Result<ByteStream, BlobError>;
}
