#![forbid(unsafe_code)]

//! In-process collaborators. They back the test suites and single-process
//! deployments that run without a queue, search cluster or object store.

use crate::clients::{
    AuthToken, BlobStore, ByteStream, EnqueueRequest, JobQueue, ObjectMetadata, SearchEngine,
    TokenProvider,
};
use crate::error::{BlobError, QueueError, SearchError, TokenError};
use parking_lot::Mutex;
use pl_core::ids::EntityId;
use pl_core::jobs::JobPriority;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, VecDeque};

#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<VecDeque<EnqueueRequest>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending jobs in delivery order.
    pub fn pending(&self) -> Vec<EnqueueRequest> {
        self.jobs.lock().iter().cloned().collect()
    }

    pub fn pop(&self) -> Option<EnqueueRequest> {
        self.jobs.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobQueue for MemoryQueue {
    fn enqueue(&self, request: EnqueueRequest) -> Result<(), QueueError> {
        let mut jobs = self.jobs.lock();
        if jobs.iter().any(|queued| queued.job.job_id == request.job.job_id) {
            tracing::debug!(job_id = %request.job.job_id, "job already queued");
            return Ok(());
        }
        match request.priority {
            JobPriority::Front => jobs.push_front(request),
            JobPriority::Normal => jobs.push_back(request),
        }
        Ok(())
    }
}

/// Document store keyed by document id; queries match top-level fields.
#[derive(Default)]
pub struct MemorySearchEngine {
    documents: Mutex<BTreeMap<String, JsonValue>>,
}

impl MemorySearchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, doc_id: &str) -> Option<JsonValue> {
        self.documents.lock().get(doc_id).cloned()
    }

    pub fn doc_ids(&self) -> Vec<String> {
        self.documents.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SearchEngine for MemorySearchEngine {
    fn add_to_index(&self, doc_id: &str, document: &JsonValue) -> Result<(), SearchError> {
        self.documents
            .lock()
            .insert(doc_id.to_string(), document.clone());
        Ok(())
    }

    fn remove_from_index_by_query(&self, field: &str, value: EntityId) -> Result<(), SearchError> {
        let mut documents = self.documents.lock();
        let before = documents.len();
        documents.retain(|_, doc| doc.get(field).and_then(JsonValue::as_i64) != Some(value));
        if documents.len() == before {
            return Err(SearchError::NotFound {
                field: field.to_string(),
                value: value.to_string(),
            });
        }
        Ok(())
    }

    fn bulk_add_to_index(&self, documents: &[(String, JsonValue)]) -> Result<(), SearchError> {
        let mut stored = self.documents.lock();
        for (doc_id, document) in documents {
            stored.insert(doc_id.clone(), document.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, container: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(container.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys present in `container`, sorted.
    pub fn keys(&self, container: &str) -> Vec<String> {
        self.objects
            .lock()
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn containers(&self) -> Vec<String> {
        let mut out = self
            .objects
            .lock()
            .keys()
            .map(|(c, _)| c.clone())
            .collect::<Vec<_>>();
        out.dedup();
        out
    }

    fn not_found(container: &str, key: &str) -> BlobError {
        BlobError::NotFound {
            container: container.to_string(),
            key: key.to_string(),
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn update_object_and_key(
        &self,
        container: &str,
        bytes: &[u8],
        _token: &AuthToken,
    ) -> Result<String, BlobError> {
        let key = uuid::Uuid::new_v4().to_string();
        self.objects
            .lock()
            .insert((container.to_string(), key.clone()), bytes.to_vec());
        Ok(key)
    }

    fn copy_object(
        &self,
        src_container: &str,
        src_key: &str,
        dst_container: &str,
        dst_key: &str,
        _token: &AuthToken,
    ) -> Result<(), BlobError> {
        let mut objects = self.objects.lock();
        let bytes = objects
            .get(&(src_container.to_string(), src_key.to_string()))
            .cloned()
            .ok_or_else(|| Self::not_found(src_container, src_key))?;
        objects.insert((dst_container.to_string(), dst_key.to_string()), bytes);
        Ok(())
    }

    fn update_object(
        &self,
        container: &str,
        key: &str,
        bytes: &[u8],
        _token: &AuthToken,
    ) -> Result<(), BlobError> {
        self.objects
            .lock()
            .insert((container.to_string(), key.to_string()), bytes.to_vec());
        Ok(())
    }

    fn delete_object(
        &self,
        container: &str,
        key: &str,
        _token: &AuthToken,
    ) -> Result<(), BlobError> {
        self.objects
            .lock()
            .remove(&(container.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(container, key))
    }

    fn get_object_metadata(
        &self,
        container: &str,
        key: &str,
        _token: &AuthToken,
    ) -> Result<ObjectMetadata, BlobError> {
        let objects = self.objects.lock();
        let bytes = objects
            .get(&(container.to_string(), key.to_string()))
            .ok_or_else(|| Self::not_found(container, key))?;
        Ok(ObjectMetadata::from([(
            "content-length".to_string(),
            bytes.len().to_string(),
        )]))
    }

    fn get_object_streaming(
        &self,
        container: &str,
        key: &str,
        _token: &AuthToken,
    ) -> Result<ByteStream, BlobError> {
        let bytes = self
            .object(container, key)
            .ok_or_else(|| Self::not_found(container, key))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }
}

pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn system_token(&self) -> Result<AuthToken, TokenError> {
        Ok(AuthToken::new(self.token.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pl_core::ids::{EntityType, JobId};
    use pl_core::jobs::IndexJob;
    use serde_json::json;
    use std::io::Read as _;

    fn request(job_id: &str, priority: JobPriority) -> EnqueueRequest {
        let entity_type = EntityType::try_new("plan").expect("type");
        EnqueueRequest {
            queue_name: "q".to_string(),
            delegate: "plan.index".to_string(),
            job: IndexJob {
                job_id: JobId::from_raw(job_id),
                entity_type,
                created: vec![1],
                updated: Vec::new(),
                deleted: Vec::new(),
                attachments: false,
                settings: Default::default(),
            },
            priority,
        }
    }

    #[test]
    fn queue_dedups_and_honours_front_priority() {
        let queue = MemoryQueue::new();
        queue.enqueue(request("a", JobPriority::Normal)).expect("a");
        queue.enqueue(request("b", JobPriority::Front)).expect("b");
        queue.enqueue(request("a", JobPriority::Normal)).expect("a again");

        let order = queue
            .pending()
            .into_iter()
            .map(|r| r.job.job_id.as_str().to_string())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[test]
    fn search_remove_of_absent_is_not_found() {
        let search = MemorySearchEngine::new();
        search
            .add_to_index("1", &json!({"id": 1, "title": "x"}))
            .expect("add");
        search.remove_from_index_by_query("id", 1).expect("remove");
        let err = search
            .remove_from_index_by_query("id", 1)
            .expect_err("second remove");
        assert!(matches!(err, SearchError::NotFound { .. }));
    }

    #[test]
    fn blob_copy_and_stream() {
        let blobs = MemoryBlobStore::new();
        let token = AuthToken::new("t");
        let key = blobs
            .update_object_and_key("temp", b"payload", &token)
            .expect("store");
        blobs.copy_object("temp", &key, "4", "001", &token).expect("copy");

        let mut out = Vec::new();
        blobs
            .get_object_streaming("4", "001", &token)
            .expect("stream")
            .read_to_end(&mut out)
            .expect("read");
        assert_eq!(out, b"payload");

        let err = blobs.delete_object("4", "002", &token).expect_err("absent");
        assert!(err.is_not_found());
    }
}
