#![forbid(unsafe_code)]

use crate::clients::{DocumentProjector, SearchEngine};
use crate::error::{IndexError, SearchError};
use pl_core::ids::{EntityId, EntityType};
use pl_core::jobs::IndexJob;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Field every indexed document carries its entity id in; removes query on it.
pub const ID_FIELD: &str = "id";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexBatch {
    pub created: Vec<EntityId>,
    pub updated: Vec<EntityId>,
    pub deleted: Vec<EntityId>,
    pub attachments: bool,
}

impl From<&IndexJob> for IndexBatch {
    fn from(job: &IndexJob) -> Self {
        Self {
            created: job.created.clone(),
            updated: job.updated.clone(),
            deleted: job.deleted.clone(),
            attachments: job.attachments,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub indexed: usize,
    /// Ids whose row was gone by the time the job ran.
    pub missing: usize,
    pub removed: usize,
    /// Removes that found nothing in the index.
    pub already_absent: usize,
}

/// What a worker (or the commit path, without a queue) runs for one batch.
pub trait IndexOperation: Send + Sync {
    fn run(&self, batch: &IndexBatch) -> Result<IndexReport, IndexError>;
}

/// Applies batches for one entity type against the search engine.
/// Every operation is an upsert or a delete-if-present, so replaying a job
/// leaves the index as it was after the first run.
pub struct IndexWriter {
    entity_type: EntityType,
    search: Arc<dyn SearchEngine>,
    projector: Arc<dyn DocumentProjector>,
}

impl IndexWriter {
    pub fn new(
        entity_type: EntityType,
        search: Arc<dyn SearchEngine>,
        projector: Arc<dyn DocumentProjector>,
    ) -> Self {
        Self {
            entity_type,
            search,
            projector,
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn apply(&self, job: &IndexJob) -> Result<IndexReport, IndexError> {
        if job.entity_type != self.entity_type {
            return Err(IndexError::WrongEntityType {
                expected: self.entity_type.clone(),
                actual: job.entity_type.clone(),
            });
        }
        tracing::info!(job_id = %job.job_id, items = job.len(), "starting index operation");
        self.run(&IndexBatch::from(job))
    }

    /// Upserts the current projection of `id`. Returns `false` when the row is gone.
    pub fn add(&self, id: EntityId, attachments: bool) -> Result<bool, IndexError> {
        let (doc_id, document) = if attachments {
            (
                attachment_doc_id(id),
                self.projector.project_attachments(id)?,
            )
        } else {
            (id.to_string(), self.projector.project(id)?)
        };
        let Some(document) = document else {
            tracing::warn!(
                entity_type = %self.entity_type,
                id,
                "asked to index a row that is not present"
            );
            return Ok(false);
        };
        self.search
            .add_to_index(&doc_id, &document)
            .map_err(|source| self.search_error(id, source))?;
        Ok(true)
    }

    /// Removes every document of `id`. Returns `false` when nothing was indexed.
    pub fn remove(&self, id: EntityId) -> Result<bool, IndexError> {
        match self.search.remove_from_index_by_query(ID_FIELD, id) {
            Ok(()) => Ok(true),
            Err(SearchError::NotFound { .. }) => {
                tracing::warn!(
                    entity_type = %self.entity_type,
                    id,
                    "tried to remove a document that is not in the index"
                );
                Ok(false)
            }
            Err(source) => Err(self.search_error(id, source)),
        }
    }

    /// Re-projects `ids` and submits them with bulk requests of `batch_size`.
    /// Returns the number of documents submitted.
    pub fn reindex(&self, ids: &[EntityId], batch_size: usize) -> Result<usize, IndexError> {
        let mut submitted = 0usize;
        for chunk in ids.chunks(batch_size.max(1)) {
            let mut documents = Vec::with_capacity(chunk.len());
            for &id in chunk {
                match self.projector.project(id)? {
                    Some(document) => documents.push((id.to_string(), document)),
                    None => tracing::warn!(id, "row vanished during reindex"),
                }
            }
            if documents.is_empty() {
                continue;
            }
            self.search
                .bulk_add_to_index(&documents)
                .map_err(IndexError::Bulk)?;
            submitted += documents.len();
            tracing::info!(
                entity_type = %self.entity_type,
                submitted,
                total = ids.len(),
                "reindex progress"
            );
        }
        Ok(submitted)
    }

    fn search_error(&self, id: EntityId, source: SearchError) -> IndexError {
        IndexError::Search {
            entity_type: self.entity_type.clone(),
            id,
            source,
        }
    }
}

impl IndexOperation for IndexWriter {
    fn run(&self, batch: &IndexBatch) -> Result<IndexReport, IndexError> {
        let mut report = IndexReport::default();
        for &id in batch.created.iter().chain(&batch.updated) {
            if self.add(id, batch.attachments)? {
                report.indexed += 1;
            } else {
                report.missing += 1;
            }
        }
        for &id in &batch.deleted {
            if self.remove(id)? {
                report.removed += 1;
            } else {
                report.already_absent += 1;
            }
        }
        Ok(report)
    }
}

pub fn attachment_doc_id(id: EntityId) -> String {
    format!("{id}:attachments")
}

/// Resolves the delegate name carried by a queued job to its operation.
#[derive(Default)]
pub struct OperationRegistry {
    operations: BTreeMap<String, Arc<dyn IndexOperation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, delegate: impl Into<String>, operation: Arc<dyn IndexOperation>) {
        self.operations.insert(delegate.into(), operation);
    }

    pub fn run(&self, delegate: &str, job: &IndexJob) -> Result<IndexReport, IndexError> {
        let operation = self
            .operations
            .get(delegate)
            .ok_or_else(|| IndexError::UnknownDelegate(delegate.to_string()))?;
        tracing::info!(job_id = %job.job_id, delegate, "running queued index job");
        operation.run(&IndexBatch::from(job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProjectionError;
    use crate::memory::MemorySearchEngine;
    use pl_core::ids::JobId;
    use serde_json::{Value as JsonValue, json};

    struct Rows {
        present: Vec<EntityId>,
        broken: Option<EntityId>,
    }

    impl DocumentProjector for Rows {
        fn project(&self, id: EntityId) -> Result<Option<JsonValue>, ProjectionError> {
            if self.broken == Some(id) {
                return Err(ProjectionError {
                    id,
                    message: "vocabulary lookup timed out".to_string(),
                });
            }
            Ok(self
                .present
                .contains(&id)
                .then(|| json!({"id": id, "subject": format!("plan {id}")})))
        }

        fn project_attachments(&self, id: EntityId) -> Result<Option<JsonValue>, ProjectionError> {
            Ok(self.present.contains(&id).then(|| json!({"id": id, "files": []})))
        }
    }

    fn plan() -> EntityType {
        EntityType::try_new("plan").expect("type")
    }

    fn writer(search: Arc<MemorySearchEngine>, present: Vec<EntityId>) -> IndexWriter {
        IndexWriter::new(
            plan(),
            search,
            Arc::new(Rows {
                present,
                broken: None,
            }),
        )
    }

    fn job(created: Vec<EntityId>, updated: Vec<EntityId>, deleted: Vec<EntityId>) -> IndexJob {
        IndexJob {
            job_id: JobId::compose("t", 0, &plan()),
            entity_type: plan(),
            created,
            updated,
            deleted,
            attachments: false,
            settings: Default::default(),
        }
    }

    #[test]
    fn applying_a_job_twice_is_idempotent() {
        let search = Arc::new(MemorySearchEngine::new());
        search
            .add_to_index("9", &json!({"id": 9}))
            .expect("seed");
        let writer = writer(search.clone(), vec![1, 2]);
        let job = job(vec![1], vec![2], vec![9]);

        let first = writer.apply(&job).expect("first");
        assert_eq!(first.indexed, 2);
        assert_eq!(first.removed, 1);
        let state = search.doc_ids();

        let second = writer.apply(&job).expect("second");
        assert_eq!(second.indexed, 2);
        assert_eq!(second.removed, 0);
        assert_eq!(second.already_absent, 1);
        assert_eq!(search.doc_ids(), state);
    }

    #[test]
    fn removing_an_absent_document_succeeds() {
        let search = Arc::new(MemorySearchEngine::new());
        let writer = writer(search, Vec::new());
        assert!(!writer.remove(404).expect("absent remove is ok"));
    }

    #[test]
    fn vanished_rows_are_skipped() {
        let search = Arc::new(MemorySearchEngine::new());
        let writer = writer(search.clone(), vec![1]);
        let report = writer.apply(&job(vec![1, 2], Vec::new(), Vec::new())).expect("apply");
        assert_eq!(report.indexed, 1);
        assert_eq!(report.missing, 1);
        assert_eq!(search.doc_ids(), vec!["1"]);
    }

    #[test]
    fn projection_failure_fails_the_job() {
        let search = Arc::new(MemorySearchEngine::new());
        let writer = IndexWriter::new(
            plan(),
            search,
            Arc::new(Rows {
                present: vec![1, 2],
                broken: Some(2),
            }),
        );
        let err = writer
            .apply(&job(vec![1, 2], Vec::new(), Vec::new()))
            .expect_err("projection failure");
        assert!(matches!(err, IndexError::Projection(ProjectionError { id: 2, .. })));
    }

    #[test]
    fn attachment_jobs_write_their_own_document() {
        let search = Arc::new(MemorySearchEngine::new());
        let writer = writer(search.clone(), vec![5]);
        let twin = job(vec![5], Vec::new(), Vec::new()).attachment_twin();
        writer.apply(&twin).expect("apply");
        assert_eq!(search.doc_ids(), vec!["5:attachments"]);

        writer.remove(5).expect("remove");
        assert!(search.is_empty());
    }

    #[test]
    fn wrong_entity_type_is_rejected() {
        let search = Arc::new(MemorySearchEngine::new());
        let writer = writer(search, vec![1]);
        let mut other = job(vec![1], Vec::new(), Vec::new());
        other.entity_type = EntityType::try_new("item").expect("type");
        assert!(matches!(
            writer.apply(&other),
            Err(IndexError::WrongEntityType { .. })
        ));
    }

    #[test]
    fn reindex_submits_in_chunks() {
        let search = Arc::new(MemorySearchEngine::new());
        let writer = writer(search.clone(), vec![1, 2, 3, 4, 5]);
        let submitted = writer.reindex(&[1, 2, 3, 4, 5, 6], 2).expect("reindex");
        assert_eq!(submitted, 5);
        assert_eq!(search.len(), 5);
    }

    #[test]
    fn registry_resolves_delegates() {
        let search = Arc::new(MemorySearchEngine::new());
        let mut registry = OperationRegistry::new();
        registry.register("plan.index", Arc::new(writer(search.clone(), vec![1])));

        registry
            .run("plan.index", &job(vec![1], Vec::new(), Vec::new()))
            .expect("run");
        assert_eq!(search.len(), 1);

        let err = registry
            .run("item.index", &job(vec![1], Vec::new(), Vec::new()))
            .expect_err("unknown");
        assert!(matches!(err, IndexError::UnknownDelegate(name) if name == "item.index"));
    }
}
