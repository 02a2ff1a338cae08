#![forbid(unsafe_code)]

use crate::clients::JobQueue;
use crate::config::SyncConfig;
use crate::dispatcher::{JobDispatcher, JobSequence};
use crate::error::{SyncError, TrackingError};
use crate::hooks::UnitOfWorkHooks;
use crate::index_writer::{IndexBatch, IndexOperation};
use crate::tracker::MutationTracker;
use pl_core::ids::{EntityType, JobId};
use pl_core::jobs::JobSettings;
use pl_core::model::EntityChange;
use std::sync::Arc;

/// How one entity type reaches the search index.
#[derive(Clone)]
pub struct IndexRegistration {
    pub entity_type: EntityType,
    /// Name the worker resolves to `operation`.
    pub delegate: String,
    pub batch_size: usize,
    pub index_attachments: bool,
    pub settings: JobSettings,
    /// Runs in-process when a session has no queue.
    pub operation: Arc<dyn IndexOperation>,
}

impl IndexRegistration {
    pub fn new(
        entity_type: EntityType,
        delegate: impl Into<String>,
        operation: Arc<dyn IndexOperation>,
    ) -> Self {
        Self {
            entity_type,
            delegate: delegate.into(),
            batch_size: crate::config::DEFAULT_BATCH_SIZE,
            index_attachments: false,
            settings: JobSettings::new(),
            operation,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_attachments(mut self, index_attachments: bool) -> Self {
        self.index_attachments = index_attachments;
        self
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Process-wide owner of the index registrations. Built once at start-up and
/// shared by reference; each unit of work gets its own [`SessionSync`].
pub struct CommitCoordinator {
    config: SyncConfig,
    registrations: Vec<IndexRegistration>,
    dispatcher: JobDispatcher,
}

impl CommitCoordinator {
    pub fn new(config: SyncConfig) -> Self {
        let dispatcher = JobDispatcher::new(config.queue_name.clone());
        Self {
            config,
            registrations: Vec::new(),
            dispatcher,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Registers `entity_type` with the configured batch size and attachment
    /// flag. Re-registering a type replaces the previous entry.
    pub fn register_index(
        &mut self,
        entity_type: EntityType,
        delegate: impl Into<String>,
        operation: Arc<dyn IndexOperation>,
    ) -> &mut IndexRegistration {
        let registration = IndexRegistration::new(entity_type, delegate, operation)
            .with_batch_size(self.config.batch_size)
            .with_attachments(self.config.index_attachments);
        self.add_registration(registration)
    }

    pub fn add_registration(&mut self, registration: IndexRegistration) -> &mut IndexRegistration {
        self.registrations
            .retain(|r| r.entity_type != registration.entity_type);
        self.registrations.push(registration);
        let last = self.registrations.len() - 1;
        &mut self.registrations[last]
    }

    pub fn registrations(&self) -> &[IndexRegistration] {
        &self.registrations
    }

    /// Attaches fresh mutation sets for every registered type. With a queue,
    /// commits only enqueue; without one, commits index synchronously.
    pub fn register(self: &Arc<Self>, queue: Option<Arc<dyn JobQueue>>) -> SessionSync {
        let tracker = MutationTracker::new(self.registrations.iter().map(|r| &r.entity_type));
        SessionSync {
            coordinator: Arc::clone(self),
            tracker: Some(tracker),
            queue,
            sequence: JobSequence::random(),
            dispatched: Vec::new(),
        }
    }

    /// Applies the session's accumulated changes. The mutation sets are
    /// empty afterwards whatever happened; failures are logged and returned,
    /// retrying is left to the queue and its workers.
    pub fn on_commit(&self, session: &mut SessionSync) -> Vec<SyncError> {
        let Some(tracker) = session.tracker.as_mut() else {
            tracing::warn!("trying to commit indexing orders, but no mutation sets are attached");
            return Vec::new();
        };

        let mut errors = Vec::new();
        for registration in &self.registrations {
            let snapshot = match tracker.snapshot_and_clear(&registration.entity_type) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::warn!(error = %err, "mutation set missing at commit");
                    continue;
                }
            };
            if snapshot.is_empty() {
                continue;
            }

            match session.queue.as_deref() {
                Some(queue) => match self.dispatcher.build_and_enqueue(
                    queue,
                    &mut session.sequence,
                    registration,
                    &snapshot,
                ) {
                    Ok(job_ids) => {
                        tracing::info!(
                            entity_type = %registration.entity_type,
                            jobs = job_ids.len(),
                            items = snapshot.len(),
                            "committed indexing orders"
                        );
                        session.dispatched.extend(job_ids);
                    }
                    Err(source) => {
                        tracing::error!(
                            entity_type = %registration.entity_type,
                            error = %source,
                            "failed to enqueue indexing orders"
                        );
                        errors.push(SyncError::Dispatch {
                            entity_type: registration.entity_type.clone(),
                            source,
                        });
                    }
                },
                None => {
                    tracing::info!(
                        entity_type = %registration.entity_type,
                        items = snapshot.len(),
                        "no queue configured, indexing synchronously"
                    );
                    let batch = IndexBatch {
                        created: snapshot.created,
                        updated: snapshot.updated,
                        deleted: snapshot.deleted,
                        attachments: false,
                    };
                    let attachment_batch = (registration.index_attachments
                        && !(batch.created.is_empty() && batch.updated.is_empty()))
                    .then(|| IndexBatch {
                        created: batch.created.clone(),
                        updated: batch.updated.clone(),
                        deleted: Vec::new(),
                        attachments: true,
                    });
                    for batch in std::iter::once(batch).chain(attachment_batch) {
                        if let Err(err) = registration.operation.run(&batch) {
                            tracing::error!(
                                entity_type = %registration.entity_type,
                                attachments = batch.attachments,
                                error = %err,
                                "synchronous indexing failed"
                            );
                            errors.push(err.into());
                        }
                    }
                }
            }
        }

        tracker.clear_all();
        errors
    }

    /// Drops the session's accumulated changes without any external call.
    pub fn on_rollback(&self, session: &mut SessionSync) {
        match session.tracker.as_mut() {
            Some(tracker) => {
                tracing::info!("removing indexing orders");
                tracker.clear_all();
            }
            None => tracing::warn!(
                "trying to remove indexing orders, but no mutation sets are attached"
            ),
        }
    }
}

/// Index side of one unit of work: its mutation sets, its queue and its job
/// numbering.
pub struct SessionSync {
    coordinator: Arc<CommitCoordinator>,
    tracker: Option<MutationTracker>,
    queue: Option<Arc<dyn JobQueue>>,
    sequence: JobSequence,
    dispatched: Vec<JobId>,
}

impl SessionSync {
    /// Prefix for job ids instead of a random one.
    pub fn with_job_reference(mut self, reference: impl Into<String>) -> Self {
        self.sequence = JobSequence::new(reference);
        self
    }

    /// Detaches and discards the mutation sets. Later events are ignored.
    pub fn unregister(&mut self) {
        if self.tracker.take().is_none() {
            tracing::warn!("removing a session that has no indexing sets");
        }
        self.queue = None;
    }

    pub fn is_registered(&self) -> bool {
        self.tracker.is_some()
    }

    pub fn job_reference(&self) -> &str {
        self.sequence.reference()
    }

    /// Ids of every primary job this session has enqueued.
    pub fn dispatched_jobs(&self) -> &[JobId] {
        &self.dispatched
    }

    pub fn has_pending_changes(&self) -> bool {
        self.tracker.as_ref().is_some_and(|t| !t.is_empty())
    }

    fn record(
        &mut self,
        change: &EntityChange,
        record: fn(&mut MutationTracker, &EntityType, i64) -> Result<(), TrackingError>,
    ) {
        let Some(tracker) = self.tracker.as_mut() else {
            tracing::warn!(
                entity_type = %change.entity_type,
                id = change.id,
                "trying to register a change for indexing, but indexing sets are not present"
            );
            return;
        };
        if !tracker.is_tracked(&change.entity_type) {
            return;
        }
        if let Err(err) = record(tracker, &change.entity_type, change.id) {
            tracing::warn!(error = %err, "failed to record change for indexing");
        }
    }
}

impl UnitOfWorkHooks for SessionSync {
    fn on_entity_created(&mut self, change: &EntityChange) -> Result<(), SyncError> {
        self.record(change, MutationTracker::record_create);
        Ok(())
    }

    fn on_entity_updated(&mut self, change: &EntityChange) -> Result<(), SyncError> {
        self.record(change, MutationTracker::record_update);
        Ok(())
    }

    fn on_entity_deleted(&mut self, change: &EntityChange) -> Result<(), SyncError> {
        self.record(change, MutationTracker::record_delete);
        Ok(())
    }

    fn on_after_commit(&mut self) -> Vec<SyncError> {
        let coordinator = Arc::clone(&self.coordinator);
        coordinator.on_commit(self)
    }

    fn on_rollback(&mut self) {
        let coordinator = Arc::clone(&self.coordinator);
        coordinator.on_rollback(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexError;
    use crate::index_writer::IndexReport;
    use crate::memory::MemoryQueue;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorded {
        batches: Mutex<Vec<IndexBatch>>,
    }

    impl IndexOperation for Recorded {
        fn run(&self, batch: &IndexBatch) -> Result<IndexReport, IndexError> {
            self.batches.lock().push(batch.clone());
            Ok(IndexReport::default())
        }
    }

    fn plan() -> EntityType {
        EntityType::try_new("plan").expect("type")
    }

    fn coordinator(operation: Arc<Recorded>, batch_size: usize) -> Arc<CommitCoordinator> {
        let mut coordinator = CommitCoordinator::new(SyncConfig {
            batch_size,
            ..SyncConfig::default()
        });
        coordinator.register_index(plan(), "plan.index", operation);
        Arc::new(coordinator)
    }

    #[test]
    fn without_queue_commit_runs_full_snapshot_in_process() {
        let operation = Arc::new(Recorded::default());
        let coordinator = coordinator(operation.clone(), 2);
        let mut session = coordinator.register(None);

        for id in 1..=5 {
            session
                .on_entity_created(&EntityChange::row(plan(), id))
                .expect("created");
        }
        assert!(session.on_after_commit().is_empty());

        let batches = operation.batches.lock();
        assert_eq!(batches.len(), 1, "no splitting without a queue");
        assert_eq!(batches[0].created, vec![1, 2, 3, 4, 5]);
        assert!(!session.has_pending_changes());
    }

    #[test]
    fn with_queue_commit_only_enqueues() {
        let operation = Arc::new(Recorded::default());
        let coordinator = coordinator(operation.clone(), 2);
        let queue = Arc::new(MemoryQueue::new());
        let mut session = coordinator
            .register(Some(queue.clone()))
            .with_job_reference("req-1");

        for id in 1..=3 {
            session
                .on_entity_created(&EntityChange::row(plan(), id))
                .expect("created");
        }
        assert!(session.on_after_commit().is_empty());

        assert!(operation.batches.lock().is_empty());
        assert_eq!(session.job_reference(), "req-1");
        assert_eq!(queue.len(), 2);
        assert_eq!(
            session
                .dispatched_jobs()
                .iter()
                .map(JobId::as_str)
                .collect::<Vec<_>>(),
            vec!["req-1_0_plan", "req-1_1_plan"]
        );
    }

    #[test]
    fn rollback_dispatches_nothing() {
        let operation = Arc::new(Recorded::default());
        let coordinator = coordinator(operation.clone(), 10);
        let queue = Arc::new(MemoryQueue::new());
        let mut session = coordinator.register(Some(queue.clone()));

        session
            .on_entity_created(&EntityChange::row(plan(), 1))
            .expect("created");
        session.on_rollback();
        assert!(session.on_after_commit().is_empty());

        assert!(queue.is_empty());
        assert!(operation.batches.lock().is_empty());
    }

    #[test]
    fn unregistered_types_are_ignored() {
        let operation = Arc::new(Recorded::default());
        let coordinator = coordinator(operation.clone(), 10);
        let mut session = coordinator.register(None);
        let file = EntityType::try_new("plan_file").expect("type");

        session
            .on_entity_created(&EntityChange::row(file, 1))
            .expect("created");
        assert!(!session.has_pending_changes());
    }

    #[test]
    fn detached_session_is_non_fatal() {
        let operation = Arc::new(Recorded::default());
        let coordinator = coordinator(operation.clone(), 10);
        let mut session = coordinator.register(None);
        session.unregister();
        assert!(!session.is_registered());

        session
            .on_entity_created(&EntityChange::row(plan(), 1))
            .expect("ignored");
        assert!(session.on_after_commit().is_empty());
        session.on_rollback();
        assert!(operation.batches.lock().is_empty());
    }

    #[test]
    fn reregistering_a_type_replaces_it() {
        let first = Arc::new(Recorded::default());
        let second = Arc::new(Recorded::default());
        let mut coordinator = CommitCoordinator::new(SyncConfig::default());
        coordinator.register_index(plan(), "plan.index", first);
        coordinator
            .register_index(plan(), "plan.index.v2", second)
            .batch_size = 5;

        assert_eq!(coordinator.registrations().len(), 1);
        assert_eq!(coordinator.registrations()[0].delegate, "plan.index.v2");
        assert_eq!(coordinator.registrations()[0].batch_size, 5);
    }
}
