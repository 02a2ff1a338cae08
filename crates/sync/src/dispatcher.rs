#![forbid(unsafe_code)]

use crate::clients::{EnqueueRequest, JobQueue};
use crate::coordinator::IndexRegistration;
use crate::error::DispatchError;
use crate::tracker::MutationSnapshot;
use pl_core::ids::{EntityId, EntityType, JobId};
use pl_core::jobs::{IndexJob, JobPriority};

/// Ids packed into one job, at most `batch_size` in total.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobBatch {
    pub created: Vec<EntityId>,
    pub updated: Vec<EntityId>,
    pub deleted: Vec<EntityId>,
}

impl JobBatch {
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Packs ids into batches of at most `batch_size`, filling each batch with
/// created ids first, then updated, then deleted. Input order is preserved,
/// every id lands in exactly one batch.
pub fn plan_batches(
    created: &[EntityId],
    updated: &[EntityId],
    deleted: &[EntityId],
    batch_size: usize,
) -> Result<Vec<JobBatch>, DispatchError> {
    if batch_size == 0 {
        return Err(DispatchError::InvalidBatchSize);
    }

    let mut rem_created = created;
    let mut rem_updated = updated;
    let mut rem_deleted = deleted;
    let mut batches = Vec::new();

    while !(rem_created.is_empty() && rem_updated.is_empty() && rem_deleted.is_empty()) {
        let (batch_created, rest) = split_at_most(rem_created, batch_size);
        rem_created = rest;
        let room = batch_size - batch_created.len();
        let (batch_updated, rest) = split_at_most(rem_updated, room);
        rem_updated = rest;
        let room = room - batch_updated.len();
        let (batch_deleted, rest) = split_at_most(rem_deleted, room);
        rem_deleted = rest;

        batches.push(JobBatch {
            created: batch_created.to_vec(),
            updated: batch_updated.to_vec(),
            deleted: batch_deleted.to_vec(),
        });
    }

    Ok(batches)
}

fn split_at_most(items: &[EntityId], n: usize) -> (&[EntityId], &[EntityId]) {
    items.split_at(n.min(items.len()))
}

/// Hands out `{reference}_{n}_{type}` job ids; `n` never repeats within one
/// session, even across several commits.
#[derive(Clone, Debug)]
pub struct JobSequence {
    reference: String,
    next: u64,
}

impl JobSequence {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            next: 0,
        }
    }

    pub fn random() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn next_id(&mut self, entity_type: &EntityType) -> JobId {
        let id = JobId::compose(&self.reference, self.next, entity_type);
        self.next += 1;
        id
    }
}

#[derive(Clone, Debug)]
pub struct JobDispatcher {
    queue_name: String,
}

impl JobDispatcher {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Splits `snapshot` into jobs and enqueues them in sequence order.
    /// Returns the ids of the primary jobs; attachment twins (when enabled)
    /// are enqueued at the front of the queue right after their primary.
    pub fn build_and_enqueue(
        &self,
        queue: &dyn JobQueue,
        sequence: &mut JobSequence,
        registration: &IndexRegistration,
        snapshot: &MutationSnapshot,
    ) -> Result<Vec<JobId>, DispatchError> {
        let batches = plan_batches(
            &snapshot.created,
            &snapshot.updated,
            &snapshot.deleted,
            registration.batch_size,
        )?;

        let mut job_ids = Vec::with_capacity(batches.len());
        for batch in batches {
            let job = IndexJob {
                job_id: sequence.next_id(&registration.entity_type),
                entity_type: registration.entity_type.clone(),
                created: batch.created,
                updated: batch.updated,
                deleted: batch.deleted,
                attachments: false,
                settings: registration.settings.clone(),
            };
            tracing::debug!(
                job_id = %job.job_id,
                items = job.len(),
                queue = %self.queue_name,
                "enqueueing index job"
            );

            let twin = (registration.index_attachments
                && !(job.created.is_empty() && job.updated.is_empty()))
            .then(|| job.attachment_twin());
            job_ids.push(job.job_id.clone());

            queue.enqueue(EnqueueRequest {
                queue_name: self.queue_name.clone(),
                delegate: registration.delegate.clone(),
                job,
                priority: JobPriority::Normal,
            })?;

            if let Some(twin) = twin {
                queue.enqueue(EnqueueRequest {
                    queue_name: self.queue_name.clone(),
                    delegate: registration.delegate.clone(),
                    job: twin,
                    priority: JobPriority::Front,
                })?;
            }
        }

        Ok(job_ids)
    }
}
