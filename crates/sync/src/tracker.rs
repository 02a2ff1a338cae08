#![forbid(unsafe_code)]

use crate::error::TrackingError;
use pl_core::ids::{EntityId, EntityType};
use std::collections::{BTreeMap, BTreeSet};

/// Ids touched by one transaction for one entity type. The three sets are
/// kept disjoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutationSet {
    created: BTreeSet<EntityId>,
    updated: BTreeSet<EntityId>,
    deleted: BTreeSet<EntityId>,
}

impl MutationSet {
    fn record_create(&mut self, id: EntityId) {
        // A primary key deleted earlier in the same transaction and inserted
        // again already exists outside of it.
        if self.deleted.remove(&id) {
            self.updated.insert(id);
            return;
        }
        self.updated.remove(&id);
        self.created.insert(id);
    }

    fn record_update(&mut self, id: EntityId) {
        if self.created.contains(&id) || self.deleted.contains(&id) {
            return;
        }
        self.updated.insert(id);
    }

    fn record_delete(&mut self, id: EntityId) {
        // Created and deleted inside one transaction: never visible outside it.
        if self.created.remove(&id) {
            return;
        }
        self.updated.remove(&id);
        self.deleted.insert(id);
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    fn take(&mut self) -> MutationSnapshot {
        let taken = std::mem::take(self);
        MutationSnapshot {
            created: taken.created.into_iter().collect(),
            updated: taken.updated.into_iter().collect(),
            deleted: taken.deleted.into_iter().collect(),
        }
    }
}

/// Ascending id lists taken from a [`MutationSet`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutationSnapshot {
    pub created: Vec<EntityId>,
    pub updated: Vec<EntityId>,
    pub deleted: Vec<EntityId>,
}

impl MutationSnapshot {
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-transaction change sets keyed by entity type. Owned by exactly one
/// session, so no locking.
#[derive(Debug, Default)]
pub struct MutationTracker {
    sets: BTreeMap<EntityType, MutationSet>,
}

impl MutationTracker {
    pub fn new<'a>(types: impl IntoIterator<Item = &'a EntityType>) -> Self {
        let mut tracker = Self::default();
        for entity_type in types {
            tracker.track(entity_type.clone());
        }
        tracker
    }

    /// Attaches a fresh set for `entity_type`, discarding any previous one.
    pub fn track(&mut self, entity_type: EntityType) {
        self.sets.insert(entity_type, MutationSet::default());
    }

    pub fn is_tracked(&self, entity_type: &EntityType) -> bool {
        self.sets.contains_key(entity_type)
    }

    pub fn tracked_types(&self) -> impl Iterator<Item = &EntityType> {
        self.sets.keys()
    }

    pub fn record_create(
        &mut self,
        entity_type: &EntityType,
        id: EntityId,
    ) -> Result<(), TrackingError> {
        self.set_mut(entity_type)?.record_create(id);
        Ok(())
    }

    pub fn record_update(
        &mut self,
        entity_type: &EntityType,
        id: EntityId,
    ) -> Result<(), TrackingError> {
        self.set_mut(entity_type)?.record_update(id);
        Ok(())
    }

    pub fn record_delete(
        &mut self,
        entity_type: &EntityType,
        id: EntityId,
    ) -> Result<(), TrackingError> {
        self.set_mut(entity_type)?.record_delete(id);
        Ok(())
    }

    /// Takes the accumulated ids for `entity_type` and leaves an empty set behind.
    pub fn snapshot_and_clear(
        &mut self,
        entity_type: &EntityType,
    ) -> Result<MutationSnapshot, TrackingError> {
        Ok(self.set_mut(entity_type)?.take())
    }

    pub fn clear_all(&mut self) {
        for set in self.sets.values_mut() {
            *set = MutationSet::default();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(MutationSet::is_empty)
    }

    fn set_mut(&mut self, entity_type: &EntityType) -> Result<&mut MutationSet, TrackingError> {
        self.sets
            .get_mut(entity_type)
            .ok_or_else(|| TrackingError::Untracked(entity_type.clone()))
    }
}
