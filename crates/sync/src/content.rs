#![forbid(unsafe_code)]

use crate::clients::{AuthToken, BlobStore, ByteStream, TokenProvider};
use crate::config::SyncConfig;
use crate::error::{BlobError, StagingError, SyncError};
use crate::hooks::UnitOfWorkHooks;
use pl_core::content::ContentAddress;
use pl_core::ids::{EntityId, TempKey};
use pl_core::model::{AttachmentChange, EntityChange};
use std::sync::Arc;

/// Moves attachment bytes between the temporary container and their
/// permanent `(owner, child)` location.
pub struct ContentStager {
    blob: Arc<dyn BlobStore>,
    tokens: Arc<dyn TokenProvider>,
    temp_container: String,
}

impl ContentStager {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        tokens: Arc<dyn TokenProvider>,
        temp_container: impl Into<String>,
    ) -> Self {
        Self {
            blob,
            tokens,
            temp_container: temp_container.into(),
        }
    }

    /// Stages into the configured temporary container.
    pub fn from_config(
        blob: Arc<dyn BlobStore>,
        tokens: Arc<dyn TokenProvider>,
        config: &SyncConfig,
    ) -> Self {
        Self::new(blob, tokens, config.temp_container.clone())
    }

    pub fn temp_container(&self) -> &str {
        &self.temp_container
    }

    pub fn stage_temporary(&self, bytes: &[u8]) -> Result<TempKey, StagingError> {
        let token = self.token()?;
        let key = self
            .blob
            .update_object_and_key(&self.temp_container, bytes, &token)?;
        tracing::debug!(temp_key = %key, len = bytes.len(), "staged temporary content");
        Ok(TempKey::new(key))
    }

    /// `false` only for a definite miss; other lookup failures are returned so
    /// an upload referencing the key can be rejected.
    pub fn exists(&self, temp_key: &TempKey) -> Result<bool, StagingError> {
        let token = self.token()?;
        match self
            .blob
            .get_object_metadata(&self.temp_container, temp_key.as_str(), &token)
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Copies staged bytes to the permanent location, overwriting what is there.
    pub fn promote(
        &self,
        temp_key: &TempKey,
        owner_id: EntityId,
        child_id: EntityId,
    ) -> Result<ContentAddress, StagingError> {
        let target = ContentAddress::permanent(owner_id, child_id)?;
        let token = self.token()?;
        self.blob.copy_object(
            &self.temp_container,
            temp_key.as_str(),
            &target.container,
            &target.key,
            &token,
        )?;
        tracing::info!(temp_key = %temp_key, address = %target, "promoted staged content");
        Ok(target)
    }

    pub fn remove(&self, owner_id: EntityId, child_id: EntityId) -> Result<(), StagingError> {
        let target = ContentAddress::permanent(owner_id, child_id)?;
        let token = self.token()?;
        self.blob
            .delete_object(&target.container, &target.key, &token)?;
        tracing::info!(address = %target, "removed permanent content");
        Ok(())
    }

    /// Writes bytes straight to the permanent location, bypassing staging.
    pub fn store_content(
        &self,
        owner_id: EntityId,
        child_id: EntityId,
        bytes: &[u8],
    ) -> Result<(), StagingError> {
        let target = ContentAddress::permanent(owner_id, child_id)?;
        let token = self.token()?;
        self.blob
            .update_object(&target.container, &target.key, bytes, &token)?;
        Ok(())
    }

    pub fn stream_content(
        &self,
        owner_id: EntityId,
        child_id: EntityId,
    ) -> Result<ByteStream, StagingError> {
        let target = ContentAddress::permanent(owner_id, child_id)?;
        let token = self.token()?;
        Ok(self
            .blob
            .get_object_streaming(&target.container, &target.key, &token)?)
    }

    /// Per-transaction hook that promotes and removes content at flush time.
    pub fn session(self: &Arc<Self>) -> StagingSession {
        StagingSession {
            stager: Arc::clone(self),
            journal: Vec::new(),
        }
    }

    fn token(&self) -> Result<AuthToken, StagingError> {
        Ok(self.tokens.system_token()?)
    }

    /// Copies the current permanent object aside. `None` when there is none.
    fn backup(&self, target: &ContentAddress) -> Result<Option<String>, StagingError> {
        let token = self.token()?;
        let backup_key = format!("backup-{}", uuid::Uuid::new_v4());
        match self.blob.copy_object(
            &target.container,
            &target.key,
            &self.temp_container,
            &backup_key,
            &token,
        ) {
            Ok(()) => Ok(Some(backup_key)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn restore(&self, entry: &JournalEntry) -> Result<(), BlobError> {
        let token = self
            .tokens
            .system_token()
            .map_err(|err| BlobError::Transport(err.to_string()))?;
        match &entry.backup {
            Some(backup_key) => {
                self.blob.copy_object(
                    &self.temp_container,
                    backup_key,
                    &entry.target.container,
                    &entry.target.key,
                    &token,
                )?;
                self.blob
                    .delete_object(&self.temp_container, backup_key, &token)
            }
            None => match self
                .blob
                .delete_object(&entry.target.container, &entry.target.key, &token)
            {
                Err(err) if err.is_not_found() => Ok(()),
                other => other,
            },
        }
    }

    fn discard_backup(&self, backup_key: &str) -> Result<(), BlobError> {
        let token = self
            .tokens
            .system_token()
            .map_err(|err| BlobError::Transport(err.to_string()))?;
        self.blob
            .delete_object(&self.temp_container, backup_key, &token)
    }
}

#[derive(Clone, Debug)]
struct JournalEntry {
    target: ContentAddress,
    /// Temp-container key holding what `target` held before this transaction touched it.
    backup: Option<String>,
}

/// Flush-time content hook for one unit of work.
///
/// Promotion and removal happen before the relational commit so a blob
/// failure fails the transaction. Each permanent object touched is first
/// copied aside; a rollback puts the previous bytes back (or deletes the
/// object if there were none), a commit discards the copies.
pub struct StagingSession {
    stager: Arc<ContentStager>,
    journal: Vec<JournalEntry>,
}

impl StagingSession {
    fn promote_change(&mut self, attachment: &AttachmentChange) -> Result<(), SyncError> {
        let Some(temp_key) = attachment.temp_key.as_ref() else {
            return Ok(());
        };
        let target = ContentAddress::permanent(attachment.owner_id, attachment.child_id)
            .map_err(StagingError::from)?;
        let backup = self.stager.backup(&target)?;
        self.journal.push(JournalEntry {
            target,
            backup,
        });
        self.stager
            .promote(temp_key, attachment.owner_id, attachment.child_id)?;
        Ok(())
    }

    fn remove_change(&mut self, attachment: &AttachmentChange) -> Result<(), SyncError> {
        let target = ContentAddress::permanent(attachment.owner_id, attachment.child_id)
            .map_err(StagingError::from)?;
        let Some(backup) = self.stager.backup(&target)? else {
            tracing::warn!(address = %target, "no permanent content to remove");
            return Ok(());
        };
        self.journal.push(JournalEntry {
            target,
            backup: Some(backup),
        });
        self.stager
            .remove(attachment.owner_id, attachment.child_id)?;
        Ok(())
    }

    pub fn pending_compensations(&self) -> usize {
        self.journal.len()
    }
}

impl UnitOfWorkHooks for StagingSession {
    fn on_entity_created(&mut self, change: &EntityChange) -> Result<(), SyncError> {
        match &change.attachment {
            Some(attachment) => self.promote_change(attachment),
            None => Ok(()),
        }
    }

    fn on_entity_updated(&mut self, change: &EntityChange) -> Result<(), SyncError> {
        match &change.attachment {
            Some(attachment) => self.promote_change(attachment),
            None => Ok(()),
        }
    }

    fn on_entity_deleted(&mut self, change: &EntityChange) -> Result<(), SyncError> {
        match &change.attachment {
            Some(attachment) => self.remove_change(attachment),
            None => Ok(()),
        }
    }

    fn on_after_commit(&mut self) -> Vec<SyncError> {
        for entry in self.journal.drain(..) {
            let Some(backup_key) = entry.backup else {
                continue;
            };
            if let Err(err) = self.stager.discard_backup(&backup_key) {
                tracing::warn!(backup_key = %backup_key, error = %err, "failed to discard content backup");
            }
        }
        Vec::new()
    }

    fn on_rollback(&mut self) {
        while let Some(entry) = self.journal.pop() {
            match self.stager.restore(&entry) {
                Ok(()) => tracing::info!(address = %entry.target, "rolled back content change"),
                Err(err) => tracing::error!(
                    address = %entry.target,
                    error = %err,
                    "failed to roll back content change"
                ),
            }
        }
    }
}
