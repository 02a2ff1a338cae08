#![forbid(unsafe_code)]

use super::*;
use pl_core::content::MAX_CHILD_ID;
use pl_core::ids::TempKey;
use pl_core::model::{AttachmentChange, EntityChange};
use pl_sync::error::SyncError;
use rusqlite::Transaction;

/// One relational transaction plus the hooks that observe it.
///
/// Every statement reports its change to the hooks right after it executes,
/// while the transaction is still open; a hook error rolls everything back.
/// `commit` runs the after-commit hooks only once the relational commit has
/// succeeded. Dropping an unfinished unit of work rolls it back.
pub struct UnitOfWork<'a> {
    tx: Option<Transaction<'a>>,
    hooks: &'a mut dyn UnitOfWorkHooks,
    kinds: EntityKinds,
}

impl<'a> UnitOfWork<'a> {
    pub(super) fn new(
        tx: Transaction<'a>,
        hooks: &'a mut dyn UnitOfWorkHooks,
        kinds: EntityKinds,
    ) -> Self {
        Self {
            tx: Some(tx),
            hooks,
            kinds,
        }
    }

    pub fn plan_create(&mut self, request: PlanCreateRequest) -> Result<PlanRow, StoreError> {
        let subject = normalize_subject(&request.subject)?;
        let approval_date = normalize_date(request.approval_date.as_deref())?;
        let start_date = normalize_date(request.start_date.as_deref())?;
        let end_date = normalize_date(request.end_date.as_deref())?;
        let now_ms = now_ms();

        let tx = self.tx()?;
        tx.execute(
            r#"
            INSERT INTO plans(revision, subject, approval_date, start_date, end_date, has_committee, created_at_ms, updated_at_ms)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
            params![
                subject,
                approval_date,
                start_date,
                end_date,
                request.has_committee,
                now_ms
            ],
        )?;
        let id = tx.last_insert_rowid();
        let row = plan_row(tx, id)?.ok_or(StoreError::UnknownPlan(id))?;

        let change = EntityChange::row(self.kinds.plan.clone(), id);
        self.flush(|hooks| hooks.on_entity_created(&change))?;
        Ok(row)
    }

    pub fn plan_update(
        &mut self,
        id: EntityId,
        request: PlanUpdateRequest,
    ) -> Result<PlanRow, StoreError> {
        let subject = request.subject.as_deref().map(normalize_subject).transpose()?;
        let approval_date = normalize_date(request.approval_date.as_deref())?;
        let start_date = normalize_date(request.start_date.as_deref())?;
        let end_date = normalize_date(request.end_date.as_deref())?;
        let now_ms = now_ms();

        let tx = self.tx()?;
        let current = plan_row(tx, id)?.ok_or(StoreError::UnknownPlan(id))?;
        if let Some(expected) = request.expected_revision {
            if expected != current.revision {
                return Err(StoreError::RevisionMismatch {
                    expected,
                    actual: current.revision,
                });
            }
        }

        tx.execute(
            r#"
            UPDATE plans
            SET revision=?2, subject=?3, approval_date=?4, start_date=?5, end_date=?6, has_committee=?7, updated_at_ms=?8
            WHERE id=?1
            "#,
            params![
                id,
                current.revision + 1,
                subject.unwrap_or(current.subject),
                approval_date.or(current.approval_date),
                start_date.or(current.start_date),
                end_date.or(current.end_date),
                request.has_committee.or(current.has_committee),
                now_ms.max(current.updated_at_ms),
            ],
        )?;
        let row = plan_row(tx, id)?.ok_or(StoreError::UnknownPlan(id))?;

        let change = EntityChange::row(self.kinds.plan.clone(), id);
        self.flush(|hooks| hooks.on_entity_updated(&change))?;
        Ok(row)
    }

    /// Deletes the plan and its files; each file removal is reported first.
    pub fn plan_delete(&mut self, id: EntityId) -> Result<(), StoreError> {
        let tx = self.tx()?;
        if plan_row(tx, id)?.is_none() {
            return Err(StoreError::UnknownPlan(id));
        }
        let files = plan_file_rows(tx, id)?;

        for file in files {
            self.plan_file_delete(id, file.file_no)?;
        }

        self.tx()?
            .execute("DELETE FROM plans WHERE id=?1", params![id])?;
        let change = EntityChange::row(self.kinds.plan.clone(), id);
        self.flush(|hooks| hooks.on_entity_deleted(&change))?;
        Ok(())
    }

    /// Adds a file under the next free number of the plan.
    pub fn plan_file_add(
        &mut self,
        plan_id: EntityId,
        request: PlanFileAddRequest,
    ) -> Result<PlanFileRow, StoreError> {
        let file_name = normalize_file_name(&request.file_name)?;
        let now_ms = now_ms();

        let tx = self.tx()?;
        if plan_row(tx, plan_id)?.is_none() {
            return Err(StoreError::UnknownPlan(plan_id));
        }
        let file_no: i64 = tx.query_row(
            "SELECT COALESCE(MAX(file_no), 0) + 1 FROM plan_files WHERE plan_id=?1",
            params![plan_id],
            |row| row.get(0),
        )?;
        if file_no > MAX_CHILD_ID {
            return Err(StoreError::TooManyFiles {
                plan_id,
                max: MAX_CHILD_ID,
            });
        }

        tx.execute(
            r#"
            INSERT INTO plan_files(plan_id, file_no, file_name, content_type, size_bytes, created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
            params![
                plan_id,
                file_no,
                file_name,
                request.content_type,
                request.size_bytes,
                now_ms
            ],
        )?;
        let row = plan_file_row(tx, plan_id, file_no)?.ok_or(StoreError::UnknownFile {
            plan_id,
            file_no,
        })?;
        touch_plan(tx, plan_id, now_ms)?;

        let change = self.file_change(&row, request.temp_key);
        self.flush(|hooks| hooks.on_entity_created(&change))?;
        self.plan_changed(plan_id)?;
        Ok(row)
    }

    pub fn plan_file_replace(
        &mut self,
        plan_id: EntityId,
        file_no: i64,
        request: PlanFileReplaceRequest,
    ) -> Result<PlanFileRow, StoreError> {
        let file_name = request
            .file_name
            .as_deref()
            .map(normalize_file_name)
            .transpose()?;
        let now_ms = now_ms();

        let tx = self.tx()?;
        let current = plan_file_row(tx, plan_id, file_no)?
            .ok_or(StoreError::UnknownFile { plan_id, file_no })?;
        tx.execute(
            r#"
            UPDATE plan_files
            SET file_name=?3, content_type=?4, size_bytes=?5, updated_at_ms=?6
            WHERE plan_id=?1 AND file_no=?2
            "#,
            params![
                plan_id,
                file_no,
                file_name.unwrap_or(current.file_name),
                request.content_type.or(current.content_type),
                request.size_bytes.or(current.size_bytes),
                now_ms.max(current.updated_at_ms),
            ],
        )?;
        let row = plan_file_row(tx, plan_id, file_no)?
            .ok_or(StoreError::UnknownFile { plan_id, file_no })?;
        touch_plan(tx, plan_id, now_ms)?;

        let change = self.file_change(&row, request.temp_key);
        self.flush(|hooks| hooks.on_entity_updated(&change))?;
        self.plan_changed(plan_id)?;
        Ok(row)
    }

    pub fn plan_file_delete(&mut self, plan_id: EntityId, file_no: i64) -> Result<(), StoreError> {
        let now_ms = now_ms();
        let tx = self.tx()?;
        let row = plan_file_row(tx, plan_id, file_no)?
            .ok_or(StoreError::UnknownFile { plan_id, file_no })?;
        tx.execute(
            "DELETE FROM plan_files WHERE plan_id=?1 AND file_no=?2",
            params![plan_id, file_no],
        )?;
        touch_plan(tx, plan_id, now_ms)?;

        let change = self.file_change(&row, None);
        self.flush(|hooks| hooks.on_entity_deleted(&change))?;
        self.plan_changed(plan_id)?;
        Ok(())
    }

    /// Commits the relational transaction, then runs the after-commit hooks.
    /// Their failures land in the summary; the commit itself stands.
    pub fn commit(mut self) -> Result<CommitSummary, StoreError> {
        if self.tx.is_none() {
            return Err(StoreError::Finished);
        }
        if let Err(err) = self.hooks.on_before_commit() {
            self.abort();
            return Err(err.into());
        }

        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        if let Err(err) = tx.commit() {
            self.hooks.on_rollback();
            return Err(err.into());
        }

        let side_effect_errors = self.hooks.on_after_commit();
        for err in &side_effect_errors {
            tracing::warn!(error = %err, "post-commit side effect failed");
        }
        Ok(CommitSummary { side_effect_errors })
    }

    pub fn rollback(mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        let result = tx.rollback();
        self.hooks.on_rollback();
        Ok(result?)
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    fn tx(&self) -> Result<&Transaction<'a>, StoreError> {
        self.tx.as_ref().ok_or(StoreError::Finished)
    }

    fn file_change(&self, row: &PlanFileRow, temp_key: Option<TempKey>) -> EntityChange {
        EntityChange::row(self.kinds.plan_file.clone(), row.id).with_attachment(AttachmentChange {
            owner_id: row.plan_id,
            child_id: row.file_no,
            temp_key,
        })
    }

    /// The plan document embeds its files, so a file change re-indexes the plan.
    fn plan_changed(&mut self, plan_id: EntityId) -> Result<(), StoreError> {
        let change = EntityChange::row(self.kinds.plan.clone(), plan_id);
        self.flush(|hooks| hooks.on_entity_updated(&change))
    }

    fn flush(
        &mut self,
        notify: impl FnOnce(&mut (dyn UnitOfWorkHooks + 'a)) -> Result<(), SyncError>,
    ) -> Result<(), StoreError> {
        if let Err(err) = notify(&mut *self.hooks) {
            tracing::warn!(error = %err, "flush hook failed, rolling back");
            self.abort();
            return Err(err.into());
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(err) = tx.rollback() {
                tracing::error!(error = %err, "rollback failed");
            }
            self.hooks.on_rollback();
        }
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::debug!("unit of work dropped before commit, rolling back");
            self.abort();
        }
    }
}

fn touch_plan(tx: &Transaction<'_>, plan_id: EntityId, now_ms: i64) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE plans SET revision=revision + 1, updated_at_ms=MAX(updated_at_ms, ?2) WHERE id=?1",
        params![plan_id, now_ms],
    )?;
    Ok(())
}
