#![forbid(unsafe_code)]

use pl_core::ids::{EntityId, TempKey};
use pl_sync::error::SyncError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanRow {
    pub id: EntityId,
    pub revision: i64,
    pub subject: String,
    /// ISO dates (`YYYY-MM-DD`).
    pub approval_date: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub has_committee: Option<bool>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanFileRow {
    pub id: EntityId,
    pub plan_id: EntityId,
    /// Per-plan number, 1..=999; also the key of the stored content.
    pub file_no: i64,
    pub file_name: String,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlanCreateRequest {
    pub subject: String,
    pub approval_date: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub has_committee: Option<bool>,
}

/// `None` fields are left unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlanUpdateRequest {
    pub expected_revision: Option<i64>,
    pub subject: Option<String>,
    pub approval_date: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub has_committee: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanFileAddRequest {
    pub file_name: String,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    /// Staged content to promote when the change is flushed.
    pub temp_key: Option<TempKey>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlanFileReplaceRequest {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    /// New content; without it only the metadata changes.
    pub temp_key: Option<TempKey>,
}

/// Outcome of a successful relational commit.
#[derive(Debug, Default)]
pub struct CommitSummary {
    /// Failures of post-commit side effects. The commit itself stands.
    pub side_effect_errors: Vec<SyncError>,
}

impl CommitSummary {
    pub fn is_clean(&self) -> bool {
        self.side_effect_errors.is_empty()
    }
}
