#![forbid(unsafe_code)]

use crate::ids::{EntityId, EntityType, JobId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Target settings forwarded verbatim to whoever applies a job.
pub type JobSettings = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    #[default]
    Normal,
    Front,
}

impl JobPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::Normal => "normal",
            JobPriority::Front => "front",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "normal" => Some(Self::Normal),
            "front" => Some(Self::Front),
            _ => None,
        }
    }
}

/// Immutable unit of dispatch for the search index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexJob {
    pub job_id: JobId,
    pub entity_type: EntityType,
    pub created: Vec<EntityId>,
    pub updated: Vec<EntityId>,
    pub deleted: Vec<EntityId>,
    /// Set on the attachment twin of a primary job.
    #[serde(default)]
    pub attachments: bool,
    #[serde(default)]
    pub settings: JobSettings,
}

impl IndexJob {
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy carrying only created/updated ids, addressed as `{job_id}_attachments`.
    pub fn attachment_twin(&self) -> Self {
        Self {
            job_id: self.job_id.with_suffix("attachments"),
            entity_type: self.entity_type.clone(),
            created: self.created.clone(),
            updated: self.updated.clone(),
            deleted: Vec::new(),
            attachments: true,
            settings: self.settings.clone(),
        }
    }
}
