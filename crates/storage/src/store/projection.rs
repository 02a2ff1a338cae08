#![forbid(unsafe_code)]

use super::*;
use parking_lot::Mutex;
use pl_core::content::ContentAddress;
use pl_sync::clients::DocumentProjector;
use pl_sync::error::ProjectionError;
use serde_json::{Value as JsonValue, json};

/// Builds search documents from committed plan rows.
pub struct PlanProjector {
    conn: Mutex<Connection>,
}

impl PlanProjector {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = open_connection(storage_dir.as_ref())?;
        schema::install_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load(&self, id: EntityId) -> rusqlite::Result<Option<(PlanRow, Vec<PlanFileRow>)>> {
        let conn = self.conn.lock();
        let Some(plan) = plan_row(&conn, id)? else {
            return Ok(None);
        };
        let files = plan_file_rows(&conn, id)?;
        Ok(Some((plan, files)))
    }
}

impl DocumentProjector for PlanProjector {
    fn project(&self, id: EntityId) -> Result<Option<JsonValue>, ProjectionError> {
        let loaded = self.load(id).map_err(|err| projection_error(id, err))?;
        Ok(loaded.map(|(plan, files)| plan_document(&plan, &files)))
    }

    fn project_attachments(&self, id: EntityId) -> Result<Option<JsonValue>, ProjectionError> {
        let loaded = self.load(id).map_err(|err| projection_error(id, err))?;
        Ok(loaded.map(|(plan, files)| {
            json!({
                "id": plan.id,
                "subject": plan.subject,
                "files": files
                    .iter()
                    .map(|file| {
                        let mut doc = file_document(file);
                        if let Ok(address) = ContentAddress::permanent(file.plan_id, file.file_no) {
                            doc["container"] = json!(address.container);
                            doc["key"] = json!(address.key);
                        }
                        doc
                    })
                    .collect::<Vec<_>>(),
            })
        }))
    }
}

pub(crate) fn plan_document(plan: &PlanRow, files: &[PlanFileRow]) -> JsonValue {
    json!({
        "id": plan.id,
        "subject": plan.subject,
        "approval_date": plan.approval_date,
        "start_date": plan.start_date,
        "end_date": plan.end_date,
        "has_committee": plan.has_committee,
        "files": files.iter().map(file_document).collect::<Vec<_>>(),
        "system_fields": {
            "revision": plan.revision,
            "created_at": ts_ms_to_rfc3339(plan.created_at_ms),
            "updated_at": ts_ms_to_rfc3339(plan.updated_at_ms),
        },
    })
}

fn file_document(file: &PlanFileRow) -> JsonValue {
    json!({
        "file_no": file.file_no,
        "file_name": file.file_name,
        "content_type": file.content_type,
        "size_bytes": file.size_bytes,
    })
}

fn projection_error(id: EntityId, err: rusqlite::Error) -> ProjectionError {
    ProjectionError {
        id,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_document_carries_files_and_system_fields() {
        let plan = PlanRow {
            id: 10,
            revision: 3,
            subject: "Beheersplan park".to_string(),
            approval_date: Some("2024-03-01".to_string()),
            start_date: None,
            end_date: None,
            has_committee: Some(true),
            created_at_ms: 0,
            updated_at_ms: 1_000,
        };
        let files = vec![PlanFileRow {
            id: 1,
            plan_id: 10,
            file_no: 3,
            file_name: "kaart.pdf".to_string(),
            content_type: Some("application/pdf".to_string()),
            size_bytes: Some(12),
            created_at_ms: 0,
            updated_at_ms: 0,
        }];

        let doc = plan_document(&plan, &files);
        assert_eq!(doc["id"], 10);
        assert_eq!(doc["files"][0]["file_no"], 3);
        assert_eq!(doc["system_fields"]["created_at"], "1970-01-01T00:00:00Z");
        assert_eq!(doc["system_fields"]["updated_at"], "1970-01-01T00:00:01Z");
    }
}
