#![forbid(unsafe_code)]

mod error;
mod projection;
mod queue;
mod requests;
mod schema;
mod unit_of_work;

pub use error::StoreError;
pub use projection::PlanProjector;
pub use queue::{ClaimedJob, DEFAULT_CLAIM_LEASE_MS, JobStatus, QueueCounts, SqliteJobQueue};
pub use requests::*;
pub use unit_of_work::UnitOfWork;

use pl_core::ids::{EntityId, EntityType};
use pl_sync::hooks::UnitOfWorkHooks;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

pub const PLAN_ENTITY: &str = "plan";
pub const PLAN_FILE_ENTITY: &str = "plan_file";
/// Operation name queued plan index jobs carry.
pub const PLAN_INDEX_DELEGATE: &str = "plan.index";

const DB_FILE_NAME: &str = "plans.db";
const MAX_SUBJECT_LEN: usize = 250;
const MAX_FILE_NAME_LEN: usize = 255;
const MAX_LIST_LIMIT: usize = 10_000;

/// Entity types the store reports to its hooks.
#[derive(Clone, Debug)]
pub struct EntityKinds {
    pub plan: EntityType,
    pub plan_file: EntityType,
}

impl EntityKinds {
    fn new() -> Result<Self, StoreError> {
        Ok(Self {
            plan: EntityType::try_new(PLAN_ENTITY)
                .map_err(|_| StoreError::InvalidInput("invalid plan entity type"))?,
            plan_file: EntityType::try_new(PLAN_FILE_ENTITY)
                .map_err(|_| StoreError::InvalidInput("invalid plan file entity type"))?,
        })
    }
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
    kinds: EntityKinds,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        let conn = open_connection(&storage_dir)?;
        schema::install_schema(&conn)?;

        Ok(Self {
            conn,
            storage_dir,
            kinds: EntityKinds::new()?,
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn kinds(&self) -> &EntityKinds {
        &self.kinds
    }

    /// Starts a unit of work whose row changes are reported to `hooks`.
    pub fn begin<'a>(
        &'a mut self,
        hooks: &'a mut dyn UnitOfWorkHooks,
    ) -> Result<UnitOfWork<'a>, StoreError> {
        let tx = self.conn.transaction()?;
        Ok(UnitOfWork::new(tx, hooks, self.kinds.clone()))
    }

    pub fn plan_get(&self, id: EntityId) -> Result<Option<PlanRow>, StoreError> {
        Ok(plan_row(&self.conn, id)?)
    }

    pub fn plan_files(&self, plan_id: EntityId) -> Result<Vec<PlanFileRow>, StoreError> {
        Ok(plan_file_rows(&self.conn, plan_id)?)
    }

    pub fn plan_file_get(
        &self,
        plan_id: EntityId,
        file_no: i64,
    ) -> Result<Option<PlanFileRow>, StoreError> {
        Ok(plan_file_row(&self.conn, plan_id, file_no)?)
    }

    /// Plan ids in ascending order, for paging through the whole table.
    pub fn plan_ids(&self, offset: usize, limit: usize) -> Result<Vec<EntityId>, StoreError> {
        let limit = to_sqlite_i64(limit.min(MAX_LIST_LIMIT))?;
        let offset = to_sqlite_i64(offset)?;
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM plans ORDER BY id ASC LIMIT ?1 OFFSET ?2")?;
        let ids = stmt
            .query_map(params![limit, offset], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn plan_count(&self) -> Result<usize, StoreError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(1) FROM plans", [], |row| row.get::<_, i64>(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

pub(crate) fn open_connection(storage_dir: &Path) -> Result<Connection, StoreError> {
    std::fs::create_dir_all(storage_dir)?;

    let conn = Connection::open(storage_dir.join(DB_FILE_NAME))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

const PLAN_COLUMNS: &str = "id, revision, subject, approval_date, start_date, end_date, has_committee, created_at_ms, updated_at_ms";
const PLAN_FILE_COLUMNS: &str =
    "id, plan_id, file_no, file_name, content_type, size_bytes, created_at_ms, updated_at_ms";

fn read_plan_row(row: &Row<'_>) -> rusqlite::Result<PlanRow> {
    Ok(PlanRow {
        id: row.get(0)?,
        revision: row.get(1)?,
        subject: row.get(2)?,
        approval_date: row.get(3)?,
        start_date: row.get(4)?,
        end_date: row.get(5)?,
        has_committee: row.get(6)?,
        created_at_ms: row.get(7)?,
        updated_at_ms: row.get(8)?,
    })
}

fn read_plan_file_row(row: &Row<'_>) -> rusqlite::Result<PlanFileRow> {
    Ok(PlanFileRow {
        id: row.get(0)?,
        plan_id: row.get(1)?,
        file_no: row.get(2)?,
        file_name: row.get(3)?,
        content_type: row.get(4)?,
        size_bytes: row.get(5)?,
        created_at_ms: row.get(6)?,
        updated_at_ms: row.get(7)?,
    })
}

fn plan_row(conn: &Connection, id: EntityId) -> rusqlite::Result<Option<PlanRow>> {
    conn.query_row(
        &format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id=?1"),
        params![id],
        read_plan_row,
    )
    .optional()
}

fn plan_file_row(
    conn: &Connection,
    plan_id: EntityId,
    file_no: i64,
) -> rusqlite::Result<Option<PlanFileRow>> {
    conn.query_row(
        &format!("SELECT {PLAN_FILE_COLUMNS} FROM plan_files WHERE plan_id=?1 AND file_no=?2"),
        params![plan_id, file_no],
        read_plan_file_row,
    )
    .optional()
}

fn plan_file_rows(conn: &Connection, plan_id: EntityId) -> rusqlite::Result<Vec<PlanFileRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PLAN_FILE_COLUMNS} FROM plan_files WHERE plan_id=?1 ORDER BY file_no ASC"
    ))?;
    let rows = stmt.query_map(params![plan_id], read_plan_file_row)?;
    rows.collect()
}

fn normalize_subject(raw: &str) -> Result<String, StoreError> {
    let subject = raw.trim();
    if subject.is_empty() {
        return Err(StoreError::InvalidInput("plan.subject must not be empty"));
    }
    if subject.chars().count() > MAX_SUBJECT_LEN {
        return Err(StoreError::InvalidInput("plan.subject is too long"));
    }
    Ok(subject.to_string())
}

fn normalize_file_name(raw: &str) -> Result<String, StoreError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(StoreError::InvalidInput("file.file_name must not be empty"));
    }
    if name.chars().count() > MAX_FILE_NAME_LEN {
        return Err(StoreError::InvalidInput("file.file_name is too long"));
    }
    Ok(name.to_string())
}

fn normalize_date(raw: Option<&str>) -> Result<Option<String>, StoreError> {
    let Some(raw) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let date = time::Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .map_err(|_| StoreError::InvalidInput("dates must be YYYY-MM-DD"))?;
    Ok(Some(date.to_string()))
}

fn to_sqlite_i64(value: usize) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidInput("numeric overflow"))
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}

fn ts_ms_to_rfc3339(ts_ms: i64) -> String {
    let nanos = (ts_ms as i128) * 1_000_000i128;
    let dt = OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    dt.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
