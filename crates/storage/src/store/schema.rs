#![forbid(unsafe_code)]

use super::StoreError;
use rusqlite::{Connection, params};

const SCHEMA_VERSION: &str = "1";

const SQL: &str = r#"
        PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS plans (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          revision INTEGER NOT NULL,
          subject TEXT NOT NULL,
          approval_date TEXT,
          start_date TEXT,
          end_date TEXT,
          has_committee INTEGER,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS plan_files (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          plan_id INTEGER NOT NULL REFERENCES plans(id),
          file_no INTEGER NOT NULL,
          file_name TEXT NOT NULL,
          content_type TEXT,
          size_bytes INTEGER,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          UNIQUE (plan_id, file_no)
        );

        CREATE TABLE IF NOT EXISTS index_jobs (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id TEXT NOT NULL UNIQUE,
          queue_name TEXT NOT NULL,
          delegate TEXT NOT NULL,
          priority TEXT NOT NULL,
          payload_json TEXT NOT NULL,
          status TEXT NOT NULL,
          attempts INTEGER NOT NULL DEFAULT 0,
          worker TEXT,
          claim_expires_at_ms INTEGER,
          last_error TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_plan_files_plan ON plan_files(plan_id, file_no);
        CREATE INDEX IF NOT EXISTS idx_index_jobs_claim ON index_jobs(queue_name, status, priority, seq);
"#;

pub(super) fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION],
    )?;
    Ok(())
}
