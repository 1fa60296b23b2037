//! Report Database
//!
//! The single shared output of a run: one table per metric, plus a string
//! dictionary and a run log.
//!
//! - Tables are created from a fixed schema descriptor (idempotent)
//! - Each `save_canonical` call is one transaction, so a session's rows
//!   appear all at once or not at all
//! - Append-only: rows are never updated in place

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::identity::IdentityRegistry;

const REPORT_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

const REPORT_META_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS string_ids (
    id INTEGER PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    processor TEXT NOT NULL,
    ok INTEGER NOT NULL,
    sessions INTEGER NOT NULL,
    finished_at TEXT NOT NULL
);
"#;

/// A canonical output row, in schema column order.
pub type CanonicalRow = Vec<Value>;

// =============================================================================
// SCHEMA DESCRIPTORS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    fn sql(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

impl Column {
    pub const fn integer(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Integer,
        }
    }

    pub const fn real(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Real,
        }
    }

    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Text,
        }
    }
}

/// Fixed output schema of one report table. Column order is part of the
/// output contract.
#[derive(Debug, Clone, Copy)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static [Column],
}

impl TableSchema {
    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.ty.sql()))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.name,
            columns.join(", ")
        )
    }

    pub fn insert_sql(&self) -> String {
        let names: Vec<&str> = self.columns.iter().map(|c| c.name).collect();
        let placeholders: Vec<String> = (1..=self.columns.len()).map(|i| format!("?{}", i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.name,
            names.join(", "),
            placeholders.join(", ")
        )
    }
}

// =============================================================================
// REPORT DATABASE
// =============================================================================

/// Shared report database handle.
pub struct ReportDatabase {
    conn: Mutex<Connection>,
    rows_written: AtomicU64,
    batches_written: AtomicU64,
}

impl ReportDatabase {
    /// Open or create the report file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("Failed to open report database {}", path.display()))?;
        conn.execute_batch(REPORT_PRAGMAS)
            .context("Failed to apply report pragmas")?;

        info!(path = %path.display(), "Report database opened");
        Self::from_connection(conn)
    }

    /// In-memory report, for tests.
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(REPORT_META_SCHEMA)
            .context("Failed to initialize report metadata tables")?;
        Ok(Self {
            conn: Mutex::new(conn),
            rows_written: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
        })
    }

    /// Create `schema`'s table if needed and append `rows` atomically.
    ///
    /// An empty batch is a save failure: it would otherwise pass for a
    /// session that produced nothing.
    pub fn save_canonical(&self, schema: &TableSchema, rows: &[CanonicalRow]) -> PipelineResult<usize> {
        if rows.is_empty() {
            return Err(PipelineError::save(schema.name, "no rows to save"));
        }
        if let Some(bad) = rows.iter().find(|r| r.len() != schema.columns.len()) {
            return Err(PipelineError::save(
                schema.name,
                format!("row has {} values, schema has {} columns", bad.len(), schema.columns.len()),
            ));
        }

        let mut conn = self.conn.lock();
        let written = Self::insert_batch(&mut conn, schema, rows)
            .map_err(|e| PipelineError::save(schema.name, format!("{:#}", e)))?;

        self.rows_written.fetch_add(written as u64, Ordering::Relaxed);
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        debug!(table = schema.name, rows = written, "Saved canonical batch");
        Ok(written)
    }

    fn insert_batch(conn: &mut Connection, schema: &TableSchema, rows: &[CanonicalRow]) -> Result<usize> {
        let tx = conn.transaction()?;
        tx.execute(&schema.create_sql(), [])
            .with_context(|| format!("create table {}", schema.name))?;
        {
            let mut stmt = tx.prepare_cached(&schema.insert_sql())?;
            for row in rows {
                stmt.execute(params_from_iter(row.iter()))?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Persist the registry's string dictionary (replacing earlier snapshots).
    pub fn write_string_dictionary(&self, registry: &IdentityRegistry) -> Result<usize> {
        let strings = registry.snapshot_strings();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("INSERT OR REPLACE INTO string_ids (id, value) VALUES (?1, ?2)")?;
            for (id, value) in &strings {
                stmt.execute(params![*id as i64, value])?;
            }
        }
        tx.commit()?;
        Ok(strings.len())
    }

    /// Record one processor's aggregate verdict.
    pub fn record_run(&self, processor: &str, ok: bool, sessions: usize) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO run_log (processor, ok, sessions, finished_at) VALUES (?1, ?2, ?3, ?4)",
            params![processor, ok as i64, sessions as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Row count of a table; 0 if it was never created.
    pub fn row_count(&self, table: &str) -> Result<u64> {
        let conn = self.conn.lock();
        if !Self::table_exists(&conn, table)? {
            return Ok(0);
        }
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Column names of a table in declaration order.
    pub fn column_names(&self, table: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let stmt = conn.prepare(&format!("SELECT * FROM {} LIMIT 0", table))?;
        Ok(stmt.column_names().into_iter().map(String::from).collect())
    }

    /// All rows of a table as raw values, ordered by rowid.
    pub fn dump_table(&self, table: &str) -> Result<Vec<Vec<Value>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY rowid", table))?;
        let width = stmt.column_count();
        let rows = stmt
            .query_map([], |row| (0..width).map(|i| row.get::<_, Value>(i)).collect())?
            .collect::<rusqlite::Result<Vec<Vec<Value>>>>()?;
        Ok(rows)
    }

    fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn summary(&self) -> String {
        format!(
            "rows={}, batches={}",
            self.rows_written.load(Ordering::Relaxed),
            self.batches_written.load(Ordering::Relaxed),
        )
    }
}
