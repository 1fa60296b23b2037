//! Session layout and raw data sources
//!
//! A session directory looks like:
//!
//! ```text
//! <session>/
//!   info.json
//!   device_0/data/freq.db
//!   device_0/data/task.db
//!   device_1/data/...
//!   host/data/api.db
//! ```
//!
//! Raw databases are opened read-only. A missing file is `NotExist` (the
//! optional counter simply was not collected); a file that exists but cannot
//! be opened or lacks an expected table is `Failed`.

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};

const DEVICE_DIR_PREFIX: &str = "device_";
const HOST_DIR: &str = "host";
const DATA_DIR: &str = "data";

// =============================================================================
// SESSION LAYOUT
// =============================================================================

/// One device's raw data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDir {
    pub device_id: u32,
    pub path: PathBuf,
}

impl DeviceDir {
    /// Path of a raw database under this device.
    pub fn db_path(&self, file_name: &str) -> PathBuf {
        self.path.join(DATA_DIR).join(file_name)
    }
}

/// A closed collection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub path: PathBuf,
    pub devices: Vec<DeviceDir>,
    pub host: Option<PathBuf>,
}

impl Session {
    /// Enumerate device and host directories of a session.
    pub fn discover(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut devices = Vec::new();
        let mut host = None;

        let entries = std::fs::read_dir(&path)
            .with_context(|| format!("Failed to list session {}", path.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == HOST_DIR {
                host = Some(entry.path());
            } else if let Some(id) = name.strip_prefix(DEVICE_DIR_PREFIX) {
                match id.parse::<u32>() {
                    Ok(device_id) => devices.push(DeviceDir {
                        device_id,
                        path: entry.path(),
                    }),
                    Err(_) => debug!(dir = %name, "Ignoring non-numeric device directory"),
                }
            }
        }
        devices.sort_by_key(|d| d.device_id);

        Ok(Self { path, devices, host })
    }

    pub fn device(&self, device_id: u32) -> Option<&DeviceDir> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    /// Path of a raw database under the host directory.
    pub fn host_db_path(&self, file_name: &str) -> Option<PathBuf> {
        self.host.as_ref().map(|h| h.join(DATA_DIR).join(file_name))
    }
}

// =============================================================================
// SOURCE CHECKS
// =============================================================================

/// Result of probing a raw data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Success,
    NotExist,
    Failed,
}

impl SourceStatus {
    /// Combine per-source statuses: any failure wins, then any success.
    pub fn combine(statuses: impl IntoIterator<Item = SourceStatus>) -> SourceStatus {
        let mut combined = SourceStatus::NotExist;
        for status in statuses {
            match status {
                SourceStatus::Failed => return SourceStatus::Failed,
                SourceStatus::Success => combined = SourceStatus::Success,
                SourceStatus::NotExist => {}
            }
        }
        combined
    }
}

/// Probe a raw database for the tables a processor needs.
pub fn check_source(db_path: &Path, tables: &[&str]) -> SourceStatus {
    if !db_path.exists() {
        return SourceStatus::NotExist;
    }
    let conn = match open_raw(db_path) {
        Ok(conn) => conn,
        Err(e) => {
            warn!(source = %db_path.display(), error = %e, "Raw source unreadable");
            return SourceStatus::Failed;
        }
    };
    for table in tables {
        match table_exists(&conn, table) {
            Ok(true) => {}
            Ok(false) => {
                warn!(source = %db_path.display(), table, "Raw source missing expected table");
                return SourceStatus::Failed;
            }
            Err(e) => {
                warn!(source = %db_path.display(), error = %e, "Raw source unreadable");
                return SourceStatus::Failed;
            }
        }
    }
    SourceStatus::Success
}

/// Open a raw database read-only.
pub fn open_raw(db_path: &Path) -> PipelineResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(db_path, flags)
        .map_err(|e| PipelineError::corrupt(db_path, e))?;
    // Opening is lazy; force a read so a non-database file fails here.
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map_err(|e| PipelineError::corrupt(db_path, e))?;
    Ok(conn)
}

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Column names of a raw table in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let stmt = conn.prepare(&format!("SELECT * FROM \"{}\" LIMIT 0", table))?;
    Ok(stmt.column_names().into_iter().map(String::from).collect())
}

// =============================================================================
// DYNAMIC SCHEMA GATE
// =============================================================================

/// Discover the dynamic column set of `table` across several sources.
///
/// Columns listed in `fixed` are excluded. Every source must expose the same
/// set of remaining columns (order may differ); otherwise the sources cannot
/// be pivoted together and the whole set is rejected. Returns the dynamic
/// columns in the first source's order.
pub fn verify_schema(sources: &[PathBuf], table: &str, fixed: &[&str]) -> PipelineResult<Vec<String>> {
    let mut reference: Option<(PathBuf, Vec<String>, BTreeSet<String>)> = None;

    for source in sources {
        let conn = open_raw(source)?;
        let columns: Vec<String> = table_columns(&conn, table)
            .map_err(|e| PipelineError::corrupt(source, e))?
            .into_iter()
            .filter(|c| !fixed.contains(&c.as_str()))
            .collect();
        let set: BTreeSet<String> = columns.iter().cloned().collect();

        match &reference {
            None => reference = Some((source.clone(), columns, set)),
            Some((first, _, first_set)) if *first_set != set => {
                let missing: Vec<&String> = first_set.difference(&set).collect();
                let extra: Vec<&String> = set.difference(first_set).collect();
                return Err(PipelineError::corrupt(
                    source,
                    format!(
                        "column set of {} differs from {}: missing {:?}, extra {:?}",
                        table,
                        first.display(),
                        missing,
                        extra
                    ),
                ));
            }
            Some(_) => {}
        }
    }

    Ok(reference.map(|(_, columns, _)| columns).unwrap_or_default())
}

// =============================================================================
// FIELD COERCION
// =============================================================================

/// Coerce a raw cell to an unsigned integer. Text holding a number is accepted.
pub fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(v) => u64::try_from(*v).ok(),
        Value::Real(v) if v.is_finite() && *v >= 0.0 && v.fract() == 0.0 => Some(*v as u64),
        Value::Text(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Coerce a raw cell to a finite float.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Integer(v) => *v as f64,
        Value::Real(v) => *v,
        Value::Text(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

/// Coerce a raw cell to a u32 id.
pub fn value_as_u32(value: &Value) -> Option<u32> {
    value_as_u64(value).and_then(|v| u32::try_from(v).ok())
}

pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s.clone()),
        Value::Integer(v) => Some(v.to_string()),
        _ => None,
    }
}

/// Read every row of a query as raw values.
pub fn read_rows(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<Vec<Value>>> {
    let mut stmt = conn.prepare(sql)?;
    let width = stmt.column_count();
    let rows = stmt
        .query_map([], |row| (0..width).map(|i| row.get::<_, Value>(i)).collect())?
        .collect::<rusqlite::Result<Vec<Vec<Value>>>>()?;
    Ok(rows)
}
