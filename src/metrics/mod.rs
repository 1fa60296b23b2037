//! Metric Processors
//!
//! One `Processor` per report table. Each reads a metric-specific raw
//! database per device (or from the host directory), aligns timestamps onto
//! the host epoch and emits canonical rows.
//!
//! | processor | raw table(s)                  | report table(s)         |
//! |-----------|-------------------------------|-------------------------|
//! | `freq`    | `freq_event`                  | `freq`                  |
//! | `task`    | `engine_task`, `marker_event` | `task`                  |
//! | `pmu`     | `task_pmu` or `sample_pmu`    | `pmu_task`/`pmu_sample` |
//! | `memory`  | `mem_sample`                  | `memory`                |
//! | `api`     | `api_event` (host)            | `api`                   |
//! | `comm`    | `link_event`                  | `comm`                  |

pub mod api;
pub mod comm;
pub mod freq;
pub mod memory;
pub mod pmu;
pub mod task;

use rusqlite::types::Value;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::source::{
    check_source, open_raw, read_rows, value_as_f64, value_as_u32, value_as_u64, value_as_string,
};
use crate::pipeline::{DeviceDir, ProcessorContext, ProcessorRegistry, Session, SourceStatus};
use crate::timesync::{CalibrationParams, SessionWindow};

pub use api::ApiProcessor;
pub use comm::CommProcessor;
pub use freq::FreqProcessor;
pub use memory::MemoryProcessor;
pub use pmu::PmuProcessor;
pub use task::TaskProcessor;

/// Registry holding every built-in processor.
pub fn default_registry() -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();
    registry.register(Arc::new(FreqProcessor));
    registry.register(Arc::new(TaskProcessor));
    registry.register(Arc::new(PmuProcessor));
    registry.register(Arc::new(MemoryProcessor));
    registry.register(Arc::new(ApiProcessor));
    registry.register(Arc::new(CommProcessor));
    registry
}

// =============================================================================
// DEVICE SOURCES
// =============================================================================

/// One device's raw rows plus the calibration needed to align them.
#[derive(Debug, Clone)]
pub struct DeviceRaw {
    pub device_id: u32,
    pub calibration: CalibrationParams,
    pub window: SessionWindow,
    pub rows: Vec<Vec<Value>>,
}

/// Combined status of one raw file across every device of a session.
pub(crate) fn check_devices(session: &Session, file_name: &str, tables: &[&str]) -> SourceStatus {
    SourceStatus::combine(
        session
            .devices
            .iter()
            .map(|device| check_source(&device.db_path(file_name), tables)),
    )
}

/// Read one device's raw table. `None` when the device has no such file.
pub(crate) fn read_device(
    ctx: &ProcessorContext,
    session: &Session,
    device: &DeviceDir,
    file_name: &str,
    sql: &str,
) -> PipelineResult<Option<DeviceRaw>> {
    let path = device.db_path(file_name);
    if !path.exists() {
        return Ok(None);
    }
    let calibration = ctx.calibration(session, device.device_id)?;
    let window = ctx.window(session, Some(device.device_id))?;
    let rows = query_raw(&path, sql)?;
    debug!(
        device_id = device.device_id,
        source = %path.display(),
        rows = rows.len(),
        "Read raw rows"
    );
    Ok(Some(DeviceRaw {
        device_id: device.device_id,
        calibration,
        window,
        rows,
    }))
}

/// Read every device that has `file_name`.
pub(crate) fn read_devices(
    ctx: &ProcessorContext,
    session: &Session,
    file_name: &str,
    sql: &str,
) -> PipelineResult<Vec<DeviceRaw>> {
    let mut devices = Vec::new();
    for device in &session.devices {
        if let Some(raw) = read_device(ctx, session, device, file_name, sql)? {
            devices.push(raw);
        }
    }
    Ok(devices)
}

pub(crate) fn query_raw(path: &Path, sql: &str) -> PipelineResult<Vec<Vec<Value>>> {
    let conn = open_raw(path)?;
    read_rows(&conn, sql).map_err(|e| PipelineError::corrupt(path, e))
}

// =============================================================================
// ROW-LEVEL VIOLATIONS
// =============================================================================

/// Skipped rows logged individually before switching to debug level.
const WARN_LIMIT: usize = 5;

/// Collects row-level violations for one table in one session.
///
/// Field accessors return `None` (and record a violation) when a cell cannot
/// be coerced; callers short-circuit with `?` so a row counts once.
#[derive(Debug)]
pub(crate) struct RowIssues {
    table: &'static str,
    skipped: usize,
}

impl RowIssues {
    pub fn new(table: &'static str) -> Self {
        Self { table, skipped: 0 }
    }

    pub fn skip(&mut self, field: &'static str, reason: impl fmt::Display) {
        let err = PipelineError::TransformInvariantViolation {
            table: self.table,
            field,
            reason: reason.to_string(),
        };
        self.skipped += 1;
        if self.skipped <= WARN_LIMIT {
            warn!(table = self.table, kind = err.kind(), error = %err, "Skipping row");
        } else {
            debug!(table = self.table, kind = err.kind(), error = %err, "Skipping row");
        }
    }

    pub fn u64_at(&mut self, row: &[Value], idx: usize, field: &'static str) -> Option<u64> {
        let value = cell(row, idx);
        let parsed = value_as_u64(value);
        if parsed.is_none() {
            self.skip(field, format_args!("expected unsigned integer, got {:?}", value));
        }
        parsed
    }

    pub fn u32_at(&mut self, row: &[Value], idx: usize, field: &'static str) -> Option<u32> {
        let value = cell(row, idx);
        let parsed = value_as_u32(value);
        if parsed.is_none() {
            self.skip(field, format_args!("expected 32-bit id, got {:?}", value));
        }
        parsed
    }

    pub fn f64_at(&mut self, row: &[Value], idx: usize, field: &'static str) -> Option<f64> {
        let value = cell(row, idx);
        let parsed = value_as_f64(value);
        if parsed.is_none() {
            self.skip(field, format_args!("expected finite number, got {:?}", value));
        }
        parsed
    }

    pub fn text_at(&mut self, row: &[Value], idx: usize, field: &'static str) -> Option<String> {
        let value = cell(row, idx);
        let parsed = value_as_string(value);
        if parsed.is_none() {
            self.skip(field, format_args!("expected text, got {:?}", value));
        }
        parsed
    }

    /// Summarize once the session's rows are transformed.
    pub fn finish(self, session: &Path) {
        if self.skipped > WARN_LIMIT {
            warn!(
                table = self.table,
                session = %session.display(),
                skipped = self.skipped,
                "Rows skipped during transform"
            );
        }
    }
}

fn cell(row: &[Value], idx: usize) -> &Value {
    row.get(idx).unwrap_or(&Value::Null)
}

/// Report integers are SQLite INTEGER (i64); ids keep their bit pattern.
pub(crate) fn int(value: u64) -> Value {
    Value::Integer(value as i64)
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Session fixtures shared by processor tests.

    use super::*;
    use crate::catalog::{DeviceRecord, JsonSessionCatalog, SessionInfo};
    use crate::config::AnalysisConfig;
    use crate::identity::IdentityRegistry;
    use crate::report::ReportDatabase;
    use rusqlite::Connection;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    /// 100 MHz counter anchored at host time 1_000_000_000_000.
    pub fn calibration() -> CalibrationParams {
        CalibrationParams {
            anchor_device_ticks: 484_500_000_000_000,
            anchor_host_time_ns: 1_000_000_000_000,
            tick_frequency_hz: 100e6,
            host_monotonic_anchor: 1_000_000_000_000,
            device_monotonic_anchor: 5_000_000,
        }
    }

    /// Host time for a tick under `calibration()`.
    pub fn host_ns(ticks: u64) -> u64 {
        1_000_000_000_000 + (ticks - 484_500_000_000_000) * 10
    }

    pub struct Fixture {
        pub dir: tempfile::TempDir,
        pub ctx: ProcessorContext,
    }

    impl Fixture {
        pub fn path(&self) -> PathBuf {
            self.dir.path().to_path_buf()
        }

        pub fn device_db(&self, device_id: u32, file_name: &str, sql: &str) {
            let path = self
                .dir
                .path()
                .join(format!("device_{}", device_id))
                .join("data")
                .join(file_name);
            make_db(&path, sql);
        }

        pub fn host_db(&self, file_name: &str, sql: &str) {
            make_db(&self.dir.path().join("host").join("data").join(file_name), sql);
        }

        pub fn device_dir(&self, device_id: u32) {
            std::fs::create_dir_all(self.dir.path().join(format!("device_{}", device_id)).join("data"))
                .unwrap();
        }
    }

    pub fn make_db(path: &Path, sql: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(sql).unwrap();
    }

    pub fn context(config: AnalysisConfig) -> ProcessorContext {
        ProcessorContext::new(
            Arc::new(IdentityRegistry::new()),
            Arc::new(ReportDatabase::open_memory().unwrap()),
            Arc::new(JsonSessionCatalog::new()),
            Arc::new(config),
        )
    }

    /// Session with calibrated devices and the given window.
    pub fn fixture(devices: &[u32], window: SessionWindow) -> Fixture {
        fixture_with(devices, window, AnalysisConfig::default())
    }

    pub fn fixture_with(devices: &[u32], window: SessionWindow, config: AnalysisConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut records = BTreeMap::new();
        for &id in devices {
            records.insert(
                id,
                DeviceRecord {
                    platform_version: "chip-a".to_string(),
                    calibration: calibration(),
                    window: None,
                },
            );
        }
        SessionInfo {
            window,
            devices: records,
        }
        .save(dir.path())
        .unwrap();
        Fixture {
            dir,
            ctx: context(config),
        }
    }
}
