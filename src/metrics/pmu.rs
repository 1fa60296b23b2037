//! PMU counters
//!
//! Two collection modes, picked by which raw table the devices carry:
//!
//! - **Task mode** (`task_pmu`): one row per task, one column per hardware
//!   counter. The counter set is discovered at read time and must agree
//!   across every device of the session; each non-NULL cell becomes a
//!   `(global_task_id, metric_name_id, value)` row.
//! - **Sample mode** (`sample_pmu`): periodic per-core cycle samples turned
//!   into utilization against the previous sample of the same core:
//!   `usage = cycles * scale / (freq_mhz * dt_us)`. The first sample of a
//!   core uses `dt_us = 1`; a vanishing or negative interval skips the
//!   sample.

use rusqlite::types::Value;
use std::collections::HashMap;
use tracing::debug;

use super::{check_devices, int, query_raw, DeviceRaw, RowIssues};
use crate::error::{PipelineError, PipelineResult};
use crate::identity::TaskKey;
use crate::pipeline::source::{open_raw, table_exists, value_as_f64};
use crate::pipeline::{
    verify_schema, CanonicalBatch, DeviceDir, Processor, ProcessorContext, Session, SourceStatus,
};
use crate::report::{CanonicalRow, Column, TableSchema};
use crate::timesync::{clamp_to_session, locate_in_window, ticks_to_host_ns, HpFloat, WindowPosition};

const PMU_DB: &str = "pmu.db";
const TASK_PMU: &str = "task_pmu";
const SAMPLE_PMU: &str = "sample_pmu";
const SAMPLE_SQL: &str = "SELECT core_id, syscnt, cycles FROM sample_pmu ORDER BY syscnt, rowid";

/// Key columns of `task_pmu`; every other column is a counter.
const TASK_KEY_COLUMNS: [&str; 4] = ["stream_id", "task_id", "subtask_id", "batch_id"];

pub static PMU_TASK_TABLE: TableSchema = TableSchema {
    name: "pmu_task",
    columns: &[
        Column::integer("global_task_id"),
        Column::integer("metric_name_id"),
        Column::real("value"),
    ],
};

pub static PMU_SAMPLE_TABLE: TableSchema = TableSchema {
    name: "pmu_sample",
    columns: &[
        Column::integer("device_id"),
        Column::integer("core_id"),
        Column::integer("timestamp_ns"),
        Column::real("usage"),
    ],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmuMode {
    Task,
    Sample,
}

#[derive(Debug, Clone)]
pub enum PmuRaw {
    Task {
        counters: Vec<String>,
        devices: Vec<DeviceRaw>,
    },
    Sample {
        devices: Vec<(DeviceRaw, u64)>,
    },
}

// =============================================================================
// UTILIZATION
// =============================================================================

/// Per-core sample-to-utilization state.
#[derive(Debug)]
pub struct UsageTracker {
    scale: f64,
    min_interval_us: f64,
    last_seen: HashMap<u32, HpFloat>,
    vanishing: usize,
}

impl UsageTracker {
    pub fn new(scale: f64, min_interval_us: f64) -> Self {
        Self {
            scale,
            min_interval_us,
            last_seen: HashMap::new(),
            vanishing: 0,
        }
    }

    /// Utilization for one sample, or `None` when it must be skipped.
    pub fn observe(&mut self, core_id: u32, ts: HpFloat, cycles: f64, freq_mhz: u64) -> Option<f64> {
        let dt_us = match self.last_seen.insert(core_id, ts) {
            None => 1.0,
            Some(prev) => (ts - prev).to_f64() / 1_000.0,
        };
        if !(dt_us > self.min_interval_us) {
            self.vanishing += 1;
            return None;
        }
        let usage = cycles * self.scale / (freq_mhz as f64 * dt_us);
        usage.is_finite().then_some(usage)
    }

    /// Samples skipped for a vanishing interval.
    pub fn vanishing(&self) -> usize {
        self.vanishing
    }
}

// =============================================================================
// PROCESSOR
// =============================================================================

pub struct PmuProcessor;

impl PmuProcessor {
    fn detect_mode(path: &std::path::Path) -> PipelineResult<PmuMode> {
        let conn = open_raw(path)?;
        let has = |table: &str| table_exists(&conn, table).map_err(|e| PipelineError::corrupt(path, e));
        if has(TASK_PMU)? {
            Ok(PmuMode::Task)
        } else if has(SAMPLE_PMU)? {
            Ok(PmuMode::Sample)
        } else {
            Err(PipelineError::corrupt(path, "neither task_pmu nor sample_pmu present"))
        }
    }
}

impl Processor for PmuProcessor {
    type Raw = PmuRaw;

    fn name(&self) -> &'static str {
        "pmu"
    }

    fn check(&self, session: &Session) -> SourceStatus {
        check_devices(session, PMU_DB, &[])
    }

    fn read(&self, ctx: &ProcessorContext, session: &Session) -> PipelineResult<Self::Raw> {
        let present: Vec<_> = session
            .devices
            .iter()
            .filter(|d| d.db_path(PMU_DB).exists())
            .collect();
        let first = present.first().ok_or_else(|| PipelineError::SourceMissing {
            source: session.path.clone(),
        })?;

        let mode = Self::detect_mode(&first.db_path(PMU_DB))?;
        for device in &present[1..] {
            let path = device.db_path(PMU_DB);
            if Self::detect_mode(&path)? != mode {
                return Err(PipelineError::corrupt(path, "devices mix task and sample PMU collection"));
            }
        }
        debug!(session = %session.path.display(), ?mode, devices = present.len(), "PMU mode detected");

        let load = |device: &DeviceDir, sql: &str| -> PipelineResult<DeviceRaw> {
            let path = device.db_path(PMU_DB);
            Ok(DeviceRaw {
                device_id: device.device_id,
                calibration: ctx.calibration(session, device.device_id)?,
                window: ctx.window(session, Some(device.device_id))?,
                rows: query_raw(&path, sql)?,
            })
        };

        match mode {
            PmuMode::Task => {
                let paths: Vec<_> = present.iter().map(|d| d.db_path(PMU_DB)).collect();
                let counters = verify_schema(&paths, TASK_PMU, &TASK_KEY_COLUMNS)?;
                if counters.is_empty() {
                    return Err(PipelineError::corrupt(&paths[0], "task_pmu has no counter columns"));
                }
                let projection: Vec<String> = TASK_KEY_COLUMNS
                    .iter()
                    .map(|c| c.to_string())
                    .chain(counters.iter().map(|c| format!("\"{}\"", c.replace('"', "\"\""))))
                    .collect();
                let sql = format!("SELECT {} FROM {}", projection.join(", "), TASK_PMU);

                let devices = present
                    .iter()
                    .map(|d| load(*d, &sql))
                    .collect::<PipelineResult<Vec<_>>>()?;
                Ok(PmuRaw::Task { counters, devices })
            }
            PmuMode::Sample => {
                let devices = present
                    .iter()
                    .map(|d| Ok((load(*d, SAMPLE_SQL)?, ctx.default_freq_mhz(session, d.device_id))))
                    .collect::<PipelineResult<Vec<_>>>()?;
                Ok(PmuRaw::Sample { devices })
            }
        }
    }

    fn transform(
        &self,
        ctx: &ProcessorContext,
        session: &Session,
        raw: Self::Raw,
    ) -> PipelineResult<CanonicalBatch> {
        match raw {
            PmuRaw::Task { counters, devices } => {
                let mut issues = RowIssues::new(PMU_TASK_TABLE.name);
                let metric_ids: Vec<u64> = counters.iter().map(|c| ctx.registry.intern_string(c)).collect();
                let mut rows = Vec::new();

                for device in &devices {
                    for row in &device.rows {
                        task_rows(ctx, device.device_id, &metric_ids, &counters, &mut issues, row, &mut rows);
                    }
                }

                issues.finish(&session.path);
                Ok(CanonicalBatch::new(&PMU_TASK_TABLE, rows))
            }
            PmuRaw::Sample { devices } => {
                let mut issues = RowIssues::new(PMU_SAMPLE_TABLE.name);
                let mut rows = Vec::new();

                for (device, freq_mhz) in &devices {
                    let mut tracker = UsageTracker::new(ctx.config.pmu.usage_scale, ctx.config.pmu.min_interval_us);
                    for row in &device.rows {
                        let Some((core_id, syscnt, cycles)) = parse_sample(&mut issues, row) else {
                            continue;
                        };
                        let ts = ticks_to_host_ns(syscnt, &device.calibration);
                        let Some(usage) = tracker.observe(core_id, ts, cycles, *freq_mhz) else {
                            continue;
                        };
                        if locate_in_window(ts, &device.window) != WindowPosition::Inside {
                            continue;
                        }
                        rows.push(vec![
                            int(device.device_id as u64),
                            int(core_id as u64),
                            int(clamp_to_session(ts, &device.window)),
                            Value::Real(usage),
                        ]);
                    }
                    if tracker.vanishing() > 0 {
                        debug!(
                            device_id = device.device_id,
                            skipped = tracker.vanishing(),
                            "Skipped PMU samples with vanishing interval"
                        );
                    }
                }

                issues.finish(&session.path);
                Ok(CanonicalBatch::new(&PMU_SAMPLE_TABLE, rows))
            }
        }
    }
}

fn task_rows(
    ctx: &ProcessorContext,
    device_id: u32,
    metric_ids: &[u64],
    counters: &[String],
    issues: &mut RowIssues,
    row: &[Value],
    out: &mut Vec<CanonicalRow>,
) {
    let Some(key) = parse_task_key(issues, device_id, row) else {
        return;
    };
    let global_task_id = ctx.registry.intern_tuple(key);

    let offset = TASK_KEY_COLUMNS.len();
    for (i, metric_id) in metric_ids.iter().enumerate() {
        let value = row.get(offset + i).unwrap_or(&Value::Null);
        if *value == Value::Null {
            continue;
        }
        match value_as_f64(value) {
            Some(v) => out.push(vec![int(global_task_id), int(*metric_id), Value::Real(v)]),
            None => issues.skip("counter", format_args!("{} = {:?} is not numeric", counters[i], value)),
        }
    }
}

fn parse_task_key(issues: &mut RowIssues, device_id: u32, row: &[Value]) -> Option<TaskKey> {
    Some(TaskKey::new(
        device_id,
        issues.u32_at(row, 0, "stream_id")?,
        issues.u32_at(row, 1, "task_id")?,
        issues.u32_at(row, 2, "subtask_id")?,
        issues.u32_at(row, 3, "batch_id")?,
    ))
}

fn parse_sample(issues: &mut RowIssues, row: &[Value]) -> Option<(u32, u64, f64)> {
    let core_id = issues.u32_at(row, 0, "core_id")?;
    let syscnt = issues.u64_at(row, 1, "syscnt")?;
    let cycles = issues.f64_at(row, 2, "cycles")?;
    Some((core_id, syscnt, cycles))
}
