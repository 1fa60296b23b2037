//! Task timeline
//!
//! Merges two raw sources per device:
//!
//! - `engine_task`: scheduler records with native ids and start/end ticks.
//! - `marker_event`: point events tagged with an index id and no explicit
//!   boundaries. Consecutive events sharing an index id (after a stable sort
//!   on `(index_id, syscnt)`) fold into one `[first, last]` range.
//!
//! Both kinds get a global task id from the identity registry so PMU and
//! other per-task tables join against the same key.

use rusqlite::types::Value;

use super::{check_devices, int, read_device, DeviceRaw, RowIssues};
use crate::error::PipelineResult;
use crate::identity::{IdentityRegistry, TaskKey};
use crate::pipeline::{CanonicalBatch, Processor, ProcessorContext, Session, SourceStatus};
use crate::report::{CanonicalRow, Column, TableSchema};
use crate::timesync::{clamp_to_session, ticks_to_host_ns, CalibrationParams, SessionWindow};

const TASK_DB: &str = "task.db";
const ENGINE_TASK: &str = "engine_task";
const ENGINE_SQL: &str = "SELECT stream_id, task_id, subtask_id, batch_id, task_type, start_syscnt, end_syscnt \
                          FROM engine_task";

const MARKER_DB: &str = "marker.db";
const MARKER_EVENT: &str = "marker_event";
const MARKER_SQL: &str = "SELECT index_id, stream_id, syscnt FROM marker_event";

/// Subtask id reserved for marker ranges.
pub const MARKER_SUBTASK_ID: u32 = u32::MAX;
/// Task type recorded for marker ranges.
pub const MARKER_TASK_TYPE: &str = "MARKER";

pub static TASK_TABLE: TableSchema = TableSchema {
    name: "task",
    columns: &[
        Column::integer("global_task_id"),
        Column::integer("device_id"),
        Column::integer("stream_id"),
        Column::integer("task_id"),
        Column::integer("subtask_id"),
        Column::integer("batch_id"),
        Column::integer("task_type_id"),
        Column::integer("start_ns"),
        Column::integer("end_ns"),
    ],
};

// =============================================================================
// MARKER FOLDING
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerEvent {
    pub index_id: u32,
    pub stream_id: u32,
    pub syscnt: u64,
}

/// A synthesized task span built from marker events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerRange {
    pub index_id: u32,
    pub stream_id: u32,
    pub start_syscnt: u64,
    pub end_syscnt: u64,
}

/// Fold marker events into ranges, one per run of equal index ids.
///
/// The stream id of a range is that of its first event.
pub fn fold_markers(mut events: Vec<MarkerEvent>) -> Vec<MarkerRange> {
    events.sort_by_key(|e| (e.index_id, e.syscnt));

    let mut ranges: Vec<MarkerRange> = Vec::new();
    for event in events {
        match ranges.last_mut() {
            Some(range) if range.index_id == event.index_id => range.end_syscnt = event.syscnt,
            _ => ranges.push(MarkerRange {
                index_id: event.index_id,
                stream_id: event.stream_id,
                start_syscnt: event.syscnt,
                end_syscnt: event.syscnt,
            }),
        }
    }
    ranges
}

// =============================================================================
// PROCESSOR
// =============================================================================

#[derive(Debug, Clone)]
pub struct DeviceTasks {
    pub device_id: u32,
    pub calibration: CalibrationParams,
    pub window: SessionWindow,
    pub engine: Vec<Vec<Value>>,
    pub markers: Vec<Vec<Value>>,
}

pub struct TaskProcessor;

impl Processor for TaskProcessor {
    type Raw = Vec<DeviceTasks>;

    fn name(&self) -> &'static str {
        "task"
    }

    fn check(&self, session: &Session) -> SourceStatus {
        SourceStatus::combine([
            check_devices(session, TASK_DB, &[ENGINE_TASK]),
            check_devices(session, MARKER_DB, &[MARKER_EVENT]),
        ])
    }

    fn read(&self, ctx: &ProcessorContext, session: &Session) -> PipelineResult<Self::Raw> {
        let mut devices = Vec::new();
        for device in &session.devices {
            let engine = read_device(ctx, session, device, TASK_DB, ENGINE_SQL)?;
            let markers = read_device(ctx, session, device, MARKER_DB, MARKER_SQL)?;
            let (base, engine, markers) = match (engine, markers) {
                (None, None) => continue,
                (Some(mut engine), markers) => {
                    let rows = std::mem::take(&mut engine.rows);
                    (engine, rows, markers.map(|m| m.rows).unwrap_or_default())
                }
                (None, Some(mut markers)) => {
                    let rows = std::mem::take(&mut markers.rows);
                    (markers, Vec::new(), rows)
                }
            };
            let DeviceRaw {
                device_id,
                calibration,
                window,
                ..
            } = base;
            devices.push(DeviceTasks {
                device_id,
                calibration,
                window,
                engine,
                markers,
            });
        }
        Ok(devices)
    }

    fn transform(
        &self,
        ctx: &ProcessorContext,
        session: &Session,
        raw: Self::Raw,
    ) -> PipelineResult<CanonicalBatch> {
        let mut issues = RowIssues::new(TASK_TABLE.name);
        let mut rows = Vec::new();
        let marker_type_id = ctx.registry.intern_string(MARKER_TASK_TYPE);

        for device in raw {
            for row in &device.engine {
                if let Some(row) = engine_row(&ctx.registry, &device, &mut issues, row) {
                    rows.push(row);
                }
            }

            let events: Vec<MarkerEvent> = device
                .markers
                .iter()
                .filter_map(|row| parse_marker(&mut issues, row))
                .collect();
            for range in fold_markers(events) {
                let key = TaskKey::new(device.device_id, range.stream_id, range.index_id, MARKER_SUBTASK_ID, 0);
                rows.push(vec![
                    int(ctx.registry.intern_tuple(key)),
                    int(device.device_id as u64),
                    int(range.stream_id as u64),
                    int(range.index_id as u64),
                    int(MARKER_SUBTASK_ID as u64),
                    int(0),
                    int(marker_type_id),
                    int(clamp_to_session(ticks_to_host_ns(range.start_syscnt, &device.calibration), &device.window)),
                    int(clamp_to_session(ticks_to_host_ns(range.end_syscnt, &device.calibration), &device.window)),
                ]);
            }
        }

        issues.finish(&session.path);
        Ok(CanonicalBatch::new(&TASK_TABLE, rows))
    }
}

fn engine_row(
    registry: &IdentityRegistry,
    device: &DeviceTasks,
    issues: &mut RowIssues,
    row: &[Value],
) -> Option<CanonicalRow> {
    let stream_id = issues.u32_at(row, 0, "stream_id")?;
    let task_id = issues.u32_at(row, 1, "task_id")?;
    let subtask_id = issues.u32_at(row, 2, "subtask_id")?;
    let batch_id = issues.u32_at(row, 3, "batch_id")?;
    let task_type = issues.text_at(row, 4, "task_type")?;
    let start = issues.u64_at(row, 5, "start_syscnt")?;
    let end = issues.u64_at(row, 6, "end_syscnt")?;
    if end < start {
        issues.skip("end_syscnt", format_args!("end {} precedes start {}", end, start));
        return None;
    }

    let key = TaskKey::new(device.device_id, stream_id, task_id, subtask_id, batch_id);
    Some(vec![
        int(registry.intern_tuple(key)),
        int(device.device_id as u64),
        int(stream_id as u64),
        int(task_id as u64),
        int(subtask_id as u64),
        int(batch_id as u64),
        int(registry.intern_string(&task_type)),
        int(clamp_to_session(ticks_to_host_ns(start, &device.calibration), &device.window)),
        int(clamp_to_session(ticks_to_host_ns(end, &device.calibration), &device.window)),
    ])
}

fn parse_marker(issues: &mut RowIssues, row: &[Value]) -> Option<MarkerEvent> {
    Some(MarkerEvent {
        index_id: issues.u32_at(row, 0, "index_id")?,
        stream_id: issues.u32_at(row, 1, "stream_id")?,
        syscnt: issues.u64_at(row, 2, "syscnt")?,
    })
}
