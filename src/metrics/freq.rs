//! Frequency timeline
//!
//! Raw frequency events are sparse: a row is written only when the clock
//! changes. Interval queries over the report must never fall into a gap, so
//! every device gets two synthesized boundary rows:
//!
//! ```text
//!   raw:     ●200 ........ │ ●1650 ..... ●1800 ....... │ ●900
//!                        start                        end
//!   report:              ■200  ●1650 ..... ●1800     ■1800
//! ```
//!
//! Pre-window records only seed the carried-forward value. Post-window
//! records are dropped. A device without a raw source still gets both
//! boundary rows at the platform default.

use rusqlite::types::Value;
use std::cmp::Ordering;
use tracing::debug;

use super::{check_devices, int, read_device, DeviceRaw, RowIssues};
use crate::error::PipelineResult;
use crate::pipeline::{CanonicalBatch, Processor, ProcessorContext, Session, SourceStatus};
use crate::report::{Column, TableSchema};
use crate::timesync::{clamp_to_session, locate_in_window, ticks_to_host_ns, HpFloat, SessionWindow, WindowPosition};

const FREQ_DB: &str = "freq.db";
const FREQ_EVENT: &str = "freq_event";
const FREQ_SQL: &str = "SELECT syscnt, freq FROM freq_event ORDER BY syscnt, rowid";

pub static FREQ_TABLE: TableSchema = TableSchema {
    name: "freq",
    columns: &[
        Column::integer("device_id"),
        Column::integer("timestamp_ns"),
        Column::integer("freq_mhz"),
    ],
};

/// One point of a device's frequency timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreqPoint {
    pub timestamp_ns: u64,
    pub freq_mhz: u64,
}

impl FreqPoint {
    pub fn new(timestamp_ns: u64, freq_mhz: u64) -> Self {
        Self {
            timestamp_ns,
            freq_mhz,
        }
    }
}

/// Build a gap-free timeline from host-aligned events.
///
/// The first point is always at the window start and the last at the window
/// end (or the last emitted point when the end is unknown).
pub fn build_timeline(events: &[(HpFloat, u64)], window: &SessionWindow, default_mhz: u64) -> Vec<FreqPoint> {
    let mut sorted: Vec<(HpFloat, u64)> = events.to_vec();
    sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    let mut carried = default_mhz;
    let mut inside = Vec::with_capacity(sorted.len());
    let mut dropped = 0usize;
    for (ts, freq) in sorted {
        match locate_in_window(ts, window) {
            WindowPosition::Before => carried = freq,
            WindowPosition::Inside => inside.push(FreqPoint::new(clamp_to_session(ts, window), freq)),
            WindowPosition::After => dropped += 1,
        }
    }
    if dropped > 0 {
        debug!(dropped, "Dropped post-window frequency records");
    }

    let end_freq = inside.last().map(|p| p.freq_mhz).unwrap_or(carried);
    let end_ts = window
        .end_time_ns
        .or_else(|| inside.last().map(|p| p.timestamp_ns))
        .unwrap_or(window.start_time_ns);

    let mut timeline = Vec::with_capacity(inside.len() + 2);
    timeline.push(FreqPoint::new(window.start_time_ns, carried));
    timeline.extend(inside);
    timeline.push(FreqPoint::new(end_ts, end_freq));
    timeline
}

/// Everything needed to build one device's timeline.
#[derive(Debug, Clone)]
pub struct DeviceFreq {
    pub device_id: u32,
    pub window: SessionWindow,
    pub default_mhz: u64,
    pub source: Option<DeviceRaw>,
}

pub struct FreqProcessor;

impl Processor for FreqProcessor {
    type Raw = Vec<DeviceFreq>;

    fn name(&self) -> &'static str {
        "freq"
    }

    fn check(&self, session: &Session) -> SourceStatus {
        if session.devices.is_empty() {
            return SourceStatus::NotExist;
        }
        // Devices without a raw file still get boundary rows.
        match check_devices(session, FREQ_DB, &[FREQ_EVENT]) {
            SourceStatus::Failed => SourceStatus::Failed,
            _ => SourceStatus::Success,
        }
    }

    fn read(&self, ctx: &ProcessorContext, session: &Session) -> PipelineResult<Self::Raw> {
        let mut devices = Vec::with_capacity(session.devices.len());
        for device in &session.devices {
            let source = read_device(ctx, session, device, FREQ_DB, FREQ_SQL)?;
            let window = match &source {
                Some(raw) => raw.window,
                None => ctx.window(session, Some(device.device_id))?,
            };
            devices.push(DeviceFreq {
                device_id: device.device_id,
                window,
                default_mhz: ctx.default_freq_mhz(session, device.device_id),
                source,
            });
        }
        Ok(devices)
    }

    fn transform(
        &self,
        _ctx: &ProcessorContext,
        session: &Session,
        raw: Self::Raw,
    ) -> PipelineResult<CanonicalBatch> {
        let mut issues = RowIssues::new(FREQ_TABLE.name);
        let mut rows = Vec::new();

        for device in raw {
            let events: Vec<(HpFloat, u64)> = match &device.source {
                Some(source) => source
                    .rows
                    .iter()
                    .filter_map(|row| parse_event(&mut issues, row))
                    .map(|(syscnt, freq)| (ticks_to_host_ns(syscnt, &source.calibration), freq))
                    .collect(),
                None => Vec::new(),
            };

            let timeline = build_timeline(&events, &device.window, device.default_mhz);
            rows.extend(
                timeline
                    .into_iter()
                    .map(|p| vec![int(device.device_id as u64), int(p.timestamp_ns), int(p.freq_mhz)]),
            );
        }

        issues.finish(&session.path);
        Ok(CanonicalBatch::new(&FREQ_TABLE, rows))
    }
}

fn parse_event(issues: &mut RowIssues, row: &[Value]) -> Option<(u64, u64)> {
    let syscnt = issues.u64_at(row, 0, "syscnt")?;
    let freq = issues.u64_at(row, 1, "freq")?;
    Some((syscnt, freq))
}
