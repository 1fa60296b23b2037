//! Memory bandwidth samples
//!
//! Sampled on the device monotonic clock rather than the tick counter, so
//! alignment goes through the monotonic anchor pair. Samples outside the
//! session window are dropped.

use rusqlite::types::Value;

use super::{check_devices, int, read_devices, DeviceRaw, RowIssues};
use crate::error::PipelineResult;
use crate::pipeline::{CanonicalBatch, Processor, ProcessorContext, Session, SourceStatus};
use crate::report::{Column, TableSchema};
use crate::timesync::{clamp_to_session, locate_in_window, monotonic_sample_to_host_ns, WindowPosition};

const MEMORY_DB: &str = "memory.db";
const MEM_SAMPLE: &str = "mem_sample";
const MEMORY_SQL: &str = "SELECT mono_ns, read_bw, write_bw FROM mem_sample ORDER BY mono_ns, rowid";

pub static MEMORY_TABLE: TableSchema = TableSchema {
    name: "memory",
    columns: &[
        Column::integer("device_id"),
        Column::integer("timestamp_ns"),
        Column::real("read_bw"),
        Column::real("write_bw"),
    ],
};

pub struct MemoryProcessor;

impl Processor for MemoryProcessor {
    type Raw = Vec<DeviceRaw>;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn check(&self, session: &Session) -> SourceStatus {
        check_devices(session, MEMORY_DB, &[MEM_SAMPLE])
    }

    fn read(&self, ctx: &ProcessorContext, session: &Session) -> PipelineResult<Self::Raw> {
        read_devices(ctx, session, MEMORY_DB, MEMORY_SQL)
    }

    fn transform(
        &self,
        _ctx: &ProcessorContext,
        session: &Session,
        raw: Self::Raw,
    ) -> PipelineResult<CanonicalBatch> {
        let mut issues = RowIssues::new(MEMORY_TABLE.name);
        let mut rows = Vec::new();

        for device in &raw {
            for row in &device.rows {
                let Some((mono_ns, read_bw, write_bw)) = parse_sample(&mut issues, row) else {
                    continue;
                };
                let ts = monotonic_sample_to_host_ns(mono_ns, &device.calibration);
                if locate_in_window(ts, &device.window) != WindowPosition::Inside {
                    continue;
                }
                rows.push(vec![
                    int(device.device_id as u64),
                    int(clamp_to_session(ts, &device.window)),
                    Value::Real(read_bw),
                    Value::Real(write_bw),
                ]);
            }
        }

        issues.finish(&session.path);
        Ok(CanonicalBatch::new(&MEMORY_TABLE, rows))
    }
}

fn parse_sample(issues: &mut RowIssues, row: &[Value]) -> Option<(u64, f64, f64)> {
    let mono_ns = issues.u64_at(row, 0, "mono_ns")?;
    let read_bw = issues.f64_at(row, 1, "read_bw")?;
    let write_bw = issues.f64_at(row, 2, "write_bw")?;
    Some((mono_ns, read_bw, write_bw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testutil::fixture;
    use crate::pipeline::{DynProcessor, SessionOutcome};
    use crate::timesync::SessionWindow;

    #[test]
    fn test_monotonic_alignment_and_window_filter() {
        // Offset under the fixture calibration: host = mono + 999_995_000_000.
        let fx = fixture(&[0], SessionWindow::new(1_000_000_000_000, Some(1_000_000_010_000)));
        fx.device_db(
            0,
            MEMORY_DB,
            "CREATE TABLE mem_sample (mono_ns INTEGER, read_bw REAL, write_bw REAL);
             INSERT INTO mem_sample VALUES (4999999, 1.0, 1.0);
             INSERT INTO mem_sample VALUES (5000000, 10.5, 3.25);
             INSERT INTO mem_sample VALUES (5004000, 11.0, 4.0);
             INSERT INTO mem_sample VALUES (5010001, 12.0, 5.0);",
        );

        let outcome = MemoryProcessor.process_session(&fx.ctx, &fx.path());
        assert_eq!(outcome, SessionOutcome::Saved { rows: 2 });

        let rows = fx.ctx.report.dump_table("memory").unwrap();
        assert_eq!(
            rows[0],
            vec![
                Value::Integer(0),
                Value::Integer(1_000_000_000_000),
                Value::Real(10.5),
                Value::Real(3.25)
            ]
        );
        assert_eq!(rows[1][1], Value::Integer(1_000_000_004_000));
    }

    #[test]
    fn test_all_rows_outside_window_fails_save() {
        let fx = fixture(&[0], SessionWindow::new(2_000_000_000_000, None));
        fx.device_db(
            0,
            MEMORY_DB,
            "CREATE TABLE mem_sample (mono_ns INTEGER, read_bw REAL, write_bw REAL);
             INSERT INTO mem_sample VALUES (5000000, 10.5, 3.25);",
        );
        match MemoryProcessor.process_session(&fx.ctx, &fx.path()) {
            SessionOutcome::Failed(e) => assert_eq!(e.kind(), "save_failure"),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
