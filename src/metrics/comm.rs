//! Inter-device link transfers
//!
//! Connection ids in the raw data are local to one session. The report
//! merges many sessions, so each id is widened with the session's namespace:
//! `connection_id = pack(session_namespace, conn_id)`.

use rusqlite::types::Value;

use super::{check_devices, int, read_devices, DeviceRaw, RowIssues};
use crate::error::{PipelineError, PipelineResult};
use crate::identity::NamespacedId;
use crate::pipeline::{CanonicalBatch, Processor, ProcessorContext, Session, SourceStatus};
use crate::report::{Column, TableSchema};
use crate::timesync::{clamp_to_session, ticks_to_host_ns};

const COMM_DB: &str = "comm.db";
const LINK_EVENT: &str = "link_event";
const COMM_SQL: &str = "SELECT conn_id, start_syscnt, end_syscnt, bytes FROM link_event";

pub static COMM_TABLE: TableSchema = TableSchema {
    name: "comm",
    columns: &[
        Column::integer("connection_id"),
        Column::integer("device_id"),
        Column::integer("start_ns"),
        Column::integer("end_ns"),
        Column::integer("bytes"),
    ],
};

pub struct CommProcessor;

impl Processor for CommProcessor {
    type Raw = Vec<DeviceRaw>;

    fn name(&self) -> &'static str {
        "comm"
    }

    fn check(&self, session: &Session) -> SourceStatus {
        check_devices(session, COMM_DB, &[LINK_EVENT])
    }

    fn read(&self, ctx: &ProcessorContext, session: &Session) -> PipelineResult<Self::Raw> {
        read_devices(ctx, session, COMM_DB, COMM_SQL)
    }

    fn transform(
        &self,
        ctx: &ProcessorContext,
        session: &Session,
        raw: Self::Raw,
    ) -> PipelineResult<CanonicalBatch> {
        let namespace = ctx
            .registry
            .session_namespace(&session.path)
            .ok_or_else(|| PipelineError::corrupt(&session.path, "session namespace space exhausted"))?;

        let mut issues = RowIssues::new(COMM_TABLE.name);
        let mut rows = Vec::new();
        for device in &raw {
            for row in &device.rows {
                let Some((conn_id, start, end, bytes)) = parse_link(&mut issues, row) else {
                    continue;
                };
                rows.push(vec![
                    int(NamespacedId::pack(namespace, conn_id)),
                    int(device.device_id as u64),
                    int(clamp_to_session(ticks_to_host_ns(start, &device.calibration), &device.window)),
                    int(clamp_to_session(ticks_to_host_ns(end, &device.calibration), &device.window)),
                    int(bytes),
                ]);
            }
        }

        issues.finish(&session.path);
        Ok(CanonicalBatch::new(&COMM_TABLE, rows))
    }
}

fn parse_link(issues: &mut RowIssues, row: &[Value]) -> Option<(u32, u64, u64, u64)> {
    let conn_id = issues.u32_at(row, 0, "conn_id")?;
    let start = issues.u64_at(row, 1, "start_syscnt")?;
    let end = issues.u64_at(row, 2, "end_syscnt")?;
    let bytes = issues.u64_at(row, 3, "bytes")?;
    if end < start {
        issues.skip("end_syscnt", format_args!("end {} precedes start {}", end, start));
        return None;
    }
    Some((conn_id, start, end, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testutil::{fixture, host_ns};
    use crate::pipeline::{DynProcessor, SessionOutcome};
    use crate::timesync::SessionWindow;

    const LINKS: &str = "CREATE TABLE link_event (conn_id INTEGER, start_syscnt INTEGER,
                             end_syscnt INTEGER, bytes INTEGER);
                         INSERT INTO link_event VALUES (3, 484500000000100, 484500000000900, 4096);
                         INSERT INTO link_event VALUES ('x', 484500000000100, 484500000000900, 1);";

    #[test]
    fn test_connection_ids_are_session_scoped() {
        let window = SessionWindow::new(1_000_000_000_000, None);
        let a = fixture(&[0], window);
        let b = fixture(&[0], window);
        a.device_db(0, COMM_DB, LINKS);
        b.device_db(0, COMM_DB, LINKS);

        // Share one registry so both sessions get distinct namespaces.
        let mut ctx_b = b.ctx.clone();
        ctx_b.registry = a.ctx.registry.clone();

        assert_eq!(CommProcessor.process_session(&a.ctx, &a.path()), SessionOutcome::Saved { rows: 1 });
        assert_eq!(CommProcessor.process_session(&ctx_b, &b.path()), SessionOutcome::Saved { rows: 1 });

        let row_a = &a.ctx.report.dump_table("comm").unwrap()[0];
        let row_b = &ctx_b.report.dump_table("comm").unwrap()[0];
        assert_ne!(row_a[0], row_b[0]);

        let Value::Integer(packed) = row_a[0] else {
            panic!("connection id not an integer");
        };
        assert_eq!(NamespacedId::unpack(packed as u64).1, 3);
        assert_eq!(row_a[2], Value::Integer(host_ns(484_500_000_000_100) as i64));
        assert_eq!(row_a[4], Value::Integer(4096));
    }
}
