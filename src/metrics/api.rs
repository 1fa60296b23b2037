//! Host API trace
//!
//! Host-side call records are already on the host epoch. Thread ids are
//! only unique within a process, so the report keys threads by
//! `pack(pid, tid)`.

use rusqlite::types::Value;

use super::{int, query_raw, RowIssues};
use crate::error::{PipelineError, PipelineResult};
use crate::identity::NamespacedId;
use crate::pipeline::{check_source, CanonicalBatch, Processor, ProcessorContext, Session, SourceStatus};
use crate::report::{Column, TableSchema};
use crate::timesync::{clamp_to_session, HpFloat, SessionWindow};

const API_DB: &str = "api.db";
const API_EVENT: &str = "api_event";
const API_SQL: &str = "SELECT pid, tid, thread_name, api_name, start_ns, end_ns FROM api_event";

pub static API_TABLE: TableSchema = TableSchema {
    name: "api",
    columns: &[
        Column::integer("global_tid"),
        Column::integer("thread_name_id"),
        Column::integer("api_name_id"),
        Column::integer("start_ns"),
        Column::integer("end_ns"),
    ],
};

#[derive(Debug, Clone)]
pub struct HostApi {
    pub window: SessionWindow,
    pub rows: Vec<Vec<Value>>,
}

pub struct ApiProcessor;

impl Processor for ApiProcessor {
    type Raw = HostApi;

    fn name(&self) -> &'static str {
        "api"
    }

    fn check(&self, session: &Session) -> SourceStatus {
        match session.host_db_path(API_DB) {
            Some(path) => check_source(&path, &[API_EVENT]),
            None => SourceStatus::NotExist,
        }
    }

    fn read(&self, ctx: &ProcessorContext, session: &Session) -> PipelineResult<Self::Raw> {
        let path = session
            .host_db_path(API_DB)
            .ok_or_else(|| PipelineError::SourceMissing {
                source: session.path.join("host"),
            })?;
        Ok(HostApi {
            window: ctx.window(session, None)?,
            rows: query_raw(&path, API_SQL)?,
        })
    }

    fn transform(
        &self,
        ctx: &ProcessorContext,
        session: &Session,
        raw: Self::Raw,
    ) -> PipelineResult<CanonicalBatch> {
        let mut issues = RowIssues::new(API_TABLE.name);
        let mut rows = Vec::with_capacity(raw.rows.len());

        for row in &raw.rows {
            let Some(event) = parse_event(&mut issues, row) else {
                continue;
            };
            let thread_name_id = match &event.thread_name {
                Some(name) => int(ctx.registry.intern_string(name)),
                None => Value::Null,
            };
            rows.push(vec![
                int(NamespacedId::pack(event.pid, event.tid)),
                thread_name_id,
                int(ctx.registry.intern_string(&event.api_name)),
                int(clamp_to_session(HpFloat::from_u64(event.start_ns), &raw.window)),
                int(clamp_to_session(HpFloat::from_u64(event.end_ns), &raw.window)),
            ]);
        }

        issues.finish(&session.path);
        Ok(CanonicalBatch::new(&API_TABLE, rows))
    }
}

struct ApiEvent {
    pid: u32,
    tid: u32,
    thread_name: Option<String>,
    api_name: String,
    start_ns: u64,
    end_ns: u64,
}

fn parse_event(issues: &mut RowIssues, row: &[Value]) -> Option<ApiEvent> {
    let pid = issues.u32_at(row, 0, "pid")?;
    let tid = issues.u32_at(row, 1, "tid")?;
    let thread_name = match row.get(2) {
        None | Some(Value::Null) => None,
        Some(_) => Some(issues.text_at(row, 2, "thread_name")?),
    };
    let api_name = issues.text_at(row, 3, "api_name")?;
    let start_ns = issues.u64_at(row, 4, "start_ns")?;
    let end_ns = issues.u64_at(row, 5, "end_ns")?;
    if end_ns < start_ns {
        issues.skip("end_ns", format_args!("end {} precedes start {}", end_ns, start_ns));
        return None;
    }
    Some(ApiEvent {
        pid,
        tid,
        thread_name,
        api_name,
        start_ns,
        end_ns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testutil::fixture;
    use crate::pipeline::{DynProcessor, SessionOutcome};

    #[test]
    fn test_threads_keyed_by_process() {
        let fx = fixture(&[], SessionWindow::new(1_000, Some(9_000)));
        fx.host_db(
            API_DB,
            "CREATE TABLE api_event (pid INTEGER, tid INTEGER, thread_name TEXT, api_name TEXT,
                 start_ns INTEGER, end_ns INTEGER);
             INSERT INTO api_event VALUES (100, 7, 'main', 'launch', 2000, 3000);
             INSERT INTO api_event VALUES (200, 7, NULL, 'launch', 500, 9500);
             INSERT INTO api_event VALUES (200, 8, 'worker', 'sync', 4000, 3999);",
        );

        let outcome = ApiProcessor.process_session(&fx.ctx, &fx.path());
        assert_eq!(outcome, SessionOutcome::Saved { rows: 2 });

        let rows = fx.ctx.report.dump_table("api").unwrap();
        let launch = fx.ctx.registry.intern_string("launch") as i64;
        assert_eq!(rows[0][0], Value::Integer(NamespacedId::pack(100, 7) as i64));
        assert_eq!(rows[1][0], Value::Integer(NamespacedId::pack(200, 7) as i64));
        assert_ne!(rows[0][0], rows[1][0]);
        assert_eq!(rows[0][2], Value::Integer(launch));
        assert_eq!(rows[1][2], Value::Integer(launch));
        assert_eq!(rows[1][1], Value::Null);
        // Clamped into the window.
        assert_eq!(rows[1][3], Value::Integer(1_000));
        assert_eq!(rows[1][4], Value::Integer(9_000));
    }

    #[test]
    fn test_no_host_directory_is_skipped() {
        let fx = fixture(&[0], SessionWindow::new(0, None));
        fx.device_dir(0);
        assert_eq!(ApiProcessor.process_session(&fx.ctx, &fx.path()), SessionOutcome::Skipped);
    }
}
