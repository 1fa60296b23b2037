//! Integration tests for the analysis pipeline
//!
//! Each test builds real session directories (info.json plus per-device
//! SQLite sources) under a temp dir and runs processors end to end into a
//! report database.

use rusqlite::types::Value;
use rusqlite::Connection;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use devprof_analysis::catalog::{DeviceRecord, SessionInfo};
use devprof_analysis::{
    default_registry, run_all, AnalysisConfig, CalibrationParams, IdentityRegistry, JsonSessionCatalog,
    ProcessorContext, ReportDatabase, SessionWindow, WorkerPool,
};

const ANCHOR_TICKS: u64 = 484_500_000_000_000;
const ANCHOR_HOST: u64 = 1_000_000_000_000;
const WINDOW_START: u64 = 1_000_000_000_000;
const WINDOW_END: u64 = 1_000_100_000_000;

fn calibration() -> CalibrationParams {
    CalibrationParams {
        anchor_device_ticks: ANCHOR_TICKS,
        anchor_host_time_ns: ANCHOR_HOST,
        tick_frequency_hz: 100e6,
        host_monotonic_anchor: ANCHOR_HOST,
        device_monotonic_anchor: 0,
    }
}

fn make_db(path: &Path, sql: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(sql).unwrap();
}

fn device_db(session: &Path, device_id: u32, file_name: &str) -> PathBuf {
    session
        .join(format!("device_{}", device_id))
        .join("data")
        .join(file_name)
}

/// Create a calibrated session directory with `devices` device dirs.
fn create_session(root: &Path, name: &str, devices: &[u32]) -> PathBuf {
    let session = root.join(name);
    std::fs::create_dir_all(&session).unwrap();
    let mut records = BTreeMap::new();
    for &id in devices {
        std::fs::create_dir_all(session.join(format!("device_{}", id)).join("data")).unwrap();
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
        window: SessionWindow::new(WINDOW_START, Some(WINDOW_END)),
        devices: records,
    }
    .save(&session)
    .unwrap();
    session
}

fn write_freq(session: &Path, device_id: u32) {
    make_db(
        &device_db(session, device_id, "freq.db"),
        &format!(
            "CREATE TABLE freq_event (syscnt INTEGER, freq INTEGER);
             INSERT INTO freq_event VALUES ({}, 200);
             INSERT INTO freq_event VALUES ({}, 1650);
             INSERT INTO freq_event VALUES ({}, 1800);",
            ANCHOR_TICKS - 1_000,
            ANCHOR_TICKS + 1_000_000,
            ANCHOR_TICKS + 5_000_000
        ),
    );
}

fn write_tasks(session: &Path, device_id: u32) {
    make_db(
        &device_db(session, device_id, "task.db"),
        &format!(
            "CREATE TABLE engine_task (stream_id INTEGER, task_id INTEGER, subtask_id INTEGER,
                 batch_id INTEGER, task_type TEXT, start_syscnt INTEGER, end_syscnt INTEGER);
             INSERT INTO engine_task VALUES (1, 10, 0, 0, 'AI_CORE', {a}, {b});
             INSERT INTO engine_task VALUES (1, 11, 0, 0, 'AI_VECTOR', {b}, {c});",
            a = ANCHOR_TICKS + 100,
            b = ANCHOR_TICKS + 200,
            c = ANCHOR_TICKS + 300
        ),
    );
}

fn write_task_pmu(session: &Path, device_id: u32, extra_counter: &str) {
    make_db(
        &device_db(session, device_id, "pmu.db"),
        &format!(
            "CREATE TABLE task_pmu (stream_id INTEGER, task_id INTEGER, subtask_id INTEGER,
                 batch_id INTEGER, total_cycles INTEGER, {extra} REAL);
             INSERT INTO task_pmu VALUES (1, 10, 0, 0, 5000, 0.5);
             INSERT INTO task_pmu VALUES (1, 11, 0, 0, 7000, 0.75);",
            extra = extra_counter
        ),
    );
}

fn context(config: AnalysisConfig) -> ProcessorContext {
    ProcessorContext::new(
        Arc::new(IdentityRegistry::new()),
        Arc::new(ReportDatabase::open_memory().unwrap()),
        Arc::new(JsonSessionCatalog::new()),
        Arc::new(config),
    )
}

fn int(value: &Value) -> i64 {
    match value {
        Value::Integer(v) => *v,
        other => panic!("expected integer, got {:?}", other),
    }
}

#[test]
fn test_partial_failure_keeps_sibling_sessions() {
    let root = tempfile::tempdir().unwrap();
    let mut sessions = Vec::new();
    for i in 0..4 {
        let session = create_session(root.path(), &format!("run_{}", i), &[0]);
        if i == 2 {
            let path = device_db(&session, 0, "freq.db");
            std::fs::write(&path, b"garbage that is definitely not a sqlite database file").unwrap();
        } else {
            write_freq(&session, 0);
        }
        sessions.push(session);
    }

    let ctx = context(AnalysisConfig::default());
    let registry = default_registry();
    let freq = registry.get("freq").unwrap();
    let (ok, stats) = WorkerPool::new(3).run_with_stats(freq.as_ref(), &ctx, &sessions);

    assert!(!ok);
    assert_eq!(stats.summary(), "saved=3, skipped=0, failed=1, rows=12");
    assert_eq!(ctx.report.row_count("freq").unwrap(), 12);
}

#[test]
fn test_frequency_rows_cover_window() {
    let root = tempfile::tempdir().unwrap();
    let session = create_session(root.path(), "run", &[0, 1]);
    write_freq(&session, 0);

    let ctx = context(AnalysisConfig::default());
    let verdicts = run_all(&default_registry(), &["freq".to_string()], &ctx, &[session]);
    assert_eq!(verdicts, vec![("freq".to_string(), true)]);

    let rows = ctx.report.dump_table("freq").unwrap();
    for device in [0i64, 1] {
        let stamps: Vec<i64> = rows
            .iter()
            .filter(|r| int(&r[0]) == device)
            .map(|r| int(&r[1]))
            .collect();
        assert_eq!(stamps.first(), Some(&(WINDOW_START as i64)));
        assert_eq!(stamps.last(), Some(&(WINDOW_END as i64)));
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }
    // Device 0: one pre-window record consumed, two boundary rows added.
    assert_eq!(rows.iter().filter(|r| int(&r[0]) == 0).count(), 3 - 1 + 2);
    // Device 1 has no source: boundary rows at the fallback frequency.
    let device1: Vec<i64> = rows.iter().filter(|r| int(&r[0]) == 1).map(|r| int(&r[2])).collect();
    assert_eq!(device1, vec![1800, 1800]);
}

#[test]
fn test_schema_mismatch_produces_no_pmu_rows() {
    let root = tempfile::tempdir().unwrap();
    let session = create_session(root.path(), "run", &[0, 1]);
    write_task_pmu(&session, 0, "mac_ratio");
    write_task_pmu(&session, 1, "vec_ratio");

    let ctx = context(AnalysisConfig::default());
    let verdicts = run_all(&default_registry(), &["pmu".to_string()], &ctx, &[session]);
    assert_eq!(verdicts, vec![("pmu".to_string(), false)]);
    assert_eq!(ctx.report.row_count("pmu_task").unwrap(), 0);
}

#[test]
fn test_task_ids_agree_across_processors() {
    let root = tempfile::tempdir().unwrap();
    let mut sessions = Vec::new();
    for i in 0..3 {
        let session = create_session(root.path(), &format!("run_{}", i), &[0, 1]);
        for device in [0, 1] {
            write_tasks(&session, device);
            write_task_pmu(&session, device, "mac_ratio");
        }
        sessions.push(session);
    }

    let mut config = AnalysisConfig::default();
    config.worker_count = 4;
    let ctx = context(config);
    let verdicts = run_all(
        &default_registry(),
        &["task".to_string(), "pmu".to_string()],
        &ctx,
        &sessions,
    );
    assert!(verdicts.iter().all(|(_, ok)| *ok), "{:?}", verdicts);

    let task_ids: HashSet<i64> = ctx
        .report
        .dump_table("task")
        .unwrap()
        .iter()
        .map(|r| int(&r[0]))
        .collect();
    let pmu_ids: HashSet<i64> = ctx
        .report
        .dump_table("pmu_task")
        .unwrap()
        .iter()
        .map(|r| int(&r[0]))
        .collect();

    // Identical keys across sessions collapse; devices keep them apart.
    assert_eq!(task_ids.len(), 4);
    assert_eq!(pmu_ids, task_ids);
}

#[test]
fn test_string_dictionary_written_after_run() {
    let root = tempfile::tempdir().unwrap();
    let session = create_session(root.path(), "run", &[0]);
    write_tasks(&session, 0);

    let ctx = context(AnalysisConfig::default());
    run_all(&default_registry(), &["task".to_string()], &ctx, &[session]);

    let strings: Vec<String> = ctx
        .report
        .dump_table("string_ids")
        .unwrap()
        .into_iter()
        .filter_map(|r| match &r[1] {
            Value::Text(s) => Some(s.clone()),
            _ => None,
        })
        .collect();
    assert!(strings.contains(&"AI_CORE".to_string()));
    assert!(strings.contains(&"AI_VECTOR".to_string()));
}

#[test]
fn test_unknown_processor_is_a_failed_verdict() {
    let ctx = context(AnalysisConfig::default());
    let verdicts = run_all(&default_registry(), &["bogus".to_string()], &ctx, &[]);
    assert_eq!(verdicts, vec![("bogus".to_string(), false)]);
}

#[test]
fn test_cli_exit_codes() {
    let root = tempfile::tempdir().unwrap();
    let good = create_session(root.path(), "good", &[0]);
    write_freq(&good, 0);
    let bad = create_session(root.path(), "bad", &[0]);
    std::fs::write(device_db(&bad, 0, "freq.db"), b"not sqlite at all, just a pile of bytes").unwrap();
    let report = root.path().join("out").join("report.db");

    let run = |extra: &[&str], sessions: &[&Path]| {
        Command::new(env!("CARGO_BIN_EXE_devprof"))
            .env_remove("DEVPROF_CONFIG")
            .arg("--report")
            .arg(&report)
            .args(extra)
            .args(sessions)
            .status()
            .unwrap()
            .code()
    };

    assert_eq!(run(&["--metric", "freq"], &[good.as_path()]), Some(0));
    assert_eq!(run(&["--metric", "freq"], &[good.as_path(), bad.as_path()]), Some(1));
    assert_eq!(run(&["--metric", "nope"], &[good.as_path()]), Some(2));
    assert!(report.exists());
}

#[test]
fn test_cli_unreadable_env_config_falls_back_to_defaults() {
    let root = tempfile::tempdir().unwrap();
    let session = create_session(root.path(), "run", &[0]);
    write_freq(&session, 0);
    let report = root.path().join("report.db");
    let missing = root.path().join("nonexistent").join("devprof.toml");

    let run = |extra: &[&str]| {
        Command::new(env!("CARGO_BIN_EXE_devprof"))
            .env("DEVPROF_CONFIG", &missing)
            .arg("--report")
            .arg(&report)
            .arg("--metric")
            .arg("freq")
            .args(extra)
            .arg(&session)
            .status()
            .unwrap()
            .code()
    };

    assert_eq!(run(&[]), Some(0));
    assert!(report.exists());
    // An explicit --config must load.
    let explicit = missing.to_string_lossy().into_owned();
    assert_eq!(run(&["--config", explicit.as_str()]), Some(2));
}
