//! Fixed-size session worker pool
//!
//! A bounded channel of session paths feeds a fixed set of scoped worker
//! threads; each worker runs one session to completion before taking the
//! next and pushes its verdict onto a result channel. The caller drains the
//! result channel and ANDs the verdicts. There is no cancellation: `run`
//! returns once every session has been attempted.

use crossbeam::channel::{bounded, unbounded};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{error, info, warn};

use super::{DynProcessor, ProcessorContext, SessionOutcome};
use crate::config::MAX_WORKERS;
use crate::error::PipelineError;

/// Per-run counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub sessions_saved: AtomicU64,
    pub sessions_skipped: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub rows_saved: AtomicU64,
}

impl PoolStats {
    fn record(&self, outcome: &SessionOutcome) {
        match outcome {
            SessionOutcome::Saved { rows } => {
                self.sessions_saved.fetch_add(1, Ordering::Relaxed);
                self.rows_saved.fetch_add(*rows as u64, Ordering::Relaxed);
            }
            SessionOutcome::Skipped => {
                self.sessions_skipped.fetch_add(1, Ordering::Relaxed);
            }
            SessionOutcome::Failed(_) => {
                self.sessions_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Get a summary string.
    pub fn summary(&self) -> String {
        format!(
            "saved={}, skipped={}, failed={}, rows={}",
            self.sessions_saved.load(Ordering::Relaxed),
            self.sessions_skipped.load(Ordering::Relaxed),
            self.sessions_failed.load(Ordering::Relaxed),
            self.rows_saved.load(Ordering::Relaxed),
        )
    }
}

/// Bounded pool of OS threads.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.clamp(1, MAX_WORKERS),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `processor` over every session; true iff every session succeeded.
    pub fn run(&self, processor: &dyn DynProcessor, ctx: &ProcessorContext, sessions: &[PathBuf]) -> bool {
        self.run_with_stats(processor, ctx, sessions).0
    }

    pub fn run_with_stats(
        &self,
        processor: &dyn DynProcessor,
        ctx: &ProcessorContext,
        sessions: &[PathBuf],
    ) -> (bool, PoolStats) {
        let name = processor.name();
        let stats = PoolStats::default();
        if sessions.is_empty() {
            info!(processor = name, "No sessions to process");
            return (true, stats);
        }

        let started = Instant::now();
        let workers = self.workers.min(sessions.len());
        let (job_tx, job_rx) = bounded::<&Path>(workers);
        let (result_tx, result_rx) = unbounded::<(&Path, SessionOutcome)>();

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for session in job_rx.iter() {
                        let outcome = run_guarded(processor, ctx, session);
                        if result_tx.send((session, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(result_tx);

            for session in sessions {
                if job_tx.send(session.as_path()).is_err() {
                    // Every worker has exited; remaining sessions cannot run.
                    error!(processor = name, "Worker pool closed before dispatch finished");
                    break;
                }
            }
            drop(job_tx);
        });

        let mut all_ok = true;
        let mut received = 0usize;
        for (session, outcome) in result_rx.iter() {
            received += 1;
            stats.record(&outcome);
            if let SessionOutcome::Failed(e) = &outcome {
                all_ok = false;
                warn!(
                    processor = name,
                    session = %session.display(),
                    kind = e.kind(),
                    error = %e,
                    "Session failed"
                );
            }
        }
        if received != sessions.len() {
            all_ok = false;
        }

        info!(
            processor = name,
            ok = all_ok,
            workers,
            elapsed_ms = started.elapsed().as_millis() as u64,
            stats = %stats.summary(),
            "Processor finished"
        );
        (all_ok, stats)
    }
}

/// A panicking processor fails its session instead of the whole run.
fn run_guarded(processor: &dyn DynProcessor, ctx: &ProcessorContext, session: &Path) -> SessionOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| processor.process_session(ctx, session))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            SessionOutcome::Failed(PipelineError::corrupt(session, format!("processor panicked: {}", reason)))
        }
    }
}
