//! Processor Orchestration
//!
//! Drives one processor per report table across many sessions.
//!
//! ```text
//!   sessions ──▶ WorkerPool (N fixed threads)
//!                    │ one session at a time per worker
//!                    ▼
//!   Checking ──NotExist──▶ Skipped (success, no rows)
//!       │ ──Failed────▶ Failed
//!       ▼
//!   Reading ─▶ Transforming ─▶ Saving ─▶ Saved{rows}
//!                    │
//!                    ▼
//!   Aggregating: AND of every session's verdict
//! ```
//!
//! Session-level failures never abort sibling sessions; a processor's run
//! always completes with a verdict.

pub mod pool;
pub mod source;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::catalog::SessionCatalog;
use crate::config::AnalysisConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::identity::IdentityRegistry;
use crate::report::{CanonicalRow, ReportDatabase, TableSchema};
use crate::timesync::{CalibrationParams, SessionWindow};

pub use pool::{PoolStats, WorkerPool};
pub use source::{check_source, verify_schema, DeviceDir, Session, SourceStatus};

// =============================================================================
// CONTEXT
// =============================================================================

/// Shared services handed to every processor invocation.
#[derive(Clone)]
pub struct ProcessorContext {
    pub registry: Arc<IdentityRegistry>,
    pub report: Arc<ReportDatabase>,
    pub catalog: Arc<dyn SessionCatalog>,
    pub config: Arc<AnalysisConfig>,
}

impl ProcessorContext {
    pub fn new(
        registry: Arc<IdentityRegistry>,
        report: Arc<ReportDatabase>,
        catalog: Arc<dyn SessionCatalog>,
        config: Arc<AnalysisConfig>,
    ) -> Self {
        Self {
            registry,
            report,
            catalog,
            config,
        }
    }

    /// Calibration for one device, mapped into the session error taxonomy.
    pub fn calibration(&self, session: &Session, device_id: u32) -> PipelineResult<CalibrationParams> {
        self.catalog
            .calibration_params(&session.path, device_id)
            .map_err(|e| PipelineError::calibration(&session.path, Some(device_id), format!("{:#}", e)))
    }

    /// Validity window for one device (or the whole session).
    pub fn window(&self, session: &Session, device_id: Option<u32>) -> PipelineResult<SessionWindow> {
        self.catalog
            .window(&session.path, device_id)
            .map_err(|e| PipelineError::calibration(&session.path, device_id, format!("{:#}", e)))
    }

    /// Platform default frequency (MHz) for a device's chip.
    pub fn default_freq_mhz(&self, session: &Session, device_id: u32) -> u64 {
        match self.catalog.platform_version(&session.path, device_id) {
            Ok(chip) => self.config.default_freq_mhz(&chip),
            Err(e) => {
                debug!(device_id, error = %e, "No platform version; using fallback frequency");
                self.config.frequency.fallback_mhz
            }
        }
    }
}

// =============================================================================
// PROCESSOR CONTRACT
// =============================================================================

/// One transform-and-load job producing one report table.
pub trait Processor: Send + Sync {
    /// Raw data handed from `read` to `transform`.
    type Raw: Send;

    /// Registry key, e.g. `"freq"`.
    fn name(&self) -> &'static str;

    /// Check this session's raw sources.
    fn check(&self, session: &Session) -> SourceStatus;

    fn read(&self, ctx: &ProcessorContext, session: &Session) -> PipelineResult<Self::Raw>;

    fn transform(
        &self,
        ctx: &ProcessorContext,
        session: &Session,
        raw: Self::Raw,
    ) -> PipelineResult<CanonicalBatch>;

    /// Persist one session's rows atomically.
    fn save(&self, ctx: &ProcessorContext, batch: CanonicalBatch) -> PipelineResult<usize> {
        ctx.report.save_canonical(batch.schema, &batch.rows)
    }
}

/// Rows bound for one report table.
#[derive(Debug, Clone)]
pub struct CanonicalBatch {
    pub schema: &'static TableSchema,
    pub rows: Vec<CanonicalRow>,
}

impl CanonicalBatch {
    pub fn new(schema: &'static TableSchema, rows: Vec<CanonicalRow>) -> Self {
        Self { schema, rows }
    }
}

/// Verdict for one session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Saved { rows: usize },
    Skipped,
    Failed(PipelineError),
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, SessionOutcome::Failed(_))
    }
}

/// Object-safe face of `Processor`, used by the registry and the pool.
pub trait DynProcessor: Send + Sync {
    fn name(&self) -> &'static str;
    fn process_session(&self, ctx: &ProcessorContext, session_path: &Path) -> SessionOutcome;
}

impl<P: Processor> DynProcessor for P {
    fn name(&self) -> &'static str {
        Processor::name(self)
    }

    fn process_session(&self, ctx: &ProcessorContext, session_path: &Path) -> SessionOutcome {
        let name = Processor::name(self);
        let session = match Session::discover(session_path) {
            Ok(session) => session,
            Err(e) => return SessionOutcome::Failed(PipelineError::corrupt(session_path, format!("{:#}", e))),
        };

        match self.check(&session) {
            SourceStatus::NotExist => {
                debug!(processor = name, session = %session_path.display(), "No source data; skipping");
                return SessionOutcome::Skipped;
            }
            SourceStatus::Failed => {
                return SessionOutcome::Failed(PipelineError::corrupt(
                    session_path,
                    format!("{} source check failed", name),
                ));
            }
            SourceStatus::Success => {}
        }

        let result = self
            .read(ctx, &session)
            .and_then(|raw| self.transform(ctx, &session, raw))
            .and_then(|batch| self.save(ctx, batch));

        match result {
            Ok(rows) => SessionOutcome::Saved { rows },
            Err(PipelineError::SourceMissing { source }) => {
                debug!(processor = name, source = %source.display(), "Source vanished; skipping");
                SessionOutcome::Skipped
            }
            Err(e) => SessionOutcome::Failed(e),
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Processors keyed by metric name.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: BTreeMap<&'static str, Arc<dyn DynProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn DynProcessor>) {
        let name = processor.name();
        if self.processors.insert(name, processor).is_some() {
            warn!(processor = name, "Processor registered twice; keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynProcessor>> {
        self.processors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

/// Run the named processors (all when `names` is empty) over every session.
///
/// Unknown names count as failed processors. Returns each processor's verdict
/// in execution order and finishes by writing the string dictionary.
pub fn run_all(
    registry: &ProcessorRegistry,
    names: &[String],
    ctx: &ProcessorContext,
    sessions: &[PathBuf],
) -> Vec<(String, bool)> {
    let selected: Vec<String> = if names.is_empty() {
        registry.names().into_iter().map(String::from).collect()
    } else {
        names.to_vec()
    };

    let pool = WorkerPool::new(ctx.config.effective_workers());
    let mut verdicts = Vec::with_capacity(selected.len());

    for name in selected {
        let ok = match registry.get(&name) {
            Some(processor) => pool.run(processor.as_ref(), ctx, sessions),
            None => {
                error!(processor = %name, "Unknown processor");
                false
            }
        };
        if let Err(e) = ctx.report.record_run(&name, ok, sessions.len()) {
            warn!(processor = %name, error = %e, "Failed to record run");
        }
        verdicts.push((name, ok));
    }

    match ctx.report.write_string_dictionary(&ctx.registry) {
        Ok(count) => info!(strings = count, "String dictionary written"),
        Err(e) => error!(error = %e, "Failed to write string dictionary"),
    }

    verdicts
}
