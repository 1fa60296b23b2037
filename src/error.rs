//! Pipeline error taxonomy.
//!
//! Row-level problems (`TransformInvariantViolation`) are logged and the row
//! is skipped. Everything else fails one session's contribution and is
//! folded into the processor's aggregate verdict; nothing here aborts
//! sibling sessions.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Optional data is absent. Not a failure.
    SourceMissing { source: PathBuf },
    /// Present but unreadable, missing an expected table, or inconsistent.
    SourceCorrupt { source: PathBuf, reason: String },
    /// No usable time-sync data for a device.
    CalibrationUnavailable {
        session: PathBuf,
        device_id: Option<u32>,
        reason: String,
    },
    /// A single field could not be interpreted.
    TransformInvariantViolation {
        table: &'static str,
        field: &'static str,
        reason: String,
    },
    /// Table create or bulk insert failed, or there was nothing to save.
    SaveFailure { table: String, reason: String },
}

impl PipelineError {
    pub fn corrupt(source: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::SourceCorrupt {
            source: source.into(),
            reason: reason.to_string(),
        }
    }

    pub fn calibration(
        session: impl Into<PathBuf>,
        device_id: Option<u32>,
        reason: impl fmt::Display,
    ) -> Self {
        Self::CalibrationUnavailable {
            session: session.into(),
            device_id,
            reason: reason.to_string(),
        }
    }

    pub fn save(table: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::SaveFailure {
            table: table.into(),
            reason: reason.to_string(),
        }
    }

    /// Short stable label, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceMissing { .. } => "source_missing",
            Self::SourceCorrupt { .. } => "source_corrupt",
            Self::CalibrationUnavailable { .. } => "calibration_unavailable",
            Self::TransformInvariantViolation { .. } => "transform_invariant_violation",
            Self::SaveFailure { .. } => "save_failure",
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceMissing { source } => {
                write!(f, "source missing: {}", source.display())
            }
            Self::SourceCorrupt { source, reason } => {
                write!(f, "source corrupt: {}: {}", source.display(), reason)
            }
            Self::CalibrationUnavailable {
                session,
                device_id: Some(device_id),
                reason,
            } => write!(
                f,
                "calibration unavailable for device {} in {}: {}",
                device_id,
                session.display(),
                reason
            ),
            Self::CalibrationUnavailable {
                session,
                device_id: None,
                reason,
            } => write!(
                f,
                "calibration unavailable for {}: {}",
                session.display(),
                reason
            ),
            Self::TransformInvariantViolation {
                table,
                field,
                reason,
            } => write!(f, "bad value in {}.{}: {}", table, field, reason),
            Self::SaveFailure { table, reason } => {
                write!(f, "failed to save table {}: {}", table, reason)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
