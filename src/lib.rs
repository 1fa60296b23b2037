//! Device Profiling Analysis Library
//!
//! Post-collection pipeline that turns per-device raw profiling databases
//! into one normalized report:
//!
//! - `timesync`: device ticks and monotonic samples onto the host epoch.
//! - `identity`: dense ids for strings and composite task keys.
//! - `pipeline`: processor contract, session sources and the worker pool.
//! - `metrics`: the built-in processors.
//! - `catalog`, `report`, `config`, `error`: collaborators and ambient types.

pub mod catalog;
pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod pipeline;
pub mod report;
pub mod timesync;

pub use catalog::{JsonSessionCatalog, SessionCatalog};
pub use config::AnalysisConfig;
pub use error::{PipelineError, PipelineResult};
pub use identity::{IdentityRegistry, NamespacedId, TaskKey};
pub use metrics::default_registry;
pub use pipeline::{run_all, Processor, ProcessorContext, ProcessorRegistry, WorkerPool};
pub use report::ReportDatabase;
pub use timesync::{CalibrationParams, HpFloat, SessionWindow};
