//! Analysis configuration
//!
//! Worker pool sizing, output location, platform calibration defaults and
//! metric selection. Loaded from TOML; every field has a default.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Upper bound on worker threads regardless of configuration.
pub const MAX_WORKERS: usize = 64;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "DEVPROF_CONFIG";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Fixed worker pool size (1-64)
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Report database path
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,

    /// Default tracing filter directive
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Processors to run; empty runs every registered processor
    #[serde(default)]
    pub metrics: Vec<String>,

    #[serde(default)]
    pub frequency: FrequencyConfig,

    #[serde(default)]
    pub pmu: PmuConfig,
}

fn default_worker_count() -> usize {
    4
}

fn default_report_path() -> PathBuf {
    PathBuf::from("report.db")
}

fn default_log_filter() -> String {
    "devprof_analysis=info,devprof=info".to_string()
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            report_path: default_report_path(),
            log_filter: default_log_filter(),
            metrics: Vec::new(),
            frequency: FrequencyConfig::default(),
            pmu: PmuConfig::default(),
        }
    }
}

impl AnalysisConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Load from `DEVPROF_CONFIG` or fall back to defaults
    pub fn from_env() -> Self {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load(&path).unwrap_or_else(|e| {
                tracing::debug!("Using default analysis config ({}): {:#}", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Worker count clamped to the supported range.
    pub fn effective_workers(&self) -> usize {
        self.worker_count.clamp(1, MAX_WORKERS)
    }

    /// Default frequency (MHz) for a chip when no raw record seeds it.
    pub fn default_freq_mhz(&self, chip_id: &str) -> u64 {
        self.frequency
            .platform_defaults_mhz
            .get(chip_id)
            .copied()
            .unwrap_or(self.frequency.fallback_mhz)
    }
}

/// Platform frequency defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyConfig {
    /// Used when the chip id has no entry below
    #[serde(default = "default_fallback_mhz")]
    pub fallback_mhz: u64,

    /// chip id -> nominal frequency (MHz)
    #[serde(default)]
    pub platform_defaults_mhz: HashMap<String, u64>,
}

fn default_fallback_mhz() -> u64 {
    1800
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            fallback_mhz: default_fallback_mhz(),
            platform_defaults_mhz: HashMap::new(),
        }
    }
}

/// Sample-mode PMU utilization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmuConfig {
    /// Multiplier applied to `cycles / (freq * dt)`; 100 gives percent
    #[serde(default = "default_usage_scale")]
    pub usage_scale: f64,

    /// Intervals (μs) at or below this are treated as vanishing
    #[serde(default = "default_min_interval_us")]
    pub min_interval_us: f64,
}

fn default_usage_scale() -> f64 {
    100.0
}

fn default_min_interval_us() -> f64 {
    1e-3
}

impl Default for PmuConfig {
    fn default() -> Self {
        Self {
            usage_scale: default_usage_scale(),
            min_interval_us: default_min_interval_us(),
        }
    }
}
