//! Session calibration catalog
//!
//! Supplies per (session, device) calibration constants, validity windows and
//! chip identity. Every read is fallible: a session without calibration data
//! is a normal input and simply cannot be time-aligned.
//!
//! The JSON-backed implementation reads `<session>/info.json`:
//!
//! ```text
//! {
//!   "window":  { "start_time_ns", "end_time_ns"?, "base_time_ns"? },
//!   "devices": { "<id>": { "platform_version", <CalibrationParams>, "window"? } }
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::timesync::{CalibrationParams, SessionWindow};

/// File name of the per-session catalog.
pub const SESSION_INFO_FILE: &str = "info.json";

/// Calibration and identity lookups for closed sessions.
pub trait SessionCatalog: Send + Sync {
    fn calibration_params(&self, session: &Path, device_id: u32) -> Result<CalibrationParams>;

    /// Device window when `device_id` is given and overridden, else the session window.
    fn window(&self, session: &Path, device_id: Option<u32>) -> Result<SessionWindow>;

    fn platform_version(&self, session: &Path, device_id: u32) -> Result<String>;

    /// Devices with calibration records, ascending.
    fn device_ids(&self, session: &Path) -> Result<Vec<u32>>;
}

// =============================================================================
// JSON RECORDS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub platform_version: String,
    #[serde(flatten)]
    pub calibration: CalibrationParams,
    #[serde(default)]
    pub window: Option<SessionWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub window: SessionWindow,
    #[serde(default)]
    pub devices: BTreeMap<u32, DeviceRecord>,
}

impl SessionInfo {
    pub fn load(session: &Path) -> Result<Self> {
        let path = session.join(SESSION_INFO_FILE);
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let info: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(info)
    }

    pub fn save(&self, session: &Path) -> Result<()> {
        let path = session.join(SESSION_INFO_FILE);
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn device(&self, session: &Path, device_id: u32) -> Result<&DeviceRecord> {
        self.devices.get(&device_id).ok_or_else(|| {
            anyhow!(
                "no calibration record for device {} in {}",
                device_id,
                session.display()
            )
        })
    }
}

// =============================================================================
// JSON CATALOG
// =============================================================================

/// Catalog backed by each session's `info.json`, parsed once per session.
#[derive(Debug, Default)]
pub struct JsonSessionCatalog {
    cache: RwLock<HashMap<PathBuf, Arc<SessionInfo>>>,
}

impl JsonSessionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn info(&self, session: &Path) -> Result<Arc<SessionInfo>> {
        if let Some(info) = self.cache.read().get(session) {
            return Ok(info.clone());
        }

        let info = Arc::new(SessionInfo::load(session)?);
        debug!(
            session = %session.display(),
            devices = info.devices.len(),
            "Loaded session calibration"
        );
        self.cache
            .write()
            .entry(session.to_path_buf())
            .or_insert_with(|| info.clone());
        Ok(info)
    }
}

impl SessionCatalog for JsonSessionCatalog {
    fn calibration_params(&self, session: &Path, device_id: u32) -> Result<CalibrationParams> {
        let info = self.info(session)?;
        let calibration = info.device(session, device_id)?.calibration;
        calibration
            .validate()
            .map_err(|reason| anyhow!("device {}: {}", device_id, reason))?;
        Ok(calibration)
    }

    fn window(&self, session: &Path, device_id: Option<u32>) -> Result<SessionWindow> {
        let info = self.info(session)?;
        let device_window = device_id
            .and_then(|id| info.devices.get(&id))
            .and_then(|record| record.window);
        Ok(device_window.unwrap_or(info.window))
    }

    fn platform_version(&self, session: &Path, device_id: u32) -> Result<String> {
        let info = self.info(session)?;
        Ok(info.device(session, device_id)?.platform_version.clone())
    }

    fn device_ids(&self, session: &Path) -> Result<Vec<u32>> {
        let info = self.info(session)?;
        Ok(info.devices.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO: &str = r#"{
        "window": { "start_time_ns": 1000, "end_time_ns": 9000 },
        "devices": {
            "0": {
                "platform_version": "chip-a",
                "anchor_device_ticks": 484500000000000,
                "anchor_host_time_ns": 1000,
                "tick_frequency_hz": 100000000.0,
                "host_monotonic_anchor": 1000,
                "device_monotonic_anchor": 0
            },
            "2": {
                "platform_version": "chip-b",
                "anchor_device_ticks": 0,
                "anchor_host_time_ns": 0,
                "tick_frequency_hz": 0.0,
                "host_monotonic_anchor": 0,
                "device_monotonic_anchor": 0,
                "window": { "start_time_ns": 2000, "end_time_ns": null }
            }
        }
    }"#;

    fn session_with_info() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SESSION_INFO_FILE), INFO).unwrap();
        dir
    }

    #[test]
    fn test_reads_calibration_and_platform() {
        let dir = session_with_info();
        let catalog = JsonSessionCatalog::new();

        let calib = catalog.calibration_params(dir.path(), 0).unwrap();
        assert_eq!(calib.anchor_device_ticks, 484_500_000_000_000);
        assert_eq!(calib.tick_frequency_hz, 100e6);
        assert_eq!(catalog.platform_version(dir.path(), 0).unwrap(), "chip-a");
        assert_eq!(catalog.device_ids(dir.path()).unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_rejects_zero_frequency() {
        let dir = session_with_info();
        let catalog = JsonSessionCatalog::new();
        let err = catalog.calibration_params(dir.path(), 2).unwrap_err();
        assert!(format!("{:#}", err).contains("invalid tick frequency"));
    }

    #[test]
    fn test_device_window_overrides_session_window() {
        let dir = session_with_info();
        let catalog = JsonSessionCatalog::new();

        let session = catalog.window(dir.path(), None).unwrap();
        assert_eq!(session, SessionWindow::new(1000, Some(9000)));

        let device0 = catalog.window(dir.path(), Some(0)).unwrap();
        assert_eq!(device0, session);

        let device2 = catalog.window(dir.path(), Some(2)).unwrap();
        assert_eq!(device2, SessionWindow::new(2000, None));
    }

    #[test]
    fn test_missing_info_and_device_are_errors() {
        let empty = tempfile::tempdir().unwrap();
        let catalog = JsonSessionCatalog::new();
        assert!(catalog.window(empty.path(), None).is_err());

        let dir = session_with_info();
        assert!(catalog.calibration_params(dir.path(), 7).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = session_with_info();
        let info = SessionInfo::load(dir.path()).unwrap();
        let other = tempfile::tempdir().unwrap();
        info.save(other.path()).unwrap();

        let reloaded = SessionInfo::load(other.path()).unwrap();
        assert_eq!(reloaded.devices.len(), 2);
        assert_eq!(reloaded.devices[&2].window, Some(SessionWindow::new(2000, None)));
    }
}
