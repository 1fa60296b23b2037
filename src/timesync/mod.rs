//! Device-to-Host Time Synchronization
//!
//! Converts device timestamps onto the host epoch timeline:
//!
//! ```text
//! ┌─────────────────────┐     ┌──────────────────────┐
//! │  DEVICE TICK DOMAIN │     │ DEVICE MONO DOMAIN   │
//! │  (syscnt, N Hz)     │     │ (device monotonic ns)│
//! └──────────┬──────────┘     └──────────┬───────────┘
//!            │ ticks_to_host_ns          │ monotonic_sample_to_host_ns
//!            ▼                           ▼
//!        ┌────────────────────────────────────┐
//!        │ HOST EPOCH (HpFloat, sub-ns exact) │
//!        └─────────────────┬──────────────────┘
//!                          │ clamp_to_session
//!                          ▼
//!                 u64 host-epoch nanoseconds
//! ```
//!
//! All conversions are pure. Callers reject calibrations with a zero or
//! non-finite frequency before converting (see `CalibrationParams::validate`).
//! Counter wraparound is not modelled: a tick below the anchor maps to a
//! time before the anchor.

mod hpfloat;

pub use hpfloat::HpFloat;

use serde::{Deserialize, Deserializer, Serialize};

/// Nanoseconds per second, as used in the tick conversion.
pub const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Sentinel some collectors write for "no end marker captured".
pub const UNKNOWN_END_SENTINEL: u64 = u64::MAX;

// =============================================================================
// CALIBRATION
// =============================================================================

/// Per (session, device) clock calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    /// Device tick counter value sampled at the anchor instant.
    pub anchor_device_ticks: u64,
    /// Host epoch time (ns) at the anchor instant.
    pub anchor_host_time_ns: u64,
    /// Tick counter frequency.
    pub tick_frequency_hz: f64,
    /// Host epoch reading (ns) paired with `device_monotonic_anchor`.
    pub host_monotonic_anchor: u64,
    /// Device monotonic clock reading (ns) at the pairing instant.
    pub device_monotonic_anchor: u64,
}

impl CalibrationParams {
    /// Reject calibrations that cannot produce a safe timestamp.
    pub fn validate(&self) -> Result<(), String> {
        if !self.tick_frequency_hz.is_finite() || self.tick_frequency_hz <= 0.0 {
            return Err(format!(
                "invalid tick frequency {} Hz",
                self.tick_frequency_hz
            ));
        }
        Ok(())
    }
}

/// Device ticks to host epoch nanoseconds.
///
/// The tick delta is formed in exact integer arithmetic before any scaling,
/// so the large anchor never cancels against the sample.
pub fn ticks_to_host_ns(device_ticks: u64, calib: &CalibrationParams) -> HpFloat {
    let delta = device_ticks as i128 - calib.anchor_device_ticks as i128;
    let scaled = HpFloat::from_i128(delta) * HpFloat::from_f64(NANOS_PER_SEC)
        / HpFloat::from_f64(calib.tick_frequency_hz);
    HpFloat::from_u64(calib.anchor_host_time_ns) + scaled
}

/// Device monotonic sample (ns) to host epoch nanoseconds.
pub fn monotonic_sample_to_host_ns(device_sample_ns: u64, calib: &CalibrationParams) -> HpFloat {
    let offset = calib.host_monotonic_anchor as i128 - calib.device_monotonic_anchor as i128;
    HpFloat::from_i128(device_sample_ns as i128 + offset)
}

// =============================================================================
// SESSION WINDOW
// =============================================================================

/// Validity window of a session (host epoch ns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start_time_ns: u64,
    /// `None` when no explicit end marker was captured.
    #[serde(default, deserialize_with = "deserialize_end_time")]
    pub end_time_ns: Option<u64>,
    #[serde(default)]
    pub base_time_ns: u64,
}

fn deserialize_end_time<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<u64> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|&v| v != UNKNOWN_END_SENTINEL))
}

impl SessionWindow {
    pub fn new(start_time_ns: u64, end_time_ns: Option<u64>) -> Self {
        Self {
            start_time_ns,
            end_time_ns,
            base_time_ns: 0,
        }
    }
}

/// Where a timestamp falls relative to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPosition {
    Before,
    Inside,
    After,
}

/// Locate a timestamp relative to the window. Bounds are inclusive.
pub fn locate_in_window(ts: HpFloat, window: &SessionWindow) -> WindowPosition {
    if ts < HpFloat::from_u64(window.start_time_ns) {
        return WindowPosition::Before;
    }
    match window.end_time_ns {
        Some(end) if ts > HpFloat::from_u64(end) => WindowPosition::After,
        _ => WindowPosition::Inside,
    }
}

/// Round to the nearest nanosecond and clamp into the window.
///
/// The only place sub-nanosecond precision is dropped. Non-finite inputs
/// anchor to the window start.
pub fn clamp_to_session(ts: HpFloat, window: &SessionWindow) -> u64 {
    let start = window.start_time_ns as i128;
    let rounded = match ts.round_to_i128() {
        Some(v) => v,
        None => return window.start_time_ns,
    };
    let mut clamped = rounded.max(start);
    if let Some(end) = window.end_time_ns {
        clamped = clamped.min(end.max(window.start_time_ns) as i128);
    }
    clamped.min(u64::MAX as i128) as u64
}
