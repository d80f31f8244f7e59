//! # Direction of Arrival
//!
//! Data model and source abstraction for the microphone-array bearing signal.
//!
//! Two coordinate frames are in play:
//! - **Sensor frame** (DSP native): 0 = left, π/2 = front, π = right.
//! - **Normalized frame** (what the rest of the daemon speaks): 0 = front,
//!   positive to the subject's left, negative to the right, range (−π, π].
//!
//! Sources produce raw [`Reading`]s in both frames; the [`tracker`] turns
//! them into smoothed, confidence-scored [`DoaResult`]s.

pub mod tracker;

use std::f64::consts::FRAC_PI_2;
use std::f64::consts::PI;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;

/// Number of microphones in the array; enhanced per-mic vectors are this long.
pub const MIC_COUNT: usize = 4;

/// Bounds for the energy-based distance estimate, in meters.
const MIN_DISTANCE_M: f64 = 0.3;
const MAX_DISTANCE_M: f64 = 5.0;

/// A single raw measurement from a DOA source.
///
/// The enhanced fields (`speech_energy`, `mic_azimuths`, `total_energy`) are
/// best-effort: a source that cannot obtain them zero-fills them, and that is
/// not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    /// Bearing in the normalized frame (0 = front, + = left), radians.
    pub angle: f64,
    /// Bearing in the sensor frame (0 = left, π/2 = front), radians.
    pub raw_angle: f64,
    /// Instantaneous voice-activity flag.
    pub speaking: bool,
    /// Wall-clock capture time.
    pub timestamp: DateTime<Utc>,
    /// Wall-clock time spent producing this reading, milliseconds.
    pub latency_ms: i64,
    /// Per-microphone speech energy, zero if unavailable.
    pub speech_energy: [f64; MIC_COUNT],
    /// Per-microphone azimuth in the sensor frame, zero if unavailable.
    pub mic_azimuths: [f64; MIC_COUNT],
    /// Sum of `speech_energy`.
    pub total_energy: f64,
}

impl Default for Reading {
    fn default() -> Self {
        Self {
            angle: 0.0,
            raw_angle: 0.0,
            speaking: false,
            timestamp: DateTime::UNIX_EPOCH,
            latency_ms: 0,
            speech_energy: [0.0; MIC_COUNT],
            mic_azimuths: [0.0; MIC_COUNT],
            total_energy: 0.0,
        }
    }
}

impl Reading {
    /// Estimated speaker position in meters, derived from total speech energy
    /// and the bearing. `reference_energy` is the calibration constant: the
    /// energy observed from a speaker at one meter.
    ///
    /// Returns the origin when no one is speaking or no energy is available.
    /// The distance estimate is clamped to a plausible indoor range.
    pub fn estimated_position(&self, reference_energy: f64) -> (f64, f64) {
        if !self.speaking || self.total_energy <= 0.0 {
            return (0.0, 0.0);
        }

        let distance =
            (reference_energy / self.total_energy).sqrt().clamp(MIN_DISTANCE_M, MAX_DISTANCE_M);

        (distance * self.angle.cos(), distance * self.angle.sin())
    }
}

/// A tracker output: one [`Reading`] plus the derived signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DoaResult {
    #[serde(flatten)]
    pub reading: Reading,

    /// Exponentially smoothed bearing, radians, normalized frame.
    pub smoothed_angle: f64,
    /// Confidence score in [0, 1].
    pub confidence: f64,
    /// Debounced voice-activity flag; stays asserted for the latch window
    /// after the last raw `speaking` observation.
    pub speaking_latched: bool,
    /// Estimated forward position, meters.
    pub est_x: f64,
    /// Estimated lateral position, meters (positive = left).
    pub est_y: f64,
}

/// A provider of raw DOA readings.
///
/// Implementations must be safe to share across tasks; all operations on the
/// underlying device are expected to be serialized internally.
#[async_trait]
pub trait DoaSource: Send + Sync {
    /// Produce one reading. `timestamp` is assigned no later than return and
    /// `latency_ms` is measured inside the call.
    async fn get_doa(&self, cancel: &CancellationToken) -> Result<Reading, SourceError>;

    /// Last-known operational status.
    fn healthy(&self) -> bool;

    /// Stable identifier for telemetry.
    fn name(&self) -> &'static str;

    /// Release the underlying device. Idempotent; subsequent `get_doa` calls
    /// return [`SourceError::Closed`].
    async fn close(&self) -> Result<(), SourceError>;
}

/// Sensor frame → normalized frame.
pub fn to_normalized(raw: f64) -> f64 {
    FRAC_PI_2 - raw
}

/// Normalized frame → sensor frame.
pub fn from_normalized(normalized: f64) -> f64 {
    FRAC_PI_2 - normalized
}

/// Wrap an angle into (−π, π].
pub fn normalize_angle(mut angle: f64) -> f64 {
    while angle > PI {
        angle -= 2.0 * PI;
    }
    while angle < -PI {
        angle += 2.0 * PI;
    }
    angle
}
