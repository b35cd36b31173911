//! Playback level self-calibration
//!
//! A short preview of the sweep is played at unit gain while the microphone
//! records. The captured peak decides how much the full sweep may be scaled
//! so that the capture lands at the target peak without clipping.

use super::signal::{Waveform, FULL_SCALE};
use serde::Serialize;
use thiserror::Error;

/// Default calibration target: half of full scale (-6 dBFS)
pub const DEFAULT_TARGET_PEAK: u16 = 16384;

/// Captured peaks at or below this level are indistinguishable from noise
pub const DEFAULT_NOISE_FLOOR: u16 = 32;

/// Errors raised during calibration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    /// Nothing measurable was captured. Recoverable: callers fall back to
    /// [`ScaleFactor::UNITY`].
    #[error("Calibration capture is silent (peak {peak} <= noise floor {noise_floor})")]
    SilentCapture { peak: u16, noise_floor: u16 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Gain in (0, 1] applied uniformly to the stimulus before playback
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct ScaleFactor(f64);

impl ScaleFactor {
    /// Safe default when calibration is not possible
    pub const UNITY: ScaleFactor = ScaleFactor(1.0);

    /// Build a scale factor, clamping into (0, 1]
    ///
    /// Returns `None` for non-finite or non-positive values.
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && value > 0.0 {
            Some(Self(value.min(1.0)))
        } else {
            None
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Largest magnitude a scaled full-scale sample can reach
    pub fn scaled_full_scale(self) -> i16 {
        (FULL_SCALE * self.0).round() as i16
    }

    /// Scale every sample, rounding half away from zero and saturating
    pub fn apply(self, waveform: &Waveform) -> Waveform {
        let samples = waveform
            .samples()
            .iter()
            .map(|&s| (s as f64 * self.0).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16)
            .collect();
        Waveform::from_samples(samples, waveform.sample_rate())
    }
}

impl Default for ScaleFactor {
    fn default() -> Self {
        Self::UNITY
    }
}

/// Measurement of the calibration burst
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LevelReport {
    /// Peak absolute amplitude of the captured burst
    pub peak: u16,
    /// RMS amplitude of the captured burst
    pub rms: f64,
    /// Derived playback gain
    pub scale: ScaleFactor,
}

/// Derives the playback gain from a captured calibration burst
///
/// # Example
/// ```
/// use reverbmeter_core::audio::calibration::LevelCalibrator;
/// use reverbmeter_core::audio::signal::Waveform;
///
/// let calibrator = LevelCalibrator::new(16384).unwrap();
/// let capture = Waveform::from_samples(vec![0, 20000, -32000, 100], 16000);
/// let report = calibrator.calibrate(&capture).unwrap();
/// assert!((report.scale.value() - 16384.0 / 32000.0).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LevelCalibrator {
    target_peak: u16,
    noise_floor: u16,
}

impl LevelCalibrator {
    /// Create a calibrator aiming the captured peak at `target_peak`
    pub fn new(target_peak: u16) -> Result<Self, CalibrationError> {
        if target_peak == 0 || target_peak > i16::MAX as u16 {
            return Err(CalibrationError::InvalidParameter(format!(
                "target peak must be in 1..=32767, got {target_peak}"
            )));
        }
        Ok(Self {
            target_peak,
            noise_floor: DEFAULT_NOISE_FLOOR,
        })
    }

    /// Override the device noise floor
    pub fn with_noise_floor(mut self, noise_floor: u16) -> Self {
        self.noise_floor = noise_floor;
        self
    }

    pub fn target_peak(&self) -> u16 {
        self.target_peak
    }

    pub fn noise_floor(&self) -> u16 {
        self.noise_floor
    }

    /// Measure the burst captured while the preview played at unit gain
    ///
    /// `scale = min(target_peak / measured_peak, 1.0)`: a quiet room never
    /// raises the gain above unity.
    ///
    /// # Errors
    /// [`CalibrationError::SilentCapture`] when the measured peak does not
    /// clear the noise floor.
    pub fn calibrate(&self, capture: &Waveform) -> Result<LevelReport, CalibrationError> {
        let peak = capture.peak();
        let rms = capture.rms();

        if peak <= self.noise_floor {
            return Err(CalibrationError::SilentCapture {
                peak,
                noise_floor: self.noise_floor,
            });
        }

        let raw = self.target_peak as f64 / peak as f64;
        let scale = ScaleFactor::new(raw).unwrap_or(ScaleFactor::UNITY);

        tracing::info!(
            peak,
            rms,
            target = self.target_peak,
            scale = scale.value(),
            "Calibration burst measured"
        );

        Ok(LevelReport { peak, rms, scale })
    }
}
