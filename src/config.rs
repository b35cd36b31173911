//! Persistent application configuration
//!
//! Stores device selection, sweep parameters, and analysis tuning in a JSON
//! file at `<data_dir>/reverbmeter/config.json`. Every field has a default, so
//! partial files load.

use reverbmeter_core::analysis::rir::ExtractionMethod;
use reverbmeter_core::audio::signal::SweepLaw;
use reverbmeter_core::MeasurementSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_sample_rate() -> u32 {
    reverbmeter_core::DEFAULT_SAMPLE_RATE
}

fn default_sweep_seconds() -> f64 {
    reverbmeter_core::DEFAULT_SWEEP_SECONDS
}

fn default_start_freq() -> f64 {
    reverbmeter_core::DEFAULT_START_FREQ
}

fn default_end_freq() -> f64 {
    reverbmeter_core::DEFAULT_END_FREQ
}

fn default_calibration_seconds() -> f64 {
    0.5
}

fn default_target_peak() -> u16 {
    reverbmeter_core::audio::calibration::DEFAULT_TARGET_PEAK
}

fn default_noise_floor() -> u16 {
    reverbmeter_core::audio::calibration::DEFAULT_NOISE_FLOOR
}

fn default_chunk_frames() -> usize {
    256
}

fn default_deadline_slack_secs() -> f64 {
    2.0
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("rir_analysis_output")
}

fn default_min_fit_points() -> usize {
    reverbmeter_core::analysis::decay::DEFAULT_MIN_FIT_POINTS
}

fn default_flatness_ratio() -> f64 {
    reverbmeter_core::analysis::decay::DEFAULT_FLATNESS_RATIO
}

fn default_floor_window_ms() -> f64 {
    reverbmeter_core::analysis::decay::DEFAULT_FLOOR_WINDOW_SECS * 1000.0
}

/// Persistent application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Capture device name (None = host default)
    #[serde(default)]
    pub input_device: Option<String>,
    /// Playback device name (None = host default)
    #[serde(default)]
    pub output_device: Option<String>,
    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Sweep (and capture) length in seconds
    #[serde(default = "default_sweep_seconds")]
    pub sweep_seconds: f64,
    #[serde(default = "default_start_freq")]
    pub start_freq: f64,
    #[serde(default = "default_end_freq")]
    pub end_freq: f64,
    #[serde(default)]
    pub sweep_law: SweepLaw,
    /// Extra capture after the sweep, in seconds
    #[serde(default)]
    pub tail_seconds: f64,
    /// Calibration burst length in seconds (0 disables calibration)
    #[serde(default = "default_calibration_seconds")]
    pub calibration_seconds: f64,
    /// Captured peak the calibration aims for
    #[serde(default = "default_target_peak")]
    pub target_peak: u16,
    /// Calibration captures at or below this peak count as silent
    #[serde(default = "default_noise_floor")]
    pub noise_floor: u16,
    #[serde(default = "default_chunk_frames")]
    pub chunk_frames: usize,
    #[serde(default = "default_deadline_slack_secs")]
    pub deadline_slack_secs: f64,
    /// Recordings, responses and reports
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub extraction_method: ExtractionMethod,
    #[serde(default = "default_min_fit_points")]
    pub min_fit_points: usize,
    #[serde(default = "default_flatness_ratio")]
    pub flatness_ratio: f64,
    #[serde(default = "default_floor_window_ms")]
    pub floor_window_ms: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            sample_rate: default_sample_rate(),
            sweep_seconds: default_sweep_seconds(),
            start_freq: default_start_freq(),
            end_freq: default_end_freq(),
            sweep_law: SweepLaw::default(),
            tail_seconds: 0.0,
            calibration_seconds: default_calibration_seconds(),
            target_peak: default_target_peak(),
            noise_floor: default_noise_floor(),
            chunk_frames: default_chunk_frames(),
            deadline_slack_secs: default_deadline_slack_secs(),
            output_dir: default_output_dir(),
            extraction_method: ExtractionMethod::default(),
            min_fit_points: default_min_fit_points(),
            flatness_ratio: default_flatness_ratio(),
            floor_window_ms: default_floor_window_ms(),
        }
    }
}

impl AppConfig {
    /// Config file path: `<data_dir>/reverbmeter/config.json`
    pub fn path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("reverbmeter")
            .join("config.json")
    }

    /// Load config from the default path, falling back to defaults on any error
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from `path`, falling back to defaults on any error
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to parse config, using defaults"
                    );
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }

    /// Measurement parameters for the core pipeline
    pub fn to_settings(&self) -> MeasurementSettings {
        MeasurementSettings {
            sample_rate: self.sample_rate,
            sweep_seconds: self.sweep_seconds,
            start_freq: self.start_freq,
            end_freq: self.end_freq,
            sweep_law: self.sweep_law,
            tail_seconds: self.tail_seconds,
            calibration_seconds: self.calibration_seconds,
            target_peak: self.target_peak,
            noise_floor: self.noise_floor,
            chunk_frames: self.chunk_frames,
            deadline_slack: Duration::try_from_secs_f64(self.deadline_slack_secs.max(0.0))
                .unwrap_or(Duration::MAX),
            extraction: self.extraction_method,
            min_fit_points: self.min_fit_points,
            flatness_ratio: self.flatness_ratio,
            floor_window_secs: self.floor_window_ms / 1000.0,
        }
    }
}
