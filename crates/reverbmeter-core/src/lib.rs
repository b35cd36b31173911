//! Reverbmeter Core - Sweep measurement and reverberation time analysis
//!
//! This library implements the acquisition and analysis pipeline used to
//! measure the reverberation time (T60) of a room from a single fixed
//! source/receiver position:
//!
//! 1. A deterministic sine sweep is generated ([`audio::signal`])
//! 2. A short preview calibrates playback level ([`audio::calibration`])
//! 3. The scaled sweep is played while the room is recorded ([`audio::session`])
//! 4. The room impulse response is recovered by correlation ([`analysis::rir`])
//! 5. The Schroeder decay curve is fitted for T20/T25/T30 ([`analysis::decay`])

pub mod analysis;
pub mod audio;
pub mod pipeline;
pub mod report;
pub mod store;

pub use analysis::decay::{DecayAnalysis, DecayAnalyzer, EnergyDecayCurve, T60Estimate, T60Method};
pub use analysis::rir::{ExtractionMethod, ImpulseResponse, RirExtractor};
pub use audio::calibration::{LevelCalibrator, ScaleFactor};
pub use audio::engine::{CpalDevice, DuplexDevice};
pub use audio::loopback::LoopbackDevice;
pub use audio::session::{CaptureSession, DuplexSession, SessionError};
pub use audio::signal::{StimulusGenerator, SweepLaw, Waveform};
pub use pipeline::{
    analyze_recording, session_key, MeasurementRig, MeasurementSettings, PipelineError,
};
pub use store::{ArtifactKind, DirectoryStore, MemoryStore, SampleStore};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default sample rate of the measurement rig (matches existing datasets)
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

/// Default sweep and capture duration in seconds
pub const DEFAULT_SWEEP_SECONDS: f64 = 5.0;

/// Default sweep start frequency in Hz
pub const DEFAULT_START_FREQ: f64 = 500.0;

/// Default sweep end frequency in Hz
pub const DEFAULT_END_FREQ: f64 = 4000.0;
