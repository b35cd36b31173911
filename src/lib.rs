//! Reverbmeter - room reverberation time measurement
//!
//! This library re-exports the measurement pipeline from `reverbmeter-core`
//! and adds the persisted application configuration used by the CLI.

pub mod config;

pub use reverbmeter_core::analysis;
pub use reverbmeter_core::audio;
pub use reverbmeter_core::pipeline;
pub use reverbmeter_core::report;
pub use reverbmeter_core::store;

pub use reverbmeter_core::{
    DecayAnalyzer, DirectoryStore, ImpulseResponse, LoopbackDevice, MeasurementRig,
    MeasurementSettings, RirExtractor, StimulusGenerator, Waveform,
};
pub use reverbmeter_core::{BUILD_DATE, DEFAULT_SAMPLE_RATE, VERSION};
