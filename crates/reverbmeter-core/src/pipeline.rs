//! Measurement pipeline
//!
//! Wires the stages together:
//!
//! ```text
//! sweep -> calibration burst -> scale -> full capture -> persist raw
//!       -> extract RIR -> persist RIR -> decay analysis -> reports
//! ```
//!
//! [`MeasurementRig`] owns the device session and the store behind one mutex;
//! a second request while a measurement is in flight is rejected with
//! [`SessionError::Busy`]. [`analyze_recording`] runs the offline half of the
//! pipeline on a previously stored capture.

use crate::analysis::decay::{DecayAnalysis, DecayAnalyzer};
use crate::analysis::rir::{ExtractionError, ExtractionMethod, ImpulseResponse, RirExtractor};
use crate::audio::calibration::{CalibrationError, LevelCalibrator, LevelReport, ScaleFactor};
use crate::audio::engine::DuplexDevice;
use crate::audio::session::{DuplexSession, SessionConfig, SessionError};
use crate::audio::signal::{SignalError, StimulusGenerator, SweepLaw, Waveform};
use crate::report::{self, DecaySummary};
use crate::store::{ArtifactKind, SampleStore, StoreError};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use thiserror::Error;

/// Key prefix of raw recordings
pub const RECORDING_PREFIX: &str = "RIR_";

/// Any failure of a measurement or offline analysis
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Recording is {actual} Hz but the rig is configured for {expected} Hz")]
    SampleRateMismatch { expected: u32, actual: u32 },
}

/// Everything a measurement needs to know, fixed per deployment
#[derive(Debug, Clone)]
pub struct MeasurementSettings {
    pub sample_rate: u32,
    pub sweep_seconds: f64,
    pub start_freq: f64,
    pub end_freq: f64,
    pub sweep_law: SweepLaw,
    /// Extra capture time after the sweep ends
    pub tail_seconds: f64,
    /// Length of the calibration burst; 0 skips calibration
    pub calibration_seconds: f64,
    pub target_peak: u16,
    pub noise_floor: u16,
    pub chunk_frames: usize,
    pub deadline_slack: Duration,
    pub extraction: ExtractionMethod,
    pub min_fit_points: usize,
    pub flatness_ratio: f64,
    pub floor_window_secs: f64,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            sweep_seconds: crate::DEFAULT_SWEEP_SECONDS,
            start_freq: crate::DEFAULT_START_FREQ,
            end_freq: crate::DEFAULT_END_FREQ,
            sweep_law: SweepLaw::Logarithmic,
            tail_seconds: 0.0,
            calibration_seconds: 0.5,
            target_peak: crate::audio::calibration::DEFAULT_TARGET_PEAK,
            noise_floor: crate::audio::calibration::DEFAULT_NOISE_FLOOR,
            chunk_frames: 256,
            deadline_slack: Duration::from_secs(2),
            extraction: ExtractionMethod::CrossCorrelation,
            min_fit_points: crate::analysis::decay::DEFAULT_MIN_FIT_POINTS,
            flatness_ratio: crate::analysis::decay::DEFAULT_FLATNESS_RATIO,
            floor_window_secs: crate::analysis::decay::DEFAULT_FLOOR_WINDOW_SECS,
        }
    }
}

impl MeasurementSettings {
    /// Unscaled full-scale reference sweep
    pub fn reference(&self) -> Result<Waveform, SignalError> {
        StimulusGenerator::new(self.sweep_law).generate(
            self.sample_rate,
            self.start_freq,
            self.end_freq,
            self.sweep_seconds,
        )
    }

    pub fn capture_seconds(&self) -> f64 {
        self.sweep_seconds + self.tail_seconds.max(0.0)
    }

    pub fn calibrator(&self) -> Result<LevelCalibrator, CalibrationError> {
        Ok(LevelCalibrator::new(self.target_peak)?.with_noise_floor(self.noise_floor))
    }

    pub fn extractor(&self) -> RirExtractor {
        RirExtractor::new(self.extraction).with_band(self.start_freq, self.end_freq)
    }

    pub fn analyzer(&self) -> DecayAnalyzer {
        DecayAnalyzer::new()
            .with_min_fit_points(self.min_fit_points)
            .with_flatness_ratio(self.flatness_ratio)
            .with_floor_window(self.floor_window_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            chunk_frames: self.chunk_frames.max(1),
            // One second of audio, never less than a few chunks
            ring_capacity: (self.sample_rate as usize).max(self.chunk_frames * 4),
            deadline_slack: self.deadline_slack,
        }
    }
}

/// Opaque session key `RIR_<label>_<YYYYmmdd_HHMMSS>`
///
/// Characters outside `[A-Za-z0-9_-]` in the label become `_`.
pub fn session_key(label: &str, at: DateTime<Local>) -> String {
    let label: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let label = if label.is_empty() {
        "session".to_string()
    } else {
        label
    };
    format!("{RECORDING_PREFIX}{label}_{}", at.format("%Y%m%d_%H%M%S"))
}

/// Result of the offline half of the pipeline
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub key: String,
    pub rir: ImpulseResponse,
    pub analysis: DecayAnalysis,
    pub summary: DecaySummary,
    /// EDC table and summary log, when a report directory is configured
    pub report_files: Vec<PathBuf>,
}

/// Result of a live measurement
#[derive(Debug, Clone)]
pub struct MeasurementOutcome {
    /// Calibration burst measurement; `None` when calibration was skipped or
    /// the burst was silent
    pub level: Option<LevelReport>,
    pub scale: ScaleFactor,
    pub outcome: AnalysisOutcome,
}

/// Extract, persist, analyze and report one recording
fn process_recording<S: SampleStore + ?Sized>(
    store: &mut S,
    key: &str,
    recorded: &Waveform,
    reference: &Waveform,
    settings: &MeasurementSettings,
    report_dir: Option<&Path>,
    scale: Option<ScaleFactor>,
) -> Result<AnalysisOutcome, PipelineError> {
    let rir = settings.extractor().extract(recorded, reference)?;
    store.put(key, ArtifactKind::Rir, &rir.to_waveform())?;

    let analysis = settings.analyzer().analyze(&rir)?;

    let mut summary = DecaySummary::from_analysis(key, &analysis)
        .with_direct_delay_ms(rir.peak_delay_secs() * 1000.0);
    if let Some(scale) = scale {
        summary = summary.with_scale(scale.value());
    }

    let mut report_files = Vec::new();
    if let Some(dir) = report_dir {
        std::fs::create_dir_all(dir).map_err(StoreError::from)?;
        report_files.push(report::write_edc_csv(dir, key, &analysis.edc)?);
        report_files.push(report::append_summary(dir, &summary)?);
    }

    Ok(AnalysisOutcome {
        key: key.to_string(),
        rir,
        analysis,
        summary,
        report_files,
    })
}

/// Run extraction and analysis on a stored raw capture
///
/// The reference sweep is regenerated from `settings`. A recording shorter
/// than the sweep is analyzed against the matching prefix of the sweep.
pub fn analyze_recording<S: SampleStore + ?Sized>(
    store: &mut S,
    key: &str,
    settings: &MeasurementSettings,
    report_dir: Option<&Path>,
) -> Result<AnalysisOutcome, PipelineError> {
    let recorded = store.get(key, ArtifactKind::Raw)?;
    if recorded.sample_rate() != settings.sample_rate {
        return Err(PipelineError::SampleRateMismatch {
            expected: settings.sample_rate,
            actual: recorded.sample_rate(),
        });
    }

    let mut reference = settings.reference()?;
    if recorded.len() < reference.len() {
        tracing::warn!(
            key,
            recorded = recorded.len(),
            reference = reference.len(),
            "Recording shorter than the sweep; truncating reference"
        );
        reference = Waveform::from_samples(
            reference.samples()[..recorded.len()].to_vec(),
            reference.sample_rate(),
        );
    }

    tracing::info!(key, samples = recorded.len(), "Analyzing stored recording");
    process_recording(store, key, &recorded, &reference, settings, report_dir, None)
}

struct RigState<D: DuplexDevice, S: SampleStore> {
    session: DuplexSession<D>,
    store: S,
}

/// Device session, store and settings for live measurements
///
/// # Example
/// ```
/// use reverbmeter_core::audio::loopback::LoopbackDevice;
/// use reverbmeter_core::{MeasurementRig, MeasurementSettings, MemoryStore};
///
/// let settings = MeasurementSettings {
///     sample_rate: 8000,
///     sweep_seconds: 0.5,
///     start_freq: 200.0,
///     end_freq: 3000.0,
///     calibration_seconds: 0.1,
///     ..Default::default()
/// };
/// let device = LoopbackDevice::new(8000).with_delay(16);
/// let rig = MeasurementRig::new(device, MemoryStore::new(), settings);
/// let measured = rig.measure("doc").unwrap();
/// assert_eq!(measured.outcome.rir.peak_lag(), 16);
/// ```
pub struct MeasurementRig<D: DuplexDevice, S: SampleStore> {
    state: Mutex<RigState<D, S>>,
    settings: MeasurementSettings,
    report_dir: Option<PathBuf>,
    cancel: Arc<AtomicBool>,
}

impl<D: DuplexDevice, S: SampleStore> MeasurementRig<D, S> {
    pub fn new(device: D, store: S, settings: MeasurementSettings) -> Self {
        let session = DuplexSession::with_config(device, settings.session_config());
        let cancel = session.cancel_handle();
        Self {
            state: Mutex::new(RigState { session, store }),
            settings,
            report_dir: None,
            cancel,
        }
    }

    /// Write EDC tables and the summary log into `dir`
    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    pub fn settings(&self) -> &MeasurementSettings {
        &self.settings
    }

    /// Raising this flag aborts the current and all later captures
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Give back the device session and the store
    pub fn into_parts(self) -> (DuplexSession<D>, S) {
        let state = self
            .state
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (state.session, state.store)
    }

    /// Calibrate, capture, persist and analyze one measurement labelled `label`
    ///
    /// # Errors
    /// - [`SessionError::Busy`] when another measurement is running
    /// - any session, extraction or store error; the raw capture stays
    ///   persisted when extraction or analysis fails
    pub fn measure(&self, label: &str) -> Result<MeasurementOutcome, PipelineError> {
        let mut state = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(SessionError::Busy.into()),
            Err(TryLockError::Poisoned(poisoned)) => {
                tracing::warn!("Previous measurement panicked; reusing rig state");
                poisoned.into_inner()
            }
        };
        let RigState { session, store } = &mut *state;

        let settings = &self.settings;
        let reference = settings.reference()?;
        let (level, scale) = self.calibrate(session, &reference)?;

        let stimulus = scale.apply(&reference);
        tracing::info!(
            label,
            scale = scale.value(),
            duration = settings.capture_seconds(),
            "Starting measurement sweep"
        );
        let capture = session.run(stimulus, settings.capture_seconds())?;

        let key = session_key(label, Local::now());
        store.put(&key, ArtifactKind::Raw, capture.recorded())?;
        tracing::info!(
            key = %key,
            location = %store.locate(&key, ArtifactKind::Raw),
            "Raw capture saved"
        );

        let outcome = process_recording(
            store,
            &key,
            capture.recorded(),
            &reference,
            settings,
            self.report_dir.as_deref(),
            Some(scale),
        )?;

        Ok(MeasurementOutcome {
            level,
            scale,
            outcome,
        })
    }

    /// Play the leading burst at unit gain and derive the playback scale
    fn calibrate(
        &self,
        session: &mut DuplexSession<D>,
        reference: &Waveform,
    ) -> Result<(Option<LevelReport>, ScaleFactor), PipelineError> {
        if self.settings.calibration_seconds <= 0.0 {
            return Ok((None, ScaleFactor::UNITY));
        }

        let burst = reference.preview(self.settings.calibration_seconds);
        if burst.is_empty() {
            return Ok((None, ScaleFactor::UNITY));
        }
        let duration = burst.duration_secs();
        let capture = session.run(burst, duration)?;

        match self.settings.calibrator()?.calibrate(capture.recorded()) {
            Ok(report) => Ok((Some(report), report.scale)),
            Err(e @ CalibrationError::SilentCapture { .. }) => {
                tracing::warn!(error = %e, "Falling back to unity playback gain");
                Ok((None, ScaleFactor::UNITY))
            }
            Err(e) => Err(e.into()),
        }
    }
}
