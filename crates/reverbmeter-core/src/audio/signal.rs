//! Sine sweep stimulus generation
//!
//! Generates the deterministic chirp used as excitation signal. The phase is
//! the closed-form integral of the instantaneous frequency, so the sweep is
//! continuous and never injects broadband clicks.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

/// Full-scale amplitude of a 16-bit sample
pub const FULL_SCALE: f64 = 32767.0;

/// Longest stimulus or capture accepted, in seconds
pub const MAX_DURATION_SECS: f64 = 3600.0;

/// Errors raised while generating a stimulus
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Frequency law of the sweep, fixed per deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepLaw {
    /// Exponential sweep, equal energy per octave
    #[default]
    Logarithmic,
    /// Frequency rises linearly with time
    Linear,
}

impl SweepLaw {
    /// Instantaneous phase in radians at time `t`
    pub fn phase(self, t: f64, start_freq: f64, end_freq: f64, duration: f64) -> f64 {
        match self {
            SweepLaw::Logarithmic => {
                let k = (end_freq / start_freq).ln();
                2.0 * PI * start_freq * duration / k * ((t * k / duration).exp() - 1.0)
            }
            SweepLaw::Linear => {
                let rate = (end_freq - start_freq) / duration;
                2.0 * PI * (start_freq * t + 0.5 * rate * t * t)
            }
        }
    }

    /// Instantaneous frequency in Hz at time `t` (derivative of the phase / 2π)
    pub fn frequency(self, t: f64, start_freq: f64, end_freq: f64, duration: f64) -> f64 {
        match self {
            SweepLaw::Logarithmic => start_freq * (end_freq / start_freq).powf(t / duration),
            SweepLaw::Linear => start_freq + (end_freq - start_freq) * t / duration,
        }
    }
}

/// Fixed-length mono 16-bit signal at a fixed sample rate
///
/// Samples cannot be modified after construction; transformations such as
/// scaling produce a new waveform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waveform {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl Waveform {
    /// Wrap existing samples
    pub fn from_samples(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// All-zero waveform of `len` samples
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::from_samples(vec![0; len], sample_rate)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Peak absolute amplitude
    pub fn peak(&self) -> u16 {
        self.samples
            .iter()
            .map(|s| s.unsigned_abs())
            .max()
            .unwrap_or(0)
    }

    /// Root-mean-square amplitude
    pub fn rms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        (self.energy() / self.samples.len() as f64).sqrt()
    }

    /// Sum of squared samples
    pub fn energy(&self) -> f64 {
        self.samples.iter().map(|&s| (s as f64) * (s as f64)).sum()
    }

    /// True when every sample is zero
    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|&s| s == 0)
    }

    /// Leading `duration` seconds of the waveform (or all of it, if shorter)
    pub fn preview(&self, duration: f64) -> Waveform {
        let len = ((self.sample_rate as f64 * duration.max(0.0)) as usize).min(self.len());
        Waveform::from_samples(self.samples[..len].to_vec(), self.sample_rate)
    }
}

/// Sine sweep generator
///
/// Stateless apart from the configured [`SweepLaw`]: identical arguments
/// always produce bit-identical output.
///
/// # Example
/// ```
/// use reverbmeter_core::audio::signal::{StimulusGenerator, SweepLaw};
///
/// let gen = StimulusGenerator::new(SweepLaw::Logarithmic);
/// let sweep = gen.generate(16000, 500.0, 4000.0, 1.0).unwrap();
/// assert_eq!(sweep.len(), 16000);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct StimulusGenerator {
    law: SweepLaw,
}

impl StimulusGenerator {
    pub fn new(law: SweepLaw) -> Self {
        Self { law }
    }

    pub fn law(&self) -> SweepLaw {
        self.law
    }

    /// Generate a full-scale sweep
    ///
    /// # Arguments
    /// * `sample_rate` - Sample rate in Hz
    /// * `start_freq` - Frequency at t = 0 in Hz
    /// * `end_freq` - Frequency at t = `duration` in Hz
    /// * `duration` - Length in seconds; the waveform has
    ///   `floor(sample_rate * duration)` samples
    ///
    /// # Errors
    /// [`SignalError::InvalidParameter`] when the range is empty or inverted,
    /// the duration or sample rate is not positive, or no samples would result.
    pub fn generate(
        &self,
        sample_rate: u32,
        start_freq: f64,
        end_freq: f64,
        duration: f64,
    ) -> Result<Waveform, SignalError> {
        validate(sample_rate, start_freq, end_freq, duration)?;

        let fs = sample_rate as f64;
        let len = (fs * duration) as usize;
        if len == 0 {
            return Err(SignalError::InvalidParameter(format!(
                "{duration} s at {sample_rate} Hz yields no samples"
            )));
        }

        // Cosine phase and truncation toward zero reproduce the reference
        // chirp stored alongside existing recordings.
        let samples = (0..len)
            .map(|n| {
                let t = n as f64 / fs;
                let phase = self.law.phase(t, start_freq, end_freq, duration);
                (FULL_SCALE * phase.cos()) as i16
            })
            .collect();

        tracing::debug!(
            sample_rate,
            start_freq,
            end_freq,
            duration,
            law = ?self.law,
            samples = len,
            "Generated sweep"
        );

        Ok(Waveform::from_samples(samples, sample_rate))
    }
}

fn validate(
    sample_rate: u32,
    start_freq: f64,
    end_freq: f64,
    duration: f64,
) -> Result<(), SignalError> {
    if sample_rate == 0 {
        return Err(SignalError::InvalidParameter(
            "sample rate must be positive".into(),
        ));
    }
    if !duration.is_finite() || duration <= 0.0 {
        return Err(SignalError::InvalidParameter(format!(
            "duration must be positive, got {duration}"
        )));
    }
    if duration > MAX_DURATION_SECS {
        return Err(SignalError::InvalidParameter(format!(
            "duration {duration} s exceeds {MAX_DURATION_SECS} s"
        )));
    }
    if !start_freq.is_finite() || start_freq <= 0.0 {
        return Err(SignalError::InvalidParameter(format!(
            "start frequency must be positive, got {start_freq}"
        )));
    }
    if !end_freq.is_finite() || end_freq <= start_freq {
        return Err(SignalError::InvalidParameter(format!(
            "end frequency {end_freq} must exceed start frequency {start_freq}"
        )));
    }
    Ok(())
}
