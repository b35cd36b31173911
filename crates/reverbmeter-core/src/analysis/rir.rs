//! Room impulse response extraction
//!
//! The recording is the stimulus convolved with the room. Correlating it with
//! the known reference concentrates the sweep energy at the direct-sound lag;
//! everything after that lag is the room's response.

use crate::audio::signal::{Waveform, FULL_SCALE};
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Regularization of the inverse filter denominator
const INVERSE_EPSILON: f64 = 1e-12;

/// Width of the raised-cosine fade at each edge of the inverse filter band
const BAND_TAPER_OCTAVES: f64 = 1.0 / 6.0;

/// Errors raised during extraction and decay analysis
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("Degenerate signal: {0}")]
    DegenerateSignal(String),

    #[error("Sample rate mismatch: recorded {recorded} Hz, reference {reference} Hz")]
    SampleRateMismatch { recorded: u32, reference: u32 },
}

/// How the impulse response is recovered from the recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Full linear cross-correlation with the reference
    #[default]
    CrossCorrelation,
    /// Regularized spectral division, masked to the sweep band; only the
    /// causal half of the circular result is kept
    InverseFilter,
}

/// Full linear cross-correlation of two sequences
///
/// `values[zero_lag_index + k]` is `sum_n recorded[n + k] * reference[n]` for
/// lags `k` from `-(reference.len() - 1)` to `recorded.len() - 1`.
#[derive(Debug, Clone)]
pub struct Correlation {
    values: Vec<f64>,
    zero_lag_index: usize,
}

impl Correlation {
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn zero_lag_index(&self) -> usize {
        self.zero_lag_index
    }

    /// Value at signed lag `lag`, if inside the correlation
    pub fn at_lag(&self, lag: i64) -> Option<f64> {
        let index = self.zero_lag_index as i64 + lag;
        if index < 0 {
            return None;
        }
        self.values.get(index as usize).copied()
    }

    /// Lags 0, 1, 2, ...
    pub fn non_negative(&self) -> &[f64] {
        self.values.get(self.zero_lag_index..).unwrap_or(&[])
    }
}

/// FFT cross-correlation (rustfft, f64)
pub fn cross_correlate(recorded: &[f64], reference: &[f64]) -> Correlation {
    if recorded.is_empty() || reference.is_empty() {
        return Correlation {
            values: Vec::new(),
            zero_lag_index: 0,
        };
    }

    let full_len = recorded.len() + reference.len() - 1;
    let fft_size = full_len.next_power_of_two();

    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(fft_size);
    let inverse = planner.plan_fft_inverse(fft_size);

    let mut y = padded(recorded, fft_size);
    let mut x = padded(reference, fft_size);
    forward.process(&mut y);
    forward.process(&mut x);

    // Y * conj(X)
    for (a, b) in y.iter_mut().zip(&x) {
        *a *= b.conj();
    }
    inverse.process(&mut y);

    // Negative lags wrap to the end of the circular result
    let scale = 1.0 / fft_size as f64;
    let negative = reference.len() - 1;
    let values = y[fft_size - negative..]
        .iter()
        .chain(&y[..recorded.len()])
        .map(|c| c.re * scale)
        .collect();

    Correlation {
        values,
        zero_lag_index: negative,
    }
}

fn padded(signal: &[f64], len: usize) -> Vec<Complex<f64>> {
    signal
        .iter()
        .map(|&v| Complex::new(v, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(len)
        .collect()
}

/// Index of the largest absolute value (first one on ties)
fn peak_index(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if v.abs() <= b => best,
            _ => Some((i, v.abs())),
        })
        .map(|(i, _)| i)
}

/// Extracted room impulse response
///
/// Sample 0 is the direct sound. `peak_lag` is where it was found in the
/// recording, in samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpulseResponse {
    samples: Vec<f64>,
    sample_rate: u32,
    peak_lag: usize,
}

impl ImpulseResponse {
    pub fn new(samples: Vec<f64>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            peak_lag: 0,
        }
    }

    /// Load a previously persisted response
    pub fn from_waveform(waveform: &Waveform) -> Self {
        Self::new(
            waveform.samples().iter().map(|&s| s as f64).collect(),
            waveform.sample_rate(),
        )
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn peak_lag(&self) -> usize {
        self.peak_lag
    }

    /// Direct-sound arrival in seconds
    pub fn peak_delay_secs(&self) -> f64 {
        self.peak_lag as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Normalize to the absolute peak at 16-bit full scale for persistence
    pub fn to_waveform(&self) -> Waveform {
        let peak = self.samples.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let samples = if peak > 0.0 {
            self.samples
                .iter()
                .map(|&v| (v / peak * FULL_SCALE) as i16)
                .collect()
        } else {
            vec![0; self.samples.len()]
        };
        Waveform::from_samples(samples, self.sample_rate)
    }
}

/// Recovers an [`ImpulseResponse`] from a recording and its reference sweep
///
/// # Example
/// ```
/// use reverbmeter_core::analysis::rir::RirExtractor;
/// use reverbmeter_core::audio::signal::{StimulusGenerator, Waveform};
///
/// let reference = StimulusGenerator::default()
///     .generate(8000, 200.0, 3000.0, 0.5)
///     .unwrap();
/// // Room = pure 25-sample delay
/// let mut delayed = vec![0i16; 25];
/// delayed.extend_from_slice(&reference.samples()[..reference.len() - 25]);
/// let recorded = Waveform::from_samples(delayed, 8000);
///
/// let rir = RirExtractor::default().extract(&recorded, &reference).unwrap();
/// assert_eq!(rir.peak_lag(), 25);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RirExtractor {
    method: ExtractionMethod,
    band: (f64, f64),
}

impl Default for RirExtractor {
    fn default() -> Self {
        Self::new(ExtractionMethod::CrossCorrelation)
    }
}

impl RirExtractor {
    pub fn new(method: ExtractionMethod) -> Self {
        Self {
            method,
            band: (crate::DEFAULT_START_FREQ, crate::DEFAULT_END_FREQ),
        }
    }

    /// Inverse filter restricted to the sweep band `[start_freq, end_freq]`
    pub fn inverse_filter(start_freq: f64, end_freq: f64) -> Self {
        Self::new(ExtractionMethod::InverseFilter).with_band(start_freq, end_freq)
    }

    /// Pass band of the inverse filter; ignored by cross-correlation
    pub fn with_band(mut self, start_freq: f64, end_freq: f64) -> Self {
        self.band = (start_freq, end_freq);
        self
    }

    pub fn method(&self) -> ExtractionMethod {
        self.method
    }

    /// Extract the RIR from `recorded` using the unscaled `reference`
    ///
    /// # Errors
    /// [`ExtractionError::DegenerateSignal`] when the recording is silent or
    /// shorter than the reference, or the reference is empty or silent.
    pub fn extract(
        &self,
        recorded: &Waveform,
        reference: &Waveform,
    ) -> Result<ImpulseResponse, ExtractionError> {
        if recorded.sample_rate() != reference.sample_rate() {
            return Err(ExtractionError::SampleRateMismatch {
                recorded: recorded.sample_rate(),
                reference: reference.sample_rate(),
            });
        }
        if reference.is_empty() || reference.is_silent() {
            return Err(ExtractionError::DegenerateSignal(
                "reference stimulus is empty or silent".into(),
            ));
        }
        if recorded.len() < reference.len() {
            return Err(ExtractionError::DegenerateSignal(format!(
                "recording ({} samples) is shorter than the reference ({} samples)",
                recorded.len(),
                reference.len()
            )));
        }
        if recorded.is_silent() {
            return Err(ExtractionError::DegenerateSignal(
                "recording is silent".into(),
            ));
        }

        let y: Vec<f64> = recorded.samples().iter().map(|&s| s as f64).collect();
        let x: Vec<f64> = reference.samples().iter().map(|&s| s as f64).collect();

        let response = match self.method {
            ExtractionMethod::CrossCorrelation => cross_correlate(&y, &x).non_negative().to_vec(),
            ExtractionMethod::InverseFilter => {
                deconvolve(&y, &x, recorded.sample_rate(), self.band)
            }
        };

        let peak_lag = peak_index(&response).ok_or_else(|| {
            ExtractionError::DegenerateSignal("empty correlation".into())
        })?;
        if response[peak_lag] == 0.0 {
            return Err(ExtractionError::DegenerateSignal(
                "no correlated energy in the recording".into(),
            ));
        }

        tracing::info!(
            method = ?self.method,
            peak_lag,
            delay_ms = peak_lag as f64 * 1000.0 / recorded.sample_rate() as f64,
            rir_samples = response.len() - peak_lag,
            "Impulse response extracted"
        );

        Ok(ImpulseResponse {
            samples: response[peak_lag..].to_vec(),
            sample_rate: recorded.sample_rate(),
            peak_lag,
        })
    }
}

/// Circular regularized deconvolution `Y conj(X) / (|X|^2 + eps)` over the
/// recording length, faded out towards the `band` edges
///
/// Returns lags `0..n/2`; the upper half holds the anti-causal ringing of the
/// band limit.
fn deconvolve(recorded: &[f64], reference: &[f64], sample_rate: u32, band: (f64, f64)) -> Vec<f64> {
    let n = recorded.len();
    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);

    let mut y = padded(recorded, n);
    let mut x = padded(reference, n);
    forward.process(&mut y);
    forward.process(&mut x);

    let bin_hz = sample_rate as f64 / n as f64;
    for (k, (a, b)) in y.iter_mut().zip(&x).enumerate() {
        let freq = k.min(n - k) as f64 * bin_hz;
        let weight = band_weight(freq, band);
        if weight == 0.0 {
            *a = Complex::new(0.0, 0.0);
            continue;
        }
        *a = *a * b.conj() * weight / (b.norm_sqr() + INVERSE_EPSILON);
    }
    inverse.process(&mut y);

    let scale = 1.0 / n as f64;
    y[..n / 2].iter().map(|c| c.re * scale).collect()
}

/// 1 inside the band, 0 outside, raised-cosine (in log frequency) over the
/// innermost [`BAND_TAPER_OCTAVES`] at each edge
fn band_weight(freq: f64, (low, high): (f64, f64)) -> f64 {
    if freq < low || freq > high || freq <= 0.0 {
        return 0.0;
    }
    let fade =
        |octaves: f64| 0.5 - 0.5 * (std::f64::consts::PI * octaves / BAND_TAPER_OCTAVES).cos();

    let above_low = if low > 0.0 {
        (freq / low).log2()
    } else {
        f64::INFINITY
    };
    let below_high = (high / freq).log2();
    let edge = above_low.min(below_high);
    if edge >= BAND_TAPER_OCTAVES {
        1.0
    } else {
        fade(edge)
    }
}
