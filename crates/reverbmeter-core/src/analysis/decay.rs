//! Schroeder decay analysis
//!
//! Integrates the squared impulse response backwards into an Energy Decay
//! Curve and fits straight lines to fixed level windows of it. Each fit is
//! extrapolated to a 60 dB decay:
//!
//! | Estimator | Window (dB)  |
//! |-----------|--------------|
//! | T20       | -5 .. -25    |
//! | T25       | -5 .. -30    |
//! | T30       | -5 .. -35    |
//!
//! A fit is only trusted when its window ends above the detected noise floor.

use super::rir::{ExtractionError, ImpulseResponse};
use serde::Serialize;
use std::fmt;

/// Level assigned where no energy remains
pub const EDC_FLOOR_DB: f64 = -300.0;

/// Upper bound shared by every fit window
pub const FIT_START_DB: f64 = -5.0;

/// Level span below the fit start used as the reference decay rate when
/// looking for the noise floor
pub const REFERENCE_SPAN_DB: f64 = 10.0;

pub const DEFAULT_MIN_FIT_POINTS: usize = 8;
pub const DEFAULT_FLATNESS_RATIO: f64 = 0.1;
pub const DEFAULT_FLOOR_WINDOW_SECS: f64 = 0.020;

/// Estimator variant, named after the decay range it fits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum T60Method {
    T20,
    T25,
    T30,
}

impl T60Method {
    pub const ALL: [T60Method; 3] = [T60Method::T20, T60Method::T25, T60Method::T30];

    /// (upper, lower) bounds of the fit window in dB
    pub fn window(self) -> (f64, f64) {
        match self {
            T60Method::T20 => (FIT_START_DB, -25.0),
            T60Method::T25 => (FIT_START_DB, -30.0),
            T60Method::T30 => (FIT_START_DB, -35.0),
        }
    }
}

impl fmt::Display for T60Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            T60Method::T20 => "T20",
            T60Method::T25 => "T25",
            T60Method::T30 => "T30",
        };
        f.write_str(name)
    }
}

/// Why an estimate carries no T60
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    /// Too few curve samples inside the window
    InsufficientPoints,
    /// The window reaches into the noise floor
    InsufficientDynamicRange,
    /// The fitted line does not fall
    NonDecaying,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InvalidReason::InsufficientPoints => "insufficient points",
            InvalidReason::InsufficientDynamicRange => "insufficient dynamic range",
            InvalidReason::NonDecaying => "non-decaying",
        };
        f.write_str(text)
    }
}

/// Energy Decay Curve: (time, level) samples, non-increasing, starting at 0 dB
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyDecayCurve {
    times: Vec<f64>,
    levels_db: Vec<f64>,
    sample_rate: u32,
}

impl EnergyDecayCurve {
    /// Reverse (Schroeder) integration of the squared response
    ///
    /// # Errors
    /// [`ExtractionError::DegenerateSignal`] when the response holds no energy.
    pub fn from_impulse_response(rir: &ImpulseResponse) -> Result<Self, ExtractionError> {
        let mut remaining = vec![0.0f64; rir.len()];
        let mut acc = 0.0;
        for (slot, &v) in remaining.iter_mut().zip(rir.samples()).rev() {
            acc += v * v;
            *slot = acc;
        }

        let total = remaining.first().copied().unwrap_or(0.0);
        if total <= 0.0 {
            return Err(ExtractionError::DegenerateSignal(
                "impulse response holds no energy".into(),
            ));
        }

        let levels_db = remaining
            .iter()
            .map(|&e| {
                if e > 0.0 {
                    (10.0 * (e / total).log10()).max(EDC_FLOOR_DB)
                } else {
                    EDC_FLOOR_DB
                }
            })
            .collect();

        Ok(Self::from_levels(levels_db, rir.sample_rate()))
    }

    /// Wrap an already computed curve sampled at `sample_rate`
    pub fn from_levels(levels_db: Vec<f64>, sample_rate: u32) -> Self {
        let fs = sample_rate as f64;
        let times = (0..levels_db.len()).map(|i| i as f64 / fs).collect();
        Self {
            times,
            levels_db,
            sample_rate,
        }
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn levels_db(&self) -> &[f64] {
        &self.levels_db
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.levels_db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels_db.is_empty()
    }

    /// (time, level) pairs
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.times.iter().copied().zip(self.levels_db.iter().copied())
    }

    fn first_at_or_below(&self, level_db: f64) -> Option<usize> {
        self.levels_db.iter().position(|&l| l <= level_db)
    }
}

/// Where the curve stops decaying
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NoiseFloor {
    /// First curve index at the floor; fits only use samples before it
    pub index: usize,
    /// Curve level at `index` (or the final level when no flattening was found)
    pub level_db: f64,
    /// Whether a flat region was actually found
    pub detected: bool,
}

/// One T60 estimator result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct T60Estimate {
    pub method: T60Method,
    /// (upper, lower) bounds of the fit window in dB
    pub window: (f64, f64),
    /// Fitted slope in dB/s (NaN when fewer than two points)
    pub slope: f64,
    /// Fitted level at t = 0 in dB
    pub intercept: f64,
    /// `-60 / slope`; `None` unless valid
    pub t60_seconds: Option<f64>,
    pub valid: bool,
    /// Curve samples used by the fit
    pub points: usize,
    pub invalid_reason: Option<InvalidReason>,
}

impl T60Estimate {
    fn invalid(
        method: T60Method,
        points: usize,
        fit: Option<(f64, f64)>,
        reason: InvalidReason,
    ) -> Self {
        let (slope, intercept) = fit.unwrap_or((f64::NAN, f64::NAN));
        Self {
            method,
            window: method.window(),
            slope,
            intercept,
            t60_seconds: None,
            valid: false,
            points,
            invalid_reason: Some(reason),
        }
    }
}

/// Curve plus every estimator, invalid ones included
#[derive(Debug, Clone)]
pub struct DecayAnalysis {
    pub edc: EnergyDecayCurve,
    /// In [`T60Method::ALL`] order
    pub estimates: Vec<T60Estimate>,
    pub noise_floor: NoiseFloor,
}

impl DecayAnalysis {
    pub fn estimate(&self, method: T60Method) -> Option<&T60Estimate> {
        self.estimates.iter().find(|e| e.method == method)
    }

    /// T60 of `method`, if that estimator is valid
    pub fn t60(&self, method: T60Method) -> Option<f64> {
        self.estimate(method).and_then(|e| e.t60_seconds)
    }

    /// T30 when valid, otherwise T20
    pub fn preferred(&self) -> Option<&T60Estimate> {
        [T60Method::T30, T60Method::T20]
            .iter()
            .filter_map(|&m| self.estimate(m))
            .find(|e| e.valid)
    }

    pub fn any_valid(&self) -> bool {
        self.estimates.iter().any(|e| e.valid)
    }
}

/// Decay rate in dB/s over the first [`REFERENCE_SPAN_DB`] below `start`
///
/// Falls back to the slope from the first sample to `start` when the curve
/// drops through the whole span in a single step.
fn reference_decay_rate(edc: &EnergyDecayCurve, start: usize) -> f64 {
    let levels = edc.levels_db();
    let times = edc.times();
    let stop_level = levels[start] - REFERENCE_SPAN_DB;
    let end = levels[start..]
        .iter()
        .position(|&level| level < stop_level)
        .map_or(levels.len(), |offset| start + offset);

    match linear_fit(&times[start..end], &levels[start..end]) {
        Some((slope, _)) => slope,
        None => (levels[start] - levels[0]) / (times[start] - times[0]),
    }
}

/// Least squares line through (x, y); `None` for fewer than two distinct x
fn linear_fit(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean_x = x[..n].iter().sum::<f64>() / nf;
    let mean_y = y[..n].iter().sum::<f64>() / nf;

    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (&xi, &yi) in x[..n].iter().zip(&y[..n]) {
        sxy += (xi - mean_x) * (yi - mean_y);
        sxx += (xi - mean_x) * (xi - mean_x);
    }
    if sxx == 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    Some((slope, mean_y - slope * mean_x))
}

/// Computes the decay curve and the T20/T25/T30 estimates
///
/// # Example
/// ```
/// use reverbmeter_core::analysis::decay::{DecayAnalyzer, EnergyDecayCurve, T60Method};
///
/// // Straight 60 dB/s decay sampled at 1 kHz
/// let levels = (0..2000).map(|i| -60.0 * i as f64 / 1000.0).collect();
/// let edc = EnergyDecayCurve::from_levels(levels, 1000);
/// let analysis = DecayAnalyzer::default().analyze_edc(edc);
/// let t30 = analysis.t60(T60Method::T30).unwrap();
/// assert!((t30 - 1.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DecayAnalyzer {
    min_fit_points: usize,
    flatness_ratio: f64,
    floor_window_secs: f64,
}

impl Default for DecayAnalyzer {
    fn default() -> Self {
        Self {
            min_fit_points: DEFAULT_MIN_FIT_POINTS,
            flatness_ratio: DEFAULT_FLATNESS_RATIO,
            floor_window_secs: DEFAULT_FLOOR_WINDOW_SECS,
        }
    }
}

impl DecayAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fewest curve samples a fit may use (at least 2)
    pub fn with_min_fit_points(mut self, points: usize) -> Self {
        self.min_fit_points = points.max(2);
        self
    }

    /// Fraction of the reference decay rate below which the curve counts as flat
    pub fn with_flatness_ratio(mut self, ratio: f64) -> Self {
        self.flatness_ratio = ratio;
        self
    }

    /// Length of the sliding window used for noise floor detection
    pub fn with_floor_window(mut self, seconds: f64) -> Self {
        self.floor_window_secs = seconds;
        self
    }

    /// EDC and estimators for an impulse response
    ///
    /// # Errors
    /// [`ExtractionError::DegenerateSignal`] when the response has no energy.
    pub fn analyze(&self, rir: &ImpulseResponse) -> Result<DecayAnalysis, ExtractionError> {
        let edc = EnergyDecayCurve::from_impulse_response(rir)?;
        Ok(self.analyze_edc(edc))
    }

    /// Estimators for a prepared curve
    pub fn analyze_edc(&self, edc: EnergyDecayCurve) -> DecayAnalysis {
        let noise_floor = self.detect_noise_floor(&edc);
        tracing::debug!(
            index = noise_floor.index,
            level_db = noise_floor.level_db,
            detected = noise_floor.detected,
            "Noise floor"
        );

        let estimates: Vec<T60Estimate> = T60Method::ALL
            .iter()
            .map(|&method| self.fit(&edc, method, &noise_floor))
            .collect();

        for e in &estimates {
            match (e.t60_seconds, e.invalid_reason) {
                (Some(t60), _) => tracing::info!(
                    method = %e.method,
                    t60,
                    slope = e.slope,
                    points = e.points,
                    "T60 estimate"
                ),
                (None, reason) => tracing::info!(
                    method = %e.method,
                    reason = ?reason,
                    points = e.points,
                    "T60 estimate invalid"
                ),
            }
        }
        if !estimates.iter().any(|e| e.valid) {
            tracing::warn!("No valid T60 estimate; decay range too short for every window");
        }

        DecayAnalysis {
            edc,
            estimates,
            noise_floor,
        }
    }

    /// Slide a window from the fit start; the first window decaying slower
    /// than `flatness_ratio` times the reference decay rate marks the floor
    ///
    /// The reference rate is fitted over the [`REFERENCE_SPAN_DB`] following
    /// the first crossing of [`FIT_START_DB`], so a direct sound stronger
    /// than the reverberant tail does not inflate it.
    fn detect_noise_floor(&self, edc: &EnergyDecayCurve) -> NoiseFloor {
        let levels = edc.levels_db();
        let times = edc.times();
        let not_found = NoiseFloor {
            index: levels.len(),
            level_db: levels.last().copied().unwrap_or(0.0),
            detected: false,
        };

        let Some(start) = edc.first_at_or_below(FIT_START_DB) else {
            return not_found;
        };
        if start == 0 {
            return not_found;
        }
        let reference_rate = reference_decay_rate(edc, start);
        if reference_rate.is_nan() || reference_rate >= 0.0 {
            return not_found;
        }

        let window = ((self.floor_window_secs * edc.sample_rate() as f64).round() as usize).max(2);
        let threshold = self.flatness_ratio * reference_rate.abs();
        if levels.len() < start + window {
            return not_found;
        }

        for i in start..=(levels.len() - window) {
            let Some((slope, _)) = linear_fit(&times[i..i + window], &levels[i..i + window])
            else {
                continue;
            };
            if slope.abs() < threshold {
                return NoiseFloor {
                    index: i,
                    level_db: levels[i],
                    detected: true,
                };
            }
        }
        not_found
    }

    fn fit(&self, edc: &EnergyDecayCurve, method: T60Method, floor: &NoiseFloor) -> T60Estimate {
        let (upper, lower) = method.window();
        let usable = floor.index.min(edc.len());

        let (x, y): (Vec<f64>, Vec<f64>) = edc
            .points()
            .take(usable)
            .filter(|&(_, level)| level <= upper && level >= lower)
            .unzip();
        let points = x.len();
        let line = linear_fit(&x, &y);

        if lower <= floor.level_db {
            return T60Estimate::invalid(
                method,
                points,
                line,
                InvalidReason::InsufficientDynamicRange,
            );
        }
        if points < self.min_fit_points {
            return T60Estimate::invalid(method, points, line, InvalidReason::InsufficientPoints);
        }
        let Some((slope, intercept)) = line else {
            return T60Estimate::invalid(method, points, None, InvalidReason::InsufficientPoints);
        };
        if slope >= 0.0 {
            return T60Estimate::invalid(method, points, line, InvalidReason::NonDecaying);
        }

        T60Estimate {
            method,
            window: (upper, lower),
            slope,
            intercept,
            t60_seconds: Some(-60.0 / slope),
            valid: true,
            points,
            invalid_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn linear_curve(rate_db_per_sec: f64, seconds: f64, sample_rate: u32) -> EnergyDecayCurve {
        let n = (seconds * sample_rate as f64) as usize;
        let levels = (0..n)
            .map(|i| rate_db_per_sec * i as f64 / sample_rate as f64)
            .collect();
        EnergyDecayCurve::from_levels(levels, sample_rate)
    }

    #[test]
    fn test_edc_monotonic_and_starts_at_zero() {
        let samples: Vec<f64> = (0..4000)
            .map(|i| (((i * 7919) % 200) as f64 - 100.0) * (-(i as f64) * 0.001).exp())
            .collect();
        let rir = ImpulseResponse::new(samples, 8000);
        let edc = EnergyDecayCurve::from_impulse_response(&rir).unwrap();

        assert_eq!(edc.levels_db()[0], 0.0);
        for pair in edc.levels_db().windows(2) {
            assert!(pair[1] <= pair[0], "{} > {}", pair[1], pair[0]);
        }
    }

    #[test]
    fn test_edc_trailing_silence_is_clamped() {
        let rir = ImpulseResponse::new(vec![1.0, 0.5, 0.0, 0.0], 1000);
        let edc = EnergyDecayCurve::from_impulse_response(&rir).unwrap();
        let levels = edc.levels_db();
        assert_eq!(levels[0], 0.0);
        assert_relative_eq!(levels[1], 10.0 * (0.25f64 / 1.25).log10(), epsilon = 1e-12);
        assert_eq!(levels[2], EDC_FLOOR_DB);
        assert_eq!(levels[3], EDC_FLOOR_DB);
    }

    #[test]
    fn test_edc_rejects_silent_response() {
        let rir = ImpulseResponse::new(vec![0.0; 16], 1000);
        assert!(matches!(
            EnergyDecayCurve::from_impulse_response(&rir),
            Err(ExtractionError::DegenerateSignal(_))
        ));
        let empty = ImpulseResponse::new(Vec::new(), 1000);
        assert!(EnergyDecayCurve::from_impulse_response(&empty).is_err());
    }

    #[test]
    fn test_exact_decay_all_estimators() {
        let analysis = DecayAnalyzer::default().analyze_edc(linear_curve(-60.0, 2.0, 1000));
        assert!(!analysis.noise_floor.detected);
        for method in T60Method::ALL {
            let e = analysis.estimate(method).unwrap();
            assert!(e.valid, "{method} invalid: {:?}", e.invalid_reason);
            assert_relative_eq!(e.t60_seconds.unwrap(), 1.0, max_relative = 1e-9);
            assert_relative_eq!(e.intercept, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_exponential_response_t60() {
        // Energy falls 60 dB per second
        let fs = 16000;
        let decay = 3.0 * 10f64.ln() / fs as f64;
        let samples = (0..2 * fs).map(|n| (-decay * n as f64).exp()).collect();
        let rir = ImpulseResponse::new(samples, fs as u32);

        let analysis = DecayAnalyzer::default().analyze(&rir).unwrap();
        for method in T60Method::ALL {
            let t60 = analysis.t60(method).unwrap();
            assert!((t60 - 1.0).abs() < 0.01, "{method}: {t60}");
        }
    }

    #[test]
    fn test_flat_floor_invalidates_long_windows() {
        let fs = 1000;
        let levels: Vec<f64> = (0..3000)
            .map(|i| (-60.0 * i as f64 / fs as f64).max(-29.0))
            .collect();
        let analysis =
            DecayAnalyzer::default().analyze_edc(EnergyDecayCurve::from_levels(levels, fs));

        assert!(analysis.noise_floor.detected);
        assert!(analysis.noise_floor.level_db <= -28.0);

        let t20 = analysis.estimate(T60Method::T20).unwrap();
        assert!(t20.valid);
        assert_relative_eq!(t20.t60_seconds.unwrap(), 1.0, max_relative = 1e-6);

        for method in [T60Method::T25, T60Method::T30] {
            let e = analysis.estimate(method).unwrap();
            assert!(!e.valid);
            assert_eq!(e.t60_seconds, None);
            assert_eq!(e.invalid_reason, Some(InvalidReason::InsufficientDynamicRange));
        }
        assert_eq!(analysis.preferred().unwrap().method, T60Method::T20);
    }

    #[test]
    fn test_direct_sound_step_is_not_a_floor() {
        // Direct sound carries most of the energy: the curve steps to -8 dB
        // and then decays at 120 dB/s
        let fs = 8000;
        let levels: Vec<f64> = (0..8000)
            .map(|i| match i {
                0 => 0.0,
                _ => -8.0 - 120.0 * i as f64 / fs as f64,
            })
            .collect();
        let analysis =
            DecayAnalyzer::default().analyze_edc(EnergyDecayCurve::from_levels(levels, fs));

        assert!(!analysis.noise_floor.detected);
        for method in T60Method::ALL {
            let e = analysis.estimate(method).unwrap();
            assert!(e.valid, "{method} invalid: {:?}", e.invalid_reason);
            assert_relative_eq!(e.t60_seconds.unwrap(), 0.5, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_reference_rate_skips_direct_step() {
        let levels: Vec<f64> = (0..100)
            .map(|i| match i {
                0 => 0.0,
                _ => -8.0 - i as f64 * 0.1,
            })
            .collect();
        let edc = EnergyDecayCurve::from_levels(levels, 1000);
        assert_relative_eq!(reference_decay_rate(&edc, 1), -100.0, max_relative = 1e-9);

        // Whole span crossed in one step: slope up to the crossing
        let edc = EnergyDecayCurve::from_levels(vec![0.0, -2.0, -40.0, -60.0], 1000);
        assert_relative_eq!(reference_decay_rate(&edc, 2), -20000.0, max_relative = 1e-9);
    }

    #[test]
    fn test_too_few_points() {
        // 60 dB/s at 100 Hz: the -5..-25 window holds 33 samples, so
        // require more than that
        let analysis = DecayAnalyzer::default()
            .with_min_fit_points(50)
            .analyze_edc(linear_curve(-60.0, 2.0, 100));
        let e = analysis.estimate(T60Method::T20).unwrap();
        assert_eq!(e.invalid_reason, Some(InvalidReason::InsufficientPoints));
        assert!(e.slope < 0.0);
    }

    #[test]
    fn test_all_invalid_is_reported() {
        let analysis = DecayAnalyzer::default().analyze_edc(linear_curve(-60.0, 0.2, 1000));
        assert_eq!(analysis.estimates.len(), 3);
        assert!(!analysis.any_valid());
        assert!(analysis.preferred().is_none());
    }

    #[test]
    fn test_rising_curve_is_non_decaying() {
        // Drops to -34 dB, climbs back to -6 dB, then falls away to -80 dB.
        // A zero flatness ratio disables floor detection.
        let levels: Vec<f64> = (0..400)
            .map(|i| match i {
                0 => 0.0,
                1..=280 => -34.0 + (i - 1) as f64 * 0.1,
                _ => -80.0,
            })
            .collect();
        let analysis = DecayAnalyzer::default()
            .with_flatness_ratio(0.0)
            .analyze_edc(EnergyDecayCurve::from_levels(levels, 1000));
        assert!(!analysis.noise_floor.detected);
        let e = analysis.estimate(T60Method::T30).unwrap();
        assert_eq!(e.invalid_reason, Some(InvalidReason::NonDecaying));
    }

    #[test]
    fn test_linear_fit() {
        let (slope, intercept) = linear_fit(&[0.0, 1.0, 2.0], &[1.0, 3.0, 5.0]).unwrap();
        assert_relative_eq!(slope, 2.0);
        assert_relative_eq!(intercept, 1.0);
        assert!(linear_fit(&[1.0], &[1.0]).is_none());
        assert!(linear_fit(&[2.0, 2.0], &[1.0, 3.0]).is_none());
    }
}
