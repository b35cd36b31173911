//! E2E tests for sweep generation
//!
//! Verifies the properties of the measurement sweep that the correlation
//! stage relies on: exact length, determinism, frequency law and continuity.

use reverbmeter::audio::signal::{SignalError, StimulusGenerator, SweepLaw, FULL_SCALE};
use std::f64::consts::PI;

/// Count sign changes in `samples`
fn zero_crossings(samples: &[i16]) -> usize {
    samples
        .windows(2)
        .filter(|w| (w[0] >= 0) != (w[1] >= 0))
        .count()
}

/// Test that the sweep length is floor(rate * duration) for awkward durations
#[test]
fn test_sweep_length_property() {
    let gen = StimulusGenerator::default();
    for (rate, duration, expected) in [
        (16000, 5.0, 80000),
        (16000, 0.25, 4000),
        (44100, 0.1, 4410),
        (48000, 0.75, 36000),
        (8000, 0.00013, 1),
    ] {
        let sweep = gen.generate(rate, 500.0, 4000.0, duration).unwrap();
        assert_eq!(sweep.len(), expected, "{duration} s at {rate} Hz");
        assert_eq!(sweep.sample_rate(), rate);
    }
}

/// Test that identical arguments give bit-identical sweeps
#[test]
fn test_sweep_is_deterministic() {
    for law in [SweepLaw::Logarithmic, SweepLaw::Linear] {
        let gen = StimulusGenerator::new(law);
        let a = gen.generate(16000, 500.0, 4000.0, 2.0).unwrap();
        let b = gen.generate(16000, 500.0, 4000.0, 2.0).unwrap();
        assert_eq!(a, b, "{law:?} sweep must be reproducible");
    }
}

/// Test that the sweep starts at full scale and never exceeds it
#[test]
fn test_sweep_amplitude() {
    let sweep = StimulusGenerator::default()
        .generate(16000, 500.0, 4000.0, 1.0)
        .unwrap();
    assert_eq!(sweep.samples()[0], FULL_SCALE as i16);
    assert!(sweep.peak() <= FULL_SCALE as u16);

    // A sine at full scale has RMS of about 0.707 FS
    let rms = sweep.rms() / FULL_SCALE;
    assert!((rms - 0.707).abs() < 0.01, "rms = {rms}");
}

/// Test that a 48 kHz sweep has no discontinuities
///
/// The largest step a sinusoid of frequency f can make between samples is
/// 2 pi f / fs of full scale.
#[test]
fn test_sweep_continuity_at_48k() {
    let (fs, f0, f1) = (48000u32, 500.0, 4000.0);
    let sweep = StimulusGenerator::default()
        .generate(fs, f0, f1, 2.0)
        .unwrap();

    let max_step = 2.0 * PI * f1 / fs as f64 * FULL_SCALE + 2.0;
    for (i, w) in sweep.samples().windows(2).enumerate() {
        let step = (w[1] as f64 - w[0] as f64).abs();
        assert!(step <= max_step, "jump of {step} at sample {i}");
    }
}

/// Test that the instantaneous frequency follows the configured law
///
/// Zero crossings over a short window estimate the local frequency: two
/// crossings per period.
#[test]
fn test_sweep_frequency_law() {
    let fs = 48000u32;
    let duration = 4.0;
    let window = fs as usize / 20;

    for law in [SweepLaw::Logarithmic, SweepLaw::Linear] {
        let sweep = StimulusGenerator::new(law)
            .generate(fs, 500.0, 4000.0, duration)
            .unwrap();
        let samples = sweep.samples();

        for t in [0.5, 2.0, 3.5] {
            let center = (t * fs as f64) as usize;
            let slice = &samples[center - window / 2..center + window / 2];
            let measured = zero_crossings(slice) as f64 / 2.0 / (window as f64 / fs as f64);
            let expected = law.frequency(t, 500.0, 4000.0, duration);
            let error = (measured - expected).abs() / expected;
            assert!(
                error < 0.05,
                "{law:?} at {t} s: measured {measured:.0} Hz, expected {expected:.0} Hz"
            );
        }
    }
}

/// Test that the log sweep spends equal time per octave
#[test]
fn test_log_sweep_octaves() {
    let law = SweepLaw::Logarithmic;
    // 500 -> 4000 Hz is three octaves over three seconds
    let f = |t| law.frequency(t, 500.0, 4000.0, 3.0);
    assert!((f(0.0) - 500.0).abs() < 1e-9);
    assert!((f(1.0) - 1000.0).abs() < 1e-9);
    assert!((f(2.0) - 2000.0).abs() < 1e-9);
    assert!((f(3.0) - 4000.0).abs() < 1e-9);
}

/// Test that invalid parameters are rejected before any sample is produced
#[test]
fn test_invalid_parameters() {
    let gen = StimulusGenerator::default();
    let cases = [
        (0, 500.0, 4000.0, 1.0),
        (16000, 500.0, 4000.0, 0.0),
        (16000, 500.0, 4000.0, -1.0),
        (16000, 500.0, 4000.0, f64::NAN),
        (16000, 0.0, 4000.0, 1.0),
        (16000, 4000.0, 500.0, 1.0),
        (16000, 500.0, 500.0, 1.0),
        (16000, 500.0, 4000.0, 1e-6),
    ];
    for (rate, f0, f1, duration) in cases {
        assert!(
            matches!(
                gen.generate(rate, f0, f1, duration),
                Err(SignalError::InvalidParameter(_))
            ),
            "({rate}, {f0}, {f1}, {duration}) should be rejected"
        );
    }
}

/// Test that the calibration preview is a prefix of the sweep
#[test]
fn test_preview_is_prefix() {
    let sweep = StimulusGenerator::default()
        .generate(16000, 500.0, 4000.0, 5.0)
        .unwrap();
    let preview = sweep.preview(0.5);
    assert_eq!(preview.len(), 8000);
    assert_eq!(preview.samples(), &sweep.samples()[..8000]);

    // Longer than the sweep: the whole sweep
    assert_eq!(sweep.preview(10.0), sweep);
}
