//! Extraction and decay analysis throughput at the default rig settings

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use reverbmeter::analysis::rir::{cross_correlate, ExtractionMethod, RirExtractor};
use reverbmeter::audio::loopback::exponential_response;
use reverbmeter::audio::signal::{StimulusGenerator, Waveform};
use reverbmeter::DecayAnalyzer;

const RATE: u32 = 16000;

/// Default 5 s sweep and its convolution with a 0.4 s room
fn fixtures() -> (Waveform, Waveform) {
    let reference = StimulusGenerator::default()
        .generate(RATE, 500.0, 4000.0, 5.0)
        .unwrap();
    let response = exponential_response(RATE, 0.4, 32);

    let x = reference.samples();
    let recorded = (0..x.len())
        .map(|n| {
            let y: f64 = response
                .iter()
                .enumerate()
                .take(n + 1)
                .map(|(k, h)| h * x[n - k] as f64)
                .sum();
            y.round() as i16
        })
        .collect();
    (Waveform::from_samples(recorded, RATE), reference)
}

fn bench_extraction(c: &mut Criterion) {
    let (recorded, reference) = fixtures();
    let y: Vec<f64> = recorded.samples().iter().map(|&s| s as f64).collect();
    let x: Vec<f64> = reference.samples().iter().map(|&s| s as f64).collect();

    c.bench_function("cross_correlate 5s@16k", |b| {
        b.iter(|| cross_correlate(black_box(&y), black_box(&x)))
    });

    for method in [ExtractionMethod::CrossCorrelation, ExtractionMethod::InverseFilter] {
        let extractor = RirExtractor::new(method);
        c.bench_function(&format!("extract {method:?}"), |b| {
            b.iter(|| extractor.extract(black_box(&recorded), black_box(&reference)))
        });
    }

    let rir = RirExtractor::default().extract(&recorded, &reference).unwrap();
    let analyzer = DecayAnalyzer::default();
    c.bench_function("decay analysis", |b| {
        b.iter(|| analyzer.analyze(black_box(&rir)))
    });
}

criterion_group!(benches, bench_extraction);
criterion_main!(benches);
