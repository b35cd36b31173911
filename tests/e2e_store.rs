//! E2E tests for WAV persistence
//!
//! Round-trips recordings through a [`DirectoryStore`] on disk and checks
//! that the files interoperate with other WAV tooling.

use reverbmeter::audio::signal::{StimulusGenerator, Waveform};
use reverbmeter::store::{wav, ArtifactKind, DirectoryStore, SampleStore, StoreError};
use std::fs;
use std::time::{Duration, SystemTime};

fn recording() -> Waveform {
    StimulusGenerator::default()
        .generate(16000, 500.0, 4000.0, 0.5)
        .unwrap()
}

/// Test that raw captures and responses land under their conventional names
#[test]
fn test_file_layout() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DirectoryStore::open(dir.path().join("out")).unwrap();
    let waveform = recording();

    store.put("RIR_hall_20240101_120000", ArtifactKind::Raw, &waveform).unwrap();
    store.put("RIR_hall_20240101_120000", ArtifactKind::Rir, &waveform).unwrap();

    let mut names: Vec<String> = fs::read_dir(store.root())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "RIR_hall_20240101_120000.wav".to_string(),
            "RIR_hall_20240101_120000_extracted_RIR.wav".to_string(),
        ]
    );
}

/// Test that a stored recording reads back sample for sample
#[test]
fn test_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DirectoryStore::open(dir.path()).unwrap();
    let waveform = recording();

    store.put("RIR_a", ArtifactKind::Raw, &waveform).unwrap();
    assert_eq!(store.get("RIR_a", ArtifactKind::Raw).unwrap(), waveform);

    let path = store.path_for("RIR_a", ArtifactKind::Raw);
    assert_eq!(
        fs::metadata(&path).unwrap().len() as usize,
        wav::HEADER_LEN + waveform.len() * 2
    );
}

/// Test that files written by the store open in a plain WAV reader
#[test]
fn test_interoperates_with_hound() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DirectoryStore::open(dir.path()).unwrap();
    let waveform = recording();
    store.put("RIR_b", ArtifactKind::Raw, &waveform).unwrap();

    let mut reader = hound::WavReader::open(store.path_for("RIR_b", ArtifactKind::Raw)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, 16000);
    assert_eq!(spec.bits_per_sample, 16);
    let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(samples, waveform.samples());
}

/// Test that recordings from other tools are accepted only as mono 16-bit PCM
#[test]
fn test_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirectoryStore::open(dir.path()).unwrap();

    let mono = hound::WavSpec {
        channels: 1,
        sample_rate: 48000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(dir.path().join("RIR_mono.wav"), mono).unwrap();
    for s in [0i16, 1000, -1000, 32767] {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
    let loaded = store.get("RIR_mono", ArtifactKind::Raw).unwrap();
    assert_eq!(loaded.samples(), &[0, 1000, -1000, 32767]);
    assert_eq!(loaded.sample_rate(), 48000);

    let float = hound::WavSpec {
        channels: 1,
        sample_rate: 48000,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(dir.path().join("RIR_float.wav"), float).unwrap();
    writer.write_sample(0.5f32).unwrap();
    writer.finalize().unwrap();
    assert!(matches!(
        store.get("RIR_float", ArtifactKind::Raw),
        Err(StoreError::UnsupportedFormat(_))
    ));
}

/// Test that batch discovery lists raw captures and picks the newest one
#[test]
fn test_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DirectoryStore::open(dir.path()).unwrap();
    let waveform = Waveform::from_samples(vec![1, 2, 3], 16000);

    for key in ["RIR_b", "RIR_a", "RIR_c", "other"] {
        store.put(key, ArtifactKind::Raw, &waveform).unwrap();
    }
    store.put("RIR_a", ArtifactKind::Rir, &waveform).unwrap();
    fs::write(dir.path().join("notes.txt"), "not audio").unwrap();

    assert_eq!(store.raw_keys("RIR_").unwrap(), vec!["RIR_a", "RIR_b", "RIR_c"]);

    // Make RIR_a the most recently modified capture
    let future = SystemTime::now() + Duration::from_secs(3600);
    fs::File::options()
        .write(true)
        .open(store.path_for("RIR_a", ArtifactKind::Raw))
        .unwrap()
        .set_modified(future)
        .unwrap();
    assert_eq!(store.newest_raw_key("RIR_").unwrap().as_deref(), Some("RIR_a"));
    assert_eq!(store.newest_raw_key("NONE_").unwrap(), None);
}

/// Test that missing artifacts and unsafe keys are reported, not panicked on
#[test]
fn test_missing_and_invalid_keys() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DirectoryStore::open(dir.path()).unwrap();

    assert!(matches!(
        store.get("RIR_missing", ArtifactKind::Rir),
        Err(StoreError::NotFound { kind: ArtifactKind::Rir, .. })
    ));
    for key in ["", "../escape", "a/b", ".."] {
        assert!(matches!(
            store.put(key, ArtifactKind::Raw, &recording()),
            Err(StoreError::InvalidKey(_))
        ));
    }
}
