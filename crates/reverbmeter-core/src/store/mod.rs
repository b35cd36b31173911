//! Durable storage of raw captures and extracted responses
//!
//! Artifacts are addressed by an opaque session key plus an [`ArtifactKind`].
//! [`DirectoryStore`] keeps them as WAV files in one directory, named the way
//! existing datasets are laid out:
//!
//! - raw capture: `<key>.wav`
//! - extracted impulse response: `<key>_extracted_RIR.wav`

pub mod wav;

use crate::audio::signal::Waveform;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Suffix of files still being written
const PARTIAL_SUFFIX: &str = ".partial";

/// Errors raised by sample stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Unsupported WAV format: {0}")]
    UnsupportedFormat(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    #[error("No {kind:?} artifact stored for {key}")]
    NotFound { key: String, kind: ArtifactKind },
}

/// What a stored waveform is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Capture as recorded by the microphone
    Raw,
    /// Extracted impulse response, peak-normalized
    Rir,
}

impl ArtifactKind {
    /// File name of this artifact for `key`
    pub fn file_name(self, key: &str) -> String {
        match self {
            ArtifactKind::Raw => format!("{key}.wav"),
            ArtifactKind::Rir => format!("{key}_extracted_RIR.wav"),
        }
    }
}

/// Durable WAV sink and source
pub trait SampleStore: Send {
    /// Persist `waveform`, replacing any previous artifact of the same kind
    fn put(&mut self, key: &str, kind: ArtifactKind, waveform: &Waveform) -> Result<(), StoreError>;

    /// Load a previously stored artifact
    fn get(&self, key: &str, kind: ArtifactKind) -> Result<Waveform, StoreError>;

    /// Human readable location of an artifact, for logs
    fn locate(&self, key: &str, kind: ArtifactKind) -> String {
        kind.file_name(key)
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty()
        || key.contains(['/', '\\'])
        || key == "."
        || key == ".."
        || key.ends_with(PARTIAL_SUFFIX)
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Write `bytes` next to `path` and rename into place
///
/// Readers never observe a half-written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let partial = partial_path(path);
    std::fs::write(&partial, bytes)?;
    std::fs::rename(&partial, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&partial);
    })?;
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// WAV files in a single directory
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open (and create if needed) the store directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.file_name(key))
    }

    /// Keys of all raw captures whose key starts with `prefix`
    pub fn raw_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .raw_entries(prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// Most recently modified raw capture whose key starts with `prefix`
    pub fn newest_raw_key(&self, prefix: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .raw_entries(prefix)?
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
            .map(|(key, _)| key))
    }

    fn raw_entries(&self, prefix: &str) -> Result<Vec<(String, SystemTime)>, StoreError> {
        let rir_suffix = ArtifactKind::Rir.file_name("");
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(key) = name.strip_suffix(".wav") else {
                continue;
            };
            if !key.starts_with(prefix) || name.ends_with(&rir_suffix) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            entries.push((key.to_string(), modified));
        }
        entries.sort();
        Ok(entries)
    }
}

impl SampleStore for DirectoryStore {
    fn put(
        &mut self,
        key: &str,
        kind: ArtifactKind,
        waveform: &Waveform,
    ) -> Result<(), StoreError> {
        validate_key(key)?;
        let path = self.path_for(key, kind);
        let bytes = wav::encode(waveform)?;
        write_atomic(&path, &bytes)?;
        tracing::info!(
            path = %path.display(),
            samples = waveform.len(),
            "Stored waveform"
        );
        Ok(())
    }

    fn get(&self, key: &str, kind: ArtifactKind) -> Result<Waveform, StoreError> {
        validate_key(key)?;
        let path = self.path_for(key, kind);
        if !path.exists() {
            return Err(StoreError::NotFound {
                key: key.to_string(),
                kind,
            });
        }
        wav::read_file(&path)
    }

    fn locate(&self, key: &str, kind: ArtifactKind) -> String {
        self.path_for(key, kind).display().to_string()
    }
}

/// In-memory store holding encoded WAV bytes
#[derive(Debug, Default)]
pub struct MemoryStore {
    artifacts: HashMap<(String, ArtifactKind), Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn contains(&self, key: &str, kind: ArtifactKind) -> bool {
        self.artifacts.contains_key(&(key.to_string(), kind))
    }

    /// Stored bytes of an artifact
    pub fn bytes(&self, key: &str, kind: ArtifactKind) -> Option<&[u8]> {
        self.artifacts
            .get(&(key.to_string(), kind))
            .map(Vec::as_slice)
    }
}

impl SampleStore for MemoryStore {
    fn put(
        &mut self,
        key: &str,
        kind: ArtifactKind,
        waveform: &Waveform,
    ) -> Result<(), StoreError> {
        validate_key(key)?;
        let bytes = wav::encode(waveform)?;
        self.artifacts.insert((key.to_string(), kind), bytes);
        Ok(())
    }

    fn get(&self, key: &str, kind: ArtifactKind) -> Result<Waveform, StoreError> {
        let bytes = self.bytes(key, kind).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
            kind,
        })?;
        wav::decode(bytes)
    }
}
