//! 16-bit mono PCM WAV encoding
//!
//! Layout written by [`encode`] (44-byte canonical header, little-endian):
//!
//! ```text
//! "RIFF" | 36 + data | "WAVE" | "fmt " | 16 | 1 (PCM) | 1 (mono) | rate |
//! rate * 2 | 2 | 16 | "data" | data size | samples...
//! ```

use super::StoreError;
use crate::audio::signal::Waveform;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

/// Size of the canonical PCM header
pub const HEADER_LEN: usize = 44;

fn spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

fn write_to<W: Write + Seek>(writer: W, waveform: &Waveform) -> Result<(), StoreError> {
    let mut writer = WavWriter::new(writer, spec(waveform.sample_rate()))?;
    for &s in waveform.samples() {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

fn read_from<R: Read>(reader: R) -> Result<Waveform, StoreError> {
    let mut reader = WavReader::new(reader)?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int
    {
        return Err(StoreError::UnsupportedFormat(format!(
            "{} channel(s), {}-bit {:?}; expected mono 16-bit PCM",
            spec.channels, spec.bits_per_sample, spec.sample_format
        )));
    }
    let samples = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
    Ok(Waveform::from_samples(samples, spec.sample_rate))
}

/// Serialize to WAV bytes
pub fn encode(waveform: &Waveform) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + waveform.len() * 2);
    write_to(Cursor::new(&mut bytes), waveform)?;
    Ok(bytes)
}

/// Parse WAV bytes; only mono 16-bit integer PCM is accepted
pub fn decode(bytes: &[u8]) -> Result<Waveform, StoreError> {
    read_from(Cursor::new(bytes))
}

/// Write a WAV file
pub fn write_file(path: &Path, waveform: &Waveform) -> Result<(), StoreError> {
    let file = std::io::BufWriter::new(std::fs::File::create(path)?);
    write_to(file, waveform)
}

/// Read a WAV file
pub fn read_file(path: &Path) -> Result<Waveform, StoreError> {
    let file = std::io::BufReader::new(std::fs::File::open(path)?);
    read_from(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    fn le_u16(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([bytes[at], bytes[at + 1]])
    }

    #[test]
    fn test_canonical_header() {
        let wave = Waveform::from_samples(vec![0, 1, -1, i16::MAX, i16::MIN], 16000);
        let bytes = encode(&wave).unwrap();

        assert_eq!(bytes.len(), HEADER_LEN + 10);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(le_u32(&bytes, 4), 36 + 10);
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(&bytes[12..16], b"fmt ");
        assert_eq!(le_u32(&bytes, 16), 16);
        assert_eq!(le_u16(&bytes, 20), 1);
        assert_eq!(le_u16(&bytes, 22), 1);
        assert_eq!(le_u32(&bytes, 24), 16000);
        assert_eq!(le_u32(&bytes, 28), 32000);
        assert_eq!(le_u16(&bytes, 32), 2);
        assert_eq!(le_u16(&bytes, 34), 16);
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(le_u32(&bytes, 40), 10);
        assert_eq!(&bytes[44..], &[0, 0, 1, 0, 0xff, 0xff, 0xff, 0x7f, 0x00, 0x80]);
    }

    #[test]
    fn test_round_trip_is_bit_identical() {
        let samples: Vec<i16> = (0..4096).map(|i| ((i * 40503) % 65536) as u16 as i16).collect();
        let wave = Waveform::from_samples(samples, 44100);
        let decoded = decode(&encode(&wave).unwrap()).unwrap();
        assert_eq!(decoded, wave);
    }

    #[test]
    fn test_rejects_stereo() {
        let stereo = WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut bytes = Vec::new();
        {
            let mut writer = WavWriter::new(Cursor::new(&mut bytes), stereo).unwrap();
            writer.write_sample(1i16).unwrap();
            writer.write_sample(2i16).unwrap();
            writer.finalize().unwrap();
        }
        assert!(matches!(decode(&bytes), Err(StoreError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(decode(b"not a wav file"), Err(StoreError::Wav(_))));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.wav");
        let wave = Waveform::from_samples(vec![5, -5, 300, -300], 8000);
        write_file(&path, &wave).unwrap();
        assert_eq!(read_file(&path).unwrap(), wave);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 44 + 8);
    }
}
