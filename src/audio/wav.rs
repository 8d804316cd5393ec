//! WAV persistence for separated stems and runner scratch files.
//!
//! Outputs are written to a temporary file in the destination directory and
//! renamed into place once the header is finalized, so a reader polling the
//! output directory never sees a half-written stem.

use super::{AudioError, DecodedAudio};
use super::decode::to_mono;
use std::io::BufWriter;
use std::path::Path;
use tempfile::NamedTempFile;

fn encode_err(path: &Path, reason: impl std::fmt::Display) -> AudioError {
    AudioError::Encode {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Write mono samples as 16-bit PCM, atomically replacing `path`.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), AudioError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| encode_err(path, e))?;

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    {
        let mut writer = hound::WavWriter::new(BufWriter::new(tmp.as_file_mut()), spec)
            .map_err(|e| encode_err(path, e))?;
        for sample in samples {
            let s = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(s).map_err(|e| encode_err(path, e))?;
        }
        writer.finalize().map_err(|e| encode_err(path, e))?;
    }

    tmp.as_file().sync_all().map_err(|e| encode_err(path, e))?;
    tmp.persist(path).map_err(|e| encode_err(path, e.error))?;
    Ok(())
}

/// Read a WAV file (integer or float PCM) as mono samples.
pub fn read_wav(path: &Path) -> Result<DecodedAudio, AudioError> {
    let decode_err = |reason: String| AudioError::Decode {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = hound::WavReader::open(path).map_err(|e| decode_err(e.to_string()))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| decode_err(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| decode_err(e.to_string()))?
        }
    };

    Ok(DecodedAudio {
        samples: to_mono(&interleaved, spec.channels as usize),
        sample_rate: spec.sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip_target.wav");
        let samples: Vec<f32> = (0..2400).map(|i| ((i % 100) as f32 / 100.0) - 0.5).collect();

        write_wav(&path, &samples, 24_000).unwrap();

        let audio = read_wav(&path).unwrap();
        assert_eq!(audio.sample_rate, 24_000);
        assert_eq!(audio.samples.len(), samples.len());
        for (a, b) in audio.samples.iter().zip(&samples) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_write_leaves_no_temporary_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip_residual.wav");
        write_wav(&path, &[0.0; 100], 24_000).unwrap();
        write_wav(&path, &[0.1; 200], 24_000).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(read_wav(&path).unwrap().samples.len(), 200);
    }

    #[test]
    fn test_read_missing_file_is_decode_error() {
        let dir = tempdir().unwrap();
        let err = read_wav(&dir.path().join("nope.wav")).unwrap_err();
        assert!(matches!(err, AudioError::Decode { .. }));
    }
}
