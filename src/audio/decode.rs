//! # Audio Decoding
//!
//! Turns an uploaded file (mp3, wav, flac, m4a/aac, ogg) into mono `f32`
//! samples, resampled to whatever rate the separation model expects.
//!
//! ## Pipeline:
//! 1. **Probe** the container with symphonia, using the file extension as a hint
//! 2. **Decode** every packet of the first audio track, skipping corrupt frames
//! 3. **Downmix** interleaved channels to mono by averaging
//! 4. **Resample** with rubato when the source rate differs from the model rate

use super::{AudioError, DecodedAudio};
use rubato::{FftFixedInOut, Resampler};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, trace};

/// Frames fed to the resampler per call.
const RESAMPLE_CHUNK: usize = 1024;

/// Decode an audio file to mono samples at its native sample rate.
pub fn decode_mono(path: &Path) -> Result<DecodedAudio, AudioError> {
    let decode_err = |reason: String| AudioError::Decode {
        path: path.to_path_buf(),
        reason,
    };

    let file = std::fs::File::open(path).map_err(|e| decode_err(format!("Failed to open file: {}", e)))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| decode_err(format!("Unrecognised audio format: {}", e)))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| decode_err("No audio tracks found".to_string()))?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let mut sample_rate = codec_params.sample_rate.unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| decode_err(format!("Unsupported codec: {}", e)))?;

    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(decode_err(format!("Failed to read packet: {}", e))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                trace!("Skipping corrupted frame: {}", e);
                continue;
            }
            Err(e) => return Err(decode_err(format!("Decode error: {}", e))),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        let channels = spec.channels.count().max(1);

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend(to_mono(buffer.samples(), channels));
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(decode_err("File contains no decodable audio".to_string()));
    }

    let audio = DecodedAudio { samples, sample_rate };
    debug!(
        "Decoded {}: {} samples @ {}Hz ({:.2}s)",
        path.display(),
        audio.samples.len(),
        audio.sample_rate,
        audio.duration_seconds()
    );

    Ok(audio)
}

/// Decode and bring the audio to `target_rate`.
pub fn decode_at_rate(path: &Path, target_rate: u32) -> Result<DecodedAudio, AudioError> {
    let decoded = decode_mono(path)?;
    if decoded.sample_rate == target_rate {
        return Ok(decoded);
    }

    let samples = resample(&decoded.samples, decoded.sample_rate, target_rate)?;
    Ok(DecodedAudio {
        samples,
        sample_rate: target_rate,
    })
}

/// Convert interleaved multi-channel audio to mono.
pub fn to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Number of frames `frames` occupies once converted from `from_rate` to `to_rate`.
pub fn resampled_len(frames: usize, from_rate: u32, to_rate: u32) -> usize {
    ((frames as f64) * to_rate as f64 / from_rate as f64).round() as usize
}

/// FFT-based resampling of a mono signal.
///
/// The resampler's filter delay is removed, so a sound at time `t` stays at
/// time `t`, and the result is trimmed to exactly [`resampled_len`] frames.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, AudioError> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedInOut::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 1)
        .map_err(|e| AudioError::Resample(format!("{} -> {}Hz: {}", from_rate, to_rate, e)))?;

    let frames_in = resampler.input_frames_next();
    let delay = resampler.output_delay();
    let expected = resampled_len(samples.len(), from_rate, to_rate);
    let wanted = expected + delay;
    let mut output = Vec::with_capacity(wanted + resampler.output_frames_next());

    // Zero chunks past the end flush what the filter is still holding.
    let mut pos = 0;
    while output.len() < wanted {
        let mut chunk = if pos < samples.len() {
            samples[pos..(pos + frames_in).min(samples.len())].to_vec()
        } else {
            Vec::new()
        };
        chunk.resize(frames_in, 0.0);

        let processed = resampler
            .process(&[chunk], None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        if let Some(channel) = processed.into_iter().next() {
            output.extend(channel);
        }

        pos += frames_in;
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}
