//! WAV file loading and saving
//!
//! Integer PCM (16/24/32-bit) and 32-bit float files are decoded into
//! normalized f32. Anything else is rejected before the core initializes.

use super::buffer::AudioBuffer;
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading the reference/room recordings
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Audio file not found: {0}")]
    NotFound(String),

    #[error("Unsupported sample encoding in {path}: {format}")]
    UnsupportedFormat { path: String, format: String },

    #[error("Sample rates must match: reference {reference} Hz, room {room} Hz")]
    ConfigMismatch { reference: u32, room: u32 },

    #[error("Processed buffer has {actual} frames, reference has {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Load a WAV file into an [`AudioBuffer`]
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<AudioBuffer, LoadError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(LoadError::NotFound(path.display().to_string()));
    }

    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()?,
        (hound::SampleFormat::Int, bits @ (16 | 24 | 32)) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()?
        }
        (format, bits) => {
            return Err(LoadError::UnsupportedFormat {
                path: path.display().to_string(),
                format: format!("{:?} {}-bit", format, bits),
            })
        }
    };

    let buffer = AudioBuffer::new(samples, spec.sample_rate, spec.channels);
    tracing::info!(
        path = %path.display(),
        sample_rate = buffer.sample_rate(),
        channels = buffer.channels(),
        "Loaded {:.1}s of audio",
        buffer.duration_secs()
    );
    Ok(buffer)
}

/// Save a buffer as 16-bit PCM
pub fn write_wav<P: AsRef<Path>>(path: P, buffer: &AudioBuffer) -> Result<(), LoadError> {
    let path = path.as_ref();
    let spec = hound::WavSpec {
        channels: buffer.channels(),
        sample_rate: buffer.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in buffer.samples() {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(value)?;
    }
    writer.finalize()?;
    tracing::info!(path = %path.display(), frames = buffer.frames(), "Saved audio");
    Ok(())
}
