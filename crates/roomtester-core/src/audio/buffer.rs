//! Immutable sample buffers and the names of the three playable sources

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three signals the testbed can play and measure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Source {
    /// Original reference signal
    #[serde(rename = "ref")]
    Reference,
    /// Microphone re-recording of the reference in the room
    #[serde(rename = "room")]
    Room,
    /// Reference convolved with the estimated room IR
    #[serde(rename = "processed")]
    Processed,
}

impl Source {
    /// All sources in export order
    pub const ALL: [Source; 3] = [Source::Reference, Source::Room, Source::Processed];

    /// Wire name used in JSON messages, history files and export rows
    pub fn name(self) -> &'static str {
        match self {
            Source::Reference => "ref",
            Source::Room => "room",
            Source::Processed => "processed",
        }
    }

    /// Parse a wire name, `None` for anything unknown
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ref" => Some(Source::Reference),
            "room" => Some(Source::Room),
            "processed" => Some(Source::Processed),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Interleaved f32 samples with their sample rate and channel count
///
/// Lengths and positions elsewhere in the crate are expressed in frames
/// (one sample per channel).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl AudioBuffer {
    /// Wrap interleaved samples
    ///
    /// A trailing partial frame is dropped so that `samples.len()` is always a
    /// multiple of `channels`.
    pub fn new(mut samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1);
        let whole = samples.len() - samples.len() % channels as usize;
        samples.truncate(whole);
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Build a buffer by duplicating a mono signal onto `channels` channels
    pub fn from_mono(mono: &[f32], sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1);
        if channels == 1 {
            return Self::new(mono.to_vec(), sample_rate, 1);
        }
        let mut samples = Vec::with_capacity(mono.len() * channels as usize);
        for &s in mono {
            samples.extend(std::iter::repeat(s).take(channels as usize));
        }
        Self::new(samples, sample_rate, channels)
    }

    /// Interleaved samples
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds (frames / sample rate)
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Sample of `channel` in `frame`; channels past the last one repeat it
    ///
    /// Returns 0.0 past the end of the buffer.
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> f32 {
        let channels = self.channels as usize;
        let ch = channel.min(channels - 1);
        self.samples
            .get(frame * channels + ch)
            .copied()
            .unwrap_or(0.0)
    }

    /// Downmix to mono by averaging channels
    pub fn to_mono(&self) -> Vec<f32> {
        downmix(&self.samples, self.channels)
    }

    /// Mono downmix of the first `frames` frames
    pub fn mono_prefix(&self, frames: usize) -> Vec<f32> {
        let end = frames.min(self.frames()) * self.channels as usize;
        downmix(&self.samples[..end], self.channels)
    }
}

/// Average interleaved channels into one
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Root-mean-square level of a signal (0.0 for an empty one)
pub fn rms(signal: &[f32]) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    let sum: f64 = signal.iter().map(|&x| (x as f64) * (x as f64)).sum();
    (sum / signal.len() as f64).sqrt()
}
