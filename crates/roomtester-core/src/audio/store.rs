//! Owned store of the three playable sources
//!
//! Construction is two-phase: a [`SourceSet`] holds the loaded reference and
//! room recordings, and only becomes an [`AudioStore`] once the processed
//! buffer has been rendered and registered. Consumers receive read-only
//! `Arc<AudioBuffer>` handles.

use super::buffer::{AudioBuffer, Source};
use super::loader::{load_wav, LoadError};
use std::path::Path;
use std::sync::Arc;

/// Reference and room recordings, validated to share a sample rate
#[derive(Debug, Clone)]
pub struct SourceSet {
    reference: Arc<AudioBuffer>,
    room: Arc<AudioBuffer>,
}

impl SourceSet {
    /// Pair two buffers, failing with `ConfigMismatch` on differing sample rates
    pub fn new(reference: AudioBuffer, room: AudioBuffer) -> Result<Self, LoadError> {
        if reference.sample_rate() != room.sample_rate() {
            return Err(LoadError::ConfigMismatch {
                reference: reference.sample_rate(),
                room: room.sample_rate(),
            });
        }
        Ok(Self {
            reference: Arc::new(reference),
            room: Arc::new(room),
        })
    }

    /// Load both recordings from WAV files
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(reference: P, room: Q) -> Result<Self, LoadError> {
        let reference = load_wav(reference)?;
        let room = load_wav(room)?;
        Self::new(reference, room)
    }

    pub fn reference(&self) -> &Arc<AudioBuffer> {
        &self.reference
    }

    pub fn room(&self) -> &Arc<AudioBuffer> {
        &self.room
    }

    pub fn sample_rate(&self) -> u32 {
        self.reference.sample_rate()
    }

    /// Register the processed buffer and complete the store
    ///
    /// The processed buffer must have exactly as many frames as the reference.
    pub fn with_processed(self, processed: AudioBuffer) -> Result<AudioStore, LoadError> {
        if processed.frames() != self.reference.frames() {
            return Err(LoadError::LengthMismatch {
                expected: self.reference.frames(),
                actual: processed.frames(),
            });
        }
        if processed.sample_rate() != self.reference.sample_rate() {
            return Err(LoadError::ConfigMismatch {
                reference: self.reference.sample_rate(),
                room: processed.sample_rate(),
            });
        }
        Ok(AudioStore {
            reference: self.reference,
            room: self.room,
            processed: Arc::new(processed),
        })
    }
}

/// Immutable store holding all three sources
#[derive(Debug, Clone)]
pub struct AudioStore {
    reference: Arc<AudioBuffer>,
    room: Arc<AudioBuffer>,
    processed: Arc<AudioBuffer>,
}

impl AudioStore {
    /// Read-only handle to a source
    pub fn get(&self, source: Source) -> &Arc<AudioBuffer> {
        match source {
            Source::Reference => &self.reference,
            Source::Room => &self.room,
            Source::Processed => &self.processed,
        }
    }

    /// Shared sample rate of every source
    pub fn sample_rate(&self) -> u32 {
        self.reference.sample_rate()
    }

    /// Duration of the reference in seconds, reported to clients
    pub fn duration_secs(&self) -> f64 {
        self.reference.duration_secs()
    }

    /// Widest channel count across sources
    pub fn max_channels(&self) -> u16 {
        Source::ALL
            .iter()
            .map(|&s| self.get(s).channels())
            .max()
            .unwrap_or(1)
    }
}
