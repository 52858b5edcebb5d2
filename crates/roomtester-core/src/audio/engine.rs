//! Playback engine: cpal output stream bound to the shared transport
//!
//! Provides high-level transport operations:
//! - `play` / `pause` open and close the output stream
//! - `seek` and `switch_source` update the shared transport state
//! - `handle_request` consumes stop requests posted by the render callback
//!
//! `cpal::Stream` is not `Send` on every platform, so the engine is meant to
//! live on a dedicated thread that owns it.

use crate::audio::buffer::Source;
use crate::audio::store::AudioStore;
use crate::audio::transport::{PlaybackStatus, Transport, TransportRequest};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while opening the output stream
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("No output device available")]
    NoOutputDevice,

    #[error("Failed to open stream: {0}")]
    Stream(String),
}

/// Owns the output stream and the transport it renders from
pub struct PlaybackEngine {
    transport: Arc<Transport>,
    requests: Receiver<TransportRequest>,
    stream: Option<Stream>,
    device_name: Option<String>,
}

impl PlaybackEngine {
    /// Create an engine over a completed store; no stream is opened yet
    pub fn new(store: Arc<AudioStore>) -> Self {
        let (transport, requests) = Transport::new(store);
        Self {
            transport: Arc::new(transport),
            requests,
            stream: None,
            device_name: None,
        }
    }

    /// Shared transport, safe to read from other threads
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Stop requests posted by the render callback
    pub fn requests(&self) -> &Receiver<TransportRequest> {
        &self.requests
    }

    pub fn status(&self) -> PlaybackStatus {
        self.transport.status()
    }

    /// Name of the device the current stream was opened on
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// Start playback from the current position
    ///
    /// No-op (Ok(false)) when already playing. A position at the end of the
    /// active buffer rewinds to the start.
    pub fn play(&mut self) -> Result<bool, PlaybackError> {
        if !self.transport.prepare_play() {
            return Ok(false);
        }

        let stream = self.open_stream()?;
        stream
            .play()
            .map_err(|e| PlaybackError::Stream(e.to_string()))?;
        self.stream = Some(stream);
        self.transport.set_playing(true);

        tracing::info!(
            "Play from {:.1}s",
            self.transport.position_frames() as f64
                / self.transport.store().sample_rate() as f64
        );
        Ok(true)
    }

    /// Stop playback, keeping the position
    ///
    /// Returns false when not playing.
    pub fn pause(&mut self) -> bool {
        if !self.transport.is_playing() {
            return false;
        }
        // Dropping the stream closes it
        self.stream = None;
        self.transport.set_playing(false);
        tracing::info!("Pause at {:.1}s", self.transport.status().position);
        true
    }

    /// Seek to `secs`, clamped to the active buffer
    pub fn seek(&mut self, secs: f64) {
        self.transport.seek(secs);
        tracing::info!("Seek to {:.1}s", self.transport.status().position);
    }

    /// Switch to the source called `name`
    ///
    /// Unknown names and the already-active source are ignored.
    pub fn switch_source(&mut self, name: &str) -> bool {
        let Some(source) = Source::from_name(name) else {
            tracing::debug!(name, "Ignoring unknown source");
            return false;
        };
        let switched = self.transport.switch_source(source);
        if switched {
            tracing::info!("Source: {}", source);
        }
        switched
    }

    /// Act on a request from the render callback
    ///
    /// Returns true when the transport state changed.
    pub fn handle_request(&mut self, request: TransportRequest) -> bool {
        match request {
            TransportRequest::Stop => self.pause(),
        }
    }

    fn open_stream(&mut self) -> Result<Stream, PlaybackError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(PlaybackError::NoOutputDevice)?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let store = self.transport.store();
        let channels = store.max_channels().max(crate::MIN_OUTPUT_CHANNELS);
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(store.sample_rate()),
            buffer_size: cpal::BufferSize::Default,
        };

        let transport = Arc::clone(&self.transport);
        let width = channels as usize;
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    transport.render(data, width);
                },
                move |err| {
                    tracing::error!("Output stream error: {}", err);
                },
                None,
            )
            .map_err(|e| PlaybackError::Stream(e.to_string()))?;

        tracing::info!(
            device = %device_name,
            channels,
            sample_rate = store.sample_rate(),
            "Output stream opened"
        );
        self.device_name = Some(device_name);
        Ok(stream)
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.pause();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::AudioBuffer;
    use crate::audio::store::SourceSet;

    fn engine(frames: usize) -> PlaybackEngine {
        let reference = AudioBuffer::new(vec![0.1; frames], 1000, 1);
        let room = AudioBuffer::new(vec![0.2; frames * 2], 1000, 1);
        let processed = AudioBuffer::new(vec![0.3; frames], 1000, 1);
        let store = SourceSet::new(reference, room)
            .unwrap()
            .with_processed(processed)
            .unwrap();
        PlaybackEngine::new(Arc::new(store))
    }

    #[test]
    fn test_engine_creation() {
        let engine = engine(100);
        let status = engine.status();
        assert!(!status.playing);
        assert_eq!(status.source, Source::Reference);
        assert_eq!(status.position, 0.0);
        assert!(engine.device_name().is_none());
    }

    #[test]
    fn test_pause_when_stopped_is_noop() {
        let mut engine = engine(100);
        assert!(!engine.pause());
        assert!(!engine.handle_request(TransportRequest::Stop));
    }

    #[test]
    fn test_unknown_source_ignored() {
        let mut engine = engine(100);
        assert!(!engine.switch_source("lobby"));
        assert!(!engine.switch_source("ref"));
        assert!(engine.switch_source("room"));
        assert_eq!(engine.status().source, Source::Room);
    }

    #[test]
    fn test_seek_clamps_to_active_source() {
        let mut engine = engine(100);
        engine.switch_source("room");
        engine.seek(1000.0);
        assert_eq!(engine.transport().position_frames(), 200);
        engine.seek(-5.0);
        assert_eq!(engine.transport().position_frames(), 0);
    }

    #[test]
    fn test_stop_request_pauses_playing_transport() {
        let mut engine = engine(4);
        engine.transport().set_playing(true);
        let mut out = [0.0f32; 8];
        assert!(engine.transport().render(&mut out, 1));

        let request = engine.requests().try_recv().unwrap();
        assert!(engine.handle_request(request));
        assert!(!engine.status().playing);
        assert!((engine.status().position - 0.004).abs() < 1e-12);
        assert!(!engine.handle_request(TransportRequest::Stop));
    }
}
