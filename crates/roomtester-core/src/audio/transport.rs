//! Shared playback state and the real-time render callback
//!
//! All mutable transport state (position, playing flag, active source,
//! pending crossfade) lives behind a single mutex. The render callback only
//! holds that lock long enough to snapshot and advance the position; copying
//! and mixing happen outside the lock against immutable buffers.
//!
//! The callback may not stop its own stream. When it runs off the end of the
//! active buffer it posts a [`TransportRequest::Stop`] on a bounded channel
//! that a non-real-time control task drains.

use super::buffer::Source;
use super::store::AudioStore;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

/// Capacity of the render -> control request channel
const REQUEST_CHANNEL_SIZE: usize = 8;

/// Requests posted from the render callback to the control task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRequest {
    /// Active buffer exhausted; close the stream
    Stop,
}

/// State snapshot reported to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackStatus {
    pub playing: bool,
    /// Reported position in seconds
    pub position: f64,
    pub source: Source,
    /// Reference duration in seconds
    pub duration: f64,
}

/// Crossfade in progress from a previous source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Crossfade {
    /// Source faded out (its buffer is immutable, so the key is the snapshot)
    from: Source,
    /// Frames left in the blend window
    remaining: usize,
    /// Blend window length in frames
    total: usize,
}

#[derive(Debug)]
struct PlaybackState {
    position: usize,
    playing: bool,
    source: Source,
    crossfade: Option<Crossfade>,
    reported_secs: f64,
}

/// Complementary linear gains at `offset` frames into a `total`-frame blend
///
/// Returns `(fade_in, fade_out)`; the pair always sums to one.
#[inline]
pub fn crossfade_gains(offset: usize, total: usize) -> (f32, f32) {
    if total == 0 {
        return (1.0, 0.0);
    }
    let fade_in = (offset.min(total) as f32) / total as f32;
    (fade_in, 1.0 - fade_in)
}

/// Transport shared between the render callback, control commands and
/// the periodic report/metering tasks
pub struct Transport {
    store: Arc<AudioStore>,
    state: Mutex<PlaybackState>,
    crossfade_frames: usize,
    requests: Sender<TransportRequest>,
}

impl Transport {
    /// Create a transport over `store` with the default 15ms crossfade
    ///
    /// Returns the receiving end of the stop-request channel.
    pub fn new(store: Arc<AudioStore>) -> (Self, Receiver<TransportRequest>) {
        let frames = (store.sample_rate() as u64 * crate::CROSSFADE_MS as u64 / 1000) as usize;
        Self::with_crossfade_frames(store, frames)
    }

    /// Create a transport with an explicit crossfade length in frames
    pub fn with_crossfade_frames(
        store: Arc<AudioStore>,
        crossfade_frames: usize,
    ) -> (Self, Receiver<TransportRequest>) {
        let (requests, rx) = crossbeam_channel::bounded(REQUEST_CHANNEL_SIZE);
        let transport = Self {
            store,
            state: Mutex::new(PlaybackState {
                position: 0,
                playing: false,
                source: Source::Reference,
                crossfade: None,
                reported_secs: 0.0,
            }),
            crossfade_frames,
            requests,
        };
        (transport, rx)
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn store(&self) -> &Arc<AudioStore> {
        &self.store
    }

    pub fn crossfade_frames(&self) -> usize {
        self.crossfade_frames
    }

    pub fn is_playing(&self) -> bool {
        self.lock().playing
    }

    pub fn active_source(&self) -> Source {
        self.lock().source
    }

    /// Live position in frames
    pub fn position_frames(&self) -> usize {
        self.lock().position
    }

    /// Snapshot of (position, source) taken under the lock
    pub fn snapshot(&self) -> (usize, Source) {
        let state = self.lock();
        (state.position, state.source)
    }

    /// Reportable state; the position is the last reported value
    pub fn status(&self) -> PlaybackStatus {
        let state = self.lock();
        PlaybackStatus {
            playing: state.playing,
            position: state.reported_secs,
            source: state.source,
            duration: self.store.duration_secs(),
        }
    }

    /// Recompute the reported position from the live one while playing
    ///
    /// Returns the fresh status when playing, `None` otherwise.
    pub fn refresh_reported_position(&self) -> Option<PlaybackStatus> {
        let mut state = self.lock();
        if !state.playing {
            return None;
        }
        state.reported_secs = state.position as f64 / self.store.sample_rate() as f64;
        Some(PlaybackStatus {
            playing: true,
            position: state.reported_secs,
            source: state.source,
            duration: self.store.duration_secs(),
        })
    }

    /// Rewind to the start if the position sits at the end of the active buffer
    ///
    /// Returns false when already playing (play is then a no-op).
    pub fn prepare_play(&self) -> bool {
        let mut state = self.lock();
        if state.playing {
            return false;
        }
        let len = self.store.get(state.source).frames();
        if state.position >= len {
            state.position = 0;
            state.reported_secs = 0.0;
        }
        true
    }

    /// Set the playing flag; stopping drops any pending crossfade
    pub fn set_playing(&self, playing: bool) {
        let mut state = self.lock();
        state.playing = playing;
        if !playing {
            state.crossfade = None;
            state.reported_secs = state.position as f64 / self.store.sample_rate() as f64;
        }
    }

    /// Move to `secs`, clamped to `[0, length of active buffer]`
    ///
    /// Returns the new position in frames.
    pub fn seek(&self, secs: f64) -> usize {
        let sample_rate = self.store.sample_rate() as f64;
        let mut state = self.lock();
        let len = self.store.get(state.source).frames();
        let target = (secs * sample_rate).floor();
        let position = if target.is_nan() || target <= 0.0 {
            0
        } else if target >= len as f64 {
            len
        } else {
            target as usize
        };
        state.position = position;
        state.reported_secs = position as f64 / sample_rate;
        position
    }

    /// Switch the active source
    ///
    /// No-op (returns false) when `source` is already active. While playing
    /// the previous source is crossfaded out over the crossfade window.
    pub fn switch_source(&self, source: Source) -> bool {
        let mut state = self.lock();
        if state.source == source {
            return false;
        }
        if state.playing {
            state.crossfade = Some(Crossfade {
                from: state.source,
                remaining: self.crossfade_frames,
                total: self.crossfade_frames,
            });
        }
        state.source = source;
        true
    }

    /// Fill `out` (interleaved, `channels` wide) from the active source
    ///
    /// Real-time safe: no allocation, no I/O, one short lock. Returns true
    /// when the active buffer was exhausted and a stop was requested.
    pub fn render(&self, out: &mut [f32], channels: usize) -> bool {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        let (start, end, source, fade, exhausted) = {
            let mut state = self.lock();
            let len = self.store.get(state.source).frames();
            let start = state.position.min(len);
            let end = (start + frames).min(len);
            let exhausted = start + frames >= len;
            state.position = end;

            let fade = match state.crossfade.take() {
                Some(mut cf) => {
                    let offset = cf.total - cf.remaining;
                    let blend = frames.min(cf.remaining);
                    cf.remaining -= blend;
                    if cf.remaining > 0 {
                        state.crossfade = Some(cf);
                    }
                    Some((cf.from, offset, blend, cf.total))
                }
                None => None,
            };
            (start, end, state.source, fade, exhausted)
        };

        let buffer = self.store.get(source);
        for (i, frame) in out.chunks_mut(channels).enumerate() {
            let pos = start + i;
            if pos < end && frame.len() == channels {
                for (ch, sample) in frame.iter_mut().enumerate() {
                    *sample = buffer.sample(pos, ch);
                }
            } else {
                frame.fill(0.0);
            }
        }

        if let Some((from, offset, blend, total)) = fade {
            let previous = self.store.get(from);
            for (i, frame) in out.chunks_exact_mut(channels).take(blend).enumerate() {
                let (fade_in, fade_out) = crossfade_gains(offset + i, total);
                for (ch, sample) in frame.iter_mut().enumerate() {
                    *sample = *sample * fade_in + previous.sample(start + i, ch) * fade_out;
                }
            }
        }

        if exhausted {
            let _ = self.requests.try_send(TransportRequest::Stop);
        }
        exhausted
    }
}
