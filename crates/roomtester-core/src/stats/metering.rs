//! Periodic metering of the live playback position
//!
//! [`MeteringContext`] owns the measurement registry, the per-subscriber
//! subscriptions and the history store. [`MeteringScheduler::tick`] is
//! called at `METER_RATE_HZ`; while playing with at least one subscription
//! it measures a chunk centered on the playback position from every source,
//! archives the result and returns one event per interested subscriber.

use crate::audio::buffer::{AudioBuffer, Source};
use crate::audio::transport::Transport;
use crate::measure::{Chunk, MeterRegistry};
use crate::stats::history::{HistoryStore, MeterHistory};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Identifier of a connected consumer
pub type SubscriberId = u64;

/// One measurement result for one meter at one position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterEvent {
    #[serde(rename = "name")]
    pub meter: String,
    /// Playback time in seconds
    pub time: f64,
    #[serde(rename = "ref")]
    pub reference: Vec<f32>,
    pub room: Vec<f32>,
    pub processed: Vec<f32>,
    /// `compare(ref, room)`
    pub diff: f32,
}

/// Registry, subscriptions and history shared by all metering operations
#[derive(Debug)]
pub struct MeteringContext {
    registry: MeterRegistry,
    subscriptions: HashMap<SubscriberId, BTreeSet<String>>,
    history: HistoryStore,
}

impl MeteringContext {
    pub fn new(registry: MeterRegistry, history: HistoryStore) -> Self {
        Self {
            registry,
            subscriptions: HashMap::new(),
            history,
        }
    }

    pub fn registry(&self) -> &MeterRegistry {
        &self.registry
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut HistoryStore {
        &mut self.history
    }

    /// Subscribe `subscriber` to `meter`
    ///
    /// Returns the stored history for bootstrapping when there is any.
    pub fn subscribe(&mut self, subscriber: SubscriberId, meter: &str) -> Option<MeterHistory> {
        self.subscriptions
            .entry(subscriber)
            .or_default()
            .insert(meter.to_string());
        tracing::info!(subscriber, meter, "Subscribed");
        if !self.registry.contains(meter) {
            tracing::warn!(meter, "Subscribed to unregistered measurement");
        }

        let history = self.history.history_for(meter);
        if history.is_empty() {
            None
        } else {
            Some(history)
        }
    }

    pub fn unsubscribe(&mut self, subscriber: SubscriberId, meter: &str) -> bool {
        let Some(meters) = self.subscriptions.get_mut(&subscriber) else {
            return false;
        };
        let removed = meters.remove(meter);
        if meters.is_empty() {
            self.subscriptions.remove(&subscriber);
        }
        if removed {
            tracing::info!(subscriber, meter, "Unsubscribed");
        }
        removed
    }

    /// Drop every subscription of a disconnected subscriber
    pub fn remove_subscriber(&mut self, subscriber: SubscriberId) {
        if self.subscriptions.remove(&subscriber).is_some() {
            tracing::debug!(subscriber, "Removed subscriber");
        }
    }

    pub fn has_subscriptions(&self) -> bool {
        self.subscriptions.values().any(|m| !m.is_empty())
    }

    pub fn subscriptions(&self, subscriber: SubscriberId) -> Option<&BTreeSet<String>> {
        self.subscriptions.get(&subscriber)
    }

    /// Distinct meters with at least one subscriber
    fn subscribed_meters(&self) -> BTreeSet<String> {
        self.subscriptions.values().flatten().cloned().collect()
    }
}

/// Copy `chunk_frames` frames centered on `position` into `out`
///
/// The window starts at `position - chunk_frames / 2` (clamped to 0) and is
/// zero-padded past the end of the buffer. `out` is resized to
/// `chunk_frames * channels` interleaved samples.
pub fn extract_chunk(
    buffer: &AudioBuffer,
    position: usize,
    chunk_frames: usize,
    out: &mut Vec<f32>,
) {
    let channels = buffer.channels() as usize;
    let start = position.saturating_sub(chunk_frames / 2).min(buffer.frames());
    let end = (start + chunk_frames).min(buffer.frames());

    out.clear();
    out.extend_from_slice(&buffer.samples()[start * channels..end * channels]);
    out.resize(chunk_frames * channels, 0.0);
}

/// Drives measurements from the shared transport position
pub struct MeteringScheduler {
    transport: Arc<Transport>,
    chunk_frames: usize,
    reference: Vec<f32>,
    room: Vec<f32>,
    processed: Vec<f32>,
}

impl MeteringScheduler {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self::with_chunk_frames(transport, crate::METER_CHUNK_SIZE)
    }

    pub fn with_chunk_frames(transport: Arc<Transport>, chunk_frames: usize) -> Self {
        Self {
            transport,
            chunk_frames,
            reference: Vec::with_capacity(chunk_frames),
            room: Vec::with_capacity(chunk_frames),
            processed: Vec::with_capacity(chunk_frames),
        }
    }

    pub fn chunk_frames(&self) -> usize {
        self.chunk_frames
    }

    /// Run one metering pass
    ///
    /// Returns `(subscriber, event)` pairs to deliver. Does nothing unless
    /// playing with at least one subscription. A failing measurement is
    /// logged and skipped.
    pub fn tick(&mut self, ctx: &mut MeteringContext) -> Vec<(SubscriberId, MeterEvent)> {
        if !self.transport.is_playing() || !ctx.has_subscriptions() {
            return Vec::new();
        }

        let (position, _) = self.transport.snapshot();
        let store = Arc::clone(self.transport.store());
        let sample_rate = store.sample_rate();
        let time = position as f64 / sample_rate as f64;

        let frames = self.chunk_frames;
        extract_chunk(store.get(Source::Reference), position, frames, &mut self.reference);
        extract_chunk(store.get(Source::Room), position, frames, &mut self.room);
        extract_chunk(store.get(Source::Processed), position, frames, &mut self.processed);
        let ref_chunk = Chunk {
            samples: &self.reference,
            channels: store.get(Source::Reference).channels(),
            sample_rate,
        };
        let room_chunk = Chunk {
            samples: &self.room,
            channels: store.get(Source::Room).channels(),
            sample_rate,
        };
        let processed_chunk = Chunk {
            samples: &self.processed,
            channels: store.get(Source::Processed).channels(),
            sample_rate,
        };

        let mut events = Vec::new();
        for name in ctx.subscribed_meters() {
            let Some(meter) = ctx.registry.get(&name).cloned() else {
                continue;
            };

            let measured = meter.measure(ref_chunk).and_then(|reference| {
                let room = meter.measure(room_chunk)?;
                let processed = meter.measure(processed_chunk)?;
                Ok((reference, room, processed))
            });
            let (reference, room, processed) = match measured {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(meter = %name, "Error computing measurement: {}", e);
                    continue;
                }
            };
            let diff = meter.compare(&reference, &room);

            if let Err(e) = ctx.history.store(
                &name,
                time,
                reference.clone(),
                room.clone(),
                Some(processed.clone()),
            ) {
                tracing::warn!(meter = %name, "Failed to save history: {}", e);
            }

            let event = MeterEvent {
                meter: name.clone(),
                time,
                reference,
                room,
                processed,
                diff,
            };
            for (&subscriber, meters) in &ctx.subscriptions {
                if meters.contains(&name) {
                    events.push((subscriber, event.clone()));
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::store::SourceSet;
    use crate::measure::{MeasurementError, Meter};
    use approx::assert_abs_diff_eq;

    struct Mean;

    impl Meter for Mean {
        fn name(&self) -> &str {
            "mean"
        }

        fn measure(&self, chunk: Chunk<'_>) -> Result<Vec<f32>, MeasurementError> {
            let sum: f32 = chunk.samples.iter().sum();
            Ok(vec![sum / chunk.samples.len() as f32])
        }
    }

    struct Broken;

    impl Meter for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn measure(&self, _chunk: Chunk<'_>) -> Result<Vec<f32>, MeasurementError> {
            Err(MeasurementError::EmptyChunk)
        }
    }

    fn transport(frames: usize) -> Arc<Transport> {
        let reference = AudioBuffer::new(vec![1.0; frames], 1000, 1);
        let room = AudioBuffer::new(vec![0.5; frames], 1000, 1);
        let processed = AudioBuffer::new(vec![0.25; frames], 1000, 1);
        let store = SourceSet::new(reference, room)
            .unwrap()
            .with_processed(processed)
            .unwrap();
        let (transport, _rx) = Transport::new(Arc::new(store));
        Arc::new(transport)
    }

    fn context() -> MeteringContext {
        let mut registry = MeterRegistry::with_builtin();
        registry.register(Arc::new(Mean));
        registry.register(Arc::new(Broken));
        MeteringContext::new(registry, HistoryStore::in_memory())
    }

    #[test]
    fn test_extract_chunk_centered_and_padded() {
        let buffer = AudioBuffer::new((0..10).map(|x| x as f32).collect(), 1000, 1);
        let mut out = Vec::new();

        extract_chunk(&buffer, 5, 4, &mut out);
        assert_eq!(out, vec![3.0, 4.0, 5.0, 6.0]);

        extract_chunk(&buffer, 1, 4, &mut out);
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0]);

        extract_chunk(&buffer, 9, 4, &mut out);
        assert_eq!(out, vec![7.0, 8.0, 9.0, 0.0]);

        extract_chunk(&buffer, 100, 4, &mut out);
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn test_extract_chunk_interleaved() {
        let buffer = AudioBuffer::new(vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0], 1000, 2);
        let mut out = Vec::new();
        extract_chunk(&buffer, 2, 2, &mut out);
        assert_eq!(out, vec![2.0, -2.0, 3.0, -3.0]);
    }

    #[test]
    fn test_idle_when_stopped_or_unsubscribed() {
        let transport = transport(1000);
        let mut scheduler = MeteringScheduler::with_chunk_frames(Arc::clone(&transport), 64);
        let mut ctx = context();

        ctx.subscribe(1, "mean");
        assert!(scheduler.tick(&mut ctx).is_empty());

        transport.set_playing(true);
        ctx.unsubscribe(1, "mean");
        assert!(!ctx.has_subscriptions());
        assert!(scheduler.tick(&mut ctx).is_empty());
    }

    #[test]
    fn test_tick_measures_stores_and_fans_out() {
        let transport = transport(1000);
        transport.seek(0.5);
        transport.set_playing(true);
        let mut scheduler = MeteringScheduler::with_chunk_frames(Arc::clone(&transport), 64);
        let mut ctx = context();
        ctx.subscribe(1, "mean");
        ctx.subscribe(2, "mean");
        ctx.subscribe(2, "spectrum");

        let events = scheduler.tick(&mut ctx);
        assert_eq!(events.len(), 3);

        let (_, mean) = events.iter().find(|(id, e)| *id == 1 && e.meter == "mean").unwrap();
        assert_abs_diff_eq!(mean.time, 0.5);
        assert_eq!(mean.reference, vec![1.0]);
        assert_eq!(mean.room, vec![0.5]);
        assert_eq!(mean.processed, vec![0.25]);
        assert_abs_diff_eq!(mean.diff, 0.5);

        let spectrum = events.iter().find(|(_, e)| e.meter == "spectrum").unwrap();
        assert_eq!(spectrum.0, 2);
        assert_eq!(spectrum.1.reference.len(), crate::measure::spectrum::NUM_BANDS);

        let history = ctx.history().history_for("mean");
        assert_eq!(history.reference.len(), 1);
        assert_eq!(history.processed.len(), 1);
    }

    #[test]
    fn test_failing_meter_does_not_block_others() {
        let transport = transport(1000);
        transport.set_playing(true);
        let mut scheduler = MeteringScheduler::with_chunk_frames(Arc::clone(&transport), 64);
        let mut ctx = context();
        ctx.subscribe(1, "broken");
        ctx.subscribe(1, "mean");
        ctx.subscribe(1, "loudness");

        let events = scheduler.tick(&mut ctx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.meter, "mean");
        assert!(ctx.history().history_for("broken").is_empty());
    }

    #[test]
    fn test_subscribe_returns_history_only_when_present() {
        let transport = transport(1000);
        transport.set_playing(true);
        let mut scheduler = MeteringScheduler::with_chunk_frames(Arc::clone(&transport), 64);
        let mut ctx = context();

        assert!(ctx.subscribe(1, "mean").is_none());
        scheduler.tick(&mut ctx);

        let history = ctx.subscribe(2, "mean").unwrap();
        assert_eq!(history.reference.len(), 1);
    }

    #[test]
    fn test_remove_subscriber_drops_all_subscriptions() {
        let mut ctx = context();
        ctx.subscribe(7, "mean");
        ctx.subscribe(7, "spectrum");
        assert_eq!(ctx.subscriptions(7).map(|m| m.len()), Some(2));

        ctx.remove_subscriber(7);
        assert!(ctx.subscriptions(7).is_none());
        assert!(!ctx.has_subscriptions());
        assert!(!ctx.unsubscribe(7, "mean"));
    }

    #[test]
    fn test_event_serializes_wire_names() {
        let event = MeterEvent {
            meter: "spectrum".into(),
            time: 1.5,
            reference: vec![-1.0],
            room: vec![-2.0],
            processed: vec![-3.0],
            diff: 1.0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "spectrum");
        assert_eq!(json["ref"], serde_json::json!([-1.0]));
        assert_eq!(json["diff"], 1.0);
    }
}
