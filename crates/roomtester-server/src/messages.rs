//! JSON messages exchanged over the WebSocket and returned by the REST API

use roomtester_core::{AudioBuffer, MeterEvent, MeterHistory, PlaybackStatus};
use serde::{Deserialize, Serialize};

/// Basic properties of a loaded source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioInfo {
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
}

impl From<&AudioBuffer> for AudioInfo {
    fn from(buffer: &AudioBuffer) -> Self {
        Self {
            duration: buffer.duration_secs(),
            sample_rate: buffer.sample_rate(),
            channels: buffer.channels(),
        }
    }
}

/// Server -> client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Transport snapshot `{playing, position, source, duration}`
    State(PlaybackStatus),
    /// One measurement result
    Meter(MeterEvent),
    /// Stored history sent when subscribing
    MeterHistory {
        name: String,
        #[serde(flatten)]
        history: MeterHistory,
    },
    /// Metadata of the loaded recordings, sent on connect
    AudioLoaded {
        #[serde(rename = "ref")]
        reference: AudioInfo,
        room: AudioInfo,
    },
    /// Ask frontends to click the element with this id
    RemoteClick { element: String },
    /// Ask frontends to reload
    RemoteRefresh,
}

impl ServerMessage {
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::warn!("Failed to serialize message: {}", e);
                None
            }
        }
    }
}

/// Client -> server messages
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Play,
    Pause,
    Seek { position: f64 },
    Source { name: String },
    Subscribe { name: String },
    Unsubscribe { name: String },
    /// Frontend log line forwarded to the session log
    Log { category: String, message: String },
}
