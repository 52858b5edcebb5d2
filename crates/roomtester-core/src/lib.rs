//! Roomtester Core - IR estimation, convolution, playback and metering
//!
//! Compares a reference signal with a microphone re-recording of it played
//! in a room. The room's impulse response is estimated by Wiener
//! deconvolution, a "processed" signal is rendered by convolving the
//! reference with it, and all three sources can be auditioned through a
//! real-time playback engine while a background scheduler measures and
//! archives their spectra.

pub mod audio;
pub mod measure;
pub mod pipeline;
pub mod stats;

pub use audio::buffer::{AudioBuffer, Source};
pub use audio::convolver::ConvolutionRenderer;
pub use audio::deconvolve::{ImpulseResponse, ImpulseResponseEstimator, IrConfig};
pub use audio::engine::{PlaybackEngine, PlaybackError};
pub use audio::loader::{load_wav, write_wav, LoadError};
pub use audio::store::{AudioStore, SourceSet};
pub use audio::transport::{PlaybackStatus, Transport};
pub use measure::{Meter, MeterRegistry};
pub use pipeline::{load_and_prepare, prepare_sources, PipelineError, PreparedSources};
pub use stats::history::{HistoryError, HistoryStore, MeterHistory};
pub use stats::metering::{MeterEvent, MeteringContext, MeteringScheduler, SubscriberId};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Crossfade length used when switching sources during playback
pub const CROSSFADE_MS: u32 = 15;

/// Frames per metering chunk (~5.4 Hz resolution at 44.1kHz)
pub const METER_CHUNK_SIZE: usize = 8192;

/// Metering scheduler rate in Hz
pub const METER_RATE_HZ: u32 = 20;

/// Position report rate in Hz
pub const POSITION_REPORT_HZ: u32 = 10;

/// Minimum number of output channels opened on the device
pub const MIN_OUTPUT_CHANNELS: u16 = 2;
