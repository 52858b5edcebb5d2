//! Pluggable measurements over fixed-size audio chunks
//!
//! A measurement turns a chunk into a fixed-length vector and can compare
//! two such vectors. Concrete kinds are registered by name in a
//! [`MeterRegistry`] built at startup; [`spectrum`] is the built-in one.

pub mod spectrum;

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a single measurement
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeasurementError {
    #[error("Chunk is empty")]
    EmptyChunk,

    #[error("Chunk contains non-finite samples")]
    NonFinite,

    #[error("FFT failed: {0}")]
    Fft(String),
}

/// Interleaved chunk of audio handed to a measurement
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub samples: &'a [f32],
    pub channels: u16,
    pub sample_rate: u32,
}

/// Capability implemented by every measurement kind
pub trait Meter: Send + Sync {
    /// Registry name, also used as the history key
    fn name(&self) -> &str;

    /// Measure one chunk
    fn measure(&self, chunk: Chunk<'_>) -> Result<Vec<f32>, MeasurementError>;

    /// Distance between two measurement vectors
    fn compare(&self, a: &[f32], b: &[f32]) -> f32 {
        mean_abs_difference(a, b)
    }
}

/// Mean absolute difference over corresponding elements (0.0 when empty)
pub fn mean_abs_difference(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum();
    sum / n as f32
}

/// Name -> measurement table
#[derive(Default, Clone)]
pub struct MeterRegistry {
    meters: BTreeMap<String, Arc<dyn Meter>>,
}

impl std::fmt::Debug for MeterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl MeterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry containing the built-in measurements
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(spectrum::SpectrumMeter::new()));
        registry
    }

    pub fn register(&mut self, meter: Arc<dyn Meter>) {
        let name = meter.name().to_string();
        tracing::info!("Registered measurement: {}", name);
        self.meters.insert(name, meter);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Meter>> {
        self.meters.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.meters.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.meters.keys().map(String::as_str)
    }
}
