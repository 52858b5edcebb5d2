//! Startup pipeline: loaded sources -> IR -> processed source -> store
//!
//! Runs once before playback is available. Any failure is fatal to startup;
//! there is no partial store.

use crate::audio::buffer::rms;
use crate::audio::convolver::{ConvolutionError, ConvolutionRenderer};
use crate::audio::deconvolve::{
    DeconvolutionError, ImpulseResponse, ImpulseResponseEstimator, IrConfig,
};
use crate::audio::loader::LoadError;
use crate::audio::store::{AudioStore, SourceSet};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

/// Errors that abort startup
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("IR estimation failed: {0}")]
    Deconvolution(#[from] DeconvolutionError),

    #[error("Convolution failed: {0}")]
    Convolution(#[from] ConvolutionError),
}

/// Result of the startup pipeline
#[derive(Debug, Clone)]
pub struct PreparedSources {
    pub store: AudioStore,
    pub ir: ImpulseResponse,
}

/// Estimate the room IR, render the processed source and complete the store
pub fn prepare_sources(
    sources: SourceSet,
    config: &IrConfig,
) -> Result<PreparedSources, PipelineError> {
    let started = Instant::now();
    let sample_rate = sources.sample_rate();

    tracing::info!("Extracting impulse response...");
    let mut estimator = ImpulseResponseEstimator::new(*config)?;
    let ir = estimator.estimate(sources.reference(), sources.room())?;
    tracing::info!(
        taps = ir.len(),
        raw_peak = ir.raw_peak(),
        "IR extracted: {} samples ({:.2}s)",
        ir.len(),
        ir.len() as f64 / sample_rate as f64
    );
    if ir.is_degenerate() {
        tracing::warn!(
            raw_peak = ir.raw_peak(),
            "IR is all zeros; processed source will be silent"
        );
    }

    tracing::info!("Convolving reference with IR...");
    let mut renderer = ConvolutionRenderer::new();
    let processed = renderer.render(sources.reference(), &ir, sources.room())?;
    tracing::debug!(
        processed_rms = rms(&processed.to_mono()),
        "Processed source rendered"
    );

    let store = sources.with_processed(processed)?;
    tracing::info!(
        frames = store.get(crate::Source::Processed).frames(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Processor initialized"
    );
    Ok(PreparedSources { store, ir })
}

/// Load both WAV files and run [`prepare_sources`]
pub fn load_and_prepare<P: AsRef<Path>, Q: AsRef<Path>>(
    reference: P,
    room: Q,
    config: &IrConfig,
) -> Result<PreparedSources, PipelineError> {
    let sources = SourceSet::load(reference, room)?;
    prepare_sources(sources, config)
}
