//! Audio processing module
//!
//! - Sample buffers and source names ([`buffer`])
//! - WAV loading/saving ([`loader`])
//! - Owned store of the three sources ([`store`])
//! - Wiener deconvolution of the room IR ([`deconvolve`])
//! - Whole-signal convolution rendering ([`convolver`])
//! - Shared transport state and the render callback ([`transport`])
//! - cpal output stream management ([`engine`])

pub mod buffer;
pub mod convolver;
pub mod deconvolve;
pub mod engine;
pub mod loader;
pub mod store;
pub mod transport;
