//! Room impulse response estimation by Wiener deconvolution
//!
//! The first `training_secs` of the reference and the room recording are
//! downmixed, zero-padded to a power of two and transformed. The transfer
//! function is estimated as
//!
//! ```text
//! IR(f) = Room(f) * conj(Ref(f)) / (|Ref(f)|^2 + regularization)
//! ```
//!
//! then brought back to the time domain, truncated to the IR length, faded
//! out over its last 10% and peak-normalized.

use super::buffer::AudioBuffer;
use realfft::num_complex::Complex;
use realfft::RealFftPlanner;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the estimator
#[derive(Error, Debug)]
pub enum DeconvolutionError {
    #[error("Training window contains no samples")]
    EmptySignal,

    #[error("Invalid IR configuration: {0}")]
    InvalidConfig(String),

    #[error("FFT failed: {0}")]
    Fft(String),
}

fn default_training_secs() -> f64 {
    90.0
}

fn default_ir_length_secs() -> f64 {
    0.5
}

fn default_regularization() -> f64 {
    0.01
}

/// Deconvolution parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IrConfig {
    /// Seconds from the start of both signals used for estimation
    #[serde(default = "default_training_secs")]
    pub training_secs: f64,
    /// Length of the estimated IR in seconds
    #[serde(default = "default_ir_length_secs")]
    pub ir_length_secs: f64,
    /// Added to |Ref|^2 so low-energy bins do not blow up
    #[serde(default = "default_regularization")]
    pub regularization: f64,
}

impl Default for IrConfig {
    fn default() -> Self {
        Self {
            training_secs: default_training_secs(),
            ir_length_secs: default_ir_length_secs(),
            regularization: default_regularization(),
        }
    }
}

impl IrConfig {
    fn validate(&self) -> Result<(), DeconvolutionError> {
        if !(self.training_secs.is_finite() && self.training_secs > 0.0) {
            return Err(DeconvolutionError::InvalidConfig(format!(
                "training_secs must be positive, got {}",
                self.training_secs
            )));
        }
        if !(self.ir_length_secs.is_finite() && self.ir_length_secs > 0.0) {
            return Err(DeconvolutionError::InvalidConfig(format!(
                "ir_length_secs must be positive, got {}",
                self.ir_length_secs
            )));
        }
        if !(self.regularization.is_finite() && self.regularization >= 0.0) {
            return Err(DeconvolutionError::InvalidConfig(format!(
                "regularization must be non-negative, got {}",
                self.regularization
            )));
        }
        Ok(())
    }
}

/// Estimated room impulse response
#[derive(Debug, Clone)]
pub struct ImpulseResponse {
    samples: Vec<f32>,
    sample_rate: u32,
    peak_index: usize,
    raw_peak: f64,
}

impl ImpulseResponse {
    /// Wrap taps that were estimated elsewhere; they are used as-is
    pub fn from_taps(samples: Vec<f32>, sample_rate: u32) -> Self {
        let (peak_index, raw_peak) = samples
            .iter()
            .enumerate()
            .fold((0, 0.0f64), |(best_i, best), (i, &x)| {
                if (x as f64).abs() > best {
                    (i, (x as f64).abs())
                } else {
                    (best_i, best)
                }
            });
        Self {
            samples,
            sample_rate,
            peak_index,
            raw_peak,
        }
    }

    /// IR taps, first tap at zero delay
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Index of the largest absolute tap
    pub fn peak_index(&self) -> usize {
        self.peak_index
    }

    /// Delay of the peak tap in milliseconds
    pub fn peak_delay_ms(&self) -> f64 {
        self.peak_index as f64 / self.sample_rate as f64 * 1000.0
    }

    /// Peak magnitude before normalization
    pub fn raw_peak(&self) -> f64 {
        self.raw_peak
    }

    /// True when the estimate was all zeros and could not be normalized
    pub fn is_degenerate(&self) -> bool {
        self.raw_peak == 0.0
    }
}

/// Wiener deconvolution estimator
pub struct ImpulseResponseEstimator {
    config: IrConfig,
    planner: RealFftPlanner<f64>,
}

impl ImpulseResponseEstimator {
    /// Create an estimator, rejecting non-positive durations
    pub fn new(config: IrConfig) -> Result<Self, DeconvolutionError> {
        config.validate()?;
        Ok(Self {
            config,
            planner: RealFftPlanner::new(),
        })
    }

    pub fn config(&self) -> &IrConfig {
        &self.config
    }

    /// Estimate the IR that maps `reference` onto `room`
    ///
    /// Both buffers are downmixed to mono; the sample rate is taken from the
    /// reference.
    pub fn estimate(
        &mut self,
        reference: &AudioBuffer,
        room: &AudioBuffer,
    ) -> Result<ImpulseResponse, DeconvolutionError> {
        let sample_rate = reference.sample_rate();
        let training = (self.config.training_secs * sample_rate as f64) as usize;
        let reference = reference.mono_prefix(training);
        let room = room.mono_prefix(training);
        self.estimate_mono(&reference, &room, sample_rate)
    }

    /// Estimate from mono signals already cut to the training window
    pub fn estimate_mono(
        &mut self,
        reference: &[f32],
        room: &[f32],
        sample_rate: u32,
    ) -> Result<ImpulseResponse, DeconvolutionError> {
        if reference.is_empty() || room.is_empty() || sample_rate == 0 {
            return Err(DeconvolutionError::EmptySignal);
        }
        let ir_length = (self.config.ir_length_secs * sample_rate as f64) as usize;
        if ir_length == 0 {
            return Err(DeconvolutionError::InvalidConfig(
                "IR length rounds to zero samples".to_string(),
            ));
        }

        let fft_size = (reference.len().max(room.len()) + ir_length).next_power_of_two();
        tracing::debug!(
            training_samples = reference.len(),
            ir_length,
            fft_size,
            "Deconvolving"
        );

        let reference_fft = self.forward(reference, fft_size)?;
        let mut transfer = self.forward(room, fft_size)?;

        let regularization = self.config.regularization;
        for (bin, r) in transfer.iter_mut().zip(&reference_fft) {
            let denominator = r.norm_sqr() + regularization;
            *bin = if denominator > 0.0 {
                *bin * r.conj() / denominator
            } else {
                Complex::new(0.0, 0.0)
            };
        }
        // DC and Nyquist bins of a real signal carry no imaginary part
        if let Some(first) = transfer.first_mut() {
            first.im = 0.0;
        }
        if let Some(last) = transfer.last_mut() {
            last.im = 0.0;
        }

        let inverse = self.planner.plan_fft_inverse(fft_size);
        let mut time = inverse.make_output_vec();
        inverse
            .process(&mut transfer, &mut time)
            .map_err(|e| DeconvolutionError::Fft(e.to_string()))?;

        let norm = 1.0 / fft_size as f64;
        let mut ir: Vec<f64> = time.iter().take(ir_length).map(|x| x * norm).collect();

        apply_fade_out(&mut ir);

        let (peak_index, raw_peak) = peak(&ir);
        if raw_peak > 0.0 {
            for tap in &mut ir {
                *tap /= raw_peak;
            }
        } else {
            tracing::warn!("Estimated IR is silent; leaving it unnormalized");
        }

        let response = ImpulseResponse {
            samples: ir.into_iter().map(|x| x as f32).collect(),
            sample_rate,
            peak_index,
            raw_peak,
        };
        tracing::info!(
            peak_index,
            "IR peak at sample {} ({:.1}ms)",
            peak_index,
            response.peak_delay_ms()
        );
        Ok(response)
    }

    fn forward(
        &mut self,
        signal: &[f32],
        fft_size: usize,
    ) -> Result<Vec<Complex<f64>>, DeconvolutionError> {
        let fft = self.planner.plan_fft_forward(fft_size);
        let mut input = fft.make_input_vec();
        for (dst, &src) in input.iter_mut().zip(signal) {
            *dst = src as f64;
        }
        let mut spectrum = fft.make_output_vec();
        fft.process(&mut input, &mut spectrum)
            .map_err(|e| DeconvolutionError::Fft(e.to_string()))?;
        Ok(spectrum)
    }
}

/// Linear ramp from 1 to 0 over the final 10% of the taps
fn apply_fade_out(ir: &mut [f64]) {
    let fade = ir.len() / 10;
    if fade == 0 {
        return;
    }
    let start = ir.len() - fade;
    let step = if fade > 1 { 1.0 / (fade - 1) as f64 } else { 0.0 };
    for (i, tap) in ir[start..].iter_mut().enumerate() {
        *tap *= 1.0 - i as f64 * step;
    }
}

/// Index and magnitude of the largest absolute value (first wins on ties)
fn peak(signal: &[f64]) -> (usize, f64) {
    signal
        .iter()
        .enumerate()
        .fold((0, 0.0), |(best_i, best), (i, &x)| {
            if x.abs() > best {
                (i, x.abs())
            } else {
                (best_i, best)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Deterministic white-ish noise (xorshift)
    fn noise(len: usize, seed: u32) -> Vec<f32> {
        let mut state = seed.max(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state as f32 / u32::MAX as f32) * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = IrConfig {
            ir_length_secs: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            ImpulseResponseEstimator::new(config),
            Err(DeconvolutionError::InvalidConfig(_))
        ));

        let config = IrConfig {
            regularization: -1.0,
            ..Default::default()
        };
        assert!(ImpulseResponseEstimator::new(config).is_err());
    }

    #[test]
    fn test_empty_signal_rejected() {
        let mut estimator = ImpulseResponseEstimator::new(IrConfig::default()).unwrap();
        let err = estimator.estimate_mono(&[], &[0.1], 8000).unwrap_err();
        assert!(matches!(err, DeconvolutionError::EmptySignal));
    }

    #[test]
    fn test_identical_signals_give_unit_impulse() {
        let config = IrConfig {
            training_secs: 90.0,
            ir_length_secs: 0.05,
            regularization: 0.0,
        };
        let mut estimator = ImpulseResponseEstimator::new(config).unwrap();
        let signal = noise(8000, 7);

        let ir = estimator.estimate_mono(&signal, &signal, 8000).unwrap();

        assert_eq!(ir.len(), 400);
        assert_eq!(ir.peak_index(), 0);
        assert_abs_diff_eq!(ir.samples()[0], 1.0, epsilon = 1e-6);
        for &tap in &ir.samples()[1..] {
            assert_abs_diff_eq!(tap, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_delayed_room_moves_peak() {
        let config = IrConfig {
            training_secs: 90.0,
            ir_length_secs: 0.05,
            regularization: 1e-6,
        };
        let mut estimator = ImpulseResponseEstimator::new(config).unwrap();
        let reference = noise(8000, 11);
        let delay = 37;
        let mut room = vec![0.0f32; 8000];
        for (i, &x) in reference.iter().enumerate().take(8000 - delay) {
            room[i + delay] = 0.5 * x;
        }

        let ir = estimator.estimate_mono(&reference, &room, 8000).unwrap();

        assert_eq!(ir.peak_index(), delay);
        assert_abs_diff_eq!(ir.samples()[delay], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_silent_room_is_degenerate_not_error() {
        let mut estimator = ImpulseResponseEstimator::new(IrConfig {
            ir_length_secs: 0.01,
            ..Default::default()
        })
        .unwrap();
        let reference = noise(4000, 3);
        let room = vec![0.0f32; 4000];

        let ir = estimator.estimate_mono(&reference, &room, 8000).unwrap();

        assert!(ir.is_degenerate());
        assert_eq!(ir.len(), 80);
        assert!(ir.samples().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_training_window_and_ir_length_from_buffers() {
        let mut estimator = ImpulseResponseEstimator::new(IrConfig {
            training_secs: 0.5,
            ir_length_secs: 0.1,
            regularization: 0.01,
        })
        .unwrap();
        let stereo: Vec<f32> = noise(8000, 5)
            .into_iter()
            .flat_map(|x| [x, x])
            .collect();
        let reference = AudioBuffer::new(stereo.clone(), 8000, 2);
        let room = AudioBuffer::new(stereo, 8000, 2);

        let ir = estimator.estimate(&reference, &room).unwrap();

        assert_eq!(ir.len(), 800);
        assert_eq!(ir.sample_rate(), 8000);
        assert!(ir.samples().iter().all(|x| x.abs() <= 1.0 + 1e-6));
    }

    #[test]
    fn test_fade_out_tail() {
        let mut ir = vec![1.0f64; 100];
        apply_fade_out(&mut ir);
        assert_eq!(ir[89], 1.0);
        assert_eq!(ir[90], 1.0);
        assert_abs_diff_eq!(ir[99], 0.0, epsilon = 1e-12);
        assert!(ir[95] < 1.0 && ir[95] > 0.0);
    }

    #[test]
    fn test_peak_first_max_wins() {
        assert_eq!(peak(&[0.0, -2.0, 2.0, 1.0]), (1, 2.0));
        assert_eq!(peak(&[0.0, 0.0]), (0, 0.0));
    }
}
