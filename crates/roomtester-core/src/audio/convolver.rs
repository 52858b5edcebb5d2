//! Whole-signal convolution of the reference with the estimated IR
//!
//! The processed source is the causal ("full", truncated to the input
//! length) convolution of the mono reference with the IR, RMS-matched to
//! the room recording and re-expanded to the reference's channel layout.
//! It runs once at startup; there is no range-limited recomputation.

use super::buffer::{rms, AudioBuffer};
use super::deconvolve::ImpulseResponse;
use realfft::RealFftPlanner;
use thiserror::Error;

/// Smallest FFT block used for overlap-add
const MIN_FFT_SIZE: usize = 4096;

/// Errors raised while rendering
#[derive(Error, Debug)]
pub enum ConvolutionError {
    #[error("FFT failed: {0}")]
    Fft(String),
}

/// Renders the processed source
pub struct ConvolutionRenderer {
    planner: RealFftPlanner<f32>,
}

impl ConvolutionRenderer {
    pub fn new() -> Self {
        Self {
            planner: RealFftPlanner::new(),
        }
    }

    /// Convolve `reference` with `ir`, level-matched to `room`
    ///
    /// The result has exactly as many frames and channels as the reference.
    pub fn render(
        &mut self,
        reference: &AudioBuffer,
        ir: &ImpulseResponse,
        room: &AudioBuffer,
    ) -> Result<AudioBuffer, ConvolutionError> {
        let processed = self.render_mono(&reference.to_mono(), ir.samples(), &room.to_mono())?;
        Ok(AudioBuffer::from_mono(
            &processed,
            reference.sample_rate(),
            reference.channels(),
        ))
    }

    /// Mono rendering: convolve, truncate, RMS-match to `room`
    pub fn render_mono(
        &mut self,
        reference: &[f32],
        ir: &[f32],
        room: &[f32],
    ) -> Result<Vec<f32>, ConvolutionError> {
        let mut convolved = self.convolve_truncated(reference, ir)?;

        let room_rms = rms(room);
        let conv_rms = rms(&convolved);
        if conv_rms > 0.0 {
            let scale = (room_rms / conv_rms) as f32;
            for sample in &mut convolved {
                *sample *= scale;
            }
        }
        tracing::info!(
            "Level matched: room RMS={:.4}, conv RMS={:.4}",
            room_rms,
            conv_rms
        );
        Ok(convolved)
    }

    /// First `signal.len()` samples of the full linear convolution
    ///
    /// Overlap-add with FFT blocks sized to the IR.
    pub fn convolve_truncated(
        &mut self,
        signal: &[f32],
        ir: &[f32],
    ) -> Result<Vec<f32>, ConvolutionError> {
        let len = signal.len();
        let mut output = vec![0.0f32; len];
        if len == 0 || ir.is_empty() {
            return Ok(output);
        }

        let fft_size = (2 * ir.len()).next_power_of_two().max(MIN_FFT_SIZE);
        let block = fft_size - ir.len() + 1;
        let forward = self.planner.plan_fft_forward(fft_size);
        let inverse = self.planner.plan_fft_inverse(fft_size);

        let mut input = forward.make_input_vec();
        input[..ir.len()].copy_from_slice(ir);
        let mut ir_spectrum = forward.make_output_vec();
        forward
            .process(&mut input, &mut ir_spectrum)
            .map_err(|e| ConvolutionError::Fft(e.to_string()))?;

        let mut spectrum = forward.make_output_vec();
        let mut time = inverse.make_output_vec();
        let norm = 1.0 / fft_size as f32;

        for start in (0..len).step_by(block) {
            let end = (start + block).min(len);
            input.fill(0.0);
            input[..end - start].copy_from_slice(&signal[start..end]);

            forward
                .process(&mut input, &mut spectrum)
                .map_err(|e| ConvolutionError::Fft(e.to_string()))?;
            for (x, h) in spectrum.iter_mut().zip(&ir_spectrum) {
                *x *= *h;
            }
            if let Some(first) = spectrum.first_mut() {
                first.im = 0.0;
            }
            if let Some(last) = spectrum.last_mut() {
                last.im = 0.0;
            }
            inverse
                .process(&mut spectrum, &mut time)
                .map_err(|e| ConvolutionError::Fft(e.to_string()))?;

            let tail_end = (start + fft_size).min(len);
            for (out, &y) in output[start..tail_end].iter_mut().zip(&time) {
                *out += y * norm;
            }
        }

        Ok(output)
    }
}

impl Default for ConvolutionRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn direct_convolution(signal: &[f32], ir: &[f32]) -> Vec<f32> {
        (0..signal.len())
            .map(|n| {
                ir.iter()
                    .enumerate()
                    .filter(|(k, _)| *k <= n)
                    .map(|(k, &h)| h * signal[n - k])
                    .sum()
            })
            .collect()
    }

    fn ramp_signal(len: usize) -> Vec<f32> {
        (0..len).map(|i| ((i * 7919) % 257) as f32 / 128.0 - 1.0).collect()
    }

    #[test]
    fn test_matches_direct_convolution_across_blocks() {
        let mut renderer = ConvolutionRenderer::new();
        let signal = ramp_signal(10_000);
        let ir: Vec<f32> = (0..300).map(|i| 0.9f32.powi(i)).collect();

        let fast = renderer.convolve_truncated(&signal, &ir).unwrap();
        let slow = direct_convolution(&signal, &ir);

        assert_eq!(fast.len(), signal.len());
        for (a, b) in fast.iter().zip(&slow) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_output_length_equals_reference_length() {
        let mut renderer = ConvolutionRenderer::new();
        for (signal_len, ir_len) in [(1, 1), (5, 100), (4097, 3), (10, 0)] {
            let signal = ramp_signal(signal_len);
            let ir = vec![0.5f32; ir_len];
            let out = renderer.render_mono(&signal, &ir, &signal).unwrap();
            assert_eq!(out.len(), signal_len);
        }
    }

    #[test]
    fn test_unit_impulse_preserves_alignment() {
        let mut renderer = ConvolutionRenderer::new();
        let signal = ramp_signal(2000);
        let mut ir = vec![0.0f32; 50];
        ir[0] = 1.0;

        let out = renderer.convolve_truncated(&signal, &ir).unwrap();
        for (a, b) in out.iter().zip(&signal) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_level_matched_to_room() {
        let mut renderer = ConvolutionRenderer::new();
        let signal = ramp_signal(5000);
        let room: Vec<f32> = signal.iter().map(|x| x * 0.25).collect();
        let ir = vec![1.0f32, 0.5, 0.25];

        let out = renderer.render_mono(&signal, &ir, &room).unwrap();
        assert_abs_diff_eq!(rms(&out), rms(&room), epsilon = 1e-4);
    }

    #[test]
    fn test_render_expands_to_reference_channels() {
        let mut renderer = ConvolutionRenderer::new();
        let reference = AudioBuffer::new(vec![0.5, 0.5, -0.5, -0.5, 0.25, 0.25], 8000, 2);
        let room = AudioBuffer::new(vec![0.5, -0.5, 0.25], 8000, 1);
        let ir = ImpulseResponse::from_taps(vec![1.0], 8000);

        let processed = renderer.render(&reference, &ir, &room).unwrap();

        assert_eq!(processed.channels(), 2);
        assert_eq!(processed.frames(), 3);
        assert_eq!(processed.sample_rate(), 8000);
        for frame in processed.samples().chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }
    }

    #[test]
    fn test_zero_ir_skips_scaling() {
        let mut renderer = ConvolutionRenderer::new();
        let signal = ramp_signal(100);
        let out = renderer.render_mono(&signal, &[0.0; 8], &signal).unwrap();
        assert!(out.iter().all(|&x| x == 0.0));
    }
}
