//! Log-spaced band spectrum
//!
//! Downmix, Hann window, real FFT, magnitudes normalized by the chunk
//! length, then averaged into `NUM_BANDS` bands log-spaced between
//! `MIN_FREQ` and `MAX_FREQ` and converted to dB clipped to `[-80, 0]`.

use super::{Chunk, MeasurementError, Meter};
use crate::audio::buffer::downmix;
use realfft::RealFftPlanner;
use std::f32::consts::PI;
use std::sync::Mutex;

/// Number of output bands
pub const NUM_BANDS: usize = 32;

/// Lower edge of the first band in Hz
pub const MIN_FREQ: f32 = 20.0;

/// Upper edge of the last band in Hz
pub const MAX_FREQ: f32 = 20000.0;

/// Magnitude used for bands no FFT bin falls into
const EMPTY_BAND: f32 = 1e-10;

/// Clip range of the dB output
const MIN_DB: f32 = -80.0;
const MAX_DB: f32 = 0.0;

/// Spectrum measurement registered as `"spectrum"`
pub struct SpectrumMeter {
    planner: Mutex<RealFftPlanner<f32>>,
}

impl SpectrumMeter {
    pub fn new() -> Self {
        Self {
            planner: Mutex::new(RealFftPlanner::new()),
        }
    }
}

impl Default for SpectrumMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// `NUM_BANDS + 1` band edges, log-spaced from `MIN_FREQ` to `MAX_FREQ`
pub fn band_edges() -> [f32; NUM_BANDS + 1] {
    let lo = MIN_FREQ.log10();
    let hi = MAX_FREQ.log10();
    let mut edges = [0.0f32; NUM_BANDS + 1];
    for (i, edge) in edges.iter_mut().enumerate() {
        *edge = 10f32.powf(lo + (hi - lo) * i as f32 / NUM_BANDS as f32);
    }
    edges
}

/// Symmetric Hann window of length `len`
fn hann(len: usize) -> impl Iterator<Item = f32> {
    let denom = len.saturating_sub(1).max(1) as f32;
    (0..len).map(move |n| {
        if len == 1 {
            1.0
        } else {
            0.5 - 0.5 * (2.0 * PI * n as f32 / denom).cos()
        }
    })
}

impl Meter for SpectrumMeter {
    fn name(&self) -> &str {
        "spectrum"
    }

    fn measure(&self, chunk: Chunk<'_>) -> Result<Vec<f32>, MeasurementError> {
        if chunk.samples.is_empty() || chunk.sample_rate == 0 {
            return Err(MeasurementError::EmptyChunk);
        }
        if chunk.samples.iter().any(|x| !x.is_finite()) {
            return Err(MeasurementError::NonFinite);
        }

        let mono = downmix(chunk.samples, chunk.channels);
        let len = mono.len();
        if len == 0 {
            return Err(MeasurementError::EmptyChunk);
        }

        let fft = match self.planner.lock() {
            Ok(mut planner) => planner.plan_fft_forward(len),
            Err(poisoned) => poisoned.into_inner().plan_fft_forward(len),
        };
        let mut input = fft.make_input_vec();
        for ((dst, &x), w) in input.iter_mut().zip(&mono).zip(hann(len)) {
            *dst = x * w;
        }
        let mut spectrum = fft.make_output_vec();
        fft.process(&mut input, &mut spectrum)
            .map_err(|e| MeasurementError::Fft(e.to_string()))?;

        let bin_hz = chunk.sample_rate as f32 / len as f32;
        let edges = band_edges();
        let mut bands = Vec::with_capacity(NUM_BANDS);
        for pair in edges.windows(2) {
            let (low, high) = (pair[0], pair[1]);
            let mut sum = 0.0f32;
            let mut count = 0usize;
            for (k, bin) in spectrum.iter().enumerate() {
                let freq = k as f32 * bin_hz;
                if freq >= low && freq < high {
                    sum += bin.norm() / len as f32;
                    count += 1;
                }
            }
            let magnitude = if count > 0 {
                sum / count as f32
            } else {
                EMPTY_BAND
            };
            let db = 20.0 * (magnitude + EMPTY_BAND).log10();
            bands.push(db.clamp(MIN_DB, MAX_DB));
        }
        Ok(bands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sine(freq: f32, rate: u32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|n| amplitude * (2.0 * PI * freq * n as f32 / rate as f32).sin())
            .collect()
    }

    fn chunk(samples: &[f32], channels: u16) -> Chunk<'_> {
        Chunk {
            samples,
            channels,
            sample_rate: 44100,
        }
    }

    #[test]
    fn test_band_edges() {
        let edges = band_edges();
        assert_abs_diff_eq!(edges[0], MIN_FREQ, epsilon = 1e-3);
        assert_abs_diff_eq!(edges[NUM_BANDS], MAX_FREQ, epsilon = 1.0);
        assert!(edges.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_always_num_bands_within_range() {
        let meter = SpectrumMeter::new();
        let inputs = [
            vec![0.0f32; 8192],
            sine(1000.0, 44100, 8192, 1.0),
            sine(50.0, 44100, 8192, 0.001),
            (0..8192).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect(),
            vec![0.3f32; 17],
        ];
        for samples in &inputs {
            let bands = meter.measure(chunk(samples, 1)).unwrap();
            assert_eq!(bands.len(), NUM_BANDS);
            assert!(bands.iter().all(|&b| (-80.0..=0.0).contains(&b)));
        }
    }

    #[test]
    fn test_silence_is_floor() {
        let meter = SpectrumMeter::new();
        let bands = meter.measure(chunk(&[0.0; 8192], 1)).unwrap();
        assert!(bands.iter().all(|&b| b == -80.0));
    }

    #[test]
    fn test_tone_peaks_in_its_band() {
        let meter = SpectrumMeter::new();
        let tone = sine(1000.0, 44100, 8192, 0.8);
        let bands = meter.measure(chunk(&tone, 1)).unwrap();

        let edges = band_edges();
        let expected = edges.windows(2).position(|w| 1000.0 >= w[0] && 1000.0 < w[1]).unwrap();
        let loudest = bands
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(loudest, expected);
    }

    #[test]
    fn test_stereo_downmixed() {
        let meter = SpectrumMeter::new();
        let tone = sine(440.0, 44100, 4096, 0.5);
        let stereo: Vec<f32> = tone.iter().flat_map(|&x| [x, x]).collect();

        let mono_bands = meter.measure(chunk(&tone, 1)).unwrap();
        let stereo_bands = meter.measure(chunk(&stereo, 2)).unwrap();
        for (a, b) in mono_bands.iter().zip(&stereo_bands) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_compare_self_is_zero() {
        let meter = SpectrumMeter::new();
        let tone = sine(3000.0, 44100, 8192, 0.5);
        let bands = meter.measure(chunk(&tone, 1)).unwrap();
        assert_eq!(meter.compare(&bands, &bands), 0.0);
    }

    #[test]
    fn test_invalid_chunks_rejected() {
        let meter = SpectrumMeter::new();
        assert_eq!(
            meter.measure(chunk(&[], 1)).unwrap_err(),
            MeasurementError::EmptyChunk
        );
        assert_eq!(
            meter.measure(chunk(&[0.0, f32::NAN], 1)).unwrap_err(),
            MeasurementError::NonFinite
        );
    }
}
