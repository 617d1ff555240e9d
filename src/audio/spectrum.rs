use std::fmt;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::{Error, Result};

/// Transform size in samples.
pub const FFT_SIZE: usize = 2048;
/// Number of magnitude bins produced per window.
pub const SPECTRUM_BINS: usize = FFT_SIZE / 2;

/// Per-frame analysis result, consumed immediately by the synthesizer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnalysisWindow {
    /// Time-domain slice, unpadded; shorter than [`FFT_SIZE`] at the end of the track.
    pub waveform: Vec<f32>,
    /// `SPECTRUM_BINS` magnitudes, `sqrt(re^2 + im^2)`.
    pub spectrum: Vec<f32>,
}

/// Fixed-size forward DFT over mono PCM, one window per video frame.
///
/// The plan is shared, so one analyzer can serve every rayon worker.
#[derive(Clone)]
pub struct SpectralAnalyzer {
    fft: Arc<dyn Fft<f32>>,
}

impl SpectralAnalyzer {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            fft: planner.plan_fft_forward(FFT_SIZE),
        }
    }

    /// Analyze the window belonging to `frame_index`.
    ///
    /// Windows start at `frame_index * floor(sample_rate / frame_rate)` and
    /// are zero-padded past the end of `samples`. Output depends only on the
    /// arguments.
    pub fn analyze(
        &self,
        samples: &[f32],
        frame_index: usize,
        sample_rate: u32,
        frame_rate: u32,
    ) -> Result<AnalysisWindow> {
        let samples_per_frame = samples_per_frame(sample_rate, frame_rate)?;
        let start = frame_index.checked_mul(samples_per_frame).ok_or_else(|| {
            Error::invalid(format!("frame index {frame_index} overflows the sample range"))
        })?;

        let begin = start.min(samples.len());
        let end = start.saturating_add(FFT_SIZE).min(samples.len());
        let waveform = samples[begin..end].to_vec();

        let mut buffer = vec![Complex::new(0.0f32, 0.0); FFT_SIZE];
        for (slot, &s) in buffer.iter_mut().zip(waveform.iter()) {
            slot.re = s;
        }
        self.fft.process(&mut buffer);

        let spectrum = buffer[..SPECTRUM_BINS]
            .iter()
            .map(|c| (c.re * c.re + c.im * c.im).sqrt())
            .collect();

        Ok(AnalysisWindow { waveform, spectrum })
    }
}

impl Default for SpectralAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpectralAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralAnalyzer")
            .field("size", &FFT_SIZE)
            .finish()
    }
}

/// `floor(sample_rate / frame_rate)`, rejecting rates that would yield zero.
pub fn samples_per_frame(sample_rate: u32, frame_rate: u32) -> Result<usize> {
    if sample_rate == 0 || frame_rate == 0 {
        return Err(Error::invalid(format!(
            "sample rate ({sample_rate}) and frame rate ({frame_rate}) must be positive"
        )));
    }
    let per_frame = (sample_rate / frame_rate) as usize;
    if per_frame == 0 {
        return Err(Error::invalid(format!(
            "frame rate {frame_rate} exceeds sample rate {sample_rate}"
        )));
    }
    Ok(per_frame)
}
