pub mod decode;
pub mod spectrum;

pub use decode::{AudioData, AudioDecoder, SymphoniaDecoder};
pub use spectrum::{AnalysisWindow, SpectralAnalyzer, FFT_SIZE, SPECTRUM_BINS};
