pub mod ffmpeg;

use std::path::{Path, PathBuf};

use crate::config::OutputConfig;
use crate::render::FrameSequence;

pub use ffmpeg::{EncodingOptions, FfmpegEncoder};

/// Muxing failures reported by an [`Encoder`].
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("encoder exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("no frames to encode in {0}")]
    EmptySequence(PathBuf),

    #[error("encoder reported success but {0} was not written")]
    MissingOutput(PathBuf),

    #[error("encoder io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns a frame sequence plus the source audio into a video container.
pub trait Encoder: Send + Sync {
    /// Pick codec and quality settings once per render.
    fn negotiate(&self, output: &OutputConfig) -> EncodingOptions {
        EncodingOptions::cpu(output)
    }

    fn encode(
        &self,
        frames: &FrameSequence,
        audio_path: &Path,
        output_path: &Path,
        options: &EncodingOptions,
    ) -> Result<PathBuf, EncodeError>;
}
