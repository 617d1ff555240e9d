use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use rayon::prelude::*;
use tempfile::TempDir;

use super::frame::FrameSynthesizer;
use super::layers::LayerConfigs;
use crate::audio::spectrum::{samples_per_frame, SpectralAnalyzer, SPECTRUM_BINS};
use crate::audio::AudioData;
use crate::{Error, Result};

/// Cooperative cancellation flag shared between a caller and a running session.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reported once per written frame, in index order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderProgress {
    pub current: usize,
    pub total: usize,
    pub percent: f64,
}

/// A contiguous `frame_%06d.png` sequence ready for the encoder.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameSequence {
    pub frame_dir: PathBuf,
    pub frame_count: usize,
    pub frame_rate: u32,
}

/// Canvas geometry and frame rate for one render.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionGeometry {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// File name for frame `index`; the width keeps lexicographic and numeric order equal.
pub fn frame_file_name(index: usize) -> String {
    format!("frame_{index:06}.png")
}

/// One job's render phase: sample buffer in, numbered PNGs out.
///
/// The work directory is removed by [`RenderSession::cleanup`], on any
/// export failure, and on drop.
pub struct RenderSession {
    audio: AudioData,
    geometry: SessionGeometry,
    analyzer: SpectralAnalyzer,
    synthesizer: FrameSynthesizer,
    batch_size: usize,
    work_dir: Option<TempDir>,
}

impl RenderSession {
    pub fn new(
        audio: AudioData,
        geometry: SessionGeometry,
        synthesizer: FrameSynthesizer,
        temp_root: Option<&Path>,
    ) -> Result<Self> {
        if geometry.width == 0 || geometry.height == 0 {
            return Err(Error::invalid(format!(
                "resolution must be non-zero, got {}x{}",
                geometry.width, geometry.height
            )));
        }
        samples_per_frame(audio.sample_rate, geometry.frame_rate)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("beatcast-");
        let work_dir = match temp_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        log::debug!("Render session work dir: {}", work_dir.path().display());

        Ok(Self {
            audio,
            geometry,
            analyzer: SpectralAnalyzer::new(),
            synthesizer,
            batch_size: rayon::current_num_threads().max(1),
            work_dir: Some(work_dir),
        })
    }

    /// Frames synthesized in parallel before being written in order.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn duration_seconds(&self) -> f64 {
        self.audio.duration_seconds()
    }

    /// `floor(duration_seconds * frame_rate)`, computed without rounding error.
    pub fn frame_count(&self) -> usize {
        if self.audio.sample_rate == 0 {
            return 0;
        }
        let frames = self.audio.samples.len() as u128 * self.geometry.frame_rate as u128
            / self.audio.sample_rate as u128;
        frames as usize
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_ref().map(|d| d.path())
    }

    /// Render every frame into the work directory.
    ///
    /// `on_progress` fires exactly `frame_count` times with strictly
    /// increasing `current`. On any error the work directory is removed
    /// before the error is returned.
    pub fn export_frames<F>(
        &mut self,
        layers: &LayerConfigs,
        cancel: &CancelToken,
        on_progress: F,
    ) -> Result<FrameSequence>
    where
        F: FnMut(RenderProgress),
    {
        let result = self.export_inner(layers, cancel, on_progress);
        if result.is_err() {
            if let Err(err) = self.cleanup() {
                log::warn!("Failed to remove render work dir: {}", err);
            }
        }
        result
    }

    fn export_inner<F>(
        &self,
        layers: &LayerConfigs,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<FrameSequence>
    where
        F: FnMut(RenderProgress),
    {
        let frame_dir = self
            .work_dir()
            .ok_or_else(|| Error::invalid("render session was already cleaned up"))?
            .to_path_buf();
        self.synthesizer.validate(layers, SPECTRUM_BINS)?;

        let total = self.frame_count();
        log::info!(
            "Exporting {} frames ({}x{} @ {}fps, {:.1}s)",
            total,
            self.geometry.width,
            self.geometry.height,
            self.geometry.frame_rate,
            self.duration_seconds()
        );

        let mut start = 0;
        while start < total {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let end = (start + self.batch_size).min(total);
            let encoded: Vec<Result<Vec<u8>>> = (start..end)
                .into_par_iter()
                .map(|index| self.render_png(index, layers))
                .collect();

            for (index, png) in (start..end).zip(encoded) {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let path = frame_dir.join(frame_file_name(index));
                std::fs::write(&path, png?)
                    .with_context(|| format!("Failed to write {}", path.display()))
                    .map_err(|e| Error::render_failure(index, e))?;

                let current = index + 1;
                on_progress(RenderProgress {
                    current,
                    total,
                    percent: 100.0 * current as f64 / total as f64,
                });
            }
            start = end;
        }

        Ok(FrameSequence {
            frame_dir,
            frame_count: total,
            frame_rate: self.geometry.frame_rate,
        })
    }

    fn render_png(&self, index: usize, layers: &LayerConfigs) -> Result<Vec<u8>> {
        let window = self
            .analyzer
            .analyze(
                &self.audio.samples,
                index,
                self.audio.sample_rate,
                self.geometry.frame_rate,
            )
            .map_err(|e| Error::render_failure(index, e))?;
        let image = self
            .synthesizer
            .render(&window, self.geometry.width, self.geometry.height, layers)
            .map_err(|e| Error::render_failure(index, e))?;

        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .context("Failed to encode frame as PNG")
            .map_err(|e| Error::render_failure(index, e))?;
        Ok(bytes)
    }

    /// Remove the work directory. Safe to call any number of times.
    pub fn cleanup(&mut self) -> Result<()> {
        if let Some(dir) = self.work_dir.take() {
            let path = dir.path().to_path_buf();
            dir.close()?;
            log::debug!("Removed render work dir {}", path.display());
        }
        Ok(())
    }
}
