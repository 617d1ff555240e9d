use anyhow::Context;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::{Error, Result};

/// Decoded mono PCM. Samples are `f32` in [-1, 1].
#[derive(Clone, Debug, Default)]
pub struct AudioData {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioData {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Turns an audio file into a mono sample buffer.
pub trait AudioDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<AudioData>;
}

/// Decodes any format symphonia was built with, downmixing to mono.
#[derive(Clone, Copy, Debug, Default)]
pub struct SymphoniaDecoder;

impl AudioDecoder for SymphoniaDecoder {
    fn decode(&self, path: &Path) -> Result<AudioData> {
        decode_audio(path).map_err(Error::Audio)
    }
}

/// Decode the first playable track of `path` to mono `f32`.
pub fn decode_audio(path: &Path) -> anyhow::Result<AudioData> {
    let track = OpenTrack::open(path)?;
    let sample_rate = track.sample_rate;
    let samples = track.read_mono()?;
    log::info!(
        "Decoded {}: {} samples at {} Hz ({:.1}s)",
        path.display(),
        samples.len(),
        sample_rate,
        samples.len() as f64 / sample_rate as f64
    );
    Ok(AudioData {
        samples,
        sample_rate,
    })
}

struct OpenTrack {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
}

impl OpenTrack {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open audio file: {}", path.display()))?;
        let source = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        let reader = symphonia::default::get_probe()
            .format(&hint, source, &FormatOptions::default(), &MetadataOptions::default())
            .with_context(|| format!("Unrecognised audio format: {}", path.display()))?
            .format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .context("No audio tracks found")?;
        let track_id = track.id;
        let params = track.codec_params.clone();
        let sample_rate = params.sample_rate.context("Unknown sample rate")?;
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .context("Unsupported audio codec")?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            sample_rate,
        })
    }

    /// Drain every packet of the track, downmixing as we go.
    fn read_mono(mut self) -> anyhow::Result<Vec<f32>> {
        let mut mono = Vec::new();
        let mut scratch: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(e).context("Failed to read audio packet"),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let buffer = match self.decoder.decode(&packet) {
                Ok(buffer) => buffer,
                Err(SymphoniaError::DecodeError(msg)) => {
                    log::debug!("Skipping undecodable packet: {}", msg);
                    continue;
                }
                Err(e) => return Err(e).context("Failed to decode audio packet"),
            };

            let spec = *buffer.spec();
            let channels = spec.channels.count();
            let frames = buffer.capacity();
            if scratch.as_ref().map_or(true, |s| s.capacity() < frames * channels) {
                scratch = Some(SampleBuffer::new(frames as u64, spec));
            }
            if let Some(ref mut interleaved) = scratch {
                interleaved.copy_interleaved_ref(buffer);
                downmix_into(&mut mono, interleaved.samples(), channels);
            }
        }

        Ok(mono)
    }
}

fn downmix_into(out: &mut Vec<f32>, interleaved: &[f32], channels: usize) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_channels() {
        let mut out = Vec::new();
        downmix_into(&mut out, &[1.0, 0.0, -0.5, -0.5], 2);
        assert_eq!(out, vec![0.5, -0.5]);
    }

    #[test]
    fn mono_passes_through() {
        let mut out = vec![0.25];
        downmix_into(&mut out, &[0.1, 0.2], 1);
        assert_eq!(out, vec![0.25, 0.1, 0.2]);
    }

    #[test]
    fn duration_from_sample_count() {
        let audio = AudioData {
            samples: vec![0.0; 44_100 * 3],
            sample_rate: 44_100,
        };
        assert!((audio.duration_seconds() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn missing_file_is_an_audio_error() {
        let err = SymphoniaDecoder
            .decode(Path::new("/nonexistent/beat.wav"))
            .unwrap_err();
        assert!(matches!(err, Error::Audio(_)));
    }
}
