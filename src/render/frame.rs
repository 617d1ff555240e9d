use image::RgbaImage;

use super::canvas::Canvas;
use super::layers::{LayerConfigs, Overlay, SpectrumLayer, WaveformLayer};
use super::text::TextOverlay;
use crate::audio::AnalysisWindow;
use crate::{Error, Result};

/// Sample value drawn at full `amplitude` deflection. Decoders hand us `f32`
/// in [-1, 1], so no rescaling is applied.
pub const WAVEFORM_FULL_SCALE: f32 = 1.0;

/// Turns one analysis window into a frame image.
///
/// Compositing order is fixed: black clear, waveform, spectrum, overlays.
/// Synthesis is pure; nothing here touches the filesystem.
#[derive(Default)]
pub struct FrameSynthesizer {
    text: Option<TextOverlay>,
}

impl FrameSynthesizer {
    pub fn new(text: Option<TextOverlay>) -> Self {
        Self { text }
    }

    /// Reject layer settings that cannot produce a frame, before any work starts.
    pub fn validate(&self, layers: &LayerConfigs, spectrum_len: usize) -> Result<()> {
        if let Some(ref wave) = layers.waveform {
            if !(wave.line_width > 0.0) || !wave.amplitude.is_finite() {
                return Err(Error::invalid("waveform line_width must be positive"));
            }
        }
        if let Some(ref spectrum) = layers.spectrum {
            if spectrum.bar_count == 0 || spectrum.bar_count > spectrum_len {
                return Err(Error::invalid(format!(
                    "spectrum bar_count must be within 1..={spectrum_len}, got {}",
                    spectrum.bar_count
                )));
            }
            if !(spectrum.reference_scale > 0.0) {
                return Err(Error::invalid("spectrum reference_scale must be positive"));
            }
            if spectrum.gap < 0.0 {
                return Err(Error::invalid("spectrum gap must not be negative"));
            }
        }
        if layers.has_text() && self.text.is_none() {
            return Err(Error::invalid(
                "text overlay requested but no font is available; set [font] path or url",
            ));
        }
        Ok(())
    }

    pub fn render(
        &self,
        window: &AnalysisWindow,
        width: u32,
        height: u32,
        layers: &LayerConfigs,
    ) -> Result<RgbaImage> {
        if width == 0 || height == 0 {
            return Err(Error::invalid(format!("canvas must be non-empty, got {width}x{height}")));
        }
        let mut canvas = Canvas::new(width, height);

        if let Some(ref wave) = layers.waveform {
            draw_waveform(&mut canvas, &window.waveform, wave);
        }
        if let Some(ref spectrum) = layers.spectrum {
            draw_spectrum(&mut canvas, &window.spectrum, spectrum)?;
        }
        for overlay in &layers.overlays {
            self.draw_overlay(&mut canvas, overlay)?;
        }

        Ok(canvas.into_image())
    }

    fn draw_overlay(&self, canvas: &mut Canvas, overlay: &Overlay) -> Result<()> {
        match overlay {
            Overlay::Text { text, x, y, size, color } => {
                let font = self
                    .text
                    .as_ref()
                    .ok_or_else(|| Error::invalid("text overlay requires a font"))?;
                font.composite(canvas, text, *x, *y, *size, *color);
            }
            Overlay::Rect { x, y, width, height, color } => {
                let (x0, y0) = (*x as f32, *y as f32);
                canvas.fill_rect(x0, y0, x0 + *width as f32, y0 + *height as f32, *color);
            }
        }
        Ok(())
    }
}

fn draw_waveform(canvas: &mut Canvas, samples: &[f32], layer: &WaveformLayer) {
    if samples.is_empty() {
        return;
    }
    let center_y = canvas.height() as f32 / 2.0;
    // First sample on the left edge, last on the right.
    let span = canvas.width().saturating_sub(1) as f32;
    let slice_width = if samples.len() > 1 {
        span / (samples.len() - 1) as f32
    } else {
        0.0
    };

    let points: Vec<(f32, f32)> = samples
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            let v = s / WAVEFORM_FULL_SCALE;
            (i as f32 * slice_width, center_y - v * layer.amplitude)
        })
        .collect();

    canvas.stroke_polyline(&points, layer.line_width, layer.color);
}

/// Average `magnitudes` into `bar_count` equal bins, dropping the remainder.
pub fn bar_levels(magnitudes: &[f32], bar_count: usize, reference_scale: f32) -> Result<Vec<f32>> {
    if bar_count == 0 {
        return Err(Error::invalid("spectrum bar_count must be positive"));
    }
    let bin_size = magnitudes.len() / bar_count;
    if bin_size == 0 {
        return Err(Error::invalid(format!(
            "{bar_count} bars need at least {bar_count} magnitudes, got {}",
            magnitudes.len()
        )));
    }
    Ok(magnitudes
        .chunks_exact(bin_size)
        .take(bar_count)
        .map(|bin| {
            let average = bin.iter().sum::<f32>() / bin_size as f32;
            (average / reference_scale).clamp(0.0, 1.0)
        })
        .collect())
}

fn draw_spectrum(canvas: &mut Canvas, magnitudes: &[f32], layer: &SpectrumLayer) -> Result<()> {
    let levels = bar_levels(magnitudes, layer.bar_count, layer.reference_scale)?;
    let (width, height) = (canvas.width() as f32, canvas.height() as f32);
    let count = layer.bar_count as f32;
    let bar_width = (width - (count - 1.0) * layer.gap) / count;
    if bar_width <= 0.0 {
        return Err(Error::invalid(format!(
            "{} bars with gap {} do not fit in {} pixels",
            layer.bar_count, layer.gap, width
        )));
    }
    let max_height = height * layer.max_height;

    for (i, level) in levels.iter().enumerate() {
        let bar_height = level * max_height;
        let x = i as f32 * (bar_width + layer.gap);
        canvas.fill_rect(x, height - bar_height, x + bar_width, height, layer.color);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::layers::Color;

    fn window(waveform: Vec<f32>, spectrum: Vec<f32>) -> AnalysisWindow {
        AnalysisWindow { waveform, spectrum }
    }

    #[test]
    fn no_layers_means_black_frame() {
        let synth = FrameSynthesizer::default();
        let img = synth
            .render(&window(vec![1.0; 64], vec![500.0; 1024]), 16, 9, &LayerConfigs::default())
            .unwrap();
        assert!(img.pixels().all(|p| p.0 == [0, 0, 0, 255]));
    }

    #[test]
    fn bar_levels_discard_remainder_bins() {
        // 10 magnitudes into 3 bars: bin size 3, the 10th value is ignored.
        let mags = [3.0, 3.0, 3.0, 6.0, 6.0, 6.0, 0.0, 0.0, 0.0, 1000.0];
        let levels = bar_levels(&mags, 3, 6.0).unwrap();
        assert_eq!(levels, vec![0.5, 1.0, 0.0]);
        assert!(bar_levels(&mags, 11, 6.0).is_err());
    }

    #[test]
    fn levels_are_clamped_to_full_scale() {
        let levels = bar_levels(&[1e6; 8], 2, 64.0).unwrap();
        assert_eq!(levels, vec![1.0, 1.0]);
    }

    #[test]
    fn spectrum_bars_grow_from_the_bottom() {
        let synth = FrameSynthesizer::default();
        let layers = LayerConfigs {
            spectrum: Some(SpectrumLayer {
                bar_count: 2,
                color: Color::rgb(255, 0, 0),
                gap: 0.0,
                max_height: 1.0,
                reference_scale: 10.0,
            }),
            ..Default::default()
        };
        // Left bar full height, right bar empty.
        let mut mags = vec![10.0; 4];
        mags.extend(vec![0.0; 4]);
        let img = synth.render(&window(vec![], mags), 10, 10, &layers).unwrap();
        assert_eq!(img.get_pixel(2, 0).0, [255, 0, 0, 255]);
        assert_eq!(img.get_pixel(2, 9).0, [255, 0, 0, 255]);
        assert_eq!(img.get_pixel(7, 9).0, [0, 0, 0, 255]);
    }

    #[test]
    fn silent_waveform_is_a_centre_line() {
        let synth = FrameSynthesizer::default();
        let layers = LayerConfigs {
            waveform: Some(WaveformLayer {
                color: Color::rgb(0, 255, 0),
                line_width: 1.0,
                amplitude: 4.0,
            }),
            ..Default::default()
        };
        let img = synth.render(&window(vec![0.0; 20], vec![]), 20, 10, &layers).unwrap();
        assert_eq!(img.get_pixel(10, 5).0, [0, 255, 0, 255]);
        assert_eq!(img.get_pixel(10, 1).0, [0, 0, 0, 255]);
    }

    #[test]
    fn waveform_spans_the_full_width() {
        let synth = FrameSynthesizer::default();
        let layers = LayerConfigs {
            waveform: Some(WaveformLayer {
                color: Color::WHITE,
                line_width: 1.0,
                amplitude: 4.0,
            }),
            ..Default::default()
        };
        let img = synth.render(&window(vec![0.0; 4], vec![]), 40, 10, &layers).unwrap();
        assert_eq!(img.get_pixel(0, 5).0, [255, 255, 255, 255]);
        assert_eq!(img.get_pixel(39, 5).0, [255, 255, 255, 255]);
    }

    #[test]
    fn full_scale_sample_deflects_by_amplitude() {
        let synth = FrameSynthesizer::default();
        let layers = LayerConfigs {
            waveform: Some(WaveformLayer {
                color: Color::WHITE,
                line_width: 1.0,
                amplitude: 3.0,
            }),
            ..Default::default()
        };
        let img = synth.render(&window(vec![1.0; 10], vec![]), 10, 10, &layers).unwrap();
        assert_eq!(img.get_pixel(4, 2).0, [255, 255, 255, 255]);
        assert_eq!(img.get_pixel(4, 5).0, [0, 0, 0, 255]);
    }

    #[test]
    fn overlays_draw_on_top_of_spectrum() {
        let synth = FrameSynthesizer::default();
        let layers = LayerConfigs {
            spectrum: Some(SpectrumLayer {
                bar_count: 1,
                gap: 0.0,
                max_height: 1.0,
                reference_scale: 1.0,
                ..Default::default()
            }),
            overlays: vec![Overlay::Rect {
                x: 0,
                y: 0,
                width: 2,
                height: 2,
                color: Color::rgb(0, 0, 255),
            }],
            ..Default::default()
        };
        let img = synth.render(&window(vec![], vec![5.0; 4]), 4, 4, &layers).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 255, 255]);
        assert_eq!(img.get_pixel(3, 3).0, [255, 0, 0, 255]);
    }

    #[test]
    fn text_without_font_fails_validation() {
        let synth = FrameSynthesizer::default();
        let layers = LayerConfigs {
            overlays: vec![Overlay::Text {
                text: "beat".into(),
                x: 0,
                y: 0,
                size: 12.0,
                color: Color::WHITE,
            }],
            ..Default::default()
        };
        assert!(matches!(
            synth.validate(&layers, 1024),
            Err(Error::InvalidParameter(_))
        ));
    }
}
