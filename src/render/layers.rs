use serde::{Deserialize, Serialize};
use std::fmt;

/// RGBA colour, written as `#rrggbb` or `#rrggbbaa` in config files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color(pub [u8; 4]);

impl Color {
    pub const BLACK: Color = Color([0, 0, 0, 255]);
    pub const WHITE: Color = Color([255, 255, 255, 255]);

    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Color([r, g, b, 255])
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let hex = s.trim().trim_start_matches('#');
        if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
            return Err(format!("invalid colour '{s}', expected #rrggbb or #rrggbbaa"));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| format!("invalid colour '{s}'"))
        };
        let alpha = if hex.len() == 8 { channel(3)? } else { 255 };
        Ok(Color([channel(0)?, channel(1)?, channel(2)?, alpha]))
    }
}

impl TryFrom<String> for Color {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Color::parse(&value)
    }
}

impl From<Color> for String {
    fn from(c: Color) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b, a] = self.0;
        if a == 255 {
            write!(f, "#{r:02x}{g:02x}{b:02x}")
        } else {
            write!(f, "#{r:02x}{g:02x}{b:02x}{a:02x}")
        }
    }
}

/// Time-domain polyline across the full canvas width.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaveformLayer {
    #[serde(default = "default_waveform_color")]
    pub color: Color,
    #[serde(default = "default_line_width")]
    pub line_width: f32,
    /// Pixels of vertical deflection for a full-scale (1.0) sample.
    #[serde(default = "default_amplitude")]
    pub amplitude: f32,
}

impl Default for WaveformLayer {
    fn default() -> Self {
        Self {
            color: default_waveform_color(),
            line_width: default_line_width(),
            amplitude: default_amplitude(),
        }
    }
}

/// Bottom-anchored magnitude bars.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectrumLayer {
    #[serde(default = "default_bar_count")]
    pub bar_count: usize,
    #[serde(default = "default_spectrum_color")]
    pub color: Color,
    /// Horizontal gap between neighbouring bars, in pixels.
    #[serde(default = "default_bar_gap")]
    pub gap: f32,
    /// Tallest bar as a fraction of canvas height.
    #[serde(default = "default_max_height")]
    pub max_height: f32,
    /// Bin-average magnitude that maps to a full-height bar.
    #[serde(default = "default_reference_scale")]
    pub reference_scale: f32,
}

impl Default for SpectrumLayer {
    fn default() -> Self {
        Self {
            bar_count: default_bar_count(),
            color: default_spectrum_color(),
            gap: default_bar_gap(),
            max_height: default_max_height(),
            reference_scale: default_reference_scale(),
        }
    }
}

/// Static decorations drawn over the audio layers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Overlay {
    Text {
        text: String,
        #[serde(default = "default_overlay_pos")]
        x: i32,
        #[serde(default = "default_overlay_pos")]
        y: i32,
        #[serde(default = "default_font_size")]
        size: f32,
        #[serde(default = "default_overlay_color")]
        color: Color,
    },
    Rect {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        #[serde(default = "default_overlay_color")]
        color: Color,
    },
}

/// Which layers to draw. A missing layer is skipped, never defaulted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerConfigs {
    #[serde(default)]
    pub waveform: Option<WaveformLayer>,
    #[serde(default)]
    pub spectrum: Option<SpectrumLayer>,
    #[serde(default)]
    pub overlays: Vec<Overlay>,
}

impl LayerConfigs {
    pub fn has_text(&self) -> bool {
        self.overlays
            .iter()
            .any(|o| matches!(o, Overlay::Text { .. }))
    }
}

fn default_waveform_color() -> Color { Color::rgb(0x00, 0xff, 0x00) }
fn default_spectrum_color() -> Color { Color::rgb(0xff, 0x00, 0x00) }
fn default_overlay_color() -> Color { Color::WHITE }
fn default_line_width() -> f32 { 2.0 }
fn default_amplitude() -> f32 { 100.0 }
fn default_bar_count() -> usize { 64 }
fn default_bar_gap() -> f32 { 2.0 }
fn default_max_height() -> f32 { 0.7 }
fn default_reference_scale() -> f32 { 64.0 }
fn default_overlay_pos() -> i32 { 50 }
fn default_font_size() -> f32 { 30.0 }
