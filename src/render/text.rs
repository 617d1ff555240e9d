use anyhow::{Context, Result};
use fontdue::{Font, FontSettings};
use std::path::{Path, PathBuf};

use super::canvas::Canvas;
use super::layers::Color;
use crate::config::FontConfig;

const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Rasterizes overlay text with a single loaded font.
pub struct TextOverlay {
    font: Font,
}

impl TextOverlay {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let font = Font::from_bytes(bytes, FontSettings::default())
            .map_err(|e| anyhow::anyhow!("Failed to parse font: {e}"))?;
        Ok(Self { font })
    }

    /// Resolve a font from config: explicit path, then URL, then well-known system fonts.
    pub fn resolve(config: &FontConfig) -> Result<Option<Self>> {
        if let Some(ref path) = config.path {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read font: {}", path.display()))?;
            return Self::from_bytes(&bytes).map(Some);
        }
        if let Some(ref url) = config.url {
            match load_font_from_url(url) {
                Ok(bytes) => return Self::from_bytes(&bytes).map(Some),
                Err(err) => log::warn!("Failed to load font from URL: {:#}", err),
            }
        }
        for candidate in SYSTEM_FONTS {
            let path = Path::new(candidate);
            if path.exists() {
                if let Ok(bytes) = std::fs::read(path) {
                    if let Ok(overlay) = Self::from_bytes(&bytes) {
                        log::debug!("Using system font {}", path.display());
                        return Ok(Some(overlay));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Draw `text` with its line box's top-left corner at (`x`, `y`).
    pub fn composite(&self, canvas: &mut Canvas, text: &str, x: i32, y: i32, size: f32, color: Color) {
        let mut cursor_x = x;
        for ch in text.chars() {
            let (metrics, bitmap) = self.font.rasterize(ch, size);
            let glyph_y = y + size as i32 - metrics.height as i32 - metrics.ymin;
            let glyph_x = cursor_x + metrics.xmin;

            for gy in 0..metrics.height {
                for gx in 0..metrics.width {
                    let alpha = bitmap[gy * metrics.width + gx];
                    if alpha == 0 {
                        continue;
                    }
                    canvas.blend(
                        (glyph_x + gx as i32) as i64,
                        (glyph_y + gy as i32) as i64,
                        color,
                        alpha as f32 / 255.0,
                    );
                }
            }

            cursor_x += metrics.advance_width.round() as i32;
        }
    }
}

/// Download a font once and keep it in the user cache directory.
pub fn load_font_from_url(url: &str) -> Result<Vec<u8>> {
    let cache_path = font_cache_path(url);
    if let Some(ref path) = cache_path {
        if path.exists() {
            log::debug!("Using cached font {}", path.display());
            return std::fs::read(path)
                .with_context(|| format!("Failed to read cached font: {}", path.display()));
        }
    }

    log::info!("Downloading font from {}", url);
    let response = reqwest::blocking::get(url)
        .with_context(|| format!("Failed to request font: {url}"))?
        .error_for_status()
        .with_context(|| format!("Font download failed: {url}"))?;
    let bytes = response.bytes().context("Failed to read font body")?.to_vec();

    if let Some(path) = cache_path {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create font cache dir: {}", dir.display()))?;
        }
        std::fs::write(&path, &bytes)
            .with_context(|| format!("Failed to cache font: {}", path.display()))?;
    }

    Ok(bytes)
}

fn font_cache_path(url: &str) -> Option<PathBuf> {
    let name: String = url
        .rsplit('/')
        .next()
        .unwrap_or("font.ttf")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    let name = if name.is_empty() { "font.ttf".to_string() } else { name };
    dirs::cache_dir().map(|dir| dir.join("beatcast").join("fonts").join(name))
}
