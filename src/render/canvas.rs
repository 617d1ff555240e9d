use image::{Rgba, RgbaImage};

use super::layers::Color;

/// CPU raster target. Every operation clips to the image bounds.
pub struct Canvas {
    image: RgbaImage,
}

impl Canvas {
    /// Opaque black canvas.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, Rgba(Color::BLACK.0)),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Source-over blend of `color` scaled by `coverage` (0..=1).
    pub fn blend(&mut self, x: i64, y: i64, color: Color, coverage: f32) {
        if x < 0 || y < 0 || x >= self.width() as i64 || y >= self.height() as i64 {
            return;
        }
        let a = (color.0[3] as f32 / 255.0) * coverage.clamp(0.0, 1.0);
        if a <= 0.0 {
            return;
        }
        let px = self.image.get_pixel_mut(x as u32, y as u32);
        let inv_a = 1.0 - a;
        for c in 0..3 {
            px.0[c] = (color.0[c] as f32 * a + px.0[c] as f32 * inv_a).round() as u8;
        }
        px.0[3] = 255;
    }

    /// Fill the axis-aligned rectangle covering pixel centres inside `[x0,x1) x [y0,y1)`.
    pub fn fill_rect(&mut self, x0: f32, y0: f32, x1: f32, y1: f32, color: Color) {
        let (w, h) = (self.width() as f32, self.height() as f32);
        let left = x0.max(0.0).round() as i64;
        let right = x1.min(w).round() as i64;
        let top = y0.max(0.0).round() as i64;
        let bottom = y1.min(h).round() as i64;
        for y in top..bottom {
            for x in left..right {
                self.blend(x, y, color, 1.0);
            }
        }
    }

    /// Stroke a connected polyline by stamping square pens along each segment.
    pub fn stroke_polyline(&mut self, points: &[(f32, f32)], width: f32, color: Color) {
        let half = (width.max(1.0) - 1.0) / 2.0;
        match points {
            [] => {}
            [only] => self.stamp(only.0, only.1, half, color),
            _ => {
                for seg in points.windows(2) {
                    let (ax, ay) = seg[0];
                    let (bx, by) = seg[1];
                    let steps = (bx - ax).abs().max((by - ay).abs()).ceil().max(1.0) as usize;
                    for s in 0..=steps {
                        let t = s as f32 / steps as f32;
                        self.stamp(ax + (bx - ax) * t, ay + (by - ay) * t, half, color);
                    }
                }
            }
        }
    }

    fn stamp(&mut self, cx: f32, cy: f32, half: f32, color: Color) {
        let x0 = (cx - half).round() as i64;
        let x1 = (cx + half).round() as i64;
        let y0 = (cy - half).round() as i64;
        let y1 = (cy + half).round() as i64;
        for y in y0..=y1 {
            for x in x0..=x1 {
                if let Some(px) = self.pixel_mut(x, y) {
                    // Opaque pens overwrite so overlapping stamps do not darken.
                    if color.0[3] == 255 {
                        *px = Rgba(color.0);
                        continue;
                    }
                }
                self.blend(x, y, color, 1.0);
            }
        }
    }

    fn pixel_mut(&mut self, x: i64, y: i64) -> Option<&mut Rgba<u8>> {
        if x < 0 || y < 0 || x >= self.width() as i64 || y >= self.height() as i64 {
            return None;
        }
        Some(self.image.get_pixel_mut(x as u32, y as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_opaque_black() {
        let canvas = Canvas::new(4, 3).into_image();
        assert!(canvas.pixels().all(|p| p.0 == [0, 0, 0, 255]));
    }

    #[test]
    fn fill_rect_clips_to_bounds() {
        let mut canvas = Canvas::new(4, 4);
        canvas.fill_rect(-2.0, 2.0, 10.0, 10.0, Color::WHITE);
        let img = canvas.into_image();
        assert_eq!(img.get_pixel(0, 1).0, [0, 0, 0, 255]);
        assert_eq!(img.get_pixel(3, 3).0, [255, 255, 255, 255]);
        assert_eq!(img.get_pixel(0, 2).0, [255, 255, 255, 255]);
    }

    #[test]
    fn horizontal_line_covers_every_column() {
        let mut canvas = Canvas::new(10, 5);
        canvas.stroke_polyline(&[(0.0, 2.0), (9.0, 2.0)], 1.0, Color::rgb(0, 255, 0));
        let img = canvas.into_image();
        for x in 0..10 {
            assert_eq!(img.get_pixel(x, 2).0, [0, 255, 0, 255]);
            assert_eq!(img.get_pixel(x, 0).0, [0, 0, 0, 255]);
        }
    }

    #[test]
    fn translucent_blend_mixes_with_background() {
        let mut canvas = Canvas::new(1, 1);
        canvas.blend(0, 0, Color([255, 0, 0, 128]), 1.0);
        let px = canvas.into_image().get_pixel(0, 0).0;
        assert_eq!(px, [128, 0, 0, 255]);
    }
}
