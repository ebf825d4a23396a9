//! Render surface used by the controller's draw pass.

use image::{Rgba, RgbaImage};

use crate::bitmap::Bitmap;
use crate::geometry::{Matrix, Rect, RectF, Size};

/// Something tiles can be drawn onto.
///
/// Destination rects are in drawable space; `matrix` maps them to the surface.
pub trait Canvas {
    fn size(&self) -> Size;

    /// Draw the `src` part of `bitmap` into `dst`.
    fn draw_bitmap(&mut self, bitmap: &Bitmap, src: Rect, dst: Rect, matrix: &Matrix);

    /// Blend a solid colour over `rect`.
    fn fill_rect(&mut self, rect: Rect, color: [u8; 4], matrix: &Matrix);
}

/// CPU canvas backed by an RGBA image.
///
/// Supports scale + translate matrices only, with nearest-neighbour sampling.
pub struct RasterCanvas {
    image: RgbaImage,
}

impl RasterCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
        }
    }

    pub fn with_background(width: u32, height: u32, color: [u8; 4]) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, Rgba(color)),
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Surface pixels whose centres fall inside `r`.
    fn pixel_span(&self, r: &RectF) -> Option<(u32, u32, u32, u32)> {
        let clamp_x = |v: f32| v.max(0.0).min(self.image.width() as f32) as u32;
        let clamp_y = |v: f32| v.max(0.0).min(self.image.height() as f32) as u32;
        let x0 = clamp_x((r.left - 0.5).ceil());
        let x1 = clamp_x((r.right - 0.5).ceil());
        let y0 = clamp_y((r.top - 0.5).ceil());
        let y1 = clamp_y((r.bottom - 0.5).ceil());
        (x0 < x1 && y0 < y1).then_some((x0, y0, x1, y1))
    }
}

impl Canvas for RasterCanvas {
    fn size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }

    fn draw_bitmap(&mut self, bitmap: &Bitmap, src: Rect, dst: Rect, matrix: &Matrix) {
        let Some(src) = src.intersect(&bitmap.size().to_rect()) else {
            return;
        };
        let mapped = matrix.map_rect(&dst.to_rect_f());
        if mapped.width() <= 0.0 || mapped.height() <= 0.0 {
            return;
        }
        let Some((x0, y0, x1, y1)) = self.pixel_span(&mapped) else {
            return;
        };

        let kx = src.width() as f32 / mapped.width();
        let ky = src.height() as f32 / mapped.height();
        for y in y0..y1 {
            let v = ((y as f32 + 0.5 - mapped.top) * ky) as i32;
            let sy = (src.top + v).clamp(src.top, src.bottom - 1) as u32;
            for x in x0..x1 {
                let u = ((x as f32 + 0.5 - mapped.left) * kx) as i32;
                let sx = (src.left + u).clamp(src.left, src.right - 1) as u32;
                if let Some(px) = bitmap.rgba_at(sx, sy) {
                    blend(self.image.get_pixel_mut(x, y), px);
                }
            }
        }
    }

    fn fill_rect(&mut self, rect: Rect, color: [u8; 4], matrix: &Matrix) {
        let mapped = matrix.map_rect(&rect.to_rect_f());
        let Some((x0, y0, x1, y1)) = self.pixel_span(&mapped) else {
            return;
        };
        for y in y0..y1 {
            for x in x0..x1 {
                blend(self.image.get_pixel_mut(x, y), color);
            }
        }
    }
}

/// Source-over alpha blending.
fn blend(dst: &mut Rgba<u8>, src: [u8; 4]) {
    let a = src[3] as u32;
    if a == 255 {
        dst.0 = src;
        return;
    }
    if a == 0 {
        return;
    }
    let inv = 255 - a;
    for i in 0..3 {
        dst.0[i] = ((src[i] as u32 * a + dst.0[i] as u32 * inv + 127) / 255) as u8;
    }
    dst.0[3] = (a + (dst.0[3] as u32 * inv + 127) / 255).min(255) as u8;
}
