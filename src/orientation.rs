//! Orientation correction between upright and native image space.
//!
//! Tiles are computed in upright space (how the image is displayed). Decoders
//! work in native space (how the pixels are stored). The corrector maps
//! rectangles between the two and turns native-oriented bitmaps upright.

use std::fmt::Debug;

use image::imageops;

use crate::bitmap::{Bitmap, BitmapPool};
use crate::geometry::{Rect, Size};

/// Maps rectangles and bitmaps between upright and native orientation.
pub trait OrientationCorrector: Send + Sync + Debug {
    /// Upright rect -> native rect. `image_width`/`image_height` are upright.
    fn forward_rect(&self, rect: Rect, image_width: u32, image_height: u32) -> Rect;

    /// Native rect -> upright rect. `image_width`/`image_height` are upright.
    fn inverse_rect(&self, rect: Rect, image_width: u32, image_height: u32) -> Rect;

    /// Turn a native-oriented bitmap upright. The input goes back to `pool`
    /// when a new bitmap is produced.
    fn rotate_bitmap(&self, bitmap: Bitmap, pool: &dyn BitmapPool) -> Result<Bitmap, Bitmap>;

    /// Upright size of an image stored with `native` dimensions.
    fn upright_size(&self, native: Size) -> Size;
}

/// The eight EXIF orientations, named by the transform needed to display them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExifOrientation {
    #[default]
    Normal,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    /// EXIF 5: mirror along the main diagonal.
    Transpose,
    Rotate90,
    /// EXIF 7: mirror along the anti-diagonal.
    Transverse,
    Rotate270,
}

impl ExifOrientation {
    /// From the raw EXIF tag value (1-8). Unknown values mean no transform.
    pub fn from_exif(value: u16) -> Self {
        match value {
            2 => Self::FlipHorizontal,
            3 => Self::Rotate180,
            4 => Self::FlipVertical,
            5 => Self::Transpose,
            6 => Self::Rotate90,
            7 => Self::Transverse,
            8 => Self::Rotate270,
            _ => Self::Normal,
        }
    }

    pub fn exif_value(&self) -> u16 {
        match self {
            Self::Normal => 1,
            Self::FlipHorizontal => 2,
            Self::Rotate180 => 3,
            Self::FlipVertical => 4,
            Self::Transpose => 5,
            Self::Rotate90 => 6,
            Self::Transverse => 7,
            Self::Rotate270 => 8,
        }
    }

    /// True when width and height swap between native and upright space.
    pub fn swaps_dimensions(&self) -> bool {
        matches!(
            self,
            Self::Transpose | Self::Rotate90 | Self::Transverse | Self::Rotate270
        )
    }
}

impl From<image::metadata::Orientation> for ExifOrientation {
    fn from(o: image::metadata::Orientation) -> Self {
        use image::metadata::Orientation as O;
        match o {
            O::NoTransforms => Self::Normal,
            O::Rotate90 => Self::Rotate90,
            O::Rotate180 => Self::Rotate180,
            O::Rotate270 => Self::Rotate270,
            O::FlipHorizontal => Self::FlipHorizontal,
            O::FlipVertical => Self::FlipVertical,
            O::Rotate90FlipH => Self::Transpose,
            O::Rotate270FlipH => Self::Transverse,
        }
    }
}

impl OrientationCorrector for ExifOrientation {
    fn forward_rect(&self, r: Rect, image_width: u32, image_height: u32) -> Rect {
        let (w, h) = (image_width as i32, image_height as i32);
        match self {
            Self::Normal => r,
            Self::FlipHorizontal => Rect::new(w - r.right, r.top, w - r.left, r.bottom),
            Self::FlipVertical => Rect::new(r.left, h - r.bottom, r.right, h - r.top),
            Self::Rotate180 => Rect::new(w - r.right, h - r.bottom, w - r.left, h - r.top),
            Self::Transpose => Rect::new(r.top, r.left, r.bottom, r.right),
            Self::Rotate90 => Rect::new(r.top, w - r.right, r.bottom, w - r.left),
            Self::Rotate270 => Rect::new(h - r.bottom, r.left, h - r.top, r.right),
            Self::Transverse => Rect::new(h - r.bottom, w - r.right, h - r.top, w - r.left),
        }
    }

    fn inverse_rect(&self, r: Rect, image_width: u32, image_height: u32) -> Rect {
        let (w, h) = (image_width as i32, image_height as i32);
        match self {
            Self::Rotate90 => Rect::new(w - r.bottom, r.left, w - r.top, r.right),
            Self::Rotate270 => Rect::new(r.top, h - r.right, r.bottom, h - r.left),
            Self::Transverse => Rect::new(w - r.bottom, h - r.right, w - r.top, h - r.left),
            // The rest are their own inverse
            _ => self.forward_rect(r, image_width, image_height),
        }
    }

    fn rotate_bitmap(&self, bitmap: Bitmap, pool: &dyn BitmapPool) -> Result<Bitmap, Bitmap> {
        if *self == Self::Normal {
            return Ok(bitmap);
        }
        let Some(native) = bitmap.to_rgba_image() else {
            return Err(bitmap);
        };

        let upright = match self {
            Self::Normal => native,
            Self::FlipHorizontal => imageops::flip_horizontal(&native),
            Self::FlipVertical => imageops::flip_vertical(&native),
            Self::Rotate180 => imageops::rotate180(&native),
            Self::Rotate90 => imageops::rotate90(&native),
            Self::Rotate270 => imageops::rotate270(&native),
            Self::Transpose => imageops::flip_horizontal(&imageops::rotate90(&native)),
            Self::Transverse => imageops::flip_horizontal(&imageops::rotate270(&native)),
        };

        let config = bitmap.config();
        let mut out = pool
            .try_reuse(upright.width(), upright.height(), config)
            .unwrap_or_else(|| pool.alloc(upright.width(), upright.height(), config));
        if !out.fill_from_rgba(&upright) {
            pool.free(out);
            return Err(bitmap);
        }
        pool.free(bitmap);
        Ok(out)
    }

    fn upright_size(&self, native: Size) -> Size {
        if self.swaps_dimensions() {
            native.transposed()
        } else {
            native
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{BitmapConfig, LruBitmapPool};

    const ALL: [ExifOrientation; 8] = [
        ExifOrientation::Normal,
        ExifOrientation::FlipHorizontal,
        ExifOrientation::Rotate180,
        ExifOrientation::FlipVertical,
        ExifOrientation::Transpose,
        ExifOrientation::Rotate90,
        ExifOrientation::Transverse,
        ExifOrientation::Rotate270,
    ];

    #[test]
    fn test_exif_values() {
        for o in ALL {
            assert_eq!(ExifOrientation::from_exif(o.exif_value()), o);
        }
        assert_eq!(ExifOrientation::from_exif(0), ExifOrientation::Normal);
    }

    #[test]
    fn test_forward_rect_stays_in_native_bounds() {
        // Upright 400x300
        let (w, h) = (400, 300);
        let r = Rect::new(10, 20, 110, 70);
        for o in ALL {
            let native_bounds = if o.swaps_dimensions() {
                Size::new(h, w)
            } else {
                Size::new(w, h)
            };
            let mapped = o.forward_rect(r, w, h);
            assert!(native_bounds.to_rect().contains(&mapped), "{o:?} -> {mapped}");
            assert_eq!(mapped.area(), r.area());
            assert_eq!(o.inverse_rect(mapped, w, h), r, "{o:?}");
        }
    }

    #[test]
    fn test_rotate90_rect_mapping() {
        // Upright 300 wide, 400 tall; stored as 400x300 rotated CCW
        let mapped = ExifOrientation::Rotate90.forward_rect(Rect::new(0, 0, 100, 50), 300, 400);
        assert_eq!(mapped, Rect::new(0, 200, 50, 300));
    }

    #[test]
    fn test_rotate_bitmap_matches_rect_mapping() {
        let pool = LruBitmapPool::new(1024 * 1024);
        // Native 3x2 with a single marked pixel
        let mut native = pool.alloc(3, 2, BitmapConfig::Gray8);
        native.pixels_mut()[0] = 255; // native (0, 0)

        for o in ALL {
            let mut copy = pool.alloc(3, 2, BitmapConfig::Gray8);
            copy.copy_from_slice(native.pixels());
            let upright = o.rotate_bitmap(copy, &pool).unwrap();
            let size = o.upright_size(Size::new(3, 2));
            assert_eq!(upright.size(), size);

            // Find where the marked pixel went and check it against the rect mapping
            let marked = (0..size.height)
                .flat_map(|y| (0..size.width).map(move |x| (x, y)))
                .find(|&(x, y)| upright.rgba_at(x, y).map(|p| p[0]) == Some(255))
                .unwrap();
            let cell = Rect::from_xywh(marked.0 as i32, marked.1 as i32, 1, 1);
            assert_eq!(
                o.forward_rect(cell, size.width, size.height),
                Rect::new(0, 0, 1, 1),
                "{o:?}"
            );
            pool.free(upright);
        }
        pool.free(native);
        assert_eq!(pool.outstanding(), 0);
    }
}
