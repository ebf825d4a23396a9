//! Decoded pixel buffers and their reuse pool.
//!
//! This module provides:
//! - `Bitmap` - an owned pixel buffer with a fixed pixel layout
//! - `BitmapPool` - the shared allocation/reuse contract
//! - `LruBitmapPool` - byte-budgeted LRU implementation of the pool

pub mod pool;

pub use pool::{BitmapPool, LruBitmapPool};

use image::RgbaImage;

use crate::geometry::Size;

/// Pixel layout of a [`Bitmap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BitmapConfig {
    #[default]
    Rgba8888,
    Rgb888,
    Gray8,
}

impl BitmapConfig {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Rgba8888 => 4,
            Self::Rgb888 => 3,
            Self::Gray8 => 1,
        }
    }

    pub fn byte_count(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

/// An owned, tightly packed pixel buffer.
///
/// Bitmaps are allocated and released through a [`BitmapPool`]. A recycled
/// bitmap has released its pixels and must not be drawn or pooled again.
#[derive(Debug)]
pub struct Bitmap {
    width: u32,
    height: u32,
    config: BitmapConfig,
    pixels: Vec<u8>,
    recycled: bool,
}

impl Bitmap {
    /// Allocate a zeroed bitmap. Prefer [`BitmapPool::alloc`] outside of pools.
    pub fn new(width: u32, height: u32, config: BitmapConfig) -> Self {
        Self {
            width,
            height,
            config,
            pixels: vec![0; config.byte_count(width, height)],
            recycled: false,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn config(&self) -> BitmapConfig {
        self.config
    }

    /// Bytes used by the current shape.
    pub fn byte_count(&self) -> usize {
        self.config.byte_count(self.width, self.height)
    }

    /// Bytes held by the underlying allocation.
    pub fn allocation_bytes(&self) -> usize {
        self.pixels.capacity()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn is_recycled(&self) -> bool {
        self.recycled
    }

    /// Release the pixel memory. The bitmap is unusable afterwards.
    pub fn recycle(&mut self) {
        self.pixels = Vec::new();
        self.recycled = true;
    }

    /// Change the shape in place when the allocation is large enough.
    ///
    /// Pixel contents after a successful reconfigure are unspecified.
    pub fn reconfigure(&mut self, width: u32, height: u32, config: BitmapConfig) -> bool {
        if self.recycled {
            return false;
        }
        let needed = config.byte_count(width, height);
        if needed > self.pixels.capacity() {
            return false;
        }
        self.pixels.resize(needed, 0);
        self.width = width;
        self.height = height;
        self.config = config;
        true
    }

    /// Copy tightly packed pixels of the same shape into this bitmap.
    pub fn copy_from_slice(&mut self, data: &[u8]) -> bool {
        if data.len() != self.pixels.len() {
            return false;
        }
        self.pixels.copy_from_slice(data);
        true
    }

    /// RGBA value at `(x, y)`, expanding narrower layouts.
    pub fn rgba_at(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if self.recycled || x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.config.bytes_per_pixel();
        let i = (y as usize * self.width as usize + x as usize) * bpp;
        let p = self.pixels.get(i..i + bpp)?;
        Some(match self.config {
            BitmapConfig::Rgba8888 => [p[0], p[1], p[2], p[3]],
            BitmapConfig::Rgb888 => [p[0], p[1], p[2], 255],
            BitmapConfig::Gray8 => [p[0], p[0], p[0], 255],
        })
    }

    /// Build a bitmap from an RGBA image, converting to `config`.
    pub fn from_rgba_image(img: &RgbaImage, config: BitmapConfig) -> Self {
        let mut bitmap = Bitmap::new(img.width(), img.height(), config);
        bitmap.fill_from_rgba(img);
        bitmap
    }

    /// Overwrite this bitmap with `img`, which must match its dimensions.
    pub(crate) fn fill_from_rgba(&mut self, img: &RgbaImage) -> bool {
        if img.width() != self.width || img.height() != self.height || self.recycled {
            return false;
        }
        let bpp = self.config.bytes_per_pixel();
        for (dst, px) in self.pixels.chunks_exact_mut(bpp).zip(img.pixels()) {
            match self.config {
                BitmapConfig::Rgba8888 => dst.copy_from_slice(&px.0),
                BitmapConfig::Rgb888 => dst.copy_from_slice(&px.0[..3]),
                BitmapConfig::Gray8 => dst[0] = luma(px.0),
            }
        }
        true
    }

    /// Expand to an RGBA image (for compositing and image-crate operations).
    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        if self.recycled {
            return None;
        }
        let mut out = RgbaImage::new(self.width, self.height);
        for (x, y, px) in out.enumerate_pixels_mut() {
            if let Some(rgba) = self.rgba_at(x, y) {
                px.0 = rgba;
            }
        }
        Some(out)
    }
}

/// Rec. 601 luma, matching what the image crate produces for `to_luma8`.
fn luma(rgba: [u8; 4]) -> u8 {
    let [r, g, b, _] = rgba;
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}
