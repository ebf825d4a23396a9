use std::fmt;

use xxhash_rust::xxh3::xxh3_64;

use crate::bitmap::{Bitmap, BitmapPool};
use crate::error::TileSummary;
use crate::geometry::Rect;

/// Process-unique tile identity within one grid manager.
pub type TileId = u64;

/// Identifies one decode request: a tile's geometry at one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey(pub u64);

impl TaskKey {
    pub fn new(id: TileId, src_rect: Rect, sample_size: u32, generation: u64) -> Self {
        let mut buf = [0u8; 36];
        buf[0..8].copy_from_slice(&id.to_le_bytes());
        buf[8..12].copy_from_slice(&src_rect.left.to_le_bytes());
        buf[12..16].copy_from_slice(&src_rect.top.to_le_bytes());
        buf[16..20].copy_from_slice(&src_rect.right.to_le_bytes());
        buf[20..24].copy_from_slice(&src_rect.bottom.to_le_bytes());
        buf[24..28].copy_from_slice(&sample_size.to_le_bytes());
        buf[28..36].copy_from_slice(&generation.to_le_bytes());
        Self(xxh3_64(&buf))
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One region of the image, positioned for display.
#[derive(Debug)]
pub struct Tile {
    pub id: TileId,
    /// Drawable space.
    pub draw_rect: Rect,
    /// Upright image space.
    pub src_rect: Rect,
    pub sample_size: u32,
    /// Drawable pixels per image pixel; `None` until the grid assigns it.
    pub scale: Option<f32>,
    pub bitmap: Option<Bitmap>,
    /// Part of `bitmap` that covers `src_rect`.
    pub bitmap_src_rect: Rect,
    /// Generation that produced `bitmap`, or the one it was created under.
    pub generation: u64,
    /// The last decode for this geometry failed.
    pub failed: bool,
}

impl Tile {
    pub fn new(id: TileId, draw_rect: Rect, src_rect: Rect, sample_size: u32, scale: f32, generation: u64) -> Self {
        Self {
            id,
            draw_rect,
            src_rect,
            sample_size,
            scale: Some(scale),
            bitmap: None,
            bitmap_src_rect: Rect::EMPTY,
            generation,
            failed: false,
        }
    }

    /// Geometry incomplete; such a tile is never drawn as decoded content.
    pub fn is_decode_param_empty(&self) -> bool {
        self.draw_rect.is_empty()
            || self.src_rect.is_empty()
            || self.sample_size == 0
            || self.scale.is_none()
    }

    /// No live bitmap, or nothing valid to draw it into.
    pub fn is_empty(&self) -> bool {
        self.bitmap.as_ref().map_or(true, Bitmap::is_recycled) || self.is_decode_param_empty()
    }

    /// Holds a drawable bitmap produced under `generation`.
    pub fn is_loaded_for(&self, generation: u64) -> bool {
        !self.is_empty() && self.generation == generation
    }

    pub fn task_key(&self, generation: u64) -> TaskKey {
        TaskKey::new(self.id, self.src_rect, self.sample_size, generation)
    }

    pub fn set_bitmap(&mut self, bitmap: Bitmap, bitmap_src_rect: Rect, generation: u64, pool: &dyn BitmapPool) {
        if let Some(old) = self.bitmap.replace(bitmap) {
            pool.free(old);
        }
        self.bitmap_src_rect = bitmap_src_rect;
        self.generation = generation;
        self.failed = false;
    }

    /// Drop the bitmap back into the pool, keeping geometry.
    pub fn release_bitmap(&mut self, pool: &dyn BitmapPool) {
        if let Some(old) = self.bitmap.take() {
            pool.free(old);
        }
        self.bitmap_src_rect = Rect::EMPTY;
    }

    /// Release the bitmap and zero the geometry.
    pub fn clean(&mut self, pool: &dyn BitmapPool) {
        self.release_bitmap(pool);
        self.draw_rect = Rect::EMPTY;
        self.src_rect = Rect::EMPTY;
        self.sample_size = 0;
        self.scale = None;
        self.failed = false;
    }

    pub fn summary(&self) -> TileSummary {
        TileSummary {
            id: self.id,
            draw_rect: self.draw_rect,
            src_rect: self.src_rect,
            sample_size: self.sample_size,
            has_bitmap: self.bitmap.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{BitmapConfig, LruBitmapPool};

    fn tile() -> Tile {
        Tile::new(7, Rect::new(0, 0, 125, 94), Rect::new(0, 0, 500, 376), 2, 0.25, 1)
    }

    #[test]
    fn test_decode_param_empty() {
        let mut t = tile();
        assert!(!t.is_decode_param_empty());
        assert!(t.is_empty());

        t.sample_size = 0;
        assert!(t.is_decode_param_empty());

        let mut t = tile();
        t.scale = None;
        assert!(t.is_decode_param_empty());
    }

    #[test]
    fn test_bitmap_lifecycle_goes_through_pool() {
        let pool = LruBitmapPool::new(1024 * 1024);
        let mut t = tile();

        t.set_bitmap(pool.alloc(250, 188, BitmapConfig::Rgba8888), Rect::new(0, 0, 250, 188), 3, &pool);
        assert!(t.is_loaded_for(3));
        assert!(!t.is_loaded_for(4));

        t.set_bitmap(pool.alloc(250, 188, BitmapConfig::Rgba8888), Rect::new(0, 0, 250, 188), 4, &pool);
        assert_eq!(pool.outstanding(), 1);

        t.clean(&pool);
        assert!(t.is_decode_param_empty());
        assert!(t.bitmap.is_none());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_task_key_changes_with_generation_and_geometry() {
        let t = tile();
        assert_eq!(t.task_key(1), t.task_key(1));
        assert_ne!(t.task_key(1), t.task_key(2));

        let mut moved = tile();
        moved.src_rect = moved.src_rect.offset(1, 0);
        assert_ne!(t.task_key(1), moved.task_key(1));
    }
}
