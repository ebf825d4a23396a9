//! Viewport-to-tile-set computation and reconciliation.
//!
//! The visible part of the drawable is cut into roughly `(n+1) x (n+1)` cells
//! on a lattice anchored at the drawable origin, so interior tiles keep their
//! identity while panning at a fixed zoom. Each cell maps to an upright image
//! rectangle decoded at one sample size for the whole grid.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, trace};

use super::tile::{Tile, TileId};
use crate::bitmap::{Bitmap, BitmapPool};
use crate::config::{EngineFlavor, MAX_BLOCK_BASE_NUMBER};
use crate::error::ContractError;
use crate::geometry::{Rect, Size};
use crate::sampling::{calculate_sample_size, SampleSizePolicy};
use crate::viewport::ViewportSnapshot;

/// Result of one [`TileGridManager::update`].
#[derive(Debug, Default)]
pub struct GridUpdate {
    /// Sample size shared by every tile of the new set; 0 when cleared.
    pub sample_size: u32,
    /// Tiles lacking a bitmap for the current generation, in draw order.
    pub needs_decode: Vec<TileId>,
    pub kept: usize,
    pub created: usize,
    pub cleaned: usize,
    /// Set when the ordering step misbehaved; the list was re-sorted anyway.
    pub sort_violation: Option<ContractError>,
}

/// Tiling inputs of the last update; failures are retried only when they change.
#[derive(Debug, Clone, Copy, PartialEq)]
struct GridGeometry {
    visible: Rect,
    drawable: Size,
    image: Size,
    zoom: f32,
}

/// Owns the current tile list and reconciles it with each viewport change.
pub struct TileGridManager {
    block_base_number: u32,
    policy: SampleSizePolicy,
    flavor: EngineFlavor,
    tiles: Vec<Tile>,
    next_id: TileId,
    last_geometry: Option<GridGeometry>,
}

impl TileGridManager {
    pub fn new(block_base_number: u32, policy: SampleSizePolicy, flavor: EngineFlavor) -> Self {
        Self {
            block_base_number: block_base_number.clamp(1, MAX_BLOCK_BASE_NUMBER),
            policy,
            flavor,
            tiles: Vec::new(),
            next_id: 1,
            last_geometry: None,
        }
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn tile(&self, id: TileId) -> Option<&Tile> {
        self.tiles.iter().find(|t| t.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Recompute the tile set for `snapshot` and diff it against the current one.
    pub fn update(
        &mut self,
        snapshot: &ViewportSnapshot,
        image_size: Size,
        generation: u64,
        pool: &dyn BitmapPool,
    ) -> GridUpdate {
        if snapshot.has_empty_input() || image_size.is_empty() || snapshot.is_fully_zoomed_out() {
            return GridUpdate {
                cleaned: self.clean_all(pool),
                ..GridUpdate::default()
            };
        }
        let Some(visible) = snapshot
            .visible_rect
            .intersect(&snapshot.drawable_size.to_rect())
        else {
            return GridUpdate {
                cleaned: self.clean_all(pool),
                ..GridUpdate::default()
            };
        };

        let geometry = GridGeometry {
            visible,
            drawable: snapshot.drawable_size,
            image: image_size,
            zoom: snapshot.zoom_scale,
        };
        let geometry_changed = self.last_geometry != Some(geometry);
        self.last_geometry = Some(geometry);

        let sx = image_size.width as f64 / snapshot.drawable_size.width as f64;
        let sy = image_size.height as f64 / snapshot.drawable_size.height as f64;
        let image_rect = image_size.to_rect();

        let src_visible = visible.scale_out(sx, sy).intersect(&image_rect).unwrap_or(image_rect);
        let on_screen = Size::new(
            (visible.width() as f32 * snapshot.zoom_scale).ceil().max(1.0) as u32,
            (visible.height() as f32 * snapshot.zoom_scale).ceil().max(1.0) as u32,
        );
        let sample_size = calculate_sample_size(src_visible.size(), on_screen, self.policy);
        let scale = (1.0 / sx) as f32;

        let cells = self.cells(visible);

        // Diff by (src_rect, sample_size)
        let mut previous: HashMap<(Rect, u32), Tile> = HashMap::with_capacity(self.tiles.len());
        let mut cleaned = 0;
        for tile in self.tiles.drain(..) {
            let key = (tile.src_rect, tile.sample_size);
            if let Some(mut dup) = previous.insert(key, tile) {
                dup.clean(pool);
                cleaned += 1;
            }
        }

        let mut kept = 0;
        let mut created = 0;
        for draw_rect in cells {
            let Some(src_rect) = draw_rect.scale_out(sx, sy).intersect(&image_rect) else {
                continue;
            };
            match previous.remove(&(src_rect, sample_size)) {
                Some(mut tile) => {
                    tile.draw_rect = draw_rect;
                    if geometry_changed {
                        tile.failed = false;
                    }
                    kept += 1;
                    self.tiles.push(tile);
                }
                None => {
                    let id = self.next_id;
                    self.next_id = self.next_id.wrapping_add(1);
                    created += 1;
                    self.tiles
                        .push(Tile::new(id, draw_rect, src_rect, sample_size, scale, generation));
                }
            }
        }

        for (_, mut tile) in previous {
            tile.clean(pool);
            cleaned += 1;
        }

        let sort_violation = sort_tiles(&mut self.tiles, self.flavor);

        let needs_decode: Vec<TileId> = self
            .tiles
            .iter()
            .filter(|t| !t.failed && !t.is_decode_param_empty() && !t.is_loaded_for(generation))
            .map(|t| t.id)
            .collect();

        debug!(
            %visible,
            sample_size,
            tiles = self.tiles.len(),
            kept,
            created,
            cleaned,
            pending = needs_decode.len(),
            "Updated tile grid"
        );

        GridUpdate {
            sample_size,
            needs_decode,
            kept,
            created,
            cleaned,
            sort_violation,
        }
    }

    /// Lattice cells covering `visible`, clipped to it, in row-major order.
    fn cells(&self, visible: Rect) -> Vec<Rect> {
        let n = self.block_base_number as i32 + 1;
        let cell_w = ((visible.width() + n - 1) / n).max(1);
        let cell_h = ((visible.height() + n - 1) / n).max(1);

        let cols = (visible.width() / cell_w + 2) as usize;
        let rows = (visible.height() / cell_h + 2) as usize;
        let mut cells = Vec::with_capacity(cols * rows);
        let mut y = visible.top.div_euclid(cell_h) * cell_h;
        while y < visible.bottom {
            let mut x = visible.left.div_euclid(cell_w) * cell_w;
            while x < visible.right {
                if let Some(cell) = Rect::new(x, y, x + cell_w, y + cell_h).intersect(&visible) {
                    cells.push(cell);
                }
                x += cell_w;
            }
            y += cell_h;
        }
        cells
    }

    /// Attach a decoded bitmap to tile `id`. The bitmap goes back to the pool
    /// when the tile is gone or no longer decodable.
    pub fn install(
        &mut self,
        id: TileId,
        bitmap: Bitmap,
        bitmap_src_rect: Rect,
        generation: u64,
        pool: &dyn BitmapPool,
    ) -> bool {
        match self
            .tiles
            .iter_mut()
            .find(|t| t.id == id && !t.is_decode_param_empty())
        {
            Some(tile) => {
                tile.set_bitmap(bitmap, bitmap_src_rect, generation, pool);
                true
            }
            None => {
                pool.free(bitmap);
                false
            }
        }
    }

    /// Keep tile `id` from being resubmitted until the geometry changes.
    pub fn mark_failed(&mut self, id: TileId) {
        if let Some(tile) = self.tiles.iter_mut().find(|t| t.id == id) {
            tile.failed = true;
        }
    }

    /// Clean and drop every tile. Returns how many were dropped.
    pub fn clean_all(&mut self, pool: &dyn BitmapPool) -> usize {
        let count = self.tiles.len();
        for mut tile in self.tiles.drain(..) {
            tile.clean(pool);
        }
        self.last_geometry = None;
        if count > 0 {
            trace!(count, "Cleaned all tiles");
        }
        count
    }

    /// Tile whose draw rect contains the drawable-space point.
    pub fn tile_at_drawable(&self, x: f32, y: f32) -> Option<&Tile> {
        self.tiles.iter().find(|t| t.draw_rect.contains_point(x, y))
    }

    /// Tile whose source rect contains the upright image-space point.
    pub fn tile_at_image(&self, x: f32, y: f32) -> Option<&Tile> {
        self.tiles.iter().find(|t| t.src_rect.contains_point(x, y))
    }
}

/// Put `tiles` into draw order. Returns the captured violation, if any.
pub(crate) fn sort_tiles(tiles: &mut [Tile], flavor: EngineFlavor) -> Option<ContractError> {
    let violation = match flavor {
        EngineFlavor::Current => None,
        EngineFlavor::Legacy => legacy_sort(tiles),
    };
    tiles.sort_by_key(row_major_key);
    violation
}

fn row_major_key(t: &Tile) -> (i32, i32, i32, i32, TileId) {
    let r = t.draw_rect;
    (r.top, r.left, r.bottom, r.right, t.id)
}

/// Overlap-based ordering: tiles sharing any vertical span compare by `left`,
/// others by `top`. Not a total order for irregular rects.
fn legacy_compare(a: &Tile, b: &Tile) -> Ordering {
    let (ra, rb) = (a.draw_rect, b.draw_rect);
    if ra.top < rb.bottom && rb.top < ra.bottom {
        ra.left.cmp(&rb.left)
    } else {
        ra.top.cmp(&rb.top)
    }
}

fn legacy_sort(tiles: &mut [Tile]) -> Option<ContractError> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| tiles.sort_by(legacy_compare)));
    let message = match outcome {
        Err(payload) => Some(format!("comparator panicked: {}", panic_message(&*payload))),
        Ok(()) => tiles
            .windows(2)
            .position(|w| (w[0].draw_rect.top, w[0].draw_rect.left) > (w[1].draw_rect.top, w[1].draw_rect.left))
            .map(|i| format!("tiles #{} and #{} out of row-major order", tiles[i].id, tiles[i + 1].id)),
    }?;

    Some(ContractError::SortViolation {
        message,
        tiles: tiles.iter().map(Tile::summary).collect(),
    })
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{BitmapConfig, LruBitmapPool};
    use crate::geometry::Point;
    use crate::viewport::StaticViewport;

    const IMAGE: Size = Size::new(4000, 3000);

    fn quarter_snapshot() -> ViewportSnapshot {
        let vp = StaticViewport::fit(IMAGE, Size::new(1000, 750)).zoomed(2.0, Point::new(0.25, 0.25));
        ViewportSnapshot::capture(&vp, 1.0)
    }

    fn manager() -> TileGridManager {
        TileGridManager::new(3, SampleSizePolicy::default(), EngineFlavor::Current)
    }

    fn union_area(tiles: &[Tile]) -> u64 {
        tiles.iter().map(|t| t.draw_rect.area()).sum()
    }

    #[test]
    fn test_top_left_quarter_at_2x() {
        let pool = LruBitmapPool::new(0);
        let mut grid = manager();
        let snap = quarter_snapshot();
        let update = grid.update(&snap, IMAGE, 1, &pool);

        assert_eq!(grid.tiles().len(), 16);
        assert_eq!(update.created, 16);
        assert_eq!(update.needs_decode.len(), 16);
        // 2000x1500 image pixels shown on 1000x750 screen pixels
        assert_eq!(update.sample_size, 2);

        let mut rows: Vec<i32> = grid.tiles().iter().map(|t| t.draw_rect.top).collect();
        rows.dedup();
        assert_eq!(rows.len(), 4);

        // Exact coverage of the visible rect, nothing outside the drawable
        let visible = snap.visible_rect;
        assert_eq!(union_area(grid.tiles()), visible.area());
        for t in grid.tiles() {
            assert!(visible.contains(&t.draw_rect));
            assert!(IMAGE.to_rect().contains(&t.src_rect));
            assert_eq!(t.sample_size, 2);
        }
        for (i, a) in grid.tiles().iter().enumerate() {
            for b in &grid.tiles()[i + 1..] {
                assert!(!a.draw_rect.intersects(&b.draw_rect));
            }
        }
        // Source rects cover the top-left image quarter
        let src_union: u64 = grid.tiles().iter().map(|t| t.src_rect.area()).sum();
        assert!(src_union >= 2000 * 1500);
    }

    #[test]
    fn test_repeat_update_is_idempotent() {
        let pool = LruBitmapPool::new(64 * 1024 * 1024);
        let mut grid = manager();
        let snap = quarter_snapshot();
        let first = grid.update(&snap, IMAGE, 1, &pool);

        for id in first.needs_decode {
            let b = pool.alloc(4, 4, BitmapConfig::Rgba8888);
            assert!(grid.install(id, b, Rect::new(0, 0, 4, 4), 1, &pool));
        }

        let second = grid.update(&snap, IMAGE, 1, &pool);
        assert!(second.needs_decode.is_empty());
        assert_eq!(second.kept, 16);
        assert_eq!(second.created, 0);
        assert_eq!(second.cleaned, 0);
        assert_eq!(pool.outstanding(), 16);

        grid.clean_all(&pool);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_pan_keeps_interior_tiles() {
        let pool = LruBitmapPool::new(64 * 1024 * 1024);
        let mut grid = manager();
        let mut vp = StaticViewport::fit(IMAGE, Size::new(1000, 750)).zoomed(2.0, Point::new(0.25, 0.25));
        let first = grid.update(&ViewportSnapshot::capture(&vp, 2.0), IMAGE, 1, &pool);
        for id in first.needs_decode {
            grid.install(id, pool.alloc(4, 4, BitmapConfig::Gray8), Rect::new(0, 0, 4, 4), 1, &pool);
        }

        // Pan right by exactly one cell
        vp.visible_rect = vp.visible_rect.offset(125, 0);
        let update = grid.update(&ViewportSnapshot::capture(&vp, 2.0), IMAGE, 1, &pool);
        assert_eq!(update.kept, 12);
        assert_eq!(update.created, 4);
        assert_eq!(update.cleaned, 4);
        assert_eq!(update.needs_decode.len(), 4);
        assert_eq!(pool.outstanding(), 12);
    }

    #[test]
    fn test_fully_zoomed_out_clears() {
        let pool = LruBitmapPool::new(0);
        let mut grid = manager();
        grid.update(&quarter_snapshot(), IMAGE, 1, &pool);
        assert!(!grid.is_empty());

        let fit = StaticViewport::fit(IMAGE, Size::new(1000, 750));
        let update = grid.update(&ViewportSnapshot::capture(&fit, 2.0), IMAGE, 1, &pool);
        assert!(grid.is_empty());
        assert_eq!(update.cleaned, 16);
        assert_eq!(update.sample_size, 0);
    }

    #[test]
    fn test_empty_view_clears() {
        let pool = LruBitmapPool::new(0);
        let mut grid = manager();
        grid.update(&quarter_snapshot(), IMAGE, 1, &pool);
        let mut snap = quarter_snapshot();
        snap.view_size = Size::new(0, 0);
        grid.update(&snap, IMAGE, 1, &pool);
        assert!(grid.is_empty());
    }

    #[test]
    fn test_failed_tile_waits_for_geometry_change() {
        let pool = LruBitmapPool::new(0);
        let mut grid = manager();
        let snap = quarter_snapshot();
        let first = grid.update(&snap, IMAGE, 1, &pool);
        let failed = first.needs_decode[0];
        grid.mark_failed(failed);

        let again = grid.update(&snap, IMAGE, 1, &pool);
        assert!(!again.needs_decode.contains(&failed));

        // Grow the visible rect; the failed tile survives but is retried
        let mut moved = snap;
        moved.visible_rect = Rect::new(0, 0, 500, 376);
        let retried = grid.update(&moved, IMAGE, 1, &pool);
        if grid.tile(failed).is_some() {
            assert!(retried.needs_decode.contains(&failed));
        }
    }

    #[test]
    fn test_hit_testing() {
        let pool = LruBitmapPool::new(0);
        let mut grid = manager();
        grid.update(&quarter_snapshot(), IMAGE, 1, &pool);
        let t = grid.tile_at_drawable(130.0, 10.0).unwrap();
        assert_eq!(t.draw_rect.left, 125);
        let t = grid.tile_at_image(1999.0, 1499.0).unwrap();
        assert!(t.src_rect.contains_point(1999.0, 1499.0));
        assert!(grid.tile_at_drawable(600.0, 10.0).is_none());
    }

    #[test]
    fn test_install_on_vanished_tile_frees_bitmap() {
        let pool = LruBitmapPool::new(1024 * 1024);
        let mut grid = manager();
        let b = pool.alloc(8, 8, BitmapConfig::Rgba8888);
        assert!(!grid.install(999, b, Rect::new(0, 0, 8, 8), 1, &pool));
        assert_eq!(pool.outstanding(), 0);
    }

    fn raw_tile(id: TileId, r: Rect) -> Tile {
        Tile::new(id, r, r, 1, 1.0, 0)
    }

    #[test]
    fn test_oversized_block_base_is_clamped() {
        let pool = LruBitmapPool::new(0);
        let mut grid = TileGridManager::new(100_000, SampleSizePolicy::default(), EngineFlavor::Current);
        let snap = quarter_snapshot();
        grid.update(&snap, IMAGE, 1, &pool);

        // 17 x 17 cells of 30x23 over the 500x375 visible rect
        assert_eq!(grid.tiles().len(), 289);
        assert_eq!(union_area(grid.tiles()), snap.visible_rect.area());
    }

    #[test]
    fn test_legacy_sort_violation_is_captured() {
        // A tall tile overlapping two rows confuses the overlap comparator
        let mut tiles = vec![
            raw_tile(1, Rect::new(50, 0, 60, 100)),
            raw_tile(2, Rect::new(0, 0, 10, 10)),
            raw_tile(3, Rect::new(10, 80, 20, 90)),
        ];
        let violation = sort_tiles(&mut tiles, EngineFlavor::Legacy).unwrap();
        match violation {
            ContractError::SortViolation { tiles: summary, .. } => assert_eq!(summary.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
        let order: Vec<TileId> = tiles.iter().map(|t| t.id).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn test_legacy_sort_on_regular_grid_is_clean() {
        let pool = LruBitmapPool::new(0);
        let mut grid = TileGridManager::new(3, SampleSizePolicy::default(), EngineFlavor::Legacy);
        let update = grid.update(&quarter_snapshot(), IMAGE, 1, &pool);
        assert!(update.sort_violation.is_none());
    }
}
