//! Tiles and the grid that produces them.
//!
//! This module provides:
//! - `Tile` - one positioned image region and its decoded bitmap
//! - `TaskKey` - digest identifying one decode request
//! - `TileGridManager` - maps viewport state to a tile set and diffs it

pub mod grid;
pub mod tile;

pub use grid::{GridUpdate, TileGridManager};
pub use tile::{TaskKey, Tile, TileId};
