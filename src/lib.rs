//! Tiled region decoding for very large images.
//!
//! The [`controller::ViewportController`] turns viewport changes into a grid
//! of tiles, decodes only the visible regions at a zoom-appropriate sample
//! size on a background worker, and discards results that belong to an older
//! generation of the view.

pub mod bitmap;
pub mod cli;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod generation;
pub mod geometry;
pub mod orientation;
pub mod render;
pub mod sampling;
pub mod scheduler;
pub mod source;
pub mod tiles;
pub mod viewport;

pub use bitmap::{Bitmap, BitmapConfig, BitmapPool, LruBitmapPool};
pub use config::{EngineFlavor, TileConfig, TileConfigBuilder};
pub use controller::{EngineStats, SessionListener, SessionState, ViewportController};
pub use decoder::{
    ImageRegionDecoderFactory, OpenOptions, RegionDecoder, RegionDecoderFactory,
    RegionDecoderHandle,
};
pub use error::{ContractError, DecodeError, DecodeFailure, InitError};
pub use geometry::{Matrix, Point, Rect, Size};
pub use orientation::{ExifOrientation, OrientationCorrector};
pub use render::{Canvas, RasterCanvas};
pub use sampling::{calculate_sample_size, SampleSizePolicy};
pub use source::{FileSource, ImageInfo, ImageSource, MemorySource};
pub use tiles::{Tile, TileId};
pub use viewport::{StaticViewport, Viewport, ViewportSnapshot};
