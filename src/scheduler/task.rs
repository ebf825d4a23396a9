use std::fmt;
use std::sync::Arc;

use crate::bitmap::Bitmap;
use crate::decoder::{OpenOptions, RegionDecoderHandle};
use crate::error::{DecodeFailure, InitError};
use crate::geometry::Rect;
use crate::source::ImageSource;
use crate::tiles::{TaskKey, TileId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Init,
    Decode,
}

/// The unit passed across the worker boundary in both directions.
#[derive(Debug)]
pub struct TaskEnvelope<P> {
    pub kind: TaskKind,
    /// Generation current when the task was submitted.
    pub generation: u64,
    pub key: TaskKey,
    pub payload: P,
}

/// Work submitted to the decode worker.
pub enum Request {
    Init {
        source: Arc<dyn ImageSource>,
        options: OpenOptions,
        /// Only the most recent init is executed.
        init_seq: u64,
    },
    Decode {
        tile_id: TileId,
        /// Upright image space.
        src_rect: Rect,
        sample_size: u32,
        handle: Arc<RegionDecoderHandle>,
    },
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Init {
                source, init_seq, ..
            } => f
                .debug_struct("Init")
                .field("uri", &source.uri())
                .field("init_seq", init_seq)
                .finish(),
            Request::Decode {
                tile_id,
                src_rect,
                sample_size,
                ..
            } => f
                .debug_struct("Decode")
                .field("tile_id", tile_id)
                .field("src_rect", src_rect)
                .field("sample_size", sample_size)
                .finish(),
        }
    }
}

/// A decoded tile bitmap on its way to the controller.
#[derive(Debug)]
pub struct DecodedTile {
    pub bitmap: Bitmap,
    /// Part of `bitmap` covering the tile's source rect.
    pub bitmap_src_rect: Rect,
}

/// Outcome reported back by the decode worker.
#[derive(Debug)]
pub enum Response {
    Init(Result<Arc<RegionDecoderHandle>, InitError>),
    Decode {
        tile_id: TileId,
        result: Result<DecodedTile, DecodeFailure>,
    },
}

pub type RequestEnvelope = TaskEnvelope<Request>;
pub type ResponseEnvelope = TaskEnvelope<Response>;
