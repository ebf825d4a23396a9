//! Error types for the region decoding engine.
//!
//! - `DecodeError` - failures from opening or driving a region decoder
//! - `InitError` - session-fatal failures reported to the owner
//! - `DecodeFailure` - routine per-tile outcomes, never surfaced to users
//! - `ContractError` - programming/configuration errors kept apart for triage

use std::fmt;

use thiserror::Error;

use crate::geometry::Rect;

/// Errors from a region decoder or its handle.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("region decode failed: {0}")]
    DecodeFailed(String),
    #[error("requested region is empty")]
    RegionEmpty,
    #[error("region decoder is not ready")]
    NotReady,
    #[error("reuse bitmap is incompatible with the requested region")]
    ReuseIncompatible,
    #[error("failed to orient decoded region")]
    RotateFailed,
}

impl From<image::ImageError> for DecodeError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => DecodeError::UnsupportedFormat(e.to_string()),
            image::ImageError::IoError(e) => DecodeError::Io(e),
            other => DecodeError::DecodeFailed(other.to_string()),
        }
    }
}

/// Session-fatal failure of the init task.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("decoder not ready: {0}")]
    DecoderNotReady(String),
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to read image source: {0}")]
    Io(#[source] std::io::Error),
}

impl From<DecodeError> for InitError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnsupportedFormat(msg) => InitError::UnsupportedFormat(msg),
            DecodeError::Io(e) => InitError::Io(e),
            other => InitError::DecoderNotReady(other.to_string()),
        }
    }
}

/// Classified outcome of a decode task that did not produce a usable bitmap.
///
/// All variants are non-fatal to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeFailure {
    BitmapNull,
    BitmapRecycledBeforeUse,
    KeyExpiredBeforeDecode,
    KeyExpiredAfterDecode,
    KeyExpiredAtCallback,
    DecodeParamsEmpty,
    DecoderNotReady,
    RotateFailed,
    /// The native decoder failed for this region.
    DecodeFailed,
}

impl DecodeFailure {
    /// Staleness is routine and only worth a trace line.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            Self::KeyExpiredBeforeDecode | Self::KeyExpiredAfterDecode | Self::KeyExpiredAtCallback
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BitmapNull => "bitmap-null",
            Self::BitmapRecycledBeforeUse => "bitmap-recycled-before-use",
            Self::KeyExpiredBeforeDecode => "key-expired-before-decode",
            Self::KeyExpiredAfterDecode => "key-expired-after-decode",
            Self::KeyExpiredAtCallback => "key-expired-at-callback",
            Self::DecodeParamsEmpty => "decode-params-empty",
            Self::DecoderNotReady => "decoder-not-ready",
            Self::RotateFailed => "rotate-failed",
            Self::DecodeFailed => "decode-failed",
        }
    }
}

impl From<&DecodeError> for DecodeFailure {
    fn from(err: &DecodeError) -> Self {
        match err {
            DecodeError::RegionEmpty => Self::DecodeParamsEmpty,
            DecodeError::NotReady => Self::DecoderNotReady,
            DecodeError::RotateFailed => Self::RotateFailed,
            _ => Self::DecodeFailed,
        }
    }
}

impl fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compact description of a tile attached to contract errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileSummary {
    pub id: u64,
    pub draw_rect: Rect,
    pub src_rect: Rect,
    pub sample_size: u32,
    pub has_bitmap: bool,
}

impl fmt::Display for TileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} draw={} src={} sample={}{}",
            self.id,
            self.draw_rect,
            self.src_rect,
            self.sample_size,
            if self.has_bitmap { " loaded" } else { "" }
        )
    }
}

/// Programming or configuration errors, reported separately from decode errors.
#[derive(Debug, Clone, Error)]
pub enum ContractError {
    #[error("viewport rotation of {degrees} degrees is not a multiple of 90")]
    InvalidRotation { degrees: i32 },
    #[error("tile ordering violated: {message} ({} tiles)", .tiles.len())]
    SortViolation {
        message: String,
        tiles: Vec<TileSummary>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_into_init_error() {
        let e: InitError = DecodeError::UnsupportedFormat("image/x-foo".into()).into();
        assert!(matches!(e, InitError::UnsupportedFormat(_)));

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: InitError = DecodeError::Io(io).into();
        assert!(matches!(e, InitError::Io(_)));

        let e: InitError = DecodeError::DecodeFailed("boom".into()).into();
        assert!(matches!(e, InitError::DecoderNotReady(_)));
    }

    #[test]
    fn test_stale_classification() {
        assert!(DecodeFailure::KeyExpiredAtCallback.is_stale());
        assert!(!DecodeFailure::DecodeFailed.is_stale());
        assert_eq!(DecodeFailure::RotateFailed.to_string(), "rotate-failed");
        assert_eq!(
            DecodeFailure::from(&DecodeError::RegionEmpty),
            DecodeFailure::DecodeParamsEmpty
        );
        assert_eq!(
            DecodeFailure::from(&DecodeError::ReuseIncompatible),
            DecodeFailure::DecodeFailed
        );
    }

    #[test]
    fn test_sort_violation_message_counts_tiles() {
        let err = ContractError::SortViolation {
            message: "comparator panicked".into(),
            tiles: vec![TileSummary {
                id: 1,
                draw_rect: Rect::new(0, 0, 10, 10),
                src_rect: Rect::new(0, 0, 40, 40),
                sample_size: 2,
                has_bitmap: false,
            }],
        };
        assert!(err.to_string().contains("1 tiles"));
    }
}
