//! Region decoding: the native decoder seam and the handle that owns it.
//!
//! This module provides:
//! - `RegionDecoder` / `RegionDecoderFactory` - the pluggable native decoder
//! - `RegionDecoderHandle` - one open decoder for one image, with orientation
//!   mapping, bitmap reuse and idempotent recycling
//! - `ImageRegionDecoderFactory` - the bundled backend built on the image crate

pub mod image_backend;

pub use image_backend::ImageRegionDecoderFactory;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::bitmap::{Bitmap, BitmapConfig, BitmapPool};
use crate::error::DecodeError;
use crate::geometry::{Rect, Size};
use crate::orientation::{ExifOrientation, OrientationCorrector};
use crate::sampling::sampled_size;
use crate::source::{ImageInfo, ImageSource};
use crate::tiles::grid::panic_message;

/// A decoder able to produce pixels for an arbitrary sub-rectangle.
///
/// Implementations are driven from the decode worker only and need not be `Sync`.
pub trait RegionDecoder: Send {
    /// Decode `native_rect` downsampled by `sample_size` into `target`.
    ///
    /// `target` is already shaped to the sampled size of `native_rect`. Returns
    /// `Ok(false)` when the decoder produced no pixels, and
    /// `Err(DecodeError::ReuseIncompatible)` when `target` cannot be used.
    fn decode_region(
        &mut self,
        native_rect: Rect,
        sample_size: u32,
        target: &mut Bitmap,
    ) -> Result<bool, DecodeError>;
}

/// Opens region decoders from encoded bytes.
pub trait RegionDecoderFactory: Send + Sync {
    fn open(&self, bytes: Vec<u8>, info: &ImageInfo) -> Result<Box<dyn RegionDecoder>, DecodeError>;
}

/// Correction flags applied when opening a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    /// Honour the EXIF orientation of the source.
    pub correct_orientation: bool,
    pub bitmap_config: BitmapConfig,
    /// Try pooled bitmaps before allocating.
    pub reuse_bitmaps: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            correct_orientation: true,
            bitmap_config: BitmapConfig::default(),
            reuse_bitmaps: true,
        }
    }
}

/// One open region decoder for one source image.
///
/// `decode_region` must only be called from the decode worker. `recycle` and
/// `is_ready` may be called from any thread; an in-flight decode racing a
/// recycle fails with `NotReady` and returns its bitmap to the pool.
pub struct RegionDecoderHandle {
    source_uri: String,
    /// Upright size.
    image_size: Size,
    mime_type: String,
    orientation: Arc<dyn OrientationCorrector>,
    native: Mutex<Option<Box<dyn RegionDecoder>>>,
    ready: AtomicBool,
    pool: Arc<dyn BitmapPool>,
    options: OpenOptions,
}

impl RegionDecoderHandle {
    /// Read the source and open a native decoder for it.
    pub fn open(
        source: &dyn ImageSource,
        factory: &dyn RegionDecoderFactory,
        options: OpenOptions,
        pool: Arc<dyn BitmapPool>,
    ) -> Result<Self, DecodeError> {
        let info = source.info();
        if info.size().is_empty() {
            return Err(DecodeError::DecodeFailed(format!(
                "image has no pixels: {}",
                info.size()
            )));
        }

        let bytes = source.read_bytes()?;
        let native = factory.open(bytes, info)?;

        let orientation = if options.correct_orientation {
            info.orientation
        } else {
            ExifOrientation::Normal
        };
        let image_size = orientation.upright_size(info.size());

        debug!(
            uri = source.uri(),
            %image_size,
            mime = %info.mime_type,
            ?orientation,
            "Opened region decoder"
        );

        Ok(Self {
            source_uri: source.uri().to_string(),
            image_size,
            mime_type: info.mime_type.clone(),
            orientation: Arc::new(orientation),
            native: Mutex::new(Some(native)),
            ready: AtomicBool::new(true),
            pool,
            options,
        })
    }

    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    /// Upright image size.
    pub fn image_size(&self) -> Size {
        self.image_size
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn orientation(&self) -> &dyn OrientationCorrector {
        self.orientation.as_ref()
    }

    pub fn options(&self) -> OpenOptions {
        self.options
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Decode the upright `src_rect` at `sample_size`.
    ///
    /// Returns `Ok(None)` when the native decoder produced nothing. The bitmap
    /// comes from the shared pool and must be returned there.
    ///
    /// Tile decodes go through the scheduler's worker. Calling this directly
    /// from the owner thread is allowed for one-off decodes such as a preview;
    /// the native lock serializes it against the worker, so it blocks while a
    /// tile is decoding.
    pub fn decode_region(
        &self,
        src_rect: Rect,
        sample_size: u32,
    ) -> Result<Option<Bitmap>, DecodeError> {
        if src_rect.is_empty() || sample_size == 0 {
            return Err(DecodeError::RegionEmpty);
        }
        if !self.is_ready() {
            return Err(DecodeError::NotReady);
        }
        let clipped = src_rect
            .intersect(&self.image_size.to_rect())
            .ok_or(DecodeError::RegionEmpty)?;
        let native_rect = self.orientation.forward_rect(
            clipped,
            self.image_size.width,
            self.image_size.height,
        );
        let out = sampled_size(native_rect.size(), sample_size);
        let config = self.options.bitmap_config;

        let mut guard = self.native.lock();
        let Some(decoder) = guard.as_mut() else {
            return Err(DecodeError::NotReady);
        };

        let reused = self
            .options
            .reuse_bitmaps
            .then(|| self.pool.try_reuse(out.width, out.height, config))
            .flatten();
        let was_reused = reused.is_some();
        let mut bitmap = reused.unwrap_or_else(|| self.pool.alloc(out.width, out.height, config));

        let mut result = decode_native(&mut **decoder, native_rect, sample_size, &mut bitmap);
        if was_reused && matches!(result, Err(DecodeError::ReuseIncompatible)) {
            trace!(%native_rect, sample_size, "Reuse bitmap rejected, retrying with a fresh one");
            self.pool.free(bitmap);
            bitmap = self.pool.alloc(out.width, out.height, config);
            result = decode_native(&mut **decoder, native_rect, sample_size, &mut bitmap);
        }
        drop(guard);

        if !self.is_ready() {
            self.pool.free(bitmap);
            self.close_native();
            return Err(DecodeError::NotReady);
        }

        match result {
            Ok(true) => {}
            Ok(false) => {
                self.pool.free(bitmap);
                return Ok(None);
            }
            Err(e) => {
                self.pool.free(bitmap);
                return Err(e);
            }
        }

        match self.orientation.rotate_bitmap(bitmap, self.pool.as_ref()) {
            Ok(upright) => Ok(Some(upright)),
            Err(bitmap) => {
                self.pool.free(bitmap);
                Err(DecodeError::RotateFailed)
            }
        }
    }

    /// Close the native decoder. Idempotent and callable from any thread.
    pub fn recycle(&self) {
        if self.ready.swap(false, Ordering::AcqRel) {
            debug!(uri = %self.source_uri, "Recycling region decoder");
        }
        self.close_native();
    }

    /// Drop the native state unless a decode currently holds it; that decode
    /// will see `ready == false` and close it on its way out.
    fn close_native(&self) {
        if let Some(mut native) = self.native.try_lock() {
            native.take();
        }
    }
}

/// Run the native decoder, turning a panic into `DecodeFailed` so the caller
/// still owns `target` and can return it to the pool.
fn decode_native(
    decoder: &mut dyn RegionDecoder,
    native_rect: Rect,
    sample_size: u32,
    target: &mut Bitmap,
) -> Result<bool, DecodeError> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        decoder.decode_region(native_rect, sample_size, target)
    }))
    .unwrap_or_else(|payload| {
        let message = panic_message(&*payload);
        warn!(%native_rect, sample_size, %message, "Native region decoder panicked");
        Err(DecodeError::DecodeFailed(format!("native decoder panicked: {message}")))
    })
}

impl fmt::Debug for RegionDecoderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionDecoderHandle")
            .field("source_uri", &self.source_uri)
            .field("image_size", &self.image_size)
            .field("mime_type", &self.mime_type)
            .field("orientation", &self.orientation)
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable decoders for unit tests.

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::source::MemorySource;

    /// Fills each region with a colour derived from its position.
    pub struct SolidDecoder {
        pub delay: Duration,
        pub calls: Arc<AtomicUsize>,
        pub fail: bool,
        /// Reject the first bitmap it sees, as an incompatible reuse target would be.
        pub reject_first: bool,
        pub panic_first: bool,
    }

    impl RegionDecoder for SolidDecoder {
        fn decode_region(
            &mut self,
            native_rect: Rect,
            _sample_size: u32,
            target: &mut Bitmap,
        ) -> Result<bool, DecodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if self.fail {
                return Err(DecodeError::DecodeFailed("scripted failure".into()));
            }
            if self.reject_first {
                self.reject_first = false;
                return Err(DecodeError::ReuseIncompatible);
            }
            if self.panic_first {
                self.panic_first = false;
                panic!("scripted decoder panic");
            }
            let shade = (native_rect.left.wrapping_add(native_rect.top) & 0xff) as u8;
            target.pixels_mut().fill(shade);
            Ok(true)
        }
    }

    pub struct SolidFactory {
        pub delay: Duration,
        pub calls: Arc<AtomicUsize>,
        pub opens: Arc<AtomicUsize>,
        pub fail_decode: bool,
        pub fail_open: bool,
        pub reject_first: bool,
        pub panic_first: bool,
    }

    impl SolidFactory {
        pub fn new() -> Self {
            Self {
                delay: Duration::ZERO,
                calls: Arc::new(AtomicUsize::new(0)),
                opens: Arc::new(AtomicUsize::new(0)),
                fail_decode: false,
                fail_open: false,
                reject_first: false,
                panic_first: false,
            }
        }
    }

    impl RegionDecoderFactory for SolidFactory {
        fn open(
            &self,
            _bytes: Vec<u8>,
            info: &ImageInfo,
        ) -> Result<Box<dyn RegionDecoder>, DecodeError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(DecodeError::UnsupportedFormat(info.mime_type.clone()));
            }
            Ok(Box::new(SolidDecoder {
                delay: self.delay,
                calls: Arc::clone(&self.calls),
                fail: self.fail_decode,
                reject_first: self.reject_first,
                panic_first: self.panic_first,
            }))
        }
    }

    /// A source that claims the given size without carrying real pixels.
    pub fn fake_source(uri: &str, width: u32, height: u32) -> MemorySource {
        MemorySource::with_info(
            uri,
            Vec::new(),
            ImageInfo {
                width,
                height,
                mime_type: "image/x-test".into(),
                orientation: ExifOrientation::Normal,
            },
        )
    }
}
