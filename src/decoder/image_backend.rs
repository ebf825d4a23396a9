//! Region decoder backend built on the image crate.
//!
//! The image crate has no true region decoding, so the source is decoded once
//! into native-orientation RGBA when the handle opens. Regions are then served
//! by cropping and downsampling that buffer.
//!
//! Memory held per open handle is therefore `4 * width * height` bytes for the
//! lifetime of the handle, on top of the tile bitmaps. The factory refuses
//! sources whose header implies more than its decoded-bytes ceiling.

use std::io::Cursor;

use image::codecs::gif::GifDecoder;
use image::imageops::{self, FilterType};
use image::{AnimationDecoder, ImageFormat, RgbaImage};
use tracing::debug;

use super::{RegionDecoder, RegionDecoderFactory};
use crate::bitmap::Bitmap;
use crate::error::DecodeError;
use crate::geometry::Rect;
use crate::sampling::sampled_size;
use crate::source::ImageInfo;

/// Filter used when a region is downsampled.
const DOWNSAMPLE_FILTER: FilterType = FilterType::Triangle;

/// Default ceiling on the full RGBA buffer one handle may hold (1 GiB).
pub const DEFAULT_MAX_DECODED_BYTES: usize = 1024 * 1024 * 1024;

/// Opens [`ImageRegionDecoder`]s.
///
/// Each handle keeps the whole source decoded as RGBA, so an `N x M` image
/// costs `4 * N * M` bytes until the handle is recycled. Sources above
/// `max_decoded_bytes` fail to open instead of being decoded.
#[derive(Debug, Clone, Copy)]
pub struct ImageRegionDecoderFactory {
    max_decoded_bytes: usize,
}

impl Default for ImageRegionDecoderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageRegionDecoderFactory {
    pub fn new() -> Self {
        Self {
            max_decoded_bytes: DEFAULT_MAX_DECODED_BYTES,
        }
    }

    pub fn with_max_decoded_bytes(max_decoded_bytes: usize) -> Self {
        Self { max_decoded_bytes }
    }

    pub fn max_decoded_bytes(&self) -> usize {
        self.max_decoded_bytes
    }

    /// Decode the full image to RGBA. Animated GIFs yield their first frame.
    fn decode_full(bytes: &[u8], format: ImageFormat) -> Result<RgbaImage, DecodeError> {
        if format == ImageFormat::Gif {
            let decoder = GifDecoder::new(Cursor::new(bytes))?;
            let frame = decoder
                .into_frames()
                .next()
                .ok_or_else(|| DecodeError::DecodeFailed("GIF has no frames".into()))??;
            return Ok(frame.into_buffer());
        }
        Ok(image::load_from_memory_with_format(bytes, format)?.to_rgba8())
    }
}

impl RegionDecoderFactory for ImageRegionDecoderFactory {
    fn open(&self, bytes: Vec<u8>, info: &ImageInfo) -> Result<Box<dyn RegionDecoder>, DecodeError> {
        let format = ImageFormat::from_mime_type(&info.mime_type)
            .ok_or_else(|| DecodeError::UnsupportedFormat(info.mime_type.clone()))?;

        let decoded_bytes = (info.width as u64) * (info.height as u64) * 4;
        if decoded_bytes > self.max_decoded_bytes as u64 {
            return Err(DecodeError::DecodeFailed(format!(
                "{}x{} needs {decoded_bytes} bytes decoded, limit is {}",
                info.width, info.height, self.max_decoded_bytes
            )));
        }

        let image = Self::decode_full(&bytes, format)?;
        if image.dimensions() != (info.width, info.height) {
            return Err(DecodeError::DecodeFailed(format!(
                "decoded {}x{} but header says {}x{}",
                image.width(),
                image.height(),
                info.width,
                info.height
            )));
        }

        debug!(
            width = image.width(),
            height = image.height(),
            ?format,
            "Decoded source for region access"
        );
        Ok(Box::new(ImageRegionDecoder { image }))
    }
}

/// Serves regions out of a fully decoded native-orientation buffer.
pub struct ImageRegionDecoder {
    image: RgbaImage,
}

impl ImageRegionDecoder {
    pub fn from_image(image: RgbaImage) -> Self {
        Self { image }
    }
}

impl RegionDecoder for ImageRegionDecoder {
    fn decode_region(
        &mut self,
        native_rect: Rect,
        sample_size: u32,
        target: &mut Bitmap,
    ) -> Result<bool, DecodeError> {
        let bounds = Rect::new(0, 0, self.image.width() as i32, self.image.height() as i32);
        let Some(rect) = native_rect.intersect(&bounds) else {
            return Ok(false);
        };
        let out = sampled_size(rect.size(), sample_size);
        if target.is_recycled() || target.size() != out {
            return Err(DecodeError::ReuseIncompatible);
        }

        let region = imageops::crop_imm(
            &self.image,
            rect.left as u32,
            rect.top as u32,
            rect.width() as u32,
            rect.height() as u32,
        )
        .to_image();

        let region = if sample_size > 1 {
            imageops::resize(&region, out.width, out.height, DOWNSAMPLE_FILTER)
        } else {
            region
        };

        Ok(target.fill_from_rgba(&region))
    }
}
