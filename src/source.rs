use std::fmt::Debug;
use std::io::{BufRead, Cursor, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{ImageDecoder, ImageReader};
use tracing::debug;

use crate::error::DecodeError;
use crate::geometry::Size;
use crate::orientation::ExifOrientation;

/// Header information about an encoded image, known before any pixels are decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Width as stored, before orientation correction.
    pub width: u32,
    /// Height as stored, before orientation correction.
    pub height: u32,
    pub mime_type: String,
    pub orientation: ExifOrientation,
}

impl ImageInfo {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Size as displayed once the EXIF orientation is applied.
    pub fn upright_size(&self) -> Size {
        if self.orientation.swaps_dimensions() {
            self.size().transposed()
        } else {
            self.size()
        }
    }
}

/// Provider of encoded image bytes plus their already-known header info.
pub trait ImageSource: Send + Sync + Debug {
    fn uri(&self) -> &str;

    fn info(&self) -> &ImageInfo;

    fn read_bytes(&self) -> std::io::Result<Vec<u8>>;
}

/// Read header info from an image reader without decoding pixels.
fn probe_reader<R: BufRead + Seek>(reader: ImageReader<R>) -> Result<ImageInfo, DecodeError> {
    let reader = reader.with_guessed_format()?;
    let format = reader
        .format()
        .ok_or_else(|| DecodeError::UnsupportedFormat("unrecognized image header".into()))?;
    let mut decoder = reader.into_decoder()?;
    let (width, height) = decoder.dimensions();
    let orientation = decoder
        .orientation()
        .map(ExifOrientation::from)
        .unwrap_or_default();

    Ok(ImageInfo {
        width,
        height,
        mime_type: format.to_mime_type().to_string(),
        orientation,
    })
}

/// An image file on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    uri: String,
    info: ImageInfo,
}

impl FileSource {
    /// Open `path` and read its header.
    pub fn probe(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let path = path.as_ref().to_path_buf();
        let info = probe_reader(ImageReader::open(&path)?)?;
        debug!(?path, width = info.width, height = info.height, mime = %info.mime_type, "Probed image file");
        Ok(Self {
            uri: format!("file://{}", path.display()),
            path,
            info,
        })
    }

    /// Use header info the caller already knows instead of probing.
    pub fn with_info(path: impl AsRef<Path>, info: ImageInfo) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            uri: format!("file://{}", path.display()),
            path,
            info,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageSource for FileSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn info(&self) -> &ImageInfo {
        &self.info
    }

    fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }
}

/// Encoded image bytes held in memory.
#[derive(Clone)]
pub struct MemorySource {
    uri: String,
    bytes: Arc<[u8]>,
    info: ImageInfo,
}

impl MemorySource {
    pub fn probe(uri: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Result<Self, DecodeError> {
        let bytes = bytes.into();
        let info = probe_reader(ImageReader::new(Cursor::new(&bytes[..])))?;
        Ok(Self {
            uri: uri.into(),
            bytes,
            info,
        })
    }

    pub fn with_info(uri: impl Into<String>, bytes: impl Into<Arc<[u8]>>, info: ImageInfo) -> Self {
        Self {
            uri: uri.into(),
            bytes: bytes.into(),
            info,
        }
    }
}

impl Debug for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySource")
            .field("uri", &self.uri)
            .field("len", &self.bytes.len())
            .field("info", &self.info)
            .finish()
    }
}

impl ImageSource for MemorySource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn info(&self) -> &ImageInfo {
        &self.info
    }

    fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        Ok(self.bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbaImage};
    use tempfile::tempdir;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::new(width, height);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_probe_file_reads_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wide.png");
        RgbaImage::new(64, 16).save(&path).unwrap();

        let source = FileSource::probe(&path).unwrap();
        assert_eq!(source.info().size(), Size::new(64, 16));
        assert_eq!(source.info().mime_type, "image/png");
        assert_eq!(source.info().orientation, ExifOrientation::Normal);
        assert!(source.uri().ends_with("wide.png"));
        assert!(!source.read_bytes().unwrap().is_empty());
    }

    #[test]
    fn test_probe_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = FileSource::probe(dir.path().join("nope.png")).unwrap_err();
        assert!(matches!(err, DecodeError::Io(_)));
    }

    #[test]
    fn test_probe_memory_rejects_garbage() {
        let err = MemorySource::probe("mem://junk", vec![0u8; 32]).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_probe_memory() {
        let source = MemorySource::probe("mem://tall", png_bytes(8, 20)).unwrap();
        assert_eq!(source.info().size(), Size::new(8, 20));
        assert_eq!(source.read_bytes().unwrap(), png_bytes(8, 20));
    }

    #[test]
    fn test_upright_size_swaps_for_quarter_turns() {
        let info = ImageInfo {
            width: 400,
            height: 300,
            mime_type: "image/jpeg".into(),
            orientation: ExifOrientation::Rotate90,
        };
        assert_eq!(info.upright_size(), Size::new(300, 400));
    }
}
