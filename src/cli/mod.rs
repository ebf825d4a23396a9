//! Command-line front end: render one zoomed view of an image through the
//! tiled engine and write it out as a PNG.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::config::{EngineFlavor, TileConfig, MAX_BLOCK_BASE_NUMBER};
use crate::controller::{SessionState, ViewportController};
use crate::geometry::{Point, Size};
use crate::render::{Canvas, RasterCanvas};
use crate::sampling::calculate_sample_size;
use crate::source::FileSource;
use crate::viewport::{StaticViewport, Viewport};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const BACKGROUND: [u8; 4] = [24, 24, 24, 255];

pub const USAGE: &str = "usage: regionview --image <path> [--view WxH] [--zoom F] \
[--focus FX,FY] [--block-base N] [--out file.png] [--timeout-ms N] \
[--debug-overlay] [--legacy]";

#[derive(Debug, Clone, PartialEq)]
pub struct RenderArgs {
    pub image: PathBuf,
    pub view: Size,
    pub zoom: f32,
    /// Zoom focus as a fraction of the image, `0.5,0.5` is the centre.
    pub focus: Point,
    pub block_base: Option<u32>,
    pub out: PathBuf,
    pub timeout_ms: u64,
    pub debug_overlay: bool,
    pub legacy: bool,
}

impl RenderArgs {
    /// Layer the command-line choices over `base`.
    pub fn tile_config(&self, mut base: TileConfig) -> TileConfig {
        if let Some(n) = self.block_base {
            base.block_base_number = n.clamp(1, MAX_BLOCK_BASE_NUMBER);
        }
        if self.debug_overlay {
            base.debug_overlay = true;
        }
        if self.legacy {
            base.flavor = EngineFlavor::Legacy;
        }
        base
    }
}

/// Parse arguments (without the program name). `Ok(None)` means help was requested.
pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Option<RenderArgs>> {
    let mut image: Option<PathBuf> = None;
    let mut view = Size::new(1280, 720);
    let mut zoom: f32 = 2.0;
    let mut focus = Point::new(0.5, 0.5);
    let mut block_base: Option<u32> = None;
    let mut out = PathBuf::from("regionview.png");
    let mut timeout_ms: u64 = 10_000;
    let mut debug_overlay = false;
    let mut legacy = false;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "--image" => {
                let value = args.next().context("Missing value for --image")?;
                image = Some(PathBuf::from(value));
            }
            "--view" => {
                let value = args.next().context("Missing value for --view")?;
                view = parse_view(&value)?;
            }
            "--zoom" => {
                let value = args.next().context("Missing value for --zoom")?;
                zoom = value
                    .parse::<f32>()
                    .context("Failed to parse --zoom as a number")?;
            }
            "--focus" => {
                let value = args.next().context("Missing value for --focus")?;
                focus = parse_focus(&value)?;
            }
            "--block-base" => {
                let value = args.next().context("Missing value for --block-base")?;
                block_base = Some(
                    value
                        .parse::<u32>()
                        .context("Failed to parse --block-base as a positive integer")?,
                );
            }
            "--out" => {
                let value = args.next().context("Missing value for --out")?;
                out = PathBuf::from(value);
            }
            "--timeout-ms" => {
                let value = args.next().context("Missing value for --timeout-ms")?;
                timeout_ms = value
                    .parse::<u64>()
                    .context("Failed to parse --timeout-ms as a non-negative integer")?;
            }
            "--debug-overlay" => debug_overlay = true,
            "--legacy" => legacy = true,
            other => {
                if image.is_none() && !other.starts_with('-') {
                    image = Some(PathBuf::from(other));
                } else {
                    bail!("Unknown argument: {other}");
                }
            }
        }
    }

    if !zoom.is_finite() || zoom < 1.0 {
        bail!("--zoom must be at least 1.0");
    }
    if block_base == Some(0) {
        bail!("--block-base must be greater than 0");
    }

    let image = image.context("An image is required: --image <path> (or positional path)")?;
    Ok(Some(RenderArgs {
        image,
        view,
        zoom,
        focus,
        block_base,
        out,
        timeout_ms,
        debug_overlay,
        legacy,
    }))
}

fn parse_view(value: &str) -> Result<Size> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .context("--view must look like WIDTHxHEIGHT")?;
    let width = w.trim().parse::<u32>().context("Failed to parse --view width")?;
    let height = h.trim().parse::<u32>().context("Failed to parse --view height")?;
    if width == 0 || height == 0 {
        bail!("--view dimensions must be greater than 0");
    }
    Ok(Size::new(width, height))
}

fn parse_focus(value: &str) -> Result<Point> {
    let (x, y) = value
        .split_once(',')
        .context("--focus must look like FX,FY")?;
    let x = x.trim().parse::<f32>().context("Failed to parse --focus x")?;
    let y = y.trim().parse::<f32>().context("Failed to parse --focus y")?;
    if !(0.0..=1.0).contains(&x) || !(0.0..=1.0).contains(&y) {
        bail!("--focus fractions must be within 0..1");
    }
    Ok(Point::new(x, y))
}

/// What one render produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSummary {
    pub image_size: Size,
    pub preview_sample_size: u32,
    pub tile_sample_size: Option<u32>,
    pub tiles: usize,
    pub tiles_loaded: usize,
    pub tiles_failed: usize,
    pub timed_out: bool,
    pub elapsed_ms: u128,
    pub out: PathBuf,
}

pub fn run(args: &RenderArgs) -> Result<RenderSummary> {
    let started = Instant::now();
    let deadline = started + Duration::from_millis(args.timeout_ms);

    let source = FileSource::probe(&args.image)
        .with_context(|| format!("Failed to read image header: {}", args.image.display()))?;
    let config = args.tile_config(TileConfig::from_env());
    let mut controller = ViewportController::with_image_backend(config);

    controller.reset(Arc::new(source));
    while controller.state() == SessionState::Initializing {
        if Instant::now() >= deadline {
            bail!("Timed out opening {}", args.image.display());
        }
        controller.pump(POLL_INTERVAL);
    }
    if let Some(e) = controller.last_init_error() {
        bail!("Failed to open {}: {e}", args.image.display());
    }
    let handle = controller
        .region_decoder()
        .context("Region decoder missing after init")?;
    let image_size = handle.image_size();

    // Whole-image preview, drawn under the tiles. Decoded here on the owner
    // thread before any tile is requested, so it never waits on the worker.
    let base = StaticViewport::fit(image_size, args.view);
    let preview_sample_size =
        calculate_sample_size(image_size, base.drawable_size, controller.config().sample_policy());
    let preview = handle
        .decode_region(image_size.to_rect(), preview_sample_size)
        .context("Failed to decode preview")?
        .context("Preview decode produced no pixels")?;

    let viewport = base.zoomed(args.zoom, args.focus);
    controller.on_viewport_changed(&viewport);
    while !controller.is_settled() && Instant::now() < deadline {
        controller.pump(POLL_INTERVAL);
    }
    let timed_out = !controller.is_settled();
    if timed_out {
        warn!(
            in_flight = controller.in_flight(),
            timeout_ms = args.timeout_ms,
            "Timed out waiting for tiles"
        );
    }

    let mut canvas = RasterCanvas::with_background(args.view.width, args.view.height, BACKGROUND);
    canvas.draw_bitmap(
        &preview,
        preview.size().to_rect(),
        base.drawable_size.to_rect(),
        &viewport.draw_matrix(),
    );
    controller.pool().free(preview);
    controller.on_draw(&mut canvas);

    let tiles = controller.tiles();
    let summary = RenderSummary {
        image_size,
        preview_sample_size,
        tile_sample_size: tiles.first().map(|t| t.sample_size),
        tiles: tiles.len(),
        tiles_loaded: tiles.iter().filter(|t| !t.is_empty()).count(),
        tiles_failed: tiles.iter().filter(|t| t.failed).count(),
        timed_out,
        elapsed_ms: started.elapsed().as_millis(),
        out: args.out.clone(),
    };

    canvas
        .into_image()
        .save(&args.out)
        .with_context(|| format!("Failed to write {}", args.out.display()))?;

    let stats = controller.stats();
    info!(
        image = %args.image.display(),
        %image_size,
        preview_sample_size = summary.preview_sample_size,
        tiles = summary.tiles,
        loaded = summary.tiles_loaded,
        failed = summary.tiles_failed,
        stale_dropped = stats.stale_dropped,
        elapsed_ms = summary.elapsed_ms as u64,
        out = %args.out.display(),
        "Rendered view"
    );

    controller.recycle();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn args(list: &[&str]) -> Result<Option<RenderArgs>> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_defaults() {
        let parsed = args(&["--image", "big.jpg"]).unwrap().unwrap();
        assert_eq!(parsed.image, PathBuf::from("big.jpg"));
        assert_eq!(parsed.view, Size::new(1280, 720));
        assert_eq!(parsed.zoom, 2.0);
        assert_eq!(parsed.focus, Point::new(0.5, 0.5));
        assert!(!parsed.legacy);
    }

    #[test]
    fn test_parse_all_flags() {
        let parsed = args(&[
            "photo.png",
            "--view",
            "800x600",
            "--zoom",
            "3.5",
            "--focus",
            "0.25,0.75",
            "--block-base",
            "2",
            "--out",
            "out.png",
            "--timeout-ms",
            "500",
            "--debug-overlay",
            "--legacy",
        ])
        .unwrap()
        .unwrap();
        assert_eq!(parsed.image, PathBuf::from("photo.png"));
        assert_eq!(parsed.view, Size::new(800, 600));
        assert_eq!(parsed.zoom, 3.5);
        assert_eq!(parsed.focus, Point::new(0.25, 0.75));
        assert_eq!(parsed.timeout_ms, 500);

        let config = parsed.tile_config(TileConfig::default());
        assert_eq!(config.block_base_number, 2);
        assert_eq!(config.flavor, EngineFlavor::Legacy);
        assert!(config.debug_overlay);
    }

    #[test]
    fn test_block_base_is_clamped() {
        let parsed = args(&["a.png", "--block-base", "100000"]).unwrap().unwrap();
        let config = parsed.tile_config(TileConfig::default());
        assert_eq!(config.block_base_number, MAX_BLOCK_BASE_NUMBER);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(args(&[]).is_err());
        assert!(args(&["--image"]).is_err());
        assert!(args(&["a.png", "--view", "800"]).is_err());
        assert!(args(&["a.png", "--view", "0x10"]).is_err());
        assert!(args(&["a.png", "--zoom", "0.5"]).is_err());
        assert!(args(&["a.png", "--focus", "2,0"]).is_err());
        assert!(args(&["a.png", "--block-base", "0"]).is_err());
        assert!(args(&["a.png", "--bogus"]).is_err());
        assert!(args(&["--help"]).unwrap().is_none());
    }

    #[test]
    fn test_run_renders_zoomed_view() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("gradient.png");
        let img = RgbImage::from_fn(400, 300, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        img.save(&input).unwrap();
        let out = dir.path().join("view.png");

        let parsed = args(&[
            "--image",
            input.to_str().unwrap(),
            "--view",
            "200x150",
            "--zoom",
            "2",
            "--focus",
            "0.25,0.25",
            "--out",
            out.to_str().unwrap(),
        ])
        .unwrap()
        .unwrap();
        let summary = run(&parsed).unwrap();

        assert_eq!(summary.image_size, Size::new(400, 300));
        assert_eq!(summary.preview_sample_size, 2);
        assert_eq!(summary.tiles, 16);
        assert_eq!(summary.tiles_loaded, 16);
        assert_eq!(summary.tile_sample_size, Some(1));
        assert!(!summary.timed_out);

        let written = image::open(&out).unwrap();
        assert_eq!((written.width(), written.height()), (200, 150));
    }

    #[test]
    fn test_run_reports_missing_file() {
        let dir = TempDir::new().unwrap();
        let parsed = args(&["--image", dir.path().join("nope.png").to_str().unwrap()])
            .unwrap()
            .unwrap();
        assert!(run(&parsed).is_err());
    }
}
