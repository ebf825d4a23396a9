//! Engine configuration.
//!
//! `TileConfig::default()` is what most hosts want. `TileConfigBuilder` tweaks
//! individual knobs, and `TileConfig::from_env()` layers `REGIONVIEW_*`
//! environment overrides on top of the defaults.

use std::time::Duration;

use tracing::warn;

use crate::bitmap::pool::{DEFAULT_MAX_MEMORY_MB, MAX_MEMORY_MB};
use crate::bitmap::BitmapConfig;
use crate::decoder::OpenOptions;
use crate::sampling::SampleSizePolicy;

/// Default grid density: `(n+1) x (n+1)` tiles across the visible rect.
pub const DEFAULT_BLOCK_BASE_NUMBER: u32 = 3;

/// Idle time after which the decode worker exits.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Grid density is clamped to this to keep tile counts sane.
pub const MAX_BLOCK_BASE_NUMBER: u32 = 16;

/// Which of the two historical engine behaviours to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineFlavor {
    #[default]
    Current,
    /// Overlap-based tile ordering, and no staleness check before decoding.
    Legacy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TileConfig {
    pub block_base_number: u32,
    pub idle_timeout: Duration,
    pub bitmap_config: BitmapConfig,
    pub smaller_size_mode: bool,
    /// Largest sampled dimension a tile bitmap may have.
    pub max_bitmap_dimension: Option<u32>,
    pub pool_max_bytes: usize,
    pub reuse_bitmaps: bool,
    pub correct_orientation: bool,
    /// Regrid during zoom gestures instead of waiting for them to settle.
    pub update_while_zooming: bool,
    pub flavor: EngineFlavor,
    pub debug_overlay: bool,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            block_base_number: DEFAULT_BLOCK_BASE_NUMBER,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            bitmap_config: BitmapConfig::default(),
            smaller_size_mode: false,
            max_bitmap_dimension: None,
            pool_max_bytes: DEFAULT_MAX_MEMORY_MB * 1024 * 1024,
            reuse_bitmaps: true,
            correct_orientation: true,
            update_while_zooming: false,
            flavor: EngineFlavor::Current,
            debug_overlay: false,
        }
    }
}

impl TileConfig {
    pub fn builder() -> TileConfigBuilder {
        TileConfigBuilder::new()
    }

    /// Defaults with `REGIONVIEW_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Unparseable values are logged and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = parse_var::<u32>(&lookup, "REGIONVIEW_BLOCK_BASE") {
            self.block_base_number = n.clamp(1, MAX_BLOCK_BASE_NUMBER);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "REGIONVIEW_IDLE_MS") {
            self.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(mb) = parse_var::<usize>(&lookup, "REGIONVIEW_POOL_MB") {
            self.pool_max_bytes = pool_bytes(mb);
        }
        if let Some(legacy) = parse_flag(&lookup, "REGIONVIEW_LEGACY") {
            self.flavor = if legacy {
                EngineFlavor::Legacy
            } else {
                EngineFlavor::Current
            };
        }
        if let Some(overlay) = parse_flag(&lookup, "REGIONVIEW_DEBUG_OVERLAY") {
            self.debug_overlay = overlay;
        }
        self
    }

    pub fn sample_policy(&self) -> SampleSizePolicy {
        SampleSizePolicy {
            smaller_size_mode: self.smaller_size_mode,
            max_dimension: self.max_bitmap_dimension,
        }
    }

    pub fn open_options(&self) -> OpenOptions {
        OpenOptions {
            correct_orientation: self.correct_orientation,
            bitmap_config: self.bitmap_config,
            reuse_bitmaps: self.reuse_bitmaps,
        }
    }
}

/// Pool budget in bytes, capped like [`crate::bitmap::LruBitmapPool::with_memory_mb`].
fn pool_bytes(mb: usize) -> usize {
    mb.min(MAX_MEMORY_MB) * 1024 * 1024
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable config override");
            None
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key, value = %raw, "Ignoring unparseable config flag");
            None
        }
    }
}

/// Builder for [`TileConfig`].
#[derive(Debug, Clone, Default)]
pub struct TileConfigBuilder {
    config: TileConfig,
}

impl TileConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_base_number(mut self, n: u32) -> Self {
        self.config.block_base_number = n.clamp(1, MAX_BLOCK_BASE_NUMBER);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn bitmap_config(mut self, config: BitmapConfig) -> Self {
        self.config.bitmap_config = config;
        self
    }

    pub fn smaller_size_mode(mut self, enabled: bool) -> Self {
        self.config.smaller_size_mode = enabled;
        self
    }

    pub fn max_bitmap_dimension(mut self, max: Option<u32>) -> Self {
        self.config.max_bitmap_dimension = max;
        self
    }

    pub fn pool_max_mb(mut self, mb: usize) -> Self {
        self.config.pool_max_bytes = pool_bytes(mb);
        self
    }

    pub fn reuse_bitmaps(mut self, enabled: bool) -> Self {
        self.config.reuse_bitmaps = enabled;
        self
    }

    pub fn correct_orientation(mut self, enabled: bool) -> Self {
        self.config.correct_orientation = enabled;
        self
    }

    pub fn update_while_zooming(mut self, enabled: bool) -> Self {
        self.config.update_while_zooming = enabled;
        self
    }

    pub fn flavor(mut self, flavor: EngineFlavor) -> Self {
        self.config.flavor = flavor;
        self
    }

    pub fn debug_overlay(mut self, enabled: bool) -> Self {
        self.config.debug_overlay = enabled;
        self
    }

    pub fn build(self) -> TileConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TileConfig::default();
        assert_eq!(config.block_base_number, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.flavor, EngineFlavor::Current);
        assert!(config.open_options().correct_orientation);
    }

    #[test]
    fn test_env_overrides() {
        let config = TileConfig::default().with_overrides(lookup(&[
            ("REGIONVIEW_BLOCK_BASE", "5"),
            ("REGIONVIEW_IDLE_MS", "250"),
            ("REGIONVIEW_POOL_MB", "8"),
            ("REGIONVIEW_LEGACY", "yes"),
            ("REGIONVIEW_DEBUG_OVERLAY", "1"),
        ]));
        assert_eq!(config.block_base_number, 5);
        assert_eq!(config.idle_timeout, Duration::from_millis(250));
        assert_eq!(config.pool_max_bytes, 8 * 1024 * 1024);
        assert_eq!(config.flavor, EngineFlavor::Legacy);
        assert!(config.debug_overlay);
    }

    #[test]
    fn test_bad_overrides_fall_back() {
        let config = TileConfig::default().with_overrides(lookup(&[
            ("REGIONVIEW_BLOCK_BASE", "lots"),
            ("REGIONVIEW_LEGACY", "maybe"),
            ("REGIONVIEW_IDLE_MS", "-5"),
        ]));
        assert_eq!(config, TileConfig::default());
    }

    #[test]
    fn test_huge_pool_size_is_capped() {
        let huge = usize::MAX.to_string();
        let config = TileConfig::default().with_overrides(lookup(&[("REGIONVIEW_POOL_MB", huge.as_str())]));
        assert_eq!(config.pool_max_bytes, 1024 * 1024 * 1024);

        let built = TileConfig::builder().pool_max_mb(usize::MAX).build();
        assert_eq!(built.pool_max_bytes, 1024 * 1024 * 1024);
    }

    #[test]
    fn test_builder_clamps_block_base() {
        let config = TileConfig::builder()
            .block_base_number(0)
            .smaller_size_mode(true)
            .max_bitmap_dimension(Some(2048))
            .build();
        assert_eq!(config.block_base_number, 1);
        assert_eq!(
            config.sample_policy(),
            SampleSizePolicy {
                smaller_size_mode: true,
                max_dimension: Some(2048),
            }
        );
    }
}
