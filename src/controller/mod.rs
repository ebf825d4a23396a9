//! Viewport controller: the top-level orchestrator of one decoding session.
//!
//! All session state (tile list, decoder handle, generation) is mutated here,
//! on the thread that owns the controller. The decode worker only ever sees
//! immutable snapshots and reports back through the scheduler's result
//! channel, which the owner drains with [`ViewportController::drain_results`]
//! or [`ViewportController::pump`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::bitmap::{BitmapPool, LruBitmapPool};
use crate::config::TileConfig;
use crate::decoder::{ImageRegionDecoderFactory, RegionDecoderFactory, RegionDecoderHandle};
use crate::error::{ContractError, DecodeFailure, InitError};
use crate::generation::GenerationToken;
use crate::geometry::{Point, Size};
use crate::render::Canvas;
use crate::scheduler::{DecodeScheduler, Response, ResponseEnvelope};
use crate::source::ImageSource;
use crate::tiles::{TaskKey, Tile, TileGridManager, TileId};
use crate::viewport::{Viewport, ViewportSnapshot};

/// Debug overlay colour for tiles still waiting for pixels.
const PENDING_OVERLAY: [u8; 4] = [255, 0, 0, 64];
/// Debug overlay colour for decoded tiles.
const LOADED_OVERLAY: [u8; 4] = [0, 255, 0, 64];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    Ready,
    Paused,
}

/// Session events, delivered on the controller's thread.
pub trait SessionListener {
    /// The decoder is open; `image_size` is upright.
    fn on_ready(&mut self, _image_size: Size) {}

    fn on_init_failed(&mut self, _error: &InitError) {}

    fn on_contract_error(&mut self, _error: &ContractError) {}

    /// The tile set or a tile's pixels changed; redraw.
    fn invalidate(&mut self) {}
}

/// Counters for one controller's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub decodes_submitted: u64,
    pub decodes_applied: u64,
    pub stale_dropped: u64,
    pub decode_failures: u64,
    pub inits_completed: u64,
    pub init_failures: u64,
    pub contract_errors: u64,
}

pub struct ViewportController {
    config: TileConfig,
    pool: Arc<dyn BitmapPool>,
    token: GenerationToken,
    scheduler: DecodeScheduler,
    grid: TileGridManager,
    state: SessionState,
    paused: bool,
    handle: Option<Arc<RegionDecoderHandle>>,
    source: Option<Arc<dyn ImageSource>>,
    last_snapshot: Option<ViewportSnapshot>,
    last_zoom_scale: f32,
    in_flight: HashSet<TaskKey>,
    contract_errors: Vec<ContractError>,
    last_init_error: Option<InitError>,
    listener: Option<Box<dyn SessionListener + Send>>,
    stats: EngineStats,
}

impl ViewportController {
    pub fn new(
        config: TileConfig,
        factory: Arc<dyn RegionDecoderFactory>,
        pool: Arc<dyn BitmapPool>,
    ) -> Self {
        let token = GenerationToken::new();
        let scheduler = DecodeScheduler::new(
            token.observer(),
            factory,
            Arc::clone(&pool),
            config.flavor,
            config.idle_timeout,
        );
        let grid = TileGridManager::new(
            config.block_base_number,
            config.sample_policy(),
            config.flavor,
        );
        debug!(
            block_base_number = config.block_base_number,
            flavor = ?config.flavor,
            idle_ms = config.idle_timeout.as_millis() as u64,
            "Created viewport controller"
        );
        Self {
            config,
            pool,
            token,
            scheduler,
            grid,
            state: SessionState::Idle,
            paused: false,
            handle: None,
            source: None,
            last_snapshot: None,
            last_zoom_scale: 1.0,
            in_flight: HashSet::new(),
            contract_errors: Vec::new(),
            last_init_error: None,
            listener: None,
            stats: EngineStats::default(),
        }
    }

    /// Controller using the image-crate backend and an LRU pool sized from `config`.
    pub fn with_image_backend(config: TileConfig) -> Self {
        let pool = Arc::new(LruBitmapPool::new(config.pool_max_bytes));
        Self::new(config, Arc::new(ImageRegionDecoderFactory::new()), pool)
    }

    /// Start a new session for `source`, abandoning everything from the old one.
    pub fn reset(&mut self, source: Arc<dyn ImageSource>) {
        let generation = self.token.bump();
        self.close_session();
        info!(uri = source.uri(), generation, "Resetting viewport controller");

        self.source = Some(Arc::clone(&source));
        self.state = SessionState::Initializing;
        self.scheduler
            .submit_init(source, self.config.open_options(), generation);
        self.invalidate();
    }

    /// Pausing drops every tile and stops new decode work; the decoder stays open.
    pub fn set_paused(&mut self, paused: bool) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        debug!(paused, state = ?self.state, "Pause state changed");

        match (paused, self.state) {
            (true, SessionState::Ready) => {
                self.token.bump();
                self.grid.clean_all(self.pool.as_ref());
                self.in_flight.clear();
                self.state = SessionState::Paused;
                self.invalidate();
            }
            (false, SessionState::Paused) => {
                self.state = SessionState::Ready;
                self.refresh();
            }
            _ => {}
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// React to a viewport change reported by the host.
    pub fn on_viewport_changed(&mut self, viewport: &dyn Viewport) {
        let snapshot = ViewportSnapshot::capture(viewport, self.last_zoom_scale);
        if !snapshot.has_valid_rotation() {
            self.report_contract_error(ContractError::InvalidRotation {
                degrees: snapshot.rotation_degrees,
            });
            return;
        }
        self.last_zoom_scale = snapshot.zoom_scale;
        self.last_snapshot = Some(snapshot);
        self.refresh();
    }

    /// Re-run the tiling pass against the last viewport snapshot.
    pub fn refresh(&mut self) {
        if self.state != SessionState::Ready {
            return;
        }
        let (Some(snapshot), Some(handle)) = (self.last_snapshot, self.handle.clone()) else {
            return;
        };
        if snapshot.is_zooming && !self.config.update_while_zooming {
            trace!("Zoom in progress, deferring tile update");
            return;
        }
        if snapshot.has_empty_input() || snapshot.is_fully_zoomed_out() {
            if self.grid.clean_all(self.pool.as_ref()) > 0 {
                self.invalidate();
            }
            return;
        }

        let generation = self.token.current();
        let update = self
            .grid
            .update(&snapshot, handle.image_size(), generation, self.pool.as_ref());

        if let Some(violation) = update.sort_violation {
            self.report_contract_error(violation);
        }

        for id in &update.needs_decode {
            let Some(tile) = self.grid.tile(*id) else {
                continue;
            };
            let key = tile.task_key(generation);
            if !self.in_flight.insert(key) {
                continue;
            }
            self.scheduler.submit_decode(
                key,
                tile.id,
                tile.src_rect,
                tile.sample_size,
                Arc::clone(&handle),
                generation,
            );
            self.stats.decodes_submitted += 1;
        }

        if update.created > 0 || update.cleaned > 0 {
            self.invalidate();
        }
    }

    /// Apply every result already posted by the worker. Never blocks.
    pub fn drain_results(&mut self) -> usize {
        let mut handled = 0;
        while let Some(envelope) = self.scheduler.try_recv() {
            self.handle_result(envelope);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for a result, then drain the rest.
    pub fn pump(&mut self, timeout: Duration) -> usize {
        match self.scheduler.recv_timeout(timeout) {
            Some(envelope) => {
                self.handle_result(envelope);
                1 + self.drain_results()
            }
            None => 0,
        }
    }

    fn handle_result(&mut self, envelope: ResponseEnvelope) {
        let ResponseEnvelope {
            generation,
            key,
            payload,
            ..
        } = envelope;

        match payload {
            Response::Init(result) => self.handle_init(generation, result),
            Response::Decode { tile_id, result } => {
                self.in_flight.remove(&key);
                match result {
                    Ok(decoded) => {
                        if !self.is_deliverable(tile_id, key, generation) {
                            self.pool.free(decoded.bitmap);
                            self.note_stale(tile_id, DecodeFailure::KeyExpiredAtCallback);
                            return;
                        }
                        self.grid.install(
                            tile_id,
                            decoded.bitmap,
                            decoded.bitmap_src_rect,
                            generation,
                            self.pool.as_ref(),
                        );
                        self.stats.decodes_applied += 1;
                        self.invalidate();
                    }
                    Err(failure) if failure.is_stale() => self.note_stale(tile_id, failure),
                    Err(failure) => {
                        debug!(tile_id, %failure, "Tile decode failed");
                        self.stats.decode_failures += 1;
                        if self.token.is_current(generation) {
                            self.grid.mark_failed(tile_id);
                        }
                    }
                }
            }
        }
    }

    fn handle_init(
        &mut self,
        generation: u64,
        result: Result<Arc<RegionDecoderHandle>, InitError>,
    ) {
        if !self.token.is_current(generation) || self.state != SessionState::Initializing {
            trace!(generation, "Dropping stale init result");
            if let Ok(handle) = result {
                handle.recycle();
            }
            self.stats.stale_dropped += 1;
            return;
        }

        match result {
            Ok(handle) => {
                let image_size = handle.image_size();
                info!(uri = handle.source_uri(), %image_size, "Region decoder ready");
                self.handle = Some(handle);
                self.state = if self.paused {
                    SessionState::Paused
                } else {
                    SessionState::Ready
                };
                self.stats.inits_completed += 1;
                if let Some(listener) = self.listener.as_mut() {
                    listener.on_ready(image_size);
                }
                self.refresh();
            }
            Err(e) => {
                warn!(error = %e, "Failed to initialize region decoder");
                self.state = SessionState::Idle;
                self.stats.init_failures += 1;
                if let Some(listener) = self.listener.as_mut() {
                    listener.on_init_failed(&e);
                }
                self.last_init_error = Some(e);
            }
        }
    }

    /// A decoded bitmap may be installed only into the same tile geometry it
    /// was requested for, in the same generation, in a live session.
    fn is_deliverable(&self, tile_id: TileId, key: TaskKey, generation: u64) -> bool {
        self.state == SessionState::Ready
            && self.token.is_current(generation)
            && self
                .grid
                .tile(tile_id)
                .is_some_and(|t| !t.is_decode_param_empty() && t.task_key(generation) == key)
    }

    fn note_stale(&mut self, tile_id: TileId, failure: DecodeFailure) {
        trace!(tile_id, %failure, "Dropping stale decode result");
        self.stats.stale_dropped += 1;
    }

    fn report_contract_error(&mut self, error: ContractError) {
        warn!(error = %error, "Contract error");
        self.stats.contract_errors += 1;
        if let Some(listener) = self.listener.as_mut() {
            listener.on_contract_error(&error);
        }
        self.contract_errors.push(error);
    }

    fn invalidate(&mut self) {
        if let Some(listener) = self.listener.as_mut() {
            listener.invalidate();
        }
    }

    /// Draw every decoded tile under the current draw matrix.
    pub fn on_draw(&self, canvas: &mut dyn Canvas) {
        let Some(snapshot) = self.last_snapshot else {
            return;
        };
        let matrix = snapshot.matrix;
        for tile in self.grid.tiles() {
            if tile.is_empty() {
                continue;
            }
            if let Some(bitmap) = tile.bitmap.as_ref() {
                canvas.draw_bitmap(bitmap, tile.bitmap_src_rect, tile.draw_rect, &matrix);
            }
        }

        if self.config.debug_overlay {
            for tile in self.grid.tiles() {
                let color = if tile.is_empty() {
                    PENDING_OVERLAY
                } else {
                    LOADED_OVERLAY
                };
                canvas.fill_rect(tile.draw_rect, color, &matrix);
            }
        }
    }

    /// Tile under a view-space point.
    pub fn tile_at_view_point(&self, x: f32, y: f32) -> Option<&Tile> {
        let inverse = self.last_snapshot?.matrix.invert()?;
        let p = inverse.map_point(Point::new(x, y));
        self.grid.tile_at_drawable(p.x, p.y)
    }

    /// Tile covering an upright image-space point.
    pub fn tile_at_image_point(&self, x: f32, y: f32) -> Option<&Tile> {
        self.grid.tile_at_image(x, y)
    }

    /// Tear the session down: close the decoder, stop the worker, drop all tiles.
    pub fn recycle(&mut self) {
        self.token.bump();
        self.close_session();
        self.scheduler.stop();
        self.state = SessionState::Idle;
        self.source = None;
        debug!("Recycled viewport controller");
        self.invalidate();
    }

    fn close_session(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.recycle();
        }
        let cleaned = self.grid.clean_all(self.pool.as_ref());
        self.in_flight.clear();
        self.last_snapshot = None;
        self.last_init_error = None;
        if cleaned > 0 {
            trace!(cleaned, "Cleared tiles of previous session");
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn tiles(&self) -> &[Tile] {
        self.grid.tiles()
    }

    pub fn generation(&self) -> u64 {
        self.token.current()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn config(&self) -> &TileConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<dyn BitmapPool> {
        &self.pool
    }

    pub fn source(&self) -> Option<&Arc<dyn ImageSource>> {
        self.source.as_ref()
    }

    /// The open decoder, for the conventional whole-image decode path.
    pub fn region_decoder(&self) -> Option<Arc<RegionDecoderHandle>> {
        self.handle.clone()
    }

    /// Decode requests submitted and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// True when every tile holds pixels or has given up.
    pub fn is_settled(&self) -> bool {
        self.in_flight.is_empty()
            && self
                .grid
                .tiles()
                .iter()
                .all(|t| t.failed || !t.is_empty())
    }

    pub fn take_contract_errors(&mut self) -> Vec<ContractError> {
        std::mem::take(&mut self.contract_errors)
    }

    pub fn last_init_error(&self) -> Option<&InitError> {
        self.last_init_error.as_ref()
    }

    pub fn set_listener(&mut self, listener: Option<Box<dyn SessionListener + Send>>) {
        self.listener = listener;
    }

    /// Wake a host event loop whenever the worker posts a result. Called on
    /// the worker thread; the host should then call `drain_results`.
    pub fn set_result_notifier<F>(&self, notify: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.scheduler.set_notifier(Some(Arc::new(notify)));
    }

    pub fn clear_result_notifier(&self) {
        self.scheduler.set_notifier(None);
    }

    pub fn worker_starts(&self) -> usize {
        self.scheduler.worker_starts()
    }
}

impl Drop for ViewportController {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.recycle();
        }
        self.grid.clean_all(self.pool.as_ref());
    }
}
