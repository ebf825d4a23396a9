//! Decode scheduler: one lazily started worker thread and two flume channels.
//!
//! - Requests go out on an unbounded channel and are processed in submission order
//! - Results come back on a second channel drained by the controller thread
//! - The worker starts on the first submission and exits after an idle period;
//!   the next submission starts a fresh one
//! - Only the most recently submitted init is ever executed

pub mod task;
mod worker;

pub use task::{DecodedTile, Request, RequestEnvelope, Response, ResponseEnvelope, TaskEnvelope, TaskKind};

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace};

use crate::bitmap::BitmapPool;
use crate::config::EngineFlavor;
use crate::decoder::{OpenOptions, RegionDecoderFactory, RegionDecoderHandle};
use crate::generation::GenerationObserver;
use crate::geometry::Rect;
use crate::source::ImageSource;
use crate::tiles::{TaskKey, TileId};
use worker::{worker_loop, WorkerContext, WorkerHandle};

/// Called on the worker thread after each result is posted.
pub type Notifier = Arc<dyn Fn() + Send + Sync>;

/// Runs init and decode tasks off the controller thread.
pub struct DecodeScheduler {
    request_tx: Sender<RequestEnvelope>,
    request_rx: Receiver<RequestEnvelope>,
    result_tx: Sender<ResponseEnvelope>,
    result_rx: Receiver<ResponseEnvelope>,
    worker: Arc<Mutex<Option<WorkerHandle>>>,
    latest_init: Arc<AtomicU64>,
    generation: GenerationObserver,
    factory: Arc<dyn RegionDecoderFactory>,
    pool: Arc<dyn BitmapPool>,
    flavor: EngineFlavor,
    idle_timeout: Duration,
    notifier: Arc<RwLock<Option<Notifier>>>,
    worker_starts: AtomicUsize,
}

impl DecodeScheduler {
    pub fn new(
        generation: GenerationObserver,
        factory: Arc<dyn RegionDecoderFactory>,
        pool: Arc<dyn BitmapPool>,
        flavor: EngineFlavor,
        idle_timeout: Duration,
    ) -> Self {
        let (request_tx, request_rx) = flume::unbounded();
        let (result_tx, result_rx) = flume::unbounded();
        Self {
            request_tx,
            request_rx,
            result_tx,
            result_rx,
            worker: Arc::new(Mutex::new(None)),
            latest_init: Arc::new(AtomicU64::new(0)),
            generation,
            factory,
            pool,
            flavor,
            idle_timeout,
            notifier: Arc::new(RwLock::new(None)),
            worker_starts: AtomicUsize::new(0),
        }
    }

    /// Queue opening a decoder for `source`. Any init still queued is superseded.
    pub fn submit_init(&self, source: Arc<dyn ImageSource>, options: OpenOptions, generation: u64) -> u64 {
        let init_seq = self.latest_init.fetch_add(1, Ordering::AcqRel) + 1;
        let key = TaskKey(init_seq ^ generation.rotate_left(32));
        trace!(uri = source.uri(), init_seq, generation, "Submitting init");
        self.submit(TaskEnvelope {
            kind: TaskKind::Init,
            generation,
            key,
            payload: Request::Init {
                source,
                options,
                init_seq,
            },
        });
        init_seq
    }

    /// Queue decoding one tile's source rect.
    pub fn submit_decode(
        &self,
        key: TaskKey,
        tile_id: TileId,
        src_rect: Rect,
        sample_size: u32,
        handle: Arc<RegionDecoderHandle>,
        generation: u64,
    ) {
        self.submit(TaskEnvelope {
            kind: TaskKind::Decode,
            generation,
            key,
            payload: Request::Decode {
                tile_id,
                src_rect,
                sample_size,
                handle,
            },
        });
    }

    fn submit(&self, envelope: RequestEnvelope) {
        // Enqueue under the slot lock so an idling worker cannot miss it.
        let mut slot = self.worker.lock();
        if self.request_tx.send(envelope).is_err() {
            // Both ends live in `self`, so this cannot happen while we exist.
            error!("Decode request channel disconnected");
            return;
        }
        if slot.is_none() {
            *slot = self.spawn_worker();
        }
    }

    fn spawn_worker(&self) -> Option<WorkerHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = WorkerContext {
            rx: self.request_rx.clone(),
            tx: self.result_tx.clone(),
            shutdown: Arc::clone(&shutdown),
            generation: self.generation.clone(),
            latest_init: Arc::clone(&self.latest_init),
            factory: Arc::clone(&self.factory),
            pool: Arc::clone(&self.pool),
            flavor: self.flavor,
            idle_timeout: self.idle_timeout,
            notifier: Arc::clone(&self.notifier),
            slot: Arc::clone(&self.worker),
        };

        match thread::Builder::new()
            .name("regionview-decode".into())
            .spawn(move || worker_loop(ctx))
        {
            Ok(join) => {
                let starts = self.worker_starts.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(starts, "Spawned decode worker");
                Some(WorkerHandle { join, shutdown })
            }
            Err(e) => {
                // The request stays queued; the next submission retries the spawn.
                error!(error = %e, "Failed to spawn decode worker");
                None
            }
        }
    }

    /// Next result, if one is ready.
    pub fn try_recv(&self) -> Option<ResponseEnvelope> {
        self.result_rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next result.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ResponseEnvelope> {
        self.result_rx.recv_timeout(timeout).ok()
    }

    /// Requests not yet picked up by the worker.
    pub fn queued(&self) -> usize {
        self.request_rx.len()
    }

    pub fn is_worker_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// How many worker threads have been started so far.
    pub fn worker_starts(&self) -> usize {
        self.worker_starts.load(Ordering::Relaxed)
    }

    /// Install or clear the result notifier. The notifier must not call back
    /// into this method.
    pub fn set_notifier(&self, notifier: Option<Notifier>) {
        *self.notifier.write() = notifier;
    }

    /// Stop the worker and discard queued requests and undelivered results.
    ///
    /// Undelivered decode results hand their bitmaps back to the pool.
    pub fn stop(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle.shutdown.store(true, Ordering::Release);
            if handle.join.join().is_err() {
                error!("Decode worker panicked outside a task");
            }
        }

        let dropped = self.request_rx.drain().count();
        let mut results = 0;
        for envelope in self.result_rx.drain() {
            results += 1;
            match envelope.payload {
                Response::Decode {
                    result: Ok(decoded), ..
                } => self.pool.free(decoded.bitmap),
                Response::Init(Ok(handle)) => handle.recycle(),
                _ => {}
            }
        }
        debug!(dropped, results, "Stopped decode scheduler");
    }
}

impl Drop for DecodeScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
