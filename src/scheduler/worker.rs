//! The decode worker thread.
//!
//! One worker per scheduler. It polls the request channel, runs each task
//! under `catch_unwind`, and exits on its own after the idle timeout.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::task::{DecodedTile, Request, RequestEnvelope, Response, ResponseEnvelope};
use super::Notifier;
use crate::bitmap::BitmapPool;
use crate::config::EngineFlavor;
use crate::decoder::{RegionDecoderFactory, RegionDecoderHandle};
use crate::error::{DecodeFailure, InitError};
use crate::generation::GenerationObserver;
use crate::geometry::Rect;
use crate::tiles::grid::panic_message;

/// Longest wait on the request channel before re-checking shutdown and idleness.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A running worker thread.
pub(crate) struct WorkerHandle {
    pub join: JoinHandle<()>,
    pub shutdown: Arc<AtomicBool>,
}

/// Everything a worker thread needs, cloned out of the scheduler at spawn time.
pub(crate) struct WorkerContext {
    pub rx: Receiver<RequestEnvelope>,
    pub tx: Sender<ResponseEnvelope>,
    pub shutdown: Arc<AtomicBool>,
    pub generation: GenerationObserver,
    pub latest_init: Arc<AtomicU64>,
    pub factory: Arc<dyn RegionDecoderFactory>,
    pub pool: Arc<dyn BitmapPool>,
    pub flavor: EngineFlavor,
    pub idle_timeout: Duration,
    pub notifier: Arc<RwLock<Option<Notifier>>>,
    /// The scheduler's worker slot; emptied by the worker when it idles out.
    pub slot: Arc<Mutex<Option<WorkerHandle>>>,
}

pub(crate) fn worker_loop(ctx: WorkerContext) {
    debug!("Decode worker started");
    let poll = POLL_INTERVAL.min(ctx.idle_timeout.max(Duration::from_millis(1)));
    let mut last_activity = Instant::now();

    loop {
        if ctx.shutdown.load(Ordering::Acquire) {
            break;
        }

        match ctx.rx.recv_timeout(poll) {
            Ok(envelope) => {
                if let Some(response) = run_task(&ctx, envelope) {
                    if ctx.tx.send(response).is_err() {
                        debug!("Result channel closed, stopping decode worker");
                        break;
                    }
                    if let Some(notify) = ctx.notifier.read().as_ref() {
                        notify();
                    }
                }
                last_activity = Instant::now();
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                if last_activity.elapsed() < ctx.idle_timeout {
                    continue;
                }
                // Submitters enqueue while holding the slot lock, so an empty
                // queue seen under the lock means nothing can be lost.
                let mut slot = ctx.slot.lock();
                if !ctx.rx.is_empty() || ctx.shutdown.load(Ordering::Acquire) {
                    continue;
                }
                slot.take();
                debug!(idle_ms = ctx.idle_timeout.as_millis() as u64, "Decode worker idle, exiting");
                return;
            }
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("Decode worker stopped");
}

/// Run one task, converting panics into classified failures.
fn run_task(ctx: &WorkerContext, envelope: RequestEnvelope) -> Option<ResponseEnvelope> {
    let RequestEnvelope {
        kind,
        generation,
        key,
        payload,
    } = envelope;

    let tile_id = match &payload {
        Request::Decode { tile_id, .. } => Some(*tile_id),
        Request::Init { .. } => None,
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match payload {
        Request::Init {
            source,
            options,
            init_seq,
        } => {
            if ctx.latest_init.load(Ordering::Acquire) != init_seq {
                trace!(init_seq, "Skipping superseded init");
                return None;
            }
            if !ctx.generation.is_current(generation) {
                trace!(generation, "Skipping stale init");
                return None;
            }
            let result = RegionDecoderHandle::open(
                source.as_ref(),
                ctx.factory.as_ref(),
                options,
                Arc::clone(&ctx.pool),
            );
            match result {
                Ok(handle) if !ctx.generation.is_current(generation) => {
                    trace!(generation, "Init finished after its session ended");
                    handle.recycle();
                    None
                }
                Ok(handle) => Some(Response::Init(Ok(Arc::new(handle)))),
                Err(e) => {
                    debug!(uri = source.uri(), error = %e, "Failed to open region decoder");
                    Some(Response::Init(Err(InitError::from(e))))
                }
            }
        }
        Request::Decode {
            tile_id,
            src_rect,
            sample_size,
            handle,
        } => Some(Response::Decode {
            tile_id,
            result: decode_tile(ctx, generation, src_rect, sample_size, &handle),
        }),
    }));

    let response = match outcome {
        Ok(response) => response?,
        Err(payload) => {
            let message = panic_message(&*payload);
            warn!(?kind, %key, %message, "Decode task panicked");
            match tile_id {
                Some(tile_id) => Response::Decode {
                    tile_id,
                    result: Err(DecodeFailure::DecodeFailed),
                },
                None => Response::Init(Err(InitError::DecoderNotReady(format!(
                    "init panicked: {message}"
                )))),
            }
        }
    };

    Some(ResponseEnvelope {
        kind,
        generation,
        key,
        payload: response,
    })
}

fn decode_tile(
    ctx: &WorkerContext,
    generation: u64,
    src_rect: Rect,
    sample_size: u32,
    handle: &RegionDecoderHandle,
) -> Result<DecodedTile, DecodeFailure> {
    if ctx.flavor == EngineFlavor::Current && !ctx.generation.is_current(generation) {
        return Err(DecodeFailure::KeyExpiredBeforeDecode);
    }
    if !handle.is_ready() {
        return Err(DecodeFailure::DecoderNotReady);
    }

    let bitmap = match handle.decode_region(src_rect, sample_size) {
        Ok(Some(bitmap)) => bitmap,
        Ok(None) => return Err(DecodeFailure::BitmapNull),
        Err(e) => {
            let failure = DecodeFailure::from(&e);
            debug!(%src_rect, sample_size, error = %e, %failure, "Region decode failed");
            return Err(failure);
        }
    };

    if bitmap.is_recycled() {
        ctx.pool.free(bitmap);
        return Err(DecodeFailure::BitmapRecycledBeforeUse);
    }
    if !ctx.generation.is_current(generation) {
        ctx.pool.free(bitmap);
        return Err(DecodeFailure::KeyExpiredAfterDecode);
    }

    let bitmap_src_rect = bitmap.size().to_rect();
    Ok(DecodedTile {
        bitmap,
        bitmap_src_rect,
    })
}
