//! Worker pool serving a device's request queue
//!
//! Each worker thread owns one [`ConnectionDescriptor`] and serves one
//! request at a time: it maps the request onto a range operation, records
//! statistics and signals completion.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use restblock_common::{CompletionPolicy, DebugLevel, Error, Result};
use tracing::{debug, error, info_span, warn};

use crate::descriptor::ConnectionDescriptor;
use crate::queue::RequestQueue;
use crate::range::{get_range, put_range};
use crate::request::{Direction, PendingRequest};
use crate::stats::IoStats;
use crate::transport::disconnect;

/// State shared by a device and its workers
#[derive(Debug)]
pub struct WorkerContext {
    name: String,
    queue: RequestQueue,
    stats: IoStats,
    debug_level: AtomicU8,
    policy: CompletionPolicy,
}

impl WorkerContext {
    #[must_use]
    pub fn new(name: impl Into<String>, policy: CompletionPolicy, debug_level: DebugLevel) -> Self {
        Self {
            name: name.into(),
            queue: RequestQueue::new(),
            stats: IoStats::new(),
            debug_level: AtomicU8::new(debug_level.as_u8()),
            policy,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    #[must_use]
    pub const fn stats(&self) -> &IoStats {
        &self.stats
    }

    #[must_use]
    pub const fn policy(&self) -> CompletionPolicy {
        self.policy
    }

    #[must_use]
    pub fn debug_level(&self) -> DebugLevel {
        DebugLevel::from_u8(self.debug_level.load(Ordering::Relaxed))
    }

    pub fn set_debug_level(&self, level: DebugLevel) {
        self.debug_level.store(level.as_u8(), Ordering::Relaxed);
    }

    fn traces_requests(&self) -> bool {
        self.debug_level() >= DebugLevel::Debug
    }
}

/// Threads serving one device
pub struct WorkerPool {
    context: Arc<WorkerContext>,
    cancel: Arc<AtomicBool>,
    handles: Vec<JoinHandle<ConnectionDescriptor>>,
}

impl WorkerPool {
    /// Start one worker per descriptor.
    ///
    /// All descriptors share the pool's cancellation flag. If a thread cannot
    /// be spawned the workers already running are stopped.
    pub fn start(context: Arc<WorkerContext>, descriptors: Vec<ConnectionDescriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(Error::invalid_argument("worker pool needs at least one connection"));
        }

        let mut pool = Self {
            context,
            cancel: Arc::new(AtomicBool::new(false)),
            handles: Vec::with_capacity(descriptors.len()),
        };

        for (id, mut desc) in descriptors.into_iter().enumerate() {
            desc.set_cancel_flag(Arc::clone(&pool.cancel));
            let context = Arc::clone(&pool.context);
            let handle = thread::Builder::new()
                .name(format!("{}/{id}", context.name))
                .spawn(move || worker_loop(&context, id, desc))
                .map_err(|e| {
                    error!(device = %pool.context.name, error = %e, "Cannot spawn worker thread");
                    Error::ResourceExhausted(format!("worker thread: {e}"))
                })?;
            pool.handles.push(handle);
        }

        debug!(device = %pool.context.name, workers = pool.handles.len(), "Worker pool started");
        Ok(pool)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Abort in-flight transfers; queued requests complete as interrupted
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// The flag raised by [`WorkerPool::cancel`], usable after the pool is gone
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Stop accepting requests, let the workers drain the queue and join them.
    ///
    /// Returns the workers' descriptors, still connected.
    pub fn shutdown(&mut self) -> Vec<ConnectionDescriptor> {
        self.context.queue.stop();
        let mut descriptors = Vec::with_capacity(self.handles.len());
        for handle in self.handles.drain(..) {
            match handle.join() {
                Ok(desc) => descriptors.push(desc),
                Err(_) => error!(device = %self.context.name, "Worker thread panicked"),
            }
        }
        debug!(device = %self.context.name, "Worker pool stopped");
        descriptors
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("device", &self.context.name)
            .field("workers", &self.handles.len())
            .finish_non_exhaustive()
    }
}

fn worker_loop(context: &WorkerContext, id: usize, mut desc: ConnectionDescriptor) -> ConnectionDescriptor {
    let span = info_span!("worker", device = %context.name, id);
    let _enter = span.enter();
    debug!("Worker started");

    while let Some(request) = context.queue.pop_wait() {
        // An unfinished request completes from its drop guard while unwinding
        let served = panic::catch_unwind(AssertUnwindSafe(|| serve(context, &mut desc, request)));
        if served.is_err() {
            error!("Request handling panicked, resetting connection");
            disconnect(&mut desc);
        }
    }

    debug!("Worker exiting");
    desc
}

fn serve(context: &WorkerContext, desc: &mut ConnectionDescriptor, mut request: PendingRequest) {
    let direction = request.direction();
    let offset = request.offset();
    let length = request.len();

    if length == 0 {
        request.complete(Ok(()));
        return;
    }

    let traced = context.traces_requests();
    if traced {
        debug!(
            ?direction,
            offset,
            length,
            segments = request.segment_count(),
            "New request"
        );
    }

    let started = Instant::now();
    let result = match direction {
        Direction::Read => {
            let mut segments: Vec<&mut [u8]> =
                request.segments_mut().iter_mut().map(|s| &mut s[..]).collect();
            get_range(desc, offset, length, &mut segments).map(|_| ())
        }
        Direction::Write => {
            let segments: Vec<&[u8]> = request.segments().iter().map(|s| &s[..]).collect();
            put_range(desc, offset, &segments)
        }
    };
    let elapsed = started.elapsed();
    context.stats.record(direction, length, elapsed, result.is_ok());

    if traced {
        debug!(?elapsed, "Request served");
    }

    let status = match result {
        Ok(()) => Ok(()),
        Err(e) => match context.policy {
            CompletionPolicy::Unconditional => {
                warn!(?direction, offset, length, error = %e, "Range request failed, completing anyway");
                Ok(())
            }
            CompletionPolicy::Strict => {
                error!(?direction, offset, length, error = %e, "Range request failed");
                Err(e)
            }
        },
    };
    request.complete(status);
}
