//! Shared state between the pipeline worker and caller threads.
//!
//! Two independent guards: one over the snapshot fields (paired with a
//! condvar for "next captured frame" waits), one over the staged stream
//! parameters. The worker only ever holds one of them at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{ParamsError, PipelineError, SnapshotError};
use crate::pipeline::interceptor::FrameInterceptor;
use crate::pipeline::params::StreamParams;

/// Encoded still image returned to a requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    frame: u64,
    data: Bytes,
}

impl Snapshot {
    /// Frame counter value at capture time
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Grow-only reusable buffer for the most recent encoded still
#[derive(Debug, Default)]
pub struct SnapshotBuffer {
    data: Vec<u8>,
}

impl SnapshotBuffer {
    /// Replace contents, reallocating only when `bytes` exceeds capacity
    pub fn store(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    fn release(&mut self) {
        self.data = Vec::new();
    }
}

#[derive(Debug, Default)]
pub(crate) struct SnapshotState {
    pub(crate) current_frame: u64,
    /// `None` until the first capture
    pub(crate) snapshot_frame: Option<u64>,
    pub(crate) buffer: SnapshotBuffer,
    /// Level-triggered: set by requesters, cleared when a frame is let through
    pub(crate) requested: bool,
    pub(crate) stopped: bool,
}

/// Process-wide pipeline context, shared by the worker and all callers
#[derive(Debug)]
pub struct PipelineContext {
    snapshot: Mutex<SnapshotState>,
    snapshot_ready: Condvar,
    params: Mutex<StreamParams>,
    interceptor_attached: AtomicBool,
}

impl PipelineContext {
    pub fn new(defaults: StreamParams) -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(SnapshotState::default()),
            snapshot_ready: Condvar::new(),
            params: Mutex::new(defaults),
            interceptor_attached: AtomicBool::new(false),
        })
    }

    /// Hand out the single interceptor bound to this context
    pub fn attach_interceptor(self: &Arc<Self>) -> Result<FrameInterceptor, PipelineError> {
        if self.interceptor_attached.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::InterceptorAttached);
        }
        Ok(FrameInterceptor::new(Arc::clone(self)))
    }

    /// Block until a frame that reached the interceptor after this call has
    /// been JPEG-encoded.
    ///
    /// Concurrent requesters arriving before the same frame boundary may be
    /// served the same capture. A frame already being encoded when the call
    /// is made never satisfies it.
    pub fn request_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        self.wait_snapshot(None)
    }

    /// Like [`request_snapshot`](Self::request_snapshot) but gives up after
    /// `timeout`. The request flag stays armed, so the next frame is still
    /// encoded.
    pub fn request_snapshot_timeout(&self, timeout: Duration) -> Result<Snapshot, SnapshotError> {
        self.wait_snapshot(Some(timeout))
    }

    fn wait_snapshot(&self, timeout: Option<Duration>) -> Result<Snapshot, SnapshotError> {
        // An unrepresentable deadline waits forever
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.lock_snapshot();
        if state.stopped {
            return Err(SnapshotError::Stopped);
        }
        let baseline = state.current_frame;
        state.requested = true;

        loop {
            // Teardown wins over a capture that raced it
            if state.stopped {
                return Err(SnapshotError::Stopped);
            }
            if state.snapshot_frame.is_some_and(|frame| frame > baseline) {
                break;
            }
            state = match deadline {
                None => self
                    .snapshot_ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(SnapshotError::Timeout(timeout.unwrap_or_default()));
                    }
                    self.snapshot_ready
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }

        let frame = state.snapshot_frame.unwrap_or_default();
        Ok(Snapshot {
            frame,
            data: Bytes::copy_from_slice(state.buffer.as_slice()),
        })
    }

    /// Stage new stream parameters; applied by the worker within one
    /// applier interval
    pub fn update_parameters(&self, bitrate: u32, host: &str, port: u16) -> Result<(), ParamsError> {
        let params = StreamParams::new(bitrate, host, port)?;
        self.stage(params);
        Ok(())
    }

    pub fn stage(&self, params: StreamParams) {
        *self.params.lock().unwrap_or_else(PoisonError::into_inner) = params;
    }

    pub fn staged_params(&self) -> StreamParams {
        self.params.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Frames observed at the interceptor so far
    pub fn current_frame(&self) -> u64 {
        self.lock_snapshot().current_frame
    }

    /// Frame counter of the most recent capture
    pub fn snapshot_frame(&self) -> Option<u64> {
        self.lock_snapshot().snapshot_frame
    }

    pub fn snapshot_requested(&self) -> bool {
        self.lock_snapshot().requested
    }

    pub fn snapshot_capacity(&self) -> usize {
        self.lock_snapshot().buffer.capacity()
    }

    pub fn is_stopped(&self) -> bool {
        self.lock_snapshot().stopped
    }

    /// Release the snapshot buffer and wake every pending requester with
    /// [`SnapshotError::Stopped`]
    pub fn shutdown(&self) {
        let mut state = self.lock_snapshot();
        state.stopped = true;
        state.requested = false;
        state.buffer.release();
        self.snapshot_ready.notify_all();
    }

    pub(crate) fn lock_snapshot(&self) -> MutexGuard<'_, SnapshotState> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_snapshot(&self) {
        self.snapshot_ready.notify_all();
    }
}
