//! Hooks at the still-image encoder boundary.
//!
//! Both hooks run synchronously on the pipeline's streaming thread, at most
//! once per frame, never on a caller thread.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::pipeline::PipelineContext;

/// Whether a frame reaches the still-image encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVerdict {
    Pass,
    Drop,
}

/// The pre/post-encode callbacks bound to one [`PipelineContext`]
#[derive(Debug, Clone)]
pub struct FrameInterceptor {
    ctx: Arc<PipelineContext>,
}

impl FrameInterceptor {
    pub(crate) fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Count the frame and let it through only if a snapshot is pending
    pub fn before_encode(&self) -> FrameVerdict {
        counter!("cloudcam_frames_total").increment(1);
        let mut state = self.ctx.lock_snapshot();
        state.current_frame += 1;
        if state.requested {
            state.requested = false;
            FrameVerdict::Pass
        } else {
            FrameVerdict::Drop
        }
    }

    /// Publish an encoded still and wake every requester
    pub fn after_encode(&self, encoded: &[u8]) {
        let mut state = self.ctx.lock_snapshot();
        if state.stopped {
            return;
        }
        state.buffer.store(encoded);
        state.snapshot_frame = Some(state.current_frame);
        debug!(
            "Captured snapshot of frame {} ({} bytes)",
            state.current_frame,
            encoded.len()
        );
        counter!("cloudcam_snapshots_captured_total").increment(1);
        self.ctx.notify_snapshot();
    }

    /// The encoded buffer could not be read. Requesters keep waiting and the
    /// request is re-armed so the next frame is encoded instead.
    pub fn capture_failed(&self, reason: &str) {
        warn!("Snapshot capture failed: {}", reason);
        counter!("cloudcam_snapshot_capture_failures_total").increment(1);
        let mut state = self.ctx.lock_snapshot();
        if !state.stopped {
            state.requested = true;
        }
    }
}
