//! Staged stream parameters and the periodic applier that pushes them into
//! the live pipeline

use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ControlError, ParamsError};
use crate::pipeline::PipelineContext;

pub const DEFAULT_BITRATE: u32 = 256;
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 20000;
/// Longest destination host accepted for staging
pub const MAX_HOST_LEN: usize = 255;

/// Bitrate and RTP destination of the continuous branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    /// kbps
    pub bitrate: u32,
    pub host: String,
    pub port: u16,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            bitrate: DEFAULT_BITRATE,
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
        }
    }
}

impl StreamParams {
    pub fn new(bitrate: u32, host: &str, port: u16) -> Result<Self, ParamsError> {
        if bitrate == 0 {
            return Err(ParamsError::ZeroBitrate);
        }
        if host.is_empty() {
            return Err(ParamsError::EmptyHost);
        }
        if host.len() > MAX_HOST_LEN {
            return Err(ParamsError::HostTooLong {
                len: host.len(),
                max: MAX_HOST_LEN,
            });
        }
        if port == 0 {
            return Err(ParamsError::ZeroPort);
        }
        Ok(Self {
            bitrate,
            host: host.to_owned(),
            port,
        })
    }

    pub fn destination(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Live reconfiguration surface of the encoder and network sink.
///
/// Only ever called from the pipeline worker.
pub trait StreamControl {
    fn bitrate(&self) -> u32;
    fn set_bitrate(&self, kbps: u32) -> Result<(), ControlError>;
    fn destination(&self) -> (String, u16);
    fn set_destination(&self, host: &str, port: u16) -> Result<(), ControlError>;
}

/// What one applier pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    pub bitrate: bool,
    pub destination: bool,
}

impl AppliedChanges {
    pub fn any(&self) -> bool {
        self.bitrate || self.destination
    }
}

/// Applies staged parameters on the worker's timer
#[derive(Clone)]
pub struct ParamApplier {
    ctx: Arc<PipelineContext>,
}

impl ParamApplier {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Reconfigure only what differs from the active values. A rejected
    /// value stays staged and is retried on the next pass.
    pub fn apply(&self, control: &dyn StreamControl) -> AppliedChanges {
        let staged = self.ctx.staged_params();
        let mut changes = AppliedChanges::default();

        if control.bitrate() != staged.bitrate {
            match control.set_bitrate(staged.bitrate) {
                Ok(()) => {
                    info!("Applied H.264 bitrate: {}kbps", staged.bitrate);
                    changes.bitrate = true;
                }
                Err(e) => reject(e),
            }
        }

        let (host, port) = control.destination();
        if host != staged.host || port != staged.port {
            match control.set_destination(&staged.host, staged.port) {
                Ok(()) => {
                    info!("Applied RTP destination: {}", staged.destination());
                    changes.destination = true;
                }
                Err(e) => reject(e),
            }
        }

        if changes.any() {
            counter!("cloudcam_param_reconfigurations_total").increment(1);
        }
        changes
    }
}

fn reject(e: ControlError) {
    counter!("cloudcam_param_rejections_total").increment(1);
    warn!("Stream reconfiguration deferred: {}", e);
}
