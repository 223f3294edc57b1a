//! Error types surfaced by the agent's public operations

use std::time::Duration;

use thiserror::Error;

use crate::pipeline::PipelineState;

/// Rejected `update_parameters` input; nothing is staged
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    #[error("bitrate must be non-zero")]
    ZeroBitrate,
    #[error("destination host must be non-empty")]
    EmptyHost,
    #[error("destination host is {len} bytes, limit is {max}")]
    HostTooLong { len: usize, max: usize },
    #[error("destination port must be non-zero")]
    ZeroPort,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("pipeline stopped before a snapshot was captured")]
    Stopped,
    #[error("no snapshot captured within {0:?}")]
    Timeout(Duration),
}

/// A live element refused a reconfiguration value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{element} rejected {property}={value}")]
pub struct ControlError {
    pub element: String,
    pub property: &'static str,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline cannot start from state {0:?}")]
    AlreadyStarted(PipelineState),
    #[error("a frame interceptor is already attached to this context")]
    InterceptorAttached,
    #[error("failed to spawn pipeline worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("pipeline failed to start: {0}")]
    Startup(String),
    #[error("pipeline worker exited unexpectedly")]
    WorkerExited,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upload rejected with HTTP status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShadowError {
    #[error("streams state is not an object")]
    NotAnObject,
    #[error("streams state does not name a current stream")]
    NoCurrentStream,
    #[error("current stream {0:?} is not described in the update")]
    UnknownStream(String),
    #[error("stream {name:?} is malformed: {reason}")]
    InvalidStream { name: String, reason: String },
    #[error(transparent)]
    InvalidParams(#[from] ParamsError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("invalid default stream parameters: {0}")]
    InvalidDefaults(#[source] ParamsError),
}
