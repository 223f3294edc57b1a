//! Command and shadow-delta dispatch.
//!
//! Every handler returns the shadow "reported" document to publish, if any.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::control::shadow::StreamTarget;
use crate::pipeline::{PipelineContext, StreamParams};
use crate::upload::Uploader;

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Command {
    UploadThumb {
        upload_url: String,
        #[serde(default)]
        download_url: String,
    },
}

pub struct CommandHandler {
    ctx: Arc<PipelineContext>,
    uploader: Uploader,
    snapshot_timeout: Duration,
    stream_defaults: StreamParams,
}

impl CommandHandler {
    pub fn new(
        ctx: Arc<PipelineContext>,
        uploader: Uploader,
        snapshot_timeout: Duration,
        stream_defaults: StreamParams,
    ) -> Self {
        Self {
            ctx,
            uploader,
            snapshot_timeout,
            stream_defaults,
        }
    }

    /// Route a message: `{"command": ..}` or a shadow delta `{"state": ..}`
    pub async fn dispatch(&self, message: &Value) -> Option<Value> {
        if message.get("command").is_some() {
            self.handle_command(message).await
        } else if let Some(state) = message.get("state") {
            self.handle_shadow_delta(state)
        } else {
            warn!("Unrecognized message: {}", message);
            None
        }
    }

    pub async fn handle_command(&self, payload: &Value) -> Option<Value> {
        match Command::deserialize(payload) {
            Ok(Command::UploadThumb {
                upload_url,
                download_url,
            }) => Some(self.upload_thumb(&upload_url, &download_url).await),
            Err(e) => {
                error!("Unsupported command {}: {}", payload["command"], e);
                None
            }
        }
    }

    async fn upload_thumb(&self, upload_url: &str, download_url: &str) -> Value {
        let status = match self.capture_and_upload(upload_url).await {
            Ok(()) => "success",
            Err(e) => {
                error!("Thumbnail upload failed: {:#}", e);
                "failure"
            }
        };
        json!({
            "state": {
                "reported": {
                    "last_uploaded_thumb": {
                        "upload_url": upload_url,
                        "download_url": download_url,
                        "status": status,
                    }
                }
            }
        })
    }

    async fn capture_and_upload(&self, upload_url: &str) -> color_eyre::Result<()> {
        let ctx = self.ctx.clone();
        let timeout = self.snapshot_timeout;
        let snapshot =
            tokio::task::spawn_blocking(move || ctx.request_snapshot_timeout(timeout)).await??;
        info!(
            "Uploading snapshot of frame {} ({} bytes)",
            snapshot.frame(),
            snapshot.len()
        );
        self.uploader.put(upload_url, snapshot.into_bytes()).await?;
        Ok(())
    }

    /// Apply every recognized key of a shadow delta's `state`
    pub fn handle_shadow_delta(&self, state: &Value) -> Option<Value> {
        let Some(state) = state.as_object() else {
            warn!("Shadow delta state is not an object: {}", state);
            return None;
        };

        let mut reported = serde_json::Map::new();
        for (key, value) in state {
            match key.as_str() {
                "streams" => match StreamTarget::from_streams(value) {
                    Ok(target) => {
                        let params = target.apply(&self.ctx, &self.stream_defaults);
                        info!(
                            "Stream target staged: {} @ {}kbps",
                            params.destination(),
                            params.bitrate
                        );
                        reported.insert(key.clone(), value.clone());
                    }
                    Err(e) => error!("Invalid streams update: {}", e),
                },
                other => warn!("Unrecognized shadow update key: {}", other),
            }
        }

        if reported.is_empty() {
            None
        } else {
            Some(json!({ "state": { "reported": reported } }))
        }
    }
}
