//! Stream target carried in the device shadow's `streams` state.
//!
//! ```json
//! {"primary": {"gateway_instance": "gw.example.net", "stream_rtp_port": 8004,
//!              "stream_h264_bitrate": 256},
//!  "current": "primary"}
//! ```
//!
//! `"current": null` resets the stream to its defaults.

use serde::Deserialize;
use serde_json::Value;

use crate::error::ShadowError;
use crate::pipeline::params::DEFAULT_BITRATE;
use crate::pipeline::{PipelineContext, StreamParams};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    /// Back to the configured default destination and bitrate
    Default,
    Endpoint(StreamParams),
}

#[derive(Debug, Deserialize)]
struct StreamEndpoint {
    gateway_instance: String,
    stream_rtp_port: u16,
    #[serde(default = "default_bitrate")]
    stream_h264_bitrate: u32,
}

fn default_bitrate() -> u32 {
    DEFAULT_BITRATE
}

impl StreamTarget {
    pub fn from_streams(streams: &Value) -> Result<Self, ShadowError> {
        let streams = streams.as_object().ok_or(ShadowError::NotAnObject)?;
        let name = match streams.get("current") {
            None => return Err(ShadowError::NoCurrentStream),
            Some(Value::Null) => return Ok(StreamTarget::Default),
            Some(Value::String(name)) => name,
            Some(other) => {
                return Err(ShadowError::InvalidStream {
                    name: "current".into(),
                    reason: format!("expected a stream name or null, got {other}"),
                })
            }
        };

        let entry = streams
            .get(name)
            .ok_or_else(|| ShadowError::UnknownStream(name.clone()))?;
        let endpoint = StreamEndpoint::deserialize(entry).map_err(|e| ShadowError::InvalidStream {
            name: name.clone(),
            reason: e.to_string(),
        })?;

        let params = StreamParams::new(
            endpoint.stream_h264_bitrate,
            &endpoint.gateway_instance,
            endpoint.stream_rtp_port,
        )?;
        Ok(StreamTarget::Endpoint(params))
    }

    /// Stage the target on the pipeline
    pub fn apply(self, ctx: &PipelineContext, defaults: &StreamParams) -> StreamParams {
        let params = match self {
            StreamTarget::Default => defaults.clone(),
            StreamTarget::Endpoint(params) => params,
        };
        ctx.stage(params.clone());
        params
    }
}
