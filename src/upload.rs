//! HTTP(S) object upload to pre-signed storage URLs

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info};

use crate::error::UploadError;
use crate::UploadConfig;

#[derive(Debug, Clone)]
pub struct Uploader {
    client: reqwest::Client,
    content_type: String,
}

impl Uploader {
    pub fn new(config: &UploadConfig) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            content_type: config.content_type.clone(),
        })
    }

    /// PUT `body` to `url`; any non-2xx response is an error
    pub async fn put(&self, url: &str, body: Bytes) -> Result<(), UploadError> {
        let len = body.len();
        debug!("Uploading {} bytes to {}", len, url);

        let response = self
            .client
            .put(url)
            .header(CONTENT_TYPE, &self.content_type)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Status(status.as_u16()));
        }
        info!("Uploaded {} bytes ({})", len, status);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::SocketAddr;

    use axum::body::Bytes as AxumBytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::put;
    use axum::Router;
    use tokio::sync::mpsc;

    use super::*;

    /// Upload received by the local test endpoint
    #[derive(Debug)]
    pub(crate) struct Received {
        pub content_type: Option<String>,
        pub body: Vec<u8>,
    }

    /// Serve `PUT /thumb` (accepting) and `PUT /denied` (403) on an
    /// ephemeral port
    pub(crate) async fn upload_server() -> (SocketAddr, mpsc::UnboundedReceiver<Received>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route(
                "/thumb",
                put(
                    |State(tx): State<mpsc::UnboundedSender<Received>>,
                     headers: HeaderMap,
                     body: AxumBytes| async move {
                        let content_type = headers
                            .get("content-type")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_owned);
                        let _ = tx.send(Received {
                            content_type,
                            body: body.to_vec(),
                        });
                        StatusCode::OK
                    },
                ),
            )
            .route("/denied", put(|| async { StatusCode::FORBIDDEN }))
            .with_state(tx);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn puts_bytes_with_content_type() {
        let (addr, mut rx) = upload_server().await;
        let uploader = Uploader::new(&UploadConfig::default()).unwrap();

        uploader
            .put(&format!("http://{addr}/thumb"), Bytes::from_static(b"\xff\xd8jpeg"))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.body, b"\xff\xd8jpeg");
        assert_eq!(received.content_type.as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (addr, _rx) = upload_server().await;
        let uploader = Uploader::new(&UploadConfig::default()).unwrap();

        let err = uploader
            .put(&format!("http://{addr}/denied"), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Status(403)));
    }
}
