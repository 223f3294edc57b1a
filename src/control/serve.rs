//! Line-delimited JSON control loop.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::control::CommandHandler;

/// Why [`serve`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    Interrupted,
    InputClosed,
}

/// Dispatch one JSON message per input line until `shutdown` resolves or
/// the input ends.
///
/// Each message runs as its own task, so `shutdown` is honoured while a
/// snapshot or upload is in flight; those tasks are aborted. At end of
/// input the pending messages are drained first. Reported documents are
/// sent to `reports`.
pub async fn serve<R, F>(
    handler: Arc<CommandHandler>,
    input: R,
    shutdown: F,
    reports: mpsc::UnboundedSender<Value>,
) -> ServeExit
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut lines = input.lines();
    let mut in_flight = JoinSet::new();

    let exit = loop {
        tokio::select! {
            _ = &mut shutdown => break ServeExit::Interrupted,
            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = done {
                    error!("Message handler failed: {}", e);
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(message) => {
                            let handler = handler.clone();
                            let reports = reports.clone();
                            in_flight.spawn(async move {
                                if let Some(reported) = handler.dispatch(&message).await {
                                    let _ = reports.send(reported);
                                }
                            });
                        }
                        Err(e) => warn!("Ignoring malformed message: {}", e),
                    }
                }
                Ok(None) => {
                    info!("Control input closed");
                    break ServeExit::InputClosed;
                }
                Err(e) => {
                    error!("Failed to read control input: {}", e);
                    break ServeExit::InputClosed;
                }
            },
        }
    };

    if exit == ServeExit::InputClosed {
        if in_flight.is_empty() {
            return exit;
        }
        info!("Waiting for {} pending message(s)", in_flight.len());
        tokio::select! {
            _ = async { while in_flight.join_next().await.is_some() {} } => return exit,
            _ = &mut shutdown => {}
        }
    }

    info!("Interrupted with {} message(s) in flight", in_flight.len());
    in_flight.shutdown().await;
    ServeExit::Interrupted
}
