//! Log stream client
//!
//! One WebSocket per connection attempt, with the bearer token passed
//! as a query parameter (the transport has no header channel). Every
//! inbound text message is one opaque log line, forwarded verbatim in
//! arrival order; no parsing, filtering or reordering. An unexpected
//! drop is retried with exponential backoff up to a bounded attempt
//! count; exhausting the attempts is terminal for this session's
//! stream.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{SessionEvent, StreamStatus};
use crate::auth::TokenSource;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(6);
        (self.base_delay * factor).min(Duration::from_secs(30))
    }
}

pub(crate) fn spawn(
    ws_base: String,
    node: String,
    container_id: String,
    tokens: Arc<dyn TokenSource>,
    generation: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
    retry: RetryPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let send_status = |status: StreamStatus| {
            let _ = events.send(SessionEvent::Stream { generation, status });
        };

        let mut attempt = 0u32;
        loop {
            // Read the credential fresh on every attempt; an absent
            // token is a precondition failure, not something to retry.
            let Some(token) = tokens.bearer_token() else {
                warn!("no bearer token available, log stream unavailable");
                send_status(StreamStatus::Disconnected);
                return;
            };
            let url = format!(
                "{}/ws/logs/{}/{}?token={}",
                ws_base, node, container_id, token
            );

            match connect_async(&url).await {
                Ok((mut socket, _response)) => {
                    attempt = 0;
                    debug!("log stream connected for container {}", container_id);
                    send_status(StreamStatus::Streaming);

                    while let Some(message) = socket.next().await {
                        match message {
                            Ok(Message::Text(line)) => {
                                let _ = events.send(SessionEvent::Line {
                                    generation,
                                    line: line.as_str().to_owned(),
                                });
                            }
                            Ok(Message::Close(_)) => {
                                debug!("log stream closed by server");
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("log stream error: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("log stream connect failed: {}", e);
                }
            }

            attempt += 1;
            if attempt > retry.max_attempts {
                send_status(StreamStatus::Disconnected);
                return;
            }
            send_status(StreamStatus::Reconnecting { attempt });
            tokio::time::sleep(retry.delay(attempt)).await;
        }
    })
}
