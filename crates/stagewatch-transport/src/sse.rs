//! Status events over a long-lived `text/event-stream` connection.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stagewatch_core::config::RetryConfig;
use stagewatch_core::error::{Result, StageError};
use stagewatch_core::traits::EventTransport;
use stagewatch_core::types::{StatusEvent, TransportItem};

use crate::streaming::{SseEvent, SseStream};

/// SSE event transport with capped exponential reconnect.
///
/// Each `data:` block is one status event. Keep-alive comments are skipped.
/// Blocks tagged with an `event:` type other than `message` or `status` are
/// ignored. A lost connection is reported once per outage as
/// [`TransportItem::Disconnected`] and, once a new connection is up, as
/// [`TransportItem::Reconnected`].
pub struct SseTransport {
    http: Client,
    url: String,
    retry: RetryConfig,
}

enum StreamEnd {
    Shutdown,
    ReceiverGone,
    Lost(String),
}

impl SseTransport {
    pub fn new(url: impl Into<String>, retry: RetryConfig, connect_timeout: Duration) -> Self {
        // No overall timeout: the response body never ends on its own.
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            url: url.into(),
            retry,
        }
    }

    async fn connect(
        &self,
    ) -> Result<SseStream<impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin>> {
        let response = self
            .http
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| StageError::TransportDisconnected(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StageError::TransportDisconnected(format!(
                "HTTP {}",
                response.status()
            )));
        }

        Ok(SseStream::new(response.bytes_stream()))
    }
}

impl EventTransport for SseTransport {
    fn name(&self) -> &str {
        "sse"
    }

    fn start(
        &self,
        tx: mpsc::Sender<TransportItem>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut failures: u32 = 0;
            let mut interrupted = false;

            loop {
                let connected = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Ok(()),
                    connected = self.connect() => connected,
                };

                let reason = match connected {
                    Ok(stream) => {
                        info!(url = %self.url, "Event stream connected");
                        if interrupted
                            && tx.send(TransportItem::Reconnected).await.is_err()
                        {
                            return Ok(());
                        }
                        interrupted = false;
                        failures = 0;
                        match forward(stream, &tx, &shutdown).await {
                            StreamEnd::Shutdown | StreamEnd::ReceiverGone => return Ok(()),
                            StreamEnd::Lost(reason) => reason,
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        e.to_string()
                    }
                };

                if !interrupted {
                    interrupted = true;
                    warn!(url = %self.url, reason = %reason, "Event stream lost");
                    if tx
                        .send(TransportItem::Disconnected {
                            reason: reason.clone(),
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }

                if self.retry.exhausted(failures) {
                    return Err(StageError::TransportDisconnected(format!(
                        "giving up after {} attempts: {}",
                        failures, reason
                    )));
                }

                let backoff = self.retry.backoff(failures.saturating_sub(1));
                debug!(
                    attempt = failures,
                    backoff_ms = backoff.as_millis() as u64,
                    "Reconnecting event stream"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        })
    }
}

async fn forward<S>(
    mut stream: SseStream<S>,
    tx: &mpsc::Sender<TransportItem>,
    shutdown: &CancellationToken,
) -> StreamEnd
where
    S: futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return StreamEnd::Shutdown,
            next = stream.next() => next,
        };
        let item = match next {
            Some(Ok(event)) => match to_item(&event) {
                Some(item) => item,
                None => continue,
            },
            Some(Err(e)) => return StreamEnd::Lost(e.to_string()),
            None => return StreamEnd::Lost("stream closed by server".into()),
        };
        if tx.send(item).await.is_err() {
            return StreamEnd::ReceiverGone;
        }
    }
}

/// Turn one SSE block into a transport item, or `None` for foreign event types.
pub fn to_item(event: &SseEvent) -> Option<TransportItem> {
    match event.event_type.as_deref() {
        None | Some("message") | Some("status") => {}
        Some(other) => {
            debug!(event_type = other, "Ignoring SSE event");
            return None;
        }
    }
    Some(match StatusEvent::from_json(&event.data) {
        Ok(status) => TransportItem::Event(status),
        Err(e) => TransportItem::Rejected(e),
    })
}
