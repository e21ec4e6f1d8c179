use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use stagewatch_core::error::{Result, StageError};
use stagewatch_core::traits::EventTransport;
use stagewatch_core::types::{StatusEvent, TransportItem};

/// In-process transport: whatever is sent through its [`ChannelSender`]
/// reaches the session as if it came off the wire.
pub struct ChannelTransport {
    rx: Mutex<Option<mpsc::Receiver<TransportItem>>>,
}

/// Producer half of a [`ChannelTransport`]. Dropping every sender ends the feed.
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<TransportItem>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, ChannelSender) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            ChannelSender { tx },
        )
    }
}

impl EventTransport for ChannelTransport {
    fn name(&self) -> &str {
        "channel"
    }

    fn start(
        &self,
        tx: mpsc::Sender<TransportItem>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        let rx = self.rx.lock().take();
        Box::pin(async move {
            let Some(mut rx) = rx else {
                return Err(StageError::TransportDisconnected(
                    "channel transport already started".into(),
                ));
            };
            loop {
                let item = tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    item = rx.recv() => item,
                };
                let Some(item) = item else {
                    return Ok(());
                };
                if tx.send(item).await.is_err() {
                    return Ok(());
                }
            }
        })
    }
}

impl ChannelSender {
    /// Send one status event. Fails once the transport side is gone.
    pub async fn send(&self, event: StatusEvent) -> Result<()> {
        self.push(TransportItem::Event(event)).await
    }

    /// Send a raw JSON payload, validated the way a network transport would.
    pub async fn send_raw(&self, payload: &str) -> Result<()> {
        let item = match StatusEvent::from_json(payload) {
            Ok(event) => TransportItem::Event(event),
            Err(e) => TransportItem::Rejected(e),
        };
        self.push(item).await
    }

    /// Simulate a dropped connection followed by a reconnect.
    pub async fn bounce(&self, reason: &str) -> Result<()> {
        self.push(TransportItem::Disconnected {
            reason: reason.to_string(),
        })
        .await?;
        self.push(TransportItem::Reconnected).await
    }

    async fn push(&self, item: TransportItem) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| StageError::TransportDisconnected("channel closed".into()))
    }
}
