use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::*;

/// Layout loader: one-shot fetch of the topology.
pub trait SnapshotLoader: Send + Sync + 'static {
    /// Loader name for logs (e.g., "http", "file").
    fn name(&self) -> &str;

    /// Fetch the complete node/edge set.
    /// Fails with `StageError::LayoutUnavailable` when no layout can be served.
    fn fetch_layout(&self) -> BoxFuture<'_, Result<Graph>>;
}

/// Event transport: long-lived push source of status events.
pub trait EventTransport: Send + Sync + 'static {
    /// Transport name for logs (e.g., "sse", "channel").
    fn name(&self) -> &str;

    /// Push items into `tx` until `shutdown` is cancelled or the receiver is
    /// dropped. Reconnects are handled inside and reported as
    /// `TransportItem::Disconnected` / `TransportItem::Reconnected`.
    fn start(
        &self,
        tx: mpsc::Sender<TransportItem>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'_, Result<()>>;
}

/// Resync source: full re-fetch of the current status of every node.
pub trait ResyncSource: Send + Sync + 'static {
    fn fetch_statuses(&self) -> BoxFuture<'_, Result<Vec<StatusReport>>>;
}
