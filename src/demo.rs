//! Simulated run of the built-in agent pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use stagewatch_core::error::Result;
use stagewatch_core::traits::ResyncSource;
use stagewatch_core::types::{Graph, Outcome, Status, StatusEvent, StatusReport};
use stagewatch_transport::ChannelSender;

pub struct DemoOptions {
    /// Time each stage spends running.
    pub step: Duration,
    /// Stage that ends in failure; later stages never start.
    pub fail: Option<String>,
    /// Drop the events around the third stage and reconnect, so the
    /// session has to resync to catch up.
    pub outage: bool,
}

/// The pipeline being simulated. Also answers resyncs with what really
/// happened, including events the outage swallowed.
pub struct DemoPipeline {
    graph: Graph,
    truth: Mutex<HashMap<String, StatusReport>>,
    sequence: AtomicU64,
}

impl DemoPipeline {
    pub fn new() -> Self {
        Self {
            graph: Graph::agent_pipeline(),
            truth: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn graph(&self) -> Graph {
        self.graph.clone()
    }

    /// Record `event` as having happened and stamp it.
    fn record(&self, event: StatusEvent) -> StatusEvent {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let status = match event.kind {
            stagewatch_core::types::EventKind::Start => Status::Running,
            stagewatch_core::types::EventKind::End => event.terminal_status(),
        };
        self.truth.lock().insert(
            event.node_id.clone(),
            StatusReport {
                node_id: event.node_id.clone(),
                status,
                sequence: Some(sequence),
                timestamp: Some(timestamp),
            },
        );
        event.with_sequence(sequence).with_timestamp(timestamp)
    }

    /// Drive one run through `sender` until it finishes or `shutdown` fires.
    pub async fn run(
        &self,
        sender: ChannelSender,
        options: DemoOptions,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let stages: Vec<String> = self.graph.nodes.iter().map(|n| n.id.clone()).collect();
        let mut swallow_start = false;

        for (i, stage) in stages.iter().enumerate() {
            if swallow_start {
                swallow_start = false;
            } else {
                let start = self.record(StatusEvent::start(stage.as_str()));
                sender.send(start).await?;
            }
            if !pause(options.step, &shutdown).await {
                return Ok(());
            }

            let failed = options.fail.as_deref() == Some(stage.as_str());
            let outcome = if failed { Outcome::Failure } else { Outcome::Success };
            let end = self.record(StatusEvent::end(stage.as_str()).with_outcome(outcome));

            if options.outage && !failed && i == 2 && i + 1 < stages.len() {
                // This end and the next start both happen while disconnected
                let next = stages[i + 1].as_str();
                self.record(StatusEvent::start(next));
                debug!(node = %stage, next, "Events lost in outage");
                swallow_start = true;
                if !pause(options.step / 4, &shutdown).await {
                    return Ok(());
                }
                sender.bounce("simulated outage").await?;
            } else {
                sender.send(end).await?;
            }

            if failed {
                info!(node = %stage, "Demo run failed");
                return Ok(());
            }
        }
        info!("Demo run complete");
        Ok(())
    }
}

impl Default for DemoPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ResyncSource for DemoPipeline {
    fn fetch_statuses(&self) -> BoxFuture<'_, Result<Vec<StatusReport>>> {
        let reports: Vec<StatusReport> = self.truth.lock().values().cloned().collect();
        Box::pin(async move { Ok(reports) })
    }
}

/// Sleep unless shut down first. Returns false on shutdown.
async fn pause(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
