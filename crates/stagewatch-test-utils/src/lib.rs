//! Fixtures and mock collaborators shared by the stagewatch test suites.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use stagewatch_core::error::{Result, StageError};
use stagewatch_core::traits::{EventTransport, ResyncSource, SnapshotLoader};
use stagewatch_core::types::{
    Edge, Graph, Node, Position, SessionEvent, Status, StatusEvent, StatusReport, TransportItem,
};

// ── Fixtures ────────────────────────────────────────────────────

/// A linear pipeline over `ids`, one stage per 150 units.
pub fn chain(ids: &[&str]) -> Graph {
    let nodes = ids
        .iter()
        .enumerate()
        .map(|(i, id)| Node::new(*id, *id, Position::new(i as f64 * 150.0, 0.0)))
        .collect();
    let edges = ids.windows(2).map(|w| Edge::new(w[0], w[1])).collect();
    Graph::new(nodes, edges)
}

pub fn report(node: &str, status: Status, sequence: u64) -> StatusReport {
    StatusReport {
        node_id: node.to_string(),
        status,
        sequence: Some(sequence),
        timestamp: None,
    }
}

/// Write `content` to a temp file that lives as long as the handle.
pub fn temp_file(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write temp file");
    tmp
}

/// Wait for the first bus event matching `pred`, failing after two seconds.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = tokio::time::sleep(Duration::from_secs(2));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => panic!("timed out waiting for session event"),
            evt = rx.recv() => match evt {
                Ok(evt) if pred(&evt) => return evt,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            },
        }
    }
}

/// Wait until a published state reaches `generation`.
pub async fn wait_for_generation(
    rx: &mut broadcast::Receiver<SessionEvent>,
    generation: u64,
) -> SessionEvent {
    wait_for(rx, |evt| {
        matches!(evt, SessionEvent::StateChanged(state) if state.generation >= generation)
    })
    .await
}

// ── Layout loader ───────────────────────────────────────────────

/// Loader answering from a script; the last answer repeats once the script
/// runs out.
pub struct MockLoader {
    script: Mutex<VecDeque<std::result::Result<Graph, String>>>,
    calls: AtomicUsize,
}

impl MockLoader {
    pub fn ok(graph: Graph) -> Self {
        Self::scripted(vec![Ok(graph)])
    }

    /// `failures` LayoutUnavailable answers, then `graph`.
    pub fn failing_then(failures: usize, graph: Graph) -> Self {
        let mut script: Vec<_> = (0..failures)
            .map(|i| Err(format!("upstream down ({})", i + 1)))
            .collect();
        script.push(Ok(graph));
        Self::scripted(script)
    }

    pub fn always_failing() -> Self {
        Self::scripted(vec![Err("upstream down".to_string())])
    }

    pub fn scripted(script: Vec<std::result::Result<Graph, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SnapshotLoader for MockLoader {
    fn name(&self) -> &str {
        "mock"
    }

    fn fetch_layout(&self) -> BoxFuture<'_, Result<Graph>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        Box::pin(async move {
            match answer {
                Some(Ok(graph)) => Ok(graph),
                Some(Err(reason)) => Err(StageError::LayoutUnavailable(reason)),
                None => Err(StageError::LayoutUnavailable("empty script".into())),
            }
        })
    }
}

// ── Event transport ─────────────────────────────────────────────

/// Transport fed by hand through a [`MockFeed`].
pub struct MockTransport {
    rx: Mutex<Option<mpsc::UnboundedReceiver<TransportItem>>>,
}

/// Producer side of a [`MockTransport`].
#[derive(Clone)]
pub struct MockFeed {
    tx: mpsc::UnboundedSender<TransportItem>,
}

impl MockTransport {
    pub fn new() -> (Self, MockFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            MockFeed { tx },
        )
    }
}

impl EventTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn start(
        &self,
        tx: mpsc::Sender<TransportItem>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        let rx = self.rx.lock().unwrap().take();
        Box::pin(async move {
            let Some(mut rx) = rx else {
                return Err(StageError::TransportDisconnected("already started".into()));
            };
            loop {
                let item = tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    item = rx.recv() => item,
                };
                match item {
                    Some(item) => {
                        if tx.send(item).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                }
            }
        })
    }
}

impl MockFeed {
    pub fn event(&self, event: StatusEvent) {
        let _ = self.tx.send(TransportItem::Event(event));
    }

    pub fn start(&self, node: &str) {
        self.event(StatusEvent::start(node));
    }

    pub fn end(&self, node: &str) {
        self.event(StatusEvent::end(node));
    }

    /// Push a raw payload through the same boundary check a real transport uses.
    pub fn raw(&self, payload: &str) {
        let item = match StatusEvent::from_json(payload) {
            Ok(event) => TransportItem::Event(event),
            Err(e) => TransportItem::Rejected(e),
        };
        let _ = self.tx.send(item);
    }

    pub fn disconnect(&self, reason: &str) {
        let _ = self.tx.send(TransportItem::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub fn reconnect(&self) {
        let _ = self.tx.send(TransportItem::Reconnected);
    }
}

// ── Resync source ───────────────────────────────────────────────

/// Resync source returning a fixed report list, or failing.
pub struct MockResync {
    reports: Mutex<Vec<StatusReport>>,
    fail: bool,
    hang: bool,
    calls: AtomicUsize,
}

impl MockResync {
    pub fn new(reports: Vec<StatusReport>) -> Self {
        Self {
            reports: Mutex::new(reports),
            fail: false,
            hang: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    /// Never answers.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn set_reports(&self, reports: Vec<StatusReport>) {
        *self.reports.lock().unwrap() = reports;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ResyncSource for MockResync {
    fn fetch_statuses(&self) -> BoxFuture<'_, Result<Vec<StatusReport>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            return Box::pin(futures::future::pending::<Result<Vec<StatusReport>>>());
        }
        let answer = if self.fail {
            Err(StageError::Resync("mock resync unavailable".into()))
        } else {
            Ok(self.reports.lock().unwrap().clone())
        };
        Box::pin(async move { answer })
    }
}
