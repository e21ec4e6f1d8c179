use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stagewatch_core::config::{EngineConfig, RetryConfig};
use stagewatch_core::error::Result;
use stagewatch_core::event::EventBus;
use stagewatch_core::traits::{EventTransport, ResyncSource, SnapshotLoader};
use stagewatch_core::types::{GraphState, SessionEvent, SessionId, TransportItem};

use crate::reconcile::{EngineStats, ReconciliationEngine};
use crate::resync::{BackfillPolicy, ReconnectOutcome};
use crate::store::{GraphStateStore, Subscription};

/// Collaborators and settings for one session.
pub struct SessionOptions {
    pub loader: Arc<dyn SnapshotLoader>,
    pub transport: Arc<dyn EventTransport>,
    pub resync: Option<Arc<dyn ResyncSource>>,
    pub engine: EngineConfig,
    pub layout_retry: RetryConfig,
    pub store: Option<Arc<GraphStateStore>>,
    pub event_bus: Option<Arc<EventBus>>,
}

impl SessionOptions {
    pub fn new(loader: Arc<dyn SnapshotLoader>, transport: Arc<dyn EventTransport>) -> Self {
        Self {
            loader,
            transport,
            resync: None,
            engine: EngineConfig::default(),
            layout_retry: RetryConfig::default(),
            store: None,
            event_bus: None,
        }
    }

    pub fn with_resync(mut self, source: Arc<dyn ResyncSource>) -> Self {
        self.resync = Some(source);
        self
    }

    pub fn with_engine(mut self, config: EngineConfig) -> Self {
        self.engine = config;
        self
    }

    pub fn with_layout_retry(mut self, config: RetryConfig) -> Self {
        self.layout_retry = config;
        self
    }

    /// Use a store created by the caller. It must not be initialized yet.
    pub fn with_store(mut self, store: Arc<GraphStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish on a bus created by the caller, so subscribers can attach
    /// before the first layout attempt.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }
}

/// One live inspection of a pipeline.
///
/// Owns the store, the engine, the transport connection and the background
/// tasks feeding them. Tear it down with [`InspectionSession::shutdown`];
/// dropping it cancels the tasks without waiting for them. Sessions share
/// nothing, so several can run side by side.
pub struct InspectionSession {
    id: SessionId,
    store: Arc<GraphStateStore>,
    engine: Arc<ReconciliationEngine>,
    event_bus: Arc<EventBus>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    forward: Subscription,
}

impl InspectionSession {
    /// Start the layout fetch and the event pump. Must be called inside a
    /// tokio runtime.
    pub fn start(options: SessionOptions) -> Self {
        let id = SessionId::new();
        let store = options
            .store
            .clone()
            .unwrap_or_else(|| Arc::new(GraphStateStore::new()));
        let engine = Arc::new(ReconciliationEngine::new(store.clone(), &options.engine));
        let event_bus = options
            .event_bus
            .clone()
            .unwrap_or_else(|| Arc::new(EventBus::new(options.engine.bus_capacity)));
        let shutdown = CancellationToken::new();

        let bus = event_bus.clone();
        let forward = store.subscribe(move |state| {
            bus.publish(SessionEvent::StateChanged(state.clone()));
        });

        info!(
            session = id.short(),
            loader = options.loader.name(),
            transport = options.transport.name(),
            resync = options.resync.is_some(),
            "Inspection session starting"
        );

        let (tx, rx) = mpsc::channel(options.engine.event_buffer.max(1));
        let mut tasks = Vec::with_capacity(3);

        // Transport → channel
        let transport = options.transport.clone();
        let token = shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = transport.start(tx, token).await {
                error!(transport = transport.name(), error = %e, "Event transport stopped");
            }
        }));

        // Channel → engine
        tasks.push(tokio::spawn(pump_events(
            rx,
            engine.clone(),
            BackfillPolicy::new(options.resync.clone()),
            event_bus.clone(),
            shutdown.clone(),
        )));

        // Layout, retried until it arrives
        tasks.push(tokio::spawn(load_layout(
            options.loader.clone(),
            engine.clone(),
            options.layout_retry.clone(),
            event_bus.clone(),
            shutdown.clone(),
        )));

        Self {
            id,
            store,
            engine,
            event_bus,
            shutdown,
            tasks,
            forward,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn store(&self) -> &Arc<GraphStateStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_bus.subscribe()
    }

    /// Latest state, or `NotReady` while the layout is still missing.
    pub fn current_state(&self) -> Result<Arc<GraphState>> {
        self.store.current_state()
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    /// Token cancelled when the session shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the transport, wait for the background tasks and discard events
    /// still buffered for unknown nodes.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Session task ended abnormally");
                }
            }
        }
        let discarded = self.engine.discard_pending();
        self.forward.unsubscribe();
        self.event_bus.publish(SessionEvent::Closed);
        info!(session = self.id.short(), discarded, "Inspection session closed");
    }
}

impl Drop for InspectionSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn pump_events(
    mut rx: mpsc::Receiver<TransportItem>,
    engine: Arc<ReconciliationEngine>,
    policy: BackfillPolicy,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = rx.recv() => item,
        };
        let Some(item) = item else {
            info!("Event feed closed");
            break;
        };

        match item {
            TransportItem::Event(event) => {
                let node = event.node_id.clone();
                let disposition = engine.handle_event(event);
                debug!(node = %node, ?disposition, "Event handled");
            }
            TransportItem::Rejected(e) => {
                warn!(error = %e, "Rejected event payload");
                engine.record_rejected();
                bus.publish(SessionEvent::EventRejected {
                    reason: e.to_string(),
                });
            }
            TransportItem::Disconnected { reason } => {
                warn!(reason = %reason, "Event transport disconnected");
                bus.publish(SessionEvent::TransportDisconnected { reason });
            }
            TransportItem::Reconnected => {
                info!("Event transport reconnected");
                bus.publish(SessionEvent::Reconnected);
                let outcome = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    outcome = policy.on_reconnect(&engine) => outcome,
                };
                match outcome {
                    ReconnectOutcome::Resynced(summary) => {
                        bus.publish(SessionEvent::ResyncCompleted {
                            applied: summary.applied,
                            skipped: summary.skipped,
                        });
                    }
                    ReconnectOutcome::Degraded { reason } => {
                        bus.publish(SessionEvent::VisibilityGap { reason });
                    }
                }
            }
        }
    }
}

async fn load_layout(
    loader: Arc<dyn SnapshotLoader>,
    engine: Arc<ReconciliationEngine>,
    retry: RetryConfig,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
) {
    let mut failures: u32 = 0;
    loop {
        let fetched = tokio::select! {
            _ = shutdown.cancelled() => return,
            fetched = loader.fetch_layout() => fetched,
        };

        let error = match fetched.and_then(|graph| {
            let (nodes, edges) = (graph.nodes.len(), graph.edges.len());
            engine.install_layout(graph).map(|replayed| (nodes, edges, replayed))
        }) {
            Ok((nodes, edges, replayed)) => {
                info!(loader = loader.name(), nodes, edges, replayed, "Layout loaded");
                bus.publish(SessionEvent::LayoutLoaded { nodes, edges });
                return;
            }
            Err(e) => e,
        };

        failures += 1;
        warn!(loader = loader.name(), attempt = failures, error = %error, "Layout unavailable");
        bus.publish(SessionEvent::LayoutUnavailable {
            reason: error.to_string(),
            attempt: failures,
        });

        if retry.exhausted(failures) {
            error!(attempts = failures, "Giving up on layout; graph unavailable");
            return;
        }

        let backoff = retry.backoff(failures - 1);
        debug!(backoff_ms = backoff.as_millis() as u64, "Retrying layout fetch");
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagewatch_core::error::StageError;
    use stagewatch_core::types::Status;
    use stagewatch_test_utils::{
        chain, report, wait_for, MockLoader, MockResync, MockTransport,
    };

    fn fast_retry(max_retries: Option<u32>) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
        }
    }

    fn status_is(evt: &SessionEvent, node: &str, status: Status) -> bool {
        matches!(evt, SessionEvent::StateChanged(state) if state.status(node) == Some(status))
    }

    #[tokio::test]
    async fn event_before_layout_is_replayed() {
        let (transport, feed) = MockTransport::new();
        let loader = Arc::new(MockLoader::failing_then(2, chain(&["plan", "execute"])));
        feed.start("plan");

        let session = InspectionSession::start(
            SessionOptions::new(loader.clone(), Arc::new(transport))
                .with_layout_retry(fast_retry(None)),
        );
        let mut rx = session.subscribe();

        wait_for(&mut rx, |e| status_is(e, "plan", Status::Running)).await;
        assert_eq!(loader.calls(), 3);
        assert_eq!(
            session.current_state().unwrap().status("execute"),
            Some(Status::Idle)
        );
        session.shutdown().await;
    }

    #[tokio::test]
    async fn layout_unavailable_is_reported_each_attempt() {
        let (transport, _feed) = MockTransport::new();
        let session = InspectionSession::start(
            SessionOptions::new(Arc::new(MockLoader::always_failing()), Arc::new(transport))
                .with_layout_retry(fast_retry(Some(1))),
        );
        let mut rx = session.subscribe();

        wait_for(&mut rx, |e| {
            matches!(e, SessionEvent::LayoutUnavailable { attempt: 2, .. })
        })
        .await;
        assert!(matches!(session.current_state(), Err(StageError::NotReady)));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_payload_does_not_stop_the_feed() {
        let (transport, feed) = MockTransport::new();
        let session = InspectionSession::start(SessionOptions::new(
            Arc::new(MockLoader::ok(chain(&["a"]))),
            Arc::new(transport),
        ));
        let mut rx = session.subscribe();
        wait_for(&mut rx, |e| matches!(e, SessionEvent::LayoutLoaded { .. })).await;

        feed.raw("not json");
        feed.raw(r#"{"nodeId":"a","kind":"start"}"#);

        wait_for(&mut rx, |e| matches!(e, SessionEvent::EventRejected { .. })).await;
        wait_for(&mut rx, |e| status_is(e, "a", Status::Running)).await;
        assert_eq!(session.stats().rejected, 1);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_resyncs_from_source() {
        let (transport, feed) = MockTransport::new();
        let resync = Arc::new(MockResync::new(vec![report("a", Status::Succeeded, 7)]));
        let session = InspectionSession::start(
            SessionOptions::new(Arc::new(MockLoader::ok(chain(&["a", "b"]))), Arc::new(transport))
                .with_resync(resync.clone()),
        );
        let mut rx = session.subscribe();
        wait_for(&mut rx, |e| matches!(e, SessionEvent::LayoutLoaded { .. })).await;

        feed.start("a");
        feed.disconnect("connection reset");
        feed.reconnect();

        let done = wait_for(&mut rx, |e| matches!(e, SessionEvent::ResyncCompleted { .. })).await;
        assert!(matches!(
            done,
            SessionEvent::ResyncCompleted { applied: 1, skipped: 0 }
        ));
        assert_eq!(resync.calls(), 1);
        let state = session.current_state().unwrap();
        assert_eq!(state.status("a"), Some(Status::Succeeded));
        assert!(!state.has_visibility_gap());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_without_source_flags_gap() {
        let (transport, feed) = MockTransport::new();
        let session = InspectionSession::start(SessionOptions::new(
            Arc::new(MockLoader::ok(chain(&["a"]))),
            Arc::new(transport),
        ));
        let mut rx = session.subscribe();
        wait_for(&mut rx, |e| matches!(e, SessionEvent::LayoutLoaded { .. })).await;

        feed.start("a");
        feed.reconnect();

        wait_for(&mut rx, |e| matches!(e, SessionEvent::VisibilityGap { .. })).await;
        let state = session.current_state().unwrap();
        assert!(state.has_visibility_gap());
        assert_eq!(state.status("a"), Some(Status::Running));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_discards_pending_and_closes() {
        let (transport, feed) = MockTransport::new();
        let session = InspectionSession::start(SessionOptions::new(
            Arc::new(MockLoader::ok(chain(&["a"]))),
            Arc::new(transport),
        ));
        let engine = session.engine().clone();
        let mut rx = session.subscribe();
        wait_for(&mut rx, |e| matches!(e, SessionEvent::LayoutLoaded { .. })).await;

        feed.start("ghost");
        feed.raw("{}");
        wait_for(&mut rx, |e| matches!(e, SessionEvent::EventRejected { .. })).await;
        assert_eq!(engine.pending_len(), 1);

        session.shutdown().await;
        assert_eq!(engine.pending_len(), 0);
        wait_for(&mut rx, |e| matches!(e, SessionEvent::Closed)).await;
    }

    #[tokio::test]
    async fn shutdown_interrupts_slow_resync() {
        let (transport, feed) = MockTransport::new();
        let resync = Arc::new(MockResync::hanging());
        let session = InspectionSession::start(
            SessionOptions::new(Arc::new(MockLoader::ok(chain(&["a"]))), Arc::new(transport))
                .with_resync(resync.clone()),
        );
        let mut rx = session.subscribe();
        wait_for(&mut rx, |e| matches!(e, SessionEvent::LayoutLoaded { .. })).await;

        feed.reconnect();
        wait_for(&mut rx, |e| matches!(e, SessionEvent::Reconnected)).await;
        assert_eq!(resync.calls(), 1);

        tokio::time::timeout(std::time::Duration::from_secs(1), session.shutdown())
            .await
            .expect("shutdown waits on the resync");
    }

    #[tokio::test]
    async fn caller_supplied_bus_sees_first_layout_failure() {
        let bus = Arc::new(EventBus::new(16));
        let store = Arc::new(GraphStateStore::new());
        let mut rx = bus.subscribe();
        let (transport, _feed) = MockTransport::new();

        let session = InspectionSession::start(
            SessionOptions::new(
                Arc::new(MockLoader::failing_then(1, chain(&["a"]))),
                Arc::new(transport),
            )
            .with_layout_retry(fast_retry(None))
            .with_store(store.clone())
            .with_event_bus(bus.clone()),
        );

        let first = wait_for(&mut rx, |e| matches!(e, SessionEvent::LayoutUnavailable { .. })).await;
        assert!(matches!(first, SessionEvent::LayoutUnavailable { attempt: 1, .. }));
        wait_for(&mut rx, |e| matches!(e, SessionEvent::LayoutLoaded { .. })).await;
        assert!(Arc::ptr_eq(session.store(), &store));
        assert!(store.is_initialized());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let (t1, f1) = MockTransport::new();
        let (t2, _f2) = MockTransport::new();
        let s1 = InspectionSession::start(SessionOptions::new(
            Arc::new(MockLoader::ok(chain(&["a"]))),
            Arc::new(t1),
        ));
        let s2 = InspectionSession::start(SessionOptions::new(
            Arc::new(MockLoader::ok(chain(&["a"]))),
            Arc::new(t2),
        ));
        let mut rx1 = s1.subscribe();
        let mut rx2 = s2.subscribe();
        wait_for(&mut rx1, |e| matches!(e, SessionEvent::LayoutLoaded { .. })).await;
        wait_for(&mut rx2, |e| matches!(e, SessionEvent::LayoutLoaded { .. })).await;

        f1.start("a");
        wait_for(&mut rx1, |e| status_is(e, "a", Status::Running)).await;
        assert_eq!(s2.current_state().unwrap().status("a"), Some(Status::Idle));
        assert_ne!(s1.id(), s2.id());
        s1.shutdown().await;
        s2.shutdown().await;
    }
}
