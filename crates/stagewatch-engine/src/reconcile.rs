//! Turns raw status events into store mutations.
//!
//! Every node follows the same lifecycle regardless of global event order:
//!
//! | current  | start   | end      |
//! |----------|---------|----------|
//! | Idle     | Running | Terminal |
//! | Running  | -       | Terminal |
//! | Terminal | -       | -        |
//!
//! `-` is a no-op. Replays, duplicates and late events therefore never move a
//! node backwards. Events carrying a `sequence` additionally pass a per-node
//! monotonic filter, which makes the merge idempotent under redelivery.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use stagewatch_core::config::EngineConfig;
use stagewatch_core::error::{Result, StageError};
use stagewatch_core::types::{
    AppliedResult, EventKind, Graph, GraphState, Status, StatusEvent, StatusReport, VisibilityGap,
};

use crate::pending::{PendingBuffer, PendingPush};
use crate::store::GraphStateStore;

/// Next status for `current` under `event`, or `None` when the event is a no-op.
pub fn transition(current: Status, event: &StatusEvent) -> Option<Status> {
    match (current, event.kind) {
        (Status::Idle, EventKind::Start) => Some(Status::Running),
        (Status::Idle | Status::Running, EventKind::End) => Some(event.terminal_status()),
        _ => None,
    }
}

/// How the engine disposed of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The transition was accepted and written to the store.
    Applied { from: Status, to: Status },
    /// Valid event that does not change the node (duplicate start, event
    /// after completion).
    NoOp,
    /// Sequence not greater than the last accepted one for this node.
    Stale,
    /// Node not in the topology (or no topology yet); held for later.
    Buffered,
}

/// Result of reconciling a resync against local state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub applied: usize,
    pub skipped: usize,
}

/// Counters for logs and status lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub applied: u64,
    pub noop: u64,
    pub stale: u64,
    pub buffered: u64,
    pub replayed: u64,
    pub rejected: u64,
    pub resyncs: u64,
}

struct EngineState {
    pending: PendingBuffer,
    last_sequence: HashMap<String, u64>,
    last_timestamp: HashMap<String, f64>,
    /// Gap raised before the layout arrived; applied on install.
    gap_pending: Option<VisibilityGap>,
    stats: EngineStats,
}

/// Merge, ordering and idempotency logic in front of a [`GraphStateStore`].
///
/// The engine's own lock is held across each read-modify-write of a node, so
/// two events for the same node never interleave.
pub struct ReconciliationEngine {
    store: Arc<GraphStateStore>,
    state: Mutex<EngineState>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<GraphStateStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            state: Mutex::new(EngineState {
                pending: PendingBuffer::new(config.max_pending_nodes),
                last_sequence: HashMap::new(),
                last_timestamp: HashMap::new(),
                gap_pending: None,
                stats: EngineStats::default(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<GraphStateStore> {
        &self.store
    }

    /// Install the layout and replay buffered events for nodes it contains.
    ///
    /// Returns the number of replayed events. Buffered events for nodes
    /// outside the topology stay buffered until the session ends.
    pub fn install_layout(&self, graph: Graph) -> Result<usize> {
        let mut st = self.state.lock();
        self.store.initialize(graph)?;

        if let Some(gap) = st.gap_pending.take() {
            self.store.set_visibility_gap(Some(gap))?;
        }

        let store = &self.store;
        let replay = st.pending.drain_where(|id| store.contains(id));
        let replayed = replay.len();
        for event in replay {
            let node = event.node_id.clone();
            let disposition = self.process(&mut st, event);
            debug!(node = %node, ?disposition, "Replayed buffered event");
        }
        st.stats.replayed += replayed as u64;

        if replayed > 0 || !st.pending.is_empty() {
            info!(
                replayed,
                still_pending = st.pending.len(),
                "Replayed buffered events after layout install"
            );
        }
        Ok(replayed)
    }

    /// Apply one validated event.
    pub fn handle_event(&self, event: StatusEvent) -> Disposition {
        let mut st = self.state.lock();
        self.process(&mut st, event)
    }

    /// Count a payload rejected at the transport boundary.
    pub fn record_rejected(&self) {
        self.state.lock().stats.rejected += 1;
    }

    fn process(&self, st: &mut EngineState, event: StatusEvent) -> Disposition {
        if let (Some(seq), Some(&last)) = (event.sequence, st.last_sequence.get(&event.node_id)) {
            if seq <= last {
                debug!(node = %event.node_id, sequence = seq, last, "Stale event discarded");
                st.stats.stale += 1;
                return Disposition::Stale;
            }
        }

        let current = match self.store.status_of(&event.node_id) {
            Ok(Some(status)) => status,
            Ok(None) | Err(_) => return self.buffer(st, event),
        };

        if let Some(seq) = event.sequence {
            st.last_sequence.insert(event.node_id.clone(), seq);
        }
        if let Some(ts) = event.timestamp {
            st.last_timestamp.insert(event.node_id.clone(), ts);
        }

        let Some(next) = transition(current, &event) else {
            debug!(node = %event.node_id, status = %current, kind = ?event.kind, "No-op event");
            st.stats.noop += 1;
            return Disposition::NoOp;
        };

        match self.store.apply_status(&event.node_id, next) {
            Ok(AppliedResult::Applied) => {
                st.stats.applied += 1;
                Disposition::Applied {
                    from: current,
                    to: next,
                }
            }
            // Topology is immutable once installed, so a node seen a moment
            // ago cannot vanish. Keep the event rather than lose it.
            Ok(AppliedResult::UnknownNode) | Err(_) => self.buffer(st, event),
        }
    }

    fn buffer(&self, st: &mut EngineState, event: StatusEvent) -> Disposition {
        let node = event.node_id.clone();
        match st.pending.push(event) {
            PendingPush::Ignored => {
                st.stats.stale += 1;
                Disposition::Stale
            }
            push => {
                debug!(node = %node, ?push, "Event buffered for unknown node");
                st.stats.buffered += 1;
                Disposition::Buffered
            }
        }
    }

    /// Reconcile an authoritative status list against local state.
    ///
    /// Last writer wins on sequence, then timestamp; a report without
    /// comparable ordering wins when it moves the node forward. A node never
    /// moves backwards, so Terminal is never overwritten by Running. A terminal
    /// report that is ordered after local state may swap one terminal status
    /// for another, which is how a bare `end` assumed to be Succeeded gets
    /// corrected to Failed.
    pub fn apply_resync(&self, reports: Vec<StatusReport>) -> Result<ResyncSummary> {
        let mut st = self.state.lock();
        if !self.store.is_initialized() {
            return Err(StageError::NotReady);
        }

        let mut summary = ResyncSummary::default();
        for report in reports {
            let Some(current) = self.store.status_of(&report.node_id)? else {
                debug!(node = %report.node_id, "Resync report for unknown node ignored");
                summary.skipped += 1;
                continue;
            };

            let local_seq = st.last_sequence.get(&report.node_id).copied();
            let local_ts = st.last_timestamp.get(&report.node_id).copied();
            let newer = is_newer(&report, local_seq, local_ts);

            if newer {
                if let Some(seq) = report.sequence {
                    st.last_sequence.insert(report.node_id.clone(), seq);
                }
                if let Some(ts) = report.timestamp {
                    st.last_timestamp.insert(report.node_id.clone(), ts);
                }
            }

            let corrects_outcome = ordered(&report, local_seq, local_ts)
                && current.is_terminal()
                && report.status.is_terminal()
                && report.status != current;
            if newer && (report.status.rank() > current.rank() || corrects_outcome) {
                self.store.apply_status(&report.node_id, report.status)?;
                st.stats.applied += 1;
                summary.applied += 1;
                debug!(
                    node = %report.node_id,
                    from = %current,
                    to = %report.status,
                    "Resync advanced node"
                );
            } else {
                summary.skipped += 1;
            }
        }

        st.stats.resyncs += 1;
        info!(applied = summary.applied, skipped = summary.skipped, "Resync reconciled");
        Ok(summary)
    }

    /// Flag that events may have been missed. Before the layout arrives the
    /// flag is held and raised on install.
    pub fn mark_visibility_gap(&self, reason: impl Into<String>) {
        let gap = VisibilityGap {
            since: Utc::now(),
            reason: reason.into(),
        };
        let mut st = self.state.lock();
        warn!(reason = %gap.reason, "Visibility gap: showing last known status");
        match self.store.set_visibility_gap(Some(gap.clone())) {
            Ok(_) => {}
            Err(_) => {
                if st.gap_pending.is_none() {
                    st.gap_pending = Some(gap);
                }
            }
        }
    }

    pub fn clear_visibility_gap(&self) {
        let mut st = self.state.lock();
        st.gap_pending = None;
        if let Ok(true) = self.store.set_visibility_gap(None) {
            info!("Visibility gap closed");
        }
    }

    /// Drop every buffered event. Returns how many were discarded.
    pub fn discard_pending(&self) -> usize {
        self.state.lock().pending.clear()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.state.lock().stats
    }

    pub fn current_state(&self) -> Result<Arc<GraphState>> {
        self.store.current_state()
    }
}

/// Whether a report is at least as recent as what the engine last accepted.
fn ordered(report: &StatusReport, local_seq: Option<u64>, local_ts: Option<f64>) -> bool {
    (report.sequence.is_some() && local_seq.is_some())
        || (report.timestamp.is_some() && local_ts.is_some())
}

fn is_newer(report: &StatusReport, local_seq: Option<u64>, local_ts: Option<f64>) -> bool {
    if let (Some(remote), Some(local)) = (report.sequence, local_seq) {
        return remote > local;
    }
    if let (Some(remote), Some(local)) = (report.timestamp, local_ts) {
        return remote > local;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagewatch_core::types::{Edge, Node, Outcome, Position};

    fn graph(ids: &[&str]) -> Graph {
        let nodes = ids
            .iter()
            .map(|id| Node::new(*id, *id, Position::default()))
            .collect();
        let edges = ids.windows(2).map(|w| Edge::new(w[0], w[1])).collect();
        Graph::new(nodes, edges)
    }

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::new(Arc::new(GraphStateStore::new()), &EngineConfig::default())
    }

    fn report(node: &str, status: Status, sequence: Option<u64>) -> StatusReport {
        StatusReport {
            node_id: node.into(),
            status,
            sequence,
            timestamp: None,
        }
    }

    #[test]
    fn transition_table() {
        let start = StatusEvent::start("n");
        let end = StatusEvent::end("n");
        let failed = StatusEvent::end("n").with_outcome(Outcome::Failure);

        assert_eq!(transition(Status::Idle, &start), Some(Status::Running));
        assert_eq!(transition(Status::Idle, &end), Some(Status::Succeeded));
        assert_eq!(transition(Status::Running, &end), Some(Status::Succeeded));
        assert_eq!(transition(Status::Running, &failed), Some(Status::Failed));
        assert_eq!(transition(Status::Running, &start), None);
        for terminal in [Status::Succeeded, Status::Failed] {
            assert_eq!(transition(terminal, &start), None);
            assert_eq!(transition(terminal, &end), None);
        }
    }

    #[test]
    fn start_then_end() {
        let engine = engine();
        engine.install_layout(graph(&["a"])).unwrap();

        assert_eq!(
            engine.handle_event(StatusEvent::start("a")),
            Disposition::Applied {
                from: Status::Idle,
                to: Status::Running
            }
        );
        assert_eq!(
            engine.handle_event(StatusEvent::end("a")),
            Disposition::Applied {
                from: Status::Running,
                to: Status::Succeeded
            }
        );
        assert_eq!(engine.handle_event(StatusEvent::start("a")), Disposition::NoOp);
        assert_eq!(
            engine.current_state().unwrap().status("a"),
            Some(Status::Succeeded)
        );
    }

    #[test]
    fn duplicate_event_is_idempotent() {
        let engine = engine();
        engine.install_layout(graph(&["a"])).unwrap();
        engine.handle_event(StatusEvent::start("a"));
        let before = engine.current_state().unwrap().generation;

        assert_eq!(engine.handle_event(StatusEvent::start("a")), Disposition::NoOp);
        assert_eq!(engine.current_state().unwrap().generation, before);
    }

    #[test]
    fn sequence_filter_discards_redelivery() {
        let engine = engine();
        engine.install_layout(graph(&["a"])).unwrap();
        engine.handle_event(StatusEvent::start("a").with_sequence(2));

        assert_eq!(
            engine.handle_event(StatusEvent::start("a").with_sequence(2)),
            Disposition::Stale
        );
        assert_eq!(
            engine.handle_event(StatusEvent::end("a").with_sequence(1)),
            Disposition::Stale
        );
        assert_eq!(
            engine.current_state().unwrap().status("a"),
            Some(Status::Running)
        );
        assert_eq!(engine.stats().stale, 2);
    }

    #[test]
    fn terminal_never_regresses() {
        let engine = engine();
        engine.install_layout(graph(&["a"])).unwrap();
        engine.handle_event(StatusEvent::end("a").with_outcome(Outcome::Failure));

        engine.handle_event(StatusEvent::start("a").with_sequence(100));
        engine.handle_event(StatusEvent::end("a").with_sequence(101));
        assert_eq!(engine.current_state().unwrap().status("a"), Some(Status::Failed));
    }

    #[test]
    fn event_before_layout_is_replayed() {
        let engine = engine();
        assert_eq!(engine.handle_event(StatusEvent::start("x")), Disposition::Buffered);
        assert_eq!(engine.pending_len(), 1);

        let replayed = engine.install_layout(graph(&["x", "y"])).unwrap();
        assert_eq!(replayed, 1);
        let state = engine.current_state().unwrap();
        assert_eq!(state.status("x"), Some(Status::Running));
        assert_eq!(state.status("y"), Some(Status::Idle));
        assert_eq!(engine.pending_len(), 0);
    }

    #[test]
    fn unknown_node_stays_buffered() {
        let engine = engine();
        engine.install_layout(graph(&["a"])).unwrap();
        assert_eq!(engine.handle_event(StatusEvent::start("ghost")), Disposition::Buffered);
        assert_eq!(engine.pending_len(), 1);
        assert_eq!(engine.current_state().unwrap().generation, 0);
        assert_eq!(engine.discard_pending(), 1);
    }

    #[test]
    fn second_layout_is_rejected() {
        let engine = engine();
        engine.install_layout(graph(&["a"])).unwrap();
        assert!(matches!(
            engine.install_layout(graph(&["b"])),
            Err(StageError::AlreadyInitialized)
        ));
    }

    #[test]
    fn resync_advances_stale_running() {
        let engine = engine();
        engine.install_layout(graph(&["a"])).unwrap();
        engine.handle_event(StatusEvent::start("a").with_sequence(1));

        let summary = engine
            .apply_resync(vec![report("a", Status::Succeeded, Some(2))])
            .unwrap();
        assert_eq!(summary, ResyncSummary { applied: 1, skipped: 0 });
        assert_eq!(
            engine.current_state().unwrap().status("a"),
            Some(Status::Succeeded)
        );
        // the late end from the old connection is now stale
        assert_eq!(
            engine.handle_event(StatusEvent::end("a").with_sequence(2)),
            Disposition::Stale
        );
    }

    #[test]
    fn resync_never_regresses_terminal() {
        let engine = engine();
        engine.install_layout(graph(&["a", "b"])).unwrap();
        engine.handle_event(StatusEvent::end("a").with_sequence(5));
        engine.handle_event(StatusEvent::start("b").with_sequence(5));

        let summary = engine
            .apply_resync(vec![
                report("a", Status::Running, Some(9)),
                report("b", Status::Succeeded, Some(4)),
                report("ghost", Status::Running, None),
            ])
            .unwrap();
        assert_eq!(summary, ResyncSummary { applied: 0, skipped: 3 });
        let state = engine.current_state().unwrap();
        assert_eq!(state.status("a"), Some(Status::Succeeded));
        assert_eq!(state.status("b"), Some(Status::Running));
    }

    #[test]
    fn resync_uses_timestamps_without_sequences() {
        let engine = engine();
        engine.install_layout(graph(&["a", "b"])).unwrap();
        engine.handle_event(StatusEvent::start("a").with_timestamp(10.0));
        engine.handle_event(StatusEvent::start("b").with_timestamp(10.0));

        let mut older = report("a", Status::Succeeded, None);
        older.timestamp = Some(5.0);
        let mut newer = report("b", Status::Failed, None);
        newer.timestamp = Some(20.0);

        let summary = engine.apply_resync(vec![older, newer]).unwrap();
        assert_eq!(summary.applied, 1);
        let state = engine.current_state().unwrap();
        assert_eq!(state.status("a"), Some(Status::Running));
        assert_eq!(state.status("b"), Some(Status::Failed));
    }

    #[test]
    fn resync_corrects_assumed_success() {
        let engine = engine();
        engine.install_layout(graph(&["a", "b"])).unwrap();
        engine.handle_event(StatusEvent::start("a").with_sequence(1));
        engine.handle_event(StatusEvent::end("a").with_sequence(2));
        engine.handle_event(StatusEvent::end("b").with_sequence(2));

        let summary = engine
            .apply_resync(vec![
                report("a", Status::Failed, Some(5)),
                report("b", Status::Failed, Some(1)),
            ])
            .unwrap();
        assert_eq!(summary, ResyncSummary { applied: 1, skipped: 1 });
        let state = engine.current_state().unwrap();
        assert_eq!(state.status("a"), Some(Status::Failed));
        assert_eq!(state.status("b"), Some(Status::Succeeded));
    }

    #[test]
    fn unordered_report_does_not_swap_terminal() {
        let engine = engine();
        engine.install_layout(graph(&["a"])).unwrap();
        engine.handle_event(StatusEvent::end("a").with_outcome(Outcome::Failure));

        let summary = engine
            .apply_resync(vec![report("a", Status::Succeeded, None)])
            .unwrap();
        assert_eq!(summary.applied, 0);
        assert_eq!(engine.current_state().unwrap().status("a"), Some(Status::Failed));
    }

    #[test]
    fn start_then_end_notifies_twice() {
        let store = Arc::new(GraphStateStore::new());
        let engine = ReconciliationEngine::new(store.clone(), &EngineConfig::default());
        engine.install_layout(graph(&["a"])).unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = store.subscribe(move |state| sink.lock().push(state.status("a")));

        engine.handle_event(StatusEvent::start("a"));
        engine.handle_event(StatusEvent::start("a"));
        engine.handle_event(StatusEvent::end("a"));
        engine.handle_event(StatusEvent::end("a"));

        assert_eq!(
            *seen.lock(),
            vec![Some(Status::Running), Some(Status::Succeeded)]
        );
    }

    fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn sequenced_delivery_order_does_not_matter() {
        let events = vec![
            StatusEvent::start("a").with_sequence(1),
            StatusEvent::end("a").with_sequence(2),
            StatusEvent::end("a").with_sequence(2),
            StatusEvent::start("b").with_sequence(1),
            StatusEvent::start("c").with_sequence(3),
            StatusEvent::end("c").with_sequence(4).with_outcome(Outcome::Failure),
        ];

        let orders = permutations(&events);
        assert_eq!(orders.len(), 720);
        for order in orders {
            let engine = engine();
            engine.install_layout(graph(&["a", "b", "c"])).unwrap();
            for event in order {
                engine.handle_event(event);
            }
            let state = engine.current_state().unwrap();
            assert_eq!(state.status("a"), Some(Status::Succeeded));
            assert_eq!(state.status("b"), Some(Status::Running));
            assert_eq!(state.status("c"), Some(Status::Failed));
        }
    }

    #[test]
    fn resync_before_layout_is_not_ready() {
        let engine = engine();
        assert!(matches!(
            engine.apply_resync(vec![report("a", Status::Running, None)]),
            Err(StageError::NotReady)
        ));
    }

    #[test]
    fn gap_raised_before_layout_applies_on_install() {
        let engine = engine();
        engine.mark_visibility_gap("reconnected without resync");
        engine.install_layout(graph(&["a"])).unwrap();
        let state = engine.current_state().unwrap();
        assert!(state.has_visibility_gap());
        assert_eq!(
            state.visibility_gap.as_ref().unwrap().reason,
            "reconnected without resync"
        );

        engine.clear_visibility_gap();
        assert!(!engine.current_state().unwrap().has_visibility_gap());
    }
}
