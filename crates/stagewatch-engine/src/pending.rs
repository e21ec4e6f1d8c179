use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use stagewatch_core::types::StatusEvent;

/// What happened to an event handed to [`PendingBuffer::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingPush {
    /// First event held for this node.
    Buffered,
    /// Replaced the event already held for this node.
    Superseded,
    /// Dropped: the held event carries a higher or equal sequence.
    Ignored,
    /// Buffered after evicting the oldest node to stay within capacity.
    Evicted(String),
}

/// Events for nodes that are not (yet) part of the topology.
///
/// Holds at most one event per node (the latest one) and at most
/// `max_nodes` nodes; the node buffered first is evicted first.
pub struct PendingBuffer {
    max_nodes: usize,
    events: HashMap<String, StatusEvent>,
    order: VecDeque<String>,
}

impl PendingBuffer {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            max_nodes: max_nodes.max(1),
            events: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn push(&mut self, event: StatusEvent) -> PendingPush {
        if let Some(held) = self.events.get_mut(&event.node_id) {
            if let (Some(new_seq), Some(held_seq)) = (event.sequence, held.sequence) {
                if new_seq <= held_seq {
                    debug!(
                        node = %event.node_id,
                        sequence = new_seq,
                        held = held_seq,
                        "Pending event older than held one, dropped"
                    );
                    return PendingPush::Ignored;
                }
            }
            *held = event;
            return PendingPush::Superseded;
        }

        let mut outcome = PendingPush::Buffered;
        if self.events.len() >= self.max_nodes {
            if let Some(oldest) = self.order.pop_front() {
                self.events.remove(&oldest);
                warn!(
                    node = %oldest,
                    capacity = self.max_nodes,
                    "Pending buffer full, evicted oldest node"
                );
                outcome = PendingPush::Evicted(oldest);
            }
        }
        self.order.push_back(event.node_id.clone());
        self.events.insert(event.node_id.clone(), event);
        outcome
    }

    /// Remove and return, in buffering order, the events whose node
    /// satisfies `known`.
    pub fn drain_where<F>(&mut self, mut known: F) -> Vec<StatusEvent>
    where
        F: FnMut(&str) -> bool,
    {
        let mut drained = Vec::new();
        let mut kept = VecDeque::with_capacity(self.order.len());
        for node_id in self.order.drain(..) {
            if known(&node_id) {
                if let Some(event) = self.events.remove(&node_id) {
                    drained.push(event);
                }
            } else {
                kept.push_back(node_id);
            }
        }
        self.order = kept;
        drained
    }

    /// Drop everything. Returns how many events were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.events.len();
        self.events.clear();
        self.order.clear();
        n
    }

    pub fn get(&self, node_id: &str) -> Option<&StatusEvent> {
        self.events.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagewatch_core::types::EventKind;

    #[test]
    fn last_event_wins() {
        let mut buf = PendingBuffer::new(8);
        assert_eq!(buf.push(StatusEvent::start("x")), PendingPush::Buffered);
        assert_eq!(buf.push(StatusEvent::end("x")), PendingPush::Superseded);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.get("x").unwrap().kind, EventKind::End);
    }

    #[test]
    fn lower_sequence_does_not_supersede() {
        let mut buf = PendingBuffer::new(8);
        buf.push(StatusEvent::end("x").with_sequence(5));
        assert_eq!(
            buf.push(StatusEvent::start("x").with_sequence(3)),
            PendingPush::Ignored
        );
        assert_eq!(buf.get("x").unwrap().kind, EventKind::End);
    }

    #[test]
    fn evicts_oldest_node_when_full() {
        let mut buf = PendingBuffer::new(2);
        buf.push(StatusEvent::start("a"));
        buf.push(StatusEvent::start("b"));
        assert_eq!(
            buf.push(StatusEvent::start("c")),
            PendingPush::Evicted("a".into())
        );
        assert!(buf.get("a").is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn drain_keeps_unknown_nodes_in_order() {
        let mut buf = PendingBuffer::new(8);
        buf.push(StatusEvent::start("a"));
        buf.push(StatusEvent::start("ghost"));
        buf.push(StatusEvent::start("b"));

        let drained = buf.drain_where(|id| id != "ghost");
        let ids: Vec<_> = drained.iter().map(|e| e.node_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(buf.len(), 1);
        assert!(buf.get("ghost").is_some());
        assert_eq!(buf.clear(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_capacity_still_holds_one() {
        let mut buf = PendingBuffer::new(0);
        buf.push(StatusEvent::start("a"));
        assert_eq!(buf.len(), 1);
    }
}
