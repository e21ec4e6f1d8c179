use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StageError};

/// Unique inspection session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    /// First eight characters, for status lines and log fields.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution status of a pipeline stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Position along the Idle → Running → Terminal lifecycle.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed => 2,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Layout position of a node. Computed upstream, stored as given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Display label. Falls back to the id when the layout leaves it empty.
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub status: Status,
}

impl Node {
    pub fn new(id: impl Into<String>, label: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            position,
            status: Status::Idle,
        }
    }

    /// Label to draw: the layout label, or the id when none was given.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

/// A directed dependency between two stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Topology delivered by a layout snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Check the load-time invariants: unique non-empty ids and edges whose
    /// endpoints are both in the node set. Cycles are not checked.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(StageError::InvalidLayout("node with empty id".into()));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(StageError::InvalidLayout(format!(
                    "duplicate node id: {}",
                    node.id
                )));
            }
        }
        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(StageError::InvalidLayout(format!(
                        "edge {} -> {} references unknown node {}",
                        edge.source, edge.target, endpoint
                    )));
                }
            }
        }
        Ok(())
    }

    /// The five-stage agent pipeline, laid out left to right.
    pub fn agent_pipeline() -> Self {
        let stages = ["plan", "prioritise", "retrieve", "execute", "respond"];
        let nodes = stages
            .iter()
            .enumerate()
            .map(|(i, id)| Node::new(*id, *id, Position::new(i as f64 * 150.0, 0.0)))
            .collect();
        let edges = stages
            .windows(2)
            .enumerate()
            .map(|(i, pair)| Edge {
                id: Some(format!("e{}", i + 1)),
                source: pair[0].to_string(),
                target: pair[1].to_string(),
            })
            .collect();
        Self { nodes, edges }
    }
}

/// Direction of a status signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    End,
}

/// Outcome attached to an `end` signal when the producer can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[serde(alias = "succeeded", alias = "ok")]
    Success,
    #[serde(alias = "failed", alias = "error")]
    Failure,
}

/// A transition signal for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub node_id: String,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

/// Wire shape before validation. Every field is optional so that a missing
/// field becomes a precise rejection instead of a generic parse error.
#[derive(Deserialize)]
struct RawStatusEvent {
    #[serde(default, rename = "nodeId", alias = "node", alias = "node_id")]
    node_id: Option<String>,
    #[serde(default, alias = "event")]
    kind: Option<String>,
    #[serde(default)]
    sequence: Option<u64>,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    outcome: Option<Outcome>,
}

impl StatusEvent {
    pub fn start(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            kind: EventKind::Start,
            sequence: None,
            timestamp: None,
            outcome: None,
        }
    }

    pub fn end(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            kind: EventKind::End,
            sequence: None,
            timestamp: None,
            outcome: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Terminal status an `end` signal resolves to.
    pub fn terminal_status(&self) -> Status {
        match self.outcome {
            Some(Outcome::Failure) => Status::Failed,
            _ => Status::Succeeded,
        }
    }

    /// Decode and validate one payload from the producer.
    ///
    /// Accepts `nodeId`/`kind` as well as the tracer's `node`/`event` field
    /// names. Anything without a node id or with an unrecognized kind is
    /// rejected as [`StageError::MalformedEvent`].
    pub fn from_json(payload: &str) -> Result<Self> {
        let raw: RawStatusEvent = serde_json::from_str(payload)
            .map_err(|e| StageError::malformed(format!("invalid payload: {}", e), payload))?;

        let node_id = match raw.node_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => return Err(StageError::malformed("missing nodeId", payload)),
        };

        let kind = match raw.kind.as_deref() {
            Some("start") => EventKind::Start,
            Some("end") => EventKind::End,
            Some(other) => {
                return Err(StageError::malformed(
                    format!("unrecognized kind `{}`", other),
                    payload,
                ))
            }
            None => return Err(StageError::malformed("missing kind", payload)),
        };

        Ok(Self {
            node_id,
            kind,
            sequence: raw.sequence,
            timestamp: raw.timestamp,
            outcome: raw.outcome,
        })
    }
}

/// Authoritative status of one node as reported by a resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(alias = "node")]
    pub node_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

/// Warning raised when the session may have missed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibilityGap {
    pub since: DateTime<Utc>,
    pub reason: String,
}

/// Outcome of applying a status to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedResult {
    Applied,
    UnknownNode,
}

/// Per-status node counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub idle: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Render-ready state: full topology with live statuses.
///
/// Every value is a complete replacement of the previous one; consumers never
/// need to merge.
#[derive(Debug, Clone, Serialize)]
pub struct GraphState {
    pub nodes: Vec<Node>,
    pub edges: Arc<[Edge]>,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility_gap: Option<VisibilityGap>,
    #[serde(skip)]
    index: Arc<HashMap<String, usize>>,
}

impl GraphState {
    pub fn new(
        nodes: Vec<Node>,
        edges: Arc<[Edge]>,
        index: Arc<HashMap<String, usize>>,
        generation: u64,
        visibility_gap: Option<VisibilityGap>,
    ) -> Self {
        Self {
            nodes,
            edges,
            generation,
            visibility_gap,
            index,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).and_then(|&i| self.nodes.get(i))
    }

    pub fn status(&self, id: &str) -> Option<Status> {
        self.node(id).map(|n| n.status)
    }

    pub fn has_visibility_gap(&self) -> bool {
        self.visibility_gap.is_some()
    }

    pub fn summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for node in &self.nodes {
            match node.status {
                Status::Idle => summary.idle += 1,
                Status::Running => summary.running += 1,
                Status::Succeeded => summary.succeeded += 1,
                Status::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Ids of the direct upstream dependencies of `id`.
    pub fn upstream_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.target == id)
            .map(|e| e.source.as_str())
            .collect()
    }
}

/// One item pushed by an event transport.
#[derive(Debug)]
pub enum TransportItem {
    /// A validated status event.
    Event(StatusEvent),
    /// A payload rejected at the boundary.
    Rejected(StageError),
    /// The connection dropped; the transport is reconnecting.
    Disconnected { reason: String },
    /// The connection was re-established after a drop.
    Reconnected,
}

/// Session event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new state was published by the store.
    StateChanged(Arc<GraphState>),
    /// The layout fetch failed; the session keeps retrying.
    LayoutUnavailable { reason: String, attempt: u32 },
    /// The layout was installed.
    LayoutLoaded { nodes: usize, edges: usize },
    /// A payload was rejected at the transport boundary.
    EventRejected { reason: String },
    /// The transport lost its connection.
    TransportDisconnected { reason: String },
    /// The transport reconnected.
    Reconnected,
    /// A resync finished.
    ResyncCompleted { applied: usize, skipped: usize },
    /// The session fell back to best effort after a reconnect.
    VisibilityGap { reason: String },
    /// The session is shutting down.
    Closed,
}
