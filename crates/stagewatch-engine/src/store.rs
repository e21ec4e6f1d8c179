use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use stagewatch_core::error::{Result, StageError};
use stagewatch_core::types::{
    AppliedResult, Edge, Graph, GraphState, Node, Status, VisibilityGap,
};

/// Callback invoked with every newly published state.
///
/// Listeners run on the writer's thread while the write lock is held. When
/// the store is driven by a `ReconciliationEngine`, the engine's lock is held
/// too. Neither lock is reentrant, so a listener that calls a mutating store
/// method or any engine method deadlocks. Reading
/// [`GraphStateStore::current_state`] from a listener is fine.
pub type Listener = dyn Fn(&Arc<GraphState>) + Send + Sync;

type ListenerList = Mutex<Vec<(u64, Arc<Listener>)>>;

struct Topology {
    edges: Arc<[Edge]>,
    index: Arc<HashMap<String, usize>>,
}

#[derive(Default)]
struct Inner {
    topology: Option<Topology>,
    nodes: Vec<Node>,
    generation: u64,
    visibility_gap: Option<VisibilityGap>,
}

impl Inner {
    fn snapshot(&self) -> Option<Arc<GraphState>> {
        let topology = self.topology.as_ref()?;
        Some(Arc::new(GraphState::new(
            self.nodes.clone(),
            topology.edges.clone(),
            topology.index.clone(),
            self.generation,
            self.visibility_gap.clone(),
        )))
    }
}

/// Authoritative graph and status map for one inspection session.
///
/// All mutations are serialized behind a single writer lock. The latest
/// published state is kept behind its own lock so readers never wait on a
/// writer that is busy notifying listeners.
pub struct GraphStateStore {
    inner: Mutex<Inner>,
    current: RwLock<Option<Arc<GraphState>>>,
    listeners: Arc<ListenerList>,
    next_listener_id: AtomicU64,
}

impl GraphStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            current: RwLock::new(None),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Install the topology. Every node starts Idle.
    ///
    /// The topology is load-once: a second call fails with
    /// `AlreadyInitialized`. An invalid graph fails with `InvalidLayout` and
    /// leaves the store uninitialized.
    pub fn initialize(&self, graph: Graph) -> Result<Arc<GraphState>> {
        let mut inner = self.inner.lock();
        if inner.topology.is_some() {
            warn!("Rejected second layout for an initialized store");
            return Err(StageError::AlreadyInitialized);
        }
        graph.validate()?;

        let Graph { nodes, edges } = graph;
        let mut index = HashMap::with_capacity(nodes.len());
        let nodes: Vec<Node> = nodes
            .into_iter()
            .enumerate()
            .map(|(i, mut node)| {
                index.insert(node.id.clone(), i);
                if node.label.is_empty() {
                    node.label = node.id.clone();
                }
                node.status = Status::Idle;
                node
            })
            .collect();

        info!(nodes = nodes.len(), edges = edges.len(), "Layout installed");
        inner.nodes = nodes;
        inner.topology = Some(Topology {
            edges: edges.into(),
            index: Arc::new(index),
        });

        let state = self.publish(&inner)?;
        Ok(state)
    }

    /// Set the status of a known node and bump the generation.
    ///
    /// Unknown ids return `AppliedResult::UnknownNode` without mutating
    /// anything. Before the layout is installed this fails with `NotReady`.
    pub fn apply_status(&self, node_id: &str, status: Status) -> Result<AppliedResult> {
        let mut inner = self.inner.lock();
        let idx = {
            let topology = inner.topology.as_ref().ok_or(StageError::NotReady)?;
            match topology.index.get(node_id) {
                Some(&idx) => idx,
                None => return Ok(AppliedResult::UnknownNode),
            }
        };

        let previous = inner.nodes[idx].status;
        inner.nodes[idx].status = status;
        inner.generation += 1;
        debug!(
            node = node_id,
            from = %previous,
            to = %status,
            generation = inner.generation,
            "Status applied"
        );

        self.publish(&inner)?;
        Ok(AppliedResult::Applied)
    }

    /// Raise or clear the visibility-gap warning.
    ///
    /// Raising while a gap is already open keeps the original one. Returns
    /// whether the state changed; a change bumps the generation and notifies.
    pub fn set_visibility_gap(&self, gap: Option<VisibilityGap>) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.topology.is_none() {
            return Err(StageError::NotReady);
        }
        let changed = match (&inner.visibility_gap, &gap) {
            (None, None) | (Some(_), Some(_)) => false,
            _ => true,
        };
        if !changed {
            return Ok(false);
        }

        inner.visibility_gap = gap;
        inner.generation += 1;
        self.publish(&inner)?;
        Ok(true)
    }

    /// The latest published state.
    pub fn current_state(&self) -> Result<Arc<GraphState>> {
        self.current.read().clone().ok_or(StageError::NotReady)
    }

    /// Current status of one node, `None` if the id is not in the topology.
    pub fn status_of(&self, node_id: &str) -> Result<Option<Status>> {
        let current = self.current.read();
        let state = current.as_ref().ok_or(StageError::NotReady)?;
        Ok(state.status(node_id))
    }

    pub fn is_initialized(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.current
            .read()
            .as_ref()
            .map(|s| s.node(node_id).is_some())
            .unwrap_or(false)
    }

    /// Register a listener called once per published state.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<GraphState>) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
            active: AtomicBool::new(true),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Store the new state and notify listeners. Called with the writer lock
    /// held so notifications are delivered in generation order.
    fn publish(&self, inner: &Inner) -> Result<Arc<GraphState>> {
        let state = inner.snapshot().ok_or(StageError::NotReady)?;
        *self.current.write() = Some(state.clone());

        let listeners: Vec<Arc<Listener>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&state);
        }
        Ok(state)
    }
}

impl Default for GraphStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`GraphStateStore::subscribe`].
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerList>,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the listener. Only the first call has an effect; it returns
    /// `true`, later calls return `false`.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().retain(|(id, _)| *id != self.id);
        }
        true
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}
