use std::sync::Arc;

use parking_lot::RwLock;

use stagewatch_core::config::GatewayConfig;
use stagewatch_core::event::EventBus;
use stagewatch_engine::GraphStateStore;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub store: Arc<GraphStateStore>,
    pub event_bus: Arc<EventBus>,
    /// Reason of the latest failed layout fetch, for the 503 body.
    pub layout_error: RwLock<Option<String>>,
}
