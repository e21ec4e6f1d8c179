use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use stagewatch_core::config::GatewayConfig;
use stagewatch_core::event::EventBus;
use stagewatch_core::types::SessionEvent;
use stagewatch_engine::GraphStateStore;

use crate::routes;
use crate::state::AppState;

/// Read-only HTTP gateway over one inspection session, built on axum.
///
/// Session events are tracked from construction on, so build the server
/// before starting the session that publishes on `event_bus`.
pub struct GatewayServer {
    state: Arc<AppState>,
    layout_events: Mutex<Option<broadcast::Receiver<SessionEvent>>>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        store: Arc<GraphStateStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let layout_events = event_bus.subscribe();
        Self {
            state: Arc::new(AppState {
                config,
                store,
                event_bus,
                layout_error: RwLock::new(None),
            }),
            layout_events: Mutex::new(Some(layout_events)),
        }
    }

    pub(crate) fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(routes::health))
            .route("/api/state", get(routes::current_state))
            .route("/api/state/stream", get(routes::state_stream))
            .route("/api/nodes/{id}", get(routes::node_detail))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let rx = self
            .layout_events
            .lock()
            .take()
            .unwrap_or_else(|| self.state.event_bus.subscribe());
        let tracker = tokio::spawn(track_layout_errors(
            self.state.clone(),
            rx,
            shutdown.child_token(),
        ));

        let listener = TcpListener::bind(&self.state.config.bind).await?;
        info!(bind = %self.state.config.bind, "Gateway listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        tracker.abort();
        info!("Gateway shut down");
        Ok(())
    }
}

/// Keep the latest layout failure around for the 503 body.
async fn track_layout_errors(
    state: Arc<AppState>,
    mut rx: broadcast::Receiver<SessionEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let evt = tokio::select! {
            _ = shutdown.cancelled() => return,
            evt = rx.recv() => evt,
        };
        match evt {
            Ok(SessionEvent::LayoutUnavailable { reason, .. }) => {
                *state.layout_error.write() = Some(reason);
            }
            Ok(SessionEvent::LayoutLoaded { .. }) => {
                *state.layout_error.write() = None;
            }
            Ok(SessionEvent::Closed) | Err(RecvError::Closed) => return,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use stagewatch_core::types::{Graph, Status};
    use tower::ServiceExt;

    fn server() -> GatewayServer {
        GatewayServer::new(
            GatewayConfig::default(),
            Arc::new(GraphStateStore::new()),
            Arc::new(EventBus::default()),
        )
    }

    async fn get_json(server: &GatewayServer, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = server
            .router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (status, body) = get_json(&server(), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["version"].is_string());
    }

    #[tokio::test]
    async fn state_is_503_before_layout() {
        let server = server();
        *server.state.layout_error.write() = Some("HTTP 502".into());

        let (status, body) = get_json(&server, "/api/state").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "graph unavailable");
        assert_eq!(body["reason"], "HTTP 502");
    }

    #[tokio::test]
    async fn state_serves_live_statuses() {
        let server = server();
        server.state.store.initialize(Graph::agent_pipeline()).unwrap();
        server.state.store.apply_status("plan", Status::Running).unwrap();

        let (status, body) = get_json(&server, "/api/state").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["generation"], 1);
        assert_eq!(body["nodes"][0]["id"], "plan");
        assert_eq!(body["nodes"][0]["status"], "running");
        assert_eq!(body["edges"].as_array().unwrap().len(), 4);
        assert!(body.get("visibility_gap").is_none());
    }

    #[tokio::test]
    async fn node_detail_lists_upstream() {
        let server = server();
        server.state.store.initialize(Graph::agent_pipeline()).unwrap();

        let (status, body) = get_json(&server, "/api/nodes/retrieve").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node"]["status"], "idle");
        assert_eq!(body["upstream"], serde_json::json!(["prioritise"]));

        let (status, _) = get_json(&server, "/api/nodes/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn layout_error_published_before_run_is_kept() {
        let server = GatewayServer::new(
            GatewayConfig {
                bind: "127.0.0.1:0".into(),
            },
            Arc::new(GraphStateStore::new()),
            Arc::new(EventBus::default()),
        );
        server.state.event_bus.publish(SessionEvent::LayoutUnavailable {
            reason: "HTTP 502".into(),
            attempt: 1,
        });

        let shutdown = CancellationToken::new();
        let server = Arc::new(server);
        let running = server.clone();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { running.run(token).await });

        for _ in 0..50 {
            if server.state.layout_error.read().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let (status, body) = get_json(&server, "/api/state").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["reason"], "HTTP 502");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn state_stream_sends_current_then_newer_states() {
        let server = server();
        let store = server.state.store.clone();
        store.initialize(Graph::agent_pipeline()).unwrap();
        store.apply_status("plan", Status::Running).unwrap();

        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .uri("/api/state/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // A repeat of the initial generation, then two newer ones
        let bus = &server.state.event_bus;
        bus.publish(SessionEvent::StateChanged(store.current_state().unwrap()));
        store.apply_status("plan", Status::Succeeded).unwrap();
        bus.publish(SessionEvent::StateChanged(store.current_state().unwrap()));
        store.apply_status("execute", Status::Running).unwrap();
        bus.publish(SessionEvent::StateChanged(store.current_state().unwrap()));
        bus.publish(SessionEvent::Closed);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        let mut ids = Vec::new();
        let mut first_data = None;
        for block in text.split("\n\n").filter(|b| !b.trim().is_empty()) {
            for line in block.lines() {
                if let Some(id) = line.strip_prefix("id:") {
                    ids.push(id.trim().parse::<u64>().unwrap());
                }
                if let Some(data) = line.strip_prefix("data:") {
                    first_data.get_or_insert_with(|| data.trim().to_string());
                }
            }
        }
        assert_eq!(ids, vec![1, 2, 3]);
        let first: serde_json::Value = serde_json::from_str(&first_data.unwrap()).unwrap();
        assert_eq!(first["generation"], 1);
        assert_eq!(first["nodes"][0]["status"], "running");
    }

    #[tokio::test]
    async fn tracker_records_and_clears_layout_errors() {
        let server = server();
        let shutdown = CancellationToken::new();
        let rx = server.state.event_bus.subscribe();
        let task = tokio::spawn(track_layout_errors(server.state.clone(), rx, shutdown.clone()));

        server.state.event_bus.publish(SessionEvent::LayoutUnavailable {
            reason: "connection refused".into(),
            attempt: 1,
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            server.state.layout_error.read().as_deref(),
            Some("connection refused")
        );

        server.state.event_bus.publish(SessionEvent::Closed);
        task.await.unwrap();
    }
}
