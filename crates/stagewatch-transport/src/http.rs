use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use stagewatch_core::error::{Result, StageError};
use stagewatch_core::traits::{ResyncSource, SnapshotLoader};
use stagewatch_core::types::{Graph, StatusReport};

pub(crate) fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Fetches the layout snapshot with a single GET.
pub struct HttpLayoutLoader {
    http: Client,
    url: String,
}

impl HttpLayoutLoader {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: build_client(timeout),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl SnapshotLoader for HttpLayoutLoader {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch_layout(&self) -> BoxFuture<'_, Result<Graph>> {
        Box::pin(async move {
            debug!(url = %self.url, "Fetching layout");
            let response = self
                .http
                .get(&self.url)
                .send()
                .await
                .map_err(|e| StageError::LayoutUnavailable(format!("{}: {}", self.url, e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(StageError::LayoutUnavailable(format!(
                    "HTTP {}: {}",
                    status,
                    truncate(&body, 200)
                )));
            }

            let body = response
                .text()
                .await
                .map_err(|e| StageError::LayoutUnavailable(e.to_string()))?;
            parse_layout(&body)
        })
    }
}

/// Decode a layout body. Accepts the bare graph or one wrapped in `{"graph": ...}`.
pub fn parse_layout(body: &str) -> Result<Graph> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum LayoutBody {
        Bare(Graph),
        Wrapped { graph: Graph },
    }

    match serde_json::from_str::<LayoutBody>(body) {
        Ok(LayoutBody::Bare(graph)) | Ok(LayoutBody::Wrapped { graph }) => Ok(graph),
        Err(e) => Err(StageError::LayoutUnavailable(format!(
            "layout is not a graph: {}",
            e
        ))),
    }
}

/// Fetches the authoritative status of every node with a single GET.
pub struct HttpResyncSource {
    http: Client,
    url: String,
}

impl HttpResyncSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: build_client(timeout),
            url: url.into(),
        }
    }
}

impl ResyncSource for HttpResyncSource {
    fn fetch_statuses(&self) -> BoxFuture<'_, Result<Vec<StatusReport>>> {
        Box::pin(async move {
            let response = self
                .http
                .get(&self.url)
                .send()
                .await
                .map_err(|e| StageError::Resync(e.to_string()))?;

            if !response.status().is_success() {
                return Err(StageError::Resync(format!("HTTP {}", response.status())));
            }

            let body = response
                .text()
                .await
                .map_err(|e| StageError::Resync(e.to_string()))?;
            let reports = parse_statuses(&body)?;
            debug!(url = %self.url, reports = reports.len(), "Resync statuses fetched");
            Ok(reports)
        })
    }
}

/// Decode a resync body: a bare array or `{"statuses": [...]}`.
pub fn parse_statuses(body: &str) -> Result<Vec<StatusReport>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StatusBody {
        Bare(Vec<StatusReport>),
        Wrapped { statuses: Vec<StatusReport> },
    }

    match serde_json::from_str::<StatusBody>(body) {
        Ok(StatusBody::Bare(reports)) | Ok(StatusBody::Wrapped { statuses: reports }) => {
            Ok(reports)
        }
        Err(e) => Err(StageError::Resync(format!("invalid status list: {}", e))),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagewatch_core::types::Status;

    #[test]
    fn layout_bare_and_wrapped() {
        let bare = r#"{"nodes":[{"id":"a","label":"A","position":{"x":0,"y":0}}],"edges":[]}"#;
        let graph = parse_layout(bare).unwrap();
        assert_eq!(graph.nodes[0].label, "A");

        let wrapped = r#"{"graph":{"nodes":[{"id":"a"},{"id":"b"}],"edges":[{"source":"a","target":"b"}]}}"#;
        let graph = parse_layout(wrapped).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges[0].target, "b");
    }

    #[test]
    fn layout_garbage_is_unavailable() {
        let err = parse_layout("<html>502</html>").unwrap_err();
        assert!(matches!(err, StageError::LayoutUnavailable(_)));
    }

    #[test]
    fn statuses_bare_and_wrapped() {
        let bare = r#"[{"nodeId":"a","status":"running","sequence":4}]"#;
        let reports = parse_statuses(bare).unwrap();
        assert_eq!(reports[0].status, Status::Running);
        assert_eq!(reports[0].sequence, Some(4));

        let wrapped = r#"{"statuses":[{"node":"b","status":"failed"}]}"#;
        let reports = parse_statuses(wrapped).unwrap();
        assert_eq!(reports[0].node_id, "b");
        assert_eq!(reports[0].status, Status::Failed);
    }

    #[test]
    fn statuses_garbage_is_resync_error() {
        assert!(matches!(
            parse_statuses("{}"),
            Err(StageError::Resync(_))
        ));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[tokio::test]
    async fn unreachable_layout_is_unavailable() {
        let loader = HttpLayoutLoader::new("http://127.0.0.1:9/layout", Duration::from_secs(1));
        let err = loader.fetch_layout().await.unwrap_err();
        assert!(matches!(err, StageError::LayoutUnavailable(_)));
    }
}
