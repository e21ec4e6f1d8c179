use std::path::PathBuf;

use futures::future::BoxFuture;
use tracing::debug;

use stagewatch_core::error::{Result, StageError};
use stagewatch_core::traits::SnapshotLoader;
use stagewatch_core::types::Graph;

use crate::http::parse_layout;

/// Reads the layout snapshot from a JSON file on every fetch.
pub struct FileLayoutLoader {
    path: PathBuf,
}

impl FileLayoutLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotLoader for FileLayoutLoader {
    fn name(&self) -> &str {
        "file"
    }

    fn fetch_layout(&self) -> BoxFuture<'_, Result<Graph>> {
        Box::pin(async move {
            let body = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
                StageError::LayoutUnavailable(format!("{}: {}", self.path.display(), e))
            })?;
            debug!(path = %self.path.display(), bytes = body.len(), "Layout file read");
            parse_layout(&body)
        })
    }
}

/// Serves a layout held in memory.
pub struct StaticLayoutLoader {
    graph: Graph,
}

impl StaticLayoutLoader {
    pub fn new(graph: Graph) -> Self {
        Self { graph }
    }
}

impl SnapshotLoader for StaticLayoutLoader {
    fn name(&self) -> &str {
        "static"
    }

    fn fetch_layout(&self) -> BoxFuture<'_, Result<Graph>> {
        let graph = self.graph.clone();
        Box::pin(async move { Ok(graph) })
    }
}
