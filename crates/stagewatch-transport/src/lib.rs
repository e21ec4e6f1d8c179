pub mod channel;
pub mod file;
pub mod http;
pub mod sse;
pub mod streaming;

use std::sync::Arc;
use std::time::Duration;

use stagewatch_core::config::AppConfig;
use stagewatch_core::error::{Result, StageError};
use stagewatch_core::traits::{EventTransport, ResyncSource, SnapshotLoader};

pub use channel::{ChannelSender, ChannelTransport};
pub use file::{FileLayoutLoader, StaticLayoutLoader};
pub use http::{HttpLayoutLoader, HttpResyncSource};
pub use sse::SseTransport;

/// Create the layout loader named by the config. A file wins over a URL.
pub fn create_loader(config: &AppConfig) -> Result<Arc<dyn SnapshotLoader>> {
    let source = &config.source;
    if let Some(path) = &source.layout_file {
        return Ok(Arc::new(FileLayoutLoader::new(path)));
    }
    match &source.layout_url {
        Some(url) => Ok(Arc::new(HttpLayoutLoader::new(
            url,
            Duration::from_secs(source.request_timeout_secs),
        ))),
        None => Err(StageError::Config(
            "no layout source: set source.layout_url or source.layout_file".into(),
        )),
    }
}

/// Create the SSE transport named by the config.
pub fn create_transport(config: &AppConfig) -> Result<Arc<dyn EventTransport>> {
    match &config.source.events_url {
        Some(url) => Ok(Arc::new(SseTransport::new(
            url,
            config.transport.clone(),
            Duration::from_secs(config.source.request_timeout_secs),
        ))),
        None => Err(StageError::Config(
            "no event source: set source.events_url".into(),
        )),
    }
}

/// Create the resync source, if one is configured.
pub fn create_resync(config: &AppConfig) -> Option<Arc<dyn ResyncSource>> {
    config.source.resync_url.as_ref().map(|url| {
        Arc::new(HttpResyncSource::new(
            url,
            Duration::from_secs(config.source.request_timeout_secs),
        )) as Arc<dyn ResyncSource>
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_prefers_file() {
        let mut config = AppConfig::default();
        config.source.layout_url = Some("http://localhost/layout".into());
        config.source.layout_file = Some("layout.json".into());
        assert_eq!(create_loader(&config).unwrap().name(), "file");

        config.source.layout_file = None;
        assert_eq!(create_loader(&config).unwrap().name(), "http");
    }

    #[test]
    fn missing_sources_are_config_errors() {
        let config = AppConfig::default();
        assert!(matches!(create_loader(&config), Err(StageError::Config(_))));
        assert!(matches!(create_transport(&config), Err(StageError::Config(_))));
        assert!(create_resync(&config).is_none());
    }
}
