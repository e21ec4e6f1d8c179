use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    // Store errors
    #[error("Graph already initialized for this session")]
    AlreadyInitialized,

    #[error("Graph not ready: layout has not been loaded")]
    NotReady,

    // Layout errors
    #[error("Layout unavailable: {0}")]
    LayoutUnavailable(String),

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    // Event errors
    #[error("Malformed event: {reason}")]
    MalformedEvent { reason: String, payload: String },

    // Transport errors
    #[error("Transport disconnected: {0}")]
    TransportDisconnected(String),

    #[error("Resync failed: {0}")]
    Resync(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),
}

impl StageError {
    pub fn malformed(reason: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::MalformedEvent {
            reason: reason.into(),
            payload: payload.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StageError>;
