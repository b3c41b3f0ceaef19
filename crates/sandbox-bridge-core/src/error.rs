use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Bridge not initialized")]
    NotInitialized,

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Missing context: {0}")]
    MissingContext(String),

    #[error("Remote failure: {0}")]
    RemoteFailure(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Request {request_id} timed out after {after_ms}ms")]
    Timeout { request_id: String, after_ms: u64 },

    #[error("Request {0} was cancelled")]
    Cancelled(String),

    #[error("Origin rejected: {0}")]
    OriginRejected(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Error ack decoded on the client side.
    #[error("{code}: {message}")]
    Remote { code: String, message: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// Stable code carried in the `code` field of error acks.
    pub fn code(&self) -> &str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::CapabilityUnavailable(_) => "capability_unavailable",
            Self::MissingContext(_) => "missing_context",
            Self::RemoteFailure(_) => "remote_failure",
            Self::UnknownMessageType(_) => "unknown_message_type",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::OriginRejected(_) => "origin_rejected",
            Self::ChannelClosed => "channel_closed",
            Self::InvalidParams(_) => "invalid_params",
            Self::Remote { code, .. } => code,
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Other(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
