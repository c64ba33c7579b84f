use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors from relay clients and frame encoding.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Relay closed the connection before joining {topic}")]
    ClosedBeforeJoin { topic: String },

    #[error("Timed out waiting to join {topic}")]
    JoinTimeout { topic: String },
}
