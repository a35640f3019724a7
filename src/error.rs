use thiserror::Error;

/// Errores de una llamada REST a un nodo
#[derive(Debug, Error)]
pub enum RestError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("node responded with status {0}")]
    Status(u16),
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node has no session id yet")]
    NoSession,
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("invalid header value: {0}")]
    InvalidHeader(String),
    #[error("could not encode request: {0}")]
    Encode(serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("voice state not ready for playback")]
    VoiceNotReady,
    #[error("track has no playback payload")]
    MissingPayload,
    #[error("track failed to load")]
    LoadFailed,
    #[error(transparent)]
    Node(#[from] NodeError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client has not been started")]
    NotStarted,
    #[error("no connected node available")]
    NoNodeAvailable,
    #[error("guild id must not be zero")]
    InvalidGuild,
    #[error(transparent)]
    Node(#[from] NodeError),
}
