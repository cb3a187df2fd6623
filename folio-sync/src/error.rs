use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid channel url")]
    Url(#[from] url::ParseError),
    #[error("token request failed")]
    Token(#[from] reqwest::Error),
    #[error("websocket transport error")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed annotation message")]
    Decode(#[from] serde_json::Error),
    #[error("connection unavailable: {0}")]
    Unavailable(String),
}
