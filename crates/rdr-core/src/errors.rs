use crate::domain::UserId;

/// Core error type for both services.
///
/// Adapter crates map their specific errors into this type so the services
/// can handle failures consistently (status event vs redelivery vs log).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("auth data expired for user {0}")]
    AuthDataExpired(UserId),

    #[error("no live session for user {0}")]
    ClientNotFound(UserId),

    #[error("chat client error: {0}")]
    ProtocolClient(String),

    #[error("record not found: {0}")]
    DatabaseNotFound(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
