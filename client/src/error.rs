use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Wire status 401; routed to the coordinator's auth-error handler
    /// instead of surfacing on snapshots.
    #[error("unauthorized")]
    Unauthorized,

    /// Transport-level failure; mutations are queued and retried when the
    /// connection returns.
    #[error("network error: {0}")]
    Network(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("unknown id: {0}")]
    NotFound(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("live query destroyed")]
    Destroyed,
}

impl ClientError {
    pub fn is_auth(&self) -> bool { matches!(self, ClientError::Unauthorized) }

    /// Network failures are retried; everything else is surfaced.
    pub fn is_retryable(&self) -> bool { matches!(self, ClientError::Network(_)) }
}
