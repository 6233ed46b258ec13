use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    InvalidBase64(base64::DecodeError),

    #[error("invalid length")]
    InvalidLength,

    #[error("frame has no data line")]
    MissingData,

    #[error("unknown event type: {0}")]
    UnknownEvent(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}
