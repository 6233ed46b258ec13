use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    /// The store cannot be reached. Consumers degrade to in-process
    /// operation rather than failing correctness.
    #[error("kv unavailable: {0}")]
    Unavailable(String),

    #[error("kv storage error: {0}")]
    Storage(String),
}

impl From<sled::Error> for KvError {
    fn from(err: sled::Error) -> Self { KvError::Storage(err.to_string()) }
}
