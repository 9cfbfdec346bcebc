use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SignalError>;
