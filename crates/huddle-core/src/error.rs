use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Already known")]
    AlreadyKnown,

    #[error("Key conflict at index {index}")]
    KeyConflict { index: u32 },

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Short error code string, stable across releases for log scraping.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidArgument(_) => "INVALID_ARGUMENT",
            CoreError::AlreadyKnown => "ALREADY_KNOWN",
            CoreError::KeyConflict { .. } => "KEY_CONFLICT",
            CoreError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
