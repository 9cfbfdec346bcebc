use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeystoreError {
    /// The index is already installed with the same key bytes. Callers
    /// usually treat this as success.
    #[error("Key index already installed")]
    AlreadyKnown,

    #[error("Key index {index} conflicts with existing key material")]
    KeyConflict { index: u32 },

    #[error("Key index {index} not above the highest known index {max}")]
    IndexTooLow { index: u32, max: u32 },

    #[error("Stale key index {index}, current is {current}")]
    StaleIndex { index: u32, current: u32 },

    #[error("Invalid key length {0}")]
    InvalidKeyLength(usize),

    #[error("No key installed")]
    NoKey,
}

pub type Result<T> = std::result::Result<T, KeystoreError>;
