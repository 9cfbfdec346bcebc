//! Session media-key store.
//!
//! Holds at most two adjacent indexed session keys, **current** (used to
//! decrypt) and **next** (pre-distributed so peers can switch atomically),
//! together with the HKDF salt used to derive per-member media keys, and the
//! decrypt liveness flags the controller's recovery timer inspects.
//!
//! Mutation happens on the call event loop; the media layer reads
//! concurrently through the internal mutex and registers a listener to
//! re-derive SRTP contexts when the current key changes.

mod error;
mod store;

pub use error::{KeystoreError, Result};
pub use store::{KeyStore, ListenerId};
