//! Conference-call controller.
//!
//! Drives the call state machine for one conversation: SFT selection and
//! join, ordering contests between concurrent starts, keygenerator duties
//! (session-key generation, rotation and distribution), decrypt liveness,
//! keepalive and reconnect, video-stream subscriptions, and MLS epoch keys.
//!
//! The controller itself is synchronous and single-threaded; the host calls
//! into [`ConfCall`] from one event loop and drains [`CallEvent`]s after each
//! call. [`driver::run`] hosts a controller on a tokio task for hosts that
//! prefer a channel interface.

pub mod driver;
mod engine;
pub mod events;
mod handlers;
pub mod media;
pub mod state;
pub mod timers;

pub use engine::{ConfCall, RESOLUTION_HIGH, RESOLUTION_LOW};
pub use events::{CallEvent, CallMetrics};
pub use handlers::SFT_STATUS_NETWORK_ERROR;
pub use media::{
    MediaClose, MediaEvent, MediaMetrics, MediaSession, MediaSessionFactory, MediaSessionParams,
};
pub use state::CallState;
