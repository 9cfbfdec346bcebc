pub mod config;
pub mod context;
pub mod error;
pub mod hash;
pub mod types;

pub use config::{CallConfig, IceServer, SftServer};
pub use context::MediaSystemContext;
pub use error::{CoreError, Result};
pub use types::{
    AudioState, CallReason, CallType, ClientId, ConvId, ConvType, IdHash, MutedState, UserId,
    VideoState,
};
