use serde::{Deserialize, Serialize};
use std::fmt;

/// Real user identifier as assigned by the messaging backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison; backend ids are UUIDs in mixed case.
    pub fn eq_ignore_case(&self, other: &UserId) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Device (client) identifier; one user may have several.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn eq_ignore_case(&self, other: &ClientId) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable conversation identifier (externally assigned).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvId(pub String);

impl ConvId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConvId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConvId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Keyed-hash identifier used on the wire instead of a real id, so call
/// traffic cannot be correlated by observers that do not hold the secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct IdHash(pub String);

impl IdHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn eq_ignore_case(&self, other: &IdHash) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for IdHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What kind of call the local user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    #[default]
    Normal,
    Video,
    ForcedAudio,
}

/// Conversation flavour; conference calls are the concern of this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvType {
    OneOnOne,
    Group,
    Conference,
    ConferenceMls,
}

impl ConvType {
    pub fn is_group_mode(&self) -> bool {
        !matches!(self, ConvType::OneOnOne)
    }
}

/// Per-participant video send state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoState {
    #[default]
    Stopped,
    Started,
    BadConn,
    Paused,
    ScreenShare,
}

impl VideoState {
    pub fn name(&self) -> &'static str {
        match self {
            VideoState::Stopped => "stopped",
            VideoState::Started => "started",
            VideoState::BadConn => "bad_conn",
            VideoState::Paused => "paused",
            VideoState::ScreenShare => "screenshare",
        }
    }
}

/// Per-participant audio path state as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioState {
    Connecting,
    Established,
}

/// Three-valued muted flag carried by SFT participant snapshots. `Unknown`
/// leaves the previously known value untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MutedState {
    #[default]
    Unknown,
    Muted,
    Unmuted,
}

/// Reason codes surfaced to the host when a call closes or is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallReason {
    Normal,
    Error,
    Timeout,
    LostMedia,
    Canceled,
    AnsweredElsewhere,
    IoError,
    StillOngoing,
    Rejected,
    OutdatedClient,
    AuthFailed,
    AuthFailedStart,
    NooneJoined,
    EveryoneLeft,
}

impl fmt::Display for CallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallReason::Normal => "normal",
            CallReason::Error => "error",
            CallReason::Timeout => "timeout",
            CallReason::LostMedia => "lost_media",
            CallReason::Canceled => "canceled",
            CallReason::AnsweredElsewhere => "answered_elsewhere",
            CallReason::IoError => "io_error",
            CallReason::StillOngoing => "still_ongoing",
            CallReason::Rejected => "rejected",
            CallReason::OutdatedClient => "outdated_client",
            CallReason::AuthFailed => "auth_failed",
            CallReason::AuthFailedStart => "auth_failed_start",
            CallReason::NooneJoined => "noone_joined",
            CallReason::EveryoneLeft => "everyone_left",
        };
        write!(f, "{s}")
    }
}
