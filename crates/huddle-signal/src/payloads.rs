use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use huddle_core::{IceServer, IdHash, MutedState};

/// Hex-encoded byte strings on the wire (secrets, entropy, key material).
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// SFT verdict on a join request, carried in the `CONFCONN` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConfConnStatus {
    #[default]
    Ok,
    RejectedBlacklist,
    RejectedAuthInvalid,
    RejectedAuthLimit,
    RejectedAuthExpired,
    RejectedAuthCantstart,
}

impl TryFrom<u8> for ConfConnStatus {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(ConfConnStatus::Ok),
            1 => Ok(ConfConnStatus::RejectedBlacklist),
            2 => Ok(ConfConnStatus::RejectedAuthInvalid),
            3 => Ok(ConfConnStatus::RejectedAuthLimit),
            4 => Ok(ConfConnStatus::RejectedAuthExpired),
            5 => Ok(ConfConnStatus::RejectedAuthCantstart),
            other => Err(format!("unknown confconn status: {other}")),
        }
    }
}

impl From<ConfConnStatus> for u8 {
    fn from(s: ConfConnStatus) -> u8 {
        match s {
            ConfConnStatus::Ok => 0,
            ConfConnStatus::RejectedBlacklist => 1,
            ConfConnStatus::RejectedAuthInvalid => 2,
            ConfConnStatus::RejectedAuthLimit => 3,
            ConfConnStatus::RejectedAuthExpired => 4,
            ConfConnStatus::RejectedAuthCantstart => 5,
        }
    }
}

/// Client → SFT join request (and the SFT's accept/reject response).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConfConn {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub turnv: Vec<IceServer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toolver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(default)]
    pub status: ConfConnStatus,
    /// Primary SFT of the call, so a secondary SFT can federate toward it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sft_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sft_tuple: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sft_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sft_credential: Option<String>,
    /// True when re-joining an established call (reconnect).
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub selective_audio: bool,
    #[serde(default)]
    pub selective_video: bool,
    #[serde(default)]
    pub vstreams: u32,
}

/// SFT → Client `SETUP` / `UPDATE` carrying the SDP offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setup {
    pub sdp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sft_tuple: Option<String>,
}

/// Peer ↔ Peer call announcement. The earliest `(timestamp, seqno)` wins the
/// ordering contest between concurrent starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfStart {
    pub timestamp: u64,
    pub seqno: u32,
    #[serde(with = "hex_bytes")]
    pub secret: Vec<u8>,
    pub sft_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sft_tuple: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sftl: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, String>,
}

/// Periodic keygenerator heartbeat; same ordering fields as `CONFSTART`
/// without the props.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfCheck {
    pub timestamp: u64,
    pub seqno: u32,
    #[serde(with = "hex_bytes")]
    pub secret: Vec<u8>,
    pub sft_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sft_tuple: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sftl: Vec<String>,
}

/// One member entry in an SFT participant snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartMember {
    pub userid: IdHash,
    pub clientid: IdHash,
    #[serde(default)]
    pub ssrca: u32,
    #[serde(default)]
    pub ssrcv: u32,
    /// Absent means unknown: the previously known value stands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub authorized: bool,
}

impl PartMember {
    pub fn muted_state(&self) -> MutedState {
        match self.muted {
            None => MutedState::Unknown,
            Some(true) => MutedState::Muted,
            Some(false) => MutedState::Unmuted,
        }
    }
}

/// SFT → Client participant snapshot, authoritative for media forwarding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfPart {
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub seqno: u32,
    /// SFT-contributed entropy mixed into session-key derivation.
    #[serde(default, with = "hex_bytes")]
    pub entropy: Vec<u8>,
    #[serde(default)]
    pub should_start: bool,
    #[serde(default)]
    pub partl: Vec<PartMember>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sftl: Vec<String>,
}

/// One indexed session key in a `CONFKEY` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub idx: u32,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

/// Peer ↔ Peer key share. Empty key list in a request, current (+ next) in a
/// response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConfKey {
    #[serde(default)]
    pub keyl: Vec<KeyEntry>,
}

/// One requested video stream in `CONFSTREAMS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub userid: IdHash,
    #[serde(default)]
    pub quality: u32,
}

/// Client → SFT video subscription list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfStreams {
    pub mode: String,
    #[serde(default)]
    pub streaml: Vec<StreamInfo>,
}

/// Datachannel property sync (`videosend`, `muted`, `keysync`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Propsync {
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

impl Propsync {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }
}
