use serde::{Deserialize, Serialize};

use huddle_core::IdHash;

use crate::payloads::{
    ConfCheck, ConfConn, ConfKey, ConfPart, ConfStart, ConfStreams, Propsync, Setup, StreamInfo,
};

/// Protocol version carried by every message.
pub const WIRE_VERSION: &str = "3.0";

/// Message envelope shared by every signalling payload.
///
/// Wire: `{ "version": "3.0", "type": "CONFSTART", "sessid": "...",
///          "src_userid": "...", "src_clientid": "...", "resp": false,
///          "age": 0, ... payload fields ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub version: String,
    /// Session id of the sender: the conversation hash for conference
    /// traffic, so SFTs and peers key on it without learning the real id.
    #[serde(rename = "sessid", default)]
    pub sessid_sender: IdHash,
    pub src_userid: String,
    pub src_clientid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_userid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_clientid: Option<String>,
    /// False for a request, true for a response.
    #[serde(default)]
    pub resp: bool,
    /// Transient messages may be dropped by the backend for offline clients.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
    /// Age in seconds, stamped by the delivery path.
    #[serde(default)]
    pub age: u64,
    /// Original send time in ms, stamped by the delivery path.
    #[serde(default)]
    pub time: u64,
    #[serde(flatten)]
    pub payload: Payload,
}

/// Every message type in the conference protocol, tagged by the wire `type`
/// discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    #[serde(rename = "CONFCONN")]
    ConfConn(ConfConn),
    #[serde(rename = "SETUP")]
    Setup(Setup),
    #[serde(rename = "UPDATE")]
    Update(Setup),
    #[serde(rename = "CONFSTART")]
    ConfStart(ConfStart),
    #[serde(rename = "CONFCHECK")]
    ConfCheck(ConfCheck),
    #[serde(rename = "CONFPART")]
    ConfPart(ConfPart),
    #[serde(rename = "CONFKEY")]
    ConfKey(ConfKey),
    #[serde(rename = "CONFSTREAMS")]
    ConfStreams(ConfStreams),
    #[serde(rename = "CONFEND")]
    ConfEnd,
    #[serde(rename = "REJECT")]
    Reject,
    #[serde(rename = "PROPSYNC")]
    Propsync(Propsync),
}

impl Payload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::ConfConn(_) => "CONFCONN",
            Payload::Setup(_) => "SETUP",
            Payload::Update(_) => "UPDATE",
            Payload::ConfStart(_) => "CONFSTART",
            Payload::ConfCheck(_) => "CONFCHECK",
            Payload::ConfPart(_) => "CONFPART",
            Payload::ConfKey(_) => "CONFKEY",
            Payload::ConfStreams(_) => "CONFSTREAMS",
            Payload::ConfEnd => "CONFEND",
            Payload::Reject => "REJECT",
            Payload::Propsync(_) => "PROPSYNC",
        }
    }
}

impl SignalMessage {
    /// Build a message with empty addressing; callers fill in routing.
    pub fn new(payload: Payload) -> Self {
        Self {
            version: WIRE_VERSION.to_string(),
            sessid_sender: IdHash::default(),
            src_userid: String::new(),
            src_clientid: String::new(),
            dest_userid: None,
            dest_clientid: None,
            resp: false,
            transient: false,
            age: 0,
            time: 0,
            payload,
        }
    }

    pub fn response(payload: Payload) -> Self {
        let mut msg = Self::new(payload);
        msg.resp = true;
        msg
    }

    pub fn is_request(&self) -> bool {
        !self.resp
    }

    /// `CONFSTREAMS` convenience used by the controller's video path.
    pub fn conf_streams(streaml: Vec<StreamInfo>) -> Self {
        Self::new(Payload::ConfStreams(ConfStreams {
            mode: "list".to_string(),
            streaml,
        }))
    }
}
