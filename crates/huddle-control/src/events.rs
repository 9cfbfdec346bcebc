use huddle_core::{CallReason, ClientId, UserId, VideoState};
use huddle_roster::AudioLevel;
use huddle_signal::SignalMessage;

/// Call metrics accumulated over a call's lifetime and handed to the host
/// on close.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallMetrics {
    pub initiator: bool,
    pub duration_call_secs: u64,
    pub duration_active_secs: u64,
    pub packetloss_last: u32,
    pub packetloss_max: u32,
    pub rtt_last: u32,
    pub rtt_max: u32,
    pub reconnects_attempted: u32,
    pub reconnects_successful: u32,
    pub participants_max: u32,
    pub participants_audio_max: u32,
    pub participants_video_max: u32,
    pub participants_video_req: u32,
}

/// Core → host notifications, drained from the controller after every call
/// into it (or forwarded over a channel by the async driver).
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Someone else's call is ringing in this conversation.
    Incoming {
        userid: UserId,
        clientid: ClientId,
        msg_time: u64,
        video: bool,
        should_ring: bool,
    },
    /// The controller needs a fresh call configuration (TURN/SFT lists).
    RequestConfig,
    /// The controller needs a fresh SE client list.
    RequestClients,
    /// MLS hosts should advance the epoch (key is getting stale).
    RequestNewEpoch,
    /// The local answer is proceeding; ringing UIs can stop.
    Answered,
    MediaEstablished,
    AudioEstablished,
    DatachanEstablished,
    /// The call ended; the handle returns to idle.
    Closed {
        reason: CallReason,
        metrics: CallMetrics,
        msg_time: u64,
    },
    /// We left the call but it may still be ongoing for others.
    Leave { reason: CallReason, msg_time: u64 },
    GroupChanged,
    VstateChanged {
        userid: UserId,
        clientid: ClientId,
        state: VideoState,
    },
    AudioLevels { levels: Vec<AudioLevel> },
    Quality {
        userid: Option<UserId>,
        clientid: Option<ClientId>,
        rtt: i32,
        uploss: i32,
        downloss: i32,
        reconnecting: bool,
    },
    /// Deliver a signalling message to peers via the messaging backend.
    SendToPeers {
        msg: SignalMessage,
        /// Explicit targets; `None` means the whole conversation.
        targets: Option<Vec<(UserId, ClientId)>>,
        my_clients_only: bool,
        transient: bool,
    },
    /// Post a signalling message to an SFT over HTTPS; the response comes
    /// back through `sft_msg_recv`.
    SftRequest { url: String, msg: SignalMessage },
}
