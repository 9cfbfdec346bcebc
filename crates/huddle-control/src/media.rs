use std::collections::BTreeMap;

use huddle_core::{CallType, ClientId, ConvId, IceServer, IdHash, UserId, VideoState};
use huddle_roster::AudioLevel;
use huddle_signal::SignalMessage;

/// Why the media session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClose {
    /// Orderly local or remote teardown.
    Normal,
    /// ICE restart wanted; reconnect without tearing down state.
    IceRestart,
    /// Transport lost; reconnect and notify the host.
    NotConnected,
    /// Unrecoverable media failure.
    Failed,
}

/// Parameters for creating a media session toward the SFT.
#[derive(Debug, Clone)]
pub struct MediaSessionParams {
    pub convid: ConvId,
    pub sessid: IdHash,
    pub userid_hash: IdHash,
    pub clientid_hash: IdHash,
    pub clientid_real: ClientId,
    pub call_type: CallType,
    pub is_mls: bool,
    pub turn_servers: Vec<IceServer>,
    pub quality_interval_ms: u64,
}

/// The media-session capability the controller drives (the 1:1 call engine
/// wrapped around ICE/DTLS/SRTP and the data channel).
///
/// The session holds no back-reference; everything it needs to tell the
/// controller arrives as a [`MediaEvent`] fed into the engine by the host.
pub trait MediaSession: Send {
    /// Route an inbound `SETUP`/`UPDATE` from the SFT into the session.
    /// A returned message (the answer) must be posted back to the SFT.
    fn recv_message(&mut self, msg: &SignalMessage) -> Option<SignalMessage>;

    /// Send a payload over the established data channel.
    fn send_data(&mut self, payload: &str);

    fn set_sessid(&mut self, sessid: &IdHash);
    fn update_ssrc(&mut self, ssrca: u32, ssrcv: u32);

    fn add_decoder(
        &mut self,
        userid: &UserId,
        clientid: &ClientId,
        userid_hash: &IdHash,
        ssrca: u32,
        ssrcv: u32,
    );
    fn remove_decoder(&mut self, userid: &UserId, clientid: &ClientId, ssrca: u32, ssrcv: u32);
    fn sync_decoders(&mut self);

    fn set_video_send_state(&mut self, state: VideoState);
    fn set_local_prop(&mut self, key: &str, value: &str);
    /// Push local props to the remote side over the data channel.
    fn sync_props(&mut self);
    /// Re-advertise the local mute state.
    fn update_mute(&mut self);

    fn media_start(&mut self);
    fn media_stop(&mut self);
    fn ping(&mut self);
    fn set_quality_interval(&mut self, interval_ms: u64);
    fn restart(&mut self, call_type: CallType);
    fn activate(&mut self, active: bool);
    fn end(&mut self);
}

/// Creates media sessions on demand; the controller owns the session, the
/// factory seam keeps the transport stack out of this crate.
pub trait MediaSessionFactory: Send {
    fn create(&mut self, params: MediaSessionParams) -> Box<dyn MediaSession>;
}

impl<F> MediaSessionFactory for F
where
    F: FnMut(MediaSessionParams) -> Box<dyn MediaSession> + Send,
{
    fn create(&mut self, params: MediaSessionParams) -> Box<dyn MediaSession> {
        self(params)
    }
}

/// Media-session callbacks, marshalled back into the engine by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    DatachanEstablished,
    MediaEstablished,
    AudioEstablished,
    PingResponse,
    Closed {
        error: MediaClose,
        msg_time: u64,
        metrics: Option<MediaMetrics>,
    },
    /// Remote props update received over the data channel.
    Propsync {
        userid_hash: IdHash,
        clientid_hash: IdHash,
        props: BTreeMap<String, String>,
    },
    /// Conference-level message (CONFPART) received over the data channel.
    ConfMessage(SignalMessage),
    AudioLevels(Vec<AudioLevel>),
    Quality {
        rtt: i32,
        uploss: i32,
        downloss: i32,
    },
}

/// Transport metrics reported by a closing media session.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MediaMetrics {
    pub duration_secs: u64,
    pub packetloss_last: u32,
    pub packetloss_max: u32,
    pub rtt_last: u32,
    pub rtt_max: u32,
}
