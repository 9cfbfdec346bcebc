use std::collections::VecDeque;
use std::sync::Arc;

use rand::RngCore;
use tracing::{debug, info, warn};

use huddle_core::config::{normalize_sft_url, sft_urls_equal, MAX_TURN_SERVERS, SESSION_KEY_LEN};
use huddle_core::{
    hash, AudioState, CallConfig, CallReason, CallType, ClientId, ConvId, CoreError, IceServer,
    IdHash, MediaSystemContext, Result, UserId, VideoState,
};
use huddle_keystore::{KeyStore, KeystoreError};
use huddle_roster::{MemberSnapshot, Roster};
use huddle_signal::{
    ConfCheck, ConfKey, ConfStart, KeyEntry, Payload, SignalMessage, StreamInfo,
};

use crate::events::{CallEvent, CallMetrics};
use crate::media::{MediaSession, MediaSessionFactory, MediaSessionParams};
use crate::state::CallState;
use crate::timers::{self, TimerKind, TimerTable};

/// Compiled-out resolution downgrade on poor link quality; kept as a guard
/// so the feature can be toggled without behaviour drift.
pub(crate) const RESOLUTION_DEGRADE: bool = false;

/// Video quality levels requested from the SFT.
pub const RESOLUTION_LOW: u32 = 1;
pub const RESOLUTION_HIGH: u32 = 2;

/// Why this endpoint must tell its sibling devices to stop ringing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopRinging {
    None,
    Answered,
    Rejected,
}

/// Terminal failure recorded until the media session confirms teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallFailure {
    Timeout,
    NooneJoined,
    EveryoneLeft,
    AccessDenied,
    NotSupported,
    Network,
    Internal,
}

pub(crate) fn failure_reason(failure: Option<CallFailure>) -> CallReason {
    match failure {
        None => CallReason::Normal,
        Some(CallFailure::Timeout) => CallReason::Timeout,
        Some(CallFailure::NooneJoined) => CallReason::NooneJoined,
        Some(CallFailure::EveryoneLeft) => CallReason::EveryoneLeft,
        Some(CallFailure::AccessDenied) => CallReason::AuthFailed,
        Some(CallFailure::NotSupported)
        | Some(CallFailure::Network)
        | Some(CallFailure::Internal) => CallReason::Error,
    }
}

/// Continuation for a join waiting on a config update. A stale update is
/// recognised by a mismatching id.
#[derive(Debug, Clone)]
pub(crate) struct PendingJoin {
    pub id: u64,
    pub call_type: CallType,
    pub audio_cbr: bool,
    pub retry_attempt: bool,
}

/// One requested remote video stream.
#[derive(Debug, Clone)]
pub(crate) struct VideoRequest {
    pub userid: UserId,
    pub clientid: ClientId,
    pub quality: u32,
    pub vstate: VideoState,
}

/// The conference controller for one conversation.
///
/// Single-threaded: the host calls every method from one event loop and
/// drains [`CallEvent`]s after each call. Time is supplied by the caller in
/// loop-monotonic milliseconds so the machine stays deterministic under
/// test.
pub struct ConfCall {
    pub(crate) convid: ConvId,
    pub(crate) convid_hash: IdHash,
    pub(crate) secret: Vec<u8>,
    pub(crate) is_mls: bool,

    pub(crate) state: CallState,
    pub(crate) roster: Roster,
    pub(crate) keystore: Arc<KeyStore>,
    pub(crate) ctx: Arc<MediaSystemContext>,
    pub(crate) cfg: CallConfig,
    pub(crate) turn_servers: Vec<IceServer>,

    pub(crate) media: Option<Box<dyn MediaSession>>,
    pub(crate) media_factory: Box<dyn MediaSessionFactory>,

    pub(crate) sft_url: Option<String>,
    pub(crate) primary_sft_url: Option<String>,
    pub(crate) sft_tuple: Option<String>,
    pub(crate) sft_list: Vec<String>,
    pub(crate) sft_timestamp: u64,
    pub(crate) sft_seqno: u32,

    pub(crate) is_caller: bool,
    pub(crate) is_ringing: bool,
    pub(crate) stop_ringing_reason: StopRinging,
    pub(crate) call_type: CallType,
    pub(crate) vstate: VideoState,

    pub(crate) someone_left: bool,
    pub(crate) someone_joined: bool,
    pub(crate) request_key: bool,
    pub(crate) received_confpart: bool,
    pub(crate) became_kg: bool,
    pub(crate) confpart_data: Vec<u8>,

    pub(crate) pending_join: Option<PendingJoin>,
    pub(crate) join_seq: u64,

    pub(crate) reconnect_attempts: u32,
    pub(crate) expected_ping: u32,
    pub(crate) last_ping: u64,
    pub(crate) inc_reconnects: bool,

    pub(crate) epoch_start_ts: u64,
    pub(crate) quality_interval: u64,
    pub(crate) failure: Option<CallFailure>,

    pub(crate) video_requests: Vec<VideoRequest>,
    pub(crate) metrics: CallMetrics,
    pub(crate) ts_start: u64,

    pub(crate) timers: TimerTable,
    pub(crate) events: VecDeque<CallEvent>,
}

impl ConfCall {
    pub fn new(
        convid: ConvId,
        userid_self: UserId,
        clientid_self: ClientId,
        is_mls: bool,
        media_factory: Box<dyn MediaSessionFactory>,
        ctx: Arc<MediaSystemContext>,
    ) -> Self {
        info!(conv = %convid, is_mls, "allocating conference call");

        let mut call = Self {
            convid,
            convid_hash: IdHash::default(),
            secret: Vec::new(),
            is_mls,
            state: CallState::Idle,
            roster: Roster::new(userid_self, clientid_self),
            keystore: Arc::new(KeyStore::new()),
            ctx,
            cfg: CallConfig::default(),
            turn_servers: Vec::new(),
            media: None,
            media_factory,
            sft_url: None,
            primary_sft_url: None,
            sft_tuple: None,
            sft_list: Vec::new(),
            sft_timestamp: 0,
            sft_seqno: 0,
            is_caller: false,
            is_ringing: false,
            stop_ringing_reason: StopRinging::None,
            call_type: CallType::Normal,
            vstate: VideoState::Stopped,
            someone_left: false,
            someone_joined: false,
            request_key: false,
            received_confpart: false,
            became_kg: false,
            confpart_data: Vec::new(),
            pending_join: None,
            join_seq: 0,
            reconnect_attempts: 0,
            expected_ping: 0,
            last_ping: 0,
            inc_reconnects: false,
            epoch_start_ts: 0,
            quality_interval: 0,
            failure: None,
            video_requests: Vec::new(),
            metrics: CallMetrics::default(),
            ts_start: 0,
            timers: TimerTable::new(),
            events: VecDeque::new(),
        };
        call.set_secret(hash::new_secret());
        call
    }

    // --- accessors ----------------------------------------------------------

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn conv_hash(&self) -> &IdHash {
        &self.convid_hash
    }

    /// Own identity as it appears on the wire toward SFTs.
    pub fn self_wire_hash(&self) -> (IdHash, IdHash) {
        let s = self.roster.self_member();
        (s.userid_hash.clone(), s.clientid_hash.clone())
    }

    /// Wire hash of a known roster member, as the SFT reports it.
    pub fn member_wire_hash(&self, userid: &UserId, clientid: &ClientId) -> Option<IdHash> {
        self.roster
            .find_by_real(userid, clientid)
            .map(|m| m.userid_hash.clone())
    }

    /// The key store, shared with the media layer for SRTP derivation.
    pub fn keystore(&self) -> Arc<KeyStore> {
        Arc::clone(&self.keystore)
    }

    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        self.events.drain(..).collect()
    }

    pub(crate) fn emit(&mut self, event: CallEvent) {
        self.events.push_back(event);
    }

    /// Earliest pending timer deadline, for the async driver.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    // --- secret / identity --------------------------------------------------

    pub(crate) fn set_secret(&mut self, secret: Vec<u8>) {
        info!(prefix = %hash::secret_prefix(&secret), len = secret.len(), "setting call secret");
        self.convid_hash = hash::conv_hash(&secret, &self.convid);
        self.roster.set_secret(&secret);
        self.keystore.set_salt(self.convid_hash.as_str().as_bytes());
        if let Some(media) = self.media.as_mut() {
            media.set_sessid(&self.convid_hash);
        }
        self.secret = secret;
    }

    // --- configuration ------------------------------------------------------

    pub fn add_turnserver(&mut self, server: IceServer) -> Result<()> {
        if self.turn_servers.len() >= MAX_TURN_SERVERS {
            return Err(CoreError::CapacityExceeded("turn servers"));
        }
        self.turn_servers.push(server);
        Ok(())
    }

    pub fn set_quality_interval(&mut self, interval_ms: u64) {
        self.quality_interval = interval_ms;
        if let Some(media) = self.media.as_mut() {
            media.set_quality_interval(interval_ms);
        }
    }

    // --- host call control --------------------------------------------------

    pub fn start(&mut self, call_type: CallType, audio_cbr: bool, now_ms: u64) -> Result<()> {
        self.failure = None;
        match self.state {
            CallState::Incoming => {
                warn!(state = self.state.name(), "start in incoming state, answering instead");
                self.answer(call_type, audio_cbr, now_ms)
            }
            CallState::Idle => {
                self.is_caller = true;
                self.req_cfg_join(call_type, audio_cbr, false, true, now_ms);
                Ok(())
            }
            _ => {
                warn!(state = self.state.name(), "start ignored in current state");
                Ok(())
            }
        }
    }

    pub fn answer(&mut self, call_type: CallType, audio_cbr: bool, now_ms: u64) -> Result<()> {
        self.failure = None;
        match self.state {
            CallState::Idle | CallState::Incoming => {
                if self.state == CallState::Idle {
                    warn!("answer in idle state, trying anyway");
                }
                self.is_caller = false;
                self.stop_ringing_reason = StopRinging::Answered;
                self.req_cfg_join(call_type, audio_cbr, false, false, now_ms);
                Ok(())
            }
            _ => {
                warn!(state = self.state.name(), "answer refused in current state");
                Err(CoreError::InvalidArgument("answer in wrong state"))
            }
        }
    }

    pub fn end(&mut self) {
        if let Some(media) = self.media.as_mut() {
            media.end();
        }
    }

    pub fn reject(&mut self) {
        info!(state = self.state.name(), "reject");
        if self.state == CallState::Incoming {
            self.stop_ringing_reason = StopRinging::Rejected;
            self.stop_others_ringing();
        }
    }

    pub fn media_start(&mut self) {
        if let Some(media) = self.media.as_mut() {
            media.media_start();
        }
    }

    pub fn media_stop(&mut self) {
        if let Some(media) = self.media.as_mut() {
            media.media_stop();
        }
    }

    pub fn restart(&mut self) {
        info!("restart");
        let call_type = self.call_type;
        if let Some(media) = self.media.as_mut() {
            media.restart(call_type);
        }
    }

    /// Foreground/background hint. While backgrounded an incoming call's
    /// ongoing timer is parked so the call does not silently expire.
    pub fn activate(&mut self, active: bool, now_ms: u64) {
        info!(active, "activate");
        if self.state == CallState::Incoming {
            if active {
                self.timers
                    .start(TimerKind::Ongoing, now_ms, timers::ONGOING_CALL_TIMEOUT);
            } else {
                self.timers.cancel(TimerKind::Ongoing);
            }
        }
        if let Some(media) = self.media.as_mut() {
            media.activate(active);
        }
    }

    pub fn set_vstate(&mut self, state: VideoState) {
        info!(state = state.name(), "set video state");
        self.vstate = state;

        if let (Some(userid), Some(clientid)) = (
            self.roster.self_member().userid.clone(),
            self.roster.self_member().clientid.clone(),
        ) {
            self.emit(CallEvent::VstateChanged {
                userid,
                clientid,
                state,
            });
        }
        self.emit(CallEvent::GroupChanged);

        if let Some(media) = self.media.as_mut() {
            media.set_video_send_state(state);
        }
    }

    pub fn update_mute_state(&mut self) {
        self.emit(CallEvent::GroupChanged);
        if let Some(media) = self.media.as_mut() {
            media.update_mute();
        }
    }

    pub fn get_members(&self) -> Vec<MemberSnapshot> {
        let astate = if self.state == CallState::Active {
            AudioState::Established
        } else {
            AudioState::Connecting
        };
        self.roster.members(astate, self.vstate, self.ctx.is_muted())
    }

    /// Ask the SFT for the given remote video streams.
    pub fn request_video_streams(
        &mut self,
        clients: &[(UserId, ClientId, u32)],
    ) -> Result<()> {
        if clients.is_empty() {
            return Err(CoreError::InvalidArgument("empty stream list"));
        }

        self.video_requests.clear();
        let mut streaml = Vec::new();
        for (userid, clientid, quality) in clients {
            let Some(member) = self.roster.find_by_real(userid, clientid) else {
                continue;
            };
            streaml.push(StreamInfo {
                userid: member.userid_hash.clone(),
                quality: *quality,
            });
            self.video_requests.push(VideoRequest {
                userid: userid.clone(),
                clientid: clientid.clone(),
                quality: *quality,
                vstate: member.video_state,
            });
        }

        info!(
            requested = clients.len(),
            matched = streaml.len(),
            "requesting video streams"
        );
        self.metrics.participants_video_req =
            self.metrics.participants_video_req.max(streaml.len() as u32);

        let mut msg = SignalMessage::conf_streams(streaml);
        self.address_to_sft(&mut msg);
        let payload = huddle_signal::encode(&msg)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        if let Some(media) = self.media.as_mut() {
            media.send_data(&payload);
        }
        Ok(())
    }

    // --- state machine ------------------------------------------------------

    pub(crate) fn set_state(&mut self, state: CallState, now_ms: u64) {
        let old_state = self.state;
        info!(from = old_state.name(), to = state.name(), "state changed");
        self.state = state;

        if old_state == CallState::Idle && self.ts_start == 0 {
            self.ts_start = now_ms;
        }

        match state {
            CallState::Idle => {
                self.sft_url = None;
                self.sft_timestamp = 0;
                self.roster.reset_keygenerator();
                self.received_confpart = false;
                self.keystore.reset();
                self.timers.cancel(TimerKind::RotateKey);
                self.timers.cancel(TimerKind::RotateMls);
                self.timers.cancel(TimerKind::SendCheck);
                self.timers.cancel(TimerKind::Connect);
                self.timers.cancel(TimerKind::DecryptCheck);
                self.timers.cancel(TimerKind::Keepalive);
                self.timers.cancel(TimerKind::Alone);
            }
            CallState::Incoming => {
                self.sft_url = None;
                self.roster.reset_keygenerator();
                self.received_confpart = false;
                self.keystore.reset_keys();
                self.timers.cancel(TimerKind::RotateKey);
                self.timers.cancel(TimerKind::RotateMls);
                self.timers.cancel(TimerKind::SendCheck);
                self.timers
                    .start(TimerKind::Ongoing, now_ms, timers::ONGOING_CALL_TIMEOUT);
                self.timers.cancel(TimerKind::DecryptCheck);
                self.timers.cancel(TimerKind::Keepalive);
                self.timers.cancel(TimerKind::Alone);
            }
            CallState::WaitConfig | CallState::WaitConfigOutgoing => {
                self.sft_url = None;
                self.roster.reset_keygenerator();
                self.received_confpart = false;
                self.keystore.reset_keys();
                self.timers.cancel(TimerKind::RotateKey);
                self.timers.cancel(TimerKind::RotateMls);
                self.timers.cancel(TimerKind::SendCheck);
                self.timers
                    .start(TimerKind::Connect, now_ms, timers::CONNECT_TIMEOUT);
                self.timers.cancel(TimerKind::DecryptCheck);
                self.timers.cancel(TimerKind::Keepalive);
                self.timers.cancel(TimerKind::Alone);
                self.timers.cancel(TimerKind::Ring);
            }
            CallState::ConnSent => {
                self.received_confpart = false;
                if !self.is_mls && self.reconnect_attempts == 0 {
                    self.keystore.reset_keys();
                    self.timers.cancel(TimerKind::RotateMls);
                }
                self.timers.cancel(TimerKind::RotateKey);
                self.timers.cancel(TimerKind::SendCheck);
                self.timers
                    .start(TimerKind::Connect, now_ms, timers::CONNECT_TIMEOUT);
                self.timers.cancel(TimerKind::DecryptCheck);
                self.timers.cancel(TimerKind::Keepalive);
                self.timers.cancel(TimerKind::Alone);
            }
            CallState::SetupRecv | CallState::Connecting => {}
            CallState::Connected => {
                self.timers.cancel(TimerKind::Connect);
            }
            CallState::Active => {
                self.expected_ping = 0;
                self.last_ping = 0;
                self.timers.cancel(TimerKind::Connect);
                self.timers
                    .start(TimerKind::DecryptCheck, now_ms, timers::DECRYPT_CHECK_TIMEOUT);
                self.timers
                    .start(TimerKind::Keepalive, now_ms, timers::KEEPALIVE_TIMEOUT);
                if self.reconnect_attempts > 0 && self.roster.is_keygenerator_me() {
                    self.send_check_now(now_ms);
                }
            }
            CallState::Terminating => {
                self.timers.cancel(TimerKind::SendCheck);
                self.timers.cancel(TimerKind::Connect);
                self.timers.cancel(TimerKind::Keepalive);
                self.timers.cancel(TimerKind::Alone);
            }
            CallState::None => {}
        }

        if state != old_state && (state == CallState::Active || old_state == CallState::Active) {
            self.emit(CallEvent::GroupChanged);
        }
    }

    // --- timers -------------------------------------------------------------

    /// Fire every due timer. The host (or the async driver) calls this on a
    /// coarse cadence; handlers re-arm their own timers.
    pub fn tick(&mut self, now_ms: u64) {
        for kind in self.timers.due(now_ms) {
            debug!(timer = ?kind, "timer fired");
            match kind {
                TimerKind::Connect => self.connect_timeout(now_ms),
                TimerKind::Ongoing => self.ongoing_timeout(now_ms),
                TimerKind::Ring => self.ring_timeout(),
                TimerKind::SendCheck => self.send_check_timeout(now_ms),
                TimerKind::RotateKey => self.rotate_key_timeout(now_ms),
                TimerKind::RotateMls => self.rotate_mls_timeout(now_ms),
                TimerKind::DecryptCheck => self.decrypt_check_timeout(now_ms),
                TimerKind::Keepalive => self.keepalive_timeout(now_ms),
                TimerKind::Alone => self.alone_timeout(now_ms),
            }
        }
    }

    fn connect_timeout(&mut self, now_ms: u64) {
        info!(state = self.state.name(), "connect timeout");
        if self.state != CallState::Active {
            self.end_with_failure(CallFailure::Timeout, now_ms);
        }
    }

    fn ongoing_timeout(&mut self, now_ms: u64) {
        if self.state == CallState::Incoming {
            info!("ongoing call timed out");
            self.set_state(CallState::Idle, now_ms);
            let metrics = self.metrics.clone();
            self.emit(CallEvent::Closed {
                reason: CallReason::Normal,
                metrics,
                msg_time: 0,
            });
        }
    }

    fn ring_timeout(&mut self) {
        if self.state == CallState::Incoming {
            info!("ring timeout");
            self.emit(CallEvent::Leave {
                reason: CallReason::StillOngoing,
                msg_time: 0,
            });
            self.is_ringing = false;
        }
    }

    pub(crate) fn send_check_now(&mut self, now_ms: u64) {
        self.timers.cancel(TimerKind::SendCheck);
        self.send_check_timeout(now_ms);
    }

    fn send_check_timeout(&mut self, now_ms: u64) {
        if self.state == CallState::Active && self.roster.is_keygenerator_me() {
            info!(state = self.state.name(), "periodic call check");
            self.send_to_peers(Payload::ConfCheck(self.confcheck_payload()), true, None, false);

            if self.is_mls
                && self.epoch_start_ts > 0
                && now_ms.saturating_sub(self.epoch_start_ts) >= timers::REQ_NEW_EPOCH_TIMEOUT
            {
                info!(
                    age_ms = now_ms - self.epoch_start_ts,
                    "epoch is stale, asking host for a new one"
                );
                self.emit(CallEvent::RequestNewEpoch);
            }
        }
        self.timers
            .start(TimerKind::SendCheck, now_ms, timers::SEND_CHECK_TIMEOUT);
    }

    fn rotate_key_timeout(&mut self, now_ms: u64) {
        if self.state == CallState::Active && self.roster.is_keygenerator_me() && !self.is_mls {
            info!("rotating session key");
            self.keystore.rotate(now_ms);

            if self.someone_left {
                if let Err(e) = self.generate_session_key(false, now_ms) {
                    warn!(error = %e, "session key generation failed");
                }
                self.someone_left = false;
            }
            self.timers
                .start(TimerKind::RotateKey, now_ms, timers::ROTATE_KEY_TIMEOUT);
        }
    }

    pub(crate) fn rotate_mls_timeout(&mut self, now_ms: u64) {
        if self.state == CallState::Active && self.is_mls {
            let keytime = now_ms.saturating_sub(timers::MLS_KEY_AGE);
            if self.keystore.rotate_by_time(keytime, now_ms) {
                self.timers
                    .start(TimerKind::RotateMls, now_ms, timers::ROTATE_MLS_TIMEOUT);
            }
        }
    }

    fn decrypt_check_timeout(&mut self, now_ms: u64) {
        if self.state != CallState::Active {
            debug!(state = self.state.name(), "decrypt check ignored");
            return;
        }

        if !self.received_confpart {
            info!("no participant list from the SFT yet, reconnecting");
            self.reconnect(0, true, false, now_ms);
            return;
        }

        if !self.roster.has_keygenerator() {
            // No election yet: wait for the next CONFPART, never escalate.
            debug!("decrypt check waiting for keygenerator");
            self.timers
                .start(TimerKind::DecryptCheck, now_ms, timers::DECRYPT_CHECK_TIMEOUT);
            return;
        }

        if !self.roster.is_keygenerator_me() {
            let has_keys = self.keystore.has_keys();
            let (attempted, successful) = self.keystore.decrypt_states();
            debug!(has_keys, attempted, successful, "decrypt check");

            if !has_keys || (attempted && !successful) {
                self.request_keys();
            }
        }

        self.timers
            .start(TimerKind::DecryptCheck, now_ms, timers::DECRYPT_CHECK_TIMEOUT);
    }

    fn keepalive_timeout(&mut self, now_ms: u64) {
        if self.state != CallState::Active {
            debug!(state = self.state.name(), "keepalive ignored");
            return;
        }
        let Some(media) = self.media.as_mut() else {
            debug!("keepalive without media session");
            return;
        };

        media.ping();
        self.expected_ping += 1;
        if self.expected_ping > timers::MAX_MISSING_PINGS {
            info!(missing = self.expected_ping, "pings going unanswered, reconnecting");
            self.reconnect(0, true, false, now_ms);
        } else {
            self.timers
                .start(TimerKind::Keepalive, now_ms, timers::KEEPALIVE_TIMEOUT);
        }
    }

    fn alone_timeout(&mut self, now_ms: u64) {
        if self.state != CallState::Active || self.media.is_none() {
            debug!(state = self.state.name(), "alone timeout ignored");
            return;
        }
        info!(someone_joined = self.someone_joined, "alone in the call");
        let failure = if self.someone_joined {
            CallFailure::EveryoneLeft
        } else {
            CallFailure::NooneJoined
        };
        self.end_with_failure(failure, now_ms);
    }

    // --- reconnect ----------------------------------------------------------

    pub(crate) fn reconnect(&mut self, msg_time: u64, notify: bool, again: bool, now_ms: u64) {
        if self.state == CallState::ConnSent {
            return;
        }

        let (attempted, successful) = self.keystore.decrypt_states();
        info!(
            confpart = self.received_confpart,
            decrypt_attempted = attempted,
            decrypt_successful = successful,
            attempts = self.reconnect_attempts,
            missing_pings = self.expected_ping,
            "reconnecting"
        );

        if self.reconnect_attempts >= timers::MAX_RECONNECT_ATTEMPTS {
            self.end_with_failure(CallFailure::Timeout, now_ms);
            self.emit(CallEvent::Leave {
                reason: CallReason::StillOngoing,
                msg_time,
            });
            return;
        }
        self.reconnect_attempts += 1;
        self.expected_ping = 0;
        self.last_ping = 0;

        if notify {
            self.inc_reconnects = true;
            self.metrics.reconnects_attempted += 1;
        }

        self.roster.incall_clear(true, again);
        self.video_requests.clear();

        self.set_state(CallState::ConnSent, now_ms);
        if let Some(url) = self.sft_url.clone() {
            let (username, credential) = self.sft_credentials(&url);
            self.send_conf_conn(&url, username, credential, true);
        }

        if notify {
            self.emit(CallEvent::Quality {
                userid: None,
                clientid: None,
                rtt: 0,
                uploss: 0,
                downloss: 0,
                reconnecting: true,
            });
        }
    }

    // --- keys ---------------------------------------------------------------

    pub(crate) fn generate_session_key(&mut self, is_first: bool, now_ms: u64) -> Result<()> {
        let mut index = 0u32;
        if !is_first {
            index = (self.keystore.max_key_index() | 0xFFFF).wrapping_add(1);
            if self.became_kg {
                index = index.wrapping_add(0x10000);
            }
        }
        self.became_kg = false;
        info!(index, "generating session key");

        let mut key = [0u8; SESSION_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        self.keystore
            .set_fresh_session_key(index, &key, &self.confpart_data, now_ms)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        key.fill(0);

        self.send_keys(true);
        Ok(())
    }

    /// Distribute the current (+ next) session key. `send_to_all` ignores the
    /// per-member `needs_key` marks.
    pub(crate) fn send_keys(&mut self, send_to_all: bool) {
        if self.is_mls {
            debug!("key distribution skipped for mls call");
            return;
        }
        if !(self.roster.is_keygenerator_me() && self.state == CallState::Active) {
            return;
        }

        let targets = self.roster.key_targets(send_to_all);
        if targets.is_empty() {
            return;
        }
        info!(targets = targets.len(), "distributing session keys");

        let Some(payload) = self.confkey_response() else {
            warn!("no current key to distribute");
            return;
        };
        self.send_to_peers(Payload::ConfKey(payload), true, Some(targets), false);
    }

    fn confkey_response(&self) -> Option<ConfKey> {
        let (idx, data) = self.keystore.current_key().ok()?;
        let mut keyl = vec![KeyEntry { idx, data }];
        if let Ok((idx, data)) = self.keystore.next_key() {
            keyl.push(KeyEntry { idx, data });
        }
        Some(ConfKey { keyl })
    }

    /// Unicast a key request to the keygenerator.
    pub(crate) fn request_keys(&mut self) {
        if self.is_mls {
            warn!("key request ignored for mls call");
            return;
        }
        if self.roster.is_keygenerator_me() {
            warn!("key request while keygenerator is self");
            return;
        }
        let Some((userid, clientid)) = self.roster.keygenerator_identity() else {
            warn!("key request without a known keygenerator");
            return;
        };

        info!("requesting session keys from keygenerator");
        self.send_to_peers(
            Payload::ConfKey(ConfKey::default()),
            false,
            Some(vec![(userid, clientid)]),
            false,
        );
    }

    /// Align the current key with the slowest receiver's epoch.
    pub(crate) fn sync_media_keys(&mut self, now_ms: u64) {
        let min_key = self.roster.key_index();
        if min_key == 0 {
            return;
        }
        let Ok((current, _)) = self.keystore.current() else {
            return;
        };
        info!(min_key, current, "syncing media keys");
        if min_key > current {
            self.keystore.set_current(min_key, now_ms);
        }
        self.rotate_mls_timeout(now_ms);
    }

    /// Push the latest installed epoch to peers via the props channel.
    pub(crate) fn sync_props(&mut self) {
        let epoch = self.roster.latest_epoch();
        if let Some(media) = self.media.as_mut() {
            media.set_local_prop("keysync", &epoch.to_string());
            media.sync_props();
        }
    }

    // --- outbound messages --------------------------------------------------

    pub(crate) fn confstart_payload(&self) -> ConfStart {
        let sftl = if self.sft_list.is_empty() {
            self.primary_sft_url.clone().into_iter().collect()
        } else {
            self.sft_list.clone()
        };
        let mut props = std::collections::BTreeMap::new();
        props.insert(
            "videosend".to_string(),
            (self.call_type == CallType::Video).to_string(),
        );
        ConfStart {
            timestamp: self.sft_timestamp,
            seqno: self.sft_seqno,
            secret: self.secret.clone(),
            sft_url: self.primary_sft_url.clone().unwrap_or_default(),
            sft_tuple: self.sft_tuple.clone(),
            sftl,
            props,
        }
    }

    pub(crate) fn confcheck_payload(&self) -> ConfCheck {
        let sftl = if self.sft_list.is_empty() {
            self.primary_sft_url.clone().into_iter().collect()
        } else {
            self.sft_list.clone()
        };
        ConfCheck {
            timestamp: self.sft_timestamp,
            seqno: self.sft_seqno,
            secret: self.secret.clone(),
            sft_url: self.primary_sft_url.clone().unwrap_or_default(),
            sft_tuple: self.sft_tuple.clone(),
            sftl,
        }
    }

    /// Send a peer-addressed message through the host's messaging backend.
    pub(crate) fn send_to_peers(
        &mut self,
        payload: Payload,
        resp: bool,
        targets: Option<Vec<(UserId, ClientId)>>,
        my_clients_only: bool,
    ) {
        let mut msg = if resp {
            SignalMessage::response(payload)
        } else {
            SignalMessage::new(payload)
        };
        let self_member = self.roster.self_member();
        msg.src_userid = self_member
            .userid
            .as_ref()
            .map(|u| u.0.clone())
            .unwrap_or_default();
        msg.src_clientid = self_member
            .clientid
            .as_ref()
            .map(|c| c.0.clone())
            .unwrap_or_default();
        if matches!(
            msg.payload,
            Payload::ConfStart(_) | Payload::ConfCheck(_) | Payload::ConfEnd
        ) {
            msg.sessid_sender = self.convid_hash.clone();
        }

        debug!(msg_type = msg.payload.type_name(), "sending to peers");
        self.emit(CallEvent::SendToPeers {
            msg,
            targets,
            my_clients_only,
            transient: false,
        });
    }

    pub(crate) fn address_to_sft(&self, msg: &mut SignalMessage) {
        let self_member = self.roster.self_member();
        msg.src_userid = self_member.userid_hash.as_str().to_string();
        msg.src_clientid = self_member.clientid_hash.as_str().to_string();
        msg.dest_userid = Some("SFT".to_string());
        msg.dest_clientid = Some("SFT".to_string());
        msg.sessid_sender = self.convid_hash.clone();
    }

    /// Post a message to an SFT endpoint. The HTTP round trip is the host's
    /// job; the response comes back via `sft_msg_recv`.
    pub(crate) fn send_msg_sft(&mut self, sft_url: &str, mut msg: SignalMessage, now_ms: u64) {
        let base = normalize_sft_url(sft_url);
        let url = format!("{base}sft/{}", self.convid_hash);
        msg.sessid_sender = self.convid_hash.clone();

        let is_setup = matches!(msg.payload, Payload::Setup(_) | Payload::Update(_));
        info!(msg_type = msg.payload.type_name(), url = %url, "posting to sft");
        self.emit(CallEvent::SftRequest { url, msg });

        if is_setup && self.state != CallState::Active {
            self.set_state(CallState::Connecting, now_ms);
        }
    }

    pub(crate) fn sft_credentials(&self, url: &str) -> (Option<String>, Option<String>) {
        match self.cfg.sft_info(url) {
            Some(info) => (info.username.clone(), info.credential.clone()),
            None => (None, None),
        }
    }

    pub(crate) fn send_conf_conn(
        &mut self,
        sft_url: &str,
        username: Option<String>,
        credential: Option<String>,
        update: bool,
    ) {
        let url = normalize_sft_url(sft_url);
        info!(url = %url, update, "sending join request");

        let turnv = if self.cfg.ice_servers.is_empty() {
            self.turn_servers.clone()
        } else {
            self.cfg.ice_servers.clone()
        };

        let mut conn = huddle_signal::ConfConn {
            turnv,
            tool: Some(self.ctx.tool()),
            toolver: Some(self.ctx.tool_version().to_string()),
            env: self.ctx.env().map(String::from),
            update,
            selective_audio: true,
            selective_video: true,
            vstreams: huddle_core::config::MAX_VSTREAMS,
            ..Default::default()
        };

        if let Some(primary) = &self.primary_sft_url {
            if !sft_urls_equal(primary, &url) {
                conn.sft_url = Some(primary.clone());
                conn.sft_tuple = self.sft_tuple.clone();
            }
        }
        match (username, credential) {
            (Some(u), Some(c)) if !u.is_empty() && !c.is_empty() => {
                conn.sft_username = Some(u);
                conn.sft_credential = Some(c);
            }
            _ => {}
        }

        let mut msg = SignalMessage::new(Payload::ConfConn(conn));
        self.address_to_sft(&mut msg);
        msg.dest_clientid = Some("_".to_string());
        // CONFCONN never transitions state by itself
        let url_owned = url.clone();
        let target = format!("{url_owned}sft/{}", self.convid_hash);
        self.emit(CallEvent::SftRequest { url: target, msg });
    }

    // --- media session ------------------------------------------------------

    pub(crate) fn create_media_session(&mut self) {
        debug_assert!(self.media.is_none());

        if self.call_type == CallType::Normal
            && matches!(self.vstate, VideoState::Started | VideoState::ScreenShare)
        {
            self.call_type = CallType::Video;
        }

        let self_member = self.roster.self_member();
        let params = MediaSessionParams {
            convid: self.convid.clone(),
            sessid: self.convid_hash.clone(),
            userid_hash: self_member.userid_hash.clone(),
            clientid_hash: self_member.clientid_hash.clone(),
            clientid_real: self_member.clientid.clone().unwrap_or_else(|| "".into()),
            call_type: self.call_type,
            is_mls: self.is_mls,
            turn_servers: self.turn_servers.clone(),
            quality_interval_ms: self.quality_interval,
        };

        info!(call_type = ?params.call_type, "creating media session");
        let mut media = self.media_factory.create(params);
        media.set_video_send_state(self.vstate);
        self.media = Some(media);
    }

    // --- teardown -----------------------------------------------------------

    pub(crate) fn end_with_failure(&mut self, failure: CallFailure, now_ms: u64) {
        info!(failure = ?failure, state = self.state.name(), "ending call");
        self.failure = Some(failure);
        let reason = failure_reason(self.failure);

        match self.state {
            CallState::None | CallState::Idle => {
                self.set_state(CallState::Idle, now_ms);
            }
            CallState::ConnSent
            | CallState::Incoming
            | CallState::WaitConfig
            | CallState::WaitConfigOutgoing => {
                self.set_state(CallState::Idle, now_ms);
                self.emit(CallEvent::Leave {
                    reason,
                    msg_time: 0,
                });
            }
            CallState::Terminating => {}
            CallState::SetupRecv
            | CallState::Connecting
            | CallState::Connected
            | CallState::Active => {
                self.set_state(CallState::Terminating, now_ms);
            }
        }

        self.roster.incall_clear(false, false);
        if let Some(media) = self.media.as_mut() {
            media.end();
        } else {
            self.set_state(CallState::Idle, now_ms);
        }
    }

    pub(crate) fn update_active_counts(&mut self) {
        let (active, mut active_a, mut active_v) = self.roster.active_counts();
        if !self.ctx.is_muted() {
            active_a += 1;
        }
        if self.vstate == VideoState::Started {
            active_v += 1;
        }
        self.metrics.participants_max = self.metrics.participants_max.max(active);
        self.metrics.participants_audio_max = self.metrics.participants_audio_max.max(active_a);
        self.metrics.participants_video_max = self.metrics.participants_video_max.max(active_v);
    }

    /// One-line-per-item dump of call state for diagnostics.
    pub fn debug_summary(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "state: {}", self.state.name());
        if let Some(url) = &self.sft_url {
            let _ = writeln!(out, "selected_sft: {url}");
        }
        if let Some(url) = &self.primary_sft_url {
            let _ = writeln!(out, "primary_sft: {url}");
        }
        let _ = writeln!(
            out,
            "ordering: ts={} seq={} caller={}",
            self.sft_timestamp, self.sft_seqno, self.is_caller
        );
        for m in self.get_members() {
            let _ = writeln!(
                out,
                "member: {}.{} audio={:?} video={} muted={}",
                m.userid, m.clientid, m.audio_state, m.video_state.name(), m.muted
            );
        }
        out
    }

    pub(crate) fn map_keystore_err(err: KeystoreError) -> CoreError {
        match err {
            KeystoreError::AlreadyKnown => CoreError::AlreadyKnown,
            KeystoreError::KeyConflict { index } => CoreError::KeyConflict { index },
            other => CoreError::Internal(other.to_string()),
        }
    }
}
