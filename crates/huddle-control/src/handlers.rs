//! Inbound message and media-event handling for the conference controller.

use tracing::{debug, info, warn};

use huddle_core::config::normalize_sft_url;
use huddle_core::{
    CallReason, ClientId, CoreError, Result, UserId, VideoState,
};
use huddle_keystore::KeystoreError;
use huddle_roster::{RosterEvent, SeClient};
use huddle_signal::{ConfConnStatus, ConfPart, Payload, SignalMessage};

use crate::engine::{CallFailure, ConfCall, PendingJoin, StopRinging, RESOLUTION_DEGRADE};
use crate::events::CallEvent;
use crate::media::{MediaClose, MediaEvent};
use crate::state::CallState;
use crate::timers::{self, TimerKind};

/// Extended-internal HTTP status range; anything at or above is a network
/// failure rather than an SFT verdict.
pub const SFT_STATUS_NETWORK_ERROR: u32 = 1000;

impl ConfCall {
    // --- config / join ------------------------------------------------------

    /// Record a join continuation and ask the host for a fresh call config.
    pub(crate) fn req_cfg_join(
        &mut self,
        call_type: huddle_core::CallType,
        audio_cbr: bool,
        retry_attempt: bool,
        is_outgoing: bool,
        now_ms: u64,
    ) {
        info!(retry_attempt, is_outgoing, "requesting config for join");
        self.join_seq += 1;
        self.set_state(
            if is_outgoing {
                CallState::WaitConfigOutgoing
            } else {
                CallState::WaitConfig
            },
            now_ms,
        );
        self.pending_join = Some(PendingJoin {
            id: self.join_seq,
            call_type,
            audio_cbr,
            retry_attempt,
        });
        self.emit(CallEvent::RequestConfig);
    }

    /// Host-delivered call configuration. Consumes the pending join, picks
    /// SFTs and fans out `CONFCONN`.
    pub fn set_config(&mut self, cfg: huddle_core::CallConfig, now_ms: u64) {
        self.cfg = cfg;

        let Some(join) = self.pending_join.clone() else {
            debug!("config stored, no join pending");
            return;
        };
        if join.id != self.join_seq {
            // A callback from a superseded attempt.
            info!("ignoring stale config update");
            return;
        }

        info!(
            sfts = self.cfg.sft_servers.len(),
            state = self.state.name(),
            federating = self.cfg.is_federating,
            "config update received"
        );

        if self.cfg.sft_servers.is_empty() {
            warn!("no SFT server configured");
            self.end_with_failure(CallFailure::NotSupported, now_ms);
            self.pending_join = None;
            return;
        }

        if !self.state.is_waiting_config() {
            warn!(state = self.state.name(), "config update ignored in current state");
            self.pending_join = None;
            return;
        }

        let mut connected = 0u32;

        // Prefer SFTs already active in the call when joining an existing one.
        if self.state == CallState::WaitConfig {
            if !self.sft_list.is_empty() {
                info!(candidates = self.sft_list.len(), "trying sfts from the call's sft list");
                let candidates: Vec<String> = self.sft_list.clone();
                for url in candidates {
                    if !self.cfg.can_connect_sft(&url) {
                        continue;
                    }
                    let (username, credential) = self.sft_credentials(&url);
                    self.send_conf_conn(&url, username, credential, false);
                    connected += 1;
                    if connected >= 3 {
                        break;
                    }
                }
            } else if let Some(primary) = self.primary_sft_url.clone() {
                if self.cfg.can_connect_sft(&primary) {
                    let (username, credential) = self.sft_credentials(&primary);
                    info!(url = %primary, "connecting to primary sft");
                    self.send_conf_conn(&primary, username, credential, false);
                    connected += 1;
                }
            }

            if connected == 0 && !self.cfg.is_federating {
                warn!(
                    retry = join.retry_attempt,
                    "not federating and no allowed sft to join"
                );
                if join.retry_attempt {
                    self.end_with_failure(CallFailure::AccessDenied, now_ms);
                    self.pending_join = None;
                } else {
                    // One more config fetch before giving up.
                    self.req_cfg_join(
                        join.call_type,
                        join.audio_cbr,
                        true,
                        self.state == CallState::WaitConfigOutgoing,
                        now_ms,
                    );
                }
                return;
            }
        }

        if connected == 0 {
            let servers: Vec<_> = self.cfg.sft_servers.iter().take(3).cloned().collect();
            for server in servers {
                info!(url = %server.url, "connecting to sft from config");
                self.send_conf_conn(
                    &server.url,
                    server.username.clone(),
                    server.credential.clone(),
                    false,
                );
            }
        }

        self.set_state(CallState::ConnSent, now_ms);
        self.call_type = join.call_type;
        self.pending_join = None;
        if !self.is_caller {
            self.emit(CallEvent::Answered);
        }
        self.stop_others_ringing();
    }

    // --- stop ringing -------------------------------------------------------

    pub(crate) fn stop_others_ringing(&mut self) {
        if self.is_mls {
            self.stop_others_ringing_now();
        } else {
            // The SE list tells us which sibling devices exist; the answer
            // continues in `set_clients`.
            self.emit(CallEvent::RequestClients);
        }
    }

    pub(crate) fn stop_others_ringing_now(&mut self) {
        let payload = match self.stop_ringing_reason {
            StopRinging::Answered => Payload::ConfStart(self.confstart_payload()),
            StopRinging::Rejected => Payload::Reject,
            StopRinging::None => return,
        };
        self.stop_ringing_reason = StopRinging::None;

        let targets = self.roster.my_clients();
        info!(targets = targets.len(), "stopping sibling devices' ringing");
        if self.is_mls || !targets.is_empty() {
            self.send_to_peers(payload, true, Some(targets), true);
        }
    }

    // --- SE list ------------------------------------------------------------

    /// Host-delivered authorized-client list.
    pub fn set_clients(&mut self, clients: &[SeClient], epoch: u32, now_ms: u64) {
        let secret = self.secret.clone();
        let update = self.roster.update_from_se_list(clients, epoch, &secret);
        self.process_roster_events(now_ms);

        if update.changed {
            self.emit(CallEvent::GroupChanged);
        }

        if update.removed {
            self.someone_left = true;
            self.timers.start(
                TimerKind::RotateKey,
                now_ms,
                timers::ROTATE_KEY_FAST_TIMEOUT,
            );
        }

        if self.state == CallState::Active {
            if update.changed {
                info!("membership changed, refreshing confpart toward the sft");
                self.send_confpart_response();
            }
            self.send_keys(false);
        }

        if self.stop_ringing_reason != StopRinging::None {
            self.stop_others_ringing_now();
        }
    }

    // --- MLS keys -----------------------------------------------------------

    /// Install an MLS epoch key supplied by the host.
    pub fn set_media_key(&mut self, epoch: u32, key: &[u8], now_ms: u64) -> Result<()> {
        info!(epoch, len = key.len(), "installing media key");
        if !self.is_mls {
            warn!("set_media_key on a non-mls call");
            return Err(CoreError::InvalidArgument("not an mls call"));
        }

        self.keystore
            .set_session_key(epoch, key, now_ms)
            .map_err(Self::map_keystore_err)?;

        self.epoch_start_ts = now_ms;
        self.roster.set_latest_epoch(epoch);
        self.sync_props();
        self.sync_media_keys(now_ms);
        self.rotate_mls_timeout(now_ms);
        Ok(())
    }

    // --- peer messages ------------------------------------------------------

    /// A signalling message from a peer client, delivered by the backend.
    pub fn msg_recv(
        &mut self,
        _curr_time: u64,
        msg_time: u64,
        from_user: &UserId,
        from_client: &ClientId,
        msg: &SignalMessage,
        now_ms: u64,
    ) -> Result<()> {
        debug!(
            msg_type = msg.payload.type_name(),
            state = self.state.name(),
            "peer message"
        );
        match &msg.payload {
            Payload::ConfStart(_) | Payload::ConfCheck(_) => {
                self.handle_confstart_check(msg_time, from_user, from_client, msg, now_ms)
            }
            Payload::ConfEnd => {
                self.handle_confend(msg, now_ms);
                Ok(())
            }
            Payload::ConfKey(keys) => {
                if msg.resp {
                    self.handle_confkey_response(from_user, from_client, &keys.keyl, now_ms);
                } else {
                    self.handle_confkey_request(from_user, from_client);
                }
                Ok(())
            }
            Payload::Reject => {
                let self_uid = self.roster.self_member().userid.clone();
                if self.state == CallState::Incoming
                    && self_uid.is_some_and(|u| u.eq_ignore_case(from_user))
                {
                    self.timers.cancel(TimerKind::Ring);
                    self.emit(CallEvent::Leave {
                        reason: CallReason::StillOngoing,
                        msg_time: 0,
                    });
                    self.is_ringing = false;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Conflict resolution for concurrent starts plus ring control: the
    /// earlier `(timestamp, seqno)` pair wins.
    fn handle_confstart_check(
        &mut self,
        msg_time: u64,
        from_user: &UserId,
        from_client: &ClientId,
        msg: &SignalMessage,
        now_ms: u64,
    ) -> Result<()> {
        let (msg_ts, msg_seqno, msg_sft_url, msg_sft_tuple, msg_secret, sftl, valid_call) =
            match &msg.payload {
                Payload::ConfStart(cs) => (
                    cs.timestamp,
                    cs.seqno,
                    cs.sft_url.clone(),
                    cs.sft_tuple.clone(),
                    cs.secret.clone(),
                    cs.sftl.clone(),
                    msg.age < timers::CONFSTART_TIMEOUT_S,
                ),
                Payload::ConfCheck(cc) => (
                    cc.timestamp,
                    cc.seqno,
                    cc.sft_url.clone(),
                    cc.sft_tuple.clone(),
                    cc.secret.clone(),
                    cc.sftl.clone(),
                    !msg.is_request() && msg.age < timers::CONFSTART_TIMEOUT_S,
                ),
                _ => return Err(CoreError::InvalidArgument("not a start/check message")),
            };

        if !valid_call {
            info!(
                msg_type = msg.payload.type_name(),
                age = msg.age,
                "ignoring stale call announcement"
            );
            return Ok(());
        }

        // >0: remote wins, <0: local wins, 0: same call
        let ts_cmp: i64 = if self.sft_timestamp == 0 || msg_ts < self.sft_timestamp {
            1
        } else if msg_ts > self.sft_timestamp {
            -1
        } else {
            self.sft_seqno as i64 - msg_seqno as i64
        };

        info!(
            msg_type = msg.payload.type_name(),
            state = self.state.name(),
            ts_cmp,
            msg_ts,
            msg_seqno,
            local_ts = self.sft_timestamp,
            local_seqno = self.sft_seqno,
            keygenerator_me = self.roster.is_keygenerator_me(),
            "ordering contest"
        );

        if ts_cmp > 0 {
            // The remote call is earlier: adopt its identity wholesale.
            info!(url = %msg_sft_url, "adopting remote primary sft");
            self.primary_sft_url = Some(normalize_sft_url(&msg_sft_url));
            self.sft_tuple = msg_sft_tuple;
            self.sft_timestamp = msg_ts;
            self.sft_seqno = msg_seqno;
            self.keystore.reset();
            self.set_secret(msg_secret);
            self.is_caller = false;
            self.roster.reset_keygenerator();
        }

        match self.state {
            CallState::Idle => {
                let mut should_ring = msg.is_request()
                    && matches!(msg.payload, Payload::ConfStart(_))
                    && msg.age * 1000 < timers::SHOULD_RING_TIMEOUT;
                let self_uid = self.roster.self_member().userid.clone();
                if self_uid.is_some_and(|u| u.eq_ignore_case(from_user)) {
                    should_ring = false;
                }

                self.is_ringing = should_ring;
                self.set_state(CallState::Incoming, now_ms);
                self.emit(CallEvent::Incoming {
                    userid: from_user.clone(),
                    clientid: from_client.clone(),
                    msg_time,
                    video: false,
                    should_ring,
                });

                if should_ring {
                    self.timers
                        .start(TimerKind::Ring, now_ms, timers::RINGER_TIMEOUT);
                }
                if ts_cmp >= 0 {
                    self.sft_list = sftl;
                }
            }

            CallState::Incoming => {
                let self_uid = self.roster.self_member().userid.clone();
                if self_uid.is_some_and(|u| u.eq_ignore_case(from_user)) && self.is_ringing {
                    self.timers.cancel(TimerKind::Ring);
                    self.emit(CallEvent::Leave {
                        reason: CallReason::StillOngoing,
                        msg_time: 0,
                    });
                    self.is_ringing = false;
                }
                self.timers
                    .start(TimerKind::Ongoing, now_ms, timers::ONGOING_CALL_TIMEOUT);
                if ts_cmp >= 0 {
                    self.sft_list = sftl;
                }
            }

            CallState::ConnSent
            | CallState::SetupRecv
            | CallState::Connecting
            | CallState::Connected
            | CallState::WaitConfig
            | CallState::WaitConfigOutgoing => {
                if ts_cmp > 0 {
                    // Drop our connection attempt and join the earlier call.
                    if let Some(media) = self.media.as_mut() {
                        media.end();
                    }
                    self.media = None;
                    self.metrics.initiator = false;
                    self.sft_list = sftl;
                    self.req_cfg_join(self.call_type, true, false, false, now_ms);
                }
            }

            CallState::Active => {
                if ts_cmp > 0 {
                    if let Some(media) = self.media.as_mut() {
                        media.end();
                    }
                    self.media = None;
                    self.sft_list = sftl;
                    self.req_cfg_join(self.call_type, true, false, false, now_ms);
                } else if ts_cmp < 0 && self.roster.is_keygenerator_me() {
                    // Our call is earlier: reassert it.
                    info!("reasserting call with a fresh announcement");
                    self.send_to_peers(
                        Payload::ConfStart(self.confstart_payload()),
                        true,
                        None,
                        false,
                    );
                }
            }

            CallState::None | CallState::Terminating => {}
        }

        Ok(())
    }

    fn handle_confend(&mut self, msg: &SignalMessage, now_ms: u64) {
        match self.state {
            CallState::Incoming => {
                if msg.sessid_sender.eq_ignore_case(&self.convid_hash) {
                    self.set_state(CallState::Idle, now_ms);
                    let metrics = self.metrics.clone();
                    self.emit(CallEvent::Closed {
                        reason: CallReason::Normal,
                        metrics,
                        msg_time: 0,
                    });
                } else {
                    info!("ignoring call end for another session");
                }
            }
            CallState::Active => {
                // The call is in fact still ongoing; remind everyone.
                if self.roster.is_keygenerator_me() {
                    self.send_check_now(now_ms);
                }
            }
            _ => {
                info!(state = self.state.name(), "ignoring call end in current state");
            }
        }
    }

    fn handle_confkey_response(
        &mut self,
        from_user: &UserId,
        from_client: &ClientId,
        keys: &[huddle_signal::KeyEntry],
        now_ms: u64,
    ) {
        if !self.roster.has_keygenerator() {
            warn!("key response while keygenerator is unknown, latching a re-request");
            self.request_key = true;
            return;
        }
        if self.roster.is_keygenerator_me() {
            warn!("ignoring key response, keygenerator is self");
            return;
        }
        if !self.roster.is_keygenerator(from_user, from_client) {
            warn!("ignoring key response from a non-keygenerator");
            return;
        }

        self.keystore.set_salt(self.convid_hash.as_str().as_bytes());
        for key in keys {
            info!(index = key.idx, len = key.data.len(), "processing received key");
            match self.keystore.set_session_key(key.idx, &key.data, now_ms) {
                Ok(()) | Err(KeystoreError::AlreadyKnown) => {}
                Err(e) => {
                    warn!(index = key.idx, error = %e, "failed to install received key");
                    return;
                }
            }
        }
    }

    fn handle_confkey_request(&mut self, from_user: &UserId, from_client: &ClientId) {
        if !self.roster.is_keygenerator_me() {
            warn!("ignoring key request, not the keygenerator");
            return;
        }
        let Some(member) = self.roster.find_by_real_mut(from_user, from_client) else {
            warn!("ignoring key request from an unknown member");
            return;
        };
        if !member.incall_now {
            warn!("ignoring key request from a member not in the call");
            return;
        }
        member.needs_key = true;
        self.send_keys(false);
    }

    // --- SFT messages -------------------------------------------------------

    /// A message or HTTP outcome from an SFT (the response to an
    /// [`CallEvent::SftRequest`], or an asynchronous SETUP/UPDATE).
    pub fn sft_msg_recv(
        &mut self,
        status: u32,
        msg: Option<&SignalMessage>,
        now_ms: u64,
    ) -> Result<()> {
        info!(status, "sft message");
        if status >= SFT_STATUS_NETWORK_ERROR {
            warn!(status, "sft request failed at the network level");
            self.end_with_failure(CallFailure::Network, now_ms);
            return Ok(());
        }

        let Some(msg) = msg else {
            warn!(status, "sft response without a message");
            return Ok(());
        };

        if !self.convid_hash.is_empty()
            && !msg.sessid_sender.eq_ignore_case(&self.convid_hash)
        {
            warn!(theirs = %msg.sessid_sender, "ignoring sft message for another session");
            return Ok(());
        }

        match &msg.payload {
            Payload::ConfConn(conn) => {
                if conn.status != ConfConnStatus::Ok {
                    info!(status = ?conn.status, "join rejected by sft");
                    self.handle_sft_reject(conn.status, now_ms);
                }
                Ok(())
            }
            Payload::Setup(setup) => {
                if self.state != CallState::ConnSent {
                    info!(state = self.state.name(), "ignoring SETUP in current state");
                    return Ok(());
                }
                self.set_state(CallState::SetupRecv, now_ms);

                if let Some(url) = &setup.url {
                    if self.sft_url.is_none() {
                        info!(url = %url, "locking in selected sft");
                        self.sft_url = Some(normalize_sft_url(url));
                    }
                    if self.primary_sft_url.is_none() {
                        info!(url = %url, "recording primary sft");
                        self.primary_sft_url = Some(normalize_sft_url(url));
                        self.sft_tuple = setup.sft_tuple.clone();
                    }
                }
                self.forward_to_media(msg, now_ms)
            }
            Payload::Update(_) => {
                if self.state != CallState::ConnSent {
                    info!(state = self.state.name(), "ignoring UPDATE in current state");
                    return Ok(());
                }
                self.set_state(CallState::SetupRecv, now_ms);
                self.forward_to_media(msg, now_ms)
            }
            _ => self.forward_to_media(msg, now_ms),
        }
    }

    fn forward_to_media(&mut self, msg: &SignalMessage, now_ms: u64) -> Result<()> {
        if self.media.is_none() {
            self.create_media_session();
        }
        let response = self
            .media
            .as_mut()
            .expect("media session created above")
            .recv_message(msg);

        if let Some(response) = response {
            match self.sft_url.clone() {
                Some(url) => self.send_msg_sft(&url, response, now_ms),
                None => warn!("dropping media response, no sft selected"),
            }
        }
        Ok(())
    }

    fn handle_sft_reject(&mut self, status: ConfConnStatus, now_ms: u64) {
        if self.state != CallState::ConnSent {
            return;
        }
        self.set_state(CallState::Idle, now_ms);
        let reason = match status {
            ConfConnStatus::Ok => return,
            ConfConnStatus::RejectedBlacklist => CallReason::OutdatedClient,
            ConfConnStatus::RejectedAuthInvalid
            | ConfConnStatus::RejectedAuthLimit
            | ConfConnStatus::RejectedAuthExpired => CallReason::AuthFailed,
            ConfConnStatus::RejectedAuthCantstart => CallReason::AuthFailedStart,
        };
        self.emit(CallEvent::Leave {
            reason,
            msg_time: 0,
        });
        if let Some(media) = self.media.as_mut() {
            media.end();
        }
    }

    // --- media events -------------------------------------------------------

    /// Feed a media-session callback into the state machine.
    pub fn media_event(&mut self, event: MediaEvent, now_ms: u64) {
        match event {
            MediaEvent::DatachanEstablished => {
                if self.state == CallState::Connecting {
                    self.set_state(CallState::Connected, now_ms);
                } else {
                    info!(state = self.state.name(), "data channel established");
                }
                self.emit(CallEvent::DatachanEstablished);
            }
            MediaEvent::MediaEstablished => self.media_established(now_ms),
            MediaEvent::AudioEstablished => self.emit(CallEvent::AudioEstablished),
            MediaEvent::PingResponse => {
                self.last_ping = now_ms;
                self.expected_ping = 0;
                self.reconnect_attempts = 0;
                if self.inc_reconnects {
                    self.metrics.reconnects_successful += 1;
                    self.inc_reconnects = false;
                }
                debug!("ping arrived");
            }
            MediaEvent::Closed {
                error,
                msg_time,
                metrics,
            } => self.media_closed(error, msg_time, metrics, now_ms),
            MediaEvent::Propsync {
                userid_hash,
                clientid_hash,
                props,
            } => self.handle_propsync(&userid_hash, &clientid_hash, &props, now_ms),
            MediaEvent::ConfMessage(msg) => {
                if let Payload::ConfPart(part) = &msg.payload {
                    self.handle_confpart(part, now_ms);
                }
            }
            MediaEvent::AudioLevels(mut levels) => {
                let changed = self.roster.update_audio_levels(&mut levels);
                if changed {
                    self.emit(CallEvent::GroupChanged);
                }
                self.emit(CallEvent::AudioLevels { levels });
            }
            MediaEvent::Quality {
                rtt,
                uploss,
                downloss,
            } => self.handle_quality(rtt, uploss, downloss, now_ms),
        }
    }

    fn media_established(&mut self, now_ms: u64) {
        self.emit(CallEvent::MediaEstablished);

        if self.is_mls {
            self.emit(CallEvent::RequestNewEpoch);
        }

        if self.state != CallState::ConnSent {
            let old_state = self.state;
            self.set_state(CallState::Active, now_ms);
            self.roster.incall_clear(true, old_state == CallState::Active);
        } else {
            info!("refusing ACTIVE transition from CONNSENT");
        }
    }

    fn media_closed(
        &mut self,
        error: MediaClose,
        msg_time: u64,
        media_metrics: Option<crate::media::MediaMetrics>,
        now_ms: u64,
    ) {
        let should_end = self.roster.incall_count() == 0;
        info!(
            error = ?error,
            should_end,
            members = self.roster.count(),
            "media session closed"
        );

        self.roster.reset_keygenerator();

        if matches!(error, MediaClose::IceRestart | MediaClose::NotConnected) {
            self.reconnect_attempts = 0;
            self.expected_ping = 0;
            self.last_ping = 0;
            self.reconnect(
                msg_time,
                error == MediaClose::NotConnected,
                error == MediaClose::IceRestart,
                now_ms,
            );
            return;
        }

        self.roster.incall_clear(false, false);
        self.media = None;

        let failure = self.failure;
        if matches!(
            failure,
            None | Some(CallFailure::NooneJoined) | Some(CallFailure::EveryoneLeft)
        ) && should_end
            && self.received_confpart
        {
            self.send_to_peers(Payload::ConfEnd, false, None, false);
        }

        if let Some(m) = media_metrics {
            self.metrics.duration_call_secs = now_ms.saturating_sub(self.ts_start) / 1000;
            self.metrics.duration_active_secs += m.duration_secs;
            self.metrics.packetloss_last = m.packetloss_last;
            self.metrics.packetloss_max = self.metrics.packetloss_max.max(m.packetloss_max);
            self.metrics.rtt_last = m.rtt_last;
            self.metrics.rtt_max = self.metrics.rtt_max.max(m.rtt_max);
        }

        if should_end {
            self.set_state(CallState::Idle, now_ms);
            let metrics = self.metrics.clone();
            self.emit(CallEvent::Closed {
                reason: crate::engine::failure_reason(failure),
                metrics,
                msg_time,
            });
        } else {
            self.set_state(CallState::Incoming, now_ms);
            self.emit(CallEvent::Leave {
                reason: CallReason::StillOngoing,
                msg_time,
            });
        }
        self.failure = None;
    }

    fn handle_propsync(
        &mut self,
        userid_hash: &huddle_core::IdHash,
        clientid_hash: &huddle_core::IdHash,
        props: &std::collections::BTreeMap<String, String>,
        now_ms: u64,
    ) {
        let videosend = props.get("videosend").map(String::as_str);
        let screensend = props.get("screensend").map(String::as_str);
        let muted = props.get("muted").map(String::as_str);
        let keysync: u32 = props
            .get("keysync")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        debug!(
            %userid_hash,
            videosend = videosend.unwrap_or(""),
            muted = muted.unwrap_or(""),
            keysync,
            "props update"
        );

        let Some(member) = self.roster.find_by_hash_mut(userid_hash, clientid_hash) else {
            return;
        };
        let mut group_changed = false;
        let mut vstate_event = None;
        let mut epoch_changed = false;

        let vstate = match (screensend, videosend) {
            (Some("true"), _) => Some(VideoState::ScreenShare),
            (_, Some("true")) => Some(VideoState::Started),
            (Some(_), _) | (_, Some(_)) => Some(VideoState::Stopped),
            (None, None) => None,
        };
        if let Some(vstate) = vstate {
            if vstate != member.video_state {
                info!(
                    from = member.video_state.name(),
                    to = vstate.name(),
                    "member video state changed"
                );
                member.video_state = vstate;
                if let (Some(userid), Some(clientid)) =
                    (member.userid.clone(), member.clientid.clone())
                {
                    vstate_event = Some((userid, clientid, vstate));
                }
                group_changed = true;
            }
        }

        if let Some(muted) = muted {
            let muted = muted == "true";
            if muted != member.muted {
                member.muted = muted;
                group_changed = true;
            }
        }

        if keysync > 0 && keysync != member.latest_epoch {
            member.latest_epoch = keysync;
            epoch_changed = true;
        }

        if let Some((userid, clientid, state)) = vstate_event {
            self.emit(CallEvent::VstateChanged {
                userid,
                clientid,
                state,
            });
        }
        if group_changed {
            self.emit(CallEvent::GroupChanged);
        }
        if epoch_changed {
            self.sync_media_keys(now_ms);
        }
        self.update_active_counts();
    }

    fn handle_quality(&mut self, rtt: i32, uploss: i32, mut downloss: i32, now_ms: u64) {
        if self.state != CallState::Active {
            return;
        }

        let ping_age = now_ms.saturating_sub(self.last_ping);
        debug!(rtt, uploss, downloss, missing_pings = self.expected_ping, ping_age, "quality report");

        let mut degrade = downloss > 20;
        if self.expected_ping >= timers::QUALITY_POOR_MISSING {
            degrade = true;
            downloss = 30;
        } else if self.expected_ping > timers::QUALITY_MEDIUM_MISSING {
            degrade = true;
            downloss = 10;
        }

        if RESOLUTION_DEGRADE && degrade {
            let requests: Vec<_> = self
                .video_requests
                .iter()
                .map(|r| {
                    let quality = if r.vstate != VideoState::ScreenShare
                        && r.quality >= crate::engine::RESOLUTION_HIGH
                    {
                        crate::engine::RESOLUTION_LOW
                    } else {
                        r.quality
                    };
                    (r.userid.clone(), r.clientid.clone(), quality)
                })
                .collect();
            let downgraded = requests
                .iter()
                .zip(self.video_requests.iter())
                .any(|(new, old)| new.2 != old.quality);
            if downgraded && !requests.is_empty() {
                let _ = self.request_video_streams(&requests);
            }
        }

        self.emit(CallEvent::Quality {
            userid: None,
            clientid: None,
            rtt,
            uploss,
            downloss,
            reconnecting: false,
        });
    }

    // --- CONFPART -----------------------------------------------------------

    pub(crate) fn handle_confpart(&mut self, part: &ConfPart, now_ms: u64) {
        let first_confpart = !self.received_confpart;
        let mut should_start = part.should_start;

        info!(
            should_start,
            members = part.partl.len(),
            ts = part.timestamp,
            seqno = part.seqno,
            first = first_confpart,
            "participant snapshot"
        );

        if !should_start
            && self.is_caller
            && self.sft_timestamp == 0
            && self.sft_seqno == 0
            && part.partl.len() == 1
        {
            // We started the call, got a very quick datachannel, and missed
            // the initial snapshot due to an UPDATE.
            info!("forcing should_start for missed initial snapshot");
            should_start = true;
        }

        self.received_confpart = true;
        self.keep_confpart_data(part);
        if should_start {
            self.metrics.initiator = true;
        }

        if should_start && self.is_caller {
            self.sft_timestamp = part.timestamp;
            self.sft_seqno = part.seqno;
            info!("announcing the call");
            self.send_to_peers(Payload::ConfStart(self.confstart_payload()), false, None, false);
        } else if self.sft_timestamp == 0 && self.sft_seqno == 0 {
            self.sft_timestamp = part.timestamp;
            self.sft_seqno = part.seqno;
            warn!("adopting snapshot ordering pair, local one was unset");
        }

        if part.partl.len() > 1 {
            self.timers.cancel(TimerKind::Alone);
            self.someone_joined = true;
        } else {
            let period = if self.someone_joined {
                timers::EVERYONE_LEFT_TIMEOUT
            } else {
                timers::NOONE_JOINED_TIMEOUT
            };
            self.timers.start(TimerKind::Alone, now_ms, period);
        }

        if first_confpart && self.media.is_some() {
            self.sync_props();
        }

        let update = self.roster.update_from_sft_list(&part.partl);
        self.process_roster_events(now_ms);

        self.send_confpart_response();

        if update.self_changed {
            let (ssrca, ssrcv) = {
                let s = self.roster.self_member();
                (s.ssrca, s.ssrcv)
            };
            if let Some(media) = self.media.as_mut() {
                media.update_ssrc(ssrca, ssrcv);
            }
        }

        if update.list_changed {
            self.emit(CallEvent::GroupChanged);
            if self.roster.is_keygenerator_me() && !self.is_mls {
                self.send_keys(false);
            }
        }

        if update.missing_parts {
            self.emit(CallEvent::RequestClients);
        }

        let sft_changed = sft_list_changed(&self.sft_list, &part.sftl);
        self.sft_list = part.sftl.clone();
        if self.roster.is_keygenerator_me() && !should_start && sft_changed {
            info!("sft list changed, sending immediate check");
            self.send_check_now(now_ms);
        }
    }

    /// Serialise the snapshot the keygenerator mixes into key derivation:
    /// timestamp, seqno, entropy, then per member the user hash and SSRCs,
    /// all big-endian.
    fn keep_confpart_data(&mut self, part: &ConfPart) {
        let mut data = Vec::with_capacity(16 + part.entropy.len() + part.partl.len() * 16);
        data.extend_from_slice(&part.timestamp.to_be_bytes());
        data.extend_from_slice(&part.seqno.to_be_bytes());
        data.extend_from_slice(&part.entropy);
        for p in &part.partl {
            data.extend_from_slice(p.userid.as_str().as_bytes());
            data.extend_from_slice(&p.ssrca.to_be_bytes());
            data.extend_from_slice(&p.ssrcv.to_be_bytes());
        }
        self.confpart_data = data;
    }

    /// Confirm the roster back to the SFT over the data channel.
    pub(crate) fn send_confpart_response(&mut self) {
        let partl = self.roster.partlist(self.is_mls);
        let mut msg = SignalMessage::response(Payload::ConfPart(ConfPart {
            timestamp: 0,
            seqno: 0,
            entropy: Vec::new(),
            should_start: false,
            partl,
            sftl: Vec::new(),
        }));
        self.address_to_sft(&mut msg);

        match huddle_signal::encode(&msg) {
            Ok(payload) => {
                if let Some(media) = self.media.as_mut() {
                    media.send_data(&payload);
                }
            }
            Err(e) => warn!(error = %e, "failed to encode confpart response"),
        }
    }

    // --- roster events ------------------------------------------------------

    pub(crate) fn process_roster_events(&mut self, now_ms: u64) {
        for event in self.roster.drain_events() {
            match event {
                RosterEvent::AddUser {
                    userid,
                    clientid,
                    userid_hash,
                    ssrca,
                    ssrcv,
                    video_state,
                } => {
                    debug!(user = %userid, ssrca, ssrcv, "adding decoders");
                    if let Some(media) = self.media.as_mut() {
                        media.add_decoder(&userid, &clientid, &userid_hash, ssrca, ssrcv);
                    }
                    if video_state != VideoState::Stopped && ssrcv > 0 {
                        self.emit(CallEvent::VstateChanged {
                            userid,
                            clientid,
                            state: video_state,
                        });
                    }
                }
                RosterEvent::RemoveUser {
                    userid,
                    clientid,
                    ssrca,
                    ssrcv,
                    video_state,
                    fire_vstate,
                } => {
                    debug!(user = %userid, "removing decoders");
                    self.someone_left = true;
                    if let Some(media) = self.media.as_mut() {
                        media.remove_decoder(&userid, &clientid, ssrca, ssrcv);
                    }
                    if fire_vstate && video_state != VideoState::Stopped {
                        self.emit(CallEvent::VstateChanged {
                            userid,
                            clientid,
                            state: VideoState::Stopped,
                        });
                    }
                }
                RosterEvent::SyncMembers => {
                    if let Some(media) = self.media.as_mut() {
                        media.sync_decoders();
                    }
                    self.update_active_counts();
                }
                RosterEvent::KeygenChanged { is_me, is_first } => {
                    self.keygenerator_changed(is_me, is_first, now_ms);
                }
                RosterEvent::VstateChanged {
                    userid,
                    clientid,
                    state,
                } => {
                    self.emit(CallEvent::VstateChanged {
                        userid,
                        clientid,
                        state,
                    });
                }
            }
        }
    }

    fn keygenerator_changed(&mut self, is_me: bool, is_first: bool, now_ms: u64) {
        if is_me {
            info!("elected keygenerator");
            if !self.is_mls {
                match self.keystore.current() {
                    Err(_) => {
                        info!("generating initial session key");
                        if let Err(e) = self.generate_session_key(true, now_ms) {
                            warn!(error = %e, "initial key generation failed");
                        }
                    }
                    Ok(_) => {
                        // Taking over mid-call: mark a new generation so the
                        // next rotation bumps into a fresh range.
                        self.became_kg = true;
                    }
                }
                self.timers.start(
                    TimerKind::RotateKey,
                    now_ms,
                    timers::ROTATE_KEY_FIRST_TIMEOUT,
                );
            }

            if is_first {
                self.timers
                    .start(TimerKind::SendCheck, now_ms, timers::SEND_CHECK_TIMEOUT);
            } else {
                self.send_check_now(now_ms);
            }
        } else {
            info!("keygenerator is a peer");
            if self.request_key {
                info!("requesting key resend from the new keygenerator");
                self.request_keys();
                self.request_key = false;
            }
            self.timers.cancel(TimerKind::SendCheck);
            self.timers.cancel(TimerKind::RotateKey);
        }
    }
}

/// Compare SFT lists ignoring trailing slashes.
fn sft_list_changed(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return true;
    }
    !a.iter()
        .zip(b.iter())
        .all(|(x, y)| huddle_core::config::sft_urls_equal(x, y))
}
