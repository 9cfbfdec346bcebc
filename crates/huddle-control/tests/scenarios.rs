// End-to-end scenarios driven against the controller with a scripted media
// session: simultaneous starts, key rotation on leave, decrypt recovery,
// reconnect exhaustion, and MLS epoch handling.

use std::sync::{Arc, Mutex};

use huddle_control::{
    CallEvent, CallState, ConfCall, MediaClose, MediaEvent, MediaSession, MediaSessionParams,
    SFT_STATUS_NETWORK_ERROR,
};
use huddle_core::{
    hash, CallConfig, CallReason, CallType, ClientId, IdHash, MediaSystemContext, SftServer,
    UserId, VideoState,
};
use huddle_roster::SeClient;
use huddle_signal::{
    ConfKey, ConfPart, KeyEntry, PartMember, Payload, Setup, SignalMessage,
};

const SFT_URL: &str = "https://sft1.example.com/";

/// Media session that answers SETUPs with a rewritten SDP and records every
/// call for assertions.
struct StubMedia {
    log: Arc<Mutex<Vec<String>>>,
}

impl MediaSession for StubMedia {
    fn recv_message(&mut self, msg: &SignalMessage) -> Option<SignalMessage> {
        match &msg.payload {
            Payload::Setup(setup) | Payload::Update(setup) => {
                self.log.lock().unwrap().push(format!(
                    "recv:{}",
                    msg.payload.type_name().to_lowercase()
                ));
                let sdp = huddle_sdp::modify_answer(&setup.sdp, true, true, "huddle test");
                Some(SignalMessage::response(Payload::Setup(Setup {
                    sdp,
                    url: None,
                    sft_tuple: None,
                })))
            }
            _ => None,
        }
    }

    fn send_data(&mut self, payload: &str) {
        self.log.lock().unwrap().push(format!("data:{payload}"));
    }

    fn set_sessid(&mut self, sessid: &IdHash) {
        self.log.lock().unwrap().push(format!("sessid:{sessid}"));
    }

    fn update_ssrc(&mut self, ssrca: u32, ssrcv: u32) {
        self.log
            .lock()
            .unwrap()
            .push(format!("ssrc:{ssrca}/{ssrcv}"));
    }

    fn add_decoder(
        &mut self,
        userid: &UserId,
        _clientid: &ClientId,
        _userid_hash: &IdHash,
        _ssrca: u32,
        _ssrcv: u32,
    ) {
        self.log.lock().unwrap().push(format!("add_decoder:{userid}"));
    }

    fn remove_decoder(&mut self, userid: &UserId, _clientid: &ClientId, _ssrca: u32, _ssrcv: u32) {
        self.log
            .lock()
            .unwrap()
            .push(format!("remove_decoder:{userid}"));
    }

    fn sync_decoders(&mut self) {
        self.log.lock().unwrap().push("sync_decoders".to_string());
    }

    fn set_video_send_state(&mut self, state: VideoState) {
        self.log
            .lock()
            .unwrap()
            .push(format!("vstate:{}", state.name()));
    }

    fn set_local_prop(&mut self, key: &str, value: &str) {
        self.log.lock().unwrap().push(format!("prop:{key}={value}"));
    }

    fn sync_props(&mut self) {
        self.log.lock().unwrap().push("sync_props".to_string());
    }

    fn update_mute(&mut self) {
        self.log.lock().unwrap().push("update_mute".to_string());
    }

    fn media_start(&mut self) {}
    fn media_stop(&mut self) {}

    fn ping(&mut self) {
        self.log.lock().unwrap().push("ping".to_string());
    }

    fn set_quality_interval(&mut self, _interval_ms: u64) {}

    fn restart(&mut self, _call_type: CallType) {
        self.log.lock().unwrap().push("restart".to_string());
    }

    fn activate(&mut self, _active: bool) {}

    fn end(&mut self) {
        self.log.lock().unwrap().push("end".to_string());
    }
}

struct Harness {
    call: ConfCall,
    media_log: Arc<Mutex<Vec<String>>>,
    now: u64,
}

impl Harness {
    fn new(is_mls: bool) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let factory_log = log.clone();
        let ctx = MediaSystemContext::new("huddle", "0.3.1", Some("test"));
        let call = ConfCall::new(
            "conv-1".into(),
            "self".into(),
            "dev0".into(),
            is_mls,
            Box::new(move |_params: MediaSessionParams| {
                Box::new(StubMedia {
                    log: factory_log.clone(),
                }) as Box<dyn MediaSession>
            }),
            ctx,
        );
        Self {
            call,
            media_log: log,
            now: 10_000,
        }
    }

    fn advance(&mut self, ms: u64) {
        self.now += ms;
        self.call.tick(self.now);
    }

    fn config() -> CallConfig {
        CallConfig {
            sft_servers: vec![SftServer {
                url: SFT_URL.into(),
                username: None,
                credential: None,
            }],
            sft_servers_all: Vec::new(),
            ice_servers: Vec::new(),
            is_federating: false,
        }
    }

    fn events(&mut self) -> Vec<CallEvent> {
        self.call.drain_events()
    }

    fn setup_msg(&self) -> SignalMessage {
        let mut msg = SignalMessage::response(Payload::Setup(Setup {
            sdp: "v=0\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
                  a=rtpmap:111 opus/48000/2\r\na=fmtp:111 minptime=10\r\n"
                .to_string(),
            url: Some(SFT_URL.to_string()),
            sft_tuple: None,
        }));
        msg.sessid_sender = self.call.conv_hash().clone();
        msg.src_userid = "SFT".into();
        msg.src_clientid = "SFT".into();
        msg
    }

    /// Drive an outgoing call up to ACTIVE.
    fn go_active(&mut self) {
        self.call
            .start(CallType::Normal, true, self.now)
            .expect("start");
        assert!(self
            .events()
            .iter()
            .any(|e| matches!(e, CallEvent::RequestConfig)));
        assert_eq!(self.call.state(), CallState::WaitConfigOutgoing);

        self.call.set_config(Self::config(), self.now);
        let events = self.events();
        assert!(events.iter().any(
            |e| matches!(e, CallEvent::SftRequest { msg, .. } if matches!(msg.payload, Payload::ConfConn(_)))
        ));
        assert_eq!(self.call.state(), CallState::ConnSent);

        let setup = self.setup_msg();
        self.call
            .sft_msg_recv(0, Some(&setup), self.now)
            .expect("setup");
        assert_eq!(self.call.state(), CallState::Connecting);

        self.call
            .media_event(MediaEvent::DatachanEstablished, self.now);
        assert_eq!(self.call.state(), CallState::Connected);
        self.call.media_event(MediaEvent::MediaEstablished, self.now);
        assert_eq!(self.call.state(), CallState::Active);
        self.events();
    }

    fn approve_clients(&mut self, clients: &[(&str, &str)]) {
        let sel: Vec<SeClient> = clients
            .iter()
            .map(|(u, c)| SeClient {
                userid: (*u).into(),
                clientid: (*c).into(),
                in_subconv: false,
            })
            .collect();
        self.call.set_clients(&sel, 0, self.now);
        self.events();
    }

    fn member_part(&self, userid: &str, clientid: &str, ssrca: u32) -> PartMember {
        PartMember {
            userid: self
                .call
                .member_wire_hash(&userid.into(), &clientid.into())
                .expect("member known"),
            clientid: hash::CLIENT_HASH.into(),
            ssrca,
            ssrcv: 0,
            muted: None,
            authorized: false,
        }
    }

    fn self_part(&self, ssrca: u32) -> PartMember {
        let (userid, clientid) = self.call.self_wire_hash();
        PartMember {
            userid,
            clientid,
            ssrca,
            ssrcv: 0,
            muted: None,
            authorized: false,
        }
    }

    fn stranger_part(&self) -> PartMember {
        PartMember {
            userid: "stranger-hash".into(),
            clientid: hash::CLIENT_HASH.into(),
            ssrca: 99,
            ssrcv: 0,
            muted: None,
            authorized: false,
        }
    }

    /// Advance in keepalive-sized steps, answering every ping so the link
    /// counts as healthy.
    fn advance_with_pings(&mut self, total_ms: u64) {
        let mut remaining = total_ms;
        while remaining > 0 {
            let step = remaining.min(5_000);
            self.advance(step);
            self.call.media_event(MediaEvent::PingResponse, self.now);
            remaining -= step;
        }
    }

    fn deliver_confpart(&mut self, timestamp: u64, seqno: u32, should_start: bool, partl: Vec<PartMember>) {
        let msg = SignalMessage::response(Payload::ConfPart(ConfPart {
            timestamp,
            seqno,
            entropy: vec![0xee; 8],
            should_start,
            partl,
            sftl: vec![SFT_URL.to_string()],
        }));
        self.call.media_event(MediaEvent::ConfMessage(msg), self.now);
    }
}

fn sent_peer_messages(events: &[CallEvent]) -> Vec<&SignalMessage> {
    events
        .iter()
        .filter_map(|e| match e {
            CallEvent::SendToPeers { msg, .. } => Some(msg),
            _ => None,
        })
        .collect()
}

// --- scenario 1: simultaneous start ----------------------------------------

#[test]
fn simultaneous_start_later_caller_adopts_earlier_call() {
    let mut h = Harness::new(false);
    h.go_active();
    h.approve_clients(&[("alice", "a1")]);

    // Our SFT stamps us (ts 1000, seq 1) and confirms we should announce.
    h.deliver_confpart(1000, 1, true, vec![h.self_part(1)]);
    let events = h.events();
    let starts = sent_peer_messages(&events);
    assert!(
        starts
            .iter()
            .any(|m| matches!(&m.payload, Payload::ConfStart(cs) if cs.timestamp == 1000 && cs.seqno == 1)),
        "caller announces its call"
    );

    // Alice's call is earlier: (1000, 0) beats (1000, 1).
    let remote_secret = vec![0x55u8; 16];
    let mut msg = SignalMessage::new(Payload::ConfStart(huddle_signal::ConfStart {
        timestamp: 1000,
        seqno: 0,
        secret: remote_secret.clone(),
        sft_url: "https://sft2.example.com/".into(),
        sft_tuple: None,
        sftl: vec!["https://sft2.example.com/".into()],
        props: Default::default(),
    }));
    msg.src_userid = "alice".into();
    msg.src_clientid = "a1".into();

    h.call
        .msg_recv(0, 0, &"alice".into(), &"a1".into(), &msg, h.now)
        .expect("confstart");

    // We drop our attempt and re-join toward alice's call.
    assert_eq!(h.call.state(), CallState::WaitConfig);
    assert!(h
        .events()
        .iter()
        .any(|e| matches!(e, CallEvent::RequestConfig)));
    // The adopted secret now drives our wire identity.
    let (self_hash, _) = h.call.self_wire_hash();
    assert_eq!(
        self_hash,
        hash::user_hash(&remote_secret, &"self".into(), &"dev0".into())
    );
    assert!(h.media_log.lock().unwrap().iter().any(|l| l == "end"));
}

#[test]
fn earlier_keygenerator_reasserts_against_later_start() {
    let mut h = Harness::new(false);
    h.go_active();
    h.approve_clients(&[("alice", "a1")]);
    h.deliver_confpart(1000, 1, true, vec![h.self_part(1)]);
    h.events();

    // A later announcement must not displace us; we answer with our own.
    let mut msg = SignalMessage::new(Payload::ConfStart(huddle_signal::ConfStart {
        timestamp: 2000,
        seqno: 0,
        secret: vec![0x66; 16],
        sft_url: "https://sft3.example.com/".into(),
        sft_tuple: None,
        sftl: vec![],
        props: Default::default(),
    }));
    msg.src_userid = "alice".into();
    msg.src_clientid = "a1".into();
    h.call
        .msg_recv(0, 0, &"alice".into(), &"a1".into(), &msg, h.now)
        .expect("confstart");

    assert_eq!(h.call.state(), CallState::Active);
    let events = h.events();
    let reassert = sent_peer_messages(&events);
    assert!(reassert
        .iter()
        .any(|m| m.resp && matches!(&m.payload, Payload::ConfStart(cs) if cs.timestamp == 1000)));
}

// --- scenario 2/3: election and leaver rotation -----------------------------

#[test]
fn elected_keygenerator_generates_and_distributes_keys() {
    let mut h = Harness::new(false);
    h.go_active();
    h.approve_clients(&[("alice", "a1")]);

    // Self heads the list: elected, generates index 0, sends it to alice.
    h.deliver_confpart(1000, 1, true, vec![h.self_part(1), h.member_part("alice", "a1", 10)]);
    let events = h.events();
    let keys: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            CallEvent::SendToPeers { msg, targets, .. } => match &msg.payload {
                Payload::ConfKey(k) if msg.resp => Some((k, targets.clone())),
                _ => None,
            },
            _ => None,
        })
        .collect();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].0.keyl[0].idx, 0);
    assert_eq!(
        keys[0].1.as_deref(),
        Some(&[("alice".into(), "a1".into())][..])
    );
    assert!(h.call.keystore().has_keys());
}

#[test]
fn leaver_triggers_fast_rotation_into_new_generation() {
    let mut h = Harness::new(false);
    h.go_active();
    h.approve_clients(&[("alice", "a1"), ("bob", "b1")]);
    h.deliver_confpart(
        1000,
        1,
        true,
        vec![
            h.self_part(1),
            h.member_part("alice", "a1", 10),
            h.member_part("bob", "b1", 20),
        ],
    );
    h.events();

    h.advance(5_000);
    h.call.media_event(MediaEvent::PingResponse, h.now);
    h.advance(30_000);
    h.call.media_event(MediaEvent::PingResponse, h.now);
    assert_eq!(h.call.keystore().current().unwrap().0, 0);

    // Alice leaves: the snapshot shrinks to self and bob.
    h.deliver_confpart(1000, 2, false, vec![h.self_part(1), h.member_part("bob", "b1", 20)]);
    h.events();

    // The rotation after the leave must land in a strictly higher
    // generation than anything alice ever held.
    let max_before = h.call.keystore().max_key_index();
    h.advance(30_000);
    let events = h.events();
    let max_after = h.call.keystore().max_key_index();
    assert!(
        max_after >= 0x10000 && max_after > max_before,
        "expected a new generation, got {max_after:#x} (before {max_before:#x})"
    );
    let key_msgs = sent_peer_messages(&events);
    assert!(
        key_msgs
            .iter()
            .any(|m| matches!(&m.payload, Payload::ConfKey(k) if k.keyl.iter().any(|e| e.idx == max_after))),
        "fresh key is distributed to remaining members"
    );
}

// --- scenario 4: decrypt-check recovery -------------------------------------

#[test]
fn decrypt_check_requests_keys_from_keygenerator() {
    let mut h = Harness::new(false);
    h.go_active();
    h.approve_clients(&[("alice", "a1")]);

    // Alice heads the list: she is the keygenerator, we hold no keys.
    h.deliver_confpart(1000, 0, false, vec![h.member_part("alice", "a1", 10), h.self_part(1)]);
    h.events();
    assert!(!h.call.keystore().has_keys());

    h.advance(5_000);
    let events = h.events();
    let requests = sent_peer_messages(&events);
    let req = requests
        .iter()
        .find(|m| matches!(&m.payload, Payload::ConfKey(_)) && m.is_request())
        .expect("key request toward the keygenerator");
    assert!(matches!(&req.payload, Payload::ConfKey(k) if k.keyl.is_empty()));

    // Alice responds with current + next; both install.
    let resp = SignalMessage::response(Payload::ConfKey(ConfKey {
        keyl: vec![
            KeyEntry {
                idx: 0,
                data: vec![1u8; 32],
            },
            KeyEntry {
                idx: 1,
                data: vec![2u8; 32],
            },
        ],
    }));
    h.call
        .msg_recv(0, 0, &"alice".into(), &"a1".into(), &resp, h.now)
        .expect("confkey");
    assert!(h.call.keystore().has_keys());
    assert_eq!(h.call.keystore().next_key().unwrap().0, 1);
}

#[test]
fn confkey_response_from_non_keygenerator_is_ignored() {
    let mut h = Harness::new(false);
    h.go_active();
    h.approve_clients(&[("alice", "a1"), ("eve", "e1")]);
    h.deliver_confpart(
        1000,
        0,
        false,
        vec![
            h.member_part("alice", "a1", 10),
            h.self_part(1),
            h.member_part("eve", "e1", 30),
        ],
    );
    h.events();

    let resp = SignalMessage::response(Payload::ConfKey(ConfKey {
        keyl: vec![KeyEntry {
            idx: 0,
            data: vec![9u8; 32],
        }],
    }));
    h.call
        .msg_recv(0, 0, &"eve".into(), &"e1".into(), &resp, h.now)
        .expect("confkey");
    assert!(!h.call.keystore().has_keys());
}

// --- scenario 5: reconnect ---------------------------------------------------

#[test]
fn ice_restart_reenters_connsent_with_update() {
    let mut h = Harness::new(false);
    h.go_active();
    h.deliver_confpart(1000, 1, true, vec![h.self_part(1)]);
    h.events();

    h.call.media_event(
        MediaEvent::Closed {
            error: MediaClose::IceRestart,
            msg_time: 0,
            metrics: None,
        },
        h.now,
    );

    assert_eq!(h.call.state(), CallState::ConnSent);
    let events = h.events();
    let update = events.iter().find_map(|e| match e {
        CallEvent::SftRequest { msg, .. } => match &msg.payload {
            Payload::ConfConn(conn) => Some(conn.update),
            _ => None,
        },
        _ => None,
    });
    assert_eq!(update, Some(true));
}

#[test]
fn reconnects_exhaust_into_timeout() {
    let mut h = Harness::new(false);
    h.go_active();
    h.deliver_confpart(1000, 1, true, vec![h.self_part(1)]);
    h.events();

    // Three full silent-keepalive cycles re-enter CONNSENT; the fourth gives
    // up with TIMEOUT / STILL_ONGOING.
    for attempt in 1..=3 {
        for _ in 0..5 {
            h.advance(5_000);
        }
        assert_eq!(h.call.state(), CallState::ConnSent, "attempt {attempt}");
        h.events();

        let setup = h.setup_msg();
        h.call.sft_msg_recv(0, Some(&setup), h.now).expect("setup");
        h.call.media_event(MediaEvent::MediaEstablished, h.now);
        h.deliver_confpart(1000, 1, false, vec![h.self_part(1)]);
        h.events();
        assert_eq!(h.call.state(), CallState::Active);
    }

    for _ in 0..5 {
        h.advance(5_000);
    }
    let events = h.events();
    assert!(events.iter().any(
        |e| matches!(e, CallEvent::Leave { reason: CallReason::StillOngoing, .. })
    ));
    assert!(h.media_log.lock().unwrap().iter().any(|l| l == "end"));
}

// --- scenario 6: MLS epochs --------------------------------------------------

#[test]
fn mls_epoch_key_installs_and_syncs() {
    let mut h = Harness::new(true);
    h.go_active();
    h.deliver_confpart(1000, 1, true, vec![h.self_part(1), h.stranger_part()]);
    h.events();

    let key = vec![7u8; 32];
    h.call.set_media_key(7, &key, h.now).expect("media key");

    assert_eq!(h.call.keystore().current().unwrap().0, 7);
    let log = h.media_log.lock().unwrap().clone();
    assert!(log.iter().any(|l| l == "prop:keysync=7"));
    assert!(log.iter().any(|l| l == "sync_props"));

    // Ten seconds later nothing rotates (no staged next key).
    h.advance_with_pings(10_000);
    assert_eq!(h.call.keystore().current().unwrap().0, 7);
}

#[test]
fn mls_rejects_generation_and_nonmls_rejects_epoch_keys() {
    let mut mls = Harness::new(true);
    mls.go_active();
    // CONFKEY requests never fire for MLS calls even without local keys.
    mls.deliver_confpart(1000, 0, false, vec![mls.self_part(1)]);
    mls.events();
    mls.advance(5_000);
    let events = mls.events();
    assert!(sent_peer_messages(&events)
        .iter()
        .all(|m| !matches!(&m.payload, Payload::ConfKey(_))));

    let mut plain = Harness::new(false);
    let err = plain.call.set_media_key(1, &[1u8; 32], plain.now).unwrap_err();
    assert_eq!(err.code(), "INVALID_ARGUMENT");
}

#[test]
fn stale_epoch_asks_host_for_new_one() {
    let mut h = Harness::new(true);
    h.go_active();
    h.call.set_media_key(7, &[7u8; 32], h.now).expect("key");
    // Self must be the keygenerator for send-check duty; company keeps the
    // alone timer out of the picture.
    h.deliver_confpart(1000, 1, true, vec![h.self_part(1), h.stranger_part()]);
    h.events();

    h.advance_with_pings(60_000);
    let events = h.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, CallEvent::RequestNewEpoch)));
}

// --- boundaries --------------------------------------------------------------

#[test]
fn confstart_age_bounds_control_ringing_and_validity() {
    fn incoming_with_age(age: u64) -> (CallState, bool) {
        let mut h = Harness::new(false);
        let mut msg = SignalMessage::new(Payload::ConfStart(huddle_signal::ConfStart {
            timestamp: 1000,
            seqno: 0,
            secret: vec![1u8; 16],
            sft_url: SFT_URL.into(),
            sft_tuple: None,
            sftl: vec![],
            props: Default::default(),
        }));
        msg.age = age;
        msg.src_userid = "alice".into();
        msg.src_clientid = "a1".into();
        h.call
            .msg_recv(0, 0, &"alice".into(), &"a1".into(), &msg, h.now)
            .expect("confstart");
        let should_ring = h.events().iter().any(
            |e| matches!(e, CallEvent::Incoming { should_ring: true, .. }),
        );
        (h.call.state(), should_ring)
    }

    // 119 s old: joinable but silent; 121 s: ignored entirely.
    assert_eq!(incoming_with_age(119), (CallState::Incoming, false));
    assert_eq!(incoming_with_age(121), (CallState::Idle, false));
    // Inside the 30 s ringing window the host rings.
    assert_eq!(incoming_with_age(29), (CallState::Incoming, true));
    assert_eq!(incoming_with_age(31), (CallState::Incoming, false));
}

#[test]
fn alone_timer_arms_on_solo_snapshot_and_clears_on_company() {
    let mut h = Harness::new(false);
    h.go_active();
    h.approve_clients(&[("alice", "a1")]);

    // Solo snapshot arms the no-one-joined timer.
    h.deliver_confpart(1000, 1, true, vec![h.self_part(1)]);
    h.events();

    // Company arrives before it fires: the call survives.
    h.advance(30_000);
    h.deliver_confpart(1000, 2, false, vec![h.self_part(1), h.member_part("alice", "a1", 10)]);
    h.events();
    h.advance(40_000);
    assert_eq!(h.call.state(), CallState::Active);

    // Everyone leaves: sixty lonely seconds end the call, and the media
    // session confirms the teardown.
    h.deliver_confpart(1000, 3, false, vec![h.self_part(1)]);
    h.events();
    h.advance(60_000);
    h.call.media_event(
        MediaEvent::Closed {
            error: MediaClose::Normal,
            msg_time: 0,
            metrics: None,
        },
        h.now,
    );
    let events = h.events();
    assert!(
        events.iter().any(|e| matches!(
            e,
            CallEvent::Closed { reason: CallReason::EveryoneLeft, .. }
        )),
        "expected EVERYONE_LEFT close, got {events:?}"
    );
}

#[test]
fn sft_network_error_ends_the_call() {
    let mut h = Harness::new(false);
    h.go_active();
    h.call
        .sft_msg_recv(SFT_STATUS_NETWORK_ERROR, None, h.now)
        .expect("sft error");
    h.call.media_event(
        MediaEvent::Closed {
            error: MediaClose::Normal,
            msg_time: 0,
            metrics: None,
        },
        h.now,
    );
    let events = h.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, CallEvent::Closed { reason: CallReason::Error, .. })));
}

#[test]
fn sft_auth_reject_maps_reason_without_retry() {
    let mut h = Harness::new(false);
    h.call.start(CallType::Normal, true, h.now).expect("start");
    h.events();
    h.call.set_config(Harness::config(), h.now);
    h.events();
    assert_eq!(h.call.state(), CallState::ConnSent);

    let mut reject = SignalMessage::response(Payload::ConfConn(huddle_signal::ConfConn {
        status: huddle_signal::ConfConnStatus::RejectedAuthExpired,
        ..Default::default()
    }));
    reject.sessid_sender = h.call.conv_hash().clone();
    reject.src_userid = "SFT".into();
    reject.src_clientid = "SFT".into();

    h.call.sft_msg_recv(0, Some(&reject), h.now).expect("reject");
    assert_eq!(h.call.state(), CallState::Idle);
    let events = h.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, CallEvent::Leave { reason: CallReason::AuthFailed, .. })));
}

#[test]
fn members_are_visible_after_confpart() {
    let mut h = Harness::new(false);
    h.go_active();
    h.approve_clients(&[("alice", "a1")]);
    h.deliver_confpart(1000, 1, true, vec![h.self_part(1), h.member_part("alice", "a1", 10)]);
    h.events();

    let members = h.call.get_members();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].userid, "self".into());
    assert_eq!(members[1].userid, "alice".into());

    // The confpart response toward the SFT carries alice's hash.
    let log = h.media_log.lock().unwrap().clone();
    let alice_hash = h
        .call
        .member_wire_hash(&"alice".into(), &"a1".into())
        .unwrap();
    assert!(log
        .iter()
        .any(|l| l.starts_with("data:") && l.contains(alice_hash.as_str())));
}
