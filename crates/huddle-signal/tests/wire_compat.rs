// Verify the JSON wire format stays compatible with deployed clients and
// SFTs. These tests pin exact field names and round-trip behaviour.

use huddle_signal::{
    decode, encode, ConfConnStatus, ConfKey, ConfStart, KeyEntry, Payload, SignalMessage,
    StreamInfo,
};

fn roundtrip(msg: &SignalMessage) -> SignalMessage {
    decode(&encode(msg).unwrap()).unwrap()
}

#[test]
fn confstart_round_trip() {
    let mut msg = SignalMessage::new(Payload::ConfStart(ConfStart {
        timestamp: 1000,
        seqno: 1,
        secret: vec![0xab; 16],
        sft_url: "https://sft1.example.com/".into(),
        sft_tuple: Some("tuple-1".into()),
        sftl: vec!["https://sft1.example.com/".into()],
        props: [("videosend".to_string(), "true".to_string())].into(),
    }));
    msg.sessid_sender = "deadbeef".into();
    msg.src_userid = "alice".into();
    msg.src_clientid = "dev1".into();

    assert_eq!(roundtrip(&msg), msg);

    let json = encode(&msg).unwrap();
    assert!(json.contains(r#""type":"CONFSTART""#));
    assert!(json.contains(r#""sessid":"deadbeef""#));
    assert!(json.contains(r#""secret":"abababababababababababababababab""#));
}

#[test]
fn confpart_member_fields() {
    let json = r#"{
        "version": "3.0",
        "type": "CONFPART",
        "sessid": "s1",
        "src_userid": "SFT",
        "src_clientid": "SFT",
        "resp": true,
        "timestamp": 12345,
        "seqno": 7,
        "entropy": "0102",
        "should_start": false,
        "partl": [
            {"userid": "ha", "clientid": "_", "ssrca": 10, "ssrcv": 0, "muted": true},
            {"userid": "hb", "clientid": "_", "ssrca": 20, "ssrcv": 21}
        ]
    }"#;

    let msg = decode(json).unwrap();
    let Payload::ConfPart(part) = &msg.payload else {
        panic!("expected CONFPART");
    };
    assert_eq!(part.timestamp, 12345);
    assert_eq!(part.entropy, vec![1, 2]);
    assert_eq!(part.partl.len(), 2);
    assert_eq!(part.partl[0].muted, Some(true));
    // absent muted means unknown
    assert_eq!(part.partl[1].muted, None);
    assert_eq!(
        part.partl[1].muted_state(),
        huddle_core::MutedState::Unknown
    );
}

#[test]
fn confkey_response_carries_indexed_keys() {
    let msg = SignalMessage::response(Payload::ConfKey(ConfKey {
        keyl: vec![
            KeyEntry {
                idx: 0x10000,
                data: vec![1u8; 32],
            },
            KeyEntry {
                idx: 0x10001,
                data: vec![2u8; 32],
            },
        ],
    }));

    let back = roundtrip(&msg);
    assert!(back.resp);
    let Payload::ConfKey(keys) = back.payload else {
        panic!("expected CONFKEY");
    };
    assert_eq!(keys.keyl.len(), 2);
    assert_eq!(keys.keyl[0].idx, 0x10000);
    assert_eq!(keys.keyl[1].data, vec![2u8; 32]);
}

#[test]
fn confkey_request_has_empty_list() {
    let msg = SignalMessage::new(Payload::ConfKey(ConfKey::default()));
    let json = encode(&msg).unwrap();
    assert!(json.contains(r#""keyl":[]"#));
    assert!(decode(&json).unwrap().is_request());
}

#[test]
fn confconn_reject_status() {
    let json = r#"{
        "version": "3.0",
        "type": "CONFCONN",
        "sessid": "s1",
        "src_userid": "SFT",
        "src_clientid": "SFT",
        "resp": true,
        "status": 1
    }"#;
    let msg = decode(json).unwrap();
    let Payload::ConfConn(conn) = &msg.payload else {
        panic!("expected CONFCONN");
    };
    assert_eq!(conn.status, ConfConnStatus::RejectedBlacklist);
}

#[test]
fn confconn_unknown_status_is_rejected() {
    let json = r#"{
        "version": "3.0",
        "type": "CONFCONN",
        "sessid": "s1",
        "src_userid": "SFT",
        "src_clientid": "SFT",
        "status": 99
    }"#;
    assert!(decode(json).is_err());
}

#[test]
fn confstreams_helper_uses_list_mode() {
    let msg = SignalMessage::conf_streams(vec![StreamInfo {
        userid: "h1".into(),
        quality: 2,
    }]);
    let json = encode(&msg).unwrap();
    assert!(json.contains(r#""type":"CONFSTREAMS""#));
    assert!(json.contains(r#""mode":"list""#));
    assert!(json.contains(r#""quality":2"#));
}

#[test]
fn unit_payloads_round_trip() {
    for payload in [Payload::ConfEnd, Payload::Reject] {
        let name = payload.type_name();
        let msg = SignalMessage::new(payload);
        let json = encode(&msg).unwrap();
        assert!(json.contains(&format!(r#""type":"{name}""#)));
        assert_eq!(roundtrip(&msg), msg);
    }
}

#[test]
fn propsync_props_survive_round_trip() {
    let json = r#"{
        "version": "3.0",
        "type": "PROPSYNC",
        "sessid": "s1",
        "src_userid": "ha",
        "src_clientid": "_",
        "props": {"videosend": "true", "muted": "false", "keysync": "7"}
    }"#;
    let msg = decode(json).unwrap();
    let Payload::Propsync(sync) = &msg.payload else {
        panic!("expected PROPSYNC");
    };
    assert_eq!(sync.get("videosend"), Some("true"));
    assert_eq!(sync.get("keysync"), Some("7"));
    assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
}

#[test]
fn setup_and_update_share_shape() {
    let json = r#"{
        "version": "3.0",
        "type": "UPDATE",
        "sessid": "s1",
        "src_userid": "SFT",
        "src_clientid": "SFT",
        "sdp": "v=0",
        "url": "https://sft2.example.com/"
    }"#;
    let msg = decode(json).unwrap();
    let Payload::Update(setup) = &msg.payload else {
        panic!("expected UPDATE");
    };
    assert_eq!(setup.sdp, "v=0");
    assert_eq!(setup.url.as_deref(), Some("https://sft2.example.com/"));
}
