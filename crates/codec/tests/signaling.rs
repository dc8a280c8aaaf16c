use anyhow::Result;
use rtc_link_codec::{
    Credentials, Error, IceCandidate, MessageType, OverlayFrame, Rejection, Route, SdpType,
    SessionDescription, SignalMessage,
    handshake::{DEFAULT_PROTOCOL_TAG, IDENTITY_HEADER, PROTOCOL_HEADER},
};

#[test]
fn test_signal_message_wire_shape() -> Result<()> {
    let description = SessionDescription::offer("v=0\r\n");
    let message = SignalMessage::new(MessageType::Offer, "client", "host", description.to_json()?);

    let raw = message.encode()?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    assert_eq!(value["type"], 0);
    assert_eq!(value["from"], "client");
    assert_eq!(value["to"], "host");

    let decoded = SignalMessage::decode(&raw)?;
    assert_eq!(decoded, message);

    let payload = SessionDescription::from_json(&decoded.data)?;
    assert_eq!(payload.kind, SdpType::Offer);
    assert_eq!(payload.sdp, "v=0\r\n");

    Ok(())
}

#[test]
fn test_signal_message_rejects_malformed() {
    assert!(matches!(
        SignalMessage::decode("not json"),
        Err(Error::InvalidJson(_))
    ));

    assert!(matches!(
        SignalMessage::decode(r#"{"type":1,"from":"a","data":""}"#),
        Err(Error::InvalidJson(_))
    ));

    assert!(matches!(
        SignalMessage::decode(r#"{"type":7,"from":"a","to":"b","data":""}"#),
        Err(Error::UnknownType(7))
    ));
}

#[test]
fn test_route_header() -> Result<()> {
    let route = Route::parse(r#"{"type":3,"from":"host","to":"client","data":"{}","extra":true}"#)?;
    assert_eq!(route.from, "host");
    assert_eq!(route.to, "client");
    assert!(!route.is_self_addressed());

    // the relay does not care about the message type value.
    let route = Route::parse(r#"{"type":42,"from":"host","to":"host","data":""}"#)?;
    assert!(route.is_self_addressed());

    for (raw, field) in [
        (r#"{"from":"a","to":"b","data":""}"#, "type"),
        (r#"{"type":0,"to":"b","data":""}"#, "from"),
        (r#"{"type":0,"from":"a","data":""}"#, "to"),
        (r#"{"type":0,"from":"a","to":"b"}"#, "data"),
    ] {
        match Route::parse(raw) {
            Err(Error::MissingField(name)) => assert_eq!(name, field),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    assert!(matches!(
        Route::parse(r#"{"type":0,"from":"a","to":5,"data":""}"#),
        Err(Error::InvalidField("to"))
    ));

    assert!(matches!(Route::parse("[1,2,3]"), Err(Error::InvalidJson(_))));
    Ok(())
}

#[test]
fn test_handshake_rejections() {
    assert_eq!(PROTOCOL_HEADER, "user-agent");
    assert_eq!(IDENTITY_HEADER, "login-id");

    for rejection in [
        Rejection::InvalidProtocolTag,
        Rejection::InvalidIdentity,
        Rejection::IdentityOccupied,
    ] {
        assert_eq!(Rejection::from_code(rejection.code()), Some(rejection));
    }

    assert_eq!(Rejection::IdentityOccupied.reason(), "Occupied 'login-id'");

    let missing = Credentials {
        protocol_tag: Some(DEFAULT_PROTOCOL_TAG.to_string()),
        identity: None,
    };

    assert_eq!(
        missing.validate(DEFAULT_PROTOCOL_TAG),
        Err(Rejection::InvalidIdentity)
    );

    // a bad tag wins over a bad identity.
    assert_eq!(
        Credentials::default().validate(DEFAULT_PROTOCOL_TAG),
        Err(Rejection::InvalidProtocolTag)
    );
}

#[test]
fn test_ice_candidate_optional_fields() -> Result<()> {
    let candidate = IceCandidate::from_json(r#"{"candidate":"candidate:0 1 udp 1 127.0.0.1 9 typ host"}"#)?;
    assert_eq!(candidate.sdp_mid, None);
    assert_eq!(candidate.sdp_mline_index, None);

    let raw = IceCandidate::new("candidate:1").to_json()?;
    assert_eq!(raw, r#"{"candidate":"candidate:1","sdpMid":null,"sdpMLineIndex":null}"#);
    Ok(())
}

#[test]
fn test_overlay_frame() -> Result<()> {
    let frame = OverlayFrame::decode(br#"{"type":2,"data":"Server not active"}"#)?;
    assert_eq!(frame.kind, MessageType::Decline);
    assert_eq!(frame.data, "Server not active");

    assert!(matches!(
        OverlayFrame::decode(br#"{"type":4,"data":""}"#),
        Err(Error::UnknownType(4))
    ));

    Ok(())
}
