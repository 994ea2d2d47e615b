use super::*;

#[test]
fn encodes_send_frame_with_content_length() {
    let frame = Frame::new(Command::Send)
        .header("destination", "/app/chat/match/4")
        .body(r#"{"content":"hi"}"#);
    assert_eq!(
        frame.encode(),
        "SEND\ndestination:/app/chat/match/4\ncontent-length:16\n\n{\"content\":\"hi\"}\0"
    );
}

#[test]
fn decodes_message_frame() {
    let raw = "MESSAGE\nsubscription:sub-0\nmessage-id:7\ndestination:/topic/match/4\n\n{\"id\":1}\0";
    let frame = Frame::decode(raw).expect("decode").expect("frame");
    assert_eq!(frame.command, Command::Message);
    assert_eq!(frame.get("subscription"), Some("sub-0"));
    assert_eq!(frame.body, "{\"id\":1}");
}

#[test]
fn heartbeat_decodes_to_none() {
    assert_eq!(Frame::decode("\n").expect("heartbeat"), None);
    assert_eq!(Frame::decode("\r\n\r\n").expect("heartbeat"), None);
}

#[test]
fn escapes_and_unescapes_header_values() {
    let frame = Frame::new(Command::Message)
        .header("note", "a:b\nc\\d")
        .body("x");
    let encoded = frame.encode();
    assert!(encoded.contains("note:a\\cb\\nc\\\\d\n"));
    let decoded = Frame::decode(&encoded).expect("decode").expect("frame");
    assert_eq!(decoded.get("note"), Some("a:b\nc\\d"));
}

#[test]
fn connect_headers_are_not_escaped() {
    let frame = Frame::new(Command::Connect).header("Authorization", "Bearer a:b");
    assert!(frame.encode().contains("Authorization:Bearer a:b\n"));
}

#[test]
fn content_length_allows_nul_in_body() {
    let raw = "MESSAGE\ncontent-length:3\n\na\0b\0";
    let frame = Frame::decode(raw).expect("decode").expect("frame");
    assert_eq!(frame.body, "a\0b");
}

#[test]
fn first_repeated_header_wins() {
    let raw = "MESSAGE\nsubscription:sub-1\nsubscription:sub-2\n\n\0";
    let frame = Frame::decode(raw).expect("decode").expect("frame");
    assert_eq!(frame.get("subscription"), Some("sub-1"));
}

#[test]
fn rejects_malformed_frames() {
    assert_eq!(
        Frame::decode("BOGUS\n\n\0"),
        Err(FrameError::UnknownCommand("BOGUS".into()))
    );
    assert_eq!(
        Frame::decode("MESSAGE\nno-separator\n\n\0"),
        Err(FrameError::MalformedHeader("no-separator".into()))
    );
    assert_eq!(
        Frame::decode("MESSAGE\n\nbody"),
        Err(FrameError::MissingTerminator)
    );
    assert_eq!(
        Frame::decode("MESSAGE\nx:\\q\n\n\0"),
        Err(FrameError::InvalidEscape("\\q".into()))
    );
}
