//! FIX wire framing.
//!
//! The framer does not decode message bodies; it extracts complete frames
//! from a byte stream (length prefix in tag 9, fixed-size checksum trailer)
//! and reads just enough of the admin headers to authenticate logons and
//! keep heartbeat schedules. Admin messages the engine originates are built
//! here too.

use bytes::{Buf, Bytes, BytesMut};

pub const SOH: u8 = 0x01; // ASCII control-A

const BEGIN_STRING: &str = "FIX.4.4";

/// Extract one complete FIX message from the front of `buffer`, if present.
///
/// A frame is located by its `8=` begin-string and sized from the tag-9
/// body length; it is only taken once the trailing checksum field has
/// fully arrived. Consuming a frame also drops any garbage bytes that
/// preceded it.
pub fn try_extract_one(buffer: &mut BytesMut) -> Option<Bytes> {
    let data: &[u8] = buffer.as_ref();
    let frame_start = memchr::memmem::find(data, b"8=")?;
    let frame_len = frame_length(&data[frame_start..])?;
    if frame_start + frame_len > data.len() {
        return None;
    }
    let frame = Bytes::copy_from_slice(&data[frame_start..frame_start + frame_len]);
    buffer.advance(frame_start + frame_len);
    Some(frame)
}

/// Total frame length implied by the tag-9 body length, once enough of the
/// header has arrived to read it. `data` starts at the begin-string.
fn frame_length(data: &[u8]) -> Option<usize> {
    // "10=" + three digits + SOH
    const TRAILER_LEN: usize = 7;
    // Reject absurd body lengths before folding the digits.
    const MAX_LENGTH_DIGITS: usize = 8;

    let length_field = memchr::memmem::find(data, b"9=")?;
    let length_soh = length_field + memchr::memchr(SOH, &data[length_field..])?;
    let digits = &data[length_field + 2..length_soh];
    if digits.is_empty() || digits.len() > MAX_LENGTH_DIGITS {
        return None;
    }
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let body_len = digits
        .iter()
        .fold(0usize, |n, digit| n * 10 + usize::from(digit - b'0'));
    Some(length_soh + 1 + body_len + TRAILER_LEN)
}

/// Value of tag 35 in a complete frame.
pub fn msg_type(frame: &[u8]) -> Option<&str> {
    find_field(frame, 35)
}

pub fn is_logon(frame: &[u8]) -> bool {
    msg_type(frame) == Some("A")
}

/// Admin header fields of a Logon, as far as the engine cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogonFields {
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub sender_sub_id: Option<String>,
    pub heartbeat_interval_s: u32,
    pub msg_seq_num: i32,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Read the logon header out of a complete frame. `None` when the frame is
/// not a Logon or the mandatory comp ids are absent.
pub fn parse_logon(frame: &[u8]) -> Option<LogonFields> {
    if !is_logon(frame) {
        return None;
    }
    Some(LogonFields {
        sender_comp_id: find_field(frame, 49)?.to_string(),
        target_comp_id: find_field(frame, 56)?.to_string(),
        sender_sub_id: find_field(frame, 50).map(str::to_string),
        heartbeat_interval_s: find_field(frame, 108)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        msg_seq_num: find_field(frame, 34).and_then(|v| v.parse().ok()).unwrap_or(0),
        username: find_field(frame, 553).map(str::to_string),
        password: find_field(frame, 554).map(str::to_string),
    })
}

/// TestReqID (tag 112) of a Heartbeat or TestRequest frame.
pub fn test_request_id(frame: &[u8]) -> Option<&str> {
    find_field(frame, 112)
}

/// MsgSeqNum (tag 34) of a complete frame.
pub fn msg_seq_num(frame: &[u8]) -> Option<i32> {
    find_field(frame, 34).and_then(|v| v.parse().ok())
}

/// Linear scan for `<SOH>tag=`; also matches a leading `tag=`.
fn find_field(frame: &[u8], tag: u32) -> Option<&str> {
    let mut pos = 0;
    while pos < frame.len() {
        let end = memchr::memchr(SOH, &frame[pos..]).map_or(frame.len(), |i| i + pos);
        let field = &frame[pos..end];
        if let Some(eq) = memchr::memchr(b'=', field) {
            if let Ok(t) = std::str::from_utf8(&field[..eq]) {
                if t.parse::<u32>() == Ok(tag) {
                    return std::str::from_utf8(&field[eq + 1..]).ok();
                }
            }
        }
        pos = end + 1;
    }
    None
}

fn compute_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Encode an admin message with the standard header and trailer. Fields are
/// written in the order given, after 35/49/56/34.
fn encode_admin(
    msg_type: &str,
    sender_comp_id: &str,
    target_comp_id: &str,
    msg_seq_num: u32,
    fields: &[(u32, &str)],
) -> Bytes {
    let mut body = Vec::with_capacity(64);
    push_field(&mut body, 35, msg_type);
    push_field(&mut body, 49, sender_comp_id);
    push_field(&mut body, 56, target_comp_id);
    push_field(&mut body, 34, &msg_seq_num.to_string());
    for (tag, value) in fields {
        push_field(&mut body, *tag, value);
    }

    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(b"8=");
    out.extend_from_slice(BEGIN_STRING.as_bytes());
    out.push(SOH);
    out.extend_from_slice(b"9=");
    out.extend_from_slice(body.len().to_string().as_bytes());
    out.push(SOH);
    out.extend_from_slice(&body);
    let checksum = compute_checksum(&out);
    out.extend_from_slice(format!("10={:03}", checksum).as_bytes());
    out.push(SOH);
    Bytes::from(out)
}

fn push_field(buf: &mut Vec<u8>, tag: u32, value: &str) {
    buf.extend_from_slice(tag.to_string().as_bytes());
    buf.push(b'=');
    buf.extend_from_slice(value.as_bytes());
    buf.push(SOH);
}

pub fn build_heartbeat(
    test_req_id: Option<&str>,
    sender_comp_id: &str,
    target_comp_id: &str,
    msg_seq_num: u32,
) -> Bytes {
    match test_req_id {
        Some(id) => encode_admin("0", sender_comp_id, target_comp_id, msg_seq_num, &[(112, id)]),
        None => encode_admin("0", sender_comp_id, target_comp_id, msg_seq_num, &[]),
    }
}

pub fn build_test_request(
    id: &str,
    sender_comp_id: &str,
    target_comp_id: &str,
    msg_seq_num: u32,
) -> Bytes {
    encode_admin("1", sender_comp_id, target_comp_id, msg_seq_num, &[(112, id)])
}

pub fn build_logout(
    text: Option<&str>,
    sender_comp_id: &str,
    target_comp_id: &str,
    msg_seq_num: u32,
) -> Bytes {
    match text {
        Some(t) => encode_admin("5", sender_comp_id, target_comp_id, msg_seq_num, &[(58, t)]),
        None => encode_admin("5", sender_comp_id, target_comp_id, msg_seq_num, &[]),
    }
}

pub fn build_logon(
    heartbeat_interval_s: u32,
    sender_comp_id: &str,
    target_comp_id: &str,
    msg_seq_num: u32,
) -> Bytes {
    let interval = heartbeat_interval_s.to_string();
    encode_admin(
        "A",
        sender_comp_id,
        target_comp_id,
        msg_seq_num,
        &[(98, "0"), (108, &interval)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_a_complete_frame() {
        let frame = build_heartbeat(None, "ENG", "CLIENT", 2);
        let mut buf = BytesMut::from(&frame[..]);
        let extracted = try_extract_one(&mut buf).expect("complete frame");
        assert_eq!(extracted, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn holds_back_a_partial_frame() {
        let frame = build_heartbeat(None, "ENG", "CLIENT", 2);
        let mut buf = BytesMut::from(&frame[..frame.len() - 3]);
        assert!(try_extract_one(&mut buf).is_none());
        buf.extend_from_slice(&frame[frame.len() - 3..]);
        assert_eq!(try_extract_one(&mut buf), Some(frame));
    }

    #[test]
    fn extracts_two_frames_and_skips_leading_garbage() {
        let a = build_test_request("TR-1", "A", "B", 5);
        let b = build_logout(Some("bye"), "A", "B", 6);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\x00\x00junk");
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);
        assert_eq!(try_extract_one(&mut buf), Some(a));
        assert_eq!(try_extract_one(&mut buf), Some(b));
        assert!(try_extract_one(&mut buf).is_none());
    }

    #[test]
    fn parses_logon_header() {
        let frame = build_logon(30, "INITIATOR", "ACCEPTOR", 1);
        let logon = parse_logon(&frame).expect("logon fields");
        assert_eq!(logon.sender_comp_id, "INITIATOR");
        assert_eq!(logon.target_comp_id, "ACCEPTOR");
        assert_eq!(logon.heartbeat_interval_s, 30);
        assert_eq!(logon.msg_seq_num, 1);
        assert_eq!(logon.username, None);
    }

    #[test]
    fn logon_carries_the_sub_id_when_present() {
        let frame = encode_admin("A", "SENDER", "TARGET", 1, &[(50, "DESK-A"), (108, "30")]);
        let logon = parse_logon(&frame).expect("logon fields");
        assert_eq!(logon.sender_sub_id.as_deref(), Some("DESK-A"));
        assert_eq!(logon.heartbeat_interval_s, 30);
    }

    #[test]
    fn malformed_body_length_is_not_a_frame() {
        let mut buf = BytesMut::from(&b"8=FIX.4.4\x019=1x\x0135=0\x0110=000\x01"[..]);
        assert!(try_extract_one(&mut buf).is_none());
        let mut oversized = BytesMut::from(&b"8=FIX.4.4\x019=999999999\x0135=0\x01"[..]);
        assert!(try_extract_one(&mut oversized).is_none());
    }

    #[test]
    fn rejects_non_logon_frames() {
        let frame = build_heartbeat(None, "A", "B", 9);
        assert!(parse_logon(&frame).is_none());
        assert_eq!(msg_type(&frame), Some("0"));
    }

    #[test]
    fn field_scan_does_not_match_tag_suffixes() {
        // 112 must not be found inside 12=... or 512=...
        let frame = build_test_request("X", "A", "B", 1);
        assert_eq!(test_request_id(&frame), Some("X"));
        let hb = build_heartbeat(None, "A", "B", 1);
        assert_eq!(test_request_id(&hb), None);
    }

    #[test]
    fn checksum_is_mod_256_of_preceding_bytes() {
        let frame = build_heartbeat(Some("TR-9"), "S", "T", 3);
        let trailer_start = frame.len() - 7;
        let expected = compute_checksum(&frame[..trailer_start]);
        let digits = std::str::from_utf8(&frame[trailer_start + 3..frame.len() - 1]).unwrap();
        assert_eq!(digits.parse::<u8>().unwrap(), expected);
    }
}
