//! DHCPv6 wire codec.
//!
//! RFC 3315 section 6 - client/server message format:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    msg-type   |               transaction-id                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            options                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Options are a flat TLV sequence (2-byte code, 2-byte length). IA_NA
//! options nest IA Address options which in turn may nest a Status Code.
//! The decoder produces a [`ParsedMessage`] view; malformed TLVs reject
//! the whole message.

use crate::duid::Duid;
use crate::types::*;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv6Addr;

/// Enterprise number carried in the Vendor Class option so servers can
/// classify this client implementation.
pub const VENDOR_ENTERPRISE_NUMBER: u32 = 2342;

/// Decode failure. The dispatcher maps any of these to a silent drop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("message too short")]
    Truncated,

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("malformed option {0}")]
    MalformedOption(u16),
}

/// An address inside an IA_NA, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaAddress {
    pub addr: Ipv6Addr,
    pub preferred: u32,
    pub valid: u32,
    pub status: Option<Status>,
}

/// An Identity Association for Non-temporary Addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ia {
    pub ia_id: u32,
    pub t1: u32,
    pub t2: u32,
    pub addrs: Vec<IaAddress>,
    pub status: Option<Status>,
}

impl Ia {
    pub fn new(ia_id: u32) -> Self {
        Self {
            ia_id,
            t1: 0,
            t2: 0,
            addrs: Vec::new(),
            status: None,
        }
    }

    /// Whether this IA carries at least one address and no failure status.
    pub fn is_usable(&self) -> bool {
        if self.addrs.is_empty() {
            return false;
        }
        if let Some(status) = &self.status {
            if !status.is_success() {
                return false;
            }
        }
        self.addrs.iter().any(|a| match &a.status {
            Some(status) => status.is_success(),
            None => true,
        })
    }
}

/// Parsed view of a DHCPv6 message, as handed to the FSM.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub msg_type: MessageType,
    pub xid: u32,
    pub client_id: Option<Duid>,
    pub server_id: Option<Duid>,
    pub preference: u8,
    pub rapid_commit: bool,
    pub status: Option<Status>,
    pub ia_na: Vec<Ia>,
    pub dns_servers: Vec<Ipv6Addr>,
    pub dns_search: Vec<String>,
    pub sntp_servers: Vec<Ipv6Addr>,
    pub sip_servers: Vec<Ipv6Addr>,
    pub info_refresh: Option<u32>,
    pub sol_max_rt: Option<u32>,
    pub inf_max_rt: Option<u32>,
}

impl ParsedMessage {
    /// Empty message of the given type and transaction id.
    pub fn new(msg_type: MessageType, xid: u32) -> Self {
        Self {
            msg_type,
            xid,
            client_id: None,
            server_id: None,
            preference: 0,
            rapid_commit: false,
            status: None,
            ia_na: Vec::new(),
            dns_servers: Vec::new(),
            dns_search: Vec::new(),
            sntp_servers: Vec::new(),
            sip_servers: Vec::new(),
            info_refresh: None,
            sol_max_rt: None,
            inf_max_rt: None,
        }
    }

    /// The status governing this message: the top-level Status Code option
    /// when present, otherwise the status of the first IA_NA.
    pub fn effective_status(&self) -> StatusCode {
        if let Some(status) = &self.status {
            return status.code;
        }
        for ia in &self.ia_na {
            if let Some(status) = &ia.status {
                return status.code;
            }
        }
        StatusCode::Success
    }

    /// Find the IA_NA matching the device's IA identifier.
    pub fn find_ia(&self, ia_id: u32) -> Option<&Ia> {
        self.ia_na.iter().find(|ia| ia.ia_id == ia_id)
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_be_bytes([s[0], s[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    fn ipv6(&mut self) -> Option<Ipv6Addr> {
        self.take(16).map(|s| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(s);
            Ipv6Addr::from(octets)
        })
    }
}

/// Decode a DHCPv6 message.
pub fn decode(data: &[u8]) -> Result<ParsedMessage, DecodeError> {
    let mut r = Reader::new(data);

    let type_byte = r.u8().ok_or(DecodeError::Truncated)?;
    let msg_type = MessageType::from_u8(type_byte).ok_or(DecodeError::UnknownType(type_byte))?;
    let xid_bytes = r.take(3).ok_or(DecodeError::Truncated)?;
    let xid = u32::from_be_bytes([0, xid_bytes[0], xid_bytes[1], xid_bytes[2]]) & XID_MASK;

    let mut msg = ParsedMessage::new(msg_type, xid);

    while r.remaining() > 0 {
        let code = r.u16().ok_or(DecodeError::Truncated)?;
        let len = r.u16().ok_or(DecodeError::Truncated)? as usize;
        let body = r.take(len).ok_or(DecodeError::MalformedOption(code))?;

        match code {
            OPT_CLIENT_ID => {
                msg.client_id =
                    Some(Duid::from_bytes(body).map_err(|_| DecodeError::MalformedOption(code))?);
            }
            OPT_SERVER_ID => {
                msg.server_id =
                    Some(Duid::from_bytes(body).map_err(|_| DecodeError::MalformedOption(code))?);
            }
            OPT_PREFERENCE => {
                if body.len() != 1 {
                    return Err(DecodeError::MalformedOption(code));
                }
                msg.preference = body[0];
            }
            OPT_RAPID_COMMIT => {
                if !body.is_empty() {
                    return Err(DecodeError::MalformedOption(code));
                }
                msg.rapid_commit = true;
            }
            OPT_STATUS_CODE => {
                msg.status = Some(decode_status(body).ok_or(DecodeError::MalformedOption(code))?);
            }
            OPT_IA_NA => {
                msg.ia_na
                    .push(decode_ia_na(body).ok_or(DecodeError::MalformedOption(code))?);
            }
            OPT_DNS_SERVERS => {
                msg.dns_servers =
                    decode_addr_list(body).ok_or(DecodeError::MalformedOption(code))?;
            }
            OPT_DOMAIN_LIST => {
                msg.dns_search =
                    decode_domain_list(body).ok_or(DecodeError::MalformedOption(code))?;
            }
            OPT_SNTP_SERVERS => {
                msg.sntp_servers =
                    decode_addr_list(body).ok_or(DecodeError::MalformedOption(code))?;
            }
            OPT_SIP_SERVER_ADDR => {
                msg.sip_servers =
                    decode_addr_list(body).ok_or(DecodeError::MalformedOption(code))?;
            }
            OPT_INFO_REFRESH_TIME => {
                msg.info_refresh =
                    Some(decode_u32(body).ok_or(DecodeError::MalformedOption(code))?);
            }
            OPT_SOL_MAX_RT => {
                msg.sol_max_rt = Some(decode_u32(body).ok_or(DecodeError::MalformedOption(code))?);
            }
            OPT_INF_MAX_RT => {
                msg.inf_max_rt = Some(decode_u32(body).ok_or(DecodeError::MalformedOption(code))?);
            }
            // Unknown or unrequested options are skipped, not rejected.
            _ => {}
        }
    }

    Ok(msg)
}

fn decode_u32(body: &[u8]) -> Option<u32> {
    if body.len() != 4 {
        return None;
    }
    Some(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
}

fn decode_status(body: &[u8]) -> Option<Status> {
    if body.len() < 2 {
        return None;
    }
    let code = StatusCode::from_u16(u16::from_be_bytes([body[0], body[1]]));
    let message = String::from_utf8_lossy(&body[2..]).into_owned();
    Some(Status::new(code, message))
}

fn decode_addr_list(body: &[u8]) -> Option<Vec<Ipv6Addr>> {
    if body.len() % 16 != 0 {
        return None;
    }
    let mut addrs = Vec::with_capacity(body.len() / 16);
    for chunk in body.chunks(16) {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(chunk);
        addrs.push(Ipv6Addr::from(octets));
    }
    Some(addrs)
}

/// Decode a domain search list: a sequence of uncompressed DNS names.
fn decode_domain_list(body: &[u8]) -> Option<Vec<String>> {
    let mut names = Vec::new();
    let mut r = Reader::new(body);

    while r.remaining() > 0 {
        let mut labels: Vec<String> = Vec::new();
        loop {
            let len = r.u8()? as usize;
            if len == 0 {
                break;
            }
            // Compression pointers are not allowed in this option.
            if len > 63 {
                return None;
            }
            let label = r.take(len)?;
            if !label
                .iter()
                .all(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_')
            {
                return None;
            }
            labels.push(String::from_utf8_lossy(label).into_owned());
        }
        if labels.is_empty() {
            return None;
        }
        names.push(labels.join("."));
    }

    Some(names)
}

fn decode_ia_na(body: &[u8]) -> Option<Ia> {
    let mut r = Reader::new(body);
    let mut ia = Ia::new(r.u32()?);
    ia.t1 = r.u32()?;
    ia.t2 = r.u32()?;

    while r.remaining() > 0 {
        let code = r.u16()?;
        let len = r.u16()? as usize;
        let sub = r.take(len)?;
        match code {
            OPT_IA_ADDRESS => ia.addrs.push(decode_ia_address(sub)?),
            OPT_STATUS_CODE => ia.status = Some(decode_status(sub)?),
            _ => {}
        }
    }

    Some(ia)
}

fn decode_ia_address(body: &[u8]) -> Option<IaAddress> {
    let mut r = Reader::new(body);
    let addr = r.ipv6()?;
    let preferred = r.u32()?;
    let valid = r.u32()?;
    let mut status = None;

    while r.remaining() > 0 {
        let code = r.u16()?;
        let len = r.u16()? as usize;
        let sub = r.take(len)?;
        if code == OPT_STATUS_CODE {
            status = Some(decode_status(sub)?);
        }
    }

    // An address with valid < preferred is nonsense the FSM must never see.
    if valid < preferred {
        return None;
    }

    Some(IaAddress {
        addr,
        preferred,
        valid,
        status,
    })
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Everything the codec needs to build an outbound client message.
///
/// The FSM fills this in; which fields are actually emitted depends on the
/// message kind (a Solicit never carries a Server Identifier, an
/// Information-Request never carries an IA_NA).
pub struct ClientMessage<'a> {
    pub kind: MessageType,
    pub xid: u32,
    /// Elapsed Time option value, hundredths of a second, already clamped.
    pub elapsed: u16,
    pub client_id: &'a Duid,
    pub server_id: Option<&'a Duid>,
    pub ia: Option<Ia>,
    pub oro: &'a [u16],
    pub rapid_commit: bool,
    pub user_class: &'a [String],
    pub vendor_class: &'a [String],
    pub fqdn: Option<&'a str>,
}

/// Encode an outbound client message to wire bytes.
pub fn encode(msg: &ClientMessage<'_>) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);

    buf.put_u8(msg.kind as u8);
    let xid = msg.xid & XID_MASK;
    buf.put_u8((xid >> 16) as u8);
    buf.put_u8((xid >> 8) as u8);
    buf.put_u8(xid as u8);

    put_option(&mut buf, OPT_ELAPSED_TIME, |b| b.put_u16(msg.elapsed));
    put_option(&mut buf, OPT_CLIENT_ID, |b| {
        b.put_slice(msg.client_id.as_bytes())
    });

    let server_id_allowed = matches!(
        msg.kind,
        MessageType::Request | MessageType::Renew | MessageType::Release | MessageType::Decline
    );
    if server_id_allowed {
        if let Some(server_id) = msg.server_id {
            put_option(&mut buf, OPT_SERVER_ID, |b| b.put_slice(server_id.as_bytes()));
        }
    }

    if msg.rapid_commit && msg.kind == MessageType::Solicit {
        put_option(&mut buf, OPT_RAPID_COMMIT, |_| {});
    }

    if msg.kind != MessageType::InformationRequest {
        if let Some(ia) = &msg.ia {
            put_ia_na(&mut buf, ia);
        }
    }

    if !msg.oro.is_empty() {
        put_option(&mut buf, OPT_ORO, |b| {
            for code in msg.oro {
                b.put_u16(*code);
            }
        });
    }

    for class in msg.user_class {
        if class.is_empty() {
            continue;
        }
        put_option(&mut buf, OPT_USER_CLASS, |b| {
            b.put_u16(class.len() as u16);
            b.put_slice(class.as_bytes());
        });
    }

    if !msg.vendor_class.is_empty() {
        put_option(&mut buf, OPT_VENDOR_CLASS, |b| {
            b.put_u32(VENDOR_ENTERPRISE_NUMBER);
            for class in msg.vendor_class {
                b.put_u16(class.len() as u16);
                b.put_slice(class.as_bytes());
            }
        });
    }

    if let Some(hostname) = msg.fqdn {
        if !hostname.is_empty() {
            put_option(&mut buf, OPT_FQDN, |b| {
                // S bit set: ask the server to perform the AAAA update.
                b.put_u8(0x01);
                put_domain_name(b, hostname);
            });
        }
    }

    buf.freeze()
}

fn put_option(buf: &mut BytesMut, code: u16, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u16(code);
    let len_pos = buf.len();
    buf.put_u16(0);
    let start = buf.len();
    body(buf);
    let len = (buf.len() - start) as u16;
    buf[len_pos..len_pos + 2].copy_from_slice(&len.to_be_bytes());
}

fn put_ia_na(buf: &mut BytesMut, ia: &Ia) {
    put_option(buf, OPT_IA_NA, |b| {
        b.put_u32(ia.ia_id);
        b.put_u32(ia.t1);
        b.put_u32(ia.t2);
        for addr in &ia.addrs {
            b.put_u16(OPT_IA_ADDRESS);
            b.put_u16(24);
            b.put_slice(&addr.addr.octets());
            b.put_u32(addr.preferred);
            b.put_u32(addr.valid);
        }
    });
}

/// Encode a hostname in DNS wire format. A name without dots is emitted as
/// a partial name (no terminating root label) per RFC 4704 section 4.2.
fn put_domain_name(buf: &mut BytesMut, name: &str) {
    let fully_qualified = name.contains('.');
    for label in name.trim_end_matches('.').split('.') {
        let label = &label.as_bytes()[..label.len().min(63)];
        if label.is_empty() {
            continue;
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label);
    }
    if fully_qualified {
        buf.put_u8(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_duid(tail: u8) -> Duid {
        Duid::from_bytes(&[0x00, 0x03, 0x00, 0x01, 0xaa, 0xbb, 0xcc, tail]).unwrap()
    }

    fn sample_ia() -> Ia {
        Ia {
            ia_id: 0x0a0b0c0d,
            t1: 1800,
            t2: 2880,
            addrs: vec![IaAddress {
                addr: "2001:db8::1".parse().unwrap(),
                preferred: 3600,
                valid: 7200,
                status: None,
            }],
            status: None,
        }
    }

    #[test]
    fn test_solicit_round_trip() {
        let client_id = test_duid(1);
        let bytes = encode(&ClientMessage {
            kind: MessageType::Solicit,
            xid: 0x00abcdef,
            elapsed: 0,
            client_id: &client_id,
            server_id: None,
            ia: Some(sample_ia()),
            oro: &[OPT_DNS_SERVERS, OPT_DOMAIN_LIST],
            rapid_commit: true,
            user_class: &[],
            vendor_class: &[],
            fqdn: None,
        });

        let msg = decode(&bytes).unwrap();
        assert_eq!(msg.msg_type, MessageType::Solicit);
        assert_eq!(msg.xid, 0x00abcdef);
        assert_eq!(msg.client_id, Some(client_id));
        assert_eq!(msg.server_id, None);
        assert!(msg.rapid_commit);
        assert_eq!(msg.ia_na.len(), 1);
        assert_eq!(msg.ia_na[0].ia_id, 0x0a0b0c0d);
        assert_eq!(msg.ia_na[0].addrs, sample_ia().addrs);
    }

    #[test]
    fn test_request_carries_server_id() {
        let client_id = test_duid(1);
        let server_id = test_duid(2);
        let bytes = encode(&ClientMessage {
            kind: MessageType::Request,
            xid: 0x123456,
            elapsed: 100,
            client_id: &client_id,
            server_id: Some(&server_id),
            ia: Some(sample_ia()),
            oro: &[],
            rapid_commit: false,
            user_class: &[],
            vendor_class: &[],
            fqdn: None,
        });

        let msg = decode(&bytes).unwrap();
        assert_eq!(msg.msg_type, MessageType::Request);
        assert_eq!(msg.server_id, Some(server_id));
        assert_eq!(msg.client_id, Some(client_id));
    }

    #[test]
    fn test_rebind_never_carries_server_id() {
        let client_id = test_duid(1);
        let server_id = test_duid(2);
        let bytes = encode(&ClientMessage {
            kind: MessageType::Rebind,
            xid: 0x123456,
            elapsed: 0,
            client_id: &client_id,
            server_id: Some(&server_id),
            ia: Some(sample_ia()),
            oro: &[],
            rapid_commit: false,
            user_class: &[],
            vendor_class: &[],
            fqdn: None,
        });

        let msg = decode(&bytes).unwrap();
        assert_eq!(msg.server_id, None);
    }

    #[test]
    fn test_xid_masked_to_24_bits() {
        let client_id = test_duid(1);
        let bytes = encode(&ClientMessage {
            kind: MessageType::Solicit,
            xid: 0xffab_cdef,
            elapsed: 0,
            client_id: &client_id,
            server_id: None,
            ia: None,
            oro: &[],
            rapid_commit: false,
            user_class: &[],
            vendor_class: &[],
            fqdn: None,
        });
        assert_eq!(decode(&bytes).unwrap().xid, 0x00ab_cdef);
    }

    #[test]
    fn test_decode_rejects_short_header() {
        assert_eq!(decode(&[]), Err(DecodeError::Truncated));
        assert_eq!(decode(&[7, 0, 0]), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert_eq!(decode(&[99, 0, 0, 1]), Err(DecodeError::UnknownType(99)));
    }

    #[test]
    fn test_decode_rejects_truncated_option() {
        // Reply header + option claiming 10 bytes with only 2 present.
        let data = [7, 0, 0, 1, 0, 1, 0, 10, 0xaa, 0xbb];
        assert_eq!(decode(&data), Err(DecodeError::MalformedOption(1)));
    }

    #[test]
    fn test_decode_rejects_bad_preference_length() {
        let data = [7, 0, 0, 1, 0, 7, 0, 2, 1, 2];
        assert_eq!(decode(&data), Err(DecodeError::MalformedOption(7)));
    }

    #[test]
    fn test_decode_rejects_address_with_valid_below_preferred() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[7, 0, 0, 1]);
        put_option(&mut buf, OPT_IA_NA, |b| {
            b.put_u32(1);
            b.put_u32(0);
            b.put_u32(0);
            b.put_u16(OPT_IA_ADDRESS);
            b.put_u16(24);
            b.put_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
            b.put_u32(7200); // preferred
            b.put_u32(3600); // valid < preferred
        });
        assert_eq!(decode(&buf), Err(DecodeError::MalformedOption(OPT_IA_NA)));
    }

    #[test]
    fn test_domain_list_decode() {
        // "example.com" + "lab"
        let body = [
            7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0, 3, b'l', b'a',
            b'b', 0,
        ];
        let names = decode_domain_list(&body).unwrap();
        assert_eq!(names, vec!["example.com".to_string(), "lab".to_string()]);
    }

    #[test]
    fn test_domain_list_rejects_compression_pointer() {
        assert!(decode_domain_list(&[0xc0, 0x04, 0]).is_none());
    }

    #[test]
    fn test_domain_list_rejects_truncated_label() {
        assert!(decode_domain_list(&[5, b'a', b'b']).is_none());
    }

    #[test]
    fn test_status_code_decode() {
        let body = [0, 2, b'n', b'o', b'p', b'e'];
        let status = decode_status(&body).unwrap();
        assert_eq!(status.code, StatusCode::NoAddrsAvail);
        assert_eq!(status.message, "nope");
    }

    #[test]
    fn test_ia_usability() {
        let mut ia = sample_ia();
        assert!(ia.is_usable());

        ia.status = Some(Status::new(StatusCode::NoAddrsAvail, ""));
        assert!(!ia.is_usable());

        ia.status = None;
        ia.addrs.clear();
        assert!(!ia.is_usable());
    }

    #[test]
    fn test_effective_status_prefers_top_level() {
        let mut msg = ParsedMessage::new(MessageType::Reply, 1);
        let mut ia = sample_ia();
        ia.status = Some(Status::new(StatusCode::NoBinding, ""));
        msg.ia_na.push(ia);
        assert_eq!(msg.effective_status(), StatusCode::NoBinding);

        msg.status = Some(Status::new(StatusCode::NotOnLink, ""));
        assert_eq!(msg.effective_status(), StatusCode::NotOnLink);
    }

    #[test]
    fn test_fqdn_partial_name() {
        let client_id = test_duid(1);
        let bytes = encode(&ClientMessage {
            kind: MessageType::Solicit,
            xid: 1,
            elapsed: 0,
            client_id: &client_id,
            server_id: None,
            ia: None,
            oro: &[],
            rapid_commit: false,
            user_class: &[],
            vendor_class: &[],
            fqdn: Some("myhost"),
        });
        // flags byte + single label, no root terminator
        let tail = &bytes[bytes.len() - 8..];
        assert_eq!(tail, &[1, 6, b'm', b'y', b'h', b'o', b's', b't']);
    }
}
