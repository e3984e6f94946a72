//! DHCPv6 protocol constants and basic types.
//!
//! Based on RFC 3315 (DHCPv6), with options from RFC 3646 (DNS), RFC 3319
//! (SIP), RFC 4075 (SNTP), RFC 4242 (information refresh time), RFC 4704
//! (FQDN) and RFC 7083 (SOL_MAX_RT/INF_MAX_RT).

use std::net::Ipv6Addr;

/// All_DHCP_Relay_Agents_and_Servers multicast group (RFC 3315 section 5.1)
pub const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x0001, 0x0002);

/// UDP port clients listen on
pub const CLIENT_PORT: u16 = 546;

/// UDP port servers and relay agents listen on
pub const SERVER_PORT: u16 = 547;

/// Transaction ids are 24 bits wide
pub const XID_MASK: u32 = 0x00ff_ffff;

/// Lifetime value meaning "forever" (RFC 3315 section 5.6)
pub const INFINITE_LIFETIME: u32 = u32::MAX;

/// A server preference of 255 tells the client to use this server
/// without waiting for further Advertise messages (RFC 3315 section 17.1.2)
pub const PREFERENCE_MAX: u8 = 255;

/// Default information refresh time when the server sent none (RFC 4242)
pub const IRT_DEFAULT_SECS: u32 = 86_400;

/// Lower bound on the information refresh time (RFC 4242)
pub const IRT_MINIMUM_SECS: u32 = 600;

/// Bounds for server-supplied SOL_MAX_RT / INF_MAX_RT (RFC 7083)
pub const MAX_RT_MIN_SECS: u32 = 60;
pub const MAX_RT_MAX_SECS: u32 = 86_400;

// Option codes used by the client side of the protocol.
pub const OPT_CLIENT_ID: u16 = 1;
pub const OPT_SERVER_ID: u16 = 2;
pub const OPT_IA_NA: u16 = 3;
pub const OPT_IA_ADDRESS: u16 = 5;
pub const OPT_ORO: u16 = 6;
pub const OPT_PREFERENCE: u16 = 7;
pub const OPT_ELAPSED_TIME: u16 = 8;
pub const OPT_STATUS_CODE: u16 = 13;
pub const OPT_RAPID_COMMIT: u16 = 14;
pub const OPT_USER_CLASS: u16 = 15;
pub const OPT_VENDOR_CLASS: u16 = 16;
pub const OPT_SIP_SERVER_ADDR: u16 = 22;
pub const OPT_DNS_SERVERS: u16 = 23;
pub const OPT_DOMAIN_LIST: u16 = 24;
pub const OPT_SNTP_SERVERS: u16 = 31;
pub const OPT_INFO_REFRESH_TIME: u16 = 32;
pub const OPT_FQDN: u16 = 39;
pub const OPT_SOL_MAX_RT: u16 = 82;
pub const OPT_INF_MAX_RT: u16 = 83;

/// DHCPv6 message types (RFC 3315 section 5.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
    Decline = 9,
    Reconfigure = 10,
    InformationRequest = 11,
    RelayForward = 12,
    RelayReply = 13,
}

impl MessageType {
    /// Parse a wire message-type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Solicit),
            2 => Some(MessageType::Advertise),
            3 => Some(MessageType::Request),
            4 => Some(MessageType::Confirm),
            5 => Some(MessageType::Renew),
            6 => Some(MessageType::Rebind),
            7 => Some(MessageType::Reply),
            8 => Some(MessageType::Release),
            9 => Some(MessageType::Decline),
            10 => Some(MessageType::Reconfigure),
            11 => Some(MessageType::InformationRequest),
            12 => Some(MessageType::RelayForward),
            13 => Some(MessageType::RelayReply),
            _ => None,
        }
    }

    /// Protocol name of the message type.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Solicit => "SOLICIT",
            MessageType::Advertise => "ADVERTISE",
            MessageType::Request => "REQUEST",
            MessageType::Confirm => "CONFIRM",
            MessageType::Renew => "RENEW",
            MessageType::Rebind => "REBIND",
            MessageType::Reply => "REPLY",
            MessageType::Release => "RELEASE",
            MessageType::Decline => "DECLINE",
            MessageType::Reconfigure => "RECONFIGURE",
            MessageType::InformationRequest => "INFO-REQUEST",
            MessageType::RelayForward => "RELAY-FORWARD",
            MessageType::RelayReply => "RELAY-REPLY",
        }
    }

    /// Whether a message of this type may legitimately arrive at a client.
    pub fn is_server_to_client(&self) -> bool {
        matches!(
            self,
            MessageType::Advertise | MessageType::Reply | MessageType::Reconfigure
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// DHCPv6 status codes (RFC 3315 section 24.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    UnspecFail,
    NoAddrsAvail,
    NoBinding,
    NotOnLink,
    UseMulticast,
    Other(u16),
}

impl StatusCode {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => StatusCode::Success,
            1 => StatusCode::UnspecFail,
            2 => StatusCode::NoAddrsAvail,
            3 => StatusCode::NoBinding,
            4 => StatusCode::NotOnLink,
            5 => StatusCode::UseMulticast,
            other => StatusCode::Other(other),
        }
    }

    pub fn to_u16(&self) -> u16 {
        match self {
            StatusCode::Success => 0,
            StatusCode::UnspecFail => 1,
            StatusCode::NoAddrsAvail => 2,
            StatusCode::NoBinding => 3,
            StatusCode::NotOnLink => 4,
            StatusCode::UseMulticast => 5,
            StatusCode::Other(other) => *other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StatusCode::Success => "Success",
            StatusCode::UnspecFail => "UnspecFail",
            StatusCode::NoAddrsAvail => "NoAddrsAvail",
            StatusCode::NoBinding => "NoBinding",
            StatusCode::NotOnLink => "NotOnLink",
            StatusCode::UseMulticast => "UseMulticast",
            StatusCode::Other(_) => "Unknown",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::Other(code) => write!(f, "Unknown({})", code),
            _ => f.write_str(self.name()),
        }
    }
}

/// A status code option with its server-supplied message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::new(StatusCode::Success, "")
    }
}

/// Address configuration mode of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Full address configuration: Solicit, Request, Renew, Rebind.
    Managed,
    /// Stateless configuration via Information-Request only.
    InfoOnly,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Managed => write!(f, "managed"),
            Mode::InfoOnly => write!(f, "info-only"),
        }
    }
}

/// Options a device asks for in its Option Request option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOption {
    DnsServers,
    DomainSearch,
    SntpServers,
    SipServers,
}

impl RequestOption {
    /// Wire option code for the ORO entry.
    pub fn code(&self) -> u16 {
        match self {
            RequestOption::DnsServers => OPT_DNS_SERVERS,
            RequestOption::DomainSearch => OPT_DOMAIN_LIST,
            RequestOption::SntpServers => OPT_SNTP_SERVERS,
            RequestOption::SipServers => OPT_SIP_SERVER_ADDR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip() {
        for value in 1..=13u8 {
            let msg_type = MessageType::from_u8(value).unwrap();
            assert_eq!(msg_type as u8, value);
        }
        assert!(MessageType::from_u8(0).is_none());
        assert!(MessageType::from_u8(14).is_none());
    }

    #[test]
    fn test_server_to_client_types() {
        assert!(MessageType::Advertise.is_server_to_client());
        assert!(MessageType::Reply.is_server_to_client());
        assert!(MessageType::Reconfigure.is_server_to_client());
        assert!(!MessageType::Solicit.is_server_to_client());
        assert!(!MessageType::Renew.is_server_to_client());
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(StatusCode::from_u16(0), StatusCode::Success);
        assert_eq!(StatusCode::from_u16(4), StatusCode::NotOnLink);
        assert_eq!(StatusCode::from_u16(77), StatusCode::Other(77));
        assert_eq!(StatusCode::Other(77).to_u16(), 77);
    }

    #[test]
    fn test_multicast_group() {
        assert_eq!(
            ALL_DHCP_RELAY_AGENTS_AND_SERVERS.to_string(),
            "ff02::1:2"
        );
        assert!(ALL_DHCP_RELAY_AGENTS_AND_SERVERS.is_multicast());
    }
}
