//! Inbound packet dispatching.
//!
//! Every datagram from the link manager passes through here before the FSM
//! sees it: decode, source filter, direction filter, transaction-id match
//! and identifier checks (RFC 3315 section 15). Anything that fails is
//! dropped silently apart from a counter and a debug line.

use crate::device::Device;
use crate::fsm::{Action, Event};
use crate::message;
use crate::types::MessageType;
use std::net::Ipv6Addr;
use std::time::Instant;
use tracing::debug;

/// What became of an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The FSM consumed the message.
    Handled,
    /// The packet was dropped before reaching the FSM.
    Dropped(DropReason),
}

/// Why a packet was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The codec rejected the bytes.
    Malformed,
    /// Source address is neither link-local nor the bound server.
    BadSource,
    /// Not a server-to-client message type.
    UnexpectedType,
    /// Reconfigure is recognized but intentionally not supported.
    Reconfigure,
    /// No transaction running, or the transaction id does not match.
    XidMismatch,
    /// ClientID absent/mismatched, or ServerID absent.
    Unauthenticated,
}

/// Validate one inbound datagram and hand it to the device FSM.
pub fn process_client_packet(
    dev: &mut Device,
    data: &[u8],
    src: Ipv6Addr,
    now: Instant,
) -> (Disposition, Vec<Action>) {
    let msg = match message::decode(data) {
        Ok(msg) => msg,
        Err(e) => {
            dev.stats.malformed_dropped += 1;
            debug!(
                ifname = %dev.config.ifname,
                src = %src,
                error = %e,
                "Discarding undecodable packet"
            );
            return (Disposition::Dropped(DropReason::Malformed), Vec::new());
        }
    };

    if !msg.msg_type.is_server_to_client() {
        dev.stats.source_dropped += 1;
        debug!(
            ifname = %dev.config.ifname,
            msg_type = %msg.msg_type,
            src = %src,
            "Discarding non-server message"
        );
        return (Disposition::Dropped(DropReason::UnexpectedType), Vec::new());
    }

    // Reconfigure runs outside any client transaction and requires the
    // authentication machinery this client does not implement.
    if msg.msg_type == MessageType::Reconfigure {
        debug!(ifname = %dev.config.ifname, "Discarding Reconfigure (not supported)");
        return (Disposition::Dropped(DropReason::Reconfigure), Vec::new());
    }

    if !acceptable_source(dev, src) {
        dev.stats.source_dropped += 1;
        debug!(
            ifname = %dev.config.ifname,
            src = %src,
            "Discarding packet from unacceptable source"
        );
        return (Disposition::Dropped(DropReason::BadSource), Vec::new());
    }

    match dev.expected_xid() {
        Some(xid) if xid == msg.xid => {}
        expected => {
            dev.stats.xid_mismatch_dropped += 1;
            debug!(
                ifname = %dev.config.ifname,
                msg_type = %msg.msg_type,
                xid = msg.xid,
                expected = ?expected,
                "Discarding message with unexpected transaction id"
            );
            return (Disposition::Dropped(DropReason::XidMismatch), Vec::new());
        }
    }

    match &msg.client_id {
        Some(id) if *id == dev.duid => {}
        _ => {
            dev.stats.unauthenticated_dropped += 1;
            debug!(
                ifname = %dev.config.ifname,
                msg_type = %msg.msg_type,
                "Discarding message without our client identifier"
            );
            return (
                Disposition::Dropped(DropReason::Unauthenticated),
                Vec::new(),
            );
        }
    }

    if msg.server_id.is_none() {
        dev.stats.unauthenticated_dropped += 1;
        debug!(
            ifname = %dev.config.ifname,
            msg_type = %msg.msg_type,
            "Discarding message without a server identifier"
        );
        return (
            Disposition::Dropped(DropReason::Unauthenticated),
            Vec::new(),
        );
    }

    let actions = dev.process_event(Event::Rx { msg, src }, now);
    (Disposition::Handled, actions)
}

/// Servers answer from a link-local address; the exceptions are the bound
/// server's unicast endpoint answering a unicast Renew/Release, and
/// loopback, which keeps local relays and scripted test servers working.
fn acceptable_source(dev: &Device, src: Ipv6Addr) -> bool {
    if is_link_local(src) || src.is_loopback() {
        return true;
    }
    dev.unicast_server_addr() == Some(src)
}

fn is_link_local(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::duid::Duid;
    use crate::fsm::Event;
    use crate::types::Mode;

    fn duid() -> Duid {
        Duid::from_bytes(&[0x00, 0x03, 0x00, 0x01, 0xaa, 0xbb]).unwrap()
    }

    fn server_duid() -> Duid {
        Duid::from_bytes(&[0x00, 0x03, 0x00, 0x01, 0xcc, 0xdd]).unwrap()
    }

    /// A device parked in SELECTING with a known transaction id.
    fn selecting_device() -> (Device, u32) {
        let mut dev = Device::with_seed(2, DeviceConfig::default(), duid(), 11);
        let now = Instant::now();
        dev.process_event(Event::LinkUp, now);
        dev.process_event(Event::Start(Mode::Managed), now);
        let xid = dev.current_xid().unwrap();
        (dev, xid)
    }

    fn push_opt(buf: &mut Vec<u8>, code: u16, body: &[u8]) {
        buf.extend_from_slice(&code.to_be_bytes());
        buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        buf.extend_from_slice(body);
    }

    /// Minimal Advertise: client id, server id, one IA_NA with one address.
    fn advertise_bytes(xid: u32, client_id: &Duid, server_id: &Duid, ia_id: u32) -> Vec<u8> {
        let mut buf = vec![2, (xid >> 16) as u8, (xid >> 8) as u8, xid as u8];
        push_opt(&mut buf, 1, client_id.as_bytes());
        push_opt(&mut buf, 2, server_id.as_bytes());

        let mut ia = Vec::new();
        ia.extend_from_slice(&ia_id.to_be_bytes());
        ia.extend_from_slice(&0u32.to_be_bytes());
        ia.extend_from_slice(&0u32.to_be_bytes());
        let mut iaaddr = Vec::new();
        iaaddr.extend_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        iaaddr.extend_from_slice(&3600u32.to_be_bytes());
        iaaddr.extend_from_slice(&7200u32.to_be_bytes());
        push_opt(&mut ia, 5, &iaaddr);
        push_opt(&mut buf, 3, &ia);
        buf
    }

    fn link_local() -> Ipv6Addr {
        "fe80::42".parse().unwrap()
    }

    #[test]
    fn test_valid_advertise_is_handled() {
        let (mut dev, xid) = selecting_device();
        let data = advertise_bytes(xid, &duid(), &server_duid(), dev.ia_id);
        let (disposition, _) = process_client_packet(&mut dev, &data, link_local(), Instant::now());
        assert_eq!(disposition, Disposition::Handled);
        assert_eq!(dev.stats.advertises_received, 1);
    }

    #[test]
    fn test_malformed_packet_dropped() {
        let (mut dev, _) = selecting_device();
        let (disposition, actions) =
            process_client_packet(&mut dev, &[2, 0], link_local(), Instant::now());
        assert_eq!(disposition, Disposition::Dropped(DropReason::Malformed));
        assert!(actions.is_empty());
        assert_eq!(dev.stats.malformed_dropped, 1);
    }

    #[test]
    fn test_client_to_server_type_dropped() {
        let (mut dev, xid) = selecting_device();
        let mut data = advertise_bytes(xid, &duid(), &server_duid(), dev.ia_id);
        data[0] = 1; // Solicit
        let (disposition, _) = process_client_packet(&mut dev, &data, link_local(), Instant::now());
        assert_eq!(disposition, Disposition::Dropped(DropReason::UnexpectedType));
    }

    #[test]
    fn test_reconfigure_silently_dropped() {
        let (mut dev, xid) = selecting_device();
        let mut data = advertise_bytes(xid, &duid(), &server_duid(), dev.ia_id);
        data[0] = 10; // Reconfigure
        let (disposition, _) = process_client_packet(&mut dev, &data, link_local(), Instant::now());
        assert_eq!(disposition, Disposition::Dropped(DropReason::Reconfigure));
    }

    #[test]
    fn test_non_link_local_source_dropped() {
        let (mut dev, xid) = selecting_device();
        let data = advertise_bytes(xid, &duid(), &server_duid(), dev.ia_id);
        let src: Ipv6Addr = "2001:db8::99".parse().unwrap();
        let (disposition, _) = process_client_packet(&mut dev, &data, src, Instant::now());
        assert_eq!(disposition, Disposition::Dropped(DropReason::BadSource));
        assert_eq!(dev.stats.source_dropped, 1);
    }

    #[test]
    fn test_xid_mismatch_dropped() {
        let (mut dev, xid) = selecting_device();
        let data = advertise_bytes(xid ^ 1, &duid(), &server_duid(), dev.ia_id);
        let (disposition, _) = process_client_packet(&mut dev, &data, link_local(), Instant::now());
        assert_eq!(disposition, Disposition::Dropped(DropReason::XidMismatch));
        assert_eq!(dev.stats.xid_mismatch_dropped, 1);
    }

    #[test]
    fn test_foreign_client_id_dropped() {
        let (mut dev, xid) = selecting_device();
        let data = advertise_bytes(xid, &server_duid(), &server_duid(), dev.ia_id);
        let (disposition, _) = process_client_packet(&mut dev, &data, link_local(), Instant::now());
        assert_eq!(
            disposition,
            Disposition::Dropped(DropReason::Unauthenticated)
        );
        assert_eq!(dev.stats.unauthenticated_dropped, 1);
    }

    #[test]
    fn test_missing_server_id_dropped() {
        let (mut dev, xid) = selecting_device();
        let mut buf = vec![2, (xid >> 16) as u8, (xid >> 8) as u8, xid as u8];
        push_opt(&mut buf, 1, duid().as_bytes());
        let (disposition, _) = process_client_packet(&mut dev, &buf, link_local(), Instant::now());
        assert_eq!(
            disposition,
            Disposition::Dropped(DropReason::Unauthenticated)
        );
    }

    #[test]
    fn test_no_transaction_drops_everything() {
        let mut dev = Device::with_seed(2, DeviceConfig::default(), duid(), 11);
        let data = advertise_bytes(0x1234, &duid(), &server_duid(), dev.ia_id);
        let (disposition, _) = process_client_packet(&mut dev, &data, link_local(), Instant::now());
        assert_eq!(disposition, Disposition::Dropped(DropReason::XidMismatch));
    }
}
