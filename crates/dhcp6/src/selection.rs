//! Advertise collection and server selection (RFC 3315 section 17.1.3).
//!
//! While a device sits in SELECTING it buffers one offer per server; a
//! newer Advertise from the same server replaces the older one. Selection
//! picks the highest preference and breaks ties by arrival order.

use crate::duid::Duid;
use crate::message::{Ia, ParsedMessage};
use crate::types::{MessageType, StatusCode};
use std::net::Ipv6Addr;
use std::time::Instant;

/// One buffered Advertise, reduced to what Request needs.
#[derive(Debug, Clone)]
pub struct Offer {
    pub server_id: Duid,
    pub preference: u8,
    pub ia: Ia,
    pub src: Ipv6Addr,
    pub received_at: Instant,
}

impl Offer {
    /// Build an offer from a validated Advertise. Returns `None` when the
    /// message carries no usable IA_NA for this device or a failure status;
    /// such advertisements never enter the selection buffer.
    pub fn from_advertise(
        msg: &ParsedMessage,
        ia_id: u32,
        src: Ipv6Addr,
        received_at: Instant,
    ) -> Option<Self> {
        if msg.msg_type != MessageType::Advertise {
            return None;
        }
        if msg.effective_status() != StatusCode::Success {
            return None;
        }
        let server_id = msg.server_id.clone()?;
        let ia = msg.find_ia(ia_id)?;
        if !ia.is_usable() {
            return None;
        }
        Some(Self {
            server_id,
            preference: msg.preference,
            ia: ia.clone(),
            src,
            received_at,
        })
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    offer: Offer,
}

/// The set of offers collected during SELECTING.
#[derive(Debug, Default)]
pub struct SelectionBuffer {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl SelectionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an offer, replacing any previous one from the same server.
    pub fn insert(&mut self, offer: Offer) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.retain(|e| e.offer.server_id != offer.server_id);
        self.entries.push(Entry { seq, offer });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop a server from consideration (e.g. after NoAddrsAvail).
    pub fn remove(&mut self, server_id: &Duid) {
        self.entries.retain(|e| &e.offer.server_id != server_id);
    }

    /// Pick and remove the best offer: highest preference, then first seen.
    pub fn take_best(&mut self) -> Option<Offer> {
        let best = self
            .entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.offer
                    .preference
                    .cmp(&b.offer.preference)
                    .then(b.seq.cmp(&a.seq))
            })?
            .0;
        Some(self.entries.swap_remove(best).offer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IaAddress;
    use crate::types::Status;

    fn duid(tail: u8) -> Duid {
        Duid::from_bytes(&[0x00, 0x03, 0x00, 0x01, tail]).unwrap()
    }

    fn advertise(tail: u8, preference: u8) -> ParsedMessage {
        let mut msg = ParsedMessage::new(MessageType::Advertise, 0x1234);
        msg.server_id = Some(duid(tail));
        msg.preference = preference;
        let mut ia = Ia::new(1);
        ia.addrs.push(IaAddress {
            addr: "2001:db8::1".parse().unwrap(),
            preferred: 3600,
            valid: 7200,
            status: None,
        });
        msg.ia_na.push(ia);
        msg
    }

    fn src() -> Ipv6Addr {
        "fe80::1".parse().unwrap()
    }

    #[test]
    fn test_one_entry_per_server() {
        let now = Instant::now();
        let mut buf = SelectionBuffer::new();

        buf.insert(Offer::from_advertise(&advertise(1, 10), 1, src(), now).unwrap());
        buf.insert(Offer::from_advertise(&advertise(1, 20), 1, src(), now).unwrap());
        assert_eq!(buf.len(), 1);

        let best = buf.take_best().unwrap();
        assert_eq!(best.preference, 20);
    }

    #[test]
    fn test_highest_preference_wins() {
        let now = Instant::now();
        let mut buf = SelectionBuffer::new();

        buf.insert(Offer::from_advertise(&advertise(1, 10), 1, src(), now).unwrap());
        buf.insert(Offer::from_advertise(&advertise(2, 200), 1, src(), now).unwrap());
        buf.insert(Offer::from_advertise(&advertise(3, 50), 1, src(), now).unwrap());

        assert_eq!(buf.take_best().unwrap().server_id, duid(2));
    }

    #[test]
    fn test_tie_broken_by_arrival() {
        let now = Instant::now();
        let mut buf = SelectionBuffer::new();

        buf.insert(Offer::from_advertise(&advertise(1, 50), 1, src(), now).unwrap());
        buf.insert(Offer::from_advertise(&advertise(2, 50), 1, src(), now).unwrap());

        assert_eq!(buf.take_best().unwrap().server_id, duid(1));
        assert_eq!(buf.take_best().unwrap().server_id, duid(2));
    }

    #[test]
    fn test_remove_server() {
        let now = Instant::now();
        let mut buf = SelectionBuffer::new();

        buf.insert(Offer::from_advertise(&advertise(1, 10), 1, src(), now).unwrap());
        buf.remove(&duid(1));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_failure_status_excluded() {
        let mut msg = advertise(1, 10);
        msg.status = Some(Status::new(StatusCode::NoAddrsAvail, "sorry"));
        assert!(Offer::from_advertise(&msg, 1, src(), Instant::now()).is_none());
    }

    #[test]
    fn test_wrong_ia_id_excluded() {
        let msg = advertise(1, 10);
        assert!(Offer::from_advertise(&msg, 99, src(), Instant::now()).is_none());
    }

    #[test]
    fn test_empty_ia_excluded() {
        let mut msg = advertise(1, 10);
        msg.ia_na[0].addrs.clear();
        assert!(Offer::from_advertise(&msg, 1, src(), Instant::now()).is_none());
    }
}
