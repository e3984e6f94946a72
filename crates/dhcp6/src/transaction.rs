//! Retransmission scheduling per RFC 3315 section 14.
//!
//! Every client message exchange runs under four parameters: IRT (initial
//! retransmission timeout), MRT (maximum per-try timeout), MRC (maximum
//! transmission count) and MRD (maximum total duration). Each timeout is
//! randomized by a factor drawn uniformly from [-0.1, +0.1]; the first
//! Solicit timeout additionally absorbs the random initial delay the RFC
//! prescribes before a client first transmits.

use crate::types::{MessageType, XID_MASK};
use rand::Rng;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

/// Retransmission randomization factor (RAND in RFC 3315 section 14).
const JITTER: f64 = 0.1;

/// Where retransmissions of this transaction are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// All_DHCP_Relay_Agents_and_Servers on the local link.
    Multicast,
    /// The bound server's unicast address (Renew, and Release after bind).
    Unicast(Ipv6Addr),
}

/// Per-message retransmission parameters.
///
/// `mrt` zero means the per-try timeout is uncapped; `mrc`/`mrd` zero mean
/// unbounded retries / unbounded duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransParams {
    pub irt: Duration,
    pub mrt: Duration,
    pub mrc: u32,
    pub mrd: Duration,
}

impl RetransParams {
    /// The static timing table, one row per client message kind
    /// (RFC 3315 section 5.5).
    pub fn for_message(kind: MessageType) -> Option<Self> {
        let params = match kind {
            MessageType::Solicit => Self {
                irt: Duration::from_secs(1),
                mrt: Duration::from_secs(120),
                mrc: 0,
                mrd: Duration::ZERO,
            },
            MessageType::Request => Self {
                irt: Duration::from_secs(1),
                mrt: Duration::from_secs(30),
                mrc: 10,
                mrd: Duration::from_secs(30),
            },
            MessageType::Confirm => Self {
                irt: Duration::from_secs(1),
                mrt: Duration::from_secs(4),
                mrc: 0,
                mrd: Duration::from_secs(10),
            },
            MessageType::Renew => Self {
                irt: Duration::from_secs(10),
                mrt: Duration::from_secs(600),
                mrc: 0,
                // Patched by the FSM to T2 - T1 of the live lease.
                mrd: Duration::ZERO,
            },
            MessageType::Rebind => Self {
                irt: Duration::from_secs(10),
                mrt: Duration::from_secs(600),
                mrc: 0,
                // Patched by the FSM to the remaining valid lifetime.
                mrd: Duration::ZERO,
            },
            MessageType::Release => Self {
                irt: Duration::from_secs(1),
                mrt: Duration::ZERO,
                mrc: 5,
                mrd: Duration::ZERO,
            },
            MessageType::Decline => Self {
                irt: Duration::from_secs(1),
                mrt: Duration::ZERO,
                mrc: 5,
                mrd: Duration::ZERO,
            },
            MessageType::InformationRequest => Self {
                irt: Duration::from_secs(1),
                mrt: Duration::from_secs(120),
                mrc: 0,
                mrd: Duration::ZERO,
            },
            _ => return None,
        };
        Some(params)
    }

    /// Replace the wall bound; used for Renew/Rebind whose MRD depends on
    /// the lease being maintained.
    pub fn with_mrd(mut self, mrd: Duration) -> Self {
        self.mrd = mrd;
        self
    }
}

/// Outcome of a retransmission tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransDecision {
    /// Send the message again and sleep until `deadline`.
    Retransmit { deadline: Instant },
    /// MRC or MRD exhausted; the FSM decides what the failure means.
    GiveUp,
}

/// One in-flight message exchange: a fresh 24-bit transaction id, the
/// retransmission state, and the destination.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub kind: MessageType,
    pub xid: u32,
    pub started_at: Instant,
    pub dest: Destination,
    params: RetransParams,
    transmissions: u32,
    rt: Duration,
    deadline: Instant,
}

impl Transaction {
    /// Start a new exchange. The first transmission happens immediately
    /// (the caller sends right after constructing); the returned
    /// transaction already carries the armed first deadline.
    pub fn new(
        kind: MessageType,
        dest: Destination,
        params: RetransParams,
        now: Instant,
        rng: &mut impl Rng,
    ) -> Self {
        let mut rt = randomized(params.irt, rng);
        if kind == MessageType::Solicit {
            // RFC 3315 section 17.1.2: desynchronize clients that start
            // together by stretching the first Solicit timeout.
            rt += params.irt.mul_f64(rng.gen_range(0.0..1.0));
        }
        let deadline = clamp_to_mrd(now + rt, now, params.mrd);

        Self {
            kind,
            xid: new_xid(rng),
            started_at: now,
            dest,
            params,
            transmissions: 1,
            rt,
            deadline,
        }
    }

    /// The instant the next retransmission (or give-up) is due.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Transmissions so far, the first included.
    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }

    /// Handle the retransmission timer firing.
    pub fn on_timeout(&mut self, now: Instant, rng: &mut impl Rng) -> RetransDecision {
        if self.params.mrc != 0 && self.transmissions >= self.params.mrc {
            return RetransDecision::GiveUp;
        }
        if !self.params.mrd.is_zero() && now >= self.started_at + self.params.mrd {
            return RetransDecision::GiveUp;
        }

        let mut next = randomized(self.rt * 2, rng);
        if !self.params.mrt.is_zero() && next > self.params.mrt {
            next = randomized(self.params.mrt, rng);
        }
        self.rt = next;
        self.transmissions += 1;
        self.deadline = clamp_to_mrd(now + next, self.started_at, self.params.mrd);

        RetransDecision::Retransmit {
            deadline: self.deadline,
        }
    }

    /// Elapsed Time option value: hundredths of a second since the first
    /// transmission, clamped to 0xFFFF.
    pub fn elapsed_hundredths(&self, now: Instant) -> u16 {
        let elapsed = now.saturating_duration_since(self.started_at);
        (elapsed.as_millis() / 10).min(0xffff) as u16
    }

    /// Apply a server-supplied SOL_MAX_RT/INF_MAX_RT (RFC 7083).
    pub fn set_max_rt(&mut self, mrt: Duration) {
        self.params.mrt = mrt;
    }

    /// Redirect retransmissions, e.g. after a UseMulticast status.
    pub fn set_destination(&mut self, dest: Destination) {
        self.dest = dest;
    }
}

/// Draw a fresh uniformly random 24-bit transaction id.
pub fn new_xid(rng: &mut impl Rng) -> u32 {
    rng.gen::<u32>() & XID_MASK
}

fn randomized(base: Duration, rng: &mut impl Rng) -> Duration {
    base.mul_f64(1.0 + rng.gen_range(-JITTER..=JITTER))
}

fn clamp_to_mrd(deadline: Instant, started_at: Instant, mrd: Duration) -> Instant {
    if mrd.is_zero() {
        deadline
    } else {
        deadline.min(started_at + mrd)
    }
}
