//! Per-interface device context.
//!
//! A device owns everything the FSM needs for one interface: the client
//! DUID, the IA identifier, the configuration profile, the current state
//! (with its per-state data), the current lease and the single timer
//! deadline. The event loop refers to devices by interface index only.

use crate::duid::Duid;
use crate::lease::Lease;
use crate::selection::{Offer, SelectionBuffer};
use crate::transaction::Transaction;
use crate::types::{Mode, RequestOption};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};

/// Configuration profile attached to a device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Network interface name
    pub ifname: String,

    /// Address configuration mode
    pub mode: Mode,

    /// Ask servers for the Solicit/Reply shortcut
    pub rapid_commit: bool,

    /// Hostname to put into the FQDN option
    pub hostname: Option<String>,

    /// User Class entries sent in every request
    pub user_class: Vec<String>,

    /// Vendor Class entries sent in every request
    pub vendor_class: Vec<String>,

    /// Options requested via ORO
    pub request_options: Vec<RequestOption>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ifname: String::from("eth0"),
            mode: Mode::Managed,
            rapid_commit: false,
            hostname: None,
            user_class: Vec::new(),
            vendor_class: Vec::new(),
            request_options: vec![RequestOption::DnsServers, RequestOption::DomainSearch],
        }
    }
}

/// Per-device protocol statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceStats {
    /// Messages transmitted, first transmissions only
    pub messages_sent: u64,

    /// Retransmissions of the current transaction
    pub retransmissions: u64,

    /// Advertise messages accepted into the selection buffer
    pub advertises_received: u64,

    /// Reply messages accepted by the FSM
    pub replies_received: u64,

    /// Packets dropped because the codec rejected them
    pub malformed_dropped: u64,

    /// Packets dropped for a ClientID/ServerID mismatch
    pub unauthenticated_dropped: u64,

    /// Packets dropped for a transaction-id mismatch
    pub xid_mismatch_dropped: u64,

    /// Packets dropped for an unacceptable source address or type
    pub source_dropped: u64,

    /// Leases successfully applied
    pub leases_acquired: u64,

    /// Leases lost to expiry, timeout or local failure
    pub leases_lost: u64,
}

/// FSM state, one variant per state with the data only that state uses.
#[derive(Debug)]
pub(crate) enum State {
    Init,
    Selecting {
        tx: Transaction,
        offers: SelectionBuffer,
    },
    Requesting {
        tx: Transaction,
        offer: Offer,
        offers: SelectionBuffer,
    },
    Validating {
        lease: Box<Lease>,
    },
    Bound,
    Renewing {
        tx: Transaction,
    },
    RenewRequested {
        tx: Transaction,
    },
    Rebinding {
        tx: Transaction,
    },
    Reboot {
        tx: Transaction,
    },
    Released {
        tx: Option<Transaction>,
        lease: Option<Box<Lease>>,
    },
    RequestingInfo {
        tx: Transaction,
    },
}

/// Per-interface state envelope driven by the FSM.
pub struct Device {
    /// Opaque interface index
    pub ifindex: u32,

    /// Configuration profile
    pub config: DeviceConfig,

    /// Stable client identifier
    pub duid: Duid,

    /// Identity association id for this interface
    pub ia_id: u32,

    /// Whether the link manager reported the link up
    pub link_ready: bool,

    /// Protocol statistics
    pub stats: DeviceStats,

    pub(crate) enabled: bool,
    pub(crate) state: State,
    pub(crate) lease: Option<Lease>,
    pub(crate) cached_lease: Option<Lease>,
    pub(crate) banned_servers: Vec<Duid>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) sol_max_rt: Option<Duration>,
    pub(crate) inf_max_rt: Option<Duration>,
    pub(crate) rng: SmallRng,
}

impl Device {
    /// Create a device context for one interface.
    pub fn new(ifindex: u32, config: DeviceConfig, duid: Duid) -> Self {
        let ia_id = derive_ia_id(&duid, ifindex);
        Self {
            ifindex,
            config,
            ia_id,
            duid,
            link_ready: false,
            stats: DeviceStats::default(),
            enabled: false,
            state: State::Init,
            lease: None,
            cached_lease: None,
            banned_servers: Vec::new(),
            deadline: None,
            sol_max_rt: None,
            inf_max_rt: None,
            rng: SmallRng::from_entropy(),
        }
    }

    /// Create a device with a deterministic RNG, for tests.
    pub fn with_seed(ifindex: u32, config: DeviceConfig, duid: Duid, seed: u64) -> Self {
        let mut dev = Self::new(ifindex, config, duid);
        dev.rng = SmallRng::seed_from_u64(seed);
        dev
    }

    /// Stable display name of the current state.
    pub fn state_name(&self) -> &'static str {
        match &self.state {
            State::Init => "INIT",
            State::Selecting { .. } => "SELECTING",
            State::Requesting { .. } => "REQUESTING",
            State::Validating { .. } => "VALIDATING",
            State::Bound => "BOUND",
            State::Renewing { .. } => "RENEWING",
            State::Rebinding { .. } => "REBINDING",
            State::Reboot { .. } => "REBOOT",
            State::RenewRequested { .. } => "RENEW-REQUESTED",
            State::Released { .. } => "RELEASED",
            State::RequestingInfo { .. } => "REQUESTING-INFO",
        }
    }

    /// The transaction id of the active exchange, set exactly in the
    /// transactional states.
    pub fn current_xid(&self) -> Option<u32> {
        match &self.state {
            State::Selecting { tx, .. }
            | State::Requesting { tx, .. }
            | State::Renewing { tx }
            | State::RenewRequested { tx }
            | State::Rebinding { tx }
            | State::Reboot { tx }
            | State::RequestingInfo { tx } => Some(tx.xid),
            _ => None,
        }
    }

    /// The transaction id inbound packets must carry to be accepted. Unlike
    /// [`current_xid`](Self::current_xid) this includes the Release exchange
    /// still draining in RELEASED.
    pub(crate) fn expected_xid(&self) -> Option<u32> {
        match &self.state {
            State::Released { tx: Some(tx), .. } => Some(tx.xid),
            _ => self.current_xid(),
        }
    }

    /// The unicast endpoint a server Reply may legitimately come from:
    /// the bound server, or the server a Release is still draining to.
    pub(crate) fn unicast_server_addr(&self) -> Option<std::net::Ipv6Addr> {
        if let State::Released {
            lease: Some(lease), ..
        } = &self.state
        {
            return Some(lease.server_addr);
        }
        self.lease.as_ref().map(|lease| lease.server_addr)
    }

    /// The armed timer deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The currently bound lease, if any.
    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Seed the REBOOT/Confirm path with a lease loaded from the cache.
    pub fn set_cached_lease(&mut self, lease: Lease) {
        self.cached_lease = Some(lease);
    }

    /// Force the device timer, for test injection.
    pub fn set_timeout(&mut self, now: Instant, ms: u64) {
        self.deadline = Some(now + Duration::from_millis(ms));
    }

    /// Force the device timer in seconds, for test injection.
    pub fn set_timeout_seconds(&mut self, now: Instant, secs: u64) {
        self.deadline = Some(now + Duration::from_secs(secs));
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("ifindex", &self.ifindex)
            .field("ifname", &self.config.ifname)
            .field("state", &self.state_name())
            .field("xid", &self.current_xid())
            .finish()
    }
}

/// Derive a stable IA identifier from the DUID and interface index, the
/// same value across restarts.
fn derive_ia_id(duid: &Duid, ifindex: u32) -> u32 {
    let mut id = ifindex;
    for chunk in duid.as_bytes().chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        id ^= u32::from_be_bytes(word);
    }
    id
}
