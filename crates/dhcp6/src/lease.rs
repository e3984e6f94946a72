//! Lease state: granted addresses, timers and the on-disk cache record.
//!
//! A lease is created from an accepted Reply, replaced wholesale by a
//! successful Renew/Rebind and dropped on Release or expiry. T1/T2 come
//! from the server when set; when the server leaves both at zero the
//! client derives them from the longest preferred lifetime in the lease
//! (T1 = 0.5x, T2 = 0.8x).

use crate::duid::Duid;
use crate::message::{Ia, IaAddress, ParsedMessage};
use crate::types::{INFINITE_LIFETIME, IRT_DEFAULT_SECS, IRT_MINIMUM_SECS};
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Fallback preferred lifetime used for timer derivation when the server
/// granted addresses with unusably short or absent preferred lifetimes.
const DEFAULT_PREFERRED_LIFETIME: u32 = 3600;

/// Shortest preferred lifetime the derivation trusts.
const MIN_PREFERRED_LIFETIME: u32 = 120;

/// Lifecycle of a lease object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Granted,
    Applied,
    Released,
    Failed,
}

/// One leased address with its lifetimes (seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IaAddr {
    pub addr: Ipv6Addr,
    pub preferred: u32,
    pub valid: u32,
}

/// The current lease of a device.
#[derive(Debug, Clone)]
pub struct Lease {
    pub server_id: Duid,
    /// Unicast endpoint for Renew/Release, learned from the Reply source.
    pub server_addr: Ipv6Addr,
    pub ia_id: u32,
    /// Effective renewal time, seconds after acquisition.
    pub t1: u32,
    /// Effective rebind time, seconds after acquisition.
    pub t2: u32,
    pub addrs: Vec<IaAddr>,
    pub dns_servers: Vec<Ipv6Addr>,
    pub dns_search: Vec<String>,
    pub sntp_servers: Vec<Ipv6Addr>,
    pub sip_servers: Vec<Ipv6Addr>,
    pub preference: u8,
    pub rapid_committed: bool,
    pub info_refresh: Option<u32>,
    pub acquired_at: Instant,
    pub state: LeaseState,
}

impl Lease {
    /// Build a lease from an accepted Reply carrying this device's IA_NA.
    pub fn from_reply(
        msg: &ParsedMessage,
        ia_id: u32,
        src: Ipv6Addr,
        now: Instant,
    ) -> Result<Self> {
        let server_id = msg
            .server_id
            .clone()
            .ok_or_else(|| Error::lease("reply without server identifier"))?;
        let ia = msg
            .find_ia(ia_id)
            .ok_or_else(|| Error::lease(format!("reply without IA_NA {:#010x}", ia_id)))?;
        if !ia.is_usable() {
            return Err(Error::lease("reply IA_NA carries no usable address"));
        }

        let addrs: Vec<IaAddr> = ia
            .addrs
            .iter()
            .filter(|a| a.status.as_ref().map(|s| s.is_success()).unwrap_or(true))
            .filter(|a| a.valid > 0)
            .map(|a| IaAddr {
                addr: a.addr,
                preferred: a.preferred,
                valid: a.valid,
            })
            .collect();
        if addrs.is_empty() {
            return Err(Error::lease("reply IA_NA carries no valid address"));
        }

        let (t1, t2) = effective_timers(ia, &addrs);

        Ok(Self {
            server_id,
            server_addr: src,
            ia_id,
            t1,
            t2,
            addrs,
            dns_servers: msg.dns_servers.clone(),
            dns_search: msg.dns_search.clone(),
            sntp_servers: msg.sntp_servers.clone(),
            sip_servers: msg.sip_servers.clone(),
            preference: msg.preference,
            rapid_committed: msg.rapid_commit,
            info_refresh: msg.info_refresh,
            acquired_at: now,
            state: LeaseState::Granted,
        })
    }

    /// Build an address-less lease from an Information-Request Reply.
    pub fn from_info_reply(msg: &ParsedMessage, src: Ipv6Addr, now: Instant) -> Result<Self> {
        let server_id = msg
            .server_id
            .clone()
            .ok_or_else(|| Error::lease("reply without server identifier"))?;

        Ok(Self {
            server_id,
            server_addr: src,
            ia_id: 0,
            t1: 0,
            t2: 0,
            addrs: Vec::new(),
            dns_servers: msg.dns_servers.clone(),
            dns_search: msg.dns_search.clone(),
            sntp_servers: msg.sntp_servers.clone(),
            sip_servers: msg.sip_servers.clone(),
            preference: msg.preference,
            rapid_committed: false,
            info_refresh: msg.info_refresh,
            acquired_at: now,
            state: LeaseState::Granted,
        })
    }

    /// Shortest valid lifetime across the leased addresses.
    pub fn min_valid_lifetime(&self) -> u32 {
        self.addrs
            .iter()
            .map(|a| a.valid)
            .min()
            .unwrap_or(INFINITE_LIFETIME)
    }

    /// When the Renew timer fires: `acquired_at + T1`.
    pub fn t1_deadline(&self) -> Option<Instant> {
        lifetime_deadline(self.acquired_at, self.t1)
    }

    /// When the Rebind timer fires: `acquired_at + T2`.
    pub fn t2_deadline(&self) -> Option<Instant> {
        lifetime_deadline(self.acquired_at, self.t2)
    }

    /// When the earliest address falls off the interface.
    pub fn valid_deadline(&self) -> Option<Instant> {
        lifetime_deadline(self.acquired_at, self.min_valid_lifetime())
    }

    /// The next lease timer from `now`: T1, then T2, then valid expiry.
    pub fn expires_at(&self, now: Instant) -> Option<Instant> {
        for deadline in [self.t1_deadline(), self.t2_deadline(), self.valid_deadline()] {
            match deadline {
                Some(at) if at > now => return Some(at),
                Some(_) => continue,
                // An infinite bound also makes every later bound infinite.
                None => return None,
            }
        }
        self.valid_deadline()
    }

    /// Whether every address has outlived its valid lifetime.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.valid_deadline() {
            Some(at) => now >= at,
            None => false,
        }
    }

    /// Renew window: MRD for the RENEWING transaction (T2 - T1).
    pub fn renew_window(&self) -> Duration {
        if self.t1 == INFINITE_LIFETIME || self.t2 == INFINITE_LIFETIME {
            return Duration::ZERO;
        }
        Duration::from_secs(u64::from(self.t2.saturating_sub(self.t1)))
    }

    /// Rebind window: MRD for the REBINDING transaction (time left until
    /// the earliest valid-lifetime expiry).
    pub fn rebind_window(&self, now: Instant) -> Duration {
        match self.valid_deadline() {
            Some(at) => at.saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Addresses present here but absent from `new`; the applier drops
    /// them from the interface when the lease is replaced.
    pub fn removed_addrs(&self, new: &Lease) -> Vec<IaAddr> {
        self.addrs
            .iter()
            .filter(|old| !new.addrs.iter().any(|a| a.addr == old.addr))
            .copied()
            .collect()
    }

    /// The IA_NA to put into Renew/Rebind/Release/Decline messages.
    pub fn to_ia(&self) -> Ia {
        Ia {
            ia_id: self.ia_id,
            t1: 0,
            t2: 0,
            addrs: self
                .addrs
                .iter()
                .map(|a| IaAddress {
                    addr: a.addr,
                    preferred: a.preferred,
                    valid: a.valid,
                    status: None,
                })
                .collect(),
            status: None,
        }
    }

    /// Information refresh interval for info-only mode (RFC 4242 bounds).
    pub fn info_refresh_interval(&self) -> Duration {
        let secs = self
            .info_refresh
            .unwrap_or(IRT_DEFAULT_SECS)
            .max(IRT_MINIMUM_SECS);
        Duration::from_secs(u64::from(secs))
    }

    /// Snapshot this lease for the on-disk cache.
    pub fn to_cached(&self, now: Instant) -> CachedLease {
        let age = now.saturating_duration_since(self.acquired_at);
        let acquired_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .saturating_sub(age.as_secs());
        CachedLease {
            server_id: self.server_id.to_hex(),
            server_addr: self.server_addr,
            ia_id: self.ia_id,
            t1: self.t1,
            t2: self.t2,
            addrs: self.addrs.clone(),
            dns_servers: self.dns_servers.clone(),
            dns_search: self.dns_search.clone(),
            sntp_servers: self.sntp_servers.clone(),
            sip_servers: self.sip_servers.clone(),
            acquired_unix,
        }
    }
}

/// A lease as persisted between runs. Lifetimes are rebased against the
/// wall clock at load time, which also covers suspend/resume gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedLease {
    pub server_id: String,
    pub server_addr: Ipv6Addr,
    pub ia_id: u32,
    pub t1: u32,
    pub t2: u32,
    pub addrs: Vec<IaAddr>,
    #[serde(default)]
    pub dns_servers: Vec<Ipv6Addr>,
    #[serde(default)]
    pub dns_search: Vec<String>,
    #[serde(default)]
    pub sntp_servers: Vec<Ipv6Addr>,
    #[serde(default)]
    pub sip_servers: Vec<Ipv6Addr>,
    pub acquired_unix: u64,
}

impl CachedLease {
    /// Rehydrate, shrinking every lifetime by the wall-clock age of the
    /// record. Returns an error when the lease has already expired.
    pub fn into_lease(self, now: Instant) -> Result<Lease> {
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let age = now_unix.saturating_sub(self.acquired_unix);
        let age = u32::try_from(age).unwrap_or(u32::MAX);

        let addrs: Vec<IaAddr> = self
            .addrs
            .iter()
            .filter(|a| a.valid == INFINITE_LIFETIME || a.valid > age)
            .map(|a| IaAddr {
                addr: a.addr,
                preferred: sub_lifetime(a.preferred, age),
                valid: sub_lifetime(a.valid, age),
            })
            .collect();
        if addrs.is_empty() {
            return Err(Error::lease("cached lease expired"));
        }

        Ok(Lease {
            server_id: Duid::from_hex(&self.server_id)?,
            server_addr: self.server_addr,
            ia_id: self.ia_id,
            t1: sub_lifetime(self.t1, age),
            t2: sub_lifetime(self.t2, age),
            addrs,
            dns_servers: self.dns_servers,
            dns_search: self.dns_search,
            sntp_servers: self.sntp_servers,
            sip_servers: self.sip_servers,
            preference: 0,
            rapid_committed: false,
            info_refresh: None,
            acquired_at: now,
            state: LeaseState::Granted,
        })
    }
}

fn sub_lifetime(lifetime: u32, age: u32) -> u32 {
    if lifetime == INFINITE_LIFETIME {
        INFINITE_LIFETIME
    } else {
        lifetime.saturating_sub(age)
    }
}

fn lifetime_deadline(acquired_at: Instant, secs: u32) -> Option<Instant> {
    if secs == INFINITE_LIFETIME {
        None
    } else {
        Some(acquired_at + Duration::from_secs(u64::from(secs)))
    }
}

/// Compute effective T1/T2: server values when present, derived from the
/// longest preferred lifetime otherwise, then clamped so that
/// `t1 <= t2 <= min(valid)`.
fn effective_timers(ia: &Ia, addrs: &[IaAddr]) -> (u32, u32) {
    let max_preferred = addrs.iter().map(|a| a.preferred).max().unwrap_or(0);
    let min_valid = addrs.iter().map(|a| a.valid).min().unwrap_or(0);

    let mut t1 = ia.t1;
    let mut t2 = ia.t2;

    if t1 == 0 && t2 == 0 {
        if max_preferred == INFINITE_LIFETIME {
            return (INFINITE_LIFETIME, INFINITE_LIFETIME);
        }
        let base = if max_preferred >= MIN_PREFERRED_LIFETIME {
            max_preferred
        } else {
            DEFAULT_PREFERRED_LIFETIME
        };
        t1 = base / 2;
        t2 = (u64::from(base) * 4 / 5) as u32;
    } else if t2 == 0 {
        // Server set T1 only; stretch the rebind time proportionally.
        t2 = if t1 == INFINITE_LIFETIME {
            INFINITE_LIFETIME
        } else {
            (u64::from(t1) * 8 / 5).min(u64::from(u32::MAX - 1)) as u32
        };
    }

    if t1 == 0 && t2 != 0 {
        // Server recommended a rebind time only.
        t1 = if t2 == INFINITE_LIFETIME {
            INFINITE_LIFETIME
        } else {
            t2 / 2
        };
    }

    if t2 != INFINITE_LIFETIME && min_valid != INFINITE_LIFETIME {
        t2 = t2.min(min_valid);
    } else if min_valid != INFINITE_LIFETIME {
        t2 = min_valid;
    }
    if t1 > t2 {
        t1 = t2;
    }

    (t1, t2)
}
