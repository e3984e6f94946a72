//! Lease application to the operating system, plus the on-disk cache.
//!
//! The FSM hands granted leases over as [`dhcp6::Action::Apply`] actions;
//! the worker runs the applier in a spawned task and feeds the outcome
//! back as a `LeaseApplied` event, so the device loop never blocks on
//! address installation.

use async_trait::async_trait;
use common::Result;
use dhcp6::{ApplyOutcome, CachedLease, IaAddr, Lease};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Installs and removes leased addresses on an interface.
#[async_trait]
pub trait LeaseApplier: Send + Sync {
    /// Install the lease; `removed` lists addresses a replaced lease held
    /// that must be dropped from the interface.
    async fn apply(&self, ifname: &str, lease: &Lease, removed: &[IaAddr]) -> ApplyOutcome;

    /// Remove every address of the lease from the interface.
    async fn withdraw(&self, ifname: &str, lease: &Lease);
}

/// Applier that configures nothing. Used for info-only profiles (where
/// the payload is DNS/NTP data, not addresses) and in tests.
pub struct NullApplier;

#[async_trait]
impl LeaseApplier for NullApplier {
    async fn apply(&self, ifname: &str, lease: &Lease, _removed: &[IaAddr]) -> ApplyOutcome {
        debug!(ifname, addrs = lease.addrs.len(), "Null applier accepting lease");
        ApplyOutcome::Ok
    }

    async fn withdraw(&self, _ifname: &str, _lease: &Lease) {}
}

/// Applier that drives ip(8) to install addresses.
pub struct IpCommandApplier;

#[async_trait]
impl LeaseApplier for IpCommandApplier {
    async fn apply(&self, ifname: &str, lease: &Lease, removed: &[IaAddr]) -> ApplyOutcome {
        for addr in removed {
            del_address(ifname, addr).await;
        }

        for addr in &lease.addrs {
            let addr_arg = format!("{}/128", addr.addr);
            let preferred = lifetime_arg(addr.preferred);
            let valid = lifetime_arg(addr.valid);
            let output = Command::new("ip")
                .args([
                    "-6",
                    "addr",
                    "replace",
                    addr_arg.as_str(),
                    "dev",
                    ifname,
                    "preferred_lft",
                    preferred.as_str(),
                    "valid_lft",
                    valid.as_str(),
                ])
                .output()
                .await;
            match output {
                Ok(output) if output.status.success() => {
                    info!(ifname, addr = %addr.addr, "Installed leased address");
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    warn!(ifname, addr = %addr.addr, error = %stderr, "ip addr replace failed");
                    return ApplyOutcome::Failed(stderr);
                }
                Err(e) => return ApplyOutcome::Failed(e.to_string()),
            }
        }

        // Kernel DAD marks losers as dadfailed; report them so the FSM
        // can send Decline.
        match dad_failed_addrs(ifname, lease).await {
            Ok(conflicts) if !conflicts.is_empty() => ApplyOutcome::DadConflict(conflicts),
            Ok(_) => ApplyOutcome::Ok,
            Err(e) => {
                warn!(ifname, error = %e, "Could not check DAD state");
                ApplyOutcome::Ok
            }
        }
    }

    async fn withdraw(&self, ifname: &str, lease: &Lease) {
        for addr in &lease.addrs {
            del_address(ifname, addr).await;
        }
    }
}

async fn del_address(ifname: &str, addr: &IaAddr) {
    let addr_arg = format!("{}/128", addr.addr);
    let result = Command::new("ip")
        .args(["-6", "addr", "del", addr_arg.as_str(), "dev", ifname])
        .output()
        .await;
    match result {
        Ok(output) if output.status.success() => {
            info!(ifname, addr = %addr.addr, "Removed leased address");
        }
        Ok(_) => {
            // Usually already gone; nothing to do.
            debug!(ifname, addr = %addr.addr, "Address not present on removal");
        }
        Err(e) => warn!(ifname, error = %e, "ip addr del failed"),
    }
}

async fn dad_failed_addrs(ifname: &str, lease: &Lease) -> std::io::Result<Vec<std::net::Ipv6Addr>> {
    let output = Command::new("ip")
        .args(["-6", "addr", "show", "dev", ifname, "dadfailed"])
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    Ok(lease
        .addrs
        .iter()
        .map(|a| a.addr)
        .filter(|addr| text.contains(&addr.to_string()))
        .collect())
}

fn lifetime_arg(secs: u32) -> String {
    if secs == u32::MAX {
        "forever".to_string()
    } else {
        secs.to_string()
    }
}

/// Per-interface lease cache: one JSON record per interface, written
/// atomically so a crash never leaves a torn file behind.
#[derive(Debug, Clone)]
pub struct LeaseCache {
    dir: PathBuf,
}

impl LeaseCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, ifname: &str) -> PathBuf {
        self.dir.join(format!("{}.json", ifname))
    }

    /// Read the cached lease record for an interface.
    pub fn get(&self, ifname: &str) -> Option<CachedLease> {
        let path = self.path(ifname);
        let contents = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(cached) => Some(cached),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding corrupt lease cache");
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    /// Persist a lease record for an interface.
    pub fn put(&self, ifname: &str, cached: &CachedLease) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(ifname);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(cached)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Drop the record for an interface.
    pub fn clear(&self, ifname: &str) {
        let _ = std::fs::remove_file(self.path(ifname));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn cache_dir() -> PathBuf {
        std::env::temp_dir().join(format!("lease-cache-test-{}", std::process::id()))
    }

    fn sample_record() -> CachedLease {
        CachedLease {
            server_id: "00030001aabb".to_string(),
            server_addr: "fe80::1".parse().unwrap(),
            ia_id: 7,
            t1: 1800,
            t2: 2880,
            addrs: vec![IaAddr {
                addr: "2001:db8::1".parse::<Ipv6Addr>().unwrap(),
                preferred: 3600,
                valid: 7200,
            }],
            dns_servers: vec![],
            dns_search: vec![],
            sntp_servers: vec![],
            sip_servers: vec![],
            acquired_unix: 1_700_000_000,
        }
    }

    #[test]
    fn test_cache_put_get_clear() {
        let dir = cache_dir();
        let cache = LeaseCache::new(&dir);

        assert!(cache.get("test0").is_none());
        cache.put("test0", &sample_record()).unwrap();

        let loaded = cache.get("test0").unwrap();
        assert_eq!(loaded.ia_id, 7);
        assert_eq!(loaded.addrs.len(), 1);

        cache.clear("test0");
        assert!(cache.get("test0").is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_cache_discarded() {
        let dir = cache_dir().join("corrupt");
        let cache = LeaseCache::new(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("test0.json"), b"{ not json").unwrap();

        assert!(cache.get("test0").is_none());
        // The corrupt file is gone afterwards.
        assert!(!dir.join("test0.json").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_lifetime_arg_forever() {
        assert_eq!(lifetime_arg(3600), "3600");
        assert_eq!(lifetime_arg(u32::MAX), "forever");
    }
}
