//! Supervisor: builds per-interface devices from the configuration and
//! owns their worker tasks.

use crate::applier::{IpCommandApplier, LeaseApplier, LeaseCache, NullApplier};
use crate::config::Config;
use crate::link::{self, Link};
use crate::worker::{Command, DeviceWorker, LeaseNotification};
use common::Result;
use dashmap::DashMap;
use dhcp6::fsm::LeaseEvent;
use dhcp6::types::Mode;
use dhcp6::{duid, Device, Duid};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct WorkerHandle {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Owns the device workers and fans lease events upward.
pub struct Supervisor {
    config: Config,
    workers: DashMap<String, WorkerHandle>,
    notify_tx: mpsc::Sender<LeaseNotification>,
    notify_rx: mpsc::Receiver<LeaseNotification>,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(64);
        Self {
            config,
            workers: DashMap::new(),
            notify_tx,
            notify_rx,
        }
    }

    /// Load the client DUID and spawn one worker per configured interface.
    pub fn start(&mut self) -> Result<()> {
        if self.config.interfaces.is_empty() {
            warn!("No interfaces configured, nothing to do");
            return Ok(());
        }

        // The client DUID identifies the host, not an interface; it is
        // generated once from the first profile's hardware address and
        // shared by every device. An unwritable DUID file is fatal.
        let hwaddr = link::interface_hwaddr(&self.config.interfaces[0].name)?;
        let duid = duid::load_or_generate(
            &self.config.duid.path,
            self.config.duid.kind.into(),
            &hwaddr,
        )?;
        info!(duid = %duid, "Client DUID loaded");

        let cache = LeaseCache::new(&self.config.state.lease_cache_dir);
        for profile in self.config.interfaces.clone() {
            match Self::spawn_worker(&profile, &duid, &cache, self.notify_tx.clone()) {
                Ok(handle) => {
                    self.workers.insert(profile.name.clone(), handle);
                }
                Err(e) => {
                    warn!(ifname = %profile.name, error = %e, "Interface not started");
                }
            }
        }
        Ok(())
    }

    fn spawn_worker(
        profile: &crate::config::InterfaceProfile,
        duid: &Duid,
        cache: &LeaseCache,
        notify_tx: mpsc::Sender<LeaseNotification>,
    ) -> Result<WorkerHandle> {
        let link = Link::open(&profile.name)?;
        let device_config = profile.to_device_config();
        let mode = device_config.mode;
        let mut device = Device::new(link.ifindex, device_config, duid.clone());

        // A surviving lease record puts the device on the Confirm path.
        if mode == Mode::Managed {
            if let Some(cached) = cache.get(&profile.name) {
                match cached.into_lease(Instant::now()) {
                    Ok(lease) => {
                        info!(ifname = %profile.name, "Restored cached lease for Confirm");
                        device.set_cached_lease(lease);
                    }
                    Err(e) => {
                        debug!(ifname = %profile.name, error = %e, "Ignoring stale lease cache");
                        cache.clear(&profile.name);
                    }
                }
            }
        }

        let applier: Arc<dyn LeaseApplier> = match mode {
            Mode::Managed => Arc::new(IpCommandApplier),
            Mode::InfoOnly => Arc::new(NullApplier),
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let worker = DeviceWorker::new(device, link, applier, cache.clone(), notify_tx, cmd_rx);
        let task = tokio::spawn(worker.run());
        Ok(WorkerHandle { cmd_tx, task })
    }

    /// Ask one interface to renew its lease ahead of T1.
    pub async fn renew(&self, ifname: &str) {
        self.send_command(ifname, Command::Renew).await;
    }

    /// Ask one interface to release its lease.
    pub async fn release(&self, ifname: &str) {
        self.send_command(ifname, Command::Release).await;
    }

    async fn send_command(&self, ifname: &str, cmd: Command) {
        let cmd_tx = self.workers.get(ifname).map(|h| h.cmd_tx.clone());
        match cmd_tx {
            Some(tx) => {
                let _ = tx.send(cmd).await;
            }
            None => warn!(ifname, "No worker for interface"),
        }
    }

    /// Run until interrupted, logging lease events as they arrive.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                Some(notification) = self.notify_rx.recv() => match notification.event {
                    LeaseEvent::Acquired(lease) => {
                        info!(
                            ifname = %notification.ifname,
                            server = %lease.server_id,
                            addrs = lease.addrs.len(),
                            dns = lease.dns_servers.len(),
                            "Lease acquired"
                        );
                    }
                    LeaseEvent::Released => {
                        info!(ifname = %notification.ifname, "Lease released");
                    }
                    LeaseEvent::Lost(reason) => {
                        warn!(ifname = %notification.ifname, reason = %reason, "Lease lost");
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    break;
                }
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Stop every worker, optionally releasing leases first.
    pub async fn shutdown(&mut self) {
        let grace = self.config.shutdown.grace;

        // Collect senders first; never hold map guards across awaits.
        let senders: Vec<mpsc::Sender<Command>> = self
            .workers
            .iter()
            .map(|entry| entry.cmd_tx.clone())
            .collect();

        if self.config.shutdown.release_leases {
            for tx in &senders {
                let _ = tx.send(Command::Release).await;
            }
            // Give the Release exchanges a moment on the wire.
            tokio::time::sleep(grace / 2).await;
        }

        for tx in &senders {
            let _ = tx.send(Command::Stop).await;
        }

        let names: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, handle)) = self.workers.remove(&name) {
                if tokio::time::timeout(grace, handle.task).await.is_err() {
                    warn!(ifname = %name, "Worker did not stop in time");
                }
            }
        }
    }
}
