//! Per-device event loop.
//!
//! One tokio task per interface alternates between the device timer, the
//! socket, the command channel and applier completions, feeding every
//! wakeup into the FSM as exactly one event and executing the returned
//! actions. Lease application is deferred: the applier runs in a spawned
//! task and its outcome comes back through the apply channel as a
//! `LeaseApplied` event.

use crate::applier::{LeaseApplier, LeaseCache};
use crate::link::Link;
use dhcp6::fsm::{Action, ApplyOutcome, Event, LeaseEvent};
use dhcp6::{dispatch, Device};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Operator commands delivered to a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Renew the lease now, ahead of T1.
    Renew,
    /// Release the lease and stay released.
    Release,
    /// Wind the device down; the worker task exits.
    Stop,
}

/// A lease event tagged with the interface it happened on.
#[derive(Debug)]
pub struct LeaseNotification {
    pub ifname: String,
    pub event: LeaseEvent,
}

/// The event loop around one [`Device`].
pub struct DeviceWorker {
    device: Device,
    link: Link,
    applier: Arc<dyn LeaseApplier>,
    cache: LeaseCache,
    notify_tx: mpsc::Sender<LeaseNotification>,
    cmd_rx: mpsc::Receiver<Command>,
    apply_tx: mpsc::Sender<ApplyOutcome>,
    apply_rx: mpsc::Receiver<ApplyOutcome>,
}

impl DeviceWorker {
    pub fn new(
        device: Device,
        link: Link,
        applier: Arc<dyn LeaseApplier>,
        cache: LeaseCache,
        notify_tx: mpsc::Sender<LeaseNotification>,
        cmd_rx: mpsc::Receiver<Command>,
    ) -> Self {
        let (apply_tx, apply_rx) = mpsc::channel(4);
        Self {
            device,
            link,
            applier,
            cache,
            notify_tx,
            cmd_rx,
            apply_tx,
            apply_rx,
        }
    }

    /// Run the device until stopped.
    pub async fn run(mut self) {
        info!(ifname = %self.link.ifname, "Device worker started");

        // The socket is open and joined, so the link is up from the
        // device's point of view.
        let mode = self.device.config.mode;
        let now = Instant::now();
        let mut actions = self.device.process_event(Event::LinkUp, now);
        actions.extend(self.device.process_event(Event::Start(mode), now));
        self.execute(actions).await;

        let mut buf = vec![0u8; 1500];
        loop {
            let deadline = self.device.deadline();
            tokio::select! {
                _ = wait_deadline(deadline) => {
                    let actions = self.device.process_event(Event::TimerFired, Instant::now());
                    self.execute(actions).await;
                }

                result = self.link.recv(&mut buf) => match result {
                    Ok((len, src)) => {
                        let (_, actions) = dispatch::process_client_packet(
                            &mut self.device,
                            &buf[..len],
                            src,
                            Instant::now(),
                        );
                        self.execute(actions).await;
                    }
                    Err(e) => {
                        warn!(ifname = %self.link.ifname, error = %e, "Socket receive failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Renew) => {
                        let actions = self.device.process_event(Event::UserRenew, Instant::now());
                        self.execute(actions).await;
                    }
                    Some(Command::Release) => {
                        let actions = self.device.process_event(Event::UserRelease, Instant::now());
                        self.execute(actions).await;
                    }
                    Some(Command::Stop) | None => {
                        let actions = self.device.process_event(Event::Stop, Instant::now());
                        self.execute(actions).await;
                        break;
                    }
                },

                Some(outcome) = self.apply_rx.recv() => {
                    let actions = self
                        .device
                        .process_event(Event::LeaseApplied(outcome), Instant::now());
                    self.execute(actions).await;
                }
            }
        }

        info!(ifname = %self.link.ifname, "Device worker stopped");
    }

    /// Execute the side effects of one processed event, in order.
    async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Transmit { dest, payload } => {
                    if let Err(e) = self.link.send(dest, &payload).await {
                        // Treated as a no-op tick; the scheduler resends
                        // at the next retransmission timeout.
                        warn!(ifname = %self.link.ifname, error = %e, "Send failed");
                    }
                }

                Action::Apply { lease, removed } => {
                    let applier = self.applier.clone();
                    let apply_tx = self.apply_tx.clone();
                    let ifname = self.link.ifname.clone();
                    tokio::spawn(async move {
                        let outcome = applier.apply(&ifname, &lease, &removed).await;
                        let _ = apply_tx.send(outcome).await;
                    });
                }

                Action::Withdraw(lease) => {
                    self.applier.withdraw(&self.link.ifname, &lease).await;
                }

                Action::Notify(event) => {
                    let notification = LeaseNotification {
                        ifname: self.link.ifname.clone(),
                        event,
                    };
                    if self.notify_tx.send(notification).await.is_err() {
                        warn!(ifname = %self.link.ifname, "Supervisor gone, dropping event");
                    }
                }

                Action::StoreCache(cached) => {
                    if let Err(e) = self.cache.put(&self.link.ifname, &cached) {
                        warn!(ifname = %self.link.ifname, error = %e, "Lease cache write failed");
                    }
                }

                Action::ClearCache => self.cache.clear(&self.link.ifname),
            }
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}
