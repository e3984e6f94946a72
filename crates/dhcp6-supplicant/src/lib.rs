//! DHCPv6 supplicant service
//!
//! Runs the `dhcp6` client state machine on real interfaces:
//!
//! - **Config**: YAML profiles describing which interfaces to manage and how
//! - **Link**: per-interface UDP/546 socket with the multicast join
//! - **Applier**: installs leased addresses via ip(8), reports DAD conflicts
//! - **Worker**: one tokio task per device alternating between timer,
//!   socket, commands and applier completions
//! - **Supervisor**: owns the workers, persists the client DUID and lease
//!   cache, surfaces lease events
//!
//! The core protocol logic lives in the `dhcp6` crate; this crate only
//! provides I/O and lifecycle around it.

pub mod applier;
pub mod config;
pub mod link;
pub mod supervisor;
pub mod worker;

pub use applier::{IpCommandApplier, LeaseApplier, LeaseCache, NullApplier};
pub use config::{Config, ConfigError};
pub use link::Link;
pub use supervisor::Supervisor;
pub use worker::{Command, DeviceWorker, LeaseNotification};
