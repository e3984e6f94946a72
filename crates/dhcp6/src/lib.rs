//! DHCPv6 client state machine (RFC 3315)
//!
//! Pure Rust implementation of the client side of DHCPv6 for one network
//! interface: Solicit/Advertise/Request/Reply address configuration,
//! rapid commit, Confirm after reboot, Renew/Rebind lease maintenance,
//! Release/Decline, and stateless Information-Request.
//!
//! # Design
//!
//! The crate is I/O free. A [`Device`] is driven by feeding [`Event`]s
//! into [`Device::process_event`] together with an explicit monotonic
//! `now`; it returns the [`Action`]s to execute (transmissions, lease
//! applier calls, notifications) and exposes the single timer deadline to
//! arm next. Sockets, timers and the lease applier live in the service
//! crate on top.
//!
//! # Example
//!
//! ```no_run
//! use dhcp6::{Device, DeviceConfig, Duid, Event, Mode};
//! use std::time::Instant;
//!
//! # fn example() -> common::Result<()> {
//! let duid = Duid::new_ll(dhcp6::duid::HWTYPE_ETHERNET, &[2, 0, 0, 0, 0, 1])?;
//! let mut device = Device::new(2, DeviceConfig::default(), duid);
//!
//! let now = Instant::now();
//! device.process_event(Event::LinkUp, now);
//! let actions = device.process_event(Event::Start(Mode::Managed), now);
//! // send actions, arm device.deadline(), feed packets back in...
//! # let _ = actions;
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod dispatch;
pub mod duid;
pub mod fsm;
pub mod lease;
pub mod message;
pub mod selection;
pub mod transaction;
pub mod types;

pub use device::{Device, DeviceConfig, DeviceStats};
pub use dispatch::{process_client_packet, Disposition, DropReason};
pub use duid::{Duid, DuidKind};
pub use fsm::{Action, ApplyOutcome, Event, LeaseEvent};
pub use lease::{CachedLease, IaAddr, Lease, LeaseState};
pub use message::{DecodeError, ParsedMessage};
pub use selection::{Offer, SelectionBuffer};
pub use transaction::{Destination, RetransParams, Transaction};
pub use types::{MessageType, Mode, RequestOption, StatusCode};
