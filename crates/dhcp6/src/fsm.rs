//! DHCPv6 client state machine.
//!
//! Implements the RFC 3315 client exchanges:
//! - Init -> Selecting -> Requesting -> Validating -> Bound
//! - Bound -> Renewing -> Rebinding on lease timers
//! - Reboot (Confirm) when a cached lease survives a restart
//! - Requesting-Info for stateless (information-only) configuration
//! - Released and Decline handling
//!
//! The machine is purely event driven: [`Device::process_event`] consumes
//! one [`Event`] with an explicit `now` and returns the [`Action`]s the
//! caller must execute (transmissions, applier calls, notifications). The
//! single per-device timer deadline is recomputed on every transition and
//! read back through [`Device::deadline`]. No I/O happens here.

use crate::device::{Device, State};
use crate::duid::Duid;
use crate::lease::{CachedLease, IaAddr, Lease, LeaseState};
use crate::message::{self, ClientMessage, Ia, ParsedMessage};
use crate::selection::{Offer, SelectionBuffer};
use crate::transaction::{new_xid, Destination, RetransDecision, RetransParams, Transaction};
use crate::types::{
    MessageType, Mode, StatusCode, MAX_RT_MAX_SECS, MAX_RT_MIN_SECS, OPT_INFO_REFRESH_TIME,
    OPT_INF_MAX_RT, OPT_SOL_MAX_RT, PREFERENCE_MAX,
};
use bytes::Bytes;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Events consumed by the state machine.
#[derive(Debug)]
pub enum Event {
    /// The link manager reports the interface up.
    LinkUp,
    /// The link manager reports the interface down.
    LinkDown,
    /// Attach and start address configuration in the given mode.
    Start(Mode),
    /// Detach; the device goes quiet keeping its lease as cache.
    Stop,
    /// The armed deadline fired.
    TimerFired,
    /// A validated inbound message from the dispatcher.
    Rx { msg: ParsedMessage, src: Ipv6Addr },
    /// Operator asked for an early renew.
    UserRenew,
    /// Operator asked to release the lease.
    UserRelease,
    /// The lease applier finished installing a lease.
    LeaseApplied(ApplyOutcome),
}

/// Result of handing a lease to the applier.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Ok,
    /// Duplicate address detection failed for these addresses.
    DadConflict(Vec<Ipv6Addr>),
    /// The applier could not install the lease at all.
    Failed(String),
}

/// Lease lifecycle notifications surfaced to the supervisor.
#[derive(Debug, Clone)]
pub enum LeaseEvent {
    Acquired(Box<Lease>),
    Released,
    Lost(String),
}

/// Side effects the event loop executes after processing one event.
#[derive(Debug)]
pub enum Action {
    /// Send wire bytes to the given destination on this interface.
    Transmit { dest: Destination, payload: Bytes },
    /// Hand the lease to the applier; `removed` lists addresses the
    /// previous lease held that the new one no longer does.
    Apply { lease: Box<Lease>, removed: Vec<IaAddr> },
    /// Remove the lease's addresses from the interface.
    Withdraw(Box<Lease>),
    /// Surface a lease event upward.
    Notify(LeaseEvent),
    /// Persist the lease for the Confirm path of the next restart.
    StoreCache(Box<CachedLease>),
    /// Drop the persisted lease.
    ClearCache,
}

impl Device {
    /// Consume one event at time `now` and return the resulting actions.
    pub fn process_event(&mut self, event: Event, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        match event {
            Event::LinkUp => {
                self.link_ready = true;
                if self.enabled && matches!(self.state, State::Init) {
                    self.begin(now, &mut actions);
                }
            }
            Event::LinkDown => {
                debug!(ifname = %self.config.ifname, "Link down, keeping lease as cache");
                self.link_ready = false;
                self.quiesce();
            }
            Event::Start(mode) => {
                self.config.mode = mode;
                self.enabled = true;
                if self.link_ready && matches!(self.state, State::Init) {
                    self.begin(now, &mut actions);
                }
            }
            Event::Stop => {
                self.enabled = false;
                self.quiesce();
            }
            Event::TimerFired => self.handle_timer(now, &mut actions),
            Event::Rx { msg, src } => self.handle_message(msg, src, now, &mut actions),
            Event::UserRenew => self.handle_user_renew(now, &mut actions),
            Event::UserRelease => self.handle_user_release(now, &mut actions),
            Event::LeaseApplied(outcome) => self.handle_apply_result(outcome, now, &mut actions),
        }
        actions
    }

    /// Kick a freshly started (or re-linked) device out of INIT.
    fn begin(&mut self, now: Instant, actions: &mut Vec<Action>) {
        match self.config.mode {
            Mode::InfoOnly => self.enter_info_request(now, actions),
            Mode::Managed => {
                let cache_usable = self
                    .cached_lease
                    .as_ref()
                    .map(|lease| !lease.is_expired(now))
                    .unwrap_or(false);
                if cache_usable {
                    self.enter_reboot(now, actions);
                } else {
                    self.cached_lease = None;
                    self.enter_selecting(now, actions);
                }
            }
        }
    }

    /// Drop back to INIT, cancelling the timer and keeping the current
    /// lease around as the Confirm cache.
    fn quiesce(&mut self) {
        if let Some(mut lease) = self.lease.take() {
            lease.state = LeaseState::Granted;
            self.cached_lease = Some(lease);
        }
        self.state = State::Init;
        self.deadline = None;
        self.banned_servers.clear();
    }

    // -----------------------------------------------------------------
    // Timer handling
    // -----------------------------------------------------------------

    fn handle_timer(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let state = std::mem::replace(&mut self.state, State::Init);
        match state {
            State::Selecting { mut tx, mut offers } => {
                if let Some(offer) = offers.take_best() {
                    info!(
                        ifname = %self.config.ifname,
                        server = %offer.server_id,
                        preference = offer.preference,
                        "Selected DHCPv6 server"
                    );
                    self.enter_requesting(offer, offers, now, actions);
                } else {
                    match tx.on_timeout(now, &mut self.rng) {
                        RetransDecision::Retransmit { deadline } => {
                            let elapsed = tx.elapsed_hundredths(now);
                            actions.push(self.make_transmit(
                                MessageType::Solicit,
                                tx.xid,
                                tx.dest,
                                elapsed,
                                None,
                                Some(Ia::new(self.ia_id)),
                            ));
                            self.stats.retransmissions += 1;
                            self.deadline = Some(deadline);
                            self.state = State::Selecting { tx, offers };
                        }
                        // Solicit has no MRC/MRD; keep waiting for offers.
                        RetransDecision::GiveUp => {
                            self.deadline = Some(tx.deadline());
                            self.state = State::Selecting { tx, offers };
                        }
                    }
                }
            }

            State::Requesting {
                mut tx,
                offer,
                offers,
            } => match tx.on_timeout(now, &mut self.rng) {
                RetransDecision::Retransmit { deadline } => {
                    let elapsed = tx.elapsed_hundredths(now);
                    actions.push(self.make_transmit(
                        MessageType::Request,
                        tx.xid,
                        tx.dest,
                        elapsed,
                        Some(&offer.server_id),
                        Some(offer.ia.clone()),
                    ));
                    self.stats.retransmissions += 1;
                    self.deadline = Some(deadline);
                    self.state = State::Requesting { tx, offer, offers };
                }
                RetransDecision::GiveUp => {
                    warn!(
                        ifname = %self.config.ifname,
                        server = %offer.server_id,
                        "Request timed out, backing off to Solicit"
                    );
                    self.enter_selecting(now, actions);
                }
            },

            State::Reboot { mut tx } => match tx.on_timeout(now, &mut self.rng) {
                RetransDecision::Retransmit { deadline } => {
                    let ia = self.cached_lease.as_ref().map(|lease| lease.to_ia());
                    let elapsed = tx.elapsed_hundredths(now);
                    actions.push(self.make_transmit(
                        MessageType::Confirm,
                        tx.xid,
                        tx.dest,
                        elapsed,
                        None,
                        ia,
                    ));
                    self.stats.retransmissions += 1;
                    self.deadline = Some(deadline);
                    self.state = State::Reboot { tx };
                }
                RetransDecision::GiveUp => {
                    info!(
                        ifname = %self.config.ifname,
                        "No Confirm reply, discarding cached lease"
                    );
                    self.cached_lease = None;
                    actions.push(Action::ClearCache);
                    self.enter_selecting(now, actions);
                }
            },

            State::Bound => match self.config.mode {
                Mode::InfoOnly => self.enter_info_request(now, actions),
                Mode::Managed => self.enter_renewing(now, actions),
            },

            State::Renewing { mut tx } => match tx.on_timeout(now, &mut self.rng) {
                RetransDecision::Retransmit { deadline } => {
                    self.resend_for_lease(MessageType::Renew, &tx, now, actions);
                    self.deadline = Some(deadline);
                    self.state = State::Renewing { tx };
                }
                RetransDecision::GiveUp => {
                    info!(ifname = %self.config.ifname, "Renew window exhausted, rebinding");
                    self.enter_rebinding(now, actions);
                }
            },

            State::RenewRequested { mut tx } => match tx.on_timeout(now, &mut self.rng) {
                RetransDecision::Retransmit { deadline } => {
                    self.resend_for_lease(MessageType::Renew, &tx, now, actions);
                    self.deadline = Some(deadline);
                    self.state = State::RenewRequested { tx };
                }
                RetransDecision::GiveUp => {
                    // Early renew failed; fall back to wherever the lease
                    // timers say we should be.
                    let t1_passed = self
                        .lease
                        .as_ref()
                        .and_then(|lease| lease.t1_deadline())
                        .map(|at| now >= at)
                        .unwrap_or(false);
                    let t2_passed = self
                        .lease
                        .as_ref()
                        .and_then(|lease| lease.t2_deadline())
                        .map(|at| now >= at)
                        .unwrap_or(false);
                    if t2_passed {
                        self.enter_rebinding(now, actions);
                    } else if t1_passed {
                        self.enter_renewing(now, actions);
                    } else {
                        self.deadline = self.lease.as_ref().and_then(|lease| lease.t1_deadline());
                        self.state = State::Bound;
                    }
                }
            },

            State::Rebinding { mut tx } => match tx.on_timeout(now, &mut self.rng) {
                RetransDecision::Retransmit { deadline } => {
                    self.resend_for_lease(MessageType::Rebind, &tx, now, actions);
                    self.deadline = Some(deadline);
                    self.state = State::Rebinding { tx };
                }
                RetransDecision::GiveUp => {
                    warn!(ifname = %self.config.ifname, "Lease expired while rebinding");
                    self.lease_lost("timeout", now, actions);
                }
            },

            State::Released {
                tx: Some(mut tx),
                lease,
            } => match tx.on_timeout(now, &mut self.rng) {
                RetransDecision::Retransmit { deadline } => {
                    if let Some(lease) = &lease {
                        let elapsed = tx.elapsed_hundredths(now);
                        let server_id = lease.server_id.clone();
                        actions.push(self.make_transmit(
                            MessageType::Release,
                            tx.xid,
                            tx.dest,
                            elapsed,
                            Some(&server_id),
                            Some(lease.to_ia()),
                        ));
                        self.stats.retransmissions += 1;
                    }
                    self.deadline = Some(deadline);
                    self.state = State::Released {
                        tx: Some(tx),
                        lease,
                    };
                }
                RetransDecision::GiveUp => self.complete_release(actions),
            },

            State::RequestingInfo { mut tx } => match tx.on_timeout(now, &mut self.rng) {
                RetransDecision::Retransmit { deadline } => {
                    let elapsed = tx.elapsed_hundredths(now);
                    actions.push(self.make_transmit(
                        MessageType::InformationRequest,
                        tx.xid,
                        tx.dest,
                        elapsed,
                        None,
                        None,
                    ));
                    self.stats.retransmissions += 1;
                    self.deadline = Some(deadline);
                    self.state = State::RequestingInfo { tx };
                }
                RetransDecision::GiveUp => {
                    self.deadline = Some(tx.deadline());
                    self.state = State::RequestingInfo { tx };
                }
            },

            // Stale timer in a state without one.
            other => self.state = other,
        }
    }

    // -----------------------------------------------------------------
    // Inbound messages
    // -----------------------------------------------------------------

    fn handle_message(
        &mut self,
        msg: ParsedMessage,
        src: Ipv6Addr,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let state = std::mem::replace(&mut self.state, State::Init);
        match state {
            State::Selecting { mut tx, mut offers } => {
                match msg.msg_type {
                    MessageType::Advertise => {
                        if let Some(mrt) = valid_max_rt(msg.sol_max_rt) {
                            self.sol_max_rt = Some(mrt);
                            tx.set_max_rt(mrt);
                        }
                        if let Some(server_id) = &msg.server_id {
                            if self.is_banned(server_id) {
                                debug!(
                                    ifname = %self.config.ifname,
                                    server = %server_id,
                                    "Ignoring Advertise from excluded server"
                                );
                                self.state = State::Selecting { tx, offers };
                                return;
                            }
                        }
                        match Offer::from_advertise(&msg, self.ia_id, src, now) {
                            Some(offer) if offer.preference == PREFERENCE_MAX => {
                                self.stats.advertises_received += 1;
                                info!(
                                    ifname = %self.config.ifname,
                                    server = %offer.server_id,
                                    "Server advertised with maximum preference"
                                );
                                self.enter_requesting(offer, offers, now, actions);
                            }
                            Some(offer) => {
                                self.stats.advertises_received += 1;
                                offers.insert(offer);
                                self.state = State::Selecting { tx, offers };
                            }
                            None => {
                                debug!(
                                    ifname = %self.config.ifname,
                                    "Ignoring Advertise without usable IA_NA"
                                );
                                self.state = State::Selecting { tx, offers };
                            }
                        }
                    }
                    MessageType::Reply
                        if self.config.rapid_commit
                            && msg.rapid_commit
                            && self.config.mode == Mode::Managed =>
                    {
                        let banned = msg
                            .server_id
                            .as_ref()
                            .map(|id| self.is_banned(id))
                            .unwrap_or(false);
                        if banned {
                            self.state = State::Selecting { tx, offers };
                            return;
                        }
                        match Lease::from_reply(&msg, self.ia_id, src, now) {
                            Ok(lease) => {
                                self.stats.replies_received += 1;
                                info!(
                                    ifname = %self.config.ifname,
                                    server = %lease.server_id,
                                    "Rapid-commit Reply in SELECTING"
                                );
                                self.enter_validating(lease, actions);
                            }
                            Err(e) => {
                                debug!(ifname = %self.config.ifname, error = %e, "Ignoring Reply");
                                self.state = State::Selecting { tx, offers };
                            }
                        }
                    }
                    _ => self.state = State::Selecting { tx, offers },
                }
            }

            State::Requesting {
                mut tx,
                offer,
                mut offers,
            } => {
                if msg.msg_type != MessageType::Reply {
                    self.state = State::Requesting { tx, offer, offers };
                    return;
                }
                self.stats.replies_received += 1;
                match msg.effective_status() {
                    StatusCode::Success => match Lease::from_reply(&msg, self.ia_id, src, now) {
                        Ok(lease) => self.enter_validating(lease, actions),
                        Err(e) => {
                            debug!(ifname = %self.config.ifname, error = %e, "Ignoring Reply");
                            self.state = State::Requesting { tx, offer, offers };
                        }
                    },
                    StatusCode::NotOnLink => {
                        warn!(
                            ifname = %self.config.ifname,
                            server = %offer.server_id,
                            "Server reports requested addresses not on-link"
                        );
                        self.enter_selecting(now, actions);
                    }
                    StatusCode::NoAddrsAvail => {
                        warn!(
                            ifname = %self.config.ifname,
                            server = %offer.server_id,
                            "Server has no addresses available"
                        );
                        self.ban(offer.server_id.clone());
                        offers.remove(&offer.server_id);
                        if let Some(next) = offers.take_best() {
                            self.enter_requesting(next, offers, now, actions);
                        } else {
                            self.enter_selecting(now, actions);
                        }
                    }
                    StatusCode::UseMulticast => {
                        tx.set_destination(Destination::Multicast);
                        let elapsed = tx.elapsed_hundredths(now);
                        actions.push(self.make_transmit(
                            MessageType::Request,
                            tx.xid,
                            Destination::Multicast,
                            elapsed,
                            Some(&offer.server_id),
                            Some(offer.ia.clone()),
                        ));
                        self.stats.retransmissions += 1;
                        self.state = State::Requesting { tx, offer, offers };
                    }
                    status => {
                        debug!(
                            ifname = %self.config.ifname,
                            status = %status,
                            "Ignoring Reply status in REQUESTING"
                        );
                        self.state = State::Requesting { tx, offer, offers };
                    }
                }
            }

            State::Reboot { tx } => {
                if msg.msg_type != MessageType::Reply {
                    self.state = State::Reboot { tx };
                    return;
                }
                self.stats.replies_received += 1;
                match msg.effective_status() {
                    StatusCode::Success => {
                        if let Some(cached) = self.cached_lease.take() {
                            info!(
                                ifname = %self.config.ifname,
                                "Server confirmed cached lease"
                            );
                            self.enter_validating(cached, actions);
                        } else {
                            self.enter_selecting(now, actions);
                        }
                    }
                    StatusCode::NotOnLink | StatusCode::NoBinding => {
                        info!(
                            ifname = %self.config.ifname,
                            "Cached lease rejected, starting over"
                        );
                        self.cached_lease = None;
                        actions.push(Action::ClearCache);
                        self.enter_selecting(now, actions);
                    }
                    _ => self.state = State::Reboot { tx },
                }
            }

            State::Renewing { tx } => {
                self.handle_maintain_reply(msg, src, now, actions, tx, MessageType::Renew, false)
            }
            State::RenewRequested { tx } => {
                self.handle_maintain_reply(msg, src, now, actions, tx, MessageType::Renew, true)
            }
            State::Rebinding { tx } => {
                self.handle_maintain_reply(msg, src, now, actions, tx, MessageType::Rebind, false)
            }

            State::Released {
                tx: Some(tx),
                lease,
            } => {
                if msg.msg_type == MessageType::Reply {
                    self.stats.replies_received += 1;
                    self.complete_release(actions);
                } else {
                    self.state = State::Released {
                        tx: Some(tx),
                        lease,
                    };
                }
            }

            State::RequestingInfo { mut tx } => {
                if msg.msg_type != MessageType::Reply {
                    self.state = State::RequestingInfo { tx };
                    return;
                }
                if let Some(mrt) = valid_max_rt(msg.inf_max_rt) {
                    self.inf_max_rt = Some(mrt);
                    tx.set_max_rt(mrt);
                }
                self.stats.replies_received += 1;
                match Lease::from_info_reply(&msg, src, now) {
                    Ok(lease) => self.enter_validating(lease, actions),
                    Err(e) => {
                        debug!(ifname = %self.config.ifname, error = %e, "Ignoring Reply");
                        self.state = State::RequestingInfo { tx };
                    }
                }
            }

            other => {
                debug!(
                    ifname = %self.config.ifname,
                    msg_type = %msg.msg_type,
                    "Discarding message in non-transactional state"
                );
                self.state = other;
            }
        }
    }

    /// Shared Reply handling for RENEWING / RENEW-REQUESTED / REBINDING.
    #[allow(clippy::too_many_arguments)]
    fn handle_maintain_reply(
        &mut self,
        msg: ParsedMessage,
        src: Ipv6Addr,
        now: Instant,
        actions: &mut Vec<Action>,
        mut tx: Transaction,
        kind: MessageType,
        early_renew: bool,
    ) {
        let restore = |dev: &mut Device, tx: Transaction| {
            dev.state = match (kind, early_renew) {
                (MessageType::Renew, true) => State::RenewRequested { tx },
                (MessageType::Renew, false) => State::Renewing { tx },
                _ => State::Rebinding { tx },
            };
        };

        if msg.msg_type != MessageType::Reply {
            restore(self, tx);
            return;
        }
        self.stats.replies_received += 1;

        match msg.effective_status() {
            StatusCode::Success => match Lease::from_reply(&msg, self.ia_id, src, now) {
                Ok(lease) => {
                    info!(
                        ifname = %self.config.ifname,
                        server = %lease.server_id,
                        "Lease extended"
                    );
                    self.enter_validating(lease, actions);
                }
                Err(e) => {
                    debug!(ifname = %self.config.ifname, error = %e, "Ignoring Reply");
                    restore(self, tx);
                }
            },
            StatusCode::NoBinding => {
                // RFC 3315 section 18.1.8: the server lost our binding;
                // ask for the lease again with a Request.
                info!(ifname = %self.config.ifname, "Server has no binding, re-requesting");
                self.enter_requesting_current_lease(now, actions);
            }
            StatusCode::NotOnLink => {
                warn!(
                    ifname = %self.config.ifname,
                    "Lease addresses reported off-link, restarting"
                );
                if let Some(lease) = self.lease.take() {
                    actions.push(Action::Withdraw(Box::new(lease)));
                }
                actions.push(Action::ClearCache);
                actions.push(Action::Notify(LeaseEvent::Lost("not-on-link".into())));
                self.stats.leases_lost += 1;
                self.cached_lease = None;
                self.enter_selecting(now, actions);
            }
            StatusCode::UseMulticast => {
                tx.set_destination(Destination::Multicast);
                self.resend_for_lease(kind, &tx, now, actions);
                restore(self, tx);
            }
            status => {
                debug!(
                    ifname = %self.config.ifname,
                    status = %status,
                    "Ignoring Reply status while maintaining lease"
                );
                restore(self, tx);
            }
        }
    }

    // -----------------------------------------------------------------
    // User requests and applier results
    // -----------------------------------------------------------------

    fn handle_user_renew(&mut self, now: Instant, actions: &mut Vec<Action>) {
        if !matches!(self.state, State::Bound) || self.config.mode != Mode::Managed {
            debug!(
                ifname = %self.config.ifname,
                state = self.state_name(),
                "Ignoring renew request"
            );
            return;
        }
        self.enter_renew_requested(now, actions);
    }

    fn handle_user_release(&mut self, now: Instant, actions: &mut Vec<Action>) {
        match self.state {
            State::Bound
            | State::Renewing { .. }
            | State::RenewRequested { .. }
            | State::Rebinding { .. } => self.enter_released(now, actions),
            // Idempotent: a second release request is a no-op.
            State::Released { .. } => {}
            _ => {
                debug!(
                    ifname = %self.config.ifname,
                    state = self.state_name(),
                    "Ignoring release request without a lease"
                );
            }
        }
    }

    fn handle_apply_result(
        &mut self,
        outcome: ApplyOutcome,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let state = std::mem::replace(&mut self.state, State::Init);
        let lease = match state {
            State::Validating { lease } => lease,
            other => {
                debug!(ifname = %self.config.ifname, "Late applier result, ignoring");
                self.state = other;
                return;
            }
        };

        match outcome {
            ApplyOutcome::Ok => {
                let mut lease = *lease;
                lease.state = LeaseState::Applied;
                self.stats.leases_acquired += 1;
                info!(
                    ifname = %self.config.ifname,
                    server = %lease.server_id,
                    addrs = lease.addrs.len(),
                    t1 = lease.t1,
                    t2 = lease.t2,
                    "Lease bound"
                );

                self.deadline = match self.config.mode {
                    Mode::InfoOnly => Some(now + lease.info_refresh_interval()),
                    Mode::Managed => lease.t1_deadline(),
                };
                if self.config.mode == Mode::Managed {
                    actions.push(Action::StoreCache(Box::new(lease.to_cached(now))));
                }
                actions.push(Action::Notify(LeaseEvent::Acquired(Box::new(lease.clone()))));
                self.banned_servers.clear();
                self.lease = Some(lease);
                self.state = State::Bound;
            }

            ApplyOutcome::DadConflict(conflicting) => {
                let lease = *lease;
                warn!(
                    ifname = %self.config.ifname,
                    server = %lease.server_id,
                    conflicts = conflicting.len(),
                    "Duplicate address detection failed, declining lease"
                );
                actions.push(Action::Withdraw(Box::new(lease.clone())));
                actions.push(Action::ClearCache);

                // Decline the conflicting addresses under a fresh
                // transaction id, then go looking for another server.
                let xid = new_xid(&mut self.rng);
                let decline_ia = Ia {
                    ia_id: lease.ia_id,
                    t1: 0,
                    t2: 0,
                    addrs: lease
                        .to_ia()
                        .addrs
                        .into_iter()
                        .filter(|a| conflicting.contains(&a.addr))
                        .collect(),
                    status: None,
                };
                let server_id = lease.server_id.clone();
                actions.push(self.make_transmit(
                    MessageType::Decline,
                    xid,
                    Destination::Multicast,
                    0,
                    Some(&server_id),
                    Some(decline_ia),
                ));
                self.stats.messages_sent += 1;

                self.ban(lease.server_id);
                self.lease = None;
                self.cached_lease = None;
                self.enter_selecting(now, actions);
            }

            ApplyOutcome::Failed(reason) => {
                warn!(
                    ifname = %self.config.ifname,
                    reason = %reason,
                    "Lease could not be applied"
                );
                actions.push(Action::Notify(LeaseEvent::Lost(format!(
                    "apply-failed: {}",
                    reason
                ))));
                self.stats.leases_lost += 1;
                self.lease = None;
                self.deadline = None;
                self.state = State::Init;
            }
        }
    }

    // -----------------------------------------------------------------
    // State entry helpers
    // -----------------------------------------------------------------

    fn enter_selecting(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let Some(mut params) = RetransParams::for_message(MessageType::Solicit) else {
            return;
        };
        if let Some(mrt) = self.sol_max_rt {
            params.mrt = mrt;
        }
        let tx = Transaction::new(
            MessageType::Solicit,
            Destination::Multicast,
            params,
            now,
            &mut self.rng,
        );
        info!(
            ifname = %self.config.ifname,
            xid = tx.xid,
            "Soliciting DHCPv6 servers"
        );
        actions.push(self.make_transmit(
            MessageType::Solicit,
            tx.xid,
            tx.dest,
            0,
            None,
            Some(Ia::new(self.ia_id)),
        ));
        self.stats.messages_sent += 1;
        self.deadline = Some(tx.deadline());
        self.state = State::Selecting {
            tx,
            offers: SelectionBuffer::new(),
        };
    }

    fn enter_requesting(
        &mut self,
        offer: Offer,
        offers: SelectionBuffer,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let Some(params) = RetransParams::for_message(MessageType::Request) else {
            return;
        };
        let tx = Transaction::new(
            MessageType::Request,
            Destination::Multicast,
            params,
            now,
            &mut self.rng,
        );
        debug!(
            ifname = %self.config.ifname,
            xid = tx.xid,
            server = %offer.server_id,
            "Requesting lease"
        );
        actions.push(self.make_transmit(
            MessageType::Request,
            tx.xid,
            tx.dest,
            0,
            Some(&offer.server_id),
            Some(offer.ia.clone()),
        ));
        self.stats.messages_sent += 1;
        self.deadline = Some(tx.deadline());
        self.state = State::Requesting { tx, offer, offers };
    }

    /// Re-request the addresses of the current lease after the server
    /// reported NoBinding during Renew/Rebind.
    fn enter_requesting_current_lease(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let offer = match self.lease.as_ref() {
            Some(lease) => Offer {
                server_id: lease.server_id.clone(),
                preference: lease.preference,
                ia: lease.to_ia(),
                src: lease.server_addr,
                received_at: now,
            },
            None => {
                self.enter_selecting(now, actions);
                return;
            }
        };
        self.enter_requesting(offer, SelectionBuffer::new(), now, actions);
    }

    fn enter_reboot(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let Some(params) = RetransParams::for_message(MessageType::Confirm) else {
            return;
        };
        let ia = match self.cached_lease.as_ref() {
            Some(lease) => lease.to_ia(),
            None => {
                self.enter_selecting(now, actions);
                return;
            }
        };
        let tx = Transaction::new(
            MessageType::Confirm,
            Destination::Multicast,
            params,
            now,
            &mut self.rng,
        );
        info!(
            ifname = %self.config.ifname,
            xid = tx.xid,
            "Confirming cached lease"
        );
        actions.push(self.make_transmit(MessageType::Confirm, tx.xid, tx.dest, 0, None, Some(ia)));
        self.stats.messages_sent += 1;
        self.deadline = Some(tx.deadline());
        self.state = State::Reboot { tx };
    }

    fn enter_renewing(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let lease_info = self
            .lease
            .as_ref()
            .map(|lease| (lease.renew_window(), lease.server_addr));
        let Some((window, server_addr)) = lease_info else {
            self.enter_selecting(now, actions);
            return;
        };
        if window.is_zero() {
            // T1 == T2: skip straight to rebinding.
            self.enter_rebinding(now, actions);
            return;
        }
        let Some(params) = RetransParams::for_message(MessageType::Renew) else {
            return;
        };
        let params = params.with_mrd(window);
        let dest = Destination::Unicast(server_addr);
        let tx = Transaction::new(MessageType::Renew, dest, params, now, &mut self.rng);
        info!(ifname = %self.config.ifname, xid = tx.xid, "Renewing lease");
        self.deadline = Some(tx.deadline());
        self.send_for_lease(MessageType::Renew, &tx, actions);
        self.state = State::Renewing { tx };
    }

    fn enter_renew_requested(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let (window, dest) = match self.lease.as_ref() {
            Some(lease) => {
                let window = lease
                    .t2_deadline()
                    .map(|at| at.saturating_duration_since(now))
                    .unwrap_or(Duration::ZERO);
                (window, Destination::Unicast(lease.server_addr))
            }
            None => return,
        };
        let Some(params) = RetransParams::for_message(MessageType::Renew) else {
            return;
        };
        let tx = Transaction::new(
            MessageType::Renew,
            dest,
            params.with_mrd(window),
            now,
            &mut self.rng,
        );
        info!(ifname = %self.config.ifname, xid = tx.xid, "Renewing lease on user request");
        self.deadline = Some(tx.deadline());
        self.send_for_lease(MessageType::Renew, &tx, actions);
        self.state = State::RenewRequested { tx };
    }

    fn enter_rebinding(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let window = match self.lease.as_ref() {
            Some(lease) => lease.rebind_window(now),
            None => {
                self.enter_selecting(now, actions);
                return;
            }
        };
        if window.is_zero() {
            self.lease_lost("expired", now, actions);
            return;
        }
        let Some(params) = RetransParams::for_message(MessageType::Rebind) else {
            return;
        };
        let tx = Transaction::new(
            MessageType::Rebind,
            Destination::Multicast,
            params.with_mrd(window),
            now,
            &mut self.rng,
        );
        info!(ifname = %self.config.ifname, xid = tx.xid, "Rebinding lease");
        self.deadline = Some(tx.deadline());
        self.send_for_lease(MessageType::Rebind, &tx, actions);
        self.state = State::Rebinding { tx };
    }

    fn enter_info_request(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let Some(mut params) = RetransParams::for_message(MessageType::InformationRequest) else {
            return;
        };
        if let Some(mrt) = self.inf_max_rt {
            params.mrt = mrt;
        }
        let tx = Transaction::new(
            MessageType::InformationRequest,
            Destination::Multicast,
            params,
            now,
            &mut self.rng,
        );
        info!(
            ifname = %self.config.ifname,
            xid = tx.xid,
            "Requesting stateless configuration"
        );
        actions.push(self.make_transmit(
            MessageType::InformationRequest,
            tx.xid,
            tx.dest,
            0,
            None,
            None,
        ));
        self.stats.messages_sent += 1;
        self.deadline = Some(tx.deadline());
        self.state = State::RequestingInfo { tx };
    }

    fn enter_validating(&mut self, lease: Lease, actions: &mut Vec<Action>) {
        let removed = self
            .lease
            .as_ref()
            .map(|old| old.removed_addrs(&lease))
            .unwrap_or_default();
        debug!(
            ifname = %self.config.ifname,
            addrs = lease.addrs.len(),
            removed = removed.len(),
            "Validating lease"
        );
        self.deadline = None;
        actions.push(Action::Apply {
            lease: Box::new(lease.clone()),
            removed,
        });
        self.state = State::Validating {
            lease: Box::new(lease),
        };
    }

    fn enter_released(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let Some(mut lease) = self.lease.take() else {
            self.state = State::Released {
                tx: None,
                lease: None,
            };
            self.deadline = None;
            return;
        };
        lease.state = LeaseState::Released;
        info!(
            ifname = %self.config.ifname,
            server = %lease.server_id,
            "Releasing lease"
        );
        actions.push(Action::Withdraw(Box::new(lease.clone())));
        actions.push(Action::ClearCache);
        self.cached_lease = None;

        let Some(params) = RetransParams::for_message(MessageType::Release) else {
            return;
        };
        let dest = Destination::Unicast(lease.server_addr);
        let tx = Transaction::new(MessageType::Release, dest, params, now, &mut self.rng);
        let server_id = lease.server_id.clone();
        actions.push(self.make_transmit(
            MessageType::Release,
            tx.xid,
            dest,
            0,
            Some(&server_id),
            Some(lease.to_ia()),
        ));
        self.stats.messages_sent += 1;
        self.deadline = Some(tx.deadline());
        self.state = State::Released {
            tx: Some(tx),
            lease: Some(Box::new(lease)),
        };
    }

    fn complete_release(&mut self, actions: &mut Vec<Action>) {
        info!(ifname = %self.config.ifname, "Release complete");
        actions.push(Action::Notify(LeaseEvent::Released));
        self.deadline = None;
        self.state = State::Released {
            tx: None,
            lease: None,
        };
    }

    /// The lease is gone: withdraw it, tell the supervisor, start over.
    fn lease_lost(&mut self, reason: &str, now: Instant, actions: &mut Vec<Action>) {
        if let Some(lease) = self.lease.take() {
            actions.push(Action::Withdraw(Box::new(lease)));
        }
        actions.push(Action::ClearCache);
        actions.push(Action::Notify(LeaseEvent::Lost(reason.to_string())));
        self.stats.leases_lost += 1;
        self.cached_lease = None;
        if self.enabled && self.link_ready {
            self.enter_selecting(now, actions);
        } else {
            self.deadline = None;
            self.state = State::Init;
        }
    }

    // -----------------------------------------------------------------
    // Transmission helpers
    // -----------------------------------------------------------------

    /// First transmission of a Renew/Rebind for the current lease.
    fn send_for_lease(&mut self, kind: MessageType, tx: &Transaction, actions: &mut Vec<Action>) {
        let Some((server_id, ia)) = self
            .lease
            .as_ref()
            .map(|lease| (lease.server_id.clone(), lease.to_ia()))
        else {
            return;
        };
        let server_id = (kind == MessageType::Renew).then_some(&server_id);
        actions.push(self.make_transmit(kind, tx.xid, tx.dest, 0, server_id, Some(ia)));
        self.stats.messages_sent += 1;
    }

    /// Retransmission of a Renew/Rebind for the current lease.
    fn resend_for_lease(
        &mut self,
        kind: MessageType,
        tx: &Transaction,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let Some((server_id, ia)) = self
            .lease
            .as_ref()
            .map(|lease| (lease.server_id.clone(), lease.to_ia()))
        else {
            return;
        };
        let elapsed = tx.elapsed_hundredths(now);
        let server_id = (kind == MessageType::Renew).then_some(&server_id);
        actions.push(self.make_transmit(kind, tx.xid, tx.dest, elapsed, server_id, Some(ia)));
        self.stats.retransmissions += 1;
    }

    /// Build the Transmit action for an outbound client message.
    fn make_transmit(
        &self,
        kind: MessageType,
        xid: u32,
        dest: Destination,
        elapsed: u16,
        server_id: Option<&Duid>,
        ia: Option<Ia>,
    ) -> Action {
        let oro = self.build_oro(kind);
        let fqdn = matches!(
            kind,
            MessageType::Solicit | MessageType::Request | MessageType::Renew | MessageType::Rebind
        )
        .then(|| self.config.hostname.as_deref())
        .flatten();

        let payload = message::encode(&ClientMessage {
            kind,
            xid,
            elapsed,
            client_id: &self.duid,
            server_id,
            ia,
            oro: &oro,
            rapid_commit: self.config.rapid_commit,
            user_class: &self.config.user_class,
            vendor_class: &self.config.vendor_class,
            fqdn,
        });
        Action::Transmit { dest, payload }
    }

    /// The Option Request option for this message kind.
    fn build_oro(&self, kind: MessageType) -> Vec<u16> {
        if matches!(
            kind,
            MessageType::Release | MessageType::Decline | MessageType::Confirm
        ) {
            return Vec::new();
        }
        let mut oro: Vec<u16> = Vec::new();
        for option in &self.config.request_options {
            if !oro.contains(&option.code()) {
                oro.push(option.code());
            }
        }
        match kind {
            MessageType::Solicit => oro.push(OPT_SOL_MAX_RT),
            MessageType::InformationRequest => {
                oro.push(OPT_INF_MAX_RT);
                oro.push(OPT_INFO_REFRESH_TIME);
            }
            _ => {}
        }
        oro
    }

    fn is_banned(&self, server_id: &Duid) -> bool {
        self.banned_servers.contains(server_id)
    }

    fn ban(&mut self, server_id: Duid) {
        if !self.banned_servers.contains(&server_id) {
            self.banned_servers.push(server_id);
        }
    }
}

/// Validate a server-supplied SOL_MAX_RT/INF_MAX_RT (RFC 7083 bounds).
fn valid_max_rt(value: Option<u32>) -> Option<Duration> {
    let value = value?;
    (MAX_RT_MIN_SECS..=MAX_RT_MAX_SECS)
        .contains(&value)
        .then(|| Duration::from_secs(u64::from(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::types::{OPT_DNS_SERVERS, OPT_DOMAIN_LIST};

    fn device() -> Device {
        let duid = Duid::from_bytes(&[0x00, 0x03, 0x00, 0x01, 0xaa, 0xbb]).unwrap();
        Device::with_seed(2, DeviceConfig::default(), duid, 7)
    }

    #[test]
    fn test_oro_contents() {
        let dev = device();
        let oro = dev.build_oro(MessageType::Solicit);
        assert!(oro.contains(&OPT_DNS_SERVERS));
        assert!(oro.contains(&OPT_DOMAIN_LIST));
        assert!(oro.contains(&OPT_SOL_MAX_RT));

        let oro = dev.build_oro(MessageType::InformationRequest);
        assert!(oro.contains(&OPT_INF_MAX_RT));
        assert!(oro.contains(&OPT_INFO_REFRESH_TIME));

        assert!(dev.build_oro(MessageType::Release).is_empty());
        assert!(dev.build_oro(MessageType::Decline).is_empty());
    }

    #[test]
    fn test_max_rt_bounds() {
        assert!(valid_max_rt(None).is_none());
        assert!(valid_max_rt(Some(59)).is_none());
        assert!(valid_max_rt(Some(86_401)).is_none());
        assert_eq!(valid_max_rt(Some(60)), Some(Duration::from_secs(60)));
        assert_eq!(valid_max_rt(Some(7200)), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_start_without_link_stays_init() {
        let mut dev = device();
        let actions = dev.process_event(Event::Start(Mode::Managed), Instant::now());
        assert!(actions.is_empty());
        assert_eq!(dev.state_name(), "INIT");
    }

    #[test]
    fn test_link_up_then_start_solicits() {
        let mut dev = device();
        let now = Instant::now();
        dev.process_event(Event::LinkUp, now);
        let actions = dev.process_event(Event::Start(Mode::Managed), now);
        assert_eq!(dev.state_name(), "SELECTING");
        assert!(dev.current_xid().is_some());
        assert!(matches!(
            actions.as_slice(),
            [Action::Transmit {
                dest: Destination::Multicast,
                ..
            }]
        ));
    }
}
