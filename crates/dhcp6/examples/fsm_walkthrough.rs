//! Dry-run walkthrough of the DHCPv6 client state machine.
//!
//! No sockets, no root: synthetic server messages are fed straight into
//! the FSM and every transition is printed.
//!
//! Usage:
//!   cargo run --example fsm_walkthrough

use dhcp6::fsm::{Action, ApplyOutcome, Event};
use dhcp6::message::{Ia, IaAddress, ParsedMessage};
use dhcp6::types::{MessageType, Mode};
use dhcp6::{Device, DeviceConfig, Duid};
use std::time::{Duration, Instant};

fn show(step: &str, dev: &Device, actions: &[Action]) {
    println!("{:<40} -> {:<15} ({} actions)", step, dev.state_name(), actions.len());
    for action in actions {
        match action {
            Action::Transmit { dest, payload } => {
                let kind = dhcp6::message::decode(payload)
                    .map(|m| m.msg_type.name())
                    .unwrap_or("?");
                println!("    transmit {} to {:?} ({} bytes)", kind, dest, payload.len());
            }
            Action::Apply { lease, .. } => {
                println!("    apply lease with {} address(es)", lease.addrs.len());
            }
            Action::Notify(event) => println!("    notify {:?}", event),
            other => println!("    {:?}", other),
        }
    }
}

fn main() {
    let duid = Duid::new_ll(dhcp6::duid::HWTYPE_ETHERNET, &[0x02, 0, 0, 0, 0, 0x01])
        .expect("static hardware address");
    let mut dev = Device::with_seed(2, DeviceConfig::default(), duid.clone(), 1);
    let server = Duid::from_bytes(&[0x00, 0x03, 0x00, 0x01, 0xde, 0xad]).unwrap();
    let src = "fe80::1".parse().unwrap();
    let base = Instant::now();

    println!("{:<40}    {}", "event", "state");
    println!("{}", "-".repeat(70));

    let actions = dev.process_event(Event::LinkUp, base);
    show("link up", &dev, &actions);

    let actions = dev.process_event(Event::Start(Mode::Managed), base);
    show("start (managed)", &dev, &actions);

    // A server advertises one address.
    let mut advertise = ParsedMessage::new(MessageType::Advertise, dev.current_xid().unwrap());
    advertise.client_id = Some(duid.clone());
    advertise.server_id = Some(server.clone());
    let mut ia = Ia::new(dev.ia_id);
    ia.t1 = 1800;
    ia.t2 = 2880;
    ia.addrs.push(IaAddress {
        addr: "2001:db8::1".parse().unwrap(),
        preferred: 3600,
        valid: 7200,
        status: None,
    });
    advertise.ia_na.push(ia.clone());
    let actions = dev.process_event(
        Event::Rx {
            msg: advertise,
            src,
        },
        base + Duration::from_millis(500),
    );
    show("advertise received", &dev, &actions);

    // First retransmission timeout picks the buffered server.
    let actions = dev.process_event(Event::TimerFired, base + Duration::from_secs(1));
    show("first timeout (select server)", &dev, &actions);

    let mut reply = ParsedMessage::new(MessageType::Reply, dev.current_xid().unwrap());
    reply.client_id = Some(duid);
    reply.server_id = Some(server);
    reply.ia_na.push(ia);
    let actions = dev.process_event(
        Event::Rx { msg: reply, src },
        base + Duration::from_millis(1100),
    );
    show("reply received", &dev, &actions);

    let actions = dev.process_event(
        Event::LeaseApplied(ApplyOutcome::Ok),
        base + Duration::from_millis(1200),
    );
    show("lease applied", &dev, &actions);

    let lease = dev.lease().expect("bound");
    println!();
    println!(
        "bound: {} (T1={}s T2={}s), renew timer armed: {}",
        lease.addrs[0].addr,
        lease.t1,
        lease.t2,
        dev.deadline().is_some()
    );
}
