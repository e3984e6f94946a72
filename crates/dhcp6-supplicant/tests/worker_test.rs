//! Worker loop integration test against a scripted server on loopback.

use dhcp6::fsm::LeaseEvent;
use dhcp6::message::{decode, ParsedMessage};
use dhcp6::types::MessageType;
use dhcp6::{Device, DeviceConfig, Duid};
use dhcp6_supplicant::applier::{LeaseCache, NullApplier};
use dhcp6_supplicant::link::Link;
use dhcp6_supplicant::worker::{Command, DeviceWorker, LeaseNotification};
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn client_duid() -> Duid {
    Duid::from_bytes(&[0x00, 0x01, 0x00, 0x01, 0x10, 0x20, 0x30, 0x40]).unwrap()
}

fn server_duid() -> Duid {
    Duid::from_bytes(&[0x00, 0x03, 0x00, 0x01, 0x50, 0x60]).unwrap()
}

fn push_opt(buf: &mut Vec<u8>, code: u16, body: &[u8]) {
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
    buf.extend_from_slice(body);
}

/// Build an Advertise or Reply answering `req`, echoing its IA_NA.
fn answer_bytes(msg_type: MessageType, req: &ParsedMessage, with_ia: bool) -> Vec<u8> {
    let xid = req.xid;
    let mut buf = vec![msg_type as u8, (xid >> 16) as u8, (xid >> 8) as u8, xid as u8];
    push_opt(&mut buf, 1, req.client_id.as_ref().unwrap().as_bytes());
    push_opt(&mut buf, 2, server_duid().as_bytes());
    if msg_type == MessageType::Advertise {
        push_opt(&mut buf, 7, &[255]); // preference: use me now
    }
    if with_ia {
        let ia_id = req.ia_na.first().map(|ia| ia.ia_id).unwrap_or(1);
        let mut ia = Vec::new();
        ia.extend_from_slice(&ia_id.to_be_bytes());
        ia.extend_from_slice(&50u32.to_be_bytes()); // T1
        ia.extend_from_slice(&80u32.to_be_bytes()); // T2
        let mut iaaddr = Vec::new();
        iaaddr.extend_from_slice(&"2001:db8::10".parse::<Ipv6Addr>().unwrap().octets());
        iaaddr.extend_from_slice(&3600u32.to_be_bytes());
        iaaddr.extend_from_slice(&7200u32.to_be_bytes());
        push_opt(&mut ia, 5, &iaaddr);
        push_opt(&mut buf, 3, &ia);
    }
    buf
}

async fn recv_decoded(server: &UdpSocket) -> (ParsedMessage, SocketAddr) {
    let mut buf = [0u8; 1500];
    let (len, peer) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
        .await
        .expect("timed out waiting for client message")
        .expect("server socket failed");
    (decode(&buf[..len]).expect("client sent undecodable bytes"), peer)
}

async fn expect_event(
    notify_rx: &mut mpsc::Receiver<LeaseNotification>,
) -> LeaseEvent {
    timeout(Duration::from_secs(5), notify_rx.recv())
        .await
        .expect("timed out waiting for lease event")
        .expect("worker gone")
        .event
}

#[tokio::test]
async fn worker_acquires_and_releases_a_lease() {
    let server = UdpSocket::bind("[::1]:0").await.unwrap();
    let server_addr = match server.local_addr().unwrap() {
        SocketAddr::V6(v6) => v6,
        _ => unreachable!(),
    };

    let client_socket = UdpSocket::bind("[::1]:0").await.unwrap();
    let link = Link::from_socket(client_socket, 1, "test0", server_addr);

    let config = DeviceConfig {
        ifname: "test0".to_string(),
        ..Default::default()
    };
    let device = Device::with_seed(1, config, client_duid(), 3);

    let cache_dir = std::env::temp_dir().join(format!("worker-test-{}", std::process::id()));
    let cache = LeaseCache::new(&cache_dir);
    let (notify_tx, mut notify_rx) = mpsc::channel(16);
    let (cmd_tx, cmd_rx) = mpsc::channel(4);

    let worker = DeviceWorker::new(device, link, Arc::new(NullApplier), cache, notify_tx, cmd_rx);
    let worker_task = tokio::spawn(worker.run());

    // Client starts with a multicast Solicit.
    let (solicit, client_addr) = recv_decoded(&server).await;
    assert_eq!(solicit.msg_type, MessageType::Solicit);
    assert_eq!(solicit.client_id, Some(client_duid()));

    // Preference 255 makes the client request immediately.
    let advertise = answer_bytes(MessageType::Advertise, &solicit, true);
    server.send_to(&advertise, client_addr).await.unwrap();

    let (request, _) = recv_decoded(&server).await;
    assert_eq!(request.msg_type, MessageType::Request);
    assert_eq!(request.server_id, Some(server_duid()));

    let reply = answer_bytes(MessageType::Reply, &request, true);
    server.send_to(&reply, client_addr).await.unwrap();

    // Null applier accepts; the lease event surfaces upward.
    match expect_event(&mut notify_rx).await {
        LeaseEvent::Acquired(lease) => {
            assert_eq!(lease.server_id, server_duid());
            assert_eq!(lease.addrs[0].addr, "2001:db8::10".parse::<Ipv6Addr>().unwrap());
            assert_eq!(lease.t1, 50);
        }
        other => panic!("expected acquisition, got {:?}", other),
    }

    // Operator release: the server sees a unicast Release and answers.
    cmd_tx.send(Command::Release).await.unwrap();
    let (release, _) = recv_decoded(&server).await;
    assert_eq!(release.msg_type, MessageType::Release);
    assert_eq!(release.server_id, Some(server_duid()));
    assert_eq!(release.ia_na[0].addrs.len(), 1);

    let ack = answer_bytes(MessageType::Reply, &release, false);
    server.send_to(&ack, client_addr).await.unwrap();

    match expect_event(&mut notify_rx).await {
        LeaseEvent::Released => {}
        other => panic!("expected release, got {:?}", other),
    }

    cmd_tx.send(Command::Stop).await.unwrap();
    timeout(Duration::from_secs(5), worker_task)
        .await
        .expect("worker did not stop")
        .unwrap();

    let _ = std::fs::remove_dir_all(&cache_dir);
}

#[tokio::test]
async fn worker_renews_on_command() {
    let server = UdpSocket::bind("[::1]:0").await.unwrap();
    let server_addr = match server.local_addr().unwrap() {
        SocketAddr::V6(v6) => v6,
        _ => unreachable!(),
    };

    let client_socket = UdpSocket::bind("[::1]:0").await.unwrap();
    let link = Link::from_socket(client_socket, 1, "test1", server_addr);

    let config = DeviceConfig {
        ifname: "test1".to_string(),
        ..Default::default()
    };
    let device = Device::with_seed(1, config, client_duid(), 4);

    let cache_dir = std::env::temp_dir().join(format!("worker-renew-{}", std::process::id()));
    let cache = LeaseCache::new(&cache_dir);
    let (notify_tx, mut notify_rx) = mpsc::channel(16);
    let (cmd_tx, cmd_rx) = mpsc::channel(4);

    let worker = DeviceWorker::new(device, link, Arc::new(NullApplier), cache, notify_tx, cmd_rx);
    let worker_task = tokio::spawn(worker.run());

    let (solicit, client_addr) = recv_decoded(&server).await;
    let advertise = answer_bytes(MessageType::Advertise, &solicit, true);
    server.send_to(&advertise, client_addr).await.unwrap();

    let (request, _) = recv_decoded(&server).await;
    let reply = answer_bytes(MessageType::Reply, &request, true);
    server.send_to(&reply, client_addr).await.unwrap();

    assert!(matches!(
        expect_event(&mut notify_rx).await,
        LeaseEvent::Acquired(_)
    ));

    // Early renew on command, long before T1.
    cmd_tx.send(Command::Renew).await.unwrap();
    let (renew, _) = recv_decoded(&server).await;
    assert_eq!(renew.msg_type, MessageType::Renew);
    assert_eq!(renew.server_id, Some(server_duid()));

    let reply = answer_bytes(MessageType::Reply, &renew, true);
    server.send_to(&reply, client_addr).await.unwrap();

    // The replacement lease surfaces as another acquisition.
    assert!(matches!(
        expect_event(&mut notify_rx).await,
        LeaseEvent::Acquired(_)
    ));

    cmd_tx.send(Command::Stop).await.unwrap();
    timeout(Duration::from_secs(5), worker_task)
        .await
        .expect("worker did not stop")
        .unwrap();

    let _ = std::fs::remove_dir_all(&cache_dir);
}
