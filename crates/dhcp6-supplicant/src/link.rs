//! Link manager: the per-interface DHCPv6 socket.
//!
//! Owns the UDP socket bound to the client port, joined to the
//! All_DHCP_Relay_Agents_and_Servers group on the interface, and maps the
//! FSM's abstract [`Destination`] onto concrete socket addresses. The FSM
//! itself never touches a file descriptor.

use common::{Error, Result};
use dhcp6::transaction::Destination;
use dhcp6::types::{ALL_DHCP_RELAY_AGENTS_AND_SERVERS, CLIENT_PORT, SERVER_PORT};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use tokio::net::UdpSocket;

/// The DHCPv6 socket for one interface.
pub struct Link {
    socket: UdpSocket,
    pub ifindex: u32,
    pub ifname: String,
    /// Where multicast transmissions go; tests redirect this.
    mcast_dest: SocketAddrV6,
    /// Server port for unicast transmissions.
    server_port: u16,
}

impl Link {
    /// Open the client socket on `ifname`: bind `[::]:546`, v6-only, and
    /// join `ff02::1:2` scoped to the interface.
    pub fn open(ifname: &str) -> Result<Self> {
        let ifindex = interface_index(ifname).map_err(Error::link)?;

        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_only_v6(true)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, CLIENT_PORT, 0, 0);
        socket.bind(&SocketAddr::V6(bind_addr).into())?;

        socket.join_multicast_v6(&ALL_DHCP_RELAY_AGENTS_AND_SERVERS, ifindex)?;
        socket.set_multicast_if_v6(ifindex)?;

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket,
            ifindex,
            ifname: ifname.to_string(),
            mcast_dest: SocketAddrV6::new(
                ALL_DHCP_RELAY_AGENTS_AND_SERVERS,
                SERVER_PORT,
                0,
                ifindex,
            ),
            server_port: SERVER_PORT,
        })
    }

    /// Wrap an already-bound socket, with transmissions redirected to
    /// `mcast_dest`. Used by tests that stand in for a server on loopback.
    pub fn from_socket(
        socket: UdpSocket,
        ifindex: u32,
        ifname: &str,
        mcast_dest: SocketAddrV6,
    ) -> Self {
        Self {
            socket,
            ifindex,
            ifname: ifname.to_string(),
            server_port: mcast_dest.port(),
            mcast_dest,
        }
    }

    /// Send one client message.
    pub async fn send(&self, dest: Destination, payload: &[u8]) -> io::Result<()> {
        let target = match dest {
            Destination::Multicast => self.mcast_dest,
            Destination::Unicast(addr) => {
                let scope = if is_link_local(addr) { self.ifindex } else { 0 };
                SocketAddrV6::new(addr, self.server_port, 0, scope)
            }
        };
        self.socket.send_to(payload, target).await.map(|_| ())
    }

    /// Receive one datagram; returns the payload length and source address.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Ipv6Addr)> {
        loop {
            let (len, src) = self.socket.recv_from(buf).await?;
            match src {
                SocketAddr::V6(v6) => return Ok((len, *v6.ip())),
                // The socket is v6-only; anything else is noise.
                SocketAddr::V4(_) => continue,
            }
        }
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

fn is_link_local(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Get the interface index for a given interface name
fn interface_index(name: &str) -> io::Result<u32> {
    use std::ffi::CString;

    let c_name = CString::new(name).map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };

    if index == 0 {
        Err(io::Error::new(
            ErrorKind::NotFound,
            format!("Interface {} not found", name),
        ))
    } else {
        Ok(index)
    }
}

/// Read the interface MAC address from sysfs.
pub fn interface_hwaddr(name: &str) -> Result<Vec<u8>> {
    let path = format!("/sys/class/net/{}/address", name);
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| Error::link(format!("reading {}: {}", path, e)))?;
    let mut hwaddr = Vec::with_capacity(6);
    for part in contents.trim().split(':') {
        let byte = u8::from_str_radix(part, 16)
            .map_err(|_| Error::link(format!("bad hardware address in {}", path)))?;
        hwaddr.push(byte);
    }
    if hwaddr.is_empty() {
        return Err(Error::link(format!("empty hardware address in {}", path)));
    }
    Ok(hwaddr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_index() {
        // "lo" (loopback) should always exist
        let result = interface_index("lo");
        assert!(result.is_ok());
        assert!(result.unwrap() > 0);

        // Non-existent interface
        let result = interface_index("nonexistent99");
        assert!(result.is_err());
    }

    #[test]
    fn test_link_local_detection() {
        assert!(is_link_local("fe80::1".parse().unwrap()));
        assert!(!is_link_local("2001:db8::1".parse().unwrap()));
        assert!(!is_link_local("::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_loopback_send_recv() {
        let server = UdpSocket::bind("[::1]:0").await.unwrap();
        let server_addr = match server.local_addr().unwrap() {
            SocketAddr::V6(v6) => v6,
            _ => unreachable!(),
        };

        let client = UdpSocket::bind("[::1]:0").await.unwrap();
        let link = Link::from_socket(client, 1, "lo", server_addr);

        link.send(Destination::Multicast, b"hello").await.unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
    }
}
