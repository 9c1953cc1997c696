//! ## Multi-interface UDP transport
//!
//! Opens one unicast listener on the advertised control port plus one
//! broadcast-dedicated socket per non-loopback IPv4 interface, since a
//! single socket bound to `0.0.0.0` cannot target a specific interface's
//! directed broadcast address. Buffers are sized generously (256 KiB) in
//! both directions so a burst of gossip traffic never backs up the kernel
//! queue.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;

const SOCKET_BUFFER_BYTES: usize = 256 * 1024;
const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum Error {
    /// Every attempted socket operation failed; none of the configured
    /// interfaces could be used.
    TransportUnavailable,
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransportUnavailable => write!(f, "transport unavailable: no usable socket"),
            Self::Io(e) => write!(f, "transport io error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// One per-interface socket dedicated to emitting broadcast datagrams to
/// that interface's directed broadcast address.
struct BroadcastInterface {
    name: String,
    broadcast_addr: Ipv4Addr,
    socket: UdpSocket,
}

/// A bound control-port transport: one unicast listener (dual-stack
/// optional) plus a broadcast socket per local interface.
pub struct Transport {
    unicast_v4: UdpSocket,
    unicast_v6: Option<UdpSocket>,
    broadcasts: Vec<BroadcastInterface>,
    port: u16,
}

fn new_udp_socket(addr: SocketAddr, buffer_bytes: usize) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.set_recv_buffer_size(buffer_bytes)?;
    socket.set_send_buffer_size(buffer_bytes)?;
    socket.set_broadcast(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn broadcast_of(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    let ip = u32::from(ip);
    let mask = u32::from(netmask);
    Ipv4Addr::from(ip | !mask)
}

/// Enumerates local, non-loopback IPv4 interfaces and their directed
/// broadcast address.
fn local_broadcast_interfaces() -> Vec<(String, Ipv4Addr)> {
    let ifaces = match if_addrs::get_if_addrs() {
        Ok(v) => v,
        Err(e) => {
            log::warn!("failed to enumerate network interfaces: {e}");
            return Vec::new();
        }
    };

    ifaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.addr {
            if_addrs::IfAddr::V4(v4) => Some((iface.name, broadcast_of(v4.ip, v4.netmask))),
            _ => None,
        })
        .collect()
}

impl Transport {
    /// Binds the unicast listener, retrying every 30s on failure instead of
    /// exiting — the portal keeps trying the socket in the background
    /// while everything else (HTTP front door, redirection table) keeps
    /// running. Only used for startup; an operator who wants to see this
    /// give up should watch the logs, since §4.A says the process never
    /// exits on its own over this.
    pub async fn bind(port: u16, bind_v6: bool) -> Self {
        loop {
            match Self::try_bind(port, bind_v6) {
                Ok(transport) => return transport,
                Err(e) => {
                    log::warn!(
                        "udp transport bind failed, retrying in {}s: {}",
                        BIND_RETRY_INTERVAL.as_secs(),
                        e
                    );
                    tokio::time::sleep(BIND_RETRY_INTERVAL).await;
                }
            }
        }
    }

    fn try_bind(port: u16, bind_v6: bool) -> Result<Self, Error> {
        let unicast_v4 = new_udp_socket(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            SOCKET_BUFFER_BYTES,
        )?;

        let unicast_v6 = if bind_v6 {
            match new_udp_socket(
                SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), port),
                SOCKET_BUFFER_BYTES,
            ) {
                Ok(s) => Some(s),
                Err(e) => {
                    log::warn!("ipv6 control listener unavailable, continuing ipv4-only: {e}");
                    None
                }
            }
        } else {
            None
        };

        let mut broadcasts = Vec::new();
        for (name, broadcast_addr) in local_broadcast_interfaces() {
            match new_udp_socket(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                SOCKET_BUFFER_BYTES,
            ) {
                Ok(socket) => broadcasts.push(BroadcastInterface {
                    name,
                    broadcast_addr,
                    socket,
                }),
                Err(e) => log::warn!("skipping broadcast socket for interface {name}: {e}"),
            }
        }

        Ok(Self {
            unicast_v4,
            unicast_v6,
            broadcasts,
            port,
        })
    }

    /// Emits `data` on every interface's directed broadcast address. A
    /// per-interface failure is logged and skipped; the call only fails if
    /// every interface send fails (or there are none configured).
    pub async fn send_broadcast(&self, data: &[u8]) -> Result<(), Error> {
        if self.broadcasts.is_empty() {
            return Err(Error::TransportUnavailable);
        }

        let mut successes = 0usize;
        for iface in &self.broadcasts {
            let target = SocketAddr::new(IpAddr::V4(iface.broadcast_addr), self.port);
            match iface.socket.send_to(data, target).await {
                Ok(_) => successes += 1,
                Err(e) => log::warn!(
                    "broadcast send failed on interface {}: {}",
                    iface.name,
                    e
                ),
            }
        }

        if successes == 0 {
            Err(Error::TransportUnavailable)
        } else {
            Ok(())
        }
    }

    /// Resolves `host:port` and unicasts `data` on the socket matching the
    /// resolved address family.
    pub async fn send_unicast(&self, host_port: &str, data: &[u8]) -> Result<(), Error> {
        let addr = tokio::net::lookup_host(host_port)
            .await?
            .next()
            .ok_or(Error::TransportUnavailable)?;

        match addr {
            SocketAddr::V4(_) => self.unicast_v4.send_to(data, addr).await?,
            SocketAddr::V6(_) => match &self.unicast_v6 {
                Some(sock) => sock.send_to(data, addr).await?,
                None => return Err(Error::TransportUnavailable),
            },
        };

        Ok(())
    }

    /// Receives one datagram on the IPv4 unicast listener, returning the
    /// payload and sender address. If a v6 listener is bound its datagrams
    /// are served by [`Transport::recv_any`] instead.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        Ok(self.unicast_v4.recv_from(buf).await?)
    }

    /// Awaits whichever of the v4/v6 unicast listeners has a datagram
    /// ready first.
    pub async fn recv_any(&self, buf4: &mut [u8], buf6: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        match &self.unicast_v6 {
            None => self.recv(buf4).await,
            Some(v6) => tokio::select! {
                r = self.unicast_v4.recv_from(buf4) => Ok(r?),
                r = v6.recv_from(buf6) => Ok(r?),
            },
        }
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.broadcasts.iter().map(|i| i.name.as_str())
    }
}

/// Shared handle passed to workers that only need to send, not receive —
/// e.g. a per-worker task forwarding socket replies.
pub type SharedTransport = Arc<Transport>;
