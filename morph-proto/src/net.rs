/// UDP socket helpers shared by the relay and client binaries.
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Room for a full WireGuard datagram plus template, obfuscation and
/// security overhead.
pub const MAX_DATAGRAM: usize = 65_535;
const SOCKET_BUFFER: usize = 1 << 20;

/// Bind a non-blocking UDP socket with enlarged kernel buffers, registered
/// with the current tokio runtime. The port is exclusive: a second bind on
/// an occupied port fails.
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    // Best effort: some hosts cap these below the request
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER) {
        tracing::debug!("SO_RCVBUF not applied: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER) {
        tracing::debug!("SO_SNDBUF not applied: {}", e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Resolve `host:port`, preferring an IPv4 result.
pub async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host)))
}
