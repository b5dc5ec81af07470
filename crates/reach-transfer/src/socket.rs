use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::warn;

/// Requested kernel buffer size for both directions.
pub const UDP_SOCKET_BUFFER: usize = 4 * 1024 * 1024;

/// Attempts for a send that keeps failing with a full send buffer.
const SEND_RETRIES: u32 = 50;

/// Bind a UDP socket with enlarged kernel buffers and hand it to tokio.
///
/// Must be called from inside a tokio runtime.
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    // The kernel may clamp these; a smaller buffer still works.
    if let Err(e) = socket.set_recv_buffer_size(UDP_SOCKET_BUFFER) {
        warn!("Cannot set UDP receive buffer to {}: {}", UDP_SOCKET_BUFFER, e);
    }
    if let Err(e) = socket.set_send_buffer_size(UDP_SOCKET_BUFFER) {
        warn!("Cannot set UDP send buffer to {}: {}", UDP_SOCKET_BUFFER, e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}

/// Send one datagram, backing off briefly while the send buffer is full.
pub async fn send_datagram(socket: &UdpSocket, data: &[u8], target: SocketAddr) -> io::Result<()> {
    let mut retries = 0;
    loop {
        match socket.send_to(data, target).await {
            Ok(_) => return Ok(()),
            Err(ref e) if retries < SEND_RETRIES && is_send_buffer_full(e) => {
                retries += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_send_buffer_full(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == Some(105) // ENOBUFS (Linux)
        || e.raw_os_error() == Some(10055) // WSAENOBUFS
}

/// ICMP port unreachable surfaces as a receive error on some platforms;
/// it says nothing about our own socket.
pub(crate) fn is_connection_reset(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::ConnectionReset
}
