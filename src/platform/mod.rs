//! Platform-specific socket setup.
//!
//! Everything that needs `SO_BINDTODEVICE`, `IP_FREEBIND`, or ancillary control-message parsing
//! lives behind the `#[cfg(target_os = "linux")]` / stub-module split this codebase already uses
//! for its eBPF accelerator: one real implementation, one "unsupported" stub, same public surface.

use std::net::SocketAddr;

use crate::error::Result;
use crate::pool::BufferPool;
use crate::session::PacketSession;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(target_os = "linux"))]
mod unsupported;

#[cfg(target_os = "linux")]
use linux as imp;
#[cfg(not(target_os = "linux"))]
use unsupported as imp;

/// Socket send/receive buffer sizes applied at bind time, if configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferSizes {
    pub send: Option<usize>,
    pub recv: Option<usize>,
}

/// Binds a TCP listener to `0.0.0.0:port`, bound to `iface_name` via `SO_BINDTODEVICE`.
pub fn bind_tcp(iface_name: &str, port: u16, buffers: BufferSizes) -> Result<tokio::net::TcpListener> {
    imp::bind_tcp(iface_name, port, buffers)
}

/// Binds a UDP socket to `0.0.0.0:port`, bound to `iface_name`, with `IP_FREEBIND` and
/// `IP(V6)_RECVORIGDSTADDR` enabled so [`read_datagram`] can recover the original destination.
pub fn bind_udp(iface_name: &str, port: u16, buffers: BufferSizes) -> Result<tokio::net::UdpSocket> {
    imp::bind_udp(iface_name, port, buffers)
}

/// Reads one datagram, recovering its original destination address from ancillary control data
/// and building the `resp_oob` control message that preserves it as the reply's source.
pub async fn read_datagram(
    socket: &tokio::net::UdpSocket,
    body_pool: &BufferPool,
    oob_pool: &BufferPool,
) -> Result<PacketSession> {
    imp::read_datagram(socket, body_pool, oob_pool).await
}

/// Writes `body` to `dst`, optionally attaching `oob` (a `resp_oob` produced by
/// [`read_datagram`]) so the kernel uses it as the ancillary control data of the reply.
pub async fn write_datagram(
    socket: &tokio::net::UdpSocket,
    body: &[u8],
    dst: SocketAddr,
    oob: Option<&[u8]>,
) -> std::io::Result<usize> {
    imp::write_datagram(socket, body, dst, oob).await
}
