//! Stub platform implementation for non-Linux targets: every operation fails with
//! [`Error::Unsupported`], mirroring this codebase's eBPF accelerator's stub module.

use std::net::SocketAddr;

use super::BufferSizes;
use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::session::PacketSession;

pub(super) fn bind_tcp(
    _iface_name: &str,
    _port: u16,
    _buffers: BufferSizes,
) -> Result<tokio::net::TcpListener> {
    Err(Error::Unsupported)
}

pub(super) fn bind_udp(
    _iface_name: &str,
    _port: u16,
    _buffers: BufferSizes,
) -> Result<tokio::net::UdpSocket> {
    Err(Error::Unsupported)
}

pub(super) async fn read_datagram(
    _socket: &tokio::net::UdpSocket,
    _body_pool: &BufferPool,
    _oob_pool: &BufferPool,
) -> Result<PacketSession> {
    Err(Error::Unsupported)
}

pub(super) async fn write_datagram(
    _socket: &tokio::net::UdpSocket,
    _body: &[u8],
    _dst: SocketAddr,
    _oob: Option<&[u8]>,
) -> std::io::Result<usize> {
    Err(std::io::Error::other("bind-to-device dispatch is only supported on Linux"))
}
