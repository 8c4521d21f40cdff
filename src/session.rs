use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::deadline::Deadline;
use crate::pool::Buffer;

/// Produced by [`crate::interface_listener::InterfaceListener::read_udp`] for every successfully
/// received datagram.
///
/// `laddr` is the *original* destination address recovered from ancillary control data, not the
/// kernel socket's bound address. `resp_oob` is the encoded packet-info control message that, if
/// used on the reply write, makes the kernel emit the response with `laddr` as its source.
pub struct PacketSession {
    pub laddr: SocketAddr,
    pub raddr: SocketAddr,
    pub read_body: Buffer,
    pub read_len: usize,
    pub resp_oob: Bytes,
}

impl PacketSession {
    pub fn payload(&self) -> &[u8] {
        &self.read_body[..self.read_len]
    }
}

/// Where a [`WriteRequest`] should be written: either reusing a received session's recovered
/// source address and control data, or to a plain unconnected remote address.
pub enum WriteTarget {
    Session(std::sync::Arc<PacketSession>),
    Remote(SocketAddr),
}

/// A write enqueued on an `InterfaceListener`'s shared write-request channel by a
/// `VirtualPacketConn`. The writer task owns the reply and sends exactly one `WriteResponse` back
/// on `response`.
pub struct WriteRequest {
    pub target: WriteTarget,
    pub body: Bytes,
    pub deadline: Deadline,
    pub response: oneshot::Sender<WriteResponse>,
}

pub struct WriteResponse {
    pub result: std::io::Result<usize>,
}
