use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::session::{PacketSession, WriteRequest, WriteTarget};
use crate::subnet::{PrefixAddr, Subnet};

/// A per-subnet channel-backed packet connection: from the consumer's side it behaves like a UDP
/// `PacketConn` with read/write deadlines, but every datagram it yields was dispatched to it by
/// the owning `InterfaceListener`'s reader task, and every write it performs is routed through
/// that listener's single shared writer task so writes on the underlying kernel socket stay
/// serialized.
pub struct VirtualPacketConn {
    subnet: Subnet,
    laddr: PrefixAddr,
    iface_name: String,
    inbound: Mutex<mpsc::Receiver<PacketSession>>,
    sender: mpsc::Sender<PacketSession>,
    write_requests: mpsc::Sender<WriteRequest>,
    read_deadline: RwLock<Deadline>,
    write_deadline: RwLock<Deadline>,
    closed: AtomicBool,
    send_lock: Mutex<()>,
    metrics: Metrics,
}

impl VirtualPacketConn {
    pub(crate) fn new(
        subnet: Subnet,
        laddr: PrefixAddr,
        iface_name: impl Into<String>,
        buffer: usize,
        write_requests: mpsc::Sender<WriteRequest>,
        metrics: Metrics,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(buffer);

        Self {
            subnet,
            laddr,
            iface_name: iface_name.into(),
            inbound: Mutex::new(receiver),
            sender,
            write_requests,
            read_deadline: RwLock::new(Deadline::None),
            write_deadline: RwLock::new(Deadline::None),
            closed: AtomicBool::new(false),
            send_lock: Mutex::new(()),
            metrics,
        }
    }

    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    pub fn local_addr(&self) -> PrefixAddr {
        self.laddr
    }

    pub async fn set_deadline(&self, deadline: Deadline) {
        *self.read_deadline.write().await = deadline;
        *self.write_deadline.write().await = deadline;
    }

    pub async fn set_read_deadline(&self, deadline: Deadline) {
        *self.read_deadline.write().await = deadline;
    }

    pub async fn set_write_deadline(&self, deadline: Deadline) {
        *self.write_deadline.write().await = deadline;
    }

    /// Copies the next datagram's payload into `buf`, returning the number of bytes copied and
    /// the peer address.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let session = self.read_from_session(buf).await?;
        Ok((session.read_len.min(buf.len()), session.raddr))
    }

    /// Like [`VirtualPacketConn::read_from`], but also returns the full session (needed to reply
    /// with [`VirtualPacketConn::write_to_session`] so the response preserves the original
    /// destination as its source).
    pub async fn read_from_session(&self, buf: &mut [u8]) -> Result<Arc<PacketSession>> {
        let deadline = *self.read_deadline.read().await;
        let mut inbound = self.inbound.lock().await;

        let session = deadline
            .race(inbound.recv())
            .await?
            .ok_or(Error::Closed)?;
        self.metrics.packet_channel_depth_dec(&self.subnet.to_string());

        let payload = session.payload();
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);

        Ok(Arc::new(session))
    }

    pub async fn write_to(&self, buf: &[u8], raddr: SocketAddr) -> Result<usize> {
        self.write(buf, WriteTarget::Remote(raddr)).await
    }

    pub async fn write_to_session(&self, buf: &[u8], session: Arc<PacketSession>) -> Result<usize> {
        self.write(buf, WriteTarget::Session(session)).await
    }

    async fn write(&self, buf: &[u8], target: WriteTarget) -> Result<usize> {
        let deadline = *self.write_deadline.read().await;
        let (response_tx, response_rx) = oneshot::channel();

        let request = WriteRequest {
            target,
            body: Bytes::copy_from_slice(buf),
            deadline,
            response: response_tx,
        };

        deadline
            .race(self.write_requests.send(request))
            .await?
            .map_err(|_| Error::Closed)?;
        self.metrics.write_request_depth_inc(&self.iface_name);

        let response = deadline
            .race(response_rx)
            .await?
            .map_err(|_| Error::Closed)?;

        response.result.map_err(Error::Io)
    }

    /// Idempotent-guarded close: the first call closes the inbound session channel; subsequent
    /// calls return [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }

        self.inbound.lock().await.close();
        Ok(())
    }

    /// Dispatcher-side push: called from an `InterfaceListener`'s UDP read loop. Returns `true` if
    /// the session was accepted into the channel, `false` if this connection is closed.
    pub(crate) async fn send(&self, session: PacketSession) -> bool {
        let _guard = self.send_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        if self.sender.send(session).await.is_err() {
            return false;
        }
        self.metrics.packet_channel_depth_inc(&self.subnet.to_string());
        true
    }

    pub fn iface_name(&self) -> &str {
        &self.iface_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::session::WriteResponse;
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};

    fn subnet() -> Subnet {
        Subnet::new(Ipv4Addr::new(10, 0, 0, 0).into(), 24).unwrap()
    }

    fn conn_with_writer() -> (VirtualPacketConn, mpsc::Receiver<WriteRequest>) {
        let (write_tx, write_rx) = mpsc::channel(4);
        let conn = VirtualPacketConn::new(
            subnet(),
            PrefixAddr::new(subnet(), 53),
            "eth0",
            4,
            write_tx,
            Metrics::new(),
        );
        (conn, write_rx)
    }

    fn session(payload: &[u8]) -> PacketSession {
        let pool = BufferPool::new(payload.len().max(1), "test");
        let mut body = pool.pull();
        body[..payload.len()].copy_from_slice(payload);

        PacketSession {
            laddr: "10.0.0.5:53".parse().unwrap(),
            raddr: "1.2.3.4:9000".parse().unwrap(),
            read_body: body,
            read_len: payload.len(),
            resp_oob: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn read_from_copies_payload_and_returns_peer() {
        let (conn, _write_rx) = conn_with_writer();
        conn.send(session(b"hello")).await;

        let mut buf = [0u8; 16];
        let (n, peer) = conn.read_from(&mut buf).await.unwrap();

        assert_eq!(&buf[..n], b"hello");
        assert_eq!(peer, "1.2.3.4:9000".parse().unwrap());
    }

    #[tokio::test]
    async fn write_to_round_trips_through_the_shared_writer_channel() {
        let (conn, mut write_rx) = conn_with_writer();

        let responder = tokio::spawn(async move {
            let request = write_rx.recv().await.unwrap();
            assert!(matches!(request.target, WriteTarget::Remote(_)));
            let _ = request.response.send(WriteResponse { result: Ok(request.body.len()) });
        });

        let n = conn.write_to(b"world", "1.2.3.4:9000".parse().unwrap()).await.unwrap();
        assert_eq!(n, 5);

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn read_past_deadline_returns_deadline_exceeded() {
        let (conn, _write_rx) = conn_with_writer();
        conn.set_read_deadline(Deadline::at(Instant::now() - Duration::from_secs(1))).await;

        let mut buf = [0u8; 16];
        assert!(matches!(conn.read_from(&mut buf).await, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn double_close_returns_closed() {
        let (conn, _write_rx) = conn_with_writer();
        conn.close().await.unwrap();

        assert!(matches!(conn.close().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn read_after_close_returns_closed() {
        let (conn, _write_rx) = conn_with_writer();
        conn.close().await.unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(conn.read_from(&mut buf).await, Err(Error::Closed)));
    }
}
