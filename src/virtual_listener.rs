use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::subnet::{PrefixAddr, Subnet};

/// A per-subnet channel-backed stream listener: from the consumer's side it behaves like a real
/// TCP listener (`accept`/`close`/`local_addr`), but every connection it yields was actually
/// dispatched to it by an [`crate::interface_listener::InterfaceListener`] reader task.
pub struct VirtualListener {
    subnet: Subnet,
    laddr: PrefixAddr,
    inbound: Mutex<mpsc::Receiver<(TcpStream, SocketAddr)>>,
    sender: mpsc::Sender<(TcpStream, SocketAddr)>,
    closed: AtomicBool,
    send_lock: Mutex<()>,
    metrics: Metrics,
}

impl VirtualListener {
    pub(crate) fn new(subnet: Subnet, laddr: PrefixAddr, buffer: usize, metrics: Metrics) -> Self {
        let (sender, receiver) = mpsc::channel(buffer);

        Self {
            subnet,
            laddr,
            inbound: Mutex::new(receiver),
            sender,
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

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let mut inbound = self.inbound.lock().await;
        let item = inbound.recv().await.ok_or(Error::Closed)?;
        self.metrics.stream_channel_depth_dec(&self.subnet.to_string());
        Ok(item)
    }

    /// Idempotent-guarded close: the first call closes the channel; subsequent calls return
    /// [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }

        // Dropping the only sender would also do this on `Drop`, but closing explicitly here
        // makes `accept`'s `None` fire immediately rather than waiting for every clone to drop.
        self.inbound.lock().await.close();
        Ok(())
    }

    /// Dispatcher-side push: called from an `InterfaceListener`'s accept loop. Returns `true` if
    /// the connection was accepted into the channel, `false` if this listener is closed (the
    /// caller should abandon the connection).
    pub(crate) async fn send(&self, conn: TcpStream, addr: SocketAddr) -> bool {
        let _guard = self.send_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        if self.sender.send((conn, addr)).await.is_err() {
            return false;
        }
        self.metrics.stream_channel_depth_inc(&self.subnet.to_string());
        true
    }
}
