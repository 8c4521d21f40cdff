use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchMiss, Error, ErrorCollector, Result};
use crate::metrics::Metrics;
use crate::platform::{self, BufferSizes};
use crate::pool::BufferPool;
use crate::session::{WriteRequest, WriteTarget};
use crate::subnet_index::SubnetIndex;
use crate::virtual_listener::VirtualListener;
use crate::virtual_packet_conn::VirtualPacketConn;

/// Owns the single kernel TCP listener and UDP socket for one `(iface, port)` pair, and the
/// `SubnetIndex`es that route each accepted connection/datagram to the right virtual endpoint.
///
/// `SubnetIndex` is only mutated before `start_tcp`/`start_udp` run (via `register_stream`/
/// `register_packet`, both called from `Manager::listen_config`); an `std::sync::RwLock` enforces
/// that without needing a separate builder/frozen-index split — reads on the hot path pay a
/// read-lock, never a write.
pub struct InterfaceListener {
    iface_name: String,
    port: u16,
    streams: RwLock<SubnetIndex<Arc<VirtualListener>>>,
    packets: RwLock<SubnetIndex<Arc<VirtualPacketConn>>>,
    write_requests_tx: mpsc::Sender<WriteRequest>,
    write_requests_rx: tokio::sync::Mutex<Option<mpsc::Receiver<WriteRequest>>>,
    done: CancellationToken,
    body_pool: BufferPool,
    oob_pool: BufferPool,
    buffer_sizes: BufferSizes,
    metrics: Metrics,
}

impl InterfaceListener {
    pub(crate) fn new(
        iface_name: impl Into<String>,
        port: u16,
        write_request_buffer: usize,
        udp_body_buffer_size: usize,
        buffer_sizes: BufferSizes,
        metrics: Metrics,
    ) -> Self {
        let (write_requests_tx, write_requests_rx) = mpsc::channel(write_request_buffer);
        let iface_name = iface_name.into();

        Self {
            body_pool: BufferPool::new(udp_body_buffer_size, "udp-body"),
            oob_pool: BufferPool::new(40, "udp-oob"),
            streams: RwLock::new(SubnetIndex::new()),
            packets: RwLock::new(SubnetIndex::new()),
            write_requests_tx,
            write_requests_rx: tokio::sync::Mutex::new(Some(write_requests_rx)),
            done: CancellationToken::new(),
            buffer_sizes,
            iface_name,
            port,
            metrics,
        }
    }

    pub fn iface_name(&self) -> &str {
        &self.iface_name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn write_requests(&self) -> mpsc::Sender<WriteRequest> {
        self.write_requests_tx.clone()
    }

    pub(crate) fn register_stream(
        &self,
        subnet: crate::subnet::Subnet,
        listener: Arc<VirtualListener>,
    ) -> Result<()> {
        #[allow(clippy::unwrap_used)]
        self.streams.write().unwrap().insert(subnet, listener)
    }

    pub(crate) fn register_packet(
        &self,
        subnet: crate::subnet::Subnet,
        conn: Arc<VirtualPacketConn>,
    ) -> Result<()> {
        #[allow(clippy::unwrap_used)]
        self.packets.write().unwrap().insert(subnet, conn)
    }

    pub(crate) fn has_subnet(&self, subnet: &crate::subnet::Subnet) -> bool {
        #[allow(clippy::unwrap_used)]
        let streams = self.streams.read().unwrap();
        #[allow(clippy::unwrap_used)]
        let packets = self.packets.read().unwrap();
        streams.iter().any(|(s, _)| s == subnet) || packets.iter().any(|(s, _)| s == subnet)
    }

    pub(crate) fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    pub(crate) fn shutdown(&self) {
        self.done.cancel();
    }

    /// Creates a TCP listener bound to `0.0.0.0:port`, reports the bind outcome exactly once on
    /// `bind_result`, then loops accepting connections (or exits on `done`) until cancelled.
    pub(crate) async fn start_tcp(
        self: Arc<Self>,
        bind_result: oneshot::Sender<Result<()>>,
        errors: ErrorCollector,
    ) {
        let listener = match platform::bind_tcp(&self.iface_name, self.port, self.buffer_sizes) {
            Ok(listener) => {
                let _ = bind_result.send(Ok(()));
                listener
            }
            Err(err) => {
                let _ = bind_result.send(Err(clone_error(&err)));
                return;
            }
        };

        loop {
            tokio::select! {
                () = self.done.cancelled() => {
                    tracing::debug!(iface = %self.iface_name, port = self.port, "tcp accept loop stopping");
                    return;
                }
                result = listener.accept() => {
                    match result {
                        Ok((conn, addr)) => self.process_conn(conn, addr, &errors).await,
                        Err(err) => errors(Error::Io(err)),
                    }
                }
            }
        }
    }

    async fn process_conn(&self, conn: tokio::net::TcpStream, addr: SocketAddr, errors: &ErrorCollector) {
        let local = match conn.local_addr() {
            Ok(local) => local,
            Err(err) => {
                errors(Error::Io(err));
                return;
            }
        };

        #[allow(clippy::unwrap_used)]
        let target = self.streams.read().unwrap().lookup(local.ip()).cloned();

        match target {
            Some(listener) => {
                if !listener.send(conn, addr).await {
                    tracing::trace!(iface = %self.iface_name, %local, "virtual listener closed, dropping connection");
                }
            }
            None => {
                self.metrics.record_unknown_tcp(&self.iface_name);
                tracing::debug!(?DispatchMiss { local }, iface = %self.iface_name, "no virtual listener for destination");
            }
        }
    }

    /// Creates a UDP socket with the same options, reports the bind outcome, spawns the writer
    /// task, then loops reading datagrams (or exits on `done`) until cancelled.
    pub(crate) async fn start_udp(
        self: Arc<Self>,
        bind_result: oneshot::Sender<Result<()>>,
        errors: ErrorCollector,
    ) {
        let socket = match platform::bind_udp(&self.iface_name, self.port, self.buffer_sizes) {
            Ok(socket) => {
                let _ = bind_result.send(Ok(()));
                Arc::new(socket)
            }
            Err(err) => {
                let _ = bind_result.send(Err(clone_error(&err)));
                return;
            }
        };

        let write_rx = {
            #[allow(clippy::unwrap_used)]
            let mut guard = self.write_requests_rx.lock().await;
            guard.take().expect("start_udp called more than once")
        };
        tokio::spawn(run_udp_writer(
            socket.clone(),
            write_rx,
            self.iface_name.clone(),
            self.metrics.clone(),
        ));

        loop {
            tokio::select! {
                () = self.done.cancelled() => {
                    tracing::debug!(iface = %self.iface_name, port = self.port, "udp read loop stopping");
                    return;
                }
                result = self.read_udp(&socket) => {
                    if let Err(err) = result {
                        errors(err);
                    }
                }
            }
        }
    }

    async fn read_udp(&self, socket: &tokio::net::UdpSocket) -> Result<()> {
        let session = platform::read_datagram(socket, &self.body_pool, &self.oob_pool).await?;

        #[allow(clippy::unwrap_used)]
        let target = self.packets.read().unwrap().lookup(session.laddr.ip()).cloned();

        match target {
            Some(conn) => {
                if !conn.send(session).await {
                    tracing::trace!(iface = %self.iface_name, "virtual packet conn closed, dropping datagram");
                }
            }
            None => {
                self.metrics.record_unknown_udp(&self.iface_name);
                tracing::debug!(
                    ?DispatchMiss { local: session.laddr },
                    iface = %self.iface_name,
                    "no virtual packet conn for destination"
                );
                // `session` (and its pooled body buffer) drops here, returning the buffer to
                // the pool.
            }
        }

        Ok(())
    }
}

fn clone_error(err: &Error) -> Error {
    match err {
        Error::SocketSetupFailed { option, source } => Error::SocketSetupFailed {
            option,
            source: std::io::Error::new(source.kind(), source.to_string()),
        },
        other => Error::Io(std::io::Error::other(other.to_string())),
    }
}

async fn run_udp_writer(
    socket: Arc<tokio::net::UdpSocket>,
    mut requests: mpsc::Receiver<WriteRequest>,
    iface_name: String,
    metrics: Metrics,
) {
    while let Some(request) = requests.recv().await {
        metrics.write_request_depth_dec(&iface_name);

        let (dst, oob): (SocketAddr, Option<bytes::Bytes>) = match &request.target {
            WriteTarget::Remote(addr) => (*addr, None),
            WriteTarget::Session(session) => (session.raddr, Some(session.resp_oob.clone())),
        };

        let start = Instant::now();
        let result = request
            .deadline
            .race(platform::write_datagram(&socket, &request.body, dst, oob.as_deref()))
            .await
            .unwrap_or_else(|_deadline_exceeded| {
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline exceeded"))
            });
        metrics.record_udp_write_duration(&iface_name, start.elapsed());

        let _ = request.response.send(crate::session::WriteResponse { result });
    }
}
