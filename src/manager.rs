use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::oneshot;

use crate::error::{Error, ErrorCollector, Result};
use crate::interface_listener::InterfaceListener;
use crate::interface_storage::InterfaceStorage;
use crate::metrics::Metrics;
use crate::subnet::{PrefixAddr, Subnet};
use crate::virtual_listener::VirtualListener;
use crate::virtual_packet_conn::VirtualPacketConn;

/// Opaque identifier for an interface listener, unique within one [`Manager`].
///
/// A plain `String` newtype, the same choice this codebase makes for other small
/// caller-assigned identifiers (`ClientSocket`, `AllocationPort`) rather than an integer handle
/// the caller would have to track bookkeeping for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceListenerId(String);

impl InterfaceListenerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for InterfaceListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Tunables for every [`InterfaceListener`] a [`Manager`] constructs.
///
/// Defaults mirror the spec's stated constants: a 512-byte UDP body (the nominal default DNS
/// message size) and generously sized channel buffers so a burst of dispatch traffic doesn't
/// immediately apply backpressure to the kernel-facing reader tasks.
#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub channel_buffer_size: usize,
    pub udp_body_buffer_size: usize,
    pub write_request_buffer_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 128,
            udp_body_buffer_size: 512,
            write_request_buffer_size: 128,
        }
    }
}

/// Per-listener control knobs that can be supplied at [`Manager::add`] time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerOptions {
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
}

/// Combined handle returned by [`Manager::listen_config`]: a stream and a packet factory for one
/// registered subnet, mirroring the "ListenConfig" contract in §6 (`listen`/`listen_packet`/
/// `addr`) minus the `ctx`/`network`/`address` parameters the spec notes are ignored here --
/// there is exactly one listener and one packet conn per registration, so no dispatch on those
/// arguments is needed.
pub struct VirtualListenConfig {
    listener: Arc<VirtualListener>,
    packet_conn: Arc<VirtualPacketConn>,
}

impl VirtualListenConfig {
    pub fn listen(&self) -> Arc<VirtualListener> {
        self.listener.clone()
    }

    pub fn listen_packet(&self) -> Arc<VirtualPacketConn> {
        self.packet_conn.clone()
    }

    pub fn addr(&self) -> PrefixAddr {
        self.listener.local_addr()
    }
}

/// Registry of [`InterfaceListener`]s, factory of virtual endpoints, and the top-level lifecycle
/// object callers own.
///
/// Registration (`add`/`listen_config`) happens before [`Manager::start`]; after `start`, the
/// `SubnetIndex`es inside each `InterfaceListener` are read-only, so the hot dispatch path never
/// touches the `RwLock` guarding this map in write mode again.
pub struct Manager {
    listeners: RwLock<BTreeMap<InterfaceListenerId, Arc<InterfaceListener>>>,
    ports: RwLock<BTreeMap<(String, u16), InterfaceListenerId>>,
    config: ManagerConfig,
    interfaces: Arc<dyn InterfaceStorage>,
    metrics: Metrics,
    started: AtomicBool,
    shutdown: AtomicBool,
}

impl Manager {
    pub fn new(config: ManagerConfig, interfaces: Arc<dyn InterfaceStorage>) -> Self {
        Self {
            listeners: RwLock::new(BTreeMap::new()),
            ports: RwLock::new(BTreeMap::new()),
            config,
            interfaces,
            metrics: Metrics::new(),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Registers a new interface listener for `(iface_name, port)`. Must be called before
    /// [`Manager::start`].
    ///
    /// Rejects a duplicate `id` or a duplicate `(iface_name, port)` pair. Both checks walk the
    /// registry in id order (`BTreeMap`'s natural iteration order) so the "already registered"
    /// error always names the same prior registration across runs, stabilizing diagnostics.
    pub fn add(
        &self,
        id: InterfaceListenerId,
        iface_name: impl Into<String>,
        port: u16,
        options: ListenerOptions,
    ) -> Result<()> {
        let iface_name = iface_name.into();
        self.interfaces.interface_by_name(&iface_name)?;

        let mut listeners = self.lock_listeners_mut();
        if listeners.contains_key(&id) {
            return Err(Error::already_registered(format!(
                "interface listener id {id}"
            )));
        }

        let mut ports = self.lock_ports_mut();
        let key = (iface_name.clone(), port);
        if ports.contains_key(&key) {
            return Err(Error::already_registered(format!(
                "{iface_name}:{port}"
            )));
        }

        let listener = Arc::new(InterfaceListener::new(
            iface_name,
            port,
            self.config.write_request_buffer_size,
            self.config.udp_body_buffer_size,
            crate::platform::BufferSizes {
                send: options.send_buffer_size,
                recv: options.recv_buffer_size,
            },
            self.metrics.clone(),
        ));

        ports.insert(key, id.clone());
        listeners.insert(id, listener);

        Ok(())
    }

    /// Registers a virtual listener/packet conn for `subnet` under the interface listener `id`.
    /// Must be called before [`Manager::start`].
    ///
    /// `subnet` must already be masked; an unmasked subnet is rejected with [`Error::BadSubnet`]
    /// naming the expected masked form. The interface must itself have a configured subnet that
    /// contains or equals `subnet` -- i.e. the interface's prefix is no more specific than the
    /// one being requested -- otherwise the registration would silently never receive traffic.
    pub fn listen_config(
        &self,
        id: &InterfaceListenerId,
        subnet: Subnet,
    ) -> Result<VirtualListenConfig> {
        let masked = subnet.masked();
        if subnet != masked {
            return Err(Error::BadSubnet {
                given: subnet,
                expected: masked,
            });
        }

        let listener = self.lookup_listener(id)?;

        let iface = self.interfaces.interface_by_name(listener.iface_name())?;
        let covered = iface
            .subnets()
            .iter()
            .any(|iface_subnet| iface_subnet.contains_or_equals(&subnet));
        if !covered {
            return Err(Error::InterfaceNotFound(format!(
                "{} has no subnet containing {subnet}",
                listener.iface_name()
            )));
        }

        let laddr = PrefixAddr::new(subnet, listener.port());

        let virtual_listener = Arc::new(VirtualListener::new(
            subnet,
            laddr,
            self.config.channel_buffer_size,
            self.metrics.clone(),
        ));
        let packet_conn = Arc::new(VirtualPacketConn::new(
            subnet,
            laddr,
            listener.iface_name(),
            self.config.channel_buffer_size,
            listener.write_requests(),
            self.metrics.clone(),
        ));

        listener.register_stream(subnet, virtual_listener.clone())?;
        listener.register_packet(subnet, packet_conn.clone())?;

        Ok(VirtualListenConfig {
            listener: virtual_listener,
            packet_conn,
        })
    }

    /// Spawns the TCP accept and UDP read/write tasks for every registered interface listener.
    ///
    /// Collects exactly one bind result per task (2N for N listeners). If any bind failed, the
    /// errors are joined into a single [`anyhow::Error`] (so callers see every failure at once,
    /// not just the first); otherwise returns `Ok(())`.
    pub async fn start(&self, errors: ErrorCollector) -> anyhow::Result<()> {
        self.started.store(true, Ordering::Release);

        let listeners: Vec<_> = {
            let guard = self.lock_listeners();
            guard.values().cloned().collect()
        };

        let mut binds = Vec::with_capacity(listeners.len() * 2);
        for listener in listeners {
            let (tcp_tx, tcp_rx) = oneshot::channel();
            let (udp_tx, udp_rx) = oneshot::channel();

            tokio::spawn(listener.clone().start_tcp(tcp_tx, errors.clone()));
            tokio::spawn(listener.clone().start_udp(udp_tx, errors.clone()));

            binds.push(tcp_rx);
            binds.push(udp_rx);
        }

        let mut failures = Vec::new();
        for bind in binds {
            match bind.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failures.push(err),
                Err(_) => failures.push(Error::Closed),
            }
        }

        if failures.is_empty() {
            tracing::info!("all interface listeners started");
            return Ok(());
        }

        let joined = failures
            .into_iter()
            .map(|err| err.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(anyhow::anyhow!("failed to start interface listeners: {joined}"))
    }

    /// Closes the `done` signal of every interface listener exactly once. Does not wait for
    /// their tasks to observe it and exit, nor for any in-flight accept/read/write to finish --
    /// per §5, there is no drain-on-shutdown guarantee.
    pub fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }

        let listeners = self.lock_listeners();
        for listener in listeners.values() {
            listener.shutdown();
        }

        Ok(())
    }

    fn lookup_listener(&self, id: &InterfaceListenerId) -> Result<Arc<InterfaceListener>> {
        self.lock_listeners()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    #[allow(clippy::unwrap_used)]
    fn lock_listeners(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<InterfaceListenerId, Arc<InterfaceListener>>> {
        self.listeners.read().unwrap()
    }

    #[allow(clippy::unwrap_used)]
    fn lock_listeners_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<InterfaceListenerId, Arc<InterfaceListener>>> {
        self.listeners.write().unwrap()
    }

    #[allow(clippy::unwrap_used)]
    fn lock_ports_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<(String, u16), InterfaceListenerId>> {
        self.ports.write().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct FakeInterfaces {
        subnets: Vec<Subnet>,
    }

    impl InterfaceStorage for FakeInterfaces {
        fn interface_by_name(&self, name: &str) -> Result<crate::interface_storage::Interface> {
            if name != "eth0" {
                return Err(Error::InterfaceNotFound(name.to_string()));
            }
            Ok(crate::interface_storage::Interface::for_test(
                name,
                self.subnets.clone(),
            ))
        }
    }

    fn subnet(s: &str) -> Subnet {
        let (addr, len) = s.split_once('/').unwrap();
        Subnet::new(addr.parse().unwrap(), len.parse().unwrap()).unwrap()
    }

    fn manager() -> Manager {
        Manager::new(
            ManagerConfig::default(),
            Arc::new(FakeInterfaces {
                subnets: vec![subnet("1.2.0.0/16")],
            }),
        )
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let manager = manager();
        manager
            .add(InterfaceListenerId::new("id1"), "eth0", 12345, ListenerOptions::default())
            .unwrap();

        assert!(matches!(
            manager.add(InterfaceListenerId::new("id1"), "eth0", 12345, ListenerOptions::default()),
            Err(Error::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn duplicate_iface_port_is_rejected() {
        let manager = manager();
        manager
            .add(InterfaceListenerId::new("id1"), "eth0", 12345, ListenerOptions::default())
            .unwrap();

        assert!(matches!(
            manager.add(InterfaceListenerId::new("id2"), "eth0", 12345, ListenerOptions::default()),
            Err(Error::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn unknown_interface_is_rejected() {
        let manager = manager();

        assert!(matches!(
            manager.add(InterfaceListenerId::new("id1"), "eth9", 12345, ListenerOptions::default()),
            Err(Error::InterfaceNotFound(_))
        ));
    }

    #[test]
    fn unmasked_subnet_is_rejected_with_masked_hint() {
        let manager = manager();
        let id = InterfaceListenerId::new("id1");
        manager.add(id.clone(), "eth0", 12345, ListenerOptions::default()).unwrap();

        let unmasked = Subnet::new(Ipv4Addr::new(1, 2, 3, 4).into(), 24).unwrap();
        let err = manager.listen_config(&id, unmasked).unwrap_err();

        match err {
            Error::BadSubnet { expected, .. } => assert_eq!(expected.to_string(), "1.2.3.0/24"),
            other => panic!("expected BadSubnet, got {other:?}"),
        }
    }

    #[test]
    fn subnet_not_covered_by_interface_is_rejected() {
        let manager = manager();
        let id = InterfaceListenerId::new("id1");
        manager.add(id.clone(), "eth0", 12345, ListenerOptions::default()).unwrap();

        let outside = subnet("9.9.9.0/24");
        assert!(manager.listen_config(&id, outside).is_err());
    }

    #[test]
    fn subnet_registration_succeeds_for_covered_subnet() {
        let manager = manager();
        let id = InterfaceListenerId::new("id1");
        manager.add(id.clone(), "eth0", 12345, ListenerOptions::default()).unwrap();

        let config = manager.listen_config(&id, subnet("1.2.3.0/24")).unwrap();
        assert_eq!(config.addr().to_string(), "1.2.3.0:12345/24");
    }

    #[test]
    fn duplicate_subnet_registration_is_rejected() {
        let manager = manager();
        let id = InterfaceListenerId::new("id1");
        manager.add(id.clone(), "eth0", 12345, ListenerOptions::default()).unwrap();
        manager.listen_config(&id, subnet("1.2.3.0/24")).unwrap();

        assert!(manager.listen_config(&id, subnet("1.2.3.0/24")).is_err());
    }

    #[test]
    fn double_shutdown_returns_closed() {
        let manager = manager();
        manager.shutdown().unwrap();
        assert!(matches!(manager.shutdown(), Err(Error::Closed)));
    }
}
