//! Linux-only bind-to-device dispatch layer.
//!
//! A small number of real kernel sockets -- one TCP listener and one UDP socket per
//! `(interface, port)` pair -- are multiplexed into many logical "virtual" listeners, each
//! scoped to a destination subnet. Incoming TCP connections and UDP datagrams are routed to the
//! virtual listener whose subnet contains the connection/datagram's *original* destination
//! address, recovered from kernel ancillary control data rather than the bound socket's own
//! address. [`ConnLimiter`] is a secondary, loosely coupled concern: a hysteresis-based admission
//! controller that can wrap any [`StreamListener`], including a [`VirtualListener`].
//!
//! See [`Manager`] for the entry point: register interface listeners and subnets before calling
//! [`Manager::start`], then use the [`VirtualListener`]/[`VirtualPacketConn`] handles returned by
//! [`Manager::listen_config`] exactly as you would a real `TcpListener`/`UdpSocket`.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod conn_limiter;
mod deadline;
mod error;
mod interface_listener;
mod interface_storage;
mod manager;
mod metrics;
mod platform;
mod pool;
#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod proptest;
mod session;
mod subnet;
mod subnet_index;
mod virtual_listener;
mod virtual_packet_conn;

pub use conn_limiter::{ConnLimiter, LimitedConn, LimitedListener, StreamListener};
pub use deadline::Deadline;
pub use error::{Error, ErrorCollector, Result};
pub use interface_storage::{Interface, InterfaceStorage, OsInterfaceStorage};
pub use manager::{InterfaceListenerId, ListenerOptions, Manager, ManagerConfig, VirtualListenConfig};
pub use session::{PacketSession, WriteResponse};
pub use subnet::{PrefixAddr, Subnet};
pub use virtual_listener::VirtualListener;
pub use virtual_packet_conn::VirtualPacketConn;
