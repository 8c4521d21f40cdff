use std::net::SocketAddr;
use std::sync::Arc;

use crate::subnet::Subnet;

/// Errors returned by this crate's public API.
///
/// Internal plumbing uses `anyhow::Result` for kernel-call context and converts into one of
/// these variants at the module boundary (see e.g. [`crate::platform`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The core only supports Linux; called on any other `target_os`.
    #[error("bind-to-device dispatch is only supported on Linux")]
    Unsupported,

    /// A listener id, subnet, or (iface, port) pair was registered twice.
    #[error("{0} is already registered")]
    AlreadyRegistered(String),

    /// No interface listener exists for the given id.
    #[error("no interface listener registered for id {0}")]
    NotFound(String),

    /// A subnet passed to `listen_config` had host bits set.
    #[error("subnet {given} is not masked, expected {expected}")]
    BadSubnet { given: Subnet, expected: Subnet },

    /// `InterfaceStorage` has no interface with this name.
    #[error("no such network interface: {0}")]
    InterfaceNotFound(String),

    /// A kernel socket option failed to apply.
    #[error("failed to set socket option {option}: {source}")]
    SocketSetupFailed {
        option: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The listener/connection/conn-limiter was already closed.
    #[error("closed")]
    Closed,

    /// A read or write deadline elapsed before the operation completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Ancillary control data on a received datagram was missing or malformed.
    #[error("expected 1 ctrl message, got {0}")]
    BadControlMessage(usize),

    /// Underlying I/O failure not covered by a more specific variant.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate's public surface.
pub type Result<T> = std::result::Result<T, Error>;

/// Sink for non-fatal errors surfaced from an `InterfaceListener`'s accept/read loops.
///
/// A plain `Fn` capability trait object rather than a named trait, matching this codebase's
/// `SocketFactory<S>: Fn(...) + Send + Sync` pattern for small collaborator interfaces that have
/// exactly one method.
pub type ErrorCollector = Arc<dyn Fn(Error) + Send + Sync>;

impl Error {
    pub(crate) fn already_registered(what: impl Into<String>) -> Self {
        Error::AlreadyRegistered(what.into())
    }
}

/// Emitted (but never returned) when a datagram or connection's original destination does not
/// match any registered virtual listener. Counted and logged by the caller; see
/// [`crate::manager::Manager`] and [`crate::interface_listener`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct DispatchMiss {
    pub local: SocketAddr,
}
