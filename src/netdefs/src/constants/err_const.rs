//! Status codes returned by the netcore engine.  Every externally callable
//! operation reports one of these; internal helpers (comparators, key
//! builders) are total functions and never fail.

use std::error::Error;
use std::fmt;

/// The status codes the engine and the layer interfaces report.  Grouped by
/// kind: validation, exhaustion, conflict, connectivity, timeout, and
/// not-found/unsupported.  Conflict errors never mutate the conflicting
/// entity; connectivity errors may be accompanied by a proactive socket
/// detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetError {
    /// A caller-supplied argument or state transition is not valid.
    InvalidParameter,
    /// A registered structure's version field is not supported.
    VersionMismatch,
    /// Supplied properties are internally inconsistent (for example a
    /// transmit alignment that is not a power of two).
    InvalidConfiguration,
    /// An allocation failed or an address-limited allocation could not be
    /// satisfied.
    InsufficientResources,
    /// The ephemeral port range is exhausted.
    ResourceInUse,
    /// The requested local address/port is already owned by another socket
    /// and the reuse policy does not permit sharing it.
    AddressInUse,
    /// A registration with the same key already exists.
    DuplicateEntry,
    /// The socket already has a remote connection.
    ConnectionExists,
    /// No usable link exists (or the selected link is down).
    NoNetworkConnection,
    /// No link matches the requested interface.
    NoSuchDevice,
    /// The address resolution deadline elapsed without an answer.
    Timeout,
    /// No matching entry was found.
    NotFound,
    /// No registered layer handles the request.
    NotSupported,
    /// The network layer does not implement the requested operation.
    NotSupportedByProtocol,
    /// The packet or request was not consumed by any handler.
    NotHandled,
    /// The supplied address does not name a known entity.
    InvalidAddress,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            NetError::InvalidParameter => "invalid parameter",
            NetError::VersionMismatch => "version mismatch",
            NetError::InvalidConfiguration => "invalid configuration",
            NetError::InsufficientResources => "insufficient resources",
            NetError::ResourceInUse => "resource in use",
            NetError::AddressInUse => "address in use",
            NetError::DuplicateEntry => "duplicate entry",
            NetError::ConnectionExists => "connection exists",
            NetError::NoNetworkConnection => "no network connection",
            NetError::NoSuchDevice => "no such device",
            NetError::Timeout => "timed out",
            NetError::NotFound => "not found",
            NetError::NotSupported => "not supported",
            NetError::NotSupportedByProtocol => "not supported by protocol",
            NetError::NotHandled => "not handled",
            NetError::InvalidAddress => "invalid address",
        };
        f.write_str(description)
    }
}

impl Error for NetError {}

/// The result type used throughout the engine.
pub type NetResult<T> = Result<T, NetError>;
