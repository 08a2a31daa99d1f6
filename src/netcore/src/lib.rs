//! The netcore engine: the canonical set of network links, link addresses,
//! and sockets, together with the machinery that ties them to each other.
//! Protocol implementations (TCP, UDP, raw sockets) sit above this crate and
//! drive it through the binding, lookup, and translation operations; device
//! drivers sit below it and surface as links.  The engine itself never
//! touches wire formats.
//!
//! Everything hangs off a [`NetCore`] instance.  There is no global state:
//! the registries, the link list, the raw socket list, and the packet buffer
//! pool are all owned by the instance, so several independent engines can
//! coexist (which is also what makes the engine testable without a kernel).
//!
//! Locking follows a fixed hierarchy: the global link list lock, then a
//! link's interior lock, then a protocol's socket lock, with the raw socket
//! list lock, per-socket multicast locks, and the buffer pool lock as
//! independent leaves.  Cross-protocol sweeps acquire one protocol's lock at
//! a time and fully release it before moving on.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use netdefs::constants::{TRANSLATION_RETRY_INTERVAL, TRANSLATION_TIMEOUT};

pub mod bufpool;
pub mod link;
pub mod mcast;
pub mod registry;
pub mod socket;

#[cfg(test)]
pub(crate) mod testutil;

pub use bufpool::PacketBuffer;
pub use link::{DhcpClient, Link, LinkAddressEntry, LinkLocalAddress, LinkProperties, NoopDhcp};
pub use mcast::MulticastRequest;
pub use registry::{
    DataLinkEntry, DataLinkInterface, DataLinkRegistration, DeviceInterface, MulticastFilterMode,
    NetworkEntry, NetworkInterface, NetworkRegistration, ProtocolEntry, ProtocolInterface,
    ProtocolRegistration,
};
pub use socket::{BindingType, NetSocket, NetSocketType};

use bufpool::BufferPool;
use registry::PluginList;

/// One instance of the networking engine.  Owns the plugin registries, the
/// link list, the raw socket list, and the packet buffer pool.
pub struct NetCore {
    pub(crate) plugins: RwLock<PluginList>,
    pub(crate) links: RwLock<Vec<Arc<Link>>>,
    pub(crate) raw_sockets: Mutex<Vec<Arc<NetSocket>>>,
    pub(crate) buffer_pool: BufferPool,
    pub(crate) dhcp: Arc<dyn DhcpClient>,
    pub(crate) translation_timeout: Duration,
    pub(crate) translation_retry_interval: Duration,
    pub(crate) next_socket_id: AtomicU64,
}

impl NetCore {
    /// Creates an engine with no links or registrations.  Address assignment
    /// on link-up is handed to the given DHCP client; pass [`NoopDhcp`] when
    /// only static addressing is in play.
    pub fn new(dhcp: Arc<dyn DhcpClient>) -> NetCore {
        NetCore {
            plugins: RwLock::new(PluginList::default()),
            links: RwLock::new(Vec::new()),
            raw_sockets: Mutex::new(Vec::new()),
            buffer_pool: BufferPool::new(),
            dhcp,
            translation_timeout: TRANSLATION_TIMEOUT,
            translation_retry_interval: TRANSLATION_RETRY_INTERVAL,
            next_socket_id: AtomicU64::new(1),
        }
    }

    /// Overrides the address translation deadline and retry interval.  Must
    /// be called before the engine is shared.
    pub fn set_translation_timing(&mut self, timeout: Duration, retry_interval: Duration) {
        self.translation_timeout = timeout;
        self.translation_retry_interval = retry_interval;
    }

    /// Takes every link down and removes it, detaching all bound sockets.
    /// After this the engine holds no link references.
    pub fn shutdown(&self) {
        let links: Vec<Arc<Link>> = self.links.read().clone();
        for link in &links {
            self.remove_link(link);
        }
    }
}
