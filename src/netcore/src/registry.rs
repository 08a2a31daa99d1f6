//! Registries for the three pluggable layers.  Protocols, network layers,
//! and data link layers register a vtable once at startup; the lists only
//! grow at runtime.  A single shared/exclusive lock covers all three lists,
//! taken shared for lookups and exclusive for registration.
//!
//! Each protocol entry additionally owns the binding trees and the one-entry
//! lookup cache for its sockets; those live behind the entry's own lock, not
//! the plugin list lock.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use netdefs::constants::{NetError, NetResult};
use netdefs::data::{NetDomain, NetworkAddress, PacketSizeInformation};

use crate::bufpool::PacketBuffer;
use crate::link::{Link, LinkAddressEntry};
use crate::socket::{NetSocket, NetSocketType, SocketTrees};
use crate::NetCore;

/// How a device should filter incoming multicast frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastFilterMode {
    /// No multicast reception beyond addressed frames.
    Disabled,
    /// Receive every multicast frame.
    AllMulticast,
    /// Receive every frame; used when the device cannot filter down to
    /// multicast traffic only.
    Promiscuous,
}

/// The interface a protocol implementation hands to the engine.
pub trait ProtocolInterface: Send + Sync {
    /// Hands an incoming packet to the socket the engine matched it to.
    fn process_received_data(
        &self,
        socket: &Arc<NetSocket>,
        packet: &mut PacketBuffer,
    ) -> NetResult<()>;
}

/// The interface a network layer (IPv4, IPv6, ARP, ...) hands to the engine.
pub trait NetworkInterface: Send + Sync {
    /// Attaches the layer to a newly arrived link.
    fn initialize_link(&self, link: &Arc<Link>) -> NetResult<()>;

    /// Detaches the layer from a link that is going away.
    fn destroy_link(&self, link: &Link);

    /// Prepares per-socket state for a new socket and reports the combined
    /// network and protocol header/footer contribution.
    fn initialize_socket(
        &self,
        socket_type: NetSocketType,
        protocol_number: u32,
    ) -> NetResult<PacketSizeInformation>;

    /// Sends a physical address resolution request (for example an ARP
    /// query) for the given address out the link.
    fn send_translation_request(
        &self,
        link: &Arc<Link>,
        link_address: &Arc<LinkAddressEntry>,
        query: &NetworkAddress,
    ) -> NetResult<()>;

    /// Whether the layer implements multicast group management.
    fn supports_multicast(&self) -> bool {
        false
    }

    /// Announces a multicast membership change to the network (for example
    /// via IGMP).  Only called when [`supports_multicast`] reports true.
    ///
    /// [`supports_multicast`]: NetworkInterface::supports_multicast
    fn join_leave_multicast_group(
        &self,
        link: &Arc<Link>,
        link_address: &Arc<LinkAddressEntry>,
        group: &NetworkAddress,
        join: bool,
    ) -> NetResult<()> {
        let _ = (link, link_address, group, join);
        Err(NetError::NotSupportedByProtocol)
    }
}

/// The interface a data link layer (Ethernet framing, ...) hands to the
/// engine.
pub trait DataLinkInterface: Send + Sync {
    /// Attaches the layer to a newly arrived link.
    fn initialize_link(&self, link: &Arc<Link>) -> NetResult<()>;

    /// Detaches the layer from a link that is going away.
    fn destroy_link(&self, link: &Link);

    /// The layer's header/footer contribution and size limits.
    fn packet_size_information(&self) -> PacketSizeInformation;

    /// The broadcast hardware address for the layer's domain.
    fn broadcast_address(&self) -> NetworkAddress;
}

/// The callbacks a device driver supplies with its link properties.
pub trait DeviceInterface: Send + Sync {
    /// Queues packets for transmission.
    fn send(&self, packets: Vec<PacketBuffer>) -> NetResult<()>;

    /// Reprograms the device's multicast filter.  The full group list is
    /// supplied on every call.
    fn set_multicast_filter(
        &self,
        mode: MulticastFilterMode,
        groups: &[NetworkAddress],
    ) -> NetResult<()>;
}

/// What a protocol supplies when registering.
pub struct ProtocolRegistration {
    /// The socket type the protocol serves.
    pub socket_type: NetSocketType,
    /// The protocol number within the parent network layer (for example the
    /// IP protocol number).
    pub parent_protocol_number: u32,
    /// The protocol's callbacks.
    pub interface: Arc<dyn ProtocolInterface>,
}

/// A registered protocol.  Owns the three binding trees and the one-entry
/// lookup cache for its sockets.
pub struct ProtocolEntry {
    /// The socket type the protocol serves.
    pub socket_type: NetSocketType,
    /// The protocol number within the parent network layer.
    pub parent_protocol_number: u32,
    /// The protocol's callbacks.
    pub interface: Arc<dyn ProtocolInterface>,
    pub(crate) sockets: RwLock<SocketTrees>,
    // Advisory cache of the last fully bound socket a receive lookup found.
    pub(crate) last_socket: Mutex<Option<Arc<NetSocket>>>,
}

/// What a network layer supplies when registering.
pub struct NetworkRegistration {
    /// The domain the layer handles.
    pub domain: NetDomain,
    /// The layer's protocol number within the data link layer (for example
    /// the Ethernet type).
    pub parent_protocol_number: u32,
    /// The layer's callbacks.
    pub interface: Arc<dyn NetworkInterface>,
}

/// A registered network layer.
pub struct NetworkEntry {
    /// The domain the layer handles.
    pub domain: NetDomain,
    /// The layer's protocol number within the data link layer.
    pub parent_protocol_number: u32,
    /// The layer's callbacks.
    pub interface: Arc<dyn NetworkInterface>,
}

/// What a data link layer supplies when registering.
pub struct DataLinkRegistration {
    /// The physical domain the layer frames for.
    pub domain: NetDomain,
    /// The layer's callbacks.
    pub interface: Arc<dyn DataLinkInterface>,
}

/// A registered data link layer.
pub struct DataLinkEntry {
    /// The physical domain the layer frames for.
    pub domain: NetDomain,
    /// The layer's callbacks.
    pub interface: Arc<dyn DataLinkInterface>,
}

#[derive(Default)]
pub(crate) struct PluginList {
    pub protocols: Vec<Arc<ProtocolEntry>>,
    pub networks: Vec<Arc<NetworkEntry>>,
    pub data_links: Vec<Arc<DataLinkEntry>>,
}

impl NetCore {
    /// Registers a protocol.  Fails with `DuplicateEntry` if a protocol with
    /// the same socket type and parent protocol number already exists.
    pub fn register_protocol(
        &self,
        registration: ProtocolRegistration,
    ) -> NetResult<Arc<ProtocolEntry>> {
        if registration.socket_type == NetSocketType::Invalid {
            return Err(NetError::InvalidParameter);
        }

        let mut plugins = self.plugins.write();
        let duplicate = plugins.protocols.iter().any(|entry| {
            entry.socket_type == registration.socket_type
                && entry.parent_protocol_number == registration.parent_protocol_number
        });

        if duplicate {
            return Err(NetError::DuplicateEntry);
        }

        let entry = Arc::new(ProtocolEntry {
            socket_type: registration.socket_type,
            parent_protocol_number: registration.parent_protocol_number,
            interface: registration.interface,
            sockets: RwLock::new(SocketTrees::default()),
            last_socket: Mutex::new(None),
        });

        plugins.protocols.push(entry.clone());
        Ok(entry)
    }

    /// Registers a network layer.  One layer per domain.
    pub fn register_network(
        &self,
        registration: NetworkRegistration,
    ) -> NetResult<Arc<NetworkEntry>> {
        if registration.domain == NetDomain::Invalid || registration.domain.is_physical() {
            return Err(NetError::InvalidParameter);
        }

        let mut plugins = self.plugins.write();
        if plugins
            .networks
            .iter()
            .any(|entry| entry.domain == registration.domain)
        {
            return Err(NetError::DuplicateEntry);
        }

        let entry = Arc::new(NetworkEntry {
            domain: registration.domain,
            parent_protocol_number: registration.parent_protocol_number,
            interface: registration.interface,
        });

        plugins.networks.push(entry.clone());
        Ok(entry)
    }

    /// Registers a data link layer.  One layer per physical domain.
    pub fn register_data_link(
        &self,
        registration: DataLinkRegistration,
    ) -> NetResult<Arc<DataLinkEntry>> {
        if !registration.domain.is_physical() {
            return Err(NetError::InvalidParameter);
        }

        let mut plugins = self.plugins.write();
        if plugins
            .data_links
            .iter()
            .any(|entry| entry.domain == registration.domain)
        {
            return Err(NetError::DuplicateEntry);
        }

        let entry = Arc::new(DataLinkEntry {
            domain: registration.domain,
            interface: registration.interface,
        });

        plugins.data_links.push(entry.clone());
        Ok(entry)
    }

    /// Finds the protocol registered for a socket type and parent protocol
    /// number.
    pub fn lookup_protocol(
        &self,
        socket_type: NetSocketType,
        parent_protocol_number: u32,
    ) -> Option<Arc<ProtocolEntry>> {
        self.plugins
            .read()
            .protocols
            .iter()
            .find(|entry| {
                entry.socket_type == socket_type
                    && entry.parent_protocol_number == parent_protocol_number
            })
            .cloned()
    }

    /// Finds the network layer registered for a domain.
    pub fn lookup_network(&self, domain: NetDomain) -> Option<Arc<NetworkEntry>> {
        self.plugins
            .read()
            .networks
            .iter()
            .find(|entry| entry.domain == domain)
            .cloned()
    }

    pub(crate) fn lookup_data_link(&self, domain: NetDomain) -> Option<Arc<DataLinkEntry>> {
        self.plugins
            .read()
            .data_links
            .iter()
            .find(|entry| entry.domain == domain)
            .cloned()
    }
}
