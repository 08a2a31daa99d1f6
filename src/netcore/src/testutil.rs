//! Shared fixtures for the unit tests: an engine with stub layers on every
//! seam, plus counters so tests can watch the engine drive each layer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use netdefs::constants::{
    NetError, NetResult, LINK_CAPABILITY_MULTICAST_ALL, LINK_CAPABILITY_PROMISCUOUS_MODE,
    LINK_PROPERTIES_VERSION,
};
use netdefs::data::{NetDomain, NetworkAddress, PacketSizeInformation};

use crate::bufpool::PacketBuffer;
use crate::link::{
    DhcpClient, Link, LinkAddressEntry, LinkLocalAddress, LinkProperties, NoopDhcp,
};
use crate::registry::{
    DataLinkInterface, DataLinkRegistration, DeviceInterface, MulticastFilterMode, NetworkEntry,
    NetworkInterface, NetworkRegistration, ProtocolEntry, ProtocolInterface, ProtocolRegistration,
};
use crate::socket::{NetSocket, NetSocketType};
use crate::NetCore;

#[derive(Default)]
pub struct TestProtocol {
    /// Socket ids handed packets, in arrival order.
    pub received: Mutex<Vec<u64>>,
}

impl ProtocolInterface for TestProtocol {
    fn process_received_data(
        &self,
        socket: &Arc<NetSocket>,
        _packet: &mut PacketBuffer,
    ) -> NetResult<()> {
        self.received.lock().push(socket.id());
        Ok(())
    }
}

#[derive(Default)]
pub struct TestNetwork {
    pub links_initialized: AtomicUsize,
    pub links_destroyed: AtomicUsize,
    pub translation_requests: AtomicUsize,
    pub multicast_joins: AtomicUsize,
    pub multicast_leaves: AtomicUsize,
    pub fail_multicast_announce: AtomicBool,
    fail_attach: bool,
}

impl TestNetwork {
    /// A layer whose link attach always fails.
    pub fn failing_attach() -> TestNetwork {
        TestNetwork {
            fail_attach: true,
            ..TestNetwork::default()
        }
    }
}

impl NetworkInterface for TestNetwork {
    fn initialize_link(&self, _link: &Arc<Link>) -> NetResult<()> {
        if self.fail_attach {
            return Err(NetError::InsufficientResources);
        }

        self.links_initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy_link(&self, _link: &Link) {
        self.links_destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn initialize_socket(
        &self,
        _socket_type: NetSocketType,
        _protocol_number: u32,
    ) -> NetResult<PacketSizeInformation> {
        Ok(PacketSizeInformation {
            header_size: 28,
            footer_size: 0,
            max_packet_size: 0,
            min_packet_size: 0,
        })
    }

    fn send_translation_request(
        &self,
        _link: &Arc<Link>,
        _link_address: &Arc<LinkAddressEntry>,
        _query: &NetworkAddress,
    ) -> NetResult<()> {
        self.translation_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn supports_multicast(&self) -> bool {
        true
    }

    fn join_leave_multicast_group(
        &self,
        _link: &Arc<Link>,
        _link_address: &Arc<LinkAddressEntry>,
        _group: &NetworkAddress,
        join: bool,
    ) -> NetResult<()> {
        if self.fail_multicast_announce.load(Ordering::SeqCst) {
            return Err(NetError::NotHandled);
        }

        if join {
            self.multicast_joins.fetch_add(1, Ordering::SeqCst);
        } else {
            self.multicast_leaves.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }
}

#[derive(Default)]
pub struct TestDataLink;

impl DataLinkInterface for TestDataLink {
    fn initialize_link(&self, _link: &Arc<Link>) -> NetResult<()> {
        Ok(())
    }

    fn destroy_link(&self, _link: &Link) {}

    fn packet_size_information(&self) -> PacketSizeInformation {
        PacketSizeInformation {
            header_size: 14,
            footer_size: 0,
            max_packet_size: 1514,
            min_packet_size: 0,
        }
    }

    fn broadcast_address(&self) -> NetworkAddress {
        NetworkAddress::ethernet([0xff; 6])
    }
}

#[derive(Default)]
pub struct TestDevice {
    /// Packet counts of each transmit call.
    pub sent: Mutex<Vec<usize>>,
    pub filter_updates: AtomicUsize,
    pub fail_filter: AtomicBool,
    pub last_filter: Mutex<Option<(MulticastFilterMode, Vec<NetworkAddress>)>>,
}

impl DeviceInterface for TestDevice {
    fn send(&self, packets: Vec<PacketBuffer>) -> NetResult<()> {
        self.sent.lock().push(packets.len());
        Ok(())
    }

    fn set_multicast_filter(
        &self,
        mode: MulticastFilterMode,
        groups: &[NetworkAddress],
    ) -> NetResult<()> {
        if self.fail_filter.load(Ordering::SeqCst) {
            return Err(NetError::NotHandled);
        }

        self.filter_updates.fetch_add(1, Ordering::SeqCst);
        *self.last_filter.lock() = Some((mode, groups.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct TestDhcp {
    pub assignments: AtomicUsize,
    pub cancellations: AtomicUsize,
}

impl DhcpClient for TestDhcp {
    fn begin_assignment(&self, _link: &Arc<Link>, _entry: &Arc<LinkAddressEntry>) -> NetResult<()> {
        self.assignments.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cancel_lease(&self, _link: &Arc<Link>, _entry: &Arc<LinkAddressEntry>) -> NetResult<()> {
        self.cancellations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn test_core() -> NetCore {
    NetCore::new(Arc::new(NoopDhcp))
}

pub fn register_test_data_link(core: &NetCore) {
    core.register_data_link(DataLinkRegistration {
        domain: NetDomain::Ethernet,
        interface: Arc::new(TestDataLink),
    })
    .unwrap();
}

pub fn register_test_network(
    core: &NetCore,
    interface: Arc<TestNetwork>,
) -> NetResult<Arc<NetworkEntry>> {
    core.register_network(NetworkRegistration {
        domain: NetDomain::Ip4,
        parent_protocol_number: 0x0800,
        interface,
    })
}

pub fn register_test_protocol(
    core: &NetCore,
    socket_type: NetSocketType,
    parent_protocol_number: u32,
) -> NetResult<Arc<ProtocolEntry>> {
    core.register_protocol(ProtocolRegistration {
        socket_type,
        parent_protocol_number,
        interface: Arc::new(TestProtocol::default()),
    })
}

pub fn install_test_layers(core: &NetCore) {
    register_test_data_link(core);
    register_test_network(core, Arc::new(TestNetwork::default())).unwrap();
}

pub fn test_core_with_layers() -> NetCore {
    let core = test_core();
    install_test_layers(&core);
    core
}

pub fn test_link_properties(device: Arc<TestDevice>, device_id: u64) -> LinkProperties {
    LinkProperties {
        version: LINK_PROPERTIES_VERSION,
        transmit_alignment: 4,
        physical_address: NetworkAddress::ethernet([2, 0, 0, 0, 0, device_id as u8]),
        max_physical_address: 0xffff_ffff,
        capabilities: LINK_CAPABILITY_PROMISCUOUS_MODE | LINK_CAPABILITY_MULTICAST_ALL,
        packet_size_information: PacketSizeInformation {
            header_size: 0,
            footer_size: 0,
            max_packet_size: 1514,
            min_packet_size: 0,
        },
        device_id,
        interface: device,
    }
}

pub fn add_test_link(core: &NetCore, device_id: u64) -> Arc<Link> {
    core.add_link(test_link_properties(
        Arc::new(TestDevice::default()),
        device_id,
    ))
    .unwrap()
}

pub fn configure_test_entry(link: &Link, octets: [u8; 4]) -> Arc<LinkAddressEntry> {
    link.create_address_entry(
        NetDomain::Ip4,
        Some(NetworkAddress::ip4(octets, 0)),
        Some(NetworkAddress::ip4([255, 255, 255, 0], 0)),
        Some(NetworkAddress::ip4([octets[0], octets[1], octets[2], 254], 0)),
        false,
    )
}

pub fn local_info(
    link: &Arc<Link>,
    entry: &Arc<LinkAddressEntry>,
    address: NetworkAddress,
) -> LinkLocalAddress {
    LinkLocalAddress {
        link: Some(link.clone()),
        link_address: Some(entry.clone()),
        address,
    }
}
