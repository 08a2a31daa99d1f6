//! Links and link addresses.  A link represents one network interface: it
//! owns the network-layer addresses configured on it, the address
//! translation cache for it, and the up/down state.  The engine's global
//! link list lock guards the list and the state flag; everything inside a
//! link is guarded by the link's own interior lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use netdefs::constants::{NetError, NetResult, LINK_PROPERTIES_VERSION};
use netdefs::data::{NetDomain, NetworkAddress, PacketSizeInformation};

use crate::mcast::LinkMulticastGroup;
use crate::registry::{DataLinkEntry, DeviceInterface, NetworkEntry};
use crate::NetCore;

/// The two entry points the engine consumes from the DHCP client.
pub trait DhcpClient: Send + Sync {
    /// Starts address assignment for a link address entry after its link
    /// came up.
    fn begin_assignment(&self, link: &Arc<Link>, entry: &Arc<LinkAddressEntry>) -> NetResult<()>;

    /// Tells the client its lease on an entry is gone (the link went down or
    /// the entry was removed).
    fn cancel_lease(&self, link: &Arc<Link>, entry: &Arc<LinkAddressEntry>) -> NetResult<()>;
}

/// A DHCP client that does nothing.  For engines using only static
/// addressing, and for tests.
pub struct NoopDhcp;

impl DhcpClient for NoopDhcp {
    fn begin_assignment(&self, _link: &Arc<Link>, _entry: &Arc<LinkAddressEntry>) -> NetResult<()> {
        Ok(())
    }

    fn cancel_lease(&self, _link: &Arc<Link>, _entry: &Arc<LinkAddressEntry>) -> NetResult<()> {
        Ok(())
    }
}

/// Everything a device driver declares about a new link.
pub struct LinkProperties {
    /// Structure version, currently [`LINK_PROPERTIES_VERSION`].
    pub version: u32,
    /// Required alignment of transmit buffers.  Zero defaults to one; any
    /// other value must be a power of two.
    pub transmit_alignment: usize,
    /// The device's hardware address.  Its domain selects the data link
    /// layer and must be a physical domain.
    pub physical_address: NetworkAddress,
    /// Highest device-visible address the hardware can reach.  Must be
    /// nonzero.
    pub max_physical_address: u64,
    /// Capability bits (`LINK_CAPABILITY_*`).
    pub capabilities: u32,
    /// The device's own header/footer reservations and size limits.
    pub packet_size_information: PacketSizeInformation,
    /// Identifier of the underlying device, used for interface selection.
    pub device_id: u64,
    /// The device's callbacks.
    pub interface: Arc<dyn DeviceInterface>,
}

/// The mutable configuration of one link address entry.  Guarded by the
/// entry's lock; taken while the owning link's interior lock is held or the
/// entry is otherwise pinned.
pub struct LinkAddressConfig {
    /// The network address, or the domain wildcard while unconfigured.
    pub address: NetworkAddress,
    /// The subnet mask.
    pub subnet: NetworkAddress,
    /// The default gateway.
    pub gateway: NetworkAddress,
    /// Name servers learned alongside the address.
    pub dns_servers: Vec<NetworkAddress>,
    /// Whether the entry currently holds a usable address.
    pub configured: bool,
    /// Statically configured entries survive link-down transitions.
    pub static_address: bool,
    /// The owning link's hardware address.
    pub physical_address: NetworkAddress,
    /// The DHCP server that granted the current lease, if any.
    pub lease_server: Option<NetworkAddress>,
    /// When the current lease began.
    pub lease_start: Option<SystemTime>,
    /// When the current lease expires.
    pub lease_end: Option<SystemTime>,
}

/// One network-layer address configuration hosted on a link.
pub struct LinkAddressEntry {
    config: Mutex<LinkAddressConfig>,
}

impl LinkAddressEntry {
    /// Locks and returns the entry's configuration.
    pub fn config(&self) -> MutexGuard<'_, LinkAddressConfig> {
        self.config.lock()
    }
}

/// A link plus one of its address entries and a local address on it; the
/// result of the route lookups and the local side of a bind.
#[derive(Clone)]
pub struct LinkLocalAddress {
    /// The link, if the address is tied to one.
    pub link: Option<Arc<Link>>,
    /// The address entry on that link.
    pub link_address: Option<Arc<LinkAddressEntry>>,
    /// The local network address.
    pub address: NetworkAddress,
}

pub(crate) struct LinkInner {
    pub address_entries: Vec<Arc<LinkAddressEntry>>,
    // Network address -> physical address, keyed with the port forced to
    // zero.
    pub translations: std::collections::BTreeMap<NetworkAddress, NetworkAddress>,
    pub multicast_groups: Vec<LinkMulticastGroup>,
    // Layers successfully attached, in attach order.  Unwound in reverse
    // when the link is destroyed.
    pub networks: Vec<Arc<NetworkEntry>>,
    pub data_link: Option<Arc<DataLinkEntry>>,
}

/// One network interface.
pub struct Link {
    properties: LinkProperties,
    link_up: AtomicBool,
    speed: AtomicU64,
    pub(crate) inner: Mutex<LinkInner>,
    // Pulsed (notify_all, no persistent state) whenever a new translation
    // lands in the cache.  Waiters re-check the cache by key.
    pub(crate) translation_event: Condvar,
}

impl Link {
    /// The properties the device registered with.
    pub fn properties(&self) -> &LinkProperties {
        &self.properties
    }

    /// Whether the link is currently up.
    pub fn is_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    /// The last reported link speed in bits per second.
    pub fn speed(&self) -> u64 {
        self.speed.load(Ordering::Relaxed)
    }

    pub(crate) fn data_link_entry(&self) -> Option<Arc<DataLinkEntry>> {
        self.inner.lock().data_link.clone()
    }

    /// Creates a new address entry on the link.  The entry starts configured
    /// only if an address, subnet, and gateway are all supplied.
    pub fn create_address_entry(
        &self,
        domain: NetDomain,
        address: Option<NetworkAddress>,
        subnet: Option<NetworkAddress>,
        gateway: Option<NetworkAddress>,
        static_address: bool,
    ) -> Arc<LinkAddressEntry> {
        let configured = address.is_some() && subnet.is_some() && gateway.is_some();
        let entry = Arc::new(LinkAddressEntry {
            config: Mutex::new(LinkAddressConfig {
                address: address.unwrap_or_else(|| NetworkAddress::any(domain)),
                subnet: subnet.unwrap_or_else(|| NetworkAddress::any(domain)),
                gateway: gateway.unwrap_or_else(|| NetworkAddress::any(domain)),
                dns_servers: Vec::new(),
                configured,
                static_address,
                physical_address: self.properties.physical_address,
                lease_server: None,
                lease_start: None,
                lease_end: None,
            }),
        });

        self.inner.lock().address_entries.push(entry.clone());
        entry
    }

    /// Finds the address entry matching a query address.  Wildcard queries
    /// compare port and domain only and are the only queries that match
    /// entries which are not yet configured.
    pub fn find_entry_for_address(
        &self,
        query: &NetworkAddress,
    ) -> Option<Arc<LinkAddressEntry>> {
        let any = query.is_unspecified();
        let inner = self.inner.lock();
        for entry in &inner.address_entries {
            let config = entry.config.lock();
            if !config.configured && !any {
                continue;
            }

            if any {
                if config.address.same_port_and_domain(query) {
                    return Some(entry.clone());
                }
            } else if config.address == *query {
                return Some(entry.clone());
            }
        }

        None
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        // The last reference can drop while the link is still nominally up
        // (a link never taken down before its engine went away).  Nothing
        // can reach the link anymore, so mark it down and proceed.
        self.link_up.store(false, Ordering::Release);
        let inner = self.inner.get_mut();

        // Only the built-in membership from link bring-up may remain; every
        // socket-owned membership holds a link reference and would have kept
        // the link alive.
        for group in &inner.multicast_groups {
            debug_assert_eq!(group.join_count, 1);
        }
        inner.multicast_groups.clear();

        // Pull the layers out before the callbacks; they take the link by
        // shared reference.
        let networks = std::mem::take(&mut inner.networks);
        let data_link = inner.data_link.take();
        for network in networks.iter().rev() {
            network.interface.destroy_link(self);
        }

        if let Some(data_link) = data_link {
            data_link.interface.destroy_link(self);
        }
    }
}

impl NetCore {
    /// Adds a link for a device.  Validates the properties, attaches the
    /// data link layer and every registered network layer, and publishes the
    /// link on the global list.  A layer failure detaches exactly the layers
    /// that had attached and reports the failure.
    pub fn add_link(&self, mut properties: LinkProperties) -> NetResult<Arc<Link>> {
        if properties.version != LINK_PROPERTIES_VERSION {
            return Err(NetError::VersionMismatch);
        }

        if !properties.physical_address.domain.is_physical()
            || properties.max_physical_address == 0
        {
            return Err(NetError::InvalidParameter);
        }

        if properties.transmit_alignment == 0 {
            properties.transmit_alignment = 1;
        }

        if !properties.transmit_alignment.is_power_of_two() {
            return Err(NetError::InvalidConfiguration);
        }

        let data_link = self
            .lookup_data_link(properties.physical_address.domain)
            .ok_or(NetError::NotSupported)?;

        let link = Arc::new(Link {
            properties,
            link_up: AtomicBool::new(false),
            speed: AtomicU64::new(0),
            inner: Mutex::new(LinkInner {
                address_entries: Vec::new(),
                translations: std::collections::BTreeMap::new(),
                multicast_groups: Vec::new(),
                networks: Vec::new(),
                data_link: None,
            }),
            translation_event: Condvar::new(),
        });

        data_link.interface.initialize_link(&link)?;
        link.inner.lock().data_link = Some(data_link);

        // Attach every network layer, recording each success so that a
        // failure (or eventual destruction) unwinds exactly the attached
        // layers in reverse.
        let networks: Vec<Arc<NetworkEntry>> = self.plugins.read().networks.clone();
        for network in networks {
            if let Err(error) = network.interface.initialize_link(&link) {
                warn!(
                    "netcore: network layer {:?} failed to attach to link {}: {}",
                    network.domain,
                    link.properties.device_id,
                    error
                );
                return Err(error);
            }

            link.inner.lock().networks.push(network);
        }

        info!(
            "netcore: link {} added ({})",
            link.properties.device_id, link.properties.physical_address
        );
        self.links.write().push(link.clone());
        Ok(link)
    }

    /// Takes a link down and removes it from the global list.  The caller's
    /// remaining references keep the link alive until they drop.
    pub fn remove_link(&self, link: &Arc<Link>) {
        self.set_link_state(link, false, 0);
        let mut links = self.links.write();
        if let Some(position) = links.iter().position(|entry| Arc::ptr_eq(entry, link)) {
            links.remove(position);
            info!("netcore: link {} removed", link.properties.device_id);
        }
    }

    /// Finds the link serving a device.
    pub fn lookup_link_by_device(&self, device_id: u64) -> Option<Arc<Link>> {
        self.links
            .read()
            .iter()
            .find(|link| link.properties.device_id == device_id)
            .cloned()
    }

    /// Moves a link up or down and records its speed.
    ///
    /// Coming up hands the first address entry to DHCP.  Going down flushes
    /// the translation cache, releases every translation waiter, detaches
    /// every socket bound to the link, and unconfigures every non-static
    /// address entry.
    pub fn set_link_state(&self, link: &Arc<Link>, up: bool, speed: u64) {
        {
            // The list lock serializes state flips themselves; the heavier
            // teardown below runs outside it.
            let _links = self.links.write();
            link.speed.store(speed, Ordering::Relaxed);
            if link.is_up() == up {
                return;
            }

            link.link_up.store(up, Ordering::Release);
        }

        info!(
            "netcore: link {} {}",
            link.properties.device_id,
            if up { "up" } else { "down" }
        );
        if up {
            let first_entry = link.inner.lock().address_entries.first().cloned();
            if let Some(entry) = first_entry {
                if let Err(error) = self.dhcp.begin_assignment(link, &entry) {
                    warn!(
                        "netcore: address assignment failed on link {}: {}",
                        link.properties.device_id, error
                    );
                }
            }

            return;
        }

        {
            let mut inner = link.inner.lock();
            inner.translations.clear();
            link.translation_event.notify_all();
        }

        self.detach_sockets(link, None);

        let mut cancelled = Vec::new();
        {
            let inner = link.inner.lock();
            for entry in &inner.address_entries {
                let mut config = entry.config.lock();
                if !config.configured || config.static_address {
                    continue;
                }

                let domain = config.address.domain;
                config.address = NetworkAddress::any(domain);
                config.subnet = NetworkAddress::any(domain);
                config.gateway = NetworkAddress::any(domain);
                config.dns_servers.clear();
                config.configured = false;
                cancelled.push(entry.clone());
            }
        }

        for entry in cancelled {
            let _ = self.dhcp.cancel_lease(link, &entry);
        }
    }

    /// Removes an address entry from a link, detaching the sockets bound
    /// through it.
    pub fn remove_link_address_entry(&self, link: &Arc<Link>, entry: &Arc<LinkAddressEntry>) {
        {
            let mut inner = link.inner.lock();
            if let Some(position) = inner
                .address_entries
                .iter()
                .position(|candidate| Arc::ptr_eq(candidate, entry))
            {
                inner.address_entries.remove(position);
            }
        }

        self.detach_sockets(link, Some(entry));
    }

    /// Finds a link and entry hosting the given local address.  With
    /// `any_address` set, any configured entry in the address's domain will
    /// do.  A link hint restricts the search to that link.
    pub fn find_link_for_local_address(
        &self,
        local_address: &NetworkAddress,
        any_address: bool,
        link_hint: Option<&Arc<Link>>,
    ) -> NetResult<LinkLocalAddress> {
        let query = if any_address {
            NetworkAddress::any(local_address.domain)
        } else {
            let mut query = *local_address;
            query.port = 0;
            query
        };

        let links = self.links.read();
        if links.is_empty() {
            return Err(NetError::NoNetworkConnection);
        }

        let mut result = None;
        if let Some(hint) = link_hint {
            if !hint.is_up() {
                return Err(NetError::NoNetworkConnection);
            }

            result = hint
                .find_entry_for_address(&query)
                .map(|entry| (hint.clone(), entry));
        } else {
            for link in links.iter() {
                if !link.is_up() {
                    continue;
                }

                if let Some(entry) = link.find_entry_for_address(&query) {
                    result = Some((link.clone(), entry));
                    break;
                }
            }
        }

        let (link, entry) = result.ok_or(NetError::NoNetworkConnection)?;
        Ok(LinkLocalAddress {
            link: Some(link),
            link_address: Some(entry),
            address: *local_address,
        })
    }

    /// Picks the link and local address to reach a remote address.  The
    /// remote port plays no part in the selection; callers zero it.
    pub fn find_link_for_remote_address(
        &self,
        remote_address: &NetworkAddress,
    ) -> NetResult<LinkLocalAddress> {
        debug_assert_eq!(remote_address.port, 0);

        // TODO: route on the remote address instead of taking the first
        // configured entry of the first link that is up.
        let links = self.links.read();
        for link in links.iter() {
            if !link.is_up() {
                continue;
            }

            let inner = link.inner.lock();
            for entry in &inner.address_entries {
                let config = entry.config.lock();
                if !config.configured || config.address.domain != remote_address.domain {
                    continue;
                }

                let address = config.address;
                drop(config);
                let entry = entry.clone();
                drop(inner);
                return Ok(LinkLocalAddress {
                    link: Some(link.clone()),
                    link_address: Some(entry),
                    address,
                });
            }
        }

        Err(NetError::NoNetworkConnection)
    }

    /// Records a network-to-physical address translation, overwriting any
    /// existing translation for the same network address.  A new entry
    /// pulses the link's translation event so waiting resolvers re-check.
    pub fn add_network_address_translation(
        &self,
        link: &Arc<Link>,
        network_address: &NetworkAddress,
        physical_address: &NetworkAddress,
    ) {
        let mut key = *network_address;
        key.port = 0;

        let mut inner = link.inner.lock();
        if let Some(existing) = inner.translations.get_mut(&key) {
            *existing = *physical_address;
            return;
        }

        debug!(
            "netcore: link {} learned {} -> {}",
            link.properties.device_id, key, physical_address
        );
        inner.translations.insert(key, *physical_address);
        link.translation_event.notify_all();
    }

    /// Resolves a network address to a physical address, blocking until the
    /// answer arrives or the translation deadline elapses.
    ///
    /// A cache miss sends one resolution request immediately and one more
    /// per retry interval.  Wakeups only ever mean "something was inserted",
    /// so the cache is re-checked by key every time around.
    pub fn translate_network_address(
        &self,
        link: &Arc<Link>,
        link_address: &Arc<LinkAddressEntry>,
        query: &NetworkAddress,
    ) -> NetResult<NetworkAddress> {
        let network = self
            .lookup_network(query.domain)
            .ok_or(NetError::NotSupported)?;

        let mut key = *query;
        key.port = 0;

        let mut deadline = None;
        let mut inner = link.inner.lock();
        loop {
            if let Some(physical) = inner.translations.get(&key) {
                return Ok(*physical);
            }

            let now = Instant::now();
            match deadline {
                None => {
                    deadline = Some(now + self.translation_timeout);
                    MutexGuard::unlocked(&mut inner, || {
                        network
                            .interface
                            .send_translation_request(link, link_address, query)
                    })?;
                    continue;
                }
                Some(deadline) if now >= deadline => {
                    debug!(
                        "netcore: translation of {} on link {} timed out",
                        key, link.properties.device_id
                    );
                    return Err(NetError::Timeout);
                }
                Some(_) => {}
            }

            let timed_out = link
                .translation_event
                .wait_for(&mut inner, self.translation_retry_interval)
                .timed_out();
            if timed_out {
                MutexGuard::unlocked(&mut inner, || {
                    network
                        .interface
                        .send_translation_request(link, link_address, query)
                })?;
            }
        }
    }
}
