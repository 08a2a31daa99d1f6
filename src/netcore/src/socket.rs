//! Sockets and the binding state machine.  Each protocol owns three trees,
//! unbound (port only), locally bound (concrete local address), and fully
//! bound (local plus remote), and the engine keeps a flat list for raw
//! sockets.  A socket's binding type always names the tree that currently
//! holds it, and the tree's clone of the socket is the reference that keeps
//! a bound socket alive.
//!
//! The trees key on the address total order with the socket id as the final
//! tie-break, so sockets sharing an address under the reuse policy sit on
//! adjacent keys and a range scan visits exactly the candidates a
//! closest-match walk would.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use log::debug;
use parking_lot::Mutex;

use netdefs::constants::{
    NetError, NetResult, BIND_FLAG_ACTIVATE, BIND_FLAG_NO_PORT_ASSIGNMENT, EPHEMERAL_PORT_BEGIN,
    EPHEMERAL_PORT_COUNT, POLL_EVENT_DISCONNECTED, SOCKET_FLAG_ACTIVE,
    SOCKET_FLAG_FORKED_LISTENER, SOCKET_FLAG_MULTICAST_LOOPBACK, SOCKET_FLAG_PREVIOUSLY_ACTIVE,
    SOCKET_FLAG_REUSE_ANY_ADDRESS, SOCKET_FLAG_REUSE_EXACT_ADDRESS, SOCKET_FLAG_REUSE_TIME_WAIT,
    SOCKET_FLAG_TIME_WAIT,
};
use netdefs::data::{NetDomain, NetworkAddress, PacketSizeInformation, MAX_NETWORK_ADDRESS_SIZE};

use crate::bufpool::PacketBuffer;
use crate::link::{Link, LinkAddressEntry, LinkLocalAddress};
use crate::mcast::SocketMulticastState;
use crate::registry::{NetworkEntry, ProtocolEntry};
use crate::NetCore;

/// The kind of socket a protocol serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetSocketType {
    /// Not a valid type; rejects registration.
    Invalid,
    /// Connectionless, message-oriented sockets.
    Datagram,
    /// Sockets that see network-layer packets directly.  Raw sockets never
    /// enter the binding trees and carry no ports.
    Raw,
    /// Connection-oriented byte stream sockets.
    Stream,
}

/// Where a socket stands in the binding state machine.  The order matters:
/// apart from disconnect and deactivation, a socket only ever moves to a
/// more-bound state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BindingType {
    /// Not bound at all; in no tree.
    Invalid,
    /// Holds a local port but no local address or link.
    Unbound,
    /// Holds a concrete local address, usually with a link.
    LocallyBound,
    /// Holds local and remote addresses; a unique five-tuple.
    FullyBound,
}

pub(crate) type SocketId = u64;

/// The binding-relevant mutable state of a socket.  Guarded by the socket's
/// state lock; bound sockets are only mutated under the owning protocol's
/// socket lock (or the raw list lock) as well.
pub(crate) struct SocketBindingState {
    pub binding_type: BindingType,
    pub local_address: NetworkAddress,
    pub remote_address: NetworkAddress,
    pub link: Option<Arc<Link>>,
    pub link_address: Option<Arc<LinkAddressEntry>>,
    pub packet_size: PacketSizeInformation,
}

/// One socket as the engine sees it.  Protocol implementations wrap this in
/// their own per-socket structures.
pub struct NetSocket {
    pub(crate) id: SocketId,
    /// The protocol serving the socket.
    pub protocol: Arc<ProtocolEntry>,
    /// The network layer serving the socket.
    pub network: Arc<NetworkEntry>,
    flags: AtomicU32,
    last_error: Mutex<Option<NetError>>,
    io_events: AtomicU32,
    pub(crate) state: Mutex<SocketBindingState>,
    pub(crate) multicast: OnceLock<Mutex<SocketMulticastState>>,
    pub(crate) unbound_packet_size: PacketSizeInformation,
}

impl NetSocket {
    /// A stable identifier, unique within the owning engine.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The current flag word (`SOCKET_FLAG_*`).
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::SeqCst)
    }

    /// Atomically ORs flags in.
    pub fn set_flags(&self, mask: u32) -> u32 {
        self.flags.fetch_or(mask, Ordering::SeqCst)
    }

    /// Atomically clears flags.
    pub fn clear_flags(&self, mask: u32) -> u32 {
        self.flags.fetch_and(!mask, Ordering::SeqCst)
    }

    /// Returns and clears the last asynchronous error recorded on the
    /// socket.
    pub fn take_last_error(&self) -> Option<NetError> {
        self.last_error.lock().take()
    }

    pub(crate) fn set_last_error(&self, error: NetError) {
        *self.last_error.lock() = Some(error);
    }

    /// Poll-style readiness events signaled on the socket
    /// (`POLL_EVENT_*`).
    pub fn io_events(&self) -> u32 {
        self.io_events.load(Ordering::SeqCst)
    }

    pub(crate) fn signal_io(&self, events: u32) {
        self.io_events.fetch_or(events, Ordering::SeqCst);
    }

    /// Where the socket stands in the binding state machine.
    pub fn binding_type(&self) -> BindingType {
        self.state.lock().binding_type
    }

    /// The socket's local address.
    pub fn local_address(&self) -> NetworkAddress {
        self.state.lock().local_address
    }

    /// The socket's remote address.
    pub fn remote_address(&self) -> NetworkAddress {
        self.state.lock().remote_address
    }

    /// The link the socket is bound through, if any.
    pub fn link(&self) -> Option<Arc<Link>> {
        self.state.lock().link.clone()
    }

    /// The header/footer reservations and size limits in effect for the
    /// socket's current binding.
    pub fn packet_size_information(&self) -> PacketSizeInformation {
        self.state.lock().packet_size
    }

    pub(crate) fn is_raw(&self) -> bool {
        self.protocol.socket_type == NetSocketType::Raw
    }
}

#[derive(Default)]
pub(crate) struct SocketTrees {
    pub unbound: BTreeMap<UnboundKey, Arc<NetSocket>>,
    pub locally_bound: BTreeMap<LocallyBoundKey, Arc<NetSocket>>,
    pub fully_bound: BTreeMap<FullyBoundKey, Arc<NetSocket>>,
}

// Netlink is the highest domain; used to build range bounds.
fn min_address() -> NetworkAddress {
    NetworkAddress::any(NetDomain::Invalid)
}

fn max_address() -> NetworkAddress {
    NetworkAddress {
        domain: NetDomain::Netlink,
        port: u32::MAX,
        address: [0xff; MAX_NETWORK_ADDRESS_SIZE],
    }
}

/// Key of the unbound tree: local port and domain only.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct UnboundKey {
    port: u32,
    domain: NetDomain,
    id: SocketId,
}

impl UnboundKey {
    fn bracket(port: u32, domain: NetDomain) -> std::ops::RangeInclusive<UnboundKey> {
        UnboundKey { port, domain, id: 0 }..=UnboundKey {
            port,
            domain,
            id: SocketId::MAX,
        }
    }
}

/// Key of the locally bound tree: the full local address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct LocallyBoundKey {
    local: NetworkAddress,
    id: SocketId,
}

impl LocallyBoundKey {
    fn bracket(port: u32, domain: NetDomain) -> std::ops::RangeInclusive<LocallyBoundKey> {
        let mut low = NetworkAddress::any(domain);
        low.port = port;
        let mut high = low;
        high.address = [0xff; MAX_NETWORK_ADDRESS_SIZE];
        LocallyBoundKey { local: low, id: 0 }..=LocallyBoundKey {
            local: high,
            id: SocketId::MAX,
        }
    }

    fn exact(local: &NetworkAddress) -> std::ops::RangeInclusive<LocallyBoundKey> {
        LocallyBoundKey {
            local: *local,
            id: 0,
        }..=LocallyBoundKey {
            local: *local,
            id: SocketId::MAX,
        }
    }
}

/// Key of the fully bound tree: local port and domain, then the remote
/// address, then the local address payload.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct FullyBoundKey {
    local_port: u32,
    local_domain: NetDomain,
    remote: NetworkAddress,
    local_payload: [u8; MAX_NETWORK_ADDRESS_SIZE],
    id: SocketId,
}

impl FullyBoundKey {
    fn new(local: &NetworkAddress, remote: &NetworkAddress, id: SocketId) -> FullyBoundKey {
        FullyBoundKey {
            local_port: local.port,
            local_domain: local.domain,
            remote: *remote,
            local_payload: local.address,
            id,
        }
    }

    fn bracket(port: u32, domain: NetDomain) -> std::ops::RangeInclusive<FullyBoundKey> {
        FullyBoundKey {
            local_port: port,
            local_domain: domain,
            remote: min_address(),
            local_payload: [0; MAX_NETWORK_ADDRESS_SIZE],
            id: 0,
        }..=FullyBoundKey {
            local_port: port,
            local_domain: domain,
            remote: max_address(),
            local_payload: [0xff; MAX_NETWORK_ADDRESS_SIZE],
            id: SocketId::MAX,
        }
    }

    fn exact(
        local: &NetworkAddress,
        remote: &NetworkAddress,
    ) -> std::ops::RangeInclusive<FullyBoundKey> {
        FullyBoundKey::new(local, remote, 0)..=FullyBoundKey::new(local, remote, SocketId::MAX)
    }
}

enum TreeKey {
    Unbound(UnboundKey),
    Local(LocallyBoundKey),
    Full(FullyBoundKey),
}

fn tree_key(state: &SocketBindingState, id: SocketId) -> Option<TreeKey> {
    match state.binding_type {
        BindingType::Invalid => None,
        BindingType::Unbound => Some(TreeKey::Unbound(UnboundKey {
            port: state.local_address.port,
            domain: state.local_address.domain,
            id,
        })),
        BindingType::LocallyBound => Some(TreeKey::Local(LocallyBoundKey {
            local: state.local_address,
            id,
        })),
        BindingType::FullyBound => Some(TreeKey::Full(FullyBoundKey::new(
            &state.local_address,
            &state.remote_address,
            id,
        ))),
    }
}

fn remove_tree(trees: &mut SocketTrees, key: &TreeKey) -> Option<Arc<NetSocket>> {
    match key {
        TreeKey::Unbound(key) => trees.unbound.remove(key),
        TreeKey::Local(key) => trees.locally_bound.remove(key),
        TreeKey::Full(key) => trees.fully_bound.remove(key),
    }
}

fn insert_tree(trees: &mut SocketTrees, key: TreeKey, socket: Arc<NetSocket>) {
    match key {
        TreeKey::Unbound(key) => {
            trees.unbound.insert(key, socket);
        }
        TreeKey::Local(key) => {
            trees.locally_bound.insert(key, socket);
        }
        TreeKey::Full(key) => {
            trees.fully_bound.insert(key, socket);
        }
    }
}

fn compute_packet_size(socket: &NetSocket, link: Option<&Arc<Link>>) -> PacketSizeInformation {
    let mut sizes = socket.unbound_packet_size;
    if let Some(link) = link {
        if let Some(data_link) = link.data_link_entry() {
            sizes.layer_on(&data_link.interface.packet_size_information());
        }

        sizes.layer_on(&link.properties().packet_size_information);
    }

    sizes
}

/// Decides whether a candidate may take `local_address`, walking all three
/// trees.  Returns the verdict plus the keys of any time-wait sockets whose
/// eviction the reuse policy authorized; the caller evicts them once the
/// walk is over, whatever the verdict, mirroring the walk-then-remove
/// discipline the trees require.
fn check_local_address_availability(
    trees: &SocketTrees,
    candidate_flags: u32,
    local_address: &NetworkAddress,
) -> (bool, Vec<FullyBoundKey>) {
    let unspecified = local_address.is_unspecified();
    let mut evictions = Vec::new();
    let port = local_address.port;
    let domain = local_address.domain;

    for (key, other) in trees.fully_bound.range(FullyBoundKey::bracket(port, domain)) {
        let other_flags = other.flags();
        if unspecified {
            if candidate_flags & SOCKET_FLAG_REUSE_ANY_ADDRESS == 0
                || other_flags & SOCKET_FLAG_REUSE_ANY_ADDRESS == 0
            {
                return (false, evictions);
            }
        } else if key.local_payload == local_address.address {
            if candidate_flags & SOCKET_FLAG_REUSE_EXACT_ADDRESS != 0
                && other_flags & SOCKET_FLAG_REUSE_EXACT_ADDRESS != 0
            {
                continue;
            }

            let reusable_time_wait = other_flags & SOCKET_FLAG_TIME_WAIT != 0
                && candidate_flags & SOCKET_FLAG_REUSE_TIME_WAIT != 0
                && other_flags & SOCKET_FLAG_REUSE_TIME_WAIT != 0;
            if reusable_time_wait {
                evictions.push(*key);
            } else {
                return (false, evictions);
            }
        }
    }

    for (key, other) in trees
        .locally_bound
        .range(LocallyBoundKey::bracket(port, domain))
    {
        let other_flags = other.flags();
        if unspecified {
            if candidate_flags & SOCKET_FLAG_REUSE_ANY_ADDRESS == 0
                || other_flags & SOCKET_FLAG_REUSE_ANY_ADDRESS == 0
            {
                return (false, evictions);
            }
        } else if key.local.address == local_address.address
            && (candidate_flags & SOCKET_FLAG_REUSE_EXACT_ADDRESS == 0
                || other_flags & SOCKET_FLAG_REUSE_EXACT_ADDRESS == 0)
        {
            return (false, evictions);
        }
    }

    for (_, other) in trees.unbound.range(UnboundKey::bracket(port, domain)) {
        let other_flags = other.flags();
        if unspecified {
            // Deliberately the exact-address flag: unbound sockets share a
            // port without any local address context.
            if candidate_flags & SOCKET_FLAG_REUSE_EXACT_ADDRESS == 0
                || other_flags & SOCKET_FLAG_REUSE_EXACT_ADDRESS == 0
            {
                return (false, evictions);
            }
        } else if candidate_flags & SOCKET_FLAG_REUSE_ANY_ADDRESS == 0
            || other_flags & SOCKET_FLAG_REUSE_ANY_ADDRESS == 0
        {
            return (false, evictions);
        }
    }

    (true, evictions)
}

fn matches_fully_bound(
    socket: &NetSocket,
    local_address: &NetworkAddress,
    remote_address: &NetworkAddress,
) -> bool {
    let state = socket.state.lock();
    state.binding_type == BindingType::FullyBound
        && state.local_address == *local_address
        && state.remote_address == *remote_address
}

fn socket_on_link(
    socket: &NetSocket,
    link: &Arc<Link>,
    entry: Option<&Arc<LinkAddressEntry>>,
) -> bool {
    let state = socket.state.lock();
    let bound_link = match &state.link {
        Some(bound_link) => bound_link,
        None => return false,
    };

    if !Arc::ptr_eq(bound_link, link) {
        return false;
    }

    match entry {
        None => true,
        Some(entry) => state
            .link_address
            .as_ref()
            .map_or(false, |bound| Arc::ptr_eq(bound, entry)),
    }
}

impl NetCore {
    /// Creates a socket against a (network, protocol) pair.  The socket
    /// starts invalid (unbound) with multicast loopback enabled.
    pub fn create_socket(
        &self,
        domain: NetDomain,
        socket_type: NetSocketType,
        protocol_number: u32,
    ) -> NetResult<Arc<NetSocket>> {
        let network = self.lookup_network(domain).ok_or(NetError::NotSupported)?;
        let protocol = self
            .lookup_protocol(socket_type, protocol_number)
            .ok_or(NetError::NotSupported)?;
        let unbound_packet_size = network
            .interface
            .initialize_socket(socket_type, protocol_number)?;

        Ok(Arc::new(NetSocket {
            id: self.next_socket_id.fetch_add(1, Ordering::Relaxed),
            protocol,
            network,
            flags: AtomicU32::new(SOCKET_FLAG_MULTICAST_LOOPBACK),
            last_error: Mutex::new(None),
            io_events: AtomicU32::new(0),
            state: Mutex::new(SocketBindingState {
                binding_type: BindingType::Invalid,
                local_address: NetworkAddress::any(domain),
                remote_address: NetworkAddress::any(domain),
                link: None,
                link_address: None,
                packet_size: unbound_packet_size,
            }),
            multicast: OnceLock::new(),
            unbound_packet_size,
        }))
    }

    /// Binds a socket: moves it to `target` in the state machine, assigning
    /// a port and placing it in the matching tree.
    ///
    /// Going fully bound without local link information routes the remote
    /// address first (an implicit locally-bound step).  The `flags` are the
    /// `BIND_FLAG_*` values.  On failure the socket keeps its previous
    /// binding, except that binding onto a link that went down detaches the
    /// socket entirely and reports `NoNetworkConnection`.
    pub fn bind_socket(
        &self,
        socket: &Arc<NetSocket>,
        target: BindingType,
        local: Option<&LinkLocalAddress>,
        remote: Option<&NetworkAddress>,
        flags: u32,
    ) -> NetResult<()> {
        if target == BindingType::Invalid {
            return Err(NetError::InvalidParameter);
        }

        let remote = remote.copied();
        if target == BindingType::FullyBound && remote.is_none() {
            return Err(NetError::InvalidParameter);
        }

        let routed;
        let local = match local {
            Some(local) => local,
            None => {
                let mut search = match remote {
                    Some(remote) if target == BindingType::FullyBound => remote,
                    _ => return Err(NetError::InvalidParameter),
                };

                // The remote port plays no part in route selection.
                search.port = 0;
                routed = self.find_link_for_remote_address(&search)?;
                &routed
            }
        };

        if socket.is_raw() {
            return self.bind_raw_socket(socket, target, local, remote.as_ref(), flags);
        }

        let protocol = socket.protocol.clone();
        let mut trees = protocol.sockets.write();
        let mut state = socket.state.lock();
        let forked = socket.flags() & SOCKET_FLAG_FORKED_LISTENER != 0;

        if !forked && state.binding_type != BindingType::Invalid {
            if target < state.binding_type
                || (target == state.binding_type && target != BindingType::FullyBound)
            {
                return Err(NetError::InvalidParameter);
            }

            if state.local_address.port != local.address.port
                && state.local_address.port != 0
                && local.address.port != 0
            {
                return Err(NetError::InvalidParameter);
            }

            if let (Some(bound_link), Some(requested_link)) = (&state.link, &local.link) {
                let entry_differs = match (&state.link_address, &local.link_address) {
                    (Some(bound), Some(requested)) => !Arc::ptr_eq(bound, requested),
                    _ => false,
                };
                if !Arc::ptr_eq(bound_link, requested_link) || entry_differs {
                    return Err(NetError::InvalidParameter);
                }
            }
        }

        // Pull the socket out of its current tree; restored below if the
        // rest of the bind fails.
        let removed = tree_key(&state, socket.id).map(|key| {
            let node = remove_tree(&mut trees, &key);
            debug_assert!(node.is_some());
            (key, node.unwrap_or_else(|| socket.clone()))
        });

        let result = self.bind_locked(
            &protocol,
            &mut trees,
            socket,
            &mut state,
            target,
            local,
            remote.as_ref(),
            flags,
        );
        if let Err(error) = result {
            // The link-down path already detached the socket; every other
            // failure restores the original tree position.
            if error != NetError::NoNetworkConnection {
                if let Some((key, node)) = removed {
                    insert_tree(&mut trees, key, node);
                }
            }

            return Err(error);
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn bind_locked(
        &self,
        protocol: &Arc<ProtocolEntry>,
        trees: &mut SocketTrees,
        socket: &Arc<NetSocket>,
        state: &mut SocketBindingState,
        target: BindingType,
        local: &LinkLocalAddress,
        remote: Option<&NetworkAddress>,
        flags: u32,
    ) -> NetResult<()> {
        let already_placed = state.binding_type >= BindingType::LocallyBound;
        let (link, link_address, mut local_address) = if already_placed {
            (
                state.link.clone(),
                state.link_address.clone(),
                state.local_address,
            )
        } else {
            let mut address = local.address;
            if state.binding_type == BindingType::Unbound && state.local_address.port != 0 {
                address.port = state.local_address.port;
            }

            (local.link.clone(), local.link_address.clone(), address)
        };

        if let Some(bound_link) = &link {
            if !bound_link.is_up() {
                // The link-down sweep takes this same protocol lock, so the
                // down state seen here is not a transient: detach rather
                // than insert a binding the sweep already passed over.
                socket.clear_flags(SOCKET_FLAG_ACTIVE);
                state.binding_type = BindingType::Invalid;
                let mut cached = protocol.last_socket.lock();
                if cached.as_ref().map_or(false, |entry| Arc::ptr_eq(entry, socket)) {
                    *cached = None;
                }
                drop(cached);

                socket.set_last_error(NetError::NoNetworkConnection);
                socket.signal_io(POLL_EVENT_DISCONNECTED);
                return Err(NetError::NoNetworkConnection);
            }
        }

        // A socket pulled out of a tree already proved its local address;
        // forked listeners share their parent's placement by design.  Either
        // way the availability walk is skipped, but a fully bound target
        // must still prove its five-tuple unique.
        let skip_validation = socket.flags() & SOCKET_FLAG_FORKED_LISTENER != 0
            || state.binding_type != BindingType::Invalid;
        if local_address.port == 0 && flags & BIND_FLAG_NO_PORT_ASSIGNMENT == 0 {
            debug_assert!(!skip_validation);
            local_address.port =
                self.assign_ephemeral_port(protocol, trees, socket, &local_address)?;
        } else {
            if !skip_validation {
                let (available, evictions) =
                    check_local_address_availability(trees, socket.flags(), &local_address);
                self.evict_time_wait_sockets(protocol, trees, &evictions);
                if !available {
                    return Err(NetError::AddressInUse);
                }
            }

            if target == BindingType::FullyBound {
                if let Some(remote_address) = remote {
                    let occupant = trees
                        .fully_bound
                        .range(FullyBoundKey::exact(&local_address, remote_address))
                        .map(|(key, node)| (*key, node.clone()))
                        .next();
                    if let Some((key, occupant)) = occupant {
                        if occupant.flags() & SOCKET_FLAG_TIME_WAIT == 0 {
                            return Err(NetError::AddressInUse);
                        }

                        self.evict_time_wait_sockets(protocol, trees, &[key]);
                    }
                }
            }
        }

        if let Some(remote_address) = remote {
            if target == BindingType::FullyBound {
                state.remote_address = *remote_address;
            }
        }

        if !already_placed {
            state.link = link.clone();
            state.link_address = link_address;
        }

        state.local_address = local_address;
        state.packet_size = compute_packet_size(socket, state.link.as_ref());

        if flags & BIND_FLAG_ACTIVATE != 0 {
            let old_flags = socket.set_flags(SOCKET_FLAG_ACTIVE);
            if target == BindingType::FullyBound
                && state.binding_type != BindingType::FullyBound
                && old_flags & SOCKET_FLAG_ACTIVE != 0
            {
                socket.set_flags(SOCKET_FLAG_PREVIOUSLY_ACTIVE);
            }
        }

        state.binding_type = target;
        if let Some(key) = tree_key(state, socket.id) {
            insert_tree(trees, key, socket.clone());
        }

        debug!(
            "netcore: socket {} bound {:?} at {}",
            socket.id, target, state.local_address
        );
        Ok(())
    }

    /// Raw sockets skip the trees and the port machinery entirely; they sit
    /// on a flat list under its own lock, and every raw address carries port
    /// zero.
    fn bind_raw_socket(
        &self,
        socket: &Arc<NetSocket>,
        target: BindingType,
        local: &LinkLocalAddress,
        remote: Option<&NetworkAddress>,
        flags: u32,
    ) -> NetResult<()> {
        debug_assert_eq!(local.address.port, 0);

        let mut raw_sockets = self.raw_sockets.lock();
        let mut state = socket.state.lock();
        let forked = socket.flags() & SOCKET_FLAG_FORKED_LISTENER != 0;
        if !forked
            && state.binding_type != BindingType::Invalid
            && (target < state.binding_type
                || (target == state.binding_type && target != BindingType::FullyBound))
        {
            return Err(NetError::InvalidParameter);
        }

        let already_placed = state.binding_type >= BindingType::LocallyBound;
        let (link, link_address, local_address) = if already_placed {
            (
                state.link.clone(),
                state.link_address.clone(),
                state.local_address,
            )
        } else {
            (local.link.clone(), local.link_address.clone(), local.address)
        };

        if let Some(bound_link) = &link {
            if !bound_link.is_up() {
                socket.clear_flags(SOCKET_FLAG_ACTIVE);
                if state.binding_type != BindingType::Invalid {
                    if let Some(position) = raw_sockets
                        .iter()
                        .position(|entry| Arc::ptr_eq(entry, socket))
                    {
                        raw_sockets.remove(position);
                    }
                }

                state.binding_type = BindingType::Invalid;
                socket.set_last_error(NetError::NoNetworkConnection);
                socket.signal_io(POLL_EVENT_DISCONNECTED);
                return Err(NetError::NoNetworkConnection);
            }
        }

        if let Some(remote_address) = remote {
            if target == BindingType::FullyBound {
                debug_assert_eq!(remote_address.port, 0);
                state.remote_address = *remote_address;
            }
        }

        if !already_placed {
            state.link = link;
            state.link_address = link_address;
        }

        state.local_address = local_address;
        state.packet_size = compute_packet_size(socket, state.link.as_ref());

        if flags & BIND_FLAG_ACTIVATE != 0 {
            let old_flags = socket.set_flags(SOCKET_FLAG_ACTIVE);
            if target == BindingType::FullyBound
                && state.binding_type != BindingType::FullyBound
                && old_flags & SOCKET_FLAG_ACTIVE != 0
            {
                socket.set_flags(SOCKET_FLAG_PREVIOUSLY_ACTIVE);
            }
        }

        if state.binding_type == BindingType::Invalid {
            raw_sockets.push(socket.clone());
        }

        state.binding_type = target;
        Ok(())
    }

    fn assign_ephemeral_port(
        &self,
        protocol: &Arc<ProtocolEntry>,
        trees: &mut SocketTrees,
        socket: &Arc<NetSocket>,
        local_address: &NetworkAddress,
    ) -> NetResult<u32> {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or(0);
        let offset = (nanos % u128::from(EPHEMERAL_PORT_COUNT)) as u32;
        for attempt in 0..EPHEMERAL_PORT_COUNT {
            let port = EPHEMERAL_PORT_BEGIN + (offset + attempt) % EPHEMERAL_PORT_COUNT;
            let mut candidate = *local_address;
            candidate.port = port;
            let (available, evictions) =
                check_local_address_availability(trees, socket.flags(), &candidate);
            self.evict_time_wait_sockets(protocol, trees, &evictions);
            if available {
                return Ok(port);
            }
        }

        Err(NetError::ResourceInUse)
    }

    fn evict_time_wait_sockets(
        &self,
        protocol: &Arc<ProtocolEntry>,
        trees: &mut SocketTrees,
        keys: &[FullyBoundKey],
    ) {
        for key in keys {
            if let Some(occupant) = trees.fully_bound.get(key).cloned() {
                debug!("netcore: evicting time-wait socket {}", occupant.id);
                let mut occupant_state = occupant.state.lock();
                Self::deactivate_locked(protocol, trees, &occupant, &mut occupant_state);
            }
        }
    }

    /// Finds the socket that should receive traffic addressed to
    /// `local_address` from `remote_address`: exact five-tuple first, then
    /// the concrete local address, then the bare port.  Inactive sockets
    /// never match.  The returned reference is the caller's to keep.
    pub fn find_socket(
        &self,
        protocol: &Arc<ProtocolEntry>,
        local_address: &NetworkAddress,
        remote_address: &NetworkAddress,
    ) -> Option<Arc<NetSocket>> {
        // Advisory fast path: the last fully bound socket a lookup found.
        let cached = protocol.last_socket.lock().clone();
        if let Some(cached) = cached {
            if cached.flags() & SOCKET_FLAG_ACTIVE != 0
                && matches_fully_bound(&cached, local_address, remote_address)
            {
                return Some(cached);
            }
        }

        let trees = protocol.sockets.read();
        let found = trees
            .fully_bound
            .range(FullyBoundKey::exact(local_address, remote_address))
            .next()
            .map(|(_, socket)| socket.clone())
            .or_else(|| {
                trees
                    .locally_bound
                    .range(LocallyBoundKey::exact(local_address))
                    .next()
                    .map(|(_, socket)| socket.clone())
            })
            .or_else(|| {
                trees
                    .unbound
                    .range(UnboundKey::bracket(
                        local_address.port,
                        local_address.domain,
                    ))
                    .next()
                    .map(|(_, socket)| socket.clone())
            })?;
        drop(trees);

        // An inactive hit is a miss: the socket is on its way out of its
        // tree.
        if found.flags() & SOCKET_FLAG_ACTIVE == 0 {
            return None;
        }

        if found.binding_type() == BindingType::FullyBound {
            *protocol.last_socket.lock() = Some(found.clone());
        }

        Some(found)
    }

    /// Matches an incoming packet to a socket and hands it to the owning
    /// protocol.
    pub fn process_received_data(
        &self,
        protocol: &Arc<ProtocolEntry>,
        local_address: &NetworkAddress,
        remote_address: &NetworkAddress,
        packet: &mut PacketBuffer,
    ) -> NetResult<()> {
        match self.find_socket(protocol, local_address, remote_address) {
            Some(socket) => protocol.interface.process_received_data(&socket, packet),
            None => Err(NetError::NotFound),
        }
    }

    /// Breaks a fully bound socket's connection, moving it back to locally
    /// bound with the remote address wiped.  A socket that only became
    /// active through its fully bound bind goes inactive again.
    pub fn disconnect_socket(&self, socket: &Arc<NetSocket>) -> NetResult<()> {
        if socket.is_raw() {
            let _raw_sockets = self.raw_sockets.lock();
            let mut state = socket.state.lock();
            if state.binding_type != BindingType::FullyBound {
                return Err(NetError::InvalidParameter);
            }

            state.remote_address = NetworkAddress::any(state.remote_address.domain);
            state.binding_type = BindingType::LocallyBound;
            if socket.flags() & SOCKET_FLAG_PREVIOUSLY_ACTIVE == 0 {
                socket.clear_flags(SOCKET_FLAG_ACTIVE);
            }

            return Ok(());
        }

        let protocol = socket.protocol.clone();
        let mut trees = protocol.sockets.write();
        let mut state = socket.state.lock();
        if state.binding_type != BindingType::FullyBound {
            return Err(NetError::InvalidParameter);
        }

        let key = FullyBoundKey::new(&state.local_address, &state.remote_address, socket.id);
        let node = trees.fully_bound.remove(&key);
        debug_assert!(node.is_some());
        state.remote_address = NetworkAddress::any(state.remote_address.domain);
        state.binding_type = BindingType::LocallyBound;
        trees.locally_bound.insert(
            LocallyBoundKey {
                local: state.local_address,
                id: socket.id,
            },
            node.unwrap_or_else(|| socket.clone()),
        );

        if socket.flags() & SOCKET_FLAG_PREVIOUSLY_ACTIVE == 0 {
            socket.clear_flags(SOCKET_FLAG_ACTIVE);
            let mut cached = protocol.last_socket.lock();
            if cached.as_ref().map_or(false, |entry| Arc::ptr_eq(entry, socket)) {
                *cached = None;
            }
        }

        Ok(())
    }

    /// Makes a bound socket visible to receive lookups.
    pub fn activate_socket(&self, socket: &Arc<NetSocket>) {
        if socket.is_raw() {
            let _raw_sockets = self.raw_sockets.lock();
            socket.set_flags(SOCKET_FLAG_ACTIVE);
            return;
        }

        let _trees = socket.protocol.sockets.write();
        socket.set_flags(SOCKET_FLAG_ACTIVE);
    }

    /// Removes a socket from its tree (or the raw list) and marks it
    /// invalid.  A no-op on sockets that are already inactive and unbound.
    /// The caller must hold its own reference across the call.
    pub fn deactivate_socket(&self, socket: &Arc<NetSocket>) {
        if socket.is_raw() {
            let mut raw_sockets = self.raw_sockets.lock();
            let mut state = socket.state.lock();
            if socket.flags() & SOCKET_FLAG_ACTIVE == 0
                && state.binding_type == BindingType::Invalid
            {
                return;
            }

            socket.clear_flags(SOCKET_FLAG_ACTIVE);
            if let Some(position) = raw_sockets
                .iter()
                .position(|entry| Arc::ptr_eq(entry, socket))
            {
                debug_assert!(Arc::strong_count(socket) > 1);
                raw_sockets.remove(position);
            }

            state.binding_type = BindingType::Invalid;
            return;
        }

        let protocol = socket.protocol.clone();
        let mut trees = protocol.sockets.write();
        let mut state = socket.state.lock();
        Self::deactivate_locked(&protocol, &mut trees, socket, &mut state);
    }

    fn deactivate_locked(
        protocol: &Arc<ProtocolEntry>,
        trees: &mut SocketTrees,
        socket: &Arc<NetSocket>,
        state: &mut SocketBindingState,
    ) {
        if socket.flags() & SOCKET_FLAG_ACTIVE == 0 && state.binding_type == BindingType::Invalid {
            return;
        }

        socket.clear_flags(SOCKET_FLAG_ACTIVE);
        if let Some(key) = tree_key(state, socket.id) {
            // The tree's reference must not be the last one standing.
            debug_assert!(Arc::strong_count(socket) > 1);
            remove_tree(trees, &key);
        }

        state.binding_type = BindingType::Invalid;
        let mut cached = protocol.last_socket.lock();
        if cached.as_ref().map_or(false, |entry| Arc::ptr_eq(entry, socket)) {
            *cached = None;
        }
    }

    /// Force-detaches every socket bound through `link` (narrowed to one
    /// address entry when supplied): deactivates it, records the loss of
    /// connectivity, and signals its readiness state.
    pub(crate) fn detach_sockets(&self, link: &Arc<Link>, entry: Option<&Arc<LinkAddressEntry>>) {
        let protocols: Vec<Arc<ProtocolEntry>> = self.plugins.read().protocols.clone();
        for protocol in protocols {
            let mut trees = protocol.sockets.write();
            let victims: Vec<Arc<NetSocket>> = trees
                .fully_bound
                .values()
                .chain(trees.locally_bound.values())
                .filter(|socket| socket_on_link(socket, link, entry))
                .cloned()
                .collect();
            for socket in victims {
                let mut state = socket.state.lock();
                Self::deactivate_locked(&protocol, &mut trees, &socket, &mut state);
                drop(state);
                socket.set_last_error(NetError::NoNetworkConnection);
                socket.signal_io(POLL_EVENT_DISCONNECTED);
            }
        }

        let mut raw_sockets = self.raw_sockets.lock();
        let mut index = 0;
        while index < raw_sockets.len() {
            if !socket_on_link(&raw_sockets[index], link, entry) {
                index += 1;
                continue;
            }

            let socket = raw_sockets.remove(index);
            socket.clear_flags(SOCKET_FLAG_ACTIVE);
            socket.state.lock().binding_type = BindingType::Invalid;
            socket.set_last_error(NetError::NoNetworkConnection);
            socket.signal_io(POLL_EVENT_DISCONNECTED);
        }
    }
}
