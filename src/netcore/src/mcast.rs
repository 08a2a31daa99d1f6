//! Multicast group management.  Memberships are counted at two levels: each
//! socket keeps the list of groups it joined, and each link keeps one entry
//! per distinct group with a join count.  The device filter and the network
//! announcement (IGMP and friends) only change when a link-level entry
//! appears or disappears.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use netdefs::constants::{
    NetError, NetResult, LINK_CAPABILITY_MULTICAST_ALL, LINK_CAPABILITY_PROMISCUOUS_MODE,
    SOCKET_FLAG_MULTICAST_LOOPBACK,
};
use netdefs::data::NetworkAddress;

use crate::link::{Link, LinkAddressEntry, LinkInner, LinkLocalAddress};
use crate::registry::MulticastFilterMode;
use crate::socket::NetSocket;
use crate::NetCore;

/// A multicast membership request from a socket: the group to join or leave
/// plus an optional interface selector.  Without a selector the engine
/// routes on the group address itself.
pub struct MulticastRequest {
    /// The multicast group address.
    pub address: NetworkAddress,
    /// Selects the interface by device identifier.
    pub interface_id: Option<u64>,
    /// Selects the interface by one of its local addresses.
    pub interface_address: Option<NetworkAddress>,
}

/// One link-level membership: a distinct group joined on the link, counted
/// across every joiner.
pub(crate) struct LinkMulticastGroup {
    pub link_address: Arc<LinkAddressEntry>,
    pub address: NetworkAddress,
    pub join_count: usize,
}

/// One socket-level membership.  Holds the link alive for as long as the
/// socket stays joined.
pub(crate) struct SocketMulticastGroup {
    pub link: Arc<Link>,
    pub link_address: Arc<LinkAddressEntry>,
    pub address: NetworkAddress,
}

/// The lazily created multicast state of a socket.
#[derive(Default)]
pub(crate) struct SocketMulticastState {
    pub groups: Vec<SocketMulticastGroup>,
    pub interface: Option<LinkLocalAddress>,
}

fn update_multicast_filter(link: &Link, inner: &LinkInner) -> NetResult<()> {
    let groups: Vec<NetworkAddress> = inner
        .multicast_groups
        .iter()
        .map(|group| group.address)
        .collect();
    let mode = if groups.is_empty() {
        MulticastFilterMode::Disabled
    } else if link.properties().capabilities & LINK_CAPABILITY_MULTICAST_ALL != 0 {
        MulticastFilterMode::AllMulticast
    } else {
        MulticastFilterMode::Promiscuous
    };

    link.properties().interface.set_multicast_filter(mode, &groups)
}

impl NetSocket {
    /// Whether transmitted multicast traffic loops back to local receivers.
    /// On by default.
    pub fn multicast_loopback(&self) -> bool {
        self.flags() & SOCKET_FLAG_MULTICAST_LOOPBACK != 0
    }

    /// Enables or disables multicast loopback.
    pub fn set_multicast_loopback(&self, enabled: bool) {
        if enabled {
            self.set_flags(SOCKET_FLAG_MULTICAST_LOOPBACK);
        } else {
            self.clear_flags(SOCKET_FLAG_MULTICAST_LOOPBACK);
        }
    }

    fn multicast_state(&self) -> &Mutex<SocketMulticastState> {
        self.multicast
            .get_or_init(|| Mutex::new(SocketMulticastState::default()))
    }
}

impl NetCore {
    /// Picks the link a multicast request names: by device, by local
    /// address, or by routing the group address.  Any resolution failure
    /// reports `NoSuchDevice`.
    fn resolve_multicast_link(&self, request: &MulticastRequest) -> NetResult<LinkLocalAddress> {
        let result = if let Some(device_id) = request.interface_id {
            let link = self
                .lookup_link_by_device(device_id)
                .ok_or(NetError::NoSuchDevice)?;
            self.find_link_for_local_address(
                &NetworkAddress::any(request.address.domain),
                true,
                Some(&link),
            )
        } else if let Some(interface_address) = request
            .interface_address
            .filter(|address| !address.is_unspecified())
        {
            self.find_link_for_local_address(&interface_address, false, None)
        } else {
            let mut search = request.address;
            search.port = 0;
            self.find_link_for_remote_address(&search)
        };

        result.map_err(|_| NetError::NoSuchDevice)
    }

    /// Joins a socket to a multicast group.  Joining the same group twice on
    /// the same interface reports `AddressInUse`.
    pub fn join_multicast_group(
        &self,
        socket: &Arc<NetSocket>,
        request: &MulticastRequest,
    ) -> NetResult<()> {
        let local = self.resolve_multicast_link(request)?;
        let link = local.link.ok_or(NetError::NoSuchDevice)?;
        let link_address = local.link_address.ok_or(NetError::NoSuchDevice)?;

        let state_lock = socket.multicast_state();
        let duplicate = |state: &SocketMulticastState| {
            state
                .groups
                .iter()
                .any(|group| Arc::ptr_eq(&group.link, &link) && group.address == request.address)
        };

        if duplicate(&state_lock.lock()) {
            return Err(NetError::AddressInUse);
        }

        // The socket lock is a leaf and the link-level join reaches into the
        // link and the device, so the join runs unlocked and the membership
        // is re-checked before being recorded.
        self.join_link_multicast_group(&link, &link_address, &request.address)?;

        let mut state = state_lock.lock();
        if duplicate(&state) {
            drop(state);
            let _ = self.leave_link_multicast_group(&link, &request.address);
            return Err(NetError::AddressInUse);
        }

        state.groups.push(SocketMulticastGroup {
            link,
            link_address,
            address: request.address,
        });

        Ok(())
    }

    /// Removes a socket from a multicast group it joined.  Unknown
    /// memberships report `InvalidAddress`.
    pub fn leave_multicast_group(
        &self,
        socket: &Arc<NetSocket>,
        request: &MulticastRequest,
    ) -> NetResult<()> {
        let state_lock = match self.socket_multicast(socket) {
            Some(state_lock) => state_lock,
            None => return Err(NetError::InvalidAddress),
        };

        let group = {
            let mut state = state_lock.lock();
            let position = state
                .groups
                .iter()
                .position(|group| {
                    group.address == request.address
                        && request.interface_id.map_or(true, |device_id| {
                            group.link.properties().device_id == device_id
                        })
                })
                .ok_or(NetError::InvalidAddress)?;
            state.groups.remove(position)
        };

        if let Err(error) = self.leave_link_multicast_group(&group.link, &group.address) {
            state_lock.lock().groups.push(group);
            return Err(error);
        }

        Ok(())
    }

    /// Joins a link to a multicast group, reprogramming the device filter
    /// and announcing the membership when the group is new to the link.
    pub fn join_link_multicast_group(
        &self,
        link: &Arc<Link>,
        link_address: &Arc<LinkAddressEntry>,
        group_address: &NetworkAddress,
    ) -> NetResult<()> {
        let network = self
            .lookup_network(group_address.domain)
            .ok_or(NetError::NotSupported)?;
        if !network.interface.supports_multicast()
            || link.properties().capabilities & LINK_CAPABILITY_PROMISCUOUS_MODE == 0
        {
            return Err(NetError::NotSupportedByProtocol);
        }

        {
            let mut inner = link.inner.lock();
            if let Some(group) = inner
                .multicast_groups
                .iter_mut()
                .find(|group| group.address == *group_address)
            {
                group.join_count += 1;
                return Ok(());
            }

            inner.multicast_groups.push(LinkMulticastGroup {
                link_address: link_address.clone(),
                address: *group_address,
                join_count: 1,
            });

            if let Err(error) = update_multicast_filter(link, &inner) {
                inner.multicast_groups.pop();
                return Err(error);
            }
        }

        debug!(
            "netcore: link {} joined {}",
            link.properties().device_id,
            group_address
        );

        // Announce outside the link lock; the network layer turns around and
        // transmits.
        if let Err(error) =
            network
                .interface
                .join_leave_multicast_group(link, link_address, group_address, true)
        {
            let mut inner = link.inner.lock();
            if let Some(position) = inner
                .multicast_groups
                .iter()
                .position(|group| group.address == *group_address)
            {
                inner.multicast_groups[position].join_count -= 1;
                if inner.multicast_groups[position].join_count == 0 {
                    inner.multicast_groups.remove(position);
                    let _ = update_multicast_filter(link, &inner);
                }
            }

            return Err(error);
        }

        Ok(())
    }

    /// Drops one join on a link-level membership, tearing the membership
    /// down once the last joiner is gone.
    pub fn leave_link_multicast_group(
        &self,
        link: &Arc<Link>,
        group_address: &NetworkAddress,
    ) -> NetResult<()> {
        let network = self
            .lookup_network(group_address.domain)
            .ok_or(NetError::NotSupported)?;

        let group = {
            let mut inner = link.inner.lock();
            let position = inner
                .multicast_groups
                .iter()
                .position(|group| group.address == *group_address)
                .ok_or(NetError::InvalidAddress)?;

            inner.multicast_groups[position].join_count -= 1;
            if inner.multicast_groups[position].join_count != 0 {
                return Ok(());
            }

            let group = inner.multicast_groups.remove(position);
            if let Err(error) = update_multicast_filter(link, &inner) {
                inner.multicast_groups.insert(
                    position,
                    LinkMulticastGroup {
                        link_address: group.link_address,
                        address: group.address,
                        join_count: 1,
                    },
                );
                return Err(error);
            }

            group
        };

        debug!(
            "netcore: link {} left {}",
            link.properties().device_id,
            group_address
        );

        // The membership is gone locally whatever the announcement does.
        if let Err(error) = network.interface.join_leave_multicast_group(
            link,
            &group.link_address,
            group_address,
            false,
        ) {
            warn!(
                "netcore: leave announcement for {} on link {} failed: {}",
                group_address,
                link.properties().device_id,
                error
            );
        }

        Ok(())
    }

    /// Tears down every membership a socket still holds.  Called when the
    /// socket is destroyed.
    pub fn destroy_socket_multicast_groups(&self, socket: &Arc<NetSocket>) {
        let state_lock = match self.socket_multicast(socket) {
            Some(state_lock) => state_lock,
            None => return,
        };

        let groups: Vec<SocketMulticastGroup> = {
            let mut state = state_lock.lock();
            state.interface = None;
            state.groups.drain(..).collect()
        };

        for group in groups {
            if let Err(error) = self.leave_link_multicast_group(&group.link, &group.address) {
                warn!(
                    "netcore: socket {} could not leave {}: {}",
                    socket.id(),
                    group.address,
                    error
                );
            }
        }
    }

    /// Pins the interface a socket's outgoing multicast traffic uses.  An
    /// empty request (no selector, unspecified address) clears the pin.
    pub fn set_socket_multicast_interface(
        &self,
        socket: &Arc<NetSocket>,
        request: &MulticastRequest,
    ) -> NetResult<()> {
        let clear = request.interface_id.is_none()
            && request
                .interface_address
                .map_or(true, |address| address.is_unspecified())
            && request.address.is_unspecified();
        let interface = if clear {
            None
        } else {
            Some(self.resolve_multicast_link(request)?)
        };

        socket.multicast_state().lock().interface = interface;
        Ok(())
    }

    /// The interface pinned for a socket's outgoing multicast traffic, if
    /// any.
    pub fn socket_multicast_interface(&self, socket: &Arc<NetSocket>) -> Option<LinkLocalAddress> {
        self.socket_multicast(socket)
            .and_then(|state| state.lock().interface.clone())
    }

    fn socket_multicast<'a>(
        &self,
        socket: &'a Arc<NetSocket>,
    ) -> Option<&'a Mutex<SocketMulticastState>> {
        socket.multicast.get()
    }
}
