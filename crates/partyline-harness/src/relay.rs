//! In-memory relay
//!
//! [`SimulatedRelay`] plays the cloud relay for any number of local devices.
//! Each device talks to it through its own [`RelayLink`], which is the
//! [`RelayTransport`] handed to a `PartyManager`. Requests are applied the
//! moment they are submitted; the resulting events wait in per-device
//! inboxes until the owning manager polls them.
//!
//! Network conditions are deterministic: packets can be dropped on a fixed
//! cadence or for isolated devices, inboxes can be paused, and the next
//! request of a given kind can be made to fail.

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use partyline_core::{
    AppliedInvitation, ChatControlId, DeviceId, EndpointId, EntityId, InvitationId,
    InvitationRevocability, NetworkConfiguration, NetworkDescriptor, NetworkId, OperationId,
    Outcome, PropertyUpdate, StateChangeResult,
};
use partyline_runtime::{
    CompletionDetail, DisconnectReason, PropertyScope, RegionInfo, RelayEvent, RelayRequest,
    RelayTransport, RemoteChatControlInfo, RemoteEndpointInfo,
};
use tracing::{debug, info, trace};

/// Address reported in finalized descriptors
pub const SIMULATED_RELAY_ADDRESS: &str = "relay.partyline.test:3074";

// ----------------------------------------------------------------------------
// Network Conditions
// ----------------------------------------------------------------------------

/// Deterministic packet loss
#[derive(Debug, Clone, Default)]
pub struct PacketLoss {
    /// Drop every Nth packet routed through the relay
    pub drop_every: Option<u32>,
    /// Devices whose packets are dropped in both directions
    pub isolated: HashSet<DeviceId>,
}

/// Counters for what the relay has routed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatistics {
    pub packets_delivered: u64,
    pub packets_dropped: u64,
    pub requests_failed: u64,
}

// ----------------------------------------------------------------------------
// Relay State
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct SimDevice {
    id: DeviceId,
    /// Has been announced to the rest of the network
    announced: bool,
    users: Vec<EntityId>,
    properties: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
struct SimEndpoint {
    id: EndpointId,
    device: DeviceId,
    entity: Option<EntityId>,
    properties: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
struct PendingDestroy {
    owner: DeviceId,
    op: OperationId,
    endpoint: EndpointId,
    awaiting: Vec<DeviceId>,
}

#[derive(Debug)]
struct SimNetwork {
    descriptor: NetworkDescriptor,
    configuration: NetworkConfiguration,
    creator: EntityId,
    properties: BTreeMap<String, Vec<u8>>,
    invitations: Vec<(AppliedInvitation, EntityId)>,
    devices: Vec<SimDevice>,
    endpoints: Vec<SimEndpoint>,
    next_endpoint: Option<u16>,
    chat_controls: Vec<RemoteChatControlInfo>,
    pending_destroys: Vec<PendingDestroy>,
    banned_devices: HashSet<DeviceId>,
    banned_users: HashSet<EntityId>,
}

impl SimNetwork {
    fn device(&self, id: DeviceId) -> Option<&SimDevice> {
        self.devices.iter().find(|d| d.id == id)
    }

    fn device_mut(&mut self, id: DeviceId) -> Option<&mut SimDevice> {
        self.devices.iter_mut().find(|d| d.id == id)
    }

    fn hosts_user(&self, device: DeviceId, entity: &EntityId) -> bool {
        self.device(device).is_some_and(|d| d.users.contains(entity))
    }

    fn user_count(&self) -> usize {
        self.devices.iter().map(|d| d.users.len()).sum()
    }

    /// Devices other than `except` where `entity` is authenticated
    fn devices_of(&self, entity: &EntityId, except: DeviceId) -> usize {
        self.devices
            .iter()
            .filter(|d| d.id != except && d.users.contains(entity))
            .count()
    }

    /// Announced devices other than `except`
    fn audience(&self, except: DeviceId) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|d| d.announced && d.id != except)
            .map(|d| d.id)
            .collect()
    }

    fn allocate_endpoint_id(&mut self) -> Option<EndpointId> {
        let id = self.next_endpoint?;
        self.next_endpoint = id.checked_add(1);
        Some(EndpointId::new(id))
    }
}

fn as_updates(map: &BTreeMap<String, Vec<u8>>) -> Vec<PropertyUpdate> {
    map.iter()
        .map(|(key, value)| PropertyUpdate::set(key.clone(), value.clone()))
        .collect()
}

fn apply_updates(map: &mut BTreeMap<String, Vec<u8>>, updates: &[PropertyUpdate]) {
    for update in updates {
        match &update.value {
            Some(value) => {
                map.insert(update.key.clone(), value.clone());
            }
            None => {
                map.remove(&update.key);
            }
        }
    }
}

#[derive(Debug, Default)]
struct RelayState {
    regions: Vec<RegionInfo>,
    networks: HashMap<NetworkId, SimNetwork>,
    inboxes: HashMap<DeviceId, Vec<RelayEvent>>,
    paused: HashSet<DeviceId>,
    failures: HashMap<&'static str, Vec<StateChangeResult>>,
    loss: PacketLoss,
    packets_routed: u64,
    requests_seen: HashMap<&'static str, usize>,
    stats: RelayStatistics,
}

impl RelayState {
    fn push(&mut self, device: DeviceId, event: RelayEvent) {
        trace!(device = %device.short(), event = event.name(), "relay queued event");
        self.inboxes.entry(device).or_default().push(event);
    }

    fn broadcast(&mut self, targets: Vec<DeviceId>, event: RelayEvent) {
        for target in targets {
            self.push(target, event.clone());
        }
    }

    fn complete(&mut self, device: DeviceId, op: OperationId, outcome: Outcome, detail: CompletionDetail) {
        self.push(
            device,
            RelayEvent::OperationCompleted {
                op,
                outcome,
                detail,
            },
        );
    }

    fn succeed(&mut self, device: DeviceId, op: OperationId) {
        self.complete(device, op, Outcome::success(), CompletionDetail::None);
    }

    fn fail(&mut self, device: DeviceId, op: OperationId, result: StateChangeResult) {
        self.stats.requests_failed += 1;
        self.complete(device, op, Outcome::failure(result), CompletionDetail::None);
    }

    fn take_injected_failure(&mut self, name: &'static str) -> Option<StateChangeResult> {
        let queue = self.failures.get_mut(name)?;
        if queue.is_empty() {
            return None;
        }
        Some(queue.remove(0))
    }

    // ------------------------------------------------------------------------
    // Request Handling
    // ------------------------------------------------------------------------

    fn handle(&mut self, from: DeviceId, request: RelayRequest) {
        *self.requests_seen.entry(request.name()).or_default() += 1;
        if let Some(op) = request.operation() {
            if let Some(result) = self.take_injected_failure(request.name()) {
                debug!(request = request.name(), result = ?result, "injected failure");
                self.fail(from, op, result);
                return;
            }
        }
        trace!(device = %from.short(), request = request.name(), "relay request");

        match request {
            RelayRequest::QueryRegions { op } => {
                let regions = self.regions.clone();
                self.complete(from, op, Outcome::success(), CompletionDetail::Regions(regions));
            }
            RelayRequest::CreateNetwork {
                op,
                network,
                creator,
                token,
                configuration,
                regions,
                invitation,
            } => self.create_network(from, op, network, creator, token, configuration, regions, invitation),
            RelayRequest::Connect { op, network, .. } => self.connect(from, op, network),
            RelayRequest::Authenticate {
                op,
                network,
                entity,
                token,
                invitation,
            } => self.authenticate(from, op, network, entity, token, invitation),
            RelayRequest::RemoveUser { op, network, entity } => {
                if self.networks.contains_key(&network) {
                    self.remove_user(network, from, &entity);
                }
                self.succeed(from, op);
            }
            RelayRequest::CreateEndpoint {
                op,
                network,
                entity,
                properties,
            } => self.create_endpoint(from, op, network, entity, properties),
            RelayRequest::DestroyEndpoint { op, network, endpoint } => {
                self.destroy_endpoint(from, op, network, endpoint)
            }
            RelayRequest::AckEndpointDestroyed { network, endpoint } => {
                self.acknowledge_destroy(from, network, Some(endpoint))
            }
            RelayRequest::CreateInvitation {
                op,
                network,
                creator,
                invitation,
            } => self.create_invitation(from, op, network, creator, invitation),
            RelayRequest::RevokeInvitation {
                op,
                network,
                entity,
                invitation,
            } => self.revoke_invitation(from, op, network, entity, invitation),
            RelayRequest::KickDevice { op, network, target } => self.kick_device(from, op, network, target),
            RelayRequest::KickUser { op, network, target } => self.kick_user(from, op, network, target),
            RelayRequest::SetProperties {
                network,
                scope,
                updates,
            } => self.set_properties(from, network, scope, updates),
            RelayRequest::ConnectChatControl {
                op,
                network,
                chat_control,
                entity,
            } => self.connect_chat_control(from, op, network, chat_control, entity),
            RelayRequest::DisconnectChatControl {
                op,
                network,
                chat_control,
            } => {
                if let Some(net) = self.networks.get_mut(&network) {
                    let before = net.chat_controls.len();
                    net.chat_controls
                        .retain(|cc| !(cc.id == chat_control && cc.device == from));
                    if net.chat_controls.len() != before {
                        let audience = net.audience(from);
                        self.broadcast(
                            audience,
                            RelayEvent::ChatControlLeft {
                                network,
                                chat_control,
                            },
                        );
                    }
                }
                self.succeed(from, op);
            }
            RelayRequest::Leave { op, network } => {
                self.remove_device(network, from);
                self.succeed(from, op);
            }
            RelayRequest::SendPacket { network, to, payload } => self.route_packet(from, network, to, payload),
            RelayRequest::ReportUnresponsive { network, device } => {
                if self.networks.get(&network).is_some_and(|n| n.device(device).is_some()) {
                    info!(network = %network, device = %device.short(), "device reported unresponsive");
                    self.remove_device(network, device);
                    self.push(
                        device,
                        RelayEvent::Disconnected {
                            network,
                            reason: DisconnectReason::Unresponsive,
                        },
                    );
                }
            }
            RelayRequest::UpdateToken { entity, .. } => {
                trace!(entity = %entity, "token refreshed");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_network(
        &mut self,
        from: DeviceId,
        op: OperationId,
        network: NetworkId,
        creator: EntityId,
        token: String,
        configuration: NetworkConfiguration,
        regions: Vec<String>,
        invitation: AppliedInvitation,
    ) {
        if token.is_empty() {
            self.fail(from, op, StateChangeResult::UserNotAuthorized);
            return;
        }
        if self.networks.contains_key(&network) {
            self.fail(from, op, StateChangeResult::PartyServiceError);
            return;
        }
        let region = regions
            .into_iter()
            .find(|r| self.regions.iter().any(|known| known.name == *r))
            .or_else(|| self.regions.first().map(|r| r.name.clone()));
        let Some(region) = region else {
            self.fail(from, op, StateChangeResult::NoServersAvailable);
            return;
        };
        let descriptor = NetworkDescriptor::finalized(network, region, SIMULATED_RELAY_ADDRESS);
        self.networks.insert(
            network,
            SimNetwork {
                descriptor: descriptor.clone(),
                configuration,
                creator: creator.clone(),
                properties: BTreeMap::new(),
                invitations: vec![(invitation, creator)],
                devices: Vec::new(),
                endpoints: Vec::new(),
                next_endpoint: Some(1),
                chat_controls: Vec::new(),
                pending_destroys: Vec::new(),
                banned_devices: HashSet::new(),
                banned_users: HashSet::new(),
            },
        );
        info!(network = %network, region = descriptor.region(), "network created");
        self.complete(
            from,
            op,
            Outcome::success(),
            CompletionDetail::NetworkCreated(descriptor),
        );
    }

    fn connect(&mut self, from: DeviceId, op: OperationId, network: NetworkId) {
        let Some(net) = self.networks.get_mut(&network) else {
            self.fail(from, op, StateChangeResult::NetworkNoLongerExists);
            return;
        };
        if net.banned_devices.contains(&from) {
            self.fail(from, op, StateChangeResult::UserNotAuthorized);
            return;
        }
        if net.device(from).is_none() {
            if net.devices.len() >= net.configuration.max_device_count as usize {
                self.fail(from, op, StateChangeResult::NetworkLimitReached);
                return;
            }
            net.devices.push(SimDevice {
                id: from,
                announced: false,
                users: Vec::new(),
                properties: BTreeMap::new(),
            });
        }
        let detail = CompletionDetail::Connected {
            descriptor: net.descriptor.clone(),
            configuration: net.configuration.clone(),
            properties: as_updates(&net.properties),
        };
        debug!(network = %network, device = %from.short(), "device connected");
        self.complete(from, op, Outcome::success(), detail);
    }

    fn authenticate(
        &mut self,
        from: DeviceId,
        op: OperationId,
        network: NetworkId,
        entity: EntityId,
        token: String,
        invitation: InvitationId,
    ) {
        let Some(net) = self.networks.get_mut(&network) else {
            self.fail(from, op, StateChangeResult::NetworkNoLongerExists);
            return;
        };
        let admitted = net
            .invitations
            .iter()
            .any(|(inv, _)| inv.identifier == invitation && inv.admits(&entity));
        let result = if token.is_empty() || net.banned_users.contains(&entity) || !admitted {
            Some(StateChangeResult::UserNotAuthorized)
        } else if net.user_count() >= net.configuration.max_user_count as usize {
            Some(StateChangeResult::NetworkLimitReached)
        } else if net.devices_of(&entity, from) >= net.configuration.max_devices_per_user as usize {
            Some(StateChangeResult::NetworkLimitReached)
        } else {
            match net.device(from) {
                None => Some(StateChangeResult::NetworkNoLongerExists),
                Some(device) if device.users.contains(&entity) => None,
                Some(device) if device.users.len() >= net.configuration.max_users_per_device as usize => {
                    Some(StateChangeResult::NetworkLimitReached)
                }
                Some(_) => None,
            }
        };
        if let Some(result) = result {
            self.fail(from, op, result);
            return;
        }

        let mut announce = false;
        if let Some(device) = net.device_mut(from) {
            if !device.users.contains(&entity) {
                device.users.push(entity.clone());
            }
            announce = !device.announced;
            device.announced = true;
        }
        info!(network = %network, entity = %entity, "user authenticated");
        self.succeed(from, op);
        if announce {
            self.announce(network, from);
        }
    }

    /// Introduce a newly authenticated device and replay the population to it
    fn announce(&mut self, network: NetworkId, device: DeviceId) {
        let Some(net) = self.networks.get(&network) else {
            return;
        };
        let audience = net.audience(device);
        let joined = RelayEvent::DeviceJoined {
            network,
            device,
            properties: net.device(device).map(|d| as_updates(&d.properties)).unwrap_or_default(),
        };

        let mut replay = Vec::new();
        for other in net.devices.iter().filter(|d| d.announced && d.id != device) {
            replay.push(RelayEvent::DeviceJoined {
                network,
                device: other.id,
                properties: as_updates(&other.properties),
            });
        }
        for endpoint in net.endpoints.iter().filter(|e| e.device != device) {
            replay.push(RelayEvent::EndpointCreated {
                network,
                endpoint: RemoteEndpointInfo {
                    id: endpoint.id,
                    device: endpoint.device,
                    entity: endpoint.entity.clone(),
                    properties: as_updates(&endpoint.properties),
                },
            });
        }
        for (invitation, creator) in &net.invitations {
            replay.push(RelayEvent::InvitationCreated {
                network,
                invitation: invitation.clone(),
                creator: creator.clone(),
            });
        }
        for control in net.chat_controls.iter().filter(|cc| cc.device != device) {
            replay.push(RelayEvent::ChatControlJoined {
                network,
                chat_control: control.clone(),
            });
        }

        self.broadcast(audience, joined);
        for event in replay {
            self.push(device, event);
        }
    }

    /// Drop one user from a device, and the device from the audience when
    /// it hosts no user anymore
    fn remove_user(&mut self, network: NetworkId, device: DeviceId, entity: &EntityId) {
        let Some(net) = self.networks.get_mut(&network) else {
            return;
        };
        let Some(dev) = net.device_mut(device) else {
            return;
        };
        dev.users.retain(|u| u != entity);
        let now_empty = dev.users.is_empty() && dev.announced;
        if now_empty {
            dev.announced = false;
        }
        let audience = net.audience(device);

        let mut events = Vec::new();
        let endpoints: Vec<_> = net
            .endpoints
            .iter()
            .filter(|e| e.device == device && e.entity.as_ref() == Some(entity))
            .map(|e| e.id)
            .collect();
        net.endpoints.retain(|e| !endpoints.contains(&e.id));
        for endpoint in endpoints {
            events.push(RelayEvent::EndpointDestroyed { network, endpoint });
        }
        let controls: Vec<_> = net
            .chat_controls
            .iter()
            .filter(|cc| cc.device == device && &cc.entity == entity)
            .map(|cc| cc.id)
            .collect();
        net.chat_controls.retain(|cc| !controls.contains(&cc.id));
        for chat_control in controls {
            events.push(RelayEvent::ChatControlLeft {
                network,
                chat_control,
            });
        }
        let revoked: Vec<_> = net
            .invitations
            .iter()
            .filter(|(_, creator)| creator == entity)
            .map(|(inv, _)| inv.identifier.clone())
            .collect();
        net.invitations.retain(|(inv, _)| !revoked.contains(&inv.identifier));
        for invitation in revoked {
            events.push(RelayEvent::InvitationRevoked {
                network,
                invitation,
            });
        }
        if now_empty {
            events.push(RelayEvent::DeviceLeft { network, device });
        }
        for event in events {
            self.broadcast(audience.clone(), event);
        }
        if now_empty {
            self.acknowledge_destroy(device, network, None);
        }
        debug!(network = %network, entity = %entity, "user removed");
    }

    /// Remove a device and everything it owns from a network
    fn remove_device(&mut self, network: NetworkId, device: DeviceId) {
        let Some(net) = self.networks.get_mut(&network) else {
            return;
        };
        let Some(index) = net.devices.iter().position(|d| d.id == device) else {
            return;
        };
        let removed = net.devices.remove(index);
        net.endpoints.retain(|e| e.device != device);
        net.chat_controls.retain(|cc| cc.device != device);
        net.pending_destroys.retain(|p| p.owner != device);
        let audience = net.audience(device);
        let empty = net.devices.is_empty();
        if removed.announced {
            self.broadcast(audience, RelayEvent::DeviceLeft { network, device });
        }
        self.acknowledge_destroy(device, network, None);
        if empty {
            self.networks.remove(&network);
            info!(network = %network, "last device left; network closed");
        }
    }

    fn create_endpoint(
        &mut self,
        from: DeviceId,
        op: OperationId,
        network: NetworkId,
        entity: Option<EntityId>,
        properties: Vec<PropertyUpdate>,
    ) {
        let Some(net) = self.networks.get_mut(&network) else {
            self.fail(from, op, StateChangeResult::NetworkNoLongerExists);
            return;
        };
        let authorized = match (&entity, net.device(from)) {
            (_, None) => false,
            (Some(entity), Some(device)) => device.users.contains(entity),
            (None, Some(device)) => !device.users.is_empty(),
        };
        if !authorized {
            self.fail(from, op, StateChangeResult::UserNotAuthorized);
            return;
        }
        let owned = net.endpoints.iter().filter(|e| e.device == from).count();
        if owned >= net.configuration.max_endpoints_per_device as usize {
            self.fail(from, op, StateChangeResult::NetworkLimitReached);
            return;
        }
        let Some(id) = net.allocate_endpoint_id() else {
            self.fail(from, op, StateChangeResult::NetworkLimitReached);
            return;
        };
        let mut map = BTreeMap::new();
        apply_updates(&mut map, &properties);
        net.endpoints.push(SimEndpoint {
            id,
            device: from,
            entity: entity.clone(),
            properties: map,
        });
        let audience = net.audience(from);
        self.broadcast(
            audience,
            RelayEvent::EndpointCreated {
                network,
                endpoint: RemoteEndpointInfo {
                    id,
                    device: from,
                    entity,
                    properties,
                },
            },
        );
        self.complete(from, op, Outcome::success(), CompletionDetail::EndpointCreated(id));
    }

    fn destroy_endpoint(&mut self, from: DeviceId, op: OperationId, network: NetworkId, endpoint: EndpointId) {
        let Some(net) = self.networks.get_mut(&network) else {
            self.fail(from, op, StateChangeResult::NetworkNoLongerExists);
            return;
        };
        let Some(index) = net
            .endpoints
            .iter()
            .position(|e| e.id == endpoint && e.device == from)
        else {
            self.fail(from, op, StateChangeResult::PartyServiceError);
            return;
        };
        net.endpoints.remove(index);
        let awaiting = net.audience(from);
        if awaiting.is_empty() {
            self.succeed(from, op);
            return;
        }
        net.pending_destroys.push(PendingDestroy {
            owner: from,
            op,
            endpoint,
            awaiting: awaiting.clone(),
        });
        self.broadcast(awaiting, RelayEvent::EndpointDestroyed { network, endpoint });
    }

    /// Record that `device` processed a destroy; `None` acknowledges every
    /// destroy it still owed, as when it leaves
    fn acknowledge_destroy(&mut self, device: DeviceId, network: NetworkId, endpoint: Option<EndpointId>) {
        let Some(net) = self.networks.get_mut(&network) else {
            return;
        };
        let mut finished = Vec::new();
        net.pending_destroys.retain_mut(|pending| {
            if endpoint.map_or(true, |id| id == pending.endpoint) {
                pending.awaiting.retain(|d| *d != device);
            }
            if pending.awaiting.is_empty() {
                finished.push((pending.owner, pending.op));
                false
            } else {
                true
            }
        });
        for (owner, op) in finished {
            self.succeed(owner, op);
        }
    }

    fn create_invitation(
        &mut self,
        from: DeviceId,
        op: OperationId,
        network: NetworkId,
        creator: EntityId,
        invitation: AppliedInvitation,
    ) {
        let Some(net) = self.networks.get_mut(&network) else {
            self.fail(from, op, StateChangeResult::NetworkNoLongerExists);
            return;
        };
        if !net.hosts_user(from, &creator) {
            self.fail(from, op, StateChangeResult::UserNotAuthorized);
            return;
        }
        if net
            .invitations
            .iter()
            .any(|(inv, _)| inv.identifier == invitation.identifier)
        {
            self.fail(from, op, StateChangeResult::PartyServiceError);
            return;
        }
        net.invitations.push((invitation.clone(), creator.clone()));
        let audience = net.audience(from);
        self.broadcast(
            audience,
            RelayEvent::InvitationCreated {
                network,
                invitation,
                creator,
            },
        );
        self.succeed(from, op);
    }

    fn revoke_invitation(
        &mut self,
        from: DeviceId,
        op: OperationId,
        network: NetworkId,
        entity: EntityId,
        invitation: InvitationId,
    ) {
        let Some(net) = self.networks.get_mut(&network) else {
            self.fail(from, op, StateChangeResult::NetworkNoLongerExists);
            return;
        };
        let Some(index) = net
            .invitations
            .iter()
            .position(|(inv, _)| inv.identifier == invitation)
        else {
            self.fail(from, op, StateChangeResult::PartyServiceError);
            return;
        };
        let (applied, creator) = &net.invitations[index];
        if !net.hosts_user(from, &entity)
            || (applied.revocability == InvitationRevocability::Creator && *creator != entity)
        {
            self.fail(from, op, StateChangeResult::UserNotAuthorized);
            return;
        }
        net.invitations.remove(index);
        let audience = net.audience(from);
        self.broadcast(
            audience,
            RelayEvent::InvitationRevoked {
                network,
                invitation,
            },
        );
        self.succeed(from, op);
    }

    fn requester_is_creator(&self, from: DeviceId, network: NetworkId) -> bool {
        self.networks
            .get(&network)
            .is_some_and(|net| net.hosts_user(from, &net.creator))
    }

    fn kick_device(&mut self, from: DeviceId, op: OperationId, network: NetworkId, target: DeviceId) {
        if !self.requester_is_creator(from, network) {
            self.fail(from, op, StateChangeResult::UserNotAuthorized);
            return;
        }
        if let Some(net) = self.networks.get_mut(&network) {
            net.banned_devices.insert(target);
        }
        if self.networks.get(&network).is_some_and(|n| n.device(target).is_some()) {
            info!(network = %network, device = %target.short(), "device kicked");
            self.remove_device(network, target);
            self.push(
                target,
                RelayEvent::Disconnected {
                    network,
                    reason: DisconnectReason::Kicked,
                },
            );
        }
        self.succeed(from, op);
    }

    fn kick_user(&mut self, from: DeviceId, op: OperationId, network: NetworkId, target: EntityId) {
        if !self.requester_is_creator(from, network) {
            self.fail(from, op, StateChangeResult::UserNotAuthorized);
            return;
        }
        let host = self.networks.get_mut(&network).and_then(|net| {
            net.banned_users.insert(target.clone());
            net.devices
                .iter()
                .find(|d| d.users.contains(&target))
                .map(|d| d.id)
        });
        if let Some(host) = host {
            info!(network = %network, entity = %target, "user kicked");
            self.remove_user(network, host, &target);
            self.push(
                host,
                RelayEvent::UserKicked {
                    network,
                    entity: target,
                },
            );
        }
        self.succeed(from, op);
    }

    fn set_properties(
        &mut self,
        from: DeviceId,
        network: NetworkId,
        scope: PropertyScope,
        updates: Vec<PropertyUpdate>,
    ) {
        let Some(net) = self.networks.get_mut(&network) else {
            return;
        };
        let applied = match scope {
            PropertyScope::Network => {
                apply_updates(&mut net.properties, &updates);
                true
            }
            PropertyScope::Device(id) if id == from => match net.device_mut(from) {
                Some(device) => {
                    apply_updates(&mut device.properties, &updates);
                    true
                }
                None => false,
            },
            PropertyScope::Device(_) => false,
            PropertyScope::Endpoint(id) => match net
                .endpoints
                .iter_mut()
                .find(|e| e.id == id && e.device == from)
            {
                Some(endpoint) => {
                    apply_updates(&mut endpoint.properties, &updates);
                    true
                }
                None => false,
            },
        };
        if !applied {
            debug!(network = %network, scope = ?scope, "property update rejected");
            return;
        }
        let audience = net.audience(from);
        self.broadcast(
            audience,
            RelayEvent::PropertiesChanged {
                network,
                scope,
                updates,
            },
        );
    }

    fn connect_chat_control(
        &mut self,
        from: DeviceId,
        op: OperationId,
        network: NetworkId,
        chat_control: ChatControlId,
        entity: EntityId,
    ) {
        let Some(net) = self.networks.get_mut(&network) else {
            self.fail(from, op, StateChangeResult::NetworkNoLongerExists);
            return;
        };
        if !net.hosts_user(from, &entity) {
            self.fail(from, op, StateChangeResult::UserNotAuthorized);
            return;
        }
        if !net.chat_controls.iter().any(|cc| cc.id == chat_control) {
            let info = RemoteChatControlInfo {
                id: chat_control,
                device: from,
                entity,
            };
            net.chat_controls.push(info.clone());
            let audience = net.audience(from);
            self.broadcast(
                audience,
                RelayEvent::ChatControlJoined {
                    network,
                    chat_control: info,
                },
            );
        }
        self.succeed(from, op);
    }

    fn route_packet(&mut self, from: DeviceId, network: NetworkId, to: DeviceId, payload: Vec<u8>) {
        let reachable = self
            .networks
            .get(&network)
            .is_some_and(|net| net.device(from).is_some() && net.device(to).is_some());
        if !reachable {
            self.stats.packets_dropped += 1;
            return;
        }
        self.packets_routed += 1;
        let cadence_drop = self
            .loss
            .drop_every
            .is_some_and(|n| n > 0 && self.packets_routed % u64::from(n) == 0);
        if cadence_drop || self.loss.isolated.contains(&from) || self.loss.isolated.contains(&to) {
            trace!(from = %from.short(), to = %to.short(), "packet dropped");
            self.stats.packets_dropped += 1;
            return;
        }
        self.stats.packets_delivered += 1;
        self.push(to, RelayEvent::PacketReceived { network, from, payload });
    }
}

// ----------------------------------------------------------------------------
// Public Handle
// ----------------------------------------------------------------------------

/// Shared in-memory relay; clones refer to the same relay
#[derive(Debug, Clone, Default)]
pub struct SimulatedRelay {
    state: Arc<Mutex<RelayState>>,
}

impl SimulatedRelay {
    /// A relay offering one region
    pub fn new() -> Self {
        Self::with_regions(vec![RegionInfo {
            name: "simulated-east".to_string(),
            round_trip_latency_ms: 20,
        }])
    }

    pub fn with_regions(regions: Vec<RegionInfo>) -> Self {
        let relay = Self::default();
        relay.state.lock().regions = regions;
        relay
    }

    /// Transport for one local device
    pub fn link(&self, device: DeviceId) -> Arc<RelayLink> {
        self.state.lock().inboxes.entry(device).or_default();
        Arc::new(RelayLink {
            device,
            state: Arc::clone(&self.state),
        })
    }

    // ------------------------------------------------------------------------
    // Faults
    // ------------------------------------------------------------------------

    /// Fail the next request named `request` (see `RelayRequest::name`)
    pub fn fail_next(&self, request: &'static str, result: StateChangeResult) {
        self.state.lock().failures.entry(request).or_default().push(result);
    }

    /// Hold every event for `device` until [`resume`](Self::resume)
    pub fn pause(&self, device: DeviceId) {
        self.state.lock().paused.insert(device);
    }

    pub fn resume(&self, device: DeviceId) {
        self.state.lock().paused.remove(&device);
    }

    pub fn drop_every_nth_packet(&self, n: Option<u32>) {
        self.state.lock().loss.drop_every = n;
    }

    pub fn isolate(&self, device: DeviceId) {
        self.state.lock().loss.isolated.insert(device);
    }

    pub fn heal(&self, device: DeviceId) {
        self.state.lock().loss.isolated.remove(&device);
    }

    /// Close a network under every connected device
    pub fn close_network(&self, network: NetworkId) {
        let mut state = self.state.lock();
        let Some(net) = state.networks.remove(&network) else {
            return;
        };
        info!(network = %network, "network closed by the relay");
        for device in net.devices {
            state.push(
                device.id,
                RelayEvent::Disconnected {
                    network,
                    reason: DisconnectReason::NetworkClosed,
                },
            );
        }
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn statistics(&self) -> RelayStatistics {
        self.state.lock().stats
    }

    /// How many requests named `request` the relay has seen
    pub fn requests_seen(&self, request: &str) -> usize {
        self.state
            .lock()
            .requests_seen
            .get(request)
            .copied()
            .unwrap_or_default()
    }

    pub fn network_exists(&self, network: NetworkId) -> bool {
        self.state.lock().networks.contains_key(&network)
    }

    pub fn devices_in(&self, network: NetworkId) -> Vec<DeviceId> {
        self.state
            .lock()
            .networks
            .get(&network)
            .map(|net| net.devices.iter().map(|d| d.id).collect())
            .unwrap_or_default()
    }

    pub fn endpoints_in(&self, network: NetworkId) -> Vec<EndpointId> {
        self.state
            .lock()
            .networks
            .get(&network)
            .map(|net| net.endpoints.iter().map(|e| e.id).collect())
            .unwrap_or_default()
    }

    pub fn network_property(&self, network: NetworkId, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .networks
            .get(&network)
            .and_then(|net| net.properties.get(key).cloned())
    }

    /// Destroys still waiting on acknowledgements
    pub fn pending_destroys(&self, network: NetworkId) -> usize {
        self.state
            .lock()
            .networks
            .get(&network)
            .map(|net| net.pending_destroys.len())
            .unwrap_or_default()
    }
}

/// One device's connection to a [`SimulatedRelay`]
#[derive(Debug)]
pub struct RelayLink {
    device: DeviceId,
    state: Arc<Mutex<RelayState>>,
}

impl RelayLink {
    pub fn device(&self) -> DeviceId {
        self.device
    }
}

impl RelayTransport for RelayLink {
    fn submit(&self, request: RelayRequest) {
        self.state.lock().handle(self.device, request);
    }

    fn poll_events(&self) -> Vec<RelayEvent> {
        let mut state = self.state.lock();
        if state.paused.contains(&self.device) {
            return Vec::new();
        }
        state
            .inboxes
            .get_mut(&self.device)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partyline_core::InvitationConfiguration;

    fn entity(name: &str) -> EntityId {
        EntityId::new(name).unwrap()
    }

    fn open_invitation() -> AppliedInvitation {
        AppliedInvitation::resolve(&InvitationConfiguration {
            identifier: Some(InvitationId::new("open").unwrap()),
            ..Default::default()
        })
        .unwrap()
    }

    fn completion(events: &[RelayEvent], op: OperationId) -> Option<(Outcome, CompletionDetail)> {
        events.iter().find_map(|event| match event {
            RelayEvent::OperationCompleted { op: o, outcome, detail } if *o == op => {
                Some((*outcome, detail.clone()))
            }
            _ => None,
        })
    }

    /// Create a network from `host` and authenticate `alice` in it
    fn hosted_network(relay: &SimulatedRelay, host: &RelayLink) -> NetworkId {
        let network = NetworkId::random();
        host.submit(RelayRequest::CreateNetwork {
            op: OperationId::new(1),
            network,
            creator: entity("alice"),
            token: "token".into(),
            configuration: NetworkConfiguration::default(),
            regions: vec![],
            invitation: open_invitation(),
        });
        host.submit(RelayRequest::Connect {
            op: OperationId::new(2),
            network,
            connectivity: Default::default(),
            bind_address: None,
        });
        host.submit(RelayRequest::Authenticate {
            op: OperationId::new(3),
            network,
            entity: entity("alice"),
            token: "token".into(),
            invitation: InvitationId::new("open").unwrap(),
        });
        let events = host.poll_events();
        assert!(completion(&events, OperationId::new(3)).unwrap().0.is_success());
        assert!(relay.network_exists(network));
        network
    }

    #[test]
    fn test_endpoint_ids_are_never_reused() {
        let relay = SimulatedRelay::new();
        let host = relay.link(DeviceId::random());
        let network = hosted_network(&relay, &host);

        host.submit(RelayRequest::CreateEndpoint {
            op: OperationId::new(10),
            network,
            entity: Some(entity("alice")),
            properties: vec![],
        });
        host.submit(RelayRequest::DestroyEndpoint {
            op: OperationId::new(11),
            network,
            endpoint: EndpointId::new(1),
        });
        host.submit(RelayRequest::CreateEndpoint {
            op: OperationId::new(12),
            network,
            entity: Some(entity("alice")),
            properties: vec![],
        });
        let events = host.poll_events();
        assert_eq!(
            completion(&events, OperationId::new(12)).unwrap().1,
            CompletionDetail::EndpointCreated(EndpointId::new(2))
        );
        assert_eq!(relay.endpoints_in(network), vec![EndpointId::new(2)]);
    }

    #[test]
    fn test_destroy_waits_for_every_acknowledgement() {
        let relay = SimulatedRelay::new();
        let host = relay.link(DeviceId::random());
        let network = hosted_network(&relay, &host);
        let guest = relay.link(DeviceId::random());
        guest.submit(RelayRequest::Connect {
            op: OperationId::new(1),
            network,
            connectivity: Default::default(),
            bind_address: None,
        });
        guest.submit(RelayRequest::Authenticate {
            op: OperationId::new(2),
            network,
            entity: entity("bob"),
            token: "token".into(),
            invitation: InvitationId::new("open").unwrap(),
        });
        guest.poll_events();

        host.submit(RelayRequest::CreateEndpoint {
            op: OperationId::new(20),
            network,
            entity: Some(entity("alice")),
            properties: vec![],
        });
        host.submit(RelayRequest::DestroyEndpoint {
            op: OperationId::new(21),
            network,
            endpoint: EndpointId::new(1),
        });
        assert!(completion(&host.poll_events(), OperationId::new(21)).is_none());
        assert_eq!(relay.pending_destroys(network), 1);

        guest.submit(RelayRequest::AckEndpointDestroyed {
            network,
            endpoint: EndpointId::new(1),
        });
        assert!(completion(&host.poll_events(), OperationId::new(21)).is_some());
        assert_eq!(relay.pending_destroys(network), 0);
    }

    #[test]
    fn test_uninvited_user_is_refused() {
        let relay = SimulatedRelay::new();
        let host = relay.link(DeviceId::random());
        let network = hosted_network(&relay, &host);
        let guest = relay.link(DeviceId::random());
        guest.submit(RelayRequest::Connect {
            op: OperationId::new(1),
            network,
            connectivity: Default::default(),
            bind_address: None,
        });
        guest.submit(RelayRequest::Authenticate {
            op: OperationId::new(2),
            network,
            entity: entity("mallory"),
            token: "token".into(),
            invitation: InvitationId::new("missing").unwrap(),
        });
        let (outcome, _) = completion(&guest.poll_events(), OperationId::new(2)).unwrap();
        assert_eq!(outcome.result, StateChangeResult::UserNotAuthorized);
    }

    #[test]
    fn test_user_already_on_another_device_hits_the_limit() {
        let relay = SimulatedRelay::new();
        let host = relay.link(DeviceId::random());
        let network = hosted_network(&relay, &host);
        let tablet = relay.link(DeviceId::random());
        tablet.submit(RelayRequest::Connect {
            op: OperationId::new(1),
            network,
            connectivity: Default::default(),
            bind_address: None,
        });
        tablet.submit(RelayRequest::Authenticate {
            op: OperationId::new(2),
            network,
            entity: entity("alice"),
            token: "token".into(),
            invitation: InvitationId::new("open").unwrap(),
        });
        let (outcome, _) = completion(&tablet.poll_events(), OperationId::new(2)).unwrap();
        assert_eq!(outcome.result, StateChangeResult::NetworkLimitReached);

        // re-authenticating on the original device is not a new device
        host.submit(RelayRequest::Authenticate {
            op: OperationId::new(4),
            network,
            entity: entity("alice"),
            token: "token".into(),
            invitation: InvitationId::new("open").unwrap(),
        });
        let (outcome, _) = completion(&host.poll_events(), OperationId::new(4)).unwrap();
        assert!(outcome.is_success());
    }

    #[test]
    fn test_creator_only_invitation_refuses_other_revokers() {
        let relay = SimulatedRelay::new();
        let host = relay.link(DeviceId::random());
        let network = hosted_network(&relay, &host);
        let guest = relay.link(DeviceId::random());
        guest.submit(RelayRequest::Connect {
            op: OperationId::new(1),
            network,
            connectivity: Default::default(),
            bind_address: None,
        });
        guest.submit(RelayRequest::Authenticate {
            op: OperationId::new(2),
            network,
            entity: entity("bob"),
            token: "token".into(),
            invitation: InvitationId::new("open").unwrap(),
        });
        guest.poll_events();

        guest.submit(RelayRequest::RevokeInvitation {
            op: OperationId::new(3),
            network,
            entity: entity("bob"),
            invitation: InvitationId::new("open").unwrap(),
        });
        let (outcome, _) = completion(&guest.poll_events(), OperationId::new(3)).unwrap();
        assert_eq!(outcome.result, StateChangeResult::UserNotAuthorized);

        host.submit(RelayRequest::RevokeInvitation {
            op: OperationId::new(5),
            network,
            entity: entity("alice"),
            invitation: InvitationId::new("open").unwrap(),
        });
        let (outcome, _) = completion(&host.poll_events(), OperationId::new(5)).unwrap();
        assert!(outcome.is_success());
    }

    #[test]
    fn test_cadence_loss_and_pause() {
        let relay = SimulatedRelay::new();
        let host = relay.link(DeviceId::random());
        let network = hosted_network(&relay, &host);
        let guest_id = DeviceId::random();
        let guest = relay.link(guest_id);
        guest.submit(RelayRequest::Connect {
            op: OperationId::new(1),
            network,
            connectivity: Default::default(),
            bind_address: None,
        });
        guest.poll_events();

        relay.drop_every_nth_packet(Some(2));
        relay.pause(guest_id);
        for byte in 0..4u8 {
            host.submit(RelayRequest::SendPacket {
                network,
                to: guest_id,
                payload: vec![byte],
            });
        }
        assert!(guest.poll_events().is_empty());
        relay.resume(guest_id);
        assert_eq!(guest.poll_events().len(), 2);
        assert_eq!(relay.statistics().packets_dropped, 2);
    }

    #[test]
    fn test_injected_failure_applies_once() {
        let relay = SimulatedRelay::new();
        let host = relay.link(DeviceId::random());
        relay.fail_next("QueryRegions", StateChangeResult::InternetConnectivityError);
        host.submit(RelayRequest::QueryRegions { op: OperationId::new(1) });
        host.submit(RelayRequest::QueryRegions { op: OperationId::new(2) });
        let events = host.poll_events();
        assert!(!completion(&events, OperationId::new(1)).unwrap().0.is_success());
        assert!(completion(&events, OperationId::new(2)).unwrap().0.is_success());
        assert_eq!(relay.requests_seen("QueryRegions"), 2);
    }
}
