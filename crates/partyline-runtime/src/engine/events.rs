//! Relay event dispatch
//!
//! Each [`RelayEvent`] is applied to the live graph and turned into the
//! state changes that describe it. Events naming a network this device no
//! longer tracks are dropped.

use partyline_core::{
    AppliedInvitation, ChatControlId, DeviceId, EndpointId, EntityId, Handle, InvitationId,
    NetworkId, Outcome, PropertyUpdate, SharedProperties, StateChangeResult, Timestamp,
};
use tracing::{debug, trace, warn};

use super::EngineState;
use crate::changes::{
    ChatControlDestroyedReason, ChatControlLeftReason, EndpointDestroyedReason,
    InvitationDestroyedReason, LocalUserRemovedReason, NetworkDestroyedReason, StateChangeKind,
};
use crate::entities::{
    ChatControl, Device, Endpoint, EndpointState, Invitation, InvitationState, TextFilterLevel,
};
use crate::network::Network;
use crate::relay::{
    DisconnectReason, PropertyScope, RelayEvent, RemoteChatControlInfo, RemoteEndpointInfo,
};

impl EngineState {
    pub(crate) fn dispatch(&mut self, event: RelayEvent, now: Timestamp) {
        trace!(event = event.name(), "relay event");
        match event {
            RelayEvent::OperationCompleted {
                op,
                outcome,
                detail,
            } => match self.pending_ops.remove(&op) {
                Some(pending) => self.complete_op(pending, outcome, detail, now),
                None => debug!(op = %op, "completion for an operation nobody waits on"),
            },
            RelayEvent::DeviceJoined {
                network,
                device,
                properties,
            } => {
                if let Some(network) = self.tracked(network) {
                    self.remote_device_join(network, device, properties);
                }
            }
            RelayEvent::DeviceLeft { network, device } => {
                let Some(network) = self.tracked(network) else {
                    return;
                };
                if let Some(device) = self.device_index.get(&device).copied() {
                    self.remote_device_leave(network, device);
                }
            }
            RelayEvent::EndpointCreated { network, endpoint } => {
                if let Some(network) = self.tracked(network) {
                    self.remote_endpoint_created(network, endpoint);
                }
            }
            RelayEvent::EndpointDestroyed { network, endpoint } => {
                if let Some(network) = self.tracked(network) {
                    self.remote_endpoint_destroyed(network, endpoint);
                }
            }
            RelayEvent::InvitationCreated {
                network,
                invitation,
                creator,
            } => {
                if let Some(network) = self.tracked(network) {
                    self.remote_invitation_created(network, invitation, creator);
                }
            }
            RelayEvent::InvitationRevoked {
                network,
                invitation,
            } => {
                if let Some(network) = self.tracked(network) {
                    self.remote_invitation_revoked(network, &invitation);
                }
            }
            RelayEvent::PropertiesChanged {
                network,
                scope,
                updates,
            } => {
                if let Some(network) = self.tracked(network) {
                    self.remote_properties_changed(network, scope, updates);
                }
            }
            RelayEvent::ChatControlJoined {
                network,
                chat_control,
            } => {
                if let Some(network) = self.tracked(network) {
                    self.remote_chat_control_joined(network, chat_control);
                }
            }
            RelayEvent::ChatControlLeft {
                network,
                chat_control,
            } => {
                let Some(network) = self.tracked(network) else {
                    return;
                };
                self.remote_chat_control_left(network, chat_control);
            }
            RelayEvent::PacketReceived {
                network,
                from,
                payload,
            } => {
                if let Some(network) = self.tracked(network) {
                    self.receive_packet(network, from, &payload, now);
                }
            }
            RelayEvent::UserKicked { network, entity } => {
                if let Some(network) = self.tracked(network) {
                    self.local_user_kicked(network, &entity, now);
                }
            }
            RelayEvent::Disconnected { network, reason } => {
                let Some(network) = self.tracked(network) else {
                    return;
                };
                let (reason, outcome) = match reason {
                    DisconnectReason::Kicked => (
                        NetworkDestroyedReason::Kicked,
                        Outcome::failure(StateChangeResult::UserNotAuthorized),
                    ),
                    DisconnectReason::NetworkClosed => (
                        NetworkDestroyedReason::NetworkNoLongerExists,
                        Outcome::failure(StateChangeResult::NetworkNoLongerExists),
                    ),
                    DisconnectReason::Unresponsive => (
                        NetworkDestroyedReason::DestinationFailure,
                        Outcome::failure(StateChangeResult::InternetConnectivityError),
                    ),
                };
                self.destroy_network(network, reason, outcome);
            }
        }
    }

    fn tracked(&self, id: NetworkId) -> Option<Handle<Network>> {
        let handle = self.network_by_id(id);
        if handle.is_none() {
            trace!(network = %id, "event for an untracked network");
        }
        handle
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    fn remote_device_join(
        &mut self,
        network: Handle<Network>,
        id: DeviceId,
        properties: Vec<PropertyUpdate>,
    ) {
        if id == self.local_device_id {
            return;
        }
        let existing = self
            .device_index
            .get(&id)
            .copied()
            .filter(|device| self.tables.devices.resolve(*device).is_ok_and(|d| !d.destroyed));
        let device = match existing {
            Some(device) => device,
            None => {
                let device = self.tables.devices.allocate(Device::new(id, false));
                self.device_index.insert(id, device);
                self.emit(StateChangeKind::RemoteDeviceCreated { device });
                device
            }
        };

        let Ok(net) = self.tables.networks.resolve_mut(network) else {
            return;
        };
        if net.devices.contains(&device) {
            return;
        }
        net.devices.push(device);
        if let Ok(dev) = self.tables.devices.resolve_mut(device) {
            dev.networks.push(network);
        }
        debug!(device = %id, "remote device joined");
        self.emit(StateChangeKind::RemoteDeviceJoinedNetwork { network, device });
        if !properties.is_empty() {
            self.emit(StateChangeKind::DevicePropertiesChanged {
                network,
                device,
                updates: properties,
            });
        }
    }

    /// Remove a remote device from one network, destroying it once it is in
    /// no network at all
    pub(crate) fn remote_device_leave(&mut self, network: Handle<Network>, device: Handle<Device>) {
        let Ok(net) = self.tables.networks.resolve(network) else {
            return;
        };
        if !net.devices.contains(&device) {
            return;
        }
        let endpoints: Vec<_> = net
            .endpoints
            .iter()
            .copied()
            .filter(|ep| {
                self.tables
                    .endpoints
                    .resolve(*ep)
                    .is_ok_and(|e| e.device == device)
            })
            .collect();
        let controls: Vec<_> = net
            .chat_controls
            .iter()
            .copied()
            .filter(|cc| {
                self.tables
                    .chat_controls
                    .resolve(*cc)
                    .is_ok_and(|c| c.device == device)
            })
            .collect();
        let Ok(dev) = self.tables.devices.resolve(device) else {
            return;
        };
        let id = dev.id;

        for endpoint in endpoints {
            self.destroy_endpoint_locally(
                endpoint,
                EndpointDestroyedReason::DeviceLeft,
                StateChangeResult::CanceledByTitle,
            );
        }
        for control in controls {
            self.chat_leave_network(
                control,
                network,
                ChatControlLeftReason::DeviceLeft,
                StateChangeResult::CanceledByTitle,
            );
        }
        if let Ok(net) = self.tables.networks.resolve_mut(network) {
            net.devices.retain(|d| *d != device);
            net.transport.delivery.forget_device(id);
            net.transport.reassembler.forget_source(id);
            net.transport.pending_acks.remove(&id);
        }
        let remaining = match self.tables.devices.resolve_mut(device) {
            Ok(dev) => {
                dev.networks.retain(|n| *n != network);
                dev.networks.len()
            }
            Err(_) => return,
        };
        debug!(device = %id, "remote device left");
        self.emit(StateChangeKind::RemoteDeviceLeftNetwork { network, device });
        if remaining > 0 {
            return;
        }

        let controls = match self.tables.devices.resolve_mut(device) {
            Ok(dev) => {
                dev.destroyed = true;
                std::mem::take(&mut dev.chat_controls)
            }
            Err(_) => return,
        };
        for control in controls {
            if let Ok(cc) = self.tables.chat_controls.resolve_mut(control) {
                if cc.destroyed {
                    continue;
                }
                cc.destroyed = true;
            }
            self.emit(StateChangeKind::ChatControlDestroyed {
                chat_control: control,
                reason: ChatControlDestroyedReason::DeviceLeft,
            });
            self.destroy_handle(control.raw());
        }
        self.emit(StateChangeKind::RemoteDeviceDestroyed { device });
        self.destroy_handle(device.raw());
    }

    // ------------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------------

    fn remote_endpoint_created(&mut self, network: Handle<Network>, info: RemoteEndpointInfo) {
        if info.device == self.local_device_id {
            return;
        }
        let Some(device) = self.device_index.get(&info.device).copied() else {
            warn!(endpoint = %info.id, device = %info.device, "endpoint from an unknown device");
            return;
        };
        let Ok(net) = self.tables.networks.resolve(network) else {
            return;
        };
        if net.endpoint_index.contains_key(&info.id) {
            debug!(endpoint = %info.id, "endpoint announced twice");
            return;
        }
        let mut properties = SharedProperties::new();
        properties.apply(&info.properties);

        let endpoint = self.tables.endpoints.allocate(Endpoint {
            network,
            device,
            device_id: info.device,
            local: false,
            user: None,
            entity: info.entity,
            id: Some(info.id),
            published_id: None,
            state: EndpointState::Active,
            properties,
        });
        if let Ok(net) = self.tables.networks.resolve_mut(network) {
            net.endpoints.push(endpoint);
            net.endpoint_index.insert(info.id, endpoint);
        }
        self.emit(StateChangeKind::EndpointCreated { network, endpoint });
    }

    fn remote_endpoint_destroyed(&mut self, network: Handle<Network>, id: EndpointId) {
        let Some(endpoint) = self
            .tables
            .networks
            .resolve(network)
            .ok()
            .and_then(|net| net.endpoint_index.get(&id).copied())
        else {
            return;
        };
        let local = match self.tables.endpoints.resolve(endpoint) {
            Ok(ep) => ep.local,
            Err(_) => return,
        };
        if local {
            // local destruction completes through the destroy request
            trace!(endpoint = %id, "relay echoed a local endpoint destroy");
            return;
        }
        self.destroy_endpoint_locally(
            endpoint,
            EndpointDestroyedReason::RemoteDestroyed,
            StateChangeResult::CanceledByTitle,
        );
    }

    // ------------------------------------------------------------------------
    // Invitations
    // ------------------------------------------------------------------------

    fn invitation_by_id(&self, network: Handle<Network>, id: &InvitationId) -> Option<Handle<Invitation>> {
        let net = self.tables.networks.resolve(network).ok()?;
        net.invitations.iter().copied().find(|inv| {
            self.tables
                .invitations
                .resolve(*inv)
                .is_ok_and(|i| i.is_live() && i.id() == id)
        })
    }

    fn remote_invitation_created(
        &mut self,
        network: Handle<Network>,
        config: AppliedInvitation,
        creator: EntityId,
    ) {
        if self.invitation_by_id(network, &config.identifier).is_some() {
            return;
        }
        let local_creator = self.tables.networks.resolve(network).ok().and_then(|net| {
            net.members.iter().map(|m| m.user).find(|user| {
                self.tables
                    .users
                    .resolve(*user)
                    .is_ok_and(|u| u.entity == creator)
            })
        });
        let invitation = self.tables.invitations.allocate(Invitation {
            network,
            config,
            creator,
            local_creator,
            state: InvitationState::Active,
        });
        if let Ok(net) = self.tables.networks.resolve_mut(network) {
            net.invitations.push(invitation);
        }
        self.emit(StateChangeKind::InvitationCreated {
            network,
            invitation,
        });
    }

    fn remote_invitation_revoked(&mut self, network: Handle<Network>, id: &InvitationId) {
        if let Some(invitation) = self.invitation_by_id(network, id) {
            self.destroy_invitation(
                invitation,
                InvitationDestroyedReason::Revoked,
                StateChangeResult::CanceledByTitle,
            );
        }
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    fn remote_properties_changed(
        &mut self,
        network: Handle<Network>,
        scope: PropertyScope,
        updates: Vec<PropertyUpdate>,
    ) {
        if updates.is_empty() {
            return;
        }
        match scope {
            PropertyScope::Network => {
                self.emit(StateChangeKind::NetworkPropertiesChanged { network, updates });
            }
            PropertyScope::Device(id) => {
                if id == self.local_device_id {
                    return;
                }
                if let Some(device) = self.device_index.get(&id).copied() {
                    self.emit(StateChangeKind::DevicePropertiesChanged {
                        network,
                        device,
                        updates,
                    });
                }
            }
            PropertyScope::Endpoint(id) => {
                let Some(endpoint) = self
                    .tables
                    .networks
                    .resolve(network)
                    .ok()
                    .and_then(|net| net.endpoint_index.get(&id).copied())
                else {
                    return;
                };
                if self.tables.endpoints.resolve(endpoint).is_ok_and(|ep| !ep.local) {
                    self.emit(StateChangeKind::EndpointPropertiesChanged {
                        network,
                        endpoint,
                        updates,
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Chat Controls
    // ------------------------------------------------------------------------

    fn remote_chat_control_joined(&mut self, network: Handle<Network>, info: RemoteChatControlInfo) {
        if info.device == self.local_device_id {
            return;
        }
        let Some(device) = self.device_index.get(&info.device).copied() else {
            warn!(chat_control = %info.id, "chat control from an unknown device");
            return;
        };
        let existing = self
            .chat_index
            .get(&info.id)
            .copied()
            .filter(|cc| self.tables.chat_controls.resolve(*cc).is_ok_and(|c| !c.destroyed));
        let chat_control = match existing {
            Some(chat_control) => chat_control,
            None => {
                let chat_control = self.tables.chat_controls.allocate(ChatControl {
                    id: info.id,
                    device,
                    device_id: info.device,
                    local: false,
                    user: None,
                    entity: info.entity,
                    language: None,
                    filter_level: TextFilterLevel::default(),
                    networks: Vec::new(),
                    transitioning: Default::default(),
                    permissions: Default::default(),
                    muted_text: Default::default(),
                    outbox: Vec::new(),
                    destroyed: false,
                });
                self.chat_index.insert(info.id, chat_control);
                if let Ok(dev) = self.tables.devices.resolve_mut(device) {
                    dev.chat_controls.push(chat_control);
                }
                self.emit(StateChangeKind::ChatControlCreated { chat_control });
                chat_control
            }
        };

        let Ok(control) = self.tables.chat_controls.resolve_mut(chat_control) else {
            return;
        };
        if control.networks.contains(&network) {
            return;
        }
        control.networks.push(network);
        if let Ok(net) = self.tables.networks.resolve_mut(network) {
            net.chat_controls.push(chat_control);
        }
        self.emit(StateChangeKind::ChatControlJoinedNetwork {
            network,
            chat_control,
        });
    }

    fn remote_chat_control_left(&mut self, network: Handle<Network>, id: ChatControlId) {
        let Some(chat_control) = self.chat_index.get(&id).copied() else {
            return;
        };
        if self
            .tables
            .chat_controls
            .resolve(chat_control)
            .is_ok_and(|control| !control.local)
        {
            self.chat_leave_network(
                chat_control,
                network,
                ChatControlLeftReason::Requested,
                StateChangeResult::CanceledByTitle,
            );
        }
    }

    // ------------------------------------------------------------------------
    // Kicks
    // ------------------------------------------------------------------------

    fn local_user_kicked(&mut self, network: Handle<Network>, entity: &EntityId, now: Timestamp) {
        let user = self.tables.networks.resolve(network).ok().and_then(|net| {
            net.members.iter().map(|m| m.user).find(|user| {
                self.tables
                    .users
                    .resolve(*user)
                    .is_ok_and(|u| &u.entity == entity)
            })
        });
        let Some(user) = user else {
            debug!(entity = %entity, "kick for a user that is not a member");
            return;
        };
        self.remove_user_cascade(
            network,
            user,
            LocalUserRemovedReason::Kicked,
            StateChangeResult::UserNotAuthorized,
        );
        self.after_member_removed(network, now);
    }
}
