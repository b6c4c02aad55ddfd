//! Network session operations: local users, connect/leave, authentication,
//! invitations, kicks, shared properties and session timers

use partyline_core::config::MAX_REGION_NAME_LEN;
use partyline_core::{
    AppliedInvitation, EntityId, Handle, InvitationConfiguration, InvitationId,
    InvitationRevocability, NetworkConfiguration, NetworkDescriptor, NetworkId, Outcome,
    PartyError, PropertyUpdate, Result, StateChangeResult, Timestamp,
};
use tracing::{debug, info, warn};

use super::{EngineState, PendingOp};
use crate::changes::{
    ChatControlDestroyedReason, ChatControlLeftReason, EndpointDestroyedReason,
    InvitationDestroyedReason, LocalUserRemovedReason, NetworkDestroyedReason, StateChangeKind,
};
use crate::entities::{Device, Endpoint, EndpointState, Invitation, InvitationState, LocalUser};
use crate::network::{Membership, MembershipState, Network, NetworkState, SessionEvent};
use crate::relay::{CompletionDetail, PropertyScope, RelayRequest};

/// Regions a create request may list
const MAX_REGION_PREFERENCES: usize = 16;

// ----------------------------------------------------------------------------
// Local Users
// ----------------------------------------------------------------------------

impl EngineState {
    pub fn create_local_user(&mut self, entity: EntityId, token: String) -> Result<Handle<LocalUser>> {
        let duplicate = self
            .tables
            .users
            .iter()
            .any(|(_, user)| !user.destroying && user.entity == entity);
        if duplicate {
            return Err(PartyError::duplicate(entity.as_str()));
        }
        let handle = self.tables.users.allocate(LocalUser::new(entity.clone(), token));
        debug!(entity = %entity, "local user created");
        Ok(handle)
    }

    /// Remove the user from every network, destroy its chat control, then
    /// report `DestroyLocalUserCompleted`
    pub fn destroy_local_user(&mut self, user: Handle<LocalUser>) -> Result<()> {
        let entity = self.live_user(user)?.entity.clone();
        self.tables.users.resolve_mut(user)?.destroying = true;
        let now = self.now();

        if let Some(PendingOp::CreateNetwork {
            descriptor,
            invitation,
            ..
        }) = self.take_op(|op| matches!(op, PendingOp::CreateNetwork { user: u, .. } if *u == user))
        {
            self.emit(StateChangeKind::CreateNewNetworkCompleted {
                outcome: Outcome::failure(StateChangeResult::CanceledByTitle),
                local_user: user,
                descriptor,
                invitation,
            });
        }

        for network in self.networks.clone() {
            let is_member = self
                .tables
                .networks
                .resolve(network)
                .is_ok_and(|net| net.is_live() && net.membership(user).is_some());
            if !is_member {
                continue;
            }
            let id = self.tables.networks.resolve(network)?.id;
            self.submit_detached(|op| RelayRequest::RemoveUser {
                op,
                network: id,
                entity: entity.clone(),
            });
            self.remove_user_cascade(
                network,
                user,
                LocalUserRemovedReason::DestroyLocalUser,
                StateChangeResult::CanceledByTitle,
            );
            self.after_member_removed(network, now);
        }

        let controls: Vec<_> = self
            .tables
            .chat_controls
            .iter()
            .filter(|(_, control)| control.local && control.user == Some(user) && !control.destroyed)
            .map(|(handle, _)| handle)
            .collect();
        for control in controls {
            self.destroy_chat_control_internal(control, ChatControlDestroyedReason::LocalUserDestroyed);
        }

        self.emit(StateChangeKind::DestroyLocalUserCompleted {
            outcome: Outcome::success(),
            local_user: user,
        });
        self.destroy_handle(user.raw());
        info!(entity = %entity, "local user destroyed");
        Ok(())
    }

    pub fn update_entity_token(&mut self, user: Handle<LocalUser>, token: String) -> Result<()> {
        if token.is_empty() {
            return Err(PartyError::invalid_argument("token must not be empty"));
        }
        self.live_user(user)?;
        let local = self.tables.users.resolve_mut(user)?;
        local.token = token.clone();
        let entity = local.entity.clone();
        self.relay.submit(RelayRequest::UpdateToken { entity, token });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Network Lifecycle
// ----------------------------------------------------------------------------

impl EngineState {
    /// Ask the relay to allocate a network; returns the provisional
    /// descriptor and the applied initial invitation id
    pub fn create_new_network(
        &mut self,
        user: Handle<LocalUser>,
        configuration: NetworkConfiguration,
        regions: Vec<String>,
        invitation: &InvitationConfiguration,
    ) -> Result<(NetworkDescriptor, InvitationId)> {
        configuration.validate()?;
        if regions.len() > MAX_REGION_PREFERENCES {
            return Err(PartyError::limit_exceeded("region preference", MAX_REGION_PREFERENCES));
        }
        if let Some(region) = regions
            .iter()
            .find(|r| r.is_empty() || r.len() > MAX_REGION_NAME_LEN)
        {
            return Err(PartyError::invalid_argument(format!(
                "region name '{region}' must be 1..={MAX_REGION_NAME_LEN} characters"
            )));
        }
        let applied = AppliedInvitation::resolve(invitation)?;
        let local = self.live_user(user)?;
        let creator = local.entity.clone();
        let token = local.token.clone();

        let descriptor = NetworkDescriptor::provisional(NetworkId::random());
        let network = descriptor.network_id();
        let invitation_id = applied.identifier.clone();
        self.submit_op(
            PendingOp::CreateNetwork {
                user,
                descriptor: descriptor.clone(),
                invitation: invitation_id.clone(),
            },
            |op| RelayRequest::CreateNetwork {
                op,
                network,
                creator,
                token,
                configuration,
                regions,
                invitation: applied,
            },
        );
        info!(network = %network, "network creation requested");
        Ok((descriptor, invitation_id))
    }

    pub fn connect_to_network(&mut self, descriptor: &NetworkDescriptor) -> Result<Handle<Network>> {
        let id = descriptor.network_id();
        if self.network_by_id(id).is_some() {
            return Err(PartyError::duplicate(id.to_string()));
        }
        let connectivity = self.options.lock().connectivity;
        let network = self
            .tables
            .networks
            .allocate(Network::new(descriptor.clone(), connectivity, &self.config));
        self.networks.push(network);

        let bind_address = self.bind_address.clone();
        self.submit_op(PendingOp::Connect { network }, |op| RelayRequest::Connect {
            op,
            network: id,
            connectivity,
            bind_address,
        });
        info!(network = %id, "connecting to network");
        Ok(network)
    }

    pub fn leave_network(&mut self, network: Handle<Network>) -> Result<()> {
        let id = self.live_network(network)?.id;
        let now = self.now();
        let timings = self.config.session.clone();
        self.tables
            .networks
            .resolve_mut(network)?
            .apply(SessionEvent::LeaveRequested, now, &timings)
            .map_err(|err| PartyError::invalid_state("Leaving", err.to_string()))?;
        self.submit_op(PendingOp::Leave { network }, |op| RelayRequest::Leave {
            op,
            network: id,
        });
        info!(network = %id, "leaving network");
        Ok(())
    }

    /// Tear a network down, emitting every cascade before `NetworkDestroyed`
    pub(crate) fn destroy_network(
        &mut self,
        network: Handle<Network>,
        reason: NetworkDestroyedReason,
        outcome: Outcome,
    ) {
        let now = self.now();
        let timings = self.config.session.clone();
        let id = match self.tables.networks.resolve_mut(network) {
            Ok(net) if net.is_live() => {
                if let Err(err) = net.apply(SessionEvent::Lost, now, &timings) {
                    warn!(network = %net.id, error = %err, "unexpected transition on teardown");
                    net.state = NetworkState::Destroyed;
                }
                net.id
            }
            _ => return,
        };
        let canceled = if reason == NetworkDestroyedReason::Requested {
            StateChangeResult::LeaveNetworkCalled
        } else {
            StateChangeResult::NetworkNoLongerExists
        };

        let members: Vec<_> = self
            .tables
            .networks
            .resolve(network)
            .map(|net| net.members.iter().map(|m| m.user).collect())
            .unwrap_or_default();
        for user in members {
            self.remove_user_cascade(network, user, LocalUserRemovedReason::DestroyNetwork, canceled);
        }

        let (endpoints, invitations, chat_controls, devices) = match self.tables.networks.resolve(network) {
            Ok(net) => (
                net.endpoints.clone(),
                net.invitations.clone(),
                net.chat_controls.clone(),
                net.devices.clone(),
            ),
            Err(_) => return,
        };
        for endpoint in endpoints {
            self.destroy_endpoint_locally(endpoint, EndpointDestroyedReason::NetworkDestroyed, canceled);
        }
        for invitation in invitations {
            self.destroy_invitation(invitation, InvitationDestroyedReason::NetworkDestroyed, canceled);
        }
        for control in chat_controls {
            self.chat_leave_network(control, network, ChatControlLeftReason::NetworkDestroyed, canceled);
        }
        let transitioning: Vec<_> = self
            .tables
            .chat_controls
            .iter()
            .filter(|(_, control)| control.transitioning.contains(&network))
            .map(|(handle, _)| handle)
            .collect();
        for control in transitioning {
            self.chat_leave_network(control, network, ChatControlLeftReason::NetworkDestroyed, canceled);
        }
        for device in devices {
            self.remote_device_leave(network, device);
        }

        let leave_pending = self
            .take_op(|op| matches!(op, PendingOp::Leave { network: n } if *n == network))
            .is_some();
        let leftovers: Vec<_> = self
            .pending_ops
            .iter()
            .filter(|(_, op)| op.network() == Some(network))
            .map(|(op_id, _)| *op_id)
            .collect();
        for op_id in leftovers {
            if let Some(op) = self.pending_ops.remove(&op_id) {
                self.complete_op(op, Outcome::failure(canceled), CompletionDetail::None, now);
            }
        }

        if let Ok(net) = self.tables.networks.resolve_mut(network) {
            net.disconnect_deadline = None;
            net.remote_destroys.clear();
            net.local_destroys.clear();
            net.transport.pending_acks.clear();
        }
        if reason == NetworkDestroyedReason::Requested || leave_pending {
            self.emit(StateChangeKind::LeaveNetworkCompleted {
                outcome: Outcome::success(),
                network,
            });
        }
        self.emit(StateChangeKind::NetworkDestroyed {
            network,
            reason,
            outcome,
        });
        self.networks.retain(|n| *n != network);
        self.destroy_handle(network.raw());

        if matches!(
            reason,
            NetworkDestroyedReason::Disconnected | NetworkDestroyedReason::DestinationFailure
        ) {
            self.submit_detached(|op| RelayRequest::Leave { op, network: id });
        }
        info!(network = %id, reason = ?reason, "network destroyed");
    }
}

// ----------------------------------------------------------------------------
// Membership
// ----------------------------------------------------------------------------

impl EngineState {
    pub fn authenticate_local_user(
        &mut self,
        network: Handle<Network>,
        user: Handle<LocalUser>,
        invitation: InvitationId,
    ) -> Result<()> {
        let local = self.live_user(user)?;
        let entity = local.entity.clone();
        let token = local.token.clone();
        let net = self.live_network(network)?;
        if net.membership(user).is_some() {
            return Err(PartyError::invalid_state(
                net.state.state_name(),
                "local user is already in the network",
            ));
        }
        let id = net.id;
        self.tables.networks.resolve_mut(network)?.members.push(Membership {
            user,
            state: MembershipState::Authenticating,
        });
        self.submit_op(
            PendingOp::Authenticate {
                network,
                user,
                invitation: invitation.clone(),
            },
            |op| RelayRequest::Authenticate {
                op,
                network: id,
                entity,
                token,
                invitation,
            },
        );
        Ok(())
    }

    pub fn remove_local_user(&mut self, network: Handle<Network>, user: Handle<LocalUser>) -> Result<()> {
        let entity = self.tables.users.resolve(user)?.entity.clone();
        let net = self.live_network(network)?;
        let id = net.id;
        match net.membership(user).map(|m| m.state) {
            Some(MembershipState::Authenticated) => {}
            Some(state) => {
                return Err(PartyError::invalid_state(
                    format!("{state:?}"),
                    "local user is not authenticated in the network",
                ))
            }
            None => {
                return Err(PartyError::invalid_argument("local user is not in the network"));
            }
        }
        if let Some(membership) = self.tables.networks.resolve_mut(network)?.membership_mut(user) {
            membership.state = MembershipState::Removing;
        }
        self.submit_op(PendingOp::RemoveUser { network, user }, |op| {
            RelayRequest::RemoveUser {
                op,
                network: id,
                entity,
            }
        });
        Ok(())
    }

    /// Remove a user from one network: its endpoints, chat control
    /// membership and invitations go first, then `LocalUserRemoved`
    pub(crate) fn remove_user_cascade(
        &mut self,
        network: Handle<Network>,
        user: Handle<LocalUser>,
        reason: LocalUserRemovedReason,
        canceled: StateChangeResult,
    ) {
        let Ok(net) = self.tables.networks.resolve(network) else {
            return;
        };
        if net.membership(user).is_none() {
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
                    .is_ok_and(|e| e.local && e.user == Some(user))
            })
            .collect();
        let invitations: Vec<_> = net
            .invitations
            .iter()
            .copied()
            .filter(|inv| {
                self.tables
                    .invitations
                    .resolve(*inv)
                    .is_ok_and(|i| i.is_live() && i.local_creator == Some(user))
            })
            .collect();
        let controls: Vec<_> = self
            .tables
            .chat_controls
            .iter()
            .filter(|(_, control)| {
                control.local
                    && control.user == Some(user)
                    && (control.networks.contains(&network) || control.transitioning.contains(&network))
            })
            .map(|(handle, _)| handle)
            .collect();

        for endpoint in endpoints {
            self.destroy_endpoint_locally(endpoint, EndpointDestroyedReason::UserRemoved, canceled);
        }
        for control in controls {
            self.chat_leave_network(control, network, ChatControlLeftReason::UserRemoved, canceled);
        }
        for invitation in invitations {
            self.destroy_invitation(invitation, InvitationDestroyedReason::CreatorLeft, canceled);
        }

        if let Some(PendingOp::Authenticate { invitation, .. }) = self.take_op(|op| {
            matches!(op, PendingOp::Authenticate { network: n, user: u, .. } if *n == network && *u == user)
        }) {
            self.emit(StateChangeKind::AuthenticateLocalUserCompleted {
                outcome: Outcome::failure(canceled),
                network,
                local_user: user,
                invitation,
            });
        }
        if let Ok(net) = self.tables.networks.resolve_mut(network) {
            net.members.retain(|m| m.user != user);
        }
        if reason == LocalUserRemovedReason::Kicked {
            self.emit(StateChangeKind::LocalUserKicked {
                network,
                local_user: user,
            });
        }
        self.emit(StateChangeKind::LocalUserRemoved {
            network,
            local_user: user,
            reason,
        });
        if self
            .take_op(|op| matches!(op, PendingOp::RemoveUser { network: n, user: u } if *n == network && *u == user))
            .is_some()
        {
            self.emit(StateChangeKind::RemoveLocalUserCompleted {
                outcome: Outcome::success(),
                network,
                local_user: user,
            });
        }
    }

    /// Re-arm the disconnect timer once no local user is authenticated
    pub(crate) fn after_member_removed(&mut self, network: Handle<Network>, now: Timestamp) {
        let timings = self.config.session.clone();
        let Ok(net) = self.tables.networks.resolve_mut(network) else {
            return;
        };
        if net.state == NetworkState::Authenticated && net.authenticated_count() == 0 {
            if let Err(err) = net.apply(SessionEvent::LastUserRemoved, now, &timings) {
                warn!(network = %net.id, error = %err, "could not re-enter Connected");
            }
        }
    }

    pub fn kick_device(&mut self, network: Handle<Network>, device: Handle<Device>) -> Result<()> {
        let net = self.live_network(network)?;
        if !net.devices.contains(&device) {
            return Err(PartyError::invalid_argument("device is not a remote member of the network"));
        }
        let id = net.id;
        let target = self.tables.devices.resolve(device)?.id;
        self.submit_op(PendingOp::KickDevice { network, device }, |op| {
            RelayRequest::KickDevice {
                op,
                network: id,
                target,
            }
        });
        Ok(())
    }

    pub fn kick_user(&mut self, network: Handle<Network>, entity: EntityId) -> Result<()> {
        let id = self.live_network(network)?.id;
        let target = entity.clone();
        self.submit_op(PendingOp::KickUser { network, entity }, |op| {
            RelayRequest::KickUser {
                op,
                network: id,
                target,
            }
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Invitations
// ----------------------------------------------------------------------------

impl EngineState {
    pub fn create_invitation(
        &mut self,
        network: Handle<Network>,
        user: Handle<LocalUser>,
        config: &InvitationConfiguration,
    ) -> Result<Handle<Invitation>> {
        let applied = AppliedInvitation::resolve(config)?;
        let creator = self.live_user(user)?.entity.clone();
        let net = self.live_network(network)?;
        if !net.is_authenticated(user) {
            return Err(PartyError::invalid_state(
                net.state.state_name(),
                "local user is not authenticated in the network",
            ));
        }
        let taken = net.invitations.iter().any(|inv| {
            self.tables
                .invitations
                .resolve(*inv)
                .is_ok_and(|i| i.is_live() && *i.id() == applied.identifier)
        });
        if taken {
            return Err(PartyError::duplicate(applied.identifier.as_str()));
        }
        let id = net.id;
        let invitation = self.tables.invitations.allocate(Invitation {
            network,
            config: applied.clone(),
            creator: creator.clone(),
            local_creator: Some(user),
            state: InvitationState::Creating,
        });
        self.tables.networks.resolve_mut(network)?.invitations.push(invitation);
        self.submit_op(
            PendingOp::CreateInvitation {
                network,
                user,
                invitation,
            },
            |op| RelayRequest::CreateInvitation {
                op,
                network: id,
                creator,
                invitation: applied,
            },
        );
        Ok(invitation)
    }

    pub fn revoke_invitation(
        &mut self,
        network: Handle<Network>,
        user: Handle<LocalUser>,
        invitation: Handle<Invitation>,
    ) -> Result<()> {
        let entity = self.live_user(user)?.entity.clone();
        let net = self.live_network(network)?;
        if !net.is_authenticated(user) {
            return Err(PartyError::invalid_state(
                net.state.state_name(),
                "local user is not authenticated in the network",
            ));
        }
        let id = net.id;
        let inv = self.tables.invitations.resolve(invitation)?;
        if inv.network != network || inv.state != InvitationState::Active {
            return Err(PartyError::invalid_state(
                format!("{:?}", inv.state),
                "invitation is not active in this network",
            ));
        }
        if inv.config.revocability == InvitationRevocability::Creator && inv.creator != entity {
            return Err(PartyError::invalid_argument(
                "only the creating user may revoke this invitation",
            ));
        }
        let invitation_id = inv.id().clone();
        self.tables.invitations.resolve_mut(invitation)?.state = InvitationState::Revoking;
        self.submit_op(
            PendingOp::RevokeInvitation {
                network,
                user,
                invitation,
            },
            |op| RelayRequest::RevokeInvitation {
                op,
                network: id,
                entity,
                invitation: invitation_id,
            },
        );
        Ok(())
    }

    /// Drop an invitation, failing any request still waiting on it
    pub(crate) fn destroy_invitation(
        &mut self,
        invitation: Handle<Invitation>,
        reason: InvitationDestroyedReason,
        canceled: StateChangeResult,
    ) {
        let network = match self.tables.invitations.resolve_mut(invitation) {
            Ok(inv) if inv.is_live() => {
                inv.state = InvitationState::Destroyed;
                inv.network
            }
            _ => return,
        };
        if let Some(PendingOp::CreateInvitation { user, .. }) = self.take_op(
            |op| matches!(op, PendingOp::CreateInvitation { invitation: i, .. } if *i == invitation),
        ) {
            self.emit(StateChangeKind::CreateInvitationCompleted {
                outcome: Outcome::failure(canceled),
                network,
                local_user: user,
                invitation,
            });
        }
        if let Some(PendingOp::RevokeInvitation { user, .. }) = self.take_op(
            |op| matches!(op, PendingOp::RevokeInvitation { invitation: i, .. } if *i == invitation),
        ) {
            self.emit(StateChangeKind::RevokeInvitationCompleted {
                outcome: Outcome::success(),
                network,
                local_user: user,
                invitation,
            });
        }
        if let Ok(net) = self.tables.networks.resolve_mut(network) {
            net.invitations.retain(|i| *i != invitation);
        }
        self.emit(StateChangeKind::InvitationDestroyed {
            network,
            invitation,
            reason,
        });
        self.destroy_handle(invitation.raw());
    }
}

// ----------------------------------------------------------------------------
// Regions and Properties
// ----------------------------------------------------------------------------

impl EngineState {
    pub fn get_regions(&mut self) {
        self.submit_op(PendingOp::Regions, |op| RelayRequest::QueryRegions { op });
    }

    pub fn set_network_properties(
        &mut self,
        network: Handle<Network>,
        updates: Vec<PropertyUpdate>,
    ) -> Result<()> {
        let net = self.live_network(network)?;
        if net.authenticated_count() == 0 {
            return Err(PartyError::invalid_state(
                net.state.state_name(),
                "no local user is authenticated in the network",
            ));
        }
        net.view.properties.validate(&updates)?;
        let id = net.id;
        self.tables
            .networks
            .resolve_mut(network)?
            .view
            .properties
            .apply(&updates);
        self.relay.submit(RelayRequest::SetProperties {
            network: id,
            scope: PropertyScope::Network,
            updates,
        });
        Ok(())
    }

    /// Properties of the local device as seen by the given network
    pub fn set_device_properties(
        &mut self,
        network: Handle<Network>,
        updates: Vec<PropertyUpdate>,
    ) -> Result<()> {
        let id = self.live_network(network)?.id;
        let device = self.local_device;
        self.tables.devices.resolve(device)?.properties.validate(&updates)?;
        self.tables.devices.resolve_mut(device)?.properties.apply(&updates);
        self.relay.submit(RelayRequest::SetProperties {
            network: id,
            scope: PropertyScope::Device(self.local_device_id),
            updates,
        });
        Ok(())
    }

    pub fn set_endpoint_properties(
        &mut self,
        endpoint: Handle<Endpoint>,
        updates: Vec<PropertyUpdate>,
    ) -> Result<()> {
        let ep = self.tables.endpoints.resolve(endpoint)?;
        if !ep.local {
            return Err(PartyError::invalid_argument("only local endpoints can be changed"));
        }
        let endpoint_id = match (ep.state, ep.id) {
            (EndpointState::Active, Some(id)) => id,
            (state, _) => {
                return Err(PartyError::invalid_state(
                    format!("{state:?}"),
                    "endpoint properties can only change while the endpoint is active",
                ))
            }
        };
        ep.properties.validate(&updates)?;
        let network = ep.network;
        let id = self.live_network(network)?.id;
        self.tables.endpoints.resolve_mut(endpoint)?.properties.apply(&updates);
        self.relay.submit(RelayRequest::SetProperties {
            network: id,
            scope: PropertyScope::Endpoint(endpoint_id),
            updates,
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Timers
// ----------------------------------------------------------------------------

impl EngineState {
    /// Disconnect timer, destroy windows and destroy escalation
    pub(crate) fn service_timers(&mut self, network: Handle<Network>, now: Timestamp) {
        let Ok(net) = self.tables.networks.resolve_mut(network) else {
            return;
        };
        if !net.is_live() {
            return;
        }
        let id = net.id;

        if net.state == NetworkState::Connected
            && net.disconnect_deadline.is_some_and(|deadline| deadline.has_passed(now))
        {
            info!(network = %id, "no user authenticated within the grace period");
            self.destroy_network(network, NetworkDestroyedReason::Disconnected, Outcome::success());
            return;
        }

        let mut expired_remote = Vec::new();
        net.remote_destroys.retain(|pending| {
            if pending.deadline.has_passed(now) {
                expired_remote.push(pending.endpoint);
                false
            } else {
                true
            }
        });
        let mut escalated = Vec::new();
        net.local_destroys.retain(|pending| {
            if pending.deadline.has_passed(now) {
                escalated.push(pending.endpoint);
                false
            } else {
                true
            }
        });

        for endpoint in expired_remote {
            debug!(network = %id, endpoint = %endpoint, "auto-acknowledging endpoint destruction");
            self.relay.submit(RelayRequest::AckEndpointDestroyed {
                network: id,
                endpoint,
            });
        }
        for endpoint in escalated {
            warn!(network = %id, "endpoint destroy not confirmed in time; completing locally");
            self.destroy_endpoint_locally(
                endpoint,
                EndpointDestroyedReason::Requested,
                StateChangeResult::CanceledByTitle,
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Completions
// ----------------------------------------------------------------------------

impl EngineState {
    /// Resolve a pending operation with the relay's answer
    pub(crate) fn complete_op(
        &mut self,
        op: PendingOp,
        outcome: Outcome,
        detail: CompletionDetail,
        now: Timestamp,
    ) {
        match op {
            PendingOp::Regions => {
                let regions = match detail {
                    CompletionDetail::Regions(regions) => regions,
                    _ => Vec::new(),
                };
                self.emit(StateChangeKind::RegionsChanged { outcome, regions });
            }
            PendingOp::CreateNetwork {
                user,
                descriptor,
                invitation,
            } => self.complete_create_network(user, descriptor, invitation, outcome, detail),
            PendingOp::Connect { network } => self.complete_connect(network, outcome, detail, now),
            PendingOp::Authenticate {
                network,
                user,
                invitation,
            } => self.complete_authenticate(network, user, invitation, outcome, now),
            PendingOp::RemoveUser { network, user } => {
                if outcome.is_success() {
                    self.remove_user_cascade(
                        network,
                        user,
                        LocalUserRemovedReason::RemoveLocalUser,
                        StateChangeResult::CanceledByTitle,
                    );
                    self.emit(StateChangeKind::RemoveLocalUserCompleted {
                        outcome,
                        network,
                        local_user: user,
                    });
                    self.after_member_removed(network, now);
                } else {
                    if let Some(membership) = self
                        .tables
                        .networks
                        .resolve_mut(network)
                        .ok()
                        .and_then(|net| net.membership_mut(user))
                    {
                        membership.state = MembershipState::Authenticated;
                    }
                    self.emit(StateChangeKind::RemoveLocalUserCompleted {
                        outcome,
                        network,
                        local_user: user,
                    });
                }
            }
            PendingOp::CreateEndpoint { network, endpoint } => {
                self.complete_create_endpoint(network, endpoint, outcome, detail)
            }
            PendingOp::DestroyEndpoint { endpoint, .. } => {
                if !outcome.is_success() {
                    debug!(result = ?outcome.result, "relay rejected endpoint destroy; completing locally");
                }
                self.destroy_endpoint_locally(
                    endpoint,
                    EndpointDestroyedReason::Requested,
                    StateChangeResult::CanceledByTitle,
                );
            }
            PendingOp::CreateInvitation {
                network,
                user,
                invitation,
            } => {
                self.emit(StateChangeKind::CreateInvitationCompleted {
                    outcome,
                    network,
                    local_user: user,
                    invitation,
                });
                if outcome.is_success() {
                    if let Ok(inv) = self.tables.invitations.resolve_mut(invitation) {
                        inv.state = InvitationState::Active;
                    }
                    self.emit(StateChangeKind::InvitationCreated {
                        network,
                        invitation,
                    });
                } else {
                    self.destroy_invitation(
                        invitation,
                        InvitationDestroyedReason::CreationFailed,
                        outcome.result,
                    );
                }
            }
            PendingOp::RevokeInvitation {
                network,
                user,
                invitation,
            } => {
                self.emit(StateChangeKind::RevokeInvitationCompleted {
                    outcome,
                    network,
                    local_user: user,
                    invitation,
                });
                if outcome.is_success() {
                    self.destroy_invitation(
                        invitation,
                        InvitationDestroyedReason::Revoked,
                        StateChangeResult::CanceledByTitle,
                    );
                } else if let Ok(inv) = self.tables.invitations.resolve_mut(invitation) {
                    if inv.state == InvitationState::Revoking {
                        inv.state = InvitationState::Active;
                    }
                }
            }
            PendingOp::KickDevice { network, device } => {
                self.emit(StateChangeKind::KickDeviceCompleted {
                    outcome,
                    network,
                    device,
                });
            }
            PendingOp::KickUser { network, entity } => {
                self.emit(StateChangeKind::KickUserCompleted {
                    outcome,
                    network,
                    entity,
                });
            }
            PendingOp::ConnectChatControl {
                network,
                chat_control,
            } => self.complete_connect_chat_control(network, chat_control, outcome),
            PendingOp::DisconnectChatControl {
                network,
                chat_control,
            } => self.complete_disconnect_chat_control(network, chat_control, outcome),
            PendingOp::Leave { network } => {
                self.destroy_network(network, NetworkDestroyedReason::Requested, Outcome::success());
            }
        }
    }

    fn complete_create_network(
        &mut self,
        user: Handle<LocalUser>,
        provisional: NetworkDescriptor,
        invitation: InvitationId,
        outcome: Outcome,
        detail: CompletionDetail,
    ) {
        let descriptor = match (&outcome, detail) {
            (outcome, CompletionDetail::NetworkCreated(descriptor)) if outcome.is_success() => descriptor,
            _ => provisional,
        };
        self.emit(StateChangeKind::CreateNewNetworkCompleted {
            outcome,
            local_user: user,
            descriptor: descriptor.clone(),
            invitation,
        });
        if !outcome.is_success() || !descriptor.is_final() {
            return;
        }
        if let Some(network) = self.network_by_id(descriptor.network_id()) {
            if let Ok(net) = self.tables.networks.resolve_mut(network) {
                net.descriptor = descriptor.clone();
            }
            self.emit(StateChangeKind::NetworkDescriptorChanged {
                network,
                descriptor,
            });
        }
    }

    fn complete_connect(
        &mut self,
        network: Handle<Network>,
        outcome: Outcome,
        detail: CompletionDetail,
        now: Timestamp,
    ) {
        let timings = self.config.session.clone();
        let Ok(net) = self.tables.networks.resolve_mut(network) else {
            return;
        };
        if !net.is_live() {
            self.emit(StateChangeKind::ConnectToNetworkCompleted { outcome, network });
            return;
        }
        if !outcome.is_success() {
            warn!(network = %net.id, result = ?outcome.result, "connect failed");
            self.emit(StateChangeKind::ConnectToNetworkCompleted { outcome, network });
            self.destroy_network(network, NetworkDestroyedReason::ConnectFailed, outcome);
            return;
        }
        if net.state != NetworkState::Connecting {
            // leave_network raced the connect; the leave completion tears down
            self.emit(StateChangeKind::ConnectToNetworkCompleted {
                outcome: Outcome::failure(StateChangeResult::LeaveNetworkCalled),
                network,
            });
            return;
        }
        if let Err(err) = net.apply(SessionEvent::ConnectSucceeded, now, &timings) {
            warn!(network = %net.id, error = %err, "unexpected connect completion");
        }

        let mut descriptor_changed = None;
        let mut configuration = None;
        let mut properties = Vec::new();
        if let CompletionDetail::Connected {
            descriptor,
            configuration: config,
            properties: props,
        } = detail
        {
            if descriptor.is_final() && descriptor != net.descriptor {
                net.descriptor = descriptor.clone();
                descriptor_changed = Some(descriptor);
            }
            net.configuration = Some(config.clone());
            configuration = Some(config);
            properties = props;
        }
        info!(network = %net.id, "connected");

        self.emit(StateChangeKind::ConnectToNetworkCompleted { outcome, network });
        if let Some(configuration) = configuration {
            self.emit(StateChangeKind::NetworkConfigurationMadeAvailable {
                network,
                configuration,
            });
        }
        if let Some(descriptor) = descriptor_changed {
            self.emit(StateChangeKind::NetworkDescriptorChanged {
                network,
                descriptor,
            });
        }
        if !properties.is_empty() {
            self.emit(StateChangeKind::NetworkPropertiesChanged {
                network,
                updates: properties,
            });
        }
    }

    fn complete_authenticate(
        &mut self,
        network: Handle<Network>,
        user: Handle<LocalUser>,
        invitation: InvitationId,
        outcome: Outcome,
        now: Timestamp,
    ) {
        let timings = self.config.session.clone();
        let Ok(net) = self.tables.networks.resolve_mut(network) else {
            return;
        };
        if outcome.is_success() && net.state.accepts_operations() {
            if let Some(membership) = net.membership_mut(user) {
                membership.state = MembershipState::Authenticated;
            }
            if let Err(err) = net.apply(SessionEvent::UserAuthenticated, now, &timings) {
                warn!(network = %net.id, error = %err, "unexpected authentication completion");
            }
            info!(network = %net.id, "local user authenticated");
            self.emit(StateChangeKind::AuthenticateLocalUserCompleted {
                outcome,
                network,
                local_user: user,
                invitation,
            });
            return;
        }

        let outcome = if outcome.is_success() {
            Outcome::failure(StateChangeResult::LeaveNetworkCalled)
        } else {
            outcome
        };
        warn!(network = %net.id, result = ?outcome.result, "authentication failed");
        net.members.retain(|m| m.user != user);
        self.emit(StateChangeKind::AuthenticateLocalUserCompleted {
            outcome,
            network,
            local_user: user,
            invitation,
        });
        self.emit(StateChangeKind::LocalUserRemoved {
            network,
            local_user: user,
            reason: LocalUserRemovedReason::AuthenticationFailed,
        });
    }
}
