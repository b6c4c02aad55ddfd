//! Getters
//!
//! Everything here reads the published view, so results only change at the
//! publish point. Collections come back as owned snapshots.

use partyline_core::{
    AppliedInvitation, DeviceId, EndpointId, EntityId, Handle, NetworkConfiguration,
    NetworkDescriptor, PartyError, RawHandle, Result,
};

use super::EngineState;
use crate::entities::{ChatControl, Device, Endpoint, Invitation, LocalUser};
use crate::network::{AuditEntry, Network, NetworkState};

// ----------------------------------------------------------------------------
// Manager-wide
// ----------------------------------------------------------------------------

impl EngineState {
    pub fn networks_snapshot(&self) -> Vec<Handle<Network>> {
        self.view_networks.clone()
    }

    pub fn chat_controls_snapshot(&self) -> Vec<Handle<ChatControl>> {
        self.view_chat_controls.clone()
    }

    pub fn local_users_snapshot(&self) -> Vec<Handle<LocalUser>> {
        self.tables
            .users
            .iter()
            .filter(|(_, user)| !user.destroying)
            .map(|(handle, _)| handle)
            .collect()
    }

    pub fn local_user_entity(&self, user: Handle<LocalUser>) -> Result<EntityId> {
        Ok(self.tables.users.resolve(user)?.entity.clone())
    }

    pub fn set_custom_context(&mut self, handle: RawHandle, context: Option<u64>) -> Result<()> {
        Ok(self.tables.set_custom_context(handle, context)?)
    }

    pub fn custom_context(&self, handle: RawHandle) -> Result<Option<u64>> {
        Ok(self.tables.custom_context(handle)?)
    }
}

// ----------------------------------------------------------------------------
// Networks
// ----------------------------------------------------------------------------

impl EngineState {
    pub fn network_descriptor(&self, network: Handle<Network>) -> Result<NetworkDescriptor> {
        Ok(self.tables.networks.resolve(network)?.view.descriptor.clone())
    }

    /// Available once `NetworkConfigurationMadeAvailable` has been published
    pub fn network_configuration(&self, network: Handle<Network>) -> Result<NetworkConfiguration> {
        let net = self.tables.networks.resolve(network)?;
        net.view.configuration.clone().ok_or_else(|| {
            PartyError::invalid_state(
                net.view.state.state_name(),
                "network configuration is not available yet",
            )
        })
    }

    pub fn network_state(&self, network: Handle<Network>) -> Result<NetworkState> {
        Ok(self.tables.networks.resolve(network)?.view.state)
    }

    pub fn network_devices(&self, network: Handle<Network>) -> Result<Vec<Handle<Device>>> {
        Ok(self.tables.networks.resolve(network)?.view.devices.clone())
    }

    pub fn network_endpoints(&self, network: Handle<Network>) -> Result<Vec<Handle<Endpoint>>> {
        Ok(self.tables.networks.resolve(network)?.view.endpoints.clone())
    }

    pub fn network_local_users(&self, network: Handle<Network>) -> Result<Vec<Handle<LocalUser>>> {
        Ok(self.tables.networks.resolve(network)?.view.local_users.clone())
    }

    pub fn network_invitations(&self, network: Handle<Network>) -> Result<Vec<Handle<Invitation>>> {
        Ok(self.tables.networks.resolve(network)?.view.invitations.clone())
    }

    pub fn network_chat_controls(&self, network: Handle<Network>) -> Result<Vec<Handle<ChatControl>>> {
        Ok(self.tables.networks.resolve(network)?.view.chat_controls.clone())
    }

    pub fn network_property(&self, network: Handle<Network>, key: &str) -> Result<Option<Vec<u8>>> {
        let net = self.tables.networks.resolve(network)?;
        Ok(net.view.properties.get(key).map(<[u8]>::to_vec))
    }

    pub fn network_property_keys(&self, network: Handle<Network>) -> Result<Vec<String>> {
        Ok(self.tables.networks.resolve(network)?.view.properties.keys())
    }

    /// Recent session transitions, oldest first
    pub fn network_audit_trail(&self, network: Handle<Network>) -> Result<Vec<AuditEntry>> {
        Ok(self.tables.networks.resolve(network)?.audit_trail())
    }
}

// ----------------------------------------------------------------------------
// Endpoints
// ----------------------------------------------------------------------------

impl EngineState {
    /// Fails until `EndpointCreated` for this endpoint has been published
    pub fn endpoint_unique_id(&self, endpoint: Handle<Endpoint>) -> Result<EndpointId> {
        self.tables
            .endpoints
            .resolve(endpoint)?
            .published_id
            .ok_or_else(|| PartyError::invalid_state("Creating", "endpoint has no unique id yet"))
    }

    /// Resolves for as long as [`Self::endpoint_unique_id`] does, including
    /// a destroyed endpoint whose `EndpointDestroyed` is still unfinished
    pub fn find_endpoint_by_unique_id(
        &self,
        network: Handle<Network>,
        id: EndpointId,
    ) -> Result<Handle<Endpoint>> {
        self.tables.networks.resolve(network)?;
        self.tables
            .endpoints
            .iter()
            .find(|(_, ep)| ep.network == network && ep.published_id == Some(id))
            .map(|(handle, _)| handle)
            .ok_or_else(|| PartyError::invalid_argument(format!("no endpoint with id {id}")))
    }

    pub fn endpoint_network(&self, endpoint: Handle<Endpoint>) -> Result<Handle<Network>> {
        Ok(self.tables.endpoints.resolve(endpoint)?.network)
    }

    pub fn endpoint_device(&self, endpoint: Handle<Endpoint>) -> Result<Handle<Device>> {
        Ok(self.tables.endpoints.resolve(endpoint)?.device)
    }

    pub fn endpoint_local_user(&self, endpoint: Handle<Endpoint>) -> Result<Option<Handle<LocalUser>>> {
        Ok(self.tables.endpoints.resolve(endpoint)?.user)
    }

    pub fn endpoint_entity(&self, endpoint: Handle<Endpoint>) -> Result<Option<EntityId>> {
        Ok(self.tables.endpoints.resolve(endpoint)?.entity.clone())
    }

    pub fn endpoint_is_local(&self, endpoint: Handle<Endpoint>) -> Result<bool> {
        Ok(self.tables.endpoints.resolve(endpoint)?.local)
    }

    pub fn endpoint_property(&self, endpoint: Handle<Endpoint>, key: &str) -> Result<Option<Vec<u8>>> {
        let ep = self.tables.endpoints.resolve(endpoint)?;
        Ok(ep.properties.get(key).map(<[u8]>::to_vec))
    }

    pub fn endpoint_property_keys(&self, endpoint: Handle<Endpoint>) -> Result<Vec<String>> {
        Ok(self.tables.endpoints.resolve(endpoint)?.properties.keys())
    }
}

// ----------------------------------------------------------------------------
// Devices
// ----------------------------------------------------------------------------

impl EngineState {
    pub fn local_device_handle(&self) -> Handle<Device> {
        self.local_device
    }

    pub fn device_id(&self, device: Handle<Device>) -> Result<DeviceId> {
        Ok(self.tables.devices.resolve(device)?.id)
    }

    pub fn device_is_local(&self, device: Handle<Device>) -> Result<bool> {
        Ok(self.tables.devices.resolve(device)?.local)
    }

    pub fn device_chat_controls(&self, device: Handle<Device>) -> Result<Vec<Handle<ChatControl>>> {
        let dev = self.tables.devices.resolve(device)?;
        Ok(dev
            .chat_controls
            .iter()
            .copied()
            .filter(|control| self.view_chat_controls.contains(control))
            .collect())
    }

    pub fn device_property(&self, device: Handle<Device>, key: &str) -> Result<Option<Vec<u8>>> {
        let dev = self.tables.devices.resolve(device)?;
        Ok(dev.properties.get(key).map(<[u8]>::to_vec))
    }

    pub fn device_property_keys(&self, device: Handle<Device>) -> Result<Vec<String>> {
        Ok(self.tables.devices.resolve(device)?.properties.keys())
    }
}

// ----------------------------------------------------------------------------
// Invitations and Chat Controls
// ----------------------------------------------------------------------------

impl EngineState {
    pub fn invitation_configuration(&self, invitation: Handle<Invitation>) -> Result<AppliedInvitation> {
        Ok(self.tables.invitations.resolve(invitation)?.config.clone())
    }

    pub fn invitation_creator(&self, invitation: Handle<Invitation>) -> Result<EntityId> {
        Ok(self.tables.invitations.resolve(invitation)?.creator.clone())
    }

    pub fn invitation_network(&self, invitation: Handle<Invitation>) -> Result<Handle<Network>> {
        Ok(self.tables.invitations.resolve(invitation)?.network)
    }

    pub fn chat_control_entity(&self, chat_control: Handle<ChatControl>) -> Result<EntityId> {
        Ok(self.tables.chat_controls.resolve(chat_control)?.entity.clone())
    }

    pub fn chat_control_device(&self, chat_control: Handle<ChatControl>) -> Result<Handle<Device>> {
        Ok(self.tables.chat_controls.resolve(chat_control)?.device)
    }

    pub fn chat_control_local_user(
        &self,
        chat_control: Handle<ChatControl>,
    ) -> Result<Option<Handle<LocalUser>>> {
        Ok(self.tables.chat_controls.resolve(chat_control)?.user)
    }

    pub fn chat_control_is_local(&self, chat_control: Handle<ChatControl>) -> Result<bool> {
        Ok(self.tables.chat_controls.resolve(chat_control)?.local)
    }

    pub fn chat_control_language(&self, chat_control: Handle<ChatControl>) -> Result<Option<String>> {
        Ok(self.tables.chat_controls.resolve(chat_control)?.language.clone())
    }

    /// Networks whose published view lists the chat control
    pub fn chat_control_networks(&self, chat_control: Handle<ChatControl>) -> Result<Vec<Handle<Network>>> {
        self.tables.chat_controls.resolve(chat_control)?;
        Ok(self
            .view_networks
            .iter()
            .copied()
            .filter(|network| {
                self.tables
                    .networks
                    .resolve(*network)
                    .is_ok_and(|net| net.view.chat_controls.contains(&chat_control))
            })
            .collect())
    }
}
