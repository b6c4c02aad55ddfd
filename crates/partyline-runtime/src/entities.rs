//! Entities stored in the engine's handle tables
//!
//! Every entity keeps both its live state (mutated by the workers and API
//! calls) and the fields callers read through getters, which only change at
//! the publish point.

use hashbrown::{HashMap, HashSet};
use partyline_core::{
    AppliedInvitation, ChatControlId, DeviceId, EndpointId, Entity, EntityId, Handle, HandleKind,
    InvitationId, SharedProperties,
};
use serde::{Deserialize, Serialize};

use crate::network::Network;

// ----------------------------------------------------------------------------
// Local User
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct LocalUser {
    pub(crate) entity: EntityId,
    pub(crate) token: String,
    pub(crate) destroying: bool,
}

impl LocalUser {
    pub(crate) fn new(entity: EntityId, token: String) -> Self {
        Self {
            entity,
            token,
            destroying: false,
        }
    }
}

impl Entity for LocalUser {
    const KIND: HandleKind = HandleKind::LocalUser;
}

// ----------------------------------------------------------------------------
// Device
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Device {
    pub(crate) id: DeviceId,
    pub(crate) local: bool,
    /// Networks this device is currently joined to
    pub(crate) networks: Vec<Handle<Network>>,
    pub(crate) chat_controls: Vec<Handle<ChatControl>>,
    pub(crate) properties: SharedProperties,
    pub(crate) destroyed: bool,
}

impl Device {
    pub(crate) fn new(id: DeviceId, local: bool) -> Self {
        Self {
            id,
            local,
            networks: Vec::new(),
            chat_controls: Vec::new(),
            properties: SharedProperties::new(),
            destroyed: false,
        }
    }
}

impl Entity for Device {
    const KIND: HandleKind = HandleKind::Device;
}

// ----------------------------------------------------------------------------
// Endpoint
// ----------------------------------------------------------------------------

/// Lifecycle of an endpoint as seen by this device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Local endpoint waiting for the relay to assign an id
    Creating,
    Active,
    /// Local destroy requested, waiting for remote acknowledgments
    Destroying,
    Destroyed,
}

#[derive(Debug)]
pub struct Endpoint {
    pub(crate) network: Handle<Network>,
    pub(crate) device: Handle<Device>,
    pub(crate) device_id: DeviceId,
    pub(crate) local: bool,
    pub(crate) user: Option<Handle<LocalUser>>,
    pub(crate) entity: Option<EntityId>,
    /// Assigned once creation commits
    pub(crate) id: Option<EndpointId>,
    /// Id visible to getters; set when `EndpointCreated` is published
    pub(crate) published_id: Option<EndpointId>,
    pub(crate) state: EndpointState,
    pub(crate) properties: SharedProperties,
}

impl Endpoint {
    pub(crate) fn is_usable(&self) -> bool {
        matches!(self.state, EndpointState::Creating | EndpointState::Active)
    }
}

impl Entity for Endpoint {
    const KIND: HandleKind = HandleKind::Endpoint;
}

// ----------------------------------------------------------------------------
// Invitation
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationState {
    Creating,
    Active,
    Revoking,
    Destroyed,
}

#[derive(Debug)]
pub struct Invitation {
    pub(crate) network: Handle<Network>,
    pub(crate) config: AppliedInvitation,
    pub(crate) creator: EntityId,
    /// Set when the creator is a user on this device
    pub(crate) local_creator: Option<Handle<LocalUser>>,
    pub(crate) state: InvitationState,
}

impl Invitation {
    pub(crate) fn id(&self) -> &InvitationId {
        &self.config.identifier
    }

    pub(crate) fn is_live(&self) -> bool {
        !matches!(self.state, InvitationState::Destroyed)
    }
}

impl Entity for Invitation {
    const KIND: HandleKind = HandleKind::Invitation;
}

// ----------------------------------------------------------------------------
// Chat Control
// ----------------------------------------------------------------------------

/// What a local chat control accepts from one other chat control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatPermissions {
    pub send_audio: bool,
    pub receive_audio: bool,
    pub receive_text: bool,
}

impl ChatPermissions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            send_audio: true,
            receive_audio: true,
            receive_text: true,
        }
    }
}

/// How aggressively received chat text is filtered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TextFilterLevel {
    #[default]
    FamilyFriendly,
    Mature,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingText {
    pub targets: Vec<Handle<ChatControl>>,
    pub text: String,
}

#[derive(Debug)]
pub struct ChatControl {
    pub(crate) id: ChatControlId,
    pub(crate) device: Handle<Device>,
    pub(crate) device_id: DeviceId,
    pub(crate) local: bool,
    pub(crate) user: Option<Handle<LocalUser>>,
    pub(crate) entity: EntityId,
    pub(crate) language: Option<String>,
    pub(crate) filter_level: TextFilterLevel,
    /// Networks the control has joined
    pub(crate) networks: Vec<Handle<Network>>,
    /// Networks with a connect or disconnect request outstanding
    pub(crate) transitioning: HashSet<Handle<Network>>,
    pub(crate) permissions: HashMap<ChatControlId, ChatPermissions>,
    pub(crate) muted_text: HashSet<ChatControlId>,
    pub(crate) outbox: Vec<PendingText>,
    pub(crate) destroyed: bool,
}

impl ChatControl {
    pub(crate) fn permissions_for(&self, other: ChatControlId) -> ChatPermissions {
        self.permissions.get(&other).copied().unwrap_or_default()
    }

    pub(crate) fn accepts_text_from(&self, other: ChatControlId) -> bool {
        self.permissions_for(other).receive_text && !self.muted_text.contains(&other)
    }
}

impl Entity for ChatControl {
    const KIND: HandleKind = HandleKind::ChatControl;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_requires_permission_and_no_mute() {
        let mut control = ChatControl {
            id: ChatControlId::new(1),
            device: partyline_core::HandleTable::<Device>::new()
                .allocate(Device::new(DeviceId::random(), true)),
            device_id: DeviceId::random(),
            local: true,
            user: None,
            entity: EntityId::new("alice").unwrap(),
            language: None,
            filter_level: TextFilterLevel::default(),
            networks: Vec::new(),
            transitioning: HashSet::new(),
            permissions: HashMap::new(),
            muted_text: HashSet::new(),
            outbox: Vec::new(),
            destroyed: false,
        };
        let other = ChatControlId::new(2);
        assert!(!control.accepts_text_from(other));

        control.permissions.insert(other, ChatPermissions::all());
        assert!(control.accepts_text_from(other));

        control.muted_text.insert(other);
        assert!(!control.accepts_text_from(other));
    }
}
