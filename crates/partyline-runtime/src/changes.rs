//! State changes reported by the party manager
//!
//! Every asynchronous completion and every topology event reaches the
//! caller as one of these payloads, wrapped in a
//! [`StateChange`](partyline_core::StateChange) that must be handed back to
//! `finish_processing_state_changes` exactly once.

use partyline_core::{
    EndpointId, EntityId, Handle, InvitationId, NetworkConfiguration, NetworkDescriptor, Outcome,
    PropertyUpdate, RawHandle, ReceivedMessageFlags, StateChange, StateChangePayload,
    StateChangeQueue,
};
use smallvec::{smallvec, SmallVec};

use crate::entities::{ChatControl, Device, Endpoint, Invitation, LocalUser};
use crate::network::Network;
use crate::relay::RegionInfo;

pub type PartyStateChange = StateChange<StateChangeKind>;
pub(crate) type PartyQueue = StateChangeQueue<StateChangeKind, ReleaseAction>;

// ----------------------------------------------------------------------------
// Reasons
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalUserRemovedReason {
    AuthenticationFailed,
    RemoveLocalUser,
    DestroyLocalUser,
    DestroyNetwork,
    Kicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkDestroyedReason {
    /// `leave_network` was called
    Requested,
    /// No user authenticated within the grace period
    Disconnected,
    /// Guaranteed traffic could not be delivered
    DestinationFailure,
    Kicked,
    ConnectFailed,
    NetworkNoLongerExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDestroyedReason {
    Requested,
    CreationFailed,
    UserRemoved,
    RemoteDestroyed,
    DeviceLeft,
    NetworkDestroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationDestroyedReason {
    Revoked,
    CreatorLeft,
    CreationFailed,
    NetworkDestroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatControlDestroyedReason {
    Requested,
    LocalUserDestroyed,
    DeviceLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatControlLeftReason {
    Requested,
    UserRemoved,
    Destroyed,
    /// The owning remote device left the network
    DeviceLeft,
    NetworkDestroyed,
}

// ----------------------------------------------------------------------------
// Payload
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub enum StateChangeKind {
    RegionsChanged {
        outcome: Outcome,
        regions: Vec<RegionInfo>,
    },
    CreateNewNetworkCompleted {
        outcome: Outcome,
        local_user: Handle<LocalUser>,
        descriptor: NetworkDescriptor,
        invitation: InvitationId,
    },
    ConnectToNetworkCompleted {
        outcome: Outcome,
        network: Handle<Network>,
    },
    NetworkConfigurationMadeAvailable {
        network: Handle<Network>,
        configuration: NetworkConfiguration,
    },
    NetworkDescriptorChanged {
        network: Handle<Network>,
        descriptor: NetworkDescriptor,
    },
    AuthenticateLocalUserCompleted {
        outcome: Outcome,
        network: Handle<Network>,
        local_user: Handle<LocalUser>,
        invitation: InvitationId,
    },
    LocalUserKicked {
        network: Handle<Network>,
        local_user: Handle<LocalUser>,
    },
    LocalUserRemoved {
        network: Handle<Network>,
        local_user: Handle<LocalUser>,
        reason: LocalUserRemovedReason,
    },
    RemoveLocalUserCompleted {
        outcome: Outcome,
        network: Handle<Network>,
        local_user: Handle<LocalUser>,
    },
    DestroyLocalUserCompleted {
        outcome: Outcome,
        local_user: Handle<LocalUser>,
    },
    LeaveNetworkCompleted {
        outcome: Outcome,
        network: Handle<Network>,
    },
    NetworkDestroyed {
        network: Handle<Network>,
        reason: NetworkDestroyedReason,
        outcome: Outcome,
    },
    NetworkPropertiesChanged {
        network: Handle<Network>,
        updates: Vec<PropertyUpdate>,
    },
    KickDeviceCompleted {
        outcome: Outcome,
        network: Handle<Network>,
        device: Handle<Device>,
    },
    KickUserCompleted {
        outcome: Outcome,
        network: Handle<Network>,
        entity: EntityId,
    },
    RemoteDeviceCreated {
        device: Handle<Device>,
    },
    RemoteDeviceDestroyed {
        device: Handle<Device>,
    },
    RemoteDeviceJoinedNetwork {
        network: Handle<Network>,
        device: Handle<Device>,
    },
    RemoteDeviceLeftNetwork {
        network: Handle<Network>,
        device: Handle<Device>,
    },
    DevicePropertiesChanged {
        network: Handle<Network>,
        device: Handle<Device>,
        updates: Vec<PropertyUpdate>,
    },
    CreateEndpointCompleted {
        outcome: Outcome,
        network: Handle<Network>,
        local_user: Option<Handle<LocalUser>>,
        endpoint: Handle<Endpoint>,
    },
    DestroyEndpointCompleted {
        outcome: Outcome,
        network: Handle<Network>,
        endpoint: Handle<Endpoint>,
    },
    EndpointCreated {
        network: Handle<Network>,
        endpoint: Handle<Endpoint>,
    },
    EndpointDestroyed {
        network: Handle<Network>,
        endpoint: Handle<Endpoint>,
        reason: EndpointDestroyedReason,
    },
    EndpointMessageReceived {
        network: Handle<Network>,
        sender: Handle<Endpoint>,
        receivers: Vec<Handle<Endpoint>>,
        flags: ReceivedMessageFlags,
        data: Vec<u8>,
    },
    EndpointPropertiesChanged {
        network: Handle<Network>,
        endpoint: Handle<Endpoint>,
        updates: Vec<PropertyUpdate>,
    },
    CreateInvitationCompleted {
        outcome: Outcome,
        network: Handle<Network>,
        local_user: Handle<LocalUser>,
        invitation: Handle<Invitation>,
    },
    RevokeInvitationCompleted {
        outcome: Outcome,
        network: Handle<Network>,
        local_user: Handle<LocalUser>,
        invitation: Handle<Invitation>,
    },
    InvitationCreated {
        network: Handle<Network>,
        invitation: Handle<Invitation>,
    },
    InvitationDestroyed {
        network: Handle<Network>,
        invitation: Handle<Invitation>,
        reason: InvitationDestroyedReason,
    },
    ChatControlCreated {
        chat_control: Handle<ChatControl>,
    },
    ChatControlDestroyed {
        chat_control: Handle<ChatControl>,
        reason: ChatControlDestroyedReason,
    },
    DestroyChatControlCompleted {
        outcome: Outcome,
        local_user: Handle<LocalUser>,
        chat_control: Handle<ChatControl>,
    },
    ConnectChatControlCompleted {
        outcome: Outcome,
        network: Handle<Network>,
        chat_control: Handle<ChatControl>,
    },
    DisconnectChatControlCompleted {
        outcome: Outcome,
        network: Handle<Network>,
        chat_control: Handle<ChatControl>,
    },
    ChatControlJoinedNetwork {
        network: Handle<Network>,
        chat_control: Handle<ChatControl>,
    },
    ChatControlLeftNetwork {
        network: Handle<Network>,
        chat_control: Handle<ChatControl>,
        reason: ChatControlLeftReason,
    },
    ChatTextReceived {
        sender: Handle<ChatControl>,
        receivers: Vec<Handle<ChatControl>>,
        text: String,
    },
}

impl StateChangeKind {
    /// Outcome carried by completion changes
    pub fn outcome(&self) -> Option<Outcome> {
        use StateChangeKind::*;
        match self {
            RegionsChanged { outcome, .. }
            | CreateNewNetworkCompleted { outcome, .. }
            | ConnectToNetworkCompleted { outcome, .. }
            | AuthenticateLocalUserCompleted { outcome, .. }
            | RemoveLocalUserCompleted { outcome, .. }
            | DestroyLocalUserCompleted { outcome, .. }
            | LeaveNetworkCompleted { outcome, .. }
            | NetworkDestroyed { outcome, .. }
            | KickDeviceCompleted { outcome, .. }
            | KickUserCompleted { outcome, .. }
            | CreateEndpointCompleted { outcome, .. }
            | DestroyEndpointCompleted { outcome, .. }
            | CreateInvitationCompleted { outcome, .. }
            | RevokeInvitationCompleted { outcome, .. }
            | DestroyChatControlCompleted { outcome, .. }
            | ConnectChatControlCompleted { outcome, .. }
            | DisconnectChatControlCompleted { outcome, .. } => Some(*outcome),
            _ => None,
        }
    }

    /// Network the change belongs to, if any
    pub fn network(&self) -> Option<Handle<Network>> {
        use StateChangeKind::*;
        match self {
            ConnectToNetworkCompleted { network, .. }
            | NetworkConfigurationMadeAvailable { network, .. }
            | NetworkDescriptorChanged { network, .. }
            | AuthenticateLocalUserCompleted { network, .. }
            | LocalUserKicked { network, .. }
            | LocalUserRemoved { network, .. }
            | RemoveLocalUserCompleted { network, .. }
            | LeaveNetworkCompleted { network, .. }
            | NetworkDestroyed { network, .. }
            | NetworkPropertiesChanged { network, .. }
            | KickDeviceCompleted { network, .. }
            | KickUserCompleted { network, .. }
            | RemoteDeviceJoinedNetwork { network, .. }
            | RemoteDeviceLeftNetwork { network, .. }
            | DevicePropertiesChanged { network, .. }
            | CreateEndpointCompleted { network, .. }
            | DestroyEndpointCompleted { network, .. }
            | EndpointCreated { network, .. }
            | EndpointDestroyed { network, .. }
            | EndpointMessageReceived { network, .. }
            | EndpointPropertiesChanged { network, .. }
            | CreateInvitationCompleted { network, .. }
            | RevokeInvitationCompleted { network, .. }
            | InvitationCreated { network, .. }
            | InvitationDestroyed { network, .. }
            | ConnectChatControlCompleted { network, .. }
            | DisconnectChatControlCompleted { network, .. }
            | ChatControlJoinedNetwork { network, .. }
            | ChatControlLeftNetwork { network, .. } => Some(*network),
            RegionsChanged { .. }
            | CreateNewNetworkCompleted { .. }
            | DestroyLocalUserCompleted { .. }
            | RemoteDeviceCreated { .. }
            | RemoteDeviceDestroyed { .. }
            | ChatControlCreated { .. }
            | ChatControlDestroyed { .. }
            | DestroyChatControlCompleted { .. }
            | ChatTextReceived { .. } => None,
        }
    }
}

impl StateChangePayload for StateChangeKind {
    fn handles(&self) -> SmallVec<[RawHandle; 4]> {
        use StateChangeKind::*;
        match self {
            RegionsChanged { .. } => SmallVec::new(),
            CreateNewNetworkCompleted { local_user, .. } => smallvec![local_user.raw()],
            ConnectToNetworkCompleted { network, .. }
            | NetworkConfigurationMadeAvailable { network, .. }
            | NetworkDescriptorChanged { network, .. }
            | LeaveNetworkCompleted { network, .. }
            | NetworkDestroyed { network, .. }
            | NetworkPropertiesChanged { network, .. }
            | KickUserCompleted { network, .. } => smallvec![network.raw()],
            AuthenticateLocalUserCompleted {
                network,
                local_user,
                ..
            }
            | LocalUserKicked {
                network,
                local_user,
            }
            | LocalUserRemoved {
                network,
                local_user,
                ..
            }
            | RemoveLocalUserCompleted {
                network,
                local_user,
                ..
            } => smallvec![network.raw(), local_user.raw()],
            DestroyLocalUserCompleted { local_user, .. } => smallvec![local_user.raw()],
            KickDeviceCompleted {
                network, device, ..
            }
            | RemoteDeviceJoinedNetwork { network, device }
            | RemoteDeviceLeftNetwork { network, device }
            | DevicePropertiesChanged {
                network, device, ..
            } => smallvec![network.raw(), device.raw()],
            RemoteDeviceCreated { device } | RemoteDeviceDestroyed { device } => {
                smallvec![device.raw()]
            }
            CreateEndpointCompleted {
                network,
                local_user,
                endpoint,
                ..
            } => {
                let mut handles: SmallVec<[RawHandle; 4]> = smallvec![network.raw(), endpoint.raw()];
                if let Some(user) = local_user {
                    handles.push(user.raw());
                }
                handles
            }
            DestroyEndpointCompleted {
                network, endpoint, ..
            }
            | EndpointCreated { network, endpoint }
            | EndpointDestroyed {
                network, endpoint, ..
            }
            | EndpointPropertiesChanged {
                network, endpoint, ..
            } => smallvec![network.raw(), endpoint.raw()],
            EndpointMessageReceived {
                network,
                sender,
                receivers,
                ..
            } => {
                let mut handles: SmallVec<[RawHandle; 4]> = smallvec![network.raw(), sender.raw()];
                handles.extend(receivers.iter().map(|r| r.raw()));
                handles
            }
            CreateInvitationCompleted {
                network,
                local_user,
                invitation,
                ..
            }
            | RevokeInvitationCompleted {
                network,
                local_user,
                invitation,
                ..
            } => smallvec![network.raw(), local_user.raw(), invitation.raw()],
            InvitationCreated {
                network,
                invitation,
            }
            | InvitationDestroyed {
                network,
                invitation,
                ..
            } => smallvec![network.raw(), invitation.raw()],
            ChatControlCreated { chat_control } | ChatControlDestroyed { chat_control, .. } => {
                smallvec![chat_control.raw()]
            }
            DestroyChatControlCompleted {
                local_user,
                chat_control,
                ..
            } => smallvec![local_user.raw(), chat_control.raw()],
            ConnectChatControlCompleted {
                network,
                chat_control,
                ..
            }
            | DisconnectChatControlCompleted {
                network,
                chat_control,
                ..
            }
            | ChatControlJoinedNetwork {
                network,
                chat_control,
            }
            | ChatControlLeftNetwork {
                network,
                chat_control,
                ..
            } => smallvec![network.raw(), chat_control.raw()],
            ChatTextReceived {
                sender, receivers, ..
            } => {
                let mut handles: SmallVec<[RawHandle; 4]> = smallvec![sender.raw()];
                handles.extend(receivers.iter().map(|r| r.raw()));
                handles
            }
        }
    }

    fn kind_name(&self) -> &'static str {
        use StateChangeKind::*;
        match self {
            RegionsChanged { .. } => "RegionsChanged",
            CreateNewNetworkCompleted { .. } => "CreateNewNetworkCompleted",
            ConnectToNetworkCompleted { .. } => "ConnectToNetworkCompleted",
            NetworkConfigurationMadeAvailable { .. } => "NetworkConfigurationMadeAvailable",
            NetworkDescriptorChanged { .. } => "NetworkDescriptorChanged",
            AuthenticateLocalUserCompleted { .. } => "AuthenticateLocalUserCompleted",
            LocalUserKicked { .. } => "LocalUserKicked",
            LocalUserRemoved { .. } => "LocalUserRemoved",
            RemoveLocalUserCompleted { .. } => "RemoveLocalUserCompleted",
            DestroyLocalUserCompleted { .. } => "DestroyLocalUserCompleted",
            LeaveNetworkCompleted { .. } => "LeaveNetworkCompleted",
            NetworkDestroyed { .. } => "NetworkDestroyed",
            NetworkPropertiesChanged { .. } => "NetworkPropertiesChanged",
            KickDeviceCompleted { .. } => "KickDeviceCompleted",
            KickUserCompleted { .. } => "KickUserCompleted",
            RemoteDeviceCreated { .. } => "RemoteDeviceCreated",
            RemoteDeviceDestroyed { .. } => "RemoteDeviceDestroyed",
            RemoteDeviceJoinedNetwork { .. } => "RemoteDeviceJoinedNetwork",
            RemoteDeviceLeftNetwork { .. } => "RemoteDeviceLeftNetwork",
            DevicePropertiesChanged { .. } => "DevicePropertiesChanged",
            CreateEndpointCompleted { .. } => "CreateEndpointCompleted",
            DestroyEndpointCompleted { .. } => "DestroyEndpointCompleted",
            EndpointCreated { .. } => "EndpointCreated",
            EndpointDestroyed { .. } => "EndpointDestroyed",
            EndpointMessageReceived { .. } => "EndpointMessageReceived",
            EndpointPropertiesChanged { .. } => "EndpointPropertiesChanged",
            CreateInvitationCompleted { .. } => "CreateInvitationCompleted",
            RevokeInvitationCompleted { .. } => "RevokeInvitationCompleted",
            InvitationCreated { .. } => "InvitationCreated",
            InvitationDestroyed { .. } => "InvitationDestroyed",
            ChatControlCreated { .. } => "ChatControlCreated",
            ChatControlDestroyed { .. } => "ChatControlDestroyed",
            DestroyChatControlCompleted { .. } => "DestroyChatControlCompleted",
            ConnectChatControlCompleted { .. } => "ConnectChatControlCompleted",
            DisconnectChatControlCompleted { .. } => "DisconnectChatControlCompleted",
            ChatControlJoinedNetwork { .. } => "ChatControlJoinedNetwork",
            ChatControlLeftNetwork { .. } => "ChatControlLeftNetwork",
            ChatTextReceived { .. } => "ChatTextReceived",
        }
    }
}

// ----------------------------------------------------------------------------
// Release Actions
// ----------------------------------------------------------------------------

/// Protocol work triggered when a state change is finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseAction {
    /// Tell the relay this device is done with a remote endpoint
    AckEndpointDestroyed {
        network: Handle<Network>,
        endpoint: EndpointId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use partyline_core::{DeviceId, HandleKind, HandleTable};

    #[test]
    fn test_message_change_mentions_every_endpoint() {
        let mut networks = HandleTable::<Network>::new();
        let mut endpoints = HandleTable::<Endpoint>::new();
        let mut devices = HandleTable::<Device>::new();
        let network = networks.allocate(Network::for_tests());
        let device = devices.allocate(Device::new(DeviceId::random(), false));
        let make = |endpoints: &mut HandleTable<Endpoint>| {
            endpoints.allocate(Endpoint {
                network,
                device,
                device_id: DeviceId::random(),
                local: true,
                user: None,
                entity: None,
                id: None,
                published_id: None,
                state: crate::entities::EndpointState::Active,
                properties: Default::default(),
            })
        };
        let sender = make(&mut endpoints);
        let receivers = vec![make(&mut endpoints), make(&mut endpoints)];

        let change = StateChangeKind::EndpointMessageReceived {
            network,
            sender,
            receivers,
            flags: ReceivedMessageFlags::default(),
            data: vec![1, 2, 3],
        };
        let handles = change.handles();
        assert_eq!(handles.len(), 4);
        assert_eq!(handles[0].kind(), HandleKind::Network);
        assert!(handles[1..].iter().all(|h| h.kind() == HandleKind::Endpoint));
        assert_eq!(change.kind_name(), "EndpointMessageReceived");
        assert_eq!(change.network(), Some(network));
        assert_eq!(change.outcome(), None);
    }
}
