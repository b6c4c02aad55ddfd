//! Relay collaborator
//!
//! The relay is the cloud service every device of a network talks to. The
//! engine never speaks a concrete protocol; it submits [`RelayRequest`]s and
//! drains [`RelayEvent`]s through a [`RelayTransport`] owned by the caller.
//! One transport serves one local device, so requests do not name the
//! sending device.
//!
//! Ordering contract: events for one device arrive in the order the relay
//! produced them. After the first successful authentication of a device in
//! a network the relay replays the network's current population (devices,
//! endpoints, invitations, chat controls, properties) as ordinary events.

use partyline_core::{
    AppliedInvitation, ChatControlId, DeviceId, DirectPeerConnectivity, EndpointId, EntityId,
    InvitationId, NetworkConfiguration, NetworkDescriptor, NetworkId, OperationId, Outcome,
    PropertyUpdate,
};
use serde::{Deserialize, Serialize};

/// Connection to the relay for one local device
pub trait RelayTransport: Send + Sync {
    /// Queue a request; never blocks
    fn submit(&self, request: RelayRequest);

    /// Take every event that arrived since the previous call
    fn poll_events(&self) -> Vec<RelayEvent>;
}

// ----------------------------------------------------------------------------
// Shared Payloads
// ----------------------------------------------------------------------------

/// A region the relay can host networks in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub name: String,
    pub round_trip_latency_ms: u32,
}

/// Which property map an update applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyScope {
    Network,
    Device(DeviceId),
    Endpoint(EndpointId),
}

/// An endpoint owned by another device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpointInfo {
    pub id: EndpointId,
    pub device: DeviceId,
    pub entity: Option<EntityId>,
    pub properties: Vec<PropertyUpdate>,
}

/// A chat control owned by another device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChatControlInfo {
    pub id: ChatControlId,
    pub device: DeviceId,
    pub entity: EntityId,
}

/// Why the relay dropped this device from a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The network's creator kicked this device
    Kicked,
    /// The network no longer exists on the relay
    NetworkClosed,
    /// Another device reported this one as unresponsive
    Unresponsive,
}

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum RelayRequest {
    QueryRegions {
        op: OperationId,
    },
    CreateNetwork {
        op: OperationId,
        network: NetworkId,
        creator: EntityId,
        token: String,
        configuration: NetworkConfiguration,
        regions: Vec<String>,
        invitation: AppliedInvitation,
    },
    Connect {
        op: OperationId,
        network: NetworkId,
        connectivity: DirectPeerConnectivity,
        bind_address: Option<String>,
    },
    Authenticate {
        op: OperationId,
        network: NetworkId,
        entity: EntityId,
        token: String,
        invitation: InvitationId,
    },
    RemoveUser {
        op: OperationId,
        network: NetworkId,
        entity: EntityId,
    },
    CreateEndpoint {
        op: OperationId,
        network: NetworkId,
        entity: Option<EntityId>,
        properties: Vec<PropertyUpdate>,
    },
    DestroyEndpoint {
        op: OperationId,
        network: NetworkId,
        endpoint: EndpointId,
    },
    /// This device has processed the destruction of a remote endpoint
    AckEndpointDestroyed {
        network: NetworkId,
        endpoint: EndpointId,
    },
    CreateInvitation {
        op: OperationId,
        network: NetworkId,
        creator: EntityId,
        invitation: AppliedInvitation,
    },
    RevokeInvitation {
        op: OperationId,
        network: NetworkId,
        entity: EntityId,
        invitation: InvitationId,
    },
    KickDevice {
        op: OperationId,
        network: NetworkId,
        target: DeviceId,
    },
    KickUser {
        op: OperationId,
        network: NetworkId,
        target: EntityId,
    },
    SetProperties {
        network: NetworkId,
        scope: PropertyScope,
        updates: Vec<PropertyUpdate>,
    },
    ConnectChatControl {
        op: OperationId,
        network: NetworkId,
        chat_control: ChatControlId,
        entity: EntityId,
    },
    DisconnectChatControl {
        op: OperationId,
        network: NetworkId,
        chat_control: ChatControlId,
    },
    Leave {
        op: OperationId,
        network: NetworkId,
    },
    SendPacket {
        network: NetworkId,
        to: DeviceId,
        payload: Vec<u8>,
    },
    /// Guaranteed traffic to `device` went unacknowledged
    ReportUnresponsive {
        network: NetworkId,
        device: DeviceId,
    },
    UpdateToken {
        entity: EntityId,
        token: String,
    },
}

impl RelayRequest {
    /// Operation this request expects a completion for
    pub fn operation(&self) -> Option<OperationId> {
        match self {
            RelayRequest::QueryRegions { op }
            | RelayRequest::CreateNetwork { op, .. }
            | RelayRequest::Connect { op, .. }
            | RelayRequest::Authenticate { op, .. }
            | RelayRequest::RemoveUser { op, .. }
            | RelayRequest::CreateEndpoint { op, .. }
            | RelayRequest::DestroyEndpoint { op, .. }
            | RelayRequest::CreateInvitation { op, .. }
            | RelayRequest::RevokeInvitation { op, .. }
            | RelayRequest::KickDevice { op, .. }
            | RelayRequest::KickUser { op, .. }
            | RelayRequest::ConnectChatControl { op, .. }
            | RelayRequest::DisconnectChatControl { op, .. }
            | RelayRequest::Leave { op, .. } => Some(*op),
            RelayRequest::AckEndpointDestroyed { .. }
            | RelayRequest::SetProperties { .. }
            | RelayRequest::SendPacket { .. }
            | RelayRequest::ReportUnresponsive { .. }
            | RelayRequest::UpdateToken { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RelayRequest::QueryRegions { .. } => "QueryRegions",
            RelayRequest::CreateNetwork { .. } => "CreateNetwork",
            RelayRequest::Connect { .. } => "Connect",
            RelayRequest::Authenticate { .. } => "Authenticate",
            RelayRequest::RemoveUser { .. } => "RemoveUser",
            RelayRequest::CreateEndpoint { .. } => "CreateEndpoint",
            RelayRequest::DestroyEndpoint { .. } => "DestroyEndpoint",
            RelayRequest::AckEndpointDestroyed { .. } => "AckEndpointDestroyed",
            RelayRequest::CreateInvitation { .. } => "CreateInvitation",
            RelayRequest::RevokeInvitation { .. } => "RevokeInvitation",
            RelayRequest::KickDevice { .. } => "KickDevice",
            RelayRequest::KickUser { .. } => "KickUser",
            RelayRequest::SetProperties { .. } => "SetProperties",
            RelayRequest::ConnectChatControl { .. } => "ConnectChatControl",
            RelayRequest::DisconnectChatControl { .. } => "DisconnectChatControl",
            RelayRequest::Leave { .. } => "Leave",
            RelayRequest::SendPacket { .. } => "SendPacket",
            RelayRequest::ReportUnresponsive { .. } => "ReportUnresponsive",
            RelayRequest::UpdateToken { .. } => "UpdateToken",
        }
    }
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Payload attached to a successful completion
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionDetail {
    None,
    Regions(Vec<RegionInfo>),
    NetworkCreated(NetworkDescriptor),
    Connected {
        descriptor: NetworkDescriptor,
        configuration: NetworkConfiguration,
        properties: Vec<PropertyUpdate>,
    },
    EndpointCreated(EndpointId),
}

#[derive(Debug, Clone)]
pub enum RelayEvent {
    OperationCompleted {
        op: OperationId,
        outcome: Outcome,
        detail: CompletionDetail,
    },
    DeviceJoined {
        network: NetworkId,
        device: DeviceId,
        properties: Vec<PropertyUpdate>,
    },
    DeviceLeft {
        network: NetworkId,
        device: DeviceId,
    },
    EndpointCreated {
        network: NetworkId,
        endpoint: RemoteEndpointInfo,
    },
    EndpointDestroyed {
        network: NetworkId,
        endpoint: EndpointId,
    },
    InvitationCreated {
        network: NetworkId,
        invitation: AppliedInvitation,
        creator: EntityId,
    },
    InvitationRevoked {
        network: NetworkId,
        invitation: InvitationId,
    },
    PropertiesChanged {
        network: NetworkId,
        scope: PropertyScope,
        updates: Vec<PropertyUpdate>,
    },
    ChatControlJoined {
        network: NetworkId,
        chat_control: RemoteChatControlInfo,
    },
    ChatControlLeft {
        network: NetworkId,
        chat_control: ChatControlId,
    },
    PacketReceived {
        network: NetworkId,
        from: DeviceId,
        payload: Vec<u8>,
    },
    /// A local user was kicked by the network's creator
    UserKicked {
        network: NetworkId,
        entity: EntityId,
    },
    /// This device is no longer part of the network
    Disconnected {
        network: NetworkId,
        reason: DisconnectReason,
    },
}

impl RelayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::OperationCompleted { .. } => "OperationCompleted",
            RelayEvent::DeviceJoined { .. } => "DeviceJoined",
            RelayEvent::DeviceLeft { .. } => "DeviceLeft",
            RelayEvent::EndpointCreated { .. } => "EndpointCreated",
            RelayEvent::EndpointDestroyed { .. } => "EndpointDestroyed",
            RelayEvent::InvitationCreated { .. } => "InvitationCreated",
            RelayEvent::InvitationRevoked { .. } => "InvitationRevoked",
            RelayEvent::PropertiesChanged { .. } => "PropertiesChanged",
            RelayEvent::ChatControlJoined { .. } => "ChatControlJoined",
            RelayEvent::ChatControlLeft { .. } => "ChatControlLeft",
            RelayEvent::PacketReceived { .. } => "PacketReceived",
            RelayEvent::UserKicked { .. } => "UserKicked",
            RelayEvent::Disconnected { .. } => "Disconnected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_and_forget_requests_have_no_operation() {
        let network = NetworkId::random();
        let send = RelayRequest::SendPacket {
            network,
            to: DeviceId::random(),
            payload: vec![1],
        };
        assert_eq!(send.operation(), None);
        assert_eq!(send.name(), "SendPacket");

        let leave = RelayRequest::Leave {
            op: OperationId::new(7),
            network,
        };
        assert_eq!(leave.operation(), Some(OperationId::new(7)));
    }
}
