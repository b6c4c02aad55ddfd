//! Network session state machine
//!
//! A network moves through `Connecting → Connected → Authenticated →
//! Leaving → Destroyed`. Transitions are pure: [`NetworkState::transition`]
//! returns the new state, the effects to run and an audit entry, and
//! [`Network::apply`] runs the effects against the session's timers.
//!
//! The [`Network`] entity also owns the per-network message pipeline
//! (send scheduler, retransmission, reassembly, ordering) and the view of
//! the network's population that getters read.

use std::collections::VecDeque;

use hashbrown::HashMap;
use partyline_core::delivery::{DeliveryTracker, FragmentKey};
use partyline_core::fragmentation::MessageReassembler;
use partyline_core::send_queue::SendScheduler;
use partyline_core::sequencing::SequenceTracker;
use partyline_core::wire::{DeliveredMessages, Frame};
use partyline_core::{
    DeviceId, DirectPeerConnectivity, EndpointId, Entity, Handle, HandleKind, ManagerConfig,
    MessageId, MessageStats, NetworkConfiguration, NetworkDescriptor, NetworkId,
    ReceivedMessageFlags, SessionTimings, SharedProperties, Timestamp,
};
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use thiserror::Error;
use tracing::debug;

use crate::entities::{ChatControl, Device, Endpoint, Invitation, LocalUser};

/// Transitions kept per network for diagnostics
const AUDIT_HISTORY: usize = 32;

// ----------------------------------------------------------------------------
// States and Events
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkState {
    Connecting,
    /// Connected with no authenticated user; the disconnect timer runs
    Connected,
    Authenticated,
    Leaving,
    Destroyed,
}

/// Inputs that drive the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectSucceeded,
    ConnectFailed,
    UserAuthenticated,
    LastUserRemoved,
    LeaveRequested,
    /// Fatal loss of the session, including completion of a leave
    Lost,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::ConnectSucceeded => "ConnectSucceeded",
            SessionEvent::ConnectFailed => "ConnectFailed",
            SessionEvent::UserAuthenticated => "UserAuthenticated",
            SessionEvent::LastUserRemoved => "LastUserRemoved",
            SessionEvent::LeaveRequested => "LeaveRequested",
            SessionEvent::Lost => "Lost",
        }
    }
}

/// Side effects of a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEffect {
    ArmDisconnectTimer,
    DisarmDisconnectTimer,
}

/// Result of a successful transition
#[derive(Debug, Clone)]
pub struct NetworkTransition {
    pub new_state: NetworkState,
    pub effects: SmallVec<[SessionEffect; 2]>,
    pub audit_entry: AuditEntry,
}

/// Audit trail entry for a state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub network: NetworkId,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    pub effects_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Invalid transition from {from_state} on {event}")]
    InvalidTransition {
        from_state: &'static str,
        event: &'static str,
    },
}

impl NetworkState {
    pub fn state_name(&self) -> &'static str {
        match self {
            NetworkState::Connecting => "Connecting",
            NetworkState::Connected => "Connected",
            NetworkState::Authenticated => "Authenticated",
            NetworkState::Leaving => "Leaving",
            NetworkState::Destroyed => "Destroyed",
        }
    }

    /// Whether new operations may be started on the network
    pub fn accepts_operations(&self) -> bool {
        !matches!(self, NetworkState::Leaving | NetworkState::Destroyed)
    }

    pub fn transition(
        self,
        event: SessionEvent,
        network: NetworkId,
        now: Timestamp,
    ) -> Result<NetworkTransition, TransitionError> {
        use NetworkState::*;
        use SessionEvent::*;

        let (new_state, effects): (NetworkState, SmallVec<[SessionEffect; 2]>) =
            match (self, event) {
                (Connecting, ConnectSucceeded) => {
                    (Connected, smallvec![SessionEffect::ArmDisconnectTimer])
                }
                (Connecting, ConnectFailed) => (Destroyed, SmallVec::new()),
                (Connecting | Connected | Authenticated, UserAuthenticated) => {
                    (Authenticated, smallvec![SessionEffect::DisarmDisconnectTimer])
                }
                (Authenticated, LastUserRemoved) => {
                    (Connected, smallvec![SessionEffect::ArmDisconnectTimer])
                }
                (Connected, LastUserRemoved) => (Connected, SmallVec::new()),
                (Connecting | Connected | Authenticated, LeaveRequested) => {
                    (Leaving, smallvec![SessionEffect::DisarmDisconnectTimer])
                }
                (Connecting | Connected | Authenticated | Leaving, Lost) => {
                    (Destroyed, smallvec![SessionEffect::DisarmDisconnectTimer])
                }
                (from, event) => {
                    return Err(TransitionError::InvalidTransition {
                        from_state: from.state_name(),
                        event: event.name(),
                    })
                }
            };

        let audit_entry = AuditEntry {
            timestamp: now,
            network,
            from_state: self.state_name().to_string(),
            to_state: new_state.state_name().to_string(),
            event: event.name().to_string(),
            effects_count: effects.len(),
        };
        Ok(NetworkTransition {
            new_state,
            effects,
            audit_entry,
        })
    }
}

// ----------------------------------------------------------------------------
// Membership and Timers
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MembershipState {
    Authenticating,
    Authenticated,
    Removing,
}

#[derive(Debug, Clone)]
pub(crate) struct Membership {
    pub user: Handle<LocalUser>,
    pub state: MembershipState,
}

/// Remote endpoint destruction this device still has to acknowledge
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteDestroy {
    pub endpoint: EndpointId,
    pub deadline: Timestamp,
}

/// Local endpoint destruction waiting for the relay
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalDestroy {
    pub endpoint: Handle<Endpoint>,
    pub deadline: Timestamp,
}

// ----------------------------------------------------------------------------
// Published View
// ----------------------------------------------------------------------------

/// What getters see; updated only at the publish point
#[derive(Debug, Clone)]
pub(crate) struct NetworkView {
    pub descriptor: NetworkDescriptor,
    pub configuration: Option<NetworkConfiguration>,
    pub state: NetworkState,
    pub devices: Vec<Handle<Device>>,
    pub endpoints: Vec<Handle<Endpoint>>,
    pub local_users: Vec<Handle<LocalUser>>,
    pub invitations: Vec<Handle<Invitation>>,
    pub chat_controls: Vec<Handle<ChatControl>>,
    pub properties: SharedProperties,
}

// ----------------------------------------------------------------------------
// Transport State
// ----------------------------------------------------------------------------

/// A sequential message held until older ones arrive
#[derive(Debug, Clone)]
pub(crate) struct HeldMessage {
    pub source: DeviceId,
    pub message_id: MessageId,
    pub sender: u64,
    pub flags: ReceivedMessageFlags,
    pub data: Vec<u8>,
}

/// Receive-side counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveStats {
    pub received_messages: u64,
    pub received_bytes: u64,
    pub duplicate_fragments: u64,
    pub dropped_messages: u64,
}

/// Snapshot returned by `PartyManager::network_statistics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatistics {
    pub send: MessageStats,
    pub receive: ReceiveStats,
    pub fragments_in_flight: u64,
    pub retransmissions: u64,
    pub acknowledged_fragments: u64,
    pub reassemblies_pending: u64,
}

#[derive(Debug)]
pub(crate) struct NetworkTransport {
    pub scheduler: SendScheduler,
    pub delivery: DeliveryTracker<Frame>,
    pub reassembler: MessageReassembler,
    pub sequencing: SequenceTracker<HeldMessage>,
    pub delivered: DeliveredMessages,
    pub pending_acks: HashMap<DeviceId, Vec<FragmentKey>>,
    pub received: ReceiveStats,
}

impl NetworkTransport {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            scheduler: SendScheduler::new(config.send_queue.clone()),
            delivery: DeliveryTracker::new(config.delivery.clone()),
            reassembler: MessageReassembler::new(
                config.receive.reassembly_memory_limit,
                core::time::Duration::from_millis(config.receive.reassembly_timeout_ms),
            ),
            sequencing: SequenceTracker::new(config.receive.reorder_buffer_limit),
            delivered: DeliveredMessages::new(config.receive.duplicate_history),
            pending_acks: HashMap::new(),
            received: ReceiveStats::default(),
        }
    }

    pub fn statistics(&self) -> NetworkStatistics {
        NetworkStatistics {
            send: self.scheduler.network_stats(),
            receive: self.received,
            fragments_in_flight: self.delivery.in_flight() as u64,
            retransmissions: self.delivery.retransmissions(),
            acknowledged_fragments: self.delivery.acknowledged(),
            reassemblies_pending: self.reassembler.pending() as u64,
        }
    }
}

// ----------------------------------------------------------------------------
// Network Entity
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Network {
    pub(crate) id: NetworkId,
    pub(crate) state: NetworkState,
    pub(crate) descriptor: NetworkDescriptor,
    pub(crate) configuration: Option<NetworkConfiguration>,
    pub(crate) connectivity: DirectPeerConnectivity,
    pub(crate) members: Vec<Membership>,
    /// Local and remote endpoints that are not destroyed
    pub(crate) endpoints: Vec<Handle<Endpoint>>,
    pub(crate) endpoint_index: HashMap<EndpointId, Handle<Endpoint>>,
    /// Remote devices currently joined
    pub(crate) devices: Vec<Handle<Device>>,
    pub(crate) invitations: Vec<Handle<Invitation>>,
    /// Local and remote chat controls currently joined
    pub(crate) chat_controls: Vec<Handle<ChatControl>>,
    pub(crate) view: NetworkView,
    pub(crate) disconnect_deadline: Option<Timestamp>,
    pub(crate) remote_destroys: Vec<RemoteDestroy>,
    pub(crate) local_destroys: Vec<LocalDestroy>,
    pub(crate) transport: NetworkTransport,
    audit: VecDeque<AuditEntry>,
}

impl Entity for Network {
    const KIND: HandleKind = HandleKind::Network;
}

impl Network {
    pub(crate) fn new(
        descriptor: NetworkDescriptor,
        connectivity: DirectPeerConnectivity,
        config: &ManagerConfig,
    ) -> Self {
        Self {
            id: descriptor.network_id(),
            state: NetworkState::Connecting,
            view: NetworkView {
                descriptor: descriptor.clone(),
                configuration: None,
                state: NetworkState::Connecting,
                devices: Vec::new(),
                endpoints: Vec::new(),
                local_users: Vec::new(),
                invitations: Vec::new(),
                chat_controls: Vec::new(),
                properties: SharedProperties::new(),
            },
            descriptor,
            configuration: None,
            connectivity,
            members: Vec::new(),
            endpoints: Vec::new(),
            endpoint_index: HashMap::new(),
            devices: Vec::new(),
            invitations: Vec::new(),
            chat_controls: Vec::new(),
            disconnect_deadline: None,
            remote_destroys: Vec::new(),
            local_destroys: Vec::new(),
            transport: NetworkTransport::new(config),
            audit: VecDeque::new(),
        }
    }

    /// Drive the state machine and run the resulting effects
    pub(crate) fn apply(
        &mut self,
        event: SessionEvent,
        now: Timestamp,
        timings: &SessionTimings,
    ) -> Result<NetworkState, TransitionError> {
        let transition = self.state.transition(event, self.id, now)?;
        for effect in &transition.effects {
            match effect {
                SessionEffect::ArmDisconnectTimer => {
                    self.disconnect_deadline = Some(now + timings.connected_grace_period());
                }
                SessionEffect::DisarmDisconnectTimer => self.disconnect_deadline = None,
            }
        }
        debug!(
            network = %self.id,
            from = %transition.audit_entry.from_state,
            to = %transition.audit_entry.to_state,
            event = %transition.audit_entry.event,
            "network transition"
        );
        if self.audit.len() == AUDIT_HISTORY {
            self.audit.pop_front();
        }
        self.audit.push_back(transition.audit_entry);
        self.state = transition.new_state;
        Ok(self.state)
    }

    pub(crate) fn audit_trail(&self) -> Vec<AuditEntry> {
        self.audit.iter().cloned().collect()
    }

    pub(crate) fn membership(&self, user: Handle<LocalUser>) -> Option<&Membership> {
        self.members.iter().find(|m| m.user == user)
    }

    pub(crate) fn membership_mut(&mut self, user: Handle<LocalUser>) -> Option<&mut Membership> {
        self.members.iter_mut().find(|m| m.user == user)
    }

    pub(crate) fn is_authenticated(&self, user: Handle<LocalUser>) -> bool {
        self.membership(user)
            .is_some_and(|m| m.state == MembershipState::Authenticated)
    }

    pub(crate) fn authenticated_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.state != MembershipState::Authenticating)
            .count()
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state != NetworkState::Destroyed
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(
            NetworkDescriptor::provisional(NetworkId::random()),
            DirectPeerConnectivity::none(),
            &ManagerConfig::testing(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_then_authenticate_disarms_timer() {
        let timings = ManagerConfig::testing().session;
        let mut network = Network::for_tests();
        network
            .apply(SessionEvent::ConnectSucceeded, Timestamp::new(100), &timings)
            .unwrap();
        assert_eq!(network.state, NetworkState::Connected);
        assert_eq!(
            network.disconnect_deadline,
            Some(Timestamp::new(100) + timings.connected_grace_period())
        );

        network
            .apply(SessionEvent::UserAuthenticated, Timestamp::new(200), &timings)
            .unwrap();
        assert_eq!(network.state, NetworkState::Authenticated);
        assert_eq!(network.disconnect_deadline, None);

        network
            .apply(SessionEvent::LastUserRemoved, Timestamp::new(300), &timings)
            .unwrap();
        assert_eq!(network.state, NetworkState::Connected);
        assert!(network.disconnect_deadline.is_some());
        assert_eq!(network.audit_trail().len(), 3);
    }

    #[test]
    fn test_connect_failure_skips_connected() {
        let transition = NetworkState::Connecting
            .transition(SessionEvent::ConnectFailed, NetworkId::random(), Timestamp::new(0))
            .unwrap();
        assert_eq!(transition.new_state, NetworkState::Destroyed);
        assert_eq!(transition.audit_entry.from_state, "Connecting");
    }

    #[test]
    fn test_leaving_rejects_authentication() {
        let err = NetworkState::Leaving
            .transition(SessionEvent::UserAuthenticated, NetworkId::random(), Timestamp::new(0))
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::InvalidTransition {
                from_state: "Leaving",
                event: "UserAuthenticated"
            }
        );
        assert!(!NetworkState::Leaving.accepts_operations());
    }

    #[test]
    fn test_destroyed_is_terminal() {
        for event in [
            SessionEvent::ConnectSucceeded,
            SessionEvent::UserAuthenticated,
            SessionEvent::LeaveRequested,
            SessionEvent::Lost,
        ] {
            assert!(NetworkState::Destroyed
                .transition(event, NetworkId::random(), Timestamp::new(0))
                .is_err());
        }
    }

    #[test]
    fn test_audit_history_is_bounded() {
        let timings = ManagerConfig::testing().session;
        let mut network = Network::for_tests();
        network
            .apply(SessionEvent::ConnectSucceeded, Timestamp::new(0), &timings)
            .unwrap();
        for i in 0..AUDIT_HISTORY as u64 {
            network
                .apply(SessionEvent::UserAuthenticated, Timestamp::new(i), &timings)
                .unwrap();
        }
        assert_eq!(network.audit_trail().len(), AUDIT_HISTORY);
    }
}
