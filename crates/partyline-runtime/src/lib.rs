//! partyline runtime
//!
//! The session engine built on `partyline-core`: the [`PartyManager`] and
//! its entity graph, the network session state machine, the relay and
//! matchmaking service boundaries, the audio and networking workers, and
//! the independent [`MatchmakingManager`].

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod changes;
mod engine;
pub mod entities;
pub mod manager;
pub mod matchmaking;
pub mod network;
pub mod options;
pub mod relay;
pub mod worker;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use changes::{
    ChatControlDestroyedReason, ChatControlLeftReason, EndpointDestroyedReason,
    InvitationDestroyedReason, LocalUserRemovedReason, NetworkDestroyedReason, PartyStateChange,
    ReleaseAction, StateChangeKind,
};
pub use entities::{
    ChatControl, ChatPermissions, Device, Endpoint, EndpointState, Invitation, InvitationState,
    LocalUser, TextFilterLevel,
};
pub use manager::{PartyManager, PartyManagerBuilder};
pub use matchmaking::{
    MatchDetails, MatchMember, MatchmakingChangeKind, MatchmakingEvent, MatchmakingManager,
    MatchmakingRequest, MatchmakingService, MatchmakingStateChange, ServerDetails,
    ServiceTicketStatus, Ticket, TicketConfiguration, TicketStatus,
};
pub use network::{AuditEntry, Network, NetworkState, NetworkStatistics, ReceiveStats};
pub use options::{PartyOption, PartyOptionKind, PartyOptions};
pub use relay::{
    CompletionDetail, DisconnectReason, PropertyScope, RegionInfo, RelayEvent, RelayRequest,
    RelayTransport, RemoteChatControlInfo, RemoteEndpointInfo,
};
pub use worker::{ThreadId, WorkMode};

pub use partyline_core::{
    EndpointId, EntityId, Handle, InvitationConfiguration, InvitationId, ManagerConfig,
    NetworkConfiguration, NetworkDescriptor, Outcome, PartyError, PropertyUpdate, Result,
    StateChangeResult,
};
