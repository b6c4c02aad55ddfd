//! partyline core
//!
//! Transport-agnostic building blocks of the partyline session library:
//! identifiers and time sources, the layered error types, configuration,
//! the generation-checked handle arena, the double-buffered state change
//! queue, and the outbound message pipeline (send scheduling,
//! fragmentation, sequencing, guaranteed delivery, wire frames). The
//! engine that wires these together lives in `partyline-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod delivery;
pub mod descriptor;
pub mod errors;
pub mod fragmentation;
pub mod handle;
pub mod invitation;
pub mod message;
pub mod properties;
pub mod send_queue;
pub mod sequencing;
pub mod state_change;
pub mod types;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    DeliveryConfig, DirectPeerConnectivity, ManagerConfig, MatchmakingConfig,
    NetworkConfiguration, ReceiveConfig, SendQueueConfig, SessionTimings, WorkerTimings,
};
pub use descriptor::{DescriptorState, NetworkDescriptor, MAX_SERIALIZED_DESCRIPTOR_LEN};
pub use errors::{
    ConfigError, DescriptorError, FragmentationError, HandleError, Outcome, PartyError,
    PartyResult, Result, SendQueueError, StateChangeResult,
};
pub use handle::{Entity, Handle, HandleKind, HandleTable, RawHandle};
pub use invitation::{
    AppliedInvitation, InvitationConfiguration, InvitationId, InvitationRevocability,
    MAX_INVITATION_ID_LEN,
};
pub use message::{
    CancelFilter, CoalescingMode, DeliveryMode, OrderingMode, QueuingConfiguration,
    ReceivedMessageFlags, SendMessageOptions, CHAT_PRIORITY,
};
pub use properties::{PropertyUpdate, SharedProperties};
pub use send_queue::MessageStats;
pub use state_change::{StateChange, StateChangePayload, StateChangeQueue, StateChangeToken};
pub use types::{
    ChatControlId, DeviceId, EndpointId, EntityId, MessageId, NetworkId, OperationId,
    SystemTimeSource, TimeSource, Timestamp,
};
