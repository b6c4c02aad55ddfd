//! Boundary to the matchmaking service
//!
//! Like the relay, the service is reached through a non-blocking submit and
//! a poll for events. Every request and event carries the operation id of
//! the ticket it concerns.

use partyline_core::{EntityId, OperationId, Outcome};

use super::ticket::{MatchDetails, ServerDetails};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchmakingRequest {
    CreateTicket {
        op: OperationId,
        creator: EntityId,
        queue_name: String,
        members: Vec<EntityId>,
        timeout_secs: u32,
        attributes: Option<String>,
    },
    JoinTicket {
        op: OperationId,
        user: EntityId,
        ticket_id: String,
        queue_name: String,
    },
    CreateBackfillTicket {
        op: OperationId,
        queue_name: String,
        members: Vec<EntityId>,
        server: ServerDetails,
        timeout_secs: u32,
    },
    GetStatus {
        op: OperationId,
        ticket_id: String,
    },
    /// Best effort; answered with `CancelCompleted`
    Cancel {
        op: OperationId,
        ticket_id: String,
    },
}

impl MatchmakingRequest {
    pub fn operation(&self) -> OperationId {
        match self {
            MatchmakingRequest::CreateTicket { op, .. }
            | MatchmakingRequest::JoinTicket { op, .. }
            | MatchmakingRequest::CreateBackfillTicket { op, .. }
            | MatchmakingRequest::GetStatus { op, .. }
            | MatchmakingRequest::Cancel { op, .. } => *op,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MatchmakingRequest::CreateTicket { .. } => "CreateTicket",
            MatchmakingRequest::JoinTicket { .. } => "JoinTicket",
            MatchmakingRequest::CreateBackfillTicket { .. } => "CreateBackfillTicket",
            MatchmakingRequest::GetStatus { .. } => "GetStatus",
            MatchmakingRequest::Cancel { .. } => "Cancel",
        }
    }
}

/// Ticket status as the service reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceTicketStatus {
    WaitingForPlayers,
    WaitingForMatch,
    Matched(MatchDetails),
    Canceled,
    Failed(Outcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchmakingEvent {
    /// Answer to a create, join or backfill request
    TicketCreated {
        op: OperationId,
        outcome: Outcome,
        ticket_id: Option<String>,
        waiting_for_players: bool,
    },
    StatusReported {
        op: OperationId,
        status: ServiceTicketStatus,
    },
    CancelCompleted {
        op: OperationId,
        canceled: bool,
    },
}

impl MatchmakingEvent {
    pub fn operation(&self) -> OperationId {
        match self {
            MatchmakingEvent::TicketCreated { op, .. }
            | MatchmakingEvent::StatusReported { op, .. }
            | MatchmakingEvent::CancelCompleted { op, .. } => *op,
        }
    }
}

pub trait MatchmakingService: Send + Sync {
    fn submit(&self, request: MatchmakingRequest);

    fn poll_events(&self) -> Vec<MatchmakingEvent>;
}
