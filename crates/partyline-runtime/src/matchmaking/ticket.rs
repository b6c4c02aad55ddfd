//! Matchmaking ticket entity and its state machine
//!
//! `Creating → (Joining) → WaitingForPlayers → WaitingForMatch → {Matched |
//! Canceled | Failed}`. A ticket waits for players only while members it
//! names have not joined it, and cannot match before they have.

use partyline_core::{
    Entity, EntityId, HandleKind, NetworkDescriptor, OperationId, Outcome, Timestamp,
};
use serde::{Deserialize, Serialize};

use crate::network::TransitionError;

/// Longest queue name the service accepts
pub const MAX_QUEUE_NAME_LEN: usize = 64;

/// Most members a ticket may name
pub const MAX_TICKET_MEMBERS: usize = 32;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TicketConfiguration {
    pub queue_name: String,
    /// Remote users that must join before matching can start
    pub members_to_match_with: Vec<EntityId>,
    /// Client-side deadline; the manager default applies when unset
    pub timeout_secs: Option<u32>,
    /// Opaque attributes forwarded to the service
    pub attributes: Option<String>,
}

/// Game server a backfill ticket fills
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDetails {
    pub fqdn: String,
    pub ipv4_address: String,
    pub ports: Vec<u16>,
    pub region: String,
}

// ----------------------------------------------------------------------------
// Match Result
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchMember {
    pub entity: EntityId,
    pub team: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDetails {
    pub match_id: String,
    pub members: Vec<MatchMember>,
    pub region_preferences: Vec<String>,
    pub lobby_arrangement: Option<String>,
    /// Network the matched members should connect to
    pub network_descriptor: Option<NetworkDescriptor>,
}

// ----------------------------------------------------------------------------
// States and Events
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketStatus {
    Creating,
    Joining,
    WaitingForPlayers,
    WaitingForMatch,
    Matched,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketEvent {
    /// The service accepted the ticket
    Accepted { waiting_for_players: bool },
    AllPlayersJoined,
    MatchFound,
    Canceled,
    Failed,
}

impl TicketEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TicketEvent::Accepted { .. } => "Accepted",
            TicketEvent::AllPlayersJoined => "AllPlayersJoined",
            TicketEvent::MatchFound => "MatchFound",
            TicketEvent::Canceled => "Canceled",
            TicketEvent::Failed => "Failed",
        }
    }
}

impl TicketStatus {
    pub fn state_name(&self) -> &'static str {
        match self {
            TicketStatus::Creating => "Creating",
            TicketStatus::Joining => "Joining",
            TicketStatus::WaitingForPlayers => "WaitingForPlayers",
            TicketStatus::WaitingForMatch => "WaitingForMatch",
            TicketStatus::Matched => "Matched",
            TicketStatus::Canceled => "Canceled",
            TicketStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TicketStatus::Matched | TicketStatus::Canceled | TicketStatus::Failed
        )
    }

    pub fn transition(self, event: TicketEvent) -> Result<TicketStatus, TransitionError> {
        use TicketStatus::{Creating, Joining, Matched, WaitingForMatch, WaitingForPlayers};

        let next = match (self, event) {
            (Creating | Joining, TicketEvent::Accepted { waiting_for_players: true }) => WaitingForPlayers,
            (Creating | Joining, TicketEvent::Accepted { waiting_for_players: false }) => WaitingForMatch,
            (WaitingForPlayers, TicketEvent::AllPlayersJoined) => WaitingForMatch,
            (WaitingForMatch, TicketEvent::MatchFound) => Matched,
            (Creating | Joining | WaitingForPlayers | WaitingForMatch, TicketEvent::Canceled) => {
                TicketStatus::Canceled
            }
            (Creating | Joining | WaitingForPlayers | WaitingForMatch, TicketEvent::Failed) => {
                TicketStatus::Failed
            }
            (from, event) => {
                return Err(TransitionError::InvalidTransition {
                    from_state: from.state_name(),
                    event: event.name(),
                })
            }
        };
        Ok(next)
    }
}

// ----------------------------------------------------------------------------
// Ticket Entity
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Ticket {
    /// Correlates service requests and events with this ticket
    pub(crate) op: OperationId,
    pub(crate) user: Option<EntityId>,
    pub(crate) config: TicketConfiguration,
    pub(crate) server: Option<ServerDetails>,
    pub(crate) remote_id: Option<String>,
    pub(crate) status: TicketStatus,
    pub(crate) deadline: Timestamp,
    pub(crate) next_poll: Option<Timestamp>,
    pub(crate) cancel_requested: bool,
    pub(crate) outcome: Option<Outcome>,
    pub(crate) match_details: Option<MatchDetails>,
}

impl Entity for Ticket {
    const KIND: HandleKind = HandleKind::Ticket;
}

impl Ticket {
    pub(crate) fn is_backfill(&self) -> bool {
        self.server.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_members_gate_matching() {
        let status = TicketStatus::Creating
            .transition(TicketEvent::Accepted {
                waiting_for_players: true,
            })
            .unwrap();
        assert_eq!(status, TicketStatus::WaitingForPlayers);
        assert!(status.transition(TicketEvent::MatchFound).is_err());

        let status = status.transition(TicketEvent::AllPlayersJoined).unwrap();
        assert_eq!(status.transition(TicketEvent::MatchFound).unwrap(), TicketStatus::Matched);
    }

    #[test]
    fn test_terminal_states_absorb_nothing() {
        for terminal in [TicketStatus::Matched, TicketStatus::Canceled, TicketStatus::Failed] {
            assert!(terminal.is_terminal());
            assert!(terminal.transition(TicketEvent::Canceled).is_err());
            assert!(terminal.transition(TicketEvent::Failed).is_err());
        }
        assert_eq!(
            TicketStatus::Joining.transition(TicketEvent::Canceled).unwrap(),
            TicketStatus::Canceled
        );
    }
}
