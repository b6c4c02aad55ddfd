//! In-memory matchmaking service
//!
//! [`SimulatedMatchmaker`] stands in for the matchmaking service shared by
//! several clients. Each [`MatchmakerLink`] is one client's view and
//! implements [`MatchmakingService`]. Tickets that name members wait for
//! them to join; tickets waiting for a match are grouped per queue until
//! enough players are present.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use partyline_core::{EntityId, NetworkDescriptor, OperationId, Outcome, StateChangeResult};
use partyline_runtime::{
    MatchDetails, MatchMember, MatchmakingEvent, MatchmakingRequest, MatchmakingService,
    ServiceTicketStatus,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Players needed for a match when a queue has no rule of its own
pub const DEFAULT_MATCH_SIZE: usize = 2;

/// How a queue forms matches
#[derive(Debug, Clone)]
pub struct QueueRules {
    pub match_size: usize,
    /// Network every match in this queue is told to connect to
    pub network: Option<NetworkDescriptor>,
    pub region: String,
}

impl Default for QueueRules {
    fn default() -> Self {
        Self {
            match_size: DEFAULT_MATCH_SIZE,
            network: None,
            region: "simulated-east".to_string(),
        }
    }
}

type ClientId = u64;

#[derive(Debug)]
struct SimTicket {
    queue: String,
    creator: Option<EntityId>,
    required: Vec<EntityId>,
    joined: Vec<EntityId>,
    status: ServiceTicketStatus,
    /// Clients told about status changes, with the operation they use
    watchers: Vec<(ClientId, OperationId)>,
}

impl SimTicket {
    fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ServiceTicketStatus::Matched(_) | ServiceTicketStatus::Canceled | ServiceTicketStatus::Failed(_)
        )
    }

    fn players(&self) -> Vec<EntityId> {
        self.creator.iter().chain(self.joined.iter()).cloned().collect()
    }

    fn all_joined(&self) -> bool {
        self.required.iter().all(|member| self.joined.contains(member))
    }
}

#[derive(Debug, Default)]
struct MatchmakerState {
    next_client: ClientId,
    next_ticket: u64,
    /// Tickets in creation order
    tickets: Vec<(String, SimTicket)>,
    queues: HashMap<String, QueueRules>,
    inboxes: HashMap<ClientId, Vec<MatchmakingEvent>>,
    failures: HashMap<&'static str, Vec<StateChangeResult>>,
    requests_seen: HashMap<&'static str, usize>,
    matches_formed: usize,
}

impl MatchmakerState {
    fn push(&mut self, client: ClientId, event: MatchmakingEvent) {
        self.inboxes.entry(client).or_default().push(event);
    }

    fn ticket_mut(&mut self, id: &str) -> Option<&mut SimTicket> {
        self.tickets
            .iter_mut()
            .find(|(ticket_id, _)| ticket_id == id)
            .map(|(_, ticket)| ticket)
    }

    fn notify(&mut self, id: &str, except: Option<ClientId>) {
        let Some(ticket) = self.ticket_mut(id) else {
            return;
        };
        let status = ticket.status.clone();
        let watchers = ticket.watchers.clone();
        for (client, op) in watchers {
            if Some(client) != except {
                self.push(
                    client,
                    MatchmakingEvent::StatusReported {
                        op,
                        status: status.clone(),
                    },
                );
            }
        }
    }

    fn take_injected_failure(&mut self, name: &'static str) -> Option<StateChangeResult> {
        let queue = self.failures.get_mut(name)?;
        if queue.is_empty() {
            return None;
        }
        Some(queue.remove(0))
    }

    fn created(&mut self, client: ClientId, op: OperationId, outcome: Outcome, ticket_id: Option<String>, waiting: bool) {
        self.push(
            client,
            MatchmakingEvent::TicketCreated {
                op,
                outcome,
                ticket_id,
                waiting_for_players: waiting,
            },
        );
    }

    fn open_ticket(&mut self, client: ClientId, op: OperationId, queue: String, creator: Option<EntityId>, required: Vec<EntityId>) {
        self.next_ticket += 1;
        let id = format!("ticket-{}", self.next_ticket);
        let waiting = !required.is_empty();
        let status = if waiting {
            ServiceTicketStatus::WaitingForPlayers
        } else {
            ServiceTicketStatus::WaitingForMatch
        };
        debug!(ticket = %id, queue = %queue, waiting, "ticket opened");
        self.tickets.push((
            id.clone(),
            SimTicket {
                queue: queue.clone(),
                creator,
                required,
                joined: Vec::new(),
                status,
                watchers: vec![(client, op)],
            },
        ));
        self.created(client, op, Outcome::success(), Some(id), waiting);
        self.try_match(&queue);
    }

    fn handle(&mut self, client: ClientId, request: MatchmakingRequest) {
        *self.requests_seen.entry(request.name()).or_default() += 1;
        let op = request.operation();
        if let Some(result) = self.take_injected_failure(request.name()) {
            debug!(request = request.name(), result = ?result, "injected failure");
            let outcome = Outcome::failure(result);
            let event = match request {
                MatchmakingRequest::GetStatus { .. } => MatchmakingEvent::StatusReported {
                    op,
                    status: ServiceTicketStatus::Failed(outcome),
                },
                MatchmakingRequest::Cancel { .. } => MatchmakingEvent::CancelCompleted { op, canceled: false },
                _ => MatchmakingEvent::TicketCreated {
                    op,
                    outcome,
                    ticket_id: None,
                    waiting_for_players: false,
                },
            };
            self.push(client, event);
            return;
        }

        match request {
            MatchmakingRequest::CreateTicket {
                op,
                creator,
                queue_name,
                members,
                ..
            } => self.open_ticket(client, op, queue_name, Some(creator), members),
            MatchmakingRequest::CreateBackfillTicket {
                op,
                queue_name,
                members,
                ..
            } => {
                // members already on the server count as present
                self.next_ticket += 1;
                let id = format!("ticket-{}", self.next_ticket);
                self.tickets.push((
                    id.clone(),
                    SimTicket {
                        queue: queue_name.clone(),
                        creator: None,
                        required: Vec::new(),
                        joined: members,
                        status: ServiceTicketStatus::WaitingForMatch,
                        watchers: vec![(client, op)],
                    },
                ));
                self.created(client, op, Outcome::success(), Some(id), false);
                self.try_match(&queue_name);
            }
            MatchmakingRequest::JoinTicket {
                op,
                user,
                ticket_id,
                queue_name,
            } => self.join(client, op, user, ticket_id, queue_name),
            MatchmakingRequest::GetStatus { op, ticket_id } => {
                let status = match self.ticket_mut(&ticket_id) {
                    Some(ticket) => ticket.status.clone(),
                    None => ServiceTicketStatus::Failed(Outcome::failure(StateChangeResult::PartyServiceError)),
                };
                self.push(client, MatchmakingEvent::StatusReported { op, status });
            }
            MatchmakingRequest::Cancel { op, ticket_id } => {
                let canceled = match self.ticket_mut(&ticket_id) {
                    Some(ticket) if !ticket.is_terminal() => {
                        ticket.status = ServiceTicketStatus::Canceled;
                        true
                    }
                    _ => false,
                };
                self.push(client, MatchmakingEvent::CancelCompleted { op, canceled });
                if canceled {
                    info!(ticket = %ticket_id, "ticket canceled");
                    self.notify(&ticket_id, Some(client));
                }
            }
        }
    }

    fn join(&mut self, client: ClientId, op: OperationId, user: EntityId, ticket_id: String, queue: String) {
        let joined = match self.ticket_mut(&ticket_id) {
            Some(ticket) if !ticket.is_terminal() && ticket.queue == queue && ticket.required.contains(&user) => {
                if !ticket.joined.contains(&user) {
                    ticket.joined.push(user);
                }
                ticket.watchers.push((client, op));
                let all_joined = ticket.all_joined();
                if all_joined && ticket.status == ServiceTicketStatus::WaitingForPlayers {
                    ticket.status = ServiceTicketStatus::WaitingForMatch;
                }
                Some(!all_joined)
            }
            _ => None,
        };
        let Some(waiting) = joined else {
            self.created(
                client,
                op,
                Outcome::failure(StateChangeResult::UserNotAuthorized),
                None,
                false,
            );
            return;
        };
        self.created(client, op, Outcome::success(), Some(ticket_id.clone()), waiting);
        if !waiting {
            self.notify(&ticket_id, Some(client));
        }
        self.try_match(&queue);
    }

    /// Group waiting tickets of one queue, oldest first, once they hold
    /// enough players
    fn try_match(&mut self, queue: &str) {
        let rules = self.queues.get(queue).cloned().unwrap_or_default();
        let mut group = Vec::new();
        let mut players = Vec::new();
        for (id, ticket) in &self.tickets {
            if ticket.queue != queue || ticket.status != ServiceTicketStatus::WaitingForMatch {
                continue;
            }
            group.push(id.clone());
            players.extend(ticket.players());
            if players.len() >= rules.match_size {
                break;
            }
        }
        if players.len() < rules.match_size.max(1) {
            return;
        }

        let details = MatchDetails {
            match_id: Uuid::new_v4().to_string(),
            members: players
                .into_iter()
                .map(|entity| MatchMember { entity, team: None })
                .collect(),
            region_preferences: vec![rules.region.clone()],
            lobby_arrangement: None,
            network_descriptor: rules.network.clone(),
        };
        info!(queue, match_id = %details.match_id, tickets = group.len(), "match formed");
        self.matches_formed += 1;
        for id in group {
            if let Some(ticket) = self.ticket_mut(&id) {
                ticket.status = ServiceTicketStatus::Matched(details.clone());
            }
            self.notify(&id, None);
        }
    }
}

// ----------------------------------------------------------------------------
// Public Handle
// ----------------------------------------------------------------------------

/// Shared in-memory matchmaker; clones refer to the same service
#[derive(Debug, Clone, Default)]
pub struct SimulatedMatchmaker {
    state: Arc<Mutex<MatchmakerState>>,
}

impl SimulatedMatchmaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Service view for one client
    pub fn client(&self) -> Arc<MatchmakerLink> {
        let mut state = self.state.lock();
        state.next_client += 1;
        let client = state.next_client;
        state.inboxes.entry(client).or_default();
        Arc::new(MatchmakerLink {
            client,
            state: Arc::clone(&self.state),
        })
    }

    pub fn set_queue_rules(&self, queue: &str, rules: QueueRules) {
        self.state.lock().queues.insert(queue.to_string(), rules);
    }

    /// Fail the next request named `request` (see `MatchmakingRequest::name`)
    pub fn fail_next(&self, request: &'static str, result: StateChangeResult) {
        self.state.lock().failures.entry(request).or_default().push(result);
    }

    /// Fail a ticket from the service side
    pub fn fail_ticket(&self, ticket_id: &str, result: StateChangeResult) {
        let mut state = self.state.lock();
        let failed = match state.ticket_mut(ticket_id) {
            Some(ticket) if !ticket.is_terminal() => {
                ticket.status = ServiceTicketStatus::Failed(Outcome::failure(result));
                true
            }
            _ => false,
        };
        if failed {
            state.notify(ticket_id, None);
        }
    }

    pub fn requests_seen(&self, request: &str) -> usize {
        self.state
            .lock()
            .requests_seen
            .get(request)
            .copied()
            .unwrap_or_default()
    }

    pub fn matches_formed(&self) -> usize {
        self.state.lock().matches_formed
    }

    pub fn ticket_status(&self, ticket_id: &str) -> Option<ServiceTicketStatus> {
        self.state.lock().ticket_mut(ticket_id).map(|t| t.status.clone())
    }
}

/// One client's connection to a [`SimulatedMatchmaker`]
#[derive(Debug)]
pub struct MatchmakerLink {
    client: ClientId,
    state: Arc<Mutex<MatchmakerState>>,
}

impl MatchmakingService for MatchmakerLink {
    fn submit(&self, request: MatchmakingRequest) {
        self.state.lock().handle(self.client, request);
    }

    fn poll_events(&self) -> Vec<MatchmakingEvent> {
        self.state
            .lock()
            .inboxes
            .get_mut(&self.client)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str) -> EntityId {
        EntityId::new(name).unwrap()
    }

    fn created_id(events: &[MatchmakingEvent]) -> Option<String> {
        events.iter().find_map(|event| match event {
            MatchmakingEvent::TicketCreated { ticket_id, .. } => ticket_id.clone(),
            _ => None,
        })
    }

    #[test]
    fn test_two_solo_tickets_match() {
        let matchmaker = SimulatedMatchmaker::new();
        let a = matchmaker.client();
        let b = matchmaker.client();
        for (link, name) in [(&a, "alice"), (&b, "bob")] {
            link.submit(MatchmakingRequest::CreateTicket {
                op: OperationId::new(1),
                creator: entity(name),
                queue_name: "duel".into(),
                members: vec![],
                timeout_secs: 60,
                attributes: None,
            });
        }
        let events = a.poll_events();
        let matched = events.iter().any(|event| {
            matches!(
                event,
                MatchmakingEvent::StatusReported {
                    status: ServiceTicketStatus::Matched(details),
                    ..
                } if details.members.len() == 2
            )
        });
        assert!(matched);
        assert_eq!(matchmaker.matches_formed(), 1);
    }

    #[test]
    fn test_named_member_must_join_before_matching() {
        let matchmaker = SimulatedMatchmaker::new();
        matchmaker.set_queue_rules(
            "duo",
            QueueRules {
                match_size: 2,
                ..Default::default()
            },
        );
        let host = matchmaker.client();
        let guest = matchmaker.client();
        host.submit(MatchmakingRequest::CreateTicket {
            op: OperationId::new(1),
            creator: entity("alice"),
            queue_name: "duo".into(),
            members: vec![entity("bob")],
            timeout_secs: 60,
            attributes: None,
        });
        let ticket_id = created_id(&host.poll_events()).unwrap();
        assert_eq!(
            matchmaker.ticket_status(&ticket_id),
            Some(ServiceTicketStatus::WaitingForPlayers)
        );

        guest.submit(MatchmakingRequest::JoinTicket {
            op: OperationId::new(1),
            user: entity("mallory"),
            ticket_id: ticket_id.clone(),
            queue_name: "duo".into(),
        });
        assert!(created_id(&guest.poll_events()).is_none());

        guest.submit(MatchmakingRequest::JoinTicket {
            op: OperationId::new(2),
            user: entity("bob"),
            ticket_id: ticket_id.clone(),
            queue_name: "duo".into(),
        });
        assert_eq!(created_id(&guest.poll_events()), Some(ticket_id.clone()));
        assert!(matches!(
            matchmaker.ticket_status(&ticket_id),
            Some(ServiceTicketStatus::Matched(_))
        ));
    }

    #[test]
    fn test_cancel_after_match_reports_lost_race() {
        let matchmaker = SimulatedMatchmaker::new();
        let a = matchmaker.client();
        let b = matchmaker.client();
        for (link, name) in [(&a, "alice"), (&b, "bob")] {
            link.submit(MatchmakingRequest::CreateTicket {
                op: OperationId::new(1),
                creator: entity(name),
                queue_name: "duel".into(),
                members: vec![],
                timeout_secs: 60,
                attributes: None,
            });
        }
        a.poll_events();
        a.submit(MatchmakingRequest::Cancel {
            op: OperationId::new(1),
            ticket_id: "ticket-1".into(),
        });
        assert!(a
            .poll_events()
            .iter()
            .any(|e| matches!(e, MatchmakingEvent::CancelCompleted { canceled: false, .. })));
    }
}
