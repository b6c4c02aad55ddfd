//! Matchmaking
//!
//! Tickets live independently of networks. A [`MatchmakingManager`] owns
//! its own handle table and its own state change queue; it is driven by
//! [`MatchmakingManager::do_work`], which drains service events, enforces
//! ticket deadlines and polls the service for status.

mod service;
mod ticket;

pub use service::{MatchmakingEvent, MatchmakingRequest, MatchmakingService, ServiceTicketStatus};
pub use ticket::{
    MatchDetails, MatchMember, ServerDetails, Ticket, TicketConfiguration, TicketEvent, TicketStatus,
    MAX_QUEUE_NAME_LEN, MAX_TICKET_MEMBERS,
};

use std::sync::Arc;
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use partyline_core::{
    EntityId, Handle, HandleTable, MatchmakingConfig, OperationId, Outcome, PartyError, RawHandle,
    Result, StateChange, StateChangePayload, StateChangeQueue, StateChangeResult, SystemTimeSource,
    TimeSource, Timestamp,
};
use smallvec::{smallvec, SmallVec};
use tracing::{debug, info, trace, warn};

// ----------------------------------------------------------------------------
// State Changes
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchmakingChangeKind {
    TicketStatusChanged {
        ticket: Handle<Ticket>,
        status: TicketStatus,
    },
    /// Terminal; `outcome` is a success only for a match
    TicketCompleted {
        ticket: Handle<Ticket>,
        outcome: Outcome,
    },
}

impl MatchmakingChangeKind {
    pub fn ticket(&self) -> Handle<Ticket> {
        match self {
            MatchmakingChangeKind::TicketStatusChanged { ticket, .. }
            | MatchmakingChangeKind::TicketCompleted { ticket, .. } => *ticket,
        }
    }
}

impl StateChangePayload for MatchmakingChangeKind {
    fn handles(&self) -> SmallVec<[RawHandle; 4]> {
        smallvec![self.ticket().raw()]
    }

    fn kind_name(&self) -> &'static str {
        match self {
            MatchmakingChangeKind::TicketStatusChanged { .. } => "TicketStatusChanged",
            MatchmakingChangeKind::TicketCompleted { .. } => "TicketCompleted",
        }
    }
}

pub type MatchmakingStateChange = StateChange<MatchmakingChangeKind>;

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MatchmakingState {
    tickets: HandleTable<Ticket>,
    by_op: HashMap<OperationId, Handle<Ticket>>,
    /// Destroyed while the service had not answered the creation yet
    orphaned: HashSet<OperationId>,
    next_op: u64,
}

pub struct MatchmakingManager {
    service: Arc<dyn MatchmakingService>,
    clock: Arc<dyn TimeSource>,
    config: MatchmakingConfig,
    queue: StateChangeQueue<MatchmakingChangeKind, ()>,
    state: Mutex<MatchmakingState>,
}

impl MatchmakingManager {
    pub fn new(service: Arc<dyn MatchmakingService>, config: MatchmakingConfig) -> Self {
        Self {
            service,
            clock: Arc::new(SystemTimeSource::new()),
            config,
            queue: StateChangeQueue::new(),
            state: Mutex::new(MatchmakingState::default()),
        }
    }

    pub fn with_time_source(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    fn poll_interval(&self) -> Duration {
        self.config.status_poll_interval()
    }

    fn emit(&self, state: &mut MatchmakingState, change: MatchmakingChangeKind) {
        if let Err(err) = state.tickets.add_ref(change.ticket()) {
            warn!(error = %err, "state change for a dead ticket dropped");
            return;
        }
        trace!(kind = change.kind_name(), "matchmaking state change queued");
        self.queue.enqueue(change, std::iter::empty());
    }

    fn validate(config: &TicketConfiguration) -> Result<u32> {
        if config.queue_name.is_empty() || config.queue_name.len() > MAX_QUEUE_NAME_LEN {
            return Err(PartyError::invalid_argument(format!(
                "queue name must be 1..={MAX_QUEUE_NAME_LEN} bytes"
            )));
        }
        if config.members_to_match_with.len() > MAX_TICKET_MEMBERS {
            return Err(PartyError::limit_exceeded("ticket member", MAX_TICKET_MEMBERS));
        }
        let mut seen = HashSet::new();
        if !config.members_to_match_with.iter().all(|member| seen.insert(member)) {
            return Err(PartyError::invalid_argument("ticket members must be distinct"));
        }
        match config.timeout_secs {
            Some(0) => Err(PartyError::invalid_argument("ticket timeout must be positive")),
            Some(secs) => Ok(secs),
            None => Ok(0),
        }
    }

    fn allocate(
        &self,
        state: &mut MatchmakingState,
        user: Option<EntityId>,
        config: TicketConfiguration,
        server: Option<ServerDetails>,
        status: TicketStatus,
        timeout_secs: u32,
    ) -> Handle<Ticket> {
        state.next_op += 1;
        let op = OperationId::new(state.next_op);
        let deadline = self.clock.now() + Duration::from_secs(u64::from(timeout_secs));
        let handle = state.tickets.allocate(Ticket {
            op,
            user,
            config,
            server,
            remote_id: None,
            status,
            deadline,
            next_poll: None,
            cancel_requested: false,
            outcome: None,
            match_details: None,
        });
        state.by_op.insert(op, handle);
        handle
    }

    fn timeout_or_default(&self, requested: u32) -> u32 {
        if requested == 0 {
            self.config.default_ticket_timeout_secs
        } else {
            requested
        }
    }

    // ------------------------------------------------------------------------
    // Ticket Operations
    // ------------------------------------------------------------------------

    /// Start a ticket on behalf of `user`; at most one live ticket per user
    /// and queue
    pub fn create_ticket(&self, user: EntityId, config: TicketConfiguration) -> Result<Handle<Ticket>> {
        let timeout = self.timeout_or_default(Self::validate(&config)?);
        if config.members_to_match_with.contains(&user) {
            return Err(PartyError::invalid_argument("a ticket cannot name its creator as a member"));
        }
        let mut state = self.state.lock();
        let busy = state.tickets.iter().any(|(_, ticket)| {
            !ticket.status.is_terminal()
                && ticket.user.as_ref() == Some(&user)
                && ticket.config.queue_name == config.queue_name
        });
        if busy {
            return Err(PartyError::duplicate(format!("ticket for {user} in {}", config.queue_name)));
        }

        let request = MatchmakingRequest::CreateTicket {
            op: OperationId::new(0),
            creator: user.clone(),
            queue_name: config.queue_name.clone(),
            members: config.members_to_match_with.clone(),
            timeout_secs: timeout,
            attributes: config.attributes.clone(),
        };
        let handle = self.allocate(&mut state, Some(user), config, None, TicketStatus::Creating, timeout);
        self.submit_for(&state, handle, request);
        Ok(handle)
    }

    /// Join a ticket another device created and shared by id
    pub fn join_ticket(
        &self,
        user: EntityId,
        ticket_id: &str,
        config: TicketConfiguration,
    ) -> Result<Handle<Ticket>> {
        let timeout = self.timeout_or_default(Self::validate(&config)?);
        if ticket_id.is_empty() {
            return Err(PartyError::invalid_argument("ticket id must not be empty"));
        }
        let mut state = self.state.lock();
        let request = MatchmakingRequest::JoinTicket {
            op: OperationId::new(0),
            user: user.clone(),
            ticket_id: ticket_id.to_string(),
            queue_name: config.queue_name.clone(),
        };
        let handle = self.allocate(&mut state, Some(user), config, None, TicketStatus::Joining, timeout);
        if let Ok(ticket) = state.tickets.resolve_mut(handle) {
            ticket.remote_id = Some(ticket_id.to_string());
        }
        self.submit_for(&state, handle, request);
        Ok(handle)
    }

    /// Ticket filling an already running game server; never waits for
    /// players
    pub fn create_server_backfill_ticket(
        &self,
        config: TicketConfiguration,
        server: ServerDetails,
    ) -> Result<Handle<Ticket>> {
        let timeout = self.timeout_or_default(Self::validate(&config)?);
        if server.fqdn.is_empty() || server.ports.is_empty() {
            return Err(PartyError::invalid_argument("server details need an address and a port"));
        }
        let mut state = self.state.lock();
        let request = MatchmakingRequest::CreateBackfillTicket {
            op: OperationId::new(0),
            queue_name: config.queue_name.clone(),
            members: config.members_to_match_with.clone(),
            server: server.clone(),
            timeout_secs: timeout,
        };
        let handle = self.allocate(&mut state, None, config, Some(server), TicketStatus::Creating, timeout);
        self.submit_for(&state, handle, request);
        Ok(handle)
    }

    fn submit_for(&self, state: &MatchmakingState, handle: Handle<Ticket>, mut request: MatchmakingRequest) {
        let Ok(ticket) = state.tickets.resolve(handle) else {
            return;
        };
        match &mut request {
            MatchmakingRequest::CreateTicket { op, .. }
            | MatchmakingRequest::JoinTicket { op, .. }
            | MatchmakingRequest::CreateBackfillTicket { op, .. }
            | MatchmakingRequest::GetStatus { op, .. }
            | MatchmakingRequest::Cancel { op, .. } => *op = ticket.op,
        }
        debug!(op = %ticket.op, request = request.name(), "matchmaking request");
        self.service.submit(request);
    }

    /// Best effort: if the service cancels in time the ticket completes
    /// with `CanceledByTitle`, otherwise its natural completion still occurs
    pub fn cancel_ticket(&self, ticket: Handle<Ticket>) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.tickets.resolve_mut(ticket)?;
        if entry.status.is_terminal() {
            return Err(PartyError::invalid_state(
                entry.status.state_name(),
                "ticket has already completed",
            ));
        }
        if entry.cancel_requested {
            return Ok(());
        }
        entry.cancel_requested = true;
        // Joining tickets know the id up front but cannot cancel before the
        // join lands.
        let accepted = !matches!(entry.status, TicketStatus::Creating | TicketStatus::Joining);
        if let (true, Some(ticket_id)) = (accepted, entry.remote_id.clone()) {
            let op = entry.op;
            self.service.submit(MatchmakingRequest::Cancel { op, ticket_id });
        }
        Ok(())
    }

    /// Returns at once; a live ticket gets one fire-and-forget remote
    /// cancel
    pub fn destroy_ticket(&self, ticket: Handle<Ticket>) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.tickets.resolve(ticket)?;
        let op = entry.op;
        if !entry.status.is_terminal() {
            match (entry.status, entry.remote_id.clone()) {
                (TicketStatus::Creating | TicketStatus::Joining, _) => {
                    state.orphaned.insert(op);
                }
                (_, Some(ticket_id)) => {
                    self.service.submit(MatchmakingRequest::Cancel { op, ticket_id });
                }
                (_, None) => {}
            }
        }
        state.by_op.remove(&op);
        state.tickets.mark_pending_destroy(ticket)?;
        state.tickets.retire_if_unreferenced(ticket)?;
        debug!(op = %op, "ticket destroyed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Getters
    // ------------------------------------------------------------------------

    pub fn tickets(&self) -> Vec<Handle<Ticket>> {
        let state = self.state.lock();
        state
            .tickets
            .iter()
            .filter(|(handle, _)| state.tickets.is_pending_destroy(*handle) == Ok(false))
            .map(|(handle, _)| handle)
            .collect()
    }

    pub fn ticket_status(&self, ticket: Handle<Ticket>) -> Result<TicketStatus> {
        Ok(self.state.lock().tickets.resolve(ticket)?.status)
    }

    /// Service-assigned id other members use to join; known once accepted
    pub fn ticket_id(&self, ticket: Handle<Ticket>) -> Result<Option<String>> {
        Ok(self.state.lock().tickets.resolve(ticket)?.remote_id.clone())
    }

    pub fn ticket_configuration(&self, ticket: Handle<Ticket>) -> Result<TicketConfiguration> {
        Ok(self.state.lock().tickets.resolve(ticket)?.config.clone())
    }

    pub fn ticket_server(&self, ticket: Handle<Ticket>) -> Result<Option<ServerDetails>> {
        Ok(self.state.lock().tickets.resolve(ticket)?.server.clone())
    }

    pub fn ticket_outcome(&self, ticket: Handle<Ticket>) -> Result<Option<Outcome>> {
        Ok(self.state.lock().tickets.resolve(ticket)?.outcome)
    }

    pub fn match_details(&self, ticket: Handle<Ticket>) -> Result<MatchDetails> {
        let state = self.state.lock();
        let entry = state.tickets.resolve(ticket)?;
        entry
            .match_details
            .clone()
            .ok_or_else(|| PartyError::invalid_state(entry.status.state_name(), "ticket has not matched"))
    }

    // ------------------------------------------------------------------------
    // State Change Processing
    // ------------------------------------------------------------------------

    pub fn start_processing(&self) -> Vec<MatchmakingStateChange> {
        let changes = self.queue.publish();
        if !changes.is_empty() {
            trace!(count = changes.len(), "matchmaking changes published");
        }
        changes
    }

    pub fn finish_processing(&self, changes: Vec<MatchmakingStateChange>) -> Result<()> {
        let mut state = self.state.lock();
        let mut first_error = None;
        for change in changes {
            let release = match self.queue.finish(change.token()) {
                Ok(release) => release,
                Err(err) => {
                    warn!(token = %change.token(), "matchmaking change finished twice or unknown");
                    first_error.get_or_insert(err);
                    continue;
                }
            };
            for raw in release.handles {
                let Some(handle) = raw.typed::<Ticket>() else {
                    continue;
                };
                if let Ok(Some(retired)) = state.tickets.release(handle) {
                    trace!(op = %retired.op, "ticket retired");
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ------------------------------------------------------------------------
    // Work
    // ------------------------------------------------------------------------

    /// Drain service events, then run deadlines and status polls
    pub fn do_work(&self) {
        let now = self.clock.now();
        let events = self.service.poll_events();
        let mut state = self.state.lock();
        for event in events {
            self.dispatch(&mut state, event, now);
        }
        self.service_timers(&mut state, now);
    }

    /// Cancel every live ticket and drop outstanding changes
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let live: Vec<_> = state
            .tickets
            .iter()
            .filter(|(_, ticket)| !ticket.status.is_terminal())
            .filter_map(|(_, ticket)| ticket.remote_id.clone().map(|id| (ticket.op, id)))
            .collect();
        for (op, ticket_id) in live {
            self.service.submit(MatchmakingRequest::Cancel { op, ticket_id });
        }
        state.by_op.clear();
        let dropped = self.queue.drain_all().len();
        info!(dropped, "matchmaking cleaned up");
    }

    fn dispatch(&self, state: &mut MatchmakingState, event: MatchmakingEvent, now: Timestamp) {
        let op = event.operation();
        if let MatchmakingEvent::TicketCreated {
            outcome, ticket_id, ..
        } = &event
        {
            if state.orphaned.remove(&op) {
                if let (true, Some(ticket_id)) = (outcome.is_success(), ticket_id.clone()) {
                    self.service.submit(MatchmakingRequest::Cancel { op, ticket_id });
                }
                return;
            }
        }
        let Some(handle) = state.by_op.get(&op).copied() else {
            trace!(op = %op, "event for an unknown ticket ignored");
            return;
        };
        match event {
            MatchmakingEvent::TicketCreated {
                outcome,
                ticket_id,
                waiting_for_players,
                ..
            } => self.ticket_created(state, handle, outcome, ticket_id, waiting_for_players, now),
            MatchmakingEvent::StatusReported { status, .. } => self.status_reported(state, handle, status),
            MatchmakingEvent::CancelCompleted { canceled, .. } => {
                let terminal = state.tickets.resolve(handle).map_or(true, |t| t.status.is_terminal());
                if canceled && !terminal {
                    self.complete(
                        state,
                        handle,
                        TicketEvent::Canceled,
                        Outcome::failure(StateChangeResult::CanceledByTitle),
                    );
                } else {
                    debug!(op = %op, "cancel lost the race with completion");
                }
            }
        }
    }

    fn ticket_created(
        &self,
        state: &mut MatchmakingState,
        handle: Handle<Ticket>,
        outcome: Outcome,
        ticket_id: Option<String>,
        waiting_for_players: bool,
        now: Timestamp,
    ) {
        let poll = now + self.poll_interval();
        let Ok(ticket) = state.tickets.resolve_mut(handle) else {
            return;
        };
        if !matches!(ticket.status, TicketStatus::Creating | TicketStatus::Joining) {
            // Timed out before the service answered.
            if let (true, Some(ticket_id)) = (outcome.is_success(), ticket_id) {
                let op = ticket.op;
                self.service.submit(MatchmakingRequest::Cancel { op, ticket_id });
            }
            return;
        }
        if !outcome.is_success() {
            self.complete(state, handle, TicketEvent::Failed, outcome);
            return;
        }
        let Some(ticket_id) = ticket_id.or_else(|| ticket.remote_id.clone()) else {
            self.complete(
                state,
                handle,
                TicketEvent::Failed,
                Outcome::failure(StateChangeResult::PartyServiceError),
            );
            return;
        };
        let waiting_for_players = waiting_for_players && !ticket.is_backfill();
        ticket.remote_id = Some(ticket_id.clone());
        ticket.next_poll = Some(poll);
        let cancel = ticket.cancel_requested.then_some((ticket.op, ticket_id));
        self.advance(state, handle, TicketEvent::Accepted { waiting_for_players });
        if let Some((op, ticket_id)) = cancel {
            self.service.submit(MatchmakingRequest::Cancel { op, ticket_id });
        }
    }

    fn status_reported(&self, state: &mut MatchmakingState, handle: Handle<Ticket>, status: ServiceTicketStatus) {
        let Ok(ticket) = state.tickets.resolve(handle) else {
            return;
        };
        let current = ticket.status;
        if current.is_terminal() || matches!(current, TicketStatus::Creating | TicketStatus::Joining) {
            return;
        }
        match status {
            ServiceTicketStatus::WaitingForPlayers => {}
            ServiceTicketStatus::WaitingForMatch => {
                if current == TicketStatus::WaitingForPlayers {
                    self.advance(state, handle, TicketEvent::AllPlayersJoined);
                }
            }
            ServiceTicketStatus::Matched(details) => {
                if current == TicketStatus::WaitingForPlayers {
                    self.advance(state, handle, TicketEvent::AllPlayersJoined);
                }
                if let Ok(ticket) = state.tickets.resolve_mut(handle) {
                    ticket.match_details = Some(details);
                }
                self.complete(state, handle, TicketEvent::MatchFound, Outcome::success());
            }
            ServiceTicketStatus::Canceled => {
                self.complete(
                    state,
                    handle,
                    TicketEvent::Canceled,
                    Outcome::failure(StateChangeResult::CanceledByTitle),
                );
            }
            ServiceTicketStatus::Failed(outcome) => {
                self.complete(state, handle, TicketEvent::Failed, outcome);
            }
        }
    }

    fn service_timers(&self, state: &mut MatchmakingState, now: Timestamp) {
        let interval = self.poll_interval();
        let mut expired = Vec::new();
        let mut polls = Vec::new();
        for (handle, ticket) in state.tickets.iter_mut() {
            if ticket.status.is_terminal() || !state.by_op.contains_key(&ticket.op) {
                continue;
            }
            if ticket.deadline.has_passed(now) {
                expired.push(handle);
                continue;
            }
            if let (Some(next), Some(ticket_id)) = (ticket.next_poll, &ticket.remote_id) {
                if next.has_passed(now) {
                    ticket.next_poll = Some(now + interval);
                    polls.push(MatchmakingRequest::GetStatus {
                        op: ticket.op,
                        ticket_id: ticket_id.clone(),
                    });
                }
            }
        }
        for request in polls {
            self.service.submit(request);
        }
        for handle in expired {
            let cancel = state.tickets.resolve(handle).ok().and_then(|ticket| {
                let accepted = !matches!(ticket.status, TicketStatus::Creating | TicketStatus::Joining);
                match (accepted, &ticket.remote_id) {
                    (true, Some(ticket_id)) => Some((ticket.op, ticket_id.clone())),
                    _ => None,
                }
            });
            info!(ticket = %handle.to_bits(), "ticket timed out");
            self.complete(
                state,
                handle,
                TicketEvent::Failed,
                Outcome::failure(StateChangeResult::MatchmakingTimeout),
            );
            if let Some((op, ticket_id)) = cancel {
                self.service.submit(MatchmakingRequest::Cancel { op, ticket_id });
            }
        }
    }

    /// Apply a non-terminal transition and report it
    fn advance(&self, state: &mut MatchmakingState, handle: Handle<Ticket>, event: TicketEvent) -> bool {
        let Ok(ticket) = state.tickets.resolve_mut(handle) else {
            return false;
        };
        match ticket.status.transition(event) {
            Ok(status) => {
                debug!(op = %ticket.op, from = ticket.status.state_name(), to = status.state_name(), "ticket transition");
                ticket.status = status;
                self.emit(state, MatchmakingChangeKind::TicketStatusChanged { ticket: handle, status });
                true
            }
            Err(err) => {
                warn!(op = %ticket.op, error = %err, "ticket event rejected");
                false
            }
        }
    }

    fn complete(&self, state: &mut MatchmakingState, handle: Handle<Ticket>, event: TicketEvent, outcome: Outcome) {
        if !self.advance(state, handle, event) {
            return;
        }
        if let Ok(ticket) = state.tickets.resolve_mut(handle) {
            ticket.outcome = Some(outcome);
            ticket.next_poll = None;
        }
        self.emit(state, MatchmakingChangeKind::TicketCompleted { ticket: handle, outcome });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partyline_core::Timestamp;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct ScriptedService {
        requests: Mutex<Vec<MatchmakingRequest>>,
        events: Mutex<Vec<MatchmakingEvent>>,
    }

    impl ScriptedService {
        fn push(&self, event: MatchmakingEvent) {
            self.events.lock().push(event);
        }

        fn count(&self, name: &str) -> usize {
            self.requests.lock().iter().filter(|r| r.name() == name).count()
        }

        fn last_op(&self) -> OperationId {
            self.requests.lock().last().map(MatchmakingRequest::operation).unwrap()
        }
    }

    impl MatchmakingService for ScriptedService {
        fn submit(&self, request: MatchmakingRequest) {
            self.requests.lock().push(request);
        }

        fn poll_events(&self) -> Vec<MatchmakingEvent> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    #[derive(Default)]
    struct StepClock(AtomicU64);

    impl StepClock {
        fn advance(&self, millis: u64) {
            self.0.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl TimeSource for StepClock {
        fn now(&self) -> Timestamp {
            Timestamp::new(self.0.load(Ordering::SeqCst))
        }
    }

    fn setup() -> (Arc<ScriptedService>, Arc<StepClock>, MatchmakingManager) {
        let service = Arc::new(ScriptedService::default());
        let clock = Arc::new(StepClock::default());
        let manager = MatchmakingManager::new(service.clone(), MatchmakingConfig::default())
            .with_time_source(clock.clone());
        (service, clock, manager)
    }

    fn config(members: &[&str]) -> TicketConfiguration {
        TicketConfiguration {
            queue_name: "ranked".into(),
            members_to_match_with: members.iter().map(|m| EntityId::new(*m).unwrap()).collect(),
            timeout_secs: Some(60),
            attributes: None,
        }
    }

    fn drain(manager: &MatchmakingManager) -> Vec<MatchmakingChangeKind> {
        let changes = manager.start_processing();
        let kinds = changes.iter().map(|c| c.payload().clone()).collect();
        manager.finish_processing(changes).unwrap();
        kinds
    }

    fn accepted(op: OperationId, waiting: bool) -> MatchmakingEvent {
        MatchmakingEvent::TicketCreated {
            op,
            outcome: Outcome::success(),
            ticket_id: Some("remote-1".into()),
            waiting_for_players: waiting,
        }
    }

    #[test]
    fn test_ticket_waits_for_named_members() {
        let (service, _clock, manager) = setup();
        let alice = EntityId::new("alice").unwrap();
        let ticket = manager.create_ticket(alice, config(&["bob"])).unwrap();
        service.push(accepted(service.last_op(), true));
        manager.do_work();
        assert_eq!(manager.ticket_status(ticket).unwrap(), TicketStatus::WaitingForPlayers);
        assert_eq!(manager.ticket_id(ticket).unwrap().as_deref(), Some("remote-1"));

        let op = service.last_op();
        service.push(MatchmakingEvent::StatusReported {
            op,
            status: ServiceTicketStatus::WaitingForMatch,
        });
        manager.do_work();
        assert_eq!(manager.ticket_status(ticket).unwrap(), TicketStatus::WaitingForMatch);
        assert_eq!(drain(&manager).len(), 2);
    }

    #[test]
    fn test_cancel_success_completes_with_canceled_by_title() {
        let (service, _clock, manager) = setup();
        let ticket = manager
            .create_ticket(EntityId::new("alice").unwrap(), config(&[]))
            .unwrap();
        let op = service.last_op();
        manager.cancel_ticket(ticket).unwrap();
        assert_eq!(service.count("Cancel"), 0);

        service.push(accepted(op, false));
        manager.do_work();
        assert_eq!(service.count("Cancel"), 1);

        service.push(MatchmakingEvent::CancelCompleted { op, canceled: true });
        manager.do_work();
        let changes = drain(&manager);
        assert!(changes.contains(&MatchmakingChangeKind::TicketCompleted {
            ticket,
            outcome: Outcome::failure(StateChangeResult::CanceledByTitle),
        }));
        assert!(manager.cancel_ticket(ticket).is_err());
    }

    #[test]
    fn test_cancel_losing_race_keeps_natural_completion() {
        let (service, _clock, manager) = setup();
        let ticket = manager
            .create_ticket(EntityId::new("alice").unwrap(), config(&[]))
            .unwrap();
        let op = service.last_op();
        service.push(accepted(op, false));
        manager.do_work();
        manager.cancel_ticket(ticket).unwrap();

        let details = MatchDetails {
            match_id: "m-1".into(),
            members: Vec::new(),
            region_preferences: vec!["westus".into()],
            lobby_arrangement: None,
            network_descriptor: None,
        };
        service.push(MatchmakingEvent::StatusReported {
            op,
            status: ServiceTicketStatus::Matched(details.clone()),
        });
        service.push(MatchmakingEvent::CancelCompleted { op, canceled: false });
        manager.do_work();
        assert_eq!(manager.ticket_status(ticket).unwrap(), TicketStatus::Matched);
        assert_eq!(manager.match_details(ticket).unwrap(), details);
        assert_eq!(manager.ticket_outcome(ticket).unwrap(), Some(Outcome::success()));
    }

    #[test]
    fn test_deadline_fails_ticket_with_timeout() {
        let (service, clock, manager) = setup();
        let ticket = manager
            .create_ticket(EntityId::new("alice").unwrap(), config(&[]))
            .unwrap();
        service.push(accepted(service.last_op(), false));
        manager.do_work();

        clock.advance(10_000);
        manager.do_work();
        assert_eq!(service.count("GetStatus"), 1);

        clock.advance(60_000);
        manager.do_work();
        assert_eq!(manager.ticket_status(ticket).unwrap(), TicketStatus::Failed);
        assert_eq!(
            manager.ticket_outcome(ticket).unwrap().map(|o| o.result),
            Some(StateChangeResult::MatchmakingTimeout)
        );
        assert_eq!(service.count("Cancel"), 1);
    }

    #[test]
    fn test_destroy_live_ticket_cancels_once() {
        let (service, _clock, manager) = setup();
        let ticket = manager
            .create_ticket(EntityId::new("alice").unwrap(), config(&[]))
            .unwrap();
        service.push(accepted(service.last_op(), false));
        manager.do_work();
        let changes = manager.start_processing();

        manager.destroy_ticket(ticket).unwrap();
        assert_eq!(service.count("Cancel"), 1);
        assert!(manager.ticket_status(ticket).is_ok());
        manager.finish_processing(changes).unwrap();
        assert!(manager.ticket_status(ticket).is_err());
        assert!(manager.tickets().is_empty());
    }

    #[test]
    fn test_backfill_skips_waiting_for_players() {
        let (service, _clock, manager) = setup();
        let server = ServerDetails {
            fqdn: "game-1.example.net".into(),
            ipv4_address: "10.0.0.4".into(),
            ports: vec![7777],
            region: "westus".into(),
        };
        let ticket = manager
            .create_server_backfill_ticket(config(&["bob"]), server)
            .unwrap();
        service.push(accepted(service.last_op(), true));
        manager.do_work();
        assert_eq!(manager.ticket_status(ticket).unwrap(), TicketStatus::WaitingForMatch);
    }

    #[test]
    fn test_one_live_ticket_per_user_and_queue() {
        let (_service, _clock, manager) = setup();
        let alice = EntityId::new("alice").unwrap();
        manager.create_ticket(alice.clone(), config(&[])).unwrap();
        assert!(matches!(
            manager.create_ticket(alice.clone(), config(&[])),
            Err(PartyError::Duplicate { .. })
        ));
        assert!(manager.create_ticket(alice.clone(), config(&["alice"])).is_err());
    }
}
