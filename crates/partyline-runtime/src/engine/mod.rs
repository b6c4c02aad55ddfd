//! Party engine
//!
//! All entity-graph mutation happens on [`EngineState`] under a single
//! mutex. Mutations queue state changes; [`Engine::start_processing`] is the
//! publish point that hands the queued changes out and applies their
//! visibility effects to the view getters read. Finishing a change releases
//! the handle references it holds and runs its release actions.
//!
//! The operations themselves are split by concern: `session` (networks,
//! users, invitations, properties), `messaging` (endpoints and the packet
//! pipeline), `chat` (chat controls), `events` (relay event dispatch),
//! `publish` (visibility and release) and `queries` (getters).

mod chat;
mod events;
mod messaging;
mod publish;
mod queries;
mod session;

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use partyline_core::{
    ChatControlId, DeviceId, EntityId, Handle, HandleError, HandleKind, HandleTable,
    InvitationId, ManagerConfig, NetworkDescriptor, NetworkId, OperationId, PartyError,
    RawHandle, Result, StateChangePayload, TimeSource, Timestamp,
};
use tracing::{debug, trace, warn};

use crate::changes::{PartyQueue, PartyStateChange, ReleaseAction, StateChangeKind};
use crate::entities::{ChatControl, Device, Endpoint, Invitation, LocalUser};
use crate::network::Network;
use crate::options::PartyOptions;
use crate::relay::{RelayRequest, RelayTransport};

// ----------------------------------------------------------------------------
// Handle Tables
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub users: HandleTable<LocalUser>,
    pub devices: HandleTable<Device>,
    pub networks: HandleTable<Network>,
    pub endpoints: HandleTable<Endpoint>,
    pub invitations: HandleTable<Invitation>,
    pub chat_controls: HandleTable<ChatControl>,
}

/// An entity whose last reference went away
#[derive(Debug)]
pub(crate) enum Retired {
    Device(Handle<Device>, DeviceId),
    ChatControl(Handle<ChatControl>, ChatControlId),
    Network(Handle<Network>),
    Other,
}

fn typed<T: partyline_core::Entity>(raw: RawHandle) -> std::result::Result<Handle<T>, HandleError> {
    raw.typed::<T>().ok_or(HandleError::Foreign {
        kind: raw.kind().name(),
    })
}

impl Tables {
    pub fn add_ref(&mut self, raw: RawHandle) -> std::result::Result<(), HandleError> {
        match raw.kind() {
            HandleKind::LocalUser => self.users.add_ref(typed(raw)?),
            HandleKind::Device => self.devices.add_ref(typed(raw)?),
            HandleKind::Network => self.networks.add_ref(typed(raw)?),
            HandleKind::Endpoint => self.endpoints.add_ref(typed(raw)?),
            HandleKind::Invitation => self.invitations.add_ref(typed(raw)?),
            HandleKind::ChatControl => self.chat_controls.add_ref(typed(raw)?),
            HandleKind::Ticket => Ok(()),
        }
    }

    /// Drop one reference; returns what was retired, if anything
    pub fn release(&mut self, raw: RawHandle) -> std::result::Result<Option<Retired>, HandleError> {
        Ok(match raw.kind() {
            HandleKind::LocalUser => self.users.release(typed(raw)?)?.map(|_| Retired::Other),
            HandleKind::Device => {
                let handle = typed(raw)?;
                self.devices
                    .release(handle)?
                    .map(|device| Retired::Device(handle, device.id))
            }
            HandleKind::Network => {
                let handle = typed(raw)?;
                self.networks.release(handle)?.map(|_| Retired::Network(handle))
            }
            HandleKind::Endpoint => self.endpoints.release(typed(raw)?)?.map(|_| Retired::Other),
            HandleKind::Invitation => {
                self.invitations.release(typed(raw)?)?.map(|_| Retired::Other)
            }
            HandleKind::ChatControl => {
                let handle = typed(raw)?;
                self.chat_controls
                    .release(handle)?
                    .map(|control| Retired::ChatControl(handle, control.id))
            }
            HandleKind::Ticket => None,
        })
    }

    /// Mark for destruction, retiring at once if nothing references it
    pub fn destroy(&mut self, raw: RawHandle) -> std::result::Result<Option<Retired>, HandleError> {
        match raw.kind() {
            HandleKind::LocalUser => {
                let handle = typed(raw)?;
                self.users.mark_pending_destroy(handle)?;
                Ok(self.users.retire_if_unreferenced(handle)?.map(|_| Retired::Other))
            }
            HandleKind::Device => {
                let handle = typed(raw)?;
                self.devices.mark_pending_destroy(handle)?;
                Ok(self
                    .devices
                    .retire_if_unreferenced(handle)?
                    .map(|device| Retired::Device(handle, device.id)))
            }
            HandleKind::Network => {
                let handle = typed(raw)?;
                self.networks.mark_pending_destroy(handle)?;
                Ok(self
                    .networks
                    .retire_if_unreferenced(handle)?
                    .map(|_| Retired::Network(handle)))
            }
            HandleKind::Endpoint => {
                let handle = typed(raw)?;
                self.endpoints.mark_pending_destroy(handle)?;
                Ok(self.endpoints.retire_if_unreferenced(handle)?.map(|_| Retired::Other))
            }
            HandleKind::Invitation => {
                let handle = typed(raw)?;
                self.invitations.mark_pending_destroy(handle)?;
                Ok(self.invitations.retire_if_unreferenced(handle)?.map(|_| Retired::Other))
            }
            HandleKind::ChatControl => {
                let handle = typed(raw)?;
                self.chat_controls.mark_pending_destroy(handle)?;
                Ok(self
                    .chat_controls
                    .retire_if_unreferenced(handle)?
                    .map(|control| Retired::ChatControl(handle, control.id)))
            }
            HandleKind::Ticket => Ok(None),
        }
    }

    pub fn set_custom_context(
        &mut self,
        raw: RawHandle,
        context: Option<u64>,
    ) -> std::result::Result<(), HandleError> {
        match raw.kind() {
            HandleKind::LocalUser => self.users.set_custom_context(typed(raw)?, context),
            HandleKind::Device => self.devices.set_custom_context(typed(raw)?, context),
            HandleKind::Network => self.networks.set_custom_context(typed(raw)?, context),
            HandleKind::Endpoint => self.endpoints.set_custom_context(typed(raw)?, context),
            HandleKind::Invitation => self.invitations.set_custom_context(typed(raw)?, context),
            HandleKind::ChatControl => self.chat_controls.set_custom_context(typed(raw)?, context),
            HandleKind::Ticket => Err(HandleError::Foreign {
                kind: raw.kind().name(),
            }),
        }
    }

    pub fn custom_context(&self, raw: RawHandle) -> std::result::Result<Option<u64>, HandleError> {
        match raw.kind() {
            HandleKind::LocalUser => self.users.custom_context(typed(raw)?),
            HandleKind::Device => self.devices.custom_context(typed(raw)?),
            HandleKind::Network => self.networks.custom_context(typed(raw)?),
            HandleKind::Endpoint => self.endpoints.custom_context(typed(raw)?),
            HandleKind::Invitation => self.invitations.custom_context(typed(raw)?),
            HandleKind::ChatControl => self.chat_controls.custom_context(typed(raw)?),
            HandleKind::Ticket => Err(HandleError::Foreign {
                kind: raw.kind().name(),
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Pending Operations
// ----------------------------------------------------------------------------

/// An asynchronous request waiting for its relay completion
#[derive(Debug, Clone)]
pub(crate) enum PendingOp {
    Regions,
    CreateNetwork {
        user: Handle<LocalUser>,
        descriptor: NetworkDescriptor,
        invitation: InvitationId,
    },
    Connect {
        network: Handle<Network>,
    },
    Authenticate {
        network: Handle<Network>,
        user: Handle<LocalUser>,
        invitation: InvitationId,
    },
    RemoveUser {
        network: Handle<Network>,
        user: Handle<LocalUser>,
    },
    CreateEndpoint {
        network: Handle<Network>,
        endpoint: Handle<Endpoint>,
    },
    DestroyEndpoint {
        network: Handle<Network>,
        endpoint: Handle<Endpoint>,
    },
    CreateInvitation {
        network: Handle<Network>,
        user: Handle<LocalUser>,
        invitation: Handle<Invitation>,
    },
    RevokeInvitation {
        network: Handle<Network>,
        user: Handle<LocalUser>,
        invitation: Handle<Invitation>,
    },
    KickDevice {
        network: Handle<Network>,
        device: Handle<Device>,
    },
    KickUser {
        network: Handle<Network>,
        entity: EntityId,
    },
    ConnectChatControl {
        network: Handle<Network>,
        chat_control: Handle<ChatControl>,
    },
    DisconnectChatControl {
        network: Handle<Network>,
        chat_control: Handle<ChatControl>,
    },
    Leave {
        network: Handle<Network>,
    },
}

impl PendingOp {
    pub fn network(&self) -> Option<Handle<Network>> {
        match self {
            PendingOp::Regions | PendingOp::CreateNetwork { .. } => None,
            PendingOp::Connect { network }
            | PendingOp::Authenticate { network, .. }
            | PendingOp::RemoveUser { network, .. }
            | PendingOp::CreateEndpoint { network, .. }
            | PendingOp::DestroyEndpoint { network, .. }
            | PendingOp::CreateInvitation { network, .. }
            | PendingOp::RevokeInvitation { network, .. }
            | PendingOp::KickDevice { network, .. }
            | PendingOp::KickUser { network, .. }
            | PendingOp::ConnectChatControl { network, .. }
            | PendingOp::DisconnectChatControl { network, .. }
            | PendingOp::Leave { network } => Some(*network),
        }
    }
}

// ----------------------------------------------------------------------------
// Engine State
// ----------------------------------------------------------------------------

pub(crate) struct EngineState {
    pub config: ManagerConfig,
    pub relay: Arc<dyn RelayTransport>,
    pub clock: Arc<dyn TimeSource>,
    pub options: Arc<Mutex<PartyOptions>>,
    pub queue: Arc<PartyQueue>,
    pub tables: Tables,
    pub local_device: Handle<Device>,
    pub local_device_id: DeviceId,
    pub bind_address: Option<String>,
    pub device_index: HashMap<DeviceId, Handle<Device>>,
    pub chat_index: HashMap<ChatControlId, Handle<ChatControl>>,
    /// Networks that are not destroyed
    pub networks: Vec<Handle<Network>>,
    /// Networks visible to getters
    pub view_networks: Vec<Handle<Network>>,
    pub view_chat_controls: Vec<Handle<ChatControl>>,
    /// Ordered by id so matching and cancellation follow submission order
    pub pending_ops: BTreeMap<OperationId, PendingOp>,
    next_op: u64,
}

impl EngineState {
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Queue a state change, taking a reference on every handle it names
    pub fn emit(&mut self, change: StateChangeKind) {
        self.emit_with(change, None);
    }

    pub fn emit_with(&mut self, change: StateChangeKind, action: Option<ReleaseAction>) {
        for raw in change.handles() {
            if let Err(err) = self.tables.add_ref(raw) {
                warn!(kind = change.kind_name(), error = %err, "state change names a dead handle");
            }
        }
        debug!(kind = change.kind_name(), "state change");
        self.queue.enqueue(change, action);
    }

    /// Mark an entity for destruction once every change naming it is finished
    pub fn destroy_handle(&mut self, raw: RawHandle) {
        match self.tables.destroy(raw) {
            Ok(Some(retired)) => self.on_retired(retired),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "destroying a dead handle"),
        }
    }

    pub fn on_retired(&mut self, retired: Retired) {
        match retired {
            Retired::Device(handle, id) => {
                if self.device_index.get(&id) == Some(&handle) {
                    self.device_index.remove(&id);
                }
            }
            Retired::ChatControl(handle, id) => {
                if self.chat_index.get(&id) == Some(&handle) {
                    self.chat_index.remove(&id);
                }
                self.view_chat_controls.retain(|c| *c != handle);
            }
            Retired::Network(handle) => {
                self.networks.retain(|n| *n != handle);
                self.view_networks.retain(|n| *n != handle);
            }
            Retired::Other => {}
        }
    }

    pub fn next_operation(&mut self) -> OperationId {
        self.next_op += 1;
        OperationId::new(self.next_op)
    }

    /// Submit a request whose completion resolves `op`
    pub fn submit_op<F>(&mut self, op: PendingOp, build: F) -> OperationId
    where
        F: FnOnce(OperationId) -> RelayRequest,
    {
        let id = self.next_operation();
        self.pending_ops.insert(id, op);
        let request = build(id);
        trace!(op = %id, request = request.name(), "relay request");
        self.relay.submit(request);
        id
    }

    /// Submit a request nobody waits on
    pub fn submit_detached<F>(&mut self, build: F)
    where
        F: FnOnce(OperationId) -> RelayRequest,
    {
        let id = self.next_operation();
        let request = build(id);
        trace!(op = %id, request = request.name(), "detached relay request");
        self.relay.submit(request);
    }

    /// Remove the oldest pending operation matching `pred`
    pub fn take_op<P>(&mut self, pred: P) -> Option<PendingOp>
    where
        P: Fn(&PendingOp) -> bool,
    {
        let id = self
            .pending_ops
            .iter()
            .find(|(_, op)| pred(op))
            .map(|(id, _)| *id)?;
        self.pending_ops.remove(&id)
    }

    pub fn network_by_id(&self, id: NetworkId) -> Option<Handle<Network>> {
        self.networks.iter().copied().find(|handle| {
            self.tables
                .networks
                .resolve(*handle)
                .is_ok_and(|network| network.id == id && network.is_live())
        })
    }

    pub fn live_user(&self, user: Handle<LocalUser>) -> Result<&LocalUser> {
        let local = self.tables.users.resolve(user)?;
        if local.destroying {
            return Err(PartyError::invalid_state(
                "Destroying",
                "local user is being destroyed",
            ));
        }
        Ok(local)
    }

    pub fn live_network(&self, network: Handle<Network>) -> Result<&Network> {
        let net = self.tables.networks.resolve(network)?;
        if !net.state.accepts_operations() {
            return Err(PartyError::invalid_state(
                net.state.state_name(),
                "network is leaving or destroyed",
            ));
        }
        Ok(net)
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// Shared between the manager and its workers
pub(crate) struct Engine {
    state: Mutex<EngineState>,
    queue: Arc<PartyQueue>,
}

impl Engine {
    pub fn new(
        config: ManagerConfig,
        relay: Arc<dyn RelayTransport>,
        clock: Arc<dyn TimeSource>,
        options: Arc<Mutex<PartyOptions>>,
        device_id: DeviceId,
    ) -> Self {
        let queue = Arc::new(PartyQueue::new());
        let mut tables = Tables::default();
        let local_device = tables.devices.allocate(Device::new(device_id, true));
        let mut device_index = HashMap::new();
        device_index.insert(device_id, local_device);
        let bind_address = options.lock().bind_address.clone();

        let state = EngineState {
            config,
            relay,
            clock,
            options,
            queue: queue.clone(),
            tables,
            local_device,
            local_device_id: device_id,
            bind_address,
            device_index,
            chat_index: HashMap::new(),
            networks: Vec::new(),
            view_networks: Vec::new(),
            view_chat_controls: Vec::new(),
            pending_ops: BTreeMap::new(),
            next_op: 0,
        };
        Self {
            state: Mutex::new(state),
            queue,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock()
    }

    /// Publish point: hand out queued changes and make them visible
    pub fn start_processing(&self) -> Vec<PartyStateChange> {
        let mut state = self.state.lock();
        let changes = self.queue.publish();
        for change in &changes {
            state.apply_published(change.payload());
        }
        state.sync_view_states();
        if !changes.is_empty() {
            trace!(count = changes.len(), epoch = self.queue.publish_epoch(), "published");
        }
        changes
    }

    pub fn finish_processing(&self, changes: Vec<PartyStateChange>) -> Result<()> {
        let mut state = self.state.lock();
        let mut first_error = None;
        for change in changes {
            match self.queue.finish(change.token()) {
                Ok(release) => state.release(release),
                Err(err) => {
                    warn!(token = %change.token(), "state change finished twice or unknown");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn audio_tick(&self) {
        self.state.lock().audio_tick();
    }

    pub fn network_tick(&self) {
        self.state.lock().network_tick();
    }

    /// Leave every network and drop every outstanding change
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        for network in state.networks.clone() {
            let id = match state.tables.networks.resolve(network) {
                Ok(net) if net.is_live() => net.id,
                _ => continue,
            };
            state.submit_detached(|op| RelayRequest::Leave { op, network: id });
        }
        let dropped = self.queue.drain_all().len();
        debug!(dropped, "engine shut down");
    }

    pub fn outstanding_changes(&self) -> usize {
        self.queue.outstanding_len() + self.queue.pending_len()
    }
}

impl EngineState {
    pub fn audio_tick(&mut self) {
        let now = self.now();
        self.flush_chat_outboxes(now);
    }

    pub fn network_tick(&mut self) {
        let now = self.now();
        for event in self.relay.poll_events() {
            self.dispatch(event, now);
        }
        for network in self.networks.clone() {
            self.service_timers(network, now);
            self.pump_network(network, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partyline_core::SystemTimeSource;

    struct NullRelay;

    impl RelayTransport for NullRelay {
        fn submit(&self, _request: RelayRequest) {}
        fn poll_events(&self) -> Vec<crate::relay::RelayEvent> {
            Vec::new()
        }
    }

    fn engine() -> Engine {
        Engine::new(
            ManagerConfig::testing(),
            Arc::new(NullRelay),
            Arc::new(SystemTimeSource::new()),
            Arc::new(Mutex::new(PartyOptions::default())),
            DeviceId::random(),
        )
    }

    #[test]
    fn test_handles_survive_until_change_finished() {
        let engine = engine();
        let user = {
            let mut state = engine.lock();
            let user = state
                .tables
                .users
                .allocate(LocalUser::new(EntityId::new("alice").unwrap(), "t".into()));
            state.emit(StateChangeKind::DestroyLocalUserCompleted {
                outcome: partyline_core::Outcome::success(),
                local_user: user,
            });
            state.destroy_handle(user.raw());
            user
        };
        assert!(engine.lock().tables.users.contains(user));

        let changes = engine.start_processing();
        assert_eq!(changes.len(), 1);
        assert!(engine.lock().tables.users.contains(user));

        engine.finish_processing(changes).unwrap();
        assert!(!engine.lock().tables.users.contains(user));
        assert_eq!(engine.outstanding_changes(), 0);
    }

    #[test]
    fn test_take_op_removes_only_matching() {
        let engine = engine();
        let mut state = engine.lock();
        state.submit_op(PendingOp::Regions, |op| RelayRequest::QueryRegions { op });
        assert!(state
            .take_op(|op| matches!(op, PendingOp::Leave { .. }))
            .is_none());
        assert!(state
            .take_op(|op| matches!(op, PendingOp::Regions))
            .is_some());
        assert!(state.pending_ops.is_empty());
    }

    #[test]
    fn test_take_op_prefers_oldest_match() {
        let engine = engine();
        let mut state = engine.lock();
        let ids: Vec<_> = (0..16)
            .map(|_| state.submit_op(PendingOp::Regions, |op| RelayRequest::QueryRegions { op }))
            .collect();

        for (taken, id) in ids.iter().enumerate() {
            assert_eq!(state.pending_ops.keys().next(), Some(id));
            assert!(state.take_op(|op| matches!(op, PendingOp::Regions)).is_some());
            assert_eq!(state.pending_ops.len(), ids.len() - taken - 1);
            assert!(!state.pending_ops.contains_key(id));
        }
    }
}
