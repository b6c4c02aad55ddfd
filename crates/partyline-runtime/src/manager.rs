//! Party manager: the public entry point of the library
//!
//! A [`PartyManager`] owns one local device, its entity graph and its two
//! workers. Every operation validates synchronously and returns at once;
//! network-facing work is reported later through state changes drained with
//! [`PartyManager::start_processing_state_changes`] and handed back with
//! [`PartyManager::finish_processing_state_changes`].

use std::sync::Arc;

use parking_lot::Mutex;
use partyline_core::{
    AppliedInvitation, CancelFilter, DeviceId, EndpointId, EntityId, Handle, InvitationConfiguration,
    InvitationId, ManagerConfig, MessageStats, NetworkConfiguration, NetworkDescriptor, PartyError,
    PropertyUpdate, QueuingConfiguration, RawHandle, Result, SendMessageOptions, SystemTimeSource,
    TimeSource,
};
use tracing::{debug, info};

use crate::changes::PartyStateChange;
use crate::engine::{Engine, EngineState};
use crate::entities::{ChatControl, ChatPermissions, Device, Endpoint, Invitation, LocalUser};
use crate::network::{AuditEntry, Network, NetworkState, NetworkStatistics};
use crate::options::{PartyOption, PartyOptionKind, PartyOptions};
use crate::relay::RelayTransport;
use crate::worker::{run_tick, ThreadId, WorkMode, WorkerHandle};

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builder for [`PartyManager`]
pub struct PartyManagerBuilder {
    relay: Arc<dyn RelayTransport>,
    config: ManagerConfig,
    clock: Arc<dyn TimeSource>,
    device_id: Option<DeviceId>,
    work_modes: [WorkMode; 2],
    options: PartyOptions,
}

impl PartyManagerBuilder {
    pub fn new(relay: Arc<dyn RelayTransport>) -> Self {
        Self {
            relay,
            config: ManagerConfig::default(),
            clock: Arc::new(SystemTimeSource::new()),
            device_id: None,
            work_modes: [WorkMode::Automatic; 2],
            options: PartyOptions::default(),
        }
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_time_source(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Fix the local device id; a random one is used otherwise
    pub fn with_device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn with_work_mode(mut self, thread: ThreadId, mode: WorkMode) -> Self {
        self.work_modes[thread.index()] = mode;
        self
    }

    /// Both workers driven through `do_work`
    pub fn manual(self) -> Self {
        self.with_work_mode(ThreadId::Audio, WorkMode::Manual)
            .with_work_mode(ThreadId::Networking, WorkMode::Manual)
    }

    pub fn with_option(mut self, option: PartyOption) -> Result<Self> {
        self.options.set(option)?;
        Ok(self)
    }

    pub fn build(self) -> Result<PartyManager> {
        self.config.validate()?;
        Ok(PartyManager {
            relay: self.relay,
            config: self.config,
            clock: self.clock,
            device_id: self.device_id.unwrap_or_else(DeviceId::random),
            work_modes: self.work_modes,
            options: Arc::new(Mutex::new(self.options)),
            engine: None,
            workers: Vec::new(),
        })
    }
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

pub struct PartyManager {
    relay: Arc<dyn RelayTransport>,
    config: ManagerConfig,
    clock: Arc<dyn TimeSource>,
    device_id: DeviceId,
    work_modes: [WorkMode; 2],
    options: Arc<Mutex<PartyOptions>>,
    engine: Option<Arc<Engine>>,
    workers: Vec<WorkerHandle>,
}

impl PartyManager {
    pub fn builder(relay: Arc<dyn RelayTransport>) -> PartyManagerBuilder {
        PartyManagerBuilder::new(relay)
    }

    fn engine(&self) -> Result<&Arc<Engine>> {
        self.engine.as_ref().ok_or(PartyError::NotInitialized)
    }

    fn with_state<R>(&self, op: impl FnOnce(&mut EngineState) -> Result<R>) -> Result<R> {
        let engine = self.engine()?;
        let mut state = engine.lock();
        op(&mut state)
    }

    fn read_state<R>(&self, op: impl FnOnce(&EngineState) -> Result<R>) -> Result<R> {
        let engine = self.engine()?;
        let state = engine.lock();
        op(&state)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Create the local device and start the Automatic workers
    pub fn initialize(&mut self) -> Result<()> {
        if self.engine.is_some() {
            return Err(PartyError::AlreadyInitialized);
        }
        let engine = Arc::new(Engine::new(
            self.config.clone(),
            self.relay.clone(),
            self.clock.clone(),
            self.options.clone(),
            self.device_id,
        ));
        let mut workers = Vec::new();
        for thread in ThreadId::ALL {
            if self.work_mode(thread) != WorkMode::Automatic {
                continue;
            }
            let period = match thread {
                ThreadId::Audio => self.config.workers.audio_tick(),
                ThreadId::Networking => self.config.workers.network_tick(),
            };
            workers.push(WorkerHandle::spawn(thread, engine.clone(), period)?);
        }
        self.workers = workers;
        self.engine = Some(engine);
        info!(device = %self.device_id, "party manager initialized");
        Ok(())
    }

    /// Stop the workers, leave every network and drop every handle
    pub fn cleanup(&mut self) -> Result<()> {
        let engine = self.engine.take().ok_or(PartyError::NotInitialized)?;
        for worker in &mut self.workers {
            worker.stop();
        }
        self.workers.clear();
        engine.shutdown();
        info!(device = %self.device_id, "party manager cleaned up");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    pub fn local_device_id(&self) -> DeviceId {
        self.device_id
    }

    // ------------------------------------------------------------------------
    // Work Modes and Options
    // ------------------------------------------------------------------------

    /// Only allowed before `initialize`
    pub fn set_work_mode(&mut self, thread: ThreadId, mode: WorkMode) -> Result<()> {
        if self.engine.is_some() {
            return Err(PartyError::AlreadyInitialized);
        }
        self.work_modes[thread.index()] = mode;
        Ok(())
    }

    pub fn work_mode(&self, thread: ThreadId) -> WorkMode {
        self.work_modes[thread.index()]
    }

    /// Run one tick of a Manual worker
    pub fn do_work(&self, thread: ThreadId) -> Result<()> {
        let engine = self.engine()?;
        if self.work_mode(thread) == WorkMode::Automatic {
            return Err(PartyError::AutomaticWorkMode {
                thread: thread.name().to_string(),
            });
        }
        run_tick(engine, thread);
        Ok(())
    }

    /// Takes effect at the option's next lifecycle event
    pub fn set_option(&self, option: PartyOption) -> Result<()> {
        debug!(option = ?option.kind(), "option set");
        self.options.lock().set(option)
    }

    pub fn option(&self, kind: PartyOptionKind) -> PartyOption {
        self.options.lock().get(kind)
    }

    // ------------------------------------------------------------------------
    // State Changes
    // ------------------------------------------------------------------------

    /// Publish point: everything queued since the previous call
    pub fn start_processing_state_changes(&self) -> Result<Vec<PartyStateChange>> {
        Ok(self.engine()?.start_processing())
    }

    /// Hand back changes from any earlier batch, each exactly once
    pub fn finish_processing_state_changes(&self, changes: Vec<PartyStateChange>) -> Result<()> {
        self.engine()?.finish_processing(changes)
    }

    pub fn outstanding_state_changes(&self) -> Result<usize> {
        Ok(self.engine()?.outstanding_changes())
    }

    // ------------------------------------------------------------------------
    // Local Users
    // ------------------------------------------------------------------------

    pub fn create_local_user(&self, entity: EntityId, token: impl Into<String>) -> Result<Handle<LocalUser>> {
        let token = token.into();
        self.with_state(|state| state.create_local_user(entity, token))
    }

    pub fn destroy_local_user(&self, user: Handle<LocalUser>) -> Result<()> {
        self.with_state(|state| state.destroy_local_user(user))
    }

    pub fn update_entity_token(&self, user: Handle<LocalUser>, token: impl Into<String>) -> Result<()> {
        let token = token.into();
        self.with_state(|state| state.update_entity_token(user, token))
    }

    pub fn local_users(&self) -> Result<Vec<Handle<LocalUser>>> {
        self.read_state(|state| Ok(state.local_users_snapshot()))
    }

    pub fn local_user_entity(&self, user: Handle<LocalUser>) -> Result<EntityId> {
        self.read_state(|state| state.local_user_entity(user))
    }

    // ------------------------------------------------------------------------
    // Networks
    // ------------------------------------------------------------------------

    /// Returns the provisional descriptor and the initial invitation's id
    pub fn create_new_network(
        &self,
        user: Handle<LocalUser>,
        configuration: NetworkConfiguration,
        regions: Vec<String>,
        invitation: &InvitationConfiguration,
    ) -> Result<(NetworkDescriptor, InvitationId)> {
        self.with_state(|state| state.create_new_network(user, configuration, regions, invitation))
    }

    pub fn connect_to_network(&self, descriptor: &NetworkDescriptor) -> Result<Handle<Network>> {
        self.with_state(|state| state.connect_to_network(descriptor))
    }

    pub fn leave_network(&self, network: Handle<Network>) -> Result<()> {
        self.with_state(|state| state.leave_network(network))
    }

    pub fn authenticate_local_user(
        &self,
        network: Handle<Network>,
        user: Handle<LocalUser>,
        invitation: InvitationId,
    ) -> Result<()> {
        self.with_state(|state| state.authenticate_local_user(network, user, invitation))
    }

    pub fn remove_local_user(&self, network: Handle<Network>, user: Handle<LocalUser>) -> Result<()> {
        self.with_state(|state| state.remove_local_user(network, user))
    }

    pub fn kick_device(&self, network: Handle<Network>, device: Handle<Device>) -> Result<()> {
        self.with_state(|state| state.kick_device(network, device))
    }

    pub fn kick_user(&self, network: Handle<Network>, entity: EntityId) -> Result<()> {
        self.with_state(|state| state.kick_user(network, entity))
    }

    /// Result arrives as `RegionsChanged`
    pub fn get_regions(&self) -> Result<()> {
        self.with_state(|state| {
            state.get_regions();
            Ok(())
        })
    }

    pub fn set_network_properties(&self, network: Handle<Network>, updates: Vec<PropertyUpdate>) -> Result<()> {
        self.with_state(|state| state.set_network_properties(network, updates))
    }

    pub fn set_device_properties(&self, network: Handle<Network>, updates: Vec<PropertyUpdate>) -> Result<()> {
        self.with_state(|state| state.set_device_properties(network, updates))
    }

    pub fn networks(&self) -> Result<Vec<Handle<Network>>> {
        self.read_state(|state| Ok(state.networks_snapshot()))
    }

    pub fn network_descriptor(&self, network: Handle<Network>) -> Result<NetworkDescriptor> {
        self.read_state(|state| state.network_descriptor(network))
    }

    pub fn network_configuration(&self, network: Handle<Network>) -> Result<NetworkConfiguration> {
        self.read_state(|state| state.network_configuration(network))
    }

    pub fn network_state(&self, network: Handle<Network>) -> Result<NetworkState> {
        self.read_state(|state| state.network_state(network))
    }

    pub fn network_devices(&self, network: Handle<Network>) -> Result<Vec<Handle<Device>>> {
        self.read_state(|state| state.network_devices(network))
    }

    pub fn network_endpoints(&self, network: Handle<Network>) -> Result<Vec<Handle<Endpoint>>> {
        self.read_state(|state| state.network_endpoints(network))
    }

    pub fn network_local_users(&self, network: Handle<Network>) -> Result<Vec<Handle<LocalUser>>> {
        self.read_state(|state| state.network_local_users(network))
    }

    pub fn network_invitations(&self, network: Handle<Network>) -> Result<Vec<Handle<Invitation>>> {
        self.read_state(|state| state.network_invitations(network))
    }

    pub fn network_chat_controls(&self, network: Handle<Network>) -> Result<Vec<Handle<ChatControl>>> {
        self.read_state(|state| state.network_chat_controls(network))
    }

    pub fn network_property(&self, network: Handle<Network>, key: &str) -> Result<Option<Vec<u8>>> {
        self.read_state(|state| state.network_property(network, key))
    }

    pub fn network_property_keys(&self, network: Handle<Network>) -> Result<Vec<String>> {
        self.read_state(|state| state.network_property_keys(network))
    }

    pub fn network_audit_trail(&self, network: Handle<Network>) -> Result<Vec<AuditEntry>> {
        self.read_state(|state| state.network_audit_trail(network))
    }

    pub fn network_statistics(&self, network: Handle<Network>) -> Result<NetworkStatistics> {
        self.read_state(|state| state.network_statistics(network))
    }

    // ------------------------------------------------------------------------
    // Invitations
    // ------------------------------------------------------------------------

    pub fn create_invitation(
        &self,
        network: Handle<Network>,
        user: Handle<LocalUser>,
        config: &InvitationConfiguration,
    ) -> Result<Handle<Invitation>> {
        self.with_state(|state| state.create_invitation(network, user, config))
    }

    pub fn revoke_invitation(
        &self,
        network: Handle<Network>,
        user: Handle<LocalUser>,
        invitation: Handle<Invitation>,
    ) -> Result<()> {
        self.with_state(|state| state.revoke_invitation(network, user, invitation))
    }

    pub fn invitation_configuration(&self, invitation: Handle<Invitation>) -> Result<AppliedInvitation> {
        self.read_state(|state| state.invitation_configuration(invitation))
    }

    pub fn invitation_creator(&self, invitation: Handle<Invitation>) -> Result<EntityId> {
        self.read_state(|state| state.invitation_creator(invitation))
    }

    pub fn invitation_network(&self, invitation: Handle<Invitation>) -> Result<Handle<Network>> {
        self.read_state(|state| state.invitation_network(invitation))
    }

    // ------------------------------------------------------------------------
    // Endpoints and Messages
    // ------------------------------------------------------------------------

    pub fn create_endpoint(
        &self,
        network: Handle<Network>,
        user: Option<Handle<LocalUser>>,
        properties: Vec<PropertyUpdate>,
    ) -> Result<Handle<Endpoint>> {
        self.with_state(|state| state.create_endpoint(network, user, properties))
    }

    pub fn destroy_endpoint(&self, endpoint: Handle<Endpoint>) -> Result<()> {
        self.with_state(|state| state.destroy_endpoint(endpoint))
    }

    pub fn set_endpoint_properties(&self, endpoint: Handle<Endpoint>, updates: Vec<PropertyUpdate>) -> Result<()> {
        self.with_state(|state| state.set_endpoint_properties(endpoint, updates))
    }

    /// An empty `targets` broadcasts to every other visible endpoint
    pub fn send_message(
        &self,
        endpoint: Handle<Endpoint>,
        targets: &[Handle<Endpoint>],
        options: SendMessageOptions,
        queuing: QueuingConfiguration,
        segments: &[&[u8]],
    ) -> Result<()> {
        self.with_state(|state| state.send_message(endpoint, targets, options, queuing, segments))
    }

    pub fn cancel_messages(
        &self,
        endpoint: Handle<Endpoint>,
        filter: CancelFilter,
        targets: Option<&[Handle<Endpoint>]>,
    ) -> Result<usize> {
        self.with_state(|state| state.cancel_messages(endpoint, filter, targets))
    }

    pub fn flush_messages(&self, endpoint: Handle<Endpoint>) -> Result<()> {
        self.with_state(|state| state.flush_messages(endpoint))
    }

    pub fn endpoint_statistics(
        &self,
        endpoint: Handle<Endpoint>,
        targets: &[Handle<Endpoint>],
    ) -> Result<MessageStats> {
        self.read_state(|state| state.endpoint_statistics(endpoint, targets))
    }

    pub fn endpoint_unique_id(&self, endpoint: Handle<Endpoint>) -> Result<EndpointId> {
        self.read_state(|state| state.endpoint_unique_id(endpoint))
    }

    pub fn find_endpoint_by_unique_id(&self, network: Handle<Network>, id: EndpointId) -> Result<Handle<Endpoint>> {
        self.read_state(|state| state.find_endpoint_by_unique_id(network, id))
    }

    pub fn endpoint_network(&self, endpoint: Handle<Endpoint>) -> Result<Handle<Network>> {
        self.read_state(|state| state.endpoint_network(endpoint))
    }

    pub fn endpoint_device(&self, endpoint: Handle<Endpoint>) -> Result<Handle<Device>> {
        self.read_state(|state| state.endpoint_device(endpoint))
    }

    pub fn endpoint_local_user(&self, endpoint: Handle<Endpoint>) -> Result<Option<Handle<LocalUser>>> {
        self.read_state(|state| state.endpoint_local_user(endpoint))
    }

    pub fn endpoint_entity(&self, endpoint: Handle<Endpoint>) -> Result<Option<EntityId>> {
        self.read_state(|state| state.endpoint_entity(endpoint))
    }

    pub fn endpoint_is_local(&self, endpoint: Handle<Endpoint>) -> Result<bool> {
        self.read_state(|state| state.endpoint_is_local(endpoint))
    }

    pub fn endpoint_property(&self, endpoint: Handle<Endpoint>, key: &str) -> Result<Option<Vec<u8>>> {
        self.read_state(|state| state.endpoint_property(endpoint, key))
    }

    pub fn endpoint_property_keys(&self, endpoint: Handle<Endpoint>) -> Result<Vec<String>> {
        self.read_state(|state| state.endpoint_property_keys(endpoint))
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    pub fn local_device(&self) -> Result<Handle<Device>> {
        self.read_state(|state| Ok(state.local_device_handle()))
    }

    pub fn device_id(&self, device: Handle<Device>) -> Result<DeviceId> {
        self.read_state(|state| state.device_id(device))
    }

    pub fn device_is_local(&self, device: Handle<Device>) -> Result<bool> {
        self.read_state(|state| state.device_is_local(device))
    }

    pub fn device_chat_controls(&self, device: Handle<Device>) -> Result<Vec<Handle<ChatControl>>> {
        self.read_state(|state| state.device_chat_controls(device))
    }

    pub fn device_property(&self, device: Handle<Device>, key: &str) -> Result<Option<Vec<u8>>> {
        self.read_state(|state| state.device_property(device, key))
    }

    pub fn device_property_keys(&self, device: Handle<Device>) -> Result<Vec<String>> {
        self.read_state(|state| state.device_property_keys(device))
    }

    // ------------------------------------------------------------------------
    // Chat Controls
    // ------------------------------------------------------------------------

    pub fn create_chat_control(&self, user: Handle<LocalUser>, language: Option<String>) -> Result<Handle<ChatControl>> {
        self.with_state(|state| state.create_chat_control(user, language))
    }

    pub fn destroy_chat_control(&self, chat_control: Handle<ChatControl>) -> Result<()> {
        self.with_state(|state| state.destroy_chat_control(chat_control))
    }

    pub fn connect_chat_control(&self, chat_control: Handle<ChatControl>, network: Handle<Network>) -> Result<()> {
        self.with_state(|state| state.connect_chat_control(chat_control, network))
    }

    pub fn disconnect_chat_control(&self, chat_control: Handle<ChatControl>, network: Handle<Network>) -> Result<()> {
        self.with_state(|state| state.disconnect_chat_control(chat_control, network))
    }

    pub fn set_chat_permissions(
        &self,
        chat_control: Handle<ChatControl>,
        target: Handle<ChatControl>,
        permissions: ChatPermissions,
    ) -> Result<()> {
        self.with_state(|state| state.set_chat_permissions(chat_control, target, permissions))
    }

    pub fn chat_permissions(&self, chat_control: Handle<ChatControl>, target: Handle<ChatControl>) -> Result<ChatPermissions> {
        self.read_state(|state| state.chat_permissions(chat_control, target))
    }

    pub fn set_incoming_text_muted(
        &self,
        chat_control: Handle<ChatControl>,
        target: Handle<ChatControl>,
        muted: bool,
    ) -> Result<()> {
        self.with_state(|state| state.set_incoming_text_muted(chat_control, target, muted))
    }

    pub fn is_incoming_text_muted(&self, chat_control: Handle<ChatControl>, target: Handle<ChatControl>) -> Result<bool> {
        self.read_state(|state| state.is_incoming_text_muted(chat_control, target))
    }

    /// Sent on the next audio tick
    pub fn send_text(&self, chat_control: Handle<ChatControl>, targets: &[Handle<ChatControl>], text: &str) -> Result<()> {
        self.with_state(|state| state.send_text(chat_control, targets, text))
    }

    pub fn chat_controls(&self) -> Result<Vec<Handle<ChatControl>>> {
        self.read_state(|state| Ok(state.chat_controls_snapshot()))
    }

    pub fn chat_control_entity(&self, chat_control: Handle<ChatControl>) -> Result<EntityId> {
        self.read_state(|state| state.chat_control_entity(chat_control))
    }

    pub fn chat_control_device(&self, chat_control: Handle<ChatControl>) -> Result<Handle<Device>> {
        self.read_state(|state| state.chat_control_device(chat_control))
    }

    pub fn chat_control_local_user(&self, chat_control: Handle<ChatControl>) -> Result<Option<Handle<LocalUser>>> {
        self.read_state(|state| state.chat_control_local_user(chat_control))
    }

    pub fn chat_control_is_local(&self, chat_control: Handle<ChatControl>) -> Result<bool> {
        self.read_state(|state| state.chat_control_is_local(chat_control))
    }

    pub fn chat_control_language(&self, chat_control: Handle<ChatControl>) -> Result<Option<String>> {
        self.read_state(|state| state.chat_control_language(chat_control))
    }

    pub fn chat_control_networks(&self, chat_control: Handle<ChatControl>) -> Result<Vec<Handle<Network>>> {
        self.read_state(|state| state.chat_control_networks(chat_control))
    }

    // ------------------------------------------------------------------------
    // Custom Context
    // ------------------------------------------------------------------------

    pub fn set_custom_context(&self, handle: RawHandle, context: Option<u64>) -> Result<()> {
        self.with_state(|state| state.set_custom_context(handle, context))
    }

    pub fn custom_context(&self, handle: RawHandle) -> Result<Option<u64>> {
        self.read_state(|state| state.custom_context(handle))
    }
}

impl Drop for PartyManager {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayEvent, RelayRequest};

    #[derive(Default)]
    struct RecordingRelay {
        requests: Mutex<Vec<RelayRequest>>,
    }

    impl RelayTransport for RecordingRelay {
        fn submit(&self, request: RelayRequest) {
            self.requests.lock().push(request);
        }

        fn poll_events(&self) -> Vec<RelayEvent> {
            Vec::new()
        }
    }

    fn manual_manager() -> PartyManager {
        PartyManager::builder(Arc::new(RecordingRelay::default()))
            .with_config(ManagerConfig::testing())
            .manual()
            .build()
            .unwrap()
    }

    #[test]
    fn test_operations_require_initialize() {
        let manager = manual_manager();
        let err = manager
            .create_local_user(EntityId::new("alice").unwrap(), "token")
            .unwrap_err();
        assert!(matches!(err, PartyError::NotInitialized));
        assert!(matches!(
            manager.start_processing_state_changes(),
            Err(PartyError::NotInitialized)
        ));
    }

    #[test]
    fn test_work_mode_fixed_after_initialize() {
        let mut manager = manual_manager();
        manager.initialize().unwrap();
        assert!(matches!(
            manager.set_work_mode(ThreadId::Audio, WorkMode::Automatic),
            Err(PartyError::AlreadyInitialized)
        ));
        assert!(matches!(manager.initialize(), Err(PartyError::AlreadyInitialized)));
        manager.do_work(ThreadId::Audio).unwrap();
        manager.do_work(ThreadId::Networking).unwrap();
        manager.cleanup().unwrap();
        assert!(!manager.is_initialized());
    }

    #[test]
    fn test_do_work_rejected_in_automatic_mode() {
        let mut manager = PartyManager::builder(Arc::new(RecordingRelay::default()))
            .with_config(ManagerConfig::testing())
            .with_work_mode(ThreadId::Networking, WorkMode::Manual)
            .build()
            .unwrap();
        manager.initialize().unwrap();
        assert!(matches!(
            manager.do_work(ThreadId::Audio),
            Err(PartyError::AutomaticWorkMode { .. })
        ));
        manager.do_work(ThreadId::Networking).unwrap();
        manager.cleanup().unwrap();
    }

    #[test]
    fn test_duplicate_local_user_rejected() {
        let mut manager = manual_manager();
        manager.initialize().unwrap();
        let alice = EntityId::new("alice").unwrap();
        let user = manager.create_local_user(alice.clone(), "t1").unwrap();
        assert!(manager.create_local_user(alice.clone(), "t2").is_err());
        manager.update_entity_token(user, "t3").unwrap();
        assert_eq!(manager.local_user_entity(user).unwrap(), alice);
        assert_eq!(manager.local_users().unwrap(), vec![user]);
    }

    #[test]
    fn test_options_apply_at_next_lifecycle_event() {
        let manager = manual_manager();
        manager
            .set_option(PartyOption::LocalUdpSocketBindAddress(Some("127.0.0.1:4000".into())))
            .unwrap();
        assert_eq!(
            manager.option(PartyOptionKind::LocalUdpSocketBindAddress),
            PartyOption::LocalUdpSocketBindAddress(Some("127.0.0.1:4000".into()))
        );
    }
}
