//! Endpoints and the per-network packet pipeline
//!
//! Outbound: the send scheduler drains fragments each network tick; frames
//! for the local device loop straight back into the receive path, the rest
//! are packetized per device and handed to the relay. Guaranteed fragments
//! are tracked until acknowledged and a device that never acknowledges
//! tears the network down.
//!
//! Inbound: acks settle tracked fragments, data frames are deduplicated,
//! reassembled, ordered per sequence space and reported once per message
//! with every local receiver it reached.

use hashbrown::HashMap;
use partyline_core::config::MAX_ENDPOINTS_PER_DEVICE;
use partyline_core::send_queue::{QueueKey, Target};
use partyline_core::sequencing::{SequenceKey, SequenceOutcome};
use partyline_core::wire::{packetize, DataFrame, Frame, Packet, StreamKind};
use partyline_core::{
    CancelFilter, ChatControlId, DeliveryMode, DeviceId, EndpointId, Handle, MessageStats,
    OrderingMode, Outcome, PartyError, PropertyUpdate, QueuingConfiguration, ReceivedMessageFlags,
    Result, SendMessageOptions, SendQueueError, SharedProperties, StateChangeResult, Timestamp,
};
use tracing::{debug, trace, warn};

use super::{EngineState, PendingOp};
use crate::changes::{EndpointDestroyedReason, NetworkDestroyedReason, ReleaseAction, StateChangeKind};
use crate::entities::{Endpoint, EndpointState, LocalUser};
use crate::network::{HeldMessage, LocalDestroy, Network, NetworkState, NetworkStatistics, RemoteDestroy};
use crate::relay::{CompletionDetail, RelayRequest};

/// Messages completed by one frame, merged so each is reported once
#[derive(Debug, Default)]
struct Inbox {
    entries: Vec<(HeldMessage, Vec<u64>)>,
}

impl Inbox {
    fn push(&mut self, message: HeldMessage, receiver: u64) {
        let existing = self.entries.iter_mut().find(|(held, _)| {
            held.source == message.source && held.message_id == message.message_id
        });
        match existing {
            Some((_, receivers)) => {
                if !receivers.contains(&receiver) {
                    receivers.push(receiver);
                }
            }
            None => self.entries.push((message, vec![receiver])),
        }
    }
}

fn endpoint_key(endpoint: Handle<Endpoint>) -> QueueKey {
    QueueKey::Endpoint(endpoint.to_bits())
}

fn accumulate(total: &mut MessageStats, stats: MessageStats) {
    total.queued_messages += stats.queued_messages;
    total.queued_bytes += stats.queued_bytes;
    total.active_messages += stats.active_messages;
    total.active_bytes += stats.active_bytes;
    total.sent_messages += stats.sent_messages;
    total.sent_bytes += stats.sent_bytes;
    total.timed_out_messages += stats.timed_out_messages;
    total.timed_out_bytes += stats.timed_out_bytes;
    total.canceled_messages += stats.canceled_messages;
    total.canceled_bytes += stats.canceled_bytes;
}

// ----------------------------------------------------------------------------
// Endpoint Lifecycle
// ----------------------------------------------------------------------------

impl EngineState {
    /// Returns a provisional handle that can queue sends right away
    pub fn create_endpoint(
        &mut self,
        network: Handle<Network>,
        user: Option<Handle<LocalUser>>,
        properties: Vec<PropertyUpdate>,
    ) -> Result<Handle<Endpoint>> {
        let entity = match user {
            Some(user) => Some(self.live_user(user)?.entity.clone()),
            None => None,
        };
        let net = self.live_network(network)?;
        if net.state != NetworkState::Authenticated {
            return Err(PartyError::invalid_state(
                net.state.state_name(),
                "endpoints need an authenticated local user",
            ));
        }
        if let Some(user) = user {
            if !net.is_authenticated(user) {
                return Err(PartyError::invalid_argument(
                    "local user is not authenticated in the network",
                ));
            }
        }
        let limit = net
            .configuration
            .as_ref()
            .map_or(MAX_ENDPOINTS_PER_DEVICE, |c| c.max_endpoints_per_device) as usize;
        let local_count = net
            .endpoints
            .iter()
            .filter(|ep| {
                self.tables
                    .endpoints
                    .resolve(**ep)
                    .is_ok_and(|e| e.local && e.is_usable())
            })
            .count();
        if local_count >= limit {
            return Err(PartyError::limit_exceeded("endpoint", limit));
        }
        let mut initial = SharedProperties::new();
        if !properties.is_empty() {
            initial.validate(&properties)?;
            initial.apply(&properties);
        }
        let id = net.id;

        let endpoint = self.tables.endpoints.allocate(Endpoint {
            network,
            device: self.local_device,
            device_id: self.local_device_id,
            local: true,
            user,
            entity: entity.clone(),
            id: None,
            published_id: None,
            state: EndpointState::Creating,
            properties: initial,
        });
        let net = self.tables.networks.resolve_mut(network)?;
        if let Err(err) = net.transport.scheduler.add_source(endpoint_key(endpoint)) {
            self.tables.endpoints.retire(endpoint)?;
            return Err(err);
        }
        net.endpoints.push(endpoint);

        self.submit_op(PendingOp::CreateEndpoint { network, endpoint }, |op| {
            RelayRequest::CreateEndpoint {
                op,
                network: id,
                entity,
                properties,
            }
        });
        Ok(endpoint)
    }

    pub(crate) fn complete_create_endpoint(
        &mut self,
        network: Handle<Network>,
        endpoint: Handle<Endpoint>,
        outcome: Outcome,
        detail: CompletionDetail,
    ) {
        let Ok(ep) = self.tables.endpoints.resolve_mut(endpoint) else {
            return;
        };
        if ep.state != EndpointState::Creating {
            return;
        }
        let user = ep.user;
        let assigned = match detail {
            CompletionDetail::EndpointCreated(id) if outcome.is_success() => Some(id),
            _ => None,
        };
        let Some(id) = assigned else {
            warn!(result = ?outcome.result, "endpoint creation failed");
            let outcome = if outcome.is_success() {
                Outcome::failure(StateChangeResult::UnknownError)
            } else {
                outcome
            };
            self.emit(StateChangeKind::CreateEndpointCompleted {
                outcome,
                network,
                local_user: user,
                endpoint,
            });
            self.destroy_endpoint_locally(endpoint, EndpointDestroyedReason::CreationFailed, outcome.result);
            return;
        };
        ep.id = Some(id);
        ep.state = EndpointState::Active;
        if let Ok(net) = self.tables.networks.resolve_mut(network) {
            net.endpoint_index.insert(id, endpoint);
            if let Err(err) = net
                .transport
                .scheduler
                .activate_source(endpoint_key(endpoint), u64::from(id.value()))
            {
                warn!(endpoint = %id, error = %err, "endpoint send queue missing");
            }
        }
        debug!(endpoint = %id, "local endpoint created");
        self.emit(StateChangeKind::CreateEndpointCompleted {
            outcome,
            network,
            local_user: user,
            endpoint,
        });
        self.emit(StateChangeKind::EndpointCreated { network, endpoint });
    }

    /// Cooperative destroy: completes when the relay confirms or the
    /// escalation deadline passes
    pub fn destroy_endpoint(&mut self, endpoint: Handle<Endpoint>) -> Result<()> {
        let ep = self.tables.endpoints.resolve(endpoint)?;
        if !ep.local {
            return Err(PartyError::invalid_argument("only local endpoints can be destroyed"));
        }
        let (network, id) = match (ep.state, ep.id) {
            (EndpointState::Active, Some(id)) => (ep.network, id),
            (state, _) => {
                return Err(PartyError::invalid_state(
                    format!("{state:?}"),
                    "endpoint is not active",
                ))
            }
        };
        let network_id = self.live_network(network)?.id;
        let deadline = self.now() + self.config.session.destroy_escalation();
        self.tables.endpoints.resolve_mut(endpoint)?.state = EndpointState::Destroying;
        self.tables
            .networks
            .resolve_mut(network)?
            .local_destroys
            .push(LocalDestroy { endpoint, deadline });
        self.submit_op(PendingOp::DestroyEndpoint { network, endpoint }, |op| {
            RelayRequest::DestroyEndpoint {
                op,
                network: network_id,
                endpoint: id,
            }
        });
        Ok(())
    }

    /// Remove an endpoint from the graph and announce `EndpointDestroyed`
    ///
    /// Requests still waiting on the endpoint are completed first: a create
    /// fails with `canceled`, a destroy succeeds.
    pub(crate) fn destroy_endpoint_locally(
        &mut self,
        endpoint: Handle<Endpoint>,
        reason: EndpointDestroyedReason,
        canceled: StateChangeResult,
    ) {
        let now = self.now();
        let window = self.config.session.endpoint_destroy_window();
        let Ok(ep) = self.tables.endpoints.resolve_mut(endpoint) else {
            return;
        };
        if ep.state == EndpointState::Destroyed {
            return;
        }
        let prior = ep.state;
        ep.state = EndpointState::Destroyed;
        let (network, local, id, user) = (ep.network, ep.local, ep.id, ep.user);

        match prior {
            EndpointState::Creating => {
                if self
                    .take_op(|op| matches!(op, PendingOp::CreateEndpoint { endpoint: e, .. } if *e == endpoint))
                    .is_some()
                {
                    self.emit(StateChangeKind::CreateEndpointCompleted {
                        outcome: Outcome::failure(canceled),
                        network,
                        local_user: user,
                        endpoint,
                    });
                }
            }
            EndpointState::Destroying => {
                self.take_op(|op| matches!(op, PendingOp::DestroyEndpoint { endpoint: e, .. } if *e == endpoint));
                self.emit(StateChangeKind::DestroyEndpointCompleted {
                    outcome: Outcome::success(),
                    network,
                    endpoint,
                });
            }
            EndpointState::Active | EndpointState::Destroyed => {}
        }

        let mut action = None;
        if let Ok(net) = self.tables.networks.resolve_mut(network) {
            net.endpoints.retain(|e| *e != endpoint);
            net.local_destroys.retain(|pending| pending.endpoint != endpoint);
            if local {
                let discarded = net.transport.scheduler.remove_source(endpoint_key(endpoint));
                if discarded > 0 {
                    debug!(discarded, "queued sends discarded with endpoint");
                }
            }
            if let Some(id) = id {
                if net.endpoint_index.get(&id) == Some(&endpoint) {
                    net.endpoint_index.remove(&id);
                }
                net.transport.scheduler.remove_receiver(u64::from(id.value()));
                net.transport.sequencing.forget(u64::from(id.value()));
                if reason == EndpointDestroyedReason::RemoteDestroyed && !local && net.is_live() {
                    net.remote_destroys.push(RemoteDestroy {
                        endpoint: id,
                        deadline: now + window,
                    });
                    action = Some(ReleaseAction::AckEndpointDestroyed {
                        network,
                        endpoint: id,
                    });
                }
            }
        }
        self.emit_with(
            StateChangeKind::EndpointDestroyed {
                network,
                endpoint,
                reason,
            },
            action,
        );
        self.destroy_handle(endpoint.raw());
    }
}

// ----------------------------------------------------------------------------
// Sending
// ----------------------------------------------------------------------------

impl EngineState {
    /// Queue a message; an empty target list broadcasts to every other
    /// visible endpoint in the network
    pub fn send_message(
        &mut self,
        endpoint: Handle<Endpoint>,
        targets: &[Handle<Endpoint>],
        options: SendMessageOptions,
        queuing: QueuingConfiguration,
        segments: &[&[u8]],
    ) -> Result<()> {
        let data: Vec<u8> = segments.concat();
        if data.is_empty() {
            return Err(SendQueueError::NoData.into());
        }
        let ep = self.tables.endpoints.resolve(endpoint)?;
        if !ep.local || !ep.is_usable() {
            return Err(PartyError::invalid_argument(
                "messages can only be sent from a live local endpoint",
            ));
        }
        let network = ep.network;
        let net = self.live_network(network)?;

        let resolved: Vec<Handle<Endpoint>> = if targets.is_empty() {
            net.view
                .endpoints
                .iter()
                .copied()
                .filter(|target| *target != endpoint)
                .collect()
        } else {
            targets.to_vec()
        };
        let mut receivers: Vec<Target> = Vec::with_capacity(resolved.len());
        for target in resolved {
            let Ok(other) = self.tables.endpoints.resolve(target) else {
                if targets.is_empty() {
                    continue;
                }
                return Err(PartyError::invalid_argument("target endpoint no longer exists"));
            };
            let id = match (other.state, other.id) {
                (EndpointState::Active, Some(id)) if other.network == network => id,
                _ if targets.is_empty() => continue,
                _ => {
                    return Err(PartyError::invalid_argument(
                        "target endpoint is not active in the sender's network",
                    ))
                }
            };
            let entry = Target {
                device: other.device_id,
                receiver: u64::from(id.value()),
            };
            if !receivers.contains(&entry) {
                receivers.push(entry);
            }
        }
        if receivers.is_empty() {
            trace!("send has no receivers");
            return Ok(());
        }

        let now = self.now();
        self.tables
            .networks
            .resolve_mut(network)?
            .transport
            .scheduler
            .enqueue(endpoint_key(endpoint), receivers, options, queuing, data, now)?;
        Ok(())
    }

    fn local_endpoint_network(&self, endpoint: Handle<Endpoint>) -> Result<Handle<Network>> {
        let ep = self.tables.endpoints.resolve(endpoint)?;
        if !ep.local {
            return Err(PartyError::invalid_argument("endpoint is not local"));
        }
        Ok(ep.network)
    }

    fn receiver_ids(&self, targets: &[Handle<Endpoint>]) -> Result<Vec<u64>> {
        targets
            .iter()
            .map(|target| {
                self.tables
                    .endpoints
                    .resolve(*target)?
                    .id
                    .map(|id| u64::from(id.value()))
                    .ok_or_else(|| PartyError::invalid_argument("target endpoint has no id yet"))
            })
            .collect()
    }

    /// Returns the number of messages canceled
    pub fn cancel_messages(
        &mut self,
        endpoint: Handle<Endpoint>,
        filter: CancelFilter,
        targets: Option<&[Handle<Endpoint>]>,
    ) -> Result<usize> {
        let network = self.local_endpoint_network(endpoint)?;
        let receivers = targets.map(|t| self.receiver_ids(t)).transpose()?;
        let net = self.tables.networks.resolve_mut(network)?;
        net.transport
            .scheduler
            .cancel(endpoint_key(endpoint), filter, receivers.as_deref())
    }

    pub fn flush_messages(&mut self, endpoint: Handle<Endpoint>) -> Result<()> {
        let network = self.local_endpoint_network(endpoint)?;
        let net = self.tables.networks.resolve_mut(network)?;
        net.transport.scheduler.flush(endpoint_key(endpoint))
    }

    /// Counters for one local endpoint; with targets, summed over each pair
    pub fn endpoint_statistics(
        &self,
        endpoint: Handle<Endpoint>,
        targets: &[Handle<Endpoint>],
    ) -> Result<MessageStats> {
        let network = self.local_endpoint_network(endpoint)?;
        let scheduler = &self.tables.networks.resolve(network)?.transport.scheduler;
        if targets.is_empty() {
            return scheduler.source_stats(endpoint_key(endpoint));
        }
        let mut total = MessageStats::default();
        for receiver in self.receiver_ids(targets)? {
            accumulate(&mut total, scheduler.pair_stats(endpoint_key(endpoint), receiver)?);
        }
        Ok(total)
    }

    pub fn network_statistics(&self, network: Handle<Network>) -> Result<NetworkStatistics> {
        Ok(self.tables.networks.resolve(network)?.transport.statistics())
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

impl EngineState {
    /// One networking tick for one network
    pub(crate) fn pump_network(&mut self, network: Handle<Network>, now: Timestamp) {
        let local_id = self.local_device_id;
        let budget = self.config.send_queue.send_budget_per_tick;
        let max_packet = self.config.send_queue.max_packet_payload;
        let Ok(net) = self.tables.networks.resolve_mut(network) else {
            return;
        };
        if !net.is_live() {
            return;
        }
        let id = net.id;
        let transport = &mut net.transport;

        let expired = transport.scheduler.expire(now);
        if !expired.is_empty() {
            debug!(network = %id, count = expired.len(), "messages timed out");
        }
        let abandoned = transport.reassembler.expire(now);
        if abandoned > 0 {
            transport.received.dropped_messages += abandoned as u64;
        }

        let poll = transport.delivery.poll(now);
        let mut outgoing: HashMap<DeviceId, Vec<Frame>> = HashMap::new();
        for (device, frame) in poll.due {
            outgoing.entry(device).or_default().push(frame);
        }

        let mut loopback = Vec::new();
        for fragment in transport.scheduler.drain(budget) {
            let frame = DataFrame {
                stream: match fragment.key {
                    QueueKey::Endpoint(_) => StreamKind::Endpoint,
                    QueueKey::Chat(_) => StreamKind::Chat,
                },
                sender: fragment.sender,
                receivers: fragment.receivers,
                delivery: fragment.options.delivery,
                ordering: fragment.options.ordering,
                header: fragment.header,
                data: fragment.data,
            };
            if fragment.device == local_id {
                loopback.push(frame);
                continue;
            }
            if fragment.options.is_guaranteed() {
                transport.delivery.track(
                    fragment.device,
                    frame.fragment_key(),
                    Frame::Data(frame.clone()),
                    now,
                );
            }
            outgoing.entry(fragment.device).or_default().push(Frame::Data(frame));
        }
        for (device, keys) in transport.pending_acks.drain() {
            outgoing
                .entry(device)
                .or_default()
                .extend(keys.into_iter().map(Frame::Ack));
        }

        for (device, frames) in outgoing {
            for packet in packetize(frames, max_packet) {
                match packet.encode() {
                    Ok(payload) => self.relay.submit(RelayRequest::SendPacket {
                        network: id,
                        to: device,
                        payload,
                    }),
                    Err(err) => warn!(network = %id, error = %err, "could not encode packet"),
                }
            }
        }
        for frame in loopback {
            self.receive_frame(network, local_id, Frame::Data(frame), now);
        }

        if !poll.failed.is_empty() {
            for device in &poll.failed {
                warn!(network = %id, device = %device, "guaranteed delivery failed");
                self.relay.submit(RelayRequest::ReportUnresponsive {
                    network: id,
                    device: *device,
                });
            }
            self.destroy_network(
                network,
                NetworkDestroyedReason::DestinationFailure,
                Outcome::failure(StateChangeResult::InternetConnectivityError),
            );
        }
    }

    pub(crate) fn receive_packet(
        &mut self,
        network: Handle<Network>,
        from: DeviceId,
        payload: &[u8],
        now: Timestamp,
    ) {
        let packet = match Packet::decode(payload) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(device = %from, error = %err, "dropping undecodable packet");
                return;
            }
        };
        for frame in packet.frames {
            self.receive_frame(network, from, frame, now);
        }
    }

    fn receive_frame(&mut self, network: Handle<Network>, source: DeviceId, frame: Frame, now: Timestamp) {
        let local_id = self.local_device_id;
        let Ok(net) = self.tables.networks.resolve_mut(network) else {
            return;
        };
        if !net.is_live() {
            return;
        }
        let transport = &mut net.transport;
        let data = match frame {
            Frame::Ack(key) => {
                transport.delivery.acknowledge(source, key);
                return;
            }
            Frame::Data(data) => data,
        };

        let guaranteed = data.delivery == DeliveryMode::Guaranteed;
        let message_id = data.header.message_id;
        if guaranteed && source != local_id {
            transport
                .pending_acks
                .entry(source)
                .or_default()
                .push(data.fragment_key());
        }
        if guaranteed && transport.delivered.contains(source, message_id) {
            transport.received.duplicate_fragments += 1;
            return;
        }
        let reassembled = match transport
            .reassembler
            .process(source, data.header, data.data, now)
        {
            Ok(Some(reassembled)) => reassembled,
            Ok(None) => return,
            Err(err) => {
                debug!(device = %source, error = %err, "fragment rejected");
                transport.received.dropped_messages += 1;
                return;
            }
        };
        if guaranteed {
            transport.delivered.insert(source, message_id);
        }
        transport.received.received_messages += 1;
        transport.received.received_bytes += reassembled.data.len() as u64;

        let sequential = data.ordering == OrderingMode::Sequential;
        let held = HeldMessage {
            source,
            message_id,
            sender: data.sender,
            flags: ReceivedMessageFlags {
                required_fragmentation: reassembled.required_fragmentation,
                sequential,
                guaranteed,
            },
            data: reassembled.data,
        };
        let mut inbox = Inbox::default();
        for receiver in &data.receivers {
            match (sequential, receiver.sequence) {
                (true, Some(seq)) => {
                    let key = SequenceKey::new(data.sender, receiver.id, data.delivery);
                    match transport.sequencing.accept(key, seq, held.clone()) {
                        SequenceOutcome::Deliver(messages) => {
                            for message in messages {
                                inbox.push(message, receiver.id);
                            }
                        }
                        SequenceOutcome::Buffered => {}
                        SequenceOutcome::Stale | SequenceOutcome::Overflow => {
                            transport.received.dropped_messages += 1;
                        }
                    }
                }
                _ => inbox.push(held.clone(), receiver.id),
            }
        }
        self.deliver(network, data.stream, inbox);
    }

    fn deliver(&mut self, network: Handle<Network>, stream: StreamKind, inbox: Inbox) {
        for (message, receivers) in inbox.entries {
            match stream {
                StreamKind::Endpoint => self.deliver_endpoint_message(network, message, receivers),
                StreamKind::Chat => self.deliver_chat_text(network, message, receivers),
            }
        }
    }

    fn deliver_endpoint_message(&mut self, network: Handle<Network>, message: HeldMessage, receivers: Vec<u64>) {
        let Ok(net) = self.tables.networks.resolve(network) else {
            return;
        };
        let lookup = |raw: u64| {
            u16::try_from(raw)
                .ok()
                .and_then(|id| net.endpoint_index.get(&EndpointId::new(id)).copied())
        };
        let Some(sender) = lookup(message.sender) else {
            debug!(sender = message.sender, "message from unknown endpoint");
            return;
        };
        let receivers: Vec<_> = receivers
            .into_iter()
            .filter_map(lookup)
            .filter(|receiver| {
                self.tables
                    .endpoints
                    .resolve(*receiver)
                    .is_ok_and(|ep| ep.local && ep.state == EndpointState::Active)
            })
            .collect();
        if receivers.is_empty() {
            return;
        }
        self.emit(StateChangeKind::EndpointMessageReceived {
            network,
            sender,
            receivers,
            flags: message.flags,
            data: message.data,
        });
    }

    fn deliver_chat_text(&mut self, network: Handle<Network>, message: HeldMessage, receivers: Vec<u64>) {
        let sender_id = ChatControlId::new(message.sender);
        let Some(sender) = self.chat_index.get(&sender_id).copied() else {
            debug!(sender = %sender_id, "chat text from unknown chat control");
            return;
        };
        let receivers: Vec<_> = receivers
            .into_iter()
            .filter_map(|raw| self.chat_index.get(&ChatControlId::new(raw)).copied())
            .filter(|receiver| {
                self.tables.chat_controls.resolve(*receiver).is_ok_and(|control| {
                    control.local
                        && !control.destroyed
                        && control.networks.contains(&network)
                        && control.accepts_text_from(sender_id)
                })
            })
            .collect();
        if receivers.is_empty() {
            return;
        }
        let text = match String::from_utf8(message.data) {
            Ok(text) => text,
            Err(_) => {
                warn!(sender = %sender_id, "dropping chat text that is not UTF-8");
                return;
            }
        };
        self.emit(StateChangeKind::ChatTextReceived {
            sender,
            receivers,
            text,
        });
    }
}
