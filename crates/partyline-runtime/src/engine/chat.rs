//! Chat controls: per-user text participants that join networks
//! independently of endpoints

use hashbrown::{HashMap, HashSet};
use partyline_core::config::MAX_CHAT_TEXT_LEN;
use partyline_core::send_queue::{QueueKey, Target};
use partyline_core::{
    ChatControlId, DeliveryMode, Handle, OrderingMode, Outcome, PartyError, QueuingConfiguration,
    Result, SendMessageOptions, StateChangeResult, Timestamp,
};
use tracing::{debug, warn};

use super::{EngineState, PendingOp};
use crate::changes::{ChatControlDestroyedReason, ChatControlLeftReason, StateChangeKind};
use crate::entities::{ChatControl, ChatPermissions, LocalUser, PendingText};
use crate::network::Network;
use crate::relay::RelayRequest;

/// Longest language tag accepted for a chat control
const MAX_LANGUAGE_LEN: usize = 84;

fn chat_key(id: ChatControlId) -> QueueKey {
    QueueKey::Chat(id.value())
}

fn text_options() -> SendMessageOptions {
    SendMessageOptions::best_effort()
        .with_delivery(DeliveryMode::Guaranteed)
        .with_ordering(OrderingMode::Nonsequential)
}

impl EngineState {
    fn local_chat_control(&self, chat_control: Handle<ChatControl>) -> Result<&ChatControl> {
        let control = self.tables.chat_controls.resolve(chat_control)?;
        if !control.local {
            return Err(PartyError::invalid_argument("chat control is not local"));
        }
        if control.destroyed {
            return Err(PartyError::invalid_state("Destroyed", "chat control is being destroyed"));
        }
        Ok(control)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// One chat control per local user; its text filter level is the option
    /// value at creation time
    pub fn create_chat_control(
        &mut self,
        user: Handle<LocalUser>,
        language: Option<String>,
    ) -> Result<Handle<ChatControl>> {
        let entity = self.live_user(user)?.entity.clone();
        if let Some(language) = &language {
            if language.is_empty() || language.len() > MAX_LANGUAGE_LEN {
                return Err(PartyError::invalid_argument(format!(
                    "language must be 1..={MAX_LANGUAGE_LEN} characters"
                )));
            }
        }
        let exists = self
            .tables
            .chat_controls
            .iter()
            .any(|(_, control)| control.local && !control.destroyed && control.user == Some(user));
        if exists {
            return Err(PartyError::duplicate(format!("chat control for {entity}")));
        }

        let mut id = ChatControlId::random();
        while self.chat_index.contains_key(&id) {
            id = ChatControlId::random();
        }
        let filter_level = self.options.lock().text_filter_level;
        let chat_control = self.tables.chat_controls.allocate(ChatControl {
            id,
            device: self.local_device,
            device_id: self.local_device_id,
            local: true,
            user: Some(user),
            entity,
            language,
            filter_level,
            networks: Vec::new(),
            transitioning: HashSet::new(),
            permissions: HashMap::new(),
            muted_text: HashSet::new(),
            outbox: Vec::new(),
            destroyed: false,
        });
        self.chat_index.insert(id, chat_control);
        if let Ok(device) = self.tables.devices.resolve_mut(self.local_device) {
            device.chat_controls.push(chat_control);
        }
        self.emit(StateChangeKind::ChatControlCreated { chat_control });
        Ok(chat_control)
    }

    pub fn destroy_chat_control(&mut self, chat_control: Handle<ChatControl>) -> Result<()> {
        self.local_chat_control(chat_control)?;
        self.destroy_chat_control_internal(chat_control, ChatControlDestroyedReason::Requested);
        Ok(())
    }

    /// Leave every network, then announce the destruction
    pub(crate) fn destroy_chat_control_internal(
        &mut self,
        chat_control: Handle<ChatControl>,
        reason: ChatControlDestroyedReason,
    ) {
        let Ok(control) = self.tables.chat_controls.resolve(chat_control) else {
            return;
        };
        if control.destroyed {
            return;
        }
        let (id, local, user, device) = (control.id, control.local, control.user, control.device);
        let mut networks = control.networks.clone();
        for network in &control.transitioning {
            if !networks.contains(network) {
                networks.push(*network);
            }
        }

        for network in networks {
            if local {
                if let Ok(net) = self.tables.networks.resolve(network) {
                    if net.is_live() {
                        let network_id = net.id;
                        self.submit_detached(|op| RelayRequest::DisconnectChatControl {
                            op,
                            network: network_id,
                            chat_control: id,
                        });
                    }
                }
            }
            self.chat_leave_network(
                chat_control,
                network,
                ChatControlLeftReason::Destroyed,
                StateChangeResult::CanceledByTitle,
            );
        }

        if let Ok(control) = self.tables.chat_controls.resolve_mut(chat_control) {
            control.destroyed = true;
            control.outbox.clear();
        }
        if let Ok(device) = self.tables.devices.resolve_mut(device) {
            device.chat_controls.retain(|c| *c != chat_control);
        }
        self.emit(StateChangeKind::ChatControlDestroyed {
            chat_control,
            reason,
        });
        if let (ChatControlDestroyedReason::Requested, Some(user)) = (reason, user) {
            self.emit(StateChangeKind::DestroyChatControlCompleted {
                outcome: Outcome::success(),
                local_user: user,
                chat_control,
            });
        }
        self.destroy_handle(chat_control.raw());
        debug!(chat_control = %id, reason = ?reason, "chat control destroyed");
    }

    // ------------------------------------------------------------------------
    // Network Membership
    // ------------------------------------------------------------------------

    pub fn connect_chat_control(
        &mut self,
        chat_control: Handle<ChatControl>,
        network: Handle<Network>,
    ) -> Result<()> {
        let control = self.local_chat_control(chat_control)?;
        if control.networks.contains(&network) || control.transitioning.contains(&network) {
            return Err(PartyError::invalid_state(
                "Connected",
                "chat control is already connected or connecting to the network",
            ));
        }
        let (id, entity, user) = (control.id, control.entity.clone(), control.user);
        let net = self.live_network(network)?;
        if !user.is_some_and(|user| net.is_authenticated(user)) {
            return Err(PartyError::invalid_state(
                net.state.state_name(),
                "chat control's user is not authenticated in the network",
            ));
        }
        let network_id = net.id;
        self.tables
            .chat_controls
            .resolve_mut(chat_control)?
            .transitioning
            .insert(network);
        self.submit_op(
            PendingOp::ConnectChatControl {
                network,
                chat_control,
            },
            |op| RelayRequest::ConnectChatControl {
                op,
                network: network_id,
                chat_control: id,
                entity,
            },
        );
        Ok(())
    }

    pub(crate) fn complete_connect_chat_control(
        &mut self,
        network: Handle<Network>,
        chat_control: Handle<ChatControl>,
        outcome: Outcome,
    ) {
        let Ok(control) = self.tables.chat_controls.resolve_mut(chat_control) else {
            return;
        };
        control.transitioning.remove(&network);
        let id = control.id;
        let usable = !control.destroyed
            && self
                .tables
                .networks
                .resolve(network)
                .is_ok_and(|net| net.state.accepts_operations());
        if !outcome.is_success() || !usable {
            let outcome = if outcome.is_success() {
                Outcome::failure(StateChangeResult::CanceledByTitle)
            } else {
                outcome
            };
            self.emit(StateChangeKind::ConnectChatControlCompleted {
                outcome,
                network,
                chat_control,
            });
            return;
        }

        control.networks.push(network);
        if let Ok(net) = self.tables.networks.resolve_mut(network) {
            net.chat_controls.push(chat_control);
            let scheduler = &mut net.transport.scheduler;
            let added = scheduler
                .add_source(chat_key(id))
                .and_then(|_| scheduler.activate_source(chat_key(id), id.value()));
            if let Err(err) = added {
                warn!(chat_control = %id, error = %err, "chat send queue unavailable");
            }
        }
        self.emit(StateChangeKind::ConnectChatControlCompleted {
            outcome,
            network,
            chat_control,
        });
        self.emit(StateChangeKind::ChatControlJoinedNetwork {
            network,
            chat_control,
        });
    }

    pub fn disconnect_chat_control(
        &mut self,
        chat_control: Handle<ChatControl>,
        network: Handle<Network>,
    ) -> Result<()> {
        let control = self.local_chat_control(chat_control)?;
        if !control.networks.contains(&network) || control.transitioning.contains(&network) {
            return Err(PartyError::invalid_state(
                "Disconnected",
                "chat control is not connected to the network",
            ));
        }
        let id = control.id;
        let network_id = self.live_network(network)?.id;
        self.tables
            .chat_controls
            .resolve_mut(chat_control)?
            .transitioning
            .insert(network);
        self.submit_op(
            PendingOp::DisconnectChatControl {
                network,
                chat_control,
            },
            |op| RelayRequest::DisconnectChatControl {
                op,
                network: network_id,
                chat_control: id,
            },
        );
        Ok(())
    }

    pub(crate) fn complete_disconnect_chat_control(
        &mut self,
        network: Handle<Network>,
        chat_control: Handle<ChatControl>,
        outcome: Outcome,
    ) {
        let Ok(control) = self.tables.chat_controls.resolve_mut(chat_control) else {
            return;
        };
        control.transitioning.remove(&network);
        if outcome.is_success() {
            self.chat_leave_network(
                chat_control,
                network,
                ChatControlLeftReason::Requested,
                StateChangeResult::CanceledByTitle,
            );
        }
        self.emit(StateChangeKind::DisconnectChatControlCompleted {
            outcome,
            network,
            chat_control,
        });
    }

    /// Take a chat control out of one network
    ///
    /// A pending connect fails with `canceled`; a pending disconnect
    /// completes successfully after `ChatControlLeftNetwork`.
    pub(crate) fn chat_leave_network(
        &mut self,
        chat_control: Handle<ChatControl>,
        network: Handle<Network>,
        reason: ChatControlLeftReason,
        canceled: StateChangeResult,
    ) {
        let Ok(control) = self.tables.chat_controls.resolve_mut(chat_control) else {
            return;
        };
        let was_transitioning = control.transitioning.remove(&network);
        let was_joined = control.networks.contains(&network);
        control.networks.retain(|n| *n != network);
        let (id, local) = (control.id, control.local);

        let mut disconnect_pending = false;
        if was_transitioning {
            if self
                .take_op(|op| {
                    matches!(op, PendingOp::ConnectChatControl { network: n, chat_control: c }
                        if *n == network && *c == chat_control)
                })
                .is_some()
            {
                self.emit(StateChangeKind::ConnectChatControlCompleted {
                    outcome: Outcome::failure(canceled),
                    network,
                    chat_control,
                });
            }
            disconnect_pending = self
                .take_op(|op| {
                    matches!(op, PendingOp::DisconnectChatControl { network: n, chat_control: c }
                        if *n == network && *c == chat_control)
                })
                .is_some();
        }

        if was_joined {
            if let Ok(net) = self.tables.networks.resolve_mut(network) {
                net.chat_controls.retain(|c| *c != chat_control);
                if local {
                    net.transport.scheduler.remove_source(chat_key(id));
                } else {
                    net.transport.scheduler.remove_receiver(id.value());
                }
            }
            self.emit(StateChangeKind::ChatControlLeftNetwork {
                network,
                chat_control,
                reason,
            });
        }
        if disconnect_pending {
            self.emit(StateChangeKind::DisconnectChatControlCompleted {
                outcome: Outcome::success(),
                network,
                chat_control,
            });
        }
    }

    // ------------------------------------------------------------------------
    // Permissions and Muting
    // ------------------------------------------------------------------------

    fn other_chat_control(&self, target: Handle<ChatControl>) -> Result<ChatControlId> {
        Ok(self.tables.chat_controls.resolve(target)?.id)
    }

    pub fn set_chat_permissions(
        &mut self,
        chat_control: Handle<ChatControl>,
        target: Handle<ChatControl>,
        permissions: ChatPermissions,
    ) -> Result<()> {
        if chat_control == target {
            return Err(PartyError::invalid_argument("a chat control has no permissions on itself"));
        }
        self.local_chat_control(chat_control)?;
        let other = self.other_chat_control(target)?;
        self.tables
            .chat_controls
            .resolve_mut(chat_control)?
            .permissions
            .insert(other, permissions);
        Ok(())
    }

    pub fn chat_permissions(
        &self,
        chat_control: Handle<ChatControl>,
        target: Handle<ChatControl>,
    ) -> Result<ChatPermissions> {
        let other = self.other_chat_control(target)?;
        Ok(self.local_chat_control(chat_control)?.permissions_for(other))
    }

    pub fn set_incoming_text_muted(
        &mut self,
        chat_control: Handle<ChatControl>,
        target: Handle<ChatControl>,
        muted: bool,
    ) -> Result<()> {
        self.local_chat_control(chat_control)?;
        let other = self.other_chat_control(target)?;
        let control = self.tables.chat_controls.resolve_mut(chat_control)?;
        if muted {
            control.muted_text.insert(other);
        } else {
            control.muted_text.remove(&other);
        }
        Ok(())
    }

    pub fn is_incoming_text_muted(
        &self,
        chat_control: Handle<ChatControl>,
        target: Handle<ChatControl>,
    ) -> Result<bool> {
        let other = self.other_chat_control(target)?;
        Ok(self.local_chat_control(chat_control)?.muted_text.contains(&other))
    }

    // ------------------------------------------------------------------------
    // Text
    // ------------------------------------------------------------------------

    /// Queue text for the next audio tick
    pub fn send_text(
        &mut self,
        chat_control: Handle<ChatControl>,
        targets: &[Handle<ChatControl>],
        text: &str,
    ) -> Result<()> {
        if text.is_empty() || text.len() > MAX_CHAT_TEXT_LEN {
            return Err(PartyError::invalid_argument(format!(
                "chat text must be 1..={MAX_CHAT_TEXT_LEN} bytes"
            )));
        }
        if targets.is_empty() {
            return Err(PartyError::invalid_argument("chat text needs at least one target"));
        }
        self.local_chat_control(chat_control)?;
        for target in targets {
            if *target == chat_control {
                return Err(PartyError::invalid_argument("chat text cannot target its sender"));
            }
            self.tables.chat_controls.resolve(*target)?;
        }
        self.tables
            .chat_controls
            .resolve_mut(chat_control)?
            .outbox
            .push(PendingText {
                targets: targets.to_vec(),
                text: text.to_owned(),
            });
        Ok(())
    }

    /// Hand queued text to the send queue of every network shared with a
    /// target
    pub(crate) fn flush_chat_outboxes(&mut self, now: Timestamp) {
        let senders: Vec<_> = self
            .tables
            .chat_controls
            .iter()
            .filter(|(_, control)| control.local && !control.destroyed && !control.outbox.is_empty())
            .map(|(handle, _)| handle)
            .collect();

        for sender in senders {
            let Ok(control) = self.tables.chat_controls.resolve_mut(sender) else {
                continue;
            };
            let outbox = std::mem::take(&mut control.outbox);
            let (id, networks) = (control.id, control.networks.clone());

            for pending in outbox {
                let mut delivered = false;
                for network in &networks {
                    let receivers: Vec<Target> = pending
                        .targets
                        .iter()
                        .filter_map(|target| self.tables.chat_controls.resolve(*target).ok())
                        .filter(|target| !target.destroyed && target.networks.contains(network))
                        .map(|target| Target {
                            device: target.device_id,
                            receiver: target.id.value(),
                        })
                        .collect();
                    if receivers.is_empty() {
                        continue;
                    }
                    let Ok(net) = self.tables.networks.resolve_mut(*network) else {
                        continue;
                    };
                    match net.transport.scheduler.enqueue(
                        chat_key(id),
                        receivers,
                        text_options(),
                        QueuingConfiguration::default(),
                        pending.text.clone().into_bytes(),
                        now,
                    ) {
                        Ok(_) => delivered = true,
                        Err(err) => warn!(chat_control = %id, error = %err, "could not queue chat text"),
                    }
                }
                if !delivered {
                    debug!(chat_control = %id, "chat text has no reachable target");
                }
            }
        }
    }
}
