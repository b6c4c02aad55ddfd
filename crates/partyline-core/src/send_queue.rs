//! Outbound message scheduling
//!
//! One FIFO queue exists per local endpoint, plus internal chat queues
//! pinned at [`CHAT_PRIORITY`]. Each network tick the scheduler repeatedly
//! picks the eligible queue with the highest effective priority (the highest
//! priority of any message still in it), breaking ties in favour of the
//! queue served least recently, and emits the next fragment of that queue's
//! head message until the tick's byte budget is spent. A queue's own FIFO
//! order is never broken.
//!
//! Messages are numbered in their sequence spaces when their first fragment
//! goes out. Until then they can time out or be cancelled; afterwards they
//! always run to completion.

use std::collections::{BTreeMap, VecDeque};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::config::SendQueueConfig;
use crate::errors::{PartyError, Result, SendQueueError};
use crate::fragmentation::{fragment_message, Fragment, FragmentHeader};
use crate::message::{
    CancelFilter, CoalescingMode, QueuingConfiguration, SendMessageOptions, CHAT_PRIORITY,
};
use crate::sequencing::{SequenceAllocator, SequenceKey};
use crate::types::{DeviceId, MessageId, Timestamp};
use crate::wire::FrameReceiver;

// ----------------------------------------------------------------------------
// Keys and Targets
// ----------------------------------------------------------------------------

/// Identifies one source queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueKey {
    /// A local endpoint, keyed by its packed handle
    Endpoint(u64),
    /// Chat text of one local chat control, pinned at `CHAT_PRIORITY`
    Chat(u64),
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKey::Endpoint(bits) => write!(f, "endpoint:{bits:x}"),
            QueueKey::Chat(id) => write!(f, "chat:{id:x}"),
        }
    }
}

/// One resolved receiver of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    pub device: DeviceId,
    pub receiver: u64,
}

/// A fragment ready for packetization, addressed to one device
#[derive(Debug, Clone)]
pub struct OutboundFragment {
    pub key: QueueKey,
    pub sender: u64,
    pub device: DeviceId,
    pub receivers: SmallVec<[FrameReceiver; 4]>,
    pub options: SendMessageOptions,
    pub header: FragmentHeader,
    pub data: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Message counters; a broadcast counts once
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStats {
    /// Queued and not yet started
    pub queued_messages: u64,
    pub queued_bytes: u64,
    /// Started but not fully transmitted
    pub active_messages: u64,
    pub active_bytes: u64,
    pub sent_messages: u64,
    pub sent_bytes: u64,
    pub timed_out_messages: u64,
    pub timed_out_bytes: u64,
    pub canceled_messages: u64,
    pub canceled_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    sent: (u64, u64),
    timed_out: (u64, u64),
    canceled: (u64, u64),
}

impl Totals {
    fn apply(&self, stats: &mut MessageStats) {
        stats.sent_messages += self.sent.0;
        stats.sent_bytes += self.sent.1;
        stats.timed_out_messages += self.timed_out.0;
        stats.timed_out_bytes += self.timed_out.1;
        stats.canceled_messages += self.canceled.0;
        stats.canceled_bytes += self.canceled.1;
    }
}

fn bump(counter: &mut (u64, u64), bytes: usize) {
    counter.0 += 1;
    counter.1 += bytes as u64;
}

// ----------------------------------------------------------------------------
// Queued Messages
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct PendingMessage {
    id: MessageId,
    targets: Vec<Target>,
    options: SendMessageOptions,
    queuing: QueuingConfiguration,
    size: usize,
    fragments: VecDeque<Fragment>,
    sequences: SmallVec<[(u64, u32); 4]>,
    started: bool,
    flushed: bool,
    deadline: Option<Timestamp>,
}

impl PendingMessage {
    fn withheld(&self) -> bool {
        self.options.coalescing == CoalescingMode::UntilFlushed && !self.flushed && !self.started
    }

    fn sequence_for(&self, receiver: u64) -> Option<u32> {
        self.sequences
            .iter()
            .find(|(id, _)| *id == receiver)
            .map(|(_, seq)| *seq)
    }
}

#[derive(Debug)]
struct SourceQueue {
    sender: Option<u64>,
    messages: VecDeque<PendingMessage>,
    last_serviced: u64,
    totals: Totals,
}

impl SourceQueue {
    fn eligible(&self) -> bool {
        self.sender.is_some()
    }

    fn effective_priority(&self) -> Option<i8> {
        self.messages.iter().map(|m| m.queuing.priority).max()
    }

    /// Release withheld messages at the head when a later message forces
    /// them out or their bytes fill a packet
    fn release_withheld(&mut self, packet_limit: usize) {
        let withheld_prefix = self.messages.iter().take_while(|m| m.withheld()).count();
        if withheld_prefix == 0 {
            return;
        }
        let forced = withheld_prefix < self.messages.len();
        let bytes: usize = self
            .messages
            .iter()
            .take(withheld_prefix)
            .map(|m| m.size)
            .sum();
        if forced || bytes >= packet_limit {
            for message in self.messages.iter_mut().take(withheld_prefix) {
                message.flushed = true;
            }
        }
    }

    fn ready(&self) -> bool {
        self.eligible() && self.messages.front().is_some_and(|m| !m.withheld())
    }
}

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

/// Per-network outbound scheduler
#[derive(Debug)]
pub struct SendScheduler {
    config: SendQueueConfig,
    queues: BTreeMap<QueueKey, SourceQueue>,
    pair_totals: HashMap<(QueueKey, u64), Totals>,
    network_totals: Totals,
    sequences: SequenceAllocator,
    next_message_id: u64,
    service_counter: u64,
}

impl SendScheduler {
    pub fn new(config: SendQueueConfig) -> Self {
        Self {
            config,
            queues: BTreeMap::new(),
            pair_totals: HashMap::new(),
            network_totals: Totals::default(),
            sequences: SequenceAllocator::new(),
            next_message_id: 1,
            service_counter: 0,
        }
    }

    pub fn config(&self) -> &SendQueueConfig {
        &self.config
    }

    /// Register a source; it stays ineligible until activated
    pub fn add_source(&mut self, key: QueueKey) -> Result<()> {
        if self.queues.contains_key(&key) {
            return Err(SendQueueError::DuplicateSource {
                source_key: key.to_string(),
            }
            .into());
        }
        self.queues.insert(
            key,
            SourceQueue {
                sender: None,
                messages: VecDeque::new(),
                last_serviced: 0,
                totals: Totals::default(),
            },
        );
        Ok(())
    }

    /// Make a source eligible for transmission under its wire identity
    pub fn activate_source(&mut self, key: QueueKey, sender: u64) -> Result<()> {
        self.queue_mut(key)?.sender = Some(sender);
        Ok(())
    }

    /// Drop a source and everything still queued on it; returns the number
    /// of messages discarded
    pub fn remove_source(&mut self, key: QueueKey) -> usize {
        let Some(queue) = self.queues.remove(&key) else {
            return 0;
        };
        if let Some(sender) = queue.sender {
            self.sequences.forget(sender);
        }
        self.pair_totals.retain(|(k, _), _| *k != key);
        queue.messages.len()
    }

    pub fn has_source(&self, key: QueueKey) -> bool {
        self.queues.contains_key(&key)
    }

    fn queue_mut(&mut self, key: QueueKey) -> Result<&mut SourceQueue> {
        self.queues.get_mut(&key).ok_or_else(|| {
            PartyError::from(SendQueueError::UnknownSource {
                source_key: key.to_string(),
            })
        })
    }

    /// Queue a message for the given targets
    pub fn enqueue(
        &mut self,
        key: QueueKey,
        targets: Vec<Target>,
        options: SendMessageOptions,
        queuing: QueuingConfiguration,
        data: Vec<u8>,
        now: Timestamp,
    ) -> Result<MessageId> {
        let queuing = if matches!(key, QueueKey::Chat(_)) {
            QueuingConfiguration {
                priority: CHAT_PRIORITY,
                ..queuing
            }
        } else {
            queuing
        };
        queuing.validate()?;
        if data.len() > self.config.max_message_size {
            return Err(SendQueueError::MessageTooLarge {
                size: data.len(),
                max: self.config.max_message_size,
            }
            .into());
        }

        let id = MessageId::new(self.next_message_id);
        let fragments = fragment_message(id, &data, self.config.max_fragment_payload)?;
        let deadline = (queuing.timeout_ms > 0)
            .then(|| now + core::time::Duration::from_millis(queuing.timeout_ms as u64));

        let queue = self.queue_mut(key)?;
        queue.messages.push_back(PendingMessage {
            id,
            targets,
            options,
            queuing,
            size: data.len(),
            fragments: fragments.into(),
            sequences: SmallVec::new(),
            started: false,
            flushed: false,
            deadline,
        });
        self.next_message_id += 1;
        tracing::trace!(source = %key, message = %id, bytes = data.len(), "message queued");
        Ok(id)
    }

    /// Release every withheld message of a source
    pub fn flush(&mut self, key: QueueKey) -> Result<()> {
        for message in self.queue_mut(key)?.messages.iter_mut() {
            message.flushed = true;
        }
        Ok(())
    }

    /// Remove not-yet-started messages matching `filter`
    ///
    /// With `receivers`, only those targets are removed from matching
    /// messages, and a message counts as canceled once it has no targets
    /// left. Returns the number of messages canceled.
    pub fn cancel(
        &mut self,
        key: QueueKey,
        filter: CancelFilter,
        receivers: Option<&[u64]>,
    ) -> Result<usize> {
        let queue = self.queues.get_mut(&key).ok_or_else(|| {
            PartyError::from(SendQueueError::UnknownSource {
                source_key: key.to_string(),
            })
        })?;

        let mut canceled = Vec::new();
        let mut partial: Vec<(u64, usize)> = Vec::new();
        queue.messages.retain_mut(|message| {
            if message.started || !filter.matches(message.queuing.identity_for_cancel_filters) {
                return true;
            }
            match receivers {
                None => {
                    canceled.push((message.size, std::mem::take(&mut message.targets)));
                    false
                }
                Some(receivers) => {
                    let before = message.targets.len();
                    message.targets.retain(|t| {
                        if receivers.contains(&t.receiver) {
                            partial.push((t.receiver, message.size));
                            false
                        } else {
                            true
                        }
                    });
                    if message.targets.is_empty() && before > 0 {
                        canceled.push((message.size, Vec::new()));
                        false
                    } else {
                        true
                    }
                }
            }
        });

        for (size, targets) in &canceled {
            bump(&mut queue.totals.canceled, *size);
            bump(&mut self.network_totals.canceled, *size);
            for target in targets {
                bump(
                    &mut self.pair_totals.entry((key, target.receiver)).or_default().canceled,
                    *size,
                );
            }
        }
        for (receiver, size) in partial {
            bump(&mut self.pair_totals.entry((key, receiver)).or_default().canceled, size);
        }
        Ok(canceled.len())
    }

    /// Discard not-yet-started messages whose deadline has passed
    pub fn expire(&mut self, now: Timestamp) -> Vec<MessageId> {
        let mut expired = Vec::new();
        for (key, queue) in self.queues.iter_mut() {
            let mut dropped = Vec::new();
            queue.messages.retain_mut(|message| {
                let past = !message.started && message.deadline.is_some_and(|d| d.has_passed(now));
                if past {
                    dropped.push((message.id, message.size, std::mem::take(&mut message.targets)));
                }
                !past
            });
            for (id, size, targets) in dropped {
                bump(&mut queue.totals.timed_out, size);
                bump(&mut self.network_totals.timed_out, size);
                for target in targets {
                    bump(
                        &mut self.pair_totals.entry((*key, target.receiver)).or_default().timed_out,
                        size,
                    );
                }
                tracing::debug!(source = %key, message = %id, "queued message timed out");
                expired.push(id);
            }
        }
        expired
    }

    /// Remove a receiver from every not-yet-started message
    pub fn remove_receiver(&mut self, receiver: u64) {
        for queue in self.queues.values_mut() {
            let mut emptied = Vec::new();
            queue.messages.retain_mut(|message| {
                if message.started {
                    return true;
                }
                let before = message.targets.len();
                message.targets.retain(|t| t.receiver != receiver);
                let emptied_now = before > 0 && message.targets.is_empty();
                if emptied_now {
                    emptied.push(message.size);
                }
                !emptied_now
            });
            for size in emptied {
                bump(&mut queue.totals.canceled, size);
                bump(&mut self.network_totals.canceled, size);
            }
        }
        self.sequences.forget(receiver);
    }

    /// Emit fragments for one tick, spending at most `budget` bytes
    pub fn drain(&mut self, budget: usize) -> Vec<OutboundFragment> {
        let packet_limit = self.config.max_packet_payload;
        for queue in self.queues.values_mut() {
            queue.release_withheld(packet_limit);
        }

        let mut out = Vec::new();
        let mut remaining = budget;
        while remaining > 0 {
            let Some(key) = self.select() else {
                break;
            };
            let spent = self.emit_next_fragment(key, &mut out);
            remaining = remaining.saturating_sub(spent.max(1));
        }
        out
    }

    fn select(&self) -> Option<QueueKey> {
        self.queues
            .iter()
            .filter(|(_, queue)| queue.ready())
            .filter_map(|(key, queue)| {
                queue
                    .effective_priority()
                    .map(|priority| (*key, priority, queue.last_serviced))
            })
            .max_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))
            .map(|(key, _, _)| key)
    }

    fn emit_next_fragment(&mut self, key: QueueKey, out: &mut Vec<OutboundFragment>) -> usize {
        self.service_counter += 1;
        let counter = self.service_counter;
        let Some(queue) = self.queues.get_mut(&key) else {
            return 0;
        };
        let Some(sender) = queue.sender else {
            return 0;
        };
        queue.last_serviced = counter;
        let Some(message) = queue.messages.front_mut() else {
            return 0;
        };

        if !message.started {
            message.started = true;
            if message.options.is_sequential() {
                let delivery = message.options.delivery;
                message.sequences = message
                    .targets
                    .iter()
                    .map(|t| {
                        let seq = self
                            .sequences
                            .next(SequenceKey::new(sender, t.receiver, delivery));
                        (t.receiver, seq)
                    })
                    .collect();
            }
        }

        let mut spent = 0;
        if let Some(fragment) = message.fragments.pop_front() {
            let mut by_device: Vec<(DeviceId, SmallVec<[FrameReceiver; 4]>)> = Vec::new();
            for target in &message.targets {
                let receiver = FrameReceiver {
                    id: target.receiver,
                    sequence: message.sequence_for(target.receiver),
                };
                match by_device.iter_mut().find(|(d, _)| *d == target.device) {
                    Some((_, receivers)) => receivers.push(receiver),
                    None => by_device.push((target.device, smallvec::smallvec![receiver])),
                }
            }
            for (device, receivers) in by_device {
                spent += fragment.data.len();
                out.push(OutboundFragment {
                    key,
                    sender,
                    device,
                    receivers,
                    options: message.options,
                    header: fragment.header,
                    data: fragment.data.clone(),
                });
            }
        }

        if message.fragments.is_empty() {
            if let Some(done) = queue.messages.pop_front() {
                bump(&mut queue.totals.sent, done.size);
                bump(&mut self.network_totals.sent, done.size);
                for target in &done.targets {
                    bump(
                        &mut self.pair_totals.entry((key, target.receiver)).or_default().sent,
                        done.size,
                    );
                }
            }
        }
        spent
    }

    fn live_stats<F>(&self, stats: &mut MessageStats, mut include: F)
    where
        F: FnMut(QueueKey, &PendingMessage) -> bool,
    {
        for (key, queue) in &self.queues {
            for message in &queue.messages {
                if !include(*key, message) {
                    continue;
                }
                if message.started {
                    stats.active_messages += 1;
                    stats.active_bytes += message.size as u64;
                } else {
                    stats.queued_messages += 1;
                    stats.queued_bytes += message.size as u64;
                }
            }
        }
    }

    /// Statistics for everything a source sent or queued
    pub fn source_stats(&self, key: QueueKey) -> Result<MessageStats> {
        let queue = self.queues.get(&key).ok_or_else(|| {
            PartyError::from(SendQueueError::UnknownSource {
                source_key: key.to_string(),
            })
        })?;
        let mut stats = MessageStats::default();
        queue.totals.apply(&mut stats);
        self.live_stats(&mut stats, |k, _| k == key);
        Ok(stats)
    }

    /// Statistics for messages from one source to one receiver
    pub fn pair_stats(&self, key: QueueKey, receiver: u64) -> Result<MessageStats> {
        if !self.queues.contains_key(&key) {
            return Err(SendQueueError::UnknownSource {
                source_key: key.to_string(),
            }
            .into());
        }
        let mut stats = MessageStats::default();
        if let Some(totals) = self.pair_totals.get(&(key, receiver)) {
            totals.apply(&mut stats);
        }
        self.live_stats(&mut stats, |k, m| {
            k == key && m.targets.iter().any(|t| t.receiver == receiver)
        });
        Ok(stats)
    }

    /// Statistics across every source of the network
    pub fn network_stats(&self) -> MessageStats {
        let mut stats = MessageStats::default();
        self.network_totals.apply(&mut stats);
        self.live_stats(&mut stats, |_, _| true);
        stats
    }

    /// Messages still queued or in progress on a source
    pub fn pending_messages(&self, key: QueueKey) -> usize {
        self.queues.get(&key).map_or(0, |q| q.messages.len())
    }

    pub fn is_idle(&self) -> bool {
        self.queues.values().all(|q| q.messages.is_empty())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
