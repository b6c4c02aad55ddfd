//! Frames and packets exchanged between devices through the relay
//!
//! A packet is a bincode-encoded list of frames addressed to one device.
//! Data frames carry one fragment of an endpoint message or a chat text,
//! together with the receivers on the destination device and, for
//! sequential messages, each receiver's sequence number. Ack frames confirm
//! guaranteed fragments back to their sender.

use std::collections::VecDeque;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::delivery::FragmentKey;
use crate::fragmentation::FragmentHeader;
use crate::message::{DeliveryMode, OrderingMode};
use crate::types::{DeviceId, MessageId};

/// Wire format version carried by every packet
pub const WIRE_VERSION: u8 = 1;

/// Which kind of participant a data frame addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Endpoint,
    Chat,
}

/// One receiver of a data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameReceiver {
    pub id: u64,
    /// Present for sequential messages
    pub sequence: Option<u32>,
}

/// One fragment of a message addressed to receivers on a single device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrame {
    pub stream: StreamKind,
    pub sender: u64,
    pub receivers: SmallVec<[FrameReceiver; 4]>,
    pub delivery: DeliveryMode,
    pub ordering: OrderingMode,
    pub header: FragmentHeader,
    pub data: Vec<u8>,
}

impl DataFrame {
    pub fn fragment_key(&self) -> FragmentKey {
        FragmentKey::new(self.header.message_id, self.header.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Data(DataFrame),
    Ack(FragmentKey),
}

impl Frame {
    /// Encoded size, used to fill packets
    pub fn encoded_len(&self) -> usize {
        bincode::serialized_size(self).map(|n| n as usize).unwrap_or(usize::MAX)
    }
}

/// Frames bound for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub version: u8,
    pub frames: Vec<Frame>,
}

impl Packet {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            version: WIRE_VERSION,
            frames,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        let packet: Packet = bincode::deserialize(bytes)?;
        if packet.version != WIRE_VERSION {
            return Err(Box::new(bincode::ErrorKind::Custom(format!(
                "unsupported wire version {}",
                packet.version
            ))));
        }
        Ok(packet)
    }
}

/// Split frames into packets of at most `max_payload` encoded bytes
///
/// A frame larger than the limit still travels, alone in its packet.
pub fn packetize(frames: Vec<Frame>, max_payload: usize) -> Vec<Packet> {
    let mut packets = Vec::new();
    let mut current = Vec::new();
    let mut current_len = 0;
    for frame in frames {
        let len = frame.encoded_len();
        if !current.is_empty() && current_len + len > max_payload {
            packets.push(Packet::new(std::mem::take(&mut current)));
            current_len = 0;
        }
        current_len += len;
        current.push(frame);
    }
    if !current.is_empty() {
        packets.push(Packet::new(current));
    }
    packets
}

// ----------------------------------------------------------------------------
// Duplicate Suppression
// ----------------------------------------------------------------------------

/// Bounded memory of guaranteed messages already delivered
#[derive(Debug)]
pub struct DeliveredMessages {
    seen: HashSet<(DeviceId, MessageId)>,
    order: VecDeque<(DeviceId, MessageId)>,
    capacity: usize,
}

impl DeliveredMessages {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, source: DeviceId, message_id: MessageId) -> bool {
        self.seen.contains(&(source, message_id))
    }

    /// Remember a delivered message; returns false if it was already known
    pub fn insert(&mut self, source: DeviceId, message_id: MessageId) -> bool {
        if !self.seen.insert((source, message_id)) {
            return false;
        }
        self.order.push_back((source, message_id));
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
