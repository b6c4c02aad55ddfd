//! Message fragmentation and reassembly
//!
//! Messages larger than the fragment payload limit are split into numbered
//! fragments carrying the total size and a CRC32 of the whole message. The
//! receiver holds partial messages per sending device and releases a message
//! only when every fragment has arrived and the checksum matches, so a
//! message is delivered atomically or not at all.

use core::cmp;
use core::time::Duration;

use crc32fast::Hasher;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::errors::FragmentationError;
use crate::types::{DeviceId, MessageId, Timestamp};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Maximum number of fragments per message
pub const MAX_FRAGMENTS: usize = u16::MAX as usize;

/// Maximum number of concurrent reassembly operations
pub const MAX_CONCURRENT_REASSEMBLIES: usize = 256;

// ----------------------------------------------------------------------------
// Fragment Header
// ----------------------------------------------------------------------------

/// Header carried by every fragment of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentHeader {
    pub message_id: MessageId,
    /// Fragment sequence number (0-based)
    pub index: u16,
    /// Total number of fragments in the message
    pub count: u16,
    /// Size of the original complete message
    pub total_size: u32,
    /// CRC32 of the complete message
    pub checksum: u32,
}

impl FragmentHeader {
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.count
    }

    /// Whether the message had to be split
    pub fn is_fragmented(&self) -> bool {
        self.count > 1
    }
}

/// A single fragment ready for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub data: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Fragmenter
// ----------------------------------------------------------------------------

/// Split a message into fragments of at most `max_payload` bytes
pub fn fragment_message(
    message_id: MessageId,
    data: &[u8],
    max_payload: usize,
) -> Result<Vec<Fragment>, FragmentationError> {
    if max_payload == 0 {
        return Err(FragmentationError::FragmentSizeTooSmall { size: max_payload });
    }
    let needed = cmp::max(1, data.len().div_ceil(max_payload));
    if needed > MAX_FRAGMENTS {
        return Err(FragmentationError::TooManyFragments {
            needed,
            max: MAX_FRAGMENTS,
        });
    }

    let checksum = calculate_checksum(data);
    let total_size = data.len() as u32;
    let count = needed as u16;

    if data.is_empty() {
        return Ok(vec![Fragment {
            header: FragmentHeader {
                message_id,
                index: 0,
                count: 1,
                total_size: 0,
                checksum,
            },
            data: Vec::new(),
        }]);
    }

    Ok(data
        .chunks(max_payload)
        .enumerate()
        .map(|(i, chunk)| Fragment {
            header: FragmentHeader {
                message_id,
                index: i as u16,
                count,
                total_size,
                checksum,
            },
            data: chunk.to_vec(),
        })
        .collect())
}

fn calculate_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

// ----------------------------------------------------------------------------
// Reassembler
// ----------------------------------------------------------------------------

/// A fully reassembled message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub message_id: MessageId,
    pub data: Vec<u8>,
    /// Whether the message arrived in more than one fragment
    pub required_fragmentation: bool,
}

#[derive(Debug)]
struct ReassemblyState {
    count: u16,
    total_size: u32,
    checksum: u32,
    fragments: HashMap<u16, Vec<u8>>,
    first_received: Timestamp,
    memory_used: usize,
}

impl ReassemblyState {
    fn new(header: &FragmentHeader, now: Timestamp) -> Self {
        Self {
            count: header.count,
            total_size: header.total_size,
            checksum: header.checksum,
            fragments: HashMap::new(),
            first_received: now,
            memory_used: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.fragments.len() == self.count as usize
    }

    fn assemble(&mut self) -> Result<Vec<u8>, FragmentationError> {
        let mut assembled = Vec::with_capacity(self.total_size as usize);
        for i in 0..self.count {
            let part = self
                .fragments
                .remove(&i)
                .ok_or(FragmentationError::IndexOutOfRange {
                    index: i,
                    total: self.count,
                })?;
            assembled.extend_from_slice(&part);
        }
        if assembled.len() != self.total_size as usize
            || calculate_checksum(&assembled) != self.checksum
        {
            return Err(FragmentationError::ChecksumFailed);
        }
        Ok(assembled)
    }
}

/// Reassembles fragmented messages per sending device
#[derive(Debug)]
pub struct MessageReassembler {
    states: HashMap<(DeviceId, MessageId), ReassemblyState>,
    total_memory_used: usize,
    memory_limit: usize,
    timeout: Duration,
}

impl MessageReassembler {
    pub fn new(memory_limit: usize, timeout: Duration) -> Self {
        Self {
            states: HashMap::new(),
            total_memory_used: 0,
            memory_limit,
            timeout,
        }
    }

    /// Process a fragment, returning the message once it is complete
    pub fn process(
        &mut self,
        source: DeviceId,
        header: FragmentHeader,
        data: Vec<u8>,
        now: Timestamp,
    ) -> Result<Option<Reassembled>, FragmentationError> {
        if header.count == 0 || header.index >= header.count {
            return Err(FragmentationError::IndexOutOfRange {
                index: header.index,
                total: header.count,
            });
        }

        if !header.is_fragmented() {
            if data.len() != header.total_size as usize || calculate_checksum(&data) != header.checksum {
                return Err(FragmentationError::ChecksumFailed);
            }
            return Ok(Some(Reassembled {
                message_id: header.message_id,
                data,
                required_fragmentation: false,
            }));
        }

        if header.total_size as usize > self.memory_limit {
            return Err(FragmentationError::MemoryLimit {
                limit: self.memory_limit,
            });
        }

        let key = (source, header.message_id);
        if !self.states.contains_key(&key) {
            while self.states.len() >= MAX_CONCURRENT_REASSEMBLIES {
                if !self.evict_oldest() {
                    break;
                }
            }
            while self.total_memory_used + data.len() > self.memory_limit {
                if !self.evict_oldest() {
                    return Err(FragmentationError::MemoryLimit {
                        limit: self.memory_limit,
                    });
                }
            }
            self.states.insert(key, ReassemblyState::new(&header, now));
        }

        let Some(state) = self.states.get_mut(&key) else {
            return Ok(None);
        };
        if state.count != header.count
            || state.total_size != header.total_size
            || state.checksum != header.checksum
        {
            return Err(FragmentationError::MetadataMismatch {
                message_id: header.message_id.value(),
            });
        }
        if state.fragments.contains_key(&header.index) {
            // Retransmitted copy of a fragment we already hold
            return Ok(None);
        }

        state.memory_used += data.len();
        self.total_memory_used += data.len();
        state.fragments.insert(header.index, data);

        if !state.is_complete() {
            return Ok(None);
        }

        let Some(mut state) = self.states.remove(&key) else {
            return Ok(None);
        };
        self.total_memory_used = self.total_memory_used.saturating_sub(state.memory_used);
        let data = state.assemble()?;
        Ok(Some(Reassembled {
            message_id: header.message_id,
            data,
            required_fragmentation: true,
        }))
    }

    /// Drop partial messages older than the reassembly timeout
    pub fn expire(&mut self, now: Timestamp) -> usize {
        let timeout = self.timeout;
        let before = self.states.len();
        let mut freed = 0;
        self.states.retain(|_, state| {
            let keep = now.duration_since(state.first_received) <= timeout;
            if !keep {
                freed += state.memory_used;
            }
            keep
        });
        self.total_memory_used = self.total_memory_used.saturating_sub(freed);
        before - self.states.len()
    }

    /// Drop every partial message from a device that left
    pub fn forget_source(&mut self, source: DeviceId) {
        let mut freed = 0;
        self.states.retain(|(device, _), state| {
            let keep = *device != source;
            if !keep {
                freed += state.memory_used;
            }
            keep
        });
        self.total_memory_used = self.total_memory_used.saturating_sub(freed);
    }

    pub fn pending(&self) -> usize {
        self.states.len()
    }

    pub fn memory_used(&self) -> usize {
        self.total_memory_used
    }

    fn evict_oldest(&mut self) -> bool {
        let oldest = self
            .states
            .iter()
            .min_by_key(|(_, state)| state.first_received)
            .map(|(key, _)| *key);
        match oldest {
            Some(key) => {
                if let Some(state) = self.states.remove(&key) {
                    self.total_memory_used = self.total_memory_used.saturating_sub(state.memory_used);
                }
                true
            }
            None => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn reassembler() -> MessageReassembler {
        MessageReassembler::new(1024 * 1024, Duration::from_secs(30))
    }

    #[test]
    fn test_small_message_is_single_fragment() {
        let fragments = fragment_message(MessageId::new(1), b"hello", 64).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(!fragments[0].header.is_fragmented());

        let mut reassembler = reassembler();
        let fragment = fragments.into_iter().next().unwrap();
        let done = reassembler
            .process(DeviceId::random(), fragment.header, fragment.data, Timestamp::new(0))
            .unwrap()
            .unwrap();
        assert_eq!(done.data, b"hello");
        assert!(!done.required_fragmentation);
    }

    #[test]
    fn test_out_of_order_reassembly_is_atomic() {
        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let mut fragments = fragment_message(MessageId::new(7), &data, 64).unwrap();
        assert_eq!(fragments.len(), 4);
        fragments.reverse();

        let source = DeviceId::random();
        let mut reassembler = reassembler();
        let last = fragments.pop().unwrap();
        for fragment in fragments {
            let result = reassembler
                .process(source, fragment.header, fragment.data, Timestamp::new(0))
                .unwrap();
            assert!(result.is_none());
        }
        let done = reassembler
            .process(source, last.header, last.data, Timestamp::new(1))
            .unwrap()
            .unwrap();
        assert_eq!(done.data, data);
        assert!(done.required_fragmentation);
        assert_eq!(reassembler.pending(), 0);
        assert_eq!(reassembler.memory_used(), 0);
    }

    #[test]
    fn test_duplicate_fragment_is_ignored() {
        let data = vec![9u8; 130];
        let fragments = fragment_message(MessageId::new(3), &data, 64).unwrap();
        let source = DeviceId::random();
        let mut reassembler = reassembler();
        let first = fragments[0].clone();
        assert!(reassembler
            .process(source, first.header, first.data.clone(), Timestamp::new(0))
            .unwrap()
            .is_none());
        assert!(reassembler
            .process(source, first.header, first.data, Timestamp::new(0))
            .unwrap()
            .is_none());
        assert_eq!(reassembler.memory_used(), 64);
    }

    #[test]
    fn test_expired_partial_messages_are_dropped() {
        let data = vec![1u8; 100];
        let fragments = fragment_message(MessageId::new(4), &data, 64).unwrap();
        let mut reassembler = MessageReassembler::new(1024, Duration::from_millis(100));
        let first = fragments[0].clone();
        reassembler
            .process(DeviceId::random(), first.header, first.data, Timestamp::new(0))
            .unwrap();
        assert_eq!(reassembler.expire(Timestamp::new(50)), 0);
        assert_eq!(reassembler.expire(Timestamp::new(500)), 1);
        assert_eq!(reassembler.memory_used(), 0);
    }

    #[test]
    fn test_corrupted_fragment_fails_checksum() {
        let data = vec![5u8; 100];
        let mut fragments = fragment_message(MessageId::new(5), &data, 64).unwrap();
        fragments[1].data[0] ^= 0xff;
        let source = DeviceId::random();
        let mut reassembler = reassembler();
        let mut result = Ok(None);
        for fragment in fragments {
            result = reassembler.process(source, fragment.header, fragment.data, Timestamp::new(0));
        }
        assert_eq!(result, Err(FragmentationError::ChecksumFailed));
    }
}
