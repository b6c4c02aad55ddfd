//! Message send options, queuing configuration and cancel filters

use serde::{Deserialize, Serialize};

use crate::errors::SendQueueError;

/// Lowest caller-visible queuing priority
pub const MIN_SEND_PRIORITY: i8 = -5;

/// Highest caller-visible queuing priority
pub const MAX_SEND_PRIORITY: i8 = 5;

/// Priority used when no queuing configuration is supplied
pub const DEFAULT_SEND_PRIORITY: i8 = 0;

/// Fixed priority of the internal chat queue
pub const CHAT_PRIORITY: i8 = -1;

// ----------------------------------------------------------------------------
// Send Options
// ----------------------------------------------------------------------------

/// Whether a message is retransmitted until acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    #[default]
    BestEffort,
    Guaranteed,
}

/// Whether a message is ordered relative to others in its sequence space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OrderingMode {
    #[default]
    Nonsequential,
    Sequential,
}

/// When a message may be bundled into a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CoalescingMode {
    /// Sent on the next tick together with whatever else is pending
    #[default]
    Opportunistic,
    /// Withheld until flushed, a packet fills, or a later message goes out
    UntilFlushed,
}

/// Tagged replacement for the send option bit flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SendMessageOptions {
    pub delivery: DeliveryMode,
    pub ordering: OrderingMode,
    pub coalescing: CoalescingMode,
}

impl SendMessageOptions {
    pub fn best_effort() -> Self {
        Self::default()
    }

    /// Guaranteed and sequential, the common choice for game state
    pub fn reliable_ordered() -> Self {
        Self {
            delivery: DeliveryMode::Guaranteed,
            ordering: OrderingMode::Sequential,
            coalescing: CoalescingMode::Opportunistic,
        }
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_ordering(mut self, ordering: OrderingMode) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_coalescing(mut self, coalescing: CoalescingMode) -> Self {
        self.coalescing = coalescing;
        self
    }

    pub fn is_guaranteed(&self) -> bool {
        self.delivery == DeliveryMode::Guaranteed
    }

    pub fn is_sequential(&self) -> bool {
        self.ordering == OrderingMode::Sequential
    }
}

/// Per-message queuing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueuingConfiguration {
    pub priority: i8,
    pub identity_for_cancel_filters: u32,
    /// Zero disables the timeout
    pub timeout_ms: u32,
}

impl Default for QueuingConfiguration {
    fn default() -> Self {
        Self {
            priority: DEFAULT_SEND_PRIORITY,
            identity_for_cancel_filters: 0,
            timeout_ms: 0,
        }
    }
}

impl QueuingConfiguration {
    pub fn validate(&self) -> Result<(), SendQueueError> {
        if !(MIN_SEND_PRIORITY..=MAX_SEND_PRIORITY).contains(&self.priority) {
            return Err(SendQueueError::PriorityOutOfRange {
                priority: self.priority,
                min: MIN_SEND_PRIORITY,
                max: MAX_SEND_PRIORITY,
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Cancel Filter
// ----------------------------------------------------------------------------

/// Selects queued messages by their cancel-filter identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelFilter {
    /// Matches every message
    None,
    /// Matches when `(identity & mask) == value`
    EqualsMatch { mask: u32, value: u32 },
    /// Matches when `(identity & mask) != value`
    NotEqualsMatch { mask: u32, value: u32 },
}

impl CancelFilter {
    pub fn matches(&self, identity: u32) -> bool {
        match *self {
            CancelFilter::None => true,
            CancelFilter::EqualsMatch { mask, value } => identity & mask == value,
            CancelFilter::NotEqualsMatch { mask, value } => identity & mask != value,
        }
    }
}

// ----------------------------------------------------------------------------
// Receive Flags
// ----------------------------------------------------------------------------

/// Facts about how a received message travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReceivedMessageFlags {
    pub required_fragmentation: bool,
    pub sequential: bool,
    pub guaranteed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_priority_range() {
        assert!(QueuingConfiguration::default().validate().is_ok());
        for priority in [MIN_SEND_PRIORITY, CHAT_PRIORITY, MAX_SEND_PRIORITY] {
            let config = QueuingConfiguration {
                priority,
                ..Default::default()
            };
            assert!(config.validate().is_ok());
        }
        let config = QueuingConfiguration {
            priority: 6,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SendQueueError::PriorityOutOfRange { priority: 6, .. })
        ));
    }

    #[test]
    fn test_cancel_filter_examples() {
        let equals = CancelFilter::EqualsMatch {
            mask: 0xff00,
            value: 0x1200,
        };
        assert!(equals.matches(0x12ab));
        assert!(!equals.matches(0x13ab));
        let not_equals = CancelFilter::NotEqualsMatch {
            mask: 0xff00,
            value: 0x1200,
        };
        assert!(!not_equals.matches(0x12ab));
        assert!(CancelFilter::None.matches(0xdead_beef));
    }

    proptest! {
        #[test]
        fn prop_equals_and_not_equals_partition(identity: u32, mask: u32, value: u32) {
            let equals = CancelFilter::EqualsMatch { mask, value };
            let not_equals = CancelFilter::NotEqualsMatch { mask, value };
            prop_assert_ne!(equals.matches(identity), not_equals.matches(identity));
            prop_assert_eq!(equals.matches(identity), identity & mask == value);
        }
    }
}
