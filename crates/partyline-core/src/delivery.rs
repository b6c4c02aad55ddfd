//! Guaranteed delivery tracking
//!
//! Every guaranteed fragment sent to a device is tracked until that device
//! acknowledges it. Unacknowledged fragments are retransmitted on the
//! configured interval; a fragment that exhausts its transmission attempts
//! marks its destination device as failed, which the session layer treats
//! as fatal for the connection.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::config::DeliveryConfig;
use crate::types::{DeviceId, MessageId, Timestamp};

/// Identity of one fragment in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentKey {
    pub message_id: MessageId,
    pub index: u16,
}

impl FragmentKey {
    pub fn new(message_id: MessageId, index: u16) -> Self {
        Self { message_id, index }
    }
}

// ----------------------------------------------------------------------------
// Tracked Fragment
// ----------------------------------------------------------------------------

/// A fragment awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct TrackedFragment<F> {
    pub device: DeviceId,
    pub key: FragmentKey,
    /// Frame to resend
    pub frame: F,
    /// Transmissions so far, including the first
    pub transmissions: u32,
    pub first_sent: Timestamp,
    pub next_retry: Timestamp,
}

/// Work produced by one poll of the tracker
#[derive(Debug)]
pub struct RetransmitPoll<F> {
    /// Frames to send again
    pub due: Vec<(DeviceId, F)>,
    /// Devices that failed to acknowledge within the attempt limit
    pub failed: Vec<DeviceId>,
}

// ----------------------------------------------------------------------------
// Delivery Tracker
// ----------------------------------------------------------------------------

/// Tracks guaranteed fragments and schedules their retransmission
#[derive(Debug)]
pub struct DeliveryTracker<F> {
    config: DeliveryConfig,
    in_flight: HashMap<(DeviceId, FragmentKey), TrackedFragment<F>>,
    retransmissions: u64,
    acknowledged: u64,
}

impl<F: Clone> DeliveryTracker<F> {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            in_flight: HashMap::new(),
            retransmissions: 0,
            acknowledged: 0,
        }
    }

    /// Start tracking a fragment that was just transmitted for the first time
    pub fn track(&mut self, device: DeviceId, key: FragmentKey, frame: F, now: Timestamp) {
        let next_retry = now + self.config.retransmit_delay(1);
        self.in_flight.insert(
            (device, key),
            TrackedFragment {
                device,
                key,
                frame,
                transmissions: 1,
                first_sent: now,
                next_retry,
            },
        );
    }

    /// Record an acknowledgment; returns whether the fragment was in flight
    pub fn acknowledge(&mut self, device: DeviceId, key: FragmentKey) -> bool {
        let known = self.in_flight.remove(&(device, key)).is_some();
        if known {
            self.acknowledged += 1;
        }
        known
    }

    /// Collect retransmissions due at `now` and devices that exhausted their attempts
    pub fn poll(&mut self, now: Timestamp) -> RetransmitPoll<F> {
        let mut due = Vec::new();
        let mut failed: Vec<DeviceId> = Vec::new();
        let max_attempts = self.config.max_transmission_attempts;

        for tracked in self.in_flight.values_mut() {
            if !tracked.next_retry.has_passed(now) {
                continue;
            }
            if tracked.transmissions >= max_attempts {
                if !failed.contains(&tracked.device) {
                    failed.push(tracked.device);
                }
                continue;
            }
            tracked.transmissions += 1;
            tracked.next_retry = now + self.config.retransmit_delay(tracked.transmissions);
            due.push((tracked.device, tracked.frame.clone()));
        }
        self.retransmissions += due.len() as u64;

        for device in &failed {
            self.forget_device(*device);
        }
        RetransmitPoll { due, failed }
    }

    /// Stop tracking everything sent to a device
    pub fn forget_device(&mut self, device: DeviceId) {
        self.in_flight.retain(|(d, _), _| *d != device);
    }

    /// Stop tracking every fragment of a message
    pub fn forget_message(&mut self, message_id: MessageId) {
        self.in_flight.retain(|(_, key), _| key.message_id != message_id);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }
}
