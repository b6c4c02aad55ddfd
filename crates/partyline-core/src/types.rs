//! Core identifier and time types for partyline
//!
//! Newtypes keep relay-assigned identifiers, external entity ids and
//! timestamps from being mixed up across the session engine.

use core::fmt;
use core::ops::{Add, Sub};
use core::str::FromStr;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::PartyError;

/// Maximum length of an external entity identifier
pub const MAX_ENTITY_ID_LEN: usize = 64;

// ----------------------------------------------------------------------------
// Device Identifier
// ----------------------------------------------------------------------------

/// Opaque network-scoped device identifier (16 random bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId([u8; 16]);

impl DeviceId {
    /// Create a device id from raw bytes
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random device id
    pub fn random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short form used in logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for DeviceId {
    type Err = PartyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| PartyError::invalid_argument("device id is not hex"))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| PartyError::invalid_argument("device id must be 16 bytes"))?;
        Ok(Self(bytes))
    }
}

// ----------------------------------------------------------------------------
// Entity Identifier
// ----------------------------------------------------------------------------

/// External identity of a user, as issued by the title's identity service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Validate and wrap an entity id
    pub fn new<T: Into<String>>(value: T) -> Result<Self, PartyError> {
        let value = value.into();
        if value.is_empty() || value.len() > MAX_ENTITY_ID_LEN {
            return Err(PartyError::invalid_argument(format!(
                "entity id must be 1..={} bytes",
                MAX_ENTITY_ID_LEN
            )));
        }
        if !value.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(PartyError::invalid_argument(
                "entity id must be printable ASCII",
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = PartyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ----------------------------------------------------------------------------
// Network and Endpoint Identifiers
// ----------------------------------------------------------------------------

/// Relay-assigned network identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkId(Uuid);

impl NetworkId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Network-unique numeric endpoint id, assigned once endpoint creation commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointId(u16);

impl EndpointId {
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network-wide identifier of a chat control
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChatControlId(u64);

impl ChatControlId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().as_u64_pair().0)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChatControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifier of a queued outbound message, unique per manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Correlates a relay request with its completion event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(u64);

impl OperationId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(other.as_millis() as u64))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Wall-clock now
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get duration since another timestamp (zero if `other` is later)
    pub fn duration_since(&self, other: Self) -> Duration {
        *self - other
    }

    /// Whether this deadline has been reached at `now`
    pub fn has_passed(&self, now: Timestamp) -> bool {
        now.0 >= self.0
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Source of timestamps for every timer in the engine
///
/// Grace periods, destroy windows, message timeouts, retransmission and
/// ticket deadlines all read the clock through this trait so that tests can
/// drive them deterministically.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Standard library implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_round_trips_through_hex() {
        let id = DeviceId::random();
        let parsed: DeviceId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_entity_id_validation() {
        assert!(EntityId::new("player-1").is_ok());
        assert!(EntityId::new("").is_err());
        assert!(EntityId::new("has space").is_err());
        assert!(EntityId::new("x".repeat(MAX_ENTITY_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let start = Timestamp::new(1_000);
        let later = start + Duration::from_millis(250);
        assert_eq!(later.as_millis(), 1_250);
        assert_eq!(later - start, Duration::from_millis(250));
        assert_eq!(start - later, Duration::ZERO);
        assert!(later.has_passed(Timestamp::new(1_250)));
        assert!(!later.has_passed(Timestamp::new(1_249)));
    }
}
