//! Configuration for partyline
//!
//! Every tunable timer, budget and limit lives here as a plain serde struct
//! with a `Default` and a few named presets. Durations are stored as integer
//! milliseconds so the structs read naturally from TOML.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

// ----------------------------------------------------------------------------
// Limits
// ----------------------------------------------------------------------------

/// Upper bound on `NetworkConfiguration::max_device_count`
pub const MAX_NETWORK_DEVICE_COUNT: u32 = 32;

/// Upper bound on `NetworkConfiguration::max_user_count`
pub const MAX_NETWORK_USER_COUNT: u32 = 128;

/// Upper bound on local users per device
pub const MAX_USERS_PER_DEVICE: u32 = 8;

/// Upper bound on `NetworkConfiguration::max_endpoints_per_device`
pub const MAX_ENDPOINTS_PER_DEVICE: u32 = 32;

/// Maximum length of a region name
pub const MAX_REGION_NAME_LEN: usize = 19;

/// Maximum number of UTF-8 bytes in a chat text message
pub const MAX_CHAT_TEXT_LEN: usize = 1024;

// ----------------------------------------------------------------------------
// Network Configuration
// ----------------------------------------------------------------------------

/// Direct peer connectivity options, as tagged flags rather than a bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectPeerConnectivity {
    /// Allow direct connections between devices of the same platform type
    pub same_platform_type: bool,
    /// Allow direct connections between devices of different platform types
    pub different_platform_type: bool,
    /// Allow direct connections regardless of entity login provider
    pub any_entity_login_provider: bool,
}

impl DirectPeerConnectivity {
    const SAME_PLATFORM: u32 = 0x1;
    const DIFFERENT_PLATFORM: u32 = 0x2;
    const ANY_LOGIN_PROVIDER: u32 = 0x4;

    /// No direct connectivity: everything travels through the relay
    pub fn none() -> Self {
        Self::default()
    }

    /// Every option enabled
    pub fn any() -> Self {
        Self {
            same_platform_type: true,
            different_platform_type: true,
            any_entity_login_provider: true,
        }
    }

    /// Mask form used by the local connectivity option
    pub fn to_mask(self) -> u32 {
        let mut mask = 0;
        if self.same_platform_type {
            mask |= Self::SAME_PLATFORM;
        }
        if self.different_platform_type {
            mask |= Self::DIFFERENT_PLATFORM;
        }
        if self.any_entity_login_provider {
            mask |= Self::ANY_LOGIN_PROVIDER;
        }
        mask
    }

    /// Parse a mask, rejecting unknown bits
    pub fn from_mask(mask: u32) -> Result<Self, ConfigError> {
        let known = Self::SAME_PLATFORM | Self::DIFFERENT_PLATFORM | Self::ANY_LOGIN_PROVIDER;
        if mask & !known != 0 {
            return Err(ConfigError::Invalid {
                reason: format!("unknown direct peer connectivity bits {:#x}", mask & !known),
            });
        }
        Ok(Self {
            same_platform_type: mask & Self::SAME_PLATFORM != 0,
            different_platform_type: mask & Self::DIFFERENT_PLATFORM != 0,
            any_entity_login_provider: mask & Self::ANY_LOGIN_PROVIDER != 0,
        })
    }
}

/// Immutable limits of a network, fixed at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfiguration {
    pub max_user_count: u32,
    pub max_device_count: u32,
    pub max_users_per_device: u32,
    pub max_devices_per_user: u32,
    pub max_endpoints_per_device: u32,
    pub direct_peer_connectivity: DirectPeerConnectivity,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            max_user_count: 8,
            max_device_count: 8,
            max_users_per_device: 1,
            max_devices_per_user: 1,
            max_endpoints_per_device: 4,
            direct_peer_connectivity: DirectPeerConnectivity::none(),
        }
    }
}

impl NetworkConfiguration {
    /// Validate every limit against its allowed range
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("max_device_count", self.max_device_count, 1, MAX_NETWORK_DEVICE_COUNT)?;
        check_range("max_user_count", self.max_user_count, 1, MAX_NETWORK_USER_COUNT)?;
        check_range(
            "max_users_per_device",
            self.max_users_per_device,
            1,
            MAX_USERS_PER_DEVICE,
        )?;
        check_range(
            "max_devices_per_user",
            self.max_devices_per_user,
            1,
            MAX_NETWORK_DEVICE_COUNT,
        )?;
        check_range(
            "max_endpoints_per_device",
            self.max_endpoints_per_device,
            1,
            MAX_ENDPOINTS_PER_DEVICE,
        )?;
        Ok(())
    }
}

fn check_range(field: &'static str, actual: u32, min: u32, max: u32) -> Result<(), ConfigError> {
    if actual < min || actual > max {
        return Err(ConfigError::OutOfRange {
            field,
            min: min as u64,
            max: max as u64,
            actual: actual as u64,
        });
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Session Timings
// ----------------------------------------------------------------------------

/// Timers of the network session state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTimings {
    /// How long a network may stay Connected without an authenticated user
    pub connected_grace_period_ms: u64,
    /// Time remote devices get to acknowledge an endpoint destruction
    pub endpoint_destroy_window_ms: u64,
    /// Extra time the destroying side waits past the window before completing
    pub destroy_escalation_margin_ms: u64,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            connected_grace_period_ms: 60_000,
            endpoint_destroy_window_ms: 2_000,
            destroy_escalation_margin_ms: 1_000,
        }
    }
}

impl SessionTimings {
    pub fn connected_grace_period(&self) -> Duration {
        Duration::from_millis(self.connected_grace_period_ms)
    }

    pub fn endpoint_destroy_window(&self) -> Duration {
        Duration::from_millis(self.endpoint_destroy_window_ms)
    }

    /// Deadline after which the destroying side completes on its own
    pub fn destroy_escalation(&self) -> Duration {
        Duration::from_millis(self.endpoint_destroy_window_ms + self.destroy_escalation_margin_ms)
    }
}

// ----------------------------------------------------------------------------
// Send Queue Configuration
// ----------------------------------------------------------------------------

/// Scheduling and packetization limits of the outbound message queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendQueueConfig {
    /// Largest fragment payload; larger messages are split
    pub max_fragment_payload: usize,
    /// Largest coalesced packet payload
    pub max_packet_payload: usize,
    /// Bytes the scheduler may emit per network tick
    pub send_budget_per_tick: usize,
    /// Largest message accepted by `send_message`
    pub max_message_size: usize,
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        Self {
            max_fragment_payload: 1_024,
            max_packet_payload: 1_200,
            send_budget_per_tick: 64 * 1024,
            max_message_size: 1024 * 1024,
        }
    }
}

impl SendQueueConfig {
    /// Small packets and a tight budget, which keeps queues short
    pub fn low_latency() -> Self {
        Self {
            max_fragment_payload: 512,
            max_packet_payload: 600,
            send_budget_per_tick: 16 * 1024,
            max_message_size: 256 * 1024,
        }
    }

    /// Configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            max_fragment_payload: 64,
            max_packet_payload: 256,
            send_budget_per_tick: 4 * 1024,
            max_message_size: 64 * 1024,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_fragment_payload == 0 {
            return Err(ConfigError::Invalid {
                reason: "max_fragment_payload must be positive".into(),
            });
        }
        if self.max_packet_payload < self.max_fragment_payload {
            return Err(ConfigError::Invalid {
                reason: "max_packet_payload must hold at least one full fragment".into(),
            });
        }
        if self.send_budget_per_tick == 0 {
            return Err(ConfigError::Invalid {
                reason: "send_budget_per_tick must be positive".into(),
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Delivery Configuration
// ----------------------------------------------------------------------------

/// Retransmission behaviour for guaranteed fragments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Delay before the first retransmission
    pub retransmit_interval_ms: u64,
    /// Transmissions (including the first) before the connection is declared failed
    pub max_transmission_attempts: u32,
    /// Multiplier applied to the interval after each retransmission
    pub backoff_multiplier: f32,
    /// Cap on the retransmission interval
    pub max_retransmit_interval_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retransmit_interval_ms: 200,
            max_transmission_attempts: 10,
            backoff_multiplier: 1.0,
            max_retransmit_interval_ms: 2_000,
        }
    }
}

impl DeliveryConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            retransmit_interval_ms: 50,
            max_transmission_attempts: 4,
            backoff_multiplier: 1.0,
            max_retransmit_interval_ms: 50,
        }
    }

    /// Interval to wait after the given number of transmissions
    pub fn retransmit_delay(&self, transmissions: u32) -> Duration {
        let exponent = transmissions.saturating_sub(1) as i32;
        let delay = self.retransmit_interval_ms as f32 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis((delay as u64).min(self.max_retransmit_interval_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_transmission_attempts == 0 {
            return Err(ConfigError::Invalid {
                reason: "max_transmission_attempts must be at least 1".into(),
            });
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                reason: "backoff_multiplier must be >= 1.0".into(),
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Receive Configuration
// ----------------------------------------------------------------------------

/// Bounds on receive-side buffering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// Out-of-order guaranteed messages held per sequence space
    pub reorder_buffer_limit: usize,
    /// Guaranteed fragment ids remembered for duplicate suppression
    pub duplicate_history: usize,
    /// Bytes held across all partial reassemblies
    pub reassembly_memory_limit: usize,
    /// Partial reassemblies older than this are dropped
    pub reassembly_timeout_ms: u64,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            reorder_buffer_limit: 256,
            duplicate_history: 4_096,
            reassembly_memory_limit: 8 * 1024 * 1024,
            reassembly_timeout_ms: 30_000,
        }
    }
}

// ----------------------------------------------------------------------------
// Worker Timings
// ----------------------------------------------------------------------------

/// Tick intervals of the audio and networking workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerTimings {
    pub audio_tick_ms: u64,
    pub network_tick_ms: u64,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        Self {
            audio_tick_ms: 40,
            network_tick_ms: 50,
        }
    }
}

impl WorkerTimings {
    pub fn audio_tick(&self) -> Duration {
        Duration::from_millis(self.audio_tick_ms)
    }

    pub fn network_tick(&self) -> Duration {
        Duration::from_millis(self.network_tick_ms)
    }
}

// ----------------------------------------------------------------------------
// Matchmaking Configuration
// ----------------------------------------------------------------------------

/// Minimum interval between ticket status polls
pub const MIN_STATUS_POLL_INTERVAL_MS: u64 = 1_000;

/// Client-side matchmaking behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    /// Interval between status polls of a waiting ticket
    pub status_poll_interval_ms: u64,
    /// Timeout used when a ticket does not specify one
    pub default_ticket_timeout_secs: u32,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            status_poll_interval_ms: 10_000,
            default_ticket_timeout_secs: 120,
        }
    }
}

impl MatchmakingConfig {
    /// Poll interval, clamped to the service minimum
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms.max(MIN_STATUS_POLL_INTERVAL_MS))
    }
}

// ----------------------------------------------------------------------------
// Manager Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of a party manager
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub session: SessionTimings,
    pub send_queue: SendQueueConfig,
    pub delivery: DeliveryConfig,
    pub receive: ReceiveConfig,
    pub workers: WorkerTimings,
}

impl ManagerConfig {
    /// Configuration optimized for tests: short timers, small fragments
    pub fn testing() -> Self {
        Self {
            session: SessionTimings {
                connected_grace_period_ms: 5_000,
                endpoint_destroy_window_ms: 500,
                destroy_escalation_margin_ms: 250,
            },
            send_queue: SendQueueConfig::testing(),
            delivery: DeliveryConfig::testing(),
            receive: ReceiveConfig {
                reorder_buffer_limit: 32,
                duplicate_history: 512,
                reassembly_memory_limit: 1024 * 1024,
                reassembly_timeout_ms: 5_000,
            },
            workers: WorkerTimings {
                audio_tick_ms: 10,
                network_tick_ms: 10,
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.send_queue.validate()?;
        self.delivery.validate()?;
        if self.workers.audio_tick_ms == 0 || self.workers.network_tick_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: "worker tick intervals must be positive".into(),
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let config = ManagerConfig::default();
        assert_eq!(config.session.connected_grace_period(), Duration::from_secs(60));
        assert_eq!(config.session.endpoint_destroy_window(), Duration::from_secs(2));
        assert_eq!(config.session.destroy_escalation(), Duration::from_secs(3));
        assert_eq!(config.delivery.retransmit_interval_ms, 200);
        assert_eq!(config.delivery.max_transmission_attempts, 10);
        assert_eq!(config.workers.audio_tick(), Duration::from_millis(40));
        assert_eq!(config.workers.network_tick(), Duration::from_millis(50));
        assert!(config.validate().is_ok());
        assert!(ManagerConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_network_configuration_ranges() {
        assert!(NetworkConfiguration::default().validate().is_ok());

        let config = NetworkConfiguration {
            max_device_count: MAX_NETWORK_DEVICE_COUNT + 1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "max_device_count", .. })
        ));

        let config = NetworkConfiguration {
            max_user_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connectivity_mask() {
        let any = DirectPeerConnectivity::any();
        assert_eq!(DirectPeerConnectivity::from_mask(any.to_mask()).unwrap(), any);
        assert_eq!(DirectPeerConnectivity::none().to_mask(), 0);
        assert!(DirectPeerConnectivity::from_mask(0x80).is_err());
    }

    #[test]
    fn test_retransmit_delay_backoff() {
        let config = DeliveryConfig {
            retransmit_interval_ms: 100,
            backoff_multiplier: 2.0,
            max_retransmit_interval_ms: 350,
            ..Default::default()
        };
        assert_eq!(config.retransmit_delay(1), Duration::from_millis(100));
        assert_eq!(config.retransmit_delay(2), Duration::from_millis(200));
        assert_eq!(config.retransmit_delay(3), Duration::from_millis(350));
    }

    #[test]
    fn test_status_poll_interval_floor() {
        let config = MatchmakingConfig {
            status_poll_interval_ms: 10,
            ..Default::default()
        };
        assert_eq!(config.status_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_manager_config_from_partial_toml_like_json() {
        let config: ManagerConfig =
            serde_json::from_str(r#"{"workers":{"audio_tick_ms":20,"network_tick_ms":25}}"#)
                .unwrap();
        assert_eq!(config.workers.audio_tick_ms, 20);
        assert_eq!(config.session, SessionTimings::default());
    }
}
