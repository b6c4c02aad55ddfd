//! Scenario configuration
//!
//! A scenario file is TOML. Every table is optional; missing values fall
//! back to the built-in two-device scenario.
//!
//! ```toml
//! [scenario]
//! messages = 8
//! message_size = 2400
//! drop_every = 5
//!
//! [manager.session]
//! connected_grace_period_ms = 5000
//! endpoint_destroy_window_ms = 500
//! destroy_escalation_margin_ms = 250
//! ```

use std::path::Path;

use partyline_core::{ManagerConfig, MatchmakingConfig, NetworkConfiguration};
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub scenario: ScenarioSettings,
    pub network: NetworkConfiguration,
    pub manager: ManagerConfig,
    pub matchmaking: MatchmakingSettings,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            scenario: ScenarioSettings::default(),
            network: NetworkConfiguration::default(),
            manager: ManagerConfig::testing(),
            matchmaking: MatchmakingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioSettings {
    pub name: String,
    /// Entity names of the host and the guest
    pub host: String,
    pub guest: String,
    pub invitation: String,
    /// Simulated milliseconds per step
    pub step_ms: u64,
    /// Most steps any phase may take
    pub max_rounds: usize,
    pub messages: usize,
    pub message_size: usize,
    pub guaranteed: bool,
    /// Relay drops every Nth packet when set
    pub drop_every: Option<u32>,
    pub chat_text: Option<String>,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            name: "two-device-session".to_string(),
            host: "host-player".to_string(),
            guest: "guest-player".to_string(),
            invitation: "lobby".to_string(),
            step_ms: 10,
            max_rounds: 500,
            messages: 4,
            message_size: 3_000,
            guaranteed: true,
            drop_every: Some(7),
            chat_text: Some("good luck, have fun".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingSettings {
    /// Match the two players before they meet in a network
    pub enabled: bool,
    pub queue: String,
    pub timeout_secs: u32,
    pub service: MatchmakingConfig,
}

impl Default for MatchmakingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            queue: "duel".to_string(),
            timeout_secs: 60,
            service: MatchmakingConfig::default(),
        }
    }
}

impl ScenarioConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ScenarioConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.manager
            .validate()
            .map_err(|err| CliError::Config(err.to_string()))?;
        self.network
            .validate()
            .map_err(|err| CliError::Config(err.to_string()))?;
        if self.scenario.host == self.scenario.guest {
            return Err(CliError::Config("host and guest must be different entities".into()));
        }
        if self.scenario.step_ms == 0 || self.scenario.max_rounds == 0 {
            return Err(CliError::Config("step_ms and max_rounds must be positive".into()));
        }
        if self.matchmaking.enabled && self.matchmaking.queue.is_empty() {
            return Err(CliError::Config("matchmaking queue must be named".into()));
        }
        if self.scenario.message_size == 0 {
            return Err(CliError::Config("message_size must be positive".into()));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scenario_round_trips_through_toml() {
        let config = ScenarioConfig::default();
        config.validate().unwrap();
        let text = config.to_toml().unwrap();
        let parsed: ScenarioConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.scenario.messages, config.scenario.messages);
        assert_eq!(parsed.manager, config.manager);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let parsed: ScenarioConfig = toml::from_str("[scenario]\nmessages = 9\n").unwrap();
        assert_eq!(parsed.scenario.messages, 9);
        assert_eq!(parsed.scenario.host, "host-player");
        assert_eq!(parsed.network, NetworkConfiguration::default());
    }

    #[test]
    fn test_same_host_and_guest_is_rejected() {
        let mut config = ScenarioConfig::default();
        config.scenario.guest = config.scenario.host.clone();
        assert!(matches!(config.validate(), Err(CliError::Config(_))));
    }
}
