//! Runtime options settable before or after initialization
//!
//! Each option takes effect at its next lifecycle event, never
//! retroactively: the bind address at the next `initialize`, the
//! connectivity mask at the next `connect_to_network`, the text filter level
//! at the next chat control creation.

use std::net::SocketAddr;

use partyline_core::{DirectPeerConnectivity, PartyError, Result};
use serde::{Deserialize, Serialize};

use crate::entities::TextFilterLevel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartyOption {
    /// `host:port` the device binds its socket to; `None` picks any
    LocalUdpSocketBindAddress(Option<String>),
    LocalDeviceDirectPeerConnectivityOptionsMask(DirectPeerConnectivity),
    TextChatFilterLevel(TextFilterLevel),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartyOptionKind {
    LocalUdpSocketBindAddress,
    LocalDeviceDirectPeerConnectivityOptionsMask,
    TextChatFilterLevel,
}

impl PartyOption {
    pub fn kind(&self) -> PartyOptionKind {
        match self {
            PartyOption::LocalUdpSocketBindAddress(_) => PartyOptionKind::LocalUdpSocketBindAddress,
            PartyOption::LocalDeviceDirectPeerConnectivityOptionsMask(_) => {
                PartyOptionKind::LocalDeviceDirectPeerConnectivityOptionsMask
            }
            PartyOption::TextChatFilterLevel(_) => PartyOptionKind::TextChatFilterLevel,
        }
    }
}

/// Current value of every option
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyOptions {
    pub bind_address: Option<String>,
    pub connectivity: DirectPeerConnectivity,
    pub text_filter_level: TextFilterLevel,
}

impl PartyOptions {
    pub fn set(&mut self, option: PartyOption) -> Result<()> {
        match option {
            PartyOption::LocalUdpSocketBindAddress(address) => {
                if let Some(address) = &address {
                    address.parse::<SocketAddr>().map_err(|_| {
                        PartyError::invalid_argument(format!("invalid bind address: {address}"))
                    })?;
                }
                self.bind_address = address;
            }
            PartyOption::LocalDeviceDirectPeerConnectivityOptionsMask(mask) => {
                self.connectivity = mask;
            }
            PartyOption::TextChatFilterLevel(level) => self.text_filter_level = level,
        }
        Ok(())
    }

    pub fn get(&self, kind: PartyOptionKind) -> PartyOption {
        match kind {
            PartyOptionKind::LocalUdpSocketBindAddress => {
                PartyOption::LocalUdpSocketBindAddress(self.bind_address.clone())
            }
            PartyOptionKind::LocalDeviceDirectPeerConnectivityOptionsMask => {
                PartyOption::LocalDeviceDirectPeerConnectivityOptionsMask(self.connectivity)
            }
            PartyOptionKind::TextChatFilterLevel => {
                PartyOption::TextChatFilterLevel(self.text_filter_level)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address_must_parse() {
        let mut options = PartyOptions::default();
        assert!(options
            .set(PartyOption::LocalUdpSocketBindAddress(Some("not an address".into())))
            .is_err());
        options
            .set(PartyOption::LocalUdpSocketBindAddress(Some("0.0.0.0:3074".into())))
            .unwrap();
        assert_eq!(
            options.get(PartyOptionKind::LocalUdpSocketBindAddress),
            PartyOption::LocalUdpSocketBindAddress(Some("0.0.0.0:3074".into()))
        );
    }

    #[test]
    fn test_round_trip_each_kind() {
        let mut options = PartyOptions::default();
        let mask = PartyOption::LocalDeviceDirectPeerConnectivityOptionsMask(
            DirectPeerConnectivity::any(),
        );
        options.set(mask.clone()).unwrap();
        assert_eq!(options.get(mask.kind()), mask);

        let level = PartyOption::TextChatFilterLevel(TextFilterLevel::Mature);
        options.set(level.clone()).unwrap();
        assert_eq!(options.get(PartyOptionKind::TextChatFilterLevel), level);
    }
}
