//! Network descriptor and its serialized connect-blob
//!
//! A descriptor is handed out provisionally as soon as `create_new_network`
//! returns; it only becomes serializable once the relay has allocated the
//! network. The serialized form is URL-safe base64 (no padding) over a
//! bincode payload followed by a CRC32 of that payload.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::config::MAX_REGION_NAME_LEN;
use crate::errors::DescriptorError;
use crate::types::NetworkId;

/// Maximum length of a serialized descriptor string
pub const MAX_SERIALIZED_DESCRIPTOR_LEN: usize = 256;

/// Current descriptor encoding version
pub const DESCRIPTOR_VERSION: u8 = 1;

const CHECKSUM_LEN: usize = 4;

/// Whether the relay has finished allocating the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptorState {
    Provisional,
    Final,
}

/// Everything a device needs to connect to a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    network_id: NetworkId,
    region: String,
    relay_address: String,
    state: DescriptorState,
}

#[derive(Serialize, Deserialize)]
struct WireDescriptor {
    version: u8,
    network_id: NetworkId,
    region: String,
    relay_address: String,
}

impl NetworkDescriptor {
    /// Descriptor returned synchronously before the relay has allocated
    pub fn provisional(network_id: NetworkId) -> Self {
        Self {
            network_id,
            region: String::new(),
            relay_address: String::new(),
            state: DescriptorState::Provisional,
        }
    }

    /// Descriptor describing an allocated network
    pub fn finalized<R: Into<String>, A: Into<String>>(
        network_id: NetworkId,
        region: R,
        relay_address: A,
    ) -> Self {
        Self {
            network_id,
            region: region.into(),
            relay_address: relay_address.into(),
            state: DescriptorState::Final,
        }
    }

    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn relay_address(&self) -> &str {
        &self.relay_address
    }

    pub fn state(&self) -> DescriptorState {
        self.state
    }

    pub fn is_final(&self) -> bool {
        self.state == DescriptorState::Final
    }

    /// Encode into the connect-blob string
    pub fn serialize(&self) -> Result<String, DescriptorError> {
        if !self.is_final() {
            return Err(DescriptorError::NotFinal);
        }
        if self.region.len() > MAX_REGION_NAME_LEN {
            return Err(DescriptorError::Malformed {
                reason: format!("region name longer than {}", MAX_REGION_NAME_LEN),
            });
        }
        let wire = WireDescriptor {
            version: DESCRIPTOR_VERSION,
            network_id: self.network_id,
            region: self.region.clone(),
            relay_address: self.relay_address.clone(),
        };
        let mut bytes = bincode::serialize(&wire).map_err(|e| DescriptorError::Malformed {
            reason: e.to_string(),
        })?;
        let checksum = checksum(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());

        let encoded = URL_SAFE_NO_PAD.encode(&bytes);
        if encoded.len() > MAX_SERIALIZED_DESCRIPTOR_LEN {
            return Err(DescriptorError::TooLong {
                max: MAX_SERIALIZED_DESCRIPTOR_LEN,
                actual: encoded.len(),
            });
        }
        Ok(encoded)
    }

    /// Decode and validate a connect-blob string
    pub fn deserialize(serialized: &str) -> Result<Self, DescriptorError> {
        if serialized.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if serialized.len() > MAX_SERIALIZED_DESCRIPTOR_LEN {
            return Err(DescriptorError::TooLong {
                max: MAX_SERIALIZED_DESCRIPTOR_LEN,
                actual: serialized.len(),
            });
        }
        if !serialized
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(DescriptorError::InvalidAlphabet);
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(serialized)
            .map_err(|_| DescriptorError::InvalidAlphabet)?;
        if bytes.len() <= CHECKSUM_LEN {
            return Err(DescriptorError::Malformed {
                reason: "payload too short".into(),
            });
        }

        let (payload, trailer) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        let mut expected = [0u8; CHECKSUM_LEN];
        expected.copy_from_slice(trailer);
        if checksum(payload) != u32::from_le_bytes(expected) {
            return Err(DescriptorError::ChecksumMismatch);
        }

        // Version is the first byte of the bincode payload
        if payload[0] != DESCRIPTOR_VERSION {
            return Err(DescriptorError::UnsupportedVersion {
                version: payload[0],
            });
        }
        let wire: WireDescriptor =
            bincode::deserialize(payload).map_err(|e| DescriptorError::Malformed {
                reason: e.to_string(),
            })?;
        Ok(Self::finalized(wire.network_id, wire.region, wire.relay_address))
    }
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NetworkDescriptor {
        NetworkDescriptor::finalized(NetworkId::random(), "WestUS", "relay-3.example:3074")
    }

    #[test]
    fn test_serialize_round_trip() {
        let descriptor = sample();
        let encoded = descriptor.serialize().unwrap();
        assert!(encoded.len() <= MAX_SERIALIZED_DESCRIPTOR_LEN);
        assert_eq!(NetworkDescriptor::deserialize(&encoded).unwrap(), descriptor);
    }

    #[test]
    fn test_provisional_descriptor_is_not_serializable() {
        let descriptor = NetworkDescriptor::provisional(NetworkId::random());
        assert_eq!(descriptor.serialize(), Err(DescriptorError::NotFinal));
    }

    #[test]
    fn test_rejects_corruption() {
        let encoded = sample().serialize().unwrap();

        let mut flipped: Vec<char> = encoded.chars().collect();
        flipped[3] = if flipped[3] == 'A' { 'B' } else { 'A' };
        let flipped: String = flipped.into_iter().collect();
        assert!(NetworkDescriptor::deserialize(&flipped).is_err());

        assert_eq!(
            NetworkDescriptor::deserialize("abc+def"),
            Err(DescriptorError::InvalidAlphabet)
        );
        assert_eq!(NetworkDescriptor::deserialize(""), Err(DescriptorError::Empty));
        assert!(matches!(
            NetworkDescriptor::deserialize(&"A".repeat(MAX_SERIALIZED_DESCRIPTOR_LEN + 1)),
            Err(DescriptorError::TooLong { .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let descriptor = sample();
        let wire = WireDescriptor {
            version: 9,
            network_id: descriptor.network_id(),
            region: "X".into(),
            relay_address: "Y".into(),
        };
        let mut bytes = bincode::serialize(&wire).unwrap();
        let sum = checksum(&bytes);
        bytes.extend_from_slice(&sum.to_le_bytes());
        let encoded = URL_SAFE_NO_PAD.encode(&bytes);
        assert_eq!(
            NetworkDescriptor::deserialize(&encoded),
            Err(DescriptorError::UnsupportedVersion { version: 9 })
        );
    }
}
