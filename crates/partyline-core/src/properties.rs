//! Shared properties attached to networks, devices and endpoints

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{PartyError, Result};

/// Maximum length of a property key
pub const MAX_PROPERTY_KEY_LEN: usize = 32;

/// Maximum size of a property value
pub const MAX_PROPERTY_VALUE_LEN: usize = 1024;

/// Maximum number of keys in one property map
pub const MAX_PROPERTY_COUNT: usize = 64;

/// One key update: `None` deletes the key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyUpdate {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl PropertyUpdate {
    pub fn set<K: Into<String>, V: Into<Vec<u8>>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn remove<K: Into<String>>(key: K) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

/// String-keyed map of opaque byte values
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SharedProperties {
    values: BTreeMap<String, Vec<u8>>,
}

impl SharedProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a batch without applying it
    pub fn validate(&self, updates: &[PropertyUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Err(PartyError::invalid_argument("no property updates given"));
        }
        let mut resulting = self.values.len();
        for update in updates {
            if update.key.is_empty() || update.key.len() > MAX_PROPERTY_KEY_LEN {
                return Err(PartyError::invalid_argument(format!(
                    "property key must be 1..={} bytes",
                    MAX_PROPERTY_KEY_LEN
                )));
            }
            match &update.value {
                Some(value) if value.len() > MAX_PROPERTY_VALUE_LEN => {
                    return Err(PartyError::invalid_argument(format!(
                        "property value for '{}' exceeds {} bytes",
                        update.key, MAX_PROPERTY_VALUE_LEN
                    )));
                }
                Some(_) if !self.values.contains_key(&update.key) => resulting += 1,
                None if self.values.contains_key(&update.key) => {
                    resulting = resulting.saturating_sub(1)
                }
                _ => {}
            }
        }
        if resulting > MAX_PROPERTY_COUNT {
            return Err(PartyError::limit_exceeded("property", MAX_PROPERTY_COUNT));
        }
        Ok(())
    }

    /// Apply a batch, returning the keys whose value actually changed
    pub fn apply(&mut self, updates: &[PropertyUpdate]) -> Vec<String> {
        let mut changed = Vec::new();
        for update in updates {
            let did_change = match &update.value {
                Some(value) => self.values.insert(update.key.clone(), value.clone()).as_ref() != Some(value),
                None => self.values.remove(&update.key).is_some(),
            };
            if did_change && !changed.contains(&update.key) {
                changed.push(update.key.clone());
            }
        }
        changed
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.values.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_reports_changed_keys_only() {
        let mut props = SharedProperties::new();
        let changed = props.apply(&[
            PropertyUpdate::set("map", "dust2"),
            PropertyUpdate::set("mode", "ctf"),
        ]);
        assert_eq!(changed, vec!["map".to_string(), "mode".to_string()]);

        let changed = props.apply(&[
            PropertyUpdate::set("map", "dust2"),
            PropertyUpdate::remove("mode"),
            PropertyUpdate::remove("missing"),
        ]);
        assert_eq!(changed, vec!["mode".to_string()]);
        assert_eq!(props.get("map"), Some(&b"dust2"[..]));
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn test_validate_bounds() {
        let props = SharedProperties::new();
        assert!(props.validate(&[]).is_err());
        assert!(props
            .validate(&[PropertyUpdate::set("k".repeat(MAX_PROPERTY_KEY_LEN + 1), "v")])
            .is_err());
        assert!(props
            .validate(&[PropertyUpdate::set("k", vec![0u8; MAX_PROPERTY_VALUE_LEN + 1])])
            .is_err());
        let too_many: Vec<_> = (0..=MAX_PROPERTY_COUNT)
            .map(|i| PropertyUpdate::set(format!("k{i}"), "v"))
            .collect();
        assert!(props.validate(&too_many).is_err());
    }
}
