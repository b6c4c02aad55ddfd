//! Invitation identifiers and configuration

use core::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{PartyError, Result};
use crate::types::EntityId;

/// Maximum length of an invitation identifier
pub const MAX_INVITATION_ID_LEN: usize = 127;

/// Maximum number of entity ids on an invitation allow-list
pub const MAX_INVITATION_ENTITY_IDS: usize = 1024;

/// Identifier of an invitation: 1..=127 printable ASCII characters
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InvitationId(String);

impl InvitationId {
    pub fn new<T: Into<String>>(value: T) -> Result<Self> {
        let value = value.into();
        if value.is_empty() || value.len() > MAX_INVITATION_ID_LEN {
            return Err(PartyError::invalid_argument(format!(
                "invitation id must be 1..={} characters",
                MAX_INVITATION_ID_LEN
            )));
        }
        if !value.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
            return Err(PartyError::invalid_argument(
                "invitation id must be printable ASCII",
            ));
        }
        Ok(Self(value))
    }

    /// Generate a fresh identifier (32 lowercase hex characters)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvitationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who may revoke an invitation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InvitationRevocability {
    /// Only the creating user
    #[default]
    Creator,
    /// Any authenticated user
    Anyone,
}

/// Caller-supplied invitation settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InvitationConfiguration {
    /// Identifier to use; generated when absent
    pub identifier: Option<InvitationId>,
    pub revocability: InvitationRevocability,
    /// Entities allowed to use the invitation; empty allows anyone
    pub entity_ids: Vec<EntityId>,
}

impl InvitationConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.entity_ids.len() > MAX_INVITATION_ENTITY_IDS {
            return Err(PartyError::limit_exceeded(
                "invitation entity id",
                MAX_INVITATION_ENTITY_IDS,
            ));
        }
        Ok(())
    }

    /// Whether `entity` may authenticate with this invitation
    pub fn admits(&self, entity: &EntityId) -> bool {
        self.entity_ids.is_empty() || self.entity_ids.contains(entity)
    }
}

/// An invitation as applied to a network: the identifier is always resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedInvitation {
    pub identifier: InvitationId,
    pub revocability: InvitationRevocability,
    pub entity_ids: Vec<EntityId>,
}

impl AppliedInvitation {
    /// Resolve a configuration, generating an identifier when none is given
    pub fn resolve(config: &InvitationConfiguration) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            identifier: config.identifier.clone().unwrap_or_else(InvitationId::generate),
            revocability: config.revocability,
            entity_ids: config.entity_ids.clone(),
        })
    }

    pub fn admits(&self, entity: &EntityId) -> bool {
        self.entity_ids.is_empty() || self.entity_ids.contains(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_hex() {
        let id = InvitationId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_ne!(id, InvitationId::generate());
    }

    #[test]
    fn test_id_bounds() {
        assert!(InvitationId::new("lobby 1").is_ok());
        assert!(InvitationId::new("").is_err());
        assert!(InvitationId::new("x".repeat(MAX_INVITATION_ID_LEN)).is_ok());
        assert!(InvitationId::new("x".repeat(MAX_INVITATION_ID_LEN + 1)).is_err());
        assert!(InvitationId::new("tab\there").is_err());
    }

    #[test]
    fn test_allow_list() {
        let alice = EntityId::new("alice").unwrap();
        let bob = EntityId::new("bob").unwrap();
        let open = AppliedInvitation::resolve(&InvitationConfiguration::default()).unwrap();
        assert!(open.admits(&bob));

        let closed = AppliedInvitation::resolve(&InvitationConfiguration {
            identifier: Some(InvitationId::new("vip").unwrap()),
            entity_ids: vec![alice.clone()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(closed.identifier.as_str(), "vip");
        assert!(closed.admits(&alice));
        assert!(!closed.admits(&bob));
    }
}
