//! Error types for partyline
//!
//! Synchronous failures are reported as `PartyError`, which unifies the
//! narrower errors raised by the handle table, descriptor codec, send queue,
//! fragmentation and configuration layers. Asynchronous failures never use
//! these types: they travel on state changes as a [`StateChangeResult`] plus
//! an opaque diagnostic code.

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Handle resolution failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("Stale {kind} handle (slot {index}, generation {generation})")]
    Stale {
        kind: &'static str,
        index: u32,
        generation: u32,
    },
    #[error("{kind} handle belongs to a different manager")]
    Foreign { kind: &'static str },
    #[error("{kind} handle still has {refs} outstanding state change reference(s)")]
    OutstandingReferences { kind: &'static str, refs: u32 },
}

/// Network descriptor encoding and decoding failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("Network descriptor is not final yet")]
    NotFinal,
    #[error("Serialized descriptor length {actual} exceeds {max}")]
    TooLong { max: usize, actual: usize },
    #[error("Serialized descriptor is empty")]
    Empty,
    #[error("Serialized descriptor contains characters outside the URL-safe alphabet")]
    InvalidAlphabet,
    #[error("Descriptor checksum mismatch")]
    ChecksumMismatch,
    #[error("Unsupported descriptor version {version}")]
    UnsupportedVersion { version: u8 },
    #[error("Malformed descriptor: {reason}")]
    Malformed { reason: String },
}

/// Message send queue failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendQueueError {
    #[error("Message priority {priority} outside [{min}, {max}]")]
    PriorityOutOfRange { priority: i8, min: i8, max: i8 },
    #[error("Message has no data segments")]
    NoData,
    #[error("Message of {size} bytes exceeds the maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("No send queue for source {source_key}")]
    UnknownSource { source_key: String },
    #[error("Send queue for {source_key} already exists")]
    DuplicateSource { source_key: String },
}

/// Fragmentation and reassembly failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentationError {
    #[error("Fragment payload size {size} is too small")]
    FragmentSizeTooSmall { size: usize },
    #[error("Message needs {needed} fragments, the maximum is {max}")]
    TooManyFragments { needed: usize, max: usize },
    #[error("Fragment metadata does not match message {message_id}")]
    MetadataMismatch { message_id: u64 },
    #[error("Fragment index {index} out of range for {total} fragments")]
    IndexOutOfRange { index: u16, total: u16 },
    #[error("Reassembled message failed checksum verification")]
    ChecksumFailed,
    #[error("Reassembly memory limit of {limit} bytes reached")]
    MemoryLimit { limit: usize },
}

/// Configuration validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be in [{min}, {max}], got {actual}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        actual: u64,
    },
    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Synchronous error returned by every public operation
#[derive(Debug, thiserror::Error)]
pub enum PartyError {
    #[error("Invalid handle: {0}")]
    InvalidHandle(#[from] HandleError),
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },
    #[error("Operation not allowed in state {state}: {reason}")]
    InvalidState { state: String, reason: String },
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("Send queue error: {0}")]
    SendQueue(#[from] SendQueueError),
    #[error("Fragmentation error: {0}")]
    Fragmentation(#[from] FragmentationError),
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("{what} limit of {limit} reached")]
    LimitExceeded { what: &'static str, limit: usize },
    #[error("State change {token} is not outstanding")]
    UnknownStateChange { token: u64 },
    #[error("Manager is not initialized")]
    NotInitialized,
    #[error("Manager is already initialized")]
    AlreadyInitialized,
    #[error("{thread} worker is in Automatic mode; do_work is not permitted")]
    AutomaticWorkMode { thread: String },
    #[error("Duplicate identifier: {id}")]
    Duplicate { id: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl PartyError {
    /// Create an invalid argument error with a reason
    pub fn invalid_argument<T: Into<String>>(reason: T) -> Self {
        PartyError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>, R: Into<String>>(state: S, reason: R) -> Self {
        PartyError::InvalidState {
            state: state.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        PartyError::Configuration(ConfigError::Invalid {
            reason: reason.into(),
        })
    }

    /// Create a limit error
    pub fn limit_exceeded(what: &'static str, limit: usize) -> Self {
        PartyError::LimitExceeded { what, limit }
    }

    /// Create a duplicate identifier error
    pub fn duplicate<T: Into<String>>(id: T) -> Self {
        PartyError::Duplicate { id: id.into() }
    }
}

// ----------------------------------------------------------------------------
// Asynchronous Results
// ----------------------------------------------------------------------------

/// Outcome of an asynchronous operation, carried by completion state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateChangeResult {
    Succeeded,
    UnknownError,
    CanceledByTitle,
    InternetConnectivityError,
    PartyServiceError,
    NoServersAvailable,
    UserNotAuthorized,
    UserCreateNetworkThrottled,
    FailedToBindToLocalUdpSocket,
    NetworkLimitReached,
    NetworkNoLongerExists,
    VersionMismatch,
    LeaveNetworkCalled,
    MatchmakingTimeout,
}

impl StateChangeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StateChangeResult::Succeeded)
    }

    /// Default diagnostic code reported alongside this result when the relay
    /// does not supply one
    pub fn default_diagnostic(&self) -> u32 {
        match self {
            StateChangeResult::Succeeded => 0,
            StateChangeResult::UnknownError => 0x1001,
            StateChangeResult::CanceledByTitle => 0x1002,
            StateChangeResult::InternetConnectivityError => 0x1003,
            StateChangeResult::PartyServiceError => 0x1004,
            StateChangeResult::NoServersAvailable => 0x1005,
            StateChangeResult::UserNotAuthorized => 0x1006,
            StateChangeResult::UserCreateNetworkThrottled => 0x1007,
            StateChangeResult::FailedToBindToLocalUdpSocket => 0x1008,
            StateChangeResult::NetworkLimitReached => 0x1009,
            StateChangeResult::NetworkNoLongerExists => 0x100a,
            StateChangeResult::VersionMismatch => 0x100b,
            StateChangeResult::LeaveNetworkCalled => 0x100c,
            StateChangeResult::MatchmakingTimeout => 0x100d,
        }
    }
}

/// Result plus the opaque diagnostic code attached to a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub result: StateChangeResult,
    pub error_detail: u32,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            result: StateChangeResult::Succeeded,
            error_detail: 0,
        }
    }

    pub fn failure(result: StateChangeResult) -> Self {
        Self {
            result,
            error_detail: result.default_diagnostic(),
        }
    }

    pub fn with_detail(result: StateChangeResult, error_detail: u32) -> Self {
        Self {
            result,
            error_detail,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, PartyError>;
pub type PartyResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layered_errors_convert() {
        let err: PartyError = HandleError::Foreign { kind: "endpoint" }.into();
        assert!(matches!(err, PartyError::InvalidHandle(_)));
        assert!(err.to_string().contains("different manager"));

        let err: PartyError = DescriptorError::NotFinal.into();
        assert!(matches!(err, PartyError::Descriptor(DescriptorError::NotFinal)));
    }

    #[test]
    fn test_failure_outcome_carries_diagnostic() {
        let outcome = Outcome::failure(StateChangeResult::NetworkLimitReached);
        assert!(!outcome.is_success());
        assert_ne!(outcome.error_detail, 0);
        assert!(Outcome::success().is_success());
    }
}
