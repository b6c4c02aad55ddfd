//! partyline harness
//!
//! Deterministic stand-ins for the services a party manager depends on: an
//! in-memory relay with scripted faults, an in-memory matchmaker, a
//! hand-driven clock, and a lockstep driver that runs several managers
//! against them. Integration tests and the `partyline` scenario runner are
//! built on top of this crate.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod clock;
pub mod driver;
pub mod matchmaker;
pub mod relay;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use clock::ManualClock;
pub use driver::{process_changes, pump, ChangeRecord, Cluster, SimulatedDevice, DEFAULT_STEP};
pub use matchmaker::{MatchmakerLink, QueueRules, SimulatedMatchmaker, DEFAULT_MATCH_SIZE};
pub use relay::{PacketLoss, RelayLink, RelayStatistics, SimulatedRelay, SIMULATED_RELAY_ADDRESS};
