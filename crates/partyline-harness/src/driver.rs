//! Lockstep driver for several managers sharing one relay
//!
//! A [`Cluster`] owns a [`SimulatedRelay`], a [`ManualClock`] and one
//! manually driven [`PartyManager`] per simulated device. Each
//! [`Cluster::step`] ticks every manager, drains its state changes and then
//! moves the clock, so a scenario replays identically every run.

use std::sync::Arc;
use std::time::Duration;

use partyline_core::{
    DeviceId, Handle, ManagerConfig, Outcome, PartyError, Result, StateChangePayload, TimeSource,
};
use partyline_runtime::{Network, PartyManager, StateChangeKind, ThreadId};
use tracing::{debug, trace};

use crate::clock::ManualClock;
use crate::relay::{RelayLink, SimulatedRelay};

/// Tick used by [`Cluster::settle`]
pub const DEFAULT_STEP: Duration = Duration::from_millis(10);

// ----------------------------------------------------------------------------
// Change Records
// ----------------------------------------------------------------------------

/// What one published state change looked like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub device: usize,
    pub kind: &'static str,
    pub outcome: Option<Outcome>,
    pub network: Option<Handle<Network>>,
}

impl ChangeRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome.map_or(true, |outcome| outcome.is_success())
    }
}

/// Publish the manager's pending changes, show each to `inspect`, and hand
/// the batch back
pub fn process_changes<F>(manager: &PartyManager, mut inspect: F) -> Result<usize>
where
    F: FnMut(&StateChangeKind),
{
    let changes = manager.start_processing_state_changes()?;
    let count = changes.len();
    for change in &changes {
        inspect(change.payload());
    }
    manager.finish_processing_state_changes(changes)?;
    Ok(count)
}

/// Tick both manual workers once
pub fn pump(manager: &PartyManager) -> Result<()> {
    manager.do_work(ThreadId::Networking)?;
    manager.do_work(ThreadId::Audio)
}

// ----------------------------------------------------------------------------
// Simulated Device
// ----------------------------------------------------------------------------

pub struct SimulatedDevice {
    pub name: String,
    pub manager: PartyManager,
    link: Arc<RelayLink>,
}

impl SimulatedDevice {
    pub fn device_id(&self) -> DeviceId {
        self.link.device()
    }
}

// ----------------------------------------------------------------------------
// Cluster
// ----------------------------------------------------------------------------

pub struct Cluster {
    pub relay: SimulatedRelay,
    pub clock: Arc<ManualClock>,
    config: ManagerConfig,
    devices: Vec<SimulatedDevice>,
    history: Vec<ChangeRecord>,
}

impl Cluster {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_relay(SimulatedRelay::new(), config)
    }

    pub fn with_relay(relay: SimulatedRelay, config: ManagerConfig) -> Self {
        Self {
            relay,
            clock: Arc::new(ManualClock::starting_at(1_000)),
            config,
            devices: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Add an initialized device whose workers are both manual
    pub fn add_device(&mut self, name: impl Into<String>) -> Result<usize> {
        let name = name.into();
        let device_id = DeviceId::random();
        let link = self.relay.link(device_id);
        let clock: Arc<dyn TimeSource> = self.clock.clone();
        let mut manager = PartyManager::builder(link.clone())
            .with_config(self.config.clone())
            .with_time_source(clock)
            .with_device_id(device_id)
            .manual()
            .build()?;
        manager.initialize()?;
        debug!(device = %name, id = %device_id, "simulated device added");
        self.devices.push(SimulatedDevice { name, manager, link });
        Ok(self.devices.len() - 1)
    }

    pub fn device(&self, index: usize) -> Result<&SimulatedDevice> {
        self.devices
            .get(index)
            .ok_or_else(|| PartyError::invalid_argument(format!("no simulated device {index}")))
    }

    pub fn manager(&self, index: usize) -> Result<&PartyManager> {
        Ok(&self.device(index)?.manager)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Tick every device, collect what it published, then advance the clock
    pub fn step(&mut self, tick: Duration) -> Result<Vec<ChangeRecord>> {
        self.step_with(tick, |_, _| {})
    }

    /// Like [`Cluster::step`], also showing each full payload to `inspect`
    /// before it is handed back
    pub fn step_with<F>(&mut self, tick: Duration, mut inspect: F) -> Result<Vec<ChangeRecord>>
    where
        F: FnMut(usize, &StateChangeKind),
    {
        let mut records = Vec::new();
        for (index, device) in self.devices.iter().enumerate() {
            if !device.manager.is_initialized() {
                continue;
            }
            pump(&device.manager)?;
            process_changes(&device.manager, |change| {
                trace!(device = %device.name, kind = change.kind_name(), "state change");
                inspect(index, change);
                records.push(ChangeRecord {
                    device: index,
                    kind: change.kind_name(),
                    outcome: change.outcome(),
                    network: change.network(),
                });
            })?;
        }
        self.clock.advance(tick);
        self.history.extend(records.iter().cloned());
        Ok(records)
    }

    /// Step `rounds` times with the default tick
    pub fn settle(&mut self, rounds: usize) -> Result<Vec<ChangeRecord>> {
        let mut records = Vec::new();
        for _ in 0..rounds {
            records.extend(self.step(DEFAULT_STEP)?);
        }
        Ok(records)
    }

    /// Step until `done` holds for a record, giving up after `max_rounds`
    pub fn run_until<F>(&mut self, max_rounds: usize, mut done: F) -> Result<ChangeRecord>
    where
        F: FnMut(&ChangeRecord) -> bool,
    {
        for _ in 0..max_rounds {
            if let Some(record) = self.step(DEFAULT_STEP)?.into_iter().find(|r| done(r)) {
                return Ok(record);
            }
        }
        Err(PartyError::invalid_state(
            "running",
            format!("condition not reached within {max_rounds} rounds"),
        ))
    }

    /// Every record published since the cluster started
    pub fn history(&self) -> &[ChangeRecord] {
        &self.history
    }

    /// Kinds published by one device, in order
    pub fn kinds_for(&self, device: usize) -> Vec<&'static str> {
        self.history
            .iter()
            .filter(|r| r.device == device)
            .map(|r| r.kind)
            .collect()
    }

    /// Clean up one device as if its process shut down
    pub fn shutdown_device(&mut self, index: usize) -> Result<()> {
        let device = self
            .devices
            .get_mut(index)
            .ok_or_else(|| PartyError::invalid_argument(format!("no simulated device {index}")))?;
        device.manager.cleanup()
    }
}
