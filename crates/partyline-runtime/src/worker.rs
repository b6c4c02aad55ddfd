//! Audio and networking workers
//!
//! The engine is driven by two periodic ticks. In `Automatic` mode each tick
//! runs on a library-owned thread hosting a single-threaded tokio runtime;
//! in `Manual` mode the caller drives it through `PartyManager::do_work`.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use partyline_core::{PartyError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::engine::Engine;

// ----------------------------------------------------------------------------
// Thread Identity and Modes
// ----------------------------------------------------------------------------

/// The logical workers owned by a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadId {
    Audio,
    Networking,
}

impl ThreadId {
    pub const ALL: [ThreadId; 2] = [ThreadId::Audio, ThreadId::Networking];

    pub fn name(&self) -> &'static str {
        match self {
            ThreadId::Audio => "audio",
            ThreadId::Networking => "networking",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            ThreadId::Audio => 0,
            ThreadId::Networking => 1,
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkMode {
    #[default]
    Automatic,
    Manual,
}

/// Run one tick of the given worker
pub(crate) fn run_tick(engine: &Engine, thread: ThreadId) {
    match thread {
        ThreadId::Audio => engine.audio_tick(),
        ThreadId::Networking => engine.network_tick(),
    }
}

// ----------------------------------------------------------------------------
// Automatic Worker
// ----------------------------------------------------------------------------

/// A library-owned worker thread
pub(crate) struct WorkerHandle {
    thread: ThreadId,
    stop: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(thread: ThreadId, engine: Arc<Engine>, period: Duration) -> Result<Self> {
        let (stop, stop_rx) = watch::channel(false);
        let join = std::thread::Builder::new()
            .name(format!("partyline-{thread}"))
            .spawn(move || worker_main(thread, engine, period, stop_rx))
            .map_err(|err| {
                PartyError::invalid_state("Initializing", format!("could not start {thread} worker: {err}"))
            })?;
        info!(thread = %thread, period_ms = period.as_millis() as u64, "worker started");
        Ok(Self {
            thread,
            stop,
            join: Some(join),
        })
    }

    /// Signal the worker and wait for its current tick to finish
    pub fn stop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!(thread = %self.thread, "worker panicked");
            }
        }
        debug!(thread = %self.thread, "worker stopped");
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.stop();
        }
    }
}

fn worker_main(thread: ThreadId, engine: Arc<Engine>, period: Duration, mut stop: watch::Receiver<bool>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(thread = %thread, error = %err, "could not build worker runtime");
            return;
        }
    };
    runtime.block_on(async move {
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticks.tick() => run_tick(&engine, thread),
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_ids_index_distinct_slots() {
        let indices: Vec<_> = ThreadId::ALL.iter().map(ThreadId::index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(ThreadId::Networking.to_string(), "networking");
        assert_eq!(WorkMode::default(), WorkMode::Automatic);
    }
}
