//! Hand-driven clock

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use partyline_core::{TimeSource, Timestamp};

/// A [`TimeSource`] that only moves when told to
///
/// Share one between every manager of a test so grace periods, destroy
/// windows, retransmissions and ticket deadlines fire deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_moves_only_when_advanced() {
        let clock = ManualClock::starting_at(1_000);
        assert_eq!(clock.now(), Timestamp::new(1_000));
        clock.advance(Duration::from_millis(250));
        clock.advance_millis(50);
        assert_eq!(clock.now().as_millis(), 1_300);
    }
}
