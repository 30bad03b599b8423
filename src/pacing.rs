//! Blocking suspension points.
//!
//! Both loops block on purpose (vision cooldown, relay back-off after a link
//! error). Routing those sleeps through `Pacer` lets tests run the loops against
//! a manual clock instead of wall time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait Pacer {
    /// Suspend the calling loop for `duration`.
    fn sleep(&mut self, duration: Duration);
}

/// Real-time pacer backed by `std::thread::sleep`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Manually advanced clock. Sleeping advances it instantly.
///
/// Clones share the same elapsed time, so a test can hand one clone to a loop
/// and read or advance another.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    elapsed: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        match self.elapsed.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut guard = match self.elapsed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard += duration;
    }
}

impl Pacer for ManualClock {
    fn sleep(&mut self, duration: Duration) {
        self.advance(duration);
    }
}
