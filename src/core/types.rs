//! Common types used across tablenet modules.

use serde::{Deserialize, Serialize};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Integer identifier of a process within the peer group.
pub type Rank = usize;

/// Timestamp wrapper for consistent serialization.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Get current UTC timestamp.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}

/// Message source selector for reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    /// Match a message from any rank, scanning ranks in ascending order.
    Any,
    /// Match only messages from the given rank.
    Rank(Rank),
}

impl From<Rank> for Source {
    fn from(rank: Rank) -> Self {
        Source::Rank(rank)
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Any => write!(f, "any"),
            Source::Rank(r) => write!(f, "{}", r),
        }
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wake-up signal shared between a producer and a polling consumer.
///
/// Consumers snapshot the generation before scanning for work and only park
/// if nothing was published since, so a notification is never lost. Parking
/// is bounded by the poll interval.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Current generation, to be passed to [`Signal::wait`].
    pub(crate) fn generation(&self) -> u64 {
        *lock(&self.generation)
    }

    /// Publish new work and wake all waiters.
    pub(crate) fn notify(&self) {
        let mut generation = lock(&self.generation);
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Park for at most `timeout` unless the generation moved past `seen`.
    pub(crate) fn wait(&self, seen: u64, timeout: Duration) {
        let generation = lock(&self.generation);
        if *generation != seen {
            return;
        }
        let _ = self
            .cond
            .wait_timeout(generation, timeout)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_source_display() {
        assert_eq!(Source::Any.to_string(), "any");
        assert_eq!(Source::from(3).to_string(), "3");
    }

    #[test]
    fn test_signal_skips_wait_after_notify() {
        let signal = Signal::new();
        let seen = signal.generation();
        signal.notify();

        let start = Instant::now();
        signal.wait(seen, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let signal = Arc::new(Signal::new());
        let seen = signal.generation();

        let notifier = Arc::clone(&signal);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });

        let start = Instant::now();
        signal.wait(seen, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
