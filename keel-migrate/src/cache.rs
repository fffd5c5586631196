//! Single-value cache with a time-to-live.

use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Holds one value for at most `ttl`.
#[derive(Debug)]
pub struct TimedCache<T> {
    ttl: Duration,
    slot: RwLock<Option<(T, Instant)>>,
}

impl<T: Clone> TimedCache<T> {
    /// Create an empty cache.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }

    /// The value, if one was stored less than `ttl` ago.
    pub fn get(&self) -> Option<T> {
        self.slot
            .read()
            .as_ref()
            .filter(|(_, stored_at)| stored_at.elapsed() < self.ttl)
            .map(|(value, _)| value.clone())
    }

    /// Store a value, replacing any previous one.
    pub fn set(&self, value: T) {
        *self.slot.write() = Some((value, Instant::now()));
    }

    /// Forget the stored value.
    pub fn invalidate(&self) {
        *self.slot.write() = None;
    }
}
