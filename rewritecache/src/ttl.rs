//! A TTL that can be changed while a tier is in use.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// A duration shared between clones, stored as whole nanoseconds in one
/// atomic so readers never see half of an update.
///
/// Tiers read it on every lookup, so a new TTL applies to entries that are
/// already cached. Durations beyond `u64::MAX` nanoseconds (about 584 years)
/// are stored as that maximum.
#[derive(Debug, Clone)]
pub struct SharedDuration {
    nanos: Arc<AtomicU64>,
}

fn to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl SharedDuration {
    /// Share `duration`.
    pub fn new(duration: Duration) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(to_nanos(duration))),
        }
    }

    /// The current duration.
    pub fn get(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }

    /// Replace the duration for every clone.
    pub fn set(&self, duration: Duration) {
        self.nanos.store(to_nanos(duration), Ordering::Release);
    }
}
