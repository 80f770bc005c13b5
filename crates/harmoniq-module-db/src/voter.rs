use std::sync::atomic::{AtomicUsize, Ordering};

/// Resource-usage vote raised around each loader batch.
///
/// The loader votes once when a batch starts and releases once when it
/// completes, however many modules the batch loads.
pub trait ResourceVoter: Send + Sync {
    fn vote(&self);
    fn release(&self);
}

/// [`ResourceVoter`] that only tracks how many batches are in flight.
#[derive(Debug, Default)]
pub struct CountingVoter {
    active: AtomicUsize,
    total: AtomicUsize,
}

impl CountingVoter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches whose vote has not been released yet.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Votes raised since creation.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }
}

impl ResourceVoter for CountingVoter {
    fn vote(&self) {
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.total.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(active, "loader resource vote raised");
    }

    fn release(&self) {
        let released = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| active.checked_sub(1));
        match released {
            Ok(previous) => tracing::trace!(active = previous - 1, "loader resource vote released"),
            Err(_) => tracing::warn!("loader resource vote released without a matching vote"),
        }
    }
}
