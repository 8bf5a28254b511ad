//! Export identifier allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use netroot_id::ExportId;

/// Hands out NFS `fsid` values, each exactly once per process.
///
/// Values are never returned to the pool: an id drawn for an export that
/// then fails is simply skipped.
#[derive(Debug)]
pub struct ExportIdAllocator {
    /// Counter is wider than the id so it cannot wrap back onto issued values.
    next: AtomicU64,
}

impl ExportIdAllocator {
    /// Create an allocator whose first issued id is `start`.
    pub fn new(start: ExportId) -> Self {
        Self {
            next: AtomicU64::new(u64::from(start.value())),
        }
    }

    /// Draw the next id, or `None` once the 32-bit space is used up.
    pub fn next(&self) -> Option<ExportId> {
        let value = self.next.fetch_add(1, Ordering::SeqCst);
        u32::try_from(value).ok().map(ExportId::new)
    }
}
