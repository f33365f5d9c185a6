// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use openpeer_store::current_timestamp;

/// Allocates lineage identifiers for newly created publications.
///
/// Every brand-new publication (as opposed to an update) gets the next value
/// from the allocator owned by the process context, so version counters from
/// two publish epochs are never confused with each other. Clones share the
/// same counter.
///
/// Fresh allocators seed from the current UNIX time, which keeps allocated
/// lineages increasing across process restarts.
#[derive(Clone, Debug)]
pub struct LineageAllocator {
    next: Arc<AtomicU64>,
}

impl LineageAllocator {
    pub fn new() -> Self {
        Self::from_seed(current_timestamp())
    }

    /// Deterministic allocator for tests.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(seed)),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for LineageAllocator {
    fn default() -> Self {
        Self::new()
    }
}
