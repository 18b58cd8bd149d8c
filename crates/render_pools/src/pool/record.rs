//! Pooled record bookkeeping

/// Bookkeeping for one live resource instance
///
/// Predicates, emergency handlers and maintenance passes only ever see this
/// part of a record; the native resource itself is owned either by the pool
/// (while available) or by a [`ResourceGuard`](super::ResourceGuard).
#[derive(Debug, Clone)]
pub struct RecordInfo<M> {
    pub(crate) last_used_ms: u64,
    pub(crate) usage_count: u64,
    pub(crate) metadata: M,
    pub(crate) name: String,
}

impl<M> RecordInfo<M> {
    /// Clock time of the last release (or creation)
    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms
    }

    /// How many times the record has been acquired
    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    /// Specialization-specific metadata, e.g. a staging buffer's size
    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    /// Unique diagnostic name given to the native object
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the record has sat idle for longer than `threshold_ms`
    pub fn is_expired(&self, now_ms: u64, threshold_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_used_ms) > threshold_ms
    }
}

/// Arena slot: bookkeeping plus the resource while it is available
///
/// `resource` is `None` exactly while a guard has the record checked out.
pub(crate) struct Slot<R, M> {
    pub(crate) info: RecordInfo<M>,
    pub(crate) resource: Option<R>,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    /// Records idle in the pool
    pub available: usize,
    /// Records checked out by guards
    pub busy: u32,
    /// High-water mark of simultaneously busy records
    pub peak_demand: u32,
    /// Records created over the pool's lifetime
    pub total_created: u64,
    /// Records destroyed by maintenance, reset or emergency replacement
    pub total_evicted: u64,
}

impl PoolStatistics {
    /// Available plus busy
    pub fn allocated(&self) -> usize {
        self.available + self.busy as usize
    }
}
