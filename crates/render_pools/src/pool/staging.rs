//! Size-tiered staging buffer pool
//!
//! Requests are aligned up to a fixed ladder of size tiers so that buffers
//! are interchangeable within a tier. Reuse is bounded: a buffer is only
//! handed out for a request it does not dwarf. At the ceiling the pool grows
//! its least used idle buffer instead of allocating beyond the limit.
//!
//! Maintenance runs in four steps:
//!
//! 1. Drop idle buffers that are too large to keep resident, and buffers
//!    in tiers that have been idle and rarely used.
//! 2. Refill toward the target count with `refill_size` buffers.
//! 3. Evict expired, rarely used buffers from tiers holding more than one.
//! 4. If still above target, remove a per-tier quota proportional to each
//!    tier's share of the pool, always keeping one buffer per tier.
//!
//! Refill buffers start with a usage count of zero. In a pool that sits idle
//! they form a cold tier once they expire, so every expiry evicts them in
//! step 1 and step 2 allocates fresh ones. An idle pool therefore recreates
//! its refill buffers once per reclaim threshold rather than holding them.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;

use super::error::{PoolError, PoolResult};
use super::guard::ResourceGuard;
use super::maintenance::{MaintenancePass, MaintenanceReport};
use super::policy::{EmergencyOutcome, PoolPolicy};
use super::record::{PoolStatistics, RecordInfo};
use super::resource_pool::ResourcePool;
use crate::backend::{StagingBuffer, StagingBufferAllocator, TransferDirection};
use crate::core::config::{EvictionPolicy, StagingPoolConfig};
use crate::foundation::collections::RecordKey;
use crate::foundation::time::{Clock, SystemClock};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Canonical staging buffer sizes
pub const SIZE_TIERS: [u64; 9] = [
    64 * KIB,
    256 * KIB,
    MIB,
    4 * MIB,
    16 * MIB,
    64 * MIB,
    256 * MIB,
    GIB,
    4 * GIB,
];

/// Alignment of requests beyond the largest tier
pub const HUGE_ALIGNMENT: u64 = 2 * MIB;

/// Buffers created at construction, at most
const WARM_UP_TIERS: usize = 3;

/// Round a request up to its tier, or to [`HUGE_ALIGNMENT`] past the ladder
pub fn align_size(requested: u64) -> u64 {
    let index = SIZE_TIERS.partition_point(|&tier| tier < requested);
    if let Some(&tier) = SIZE_TIERS.get(index) {
        return tier;
    }

    match requested.checked_next_multiple_of(HUGE_ALIGNMENT) {
        Some(aligned) => aligned,
        None => u64::MAX - u64::MAX % HUGE_ALIGNMENT,
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scale(size: u64, factor: f64) -> u64 {
    let scaled = (size as f64 * factor).ceil();
    if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled as u64
    }
}

/// Size of the buffer replacing `current` when a `requested` byte request
/// arrives at the ceiling
///
/// Grows geometrically by `growth_factor`; past the largest tier growth
/// falls back to `capped_growth_factor`. Never smaller than the aligned
/// request or than `current`.
pub fn emergency_size(current: u64, requested: u64, eviction: &EvictionPolicy) -> u64 {
    let aligned = align_size(requested);
    let largest = SIZE_TIERS[SIZE_TIERS.len() - 1];

    let grown = aligned.max(scale(current, eviction.growth_factor));
    if grown <= largest {
        return grown;
    }

    aligned.max(scale(current, eviction.capped_growth_factor))
}

/// Pool policy for staging buffers
pub struct StagingPolicy<A: StagingBufferAllocator> {
    allocator: A,
    direction: TransferDirection,
    eviction: EvictionPolicy,
}

impl<A: StagingBufferAllocator> StagingPolicy<A> {
    /// Backend used to allocate buffers
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Transfer direction of every buffer in the pool
    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// Growth and eviction heuristics
    pub fn eviction(&self) -> &EvictionPolicy {
        &self.eviction
    }
}

impl<A: StagingBufferAllocator> PoolPolicy for StagingPolicy<A> {
    type Resource = A::Buffer;
    type CreateInfo = u64;
    type Metadata = u64;

    const NAME_PREFIX: &'static str = "StagingBuffer";

    fn create_resource(&self, size: &u64, name: &str) -> PoolResult<(A::Buffer, u64)> {
        let buffer = self.allocator.allocate(align_size(*size), self.direction, name)?;
        let size = buffer.size();
        Ok((buffer, size))
    }

    fn handle_emergency(&self, requested: &u64, low_usage: &RecordInfo<u64>) -> EmergencyOutcome<u64> {
        let current = *low_usage.metadata();
        if current >= *requested {
            return EmergencyOutcome::Reuse;
        }

        EmergencyOutcome::Replace(emergency_size(current, *requested, &self.eviction))
    }

    fn describe(&self, buffer: &A::Buffer) -> u64 {
        buffer.size()
    }

    fn on_release(&self, buffer: &mut A::Buffer) -> PoolResult<()> {
        buffer.clear_alias();
        Ok(())
    }

    fn refill_create_info(&self) -> Option<u64> {
        Some(self.eviction.refill_size)
    }

    fn optimize(&self, pass: &mut MaintenancePass<'_, Self>) {
        let usage_threshold = pass.config().reclaim_usage_threshold;

        let oversized = select_oversized(&snapshot(pass), &self.eviction, usage_threshold);
        pass.evict_all(&oversized);

        let target = pass.target_count();
        if pass.available_len() < target {
            pass.grow_toward_target(&self.eviction.refill_size);
            return;
        }

        let excess = pass.available_len() - target;
        if excess > 0 {
            let idle = select_idle(&snapshot(pass), usage_threshold, excess);
            pass.evict_all(&idle);
        }

        let excess = pass.available_len().saturating_sub(target);
        if excess > 0 {
            let quota = select_by_tier_quota(&snapshot(pass), excess);
            pass.evict_all(&quota);
        }
    }
}

/// Idle buffer as seen by the eviction heuristics
#[derive(Debug, Clone, Copy)]
struct BufferEntry {
    key: RecordKey,
    size: u64,
    tier: u64,
    usage_count: u64,
    last_used_ms: u64,
    expired: bool,
}

fn snapshot<A: StagingBufferAllocator>(pass: &MaintenancePass<'_, StagingPolicy<A>>) -> Vec<BufferEntry> {
    pass.available_records()
        .map(|(key, info)| BufferEntry {
            key,
            size: *info.metadata(),
            tier: align_size(*info.metadata()),
            usage_count: info.usage_count(),
            last_used_ms: info.last_used_ms(),
            expired: pass.is_expired(info),
        })
        .collect()
}

fn group_by_tier(entries: &[BufferEntry]) -> BTreeMap<u64, Vec<BufferEntry>> {
    let mut tiers: BTreeMap<u64, Vec<BufferEntry>> = BTreeMap::new();
    for entry in entries {
        tiers.entry(entry.tier).or_default().push(*entry);
    }
    tiers
}

/// Buffers too large to keep, plus idle buffers of rarely used tiers
fn select_oversized(entries: &[BufferEntry], eviction: &EvictionPolicy, usage_threshold: u64) -> Vec<RecordKey> {
    let mut tier_usage: BTreeMap<u64, u64> = BTreeMap::new();
    for entry in entries {
        *tier_usage.entry(entry.tier).or_default() += entry.usage_count;
    }

    entries
        .iter()
        .filter(|entry| {
            let cold_tier = tier_usage.get(&entry.tier).copied().unwrap_or(0) < usage_threshold;
            entry.size > eviction.compact_size_threshold
                || entry.size > eviction.large_buffer_threshold
                || (cold_tier && entry.expired)
        })
        .map(|entry| entry.key)
        .collect()
}

/// Up to `excess` expired, rarely used buffers from tiers holding several
fn select_idle(entries: &[BufferEntry], usage_threshold: u64, excess: usize) -> Vec<RecordKey> {
    let mut candidates: Vec<BufferEntry> = group_by_tier(entries)
        .into_values()
        .filter(|tier| tier.len() > 1)
        .flatten()
        .filter(|entry| entry.expired && entry.usage_count < usage_threshold)
        .collect();
    candidates.sort_by_key(|entry| (entry.usage_count, entry.last_used_ms));

    candidates.into_iter().take(excess).map(|entry| entry.key).collect()
}

/// Buffers a tier of `count` gives up when `total_remove` of `available`
/// must go; one buffer per tier is always kept
fn tier_quota(count: usize, total_remove: usize, available: usize) -> usize {
    if available == 0 {
        return 0;
    }

    let share = (count * total_remove + available / 2) / available;
    share.min(count.saturating_sub(1))
}

/// Least recently and least used buffers of each tier, per tier quota
fn select_by_tier_quota(entries: &[BufferEntry], total_remove: usize) -> Vec<RecordKey> {
    let available = entries.len();
    let mut victims = Vec::with_capacity(total_remove);

    for mut tier in group_by_tier(entries).into_values() {
        let quota = tier_quota(tier.len(), total_remove, available);
        tier.sort_by_key(|entry| (entry.last_used_ms, entry.usage_count));
        victims.extend(tier.iter().take(quota).map(|entry| entry.key));
    }

    victims.truncate(total_remove);
    victims
}

/// Guard over a pooled staging buffer
pub type StagingBufferGuard<A> = ResourceGuard<StagingPolicy<A>>;

/// Pool of host-visible transfer buffers for one direction
pub struct StagingBufferPool<A: StagingBufferAllocator> {
    pool: ResourcePool<StagingPolicy<A>>,
}

impl<A: StagingBufferAllocator> StagingBufferPool<A> {
    /// Create the pool and warm it up with small buffers
    ///
    /// Creates `min(min_available, 3)` buffers of the three smallest tiers;
    /// a failure there fails construction.
    pub fn new(allocator: A, config: StagingPoolConfig) -> PoolResult<Self> {
        Self::with_clock(allocator, config, Arc::new(SystemClock::new()))
    }

    /// Create the pool with an explicit clock
    pub fn with_clock(allocator: A, config: StagingPoolConfig, clock: Arc<dyn Clock>) -> PoolResult<Self> {
        config.eviction.validate().map_err(PoolError::InvalidConfig)?;

        let warm_up = (config.pool.min_available as usize).min(WARM_UP_TIERS);
        let direction = config.direction;
        let policy = StagingPolicy {
            allocator,
            direction,
            eviction: config.eviction,
        };

        let pool = ResourcePool::with_clock(policy, config.pool, clock)?;
        let created = pool.warm_up(SIZE_TIERS.iter().take(warm_up).copied())?;
        info!("Staging buffer pool ({}) warmed up with {created} buffers", direction.label());

        Ok(Self { pool })
    }

    /// Acquire a buffer of at least `requested` bytes
    ///
    /// Reuses an idle buffer no larger than `oversize_factor` times the
    /// aligned request, or within `oversize_slack` bytes of the raw request.
    pub fn acquire_buffer(&self, requested: u64) -> PoolResult<StagingBufferGuard<A>> {
        let aligned = align_size(requested);
        let eviction = self.pool.policy().eviction();
        let max_reuse = aligned.saturating_mul(eviction.oversize_factor);
        let slack_reuse = requested.saturating_add(eviction.oversize_slack);

        self.pool.acquire_with(&aligned, |info: &RecordInfo<u64>| {
            let size = *info.metadata();
            size >= requested && (size <= max_reuse || size <= slack_reuse)
        })
    }

    /// Pre-create idle buffers of the given sizes, up to the ceiling
    pub fn prewarm(&self, sizes: &[u64]) -> PoolResult<usize> {
        self.pool.warm_up(sizes.iter().copied())
    }

    /// Sizes of the idle buffers, in container order
    pub fn available_sizes(&self) -> Vec<u64> {
        self.pool.available_metadata()
    }

    /// Current occupancy
    pub fn statistics(&self) -> PoolStatistics {
        self.pool.statistics()
    }

    /// Run one maintenance pass on the calling thread
    pub fn run_maintenance(&self) -> MaintenanceReport {
        self.pool.run_maintenance()
    }

    /// Destroy every idle buffer
    pub fn reset(&self) -> usize {
        self.pool.reset()
    }

    /// Transfer direction of the pool's buffers
    pub fn direction(&self) -> TransferDirection {
        self.pool.policy().direction()
    }

    /// Underlying generic pool, for limits and introspection
    pub fn pool(&self) -> &ResourcePool<StagingPolicy<A>> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostStagingAllocator;
    use crate::core::config::PoolConfig;
    use crate::foundation::time::ManualClock;
    use proptest::prelude::*;
    use slotmap::KeyData;

    fn pool_with(min: u32, max: u32) -> (StagingBufferPool<HostStagingAllocator>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let config = StagingPoolConfig::submit()
            .with_pool(PoolConfig::new(min, max, 1_000, 1_000).with_background_maintenance(false));
        let pool = StagingBufferPool::with_clock(HostStagingAllocator::new(), config, clock.clone()).expect("pool");
        (pool, clock)
    }

    fn entry(id: u64, size: u64, usage_count: u64, last_used_ms: u64, expired: bool) -> BufferEntry {
        BufferEntry {
            key: KeyData::from_ffi(id).into(),
            size,
            tier: align_size(size),
            usage_count,
            last_used_ms,
            expired,
        }
    }

    #[test]
    fn test_scenario_tier_boundaries() {
        assert_eq!(align_size(50 * KIB), 64 * KIB);
        assert_eq!(align_size(64 * KIB), 64 * KIB);
        assert_eq!(align_size(70 * KIB), 256 * KIB);
        assert_eq!(align_size(0), 64 * KIB);
        assert_eq!(align_size(3 * MIB), 4 * MIB);
        assert_eq!(align_size(4 * GIB), 4 * GIB);
        assert_eq!(align_size(4 * GIB + 1), 4 * GIB + 2 * MIB);
    }

    #[test]
    fn test_align_size_saturates() {
        let aligned = align_size(u64::MAX);
        assert_eq!(aligned % HUGE_ALIGNMENT, 0);
        assert_eq!(align_size(aligned), aligned);
    }

    proptest! {
        #[test]
        fn prop_align_size_is_idempotent(size in any::<u64>()) {
            let aligned = align_size(size);
            prop_assert_eq!(align_size(aligned), aligned);
        }

        #[test]
        fn prop_align_size_never_shrinks(size in 0..u64::MAX / 2) {
            prop_assert!(align_size(size) >= size);
        }

        #[test]
        fn prop_emergency_growth_is_monotonic(current in 1..16 * GIB, requested in 1..16 * GIB) {
            let grown = emergency_size(current, requested, &EvictionPolicy::default());
            prop_assert!(grown >= requested);
            prop_assert!(grown >= current);
        }
    }

    #[test]
    fn test_emergency_growth_caps_past_largest_tier() {
        let eviction = EvictionPolicy::default();
        assert_eq!(emergency_size(64 * KIB, 3 * MIB, &eviction), 4 * MIB);
        assert_eq!(emergency_size(40 * MIB, 50 * MIB, &eviction), 80 * MIB);
        // Doubling 4 GiB leaves the ladder, so growth drops to 1.5x
        assert_eq!(emergency_size(4 * GIB, 4 * GIB + 1, &eviction), 6 * GIB);
    }

    #[test]
    fn test_warm_up_creates_smallest_tiers() {
        let (pool, _clock) = pool_with(4, 16);
        assert_eq!(pool.available_sizes(), vec![64 * KIB, 256 * KIB, MIB]);
        assert_eq!(pool.direction(), TransferDirection::Submit);

        let (pool, _clock) = pool_with(1, 16);
        assert_eq!(pool.available_sizes(), vec![64 * KIB]);
    }

    #[test]
    fn test_warm_up_failure_is_fatal() {
        let config = StagingPoolConfig::submit()
            .with_pool(PoolConfig::new(3, 8, 1_000, 1_000).with_background_maintenance(false));
        let result = StagingBufferPool::new(HostStagingAllocator::with_budget(128 * KIB), config);
        assert!(matches!(result, Err(PoolError::CreationFailed { .. })));
    }

    #[test]
    fn test_acquire_reuses_first_fitting_tier() {
        let (pool, _clock) = pool_with(3, 16);

        let buffer = pool.acquire_buffer(100 * KIB).expect("acquire");
        assert_eq!(buffer.size(), 256 * KIB);
        assert_eq!(pool.statistics().total_created, 3);
    }

    #[test]
    fn test_grossly_oversized_buffer_is_not_reused() {
        let (pool, _clock) = pool_with(0, 16);

        drop(pool.acquire_buffer(8 * MIB).expect("large"));
        let small = pool.acquire_buffer(10 * KIB).expect("small");

        assert_eq!(small.size(), 64 * KIB);
        assert_eq!(pool.statistics().total_created, 2);
    }

    #[test]
    fn test_slack_allows_reuse_of_slightly_larger_buffer() {
        let (pool, _clock) = pool_with(0, 16);

        drop(pool.acquire_buffer(MIB).expect("1 MiB"));
        // 64 KiB aligned; 1 MiB is within 1 MiB of the raw request
        let reused = pool.acquire_buffer(60 * KIB).expect("reuse");
        assert_eq!(reused.size(), MIB);
        assert_eq!(pool.statistics().total_created, 1);
    }

    #[test]
    fn test_emergency_replaces_small_buffer_at_ceiling() {
        let (pool, _clock) = pool_with(0, 2);

        let first = pool.acquire_buffer(64 * KIB).expect("first");
        let second = pool.acquire_buffer(64 * KIB).expect("second");
        drop(first);
        drop(second);

        let grown = pool.acquire_buffer(3 * MIB).expect("emergency growth");
        assert_eq!(grown.size(), 4 * MIB);

        let stats = pool.statistics();
        assert_eq!(stats.allocated(), 2);
        assert_eq!(stats.total_evicted, 1);
        assert_eq!(pool.available_sizes(), vec![64 * KIB]);
    }

    #[test]
    fn test_emergency_without_idle_buffers_is_exhaustion() {
        let (pool, _clock) = pool_with(0, 1);

        let _held = pool.acquire_buffer(64 * KIB).expect("held");
        let error = pool.acquire_buffer(64 * KIB).expect_err("exhausted");
        assert!(error.is_exhaustion());
    }

    #[test]
    fn test_write_and_read_through_guard() {
        let (pool, _clock) = pool_with(0, 4);

        let mut buffer = pool.acquire_buffer(256).expect("acquire");
        buffer.write_pod(0, &[7_u32, 11, 13]).expect("write");
        let mut out = [0_u32; 3];
        buffer.read_pod(0, &mut out).expect("read");
        assert_eq!(out, [7, 11, 13]);
    }

    #[test]
    fn test_alias_is_cleared_on_release() {
        use crate::backend::ImageAliasInfo;
        use ash::vk;

        let (pool, _clock) = pool_with(1, 4);

        let mut buffer = pool.acquire_buffer(64 * KIB).expect("acquire");
        let info = ImageAliasInfo::new(vk::Format::R8G8B8A8_UNORM, 64, 64);
        assert!(buffer.alias_image(vk::Format::R8G8B8A8_UNORM, &info).is_some());
        drop(buffer);

        let buffer = pool.acquire_buffer(64 * KIB).expect("reacquire");
        assert!(buffer.aliased_image().is_none());
    }

    #[test]
    fn test_maintenance_compacts_large_idle_buffers() {
        let (pool, _clock) = pool_with(0, 16);

        drop(pool.acquire_buffer(64 * MIB).expect("large"));
        assert_eq!(pool.available_sizes(), vec![64 * MIB]);

        // Peak demand was one, so the pass refills with a default buffer
        let report = pool.run_maintenance();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.created, 1);
        assert_eq!(pool.available_sizes(), vec![4 * MIB]);
    }

    #[test]
    fn test_maintenance_drops_cold_tiers_only_once_expired() {
        let (pool, clock) = pool_with(3, 16);

        assert_eq!(pool.run_maintenance().evicted, 0);
        assert_eq!(pool.available_sizes(), vec![64 * KIB, 256 * KIB, MIB]);

        // Never used and now idle past the threshold: every tier is cold
        clock.advance(1_001);
        let report = pool.run_maintenance();
        assert_eq!(report.evicted, 3);
        assert_eq!(report.created, 3);
        assert_eq!(pool.available_sizes(), vec![4 * MIB; 3]);
    }

    #[test]
    fn test_quota_keeps_one_buffer_per_tier() {
        let (pool, _clock) = pool_with(0, 16);
        pool.prewarm(&[64 * KIB, 64 * KIB, 64 * KIB, 64 * KIB, MIB]).expect("prewarm");

        let report = pool.run_maintenance();
        assert_eq!(report.evicted, 3);
        assert_eq!(pool.available_sizes(), vec![64 * KIB, MIB]);
    }

    #[test]
    fn test_maintenance_refills_with_refill_size() {
        let (pool, _clock) = pool_with(3, 16);
        assert_eq!(pool.reset(), 3);

        let report = pool.run_maintenance();
        assert_eq!(report.created, 3);
        assert_eq!(pool.available_sizes(), vec![4 * MIB; 3]);
    }

    #[test]
    fn test_idle_refill_buffers_are_recreated_each_expiry() {
        let (pool, clock) = pool_with(3, 16);
        assert_eq!(pool.reset(), 3);
        assert_eq!(pool.run_maintenance().created, 3);

        // Within the threshold the refill buffers are kept
        assert_eq!(pool.run_maintenance(), MaintenanceReport { created: 0, evicted: 0, available: 3 });

        clock.advance(1_001);
        let report = pool.run_maintenance();
        assert_eq!(report.evicted, 3);
        assert_eq!(report.created, 3);
        assert_eq!(pool.available_sizes(), vec![4 * MIB; 3]);
        assert_eq!(pool.statistics().total_created, 9);
    }

    #[test]
    fn test_unsatisfiable_request_is_creation_failure() {
        let (pool, _clock) = pool_with(0, 4);

        let error = pool.acquire_buffer(u64::MAX / 2).expect_err("cannot allocate");
        assert!(matches!(error, PoolError::CreationFailed { .. }));
        assert_eq!(pool.statistics().allocated(), 0);
        assert_eq!(pool.pool().policy().allocator().live_bytes(), 0);

        assert_eq!(pool.acquire_buffer(64 * KIB).expect("still usable").size(), 64 * KIB);
    }

    #[test]
    fn test_failed_emergency_replacement_keeps_old_buffer() {
        let clock = Arc::new(ManualClock::new(0));
        let config = StagingPoolConfig::submit()
            .with_pool(PoolConfig::new(0, 2, 1_000, 1_000).with_background_maintenance(false));
        let allocator = HostStagingAllocator::with_budget(MIB);
        let pool = StagingBufferPool::with_clock(allocator, config, clock).expect("pool");

        let first = pool.acquire_buffer(64 * KIB).expect("first");
        let second = pool.acquire_buffer(64 * KIB).expect("second");
        drop(first);
        drop(second);

        // The 4 MiB replacement does not fit the budget
        let error = pool.acquire_buffer(3 * MIB).expect_err("replacement fails");
        assert!(matches!(error, PoolError::CreationFailed { .. }));

        assert_eq!(pool.available_sizes(), vec![64 * KIB, 64 * KIB]);
        let stats = pool.statistics();
        assert_eq!(stats.allocated(), 2);
        assert_eq!(stats.total_evicted, 0);
        assert_eq!(pool.pool().policy().allocator().live_bytes(), 128 * KIB);

        assert_eq!(pool.acquire_buffer(64 * KIB).expect("reuse").size(), 64 * KIB);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_concurrent_mixed_sizes_respect_ceiling(
            workloads in prop::collection::vec(prop::collection::vec(10 * KIB..=3 * MIB, 1..40), 8)
        ) {
            use parking_lot::Mutex;
            use std::collections::HashSet;
            use std::thread;

            const MAX_ALLOCATED: usize = 4;
            let (pool, _clock) = pool_with(0, MAX_ALLOCATED as u32);
            let held: Mutex<HashSet<String>> = Mutex::new(HashSet::new());

            let outcomes: Vec<Result<(), String>> = thread::scope(|scope| {
                let workers: Vec<_> = workloads
                    .iter()
                    .map(|sizes| {
                        let pool = &pool;
                        let held = &held;
                        scope.spawn(move || -> Result<(), String> {
                            for &size in sizes {
                                let mut buffer = match pool.acquire_buffer(size) {
                                    Ok(buffer) => buffer,
                                    Err(error) if error.is_exhaustion() => continue,
                                    Err(error) => return Err(error.to_string()),
                                };
                                if buffer.size() < size {
                                    return Err(format!("{} bytes handed out for {size}", buffer.size()));
                                }

                                let name = buffer.name().to_string();
                                if !held.lock().insert(name.clone()) {
                                    return Err(format!("{name} held twice"));
                                }
                                let allocated = pool.statistics().allocated();
                                if allocated > MAX_ALLOCATED {
                                    return Err(format!("{allocated} buffers allocated"));
                                }

                                buffer.write_bytes(0, &[0xAB; 64]).map_err(|error| error.to_string())?;
                                held.lock().remove(&name);
                            }
                            Ok(())
                        })
                    })
                    .collect();

                workers
                    .into_iter()
                    .map(|worker| worker.join().unwrap_or_else(|_| Err("worker panicked".to_string())))
                    .collect()
            });

            for outcome in outcomes {
                prop_assert_eq!(outcome, Ok(()));
            }
            let stats = pool.statistics();
            prop_assert_eq!(stats.busy, 0);
            prop_assert!(stats.allocated() <= MAX_ALLOCATED);
        }
    }

    #[test]
    fn test_select_oversized() {
        let eviction = EvictionPolicy::default();
        let entries = [
            entry(1, 64 * MIB, 50, 0, false),
            entry(2, 64 * KIB, 1, 0, true),
            entry(3, 64 * KIB, 1, 0, false),
            entry(4, MIB, 2, 0, true),
            entry(5, MIB, 9, 0, true),
        ];

        let victims = select_oversized(&entries, &eviction, 5);
        // The 64 KiB tier is cold (usage 2) but only the expired one goes;
        // the 1 MiB tier is warm (usage 11)
        assert_eq!(victims, vec![entries[0].key, entries[1].key]);
    }

    #[test]
    fn test_select_idle_spares_single_buffer_tiers() {
        let entries = [
            entry(1, 64 * KIB, 3, 10, true),
            entry(2, 64 * KIB, 1, 20, true),
            entry(3, 64 * KIB, 1, 5, false),
            entry(4, MIB, 0, 0, true),
        ];

        assert_eq!(select_idle(&entries, 5, 4), vec![entries[1].key, entries[0].key]);
        assert_eq!(select_idle(&entries, 5, 1), vec![entries[1].key]);
        assert_eq!(select_idle(&entries, 2, 4), vec![entries[1].key]);
    }

    #[test]
    fn test_tier_quota_is_proportional_and_keeps_one() {
        // 2 of 8 must go: a tier holding 4 gives up 1
        assert_eq!(tier_quota(4, 2, 8), 1);
        // A lone buffer is always kept
        assert_eq!(tier_quota(1, 7, 8), 0);
        assert_eq!(tier_quota(6, 6, 8), 5);
        assert_eq!(tier_quota(3, 0, 8), 0);
        assert_eq!(tier_quota(3, 1, 0), 0);
    }

    #[test]
    fn test_select_by_tier_quota_prefers_stale_buffers() {
        let entries = [
            entry(1, 64 * KIB, 9, 300, false),
            entry(2, 64 * KIB, 9, 100, false),
            entry(3, 64 * KIB, 2, 100, false),
            entry(4, 64 * KIB, 9, 200, false),
            entry(5, MIB, 1, 0, false),
            entry(6, MIB, 1, 50, false),
            entry(7, 4 * MIB, 1, 0, false),
            entry(8, 4 * MIB, 1, 0, false),
        ];

        let victims = select_by_tier_quota(&entries, 4);
        // 64 KiB: round(4*4/8) = 2, oldest first with usage breaking ties
        // 1 MiB and 4 MiB: round(2*4/8) = 1 each, capped at total 4
        assert_eq!(
            victims,
            vec![entries[2].key, entries[1].key, entries[4].key, entries[6].key]
        );
    }
}
