//! Generic resource pool engine
//!
//! Hands out pooled resources through [`ResourceGuard`]s, creates new ones
//! while under the allocation ceiling and falls back to policy-driven
//! emergency handling once the ceiling is reached.
//!
//! # Architecture
//!
//! ```text
//! ResourcePool<P>
//!     └── Arc<PoolShared<P>>  ←── ResourceGuard<P> (key + owned resource)
//!             ├── Mutex<PoolState>
//!             │     ├── RecordArena (every live record, keyed)
//!             │     └── available: Vec<RecordKey> (container order)
//!             ├── busy / peak counters
//!             └── Condvar (signalled on release)
//!     └── MaintenanceWorker (periodic PoolPolicy::optimize)
//! ```
//!
//! A record is available while its key is in `available` and its slot holds
//! the resource. While checked out the slot keeps only bookkeeping and the
//! resource lives in exactly one guard.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::error::{PoolError, PoolResult};
use super::guard::ResourceGuard;
use super::maintenance::{MaintenancePass, MaintenanceReport, MaintenanceWorker};
use super::policy::{EmergencyOutcome, PoolPolicy};
use super::record::{PoolStatistics, RecordInfo, Slot};
use crate::core::config::PoolConfig;
use crate::foundation::collections::{RecordArena, RecordKey};
use crate::foundation::time::{Clock, Stopwatch, SystemClock};

/// Mutable pool state, guarded by the pool mutex
pub(crate) struct PoolState<P: PoolPolicy> {
    pub(crate) records: RecordArena<Slot<P::Resource, P::Metadata>>,
    pub(crate) available: Vec<RecordKey>,
    pub(crate) config: PoolConfig,
    pub(crate) total_created: u64,
    pub(crate) total_evicted: u64,
}

impl<P: PoolPolicy> PoolState<P> {
    fn new(config: PoolConfig) -> Self {
        Self {
            records: RecordArena::with_key(),
            available: Vec::new(),
            config,
            total_created: 0,
            total_evicted: 0,
        }
    }

    /// First available record satisfying `predicate`, in container order
    fn find_available<F>(&self, predicate: &F) -> Option<usize>
    where
        F: Fn(&RecordInfo<P::Metadata>) -> bool,
    {
        self.available.iter().position(|key| {
            self.records
                .get(*key)
                .is_some_and(|slot| predicate(&slot.info))
        })
    }

    /// Available record with the lowest usage count, earliest on ties
    fn lowest_usage_position(&self) -> Option<usize> {
        self.available
            .iter()
            .enumerate()
            .filter_map(|(position, key)| {
                self.records
                    .get(*key)
                    .map(|slot| (position, slot.info.usage_count))
            })
            .min_by_key(|&(_, usage)| usage)
            .map(|(position, _)| position)
    }
}

/// State shared between the pool, its guards and its maintenance thread
pub(crate) struct PoolShared<P: PoolPolicy> {
    pub(crate) policy: P,
    clock: Arc<dyn Clock>,
    pub(crate) state: Mutex<PoolState<P>>,
    released: Condvar,
    busy: AtomicU32,
    peak: AtomicU32,
    next_id: AtomicU64,
}

impl<P: PoolPolicy> PoolShared<P> {
    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn busy(&self) -> u32 {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn peak_demand(&self) -> u32 {
        self.peak.load(Ordering::Acquire)
    }

    pub(crate) fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.state.lock().config.maintenance_interval_ms)
    }

    fn instance_address(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// Create a record through the policy and insert it into the arena
    ///
    /// The new record is neither available nor checked out; the caller
    /// decides which.
    pub(crate) fn create_record(
        &self,
        state: &mut PoolState<P>,
        create_info: &P::CreateInfo,
    ) -> PoolResult<RecordKey> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}_PoolInst_{:#x}_ID_{}", P::NAME_PREFIX, self.instance_address(), id);

        let (resource, metadata) = self.policy.create_resource(create_info, &name)?;
        debug!("Created pooled resource {name}");

        let key = state.records.insert(Slot {
            info: RecordInfo {
                last_used_ms: self.now_ms(),
                usage_count: 0,
                metadata,
                name,
            },
            resource: Some(resource),
        });
        state.total_created += 1;

        Ok(key)
    }

    /// Move a record's resource into a new guard
    fn check_out(self: &Arc<Self>, state: &mut PoolState<P>, key: RecordKey) -> PoolResult<ResourceGuard<P>> {
        let slot = state.records.get_mut(key).ok_or_else(|| PoolError::InvalidGuardUse {
            reason: format!("record {key:?} is missing from the arena"),
        })?;
        let resource = slot.resource.take().ok_or_else(|| PoolError::InvalidGuardUse {
            reason: format!("record {} is already checked out", slot.info.name),
        })?;

        slot.info.usage_count += 1;
        let usage_count = slot.info.usage_count;

        let busy = self.busy.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(busy, Ordering::AcqRel);
        trace!("Acquired {} (usage {usage_count}, busy {busy})", slot.info.name);

        Ok(ResourceGuard::new(Arc::clone(self), key, resource, usage_count))
    }

    pub(crate) fn acquire<F>(
        self: &Arc<Self>,
        create_info: &P::CreateInfo,
        predicate: F,
    ) -> PoolResult<ResourceGuard<P>>
    where
        F: Fn(&RecordInfo<P::Metadata>) -> bool,
    {
        // Replaced resources are destroyed after the lock is released
        let mut graveyard = Vec::new();
        let result = {
            let mut state = self.state.lock();
            self.acquire_locked(&mut state, create_info, &predicate, &mut graveyard)
        };
        drop(graveyard);
        result
    }

    fn acquire_locked<F>(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, PoolState<P>>,
        create_info: &P::CreateInfo,
        predicate: &F,
        graveyard: &mut Vec<P::Resource>,
    ) -> PoolResult<ResourceGuard<P>>
    where
        F: Fn(&RecordInfo<P::Metadata>) -> bool,
    {
        let wait_ms = state.config.exhaustion_wait_ms;
        let deadline = (wait_ms > 0).then(|| Instant::now() + Duration::from_millis(wait_ms));

        loop {
            if let Some(position) = state.find_available(predicate) {
                let key = state.available.remove(position);
                return self.check_out(state, key);
            }

            let allocated = state.available.len() + self.busy() as usize;
            if allocated < state.config.max_allocated as usize {
                let key = self.create_record(state, create_info)?;
                return self.check_out(state, key);
            }

            match deadline {
                Some(deadline) if !self.released.wait_until(state, deadline).timed_out() => continue,
                _ => break,
            }
        }

        self.handle_exhaustion(state, create_info, graveyard)
    }

    /// Ceiling reached and nothing matched: ask the policy what to do with
    /// the lowest-usage idle record
    fn handle_exhaustion(
        self: &Arc<Self>,
        state: &mut PoolState<P>,
        create_info: &P::CreateInfo,
        graveyard: &mut Vec<P::Resource>,
    ) -> PoolResult<ResourceGuard<P>> {
        let exhausted = PoolError::PoolExhausted {
            max_allocated: state.config.max_allocated,
            busy: self.busy(),
        };

        let Some(position) = state.lowest_usage_position() else {
            warn!("{} pool exhausted with no idle records: {exhausted}", P::NAME_PREFIX);
            return Err(exhausted);
        };
        let low_key = state.available[position];
        let Some(low_slot) = state.records.get(low_key) else {
            return Err(exhausted);
        };

        let usage_count = low_slot.info.usage_count;
        match self.policy.handle_emergency(create_info, &low_slot.info) {
            EmergencyOutcome::Reuse => {
                warn!("Emergency reuse of {} at the pool ceiling", low_slot.info.name);
                state.available.remove(position);
                self.check_out(state, low_key)
            }
            EmergencyOutcome::Replace(replacement) => {
                let new_key = self.create_record(state, &replacement)?;

                state.available.remove(position);
                if let Some(old) = state.records.remove(low_key) {
                    warn!("Emergency replacement of {} at the pool ceiling", old.info.name);
                    graveyard.extend(old.resource);
                    state.total_evicted += 1;
                }
                if let Some(slot) = state.records.get_mut(new_key) {
                    slot.info.usage_count = usage_count;
                }

                self.check_out(state, new_key)
            }
            EmergencyOutcome::Decline => {
                warn!("{} pool exhausted, emergency handling declined: {exhausted}", P::NAME_PREFIX);
                Err(exhausted)
            }
        }
    }

    /// Return a resource from a guard
    pub(crate) fn release(&self, key: RecordKey, mut resource: P::Resource, usage_count: u64) -> PoolResult<()> {
        let prepared = self.policy.on_release(&mut resource);
        let metadata = self.policy.describe(&resource);
        let now = self.now_ms();

        let mut state = self.state.lock();
        let Some(slot) = state.records.get_mut(key) else {
            return Err(PoolError::InvalidGuardUse {
                reason: format!("record {key:?} is not owned by this pool"),
            });
        };
        if slot.resource.is_some() {
            return Err(PoolError::InvalidGuardUse {
                reason: format!("record {} was returned twice", slot.info.name),
            });
        }

        self.busy.fetch_sub(1, Ordering::AcqRel);

        match prepared {
            Ok(()) => {
                trace!("Released {} (usage {usage_count})", slot.info.name);
                slot.resource = Some(resource);
                slot.info.last_used_ms = now;
                slot.info.usage_count = usage_count;
                slot.info.metadata = metadata;
                state.available.push(key);
            }
            Err(error) => {
                warn!("Discarding {} after failed release preparation: {error}", slot.info.name);
                state.records.remove(key);
                state.total_evicted += 1;
                drop(state);
                drop(resource);
            }
        }

        self.released.notify_all();
        Ok(())
    }

    pub(crate) fn run_maintenance(&self) -> MaintenanceReport {
        let stopwatch = Stopwatch::start_new();
        let now_ms = self.now_ms();

        let mut graveyard = Vec::new();
        let report = {
            let mut state = self.state.lock();
            let mut pass = MaintenancePass::new(self, &mut state, now_ms, &mut graveyard);
            self.policy.optimize(&mut pass);
            pass.finish()
        };
        drop(graveyard);

        if report.evicted > 0 {
            self.released.notify_all();
        }

        debug!(
            "{} maintenance: +{} -{} -> {} available ({} us)",
            P::NAME_PREFIX,
            report.created,
            report.evicted,
            report.available,
            stopwatch.elapsed_micros()
        );

        report
    }
}

/// Thread-safe pool of reusable resources, specialized by a [`PoolPolicy`]
pub struct ResourcePool<P: PoolPolicy> {
    shared: Arc<PoolShared<P>>,
    maintenance: Option<MaintenanceWorker>,
}

impl<P: PoolPolicy> ResourcePool<P> {
    /// Create a pool driven by the system clock
    pub fn new(policy: P, config: PoolConfig) -> PoolResult<Self> {
        Self::with_clock(policy, config, Arc::new(SystemClock::new()))
    }

    /// Create a pool with an explicit clock
    pub fn with_clock(policy: P, config: PoolConfig, clock: Arc<dyn Clock>) -> PoolResult<Self> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let background = config.background_maintenance;
        info!(
            "Created {} pool (min {}, max {}, reclaim {} ms, maintenance {} ms)",
            P::NAME_PREFIX,
            config.min_available,
            config.max_allocated,
            config.reclaim_threshold_ms,
            config.maintenance_interval_ms
        );

        let shared = Arc::new(PoolShared {
            policy,
            clock,
            state: Mutex::new(PoolState::new(config)),
            released: Condvar::new(),
            busy: AtomicU32::new(0),
            peak: AtomicU32::new(0),
            next_id: AtomicU64::new(0),
        });

        let maintenance = if background {
            Some(MaintenanceWorker::spawn(Arc::clone(&shared))?)
        } else {
            None
        };

        Ok(Self { shared, maintenance })
    }

    /// Acquire any idle resource, creating one if none is available
    pub fn acquire(&self, create_info: &P::CreateInfo) -> PoolResult<ResourceGuard<P>> {
        self.shared.acquire(create_info, |_| true)
    }

    /// Acquire the first idle resource accepted by `predicate`
    ///
    /// Falls back to creating a resource from `create_info` while under the
    /// allocation ceiling, and to the policy's emergency handling above it.
    pub fn acquire_with<F>(&self, create_info: &P::CreateInfo, predicate: F) -> PoolResult<ResourceGuard<P>>
    where
        F: Fn(&RecordInfo<P::Metadata>) -> bool,
    {
        self.shared.acquire(create_info, predicate)
    }

    /// Pre-create idle resources, stopping at the allocation ceiling
    ///
    /// Returns how many were created.
    pub fn warm_up<I>(&self, create_infos: I) -> PoolResult<usize>
    where
        I: IntoIterator<Item = P::CreateInfo>,
    {
        let mut state = self.shared.state.lock();
        let mut created = 0;

        for create_info in create_infos {
            let allocated = state.available.len() + self.shared.busy() as usize;
            if allocated >= state.config.max_allocated as usize {
                break;
            }

            let key = self.shared.create_record(&mut state, &create_info)?;
            state.available.push(key);
            created += 1;
        }

        Ok(created)
    }

    /// Run one maintenance pass on the calling thread
    ///
    /// The background worker calls this every maintenance interval; pools
    /// built without background maintenance rely on their owner to call it.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        self.shared.run_maintenance()
    }

    /// Destroy every idle resource; checked-out resources are unaffected
    pub fn reset(&self) -> usize {
        let evicted: Vec<P::Resource> = {
            let mut state = self.shared.state.lock();
            let keys = std::mem::take(&mut state.available);
            let evicted: Vec<P::Resource> = keys
                .into_iter()
                .filter_map(|key| state.records.remove(key))
                .filter_map(|slot| slot.resource)
                .collect();
            state.total_evicted += evicted.len() as u64;
            evicted
        };

        info!("Reset {} pool, destroyed {} idle resources", P::NAME_PREFIX, evicted.len());
        evicted.len()
    }

    /// Current occupancy
    pub fn statistics(&self) -> PoolStatistics {
        let state = self.shared.state.lock();
        PoolStatistics {
            available: state.available.len(),
            busy: self.shared.busy(),
            peak_demand: self.shared.peak_demand(),
            total_created: state.total_created,
            total_evicted: state.total_evicted,
        }
    }

    /// Metadata of every idle record, in container order
    pub fn available_metadata(&self) -> Vec<P::Metadata>
    where
        P::Metadata: Clone,
    {
        let state = self.shared.state.lock();
        state
            .available
            .iter()
            .filter_map(|key| state.records.get(*key))
            .map(|slot| slot.info.metadata.clone())
            .collect()
    }

    /// The policy specializing this pool
    pub fn policy(&self) -> &P {
        &self.shared.policy
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared<P>> {
        &self.shared
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> PoolConfig {
        self.shared.state.lock().config.clone()
    }

    /// Set the available floor, clamped to the allocation ceiling
    pub fn set_min_available_limit(&self, min_available: u32) {
        let mut state = self.shared.state.lock();
        state.config.min_available = min_available.min(state.config.max_allocated);
    }

    /// Set the allocation ceiling, clamped to at least the available floor
    pub fn set_max_allocated_limit(&self, max_allocated: u32) {
        let mut state = self.shared.state.lock();
        state.config.max_allocated = max_allocated.max(state.config.min_available);
    }

    /// Set the idle time after which records become reclaimable
    pub fn set_reclaim_threshold_ms(&self, reclaim_threshold_ms: u64) {
        self.shared.state.lock().config.reclaim_threshold_ms = reclaim_threshold_ms;
    }

    /// Set the maintenance period; takes effect after the current wait
    pub fn set_maintenance_interval_ms(&self, maintenance_interval_ms: u64) -> PoolResult<()> {
        if maintenance_interval_ms == 0 || maintenance_interval_ms >= u64::from(u32::MAX / 2) {
            return Err(PoolError::InvalidConfig(format!(
                "maintenance interval must be in 1..{} ms, got {maintenance_interval_ms}",
                u32::MAX / 2
            )));
        }

        self.shared.state.lock().config.maintenance_interval_ms = maintenance_interval_ms;
        Ok(())
    }
}

impl<P: PoolPolicy> Drop for ResourcePool<P> {
    fn drop(&mut self) {
        if let Some(mut worker) = self.maintenance.take() {
            worker.stop();
        }

        let busy = self.shared.busy();
        if busy > 0 {
            debug!("{} pool dropped with {busy} resources still checked out", P::NAME_PREFIX);
        }
    }
}
