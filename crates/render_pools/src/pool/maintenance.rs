//! Periodic pool maintenance
//!
//! A [`MaintenancePass`] is a locked view of one pool handed to
//! [`PoolPolicy::optimize`]. Evicted resources are parked in a graveyard and
//! destroyed by the caller after the pool lock is released.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use super::error::{PoolError, PoolResult};
use super::policy::PoolPolicy;
use super::record::RecordInfo;
use super::resource_pool::{PoolShared, PoolState};
use crate::core::config::PoolConfig;
use crate::foundation::collections::RecordKey;

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Records created to refill the pool
    pub created: usize,
    /// Idle records destroyed
    pub evicted: usize,
    /// Records available after the pass
    pub available: usize,
}

/// Locked view of a pool during [`PoolPolicy::optimize`]
pub struct MaintenancePass<'a, P: PoolPolicy> {
    shared: &'a PoolShared<P>,
    state: &'a mut PoolState<P>,
    graveyard: &'a mut Vec<P::Resource>,
    now_ms: u64,
    created: usize,
    evicted: usize,
}

impl<'a, P: PoolPolicy> MaintenancePass<'a, P> {
    pub(crate) fn new(
        shared: &'a PoolShared<P>,
        state: &'a mut PoolState<P>,
        now_ms: u64,
        graveyard: &'a mut Vec<P::Resource>,
    ) -> Self {
        Self {
            shared,
            state,
            graveyard,
            now_ms,
            created: 0,
            evicted: 0,
        }
    }

    pub(crate) fn finish(self) -> MaintenanceReport {
        MaintenanceReport {
            created: self.created,
            evicted: self.evicted,
            available: self.state.available.len(),
        }
    }

    /// Clock time the pass started at
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Pool limits in effect for this pass
    pub fn config(&self) -> &PoolConfig {
        &self.state.config
    }

    /// Records currently idle
    pub fn available_len(&self) -> usize {
        self.state.available.len()
    }

    /// Records currently checked out
    pub fn busy(&self) -> u32 {
        self.shared.busy()
    }

    /// High-water mark of busy records
    pub fn peak_demand(&self) -> u32 {
        self.shared.peak_demand()
    }

    /// Number of idle records the pool aims to keep
    pub fn target_count(&self) -> usize {
        self.state.config.min_available.max(self.peak_demand()) as usize
    }

    /// How many more records fit under the allocation ceiling
    pub fn headroom(&self) -> usize {
        (self.state.config.max_allocated as usize).saturating_sub(self.available_len() + self.busy() as usize)
    }

    /// Idle records in container order
    pub fn available_records(&self) -> impl Iterator<Item = (RecordKey, &RecordInfo<P::Metadata>)> + '_ {
        self.state
            .available
            .iter()
            .filter_map(|key| self.state.records.get(*key).map(|slot| (*key, &slot.info)))
    }

    /// Whether a record has been idle past the reclaim threshold
    pub fn is_expired(&self, info: &RecordInfo<P::Metadata>) -> bool {
        info.is_expired(self.now_ms, self.state.config.reclaim_threshold_ms)
    }

    /// Evict idle records; keys that are not idle are ignored
    ///
    /// Returns how many records were evicted.
    pub fn evict_all(&mut self, keys: &[RecordKey]) -> usize {
        let victims: HashSet<RecordKey> = keys.iter().copied().collect();
        let mut idle_victims = Vec::with_capacity(victims.len());
        self.state.available.retain(|key| {
            let hit = victims.contains(key);
            if hit {
                idle_victims.push(*key);
            }
            !hit
        });

        let mut evicted = 0;
        for key in idle_victims {
            if let Some(slot) = self.state.records.remove(key) {
                debug!("Evicting {}", slot.info.name);
                self.graveyard.extend(slot.resource);
                evicted += 1;
            }
        }

        self.state.total_evicted += evicted as u64;
        self.evicted += evicted;
        evicted
    }

    /// Evict one idle record
    pub fn evict(&mut self, key: RecordKey) -> bool {
        self.evict_all(&[key]) == 1
    }

    /// Create one idle record
    pub fn create_available(&mut self, create_info: &P::CreateInfo) -> PoolResult<RecordKey> {
        let key = self.shared.create_record(self.state, create_info)?;
        self.state.available.push(key);
        self.created += 1;
        Ok(key)
    }

    /// Create idle records until the target count or the ceiling is reached
    pub fn grow_toward_target(&mut self, create_info: &P::CreateInfo) {
        let missing = self.target_count().saturating_sub(self.available_len());
        let count = missing.min(self.headroom());

        for _ in 0..count {
            if let Err(error) = self.create_available(create_info) {
                warn!("{} maintenance refill failed: {error}", P::NAME_PREFIX);
                break;
            }
        }
    }
}

/// Evict expired, rarely used idle records until the target count is reached
///
/// Candidates must be idle past the reclaim threshold and used fewer than
/// `reclaim_usage_threshold` times. The least used go first.
pub fn trim_idle_records<P: PoolPolicy>(pass: &mut MaintenancePass<'_, P>) {
    let target = pass.target_count();
    let available = pass.available_len();
    if available <= target {
        return;
    }

    let usage_threshold = pass.config().reclaim_usage_threshold;
    let mut candidates: Vec<(RecordKey, u64, u64)> = pass
        .available_records()
        .filter(|(_, info)| pass.is_expired(info) && info.usage_count() < usage_threshold)
        .map(|(key, info)| (key, info.usage_count(), info.last_used_ms()))
        .collect();
    candidates.sort_by_key(|&(_, usage_count, last_used_ms)| (usage_count, last_used_ms));

    let victims: Vec<RecordKey> = candidates
        .into_iter()
        .take(available - target)
        .map(|(key, _, _)| key)
        .collect();
    pass.evict_all(&victims);
}

struct MaintenanceSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background thread running [`PoolPolicy::optimize`] every maintenance
/// interval until stopped
pub(crate) struct MaintenanceWorker {
    signal: Arc<MaintenanceSignal>,
    thread: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    pub(crate) fn spawn<P: PoolPolicy>(shared: Arc<PoolShared<P>>) -> PoolResult<Self> {
        let signal = Arc::new(MaintenanceSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);

        let thread = thread::Builder::new()
            .name(format!("{}-maintenance", P::NAME_PREFIX))
            .spawn(move || loop {
                let deadline = Instant::now() + shared.maintenance_interval();

                let mut stopped = thread_signal.stopped.lock();
                while !*stopped {
                    if thread_signal.wake.wait_until(&mut stopped, deadline).timed_out() {
                        break;
                    }
                }
                if *stopped {
                    break;
                }
                drop(stopped);

                shared.run_maintenance();
            })
            .map_err(|error| PoolError::creation_failed(format!("maintenance thread: {error}")))?;

        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    /// Signal the thread and wait for it to exit
    pub(crate) fn stop(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Pool maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
