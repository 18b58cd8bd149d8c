//! Command pool pooling, one pool per queue family
//!
//! Command pools are not resizable, so there is no emergency growth: at the
//! ceiling an acquisition fails and the ceiling should be raised instead.
//! Returned pools are reset with `RELEASE_RESOURCES` before reuse.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use ash::vk;
use log::{debug, info};
use parking_lot::RwLock;

use super::error::{PoolError, PoolResult};
use super::guard::ResourceGuard;
use super::maintenance::MaintenanceReport;
use super::policy::{EmergencyOutcome, PoolPolicy};
use super::record::{PoolStatistics, RecordInfo};
use super::resource_pool::ResourcePool;
use crate::backend::CommandPoolFactory;
use crate::core::config::CommandPoolConfig;
use crate::foundation::time::{Clock, SystemClock};

/// Flags of pools created by maintenance refills and [`CommandPoolPool::acquire`]
pub const DEFAULT_COMMAND_POOL_FLAGS: vk::CommandPoolCreateFlags = vk::CommandPoolCreateFlags::TRANSIENT;

/// Native command pool plus the flags it was created with
pub struct PooledCommandPool<P> {
    native: P,
    flags: vk::CommandPoolCreateFlags,
}

impl<P> PooledCommandPool<P> {
    /// Creation flags
    pub fn flags(&self) -> vk::CommandPoolCreateFlags {
        self.flags
    }
}

impl<P> Deref for PooledCommandPool<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.native
    }
}

impl<P> DerefMut for PooledCommandPool<P> {
    fn deref_mut(&mut self) -> &mut P {
        &mut self.native
    }
}

/// Pool policy for the command pools of one queue family
pub struct CommandPoolPolicy<F: CommandPoolFactory> {
    factory: Arc<F>,
    queue_family: u32,
}

impl<F: CommandPoolFactory> CommandPoolPolicy<F> {
    /// Queue family every pool is created for
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }
}

impl<F: CommandPoolFactory> PoolPolicy for CommandPoolPolicy<F> {
    type Resource = PooledCommandPool<F::Pool>;
    type CreateInfo = vk::CommandPoolCreateFlags;
    type Metadata = vk::CommandPoolCreateFlags;

    const NAME_PREFIX: &'static str = "CommandPool";

    fn create_resource(
        &self,
        flags: &vk::CommandPoolCreateFlags,
        name: &str,
    ) -> PoolResult<(Self::Resource, vk::CommandPoolCreateFlags)> {
        let native = self.factory.create(self.queue_family, *flags, name)?;
        Ok((PooledCommandPool { native, flags: *flags }, *flags))
    }

    fn handle_emergency(
        &self,
        _flags: &vk::CommandPoolCreateFlags,
        _low_usage: &RecordInfo<vk::CommandPoolCreateFlags>,
    ) -> EmergencyOutcome<vk::CommandPoolCreateFlags> {
        EmergencyOutcome::Decline
    }

    fn describe(&self, pool: &Self::Resource) -> vk::CommandPoolCreateFlags {
        pool.flags
    }

    fn on_release(&self, pool: &mut Self::Resource) -> PoolResult<()> {
        self.factory.reset(&mut pool.native)
    }

    fn refill_create_info(&self) -> Option<vk::CommandPoolCreateFlags> {
        Some(DEFAULT_COMMAND_POOL_FLAGS)
    }
}

/// Guard over a pooled command pool
pub type CommandPoolGuard<F> = ResourceGuard<CommandPoolPolicy<F>>;

/// Pool of command pools for a single queue family
pub struct CommandPoolPool<F: CommandPoolFactory> {
    pool: ResourcePool<CommandPoolPolicy<F>>,
}

impl<F: CommandPoolFactory> CommandPoolPool<F> {
    /// Create an empty pool for `queue_family`
    pub fn new(factory: Arc<F>, queue_family: u32, config: &CommandPoolConfig) -> PoolResult<Self> {
        Self::with_clock(factory, queue_family, config, Arc::new(SystemClock::new()))
    }

    /// Create an empty pool with an explicit clock
    pub fn with_clock(
        factory: Arc<F>,
        queue_family: u32,
        config: &CommandPoolConfig,
        clock: Arc<dyn Clock>,
    ) -> PoolResult<Self> {
        let policy = CommandPoolPolicy { factory, queue_family };
        let pool = ResourcePool::with_clock(policy, config.pool.clone(), clock)?;
        Ok(Self { pool })
    }

    /// Acquire a command pool created with exactly `flags`
    pub fn acquire_command_pool(&self, flags: vk::CommandPoolCreateFlags) -> PoolResult<CommandPoolGuard<F>> {
        self.pool.acquire_with(&flags, |info| *info.metadata() == flags)
    }

    /// Acquire a pool with [`DEFAULT_COMMAND_POOL_FLAGS`]
    pub fn acquire(&self) -> PoolResult<CommandPoolGuard<F>> {
        self.acquire_command_pool(DEFAULT_COMMAND_POOL_FLAGS)
    }

    /// Queue family the pools record for
    pub fn queue_family(&self) -> u32 {
        self.pool.policy().queue_family()
    }

    /// Current occupancy
    pub fn statistics(&self) -> PoolStatistics {
        self.pool.statistics()
    }

    /// Run one maintenance pass on the calling thread
    pub fn run_maintenance(&self) -> MaintenanceReport {
        self.pool.run_maintenance()
    }

    /// Underlying generic pool, for limits and introspection
    pub fn pool(&self) -> &ResourcePool<CommandPoolPolicy<F>> {
        &self.pool
    }
}

/// Lazily creates one [`CommandPoolPool`] per queue family
pub struct CommandPoolManager<F: CommandPoolFactory> {
    factory: Arc<F>,
    config: CommandPoolConfig,
    clock: Arc<dyn Clock>,
    pools: RwLock<HashMap<u32, Arc<CommandPoolPool<F>>>>,
}

impl<F: CommandPoolFactory> CommandPoolManager<F> {
    /// Manager whose pools share `factory` and `config`
    pub fn new(factory: Arc<F>, config: CommandPoolConfig) -> PoolResult<Self> {
        Self::with_clock(factory, config, Arc::new(SystemClock::new()))
    }

    /// Manager with an explicit clock shared by all its pools
    pub fn with_clock(factory: Arc<F>, config: CommandPoolConfig, clock: Arc<dyn Clock>) -> PoolResult<Self> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        info!(
            "Command pool manager ready (min {}, max {} per queue family)",
            config.pool.min_available, config.pool.max_allocated
        );

        Ok(Self {
            factory,
            config,
            clock,
            pools: RwLock::new(HashMap::new()),
        })
    }

    /// Pool for `queue_family`, created on first use
    pub fn pool_for(&self, queue_family: u32) -> PoolResult<Arc<CommandPoolPool<F>>> {
        if let Some(pool) = self.pools.read().get(&queue_family) {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.pools.write();
        if let Some(pool) = pools.get(&queue_family) {
            return Ok(Arc::clone(pool));
        }

        let pool = Arc::new(CommandPoolPool::with_clock(
            Arc::clone(&self.factory),
            queue_family,
            &self.config,
            Arc::clone(&self.clock),
        )?);
        debug!("Created command pool pool for queue family {queue_family}");
        pools.insert(queue_family, Arc::clone(&pool));

        Ok(pool)
    }

    /// Acquire a command pool for `queue_family` created with `flags`
    pub fn acquire_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> PoolResult<CommandPoolGuard<F>> {
        self.pool_for(queue_family)?.acquire_command_pool(flags)
    }

    /// Statistics of a queue family's pool, if it exists yet
    pub fn statistics(&self, queue_family: u32) -> Option<PoolStatistics> {
        self.pools.read().get(&queue_family).map(|pool| pool.statistics())
    }

    /// Queue families with a pool, ascending
    pub fn queue_families(&self) -> Vec<u32> {
        let mut families: Vec<u32> = self.pools.read().keys().copied().collect();
        families.sort_unstable();
        families
    }

    /// Run maintenance on every queue family's pool
    pub fn run_maintenance(&self) -> Vec<(u32, MaintenanceReport)> {
        let pools: Vec<(u32, Arc<CommandPoolPool<F>>)> = self
            .pools
            .read()
            .iter()
            .map(|(family, pool)| (*family, Arc::clone(pool)))
            .collect();

        pools
            .into_iter()
            .map(|(family, pool)| (family, pool.run_maintenance()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostCommandPoolFactory;
    use crate::core::config::PoolConfig;
    use crate::foundation::time::ManualClock;
    use std::collections::HashSet;

    fn config(min: u32, max: u32) -> CommandPoolConfig {
        CommandPoolConfig::default().with_pool(PoolConfig::new(min, max, 1_000, 1_000).with_background_maintenance(false))
    }

    fn manager(min: u32, max: u32) -> (CommandPoolManager<HostCommandPoolFactory>, Arc<HostCommandPoolFactory>) {
        let factory = Arc::new(HostCommandPoolFactory::new());
        let manager = CommandPoolManager::with_clock(Arc::clone(&factory), config(min, max), Arc::new(ManualClock::new(0)))
            .expect("manager");
        (manager, factory)
    }

    #[test]
    fn test_pools_are_created_per_queue_family() {
        let (manager, _factory) = manager(0, 4);

        let graphics = manager
            .acquire_command_pool(0, DEFAULT_COMMAND_POOL_FLAGS)
            .expect("graphics");
        let transfer = manager
            .acquire_command_pool(2, DEFAULT_COMMAND_POOL_FLAGS)
            .expect("transfer");

        assert_eq!(graphics.queue_family(), 0);
        assert_eq!(transfer.queue_family(), 2);
        assert_eq!(manager.queue_families(), vec![0, 2]);
        assert!(manager.statistics(1).is_none());
    }

    #[test]
    fn test_released_pool_is_reset_and_reused() {
        let (manager, _factory) = manager(0, 4);

        let first = manager.acquire_command_pool(0, DEFAULT_COMMAND_POOL_FLAGS).expect("first");
        let id = first.id();
        drop(first);

        let again = manager.acquire_command_pool(0, DEFAULT_COMMAND_POOL_FLAGS).expect("again");
        assert_eq!(again.id(), id);
        assert_eq!(again.reset_count(), 1);
    }

    #[test]
    fn test_flags_must_match() {
        let (manager, factory) = manager(0, 4);

        drop(manager.acquire_command_pool(0, DEFAULT_COMMAND_POOL_FLAGS).expect("transient"));
        let resettable = manager
            .acquire_command_pool(0, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .expect("resettable");

        assert_eq!(resettable.flags(), vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        assert_eq!(factory.created_count(), 2);
    }

    #[test]
    fn test_ceiling_fails_closed() {
        let (manager, _factory) = manager(0, 2);

        let _a = manager.acquire_command_pool(1, DEFAULT_COMMAND_POOL_FLAGS).expect("a");
        let b = manager.acquire_command_pool(1, DEFAULT_COMMAND_POOL_FLAGS).expect("b");
        assert!(manager
            .acquire_command_pool(1, DEFAULT_COMMAND_POOL_FLAGS)
            .expect_err("ceiling")
            .is_exhaustion());

        // An idle pool with other flags is not grown or repurposed
        drop(b);
        let error = manager
            .acquire_command_pool(1, vk::CommandPoolCreateFlags::PROTECTED)
            .expect_err("no emergency growth");
        assert!(matches!(error, PoolError::PoolExhausted { max_allocated: 2, busy: 1 }));
    }

    #[test]
    fn test_failed_reset_discards_pool() {
        let (manager, factory) = manager(0, 4);

        let pool = manager.acquire_command_pool(0, DEFAULT_COMMAND_POOL_FLAGS).expect("pool");
        factory.set_fail_resets(true);
        drop(pool);

        let stats = manager.statistics(0).expect("stats");
        assert_eq!(stats.available, 0);
        assert_eq!(stats.total_evicted, 1);
    }

    #[test]
    fn test_names_are_unique_across_threads() {
        let (manager, _factory) = manager(0, 64);

        let names: Vec<String> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        (0..8)
                            .map(|_| manager.acquire_command_pool(0, DEFAULT_COMMAND_POOL_FLAGS).expect("acquire"))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            workers
                .into_iter()
                .flat_map(|worker| worker.join().expect("worker"))
                .map(|guard| guard.name().to_string())
                .collect()
        });

        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), 32);
        assert!(names.iter().all(|name| name.starts_with("CommandPool_PoolInst_0x")));
    }

    #[test]
    fn test_maintenance_refills_every_family() {
        let (manager, _factory) = manager(2, 4);
        manager.pool_for(0).expect("family 0");
        manager.pool_for(3).expect("family 3");

        let reports = manager.run_maintenance();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|(_, report)| report.created == 2));
        assert_eq!(manager.statistics(3).expect("stats").available, 2);
    }
}
