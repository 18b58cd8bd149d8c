//! Command buffer pooling from one resettable command pool
//!
//! Buffers are matched by level and reset on return. At the ceiling the
//! least used idle buffer is handed out again when its level fits; a buffer
//! of the other level is swapped for a freshly allocated one.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use ash::vk;
use log::info;

use super::error::{PoolError, PoolResult};
use super::guard::ResourceGuard;
use super::maintenance::MaintenanceReport;
use super::policy::{EmergencyOutcome, PoolPolicy};
use super::record::{PoolStatistics, RecordInfo};
use super::resource_pool::ResourcePool;
use crate::backend::CommandBufferAllocator;
use crate::core::config::CommandBufferPoolConfig;
use crate::foundation::time::{Clock, SystemClock};

/// Native command buffer plus its level
pub struct PooledCommandBuffer<B> {
    native: B,
    level: vk::CommandBufferLevel,
}

impl<B> PooledCommandBuffer<B> {
    /// Primary or secondary
    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }
}

impl<B> Deref for PooledCommandBuffer<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.native
    }
}

impl<B> DerefMut for PooledCommandBuffer<B> {
    fn deref_mut(&mut self) -> &mut B {
        &mut self.native
    }
}

/// Pool policy for command buffers of one command pool
pub struct CommandBufferPolicy<A: CommandBufferAllocator> {
    allocator: A,
}

impl<A: CommandBufferAllocator> CommandBufferPolicy<A> {
    /// Backend the buffers come from
    pub fn allocator(&self) -> &A {
        &self.allocator
    }
}

impl<A: CommandBufferAllocator> PoolPolicy for CommandBufferPolicy<A> {
    type Resource = PooledCommandBuffer<A::Buffer>;
    type CreateInfo = vk::CommandBufferLevel;
    type Metadata = vk::CommandBufferLevel;

    const NAME_PREFIX: &'static str = "CommandBuffer";

    fn create_resource(
        &self,
        level: &vk::CommandBufferLevel,
        name: &str,
    ) -> PoolResult<(Self::Resource, vk::CommandBufferLevel)> {
        let native = self.allocator.allocate(*level, name)?;
        Ok((PooledCommandBuffer { native, level: *level }, *level))
    }

    fn handle_emergency(
        &self,
        level: &vk::CommandBufferLevel,
        low_usage: &RecordInfo<vk::CommandBufferLevel>,
    ) -> EmergencyOutcome<vk::CommandBufferLevel> {
        if low_usage.metadata() == level {
            EmergencyOutcome::Reuse
        } else {
            EmergencyOutcome::Replace(*level)
        }
    }

    fn describe(&self, buffer: &Self::Resource) -> vk::CommandBufferLevel {
        buffer.level
    }

    fn on_release(&self, buffer: &mut Self::Resource) -> PoolResult<()> {
        self.allocator.reset(&mut buffer.native)
    }

    fn refill_create_info(&self) -> Option<vk::CommandBufferLevel> {
        Some(vk::CommandBufferLevel::PRIMARY)
    }
}

/// Guard over a pooled command buffer
pub type CommandBufferGuard<A> = ResourceGuard<CommandBufferPolicy<A>>;

/// Pool of command buffers allocated from a single command pool
pub struct CommandBufferPool<A: CommandBufferAllocator> {
    pool: ResourcePool<CommandBufferPolicy<A>>,
}

impl<A: CommandBufferAllocator> CommandBufferPool<A> {
    /// Create an empty pool over `allocator`
    pub fn new(allocator: A, config: &CommandBufferPoolConfig) -> PoolResult<Self> {
        Self::with_clock(allocator, config, Arc::new(SystemClock::new()))
    }

    /// Create an empty pool with an explicit clock
    pub fn with_clock(allocator: A, config: &CommandBufferPoolConfig, clock: Arc<dyn Clock>) -> PoolResult<Self> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let queue_family = allocator.queue_family();
        let pool = ResourcePool::with_clock(CommandBufferPolicy { allocator }, config.pool.clone(), clock)?;
        info!("Command buffer pool ready for queue family {queue_family}");

        Ok(Self { pool })
    }

    /// Acquire a reset command buffer of `level`
    pub fn acquire_buffer(&self, level: vk::CommandBufferLevel) -> PoolResult<CommandBufferGuard<A>> {
        self.pool.acquire_with(&level, |info| *info.metadata() == level)
    }

    /// Queue family of the backing command pool
    pub fn queue_family(&self) -> u32 {
        self.pool.policy().allocator().queue_family()
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
    pub fn pool(&self) -> &ResourcePool<CommandBufferPolicy<A>> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostCommandBufferAllocator;
    use crate::core::config::PoolConfig;
    use crate::foundation::time::ManualClock;
    use std::collections::HashSet;

    fn buffer_pool(min: u32, max: u32) -> CommandBufferPool<HostCommandBufferAllocator> {
        let config = CommandBufferPoolConfig::default()
            .with_pool(PoolConfig::new(min, max, 1_000, 1_000).with_background_maintenance(false));
        CommandBufferPool::with_clock(HostCommandBufferAllocator::new(3), &config, Arc::new(ManualClock::new(0)))
            .expect("pool")
    }

    #[test]
    fn test_buffers_are_reset_and_reused() {
        let pool = buffer_pool(0, 4);
        assert_eq!(pool.queue_family(), 3);

        let first = pool.acquire_buffer(vk::CommandBufferLevel::PRIMARY).expect("acquire");
        let id = first.id();
        assert_eq!(first.reset_count(), 0);
        drop(first);

        let again = pool.acquire_buffer(vk::CommandBufferLevel::PRIMARY).expect("acquire");
        assert_eq!(again.id(), id);
        assert_eq!(again.reset_count(), 1);
        assert_eq!(pool.pool().policy().allocator().allocated_count(), 1);
    }

    #[test]
    fn test_levels_are_not_mixed() {
        let pool = buffer_pool(0, 4);
        drop(pool.acquire_buffer(vk::CommandBufferLevel::PRIMARY).expect("primary"));

        let secondary = pool.acquire_buffer(vk::CommandBufferLevel::SECONDARY).expect("secondary");
        assert_eq!(secondary.level(), vk::CommandBufferLevel::SECONDARY);
        assert_eq!(pool.statistics().available, 1);
        assert_eq!(pool.statistics().total_created, 2);
    }

    #[test]
    fn test_ceiling_reuses_low_usage_buffer_of_same_level() {
        let pool = buffer_pool(0, 2);

        let held = pool.acquire_buffer(vk::CommandBufferLevel::PRIMARY).expect("held");
        let idle = pool.acquire_buffer(vk::CommandBufferLevel::PRIMARY).expect("idle");
        let idle_id = idle.id();
        drop(idle);

        // Nothing passes the caller's filter, but the idle buffer has the right level
        let reused = pool
            .pool()
            .acquire_with(&vk::CommandBufferLevel::PRIMARY, |info| info.usage_count() > 100)
            .expect("emergency reuse");
        assert_eq!(reused.id(), idle_id);
        assert_ne!(reused.id(), held.id());
        drop(reused);

        let stats = pool.statistics();
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.total_evicted, 0);
    }

    #[test]
    fn test_ceiling_replaces_buffer_of_other_level() {
        let pool = buffer_pool(0, 2);

        let _held = pool.acquire_buffer(vk::CommandBufferLevel::PRIMARY).expect("held");
        let idle = pool.acquire_buffer(vk::CommandBufferLevel::PRIMARY).expect("idle");
        let idle_id = idle.id();
        drop(idle);

        let swapped = pool.acquire_buffer(vk::CommandBufferLevel::SECONDARY).expect("swap");
        assert_eq!(swapped.level(), vk::CommandBufferLevel::SECONDARY);
        assert_ne!(swapped.id(), idle_id);

        let stats = pool.statistics();
        assert_eq!(stats.total_evicted, 1);
        assert_eq!(stats.allocated(), 2);
    }

    #[test]
    fn test_exhausted_with_nothing_idle() {
        let pool = buffer_pool(0, 1);
        let _held = pool.acquire_buffer(vk::CommandBufferLevel::PRIMARY).expect("held");

        let error = pool
            .acquire_buffer(vk::CommandBufferLevel::PRIMARY)
            .expect_err("nothing idle");
        assert!(error.is_exhaustion());
    }

    #[test]
    fn test_allocation_failure_reaches_caller() {
        let pool = buffer_pool(0, 4);
        pool.pool().policy().allocator().set_fail_allocations(true);

        let error = pool
            .acquire_buffer(vk::CommandBufferLevel::PRIMARY)
            .expect_err("allocation fails");
        assert!(matches!(error, PoolError::CreationFailed { .. }));
        assert_eq!(pool.statistics().allocated(), 0);
    }

    #[test]
    fn test_failed_reset_discards_buffer() {
        let pool = buffer_pool(0, 4);
        let buffer = pool.acquire_buffer(vk::CommandBufferLevel::PRIMARY).expect("acquire");
        pool.pool().policy().allocator().set_fail_resets(true);
        drop(buffer);

        let stats = pool.statistics();
        assert_eq!(stats.available, 0);
        assert_eq!(stats.total_evicted, 1);
    }

    #[test]
    fn test_maintenance_refills_primary_buffers() {
        let pool = buffer_pool(3, 8);
        let report = pool.run_maintenance();
        assert_eq!(report.created, 3);

        let guards: Vec<_> = (0..3)
            .map(|_| pool.acquire_buffer(vk::CommandBufferLevel::PRIMARY).expect("acquire"))
            .collect();
        let names: HashSet<String> = guards.iter().map(|guard| guard.name().to_string()).collect();
        assert_eq!(names.len(), 3);
        assert_eq!(pool.statistics().total_created, 3);
    }
}
