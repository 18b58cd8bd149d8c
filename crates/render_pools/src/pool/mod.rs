//! # Pools
//!
//! The generic [`ResourcePool`] engine and its specializations: size-tiered
//! staging buffers, per-queue-family command pools and command buffers
//! drawn from one resettable command pool.
//!
//! A pool is parameterized by a [`PoolPolicy`] that supplies creation,
//! matching, exhaustion handling and maintenance. Acquired resources are
//! held through a [`ResourceGuard`] which returns them on drop.

pub mod command;
pub mod command_buffer;
pub mod error;
pub mod guard;
pub mod maintenance;
pub mod policy;
pub mod record;
pub mod resource_pool;
pub mod staging;

pub use command::{
    CommandPoolGuard, CommandPoolManager, CommandPoolPolicy, CommandPoolPool, PooledCommandPool,
    DEFAULT_COMMAND_POOL_FLAGS,
};
pub use command_buffer::{CommandBufferGuard, CommandBufferPolicy, CommandBufferPool, PooledCommandBuffer};
pub use error::{PoolError, PoolResult};
pub use guard::ResourceGuard;
pub use maintenance::{trim_idle_records, MaintenancePass, MaintenanceReport};
pub use policy::{EmergencyOutcome, PoolPolicy};
pub use record::{PoolStatistics, RecordInfo};
pub use resource_pool::ResourcePool;
pub use staging::{align_size, emergency_size, StagingBufferGuard, StagingBufferPool, StagingPolicy, SIZE_TIERS};
