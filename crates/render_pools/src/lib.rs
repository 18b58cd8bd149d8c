//! # Render Pools
//!
//! Thread-safe reuse of GPU resources that are too slow to create per frame.
//!
//! ## Features
//!
//! - **Generic Pool Engine**: [`ResourcePool`](pool::ResourcePool) with
//!   policy hooks, RAII guards and background maintenance
//! - **Staging Buffers**: size-tiered host-visible buffers with bounded reuse,
//!   emergency growth at the ceiling and linear image aliasing
//! - **Command Pools**: one pool per queue family, reset on return
//! - **Command Buffers**: level-matched buffers from a resettable command pool
//! - **Heap Allocator**: first-fit sub-allocation of descriptor heaps with
//!   coalescing
//! - **Backends**: `ash` Vulkan implementation and a headless host backend
//!
//! ## Quick Start
//!
//! ```rust
//! use render_pools::prelude::*;
//!
//! fn main() -> Result<(), PoolError> {
//!     let config = StagingPoolConfig::submit().with_pool(PoolConfig::default().with_background_maintenance(false));
//!     let pool = StagingBufferPool::new(HostStagingAllocator::new(), config)?;
//!
//!     let mut buffer = pool.acquire_buffer(100 * 1024)?;
//!     buffer.write_bytes(0, b"vertex data")?;
//!
//!     // Returned to the pool here
//!     drop(buffer);
//!     assert_eq!(pool.statistics().busy, 0);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod backend;
pub mod config;
pub mod core;
pub mod foundation;
pub mod heap;
pub mod pool;

/// Common imports for pool users
pub mod prelude {
    pub use crate::{
        backend::{
            host::{HostCommandBufferAllocator, HostCommandPoolFactory, HostStagingAllocator},
            CommandBufferAllocator, CommandPoolFactory, ImageAliasInfo, StagingBuffer, StagingBufferAllocator,
            TransferDirection,
        },
        config::{Config, ConfigError},
        core::config::{
            CommandBufferPoolConfig, CommandPoolConfig, EvictionPolicy, PoolConfig, PoolsConfig, StagingPoolConfig,
        },
        heap::{HeapAllocator, HeapError},
        pool::{
            CommandBufferPool, CommandPoolManager, CommandPoolPool, EmergencyOutcome, PoolError, PoolPolicy,
            PoolResult, PoolStatistics, ResourceGuard, ResourcePool, StagingBufferPool,
        },
    };
}
