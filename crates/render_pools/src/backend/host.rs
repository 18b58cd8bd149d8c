//! Headless host-memory backend
//!
//! Staging buffers backed by `Vec<u8>`, and command pools and command
//! buffers that only count resets. Used by the stress tool and by tests on
//! machines without a GPU. An optional memory budget makes allocation
//! failures reproducible.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use log::trace;

use super::{
    check_range, format, CommandBufferAllocator, CommandPoolFactory, ImageAliasInfo, StagingBuffer,
    StagingBufferAllocator, TransferDirection,
};
use crate::pool::error::{PoolError, PoolResult};

/// Byte accounting shared by an allocator and its live buffers
#[derive(Debug, Default)]
struct HostMemory {
    live_bytes: AtomicU64,
    allocations: AtomicU64,
}

/// Staging buffer in ordinary host memory
#[derive(Debug)]
pub struct HostStagingBuffer {
    data: Vec<u8>,
    direction: TransferDirection,
    name: String,
    alias: Option<HostAliasedImage>,
    memory: Arc<HostMemory>,
}

impl HostStagingBuffer {
    /// Debug name given at creation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direction the buffer was created for
    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// Currently aliased image
    pub fn aliased_image(&self) -> Option<&HostAliasedImage> {
        self.alias.as_ref()
    }
}

impl Drop for HostStagingBuffer {
    fn drop(&mut self) {
        self.memory.live_bytes.fetch_sub(self.data.len() as u64, Ordering::AcqRel);
    }
}

/// Image description recorded by [`HostStagingBuffer::alias_image`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAliasedImage {
    /// Aliased image format
    pub format: vk::Format,
    /// Aliased image extent
    pub extent: vk::Extent3D,
    /// Bytes of buffer memory the image covers
    pub data_size: u64,
}

impl StagingBuffer for HostStagingBuffer {
    type AliasedImage = HostAliasedImage;

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn write_bytes(&mut self, offset: u64, data: &[u8]) -> PoolResult<()> {
        let range = check_range(offset, data.len(), self.size())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn read_bytes(&self, offset: u64, out: &mut [u8]) -> PoolResult<()> {
        let range = check_range(offset, out.len(), self.size())?;
        out.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn alias_image(&mut self, origin_format: vk::Format, info: &ImageAliasInfo) -> Option<&HostAliasedImage> {
        self.alias = None;

        if !format::is_aliasing_compatible(origin_format, info.format) {
            return None;
        }
        let data_size = info.data_size()?;
        if data_size > self.size() {
            return None;
        }

        self.alias = Some(HostAliasedImage {
            format: info.format,
            extent: info.extent,
            data_size,
        });
        self.alias.as_ref()
    }

    fn clear_alias(&mut self) {
        self.alias = None;
    }
}

/// Allocates [`HostStagingBuffer`]s
#[derive(Debug, Default)]
pub struct HostStagingAllocator {
    memory: Arc<HostMemory>,
    budget: Option<u64>,
}

impl HostStagingAllocator {
    /// Allocator without a memory limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator that fails once live buffers would exceed `budget` bytes
    pub fn with_budget(budget: u64) -> Self {
        Self {
            memory: Arc::default(),
            budget: Some(budget),
        }
    }

    /// Bytes held by live buffers
    pub fn live_bytes(&self) -> u64 {
        self.memory.live_bytes.load(Ordering::Acquire)
    }

    /// Successful allocations so far
    pub fn allocation_count(&self) -> u64 {
        self.memory.allocations.load(Ordering::Acquire)
    }

    /// Zeroed storage, reporting exhaustion instead of aborting
    fn zeroed(size: u64) -> Result<Vec<u8>, String> {
        let len = usize::try_from(size).map_err(|_| format!("{size} bytes is not addressable"))?;

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|error| format!("host allocation of {size} bytes failed: {error}"))?;
        data.resize(len, 0);
        Ok(data)
    }
}

impl StagingBufferAllocator for HostStagingAllocator {
    type Buffer = HostStagingBuffer;

    fn allocate(&self, size: u64, direction: TransferDirection, name: &str) -> PoolResult<HostStagingBuffer> {
        let reserved = self.memory.live_bytes.fetch_add(size, Ordering::AcqRel).saturating_add(size);
        if self.budget.is_some_and(|budget| reserved > budget) {
            self.memory.live_bytes.fetch_sub(size, Ordering::AcqRel);
            return Err(PoolError::creation_failed(format!(
                "host budget exceeded allocating {size} bytes for {name}"
            )));
        }

        let data = match Self::zeroed(size) {
            Ok(data) => data,
            Err(reason) => {
                self.memory.live_bytes.fetch_sub(size, Ordering::AcqRel);
                return Err(PoolError::creation_failed(format!("{name}: {reason}")));
            }
        };

        self.memory.allocations.fetch_add(1, Ordering::AcqRel);
        trace!("Host staging buffer {name}: {size} bytes ({})", direction.label());

        Ok(HostStagingBuffer {
            data,
            direction,
            name: name.to_string(),
            alias: None,
            memory: Arc::clone(&self.memory),
        })
    }
}

/// Stand-in for a native command pool
#[derive(Debug)]
pub struct HostCommandPool {
    id: u64,
    queue_family: u32,
    flags: vk::CommandPoolCreateFlags,
    name: String,
    reset_count: u32,
}

impl HostCommandPool {
    /// Identity assigned by the factory
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue family the pool was created for
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Creation flags
    pub fn flags(&self) -> vk::CommandPoolCreateFlags {
        self.flags
    }

    /// Debug name given at creation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Times the pool has been reset
    pub fn reset_count(&self) -> u32 {
        self.reset_count
    }
}

/// Creates [`HostCommandPool`]s
#[derive(Debug, Default)]
pub struct HostCommandPoolFactory {
    next_id: AtomicU64,
    fail_resets: AtomicBool,
}

impl HostCommandPoolFactory {
    /// New factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent resets fail, as a lost device would
    pub fn set_fail_resets(&self, fail: bool) {
        self.fail_resets.store(fail, Ordering::Release);
    }

    /// Pools created so far
    pub fn created_count(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }
}

impl CommandPoolFactory for HostCommandPoolFactory {
    type Pool = HostCommandPool;

    fn create(&self, queue_family: u32, flags: vk::CommandPoolCreateFlags, name: &str) -> PoolResult<HostCommandPool> {
        Ok(HostCommandPool {
            id: self.next_id.fetch_add(1, Ordering::AcqRel),
            queue_family,
            flags,
            name: name.to_string(),
            reset_count: 0,
        })
    }

    fn reset(&self, pool: &mut HostCommandPool) -> PoolResult<()> {
        if self.fail_resets.load(Ordering::Acquire) {
            return Err(PoolError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        pool.reset_count += 1;
        Ok(())
    }
}

/// Stand-in for a native command buffer
#[derive(Debug)]
pub struct HostCommandBuffer {
    id: u64,
    level: vk::CommandBufferLevel,
    name: String,
    reset_count: u32,
}

impl HostCommandBuffer {
    /// Identity assigned by the allocator
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Primary or secondary
    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    /// Debug name given at allocation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Times the buffer has been reset
    pub fn reset_count(&self) -> u32 {
        self.reset_count
    }
}

/// Allocates [`HostCommandBuffer`]s for one queue family
#[derive(Debug, Default)]
pub struct HostCommandBufferAllocator {
    queue_family: u32,
    next_id: AtomicU64,
    fail_allocations: AtomicBool,
    fail_resets: AtomicBool,
}

impl HostCommandBufferAllocator {
    /// Allocator for `queue_family`
    pub fn new(queue_family: u32) -> Self {
        Self {
            queue_family,
            ..Self::default()
        }
    }

    /// Make subsequent allocations fail, as an exhausted pool would
    pub fn set_fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::Release);
    }

    /// Make subsequent resets fail, as a lost device would
    pub fn set_fail_resets(&self, fail: bool) {
        self.fail_resets.store(fail, Ordering::Release);
    }

    /// Buffers allocated so far
    pub fn allocated_count(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }
}

impl CommandBufferAllocator for HostCommandBufferAllocator {
    type Buffer = HostCommandBuffer;

    fn queue_family(&self) -> u32 {
        self.queue_family
    }

    fn allocate(&self, level: vk::CommandBufferLevel, name: &str) -> PoolResult<HostCommandBuffer> {
        if self.fail_allocations.load(Ordering::Acquire) {
            return Err(PoolError::creation_failed(format!(
                "vkAllocateCommandBuffers for {name}: {:?}",
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            )));
        }

        Ok(HostCommandBuffer {
            id: self.next_id.fetch_add(1, Ordering::AcqRel),
            level,
            name: name.to_string(),
            reset_count: 0,
        })
    }

    fn reset(&self, buffer: &mut HostCommandBuffer) -> PoolResult<()> {
        if self.fail_resets.load(Ordering::Acquire) {
            return Err(PoolError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        buffer.reset_count += 1;
        Ok(())
    }
}
