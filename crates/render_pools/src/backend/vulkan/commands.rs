//! Command pool and command buffer creation and recycling

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::VulkanDevice;
use crate::backend::{CommandBufferAllocator, CommandPoolFactory};
use crate::pool::error::{PoolError, PoolResult};

/// Command pool wrapper with RAII cleanup
pub struct VulkanCommandPool {
    device: Arc<VulkanDevice>,
    command_pool: vk::CommandPool,
    queue_family: u32,
}

impl VulkanCommandPool {
    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Queue family the pool records for
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate command buffers
    pub fn allocate_command_buffers(&self, level: vk::CommandBufferLevel, count: u32) -> PoolResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(level)
            .command_buffer_count(count);

        let command_buffers = unsafe { self.device.device().allocate_command_buffers(&alloc_info)? };
        Ok(command_buffers)
    }
}

impl Drop for VulkanCommandPool {
    fn drop(&mut self) {
        // Destroying the pool frees every command buffer allocated from it
        unsafe {
            self.device.device().destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Creates [`VulkanCommandPool`]s on one device
pub struct VulkanCommandPoolFactory {
    device: Arc<VulkanDevice>,
}

impl VulkanCommandPoolFactory {
    /// Factory for `device`
    pub fn new(device: Arc<VulkanDevice>) -> Self {
        Self { device }
    }
}

impl CommandPoolFactory for VulkanCommandPoolFactory {
    type Pool = VulkanCommandPool;

    fn create(&self, queue_family: u32, flags: vk::CommandPoolCreateFlags, name: &str) -> PoolResult<VulkanCommandPool> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(flags)
            .queue_family_index(queue_family);

        let command_pool = unsafe { self.device.device().create_command_pool(&pool_create_info, None) }
            .map_err(|result| PoolError::creation_failed(format!("vkCreateCommandPool for {name}: {result:?}")))?;
        self.device.set_object_name(command_pool, name);

        Ok(VulkanCommandPool {
            device: Arc::clone(&self.device),
            command_pool,
            queue_family,
        })
    }

    fn reset(&self, pool: &mut VulkanCommandPool) -> PoolResult<()> {
        unsafe {
            self.device
                .device()
                .reset_command_pool(pool.command_pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES)?;
        }
        Ok(())
    }
}

/// Resettable command pool shared by an allocator and its buffers
///
/// Vulkan requires host access to a command pool to be externally
/// synchronized, including freeing or resetting its buffers.
struct SharedCommandPool {
    pool: Mutex<VulkanCommandPool>,
}

/// Allocates [`VulkanCommandBuffer`]s from one `RESET_COMMAND_BUFFER` pool
pub struct VulkanCommandBufferAllocator {
    shared: Arc<SharedCommandPool>,
    queue_family: u32,
}

impl VulkanCommandBufferAllocator {
    /// Create the backing command pool for `queue_family`
    pub fn new(device: Arc<VulkanDevice>, queue_family: u32) -> PoolResult<Self> {
        let name = format!("CommandBufferPool_QueueFamily_{queue_family}");
        let pool = VulkanCommandPoolFactory::new(device).create(
            queue_family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            &name,
        )?;

        Ok(Self {
            shared: Arc::new(SharedCommandPool { pool: Mutex::new(pool) }),
            queue_family,
        })
    }
}

impl CommandBufferAllocator for VulkanCommandBufferAllocator {
    type Buffer = VulkanCommandBuffer;

    fn queue_family(&self) -> u32 {
        self.queue_family
    }

    fn allocate(&self, level: vk::CommandBufferLevel, name: &str) -> PoolResult<VulkanCommandBuffer> {
        let pool = self.shared.pool.lock();
        let handle = pool
            .allocate_command_buffers(level, 1)
            .map_err(|error| PoolError::creation_failed(format!("vkAllocateCommandBuffers for {name}: {error}")))?
            .into_iter()
            .next()
            .ok_or_else(|| PoolError::creation_failed(format!("no command buffer returned for {name}")))?;
        pool.device.set_object_name(handle, name);
        drop(pool);

        Ok(VulkanCommandBuffer {
            shared: Arc::clone(&self.shared),
            handle,
            level,
        })
    }

    fn reset(&self, buffer: &mut VulkanCommandBuffer) -> PoolResult<()> {
        let pool = self.shared.pool.lock();
        unsafe {
            pool.device
                .device()
                .reset_command_buffer(buffer.handle, vk::CommandBufferResetFlags::RELEASE_RESOURCES)?;
        }
        Ok(())
    }
}

/// Command buffer that is freed back to its pool on drop
pub struct VulkanCommandBuffer {
    shared: Arc<SharedCommandPool>,
    handle: vk::CommandBuffer,
    level: vk::CommandBufferLevel,
}

impl VulkanCommandBuffer {
    /// Command buffer handle for recording and submission
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Primary or secondary
    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }
}

impl Drop for VulkanCommandBuffer {
    fn drop(&mut self) {
        let pool = self.shared.pool.lock();
        unsafe {
            pool.device.device().free_command_buffers(pool.command_pool, &[self.handle]);
        }
    }
}
