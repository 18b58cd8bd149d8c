//! Persistently mapped staging buffers
//!
//! Each buffer owns its own `VkDeviceMemory` so an aliased linear image can
//! be bound at offset zero of the same allocation.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use log::{debug, trace};

use super::VulkanDevice;
use crate::backend::{check_range, format, ImageAliasInfo, StagingBuffer, StagingBufferAllocator, TransferDirection};
use crate::pool::error::{PoolError, PoolResult};

/// Allocates [`VulkanStagingBuffer`]s on one device
pub struct VulkanStagingAllocator {
    device: Arc<VulkanDevice>,
}

impl VulkanStagingAllocator {
    /// Allocator for `device`
    pub fn new(device: Arc<VulkanDevice>) -> Self {
        Self { device }
    }
}

impl StagingBufferAllocator for VulkanStagingAllocator {
    type Buffer = VulkanStagingBuffer;

    fn allocate(&self, size: u64, direction: TransferDirection, name: &str) -> PoolResult<VulkanStagingBuffer> {
        VulkanStagingBuffer::new(Arc::clone(&self.device), size, direction, name)
    }
}

/// Host-visible transfer buffer with its own dedicated memory
pub struct VulkanStagingBuffer {
    device: Arc<VulkanDevice>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    allocation_size: vk::DeviceSize,
    mapped: NonNull<u8>,
    coherent: bool,
    alias: Option<VulkanAliasedImage>,
}

// SAFETY: `mapped` points into `memory`, which this value exclusively owns
// until drop; the pool never hands the same buffer to two owners.
unsafe impl Send for VulkanStagingBuffer {}

impl VulkanStagingBuffer {
    /// Create, bind and map a buffer of `size` bytes
    pub fn new(device: Arc<VulkanDevice>, size: u64, direction: TransferDirection, name: &str) -> PoolResult<Self> {
        let vk_device = device.device();

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { vk_device.create_buffer(&buffer_info, None) }
            .map_err(|result| PoolError::creation_failed(format!("vkCreateBuffer for {name}: {result:?}")))?;

        let requirements = unsafe { vk_device.get_buffer_memory_requirements(buffer) };

        // Fall back to any host-visible type when the preferred one is missing
        let memory_type = device
            .find_memory_type(requirements.memory_type_bits, direction.memory_properties())
            .or_else(|| device.find_memory_type(requirements.memory_type_bits, vk::MemoryPropertyFlags::HOST_VISIBLE));
        let Some((memory_type_index, memory_flags)) = memory_type else {
            unsafe { vk_device.destroy_buffer(buffer, None) };
            return Err(PoolError::creation_failed(format!("no host-visible memory type for {name}")));
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { vk_device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(result) => {
                unsafe { vk_device.destroy_buffer(buffer, None) };
                return Err(PoolError::creation_failed(format!(
                    "vkAllocateMemory of {} bytes for {name}: {result:?}",
                    requirements.size
                )));
            }
        };

        let mapped = unsafe {
            vk_device
                .bind_buffer_memory(buffer, memory, 0)
                .and_then(|()| vk_device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()))
        };
        let mapped = match mapped.map(|ptr| NonNull::new(ptr.cast::<u8>())) {
            Ok(Some(mapped)) => mapped,
            Ok(None) | Err(_) => {
                unsafe {
                    vk_device.destroy_buffer(buffer, None);
                    vk_device.free_memory(memory, None);
                }
                return Err(PoolError::creation_failed(format!("failed to bind or map {name}")));
            }
        };

        device.set_object_name(buffer, name);
        device.set_object_name(memory, name);
        trace!("Staging buffer {name}: {size} bytes, memory type {memory_type_index} ({memory_flags:?})");

        Ok(Self {
            device,
            buffer,
            memory,
            size,
            allocation_size: requirements.size,
            mapped,
            coherent: memory_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
            alias: None,
        })
    }

    /// Buffer handle for transfer commands
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Currently aliased image
    pub fn aliased_image(&self) -> Option<&VulkanAliasedImage> {
        self.alias.as_ref()
    }

    fn whole_range(&self) -> vk::MappedMemoryRange {
        vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build()
    }

    fn create_alias(&self, origin_format: vk::Format, info: &ImageAliasInfo) -> Option<VulkanAliasedImage> {
        if !format::is_aliasing_compatible(origin_format, info.format) {
            return None;
        }

        let instance = self.device.instance();
        let physical_device = self.device.physical_device();
        let vk_device = self.device.device();

        let sampled = |candidate: vk::Format| {
            let properties = unsafe { instance.get_physical_device_format_properties(physical_device, candidate) };
            (
                properties.linear_tiling_features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE),
                properties.optimal_tiling_features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE),
            )
        };
        let (src_linear, src_optimal) = sampled(origin_format);
        let (dst_linear, dst_optimal) = sampled(info.format);
        if !(src_linear && dst_linear) && !(src_optimal && dst_optimal) {
            return None;
        }

        let dst_properties = unsafe { instance.get_physical_device_format_properties(physical_device, info.format) };
        if !dst_properties.linear_tiling_features.contains(vk::FormatFeatureFlags::BLIT_SRC) {
            return None;
        }

        let data_size = info.data_size()?;
        if data_size > self.allocation_size {
            return None;
        }

        let limits = unsafe {
            instance.get_physical_device_image_format_properties(
                physical_device,
                info.format,
                vk::ImageType::TYPE_2D,
                vk::ImageTiling::LINEAR,
                vk::ImageUsageFlags::TRANSFER_SRC,
                vk::ImageCreateFlags::empty(),
            )
        }
        .ok()?;
        if info.extent.width > limits.max_extent.width
            || info.extent.height > limits.max_extent.height
            || info.extent.depth > limits.max_extent.depth
            || data_size > limits.max_resource_size
        {
            return None;
        }

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(info.format)
            .extent(info.extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::PREINITIALIZED);

        let image = unsafe { vk_device.create_image(&image_info, None) }.ok()?;
        let alias = VulkanAliasedImage {
            device: Arc::clone(&self.device),
            image,
            info: *info,
        };

        let subresource = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };
        let layout = unsafe { vk_device.get_image_subresource_layout(image, subresource) };
        let requirements = unsafe { vk_device.get_image_memory_requirements(image) };
        if layout.size != data_size || requirements.size > self.allocation_size {
            debug!("Aliased image layout does not match tightly packed data ({} != {data_size})", layout.size);
            return None;
        }

        unsafe { vk_device.bind_image_memory(image, self.memory, 0) }.ok()?;
        Some(alias)
    }
}

impl StagingBuffer for VulkanStagingBuffer {
    type AliasedImage = VulkanAliasedImage;

    fn size(&self) -> u64 {
        self.size
    }

    fn write_bytes(&mut self, offset: u64, data: &[u8]) -> PoolResult<()> {
        let range = check_range(offset, data.len(), self.size)?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.mapped.as_ptr().add(range.start), data.len());
        }

        if !self.coherent {
            unsafe { self.device.device().flush_mapped_memory_ranges(&[self.whole_range()]) }?;
        }
        Ok(())
    }

    fn read_bytes(&self, offset: u64, out: &mut [u8]) -> PoolResult<()> {
        let range = check_range(offset, out.len(), self.size)?;

        if !self.coherent {
            unsafe { self.device.device().invalidate_mapped_memory_ranges(&[self.whole_range()]) }?;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(self.mapped.as_ptr().add(range.start), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn alias_image(&mut self, origin_format: vk::Format, info: &ImageAliasInfo) -> Option<&VulkanAliasedImage> {
        self.alias = None;
        self.alias = self.create_alias(origin_format, info);
        self.alias.as_ref()
    }

    fn clear_alias(&mut self) {
        self.alias = None;
    }
}

impl Drop for VulkanStagingBuffer {
    fn drop(&mut self) {
        // The aliased image must go before the memory it is bound to
        self.alias = None;

        let vk_device = self.device.device();
        unsafe {
            vk_device.unmap_memory(self.memory);
            vk_device.destroy_buffer(self.buffer, None);
            vk_device.free_memory(self.memory, None);
        }
    }
}

/// Linear image bound to a staging buffer's memory
pub struct VulkanAliasedImage {
    device: Arc<VulkanDevice>,
    image: vk::Image,
    info: ImageAliasInfo,
}

impl VulkanAliasedImage {
    /// Image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Format and extent the image was created with
    pub fn info(&self) -> &ImageAliasInfo {
        &self.info
    }
}

impl Drop for VulkanAliasedImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device().destroy_image(self.image, None);
        }
    }
}
