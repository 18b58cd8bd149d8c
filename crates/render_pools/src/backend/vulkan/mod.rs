//! Vulkan backend
//!
//! `ash`-backed implementations of the backend traits. The instance and
//! logical device are owned by the application; [`VulkanDevice`] only keeps
//! cloned handles plus the cached memory properties and the optional debug
//! utils loader used to name every pooled object.

use std::ffi::CString;

use ash::extensions::ext::DebugUtils;
use ash::vk::{self, Handle};
use ash::{Device, Instance};
use log::warn;

pub mod buffer;
pub mod commands;

pub use buffer::{VulkanAliasedImage, VulkanStagingAllocator, VulkanStagingBuffer};
pub use commands::{VulkanCommandBuffer, VulkanCommandBufferAllocator, VulkanCommandPool, VulkanCommandPoolFactory};

/// Device handles shared by all Vulkan-backed pools
pub struct VulkanDevice {
    instance: Instance,
    physical_device: vk::PhysicalDevice,
    device: Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    debug_utils: Option<DebugUtils>,
}

impl VulkanDevice {
    /// Wrap application-owned handles
    ///
    /// Pass the debug utils loader when `VK_EXT_debug_utils` is enabled so
    /// pooled objects show up by name in validation and capture tools.
    pub fn new(
        instance: Instance,
        physical_device: vk::PhysicalDevice,
        device: Device,
        debug_utils: Option<DebugUtils>,
    ) -> Self {
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Self {
            instance,
            physical_device,
            device,
            memory_properties,
            debug_utils,
        }
    }

    /// Logical device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Instance the device was created from
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Physical device backing the logical device
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Find a memory type allowed by `type_filter` with all of `properties`
    ///
    /// Returns the type index and its full property flags.
    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<(u32, vk::MemoryPropertyFlags)> {
        (0..self.memory_properties.memory_type_count).find_map(|i| {
            let flags = self.memory_properties.memory_types[i as usize].property_flags;
            ((type_filter & (1 << i)) != 0 && flags.contains(properties)).then_some((i, flags))
        })
    }

    /// Attach a debug name to a Vulkan object; a no-op without debug utils
    pub fn set_object_name<H: Handle>(&self, handle: H, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            warn!("Skipping debug name containing a NUL byte: {name:?}");
            return;
        };

        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&name);

        if let Err(result) = unsafe { debug_utils.set_debug_utils_object_name(self.device.handle(), &name_info) } {
            warn!("Failed to name Vulkan object {name:?}: {result:?}");
        }
    }
}
