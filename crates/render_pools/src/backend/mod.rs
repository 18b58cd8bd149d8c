//! # Resource backends
//!
//! The pools never talk to a graphics API directly. They create and recycle
//! resources through the traits in this module, implemented by:
//!
//! - [`vulkan`]: `ash`-backed staging buffers and command pools
//! - [`host`]: plain host memory, for tools and tests without a GPU

use ash::vk;
use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::pool::error::{PoolError, PoolResult};

pub mod format;
pub mod host;
pub mod vulkan;

/// Which way a staging buffer moves data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Host to device uploads; write-combined, host-coherent memory
    #[default]
    Submit,
    /// Device to host readback; host-cached memory
    Fetch,
}

impl TransferDirection {
    /// Memory properties a staging buffer for this direction needs
    pub fn memory_properties(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::Submit => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            Self::Fetch => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        }
    }

    /// Short label used in diagnostic names
    pub fn label(self) -> &'static str {
        match self {
            Self::Submit => "Submit",
            Self::Fetch => "Fetch",
        }
    }
}

/// Linear 2D image to alias onto a staging buffer's memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageAliasInfo {
    /// Format of the aliased image
    pub format: vk::Format,
    /// Image extent; depth is 1 for 2D images
    pub extent: vk::Extent3D,
}

impl ImageAliasInfo {
    /// 2D image of the given format and size
    pub fn new(format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            format,
            extent: vk::Extent3D { width, height, depth: 1 },
        }
    }

    /// Bytes of tightly packed image data, `None` for unknown formats
    pub fn data_size(&self) -> Option<u64> {
        format::image_data_size(self.format, self.extent)
    }
}

/// Host-visible transfer buffer created by a [`StagingBufferAllocator`]
pub trait StagingBuffer: Send + 'static {
    /// Image handle produced by [`alias_image`](Self::alias_image)
    type AliasedImage;

    /// Usable size in bytes
    fn size(&self) -> u64;

    /// Copy `data` into the buffer at `offset`
    fn write_bytes(&mut self, offset: u64, data: &[u8]) -> PoolResult<()>;

    /// Copy buffer contents at `offset` into `out`
    fn read_bytes(&self, offset: u64, out: &mut [u8]) -> PoolResult<()>;

    /// Create an image sharing this buffer's memory
    ///
    /// Returns `None` when the formats cannot alias or the image does not
    /// fit. A previous alias is destroyed first.
    fn alias_image(&mut self, origin_format: vk::Format, info: &ImageAliasInfo) -> Option<&Self::AliasedImage>;

    /// Destroy the aliased image, if any
    fn clear_alias(&mut self);

    /// Copy a slice of plain-old-data values into the buffer
    fn write_pod<T: Pod>(&mut self, offset: u64, data: &[T]) -> PoolResult<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Fill a slice of plain-old-data values from the buffer
    fn read_pod<T: Pod>(&self, offset: u64, out: &mut [T]) -> PoolResult<()> {
        self.read_bytes(offset, bytemuck::cast_slice_mut(out))
    }
}

/// Creates staging buffers for a [`StagingBufferPool`](crate::pool::StagingBufferPool)
pub trait StagingBufferAllocator: Send + Sync + 'static {
    /// Buffer type produced
    type Buffer: StagingBuffer;

    /// Allocate a buffer of at least `size` bytes and give it a debug name
    fn allocate(&self, size: u64, direction: TransferDirection, name: &str) -> PoolResult<Self::Buffer>;
}

/// Creates and recycles native command pools
pub trait CommandPoolFactory: Send + Sync + 'static {
    /// Command pool type produced
    type Pool: Send + 'static;

    /// Create a command pool for `queue_family` and give it a debug name
    fn create(&self, queue_family: u32, flags: vk::CommandPoolCreateFlags, name: &str) -> PoolResult<Self::Pool>;

    /// Reset a pool and release its command buffer memory
    fn reset(&self, pool: &mut Self::Pool) -> PoolResult<()>;
}

/// Allocates command buffers out of a single resettable command pool
///
/// Implementations serialize access to their command pool internally; the
/// pool calls `allocate` and `reset` from any thread.
pub trait CommandBufferAllocator: Send + Sync + 'static {
    /// Command buffer type produced
    type Buffer: Send + 'static;

    /// Queue family of the backing command pool
    fn queue_family(&self) -> u32;

    /// Allocate one command buffer of `level` and give it a debug name
    fn allocate(&self, level: vk::CommandBufferLevel, name: &str) -> PoolResult<Self::Buffer>;

    /// Reset a buffer to the initial state, releasing its recorded memory
    fn reset(&self, buffer: &mut Self::Buffer) -> PoolResult<()>;
}

/// Bounds check shared by the backends' host access paths
pub(crate) fn check_range(offset: u64, len: usize, size: u64) -> PoolResult<std::ops::Range<usize>> {
    let out_of_bounds = || PoolError::OutOfBounds {
        offset,
        len: len as u64,
        size,
    };

    let end = offset.checked_add(len as u64).ok_or_else(out_of_bounds)?;
    if end > size {
        return Err(out_of_bounds());
    }

    let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
    Ok(start..start + len)
}
