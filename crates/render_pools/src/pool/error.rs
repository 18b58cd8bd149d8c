//! Pool error types

use ash::vk;
use thiserror::Error;

/// Errors surfaced by resource pools
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The native allocation backing a new resource failed
    #[error("Resource creation failed: {reason}")]
    CreationFailed {
        /// What the backend reported
        reason: String,
    },

    /// No compatible idle resource, no creation headroom and emergency
    /// handling could not satisfy the request
    #[error("Pool exhausted: {busy} busy of {max_allocated} allowed; raise the limit or reduce concurrency")]
    PoolExhausted {
        /// Configured allocation ceiling
        max_allocated: u32,
        /// Resources checked out when the request failed
        busy: u32,
    },

    /// A guard handed back a resource the pool does not consider borrowed
    #[error("Invalid guard use: {reason}")]
    InvalidGuardUse {
        /// Description of the broken ownership invariant
        reason: String,
    },

    /// Host access outside a staging buffer
    #[error("Access of {len} bytes at offset {offset} exceeds buffer size {size}")]
    OutOfBounds {
        /// First byte accessed
        offset: u64,
        /// Bytes accessed
        len: u64,
        /// Buffer size
        size: u64,
    },

    /// Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Vulkan(vk::Result),

    /// Rejected pool configuration
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Build a creation failure from any displayable cause
    pub fn creation_failed(reason: impl std::fmt::Display) -> Self {
        Self::CreationFailed {
            reason: reason.to_string(),
        }
    }

    /// Whether the error came from the allocation ceiling rather than the device
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}

impl From<vk::Result> for PoolError {
    fn from(result: vk::Result) -> Self {
        Self::Vulkan(result)
    }
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;
