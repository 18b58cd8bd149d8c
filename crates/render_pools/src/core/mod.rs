//! # Core Module
//!
//! Shared configuration types for every pool in the crate. Each pool owns
//! its configuration; nothing here is process-global.

pub mod config;

pub use config::{
    CommandBufferPoolConfig,
    CommandPoolConfig,
    EvictionPolicy,
    PoolConfig,
    PoolsConfig,
    StagingPoolConfig,
};
