//! Foundation module - Core utilities shared by every pool
//!
//! This module provides the low-level pieces the pools are built on:
//! - Monotonic clocks (real and simulated)
//! - Arena handle types
//! - Logging utilities

pub mod collections;
pub mod logging;
pub mod time;
