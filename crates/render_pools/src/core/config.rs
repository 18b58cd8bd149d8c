//! # Pool Configuration
//!
//! Construction parameters for every pool type. Each pool owns a copy of its
//! configuration; there is no process-wide pool state.
//!
//! ## Configuration Categories
//!
//! - **Pool Config**: limits and timing shared by all pools
//! - **Eviction Policy**: staging-buffer growth and eviction heuristics
//! - **Staging Pool Config**: one staging pool per transfer direction
//! - **Command Pool Config**: command pool pools, one per queue family
//! - **Command Buffer Pool Config**: command buffers from one resettable pool
//! - **Pools Config**: file-loadable bundle of all of the above

use serde::{Deserialize, Serialize};

use crate::backend::TransferDirection;
use crate::config::{Config, ConfigError};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// # Pool Configuration
///
/// Limits and timing knobs for a single [`ResourcePool`](crate::pool::ResourcePool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Floor of idle records the maintenance pass keeps around
    pub min_available: u32,
    /// Ceiling on available plus busy records
    pub max_allocated: u32,
    /// Idle time after which a record becomes a reclaim candidate
    pub reclaim_threshold_ms: u64,
    /// Records acquired fewer times than this are low-value reclaim candidates
    pub reclaim_usage_threshold: u64,
    /// Period of the background maintenance pass
    pub maintenance_interval_ms: u64,
    /// How long an acquirer at the ceiling waits for a compatible release
    /// before falling back to emergency handling. Zero fails fast.
    pub exhaustion_wait_ms: u64,
    /// Spawn the background maintenance thread
    pub background_maintenance: bool,
}

impl PoolConfig {
    /// Create a configuration with the given limits and timing
    pub fn new(min_available: u32, max_allocated: u32, reclaim_threshold_ms: u64, maintenance_interval_ms: u64) -> Self {
        Self {
            min_available,
            max_allocated,
            reclaim_threshold_ms,
            maintenance_interval_ms,
            ..Self::default()
        }
    }

    /// Set the available floor
    pub fn with_min_available(mut self, min_available: u32) -> Self {
        self.min_available = min_available;
        self
    }

    /// Set the allocation ceiling
    pub fn with_max_allocated(mut self, max_allocated: u32) -> Self {
        self.max_allocated = max_allocated;
        self
    }

    /// Set the reclaim threshold
    pub fn with_reclaim_threshold_ms(mut self, reclaim_threshold_ms: u64) -> Self {
        self.reclaim_threshold_ms = reclaim_threshold_ms;
        self
    }

    /// Set the usage count below which idle records may be reclaimed
    pub fn with_reclaim_usage_threshold(mut self, reclaim_usage_threshold: u64) -> Self {
        self.reclaim_usage_threshold = reclaim_usage_threshold;
        self
    }

    /// Set the maintenance period
    pub fn with_maintenance_interval_ms(mut self, maintenance_interval_ms: u64) -> Self {
        self.maintenance_interval_ms = maintenance_interval_ms;
        self
    }

    /// Wait up to `exhaustion_wait_ms` for a release when the pool is full
    pub fn with_exhaustion_wait_ms(mut self, exhaustion_wait_ms: u64) -> Self {
        self.exhaustion_wait_ms = exhaustion_wait_ms;
        self
    }

    /// Enable or disable the background maintenance thread
    ///
    /// With maintenance disabled the owner drives
    /// [`run_maintenance`](crate::pool::ResourcePool::run_maintenance) itself.
    pub fn with_background_maintenance(mut self, enabled: bool) -> Self {
        self.background_maintenance = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_allocated == 0 {
            return Err("Max allocated resource limit must be at least 1".to_string());
        }

        if self.min_available > self.max_allocated {
            return Err(format!(
                "Min available limit ({}) exceeds max allocated limit ({})",
                self.min_available, self.max_allocated
            ));
        }

        if self.maintenance_interval_ms == 0 || self.maintenance_interval_ms >= u64::from(u32::MAX / 2) {
            return Err(format!(
                "Maintenance interval must be in 1..{} ms, got {}",
                u32::MAX / 2,
                self.maintenance_interval_ms
            ));
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_available: 2,
            max_allocated: 32,
            reclaim_threshold_ms: 5_000,
            reclaim_usage_threshold: 5,
            maintenance_interval_ms: 10_000,
            exhaustion_wait_ms: 0,
            background_maintenance: true,
        }
    }
}

/// # Eviction Policy
///
/// Growth and eviction heuristics of the staging buffer pool, exposed as
/// named fields so small-scale tests can exercise them deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionPolicy {
    /// Idle buffers above this size are compacted away every pass
    pub compact_size_threshold: u64,
    /// Idle buffers above this size are always released
    pub large_buffer_threshold: u64,
    /// A reused buffer may be at most this multiple of the aligned request
    pub oversize_factor: u64,
    /// ...or at most this many bytes above the raw request
    pub oversize_slack: u64,
    /// Size of buffers created when the pool refills toward its target
    pub refill_size: u64,
    /// Emergency growth multiplier while below the largest tier
    pub growth_factor: f64,
    /// Emergency growth multiplier once past the largest tier
    pub capped_growth_factor: f64,
}

impl EvictionPolicy {
    /// Set the compaction size threshold
    pub fn with_compact_size_threshold(mut self, threshold: u64) -> Self {
        self.compact_size_threshold = threshold;
        self
    }

    /// Set the refill buffer size
    pub fn with_refill_size(mut self, size: u64) -> Self {
        self.refill_size = size;
        self
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), String> {
        if self.oversize_factor == 0 {
            return Err("Oversize factor must be at least 1".to_string());
        }

        let valid_growth = |factor: f64| factor.is_finite() && factor >= 1.0;
        if !valid_growth(self.growth_factor) || !valid_growth(self.capped_growth_factor) {
            return Err(format!(
                "Growth factors must be finite and >= 1.0, got {} and {}",
                self.growth_factor, self.capped_growth_factor
            ));
        }

        if self.refill_size == 0 {
            return Err("Refill size must be non-zero".to_string());
        }

        Ok(())
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            compact_size_threshold: 32 * MIB,
            large_buffer_threshold: 256 * MIB,
            oversize_factor: 2,
            oversize_slack: MIB,
            refill_size: 4 * MIB,
            growth_factor: 2.0,
            capped_growth_factor: 1.5,
        }
    }
}

/// # Staging Pool Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingPoolConfig {
    /// Limits and timing
    pub pool: PoolConfig,
    /// Host-to-device or device-to-host
    pub direction: TransferDirection,
    /// Growth and eviction heuristics
    pub eviction: EvictionPolicy,
}

impl StagingPoolConfig {
    /// Defaults for uploads (host to device)
    pub fn submit() -> Self {
        Self {
            pool: PoolConfig::new(4, 64, 1_000, 5_000),
            direction: TransferDirection::Submit,
            eviction: EvictionPolicy::default(),
        }
    }

    /// Defaults for readbacks (device to host)
    pub fn fetch() -> Self {
        Self {
            pool: PoolConfig::new(2, 8, 10_000, 60_000),
            direction: TransferDirection::Fetch,
            eviction: EvictionPolicy::default(),
        }
    }

    /// Replace the limits and timing
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Replace the eviction policy
    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.pool.validate()?;
        self.eviction.validate()
    }
}

impl Default for StagingPoolConfig {
    fn default() -> Self {
        Self::submit()
    }
}

/// # Command Pool Configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPoolConfig {
    /// Limits and timing, applied to every queue family's pool
    pub pool: PoolConfig,
}

impl CommandPoolConfig {
    /// Replace the limits and timing
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.pool.validate()
    }
}

impl Default for CommandPoolConfig {
    fn default() -> Self {
        // Command pools are cheap; size the ceiling generously
        Self {
            pool: PoolConfig::new(2, 64, 5_000, 10_000),
        }
    }
}

/// # Command Buffer Pool Configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandBufferPoolConfig {
    /// Limits and timing
    pub pool: PoolConfig,
}

impl CommandBufferPoolConfig {
    /// Replace the limits and timing
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.pool.validate()
    }
}

impl Default for CommandBufferPoolConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::new(4, 128, 5_000, 10_000),
        }
    }
}

/// # Pools Configuration
///
/// File-loadable bundle describing every pool a renderer sets up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    /// Upload staging pool
    pub staging_submit: StagingPoolConfig,
    /// Readback staging pool
    pub staging_fetch: StagingPoolConfig,
    /// Command pool pools
    pub command_pools: CommandPoolConfig,
    /// Command buffer pools
    pub command_buffers: CommandBufferPoolConfig,
    /// Size of each descriptor heap carved up by a heap allocator
    pub descriptor_heap_size: u64,
}

impl PoolsConfig {
    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.staging_submit
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("staging_submit: {e}")))?;
        self.staging_fetch
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("staging_fetch: {e}")))?;
        self.command_pools
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("command_pools: {e}")))?;
        self.command_buffers
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("command_buffers: {e}")))?;

        if self.descriptor_heap_size == 0 {
            return Err(ConfigError::Invalid("descriptor_heap_size must be non-zero".to_string()));
        }

        Ok(())
    }
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            staging_submit: StagingPoolConfig::submit(),
            staging_fetch: StagingPoolConfig::fetch(),
            command_pools: CommandPoolConfig::default(),
            command_buffers: CommandBufferPoolConfig::default(),
            descriptor_heap_size: 64 * MIB,
        }
    }
}

impl Config for PoolsConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_validate() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(StagingPoolConfig::submit().validate().is_ok());
        assert!(StagingPoolConfig::fetch().validate().is_ok());
        assert!(CommandPoolConfig::default().validate().is_ok());
        assert!(CommandBufferPoolConfig::default().validate().is_ok());
        assert!(PoolsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_pool_config_rejects_inverted_limits() {
        let config = PoolConfig::new(8, 4, 1_000, 1_000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_config_rejects_bad_interval() {
        assert!(PoolConfig::default().with_maintenance_interval_ms(0).validate().is_err());
        assert!(PoolConfig::default()
            .with_maintenance_interval_ms(u64::from(u32::MAX))
            .validate()
            .is_err());
    }

    #[test]
    fn test_eviction_policy_rejects_shrinking_growth() {
        let policy = EvictionPolicy {
            growth_factor: 0.5,
            ..EvictionPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_eviction_policy_rejects_non_finite_growth() {
        let nan = EvictionPolicy {
            growth_factor: f64::NAN,
            ..EvictionPolicy::default()
        };
        assert!(nan.validate().is_err());

        let infinite = EvictionPolicy {
            capped_growth_factor: f64::INFINITY,
            ..EvictionPolicy::default()
        };
        assert!(infinite.validate().is_err());
    }

    #[test]
    fn test_pools_config_toml_round_trip() {
        let config = PoolsConfig::default();
        let text = toml::to_string_pretty(&config).expect("serialize");
        let parsed: PoolsConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_pools_config_partial_ron_uses_defaults() {
        let parsed: PoolsConfig = ron::from_str("(descriptor_heap_size: 1024)").expect("parse");
        assert_eq!(parsed.descriptor_heap_size, 1024);
        assert_eq!(parsed.staging_submit, StagingPoolConfig::submit());
    }

    #[test]
    fn test_pools_config_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("render_pools_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("pools.ron");

        let mut config = PoolsConfig::default();
        config.command_pools.pool.max_allocated = 7;
        config.save_to_file(&path).expect("save");

        let loaded = PoolsConfig::load_from_file(&path).expect("load");
        assert_eq!(loaded, config);

        let bad = dir.join("pools.yaml");
        assert!(matches!(
            PoolsConfig::load_from_file(&bad),
            Err(ConfigError::Io(_) | ConfigError::UnsupportedFormat(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
