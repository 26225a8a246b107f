//! Configuration for memory-aware sizing

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, StreamingError};

const MIB: u64 = 1024 * 1024;

/// Memory manager configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    /// Used fraction (0–1) at or above which pressure is high
    pub system_memory_threshold: f64,

    /// Used fraction (0–1) at or above which pressure is critical
    pub critical_memory_threshold: f64,

    /// Advisory size for callers choosing their own byte batches. The
    /// built-in sizing formulas read only the min and max bounds.
    pub target_batch_size_bytes: u64,

    /// Upper bound on any byte- or item-based batch
    pub max_batch_size_bytes: u64,

    /// Lower bound on any byte-based batch
    pub min_batch_size_bytes: u64,

    /// Allow admission checks to trigger reclamation
    pub enable_auto_gc: bool,

    /// Duration one batch should take; adaptive sizing steers towards it
    pub target_step_time: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            system_memory_threshold: 0.8,
            critical_memory_threshold: 0.9,
            target_batch_size_bytes: 64 * MIB,
            max_batch_size_bytes: 512 * MIB,
            min_batch_size_bytes: MIB,
            enable_auto_gc: true,
            target_step_time: Duration::from_secs(5),
        }
    }
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `MEMSTREAM_*` environment variables
    ///
    /// Unset variables keep their default; values that fail to parse are
    /// reported rather than ignored.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_var("MEMSTREAM_SYSTEM_THRESHOLD")? {
            cfg.system_memory_threshold = v;
        }
        if let Some(v) = env_var("MEMSTREAM_CRITICAL_THRESHOLD")? {
            cfg.critical_memory_threshold = v;
        }
        if let Some(v) = env_var("MEMSTREAM_TARGET_BATCH_BYTES")? {
            cfg.target_batch_size_bytes = v;
        }
        if let Some(v) = env_var("MEMSTREAM_MAX_BATCH_BYTES")? {
            cfg.max_batch_size_bytes = v;
        }
        if let Some(v) = env_var("MEMSTREAM_MIN_BATCH_BYTES")? {
            cfg.min_batch_size_bytes = v;
        }
        if let Some(v) = env_var("MEMSTREAM_AUTO_GC")? {
            cfg.enable_auto_gc = v;
        }
        if let Some(secs) = env_var::<f64>("MEMSTREAM_TARGET_STEP_SECS")? {
            cfg.target_step_time = Duration::try_from_secs_f64(secs).map_err(|e| {
                StreamingError::InvalidConfig(format!("MEMSTREAM_TARGET_STEP_SECS: {e}"))
            })?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_system_memory_threshold(mut self, fraction: f64) -> Self {
        self.system_memory_threshold = fraction;
        self
    }

    pub fn with_critical_memory_threshold(mut self, fraction: f64) -> Self {
        self.critical_memory_threshold = fraction;
        self
    }

    pub fn with_target_batch_size_bytes(mut self, bytes: u64) -> Self {
        self.target_batch_size_bytes = bytes;
        self
    }

    pub fn with_max_batch_size_bytes(mut self, bytes: u64) -> Self {
        self.max_batch_size_bytes = bytes;
        self
    }

    pub fn with_min_batch_size_bytes(mut self, bytes: u64) -> Self {
        self.min_batch_size_bytes = bytes;
        self
    }

    pub fn with_auto_gc(mut self, enabled: bool) -> Self {
        self.enable_auto_gc = enabled;
        self
    }

    pub fn with_target_step_time(mut self, target: Duration) -> Self {
        self.target_step_time = target;
        self
    }

    /// Check the ordering invariants between bounds and thresholds
    pub fn validate(&self) -> Result<()> {
        if self.min_batch_size_bytes == 0 {
            return Err(StreamingError::InvalidConfig(
                "min_batch_size_bytes must be positive".to_string(),
            ));
        }
        if self.min_batch_size_bytes > self.max_batch_size_bytes {
            return Err(StreamingError::InvalidConfig(format!(
                "min_batch_size_bytes ({}) exceeds max_batch_size_bytes ({})",
                self.min_batch_size_bytes, self.max_batch_size_bytes
            )));
        }
        let (system, critical) = (self.system_memory_threshold, self.critical_memory_threshold);
        if !(system > 0.0 && system <= critical && critical <= 1.0) {
            return Err(StreamingError::InvalidConfig(format!(
                "thresholds must satisfy 0 < system ({system}) <= critical ({critical}) <= 1"
            )));
        }
        if self.target_step_time.is_zero() {
            return Err(StreamingError::InvalidConfig(
                "target_step_time must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| StreamingError::InvalidConfig(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
