//! Sizing formulas for chunks and batches
//!
//! Everything here is a pure function of the configured bounds and the
//! memory figures passed in, so it can be exercised without a live probe.

use crate::config::MemoryConfig;

/// Headroom multiplier applied to availability checks
pub const SAFETY_FACTOR: f64 = 1.2;

/// Minimum lines per text batch under adaptive sizing
pub const MIN_LINE_BUFFER: usize = 100;

/// Growth bias when pressure is normal
pub const NORMAL_PRESSURE_FACTOR: f64 = 1.2;

/// Shrink bias when pressure is high
pub const HIGH_PRESSURE_FACTOR: f64 = 0.7;

/// Share of total memory a text batch may assume before shrinking
const LINE_BUFFER_RESERVE: f64 = 0.2;

/// Maps memory availability and configured bounds to chunk and batch sizes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveSizer {
    pub min_batch_bytes: u64,
    pub max_batch_bytes: u64,
    pub target_step_secs: f64,
}

impl AdaptiveSizer {
    pub fn new(min_batch_bytes: u64, max_batch_bytes: u64, target_step_secs: f64) -> Self {
        Self {
            min_batch_bytes,
            max_batch_bytes,
            target_step_secs,
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(
            config.min_batch_size_bytes,
            config.max_batch_size_bytes,
            config.target_step_time.as_secs_f64(),
        )
    }

    /// Whether `required` bytes fit in `available` after the safety margin
    pub fn fits(available: u64, required: u64) -> bool {
        available as f64 / SAFETY_FACTOR >= required as f64
    }

    /// Items per batch: half of available memory, capped at the batch
    /// maximum, divided by the item size. Never below one item.
    pub fn item_batch(&self, available: u64, item_size_bytes: u64) -> usize {
        let usable = (available / 2).min(self.max_batch_bytes);
        let count = usable / item_size_bytes.max(1);
        usize::try_from(count).unwrap_or(usize::MAX).max(1)
    }

    /// Next batch size from the last batch's duration.
    ///
    /// Scales towards the target step time, biased by pressure, and never
    /// more than doubles in one step.
    pub fn next_item_batch(&self, current: usize, elapsed_secs: f64, high_pressure: bool) -> usize {
        if elapsed_secs.is_nan() || elapsed_secs <= 0.0 {
            return current;
        }
        let raw = (self.target_step_secs / elapsed_secs) * current as f64;
        let factor = if high_pressure {
            HIGH_PRESSURE_FACTOR
        } else {
            NORMAL_PRESSURE_FACTOR
        };
        let cap = current.saturating_mul(2) as f64;
        (raw * factor).min(cap).max(1.0) as usize
    }

    /// Byte chunk size: 5% of available memory within the batch bounds
    pub fn chunk_bytes(&self, available: u64) -> usize {
        let bytes = (available / 20).clamp(self.min_batch_bytes, self.max_batch_bytes);
        usize::try_from(bytes).unwrap_or(usize::MAX)
    }

    /// Lines per text batch, shrunk once availability drops under a fifth of
    /// total memory and never below [`MIN_LINE_BUFFER`].
    pub fn line_batch(line_buffer_size: usize, available: u64, total: u64) -> usize {
        let factor = if total == 0 {
            1.0
        } else {
            (available as f64 / (total as f64 * LINE_BUFFER_RESERVE)).min(1.0)
        };
        let lines = (line_buffer_size as f64 * factor).round_ties_even() as usize;
        lines.max(MIN_LINE_BUFFER)
    }
}

impl Default for AdaptiveSizer {
    fn default() -> Self {
        Self::from_config(&MemoryConfig::default())
    }
}
