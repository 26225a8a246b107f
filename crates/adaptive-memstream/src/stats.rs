//! Point-in-time memory snapshots

use std::fmt;

const GIB: f64 = (1u64 << 30) as f64;
const MIB: f64 = (1u64 << 20) as f64;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Immutable snapshot of system and process memory.
///
/// A new value is produced on every sample; snapshots are never updated in
/// place, so they can be copied freely between consumers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStats {
    /// Total system memory in bytes
    pub total: u64,
    /// Memory available to new allocations in bytes
    pub available: u64,
    /// Memory in use system-wide in bytes
    pub used: u64,
    /// System-wide used percentage, 0–100
    pub percent: f64,
    /// Resident memory of the current process in bytes
    pub process_used: u64,
}

impl MemoryStats {
    pub fn new(total: u64, available: u64, used: u64, percent: f64, process_used: u64) -> Self {
        Self {
            total,
            available,
            used,
            percent,
            process_used,
        }
    }

    /// Build a snapshot deriving `used` and `percent` from total and available
    pub fn from_available(total: u64, available: u64, process_used: u64) -> Self {
        let used = total.saturating_sub(available);
        let percent = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        };
        Self::new(total, available, used, percent, process_used)
    }

    pub fn total_gb(&self) -> f64 {
        round2(self.total as f64 / GIB)
    }

    pub fn available_gb(&self) -> f64 {
        round2(self.available as f64 / GIB)
    }

    pub fn used_gb(&self) -> f64 {
        round2(self.used as f64 / GIB)
    }

    pub fn process_used_mb(&self) -> f64 {
        round2(self.process_used as f64 / MIB)
    }

    /// Used memory as a fraction of total, 0–1
    pub fn used_fraction(&self) -> f64 {
        self.percent / 100.0
    }
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Memory Stats: {:.1}% used | Available: {:.2} GB | Process using: {:.2} MB",
            self.percent,
            self.available_gb(),
            self.process_used_mb()
        )
    }
}
