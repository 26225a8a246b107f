//! Memory telemetry, admission control and batch sizing

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::chunk_strategy::AdaptiveSizer;
use crate::config::MemoryConfig;
use crate::error::{Result, StreamingError};
use crate::probe::{MemoryProbe, SysinfoProbe};
use crate::reclaim::{ReclaimHooks, Reclaimer};
use crate::stats::MemoryStats;

/// Memory pressure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal,
    High,
    Critical,
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PressureLevel::Normal => write!(f, "normal"),
            PressureLevel::High => write!(f, "high"),
            PressureLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Memory state on both sides of a reclamation attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReclaimOutcome {
    pub before: MemoryStats,
    pub after: MemoryStats,
}

impl ReclaimOutcome {
    /// Change in available memory; negative if availability dropped
    pub fn freed_bytes(&self) -> i64 {
        self.after.available as i64 - self.before.available as i64
    }
}

/// Shared handle to memory telemetry and sizing decisions.
///
/// Cloning is cheap and clones observe the same snapshot, so several
/// streaming contexts can share one manager. Readings are advisory: a
/// snapshot may be stale by the time it is used.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<MemoryManagerInner>,
}

struct MemoryManagerInner {
    config: MemoryConfig,
    sizer: AdaptiveSizer,
    probe: Arc<dyn MemoryProbe>,
    reclaimer: Arc<dyn Reclaimer>,
    hooks: Option<Arc<ReclaimHooks>>,
    stats: RwLock<MemoryStats>,
}

impl MemoryManager {
    /// Create a manager with default configuration over live system memory
    pub fn new() -> Result<Self> {
        Self::with_config(MemoryConfig::default())
    }

    pub fn with_config(config: MemoryConfig) -> Result<Self> {
        Self::with_probe(config, Arc::new(SysinfoProbe::new()))
    }

    /// Create a manager over `probe` that reclaims through its own
    /// [`ReclaimHooks`], reachable via [`reclaim_hooks`](Self::reclaim_hooks)
    pub fn with_probe(config: MemoryConfig, probe: Arc<dyn MemoryProbe>) -> Result<Self> {
        let hooks = Arc::new(ReclaimHooks::new());
        Self::build(config, probe, hooks.clone(), Some(hooks))
    }

    /// Create a manager from explicit telemetry and reclamation collaborators
    pub fn with_parts(
        config: MemoryConfig,
        probe: Arc<dyn MemoryProbe>,
        reclaimer: Arc<dyn Reclaimer>,
    ) -> Result<Self> {
        Self::build(config, probe, reclaimer, None)
    }

    fn build(
        config: MemoryConfig,
        probe: Arc<dyn MemoryProbe>,
        reclaimer: Arc<dyn Reclaimer>,
        hooks: Option<Arc<ReclaimHooks>>,
    ) -> Result<Self> {
        config.validate()?;
        let stats = probe.sample();
        debug!(%stats, "Memory manager initialized");

        Ok(Self {
            inner: Arc::new(MemoryManagerInner {
                sizer: AdaptiveSizer::from_config(&config),
                config,
                probe,
                reclaimer,
                hooks,
                stats: RwLock::new(stats),
            }),
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }

    /// Release callbacks run on reclamation.
    ///
    /// `None` when the manager was built with a caller-supplied reclaimer.
    pub fn reclaim_hooks(&self) -> Option<&ReclaimHooks> {
        self.inner.hooks.as_deref()
    }

    pub fn sizer(&self) -> AdaptiveSizer {
        self.inner.sizer
    }

    /// Last observed snapshot, without sampling
    pub fn stats(&self) -> MemoryStats {
        *self.inner.stats.read()
    }

    /// Sample memory, replace the cached snapshot and return it
    pub fn refresh_stats(&self) -> MemoryStats {
        let stats = self.inner.probe.sample();
        *self.inner.stats.write() = stats;
        debug!(%stats, "Memory sampled");
        stats
    }

    /// Resident bytes of the current process, sampled now
    pub fn process_resident(&self) -> u64 {
        self.inner.probe.process_resident()
    }

    /// Classify a snapshot against the configured thresholds
    pub fn classify(&self, stats: &MemoryStats) -> PressureLevel {
        let used = stats.used_fraction();
        if used >= self.inner.config.critical_memory_threshold {
            PressureLevel::Critical
        } else if used >= self.inner.config.system_memory_threshold {
            PressureLevel::High
        } else {
            PressureLevel::Normal
        }
    }

    pub fn pressure_level(&self) -> PressureLevel {
        let stats = self.refresh_stats();
        self.classify(&stats)
    }

    pub fn is_memory_high(&self) -> bool {
        self.refresh_stats().used_fraction() >= self.inner.config.system_memory_threshold
    }

    pub fn is_memory_critical(&self) -> bool {
        self.refresh_stats().used_fraction() >= self.inner.config.critical_memory_threshold
    }

    /// Whether `required_bytes` fit in currently available memory with headroom
    pub fn check_available_memory(&self, required_bytes: u64) -> bool {
        let stats = self.refresh_stats();
        AdaptiveSizer::fits(stats.available, required_bytes)
    }

    /// Admission gate for memory-hungry operations.
    ///
    /// Reclaims once and re-checks when auto-gc is enabled. Failure is final
    /// for the requested operation.
    pub fn ensure_available_memory(&self, required_bytes: u64) -> Result<()> {
        if self.check_available_memory(required_bytes) {
            return Ok(());
        }

        if self.inner.config.enable_auto_gc {
            self.reclaim();
            if self.check_available_memory(required_bytes) {
                return Ok(());
            }
        }

        let available = self.stats().available;
        warn!(
            required = required_bytes,
            available,
            auto_gc = self.inner.config.enable_auto_gc,
            "Insufficient memory"
        );
        Err(StreamingError::InsufficientMemory {
            required: required_bytes,
            available,
        })
    }

    /// Ask the reclaimer to release memory and report the change.
    ///
    /// Advisory: the outcome may show nothing freed.
    pub fn reclaim(&self) -> ReclaimOutcome {
        let before = self.refresh_stats();
        self.inner.reclaimer.reclaim();
        let after = self.refresh_stats();

        let outcome = ReclaimOutcome { before, after };
        info!(
            freed_bytes = outcome.freed_bytes(),
            process_before = before.process_used,
            process_after = after.process_used,
            "Reclamation finished"
        );
        outcome
    }

    /// Number of items of `item_size_bytes` to process in one batch
    pub fn calculate_batch_size(&self, item_size_bytes: u64) -> usize {
        let stats = self.refresh_stats();
        let size = self.inner.sizer.item_batch(stats.available, item_size_bytes);
        debug!(item_size_bytes, available = stats.available, batch = size, "Batch size");
        size
    }

    /// Next batch size after a batch of `current_batch` items took
    /// `elapsed_seconds`.
    ///
    /// `memory_used_bytes` is recorded for correlation only.
    pub fn adaptive_batch_size(
        &self,
        current_batch: usize,
        elapsed_seconds: f64,
        memory_used_bytes: i64,
    ) -> usize {
        if elapsed_seconds.is_nan() || elapsed_seconds <= 0.0 {
            return current_batch;
        }
        let high = self.is_memory_high();
        let next = self
            .inner
            .sizer
            .next_item_batch(current_batch, elapsed_seconds, high);
        debug!(
            current_batch,
            next,
            elapsed_seconds,
            memory_used_bytes,
            high_pressure = high,
            "Adapted batch size"
        );
        next
    }

    /// Open a monitoring scope around a unit of work.
    ///
    /// With `required_bytes`, the admission gate runs first and no scope is
    /// created when it fails. The scope records its report when finished or
    /// dropped, and reclaims if the work left memory under high pressure.
    pub fn monitor_memory_usage(
        &self,
        label: impl Into<String>,
        required_bytes: Option<u64>,
    ) -> Result<MemoryScope> {
        if let Some(required) = required_bytes {
            self.ensure_available_memory(required)?;
        }
        let before = self.refresh_stats();

        Ok(MemoryScope {
            manager: self.clone(),
            label: label.into(),
            before,
            started: Instant::now(),
            finished: false,
        })
    }

    /// Run `work` inside a monitoring scope
    pub fn monitor<T>(
        &self,
        label: impl Into<String>,
        required_bytes: Option<u64>,
        work: impl FnOnce() -> T,
    ) -> Result<(T, MemoryUsageReport)> {
        let scope = self.monitor_memory_usage(label, required_bytes)?;
        let value = work();
        Ok((value, scope.finish()))
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// What a monitoring scope observed
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryUsageReport {
    pub label: String,
    pub before: MemoryStats,
    pub after: MemoryStats,
    pub elapsed: Duration,
    /// Change in process resident memory across the scope
    pub process_delta_bytes: i64,
    /// Whether the scope exit triggered reclamation
    pub reclaimed: bool,
}

/// Guard returned by [`MemoryManager::monitor_memory_usage`].
///
/// The exit bookkeeping runs exactly once: on [`MemoryScope::finish`], or on
/// drop if the work ended early (error return or panic).
#[must_use = "the scope reports when dropped; bind it for the duration of the work"]
pub struct MemoryScope {
    manager: MemoryManager,
    label: String,
    before: MemoryStats,
    started: Instant,
    finished: bool,
}

impl MemoryScope {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn before(&self) -> MemoryStats {
        self.before
    }

    /// Close the scope and return its report
    pub fn finish(mut self) -> MemoryUsageReport {
        self.complete()
    }

    fn complete(&mut self) -> MemoryUsageReport {
        self.finished = true;
        let after = self.manager.refresh_stats();
        let elapsed = self.started.elapsed();
        let process_delta_bytes = after.process_used as i64 - self.before.process_used as i64;

        info!(
            label = %self.label,
            elapsed_ms = elapsed.as_millis() as u64,
            process_delta_bytes,
            %after,
            "Memory scope finished"
        );

        let reclaimed = self.manager.classify(&after) >= PressureLevel::High;
        if reclaimed {
            warn!(label = %self.label, percent = after.percent, "High memory pressure after scope");
            self.manager.reclaim();
        }

        MemoryUsageReport {
            label: self.label.clone(),
            before: self.before,
            after,
            elapsed,
            process_delta_bytes,
            reclaimed,
        }
    }
}

impl Drop for MemoryScope {
    fn drop(&mut self) {
        if !self.finished {
            self.complete();
        }
    }
}
