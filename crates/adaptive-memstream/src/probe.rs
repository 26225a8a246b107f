//! Memory telemetry sources
//!
//! A [`MemoryProbe`] answers "how much memory does the machine and this
//! process use right now". It must be cheap and safe to call repeatedly;
//! the manager re-samples before every pressure or availability decision.

use std::collections::VecDeque;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::stats::MemoryStats;

/// Synchronous source of memory snapshots
pub trait MemoryProbe: Send + Sync {
    /// Sample system and process memory
    fn sample(&self) -> MemoryStats;

    /// Resident bytes of the current process
    fn process_resident(&self) -> u64 {
        self.sample().process_used
    }
}

/// Probe backed by `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        Self {
            system: Mutex::new(system),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    fn resident(system: &mut System, pid: Option<Pid>) -> u64 {
        let Some(pid) = pid else {
            return 0;
        };
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn sample(&self) -> MemoryStats {
        let mut system = self.system.lock();
        system.refresh_memory();

        let total = system.total_memory();
        let available = system.available_memory();
        let used = system.used_memory();
        // Pressure is measured against what is not available, like the kernel reports it
        let percent = if total == 0 {
            0.0
        } else {
            total.saturating_sub(available) as f64 / total as f64 * 100.0
        };
        let process_used = Self::resident(&mut system, self.pid);

        MemoryStats::new(total, available, used, percent, process_used)
    }

    fn process_resident(&self) -> u64 {
        let mut system = self.system.lock();
        Self::resident(&mut system, self.pid)
    }
}

/// Probe that replays a fixed script of snapshots.
///
/// Each sample pops the next queued snapshot; once the queue is drained the
/// fallback snapshot repeats. Useful for simulations and deterministic tests.
pub struct ScriptedProbe {
    state: Mutex<Script>,
}

struct Script {
    queue: VecDeque<MemoryStats>,
    fallback: MemoryStats,
    samples: usize,
}

impl ScriptedProbe {
    pub fn new(initial: MemoryStats) -> Self {
        Self {
            state: Mutex::new(Script {
                queue: VecDeque::new(),
                fallback: initial,
                samples: 0,
            }),
        }
    }

    /// Replay `snapshots` in order, repeating `fallback` once they run out
    pub fn from_sequence(
        fallback: MemoryStats,
        snapshots: impl IntoIterator<Item = MemoryStats>,
    ) -> Self {
        let probe = Self::new(fallback);
        probe.state.lock().queue.extend(snapshots);
        probe
    }

    /// Queue a snapshot after the ones already scripted
    pub fn push(&self, stats: MemoryStats) {
        self.state.lock().queue.push_back(stats);
    }

    /// Drop any queued snapshots and report `stats` from now on
    pub fn set(&self, stats: MemoryStats) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.fallback = stats;
    }

    /// Number of samples taken so far
    pub fn sample_count(&self) -> usize {
        self.state.lock().samples
    }
}

impl MemoryProbe for ScriptedProbe {
    fn sample(&self) -> MemoryStats {
        let mut state = self.state.lock();
        state.samples += 1;
        match state.queue.pop_front() {
            Some(next) => next,
            None => state.fallback,
        }
    }
}
