//! # Adaptive Memstream
//!
//! Memory-aware adaptive chunking and streaming for bulk processing of large
//! files and in-memory collections.
//!
//! ## Features
//!
//! - **Memory telemetry**: System and process memory snapshots via `sysinfo`
//! - **Pressure classification**: Normal, high and critical thresholds with
//!   admission checks and advisory reclamation
//! - **Adaptive sizing**: Chunk, line-batch and item-batch sizes derived from
//!   current availability and observed step times
//! - **Lazy streaming**: Binary chunks, text line batches and collection
//!   slices processed one unit per pull, with files closed on every exit path
//! - **Scoped monitoring**: Before/after usage reports for any block of work
//!
//! ## Example
//!
//! ```rust,no_run
//! use adaptive_memstream::{OpenMode, StreamingContext};
//!
//! let ctx = StreamingContext::new().unwrap();
//! let chunks = ctx.stream_binary(
//!     "large_file.bin",
//!     |chunk: &[u8], _index| {
//!         Ok::<_, std::io::Error>(chunk.iter().filter(|b| **b == b'\n').count())
//!     },
//!     OpenMode::BinaryRead,
//!     true,
//! );
//! for unit in chunks {
//!     let unit = unit.unwrap();
//!     println!("Chunk {}: {} bytes, {} newlines", unit.index, unit.len, unit.output);
//! }
//! ```

pub mod chunk_strategy;
pub mod config;
pub mod error;
pub mod memory_manager;
pub mod probe;
pub mod reclaim;
pub mod stats;
pub mod streaming;

// Re-exports
pub use chunk_strategy::AdaptiveSizer;
pub use config::MemoryConfig;
pub use error::{BoxError, Result, StreamingError};
pub use memory_manager::{
    MemoryManager, MemoryScope, MemoryUsageReport, PressureLevel, ReclaimOutcome,
};
pub use probe::{MemoryProbe, ScriptedProbe, SysinfoProbe};
pub use reclaim::{ReclaimHooks, Reclaimer};
pub use stats::MemoryStats;
pub use streaming::{
    BinaryStream, CollectionStream, FileHandle, OpenMode, Processed, StreamingContext, TextStream,
};
