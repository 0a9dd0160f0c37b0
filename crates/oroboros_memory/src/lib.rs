//! # OROBOROS Memory
//!
//! The allocator every other subsystem sits on:
//! - Fixed-size slab pools with a growth policy
//! - Size-class routing with a raw fallback for oversized requests
//! - A factory owning every pool, with global usage accounting
//! - Debug instrumentation: guard walls, leak reports, checkpoints
//!
//! ## Architecture Rules
//!
//! 1. **Handles, not pointers** - callers hold generation-checked
//!    [`BlockHandle`]s; user bytes are reached through a lock guard
//! 2. **Fail fast** - allocation succeeds or returns `OutOfMemory`, no retries
//! 3. **Lock order** - factory registry, then allocator, then pool
//!
//! ## Example
//!
//! ```rust,ignore
//! use oroboros_memory::{MemoryConfig, MemoryManager, GLOBAL_NEW_TAG};
//!
//! let memory = MemoryManager::new(MemoryConfig::production());
//! memory.init()?;
//! let block = memory.allocate(100, GLOBAL_NEW_TAG, true)?;
//! memory.with_bytes_mut(block, |bytes| bytes[0] = 1)?;
//! memory.free(block)?;
//! let summary = memory.shutdown()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod accounting;
pub mod arena;
pub mod block;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod factory;
pub mod manager;
pub mod pool;
mod raw;
pub mod report;
pub mod size_class;
mod slab;
pub mod stack_trace;
pub mod system;

pub use accounting::{CategoryUsage, UsageSnapshot, MISC_CATEGORY};
pub use arena::{Arena, ArenaIndex};
pub use block::{AllocatorId, BlockHandle, PoolId};
pub use checkpoint::{CheckpointRecord, Ledger};
pub use config::{DebugOptions, MemoryConfig, PoolSizeOverride, SizeClassConfig, MAX_SIZE_CLASSES};
pub use error::{CorruptionKind, MemoryError, MemoryResult, OomReason};
pub use factory::{AllocatorFactory, Collaborators};
pub use manager::{LifecycleState, MemoryManager, ShutdownSummary, GLOBAL_NEW_TAG, STL_TAG};
pub use pool::{Pool, PoolStats};
pub use report::{substring_leak_filter, LeakFilter, ReportFlags};
pub use size_class::{SizeClassAllocator, SizeClassStats};
pub use stack_trace::{NullStackTracer, StackTracer};
pub use system::{BudgetSystemAllocator, HeapSystemAllocator, SystemAllocator};
