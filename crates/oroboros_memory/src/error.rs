//! # Memory Error Types
//!
//! All errors that can occur in the memory subsystem.
//!
//! `OutOfMemory` is the only condition a production configuration can
//! produce. Everything else is an integrity fault raised by the debug
//! checks and is classified by [`MemoryError::is_fatal`].

use std::fmt;

use thiserror::Error;

/// Why an allocation could not be satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OomReason {
    /// The system allocator refused a request.
    SystemAllocator {
        /// Bytes requested from the system.
        bytes: usize,
    },
    /// A pool with no overflow growth ran out of blocks.
    PoolExhausted {
        /// Name of the exhausted pool.
        pool: String,
    },
}

impl fmt::Display for OomReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SystemAllocator { bytes } => {
                write!(f, "system allocator refused {bytes} bytes")
            }
            Self::PoolExhausted { pool } => write!(f, "pool {pool} is exhausted and may not grow"),
        }
    }
}

/// Which integrity check failed on a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorruptionKind {
    /// The magic cookie does not match.
    MagicCookie,
    /// The guard wall before the user data was overwritten.
    Underrun,
    /// The guard wall after the user data was overwritten.
    Overrun,
    /// Free-list or raw-list linkage is inconsistent.
    Linkage,
    /// The handle's generation no longer matches the block (double free).
    StaleHandle,
    /// The block does not belong to the pool or allocator it was handed to.
    ForeignBlock,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MagicCookie => "wrong magic cookie",
            Self::Underrun => "leading guard wall overwritten",
            Self::Overrun => "trailing guard wall overwritten",
            Self::Linkage => "broken block linkage",
            Self::StaleHandle => "stale handle",
            Self::ForeignBlock => "block belongs to another owner",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the memory subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The system allocator failed, or a non-growable pool is full.
    #[error("out of memory: {reason}")]
    OutOfMemory {
        /// What ran out.
        reason: OomReason,
    },

    /// A block failed an integrity check.
    #[error("corrupt block ({kind}), tag {tag:?}")]
    CorruptBlock {
        /// The failed check.
        kind: CorruptionKind,
        /// Tag of the block, or empty if the block could not be found.
        tag: &'static str,
    },

    /// An empty or reserved tag string was supplied.
    #[error("bad tag string {0:?}")]
    BadTag(&'static str),

    /// More blocks were freed than were ever allocated.
    #[error("outstanding block count of {allocator} would go negative")]
    NegativeOutstandingCount {
        /// Allocator whose counter underflowed.
        allocator: String,
    },

    /// Cached counters disagree with a full recount.
    #[error("bookkeeping mismatch in {what}: cached {cached}, recounted {recounted}")]
    BookkeepingMismatch {
        /// Counter that disagreed.
        what: String,
        /// Cached value.
        cached: usize,
        /// Recounted value.
        recounted: usize,
    },

    /// A pool or allocator was destroyed while blocks were still in use.
    #[error("{name} still has {used} blocks in use")]
    PoolNotEmpty {
        /// Pool or allocator name.
        name: String,
        /// Blocks still in use.
        used: usize,
    },

    /// A named pool already exists with a different block size.
    #[error("pool {name} exists with block size {existing}, requested {requested}")]
    PoolSizeMismatch {
        /// Pool name.
        name: String,
        /// Block size of the existing pool.
        existing: usize,
        /// Rounded block size that was requested.
        requested: usize,
    },

    /// Size classes are not strictly increasing.
    #[error("size classes must strictly increase: {previous} is followed by {next}")]
    SizeClassOrder {
        /// Block size of the earlier class.
        previous: usize,
        /// Block size of the offending class.
        next: usize,
    },

    /// More size classes than an allocator can hold.
    #[error("{count} size classes requested, at most {max} allowed")]
    TooManySizeClasses {
        /// Requested class count.
        count: usize,
        /// Allowed class count.
        max: usize,
    },

    /// The pool or allocator has already been destroyed.
    #[error("{0} has been destroyed")]
    Destroyed(String),

    /// The memory manager has not been initialized.
    #[error("memory manager is not initialized")]
    NotInitialized,

    /// The memory manager was initialized twice.
    #[error("memory manager is already initialized")]
    AlreadyInitialized,

    /// The memory manager has been shut down.
    #[error("memory manager has been shut down")]
    ShutDown,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MemoryError {
    /// Shorthand for a system allocator failure.
    #[inline]
    #[must_use]
    pub const fn system_oom(bytes: usize) -> Self {
        Self::OutOfMemory {
            reason: OomReason::SystemAllocator { bytes },
        }
    }

    /// Shorthand for a corrupt block.
    #[inline]
    #[must_use]
    pub const fn corrupt(kind: CorruptionKind, tag: &'static str) -> Self {
        Self::CorruptBlock { kind, tag }
    }

    /// Returns true for integrity faults that leave the heap untrustworthy.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CorruptBlock { .. }
                | Self::BadTag(_)
                | Self::NegativeOutstandingCount { .. }
                | Self::BookkeepingMismatch { .. }
        )
    }

    /// Returns true if this is an out-of-memory condition.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(MemoryError::corrupt(CorruptionKind::Overrun, "x").is_fatal());
        assert!(MemoryError::BadTag("").is_fatal());
        assert!(!MemoryError::system_oom(64).is_fatal());
        assert!(MemoryError::system_oom(64).is_out_of_memory());
        assert!(!MemoryError::ShutDown.is_fatal());
    }

    #[test]
    fn test_display_names_the_pool() {
        let err = MemoryError::OutOfMemory {
            reason: OomReason::PoolExhausted {
                pool: "ParticlePool".to_string(),
            },
        };
        assert!(err.to_string().contains("ParticlePool"));
    }
}
