//! # System Allocator
//!
//! The narrow interface through which the memory subsystem obtains backing
//! storage. Nothing else in this crate talks to the global heap directly.
//!
//! A failure here is always surfaced as `OutOfMemory` and never retried.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{MemoryError, MemoryResult};

/// Source of raw backing buffers.
pub trait SystemAllocator: Send + Sync {
    /// Allocates a zero-filled buffer of exactly `bytes` bytes.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the request cannot be satisfied.
    fn raw_allocate(&self, bytes: usize) -> MemoryResult<Box<[u8]>>;

    /// Allocates a buffer whose contents are unspecified.
    ///
    /// Callers overwrite the whole buffer before reading it.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the request cannot be satisfied.
    fn raw_allocate_uninitialized(&self, bytes: usize) -> MemoryResult<Box<[u8]>> {
        self.raw_allocate(bytes)
    }

    /// Returns a buffer to the system.
    fn raw_free(&self, buffer: Box<[u8]>);

    /// Bytes currently held by callers.
    fn outstanding_bytes(&self) -> usize {
        0
    }

    /// Highest value `outstanding_bytes` has reached.
    fn peak_bytes(&self) -> usize {
        0
    }
}

/// System allocator backed by the global Rust heap.
///
/// Reservation goes through `try_reserve_exact`, so an exhausted heap
/// surfaces as `OutOfMemory` instead of aborting the process.
#[derive(Debug, Default)]
pub struct HeapSystemAllocator {
    outstanding: AtomicUsize,
    peak: AtomicUsize,
}

impl HeapSystemAllocator {
    /// Creates a heap-backed system allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn reserve(&self, bytes: usize) -> MemoryResult<Box<[u8]>> {
        let mut buffer: Vec<u8> = Vec::new();
        buffer
            .try_reserve_exact(bytes)
            .map_err(|_| MemoryError::system_oom(bytes))?;
        buffer.resize(bytes, 0);

        let now = self.outstanding.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(now, Ordering::Relaxed);
        Ok(buffer.into_boxed_slice())
    }
}

impl SystemAllocator for HeapSystemAllocator {
    fn raw_allocate(&self, bytes: usize) -> MemoryResult<Box<[u8]>> {
        self.reserve(bytes)
    }

    fn raw_free(&self, buffer: Box<[u8]>) {
        self.outstanding.fetch_sub(buffer.len(), Ordering::Relaxed);
        drop(buffer);
    }

    fn outstanding_bytes(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Heap allocator that refuses requests past a fixed byte budget.
///
/// Used to exercise out-of-memory paths deterministically.
#[derive(Debug)]
pub struct BudgetSystemAllocator {
    heap: HeapSystemAllocator,
    budget: usize,
}

impl BudgetSystemAllocator {
    /// Creates an allocator that will hand out at most `budget` bytes at once.
    ///
    /// # Arguments
    ///
    /// * `budget` - Maximum outstanding bytes
    #[must_use]
    pub const fn new(budget: usize) -> Self {
        Self {
            heap: HeapSystemAllocator::new(),
            budget,
        }
    }

    /// Returns the byte budget.
    #[inline]
    #[must_use]
    pub const fn budget(&self) -> usize {
        self.budget
    }
}

impl SystemAllocator for BudgetSystemAllocator {
    fn raw_allocate(&self, bytes: usize) -> MemoryResult<Box<[u8]>> {
        let outstanding = self.heap.outstanding_bytes();
        if outstanding.saturating_add(bytes) > self.budget {
            tracing::debug!(
                "Budget allocator refused {} bytes ({} of {} in use)",
                bytes,
                outstanding,
                self.budget
            );
            return Err(MemoryError::system_oom(bytes));
        }
        self.heap.raw_allocate(bytes)
    }

    fn raw_free(&self, buffer: Box<[u8]>) {
        self.heap.raw_free(buffer);
    }

    fn outstanding_bytes(&self) -> usize {
        self.heap.outstanding_bytes()
    }

    fn peak_bytes(&self) -> usize {
        self.heap.peak_bytes()
    }
}
