//! # Checkpoint Ledger
//!
//! Per-pool (and per-allocator) record of allocation and free events,
//! stamped with the factory's monotonic checkpoint counter.
//!
//! ```text
//! set_checkpoint() -> 3        set_checkpoint() -> 7
//!         │                            │
//!  ───────┼──── alloc A ── free A ─────┼──── alloc B ──▶
//!         │   (transient 3..7)         │   (allocated after 7)
//! ```
//!
//! A record matches a report when both its allocation time and its free
//! time pass the selected filters.

use crate::report::{emit, ReportFlags};
use crate::stack_trace::StackTracer;

/// One allocation, and its free if it has happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Tag of the allocation.
    pub tag: &'static str,
    /// Logical size of the block.
    pub block_size: usize,
    /// Checkpoint counter at allocation time.
    pub allocated_at: u32,
    /// Checkpoint counter at free time, if freed.
    pub freed_at: Option<u32>,
    /// Allocation stack, if captured.
    pub stack: Option<Box<[usize]>>,
}

impl CheckpointRecord {
    /// Returns true if the record passes the checkpoint filters in `flags`
    /// for the window `[start, end)`.
    #[must_use]
    pub fn should_be_in_report(&self, flags: ReportFlags, start: u32, end: u32) -> bool {
        let allocated = self.allocated_at;
        let alloc_ok = (allocated < start && flags.contains(ReportFlags::CP_ALLOCATED_BEFORE))
            || ((start..end).contains(&allocated)
                && flags.contains(ReportFlags::CP_ALLOCATED_BETWEEN));

        let freed_ok = match self.freed_at {
            None => flags.contains(ReportFlags::CP_FREED_NEVER),
            Some(freed) => {
                (freed < start && flags.contains(ReportFlags::CP_FREED_BEFORE))
                    || ((start..end).contains(&freed)
                        && flags.contains(ReportFlags::CP_FREED_BETWEEN))
            }
        };

        alloc_ok && freed_ok
    }
}

/// Allocation history of one pool or allocator.
#[derive(Debug, Default)]
pub struct Ledger {
    records: Vec<CheckpointRecord>,
    ever_failed: bool,
}

impl Ledger {
    /// Creates an empty ledger.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
            ever_failed: false,
        }
    }

    /// Appends an allocation record and returns its index.
    ///
    /// If the record cannot be stored the ledger is flagged as incomplete
    /// and the allocation proceeds untracked.
    pub fn record_allocation(
        &mut self,
        tag: &'static str,
        block_size: usize,
        checkpoint: u32,
        stack: Option<Box<[usize]>>,
    ) -> Option<usize> {
        if self.records.try_reserve(1).is_err() {
            self.ever_failed = true;
            return None;
        }
        self.records.push(CheckpointRecord {
            tag,
            block_size,
            allocated_at: checkpoint,
            freed_at: None,
            stack,
        });
        Some(self.records.len() - 1)
    }

    /// Stamps the free checkpoint on a record.
    pub fn record_free(&mut self, index: usize, checkpoint: u32) {
        match self.records.get_mut(index) {
            Some(record) => record.freed_at = Some(checkpoint),
            None => self.ever_failed = true,
        }
    }

    /// All records, oldest first.
    #[must_use]
    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    /// True if a record was ever dropped.
    #[must_use]
    pub const fn ever_failed(&self) -> bool {
        self.ever_failed
    }

    /// Forgets all history.
    pub fn clear(&mut self) {
        self.records.clear();
        self.ever_failed = false;
    }

    /// Emits a `BLOCKINFO` line for every matching record.
    ///
    /// Returns the number of records reported.
    pub fn report(
        &self,
        owner: &str,
        flags: ReportFlags,
        start: u32,
        end: u32,
        tracer: &dyn StackTracer,
        sink: &mut dyn FnMut(&str),
    ) -> usize {
        if self.ever_failed {
            emit(
                sink,
                "  *** WARNING *** info on freed blocks may be inaccurate or incomplete!",
            );
        }

        let mut reported = 0;
        for record in self
            .records
            .iter()
            .filter(|record| record.should_be_in_report(flags, start, end))
        {
            let freed = record.freed_at.map_or(-1, i64::from);
            emit(
                sink,
                &format!(
                    "BLOCKINFO,{:>32},{:>6},{:>6},{:>6},{}",
                    owner, record.block_size, record.allocated_at, freed, record.tag
                ),
            );
            if flags.contains(ReportFlags::CP_STACKTRACE) {
                if let Some(stack) = record.stack.as_deref() {
                    tracer.render_addresses(stack, &mut |line: &str| emit(&mut *sink, line));
                }
            }
            reported += 1;
        }
        reported
    }
}

/// Header line preceding `BLOCKINFO` rows.
pub(crate) fn block_report_header(sink: &mut dyn FnMut(&str)) {
    emit(
        sink,
        &format!(
            "BLOCKINFO,{:>32},{:>6},{:>6},{:>6},BLOCKNAME",
            "POOLNAME", "BLKSZ", "ALLOC", "FREED"
        ),
    );
}
