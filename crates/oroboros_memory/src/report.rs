//! # Reports
//!
//! Human-readable diagnostics. Every line goes to a caller-supplied sink
//! and is mirrored as a `tracing` debug event, so the allocator never
//! touches the console or the file system itself.

use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;

use crate::block::BlockHeader;
use crate::stack_trace::StackTracer;

/// Predicate over block tags. Blocks whose tag matches are left out of
/// leak reports and leak counts.
pub type LeakFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Builds a filter matching tags that contain any of `substrings`.
#[must_use]
pub fn substring_leak_filter(substrings: Vec<String>) -> LeakFilter {
    Arc::new(move |tag: &str| substrings.iter().any(|needle| tag.contains(needle.as_str())))
}

/// Selects what a memory report contains.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ReportFlags(u32);

impl ReportFlags {
    /// Nothing.
    pub const NONE: Self = Self(0);

    /// Blocks allocated before the start checkpoint.
    pub const CP_ALLOCATED_BEFORE: Self = Self(0x0001);
    /// Blocks allocated between the start and end checkpoints.
    pub const CP_ALLOCATED_BETWEEN: Self = Self(0x0002);
    /// Any allocation time.
    pub const CP_ALLOCATED_DONTCARE: Self = Self(0x0003);
    /// Blocks freed before the start checkpoint.
    pub const CP_FREED_BEFORE: Self = Self(0x0010);
    /// Blocks freed between the start and end checkpoints.
    pub const CP_FREED_BETWEEN: Self = Self(0x0020);
    /// Blocks never freed.
    pub const CP_FREED_NEVER: Self = Self(0x0040);
    /// Any free time, including never.
    pub const CP_FREED_DONTCARE: Self = Self(0x0070);

    /// Include allocation stack traces in block reports.
    pub const CP_STACKTRACE: Self = Self(0x0100);
    /// Per-pool usage lines.
    pub const POOLINFO: Self = Self(0x0200);
    /// Global usage counters.
    pub const FACTORYINFO: Self = Self(0x0400);
    /// Pools that overflowed or badly underused their initial slab.
    pub const POOL_OVERFLOW: Self = Self(0x0800);
    /// Every live block that is not ignored.
    pub const SIMPLE_LEAKS: Self = Self(0x1000);

    /// Everything allocated between the checkpoints.
    pub const CP_ALLOCATES: Self = Self(0x0002 | 0x0070);
    /// Everything freed between the checkpoints.
    pub const CP_FREES: Self = Self(0x0003 | 0x0020);
    /// Allocated between the checkpoints and still alive.
    pub const CP_LEAKS: Self = Self(0x0002 | 0x0040);
    /// Allocated before the start checkpoint and still alive.
    pub const CP_LONGTERM: Self = Self(0x0001 | 0x0040);
    /// Allocated and freed between the checkpoints.
    pub const CP_TRANSIENT: Self = Self(0x0002 | 0x0020);
    /// Alive at the end checkpoint.
    pub const CP_EXISTING: Self = Self(0x0003 | 0x0040);
    /// Every recorded block.
    pub const CP_ALL: Self = Self(0x0003 | 0x0070);

    /// Builds flags from raw bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if any bit of `other` is set.
    #[inline]
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if every bit of `other` is set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if the flags ask for a checkpoint block report.
    #[inline]
    #[must_use]
    pub const fn wants_block_report(self) -> bool {
        self.intersects(Self::CP_ALLOCATED_DONTCARE) && self.intersects(Self::CP_FREED_DONTCARE)
    }

    /// Readable list of the selected checkpoint filters.
    #[must_use]
    pub fn describe_checkpoint_filters(self) -> String {
        let names = [
            (Self::CP_ALLOCATED_BEFORE, "AllocBefore"),
            (Self::CP_ALLOCATED_BETWEEN, "AllocBetween"),
            (Self::CP_FREED_BEFORE, "FreedBefore"),
            (Self::CP_FREED_BETWEEN, "FreedBetween"),
            (Self::CP_FREED_NEVER, "StillExisting"),
        ];
        names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl BitOr for ReportFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ReportFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ReportFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

pub(crate) const SEPARATOR: &str = "------------------------------------------";

/// Sends one line to the sink and to `tracing`.
pub(crate) fn emit(sink: &mut dyn FnMut(&str), line: &str) {
    tracing::debug!(target: "oroboros_memory::report", "{}", line);
    sink(line);
}

/// Emits a banner of the form used by every report section.
pub(crate) fn banner(sink: &mut dyn FnMut(&str), title: &str) {
    emit(sink, SEPARATOR);
    emit(sink, title);
    emit(sink, SEPARATOR);
}

/// Reports one leaked block, with its allocation stack if one was captured.
pub(crate) fn report_leak(
    header: &BlockHeader,
    owner: &str,
    tracer: &dyn StackTracer,
    sink: &mut dyn FnMut(&str),
) {
    tracing::warn!(
        "Leaked a block of size {}, tag {}, from {}",
        header.logical_size,
        header.tag,
        owner
    );
    emit(
        sink,
        &format!(
            "Leaked a block of size {}, tagstring {}, from pool/dma {}",
            header.logical_size, header.tag, owner
        ),
    );
    if let Some(stack) = header.stack.as_deref() {
        tracer.render_addresses(stack, &mut |line: &str| emit(&mut *sink, line));
    }
}

/// Counts (and reports) the leak candidates among `headers`.
pub(crate) fn report_leaks<'a>(
    headers: impl Iterator<Item = &'a BlockHeader>,
    owner: &str,
    filter: &dyn Fn(&str) -> bool,
    tracer: &dyn StackTracer,
    sink: &mut dyn FnMut(&str),
) -> usize {
    let mut count = 0;
    for header in headers.filter(|header| header.is_leak_candidate() && !filter(header.tag)) {
        report_leak(header, owner, tracer, sink);
        count += 1;
    }
    count
}
