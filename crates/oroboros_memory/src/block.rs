//! # Blocks
//!
//! The fundamental allocation unit.
//!
//! Block metadata lives in a side table owned by the slab (or raw list)
//! holding the block; the byte region holds only user data and, when
//! enabled, the guard walls around it:
//!
//! ```text
//! ┌────────────┬──────────────────────────────┬────────────┬─────────┐
//! │ lead wall  │ user data (logical size)     │ trail wall │ padding │
//! │ pattern+i  │ filler / zero / 0xdeadbeef   │ pattern-i  │         │
//! └────────────┴──────────────────────────────┴────────────┴─────────┘
//! ```
//!
//! Callers never see addresses. They hold a [`BlockHandle`], which names
//! the owner of the block (a slab inside a pool, or an allocator's raw
//! list) and the block generation it was issued for.

use std::ops::Range;

use crate::arena::ArenaIndex;
use crate::error::{CorruptionKind, MemoryError, MemoryResult};

/// Alignment every logical size is rounded up to.
pub const ALIGNMENT: usize = 8;

/// 32-bit words per guard wall.
pub const WALL_WORDS: usize = 2;

/// Bytes per guard wall.
pub const WALL_SIZE: usize = WALL_WORDS * 4;

/// Cookie stamped into every block header.
pub const MAGIC_COOKIE: u16 = 12345;

/// Pattern written over user data when a block is freed.
pub const GARBAGE_FILL: u32 = 0xdead_beef;

/// First wall pattern handed out by a factory.
pub const INITIAL_WALL_PATTERN: u32 = 0xbabe_face;

/// Reserved tag carried by every free block.
pub const FREE_TAG: &str = "FREE_SINGLEBLOCK_TAG_STRING";

/// Bytes of metadata carried per block.
pub const BLOCK_HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

/// Rounds a logical size up to [`ALIGNMENT`]. Zero rounds to one unit.
#[inline]
#[must_use]
pub const fn round_up_to_alignment(size: usize) -> usize {
    if size == 0 {
        return ALIGNMENT;
    }
    size.saturating_add(ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Bytes of backing storage one block occupies: user data plus walls.
#[inline]
#[must_use]
pub const fn data_stride(logical_size: usize, guards: bool) -> usize {
    let walls = if guards { 2 * WALL_SIZE } else { 0 };
    round_up_to_alignment(logical_size).saturating_add(walls)
}

/// Full footprint of one block: backing storage plus header.
///
/// Used both for the per-block stride of a slab and for sizing a raw block.
#[inline]
#[must_use]
pub const fn raw_block_size(logical_size: usize, guards: bool) -> usize {
    data_stride(logical_size, guards).saturating_add(BLOCK_HEADER_SIZE)
}

/// Debug filler pattern for an index in `0..8`.
///
/// Every byte is odd and has a distinct high nibble, so stale reads stand
/// out and never look like a valid aligned pointer.
#[must_use]
pub const fn filler_value(index: u32) -> u32 {
    let mut value = (index & 3) << 1;
    value |= 0x01;
    value |= !(value << 4) & 0xf0;
    value |= value << 8;
    value |= value << 16;
    value
}

/// Fills a byte region with a repeated little-endian 32-bit word.
pub fn fill_words(bytes: &mut [u8], word: u32) {
    let pattern = word.to_le_bytes();
    for chunk in bytes.chunks_mut(4) {
        chunk.copy_from_slice(&pattern[..chunk.len()]);
    }
}

/// Rejects empty tags and the reserved free tag.
///
/// # Errors
///
/// Returns `BadTag`.
pub fn validate_tag(tag: &'static str) -> MemoryResult<()> {
    if tag.is_empty() || tag == FREE_TAG {
        return Err(MemoryError::BadTag(tag));
    }
    Ok(())
}

/// Identifies a pool within its factory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub(crate) u32);

impl PoolId {
    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Identifies a size-class allocator within its factory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocatorId(pub(crate) u32);

impl AllocatorId {
    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Where a block lives. Slab blocks and raw blocks are never confused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum BlockLocation {
    /// Carved from a slab owned by a pool.
    Slab {
        pool: PoolId,
        slab: ArenaIndex,
        block: u32,
    },
    /// Individually allocated for an oversized request.
    Raw {
        allocator: AllocatorId,
        block: ArenaIndex,
    },
}

/// Handle to a live block.
///
/// Handles are cheap to copy. Freeing a block bumps its generation, so a
/// handle freed twice is detected as stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    location: BlockLocation,
    generation: u32,
}

impl BlockHandle {
    pub(crate) const fn slab(pool: PoolId, slab: ArenaIndex, block: u32, generation: u32) -> Self {
        Self {
            location: BlockLocation::Slab { pool, slab, block },
            generation,
        }
    }

    pub(crate) const fn raw(allocator: AllocatorId, block: ArenaIndex) -> Self {
        Self {
            location: BlockLocation::Raw { allocator, block },
            generation: 0,
        }
    }

    pub(crate) const fn location(&self) -> BlockLocation {
        self.location
    }

    pub(crate) const fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns true if the block bypassed the size classes.
    #[inline]
    #[must_use]
    pub const fn is_raw(&self) -> bool {
        matches!(self.location, BlockLocation::Raw { .. })
    }

    /// Returns the owning pool of a slab block.
    #[inline]
    #[must_use]
    pub const fn pool_id(&self) -> Option<PoolId> {
        match self.location {
            BlockLocation::Slab { pool, .. } => Some(pool),
            BlockLocation::Raw { .. } => None,
        }
    }

    /// Returns the owning allocator of a raw block.
    #[inline]
    #[must_use]
    pub const fn allocator_id(&self) -> Option<AllocatorId> {
        match self.location {
            BlockLocation::Raw { allocator, .. } => Some(allocator),
            BlockLocation::Slab { .. } => None,
        }
    }
}

/// Per-allocation metadata applied when a block is handed out.
#[derive(Debug)]
pub(crate) struct AllocationStamp {
    pub tag: &'static str,
    pub wasted: usize,
    pub ignore_leaks: bool,
    pub checkpoint: Option<usize>,
    pub stack: Option<Box<[usize]>>,
}

/// How to initialize user data on allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Fill {
    Zero,
    Pattern(u32),
    Keep,
}

impl Fill {
    pub(crate) fn apply(self, bytes: &mut [u8]) {
        match self {
            Self::Zero => bytes.fill(0),
            Self::Pattern(word) => fill_words(bytes, word),
            Self::Keep => {}
        }
    }
}

/// What a freed block leaves behind for bookkeeping.
#[derive(Debug)]
pub(crate) struct ReleasedBlock {
    pub tag: &'static str,
    pub wasted: usize,
    pub checkpoint: Option<usize>,
}

/// Block metadata.
#[derive(Debug, Clone)]
pub(crate) struct BlockHeader {
    pub logical_size: usize,
    pub tag: &'static str,
    pub cookie: u16,
    pub wall_pattern: u32,
    pub wasted: usize,
    pub ignore_leaks: bool,
    pub generation: u32,
    pub checkpoint: Option<usize>,
    pub stack: Option<Box<[usize]>>,
}

impl BlockHeader {
    /// A free block, as carved out of a fresh slab.
    pub(crate) const fn new_free(logical_size: usize, wall_pattern: u32) -> Self {
        Self {
            logical_size,
            tag: FREE_TAG,
            cookie: MAGIC_COOKIE,
            wall_pattern,
            wasted: 0,
            ignore_leaks: false,
            generation: 0,
            checkpoint: None,
            stack: None,
        }
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        self.tag == FREE_TAG
    }

    #[inline]
    pub(crate) fn is_leak_candidate(&self) -> bool {
        !self.is_free() && !self.ignore_leaks
    }

    pub(crate) fn assign(&mut self, stamp: AllocationStamp) {
        self.tag = stamp.tag;
        self.wasted = stamp.wasted;
        self.ignore_leaks = stamp.ignore_leaks;
        self.checkpoint = stamp.checkpoint;
        self.stack = stamp.stack;
    }

    /// Marks the block free and returns its allocation-time bookkeeping.
    pub(crate) fn release(&mut self) -> ReleasedBlock {
        let released = ReleasedBlock {
            tag: self.tag,
            wasted: self.wasted,
            checkpoint: self.checkpoint.take(),
        };
        self.tag = FREE_TAG;
        self.wasted = 0;
        self.ignore_leaks = false;
        self.stack = None;
        self.generation = self.generation.wrapping_add(1);
        released
    }

    /// Fails with `StaleHandle` unless the block is live at `generation`.
    pub(crate) fn check_live(&self, generation: u32) -> MemoryResult<()> {
        if self.is_free() || self.generation != generation {
            return Err(MemoryError::corrupt(CorruptionKind::StaleHandle, self.tag));
        }
        Ok(())
    }

    /// Checks the cookie and, when `guards` is set, both walls of `span`.
    ///
    /// `span` is the block's full backing stride, starting at the lead wall.
    pub(crate) fn verify(&self, span: &[u8], guards: bool) -> MemoryResult<()> {
        if self.cookie != MAGIC_COOKIE {
            return Err(MemoryError::corrupt(CorruptionKind::MagicCookie, self.tag));
        }
        if guards {
            check_walls(span, self.logical_size, self.wall_pattern, self.tag)?;
        }
        Ok(())
    }
}

/// Range of the user data within a block's stride.
#[inline]
pub(crate) const fn user_range(logical_size: usize, guards: bool) -> Range<usize> {
    let start = if guards { WALL_SIZE } else { 0 };
    start..start + logical_size
}

/// Writes both guard walls into a block's stride.
pub(crate) fn stamp_walls(span: &mut [u8], logical_size: usize, pattern: u32) {
    let trail = WALL_SIZE + logical_size;
    for i in 0..WALL_WORDS {
        let offset = i * 4;
        let step = u32::try_from(i).unwrap_or(0);
        span[offset..offset + 4].copy_from_slice(&pattern.wrapping_add(step).to_le_bytes());
        span[trail + offset..trail + offset + 4]
            .copy_from_slice(&pattern.wrapping_sub(step).to_le_bytes());
    }
}

fn check_walls(span: &[u8], logical_size: usize, pattern: u32, tag: &'static str) -> MemoryResult<()> {
    let trail = WALL_SIZE + logical_size;
    for i in 0..WALL_WORDS {
        let offset = i * 4;
        let step = u32::try_from(i).unwrap_or(0);
        if read_word(span, offset) != Some(pattern.wrapping_add(step)) {
            return Err(MemoryError::corrupt(CorruptionKind::Underrun, tag));
        }
        if read_word(span, trail + offset) != Some(pattern.wrapping_sub(step)) {
            return Err(MemoryError::corrupt(CorruptionKind::Overrun, tag));
        }
    }
    Ok(())
}

#[inline]
fn read_word(span: &[u8], offset: usize) -> Option<u32> {
    let bytes = span.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
