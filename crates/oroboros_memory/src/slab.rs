//! # Slabs
//!
//! A slab is one contiguous backing buffer carved into same-sized blocks,
//! with an intrusive singly-linked free list threaded through the block
//! headers.
//!
//! ```text
//! free_head ─▶ [0] ─▶ [1] ─▶ [3] ─▶ None        (block 2 is in use)
//! data:        [wall|user|wall][wall|user|wall][...][...]
//! ```
//!
//! Slabs themselves are linked into their pool's slab list through
//! `prev`/`next` arena indices.

use std::iter;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::arena::{Arena, ArenaIndex};
use crate::block::{
    data_stride, fill_words, raw_block_size, stamp_walls, user_range, AllocationStamp,
    BlockHeader, ReleasedBlock, GARBAGE_FILL,
};
use crate::error::{CorruptionKind, MemoryError, MemoryResult};
use crate::system::SystemAllocator;

/// A block inside a slab. Only ever linked to free blocks of the same slab.
#[derive(Debug)]
struct SlabBlock {
    header: BlockHeader,
    next_free: Option<u32>,
}

/// Contiguous run of same-sized blocks.
#[derive(Debug)]
pub(crate) struct Slab {
    data: Box<[u8]>,
    blocks: Vec<SlabBlock>,
    free_head: Option<u32>,
    used: usize,
    block_size: usize,
    stride: usize,
    guards: bool,
    prev: Option<ArenaIndex>,
    next: Option<ArenaIndex>,
}

impl Slab {
    /// Allocates backing storage for `count` blocks and threads the free list.
    ///
    /// Blocks are wired back to front so the first block is the list head.
    pub(crate) fn init(
        system: &dyn SystemAllocator,
        block_size: usize,
        count: usize,
        guards: bool,
        garbage_fill: bool,
        wall_counter: &AtomicU32,
    ) -> MemoryResult<Self> {
        let stride = data_stride(block_size, guards);
        let bytes = stride
            .checked_mul(count)
            .ok_or(MemoryError::system_oom(usize::MAX))?;
        let data = system.raw_allocate_uninitialized(bytes)?;

        let mut slab = Self {
            data,
            blocks: Vec::with_capacity(count),
            free_head: None,
            used: 0,
            block_size,
            stride,
            guards,
            prev: None,
            next: None,
        };

        for index in 0..count {
            let pattern = if guards {
                wall_counter.fetch_add(1, Ordering::Relaxed)
            } else {
                0
            };
            let span = &mut slab.data[index * stride..(index + 1) * stride];
            if guards {
                stamp_walls(span, block_size, pattern);
            }
            if garbage_fill {
                fill_words(&mut span[user_range(block_size, guards)], GARBAGE_FILL);
            }
            slab.blocks.push(SlabBlock {
                header: BlockHeader::new_free(block_size, pattern),
                next_free: None,
            });
        }

        for index in (0..count).rev() {
            slab.blocks[index].next_free = slab.free_head;
            slab.free_head = Some(u32::try_from(index).unwrap_or(u32::MAX));
        }

        Ok(slab)
    }

    /// Returns the backing buffer to the system.
    pub(crate) fn release(self, system: &dyn SystemAllocator) {
        system.raw_free(self.data);
    }

    #[inline]
    pub(crate) fn has_free_blocks(&self) -> bool {
        self.free_head.is_some()
    }

    #[inline]
    pub(crate) fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes this slab accounts for, headers included.
    #[inline]
    pub(crate) fn physical_bytes(&self) -> usize {
        self.blocks.len() * raw_block_size(self.block_size, self.guards)
    }

    /// Pops the free-list head. The caller checks `has_free_blocks` first.
    pub(crate) fn allocate_one(&mut self, stamp: AllocationStamp) -> Option<u32> {
        let index = self.free_head?;
        let block = self.blocks.get_mut(index as usize)?;
        self.free_head = block.next_free.take();
        block.header.assign(stamp);
        self.used += 1;
        Some(index)
    }

    /// Pushes a live block back onto the free list.
    pub(crate) fn free_one(&mut self, index: u32, garbage_fill: bool) -> Option<ReleasedBlock> {
        let range = self.user_span(index)?;
        let block = self.blocks.get_mut(index as usize)?;
        let released = block.header.release();
        block.next_free = self.free_head;
        self.free_head = Some(index);
        self.used -= 1;
        if garbage_fill {
            fill_words(&mut self.data[range], GARBAGE_FILL);
        }
        Some(released)
    }

    pub(crate) fn header(&self, index: u32) -> Option<&BlockHeader> {
        self.blocks.get(index as usize).map(|block| &block.header)
    }

    pub(crate) fn header_mut(&mut self, index: u32) -> Option<&mut BlockHeader> {
        self.blocks.get_mut(index as usize).map(|block| &mut block.header)
    }

    fn stride_span(&self, index: u32) -> Option<std::ops::Range<usize>> {
        let start = (index as usize).checked_mul(self.stride)?;
        let end = start + self.stride;
        (end <= self.data.len()).then_some(start..end)
    }

    fn user_span(&self, index: u32) -> Option<std::ops::Range<usize>> {
        let stride = self.stride_span(index)?;
        let user = user_range(self.block_size, self.guards);
        Some(stride.start + user.start..stride.start + user.end)
    }

    /// User data of one block.
    pub(crate) fn user_bytes_mut(&mut self, index: u32) -> Option<&mut [u8]> {
        let range = self.user_span(index)?;
        self.data.get_mut(range)
    }

    /// Full stride of one block, walls included.
    pub(crate) fn guarded_bytes_mut(&mut self, index: u32) -> Option<&mut [u8]> {
        let range = self.stride_span(index)?;
        self.data.get_mut(range)
    }

    /// Applies an initializer to a block's user data.
    pub(crate) fn fill_user(&mut self, index: u32, fill: crate::block::Fill) {
        if let Some(bytes) = self.user_bytes_mut(index) {
            fill.apply(bytes);
        }
    }

    /// Checks cookie and walls of one block.
    pub(crate) fn verify_block(&self, index: u32) -> MemoryResult<()> {
        let header = self
            .header(index)
            .ok_or(MemoryError::corrupt(CorruptionKind::Linkage, ""))?;
        let span = self
            .stride_span(index)
            .and_then(|range| self.data.get(range))
            .ok_or(MemoryError::corrupt(CorruptionKind::Linkage, header.tag))?;
        header.verify(span, self.guards)
    }

    /// Walks every block and the free list.
    ///
    /// Fails if any block is damaged, a free-list entry is live or out of
    /// range, the list is cyclic, or the counts disagree with `used`.
    pub(crate) fn verify(&self) -> MemoryResult<()> {
        for index in 0..self.blocks.len() {
            self.verify_block(u32::try_from(index).unwrap_or(u32::MAX))?;
        }

        let mut free = 0usize;
        let mut cursor = self.free_head;
        while let Some(index) = cursor {
            let block = self
                .blocks
                .get(index as usize)
                .ok_or(MemoryError::corrupt(CorruptionKind::Linkage, ""))?;
            if !block.header.is_free() {
                return Err(MemoryError::corrupt(CorruptionKind::Linkage, block.header.tag));
            }
            free += 1;
            if free > self.blocks.len() {
                return Err(MemoryError::corrupt(CorruptionKind::Linkage, ""));
            }
            cursor = block.next_free;
        }

        if free + self.used != self.blocks.len() {
            return Err(MemoryError::BookkeepingMismatch {
                what: "slab free list".to_string(),
                cached: self.blocks.len() - self.used.min(self.blocks.len()),
                recounted: free,
            });
        }
        Ok(())
    }

    /// Counts blocks on the free list.
    pub(crate) fn free_count(&self) -> usize {
        iter::successors(self.free_head, |index| {
            self.blocks.get(*index as usize).and_then(|block| block.next_free)
        })
        .take(self.blocks.len())
        .count()
    }

    /// Headers of every live block.
    pub(crate) fn live_headers(&self) -> impl Iterator<Item = &BlockHeader> {
        self.blocks
            .iter()
            .map(|block| &block.header)
            .filter(|header| !header.is_free())
    }

    /// Marks every live block free. Used when a pool is reset or torn down.
    pub(crate) fn discard_live(&mut self) -> Vec<ReleasedBlock> {
        let mut released = Vec::with_capacity(self.used);
        for block in &mut self.blocks {
            if !block.header.is_free() {
                released.push(block.header.release());
            }
        }
        self.used = 0;
        released
    }
}

/// Doubly-linked list of slabs, threaded through the slab arena.
#[derive(Debug, Default)]
pub(crate) struct SlabList {
    head: Option<ArenaIndex>,
    tail: Option<ArenaIndex>,
}

impl SlabList {
    pub(crate) fn push_back(&mut self, slabs: &mut Arena<Slab>, idx: ArenaIndex) {
        if let Some(slab) = slabs.get_mut(idx) {
            slab.prev = self.tail;
            slab.next = None;
        }
        match self.tail.and_then(|tail| slabs.get_mut(tail)) {
            Some(tail) => tail.next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    pub(crate) fn unlink(&mut self, slabs: &mut Arena<Slab>, idx: ArenaIndex) {
        let Some((prev, next)) = slabs.get(idx).map(|slab| (slab.prev, slab.next)) else {
            return;
        };
        match prev.and_then(|prev| slabs.get_mut(prev)) {
            Some(prev_slab) => prev_slab.next = next,
            None => self.head = next,
        }
        match next.and_then(|next| slabs.get_mut(next)) {
            Some(next_slab) => next_slab.prev = prev,
            None => self.tail = prev,
        }
        if let Some(slab) = slabs.get_mut(idx) {
            slab.prev = None;
            slab.next = None;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.head = None;
        self.tail = None;
    }

    /// Walks the list from head to tail.
    pub(crate) fn iter<'a>(&self, slabs: &'a Arena<Slab>) -> impl Iterator<Item = ArenaIndex> + 'a {
        let limit = slabs.len();
        iter::successors(self.head, move |idx| slabs.get(*idx).and_then(|slab| slab.next))
            .take(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Fill, FREE_TAG, INITIAL_WALL_PATTERN, WALL_SIZE};
    use crate::system::HeapSystemAllocator;

    fn stamp(tag: &'static str) -> AllocationStamp {
        AllocationStamp {
            tag,
            wasted: 0,
            ignore_leaks: false,
            checkpoint: None,
            stack: None,
        }
    }

    fn slab(count: usize) -> Slab {
        let system = HeapSystemAllocator::new();
        let counter = AtomicU32::new(INITIAL_WALL_PATTERN);
        Slab::init(&system, 16, count, true, true, &counter).unwrap()
    }

    #[test]
    fn test_slab_free_list_order() {
        let mut slab = slab(4);
        assert_eq!(slab.free_count(), 4);

        // Front to back after the back-to-front wiring
        assert_eq!(slab.allocate_one(stamp("a")), Some(0));
        assert_eq!(slab.allocate_one(stamp("b")), Some(1));
        assert_eq!(slab.used(), 2);

        slab.free_one(0, true).unwrap();
        assert_eq!(slab.allocate_one(stamp("c")), Some(0));
        assert!(slab.verify().is_ok());
    }

    #[test]
    fn test_slab_exhaustion() {
        let mut slab = slab(2);
        assert!(slab.allocate_one(stamp("a")).is_some());
        assert!(slab.allocate_one(stamp("b")).is_some());
        assert!(!slab.has_free_blocks());
        assert!(slab.allocate_one(stamp("c")).is_none());
    }

    #[test]
    fn test_slab_garbage_fill_on_free() {
        let mut slab = slab(1);
        let index = slab.allocate_one(stamp("a")).unwrap();
        slab.fill_user(index, Fill::Zero);
        assert!(slab.user_bytes_mut(index).unwrap().iter().all(|&b| b == 0));

        slab.free_one(index, true).unwrap();
        let bytes = slab.user_bytes_mut(index).unwrap();
        assert_eq!(&bytes[..4], &0xdead_beef_u32.to_le_bytes());
        assert_eq!(slab.header(index).unwrap().tag, FREE_TAG);
    }

    #[test]
    fn test_slab_verify_catches_overrun() {
        let mut slab = slab(2);
        let index = slab.allocate_one(stamp("victim")).unwrap();
        let span = slab.guarded_bytes_mut(index).unwrap();
        span[WALL_SIZE + 16] = 0;

        assert_eq!(
            slab.verify(),
            Err(MemoryError::corrupt(CorruptionKind::Overrun, "victim"))
        );
    }

    #[test]
    fn test_slab_list_links() {
        let mut arena = Arena::new();
        let mut list = SlabList::default();
        let a = arena.insert(slab(1));
        let b = arena.insert(slab(1));
        let c = arena.insert(slab(1));
        list.push_back(&mut arena, a);
        list.push_back(&mut arena, b);
        list.push_back(&mut arena, c);
        assert_eq!(list.iter(&arena).collect::<Vec<_>>(), vec![a, b, c]);

        list.unlink(&mut arena, b);
        assert_eq!(list.iter(&arena).collect::<Vec<_>>(), vec![a, c]);
        list.unlink(&mut arena, a);
        list.unlink(&mut arena, c);
        assert_eq!(list.iter(&arena).count(), 0);
    }
}
