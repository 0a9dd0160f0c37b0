//! # Raw Blocks
//!
//! Oversized requests bypass the size classes and get one buffer each,
//! sized to the request. Raw blocks are tracked in their own list type so
//! they can never be threaded onto a slab free list.

use crate::arena::{Arena, ArenaIndex};
use crate::block::{
    data_stride, raw_block_size, stamp_walls, user_range, BlockHeader, Fill,
};
use crate::error::{CorruptionKind, MemoryError, MemoryResult};
use crate::system::SystemAllocator;

#[derive(Debug)]
pub(crate) struct RawBlock {
    header: BlockHeader,
    data: Box<[u8]>,
    guards: bool,
    prev: Option<ArenaIndex>,
    next: Option<ArenaIndex>,
}

impl RawBlock {
    /// Obtains a buffer for `logical_size` bytes and stamps its walls.
    pub(crate) fn allocate(
        system: &dyn SystemAllocator,
        logical_size: usize,
        guards: bool,
        wall_pattern: u32,
    ) -> MemoryResult<Self> {
        let mut data = system.raw_allocate_uninitialized(data_stride(logical_size, guards))?;
        if guards {
            stamp_walls(&mut data, logical_size, wall_pattern);
        }
        Ok(Self {
            header: BlockHeader::new_free(logical_size, wall_pattern),
            data,
            guards,
            prev: None,
            next: None,
        })
    }

    pub(crate) fn release(self, system: &dyn SystemAllocator) {
        system.raw_free(self.data);
    }

    pub(crate) fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut BlockHeader {
        &mut self.header
    }

    #[inline]
    pub(crate) fn logical_size(&self) -> usize {
        self.header.logical_size
    }

    #[inline]
    pub(crate) fn physical_bytes(&self) -> usize {
        raw_block_size(self.header.logical_size, self.guards)
    }

    pub(crate) fn user_bytes_mut(&mut self) -> Option<&mut [u8]> {
        let range = user_range(self.header.logical_size, self.guards);
        self.data.get_mut(range)
    }

    pub(crate) fn guarded_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn fill_user(&mut self, fill: Fill) {
        if let Some(bytes) = self.user_bytes_mut() {
            fill.apply(bytes);
        }
    }

    pub(crate) fn verify(&self) -> MemoryResult<()> {
        self.header.verify(&self.data, self.guards)
    }
}

/// Raw blocks of one allocator, newest first.
#[derive(Debug, Default)]
pub(crate) struct RawList {
    head: Option<ArenaIndex>,
    len: usize,
}

impl RawList {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn push_front(&mut self, blocks: &mut Arena<RawBlock>, idx: ArenaIndex) {
        let old_head = self.head;
        if let Some(block) = blocks.get_mut(idx) {
            block.prev = None;
            block.next = old_head;
        }
        if let Some(head) = old_head.and_then(|head| blocks.get_mut(head)) {
            head.prev = Some(idx);
        }
        self.head = Some(idx);
        self.len += 1;
    }

    pub(crate) fn unlink(
        &mut self,
        blocks: &mut Arena<RawBlock>,
        idx: ArenaIndex,
    ) -> MemoryResult<()> {
        let (prev, next) = blocks
            .get(idx)
            .map(|block| (block.prev, block.next))
            .ok_or(MemoryError::corrupt(CorruptionKind::StaleHandle, ""))?;

        match prev {
            Some(prev) => {
                blocks
                    .get_mut(prev)
                    .ok_or(MemoryError::corrupt(CorruptionKind::Linkage, ""))?
                    .next = next;
            }
            None if self.head == Some(idx) => self.head = next,
            None => return Err(MemoryError::corrupt(CorruptionKind::Linkage, "")),
        }
        if let Some(next_block) = next.and_then(|next| blocks.get_mut(next)) {
            next_block.prev = prev;
        }
        self.len -= 1;
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.head = None;
        self.len = 0;
    }

    pub(crate) fn iter<'a>(
        &self,
        blocks: &'a Arena<RawBlock>,
    ) -> impl Iterator<Item = ArenaIndex> + 'a {
        let limit = blocks.len();
        std::iter::successors(self.head, move |idx| blocks.get(*idx).and_then(|block| block.next))
            .take(limit)
    }
}
