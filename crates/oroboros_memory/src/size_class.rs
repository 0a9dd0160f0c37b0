//! # Size-Class Allocator
//!
//! General-purpose allocator built from a ladder of pools.
//!
//! ```text
//! request 50 bytes ──▶ [16] [32] [64] [128] [256] [512] [1024]
//!                                 ▲ smallest class that fits
//! request 3000 bytes ─────────────────────────────────────────▶ raw list
//! ```
//!
//! The allocator lock is always taken before a pool lock.

use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::accounting::signed;
use crate::arena::{Arena, ArenaIndex};
use crate::block::{validate_tag, AllocatorId, BlockHandle, BlockLocation, PoolId};
use crate::checkpoint::Ledger;
use crate::error::{CorruptionKind, MemoryError, MemoryResult};
use crate::factory::FactoryShared;
use crate::pool::Pool;
use crate::raw::{RawBlock, RawList};
use crate::report::{emit, report_leaks, ReportFlags};

/// Owner label of raw blocks in leak reports.
const RAW_LEAK_OWNER: &str = "(DMA)";

/// Owner label of raw blocks in checkpoint reports.
const RAW_CHECKPOINT_OWNER: &str = "(Oversized)";

/// Counters of a size-class allocator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SizeClassStats {
    /// Blocks handed out and not yet freed, both paths.
    pub outstanding_blocks: usize,
    /// Outstanding raw blocks.
    pub raw_blocks: usize,
    /// Bytes outstanding, counted at pool block size for pooled requests.
    pub total_bytes: usize,
    /// Highest `total_bytes`.
    pub peak_bytes: usize,
    /// Pool block bytes beyond what callers asked for.
    pub wasted_bytes: usize,
    /// Highest `wasted_bytes`.
    pub peak_wasted_bytes: usize,
    /// Bytes in raw blocks.
    pub large_block_bytes: usize,
    /// Highest `large_block_bytes`.
    pub peak_large_block_bytes: usize,
}

impl SizeClassStats {
    fn add(&mut self, bytes: usize, wasted: usize, raw: Option<usize>) {
        self.outstanding_blocks += 1;
        self.total_bytes += bytes;
        self.peak_bytes = self.peak_bytes.max(self.total_bytes);
        self.wasted_bytes += wasted;
        self.peak_wasted_bytes = self.peak_wasted_bytes.max(self.wasted_bytes);
        if let Some(size) = raw {
            self.raw_blocks += 1;
            self.large_block_bytes += size;
            self.peak_large_block_bytes = self.peak_large_block_bytes.max(self.large_block_bytes);
        }
    }

    fn remove(&mut self, bytes: usize, wasted: usize, raw: Option<usize>) {
        self.outstanding_blocks -= 1;
        self.total_bytes = self.total_bytes.saturating_sub(bytes);
        self.wasted_bytes = self.wasted_bytes.saturating_sub(wasted);
        if let Some(size) = raw {
            self.raw_blocks -= 1;
            self.large_block_bytes = self.large_block_bytes.saturating_sub(size);
        }
    }

    /// Zeroes current values, keeping peaks.
    fn clear_current(&mut self) {
        *self = Self {
            peak_bytes: self.peak_bytes,
            peak_wasted_bytes: self.peak_wasted_bytes,
            peak_large_block_bytes: self.peak_large_block_bytes,
            ..Self::default()
        };
    }
}

#[derive(Debug, Default)]
struct AllocatorState {
    raw_blocks: Arena<RawBlock>,
    raw_list: RawList,
    stats: SizeClassStats,
    ledger: Ledger,
    destroyed: bool,
}

/// Where a handle resolved to.
enum Owner<'a> {
    Pool(&'a Arc<Pool>),
    Raw(ArenaIndex),
}

/// Routes requests to the smallest fitting pool, or to the raw path.
pub struct SizeClassAllocator {
    id: AllocatorId,
    pools: Vec<Arc<Pool>>,
    shared: Arc<FactoryShared>,
    state: Mutex<AllocatorState>,
}

impl std::fmt::Debug for SizeClassAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeClassAllocator")
            .field("id", &self.id)
            .field("pools", &self.pools)
            .finish_non_exhaustive()
    }
}

impl SizeClassAllocator {
    /// Wraps pools already ordered by increasing block size.
    pub(crate) fn new(id: AllocatorId, pools: Vec<Arc<Pool>>, shared: Arc<FactoryShared>) -> Self {
        Self {
            id,
            pools,
            shared,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    /// Returns the allocator id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> AllocatorId {
        self.id
    }

    /// Pools in increasing block-size order.
    #[inline]
    #[must_use]
    pub fn pools(&self) -> &[Arc<Pool>] {
        &self.pools
    }

    /// Returns true if `pool` is one of this allocator's size classes.
    #[must_use]
    pub fn owns_pool(&self, pool: PoolId) -> bool {
        self.pools.iter().any(|entry| entry.id() == pool)
    }

    /// Returns the smallest pool whose block size is at least `size`.
    ///
    /// `None` means the request takes the raw path.
    #[must_use]
    pub fn find_pool_for_size(&self, size: usize) -> Option<&Arc<Pool>> {
        self.pools.iter().find(|pool| pool.block_size() >= size)
    }

    /// Bytes a request for `size` would actually receive.
    #[must_use]
    pub fn actual_allocation_size(&self, size: usize) -> usize {
        self.find_pool_for_size(size)
            .map_or(size, |pool| pool.block_size())
    }

    /// Snapshot of the allocator counters.
    #[must_use]
    pub fn stats(&self) -> SizeClassStats {
        self.state.lock().stats
    }

    fn label(&self) -> String {
        format!("size-class allocator {}", self.id.raw())
    }

    /// Allocates `size` bytes.
    ///
    /// # Arguments
    ///
    /// * `size` - Requested bytes
    /// * `tag` - Literal naming the call site
    /// * `zero` - Zero the user data instead of filling it with the debug filler
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the chosen pool or the system cannot satisfy the
    /// request. `BadTag` for an empty or reserved tag.
    pub fn allocate(&self, size: usize, tag: &'static str, zero: bool) -> MemoryResult<BlockHandle> {
        if self.shared.debug_checks() {
            validate_tag(tag)?;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.destroyed {
            return Err(MemoryError::Destroyed(self.label()));
        }

        match self.find_pool_for_size(size) {
            Some(pool) => {
                let handle = pool.allocate_sized(tag, zero, size)?;
                let block_size = pool.block_size();
                state.stats.add(block_size, block_size - size, None);
                Ok(handle)
            }
            None => {
                let handle = self.allocate_raw(state, size, tag, zero)?;
                state.stats.add(size, 0, Some(size));
                Ok(handle)
            }
        }
    }

    fn allocate_raw(
        &self,
        state: &mut AllocatorState,
        size: usize,
        tag: &'static str,
        zero: bool,
    ) -> MemoryResult<BlockHandle> {
        let mut block = RawBlock::allocate(
            &*self.shared.system,
            size,
            self.shared.guards(),
            self.shared.next_wall_pattern(),
        )?;
        let stamp = self.shared.stamp(tag, 0, size, &mut state.ledger);
        block.header_mut().assign(stamp);
        block.fill_user(self.shared.fill_for(zero));
        let physical = block.physical_bytes();

        let idx = state.raw_blocks.insert(block);
        state.raw_list.push_front(&mut state.raw_blocks, idx);
        self.shared.usage.adjust(tag, signed(size), signed(physical));

        tracing::debug!("Raw allocation of {} bytes for {}", size, tag);
        Ok(BlockHandle::raw(self.id, idx))
    }

    fn resolve(&self, handle: BlockHandle) -> MemoryResult<Owner<'_>> {
        match handle.location() {
            BlockLocation::Slab { pool, .. } => self
                .pools
                .iter()
                .find(|entry| entry.id() == pool)
                .map(Owner::Pool)
                .ok_or(MemoryError::corrupt(CorruptionKind::ForeignBlock, "")),
            BlockLocation::Raw { allocator, block } if allocator == self.id => Ok(Owner::Raw(block)),
            BlockLocation::Raw { .. } => {
                Err(MemoryError::corrupt(CorruptionKind::ForeignBlock, ""))
            }
        }
    }

    /// Frees a block from either path.
    ///
    /// # Errors
    ///
    /// `CorruptBlock` for a foreign, stale, or damaged block, and
    /// `NegativeOutstandingCount` if nothing is outstanding.
    pub fn free(&self, handle: BlockHandle) -> MemoryResult<()> {
        let owner = self.resolve(handle)?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.destroyed {
            return Err(MemoryError::Destroyed(self.label()));
        }
        if state.stats.outstanding_blocks == 0 {
            return Err(MemoryError::NegativeOutstandingCount {
                allocator: self.label(),
            });
        }

        match owner {
            Owner::Pool(pool) => {
                let released = pool.release_block(handle)?;
                state.stats.remove(pool.block_size(), released.wasted, None);
            }
            Owner::Raw(idx) => {
                let size = self.free_raw(state, idx)?;
                state.stats.remove(size, 0, Some(size));
            }
        }
        Ok(())
    }

    fn free_raw(&self, state: &mut AllocatorState, idx: ArenaIndex) -> MemoryResult<usize> {
        let block = state
            .raw_blocks
            .get(idx)
            .ok_or(MemoryError::corrupt(CorruptionKind::StaleHandle, ""))?;
        if self.shared.debug_checks() || self.shared.guards() {
            block.verify()?;
        }

        state.raw_list.unlink(&mut state.raw_blocks, idx)?;
        let mut block = state
            .raw_blocks
            .remove(idx)
            .ok_or(MemoryError::corrupt(CorruptionKind::Linkage, ""))?;
        let released = block.header_mut().release();
        if let Some(index) = released.checkpoint {
            state
                .ledger
                .record_free(index, self.shared.current_checkpoint());
        }

        let size = block.logical_size();
        self.shared
            .usage
            .adjust(released.tag, -signed(size), -signed(block.physical_bytes()));
        block.release(&*self.shared.system);
        Ok(size)
    }

    /// Returns every raw block to the system. Returns how many there were.
    fn release_raw_blocks(&self, state: &mut AllocatorState) -> usize {
        let mut released = 0;
        for mut block in state.raw_blocks.drain() {
            let freed = block.header_mut().release();
            self.shared.usage.adjust(
                freed.tag,
                -signed(block.logical_size()),
                -signed(block.physical_bytes()),
            );
            block.release(&*self.shared.system);
            released += 1;
        }
        state.raw_list.clear();
        released
    }

    /// Resets every pool and frees every raw block.
    ///
    /// Peaks survive so a session summary can still report them.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if a pool cannot recreate its initial slab.
    pub fn reset(&self) -> MemoryResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.destroyed {
            return Ok(());
        }

        let raw = self.release_raw_blocks(state);
        if raw > 0 {
            tracing::warn!("{} reset with {} raw blocks outstanding", self.label(), raw);
        }
        for pool in &self.pools {
            pool.reset()?;
        }
        state.ledger.clear();
        state.stats.clear_current();
        Ok(())
    }

    /// Marks the allocator destroyed. Fails if any block is outstanding.
    pub(crate) fn destroy(&self) -> MemoryResult<()> {
        let mut state = self.state.lock();
        if state.stats.outstanding_blocks > 0 {
            return Err(MemoryError::PoolNotEmpty {
                name: self.label(),
                used: state.stats.outstanding_blocks,
            });
        }
        state.destroyed = true;
        Ok(())
    }

    /// Frees raw blocks regardless of use. Pools are torn down by the factory.
    pub(crate) fn teardown(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.destroyed {
            return 0;
        }
        let raw = self.release_raw_blocks(state);
        state.destroyed = true;
        raw
    }

    /// Checks every raw block and every pool.
    ///
    /// # Errors
    ///
    /// The first `CorruptBlock` or `BookkeepingMismatch` found.
    pub fn verify(&self) -> MemoryResult<()> {
        self.audit().verify()?;
        for pool in &self.pools {
            pool.verify()?;
        }
        Ok(())
    }

    /// Reports leaked raw blocks. Pooled blocks are reported by their pools.
    pub fn report_leaks(&self, sink: &mut dyn FnMut(&str)) -> usize {
        let state = self.state.lock();
        let headers = state
            .raw_list
            .iter(&state.raw_blocks)
            .filter_map(|idx| state.raw_blocks.get(idx))
            .map(RawBlock::header);
        report_leaks(
            headers,
            RAW_LEAK_OWNER,
            &*self.shared.leak_filter,
            &*self.shared.tracer,
            sink,
        )
    }

    /// Emits `BLOCKINFO` lines for raw blocks matching `flags`.
    pub fn checkpoint_report(
        &self,
        flags: ReportFlags,
        start: u32,
        end: u32,
        sink: &mut dyn FnMut(&str),
    ) -> usize {
        let state = self.state.lock();
        state.ledger.report(
            RAW_CHECKPOINT_OWNER,
            flags,
            start,
            end,
            &*self.shared.tracer,
            sink,
        )
    }

    /// Emits the raw-block summary lines of a pool info report.
    pub fn info_report(&self, sink: &mut dyn FnMut(&str)) {
        let (count, bytes) = self.debug_raw_block_bytes();
        let average = if count == 0 { 0 } else { bytes / count };
        emit(sink, &format!("POOLINFO,Total Raw Blocks = {count}"));
        emit(sink, &format!("POOLINFO,Total Raw Block Bytes = {bytes}"));
        emit(sink, &format!("POOLINFO,Average Raw Block Size = {average}"));
    }

    /// Count and total logical size of outstanding raw blocks.
    #[must_use]
    pub fn debug_raw_block_bytes(&self) -> (usize, usize) {
        let state = self.state.lock();
        let bytes = state
            .raw_blocks
            .iter()
            .map(|(_, block)| block.logical_size())
            .sum();
        (state.raw_blocks.len(), bytes)
    }

    /// Returns true if the handle names a live block of this allocator.
    #[must_use]
    pub fn debug_is_block_in_allocator(&self, handle: BlockHandle) -> bool {
        match self.resolve(handle) {
            Ok(Owner::Pool(pool)) => pool.debug_is_block_in_pool(handle),
            Ok(Owner::Raw(idx)) => self.state.lock().raw_blocks.contains(idx),
            Err(_) => false,
        }
    }

    /// Excludes a live block from leak reports.
    ///
    /// # Errors
    ///
    /// `CorruptBlock` if the handle is foreign or stale.
    pub fn debug_ignore_leaks_for_block(&self, handle: BlockHandle) -> MemoryResult<()> {
        match self.resolve(handle)? {
            Owner::Pool(pool) => pool.debug_ignore_leaks_for_block(handle),
            Owner::Raw(idx) => {
                let mut state = self.state.lock();
                let block = state
                    .raw_blocks
                    .get_mut(idx)
                    .ok_or(MemoryError::corrupt(CorruptionKind::StaleHandle, ""))?;
                block.header_mut().ignore_leaks = true;
                Ok(())
            }
        }
    }

    fn lock_raw(&self, idx: ArenaIndex) -> MemoryResult<MutexGuard<'_, AllocatorState>> {
        let state = self.state.lock();
        if state.raw_blocks.contains(idx) {
            Ok(state)
        } else {
            Err(MemoryError::corrupt(CorruptionKind::StaleHandle, ""))
        }
    }

    /// Locks the owner of a live block and exposes its user data.
    ///
    /// The owning pool (or this allocator, for raw blocks) stays locked
    /// until the guard drops, so the holder must not allocate or free
    /// through it meanwhile.
    ///
    /// # Errors
    ///
    /// `CorruptBlock` if the handle is foreign or stale.
    pub fn user_bytes_mut(&self, handle: BlockHandle) -> MemoryResult<MappedMutexGuard<'_, [u8]>> {
        match self.resolve(handle)? {
            Owner::Pool(pool) => pool.user_bytes_mut(handle),
            Owner::Raw(idx) => MutexGuard::try_map(self.lock_raw(idx)?, |state| {
                state
                    .raw_blocks
                    .get_mut(idx)
                    .and_then(RawBlock::user_bytes_mut)
            })
            .map_err(|_| MemoryError::corrupt(CorruptionKind::StaleHandle, "")),
        }
    }

    /// Locks the owner of a live block and exposes its full stride, walls included.
    ///
    /// # Errors
    ///
    /// `CorruptBlock` if the handle is foreign or stale.
    pub fn debug_guarded_bytes_mut(
        &self,
        handle: BlockHandle,
    ) -> MemoryResult<MappedMutexGuard<'_, [u8]>> {
        match self.resolve(handle)? {
            Owner::Pool(pool) => pool.debug_guarded_bytes_mut(handle),
            Owner::Raw(idx) => MutexGuard::try_map(self.lock_raw(idx)?, |state| {
                state
                    .raw_blocks
                    .get_mut(idx)
                    .map(RawBlock::guarded_bytes_mut)
            })
            .map_err(|_| MemoryError::corrupt(CorruptionKind::StaleHandle, "")),
        }
    }

    /// Locks the allocator for a factory-wide recount.
    pub(crate) fn audit(&self) -> AllocatorAudit<'_> {
        AllocatorAudit {
            allocator: self,
            state: self.state.lock(),
        }
    }
}

/// A locked allocator, held while the factory recounts its totals.
pub(crate) struct AllocatorAudit<'a> {
    allocator: &'a SizeClassAllocator,
    state: MutexGuard<'a, AllocatorState>,
}

impl AllocatorAudit<'_> {
    pub(crate) fn verify(&self) -> MemoryResult<()> {
        let state = &self.state;
        let mut listed = 0;
        for idx in state.raw_list.iter(&state.raw_blocks) {
            state
                .raw_blocks
                .get(idx)
                .ok_or(MemoryError::corrupt(CorruptionKind::Linkage, ""))?
                .verify()?;
            listed += 1;
        }
        if listed != state.raw_blocks.len() || listed != state.raw_list.len() {
            return Err(MemoryError::corrupt(CorruptionKind::Linkage, ""));
        }
        if listed != state.stats.raw_blocks {
            return Err(MemoryError::BookkeepingMismatch {
                what: format!("{} raw blocks", self.allocator.label()),
                cached: state.stats.raw_blocks,
                recounted: listed,
            });
        }
        Ok(())
    }

    pub(crate) fn used_bytes(&self) -> usize {
        self.state
            .raw_blocks
            .iter()
            .map(|(_, block)| block.logical_size())
            .sum()
    }

    pub(crate) fn physical_bytes(&self) -> usize {
        self.state
            .raw_blocks
            .iter()
            .map(|(_, block)| block.physical_bytes())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DebugOptions, MemoryConfig, SizeClassConfig};
    use crate::factory::AllocatorFactory;

    fn factory() -> AllocatorFactory {
        let config = MemoryConfig {
            debug: DebugOptions::paranoid(),
            ..MemoryConfig::default()
        };
        AllocatorFactory::new(config).unwrap()
    }

    #[test]
    fn test_best_fit_routing() {
        let factory = factory();
        let allocator = factory.create_size_class_allocator(&[]).unwrap();

        assert_eq!(allocator.find_pool_for_size(50).unwrap().block_size(), 64);
        assert_eq!(allocator.find_pool_for_size(1024).unwrap().block_size(), 1024);
        assert!(allocator.find_pool_for_size(1025).is_none());
        assert_eq!(allocator.find_pool_for_size(1).unwrap().block_size(), 16);
    }

    #[test]
    fn test_actual_allocation_size() {
        let factory = factory();
        let allocator = factory.create_size_class_allocator(&[]).unwrap();
        assert_eq!(allocator.actual_allocation_size(50), 64);
        assert_eq!(allocator.actual_allocation_size(2000), 2000);
    }

    #[test]
    fn test_waste_accounting() {
        let factory = factory();
        let allocator = factory.create_size_class_allocator(&[]).unwrap();
        let handle = allocator.allocate(50, "STL_vector", false).unwrap();

        let stats = allocator.stats();
        assert_eq!(stats.outstanding_blocks, 1);
        assert_eq!(stats.total_bytes, 64);
        assert_eq!(stats.wasted_bytes, 14);

        allocator.free(handle).unwrap();
        let stats = allocator.stats();
        assert_eq!(stats.wasted_bytes, 0);
        assert_eq!(stats.peak_wasted_bytes, 14);
    }

    #[test]
    fn test_raw_path() {
        let factory = factory();
        let allocator = factory.create_size_class_allocator(&[]).unwrap();
        let handle = allocator.allocate(3000, "W3D_Texture", true).unwrap();
        assert!(handle.is_raw());
        assert_eq!(allocator.user_bytes_mut(handle).unwrap().len(), 3000);
        assert_eq!(allocator.debug_raw_block_bytes(), (1, 3000));
        assert!(allocator.debug_is_block_in_allocator(handle));
        factory.memory_verify().unwrap();

        allocator.free(handle).unwrap();
        assert!(!allocator.debug_is_block_in_allocator(handle));
        assert_eq!(allocator.stats().peak_large_block_bytes, 3000);
        assert!(allocator.free(handle).is_err());
    }

    #[test]
    fn test_negative_outstanding_count() {
        let factory = factory();
        let allocator = factory.create_size_class_allocator(&[]).unwrap();
        let pool = factory.find_pool("dmaPool_32").unwrap();
        let handle = pool.allocate_block("direct", false).unwrap();

        assert!(matches!(
            allocator.free(handle),
            Err(MemoryError::NegativeOutstandingCount { .. })
        ));
        pool.free_block(handle).unwrap();
    }

    #[test]
    fn test_raw_leak_report_owner() {
        let factory = factory();
        let allocator = factory.create_size_class_allocator(&[]).unwrap();
        let _raw = allocator.allocate(4096, "leaked_raw", false).unwrap();
        let ignored = allocator.allocate(4096, "ignored_raw", false).unwrap();
        allocator.debug_ignore_leaks_for_block(ignored).unwrap();

        let mut lines = Vec::new();
        let leaks = allocator.report_leaks(&mut |line: &str| lines.push(line.to_string()));
        assert_eq!(leaks, 1);
        assert!(lines[0].ends_with("from pool/dma (DMA)"));
    }

    #[test]
    fn test_reset_frees_raw_blocks() {
        let factory = factory();
        let allocator = factory.create_size_class_allocator(&[]).unwrap();
        allocator.allocate(5000, "raw", false).unwrap();
        allocator.allocate(40, "small", false).unwrap();

        allocator.reset().unwrap();
        let stats = allocator.stats();
        assert_eq!(stats.outstanding_blocks, 0);
        assert_eq!(stats.raw_blocks, 0);
        assert_eq!(stats.peak_large_block_bytes, 5000);
        assert_eq!(allocator.debug_raw_block_bytes(), (0, 0));
    }

    #[test]
    fn test_destroy_requires_empty() {
        let factory = factory();
        let classes = vec![
            SizeClassConfig::new("tiny", 8, 4, 4),
            SizeClassConfig::new("small", 24, 4, 4),
        ];
        let allocator = factory.create_size_class_allocator(&classes).unwrap();
        let handle = allocator.allocate(20, "t", false).unwrap();

        assert!(factory.destroy_size_class_allocator(&allocator).is_err());
        allocator.free(handle).unwrap();
        factory.destroy_size_class_allocator(&allocator).unwrap();
        assert!(factory.find_pool("tiny").is_none());
        assert!(allocator.allocate(4, "t", false).is_err());
    }

    #[test]
    fn test_info_report_lines() {
        let factory = factory();
        let allocator = factory.create_size_class_allocator(&[]).unwrap();
        let _a = allocator.allocate(2000, "a", false).unwrap();
        let _b = allocator.allocate(4000, "b", false).unwrap();

        let mut lines = Vec::new();
        allocator.info_report(&mut |line: &str| lines.push(line.to_string()));
        assert_eq!(
            lines,
            vec![
                "POOLINFO,Total Raw Blocks = 2",
                "POOLINFO,Total Raw Block Bytes = 6000",
                "POOLINFO,Average Raw Block Size = 3000",
            ]
        );
    }
}
