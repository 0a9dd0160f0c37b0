//! # Pool
//!
//! Fixed-size block allocator built from a growable list of slabs.
//!
//! ```text
//! Pool "ParticlePool" (block 64, initial 4096, overflow 256)
//!   slabs: [4096 blocks] <-> [256 blocks] <-> [256 blocks]
//!              ▲
//!          free_hint (slab most likely to have space)
//! ```
//!
//! ## Design
//!
//! - The first slab is created eagerly; a pool always starts with one.
//! - When every slab is full the pool grows by `overflow_count` blocks.
//!   An overflow of zero makes the pool fixed-size.
//! - Empty slabs are kept until `release_empty_slabs` is called explicitly.
//! - One mutex guards the whole pool for the whole of every operation.

use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::accounting::signed;
use crate::arena::{Arena, ArenaIndex};
use crate::block::{
    round_up_to_alignment, validate_tag, BlockHandle, BlockLocation, PoolId, ReleasedBlock,
};
use crate::checkpoint::Ledger;
use crate::error::{CorruptionKind, MemoryError, MemoryResult, OomReason};
use crate::factory::FactoryShared;
use crate::report::{emit, report_leaks, ReportFlags};
use crate::slab::{Slab, SlabList};

/// Counters of a pool at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Rounded block size in bytes.
    pub block_size: usize,
    /// Blocks in the first slab.
    pub initial_count: u32,
    /// Blocks per growth slab.
    pub overflow_count: u32,
    /// Blocks handed out.
    pub used_blocks: usize,
    /// Blocks on the slabs' free lists.
    pub free_blocks: usize,
    /// Blocks across all slabs.
    pub total_blocks: usize,
    /// Highest `used_blocks` since creation or the last reset.
    pub peak_blocks: usize,
    /// Number of slabs.
    pub slab_count: usize,
    /// Bytes held from the system, overhead included.
    pub physical_bytes: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    slabs: Arena<Slab>,
    list: SlabList,
    free_hint: Option<ArenaIndex>,
    used_blocks: usize,
    total_blocks: usize,
    peak_blocks: usize,
    ledger: Ledger,
    destroyed: bool,
}

/// A pool of fixed-size blocks.
pub struct Pool {
    id: PoolId,
    name: String,
    block_size: usize,
    initial_count: u32,
    overflow_count: u32,
    shared: Arc<FactoryShared>,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("block_size", &self.block_size)
            .field("initial_count", &self.initial_count)
            .field("overflow_count", &self.overflow_count)
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Creates a pool and its first slab.
    pub(crate) fn new(
        id: PoolId,
        name: &str,
        block_size: usize,
        initial_count: u32,
        overflow_count: u32,
        shared: Arc<FactoryShared>,
    ) -> MemoryResult<Self> {
        if initial_count == 0 {
            return Err(MemoryError::InvalidConfig(format!(
                "pool {name} needs at least one initial block"
            )));
        }

        let pool = Self {
            id,
            name: name.to_string(),
            block_size: round_up_to_alignment(block_size),
            initial_count,
            overflow_count,
            shared,
            state: Mutex::new(PoolState::default()),
        };
        {
            let mut state = pool.state.lock();
            pool.create_slab(&mut state, initial_count)?;
        }

        tracing::debug!(
            "Created pool {} (block {}, initial {}, overflow {})",
            pool.name,
            pool.block_size,
            initial_count,
            overflow_count
        );
        Ok(pool)
    }

    /// Returns the pool id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> PoolId {
        self.id
    }

    /// Returns the pool name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the rounded block size.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the block count of the first slab.
    #[inline]
    #[must_use]
    pub const fn initial_count(&self) -> u32 {
        self.initial_count
    }

    /// Returns the block count of each growth slab.
    #[inline]
    #[must_use]
    pub const fn overflow_count(&self) -> u32 {
        self.overflow_count
    }

    /// Returns the number of blocks in use.
    #[must_use]
    pub fn used_blocks(&self) -> usize {
        self.state.lock().used_blocks
    }

    /// Returns the peak number of blocks in use.
    #[must_use]
    pub fn peak_blocks(&self) -> usize {
        self.state.lock().peak_blocks
    }

    /// Returns the number of slabs.
    #[must_use]
    pub fn count_slabs(&self) -> usize {
        self.state.lock().slabs.len()
    }

    /// Takes a consistent snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut stats = PoolStats {
            block_size: self.block_size,
            initial_count: self.initial_count,
            overflow_count: self.overflow_count,
            used_blocks: state.used_blocks,
            total_blocks: state.total_blocks,
            peak_blocks: state.peak_blocks,
            slab_count: state.slabs.len(),
            ..PoolStats::default()
        };
        for (_, slab) in state.slabs.iter() {
            stats.free_blocks += slab.free_count();
            stats.physical_bytes += slab.physical_bytes();
        }
        stats
    }

    fn create_slab(&self, state: &mut PoolState, count: u32) -> MemoryResult<ArenaIndex> {
        let slab = Slab::init(
            &*self.shared.system,
            self.block_size,
            count as usize,
            self.shared.guards(),
            self.shared.debug_checks(),
            self.shared.wall_counter(),
        )?;
        let physical = slab.physical_bytes();
        let idx = state.slabs.insert(slab);
        state.list.push_back(&mut state.slabs, idx);
        state.total_blocks += count as usize;
        self.shared.usage.adjust("", 0, signed(physical));
        Ok(idx)
    }

    /// Finds a slab with a free block, growing the pool if needed.
    fn find_slab_with_space(&self, state: &mut PoolState) -> MemoryResult<ArenaIndex> {
        if let Some(hint) = state.free_hint {
            if state.slabs.get(hint).is_some_and(Slab::has_free_blocks) {
                return Ok(hint);
            }
        }

        let found = state
            .list
            .iter(&state.slabs)
            .find(|idx| state.slabs.get(*idx).is_some_and(Slab::has_free_blocks));
        if let Some(idx) = found {
            state.free_hint = Some(idx);
            return Ok(idx);
        }

        if self.overflow_count == 0 {
            return Err(MemoryError::OutOfMemory {
                reason: OomReason::PoolExhausted {
                    pool: self.name.clone(),
                },
            });
        }

        let idx = self.create_slab(state, self.overflow_count)?;
        tracing::debug!(
            "Pool {} grew by {} blocks ({} total)",
            self.name,
            self.overflow_count,
            state.total_blocks
        );
        state.free_hint = Some(idx);
        Ok(idx)
    }

    /// Allocates one block.
    ///
    /// # Arguments
    ///
    /// * `tag` - Literal naming the call site
    /// * `zero` - Zero the user data instead of filling it with the debug filler
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the pool is full and may not grow, or the system
    /// refuses a new slab. `BadTag` for an empty or reserved tag.
    pub fn allocate_block(&self, tag: &'static str, zero: bool) -> MemoryResult<BlockHandle> {
        self.allocate_sized(tag, zero, self.block_size)
    }

    /// Allocates one block on behalf of a request of `requested` bytes.
    pub(crate) fn allocate_sized(
        &self,
        tag: &'static str,
        zero: bool,
        requested: usize,
    ) -> MemoryResult<BlockHandle> {
        if self.shared.debug_checks() {
            validate_tag(tag)?;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.destroyed {
            return Err(MemoryError::Destroyed(self.name.clone()));
        }

        let slab_idx = self.find_slab_with_space(state)?;
        let stamp = self.shared.stamp(
            tag,
            self.block_size.saturating_sub(requested),
            self.block_size,
            &mut state.ledger,
        );
        let fill = self.shared.fill_for(zero);

        let slab = state
            .slabs
            .get_mut(slab_idx)
            .ok_or(MemoryError::corrupt(CorruptionKind::Linkage, tag))?;
        let block = slab
            .allocate_one(stamp)
            .ok_or(MemoryError::corrupt(CorruptionKind::Linkage, tag))?;
        slab.fill_user(block, fill);
        let generation = slab.header(block).map_or(0, |header| header.generation);

        state.used_blocks += 1;
        state.peak_blocks = state.peak_blocks.max(state.used_blocks);
        self.shared.usage.adjust(tag, signed(self.block_size), 0);

        if self.shared.options.enable_intense_verify {
            Self::verify_state(state, &self.name)?;
        }

        Ok(BlockHandle::slab(self.id, slab_idx, block, generation))
    }

    fn locate(&self, handle: BlockHandle) -> MemoryResult<(ArenaIndex, u32)> {
        match handle.location() {
            BlockLocation::Slab { pool, slab, block } if pool == self.id => Ok((slab, block)),
            _ => Err(MemoryError::corrupt(CorruptionKind::ForeignBlock, "")),
        }
    }

    /// Returns a block to its slab.
    ///
    /// # Errors
    ///
    /// `CorruptBlock` if the handle is foreign or stale, or the block's
    /// cookie or guard walls are damaged.
    pub fn free_block(&self, handle: BlockHandle) -> MemoryResult<()> {
        self.release_block(handle).map(|_| ())
    }

    pub(crate) fn release_block(&self, handle: BlockHandle) -> MemoryResult<ReleasedBlock> {
        let (slab_idx, block) = self.locate(handle)?;
        let debug = self.shared.debug_checks();
        let guards = self.shared.guards();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.destroyed {
            return Err(MemoryError::Destroyed(self.name.clone()));
        }

        let slab = state
            .slabs
            .get_mut(slab_idx)
            .ok_or(MemoryError::corrupt(CorruptionKind::StaleHandle, ""))?;
        slab.header(block)
            .ok_or(MemoryError::corrupt(CorruptionKind::Linkage, ""))?
            .check_live(handle.generation())?;
        if debug || guards {
            slab.verify_block(block)?;
        }
        let released = slab
            .free_one(block, debug)
            .ok_or(MemoryError::corrupt(CorruptionKind::Linkage, ""))?;

        let hint_has_space = state
            .free_hint
            .and_then(|hint| state.slabs.get(hint))
            .is_some_and(Slab::has_free_blocks);
        if !hint_has_space {
            state.free_hint = Some(slab_idx);
        }

        if let Some(index) = released.checkpoint {
            state
                .ledger
                .record_free(index, self.shared.current_checkpoint());
        }
        state.used_blocks -= 1;
        self.shared
            .usage
            .adjust(released.tag, -signed(self.block_size), 0);

        if self.shared.options.enable_intense_verify {
            Self::verify_state(state, &self.name)?;
        }
        Ok(released)
    }

    /// Frees every slab and recreates the initial one.
    ///
    /// Blocks still in use are discarded and their handles become stale.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the initial slab cannot be recreated.
    pub fn reset(&self) -> MemoryResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.destroyed {
            return Ok(());
        }

        let discarded = self.release_all(state);
        if discarded > 0 {
            tracing::warn!(
                "Pool {} reset with {} blocks still in use",
                self.name,
                discarded
            );
        }
        state.peak_blocks = 0;
        let idx = self.create_slab(state, self.initial_count)?;
        state.free_hint = Some(idx);
        Ok(())
    }

    /// Releases every slab. Returns the number of live blocks discarded.
    fn release_all(&self, state: &mut PoolState) -> usize {
        let checkpoint = self.shared.current_checkpoint();
        let mut discarded = 0;
        for mut slab in state.slabs.drain() {
            for released in slab.discard_live() {
                if let Some(index) = released.checkpoint {
                    state.ledger.record_free(index, checkpoint);
                }
                self.shared
                    .usage
                    .adjust(released.tag, -signed(self.block_size), 0);
                discarded += 1;
            }
            self.shared
                .usage
                .adjust("", 0, -signed(slab.physical_bytes()));
            slab.release(&*self.shared.system);
        }
        state.list.clear();
        state.free_hint = None;
        state.used_blocks = 0;
        state.total_blocks = 0;
        discarded
    }

    /// Returns slabs with no blocks in use to the system.
    ///
    /// Returns the number of bytes released.
    pub fn release_empty_slabs(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let empties: Vec<ArenaIndex> = state
            .list
            .iter(&state.slabs)
            .filter(|idx| state.slabs.get(*idx).is_some_and(|slab| slab.used() == 0))
            .collect();

        let mut released = 0;
        for idx in empties {
            state.list.unlink(&mut state.slabs, idx);
            if let Some(slab) = state.slabs.remove(idx) {
                let bytes = slab.physical_bytes();
                state.total_blocks -= slab.block_count();
                self.shared.usage.adjust("", 0, -signed(bytes));
                slab.release(&*self.shared.system);
                released += bytes;
            }
            if state.free_hint == Some(idx) {
                state.free_hint = None;
            }
        }

        if released > 0 {
            tracing::debug!("Pool {} released {} bytes of empty slabs", self.name, released);
        }
        released
    }

    /// Destroys the pool's slabs. Fails if any block is still in use.
    pub(crate) fn destroy(&self) -> MemoryResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.destroyed {
            return Ok(());
        }
        if state.used_blocks > 0 {
            return Err(MemoryError::PoolNotEmpty {
                name: self.name.clone(),
                used: state.used_blocks,
            });
        }
        self.release_all(state);
        state.destroyed = true;
        Ok(())
    }

    /// Destroys the pool regardless of live blocks. Returns how many were live.
    pub(crate) fn teardown(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.destroyed {
            return 0;
        }
        let discarded = self.release_all(state);
        state.destroyed = true;
        discarded
    }

    /// Walks every slab and block, checking guard walls, free lists, and counters.
    ///
    /// # Errors
    ///
    /// `CorruptBlock` or `BookkeepingMismatch` describing the first fault found.
    pub fn verify(&self) -> MemoryResult<()> {
        let state = self.state.lock();
        Self::verify_state(&state, &self.name)
    }

    fn verify_state(state: &PoolState, name: &str) -> MemoryResult<()> {
        let mut used = 0;
        let mut total = 0;
        let mut listed = 0;
        for idx in state.list.iter(&state.slabs) {
            let slab = state
                .slabs
                .get(idx)
                .ok_or(MemoryError::corrupt(CorruptionKind::Linkage, ""))?;
            slab.verify()?;
            used += slab.used();
            total += slab.block_count();
            listed += 1;
        }

        if listed != state.slabs.len() {
            return Err(MemoryError::corrupt(CorruptionKind::Linkage, ""));
        }
        if used != state.used_blocks {
            return Err(MemoryError::BookkeepingMismatch {
                what: format!("pool {name} used blocks"),
                cached: state.used_blocks,
                recounted: used,
            });
        }
        if total != state.total_blocks {
            return Err(MemoryError::BookkeepingMismatch {
                what: format!("pool {name} total blocks"),
                cached: state.total_blocks,
                recounted: total,
            });
        }
        Ok(())
    }

    /// Reports every live block not flagged to ignore. Returns the count.
    pub fn report_leaks(&self, sink: &mut dyn FnMut(&str)) -> usize {
        let state = self.state.lock();
        let headers = state
            .list
            .iter(&state.slabs)
            .filter_map(|idx| state.slabs.get(idx))
            .flat_map(|slab| slab.live_headers());
        report_leaks(
            headers,
            &self.name,
            &*self.shared.leak_filter,
            &*self.shared.tracer,
            sink,
        )
    }

    /// Emits `BLOCKINFO` lines for ledger records matching `flags`.
    pub fn checkpoint_report(
        &self,
        flags: ReportFlags,
        start: u32,
        end: u32,
        sink: &mut dyn FnMut(&str),
    ) -> usize {
        let state = self.state.lock();
        state
            .ledger
            .report(&self.name, flags, start, end, &*self.shared.tracer, sink)
    }

    pub(crate) fn clear_ledger(&self) {
        self.state.lock().ledger.clear();
    }

    /// Emits this pool's `POOLINFO` line.
    pub fn pool_info_report(&self, sink: &mut dyn FnMut(&str)) {
        let stats = self.stats();
        emit(
            sink,
            &format!(
                "POOLINFO,{:>32},{:>6},{:>6},{:>6},{:>6},{:>6},{:>6}",
                self.name,
                stats.block_size,
                stats.initial_count,
                stats.overflow_count,
                stats.used_blocks,
                stats.total_blocks,
                stats.peak_blocks
            ),
        );
    }

    /// Returns true if the handle names a live block of this pool.
    #[must_use]
    pub fn debug_is_block_in_pool(&self, handle: BlockHandle) -> bool {
        let Ok((slab, block)) = self.locate(handle) else {
            return false;
        };
        let state = self.state.lock();
        state
            .slabs
            .get(slab)
            .and_then(|slab| slab.header(block))
            .is_some_and(|header| header.check_live(handle.generation()).is_ok())
    }

    /// Returns the tag of a live block.
    #[must_use]
    pub fn debug_block_tag(&self, handle: BlockHandle) -> Option<&'static str> {
        let (slab, block) = self.locate(handle).ok()?;
        let state = self.state.lock();
        let header = state.slabs.get(slab)?.header(block)?;
        header
            .check_live(handle.generation())
            .ok()
            .map(|()| header.tag)
    }

    /// Excludes a live block from leak reports.
    ///
    /// # Errors
    ///
    /// `CorruptBlock` if the handle is foreign or stale.
    pub fn debug_ignore_leaks_for_block(&self, handle: BlockHandle) -> MemoryResult<()> {
        let (slab, block) = self.locate(handle)?;
        let mut state = self.state.lock();
        let header = state
            .slabs
            .get_mut(slab)
            .and_then(|slab| slab.header_mut(block))
            .ok_or(MemoryError::corrupt(CorruptionKind::StaleHandle, ""))?;
        header.check_live(handle.generation())?;
        header.ignore_leaks = true;
        Ok(())
    }

    fn lock_live(
        &self,
        handle: BlockHandle,
    ) -> MemoryResult<(MutexGuard<'_, PoolState>, ArenaIndex, u32)> {
        let (slab, block) = self.locate(handle)?;
        let state = self.state.lock();
        state
            .slabs
            .get(slab)
            .and_then(|slab| slab.header(block))
            .ok_or(MemoryError::corrupt(CorruptionKind::StaleHandle, ""))?
            .check_live(handle.generation())?;
        Ok((state, slab, block))
    }

    /// Locks the pool and exposes a live block's user data.
    ///
    /// The pool stays locked until the guard drops. Allocating, freeing or
    /// verifying through this pool while holding it deadlocks.
    ///
    /// # Errors
    ///
    /// `CorruptBlock` if the handle is foreign or stale.
    pub fn user_bytes_mut(&self, handle: BlockHandle) -> MemoryResult<MappedMutexGuard<'_, [u8]>> {
        let (state, slab, block) = self.lock_live(handle)?;
        MutexGuard::try_map(state, |state| {
            state
                .slabs
                .get_mut(slab)
                .and_then(|slab| slab.user_bytes_mut(block))
        })
        .map_err(|_| MemoryError::corrupt(CorruptionKind::StaleHandle, ""))
    }

    /// Locks the pool and exposes a live block's full stride, guard walls included.
    ///
    /// # Errors
    ///
    /// `CorruptBlock` if the handle is foreign or stale.
    pub fn debug_guarded_bytes_mut(
        &self,
        handle: BlockHandle,
    ) -> MemoryResult<MappedMutexGuard<'_, [u8]>> {
        let (state, slab, block) = self.lock_live(handle)?;
        MutexGuard::try_map(state, |state| {
            state
                .slabs
                .get_mut(slab)
                .and_then(|slab| slab.guarded_bytes_mut(block))
        })
        .map_err(|_| MemoryError::corrupt(CorruptionKind::StaleHandle, ""))
    }

    /// Locks the pool for a factory-wide recount.
    pub(crate) fn audit(&self) -> PoolAudit<'_> {
        PoolAudit {
            pool: self,
            state: self.state.lock(),
        }
    }
}

/// A locked pool, held while the factory recounts its totals.
pub(crate) struct PoolAudit<'a> {
    pool: &'a Pool,
    state: MutexGuard<'a, PoolState>,
}

impl PoolAudit<'_> {
    pub(crate) fn verify(&self) -> MemoryResult<()> {
        Pool::verify_state(&self.state, &self.pool.name)
    }

    pub(crate) fn used_bytes(&self) -> usize {
        self.state.used_blocks * self.pool.block_size
    }

    pub(crate) fn physical_bytes(&self) -> usize {
        self.state
            .slabs
            .iter()
            .map(|(_, slab)| slab.physical_bytes())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::WALL_SIZE;
    use crate::config::{DebugOptions, MemoryConfig};
    use crate::factory::AllocatorFactory;

    fn factory() -> AllocatorFactory {
        let config = MemoryConfig {
            debug: DebugOptions {
                enable_debug_checks: true,
                enable_guard_regions: true,
                ..DebugOptions::production()
            },
            ..MemoryConfig::default()
        };
        AllocatorFactory::new(config).unwrap()
    }

    #[test]
    fn test_pool_rounds_block_size() {
        let factory = factory();
        let pool = factory.create_pool("odd", 13, 4, 4).unwrap();
        assert_eq!(pool.block_size(), 16);
        assert_eq!(pool.count_slabs(), 1);
    }

    #[test]
    fn test_pool_growth() {
        let factory = factory();
        let pool = factory.create_pool("grow", 32, 4, 4).unwrap();

        let handles: Vec<_> = (0..4).map(|_| pool.allocate_block("t", false).unwrap()).collect();
        assert_eq!(pool.count_slabs(), 1);

        let fifth = pool.allocate_block("t", false).unwrap();
        assert_eq!(pool.count_slabs(), 2);
        assert_eq!(pool.stats().total_blocks, 8);

        for handle in handles {
            pool.free_block(handle).unwrap();
        }
        pool.free_block(fifth).unwrap();
        assert_eq!(pool.used_blocks(), 0);
        assert_eq!(pool.peak_blocks(), 5);
    }

    #[test]
    fn test_pool_fixed_size_exhausts() {
        let factory = factory();
        let pool = factory.create_pool("fixed", 32, 4, 0).unwrap();
        for _ in 0..4 {
            pool.allocate_block("t", false).unwrap();
        }
        let err = pool.allocate_block("t", false).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(pool.count_slabs(), 1);
    }

    #[test]
    fn test_pool_double_free_is_stale() {
        let factory = factory();
        let pool = factory.create_pool("df", 16, 2, 2).unwrap();
        let handle = pool.allocate_block("t", false).unwrap();
        pool.free_block(handle).unwrap();

        let err = pool.free_block(handle).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::CorruptBlock {
                kind: CorruptionKind::StaleHandle,
                ..
            }
        ));
        assert!(!pool.debug_is_block_in_pool(handle));
    }

    #[test]
    fn test_pool_rejects_foreign_handle() {
        let factory = factory();
        let a = factory.create_pool("a", 16, 2, 2).unwrap();
        let b = factory.create_pool("b", 16, 2, 2).unwrap();
        let handle = a.allocate_block("t", false).unwrap();

        assert!(matches!(
            b.free_block(handle),
            Err(MemoryError::CorruptBlock {
                kind: CorruptionKind::ForeignBlock,
                ..
            })
        ));
        a.free_block(handle).unwrap();
    }

    #[test]
    fn test_pool_zero_and_filler() {
        let factory = factory();
        let pool = factory.create_pool("fill", 16, 2, 2).unwrap();

        let zeroed = pool.allocate_block("t", true).unwrap();
        assert!(pool.user_bytes_mut(zeroed).unwrap().iter().all(|&b| b == 0));

        let filled = pool.allocate_block("t", false).unwrap();
        let filler = factory.filler().to_le_bytes();
        assert_eq!(&pool.user_bytes_mut(filled).unwrap()[..4], &filler);

        pool.user_bytes_mut(zeroed).unwrap().copy_from_slice(&[7u8; 16]);
        pool.free_block(zeroed).unwrap();
        pool.free_block(filled).unwrap();
    }

    #[test]
    fn test_pool_reused_slot_gets_new_handle() {
        let factory = factory();
        let pool = factory.create_pool("reuse", 16, 1, 0).unwrap();
        let handle = pool.allocate_block("t", true).unwrap();
        pool.free_block(handle).unwrap();

        // Same slot, bumped generation
        let again = pool.allocate_block("t", false).unwrap();
        assert_ne!(handle, again);
        assert!(!pool.debug_is_block_in_pool(handle));
        assert_eq!(pool.debug_block_tag(again), Some("t"));

        let bytes = pool.debug_guarded_bytes_mut(again).unwrap();
        assert_eq!(bytes.len(), 16 + 2 * WALL_SIZE);
        drop(bytes);
        pool.free_block(again).unwrap();
    }

    #[test]
    fn test_pool_release_empty_slabs() {
        let factory = factory();
        let pool = factory.create_pool("compact", 16, 2, 2).unwrap();
        let handles: Vec<_> = (0..6).map(|_| pool.allocate_block("t", false).unwrap()).collect();
        assert_eq!(pool.count_slabs(), 3);

        // Keep one block alive in the first slab
        for handle in &handles[1..] {
            pool.free_block(*handle).unwrap();
        }
        let released = pool.release_empty_slabs();
        assert!(released > 0);
        assert_eq!(pool.count_slabs(), 1);
        assert_eq!(pool.stats().total_blocks, 2);
        pool.verify().unwrap();

        pool.free_block(handles[0]).unwrap();
    }

    #[test]
    fn test_pool_reset_discards_live_blocks() {
        let factory = factory();
        let pool = factory.create_pool("reset", 16, 4, 4).unwrap();
        let handles: Vec<_> = (0..7).map(|_| pool.allocate_block("t", false).unwrap()).collect();

        pool.reset().unwrap();
        assert_eq!(pool.used_blocks(), 0);
        assert_eq!(pool.count_slabs(), 1);
        assert!(pool.free_block(handles[0]).is_err());

        for _ in 0..4 {
            pool.allocate_block("t", false).unwrap();
        }
        assert_eq!(pool.count_slabs(), 1);
    }

    #[test]
    fn test_pool_info_line() {
        let factory = factory();
        let pool = factory.create_pool("InfoPool", 24, 8, 4).unwrap();
        let mut lines = Vec::new();
        pool.pool_info_report(&mut |line: &str| lines.push(line.to_string()));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("POOLINFO,"));
        assert!(lines[0].contains("InfoPool"));
    }
}
