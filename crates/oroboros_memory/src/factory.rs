//! # Allocator Factory
//!
//! Process-wide owner of every pool and size-class allocator.
//!
//! ```text
//! AllocatorFactory
//!   ├── registry (Mutex)
//!   │     ├── pools:      [dmaPool_16, dmaPool_32, ..., ParticlePool]
//!   │     └── allocators: [SizeClassAllocator #0]
//!   └── shared (Arc, read by every pool)
//!         ├── debug options, collaborators
//!         ├── usage totals (atomic)
//!         └── checkpoint / filler / wall counters
//! ```
//!
//! ## Lock order
//!
//! registry → allocator → pool. Allocation paths never touch the registry.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::accounting::{CategoryUsage, UsageSnapshot, UsageTotals};
use crate::block::{
    filler_value, round_up_to_alignment, AllocationStamp, AllocatorId, Fill, PoolId,
    INITIAL_WALL_PATTERN,
};
use crate::checkpoint::{block_report_header, Ledger};
use crate::config::{validate_ladder, DebugOptions, MemoryConfig, SizeClassConfig};
use crate::error::{MemoryError, MemoryResult};
use crate::pool::{Pool, PoolStats};
use crate::report::{banner, emit, substring_leak_filter, LeakFilter, ReportFlags};
use crate::size_class::SizeClassAllocator;
use crate::stack_trace::{
    NullStackTracer, StackTracer, STACK_TRACE_DEPTH, STACK_TRACE_MAX, STACK_TRACE_SKIP,
};
use crate::system::{HeapSystemAllocator, SystemAllocator};

/// Pools whose peak stays under half their initial slab and waste more
/// than this many bytes are flagged by the underflow report.
const UNDERFLOW_WASTE_THRESHOLD: usize = 4096;

/// External services a factory depends on.
#[derive(Clone)]
pub struct Collaborators {
    /// Source of backing storage.
    pub system: Arc<dyn SystemAllocator>,
    /// Allocation-site provenance.
    pub tracer: Arc<dyn StackTracer>,
    /// Leak-report filter. Defaults to the config's ignore list.
    pub leak_filter: Option<LeakFilter>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            system: Arc::new(HeapSystemAllocator::new()),
            tracer: Arc::new(NullStackTracer),
            leak_filter: None,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("leak_filter", &self.leak_filter.is_some())
            .finish_non_exhaustive()
    }
}

/// State every pool and allocator of one factory reads.
pub(crate) struct FactoryShared {
    pub(crate) options: DebugOptions,
    pub(crate) system: Arc<dyn SystemAllocator>,
    pub(crate) tracer: Arc<dyn StackTracer>,
    pub(crate) leak_filter: LeakFilter,
    pub(crate) usage: UsageTotals,
    checkpoint: AtomicU32,
    filler: AtomicU32,
    wall_pattern: AtomicU32,
    ignore_leaks_on_allocate: AtomicBool,
    rng: Mutex<StdRng>,
}

impl FactoryShared {
    fn new(config: &MemoryConfig, collaborators: Collaborators) -> Self {
        let leak_filter = collaborators
            .leak_filter
            .unwrap_or_else(|| substring_leak_filter(config.leak_ignore_tags.clone()));
        let shared = Self {
            options: config.debug,
            system: collaborators.system,
            tracer: collaborators.tracer,
            leak_filter,
            usage: UsageTotals::new(&config.usage_categories),
            checkpoint: AtomicU32::new(0),
            filler: AtomicU32::new(filler_value(0)),
            wall_pattern: AtomicU32::new(INITIAL_WALL_PATTERN),
            ignore_leaks_on_allocate: AtomicBool::new(false),
            rng: Mutex::new(StdRng::seed_from_u64(config.filler_seed)),
        };
        shared.rotate_filler();
        shared
    }

    #[inline]
    pub(crate) const fn guards(&self) -> bool {
        self.options.enable_guard_regions
    }

    #[inline]
    pub(crate) const fn debug_checks(&self) -> bool {
        self.options.enable_debug_checks
    }

    /// Counter the next guard-wall pattern is drawn from.
    #[inline]
    pub(crate) fn wall_counter(&self) -> &AtomicU32 {
        &self.wall_pattern
    }

    pub(crate) fn next_wall_pattern(&self) -> u32 {
        if self.guards() {
            self.wall_pattern.fetch_add(1, Ordering::Relaxed)
        } else {
            0
        }
    }

    #[inline]
    pub(crate) fn current_checkpoint(&self) -> u32 {
        self.checkpoint.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn filler(&self) -> u32 {
        self.filler.load(Ordering::Relaxed)
    }

    /// Picks a new debug filler so stale data differs from run to run.
    fn rotate_filler(&self) {
        let index = self.rng.lock().gen_range(0..8u32);
        let value = filler_value(index);
        self.filler.store(value, Ordering::Relaxed);
        tracing::debug!("Setting debug filler to {:08x} (index {})", value, index);
    }

    /// How fresh user data is initialized.
    pub(crate) fn fill_for(&self, zero: bool) -> Fill {
        if zero {
            Fill::Zero
        } else if self.debug_checks() {
            Fill::Pattern(self.filler())
        } else {
            Fill::Keep
        }
    }

    /// Builds the metadata for a new allocation and records it in `ledger`.
    pub(crate) fn stamp(
        &self,
        tag: &'static str,
        wasted: usize,
        block_size: usize,
        ledger: &mut Ledger,
    ) -> AllocationStamp {
        let stack = self.options.enable_stack_traces.then(|| {
            let mut addresses = self
                .tracer
                .capture_addresses(STACK_TRACE_DEPTH, STACK_TRACE_SKIP);
            addresses.truncate(STACK_TRACE_MAX);
            addresses.into_boxed_slice()
        });
        let checkpoint = if self.options.enable_checkpointing {
            ledger.record_allocation(tag, block_size, self.current_checkpoint(), stack.clone())
        } else {
            None
        };
        AllocationStamp {
            tag,
            wasted,
            ignore_leaks: self.ignore_leaks_on_allocate.load(Ordering::Relaxed),
            checkpoint,
            stack,
        }
    }
}

#[derive(Default)]
struct Registry {
    pools: Vec<Arc<Pool>>,
    allocators: Vec<Arc<SizeClassAllocator>>,
    next_pool: u32,
    next_allocator: u32,
}

impl Registry {
    fn is_owned(&self, pool: PoolId) -> bool {
        self.allocators
            .iter()
            .any(|allocator| allocator.owns_pool(pool))
    }
}

/// Owner of all pools and size-class allocators of a process.
pub struct AllocatorFactory {
    config: MemoryConfig,
    shared: Arc<FactoryShared>,
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for AllocatorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("AllocatorFactory")
            .field("pools", &registry.pools.len())
            .field("allocators", &registry.allocators.len())
            .field("checkpoint", &self.shared.current_checkpoint())
            .finish_non_exhaustive()
    }
}

impl AllocatorFactory {
    /// Creates a factory backed by the global heap.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` or a ladder error if `config` is invalid.
    pub fn new(config: MemoryConfig) -> MemoryResult<Self> {
        Self::with_collaborators(config, Collaborators::default())
    }

    /// Creates a factory with explicit collaborators.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` or a ladder error if `config` is invalid.
    pub fn with_collaborators(
        mut config: MemoryConfig,
        collaborators: Collaborators,
    ) -> MemoryResult<Self> {
        config.normalize();
        config.validate()?;
        let shared = Arc::new(FactoryShared::new(&config, collaborators));
        tracing::info!(
            "Memory factory created (debug checks: {}, guards: {}, checkpoints: {})",
            config.debug.enable_debug_checks,
            config.debug.enable_guard_regions,
            config.debug.enable_checkpointing
        );
        Ok(Self {
            config,
            shared,
            registry: Mutex::new(Registry::default()),
        })
    }

    /// Returns the configuration the factory was built with.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Returns the debug options in force.
    #[inline]
    #[must_use]
    pub fn debug_options(&self) -> DebugOptions {
        self.shared.options
    }

    // ========================================================================
    // Pools
    // ========================================================================

    /// Returns the pool named `name`, creating it if it does not exist.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique pool name
    /// * `block_size` - Bytes per block (rounded up to the alignment)
    /// * `initial` - Blocks in the first slab; zero consults the pool-size table
    /// * `overflow` - Blocks per growth slab; zero forbids growth
    ///
    /// # Errors
    ///
    /// `PoolSizeMismatch` if a pool of that name exists with another block
    /// size, `InvalidConfig` if no initial count can be determined, or
    /// `OutOfMemory` if the first slab cannot be allocated.
    pub fn create_pool(
        &self,
        name: &str,
        block_size: usize,
        initial: u32,
        overflow: u32,
    ) -> MemoryResult<Arc<Pool>> {
        let mut registry = self.registry.lock();
        self.create_pool_locked(&mut registry, name, block_size, initial, overflow)
    }

    fn create_pool_locked(
        &self,
        registry: &mut Registry,
        name: &str,
        block_size: usize,
        initial: u32,
        overflow: u32,
    ) -> MemoryResult<Arc<Pool>> {
        if let Some(pool) = registry.pools.iter().find(|pool| pool.name() == name) {
            let requested = round_up_to_alignment(block_size);
            if pool.block_size() != requested {
                return Err(MemoryError::PoolSizeMismatch {
                    name: name.to_string(),
                    existing: pool.block_size(),
                    requested,
                });
            }
            return Ok(Arc::clone(pool));
        }

        let (initial, overflow) = if initial == 0 {
            self.config.pool_size_override(name).unwrap_or((0, 0))
        } else {
            (initial, overflow)
        };

        let id = PoolId(registry.next_pool);
        let pool = Arc::new(Pool::new(
            id,
            name,
            block_size,
            initial,
            overflow,
            Arc::clone(&self.shared),
        )?);
        registry.next_pool += 1;
        registry.pools.push(Arc::clone(&pool));
        Ok(pool)
    }

    /// Looks up a pool by name.
    #[must_use]
    pub fn find_pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.registry
            .lock()
            .pools
            .iter()
            .find(|pool| pool.name() == name)
            .cloned()
    }

    /// Destroys an empty pool and unregisters it.
    ///
    /// # Errors
    ///
    /// `PoolNotEmpty` if blocks are in use, `InvalidConfig` if the pool
    /// belongs to a size-class allocator.
    pub fn destroy_pool(&self, pool: &Arc<Pool>) -> MemoryResult<()> {
        let mut registry = self.registry.lock();
        if registry.is_owned(pool.id()) {
            return Err(MemoryError::InvalidConfig(format!(
                "pool {} belongs to a size-class allocator",
                pool.name()
            )));
        }
        pool.destroy()?;
        registry.pools.retain(|entry| entry.id() != pool.id());
        tracing::debug!("Destroyed pool {}", pool.name());
        Ok(())
    }

    /// Snapshot of every registered pool.
    #[must_use]
    pub fn pool_stats(&self) -> Vec<(String, PoolStats)> {
        self.registry
            .lock()
            .pools
            .iter()
            .map(|pool| (pool.name().to_string(), pool.stats()))
            .collect()
    }

    // ========================================================================
    // Size-class allocators
    // ========================================================================

    /// Creates a size-class allocator. An empty ladder selects the built-in one.
    ///
    /// # Errors
    ///
    /// `TooManySizeClasses` or `SizeClassOrder` for a bad ladder, or any
    /// error from creating its pools.
    pub fn create_size_class_allocator(
        &self,
        classes: &[SizeClassConfig],
    ) -> MemoryResult<Arc<SizeClassAllocator>> {
        let default_ladder;
        let classes = if classes.is_empty() {
            default_ladder = SizeClassConfig::default_ladder();
            &default_ladder[..]
        } else {
            classes
        };
        validate_ladder(classes)?;

        let mut registry = self.registry.lock();
        let mut pools = Vec::with_capacity(classes.len());
        let mut created = Vec::new();
        for class in classes {
            let existed = registry.pools.iter().any(|pool| pool.name() == class.name);
            match self.create_pool_locked(
                &mut registry,
                &class.name,
                class.block_size,
                class.initial,
                class.overflow,
            ) {
                Ok(pool) => {
                    if !existed {
                        created.push(pool.id());
                    }
                    pools.push(pool);
                }
                Err(err) => {
                    // Pools made for earlier classes have no owner yet
                    for pool in pools.iter().filter(|pool| created.contains(&pool.id())) {
                        pool.teardown();
                    }
                    registry.pools.retain(|pool| !created.contains(&pool.id()));
                    return Err(err);
                }
            }
        }

        let id = AllocatorId(registry.next_allocator);
        registry.next_allocator += 1;
        let allocator = Arc::new(SizeClassAllocator::new(id, pools, Arc::clone(&self.shared)));
        registry.allocators.push(Arc::clone(&allocator));

        tracing::info!(
            "Created size-class allocator {} with {} classes",
            id.raw(),
            classes.len()
        );
        Ok(allocator)
    }

    /// Destroys an allocator with no outstanding blocks, along with the
    /// pools no other allocator uses.
    ///
    /// # Errors
    ///
    /// `PoolNotEmpty` if the allocator or one of its pools still has blocks
    /// in use.
    pub fn destroy_size_class_allocator(
        &self,
        allocator: &Arc<SizeClassAllocator>,
    ) -> MemoryResult<()> {
        let mut registry = self.registry.lock();
        let doomed: Vec<Arc<Pool>> = allocator
            .pools()
            .iter()
            .filter(|pool| {
                !registry
                    .allocators
                    .iter()
                    .any(|other| other.id() != allocator.id() && other.owns_pool(pool.id()))
            })
            .cloned()
            .collect();

        // Nothing changes unless every piece can go
        let outstanding = allocator.stats().outstanding_blocks;
        if outstanding > 0 {
            return Err(MemoryError::PoolNotEmpty {
                name: format!("size-class allocator {}", allocator.id().raw()),
                used: outstanding,
            });
        }
        if let Some(pool) = doomed.iter().find(|pool| pool.used_blocks() > 0) {
            return Err(MemoryError::PoolNotEmpty {
                name: pool.name().to_string(),
                used: pool.used_blocks(),
            });
        }

        allocator.destroy()?;
        registry
            .allocators
            .retain(|entry| entry.id() != allocator.id());
        for pool in &doomed {
            pool.destroy()?;
            registry.pools.retain(|entry| entry.id() != pool.id());
        }
        tracing::debug!("Destroyed size-class allocator {}", allocator.id().raw());
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Resets every pool and allocator, ready for a new session.
    ///
    /// Handles issued before the reset become stale. Checkpoint history is
    /// cleared, usage totals are recounted, and the debug filler changes.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if a pool cannot recreate its initial slab.
    pub fn reset(&self) -> MemoryResult<()> {
        let registry = self.registry.lock();
        self.shared.checkpoint.store(0, Ordering::Relaxed);

        for allocator in &registry.allocators {
            allocator.reset()?;
        }
        for pool in &registry.pools {
            if !registry.is_owned(pool.id()) {
                pool.reset()?;
            }
            pool.clear_ledger();
        }

        let physical = registry
            .pools
            .iter()
            .map(|pool| pool.stats().physical_bytes)
            .sum();
        self.shared.usage.rederive(0, physical);
        self.shared.rotate_filler();

        tracing::info!(
            "Memory factory reset ({} pools, {} allocators)",
            registry.pools.len(),
            registry.allocators.len()
        );
        Ok(())
    }

    /// Releases everything, live blocks included. Returns how many blocks
    /// were still in use.
    pub fn teardown(&self) -> usize {
        let mut registry = self.registry.lock();
        let mut discarded = 0;
        for allocator in registry.allocators.drain(..) {
            discarded += allocator.teardown();
        }
        for pool in registry.pools.drain(..) {
            discarded += pool.teardown();
        }
        if discarded > 0 {
            tracing::warn!("Memory factory torn down with {} blocks in use", discarded);
        }
        discarded
    }

    // ========================================================================
    // Accounting
    // ========================================================================

    /// Applies signed deltas to the global and per-category usage counters.
    pub fn adjust_totals(&self, tag: &str, used_delta: isize, physical_delta: isize) {
        self.shared.usage.adjust(tag, used_delta, physical_delta);
    }

    /// Current and peak usage.
    #[must_use]
    pub fn usage(&self) -> UsageSnapshot {
        self.shared.usage.snapshot()
    }

    /// Usage per tag-prefix category, `Misc` first.
    #[must_use]
    pub fn category_usage(&self) -> Vec<CategoryUsage> {
        self.shared.usage.categories()
    }

    /// Bytes the system allocator currently has handed out.
    #[must_use]
    pub fn system_outstanding_bytes(&self) -> usize {
        self.shared.system.outstanding_bytes()
    }

    /// Highest byte count the system allocator has handed out.
    #[must_use]
    pub fn system_peak_bytes(&self) -> usize {
        self.shared.system.peak_bytes()
    }

    /// Current debug filler word.
    #[must_use]
    pub fn filler(&self) -> u32 {
        self.shared.filler()
    }

    pub(crate) fn set_ignore_leaks_on_allocate(&self, ignore: bool) {
        self.shared
            .ignore_leaks_on_allocate
            .store(ignore, Ordering::Relaxed);
    }

    /// Re-walks every pool and allocator and checks the cached totals.
    ///
    /// Every lock is held for the duration, so the recount is exact.
    ///
    /// # Errors
    ///
    /// The first `CorruptBlock` or `BookkeepingMismatch` found.
    pub fn memory_verify(&self) -> MemoryResult<()> {
        let registry = self.registry.lock();
        let allocator_audits: Vec<_> = registry
            .allocators
            .iter()
            .map(|allocator| allocator.audit())
            .collect();
        let pool_audits: Vec<_> = registry.pools.iter().map(|pool| pool.audit()).collect();

        let mut used = 0;
        let mut physical = 0;
        for audit in &allocator_audits {
            audit.verify()?;
            used += audit.used_bytes();
            physical += audit.physical_bytes();
        }
        for audit in &pool_audits {
            audit.verify()?;
            used += audit.used_bytes();
            physical += audit.physical_bytes();
        }

        let snapshot = self.shared.usage.snapshot();
        if snapshot.used_bytes != used {
            return Err(MemoryError::BookkeepingMismatch {
                what: "factory used bytes".to_string(),
                cached: snapshot.used_bytes,
                recounted: used,
            });
        }
        if snapshot.physical_bytes != physical {
            return Err(MemoryError::BookkeepingMismatch {
                what: "factory physical bytes".to_string(),
                cached: snapshot.physical_bytes,
                recounted: physical,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Checkpoints & Reports
    // ========================================================================

    /// Advances the checkpoint counter and returns the new value.
    pub fn set_checkpoint(&self) -> u32 {
        self.shared.checkpoint.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the current checkpoint value.
    #[must_use]
    pub fn current_checkpoint(&self) -> u32 {
        self.shared.current_checkpoint()
    }

    /// Emits the sections selected by `flags`.
    ///
    /// # Arguments
    ///
    /// * `flags` - Sections and checkpoint filters
    /// * `start` / `end` - Checkpoint window `[start, end)` for block reports
    /// * `sink` - Receives one line per call
    pub fn memory_report(
        &self,
        flags: ReportFlags,
        start: u32,
        end: u32,
        sink: &mut dyn FnMut(&str),
    ) {
        let registry = self.registry.lock();

        if flags.contains(ReportFlags::FACTORYINFO) {
            let usage = self.shared.usage.snapshot();
            banner(sink, "Begin Factory Info Report");
            emit(sink, &format!("Bytes in use (logical) = {}", usage.used_bytes));
            emit(sink, &format!("Bytes in use (physical) = {}", usage.physical_bytes));
            emit(sink, &format!("PEAK Bytes in use (logical) = {}", usage.peak_used_bytes));
            emit(sink, &format!("PEAK Bytes in use (physical) = {}", usage.peak_physical_bytes));
            banner(sink, "End Factory Info Report");
        }

        if flags.contains(ReportFlags::POOLINFO) {
            banner(sink, "Begin Pool Info Report");
            emit(
                sink,
                &format!(
                    "POOLINFO,{:>32},{:>6},{:>6},{:>6},{:>6},{:>6},{:>6}",
                    "POOLNAME", "BLKSZ", "INIT", "OVRFL", "USED", "TOTAL", "PEAK"
                ),
            );
            for pool in &registry.pools {
                pool.pool_info_report(sink);
            }
            for allocator in &registry.allocators {
                allocator.info_report(sink);
            }
            banner(sink, "End Pool Info Report");
        }

        if flags.contains(ReportFlags::POOL_OVERFLOW) {
            Self::pool_overflow_report(&registry, sink);
        }

        if flags.contains(ReportFlags::SIMPLE_LEAKS) {
            banner(sink, "Begin Simple Leak Report");
            let leaks = Self::count_leaks(&registry, sink);
            emit(sink, &format!("Total leaked blocks = {leaks}"));
            banner(sink, "End Simple Leak Report");
        }

        if flags.wants_block_report() {
            self.block_report(&registry, flags, start, end, sink);
        }
    }

    fn pool_overflow_report(registry: &Registry, sink: &mut dyn FnMut(&str)) {
        banner(sink, "Begin Pool Overflow Report");
        for pool in &registry.pools {
            let stats = pool.stats();
            if stats.peak_blocks > stats.initial_count as usize {
                emit(
                    sink,
                    &format!(
                        "*** Pool {} overflowed initial allocation of {} (peak allocation was {})",
                        pool.name(),
                        stats.initial_count,
                        stats.peak_blocks
                    ),
                );
            }
        }
        banner(sink, "End Pool Overflow Report");

        banner(sink, "Begin Pool Underflow Report");
        for pool in &registry.pools {
            let stats = pool.stats();
            let peak = stats.peak_blocks * stats.block_size;
            let initial = stats.initial_count as usize * stats.block_size;
            if peak < initial / 2 && initial - peak > UNDERFLOW_WASTE_THRESHOLD {
                emit(
                    sink,
                    &format!(
                        "*** Pool {} used less than half its initial allocation of {} (peak allocation was {}, wasted {}k)",
                        pool.name(),
                        stats.initial_count,
                        stats.peak_blocks,
                        (initial - peak) / 1024
                    ),
                );
            }
        }
        banner(sink, "End Pool Underflow Report");
    }

    fn count_leaks(registry: &Registry, sink: &mut dyn FnMut(&str)) -> usize {
        let raw: usize = registry
            .allocators
            .iter()
            .map(|allocator| allocator.report_leaks(sink))
            .sum();
        let pooled: usize = registry.pools.iter().map(|pool| pool.report_leaks(sink)).sum();
        raw + pooled
    }

    fn block_report(
        &self,
        registry: &Registry,
        flags: ReportFlags,
        start: u32,
        end: u32,
        sink: &mut dyn FnMut(&str),
    ) -> usize {
        banner(
            sink,
            &format!("Begin Block Report for checkpoints {start} - {end}"),
        );
        emit(sink, &format!("Flags: {}", flags.describe_checkpoint_filters()));
        if !self.shared.options.enable_checkpointing {
            emit(sink, "Checkpointing is disabled; no blocks recorded");
        }
        block_report_header(sink);

        let mut reported = 0;
        for allocator in &registry.allocators {
            reported += allocator.checkpoint_report(flags, start, end, sink);
        }
        for pool in &registry.pools {
            reported += pool.checkpoint_report(flags, start, end, sink);
        }
        banner(sink, "End Block Report");
        reported
    }

    /// Reports recorded blocks whose lifetime matches `flags` in `[start, end)`.
    ///
    /// Returns the number of blocks reported.
    pub fn checkpoint_report(
        &self,
        flags: ReportFlags,
        start: u32,
        end: u32,
        sink: &mut dyn FnMut(&str),
    ) -> usize {
        let registry = self.registry.lock();
        self.block_report(&registry, flags, start, end, sink)
    }

    /// Reports every live block not flagged to ignore. Returns the count.
    pub fn simple_leak_report(&self, sink: &mut dyn FnMut(&str)) -> usize {
        let registry = self.registry.lock();
        Self::count_leaks(&registry, sink)
    }

    /// CSV usage dump: large blocks, then per-pool peak and waste in KiB,
    /// with per-category peaks in trailing columns.
    pub fn usage_report_csv(&self, sink: &mut dyn FnMut(&str)) {
        let registry = self.registry.lock();
        let large_peak: usize = registry
            .allocators
            .iter()
            .map(|allocator| allocator.stats().peak_large_block_bytes)
            .sum();

        let mut pool_cells = vec![format!("Unpooled Large Blocks,{}", large_peak / 1024)];
        pool_cells.extend(registry.pools.iter().map(|pool| {
            let stats = pool.stats();
            let peak = stats.peak_blocks * stats.block_size;
            let waste = (stats.initial_count as usize * stats.block_size).saturating_sub(peak);
            format!("{},{},{}", pool.name(), peak / 1024, waste / 1024)
        }));
        let categories = self.shared.usage.categories();

        for row in 0..pool_cells.len().max(categories.len()) {
            let mut line = pool_cells.get(row).cloned().unwrap_or_else(|| ",".to_string());
            if let Some(category) = categories.get(row) {
                line.push_str(&format!(
                    ",,,{},{}",
                    category.prefix,
                    category.peak_used_bytes / 1024
                ));
            }
            emit(sink, &line);
        }
    }
}

impl Drop for AllocatorFactory {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::BudgetSystemAllocator;

    fn debug_config() -> MemoryConfig {
        MemoryConfig {
            debug: DebugOptions::paranoid(),
            ..MemoryConfig::default()
        }
    }

    #[test]
    fn test_named_pool_reuse() {
        let factory = AllocatorFactory::new(debug_config()).unwrap();
        let a = factory.create_pool("Mesh", 48, 8, 8).unwrap();
        let b = factory.create_pool("Mesh", 48, 8, 8).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(factory.find_pool("Mesh").is_some());

        let err = factory.create_pool("Mesh", 96, 8, 8).unwrap_err();
        assert!(matches!(err, MemoryError::PoolSizeMismatch { .. }));
    }

    #[test]
    fn test_pool_size_table() {
        let mut config = debug_config();
        config.pool_sizes.push(crate::config::PoolSizeOverride {
            name: "Table".to_string(),
            initial: 12,
            overflow: 4,
        });
        let factory = AllocatorFactory::new(config).unwrap();

        let pool = factory.create_pool("Table", 32, 0, 0).unwrap();
        assert_eq!(pool.initial_count(), 12);
        assert_eq!(pool.overflow_count(), 4);

        let err = factory.create_pool("Unlisted", 32, 0, 0).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidConfig(_)));
    }

    #[test]
    fn test_destroy_pool_requires_empty() {
        let factory = AllocatorFactory::new(debug_config()).unwrap();
        let pool = factory.create_pool("Busy", 16, 4, 4).unwrap();
        let handle = pool.allocate_block("t", false).unwrap();

        assert!(matches!(
            factory.destroy_pool(&pool),
            Err(MemoryError::PoolNotEmpty { used: 1, .. })
        ));
        pool.free_block(handle).unwrap();
        factory.destroy_pool(&pool).unwrap();
        assert!(factory.find_pool("Busy").is_none());
        assert!(pool.allocate_block("t", false).is_err());
    }

    #[test]
    fn test_cannot_destroy_size_class_pool_directly() {
        let factory = AllocatorFactory::new(debug_config()).unwrap();
        let _allocator = factory.create_size_class_allocator(&[]).unwrap();
        let pool = factory.find_pool("dmaPool_64").unwrap();
        assert!(factory.destroy_pool(&pool).is_err());
    }

    #[test]
    fn test_failed_allocator_creation_keeps_registry_clean() {
        let factory = AllocatorFactory::new(debug_config()).unwrap();
        let existing = factory.create_pool("y", 64, 4, 4).unwrap();
        let physical = factory.usage().physical_bytes;

        let ladder = [
            SizeClassConfig::new("x", 16, 4, 4),
            SizeClassConfig::new("y", 32, 4, 4),
        ];
        let err = factory.create_size_class_allocator(&ladder).unwrap_err();
        assert!(matches!(err, MemoryError::PoolSizeMismatch { .. }));

        assert!(factory.find_pool("x").is_none());
        assert!(Arc::ptr_eq(&factory.find_pool("y").unwrap(), &existing));
        assert_eq!(factory.usage().physical_bytes, physical);
        factory.memory_verify().unwrap();
    }

    #[test]
    fn test_destroy_allocator_with_busy_pool_changes_nothing() {
        let factory = AllocatorFactory::new(debug_config()).unwrap();
        let ladder = [
            SizeClassConfig::new("p16", 16, 4, 4),
            SizeClassConfig::new("p32", 32, 4, 4),
        ];
        let allocator = factory.create_size_class_allocator(&ladder).unwrap();
        let p32 = factory.find_pool("p32").unwrap();
        let direct = p32.allocate_block("W3D_Direct", false).unwrap();

        assert!(matches!(
            factory.destroy_size_class_allocator(&allocator),
            Err(MemoryError::PoolNotEmpty { used: 1, .. })
        ));
        assert!(factory.find_pool("p16").is_some());
        assert!(factory.find_pool("p32").is_some());
        let handle = allocator.allocate(8, "W3D_Still", false).unwrap();
        allocator.free(handle).unwrap();

        p32.free_block(direct).unwrap();
        factory.destroy_size_class_allocator(&allocator).unwrap();
        assert!(factory.find_pool("p16").is_none());
        assert!(factory.find_pool("p32").is_none());
        assert!(allocator.allocate(8, "W3D_Gone", false).is_err());
    }

    #[test]
    fn test_pool_size_table_is_rounded_for_built_configs() {
        let mut config = debug_config();
        config.pool_sizes.push(crate::config::PoolSizeOverride {
            name: "Odd".to_string(),
            initial: 5,
            overflow: 3,
        });
        let factory = AllocatorFactory::new(config).unwrap();
        assert_eq!(factory.config().pool_size_override("Odd"), Some((8, 4)));

        let pool = factory.create_pool("Odd", 32, 0, 0).unwrap();
        assert_eq!(pool.initial_count(), 8);
        assert_eq!(pool.overflow_count(), 4);
    }

    #[test]
    fn test_usage_totals_and_verify() {
        let factory = AllocatorFactory::new(debug_config()).unwrap();
        let pool = factory.create_pool("W3D_Verts", 64, 4, 4).unwrap();
        let physical = factory.usage().physical_bytes;
        assert!(physical > 0);

        let handle = pool.allocate_block("W3D_Verts", false).unwrap();
        assert_eq!(factory.usage().used_bytes, 64);
        assert_eq!(factory.category_usage()[1].used_bytes, 64);
        factory.memory_verify().unwrap();

        pool.free_block(handle).unwrap();
        assert_eq!(factory.usage().used_bytes, 0);
        assert_eq!(factory.usage().peak_used_bytes, 64);
        factory.memory_verify().unwrap();
    }

    #[test]
    fn test_verify_detects_counter_drift() {
        let factory = AllocatorFactory::new(debug_config()).unwrap();
        factory.create_pool("Drift", 16, 4, 4).unwrap();
        factory.adjust_totals("x", 16, 0);
        assert!(matches!(
            factory.memory_verify(),
            Err(MemoryError::BookkeepingMismatch { .. })
        ));
    }

    #[test]
    fn test_reset_rederives_totals_and_checkpoints() {
        let factory = AllocatorFactory::new(debug_config()).unwrap();
        let pool = factory.create_pool("Session", 32, 4, 4).unwrap();
        for _ in 0..6 {
            pool.allocate_block("t", false).unwrap();
        }
        factory.set_checkpoint();

        factory.reset().unwrap();
        assert_eq!(factory.current_checkpoint(), 0);
        assert_eq!(factory.usage().used_bytes, 0);
        assert_eq!(pool.count_slabs(), 1);
        factory.memory_verify().unwrap();
    }

    #[test]
    fn test_checkpoints_increase() {
        let factory = AllocatorFactory::new(debug_config()).unwrap();
        assert_eq!(factory.set_checkpoint(), 1);
        assert_eq!(factory.set_checkpoint(), 2);
        assert_eq!(factory.current_checkpoint(), 2);
    }

    #[test]
    fn test_factory_report_sections() {
        let factory = AllocatorFactory::new(debug_config()).unwrap();
        let pool = factory.create_pool("Report", 16, 4, 4).unwrap();
        let _leak = pool.allocate_block("leaky", false).unwrap();

        let mut lines = Vec::new();
        factory.memory_report(
            ReportFlags::FACTORYINFO | ReportFlags::POOLINFO | ReportFlags::SIMPLE_LEAKS,
            0,
            1,
            &mut |line: &str| lines.push(line.to_string()),
        );

        assert!(lines.iter().any(|l| l == "Bytes in use (logical) = 16"));
        assert!(lines.iter().any(|l| l.starts_with("POOLINFO,") && l.contains("Report")));
        assert!(lines.iter().any(|l| l.contains("tagstring leaky")));
        assert!(lines.iter().any(|l| l == "Total leaked blocks = 1"));
    }

    #[test]
    fn test_overflow_report() {
        let factory = AllocatorFactory::new(debug_config()).unwrap();
        let pool = factory.create_pool("Spill", 16, 4, 4).unwrap();
        let handles: Vec<_> = (0..5).map(|_| pool.allocate_block("t", false).unwrap()).collect();

        let mut lines = Vec::new();
        factory.memory_report(ReportFlags::POOL_OVERFLOW, 0, 0, &mut |line: &str| {
            lines.push(line.to_string());
        });
        assert!(lines.iter().any(|l| l.contains("Pool Spill overflowed")));

        for handle in handles {
            pool.free_block(handle).unwrap();
        }
    }

    #[test]
    fn test_leak_filter_hides_blocks() {
        let mut config = debug_config();
        config.leak_ignore_tags.push("FileSystem".to_string());
        let factory = AllocatorFactory::new(config).unwrap();
        let pool = factory.create_pool("Files", 16, 4, 4).unwrap();
        pool.allocate_block("LocalFileSystem", false).unwrap();
        pool.allocate_block("Texture", false).unwrap();

        assert_eq!(factory.simple_leak_report(&mut |_| {}), 1);
    }

    #[test]
    fn test_system_oom_on_first_slab() {
        let collaborators = Collaborators {
            system: Arc::new(BudgetSystemAllocator::new(64)),
            ..Collaborators::default()
        };
        let factory = AllocatorFactory::with_collaborators(debug_config(), collaborators).unwrap();
        let err = factory.create_pool("Huge", 1024, 16, 0).unwrap_err();
        assert!(err.is_out_of_memory());
        assert!(factory.find_pool("Huge").is_none());
    }

    #[test]
    fn test_usage_csv_rows() {
        let factory = AllocatorFactory::new(debug_config()).unwrap();
        factory.create_pool("Csv", 16, 4, 4).unwrap();

        let mut lines = Vec::new();
        factory.usage_report_csv(&mut |line: &str| lines.push(line.to_string()));
        assert!(lines[0].starts_with("Unpooled Large Blocks,0"));
        assert!(lines[0].ends_with(",,,Misc,0"));
        assert!(lines.iter().any(|l| l.starts_with("Csv,")));
    }

    #[test]
    fn test_teardown_counts_live_blocks() {
        let factory = AllocatorFactory::new(debug_config()).unwrap();
        let pool = factory.create_pool("Tear", 16, 4, 4).unwrap();
        pool.allocate_block("t", false).unwrap();
        pool.allocate_block("t", false).unwrap();
        assert_eq!(factory.teardown(), 2);
        assert_eq!(factory.teardown(), 0);
        assert_eq!(factory.system_outstanding_bytes(), 0);
    }
}
