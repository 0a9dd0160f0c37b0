//! # Memory Manager
//!
//! The process context: one factory plus the default size-class allocator,
//! with an explicit lifecycle.
//!
//! ```text
//! Uninitialized ──init()──────────────────────▶ Initialized ──shutdown()──▶ ShutDown
//!       │                                            ▲
//!       └──first allocate()──▶ PreMain ──init()──────┘
//! ```
//!
//! Allocations made in `PreMain` are flagged to be left out of leak
//! reports. After a pre-main start, shutdown leaves the heap in place
//! because late frees may still arrive.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::BlockHandle;
use crate::config::MemoryConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::factory::{AllocatorFactory, Collaborators};
use crate::pool::Pool;
use crate::size_class::SizeClassAllocator;

/// Tag used by container allocator adapters.
pub const STL_TAG: &str = "STL_";

/// Tag used by the global allocation operator.
pub const GLOBAL_NEW_TAG: &str = "global operator new";

/// Lifecycle of the process context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing created yet.
    Uninitialized,
    /// Created lazily by an allocation that preceded `init`.
    PreMain,
    /// Ready.
    Initialized,
    /// Torn down. No further allocation is possible.
    ShutDown,
}

/// What a session left behind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Live blocks not flagged to ignore.
    pub leaked_blocks: usize,
    /// Highest byte count obtained from the system allocator.
    pub peak_system_bytes: usize,
    /// Highest size-class waste.
    pub peak_wasted_bytes: usize,
    /// Bytes still held from the system after shutdown.
    pub outstanding_system_bytes: usize,
}

#[derive(Clone)]
struct Context {
    factory: Arc<AllocatorFactory>,
    allocator: Arc<SizeClassAllocator>,
}

struct ManagerState {
    lifecycle: LifecycleState,
    context: Option<Context>,
    /// After a pre-main start the context outlives shutdown.
    started_pre_main: bool,
}

/// Process-wide memory context with an explicit lifecycle.
pub struct MemoryManager {
    config: MemoryConfig,
    collaborators: Collaborators,
    state: RwLock<ManagerState>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    /// Creates an uninitialized manager backed by the global heap.
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        Self::with_collaborators(config, Collaborators::default())
    }

    /// Creates an uninitialized manager with explicit collaborators.
    #[must_use]
    pub fn with_collaborators(config: MemoryConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            state: RwLock::new(ManagerState {
                lifecycle: LifecycleState::Uninitialized,
                context: None,
                started_pre_main: false,
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> LifecycleState {
        self.state.read().lifecycle
    }

    fn build_context(&self) -> MemoryResult<Context> {
        let factory = Arc::new(AllocatorFactory::with_collaborators(
            self.config.clone(),
            self.collaborators.clone(),
        )?);
        let allocator = factory.create_size_class_allocator(&self.config.size_classes)?;
        Ok(Context { factory, allocator })
    }

    /// Creates the factory and default allocator.
    ///
    /// Idempotent after a pre-main start.
    ///
    /// # Errors
    ///
    /// `AlreadyInitialized`, `ShutDown`, or any error creating the default
    /// allocator's pools.
    pub fn init(&self) -> MemoryResult<()> {
        let mut state = self.state.write();
        match state.lifecycle {
            LifecycleState::Uninitialized => {
                state.context = Some(self.build_context()?);
                state.lifecycle = LifecycleState::Initialized;
                tracing::info!("Memory manager initialized");
                Ok(())
            }
            LifecycleState::PreMain => {
                if let Some(context) = &state.context {
                    context.factory.set_ignore_leaks_on_allocate(false);
                }
                state.lifecycle = LifecycleState::Initialized;
                tracing::info!("Memory manager initialized after pre-main allocations");
                Ok(())
            }
            LifecycleState::Initialized => Err(MemoryError::AlreadyInitialized),
            LifecycleState::ShutDown => Err(MemoryError::ShutDown),
        }
    }

    /// Context for allocation, entering `PreMain` if nothing exists yet.
    fn context_for_allocation(&self) -> MemoryResult<Context> {
        {
            let state = self.state.read();
            match state.lifecycle {
                LifecycleState::Uninitialized => {}
                LifecycleState::ShutDown => return Err(MemoryError::ShutDown),
                LifecycleState::PreMain | LifecycleState::Initialized => {
                    return state.context.clone().ok_or(MemoryError::NotInitialized);
                }
            }
        }

        let mut state = self.state.write();
        if state.lifecycle == LifecycleState::Uninitialized {
            let context = self.build_context()?;
            context.factory.set_ignore_leaks_on_allocate(true);
            state.context = Some(context);
            state.lifecycle = LifecycleState::PreMain;
            state.started_pre_main = true;
            tracing::warn!("Allocation before memory manager init; entering pre-main state");
        }
        match state.lifecycle {
            LifecycleState::ShutDown => Err(MemoryError::ShutDown),
            _ => state.context.clone().ok_or(MemoryError::NotInitialized),
        }
    }

    /// Context for anything other than allocation.
    fn live_context(&self) -> MemoryResult<Context> {
        let state = self.state.read();
        match state.lifecycle {
            LifecycleState::Uninitialized => Err(MemoryError::NotInitialized),
            LifecycleState::ShutDown => Err(MemoryError::ShutDown),
            LifecycleState::PreMain | LifecycleState::Initialized => {
                state.context.clone().ok_or(MemoryError::NotInitialized)
            }
        }
    }

    /// Logs integrity faults and halts on them when configured to.
    fn escalate<T>(&self, result: MemoryResult<T>) -> MemoryResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                tracing::error!("Memory integrity fault: {}", err);
                if self.config.debug.halt_on_integrity_fault {
                    panic!("memory integrity fault: {err}");
                }
            }
        }
        result
    }

    /// Allocates `size` bytes from the default allocator.
    ///
    /// # Errors
    ///
    /// `OutOfMemory`, `ShutDown`, or an integrity fault.
    pub fn allocate(&self, size: usize, tag: &'static str, zero: bool) -> MemoryResult<BlockHandle> {
        let context = self.context_for_allocation()?;
        self.escalate(context.allocator.allocate(size, tag, zero))
    }

    /// Frees a block obtained from [`MemoryManager::allocate`].
    ///
    /// # Errors
    ///
    /// `NotInitialized`, `ShutDown`, or an integrity fault.
    pub fn free(&self, handle: BlockHandle) -> MemoryResult<()> {
        let context = self.live_context()?;
        self.escalate(context.allocator.free(handle))
    }

    /// Bytes a request for `size` would actually receive.
    ///
    /// # Errors
    ///
    /// `NotInitialized` or `ShutDown`.
    pub fn actual_allocation_size(&self, size: usize) -> MemoryResult<usize> {
        Ok(self.live_context()?.allocator.actual_allocation_size(size))
    }

    /// Runs `f` over a live block's user data.
    ///
    /// The block's owner stays locked while `f` runs. The lock is not
    /// re-entrant: `f` must not allocate, free or verify through this
    /// manager, its allocator or the owning pool, or the call deadlocks.
    ///
    /// # Errors
    ///
    /// `NotInitialized`, `ShutDown`, or `CorruptBlock` for a bad handle.
    pub fn with_bytes_mut<R>(&self, handle: BlockHandle, f: impl FnOnce(&mut [u8]) -> R) -> MemoryResult<R> {
        let context = self.live_context()?;
        let mut bytes = self.escalate(context.allocator.user_bytes_mut(handle))?;
        Ok(f(&mut bytes))
    }

    /// Creates (or finds) a named pool sized from the pool-size table.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the table has no entry for `name`, or any pool
    /// creation error.
    pub fn create_named_pool(&self, name: &str, block_size: usize) -> MemoryResult<Arc<Pool>> {
        self.live_context()?.factory.create_pool(name, block_size, 0, 0)
    }

    /// The factory.
    ///
    /// # Errors
    ///
    /// `NotInitialized` or `ShutDown`.
    pub fn factory(&self) -> MemoryResult<Arc<AllocatorFactory>> {
        Ok(self.live_context()?.factory)
    }

    /// The default size-class allocator.
    ///
    /// # Errors
    ///
    /// `NotInitialized` or `ShutDown`.
    pub fn allocator(&self) -> MemoryResult<Arc<SizeClassAllocator>> {
        Ok(self.live_context()?.allocator)
    }

    /// Reports leaks, tears everything down, and summarizes the session.
    ///
    /// # Errors
    ///
    /// `NotInitialized` or `ShutDown`.
    pub fn shutdown(&self) -> MemoryResult<ShutdownSummary> {
        let mut state = self.state.write();
        match state.lifecycle {
            LifecycleState::Uninitialized => return Err(MemoryError::NotInitialized),
            LifecycleState::ShutDown => return Err(MemoryError::ShutDown),
            LifecycleState::PreMain | LifecycleState::Initialized => {}
        }
        let context = state.context.take().ok_or(MemoryError::NotInitialized)?;
        state.lifecycle = LifecycleState::ShutDown;

        let leaked_blocks = context.factory.simple_leak_report(&mut |_| {});
        let mut summary = ShutdownSummary {
            leaked_blocks,
            peak_system_bytes: context.factory.system_peak_bytes(),
            peak_wasted_bytes: context.allocator.stats().peak_wasted_bytes,
            outstanding_system_bytes: 0,
        };

        if state.started_pre_main {
            tracing::info!("Skipping memory teardown after pre-main initialization");
            summary.outstanding_system_bytes = context.factory.system_outstanding_bytes();
            state.context = Some(context);
        } else {
            context.factory.teardown();
            summary.outstanding_system_bytes = context.factory.system_outstanding_bytes();
        }

        tracing::info!(
            "Memory manager shut down: {} leaked blocks, peak system allocation {} bytes, peak size-class waste {} bytes",
            summary.leaked_blocks,
            summary.peak_system_bytes,
            summary.peak_wasted_bytes
        );
        Ok(summary)
    }
}
