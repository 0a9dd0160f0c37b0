//! # Memory Configuration
//!
//! Loaded once at startup from TOML.
//!
//! ```toml
//! filler_seed = 7
//! leak_ignore_tags = ["Win32LocalFileSystem.cpp"]
//!
//! [debug]
//! enable_guard_regions = true
//! enable_checkpointing = true
//!
//! [[size_classes]]
//! name = "dmaPool_16"
//! block_size = 16
//! initial = 1024
//! overflow = 256
//!
//! [[pool_sizes]]
//! name = "ParticlePool"
//! initial = 4096
//! overflow = 256
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::block::round_up_to_alignment;
use crate::error::{MemoryError, MemoryResult};

/// Maximum number of size classes one allocator may own.
pub const MAX_SIZE_CLASSES: usize = 8;

/// Runtime switches for the debug instrumentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugOptions {
    /// Cookie/tag checks, garbage fill on free, filler fill on allocate.
    pub enable_debug_checks: bool,
    /// Guard walls around every block's user data.
    pub enable_guard_regions: bool,
    /// Capture an allocation-site stack trace per block.
    ///
    /// The default tracer is `NullStackTracer`, which records empty
    /// stacks. Supply a real `StackTracer` through `Collaborators::tracer`
    /// to get frames.
    pub enable_stack_traces: bool,
    /// Record allocation/free checkpoints in the ledger.
    pub enable_checkpointing: bool,
    /// Verify the whole pool on every allocate and free.
    pub enable_intense_verify: bool,
    /// Panic when the process context sees an integrity fault.
    pub halt_on_integrity_fault: bool,
}

impl Default for DebugOptions {
    fn default() -> Self {
        let debug = cfg!(debug_assertions);
        Self {
            enable_debug_checks: debug,
            enable_guard_regions: debug,
            enable_stack_traces: false,
            enable_checkpointing: false,
            enable_intense_verify: false,
            halt_on_integrity_fault: debug,
        }
    }
}

impl DebugOptions {
    /// Everything off. Only `OutOfMemory` can be produced.
    #[must_use]
    pub const fn production() -> Self {
        Self {
            enable_debug_checks: false,
            enable_guard_regions: false,
            enable_stack_traces: false,
            enable_checkpointing: false,
            enable_intense_verify: false,
            halt_on_integrity_fault: false,
        }
    }

    /// Every check on, including the ledger, without halting on faults.
    #[must_use]
    pub const fn paranoid() -> Self {
        Self {
            enable_debug_checks: true,
            enable_guard_regions: true,
            enable_stack_traces: true,
            enable_checkpointing: true,
            enable_intense_verify: true,
            halt_on_integrity_fault: false,
        }
    }
}

/// One size class of a size-class allocator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeClassConfig {
    /// Pool name.
    pub name: String,
    /// Block size in bytes (rounded up to the alignment).
    pub block_size: usize,
    /// Blocks in the first slab.
    pub initial: u32,
    /// Blocks per growth slab. Zero forbids growth.
    pub overflow: u32,
}

impl SizeClassConfig {
    /// Creates a size class.
    #[must_use]
    pub fn new(name: impl Into<String>, block_size: usize, initial: u32, overflow: u32) -> Self {
        Self {
            name: name.into(),
            block_size,
            initial,
            overflow,
        }
    }

    /// The conservative built-in ladder: 16 through 1024 bytes, 64 blocks each.
    #[must_use]
    pub fn default_ladder() -> Vec<Self> {
        [16, 32, 64, 128, 256, 512, 1024]
            .into_iter()
            .map(|size| Self::new(format!("dmaPool_{size}"), size, 64, 64))
            .collect()
    }

    /// Ladder sized for a full game session.
    #[must_use]
    pub fn production_ladder() -> Vec<Self> {
        [
            (16, 65_536),
            (32, 150_000),
            (64, 60_000),
            (128, 32_768),
            (256, 8_192),
            (512, 8_192),
            (1024, 24_000),
        ]
        .into_iter()
        .map(|(size, initial)| Self::new(format!("dmaPool_{size}"), size, initial, 1024))
        .collect()
    }
}

/// Replacement block counts for a named pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizeOverride {
    /// Pool name.
    pub name: String,
    /// Blocks in the first slab.
    pub initial: u32,
    /// Blocks per growth slab.
    pub overflow: u32,
}

/// Top-level memory configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Debug instrumentation switches.
    pub debug: DebugOptions,
    /// Size classes of the process-wide allocator.
    pub size_classes: Vec<SizeClassConfig>,
    /// Counts for pools requested with an initial count of zero.
    pub pool_sizes: Vec<PoolSizeOverride>,
    /// Tag substrings whose blocks are left out of leak reports.
    pub leak_ignore_tags: Vec<String>,
    /// Tag prefixes that get their own usage bucket.
    pub usage_categories: Vec<String>,
    /// Seed for filler pattern selection.
    pub filler_seed: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            debug: DebugOptions::default(),
            size_classes: SizeClassConfig::default_ladder(),
            pool_sizes: Vec::new(),
            leak_ignore_tags: Vec::new(),
            usage_categories: default_categories(),
            filler_seed: 0x0B0E_0B0E,
        }
    }
}

fn default_categories() -> Vec<String> {
    ["W3D_", "W3A_", "STL_", "STR_"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl MemoryConfig {
    /// Production config: full-session ladder, instrumentation off.
    #[must_use]
    pub fn production() -> Self {
        Self {
            debug: DebugOptions::production(),
            size_classes: SizeClassConfig::production_ladder(),
            ..Self::default()
        }
    }

    /// Parses a config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on malformed TOML or an invalid ladder.
    pub fn from_toml_str(text: &str) -> MemoryResult<Self> {
        let mut config: Self =
            toml::from_str(text).map_err(|e| MemoryError::InvalidConfig(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            MemoryError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(
            "Loaded memory config from {} ({} size classes, {} pool overrides)",
            path.display(),
            config.size_classes.len(),
            config.pool_sizes.len()
        );
        Ok(config)
    }

    /// Checks the size-class ladder.
    ///
    /// # Errors
    ///
    /// Returns `TooManySizeClasses` or `SizeClassOrder`.
    pub fn validate(&self) -> MemoryResult<()> {
        validate_ladder(&self.size_classes)
    }

    /// Looks up replacement counts for a named pool.
    #[must_use]
    pub fn pool_size_override(&self, name: &str) -> Option<(u32, u32)> {
        self.pool_sizes
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| (entry.initial, entry.overflow))
    }

    /// Rounds pool-size table counts up to a multiple of four.
    pub(crate) fn normalize(&mut self) {
        for entry in &mut self.pool_sizes {
            entry.initial = round_count(entry.initial);
            entry.overflow = round_count(entry.overflow);
        }
    }
}

/// Rounds a block count up to a multiple of four.
#[inline]
#[must_use]
pub const fn round_count(count: u32) -> u32 {
    count.saturating_add(3) & !3
}

/// Checks that a ladder is short enough and strictly increasing.
///
/// # Errors
///
/// Returns `TooManySizeClasses` or `SizeClassOrder`.
pub fn validate_ladder(classes: &[SizeClassConfig]) -> MemoryResult<()> {
    if classes.len() > MAX_SIZE_CLASSES {
        return Err(MemoryError::TooManySizeClasses {
            count: classes.len(),
            max: MAX_SIZE_CLASSES,
        });
    }
    // Pools round their block size, so compare what they will actually hold
    for pair in classes.windows(2) {
        let previous = round_up_to_alignment(pair[0].block_size);
        let next = round_up_to_alignment(pair[1].block_size);
        if next <= previous {
            return Err(MemoryError::SizeClassOrder { previous, next });
        }
    }
    Ok(())
}
