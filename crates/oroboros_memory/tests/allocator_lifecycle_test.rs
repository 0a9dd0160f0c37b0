//! Integration tests for pools, size classes, the factory and the manager.

use oroboros_memory::{
    AllocatorFactory, CorruptionKind, DebugOptions, LifecycleState, MemoryConfig, MemoryError,
    MemoryManager, OomReason, ReportFlags, SizeClassConfig, GLOBAL_NEW_TAG,
};
use std::sync::Arc;
use std::thread;

fn paranoid_factory() -> AllocatorFactory {
    AllocatorFactory::new(MemoryConfig {
        debug: DebugOptions::paranoid(),
        ..MemoryConfig::default()
    })
    .unwrap()
}

fn lines_of(f: impl FnOnce(&mut dyn FnMut(&str))) -> Vec<String> {
    let mut lines = Vec::new();
    f(&mut |line: &str| lines.push(line.to_string()));
    lines
}

#[test]
fn test_best_fit_routing() {
    let factory = paranoid_factory();
    let allocator = factory.create_size_class_allocator(&[]).unwrap();

    let small = allocator.allocate(50, "W3D_Mesh", false).unwrap();
    let exact = allocator.allocate(1024, "W3D_Mesh", false).unwrap();
    let big = allocator.allocate(1025, "W3D_Mesh", false).unwrap();

    assert_eq!(
        small.pool_id(),
        allocator.find_pool_for_size(50).map(|pool| pool.id())
    );
    assert_eq!(allocator.find_pool_for_size(50).unwrap().block_size(), 64);
    assert_eq!(allocator.find_pool_for_size(1024).unwrap().block_size(), 1024);
    assert!(!exact.is_raw());
    assert!(big.is_raw());
    assert_eq!(allocator.actual_allocation_size(1025), 1025);

    for handle in [small, exact, big] {
        allocator.free(handle).unwrap();
    }
    factory.memory_verify().unwrap();
    assert_eq!(factory.usage().used_bytes, 0);
}

#[test]
fn test_pool_growth_and_fixed_size_exhaustion() {
    let factory = paranoid_factory();

    let growable = factory.create_pool("growable", 32, 4, 4).unwrap();
    let handles: Vec<_> = (0..5)
        .map(|_| growable.allocate_block("W3A_Clip", false).unwrap())
        .collect();
    let stats = growable.stats();
    assert_eq!(stats.slab_count, 2);
    assert_eq!(stats.total_blocks, 8);
    assert_eq!(stats.used_blocks, 5);

    let fixed = factory.create_pool("fixed", 32, 4, 0).unwrap();
    let held: Vec<_> = (0..4)
        .map(|_| fixed.allocate_block("W3A_Clip", false).unwrap())
        .collect();
    let err = fixed.allocate_block("W3A_Clip", false).unwrap_err();
    assert!(matches!(
        err,
        MemoryError::OutOfMemory {
            reason: OomReason::PoolExhausted { .. }
        }
    ));
    assert!(err.is_out_of_memory());

    // The first block keeps the initial slab alive
    for handle in &handles[1..] {
        growable.free_block(*handle).unwrap();
    }
    for handle in held {
        fixed.free_block(handle).unwrap();
    }
    assert!(growable.release_empty_slabs() > 0);
    assert_eq!(growable.count_slabs(), 1);
    factory.memory_verify().unwrap();
    growable.free_block(handles[0]).unwrap();
}

#[test]
fn test_reset_is_idempotent() {
    let factory = paranoid_factory();
    let allocator = factory.create_size_class_allocator(&[]).unwrap();
    let pool = factory.create_pool("particles", 48, 8, 8).unwrap();

    for size in [8, 100, 700, 5000] {
        allocator.allocate(size, "W3D_Particle", true).unwrap();
    }
    for _ in 0..20 {
        pool.allocate_block("W3D_Particle", false).unwrap();
    }

    factory.reset().unwrap();
    let after_first = factory.usage();
    let pools_after_first = factory.pool_stats();

    factory.reset().unwrap();
    assert_eq!(factory.usage(), after_first);
    assert_eq!(factory.pool_stats(), pools_after_first);
    assert_eq!(after_first.used_bytes, 0);
    assert_eq!(pool.used_blocks(), 0);
    assert_eq!(pool.count_slabs(), 1);
    assert_eq!(allocator.debug_raw_block_bytes(), (0, 0));
    factory.memory_verify().unwrap();
}

#[test]
fn test_overrun_is_caught_on_free() {
    let factory = paranoid_factory();
    let pool = factory.create_pool("guarded", 24, 4, 4).unwrap();
    let handle = pool.allocate_block("W3D_Guarded", false).unwrap();

    {
        let mut bytes = pool.debug_guarded_bytes_mut(handle).unwrap();
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF;
    }

    let err = pool.verify().unwrap_err();
    assert!(matches!(
        err,
        MemoryError::CorruptBlock {
            kind: CorruptionKind::Overrun,
            ..
        }
    ));
    assert!(err.is_fatal());
    assert!(pool.free_block(handle).is_err());
}

#[test]
fn test_underrun_on_raw_block_is_caught() {
    let factory = paranoid_factory();
    let allocator = factory.create_size_class_allocator(&[]).unwrap();
    let handle = allocator.allocate(4096, "W3D_Texture", false).unwrap();

    allocator.debug_guarded_bytes_mut(handle).unwrap()[0] ^= 0xFF;

    let err = allocator.free(handle).unwrap_err();
    assert!(matches!(
        err,
        MemoryError::CorruptBlock {
            kind: CorruptionKind::Underrun,
            ..
        }
    ));
}

#[test]
fn test_leak_count_is_allocated_minus_freed() {
    let factory = paranoid_factory();
    let allocator = factory.create_size_class_allocator(&[]).unwrap();

    let handles: Vec<_> = (0..10)
        .map(|i| allocator.allocate(16 + i * 150, "W3D_Leaky", false).unwrap())
        .collect();
    for handle in handles.iter().take(6) {
        allocator.free(*handle).unwrap();
    }

    let mut reported = Vec::new();
    let leaked = factory.simple_leak_report(&mut |line: &str| reported.push(line.to_string()));
    assert_eq!(leaked, 4);
    assert!(reported.iter().any(|line| line.contains("W3D_Leaky")));
    assert_eq!(allocator.stats().outstanding_blocks, 4);
}

#[test]
fn test_ignored_block_is_not_a_leak() {
    let factory = paranoid_factory();
    let allocator = factory.create_size_class_allocator(&[]).unwrap();
    let kept = allocator.allocate(40, "W3D_Cache", false).unwrap();
    let _leaked = allocator.allocate(40, "W3D_Leaky", false).unwrap();

    allocator.debug_ignore_leaks_for_block(kept).unwrap();
    let lines = lines_of(|sink| {
        factory.simple_leak_report(sink);
    });
    assert!(lines.iter().any(|line| line.contains("W3D_Leaky")));
    assert!(!lines.iter().any(|line| line.contains("W3D_Cache")));
}

#[test]
fn test_two_threads_with_periodic_verify() {
    let factory = Arc::new(paranoid_factory());
    let pool = factory.create_pool("shared", 64, 16, 16).unwrap();

    let workers: Vec<_> = (0..2)
        .map(|t| {
            let pool = Arc::clone(&pool);
            let factory = Arc::clone(&factory);
            thread::spawn(move || {
                let mut live = Vec::new();
                for i in 0..500 {
                    live.push(pool.allocate_block("W3D_Worker", i % 2 == 0).unwrap());
                    if i % 3 == t {
                        let handle = live.swap_remove(0);
                        pool.free_block(handle).unwrap();
                    }
                    if i % 50 == 0 {
                        factory.memory_verify().unwrap();
                    }
                }
                for handle in live {
                    pool.free_block(handle).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.used_blocks, 0);
    assert_eq!(stats.free_blocks, stats.total_blocks);
    factory.memory_verify().unwrap();
}

#[test]
fn test_pool_accounting_invariant() {
    let factory = paranoid_factory();
    let pool = factory.create_pool("ledger", 100, 8, 4).unwrap();
    let mut live = Vec::new();

    for round in 0..40 {
        if round % 4 == 3 {
            if let Some(handle) = live.pop() {
                pool.free_block(handle).unwrap();
            }
        } else {
            live.push(pool.allocate_block("W3D_Round", false).unwrap());
        }
        let stats = pool.stats();
        assert_eq!(stats.used_blocks + stats.free_blocks, stats.total_blocks);
        assert_eq!(stats.used_blocks, live.len());
        assert!(stats.peak_blocks >= stats.used_blocks);
    }
    pool.verify().unwrap();
}

#[test]
fn test_bytes_round_trip_through_handles() {
    let factory = paranoid_factory();
    let allocator = factory.create_size_class_allocator(&[]).unwrap();

    let handles: Vec<_> = [10usize, 200, 3000]
        .iter()
        .map(|&size| {
            let handle = allocator.allocate(size, "STR_Text", true).unwrap();
            let mut bytes = allocator.user_bytes_mut(handle).unwrap();
            assert!(bytes.len() >= size);
            assert!(bytes.iter().all(|&b| b == 0));
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = (i % 251) as u8;
            }
            handle
        })
        .collect();

    for handle in &handles {
        let bytes = allocator.user_bytes_mut(*handle).unwrap();
        assert!(bytes.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    }
    factory.memory_verify().unwrap();
    for handle in handles {
        allocator.free(handle).unwrap();
    }
}

#[test]
fn test_checkpoint_leaks_and_transients() {
    let factory = paranoid_factory();
    let pool = factory.create_pool("frames", 32, 8, 8).unwrap();

    let long_lived = pool.allocate_block("W3D_LongLived", false).unwrap();
    let start = factory.set_checkpoint();
    let transient = pool.allocate_block("W3D_Transient", false).unwrap();
    let _leaked = pool.allocate_block("W3D_Leaked", false).unwrap();
    pool.free_block(transient).unwrap();
    let end = factory.set_checkpoint();

    let mut leaks = Vec::new();
    let leak_count =
        factory.checkpoint_report(ReportFlags::CP_LEAKS, start, end, &mut |line: &str| {
            leaks.push(line.to_string());
        });
    assert_eq!(leak_count, 1);
    assert!(leaks.iter().any(|line| line.contains("W3D_Leaked")));

    let transient_count = factory.checkpoint_report(
        ReportFlags::CP_TRANSIENT,
        start,
        end,
        &mut |_: &str| {},
    );
    assert_eq!(transient_count, 1);

    let longterm_count = factory.checkpoint_report(
        ReportFlags::CP_LONGTERM,
        start,
        end,
        &mut |_: &str| {},
    );
    assert_eq!(longterm_count, 1);

    pool.free_block(long_lived).unwrap();
}

#[test]
fn test_size_class_ladder_from_toml() {
    let config = MemoryConfig::from_toml_str(
        r#"
        filler_seed = 7
        usage_categories = ["W3D_"]

        [debug]
        enable_debug_checks = true
        enable_guard_regions = true

        [[size_classes]]
        name = "tiny"
        block_size = 12
        initial = 4
        overflow = 4

        [[size_classes]]
        name = "medium"
        block_size = 96
        initial = 4
        overflow = 0

        [[pool_sizes]]
        name = "Sound"
        initial = 5
        overflow = 1
        "#,
    )
    .unwrap();

    assert!(config.debug.enable_guard_regions);
    assert!(!config.debug.enable_checkpointing);
    assert_eq!(config.pool_size_override("Sound"), Some((8, 4)));

    let factory = AllocatorFactory::new(config.clone()).unwrap();
    let allocator = factory
        .create_size_class_allocator(&config.size_classes)
        .unwrap();
    assert_eq!(allocator.pools().len(), 2);
    assert_eq!(allocator.actual_allocation_size(10), 16);
    assert!(allocator.allocate(97, "W3D_Big", false).unwrap().is_raw());

    let sound = factory.create_pool("Sound", 40, 0, 0).unwrap();
    assert_eq!(sound.initial_count(), 8);
    assert_eq!(sound.overflow_count(), 4);
}

#[test]
fn test_bad_ladder_is_rejected() {
    let factory = paranoid_factory();
    let unordered = [
        SizeClassConfig::new("a", 64, 4, 4),
        SizeClassConfig::new("b", 32, 4, 4),
    ];
    assert!(matches!(
        factory.create_size_class_allocator(&unordered),
        Err(MemoryError::SizeClassOrder {
            previous: 64,
            next: 32
        })
    ));
}

#[test]
fn test_manager_session() {
    let manager = MemoryManager::new(MemoryConfig {
        debug: DebugOptions::paranoid(),
        ..MemoryConfig::default()
    });
    assert_eq!(manager.lifecycle(), LifecycleState::Uninitialized);
    manager.init().unwrap();
    assert_eq!(manager.lifecycle(), LifecycleState::Initialized);

    let small = manager.allocate(24, GLOBAL_NEW_TAG, true).unwrap();
    let large = manager.allocate(8192, GLOBAL_NEW_TAG, false).unwrap();
    manager
        .with_bytes_mut(small, |bytes| bytes.fill(0xAB))
        .unwrap();
    manager.free(small).unwrap();

    let summary = manager.shutdown().unwrap();
    assert_eq!(summary.leaked_blocks, 1);
    assert_eq!(manager.lifecycle(), LifecycleState::ShutDown);
    assert!(matches!(
        manager.free(large),
        Err(MemoryError::ShutDown)
    ));
}
