//! # Stack Trace Service
//!
//! Opaque provider of allocation-site return addresses. Only consulted when
//! `DebugOptions::enable_stack_traces` is set.

/// Frames captured per allocation.
pub const STACK_TRACE_DEPTH: usize = 16;

/// Frames skipped at the top of every capture (the allocator itself).
pub const STACK_TRACE_SKIP: usize = 6;

/// Upper bound on frames any tracer may return.
pub const STACK_TRACE_MAX: usize = 20;

/// Captures and renders call stacks.
pub trait StackTracer: Send + Sync {
    /// Captures up to `max_count` return addresses after skipping `skip_count`.
    fn capture_addresses(&self, max_count: usize, skip_count: usize) -> Vec<usize>;

    /// Renders addresses, one line per frame.
    fn render_addresses(&self, addresses: &[usize], sink: &mut dyn FnMut(&str));
}

/// Tracer that captures nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStackTracer;

impl StackTracer for NullStackTracer {
    fn capture_addresses(&self, _max_count: usize, _skip_count: usize) -> Vec<usize> {
        Vec::new()
    }

    fn render_addresses(&self, addresses: &[usize], sink: &mut dyn FnMut(&str)) {
        for address in addresses {
            sink(&format!("  0x{address:016x}"));
        }
    }
}
