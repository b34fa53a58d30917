//! Profilers and their shared accounting machinery.
//!
//! Stack traces are captured on function entry, canonicalized into
//! hash-keyed [`StackTrace`] values, and aggregated into per-stack
//! counters. The CPU profiler accounts self-time across nested calls;
//! the memory profiler hooks the guest's allocator functions.

pub mod cpu;
pub mod memory;
mod trace;

pub use cpu::{CpuProfiler, NowFn};
pub use memory::MemoryProfiler;
pub use trace::{StackCounter, StackCounterMap, StackTrace};
