//! # wasmscope - CPU and memory profiling for WebAssembly guests
//!
//! wasmscope observes a Wasm module as the embedding runtime executes
//! it and produces profiles in the standard `pprof` format. It targets
//! modules compiled from C, Rust, TinyGo, Go (wasip1) and CPython 3.11,
//! reconstructing source-level stacks even for runtimes whose wasm call
//! stack says little about the program (Go goroutine stacks, Python
//! interpreter frames).
//!
//! ## Architecture Overview
//!
//! ```text
//! guest call ──▶ runtime listener hooks (before/after/abort)
//!                       │
//!                       ▼
//!               ┌──────────────┐   skip most calls
//!               │   Sampler    │──────────────────▶ (nothing)
//!               └──────┬───────┘
//!                      ▼
//!               ┌──────────────┐   ┌─────────────────────────┐
//!               │  Profilers   │──▶│ Stack walker             │
//!               │ (cpu/memory) │   │  wasm stack (as-is)      │
//!               └──────┬───────┘   │  Go runtime unwinder     │
//!                      │           │  Python frame list       │
//!                      │           └─────────────────────────┘
//!                      ▼
//!               per-stack counters (hash-keyed)
//!                      │ snapshot
//!                      ▼
//!               ┌──────────────┐   ┌─────────────────────────┐
//!               │   Profile    │──▶│ Symbolizers              │
//!               │   builder    │   │  DWARF / pclntab / null  │
//!               └──────┬───────┘   └─────────────────────────┘
//!                      ▼
//!               gzip'd pprof protobuf
//! ```
//!
//! ## Module Structure
//!
//! - [`wasm`]: the slice of the binary format the profiler reads
//!   (custom sections, data segments with virtual addresses, imports).
//! - [`guest`]: typed, bounds-checked access to guest linear memory.
//! - [`listener`]: the instrumentation contract consumed from the
//!   embedding runtime, plus combinators (`multi`, `flagged`).
//! - [`sampling`]: deterministic cyclic sampling of listeners.
//! - [`profiling`]: stack traces, counters, the CPU and memory
//!   profilers.
//! - [`symbolization`]: DWARF, Go pclntab and Python symbolizers.
//! - [`unwind`]: language-specific stack walkers over guest memory.
//! - [`export`]: pprof construction and serialization.
//! - [`http`]: handler bodies for `/debug/pprof/` endpoints.
//! - [`prepare`]: language detection and wiring.
//!
//! ## Typical Embedding
//!
//! ```ignore
//! let profiling = wasmscope::Profiling::prepare(&wasm_bytes, "app.wasm")?;
//! let cpu = profiling.cpu_profiler();
//! let mem = profiling.memory_profiler();
//!
//! // Hand the factories to the runtime's instrumentation hooks.
//! let factory = wasmscope::listener::multi(vec![
//!     wasmscope::sampling::sample(rate, profiling.cpu_listeners(&cpu)),
//!     wasmscope::sampling::sample(rate, profiling.memory_listeners(&mem)),
//! ]);
//!
//! cpu.start()?;
//! // ... run the module ...
//! let profile = cpu.stop(rate, profiling.symbolizer().as_ref());
//! ```
//!
//! The embedding runtime itself is out of scope: wasmscope only
//! consumes the narrow contracts in [`listener`] and [`guest`].

pub mod cli;
pub mod domain;
pub mod export;
pub mod guest;
pub mod http;
pub mod listener;
pub mod prepare;
pub mod profiling;
pub mod sampling;
pub mod symbolization;
pub mod unwind;
pub mod wasm;

pub use domain::{BinaryError, GuestLanguage, ProfileError};
pub use export::{encode_profile, write_profile};
pub use prepare::{ModuleReport, Profiling};
pub use profiling::{CpuProfiler, MemoryProfiler};
pub use sampling::sample;

/// Default sampling rate: roughly one call in nineteen. Chosen so the
/// sampling cycle does not resonate with common call patterns.
pub const DEFAULT_SAMPLE_RATE: f64 = 1.0 / 19.0;
