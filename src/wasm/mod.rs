//! Introspection of the raw Wasm binary.
//!
//! The embedding runtime compiles and executes the module; this crate
//! only needs a narrow slice of the binary format: custom sections (for
//! DWARF and language detection), the number of imported functions (for
//! the Go PC mapping) and the data section's active segments with their
//! virtual addresses (for pclntab and interpreter-state discovery).
//! Parsing is delegated to `wasmparser`; this module restricts its
//! output to the shapes the profiler supports.

mod data;
mod sections;

pub use data::{DataSection, SegmentCursor, Vmem};
pub use sections::{DataSegment, ModuleInfo};
