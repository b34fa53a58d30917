//! Structured error types.
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Preparation failures are fatal and propagate to the embedder so it can
//! refuse to run the module; profiling-time failures are either soft
//! (start-while-running) or scoped to a single stack walk.

use thiserror::Error;

/// Errors raised while introspecting the raw Wasm binary.
#[derive(Error, Debug)]
pub enum BinaryError {
    #[error("module is missing a data section")]
    MissingDataSection,

    #[error("unsupported data segment mode (only active segments for memory 0 are supported)")]
    UnsupportedDataSegment,

    #[error("malformed data segment offset expression")]
    MalformedOffsetExpression,

    #[error("data offset {requested:#x} requested but iterator is already at {position:#x}")]
    NonMonotonicDataOffset { requested: u64, position: u64 },

    #[error("virtual address {addr:#x} already mapped (memory ends at {end:#x})")]
    OverlappingSegment { addr: u64, end: u64 },

    #[error("data section exhausted while rebuilding memory up to {addr:#x}")]
    SegmentExhausted { addr: u64 },

    #[error("pclntab header not found in data section")]
    PclntabNotFound,

    #[error("unsupported pclntab layout: {0}")]
    UnsupportedPclntab(String),

    #[error("firstmoduledata not found in data section")]
    ModuledataNotFound,

    #[error("python runtime state not found in debug info")]
    PythonRuntimeNotFound,

    #[error(transparent)]
    Parse(#[from] wasmparser::BinaryReaderError),

    #[error(transparent)]
    Dwarf(#[from] gimli::Error),

    #[error(transparent)]
    Memory(#[from] MemoryAccessError),
}

/// Out-of-range read of the guest linear memory. Fatal to the stack walk
/// that issued it; the partial trace is discarded and execution continues.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid guest memory read at {address:#x} size {size}")]
pub struct MemoryAccessError {
    pub address: u64,
    pub size: u32,
}

/// Errors surfaced by profiler lifecycle operations and profile
/// serialization.
#[derive(Error, Debug)]
pub enum ProfileError {
    /// Soft failure: `start` was called while a profile was already being
    /// recorded. No side effects.
    #[error("profiler already running")]
    AlreadyRunning,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
