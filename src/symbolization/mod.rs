//! Symbolizers: from program counters to source-level locations.
//!
//! Each guest language ships its own mapping from the PCs recorded in
//! stack traces to function names, files and lines:
//!
//! - DWARF custom sections, for C, Rust and other ahead-of-time
//!   compiled guests ([`dwarf::DwarfSymbolizer`]);
//! - the Go `pclntab`/`moduledata` tables embedded in the data section
//!   ([`gosym::GoSymbols`]);
//! - CPython interpreter state, resolved at walk time and carried on
//!   the frames themselves ([`python`]).
//!
//! When no debug information is available the [`NullSymbolizer`] leaves
//! frames named after the runtime-provided function name.

pub mod dwarf;
pub mod gosym;
pub mod python;

use crate::listener::Frame;

/// A source location for one logical (possibly inlined) call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: i64,
    pub column: i64,
    /// True when this entry describes an inlined call rather than the
    /// outermost function at the PC.
    pub inlined: bool,
    /// Name for display.
    pub human_name: String,
    /// Linkage name when present, otherwise the same as `human_name`.
    /// This is the name most likely to match symbols in the wasm module
    /// and is used to deduplicate functions across the profile.
    pub stable_name: String,
}

/// Resolves the frames of recorded stack traces into source locations.
pub trait Symbolizer: Send + Sync {
    /// Locations for a frame, innermost call first (the pprof line
    /// order). An empty result means the frame could not be resolved;
    /// the profile builder then falls back to the runtime-provided
    /// function name.
    fn locations_for(&self, frame: &Frame) -> Vec<Location>;

    /// Short identifier used in logs and the inspection report.
    fn name(&self) -> &'static str;
}

/// Symbolizer used when a module carries no usable debug information.
pub struct NullSymbolizer;

impl Symbolizer for NullSymbolizer {
    fn locations_for(&self, _frame: &Frame) -> Vec<Location> {
        Vec::new()
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Symbolizer for frames whose source position was already resolved by
/// the stack walker (Python interpreter frames). It simply reads the
/// hint back.
pub struct HintSymbolizer;

impl Symbolizer for HintSymbolizer {
    fn locations_for(&self, frame: &Frame) -> Vec<Location> {
        let Some(hint) = &frame.source else { return Vec::new() };
        vec![Location {
            file: hint.file.to_string(),
            line: hint.line,
            column: 0,
            inlined: false,
            human_name: frame.function.name.to_string(),
            stable_name: frame.function.name.to_string(),
        }]
    }

    fn name(&self) -> &'static str {
        "interpreter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{FunctionIdent, SourceHint};
    use std::sync::Arc;

    #[test]
    fn null_symbolizer_resolves_nothing() {
        let frame = Frame::new(FunctionIdent::guest("m", "f", 0), 42);
        assert!(NullSymbolizer.locations_for(&frame).is_empty());
    }

    #[test]
    fn hint_symbolizer_reads_the_walker_resolution() {
        let mut frame = Frame::new(FunctionIdent::guest("m", "script.a", 0), 1);
        frame.source = Some(SourceHint {
            file: Arc::from("/app/script.py"),
            line: 3,
            address: 0x88,
        });
        let locs = HintSymbolizer.locations_for(&frame);
        assert_eq!(locs.len(), 1);
        assert_eq!(locs[0].file, "/app/script.py");
        assert_eq!(locs[0].line, 3);
        assert_eq!(locs[0].human_name, "script.a");
    }
}
