//! Language detection and profiler wiring.
//!
//! [`Profiling::prepare`] inspects a module once, before it runs:
//! detects the guest language, builds the matching symbolizer and
//! stack source, and fixes the set of functions whose instrumentation
//! must be suppressed because their calling convention breaks the
//! stack-walk invariants. Profilers constructed from the result are
//! wired consistently with each other.

use std::collections::HashSet;
use std::sync::Arc;

use log::{info, warn};

use crate::domain::{BinaryError, GuestLanguage};
use crate::listener::{FunctionIdent, FunctionListener, ListenerFactory};
use crate::profiling::{CpuProfiler, MemoryProfiler};
use crate::symbolization::dwarf::{has_debug_info, DwarfSymbolizer};
use crate::symbolization::gosym::GoSymbols;
use crate::symbolization::python::{find_py_globals, python_version_supported, PyRuntime};
use crate::symbolization::{HintSymbolizer, NullSymbolizer, Symbolizer};
use crate::unwind::StackSource;
use crate::wasm::{DataSection, ModuleInfo};

/// Custom section the Go toolchain stamps into every binary.
const GO_BUILD_ID_SECTION: &str = "go:buildid";

/// Go runtime functions whose calling convention or stack usage breaks
/// the unwinder; they are never instrumented.
const GO_EXCLUDED_FUNCTIONS: [&str; 18] = [
    "_rt0_wasm_js",
    "_rt0_wasm_wasip1",
    "wasm_export_run",
    "wasm_export_resume",
    "wasm_export_getsp",
    "wasm_pc_f_loop",
    "gcWriteBarrier",
    "runtime.gcWriteBarrier1",
    "runtime.gcWriteBarrier2",
    "runtime.gcWriteBarrier3",
    "runtime.gcWriteBarrier4",
    "runtime.gcWriteBarrier5",
    "runtime.gcWriteBarrier6",
    "runtime.gcWriteBarrier7",
    "runtime.gcWriteBarrier8",
    "runtime.wasmDiv",
    "runtime.wasmTruncS",
    "runtime.wasmTruncU",
];

// gcWriteBarrier variants run out at 8 in the runtime; the bare names
// below are assembly helpers shared by the wasm port.
const GO_EXCLUDED_ASM: [&str; 4] = ["cmpbody", "memeqbody", "memcmp", "memchr"];

/// Interpreter call boundary: the only function worth instrumenting on
/// a Python guest. Blanket instrumentation of the interpreter's helper
/// functions would be all overhead and no signal.
const PYTHON_INSTRUMENTED_FUNCTIONS: [&str; 1] = ["PyObject_Vectorcall"];

/// Which functions receive call listeners.
#[derive(Clone, Debug)]
pub enum FunctionFilter {
    /// Instrument everything.
    All,
    /// Instrument everything except the listed names.
    Exclude(HashSet<&'static str>),
    /// Instrument only the listed names.
    Only(HashSet<&'static str>),
}

impl FunctionFilter {
    pub fn allows(&self, name: &str) -> bool {
        match self {
            FunctionFilter::All => true,
            FunctionFilter::Exclude(names) => !names.contains(name),
            FunctionFilter::Only(names) => names.contains(name),
        }
    }
}

/// Profiling support for one prepared module.
pub struct Profiling {
    language: GuestLanguage,
    symbols: Arc<dyn Symbolizer>,
    source: Arc<StackSource>,
    filter: FunctionFilter,
    module_name: Arc<str>,
    report: ModuleReport,
}

/// What preparation found in the module; surfaced by the inspection
/// tool and useful for embedder logs.
#[derive(Clone, Debug)]
pub struct ModuleReport {
    pub language: GuestLanguage,
    pub symbolizer: &'static str,
    pub custom_sections: Vec<(String, usize)>,
    pub data_segments: usize,
    pub imported_functions: u32,
    /// Allocator functions exported by the module that the memory
    /// profiler would hook.
    pub allocator_exports: Vec<String>,
}

impl Profiling {
    /// Inspect the module bytes and assemble language support.
    ///
    /// `module_name` ends up as the mapping file name in emitted
    /// profiles; passing the wasm file name is conventional.
    pub fn prepare(wasm: &[u8], module_name: &str) -> Result<Profiling, BinaryError> {
        let info = ModuleInfo::parse(wasm)?;

        let (language, symbols, source, filter) = if info.has_custom_section(GO_BUILD_ID_SECTION) {
            // A Go module without a readable pclntab cannot be
            // profiled; fail preparation rather than emit garbage.
            let data = DataSection::new(&info)?;
            let symbols = Arc::new(GoSymbols::parse(&data, info.imported_functions())?);
            info!("prepare: Go module, pclntab loaded");
            (
                GuestLanguage::Go,
                Arc::clone(&symbols) as Arc<dyn Symbolizer>,
                Arc::new(StackSource::Go(symbols)),
                FunctionFilter::Exclude(go_excluded_names()),
            )
        } else if let Some(py) = detect_python(&info) {
            info!("prepare: CPython 3.11 module, _PyRuntime at {:#x}", py.runtime.addr());
            (
                GuestLanguage::Python,
                Arc::new(HintSymbolizer) as Arc<dyn Symbolizer>,
                Arc::new(StackSource::Python(Arc::new(PyRuntime::new(py.runtime)))),
                FunctionFilter::Only(PYTHON_INSTRUMENTED_FUNCTIONS.iter().copied().collect()),
            )
        } else {
            let symbols: Arc<dyn Symbolizer> = if has_debug_info(&info) {
                match DwarfSymbolizer::parse(&info) {
                    Ok(dwarf) => Arc::new(dwarf),
                    Err(err) => {
                        warn!("prepare: unusable DWARF data, frames keep runtime names: {err}");
                        Arc::new(NullSymbolizer)
                    }
                }
            } else {
                warn!("prepare: module has no DWARF sections, frames keep runtime names");
                Arc::new(NullSymbolizer)
            };
            (GuestLanguage::Wasm, symbols, Arc::new(StackSource::Wasm), FunctionFilter::All)
        };

        let report = ModuleReport {
            language,
            symbolizer: symbols.name(),
            custom_sections: info
                .custom_section_names()
                .map(|n| (n.to_string(), info.custom_section(n).map_or(0, <[u8]>::len)))
                .collect(),
            data_segments: info.data_segments().len(),
            imported_functions: info.imported_functions(),
            allocator_exports: info
                .function_exports()
                .iter()
                .filter(|(name, _)| {
                    crate::profiling::memory::ALLOCATOR_FUNCTIONS
                        .iter()
                        .any(|(hook, _)| hook == name)
                })
                .map(|(name, _)| name.to_string())
                .collect(),
        };

        Ok(Profiling {
            language,
            symbols,
            source,
            filter,
            module_name: Arc::from(module_name),
            report,
        })
    }

    pub fn language(&self) -> GuestLanguage {
        self.language
    }

    pub fn symbolizer(&self) -> Arc<dyn Symbolizer> {
        self.symbols.clone()
    }

    pub fn function_filter(&self) -> &FunctionFilter {
        &self.filter
    }

    pub fn report(&self) -> &ModuleReport {
        &self.report
    }

    /// A CPU profiler wired to this module's stack source.
    pub fn cpu_profiler(&self) -> CpuProfiler {
        CpuProfiler::new(self.source.clone(), self.module_name.clone())
    }

    /// A memory profiler wired to this module's stack source.
    pub fn memory_profiler(&self) -> MemoryProfiler {
        MemoryProfiler::new(self.source.clone(), self.module_name.clone())
    }

    /// Listener factory for blanket (CPU-style) instrumentation, with
    /// the language's function filter applied.
    pub fn cpu_listeners(&self, profiler: &CpuProfiler) -> Arc<dyn ListenerFactory> {
        Arc::new(FilteredFactory {
            filter: self.filter.clone(),
            inner: Arc::new(profiler.clone()),
        })
    }

    /// Listener factory for the allocator hooks. The memory profiler
    /// selects functions by name itself, and its hooks must stay active
    /// even for languages with an opt-in filter (the interpreter's
    /// allocator calls are exactly the signal wanted).
    pub fn memory_listeners(&self, profiler: &MemoryProfiler) -> Arc<dyn ListenerFactory> {
        Arc::new(profiler.clone())
    }
}

struct PyDetection {
    runtime: crate::domain::Ptr32,
}

fn detect_python(info: &ModuleInfo<'_>) -> Option<PyDetection> {
    let globals = find_py_globals(info)?;
    let data = DataSection::new(info).ok()?;
    python_version_supported(&data, globals.version).then_some(PyDetection {
        runtime: globals.runtime,
    })
}

fn go_excluded_names() -> HashSet<&'static str> {
    GO_EXCLUDED_FUNCTIONS
        .iter()
        .chain(GO_EXCLUDED_ASM.iter())
        .copied()
        .collect()
}

struct FilteredFactory {
    filter: FunctionFilter,
    inner: Arc<dyn ListenerFactory>,
}

impl ListenerFactory for FilteredFactory {
    fn new_listener(&self, def: &FunctionIdent) -> Option<Box<dyn FunctionListener>> {
        if !self.filter.allows(&def.name) {
            return None;
        }
        self.inner.new_listener(def)
    }
}
