//! Stack walkers.
//!
//! The embedding runtime's stack iterator reflects the physical wasm
//! call stack. That is the right shape for C- or Rust-compiled guests,
//! but Go and Python maintain their own notion of a call stack in guest
//! memory, and the wasm frames bear little resemblance to it. A
//! [`StackSource`] selects per guest language how a stack trace is
//! captured: passed through, unwound from the Go runtime's stack, or
//! walked along the interpreter's frame list.

pub mod go;
pub mod python;

use std::sync::Arc;

use log::debug;

use crate::guest::ModuleAccess;
use crate::listener::{FunctionIdent, StackIter};
use crate::profiling::StackTrace;
use crate::symbolization::gosym::GoSymbols;
use crate::symbolization::python::PyRuntime;

use go::GoStackWalker;
use python::PyStackWalker;

// The Go wasm ABI pins the stack pointer and the current goroutine to
// wasm globals.
const GO_SP_GLOBAL: u32 = 0;
const GO_G_GLOBAL: u32 = 2;

/// How stack traces are captured for a module.
pub enum StackSource {
    /// Drain the runtime's own wasm stack iterator.
    Wasm,
    /// Unwind the current goroutine's stack out of guest memory.
    Go(Arc<GoSymbols>),
    /// Walk the CPython interpreter frame list.
    Python(Arc<PyRuntime>),
}

impl StackSource {
    /// Capture the current stack into `trace`. Returns false when the
    /// walk failed in a way that invalidates the partial trace, in
    /// which case the caller must not observe it.
    pub fn capture(
        &self,
        module: &dyn ModuleAccess,
        def: &FunctionIdent,
        runtime_stack: &mut StackIter<'_>,
        trace: &mut StackTrace,
    ) -> bool {
        match self {
            StackSource::Wasm => {
                trace.fill(runtime_stack);
                true
            }
            StackSource::Go(symbols) => {
                let (Some(sp), Some(g)) =
                    (module.global(GO_SP_GLOBAL), module.global(GO_G_GLOBAL))
                else {
                    debug!("go unwind: module does not expose SP/G globals");
                    return false;
                };
                let mem = module.memory();
                match GoStackWalker::start(symbols, mem, def, sp, g) {
                    Ok(mut walker) => {
                        trace.fill(&mut walker);
                        !walker.failed()
                    }
                    Err(err) => {
                        debug!("go unwind: failed to start walk: {err}");
                        false
                    }
                }
            }
            StackSource::Python(runtime) => {
                let mem = module.memory();
                let mut walker = PyStackWalker::start(runtime, mem, def);
                trace.fill(&mut walker);
                !walker.failed()
            }
        }
    }
}
