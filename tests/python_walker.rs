//! Python stack walking over a fake interpreter memory image.
//!
//! The image lays out `_PyRuntimeState`, a thread state, a `_PyCFrame`
//! and a chain of `_PyInterpreterFrame`s with code objects, compact
//! ASCII strings and packed line tables at the CPython 3.11 offsets
//! the walker expects.

use std::sync::Arc;

use wasmscope::domain::Ptr32;
use wasmscope::guest::{MemoryView, ModuleAccess};
use wasmscope::listener::{Frame, FunctionIdent};
use wasmscope::profiling::StackTrace;
use wasmscope::symbolization::python::PyRuntime;
use wasmscope::unwind::python::PyStackWalker;
use wasmscope::unwind::StackSource;

const PYRT: u32 = 0x100;
const TSTATE: u32 = 0x600;
const CFRAME: u32 = 0x700;
const FRAME_A: u32 = 0x800;
const FRAME_B: u32 = 0x900;
const CODE_A: u32 = 0x1000;
const CODE_B: u32 = 0x1400;
const TABLE_A: u32 = 0x1800;
const FILE_STR: u32 = 0x2000;
const NAME_A_STR: u32 = 0x2100;
const NAME_B_STR: u32 = 0x2200;

// Struct offsets, as the walker uses them.
const TSTATE_IN_RT: u32 = 360;
const CFRAME_IN_TSTATE: u32 = 40;
const FRAME_IN_CFRAME: u32 = 4;
const PREVIOUS_IN_FRAME: u32 = 24;
const CODE_IN_FRAME: u32 = 16;
const PREV_INSTR_IN_FRAME: u32 = 28;
const FILENAME_IN_CODE: u32 = 80;
const NAME_IN_CODE: u32 = 84;
const FIRSTLINENO_IN_CODE: u32 = 48;
const LINETABLE_IN_CODE: u32 = 92;
const CODE_ADAPTIVE_IN_CODE: u32 = 116;

struct Image {
    mem: Vec<u8>,
}

impl Image {
    fn put32(&mut self, at: u32, v: u32) {
        self.mem[at as usize..at as usize + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_ascii(&mut self, at: u32, s: &str) {
        // PyASCIIObject: state at +16 with compact|ascii, length at +8,
        // bytes at +24.
        self.mem[at as usize + 16] = (1 << 5) | (1 << 6);
        self.put32(at + 8, s.len() as u32);
        let start = at as usize + 24;
        self.mem[start..start + s.len()].copy_from_slice(s.as_bytes());
    }

    fn new() -> Image {
        let mut img = Image { mem: vec![0u8; 0x2400] };

        img.put32(PYRT + TSTATE_IN_RT, TSTATE);
        img.put32(TSTATE + CFRAME_IN_TSTATE, CFRAME);
        img.put32(CFRAME + FRAME_IN_CFRAME, FRAME_A);

        // Innermost frame: function a, two code units in.
        img.put32(FRAME_A + CODE_IN_FRAME, CODE_A);
        img.put32(FRAME_A + PREVIOUS_IN_FRAME, FRAME_B);
        img.put32(FRAME_A + PREV_INSTR_IN_FRAME, CODE_A + CODE_ADAPTIVE_IN_CODE + 2);

        // Module-level frame: prev_instr before the code start, so the
        // line falls back to co_firstlineno.
        img.put32(FRAME_B + CODE_IN_FRAME, CODE_B);
        img.put32(FRAME_B + PREVIOUS_IN_FRAME, 0);
        img.put32(FRAME_B + PREV_INSTR_IN_FRAME, CODE_B);

        // Code object a: firstlineno 1, line table with one
        // no-column entry of delta +2 covering one code unit.
        img.put32(CODE_A + FIRSTLINENO_IN_CODE, 1);
        img.put32(CODE_A + FILENAME_IN_CODE, FILE_STR);
        img.put32(CODE_A + NAME_IN_CODE, NAME_A_STR);
        img.put32(CODE_A + LINETABLE_IN_CODE, TABLE_A);
        // PyBytesObject: size at +8, payload at +16.
        img.put32(TABLE_A + 8, 2);
        img.mem[TABLE_A as usize + 16] = 0x80 | (13 << 3);
        img.mem[TABLE_A as usize + 17] = 4; // svarint +2

        // Code object for the module body.
        img.put32(CODE_B + FIRSTLINENO_IN_CODE, 15);
        img.put32(CODE_B + FILENAME_IN_CODE, FILE_STR);
        img.put32(CODE_B + NAME_IN_CODE, NAME_B_STR);
        img.put32(CODE_B + LINETABLE_IN_CODE, TABLE_A);

        img.put_ascii(FILE_STR, "/app/script.py");
        img.put_ascii(NAME_A_STR, "a");
        img.put_ascii(NAME_B_STR, "<module>");

        img
    }
}

impl ModuleAccess for Image {
    fn memory(&self) -> &dyn MemoryView {
        &self.mem
    }

    fn global(&self, _index: u32) -> Option<u64> {
        None
    }
}

fn def() -> FunctionIdent {
    FunctionIdent::guest("python.wasm", "PyObject_Vectorcall", 7)
}

#[test]
fn walker_composes_names_and_lines_from_interpreter_state() {
    let image = Image::new();
    let runtime = PyRuntime::new(Ptr32(PYRT));

    let walker = PyStackWalker::start(&runtime, &image.mem, &def());
    let frames: Vec<Frame> = walker.collect();

    assert_eq!(frames.len(), 2);
    assert_eq!(&*frames[0].function.name, "script.a");
    let hint = frames[0].source.as_ref().expect("resolved at walk time");
    assert_eq!(&*hint.file, "/app/script.py");
    assert_eq!(hint.line, 3, "firstlineno 1 plus the +2 table delta");

    assert_eq!(&*frames[1].function.name, "script", "module-level frame");
    assert_eq!(frames[1].source.as_ref().unwrap().line, 15);
}

#[test]
fn frame_pcs_are_distinct_monotonic_counters() {
    let image = Image::new();
    let runtime = PyRuntime::new(Ptr32(PYRT));

    let first: Vec<Frame> = PyStackWalker::start(&runtime, &image.mem, &def()).collect();
    let second: Vec<Frame> = PyStackWalker::start(&runtime, &image.mem, &def()).collect();

    let mut pcs: Vec<u64> = first.iter().chain(second.iter()).map(|f| f.pc).collect();
    let unique = pcs.len();
    pcs.dedup();
    assert_eq!(pcs.len(), unique, "every frame observation gets a fresh pc");
    assert!(pcs.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn self_referencing_frame_terminates_the_walk() {
    let mut image = Image::new();
    image.put32(FRAME_B + PREVIOUS_IN_FRAME, FRAME_B);

    let runtime = PyRuntime::new(Ptr32(PYRT));
    let mut walker = PyStackWalker::start(&runtime, &image.mem, &def());
    let frames: Vec<Frame> = walker.by_ref().collect();

    // Both frames are emitted once; the loop is cut, not an error that
    // discards the trace.
    assert_eq!(frames.len(), 2);
    assert!(!walker.failed());
}

#[test]
fn unreadable_frame_discards_the_walk() {
    let mut image = Image::new();
    // Point the innermost frame's code object out of bounds.
    image.put32(FRAME_A + CODE_IN_FRAME, 0xffff_0000);

    let runtime = PyRuntime::new(Ptr32(PYRT));
    let mut walker = PyStackWalker::start(&runtime, &image.mem, &def());
    let frames: Vec<Frame> = walker.by_ref().collect();
    assert!(frames.is_empty());
    assert!(walker.failed());
}

#[test]
fn stack_source_captures_python_traces() {
    let image = Image::new();
    let source = StackSource::Python(Arc::new(PyRuntime::new(Ptr32(PYRT))));

    let mut trace = StackTrace::default();
    let mut no_wasm_stack = std::iter::empty();
    let ok = source.capture(&image, &def(), &mut no_wasm_stack, &mut trace);

    assert!(ok);
    assert_eq!(trace.len(), 2);
    assert!(trace.to_string().contains("script.a"));
}
