//! CPython 3.11 interpreter introspection.
//!
//! Python guests don't expose a usable wasm call stack: the interpreter
//! loop executes bytecode, so source-level frames live in the
//! interpreter's own heap structures. This module locates `_PyRuntime`
//! through the module's DWARF variables, checks the interpreter version
//! word, and decodes the chain of `_PyInterpreterFrame` structures and
//! code-object line tables directly out of guest memory.
//!
//! Field offsets are those of CPython 3.11 compiled for wasm32, measured
//! against the interpreter the profiler supports. Any other version
//! fails the `Py_Version` check and disables Python support.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gimli::{AttributeValue, Dwarf, EndianArcSlice, LittleEndian, Reader};
use log::debug;
use thiserror::Error;

use crate::domain::{MemoryAccessError, Ptr32};
use crate::guest::{GuestMemory, MemoryView};
use crate::wasm::{DataSection, ModuleInfo};

const RUNTIME_SYMBOL: &str = "_PyRuntime";
const VERSION_SYMBOL: &str = "Py_Version";

// _PyRuntimeState.
const TSTATE_CURRENT_IN_RUNTIME: u32 = 360;
// PyThreadState.
const CFRAME_IN_THREAD_STATE: u32 = 40;
// _PyCFrame.
const CURRENT_FRAME_IN_CFRAME: u32 = 4;
// _PyInterpreterFrame.
const PREVIOUS_IN_FRAME: u32 = 24;
const CODE_IN_FRAME: u32 = 16;
const PREV_INSTR_IN_FRAME: u32 = 28;
// PyCodeObject.
const FILENAME_IN_CODE: u32 = 80;
const NAME_IN_CODE: u32 = 84;
const CODE_ADAPTIVE_IN_CODE: u32 = 116;
const FIRSTLINENO_IN_CODE: u32 = 48;
const LINEARRAY_IN_CODE: u32 = 104;
const LINETABLE_IN_CODE: u32 = 92;
const CODE_UNIT_SIZE: i32 = 2;
// PyASCIIObject.
const STATE_IN_ASCII: u32 = 16;
const LENGTH_IN_ASCII: u32 = 8;
const ASCII_HEADER_SIZE: u32 = 24;
// PyBytesObject.
const SVAL_IN_BYTES: u32 = 16;
const SIZE_IN_BYTES: u32 = 8;
// Code-location entry kinds in the line table.
const LOCATION_ONE_LINE1: u8 = 11;
const LOCATION_ONE_LINE2: u8 = 12;
const LOCATION_NO_COLUMNS: u8 = 13;
const LOCATION_LONG: u8 = 14;

#[derive(Error, Debug)]
pub enum PyError {
    #[error(transparent)]
    Memory(#[from] MemoryAccessError),

    #[error("unsupported string representation (not compact ascii)")]
    UnsupportedString,

    #[error("code object uses a materialized line array")]
    LineArrayUnsupported,

    #[error("code object has no line table")]
    MissingLineTable,
}

/// Virtual addresses of the interpreter globals, read from DWARF.
#[derive(Clone, Copy, Debug)]
pub struct PyGlobals {
    pub runtime: Ptr32,
    pub version: Ptr32,
}

/// Scan the module's DWARF variables for the interpreter globals.
/// Returns `None` when either symbol is absent, which simply means the
/// module does not embed CPython.
pub fn find_py_globals(info: &ModuleInfo<'_>) -> Option<PyGlobals> {
    let dwarf = Dwarf::load(|id| -> Result<EndianArcSlice<LittleEndian>, gimli::Error> {
        let data = info.custom_section(id.name()).unwrap_or(&[]);
        Ok(EndianArcSlice::new(Arc::from(data), LittleEndian))
    })
    .ok()?;

    let mut runtime = None;
    let mut version = None;

    let mut units = dwarf.units();
    while let Ok(Some(header)) = units.next() {
        let Ok(unit) = dwarf.unit(header) else { continue };
        let mut entries = unit.entries();
        while let Ok(Some((_, entry))) = entries.next_dfs() {
            if entry.tag() != gimli::DW_TAG_variable {
                continue;
            }
            let Ok(Some(name_attr)) = entry.attr_value(gimli::DW_AT_name) else { continue };
            let Ok(name) = dwarf.attr_string(&unit, name_attr) else { continue };
            let Ok(name) = name.to_string_lossy() else { continue };
            let slot = match &*name {
                RUNTIME_SYMBOL => &mut runtime,
                VERSION_SYMBOL => &mut version,
                _ => continue,
            };
            if let Some(addr) = variable_address(entry) {
                *slot = Some(Ptr32(addr));
            }
            if let (Some(runtime), Some(version)) = (runtime, version) {
                return Some(PyGlobals { runtime, version });
            }
        }
    }
    None
}

/// Decode a `DW_AT_location` of the form `DW_OP_addr <addr32>`.
fn variable_address(
    entry: &gimli::DebuggingInformationEntry<'_, '_, EndianArcSlice<LittleEndian>>,
) -> Option<u32> {
    const DW_OP_ADDR: u8 = 0x03;
    let value = entry.attr_value(gimli::DW_AT_location).ok()??;
    let AttributeValue::Exprloc(expr) = value else { return None };
    let bytes = expr.0.to_slice().ok()?;
    if bytes.len() < 5 || bytes[0] != DW_OP_ADDR {
        return None;
    }
    Some(u32::from_le_bytes(bytes[1..5].try_into().unwrap()))
}

/// Check the interpreter version word in the static data image. The
/// profiler hardcodes CPython 3.11 struct offsets, so only that version
/// is accepted.
pub fn python_version_supported(data: &DataSection<'_>, version: Ptr32) -> bool {
    let Some(raw) = data.bytes_at(u64::from(version.addr()), 4) else { return false };
    let word = u32::from_le_bytes(raw.try_into().unwrap());
    let major = (word >> 24) & 0xff;
    let minor = (word >> 16) & 0xff;
    debug!("python: Py_Version {major}.{minor}");
    major == 3 && minor == 11
}

/// Everything the Python stack walker needs once the module runs:
/// the `_PyRuntime` address and the monotonic counter handed out as
/// frame "PCs" (interpreter frames have no meaningful program counter,
/// but stack keys must be distinct).
pub struct PyRuntime {
    runtime: Ptr32,
    counter: AtomicU64,
}

/// Source position of one interpreter frame, read while the frame is
/// live.
#[derive(Clone, Debug)]
pub struct PyCall {
    /// Composed `<module>.<qualname>` function name.
    pub name: String,
    pub file: String,
    pub line: i64,
    /// The frame's `prev_instr` pointer, recorded as the location
    /// address.
    pub addr: u32,
}

impl PyRuntime {
    pub fn new(runtime: Ptr32) -> Self {
        PyRuntime { runtime, counter: AtomicU64::new(0) }
    }

    /// Next value of the synthetic frame counter.
    pub fn next_pc(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The innermost `_PyInterpreterFrame` of the current thread,
    /// reached through `_PyRuntimeState` -> `PyThreadState` ->
    /// `_PyCFrame`.
    pub fn current_frame(&self, mem: &dyn MemoryView) -> Result<Ptr32, PyError> {
        let g = GuestMemory::new(mem);
        let tstate = g.read_ptr32(self.runtime + TSTATE_CURRENT_IN_RUNTIME)?;
        if tstate.is_null() {
            return Ok(Ptr32::NULL);
        }
        let cframe = g.read_ptr32(tstate + CFRAME_IN_THREAD_STATE)?;
        if cframe.is_null() {
            return Ok(Ptr32::NULL);
        }
        Ok(g.read_ptr32(cframe + CURRENT_FRAME_IN_CFRAME)?)
    }

    /// The caller's frame, following `_PyInterpreterFrame.previous`.
    pub fn previous_frame(&self, mem: &dyn MemoryView, frame: Ptr32) -> Result<Ptr32, PyError> {
        let g = GuestMemory::new(mem);
        Ok(g.read_ptr32(frame + PREVIOUS_IN_FRAME)?)
    }

    /// Resolve the source position of a frame.
    pub fn describe_frame(&self, mem: &dyn MemoryView, frame: Ptr32) -> Result<PyCall, PyError> {
        let g = GuestMemory::new(mem);
        let code = g.read_ptr32(frame + CODE_IN_FRAME)?;
        let line = line_for_frame(&g, frame, code)?;
        let file = read_py_unicode(&g, g.read_ptr32(code + FILENAME_IN_CODE)?)?;
        let name = read_py_unicode(&g, g.read_ptr32(code + NAME_IN_CODE)?)?;
        let addr = g.read_u32_at32(frame + PREV_INSTR_IN_FRAME)?;
        Ok(PyCall { name: function_name(&file, &name), file, line: i64::from(line), addr })
    }
}

/// `<module>.<qualname>` naming: the module part is the basename of the
/// code object's filename without extension, or the bracketed name for
/// frozen modules; top-level code keeps the module name alone.
fn function_name(path: &str, function: &str) -> String {
    const FROZEN_PREFIX: &str = "<frozen ";
    let module = if let Some(rest) = path.strip_prefix(FROZEN_PREFIX) {
        rest.strip_suffix('>').unwrap_or(rest).to_string()
    } else {
        let base = Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        base
    };

    if function == "<module>" {
        module
    } else {
        format!("{module}.{function}")
    }
}

/// Re-implementation of `PyUnicode_AsUTF8` for compact ASCII strings,
/// the only representation CPython produces for file and function names
/// in practice.
fn read_py_unicode(g: &GuestMemory<'_>, p: Ptr32) -> Result<String, PyError> {
    let state = g.read_u8_at32(p + STATE_IN_ASCII)?;
    let compact = state & (1 << 5) != 0;
    let ascii = state & (1 << 6) != 0;
    if !compact || !ascii {
        return Err(PyError::UnsupportedString);
    }
    let length = g.read_i32_at32(p + LENGTH_IN_ASCII)?;
    let length = u32::try_from(length).map_err(|_| PyError::UnsupportedString)?;
    let bytes = g.read_bytes((p + ASCII_HEADER_SIZE).widen(), length)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Compute the source line of a frame from its code object's packed
/// location table, following CPython's `_PyCode_CheckLineNumber` walk.
/// Returns the `co_firstlineno` when the frame hasn't started executing
/// bytecode yet, and -1 when the position is the "no line" sentinel.
fn line_for_frame(g: &GuestMemory<'_>, frame: Ptr32, code: Ptr32) -> Result<i32, PyError> {
    let code_start = code + CODE_ADAPTIVE_IN_CODE;
    let prev_instr = g.read_ptr32(frame + PREV_INSTR_IN_FRAME)?;
    let first_lineno = g.read_i32_at32(code + FIRSTLINENO_IN_CODE)?;

    if prev_instr.addr() < code_start.addr() {
        return Ok(first_lineno);
    }

    let line_array = g.read_ptr32(code + LINEARRAY_IN_CODE)?;
    if !line_array.is_null() {
        return Err(PyError::LineArrayUnsupported);
    }

    let table_obj = g.read_ptr32(code + LINETABLE_IN_CODE)?;
    if table_obj.is_null() {
        return Err(PyError::MissingLineTable);
    }

    let length = g.read_i32_at32(table_obj + SIZE_IN_BYTES)?;
    let table = table_obj + SVAL_IN_BYTES;
    let addrq = (prev_instr.addr() - code_start.addr()) as i32;

    let mut cursor = table;
    let limit = table + u32::try_from(length.max(0)).unwrap_or(0);
    let mut code_end: i32 = 0;
    let mut computed_line = first_lineno;
    let mut line: i32 = -1;

    while code_end <= addrq && cursor.addr() < limit.addr() {
        let entry = g.read_u8_at32(cursor)?;
        let kind = (entry >> 3) & 15;
        let delta = match kind {
            LOCATION_ONE_LINE1 => 1,
            LOCATION_ONE_LINE2 => 2,
            LOCATION_NO_COLUMNS | LOCATION_LONG => read_svarint(g, cursor + 1)?,
            _ => 0,
        };
        computed_line += delta;

        line = if entry >> 3 == 0x1f { -1 } else { computed_line };
        code_end += (i32::from(entry & 7) + 1) * CODE_UNIT_SIZE;

        // Skip to the next entry: entries start at bytes with the high
        // bit set.
        cursor = cursor + 1;
        while cursor.addr() < limit.addr() && g.read_u8_at32(cursor)? & 0x80 == 0 {
            cursor = cursor + 1;
        }
    }

    Ok(line)
}

/// CPython's 6-bit signed varint, used inside location table entries.
/// Bit 6 marks continuation; bit 7 is reserved for entry starts.
fn read_svarint(g: &GuestMemory<'_>, p: Ptr32) -> Result<i32, PyError> {
    let mut cursor = p;
    let mut read = g.read_u8_at32(cursor)?;
    cursor = cursor + 1;
    let mut val = u32::from(read & 63);
    let mut shift = 0u32;
    while read & 64 != 0 {
        read = g.read_u8_at32(cursor)?;
        cursor = cursor + 1;
        shift += 6;
        val |= u32::from(read & 63) << (shift & 31);
    }
    let magnitude = (val >> 1) as i32;
    Ok(if val & 1 != 0 { -magnitude } else { magnitude })
}
