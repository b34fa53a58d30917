use wasmparser::{DataKind, ExternalKind, Operator, Parser, Payload, TypeRef};

use crate::domain::BinaryError;

/// One mode-0 (active, memory 0) data segment: its virtual address in
/// the guest's linear memory and its raw bytes.
#[derive(Clone, Copy, Debug)]
pub struct DataSegment<'a> {
    pub vaddr: u64,
    pub data: &'a [u8],
}

impl<'a> DataSegment<'a> {
    pub fn end(&self) -> u64 {
        self.vaddr + self.data.len() as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.vaddr && addr < self.end()
    }
}

/// The sections of a Wasm module the profiler cares about.
pub struct ModuleInfo<'a> {
    custom_sections: Vec<(&'a str, &'a [u8])>,
    segments: Vec<DataSegment<'a>>,
    imported_functions: u32,
    function_exports: Vec<(&'a str, u32)>,
    code_section_start: Option<u64>,
}

impl<'a> ModuleInfo<'a> {
    pub fn parse(wasm: &'a [u8]) -> Result<Self, BinaryError> {
        let mut custom_sections = Vec::new();
        let mut segments = Vec::new();
        let mut imported_functions = 0u32;
        let mut function_exports = Vec::new();
        let mut code_section_start = None;

        for payload in Parser::new(0).parse_all(wasm) {
            match payload? {
                Payload::CustomSection(reader) => {
                    custom_sections.push((reader.name(), reader.data()));
                }
                Payload::ImportSection(reader) => {
                    for import in reader {
                        if let TypeRef::Func(_) = import?.ty {
                            imported_functions += 1;
                        }
                    }
                }
                Payload::CodeSectionStart { range, .. } => {
                    code_section_start = Some(range.start as u64);
                }
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export?;
                        if export.kind == ExternalKind::Func {
                            function_exports.push((export.name, export.index));
                        }
                    }
                }
                Payload::DataSection(reader) => {
                    for entry in reader {
                        let entry = entry?;
                        match entry.kind {
                            DataKind::Active { memory_index: 0, offset_expr } => {
                                let vaddr = eval_i32_const(&offset_expr)?;
                                segments.push(DataSegment { vaddr, data: entry.data });
                            }
                            _ => return Err(BinaryError::UnsupportedDataSegment),
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(ModuleInfo {
            custom_sections,
            segments,
            imported_functions,
            function_exports,
            code_section_start,
        })
    }

    /// Byte content of the first custom section with this name, if any.
    pub fn custom_section(&self, name: &str) -> Option<&'a [u8]> {
        self.custom_sections.iter().find(|(n, _)| *n == name).map(|(_, d)| *d)
    }

    pub fn has_custom_section(&self, name: &str) -> bool {
        self.custom_section(name).is_some()
    }

    /// Names of all custom sections, in order of appearance.
    pub fn custom_section_names(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.custom_sections.iter().map(|(n, _)| *n)
    }

    /// Active data segments in order of appearance.
    pub fn data_segments(&self) -> &[DataSegment<'a>] {
        &self.segments
    }

    /// Number of imported functions. Function indices below this count
    /// refer to host functions; the Go PC mapping depends on it.
    pub fn imported_functions(&self) -> u32 {
        self.imported_functions
    }

    /// Exported functions: (export name, function index).
    pub fn function_exports(&self) -> &[(&'a str, u32)] {
        &self.function_exports
    }

    /// Offset of the code section's body in the binary. DWARF addresses
    /// in wasm custom sections are relative to it; runtime adapters
    /// reporting whole-binary offsets subtract this before handing PCs
    /// to the profiler.
    pub fn code_section_start(&self) -> Option<u64> {
        self.code_section_start
    }
}

/// The only offset expression supported for active segments is a single
/// `i32.const`. The constant's bit pattern is the 32-bit virtual address
/// of the segment, which may exceed `i32::MAX` when encoded as a
/// negative signed LEB128; reinterpret rather than sign-extend.
fn eval_i32_const(expr: &wasmparser::ConstExpr<'_>) -> Result<u64, BinaryError> {
    let mut ops = expr.get_operators_reader();
    let vaddr = match ops.read()? {
        Operator::I32Const { value } => u64::from(value as u32),
        _ => return Err(BinaryError::MalformedOffsetExpression),
    };
    match ops.read()? {
        Operator::End => Ok(vaddr),
        _ => Err(BinaryError::MalformedOffsetExpression),
    }
}
