//! DWARF symbolization over Wasm custom sections.
//!
//! Toolchains targeting wasm embed DWARF as custom sections named after
//! the classic ELF sections (`.debug_info`, `.debug_line`, ...), with
//! addresses expressed as offsets into the module's code. The symbolizer
//! indexes every `DW_TAG_subprogram` by its source-offset ranges at
//! construction time, together with the `DW_TAG_inlined_subroutine`
//! children found inside it, and resolves lookups against a flattened,
//! address-sorted copy of each unit's line program.

use std::collections::HashMap;
use std::sync::{Arc, Once};

use gimli::{
    AttributeValue, ColumnType, DebuggingInformationEntry, Dwarf, EndianArcSlice, LittleEndian,
    Reader as _, Unit, UnitOffset,
};
use log::{debug, warn};

use crate::domain::BinaryError;
use crate::listener::Frame;
use crate::symbolization::{Location, Symbolizer};
use crate::wasm::ModuleInfo;

type Reader = EndianArcSlice<LittleEndian>;

/// Names of the custom sections the symbolizer consumes.
pub const DEBUG_SECTIONS: [&str; 5] =
    [".debug_info", ".debug_line", ".debug_str", ".debug_abbrev", ".debug_ranges"];

/// True when the module carries a `.debug_info` section; the other
/// sections are optional and default to empty.
pub fn has_debug_info(info: &ModuleInfo<'_>) -> bool {
    info.has_custom_section(".debug_info")
}

#[derive(Clone, Debug)]
struct NamePair {
    human: String,
    stable: String,
}

/// One inlined call recorded inside a subprogram, in document order
/// (outermost inlined call first when inlines nest).
#[derive(Debug)]
struct InlinedCall {
    ranges: Vec<(u64, u64)>,
    names: NamePair,
    call_file: Option<u64>,
    call_line: i64,
    call_column: i64,
}

#[derive(Debug)]
struct Subprogram {
    unit: usize,
    names: NamePair,
    inlines: Vec<InlinedCall>,
}

/// Maps a source-offset range to the subprogram covering it.
#[derive(Debug)]
struct SubprogramRange {
    start: u64,
    end: u64,
    subprogram: usize,
}

/// One flattened row of a unit's line program.
#[derive(Debug, Clone, Copy)]
struct LineRow {
    address: u64,
    file: u64,
    line: i64,
    column: i64,
}

struct UnitLines {
    /// Sorted by address.
    rows: Vec<LineRow>,
    /// File paths by line-program file index.
    files: HashMap<u64, String>,
}

pub struct DwarfSymbolizer {
    subprograms: Vec<Subprogram>,
    /// Sorted by range start for binary search.
    ranges: Vec<SubprogramRange>,
    units: Vec<UnitLines>,
    unresolved_log: Once,
}

impl DwarfSymbolizer {
    /// Build the symbolizer from the module's debug sections. Fails when
    /// the DWARF data is malformed; a module with no `.debug_info` at
    /// all should instead use [`NullSymbolizer`](crate::symbolization::NullSymbolizer).
    pub fn parse(info: &ModuleInfo<'_>) -> Result<Self, BinaryError> {
        let dwarf = load_dwarf(info)?;
        let mut builder = Builder::default();

        let mut iter = dwarf.units();
        while let Some(header) = iter.next()? {
            let unit = dwarf.unit(header)?;
            builder.parse_unit(&dwarf, &unit)?;
        }

        let mut ranges = builder.ranges;
        ranges.sort_by_key(|r| r.start);
        debug!(
            "dwarf: indexed {} subprograms over {} ranges",
            builder.subprograms.len(),
            ranges.len()
        );

        Ok(DwarfSymbolizer {
            subprograms: builder.subprograms,
            ranges,
            units: builder.units,
            unresolved_log: Once::new(),
        })
    }

    fn subprogram_for(&self, offset: u64) -> Option<&Subprogram> {
        let idx = self.ranges.partition_point(|r| r.start <= offset).checked_sub(1)?;
        // Subprogram ranges don't overlap; an offset between two ranges
        // fails the containment check below.
        let r = &self.ranges[idx];
        (offset < r.end).then(|| &self.subprograms[r.subprogram])
    }

    /// Line-program position for `offset`: the row with the greatest
    /// address <= offset. When no row matches exactly, the previous row
    /// is the one containing the instruction, a convention shared with
    /// other DWARF consumers.
    fn line_at(&self, unit: usize, offset: u64) -> Option<LineRow> {
        let rows = &self.units.get(unit)?.rows;
        let idx = rows.partition_point(|r| r.address <= offset).checked_sub(1)?;
        Some(rows[idx])
    }

    fn file_name(&self, unit: usize, file: u64) -> String {
        self.units
            .get(unit)
            .and_then(|u| u.files.get(&file))
            .cloned()
            .unwrap_or_default()
    }
}

impl Symbolizer for DwarfSymbolizer {
    fn locations_for(&self, frame: &Frame) -> Vec<Location> {
        let offset = frame.pc;
        if offset == 0 {
            return Vec::new();
        }

        let Some(spgm) = self.subprogram_for(offset) else {
            self.unresolved_log.call_once(|| {
                debug!(
                    "dwarf: no subprogram range for source offset {offset:#x} \
                     (silencing similar messages)"
                );
            });
            return Vec::new();
        };

        let Some(row) = self.line_at(spgm.unit, offset) else {
            return Vec::new();
        };

        // The line program gives the innermost source position. Walk the
        // inlined calls containing the offset from the innermost out,
        // attributing the current position to each call and replacing it
        // with that call's own call site.
        let chain: Vec<&InlinedCall> = spgm
            .inlines
            .iter()
            .filter(|inl| inl.ranges.iter().any(|&(lo, hi)| lo <= offset && offset < hi))
            .collect();

        let mut locations = Vec::with_capacity(chain.len() + 1);
        let mut file = self.file_name(spgm.unit, row.file);
        let mut line = row.line;
        let mut column = row.column;

        for inl in chain.iter().rev() {
            locations.push(Location {
                file: std::mem::take(&mut file),
                line,
                column,
                inlined: true,
                human_name: inl.names.human.clone(),
                stable_name: inl.names.stable.clone(),
            });
            file = inl
                .call_file
                .map(|f| self.file_name(spgm.unit, f))
                .unwrap_or_default();
            line = inl.call_line;
            column = inl.call_column;
        }

        locations.push(Location {
            file,
            line,
            column,
            inlined: false,
            human_name: spgm.names.human.clone(),
            stable_name: spgm.names.stable.clone(),
        });

        locations
    }

    fn name(&self) -> &'static str {
        "dwarf"
    }
}

fn load_dwarf(info: &ModuleInfo<'_>) -> Result<Dwarf<Reader>, gimli::Error> {
    Dwarf::load(|id| -> Result<Reader, gimli::Error> {
        let data = info.custom_section(id.name()).unwrap_or(&[]);
        Ok(EndianArcSlice::new(Arc::from(data), LittleEndian))
    })
}

#[derive(Default)]
struct Builder {
    subprograms: Vec<Subprogram>,
    ranges: Vec<SubprogramRange>,
    units: Vec<UnitLines>,
    /// Names of every subprogram seen, keyed by (unit, DIE offset), so
    /// inlined calls can resolve their origin even when the origin has
    /// no code range of its own.
    by_offset: HashMap<(usize, UnitOffset), NamePair>,
}

impl Builder {
    fn parse_unit(&mut self, dwarf: &Dwarf<Reader>, unit: &Unit<Reader>) -> Result<(), gimli::Error> {
        let unit_index = self.units.len();
        self.units.push(flatten_line_program(dwarf, unit)?);

        // First pass: index names of all subprograms in the unit so
        // abstract origins resolve regardless of declaration order.
        {
            let mut entries = unit.entries();
            let mut ns = NamespaceStack::default();
            let mut depth = 0isize;
            while let Some((delta, entry)) = entries.next_dfs()? {
                depth += delta;
                ns.truncate(depth);
                match entry.tag() {
                    gimli::DW_TAG_namespace => {
                        if let Some(name) = entry_name(dwarf, unit, entry)? {
                            ns.push(depth, name);
                        }
                    }
                    gimli::DW_TAG_subprogram => {
                        let names = entry_names(dwarf, unit, entry, &ns.prefix())?;
                        self.by_offset.insert((unit_index, entry.offset()), names);
                    }
                    _ => {}
                }
            }
        }

        // Second pass: record ranges and inlined calls. Names resolve
        // through the first pass's index, so namespaces no longer
        // matter here.
        let mut entries = unit.entries();
        let mut depth = 0isize;
        let mut current: Option<(isize, usize)> = None;
        while let Some((delta, entry)) = entries.next_dfs()? {
            depth += delta;
            if let Some((spgm_depth, _)) = current {
                if depth <= spgm_depth {
                    current = None;
                }
            }
            match entry.tag() {
                gimli::DW_TAG_subprogram => {
                    let index = self.subprograms.len();
                    let names = self
                        .by_offset
                        .get(&(unit_index, entry.offset()))
                        .cloned()
                        .unwrap_or_else(|| NamePair { human: String::new(), stable: String::new() });
                    for (lo, hi) in die_ranges(dwarf, unit, entry)? {
                        self.ranges.push(SubprogramRange { start: lo, end: hi, subprogram: index });
                    }
                    self.subprograms.push(Subprogram { unit: unit_index, names, inlines: Vec::new() });
                    current = Some((depth, index));
                }
                gimli::DW_TAG_inlined_subroutine => {
                    let Some((_, index)) = current else { continue };
                    let names = self.origin_names(dwarf, unit, unit_index, entry)?;
                    let ranges = die_ranges(dwarf, unit, entry)?;
                    let (call_file, call_line, call_column) = call_site(entry)?;
                    self.subprograms[index].inlines.push(InlinedCall {
                        ranges,
                        names,
                        call_file,
                        call_line,
                        call_column,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Names for an inlined call, read from its abstract origin.
    fn origin_names(
        &self,
        dwarf: &Dwarf<Reader>,
        unit: &Unit<Reader>,
        unit_index: usize,
        entry: &DebuggingInformationEntry<'_, '_, Reader>,
    ) -> Result<NamePair, gimli::Error> {
        if let Some(AttributeValue::UnitRef(offset)) =
            entry.attr_value(gimli::DW_AT_abstract_origin)?
        {
            if let Some(names) = self.by_offset.get(&(unit_index, offset)) {
                return Ok(names.clone());
            }
            let origin = unit.entry(offset)?;
            return entry_names(dwarf, unit, &origin, "");
        }
        entry_names(dwarf, unit, entry, "")
    }
}

#[derive(Default)]
struct NamespaceStack {
    parts: Vec<(isize, String)>,
}

impl NamespaceStack {
    fn push(&mut self, depth: isize, name: String) {
        self.parts.push((depth, name));
    }

    fn truncate(&mut self, depth: isize) {
        while self.parts.last().is_some_and(|&(d, _)| d >= depth) {
            self.parts.pop();
        }
    }

    fn prefix(&self) -> String {
        let mut s = String::new();
        for (_, part) in &self.parts {
            s.push_str(part);
            s.push_str("::");
        }
        s
    }
}

fn entry_name(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    entry: &DebuggingInformationEntry<'_, '_, Reader>,
) -> Result<Option<String>, gimli::Error> {
    let Some(attr) = entry.attr_value(gimli::DW_AT_name)? else { return Ok(None) };
    let s = dwarf.attr_string(unit, attr)?;
    Ok(Some(s.to_string_lossy()?.into_owned()))
}

fn attr_str(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    entry: &DebuggingInformationEntry<'_, '_, Reader>,
    attr: gimli::DwAt,
) -> Result<Option<String>, gimli::Error> {
    let Some(value) = entry.attr_value(attr)? else { return Ok(None) };
    let s = dwarf.attr_string(unit, value)?;
    Ok(Some(s.to_string_lossy()?.into_owned()))
}

/// Human-readable and stable names for a function DIE, chasing
/// `DW_AT_abstract_origin`/`DW_AT_specification` when the entry itself
/// is anonymous. The stable name prefers `DW_AT_linkage_name`; the human
/// name is the namespace-qualified `DW_AT_name`, demangled when the
/// linkage name turns out to be a mangled Rust symbol.
fn entry_names(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    entry: &DebuggingInformationEntry<'_, '_, Reader>,
    namespace: &str,
) -> Result<NamePair, gimli::Error> {
    let mut name = entry_name(dwarf, unit, entry)?;
    let mut linkage = attr_str(dwarf, unit, entry, gimli::DW_AT_linkage_name)?;

    let mut origin = entry.attr_value(gimli::DW_AT_abstract_origin)?;
    if origin.is_none() {
        origin = entry.attr_value(gimli::DW_AT_specification)?;
    }
    if name.is_none() || linkage.is_none() {
        if let Some(AttributeValue::UnitRef(offset)) = origin {
            if let Ok(target) = unit.entry(offset) {
                if name.is_none() {
                    name = entry_name(dwarf, unit, &target)?;
                }
                if linkage.is_none() {
                    linkage = attr_str(dwarf, unit, &target, gimli::DW_AT_linkage_name)?;
                }
            }
        }
    }

    let name = name.unwrap_or_default();
    let human = match &linkage {
        Some(mangled) => match rustc_demangle::try_demangle(mangled) {
            Ok(demangled) => format!("{demangled:#}"),
            Err(_) => format!("{namespace}{name}"),
        },
        None => format!("{namespace}{name}"),
    };
    let stable = linkage.unwrap_or_else(|| human.clone());
    Ok(NamePair { human, stable })
}

fn die_ranges(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    entry: &DebuggingInformationEntry<'_, '_, Reader>,
) -> Result<Vec<(u64, u64)>, gimli::Error> {
    let mut out = Vec::new();
    let mut iter = dwarf.die_ranges(unit, entry)?;
    while let Some(range) = iter.next()? {
        if range.begin < range.end {
            out.push((range.begin, range.end));
        }
    }
    Ok(out)
}

fn call_site(
    entry: &DebuggingInformationEntry<'_, '_, Reader>,
) -> Result<(Option<u64>, i64, i64), gimli::Error> {
    let file = entry
        .attr_value(gimli::DW_AT_call_file)?
        .and_then(|v| match v {
            AttributeValue::FileIndex(i) => Some(i),
            AttributeValue::Udata(i) => Some(i),
            _ => None,
        });
    let line = entry
        .attr(gimli::DW_AT_call_line)?
        .and_then(|a| a.udata_value())
        .map(|v| v as i64)
        .unwrap_or(0);
    let column = entry
        .attr(gimli::DW_AT_call_column)?
        .and_then(|a| a.udata_value())
        .map(|v| v as i64)
        .unwrap_or(0);
    Ok((file, line, column))
}

/// Run the unit's line program once and keep a sorted, flattened copy.
fn flatten_line_program(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
) -> Result<UnitLines, gimli::Error> {
    let mut rows = Vec::new();
    let mut files = HashMap::new();

    let Some(program) = unit.line_program.clone() else {
        return Ok(UnitLines { rows, files });
    };

    let mut sm = program.rows();
    while let Some((header, row)) = sm.next_row()? {
        if row.end_sequence() {
            continue;
        }
        let file = row.file_index();
        if !files.contains_key(&file) {
            if let Some(path) = render_file(dwarf, unit, header, file)? {
                files.insert(file, path);
            }
        }
        rows.push(LineRow {
            address: row.address(),
            file,
            line: row.line().map(|l| l.get() as i64).unwrap_or(0),
            column: match row.column() {
                ColumnType::LeftEdge => 0,
                ColumnType::Column(c) => c.get() as i64,
            },
        });
    }

    rows.sort_by_key(|r| r.address);
    Ok(UnitLines { rows, files })
}

fn render_file(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    header: &gimli::LineProgramHeader<Reader>,
    index: u64,
) -> Result<Option<String>, gimli::Error> {
    let Some(file) = header.file(index) else {
        warn!("dwarf: line row references unknown file index {index}");
        return Ok(None);
    };

    let mut path = String::new();
    if let Some(comp_dir) = &unit.comp_dir {
        path.push_str(&comp_dir.to_string_lossy()?);
    }

    if let Some(dir) = file.directory(header) {
        let dir = dwarf.attr_string(unit, dir)?;
        let dir = dir.to_string_lossy()?;
        if !dir.is_empty() {
            // An absolute directory overrides the compilation dir.
            if dir.starts_with('/') {
                path.clear();
            } else if !path.is_empty() && !path.ends_with('/') {
                path.push('/');
            }
            path.push_str(&dir);
        }
    }

    let name = dwarf.attr_string(unit, file.path_name())?;
    let name = name.to_string_lossy()?;
    // An absolute file name overrides everything.
    if name.starts_with('/') {
        path.clear();
    } else if !path.is_empty() && !path.ends_with('/') {
        path.push('/');
    }
    path.push_str(&name);
    Ok(Some(path))
}
