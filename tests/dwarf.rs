//! DWARF symbolization tests over synthetic debug info.
//!
//! The fixtures are emitted with gimli's writer and embedded into a
//! real wasm module as custom sections, the same shape wasm toolchains
//! produce.

use gimli::write::{
    Address, AttributeValue, DwarfUnit, EndianVec, LineProgram, LineString, Sections,
};
use gimli::{Encoding, Format, LineEncoding, LittleEndian};

use wasmscope::listener::{Frame, FunctionIdent};
use wasmscope::symbolization::dwarf::DwarfSymbolizer;
use wasmscope::symbolization::Symbolizer;
use wasmscope::wasm::ModuleInfo;

fn escape(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{b:02x}")).collect()
}

/// Serialize the DWARF writer state into a wasm module with one custom
/// section per non-empty debug section.
fn into_wasm(mut dwarf: DwarfUnit) -> Vec<u8> {
    let mut sections = Sections::new(EndianVec::new(LittleEndian));
    dwarf.write(&mut sections).expect("write dwarf");

    let mut wat = String::from("(module\n");
    sections
        .for_each(|id, data: &EndianVec<LittleEndian>| {
            if !data.slice().is_empty() {
                wat.push_str(&format!(
                    "  (@custom \"{}\" \"{}\")\n",
                    id.name(),
                    escape(data.slice())
                ));
            }
            Ok::<(), gimli::write::Error>(())
        })
        .unwrap();
    wat.push(')');
    wat::parse_str(&wat).expect("fixture wat")
}

/// One compile unit, file simple.c, with:
///
/// - `func1` at `[0x100, 0x140)`, line 6 up to +0x20 and line 7 after;
/// - `func2` at `[0x180, 0x1a0)`, carrying a mangled Rust linkage name;
/// - `func3` at `[0x200, 0x260)` with `func31` inlined over
///   `[0x220, 0x240)`, called at line 23;
/// - namespace `fiction` containing `novel` at `[0x300, 0x320)`.
fn fixture() -> Vec<u8> {
    let encoding = Encoding { format: Format::Dwarf32, version: 4, address_size: 4 };
    let mut dwarf = DwarfUnit::new(encoding);

    let comp_dir = LineString::new(&b"/src"[..], encoding, &mut dwarf.line_strings);
    let comp_file = LineString::new(&b"simple.c"[..], encoding, &mut dwarf.line_strings);
    let mut program =
        LineProgram::new(encoding, LineEncoding::default(), comp_dir, comp_file, None);
    let dir_id = program.default_directory();
    let file_string = LineString::new(&b"simple.c"[..], encoding, &mut dwarf.line_strings);
    let file_id = program.add_file(file_string, dir_id, None);

    let mut row = |base: u64, rows: &[(u64, u64)], end: u64| {
        program.begin_sequence(Some(Address::Constant(base)));
        for &(offset, line) in rows {
            program.row().address_offset = offset;
            program.row().file = file_id;
            program.row().line = line;
            program.generate_row();
        }
        program.end_sequence(end);
    };
    row(0x100, &[(0x0, 6), (0x20, 7)], 0x40);
    row(0x180, &[(0x0, 14)], 0x20);
    row(0x200, &[(0x0, 22), (0x20, 29), (0x40, 24)], 0x60);
    row(0x300, &[(0x0, 40)], 0x20);
    dwarf.unit.line_program = program;

    let root = dwarf.unit.root();
    dwarf
        .unit
        .get_mut(root)
        .set(gimli::DW_AT_name, AttributeValue::String(b"simple.c".to_vec()));
    dwarf
        .unit
        .get_mut(root)
        .set(gimli::DW_AT_comp_dir, AttributeValue::String(b"/src".to_vec()));

    let func1 = dwarf.unit.add(root, gimli::DW_TAG_subprogram);
    let die = dwarf.unit.get_mut(func1);
    die.set(gimli::DW_AT_name, AttributeValue::String(b"func1".to_vec()));
    die.set(gimli::DW_AT_low_pc, AttributeValue::Address(Address::Constant(0x100)));
    die.set(gimli::DW_AT_high_pc, AttributeValue::Udata(0x40));

    let func2 = dwarf.unit.add(root, gimli::DW_TAG_subprogram);
    let die = dwarf.unit.get_mut(func2);
    die.set(gimli::DW_AT_name, AttributeValue::String(b"func2".to_vec()));
    die.set(
        gimli::DW_AT_linkage_name,
        AttributeValue::String(b"_ZN6simple5func217h0123456789abcdefE".to_vec()),
    );
    die.set(gimli::DW_AT_low_pc, AttributeValue::Address(Address::Constant(0x180)));
    die.set(gimli::DW_AT_high_pc, AttributeValue::Udata(0x20));

    // func31 exists only as an inlined body; no code range of its own.
    let func31 = dwarf.unit.add(root, gimli::DW_TAG_subprogram);
    let die = dwarf.unit.get_mut(func31);
    die.set(gimli::DW_AT_name, AttributeValue::String(b"func31".to_vec()));
    die.set(gimli::DW_AT_inline, AttributeValue::Inline(gimli::DW_INL_inlined));

    let func3 = dwarf.unit.add(root, gimli::DW_TAG_subprogram);
    let die = dwarf.unit.get_mut(func3);
    die.set(gimli::DW_AT_name, AttributeValue::String(b"func3".to_vec()));
    die.set(gimli::DW_AT_low_pc, AttributeValue::Address(Address::Constant(0x200)));
    die.set(gimli::DW_AT_high_pc, AttributeValue::Udata(0x60));

    let inlined = dwarf.unit.add(func3, gimli::DW_TAG_inlined_subroutine);
    let die = dwarf.unit.get_mut(inlined);
    die.set(gimli::DW_AT_abstract_origin, AttributeValue::UnitRef(func31));
    die.set(gimli::DW_AT_low_pc, AttributeValue::Address(Address::Constant(0x220)));
    die.set(gimli::DW_AT_high_pc, AttributeValue::Udata(0x20));
    die.set(gimli::DW_AT_call_file, AttributeValue::FileIndex(Some(file_id)));
    die.set(gimli::DW_AT_call_line, AttributeValue::Udata(23));
    die.set(gimli::DW_AT_call_column, AttributeValue::Udata(12));

    let namespace = dwarf.unit.add(root, gimli::DW_TAG_namespace);
    let die = dwarf.unit.get_mut(namespace);
    die.set(gimli::DW_AT_name, AttributeValue::String(b"fiction".to_vec()));

    let novel = dwarf.unit.add(namespace, gimli::DW_TAG_subprogram);
    let die = dwarf.unit.get_mut(novel);
    die.set(gimli::DW_AT_name, AttributeValue::String(b"novel".to_vec()));
    die.set(gimli::DW_AT_low_pc, AttributeValue::Address(Address::Constant(0x300)));
    die.set(gimli::DW_AT_high_pc, AttributeValue::Udata(0x20));

    into_wasm(dwarf)
}

fn symbolizer() -> DwarfSymbolizer {
    let wasm = fixture();
    let info = ModuleInfo::parse(&wasm).unwrap();
    // The symbolizer snapshots the sections it needs; it does not
    // borrow the module bytes.
    DwarfSymbolizer::parse(&info).unwrap()
}

fn frame(pc: u64) -> Frame {
    Frame::new(FunctionIdent::guest("m", "wasm_fn", 9), pc)
}

#[test]
fn resolves_function_file_and_line() {
    let symbols = symbolizer();

    let locs = symbols.locations_for(&frame(0x100));
    assert_eq!(locs.len(), 1);
    assert_eq!(locs[0].human_name, "func1");
    assert_eq!(locs[0].file, "/src/simple.c");
    assert_eq!(locs[0].line, 6);
    assert!(!locs[0].inlined);

    // Past the second row the line advances.
    let locs = symbols.locations_for(&frame(0x130));
    assert_eq!(locs[0].line, 7);
}

#[test]
fn offsets_between_rows_use_the_previous_row() {
    let symbols = symbolizer();
    // 0x10c has no exact row; the row at 0x100 covers it.
    let locs = symbols.locations_for(&frame(0x10c));
    assert_eq!(locs[0].line, 6);
}

#[test]
fn unknown_offsets_resolve_to_nothing() {
    let symbols = symbolizer();
    assert!(symbols.locations_for(&frame(0x50)).is_empty());
    assert!(symbols.locations_for(&frame(0)).is_empty());
}

#[test]
fn inlined_calls_expand_innermost_first() {
    let symbols = symbolizer();

    let locs = symbols.locations_for(&frame(0x225));
    assert_eq!(locs.len(), 2);
    // The inlined body comes first, at the line the pc maps to.
    assert_eq!(locs[0].human_name, "func31");
    assert_eq!(locs[0].line, 29);
    assert!(locs[0].inlined);
    // The enclosing function carries the call site.
    assert_eq!(locs[1].human_name, "func3");
    assert_eq!(locs[1].line, 23);
    assert_eq!(locs[1].column, 12);
    assert!(!locs[1].inlined);

    // Outside the inline range only func3 shows.
    let locs = symbols.locations_for(&frame(0x205));
    assert_eq!(locs.len(), 1);
    assert_eq!(locs[0].human_name, "func3");
    assert_eq!(locs[0].line, 22);
}

#[test]
fn namespaces_prefix_the_human_name() {
    let symbols = symbolizer();
    let locs = symbols.locations_for(&frame(0x308));
    assert_eq!(locs.len(), 1);
    assert_eq!(locs[0].human_name, "fiction::novel");
}

#[test]
fn mangled_linkage_names_are_demangled_for_display() {
    let symbols = symbolizer();
    let locs = symbols.locations_for(&frame(0x188));
    assert_eq!(locs.len(), 1);
    assert_eq!(locs[0].human_name, "simple::func2");
    assert_eq!(locs[0].stable_name, "_ZN6simple5func217h0123456789abcdefE");
    assert_eq!(locs[0].line, 14);
}

mod profile_integration {
    use super::*;
    use std::sync::Arc;
    use wasmscope::guest::{MemoryView, ModuleAccess};
    use wasmscope::listener::ListenerFactory;
    use wasmscope::profiling::MemoryProfiler;
    use wasmscope::unwind::StackSource;

    struct NoModule {
        mem: Vec<u8>,
    }

    impl ModuleAccess for NoModule {
        fn memory(&self) -> &dyn MemoryView {
            &self.mem
        }

        fn global(&self, _index: u32) -> Option<u64> {
            None
        }
    }

    fn record_malloc(profiler: &MemoryProfiler, size: u64, address: u64, stack: Vec<Frame>) {
        let module = NoModule { mem: vec![0; 16] };
        let def = FunctionIdent::guest("app", "malloc", 3);
        let lstn = profiler.clone().new_listener(&def).expect("malloc hook");
        let mut it = stack.into_iter();
        lstn.before(&module, &def, &[size], &mut it);
        lstn.after(&module, &def, &[address]);
    }

    /// An allocation reached through two plain frames yields one
    /// symbolized location per frame, named and lined from DWARF.
    #[test]
    fn allocation_stacks_symbolize_through_dwarf() {
        let symbols = symbolizer();
        let mem = MemoryProfiler::new(Arc::new(StackSource::Wasm), "app.wasm");

        record_malloc(
            &mem,
            10,
            0x4000,
            vec![
                Frame::new(FunctionIdent::guest("app", "malloc", 3), 0),
                Frame::new(FunctionIdent::guest("app", "f1", 4), 0x10c),
                Frame::new(FunctionIdent::guest("app", "nv", 5), 0x308),
            ],
        );

        let profile = mem.snapshot(1.0, &symbols);
        assert_eq!(profile.sample.len(), 1);
        assert_eq!(profile.sample[0].value, vec![1, 10]);
        assert_eq!(profile.sample[0].location_id.len(), 3);

        let string = |i: i64| profile.string_table[i as usize].as_str();
        let function_of = |line: &wasmscope::export::proto::Line| {
            profile.function.iter().find(|f| f.id == line.function_id).unwrap()
        };

        // Leaf location: no DWARF for pc 0, named after the runtime.
        let leaf = &profile.location[0];
        assert_eq!(string(function_of(&leaf.line[0]).name), "malloc");

        // Caller frames carry DWARF names and lines.
        let caller = &profile.location[1];
        assert_eq!(string(function_of(&caller.line[0]).name), "func1");
        assert_eq!(caller.line[0].line, 6);
        let outer = &profile.location[2];
        assert_eq!(string(function_of(&outer.line[0]).name), "fiction::novel");
    }

    /// An allocation at an inlined call site produces a single
    /// location whose Lines list the inlined body first, then the
    /// enclosing function at the call line.
    #[test]
    fn inlined_allocation_site_folds_into_one_location() {
        let symbols = symbolizer();
        let mem = MemoryProfiler::new(Arc::new(StackSource::Wasm), "app.wasm");

        record_malloc(
            &mem,
            30,
            0x5000,
            vec![Frame::new(FunctionIdent::guest("app", "f3", 6), 0x225)],
        );

        let profile = mem.snapshot(1.0, &symbols);
        assert_eq!(profile.sample.len(), 1);
        assert_eq!(profile.sample[0].value, vec![1, 30]);

        let location = &profile.location[0];
        assert_eq!(location.line.len(), 2, "one location carries both lines");

        let string = |i: i64| profile.string_table[i as usize].as_str();
        let name_of = |line: &wasmscope::export::proto::Line| {
            let f = profile.function.iter().find(|f| f.id == line.function_id).unwrap();
            string(f.name)
        };
        assert_eq!(name_of(&location.line[0]), "func31");
        assert_eq!(location.line[0].line, 29);
        assert_eq!(name_of(&location.line[1]), "func3");
        assert_eq!(location.line[1].line, 23);
    }
}
