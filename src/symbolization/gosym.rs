//! Go symbol tables, recovered from the Wasm data section.
//!
//! A Go binary carries its own symbolization machinery: the `pclntab`
//! (program-counter/line table) and the `firstmoduledata` structure
//! whose slices index into it. Neither is exported by the wasm module,
//! so both are located by scanning the data segments: the pclntab by
//! its Go 1.20 magic header, the moduledata by looking for a pointer
//! pair that references the pclntab.
//!
//! All table slices are snapshotted into host memory when the module is
//! prepared; they are read on every symbolization and stack-walk step.
//! PCs use the Go wasm linker convention: the upper 48 bits hold the
//! function's index, the low 16 bits the instruction offset within it.

use log::debug;

use crate::domain::{BinaryError, MemoryAccessError, Ptr};
use crate::guest::GuestMemory;
use crate::listener::Frame;
use crate::symbolization::{Location, Symbolizer};
use crate::wasm::{DataSection, Vmem};

/// Magic prefix of the Go 1.20 pclntab header: the 1.20 magic number,
/// two bytes of padding, instruction quantum 1 and pointer size 8.
pub const PCLNTAB_MAGIC: [u8; 8] = [0xf1, 0xff, 0xff, 0xff, 0x00, 0x00, 0x01, 0x08];

const PTR_SIZE: u64 = 8;
const PC_QUANTUM: u64 = 1;

// findfunctab geometry, from the Go runtime.
const MIN_FUNC: u64 = 16;
const PC_BUCKET_SIZE: u64 = 256 * MIN_FUNC;
const SUB_BUCKETS: u64 = 16;
const FIND_FUNC_BUCKET_SIZE: u64 = 4 + SUB_BUCKETS;

// Linker-assigned base for wasm function PCs.
const FUNC_VALUE_OFFSET: u64 = 0x1000;

pub(crate) const FUNCDATA_INLTREE: u8 = 3;
pub(crate) const PCDATA_INLTREE_INDEX: u32 = 2;

/// Special function identifiers assigned by the Go compiler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FuncId {
    Normal,
    Abort,
    Asmcgocall,
    AsyncPreempt,
    Cgocallback,
    DebugCallV2,
    GcBgMarkWorker,
    Goexit,
    Gogo,
    Gopanic,
    HandleAsyncEvent,
    Mcall,
    Morestack,
    Mstart,
    Panicwrap,
    Rt0Go,
    Runfinq,
    RuntimeMain,
    Sigpanic,
    Systemstack,
    SystemstackSwitch,
    Wrapper,
}

impl FuncId {
    pub fn from_raw(raw: u8) -> FuncId {
        use FuncId::*;
        match raw {
            1 => Abort,
            2 => Asmcgocall,
            3 => AsyncPreempt,
            4 => Cgocallback,
            5 => DebugCallV2,
            6 => GcBgMarkWorker,
            7 => Goexit,
            8 => Gogo,
            9 => Gopanic,
            10 => HandleAsyncEvent,
            11 => Mcall,
            12 => Morestack,
            13 => Mstart,
            14 => Panicwrap,
            15 => Rt0Go,
            16 => Runfinq,
            17 => RuntimeMain,
            18 => Sigpanic,
            19 => Systemstack,
            20 => SystemstackSwitch,
            21 => Wrapper,
            _ => Normal,
        }
    }

    /// Calls injected by the runtime rather than compiled CALL
    /// instructions; the frame above them needs trap-style PC handling.
    pub fn is_injected(self) -> bool {
        matches!(self, FuncId::Sigpanic | FuncId::AsyncPreempt | FuncId::DebugCallV2)
    }
}

/// Whether a wrapper function should be hidden from user-visible stacks,
/// given the function it called. Wrappers that forwarded to a
/// panic-family function stay visible.
pub fn elide_wrapper_calling(callee: FuncId) -> bool {
    !matches!(callee, FuncId::Gopanic | FuncId::Sigpanic | FuncId::Panicwrap)
}

/// Function flags from the Go compiler.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct FuncFlag(pub u8);

impl FuncFlag {
    /// The function marks the top of a goroutine stack.
    pub fn top_frame(self) -> bool {
        self.0 & 1 != 0
    }

    /// The function writes SP in ways the spdelta table cannot encode.
    pub fn sp_write(self) -> bool {
        self.0 & 2 != 0
    }
}

/// One `functab` entry: function entry offset and the offset of its
/// `_func` record inside `pclntable`.
#[derive(Clone, Copy, Debug)]
struct FuncTabEntry {
    entry_off: u32,
    func_off: u32,
}

#[derive(Clone, Copy, Debug)]
struct FindFuncBucket {
    idx: u32,
    subbuckets: [u8; SUB_BUCKETS as usize],
}

#[derive(Clone, Copy, Debug)]
struct TextSect {
    vaddr: u64,
    end: u64,
    baseaddr: u64,
}

/// Layout of the `_func` record (Go 1.20). Fixed-offset fields followed
/// by `npcdata` u32 pcdata offsets and `nfuncdata` u32 funcdata offsets.
const FUNC_FIXED_SIZE: usize = 44;

/// A view of one `_func` record inside the snapshotted `pclntable`.
#[derive(Clone, Copy)]
pub struct FuncInfo<'a> {
    raw: &'a [u8],
}

impl<'a> FuncInfo<'a> {
    fn u32_at(&self, off: usize) -> u32 {
        u32::from_le_bytes(self.raw[off..off + 4].try_into().unwrap())
    }

    pub fn entry_off(&self) -> u32 {
        self.u32_at(0)
    }

    pub fn name_off(&self) -> i32 {
        self.u32_at(4) as i32
    }

    pub fn deferreturn(&self) -> u32 {
        self.u32_at(12)
    }

    pub fn pcsp(&self) -> u32 {
        self.u32_at(16)
    }

    pub fn pcfile(&self) -> u32 {
        self.u32_at(20)
    }

    pub fn pcln(&self) -> u32 {
        self.u32_at(24)
    }

    pub fn npcdata(&self) -> u32 {
        self.u32_at(28)
    }

    pub fn cu_offset(&self) -> u32 {
        self.u32_at(32)
    }

    pub fn start_line(&self) -> i32 {
        self.u32_at(36) as i32
    }

    pub fn func_id(&self) -> FuncId {
        FuncId::from_raw(self.raw[40])
    }

    pub fn flag(&self) -> FuncFlag {
        FuncFlag(self.raw[41])
    }

    pub fn nfuncdata(&self) -> u8 {
        self.raw[43]
    }

    /// Offset into `pctab` of the i-th pcdata table, or 0 when absent.
    pub fn pcdata_offset(&self, table: u32) -> u32 {
        if table >= self.npcdata() {
            return 0;
        }
        self.u32_at(FUNC_FIXED_SIZE + table as usize * 4)
    }

    /// Offset of the i-th funcdata relative to `gofunc`, or `u32::MAX`
    /// when absent.
    pub fn funcdata_offset(&self, i: u8) -> u32 {
        if i >= self.nfuncdata() {
            return u32::MAX;
        }
        self.u32_at(FUNC_FIXED_SIZE + self.npcdata() as usize * 4 + i as usize * 4)
    }
}

/// One entry of the `FUNCDATA_InlTree` array.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InlinedCall {
    pub func_id: FuncId,
    pub name_off: i32,
    pub parent_pc: i32,
}

const INLINED_CALL_SIZE: u64 = 16;

/// Owned copy of the module's data segments, for the pieces of Go
/// metadata that are addressed by pointer at symbolization time (the
/// inline trees hang off `gofunc` rather than living in any moduledata
/// slice).
struct StaticData {
    segments: Vec<(u64, Vec<u8>)>,
}

impl StaticData {
    fn snapshot(data: &DataSection<'_>) -> StaticData {
        let mut segments: Vec<(u64, Vec<u8>)> =
            data.segments().iter().map(|s| (s.vaddr, s.data.to_vec())).collect();
        segments.sort_by_key(|&(vaddr, _)| vaddr);
        StaticData { segments }
    }

    fn bytes_at(&self, addr: u64, size: usize) -> Option<&[u8]> {
        let pos = self.segments.partition_point(|&(vaddr, _)| vaddr <= addr).checked_sub(1)?;
        let (vaddr, data) = &self.segments[pos];
        let start = usize::try_from(addr - vaddr).ok()?;
        data.get(start..start.checked_add(size)?)
    }

    fn u8_at(&self, addr: u64) -> Option<u8> {
        self.bytes_at(addr, 1).map(|b| b[0])
    }

    fn u32_at(&self, addr: u64) -> Option<u32> {
        self.bytes_at(addr, 4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }
}

struct ModuleData {
    minpc: u64,
    maxpc: u64,
    text: u64,
    etext: u64,
    gofunc: u64,
    funcnametab: Vec<u8>,
    cutab: Vec<u32>,
    filetab: Vec<u8>,
    pctab: Vec<u8>,
    pclntable: Vec<u8>,
    ftab: Vec<FuncTabEntry>,
    findfunctab: Vec<FindFuncBucket>,
    textsectmap: Vec<TextSect>,
}

/// Go symbolization support for one module.
pub struct GoSymbols {
    md: ModuleData,
    data: StaticData,
    imported: u32,
}

impl GoSymbols {
    /// Locate and snapshot the pclntab and moduledata. Fails when either
    /// structure is missing or has an unsupported layout; a module that
    /// declares itself Go (via `go:buildid`) without a readable pclntab
    /// cannot be profiled at all.
    pub fn parse(data: &DataSection<'_>, imported: u32) -> Result<Self, BinaryError> {
        let pclntab_addr = *data.find(&PCLNTAB_MAGIC).first().ok_or(BinaryError::PclntabNotFound)?;

        // Rebuild enough virtual memory to read the header words. The
        // header may straddle segment boundaries, hence the incremental
        // fill rather than a single segment read.
        let (mut cursor, head) = data.cursor_at(pclntab_addr)?;
        let mut vm = Vmem::new(pclntab_addr);
        vm.copy_at_address(pclntab_addr, head)?;
        let mut word = |index: u64| -> Result<u64, BinaryError> {
            let addr = pclntab_addr + 8 + index * PTR_SIZE;
            vm.fill_until(&mut cursor, addr + 7)?;
            vm.u64_at(addr).ok_or(BinaryError::SegmentExhausted { addr })
        };

        let nfunctab = word(0)?;
        let _nfiletab = word(1)?;
        let _text_start = word(2)?;
        let funcnametab_addr = pclntab_addr + word(3)?;
        let cutab_addr = pclntab_addr + word(4)?;
        let filetab_addr = pclntab_addr + word(5)?;
        let _pctab_addr = pclntab_addr + word(6)?;
        let _pcln_addr = pclntab_addr + word(7)?;

        let md_addr = find_moduledata(data, pclntab_addr, funcnametab_addr, cutab_addr, filetab_addr)?;
        debug!("gosym: pclntab at {pclntab_addr:#x}, moduledata at {md_addr:#x}");

        let md = read_moduledata(data, md_addr)?;
        debug!(
            "gosym: text {:#x}..{:#x}, {} functions, {} text sections",
            md.text,
            md.etext,
            nfunctab,
            md.textsectmap.len()
        );
        if md.ftab.len() as u64 != nfunctab + 1 {
            return Err(BinaryError::UnsupportedPclntab(format!(
                "functab has {} entries, header says {}",
                md.ftab.len(),
                nfunctab + 1,
            )));
        }

        Ok(GoSymbols { md, data: StaticData::snapshot(data), imported })
    }

    /// Number of imported functions, part of the PC mapping.
    pub fn imported_functions(&self) -> u32 {
        self.imported
    }

    /// Index of the wasm function containing `pc`.
    pub fn func_index_for_pc(&self, pc: u64) -> u32 {
        ((pc >> 16) + u64::from(self.imported)).wrapping_sub(FUNC_VALUE_OFFSET) as u32
    }

    /// Entry PC of the wasm function with index `fid`.
    pub fn pc_for_func_index(&self, fid: u32) -> u64 {
        (FUNC_VALUE_OFFSET + u64::from(fid) - u64::from(self.imported)) << 16
    }

    /// Find the function containing `pc` using the two-level
    /// findfunctab index, mirroring the runtime's `findfunc`.
    pub fn find_func(&self, pc: u64) -> Option<FuncInfo<'_>> {
        if pc < self.md.minpc || pc >= self.md.maxpc {
            return None;
        }
        let pc_off = self.text_off(pc)?;
        let x = u64::from(pc_off) + self.md.text - self.md.minpc;
        let b = (x / PC_BUCKET_SIZE) as usize;
        let i = ((x % PC_BUCKET_SIZE) / (PC_BUCKET_SIZE / SUB_BUCKETS)) as usize;

        let ffb = self.md.findfunctab.get(b)?;
        let mut idx = (ffb.idx as usize).saturating_add(ffb.subbuckets[i] as usize);
        idx = idx.min(self.md.ftab.len().saturating_sub(2));
        while idx + 1 < self.md.ftab.len() && self.md.ftab[idx + 1].entry_off <= pc_off {
            idx += 1;
        }
        // The final functab entry is the end-of-text sentinel, never a
        // function.
        if idx + 1 == self.md.ftab.len() {
            idx -= 1;
        }
        self.func_at(self.md.ftab[idx].func_off)
    }

    fn func_at(&self, func_off: u32) -> Option<FuncInfo<'_>> {
        let start = func_off as usize;
        let raw = self.md.pclntable.get(start..)?;
        (raw.len() >= FUNC_FIXED_SIZE).then_some(FuncInfo { raw })
    }

    /// Entry PC of a function, reversing the text-offset mapping.
    pub fn func_entry(&self, f: &FuncInfo<'_>) -> u64 {
        self.text_addr(f.entry_off())
    }

    fn text_off(&self, pc: u64) -> Option<u32> {
        let mut res = pc.wrapping_sub(self.md.text);
        if self.md.textsectmap.len() > 1 {
            for (i, sect) in self.md.textsectmap.iter().enumerate() {
                let last = i == self.md.textsectmap.len() - 1;
                if pc >= sect.baseaddr && (pc < sect.end || (last && pc == sect.end)) {
                    res = pc - sect.baseaddr + (sect.vaddr - self.md.text);
                    break;
                }
            }
        }
        u32::try_from(res).ok()
    }

    fn text_addr(&self, off32: u32) -> u64 {
        let off = u64::from(off32);
        let mut res = self.md.text + off;
        if self.md.textsectmap.len() > 1 {
            for (i, sect) in self.md.textsectmap.iter().enumerate() {
                let last = i == self.md.textsectmap.len() - 1;
                if off >= sect.vaddr && (off < sect.end || (last && off == sect.end)) {
                    res = sect.baseaddr + off - sect.vaddr;
                }
            }
        }
        res
    }

    /// Function name from its offset in `funcnametab`.
    pub fn func_name(&self, name_off: i32) -> String {
        if name_off < 0 {
            return String::new();
        }
        cstr_at(&self.md.funcnametab, name_off as usize)
    }

    /// Decode a pc-value table starting at `off` in `pctab` for
    /// `target_pc`, returning the value in effect at that PC. `None`
    /// when the function has no such table or the PC is out of range.
    pub fn pc_value(&self, off: u32, f: &FuncInfo<'_>, target_pc: u64) -> Option<i32> {
        if off == 0 {
            return None;
        }
        let mut p = self.md.pctab.get(off as usize..)?;
        let mut pc = self.func_entry(f);
        let mut val: i32 = -1;
        let mut first = true;
        loop {
            let (uvdelta, n) = read_varint(p)?;
            if uvdelta == 0 && !first {
                return None;
            }
            p = p.get(n..)?;
            val = val.wrapping_add(((uvdelta & 1).wrapping_neg() ^ (uvdelta >> 1)) as i32);
            let (pcdelta, n) = read_varint(p)?;
            p = p.get(n..)?;
            pc += u64::from(pcdelta) * PC_QUANTUM;
            if target_pc < pc {
                return Some(val);
            }
            first = false;
        }
    }

    /// Stack-pointer delta at `pc`, used to derive the caller's frame
    /// pointer during unwinding.
    pub fn func_sp_delta(&self, f: &FuncInfo<'_>, pc: u64) -> Option<i32> {
        self.pc_value(f.pcsp(), f, pc)
    }

    fn pc_data_value(&self, f: &FuncInfo<'_>, table: u32, pc: u64) -> i32 {
        let off = f.pcdata_offset(table);
        if off == 0 {
            return -1;
        }
        self.pc_value(off, f, pc).unwrap_or(-1)
    }

    /// Address of the i-th funcdata blob, or 0 when the function has
    /// none.
    fn funcdata(&self, f: &FuncInfo<'_>, i: u8) -> u64 {
        let off = f.funcdata_offset(i);
        if off == u32::MAX || self.md.gofunc == 0 {
            return 0;
        }
        self.md.gofunc + u64::from(off)
    }

    fn inlined_call(&self, tree: u64, index: i32) -> Option<InlinedCall> {
        let base = tree + index as u64 * INLINED_CALL_SIZE;
        Some(InlinedCall {
            func_id: FuncId::from_raw(self.data.u8_at(base)?),
            name_off: self.data.u32_at(base + 4)? as i32,
            parent_pc: self.data.u32_at(base + 8)? as i32,
        })
    }

    /// File and line at `pc` within `f`. The file defaults to "?" like
    /// the Go runtime when the tables don't cover the PC.
    pub fn file_line(&self, f: &FuncInfo<'_>, pc: u64) -> (String, i64) {
        let line = self.pc_value(f.pcln(), f, pc).map_or(0, i64::from);
        let file = self
            .pc_value(f.pcfile(), f, pc)
            .filter(|&v| v >= 0)
            .and_then(|v| self.md.cutab.get(f.cu_offset() as usize + v as usize).copied())
            .filter(|&off| off != u32::MAX)
            .map(|off| cstr_at(&self.md.filetab, off as usize))
            .unwrap_or_else(|| "?".to_string());
        (file, line)
    }
}

impl Symbolizer for GoSymbols {
    /// Expand `pc` into one location per logical call: the innermost
    /// inlined call first, then its parents out to the physical
    /// function. Wrapper functions are skipped unless they called into
    /// the panic machinery.
    fn locations_for(&self, frame: &Frame) -> Vec<Location> {
        let Some(f) = self.find_func(frame.pc) else { return Vec::new() };

        let inl_tree = self.funcdata(&f, FUNCDATA_INLTREE);
        let mut pc = frame.pc;
        let mut index = if inl_tree != 0 {
            self.pc_data_value(&f, PCDATA_INLTREE_INDEX, pc)
        } else {
            -1
        };

        let mut out = Vec::new();
        let mut callee = FuncId::Normal;
        loop {
            let call = if index >= 0 { self.inlined_call(inl_tree, index) } else { None };
            let (name_off, func_id) = match &call {
                Some(c) => (c.name_off, c.func_id),
                None => (f.name_off(), f.func_id()),
            };

            if !(func_id == FuncId::Wrapper && elide_wrapper_calling(callee)) {
                let name = self.func_name(name_off);
                let (file, line) = self.file_line(&f, pc);
                out.push(Location {
                    file,
                    line,
                    column: 0,
                    inlined: call.is_some(),
                    human_name: name.clone(),
                    stable_name: name,
                });
            }
            callee = func_id;

            let Some(call) = call else { break };
            pc = self.func_entry(&f).wrapping_add(call.parent_pc as i64 as u64);
            index = self.pc_data_value(&f, PCDATA_INLTREE_INDEX, pc);
        }
        out
    }

    fn name(&self) -> &'static str {
        "pclntab"
    }
}

fn find_moduledata(
    data: &DataSection<'_>,
    pclntab_addr: u64,
    funcnametab_addr: u64,
    cutab_addr: u64,
    filetab_addr: u64,
) -> Result<u64, BinaryError> {
    let mut needle = [0u8; 16];
    needle[..8].copy_from_slice(&pclntab_addr.to_le_bytes());
    needle[8..].copy_from_slice(&funcnametab_addr.to_le_bytes());

    let g = GuestMemory::new(data);
    for candidate in data.find(&needle) {
        let cutab = g.read_u64(Ptr(candidate + 32));
        let filetab = g.read_u64(Ptr(candidate + 56));
        match (cutab, filetab) {
            (Ok(c), Ok(f)) if c == cutab_addr && f == filetab_addr => return Ok(candidate),
            _ => continue,
        }
    }
    Err(BinaryError::ModuledataNotFound)
}

/// Dereference the moduledata slices into host memory. They sit on the
/// symbolization and unwinding hot paths, so the indirection through
/// guest addresses is paid once here.
fn read_moduledata(data: &DataSection<'_>, md: u64) -> Result<ModuleData, MemoryAccessError> {
    let g = GuestMemory::new(data);
    let base = Ptr(md);

    let funcnametab = g.read_go_byte_slice(base + 8)?;
    let cutab = g.read_go_u32_slice(base + 32)?;
    let filetab = g.read_go_byte_slice(base + 56)?;
    let pctab = g.read_go_byte_slice(base + 80)?;
    let pclntable = g.read_go_byte_slice(base + 104)?;

    let (ftab_ptr, ftab_len) = g.read_go_slice_header(base + 128)?;
    let mut ftab = Vec::with_capacity(ftab_len as usize);
    for i in 0..u64::from(ftab_len) {
        let p = ftab_ptr + i * 8;
        ftab.push(FuncTabEntry { entry_off: g.read_u32(p)?, func_off: g.read_u32(p + 4)? });
    }

    let findfunctab_ptr = g.read_ptr(base + 152)?;
    let minpc = g.read_u64(base + 160)?;
    let maxpc = g.read_u64(base + 168)?;
    let text = g.read_u64(base + 176)?;
    let etext = g.read_u64(base + 184)?;
    let gofunc = g.read_u64(base + 320)?;

    let nbuckets = (maxpc.saturating_sub(minpc)) / PC_BUCKET_SIZE + 1;
    let mut findfunctab = Vec::with_capacity(nbuckets as usize);
    for b in 0..nbuckets {
        let p = findfunctab_ptr + b * FIND_FUNC_BUCKET_SIZE;
        let idx = g.read_u32(p)?;
        let mut subbuckets = [0u8; SUB_BUCKETS as usize];
        for (i, slot) in subbuckets.iter_mut().enumerate() {
            *slot = g.read_u8(p + 4 + i as u64)?;
        }
        findfunctab.push(FindFuncBucket { idx, subbuckets });
    }

    let (sect_ptr, sect_len) = g.read_go_slice_header(base + 328)?;
    let mut textsectmap = Vec::with_capacity(sect_len as usize);
    for i in 0..u64::from(sect_len) {
        let p = sect_ptr + i * 24;
        textsectmap.push(TextSect {
            vaddr: g.read_u64(p)?,
            end: g.read_u64(p + 8)?,
            baseaddr: g.read_u64(p + 16)?,
        });
    }

    Ok(ModuleData {
        minpc,
        maxpc,
        text,
        etext,
        gofunc,
        funcnametab,
        cutab,
        filetab,
        pctab,
        pclntable,
        ftab,
        findfunctab,
        textsectmap,
    })
}

fn cstr_at(table: &[u8], off: usize) -> String {
    let Some(tail) = table.get(off..) else { return String::new() };
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    String::from_utf8_lossy(&tail[..end]).into_owned()
}

/// Read a Go pc-value table varint (LEB128, 32-bit).
fn read_varint(p: &[u8]) -> Option<(u32, usize)> {
    let mut v: u32 = 0;
    let mut shift = 0u32;
    for (n, &b) in p.iter().enumerate() {
        v |= u32::from(b & 0x7f) << (shift & 31);
        if b & 0x80 == 0 {
            return Some((v, n + 1));
        }
        shift += 7;
    }
    None
}
