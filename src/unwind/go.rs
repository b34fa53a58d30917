//! Unwinding of Go stacks in guest memory.
//!
//! This is the Go runtime's traceback algorithm, retargeted at a memory
//! object instead of the running program's own address space, and
//! stripped of the cases that cannot occur under GOARCH=wasm (no frame
//! pointers, instruction quantum 1, no cgo). Stack layout knowledge
//! comes from the pc-value tables of the pclntab; scheduler state (for
//! jumps between the system stack and a goroutine stack) comes from the
//! `g` and `m` structures reached through the wasm `g` global.

use log::debug;
use thiserror::Error;

use crate::domain::{MemoryAccessError, Ptr};
use crate::guest::{GuestMemory, MemoryView};
use crate::listener::{Frame, FunctionIdent};
use crate::symbolization::gosym::{elide_wrapper_calling, FuncId, FuncInfo, GoSymbols};

const PTR_SIZE: u64 = 8;

// Field offsets in the Go runtime's g and m structures, wasip1 layout.
const G_M: u64 = 48;
const G_SCHED_SP: u64 = 56;
const G_SCHED_PC: u64 = 64;
const G_SCHED_LR: u64 = 96;
const M_G0: u64 = 0;
const M_CURG: u64 = 144;

#[derive(Error, Debug)]
pub enum UnwindError {
    #[error(transparent)]
    Memory(#[from] MemoryAccessError),

    #[error("no function found for pc {0:#x}")]
    NoFunction(u64),

    #[error("unknown caller pc {0:#x}")]
    UnknownCallerPc(u64),

    #[error("unexpected SPWRITE function in non-innermost frame")]
    SpWrite,

    #[error("traceback stuck at pc {0:#x}")]
    Stuck(u64),
}

/// Error policy for a walk. Profiling walks run best-effort: errors
/// terminate the walk quietly. Strict mode is the GC-traversal policy
/// where an incomplete walk is a bug.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnwindMode {
    Strict,
    BestEffort,
}

/// Accessors over the guest memory for the runtime structures the
/// unwinder touches.
struct RtMem<'a> {
    g: GuestMemory<'a>,
}

impl<'a> RtMem<'a> {
    fn new(mem: &'a dyn MemoryView) -> Self {
        RtMem { g: GuestMemory::new(mem) }
    }

    fn deref_ptr(&self, p: Ptr) -> Result<Ptr, MemoryAccessError> {
        self.g.read_ptr(p)
    }

    fn g_m(&self, gp: Ptr) -> Result<Ptr, MemoryAccessError> {
        self.g.read_ptr(gp + G_M)
    }

    fn g_m_g0(&self, gp: Ptr) -> Result<Ptr, MemoryAccessError> {
        self.g.read_ptr(self.g_m(gp)? + M_G0)
    }

    fn g_m_curg(&self, gp: Ptr) -> Result<Ptr, MemoryAccessError> {
        self.g.read_ptr(self.g_m(gp)? + M_CURG)
    }

    fn g_sched_sp(&self, gp: Ptr) -> Result<Ptr, MemoryAccessError> {
        self.g.read_ptr(gp + G_SCHED_SP)
    }

    fn g_sched_pc(&self, gp: Ptr) -> Result<Ptr, MemoryAccessError> {
        self.g.read_ptr(gp + G_SCHED_PC)
    }

    fn g_sched_lr(&self, gp: Ptr) -> Result<Ptr, MemoryAccessError> {
        self.g.read_ptr(gp + G_SCHED_LR)
    }
}

/// One physical stack frame during the walk.
pub struct StkFrame<'a> {
    /// Function running in this frame; the outermost one if there is
    /// inlining.
    pub f: Option<FuncInfo<'a>>,
    /// PC within `f`. For frames below the innermost this is a return
    /// PC, one past the CALL instruction.
    pub pc: Ptr,
    /// PC where execution will continue in this frame, or 0 if it never
    /// will. Differs from `pc` only below a sigpanic-style injected
    /// call, where it is redirected at the deferreturn call site.
    pub continpc: Ptr,
    pub lr: Ptr,
    pub sp: Ptr,
    pub fp: Ptr,
}

/// Iterates the physical frames of a Go stack.
pub struct Unwinder<'a> {
    symbols: &'a GoSymbols,
    mem: RtMem<'a>,
    pub frame: StkFrame<'a>,
    g: Ptr,
    callee_func_id: FuncId,
    mode: UnwindMode,
    /// The innermost PC came from a trap rather than a call.
    trap: bool,
}

impl<'a> Unwinder<'a> {
    pub fn init_at(
        symbols: &'a GoSymbols,
        mem: &'a dyn MemoryView,
        pc0: Ptr,
        sp0: Ptr,
        lr0: Ptr,
        gp: Ptr,
        mode: UnwindMode,
    ) -> Result<Self, UnwindError> {
        let rtmem = RtMem::new(mem);
        let mut frame = StkFrame { f: None, pc: pc0, continpc: Ptr::NULL, lr: lr0, sp: sp0, fp: Ptr::NULL };

        // A zero PC is likely a call through a nil function value;
        // start in the caller's frame.
        if frame.pc.is_null() {
            frame.pc = rtmem.deref_ptr(frame.sp)?;
            frame.sp = frame.sp + PTR_SIZE;
        }

        let f = symbols
            .find_func(frame.pc.addr())
            .ok_or(UnwindError::NoFunction(frame.pc.addr()))?;
        frame.f = Some(f);

        let mut u = Unwinder {
            symbols,
            mem: rtmem,
            frame,
            g: gp,
            callee_func_id: FuncId::Normal,
            mode,
            trap: false,
        };
        u.resolve_internal(true)?;
        Ok(u)
    }

    pub fn valid(&self) -> bool {
        !self.frame.pc.is_null()
    }

    pub fn callee_func_id(&self) -> FuncId {
        self.callee_func_id
    }

    /// Fill in the frame's fp, lr and continpc from its fn, pc and sp,
    /// following system-stack transitions when they apply.
    fn resolve_internal(&mut self, innermost: bool) -> Result<(), UnwindError> {
        let Some(f) = self.frame.f else {
            self.finish();
            return Ok(());
        };
        if f.pcsp() == 0 {
            // No frame information: external function.
            self.finish();
            return Ok(());
        }

        let mut f = f;
        let mut flag = f.flag();

        if self.frame.fp.is_null() {
            // Jump over system stack transitions. Only attempted when
            // we are on g0 and a user goroutine exists, and the jump
            // stays on the same M.
            let curg = if self.g.is_null() { Ptr::NULL } else { self.mem.g_m_curg(self.g)? };
            // The jump must not switch M's: gp.m.curg.m == gp.m.
            let on_g0 = !self.g.is_null()
                && self.g == self.mem.g_m_g0(self.g)?
                && !curg.is_null()
                && self.mem.g_m(curg)? == self.mem.g_m(self.g)?;
            if on_g0 {
                match f.func_id() {
                    FuncId::Morestack => {
                        // morestack does not return normally; newstack
                        // gogo's to curg.sched. Match that.
                        let curg = self.mem.g_m_curg(self.g)?;
                        self.g = curg;
                        self.frame.pc = self.mem.g_sched_pc(curg)?;
                        let nf = self
                            .symbols
                            .find_func(self.frame.pc.addr())
                            .ok_or(UnwindError::NoFunction(self.frame.pc.addr()))?;
                        self.frame.f = Some(nf);
                        f = nf;
                        flag = f.flag();
                        self.frame.lr = self.mem.g_sched_lr(curg)?;
                        self.frame.sp = self.mem.g_sched_sp(curg)?;
                    }
                    FuncId::Systemstack => {
                        // systemstack returns normally; just follow the
                        // stack transition.
                        let curg = self.mem.g_m_curg(self.g)?;
                        self.g = curg;
                        self.frame.sp = self.mem.g_sched_sp(curg)?;
                        flag = crate::symbolization::gosym::FuncFlag(flag.0 & !2);
                    }
                    _ => {}
                }
            }

            let delta = self
                .symbols
                .func_sp_delta(&f, self.frame.pc.addr())
                .ok_or(UnwindError::UnknownCallerPc(self.frame.pc.addr()))?;
            self.frame.fp = self.frame.sp + delta as i64 as u64;
            // The wasm call instruction pushes the return PC before
            // entering the new function.
            self.frame.fp = self.frame.fp + PTR_SIZE;
        }

        if flag.top_frame() {
            // This function marks the top of the stack.
            self.frame.lr = Ptr::NULL;
        } else if flag.sp_write() {
            // The function writes SP in ways the spdelta table cannot
            // describe; we may not even be on the stack we think we
            // are.
            match self.mode {
                UnwindMode::BestEffort => self.frame.lr = Ptr::NULL,
                UnwindMode::Strict => {
                    // A GC-style traversal only tolerates SPWRITE in
                    // the innermost frame, before the function had a
                    // chance to touch SP.
                    if !innermost {
                        return Err(UnwindError::SpWrite);
                    }
                }
            }
        } else if self.frame.lr.is_null() {
            self.frame.lr = self.mem.deref_ptr(self.frame.fp - PTR_SIZE)?;
        }

        // Continuation PC: normally the frame's pc, but below a
        // sigpanic the frame stopped at a trap, and it resumes (if at
        // all) at the deferreturn call site. The +1 offsets the -1 the
        // consumer applies to land back inside the CALL instruction.
        self.frame.continpc = self.frame.pc;
        if self.callee_func_id == FuncId::Sigpanic {
            if f.deferreturn() != 0 {
                self.frame.continpc =
                    Ptr(self.symbols.func_entry(&f) + u64::from(f.deferreturn()) + 1);
            } else {
                self.frame.continpc = Ptr::NULL;
            }
        }

        Ok(())
    }

    pub fn next(&mut self) -> Result<(), UnwindError> {
        let Some(f) = self.frame.f else {
            self.finish();
            return Ok(());
        };

        // Do not unwind past the bottom of the stack.
        if self.frame.lr.is_null() {
            self.finish();
            return Ok(());
        }

        let Some(flr) = self.symbols.find_func(self.frame.lr.addr()) else {
            // A profiling signal can land at just the wrong time; in
            // best-effort mode stopping early is fine. A strict
            // traversal must see everything.
            if self.mode == UnwindMode::Strict {
                return Err(UnwindError::UnknownCallerPc(self.frame.lr.addr()));
            }
            debug!("go unwind: unknown caller pc {:#x}", self.frame.lr.addr());
            self.frame.lr = Ptr::NULL;
            self.finish();
            return Ok(());
        };

        if self.frame.pc == self.frame.lr && self.frame.sp == self.frame.fp {
            // The next frame is identical to this one; no progress.
            if self.mode == UnwindMode::Strict {
                return Err(UnwindError::Stuck(self.frame.pc.addr()));
            }
            debug!("go unwind: traceback stuck at pc {:#x}", self.frame.pc.addr());
            self.finish();
            return Ok(());
        }

        self.trap = f.func_id().is_injected();
        self.callee_func_id = f.func_id();
        self.frame.f = Some(flr);
        self.frame.pc = self.frame.lr;
        self.frame.lr = Ptr::NULL;
        self.frame.sp = self.frame.fp;
        self.frame.fp = Ptr::NULL;

        self.resolve_internal(false)
    }

    /// The PC to use for symbolizing the current frame: the last
    /// instruction executed in it. A return PC points past the CALL, so
    /// back up by one, unless the PC is a trap address or the function
    /// entry itself.
    pub fn sym_pc(&self) -> Ptr {
        let entry = self.frame.f.map(|f| self.symbols.func_entry(&f)).unwrap_or(0);
        if !self.trap && self.frame.pc.addr() > entry {
            self.frame.pc - 1
        } else {
            self.frame.pc
        }
    }

    fn finish(&mut self) {
        self.frame.pc = Ptr::NULL;
    }
}

/// Iterator over the logical frames of the current goroutine's stack,
/// with wrapper functions elided the way the Go runtime hides them from
/// user tracebacks.
pub struct GoStackWalker<'a> {
    symbols: &'a GoSymbols,
    unwinder: Unwinder<'a>,
    module: std::sync::Arc<str>,
    empty_name: std::sync::Arc<str>,
    failed: bool,
}

impl<'a> GoStackWalker<'a> {
    /// Begin a walk at the entry of the instrumented function. The
    /// stack pointer and goroutine come from the module's wasm globals.
    pub fn start(
        symbols: &'a GoSymbols,
        mem: &'a dyn MemoryView,
        def: &FunctionIdent,
        sp: u64,
        g: u64,
    ) -> Result<Self, UnwindError> {
        let pc0 = Ptr(symbols.pc_for_func_index(def.index));
        let unwinder = Unwinder::init_at(
            symbols,
            mem,
            pc0,
            Ptr(sp),
            Ptr::NULL,
            Ptr(g),
            UnwindMode::BestEffort,
        )?;
        Ok(GoStackWalker {
            symbols,
            unwinder,
            module: def.module.clone(),
            empty_name: std::sync::Arc::from(""),
            failed: false,
        })
    }

    /// True when the walk hit an invalid guest memory read; the partial
    /// trace must be discarded.
    pub fn failed(&self) -> bool {
        self.failed
    }
}

impl Iterator for GoStackWalker<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        loop {
            if self.failed || !self.unwinder.valid() {
                return None;
            }
            let f = self.unwinder.frame.f?;
            let pc = self.unwinder.sym_pc().addr();

            let elide = f.func_id() == FuncId::Wrapper
                && elide_wrapper_calling(self.unwinder.callee_func_id());

            let frame = (!elide).then(|| {
                let fid = self.symbols.func_index_for_pc(pc);
                Frame::new(
                    FunctionIdent {
                        module: self.module.clone(),
                        name: self.empty_name.clone(),
                        debug_name: self.empty_name.clone(),
                        index: fid,
                        host: false,
                    },
                    pc,
                )
            });

            if let Err(err) = self.unwinder.next() {
                match err {
                    UnwindError::Memory(e) => {
                        debug!("go unwind: {e}; discarding trace");
                        self.failed = true;
                    }
                    other => debug!("go unwind: {other}"),
                }
                self.unwinder.finish();
            }

            if frame.is_some() {
                return frame;
            }
        }
    }
}
