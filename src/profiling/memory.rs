//! Memory profiling through allocator instrumentation.
//!
//! The guest's allocation functions are hooked by name: the C family
//! (`malloc`, `calloc`, `realloc`, `free`), TinyGo's `runtime.alloc`
//! and Go's `runtime.mallocgc`. Allocation counters are cumulative
//! (`alloc_objects`/`alloc_space`); optionally a map of live
//! allocations keyed by guest address supports
//! `inuse_objects`/`inuse_space`. Frees remove from the live map but
//! never decrement the cumulative counters.
//!
//! `runtime.mallocgc` never reveals the returned pointer to listeners,
//! so Go in-use accounting is incomplete and cannot observe frees done
//! by the garbage collector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use log::debug;

use crate::domain::{ProfileError, Ptr};
use crate::export::{build_profile, proto, ProfileMeta};
use crate::guest::{GuestMemory, ModuleAccess};
use crate::listener::{FunctionIdent, FunctionListener, ListenerFactory, StackIter};
use crate::profiling::{StackCounterMap, StackTrace};
use crate::symbolization::Symbolizer;
use crate::unwind::StackSource;

pub const ALLOC_SAMPLE_TYPES: [(&str, &str); 2] =
    [("alloc_objects", "count"), ("alloc_space", "bytes")];
pub const INUSE_SAMPLE_TYPES: [(&str, &str); 4] = [
    ("alloc_objects", "count"),
    ("alloc_space", "bytes"),
    ("inuse_objects", "count"),
    ("inuse_space", "bytes"),
];

/// The allocator functions the profiler knows how to observe.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AllocatorHook {
    /// `malloc(size)` and TinyGo's `runtime.alloc(size, ...)`.
    Malloc,
    /// `calloc(count, size)`.
    Calloc,
    /// `realloc(ptr, size)`: frees `ptr`, allocates `size`.
    Realloc,
    /// `free(ptr)`.
    Free,
    /// Go's `runtime.mallocgc`; the size lives in the guest stack
    /// frame, the returned address is not observable.
    GoMallocgc,
}

/// Name of every guest function the memory profiler instruments, with
/// the hook applied to it. Used by the factory and surfaced by the
/// inspection tool.
pub const ALLOCATOR_FUNCTIONS: [(&str, &str); 6] = [
    ("malloc", "c"),
    ("calloc", "c"),
    ("realloc", "c"),
    ("free", "c"),
    ("runtime.alloc", "tinygo"),
    ("runtime.mallocgc", "go"),
];

fn hook_for(name: &str) -> Option<AllocatorHook> {
    match name {
        "malloc" | "runtime.alloc" => Some(AllocatorHook::Malloc),
        "calloc" => Some(AllocatorHook::Calloc),
        "realloc" => Some(AllocatorHook::Realloc),
        "free" => Some(AllocatorHook::Free),
        "runtime.mallocgc" => Some(AllocatorHook::GoMallocgc),
        _ => None,
    }
}

/// Instruments well-known allocator functions and aggregates allocation
/// samples per stack.
#[derive(Clone)]
pub struct MemoryProfiler {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    source: Arc<StackSource>,
    module: Arc<str>,
    track_inuse: AtomicBool,
    started_at: SystemTime,
}

#[derive(Default)]
struct State {
    alloc: StackCounterMap,
    inuse: HashMap<u32, Allocation>,
    /// One entry per outstanding hooked call.
    pending: Vec<PendingCall>,
    traces: Vec<StackTrace>,
}

#[derive(Clone, Copy, Debug)]
struct Allocation {
    stack_key: u64,
    size: u64,
}

struct PendingCall {
    hook: AllocatorHook,
    size: i64,
    /// Address freed by this call (`free`, and `realloc`'s old block).
    freed: Option<u32>,
    trace: Option<StackTrace>,
}

impl MemoryProfiler {
    pub fn new(source: Arc<StackSource>, module: impl Into<Arc<str>>) -> Self {
        MemoryProfiler {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                source,
                module: module.into(),
                track_inuse: AtomicBool::new(false),
                started_at: SystemTime::now(),
            }),
        }
    }

    /// Track live allocations so snapshots also carry
    /// `inuse_objects`/`inuse_space`. Must be set before
    /// instrumentation begins.
    pub fn set_inuse_tracking(&self, enable: bool) {
        self.inner.track_inuse.store(enable, Ordering::Relaxed);
    }

    fn inuse_enabled(&self) -> bool {
        self.inner.track_inuse.load(Ordering::Relaxed)
    }

    /// Build a snapshot of the allocation counters. Counters keep
    /// accumulating afterwards; memory profiles are cumulative from
    /// module start.
    pub fn snapshot(&self, sample_rate: f64, symbols: &dyn Symbolizer) -> proto::Profile {
        let inuse_enabled = self.inuse_enabled();
        let state = self.inner.state.lock().unwrap();

        // Fold the live allocations per stack key.
        let mut live: HashMap<u64, (i64, i64)> = HashMap::new();
        if inuse_enabled {
            for alloc in state.inuse.values() {
                let entry = live.entry(alloc.stack_key).or_default();
                entry.0 += 1;
                entry.1 += alloc.size as i64;
            }
        }

        let value_types: &[(&str, &str)] =
            if inuse_enabled { &INUSE_SAMPLE_TYPES } else { &ALLOC_SAMPLE_TYPES };
        let ratios = [1.0 / sample_rate, 1.0 / sample_rate, 1.0 / sample_rate, 1.0 / sample_rate];

        let samples = state.alloc.iter().map(|(key, counter)| {
            let mut values = vec![counter.count(), counter.total()];
            if inuse_enabled {
                let (objects, space) = live.get(&key).copied().unwrap_or_default();
                values.push(objects);
                values.push(space);
            }
            (counter.stack(), values)
        });

        let meta = ProfileMeta {
            start: self.inner.started_at,
            duration: self.inner.started_at.elapsed().unwrap_or_default(),
            value_types,
            ratios: &ratios[..value_types.len()],
            mapping_file: &self.inner.module,
        };
        build_profile(symbols, samples, &meta)
    }

    /// Snapshot and serialize in one step.
    pub fn write_snapshot(
        &self,
        path: &std::path::Path,
        sample_rate: f64,
        symbols: &dyn Symbolizer,
    ) -> Result<(), ProfileError> {
        crate::export::write_profile(path, &self.snapshot(sample_rate, symbols))
    }

    pub fn name(&self) -> &'static str {
        "allocs"
    }

    pub fn description(&self) -> &'static str {
        "Sampled allocations performed by the wasm guest since module start."
    }

    #[cfg(test)]
    fn live_allocation(&self, addr: u32) -> Option<(u64, u64)> {
        let state = self.inner.state.lock().unwrap();
        state.inuse.get(&addr).map(|a| (a.stack_key, a.size))
    }
}

impl ListenerFactory for MemoryProfiler {
    fn new_listener(&self, def: &FunctionIdent) -> Option<Box<dyn FunctionListener>> {
        let hook = hook_for(&def.name)?;
        Some(Box::new(MemListener { inner: self.inner.clone(), hook }))
    }
}

struct MemListener {
    inner: Arc<Inner>,
    hook: AllocatorHook,
}

impl MemListener {
    /// The size requested by the hooked call. All sizes and addresses
    /// are unsigned 32-bit values in the wasm ABI.
    fn request_size(&self, module: &dyn ModuleAccess, params: &[u64]) -> Option<i64> {
        let arg = |i: usize| params.get(i).map(|&v| i64::from(v as u32));
        match self.hook {
            AllocatorHook::Malloc => arg(0),
            AllocatorHook::Calloc => Some(arg(0)? * arg(1)?),
            AllocatorHook::Realloc => arg(1),
            AllocatorHook::Free => Some(0),
            AllocatorHook::GoMallocgc => {
                // The size argument lives in the Go stack frame: one
                // word above SP, past the pushed return address.
                let sp = module.global(0)? as i32;
                let g = GuestMemory::new(module.memory());
                match g.read_u64(Ptr(sp.wrapping_add(8) as u32 as u64)) {
                    Ok(size) => Some(size as i64),
                    Err(err) => {
                        debug!("memory profiler: cannot read mallocgc size: {err}");
                        None
                    }
                }
            }
        }
    }
}

impl FunctionListener for MemListener {
    fn before(
        &self,
        module: &dyn ModuleAccess,
        def: &FunctionIdent,
        params: &[u64],
        stack: &mut StackIter<'_>,
    ) {
        let size = self.request_size(module, params);

        let freed = match self.hook {
            AllocatorHook::Free | AllocatorHook::Realloc => {
                params.first().map(|&v| v as u32)
            }
            _ => None,
        };

        // Frees carry no sample value; skip the stack walk for them.
        let trace = if self.hook != AllocatorHook::Free && size.is_some() {
            let mut trace = {
                let mut state = self.inner.state.lock().unwrap();
                state.traces.pop().unwrap_or_default()
            };
            self.inner
                .source
                .capture(module, def, stack, &mut trace)
                .then_some(trace)
        } else {
            None
        };

        let mut state = self.inner.state.lock().unwrap();
        state.pending.push(PendingCall {
            hook: self.hook,
            size: size.unwrap_or(0),
            freed,
            trace,
        });
    }

    fn after(&self, _module: &dyn ModuleAccess, _def: &FunctionIdent, results: &[u64]) {
        let inuse = self.inner.track_inuse.load(Ordering::Relaxed);
        let mut state = self.inner.state.lock().unwrap();
        let Some(call) = state.pending.pop() else { return };

        if let Some(freed) = call.freed {
            state.inuse.remove(&freed);
        }

        if let Some(trace) = call.trace {
            if !trace.is_empty() {
                let address = match call.hook {
                    AllocatorHook::Malloc | AllocatorHook::Calloc | AllocatorHook::Realloc => {
                        results.first().map(|&v| v as u32).filter(|&a| a != 0)
                    }
                    // The allocated address is not observable.
                    AllocatorHook::GoMallocgc => None,
                    AllocatorHook::Free => None,
                };

                let counter = state.alloc.lookup(&trace);
                counter.observe(call.size);
                let stack_key = counter.stack().key();

                if inuse {
                    if let Some(addr) = address {
                        state
                            .inuse
                            .insert(addr, Allocation { stack_key, size: call.size as u64 });
                    }
                }
            }
            state.traces.push(trace);
        }
    }

    fn abort(&self, _module: &dyn ModuleAccess, _def: &FunctionIdent, _error: &dyn std::fmt::Display) {
        // The call never completed; nothing was allocated or freed.
        let mut state = self.inner.state.lock().unwrap();
        if let Some(call) = state.pending.pop() {
            if let Some(trace) = call.trace {
                state.traces.push(trace);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::MemoryView;
    use crate::listener::Frame;
    use crate::symbolization::NullSymbolizer;

    struct FakeModule {
        memory: Vec<u8>,
        globals: Vec<u64>,
    }

    impl ModuleAccess for FakeModule {
        fn memory(&self) -> &dyn MemoryView {
            &self.memory
        }

        fn global(&self, index: u32) -> Option<u64> {
            self.globals.get(index as usize).copied()
        }
    }

    fn module() -> FakeModule {
        FakeModule { memory: vec![0; 256], globals: vec![0] }
    }

    fn profiler() -> MemoryProfiler {
        MemoryProfiler::new(Arc::new(StackSource::Wasm), "test.wasm")
    }

    fn stack(pcs: &[u64]) -> Vec<Frame> {
        pcs.iter()
            .map(|&pc| Frame::new(FunctionIdent::guest("m", "f", pc as u32), pc))
            .collect()
    }

    fn call(
        p: &MemoryProfiler,
        module: &FakeModule,
        name: &str,
        params: &[u64],
        results: &[u64],
        pcs: &[u64],
    ) {
        let def = FunctionIdent::guest("m", name, 0);
        let lstn = p.clone().new_listener(&def).expect("allocator hook");
        let mut it = stack(pcs).into_iter();
        lstn.before(module, &def, params, &mut it);
        lstn.after(module, &def, results);
    }

    #[test]
    fn non_allocator_functions_are_not_instrumented() {
        let p = profiler();
        assert!(p.new_listener(&FunctionIdent::guest("m", "compute", 3)).is_none());
        assert!(p.new_listener(&FunctionIdent::guest("m", "malloc", 3)).is_some());
    }

    #[test]
    fn alloc_totals_accumulate_per_stack() {
        let p = profiler();
        let m = module();
        call(&p, &m, "malloc", &[10], &[0x100], &[1, 2]);
        call(&p, &m, "malloc", &[32], &[0x200], &[1, 2]);
        call(&p, &m, "calloc", &[4, 8], &[0x300], &[3]);

        let profile = p.snapshot(1.0, &NullSymbolizer);
        let mut values: Vec<(i64, i64)> =
            profile.sample.iter().map(|s| (s.value[0], s.value[1])).collect();
        values.sort_unstable();
        assert_eq!(values, vec![(1, 32), (2, 42)]);
    }

    #[test]
    fn realloc_moves_the_inuse_entry() {
        let p = profiler();
        p.set_inuse_tracking(true);
        let m = module();
        call(&p, &m, "malloc", &[10], &[0x100], &[1]);
        assert!(p.live_allocation(0x100).is_some());

        call(&p, &m, "realloc", &[0x100, 24], &[0x180], &[1]);
        assert!(p.live_allocation(0x100).is_none(), "old block is gone");
        assert_eq!(p.live_allocation(0x180).map(|(_, size)| size), Some(24));
    }

    #[test]
    fn free_removes_from_inuse_without_touching_totals() {
        let p = profiler();
        p.set_inuse_tracking(true);
        let m = module();
        call(&p, &m, "malloc", &[64], &[0x100], &[1]);
        call(&p, &m, "free", &[0x100], &[], &[1]);

        assert!(p.live_allocation(0x100).is_none());
        let profile = p.snapshot(1.0, &NullSymbolizer);
        assert_eq!(profile.sample.len(), 1);
        assert_eq!(&profile.sample[0].value[..2], &[1, 64]);
        assert_eq!(&profile.sample[0].value[2..], &[0, 0], "nothing left in use");
    }

    #[test]
    fn inuse_fold_groups_by_stack() {
        let p = profiler();
        p.set_inuse_tracking(true);
        let m = module();
        call(&p, &m, "malloc", &[10], &[0x100], &[1]);
        call(&p, &m, "malloc", &[20], &[0x200], &[1]);
        call(&p, &m, "malloc", &[100], &[0x300], &[2]);
        call(&p, &m, "free", &[0x300], &[], &[2]);

        let profile = p.snapshot(1.0, &NullSymbolizer);
        let mut rows: Vec<Vec<i64>> = profile.sample.iter().map(|s| s.value.clone()).collect();
        rows.sort_unstable();
        assert_eq!(rows, vec![vec![1, 100, 0, 0], vec![2, 30, 2, 30]]);
    }

    #[test]
    fn mallocgc_reads_size_from_the_go_stack() {
        let mut m = module();
        // SP = 16; size word at SP+8.
        m.globals[0] = 16;
        m.memory[24..32].copy_from_slice(&41u64.to_le_bytes());

        let p = profiler();
        p.set_inuse_tracking(true);
        call(&p, &m, "runtime.mallocgc", &[], &[], &[1]);

        let profile = p.snapshot(1.0, &NullSymbolizer);
        assert_eq!(profile.sample.len(), 1);
        assert_eq!(&profile.sample[0].value[..2], &[1, 41]);
        // No address is observable, so nothing is tracked in-use.
        assert_eq!(&profile.sample[0].value[2..], &[0, 0]);
    }

    #[test]
    fn aborted_calls_observe_nothing() {
        let p = profiler();
        let m = module();
        let def = FunctionIdent::guest("m", "malloc", 0);
        let lstn = p.clone().new_listener(&def).unwrap();
        let mut it = stack(&[1]).into_iter();
        lstn.before(&m, &def, &[10], &mut it);
        lstn.abort(&m, &def, &"trap: unreachable");

        let profile = p.snapshot(1.0, &NullSymbolizer);
        assert!(profile.sample.is_empty());
    }

    #[test]
    fn allocation_totals_scale_with_sample_rate() {
        let p = profiler();
        let m = module();
        call(&p, &m, "malloc", &[10], &[0x100], &[1]);

        let profile = p.snapshot(0.5, &NullSymbolizer);
        assert_eq!(&profile.sample[0].value[..2], &[2, 20]);
    }
}
