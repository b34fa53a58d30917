//! CPU time profiling of guest function calls.
//!
//! Every instrumented call contributes its self-time: the wall-clock
//! span between entry and exit minus the spans of the nested calls
//! observed in between. Time runs on an injectable monotonic clock so
//! the accounting is testable with scripted timestamps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::domain::ProfileError;
use crate::export::{build_profile, proto, ProfileMeta};
use crate::guest::ModuleAccess;
use crate::listener::{FunctionIdent, FunctionListener, ListenerFactory, StackIter};
use crate::profiling::{StackCounterMap, StackTrace};
use crate::symbolization::Symbolizer;
use crate::unwind::StackSource;

/// Monotonic clock in nanoseconds.
pub type NowFn = Arc<dyn Fn() -> i64 + Send + Sync>;

fn default_clock() -> NowFn {
    let origin = Instant::now();
    Arc::new(move || origin.elapsed().as_nanos() as i64)
}

pub const CPU_SAMPLE_TYPES: [(&str, &str); 2] = [("samples", "count"), ("cpu", "nanoseconds")];

/// Records CPU time spent in functions of a WebAssembly module.
///
/// The profiler produces samples of two types: "samples" counts the
/// observed calls, "cpu" sums their self-time in nanoseconds.
#[derive(Clone)]
pub struct CpuProfiler {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    source: Arc<StackSource>,
    module: Arc<str>,
    time: NowFn,
    /// Account for time spent in host function calls. Off by default:
    /// from the guest's perspective host calls are time off-CPU.
    host_time: AtomicBool,
}

struct State {
    /// Some while the profiler is running.
    counts: Option<StackCounterMap>,
    /// One entry per outstanding instrumented call.
    frames: Vec<CallFrame>,
    /// Reusable trace buffers.
    traces: Vec<StackTrace>,
    started_at: SystemTime,
    epoch: i64,
}

impl Default for State {
    fn default() -> State {
        State {
            counts: None,
            frames: Vec::new(),
            traces: Vec::new(),
            started_at: SystemTime::UNIX_EPOCH,
            epoch: 0,
        }
    }
}

struct CallFrame {
    start: i64,
    /// Sum of the durations of nested calls observed so far.
    children: i64,
    /// None when the call was not recorded (profiler stopped, or a host
    /// function with host time disabled).
    trace: Option<StackTrace>,
}

impl CpuProfiler {
    pub fn new(source: Arc<StackSource>, module: impl Into<Arc<str>>) -> Self {
        Self::with_clock(source, module, default_clock())
    }

    /// Construct with an explicit time source. The clock only needs to
    /// be monotonic; absolute values are never interpreted.
    pub fn with_clock(
        source: Arc<StackSource>,
        module: impl Into<Arc<str>>,
        time: NowFn,
    ) -> Self {
        CpuProfiler {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                source,
                module: module.into(),
                time,
                host_time: AtomicBool::new(false),
            }),
        }
    }

    /// Whether to account for time spent in calls to host functions.
    /// Must be set before instrumentation begins.
    pub fn set_host_time(&self, enable: bool) {
        self.inner.host_time.store(enable, Ordering::Relaxed);
    }

    /// Begin recording. Reports a soft failure, without side effects,
    /// when the profiler is already running.
    pub fn start(&self) -> Result<(), ProfileError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.counts.is_some() {
            return Err(ProfileError::AlreadyRunning);
        }
        state.counts = Some(StackCounterMap::default());
        state.started_at = SystemTime::now();
        state.epoch = (self.inner.time)();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().unwrap().counts.is_some()
    }

    /// Stop recording and build the profile. Returns `None` when the
    /// profiler was never started. The accumulator is handed off
    /// atomically, so a subsequent `start` begins from a clean state.
    pub fn stop(&self, sample_rate: f64, symbols: &dyn Symbolizer) -> Option<proto::Profile> {
        let (mut counts, started_at, duration) = {
            let mut state = self.inner.state.lock().unwrap();
            let counts = state.counts.take()?;
            let nanos = ((self.inner.time)() - state.epoch).max(0);
            (counts, state.started_at, Duration::from_nanos(nanos as u64))
        };

        if !self.inner.host_time.load(Ordering::Relaxed) {
            counts.retain(|c| !c.stack().starts_in_host());
        }

        let meta = ProfileMeta {
            start: started_at,
            duration,
            value_types: &CPU_SAMPLE_TYPES,
            // Scale the call counts up by the sampling cycle; measured
            // nanoseconds are real time and stay untouched.
            ratios: &[1.0 / sample_rate, 1.0],
            mapping_file: &self.inner.module,
        };
        Some(build_profile(
            symbols,
            counts.iter().map(|(_, c)| (c.stack(), vec![c.count(), c.total()])),
            &meta,
        ))
    }

    /// Stop and serialize in one step, for embedders writing profile
    /// files.
    pub fn stop_and_write(
        &self,
        path: &std::path::Path,
        sample_rate: f64,
        symbols: &dyn Symbolizer,
    ) -> Result<bool, ProfileError> {
        match self.stop(sample_rate, symbols) {
            Some(profile) => {
                crate::export::write_profile(path, &profile)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn name(&self) -> &'static str {
        "profile"
    }

    pub fn description(&self) -> &'static str {
        "CPU time profile of the wasm guest. Pass seconds=N to set the duration."
    }
}

impl ListenerFactory for CpuProfiler {
    fn new_listener(&self, _def: &FunctionIdent) -> Option<Box<dyn FunctionListener>> {
        Some(Box::new(CpuListener { inner: self.inner.clone() }))
    }
}

struct CpuListener {
    inner: Arc<Inner>,
}

impl FunctionListener for CpuListener {
    fn before(
        &self,
        module: &dyn ModuleAccess,
        def: &FunctionIdent,
        _params: &[u64],
        stack: &mut StackIter<'_>,
    ) {
        // Cheap check and buffer pop under the lock, stack walk outside
        // of it.
        let buffer = {
            let mut state = self.inner.state.lock().unwrap();
            let record = state.counts.is_some()
                && (self.inner.host_time.load(Ordering::Relaxed) || !def.host);
            record.then(|| state.traces.pop().unwrap_or_default())
        };

        let trace = buffer.and_then(|mut trace| {
            self.inner
                .source
                .capture(module, def, stack, &mut trace)
                .then_some(trace)
        });

        // The entry stamp deliberately excludes the stack walk above.
        let start = (self.inner.time)();
        let mut state = self.inner.state.lock().unwrap();
        state.frames.push(CallFrame { start, children: 0, trace });
    }

    fn after(&self, _module: &dyn ModuleAccess, _def: &FunctionIdent, _results: &[u64]) {
        self.finish_call();
    }

    fn abort(&self, _module: &dyn ModuleAccess, _def: &FunctionIdent, _error: &dyn std::fmt::Display) {
        self.finish_call();
    }
}

impl CpuListener {
    fn finish_call(&self) {
        let now = (self.inner.time)();
        let mut state = self.inner.state.lock().unwrap();
        let Some(frame) = state.frames.pop() else { return };

        let duration = now - frame.start;
        if let Some(parent) = state.frames.last_mut() {
            parent.children += duration;
        }

        if let Some(trace) = frame.trace {
            let self_time = (duration - frame.children).max(0);
            if !trace.is_empty() {
                if let Some(counts) = state.counts.as_mut() {
                    counts.observe(&trace, self_time);
                }
            }
            state.traces.push(trace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::MemoryView;
    use crate::listener::Frame;
    use crate::symbolization::NullSymbolizer;
    use std::sync::atomic::AtomicI64;

    #[derive(Default)]
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

    fn scripted_clock(times: &[i64]) -> (Arc<AtomicI64>, NowFn) {
        let cursor = Arc::new(AtomicI64::new(0));
        let times = times.to_vec();
        let c = cursor.clone();
        let now: NowFn = Arc::new(move || {
            let i = c.fetch_add(1, Ordering::Relaxed) as usize;
            times[i.min(times.len() - 1)]
        });
        (cursor, now)
    }

    fn stack(pcs: &[u64]) -> Vec<Frame> {
        pcs.iter()
            .map(|&pc| Frame::new(FunctionIdent::guest("m", "f", pc as u32), pc))
            .collect()
    }

    fn profiler(times: &[i64]) -> CpuProfiler {
        let (_, clock) = scripted_clock(times);
        CpuProfiler::with_clock(Arc::new(StackSource::Wasm), "test.wasm", clock)
    }

    #[test]
    fn start_while_running_is_a_soft_failure() {
        let p = profiler(&[0]);
        p.start().unwrap();
        assert!(matches!(p.start(), Err(ProfileError::AlreadyRunning)));
        assert!(p.is_running());
    }

    #[test]
    fn stop_without_start_returns_no_profile() {
        let p = profiler(&[0]);
        assert!(p.stop(1.0, &NullSymbolizer).is_none());
    }

    #[test]
    fn nested_self_times_subtract_child_durations() {
        // Clock sequence: start epoch, entries at 1, 10, 42, exits at
        // 100, 101, 102, stop timestamp.
        let p = profiler(&[0, 1, 10, 42, 100, 101, 102, 150]);
        p.start().unwrap();

        let module = NoModule::default();
        let outer = FunctionIdent::guest("m", "outer", 1);
        let middle = FunctionIdent::guest("m", "middle", 2);
        let inner = FunctionIdent::guest("m", "inner", 3);
        let factory = p.clone();
        let lstn = factory.new_listener(&outer).unwrap();

        let mut it = stack(&[1]).into_iter();
        lstn.before(&module, &outer, &[], &mut it);
        let mut it = stack(&[2, 1]).into_iter();
        lstn.before(&module, &middle, &[], &mut it);
        let mut it = stack(&[3, 2, 1]).into_iter();
        lstn.before(&module, &inner, &[], &mut it);
        lstn.after(&module, &inner, &[]);
        lstn.after(&module, &middle, &[]);
        lstn.after(&module, &outer, &[]);

        let profile = p.stop(1.0, &NullSymbolizer).unwrap();

        // Sum of self-times must equal total elapsed time of the
        // outermost call: 58 + 33 + 10 = 101.
        let mut self_times: Vec<i64> = profile.sample.iter().map(|s| s.value[1]).collect();
        self_times.sort_unstable();
        assert_eq!(self_times, vec![10, 33, 58]);
        for s in &profile.sample {
            assert_eq!(s.value[0], 1, "each stack observed once");
        }
    }

    #[test]
    fn host_frames_are_dropped_unless_host_time_enabled() {
        let p = profiler(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        p.start().unwrap();
        let module = NoModule::default();
        let guest = FunctionIdent::guest("m", "f", 1);
        let host = FunctionIdent::host("env", "clock", 0);
        let lstn = p.clone().new_listener(&guest).unwrap();

        // A host function call: not recorded at all while host time is
        // disabled.
        let mut it = vec![Frame::new(host.clone(), 7)].into_iter();
        lstn.before(&module, &host, &[], &mut it);
        lstn.after(&module, &host, &[]);

        let mut it = stack(&[1]).into_iter();
        lstn.before(&module, &guest, &[], &mut it);
        lstn.after(&module, &guest, &[]);

        let profile = p.stop(1.0, &NullSymbolizer).unwrap();
        assert_eq!(profile.sample.len(), 1);
    }

    #[test]
    fn sample_count_is_scaled_by_inverse_rate_but_time_is_not() {
        let p = profiler(&[0, 10, 20, 100]);
        p.start().unwrap();
        let module = NoModule::default();
        let f = FunctionIdent::guest("m", "f", 1);
        let lstn = p.clone().new_listener(&f).unwrap();
        let mut it = stack(&[1]).into_iter();
        lstn.before(&module, &f, &[], &mut it);
        lstn.after(&module, &f, &[]);

        let profile = p.stop(0.25, &NullSymbolizer).unwrap();
        assert_eq!(profile.sample.len(), 1);
        assert_eq!(profile.sample[0].value[0], 4, "count scaled by 1/rate");
        assert_eq!(profile.sample[0].value[1], 10, "nanoseconds unscaled");
    }

    #[test]
    fn restart_after_stop_records_fresh_counts() {
        let p = profiler(&[0, 1, 2, 3, 10, 11, 12, 13, 20]);
        p.start().unwrap();
        let module = NoModule::default();
        let f = FunctionIdent::guest("m", "f", 1);
        let lstn = p.clone().new_listener(&f).unwrap();
        let mut it = stack(&[1]).into_iter();
        lstn.before(&module, &f, &[], &mut it);
        lstn.after(&module, &f, &[]);
        assert!(p.stop(1.0, &NullSymbolizer).is_some());

        p.start().unwrap();
        let profile = p.stop(1.0, &NullSymbolizer).unwrap();
        assert!(profile.sample.is_empty());
    }
}
