use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hasher};
use std::sync::OnceLock;

use crate::listener::Frame;

/// Seed for stack-trace hashing, chosen once per process. Two traces
/// with identical PC sequences hash to the same key within a process;
/// nothing is guaranteed across processes.
fn hash_seed() -> &'static RandomState {
    static SEED: OnceLock<RandomState> = OnceLock::new();
    SEED.get_or_init(RandomState::new)
}

/// Key identifying a stack trace: the hash of its PC sequence. Equality
/// of keys stands in for equality of traces; the collision probability
/// over 64 bits is negligible for profiling purposes.
pub(crate) fn stack_key(frames: &[Frame]) -> u64 {
    let mut h = hash_seed().build_hasher();
    for f in frames {
        h.write(&f.pc.to_le_bytes());
    }
    h.finish()
}

/// An immutable sequence of frames, innermost first, with its hash key.
///
/// Traces are captured on the hot path, so the buffers are reusable:
/// profilers keep a free-list of traces and refill them in place.
#[derive(Clone, Default)]
pub struct StackTrace {
    frames: Vec<Frame>,
    key: u64,
}

impl StackTrace {
    /// Refill this trace from a stack iterator, draining it fully, and
    /// recompute the key.
    pub fn fill(&mut self, frames: impl Iterator<Item = Frame>) {
        self.frames.clear();
        self.frames.extend(frames);
        self.key = stack_key(&self.frames);
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// True when the innermost frame is a host function. Used to strip
    /// host-call samples from CPU profiles when host time is excluded.
    pub fn starts_in_host(&self) -> bool {
        self.frames.first().is_some_and(|f| f.function.host)
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "@{:016x}: {}", frame.pc, frame.function.name)?;
        }
        Ok(())
    }
}

/// Aggregate for one stack: number of observations and summed sample
/// value (nanoseconds or bytes).
pub struct StackCounter {
    stack: StackTrace,
    count: i64,
    total: i64,
}

impl StackCounter {
    fn new(stack: StackTrace) -> Self {
        StackCounter { stack, count: 0, total: 0 }
    }

    pub fn observe(&mut self, value: i64) {
        self.count += 1;
        self.total += value;
    }

    pub fn stack(&self) -> &StackTrace {
        &self.stack
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn total(&self) -> i64 {
        self.total
    }
}

/// Counters keyed by stack hash. The first observation of a key clones
/// the trace; later observations only touch the counter.
#[derive(Default)]
pub struct StackCounterMap {
    counters: HashMap<u64, StackCounter>,
}

impl StackCounterMap {
    pub fn observe(&mut self, stack: &StackTrace, value: i64) {
        self.lookup(stack).observe(value);
    }

    pub fn lookup(&mut self, stack: &StackTrace) -> &mut StackCounter {
        self.counters
            .entry(stack.key())
            .or_insert_with(|| StackCounter::new(stack.clone()))
    }

    pub fn get(&self, key: u64) -> Option<&StackCounter> {
        self.counters.get(&key)
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &StackCounter)> {
        self.counters.iter().map(|(k, v)| (*k, v))
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&StackCounter) -> bool) {
        self.counters.retain(|_, c| keep(c));
    }
}
