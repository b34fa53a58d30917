//! Deterministic cyclic sampling of function listeners.
//!
//! [`sample`] wraps a listener factory so that only one call out of every
//! `ceil(1/rate)` reaches the inner listener. The decision made at
//! `before` must be replayed at the matching `after`/`abort`, so each
//! sampled listener keeps a stack of accept/reject bits, one per
//! outstanding call. The stack is packed into 64-bit words so deep
//! recursion costs next to nothing.

use std::sync::{Arc, Mutex};

use crate::guest::ModuleAccess;
use crate::listener::{FunctionIdent, FunctionListener, ListenerFactory, StackIter};

/// Returns a listener factory sampling calls at `rate`.
///
/// A zero or negative rate disables the inner factory entirely (no
/// listeners are produced). A rate of one or more returns the inner
/// factory unchanged, so every call is observed.
pub fn sample(rate: f64, factory: Arc<dyn ListenerFactory>) -> Arc<dyn ListenerFactory> {
    if rate <= 0.0 {
        return Arc::new(EmptyFactory);
    }
    if rate >= 1.0 {
        return factory;
    }
    let cycle = (1.0 / rate).ceil() as u64;
    Arc::new(SampledFactory { cycle, factory })
}

struct EmptyFactory;

impl ListenerFactory for EmptyFactory {
    fn new_listener(&self, _def: &FunctionIdent) -> Option<Box<dyn FunctionListener>> {
        None
    }
}

struct SampledFactory {
    cycle: u64,
    factory: Arc<dyn ListenerFactory>,
}

impl ListenerFactory for SampledFactory {
    fn new_listener(&self, def: &FunctionIdent) -> Option<Box<dyn FunctionListener>> {
        let lstn = self.factory.new_listener(def)?;
        Some(Box::new(SampledListener {
            state: Mutex::new(SamplerState { count: self.cycle, stack: BitStack::default() }),
            cycle: self.cycle,
            lstn,
        }))
    }
}

struct SamplerState {
    count: u64,
    stack: BitStack,
}

struct SampledListener {
    state: Mutex<SamplerState>,
    cycle: u64,
    lstn: Box<dyn FunctionListener>,
}

impl FunctionListener for SampledListener {
    fn before(
        &self,
        module: &dyn ModuleAccess,
        def: &FunctionIdent,
        params: &[u64],
        stack: &mut StackIter<'_>,
    ) {
        let forward = {
            let mut state = self.state.lock().unwrap();
            state.count -= 1;
            let forward = state.count == 0;
            if forward {
                state.count = self.cycle;
            }
            state.stack.push(forward);
            forward
        };
        if forward {
            self.lstn.before(module, def, params, stack);
        }
    }

    fn after(&self, module: &dyn ModuleAccess, def: &FunctionIdent, results: &[u64]) {
        if self.state.lock().unwrap().stack.pop() {
            self.lstn.after(module, def, results);
        }
    }

    fn abort(&self, module: &dyn ModuleAccess, def: &FunctionIdent, error: &dyn std::fmt::Display) {
        if self.state.lock().unwrap().stack.pop() {
            self.lstn.abort(module, def, error);
        }
    }
}

/// Growable stack of bits packed into 64-bit words.
#[derive(Default, Debug)]
pub struct BitStack {
    bits: Vec<u64>,
    size: usize,
}

impl BitStack {
    pub fn push(&mut self, bit: bool) {
        let index = self.size / 64;
        let shift = self.size % 64;
        if index >= self.bits.len() {
            self.bits.resize(index + 1, 0);
        }
        self.bits[index] &= !(1u64 << shift);
        self.bits[index] |= u64::from(bit) << shift;
        self.size += 1;
    }

    /// Pops the most recently pushed bit. Popping an empty stack means a
    /// `before` was never recorded for this `after`, which breaks the
    /// LIFO contract; that is a programming error and aborts.
    pub fn pop(&mut self) -> bool {
        assert!(self.size > 0, "bit-stack underflow: unbalanced after/abort");
        self.size -= 1;
        let index = self.size / 64;
        let shift = self.size % 64;
        (self.bits[index] >> shift) & 1 != 0
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::MemoryView;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    #[derive(Default)]
    struct Counts {
        befores: AtomicUsize,
        afters: AtomicUsize,
        aborts: AtomicUsize,
    }

    struct CountingListener(Arc<Counts>);

    impl FunctionListener for CountingListener {
        fn before(
            &self,
            _: &dyn ModuleAccess,
            _: &FunctionIdent,
            _: &[u64],
            _: &mut StackIter<'_>,
        ) {
            self.0.befores.fetch_add(1, Ordering::Relaxed);
        }

        fn after(&self, _: &dyn ModuleAccess, _: &FunctionIdent, _: &[u64]) {
            self.0.afters.fetch_add(1, Ordering::Relaxed);
        }

        fn abort(&self, _: &dyn ModuleAccess, _: &FunctionIdent, _: &dyn std::fmt::Display) {
            self.0.aborts.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct CountingFactory(Arc<Counts>);

    impl ListenerFactory for CountingFactory {
        fn new_listener(&self, _def: &FunctionIdent) -> Option<Box<dyn FunctionListener>> {
            Some(Box::new(CountingListener(self.0.clone())))
        }
    }

    fn counting(rate: f64) -> (Arc<Counts>, Box<dyn FunctionListener>) {
        let counts = Arc::new(Counts::default());
        let factory = sample(rate, Arc::new(CountingFactory(counts.clone())));
        let def = FunctionIdent::guest("test", "f", 0);
        let lstn = factory.new_listener(&def).expect("listener");
        (counts, lstn)
    }

    #[test]
    fn rate_of_one_tenth_forwards_two_out_of_twenty() {
        let (counts, lstn) = counting(0.1);
        let def = FunctionIdent::guest("test", "f", 0);
        let module = NoModule::default();
        for _ in 0..20 {
            let mut empty = std::iter::empty();
            lstn.before(&module, &def, &[], &mut empty);
            lstn.after(&module, &def, &[]);
        }
        assert_eq!(counts.befores.load(Ordering::Relaxed), 2);
        assert_eq!(counts.afters.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn forwards_every_cycleth_call() {
        // 7 calls at rate 1/3 -> cycle 3 -> forwarded on calls 3 and 6.
        let (counts, lstn) = counting(1.0 / 3.0);
        let def = FunctionIdent::guest("test", "f", 0);
        let module = NoModule::default();
        for _ in 0..7 {
            let mut empty = std::iter::empty();
            lstn.before(&module, &def, &[], &mut empty);
            lstn.after(&module, &def, &[]);
        }
        assert_eq!(counts.befores.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn nested_calls_replay_the_decision_in_lifo_order() {
        let (counts, lstn) = counting(0.5);
        let def = FunctionIdent::guest("test", "f", 0);
        let module = NoModule::default();
        // cycle = 2: calls 2, 4, ... are forwarded. Nest two calls so the
        // outer one (call 1, rejected) returns after the inner one
        // (call 2, accepted).
        let mut empty = std::iter::empty();
        lstn.before(&module, &def, &[], &mut empty);
        let mut empty = std::iter::empty();
        lstn.before(&module, &def, &[], &mut empty);
        lstn.abort(&module, &def, &"call aborted");
        lstn.after(&module, &def, &[]);

        assert_eq!(counts.befores.load(Ordering::Relaxed), 1);
        assert_eq!(counts.aborts.load(Ordering::Relaxed), 1);
        assert_eq!(counts.afters.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn zero_rate_produces_no_listener() {
        let counts = Arc::new(Counts::default());
        let factory = sample(0.0, Arc::new(CountingFactory(counts)));
        let def = FunctionIdent::guest("test", "f", 0);
        assert!(factory.new_listener(&def).is_none());
    }

    #[test]
    fn full_rate_returns_inner_factory() {
        let (counts, lstn) = counting(1.0);
        let def = FunctionIdent::guest("test", "f", 0);
        let module = NoModule::default();
        for _ in 0..5 {
            let mut empty = std::iter::empty();
            lstn.before(&module, &def, &[], &mut empty);
            lstn.after(&module, &def, &[]);
        }
        assert_eq!(counts.befores.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn bitstack_grows_past_one_word() {
        let mut s = BitStack::default();
        for i in 0..200 {
            s.push(i % 3 == 0);
        }
        assert_eq!(s.len(), 200);
        for i in (0..200).rev() {
            assert_eq!(s.pop(), i % 3 == 0, "bit {i}");
        }
        assert!(s.is_empty());
    }

    #[test]
    #[should_panic(expected = "bit-stack underflow")]
    fn bitstack_underflow_panics() {
        BitStack::default().pop();
    }
}
