//! Instrumentation interface consumed from the embedding runtime.
//!
//! The runtime drives profiling through a narrow contract: a
//! [`ListenerFactory`] is asked once per function definition whether it
//! wants a listener, and each listener is then invoked on every call with
//! `before`/`after`/`abort` forming a correctly nested LIFO sequence per
//! instance. The runtime also hands `before` a lazy iterator over the
//! current wasm call stack.
//!
//! Nothing in this module talks to a concrete runtime; embedders adapt
//! their engine's hooks to these traits.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::guest::ModuleAccess;

/// Identity of a function as reported by the embedding runtime.
///
/// Cheap to clone: stack traces retain one per frame. The identity is
/// opaque to the profiler except for the predicates below; program
/// counters carry the unwinder-specific meaning.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FunctionIdent {
    /// Name of the module the function belongs to.
    pub module: Arc<str>,
    /// Plain function name (export name or name-section entry).
    pub name: Arc<str>,
    /// Debug name when the runtime tracks one separately, otherwise the
    /// plain name.
    pub debug_name: Arc<str>,
    /// Function index within the module.
    pub index: u32,
    /// True when the function is implemented by the host runtime rather
    /// than the guest.
    pub host: bool,
}

impl FunctionIdent {
    pub fn guest(module: &str, name: &str, index: u32) -> Self {
        let name: Arc<str> = Arc::from(name);
        FunctionIdent {
            module: Arc::from(module),
            debug_name: name.clone(),
            name,
            index,
            host: false,
        }
    }

    pub fn host(module: &str, name: &str, index: u32) -> Self {
        FunctionIdent { host: true, ..FunctionIdent::guest(module, name, index) }
    }
}

impl fmt::Debug for FunctionIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}[{}]", self.module, self.name, self.index)
    }
}

/// Source position resolved at walk time.
///
/// Language walkers that read live interpreter state (Python) cannot
/// defer symbolization to profile-build time: the interpreter frames are
/// gone by then. They attach the resolved position to the frame instead.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SourceHint {
    pub file: Arc<str>,
    pub line: i64,
    /// Address recorded for the pprof location (the frame's instruction
    /// pointer in whatever space the walker uses).
    pub address: u64,
}

/// One frame of a guest stack: a function identity and a program
/// counter. The meaning of `pc` depends on the walker that produced the
/// frame: a wasm source offset, a Go pclntab PC, or an opaque monotonic
/// counter for Python frames.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Frame {
    pub function: FunctionIdent,
    pub pc: u64,
    pub source: Option<SourceHint>,
}

impl Frame {
    pub fn new(function: FunctionIdent, pc: u64) -> Self {
        Frame { function, pc, source: None }
    }
}

/// Lazy iterator over the wasm call stack, innermost frame first, as
/// supplied by the runtime to [`FunctionListener::before`].
pub type StackIter<'a> = dyn Iterator<Item = Frame> + 'a;

/// Per-function instrumentation hooks.
///
/// The runtime guarantees LIFO nesting per module instance: every
/// `after` or `abort` matches the immediately previous outstanding
/// `before` at its call depth. Implementations rely on this ordering.
pub trait FunctionListener: Send + Sync {
    /// Invoked when a call to the instrumented function begins. `stack`
    /// iterates the current wasm call stack, innermost first, and is
    /// only valid for the duration of the callback.
    fn before(
        &self,
        module: &dyn ModuleAccess,
        def: &FunctionIdent,
        params: &[u64],
        stack: &mut StackIter<'_>,
    );

    /// Invoked when the call returns normally, with its result values.
    fn after(&self, module: &dyn ModuleAccess, def: &FunctionIdent, results: &[u64]);

    /// Invoked instead of `after` when the call is aborted by a trap or
    /// by the embedder, with the runtime's description of the failure.
    fn abort(&self, module: &dyn ModuleAccess, def: &FunctionIdent, error: &dyn fmt::Display);
}

/// Decides, per function definition, whether calls to it are observed.
pub trait ListenerFactory: Send + Sync {
    fn new_listener(&self, def: &FunctionIdent) -> Option<Box<dyn FunctionListener>>;
}

impl<T: ListenerFactory + ?Sized> ListenerFactory for Arc<T> {
    fn new_listener(&self, def: &FunctionIdent) -> Option<Box<dyn FunctionListener>> {
        (**self).new_listener(def)
    }
}

/// Fans instrumentation out to multiple factories. A single listener is
/// returned that forwards each callback to every listener the inner
/// factories produced for the function.
pub fn multi(factories: Vec<Arc<dyn ListenerFactory>>) -> Arc<dyn ListenerFactory> {
    Arc::new(MultiFactory { factories })
}

struct MultiFactory {
    factories: Vec<Arc<dyn ListenerFactory>>,
}

impl ListenerFactory for MultiFactory {
    fn new_listener(&self, def: &FunctionIdent) -> Option<Box<dyn FunctionListener>> {
        let listeners: Vec<_> =
            self.factories.iter().filter_map(|f| f.new_listener(def)).collect();
        if listeners.is_empty() {
            return None;
        }
        Some(Box::new(MultiListener { listeners }))
    }
}

struct MultiListener {
    listeners: Vec<Box<dyn FunctionListener>>,
}

impl FunctionListener for MultiListener {
    fn before(
        &self,
        module: &dyn ModuleAccess,
        def: &FunctionIdent,
        params: &[u64],
        stack: &mut StackIter<'_>,
    ) {
        // The stack iterator is restartless; materialize it once so every
        // inner listener observes the same frames.
        let frames: Vec<Frame> = stack.collect();
        for lstn in &self.listeners {
            let mut it = frames.iter().cloned();
            lstn.before(module, def, params, &mut it);
        }
    }

    fn after(&self, module: &dyn ModuleAccess, def: &FunctionIdent, results: &[u64]) {
        for lstn in &self.listeners {
            lstn.after(module, def, results);
        }
    }

    fn abort(&self, module: &dyn ModuleAccess, def: &FunctionIdent, error: &dyn fmt::Display) {
        for lstn in &self.listeners {
            lstn.abort(module, def, error);
        }
    }
}

/// Gates a factory's listeners on an atomic flag, so instrumentation can
/// be toggled while the guest runs. Calls observed while the flag is
/// down are counted for pairing but not forwarded.
pub fn flagged(flag: Arc<AtomicBool>, inner: Arc<dyn ListenerFactory>) -> Arc<dyn ListenerFactory> {
    Arc::new(FlaggedFactory { flag, inner })
}

struct FlaggedFactory {
    flag: Arc<AtomicBool>,
    inner: Arc<dyn ListenerFactory>,
}

impl ListenerFactory for FlaggedFactory {
    fn new_listener(&self, def: &FunctionIdent) -> Option<Box<dyn FunctionListener>> {
        let lstn = self.inner.new_listener(def)?;
        Some(Box::new(FlaggedListener {
            flag: self.flag.clone(),
            stack: std::sync::Mutex::new(crate::sampling::BitStack::default()),
            lstn,
        }))
    }
}

struct FlaggedListener {
    flag: Arc<AtomicBool>,
    stack: std::sync::Mutex<crate::sampling::BitStack>,
    lstn: Box<dyn FunctionListener>,
}

impl FunctionListener for FlaggedListener {
    fn before(
        &self,
        module: &dyn ModuleAccess,
        def: &FunctionIdent,
        params: &[u64],
        stack: &mut StackIter<'_>,
    ) {
        let on = self.flag.load(Ordering::Relaxed);
        self.stack.lock().unwrap().push(on);
        if on {
            self.lstn.before(module, def, params, stack);
        }
    }

    fn after(&self, module: &dyn ModuleAccess, def: &FunctionIdent, results: &[u64]) {
        if self.stack.lock().unwrap().pop() {
            self.lstn.after(module, def, results);
        }
    }

    fn abort(&self, module: &dyn ModuleAccess, def: &FunctionIdent, error: &dyn fmt::Display) {
        if self.stack.lock().unwrap().pop() {
            self.lstn.abort(module, def, error);
        }
    }
}
