//! Newtypes for guest-side values.
//!
//! Everything reachable from a guest address must be read through a
//! [`MemoryView`](crate::guest::MemoryView). Wrapping guest addresses in
//! distinct types keeps them from being confused with host pointers or
//! plain integers in the unwinder code.

use std::fmt;

/// An address in the guest's linear memory, as seen by 64-bit guest
/// runtimes (the Go wasm port manipulates 64-bit stack and goroutine
/// pointers even though linear memory is 32-bit addressable).
///
/// Arithmetic is allowed; dereferencing goes through the guest memory
/// view.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ptr(pub u64);

impl Ptr {
    pub const NULL: Ptr = Ptr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn addr(self) -> u64 {
        self.0
    }
}

impl std::ops::Add<u64> for Ptr {
    type Output = Ptr;

    fn add(self, rhs: u64) -> Ptr {
        Ptr(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Sub<u64> for Ptr {
    type Output = Ptr;

    fn sub(self, rhs: u64) -> Ptr {
        Ptr(self.0.wrapping_sub(rhs))
    }
}

impl fmt::Debug for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ptr({:#x})", self.0)
    }
}

/// A 32-bit guest address, used by runtimes that store pointers in
/// 4-byte fields (CPython compiled to wasm32).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ptr32(pub u32);

impl Ptr32 {
    pub const NULL: Ptr32 = Ptr32(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn addr(self) -> u32 {
        self.0
    }

    pub fn widen(self) -> Ptr {
        Ptr(u64::from(self.0))
    }
}

impl std::ops::Add<u32> for Ptr32 {
    type Output = Ptr32;

    fn add(self, rhs: u32) -> Ptr32 {
        Ptr32(self.0.wrapping_add(rhs))
    }
}

impl fmt::Debug for Ptr32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ptr32({:#x})", self.0)
    }
}

/// Guest language detected from the module binary, which decides the
/// symbolizer and stack walker wired in by
/// [`Profiling`](crate::prepare::Profiling).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GuestLanguage {
    /// No language-specific support; the runtime's own wasm stack is
    /// used as-is and symbolized through DWARF when present.
    Wasm,
    /// A module produced by the Go toolchain (wasip1 target).
    Go,
    /// A module embedding the CPython 3.11 interpreter.
    Python,
}

impl fmt::Display for GuestLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestLanguage::Wasm => f.write_str("wasm"),
            GuestLanguage::Go => f.write_str("go"),
            GuestLanguage::Python => f.write_str("python"),
        }
    }
}
