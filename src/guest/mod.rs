//! Read-only access to the guest's linear memory.
//!
//! The embedding runtime exposes a single primitive: borrow `size` bytes
//! at a 32-bit address. Everything else in this module is a typed helper
//! built on top of it. Both the host and the guest are assumed to use
//! little-endian layout; all decoding is done with explicit byte-level
//! conversions so the helpers are correct regardless of the host's own
//! pointer width.

mod mem;

pub use mem::{GuestMemory, MemoryView, ModuleAccess};
