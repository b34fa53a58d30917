use crate::domain::{MemoryAccessError, Ptr, Ptr32};

/// Random-access view of the guest's linear memory, provided by the
/// embedding runtime. Implementations return a borrowed view of exactly
/// `size` bytes, or `None` when the range is out of bounds. Callers may
/// not mutate the guest through this interface.
pub trait MemoryView {
    fn read(&self, address: u32, size: u32) -> Option<&[u8]>;
}

fn read_range(bytes: &[u8], address: u32, size: u32) -> Option<&[u8]> {
    let start = address as usize;
    let end = start.checked_add(size as usize)?;
    bytes.get(start..end)
}

impl MemoryView for [u8] {
    fn read(&self, address: u32, size: u32) -> Option<&[u8]> {
        read_range(self, address, size)
    }
}

impl MemoryView for Vec<u8> {
    fn read(&self, address: u32, size: u32) -> Option<&[u8]> {
        read_range(self, address, size)
    }
}

/// The slice of the instantiated module's state that listeners are
/// allowed to observe: linear memory and the values of module globals.
/// The Go stack walker reads the stack pointer and goroutine pointer
/// from globals; the `runtime.mallocgc` hook reads the allocation size
/// from the guest stack.
pub trait ModuleAccess {
    fn memory(&self) -> &dyn MemoryView;

    /// Value of the module global at `index`, zero-extended to 64 bits,
    /// or `None` if the module has no such global.
    fn global(&self, index: u32) -> Option<u64>;
}

/// Typed dereferencing helpers over a [`MemoryView`].
///
/// The maximum number of bytes pulled out of the guest for a
/// NUL-terminated string before giving up.
const MAX_CSTR_LEN: u32 = 4096;

pub struct GuestMemory<'a> {
    mem: &'a dyn MemoryView,
}

impl<'a> GuestMemory<'a> {
    pub fn new(mem: &'a dyn MemoryView) -> Self {
        Self { mem }
    }

    fn bytes(&self, addr: u64, size: u32) -> Result<&'a [u8], MemoryAccessError> {
        let narrow = u32::try_from(addr).map_err(|_| MemoryAccessError { address: addr, size })?;
        self.mem.read(narrow, size).ok_or(MemoryAccessError { address: addr, size })
    }

    pub fn read_u8(&self, p: Ptr) -> Result<u8, MemoryAccessError> {
        Ok(self.bytes(p.addr(), 1)?[0])
    }

    pub fn read_u32(&self, p: Ptr) -> Result<u32, MemoryAccessError> {
        let b = self.bytes(p.addr(), 4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_i32(&self, p: Ptr) -> Result<i32, MemoryAccessError> {
        Ok(self.read_u32(p)? as i32)
    }

    pub fn read_u64(&self, p: Ptr) -> Result<u64, MemoryAccessError> {
        let b = self.bytes(p.addr(), 8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    /// Dereference a 64-bit guest pointer.
    pub fn read_ptr(&self, p: Ptr) -> Result<Ptr, MemoryAccessError> {
        Ok(Ptr(self.read_u64(p)?))
    }

    /// Dereference a 32-bit guest pointer.
    pub fn read_ptr32(&self, p: Ptr32) -> Result<Ptr32, MemoryAccessError> {
        Ok(Ptr32(self.read_u32(p.widen())?))
    }

    pub fn read_u8_at32(&self, p: Ptr32) -> Result<u8, MemoryAccessError> {
        self.read_u8(p.widen())
    }

    pub fn read_u32_at32(&self, p: Ptr32) -> Result<u32, MemoryAccessError> {
        self.read_u32(p.widen())
    }

    pub fn read_i32_at32(&self, p: Ptr32) -> Result<i32, MemoryAccessError> {
        self.read_i32(p.widen())
    }

    /// Copy `count` bytes starting at `p` into host memory.
    pub fn read_bytes(&self, p: Ptr, count: u32) -> Result<Vec<u8>, MemoryAccessError> {
        Ok(self.bytes(p.addr(), count)?.to_vec())
    }

    /// Read a fixed-count array of little-endian u32 values.
    pub fn read_u32_array(&self, p: Ptr, count: u32) -> Result<Vec<u32>, MemoryAccessError> {
        let b = self.bytes(p.addr(), count.checked_mul(4).ok_or(MemoryAccessError {
            address: p.addr(),
            size: u32::MAX,
        })?)?;
        Ok(b.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect())
    }

    /// Read a fixed-count array of little-endian u64 values.
    pub fn read_u64_array(&self, p: Ptr, count: u32) -> Result<Vec<u64>, MemoryAccessError> {
        let b = self.bytes(p.addr(), count.checked_mul(8).ok_or(MemoryAccessError {
            address: p.addr(),
            size: u32::MAX,
        })?)?;
        Ok(b.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())).collect())
    }

    /// Read the header of a Go slice (data pointer, length, capacity as
    /// three consecutive 64-bit words) and copy `len` bytes of its
    /// contents into host memory.
    pub fn read_go_byte_slice(&self, header: Ptr) -> Result<Vec<u8>, MemoryAccessError> {
        let (data, len) = self.read_go_slice_header(header)?;
        self.read_bytes(data, len)
    }

    /// Like [`read_go_byte_slice`](Self::read_go_byte_slice) for `[]uint32`.
    pub fn read_go_u32_slice(&self, header: Ptr) -> Result<Vec<u32>, MemoryAccessError> {
        let (data, len) = self.read_go_slice_header(header)?;
        self.read_u32_array(data, len)
    }

    /// Data pointer and length of a Go slice header. Capacity is read and
    /// discarded; snapshots always use the length.
    pub fn read_go_slice_header(&self, header: Ptr) -> Result<(Ptr, u32), MemoryAccessError> {
        let data = self.read_ptr(header)?;
        let len = self.read_u64(header + 8)?;
        let _cap = self.read_u64(header + 16)?;
        let len = u32::try_from(len).map_err(|_| MemoryAccessError {
            address: header.addr(),
            size: u32::MAX,
        })?;
        Ok((data, len))
    }

    /// Read a NUL-terminated string starting at `p`, clamped to a fixed
    /// maximum length. Invalid UTF-8 is replaced rather than rejected;
    /// symbol tables occasionally carry raw bytes.
    pub fn read_cstr(&self, p: Ptr) -> Result<String, MemoryAccessError> {
        let mut out = Vec::new();
        let mut addr = p;
        for _ in 0..MAX_CSTR_LEN {
            let b = self.read_u8(addr)?;
            if b == 0 {
                break;
            }
            out.push(b);
            addr = addr + 1;
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}
