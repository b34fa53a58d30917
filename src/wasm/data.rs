use crate::domain::BinaryError;
use crate::guest::MemoryView;
use crate::wasm::{DataSegment, ModuleInfo};

/// Random access over a module's active data segments, addressed by the
/// virtual addresses the segments occupy once the module is
/// instantiated. This is the image of guest memory as it exists before
/// the guest runs; the Go tables and the CPython version word live in
/// it.
pub struct DataSection<'a> {
    /// Segments in section order (the order the linker emitted them).
    segments: Vec<DataSegment<'a>>,
    /// Indices into `segments` sorted by virtual address, for lookups.
    by_vaddr: Vec<usize>,
}

impl<'a> DataSection<'a> {
    pub fn new(info: &ModuleInfo<'a>) -> Result<Self, BinaryError> {
        let segments = info.data_segments().to_vec();
        if segments.is_empty() {
            return Err(BinaryError::MissingDataSection);
        }
        let mut by_vaddr: Vec<usize> = (0..segments.len()).collect();
        by_vaddr.sort_by_key(|&i| segments[i].vaddr);
        Ok(DataSection { segments, by_vaddr })
    }

    /// The bytes at `[addr, addr+size)` if that range falls entirely
    /// within one segment.
    pub fn bytes_at(&self, addr: u64, size: u32) -> Option<&'a [u8]> {
        let pos = self
            .by_vaddr
            .partition_point(|&i| self.segments[i].vaddr <= addr)
            .checked_sub(1)?;
        let seg = self.segments[self.by_vaddr[pos]];
        if !seg.contains(addr) {
            return None;
        }
        let start = (addr - seg.vaddr) as usize;
        let end = start.checked_add(size as usize)?;
        seg.data.get(start..end)
    }

    /// Virtual addresses of every occurrence of `needle` within a single
    /// segment, in ascending segment order.
    pub fn find(&self, needle: &[u8]) -> Vec<u64> {
        let mut hits = Vec::new();
        if needle.is_empty() {
            return hits;
        }
        for seg in &self.segments {
            let mut from = 0;
            while let Some(at) = find_in(&seg.data[from..], needle) {
                hits.push(seg.vaddr + (from + at) as u64);
                from += at + 1;
            }
        }
        hits
    }

    /// A cursor positioned at the segment containing `addr`, paired with
    /// the tail of that segment starting at `addr`. The cursor continues
    /// with the segments that follow in section order.
    pub fn cursor_at(&self, addr: u64) -> Result<(SegmentCursor<'a, '_>, &'a [u8]), BinaryError> {
        for (i, seg) in self.segments.iter().enumerate() {
            if seg.contains(addr) {
                let tail = &seg.data[(addr - seg.vaddr) as usize..];
                return Ok((
                    SegmentCursor { section: self, next: i + 1, position: seg.end() },
                    tail,
                ));
            }
        }
        Err(BinaryError::SegmentExhausted { addr })
    }

    pub fn segments(&self) -> &[DataSegment<'a>] {
        &self.segments
    }
}

impl MemoryView for DataSection<'_> {
    fn read(&self, address: u32, size: u32) -> Option<&[u8]> {
        self.bytes_at(u64::from(address), size)
    }
}

fn find_in(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Forward-only iteration over data segments, with a monotonic skip
/// operation. Used to rebuild contiguous virtual memory from segments
/// that the linker laid out in ascending address order.
pub struct SegmentCursor<'a, 's> {
    section: &'s DataSection<'a>,
    next: usize,
    position: u64,
}

impl<'a> SegmentCursor<'a, '_> {
    /// Next segment in section order, or `None` when exhausted.
    pub fn next_segment(&mut self) -> Option<DataSegment<'a>> {
        let seg = *self.section.segments.get(self.next)?;
        self.next += 1;
        self.position = seg.end();
        Some(seg)
    }

    /// Advance until the segment containing `addr` and return the
    /// address and the remaining bytes of that segment from `addr` on.
    /// Going backwards is an error: offsets must be requested in
    /// ascending order.
    pub fn skip_to(&mut self, addr: u64) -> Result<(u64, &'a [u8]), BinaryError> {
        if addr < self.position {
            return Err(BinaryError::NonMonotonicDataOffset {
                requested: addr,
                position: self.position,
            });
        }
        while let Some(seg) = self.next_segment() {
            if seg.contains(addr) {
                return Ok((addr, &seg.data[(addr - seg.vaddr) as usize..]));
            }
        }
        Err(BinaryError::SegmentExhausted { addr })
    }
}

/// Contiguous reconstruction of a span of guest virtual memory from
/// consecutive data segments. Gaps between segments are zero-filled,
/// matching the zero-initialized linear memory the segments are copied
/// into at instantiation.
pub struct Vmem {
    start: u64,
    buf: Vec<u8>,
}

impl Vmem {
    pub fn new(start: u64) -> Self {
        Vmem { start, buf: Vec::new() }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.start + self.buf.len() as u64
    }

    pub fn has(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Append `bytes` so that they occupy `[addr, addr+len)`. Segments
    /// must arrive in ascending, non-overlapping address order.
    pub fn copy_at_address(&mut self, addr: u64, bytes: &[u8]) -> Result<(), BinaryError> {
        let end = self.end();
        if addr < end {
            return Err(BinaryError::OverlappingSegment { addr, end });
        }
        let zeroes = (addr - end) as usize;
        self.buf.reserve(zeroes + bytes.len());
        self.buf.resize(self.buf.len() + zeroes, 0);
        self.buf.extend_from_slice(bytes);
        debug_assert_eq!(self.end(), addr + bytes.len() as u64);
        Ok(())
    }

    /// Pull segments from `cursor` until the byte at `addr` is mapped.
    pub fn fill_until(&mut self, cursor: &mut SegmentCursor<'_, '_>, addr: u64) -> Result<(), BinaryError> {
        while !self.has(addr) {
            let seg = cursor
                .next_segment()
                .ok_or(BinaryError::SegmentExhausted { addr })?;
            self.copy_at_address(seg.vaddr, seg.data)?;
        }
        Ok(())
    }

    pub fn slice(&self, addr: u64, len: usize) -> Option<&[u8]> {
        if addr < self.start {
            return None;
        }
        let off = (addr - self.start) as usize;
        self.buf.get(off..off.checked_add(len)?)
    }

    pub fn u64_at(&self, addr: u64) -> Option<u64> {
        let b = self.slice(addr, 8)?;
        Some(u64::from_le_bytes(b.try_into().unwrap()))
    }
}
