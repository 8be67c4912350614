//! DMA-visible memory: a fixed pool carved up once at init time

use crate::error::{NandError, Result};

/// A region of [DmaMemory], identified by its bus address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSlice {
    pub addr: u32,
    pub len: u32,
}

impl DmaSlice {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The first `len` bytes of this slice
    pub fn prefix(&self, len: usize) -> Result<DmaSlice> {
        if len > self.len() {
            return Err(NandError::InvalidArgument);
        }
        Ok(DmaSlice {
            addr: self.addr,
            len: len as u32,
        })
    }
}

/// Memory the DMA engine can master, with a bump allocator.
///
/// Buffers are never returned to the pool; everything the driver needs is allocated while the
/// stack is brought up.
#[derive(Debug)]
pub struct DmaMemory {
    base: u32,
    data: Vec<u8>,
    used: usize,
}

impl DmaMemory {
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
            used: 0,
        }
    }

    pub fn alloc(&mut self, size: usize, align: usize) -> Result<DmaSlice> {
        debug_assert!(align.is_power_of_two());

        let start = (self.used + align - 1) & !(align - 1);
        let end = start.checked_add(size).ok_or(NandError::NoMemory)?;
        if end > self.data.len() {
            log::error!(
                "DMA pool exhausted: {size} bytes requested, {} free",
                self.data.len() - self.used
            );
            return Err(NandError::NoMemory);
        }

        self.used = end;
        Ok(DmaSlice {
            addr: self.base + start as u32,
            len: size as u32,
        })
    }

    pub fn free_bytes(&self) -> usize {
        self.data.len() - self.used
    }

    fn range(&self, addr: u32, len: usize) -> Result<std::ops::Range<usize>> {
        let start = addr.checked_sub(self.base).ok_or(NandError::Fault)? as usize;
        let end = start.checked_add(len).ok_or(NandError::Fault)?;
        if end > self.data.len() {
            return Err(NandError::Fault);
        }
        Ok(start..end)
    }

    /// Resolve a bus address range, as a bus master would
    pub fn bytes(&self, addr: u32, len: usize) -> Result<&[u8]> {
        let range = self.range(addr, len)?;
        Ok(&self.data[range])
    }

    pub fn bytes_mut(&mut self, addr: u32, len: usize) -> Result<&mut [u8]> {
        let range = self.range(addr, len)?;
        Ok(&mut self.data[range])
    }

    pub fn slice(&self, slice: DmaSlice) -> Result<&[u8]> {
        self.bytes(slice.addr, slice.len())
    }

    pub fn slice_mut(&mut self, slice: DmaSlice) -> Result<&mut [u8]> {
        self.bytes_mut(slice.addr, slice.len())
    }
}

#[test]
fn test_alloc_alignment() -> anyhow::Result<()> {
    let mut mem = DmaMemory::new(0x1000, 256);
    let a = mem.alloc(3, 1)?;
    let b = mem.alloc(16, 32)?;
    assert_eq!(a.addr, 0x1000);
    assert_eq!(b.addr, 0x1020);
    assert_eq!(mem.free_bytes(), 256 - 0x30);
    assert_eq!(mem.alloc(1024, 4), Err(NandError::NoMemory));
    Ok(())
}

#[test]
fn test_bus_access() -> anyhow::Result<()> {
    let mut mem = DmaMemory::new(0x1000, 64);
    let buf = mem.alloc(8, 4)?;
    mem.slice_mut(buf)?.copy_from_slice(b"abcdefgh");
    assert_eq!(mem.bytes(0x1002, 3)?, b"cde");
    assert_eq!(mem.bytes(0x0fff, 1), Err(NandError::Fault));
    assert_eq!(mem.bytes(0x1000, 65), Err(NandError::Fault));
    assert_eq!(buf.prefix(4)?.len(), 4);
    assert!(buf.prefix(9).is_err());
    Ok(())
}
