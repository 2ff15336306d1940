//! # Indirect Heap
//!
//! Cross-thread data of kernel launches. Walkers reference their data as an
//! offset from the device's heap window rather than from the heap itself,
//! so replacing an exhausted heap leaves the state base address alone.

use ember_core::{AllocationId, AllocationInfo, Error, GpuAddr, Result};

use crate::stream::LinearStream;

/// A block of cross-thread data inside the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSlot {
    /// Offset from the heap base
    pub offset: u32,
    /// Absolute GPU address
    pub gpu_address: GpuAddr,
}

/// Indirect object heap
#[derive(Debug, Clone)]
pub struct IndirectHeap {
    stream: LinearStream,
}

impl IndirectHeap {
    /// Cross-thread data alignment
    pub const ALIGNMENT: usize = 64;

    /// Bind a heap to an allocation
    pub fn new(info: &AllocationInfo) -> Self {
        Self {
            stream: LinearStream::new(info),
        }
    }

    /// Heap base address
    pub fn base(&self) -> GpuAddr {
        self.stream.gpu_base()
    }

    /// Backing allocation
    pub fn allocation(&self) -> AllocationId {
        self.stream.allocation()
    }

    /// Bytes used
    pub fn used(&self) -> usize {
        self.stream.used()
    }

    /// Whether `size` more bytes fit after alignment
    pub fn fits(&self, size: usize) -> bool {
        let aligned = self.stream.used().next_multiple_of(Self::ALIGNMENT);
        aligned + size <= self.stream.capacity()
    }

    /// Copy `data` into the heap
    pub fn push(&mut self, data: &[u8]) -> Result<HeapSlot> {
        if !self.fits(data.len()) {
            return Err(Error::CommandBufferFull);
        }
        let aligned = self.stream.used().next_multiple_of(Self::ALIGNMENT);
        self.stream.get_space(aligned - self.stream.used())?;
        let offset = self.stream.write_bytes(data)?;
        Ok(HeapSlot {
            offset: offset as u32,
            gpu_address: self.base().offset(offset as u64),
        })
    }

    /// Contents written so far
    pub fn as_bytes(&self) -> &[u8] {
        self.stream.as_bytes()
    }

    /// Empty the heap
    pub fn reset(&mut self) {
        self.stream.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{AllocationKind, ByteSize};

    fn heap(size: u64) -> IndirectHeap {
        IndirectHeap::new(&AllocationInfo {
            id: AllocationId::new(4),
            gpu_base: GpuAddr::new(0x20_0000),
            size: ByteSize::from_bytes(size),
            kind: AllocationKind::IndirectHeap,
        })
    }

    #[test]
    fn test_push_aligns_slots() {
        let mut heap = heap(256);
        let a = heap.push(&[1; 8]);
        let b = heap.push(&[2; 8]);
        assert_eq!(a.map(|s| s.offset), Ok(0));
        assert_eq!(b.map(|s| s.offset), Ok(64));
        assert_eq!(b.map(|s| s.gpu_address), Ok(GpuAddr::new(0x20_0040)));
    }

    #[test]
    fn test_exhausted_heap() {
        let mut heap = heap(128);
        assert!(heap.push(&[0; 64]).is_ok());
        assert!(heap.push(&[0; 64]).is_ok());
        assert_eq!(heap.push(&[0; 1]).err(), Some(Error::CommandBufferFull));
        heap.reset();
        assert_eq!(heap.used(), 0);
    }
}
