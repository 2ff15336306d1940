//! # Linear Stream
//!
//! Append-only byte arena bound to one device allocation.

use alloc::vec::Vec;

use bytemuck::Pod;

use ember_core::{AllocationId, AllocationInfo, Error, GpuAddr, Result};

/// Command bytes with a write cursor and a device address
#[derive(Debug, Clone)]
pub struct LinearStream {
    /// Host copy of the written bytes; `len()` is the cursor
    bytes: Vec<u8>,
    /// Capacity in bytes
    capacity: usize,
    /// GPU address of byte 0
    gpu_base: GpuAddr,
    /// Backing allocation
    allocation: AllocationId,
}

impl LinearStream {
    /// Bind a stream to an allocation
    pub fn new(info: &AllocationInfo) -> Self {
        Self::with_capacity(info.id, info.gpu_base, info.size.as_usize())
    }

    /// Bind a stream to an explicit range
    pub fn with_capacity(allocation: AllocationId, gpu_base: GpuAddr, capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
            gpu_base,
            allocation,
        }
    }

    /// Bytes written
    #[inline]
    pub fn used(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes still available
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    /// Capacity
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// GPU address of the first byte
    #[inline]
    pub fn gpu_base(&self) -> GpuAddr {
        self.gpu_base
    }

    /// GPU address of the write cursor
    #[inline]
    pub fn current_gpu_address(&self) -> GpuAddr {
        self.gpu_base.offset(self.bytes.len() as u64)
    }

    /// Backing allocation
    #[inline]
    pub fn allocation(&self) -> AllocationId {
        self.allocation
    }

    /// Whether `addr` points into the written part of this stream
    pub fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.gpu_base && addr - self.gpu_base < self.bytes.len() as u64
    }

    /// Written bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Reserve `size` zeroed bytes at the cursor
    pub fn get_space(&mut self, size: usize) -> Result<&mut [u8]> {
        if size > self.available() {
            return Err(Error::CommandBufferFull);
        }
        let start = self.bytes.len();
        self.bytes.resize(start + size, 0);
        Ok(&mut self.bytes[start..])
    }

    /// Append a command or data block, returning its offset
    pub fn write<T: Pod>(&mut self, value: &T) -> Result<usize> {
        let offset = self.used();
        let raw = bytemuck::bytes_of(value);
        self.get_space(raw.len())?.copy_from_slice(raw);
        Ok(offset)
    }

    /// Append raw bytes, returning their offset
    pub fn write_bytes(&mut self, raw: &[u8]) -> Result<usize> {
        let offset = self.used();
        self.get_space(raw.len())?.copy_from_slice(raw);
        Ok(offset)
    }

    /// Overwrite already written bytes
    pub fn patch_bytes(&mut self, offset: usize, raw: &[u8]) -> Result<()> {
        let end = offset.checked_add(raw.len()).ok_or(Error::InvalidArgument)?;
        if end > self.bytes.len() {
            return Err(Error::InvalidArgument);
        }
        self.bytes[offset..end].copy_from_slice(raw);
        Ok(())
    }

    /// Overwrite a previously written value
    pub fn patch<T: Pod>(&mut self, offset: usize, value: &T) -> Result<()> {
        self.patch_bytes(offset, bytemuck::bytes_of(value))
    }

    /// Read back a value
    pub fn read<T: Pod>(&self, offset: usize) -> Result<T> {
        let size = core::mem::size_of::<T>();
        let end = offset.checked_add(size).ok_or(Error::InvalidArgument)?;
        self.bytes
            .get(offset..end)
            .map(bytemuck::pod_read_unaligned)
            .ok_or(Error::InvalidArgument)
    }

    /// Move the cursor back to `used`
    pub fn truncate(&mut self, used: usize) {
        self.bytes.truncate(used);
    }

    /// Empty the stream
    pub fn reset(&mut self) {
        self.bytes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmds::{BatchBufferEnd, HwCommand, LoadRegisterImm};

    fn stream(capacity: usize) -> LinearStream {
        LinearStream::with_capacity(AllocationId::new(1), GpuAddr::new(0x10000), capacity)
    }

    #[test]
    fn test_write_advances_cursor() {
        let mut s = stream(64);
        assert_eq!(s.write(&LoadRegisterImm::new(0x2580, 1)), Ok(0));
        assert_eq!(s.used(), LoadRegisterImm::SIZE);
        assert_eq!(s.current_gpu_address(), GpuAddr::new(0x10000 + 12));
        assert_eq!(s.read::<LoadRegisterImm>(0).map(|c| c.value), Ok(1));
    }

    #[test]
    fn test_full_stream_rejects_write() {
        let mut s = stream(8);
        assert_eq!(s.write(&LoadRegisterImm::new(0, 0)), Err(Error::CommandBufferFull));
        assert_eq!(s.used(), 0);
        assert!(s.write(&BatchBufferEnd::new()).is_ok());
        assert_eq!(s.available(), 4);
    }

    #[test]
    fn test_patch_and_truncate() {
        let mut s = stream(64);
        let _ = s.write(&LoadRegisterImm::new(0x10, 1));
        assert!(s.patch(0, &LoadRegisterImm::new(0x10, 2)).is_ok());
        assert_eq!(s.read::<LoadRegisterImm>(0).map(|c| c.value), Ok(2));
        assert_eq!(s.patch_bytes(10, &[0; 4]), Err(Error::InvalidArgument));
        s.truncate(0);
        assert_eq!(s.used(), 0);
        assert!(!s.contains(GpuAddr::new(0x10000)));
    }
}
