//! # Host-Visible Memory
//!
//! CPU-accessible backing for allocations the host polls or writes:
//! event pools, task-count tags, in-order counters, work-partition tables.

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::types::{AllocationId, GpuAddr};

/// A device allocation with a coherent host mapping.
///
/// Accesses are addressed by GPU virtual address so that the same values
/// programmed into commands can be used by the host to read back results.
#[derive(Debug)]
pub struct HostVisibleMemory {
    /// Allocation backing this range
    allocation: AllocationId,
    /// GPU base address
    gpu_base: GpuAddr,
    /// Host copy of the contents
    bytes: Mutex<Vec<u8>>,
}

impl HostVisibleMemory {
    /// Create zero-filled memory
    pub fn new(allocation: AllocationId, gpu_base: GpuAddr, size: usize) -> Self {
        Self {
            allocation,
            gpu_base,
            bytes: Mutex::new(vec![0u8; size]),
        }
    }

    /// Allocation handle
    pub fn allocation(&self) -> AllocationId {
        self.allocation
    }

    /// GPU base address
    pub fn gpu_base(&self) -> GpuAddr {
        self.gpu_base
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Whether `[addr, addr + len)` lies inside this memory
    pub fn contains(&self, addr: GpuAddr, len: usize) -> bool {
        self.offset_of(addr, len).is_ok()
    }

    fn offset_of(&self, addr: GpuAddr, len: usize) -> Result<usize> {
        if addr < self.gpu_base {
            return Err(Error::InvalidGpuAddress);
        }
        let offset = (addr - self.gpu_base) as usize;
        let size = self.bytes.lock().len();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset),
            _ => Err(Error::InvalidGpuAddress),
        }
    }

    /// Read a little-endian dword
    pub fn read_u32(&self, addr: GpuAddr) -> Result<u32> {
        let offset = self.offset_of(addr, 4)?;
        let bytes = self.bytes.lock();
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[offset..offset + 4]);
        Ok(u32::from_le_bytes(raw))
    }

    /// Read a little-endian qword
    pub fn read_u64(&self, addr: GpuAddr) -> Result<u64> {
        let offset = self.offset_of(addr, 8)?;
        let bytes = self.bytes.lock();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[offset..offset + 8]);
        Ok(u64::from_le_bytes(raw))
    }

    /// Write a little-endian dword
    pub fn write_u32(&self, addr: GpuAddr, value: u32) -> Result<()> {
        let offset = self.offset_of(addr, 4)?;
        self.bytes.lock()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a little-endian qword
    pub fn write_u64(&self, addr: GpuAddr, value: u64) -> Result<()> {
        let offset = self.offset_of(addr, 8)?;
        self.bytes.lock()[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Fill a range with a repeated qword
    pub fn fill_u64(&self, addr: GpuAddr, len: usize, value: u64) -> Result<()> {
        let offset = self.offset_of(addr, len)?;
        let mut bytes = self.bytes.lock();
        for chunk in bytes[offset..offset + len].chunks_mut(8) {
            let raw = value.to_le_bytes();
            chunk.copy_from_slice(&raw[..chunk.len()]);
        }
        Ok(())
    }

    /// Copy a range out
    pub fn read_bytes(&self, addr: GpuAddr, out: &mut [u8]) -> Result<()> {
        let offset = self.offset_of(addr, out.len())?;
        out.copy_from_slice(&self.bytes.lock()[offset..offset + out.len()]);
        Ok(())
    }
}
