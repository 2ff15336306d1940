//! # GPU Address Space Management
//!
//! First-fit virtual address range allocation.

use alloc::vec::Vec;

use ember_core::{ByteSize, Error, GpuAddr, Result};

// =============================================================================
// VIRTUAL ADDRESS RANGE
// =============================================================================

/// A range in GPU virtual address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRange {
    /// Start address
    pub start: GpuAddr,
    /// End address (exclusive)
    pub end: GpuAddr,
}

impl VaRange {
    /// Create a new VA range
    pub const fn new(start: GpuAddr, size: ByteSize) -> Self {
        Self {
            start,
            end: start.offset(size.as_bytes()),
        }
    }

    /// Get range size
    pub fn size(&self) -> ByteSize {
        ByteSize::from_bytes(self.end - self.start)
    }

    /// Check if address is in range
    pub fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if `[addr, addr + len)` lies fully inside the range
    pub fn contains_span(&self, addr: GpuAddr, len: u64) -> bool {
        self.contains(addr) && len <= self.end - addr
    }

    /// Check if ranges overlap
    pub fn overlaps(&self, other: &VaRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// =============================================================================
// VA BLOCK
// =============================================================================

#[derive(Debug, Clone)]
struct VaBlock {
    range: VaRange,
    free: bool,
}

// =============================================================================
// ADDRESS SPACE
// =============================================================================

/// GPU virtual address space
#[derive(Debug)]
pub struct AddressSpace {
    /// Managed range
    range: VaRange,
    /// VA blocks, sorted by address
    blocks: Vec<VaBlock>,
    /// Statistics
    stats: AddressSpaceStats,
}

/// Address space statistics
#[derive(Debug, Clone, Default)]
pub struct AddressSpaceStats {
    /// Number of allocations
    pub allocs: u64,
    /// Number of frees
    pub frees: u64,
    /// Current allocated bytes
    pub allocated: u64,
}

impl AddressSpace {
    /// Page granularity of every allocation
    pub const PAGE_SIZE: u64 = 4096;

    /// Create a new address space
    pub fn new(range: VaRange) -> Self {
        Self {
            range,
            blocks: alloc::vec![VaBlock { range, free: true }],
            stats: AddressSpaceStats::default(),
        }
    }

    /// Get managed range
    pub fn range(&self) -> VaRange {
        self.range
    }

    /// Allocate virtual address range
    pub fn allocate(&mut self, size: ByteSize, alignment: u64) -> Result<VaRange> {
        let size = size.align_up(Self::PAGE_SIZE).as_bytes();
        let alignment = alignment.max(Self::PAGE_SIZE);

        for i in 0..self.blocks.len() {
            if !self.blocks[i].free {
                continue;
            }

            let block = self.blocks[i].range;
            let aligned_start = block.start.align_up(alignment);
            let aligned_end = aligned_start.offset(size);

            if aligned_start >= block.start && aligned_end <= block.end {
                let alloc_range = VaRange {
                    start: aligned_start,
                    end: aligned_end,
                };
                self.split_block(i, alloc_range);

                self.stats.allocs += 1;
                self.stats.allocated += size;

                return Ok(alloc_range);
            }
        }

        Err(Error::OutOfDeviceMemory)
    }

    /// Split a block around an allocation
    fn split_block(&mut self, index: usize, alloc: VaRange) {
        let block = self.blocks.remove(index);
        let mut at = index;

        if alloc.start > block.range.start {
            self.blocks.insert(at, VaBlock {
                range: VaRange {
                    start: block.range.start,
                    end: alloc.start,
                },
                free: true,
            });
            at += 1;
        }

        self.blocks.insert(at, VaBlock {
            range: alloc,
            free: false,
        });

        if alloc.end < block.range.end {
            self.blocks.insert(at + 1, VaBlock {
                range: VaRange {
                    start: alloc.end,
                    end: block.range.end,
                },
                free: true,
            });
        }
    }

    /// Free a virtual address range
    pub fn free(&mut self, range: VaRange) -> Result<()> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.range == range && !b.free)
            .ok_or(Error::NotFound)?;

        self.blocks[index].free = true;
        self.stats.frees += 1;
        self.stats.allocated -= range.size().as_bytes();

        self.merge_free_blocks();

        Ok(())
    }

    /// Merge adjacent free blocks
    fn merge_free_blocks(&mut self) {
        let mut i = 0;
        while i + 1 < self.blocks.len() {
            if self.blocks[i].free && self.blocks[i + 1].free {
                self.blocks[i].range.end = self.blocks[i + 1].range.end;
                self.blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Get statistics
    pub fn stats(&self) -> &AddressSpaceStats {
        &self.stats
    }

    /// Get free space
    pub fn free_space(&self) -> ByteSize {
        ByteSize::from_bytes(
            self.blocks
                .iter()
                .filter(|b| b.free)
                .map(|b| b.range.size().as_bytes())
                .sum(),
        )
    }
}
