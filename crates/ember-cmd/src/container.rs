//! # Command Container
//!
//! The buffers, indirect heap and residency of one command list.
//!
//! ```text
//!  buffer 0                 buffer 1                 buffer 2
//! ┌──────────────────┐     ┌──────────────────┐     ┌──────────────┐
//! │ cmds ... BB_START├────▶│ cmds ... BB_START├────▶│ cmds  BB_END │
//! │ (reserved tail)  │     │ (reserved tail)  │     │ noop padding │
//! └──────────────────┘     └──────────────────┘     └──────────────┘
//! ```
//!
//! Every buffer keeps a tail large enough for a chain jump or the terminal
//! marker plus alignment padding, so neither chaining nor closing can run
//! out of space. On reset the extra buffers go to a reuse pool. A container
//! reset while the GPU may still run its commands holds the buffers and
//! heaps back until that submission completes.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ember_core::{
    AllocationKind, ByteSize, Error, GpuAddr, MemoryBackend, Result,
};
use ember_mem::ResidencyContainer;

use crate::cmds::{BatchBufferStart, HwCommand};
use crate::encoder::{CommandEncoder, HwOp};
use crate::heap::{HeapSlot, IndirectHeap};
use crate::stream::LinearStream;

/// Position of an emitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmdLocation {
    /// Buffer index inside the container
    pub buffer: usize,
    /// Byte offset inside the buffer
    pub offset: usize,
}

/// Container statistics
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    /// Buffers chained because the current one was full
    pub chained_buffers: u64,
    /// Buffers taken from the reuse pool
    pub reused_buffers: u64,
    /// Indirect heaps replaced because they were full
    pub heap_switches: u64,
}

/// Buffers and heaps a submission may still read
#[derive(Debug)]
struct InFlight {
    task: u64,
    buffers: Vec<LinearStream>,
    heaps: Vec<IndirectHeap>,
}

/// Command buffers, indirect heap and residency of a command list
#[derive(Debug)]
pub struct CommandContainer {
    memory: Arc<dyn MemoryBackend>,
    encoder: Arc<dyn CommandEncoder>,
    buffer_size: ByteSize,
    heap_size: ByteSize,
    alignment: usize,
    reserved_tail: usize,
    buffers: Vec<LinearStream>,
    pool: Vec<LinearStream>,
    heap: IndirectHeap,
    retired_heaps: Vec<IndirectHeap>,
    heap_pool: Vec<IndirectHeap>,
    in_flight: Vec<InFlight>,
    residency: ResidencyContainer,
    stats: ContainerStats,
}

impl CommandContainer {
    /// Create a container with one command buffer and one heap.
    ///
    /// `alignment` is the jump target alignment used to pad buffer ends.
    pub fn new(
        memory: Arc<dyn MemoryBackend>,
        encoder: Arc<dyn CommandEncoder>,
        buffer_size: ByteSize,
        heap_size: ByteSize,
        alignment: u32,
    ) -> Result<Self> {
        let alignment = (alignment as usize).max(4);
        let reserved_tail = BatchBufferStart::SIZE + alignment;
        if buffer_size.as_usize() <= reserved_tail * 2 {
            return Err(Error::InvalidArgument);
        }

        let first = LinearStream::new(&memory.allocate(buffer_size, AllocationKind::CommandBuffer)?);
        let heap = IndirectHeap::new(&memory.allocate(heap_size, AllocationKind::IndirectHeap)?);

        let mut container = Self {
            memory,
            encoder,
            buffer_size,
            heap_size,
            alignment,
            reserved_tail,
            buffers: alloc::vec![first],
            pool: Vec::new(),
            heap,
            retired_heaps: Vec::new(),
            heap_pool: Vec::new(),
            in_flight: Vec::new(),
            residency: ResidencyContainer::new(),
            stats: ContainerStats::default(),
        };
        container.track_own_allocations();
        Ok(container)
    }

    fn track_own_allocations(&mut self) {
        for buffer in &self.buffers {
            self.residency.push(buffer.allocation());
        }
        self.residency.push(self.heap.allocation());
        for heap in &self.retired_heaps {
            self.residency.push(heap.allocation());
        }
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    /// Encoder used for emission
    pub fn encoder(&self) -> &Arc<dyn CommandEncoder> {
        &self.encoder
    }

    /// Buffers in chain order
    pub fn buffers(&self) -> &[LinearStream] {
        &self.buffers
    }

    /// Buffer by index
    pub fn buffer_mut(&mut self, index: usize) -> Option<&mut LinearStream> {
        self.buffers.get_mut(index)
    }

    fn current_index(&self) -> usize {
        self.buffers.len() - 1
    }

    /// Buffer currently written
    pub fn current(&self) -> &LinearStream {
        &self.buffers[self.current_index()]
    }

    /// GPU address the first command executes at
    pub fn start_address(&self) -> GpuAddr {
        self.buffers[0].gpu_base()
    }

    /// Location of the write cursor
    pub fn cursor(&self) -> CmdLocation {
        CmdLocation {
            buffer: self.current_index(),
            offset: self.current().used(),
        }
    }

    /// GPU address of a location
    pub fn gpu_address_of(&self, at: CmdLocation) -> Option<GpuAddr> {
        self.buffers
            .get(at.buffer)
            .map(|b| b.gpu_base().offset(at.offset as u64))
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.buffers.len() == 1 && self.buffers[0].used() == 0
    }

    /// Total bytes recorded across buffers
    pub fn total_used(&self) -> usize {
        self.buffers.iter().map(LinearStream::used).sum()
    }

    /// Make `size` contiguous bytes available in the current buffer,
    /// chaining a new buffer when needed, and return it.
    pub fn reserve(&mut self, size: usize) -> Result<&mut LinearStream> {
        if self.current().available() < size + self.reserved_tail {
            self.chain(size)?;
        }
        let index = self.current_index();
        Ok(&mut self.buffers[index])
    }

    fn chain(&mut self, size: usize) -> Result<()> {
        if size + self.reserved_tail > self.buffer_size.as_usize() {
            return Err(Error::CommandBufferFull);
        }

        let next = match self.pool.pop() {
            Some(buffer) => {
                self.stats.reused_buffers += 1;
                buffer
            }
            None => LinearStream::new(
                &self
                    .memory
                    .allocate(self.buffer_size, AllocationKind::CommandBuffer)?,
            ),
        };

        let jump = HwOp::BatchBufferStart {
            target: next.gpu_base(),
            second_level: false,
            predicated: false,
        };
        let index = self.current_index();
        self.encoder.encode(&jump, &mut self.buffers[index])?;

        log::debug!(
            "ember-cmd: chained command buffer {} at {}",
            index + 1,
            next.gpu_base()
        );
        self.residency.push(next.allocation());
        self.buffers.push(next);
        self.stats.chained_buffers += 1;
        Ok(())
    }

    /// Encode one operation, chaining first if needed
    pub fn emit(&mut self, op: &HwOp) -> Result<CmdLocation> {
        let size = self.encoder.estimate_size(op);
        self.reserve(size)?;
        let at = self.cursor();
        let index = self.current_index();
        let written = self.encoder.encode(op, &mut self.buffers[index])?;
        #[cfg(feature = "validation")]
        debug_assert_eq!(written, size, "estimate differs from encoded size");
        #[cfg(feature = "tracing")]
        log::trace!("ember-cmd: {:?} ({} bytes) at {:?}", op, written, at);
        let _ = written;
        Ok(at)
    }

    /// Write the terminal command into the reserved tail and pad the buffer
    /// end to the jump alignment.
    pub fn terminate(&mut self, terminal: &HwOp) -> Result<CmdLocation> {
        let at = self.cursor();
        let index = self.current_index();
        let stream = &mut self.buffers[index];
        self.encoder.encode(terminal, stream)?;

        let padding = stream.used().next_multiple_of(self.alignment) - stream.used();
        if padding > 0 {
            self.encoder.encode(
                &HwOp::Noop {
                    dwords: (padding / 4) as u32,
                },
                stream,
            )?;
        }
        Ok(at)
    }

    /// Jump alignment of buffer ends
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    // =========================================================================
    // Indirect heap
    // =========================================================================

    /// Current indirect heap
    pub fn heap(&self) -> &IndirectHeap {
        &self.heap
    }

    /// Store cross-thread data, replacing the heap when it is full.
    ///
    /// Returns the slot and whether the heap base changed.
    pub fn push_indirect(&mut self, data: &[u8]) -> Result<(HeapSlot, bool)> {
        if self.heap.fits(data.len()) {
            return Ok((self.heap.push(data)?, false));
        }
        if data.len() > self.heap_size.as_usize() {
            return Err(Error::InvalidArgument);
        }

        let fresh = match self.heap_pool.pop() {
            Some(heap) => heap,
            None => IndirectHeap::new(
                &self
                    .memory
                    .allocate(self.heap_size, AllocationKind::IndirectHeap)?,
            ),
        };
        let old = core::mem::replace(&mut self.heap, fresh);
        self.retired_heaps.push(old);
        self.residency.push(self.heap.allocation());
        self.stats.heap_switches += 1;
        log::debug!("ember-cmd: indirect heap switched to {}", self.heap.base());

        Ok((self.heap.push(data)?, true))
    }

    // =========================================================================
    // Residency
    // =========================================================================

    /// Allocations referenced by the recorded commands
    pub fn residency(&self) -> &ResidencyContainer {
        &self.residency
    }

    /// Mutable residency
    pub fn residency_mut(&mut self) -> &mut ResidencyContainer {
        &mut self.residency
    }

    /// Statistics
    pub fn stats(&self) -> &ContainerStats {
        &self.stats
    }

    // =========================================================================
    // Lifetime
    // =========================================================================

    /// Drop everything recorded after `at`. Buffers chained since then go
    /// back to the reuse pool.
    pub fn rewind(&mut self, at: CmdLocation) {
        if at.buffer >= self.buffers.len() {
            return;
        }
        let mut extra = self.buffers.split_off(at.buffer + 1);
        for buffer in &mut extra {
            buffer.reset();
        }
        self.pool.append(&mut extra);
        self.buffers[at.buffer].truncate(at.offset);
    }

    /// Return to a single empty buffer and an empty heap
    pub fn reset(&mut self) {
        let mut extra = self.buffers.split_off(1);
        for buffer in &mut extra {
            buffer.reset();
        }
        self.pool.append(&mut extra);
        self.buffers[0].reset();

        self.heap.reset();
        for mut heap in self.retired_heaps.drain(..) {
            heap.reset();
            self.heap_pool.push(heap);
        }

        self.residency.clear();
        self.track_own_allocations();
    }

    /// Like [`reset`](Self::reset), but the recorded commands may still run
    /// on the GPU as submission `task`. Their buffers and heaps are held
    /// back until `is_complete` reports the task done, and recording goes on
    /// in other memory.
    pub fn reset_in_flight(&mut self, task: u64, is_complete: impl Fn(u64) -> bool) -> Result<()> {
        self.reclaim(&is_complete);
        if is_complete(task) {
            self.reset();
            return Ok(());
        }

        let buffer = match self.pool.pop() {
            Some(buffer) => {
                self.stats.reused_buffers += 1;
                buffer
            }
            None => LinearStream::new(
                &self
                    .memory
                    .allocate(self.buffer_size, AllocationKind::CommandBuffer)?,
            ),
        };
        let heap = match self.heap_pool.pop() {
            Some(heap) => heap,
            None => match self.memory.allocate(self.heap_size, AllocationKind::IndirectHeap) {
                Ok(info) => IndirectHeap::new(&info),
                Err(e) => {
                    self.pool.push(buffer);
                    return Err(e);
                }
            },
        };

        let buffers = core::mem::replace(&mut self.buffers, alloc::vec![buffer]);
        let mut heaps = core::mem::take(&mut self.retired_heaps);
        heaps.push(core::mem::replace(&mut self.heap, heap));
        log::debug!(
            "ember-cmd: holding {} buffer(s) and {} heap(s) until task {}",
            buffers.len(),
            heaps.len(),
            task
        );
        self.in_flight.push(InFlight {
            task,
            buffers,
            heaps,
        });

        self.residency.clear();
        self.track_own_allocations();
        Ok(())
    }

    /// Move held-back memory of completed submissions to the reuse pools
    fn reclaim(&mut self, is_complete: &impl Fn(u64) -> bool) {
        let (done, pending): (Vec<_>, Vec<_>) = core::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|held| is_complete(held.task));
        self.in_flight = pending;
        for held in done {
            for mut buffer in held.buffers {
                buffer.reset();
                self.pool.push(buffer);
            }
            for mut heap in held.heaps {
                heap.reset();
                self.heap_pool.push(heap);
            }
        }
    }

    /// Submissions whose memory is still held back
    pub fn in_flight_tasks(&self) -> usize {
        self.in_flight.len()
    }
}

impl Drop for CommandContainer {
    fn drop(&mut self) {
        let held_buffers = self.in_flight.iter().flat_map(|held| held.buffers.iter());
        let held_heaps = self.in_flight.iter().flat_map(|held| held.heaps.iter());
        let ids = self
            .buffers
            .iter()
            .chain(self.pool.iter())
            .chain(held_buffers)
            .map(LinearStream::allocation)
            .chain(
                core::iter::once(&self.heap)
                    .chain(self.retired_heaps.iter())
                    .chain(self.heap_pool.iter())
                    .chain(held_heaps)
                    .map(IndirectHeap::allocation),
            );
        for id in ids {
            if self.memory.free(id).is_err() {
                log::warn!("ember-cmd: failed to free command allocation {:?}", id);
            }
        }
    }
}
