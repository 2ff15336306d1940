//! # Command Queue
//!
//! Executes closed command lists on one engine of a device.
//!
//! ```text
//!   queue buffer (one submission)
//!  ┌──────────────────────────────────────────────────────────────────┐
//!  │ [partition regs] [event waits]                                   │
//!  │ [preamble A] ──▶ list A                                          │
//!  │              ◀──                                                 │
//!  │ [preamble B] ──▶ list B  (primary mode without preamble: A ──▶ B)│
//!  │              ◀──                                                 │
//!  │ task count post-sync                                             │
//!  │ BB_END                    (ring: SEMAPHORE_WAIT + jump onwards)  │
//!  └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All queue-global state lives behind one lock: the committed stream
//! state, the queue buffers, scratch, the task count and the device-lost
//! flag. Device loss is only ever observed by [`CommandQueue::synchronize`];
//! once seen, every later submission fails with [`Error::DeviceLost`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use ember_cmd::cmds::{CompareOp, FlushPostSync};
use ember_cmd::{
    CmdLocation, CommandContainer, CommandEncoder, Device, HwOp, LinearStream, PatchKind,
    PipeControlFlags,
};
use ember_core::{
    AllocationKind, BatchBufferDescriptor, ByteSize, EngineGroupType, Error, GpuAddr,
    HostVisibleMemory, IndirectAccess, Result, SubmissionBoundary, SubmissionMode, SubmitFlags,
    TileMask, WaitStatus,
};
use ember_event::{Event, RESET_SENTINEL, SIGNALED_SENTINEL};
use ember_list::{CommandList, TransitionContext};
use ember_mem::ResidencyContainer;
use ember_scaling::{emit_partition_registers, PARTITION_REGISTERS_SIZE};

use crate::chain::{self, ListChain};
use crate::fence::Fence;
use crate::preamble::{Preamble, PreambleCheckpoint};
use crate::scratch::ScratchController;

/// Offset of the completed task count inside the tag allocation
pub const TASK_COUNT_OFFSET: u64 = 0;
/// Offset of the ring release semaphore inside the tag allocation
pub const RING_SEMAPHORE_OFFSET: u64 = 8;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// When [`CommandQueue::execute_command_lists`] returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// After submission
    #[default]
    Asynchronous,
    /// After the submitted work completed
    Synchronous,
}

/// Queue creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandQueueDesc {
    /// Engine group executed on
    pub engine: EngineGroupType,
    /// Completion behavior
    pub mode: QueueMode,
}

impl CommandQueueDesc {
    /// Asynchronous queue on `engine`
    pub fn new(engine: EngineGroupType) -> Self {
        Self {
            engine,
            mode: QueueMode::Asynchronous,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Batches handed to the submission boundary
    pub submissions: u64,
    /// Preambles emitted in front of lists
    pub preambles: u64,
    /// Closed lists skipped because they recorded nothing
    pub skipped_lists: u64,
    /// Primary lists entered straight from their predecessor
    pub direct_links: u64,
    /// Switches to another queue buffer
    pub buffer_switches: u64,
    /// Submissions that made indirect allocations resident
    pub indirect_residency_passes: u64,
}

// =============================================================================
// QUEUE STATE
// =============================================================================

#[derive(Debug)]
struct QueueBuffer {
    container: CommandContainer,
    /// Task count of the last submission using the buffer
    last_task: u64,
}

impl QueueBuffer {
    fn new(device: &Device) -> Result<Self> {
        let container = CommandContainer::new(
            Arc::clone(device.memory()),
            Arc::clone(device.encoder()),
            device.config().queue_buffer_size,
            ByteSize::KIB_4,
            device.jump_target_alignment(),
        )?;
        Ok(Self {
            container,
            last_task: 0,
        })
    }
}

#[derive(Debug, Default)]
struct RingState {
    /// The command streamer is parked at a ring semaphore
    running: bool,
    /// Chunks released so far, as stored in the 32-bit ring semaphore
    chunks: u32,
}

#[derive(Debug)]
struct QueueState {
    buffers: Vec<QueueBuffer>,
    active: usize,
    preamble: Preamble,
    scratch: ScratchController,
    task_count: u64,
    device_lost: bool,
    partition_registers_programmed: bool,
    ring: RingState,
    stats: QueueStats,
}

/// Queue state a failed submission must not leave behind
#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    preamble: PreambleCheckpoint,
    task_count: u64,
    partition_registers_programmed: bool,
    active: usize,
    cursor: CmdLocation,
}

impl Checkpoint {
    fn take(state: &QueueState) -> Self {
        Self {
            preamble: state.preamble.checkpoint(),
            task_count: state.task_count,
            partition_registers_programmed: state.partition_registers_programmed,
            active: state.active,
            cursor: state.buffers[state.active].container.cursor(),
        }
    }

    fn restore(self, state: &mut QueueState) {
        state.preamble.restore(self.preamble);
        state.task_count = self.task_count;
        state.partition_registers_programmed = self.partition_registers_programmed;
        state.active = self.active;
        state.buffers[self.active].container.rewind(self.cursor);
        log::debug!("ember-queue: rolled back to task {}", self.task_count);
    }
}

/// Index of a queue buffer no submission still runs on, other than `active`.
/// Never blocks: a new buffer is created when all others are busy.
fn acquire_spare(
    buffers: &mut Vec<QueueBuffer>,
    active: usize,
    device: &Device,
    submitter: &dyn SubmissionBoundary,
) -> Result<usize> {
    let free = buffers.iter().enumerate().position(|(index, buffer)| {
        index != active
            && (buffer.last_task == 0
                || submitter.wait_for_task_count(buffer.last_task, 0) == WaitStatus::Ready)
    });
    match free {
        Some(index) => {
            buffers[index].container.reset();
            Ok(index)
        }
        None => {
            buffers.push(QueueBuffer::new(device)?);
            Ok(buffers.len() - 1)
        }
    }
}

/// Bytes from `start` to the end of the container
fn used_since(container: &CommandContainer, start: CmdLocation) -> usize {
    container.buffers()[start.buffer..]
        .iter()
        .map(LinearStream::used)
        .sum::<usize>()
        - start.offset
}

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// A command queue
#[derive(Debug)]
pub struct CommandQueue {
    id: u64,
    device: Arc<Device>,
    engine: EngineGroupType,
    mode: QueueMode,
    submission_mode: SubmissionMode,
    submitter: Arc<dyn SubmissionBoundary>,
    tag: Arc<HostVisibleMemory>,
    inner: Mutex<QueueState>,
}

impl CommandQueue {
    /// Create a queue submitting through `submitter`
    pub fn create(
        device: Arc<Device>,
        desc: CommandQueueDesc,
        submitter: Arc<dyn SubmissionBoundary>,
    ) -> Result<Self> {
        let tag = device
            .memory()
            .allocate_host_visible(ByteSize::KIB_4, AllocationKind::TagBuffer)?;
        let buffer = QueueBuffer::new(&device)?;
        let threads = device.caps().max_hw_threads() * device.tile_count();
        let scratch = ScratchController::new(Arc::clone(device.memory()), threads);
        let preamble = Preamble::new(TransitionContext::for_caps(device.caps().as_ref()));
        let submission_mode = if desc.engine.is_copy_only() {
            SubmissionMode::Batched
        } else {
            device.config().submission_mode
        };
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "ember-queue: created queue {} ({:?}, {:?}, {:?}) on {}",
            id,
            desc.engine,
            desc.mode,
            submission_mode,
            device.family()
        );

        Ok(Self {
            id,
            device,
            engine: desc.engine,
            mode: desc.mode,
            submission_mode,
            submitter,
            tag,
            inner: Mutex::new(QueueState {
                buffers: alloc::vec![buffer],
                active: 0,
                preamble,
                scratch,
                task_count: 0,
                device_lost: false,
                partition_registers_programmed: false,
                ring: RingState::default(),
                stats: QueueStats::default(),
            }),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Process-unique queue identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Owning device
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Engine group
    pub fn engine(&self) -> EngineGroupType {
        self.engine
    }

    /// Completion behavior
    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// How submissions end
    pub fn submission_mode(&self) -> SubmissionMode {
        self.submission_mode
    }

    /// Task count and ring semaphore memory
    pub fn tag(&self) -> &Arc<HostVisibleMemory> {
        &self.tag
    }

    /// Task count of the latest submission
    pub fn task_count(&self) -> u64 {
        self.inner.lock().task_count
    }

    /// Whether submission `task` finished, without waiting
    pub fn is_task_complete(&self, task: u64) -> bool {
        task == 0 || self.submitter.wait_for_task_count(task, 0) == WaitStatus::Ready
    }

    /// Statistics snapshot
    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats.clone()
    }

    /// Whether synchronize observed a device loss
    pub fn is_device_lost(&self) -> bool {
        self.inner.lock().device_lost
    }

    /// Scratch base, once any list needed scratch
    pub fn scratch_address(&self) -> Option<GpuAddr> {
        self.inner.lock().scratch.address()
    }

    /// Fence tracking submissions of this queue
    pub fn create_fence(&self) -> Fence {
        Fence::new(Arc::clone(&self.submitter), self.id)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn epilogue_size(&self, encoder: &dyn CommandEncoder, alignment: usize) -> usize {
        let post_sync = if self.engine.is_copy_only() {
            encoder.estimate_size(&HwOp::FlushDw {
                address: GpuAddr::null(),
                post_sync: FlushPostSync::WriteImmediate(0),
            })
        } else {
            encoder.estimate_size(&HwOp::PipeControl {
                flags: PipeControlFlags::CS_STALL,
                address: GpuAddr::null(),
                data: 0,
            })
        };
        let ring_wait = encoder.estimate_size(&HwOp::SemaphoreWait {
            address: GpuAddr::null(),
            value: 0,
            op: CompareOp::GreaterOrEqual,
        });
        post_sync + ring_wait + alignment
    }

    /// Execute closed command lists in order.
    ///
    /// Empty lists are skipped. Every list must target this queue's engine
    /// kind and be closed; nothing is emitted otherwise. `waits` are waited
    /// on before the first list, `fence` is armed with the submission's
    /// task count.
    pub fn execute_command_lists(
        &self,
        lists: &mut [&mut CommandList],
        fence: Option<&Fence>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        let task = {
            let mut state = self.inner.lock();
            self.submit_locked(&mut state, lists, fence, waits)?
        };
        match (task, self.mode) {
            (Some(_), QueueMode::Synchronous) => self.synchronize(u64::MAX),
            _ => Ok(()),
        }
    }

    fn validate(
        &self,
        state: &QueueState,
        lists: &[&mut CommandList],
        fence: Option<&Fence>,
    ) -> Result<()> {
        if state.device_lost {
            return Err(Error::DeviceLost);
        }
        if fence.is_some_and(|fence| fence.queue_id() != self.id) {
            return Err(Error::InvalidArgument);
        }
        for list in lists {
            if list.engine().is_copy_only() != self.engine.is_copy_only()
                || !Arc::ptr_eq(list.device(), &self.device)
            {
                return Err(Error::InvalidArgument);
            }
            if !list.is_closed() {
                return Err(Error::InvalidState);
            }
        }
        Ok(())
    }

    fn submit_locked(
        &self,
        state: &mut QueueState,
        lists: &mut [&mut CommandList],
        fence: Option<&Fence>,
        waits: &[Arc<Event>],
    ) -> Result<Option<u64>> {
        self.validate(state, lists, fence)?;

        let selected: Vec<usize> = (0..lists.len()).filter(|&i| !lists[i].is_empty()).collect();
        let skipped = lists.len() - selected.len();
        if skipped > 0 {
            state.stats.skipped_lists += skipped as u64;
            log::debug!("ember-queue: skipped {} empty list(s)", skipped);
        }
        if selected.is_empty() && waits.is_empty() && fence.is_none() {
            return Ok(None);
        }

        // Scratch grows for good, even if this submission fails
        let QueueState { preamble, scratch, .. } = &mut *state;
        let per_thread = selected
            .iter()
            .map(|&i| lists[i].properties().scratch_per_thread)
            .max()
            .unwrap_or(0);
        if scratch.ensure(per_thread)? {
            preamble.invalidate_front_end();
        }
        if let Some(address) = scratch.address() {
            for &i in &selected {
                lists[i].apply_patches(|kind| (kind == PatchKind::ScratchAddress).then_some(address))?;
            }
        }

        let checkpoint = Checkpoint::take(state);
        match self.emit_and_submit(state, lists, &selected, fence, waits) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                checkpoint.restore(state);
                Err(e)
            }
        }
    }

    /// Build the queue buffer commands for `selected` and submit them.
    ///
    /// Queue state changed here is rolled back by the caller on error.
    fn emit_and_submit(
        &self,
        state: &mut QueueState,
        lists: &mut [&mut CommandList],
        selected: &[usize],
        fence: Option<&Fence>,
        waits: &[Arc<Event>],
    ) -> Result<u64> {
        let copy_only = self.engine.is_copy_only();
        let encoder = Arc::clone(self.device.encoder());
        let encoder = encoder.as_ref();
        let memory = self.device.memory();

        let QueueState {
            buffers,
            active,
            preamble,
            scratch,
            task_count,
            partition_registers_programmed,
            ring,
            stats,
            ..
        } = state;
        let scratch_address = scratch.address().unwrap_or_else(GpuAddr::null);

        // Queue buffer
        let entry_size = encoder.estimate_size(&HwOp::BatchBufferStart {
            target: GpuAddr::null(),
            second_level: false,
            predicated: false,
        });
        let wait_size = encoder.estimate_size(&HwOp::SemaphoreWait {
            address: GpuAddr::null(),
            value: 0,
            op: CompareOp::Equal,
        });
        let list_size = Preamble::estimate(encoder) + entry_size;
        let alignment = buffers[*active].container.alignment();
        let epilogue = self.epilogue_size(encoder, alignment);
        let estimate = PARTITION_REGISTERS_SIZE
            + waits
                .iter()
                .map(|event| event.packets_to_check() as usize * wait_size)
                .sum::<usize>()
            + selected.len() * list_size
            + epilogue
            + entry_size;

        if self.submission_mode == SubmissionMode::Batched
            && buffers[*active].container.current().available() < estimate
        {
            let next = acquire_spare(buffers, *active, &self.device, self.submitter.as_ref())?;
            *active = next;
            stats.buffer_switches += 1;
            log::debug!("ember-queue: switched to queue buffer {}", next);
        }
        let buffer_index = *active;
        let container = &mut buffers[buffer_index].container;
        container.reserve(entry_size)?;
        let start = container.cursor();

        let mut residency = ResidencyContainer::new();
        residency.push(self.tag.allocation());

        // Partition registers
        if !*partition_registers_programmed && self.device.partition_tile_count(self.engine) > 1 {
            if let Some(work_partition) = self.device.work_partition() {
                let stream = container.reserve(PARTITION_REGISTERS_SIZE)?;
                emit_partition_registers(
                    encoder,
                    stream,
                    self.device.event_packet_size(),
                    work_partition.gpu_base(),
                )?;
                residency.push(work_partition.allocation());
                *partition_registers_programmed = true;
                log::debug!("ember-queue: programmed partition registers");
            }
        }

        // Event waits
        for event in waits {
            residency.push(event.allocation());
            let (value, op) = if event.is_timestamp() {
                (RESET_SENTINEL as u32, CompareOp::NotEqual)
            } else {
                (SIGNALED_SENTINEL as u32, CompareOp::Equal)
            };
            for index in 0..event.packets_to_check() {
                container.emit(&HwOp::SemaphoreWait {
                    address: event.completion_address(index),
                    value,
                    op,
                })?;
            }
        }

        // Lists
        let mut chain = ListChain::new();
        let mut flags = SubmitFlags::TASK_COUNT_POST_SYNC;
        let mut indirect = IndirectAccess::empty();
        for &index in selected {
            let needs_preamble = !copy_only && preamble.stage(lists[index].required_state());
            let primary = lists[index].uses_primary_batch_buffer();
            if primary {
                flags |= SubmitFlags::PRIMARY_BATCH_BUFFER;
            }

            if primary && !needs_preamble && chain.link_direct(lists, index)? {
                stats.direct_links += 1;
            } else {
                if primary {
                    let back = container.reserve(list_size)?.current_gpu_address();
                    chain.resolve(lists, back)?;
                }
                if needs_preamble {
                    preamble.emit(container, scratch_address)?;
                    stats.preambles += 1;
                }
                chain::emit_entry(container, lists[index])?;
            }
            if primary {
                chain.enter(index);
            }

            let list = &lists[index];
            if !copy_only {
                preamble.commit(list.final_state());
            }
            let properties = list.properties();
            if properties.has_stalling_commands {
                flags |= SubmitFlags::HAS_STALLING_COMMANDS;
            }
            indirect |= properties.indirect_access;
            residency.extend(list.residency().as_slice().iter().copied());
        }

        // Epilogue
        let back = container.reserve(epilogue)?.current_gpu_address();
        chain.resolve(lists, back)?;

        *task_count += 1;
        let task = *task_count;
        let tag_address = self.tag.gpu_base().offset(TASK_COUNT_OFFSET);
        if copy_only {
            container.emit(&HwOp::FlushDw {
                address: tag_address,
                post_sync: FlushPostSync::WriteImmediate(task),
            })?;
        } else {
            container.emit(&HwOp::PipeControl {
                flags: PipeControlFlags::CS_STALL | PipeControlFlags::POST_SYNC_WRITE_IMMEDIATE,
                address: tag_address,
                data: task,
            })?;
        }

        let mut ring_chunk = None;
        let mut next_active = buffer_index;
        if self.submission_mode == SubmissionMode::Ring {
            let chunk = ring.chunks.wrapping_add(1);
            let container = &mut buffers[buffer_index].container;
            container.emit(&HwOp::SemaphoreWait {
                address: self.tag.gpu_base().offset(RING_SEMAPHORE_OFFSET),
                value: chunk.wrapping_add(1),
                op: CompareOp::GreaterOrEqual,
            })?;
            let current = container.current();
            let end = (current.used() + entry_size).next_multiple_of(alignment);
            let target = if current.capacity() - end < current.capacity() / 4 {
                next_active = acquire_spare(buffers, buffer_index, &self.device, self.submitter.as_ref())?;
                stats.buffer_switches += 1;
                log::debug!("ember-queue: ring continues in queue buffer {}", next_active);
                buffers[next_active].container.start_address()
            } else {
                current.gpu_base().offset(end as u64)
            };
            buffers[buffer_index].container.terminate(&HwOp::BatchBufferStart {
                target,
                second_level: false,
                predicated: false,
            })?;
            flags |= SubmitFlags::RING;
            ring_chunk = Some(chunk);
        } else {
            buffers[buffer_index].container.terminate(&HwOp::BatchBufferEnd)?;
        }

        if self.mode == QueueMode::Synchronous {
            flags |= SubmitFlags::SYNCHRONOUS;
        }

        // Residency
        if !indirect.is_empty() {
            residency.extend(memory.make_indirect_allocations_resident(indirect));
            flags |= SubmitFlags::INDIRECT_RESIDENCY;
            stats.indirect_residency_passes += 1;
        }
        if let Some(id) = scratch.allocation() {
            residency.push(id);
        }
        let container = &buffers[buffer_index].container;
        residency.extend(container.residency().as_slice().iter().copied());
        for &id in residency.as_slice() {
            memory.mark_resident(id);
        }

        let first = &container.buffers()[start.buffer];
        let descriptor = BatchBufferDescriptor {
            commands: &first.as_bytes()[start.offset..],
            gpu_start: first.gpu_base().offset(start.offset as u64),
            used_size: used_since(container, start),
            residency: residency.as_slice(),
            flags,
            task_count: task,
            tile_mask: if copy_only {
                TileMask::first(1)
            } else {
                self.device.tile_mask()
            },
        };

        let used_size = descriptor.used_size;
        if let Err(e) = self.submitter.submit(&descriptor) {
            log::warn!("ember-queue: submission {} failed: {}", task, e);
            return Err(e);
        }

        buffers[buffer_index].last_task = task;
        if let Some(chunk) = ring_chunk {
            ring.chunks = chunk;
            ring.running = true;
            if let Err(e) = self
                .tag
                .write_u32(self.tag.gpu_base().offset(RING_SEMAPHORE_OFFSET), chunk)
            {
                log::warn!("ember-queue: failed to release ring chunk {}: {}", chunk, e);
            }
        }
        *active = next_active;
        stats.submissions += 1;
        if let Some(fence) = fence {
            fence.arm(task);
        }

        log::debug!(
            "ember-queue: submitted {} list(s) as task {} ({} bytes, {:?})",
            selected.len(),
            task,
            used_size,
            flags
        );
        Ok(task)
    }

    /// Wait for every submission so far.
    ///
    /// A hang observed here marks the queue as lost for good.
    pub fn synchronize(&self, timeout_ns: u64) -> Result<()> {
        let task = {
            let state = self.inner.lock();
            if state.device_lost {
                return Err(Error::DeviceLost);
            }
            state.task_count
        };
        if task == 0 {
            return Ok(());
        }
        match self.submitter.wait_for_task_count(task, timeout_ns) {
            WaitStatus::Ready => Ok(()),
            WaitStatus::NotReady => Err(Error::Timeout),
            WaitStatus::GpuHang => {
                log::warn!("ember-queue: device lost while waiting for task {}", task);
                self.inner.lock().device_lost = true;
                Err(Error::DeviceLost)
            }
        }
    }

    /// End a running ring with a final batch buffer end. Batched queues
    /// have nothing to do.
    pub fn finalize(&self) -> Result<()> {
        if self.submission_mode != SubmissionMode::Ring {
            return Ok(());
        }
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if state.device_lost {
            return Err(Error::DeviceLost);
        }
        if !state.ring.running {
            return Ok(());
        }

        let container = &mut state.buffers[state.active].container;
        container.reserve(0)?;
        let start = container.cursor();
        container.terminate(&HwOp::BatchBufferEnd)?;
        let chunk = state.ring.chunks.wrapping_add(1);

        let first = &container.buffers()[start.buffer];
        let descriptor = BatchBufferDescriptor {
            commands: &first.as_bytes()[start.offset..],
            gpu_start: first.gpu_base().offset(start.offset as u64),
            used_size: used_since(container, start),
            residency: container.residency().as_slice(),
            flags: SubmitFlags::RING | SubmitFlags::FINAL,
            task_count: state.task_count,
            tile_mask: self.device.tile_mask(),
        };
        self.submitter.submit(&descriptor)?;
        self.tag
            .write_u32(self.tag.gpu_base().offset(RING_SEMAPHORE_OFFSET), chunk)?;
        state.ring.chunks = chunk;
        state.ring.running = false;
        state.stats.submissions += 1;
        log::debug!("ember-queue: ring finalized after {} chunk(s)", chunk);
        Ok(())
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if let Err(e) = self.device.memory().free(self.tag.allocation()) {
            log::warn!("ember-queue: failed to free tag of queue {}: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSubmitter, CapturedBatch};
    use crate::fence::FenceStatus;
    use crate::testing::{kernel, list, parse_batch, terminal_target, Env};
    use ember_cmd::cmds::regs;
    use ember_cmd::parse::count_kind;
    use ember_cmd::{Command, CommandKind, KernelDescriptor};
    use ember_core::{AllocationResolver, DispatchConfig, GroupCount, HwFamily, PreemptionMode};
    use ember_event::{EventDesc, EventPool, EventPoolDesc, EventPoolFlags, SignalScope};

    fn queue(env: &Env, desc: CommandQueueDesc) -> (CommandQueue, Arc<CaptureSubmitter>) {
        queue_with(env, desc, CaptureSubmitter::new())
    }

    fn queue_with(
        env: &Env,
        desc: CommandQueueDesc,
        capture: CaptureSubmitter,
    ) -> (CommandQueue, Arc<CaptureSubmitter>) {
        let capture = Arc::new(capture);
        let submitter: Arc<dyn SubmissionBoundary> = capture.clone();
        match CommandQueue::create(Arc::clone(&env.device), desc, submitter) {
            Ok(queue) => (queue, capture),
            Err(e) => panic!("queue: {e}"),
        }
    }

    fn compute() -> CommandQueueDesc {
        CommandQueueDesc::new(EngineGroupType::Compute)
    }

    fn recorded(env: &Env, configure: impl FnOnce(&mut KernelDescriptor)) -> CommandList {
        let mut list = list(&env.device, EngineGroupType::Compute);
        let k = kernel(&env.device, configure);
        assert_eq!(list.append_launch_kernel(&k, GroupCount::linear(8), None, &[]), Ok(()));
        assert_eq!(list.close(), Ok(()));
        list
    }

    fn thread_group(desc: &mut KernelDescriptor) {
        desc.requirements.max_preemption = Some(PreemptionMode::ThreadGroup);
    }

    fn closed_empty(env: &Env) -> CommandList {
        let mut list = list(&env.device, EngineGroupType::Compute);
        assert_eq!(list.close(), Ok(()));
        list
    }

    fn last(capture: &CaptureSubmitter) -> CapturedBatch {
        match capture.last() {
            Some(batch) => batch,
            None => panic!("nothing submitted"),
        }
    }

    fn preemption_loads(batch: &CapturedBatch) -> usize {
        parse_batch(batch)
            .iter()
            .filter(|c| matches!(c.command, Command::LoadRegisterImm(lri) if lri.register == regs::CS_CHICKEN1))
            .count()
    }

    #[test]
    fn test_same_required_state_gets_one_preamble() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue(&env, compute());
        let mut a = recorded(&env, thread_group);

        for _ in 0..3 {
            assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
        }
        assert_eq!(queue.stats().preambles, 1);
        let batches = capture.batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(count_kind(&parse_batch(&batches[0]), CommandKind::FrontEndState), 1);
        let later = parse_batch(&batches[2]);
        assert_eq!(count_kind(&later, CommandKind::FrontEndState), 0);
        assert_eq!(count_kind(&later, CommandKind::StateBaseAddress), 0);
        assert_eq!(count_kind(&later, CommandKind::BatchBufferStart), 1);
    }

    #[test]
    fn test_distinct_lists_with_same_state_share_one_preamble() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue(&env, compute());
        let mut a = recorded(&env, thread_group);
        let mut b = recorded(&env, thread_group);
        assert_eq!(a.required_state(), b.required_state());

        for _ in 0..2 {
            assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
            assert_eq!(queue.execute_command_lists(&mut [&mut b], None, &[]), Ok(()));
        }
        assert_eq!(queue.stats().preambles, 1);
        for batch in &capture.batches()[1..] {
            let parsed = parse_batch(batch);
            assert_eq!(count_kind(&parsed, CommandKind::StateBaseAddress), 0);
            assert_eq!(count_kind(&parsed, CommandKind::FrontEndState), 0);
        }
    }

    #[test]
    fn test_preamble_carries_only_changed_axes() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue(&env, compute());
        let mut a = recorded(&env, thread_group);
        let mut b = recorded(&env, thread_group);
        assert_eq!(queue.execute_command_lists(&mut [&mut a, &mut b], None, &[]), Ok(()));
        let parsed = parse_batch(&last(&capture));
        assert_eq!(preemption_loads(&last(&capture)), 1);
        assert_eq!(count_kind(&parsed, CommandKind::StateBaseAddress), 1);
        assert_eq!(count_kind(&parsed, CommandKind::FrontEndState), 1);
        assert_eq!(queue.stats().preambles, 1);

        // Only the preemption axis differs for C
        let mut c = recorded(&env, |desc| {
            desc.requirements.max_preemption = Some(PreemptionMode::MidBatch);
        });
        assert_eq!(queue.execute_command_lists(&mut [&mut c], None, &[]), Ok(()));
        let parsed = parse_batch(&last(&capture));
        assert_eq!(preemption_loads(&last(&capture)), 1);
        assert_eq!(count_kind(&parsed, CommandKind::StateBaseAddress), 0);
        assert_eq!(count_kind(&parsed, CommandKind::FrontEndState), 0);
        assert_eq!(queue.stats().preambles, 2);
    }

    #[test]
    fn test_open_list_rejected_before_emission() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue(&env, compute());
        let mut closed = recorded(&env, thread_group);
        let mut open = list(&env.device, EngineGroupType::Compute);
        assert_eq!(
            queue.execute_command_lists(&mut [&mut closed, &mut open], None, &[]),
            Err(Error::InvalidState)
        );
        assert_eq!(capture.submission_count(), 0);
        assert_eq!(queue.task_count(), 0);
    }

    #[test]
    fn test_engine_mismatch_is_invalid_argument() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, _capture) = queue(&env, CommandQueueDesc::new(EngineGroupType::Copy));
        let mut work = recorded(&env, thread_group);
        assert_eq!(
            queue.execute_command_lists(&mut [&mut work], None, &[]),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_empty_lists_are_skipped() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue(&env, compute());
        let mut empty = closed_empty(&env);
        assert_eq!(queue.execute_command_lists(&mut [&mut empty], None, &[]), Ok(()));
        assert_eq!(capture.submission_count(), 0);

        let mut work = recorded(&env, thread_group);
        let mut empty = closed_empty(&env);
        assert_eq!(
            queue.execute_command_lists(&mut [&mut empty, &mut work], None, &[]),
            Ok(())
        );
        assert_eq!(queue.stats().skipped_lists, 2);
        let parsed = parse_batch(&last(&capture));
        assert_eq!(count_kind(&parsed, CommandKind::BatchBufferStart), 1);
    }

    #[test]
    fn test_batched_submission_ends_with_task_count_and_end() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue(&env, compute());
        let mut a = recorded(&env, thread_group);
        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));

        let batch = last(&capture);
        assert_eq!(batch.task_count, 1);
        assert!(batch.flags.contains(SubmitFlags::TASK_COUNT_POST_SYNC));
        assert!(!batch.flags.contains(SubmitFlags::RING));
        assert_eq!(batch.used_size % env.device.jump_target_alignment() as usize, 0);
        assert!(batch.residency.contains(&queue.tag().allocation()));

        let parsed = parse_batch(&batch);
        let Some(end) = parsed
            .iter()
            .position(|c| c.command.kind() == CommandKind::BatchBufferEnd)
        else {
            panic!("no end marker");
        };
        let task_write = parsed[..end].iter().rev().find_map(|c| match c.command {
            Command::PipeControl(pc) if pc.flags().has_post_sync() => Some((pc.address(), pc.data())),
            _ => None,
        });
        assert_eq!(task_write, Some((queue.tag().gpu_base(), 1)));
    }

    #[test]
    fn test_ring_mode_jumps_onwards_and_finalizes() {
        let config = DispatchConfig {
            submission_mode: SubmissionMode::Ring,
            ..Default::default()
        };
        let env = Env::with_config(HwFamily::XeHpCore, 1, config);
        let (queue, capture) = queue(&env, compute());
        let mut a = recorded(&env, thread_group);

        assert_eq!(queue.finalize(), Ok(()));
        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
        let batches = capture.batches();
        assert!(batches[0].flags.contains(SubmitFlags::RING));

        let first = parse_batch(&batches[0]);
        assert_eq!(count_kind(&first, CommandKind::BatchBufferEnd), 0);
        assert_eq!(count_kind(&first, CommandKind::SemaphoreWait), 1);
        let jump = first.iter().rev().find_map(|c| match c.command {
            Command::BatchBufferStart(bbs) if !bbs.is_second_level() => Some(bbs.target()),
            _ => None,
        });
        assert_eq!(jump, Some(batches[1].gpu_start));
        assert_eq!(
            queue.tag().read_u32(queue.tag().gpu_base().offset(RING_SEMAPHORE_OFFSET)),
            Ok(2)
        );

        assert_eq!(queue.finalize(), Ok(()));
        let final_batch = last(&capture);
        assert!(final_batch.flags.contains(SubmitFlags::FINAL));
        assert_eq!(count_kind(&parse_batch(&final_batch), CommandKind::BatchBufferEnd), 1);
        assert_eq!(queue.finalize(), Ok(()));
        assert_eq!(capture.submission_count(), 3);
    }

    #[test]
    fn test_primary_lists_link_directly() {
        let config = DispatchConfig {
            primary_batch_buffer: Some(true),
            ..Default::default()
        };
        let env = Env::with_config(HwFamily::XeHpcCore, 1, config);
        let (queue, capture) = queue(&env, compute());
        let mut a = recorded(&env, thread_group);
        assert!(a.uses_primary_batch_buffer());

        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
        let mut b = recorded(&env, thread_group);
        assert_eq!(queue.execute_command_lists(&mut [&mut b, &mut a], None, &[]), Ok(()));

        let batch = last(&capture);
        assert!(batch.flags.contains(SubmitFlags::PRIMARY_BATCH_BUFFER));
        assert_eq!(queue.stats().direct_links, 0);
        let entries = parse_batch(&batch)
            .iter()
            .filter(|c| matches!(c.command, Command::BatchBufferStart(bbs) if !bbs.is_second_level()))
            .count();
        // B and A each entered from the queue buffer (heap bases differ)
        assert_eq!(entries, 2);
        let Some(a_return) = terminal_target(&a) else {
            panic!("unpatched terminal");
        };
        assert!(a_return.raw() > batch.gpu_start.raw());
        assert!(a_return.raw() < batch.gpu_start.raw() + batch.used_size as u64);

        // Executing B alone needs its heap bases back, A's terminal is not touched
        assert_eq!(queue.execute_command_lists(&mut [&mut b], None, &[]), Ok(()));
        assert_eq!(terminal_target(&a), Some(a_return));
    }

    #[test]
    fn test_primary_lists_without_preamble_chain_to_each_other() {
        let config = DispatchConfig {
            primary_batch_buffer: Some(true),
            ..Default::default()
        };
        let env = Env::with_config(HwFamily::XeHpcCore, 1, config);
        let (queue, capture) = queue(&env, compute());
        // Lists without kernels require no state
        let barrier_list = || {
            let mut l = list(&env.device, EngineGroupType::Compute);
            assert_eq!(l.append_barrier(None, &[]), Ok(()));
            assert_eq!(l.close(), Ok(()));
            l
        };
        let mut a = barrier_list();
        let mut b = barrier_list();
        assert_eq!(queue.execute_command_lists(&mut [&mut a, &mut b], None, &[]), Ok(()));

        assert_eq!(queue.stats().direct_links, 1);
        assert_eq!(terminal_target(&a), Some(b.start_address()));
        let batch = last(&capture);
        let entries = parse_batch(&batch)
            .iter()
            .filter(|c| matches!(c.command, Command::BatchBufferStart(_)))
            .count();
        assert_eq!(entries, 1);
        assert!(terminal_target(&b).is_some_and(|t| t.raw() > batch.gpu_start.raw()));
    }

    #[test]
    fn test_stalling_flag_surfaced() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue(&env, compute());
        let mut a = list(&env.device, EngineGroupType::Compute);
        assert_eq!(a.append_barrier(None, &[]), Ok(()));
        assert_eq!(a.close(), Ok(()));
        assert!(a.properties().has_stalling_commands);
        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
        assert!(last(&capture).flags.contains(SubmitFlags::HAS_STALLING_COMMANDS));

        let mut b = recorded(&env, thread_group);
        assert_eq!(queue.execute_command_lists(&mut [&mut b], None, &[]), Ok(()));
        assert!(!last(&capture).flags.contains(SubmitFlags::HAS_STALLING_COMMANDS));
    }

    #[test]
    fn test_device_lost_only_at_synchronize() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue(&env, compute());
        let mut a = recorded(&env, thread_group);
        capture.inject_hang();

        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
        assert!(!queue.is_device_lost());
        assert_eq!(queue.synchronize(1_000), Err(Error::DeviceLost));
        assert!(queue.is_device_lost());
        assert_eq!(
            queue.execute_command_lists(&mut [&mut a], None, &[]),
            Err(Error::DeviceLost)
        );
        assert_eq!(queue.synchronize(0), Err(Error::DeviceLost));
        assert_eq!(capture.submission_count(), 1);
    }

    #[test]
    fn test_synchronize_times_out_on_pending_work() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue_with(&env, compute(), CaptureSubmitter::manual());
        assert_eq!(queue.synchronize(0), Ok(()));
        let mut a = recorded(&env, thread_group);
        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
        assert_eq!(queue.synchronize(0), Err(Error::Timeout));
        capture.complete_up_to(1);
        assert_eq!(queue.synchronize(0), Ok(()));
    }

    #[test]
    fn test_failed_submission_is_not_counted() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue(&env, compute());
        let mut a = recorded(&env, thread_group);
        capture.reject_next();
        assert_eq!(
            queue.execute_command_lists(&mut [&mut a], None, &[]),
            Err(Error::SubmissionFailed)
        );
        assert_eq!(queue.task_count(), 0);

        // The rejected preamble never reached the hardware
        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
        assert_eq!(count_kind(&parse_batch(&last(&capture)), CommandKind::FrontEndState), 1);
        assert_eq!(last(&capture).task_count, 1);
    }

    #[test]
    fn test_rejected_submission_leaves_no_trace() {
        let rejected = Env::new(HwFamily::XeHpCore, 2);
        let (queue, capture) = queue(&rejected, compute());
        let mut a = recorded(&rejected, thread_group);
        capture.reject_next();
        assert_eq!(
            queue.execute_command_lists(&mut [&mut a], None, &[]),
            Err(Error::SubmissionFailed)
        );
        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));

        let clean = Env::new(HwFamily::XeHpCore, 2);
        let (clean_queue, clean_capture) = self::queue(&clean, compute());
        let mut b = recorded(&clean, thread_group);
        assert_eq!(clean_queue.execute_command_lists(&mut [&mut b], None, &[]), Ok(()));

        // Same partition registers, preamble and task count at the same address
        let (retried, expected) = (last(&capture), last(&clean_capture));
        assert_eq!(retried.gpu_start, expected.gpu_start);
        assert_eq!(retried.task_count, 1);
        assert_eq!(retried.commands, expected.commands);
        let wparid_loads = parse_batch(&retried)
            .iter()
            .filter(|c| matches!(c.command, Command::LoadRegisterMem(lrm) if lrm.register == regs::WPARID))
            .count();
        assert_eq!(wparid_loads, 1);
    }

    #[test]
    fn test_synchronous_queue_reports_hang_from_execute() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let desc = CommandQueueDesc {
            engine: EngineGroupType::Compute,
            mode: QueueMode::Synchronous,
        };
        let (queue, capture) = queue(&env, desc);
        let mut a = recorded(&env, thread_group);
        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
        assert!(last(&capture).flags.contains(SubmitFlags::SYNCHRONOUS));
        capture.inject_hang();
        assert_eq!(
            queue.execute_command_lists(&mut [&mut a], None, &[]),
            Err(Error::DeviceLost)
        );
    }

    #[test]
    fn test_indirect_allocations_made_resident_once() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue(&env, compute());
        let usm = match env.memory.allocate_usm(ByteSize::KIB_64, AllocationKind::DeviceUsm) {
            Ok(ptr) => ptr,
            Err(e) => panic!("usm: {e}"),
        };
        let indirect = |desc: &mut KernelDescriptor| {
            thread_group(desc);
            desc.indirect_access = IndirectAccess::DEVICE;
        };
        let mut a = recorded(&env, indirect);
        let mut b = recorded(&env, indirect);
        let before = env.memory.stats().indirect_passes;

        assert_eq!(queue.execute_command_lists(&mut [&mut a, &mut b], None, &[]), Ok(()));
        assert_eq!(env.memory.stats().indirect_passes, before + 1);
        assert_eq!(queue.stats().indirect_residency_passes, 1);

        let batch = last(&capture);
        assert!(batch.flags.contains(SubmitFlags::INDIRECT_RESIDENCY));
        let Some(id) = env.memory.resolve(usm, 1).and_then(|r| r.id) else {
            panic!("usm not resolvable");
        };
        assert!(batch.residency.contains(&id));

        let mut plain = recorded(&env, thread_group);
        assert_eq!(queue.execute_command_lists(&mut [&mut plain], None, &[]), Ok(()));
        assert_eq!(env.memory.stats().indirect_passes, before + 1);
    }

    #[test]
    fn test_partition_registers_programmed_once() {
        let env = Env::new(HwFamily::XeHpCore, 2);
        let (queue, capture) = queue(&env, compute());
        let mut a = recorded(&env, thread_group);
        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));

        let wparid_loads = |batch: &CapturedBatch| {
            parse_batch(batch)
                .iter()
                .filter(|c| matches!(c.command, Command::LoadRegisterMem(lrm) if lrm.register == regs::WPARID))
                .count()
        };
        let batches = capture.batches();
        assert_eq!(wparid_loads(&batches[0]), 1);
        assert_eq!(wparid_loads(&batches[1]), 0);
        assert_eq!(batches[0].tile_mask, TileMask::first(2));
    }

    #[test]
    fn test_scratch_growth_reemits_front_end() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue(&env, compute());
        let mut a = recorded(&env, |desc| {
            thread_group(desc);
            desc.scratch_per_thread = 256;
        });
        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
        let first_scratch = queue.scratch_address();
        assert!(first_scratch.is_some());

        assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
        assert_eq!(count_kind(&parse_batch(&last(&capture)), CommandKind::FrontEndState), 0);

        let mut b = recorded(&env, |desc| {
            thread_group(desc);
            desc.scratch_per_thread = 4096;
        });
        assert_eq!(queue.execute_command_lists(&mut [&mut b], None, &[]), Ok(()));
        assert_ne!(queue.scratch_address(), first_scratch);
        let parsed = parse_batch(&last(&capture));
        let scratch = parsed.iter().find_map(|c| match c.command {
            Command::FrontEndState(fe) => Some(fe.scratch()),
            _ => None,
        });
        assert_eq!(scratch, queue.scratch_address());
    }

    #[test]
    fn test_wait_events_precede_lists() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue(&env, compute());
        let pool = match EventPool::new(
            Arc::clone(env.device.memory()),
            EventPoolDesc::new(&env.device, 2, EventPoolFlags::HOST_VISIBLE),
        ) {
            Ok(pool) => pool,
            Err(e) => panic!("pool: {e}"),
        };
        let Ok(event) = pool.create_event(EventDesc {
            index: 0,
            signal_scope: SignalScope::Device,
            wait_scope: SignalScope::Device,
        }) else {
            panic!("event");
        };
        let mut a = recorded(&env, thread_group);
        assert_eq!(
            queue.execute_command_lists(&mut [&mut a], None, core::slice::from_ref(&event)),
            Ok(())
        );
        let batch = last(&capture);
        let parsed = parse_batch(&batch);
        let first_wait = parsed
            .iter()
            .position(|c| c.command.kind() == CommandKind::SemaphoreWait);
        let first_entry = parsed
            .iter()
            .position(|c| c.command.kind() == CommandKind::BatchBufferStart);
        assert!(first_wait.is_some());
        assert!(first_wait < first_entry);
        assert!(batch.residency.contains(&event.allocation()));

        // Waits alone still produce a submission
        assert_eq!(queue.execute_command_lists(&mut [], None, core::slice::from_ref(&event)), Ok(()));
        assert_eq!(capture.submission_count(), 2);
    }

    #[test]
    fn test_fence_armed_with_task_count() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue_with(&env, compute(), CaptureSubmitter::manual());
        let fence = queue.create_fence();
        let mut a = recorded(&env, thread_group);
        assert_eq!(queue.execute_command_lists(&mut [&mut a], Some(&fence), &[]), Ok(()));
        assert_eq!(fence.task_count(), Some(1));
        assert_eq!(fence.query_status(), Ok(FenceStatus::NotReady));
        capture.complete_up_to(1);
        assert_eq!(fence.query_status(), Ok(FenceStatus::Signaled));

        let (other, _other_capture) = queue_with(&env, compute(), CaptureSubmitter::new());
        let foreign = other.create_fence();
        assert_eq!(
            queue.execute_command_lists(&mut [&mut a], Some(&foreign), &[]),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_full_queue_buffer_switches() {
        let config = DispatchConfig {
            queue_buffer_size: ByteSize::from_kib(1),
            ..Default::default()
        };
        let env = Env::with_config(HwFamily::XeHpCore, 1, config);
        let (queue, capture) = queue_with(&env, compute(), CaptureSubmitter::manual());
        let mut a = recorded(&env, thread_group);
        for _ in 0..64 {
            assert_eq!(queue.execute_command_lists(&mut [&mut a], None, &[]), Ok(()));
        }
        assert!(queue.stats().buffer_switches > 0);
        let batches = capture.batches();
        assert_eq!(batches.len(), 64);
        assert!(batches.iter().all(|b| b.used_size == b.commands.len()));
        assert!(batches
            .iter()
            .all(|b| count_kind(&parse_batch(b), CommandKind::BatchBufferEnd) == 1));

        // Nothing completed, so no batch was written over another
        for (i, earlier) in batches.iter().enumerate() {
            let earlier_end = earlier.gpu_start.offset(earlier.used_size as u64);
            for later in &batches[i + 1..] {
                let later_end = later.gpu_start.offset(later.used_size as u64);
                assert!(later.gpu_start >= earlier_end || later_end <= earlier.gpu_start);
            }
        }
    }

    #[test]
    fn test_copy_queue_writes_task_count_with_flush() {
        let env = Env::new(HwFamily::XeHpCore, 1);
        let (queue, capture) = queue(&env, CommandQueueDesc::new(EngineGroupType::Copy));
        let mut copy = list(&env.device, EngineGroupType::Copy);
        let (src, dst) = match (
            env.memory.allocate_usm(ByteSize::KIB_4, AllocationKind::DeviceUsm),
            env.memory.allocate_usm(ByteSize::KIB_4, AllocationKind::DeviceUsm),
        ) {
            (Ok(src), Ok(dst)) => (src, dst),
            _ => panic!("usm"),
        };
        assert_eq!(copy.append_memory_copy(dst, src, 256, None, &[]), Ok(()));
        assert_eq!(copy.close(), Ok(()));
        assert_eq!(queue.execute_command_lists(&mut [&mut copy], None, &[]), Ok(()));

        let batch = last(&capture);
        let parsed = parse_batch(&batch);
        assert_eq!(count_kind(&parsed, CommandKind::FlushDw), 1);
        assert_eq!(count_kind(&parsed, CommandKind::FrontEndState), 0);
        assert_eq!(batch.tile_mask, TileMask::first(1));
    }
}
