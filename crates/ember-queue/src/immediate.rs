//! # Immediate Command Lists
//!
//! A command list that is executed as soon as something is appended to it.
//! Every append runs close, execute on the owning queue and reset; a
//! synchronous queue also waits for the work before the append returns.
//! While a submission is still running its buffers and heaps are left
//! alone and the next append records into other memory.
//!
//! In-order lists additionally advance a completion counter: each operation
//! is followed by a post-sync write of the next counter value, so the host
//! can tell how far the GPU got by reading a single location.

use alloc::sync::Arc;

use ember_core::{
    AllocationKind, ByteSize, EngineGroupType, GpuAddr, GroupCount, HostVisibleMemory, Result,
    UsmPtr,
};
use ember_cmd::Kernel;
use ember_event::Event;
use ember_list::{CommandList, CommandListFlags};

use crate::queue::CommandQueue;

/// A list that submits after each append
#[derive(Debug)]
pub struct ImmediateCommandList {
    list: CommandList,
    queue: Arc<CommandQueue>,
    counter: Option<Arc<HostVisibleMemory>>,
    issued: u64,
}

impl ImmediateCommandList {
    /// Immediate list executing on `queue`
    pub fn create(queue: Arc<CommandQueue>, flags: CommandListFlags) -> Result<Self> {
        let device = Arc::clone(queue.device());
        let list = CommandList::create(Arc::clone(&device), queue.engine(), flags)?;
        let counter = if flags.contains(CommandListFlags::IN_ORDER) {
            Some(
                device
                    .memory()
                    .allocate_host_visible(ByteSize::from_bytes(8), AllocationKind::Counter)?,
            )
        } else {
            None
        };
        log::debug!(
            "ember-queue: immediate list on queue {} ({:?})",
            queue.id(),
            flags
        );
        Ok(Self {
            list,
            queue,
            counter,
            issued: 0,
        })
    }

    /// Queue executing the appends
    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// Engine group of the queue
    pub fn engine(&self) -> EngineGroupType {
        self.list.engine()
    }

    /// Address the completion counter is written to, for in-order lists
    pub fn counter_address(&self) -> Option<GpuAddr> {
        self.counter.as_ref().map(|counter| counter.gpu_base())
    }

    /// Counter value of the latest submitted operation
    pub fn issued_counter(&self) -> u64 {
        self.issued
    }

    /// Counter value the GPU has written so far
    pub fn completed_counter(&self) -> Result<u64> {
        match &self.counter {
            Some(counter) => counter.read_u64(counter.gpu_base()),
            None => Ok(0),
        }
    }

    /// Wait for everything appended so far
    pub fn host_synchronize(&self, timeout_ns: u64) -> Result<()> {
        self.queue.synchronize(timeout_ns)
    }

    /// Record with `record`, then close, execute and reset.
    ///
    /// The list is reset whatever the outcome, so a failed append leaves it
    /// ready for the next one.
    pub fn submit_with<F>(&mut self, record: F) -> Result<()>
    where
        F: FnOnce(&mut CommandList) -> Result<()>,
    {
        let outcome = self.execute(record);
        let queue = &self.queue;
        let task = queue.task_count();
        if let Err(e) = self.list.recycle(task, |task| queue.is_task_complete(task)) {
            log::warn!(
                "ember-queue: no spare memory for immediate list, waiting for task {}: {}",
                task,
                e
            );
            let synchronized = queue.synchronize(u64::MAX);
            self.list.reset();
            return outcome.and(synchronized);
        }
        outcome
    }

    fn execute<F>(&mut self, record: F) -> Result<()>
    where
        F: FnOnce(&mut CommandList) -> Result<()>,
    {
        record(&mut self.list)?;
        let next = self.issued + 1;
        if let Some(counter) = &self.counter {
            self.list.append_counter_update(counter.gpu_base(), next)?;
            self.list
                .container_mut()
                .residency_mut()
                .push(counter.allocation());
        }
        self.list.close()?;
        self.queue
            .execute_command_lists(&mut [&mut self.list], None, &[])?;
        if self.counter.is_some() {
            self.issued = next;
        }
        Ok(())
    }

    // =========================================================================
    // Appends
    // =========================================================================

    /// Launch `kernel` over `group_count` work-groups
    pub fn append_launch_kernel(
        &mut self,
        kernel: &Kernel,
        group_count: GroupCount,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.submit_with(|list| list.append_launch_kernel(kernel, group_count, signal, waits))
    }

    /// Execution and memory barrier
    pub fn append_barrier(&mut self, signal: Option<&Arc<Event>>, waits: &[Arc<Event>]) -> Result<()> {
        self.submit_with(|list| list.append_barrier(signal, waits))
    }

    /// Copy `size` bytes from `src` to `dst`
    pub fn append_memory_copy(
        &mut self,
        dst: UsmPtr,
        src: UsmPtr,
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.submit_with(|list| list.append_memory_copy(dst, src, size, signal, waits))
    }

    /// Fill `size` bytes at `ptr` with `pattern`
    pub fn append_memory_fill(
        &mut self,
        ptr: UsmPtr,
        pattern: &[u8],
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.submit_with(|list| list.append_memory_fill(ptr, pattern, size, signal, waits))
    }

    /// Signal `event`
    pub fn append_signal_event(&mut self, event: &Arc<Event>) -> Result<()> {
        self.submit_with(|list| list.append_signal_event(event))
    }

    /// Reset `event`
    pub fn append_event_reset(&mut self, event: &Arc<Event>) -> Result<()> {
        self.submit_with(|list| list.append_event_reset(event))
    }

    /// Wait for `events`
    pub fn append_wait_on_events(&mut self, events: &[Arc<Event>]) -> Result<()> {
        self.submit_with(|list| list.append_wait_on_events(events))
    }
}

impl Drop for ImmediateCommandList {
    fn drop(&mut self) {
        if let Some(counter) = self.counter.take() {
            if let Err(e) = self.queue.device().memory().free(counter.allocation()) {
                log::warn!("ember-queue: failed to free immediate list counter: {}", e);
            }
        }
    }
}
