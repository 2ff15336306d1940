//! # Handle API
//!
//! The public surface. Every object created through an [`Api`] lives in its
//! handle tables until it is destroyed; calls take handles and report a
//! [`ResultCode`].
//!
//! ```text
//!   Api ── objects lock ──┬── devices   DeviceEntry (Device, SvmManager, submitter)
//!                         ├── lists     Mutex<ListObject>  (regular | immediate)
//!                         ├── queues    CommandQueue
//!                         ├── pools     EventPool
//!                         ├── events    Event + owning pool
//!                         ├── fences    Fence
//!                         └── kernels   Mutex<Kernel> + ISA
//! ```
//!
//! The table lock is only held to look objects up; list, queue and event
//! work runs after it is released.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use ember_cmd::{Device, DeviceDesc, Kernel, KernelArg, KernelDescriptor, KernelStateRequirements};
use ember_core::{
    AllocationId, AllocationKind, ByteSize, EngineGroupType, Error, GpuAllocator, GroupCount,
    IndirectAccess, MemoryBackend, PlatformRegistry, Result, SubmissionBoundary, UsmPtr,
};
use ember_event::{Event, EventDesc, EventPool, EventPoolDesc, EventPoolFlags, EventStatus};
use ember_list::{CommandList, CommandListFlags};
use ember_mem::SvmManager;
use ember_queue::{CommandQueue, CommandQueueDesc, Fence, FenceStatus, ImmediateCommandList};

use crate::handle::{
    CommandListHandle, CommandQueueHandle, DeviceHandle, EventHandle, EventPoolHandle,
    FenceHandle, Handle, KernelHandle,
};
use crate::result::{ApiResult, ResultCode};

// =============================================================================
// OBJECTS
// =============================================================================

/// A device with the memory manager and submission boundary behind it
#[derive(Debug)]
pub struct DeviceEntry {
    device: Arc<Device>,
    memory: Arc<SvmManager>,
    submitter: Arc<dyn SubmissionBoundary>,
}

impl DeviceEntry {
    /// The device
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Memory manager backing the device
    pub fn memory(&self) -> &Arc<SvmManager> {
        &self.memory
    }
}

#[derive(Debug)]
enum ListObject {
    Regular(CommandList),
    Immediate(ImmediateCommandList),
}

impl ListObject {
    fn append<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce(&mut CommandList) -> Result<()>,
    {
        match self {
            Self::Regular(list) => op(list),
            Self::Immediate(list) => list.submit_with(op),
        }
    }

    fn regular(&mut self) -> Result<&mut CommandList> {
        match self {
            Self::Regular(list) => Ok(list),
            Self::Immediate(_) => Err(Error::InvalidArgument),
        }
    }
}

#[derive(Debug, Clone)]
struct EventEntry {
    event: Arc<Event>,
    pool: Arc<EventPool>,
}

#[derive(Debug)]
struct KernelEntry {
    kernel: Mutex<Kernel>,
    device: Arc<DeviceEntry>,
}

#[derive(Debug, Default)]
struct Objects {
    devices: HashMap<u64, Arc<DeviceEntry>>,
    lists: HashMap<u64, Arc<Mutex<ListObject>>>,
    queues: HashMap<u64, Arc<CommandQueue>>,
    pools: HashMap<u64, Arc<EventPool>>,
    events: HashMap<u64, EventEntry>,
    fences: HashMap<u64, Arc<Fence>>,
    kernels: HashMap<u64, Arc<KernelEntry>>,
}

fn lookup<T: Clone, M>(map: &HashMap<u64, T>, handle: Handle<M>) -> Result<T> {
    if handle.is_null() {
        return Err(Error::InvalidNullHandle);
    }
    map.get(&handle.id()).cloned().ok_or(Error::InvalidNullHandle)
}

fn take<T, M>(map: &mut HashMap<u64, T>, handle: Handle<M>) -> Result<T> {
    if handle.is_null() {
        return Err(Error::InvalidNullHandle);
    }
    map.remove(&handle.id()).ok_or(Error::InvalidNullHandle)
}

fn code<T>(result: Result<T>) -> ApiResult<T> {
    result.map_err(ResultCode::from)
}

/// Kernel creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDesc {
    /// Kernel name
    pub name: String,
    /// Size of the ISA allocation
    pub isa_size: ByteSize,
    /// SIMD width
    pub simd_size: u32,
    /// Bytes of cross-thread data
    pub cross_thread_size: u32,
    /// Shared local memory per work-group
    pub slm_size: u32,
    /// Hardware barriers per work-group
    pub barrier_count: u32,
    /// Private scratch per hardware thread
    pub scratch_per_thread: u32,
    /// Stream state the kernel depends on
    pub requirements: KernelStateRequirements,
    /// USM classes reachable without being passed as arguments
    pub indirect_access: IndirectAccess,
    /// Whether the kernel samples images
    pub uses_images: bool,
}

impl KernelDesc {
    /// SIMD32 kernel without special requirements
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            isa_size: ByteSize::KIB_4,
            simd_size: 32,
            cross_thread_size: 0,
            slm_size: 0,
            barrier_count: 0,
            scratch_per_thread: 0,
            requirements: KernelStateRequirements::default(),
            indirect_access: IndirectAccess::empty(),
            uses_images: false,
        }
    }
}

// =============================================================================
// API
// =============================================================================

/// Handle tables and the calls operating on them
#[derive(Debug)]
pub struct Api {
    registry: PlatformRegistry,
    objects: Mutex<Objects>,
    next_id: AtomicU64,
}

impl Default for Api {
    fn default() -> Self {
        Self::new()
    }
}

impl Api {
    /// API over every built-in hardware family
    pub fn new() -> Self {
        Self::with_registry(PlatformRegistry::with_default_families())
    }

    /// API over the families in `registry`
    pub fn with_registry(registry: PlatformRegistry) -> Self {
        Self {
            registry,
            objects: Mutex::new(Objects::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn insert<T, M>(&self, table: impl FnOnce(&mut Objects) -> &mut HashMap<u64, T>, value: T) -> Handle<M> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        table(&mut *self.objects.lock()).insert(id, value);
        Handle::new(id)
    }

    /// Look up a device
    pub fn device(&self, handle: DeviceHandle) -> ApiResult<Arc<DeviceEntry>> {
        code(lookup(&self.objects.lock().devices, handle))
    }

    fn list(&self, handle: CommandListHandle) -> Result<Arc<Mutex<ListObject>>> {
        lookup(&self.objects.lock().lists, handle)
    }

    fn queue(&self, handle: CommandQueueHandle) -> Result<Arc<CommandQueue>> {
        lookup(&self.objects.lock().queues, handle)
    }

    fn event(&self, handle: EventHandle) -> Result<Arc<Event>> {
        lookup(&self.objects.lock().events, handle).map(|entry| entry.event)
    }

    fn signal_event(&self, handle: EventHandle) -> Result<Option<Arc<Event>>> {
        if handle.is_null() {
            return Ok(None);
        }
        self.event(handle).map(Some)
    }

    fn events(&self, handles: &[EventHandle]) -> Result<Vec<Arc<Event>>> {
        let objects = self.objects.lock();
        handles
            .iter()
            .map(|&handle| lookup(&objects.events, handle).map(|entry| entry.event))
            .collect()
    }

    fn fence(&self, handle: FenceHandle) -> Result<Arc<Fence>> {
        lookup(&self.objects.lock().fences, handle)
    }

    // =========================================================================
    // Devices and memory
    // =========================================================================

    /// Create a device submitting through `submitter`
    pub fn create_device(
        &self,
        desc: DeviceDesc,
        submitter: Arc<dyn SubmissionBoundary>,
    ) -> ApiResult<DeviceHandle> {
        let memory = Arc::new(SvmManager::default());
        let backend: Arc<dyn MemoryBackend> = memory.clone();
        let family = desc.family;
        let device = code(Device::new(desc, &self.registry, backend))?;
        let entry = DeviceEntry {
            device: Arc::new(device),
            memory,
            submitter,
        };
        let handle = self.insert(|o| &mut o.devices, Arc::new(entry));
        log::info!("ember: device {:?} created ({:?})", handle, family);
        Ok(handle)
    }

    /// Release a device handle; objects created on it stay valid
    pub fn destroy_device(&self, device: DeviceHandle) -> ResultCode {
        ResultCode::from_result(take(&mut self.objects.lock().devices, device).map(drop))
    }

    /// Allocate `size` bytes of unified shared memory of `kind`
    pub fn allocate_memory(
        &self,
        device: DeviceHandle,
        size: u64,
        kind: AllocationKind,
    ) -> ApiResult<UsmPtr> {
        let entry = self.device(device)?;
        if size == 0
            || !matches!(
                kind,
                AllocationKind::DeviceUsm | AllocationKind::HostUsm | AllocationKind::SharedUsm
            )
        {
            return Err(ResultCode::ErrorInvalidArgument);
        }
        code(entry.memory.allocate_usm(ByteSize::from_bytes(size), kind))
    }

    /// Free memory returned by [`Api::allocate_memory`]
    pub fn free_memory(&self, device: DeviceHandle, ptr: UsmPtr) -> ResultCode {
        let entry = match self.device(device) {
            Ok(entry) => entry,
            Err(code) => return code,
        };
        if ptr.is_null() {
            return ResultCode::ErrorInvalidNullPointer;
        }
        match entry.memory.free_usm(ptr) {
            Err(Error::NotFound) => ResultCode::ErrorInvalidArgument,
            result => ResultCode::from_result(result),
        }
    }

    // =========================================================================
    // Kernels
    // =========================================================================

    /// Create a kernel with a freshly allocated ISA
    pub fn create_kernel(&self, device: DeviceHandle, desc: &KernelDesc) -> ApiResult<KernelHandle> {
        let entry = self.device(device)?;
        if desc.simd_size == 0 || desc.isa_size.as_bytes() == 0 {
            return Err(ResultCode::ErrorInvalidArgument);
        }
        let isa = code(
            entry
                .device
                .memory()
                .allocate(desc.isa_size, AllocationKind::KernelIsa),
        )?;
        let mut descriptor = KernelDescriptor::new(&desc.name, isa.gpu_base, isa.id);
        descriptor.simd_size = desc.simd_size;
        descriptor.cross_thread_size = desc.cross_thread_size;
        descriptor.slm_size = desc.slm_size;
        descriptor.barrier_count = desc.barrier_count;
        descriptor.scratch_per_thread = desc.scratch_per_thread;
        descriptor.requirements = desc.requirements;
        descriptor.indirect_access = desc.indirect_access;
        descriptor.uses_images = desc.uses_images;

        let kernel = KernelEntry {
            kernel: Mutex::new(Kernel::new(Arc::new(descriptor))),
            device: entry,
        };
        Ok(self.insert(|o| &mut o.kernels, Arc::new(kernel)))
    }

    /// Destroy a kernel and free its ISA
    pub fn destroy_kernel(&self, kernel: KernelHandle) -> ResultCode {
        let entry = take(&mut self.objects.lock().kernels, kernel);
        ResultCode::from_result(entry.and_then(|entry| {
            let isa: AllocationId = entry.kernel.lock().descriptor().isa_allocation;
            entry.device.device.memory().free(isa)
        }))
    }

    fn with_kernel<F>(&self, kernel: KernelHandle, op: F) -> ResultCode
    where
        F: FnOnce(&mut Kernel) -> Result<()>,
    {
        let entry = lookup(&self.objects.lock().kernels, kernel);
        ResultCode::from_result(entry.and_then(|entry| op(&mut entry.kernel.lock())))
    }

    /// Set the work-group size of a kernel
    pub fn kernel_set_group_size(&self, kernel: KernelHandle, x: u32, y: u32, z: u32) -> ResultCode {
        self.with_kernel(kernel, |k| k.set_group_size(x, y, z))
    }

    /// Bind argument `index` of a kernel
    pub fn kernel_set_argument(&self, kernel: KernelHandle, index: usize, arg: KernelArg) -> ResultCode {
        self.with_kernel(kernel, |k| k.set_arg(index, arg))
    }

    // =========================================================================
    // Command lists
    // =========================================================================

    /// Create a command list for `engine`
    pub fn create_command_list(
        &self,
        device: DeviceHandle,
        engine: EngineGroupType,
        flags: CommandListFlags,
    ) -> ApiResult<CommandListHandle> {
        let entry = self.device(device)?;
        let list = code(CommandList::create(Arc::clone(&entry.device), engine, flags))?;
        Ok(self.insert(|o| &mut o.lists, Arc::new(Mutex::new(ListObject::Regular(list)))))
    }

    /// Create a list that executes every append on its own queue
    pub fn create_immediate_command_list(
        &self,
        device: DeviceHandle,
        desc: CommandQueueDesc,
        flags: CommandListFlags,
    ) -> ApiResult<CommandListHandle> {
        let entry = self.device(device)?;
        let queue = code(CommandQueue::create(
            Arc::clone(&entry.device),
            desc,
            Arc::clone(&entry.submitter),
        ))?;
        let list = code(ImmediateCommandList::create(Arc::new(queue), flags))?;
        Ok(self.insert(|o| &mut o.lists, Arc::new(Mutex::new(ListObject::Immediate(list)))))
    }

    /// Destroy a command list
    pub fn destroy_command_list(&self, list: CommandListHandle) -> ResultCode {
        ResultCode::from_result(take(&mut self.objects.lock().lists, list).map(drop))
    }

    fn with_list<F>(&self, list: CommandListHandle, op: F) -> ResultCode
    where
        F: FnOnce(&mut ListObject) -> Result<()>,
    {
        ResultCode::from_result(self.list(list).and_then(|list| op(&mut list.lock())))
    }

    /// Close a regular list for execution
    pub fn command_list_close(&self, list: CommandListHandle) -> ResultCode {
        self.with_list(list, |object| object.regular()?.close())
    }

    /// Reopen a regular list, discarding its commands
    pub fn command_list_reset(&self, list: CommandListHandle) -> ResultCode {
        self.with_list(list, |object| {
            object.regular()?.reset();
            Ok(())
        })
    }

    /// Launch a kernel
    pub fn append_launch_kernel(
        &self,
        list: CommandListHandle,
        kernel: KernelHandle,
        group_count: GroupCount,
        signal: EventHandle,
        waits: &[EventHandle],
    ) -> ResultCode {
        let entry = lookup(&self.objects.lock().kernels, kernel);
        let prepared = entry.and_then(|entry| {
            let kernel = entry.kernel.lock().clone();
            Ok((kernel, self.signal_event(signal)?, self.events(waits)?))
        });
        let (kernel, signal, waits) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return e.into(),
        };
        self.with_list(list, |object| {
            object.append(|l| l.append_launch_kernel(&kernel, group_count, signal.as_ref(), &waits))
        })
    }

    /// Execution and memory barrier
    pub fn append_barrier(
        &self,
        list: CommandListHandle,
        signal: EventHandle,
        waits: &[EventHandle],
    ) -> ResultCode {
        let (signal, waits) = match self
            .signal_event(signal)
            .and_then(|signal| Ok((signal, self.events(waits)?)))
        {
            Ok(events) => events,
            Err(e) => return e.into(),
        };
        self.with_list(list, |object| {
            object.append(|l| l.append_barrier(signal.as_ref(), &waits))
        })
    }

    /// Copy `size` bytes from `src` to `dst`
    pub fn append_memory_copy(
        &self,
        list: CommandListHandle,
        dst: UsmPtr,
        src: UsmPtr,
        size: u64,
        signal: EventHandle,
        waits: &[EventHandle],
    ) -> ResultCode {
        let (signal, waits) = match self
            .signal_event(signal)
            .and_then(|signal| Ok((signal, self.events(waits)?)))
        {
            Ok(events) => events,
            Err(e) => return e.into(),
        };
        self.with_list(list, |object| {
            object.append(|l| l.append_memory_copy(dst, src, size, signal.as_ref(), &waits))
        })
    }

    /// Fill `size` bytes at `ptr` with a repeated pattern
    pub fn append_memory_fill(
        &self,
        list: CommandListHandle,
        ptr: UsmPtr,
        pattern: &[u8],
        size: u64,
        signal: EventHandle,
        waits: &[EventHandle],
    ) -> ResultCode {
        let (signal, waits) = match self
            .signal_event(signal)
            .and_then(|signal| Ok((signal, self.events(waits)?)))
        {
            Ok(events) => events,
            Err(e) => return e.into(),
        };
        self.with_list(list, |object| {
            object.append(|l| l.append_memory_fill(ptr, pattern, size, signal.as_ref(), &waits))
        })
    }

    /// Signal an event from the device
    pub fn append_signal_event(&self, list: CommandListHandle, event: EventHandle) -> ResultCode {
        match self.event(event) {
            Ok(event) => self.with_list(list, |object| object.append(|l| l.append_signal_event(&event))),
            Err(e) => e.into(),
        }
    }

    /// Reset an event from the device
    pub fn append_event_reset(&self, list: CommandListHandle, event: EventHandle) -> ResultCode {
        match self.event(event) {
            Ok(event) => self.with_list(list, |object| object.append(|l| l.append_event_reset(&event))),
            Err(e) => e.into(),
        }
    }

    /// Wait on events before later commands
    pub fn append_wait_on_events(&self, list: CommandListHandle, events: &[EventHandle]) -> ResultCode {
        match self.events(events) {
            Ok(events) => self.with_list(list, |object| object.append(|l| l.append_wait_on_events(&events))),
            Err(e) => e.into(),
        }
    }

    // =========================================================================
    // Command queues
    // =========================================================================

    /// Create a command queue
    pub fn create_command_queue(
        &self,
        device: DeviceHandle,
        desc: CommandQueueDesc,
    ) -> ApiResult<CommandQueueHandle> {
        let entry = self.device(device)?;
        let queue = code(CommandQueue::create(
            Arc::clone(&entry.device),
            desc,
            Arc::clone(&entry.submitter),
        ))?;
        Ok(self.insert(|o| &mut o.queues, Arc::new(queue)))
    }

    /// Finalize and destroy a command queue
    pub fn destroy_command_queue(&self, queue: CommandQueueHandle) -> ResultCode {
        let taken = take(&mut self.objects.lock().queues, queue);
        let result = taken.and_then(|q| q.finalize());
        if let Err(e) = result {
            log::warn!("ember: finalizing {:?} failed: {}", queue, e);
        }
        ResultCode::from_result(result)
    }

    /// Execute closed regular lists in order.
    ///
    /// A null `fence` is allowed. Every list handle may appear once.
    pub fn execute_command_lists(
        &self,
        queue: CommandQueueHandle,
        lists: &[CommandListHandle],
        fence: FenceHandle,
        waits: &[EventHandle],
    ) -> ResultCode {
        ResultCode::from_result(self.execute(queue, lists, fence, waits))
    }

    fn execute(
        &self,
        queue: CommandQueueHandle,
        handles: &[CommandListHandle],
        fence: FenceHandle,
        waits: &[EventHandle],
    ) -> Result<()> {
        let queue = self.queue(queue)?;
        if handles.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if handles
            .iter()
            .enumerate()
            .any(|(i, handle)| handles[..i].contains(handle))
        {
            return Err(Error::InvalidArgument);
        }
        let fence = if fence.is_null() {
            None
        } else {
            Some(self.fence(fence)?)
        };
        let waits = self.events(waits)?;
        let lists = handles
            .iter()
            .map(|&handle| self.list(handle))
            .collect::<Result<Vec<_>>>()?;

        let mut guards: Vec<_> = lists.iter().map(|list| list.lock()).collect();
        let mut refs = guards
            .iter_mut()
            .map(|guard| guard.regular())
            .collect::<Result<Vec<&mut CommandList>>>()?;
        queue.execute_command_lists(&mut refs, fence.as_deref(), &waits)
    }

    /// Wait for all work submitted to a queue
    pub fn command_queue_synchronize(&self, queue: CommandQueueHandle, timeout_ns: u64) -> ResultCode {
        ResultCode::from_result(self.queue(queue).and_then(|queue| queue.synchronize(timeout_ns)))
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Create a pool of `count` events
    pub fn create_event_pool(
        &self,
        device: DeviceHandle,
        count: u32,
        flags: EventPoolFlags,
    ) -> ApiResult<EventPoolHandle> {
        let entry = self.device(device)?;
        if count == 0 {
            return Err(ResultCode::ErrorInvalidArgument);
        }
        let desc = EventPoolDesc::new(&entry.device, count, flags);
        let pool = code(EventPool::new(Arc::clone(entry.device.memory()), desc))?;
        Ok(self.insert(|o| &mut o.pools, Arc::new(pool)))
    }

    /// Release a pool handle; its events keep the pool memory alive
    pub fn destroy_event_pool(&self, pool: EventPoolHandle) -> ResultCode {
        ResultCode::from_result(take(&mut self.objects.lock().pools, pool).map(drop))
    }

    /// Create an event in a pool slot
    pub fn create_event(&self, pool: EventPoolHandle, desc: EventDesc) -> ApiResult<EventHandle> {
        let pool = code(lookup(&self.objects.lock().pools, pool))?;
        let event = code(pool.create_event(desc))?;
        Ok(self.insert(|o| &mut o.events, EventEntry { event, pool }))
    }

    /// Destroy an event, freeing its pool slot
    pub fn destroy_event(&self, event: EventHandle) -> ResultCode {
        let entry = take(&mut self.objects.lock().events, event);
        ResultCode::from_result(entry.and_then(|entry| entry.pool.release_event(&entry.event)))
    }

    /// Signal an event from the host
    pub fn event_host_signal(&self, event: EventHandle) -> ResultCode {
        ResultCode::from_result(self.event(event).and_then(|event| event.host_signal()))
    }

    /// Reset an event from the host
    pub fn event_host_reset(&self, event: EventHandle) -> ResultCode {
        ResultCode::from_result(self.event(event).and_then(|event| event.host_reset()))
    }

    /// `Success` when signaled, `NotReady` otherwise
    pub fn event_query_status(&self, event: EventHandle) -> ResultCode {
        match self.event(event).and_then(|event| event.query_status()) {
            Ok(EventStatus::Signaled) => ResultCode::Success,
            Ok(EventStatus::NotReady) => ResultCode::NotReady,
            Err(e) => e.into(),
        }
    }

    /// Poll an event up to `max_polls` times
    pub fn event_host_synchronize(&self, event: EventHandle, max_polls: u64) -> ResultCode {
        match self.event(event).and_then(|event| event.host_synchronize(max_polls)) {
            Ok(EventStatus::Signaled) => ResultCode::Success,
            Ok(EventStatus::NotReady) => ResultCode::NotReady,
            Err(e) => e.into(),
        }
    }

    // =========================================================================
    // Fences
    // =========================================================================

    /// Create a fence for submissions to `queue`
    pub fn create_fence(&self, queue: CommandQueueHandle) -> ApiResult<FenceHandle> {
        let queue = code(self.queue(queue))?;
        Ok(self.insert(|o| &mut o.fences, Arc::new(queue.create_fence())))
    }

    /// Destroy a fence
    pub fn destroy_fence(&self, fence: FenceHandle) -> ResultCode {
        ResultCode::from_result(take(&mut self.objects.lock().fences, fence).map(drop))
    }

    /// `Success` when signaled, `NotReady` otherwise
    pub fn fence_query_status(&self, fence: FenceHandle) -> ResultCode {
        fence_code(self.fence(fence).and_then(|fence| fence.query_status()))
    }

    /// Wait up to `timeout_ns` for a fence
    pub fn fence_host_synchronize(&self, fence: FenceHandle, timeout_ns: u64) -> ResultCode {
        fence_code(self.fence(fence).and_then(|fence| fence.host_synchronize(timeout_ns)))
    }

    /// Disarm a fence
    pub fn fence_reset(&self, fence: FenceHandle) -> ResultCode {
        ResultCode::from_result(self.fence(fence).map(|fence| fence.reset()))
    }
}

fn fence_code(status: Result<FenceStatus>) -> ResultCode {
    match status {
        Ok(FenceStatus::Signaled) => ResultCode::Success,
        Ok(FenceStatus::NotReady) => ResultCode::NotReady,
        Err(e) => e.into(),
    }
}
