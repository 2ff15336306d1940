//! # Kernel Launches
//!
//! User kernels and the built-ins behind copies, fills and timestamp
//! queries all end up in [`CommandList::append_kernels`]:
//!
//! ```text
//!   waits ─▶ plan partitions ─▶ begin_signal ─▶ per split:
//!                                               cross-thread data ─▶ heap
//!                                               state requirements ─▶ transitions
//!                                               walker ─▶ dispatch engine
//!                                          ─▶ end_signal
//! ```

use alloc::sync::Arc;

use arrayvec::ArrayVec;

use ember_cmd::kernel::MAX_KERNEL_ARGS;
use ember_cmd::{BuiltinKernel, Kernel, KernelArg, PipeControlFlags, WalkerArgs, WalkerPostSync};
use ember_core::{AllocationId, Error, GpuAddr, GroupCount, Result};
use ember_event::{Event, MAX_KERNEL_SPLITS};
use ember_scaling::{DispatchOptions, PartitionPlan, SemaphoreTargets};

use crate::list::CommandList;

/// One kernel split of an operation
#[derive(Debug, Clone, Copy)]
pub(crate) struct KernelLaunch<'a> {
    pub(crate) kernel: &'a Kernel,
    pub(crate) group_count: GroupCount,
    pub(crate) cooperative: bool,
}

impl CommandList {
    /// Launch `kernel` over `group_count` work-groups
    pub fn append_launch_kernel(
        &mut self,
        kernel: &Kernel,
        group_count: GroupCount,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.append_kernels(
            &[KernelLaunch {
                kernel,
                group_count,
                cooperative: false,
            }],
            signal,
            waits,
        )
    }

    /// Launch a kernel whose work-groups must be co-resident; never split
    /// across partitions
    pub fn append_launch_cooperative_kernel(
        &mut self,
        kernel: &Kernel,
        group_count: GroupCount,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.append_kernels(
            &[KernelLaunch {
                kernel,
                group_count,
                cooperative: true,
            }],
            signal,
            waits,
        )
    }

    /// Instantiate a built-in with immediate arguments
    pub(crate) fn builtin_kernel(&self, builtin: BuiltinKernel, args: &[KernelArg]) -> Result<Kernel> {
        let mut kernel = Kernel::new(self.device.builtins().descriptor(builtin)?);
        for (index, arg) in args.iter().enumerate() {
            kernel.set_arg(index, *arg)?;
        }
        kernel.set_group_size(builtin.group_width(), 1, 1)?;
        Ok(kernel)
    }

    fn plan_split(&self, launch: &KernelLaunch<'_>) -> PartitionPlan {
        if launch.cooperative {
            PartitionPlan::cooperative(self.scaling.policy())
        } else {
            self.scaling.plan(
                GroupCount::default(),
                launch.group_count,
                launch.kernel.descriptor().uses_images,
            )
        }
    }

    /// Record the kernel splits of one operation under one signal
    pub(crate) fn append_kernels(
        &mut self,
        launches: &[KernelLaunch<'_>],
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.ensure_open()?;
        if self.engine.is_copy_only() {
            return Err(Error::NotSupported);
        }
        if launches.is_empty()
            || launches.len() > MAX_KERNEL_SPLITS as usize
            || launches.iter().any(|l| l.group_count.is_empty())
        {
            return Err(Error::InvalidArgument);
        }

        self.wait_for_events(waits)?;

        let mut plans: ArrayVec<PartitionPlan, { MAX_KERNEL_SPLITS as usize }> =
            launches.iter().map(|l| self.plan_split(l)).collect();
        // Splits signaling one event share its per-kernel packet stride
        let partitions = plans.iter().map(|p| p.partition_count).min().unwrap_or(1);
        if signal.is_some() {
            for plan in &mut plans {
                plan.partition_count = partitions;
            }
        }

        let signal_plan = self.begin_signal(signal, launches.len() as u32, Some(partitions))?;
        for (index, (launch, plan)) in launches.iter().zip(&plans).enumerate() {
            let (post_sync, semaphores) = match &signal_plan {
                Some(s) => (s.walker_post_sync(index as u32), s.semaphores(index as u32)),
                None => (WalkerPostSync::default(), None),
            };
            self.launch_split(launch, plan, post_sync, semaphores)?;
        }
        self.end_signal(signal_plan, PipeControlFlags::CS_STALL)?;
        self.mark_operation();
        Ok(())
    }

    fn launch_split(
        &mut self,
        launch: &KernelLaunch<'_>,
        plan: &PartitionPlan,
        post_sync: WalkerPostSync,
        semaphores: Option<SemaphoreTargets>,
    ) -> Result<()> {
        let kernel = launch.kernel;
        let desc = Arc::clone(kernel.descriptor());

        let memory = Arc::clone(self.device.memory());
        let mut referenced: ArrayVec<AllocationId, MAX_KERNEL_ARGS> = ArrayVec::new();
        let data = kernel.cross_thread_data(|ptr| {
            if ptr.is_null() {
                return Ok(GpuAddr::null());
            }
            match memory.resolve(ptr, 1) {
                Some(resolved) => {
                    if let Some(id) = resolved.id {
                        referenced.push(id);
                    }
                    Ok(resolved.gpu_address)
                }
                None if memory.shared_system_fallback() => Ok(GpuAddr::new(ptr.raw())),
                None => Err(Error::OutOfDeviceMemory),
            }
        })?;
        let residency = self.container.residency_mut();
        residency.extend(referenced);
        residency.push(desc.isa_allocation);

        let (slot, switched) = self.container.push_indirect(&data)?;
        if switched {
            log::debug!("ember-list: cross-thread data moved to a new heap");
        }

        let caps = Arc::clone(self.device.caps());
        let mut requirements = desc.state_requirements(
            self.device.preemption_mode(),
            caps.supports_large_grf(),
            caps.supports_systolic(),
        );
        requirements.heaps = Some(self.device.heap_bases());
        self.require_state(&requirements)?;

        let properties = &mut self.properties;
        properties.indirect_access |= desc.indirect_access;
        properties.scratch_per_thread = properties.scratch_per_thread.max(desc.scratch_per_thread);
        properties.max_partition_count = properties.max_partition_count.max(plan.partition_count);

        let walker = WalkerArgs {
            kernel_start: desc.isa,
            indirect_data_start: self.device.indirect_offset(slot.gpu_address)?,
            indirect_data_length: data.len() as u32,
            group_count: launch.group_count,
            simd_size: desc.simd_size,
            threads_per_group: kernel.threads_per_group(),
            slm_size: desc.slm_size,
            barrier_count: desc.barrier_count,
            post_sync,
            ..Default::default()
        };
        let options = DispatchOptions {
            semaphores,
            emit_batch_buffer_end: false,
        };
        self.scaling
            .dispatch(&mut self.container, plan, &walker, &options)?;

        log::trace!(
            "ember-list: launched {} over {:?} in {} partition(s)",
            desc.name,
            launch.group_count,
            plan.partition_count
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::CommandListFlags;
    use ember_core::AllocationResolver;
    use crate::testing::{device, device_with, kernel, parse, Env};
    use ember_cmd::parse::{count_kind, filter_kind};
    use ember_cmd::{Command, CommandKind, KernelDescriptor, KernelStateRequirements};
    use ember_core::{
        AllocationKind, ByteSize, DispatchConfig, EngineGroupType, HwFamily, IndirectAccess,
        PartitionType, UsmPtr,
    };

    fn list(device: &Arc<ember_cmd::Device>, engine: EngineGroupType) -> CommandList {
        match CommandList::create(Arc::clone(device), engine, CommandListFlags::empty()) {
            Ok(list) => list,
            Err(e) => panic!("list: {e}"),
        }
    }

    #[test]
    fn test_kernel_args_become_resident() {
        let Env { memory, device } = Env::new(HwFamily::XeHpCore, 1);
        let Ok(buffer) = memory.allocate_usm(ByteSize::from_kib(4), AllocationKind::DeviceUsm) else {
            panic!("usm");
        };
        let mut k = kernel(&device, KernelStateRequirements::default());
        assert_eq!(k.set_arg(0, KernelArg::Buffer(buffer)), Ok(()));
        assert_eq!(k.set_arg(1, KernelArg::Value(7)), Ok(()));

        let mut list = list(&device, EngineGroupType::Compute);
        assert_eq!(list.append_launch_kernel(&k, GroupCount::linear(2), None, &[]), Ok(()));

        let resolved = memory.resolve(buffer, 1);
        let Some(id) = resolved.and_then(|r| r.id) else {
            panic!("resolved");
        };
        assert!(list.residency().contains(id));
        assert!(list.residency().contains(k.descriptor().isa_allocation));
    }

    #[test]
    fn test_unresolvable_argument_fails() {
        let device = device(HwFamily::XeHpCore, 1);
        let mut k = kernel(&device, KernelStateRequirements::default());
        assert_eq!(k.set_arg(0, KernelArg::Buffer(UsmPtr::new(0x1234_0000))), Ok(()));
        let mut list = list(&device, EngineGroupType::Compute);
        assert_eq!(
            list.append_launch_kernel(&k, GroupCount::linear(2), None, &[]),
            Err(Error::OutOfDeviceMemory)
        );
    }

    #[test]
    fn test_zero_groups_and_copy_engine_rejected() {
        let device = device(HwFamily::XeHpCore, 1);
        let k = kernel(&device, KernelStateRequirements::default());
        let mut compute = list(&device, EngineGroupType::Compute);
        assert_eq!(
            compute.append_launch_kernel(&k, GroupCount::new(4, 0, 1), None, &[]),
            Err(Error::InvalidArgument)
        );
        let mut copy = list(&device, EngineGroupType::Copy);
        assert_eq!(
            copy.append_launch_kernel(&k, GroupCount::linear(1), None, &[]),
            Err(Error::NotSupported)
        );
    }

    #[test]
    fn test_walker_addresses_cross_thread_data() {
        let device = device(HwFamily::XeHpcCore, 1);
        let k = kernel(&device, KernelStateRequirements::default());
        let mut list = list(&device, EngineGroupType::Compute);
        assert_eq!(list.append_launch_kernel(&k, GroupCount::linear(3), None, &[]), Ok(()));
        assert_eq!(list.append_launch_kernel(&k, GroupCount::linear(3), None, &[]), Ok(()));

        let walkers = filter_kind(&parse(&list), CommandKind::ComputeWalker);
        assert_eq!(walkers.len(), 2);
        let Command::ComputeWalker(second) = walkers[1].command else {
            panic!("walker");
        };
        let heap = list.container().heap().base();
        assert_eq!(Ok(second.indirect_data_start), device.indirect_offset(heap.offset(64)));
        assert_eq!(second.kernel_start(), k.descriptor().isa);
        assert_eq!(second.group_count, [3, 1, 1]);
    }

    #[test]
    fn test_heap_switch_keeps_state_base_address() {
        let config = DispatchConfig {
            indirect_heap_size: ByteSize::from_bytes(128),
            ..Default::default()
        };
        let device = device_with(HwFamily::XeHpCore, 1, config);
        let k = kernel(&device, KernelStateRequirements::default());
        let mut list = list(&device, EngineGroupType::Compute);
        for _ in 0..3 {
            assert_eq!(list.append_launch_kernel(&k, GroupCount::linear(1), None, &[]), Ok(()));
        }
        assert_eq!(list.container().stats().heap_switches, 1);
        assert_eq!(count_kind(&parse(&list), CommandKind::StateBaseAddress), 0);
        assert_eq!(
            list.final_state().state_base_address.heaps.value(),
            Some(device.heap_bases())
        );

        // The third walker reads from the start of the new heap
        let walkers = filter_kind(&parse(&list), CommandKind::ComputeWalker);
        let Some(Command::ComputeWalker(third)) = walkers.last().map(|w| w.command) else {
            panic!("walker");
        };
        let heap = list.container().heap().base();
        assert_eq!(Ok(third.indirect_data_start), device.indirect_offset(heap));
    }

    #[test]
    fn test_multi_tile_launch_is_partitioned_once() {
        let device = device(HwFamily::XeHpCore, 4);
        let k = kernel(&device, KernelStateRequirements::default());
        let mut list = list(&device, EngineGroupType::Compute);
        assert_eq!(list.append_launch_kernel(&k, GroupCount::linear(65536), None, &[]), Ok(()));

        let walkers = filter_kind(&parse(&list), CommandKind::ComputeWalker);
        assert_eq!(walkers.len(), 1);
        let Command::ComputeWalker(walker) = walkers[0].command else {
            panic!("walker");
        };
        let plan = list
            .scaling()
            .plan(GroupCount::default(), GroupCount::linear(65536), false);
        assert!(plan.is_partitioned());
        assert!(walker.workload_partition_enabled());
        assert_eq!(walker.partition_type(), PartitionType::X);
        assert_eq!(list.properties().max_partition_count, plan.partition_count);
    }

    #[test]
    fn test_cooperative_launch_is_not_split() {
        let device = device(HwFamily::XeHpCore, 4);
        let k = kernel(&device, KernelStateRequirements::default());
        let mut list = list(&device, EngineGroupType::Compute);
        assert_eq!(
            list.append_launch_cooperative_kernel(&k, GroupCount::linear(65536), None, &[]),
            Ok(())
        );
        let walkers = filter_kind(&parse(&list), CommandKind::ComputeWalker);
        let Command::ComputeWalker(walker) = walkers[0].command else {
            panic!("walker");
        };
        assert!(!walker.workload_partition_enabled());
        assert_eq!(walker.partition_type(), PartitionType::Disabled);
    }

    #[test]
    fn test_indirect_access_and_scratch_recorded() {
        let device = device(HwFamily::XeHpCore, 1);
        let base = kernel(&device, KernelStateRequirements::default());
        let mut desc = KernelDescriptor::clone(base.descriptor());
        desc.indirect_access = IndirectAccess::DEVICE | IndirectAccess::SHARED;
        desc.scratch_per_thread = 1024;
        let k = Kernel::new(Arc::new(desc));

        let mut list = list(&device, EngineGroupType::Compute);
        assert_eq!(list.append_launch_kernel(&k, GroupCount::linear(1), None, &[]), Ok(()));
        assert_eq!(
            list.properties().indirect_access,
            IndirectAccess::DEVICE | IndirectAccess::SHARED
        );
        assert_eq!(list.properties().scratch_per_thread, 1024);
    }
}
