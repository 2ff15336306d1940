//! # Multi-Partition Dispatch Engine
//!
//! Emits a walker or a barrier across every tile of a device.
//!
//! ```text
//!   PartitionPlan ──▶ P == 1 ──▶ plain walker (partition type Disabled)
//!                 └─▶ P  > 1 ──▶ static / dynamic walker partition sequence
//! ```
//!
//! The whole partition sequence is reserved as one contiguous block of the
//! current command buffer, because its jumps are relative to its start.

use alloc::sync::Arc;

use ember_cmd::cmds::{regs, HwCommand, LoadRegisterImm, LoadRegisterMem, PipeControl};
use ember_cmd::{
    CommandContainer, CommandEncoder, Device, HwOp, LinearStream, PipeControlFlags, WalkerArgs,
};
use ember_core::{EngineGroupType, GpuAddr, GroupCount, PartitionType, Result};

use crate::partition::{PartitionPlan, MAX_DYNAMIC_PARTITIONS};
use crate::policy::ScalingPolicy;
use crate::walker_partition::{
    emit_barrier, emit_dynamic, emit_static, estimate_barrier, estimate_dynamic, estimate_static,
    SemaphoreTargets, WalkerPartitionArgs,
};

/// Per-dispatch options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchOptions {
    /// Wait on each partition's post-sync value before leaving
    pub semaphores: Option<SemaphoreTargets>,
    /// End the sequence with BATCH_BUFFER_END
    pub emit_batch_buffer_end: bool,
}

/// Implicit scaling for one engine of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImplicitScaling {
    policy: ScalingPolicy,
    work_partition: GpuAddr,
}

impl ImplicitScaling {
    /// Engine from a resolved policy
    pub fn new(policy: ScalingPolicy, work_partition: GpuAddr) -> Self {
        Self {
            policy,
            work_partition,
        }
    }

    /// Engine for walkers on `engine` of `device`
    pub fn for_device(device: &Device, engine: EngineGroupType) -> Self {
        let work_partition = device
            .work_partition()
            .map_or(GpuAddr::null(), |table| table.gpu_base());
        Self::new(ScalingPolicy::for_device(device, engine), work_partition)
    }

    /// Resolved policy
    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    /// Plan a walker
    pub fn plan(&self, group_start: GroupCount, group_count: GroupCount, uses_images: bool) -> PartitionPlan {
        PartitionPlan::for_walker(&self.policy, group_start, group_count, uses_images)
    }

    fn partition_args(&self, plan: &PartitionPlan, options: &DispatchOptions) -> WalkerPartitionArgs {
        WalkerPartitionArgs {
            partition_count: plan.partition_count,
            tile_count: plan.tile_mask.count(),
            synchronize_before_execution: self.policy.synchronize_before_execution,
            cross_tile_atomic_sync: self.policy.cross_tile_atomic_sync,
            emit_self_cleanup: self.policy.self_cleanup(plan.is_static),
            use_atomics_for_self_cleanup: self.policy.use_atomics_for_self_cleanup,
            emit_pipe_control_stall: self.policy.pipe_control_stall,
            semaphores: options.semaphores.filter(|_| self.policy.post_sync_semaphores),
            initialize_wparid: plan.is_static && !self.work_partition.is_null(),
            work_partition_address: self.work_partition,
            emit_batch_buffer_end: options.emit_batch_buffer_end,
        }
    }

    fn barrier_args(&self) -> WalkerPartitionArgs {
        WalkerPartitionArgs {
            partition_count: self.policy.tile_count,
            tile_count: self.policy.tile_count,
            synchronize_before_execution: false,
            cross_tile_atomic_sync: true,
            // Barriers always synchronize through their counters
            emit_self_cleanup: self.policy.self_cleanup_override.unwrap_or(true),
            use_atomics_for_self_cleanup: self.policy.use_atomics_for_self_cleanup,
            emit_pipe_control_stall: false,
            semaphores: None,
            initialize_wparid: false,
            work_partition_address: GpuAddr::null(),
            emit_batch_buffer_end: false,
        }
    }

    fn check_plan(&self, plan: &PartitionPlan) {
        assert!(plan.partition_count > 0, "partition count of zero");
        if plan.is_static {
            assert!(
                plan.partition_count <= plan.tile_mask.count(),
                "static partition count exceeds tile count"
            );
        } else {
            assert!(
                plan.partition_count <= MAX_DYNAMIC_PARTITIONS,
                "dynamic partition count exceeds 16"
            );
            assert!(
                plan.partition_count.is_power_of_two(),
                "dynamic partition count is not a power of two"
            );
        }
    }

    /// Bytes [`ImplicitScaling::dispatch`] emits
    pub fn estimate_dispatch(&self, plan: &PartitionPlan, options: &DispatchOptions) -> usize {
        if plan.partition_count <= 1 {
            return ember_cmd::cmds::ComputeWalker::SIZE;
        }
        let args = self.partition_args(plan, options);
        if plan.is_static {
            estimate_static(&args)
        } else {
            estimate_dynamic(&args)
        }
    }

    /// Emit `walker` split according to `plan`; returns bytes written.
    ///
    /// # Panics
    ///
    /// On a zero partition count, a static plan with more partitions than
    /// tiles, or a dynamic plan with more than 16 partitions.
    pub fn dispatch(
        &self,
        container: &mut CommandContainer,
        plan: &PartitionPlan,
        walker: &WalkerArgs,
        options: &DispatchOptions,
    ) -> Result<usize> {
        self.check_plan(plan);

        if plan.partition_count == 1 {
            let walker = WalkerArgs {
                partition_type: PartitionType::Disabled,
                partition_size: 0,
                workload_partition_enable: false,
                ..*walker
            };
            let before = container.total_used();
            container.emit(&HwOp::ComputeWalker(walker))?;
            return Ok(container.total_used() - before);
        }

        let args = self.partition_args(plan, options);
        let size = self.estimate_dispatch(plan, options);
        let encoder: Arc<dyn CommandEncoder> = Arc::clone(container.encoder());
        let stream = container.reserve(size)?;
        let walker = WalkerArgs {
            partition_type: plan.partition_type,
            ..*walker
        };
        let written = if plan.is_static {
            emit_static(encoder.as_ref(), stream, &args, &walker)?
        } else {
            emit_dynamic(encoder.as_ref(), stream, &args, &walker)?
        };
        debug_assert_eq!(written, size);

        log::trace!(
            "ember-scaling: {} walker over {} partitions ({:?}), {} bytes",
            if plan.is_static { "static" } else { "dynamic" },
            plan.partition_count,
            plan.partition_type,
            written
        );
        Ok(written)
    }

    /// Bytes [`ImplicitScaling::dispatch_barrier`] emits
    pub fn estimate_barrier(&self) -> usize {
        if self.policy.is_enabled() {
            estimate_barrier(&self.barrier_args())
        } else {
            PipeControl::SIZE
        }
    }

    /// Emit a barrier across every tile, optionally writing `post_sync`
    /// once all tiles passed it
    pub fn dispatch_barrier(
        &self,
        container: &mut CommandContainer,
        flags: PipeControlFlags,
        post_sync: Option<(GpuAddr, u64)>,
    ) -> Result<usize> {
        if !self.policy.is_enabled() {
            let (address, data, flags) = match post_sync {
                Some((address, data)) => (
                    address,
                    data,
                    flags | PipeControlFlags::POST_SYNC_WRITE_IMMEDIATE,
                ),
                None => (GpuAddr::null(), 0, flags),
            };
            let before = container.total_used();
            container.emit(&HwOp::PipeControl {
                flags,
                address,
                data,
            })?;
            return Ok(container.total_used() - before);
        }

        let args = self.barrier_args();
        let size = estimate_barrier(&args);
        let encoder: Arc<dyn CommandEncoder> = Arc::clone(container.encoder());
        let stream = container.reserve(size)?;
        let written = emit_barrier(encoder.as_ref(), stream, &args, flags, post_sync)?;
        debug_assert_eq!(written, size);
        Ok(written)
    }
}

// =============================================================================
// PARTITION REGISTERS
// =============================================================================

/// Bytes of [`emit_partition_registers`]
pub const PARTITION_REGISTERS_SIZE: usize = LoadRegisterImm::SIZE + LoadRegisterMem::SIZE;

/// Program the per-tile post-sync address offset and each tile's WPARID.
///
/// Emitted once per queue before the first multi-tile submission.
pub fn emit_partition_registers(
    encoder: &dyn CommandEncoder,
    stream: &mut LinearStream,
    packet_size: u32,
    work_partition: GpuAddr,
) -> Result<usize> {
    let mut written = encoder.encode(
        &HwOp::LoadRegisterImm {
            register: regs::ADDRESS_OFFSET,
            value: packet_size,
        },
        stream,
    )?;
    written += encoder.encode(
        &HwOp::LoadRegisterMem {
            register: regs::WPARID,
            address: work_partition,
        },
        stream,
    )?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_cmd::parse::{count_kind, CommandParser, Segment};
    use ember_cmd::{Command, CommandKind};
    use ember_core::{DispatchConfig, HwFamily, TileMask};

    fn device(family: HwFamily, tiles: u32, config: DispatchConfig) -> Device {
        match Device::with_config(family, tiles, config) {
            Ok(device) => device,
            Err(e) => panic!("device: {e}"),
        }
    }

    fn container(device: &Device) -> CommandContainer {
        match CommandContainer::new(
            Arc::clone(device.memory()),
            Arc::clone(device.encoder()),
            device.config().command_buffer_size,
            device.config().indirect_heap_size,
            device.jump_target_alignment(),
        ) {
            Ok(c) => c,
            Err(e) => panic!("container: {e}"),
        }
    }

    fn walkers(c: &CommandContainer) -> alloc::vec::Vec<ember_cmd::cmds::ComputeWalker> {
        CommandParser::with_segments(c.buffers().iter().map(Segment::from))
            .parse()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| match p.command {
                Command::ComputeWalker(w) => Some(w),
                _ => None,
            })
            .collect()
    }

    fn walker_args() -> WalkerArgs {
        WalkerArgs {
            group_count: GroupCount::linear(4096),
            ..Default::default()
        }
    }

    #[test]
    fn test_single_partition_bypasses_engine() {
        let multi = device(HwFamily::XeHpCore, 2, DispatchConfig::default());
        let single = device(HwFamily::XeHpCore, 1, DispatchConfig::default());

        let scaling = ImplicitScaling::for_device(&multi, EngineGroupType::Compute);
        let plan = PartitionPlan {
            partition_count: 1,
            tile_mask: TileMask::first(2),
            is_static: false,
            partition_type: PartitionType::X,
        };
        let mut a = container(&multi);
        let written = scaling.dispatch(&mut a, &plan, &walker_args(), &DispatchOptions::default());
        assert_eq!(written, Ok(scaling.estimate_dispatch(&plan, &DispatchOptions::default())));

        let reference = ImplicitScaling::for_device(&single, EngineGroupType::Compute);
        let plan_one = PartitionPlan::single(TileMask::first(1));
        let mut b = container(&single);
        let _ = reference.dispatch(&mut b, &plan_one, &walker_args(), &DispatchOptions::default());

        assert_eq!(walkers(&a), walkers(&b));
        assert_eq!(walkers(&a).len(), 1);
        assert_eq!(walkers(&a)[0].partition_type(), PartitionType::Disabled);
    }

    #[test]
    fn test_dynamic_dispatch_partitions_walker() {
        let config = DispatchConfig {
            static_partitioning: Some(false),
            ..Default::default()
        };
        let dev = device(HwFamily::XeHpcCore, 2, config);
        let scaling = ImplicitScaling::for_device(&dev, EngineGroupType::Compute);
        let plan = scaling.plan(GroupCount::default(), walker_args().group_count, false);
        assert!(!plan.is_static);
        assert_eq!(plan.partition_count, 8);

        let mut c = container(&dev);
        let written = scaling.dispatch(&mut c, &plan, &walker_args(), &DispatchOptions::default());
        assert_eq!(written, Ok(scaling.estimate_dispatch(&plan, &DispatchOptions::default())));

        let found = walkers(&c);
        assert_eq!(found.len(), 1);
        assert!(found[0].workload_partition_enabled());
        assert_eq!(found[0].partition_size, 512);
    }

    #[test]
    fn test_static_dispatch_loads_wparid() {
        let config = DispatchConfig {
            static_partitioning: Some(true),
            ..Default::default()
        };
        let dev = device(HwFamily::XeHpCore, 2, config);
        let scaling = ImplicitScaling::for_device(&dev, EngineGroupType::Compute);
        let plan = scaling.plan(GroupCount::default(), GroupCount::linear(64), false);
        assert_eq!(plan.partition_count, 2);

        let mut c = container(&dev);
        let _ = scaling.dispatch(&mut c, &plan, &walker_args(), &DispatchOptions::default());
        let parsed = CommandParser::new(Segment::from(&c.buffers()[0]))
            .parse()
            .unwrap_or_default();
        assert_eq!(count_kind(&parsed, CommandKind::LoadRegisterMem), 1);
        assert_eq!(count_kind(&parsed, CommandKind::ComputeWalker), 1);
    }

    #[test]
    #[should_panic(expected = "dynamic partition count exceeds 16")]
    fn test_dynamic_over_sixteen_asserts() {
        let dev = device(HwFamily::XeHpcCore, 2, DispatchConfig::default());
        let scaling = ImplicitScaling::for_device(&dev, EngineGroupType::Compute);
        let plan = PartitionPlan {
            partition_count: 32,
            tile_mask: TileMask::first(2),
            is_static: false,
            partition_type: PartitionType::X,
        };
        let mut c = container(&dev);
        let _ = scaling.dispatch(&mut c, &plan, &walker_args(), &DispatchOptions::default());
    }

    #[test]
    #[should_panic(expected = "static partition count exceeds tile count")]
    fn test_static_over_tiles_asserts() {
        let dev = device(HwFamily::XeHpcCore, 2, DispatchConfig::default());
        let scaling = ImplicitScaling::for_device(&dev, EngineGroupType::Compute);
        let plan = PartitionPlan {
            partition_count: 4,
            tile_mask: TileMask::first(2),
            is_static: true,
            partition_type: PartitionType::X,
        };
        let mut c = container(&dev);
        let _ = scaling.dispatch(&mut c, &plan, &walker_args(), &DispatchOptions::default());
    }

    #[test]
    #[should_panic(expected = "partition count of zero")]
    fn test_zero_partitions_asserts() {
        let dev = device(HwFamily::XeHpcCore, 2, DispatchConfig::default());
        let scaling = ImplicitScaling::for_device(&dev, EngineGroupType::Compute);
        let plan = PartitionPlan {
            partition_count: 0,
            ..PartitionPlan::single(TileMask::first(2))
        };
        let mut c = container(&dev);
        let _ = scaling.dispatch(&mut c, &plan, &walker_args(), &DispatchOptions::default());
    }

    #[test]
    fn test_barrier_single_tile_is_pipe_control() {
        let dev = device(HwFamily::XeHpgCore, 1, DispatchConfig::default());
        let scaling = ImplicitScaling::for_device(&dev, EngineGroupType::Compute);
        let mut c = container(&dev);
        let written = scaling.dispatch_barrier(&mut c, PipeControlFlags::BARRIER, None);
        assert_eq!(written, Ok(PipeControl::SIZE));
        assert_eq!(scaling.estimate_barrier(), PipeControl::SIZE);
    }

    #[test]
    fn test_multi_tile_barrier_matches_estimate() {
        let dev = device(HwFamily::XeHpcCore, 2, DispatchConfig::default());
        let scaling = ImplicitScaling::for_device(&dev, EngineGroupType::Compute);
        let mut c = container(&dev);
        let written = scaling.dispatch_barrier(
            &mut c,
            PipeControlFlags::BARRIER,
            Some((GpuAddr::new(0x8000), 0)),
        );
        assert_eq!(written, Ok(scaling.estimate_barrier()));
        let parsed = CommandParser::new(Segment::from(&c.buffers()[0]))
            .parse()
            .unwrap_or_default();
        let post_sync = parsed.iter().find_map(|p| match p.command {
            Command::PipeControl(pc) => Some(pc.address()),
            _ => None,
        });
        assert_eq!(post_sync, Some(GpuAddr::new(0x8000)));
    }

    #[test]
    fn test_partition_registers() {
        let encoder = ember_cmd::FamilyEncoder::new(HwFamily::XeHpCore);
        let mut s = LinearStream::with_capacity(
            ember_core::AllocationId::new(1),
            GpuAddr::new(0x1000),
            256,
        );
        let written = emit_partition_registers(&encoder, &mut s, 32, GpuAddr::new(0x9000));
        assert_eq!(written, Ok(PARTITION_REGISTERS_SIZE));
    }
}
