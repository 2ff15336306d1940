//! # Walker Partition Protocol
//!
//! Command sequences that run one walker across several tiles. Every tile
//! executes the same bytes; control sections embedded in the command buffer
//! hold the counters the tiles synchronize on.
//!
//! ## Dynamic Partitioning
//!
//! ```text
//!  start ─▶ [sync before]                         (in-tile counter)
//!           LRI  predication mask
//!  loop  ─▶ ATOMIC inc partition counter ─▶ GPR4
//!           LRR  GPR4 ─▶ WPARID
//!           SET_PREDICATE on
//!           BB_START walker section  (predicated: WPARID < P)
//!           SET_PREDICATE off
//!           [self-cleanup: zero final sync counter]
//!           [PIPE_CONTROL stall]
//!           [post-sync semaphores]
//!           [cross-tile sync]                     (tile counter)
//!           BB_START after control ─────────────────────────────┐
//!  walker ─▶ COMPUTE_WALKER (partitioned)                       │
//!           BB_START loop                                       │
//!  control   BatchBufferControlData (16 bytes)                  │
//!  after ─▶ [self-cleanup end section] ◀────────────────────────┘
//!           [BB_END]
//! ```
//!
//! ## Static Partitioning
//!
//! ```text
//!           [sync before]
//!           [LRM WPARID ◀ work partition table]
//!           COMPUTE_WALKER (partitioned)
//!           [self-cleanup] [PIPE_CONTROL stall] [semaphores] [cross-tile sync]
//!           BB_START after control
//!  control   StaticPartitioningControl (12 bytes)
//!  after ─▶ [self-cleanup end section] [BB_END]
//! ```
//!
//! Size estimation functions mirror emission byte for byte; the engine
//! reserves the estimate as one contiguous block before emitting.

// `derive(Pod, Zeroable)` expands to unsafe impls.
#![allow(unsafe_code)]

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use ember_cmd::cmds::{
    regs, Atomic, AtomicOpcode, BatchBufferEnd, BatchBufferStart, CompareOp, ComputeWalker,
    HwCommand, LoadRegisterImm, LoadRegisterMem, LoadRegisterReg, PipeControl, SemaphoreWait,
    SetPredicate, StoreDataImm,
};
use ember_cmd::{CommandEncoder, HwOp, LinearStream, PipeControlFlags, WalkerArgs};
use ember_core::{GpuAddr, Result};

use crate::partition::MAX_DYNAMIC_PARTITIONS;

// =============================================================================
// CONTROL SECTIONS
// =============================================================================

/// Counters of a dynamically partitioned walker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BatchBufferControlData {
    /// Partitions claimed so far
    pub partition_count: u32,
    /// Tiles past the walker
    pub tile_count: u32,
    /// Tiles arrived before the walker
    pub in_tile_count: u32,
    /// Tiles in the cleanup end section
    pub final_sync_tile_count: u32,
}

const_assert_eq!(core::mem::size_of::<BatchBufferControlData>(), 16);

impl BatchBufferControlData {
    /// Offset of `partition_count`
    pub const PARTITION_COUNT: u64 = 0;
    /// Offset of `tile_count`
    pub const TILE_COUNT: u64 = 4;
    /// Offset of `in_tile_count`
    pub const IN_TILE_COUNT: u64 = 8;
    /// Offset of `final_sync_tile_count`
    pub const FINAL_SYNC_TILE_COUNT: u64 = 12;
    /// Size
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Counters of a statically partitioned walker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StaticPartitioningControl {
    /// Tiles arrived before the walker
    pub synchronize_before_walker_counter: u32,
    /// Tiles past the walker
    pub synchronize_after_walker_counter: u32,
    /// Tiles in the cleanup end section
    pub final_sync_tile_counter: u32,
}

const_assert_eq!(core::mem::size_of::<StaticPartitioningControl>(), 12);

impl StaticPartitioningControl {
    /// Offset of `synchronize_before_walker_counter`
    pub const BEFORE_WALKER: u64 = 0;
    /// Offset of `synchronize_after_walker_counter`
    pub const AFTER_WALKER: u64 = 4;
    /// Offset of `final_sync_tile_counter`
    pub const FINAL_SYNC: u64 = 8;
    /// Size
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Counters of a cross-tile barrier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BarrierControlSection {
    /// Tiles past the barrier
    pub cross_tile_sync_count: u32,
    /// Tiles in the cleanup end section
    pub final_sync_tile_count: u32,
}

const_assert_eq!(core::mem::size_of::<BarrierControlSection>(), 8);

impl BarrierControlSection {
    /// Offset of `cross_tile_sync_count`
    pub const CROSS_TILE_SYNC: u64 = 0;
    /// Offset of `final_sync_tile_count`
    pub const FINAL_SYNC: u64 = 4;
    /// Size
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

// =============================================================================
// ARGUMENTS
// =============================================================================

/// Per-partition post-sync values each tile waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreTargets {
    /// Post-sync address of partition 0
    pub base: GpuAddr,
    /// Distance between partitions
    pub stride: u32,
    /// Value a partition holds until its post-sync lands
    pub pending_value: u32,
}

/// Shape of a partitioned walker sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkerPartitionArgs {
    /// Partitions
    pub partition_count: u32,
    /// Tiles executing the sequence
    pub tile_count: u32,
    /// Synchronize tiles before the walker
    pub synchronize_before_execution: bool,
    /// Synchronize tiles after the walker
    pub cross_tile_atomic_sync: bool,
    /// Zero the control section after use
    pub emit_self_cleanup: bool,
    /// Zero with atomics instead of stores
    pub use_atomics_for_self_cleanup: bool,
    /// Stalling pipe control after the walker
    pub emit_pipe_control_stall: bool,
    /// Wait on every partition's post-sync value
    pub semaphores: Option<SemaphoreTargets>,
    /// Load WPARID from the work partition table (static only)
    pub initialize_wparid: bool,
    /// Work partition table
    pub work_partition_address: GpuAddr,
    /// End the sequence with BATCH_BUFFER_END
    pub emit_batch_buffer_end: bool,
}

/// Predication mask selecting `WPARID < partition_count`.
///
/// `partition_count` must be a power of two no larger than 16.
pub const fn wparid_mask(partition_count: u32) -> u32 {
    let mut mask = 0xFFE0;
    let mut fill = 0x10;
    let mut count = partition_count;
    while count != 0 && count < MAX_DYNAMIC_PARTITIONS {
        fill |= fill >> 1;
        count *= 2;
    }
    mask |= fill;
    mask
}

// =============================================================================
// SECTION SIZES
// =============================================================================

const TILES_SYNC_SIZE: usize = Atomic::SIZE + SemaphoreWait::SIZE;

fn cleanup_store_size(args: &WalkerPartitionArgs) -> usize {
    if args.use_atomics_for_self_cleanup {
        Atomic::SIZE
    } else {
        StoreDataImm::SIZE
    }
}

fn cleanup_end_size(args: &WalkerPartitionArgs, fields: usize) -> usize {
    if args.emit_self_cleanup {
        2 * TILES_SYNC_SIZE + fields * cleanup_store_size(args)
    } else {
        0
    }
}

/// Shared tail: cleanup, stall, semaphores and cross-tile sync
fn post_walker_size(args: &WalkerPartitionArgs) -> usize {
    let mut size = 0;
    if args.emit_self_cleanup {
        size += cleanup_store_size(args);
    }
    if args.emit_pipe_control_stall {
        size += PipeControl::SIZE;
    }
    if args.semaphores.is_some() {
        size += args.partition_count as usize * SemaphoreWait::SIZE;
    }
    if args.cross_tile_atomic_sync || args.emit_self_cleanup {
        size += TILES_SYNC_SIZE;
    }
    size
}

fn bb_end_size(args: &WalkerPartitionArgs) -> usize {
    if args.emit_batch_buffer_end {
        BatchBufferEnd::SIZE
    } else {
        0
    }
}

const DYNAMIC_WALKER_SECTION_SIZE: usize = ComputeWalker::SIZE + BatchBufferStart::SIZE;

/// Offset of the control section from the start of a dynamic sequence
pub fn dynamic_control_section_offset(args: &WalkerPartitionArgs) -> usize {
    let mut size = 0;
    if args.synchronize_before_execution {
        size += TILES_SYNC_SIZE;
    }
    size += LoadRegisterImm::SIZE
        + Atomic::SIZE
        + LoadRegisterReg::SIZE
        + 2 * SetPredicate::SIZE
        + 2 * BatchBufferStart::SIZE;
    size += post_walker_size(args);
    size + DYNAMIC_WALKER_SECTION_SIZE
}

/// Bytes of a dynamic sequence
pub fn estimate_dynamic(args: &WalkerPartitionArgs) -> usize {
    dynamic_control_section_offset(args)
        + BatchBufferControlData::SIZE
        + cleanup_end_size(args, 3)
        + bb_end_size(args)
}

/// Offset of the control section from the start of a static sequence
pub fn static_control_section_offset(args: &WalkerPartitionArgs) -> usize {
    let mut size = 0;
    if args.synchronize_before_execution {
        size += TILES_SYNC_SIZE;
    }
    if args.initialize_wparid {
        size += LoadRegisterMem::SIZE;
    }
    size + ComputeWalker::SIZE + post_walker_size(args) + BatchBufferStart::SIZE
}

/// Bytes of a static sequence
pub fn estimate_static(args: &WalkerPartitionArgs) -> usize {
    static_control_section_offset(args)
        + StaticPartitioningControl::SIZE
        + cleanup_end_size(args, 2)
        + bb_end_size(args)
}

/// Offset of the control section from the start of a barrier
pub fn barrier_control_section_offset(args: &WalkerPartitionArgs) -> usize {
    let mut size = 0;
    if args.emit_self_cleanup {
        size += cleanup_store_size(args);
    }
    size + PipeControl::SIZE + TILES_SYNC_SIZE + BatchBufferStart::SIZE
}

/// Bytes of a cross-tile barrier
pub fn estimate_barrier(args: &WalkerPartitionArgs) -> usize {
    barrier_control_section_offset(args) + BarrierControlSection::SIZE + cleanup_end_size(args, 1)
}

// =============================================================================
// EMISSION
// =============================================================================

struct Emitter<'a> {
    encoder: &'a dyn CommandEncoder,
    stream: &'a mut LinearStream,
}

impl Emitter<'_> {
    fn op(&mut self, op: HwOp) -> Result<()> {
        self.encoder.encode(&op, self.stream)?;
        Ok(())
    }

    fn jump(&mut self, target: GpuAddr, predicated: bool) -> Result<()> {
        self.op(HwOp::BatchBufferStart {
            target,
            second_level: false,
            predicated,
        })
    }

    /// Each tile bumps `counter` and waits until every tile did
    fn tiles_sync(&mut self, counter: GpuAddr, tiles: u32) -> Result<()> {
        self.op(HwOp::Atomic {
            address: counter,
            opcode: AtomicOpcode::Increment,
            operand: 0,
            return_data: false,
        })?;
        self.op(HwOp::SemaphoreWait {
            address: counter,
            value: tiles,
            op: CompareOp::GreaterOrEqual,
        })
    }

    fn zero(&mut self, args: &WalkerPartitionArgs, field: GpuAddr) -> Result<()> {
        if args.use_atomics_for_self_cleanup {
            self.op(HwOp::Atomic {
                address: field,
                opcode: AtomicOpcode::Move,
                operand: 0,
                return_data: false,
            })
        } else {
            self.op(HwOp::StoreDataImm {
                address: field,
                value: 0,
                qword: false,
            })
        }
    }

    fn post_walker(
        &mut self,
        args: &WalkerPartitionArgs,
        final_sync: GpuAddr,
        after_walker: GpuAddr,
    ) -> Result<()> {
        if args.emit_self_cleanup {
            self.zero(args, final_sync)?;
        }
        if args.emit_pipe_control_stall {
            self.op(HwOp::PipeControl {
                flags: PipeControlFlags::CS_STALL | PipeControlFlags::DC_FLUSH,
                address: GpuAddr::null(),
                data: 0,
            })?;
        }
        if let Some(targets) = args.semaphores {
            for partition in 0..args.partition_count {
                self.op(HwOp::SemaphoreWait {
                    address: targets
                        .base
                        .offset(partition as u64 * targets.stride as u64),
                    value: targets.pending_value,
                    op: CompareOp::NotEqual,
                })?;
            }
        }
        if args.cross_tile_atomic_sync || args.emit_self_cleanup {
            self.tiles_sync(after_walker, args.tile_count)?;
        }
        Ok(())
    }

    /// Zero `fields` once every tile reached the end, then wait until every
    /// tile finished zeroing.
    fn cleanup_end(
        &mut self,
        args: &WalkerPartitionArgs,
        final_sync: GpuAddr,
        fields: &[GpuAddr],
    ) -> Result<()> {
        if !args.emit_self_cleanup {
            return Ok(());
        }
        self.tiles_sync(final_sync, args.tile_count)?;
        for field in fields {
            self.zero(args, *field)?;
        }
        self.tiles_sync(final_sync, 2 * args.tile_count)
    }

    fn control<T: Pod>(&mut self, section: &T) -> Result<()> {
        self.stream.write(section)?;
        Ok(())
    }

    fn end(&mut self, args: &WalkerPartitionArgs) -> Result<()> {
        if args.emit_batch_buffer_end {
            self.op(HwOp::BatchBufferEnd)?;
        }
        Ok(())
    }
}

fn partitioned_walker(walker: &WalkerArgs, partition_count: u32) -> WalkerArgs {
    let mut walker = *walker;
    let workgroups = walker.group_count.along(walker.partition_type);
    walker.workload_partition_enable = true;
    walker.partition_size = workgroups.div_ceil(partition_count.max(1));
    walker
}

/// Emit a dynamically partitioned walker; returns bytes written
pub fn emit_dynamic(
    encoder: &dyn CommandEncoder,
    stream: &mut LinearStream,
    args: &WalkerPartitionArgs,
    walker: &WalkerArgs,
) -> Result<usize> {
    debug_assert!(args.partition_count.is_power_of_two());
    debug_assert!(args.partition_count <= MAX_DYNAMIC_PARTITIONS);

    let before = stream.used();
    let start = stream.current_gpu_address();
    let control = start.offset(dynamic_control_section_offset(args) as u64);
    let walker_section = GpuAddr::new(control.raw() - DYNAMIC_WALKER_SECTION_SIZE as u64);
    let after_control = control.offset(BatchBufferControlData::SIZE as u64);

    let partition_counter = control.offset(BatchBufferControlData::PARTITION_COUNT);
    let tile_counter = control.offset(BatchBufferControlData::TILE_COUNT);
    let in_tile_counter = control.offset(BatchBufferControlData::IN_TILE_COUNT);
    let final_sync = control.offset(BatchBufferControlData::FINAL_SYNC_TILE_COUNT);

    let mut e = Emitter {
        encoder,
        stream: &mut *stream,
    };

    if args.synchronize_before_execution {
        e.tiles_sync(in_tile_counter, args.tile_count)?;
    }
    e.op(HwOp::LoadRegisterImm {
        register: regs::PREDICATION_MASK,
        value: wparid_mask(args.partition_count),
    })?;

    let claim = e.stream.current_gpu_address();
    e.op(HwOp::Atomic {
        address: partition_counter,
        opcode: AtomicOpcode::Increment,
        operand: 0,
        return_data: true,
    })?;
    e.op(HwOp::LoadRegisterReg {
        source: regs::GPR4,
        destination: regs::WPARID,
    })?;
    e.op(HwOp::SetPredicate { wparid: true })?;
    e.jump(walker_section, true)?;
    e.op(HwOp::SetPredicate { wparid: false })?;

    e.post_walker(args, final_sync, tile_counter)?;
    e.jump(after_control, false)?;

    debug_assert_eq!(e.stream.current_gpu_address(), walker_section);
    e.op(HwOp::ComputeWalker(partitioned_walker(walker, args.partition_count)))?;
    e.jump(claim, false)?;

    debug_assert_eq!(e.stream.current_gpu_address(), control);
    e.control(&BatchBufferControlData::default())?;
    e.cleanup_end(args, final_sync, &[partition_counter, tile_counter, in_tile_counter])?;
    e.end(args)?;

    Ok(stream.used() - before)
}

/// Emit a statically partitioned walker; returns bytes written
pub fn emit_static(
    encoder: &dyn CommandEncoder,
    stream: &mut LinearStream,
    args: &WalkerPartitionArgs,
    walker: &WalkerArgs,
) -> Result<usize> {
    let before = stream.used();
    let start = stream.current_gpu_address();
    let control = start.offset(static_control_section_offset(args) as u64);
    let after_control = control.offset(StaticPartitioningControl::SIZE as u64);

    let before_walker = control.offset(StaticPartitioningControl::BEFORE_WALKER);
    let after_walker = control.offset(StaticPartitioningControl::AFTER_WALKER);
    let final_sync = control.offset(StaticPartitioningControl::FINAL_SYNC);

    let mut e = Emitter {
        encoder,
        stream: &mut *stream,
    };

    if args.synchronize_before_execution {
        e.tiles_sync(before_walker, args.tile_count)?;
    }
    if args.initialize_wparid {
        e.op(HwOp::LoadRegisterMem {
            register: regs::WPARID,
            address: args.work_partition_address,
        })?;
    }
    e.op(HwOp::ComputeWalker(partitioned_walker(walker, args.partition_count)))?;
    e.post_walker(args, final_sync, after_walker)?;
    e.jump(after_control, false)?;

    debug_assert_eq!(e.stream.current_gpu_address(), control);
    e.control(&StaticPartitioningControl::default())?;
    e.cleanup_end(args, final_sync, &[before_walker, after_walker])?;
    e.end(args)?;

    Ok(stream.used() - before)
}

/// Emit a cross-tile barrier with an optional post-sync write
pub fn emit_barrier(
    encoder: &dyn CommandEncoder,
    stream: &mut LinearStream,
    args: &WalkerPartitionArgs,
    flags: PipeControlFlags,
    post_sync: Option<(GpuAddr, u64)>,
) -> Result<usize> {
    let before = stream.used();
    let start = stream.current_gpu_address();
    let control = start.offset(barrier_control_section_offset(args) as u64);
    let after_control = control.offset(BarrierControlSection::SIZE as u64);

    let cross_tile = control.offset(BarrierControlSection::CROSS_TILE_SYNC);
    let final_sync = control.offset(BarrierControlSection::FINAL_SYNC);

    let mut e = Emitter {
        encoder,
        stream: &mut *stream,
    };

    if args.emit_self_cleanup {
        e.zero(args, final_sync)?;
    }
    let (address, data, flags) = match post_sync {
        Some((address, data)) => (
            address,
            data,
            flags | PipeControlFlags::POST_SYNC_WRITE_IMMEDIATE,
        ),
        None => (GpuAddr::null(), 0, flags),
    };
    e.op(HwOp::PipeControl {
        flags,
        address,
        data,
    })?;
    e.tiles_sync(cross_tile, args.tile_count)?;
    e.jump(after_control, false)?;

    debug_assert_eq!(e.stream.current_gpu_address(), control);
    e.control(&BarrierControlSection::default())?;
    e.cleanup_end(args, final_sync, &[cross_tile])?;

    Ok(stream.used() - before)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_cmd::parse::{count_kind, CommandParser, Segment};
    use ember_cmd::{Command, CommandKind, FamilyEncoder};
    use ember_core::{AllocationId, GroupCount, HwFamily, PartitionType};

    fn stream() -> LinearStream {
        LinearStream::with_capacity(AllocationId::new(1), GpuAddr::new(0x10_0000), 4096)
    }

    fn args(partitions: u32, tiles: u32) -> WalkerPartitionArgs {
        WalkerPartitionArgs {
            partition_count: partitions,
            tile_count: tiles,
            synchronize_before_execution: false,
            cross_tile_atomic_sync: true,
            emit_self_cleanup: true,
            use_atomics_for_self_cleanup: false,
            emit_pipe_control_stall: true,
            semaphores: None,
            initialize_wparid: true,
            work_partition_address: GpuAddr::new(0x9000),
            emit_batch_buffer_end: false,
        }
    }

    fn walker() -> WalkerArgs {
        WalkerArgs {
            group_count: GroupCount::linear(100),
            partition_type: PartitionType::X,
            ..Default::default()
        }
    }

    fn flag_combinations() -> impl Iterator<Item = WalkerPartitionArgs> {
        (0u32..64).map(|bits| WalkerPartitionArgs {
            synchronize_before_execution: bits & 1 != 0,
            cross_tile_atomic_sync: bits & 2 != 0,
            emit_self_cleanup: bits & 4 != 0,
            use_atomics_for_self_cleanup: bits & 8 != 0,
            emit_pipe_control_stall: bits & 16 != 0,
            emit_batch_buffer_end: bits & 32 != 0,
            semaphores: (bits % 3 == 0).then_some(SemaphoreTargets {
                base: GpuAddr::new(0x8000),
                stride: 32,
                pending_value: 1,
            }),
            ..args(4, 2)
        })
    }

    #[test]
    fn test_wparid_mask() {
        assert_eq!(wparid_mask(16), 0xFFF0);
        assert_eq!(wparid_mask(8), 0xFFF8);
        assert_eq!(wparid_mask(2), 0xFFFE);
        for p in [2u32, 4, 8, 16] {
            let mask = wparid_mask(p);
            for wparid in 0..32u32 {
                assert_eq!(wparid & mask == 0, wparid < p);
            }
        }
    }

    #[test]
    fn test_estimates_match_emission() {
        let encoder = FamilyEncoder::new(HwFamily::XeHpCore);
        for a in flag_combinations() {
            let mut s = stream();
            assert_eq!(emit_dynamic(&encoder, &mut s, &a, &walker()), Ok(estimate_dynamic(&a)));
            let mut s = stream();
            assert_eq!(emit_static(&encoder, &mut s, &a, &walker()), Ok(estimate_static(&a)));
            let mut s = stream();
            assert_eq!(
                emit_barrier(&encoder, &mut s, &a, PipeControlFlags::BARRIER, None),
                Ok(estimate_barrier(&a))
            );
        }
    }

    #[test]
    fn test_dynamic_emits_walker_once() {
        let encoder = FamilyEncoder::new(HwFamily::XeHpCore);
        let mut s = stream();
        let a = args(4, 2);
        assert!(emit_dynamic(&encoder, &mut s, &a, &walker()).is_ok());

        let parsed = CommandParser::new(Segment::from(&s)).parse().unwrap_or_default();
        assert_eq!(count_kind(&parsed, CommandKind::ComputeWalker), 1);
        let walkers: alloc::vec::Vec<_> = parsed
            .iter()
            .filter_map(|c| match c.command {
                Command::ComputeWalker(w) => Some(w),
                _ => None,
            })
            .collect();
        assert!(walkers[0].workload_partition_enabled());
        assert_eq!(walkers[0].partition_size, 25);

        let mask = parsed.iter().find_map(|c| match c.command {
            Command::LoadRegisterImm(lri) if lri.register == regs::PREDICATION_MASK => {
                Some(lri.value)
            }
            _ => None,
        });
        assert_eq!(mask, Some(wparid_mask(4)));
    }

    #[test]
    fn test_dynamic_control_section_is_zeroed_data() {
        let encoder = FamilyEncoder::new(HwFamily::XeHpCore);
        let mut s = stream();
        let a = WalkerPartitionArgs {
            emit_self_cleanup: false,
            ..args(2, 2)
        };
        let _ = emit_dynamic(&encoder, &mut s, &a, &walker());
        let offset = dynamic_control_section_offset(&a);
        assert_eq!(
            s.read::<BatchBufferControlData>(offset),
            Ok(BatchBufferControlData::default())
        );
        assert_eq!(s.used(), offset + BatchBufferControlData::SIZE);
    }

    #[test]
    fn test_exit_jump_skips_control_section() {
        let encoder = FamilyEncoder::new(HwFamily::XeHpCore);
        let mut s = stream();
        let a = args(2, 2);
        let _ = emit_static(&encoder, &mut s, &a, &walker());
        let control = s.gpu_base().offset(static_control_section_offset(&a) as u64);

        let jumps: alloc::vec::Vec<_> = CommandParser::new(Segment::from(&s))
            .parse()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| match c.command {
                Command::BatchBufferStart(bbs) => Some(bbs.target()),
                _ => None,
            })
            .collect();
        assert_eq!(
            jumps,
            [control.offset(StaticPartitioningControl::SIZE as u64)]
        );
    }

    #[test]
    fn test_cleanup_end_waits_twice_on_final_sync() {
        let encoder = FamilyEncoder::new(HwFamily::XeHpCore);
        let mut s = stream();
        let a = args(2, 2);
        let _ = emit_barrier(&encoder, &mut s, &a, PipeControlFlags::BARRIER, None);
        let final_sync = s
            .gpu_base()
            .offset(barrier_control_section_offset(&a) as u64 + BarrierControlSection::FINAL_SYNC);

        let waits: alloc::vec::Vec<u32> = CommandParser::new(Segment::from(&s))
            .parse()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| match c.command {
                Command::SemaphoreWait(sw) if sw.address() == final_sync => Some(sw.value),
                _ => None,
            })
            .collect();
        assert_eq!(waits, [2, 4]);
    }
}
