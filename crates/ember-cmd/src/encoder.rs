//! # Command Encoder
//!
//! Translates hardware operations into command bytes for one family.
//!
//! The dispatch core never builds command layouts directly: it describes
//! what it needs as an [`HwOp`] and hands it to the device's
//! [`CommandEncoder`]. [`FamilyEncoder`] is the built-in implementation;
//! per-family differences are data on the encoder, not separate types.

use core::fmt;

use bytemuck::Zeroable;

use ember_core::stream_state::HeapBases;
use ember_core::{
    Error, GpuAddr, GroupCount, HwFamily, PartitionType, PreemptionMode, Result,
    ThreadArbitration,
};

use crate::cmds::*;
use crate::stream::LinearStream;

// =============================================================================
// OPERATIONS
// =============================================================================

/// Walker post-sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalkerPostSync {
    /// Operation
    pub op: PostSyncOp,
    /// Destination
    pub address: GpuAddr,
    /// Immediate data
    pub data: u64,
    /// Flush the data cache with the write
    pub dc_flush: bool,
}

/// Arguments of a compute walker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalkerArgs {
    /// Kernel ISA start
    pub kernel_start: GpuAddr,
    /// Cross-thread data offset from the indirect object base
    pub indirect_data_start: u32,
    /// Cross-thread data length
    pub indirect_data_length: u32,
    /// Starting group ID
    pub group_start: GroupCount,
    /// Group count
    pub group_count: GroupCount,
    /// SIMD width
    pub simd_size: u32,
    /// Threads per group
    pub threads_per_group: u32,
    /// Shared local memory size
    pub slm_size: u32,
    /// Barrier count
    pub barrier_count: u32,
    /// Partition axis
    pub partition_type: PartitionType,
    /// Work-groups per partition
    pub partition_size: u32,
    /// Split across partitions
    pub workload_partition_enable: bool,
    /// Post-sync
    pub post_sync: WalkerPostSync,
}

/// Front end mode bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrontEndModes {
    /// Compute dispatch all walker
    pub compute_dispatch_all_walker: bool,
    /// Disable EU fusion
    pub disable_eu_fusion: bool,
    /// Disable overdispatch
    pub disable_overdispatch: bool,
    /// Single slice CCS dispatch
    pub single_slice_dispatch_ccs: bool,
}

impl FrontEndModes {
    fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.compute_dispatch_all_walker {
            bits |= FrontEndState::COMPUTE_DISPATCH_ALL_WALKER;
        }
        if self.disable_eu_fusion {
            bits |= FrontEndState::DISABLE_EU_FUSION;
        }
        if self.disable_overdispatch {
            bits |= FrontEndState::DISABLE_OVERDISPATCH;
        }
        if self.single_slice_dispatch_ccs {
            bits |= FrontEndState::SINGLE_SLICE_DISPATCH_CCS;
        }
        bits
    }
}

/// Blitter copy of a `width × height` byte rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitCopyArgs {
    /// Source
    pub src: GpuAddr,
    /// Destination
    pub dst: GpuAddr,
    /// Bytes per row
    pub width: u32,
    /// Rows
    pub height: u32,
    /// Source pitch
    pub src_pitch: u32,
    /// Destination pitch
    pub dst_pitch: u32,
}

/// Blitter pattern fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitFillArgs {
    /// Destination
    pub dst: GpuAddr,
    /// Bytes per row
    pub width: u32,
    /// Rows
    pub height: u32,
    /// Destination pitch
    pub pitch: u32,
    /// Pattern, up to 16 bytes
    pub pattern: [u8; 16],
    /// Pattern size
    pub pattern_size: u32,
}

/// One hardware operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwOp {
    /// Padding
    Noop {
        /// Dwords of padding
        dwords: u32,
    },
    /// Jump or call
    BatchBufferStart {
        /// Target
        target: GpuAddr,
        /// Call instead of jump
        second_level: bool,
        /// Predicated on WPARID
        predicated: bool,
    },
    /// End of batch
    BatchBufferEnd,
    /// WPARID predication on/off
    SetPredicate {
        /// Enable
        wparid: bool,
    },
    /// Register ← immediate
    LoadRegisterImm {
        /// Register
        register: u32,
        /// Value
        value: u32,
    },
    /// Register ← memory
    LoadRegisterMem {
        /// Register
        register: u32,
        /// Source
        address: GpuAddr,
    },
    /// Register ← register
    LoadRegisterReg {
        /// Source register
        source: u32,
        /// Destination register
        destination: u32,
    },
    /// Memory ← register
    StoreRegisterMem {
        /// Register
        register: u32,
        /// Destination
        address: GpuAddr,
    },
    /// Memory ← immediate
    StoreDataImm {
        /// Destination
        address: GpuAddr,
        /// Value
        value: u64,
        /// Store 8 bytes instead of 4
        qword: bool,
    },
    /// Poll memory until the comparison holds
    SemaphoreWait {
        /// Semaphore
        address: GpuAddr,
        /// Comparison value
        value: u32,
        /// Comparison
        op: CompareOp,
    },
    /// Atomic memory operation
    Atomic {
        /// Target
        address: GpuAddr,
        /// Operation
        opcode: AtomicOpcode,
        /// Operand
        operand: u32,
        /// Return the old value in GPR4
        return_data: bool,
    },
    /// Pipe control
    PipeControl {
        /// Flags
        flags: PipeControlFlags,
        /// Post-sync address
        address: GpuAddr,
        /// Immediate data
        data: u64,
    },
    /// Blitter flush
    FlushDw {
        /// Post-sync address
        address: GpuAddr,
        /// Post-sync operation
        post_sync: FlushPostSync,
    },
    /// Heap bases
    StateBaseAddress(HeapBases),
    /// Pipeline select
    PipelineSelect {
        /// Systolic mode
        systolic: Option<bool>,
        /// Media sampler DOP clock gate
        media_sampler_dop_clock_gate: Option<bool>,
    },
    /// Front end
    FrontEndState {
        /// Scratch base, possibly patched later
        scratch: GpuAddr,
        /// Max hardware threads
        max_threads: u32,
        /// Mode bits
        modes: FrontEndModes,
    },
    /// Compute mode
    StateComputeMode {
        /// Coherency
        coherency: Option<bool>,
        /// Large GRF
        large_grf: Option<bool>,
        /// Thread arbitration
        thread_arbitration: Option<ThreadArbitration>,
    },
    /// Preemption granularity
    Preemption(PreemptionMode),
    /// Compute walker
    ComputeWalker(WalkerArgs),
    /// Blitter copy
    MemCopy(BlitCopyArgs),
    /// Blitter fill
    MemSet(BlitFillArgs),
}

// =============================================================================
// ENCODER TRAIT
// =============================================================================

/// Family-specific command encoding capability
pub trait CommandEncoder: Send + Sync + fmt::Debug {
    /// Family encoded for
    fn family(&self) -> HwFamily;

    /// Encode `op` at the stream cursor, returning the bytes written
    fn encode(&self, op: &HwOp, stream: &mut LinearStream) -> Result<usize>;

    /// Exact size `encode` will write
    fn estimate_size(&self, op: &HwOp) -> usize;
}

// =============================================================================
// FAMILY ENCODER
// =============================================================================

/// Built-in encoder for the supported families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyEncoder {
    family: HwFamily,
    large_grf: bool,
    systolic: bool,
    partitioned_walkers: bool,
    unified_timestamps: bool,
}

impl FamilyEncoder {
    /// Encoder for a family
    pub const fn new(family: HwFamily) -> Self {
        match family {
            HwFamily::Gen12Lp => Self {
                family,
                large_grf: false,
                systolic: false,
                partitioned_walkers: false,
                unified_timestamps: false,
            },
            HwFamily::XeHpCore | HwFamily::XeHpcCore => Self {
                family,
                large_grf: true,
                systolic: true,
                partitioned_walkers: true,
                unified_timestamps: true,
            },
            HwFamily::XeHpgCore | HwFamily::Xe2HpgCore => Self {
                family,
                large_grf: true,
                systolic: true,
                partitioned_walkers: false,
                unified_timestamps: true,
            },
        }
    }

    /// Build the walker layout
    pub fn walker(&self, args: &WalkerArgs) -> Result<ComputeWalker> {
        if args.workload_partition_enable && !self.partitioned_walkers {
            return Err(Error::NotSupported);
        }
        if args.post_sync.op == PostSyncOp::Timestamp && !self.unified_timestamps {
            return Err(Error::NotSupported);
        }

        let mut walker = ComputeWalker::zeroed();
        walker.header = ComputeWalker::header_with(0);
        walker.indirect_data_start = args.indirect_data_start;
        walker.indirect_data_length = args.indirect_data_length;
        walker.group_start = [args.group_start.x, args.group_start.y, args.group_start.z];
        walker.group_count = [args.group_count.x, args.group_count.y, args.group_count.z];
        walker.simd_size = args.simd_size;
        walker.threads_per_group = args.threads_per_group;
        walker.kernel_start_lo = args.kernel_start.low();
        walker.kernel_start_hi = args.kernel_start.high();
        walker.slm_size = args.slm_size;
        walker.barrier_count = args.barrier_count;
        walker.set_partitioning(
            args.partition_type,
            args.workload_partition_enable,
            args.partition_size,
        );
        walker.set_post_sync(
            args.post_sync.op,
            args.post_sync.address,
            args.post_sync.data,
            args.post_sync.dc_flush,
        );
        Ok(walker)
    }

    fn compute_mode(
        &self,
        coherency: Option<bool>,
        large_grf: Option<bool>,
        thread_arbitration: Option<ThreadArbitration>,
    ) -> StateComputeMode {
        let mut mask = 0;
        let mut value = 0;
        if let Some(enable) = coherency {
            mask |= StateComputeMode::COHERENCY;
            value |= if enable { StateComputeMode::COHERENCY } else { 0 };
        }
        if let Some(enable) = large_grf.filter(|_| self.large_grf) {
            mask |= StateComputeMode::LARGE_GRF;
            value |= if enable { StateComputeMode::LARGE_GRF } else { 0 };
        }
        if let Some(policy) = thread_arbitration {
            mask |= StateComputeMode::THREAD_ARBITRATION_MASK;
            value |= (policy as u32) << StateComputeMode::THREAD_ARBITRATION_SHIFT;
        }
        StateComputeMode::new(mask, value)
    }
}

fn blit_copy(args: &BlitCopyArgs) -> MemCopy {
    MemCopy {
        header: MemCopy::header_with(0),
        width: args.width,
        height: args.height,
        src_pitch: args.src_pitch,
        dst_pitch: args.dst_pitch,
        src_lo: args.src.low(),
        src_hi: args.src.high(),
        dst_lo: args.dst.low(),
        dst_hi: args.dst.high(),
        src_mocs: 0,
        dst_mocs: 0,
        reserved: 0,
    }
}

fn blit_fill(args: &BlitFillArgs) -> MemSet {
    let mut pattern = [0u32; 4];
    for (dword, chunk) in pattern.iter_mut().zip(args.pattern.chunks_exact(4)) {
        *dword = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    MemSet {
        header: MemSet::header_with(0),
        pattern_size: args.pattern_size,
        width: args.width,
        height: args.height,
        pitch: args.pitch,
        dst_lo: args.dst.low(),
        dst_hi: args.dst.high(),
        pattern,
        mocs: 0,
    }
}

impl CommandEncoder for FamilyEncoder {
    fn family(&self) -> HwFamily {
        self.family
    }

    fn encode(&self, op: &HwOp, stream: &mut LinearStream) -> Result<usize> {
        let before = stream.used();
        match *op {
            HwOp::Noop { dwords } => {
                stream.get_space(dwords as usize * 4)?;
            }
            HwOp::BatchBufferStart {
                target,
                second_level,
                predicated,
            } => {
                stream.write(&BatchBufferStart::new(target, second_level, predicated))?;
            }
            HwOp::BatchBufferEnd => {
                stream.write(&BatchBufferEnd::new())?;
            }
            HwOp::SetPredicate { wparid } => {
                stream.write(&SetPredicate::new(wparid))?;
            }
            HwOp::LoadRegisterImm { register, value } => {
                stream.write(&LoadRegisterImm::new(register, value))?;
            }
            HwOp::LoadRegisterMem { register, address } => {
                stream.write(&LoadRegisterMem::new(register, address))?;
            }
            HwOp::LoadRegisterReg {
                source,
                destination,
            } => {
                stream.write(&LoadRegisterReg::new(source, destination))?;
            }
            HwOp::StoreRegisterMem { register, address } => {
                stream.write(&StoreRegisterMem::new(register, address))?;
            }
            HwOp::StoreDataImm {
                address,
                value,
                qword,
            } => {
                if !address.is_aligned(if qword { 8 } else { 4 }) {
                    return Err(Error::MisalignedAddress);
                }
                stream.write(&StoreDataImm::new(address, value, qword))?;
            }
            HwOp::SemaphoreWait { address, value, op } => {
                stream.write(&SemaphoreWait::new(address, value, op))?;
            }
            HwOp::Atomic {
                address,
                opcode,
                operand,
                return_data,
            } => {
                stream.write(&Atomic::new(address, opcode, operand, return_data))?;
            }
            HwOp::PipeControl {
                flags,
                address,
                data,
            } => {
                stream.write(&PipeControl::new(flags, address, data))?;
            }
            HwOp::FlushDw { address, post_sync } => {
                stream.write(&FlushDw::new(address, post_sync))?;
            }
            HwOp::StateBaseAddress(ref heaps) => {
                stream.write(&StateBaseAddress::new(heaps))?;
            }
            HwOp::PipelineSelect {
                systolic,
                media_sampler_dop_clock_gate,
            } => {
                let systolic = systolic.filter(|_| self.systolic);
                stream.write(&PipelineSelect::new(systolic, media_sampler_dop_clock_gate))?;
            }
            HwOp::FrontEndState {
                scratch,
                max_threads,
                modes,
            } => {
                stream.write(&FrontEndState::new(scratch, max_threads, modes.bits()))?;
            }
            HwOp::StateComputeMode {
                coherency,
                large_grf,
                thread_arbitration,
            } => {
                stream.write(&self.compute_mode(coherency, large_grf, thread_arbitration))?;
            }
            HwOp::Preemption(mode) => {
                stream.write(&LoadRegisterImm::new(
                    regs::CS_CHICKEN1,
                    regs::preemption_value(mode),
                ))?;
            }
            HwOp::ComputeWalker(ref args) => {
                let walker = self.walker(args)?;
                stream.write(&walker)?;
            }
            HwOp::MemCopy(ref args) => {
                if args.width == 0
                    || args.width > MemCopy::MAX_WIDTH
                    || args.height > MemCopy::MAX_HEIGHT
                {
                    return Err(Error::InvalidArgument);
                }
                stream.write(&blit_copy(args))?;
            }
            HwOp::MemSet(ref args) => {
                if !matches!(args.pattern_size, 1 | 2 | 4 | 8 | 16) {
                    return Err(Error::InvalidArgument);
                }
                stream.write(&blit_fill(args))?;
            }
        }
        Ok(stream.used() - before)
    }

    fn estimate_size(&self, op: &HwOp) -> usize {
        match op {
            HwOp::Noop { dwords } => *dwords as usize * 4,
            HwOp::BatchBufferStart { .. } => BatchBufferStart::SIZE,
            HwOp::BatchBufferEnd => BatchBufferEnd::SIZE,
            HwOp::SetPredicate { .. } => SetPredicate::SIZE,
            HwOp::LoadRegisterImm { .. } | HwOp::Preemption(_) => LoadRegisterImm::SIZE,
            HwOp::LoadRegisterMem { .. } => LoadRegisterMem::SIZE,
            HwOp::LoadRegisterReg { .. } => LoadRegisterReg::SIZE,
            HwOp::StoreRegisterMem { .. } => StoreRegisterMem::SIZE,
            HwOp::StoreDataImm { .. } => StoreDataImm::SIZE,
            HwOp::SemaphoreWait { .. } => SemaphoreWait::SIZE,
            HwOp::Atomic { .. } => Atomic::SIZE,
            HwOp::PipeControl { .. } => PipeControl::SIZE,
            HwOp::FlushDw { .. } => FlushDw::SIZE,
            HwOp::StateBaseAddress(_) => StateBaseAddress::SIZE,
            HwOp::PipelineSelect { .. } => PipelineSelect::SIZE,
            HwOp::FrontEndState { .. } => FrontEndState::SIZE,
            HwOp::StateComputeMode { .. } => StateComputeMode::SIZE,
            HwOp::ComputeWalker(_) => ComputeWalker::SIZE,
            HwOp::MemCopy(_) => MemCopy::SIZE,
            HwOp::MemSet(_) => MemSet::SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{decode, Command};
    use ember_core::AllocationId;

    fn stream() -> LinearStream {
        LinearStream::with_capacity(AllocationId::new(1), GpuAddr::new(0x4000), 1024)
    }

    #[test]
    fn test_estimate_matches_encode() {
        let encoder = FamilyEncoder::new(HwFamily::XeHpCore);
        let ops = [
            HwOp::Noop { dwords: 3 },
            HwOp::BatchBufferEnd,
            HwOp::Preemption(PreemptionMode::ThreadGroup),
            HwOp::PipeControl {
                flags: PipeControlFlags::BARRIER,
                address: GpuAddr::null(),
                data: 0,
            },
            HwOp::StateBaseAddress(HeapBases::default()),
            HwOp::ComputeWalker(WalkerArgs {
                group_count: GroupCount::linear(4),
                ..Default::default()
            }),
        ];
        for op in &ops {
            let mut s = stream();
            assert_eq!(encoder.encode(op, &mut s), Ok(encoder.estimate_size(op)));
        }
    }

    #[test]
    fn test_gen12_rejects_partitioned_walker() {
        let encoder = FamilyEncoder::new(HwFamily::Gen12Lp);
        let op = HwOp::ComputeWalker(WalkerArgs {
            workload_partition_enable: true,
            partition_type: PartitionType::X,
            ..Default::default()
        });
        assert_eq!(encoder.encode(&op, &mut stream()), Err(Error::NotSupported));
    }

    #[test]
    fn test_gen12_masks_large_grf() {
        let op = HwOp::StateComputeMode {
            coherency: None,
            large_grf: Some(true),
            thread_arbitration: None,
        };
        let mut s = stream();
        let _ = FamilyEncoder::new(HwFamily::Gen12Lp).encode(&op, &mut s);
        let decoded = decode(s.as_bytes()).map(|(c, _)| c);
        assert!(matches!(decoded, Ok(Command::StateComputeMode(scm)) if scm.mask == 0));

        let mut s = stream();
        let _ = FamilyEncoder::new(HwFamily::XeHpgCore).encode(&op, &mut s);
        let decoded = decode(s.as_bytes()).map(|(c, _)| c);
        assert!(matches!(
            decoded,
            Ok(Command::StateComputeMode(scm)) if scm.value == StateComputeMode::LARGE_GRF
        ));
    }

    #[test]
    fn test_store_data_imm_alignment() {
        let encoder = FamilyEncoder::new(HwFamily::XeHpcCore);
        let op = HwOp::StoreDataImm {
            address: GpuAddr::new(0x1004),
            value: 0,
            qword: true,
        };
        assert_eq!(encoder.encode(&op, &mut stream()), Err(Error::MisalignedAddress));
    }
}
