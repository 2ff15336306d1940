//! # Hardware Command Layouts
//!
//! Bit-exact layouts of the command streamer instructions emitted by the
//! dispatch core.
//!
//! ## Header Format
//!
//! ```text
//!  31        24 23                   8 7            0
//! ┌────────────┬──────────────────────┬──────────────┐
//! │   opcode   │    command flags     │ dwords - 1   │
//! └────────────┴──────────────────────┴──────────────┘
//! ```
//!
//! An all-zero dword decodes as a one-dword `NOOP`. Every layout is a
//! `#[repr(C)]` run of little-endian dwords, so it can be written with
//! [`bytemuck::bytes_of`] and read back with [`bytemuck::pod_read_unaligned`].

// `derive(Pod, Zeroable)` expands to unsafe impls.
#![allow(unsafe_code)]

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use ember_core::{GpuAddr, PartitionType};

// =============================================================================
// OPCODES
// =============================================================================

/// Command opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    /// MI_NOOP
    Noop = 0x00,
    /// MI_SET_PREDICATE
    SetPredicate = 0x01,
    /// MI_BATCH_BUFFER_END
    BatchBufferEnd = 0x0A,
    /// MI_SEMAPHORE_WAIT
    SemaphoreWait = 0x1C,
    /// MI_STORE_DATA_IMM
    StoreDataImm = 0x20,
    /// MI_LOAD_REGISTER_IMM
    LoadRegisterImm = 0x22,
    /// MI_STORE_REGISTER_MEM
    StoreRegisterMem = 0x24,
    /// MI_FLUSH_DW
    FlushDw = 0x26,
    /// MI_LOAD_REGISTER_MEM
    LoadRegisterMem = 0x29,
    /// MI_LOAD_REGISTER_REG
    LoadRegisterReg = 0x2A,
    /// MI_ATOMIC
    Atomic = 0x2F,
    /// MI_BATCH_BUFFER_START
    BatchBufferStart = 0x31,
    /// STATE_COMPUTE_MODE
    StateComputeMode = 0x45,
    /// CFE_STATE
    FrontEndState = 0x55,
    /// MEM_COPY (blitter)
    MemCopy = 0x5A,
    /// MEM_SET (blitter)
    MemSet = 0x5B,
    /// STATE_BASE_ADDRESS
    StateBaseAddress = 0x61,
    /// PIPELINE_SELECT
    PipelineSelect = 0x69,
    /// COMPUTE_WALKER
    ComputeWalker = 0x72,
    /// PIPE_CONTROL
    PipeControl = 0x7A,
}

impl CommandKind {
    /// Decode an opcode byte
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => Self::Noop,
            0x01 => Self::SetPredicate,
            0x0A => Self::BatchBufferEnd,
            0x1C => Self::SemaphoreWait,
            0x20 => Self::StoreDataImm,
            0x22 => Self::LoadRegisterImm,
            0x24 => Self::StoreRegisterMem,
            0x26 => Self::FlushDw,
            0x29 => Self::LoadRegisterMem,
            0x2A => Self::LoadRegisterReg,
            0x2F => Self::Atomic,
            0x31 => Self::BatchBufferStart,
            0x45 => Self::StateComputeMode,
            0x55 => Self::FrontEndState,
            0x5A => Self::MemCopy,
            0x5B => Self::MemSet,
            0x61 => Self::StateBaseAddress,
            0x69 => Self::PipelineSelect,
            0x72 => Self::ComputeWalker,
            0x7A => Self::PipeControl,
            _ => return None,
        })
    }

    /// Whether the command may only run on the blitter
    pub const fn is_blitter(self) -> bool {
        matches!(self, Self::MemCopy | Self::MemSet)
    }
}

/// Build a command header
#[inline]
pub const fn header(kind: CommandKind, flags: u16, dwords: u32) -> u32 {
    ((kind as u32) << 24) | ((flags as u32) << 8) | ((dwords - 1) & 0xFF)
}

/// Opcode byte of a header
#[inline]
pub const fn header_opcode(header: u32) -> u8 {
    (header >> 24) as u8
}

/// Command flags of a header
#[inline]
pub const fn header_flags(header: u32) -> u16 {
    (header >> 8) as u16
}

/// Total dwords described by a header
#[inline]
pub const fn header_dwords(header: u32) -> u32 {
    (header & 0xFF) + 1
}

// =============================================================================
// REGISTERS
// =============================================================================

/// MMIO register offsets on the compute command streamer
pub mod regs {
    /// Work partition ID
    pub const WPARID: u32 = 0x221C;
    /// Per-tile address offset applied to post-sync writes
    pub const ADDRESS_OFFSET: u32 = 0x23B4;
    /// Predication mask over WPARID
    pub const PREDICATION_MASK: u32 = 0x21FC;
    /// General purpose register 0 (64-bit registers, 8 bytes apart)
    pub const GPR0: u32 = 0x2600;
    /// General purpose register 4, receives MI_ATOMIC return data
    pub const GPR4: u32 = GPR0 + 4 * 8;
    /// Preemption control
    pub const CS_CHICKEN1: u32 = 0x2580;
    /// Global GPU timestamp
    pub const GLOBAL_TIMESTAMP: u32 = 0x2358;
    /// Context timestamp
    pub const CONTEXT_TIMESTAMP: u32 = 0x23A8;

    /// Value of `CS_CHICKEN1` selecting a preemption granularity
    pub const fn preemption_value(mode: ember_core::PreemptionMode) -> u32 {
        use ember_core::PreemptionMode;
        const THREAD_GROUP: u32 = 1 << 1;
        const COMMAND_LEVEL: u32 = 1 << 2;
        const MASK: u32 = (THREAD_GROUP | COMMAND_LEVEL) << 16;
        let bits = match mode {
            PreemptionMode::MidThread => 0,
            PreemptionMode::ThreadGroup => THREAD_GROUP,
            PreemptionMode::MidBatch | PreemptionMode::Disabled => COMMAND_LEVEL,
        };
        MASK | bits
    }
}

// =============================================================================
// COMMAND TRAIT
// =============================================================================

/// A fixed-layout hardware command
pub trait HwCommand: Pod {
    /// Opcode
    const KIND: CommandKind;

    /// Size in dwords
    const DWORDS: u32 = (core::mem::size_of::<Self>() / 4) as u32;

    /// Size in bytes
    const SIZE: usize = core::mem::size_of::<Self>();

    /// Header carrying `flags`
    fn header_with(flags: u16) -> u32 {
        header(Self::KIND, flags, Self::DWORDS)
    }
}

macro_rules! hw_command {
    ($ty:ident, $kind:ident, $bytes:expr) => {
        impl HwCommand for $ty {
            const KIND: CommandKind = CommandKind::$kind;
        }
        const_assert_eq!(core::mem::size_of::<$ty>(), $bytes);
    };
}

// =============================================================================
// BATCH BUFFER CONTROL
// =============================================================================

/// MI_NOOP
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Noop {
    /// Header (zero)
    pub header: u32,
}

hw_command!(Noop, Noop, 4);

/// MI_BATCH_BUFFER_END
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BatchBufferEnd {
    /// Header
    pub header: u32,
}

hw_command!(BatchBufferEnd, BatchBufferEnd, 4);

impl BatchBufferEnd {
    /// Encode
    pub fn new() -> Self {
        Self {
            header: Self::header_with(0),
        }
    }
}

/// MI_BATCH_BUFFER_START
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BatchBufferStart {
    /// Header
    pub header: u32,
    /// Target address, low
    pub address_lo: u32,
    /// Target address, high
    pub address_hi: u32,
}

hw_command!(BatchBufferStart, BatchBufferStart, 12);

impl BatchBufferStart {
    const SECOND_LEVEL: u16 = 1 << 0;
    const PREDICATED: u16 = 1 << 1;

    /// Encode a jump
    pub fn new(target: GpuAddr, second_level: bool, predicated: bool) -> Self {
        let mut flags = 0;
        if second_level {
            flags |= Self::SECOND_LEVEL;
        }
        if predicated {
            flags |= Self::PREDICATED;
        }
        Self {
            header: Self::header_with(flags),
            address_lo: target.low(),
            address_hi: target.high(),
        }
    }

    /// Jump target
    pub fn target(&self) -> GpuAddr {
        GpuAddr::from_parts(self.address_lo, self.address_hi)
    }

    /// Whether this is a call that returns on BATCH_BUFFER_END
    pub fn is_second_level(&self) -> bool {
        header_flags(self.header) & Self::SECOND_LEVEL != 0
    }

    /// Whether the jump is predicated
    pub fn is_predicated(&self) -> bool {
        header_flags(self.header) & Self::PREDICATED != 0
    }
}

/// MI_SET_PREDICATE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SetPredicate {
    /// Header; flag bit 0 enables NOOP-on-non-zero-WPARID
    pub header: u32,
}

hw_command!(SetPredicate, SetPredicate, 4);

impl SetPredicate {
    /// Encode
    pub fn new(wparid_enable: bool) -> Self {
        Self {
            header: Self::header_with(wparid_enable as u16),
        }
    }

    /// Whether WPARID predication is enabled
    pub fn is_enabled(&self) -> bool {
        header_flags(self.header) & 1 != 0
    }
}

// =============================================================================
// REGISTER ACCESS
// =============================================================================

/// MI_LOAD_REGISTER_IMM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct LoadRegisterImm {
    /// Header
    pub header: u32,
    /// Register offset
    pub register: u32,
    /// Value
    pub value: u32,
}

hw_command!(LoadRegisterImm, LoadRegisterImm, 12);

impl LoadRegisterImm {
    /// Encode
    pub fn new(register: u32, value: u32) -> Self {
        Self {
            header: Self::header_with(0),
            register,
            value,
        }
    }
}

/// MI_LOAD_REGISTER_MEM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct LoadRegisterMem {
    /// Header
    pub header: u32,
    /// Register offset
    pub register: u32,
    /// Source address, low
    pub address_lo: u32,
    /// Source address, high
    pub address_hi: u32,
}

hw_command!(LoadRegisterMem, LoadRegisterMem, 16);

impl LoadRegisterMem {
    /// Encode
    pub fn new(register: u32, address: GpuAddr) -> Self {
        Self {
            header: Self::header_with(0),
            register,
            address_lo: address.low(),
            address_hi: address.high(),
        }
    }

    /// Source address
    pub fn address(&self) -> GpuAddr {
        GpuAddr::from_parts(self.address_lo, self.address_hi)
    }
}

/// MI_LOAD_REGISTER_REG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct LoadRegisterReg {
    /// Header
    pub header: u32,
    /// Source register
    pub source: u32,
    /// Destination register
    pub destination: u32,
}

hw_command!(LoadRegisterReg, LoadRegisterReg, 12);

impl LoadRegisterReg {
    /// Encode
    pub fn new(source: u32, destination: u32) -> Self {
        Self {
            header: Self::header_with(0),
            source,
            destination,
        }
    }
}

/// MI_STORE_REGISTER_MEM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StoreRegisterMem {
    /// Header
    pub header: u32,
    /// Register offset
    pub register: u32,
    /// Destination address, low
    pub address_lo: u32,
    /// Destination address, high
    pub address_hi: u32,
}

hw_command!(StoreRegisterMem, StoreRegisterMem, 16);

impl StoreRegisterMem {
    /// Encode
    pub fn new(register: u32, address: GpuAddr) -> Self {
        Self {
            header: Self::header_with(0),
            register,
            address_lo: address.low(),
            address_hi: address.high(),
        }
    }

    /// Destination address
    pub fn address(&self) -> GpuAddr {
        GpuAddr::from_parts(self.address_lo, self.address_hi)
    }
}

// =============================================================================
// MEMORY SYNCHRONIZATION
// =============================================================================

/// Semaphore comparison, `memory <op> value`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CompareOp {
    /// `>`
    GreaterThan = 0,
    /// `>=`
    GreaterOrEqual = 1,
    /// `<`
    LessThan = 2,
    /// `<=`
    LessOrEqual = 3,
    /// `==`
    Equal = 4,
    /// `!=`
    NotEqual = 5,
}

impl CompareOp {
    /// Decode the header field
    pub const fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => Self::GreaterThan,
            1 => Self::GreaterOrEqual,
            2 => Self::LessThan,
            3 => Self::LessOrEqual,
            4 => Self::Equal,
            5 => Self::NotEqual,
            _ => return None,
        })
    }

    /// Evaluate against a memory value
    pub const fn evaluate(self, memory: u32, value: u32) -> bool {
        match self {
            Self::GreaterThan => memory > value,
            Self::GreaterOrEqual => memory >= value,
            Self::LessThan => memory < value,
            Self::LessOrEqual => memory <= value,
            Self::Equal => memory == value,
            Self::NotEqual => memory != value,
        }
    }
}

/// MI_SEMAPHORE_WAIT (polling mode)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SemaphoreWait {
    /// Header; flags carry the compare operation
    pub header: u32,
    /// Comparison value
    pub value: u32,
    /// Semaphore address, low
    pub address_lo: u32,
    /// Semaphore address, high
    pub address_hi: u32,
}

hw_command!(SemaphoreWait, SemaphoreWait, 16);

impl SemaphoreWait {
    /// Encode
    pub fn new(address: GpuAddr, value: u32, op: CompareOp) -> Self {
        Self {
            header: Self::header_with(op as u16),
            value,
            address_lo: address.low(),
            address_hi: address.high(),
        }
    }

    /// Semaphore address
    pub fn address(&self) -> GpuAddr {
        GpuAddr::from_parts(self.address_lo, self.address_hi)
    }

    /// Compare operation
    pub fn compare_op(&self) -> Option<CompareOp> {
        CompareOp::from_raw(header_flags(self.header) & 0x7)
    }
}

/// MI_ATOMIC dword opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AtomicOpcode {
    /// Store the operand
    Move = 0x04,
    /// Increment by one
    Increment = 0x05,
    /// Decrement by one
    Decrement = 0x06,
}

/// MI_ATOMIC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Atomic {
    /// Header; flags carry opcode (bits 0..8) and return-data (bit 8)
    pub header: u32,
    /// Target address, low
    pub address_lo: u32,
    /// Target address, high
    pub address_hi: u32,
    /// Operand for `Move`
    pub operand: u32,
}

hw_command!(Atomic, Atomic, 16);

impl Atomic {
    const RETURN_DATA: u16 = 1 << 8;

    /// Encode; with `return_data` the pre-op value lands in GPR4
    pub fn new(address: GpuAddr, opcode: AtomicOpcode, operand: u32, return_data: bool) -> Self {
        let mut flags = opcode as u16;
        if return_data {
            flags |= Self::RETURN_DATA;
        }
        Self {
            header: Self::header_with(flags),
            address_lo: address.low(),
            address_hi: address.high(),
            operand,
        }
    }

    /// Target address
    pub fn address(&self) -> GpuAddr {
        GpuAddr::from_parts(self.address_lo, self.address_hi)
    }

    /// Opcode
    pub fn opcode(&self) -> Option<AtomicOpcode> {
        match header_flags(self.header) & 0xFF {
            0x04 => Some(AtomicOpcode::Move),
            0x05 => Some(AtomicOpcode::Increment),
            0x06 => Some(AtomicOpcode::Decrement),
            _ => None,
        }
    }

    /// Whether the pre-op value is returned
    pub fn returns_data(&self) -> bool {
        header_flags(self.header) & Self::RETURN_DATA != 0
    }
}

/// MI_STORE_DATA_IMM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StoreDataImm {
    /// Header; flag bit 0 selects a qword store
    pub header: u32,
    /// Address, low
    pub address_lo: u32,
    /// Address, high
    pub address_hi: u32,
    /// Data, low
    pub data_lo: u32,
    /// Data, high
    pub data_hi: u32,
}

hw_command!(StoreDataImm, StoreDataImm, 20);

impl StoreDataImm {
    /// Encode
    pub fn new(address: GpuAddr, value: u64, qword: bool) -> Self {
        Self {
            header: Self::header_with(qword as u16),
            address_lo: address.low(),
            address_hi: address.high(),
            data_lo: value as u32,
            data_hi: if qword { (value >> 32) as u32 } else { 0 },
        }
    }

    /// Destination address
    pub fn address(&self) -> GpuAddr {
        GpuAddr::from_parts(self.address_lo, self.address_hi)
    }

    /// Whether a qword is stored
    pub fn is_qword(&self) -> bool {
        header_flags(self.header) & 1 != 0
    }

    /// Stored value
    pub fn value(&self) -> u64 {
        ((self.data_hi as u64) << 32) | self.data_lo as u64
    }
}

bitflags::bitflags! {
    /// PIPE_CONTROL flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipeControlFlags: u32 {
        /// Stall the command streamer until prior work completes
        const CS_STALL = 1 << 0;
        /// Flush the data cache (L3)
        const DC_FLUSH = 1 << 1;
        /// Flush the HDC pipeline
        const HDC_PIPELINE_FLUSH = 1 << 2;
        /// Flush the untyped data port cache
        const UNTYPED_DATA_PORT_FLUSH = 1 << 3;
        /// Invalidate texture cache
        const TEXTURE_INVALIDATE = 1 << 4;
        /// Invalidate constant cache
        const CONSTANT_INVALIDATE = 1 << 5;
        /// Invalidate state cache
        const STATE_INVALIDATE = 1 << 6;
        /// Invalidate instruction cache
        const INSTRUCTION_INVALIDATE = 1 << 7;
        /// Flush render target cache
        const RENDER_TARGET_FLUSH = 1 << 8;
        /// Invalidate the TLBs
        const TLB_INVALIDATE = 1 << 9;
        /// Add `ADDRESS_OFFSET × tile` to the post-sync address
        const WORKLOAD_PARTITION_ID_OFFSET = 1 << 10;
        /// Post-sync: write the immediate data
        const POST_SYNC_WRITE_IMMEDIATE = 1 << 14;
        /// Post-sync: write the global timestamp
        const POST_SYNC_TIMESTAMP = 1 << 15;
    }
}

impl PipeControlFlags {
    /// Flags of a barrier that makes prior results visible to later commands
    pub const BARRIER: Self = Self::CS_STALL
        .union(Self::DC_FLUSH)
        .union(Self::HDC_PIPELINE_FLUSH)
        .union(Self::UNTYPED_DATA_PORT_FLUSH);

    /// Flags that force state cache invalidation before new heap bases
    pub const STATE_INVALIDATION: Self = Self::CS_STALL
        .union(Self::TEXTURE_INVALIDATE)
        .union(Self::CONSTANT_INVALIDATE)
        .union(Self::STATE_INVALIDATE)
        .union(Self::INSTRUCTION_INVALIDATE);

    /// Whether any post-sync operation is requested
    pub fn has_post_sync(self) -> bool {
        self.intersects(Self::POST_SYNC_WRITE_IMMEDIATE | Self::POST_SYNC_TIMESTAMP)
    }
}

/// PIPE_CONTROL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PipeControl {
    /// Header
    pub header: u32,
    /// [`PipeControlFlags`]
    pub flags: u32,
    /// Post-sync address, low
    pub address_lo: u32,
    /// Post-sync address, high
    pub address_hi: u32,
    /// Immediate data, low
    pub data_lo: u32,
    /// Immediate data, high
    pub data_hi: u32,
}

hw_command!(PipeControl, PipeControl, 24);

impl PipeControl {
    /// Encode
    pub fn new(flags: PipeControlFlags, address: GpuAddr, data: u64) -> Self {
        Self {
            header: Self::header_with(0),
            flags: flags.bits(),
            address_lo: address.low(),
            address_hi: address.high(),
            data_lo: data as u32,
            data_hi: (data >> 32) as u32,
        }
    }

    /// Decoded flags
    pub fn flags(&self) -> PipeControlFlags {
        PipeControlFlags::from_bits_truncate(self.flags)
    }

    /// Post-sync address
    pub fn address(&self) -> GpuAddr {
        GpuAddr::from_parts(self.address_lo, self.address_hi)
    }

    /// Immediate data
    pub fn data(&self) -> u64 {
        ((self.data_hi as u64) << 32) | self.data_lo as u64
    }
}

/// MI_FLUSH_DW (blitter flush with optional post-sync write)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FlushDw {
    /// Header; flag bit 0 enables the immediate write, bit 1 the timestamp
    pub header: u32,
    /// Address, low
    pub address_lo: u32,
    /// Address, high
    pub address_hi: u32,
    /// Data, low
    pub data_lo: u32,
    /// Data, high
    pub data_hi: u32,
}

hw_command!(FlushDw, FlushDw, 20);

/// Post-sync operation of a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushPostSync {
    /// Flush only
    None,
    /// Write an immediate qword
    WriteImmediate(u64),
    /// Write the global timestamp
    Timestamp,
}

impl FlushDw {
    /// Encode
    pub fn new(address: GpuAddr, post_sync: FlushPostSync) -> Self {
        let (flags, data) = match post_sync {
            FlushPostSync::None => (0, 0),
            FlushPostSync::WriteImmediate(value) => (1, value),
            FlushPostSync::Timestamp => (2, 0),
        };
        Self {
            header: Self::header_with(flags),
            address_lo: address.low(),
            address_hi: address.high(),
            data_lo: data as u32,
            data_hi: (data >> 32) as u32,
        }
    }

    /// Post-sync address
    pub fn address(&self) -> GpuAddr {
        GpuAddr::from_parts(self.address_lo, self.address_hi)
    }

    /// Decoded post-sync
    pub fn post_sync(&self) -> FlushPostSync {
        match header_flags(self.header) & 0x3 {
            1 => FlushPostSync::WriteImmediate(((self.data_hi as u64) << 32) | self.data_lo as u64),
            2 => FlushPostSync::Timestamp,
            _ => FlushPostSync::None,
        }
    }
}

// =============================================================================
// STATE COMMANDS
// =============================================================================

/// STATE_BASE_ADDRESS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StateBaseAddress {
    /// Header
    pub header: u32,
    /// Stateless MOCS
    pub stateless_mocs: u32,
    /// General state base, low/high
    pub general_state: [u32; 2],
    /// Surface state base, low/high
    pub surface_state: [u32; 2],
    /// Dynamic state base, low/high
    pub dynamic_state: [u32; 2],
    /// Indirect object base, low/high
    pub indirect_object: [u32; 2],
    /// Bindless surface state base, low/high
    pub bindless_surface: [u32; 2],
    /// Bindless surface state size in entries
    pub bindless_size: u32,
    /// Reserved
    pub reserved: u32,
}

hw_command!(StateBaseAddress, StateBaseAddress, 56);

fn split(value: u64) -> [u32; 2] {
    [value as u32, (value >> 32) as u32]
}

fn join(parts: [u32; 2]) -> u64 {
    ((parts[1] as u64) << 32) | parts[0] as u64
}

impl StateBaseAddress {
    /// Encode
    pub fn new(heaps: &ember_core::stream_state::HeapBases) -> Self {
        Self {
            header: Self::header_with(0),
            stateless_mocs: heaps.stateless_mocs,
            general_state: split(heaps.general_state),
            surface_state: split(heaps.surface_state),
            dynamic_state: split(heaps.dynamic_state),
            indirect_object: split(heaps.indirect_object),
            bindless_surface: split(heaps.bindless_surface),
            bindless_size: 0,
            reserved: 0,
        }
    }

    /// Decode the heap bases
    pub fn heaps(&self) -> ember_core::stream_state::HeapBases {
        ember_core::stream_state::HeapBases {
            general_state: join(self.general_state),
            surface_state: join(self.surface_state),
            dynamic_state: join(self.dynamic_state),
            indirect_object: join(self.indirect_object),
            bindless_surface: join(self.bindless_surface),
            stateless_mocs: self.stateless_mocs,
        }
    }
}

/// PIPELINE_SELECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PipelineSelect {
    /// Header; flags carry pipeline and mode bits
    pub header: u32,
}

hw_command!(PipelineSelect, PipelineSelect, 4);

impl PipelineSelect {
    const GPGPU: u16 = 0x2;
    const MEDIA_SAMPLER_DOP_CLOCK_GATE: u16 = 1 << 4;
    const SYSTOLIC: u16 = 1 << 5;
    const MASK_SHIFT: u16 = 8;

    /// Encode; `None` leaves the bit masked off
    pub fn new(systolic: Option<bool>, media_sampler_dop_clock_gate: Option<bool>) -> Self {
        let mut flags = Self::GPGPU | (0x3 << Self::MASK_SHIFT);
        if let Some(enable) = systolic {
            flags |= Self::SYSTOLIC << Self::MASK_SHIFT;
            if enable {
                flags |= Self::SYSTOLIC;
            }
        }
        if let Some(enable) = media_sampler_dop_clock_gate {
            flags |= Self::MEDIA_SAMPLER_DOP_CLOCK_GATE << Self::MASK_SHIFT;
            if enable {
                flags |= Self::MEDIA_SAMPLER_DOP_CLOCK_GATE;
            }
        }
        Self {
            header: Self::header_with(flags),
        }
    }

    /// Programmed systolic mode
    pub fn systolic(&self) -> Option<bool> {
        let flags = header_flags(self.header);
        (flags & (Self::SYSTOLIC << Self::MASK_SHIFT) != 0).then_some(flags & Self::SYSTOLIC != 0)
    }
}

/// CFE_STATE (compute front end)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FrontEndState {
    /// Header
    pub header: u32,
    /// Scratch space base, low
    pub scratch_lo: u32,
    /// Scratch space base, high
    pub scratch_hi: u32,
    /// Maximum hardware threads
    pub max_threads: u32,
    /// [`FrontEndState`] mode bits
    pub modes: u32,
}

hw_command!(FrontEndState, FrontEndState, 20);

impl FrontEndState {
    /// Compute dispatch all walker
    pub const COMPUTE_DISPATCH_ALL_WALKER: u32 = 1 << 0;
    /// Disable EU fusion
    pub const DISABLE_EU_FUSION: u32 = 1 << 1;
    /// Disable overdispatch
    pub const DISABLE_OVERDISPATCH: u32 = 1 << 2;
    /// Single slice dispatch on CCS
    pub const SINGLE_SLICE_DISPATCH_CCS: u32 = 1 << 3;

    /// Encode
    pub fn new(scratch: GpuAddr, max_threads: u32, modes: u32) -> Self {
        Self {
            header: Self::header_with(0),
            scratch_lo: scratch.low(),
            scratch_hi: scratch.high(),
            max_threads,
            modes,
        }
    }

    /// Byte offset of the scratch address within the command
    pub const SCRATCH_OFFSET: usize = 4;

    /// Scratch space base
    pub fn scratch(&self) -> GpuAddr {
        GpuAddr::from_parts(self.scratch_lo, self.scratch_hi)
    }
}

/// STATE_COMPUTE_MODE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StateComputeMode {
    /// Header
    pub header: u32,
    /// Which value bits are programmed
    pub mask: u32,
    /// Values
    pub value: u32,
}

hw_command!(StateComputeMode, StateComputeMode, 12);

impl StateComputeMode {
    /// Pixel/compute coherency
    pub const COHERENCY: u32 = 1 << 0;
    /// Large GRF
    pub const LARGE_GRF: u32 = 1 << 1;
    /// Thread arbitration policy (two bits)
    pub const THREAD_ARBITRATION_SHIFT: u32 = 2;
    /// Thread arbitration field mask
    pub const THREAD_ARBITRATION_MASK: u32 = 0x3 << 2;

    /// Encode
    pub fn new(mask: u32, value: u32) -> Self {
        Self {
            header: Self::header_with(0),
            mask,
            value: value & mask,
        }
    }
}

// =============================================================================
// COMPUTE WALKER
// =============================================================================

/// Walker post-sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum PostSyncOp {
    /// No write
    #[default]
    None = 0,
    /// Write immediate data
    WriteImmediate = 1,
    /// Write a full timestamp packet
    Timestamp = 3,
}

impl PostSyncOp {
    /// Decode
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::WriteImmediate,
            3 => Self::Timestamp,
            _ => Self::None,
        }
    }
}

/// COMPUTE_WALKER
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ComputeWalker {
    /// Header
    pub header: u32,
    /// Indirect data length in bytes
    pub indirect_data_length: u32,
    /// Indirect data offset from the indirect object base
    pub indirect_data_start: u32,
    /// Partition type (bits 0..2) and workload partition enable (bit 2)
    pub partition_control: u32,
    /// Work-groups per partition
    pub partition_size: u32,
    /// Starting group ID
    pub group_start: [u32; 3],
    /// Group count
    pub group_count: [u32; 3],
    /// SIMD width
    pub simd_size: u32,
    /// Threads per group
    pub threads_per_group: u32,
    /// Kernel start address, low
    pub kernel_start_lo: u32,
    /// Kernel start address, high
    pub kernel_start_hi: u32,
    /// Shared local memory size
    pub slm_size: u32,
    /// Barrier count
    pub barrier_count: u32,
    /// Post-sync operation (bits 0..2) and DC flush (bit 2)
    pub post_sync_control: u32,
    /// Post-sync address, low
    pub post_sync_address_lo: u32,
    /// Post-sync address, high
    pub post_sync_address_hi: u32,
    /// Post-sync data, low
    pub post_sync_data_lo: u32,
    /// Post-sync data, high
    pub post_sync_data_hi: u32,
    /// Reserved
    pub reserved: u32,
}

hw_command!(ComputeWalker, ComputeWalker, 92);

impl ComputeWalker {
    const WORKLOAD_PARTITION_ENABLE: u32 = 1 << 2;
    const POST_SYNC_DC_FLUSH: u32 = 1 << 2;

    /// Partition axis
    pub fn partition_type(&self) -> PartitionType {
        PartitionType::from_raw(self.partition_control & 0x3)
    }

    /// Whether the walker is split into partitions
    pub fn workload_partition_enabled(&self) -> bool {
        self.partition_control & Self::WORKLOAD_PARTITION_ENABLE != 0
    }

    /// Set partitioning fields
    pub fn set_partitioning(&mut self, ty: PartitionType, enable: bool, size: u32) {
        self.partition_control = ty as u32 | if enable { Self::WORKLOAD_PARTITION_ENABLE } else { 0 };
        self.partition_size = size;
    }

    /// Post-sync operation
    pub fn post_sync_op(&self) -> PostSyncOp {
        PostSyncOp::from_raw(self.post_sync_control & 0x3)
    }

    /// Whether the post-sync flushes the data cache
    pub fn post_sync_dc_flush(&self) -> bool {
        self.post_sync_control & Self::POST_SYNC_DC_FLUSH != 0
    }

    /// Post-sync address
    pub fn post_sync_address(&self) -> GpuAddr {
        GpuAddr::from_parts(self.post_sync_address_lo, self.post_sync_address_hi)
    }

    /// Set post-sync fields
    pub fn set_post_sync(&mut self, op: PostSyncOp, address: GpuAddr, data: u64, dc_flush: bool) {
        self.post_sync_control = op as u32 | if dc_flush { Self::POST_SYNC_DC_FLUSH } else { 0 };
        self.post_sync_address_lo = address.low();
        self.post_sync_address_hi = address.high();
        self.post_sync_data_lo = data as u32;
        self.post_sync_data_hi = (data >> 32) as u32;
    }

    /// Kernel start address
    pub fn kernel_start(&self) -> GpuAddr {
        GpuAddr::from_parts(self.kernel_start_lo, self.kernel_start_hi)
    }
}

// =============================================================================
// BLITTER
// =============================================================================

/// MEM_COPY (linear or 2D byte copy)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MemCopy {
    /// Header
    pub header: u32,
    /// Width in bytes
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Source pitch
    pub src_pitch: u32,
    /// Destination pitch
    pub dst_pitch: u32,
    /// Source address, low
    pub src_lo: u32,
    /// Source address, high
    pub src_hi: u32,
    /// Destination address, low
    pub dst_lo: u32,
    /// Destination address, high
    pub dst_hi: u32,
    /// Source MOCS
    pub src_mocs: u32,
    /// Destination MOCS
    pub dst_mocs: u32,
    /// Reserved
    pub reserved: u32,
}

hw_command!(MemCopy, MemCopy, 48);

impl MemCopy {
    /// Largest width of one blit
    pub const MAX_WIDTH: u32 = 1 << 24;
    /// Largest height of one blit
    pub const MAX_HEIGHT: u32 = 1 << 18;

    /// Source address
    pub fn src(&self) -> GpuAddr {
        GpuAddr::from_parts(self.src_lo, self.src_hi)
    }

    /// Destination address
    pub fn dst(&self) -> GpuAddr {
        GpuAddr::from_parts(self.dst_lo, self.dst_hi)
    }
}

/// MEM_SET (pattern fill of up to 16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MemSet {
    /// Header
    pub header: u32,
    /// Pattern size in bytes
    pub pattern_size: u32,
    /// Width in bytes
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Destination pitch
    pub pitch: u32,
    /// Destination address, low
    pub dst_lo: u32,
    /// Destination address, high
    pub dst_hi: u32,
    /// Pattern, little-endian
    pub pattern: [u32; 4],
    /// Destination MOCS
    pub mocs: u32,
}

hw_command!(MemSet, MemSet, 48);

impl MemSet {
    /// Destination address
    pub fn dst(&self) -> GpuAddr {
        GpuAddr::from_parts(self.dst_lo, self.dst_hi)
    }
}

// =============================================================================
// TIMESTAMP PACKET
// =============================================================================

/// Kernel timestamp packet as written by a timestamp post-sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct TimestampPacket {
    /// Context timestamp at start
    pub context_start: u64,
    /// Global timestamp at start
    pub global_start: u64,
    /// Context timestamp at end
    pub context_end: u64,
    /// Global timestamp at end
    pub global_end: u64,
}

const_assert_eq!(core::mem::size_of::<TimestampPacket>(), 32);

impl TimestampPacket {
    /// Offset of the context start value
    pub const CONTEXT_START: u64 = 0;
    /// Offset of the global start value
    pub const GLOBAL_START: u64 = 8;
    /// Offset of the context end value
    pub const CONTEXT_END: u64 = 16;
    /// Offset of the global end value
    pub const GLOBAL_END: u64 = 24;
}
