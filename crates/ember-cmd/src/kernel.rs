//! # Kernels
//!
//! Compiled kernel descriptors, argument binding and the built-in kernels
//! used to implement copies, fills and timestamp queries on compute engines.
//!
//! Kernel compilation is out of scope: a [`KernelDescriptor`] describes an
//! already compiled kernel by its ISA address and dispatch properties.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use arrayvec::ArrayVec;

use ember_core::{
    AllocationId, AllocationKind, ByteSize, Error, GpuAddr, GpuAllocator, IndirectAccess,
    PreemptionMode, Result, StateRequirements, ThreadArbitration, UsmPtr,
};

/// Maximum number of kernel arguments
pub const MAX_KERNEL_ARGS: usize = 32;

/// Size of one argument slot in the cross-thread data
pub const ARG_SLOT_SIZE: usize = 8;

// =============================================================================
// DESCRIPTOR
// =============================================================================

/// State a kernel needs from the command streamer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelStateRequirements {
    /// Needs the large register file
    pub large_grf: bool,
    /// Needs systolic (DPAS) mode
    pub systolic: bool,
    /// Thread arbitration policy, `None` for the hardware default
    pub thread_arbitration: Option<ThreadArbitration>,
    /// Requires EU fusion disabled
    pub disable_eu_fusion: bool,
    /// Finest preemption the kernel tolerates
    pub max_preemption: Option<PreemptionMode>,
}

/// A compiled kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDescriptor {
    /// Kernel name
    pub name: String,
    /// ISA start address
    pub isa: GpuAddr,
    /// Allocation holding the ISA
    pub isa_allocation: AllocationId,
    /// SIMD width
    pub simd_size: u32,
    /// Cross-thread data size in bytes
    pub cross_thread_size: u32,
    /// Shared local memory size
    pub slm_size: u32,
    /// Barrier count
    pub barrier_count: u32,
    /// Scratch bytes per hardware thread
    pub scratch_per_thread: u32,
    /// Stream state requirements
    pub requirements: KernelStateRequirements,
    /// Indirect USM access the kernel may perform
    pub indirect_access: IndirectAccess,
    /// Uses images (forces X partitioning)
    pub uses_images: bool,
}

impl KernelDescriptor {
    /// Descriptor with default dispatch properties
    pub fn new(name: &str, isa: GpuAddr, isa_allocation: AllocationId) -> Self {
        Self {
            name: String::from(name),
            isa,
            isa_allocation,
            simd_size: 32,
            cross_thread_size: 64,
            slm_size: 0,
            barrier_count: 0,
            scratch_per_thread: 0,
            requirements: KernelStateRequirements::default(),
            indirect_access: IndirectAccess::empty(),
            uses_images: false,
        }
    }

    /// Stream state needed to launch this kernel on a device whose finest
    /// preemption granularity is `device_preemption`
    pub fn state_requirements(
        &self,
        device_preemption: PreemptionMode,
        large_grf_supported: bool,
        systolic_supported: bool,
    ) -> StateRequirements {
        let preemption = self
            .requirements
            .max_preemption
            .map_or(device_preemption, |mode| mode.clamp_to(device_preemption));
        StateRequirements {
            preemption: Some(preemption),
            disable_eu_fusion: Some(self.requirements.disable_eu_fusion),
            systolic_mode: systolic_supported.then_some(self.requirements.systolic),
            large_grf: large_grf_supported.then_some(self.requirements.large_grf),
            thread_arbitration: self.requirements.thread_arbitration,
            ..Default::default()
        }
    }
}

// =============================================================================
// KERNEL
// =============================================================================

/// One bound kernel argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    /// Immediate value
    Value(u64),
    /// USM pointer, resolved to a GPU address at launch
    Buffer(UsmPtr),
}

/// A kernel with its argument bindings and group size
#[derive(Debug, Clone)]
pub struct Kernel {
    descriptor: Arc<KernelDescriptor>,
    args: ArrayVec<Option<KernelArg>, MAX_KERNEL_ARGS>,
    group_size: [u32; 3],
}

impl Kernel {
    /// Instantiate a descriptor
    pub fn new(descriptor: Arc<KernelDescriptor>) -> Self {
        Self {
            descriptor,
            args: ArrayVec::new(),
            group_size: [1, 1, 1],
        }
    }

    /// Descriptor
    pub fn descriptor(&self) -> &Arc<KernelDescriptor> {
        &self.descriptor
    }

    /// Bind argument `index`
    pub fn set_arg(&mut self, index: usize, arg: KernelArg) -> Result<()> {
        if index >= MAX_KERNEL_ARGS {
            return Err(Error::InvalidArgument);
        }
        while self.args.len() <= index {
            self.args.push(None);
        }
        self.args[index] = Some(arg);
        Ok(())
    }

    /// Bound arguments in slot order
    pub fn args(&self) -> impl Iterator<Item = KernelArg> + '_ {
        self.args.iter().flatten().copied()
    }

    /// Set the work-group size
    pub fn set_group_size(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        if x == 0 || y == 0 || z == 0 {
            return Err(Error::InvalidArgument);
        }
        self.group_size = [x, y, z];
        Ok(())
    }

    /// Work-group size
    pub fn group_size(&self) -> [u32; 3] {
        self.group_size
    }

    /// Hardware threads per work-group
    pub fn threads_per_group(&self) -> u32 {
        let items = self.group_size.iter().product::<u32>();
        items.div_ceil(self.descriptor.simd_size.max(1))
    }

    /// Serialize the arguments into cross-thread data.
    ///
    /// Buffers are resolved through `resolve`; unbound slots are zero.
    pub fn cross_thread_data<F>(&self, mut resolve: F) -> Result<Vec<u8>>
    where
        F: FnMut(UsmPtr) -> Result<GpuAddr>,
    {
        let size = (self.args.len() * ARG_SLOT_SIZE).max(self.descriptor.cross_thread_size as usize);
        let mut data = alloc::vec![0u8; size];
        for (slot, arg) in self.args.iter().enumerate() {
            let value = match arg {
                Some(KernelArg::Value(v)) => *v,
                Some(KernelArg::Buffer(ptr)) => resolve(*ptr)?.raw(),
                None => 0,
            };
            let at = slot * ARG_SLOT_SIZE;
            data[at..at + ARG_SLOT_SIZE].copy_from_slice(&value.to_le_bytes());
        }
        Ok(data)
    }
}

// =============================================================================
// BUILT-IN KERNELS
// =============================================================================

/// Kernels the dispatch core launches on its own behalf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinKernel {
    /// Byte-granular copy for unaligned edges
    CopyBufferBytes,
    /// Wide copy for the cache-line aligned middle
    CopyBufferMiddle,
    /// 2D region copy
    CopyBufferRegion2d,
    /// 3D region copy
    CopyBufferRegion3d,
    /// Fill with a 1/2/4-byte immediate pattern
    FillBufferImmediate,
    /// Tail of an immediate fill
    FillBufferImmediateLeftover,
    /// Fill with a pattern read from memory
    FillBufferPattern,
    /// Copy kernel timestamps of events into a buffer
    QueryKernelTimestamps,
}

impl BuiltinKernel {
    /// Every built-in
    pub const ALL: [Self; 8] = [
        Self::CopyBufferBytes,
        Self::CopyBufferMiddle,
        Self::CopyBufferRegion2d,
        Self::CopyBufferRegion3d,
        Self::FillBufferImmediate,
        Self::FillBufferImmediateLeftover,
        Self::FillBufferPattern,
        Self::QueryKernelTimestamps,
    ];

    /// Kernel name
    pub const fn name(self) -> &'static str {
        match self {
            Self::CopyBufferBytes => "copyBufferToBufferBytesSingle",
            Self::CopyBufferMiddle => "copyBufferToBufferMiddleRegion",
            Self::CopyBufferRegion2d => "copyBufferRectBytes2d",
            Self::CopyBufferRegion3d => "copyBufferRectBytes3d",
            Self::FillBufferImmediate => "FillBufferImmediate",
            Self::FillBufferImmediateLeftover => "FillBufferImmediateLeftOver",
            Self::FillBufferPattern => "FillBufferMiddle",
            Self::QueryKernelTimestamps => "QueryKernelTimestamps",
        }
    }

    /// Work-items each work-group covers
    pub const fn group_width(self) -> u32 {
        match self {
            Self::CopyBufferMiddle | Self::FillBufferImmediate | Self::FillBufferPattern => 256,
            Self::QueryKernelTimestamps => 1,
            _ => 64,
        }
    }
}

/// Source of built-in kernel descriptors
pub trait BuiltinProvider: Send + Sync + core::fmt::Debug {
    /// Descriptor of a built-in
    fn descriptor(&self, builtin: BuiltinKernel) -> Result<Arc<KernelDescriptor>>;
}

/// Built-ins backed by one ISA allocation
#[derive(Debug)]
pub struct BuiltinTable {
    isa_allocation: AllocationId,
    entries: Vec<(BuiltinKernel, Arc<KernelDescriptor>)>,
}

impl BuiltinTable {
    /// ISA bytes reserved per built-in
    pub const ISA_SLOT: u64 = 4096;

    /// Allocate the ISA region and describe every built-in
    pub fn new<M: GpuAllocator + ?Sized>(memory: &M) -> Result<Self> {
        let size = ByteSize::from_bytes(Self::ISA_SLOT * BuiltinKernel::ALL.len() as u64);
        let info = memory.allocate(size, AllocationKind::KernelIsa)?;

        let entries = BuiltinKernel::ALL
            .iter()
            .enumerate()
            .map(|(i, &builtin)| {
                let mut desc = KernelDescriptor::new(
                    builtin.name(),
                    info.gpu_base.offset(i as u64 * Self::ISA_SLOT),
                    info.id,
                );
                desc.simd_size = if builtin == BuiltinKernel::QueryKernelTimestamps { 1 } else { 32 };
                (builtin, Arc::new(desc))
            })
            .collect();

        log::debug!("ember-cmd: built-in kernels loaded at {}", info.gpu_base);
        Ok(Self {
            isa_allocation: info.id,
            entries,
        })
    }

    /// Allocation holding the built-in ISA
    pub fn isa_allocation(&self) -> AllocationId {
        self.isa_allocation
    }
}

impl BuiltinProvider for BuiltinTable {
    fn descriptor(&self, builtin: BuiltinKernel) -> Result<Arc<KernelDescriptor>> {
        self.entries
            .iter()
            .find(|(b, _)| *b == builtin)
            .map(|(_, d)| Arc::clone(d))
            .ok_or(Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_mem::SvmManager;

    fn descriptor() -> Arc<KernelDescriptor> {
        Arc::new(KernelDescriptor::new("k", GpuAddr::new(0x1000), AllocationId::new(1)))
    }

    #[test]
    fn test_cross_thread_data_resolves_buffers() {
        let mut kernel = Kernel::new(descriptor());
        assert!(kernel.set_arg(0, KernelArg::Value(7)).is_ok());
        assert!(kernel.set_arg(2, KernelArg::Buffer(UsmPtr::new(0x4000))).is_ok());
        let data = kernel
            .cross_thread_data(|ptr| Ok(GpuAddr::new(ptr.raw() + 0x10)))
            .unwrap_or_default();
        assert_eq!(data.len(), 64);
        assert_eq!(&data[0..8], &7u64.to_le_bytes());
        assert_eq!(&data[8..16], &[0; 8]);
        assert_eq!(&data[16..24], &0x4010u64.to_le_bytes());
    }

    #[test]
    fn test_arg_and_group_size_bounds() {
        let mut kernel = Kernel::new(descriptor());
        assert_eq!(
            kernel.set_arg(MAX_KERNEL_ARGS, KernelArg::Value(0)),
            Err(Error::InvalidArgument)
        );
        assert_eq!(kernel.set_group_size(0, 1, 1), Err(Error::InvalidArgument));
        assert!(kernel.set_group_size(64, 2, 1).is_ok());
        assert_eq!(kernel.threads_per_group(), 4);
    }

    #[test]
    fn test_preemption_clamped_to_device() {
        let mut desc = KernelDescriptor::new("k", GpuAddr::new(0x1000), AllocationId::new(1));
        desc.requirements.max_preemption = Some(PreemptionMode::ThreadGroup);
        let req = desc.state_requirements(PreemptionMode::MidThread, false, true);
        assert_eq!(req.preemption, Some(PreemptionMode::ThreadGroup));
        assert_eq!(req.large_grf, None);
        assert_eq!(req.systolic_mode, Some(false));
    }

    #[test]
    fn test_builtin_table_has_every_kernel() {
        let memory = SvmManager::default();
        let Ok(table) = BuiltinTable::new(&memory) else {
            panic!("builtin table");
        };
        for builtin in BuiltinKernel::ALL {
            let desc = table.descriptor(builtin);
            assert_eq!(desc.map(|d| d.isa_allocation), Ok(table.isa_allocation()));
        }
    }
}
