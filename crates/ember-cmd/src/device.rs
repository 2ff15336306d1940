//! # Device Context
//!
//! Everything the dispatch core needs to know about one logical device:
//! family policy, encoder, memory backend, built-ins, tile topology and the
//! configuration overrides. Built once from a [`DeviceDesc`] and shared by
//! every list and queue created on the device.
//!
//! ```text
//!   PlatformRegistry ─┐
//!   MemoryBackend ────┼──▶ Device::new(desc) ──▶ Arc<Device>
//!   DispatchConfig ───┘        │
//!                              ├── caps      (Arc<dyn PlatformCaps>)
//!                              ├── encoder   (Arc<dyn CommandEncoder>)
//!                              ├── builtins  (Arc<dyn BuiltinProvider>)
//!                              └── work partition table (multi-tile only)
//! ```

use alloc::sync::Arc;

use ember_core::stream_state::HeapBases;
use ember_core::{
    AllocationKind, ByteSize, DispatchConfig, EngineGroupType, Error, GpuAddr, HostVisibleMemory,
    HwFamily, MemoryBackend, PlatformCaps, PlatformRegistry, PreemptionMode, Result, TileMask,
};
use ember_mem::SvmManager;

use crate::encoder::{CommandEncoder, FamilyEncoder};
use crate::kernel::{BuiltinProvider, BuiltinTable};

/// Topology and configuration of a device to create
#[derive(Debug, Clone)]
pub struct DeviceDesc {
    /// Hardware family
    pub family: HwFamily,
    /// Number of tiles of the logical device
    pub tile_count: u32,
    /// Overrides
    pub config: DispatchConfig,
}

impl DeviceDesc {
    /// Description with default configuration
    pub fn new(family: HwFamily, tile_count: u32) -> Self {
        Self {
            family,
            tile_count,
            config: DispatchConfig::default(),
        }
    }
}

/// A logical device
#[derive(Debug)]
pub struct Device {
    caps: Arc<dyn PlatformCaps>,
    encoder: Arc<dyn CommandEncoder>,
    memory: Arc<dyn MemoryBackend>,
    builtins: Arc<dyn BuiltinProvider>,
    config: DispatchConfig,
    tile_mask: TileMask,
    implicit_scaling: bool,
    work_partition: Option<Arc<HostVisibleMemory>>,
}

impl Device {
    /// Create a device.
    ///
    /// Fails with `NotSupported` for unregistered families and with
    /// `InvalidArgument` for a tile count the family cannot have.
    pub fn new(
        desc: DeviceDesc,
        registry: &PlatformRegistry,
        memory: Arc<dyn MemoryBackend>,
    ) -> Result<Self> {
        let caps = registry.get(desc.family)?;
        if desc.tile_count == 0
            || desc.tile_count > caps.max_tile_count()
            || desc.tile_count > TileMask::MAX_TILES
        {
            return Err(Error::InvalidArgument);
        }

        let implicit_scaling = desc.tile_count > 1
            && caps.supports_implicit_scaling()
            && desc.config.implicit_scaling.unwrap_or(true);

        let work_partition = if implicit_scaling {
            let stride = caps.event_packet_size() as usize;
            let table = memory.allocate_host_visible(
                ByteSize::from_bytes((stride * desc.tile_count as usize) as u64),
                AllocationKind::WorkPartition,
            )?;
            for tile in 0..desc.tile_count {
                let at = table.gpu_base().offset(tile as u64 * stride as u64);
                table.write_u32(at, tile)?;
            }
            Some(table)
        } else {
            None
        };

        let builtins: Arc<dyn BuiltinProvider> = Arc::new(BuiltinTable::new(memory.as_ref())?);

        log::debug!(
            "ember-cmd: device {} with {} tile(s), implicit scaling {}",
            desc.family,
            desc.tile_count,
            implicit_scaling
        );

        Ok(Self {
            encoder: Arc::new(FamilyEncoder::new(desc.family)),
            caps,
            memory,
            builtins,
            config: desc.config,
            tile_mask: TileMask::first(desc.tile_count),
            implicit_scaling,
            work_partition,
        })
    }

    /// Device on the default registry and a fresh software memory manager
    pub fn with_defaults(family: HwFamily, tile_count: u32) -> Result<Self> {
        Self::with_config(family, tile_count, DispatchConfig::default())
    }

    /// Like [`Device::with_defaults`] with explicit overrides
    pub fn with_config(family: HwFamily, tile_count: u32, config: DispatchConfig) -> Result<Self> {
        Self::new(
            DeviceDesc {
                family,
                tile_count,
                config,
            },
            &PlatformRegistry::with_default_families(),
            Arc::new(SvmManager::default()),
        )
    }

    /// Hardware family
    pub fn family(&self) -> HwFamily {
        self.caps.family()
    }

    /// Family policy
    pub fn caps(&self) -> &Arc<dyn PlatformCaps> {
        &self.caps
    }

    /// Command encoder
    pub fn encoder(&self) -> &Arc<dyn CommandEncoder> {
        &self.encoder
    }

    /// Memory backend
    pub fn memory(&self) -> &Arc<dyn MemoryBackend> {
        &self.memory
    }

    /// Built-in kernels
    pub fn builtins(&self) -> &Arc<dyn BuiltinProvider> {
        &self.builtins
    }

    /// Configuration overrides
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Tiles of the logical device
    pub fn tile_mask(&self) -> TileMask {
        self.tile_mask
    }

    /// Number of tiles
    pub fn tile_count(&self) -> u32 {
        self.tile_mask.count()
    }

    /// Whether walkers on compute engines are partitioned across tiles
    pub fn implicit_scaling(&self) -> bool {
        self.implicit_scaling
    }

    /// Tiles a compute walker of an engine group runs on
    pub fn partition_tile_count(&self, engine: EngineGroupType) -> u32 {
        if self.implicit_scaling && !engine.is_copy_only() {
            self.tile_count()
        } else {
            1
        }
    }

    /// Heap bases shared by every list of the device. Indirect heaps come
    /// and go, the indirect object base stays at the heap window.
    pub fn heap_bases(&self) -> HeapBases {
        HeapBases {
            indirect_object: self.memory.heap_window_base().raw(),
            stateless_mocs: 2,
            ..Default::default()
        }
    }

    /// Offset of cross-thread data at `address` from the indirect object base
    pub fn indirect_offset(&self, address: GpuAddr) -> Result<u32> {
        let base = self.memory.heap_window_base();
        if address < base {
            return Err(Error::OutOfDeviceMemory);
        }
        u32::try_from(address - base).map_err(|_| Error::OutOfDeviceMemory)
    }

    /// Per-tile partition ID table, one packet-size slot per tile
    pub fn work_partition(&self) -> Option<&Arc<HostVisibleMemory>> {
        self.work_partition.as_ref()
    }

    /// Finest preemption granularity
    pub fn preemption_mode(&self) -> PreemptionMode {
        self.caps.default_preemption_mode()
    }

    /// Size of one event packet
    pub fn event_packet_size(&self) -> u32 {
        self.caps.event_packet_size()
    }

    /// Jump target alignment of command buffers
    pub fn jump_target_alignment(&self) -> u32 {
        self.caps.jump_target_alignment()
    }

    /// Whether command lists are chained as primary batch buffers
    pub fn primary_batch_buffer(&self) -> bool {
        self.caps.supports_primary_batch_buffer()
            && self.config.primary_batch_buffer.unwrap_or(false)
    }
}
