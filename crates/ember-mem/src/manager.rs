//! # SVM Memory Manager
//!
//! Software implementation of the allocation, resolution and residency
//! interfaces. Every allocation gets a page-aligned range from one shared
//! address space; host-visible kinds additionally get a coherent host copy.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashSet;
use spin::Mutex;

use ember_core::{
    AllocationId, AllocationInfo, AllocationKind, AllocationResolver, ByteSize, Error, GpuAddr,
    GpuAllocator, HostVisibleMemory, IndirectAccess, ResidencyManager, ResolvedAllocation, Result,
    UsmPtr,
};

use crate::address_space::{AddressSpace, VaRange};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Memory manager configuration
#[derive(Debug, Clone)]
pub struct SvmManagerConfig {
    /// Base of the managed GPU VA range
    pub va_base: GpuAddr,
    /// Size of the managed GPU VA range, at most 4 GiB
    pub va_size: ByteSize,
    /// Allow unresolved host pointers to be used as GPU addresses
    pub shared_system_fallback: bool,
}

impl Default for SvmManagerConfig {
    fn default() -> Self {
        Self {
            va_base: GpuAddr::new(0x0001_0000_0000),
            va_size: ByteSize::from_mib(1024),
            shared_system_fallback: false,
        }
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Memory manager statistics
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    /// Live allocations
    pub live_allocations: u64,
    /// Bytes currently allocated
    pub bytes_allocated: u64,
    /// Residency requests
    pub residency_requests: u64,
    /// Indirect residency passes
    pub indirect_passes: u64,
}

// =============================================================================
// MANAGER
// =============================================================================

#[derive(Debug)]
struct Record {
    info: AllocationInfo,
    range: VaRange,
    host: Option<Arc<HostVisibleMemory>>,
}

#[derive(Debug)]
struct Inner {
    space: AddressSpace,
    /// Records keyed by GPU base address
    records: BTreeMap<GpuAddr, Record>,
    /// GPU base address by handle
    by_id: BTreeMap<AllocationId, GpuAddr>,
    resident: HashSet<AllocationId>,
    next_id: u64,
    stats: MemoryStats,
}

/// Unified shared memory manager
#[derive(Debug)]
pub struct SvmManager {
    va_base: GpuAddr,
    shared_system_fallback: bool,
    inner: Mutex<Inner>,
}

impl SvmManager {
    /// Largest range whose offsets fit the walker's 32-bit indirect data field
    pub const MAX_VA_SIZE: u64 = 1 << 32;

    /// Create a manager over the configured VA range
    pub fn new(config: SvmManagerConfig) -> Self {
        Self {
            va_base: config.va_base,
            shared_system_fallback: config.shared_system_fallback,
            inner: Mutex::new(Inner {
                space: AddressSpace::new(VaRange::new(
                    config.va_base,
                    ByteSize::from_bytes(config.va_size.as_bytes().min(Self::MAX_VA_SIZE)),
                )),
                records: BTreeMap::new(),
                by_id: BTreeMap::new(),
                resident: HashSet::new(),
                next_id: 1,
                stats: MemoryStats::default(),
            }),
        }
    }

    fn insert(
        &self,
        size: ByteSize,
        kind: AllocationKind,
    ) -> Result<(AllocationInfo, Option<Arc<HostVisibleMemory>>)> {
        if size.as_bytes() == 0 {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        let range = inner.space.allocate(size, AddressSpace::PAGE_SIZE)?;
        let id = AllocationId::new(inner.next_id);
        inner.next_id += 1;

        let info = AllocationInfo {
            id,
            gpu_base: range.start,
            size,
            kind,
        };
        let host = kind
            .is_host_visible()
            .then(|| Arc::new(HostVisibleMemory::new(id, range.start, size.as_usize())));

        inner.stats.live_allocations += 1;
        inner.stats.bytes_allocated += size.as_bytes();
        inner.by_id.insert(id, range.start);
        inner.records.insert(range.start, Record {
            info,
            range,
            host: host.clone(),
        });

        log::trace!("ember-mem: allocated {:?} {:?} at {}", kind, size, range.start);
        Ok((info, host))
    }

    /// Allocate application USM and return its pointer
    pub fn allocate_usm(&self, size: ByteSize, kind: AllocationKind) -> Result<UsmPtr> {
        if !kind.is_usm() {
            return Err(Error::InvalidArgument);
        }
        let (info, _) = self.insert(size, kind)?;
        Ok(UsmPtr::new(info.gpu_base.raw()))
    }

    /// Free application USM
    pub fn free_usm(&self, ptr: UsmPtr) -> Result<()> {
        let id = self
            .inner
            .lock()
            .records
            .get(&GpuAddr::new(ptr.raw()))
            .map(|r| r.info.id)
            .ok_or(Error::NotFound)?;
        self.free(id)
    }

    /// Look up an allocation
    pub fn info(&self, id: AllocationId) -> Option<AllocationInfo> {
        let inner = self.inner.lock();
        let base = inner.by_id.get(&id)?;
        inner.records.get(base).map(|r| r.info)
    }

    /// Host mapping of a host-visible allocation
    pub fn host_memory(&self, id: AllocationId) -> Option<Arc<HostVisibleMemory>> {
        let inner = self.inner.lock();
        let base = inner.by_id.get(&id)?;
        inner.records.get(base).and_then(|r| r.host.clone())
    }

    /// Current statistics
    pub fn stats(&self) -> MemoryStats {
        self.inner.lock().stats.clone()
    }
}

impl Default for SvmManager {
    fn default() -> Self {
        Self::new(SvmManagerConfig::default())
    }
}

impl GpuAllocator for SvmManager {
    fn allocate(&self, size: ByteSize, kind: AllocationKind) -> Result<AllocationInfo> {
        self.insert(size, kind).map(|(info, _)| info)
    }

    fn allocate_host_visible(
        &self,
        size: ByteSize,
        kind: AllocationKind,
    ) -> Result<Arc<HostVisibleMemory>> {
        if !kind.is_host_visible() {
            return Err(Error::InvalidArgument);
        }
        let (_, host) = self.insert(size, kind)?;
        host.ok_or(Error::OutOfHostMemory)
    }

    fn free(&self, id: AllocationId) -> Result<()> {
        let mut inner = self.inner.lock();
        let base = inner.by_id.remove(&id).ok_or(Error::NotFound)?;
        let record = inner.records.remove(&base).ok_or(Error::NotFound)?;
        inner.space.free(record.range)?;
        inner.resident.remove(&id);
        inner.stats.live_allocations -= 1;
        inner.stats.bytes_allocated -= record.info.size.as_bytes();
        Ok(())
    }

    fn heap_window_base(&self) -> GpuAddr {
        self.va_base
    }
}

impl AllocationResolver for SvmManager {
    fn resolve(&self, ptr: UsmPtr, size: u64) -> Option<ResolvedAllocation> {
        if ptr.is_null() {
            return None;
        }
        let addr = GpuAddr::new(ptr.raw());
        let inner = self.inner.lock();
        let (_, record) = inner.records.range(..=addr).next_back()?;
        let end = record.info.gpu_base.offset(record.info.size.as_bytes());
        let fits = addr < end && size <= end - addr;
        (record.info.kind.is_usm() && fits).then_some(ResolvedAllocation {
            id: Some(record.info.id),
            gpu_address: addr,
        })
    }

    fn shared_system_fallback(&self) -> bool {
        self.shared_system_fallback
    }
}

impl ResidencyManager for SvmManager {
    fn mark_resident(&self, id: AllocationId) {
        let mut inner = self.inner.lock();
        inner.stats.residency_requests += 1;
        inner.resident.insert(id);
    }

    fn make_indirect_allocations_resident(&self, access: IndirectAccess) -> Vec<AllocationId> {
        let mut inner = self.inner.lock();
        inner.stats.indirect_passes += 1;

        let ids: Vec<AllocationId> = inner
            .records
            .values()
            .filter(|r| match r.info.kind {
                AllocationKind::DeviceUsm => access.contains(IndirectAccess::DEVICE),
                AllocationKind::HostUsm => access.contains(IndirectAccess::HOST),
                AllocationKind::SharedUsm => access.contains(IndirectAccess::SHARED),
                _ => false,
            })
            .map(|r| r.info.id)
            .collect();

        for id in &ids {
            inner.resident.insert(*id);
        }
        log::debug!("ember-mem: {} indirect allocations made resident", ids.len());
        ids
    }

    fn is_resident(&self, id: AllocationId) -> bool {
        self.inner.lock().resident.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usm_pointer_resolves_to_allocation() {
        let mm = SvmManager::default();
        let ptr = mm.allocate_usm(ByteSize::from_kib(8), AllocationKind::DeviceUsm);
        assert!(ptr.is_ok());
        let ptr = ptr.unwrap_or_default();

        let resolved = mm.resolve(ptr.offset(0x100), 0x200);
        assert!(resolved.is_some_and(|r| r.id.is_some()));
        assert_eq!(
            resolved.map(|r| r.gpu_address),
            Some(GpuAddr::new(ptr.raw() + 0x100))
        );
    }

    #[test]
    fn test_resolve_rejects_overrun_and_null() {
        let mm = SvmManager::default();
        let ptr = mm
            .allocate_usm(ByteSize::KIB_4, AllocationKind::HostUsm)
            .unwrap_or_default();
        assert!(mm.resolve(ptr, 0x1001).is_none());
        assert!(mm.resolve(UsmPtr::null(), 1).is_none());
        assert!(mm.resolve(UsmPtr::new(0x10), 1).is_none());
    }

    #[test]
    fn test_internal_allocations_are_not_usm() {
        let mm = SvmManager::default();
        let info = mm.allocate(ByteSize::KIB_4, AllocationKind::CommandBuffer);
        let base = info.map(|i| i.gpu_base.raw()).unwrap_or_default();
        assert!(mm.resolve(UsmPtr::new(base), 4).is_none());
    }

    #[test]
    fn test_host_visible_memory_is_addressable() {
        let mm = SvmManager::default();
        let mem = mm.allocate_host_visible(ByteSize::KIB_4, AllocationKind::EventPool);
        assert!(mem.is_ok());
        if let Ok(mem) = mem {
            assert!(mem.write_u64(mem.gpu_base().offset(16), 5).is_ok());
            let again = mm.host_memory(mem.allocation());
            assert_eq!(again.map(|m| m.read_u64(m.gpu_base().offset(16))), Some(Ok(5)));
        }
        assert_eq!(
            mm.allocate_host_visible(ByteSize::KIB_4, AllocationKind::CommandBuffer).err(),
            Some(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_indirect_residency_filters_by_class() {
        let mm = SvmManager::default();
        let _device = mm.allocate_usm(ByteSize::KIB_4, AllocationKind::DeviceUsm);
        let _shared = mm.allocate_usm(ByteSize::KIB_4, AllocationKind::SharedUsm);
        let _cmd = mm.allocate(ByteSize::KIB_4, AllocationKind::CommandBuffer);

        let ids = mm.make_indirect_allocations_resident(IndirectAccess::DEVICE);
        assert_eq!(ids.len(), 1);
        assert!(ids.iter().all(|id| mm.is_resident(*id)));

        let ids = mm.make_indirect_allocations_resident(IndirectAccess::all());
        assert_eq!(ids.len(), 2);
        assert_eq!(mm.stats().indirect_passes, 2);
    }

    #[test]
    fn test_free_releases_address_space() {
        let mm = SvmManager::default();
        let ptr = mm
            .allocate_usm(ByteSize::KIB_4, AllocationKind::DeviceUsm)
            .unwrap_or_default();
        assert_eq!(mm.stats().live_allocations, 1);
        assert!(mm.free_usm(ptr).is_ok());
        assert_eq!(mm.stats().live_allocations, 0);
        assert!(mm.resolve(ptr, 1).is_none());
        assert_eq!(mm.free_usm(ptr).err(), Some(Error::NotFound));
    }
}
