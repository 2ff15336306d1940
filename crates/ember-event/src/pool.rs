//! # Event Pools
//!
//! One host-visible allocation carved into fixed-size event slots.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use ember_cmd::Device;
use ember_core::{
    AllocationId, AllocationKind, ByteSize, Error, GpuAddr, HostVisibleMemory, MemoryBackend,
    Result,
};

use crate::event::{Event, EventDesc};
use crate::packets::EventPolicy;

bitflags::bitflags! {
    /// Event pool properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventPoolFlags: u32 {
        /// Events may be signaled and queried by the host
        const HOST_VISIBLE = 1 << 0;
        /// Events record kernel timestamps
        const KERNEL_TIMESTAMP = 1 << 1;
    }
}

/// Event pool creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPoolDesc {
    /// Number of events
    pub count: u32,
    /// Properties
    pub flags: EventPoolFlags,
    /// Packet policy of the owning device
    pub policy: EventPolicy,
}

impl EventPoolDesc {
    /// Pool of `count` events for `device`
    pub fn new(device: &Device, count: u32, flags: EventPoolFlags) -> Self {
        Self {
            count,
            flags,
            policy: EventPolicy::for_device(device),
        }
    }
}

/// A pool of events
#[derive(Debug)]
pub struct EventPool {
    allocator: Arc<dyn MemoryBackend>,
    memory: Arc<HostVisibleMemory>,
    desc: EventPoolDesc,
    live: Mutex<Vec<bool>>,
}

impl EventPool {
    /// Allocate a pool
    pub fn new(allocator: Arc<dyn MemoryBackend>, desc: EventPoolDesc) -> Result<Self> {
        if desc.count == 0 || desc.policy.max_packets == 0 || desc.policy.packet_size == 0 {
            return Err(Error::InvalidArgument);
        }
        let size = desc.count as usize * desc.policy.event_size();
        let memory =
            allocator.allocate_host_visible(ByteSize::from_bytes(size as u64), AllocationKind::EventPool)?;

        log::debug!(
            "ember-event: pool of {} events, {} packets each, at {:?}",
            desc.count,
            desc.policy.max_packets,
            memory.gpu_base()
        );

        Ok(Self {
            allocator,
            memory,
            live: Mutex::new(vec![false; desc.count as usize]),
            desc,
        })
    }

    /// Pool allocation
    pub fn allocation(&self) -> AllocationId {
        self.memory.allocation()
    }

    /// GPU address of slot 0
    pub fn gpu_base(&self) -> GpuAddr {
        self.memory.gpu_base()
    }

    /// Number of slots
    pub fn count(&self) -> u32 {
        self.desc.count
    }

    /// Properties
    pub fn flags(&self) -> EventPoolFlags {
        self.desc.flags
    }

    /// Packet policy
    pub fn policy(&self) -> &EventPolicy {
        &self.desc.policy
    }

    /// Host-visible backing
    pub fn memory(&self) -> &Arc<HostVisibleMemory> {
        &self.memory
    }

    /// Create the event in slot `desc.index`, which must be free
    pub fn create_event(&self, desc: EventDesc) -> Result<Arc<Event>> {
        let mut live = self.live.lock();
        let slot = live
            .get_mut(desc.index as usize)
            .ok_or(Error::InvalidArgument)?;
        if *slot {
            return Err(Error::InvalidArgument);
        }

        let base = self
            .gpu_base()
            .offset(u64::from(desc.index) * self.desc.policy.event_size() as u64);
        let event = Event::new(
            Arc::clone(&self.memory),
            base,
            desc,
            self.desc.policy,
            self.desc.flags.contains(EventPoolFlags::KERNEL_TIMESTAMP),
        )?;
        *slot = true;
        Ok(Arc::new(event))
    }

    /// Free the slot of `event`
    pub fn release_event(&self, event: &Event) -> Result<()> {
        if event.allocation() != self.allocation() {
            return Err(Error::InvalidArgument);
        }
        let mut live = self.live.lock();
        match live.get_mut(event.index() as usize) {
            Some(slot) if *slot => {
                *slot = false;
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Number of created events
    pub fn live_events(&self) -> usize {
        self.live.lock().iter().filter(|live| **live).count()
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.free(self.memory.allocation()) {
            log::warn!("ember-event: failed to free event pool: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventStatus;
    use crate::packets::{SignalScope, RESET_SENTINEL, SIGNALED_SENTINEL};
    use ember_cmd::cmds::TimestampPacket;
    use ember_mem::SvmManager;

    fn policy() -> EventPolicy {
        EventPolicy {
            signal_all_packets: false,
            compact_l3_flush_packet: false,
            dynamic_packets_count: false,
            pipe_control_multi_kernel_sync: false,
            l3_flush_for_host_visibility: true,
            unified_timestamp_post_sync: true,
            packet_size: 32,
            max_packets: 4,
        }
    }

    fn pool(flags: EventPoolFlags, policy: EventPolicy) -> EventPool {
        let memory: Arc<dyn MemoryBackend> = Arc::new(SvmManager::default());
        let desc = EventPoolDesc {
            count: 4,
            flags,
            policy,
        };
        match EventPool::new(memory, desc) {
            Ok(pool) => pool,
            Err(e) => panic!("pool: {e}"),
        }
    }

    fn event(pool: &EventPool, index: u32, scope: SignalScope) -> Arc<Event> {
        let desc = EventDesc {
            index,
            signal_scope: scope,
            wait_scope: scope,
        };
        match pool.create_event(desc) {
            Ok(event) => event,
            Err(e) => panic!("event: {e}"),
        }
    }

    #[test]
    fn test_events_tile_the_pool() {
        let pool = pool(EventPoolFlags::HOST_VISIBLE, policy());
        let a = event(&pool, 0, SignalScope::Device);
        let b = event(&pool, 3, SignalScope::Device);
        assert_eq!(a.gpu_address(), pool.gpu_base());
        assert_eq!(b.gpu_address(), pool.gpu_base().offset(3 * 4 * 32));
        assert_eq!(pool.live_events(), 2);
    }

    #[test]
    fn test_slot_reuse_rules() {
        let pool = pool(EventPoolFlags::HOST_VISIBLE, policy());
        let a = event(&pool, 1, SignalScope::Device);
        let again = pool.create_event(EventDesc {
            index: 1,
            ..Default::default()
        });
        assert!(matches!(again, Err(Error::InvalidArgument)));
        let out_of_range = pool.create_event(EventDesc {
            index: 4,
            ..Default::default()
        });
        assert!(matches!(out_of_range, Err(Error::InvalidArgument)));
        assert_eq!(pool.release_event(&a), Ok(()));
        assert!(pool.create_event(EventDesc {
            index: 1,
            ..Default::default()
        })
        .is_ok());
    }

    #[test]
    fn test_new_event_is_reset() {
        let pool = pool(EventPoolFlags::HOST_VISIBLE, policy());
        let e = event(&pool, 0, SignalScope::Host);
        assert_eq!(e.query_status(), Ok(EventStatus::NotReady));
        for i in 0..e.max_packets() {
            assert_eq!(pool.memory().read_u64(e.packet_address(i)), Ok(RESET_SENTINEL));
        }
    }

    #[test]
    fn test_host_signal_and_reset() {
        let pool = pool(EventPoolFlags::HOST_VISIBLE, policy());
        let e = event(&pool, 2, SignalScope::Host);
        let accounting = e.account(1, 2);
        assert_eq!(accounting.packets_in_use, 3);
        assert_eq!(e.l3_flush_address(), Some(e.gpu_address().offset(2 * 32)));

        assert_eq!(e.host_signal(), Ok(()));
        assert_eq!(e.query_status(), Ok(EventStatus::Signaled));
        // Unused packet untouched
        assert_eq!(pool.memory().read_u64(e.packet_address(3)), Ok(RESET_SENTINEL));

        assert_eq!(e.host_reset(), Ok(()));
        assert_eq!(e.packets_in_use(), 1);
        assert_eq!(e.query_status(), Ok(EventStatus::NotReady));
        assert_eq!(e.host_synchronize(3), Ok(EventStatus::NotReady));
    }

    #[test]
    fn test_query_waits_for_every_packet() {
        let pool = pool(EventPoolFlags::HOST_VISIBLE, policy());
        let e = event(&pool, 0, SignalScope::Device);
        let _ = e.account(2, 2);
        assert_eq!(e.packets_in_use(), 4);
        for i in 0..3 {
            let _ = pool.memory().write_u64(e.completion_address(i), SIGNALED_SENTINEL);
        }
        assert_eq!(e.query_status(), Ok(EventStatus::NotReady));
        let _ = pool.memory().write_u64(e.completion_address(3), SIGNALED_SENTINEL);
        assert_eq!(e.query_status(), Ok(EventStatus::Signaled));
    }

    #[test]
    fn test_signal_all_covers_unused_packets() {
        let policy = EventPolicy {
            signal_all_packets: true,
            ..policy()
        };
        let pool = pool(EventPoolFlags::HOST_VISIBLE, policy);
        let e = event(&pool, 0, SignalScope::Device);
        assert_eq!(e.packets_to_check(), 4);
        let _ = e.host_signal();
        assert_eq!(pool.memory().read_u64(e.packet_address(3)), Ok(SIGNALED_SENTINEL));
    }

    #[test]
    fn test_kernel_timestamp_readback() {
        let pool = pool(
            EventPoolFlags::HOST_VISIBLE | EventPoolFlags::KERNEL_TIMESTAMP,
            policy(),
        );
        let e = event(&pool, 0, SignalScope::Device);
        let _ = e.account(1, 2);
        assert_eq!(e.query_kernel_timestamp(), Ok(None));

        let mem = pool.memory();
        for (i, (start, end)) in [(100u64, 200u64), (90, 250)].into_iter().enumerate() {
            let at = e.packet_address(i as u32);
            let _ = mem.write_u64(at.offset(TimestampPacket::CONTEXT_START), start);
            let _ = mem.write_u64(at.offset(TimestampPacket::GLOBAL_START), start + 1000);
            let _ = mem.write_u64(at.offset(TimestampPacket::CONTEXT_END), end);
            let _ = mem.write_u64(at.offset(TimestampPacket::GLOBAL_END), end + 1000);
        }
        let Ok(Some(result)) = e.query_kernel_timestamp() else {
            panic!("timestamp ready");
        };
        assert_eq!(result.context.start, 90);
        assert_eq!(result.context.end, 250);
        assert_eq!(result.global.start, 1090);
    }

    #[test]
    fn test_empty_pool_rejected() {
        let memory: Arc<dyn MemoryBackend> = Arc::new(SvmManager::default());
        let desc = EventPoolDesc {
            count: 0,
            flags: EventPoolFlags::empty(),
            policy: policy(),
        };
        assert!(matches!(EventPool::new(memory, desc), Err(Error::InvalidArgument)));
    }
}
