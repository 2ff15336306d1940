//! # Events
//!
//! An event is a run of packets inside its pool's host-visible memory.
//! The GPU signals an event by writing [`SIGNALED_SENTINEL`] into the
//! packets an operation accounted for; the host polls the same memory.
//!
//! ```text
//!          ┌──────── packets_in_use ────────┐
//!   base ─▶│ pkt 0 │ pkt 1 │ ... │ pkt n-1 │ unused ... │ max_packets
//!          └────────────────────────────────┘
//!   query: every packet in use (every packet with signal-all) signaled
//! ```
//!
//! Timestamp events complete on the context end field of each packet; a
//! regular event completes on the first qword.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use ember_cmd::cmds::TimestampPacket;
use ember_core::{AllocationId, Error, GpuAddr, HostVisibleMemory, Result};

use crate::packets::{
    account_packets, EventPolicy, L3FlushWrite, PacketAccounting, PacketRequest,
    PostSyncPlacement, SignalScope, RESET_SENTINEL, SIGNALED_SENTINEL,
};
use crate::timestamp::KernelTimestampResult;

/// Event creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventDesc {
    /// Slot in the pool
    pub index: u32,
    /// Visibility of the signal
    pub signal_scope: SignalScope,
    /// Visibility required before waiters proceed
    pub wait_scope: SignalScope,
}

/// Result of polling an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// All expected packets are signaled
    Signaled,
    /// At least one packet is still pending
    NotReady,
}

#[derive(Debug)]
struct PacketState {
    accounting: PacketAccounting,
}

impl PacketState {
    fn initial() -> Self {
        Self {
            accounting: PacketAccounting {
                placement: PostSyncPlacement::Walker,
                kernel_ranges: 1,
                packets_per_kernel: 1,
                packets_in_use: 1,
                l3_flush: L3FlushWrite::NotRequired,
                clamped: false,
            },
        }
    }
}

/// One event of a pool
#[derive(Debug)]
pub struct Event {
    memory: Arc<HostVisibleMemory>,
    base: GpuAddr,
    desc: EventDesc,
    policy: EventPolicy,
    is_timestamp: bool,
    state: Mutex<PacketState>,
}

impl Event {
    pub(crate) fn new(
        memory: Arc<HostVisibleMemory>,
        base: GpuAddr,
        desc: EventDesc,
        policy: EventPolicy,
        is_timestamp: bool,
    ) -> Result<Self> {
        let event = Self {
            memory,
            base,
            desc,
            policy,
            is_timestamp,
            state: Mutex::new(PacketState::initial()),
        };
        event.host_reset()?;
        Ok(event)
    }

    /// Address of packet 0
    pub fn gpu_address(&self) -> GpuAddr {
        self.base
    }

    /// Slot in the pool
    pub fn index(&self) -> u32 {
        self.desc.index
    }

    /// Pool allocation holding the packets
    pub fn allocation(&self) -> AllocationId {
        self.memory.allocation()
    }

    /// Packet policy
    pub fn policy(&self) -> &EventPolicy {
        &self.policy
    }

    /// Whether packets hold kernel timestamps
    pub fn is_timestamp(&self) -> bool {
        self.is_timestamp
    }

    /// Signal scope
    pub fn signal_scope(&self) -> SignalScope {
        self.desc.signal_scope
    }

    /// Wait scope
    pub fn wait_scope(&self) -> SignalScope {
        self.desc.wait_scope
    }

    /// Bytes per packet
    pub fn packet_size(&self) -> u32 {
        self.policy.packet_size
    }

    /// Packets per event
    pub fn max_packets(&self) -> u32 {
        self.policy.max_packets
    }

    /// Offset of the completion field inside a packet
    pub fn completion_offset(&self) -> u64 {
        if self.is_timestamp {
            TimestampPacket::CONTEXT_END
        } else {
            0
        }
    }

    /// Address of packet `index`
    pub fn packet_address(&self, index: u32) -> GpuAddr {
        self.base
            .offset(u64::from(index) * u64::from(self.policy.packet_size))
    }

    /// Address of the completion field of packet `index`
    pub fn completion_address(&self, index: u32) -> GpuAddr {
        self.packet_address(index).offset(self.completion_offset())
    }

    /// Address the host-visibility flush writes, if the last operation
    /// needed one
    pub fn l3_flush_address(&self) -> Option<GpuAddr> {
        match self.state.lock().accounting.l3_flush {
            L3FlushWrite::NotRequired => None,
            L3FlushWrite::FirstPacket => Some(self.completion_address(0)),
            L3FlushWrite::Packet(index) => Some(self.completion_address(index)),
        }
    }

    /// Account the packets of a signaling operation and make them current
    pub fn account(&self, kernel_count: u32, partition_count: u32) -> PacketAccounting {
        let accounting = account_packets(
            &self.policy,
            &PacketRequest {
                is_timestamp: self.is_timestamp,
                kernel_count,
                partition_count,
                scope: self.desc.signal_scope,
            },
        );
        self.state.lock().accounting = accounting;
        accounting
    }

    /// Accounting of the last signaling operation
    pub fn accounting(&self) -> PacketAccounting {
        self.state.lock().accounting
    }

    /// Packets the host must see signaled
    pub fn packets_in_use(&self) -> u32 {
        self.state.lock().accounting.packets_in_use
    }

    /// Packets signal and query cover
    pub fn packets_to_check(&self) -> u32 {
        if self.policy.signal_all_packets {
            self.policy.max_packets
        } else {
            self.packets_in_use()
        }
    }

    fn packet_signaled(&self, index: u32) -> Result<bool> {
        let value = self.memory.read_u64(self.completion_address(index))?;
        Ok(if self.is_timestamp {
            value != RESET_SENTINEL
        } else {
            value == SIGNALED_SENTINEL
        })
    }

    /// Poll the event
    pub fn query_status(&self) -> Result<EventStatus> {
        for index in 0..self.packets_to_check() {
            if !self.packet_signaled(index)? {
                return Ok(EventStatus::NotReady);
            }
        }
        Ok(EventStatus::Signaled)
    }

    /// Poll up to `max_polls` times
    pub fn host_synchronize(&self, max_polls: u64) -> Result<EventStatus> {
        for _ in 0..max_polls.max(1) {
            if self.query_status()? == EventStatus::Signaled {
                return Ok(EventStatus::Signaled);
            }
            core::hint::spin_loop();
        }
        Ok(EventStatus::NotReady)
    }

    /// Signal from the host
    pub fn host_signal(&self) -> Result<()> {
        for index in 0..self.packets_to_check() {
            self.memory
                .write_u64(self.completion_address(index), SIGNALED_SENTINEL)?;
        }
        Ok(())
    }

    /// Reset from the host: every packet back to [`RESET_SENTINEL`] and
    /// one packet in use
    pub fn host_reset(&self) -> Result<()> {
        self.memory
            .fill_u64(self.base, self.policy.event_size(), RESET_SENTINEL)?;
        self.state.lock().accounting = PacketState::initial().accounting;
        Ok(())
    }

    /// Timestamp packets the last operation wrote
    pub fn timestamp_packets(&self) -> Result<Vec<TimestampPacket>> {
        if !self.is_timestamp {
            return Err(Error::InvalidArgument);
        }
        let accounting = self.accounting();
        (0..accounting.kernel_packets().max(1))
            .map(|index| {
                let at = self.packet_address(index);
                Ok(TimestampPacket {
                    context_start: self.memory.read_u64(at.offset(TimestampPacket::CONTEXT_START))?,
                    global_start: self.memory.read_u64(at.offset(TimestampPacket::GLOBAL_START))?,
                    context_end: self.memory.read_u64(at.offset(TimestampPacket::CONTEXT_END))?,
                    global_end: self.memory.read_u64(at.offset(TimestampPacket::GLOBAL_END))?,
                })
            })
            .collect()
    }

    /// Execution interval of the last operation, `None` until signaled
    pub fn query_kernel_timestamp(&self) -> Result<Option<KernelTimestampResult>> {
        if self.query_status()? != EventStatus::Signaled {
            return Ok(None);
        }
        let packets = self.timestamp_packets()?;
        Ok(KernelTimestampResult::aggregate(&packets))
    }
}
