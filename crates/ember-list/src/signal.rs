//! # Events, Barriers and Timestamps
//!
//! Every signaling operation goes through the same three steps:
//!
//! ```text
//!   begin_signal ──▶ account packets, [timestamp start stores]
//!   operation    ──▶ walkers carry the completion write in their post-sync
//!   end_signal   ──▶ [barrier with completion write] [flush packet]
//!                    [timestamp end stores] [signal-all fill]
//! ```
//!
//! When the walkers cannot carry the write (several kernels under a
//! pipe-control sync policy, a compacted host flush, or an operation
//! without walkers), a barrier after the operation writes it instead.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ember_cmd::cmds::{CompareOp, FlushPostSync, TimestampPacket};
use ember_cmd::encoder::BlitCopyArgs;
use ember_cmd::{BuiltinKernel, HwOp, KernelArg, PipeControlFlags, PostSyncOp, WalkerPostSync};
use ember_core::{Error, GpuAddr, GroupCount, Result, UsmPtr};
use ember_event::timestamp::{END_WRITES, START_WRITES};
use ember_event::{
    Event, L3FlushWrite, PacketAccounting, PostSyncPlacement, RESET_SENTINEL, SIGNALED_SENTINEL,
};
use ember_scaling::SemaphoreTargets;

use crate::launch::KernelLaunch;
use crate::list::CommandList;

/// Signal bookkeeping of one operation
#[derive(Debug, Clone)]
pub(crate) struct SignalPlan {
    event: Arc<Event>,
    accounting: PacketAccounting,
    walker_writes: bool,
    bracket: bool,
}

impl SignalPlan {
    /// Post-sync of kernel split `kernel`
    pub(crate) fn walker_post_sync(&self, kernel: u32) -> WalkerPostSync {
        if !self.walker_writes {
            return WalkerPostSync::default();
        }
        let packet = self.accounting.kernel_packet(kernel);
        let dc_flush = matches!(self.accounting.l3_flush, L3FlushWrite::FirstPacket);
        if self.event.is_timestamp() {
            WalkerPostSync {
                op: PostSyncOp::Timestamp,
                address: self.event.packet_address(packet),
                data: 0,
                dc_flush,
            }
        } else {
            WalkerPostSync {
                op: PostSyncOp::WriteImmediate,
                address: self.event.completion_address(packet),
                data: SIGNALED_SENTINEL,
                dc_flush,
            }
        }
    }

    /// Per-partition completion values a partitioned walker may wait on
    pub(crate) fn semaphores(&self, kernel: u32) -> Option<SemaphoreTargets> {
        self.walker_writes.then(|| SemaphoreTargets {
            base: self
                .event
                .completion_address(self.accounting.kernel_packet(kernel)),
            stride: self.event.packet_size(),
            pending_value: RESET_SENTINEL as u32,
        })
    }
}

/// Size in bytes of one entry written by the timestamp query
pub const TIMESTAMP_RESULT_SIZE: u64 = core::mem::size_of::<TimestampPacket>() as u64;

impl CommandList {
    // =========================================================================
    // Shared signaling steps
    // =========================================================================

    fn barrier_partitions(&self) -> u32 {
        if self.scaling.policy().is_enabled() {
            self.scaling.policy().tile_count
        } else {
            1
        }
    }

    /// Semaphore waits until every packet of `events` is signaled
    pub(crate) fn wait_for_events(&mut self, events: &[Arc<Event>]) -> Result<()> {
        for event in events {
            self.container.residency_mut().push(event.allocation());
            let (value, op) = if event.is_timestamp() {
                (RESET_SENTINEL as u32, CompareOp::NotEqual)
            } else {
                (SIGNALED_SENTINEL as u32, CompareOp::Equal)
            };
            for index in 0..event.packets_to_check() {
                self.container.emit(&HwOp::SemaphoreWait {
                    address: event.completion_address(index),
                    value,
                    op,
                })?;
            }
        }
        Ok(())
    }

    /// Account `event` for an operation of `kernel_count` kernel splits.
    ///
    /// `walker_partitions` is the partition count every split was planned
    /// with, `None` for operations without walkers.
    pub(crate) fn begin_signal(
        &mut self,
        event: Option<&Arc<Event>>,
        kernel_count: u32,
        walker_partitions: Option<u32>,
    ) -> Result<Option<SignalPlan>> {
        let Some(event) = event else {
            return Ok(None);
        };
        self.container.residency_mut().push(event.allocation());

        let kernel_count = kernel_count.max(1);
        let placement = event
            .policy()
            .post_sync_placement(kernel_count, event.signal_scope());
        let partitions = match (placement, walker_partitions) {
            (PostSyncPlacement::Walker, Some(partitions)) => partitions,
            _ if self.engine.is_copy_only() => 1,
            _ => self.barrier_partitions(),
        };
        let accounting = event.account(kernel_count, partitions);

        let walker_writes = walker_partitions.is_some()
            && placement == PostSyncPlacement::Walker
            && (!event.is_timestamp()
                || (event.policy().unified_timestamp_post_sync
                    && accounting.kernel_ranges == kernel_count));
        let plan = SignalPlan {
            event: Arc::clone(event),
            accounting,
            walker_writes,
            bracket: event.is_timestamp() && !walker_writes,
        };
        if plan.bracket {
            self.store_timestamps(&plan, &START_WRITES)?;
        }
        Ok(Some(plan))
    }

    fn store_timestamps(&mut self, plan: &SignalPlan, writes: &[(u32, u64)]) -> Result<()> {
        for packet in 0..plan.accounting.kernel_packets() {
            let at = plan.event.packet_address(packet);
            for &(register, offset) in writes {
                self.container.emit(&HwOp::StoreRegisterMem {
                    register,
                    address: at.offset(offset),
                })?;
            }
        }
        Ok(())
    }

    /// Stall until prior work is done, optionally writing a value
    fn stall(
        &mut self,
        flags: PipeControlFlags,
        post_sync: Option<(GpuAddr, u64)>,
    ) -> Result<()> {
        if self.engine.is_copy_only() {
            let (address, post_sync) = match post_sync {
                Some((address, value)) => (address, FlushPostSync::WriteImmediate(value)),
                None => (GpuAddr::null(), FlushPostSync::None),
            };
            self.container.emit(&HwOp::FlushDw { address, post_sync })?;
        } else {
            self.scaling
                .dispatch_barrier(&mut self.container, flags, post_sync)?;
        }
        self.properties.has_stalling_commands = true;
        Ok(())
    }

    /// Complete the signal of an operation; `flags` are the barrier flags
    /// used when the completion write is deferred
    pub(crate) fn end_signal(
        &mut self,
        plan: Option<SignalPlan>,
        flags: PipeControlFlags,
    ) -> Result<()> {
        let Some(plan) = plan else {
            return Ok(());
        };
        let event = Arc::clone(&plan.event);
        let accounting = plan.accounting;
        let flush_first = matches!(accounting.l3_flush, L3FlushWrite::FirstPacket);

        if !plan.walker_writes {
            let mut flags = flags | PipeControlFlags::CS_STALL;
            if flush_first {
                flags |= PipeControlFlags::DC_FLUSH;
            }
            if plan.bracket {
                self.stall(flags, None)?;
                self.store_timestamps(&plan, &END_WRITES)?;
            } else {
                if accounting.packets_per_kernel > 1 {
                    flags |= PipeControlFlags::WORKLOAD_PARTITION_ID_OFFSET;
                }
                self.stall(flags, Some((event.completion_address(0), SIGNALED_SENTINEL)))?;
            }
        }

        if let L3FlushWrite::Packet(index) = accounting.l3_flush {
            self.stall(
                PipeControlFlags::CS_STALL | PipeControlFlags::DC_FLUSH,
                Some((event.completion_address(index), SIGNALED_SENTINEL)),
            )?;
        }

        if event.policy().signal_all_packets {
            for index in accounting.packets_in_use..event.max_packets() {
                self.container.emit(&HwOp::StoreDataImm {
                    address: event.completion_address(index),
                    value: SIGNALED_SENTINEL,
                    qword: true,
                })?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Make prior work complete and visible before later work starts
    pub fn append_barrier(&mut self, signal: Option<&Arc<Event>>, waits: &[Arc<Event>]) -> Result<()> {
        self.ensure_open()?;
        self.wait_for_events(waits)?;
        match self.begin_signal(signal, 1, None)? {
            Some(plan) => self.end_signal(Some(plan), PipeControlFlags::BARRIER)?,
            None => self.stall(PipeControlFlags::BARRIER, None)?,
        }
        self.mark_operation();
        Ok(())
    }

    /// Signal `event` once prior work completed
    pub fn append_signal_event(&mut self, event: &Arc<Event>) -> Result<()> {
        self.ensure_open()?;
        let plan = self.begin_signal(Some(event), 1, None)?;
        self.end_signal(plan, PipeControlFlags::CS_STALL)?;
        self.mark_operation();
        Ok(())
    }

    /// Return every packet of `event` to the reset sentinel
    pub fn append_event_reset(&mut self, event: &Arc<Event>) -> Result<()> {
        self.ensure_open()?;
        self.container.residency_mut().push(event.allocation());

        let offsets: &[u64] = if event.is_timestamp() {
            &[
                TimestampPacket::CONTEXT_START,
                TimestampPacket::GLOBAL_START,
                TimestampPacket::CONTEXT_END,
                TimestampPacket::GLOBAL_END,
            ]
        } else {
            &[0]
        };
        for index in 0..event.max_packets() {
            let packet = event.packet_address(index);
            for &offset in offsets {
                self.container.emit(&HwOp::StoreDataImm {
                    address: packet.offset(offset),
                    value: RESET_SENTINEL,
                    qword: true,
                })?;
            }
        }
        self.mark_operation();
        Ok(())
    }

    /// Stall until every event in `events` is signaled
    pub fn append_wait_on_events(&mut self, events: &[Arc<Event>]) -> Result<()> {
        self.ensure_open()?;
        if events.is_empty() {
            return Err(Error::InvalidArgument);
        }
        self.wait_for_events(events)?;
        self.mark_operation();
        Ok(())
    }

    /// Write `value` to `address` once prior work completed; used for the
    /// completion counter of in-order lists
    pub fn append_counter_update(&mut self, address: GpuAddr, value: u64) -> Result<()> {
        self.ensure_open()?;
        if !address.is_aligned(8) {
            return Err(Error::MisalignedAddress);
        }
        self.stall(PipeControlFlags::CS_STALL, Some((address, value)))?;
        self.mark_operation();
        Ok(())
    }

    /// Write the global timestamp into the qword at `dst`
    pub fn append_write_global_timestamp(
        &mut self,
        dst: UsmPtr,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.ensure_open()?;
        let address = self.resolve_range(dst, 8)?;
        if !address.is_aligned(8) {
            return Err(Error::MisalignedAddress);
        }
        self.wait_for_events(waits)?;
        let plan = self.begin_signal(signal, 1, None)?;

        if self.engine.is_copy_only() {
            self.container.emit(&HwOp::FlushDw {
                address,
                post_sync: FlushPostSync::Timestamp,
            })?;
        } else {
            self.container.emit(&HwOp::PipeControl {
                flags: PipeControlFlags::CS_STALL | PipeControlFlags::POST_SYNC_TIMESTAMP,
                address,
                data: 0,
            })?;
            self.properties.has_stalling_commands = true;
        }

        self.end_signal(plan, PipeControlFlags::CS_STALL)?;
        self.mark_operation();
        Ok(())
    }

    /// Copy the kernel timestamps of `events` into `dst`, one
    /// [`TIMESTAMP_RESULT_SIZE`] entry per event
    pub fn append_query_kernel_timestamps(
        &mut self,
        events: &[Arc<Event>],
        dst: UsmPtr,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.ensure_open()?;
        if events.is_empty() || events.iter().any(|e| !e.is_timestamp()) {
            return Err(Error::InvalidArgument);
        }
        let size = events.len() as u64 * TIMESTAMP_RESULT_SIZE;
        let dst = self.resolve_range(dst, size)?;
        for event in events {
            self.container.residency_mut().push(event.allocation());
        }

        if self.engine.is_copy_only() {
            self.wait_for_events(waits)?;
            let plan = self.begin_signal(signal, 1, None)?;
            for (i, event) in events.iter().enumerate() {
                self.container.emit(&HwOp::MemCopy(BlitCopyArgs {
                    src: event.packet_address(0),
                    dst: dst.offset(i as u64 * TIMESTAMP_RESULT_SIZE),
                    width: TIMESTAMP_RESULT_SIZE as u32,
                    height: 1,
                    src_pitch: TIMESTAMP_RESULT_SIZE as u32,
                    dst_pitch: TIMESTAMP_RESULT_SIZE as u32,
                }))?;
            }
            self.end_signal(plan, PipeControlFlags::CS_STALL)?;
            self.mark_operation();
            return Ok(());
        }

        // (first packet, packet count) per event, read by the query kernel
        let mut table = Vec::with_capacity(events.len() * 16);
        for event in events {
            table.extend_from_slice(&event.gpu_address().raw().to_le_bytes());
            let packets = u64::from(event.accounting().kernel_packets().max(1));
            table.extend_from_slice(&packets.to_le_bytes());
        }
        let (slot, _) = self.container.push_indirect(&table)?;

        let kernel = self.builtin_kernel(
            BuiltinKernel::QueryKernelTimestamps,
            &[
                KernelArg::Value(slot.gpu_address.raw()),
                KernelArg::Value(dst.raw()),
                KernelArg::Value(events.len() as u64),
                KernelArg::Value(u64::from(events[0].packet_size())),
            ],
        )?;
        let count = u32::try_from(events.len()).map_err(|_| Error::InvalidArgument)?;
        self.append_kernels(
            &[KernelLaunch {
                kernel: &kernel,
                group_count: GroupCount::linear(count),
                cooperative: false,
            }],
            signal,
            waits,
        )
    }
}
