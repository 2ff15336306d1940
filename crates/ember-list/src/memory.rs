//! # Memory Copies and Fills
//!
//! Compute engines run built-in kernels; copy engines emit blits.
//!
//! ```text
//!   dst:  |··left··|··········middle (×16 B)··········|·right·|
//!         ^        ^ 64-byte aligned
//!         bytes     wide copy                          bytes
//! ```
//!
//! When the signal event cannot hold a packet per split the whole range is
//! copied by one byte-granular kernel.

use alloc::sync::Arc;

use arrayvec::ArrayVec;

use ember_cmd::cmds::MemCopy;
use ember_cmd::encoder::{BlitCopyArgs, BlitFillArgs};
use ember_cmd::{BuiltinKernel, HwOp, Kernel, KernelArg, PipeControlFlags};
use ember_core::{Error, GpuAddr, GroupCount, Result, UsmPtr};
use ember_event::{Event, MAX_KERNEL_SPLITS};

use crate::launch::KernelLaunch;
use crate::list::CommandList;

/// Alignment the wide copy kernel requires of its destination
pub const COPY_MIDDLE_ALIGNMENT: u64 = 64;

/// Bytes one work-item of the wide copy and immediate fill kernels moves
pub const WIDE_ELEMENT_SIZE: u64 = 16;

/// Longest pattern the pattern-fill kernel accepts
pub const MAX_FILL_PATTERN: usize = 128;

/// Longest pattern a blitter fill accepts
pub const MAX_BLIT_PATTERN: usize = 16;

/// Box within a pitched buffer, in bytes and rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyRegion {
    /// Byte offset within a row
    pub x: u32,
    /// Row
    pub y: u32,
    /// Slice
    pub z: u32,
    /// Bytes per row
    pub width: u32,
    /// Rows
    pub height: u32,
    /// Slices
    pub depth: u32,
}

impl CopyRegion {
    /// A 2D region
    pub const fn rect(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            z: 0,
            width,
            height,
            depth: 1,
        }
    }

    fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }

    fn same_extent(&self, other: &Self) -> bool {
        self.width == other.width && self.height == other.height && self.depth == other.depth
    }

    /// Offset of the region origin
    fn origin(&self, pitch: u32, slice_pitch: u32) -> u64 {
        u64::from(self.z) * u64::from(slice_pitch)
            + u64::from(self.y) * u64::from(pitch)
            + u64::from(self.x)
    }

    /// Bytes from the buffer start through the last byte of the region
    fn extent(&self, pitch: u32, slice_pitch: u32) -> u64 {
        u64::from(self.z + self.depth - 1) * u64::from(slice_pitch)
            + u64::from(self.y + self.height - 1) * u64::from(pitch)
            + u64::from(self.x + self.width)
    }

    fn fits(&self, pitch: u32, slice_pitch: u32) -> bool {
        let row = u64::from(self.x) + u64::from(self.width);
        let rows = u64::from(self.y) + u64::from(self.height);
        row <= u64::from(pitch) && (self.depth == 1 || rows * u64::from(pitch) <= u64::from(slice_pitch))
    }
}

fn groups(work_items: u64, width: u32) -> Result<GroupCount> {
    let x = u32::try_from(work_items.div_ceil(u64::from(width))).map_err(|_| Error::InvalidArgument)?;
    Ok(GroupCount::linear(x))
}

fn immediate_pattern(pattern: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    for (i, byte) in word.iter_mut().enumerate() {
        *byte = pattern[i % pattern.len()];
    }
    u32::from_le_bytes(word)
}

impl CommandList {
    /// Translate `[ptr, ptr + size)` to a GPU address and make its
    /// allocation resident
    pub(crate) fn resolve_range(&mut self, ptr: UsmPtr, size: u64) -> Result<GpuAddr> {
        if ptr.is_null() {
            return Err(Error::InvalidNullPointer);
        }
        match self.device.memory().resolve(ptr, size) {
            Some(resolved) => {
                if let Some(id) = resolved.id {
                    self.container.residency_mut().push(id);
                }
                Ok(resolved.gpu_address)
            }
            None if self.device.memory().shared_system_fallback() => Ok(GpuAddr::new(ptr.raw())),
            None => {
                log::warn!("ember-list: {:#x}+{} is not device memory", ptr.raw(), size);
                Err(Error::OutOfDeviceMemory)
            }
        }
    }

    /// Splits `signal` can account with walkers planned over `largest`
    fn split_budget(&self, signal: Option<&Arc<Event>>, largest: GroupCount) -> u32 {
        match signal {
            Some(event) => {
                let plan = self.scaling.plan(GroupCount::default(), largest, false);
                event
                    .policy()
                    .max_kernel_splits(plan.partition_count, event.signal_scope())
            }
            None => MAX_KERNEL_SPLITS,
        }
    }

    fn run_builtins(
        &mut self,
        kernels: &[(Kernel, GroupCount)],
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        let launches: ArrayVec<KernelLaunch<'_>, { MAX_KERNEL_SPLITS as usize }> = kernels
            .iter()
            .map(|(kernel, group_count)| KernelLaunch {
                kernel,
                group_count: *group_count,
                cooperative: false,
            })
            .collect();
        self.append_kernels(&launches, signal, waits)
    }

    fn blit(
        &mut self,
        ops: impl IntoIterator<Item = HwOp>,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.wait_for_events(waits)?;
        let plan = self.begin_signal(signal, 1, None)?;
        for op in ops {
            self.container.emit(&op)?;
        }
        self.end_signal(plan, PipeControlFlags::empty())?;
        self.mark_operation();
        Ok(())
    }

    // =========================================================================
    // Copy
    // =========================================================================

    /// Copy `size` bytes from `src` to `dst`
    pub fn append_memory_copy(
        &mut self,
        dst: UsmPtr,
        src: UsmPtr,
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.ensure_open()?;
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let dst = self.resolve_range(dst, size)?;
        let src = self.resolve_range(src, size)?;

        if self.engine.is_copy_only() {
            return self.blit(linear_blits(src, dst, size), signal, waits);
        }

        let left = ((COPY_MIDDLE_ALIGNMENT - dst.raw() % COPY_MIDDLE_ALIGNMENT) % COPY_MIDDLE_ALIGNMENT).min(size);
        let middle = (size - left) / WIDE_ELEMENT_SIZE * WIDE_ELEMENT_SIZE;
        let right = size - left - middle;

        let wide = BuiltinKernel::CopyBufferMiddle.group_width();
        let largest = groups(middle / WIDE_ELEMENT_SIZE, wide)?;
        let splits = [left, middle, right].iter().filter(|&&s| s > 0).count() as u32;

        let mut kernels: ArrayVec<(Kernel, GroupCount), { MAX_KERNEL_SPLITS as usize }> = ArrayVec::new();
        if splits > self.split_budget(signal, largest) {
            log::debug!("ember-list: copy of {size} bytes collapsed to one kernel");
            kernels.push(self.copy_bytes(src, dst, size)?);
        } else {
            if left > 0 {
                kernels.push(self.copy_bytes(src, dst, left)?);
            }
            if middle > 0 {
                let kernel = self.builtin_kernel(
                    BuiltinKernel::CopyBufferMiddle,
                    &[
                        KernelArg::Value(src.offset(left).raw()),
                        KernelArg::Value(dst.offset(left).raw()),
                        KernelArg::Value(middle / WIDE_ELEMENT_SIZE),
                    ],
                )?;
                kernels.push((kernel, largest));
            }
            if right > 0 {
                let at = left + middle;
                kernels.push(self.copy_bytes(src.offset(at), dst.offset(at), right)?);
            }
        }
        self.run_builtins(&kernels, signal, waits)
    }

    fn copy_bytes(&self, src: GpuAddr, dst: GpuAddr, size: u64) -> Result<(Kernel, GroupCount)> {
        let kernel = self.builtin_kernel(
            BuiltinKernel::CopyBufferBytes,
            &[
                KernelArg::Value(src.raw()),
                KernelArg::Value(dst.raw()),
                KernelArg::Value(size),
            ],
        )?;
        Ok((kernel, groups(size, BuiltinKernel::CopyBufferBytes.group_width())?))
    }

    /// Copy a 2D or 3D region between pitched buffers
    pub fn append_memory_copy_region(
        &mut self,
        dst: UsmPtr,
        dst_region: &CopyRegion,
        dst_pitch: u32,
        dst_slice_pitch: u32,
        src: UsmPtr,
        src_region: &CopyRegion,
        src_pitch: u32,
        src_slice_pitch: u32,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.ensure_open()?;
        if dst_region.is_empty()
            || !dst_region.same_extent(src_region)
            || !dst_region.fits(dst_pitch, dst_slice_pitch)
            || !src_region.fits(src_pitch, src_slice_pitch)
        {
            return Err(Error::InvalidArgument);
        }
        let dst = self.resolve_range(dst, dst_region.extent(dst_pitch, dst_slice_pitch))?;
        let src = self.resolve_range(src, src_region.extent(src_pitch, src_slice_pitch))?;
        let dst_origin = dst.offset(dst_region.origin(dst_pitch, dst_slice_pitch));
        let src_origin = src.offset(src_region.origin(src_pitch, src_slice_pitch));

        if self.engine.is_copy_only() {
            let region = *dst_region;
            let blits = (0..region.depth).map(move |z| {
                HwOp::MemCopy(BlitCopyArgs {
                    src: src_origin.offset(u64::from(z) * u64::from(src_slice_pitch)),
                    dst: dst_origin.offset(u64::from(z) * u64::from(dst_slice_pitch)),
                    width: region.width,
                    height: region.height,
                    src_pitch,
                    dst_pitch,
                })
            });
            return self.blit(blits, signal, waits);
        }

        let (builtin, depth) = if dst_region.depth > 1 {
            (BuiltinKernel::CopyBufferRegion3d, dst_region.depth)
        } else {
            (BuiltinKernel::CopyBufferRegion2d, 1)
        };
        let mut args: ArrayVec<KernelArg, 6> = ArrayVec::new();
        args.push(KernelArg::Value(src_origin.raw()));
        args.push(KernelArg::Value(dst_origin.raw()));
        args.push(KernelArg::Value(u64::from(src_pitch)));
        args.push(KernelArg::Value(u64::from(dst_pitch)));
        if depth > 1 {
            args.push(KernelArg::Value(u64::from(src_slice_pitch)));
            args.push(KernelArg::Value(u64::from(dst_slice_pitch)));
        }
        let kernel = self.builtin_kernel(builtin, &args)?;
        let group_count = GroupCount::new(
            dst_region.width.div_ceil(builtin.group_width()),
            dst_region.height,
            depth,
        );
        self.run_builtins(&[(kernel, group_count)], signal, waits)
    }

    // =========================================================================
    // Fill
    // =========================================================================

    /// Fill `size` bytes at `ptr` with repetitions of `pattern`
    pub fn append_memory_fill(
        &mut self,
        ptr: UsmPtr,
        pattern: &[u8],
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        self.ensure_open()?;
        let len = pattern.len();
        if size == 0 || len == 0 || !len.is_power_of_two() || size % len as u64 != 0 {
            return Err(Error::InvalidArgument);
        }
        let dst = self.resolve_range(ptr, size)?;

        if self.engine.is_copy_only() {
            if len > MAX_BLIT_PATTERN {
                return Err(Error::InvalidArgument);
            }
            let mut bytes = [0u8; MAX_BLIT_PATTERN];
            bytes[..len].copy_from_slice(pattern);
            let fills = linear_blits(dst, dst, size).map(move |op| match op {
                HwOp::MemCopy(args) => HwOp::MemSet(BlitFillArgs {
                    dst: args.dst,
                    width: args.width,
                    height: args.height,
                    pitch: args.dst_pitch,
                    pattern: bytes,
                    pattern_size: len as u32,
                }),
                other => other,
            });
            return self.blit(fills, signal, waits);
        }

        if len > MAX_FILL_PATTERN {
            return Err(Error::InvalidArgument);
        }
        let mut kernels: ArrayVec<(Kernel, GroupCount), { MAX_KERNEL_SPLITS as usize }> = ArrayVec::new();
        if len <= 4 {
            let value = u64::from(immediate_pattern(pattern));
            let body = size / WIDE_ELEMENT_SIZE * WIDE_ELEMENT_SIZE;
            let leftover = size - body;
            let width = BuiltinKernel::FillBufferImmediate.group_width();
            let largest = groups(body / WIDE_ELEMENT_SIZE, width)?;
            let splits = u32::from(body > 0) + u32::from(leftover > 0);

            if splits > self.split_budget(signal, largest) {
                kernels.push(self.fill_leftover(dst, value, size)?);
            } else {
                if body > 0 {
                    let kernel = self.builtin_kernel(
                        BuiltinKernel::FillBufferImmediate,
                        &[
                            KernelArg::Value(dst.raw()),
                            KernelArg::Value(body / WIDE_ELEMENT_SIZE),
                            KernelArg::Value(value),
                        ],
                    )?;
                    kernels.push((kernel, largest));
                }
                if leftover > 0 {
                    kernels.push(self.fill_leftover(dst.offset(body), value, leftover)?);
                }
            }
        } else {
            let (slot, _) = self.container.push_indirect(pattern)?;
            let repeats = size / len as u64;
            let kernel = self.builtin_kernel(
                BuiltinKernel::FillBufferPattern,
                &[
                    KernelArg::Value(dst.raw()),
                    KernelArg::Value(slot.gpu_address.raw()),
                    KernelArg::Value(len as u64),
                    KernelArg::Value(repeats),
                ],
            )?;
            let group_count = groups(repeats, BuiltinKernel::FillBufferPattern.group_width())?;
            kernels.push((kernel, group_count));
        }
        self.run_builtins(&kernels, signal, waits)
    }

    fn fill_leftover(&self, dst: GpuAddr, value: u64, size: u64) -> Result<(Kernel, GroupCount)> {
        let kernel = self.builtin_kernel(
            BuiltinKernel::FillBufferImmediateLeftover,
            &[
                KernelArg::Value(dst.raw()),
                KernelArg::Value(value),
                KernelArg::Value(size),
            ],
        )?;
        let width = BuiltinKernel::FillBufferImmediateLeftover.group_width();
        Ok((kernel, groups(size, width)?))
    }
}

/// Blits covering `size` contiguous bytes, as few as the width and height
/// limits allow
fn linear_blits(src: GpuAddr, dst: GpuAddr, size: u64) -> impl Iterator<Item = HwOp> {
    let max_width = u64::from(MemCopy::MAX_WIDTH);
    let mut done = 0u64;
    core::iter::from_fn(move || {
        let remaining = size - done;
        if remaining == 0 {
            return None;
        }
        let (width, height) = if remaining >= max_width {
            (max_width, (remaining / max_width).min(u64::from(MemCopy::MAX_HEIGHT)))
        } else {
            (remaining, 1)
        };
        let op = HwOp::MemCopy(BlitCopyArgs {
            src: src.offset(done),
            dst: dst.offset(done),
            width: width as u32,
            height: height as u32,
            src_pitch: width as u32,
            dst_pitch: width as u32,
        });
        done += width * height;
        Some(op)
    })
}
