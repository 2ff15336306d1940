//! # Deferred Patches
//!
//! Addresses that are only known at submission time (scratch space, chain
//! targets) are recorded while encoding and resolved in one patch pass
//! before the buffer is handed to the submission boundary.
//!
//! ```text
//!   encode ──▶ PatchList::push(location, kind)
//!                         │
//!   submit ──▶ PatchList::apply(container, resolve) ──▶ BatchBufferDescriptor
//! ```

use alloc::vec::Vec;

use ember_core::{GpuAddr, Result};

use crate::cmds::{BatchBufferStart, FrontEndState};
use crate::container::{CmdLocation, CommandContainer};
use crate::stream::LinearStream;

/// What a patch location holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    /// Scratch base of a front end state command
    ScratchAddress,
    /// Target of a first-level batch buffer start
    JumpTarget,
}

impl PatchKind {
    /// Byte offset of the patched address inside the command
    pub const fn field_offset(self) -> usize {
        match self {
            Self::ScratchAddress => FrontEndState::SCRATCH_OFFSET,
            Self::JumpTarget => 4,
        }
    }

    /// Size of the command holding the field
    pub const fn command_size(self) -> usize {
        match self {
            Self::ScratchAddress => core::mem::size_of::<FrontEndState>(),
            Self::JumpTarget => core::mem::size_of::<BatchBufferStart>(),
        }
    }
}

/// A command whose address field is filled in later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRecord {
    /// Command location
    pub location: CmdLocation,
    /// Field kind
    pub kind: PatchKind,
}

/// Ordered list of deferred patches
#[derive(Debug, Clone, Default)]
pub struct PatchList {
    records: Vec<PatchRecord>,
}

/// Write `value` as low/high dwords into an encoded command
pub fn write_address(
    stream: &mut LinearStream,
    offset: usize,
    kind: PatchKind,
    value: GpuAddr,
) -> Result<()> {
    let field = offset + kind.field_offset();
    stream.patch_bytes(field, &value.low().to_le_bytes())?;
    stream.patch_bytes(field + 4, &value.high().to_le_bytes())
}

impl PatchList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a patch
    pub fn push(&mut self, location: CmdLocation, kind: PatchKind) {
        self.records.push(PatchRecord { location, kind });
    }

    /// Records in encode order
    pub fn records(&self) -> &[PatchRecord] {
        &self.records
    }

    /// Records of one kind
    pub fn of_kind(&self, kind: PatchKind) -> impl Iterator<Item = &PatchRecord> + '_ {
        self.records.iter().filter(move |r| r.kind == kind)
    }

    /// Whether any record has `kind`
    pub fn has(&self, kind: PatchKind) -> bool {
        self.records.iter().any(|r| r.kind == kind)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Resolve every record; kinds the resolver has no value for are left
    /// untouched. Returns the number of patched commands.
    pub fn apply<F>(&self, container: &mut CommandContainer, mut resolve: F) -> Result<usize>
    where
        F: FnMut(PatchKind) -> Option<GpuAddr>,
    {
        let mut patched = 0;
        for record in &self.records {
            let Some(value) = resolve(record.kind) else {
                continue;
            };
            let stream = container
                .buffer_mut(record.location.buffer)
                .ok_or(ember_core::Error::InvalidArgument)?;
            write_address(stream, record.location.offset, record.kind, value)?;
            patched += 1;
        }
        if patched > 0 {
            log::trace!("ember-cmd: resolved {} deferred patches", patched);
        }
        Ok(patched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    use ember_core::{ByteSize, HwFamily};
    use ember_mem::SvmManager;

    use crate::encoder::{FamilyEncoder, FrontEndModes, HwOp};

    #[test]
    fn test_scratch_patch_rewrites_front_end() {
        let Ok(mut container) = CommandContainer::new(
            Arc::new(SvmManager::default()),
            Arc::new(FamilyEncoder::new(HwFamily::XeHpCore)),
            ByteSize::KIB_4,
            ByteSize::KIB_4,
            8,
        ) else {
            panic!("container");
        };
        let at = container
            .emit(&HwOp::FrontEndState {
                scratch: GpuAddr::null(),
                max_threads: 64,
                modes: FrontEndModes::default(),
            })
            .unwrap_or(CmdLocation { buffer: 0, offset: 0 });

        let mut patches = PatchList::new();
        patches.push(at, PatchKind::ScratchAddress);
        assert!(patches.has(PatchKind::ScratchAddress));

        let applied = patches.apply(&mut container, |kind| match kind {
            PatchKind::ScratchAddress => Some(GpuAddr::new(0x7_0000_1000)),
            PatchKind::JumpTarget => None,
        });
        assert_eq!(applied, Ok(1));

        let fe = container.buffers()[0].read::<FrontEndState>(at.offset);
        assert_eq!(fe.map(|f| f.scratch()), Ok(GpuAddr::new(0x7_0000_1000)));
        assert_eq!(fe.map(|f| f.max_threads), Ok(64));
    }

    #[test]
    fn test_unresolved_kind_is_skipped() {
        let mut patches = PatchList::new();
        patches.push(CmdLocation { buffer: 3, offset: 0 }, PatchKind::JumpTarget);
        assert_eq!(patches.of_kind(PatchKind::JumpTarget).count(), 1);
        patches.clear();
        assert!(patches.is_empty());
    }
}
