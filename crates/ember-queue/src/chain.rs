//! # List Chaining
//!
//! How the queue buffer reaches each command list.
//!
//! ```text
//!  batched:   queue ──call(2nd level)──▶ A ──BB_END──▶ back to queue
//!
//!  primary:   queue ──jump──▶ A ──jump──▶ B ──jump──▶ queue epilogue
//!                             (A's terminal patched to B when B needs
//!                              no preamble, else back to the queue)
//! ```

use ember_cmd::{CommandContainer, HwOp, PatchKind};
use ember_core::{Error, GpuAddr, Result};
use ember_list::CommandList;

/// Point a primary list's terminal jump at `target`
pub fn patch_terminal(list: &mut CommandList, target: GpuAddr) -> Result<()> {
    let patched = list.apply_patches(|kind| (kind == PatchKind::JumpTarget).then_some(target))?;
    if patched == 0 {
        return Err(Error::InvalidState);
    }
    log::trace!("ember-queue: list terminal jump -> {}", target);
    Ok(())
}

/// Enter a list from the queue buffer
pub fn emit_entry(container: &mut CommandContainer, list: &CommandList) -> Result<()> {
    container.emit(&HwOp::BatchBufferStart {
        target: list.start_address(),
        second_level: !list.uses_primary_batch_buffer(),
        predicated: false,
    })?;
    Ok(())
}

/// Tracks the primary list whose terminal jump is still unresolved
#[derive(Debug, Default)]
pub struct ListChain {
    pending: Option<usize>,
    direct_links: u32,
}

impl ListChain {
    /// No pending list
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the list waiting for a jump target
    pub fn pending(&self) -> Option<usize> {
        self.pending
    }

    /// Lists jumped into straight from their predecessor
    pub fn direct_links(&self) -> u32 {
        self.direct_links
    }

    /// Resolve the pending jump to `target`
    pub fn resolve(&mut self, lists: &mut [&mut CommandList], target: GpuAddr) -> Result<()> {
        if let Some(index) = self.pending.take() {
            let list = lists.get_mut(index).ok_or(Error::InvalidArgument)?;
            patch_terminal(list, target)?;
        }
        Ok(())
    }

    /// Link the pending list straight into `lists[next]`.
    ///
    /// Returns `false` when nothing is pending; the caller then enters the
    /// list from the queue buffer.
    pub fn link_direct(&mut self, lists: &mut [&mut CommandList], next: usize) -> Result<bool> {
        if self.pending.is_none() {
            return Ok(false);
        }
        let target = lists
            .get(next)
            .map(|list| list.start_address())
            .ok_or(Error::InvalidArgument)?;
        self.resolve(lists, target)?;
        self.direct_links += 1;
        Ok(true)
    }

    /// `lists[index]` was entered and ends with an unresolved jump
    pub fn enter(&mut self, index: usize) {
        self.pending = Some(index);
    }
}
