//! # Command Parser
//!
//! Decodes command buffers back into typed commands. Used by tests and by
//! the `validation` feature to inspect what was emitted.
//!
//! The parser reads one or more [`Segment`]s of GPU memory. In follow mode
//! it behaves like the command streamer: a first-level jump into another
//! segment continues there, a second-level jump is a call that returns on
//! `BATCH_BUFFER_END`. Jumps inside the current segment (partition loops,
//! control-section skips) are never taken, so walking always terminates.

use alloc::vec::Vec;

use bytemuck::Pod;

use ember_core::{Error, GpuAddr, Result};

use crate::cmds::*;
use crate::stream::LinearStream;

// =============================================================================
// DECODED COMMANDS
// =============================================================================

/// A decoded command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Command {
    Noop,
    SetPredicate(SetPredicate),
    BatchBufferEnd,
    SemaphoreWait(SemaphoreWait),
    StoreDataImm(StoreDataImm),
    LoadRegisterImm(LoadRegisterImm),
    StoreRegisterMem(StoreRegisterMem),
    FlushDw(FlushDw),
    LoadRegisterMem(LoadRegisterMem),
    LoadRegisterReg(LoadRegisterReg),
    Atomic(Atomic),
    BatchBufferStart(BatchBufferStart),
    StateComputeMode(StateComputeMode),
    FrontEndState(FrontEndState),
    MemCopy(MemCopy),
    MemSet(MemSet),
    StateBaseAddress(StateBaseAddress),
    PipelineSelect(PipelineSelect),
    ComputeWalker(ComputeWalker),
    PipeControl(PipeControl),
}

impl Command {
    /// Opcode of the command
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Noop => CommandKind::Noop,
            Self::SetPredicate(_) => CommandKind::SetPredicate,
            Self::BatchBufferEnd => CommandKind::BatchBufferEnd,
            Self::SemaphoreWait(_) => CommandKind::SemaphoreWait,
            Self::StoreDataImm(_) => CommandKind::StoreDataImm,
            Self::LoadRegisterImm(_) => CommandKind::LoadRegisterImm,
            Self::StoreRegisterMem(_) => CommandKind::StoreRegisterMem,
            Self::FlushDw(_) => CommandKind::FlushDw,
            Self::LoadRegisterMem(_) => CommandKind::LoadRegisterMem,
            Self::LoadRegisterReg(_) => CommandKind::LoadRegisterReg,
            Self::Atomic(_) => CommandKind::Atomic,
            Self::BatchBufferStart(_) => CommandKind::BatchBufferStart,
            Self::StateComputeMode(_) => CommandKind::StateComputeMode,
            Self::FrontEndState(_) => CommandKind::FrontEndState,
            Self::MemCopy(_) => CommandKind::MemCopy,
            Self::MemSet(_) => CommandKind::MemSet,
            Self::StateBaseAddress(_) => CommandKind::StateBaseAddress,
            Self::PipelineSelect(_) => CommandKind::PipelineSelect,
            Self::ComputeWalker(_) => CommandKind::ComputeWalker,
            Self::PipeControl(_) => CommandKind::PipeControl,
        }
    }
}

/// A decoded command and where it was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedCommand {
    /// GPU address of the command
    pub address: GpuAddr,
    /// Decoded command
    pub command: Command,
}

// =============================================================================
// SEGMENTS
// =============================================================================

/// A range of GPU memory holding commands
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    /// GPU address of `bytes[0]`
    pub base: GpuAddr,
    /// Contents
    pub bytes: &'a [u8],
}

impl<'a> Segment<'a> {
    /// Segment at an address
    pub fn new(base: GpuAddr, bytes: &'a [u8]) -> Self {
        Self { base, bytes }
    }

    fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.base && addr - self.base < self.bytes.len() as u64
    }
}

impl<'a> From<&'a LinearStream> for Segment<'a> {
    fn from(stream: &'a LinearStream) -> Self {
        Self::new(stream.gpu_base(), stream.as_bytes())
    }
}

// =============================================================================
// PARSER
// =============================================================================

/// Decoder over a set of command segments
#[derive(Debug, Clone)]
pub struct CommandParser<'a> {
    segments: Vec<Segment<'a>>,
    follow: bool,
    limit: usize,
}

impl<'a> CommandParser<'a> {
    /// Parser over a single buffer
    pub fn new(segment: Segment<'a>) -> Self {
        Self::with_segments([segment])
    }

    /// Parser over several buffers
    pub fn with_segments<I: IntoIterator<Item = Segment<'a>>>(segments: I) -> Self {
        Self {
            segments: segments.into_iter().collect(),
            follow: false,
            limit: 1 << 20,
        }
    }

    /// Add a segment
    pub fn add_segment(&mut self, segment: Segment<'a>) {
        self.segments.push(segment);
    }

    /// Follow jumps into other segments and calls into second-level buffers
    pub fn follow_jumps(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    fn segment_of(&self, addr: GpuAddr) -> Option<usize> {
        self.segments.iter().position(|s| s.contains(addr))
    }

    /// Decode every command of the first segment
    pub fn parse(&self) -> Result<Vec<ParsedCommand>> {
        let start = self.segments.first().ok_or(Error::InvalidArgument)?.base;
        self.parse_from(start)
    }

    /// Decode starting at `start`
    pub fn parse_from(&self, start: GpuAddr) -> Result<Vec<ParsedCommand>> {
        let mut out = Vec::new();
        let mut returns: Vec<(usize, usize)> = Vec::new();
        let mut seg = self.segment_of(start).ok_or(Error::InvalidGpuAddress)?;
        let mut offset = (start - self.segments[seg].base) as usize;

        loop {
            if out.len() >= self.limit {
                return Err(Error::InvalidCommand);
            }
            let segment = self.segments[seg];
            if offset >= segment.bytes.len() {
                match returns.pop() {
                    Some((s, o)) if self.follow => {
                        seg = s;
                        offset = o;
                        continue;
                    }
                    _ => break,
                }
            }

            let address = segment.base.offset(offset as u64);
            let (command, size) = decode(&segment.bytes[offset..])?;
            offset += size;

            if !self.follow {
                out.push(ParsedCommand { address, command });
                continue;
            }

            match command {
                Command::BatchBufferEnd => {
                    out.push(ParsedCommand { address, command });
                    match returns.pop() {
                        Some((s, o)) => {
                            seg = s;
                            offset = o;
                        }
                        None => break,
                    }
                }
                Command::BatchBufferStart(bbs) if !bbs.is_predicated() => {
                    let target = bbs.target();
                    let same_segment = segment.contains(target);
                    if bbs.is_second_level() {
                        out.push(ParsedCommand { address, command });
                        returns.push((seg, offset));
                        seg = self.segment_of(target).ok_or(Error::InvalidGpuAddress)?;
                        offset = (target - self.segments[seg].base) as usize;
                    } else if same_segment {
                        out.push(ParsedCommand { address, command });
                    } else {
                        // Chain jump: continue in the target buffer
                        seg = self.segment_of(target).ok_or(Error::InvalidGpuAddress)?;
                        offset = (target - self.segments[seg].base) as usize;
                    }
                }
                _ => out.push(ParsedCommand { address, command }),
            }
        }

        Ok(out)
    }
}

fn read<T: Pod>(bytes: &[u8]) -> Result<T> {
    bytes
        .get(..core::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .ok_or(Error::InvalidCommand)
}

fn typed<T: HwCommand>(bytes: &[u8], dwords: u32) -> Result<T> {
    if dwords != T::DWORDS {
        return Err(Error::InvalidCommand);
    }
    read(bytes)
}

/// Decode one command, returning it and its size in bytes
pub fn decode(bytes: &[u8]) -> Result<(Command, usize)> {
    let raw: u32 = read(bytes)?;
    let dwords = header_dwords(raw);
    let kind = CommandKind::from_raw(header_opcode(raw)).ok_or(Error::InvalidCommand)?;

    let command = match kind {
        CommandKind::Noop => Command::Noop,
        CommandKind::BatchBufferEnd => Command::BatchBufferEnd,
        CommandKind::SetPredicate => Command::SetPredicate(typed(bytes, dwords)?),
        CommandKind::SemaphoreWait => Command::SemaphoreWait(typed(bytes, dwords)?),
        CommandKind::StoreDataImm => Command::StoreDataImm(typed(bytes, dwords)?),
        CommandKind::LoadRegisterImm => Command::LoadRegisterImm(typed(bytes, dwords)?),
        CommandKind::StoreRegisterMem => Command::StoreRegisterMem(typed(bytes, dwords)?),
        CommandKind::FlushDw => Command::FlushDw(typed(bytes, dwords)?),
        CommandKind::LoadRegisterMem => Command::LoadRegisterMem(typed(bytes, dwords)?),
        CommandKind::LoadRegisterReg => Command::LoadRegisterReg(typed(bytes, dwords)?),
        CommandKind::Atomic => Command::Atomic(typed(bytes, dwords)?),
        CommandKind::BatchBufferStart => Command::BatchBufferStart(typed(bytes, dwords)?),
        CommandKind::StateComputeMode => Command::StateComputeMode(typed(bytes, dwords)?),
        CommandKind::FrontEndState => Command::FrontEndState(typed(bytes, dwords)?),
        CommandKind::MemCopy => Command::MemCopy(typed(bytes, dwords)?),
        CommandKind::MemSet => Command::MemSet(typed(bytes, dwords)?),
        CommandKind::StateBaseAddress => Command::StateBaseAddress(typed(bytes, dwords)?),
        CommandKind::PipelineSelect => Command::PipelineSelect(typed(bytes, dwords)?),
        CommandKind::ComputeWalker => Command::ComputeWalker(typed(bytes, dwords)?),
        CommandKind::PipeControl => Command::PipeControl(typed(bytes, dwords)?),
    };

    Ok((command, dwords as usize * 4))
}

/// Commands of a given kind
pub fn filter_kind(commands: &[ParsedCommand], kind: CommandKind) -> Vec<ParsedCommand> {
    commands
        .iter()
        .filter(|c| c.command.kind() == kind)
        .copied()
        .collect()
}

/// Number of commands of a given kind
pub fn count_kind(commands: &[ParsedCommand], kind: CommandKind) -> usize {
    commands.iter().filter(|c| c.command.kind() == kind).count()
}

/// Commands with `Noop` padding removed
pub fn without_noops(commands: &[ParsedCommand]) -> Vec<Command> {
    commands
        .iter()
        .map(|c| c.command)
        .filter(|c| !matches!(c, Command::Noop))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::AllocationId;

    fn stream(base: u64) -> LinearStream {
        LinearStream::with_capacity(AllocationId::new(base), GpuAddr::new(base), 256)
    }

    #[test]
    fn test_linear_decode() {
        let mut s = stream(0x1000);
        let _ = s.write(&LoadRegisterImm::new(regs::WPARID, 3));
        let _ = s.write(&Noop::default());
        let _ = s.write(&BatchBufferEnd::new());

        let parsed = CommandParser::new(Segment::from(&s)).parse();
        let parsed = parsed.unwrap_or_default();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].address, GpuAddr::new(0x1000));
        assert!(matches!(parsed[0].command, Command::LoadRegisterImm(l) if l.value == 3));
        assert_eq!(parsed[2].command, Command::BatchBufferEnd);
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        let bytes = 0x7f00_0000u32.to_le_bytes();
        assert_eq!(decode(&bytes).err(), Some(Error::InvalidCommand));
    }

    #[test]
    fn test_follow_chain_jump() {
        let mut a = stream(0x1000);
        let mut b = stream(0x8000);
        let _ = a.write(&LoadRegisterImm::new(1, 1));
        let _ = a.write(&BatchBufferStart::new(b.gpu_base(), false, false));
        let _ = a.write(&LoadRegisterImm::new(9, 9));
        let _ = b.write(&LoadRegisterImm::new(2, 2));
        let _ = b.write(&BatchBufferEnd::new());

        let parsed = CommandParser::with_segments([Segment::from(&a), Segment::from(&b)])
            .follow_jumps(true)
            .parse()
            .unwrap_or_default();
        let regs_seen: Vec<u32> = parsed
            .iter()
            .filter_map(|c| match c.command {
                Command::LoadRegisterImm(l) => Some(l.register),
                _ => None,
            })
            .collect();
        assert_eq!(regs_seen, [1, 2]);
        assert_eq!(count_kind(&parsed, CommandKind::BatchBufferStart), 0);
    }

    #[test]
    fn test_follow_call_returns() {
        let mut ring = stream(0x1000);
        let mut list = stream(0x8000);
        let _ = ring.write(&BatchBufferStart::new(list.gpu_base(), true, false));
        let _ = ring.write(&LoadRegisterImm::new(5, 5));
        let _ = ring.write(&BatchBufferEnd::new());
        let _ = list.write(&LoadRegisterImm::new(4, 4));
        let _ = list.write(&BatchBufferEnd::new());

        let parsed = CommandParser::with_segments([Segment::from(&ring), Segment::from(&list)])
            .follow_jumps(true)
            .parse()
            .unwrap_or_default();
        let kinds: Vec<CommandKind> = parsed.iter().map(|c| c.command.kind()).collect();
        assert_eq!(
            kinds,
            [
                CommandKind::BatchBufferStart,
                CommandKind::LoadRegisterImm,
                CommandKind::BatchBufferEnd,
                CommandKind::LoadRegisterImm,
                CommandKind::BatchBufferEnd,
            ]
        );
    }

    #[test]
    fn test_jump_outside_segments_fails() {
        let mut a = stream(0x1000);
        let _ = a.write(&BatchBufferStart::new(GpuAddr::new(0xdead_0000), false, false));
        let parsed = CommandParser::new(Segment::from(&a)).follow_jumps(true).parse();
        assert_eq!(parsed.err(), Some(Error::InvalidGpuAddress));
    }
}
