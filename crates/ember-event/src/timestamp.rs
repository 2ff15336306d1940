//! Kernel timestamp readback.

use ember_cmd::cmds::{regs, TimestampPacket};

/// Start and end of one clock domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimestampRange {
    /// Start tick
    pub start: u64,
    /// End tick
    pub end: u64,
}

/// Execution interval of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelTimestampResult {
    /// Global (device-wide) clock
    pub global: TimestampRange,
    /// Context clock
    pub context: TimestampRange,
}

impl KernelTimestampResult {
    /// Earliest start and latest end over several packets
    pub fn aggregate<'a, I>(packets: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a TimestampPacket>,
    {
        packets.into_iter().fold(None, |acc, p| {
            let this = Self {
                global: TimestampRange {
                    start: p.global_start,
                    end: p.global_end,
                },
                context: TimestampRange {
                    start: p.context_start,
                    end: p.context_end,
                },
            };
            Some(match acc {
                None => this,
                Some(a) => Self {
                    global: TimestampRange {
                        start: a.global.start.min(this.global.start),
                        end: a.global.end.max(this.global.end),
                    },
                    context: TimestampRange {
                        start: a.context.start.min(this.context.start),
                        end: a.context.end.max(this.context.end),
                    },
                },
            })
        })
    }
}

/// Register stores that fill the start half of a packet on families
/// without a unified timestamp post-sync
pub const START_WRITES: [(u32, u64); 2] = [
    (regs::CONTEXT_TIMESTAMP, TimestampPacket::CONTEXT_START),
    (regs::GLOBAL_TIMESTAMP, TimestampPacket::GLOBAL_START),
];

/// Register stores that fill the end half of a packet
pub const END_WRITES: [(u32, u64); 2] = [
    (regs::CONTEXT_TIMESTAMP, TimestampPacket::CONTEXT_END),
    (regs::GLOBAL_TIMESTAMP, TimestampPacket::GLOBAL_END),
];
