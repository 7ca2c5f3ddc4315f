//! Binary layout of the trace protocol.
//!
//! Every frame starts with a one byte tag. Fixed size frames have a statically
//! known length, variable size frames carry their own length so a reader can
//! skip them without interpretation. All integers are host endian: the
//! producer and the consumer are expected to run on the same architecture.

use crate::symbols::{ElfSymbol, FunctionRange};
use crate::time::{ElapsedTime, TimeDelta};
use crate::types::{nul_terminated, Address, Bytes, RunData, StackId};
use byteordered::ByteOrdered;
use derive_more::Display;
use enum_iterator::{all, Sequence};
use std::io::{self, Read, Write};

/// Tag + frame size field of a `Data` frame
pub const DATA_FORWARD: usize = 1 + 8;
/// Tag + static memory + function count + blob size of an `Elf` frame
pub const ELF_FORWARD: usize = 1 + 8 + 4 + 8;
/// Tag + size + function count of a `Virtual` frame
pub const VIRTUAL_FORWARD: usize = 1 + 8 + 4;
/// Tag + size + stack count of a `Stacks` frame
pub const STACKS_FORWARD: usize = 1 + 8 + 4;
/// Tag + size + rank + comm size + name length of a `Cores` frame
pub const CORES_FORWARD: usize = 1 + 8 + 4 + 4 + 4;

/// Frames found at the top level of a stream
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Sequence)]
pub enum FrameKind {
    #[display(fmt = "ELF")]
    Elf,
    #[display(fmt = "CORES")]
    Cores,
    #[display(fmt = "VIRTUAL")]
    Virtual,
    #[display(fmt = "STACKS")]
    Stacks,
    #[display(fmt = "DATA")]
    Data,
    #[display(fmt = "TIMER")]
    Timer,
    #[display(fmt = "FINISH")]
    Finish,
}

impl FrameKind {
    pub const fn tag(self) -> u8 {
        use FrameKind::*;
        match self {
            Elf => b'E',
            Cores => b'C',
            Virtual => b'V',
            Stacks => b'S',
            Data => b'D',
            Timer => b'T',
            Finish => b'Z',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        all::<Self>().find(|k| k.tag() == tag)
    }
}

/// Frames found inside a `Data` frame.
///
/// Note that `Calloc` shares its tag with the top level `Cores` frame, the
/// nesting level disambiguates them.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Sequence)]
pub enum EventKind {
    #[display(fmt = "MALLOC")]
    Malloc,
    #[display(fmt = "CALLOC")]
    Calloc,
    #[display(fmt = "REALLOC")]
    Realloc,
    #[display(fmt = "FREE")]
    Free,
    #[display(fmt = "TIMER")]
    Timer,
    #[display(fmt = "FINISH")]
    Finish,
}

impl EventKind {
    pub const fn tag(self) -> u8 {
        use EventKind::*;
        match self {
            Malloc => b'M',
            Calloc => b'C',
            Realloc => b'R',
            Free => b'F',
            Timer => b'T',
            Finish => b'Z',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        all::<Self>().find(|k| k.tag() == tag)
    }

    /// Size on the wire, tag included
    pub const fn wire_size(self) -> usize {
        use EventKind::*;
        match self {
            Malloc | Calloc => 1 + 8 + 4 + 8 + 4,
            Realloc => 1 + 8 + 8 + 4 + 8,
            Free => 1 + 8 + 4,
            Timer => 1 + 8,
            Finish => 1,
        }
    }

    /// The largest fixed frame, used to size the encoder buffer
    pub fn max_wire_size() -> usize {
        all::<Self>().map(Self::wire_size).max().unwrap_or(0)
    }
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display(fmt = "[{delta}]:{address}:{size}:{stack_id}")]
pub struct AllocEvent {
    pub address: Address,
    pub delta: TimeDelta,
    pub size: Bytes,
    pub stack_id: StackId,
}

pub type MallocEvent = AllocEvent;
pub type CallocEvent = AllocEvent;

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display(fmt = "[{delta}]:{old_address}->{new_address}:{size}")]
pub struct ReallocEvent {
    pub old_address: Address,
    pub new_address: Address,
    pub delta: TimeDelta,
    pub size: Bytes,
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display(fmt = "[{delta}]:{address}")]
pub struct FreeEvent {
    pub address: Address,
    pub delta: TimeDelta,
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display(fmt = "{elapsed}")]
pub struct TimerEvent {
    pub elapsed: ElapsedTime,
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum Event {
    #[display(fmt = "Malloc({_0})")]
    Malloc(MallocEvent),
    #[display(fmt = "Calloc({_0})")]
    Calloc(CallocEvent),
    #[display(fmt = "Realloc({_0})")]
    Realloc(ReallocEvent),
    #[display(fmt = "Free({_0})")]
    Free(FreeEvent),
    #[display(fmt = "Timer({_0})")]
    Timer(TimerEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Malloc(_) => EventKind::Malloc,
            Event::Calloc(_) => EventKind::Calloc,
            Event::Realloc(_) => EventKind::Realloc,
            Event::Free(_) => EventKind::Free,
            Event::Timer(_) => EventKind::Timer,
        }
    }

    /// Time since the previous event, zero for timer restatements
    pub fn delta(&self) -> TimeDelta {
        match self {
            Event::Malloc(e) | Event::Calloc(e) => e.delta,
            Event::Realloc(e) => e.delta,
            Event::Free(e) => e.delta,
            Event::Timer(_) => TimeDelta::zero(),
        }
    }

    pub fn wire_size(&self) -> usize {
        self.kind().wire_size()
    }

    pub(crate) fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut w = ByteOrdered::native(w);
        w.write_u8(self.kind().tag())?;
        match self {
            Event::Malloc(e) | Event::Calloc(e) => {
                w.write_i64(e.address.0)?;
                w.write_f32(e.delta.as_secs())?;
                w.write_i64(e.size.0)?;
                w.write_i32(e.stack_id.0)?;
            }
            Event::Realloc(e) => {
                w.write_i64(e.old_address.0)?;
                w.write_i64(e.new_address.0)?;
                w.write_f32(e.delta.as_secs())?;
                w.write_i64(e.size.0)?;
            }
            Event::Free(e) => {
                w.write_i64(e.address.0)?;
                w.write_f32(e.delta.as_secs())?;
            }
            Event::Timer(e) => {
                w.write_f64(e.elapsed.as_secs())?;
            }
        }
        Ok(())
    }

    /// Read the payload following an already consumed tag.
    /// Returns `None` for the `Finish` marker, which has no payload.
    pub(crate) fn read_payload<R: Read>(kind: EventKind, r: &mut R) -> io::Result<Option<Self>> {
        let mut r = ByteOrdered::native(r);
        Ok(Some(match kind {
            EventKind::Malloc | EventKind::Calloc => {
                let event = AllocEvent {
                    address: Address(r.read_i64()?),
                    delta: TimeDelta::from_secs(r.read_f32()?),
                    size: Bytes(r.read_i64()?),
                    stack_id: StackId(r.read_i32()?),
                };
                if kind == EventKind::Malloc {
                    Event::Malloc(event)
                } else {
                    Event::Calloc(event)
                }
            }
            EventKind::Realloc => Event::Realloc(ReallocEvent {
                old_address: Address(r.read_i64()?),
                new_address: Address(r.read_i64()?),
                delta: TimeDelta::from_secs(r.read_f32()?),
                size: Bytes(r.read_i64()?),
            }),
            EventKind::Free => Event::Free(FreeEvent {
                address: Address(r.read_i64()?),
                delta: TimeDelta::from_secs(r.read_f32()?),
            }),
            EventKind::Timer => Event::Timer(TimerEvent {
                elapsed: ElapsedTime::from_secs(r.read_f64()?),
            }),
            EventKind::Finish => return Ok(None),
        }))
    }
}

pub(crate) fn write_elf_frame<W: Write>(
    w: &mut W,
    static_memory: Bytes,
    symbols: &[ElfSymbol],
) -> io::Result<()> {
    let mut blob = Vec::new();
    {
        let mut b = ByteOrdered::native(&mut blob);
        for sym in symbols.iter() {
            let name = nul_terminated(&sym.name);
            b.write_i64(sym.address.0)?;
            b.write_i32(wire_len(name.len())?)?;
            b.write_all(&name)?;
        }
    }

    let mut w = ByteOrdered::native(w);
    w.write_u8(FrameKind::Elf.tag())?;
    w.write_i64(static_memory.0)?;
    w.write_i32(wire_len(symbols.len())?)?;
    w.write_i64(wire_size(blob.len())?)?;
    w.write_all(&blob)?;
    Ok(())
}

pub(crate) fn write_virtual_frame<W: Write>(w: &mut W, ranges: &[FunctionRange]) -> io::Result<()> {
    let mut blob = Vec::new();
    {
        let mut b = ByteOrdered::native(&mut blob);
        for range in ranges.iter() {
            let name = nul_terminated(&range.name);
            b.write_i64(range.start.0)?;
            b.write_i64(range.end.0)?;
            b.write_i32(wire_len(name.len())?)?;
            b.write_all(&name)?;
        }
    }

    let mut w = ByteOrdered::native(w);
    w.write_u8(FrameKind::Virtual.tag())?;
    // Size covers the function count and the entries
    w.write_i64(wire_size(blob.len() + 4)?)?;
    w.write_i32(wire_len(ranges.len())?)?;
    w.write_all(&blob)?;
    Ok(())
}

pub(crate) fn write_stacks_frame<W: Write>(w: &mut W, count: usize, entries: &[u8]) -> io::Result<()> {
    let mut w = ByteOrdered::native(w);
    w.write_u8(FrameKind::Stacks.tag())?;
    w.write_i64(wire_size(entries.len() + 4)?)?;
    w.write_i32(wire_len(count)?)?;
    w.write_all(entries)?;
    Ok(())
}

pub(crate) fn write_cores_frame<W: Write>(w: &mut W, run: &RunData) -> io::Result<()> {
    let name = nul_terminated(&run.processor_name);
    let mut w = ByteOrdered::native(w);
    w.write_u8(FrameKind::Cores.tag())?;
    w.write_i64(wire_size(3 * 4 + name.len())?)?;
    w.write_i32(run.rank)?;
    w.write_i32(run.comm_size)?;
    w.write_i32(wire_len(name.len())?)?;
    w.write_all(&name)?;
    Ok(())
}

pub(crate) fn write_finish_frame<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(&[FrameKind::Finish.tag()])
}

pub(crate) fn wire_len(len: usize) -> io::Result<i32> {
    i32::try_from(len).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "count exceeds i32"))
}

pub(crate) fn wire_size(len: usize) -> io::Result<i64> {
    i64::try_from(len).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "size exceeds i64"))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frame_sizes() {
        assert_eq!(EventKind::Malloc.wire_size(), 25);
        assert_eq!(EventKind::Calloc.wire_size(), 25);
        assert_eq!(EventKind::Realloc.wire_size(), 29);
        assert_eq!(EventKind::Free.wire_size(), 13);
        assert_eq!(EventKind::Timer.wire_size(), 9);
        assert_eq!(EventKind::max_wire_size(), 29);
    }

    #[test]
    fn tags_disambiguate_by_level() {
        assert_eq!(FrameKind::from_tag(b'C'), Some(FrameKind::Cores));
        assert_eq!(EventKind::from_tag(b'C'), Some(EventKind::Calloc));
        assert_eq!(FrameKind::from_tag(b'M'), None);
        assert_eq!(EventKind::from_tag(b'E'), None);
        assert_eq!(FrameKind::from_tag(b'Z'), Some(FrameKind::Finish));
    }

    #[test]
    fn event_payload_sizes_match_wire_sizes() {
        let events = [
            Event::Malloc(AllocEvent {
                address: Address(0x1000),
                delta: TimeDelta::from_secs(0.5),
                size: Bytes(64),
                stack_id: StackId(2),
            }),
            Event::Realloc(ReallocEvent {
                old_address: Address(0x1000),
                new_address: Address(0x2000),
                delta: TimeDelta::from_secs(0.25),
                size: Bytes(128),
            }),
            Event::Free(FreeEvent {
                address: Address(0x2000),
                delta: TimeDelta::zero(),
            }),
            Event::Timer(TimerEvent {
                elapsed: ElapsedTime::from_secs(12.5),
            }),
        ];
        for event in events.iter() {
            let mut buf = Vec::new();
            event.write(&mut buf).unwrap();
            assert_eq!(buf.len(), event.wire_size());

            let kind = EventKind::from_tag(buf[0]).unwrap();
            let mut r = &buf[1..];
            let decoded = Event::read_payload(kind, &mut r).unwrap();
            assert_eq!(decoded.as_ref(), Some(event));
        }
    }

    #[test]
    fn cores_frame_layout() {
        let mut buf = Vec::new();
        write_cores_frame(&mut buf, &RunData::new(3, 8, "node")).unwrap();
        assert_eq!(buf.len(), CORES_FORWARD + 5);
        assert_eq!(buf[0], b'C');
        assert_eq!(i64::from_ne_bytes(buf[1..9].try_into().unwrap()), 12 + 5);
    }
}
