//! Trace encoder, one per traced process.
//!
//! Events are appended to an in-memory `Data` frame. When the buffer fills up,
//! or on [`TraceEncoder::finish`], the newly interned call stacks are written
//! as a `Stacks` frame, the `Data` frame size is patched in and both are
//! pushed through the compressor.

use crate::frame::{self, AllocEvent, Event, EventKind, FreeEvent, FrameKind, ReallocEvent, TimerEvent};
use crate::stack_table::StackTable;
use crate::stream::StreamWriter;
use crate::symbols::{DynamicSymbolSource, StaticSymbols, MAX_STACK_DEPTH};
use crate::time::{ElapsedTime, TimeDelta};
use crate::types::{Address, Bytes, RunData, StackId};
use std::io::Write;
use tracing::debug;

pub use error::Error;

pub mod error;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EncoderOptions {
    /// Capacity of the in-memory `Data` frame
    pub buffer_size: usize,
}

impl EncoderOptions {
    pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024 * 1024;

    /// Smallest usable buffer, one `Data` header and the largest event
    pub fn min_buffer_size() -> usize {
        frame::DATA_FORWARD + EventKind::max_wire_size() + 1
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
        }
    }
}

pub struct TraceEncoder<W: Write> {
    buffer: Vec<u8>,
    capacity: usize,
    stacks: StackTable,
    stream: StreamWriter<W>,
    flushes: u64,
}

impl<W: Write> TraceEncoder<W> {
    /// Start a trace, writing the `Elf` and `Cores` frames up front
    pub fn new(writer: W, run: &RunData, symbols: &StaticSymbols) -> Result<Self, Error> {
        Self::with_options(writer, run, symbols, EncoderOptions::default())
    }

    pub fn with_options(
        writer: W,
        run: &RunData,
        symbols: &StaticSymbols,
        opts: EncoderOptions,
    ) -> Result<Self, Error> {
        let capacity = opts.buffer_size.max(EncoderOptions::min_buffer_size());
        let mut stream = StreamWriter::new(writer);

        let mut header = Vec::new();
        frame::write_elf_frame(&mut header, symbols.static_memory, &symbols.symbols)?;
        frame::write_cores_frame(&mut header, run)?;
        stream.add_data(&header)?;
        debug!(
            %run,
            functions = symbols.symbols.len(),
            static_memory = %symbols.static_memory,
            capacity,
            "Started trace"
        );

        let mut enc = Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            stacks: StackTable::new(),
            stream,
            flushes: 0,
        };
        enc.init_buffer();
        Ok(enc)
    }

    pub fn stack_table(&self) -> &StackTable {
        &self.stacks
    }

    /// Number of buffer flushes so far
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Bytes currently held in the `Data` buffer, header included
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Intern a captured call stack, innermost frame first
    pub fn intern_stack(&mut self, addresses: Vec<Address>) -> Result<StackId, Error> {
        if addresses.len() > MAX_STACK_DEPTH {
            return Err(Error::StackTooDeep(addresses.len()));
        }
        Ok(self.stacks.intern(addresses))
    }

    pub fn record_malloc(
        &mut self,
        address: Address,
        delta: TimeDelta,
        size: Bytes,
        stack_id: StackId,
    ) -> Result<(), Error> {
        self.append(&Event::Malloc(AllocEvent {
            address,
            delta,
            size,
            stack_id,
        }))
    }

    pub fn record_calloc(
        &mut self,
        address: Address,
        delta: TimeDelta,
        size: Bytes,
        stack_id: StackId,
    ) -> Result<(), Error> {
        self.append(&Event::Calloc(AllocEvent {
            address,
            delta,
            size,
            stack_id,
        }))
    }

    pub fn record_realloc(
        &mut self,
        old_address: Address,
        new_address: Address,
        delta: TimeDelta,
        size: Bytes,
    ) -> Result<(), Error> {
        self.append(&Event::Realloc(ReallocEvent {
            old_address,
            new_address,
            delta,
            size,
        }))
    }

    pub fn record_free(&mut self, address: Address, delta: TimeDelta) -> Result<(), Error> {
        self.append(&Event::Free(FreeEvent { address, delta }))
    }

    pub fn record_timer(&mut self, elapsed: ElapsedTime) -> Result<(), Error> {
        self.append(&Event::Timer(TimerEvent { elapsed }))
    }

    pub fn append(&mut self, event: &Event) -> Result<(), Error> {
        self.ensure_space(event.wire_size())?;
        event.write(&mut self.buffer)?;
        Ok(())
    }

    /// Push the pending stacks and the current `Data` frame through the
    /// compressor, then start a fresh `Data` frame
    pub fn flush(&mut self) -> Result<(), Error> {
        let (count, entries) = self.stacks.drain_pending()?;
        if count != 0 {
            let mut stacks = Vec::with_capacity(frame::STACKS_FORWARD + entries.len());
            frame::write_stacks_frame(&mut stacks, count, &entries)?;
            self.stream.add_data(&stacks)?;
        }

        let frame_size = frame::wire_size(self.buffer.len() - frame::DATA_FORWARD)?;
        self.buffer[1..frame::DATA_FORWARD].copy_from_slice(&frame_size.to_ne_bytes());
        self.stream.add_data(&self.buffer)?;
        debug!(stacks = count, frame_size, "Flushed data frame");

        self.flushes += 1;
        self.init_buffer();
        Ok(())
    }

    /// Final flush, then the `Virtual` frame with the library address map and
    /// the terminators. Returns the underlying writer.
    pub fn finish<S: DynamicSymbolSource + ?Sized>(mut self, libraries: &S) -> Result<W, Error> {
        self.flush()?;

        let ranges = libraries.function_ranges();
        let mut tail = Vec::new();
        frame::write_virtual_frame(&mut tail, &ranges)?;
        frame::write_finish_frame(&mut tail)?;
        self.stream.add_data(&tail)?;
        debug!(
            libraries = ranges.len(),
            stacks = self.stacks.len(),
            bytes = self.stream.bytes_in(),
            "Finishing trace"
        );
        Ok(self.stream.finish()?)
    }

    fn init_buffer(&mut self) {
        self.buffer.clear();
        self.buffer.push(FrameKind::Data.tag());
        self.buffer.extend_from_slice(&0_i64.to_ne_bytes());
    }

    fn ensure_space(&mut self, size: usize) -> Result<(), Error> {
        if self.capacity - self.buffer.len() <= size {
            self.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::symbols::FunctionRange;
    use pretty_assertions::assert_eq;

    fn no_libraries() -> Vec<FunctionRange> {
        Vec::new()
    }

    #[test]
    fn buffer_size_is_clamped() {
        let enc = TraceEncoder::with_options(
            Vec::new(),
            &RunData::serial(),
            &StaticSymbols::default(),
            EncoderOptions::default().with_buffer_size(1),
        )
        .unwrap();
        assert_eq!(enc.capacity, EncoderOptions::min_buffer_size());
        assert_eq!(enc.buffered(), frame::DATA_FORWARD);
    }

    #[test]
    fn full_buffer_triggers_flush() {
        let mut enc = TraceEncoder::with_options(
            Vec::new(),
            &RunData::serial(),
            &StaticSymbols::default(),
            EncoderOptions::default().with_buffer_size(frame::DATA_FORWARD + 3 * 13),
        )
        .unwrap();
        for i in 0..3 {
            enc.record_free(Address(i), TimeDelta::zero()).unwrap();
        }
        // 9 + 26 used, 13 left which is not strictly more than 13
        assert_eq!(enc.flushes(), 1);
        assert_eq!(enc.buffered(), frame::DATA_FORWARD + 13);
        let out = enc.finish(&no_libraries).unwrap();
        assert!(!out.is_empty());
    }

    #[test]
    fn deep_stacks_are_rejected() {
        let mut enc =
            TraceEncoder::new(Vec::new(), &RunData::serial(), &StaticSymbols::default()).unwrap();
        let err = enc
            .intern_stack(vec![Address(1); MAX_STACK_DEPTH + 1])
            .unwrap_err();
        assert!(matches!(err, Error::StackTooDeep(_)));
        assert_eq!(enc.intern_stack(vec![Address(1); 3]).unwrap(), StackId(0));
    }
}
