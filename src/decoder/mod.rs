//! Trace decoder.
//!
//! Frames are decoded one at a time and every allocation event is applied to
//! an [`HwmTracker`] as it is read. Format errors end the stream: everything
//! decoded up to that point stays valid.

use crate::analysis::hwm::{HwmRecord, HwmTracker};
use crate::frame::{Event, EventKind, FrameKind};
use crate::stack_table::StackCatalog;
use crate::stream::StreamReader;
use crate::symbols::{ElfSymbol, FunctionMap, FunctionRange, StaticSymbols};
use crate::time::{ElapsedTime, TimeDelta};
use crate::types::{Address, AllocationId, Bytes, RunData, StackId, SymbolName, TrimmedString};
use byteordered::ByteOrdered;
use derive_more::Display;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, warn};

pub use error::Error;

pub mod error;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display)]
pub enum DecodeMode {
    /// Only `Data` frames are decoded, symbol frames are skipped unread
    #[default]
    #[display(fmt = "fast")]
    Fast,
    /// All frames are decoded so call stacks can be resolved
    #[display(fmt = "symbolic")]
    Symbolic,
}

/// Point at which a search pass stops accounting events
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum SearchTarget {
    #[display(fmt = "allocation {_0}")]
    AllocationId(AllocationId),
    #[display(fmt = "{_0} s")]
    ElapsedTime(ElapsedTime),
}

impl SearchTarget {
    fn reached(&self, tracker: &HwmTracker) -> bool {
        match self {
            SearchTarget::AllocationId(id) => tracker.sequence() >= *id,
            SearchTarget::ElapsedTime(t) => tracker.elapsed() >= *t,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct DecodeOptions {
    pub mode: DecodeMode,
    pub search: Option<SearchTarget>,
    /// Keep a consumption log for graphs and samples
    pub consumption_log: bool,
}

impl DecodeOptions {
    pub fn fast() -> Self {
        Self::default()
    }

    pub fn symbolic() -> Self {
        Self::default().with_mode(DecodeMode::Symbolic)
    }

    pub fn with_mode(mut self, mode: DecodeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_search(mut self, target: SearchTarget) -> Self {
        self.search = Some(target);
        self
    }

    pub fn with_consumption_log(mut self, enabled: bool) -> Self {
        self.consumption_log = enabled;
        self
    }
}

/// How decoding ended
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum StreamEnd {
    /// A `Z` frame
    #[display(fmt = "terminator")]
    Terminator,
    /// The compressed stream ran out between frames
    #[display(fmt = "end of stream")]
    EndOfStream,
    /// A tag this reader does not know, treated as a terminator
    #[display(fmt = "unknown tag 0x{_0:02X}")]
    UnknownTag(u8),
    /// A format or IO error, the decoded state up to it is kept
    #[display(fmt = "truncated ({reason})")]
    Truncated { reason: String },
}

impl StreamEnd {
    pub fn is_clean(&self) -> bool {
        matches!(self, StreamEnd::Terminator)
    }
}

pub struct TraceDecoder<R: Read> {
    reader: StreamReader<R>,
    opts: DecodeOptions,
    run: Option<RunData>,
    static_symbols: StaticSymbols,
    tracker: HwmTracker,
    functions: FunctionMap,
    stacks: StackCatalog,
    /// Bytes left in the current `Data` frame
    data_remaining: i64,
    search_reached: bool,
    end: Option<StreamEnd>,
}

impl TraceDecoder<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P, opts: DecodeOptions) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), mode = %opts.mode, "Opened trace");
        Ok(Self::new(BufReader::new(file), opts))
    }
}

impl<R: Read> TraceDecoder<R> {
    pub fn new(reader: R, opts: DecodeOptions) -> Self {
        let tracker = if opts.consumption_log {
            HwmTracker::with_consumption_log()
        } else {
            HwmTracker::new()
        };
        Self {
            reader: StreamReader::new(reader),
            opts,
            run: None,
            static_symbols: StaticSymbols::default(),
            tracker,
            functions: FunctionMap::new(),
            stacks: StackCatalog::new(),
            data_remaining: 0,
            search_reached: false,
            end: None,
        }
    }

    pub fn tracker(&self) -> &HwmTracker {
        &self.tracker
    }

    pub fn run_data(&self) -> Option<&RunData> {
        self.run.as_ref()
    }

    pub fn static_memory(&self) -> Bytes {
        self.static_symbols.static_memory
    }

    pub fn functions(&self) -> &FunctionMap {
        &self.functions
    }

    pub fn stacks(&self) -> &StackCatalog {
        &self.stacks
    }

    pub fn search_reached(&self) -> bool {
        self.search_reached
    }

    pub fn end(&self) -> Option<&StreamEnd> {
        self.end.as_ref()
    }

    /// Decode up to the next event, applying it to the tracker.
    ///
    /// Metadata frames are consumed along the way. Returns `None` once the
    /// stream has ended, see [`TraceDecoder::end`] for how.
    pub fn read_event(&mut self) -> Result<Option<Event>, Error> {
        loop {
            if self.end.is_some() {
                return Ok(None);
            }

            if self.data_remaining > 0 {
                if let Some(event) = self.read_data_event()? {
                    return Ok(Some(event));
                }
                continue;
            }

            let Some(tag) = self.reader.request_tag()? else {
                self.end = Some(StreamEnd::EndOfStream);
                continue;
            };
            let Some(kind) = FrameKind::from_tag(tag) else {
                warn!(tag, "Unknown frame tag, treating as end of trace");
                self.end = Some(StreamEnd::UnknownTag(tag));
                continue;
            };

            match kind {
                FrameKind::Finish => self.end = Some(StreamEnd::Terminator),
                FrameKind::Elf => self.read_elf()?,
                FrameKind::Cores => self.read_cores()?,
                FrameKind::Virtual => self.read_virtual()?,
                FrameKind::Stacks => self.read_stacks()?,
                FrameKind::Data => self.read_data_header()?,
                FrameKind::Timer => {
                    if let Some(event) = Event::read_payload(EventKind::Timer, &mut self.reader)? {
                        self.apply(&event);
                        return Ok(Some(event));
                    }
                }
            }
        }
    }

    /// Decode the remainder of the stream. Errors end the stream as
    /// [`StreamEnd::Truncated`].
    pub fn run(mut self) -> DecodedTrace {
        loop {
            match self.read_event() {
                Ok(Some(_)) => (),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Trace ended early");
                    self.end = Some(StreamEnd::Truncated {
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }
        self.finish()
    }

    /// Stop decoding and freeze the tracker
    pub fn finish(mut self) -> DecodedTrace {
        let hwm = self.tracker.finish();
        let end = self.end.unwrap_or(StreamEnd::EndOfStream);
        debug!(%hwm, %end, "Finished decoding");
        DecodedTrace {
            run: self.run.unwrap_or_default(),
            static_memory: self.static_symbols.static_memory,
            static_symbols: self.static_symbols,
            hwm,
            tracker: self.tracker,
            functions: self.functions,
            stacks: self.stacks,
            end,
            search_reached: self.search_reached,
        }
    }

    fn symbolic(&self) -> bool {
        self.opts.mode == DecodeMode::Symbolic
    }

    fn read_data_event(&mut self) -> Result<Option<Event>, Error> {
        let Some(tag) = self.reader.request_tag()? else {
            self.end = Some(StreamEnd::EndOfStream);
            return Ok(None);
        };
        let Some(kind) = EventKind::from_tag(tag) else {
            warn!(tag, "Unknown event tag, treating as end of trace");
            self.end = Some(StreamEnd::UnknownTag(tag));
            return Ok(None);
        };

        self.data_remaining -= kind.wire_size() as i64;
        if self.data_remaining < 0 {
            return Err(Error::EventOverrun {
                kind,
                overrun: -self.data_remaining,
            });
        }

        let Some(event) = Event::read_payload(kind, &mut self.reader)? else {
            self.end = Some(StreamEnd::Terminator);
            return Ok(None);
        };
        self.apply(&event);

        if let Some(target) = self.opts.search {
            if target.reached(&self.tracker) {
                debug!(
                    %target,
                    skipped = self.data_remaining,
                    "Search target reached"
                );
                self.reader.skip(self.data_remaining as u64)?;
                self.data_remaining = 0;
                self.search_reached = true;
            }
        }
        Ok(Some(event))
    }

    fn apply(&mut self, event: &Event) {
        if self.search_reached {
            return;
        }
        match event {
            Event::Malloc(e) | Event::Calloc(e) => {
                self.tracker
                    .add_allocation(e.address, e.size, e.stack_id, e.delta);
            }
            Event::Realloc(e) => {
                match self.tracker.get_allocation(e.old_address).map(|a| a.stack_id) {
                    None => {
                        self.tracker
                            .add_allocation(e.new_address, e.size, StackId::UNKNOWN, e.delta);
                    }
                    Some(stack_id) => {
                        self.tracker.add_free(e.old_address, TimeDelta::zero());
                        self.tracker
                            .add_allocation(e.new_address, e.size, stack_id, e.delta);
                    }
                }
            }
            Event::Free(e) => {
                self.tracker.add_free(e.address, e.delta);
            }
            Event::Timer(e) => self.tracker.set_elapsed(e.elapsed),
        }
    }

    fn read_frame_size(&mut self, kind: FrameKind) -> Result<i64, Error> {
        let size = ByteOrdered::native(&mut self.reader).read_i64()?;
        if size < 0 {
            return Err(Error::NegativeSize(kind, size));
        }
        Ok(size)
    }

    fn check_consumed(&self, kind: FrameKind, start: u64, declared: i64) -> Result<(), Error> {
        let consumed = self.reader.position() - start;
        if consumed != declared as u64 {
            return Err(Error::FrameLength {
                kind,
                declared,
                consumed,
            });
        }
        Ok(())
    }

    /// Read a length prefixed name, which has to fit in what is left of the
    /// frame started at `start`
    fn read_name(&mut self, kind: FrameKind, start: u64, declared: i64) -> Result<TrimmedString, Error> {
        let len = ByteOrdered::native(&mut self.reader).read_i32()?;
        let len = usize::try_from(len).map_err(|_| Error::NameLength(len))?;
        let remaining = declared.saturating_sub((self.reader.position() - start) as i64);
        if len as u64 > remaining.max(0) as u64 {
            return Err(Error::NameOverrun {
                kind,
                len,
                remaining,
            });
        }
        let mut buf = vec![0; len];
        self.reader.read_exact(&mut buf)?;
        Ok(TrimmedString::from_raw(&buf))
    }

    fn read_data_header(&mut self) -> Result<(), Error> {
        let size = self.read_frame_size(FrameKind::Data)?;
        if self.search_reached {
            self.reader.skip(size as u64)?;
        } else {
            self.data_remaining = size;
        }
        Ok(())
    }

    fn read_elf(&mut self) -> Result<(), Error> {
        let (static_memory, count, blob_size) = {
            let mut r = ByteOrdered::native(&mut self.reader);
            (r.read_i64()?, r.read_i32()?, r.read_i64()?)
        };
        if blob_size < 0 {
            return Err(Error::NegativeSize(FrameKind::Elf, blob_size));
        }
        self.static_symbols.static_memory = Bytes(static_memory);

        if !self.symbolic() || self.search_reached {
            self.reader.skip(blob_size as u64)?;
            return Ok(());
        }

        let start = self.reader.position();
        let mut symbols = Vec::new();
        for _ in 0..count.max(0) {
            let address = ByteOrdered::native(&mut self.reader).read_i64()?;
            let name = self.read_name(FrameKind::Elf, start, blob_size)?;
            symbols.push(ElfSymbol {
                address: Address(address),
                name: name.into(),
            });
        }
        self.check_consumed(FrameKind::Elf, start, blob_size)?;

        let catalog = StaticSymbols::new(static_memory, symbols);
        let ranges = catalog.ranges();
        debug!(
            symbols = catalog.symbols.len(),
            ranges = ranges.len(),
            "Decoded static symbols"
        );
        self.functions.extend(ranges);
        self.static_symbols = catalog;
        Ok(())
    }

    fn read_cores(&mut self) -> Result<(), Error> {
        let size = self.read_frame_size(FrameKind::Cores)?;
        let start = self.reader.position();
        let (rank, comm_size) = {
            let mut r = ByteOrdered::native(&mut self.reader);
            (r.read_i32()?, r.read_i32()?)
        };
        let name = self.read_name(FrameKind::Cores, start, size)?;
        self.check_consumed(FrameKind::Cores, start, size)?;

        let run = RunData::new(rank, comm_size, name.0);
        debug!(%run, "Decoded run data");
        self.run = Some(run);
        Ok(())
    }

    fn read_virtual(&mut self) -> Result<(), Error> {
        let size = self.read_frame_size(FrameKind::Virtual)?;
        if !self.symbolic() {
            self.reader.skip(size as u64)?;
            return Ok(());
        }

        let start = self.reader.position();
        let count = ByteOrdered::native(&mut self.reader).read_i32()?;
        for _ in 0..count.max(0) {
            let (lo, hi) = {
                let mut r = ByteOrdered::native(&mut self.reader);
                (r.read_i64()?, r.read_i64()?)
            };
            let name = self.read_name(FrameKind::Virtual, start, size)?;
            self.functions.insert(FunctionRange::new(lo, hi, name.0));
        }
        self.check_consumed(FrameKind::Virtual, start, size)?;
        debug!(count, functions = self.functions.len(), "Decoded library functions");
        Ok(())
    }

    fn read_stacks(&mut self) -> Result<(), Error> {
        let size = self.read_frame_size(FrameKind::Stacks)?;
        if !self.symbolic() || self.search_reached {
            self.reader.skip(size as u64)?;
            return Ok(());
        }

        let start = self.reader.position();
        let count = ByteOrdered::native(&mut self.reader).read_i32()?;
        self.stacks
            .read_entries(&mut self.reader, count.max(0) as usize)?;
        self.check_consumed(FrameKind::Stacks, start, size)?;
        debug!(count, total = self.stacks.len(), "Decoded call stacks");
        Ok(())
    }
}

/// Everything recovered from one trace file
#[derive(Clone, Debug)]
pub struct DecodedTrace {
    pub run: RunData,
    pub static_memory: Bytes,
    pub static_symbols: StaticSymbols,
    pub hwm: HwmRecord,
    pub tracker: HwmTracker,
    pub functions: FunctionMap,
    pub stacks: StackCatalog,
    pub end: StreamEnd,
    pub search_reached: bool,
}

impl DecodedTrace {
    /// Decode a whole trace file
    pub fn from_file<P: AsRef<Path>>(path: P, opts: DecodeOptions) -> Result<Self, Error> {
        Ok(TraceDecoder::open(path, opts)?.run())
    }

    pub fn from_reader<R: Read>(reader: R, opts: DecodeOptions) -> Self {
        TraceDecoder::new(reader, opts).run()
    }

    pub fn call_stack(&self, id: StackId) -> &[Address] {
        self.stacks.get(id).unwrap_or(&[])
    }

    /// Resolve a call stack to function names, innermost first
    pub fn call_stack_symbols(&self, id: StackId) -> Vec<SymbolName> {
        self.functions.resolve_stack(self.call_stack(id))
    }

    pub fn elapsed(&self) -> ElapsedTime {
        self.tracker.elapsed()
    }
}
