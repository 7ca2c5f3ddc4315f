//! Per-process tracing context reached from the allocator hooks.
//!
//! The host interposes the allocator entry points and forwards each call to a
//! [`Tracer`], handing it a closure that performs the real allocation. Calls
//! made while the tracer is already running on the same thread (the tracer's
//! own allocations) pass straight through to the real allocator.

use crate::config::TraceConfig;
use crate::encoder::{self, TraceEncoder};
use crate::layout;
use crate::symbols::{DynamicSymbolSource, StackUnwinder, StaticSymbols, MAX_STACK_DEPTH};
use crate::time::{ElapsedTime, TimeDelta, TimerSchedule};
use crate::types::{Address, Bytes, RunData, StackId};
use derive_more::Display;
use std::cell::Cell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

thread_local! {
    static TRACE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Where a hook call stands with respect to tracing
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum GuardState {
    /// Tracing not started, or already finished
    #[display(fmt = "inactive")]
    Inactive,
    /// Calls on this thread are traced
    #[display(fmt = "active")]
    Active,
    /// This thread is inside the tracer, calls pass through
    #[display(fmt = "recursing")]
    Recursing,
}

/// Marks the current thread as inside the tracer for its lifetime
#[derive(Debug)]
pub struct ReentrancyGuard {
    _private: (),
}

impl ReentrancyGuard {
    /// `None` when the thread is already inside the tracer
    pub fn enter() -> Option<Self> {
        TRACE_DEPTH.with(|depth| {
            if depth.get() > 0 {
                None
            } else {
                depth.set(depth.get() + 1);
                Some(Self { _private: () })
            }
        })
    }

    pub fn depth() -> u32 {
        TRACE_DEPTH.with(Cell::get)
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        TRACE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Traced calls per entry point
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display)]
#[display(fmt = "mallocs {malloc} callocs {calloc} reallocs {realloc} frees {free}")]
pub struct HookCounters {
    pub malloc: u64,
    pub calloc: u64,
    pub realloc: u64,
    pub free: u64,
}

/// Application time between traced calls.
///
/// Time spent inside the tracer is excluded: a delta runs from the end of the
/// previous hook to the start of the current one.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EventClock {
    last_exit: Instant,
    app_elapsed: Duration,
}

impl EventClock {
    pub fn start() -> Self {
        Self {
            last_exit: Instant::now(),
            app_elapsed: Duration::ZERO,
        }
    }

    /// Application time accumulated up to the previous hook
    pub fn elapsed(&self) -> ElapsedTime {
        self.app_elapsed.into()
    }

    /// Account the application time up to `entry`
    pub fn enter(&mut self, entry: Instant) -> TimeDelta {
        let delta = entry.saturating_duration_since(self.last_exit);
        self.app_elapsed += delta;
        delta.into()
    }

    pub fn exit(&mut self) {
        self.last_exit = Instant::now();
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
enum Hook {
    Malloc,
    Calloc,
    Realloc,
    Free,
}

struct TracerState<W: Write> {
    encoder: Option<TraceEncoder<W>>,
    clock: EventClock,
    timer: TimerSchedule,
    counters: HookCounters,
    error: Option<encoder::Error>,
}

pub struct Tracer<W: Write> {
    state: Mutex<TracerState<W>>,
    unwinder: Option<Box<dyn StackUnwinder + Send + Sync>>,
    complex: bool,
    active: AtomicBool,
}

impl Tracer<BufWriter<File>> {
    /// Create `trace-<rank>.z` in `run_dir` and start a trace into it
    pub fn create<P: AsRef<Path>>(
        run_dir: P,
        run: &RunData,
        symbols: &StaticSymbols,
        config: &TraceConfig,
    ) -> Result<Self, encoder::Error> {
        let path = layout::trace_path(run_dir, run.rank);
        let file = File::create(&path).map_err(|source| encoder::Error::Create {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "Created trace file");
        Self::new(BufWriter::new(file), run, symbols, config)
    }
}

impl<W: Write> Tracer<W> {
    pub fn new(
        writer: W,
        run: &RunData,
        symbols: &StaticSymbols,
        config: &TraceConfig,
    ) -> Result<Self, encoder::Error> {
        let encoder = TraceEncoder::with_options(writer, run, symbols, config.encoder_options())?;
        Ok(Self {
            state: Mutex::new(TracerState {
                encoder: Some(encoder),
                clock: EventClock::start(),
                timer: config.timer_schedule(),
                counters: HookCounters::default(),
                error: None,
            }),
            unwinder: None,
            complex: config.complex,
            active: AtomicBool::new(false),
        })
    }

    /// Unwinder used to capture call stacks when complex tracing is enabled
    pub fn with_unwinder<U: StackUnwinder + Send + Sync + 'static>(mut self, unwinder: U) -> Self {
        self.unwinder = Some(Box::new(unwinder));
        self
    }

    /// Begin tracing, application time is counted from here
    pub fn start(&self) {
        let _guard = ReentrancyGuard::enter();
        self.lock().clock = EventClock::start();
        self.active.store(true, Ordering::SeqCst);
        if self.complex && self.unwinder.is_none() {
            warn!("Complex tracing without an unwinder, call stacks are not captured");
        }
        debug!(complex = self.complex, "Tracing started");
    }

    pub fn guard_state(&self) -> GuardState {
        if !self.active.load(Ordering::SeqCst) {
            GuardState::Inactive
        } else if ReentrancyGuard::depth() > 0 {
            GuardState::Recursing
        } else {
            GuardState::Active
        }
    }

    pub fn counters(&self) -> HookCounters {
        self.lock().counters
    }

    pub fn malloc<F: FnOnce() -> Address>(&self, size: usize, real: F) -> Address {
        let Some((_guard, entry)) = self.enter() else {
            return real();
        };
        self.trace(Hook::Malloc, entry, real, |enc, delta, stack_id, address| {
            enc.record_malloc(*address, delta, to_bytes(size), stack_id)
        })
    }

    pub fn calloc<F: FnOnce() -> Address>(&self, size: usize, count: usize, real: F) -> Address {
        let Some((_guard, entry)) = self.enter() else {
            return real();
        };
        self.trace(Hook::Calloc, entry, real, |enc, delta, stack_id, address| {
            enc.record_calloc(*address, delta, to_bytes(size.saturating_mul(count)), stack_id)
        })
    }

    pub fn realloc<F: FnOnce() -> Address>(&self, old: Address, size: usize, real: F) -> Address {
        let Some((_guard, entry)) = self.enter() else {
            return real();
        };
        self.trace(Hook::Realloc, entry, real, |enc, delta, _, address| {
            enc.record_realloc(old, *address, delta, to_bytes(size))
        })
    }

    pub fn free<F: FnOnce()>(&self, address: Address, real: F) {
        let Some((_guard, entry)) = self.enter() else {
            return real();
        };
        self.trace(Hook::Free, entry, real, |enc, delta, _, _| {
            enc.record_free(address, delta)
        })
    }

    /// Stop tracing and close the trace, returning the underlying writer.
    ///
    /// The first error hit while tracing, if any, is reported here.
    pub fn finish<S: DynamicSymbolSource + ?Sized>(&self, libraries: &S) -> Result<W, encoder::Error> {
        let _guard = ReentrancyGuard::enter();
        self.active.store(false, Ordering::SeqCst);
        let mut state = self.lock();
        debug!(counters = %state.counters, "Tracing finished");
        if let Some(e) = state.error.take() {
            state.encoder = None;
            return Err(e);
        }
        let encoder = state.encoder.take().ok_or(encoder::Error::Finished)?;
        encoder.finish(libraries)
    }

    fn enter(&self) -> Option<(ReentrancyGuard, Instant)> {
        if !self.active.load(Ordering::SeqCst) {
            return None;
        }
        let guard = ReentrancyGuard::enter()?;
        Some((guard, Instant::now()))
    }

    fn lock(&self) -> MutexGuard<'_, TracerState<W>> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run the real allocator call and record it as one step under the lock.
    ///
    /// An address released by `real` cannot be handed out to, and recorded
    /// by, another thread before this event is in the trace.
    fn trace<T, C, F>(&self, hook: Hook, entry: Instant, real: C, record: F) -> T
    where
        C: FnOnce() -> T,
        F: FnOnce(&mut TraceEncoder<W>, TimeDelta, StackId, &T) -> Result<(), encoder::Error>,
    {
        let mut guard = self.lock();
        let result = real();
        let state = &mut *guard;
        match hook {
            Hook::Malloc => state.counters.malloc += 1,
            Hook::Calloc => state.counters.calloc += 1,
            Hook::Realloc => state.counters.realloc += 1,
            Hook::Free => state.counters.free += 1,
        }

        if state.error.is_none() {
            if let Some(enc) = state.encoder.as_mut() {
                let outcome = Self::record_event(
                    enc,
                    &mut state.clock,
                    &mut state.timer,
                    self.capture_stack(hook),
                    entry,
                    |enc, delta, stack_id| record(enc, delta, stack_id, &result),
                );
                if let Err(e) = outcome {
                    error!(error = %e, "Tracing failed, further events are not recorded");
                    state.error = Some(e);
                }
            }
        }
        state.clock.exit();
        result
    }

    fn record_event<F>(
        enc: &mut TraceEncoder<W>,
        clock: &mut EventClock,
        timer: &mut TimerSchedule,
        stack: Option<Vec<Address>>,
        entry: Instant,
        record: F,
    ) -> Result<(), encoder::Error>
    where
        F: FnOnce(&mut TraceEncoder<W>, TimeDelta, StackId) -> Result<(), encoder::Error>,
    {
        if timer.tick() {
            enc.record_timer(clock.elapsed())?;
        }
        let delta = clock.enter(entry);
        let stack_id = match stack {
            Some(stack) => enc.intern_stack(stack)?,
            None => StackId::UNKNOWN,
        };
        record(enc, delta, stack_id)
    }

    fn capture_stack(&self, hook: Hook) -> Option<Vec<Address>> {
        if !self.complex || !matches!(hook, Hook::Malloc | Hook::Calloc) {
            return None;
        }
        let mut stack = self.unwinder.as_ref()?.unwind();
        stack.truncate(MAX_STACK_DEPTH);
        Some(stack)
    }
}

fn to_bytes(size: usize) -> Bytes {
    Bytes(i64::try_from(size).unwrap_or(i64::MAX))
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
    fn guard_blocks_reentry_on_the_same_thread() {
        assert_eq!(ReentrancyGuard::depth(), 0);
        {
            let outer = ReentrancyGuard::enter();
            assert!(outer.is_some());
            assert!(ReentrancyGuard::enter().is_none());
            assert_eq!(ReentrancyGuard::depth(), 1);
        }
        assert_eq!(ReentrancyGuard::depth(), 0);
        assert!(ReentrancyGuard::enter().is_some());
    }

    #[test]
    fn guard_state_transitions() {
        let tracer = Tracer::new(
            Vec::new(),
            &RunData::serial(),
            &StaticSymbols::default(),
            &TraceConfig::default(),
        )
        .unwrap();
        assert_eq!(tracer.guard_state(), GuardState::Inactive);
        tracer.start();
        assert_eq!(tracer.guard_state(), GuardState::Active);
        {
            let _g = ReentrancyGuard::enter();
            assert_eq!(tracer.guard_state(), GuardState::Recursing);
        }
        tracer.finish(&no_libraries).unwrap();
        assert_eq!(tracer.guard_state(), GuardState::Inactive);
        assert!(matches!(tracer.finish(&no_libraries), Err(encoder::Error::Finished)));
    }

    #[test]
    fn nested_calls_pass_through() {
        let tracer = Tracer::new(
            Vec::new(),
            &RunData::serial(),
            &StaticSymbols::default(),
            &TraceConfig::default(),
        )
        .unwrap();

        // Before start nothing is traced
        tracer.malloc(8, || Address(0x10));
        tracer.start();
        let addr = tracer.malloc(16, || tracer.malloc(4, || Address(0x30)));
        assert_eq!(addr, Address(0x30));
        tracer.free(addr, || ());
        assert_eq!(
            tracer.counters(),
            HookCounters {
                malloc: 1,
                calloc: 0,
                realloc: 0,
                free: 1,
            }
        );
    }
}
