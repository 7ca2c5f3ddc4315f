//! High-water-mark tracking over a stream of allocation events.

use crate::time::{ElapsedTime, TimeDelta};
use crate::types::{Address, AllocationId, Bytes, StackId};
use derive_more::Display;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// An allocation currently held by the traced process
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display(fmt = "{address}:{size}:{stack_id}:{allocation_id}")]
pub struct LiveAllocation {
    pub address: Address,
    pub size: Bytes,
    pub stack_id: StackId,
    pub allocation_id: AllocationId,
}

/// Live allocations, stored in an arena of slots indexed by address
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct LiveTable {
    slots: Vec<Option<LiveAllocation>>,
    vacant: Vec<usize>,
    index: HashMap<Address, usize>,
}

impl LiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, address: Address) -> Option<&LiveAllocation> {
        self.index
            .get(&address)
            .and_then(|slot| self.slots[*slot].as_ref())
    }

    /// Insert an allocation, returning the entry it displaced at the same address
    pub fn insert(&mut self, alloc: LiveAllocation) -> Option<LiveAllocation> {
        if let Some(slot) = self.index.get(&alloc.address) {
            return self.slots[*slot].replace(alloc);
        }
        let slot = match self.vacant.pop() {
            Some(slot) => {
                self.slots[slot] = Some(alloc);
                slot
            }
            None => {
                self.slots.push(Some(alloc));
                self.slots.len() - 1
            }
        };
        self.index.insert(alloc.address, slot);
        None
    }

    pub fn remove(&mut self, address: Address) -> Option<LiveAllocation> {
        let slot = self.index.remove(&address)?;
        self.vacant.push(slot);
        self.slots[slot].take()
    }

    /// Live allocations in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &LiveAllocation> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Live allocations ordered by allocation id
    pub fn sorted(&self) -> Vec<LiveAllocation> {
        let mut allocs: Vec<LiveAllocation> = self.iter().copied().collect();
        allocs.sort_by_key(|a| a.allocation_id);
        allocs
    }
}

/// Point of maximum live memory
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display)]
#[display(fmt = "{peak_bytes} B at {peak_time} s (allocation {peak_allocation_id})")]
pub struct HwmRecord {
    pub peak_bytes: Bytes,
    pub peak_time: ElapsedTime,
    pub peak_allocation_id: AllocationId,
}

/// Live memory attributed to one call stack
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FunctionSiteAllocation {
    pub stack_id: StackId,
    pub bytes: Bytes,
    /// Individual allocation sizes, in allocation order
    pub allocations: Vec<Bytes>,
}

impl FunctionSiteAllocation {
    pub fn new(stack_id: StackId) -> Self {
        Self {
            stack_id,
            bytes: Bytes::zero(),
            allocations: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.allocations.len()
    }

    pub fn add(&mut self, size: Bytes) {
        self.bytes += size;
        self.allocations.push(size);
    }
}

/// Sort keys for function breakdowns
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum SiteOrder {
    /// Ascending stack id
    StackId,
    /// Descending bytes, ties broken by ascending stack id
    MemoryDescending,
}

impl SiteOrder {
    pub fn compare(self, a: &FunctionSiteAllocation, b: &FunctionSiteAllocation) -> Ordering {
        match self {
            SiteOrder::StackId => a.stack_id.cmp(&b.stack_id),
            SiteOrder::MemoryDescending => b
                .bytes
                .cmp(&a.bytes)
                .then_with(|| a.stack_id.cmp(&b.stack_id)),
        }
    }
}

/// Coarse grained `(time, live bytes)` history
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct ConsumptionLog {
    entries: Vec<(ElapsedTime, Bytes)>,
}

impl ConsumptionLog {
    /// Changes of this many bytes or fewer since the last retained entry are dropped
    pub const THRESHOLD: i64 = 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, time: ElapsedTime, live: Bytes) {
        let keep = match self.entries.last() {
            None => true,
            Some((_, last)) => (last.0 - live.0).abs() > Self::THRESHOLD,
        };
        if keep {
            self.entries.push((time, live));
        }
    }

    pub fn entries(&self) -> &[(ElapsedTime, Bytes)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collapse into `count` evenly spaced samples over `[0, total]`.
    ///
    /// Each sample is the last retained value whose time does not exceed the
    /// sample time, zero when there is none.
    pub fn samples(&self, count: usize, total: ElapsedTime) -> Vec<Bytes> {
        let step = if count > 1 {
            total.as_secs() / (count - 1) as f64
        } else {
            0.0
        };
        let mut out = Vec::with_capacity(count);
        let mut next = 0;
        let mut current = Bytes::zero();
        for i in 0..count {
            let t = step * i as f64;
            while let Some((time, live)) = self.entries.get(next) {
                if time.as_secs() > t {
                    break;
                }
                current = *live;
                next += 1;
            }
            out.push(current);
        }
        out
    }
}

#[derive(Clone, Debug, Default)]
pub struct HwmTracker {
    live: LiveTable,
    live_bytes: Bytes,
    elapsed: ElapsedTime,
    sequence: AllocationId,
    peak: HwmRecord,
    log: Option<ConsumptionLog>,
    finished: bool,
}

impl HwmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also keep a [`ConsumptionLog`] of the run
    pub fn with_consumption_log() -> Self {
        Self {
            log: Some(ConsumptionLog::new()),
            ..Default::default()
        }
    }

    pub fn add_allocation(
        &mut self,
        address: Address,
        size: Bytes,
        stack_id: StackId,
        delta: TimeDelta,
    ) -> AllocationId {
        if self.finished {
            debug!(%address, "Ignoring allocation after finish");
            return self.sequence;
        }

        if self.live.get(address).is_some() {
            // Memory only drops here, so this may be a peak
            self.check_peak();
            if let Some(stale) = self.live.remove(address) {
                debug!(%stale, "Retiring stale allocation at a reused address");
                self.live_bytes -= stale.size;
            }
        }

        self.sequence.increment();
        self.live_bytes += size;
        self.elapsed += delta;
        self.live.insert(LiveAllocation {
            address,
            size,
            stack_id,
            allocation_id: self.sequence,
        });
        self.log_point();
        self.sequence
    }

    pub fn add_free(&mut self, address: Address, delta: TimeDelta) -> AllocationId {
        if self.finished {
            debug!(%address, "Ignoring free after finish");
            return self.sequence;
        }

        self.check_peak();
        self.sequence.increment();
        self.elapsed += delta;
        match self.live.remove(address) {
            Some(alloc) => {
                self.live_bytes -= alloc.size;
                self.log_point();
            }
            None => debug!(%address, "Free of an untracked address"),
        }
        self.sequence
    }

    /// Restate the absolute elapsed time
    pub fn set_elapsed(&mut self, elapsed: ElapsedTime) {
        if !self.finished {
            self.elapsed = elapsed;
        }
    }

    /// Final peak check, no further events are accounted afterwards
    pub fn finish(&mut self) -> HwmRecord {
        if !self.finished {
            self.check_peak();
            self.finished = true;
        }
        self.peak
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn record(&self) -> HwmRecord {
        self.peak
    }

    pub fn live_bytes(&self) -> Bytes {
        self.live_bytes
    }

    pub fn elapsed(&self) -> ElapsedTime {
        self.elapsed
    }

    /// Id of the last accounted event
    pub fn sequence(&self) -> AllocationId {
        self.sequence
    }

    pub fn get_allocation(&self, address: Address) -> Option<&LiveAllocation> {
        self.live.get(address)
    }

    pub fn live(&self) -> &LiveTable {
        &self.live
    }

    pub fn consumption_log(&self) -> Option<&ConsumptionLog> {
        self.log.as_ref()
    }

    /// Group the live allocations by call stack
    pub fn function_breakdown(&self) -> Vec<FunctionSiteAllocation> {
        self.function_breakdown_by(SiteOrder::MemoryDescending)
    }

    pub fn function_breakdown_by(&self, order: SiteOrder) -> Vec<FunctionSiteAllocation> {
        let mut sites: BTreeMap<StackId, FunctionSiteAllocation> = BTreeMap::new();
        for alloc in self.live.sorted() {
            sites
                .entry(alloc.stack_id)
                .or_insert_with(|| FunctionSiteAllocation::new(alloc.stack_id))
                .add(alloc.size);
        }
        let mut sites: Vec<FunctionSiteAllocation> = sites.into_values().collect();
        sites.sort_by(|a, b| order.compare(a, b));
        sites
    }

    fn check_peak(&mut self) {
        if self.live_bytes > self.peak.peak_bytes {
            self.peak = HwmRecord {
                peak_bytes: self.live_bytes,
                peak_time: self.elapsed,
                peak_allocation_id: self.sequence,
            };
        }
    }

    fn log_point(&mut self) {
        if let Some(log) = self.log.as_mut() {
            log.record(self.elapsed, self.live_bytes);
        }
    }
}
