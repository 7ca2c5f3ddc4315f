//! Cross-trace call stack equivalence.
//!
//! Raw addresses differ between runs, so stacks are compared on their
//! resolved function names only.

use crate::decoder::DecodedTrace;
use crate::types::{StackId, SymbolName};
use derive_more::{Deref, Display, From, Into};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Call stack id shared by all traces of a comparison
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, From, Into, Deref, Display,
)]
#[display(fmt = "{_0}")]
pub struct GlobalStackId(pub u32);

impl GlobalStackId {
    /// Stands for stacks no trace defines, real ids start at 1
    pub const UNMAPPED: Self = GlobalStackId(0);

    pub fn is_unmapped(&self) -> bool {
        *self == Self::UNMAPPED
    }
}

/// Resolved call stacks of one trace, keyed by local id
pub type SymbolizedStacks = BTreeMap<StackId, Vec<SymbolName>>;

#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct StackEquivalenceMapper {
    to_global: Vec<BTreeMap<StackId, GlobalStackId>>,
    to_local: Vec<HashMap<GlobalStackId, StackId>>,
    /// Indexed by global id - 1
    stacks: Vec<Vec<SymbolName>>,
}

impl StackEquivalenceMapper {
    pub fn new(traces: &[DecodedTrace]) -> Self {
        let symbolized: Vec<SymbolizedStacks> = traces.iter().map(symbolize).collect();
        Self::from_symbolized(&symbolized)
    }

    /// Assign global ids to already resolved stacks.
    ///
    /// Traces are processed in order. Each stack without a global id gets a
    /// fresh one, which is then given to the first unmapped stack with the same
    /// names in every later trace.
    pub fn from_symbolized(traces: &[SymbolizedStacks]) -> Self {
        let mut mapper = Self {
            to_global: vec![BTreeMap::new(); traces.len()],
            to_local: vec![HashMap::new(); traces.len()],
            stacks: Vec::new(),
        };

        for (ti, trace) in traces.iter().enumerate() {
            for (local, names) in trace.iter() {
                if mapper.to_global[ti].contains_key(local) {
                    continue;
                }
                let global = mapper.allocate(names.clone());
                mapper.assign(ti, *local, global);

                for (tj, later) in traces.iter().enumerate().skip(ti + 1) {
                    let found = later
                        .iter()
                        .find(|(id, other)| {
                            !mapper.to_global[tj].contains_key(*id) && *other == names
                        })
                        .map(|(id, _)| *id);
                    if let Some(id) = found {
                        mapper.assign(tj, id, global);
                    }
                }
            }
        }

        debug!(
            traces = traces.len(),
            global_stacks = mapper.stacks.len(),
            "Mapped call stacks"
        );
        mapper
    }

    pub fn trace_count(&self) -> usize {
        self.to_global.len()
    }

    /// Number of global ids handed out
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// All assigned global ids in ascending order
    pub fn global_ids(&self) -> impl Iterator<Item = GlobalStackId> {
        (1..=self.stacks.len() as u32).map(GlobalStackId)
    }

    /// [`GlobalStackId::UNMAPPED`] for out of range traces or unknown stacks
    pub fn global_id(&self, trace: usize, local: StackId) -> GlobalStackId {
        self.to_global
            .get(trace)
            .and_then(|m| m.get(&local))
            .copied()
            .unwrap_or(GlobalStackId::UNMAPPED)
    }

    pub fn local_id(&self, trace: usize, global: GlobalStackId) -> Option<StackId> {
        self.to_local.get(trace)?.get(&global).copied()
    }

    pub fn call_stack(&self, global: GlobalStackId) -> Option<&[SymbolName]> {
        let idx = global.0.checked_sub(1)?;
        self.stacks.get(idx as usize).map(Vec::as_slice)
    }

    fn allocate(&mut self, names: Vec<SymbolName>) -> GlobalStackId {
        self.stacks.push(names);
        GlobalStackId(self.stacks.len() as u32)
    }

    fn assign(&mut self, trace: usize, local: StackId, global: GlobalStackId) {
        self.to_global[trace].insert(local, global);
        self.to_local[trace].insert(global, local);
    }
}

/// Resolve every stack of a decoded trace
pub fn symbolize(trace: &DecodedTrace) -> SymbolizedStacks {
    trace
        .stacks
        .iter()
        .map(|(id, addrs)| (id, trace.functions.resolve_stack(addrs)))
        .collect()
}
