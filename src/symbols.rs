//! Function symbol tables and the providers that feed them.
//!
//! Parsing ELF symbol tables, reading the loaded library map and unwinding the
//! stack are left to the host process. They plug in through the traits below.

use crate::types::{Address, Bytes, SymbolName};
use derive_more::Display;
use std::collections::BTreeMap;
use tracing::debug;

/// Maximum call stack depth an unwinder is expected to produce
pub const MAX_STACK_DEPTH: usize = 1000;

/// Start address and name of a function in the static binary
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display(fmt = "{address}:{name}")]
pub struct ElfSymbol {
    pub address: Address,
    pub name: SymbolName,
}

impl ElfSymbol {
    /// Marks the start of the text section
    pub const TEXT_START: &'static str = "_init";
    /// Marks the end of the text section
    pub const TEXT_END: &'static str = "_end";

    pub fn new<S: Into<String>>(address: i64, name: S) -> Self {
        Self {
            address: Address(address),
            name: SymbolName::new(name),
        }
    }
}

/// The static binary's symbol catalog
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct StaticSymbols {
    /// Size of the binary's static data
    pub static_memory: Bytes,
    /// Function start addresses, in any order
    pub symbols: Vec<ElfSymbol>,
}

impl StaticSymbols {
    pub fn new(static_memory: i64, mut symbols: Vec<ElfSymbol>) -> Self {
        symbols.sort();
        Self {
            static_memory: Bytes(static_memory),
            symbols,
        }
    }

    /// Turn consecutive symbol addresses into function ranges.
    ///
    /// Only the text section is considered: ranges start at `_init` when
    /// present and stop at `_end` when present.
    pub fn ranges(&self) -> Vec<FunctionRange> {
        let mut sorted = self.symbols.clone();
        sorted.sort();

        let start = sorted
            .iter()
            .position(|s| s.name.as_ref() == ElfSymbol::TEXT_START)
            .unwrap_or(0);
        let mut ranges = Vec::new();
        for pair in sorted[start..].windows(2) {
            let (cur, next) = (&pair[0], &pair[1]);
            if cur.name.as_ref() == ElfSymbol::TEXT_END {
                break;
            }
            if cur.address < next.address {
                ranges.push(FunctionRange::new_static(
                    cur.address.0,
                    next.address.0,
                    cur.name.to_string(),
                ));
            }
        }
        ranges
    }
}

/// Half open address range `[start, end)` owned by one function
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display(fmt = "[{start}, {end}):{name}")]
pub struct FunctionRange {
    pub start: Address,
    pub end: Address,
    pub name: SymbolName,
    pub is_static: bool,
}

impl FunctionRange {
    pub fn new<S: Into<String>>(start: i64, end: i64, name: S) -> Self {
        Self {
            start: Address(start),
            end: Address(end),
            name: SymbolName::new(name),
            is_static: false,
        }
    }

    pub fn new_static<S: Into<String>>(start: i64, end: i64, name: S) -> Self {
        Self {
            is_static: true,
            ..Self::new(start, end, name)
        }
    }

    pub fn contains(&self, address: Address) -> bool {
        self.start <= address && address < self.end
    }
}

/// Provides the function ranges of the loaded dynamic libraries.
///
/// Queried once, at process exit, when library addresses are final.
pub trait DynamicSymbolSource {
    fn function_ranges(&self) -> Vec<FunctionRange>;
}

impl<F> DynamicSymbolSource for F
where
    F: Fn() -> Vec<FunctionRange>,
{
    fn function_ranges(&self) -> Vec<FunctionRange> {
        self()
    }
}

/// Produces the return addresses of the current call stack, innermost first
pub trait StackUnwinder {
    fn unwind(&self) -> Vec<Address>;
}

impl<F> StackUnwinder for F
where
    F: Fn() -> Vec<Address>,
{
    fn unwind(&self) -> Vec<Address> {
        self()
    }
}

/// Address to function name resolution for one trace
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct FunctionMap {
    /// Keyed by range start
    functions: BTreeMap<Address, FunctionRange>,
}

impl FunctionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Add a range, ranges are expected to be disjoint.
    /// A range starting at an already known address replaces it.
    pub fn insert(&mut self, range: FunctionRange) {
        self.functions.insert(range.start, range);
    }

    pub fn extend<I: IntoIterator<Item = FunctionRange>>(&mut self, ranges: I) {
        for r in ranges {
            self.insert(r);
        }
    }

    pub fn function(&self, address: Address) -> Option<&FunctionRange> {
        self.functions
            .range(..=address)
            .next_back()
            .map(|(_, f)| f)
            .filter(|f| f.contains(address))
    }

    /// Resolve an address, `Unknown` when no range owns it
    pub fn resolve(&self, address: Address) -> SymbolName {
        match self.function(address) {
            Some(f) => f.name.clone(),
            None => {
                debug!(%address, "Address not owned by any known function");
                SymbolName::unknown()
            }
        }
    }

    pub fn resolve_stack(&self, addresses: &[Address]) -> Vec<SymbolName> {
        addresses.iter().map(|a| self.resolve(*a)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionRange> {
        self.functions.values()
    }
}
