//! Types common to both the recording and the decoding side of the protocol

use derive_more::{Add, AddAssign, Binary, Deref, Display, From, Into, LowerHex, Sub, UpperHex};

/// A raw code or heap address as captured in the traced process.
///
/// Addresses are only meaningful within the trace that recorded them.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Default,
    From,
    Into,
    Display,
    Binary,
    LowerHex,
    UpperHex,
)]
#[display(fmt = "0x{_0:X}")]
pub struct Address(pub i64);

impl Address {
    pub const NULL: Self = Address(0);

    pub fn get_raw(&self) -> i64 {
        self.0
    }
}

/// Call stack identifier, local to one trace.
/// Assigned in first-seen order starting at 0.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, From, Into, Display,
)]
#[display(fmt = "{_0}")]
pub struct StackId(pub i32);

impl StackId {
    /// Used for allocations whose origin was never observed, i.e. a realloc
    /// of an untracked pointer
    pub const UNKNOWN: Self = StackId(-1);

    pub fn is_unknown(&self) -> bool {
        self.0 < 0
    }

    pub(crate) fn index(&self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

/// Sequence number of an accounting event, counted by the HWM tracker.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Default,
    From,
    Into,
    Display,
    Deref,
)]
#[display(fmt = "{_0}")]
pub struct AllocationId(pub i64);

impl AllocationId {
    pub fn zero() -> Self {
        Self(0)
    }

    pub(crate) fn increment(&mut self) {
        self.0 += 1;
    }
}

/// A signed byte count
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Default,
    From,
    Into,
    Display,
    Deref,
    Add,
    AddAssign,
    Sub,
)]
#[display(fmt = "{_0}")]
pub struct Bytes(pub i64);

impl Bytes {
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn get_raw(&self) -> i64 {
        self.0
    }

    pub fn as_megabytes(&self) -> f64 {
        self.0 as f64 / (1024.0 * 1024.0)
    }
}

impl std::ops::SubAssign for Bytes {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Bytes {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Bytes(iter.map(|b| b.0).sum())
    }
}

/// A resolved function name
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Into, Display)]
#[display(fmt = "{_0}")]
pub struct SymbolName(pub(crate) String);

impl SymbolName {
    pub const UNKNOWN: &'static str = "Unknown";

    pub fn new<S: Into<String>>(s: S) -> Self {
        Self(s.into())
    }

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_owned())
    }
}

impl From<TrimmedString> for SymbolName {
    fn from(s: TrimmedString) -> Self {
        Self(s.0)
    }
}

impl AsRef<str> for SymbolName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for SymbolName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A string read off the wire, cut at the first NULL
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Into, Display)]
#[display(fmt = "{_0}")]
pub(crate) struct TrimmedString(pub(crate) String);

impl TrimmedString {
    pub(crate) fn from_raw(s: &[u8]) -> Self {
        let s = String::from_utf8_lossy(s);
        let substr = if let Some(idx) = s.find(char::from(0)) {
            &s[..idx]
        } else {
            &s
        };
        Self(substr.to_string())
    }
}

impl std::ops::Deref for TrimmedString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// NULL terminated wire form of a name
pub(crate) fn nul_terminated(name: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    bytes
}

/// Identity of the traced process within its parallel job
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display(fmt = "rank {rank}/{comm_size} on {processor_name}")]
pub struct RunData {
    pub rank: i32,
    pub comm_size: i32,
    pub processor_name: String,
}

impl RunData {
    pub const UNKNOWN_PROCESSOR: &'static str = "Unknown";

    pub fn new<S: Into<String>>(rank: i32, comm_size: i32, processor_name: S) -> Self {
        Self {
            rank,
            comm_size,
            processor_name: processor_name.into(),
        }
    }

    /// A non-parallel process
    pub fn serial() -> Self {
        Self::new(0, 1, Self::UNKNOWN_PROCESSOR)
    }
}

impl Default for RunData {
    fn default() -> Self {
        Self::serial()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trimmed_string() {
        assert_eq!(TrimmedString::from_raw(b"main").0.as_str(), "main");
        assert_eq!(TrimmedString::from_raw(b"main\0").0.as_str(), "main");
        assert_eq!(TrimmedString::from_raw(b"foo\0\0\0bar").0.as_str(), "foo");
        assert_eq!(TrimmedString::from_raw(b"").0.as_str(), "");
    }

    #[test]
    fn nul_terminated_names() {
        assert_eq!(nul_terminated("node01"), b"node01\0".to_vec());
        assert_eq!(
            TrimmedString::from_raw(&nul_terminated("node01")).0,
            "node01"
        );
    }

    #[test]
    fn unknown_stack_id() {
        assert!(StackId::UNKNOWN.is_unknown());
        assert_eq!(StackId::UNKNOWN.index(), None);
        assert_eq!(StackId(3).index(), Some(3));
    }

    #[test]
    fn address_display() {
        assert_eq!(Address(0x1F).to_string(), "0x1F");
    }
}
