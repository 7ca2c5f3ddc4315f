//! Call stack interning.
//!
//! The encoder side assigns ids in first-seen order and queues new stacks for
//! emission in the next `Stacks` frame. The decoder side replays those frames
//! into a [`StackCatalog`].

use crate::types::{Address, StackId};
use byteordered::ByteOrdered;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read};
use tracing::debug;

/// Encoder side table, ids are never reused
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct StackTable {
    ids: HashMap<Vec<Address>, StackId>,
    next_id: i32,
    pending: Vec<StackId>,
    by_id: Vec<Vec<Address>>,
}

impl StackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn intern(&mut self, stack: Vec<Address>) -> StackId {
        if let Some(id) = self.ids.get(&stack) {
            return *id;
        }
        let id = StackId(self.next_id);
        self.next_id += 1;
        self.by_id.push(stack.clone());
        self.ids.insert(stack, id);
        self.pending.push(id);
        id
    }

    pub fn get(&self, id: StackId) -> Option<&[Address]> {
        id.index()
            .and_then(|idx| self.by_id.get(idx))
            .map(Vec::as_slice)
    }

    /// Serialize and clear the pending queue.
    ///
    /// Returns the number of stacks and their wire form, each entry being
    /// `(id:i32, depth:i32, depth x addr:i64)`.
    pub fn drain_pending(&mut self) -> io::Result<(usize, Vec<u8>)> {
        let pending = std::mem::take(&mut self.pending);
        let mut bytes = Vec::new();
        {
            let mut w = ByteOrdered::native(&mut bytes);
            for id in pending.iter() {
                let stack = self.get(*id).unwrap_or(&[]);
                w.write_i32(id.0)?;
                w.write_i32(crate::frame::wire_len(stack.len())?)?;
                for addr in stack.iter() {
                    w.write_i64(addr.0)?;
                }
            }
        }
        Ok((pending.len(), bytes))
    }
}

/// Decoder side view of the interned stacks, rebuilt from `Stacks` frames
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct StackCatalog {
    stacks: BTreeMap<StackId, Vec<Address>>,
}

impl StackCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn get(&self, id: StackId) -> Option<&[Address]> {
        self.stacks.get(&id).map(Vec::as_slice)
    }

    pub fn insert(&mut self, id: StackId, stack: Vec<Address>) {
        if self.stacks.insert(id, stack).is_some() {
            debug!(%id, "Stack id redefined");
        }
    }

    /// Read `count` entries of a `Stacks` frame payload
    pub fn read_entries<R: Read>(&mut self, r: &mut R, count: usize) -> io::Result<()> {
        let mut r = ByteOrdered::native(r);
        for _ in 0..count {
            let id = StackId(r.read_i32()?);
            let depth = r.read_i32()?;
            let depth = usize::try_from(depth).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "negative stack depth")
            })?;
            let mut stack = Vec::with_capacity(depth.min(crate::symbols::MAX_STACK_DEPTH));
            for _ in 0..depth {
                stack.push(Address(r.read_i64()?));
            }
            self.insert(id, stack);
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (StackId, &[Address])> {
        self.stacks.iter().map(|(id, s)| (*id, s.as_slice()))
    }

    pub fn ids(&self) -> impl Iterator<Item = StackId> + '_ {
        self.stacks.keys().copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stack(addrs: &[i64]) -> Vec<Address> {
        addrs.iter().copied().map(Address).collect()
    }

    #[test]
    fn interning_deduplicates() {
        let mut t = StackTable::new();
        let a = t.intern(stack(&[0x10, 0x20, 0x30]));
        let b = t.intern(stack(&[0x10, 0x20, 0x30]));
        let reversed = t.intern(stack(&[0x30, 0x20, 0x10]));
        let changed = t.intern(stack(&[0x10, 0x20, 0x31]));
        let shorter = t.intern(stack(&[0x10, 0x20]));
        assert_eq!(a, StackId(0));
        assert_eq!(a, b);
        assert_eq!(reversed, StackId(1));
        assert_eq!(changed, StackId(2));
        assert_eq!(shorter, StackId(3));
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn drained_stacks_replay_into_catalog() {
        let mut t = StackTable::new();
        t.intern(stack(&[0x10, 0x20]));
        t.intern(stack(&[]));
        let (count, bytes) = t.drain_pending().unwrap();
        assert_eq!(count, 2);
        assert_eq!(bytes.len(), (4 + 4 + 16) + (4 + 4));
        assert_eq!(t.pending_len(), 0);

        // Known stacks are not re-emitted
        t.intern(stack(&[0x10, 0x20]));
        let third = t.intern(stack(&[0x99]));
        let (count2, bytes2) = t.drain_pending().unwrap();
        assert_eq!(count2, 1);

        let mut catalog = StackCatalog::new();
        catalog.read_entries(&mut bytes.as_slice(), count).unwrap();
        catalog.read_entries(&mut bytes2.as_slice(), count2).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get(StackId(0)), Some(stack(&[0x10, 0x20]).as_slice()));
        assert_eq!(catalog.get(StackId(1)), Some(&[][..]));
        assert_eq!(catalog.get(third), Some(stack(&[0x99]).as_slice()));
        assert_eq!(catalog.get(StackId::UNKNOWN), None);
    }
}
