//! Anonymous MPN list (§3.8, §4.4 "Anon list"): VM-private overhead pages
//! that never correspond to guest-physical memory. The list itself is a
//! doubly linked list threaded through MPN indices rather than pointers
//! (§9 "Pointer graphs"): each node's data lives in one global side-table
//! record, so a traversal can validate `{magic, owner}` at every step
//! without trusting the list structure itself.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::ids::{Mpn, VmId};

const ANON_MAGIC: u32 = 0xA0_0E_11_ED;

#[derive(Debug, Clone, Copy)]
struct AnonRecord {
    tag: u32,
    magic: u32,
    owner: VmId,
    prev: Option<Mpn>,
    next: Option<Mpn>,
}

/// The global per-MPN record table (§3.8: "global with one record per
/// MPN"). `AnonSideTable` only stores node metadata; the doubly-linked
/// list's head lives in the owning VM's state (`crate::vm::VmState`).
#[derive(Default)]
pub struct AnonSideTable {
    records: Mutex<HashMap<Mpn, AnonRecord>>,
}

impl AnonSideTable {
    pub fn new() -> Self { AnonSideTable::default() }

    /// Insert `mpn` at the head of `owner`'s anon list, returning the new
    /// head. `head` is the caller's current head pointer (read/written
    /// under the owning VM's alloc lock).
    pub fn insert(&self, head: Option<Mpn>, mpn: Mpn, owner: VmId, tag: u32) -> Mpn {
        let mut records = self.records.lock().unwrap();
        if let Some(old_head) = head {
            if let Some(old) = records.get_mut(&old_head) {
                old.prev = Some(mpn);
            }
        }
        records.insert(mpn, AnonRecord { tag, magic: ANON_MAGIC, owner, prev: None, next: head });
        mpn
    }

    /// Unlink `mpn` from `owner`'s anon list. Returns the new head.
    /// `Error::Fatal` if `mpn` has no record, belongs to a different VM,
    /// or its magic is corrupt -- all three indicate the list itself was
    /// tampered with or a bookkeeping bug exists upstream.
    pub fn remove(&self, head: Option<Mpn>, mpn: Mpn, owner: VmId) -> Result<Option<Mpn>> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get(&mpn)
            .copied()
            .ok_or_else(|| Error::fatal(owner, format!("anon list remove of untracked {mpn}")))?;
        if record.owner != owner || record.magic != ANON_MAGIC {
            log::error!("anon list corruption detected at {mpn} during remove");
            return Err(Error::fatal(owner, format!("anon list corruption at {mpn}")));
        }
        if let Some(prev) = record.prev {
            if let Some(p) = records.get_mut(&prev) {
                p.next = record.next;
            }
        }
        if let Some(next) = record.next {
            if let Some(n) = records.get_mut(&next) {
                n.prev = record.prev;
            }
        }
        records.remove(&mpn);
        Ok(if head == Some(mpn) { record.next } else { head })
    }

    /// Traverse the list from `head`, validating `{magic, owner}` at every
    /// node (§4.4, debugger/dump traversal).
    pub fn traverse(&self, head: Option<Mpn>, owner: VmId) -> Result<Vec<Mpn>> {
        let records = self.records.lock().unwrap();
        let mut out = Vec::new();
        let mut cursor = head;
        while let Some(mpn) = cursor {
            let record = records
                .get(&mpn)
                .ok_or_else(|| Error::fatal(owner, format!("anon list traversal hit untracked {mpn}")))?;
            if record.owner != owner || record.magic != ANON_MAGIC {
                return Err(Error::fatal(owner, format!("anon list corruption at {mpn}")));
            }
            out.push(mpn);
            cursor = record.next;
        }
        Ok(out)
    }

    pub fn tag_of(&self, mpn: Mpn) -> Option<u32> { self.records.lock().unwrap().get(&mpn).map(|r| r.tag) }
}
