//! Bounded ring buffer used for the P2M update ring (§3.7) and the per-VM
//! hint-update ring (§4.2). Both are "deferred callback" queues in the
//! sense of §9's design notes: a tagged message is enqueued under the
//! owner's lock, an action is posted to an external collaborator, and the
//! ring is drained when that collaborator acknowledges.

use std::collections::VecDeque;

/// A bounded FIFO ring. When full, the oldest un-acknowledged entry is
/// retained and the new entry is rejected with an overflow flag set on the
/// ring itself (§4.2: "Hint updates ... flagged with an overflow bit");
/// callers drain promptly so this should be rare in practice.
pub struct Ring<T> {
    capacity: usize,
    entries: VecDeque<T>,
    overflowed: bool,
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Ring { capacity: capacity.max(1), entries: VecDeque::new(), overflowed: false }
    }

    /// Enqueue an entry. Returns `true` if it fit, `false` if the ring was
    /// full (in which case `overflowed` is now set and the entry was
    /// dropped).
    pub fn push(&mut self, item: T) -> bool {
        if self.entries.len() >= self.capacity {
            self.overflowed = true;
            return false;
        }
        self.entries.push_back(item);
        true
    }

    pub fn pop(&mut self) -> Option<T> { self.entries.pop_front() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn len(&self) -> usize { self.entries.len() }

    /// Drain and clear the overflow flag, reporting whether an overflow had
    /// occurred since the last drain.
    pub fn take_overflow(&mut self) -> bool { std::mem::take(&mut self.overflowed) }

    pub fn iter(&self) -> impl Iterator<Item = &T> { self.entries.iter() }
}
