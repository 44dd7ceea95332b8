//! Modification overlays.
//!
//! Pending changes never touch the decoded on-disk bytes. Each slot of a page
//! may carry a replacement chain (newest first); run-length encoded slots
//! instead carry a list of per-record expansions, each with its own chain.
//! Both arrays are allocated on the first modification of a page.

use bytes::Bytes;
use cambium_storage::OvflRef;
use parking_lot::{Mutex, MutexGuard};

/// A change applied to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Replace the value.
    Put(Bytes),
    /// Delete the record.
    Delete,
}

impl Update {
    /// Payload stored in the chain; `None` marks a deletion.
    pub fn into_payload(self) -> Option<Bytes> {
        match self {
            Update::Put(value) => Some(value),
            Update::Delete => None,
        }
    }
}

/// One pending replacement. Owns the next-older node.
#[derive(Debug)]
pub struct UpdateNode {
    payload: Option<Bytes>,
    /// Overflow page this payload was spilled to by an earlier flush.
    spilled: Option<OvflRef>,
    next: Option<Box<UpdateNode>>,
}

impl UpdateNode {
    /// The new value, or `None` if this update deletes the record.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn is_deleted(&self) -> bool {
        self.payload.is_none()
    }

    pub fn spilled(&self) -> Option<OvflRef> {
        self.spilled
    }

    pub fn set_spilled(&mut self, ovfl: OvflRef) {
        self.spilled = Some(ovfl);
    }
}

/// Forward-linked replacement chain for one slot, newest first.
#[derive(Debug, Default)]
pub struct UpdateChain {
    head: Option<Box<UpdateNode>>,
}

impl UpdateChain {
    /// Prepends an update.
    pub fn push(&mut self, payload: Option<Bytes>) {
        let next = self.head.take();
        self.head = Some(Box::new(UpdateNode {
            payload,
            spilled: None,
            next,
        }));
    }

    /// The current value.
    pub fn head(&self) -> Option<&UpdateNode> {
        self.head.as_deref()
    }

    pub fn head_mut(&mut self) -> Option<&mut UpdateNode> {
        self.head.as_deref_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Walks the chain from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &UpdateNode> {
        std::iter::successors(self.head.as_deref(), |n| n.next.as_deref())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Takes the overflow pages spilled for values that are no longer
    /// current. They are unreachable once a newer image is written.
    pub fn take_stale_spills(&mut self) -> Vec<OvflRef> {
        let mut stale = Vec::new();
        let mut node = self.head.as_deref_mut().and_then(|h| h.next.as_deref_mut());
        while let Some(n) = node {
            if let Some(ovfl) = n.spilled.take() {
                stale.push(ovfl);
            }
            node = n.next.as_deref_mut();
        }
        stale
    }

    /// Bytes held by payloads in the chain.
    pub fn payload_bytes(&self) -> usize {
        self.iter().map(|n| n.payload.as_ref().map_or(0, Bytes::len)).sum()
    }
}

impl Drop for UpdateChain {
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

/// Override of one record inside a run. Owns the next expansion of the slot.
#[derive(Debug)]
pub struct ExpansionNode {
    recno: u64,
    updates: UpdateChain,
    next: Option<Box<ExpansionNode>>,
}

impl ExpansionNode {
    pub fn recno(&self) -> u64 {
        self.recno
    }

    pub fn updates(&self) -> &UpdateChain {
        &self.updates
    }
}

/// Forward-linked list of record expansions for one run-length encoded slot.
#[derive(Debug, Default)]
pub struct ExpansionList {
    head: Option<Box<ExpansionNode>>,
}

impl ExpansionList {
    /// Returns the chain for `recno`, if that record was ever modified.
    pub fn find(&self, recno: u64) -> Option<&UpdateChain> {
        self.iter().find(|e| e.recno == recno).map(|e| &e.updates)
    }

    /// Prepends an update to the chain of `recno`, adding an expansion for
    /// the record if it has none yet.
    pub fn push(&mut self, recno: u64, payload: Option<Bytes>) {
        let mut node = self.head.as_deref_mut();
        while let Some(n) = node {
            if n.recno == recno {
                n.updates.push(payload);
                return;
            }
            node = n.next.as_deref_mut();
        }
        let mut updates = UpdateChain::default();
        updates.push(payload);
        let next = self.head.take();
        self.head = Some(Box::new(ExpansionNode {
            recno,
            updates,
            next,
        }));
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExpansionNode> {
        std::iter::successors(self.head.as_deref(), |n| n.next.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

impl Drop for ExpansionList {
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

/// All pending modifications of one page.
#[derive(Debug, Default)]
pub struct Overlay {
    updates: Option<Vec<UpdateChain>>,
    expansions: Option<Vec<ExpansionList>>,
    /// Slots whose on-disk overflow item has already been freed.
    released: Vec<u32>,
    /// Key groups whose on-disk overflow key was freed, with the overflow
    /// page it was rewritten to, if any. Sorted by group.
    key_spills: Vec<(u32, Option<OvflRef>)>,
    bytes: usize,
}

impl Overlay {
    /// Returns true if nothing was ever modified.
    pub fn is_empty(&self) -> bool {
        self.updates.is_none() && self.expansions.is_none()
    }

    /// Chain of `slot`, if the slot was modified.
    pub fn chain(&self, slot: u32) -> Option<&UpdateChain> {
        self.updates
            .as_ref()?
            .get(slot as usize)
            .filter(|c| !c.is_empty())
    }

    pub fn chain_mut(&mut self, slot: u32) -> Option<&mut UpdateChain> {
        self.updates
            .as_mut()?
            .get_mut(slot as usize)
            .filter(|c| !c.is_empty())
    }

    /// Chain of record `recno` in run `slot`, if that record was modified.
    pub fn expansion(&self, slot: u32, recno: u64) -> Option<&UpdateChain> {
        self.expansions.as_ref()?.get(slot as usize)?.find(recno)
    }

    /// Expansion list of run `slot`.
    pub fn expansions(&self, slot: u32) -> Option<&ExpansionList> {
        self.expansions
            .as_ref()?
            .get(slot as usize)
            .filter(|l| !l.is_empty())
    }

    /// Prepends an update to `slot`, allocating the array on first use.
    pub fn push_update(&mut self, slots: usize, slot: u32, payload: Option<Bytes>) {
        self.bytes += payload.as_ref().map_or(0, Bytes::len);
        let updates = self
            .updates
            .get_or_insert_with(|| (0..slots).map(|_| UpdateChain::default()).collect());
        updates[slot as usize].push(payload);
    }

    /// Prepends an update to record `recno` of run `slot`.
    pub fn push_expansion(&mut self, slots: usize, slot: u32, recno: u64, payload: Option<Bytes>) {
        self.bytes += payload.as_ref().map_or(0, Bytes::len);
        let expansions = self
            .expansions
            .get_or_insert_with(|| (0..slots).map(|_| ExpansionList::default()).collect());
        expansions[slot as usize].push(recno, payload);
    }

    /// Records that the on-disk overflow item of `slot` has been freed.
    /// Returns false if it already was.
    pub fn release_original(&mut self, slot: u32) -> bool {
        match self.released.binary_search(&slot) {
            Ok(_) => false,
            Err(at) => {
                self.released.insert(at, slot);
                true
            }
        }
    }

    /// Returns true if the on-disk overflow item of `slot` was freed.
    pub fn is_released(&self, slot: u32) -> bool {
        self.released.binary_search(&slot).is_ok()
    }

    /// Takes the stale spills of every chain.
    pub fn take_stale_spills(&mut self) -> Vec<OvflRef> {
        self.updates
            .iter_mut()
            .flatten()
            .flat_map(UpdateChain::take_stale_spills)
            .collect()
    }

    /// State of an overflow key whose entries were all deleted at some
    /// flush: `None` while the on-disk key is still live, `Some(None)` once
    /// freed, `Some(Some(_))` after it was written again.
    pub fn key_spill(&self, group: u32) -> Option<Option<OvflRef>> {
        self.key_spills
            .binary_search_by_key(&group, |(g, _)| *g)
            .ok()
            .map(|at| self.key_spills[at].1)
    }

    pub fn set_key_spill(&mut self, group: u32, ovfl: Option<OvflRef>) {
        match self.key_spills.binary_search_by_key(&group, |(g, _)| *g) {
            Ok(at) => self.key_spills[at].1 = ovfl,
            Err(at) => self.key_spills.insert(at, (group, ovfl)),
        }
    }

    /// Payload bytes held by the overlay.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Number of modified slots and expanded records.
    pub fn modified_count(&self) -> usize {
        let updates = self
            .updates
            .as_ref()
            .map_or(0, |u| u.iter().filter(|c| !c.is_empty()).count());
        let expansions = self
            .expansions
            .as_ref()
            .map_or(0, |e| e.iter().map(ExpansionList::len).sum());
        updates + expansions
    }
}

/// The single serialized modification path of a tree.
#[derive(Debug, Default)]
pub struct WritePath {
    lock: Mutex<()>,
}

/// Proof that the caller holds the tree's modification path.
pub struct WriteTicket<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl WritePath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the modification path, waiting for the current holder.
    pub fn enter(&self) -> WriteTicket<'_> {
        WriteTicket {
            _guard: self.lock.lock(),
        }
    }

    /// Returns true if a writer is inside the path.
    pub fn is_busy(&self) -> bool {
        self.lock.is_locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cambium_common::Address;

    fn put(s: &'static str) -> Option<Bytes> {
        Some(Bytes::from_static(s.as_bytes()))
    }

    #[test]
    fn test_chain_newest_first() {
        let mut chain = UpdateChain::default();
        assert!(chain.head().is_none());
        chain.push(put("a"));
        chain.push(put("b"));
        chain.push(None);
        assert!(chain.head().unwrap().is_deleted());
        let values: Vec<Option<&[u8]>> = chain
            .iter()
            .map(|n| n.payload().map(|b| b.as_ref()))
            .collect();
        assert_eq!(values, vec![None, Some(&b"b"[..]), Some(&b"a"[..])]);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.payload_bytes(), 2);
    }

    #[test]
    fn test_long_chain_drops_without_recursion() {
        let mut chain = UpdateChain::default();
        for _ in 0..200_000 {
            chain.push(None);
        }
        drop(chain);

        let mut list = ExpansionList::default();
        for r in 0..2_000 {
            list.push(r, None);
        }
        drop(list);
    }

    #[test]
    fn test_stale_spills() {
        let mut chain = UpdateChain::default();
        chain.push(put("old"));
        chain.head_mut().unwrap().set_spilled(OvflRef::new(Address(5), 512));
        chain.push(put("new"));
        chain.head_mut().unwrap().set_spilled(OvflRef::new(Address(6), 512));

        assert_eq!(chain.take_stale_spills(), vec![OvflRef::new(Address(5), 512)]);
        assert!(chain.take_stale_spills().is_empty());
        assert_eq!(chain.head().unwrap().spilled(), Some(OvflRef::new(Address(6), 512)));
    }

    #[test]
    fn test_expansion_list() {
        let mut list = ExpansionList::default();
        list.push(104, put("W"));
        list.push(107, put("X"));
        list.push(104, put("Y"));
        assert_eq!(list.len(), 2);
        assert_eq!(
            list.find(104).unwrap().head().unwrap().payload().unwrap().as_ref(),
            b"Y"
        );
        assert_eq!(list.find(104).unwrap().len(), 2);
        assert!(list.find(105).is_none());
    }

    #[test]
    fn test_overlay_lazy_allocation() {
        let mut overlay = Overlay::default();
        assert!(overlay.is_empty());
        assert!(overlay.chain(0).is_none());

        overlay.push_update(4, 2, put("v"));
        assert!(!overlay.is_empty());
        assert!(overlay.chain(0).is_none());
        assert!(overlay.chain(2).is_some());
        assert!(overlay.chain(9).is_none());
        assert!(overlay.expansions(0).is_none());
        assert_eq!(overlay.bytes(), 1);

        overlay.push_expansion(1, 0, 104, put("W"));
        assert!(overlay.expansion(0, 104).is_some());
        assert!(overlay.expansion(0, 103).is_none());
        assert_eq!(overlay.modified_count(), 2);
    }

    #[test]
    fn test_release_original_once() {
        let mut overlay = Overlay::default();
        assert!(overlay.release_original(3));
        assert!(overlay.release_original(1));
        assert!(!overlay.release_original(3));
        assert!(overlay.is_released(1));
        assert!(!overlay.is_released(2));
    }

    #[test]
    fn test_key_spill_states() {
        let mut overlay = Overlay::default();
        assert_eq!(overlay.key_spill(4), None);
        overlay.set_key_spill(4, None);
        assert_eq!(overlay.key_spill(4), Some(None));
        let ovfl = OvflRef::new(Address(9), 512);
        overlay.set_key_spill(4, Some(ovfl));
        overlay.set_key_spill(1, None);
        assert_eq!(overlay.key_spill(4), Some(Some(ovfl)));
        assert_eq!(overlay.key_spill(1), Some(None));
    }

    #[test]
    fn test_overlay_collects_stale_spills() {
        let mut overlay = Overlay::default();
        overlay.push_update(3, 0, put("a"));
        overlay
            .chain_mut(0)
            .unwrap()
            .head_mut()
            .unwrap()
            .set_spilled(OvflRef::new(Address(7), 512));
        assert!(overlay.take_stale_spills().is_empty());
        overlay.push_update(3, 0, put("b"));
        overlay.push_update(3, 2, None);
        assert_eq!(overlay.take_stale_spills(), vec![OvflRef::new(Address(7), 512)]);
    }

    #[test]
    fn test_write_path_serializes() {
        let path = WritePath::new();
        assert!(!path.is_busy());
        let ticket = path.enter();
        assert!(path.is_busy());
        drop(ticket);
        assert!(!path.is_busy());
    }

    #[test]
    fn test_update_payload() {
        assert_eq!(Update::Delete.into_payload(), None);
        assert_eq!(
            Update::Put(Bytes::from_static(b"x")).into_payload(),
            Some(Bytes::from_static(b"x"))
        );
    }
}
