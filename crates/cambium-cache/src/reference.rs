//! Page references: residency state of one child slot.

use crate::hazard::{PageGuard, Session};
use crate::page::MemPage;
use cambium_common::{Address, Result};
use cambium_storage::OffRecord;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Residency of the page a reference names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RefState {
    /// Not resident. Zero so that a default reference starts here.
    OnDisk = 0,
    /// Resident and usable.
    InCache = 1,
    /// Marked by the reclaiming agent, which is checking for hazards.
    EvictionPending = 2,
}

impl RefState {
    #[inline]
    fn from_u32(value: u32) -> Self {
        match value {
            1 => RefState::InCache,
            2 => RefState::EvictionPending,
            _ => RefState::OnDisk,
        }
    }
}

/// A slot naming a child page, with an owning pointer to it while resident.
pub struct PageRef {
    slot: u32,
    state: AtomicU32,
    page: RwLock<Option<Arc<MemPage>>>,
    addr: AtomicU32,
    size: AtomicU32,
    records: AtomicU64,
    /// Bumped each time the page moves.
    epoch: AtomicU32,
}

impl PageRef {
    /// Creates a reference to a page that is not resident.
    pub fn new(slot: u32, location: OffRecord) -> Self {
        Self {
            slot,
            state: AtomicU32::new(RefState::OnDisk as u32),
            page: RwLock::new(None),
            addr: AtomicU32::new(location.addr.0),
            size: AtomicU32::new(location.size),
            records: AtomicU64::new(location.records),
            epoch: AtomicU32::new(0),
        }
    }

    /// Slot of the parent page holding this reference.
    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    #[inline]
    pub fn state(&self) -> RefState {
        RefState::from_u32(self.state.load(Ordering::SeqCst))
    }

    /// Returns true unless the page is on disk only.
    #[inline]
    pub fn is_resident(&self) -> bool {
        self.state() != RefState::OnDisk
    }

    /// Current on-disk location of the page.
    pub fn location(&self) -> OffRecord {
        OffRecord::new(
            Address(self.addr.load(Ordering::Acquire)),
            self.size.load(Ordering::Acquire),
            self.records.load(Ordering::Acquire),
        )
    }

    /// Number of times the page was written to a new location. Taken
    /// before reading the page and checked again when publishing it.
    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Points the reference at a newly written image.
    pub fn set_location(&self, location: OffRecord) {
        self.addr.store(location.addr.0, Ordering::Release);
        self.size.store(location.size, Ordering::Release);
        self.records.store(location.records, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Runs the reader protocol: load the state, publish a hazard reference
    /// for the resident page, then recheck that the page is still the one
    /// the reference owns.
    ///
    /// Returns `None` if the page is not resident. Waits out a pending
    /// eviction, which either aborts or leaves the page on disk.
    pub fn acquire<'s>(&self, session: &'s Session) -> Result<Option<PageGuard<'s>>> {
        loop {
            match self.state() {
                RefState::OnDisk => return Ok(None),
                RefState::EvictionPending => std::thread::yield_now(),
                RefState::InCache => {
                    let Some(page) = self.page.read().clone() else {
                        std::thread::yield_now();
                        continue;
                    };
                    let guard = session.publish(page)?;
                    if self.state() == RefState::InCache && self.owns(guard.page()) {
                        return Ok(Some(guard));
                    }
                    drop(guard);
                }
            }
        }
    }

    /// Publishes a freshly read page if the reference is still on disk and
    /// has not moved since `epoch`. Returns false if another reader won, or
    /// if the page was written elsewhere since the caller read it; the
    /// caller discards its copy.
    ///
    /// Comparing addresses is not enough: a moved page may be written back
    /// to its old, since freed, address.
    pub fn publish(&self, page: Arc<MemPage>, epoch: u32) -> bool {
        let mut slot = self.page.write();
        if self.state() != RefState::OnDisk || self.epoch() != epoch {
            return false;
        }
        *slot = Some(page);
        self.state.store(RefState::InCache as u32, Ordering::SeqCst);
        true
    }

    /// The resident page, without hazard protection.
    ///
    /// Used by the reclaiming agent and the write path, which exclude each
    /// other, to walk the resident tree.
    pub fn resident(&self) -> Option<Arc<MemPage>> {
        if self.state() == RefState::OnDisk {
            return None;
        }
        self.page.read().clone()
    }

    /// Moves `InCache -> EvictionPending`. Fails if the page is in any other
    /// state or is pinned.
    pub fn begin_eviction(&self) -> bool {
        let pinned = self.page.read().as_ref().map_or(true, |p| p.is_pinned());
        if pinned {
            return false;
        }
        self.state
            .compare_exchange(
                RefState::InCache as u32,
                RefState::EvictionPending as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Moves `EvictionPending -> InCache`.
    pub fn abort_eviction(&self) {
        self.state.store(RefState::InCache as u32, Ordering::SeqCst);
    }

    /// Moves `EvictionPending -> OnDisk`, releasing the owning pointer.
    pub fn finish_eviction(&self) -> Option<Arc<MemPage>> {
        let mut slot = self.page.write();
        let page = slot.take();
        self.state.store(RefState::OnDisk as u32, Ordering::SeqCst);
        page
    }

    fn owns(&self, page: &Arc<MemPage>) -> bool {
        self.page
            .read()
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, page))
    }
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("slot", &self.slot)
            .field("state", &self.state())
            .field("location", &self.location())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazard::{hazard_id, HazardTable};
    use crate::page::test_page;

    fn reference() -> PageRef {
        PageRef::new(3, OffRecord::new(Address(7), 512, 0))
    }

    #[test]
    fn test_zero_state_is_on_disk() {
        assert_eq!(RefState::from_u32(0), RefState::OnDisk);
        let r = reference();
        assert_eq!(r.state(), RefState::OnDisk);
        assert_eq!(r.slot(), 3);
        assert!(r.resident().is_none());
    }

    #[test]
    fn test_acquire_on_disk_returns_none() {
        let table = Arc::new(HazardTable::new(1, 4));
        let session = table.open_session().unwrap();
        assert!(reference().acquire(&session).unwrap().is_none());
        assert_eq!(table.active(), 0);
    }

    #[test]
    fn test_publish_then_acquire() {
        let table = Arc::new(HazardTable::new(1, 4));
        let session = table.open_session().unwrap();
        let r = reference();
        let page = test_page();

        assert!(r.publish(Arc::clone(&page), r.epoch()));
        assert_eq!(r.state(), RefState::InCache);
        let guard = r.acquire(&session).unwrap().unwrap();
        assert!(Arc::ptr_eq(guard.page(), &page));
        assert!(table.is_hazard(hazard_id(&page)));
    }

    #[test]
    fn test_losing_publisher_is_rejected() {
        let r = reference();
        let winner = test_page();
        let loser = test_page();
        assert!(r.publish(Arc::clone(&winner), 0));
        assert!(!r.publish(loser, 0));
        assert!(Arc::ptr_eq(&r.resident().unwrap(), &winner));
    }

    #[test]
    fn test_publish_rejects_moved_page() {
        let r = reference();
        let epoch = r.epoch();
        r.set_location(OffRecord::new(Address(12), 1024, 0));
        r.set_location(OffRecord::new(Address(7), 512, 0));
        // Back at the old address, but a different image.
        assert!(!r.publish(test_page(), epoch));
        assert_eq!(r.state(), RefState::OnDisk);
        assert!(r.publish(test_page(), r.epoch()));
    }

    #[test]
    fn test_eviction_transitions() {
        let r = reference();
        assert!(!r.begin_eviction());
        r.publish(test_page(), 0);

        assert!(r.begin_eviction());
        assert_eq!(r.state(), RefState::EvictionPending);
        assert!(!r.begin_eviction());
        r.abort_eviction();
        assert_eq!(r.state(), RefState::InCache);

        assert!(r.begin_eviction());
        assert!(r.finish_eviction().is_some());
        assert_eq!(r.state(), RefState::OnDisk);
        assert!(r.resident().is_none());
    }

    #[test]
    fn test_pinned_page_is_not_evicted() {
        let r = reference();
        let page = test_page();
        page.pin();
        r.publish(page, 0);
        assert!(!r.begin_eviction());
        assert_eq!(r.state(), RefState::InCache);
    }

    #[test]
    fn test_location_updates() {
        let r = reference();
        assert_eq!(r.location(), OffRecord::new(Address(7), 512, 0));
        r.set_location(OffRecord::new(Address(40), 2048, 99));
        assert_eq!(r.location(), OffRecord::new(Address(40), 2048, 99));
    }
}
