//! Hazard references.
//!
//! A reader publishes the identity of a resident page in one of its
//! session's slots before trusting a pointer it loaded from a page
//! reference. The reclaiming agent scans every slot after marking a page for
//! eviction and backs off if it finds the page named.
//!
//! The table is bounded: `sessions x slots_per_session` atomics, allocated
//! when the tree is opened and owned by it.

use crate::page::MemPage;
use cambium_common::{CambiumError, Result};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Value of an unused hazard slot.
const EMPTY: usize = 0;

/// Hazard slots of every session of a tree.
pub struct HazardTable {
    slots: Box<[AtomicUsize]>,
    claimed: Box<[AtomicBool]>,
    per_session: usize,
}

impl HazardTable {
    /// Creates a table for `sessions` sessions of `per_session` slots each.
    pub fn new(sessions: usize, per_session: usize) -> Self {
        Self {
            slots: (0..sessions * per_session)
                .map(|_| AtomicUsize::new(EMPTY))
                .collect(),
            claimed: (0..sessions).map(|_| AtomicBool::new(false)).collect(),
            per_session,
        }
    }

    /// Maximum number of concurrent sessions.
    pub fn max_sessions(&self) -> usize {
        self.claimed.len()
    }

    /// Slots available to each session.
    pub fn slots_per_session(&self) -> usize {
        self.per_session
    }

    /// Claims a free row of slots.
    pub fn open_session(self: &Arc<Self>) -> Result<Session> {
        for (row, flag) in self.claimed.iter().enumerate() {
            if flag
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(Session {
                    table: Arc::clone(self),
                    row,
                });
            }
        }
        Err(CambiumError::SessionsExhausted {
            max: self.max_sessions(),
        })
    }

    /// Returns true if any session holds a hazard reference to `id`.
    ///
    /// Callers must issue a sequentially consistent fence between changing
    /// the page's state and calling this.
    pub fn is_hazard(&self, id: usize) -> bool {
        self.slots.iter().any(|s| s.load(Ordering::SeqCst) == id)
    }

    /// Number of hazard references currently published.
    pub fn active(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.load(Ordering::Acquire) != EMPTY)
            .count()
    }

    fn row(&self, row: usize) -> &[AtomicUsize] {
        &self.slots[row * self.per_session..(row + 1) * self.per_session]
    }
}

impl std::fmt::Debug for HazardTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HazardTable")
            .field("sessions", &self.max_sessions())
            .field("per_session", &self.per_session)
            .field("active", &self.active())
            .finish()
    }
}

/// Identity under which a page is published in the hazard table.
#[inline]
pub fn hazard_id(page: &Arc<MemPage>) -> usize {
    Arc::as_ptr(page) as usize
}

/// A claimed row of the hazard table. Released on drop.
#[derive(Debug)]
pub struct Session {
    table: Arc<HazardTable>,
    row: usize,
}

impl Session {
    /// Index of this session's row.
    pub fn id(&self) -> usize {
        self.row
    }

    /// Publishes a hazard reference to `page`.
    ///
    /// The store is sequentially consistent so that a reclaiming agent that
    /// has already marked the page either sees this slot or is seen by the
    /// caller's state recheck.
    pub fn publish(&self, page: Arc<MemPage>) -> Result<PageGuard<'_>> {
        let id = hazard_id(&page);
        for (slot, cell) in self.table.row(self.row).iter().enumerate() {
            if cell
                .compare_exchange(EMPTY, id, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(PageGuard {
                    session: self,
                    slot,
                    page,
                });
            }
        }
        Err(CambiumError::HazardTableFull {
            slots: self.table.per_session,
        })
    }

    /// Number of hazard references this session holds.
    pub fn held(&self) -> usize {
        self.table
            .row(self.row)
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) != EMPTY)
            .count()
    }

    fn clear(&self, slot: usize) {
        self.table.row(self.row)[slot].store(EMPTY, Ordering::Release);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for cell in self.table.row(self.row) {
            cell.store(EMPTY, Ordering::Release);
        }
        self.table.claimed[self.row].store(false, Ordering::Release);
    }
}

/// A resident page protected by a hazard reference.
///
/// The reference is cleared when the guard is dropped.
pub struct PageGuard<'s> {
    session: &'s Session,
    slot: usize,
    page: Arc<MemPage>,
}

impl<'s> PageGuard<'s> {
    /// The protected page, for use as a parent back-reference.
    pub fn page(&self) -> &Arc<MemPage> {
        &self.page
    }

    /// Session holding the reference.
    pub fn session(&self) -> &'s Session {
        self.session
    }
}

impl Deref for PageGuard<'_> {
    type Target = MemPage;

    fn deref(&self) -> &MemPage {
        &self.page
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.session.clear(self.slot);
    }
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("session", &self.session.row)
            .field("slot", &self.slot)
            .field("addr", &self.page.addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::test_page;

    #[test]
    fn test_sessions_are_bounded() {
        let table = Arc::new(HazardTable::new(2, 4));
        let s1 = table.open_session().unwrap();
        let s2 = table.open_session().unwrap();
        assert_ne!(s1.id(), s2.id());
        assert!(matches!(
            table.open_session(),
            Err(CambiumError::SessionsExhausted { max: 2 })
        ));
        drop(s1);
        let s3 = table.open_session().unwrap();
        assert_eq!(s3.id(), 0);
    }

    #[test]
    fn test_guard_publishes_and_clears() {
        let table = Arc::new(HazardTable::new(1, 2));
        let session = table.open_session().unwrap();
        let page = test_page();
        let id = hazard_id(&page);

        assert!(!table.is_hazard(id));
        let guard = session.publish(Arc::clone(&page)).unwrap();
        assert!(table.is_hazard(id));
        assert_eq!(session.held(), 1);
        assert_eq!(table.active(), 1);
        drop(guard);
        assert!(!table.is_hazard(id));
        assert_eq!(session.held(), 0);
    }

    #[test]
    fn test_slots_per_session_are_bounded() {
        let table = Arc::new(HazardTable::new(1, 2));
        let session = table.open_session().unwrap();
        let page = test_page();
        let _g1 = session.publish(Arc::clone(&page)).unwrap();
        let _g2 = session.publish(Arc::clone(&page)).unwrap();
        assert!(matches!(
            session.publish(Arc::clone(&page)),
            Err(CambiumError::HazardTableFull { slots: 2 })
        ));
    }

    #[test]
    fn test_session_drop_clears_row() {
        let table = Arc::new(HazardTable::new(1, 4));
        let page = test_page();
        {
            let session = table.open_session().unwrap();
            let guard = session.publish(Arc::clone(&page)).unwrap();
            std::mem::forget(guard);
            assert_eq!(table.active(), 1);
        }
        assert_eq!(table.active(), 0);
        assert!(table.open_session().is_ok());
    }
}
