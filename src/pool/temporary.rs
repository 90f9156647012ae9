//! Temporary block pool
//!
//! Durable registry of block addresses flagged temporary, kept as a chain
//! of reference pages threaded through slot 0 of each page. The chain head
//! lives in the file header so the opener can enumerate the set after a
//! reopen. Reservations are staged like address slots: stamped reserved by
//! the mutator, written by journal playback, cleared on rollback or free.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;

use crate::common::{Address, PackError, Position, RESERVED_SLOT, Result, align_down};
use crate::page::AddressPage;
use crate::pool::InterimPool;
use crate::sheaf::{PageKind, RawPage, Sheaf};

struct TempState {
    head: Position,
    /// Chain order, head first.
    pages: Vec<Position>,
    /// Committed references: slot position to the temporary address.
    entries: AHashMap<Position, Address>,
    /// Slots stamped reserved by open mutators.
    reserved: AHashSet<Position>,
}

/// Outcome of a reservation: the slot, its page (for the caller's dirty
/// set), and the new chain head when a reference page had to be added.
pub struct TempReservation {
    pub slot: Position,
    pub page: Arc<RawPage>,
    pub new_head: Option<Position>,
}

pub struct TemporaryPool {
    state: Mutex<TempState>,
}

impl TemporaryPool {
    pub fn new() -> Self {
        TemporaryPool {
            state: Mutex::new(TempState {
                head: 0,
                pages: Vec::new(),
                entries: AHashMap::new(),
                reserved: AHashSet::new(),
            }),
        }
    }

    /// Walk the chain starting at `head`, collecting committed references.
    /// Reservations abandoned by a crash read as `RESERVED_SLOT` and are
    /// scrubbed back to free.
    pub fn load(sheaf: &Sheaf, head: Position) -> Result<Self> {
        let pool = TemporaryPool::new();
        {
            let mut state = pool.state.lock();
            state.head = head;
            let mut position = head;
            let mut hops = 0usize;
            while position != 0 {
                if hops > 1_000_000 {
                    return Err(PackError::Corrupt {
                        detail: "temporary reference chain does not terminate".to_string(),
                    });
                }
                hops += 1;
                let page = AddressPage::new(sheaf.get(position, PageKind::Address)?);
                for (slot, value) in page.live_slots(1) {
                    if value == RESERVED_SLOT {
                        page.set(slot, 0);
                    } else {
                        state.entries.insert(slot, value);
                    }
                }
                state.pages.push(position);
                position = page.raw().lock().get_u64(0);
            }
        }
        Ok(pool)
    }

    pub fn head(&self) -> Position {
        self.state.lock().head
    }

    pub fn pages(&self) -> Vec<Position> {
        self.state.lock().pages.clone()
    }

    pub fn contains_page(&self, position: Position) -> bool {
        self.state.lock().pages.contains(&position)
    }

    /// Committed temporary addresses.
    pub fn enumerate(&self) -> BTreeSet<Address> {
        self.state.lock().entries.values().copied().collect()
    }

    /// Stamp a reference slot reserved for an open mutator, growing the
    /// chain with a fresh durable page when every slot is taken.
    pub fn reserve(&self, sheaf: &Sheaf, interim: &InterimPool) -> Result<TempReservation> {
        let mut state = self.state.lock();
        let pages = state.pages.clone();
        for position in pages {
            let page = AddressPage::new(sheaf.get(position, PageKind::Address)?);
            if let Some(slot) = page.reserve(1) {
                state.reserved.insert(slot);
                return Ok(TempReservation {
                    slot,
                    page: Arc::clone(page.raw()),
                    new_head: None,
                });
            }
        }
        let raw = interim.new_blank(sheaf, true, PageKind::Address)?;
        let page = AddressPage::new(Arc::clone(&raw));
        let old_head = state.head;
        raw.lock().put_u64(0, old_head);
        let position = raw.position();
        state.head = position;
        state.pages.insert(0, position);
        let slot = page.reserve(1).ok_or(PackError::Corrupt {
            detail: "fresh temporary reference page has no free slot".to_string(),
        })?;
        state.reserved.insert(slot);
        Ok(TempReservation {
            slot,
            page: raw,
            new_head: Some(position),
        })
    }

    /// Return a reserved slot to free (rollback path).
    pub fn release(&self, sheaf: &Sheaf, slot: Position) -> Result<()> {
        let mut state = self.state.lock();
        if state.reserved.remove(&slot) {
            let page_position = align_down(slot, sheaf.page_size());
            let page = AddressPage::new(sheaf.get(page_position, PageKind::Address)?);
            page.release(slot);
        }
        Ok(())
    }

    /// Playback of a `Temporary` record: bind the slot to the address.
    pub fn set(&self, sheaf: &Sheaf, slot: Position, address: Address) -> Result<Arc<RawPage>> {
        let mut state = self.state.lock();
        let page_position = align_down(slot, sheaf.page_size());
        let page = AddressPage::new(sheaf.get(page_position, PageKind::Address)?);
        page.set(slot, address);
        state.reserved.remove(&slot);
        state.entries.insert(slot, address);
        Ok(Arc::clone(page.raw()))
    }

    /// Unlatch the reference for a freed temporary block, if any.
    pub fn clear_address(&self, sheaf: &Sheaf, address: Address) -> Result<Option<Arc<RawPage>>> {
        let mut state = self.state.lock();
        let slot = state
            .entries
            .iter()
            .find(|&(_, &a)| a == address)
            .map(|(&s, _)| s);
        match slot {
            Some(slot) => {
                state.entries.remove(&slot);
                let page_position = align_down(slot, sheaf.page_size());
                let page = AddressPage::new(sheaf.get(page_position, PageKind::Address)?);
                page.set(slot, 0);
                Ok(Some(Arc::clone(page.raw())))
            }
            None => Ok(None),
        }
    }

    /// Rekey state after a reference page relocation; fixes the chain link
    /// that pointed at the old position and reports the new head if the
    /// moved page was first.
    pub fn note_move(
        &self,
        sheaf: &Sheaf,
        from: Position,
        to: Position,
    ) -> Result<Option<Position>> {
        let mut state = self.state.lock();
        let index = match state.pages.iter().position(|&p| p == from) {
            Some(index) => index,
            None => return Ok(None),
        };
        state.pages[index] = to;
        let delta_rekey = |map_keys: Vec<Position>| -> Vec<(Position, Position)> {
            map_keys
                .into_iter()
                .filter(|&slot| align_down(slot, sheaf.page_size()) == from)
                .map(|slot| (slot, to + (slot - from)))
                .collect()
        };
        for (old, new) in delta_rekey(state.entries.keys().copied().collect()) {
            let value = state.entries.remove(&old).unwrap();
            state.entries.insert(new, value);
        }
        for (old, new) in delta_rekey(state.reserved.iter().copied().collect()) {
            state.reserved.remove(&old);
            state.reserved.insert(new);
        }
        if index == 0 {
            state.head = to;
            Ok(Some(to))
        } else {
            let previous = state.pages[index - 1];
            let page = sheaf.get(previous, PageKind::Address)?;
            page.lock().put_u64(0, to);
            sheaf.flush([&page])?;
            Ok(None)
        }
    }
}

impl Default for TemporaryPool {
    fn default() -> Self {
        TemporaryPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    fn fixture() -> (Arc<Sheaf>, InterimPool, TemporaryPool) {
        let sheaf = Arc::new(Sheaf::new(tempfile().unwrap(), 512, 512, 512));
        (sheaf, InterimPool::new(512), TemporaryPool::new())
    }

    #[test]
    fn test_reserve_grows_chain_and_set_commits() {
        let (sheaf, interim, pool) = fixture();
        let r = pool.reserve(&sheaf, &interim).unwrap();
        assert_eq!(r.new_head, Some(512));
        // Slot 0 is the chain link; the first reservation lands on slot 1.
        assert_eq!(r.slot, 512 + 8);
        pool.set(&sheaf, r.slot, 9999).unwrap();
        assert_eq!(pool.enumerate(), BTreeSet::from([9999]));
    }

    #[test]
    fn test_release_returns_slot() {
        let (sheaf, interim, pool) = fixture();
        let r = pool.reserve(&sheaf, &interim).unwrap();
        pool.release(&sheaf, r.slot).unwrap();
        let again = pool.reserve(&sheaf, &interim).unwrap();
        assert_eq!(again.slot, r.slot);
        assert_eq!(again.new_head, None);
    }

    #[test]
    fn test_clear_address_unlatches() {
        let (sheaf, interim, pool) = fixture();
        let r = pool.reserve(&sheaf, &interim).unwrap();
        pool.set(&sheaf, r.slot, 4242).unwrap();
        assert!(pool.clear_address(&sheaf, 4242).unwrap().is_some());
        assert!(pool.clear_address(&sheaf, 4242).unwrap().is_none());
        assert!(pool.enumerate().is_empty());
    }

    #[test]
    fn test_load_scrubs_abandoned_reservations() {
        let (sheaf, interim, pool) = fixture();
        let committed = pool.reserve(&sheaf, &interim).unwrap();
        pool.set(&sheaf, committed.slot, 777).unwrap();
        let abandoned = pool.reserve(&sheaf, &interim).unwrap();
        sheaf.flush([&committed.page, &abandoned.page]).unwrap();
        let reloaded = TemporaryPool::load(&sheaf, pool.head()).unwrap();
        assert_eq!(reloaded.enumerate(), BTreeSet::from([777]));
        // The abandoned slot is free again.
        let r = reloaded.reserve(&sheaf, &interim).unwrap();
        assert_eq!(r.slot, abandoned.slot);
    }
}
