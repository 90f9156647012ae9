//! Address boundary and page mover
//!
//! Tracks the position separating address pages from user pages and the
//! move map of every page relocation performed so far. Stable addresses are
//! resolved to current block pages here: read the slot, adjust the position
//! through the move map, load the page, and confirm it still holds the
//! block, retrying while a relocation or compaction is in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::common::{Address, PackError, Position, RESERVED_SLOT, Result, align_down};
use crate::page::{AddressPage, BlockPage};
use crate::sheaf::{PageKind, RawPage, Sheaf};

/// Dereference retries before the store is declared corrupt. Retries only
/// happen while a slot is mid-update or a page is mid-compaction, both of
/// which are bounded by player progress.
const DEREFERENCE_RETRY_LIMIT: usize = 1024;

pub struct Boundary {
    sheaf: Arc<Sheaf>,
    position: AtomicU64,
    moves: Mutex<AHashMap<Position, Position>>,
}

impl Boundary {
    pub fn new(sheaf: Arc<Sheaf>, position: Position) -> Self {
        Boundary {
            sheaf,
            position: AtomicU64::new(position),
            moves: Mutex::new(AHashMap::new()),
        }
    }

    /// First user-region page position.
    #[inline]
    pub fn position(&self) -> Position {
        self.position.load(Ordering::Acquire)
    }

    /// Advance the boundary past a page just promoted to an address page.
    /// Idempotent under journal replay.
    pub fn advance_past(&self, page: Position) {
        let next = page + self.sheaf.page_size();
        self.position.fetch_max(next, Ordering::AcqRel);
    }

    /// Record a page relocation.
    pub fn record_move(&self, from: Position, to: Position) {
        debug_assert_ne!(from, to);
        self.moves.lock().insert(from, to);
    }

    /// Apply the transitive closure of the move map to a position. The
    /// intra-page offset is preserved. Idempotent while the map is stable.
    pub fn adjust(&self, position: Position) -> Position {
        let page_size = self.sheaf.page_size();
        let offset = position % page_size;
        let mut page = position - offset;
        let moves = self.moves.lock();
        let mut hops = moves.len();
        while let Some(&to) = moves.get(&page) {
            page = to;
            if hops == 0 {
                break;
            }
            hops -= 1;
        }
        page + offset
    }

    /// Adjust then fetch from the sheaf.
    pub fn load(&self, position: Position, kind: PageKind) -> Result<Arc<RawPage>> {
        self.sheaf.get(self.adjust(position), kind)
    }

    /// Resolve a stable address to the user block page currently holding
    /// its block. Never returns a page for a freed address; a slot that
    /// reads 0 (or still reserved) is a caller bug.
    pub fn dereference(&self, address: Address) -> Result<Arc<RawPage>> {
        let page_size = self.sheaf.page_size();
        let slot_page = align_down(address, page_size);
        for _ in 0..DEREFERENCE_RETRY_LIMIT {
            let slots = AddressPage::new(self.sheaf.get(slot_page, PageKind::Address)?);
            let value = slots.get(address);
            if value == 0 || value == RESERVED_SLOT {
                return Err(PackError::FreedAddress { address });
            }
            let page = self.sheaf.get(self.adjust(value), PageKind::Block)?;
            if BlockPage::new(Arc::clone(&page)).contains_live(address)? {
                return Ok(page);
            }
            // Either the block's page moved again after the slot was read,
            // or the page is mid-compaction. Wait out a mirror and retry.
            page.wait_until_unmirrored();
            std::thread::yield_now();
        }
        Err(PackError::Corrupt {
            detail: format!("dereference of address {address} did not settle"),
        })
    }

    /// Number of recorded moves, for diagnostics.
    pub fn moves_len(&self) -> usize {
        self.moves.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    fn boundary() -> Boundary {
        let sheaf = Arc::new(Sheaf::new(tempfile().unwrap(), 1024, 1024, 1024));
        Boundary::new(sheaf, 2048)
    }

    #[test]
    fn test_adjust_is_transitive_and_offset_preserving() {
        let boundary = boundary();
        boundary.record_move(2048, 4096);
        boundary.record_move(4096, 8192);
        assert_eq!(boundary.adjust(2048), 8192);
        assert_eq!(boundary.adjust(2048 + 40), 8192 + 40);
        assert_eq!(boundary.adjust(3072), 3072);
    }

    #[test]
    fn test_adjust_idempotent_on_stable_map() {
        let boundary = boundary();
        boundary.record_move(2048, 4096);
        let once = boundary.adjust(2048);
        assert_eq!(boundary.adjust(once), once);
    }

    #[test]
    fn test_advance_past_is_monotonic() {
        let boundary = boundary();
        boundary.advance_past(2048);
        assert_eq!(boundary.position(), 3072);
        boundary.advance_past(2048);
        assert_eq!(boundary.position(), 3072);
        boundary.advance_past(3072);
        assert_eq!(boundary.position(), 4096);
    }

    #[test]
    fn test_dereference_rejects_freed_slot() {
        let sheaf = Arc::new(Sheaf::new(tempfile().unwrap(), 1024, 1024, 1024));
        let page = sheaf.extend(PageKind::Address);
        sheaf.flush([&page]).unwrap();
        let boundary = Boundary::new(Arc::clone(&sheaf), 2048);
        assert!(matches!(
            boundary.dereference(1024 + 16),
            Err(PackError::FreedAddress { address }) if address == 1040
        ));
    }
}
