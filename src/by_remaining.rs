//! By-remaining table
//!
//! Best-fit index of block pages keyed by aligned free space. Bucket `i`
//! holds pages whose remaining bytes, rounded down to the alignment, equal
//! `i × alignment`; bucket 0 is excluded. The table is backed by a root
//! page of bucket heads and chains of slot pages, all scratch allocations.
//!
//! Entries drift as pages move, fill, and free; `best_fit` revalidates
//! every candidate against the live page and repairs the table lazily,
//! re-filing entries whose remaining no longer matches their bucket.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::boundary::Boundary;
use crate::common::{
    BLOCK_HEADER_SIZE, BLOCK_PAGE_HEADER_SIZE, Position, Result,
};
use crate::page::{BlockPage, RootPage, SlotPage};
use crate::pool::InterimPool;
use crate::sheaf::{PageKind, RawPage, Sheaf};

/// Which side of the commit the indexed pages live on. User tables index
/// committed block pages; interim tables index a mutator's private staging
/// pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSort {
    User,
    Interim,
}

pub struct ByRemainingTable {
    sheaf: Arc<Sheaf>,
    /// Chain links inside the pages hold positions recorded at link time;
    /// every traversal adjusts them through the move map.
    boundary: Arc<Boundary>,
    root: RootPage,
    sort: PageSort,
    alignment: u64,
    /// Strong references to the table's slot pages. The table is an
    /// in-memory-only structure over scratch pages; pinning them keeps the
    /// weak sheaf cache from dropping unflushed state.
    held: Mutex<AHashMap<Position, Arc<RawPage>>>,
}

impl ByRemainingTable {
    /// Allocate a fresh table over a scratch root page.
    pub fn create(
        sheaf: Arc<Sheaf>,
        boundary: Arc<Boundary>,
        interim: &InterimPool,
        sort: PageSort,
        alignment: u64,
    ) -> Result<Self> {
        let root = RootPage::new(interim.new_blank(&sheaf, false, PageKind::ByRemaining)?);
        Ok(ByRemainingTable {
            sheaf,
            boundary,
            root,
            sort,
            alignment,
            held: Mutex::new(AHashMap::new()),
        })
    }

    pub fn root_position(&self) -> Position {
        self.root.position()
    }

    /// Full payload capacity of a block page.
    fn max_block_size(&self) -> u64 {
        self.sheaf.page_size() - BLOCK_PAGE_HEADER_SIZE as u64 - BLOCK_HEADER_SIZE as u64
    }

    #[inline]
    fn bucket_of(&self, remaining: u32) -> usize {
        (remaining as u64 / self.alignment) as usize
    }

    fn max_bucket(&self) -> usize {
        let by_capacity =
            (self.sheaf.page_size() - BLOCK_PAGE_HEADER_SIZE as u64) / self.alignment;
        (by_capacity as usize).min(self.root.buckets() - 1)
    }

    /// Follow a chain link, adjusting it through the move map first.
    fn slot_page(&self, link: Position) -> Result<SlotPage> {
        let position = self.boundary.adjust(link);
        let raw = self.sheaf.get(position, PageKind::Slot)?;
        self.held.lock().insert(position, Arc::clone(&raw));
        Ok(SlotPage::new(raw))
    }

    fn release_slot_page(&self, interim: &InterimPool, position: Position) {
        self.held.lock().remove(&position);
        interim.free(&self.sheaf, position);
    }

    /// File `position` under its aligned-remaining bucket.
    pub fn add(&self, interim: &InterimPool, position: Position, remaining: u32) -> Result<()> {
        let bucket = self.bucket_of(remaining);
        if bucket == 0 {
            return Ok(());
        }
        debug_assert!(bucket <= self.max_bucket());
        let head = self.root.head(bucket);
        if head != 0 && self.slot_page(head)?.insert(position) {
            return Ok(());
        }
        // Head absent or full: push a fresh allocating page.
        let raw = interim.new_blank(&self.sheaf, false, PageKind::Slot)?;
        self.held.lock().insert(raw.position(), Arc::clone(&raw));
        let page = SlotPage::new(raw);
        page.set_next(head);
        if head != 0 {
            self.slot_page(head)?.set_previous(page.position());
        }
        self.root.set_head(bucket, page.position());
        page.insert(position);
        Ok(())
    }

    /// Drop `position` from the bucket derived from `remaining`. Returns
    /// false when the entry is not present (it may have drifted or been
    /// claimed by a best-fit).
    pub fn remove(&self, interim: &InterimPool, position: Position, remaining: u32) -> Result<bool> {
        let bucket = self.bucket_of(remaining);
        if bucket == 0 {
            return Ok(false);
        }
        let mut at = self.root.head(bucket);
        while at != 0 {
            let page = self.slot_page(at)?;
            if page.remove(position) {
                if page.is_empty() {
                    self.unlink_empty(interim, bucket, &page);
                }
                return Ok(true);
            }
            at = page.next();
        }
        Ok(false)
    }

    /// Unlink an emptied slot page so that empties only ever accumulate on
    /// the allocating head page.
    fn unlink_empty(&self, interim: &InterimPool, bucket: usize, page: &SlotPage) {
        let previous = page.previous();
        let next = page.next();
        if previous == 0 {
            // Allocating page: keep it unless a successor can take over.
            if next != 0 {
                self.root.set_head(bucket, next);
                if let Ok(successor) = self.slot_page(next) {
                    successor.set_previous(0);
                }
                self.release_slot_page(interim, page.position());
            }
            return;
        }
        if let Ok(before) = self.slot_page(previous) {
            before.set_next(next);
        }
        if next != 0 {
            if let Ok(after) = self.slot_page(next) {
                after.set_previous(previous);
            }
        }
        self.release_slot_page(interim, page.position());
    }

    /// Find a page with room for a block of `payload` bytes, preferring the
    /// tightest bucket. Candidates are popped and revalidated against the
    /// live page; entries that drifted are re-filed. Returns 0 when nothing
    /// fits or the request is past the largest indexable size.
    pub fn best_fit(&self, interim: &InterimPool, payload: u64) -> Result<Position> {
        if payload > self.max_block_size() - self.alignment {
            return Ok(0);
        }
        let stride = payload + BLOCK_HEADER_SIZE as u64;
        let start = stride.div_ceil(self.alignment) as usize;
        for bucket in start..=self.max_bucket() {
            loop {
                let head = self.root.head(bucket);
                if head == 0 {
                    break;
                }
                let page = self.slot_page(head)?;
                let Some(position) = page.pop() else {
                    let next = page.next();
                    if next == 0 {
                        break;
                    }
                    self.root.set_head(bucket, next);
                    self.slot_page(next)?.set_previous(0);
                    self.release_slot_page(interim, page.position());
                    continue;
                };
                let current = self.boundary.adjust(position);
                match self.validate(current, bucket) {
                    Ok(Validation::Valid) => return Ok(current),
                    Ok(Validation::Refile(remaining)) => {
                        self.add(interim, current, remaining)?;
                    }
                    // Mirrored pages return after compaction; anything
                    // unreadable is dropped from the table.
                    Ok(Validation::Drop) | Err(_) => {}
                }
            }
        }
        Ok(0)
    }

    fn validate(&self, position: Position, bucket: usize) -> Result<Validation> {
        let raw = self.sheaf.get(position, PageKind::Block)?;
        if raw.is_mirrored() {
            return Ok(Validation::Drop);
        }
        let page = BlockPage::new(raw);
        let sort_matches = match self.sort {
            PageSort::User => page.is_user(),
            PageSort::Interim => !page.is_user(),
        };
        if !sort_matches {
            return Ok(Validation::Drop);
        }
        let remaining = page.remaining()?;
        if self.bucket_of(remaining) == bucket {
            Ok(Validation::Valid)
        } else if remaining as u64 >= self.alignment {
            Ok(Validation::Refile(remaining))
        } else {
            Ok(Validation::Drop)
        }
    }

    /// Snapshot of every indexed position (reopen region).
    pub fn entries(&self) -> Result<Vec<Position>> {
        let mut out = Vec::new();
        for bucket in 1..=self.max_bucket() {
            let mut at = self.root.head(bucket);
            while at != 0 {
                let page = self.slot_page(at)?;
                out.extend(page.entries());
                at = page.next();
            }
        }
        Ok(out)
    }

    /// Release the root and every slot page back to the interim pool.
    pub fn dispose(&self, interim: &InterimPool) -> Result<()> {
        for bucket in 1..=self.max_bucket() {
            let mut at = self.root.head(bucket);
            while at != 0 {
                let page = self.slot_page(at)?;
                let next = page.next();
                self.release_slot_page(interim, page.position());
                at = next;
            }
        }
        self.held.lock().clear();
        interim.free(&self.sheaf, self.root.position());
        Ok(())
    }
}

enum Validation {
    Valid,
    Refile(u32),
    Drop,
}
