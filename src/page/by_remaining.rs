//! By-remaining index pages
//!
//! The root page holds one 8-byte bucket head per aligned-remaining step;
//! each bucket heads a doubly linked list of slot pages holding sorted
//! 8-byte user-page positions. Both page types are scratch pages: the index
//! is rebuilt from the reopen region on every open.

use std::sync::Arc;

use crate::common::Position;
use crate::sheaf::RawPage;

/// Byte offset of the first entry in a slot page: previous (8), next (8),
/// count (4), pad (4).
const SLOT_ENTRIES: usize = 24;

/// Bucket-head array page.
pub struct RootPage {
    raw: Arc<RawPage>,
}

impl RootPage {
    pub fn new(raw: Arc<RawPage>) -> Self {
        RootPage { raw }
    }

    #[inline]
    pub fn raw(&self) -> &Arc<RawPage> {
        &self.raw
    }

    #[inline]
    pub fn position(&self) -> Position {
        self.raw.position()
    }

    /// Number of buckets the page can hold.
    pub fn buckets(&self) -> usize {
        self.raw.lock().bytes().len() / 8
    }

    pub fn head(&self, bucket: usize) -> Position {
        self.raw.lock().get_u64(bucket * 8)
    }

    pub fn set_head(&self, bucket: usize, position: Position) {
        self.raw.lock().put_u64(bucket * 8, position);
    }
}

/// Linked-list node of sorted user-page positions.
pub struct SlotPage {
    raw: Arc<RawPage>,
}

impl SlotPage {
    pub fn new(raw: Arc<RawPage>) -> Self {
        SlotPage { raw }
    }

    #[inline]
    pub fn raw(&self) -> &Arc<RawPage> {
        &self.raw
    }

    #[inline]
    pub fn position(&self) -> Position {
        self.raw.position()
    }

    pub fn previous(&self) -> Position {
        self.raw.lock().get_u64(0)
    }

    pub fn set_previous(&self, position: Position) {
        self.raw.lock().put_u64(0, position);
    }

    pub fn next(&self) -> Position {
        self.raw.lock().get_u64(8)
    }

    pub fn set_next(&self, position: Position) {
        self.raw.lock().put_u64(8, position);
    }

    pub fn len(&self) -> usize {
        self.raw.lock().get_u32(16) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        (self.raw.lock().bytes().len() - SLOT_ENTRIES) / 8
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    pub fn entries(&self) -> Vec<Position> {
        let core = self.raw.lock();
        let n = core.get_u32(16) as usize;
        (0..n).map(|i| core.get_u64(SLOT_ENTRIES + i * 8)).collect()
    }

    /// Insert `position` keeping the entries sorted. Returns false when the
    /// page is full.
    pub fn insert(&self, position: Position) -> bool {
        let mut core = self.raw.lock();
        let n = core.get_u32(16) as usize;
        if SLOT_ENTRIES + (n + 1) * 8 > core.bytes().len() {
            return false;
        }
        let mut at = n;
        for i in 0..n {
            if core.get_u64(SLOT_ENTRIES + i * 8) >= position {
                at = i;
                break;
            }
        }
        core.bytes_mut().copy_within(
            SLOT_ENTRIES + at * 8..SLOT_ENTRIES + n * 8,
            SLOT_ENTRIES + (at + 1) * 8,
        );
        core.put_u64(SLOT_ENTRIES + at * 8, position);
        core.put_u32(16, (n + 1) as u32);
        true
    }

    /// Remove `position` by binary search, compacting the entries. Returns
    /// false when the position is not present.
    pub fn remove(&self, position: Position) -> bool {
        let mut core = self.raw.lock();
        let n = core.get_u32(16) as usize;
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let v = core.get_u64(SLOT_ENTRIES + mid * 8);
            if v < position {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= n || core.get_u64(SLOT_ENTRIES + lo * 8) != position {
            return false;
        }
        core.bytes_mut().copy_within(
            SLOT_ENTRIES + (lo + 1) * 8..SLOT_ENTRIES + n * 8,
            SLOT_ENTRIES + lo * 8,
        );
        core.put_u64(SLOT_ENTRIES + (n - 1) * 8, 0);
        core.put_u32(16, (n - 1) as u32);
        true
    }

    /// Take the highest entry, or None when the page is empty.
    pub fn pop(&self) -> Option<Position> {
        let mut core = self.raw.lock();
        let n = core.get_u32(16) as usize;
        if n == 0 {
            return None;
        }
        let v = core.get_u64(SLOT_ENTRIES + (n - 1) * 8);
        core.put_u64(SLOT_ENTRIES + (n - 1) * 8, 0);
        core.put_u32(16, (n - 1) as u32);
        Some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheaf::{PageKind, Sheaf};
    use tempfile::tempfile;

    fn slot_page() -> SlotPage {
        let sheaf = Sheaf::new(tempfile().unwrap(), 512, 512, 512);
        SlotPage::new(sheaf.extend(PageKind::Slot))
    }

    #[test]
    fn test_insert_keeps_sorted_order() {
        let page = slot_page();
        for position in [4096u64, 1024, 8192, 2048] {
            assert!(page.insert(position));
        }
        assert_eq!(page.entries(), vec![1024, 2048, 4096, 8192]);
    }

    #[test]
    fn test_remove_binary_search() {
        let page = slot_page();
        for position in [1024u64, 2048, 4096] {
            page.insert(position);
        }
        assert!(page.remove(2048));
        assert!(!page.remove(2048));
        assert!(!page.remove(3072));
        assert_eq!(page.entries(), vec![1024, 4096]);
    }

    #[test]
    fn test_pop_takes_highest() {
        let page = slot_page();
        page.insert(1024);
        page.insert(4096);
        assert_eq!(page.pop(), Some(4096));
        assert_eq!(page.pop(), Some(1024));
        assert_eq!(page.pop(), None);
    }

    #[test]
    fn test_capacity_and_fill() {
        let page = slot_page();
        let capacity = page.capacity();
        assert_eq!(capacity, (512 - 24) / 8);
        for i in 0..capacity {
            assert!(page.insert(1024 * (i as u64 + 2)));
        }
        assert!(page.is_full());
        assert!(!page.insert(512));
    }
}
