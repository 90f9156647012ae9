//! Address page overlay
//!
//! An address page is an array of 8-byte slots covering the whole page. A
//! slot holds 0 (free), `RESERVED_SLOT` (reserved by an uncommitted
//! mutator), or the position of the user block page currently holding the
//! block. The slot's own file position is the block's stable address.

use std::sync::Arc;

use crate::common::{Address, Position, RESERVED_SLOT};
use crate::sheaf::RawPage;

pub struct AddressPage {
    raw: Arc<RawPage>,
}

impl AddressPage {
    pub fn new(raw: Arc<RawPage>) -> Self {
        AddressPage { raw }
    }

    #[inline]
    pub fn raw(&self) -> &Arc<RawPage> {
        &self.raw
    }

    #[inline]
    pub fn position(&self) -> Position {
        self.raw.position()
    }

    fn slot_offset(&self, address: Address) -> usize {
        let position = self.raw.position();
        debug_assert!(address >= position);
        let offset = (address - position) as usize;
        debug_assert_eq!(offset % 8, 0);
        offset
    }

    /// Read the slot for `address`.
    pub fn get(&self, address: Address) -> u64 {
        let offset = self.slot_offset(address);
        self.raw.lock().get_u64(offset)
    }

    /// Write the slot for `address`.
    pub fn set(&self, address: Address, value: u64) {
        let offset = self.slot_offset(address);
        self.raw.lock().put_u64(offset, value);
    }

    /// Write the slot for `address` only if it currently reads `expected`.
    pub fn set_if(&self, address: Address, expected: u64, value: u64) -> bool {
        let offset = self.slot_offset(address);
        let mut core = self.raw.lock();
        if core.get_u64(offset) != expected {
            return false;
        }
        core.put_u64(offset, value);
        true
    }

    /// Claim the first free slot, stamping it reserved. Returns the new
    /// address, or None when the page is full.
    pub fn reserve(&self, skip: usize) -> Option<Address> {
        let position = self.raw.position();
        let mut core = self.raw.lock();
        let len = core.bytes().len();
        let mut offset = skip * 8;
        while offset + 8 <= len {
            if core.get_u64(offset) == 0 {
                core.put_u64(offset, RESERVED_SLOT);
                return Some(position + offset as u64);
            }
            offset += 8;
        }
        None
    }

    /// Return a reserved slot to the free state (rollback path).
    pub fn release(&self, address: Address) {
        let offset = self.slot_offset(address);
        let mut core = self.raw.lock();
        debug_assert_eq!(core.get_u64(offset), RESERVED_SLOT);
        core.put_u64(offset, 0);
    }

    /// Count free slots, skipping the first `skip` slots.
    pub fn free_slots(&self, skip: usize) -> u32 {
        let core = self.raw.lock();
        let len = core.bytes().len();
        let mut n = 0;
        let mut offset = skip * 8;
        while offset + 8 <= len {
            if core.get_u64(offset) == 0 {
                n += 1;
            }
            offset += 8;
        }
        n
    }

    /// Iterate `(address, value)` over every non-free slot.
    pub fn live_slots(&self, skip: usize) -> Vec<(Address, u64)> {
        let position = self.raw.position();
        let core = self.raw.lock();
        let len = core.bytes().len();
        let mut out = Vec::new();
        let mut offset = skip * 8;
        while offset + 8 <= len {
            let value = core.get_u64(offset);
            if value != 0 {
                out.push((position + offset as u64, value));
            }
            offset += 8;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheaf::{PageKind, Sheaf};
    use tempfile::tempfile;

    fn page() -> AddressPage {
        let sheaf = Sheaf::new(tempfile().unwrap(), 512, 512, 512);
        AddressPage::new(sheaf.extend(PageKind::Address))
    }

    #[test]
    fn test_reserve_walks_slots_in_order() {
        let page = page();
        let a = page.reserve(0).unwrap();
        let b = page.reserve(0).unwrap();
        assert_eq!(a, 512);
        assert_eq!(b, 520);
        assert_eq!(page.get(a), RESERVED_SLOT);
        assert_eq!(page.free_slots(0), 512 / 8 - 2);
    }

    #[test]
    fn test_release_returns_slot() {
        let page = page();
        let a = page.reserve(0).unwrap();
        page.release(a);
        assert_eq!(page.get(a), 0);
        assert_eq!(page.reserve(0).unwrap(), a);
    }

    #[test]
    fn test_reserve_exhaustion() {
        let page = page();
        for _ in 0..512 / 8 {
            assert!(page.reserve(0).is_some());
        }
        assert!(page.reserve(0).is_none());
    }

    #[test]
    fn test_set_if_guards_expected_value() {
        let page = page();
        let a = page.reserve(0).unwrap();
        assert!(!page.set_if(a, 0, 4096));
        assert!(page.set_if(a, RESERVED_SLOT, 4096));
        assert_eq!(page.get(a), 4096);
    }
}
