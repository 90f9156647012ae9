//! Transactional mutator
//!
//! A thread-bound transaction. Allocations and writes are staged on private
//! interim pages and recorded in a private journal; nothing is visible to
//! other mutators until `commit` persists a journal-header slot and the
//! player replays the operations into the committed region. `rollback`
//! unwinds the reservations and returns every scratch page.
//!
//! The address map keys encode provenance: a negative key is an allocation
//! made by this mutator, a positive key a rewrite of a pre-existing block.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, warn};

use crate::by_remaining::{ByRemainingTable, PageSort};
use crate::common::{
    Address, BLOCK_HEADER_SIZE, PackError, Position, Result, align_down,
};
use crate::journal::Journal;
use crate::page::{AddressPage, BlockPage, JournalRecord};
use crate::pack::PackInner;
use crate::player::Player;
use crate::pool::Take;
use crate::sheaf::{PageKind, RawPage};

pub struct Mutator {
    inner: Arc<PackInner>,
    journal: Journal,
    /// Best-fit index over this mutator's private interim block pages.
    table: ByRemainingTable,
    addresses: BTreeMap<i64, Arc<RawPage>>,
    dirty: AHashMap<Position, Arc<RawPage>>,
    /// Temporary references staged this transaction: (address, slot).
    temporaries: Vec<(Address, Position)>,
    open: bool,
}

impl Mutator {
    pub(crate) fn new(inner: Arc<PackInner>) -> Result<Self> {
        let _guard = inner.page_move.read();
        let journal = Journal::new(Arc::clone(&inner.sheaf), &inner.interim)?;
        let table = ByRemainingTable::create(
            Arc::clone(&inner.sheaf),
            Arc::clone(&inner.boundary),
            &inner.interim,
            PageSort::Interim,
            inner.alignment(),
        )?;
        drop(_guard);
        Ok(Mutator {
            inner,
            journal,
            table,
            addresses: BTreeMap::new(),
            dirty: AHashMap::new(),
            temporaries: Vec::new(),
            open: true,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(PackError::Corrupt {
                detail: "pack is closed".to_string(),
            });
        }
        if self.open {
            Ok(())
        } else {
            Err(PackError::Corrupt {
                detail: "mutator is terminal; call clear() to reuse it".to_string(),
            })
        }
    }

    fn retain(&mut self, raw: &Arc<RawPage>) {
        self.dirty.insert(raw.position(), Arc::clone(raw));
    }

    /// Reserve an address slot, expanding the address region when the pool
    /// runs below its minimum.
    fn reserve_address(&mut self) -> Result<Address> {
        let inner = Arc::clone(&self.inner);
        loop {
            let guard = inner.page_move.read();
            match inner.address_pool.take() {
                Take::Expand => {
                    drop(guard);
                    inner.expand_address_region()?;
                }
                Take::Page(position) => {
                    let raw = inner.sheaf.get(position, PageKind::Address)?;
                    let page = AddressPage::new(Arc::clone(&raw));
                    match page.reserve(0) {
                        Some(address) => {
                            inner.address_pool.checkin(position, page.free_slots(0));
                            self.retain(&raw);
                            return Ok(address);
                        }
                        None => {
                            // The pool's count drifted; the page is full.
                            inner.address_pool.checkin(position, 0);
                        }
                    }
                }
            }
        }
    }

    /// Stage a block of `stride` bytes on a private interim page, seeding
    /// its payload, and return the page.
    fn stage(&mut self, address: Address, stride: u32, payload: &[u8]) -> Result<Arc<RawPage>> {
        let inner = Arc::clone(&self.inner);
        let payload_len = (stride - BLOCK_HEADER_SIZE) as u64;
        let position = self.table.best_fit(&inner.interim, payload_len)?;
        let raw = if position == 0 {
            inner
                .interim
                .new_blank(&inner.sheaf, false, PageKind::Block)?
        } else {
            inner.sheaf.get(position, PageKind::Block)?
        };
        let page = BlockPage::new(Arc::clone(&raw));
        let remaining = page
            .append(address, stride, payload, false)?
            .ok_or(PackError::Corrupt {
                detail: "staged block did not fit its best-fit page".to_string(),
            })?;
        self.table.add(&inner.interim, raw.position(), remaining)?;
        self.retain(&raw);
        Ok(raw)
    }

    /// Allocate a block of `size` bytes, returning its stable address. The
    /// block is zero-filled until written.
    pub fn allocate(&mut self, size: u64) -> Result<Address> {
        self.ensure_open()?;
        let inner = Arc::clone(&self.inner);
        if size > inner.maximum_block_size() {
            return Err(PackError::Overflow {
                size,
                capacity: inner.maximum_block_size(),
            });
        }
        let address = self.reserve_address()?;
        let _guard = inner.page_move.read();
        let stride = (size + BLOCK_HEADER_SIZE as u64) as u32;
        let raw = self.stage(address, stride, &[])?;
        self.addresses.insert(-(address as i64), raw);
        debug!("allocated {size} bytes at address {address}");
        Ok(address)
    }

    /// Flag the block at `address` temporary; the opener will surface it
    /// after a reopen.
    pub fn set_temporary(&mut self, address: Address) -> Result<()> {
        self.ensure_open()?;
        let inner = Arc::clone(&self.inner);
        let _guard = inner.page_move.read();
        if self.temporaries.iter().any(|&(a, _)| a == address) {
            return Ok(());
        }
        let reservation = inner.temporaries.reserve(&inner.sheaf, &inner.interim)?;
        self.retain(&reservation.page);
        if let Some(head) = reservation.new_head {
            inner.set_first_temporary(head)?;
        }
        self.temporaries.push((address, reservation.slot));
        Ok(())
    }

    /// Write `buf` into the block at `address`. Writes against committed
    /// blocks are staged on a private copy until commit.
    pub fn write(&mut self, address: Address, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let inner = Arc::clone(&self.inner);
        let _guard = inner.page_move.read();
        let staged = self
            .addresses
            .get(&-(address as i64))
            .or_else(|| self.addresses.get(&(address as i64)))
            .cloned();
        if let Some(raw) = staged {
            return BlockPage::new(raw).write_payload(address, buf);
        }
        // Read-through: copy the committed block onto an interim page.
        let user_raw = inner.boundary.dereference(address)?;
        user_raw.wait_until_unmirrored();
        let user = BlockPage::new(user_raw);
        let entry = user
            .find(address)?
            .filter(|e| !e.freed)
            .ok_or(PackError::FreedAddress { address })?;
        let body = (entry.stride - BLOCK_HEADER_SIZE) as u64;
        if buf.len() as u64 > body {
            return Err(PackError::Overflow {
                size: buf.len() as u64,
                capacity: body,
            });
        }
        let payload = user
            .read_payload(address)?
            .ok_or(PackError::FreedAddress { address })?;
        let raw = self.stage(address, entry.stride, &payload)?;
        self.addresses.insert(address as i64, Arc::clone(&raw));
        BlockPage::new(raw).write_payload(address, buf)
    }

    /// Read the block at `address`: the isolated version if this mutator
    /// allocated or wrote it, the committed version otherwise.
    pub fn read(&self, address: Address) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let inner = &self.inner;
        let _guard = inner.page_move.read();
        let staged = self
            .addresses
            .get(&-(address as i64))
            .or_else(|| self.addresses.get(&(address as i64)));
        let raw = match staged {
            Some(raw) => Arc::clone(raw),
            None => inner.boundary.dereference(address)?,
        };
        BlockPage::new(raw)
            .read_payload(address)?
            .ok_or(PackError::FreedAddress { address })
    }

    /// Read into `buf`, returning the number of bytes copied.
    pub fn read_into(&self, address: Address, buf: &mut [u8]) -> Result<usize> {
        let payload = self.read(address)?;
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(n)
    }

    /// Drop a private interim copy, keeping the table current.
    fn unstage(&mut self, raw: &Arc<RawPage>, address: Address) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let page = BlockPage::new(Arc::clone(raw));
        let before = page.remaining()?;
        let after = page.unallocate(address)?;
        self.table
            .remove(&inner.interim, raw.position(), before)?;
        self.table.add(&inner.interim, raw.position(), after)?;
        Ok(())
    }

    /// Free the block at `address`. A block allocated by this mutator is
    /// unwound locally; a committed block is journaled and stays readable
    /// to others until the commit plays.
    pub fn free(&mut self, address: Address) -> Result<()> {
        self.ensure_open()?;
        let inner = Arc::clone(&self.inner);
        let _guard = inner.page_move.read();
        if inner.static_addresses.lock().contains(&address) {
            return Err(PackError::FreedStaticAddress { address });
        }
        if let Some(raw) = self.addresses.remove(&-(address as i64)) {
            self.unstage(&raw, address)?;
            let slot_page = align_down(address, inner.sheaf.page_size());
            let slots = AddressPage::new(inner.sheaf.get(slot_page, PageKind::Address)?);
            slots.release(address);
            self.retain(slots.raw());
            inner.address_pool.note_freed_slot(slot_page);
            if let Some(index) = self.temporaries.iter().position(|&(a, _)| a == address) {
                let (_, slot) = self.temporaries.remove(index);
                inner.temporaries.release(&inner.sheaf, slot)?;
            }
            return Ok(());
        }
        if let Some(raw) = self.addresses.remove(&(address as i64)) {
            // Discard the staged rewrite; the committed copy dies below.
            self.unstage(&raw, address)?;
        }
        // Validates the address and waits out an in-flight mirror.
        let user = inner.boundary.dereference(address)?;
        user.wait_until_unmirrored();
        self.journal
            .append(&inner.interim, &JournalRecord::Free { address })
    }

    /// Make every staged operation durable and visible. The commit is
    /// durable once its journal-header slot is forced; playback then
    /// applies the operations to the committed region.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let inner = Arc::clone(&self.inner);
        let _guard = inner.page_move.read();
        for (&key, raw) in &self.addresses {
            self.journal.append(
                &inner.interim,
                &JournalRecord::Write {
                    address: key.unsigned_abs(),
                    source: raw.position(),
                },
            )?;
        }
        for &(address, slot) in &self.temporaries {
            self.journal
                .append(&inner.interim, &JournalRecord::Temporary { address, slot })?;
        }
        self.journal.append(&inner.interim, &JournalRecord::Commit)?;
        self.journal
            .append(&inner.interim, &JournalRecord::Terminate)?;
        self.journal.refresh_links();
        inner.sheaf.flush(self.dirty.values())?;
        inner.sheaf.flush(self.journal.pages())?;
        inner.sheaf.force()?;
        let slot = inner.header_pool.allocate();
        let start = self.journal.start();
        inner.sheaf.write_raw(slot, &start.to_le_bytes())?;
        inner.sheaf.force()?;
        debug!("commit durable: journal at {start}, header slot {slot}");
        Player::new(&inner, slot, start).commit()?;
        self.release_scratch();
        self.temporaries.clear();
        self.open = false;
        Ok(())
    }

    /// Abandon the transaction: return reserved address slots, clear
    /// temporary reservations, and release every scratch page.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        let inner = Arc::clone(&self.inner);
        let _guard = inner.page_move.read();
        let reserved: Vec<Address> = self
            .addresses
            .keys()
            .filter(|&&key| key < 0)
            .map(|&key| key.unsigned_abs())
            .collect();
        for address in reserved {
            let slot_page = align_down(address, inner.sheaf.page_size());
            let slots = AddressPage::new(inner.sheaf.get(slot_page, PageKind::Address)?);
            slots.release(address);
            self.dirty.insert(slot_page, Arc::clone(slots.raw()));
            inner.address_pool.note_freed_slot(slot_page);
        }
        for &(_, slot) in &self.temporaries {
            inner.temporaries.release(&inner.sheaf, slot)?;
        }
        self.temporaries.clear();
        inner.sheaf.flush(self.dirty.values())?;
        self.release_scratch();
        self.open = false;
        debug!("mutator rolled back");
        Ok(())
    }

    /// Return every private page to the interim pool.
    fn release_scratch(&mut self) {
        let inner = &self.inner;
        let mut positions: Vec<Position> = self
            .addresses
            .values()
            .map(|raw| raw.position())
            .collect();
        positions.sort_unstable();
        positions.dedup();
        for position in positions {
            inner.interim.free(&inner.sheaf, position);
        }
        self.addresses.clear();
        self.dirty.clear();
        let _ = self.table.dispose(&inner.interim);
        self.journal.dispose(&inner.interim);
    }

    /// Re-arm a terminal mutator for reuse.
    pub fn clear(&mut self) -> Result<()> {
        if self.open {
            return Err(PackError::Corrupt {
                detail: "clear() on an open mutator".to_string(),
            });
        }
        let inner = Arc::clone(&self.inner);
        let _guard = inner.page_move.read();
        self.journal = Journal::new(Arc::clone(&inner.sheaf), &inner.interim)?;
        self.table = ByRemainingTable::create(
            Arc::clone(&inner.sheaf),
            Arc::clone(&inner.boundary),
            &inner.interim,
            PageSort::Interim,
            inner.alignment(),
        )?;
        self.open = true;
        Ok(())
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        if self.open && !self.inner.is_closed() {
            if let Err(e) = self.rollback() {
                warn!("rollback on drop failed: {e}");
            }
        }
    }
}
