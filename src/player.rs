//! Journal player
//!
//! Replays a committed journal against the store. Records are read up to
//! `Terminate` and applied in phases: structure operations (page moves,
//! address-page creation, truncation, block moves) in journal order, then
//! writes, then frees, then temporary references. Every operation is
//! idempotent, so a journal whose header slot survived a crash can be
//! replayed from scratch.
//!
//! Address-slot updates latch their address in the address locker; the
//! latches are held until playback completes, serializing a journaled free
//! against a later reallocation of the same slot.

use std::sync::Arc;

use ahash::AHashSet;
use log::debug;

use crate::common::{
    Address, PackError, Position, RESERVED_SLOT, Result, align_down,
};
use crate::journal::read_records;
use crate::page::{AddressPage, BlockPage, JournalRecord};
use crate::pack::PackInner;
use crate::sheaf::{PageKind, RawPage};

pub(crate) struct Player<'a> {
    inner: &'a PackInner,
    header_slot: Position,
    start: Position,
    dirty: Vec<Arc<RawPage>>,
    /// Zeroed address pages created this playback; flushed strictly after
    /// the retargeted slots are forced so that a crash can always replay
    /// the moves from intact source pages.
    created: Vec<Arc<RawPage>>,
    latched: AHashSet<Address>,
}

impl<'a> Player<'a> {
    pub fn new(inner: &'a PackInner, header_slot: Position, start: Position) -> Self {
        Player {
            inner,
            header_slot,
            start,
            dirty: Vec::new(),
            created: Vec::new(),
            latched: AHashSet::new(),
        }
    }

    /// Replay the journal and release the header slot.
    pub fn commit(mut self) -> Result<()> {
        let result = self.run();
        self.inner.locker.unlatch_all(&mut self.latched);
        result
    }

    fn run(&mut self) -> Result<()> {
        let records = read_records(&self.inner.sheaf, &self.inner.boundary, self.start)?;
        debug!(
            "playing journal at {} with {} records",
            self.start,
            records.len()
        );
        for record in &records {
            match *record {
                JournalRecord::MovePage { from, to } => self.move_page(from, to)?,
                JournalRecord::CreateAddressPage { position, mirror } => {
                    self.create_address_page(position, mirror)?
                }
                JournalRecord::Truncate { page, last_address } => {
                    self.truncate(page, last_address)?
                }
                JournalRecord::Move { address, from, to } => self.move_block(address, from, to)?,
                JournalRecord::Checkpoint { position } => self.checkpoint(position)?,
                _ => {}
            }
        }
        for record in &records {
            if let JournalRecord::Write { address, source } = *record {
                self.write(address, source)?;
            }
        }
        for record in &records {
            if let JournalRecord::Free { address } = *record {
                self.free(address)?;
            }
        }
        for record in &records {
            if let JournalRecord::Temporary { address, slot } = *record {
                self.temporary(address, slot)?;
            }
        }
        self.finish()
    }

    fn slots_for(&self, address: Address) -> Result<AddressPage> {
        let page_position = align_down(address, self.inner.sheaf.page_size());
        Ok(AddressPage::new(
            self.inner.sheaf.get(page_position, PageKind::Address)?,
        ))
    }

    /// True when the destination already holds the moved page with its
    /// blocks' slots retargeted: the signature of a completed move being
    /// replayed after a crash.
    fn move_completed(&self, to: Position) -> bool {
        let Ok(raw) = self.inner.sheaf.get(to, PageKind::Block) else {
            return false;
        };
        let page = BlockPage::new(raw);
        let Ok(entries) = page.entries() else {
            return false;
        };
        let live: Vec<_> = entries.into_iter().filter(|e| !e.freed).collect();
        if live.is_empty() {
            return false;
        }
        live.iter().all(|e| {
            self.slots_for(e.back)
                .map(|slots| slots.get(e.back) == to)
                .unwrap_or(false)
        })
    }

    fn move_page(&mut self, from: Position, to: Position) -> Result<()> {
        let inner = self.inner;
        debug!("move page {from} -> {to}");
        if inner.temporaries.contains_page(from) {
            let page = inner.sheaf.relocate(from, to, PageKind::Address)?;
            inner.sheaf.flush([&page])?;
            inner.sheaf.force()?;
            if let Some(new_head) = inner.temporaries.note_move(&inner.sheaf, from, to)? {
                inner.set_first_temporary(new_head)?;
            }
        } else if inner.interim.is_scratch(from) {
            let page = inner.sheaf.relocate(from, to, PageKind::Blank)?;
            inner.interim.note_moved_scratch(from, to);
            inner.sheaf.flush([&page])?;
            inner.sheaf.force()?;
        } else {
            // User block page. Skip the copy when a prior replay already
            // carried it over; the source may have been zeroed since.
            if !self.move_completed(to) {
                let page = inner.sheaf.relocate(from, to, PageKind::Block)?;
                inner.sheaf.flush([&page])?;
                inner.sheaf.force()?;
            }
            let page = BlockPage::new(inner.sheaf.get(to, PageKind::Block)?);
            for entry in page.entries()? {
                if entry.freed {
                    continue;
                }
                let slots = self.slots_for(entry.back)?;
                if slots.set_if(entry.back, from, to) {
                    self.dirty.push(Arc::clone(slots.raw()));
                }
            }
        }
        inner.boundary.record_move(from, to);
        Ok(())
    }

    fn create_address_page(&mut self, position: Position, mirror: Position) -> Result<()> {
        let inner = self.inner;
        debug!("create address page at {position} (mirror {mirror})");
        // The previous occupant, if any, was carried away by the MovePage
        // played before this record; the position may still sit in the
        // interim free list during recovery.
        inner.interim.remove(position);
        let page = inner.sheaf.create(position, PageKind::Address);
        self.created.push(page);
        inner.boundary.advance_past(position);
        let slots = (inner.sheaf.page_size() / 8) as u32;
        inner.address_pool.insert(position, slots);
        Ok(())
    }

    fn truncate(&mut self, page: Position, last_address: Address) -> Result<()> {
        let position = self.inner.boundary.adjust(page);
        let block_page = BlockPage::new(self.inner.sheaf.get(position, PageKind::Block)?);
        block_page.truncate_to(last_address)?;
        self.dirty.push(Arc::clone(block_page.raw()));
        Ok(())
    }

    fn move_block(&mut self, address: Address, from: Position, to: Position) -> Result<()> {
        let inner = self.inner;
        let source = BlockPage::new(inner.boundary.load(from, PageKind::Block)?);
        let entry = source.find(address)?.ok_or(PackError::Corrupt {
            detail: format!("compaction source page {from} lost block {address}"),
        })?;
        let payload = source
            .read_payload(address)?
            .ok_or(PackError::Corrupt {
                detail: format!("compaction source block {address} is not live"),
            })?;
        let destination_position = inner.boundary.adjust(to);
        let destination =
            BlockPage::new(inner.sheaf.get(destination_position, PageKind::Block)?);
        if destination
            .append(address, entry.stride, &payload, true)?
            .is_none()
        {
            return Err(PackError::BlockPageCorrupt {
                position: destination_position,
                detail: "compacted block no longer fits its own page".to_string(),
            });
        }
        let slots = self.slots_for(address)?;
        slots.set(address, destination_position);
        self.dirty.push(Arc::clone(destination.raw()));
        self.dirty.push(Arc::clone(slots.raw()));
        Ok(())
    }

    fn checkpoint(&mut self, position: Position) -> Result<()> {
        let inner = self.inner;
        inner.sheaf.flush(self.dirty.iter())?;
        inner.sheaf.force()?;
        inner
            .sheaf
            .write_raw(self.header_slot, &position.to_le_bytes())?;
        inner.sheaf.force()?;
        Ok(())
    }

    fn write(&mut self, address: Address, source: Position) -> Result<()> {
        let inner = self.inner;
        inner.locker.latch_once(address, &mut self.latched);
        let staged = BlockPage::new(inner.boundary.load(source, PageKind::Block)?);
        let entry = staged.find(address)?.ok_or(PackError::Corrupt {
            detail: format!("interim page {source} lost staged block {address}"),
        })?;
        let payload = staged.read_payload(address)?.ok_or(PackError::Corrupt {
            detail: format!("staged block {address} is not live"),
        })?;
        let slots = self.slots_for(address)?;
        // A rewrite replaces the committed copy: free it first.
        let old = slots.get(address);
        if old != 0 && old != RESERVED_SLOT {
            let old_position = inner.boundary.adjust(old);
            let old_page = BlockPage::new(inner.sheaf.get(old_position, PageKind::Block)?);
            if old_page.free_block(address)? {
                self.dirty.push(Arc::clone(old_page.raw()));
                inner.vacuum_sets.lock().freed.insert(old_position);
            }
        }
        // Best-fit a destination among committed user pages, falling back
        // to a fresh durable page; a candidate that filled up in the
        // meantime sends us back to the table.
        loop {
            let candidate = {
                let table = inner.table.lock();
                table.best_fit(
                    &inner.interim,
                    (entry.stride - crate::common::BLOCK_HEADER_SIZE) as u64,
                )?
            };
            let raw = if candidate == 0 {
                inner
                    .interim
                    .new_blank(&inner.sheaf, true, PageKind::Block)?
            } else {
                inner.sheaf.get(candidate, PageKind::Block)?
            };
            let destination = BlockPage::new(Arc::clone(&raw));
            let Some(remaining) = destination.append(address, entry.stride, &payload, true)? else {
                continue;
            };
            let position = raw.position();
            {
                let table = inner.table.lock();
                table.add(&inner.interim, position, remaining)?;
            }
            slots.set(address, position);
            self.dirty.push(raw);
            self.dirty.push(Arc::clone(slots.raw()));
            inner.vacuum_sets.lock().allocated.insert(position);
            return Ok(());
        }
    }

    fn free(&mut self, address: Address) -> Result<()> {
        let inner = self.inner;
        inner.locker.latch_once(address, &mut self.latched);
        let slots = self.slots_for(address)?;
        let value = slots.get(address);
        if value == 0 {
            // Already applied by an earlier replay of this journal.
            return Ok(());
        }
        if value != RESERVED_SLOT {
            let position = inner.boundary.adjust(value);
            let page = BlockPage::new(inner.sheaf.get(position, PageKind::Block)?);
            if page.free_block(address)? {
                self.dirty.push(Arc::clone(page.raw()));
                inner.vacuum_sets.lock().freed.insert(position);
            }
        }
        slots.set(address, 0);
        self.dirty.push(Arc::clone(slots.raw()));
        inner
            .address_pool
            .note_freed_slot(align_down(address, inner.sheaf.page_size()));
        if let Some(page) = inner.temporaries.clear_address(&inner.sheaf, address)? {
            self.dirty.push(page);
        }
        Ok(())
    }

    fn temporary(&mut self, address: Address, slot: Position) -> Result<()> {
        let adjusted = self.inner.boundary.adjust(slot);
        let page = self
            .inner
            .temporaries
            .set(&self.inner.sheaf, adjusted, address)?;
        self.dirty.push(page);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let inner = self.inner;
        inner.sheaf.flush(self.dirty.iter())?;
        inner.sheaf.force()?;
        if !self.created.is_empty() {
            inner.sheaf.flush(self.created.iter())?;
            inner.sheaf.force()?;
        }
        inner.sheaf.write_raw(self.header_slot, &0u64.to_le_bytes())?;
        inner.sheaf.force()?;
        inner.header_pool.free(self.header_slot);
        debug!("journal at {} fully played", self.start);
        Ok(())
    }
}
