//! Pack: the services arena and public surface
//!
//! A `Pack` owns every engine service (sheaf, boundary, pools, committed
//! by-remaining table, lockers) behind a single shared arena; mutators,
//! players, and the vacuum coordinator receive handles to it rather than
//! back-pointers to one another. The pack also drives address-region
//! expansion and the soft-shutdown protocol.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashSet;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::boundary::Boundary;
use crate::by_remaining::ByRemainingTable;
use crate::common::{
    Address, BLOCK_HEADER_SIZE, BLOCK_PAGE_HEADER_SIZE, PackError, Position, Result,
    SOFT_SHUTDOWN,
};
use crate::header::{FileHeader, ReopenRegion};
use crate::journal::Journal;
use crate::locker::AddressLocker;
use crate::mutator::Mutator;
use crate::page::{BlockPage, JournalRecord};
use crate::player::Player;
use crate::pool::{AddressPagePool, HeaderPool, InterimPool, TemporaryPool};
use crate::sheaf::{PageKind, Sheaf};
use crate::vacuum::{FragmentationStrategy, VacuumStrategy, vacuum};

/// Pages touched since the last vacuum cycle.
#[derive(Default)]
pub(crate) struct VacuumSets {
    pub allocated: AHashSet<Position>,
    pub freed: AHashSet<Position>,
}

pub(crate) struct PackInner {
    pub(crate) sheaf: Arc<Sheaf>,
    pub(crate) header: Mutex<FileHeader>,
    pub(crate) boundary: Arc<Boundary>,
    pub(crate) interim: InterimPool,
    pub(crate) address_pool: AddressPagePool,
    pub(crate) header_pool: HeaderPool,
    pub(crate) temporaries: TemporaryPool,
    pub(crate) table: Mutex<ByRemainingTable>,
    pub(crate) locker: AddressLocker,
    pub(crate) page_move: RwLock<()>,
    pub(crate) vacuum_mutex: Mutex<()>,
    pub(crate) vacuum_sets: Mutex<VacuumSets>,
    pub(crate) statics: Mutex<BTreeMap<String, Address>>,
    pub(crate) static_addresses: Mutex<AHashSet<Address>>,
    pub(crate) closed: AtomicBool,
}

impl PackInner {
    pub(crate) fn page_size(&self) -> u64 {
        self.sheaf.page_size()
    }

    pub(crate) fn alignment(&self) -> u64 {
        self.header.lock().alignment as u64
    }

    pub(crate) fn maximum_block_size(&self) -> u64 {
        self.page_size() - BLOCK_PAGE_HEADER_SIZE as u64 - BLOCK_HEADER_SIZE as u64
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Persist the in-memory header.
    pub(crate) fn write_header(&self) -> Result<()> {
        let encoded = self.header.lock().encode();
        self.sheaf.write_raw(0, &encoded)
    }

    pub(crate) fn set_first_temporary(&self, position: Position) -> Result<()> {
        self.header.lock().first_temporary = position;
        self.write_header()
    }

    /// Grow the address region until the address-page pool reaches its
    /// minimum. Runs under the page-move write lock: no reads, writes, or
    /// commits are in flight while pages move.
    pub(crate) fn expand_address_region(&self) -> Result<()> {
        let _write = self.page_move.write();
        if !self.address_pool.needs_expansion() {
            return Ok(());
        }
        let page_size = self.sheaf.page_size();
        let have = self.address_pool.snapshot().len();
        let wanted = self.address_pool.minimum() - have;
        let base = self.boundary.position();
        info!("expanding address region by {wanted} pages at {base}");
        let mut moves: Vec<(Position, Position)> = Vec::new();
        let mut creates: Vec<(Position, Position)> = Vec::new();
        for i in 0..wanted as u64 {
            let position = base + i * page_size;
            if position >= self.sheaf.size() {
                // Virgin territory: extend the file up to the page.
                while self.sheaf.size() <= position {
                    drop(self.sheaf.extend(PageKind::Blank));
                }
                creates.push((position, 0));
            } else if self.interim.remove(position) {
                // A free hole (or an emptied user page) is taken in place.
                creates.push((position, 0));
            } else {
                // An occupied page is carried to a fresh blank first.
                let durable = !self.interim.is_scratch(position);
                let target = self
                    .interim
                    .new_blank(&self.sheaf, durable, PageKind::Blank)?;
                moves.push((position, target.position()));
                creates.push((position, target.position()));
            }
        }
        let mut journal = Journal::new(Arc::clone(&self.sheaf), &self.interim)?;
        for &(from, to) in &moves {
            journal.append(&self.interim, &JournalRecord::MovePage { from, to })?;
        }
        for &(position, mirror) in &creates {
            journal.append(
                &self.interim,
                &JournalRecord::CreateAddressPage { position, mirror },
            )?;
        }
        journal.append(&self.interim, &JournalRecord::Commit)?;
        journal.append(&self.interim, &JournalRecord::Terminate)?;
        journal.refresh_links();
        self.sheaf.flush(journal.pages())?;
        self.sheaf.force()?;
        let slot = self.header_pool.allocate();
        let start = journal.start();
        self.sheaf.write_raw(slot, &start.to_le_bytes())?;
        self.sheaf.force()?;
        let result = Player::new(self, slot, start).commit();
        journal.dispose(&self.interim);
        result?;
        info!(
            "address region now ends at {}, {} page moves",
            self.boundary.position(),
            moves.len()
        );
        Ok(())
    }

    /// Soft shutdown: drain to a quiescent state, write the reopen region
    /// at the durable end, truncate, and stamp the file SOFT.
    pub(crate) fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _write = self.page_move.write();
        let user_entries = {
            let table = self.table.lock();
            let entries = table.entries()?;
            table.dispose(&self.interim)?;
            entries
        };
        let mut user_pages = Vec::new();
        for position in user_entries {
            let current = self.boundary.adjust(position);
            let Ok(raw) = self.sheaf.get(current, PageKind::Block) else {
                continue;
            };
            let page = BlockPage::new(raw);
            if page.is_user() && page.remaining().map(|r| r > 0).unwrap_or(false) {
                user_pages.push(current);
            }
        }
        user_pages.sort_unstable();
        user_pages.dedup();
        let address_pages: Vec<Position> = self
            .address_pool
            .snapshot()
            .into_iter()
            .map(|(position, _)| position)
            .collect();
        let (cut, free_pages) = self.interim.drain_for_close(&self.sheaf);
        let region = ReopenRegion {
            address_pages,
            user_pages,
            free_pages,
        };
        self.sheaf.truncate(cut)?;
        self.sheaf.write_raw(cut, &region.encode())?;
        {
            let mut header = self.header.lock();
            header.user_boundary = self.boundary.position();
            header.end_of_sheaf = cut;
            header.first_temporary = self.temporaries.head();
            header.shutdown = SOFT_SHUTDOWN;
        }
        self.write_header()?;
        self.sheaf.force()?;
        info!("pack closed softly at {cut}");
        Ok(())
    }
}

/// An open pack file: durable, concurrent block storage behind stable
/// addresses. Obtain one from `Creator::create` or `Opener::open`.
pub struct Pack {
    pub(crate) inner: Arc<PackInner>,
}

impl Pack {
    /// Begin a transaction. One mutator per thread.
    pub fn mutate(&self) -> Result<Mutator> {
        if self.inner.is_closed() {
            return Err(PackError::Corrupt {
                detail: "pack is closed".to_string(),
            });
        }
        Mutator::new(Arc::clone(&self.inner))
    }

    /// Run one vacuum cycle with the default strategy.
    pub fn vacuum(&self) -> Result<()> {
        vacuum(&self.inner, &FragmentationStrategy)
    }

    /// Run one vacuum cycle with a caller-provided strategy.
    pub fn vacuum_with(&self, strategy: &dyn VacuumStrategy) -> Result<()> {
        vacuum(&self.inner, strategy)
    }

    /// The named blocks bound at file creation.
    pub fn static_blocks(&self) -> BTreeMap<String, Address> {
        self.inner.statics.lock().clone()
    }

    /// Addresses currently flagged temporary.
    pub fn temporaries(&self) -> BTreeSet<Address> {
        self.inner.temporaries.enumerate()
    }

    pub fn page_size(&self) -> u64 {
        self.inner.page_size()
    }

    pub fn alignment(&self) -> u64 {
        self.inner.alignment()
    }

    /// Largest single block this pack can hold.
    pub fn maximum_block_size(&self) -> u64 {
        self.inner.maximum_block_size()
    }

    /// Soft shutdown. Outstanding mutators must have committed or rolled
    /// back; their reservations would otherwise leak into the file.
    pub fn close(self) -> Result<()> {
        self.inner.close()
    }
}

impl Drop for Pack {
    fn drop(&mut self) {
        if !self.inner.is_closed() {
            if let Err(e) = self.inner.close() {
                warn!("close on drop failed: {e}");
            }
        }
    }
}
