//! Opening and recovery
//!
//! `Opener` accepts softly shut files: it consumes the reopen region to
//! rebuild the pools and the by-remaining table, truncates the region away,
//! and stamps the file HARD while in use. A hard-shut file is refused with
//! `PackError::Shutdown`; `Medic::recover` replays every persisted journal,
//! sweeps the address region back to consistency, and stamps the file SOFT
//! so that `Opener` will take it.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use ahash::{AHashMap, AHashSet};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::boundary::Boundary;
use crate::by_remaining::{ByRemainingTable, PageSort};
use crate::common::{
    Address, HARD_SHUTDOWN, PackError, Position, RESERVED_SLOT, Result, SOFT_SHUTDOWN,
    align_down,
};
use crate::header::{
    FIXED_HEADER_LEN, FileHeader, JOURNAL_SLOTS_OFFSET, ReopenRegion, decode_static_blocks,
};
use crate::locker::AddressLocker;
use crate::pack::{Pack, PackInner, VacuumSets};
use crate::page::{AddressPage, BlockPage};
use crate::player::Player;
use crate::pool::{AddressPagePool, HeaderPool, InterimPool, TemporaryPool};
use crate::sheaf::{PageKind, RawPage, Sheaf};

/// A successfully opened pack with the temporary addresses observed.
pub struct Opened {
    pub pack: Pack,
    pub temporaries: BTreeSet<Address>,
}

pub struct Opener;

impl Opener {
    /// Open a softly shut pack file.
    pub fn open(path: impl AsRef<Path>) -> Result<Opened> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| PackError::IoRead {
                position: 0,
                source: e,
            })?;
        let actual = file.metadata().map_err(PackError::IoSize)?.len();
        if actual < FIXED_HEADER_LEN as u64 {
            return Err(PackError::FileSize {
                expected: FIXED_HEADER_LEN as u64,
                actual,
            });
        }
        let mut fixed = [0u8; FIXED_HEADER_LEN];
        file.read_exact_at(&mut fixed, 0)
            .map_err(|e| PackError::IoRead {
                position: 0,
                source: e,
            })?;
        let mut header = FileHeader::decode(&fixed)?;
        match header.shutdown {
            SOFT_SHUTDOWN => {}
            HARD_SHUTDOWN => return Err(PackError::Shutdown),
            other => {
                return Err(PackError::HeaderCorrupt {
                    detail: format!("unknown shutdown stamp {other:#010x}"),
                });
            }
        }
        if actual < header.end_of_sheaf {
            return Err(PackError::FileSize {
                expected: header.end_of_sheaf,
                actual,
            });
        }
        let page_size = header.page_size as u64;
        let first_user = header.first_page() + page_size;
        if header.end_of_sheaf % page_size != 0
            || header.end_of_sheaf < first_user
            || header.user_boundary % page_size != 0
            || header.user_boundary < first_user
            || header.user_boundary > header.end_of_sheaf
        {
            return Err(PackError::HeaderCorrupt {
                detail: "page region geometry out of range".to_string(),
            });
        }
        let sheaf = Arc::new(Sheaf::new(
            file,
            page_size,
            header.first_page(),
            header.end_of_sheaf,
        ));
        let mut slots = vec![0u8; header.journal_count as usize * 8];
        sheaf.read_raw(JOURNAL_SLOTS_OFFSET, &mut slots)?;
        if slots.iter().any(|&b| b != 0) {
            return Err(PackError::Corrupt {
                detail: "softly shut file has a live journal-header slot".to_string(),
            });
        }
        let mut static_bytes = vec![0u8; header.static_region as usize];
        sheaf.read_raw(header.static_region_offset(), &mut static_bytes)?;
        let statics = decode_static_blocks(&static_bytes)?;
        let mut region_bytes = vec![0u8; (actual - header.end_of_sheaf) as usize];
        sheaf.read_raw(header.end_of_sheaf, &mut region_bytes)?;
        let region = ReopenRegion::decode(&region_bytes)?;
        // In use: a crash from here on demands recovery. Stamped before the
        // reopen region is truncated away, or a crash in between would
        // leave a SOFT file with no snapshot.
        header.shutdown = HARD_SHUTDOWN;
        sheaf.write_raw(0, &header.encode())?;
        sheaf.force()?;
        sheaf.truncate(header.end_of_sheaf)?;
        let temporaries = TemporaryPool::load(&sheaf, header.first_temporary)?;
        let boundary = Arc::new(Boundary::new(Arc::clone(&sheaf), header.user_boundary));
        let interim = InterimPool::new(header.end_of_sheaf);
        interim.seed(region.free_pages.iter().copied());
        let address_pool = AddressPagePool::new(header.pool_minimum as usize);
        for &position in &region.address_pages {
            let page = AddressPage::new(sheaf.get(position, PageKind::Address)?);
            address_pool.insert(position, page.free_slots(0));
        }
        let table = ByRemainingTable::create(
            Arc::clone(&sheaf),
            Arc::clone(&boundary),
            &interim,
            PageSort::User,
            header.alignment as u64,
        )?;
        for &position in &region.user_pages {
            let page = BlockPage::new(sheaf.get(position, PageKind::Block)?);
            if page.is_user() {
                let remaining = page.remaining()?;
                table.add(&interim, position, remaining)?;
            }
        }
        let observed = temporaries.enumerate();
        let inner = Arc::new(PackInner {
            boundary,
            interim,
            address_pool,
            header_pool: HeaderPool::new(JOURNAL_SLOTS_OFFSET, header.journal_count),
            temporaries,
            table: Mutex::new(table),
            locker: AddressLocker::new(),
            page_move: RwLock::new(()),
            vacuum_mutex: Mutex::new(()),
            vacuum_sets: Mutex::new(VacuumSets::default()),
            static_addresses: Mutex::new(statics.values().copied().collect()),
            statics: Mutex::new(statics),
            closed: AtomicBool::new(false),
            header: Mutex::new(header),
            sheaf,
        });
        info!(
            "opened pack: boundary {}, {} temporaries",
            inner.boundary.position(),
            observed.len()
        );
        Ok(Opened {
            pack: Pack { inner },
            temporaries: observed,
        })
    }
}

/// Recovery driver for hard-shut files.
pub struct Medic;

impl Medic {
    /// Replay every persisted journal, sweep the store back to a
    /// consistent quiescent state, and stamp the file SOFT.
    pub fn recover(path: impl AsRef<Path>) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| PackError::IoRead {
                position: 0,
                source: e,
            })?;
        let actual = file.metadata().map_err(PackError::IoSize)?.len();
        if actual < FIXED_HEADER_LEN as u64 {
            return Err(PackError::FileSize {
                expected: FIXED_HEADER_LEN as u64,
                actual,
            });
        }
        let mut fixed = [0u8; FIXED_HEADER_LEN];
        file.read_exact_at(&mut fixed, 0)
            .map_err(|e| PackError::IoRead {
                position: 0,
                source: e,
            })?;
        let header = FileHeader::decode(&fixed)?;
        match header.shutdown {
            SOFT_SHUTDOWN => {
                info!("recovery skipped: file is already softly shut");
                return Ok(());
            }
            HARD_SHUTDOWN => {}
            other => {
                return Err(PackError::HeaderCorrupt {
                    detail: format!("unknown shutdown stamp {other:#010x}"),
                });
            }
        }
        let page_size = header.page_size as u64;
        let first_page = header.first_page();
        let end = align_down(actual, page_size).max(first_page);
        let sheaf = Arc::new(Sheaf::new(file, page_size, first_page, end));
        let mut static_bytes = vec![0u8; header.static_region as usize];
        sheaf.read_raw(header.static_region_offset(), &mut static_bytes)?;
        let statics = decode_static_blocks(&static_bytes)?;
        let temporaries = TemporaryPool::load(&sheaf, header.first_temporary)?;
        let boundary = Arc::new(Boundary::new(Arc::clone(&sheaf), header.user_boundary));
        let interim = InterimPool::new(end);
        let table = ByRemainingTable::create(
            Arc::clone(&sheaf),
            Arc::clone(&boundary),
            &interim,
            PageSort::User,
            header.alignment as u64,
        )?;
        let journal_count = header.journal_count;
        let inner = PackInner {
            boundary,
            interim,
            address_pool: AddressPagePool::new(header.pool_minimum as usize),
            header_pool: HeaderPool::new(JOURNAL_SLOTS_OFFSET, journal_count),
            temporaries,
            table: Mutex::new(table),
            locker: AddressLocker::new(),
            page_move: RwLock::new(()),
            vacuum_mutex: Mutex::new(()),
            vacuum_sets: Mutex::new(VacuumSets::default()),
            static_addresses: Mutex::new(statics.values().copied().collect()),
            statics: Mutex::new(statics),
            closed: AtomicBool::new(false),
            header: Mutex::new(header),
            sheaf: Arc::clone(&sheaf),
        };
        // Replay every journal whose header slot survived, in slot order.
        let mut slots = vec![0u8; journal_count as usize * 8];
        sheaf.read_raw(JOURNAL_SLOTS_OFFSET, &mut slots)?;
        let mut replayed = 0usize;
        for index in 0..journal_count as usize {
            let slot = JOURNAL_SLOTS_OFFSET + index as u64 * 8;
            let start = u64::from_le_bytes(slots[index * 8..index * 8 + 8].try_into().unwrap());
            if start == 0 {
                continue;
            }
            debug!("recovering journal at {start} from slot {slot}");
            Player::new(&inner, slot, start).commit()?;
            replayed += 1;
        }
        Self::sweep(&inner)?;
        info!("recovered pack: {replayed} journals replayed");
        Ok(())
    }

    /// Walk the address region, scrub abandoned reservations, negate
    /// orphaned blocks, rebuild the reopen snapshot, and stamp SOFT.
    fn sweep(inner: &PackInner) -> Result<()> {
        let sheaf = &inner.sheaf;
        let page_size = sheaf.page_size();
        let first_page = sheaf.first_page();
        let boundary = inner.boundary.position();
        let mut dirty: Vec<Arc<RawPage>> = Vec::new();
        let mut live: AHashMap<Position, AHashSet<Address>> = AHashMap::new();
        let mut address_pages = Vec::new();
        let mut position = first_page;
        while position < boundary {
            let page = AddressPage::new(sheaf.get(position, PageKind::Address)?);
            let mut scrubbed = false;
            for (address, value) in page.live_slots(0) {
                if value == RESERVED_SLOT {
                    page.set(address, 0);
                    scrubbed = true;
                } else {
                    live.entry(inner.boundary.adjust(value))
                        .or_default()
                        .insert(address);
                }
            }
            if scrubbed {
                dirty.push(Arc::clone(page.raw()));
            }
            if page.free_slots(0) > 0 {
                address_pages.push(position);
            }
            position += page_size;
        }
        let mut user_pages = Vec::new();
        for (&page_position, addresses) in &live {
            let page = BlockPage::new(sheaf.get(page_position, PageKind::Block)?);
            let mut touched = false;
            for entry in page.entries()? {
                if !entry.freed && !addresses.contains(&entry.back) {
                    // Orphan of an interrupted replay: the slot moved on.
                    page.free_block(entry.back)?;
                    touched = true;
                }
            }
            if touched {
                dirty.push(Arc::clone(page.raw()));
            }
            if page.is_user() && page.remaining()? > 0 {
                user_pages.push(page_position);
            }
        }
        user_pages.sort_unstable();
        sheaf.flush(dirty.iter())?;
        sheaf.force()?;
        // Everything not referenced is a free page; truncate the trailing
        // run and remember the holes.
        let temp_pages: AHashSet<Position> = inner.temporaries.pages().into_iter().collect();
        let mut free: BTreeSet<Position> = BTreeSet::new();
        let mut position = boundary;
        while position < sheaf.size() {
            if !live.contains_key(&position) && !temp_pages.contains(&position) {
                free.insert(position);
            }
            position += page_size;
        }
        let mut cut = sheaf.size();
        while cut > first_page && free.remove(&(cut - page_size)) {
            cut -= page_size;
        }
        sheaf.truncate(cut)?;
        let region = ReopenRegion {
            address_pages,
            user_pages,
            free_pages: free.into_iter().collect(),
        };
        sheaf.write_raw(cut, &region.encode())?;
        {
            let mut header = inner.header.lock();
            header.user_boundary = boundary;
            header.end_of_sheaf = cut;
            header.first_temporary = inner.temporaries.head();
            header.shutdown = SOFT_SHUTDOWN;
        }
        inner.write_header()?;
        sheaf.force()?;
        Ok(())
    }
}
