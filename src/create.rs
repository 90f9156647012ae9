//! Pack creation
//!
//! `Creator` validates the file geometry, writes the header regions and the
//! first address page, and binds the static blocks through an ordinary
//! mutator commit so that even bootstrap allocations flow through the
//! journal.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use ahash::AHashSet;
use log::info;
use parking_lot::{Mutex, RwLock};

use crate::boundary::Boundary;
use crate::by_remaining::{ByRemainingTable, PageSort};
use crate::common::{HARD_SHUTDOWN, PackError, Result};
use crate::header::{
    FIXED_HEADER_LEN, FileHeader, JOURNAL_SLOTS_OFFSET, encode_static_blocks,
};
use crate::locker::AddressLocker;
use crate::pack::{Pack, PackInner, VacuumSets};
use crate::pool::{AddressPagePool, HeaderPool, InterimPool, TemporaryPool};
use crate::sheaf::{PageKind, Sheaf};

/// Builds a new pack file.
#[derive(Debug, Clone)]
pub struct Creator {
    pub page_size: u32,
    pub alignment: u32,
    /// Number of journal-header slots: the commit concurrency ceiling.
    pub journal_headers: u32,
    /// Address-page pool size below which the address region expands.
    pub address_pool_minimum: u32,
    /// Named blocks bound at creation: URI to block size.
    pub static_blocks: BTreeMap<String, u64>,
}

impl Default for Creator {
    fn default() -> Self {
        Creator {
            page_size: 4096,
            alignment: 64,
            journal_headers: 8,
            address_pool_minimum: 1,
            static_blocks: BTreeMap::new(),
        }
    }
}

impl Creator {
    pub fn new() -> Self {
        Creator::default()
    }

    fn validate(&self) -> Result<()> {
        let bad = |detail: String| PackError::HeaderCorrupt { detail };
        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            return Err(bad(format!("page size {} invalid", self.page_size)));
        }
        if !self.alignment.is_power_of_two()
            || self.alignment < 8
            || self.alignment >= self.page_size
        {
            return Err(bad(format!("alignment {} invalid", self.alignment)));
        }
        if self.journal_headers == 0 || self.journal_headers > 1024 {
            return Err(bad(format!(
                "journal header count {} invalid",
                self.journal_headers
            )));
        }
        if self.address_pool_minimum == 0 {
            return Err(bad("address pool minimum of zero".to_string()));
        }
        let maximum = self.page_size as u64 - 20;
        for (uri, &size) in &self.static_blocks {
            if size > maximum {
                return Err(PackError::Overflow {
                    size,
                    capacity: maximum,
                });
            }
            if uri.is_empty() {
                return Err(bad("empty static block URI".to_string()));
            }
        }
        Ok(())
    }

    /// Create the file at `path`, truncating anything already there.
    pub fn create(&self, path: impl AsRef<Path>) -> Result<Pack> {
        self.validate()?;
        // Placeholder region with null addresses fixes the region length.
        let placeholders: BTreeMap<String, u64> =
            self.static_blocks.keys().map(|k| (k.clone(), 0)).collect();
        let static_bytes = encode_static_blocks(&placeholders);
        let header_size =
            FIXED_HEADER_LEN as u32 + self.journal_headers * 8 + static_bytes.len() as u32;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .map_err(|e| PackError::IoWrite {
                position: 0,
                source: e,
            })?;
        let page_size = self.page_size as u64;
        let mut header = FileHeader {
            shutdown: HARD_SHUTDOWN,
            page_size: self.page_size,
            alignment: self.alignment,
            journal_count: self.journal_headers,
            static_region: static_bytes.len() as u32,
            header_size,
            pool_minimum: self.address_pool_minimum,
            user_boundary: 0,
            end_of_sheaf: 0,
            first_temporary: 0,
            by_remaining_root: 0,
            reserved: 0,
        };
        let first_page = header.first_page();
        let boundary_position = first_page + page_size;
        header.user_boundary = boundary_position;
        header.end_of_sheaf = boundary_position;
        let sheaf = Arc::new(Sheaf::new(file, page_size, first_page, boundary_position));
        sheaf.write_raw(0, &header.encode())?;
        sheaf.write_raw(
            JOURNAL_SLOTS_OFFSET,
            &vec![0u8; self.journal_headers as usize * 8],
        )?;
        sheaf.write_raw(header.static_region_offset(), &static_bytes)?;
        let first_address_page = sheaf.create(first_page, PageKind::Address);
        sheaf.flush([&first_address_page])?;
        drop(first_address_page);
        let boundary = Arc::new(Boundary::new(Arc::clone(&sheaf), boundary_position));
        let interim = InterimPool::new(boundary_position);
        let table = ByRemainingTable::create(
            Arc::clone(&sheaf),
            Arc::clone(&boundary),
            &interim,
            PageSort::User,
            self.alignment as u64,
        )?;
        let address_pool = AddressPagePool::new(self.address_pool_minimum as usize);
        address_pool.insert(first_page, (page_size / 8) as u32);
        let inner = Arc::new(PackInner {
            boundary,
            interim,
            address_pool,
            header_pool: HeaderPool::new(JOURNAL_SLOTS_OFFSET, self.journal_headers),
            temporaries: TemporaryPool::new(),
            table: Mutex::new(table),
            locker: AddressLocker::new(),
            page_move: RwLock::new(()),
            vacuum_mutex: Mutex::new(()),
            vacuum_sets: Mutex::new(VacuumSets::default()),
            statics: Mutex::new(BTreeMap::new()),
            static_addresses: Mutex::new(AHashSet::new()),
            closed: AtomicBool::new(false),
            header: Mutex::new(header),
            sheaf,
        });
        inner.sheaf.force()?;
        let pack = Pack {
            inner: Arc::clone(&inner),
        };
        if !self.static_blocks.is_empty() {
            let mut bound = BTreeMap::new();
            let mut mutator = pack.mutate()?;
            for (uri, &size) in &self.static_blocks {
                let address = mutator.allocate(size)?;
                bound.insert(uri.clone(), address);
            }
            mutator.commit()?;
            let region_offset = inner.header.lock().static_region_offset();
            inner
                .sheaf
                .write_raw(region_offset, &encode_static_blocks(&bound))?;
            inner.sheaf.force()?;
            *inner.static_addresses.lock() = bound.values().copied().collect();
            *inner.statics.lock() = bound;
        }
        info!(
            "created pack: page size {}, alignment {}, {} static blocks",
            self.page_size,
            self.alignment,
            self.static_blocks.len()
        );
        Ok(pack)
    }
}
