//! Paged-I/O substrate
//!
//! The sheaf maps file positions to cached page buffers. It owns the file
//! handle, the page-granular read/write/flush/force/truncate primitives, and
//! a weak-reference cache guaranteeing that at most one page object exists
//! per position at any time. Every page carries its own monitor (mutex plus
//! condition variable) protecting its bytes, decoded kind, dirty state, and
//! the `mirrored` flag used by vacuum.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::common::{PackError, Position, Result};

/// Decoded role of a cached page. The on-disk bytes do not self-identify;
/// the kind is established by the caller that first loads or creates the
/// page and travels with the cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Loaded but not yet interpreted.
    Blank,
    /// Array of 8-byte address slots (also temporary reference pages).
    Address,
    /// Packed blocks behind a signed-count header (user or interim).
    Block,
    /// Journal operation records.
    Journal,
    /// By-remaining bucket heads.
    ByRemaining,
    /// By-remaining slot-page list node.
    Slot,
}

/// Byte content and state of one page, guarded by the page monitor.
pub struct PageCore {
    buf: Box<[u8]>,
    pub kind: PageKind,
    pub dirty: bool,
    pub mirrored: bool,
}

impl PageCore {
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.buf
    }

    #[inline]
    pub fn get_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.buf[offset..offset + 2].try_into().unwrap())
    }

    #[inline]
    pub fn get_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.buf[offset..offset + 4].try_into().unwrap())
    }

    #[inline]
    pub fn get_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.buf[offset..offset + 4].try_into().unwrap())
    }

    #[inline]
    pub fn get_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.buf[offset..offset + 8].try_into().unwrap())
    }

    #[inline]
    pub fn get_i64(&self, offset: usize) -> i64 {
        i64::from_le_bytes(self.buf[offset..offset + 8].try_into().unwrap())
    }

    #[inline]
    pub fn put_u16(&mut self, offset: usize, value: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
    }

    #[inline]
    pub fn put_i32(&mut self, offset: usize, value: i32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
    }

    #[inline]
    pub fn put_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
    }

    #[inline]
    pub fn put_u64(&mut self, offset: usize, value: u64) {
        self.buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
    }

    #[inline]
    pub fn put_i64(&mut self, offset: usize, value: i64) {
        self.buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
    }

    /// Copy `src` into the page at `offset`.
    pub fn put_bytes(&mut self, offset: usize, src: &[u8]) {
        self.buf[offset..offset + src.len()].copy_from_slice(src);
        self.dirty = true;
    }

    /// Zero `len` bytes at `offset`.
    pub fn zero(&mut self, offset: usize, len: usize) {
        self.buf[offset..offset + len].fill(0);
        self.dirty = true;
    }
}

/// A cached page. The position is atomic because address-region expansion
/// relocates pages in place: the page object survives with a new position
/// so that outstanding references keep writing to the right place.
pub struct RawPage {
    position: AtomicU64,
    core: Mutex<PageCore>,
    cond: Condvar,
}

impl RawPage {
    fn new(position: Position, buf: Box<[u8]>, kind: PageKind, dirty: bool) -> Arc<Self> {
        Arc::new(RawPage {
            position: AtomicU64::new(position),
            core: Mutex::new(PageCore {
                buf,
                kind,
                dirty,
                mirrored: false,
            }),
            cond: Condvar::new(),
        })
    }

    #[inline]
    pub fn position(&self) -> Position {
        self.position.load(Ordering::Acquire)
    }

    /// Acquire the page monitor.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, PageCore> {
        self.core.lock()
    }

    /// Acquire the page monitor, waiting out an in-flight vacuum mirror.
    pub fn lock_unmirrored(&self) -> MutexGuard<'_, PageCore> {
        let mut core = self.core.lock();
        while core.mirrored {
            self.cond.wait(&mut core);
        }
        core
    }

    /// Block until the page is no longer mirrored.
    pub fn wait_until_unmirrored(&self) {
        let mut core = self.core.lock();
        while core.mirrored {
            self.cond.wait(&mut core);
        }
    }

    #[inline]
    pub fn is_mirrored(&self) -> bool {
        self.core.lock().mirrored
    }

    /// Set or clear the mirrored flag, waking waiters on clear.
    pub fn set_mirrored(&self, mirrored: bool) {
        let mut core = self.core.lock();
        core.mirrored = mirrored;
        if !mirrored {
            self.cond.notify_all();
        }
    }
}

/// The paged-I/O substrate: file handle, page cache, frontier bookkeeping.
pub struct Sheaf {
    file: File,
    page_size: u64,
    first_page: Position,
    cache: DashMap<Position, Weak<RawPage>>,
    frontier: Mutex<Position>,
}

impl Sheaf {
    /// Wrap an open file. `end` is the position one past the last page
    /// currently belonging to the page region.
    pub fn new(file: File, page_size: u64, first_page: Position, end: Position) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert_eq!(first_page % page_size, 0);
        debug_assert_eq!(end % page_size, 0);
        Sheaf {
            file,
            page_size,
            first_page,
            cache: DashMap::new(),
            frontier: Mutex::new(end.max(first_page)),
        }
    }

    #[inline]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    #[inline]
    pub fn first_page(&self) -> Position {
        self.first_page
    }

    /// One past the last page: where `extend` will place the next page.
    pub fn size(&self) -> Position {
        *self.frontier.lock()
    }

    fn read_page(&self, position: Position) -> Result<Box<[u8]>> {
        let mut buf = vec![0u8; self.page_size as usize].into_boxed_slice();
        let mut done = 0usize;
        // A page past the physical end of file reads as zeros.
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], position + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(PackError::IoRead {
                        position,
                        source: e,
                    });
                }
            }
        }
        Ok(buf)
    }

    /// Fetch the page at `position`, loading it from disk on a cache miss.
    /// `kind` is the caller's prototype: it is recorded on first load and
    /// left untouched when the page is already cached.
    pub fn get(&self, position: Position, kind: PageKind) -> Result<Arc<RawPage>> {
        debug_assert_eq!(position % self.page_size, 0);
        debug_assert!(position >= self.first_page);
        match self.cache.entry(position) {
            Entry::Occupied(mut occupied) => {
                if let Some(page) = occupied.get().upgrade() {
                    return Ok(page);
                }
                let page = RawPage::new(position, self.read_page(position)?, kind, false);
                occupied.insert(Arc::downgrade(&page));
                Ok(page)
            }
            Entry::Vacant(vacant) => {
                let page = RawPage::new(position, self.read_page(position)?, kind, false);
                vacant.insert(Arc::downgrade(&page));
                Ok(page)
            }
        }
    }

    /// Install a zeroed page at `position` without reading the disk. If a
    /// page object already exists there it is re-armed in place so that the
    /// one-object-per-position invariant holds.
    pub fn create(&self, position: Position, kind: PageKind) -> Arc<RawPage> {
        debug_assert_eq!(position % self.page_size, 0);
        match self.cache.entry(position) {
            Entry::Occupied(mut occupied) => {
                if let Some(page) = occupied.get().upgrade() {
                    let mut core = page.lock();
                    core.buf.fill(0);
                    core.kind = kind;
                    core.dirty = true;
                    core.mirrored = false;
                    drop(core);
                    return page;
                }
                let buf = vec![0u8; self.page_size as usize].into_boxed_slice();
                let page = RawPage::new(position, buf, kind, true);
                occupied.insert(Arc::downgrade(&page));
                page
            }
            Entry::Vacant(vacant) => {
                let buf = vec![0u8; self.page_size as usize].into_boxed_slice();
                let page = RawPage::new(position, buf, kind, true);
                vacant.insert(Arc::downgrade(&page));
                page
            }
        }
    }

    /// Append a fresh zeroed page at the frontier.
    pub fn extend(&self, kind: PageKind) -> Arc<RawPage> {
        let mut frontier = self.frontier.lock();
        let position = *frontier;
        *frontier += self.page_size;
        drop(frontier);
        self.create(position, kind)
    }

    /// Rebind the page at `from` to `to`. The surviving page object keeps
    /// its identity, so outstanding references follow the move; the content
    /// is marked dirty and must be flushed by the caller before anything
    /// overwrites `from` on disk. Any stale object at `to` is discarded.
    pub fn relocate(&self, from: Position, to: Position, kind: PageKind) -> Result<Arc<RawPage>> {
        debug_assert_ne!(from, to);
        let page = self.get(from, kind)?;
        self.cache.remove(&to);
        self.cache.remove(&from);
        page.position.store(to, Ordering::Release);
        page.lock().dirty = true;
        self.cache.insert(to, Arc::downgrade(&page));
        Ok(page)
    }

    /// Drop the cache entry for a page returning to the free pool. The disk
    /// bytes are left behind as garbage.
    pub fn free(&self, position: Position) {
        self.cache.remove(&position);
    }

    /// Write every dirty page in `pages` back to the file.
    pub fn flush<'a, I>(&self, pages: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Arc<RawPage>>,
    {
        for page in pages {
            let mut core = page.lock();
            if !core.dirty {
                continue;
            }
            let position = page.position();
            self.file
                .write_all_at(&core.buf, position)
                .map_err(|e| PackError::IoWrite {
                    position,
                    source: e,
                })?;
            core.dirty = false;
        }
        Ok(())
    }

    /// Raw positional read outside the page region (header, static blocks,
    /// reopen region).
    pub fn read_raw(&self, position: Position, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, position)
            .map_err(|e| PackError::IoRead {
                position,
                source: e,
            })
    }

    /// Raw positional write outside the page region.
    pub fn write_raw(&self, position: Position, buf: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buf, position)
            .map_err(|e| PackError::IoWrite {
                position,
                source: e,
            })
    }

    /// Force all written data to the device.
    pub fn force(&self) -> Result<()> {
        self.file.sync_data().map_err(PackError::IoForce)
    }

    /// Current physical length of the file.
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata().map_err(PackError::IoSize)?.len())
    }

    /// Cut the file at `position` and pull the frontier back to the page
    /// boundary at or below it. Cached pages past the cut are dropped.
    pub fn truncate(&self, position: Position) -> Result<()> {
        let mut frontier = self.frontier.lock();
        self.file
            .set_len(position)
            .map_err(|e| PackError::IoTruncate {
                position,
                source: e,
            })?;
        let new_end = crate::common::align_down(position, self.page_size).max(self.first_page);
        *frontier = new_end;
        drop(frontier);
        self.cache.retain(|&pos, _| pos < new_end);
        Ok(())
    }
}
