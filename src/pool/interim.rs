//! Interim-page pool
//!
//! Free list of pages behind the movable user/interim watermark. Durable
//! requests (pages destined to become user or address pages) take the
//! lowest free position and push the watermark past it; scratch requests
//! (journal pages, isolation buffers, by-remaining pages) take the highest
//! free position at or above the watermark. The file is extended when the
//! pool cannot satisfy a request.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::Mutex;

use crate::common::{Position, Result};
use crate::sheaf::{PageKind, RawPage, Sheaf};

struct InterimState {
    free: BTreeSet<Position>,
    /// Scratch pages currently handed out; consulted by address-region
    /// expansion to classify the page at the boundary.
    scratch: AHashSet<Position>,
    watermark: Position,
}

pub struct InterimPool {
    state: Mutex<InterimState>,
}

impl InterimPool {
    pub fn new(watermark: Position) -> Self {
        InterimPool {
            state: Mutex::new(InterimState {
                free: BTreeSet::new(),
                scratch: AHashSet::new(),
                watermark,
            }),
        }
    }

    /// Seed the free list (open/recovery path).
    pub fn seed(&self, positions: impl IntoIterator<Item = Position>) {
        let mut state = self.state.lock();
        state.free.extend(positions);
    }

    pub fn watermark(&self) -> Position {
        self.state.lock().watermark
    }

    /// Allocate a blank page. Durable pages take the lowest free position,
    /// scratch pages the highest free position past the watermark; both
    /// extend the file when the pool comes up empty.
    pub fn new_blank(&self, sheaf: &Sheaf, durable: bool, kind: PageKind) -> Result<Arc<RawPage>> {
        let mut state = self.state.lock();
        let position = if durable {
            state.free.iter().next().copied()
        } else {
            let watermark = state.watermark;
            state.free.iter().rev().find(|&&p| p >= watermark).copied()
        };
        let page = match position {
            Some(position) => {
                state.free.remove(&position);
                sheaf.create(position, kind)
            }
            None => sheaf.extend(kind),
        };
        if durable {
            state.watermark = state.watermark.max(page.position() + sheaf.page_size());
        } else {
            state.scratch.insert(page.position());
        }
        Ok(page)
    }

    /// Return a page to the pool and drop it from the sheaf cache.
    pub fn free(&self, sheaf: &Sheaf, position: Position) {
        let mut state = self.state.lock();
        state.scratch.remove(&position);
        state.free.insert(position);
        sheaf.free(position);
    }

    /// Steal a specific free page (address-region expansion through it).
    pub fn remove(&self, position: Position) -> bool {
        self.state.lock().free.remove(&position)
    }

    /// True when `position` is a scratch page currently in use.
    pub fn is_scratch(&self, position: Position) -> bool {
        self.state.lock().scratch.contains(&position)
    }

    /// Rekey a scratch page relocated by address-region expansion.
    pub fn note_moved_scratch(&self, from: Position, to: Position) {
        let mut state = self.state.lock();
        if state.scratch.remove(&from) {
            state.scratch.insert(to);
        }
    }

    /// Split the free list at the trailing run: returns the truncation
    /// point (every page at or past it is free) and the free holes below
    /// it, consuming the trailing run from the pool.
    pub fn drain_for_close(&self, sheaf: &Sheaf) -> (Position, Vec<Position>) {
        let mut state = self.state.lock();
        let page_size = sheaf.page_size();
        let mut cut = sheaf.size();
        while cut > sheaf.first_page() && state.free.contains(&(cut - page_size)) {
            cut -= page_size;
            state.free.remove(&cut);
        }
        let holes: Vec<Position> = state.free.iter().copied().collect();
        (cut, holes)
    }
}
