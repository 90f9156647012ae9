//! Address-page pool
//!
//! Tracks address pages with free slots. A mutator checks a page out to
//! reserve exactly one slot; pages with further free slots sit in the
//! `returning` set until checked back in. When the combined population
//! falls below the configured minimum the caller must synthesize new
//! address pages through address-region expansion and retry.

use std::collections::BTreeMap;

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};

use crate::common::Position;

/// Outcome of a pool take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Take {
    /// The pool is below its minimum: expand the address region and retry.
    Expand,
    /// An address page with at least one free slot, checked out to the
    /// caller for a single reservation.
    Page(Position),
}

struct PoolState {
    /// Pages available for checkout, with their free-slot counts.
    free: BTreeMap<Position, u32>,
    /// Pages checked out with further free slots remaining.
    returning: AHashMap<Position, u32>,
    last_used: Option<Position>,
}

pub struct AddressPagePool {
    state: Mutex<PoolState>,
    cond: Condvar,
    minimum: usize,
}

impl AddressPagePool {
    pub fn new(minimum: usize) -> Self {
        debug_assert!(minimum >= 1);
        AddressPagePool {
            state: Mutex::new(PoolState {
                free: BTreeMap::new(),
                returning: AHashMap::new(),
                last_used: None,
            }),
            cond: Condvar::new(),
            minimum,
        }
    }

    pub fn minimum(&self) -> usize {
        self.minimum
    }

    /// Register an address page (creation, open, or expansion playback).
    pub fn insert(&self, position: Position, free_slots: u32) {
        if free_slots == 0 {
            return;
        }
        let mut state = self.state.lock();
        if !state.returning.contains_key(&position) {
            state.free.insert(position, free_slots);
        }
        drop(state);
        self.cond.notify_all();
    }

    /// True when the pool population is below the expansion threshold.
    pub fn needs_expansion(&self) -> bool {
        let state = self.state.lock();
        state.free.len() + state.returning.len() < self.minimum
    }

    /// Check a page out, preferring the page used last. Blocks while the
    /// pool is populated enough but every page is checked out; reports
    /// `Expand` when the population is below the minimum.
    pub fn take(&self) -> Take {
        let mut state = self.state.lock();
        loop {
            if state.free.len() + state.returning.len() < self.minimum {
                return Take::Expand;
            }
            let position = match state.last_used.filter(|p| state.free.contains_key(p)) {
                Some(position) => Some(position),
                None => state.free.keys().next_back().copied(),
            };
            if let Some(position) = position {
                let free_slots = state.free.remove(&position).unwrap();
                if free_slots >= 2 {
                    state.returning.insert(position, free_slots);
                }
                state.last_used = Some(position);
                return Take::Page(position);
            }
            self.cond.wait(&mut state);
        }
    }

    /// Check a page back in after reserving one slot. The page re-enters
    /// the free set only if it was in the returning set.
    pub fn checkin(&self, position: Position, free_slots: u32) {
        let mut state = self.state.lock();
        if state.returning.remove(&position).is_some() && free_slots > 0 {
            state.free.insert(position, free_slots);
        }
        drop(state);
        self.cond.notify_all();
    }

    /// A slot on `position` was returned to the free state (journal free
    /// playback or reservation rollback).
    pub fn note_freed_slot(&self, position: Position) {
        let mut state = self.state.lock();
        if let Some(count) = state.returning.get_mut(&position) {
            *count += 1;
        } else {
            *state.free.entry(position).or_insert(0) += 1;
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Every pooled page with its free-slot count (reopen region).
    pub fn snapshot(&self) -> Vec<(Position, u32)> {
        let state = self.state.lock();
        let mut all: Vec<(Position, u32)> = state
            .free
            .iter()
            .map(|(&p, &n)| (p, n))
            .chain(state.returning.iter().map(|(&p, &n)| (p, n)))
            .collect();
        all.sort_unstable();
        all
    }
}
