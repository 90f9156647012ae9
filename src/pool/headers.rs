//! Journal-header slot pool
//!
//! Counting pool over the fixed set of journal-header positions in the file
//! header. A committing mutator blocks here while every slot is claimed by
//! an in-flight commit; persisting a claimed slot is the linearization
//! point that makes a commit durable.

use parking_lot::{Condvar, Mutex};

use crate::common::Position;

pub struct HeaderPool {
    slots: Mutex<Vec<Position>>,
    cond: Condvar,
}

impl HeaderPool {
    /// Build the pool over `count` 8-byte slots starting at `first`.
    pub fn new(first: Position, count: u32) -> Self {
        let slots = (0..count as u64).map(|i| first + i * 8).collect();
        HeaderPool {
            slots: Mutex::new(slots),
            cond: Condvar::new(),
        }
    }

    /// Claim a header slot, blocking while all are in flight.
    pub fn allocate(&self) -> Position {
        let mut slots = self.slots.lock();
        loop {
            if let Some(slot) = slots.pop() {
                return slot;
            }
            self.cond.wait(&mut slots);
        }
    }

    /// Return a slot after its journal has been fully played.
    pub fn free(&self, slot: Position) {
        let mut slots = self.slots.lock();
        debug_assert!(!slots.contains(&slot));
        slots.push(slot);
        drop(slots);
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_slots_cover_header_positions() {
        let pool = HeaderPool::new(76, 4);
        let mut got = vec![
            pool.allocate(),
            pool.allocate(),
            pool.allocate(),
            pool.allocate(),
        ];
        got.sort_unstable();
        assert_eq!(got, vec![76, 84, 92, 100]);
    }

    #[test]
    fn test_allocate_blocks_when_exhausted() {
        let pool = Arc::new(HeaderPool::new(76, 1));
        let slot = pool.allocate();
        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.allocate())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());
        pool.free(slot);
        assert_eq!(waiter.join().unwrap(), slot);
    }
}
