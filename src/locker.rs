//! Address locker
//!
//! A lazy per-address latch set serializing slot updates across concurrent
//! commits. A freeing commit enters the latch before applying its free; a
//! reallocating commit latches the same address and waits, so a journaled
//! free can never overwrite a later reallocation.

use ahash::AHashSet;
use parking_lot::{Condvar, Mutex};

use crate::common::Address;

#[derive(Default)]
pub struct AddressLocker {
    latched: Mutex<AHashSet<Address>>,
    cond: Condvar,
}

impl AddressLocker {
    pub fn new() -> Self {
        AddressLocker::default()
    }

    /// Enter the latch for `address`, waiting while another commit holds it.
    pub fn latch(&self, address: Address) {
        let mut latched = self.latched.lock();
        while latched.contains(&address) {
            self.cond.wait(&mut latched);
        }
        latched.insert(address);
    }

    /// Re-enterable variant used by playback: returns false when this call
    /// did not take the latch because the caller already holds it.
    pub fn latch_once(&self, address: Address, held: &mut AHashSet<Address>) -> bool {
        if held.contains(&address) {
            return false;
        }
        self.latch(address);
        held.insert(address);
        true
    }

    /// Leave the latch for `address`, waking waiters.
    pub fn unlatch(&self, address: Address) {
        let mut latched = self.latched.lock();
        let removed = latched.remove(&address);
        debug_assert!(removed, "unlatch of address {address} not latched");
        self.cond.notify_all();
    }

    /// Release every latch in `held`.
    pub fn unlatch_all(&self, held: &mut AHashSet<Address>) {
        if held.is_empty() {
            return;
        }
        let mut latched = self.latched.lock();
        for address in held.drain() {
            latched.remove(&address);
        }
        self.cond.notify_all();
    }
}
