//! # blockpack: an embedded single-file block store
//!
//! `blockpack` stores variable-sized byte blocks in one file, behind stable
//! 64-bit addresses that survive compaction and relocation. Mutations are
//! staged in per-transaction isolation buffers, made durable through a redo
//! journal, and replayed into the visible region by a player; a vacuum
//! cycle reclaims fragmented pages with a mirror-then-compact protocol.
//!
//! ## Core pieces
//!
//! - **Sheaf**: paged file I/O behind a weak position-keyed page cache
//! - **Address pages**: the indirection table from stable addresses to the
//!   block pages currently holding their blocks
//! - **Mutator**: a thread-bound transaction with isolated reads and writes
//! - **Journal + player**: ordered, idempotent redo log and its playback
//! - **By-remaining table**: best-fit index of pages by aligned free space
//! - **Vacuum**: mirror-then-compact reclamation of freed block space
//!
//! ## Example
//!
//! ```rust,ignore
//! use blockpack::{Creator, Opener};
//!
//! let pack = Creator::new().create("data.pack")?;
//! let mut mutator = pack.mutate()?;
//! let address = mutator.allocate(64)?;
//! mutator.write(address, b"hello")?;
//! mutator.commit()?;
//! pack.close()?;
//!
//! let opened = Opener::open("data.pack")?;
//! let mutator = opened.pack.mutate()?;
//! assert_eq!(&mutator.read(address)?[..5], b"hello");
//! ```

pub mod boundary;
pub mod by_remaining;
pub mod common;
pub mod create;
pub mod header;
pub mod journal;
pub mod locker;
pub mod mutator;
pub mod open;
pub mod pack;
pub mod page;
mod player;
pub mod pool;
pub mod sheaf;
pub mod vacuum;

#[cfg(test)]
mod pack_tests;

// Re-export the public surface.
pub use common::{Address, PackError, Position, Result};
pub use create::Creator;
pub use mutator::Mutator;
pub use open::{Medic, Opened, Opener};
pub use pack::Pack;
pub use vacuum::{FragmentationStrategy, VacuumContext, VacuumStrategy};
