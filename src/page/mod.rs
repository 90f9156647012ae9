//! Page-type codecs
//!
//! Typed overlays over raw sheaf pages. Each overlay interprets the page
//! bytes under the page monitor; none of them owns geometry beyond what the
//! buffer length implies.

pub mod address;
pub mod block;
pub mod by_remaining;
pub mod journal;

pub use address::AddressPage;
pub use block::{BlockEntry, BlockPage};
pub use by_remaining::{RootPage, SlotPage};
pub use journal::JournalRecord;
