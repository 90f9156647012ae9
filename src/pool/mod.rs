//! Page and slot pools
//!
//! Blocking pools coordinating the scarce resources of the engine: address
//! pages with free slots, interim scratch pages, journal-header slots, and
//! temporary block references.

pub mod address_pages;
pub mod headers;
pub mod interim;
pub mod temporary;

pub use address_pages::{AddressPagePool, Take};
pub use headers::HeaderPool;
pub use interim::InterimPool;
pub use temporary::TemporaryPool;
