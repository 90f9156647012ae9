//! Common types and error definitions for blockpack
//!
//! This module contains the wire constants, shared type aliases, and the
//! domain error taxonomy used throughout the engine.

use thiserror::Error;

/// Byte position inside the pack file. Positions of pages are multiples of
/// the page size; position 0 is never a page and serves as nil.
pub type Position = u64;

/// Stable identifier of a block: the byte position of its slot inside an
/// address page. Remains valid across block relocation.
pub type Address = u64;

/// File signature, first eight bytes of every pack file.
pub const SIGNATURE: [u8; 8] = *b"BLKPACK\0";

/// Shutdown stamp left by a clean close.
pub const SOFT_SHUTDOWN: u32 = 0xAAAA_AAAA;

/// Shutdown stamp held while the file is in use; a crash leaves it behind
/// and forces a recovery pass before the file can be reopened.
pub const HARD_SHUTDOWN: u32 = 0x5555_5555;

/// Slot value marking an address reserved by an uncommitted mutator.
pub const RESERVED_SLOT: u64 = u64::MAX;

/// Size of a block-page header: block count (4) plus reserved (4).
pub const BLOCK_PAGE_HEADER_SIZE: u32 = 8;

/// Size of a block header: signed stride (4) plus back address (8).
pub const BLOCK_HEADER_SIZE: u32 = 12;

/// Journal operation tags (two bytes on the wire).
pub const OP_MOVE_PAGE: u16 = 3;
pub const OP_COMMIT: u16 = 4;
pub const OP_CREATE_ADDRESS_PAGE: u16 = 5;
pub const OP_WRITE: u16 = 6;
pub const OP_FREE: u16 = 7;
pub const OP_NEXT_PAGE: u16 = 8;
pub const OP_MOVE: u16 = 9;
pub const OP_TERMINATE: u16 = 10;
pub const OP_TEMPORARY: u16 = 11;
pub const OP_CHECKPOINT: u16 = 12;
pub const OP_TRUNCATE: u16 = 13;

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Round `value` down to a multiple of `alignment` (a power of two).
#[inline]
pub fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Error type for all pack operations.
#[derive(Error, Debug)]
pub enum PackError {
    /// The file does not begin with the pack signature.
    #[error("not a pack file: bad signature")]
    Signature,

    /// The file was not shut down softly; a recovery pass is required.
    #[error("hard shutdown detected: recovery required before reopen")]
    Shutdown,

    /// The file length is inconsistent with the header geometry.
    #[error("file size {actual} inconsistent with header (expected at least {expected})")]
    FileSize { expected: u64, actual: u64 },

    #[error("read failed at position {position}")]
    IoRead {
        position: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("write failed at position {position}")]
    IoWrite {
        position: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("force to disk failed")]
    IoForce(#[source] std::io::Error),

    #[error("close failed")]
    IoClose(#[source] std::io::Error),

    #[error("truncate to {position} failed")]
    IoTruncate {
        position: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("file size query failed")]
    IoSize(#[source] std::io::Error),

    /// The fixed header or one of the header regions failed to decode.
    #[error("corrupt file header: {detail}")]
    HeaderCorrupt { detail: String },

    /// A block page failed its structural invariants.
    #[error("corrupt block page at position {position}: {detail}")]
    BlockPageCorrupt { position: u64, detail: String },

    /// A structural invariant failed outside the header or a block page.
    #[error("corrupt pack state: {detail}")]
    Corrupt { detail: String },

    /// The caller attempted to free a static block.
    #[error("address {address} is a static block and cannot be freed")]
    FreedStaticAddress { address: u64 },

    /// The caller used an address that is not live.
    #[error("address {address} does not reference a live block")]
    FreedAddress { address: u64 },

    /// The caller's buffer or block size exceeds the block's capacity.
    #[error("size {size} overflows capacity {capacity}")]
    Overflow { size: u64, capacity: u64 },
}

impl PackError {
    /// Integrity errors are fatal; the store is unusable afterwards.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            PackError::Signature
                | PackError::HeaderCorrupt { .. }
                | PackError::BlockPageCorrupt { .. }
                | PackError::Corrupt { .. }
        )
    }

    /// Contract errors are caller bugs, not store failures.
    pub fn is_contract(&self) -> bool {
        matches!(
            self,
            PackError::FreedStaticAddress { .. }
                | PackError::FreedAddress { .. }
                | PackError::Overflow { .. }
        )
    }

    /// Error category for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            PackError::Signature => "signature",
            PackError::Shutdown => "shutdown",
            PackError::FileSize { .. } => "file_size",
            PackError::IoRead { .. }
            | PackError::IoWrite { .. }
            | PackError::IoForce(_)
            | PackError::IoClose(_)
            | PackError::IoTruncate { .. }
            | PackError::IoSize(_) => "io",
            PackError::HeaderCorrupt { .. } => "header",
            PackError::BlockPageCorrupt { .. } => "block_page",
            PackError::Corrupt { .. } => "corrupt",
            PackError::FreedStaticAddress { .. } => "static",
            PackError::FreedAddress { .. } => "freed",
            PackError::Overflow { .. } => "overflow",
        }
    }
}

/// Result type alias for pack operations.
pub type Result<T> = std::result::Result<T, PackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0, 1024), 0);
        assert_eq!(align_up(1, 1024), 1024);
        assert_eq!(align_up(1024, 1024), 1024);
        assert_eq!(align_up(1025, 1024), 2048);
        assert_eq!(align_down(1025, 1024), 1024);
        assert_eq!(align_down(1023, 1024), 0);
    }

    #[test]
    fn test_error_classification() {
        assert!(PackError::Signature.is_integrity());
        assert!(!PackError::Signature.is_contract());
        assert!(PackError::FreedAddress { address: 42 }.is_contract());
        assert!(
            PackError::Overflow {
                size: 10,
                capacity: 4
            }
            .is_contract()
        );
        assert_eq!(PackError::Shutdown.category(), "shutdown");
        assert_eq!(PackError::IoForce(std::io::Error::other("x")).category(), "io");
    }

    #[test]
    fn test_shutdown_stamps_differ() {
        assert_ne!(SOFT_SHUTDOWN, HARD_SHUTDOWN);
        assert_eq!(SOFT_SHUTDOWN, 0xAAAA_AAAA);
        assert_eq!(HARD_SHUTDOWN, 0x5555_5555);
    }
}
