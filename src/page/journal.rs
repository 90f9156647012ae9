//! Journal operation records
//!
//! Bit-exact codec for the redo journal. Each record is a two-byte tag and
//! a fixed little-endian payload; records never straddle a page boundary.

use crate::common::{
    Address, OP_CHECKPOINT, OP_COMMIT, OP_CREATE_ADDRESS_PAGE, OP_FREE, OP_MOVE, OP_MOVE_PAGE,
    OP_NEXT_PAGE, OP_TEMPORARY, OP_TERMINATE, OP_TRUNCATE, OP_WRITE, PackError, Position, Result,
};

/// Largest encoded record: `Move` at 2 + 3 × 8 bytes.
pub const MAX_RECORD_LEN: usize = 26;

/// Space reserved at the end of every journal page for the chain link.
pub const NEXT_PAGE_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalRecord {
    /// Relocate a whole page; playback re-copies and retargets slots.
    MovePage { from: Position, to: Position },
    /// Marks the journal committed; bookkeeping only.
    Commit,
    /// Promote the page at `position` to an address page; `mirror` is the
    /// relocation target of the page that previously occupied it (0 = none).
    CreateAddressPage { position: Position, mirror: Position },
    /// Place the block staged on interim page `source` into the user region.
    Write { address: Address, source: Position },
    Free { address: Address },
    /// Journal continues on another page.
    NextPage { position: Position },
    /// Copy one block from `from` to `to` during compaction.
    Move {
        address: Address,
        from: Position,
        to: Position,
    },
    Terminate,
    /// Record `address` in the temporary pool at reference slot `slot`.
    Temporary { address: Address, slot: Position },
    /// Safe point: playback may persist the header slot rewritten to
    /// `position` and restart from there.
    Checkpoint { position: Position },
    /// Reset a block page to the prefix ending at `last_address` before the
    /// compaction appends replay.
    Truncate {
        page: Position,
        last_address: Address,
    },
}

impl JournalRecord {
    pub fn encoded_len(&self) -> usize {
        2 + match self {
            JournalRecord::Commit | JournalRecord::Terminate => 0,
            JournalRecord::Free { .. }
            | JournalRecord::NextPage { .. }
            | JournalRecord::Checkpoint { .. } => 8,
            JournalRecord::MovePage { .. }
            | JournalRecord::CreateAddressPage { .. }
            | JournalRecord::Write { .. }
            | JournalRecord::Temporary { .. }
            | JournalRecord::Truncate { .. } => 16,
            JournalRecord::Move { .. } => 24,
        }
    }

    /// Encode into `out`, returning the encoded length.
    pub fn encode(&self, out: &mut [u8]) -> usize {
        fn put(out: &mut [u8], at: &mut usize, value: u64) {
            out[*at..*at + 8].copy_from_slice(&value.to_le_bytes());
            *at += 8;
        }
        let mut cursor = 2usize;
        let tag = match *self {
            JournalRecord::MovePage { from, to } => {
                put(out, &mut cursor, from);
                put(out, &mut cursor, to);
                OP_MOVE_PAGE
            }
            JournalRecord::Commit => OP_COMMIT,
            JournalRecord::CreateAddressPage { position, mirror } => {
                put(out, &mut cursor, position);
                put(out, &mut cursor, mirror);
                OP_CREATE_ADDRESS_PAGE
            }
            JournalRecord::Write { address, source } => {
                put(out, &mut cursor, address);
                put(out, &mut cursor, source);
                OP_WRITE
            }
            JournalRecord::Free { address } => {
                put(out, &mut cursor, address);
                OP_FREE
            }
            JournalRecord::NextPage { position } => {
                put(out, &mut cursor, position);
                OP_NEXT_PAGE
            }
            JournalRecord::Move { address, from, to } => {
                put(out, &mut cursor, address);
                put(out, &mut cursor, from);
                put(out, &mut cursor, to);
                OP_MOVE
            }
            JournalRecord::Terminate => OP_TERMINATE,
            JournalRecord::Temporary { address, slot } => {
                put(out, &mut cursor, address);
                put(out, &mut cursor, slot);
                OP_TEMPORARY
            }
            JournalRecord::Checkpoint { position } => {
                put(out, &mut cursor, position);
                OP_CHECKPOINT
            }
            JournalRecord::Truncate { page, last_address } => {
                put(out, &mut cursor, page);
                put(out, &mut cursor, last_address);
                OP_TRUNCATE
            }
        };
        out[0..2].copy_from_slice(&tag.to_le_bytes());
        cursor
    }

    /// Decode one record from the front of `buf`, returning it with its
    /// encoded length.
    pub fn decode(buf: &[u8]) -> Result<(JournalRecord, usize)> {
        let corrupt = |detail: String| PackError::Corrupt { detail };
        if buf.len() < 2 {
            return Err(corrupt("journal record truncated".to_string()));
        }
        let tag = u16::from_le_bytes(buf[0..2].try_into().unwrap());
        let mut cursor = 2usize;
        let take = |buf: &[u8], at: &mut usize| -> Result<u64> {
            if buf.len() < *at + 8 {
                return Err(PackError::Corrupt {
                    detail: "journal record payload truncated".to_string(),
                });
            }
            let v = u64::from_le_bytes(buf[*at..*at + 8].try_into().unwrap());
            *at += 8;
            Ok(v)
        };
        let record = match tag {
            OP_MOVE_PAGE => JournalRecord::MovePage {
                from: take(buf, &mut cursor)?,
                to: take(buf, &mut cursor)?,
            },
            OP_COMMIT => JournalRecord::Commit,
            OP_CREATE_ADDRESS_PAGE => JournalRecord::CreateAddressPage {
                position: take(buf, &mut cursor)?,
                mirror: take(buf, &mut cursor)?,
            },
            OP_WRITE => JournalRecord::Write {
                address: take(buf, &mut cursor)?,
                source: take(buf, &mut cursor)?,
            },
            OP_FREE => JournalRecord::Free {
                address: take(buf, &mut cursor)?,
            },
            OP_NEXT_PAGE => JournalRecord::NextPage {
                position: take(buf, &mut cursor)?,
            },
            OP_MOVE => JournalRecord::Move {
                address: take(buf, &mut cursor)?,
                from: take(buf, &mut cursor)?,
                to: take(buf, &mut cursor)?,
            },
            OP_TERMINATE => JournalRecord::Terminate,
            OP_TEMPORARY => JournalRecord::Temporary {
                address: take(buf, &mut cursor)?,
                slot: take(buf, &mut cursor)?,
            },
            OP_CHECKPOINT => JournalRecord::Checkpoint {
                position: take(buf, &mut cursor)?,
            },
            OP_TRUNCATE => JournalRecord::Truncate {
                page: take(buf, &mut cursor)?,
                last_address: take(buf, &mut cursor)?,
            },
            other => return Err(corrupt(format!("unknown journal tag {other}"))),
        };
        Ok((record, cursor))
    }
}
