//! Block page overlay
//!
//! A block page holds a signed block count (negative for user pages,
//! positive for interim pages) and a packed sequence of blocks. Each block
//! is a signed stride (negative once freed), an 8-byte back reference to
//! the block's address (negated for a continuation block), and the payload.
//!
//! Invariant: the sum of block strides plus the page header equals the page
//! size minus the remaining free bytes. Freed blocks keep their back
//! reference until the page is compacted.

use std::sync::Arc;

use crate::common::{
    Address, BLOCK_HEADER_SIZE, BLOCK_PAGE_HEADER_SIZE, PackError, Position, Result,
};
use crate::sheaf::{PageCore, RawPage};

const BODY: usize = BLOCK_PAGE_HEADER_SIZE as usize;

/// One decoded block record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// Byte offset of the record inside the page.
    pub offset: usize,
    /// Full stride of the block, header included.
    pub stride: u32,
    /// Back reference to the block's address.
    pub back: Address,
    pub freed: bool,
    /// Live block belonging to a multi-block chain (decoded, never written).
    pub continued: bool,
}

/// Decode every block record on the page.
pub(crate) fn entries_of(core: &PageCore, position: Position) -> Result<Vec<BlockEntry>> {
    let corrupt = |detail: &str| PackError::BlockPageCorrupt {
        position,
        detail: detail.to_string(),
    };
    let len = core.bytes().len();
    let n = core.get_i32(0).unsigned_abs() as usize;
    let mut entries = Vec::with_capacity(n);
    let mut offset = BODY;
    for _ in 0..n {
        if offset + BLOCK_HEADER_SIZE as usize > len {
            return Err(corrupt("block header past end of page"));
        }
        let raw_stride = core.get_i32(offset);
        let stride = raw_stride.unsigned_abs();
        if stride < BLOCK_HEADER_SIZE || offset + stride as usize > len {
            return Err(corrupt("block stride out of range"));
        }
        let raw_back = core.get_i64(offset + 4);
        entries.push(BlockEntry {
            offset,
            stride,
            back: raw_back.unsigned_abs(),
            freed: raw_stride < 0,
            continued: raw_stride > 0 && raw_back < 0,
        });
        offset += stride as usize;
    }
    Ok(entries)
}

fn used_of(core: &PageCore, position: Position) -> Result<usize> {
    Ok(entries_of(core, position)?
        .iter()
        .map(|e| e.stride as usize)
        .sum())
}

pub struct BlockPage {
    raw: Arc<RawPage>,
}

impl BlockPage {
    pub fn new(raw: Arc<RawPage>) -> Self {
        BlockPage { raw }
    }

    #[inline]
    pub fn raw(&self) -> &Arc<RawPage> {
        &self.raw
    }

    #[inline]
    pub fn position(&self) -> Position {
        self.raw.position()
    }

    /// True when the page belongs to the committed user region.
    pub fn is_user(&self) -> bool {
        self.raw.lock().get_i32(0) < 0
    }

    pub fn block_count(&self) -> u32 {
        self.raw.lock().get_i32(0).unsigned_abs()
    }

    /// Free bytes left in the page body.
    pub fn remaining(&self) -> Result<u32> {
        let core = self.raw.lock();
        let capacity = core.bytes().len() - BODY;
        let used = used_of(&core, self.raw.position())?;
        Ok((capacity - used) as u32)
    }

    pub fn entries(&self) -> Result<Vec<BlockEntry>> {
        let core = self.raw.lock();
        entries_of(&core, self.raw.position())
    }

    /// Locate the block for `address`, preferring the live copy. A page can
    /// briefly hold a freed copy next to a live one when a rewrite lands on
    /// the page it is replacing from.
    pub fn find(&self, address: Address) -> Result<Option<BlockEntry>> {
        let entries = self.entries()?;
        Ok(entries
            .iter()
            .copied()
            .find(|e| e.back == address && !e.freed)
            .or_else(|| entries.into_iter().find(|e| e.back == address)))
    }

    /// True when the page holds a live block for `address`.
    pub fn contains_live(&self, address: Address) -> Result<bool> {
        Ok(self
            .entries()?
            .iter()
            .any(|e| e.back == address && !e.freed))
    }

    /// Append a block of `stride` bytes for `address`, copying `payload`
    /// into its body and zero-filling the rest. When `make_user` is set the
    /// page is stamped as a user page. Returns the remaining bytes after
    /// the append, or None when the block does not fit (the page filled up
    /// between best-fit and the append).
    pub fn append(
        &self,
        address: Address,
        stride: u32,
        payload: &[u8],
        make_user: bool,
    ) -> Result<Option<u32>> {
        debug_assert!(stride >= BLOCK_HEADER_SIZE);
        debug_assert!(payload.len() <= (stride - BLOCK_HEADER_SIZE) as usize);
        let position = self.raw.position();
        let mut core = self.raw.lock();
        let capacity = core.bytes().len() - BODY;
        let used = used_of(&core, position)?;
        if used + stride as usize > capacity {
            return Ok(None);
        }
        let offset = BODY + used;
        core.put_i32(offset, stride as i32);
        core.put_i64(offset + 4, address as i64);
        let body = offset + BLOCK_HEADER_SIZE as usize;
        core.put_bytes(body, payload);
        core.zero(
            body + payload.len(),
            (stride - BLOCK_HEADER_SIZE) as usize - payload.len(),
        );
        let count = core.get_i32(0);
        let mut count = if count < 0 { count - 1 } else { count + 1 };
        if make_user && count > 0 {
            count = -count;
        }
        core.put_i32(0, count);
        Ok(Some((capacity - used - stride as usize) as u32))
    }

    /// Overwrite the live block's payload in place. The block's size is
    /// fixed at allocation; a larger source is an overflow.
    pub fn write_payload(&self, address: Address, buf: &[u8]) -> Result<()> {
        let position = self.raw.position();
        let mut core = self.raw.lock();
        let entry = entries_of(&core, position)?
            .into_iter()
            .find(|e| e.back == address && !e.freed)
            .ok_or(PackError::Corrupt {
                detail: format!("no live block for address {address} on page {position}"),
            })?;
        let body = (entry.stride - BLOCK_HEADER_SIZE) as usize;
        if buf.len() > body {
            return Err(PackError::Overflow {
                size: buf.len() as u64,
                capacity: body as u64,
            });
        }
        let at = entry.offset + BLOCK_HEADER_SIZE as usize;
        core.put_bytes(at, buf);
        Ok(())
    }

    /// Copy out the live block's full payload.
    pub fn read_payload(&self, address: Address) -> Result<Option<Vec<u8>>> {
        let position = self.raw.position();
        let core = self.raw.lock();
        let entry = entries_of(&core, position)?
            .into_iter()
            .find(|e| e.back == address && !e.freed);
        Ok(entry.map(|e| {
            let at = e.offset + BLOCK_HEADER_SIZE as usize;
            core.bytes()[at..e.offset + e.stride as usize].to_vec()
        }))
    }

    /// Mark the block freed by negating its stride, waiting out a vacuum
    /// mirror first. Returns false when no live block matches.
    pub fn free_block(&self, address: Address) -> Result<bool> {
        let position = self.raw.position();
        let mut core = self.raw.lock_unmirrored();
        let entry = entries_of(&core, position)?
            .into_iter()
            .find(|e| e.back == address && !e.freed);
        match entry {
            Some(e) => {
                core.put_i32(e.offset, -(e.stride as i32));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the block entirely, closing the gap. Only meaningful on a
    /// mutator's private interim page. Returns the remaining bytes after
    /// removal.
    pub fn unallocate(&self, address: Address) -> Result<u32> {
        let position = self.raw.position();
        let mut core = self.raw.lock();
        let entries = entries_of(&core, position)?;
        let used: usize = entries.iter().map(|e| e.stride as usize).sum();
        let entry = entries
            .into_iter()
            .find(|e| e.back == address)
            .ok_or(PackError::Corrupt {
                detail: format!("unallocate of absent address {address} on page {position}"),
            })?;
        let stride = entry.stride as usize;
        let end = BODY + used;
        core.bytes_mut()
            .copy_within(entry.offset + stride..end, entry.offset);
        core.zero(end - stride, stride);
        let count = core.get_i32(0);
        let count = if count < 0 { count + 1 } else { count - 1 };
        core.put_i32(0, count);
        let capacity = core.bytes().len() - BODY;
        Ok((capacity - (used - stride)) as u32)
    }

    /// Reset the page to the prefix of blocks ending at the live block for
    /// `last_address` (0 resets the page to empty). The block count keeps
    /// its sign; bytes past the prefix are left for the appends that follow.
    pub fn truncate_to(&self, last_address: Address) -> Result<()> {
        let position = self.raw.position();
        let mut core = self.raw.lock();
        let was_user = core.get_i32(0) < 0;
        if last_address == 0 {
            core.put_i32(0, 0);
            return Ok(());
        }
        let entries = entries_of(&core, position)?;
        let keep = entries
            .iter()
            .position(|e| e.back == last_address && !e.freed)
            .ok_or(PackError::BlockPageCorrupt {
                position,
                detail: format!("truncate to absent address {last_address}"),
            })?
            + 1;
        let count = keep as i32;
        core.put_i32(0, if was_user { -count } else { count });
        Ok(())
    }

    /// CRC32 of the page's meaningful bytes: header plus every block record.
    pub fn content_crc(&self) -> Result<u32> {
        let position = self.raw.position();
        let core = self.raw.lock();
        let used = used_of(&core, position)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&core.bytes()[..BODY + used]);
        Ok(hasher.finalize())
    }
}
