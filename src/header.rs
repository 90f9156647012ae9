//! File header, static-blocks region, and reopen region codecs
//!
//! Bit-exact little-endian layouts. The fixed header is followed by the
//! journal-header slots and the static-blocks region; pages begin at the
//! next page boundary. The reopen region is written at the durable end of
//! the file by a soft shutdown and consumed (and truncated away) on open.

use std::collections::BTreeMap;

use crate::common::{
    Address, PackError, Position, Result, SIGNATURE, align_up,
};

/// Byte length of the fixed file header.
pub const FIXED_HEADER_LEN: usize = 76;

/// Byte offset of the first journal-header slot.
pub const JOURNAL_SLOTS_OFFSET: u64 = FIXED_HEADER_LEN as u64;

#[derive(Debug, Clone)]
pub struct FileHeader {
    pub shutdown: u32,
    pub page_size: u32,
    pub alignment: u32,
    pub journal_count: u32,
    pub static_region: u32,
    pub header_size: u32,
    pub pool_minimum: u32,
    pub user_boundary: Position,
    pub end_of_sheaf: Position,
    pub first_temporary: Position,
    pub by_remaining_root: Position,
    pub reserved: u64,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; FIXED_HEADER_LEN] {
        let mut out = [0u8; FIXED_HEADER_LEN];
        out[0..8].copy_from_slice(&SIGNATURE);
        out[8..12].copy_from_slice(&self.shutdown.to_le_bytes());
        out[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        out[16..20].copy_from_slice(&self.alignment.to_le_bytes());
        out[20..24].copy_from_slice(&self.journal_count.to_le_bytes());
        out[24..28].copy_from_slice(&self.static_region.to_le_bytes());
        out[28..32].copy_from_slice(&self.header_size.to_le_bytes());
        out[32..36].copy_from_slice(&self.pool_minimum.to_le_bytes());
        out[36..44].copy_from_slice(&self.user_boundary.to_le_bytes());
        out[44..52].copy_from_slice(&self.end_of_sheaf.to_le_bytes());
        out[52..60].copy_from_slice(&self.first_temporary.to_le_bytes());
        out[60..68].copy_from_slice(&self.by_remaining_root.to_le_bytes());
        out[68..76].copy_from_slice(&self.reserved.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<FileHeader> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(PackError::HeaderCorrupt {
                detail: "short header".to_string(),
            });
        }
        if buf[0..8] != SIGNATURE {
            return Err(PackError::Signature);
        }
        let u32_at = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
        let u64_at = |at: usize| u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
        let header = FileHeader {
            shutdown: u32_at(8),
            page_size: u32_at(12),
            alignment: u32_at(16),
            journal_count: u32_at(20),
            static_region: u32_at(24),
            header_size: u32_at(28),
            pool_minimum: u32_at(32),
            user_boundary: u64_at(36),
            end_of_sheaf: u64_at(44),
            first_temporary: u64_at(52),
            by_remaining_root: u64_at(60),
            reserved: u64_at(68),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        let bad = |detail: String| PackError::HeaderCorrupt { detail };
        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            return Err(bad(format!("page size {} invalid", self.page_size)));
        }
        if !self.alignment.is_power_of_two()
            || self.alignment < 8
            || self.alignment >= self.page_size
        {
            return Err(bad(format!("alignment {} invalid", self.alignment)));
        }
        if self.journal_count == 0 {
            return Err(bad("no journal-header slots".to_string()));
        }
        if self.pool_minimum == 0 {
            return Err(bad("address pool minimum of zero".to_string()));
        }
        let expected =
            FIXED_HEADER_LEN as u32 + self.journal_count * 8 + self.static_region;
        if self.header_size != expected {
            return Err(bad(format!(
                "header size {} != {expected}",
                self.header_size
            )));
        }
        Ok(())
    }

    /// Byte offset of the static-blocks region.
    pub fn static_region_offset(&self) -> Position {
        JOURNAL_SLOTS_OFFSET + self.journal_count as u64 * 8
    }

    /// Position of the first page.
    pub fn first_page(&self) -> Position {
        align_up(self.header_size as u64, self.page_size as u64)
    }
}

/// Encode the static-blocks map: count, then per block the URI length in
/// UTF-16 code units, the UTF-16LE URI, and the address.
pub fn encode_static_blocks(blocks: &BTreeMap<String, Address>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
    for (uri, &address) in blocks {
        let units: Vec<u16> = uri.encode_utf16().collect();
        out.extend_from_slice(&(units.len() as u32).to_le_bytes());
        for unit in units {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out.extend_from_slice(&address.to_le_bytes());
    }
    out
}

pub fn decode_static_blocks(buf: &[u8]) -> Result<BTreeMap<String, Address>> {
    fn take<'a>(buf: &'a [u8], at: &mut usize, n: usize) -> Result<&'a [u8]> {
        if *at + n > buf.len() {
            return Err(PackError::HeaderCorrupt {
                detail: "static-blocks region truncated".to_string(),
            });
        }
        let slice = &buf[*at..*at + n];
        *at += n;
        Ok(slice)
    }
    let mut at = 0usize;
    let count = u32::from_le_bytes(take(buf, &mut at, 4)?.try_into().unwrap());
    let mut blocks = BTreeMap::new();
    for _ in 0..count {
        let units = u32::from_le_bytes(take(buf, &mut at, 4)?.try_into().unwrap()) as usize;
        let code_units: Vec<u16> = take(buf, &mut at, units * 2)?
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let uri = String::from_utf16(&code_units).map_err(|_| PackError::HeaderCorrupt {
            detail: "static block URI is not UTF-16".to_string(),
        })?;
        let address = u64::from_le_bytes(take(buf, &mut at, 8)?.try_into().unwrap());
        blocks.insert(uri, address);
    }
    Ok(blocks)
}

/// Snapshot written at the durable end of the file by a soft shutdown:
/// address pages with free slots, user pages with remaining bytes, and
/// free durable holes for the interim pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReopenRegion {
    pub address_pages: Vec<Position>,
    pub user_pages: Vec<Position>,
    pub free_pages: Vec<Position>,
}

impl ReopenRegion {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for list in [&self.address_pages, &self.user_pages, &self.free_pages] {
            out.extend_from_slice(&(list.len() as u32).to_le_bytes());
            for &position in list {
                out.extend_from_slice(&position.to_le_bytes());
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<ReopenRegion> {
        let corrupt = || PackError::HeaderCorrupt {
            detail: "reopen region truncated".to_string(),
        };
        let mut at = 0usize;
        let mut lists: [Vec<Position>; 3] = Default::default();
        for list in &mut lists {
            if at + 4 > buf.len() {
                return Err(corrupt());
            }
            let count = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap()) as usize;
            at += 4;
            if at + count * 8 > buf.len() {
                return Err(corrupt());
            }
            for _ in 0..count {
                list.push(u64::from_le_bytes(buf[at..at + 8].try_into().unwrap()));
                at += 8;
            }
        }
        let [address_pages, user_pages, free_pages] = lists;
        Ok(ReopenRegion {
            address_pages,
            user_pages,
            free_pages,
        })
    }
}
