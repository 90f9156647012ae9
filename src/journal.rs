//! Redo journal writer
//!
//! Appends operation records into a chain of scratch journal pages. Every
//! page reserves space at its end for the `NextPage` link so that records
//! never straddle a page boundary. The journal's start position is what a
//! commit persists into its claimed journal-header slot.

use std::sync::Arc;

use crate::boundary::Boundary;
use crate::common::{PackError, Position, Result, align_down};
use crate::page::JournalRecord;
use crate::page::journal::{MAX_RECORD_LEN, NEXT_PAGE_LEN};
use crate::pool::InterimPool;
use crate::sheaf::{PageKind, RawPage, Sheaf};

/// Ceiling on records in one journal, against cyclic page chains.
const MAX_JOURNAL_RECORDS: usize = 16 * 1024 * 1024;

pub struct Journal {
    sheaf: Arc<Sheaf>,
    pages: Vec<Arc<RawPage>>,
    /// Offsets of the written `NextPage` links, one per chained page, so
    /// the links can be refreshed if a page relocates before commit.
    links: Vec<usize>,
    offset: usize,
    records: usize,
}

impl Journal {
    pub fn new(sheaf: Arc<Sheaf>, interim: &InterimPool) -> Result<Self> {
        let page = interim.new_blank(&sheaf, false, PageKind::Journal)?;
        Ok(Journal {
            sheaf,
            pages: vec![page],
            links: Vec::new(),
            offset: 0,
            records: 0,
        })
    }

    /// Current position of the first operation record. Read at commit time:
    /// journal pages are scratch and may have been relocated since the
    /// journal was opened.
    pub fn start(&self) -> Position {
        self.pages[0].position()
    }

    /// Re-encode every `NextPage` link against the pages' current
    /// positions. Must run before the journal is flushed for a commit:
    /// links written before an address-region expansion may name positions
    /// the expansion has since reassigned.
    pub fn refresh_links(&self) {
        for (index, &offset) in self.links.iter().enumerate() {
            let link = JournalRecord::NextPage {
                position: self.pages[index + 1].position(),
            };
            let mut buf = [0u8; MAX_RECORD_LEN];
            let n = link.encode(&mut buf);
            self.pages[index].lock().put_bytes(offset, &buf[..n]);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn pages(&self) -> &[Arc<RawPage>] {
        &self.pages
    }

    /// Append one record, chaining to a fresh scratch page when the current
    /// page cannot hold the record plus the reserved link.
    pub fn append(&mut self, interim: &InterimPool, record: &JournalRecord) -> Result<()> {
        let page_size = self.sheaf.page_size() as usize;
        let len = record.encoded_len();
        if self.offset + len + NEXT_PAGE_LEN > page_size {
            let next = interim.new_blank(&self.sheaf, false, PageKind::Journal)?;
            let link = JournalRecord::NextPage {
                position: next.position(),
            };
            let mut buf = [0u8; MAX_RECORD_LEN];
            let n = link.encode(&mut buf);
            self.pages
                .last()
                .expect("journal always has a page")
                .lock()
                .put_bytes(self.offset, &buf[..n]);
            self.links.push(self.offset);
            self.pages.push(next);
            self.offset = 0;
        }
        let mut buf = [0u8; MAX_RECORD_LEN];
        let n = record.encode(&mut buf);
        self.pages
            .last()
            .expect("journal always has a page")
            .lock()
            .put_bytes(self.offset, &buf[..n]);
        self.offset += n;
        self.records += 1;
        Ok(())
    }

    /// Return every journal page to the interim pool.
    pub fn dispose(&self, interim: &InterimPool) {
        for page in &self.pages {
            interim.free(&self.sheaf, page.position());
        }
    }
}

/// Read a journal from `start` through its `Terminate`, following page
/// links through the move map.
pub fn read_records(
    sheaf: &Sheaf,
    boundary: &Boundary,
    start: Position,
) -> Result<Vec<JournalRecord>> {
    let page_size = sheaf.page_size();
    let mut records = Vec::new();
    let mut at = boundary.adjust(start);
    loop {
        let page_position = align_down(at, page_size);
        let page = sheaf.get(page_position, PageKind::Journal)?;
        let core = page.lock();
        let mut offset = (at - page_position) as usize;
        loop {
            let (record, n) = JournalRecord::decode(&core.bytes()[offset..])?;
            match record {
                JournalRecord::Terminate => {
                    records.push(record);
                    return Ok(records);
                }
                JournalRecord::NextPage { position } => {
                    at = boundary.adjust(position);
                    break;
                }
                _ => {
                    records.push(record);
                    offset += n;
                }
            }
            if records.len() > MAX_JOURNAL_RECORDS {
                return Err(PackError::Corrupt {
                    detail: "journal does not terminate".to_string(),
                });
            }
        }
    }
}
