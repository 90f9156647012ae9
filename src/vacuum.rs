//! Vacuum: mirror-then-compact reclamation
//!
//! A strategy object picks fragmented user pages; the coordinator squeezes
//! their freed blocks out through the same journal machinery as a commit.
//! For each selected page, the live suffix past the first freed block is
//! copied to a mirror page under the page monitor and the page is flagged
//! `mirrored`; the journal then carries a `Truncate` to the last live block
//! before the gap and one `Move` per suffix block. Playback performs the
//! compaction; the page's checksum must match the one recorded at mirror
//! time. Writers and freers of a mirrored page wait on its monitor.

use std::sync::Arc;

use ahash::AHashSet;
use log::{debug, info};

use crate::common::{
    Address, BLOCK_HEADER_SIZE, BLOCK_PAGE_HEADER_SIZE, PackError, Position, Result,
};
use crate::journal::Journal;
use crate::page::{BlockPage, JournalRecord};
use crate::page::block::entries_of;
use crate::pack::PackInner;
use crate::player::Player;
use crate::sheaf::{PageKind, RawPage};

/// Inputs to a vacuum strategy: the pages touched since the last vacuum.
pub struct VacuumContext {
    pub allocated: AHashSet<Position>,
    pub freed: AHashSet<Position>,
}

/// Decides which user block pages to compact.
pub trait VacuumStrategy: Send + Sync {
    fn select(&self, context: &VacuumContext) -> Vec<Position>;
}

/// Default strategy: revisit every page that had a block freed since the
/// last vacuum. Pages with nothing to squeeze are filtered out by the
/// coordinator.
pub struct FragmentationStrategy;

impl VacuumStrategy for FragmentationStrategy {
    fn select(&self, context: &VacuumContext) -> Vec<Position> {
        let mut pages: Vec<Position> = context.freed.iter().copied().collect();
        pages.sort_unstable();
        pages
    }
}

struct MirrorPlan {
    page: Position,
    page_raw: Arc<RawPage>,
    /// 0 when the plan only truncates trailing freed blocks.
    mirror: Position,
    mirror_raw: Option<Arc<RawPage>>,
    /// Last live block before the first freed one; 0 truncates to empty.
    last: Address,
    moved: Vec<Address>,
    expected_crc: u32,
    old_remaining: u32,
}

/// Run one vacuum cycle. At most one cycle is in flight at a time.
pub(crate) fn vacuum(inner: &Arc<PackInner>, strategy: &dyn VacuumStrategy) -> Result<()> {
    let _cycle = inner.vacuum_mutex.lock();
    let _guard = inner.page_move.read();
    let context = {
        let mut sets = inner.vacuum_sets.lock();
        VacuumContext {
            allocated: std::mem::take(&mut sets.allocated),
            freed: std::mem::take(&mut sets.freed),
        }
    };
    let candidates = strategy.select(&context);
    if candidates.is_empty() {
        return Ok(());
    }
    // The slot is claimed before any page is mirrored: a mirrored page can
    // block commits that already hold slots.
    let slot = inner.header_pool.allocate();
    let mut plans = Vec::new();
    let gathered: Result<()> = candidates.into_iter().try_for_each(|position| {
        let current = inner.boundary.adjust(position);
        if let Some(plan) = mirror_page(inner, current)? {
            plans.push(plan);
        }
        Ok(())
    });
    if let Err(e) = gathered {
        for plan in &plans {
            plan.page_raw.set_mirrored(false);
        }
        inner.header_pool.free(slot);
        return Err(e);
    }
    if plans.is_empty() {
        inner.header_pool.free(slot);
        return Ok(());
    }
    let mut result = compact(inner, slot, &plans);
    if result.is_ok() {
        // Verify before waking writers: a free landing after the wake-up
        // legitimately changes the page content.
        for plan in &plans {
            match BlockPage::new(Arc::clone(&plan.page_raw)).content_crc() {
                Ok(crc) if crc == plan.expected_crc => {}
                Ok(crc) => {
                    result = Err(PackError::BlockPageCorrupt {
                        position: plan.page,
                        detail: format!(
                            "compaction checksum mismatch: {crc:#010x} != {:#010x}",
                            plan.expected_crc
                        ),
                    });
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
    }
    for plan in &plans {
        plan.page_raw.set_mirrored(false);
    }
    result?;
    let mut reclaimed = 0usize;
    for plan in &plans {
        let page = BlockPage::new(Arc::clone(&plan.page_raw));
        if page.block_count() == 0 {
            inner.interim.free(&inner.sheaf, plan.page);
        } else {
            let remaining = page.remaining()?;
            reclaimed += (remaining - plan.old_remaining) as usize;
            let table = inner.table.lock();
            table.add(&inner.interim, plan.page, remaining)?;
        }
        if let Some(mirror) = &plan.mirror_raw {
            inner.interim.free(&inner.sheaf, mirror.position());
        }
    }
    info!("vacuum compacted {} pages, reclaimed {reclaimed} bytes", plans.len());
    Ok(())
}

/// Journal the compaction and play it through.
fn compact(inner: &Arc<PackInner>, slot: Position, plans: &[MirrorPlan]) -> Result<()> {
    let mut journal = Journal::new(Arc::clone(&inner.sheaf), &inner.interim)?;
    for plan in plans {
        journal.append(
            &inner.interim,
            &JournalRecord::Truncate {
                page: plan.page,
                last_address: plan.last,
            },
        )?;
        for &address in &plan.moved {
            journal.append(
                &inner.interim,
                &JournalRecord::Move {
                    address,
                    from: plan.mirror,
                    to: plan.page,
                },
            )?;
        }
    }
    journal.append(&inner.interim, &JournalRecord::Commit)?;
    journal.append(&inner.interim, &JournalRecord::Terminate)?;
    journal.refresh_links();
    let mirrors: Vec<&Arc<RawPage>> = plans.iter().filter_map(|p| p.mirror_raw.as_ref()).collect();
    inner.sheaf.flush(mirrors.into_iter())?;
    inner.sheaf.flush(journal.pages())?;
    inner.sheaf.force()?;
    let start = journal.start();
    inner.sheaf.write_raw(slot, &start.to_le_bytes())?;
    inner.sheaf.force()?;
    debug!("vacuum journal durable at {start}");
    let result = Player::new(inner, slot, start).commit();
    journal.dispose(&inner.interim);
    result
}

/// Copy the live suffix past the first freed block onto a mirror page and
/// flag the page, all under its monitor. Returns None when the page has
/// nothing to compact.
fn mirror_page(inner: &Arc<PackInner>, position: Position) -> Result<Option<MirrorPlan>> {
    let raw = inner.sheaf.get(position, PageKind::Block)?;
    struct Gathered {
        last: Address,
        moved_records: Vec<(Address, u32, Vec<u8>)>,
        expected_crc: u32,
        old_remaining: u32,
    }
    let gathered = {
        let mut core = raw.lock();
        if core.get_i32(0) >= 0 {
            return Ok(None);
        }
        // Strategy candidates are advisory; a page recycled since its free
        // was recorded simply has nothing to compact.
        let Ok(entries) = entries_of(&core, position) else {
            return Ok(None);
        };
        let Some(first_freed) = entries.iter().position(|e| e.freed) else {
            return Ok(None);
        };
        let prefix = &entries[..first_freed];
        let suffix: Vec<_> = entries[first_freed..]
            .iter()
            .filter(|e| !e.freed)
            .copied()
            .collect();
        let last = prefix.last().map(|e| e.back).unwrap_or(0);
        let moved_records: Vec<(Address, u32, Vec<u8>)> = suffix
            .iter()
            .map(|e| {
                (
                    e.back,
                    e.stride,
                    core.bytes()[e.offset..e.offset + e.stride as usize].to_vec(),
                )
            })
            .collect();
        let capacity = core.bytes().len() - BLOCK_PAGE_HEADER_SIZE as usize;
        let used: usize = entries.iter().map(|e| e.stride as usize).sum();
        let old_remaining = (capacity - used) as u32;
        // Checksum of the page as it must read after compaction.
        let count = (first_freed + suffix.len()) as i32;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&(-count).to_le_bytes());
        hasher.update(&0u32.to_le_bytes());
        for entry in prefix {
            hasher.update(&core.bytes()[entry.offset..entry.offset + entry.stride as usize]);
        }
        for (_, _, bytes) in &moved_records {
            hasher.update(bytes);
        }
        core.mirrored = true;
        Gathered {
            last,
            moved_records,
            expected_crc: hasher.finalize(),
            old_remaining,
        }
    };
    let mut mirror_raw = None;
    let mut mirror = 0;
    let mut moved = Vec::with_capacity(gathered.moved_records.len());
    if !gathered.moved_records.is_empty() {
        let built: Result<Arc<RawPage>> = (|| {
            let page = inner
                .interim
                .new_blank(&inner.sheaf, false, PageKind::Block)?;
            let mirror_page = BlockPage::new(Arc::clone(&page));
            for (address, stride, bytes) in &gathered.moved_records {
                let payload = &bytes[BLOCK_HEADER_SIZE as usize..];
                mirror_page
                    .append(*address, *stride, payload, false)?
                    .ok_or(PackError::Corrupt {
                        detail: "mirror page cannot hold its source's live suffix".to_string(),
                    })?;
                moved.push(*address);
            }
            Ok(page)
        })();
        let page = match built {
            Ok(page) => page,
            Err(e) => {
                raw.set_mirrored(false);
                return Err(e);
            }
        };
        mirror = page.position();
        mirror_raw = Some(page);
    }
    // The entry leaves the committed table while the page's remaining is
    // in flux; it is re-filed after compaction.
    {
        let table = inner.table.lock();
        let _ = table.remove(&inner.interim, position, gathered.old_remaining);
    }
    debug!(
        "mirrored page {position}: keep through {}, move {} blocks",
        gathered.last,
        moved.len()
    );
    Ok(Some(MirrorPlan {
        page: position,
        page_raw: raw,
        mirror,
        mirror_raw,
        last: gathered.last,
        moved,
        expected_crc: gathered.expected_crc,
        old_remaining: gathered.old_remaining,
    }))
}
