//! End-to-end scenarios over the public surface, plus invariant checks
//! that reach through the crate internals.

use std::collections::{BTreeMap, BTreeSet};

use tempfile::tempdir;

use crate::common::{HARD_SHUTDOWN, PackError};
use crate::header::JOURNAL_SLOTS_OFFSET;
use crate::page::JournalRecord;
use crate::{Creator, Medic, Opener};

fn small_creator() -> Creator {
    Creator {
        page_size: 1024,
        alignment: 64,
        journal_headers: 4,
        address_pool_minimum: 1,
        static_blocks: BTreeMap::new(),
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_allocate_write_reopen_read() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("s1.pack");
    let address = {
        let pack = small_creator().create(&path).unwrap();
        let mut mutator = pack.mutate().unwrap();
        let address = mutator.allocate(16).unwrap();
        mutator.write(address, &[0x01, 0x02]).unwrap();
        mutator.commit().unwrap();
        pack.close().unwrap();
        address
    };
    let opened = Opener::open(&path).unwrap();
    let mutator = opened.pack.mutate().unwrap();
    let payload = mutator.read(address).unwrap();
    assert_eq!(payload.len(), 16);
    assert_eq!(&payload[..2], &[0x01, 0x02]);
    assert!(payload[2..].iter().all(|&b| b == 0));
}

#[test]
fn test_isolation_until_commit() {
    init_logging();
    let dir = tempdir().unwrap();
    let pack = small_creator().create(dir.path().join("iso.pack")).unwrap();
    let mut writer = pack.mutate().unwrap();
    let address = writer.allocate(8).unwrap();
    writer.write(address, &[7u8; 8]).unwrap();
    // Not committed: other mutators cannot see the reserved address.
    let reader = pack.mutate().unwrap();
    assert!(matches!(
        reader.read(address),
        Err(PackError::FreedAddress { .. })
    ));
    drop(reader);
    writer.commit().unwrap();
    let reader = pack.mutate().unwrap();
    assert_eq!(reader.read(address).unwrap(), vec![7u8; 8]);
    // A staged rewrite stays private until its own commit.
    let mut rewriter = pack.mutate().unwrap();
    rewriter.write(address, &[9u8; 8]).unwrap();
    assert_eq!(reader.read(address).unwrap(), vec![7u8; 8]);
    assert_eq!(rewriter.read(address).unwrap(), vec![9u8; 8]);
    rewriter.commit().unwrap();
    assert_eq!(reader.read(address).unwrap(), vec![9u8; 8]);
}

#[test]
fn test_concurrent_commits_read_back() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("s2.pack");
    let pack = small_creator().create(&path).unwrap();
    let mut all: Vec<(u64, Vec<u8>)> = Vec::new();
    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for t in 0..2u8 {
            let pack = &pack;
            handles.push(scope.spawn(move || {
                let mut out = Vec::new();
                let mut mutator = pack.mutate().unwrap();
                for i in 0..100u32 {
                    let address = mutator.allocate(32).unwrap();
                    let mut payload = vec![t; 32];
                    payload[..4].copy_from_slice(&i.to_le_bytes());
                    mutator.write(address, &payload).unwrap();
                    out.push((address, payload));
                }
                mutator.commit().unwrap();
                out
            }));
        }
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
    });
    assert_eq!(all.len(), 200);
    let distinct: BTreeSet<u64> = all.iter().map(|&(a, _)| a).collect();
    assert_eq!(distinct.len(), 200);
    let reader = pack.mutate().unwrap();
    for (address, payload) in &all {
        assert_eq!(&reader.read(*address).unwrap(), payload);
    }
    drop(reader);
    pack.close().unwrap();
    // Property 3: the last written value survives close and reopen.
    let opened = Opener::open(&path).unwrap();
    let reader = opened.pack.mutate().unwrap();
    for (address, payload) in &all {
        assert_eq!(&reader.read(*address).unwrap(), payload);
    }
}

#[test]
fn test_free_then_reallocate() {
    init_logging();
    let dir = tempdir().unwrap();
    let pack = small_creator().create(dir.path().join("s3.pack")).unwrap();
    let mut mutator = pack.mutate().unwrap();
    let a = mutator.allocate(16).unwrap();
    mutator.write(a, &[1; 16]).unwrap();
    mutator.commit().unwrap();
    let mut mutator = pack.mutate().unwrap();
    mutator.free(a).unwrap();
    mutator.commit().unwrap();
    // The free's journal is fully played and forced: the slot may recycle.
    let mut mutator = pack.mutate().unwrap();
    let b = mutator.allocate(16).unwrap();
    mutator.write(b, &[2; 16]).unwrap();
    mutator.commit().unwrap();
    let reader = pack.mutate().unwrap();
    assert_eq!(reader.read(b).unwrap(), vec![2; 16]);
    if b != a {
        assert!(matches!(
            reader.read(a),
            Err(PackError::FreedAddress { .. })
        ));
    }
}

#[test]
fn test_free_reallocate_race_never_loses_reallocation() {
    init_logging();
    let dir = tempdir().unwrap();
    let pack = small_creator().create(dir.path().join("race.pack")).unwrap();
    let barrier = std::sync::Barrier::new(2);
    // A freeing commit zeroes the slot mid-playback, well before it
    // releases its address latches; a reallocator that grabs the slot in
    // that window must not have its write overwritten by the free. Repeat
    // the race so some rounds land inside the window.
    for round in 0..64u8 {
        let mut setup = pack.mutate().unwrap();
        let a = setup.allocate(16).unwrap();
        setup.write(a, &[0xAA; 16]).unwrap();
        setup.commit().unwrap();
        let payload = [round + 1; 16];
        std::thread::scope(|scope| {
            let freer = {
                let pack = &pack;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    let mut mutator = pack.mutate().unwrap();
                    mutator.free(a).unwrap();
                    mutator.commit().unwrap();
                })
            };
            let reallocator = {
                let pack = &pack;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    // The slot becomes the lowest free one the instant the
                    // free's playback zeroes it; spin until we win it.
                    for _ in 0..10_000 {
                        let mut mutator = pack.mutate().unwrap();
                        let got = mutator.allocate(16).unwrap();
                        if got == a {
                            mutator.write(got, &payload).unwrap();
                            mutator.commit().unwrap();
                            return;
                        }
                        mutator.rollback().unwrap();
                        std::thread::yield_now();
                    }
                    panic!("reallocator never won address {a}");
                })
            };
            freer.join().unwrap();
            reallocator.join().unwrap();
        });
        let reader = pack.mutate().unwrap();
        assert_eq!(
            reader.read(a).unwrap(),
            payload.to_vec(),
            "free playback overwrote the reallocation of {a} in round {round}"
        );
    }
}

#[test]
fn test_temporary_blocks_surface_on_reopen() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("s4.pack");
    let temporary = {
        let pack = small_creator().create(&path).unwrap();
        let mut mutator = pack.mutate().unwrap();
        let keep = mutator.allocate(8).unwrap();
        let temporary = mutator.allocate(8).unwrap();
        mutator.set_temporary(temporary).unwrap();
        mutator.commit().unwrap();
        assert_eq!(pack.temporaries(), BTreeSet::from([temporary]));
        assert_ne!(keep, temporary);
        pack.close().unwrap();
        temporary
    };
    let opened = Opener::open(&path).unwrap();
    assert_eq!(opened.temporaries, BTreeSet::from([temporary]));
    // Freeing the block unlatches the reference.
    let mut mutator = opened.pack.mutate().unwrap();
    mutator.free(temporary).unwrap();
    mutator.commit().unwrap();
    assert!(opened.pack.temporaries().is_empty());
}

#[test]
fn test_address_region_growth() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("s5.pack");
    let mut written = Vec::new();
    {
        let pack = small_creator().create(&path).unwrap();
        let base = pack.inner.boundary.position();
        // One address page holds 128 slots; 300 allocations force the
        // address region to grow twice.
        for chunk in 0..3u32 {
            let mut mutator = pack.mutate().unwrap();
            for i in 0..100u32 {
                let address = mutator.allocate(900).unwrap();
                let mut payload = vec![0u8; 900];
                payload[..4].copy_from_slice(&(chunk * 100 + i).to_le_bytes());
                mutator.write(address, &payload).unwrap();
                written.push((address, payload));
            }
            mutator.commit().unwrap();
        }
        assert_eq!(
            pack.inner.boundary.position(),
            base + 2 * pack.page_size()
        );
        let reader = pack.mutate().unwrap();
        for (address, payload) in &written {
            assert_eq!(&reader.read(*address).unwrap(), payload);
        }
        drop(reader);
        pack.close().unwrap();
    }
    let opened = Opener::open(&path).unwrap();
    let reader = opened.pack.mutate().unwrap();
    for (address, payload) in &written {
        assert_eq!(&reader.read(*address).unwrap(), payload);
    }
}

#[test]
fn test_vacuum_compacts_and_preserves_content() {
    init_logging();
    let dir = tempdir().unwrap();
    let pack = small_creator().create(dir.path().join("s6.pack")).unwrap();
    // Five small blocks commit onto one user page.
    let mut mutator = pack.mutate().unwrap();
    let addresses: Vec<u64> = (0..5).map(|_| mutator.allocate(32).unwrap()).collect();
    for (i, &address) in addresses.iter().enumerate() {
        mutator.write(address, &[i as u8 + 1; 32]).unwrap();
    }
    mutator.commit().unwrap();
    let pages: BTreeSet<u64> = addresses
        .iter()
        .map(|&a| pack.inner.boundary.dereference(a).unwrap().position())
        .collect();
    assert_eq!(pages.len(), 1, "five 32-byte blocks share one page");
    let page = *pages.first().unwrap();
    // Free the second and fourth: two gaps interleaved with live blocks.
    let mut mutator = pack.mutate().unwrap();
    mutator.free(addresses[1]).unwrap();
    mutator.free(addresses[3]).unwrap();
    mutator.commit().unwrap();
    let before = crate::page::BlockPage::new(
        pack.inner.sheaf.get(page, crate::sheaf::PageKind::Block).unwrap(),
    );
    assert_eq!(before.block_count(), 5);
    pack.vacuum().unwrap();
    // Compacted: three contiguous live blocks, nothing mirrored, payloads
    // intact.
    let after = crate::page::BlockPage::new(
        pack.inner.sheaf.get(page, crate::sheaf::PageKind::Block).unwrap(),
    );
    assert_eq!(after.block_count(), 3);
    assert!(!after.raw().is_mirrored());
    let reader = pack.mutate().unwrap();
    for (i, &address) in addresses.iter().enumerate() {
        if i == 1 || i == 3 {
            assert!(reader.read(address).is_err());
        } else {
            assert_eq!(reader.read(address).unwrap(), vec![i as u8 + 1; 32]);
        }
    }
    // Writes against the compacted page still land.
    drop(reader);
    let mut mutator = pack.mutate().unwrap();
    mutator.write(addresses[4], &[0xEE; 32]).unwrap();
    mutator.commit().unwrap();
    let reader = pack.mutate().unwrap();
    assert_eq!(reader.read(addresses[4]).unwrap(), vec![0xEE; 32]);
}

#[test]
fn test_vacuum_under_concurrent_writes() {
    init_logging();
    let dir = tempdir().unwrap();
    let pack = small_creator().create(dir.path().join("vc.pack")).unwrap();
    let mut mutator = pack.mutate().unwrap();
    let addresses: Vec<u64> = (0..8).map(|_| mutator.allocate(48).unwrap()).collect();
    for &address in &addresses {
        mutator.write(address, &[1; 48]).unwrap();
    }
    mutator.commit().unwrap();
    let mut mutator = pack.mutate().unwrap();
    mutator.free(addresses[0]).unwrap();
    mutator.free(addresses[2]).unwrap();
    mutator.commit().unwrap();
    std::thread::scope(|scope| {
        let writer = {
            let pack = &pack;
            let addresses = &addresses;
            scope.spawn(move || {
                for round in 0..20u8 {
                    let mut mutator = pack.mutate().unwrap();
                    for &address in &addresses[4..] {
                        mutator.write(address, &[round; 48]).unwrap();
                    }
                    mutator.commit().unwrap();
                }
            })
        };
        for _ in 0..5 {
            pack.vacuum().unwrap();
        }
        writer.join().unwrap();
    });
    let reader = pack.mutate().unwrap();
    for &address in &addresses[4..] {
        assert_eq!(reader.read(address).unwrap(), vec![19; 48]);
    }
    assert_eq!(reader.read(addresses[1]).unwrap(), vec![1; 48]);
}

#[test]
fn test_rollback_releases_reservations() {
    init_logging();
    let dir = tempdir().unwrap();
    let pack = small_creator().create(dir.path().join("rb.pack")).unwrap();
    let mut mutator = pack.mutate().unwrap();
    let a = mutator.allocate(16).unwrap();
    mutator.write(a, &[5; 16]).unwrap();
    mutator.rollback().unwrap();
    let reader = pack.mutate().unwrap();
    assert!(matches!(
        reader.read(a),
        Err(PackError::FreedAddress { .. })
    ));
    drop(reader);
    // The reserved slot is free again: the next allocation reuses it.
    let mut mutator = pack.mutate().unwrap();
    assert_eq!(mutator.allocate(16).unwrap(), a);
    mutator.rollback().unwrap();
    // A terminal mutator rejects further work until cleared.
    assert!(mutator.allocate(16).is_err());
    mutator.clear().unwrap();
    let b = mutator.allocate(16).unwrap();
    mutator.write(b, &[6; 16]).unwrap();
    mutator.commit().unwrap();
}

#[test]
fn test_own_allocation_freed_in_place() {
    init_logging();
    let dir = tempdir().unwrap();
    let pack = small_creator().create(dir.path().join("own.pack")).unwrap();
    let mut mutator = pack.mutate().unwrap();
    let a = mutator.allocate(16).unwrap();
    let b = mutator.allocate(16).unwrap();
    mutator.write(b, &[3; 16]).unwrap();
    mutator.free(a).unwrap();
    mutator.commit().unwrap();
    let reader = pack.mutate().unwrap();
    assert!(reader.read(a).is_err());
    assert_eq!(reader.read(b).unwrap(), vec![3; 16]);
}

#[test]
fn test_static_blocks() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("static.pack");
    let mut creator = small_creator();
    creator
        .static_blocks
        .insert("pack://catalog".to_string(), 128);
    creator
        .static_blocks
        .insert("pack://schema".to_string(), 64);
    let pack = creator.create(&path).unwrap();
    let statics = pack.static_blocks();
    assert_eq!(statics.len(), 2);
    let catalog = statics["pack://catalog"];
    let mut mutator = pack.mutate().unwrap();
    mutator.write(catalog, b"first revision").unwrap();
    mutator.commit().unwrap();
    // Static blocks are writable but never freeable.
    let mut mutator = pack.mutate().unwrap();
    assert!(matches!(
        mutator.free(catalog),
        Err(PackError::FreedStaticAddress { .. })
    ));
    drop(mutator);
    pack.close().unwrap();
    let opened = Opener::open(&path).unwrap();
    assert_eq!(opened.pack.static_blocks(), statics);
    let reader = opened.pack.mutate().unwrap();
    assert_eq!(
        &reader.read(catalog).unwrap()[..14],
        b"first revision"
    );
}

#[test]
fn test_contract_errors() {
    init_logging();
    let dir = tempdir().unwrap();
    let pack = small_creator().create(dir.path().join("err.pack")).unwrap();
    let mut mutator = pack.mutate().unwrap();
    // Past the page body.
    assert!(matches!(
        mutator.allocate(1024),
        Err(PackError::Overflow { .. })
    ));
    let a = mutator.allocate(16).unwrap();
    assert!(matches!(
        mutator.write(a, &[0; 17]),
        Err(PackError::Overflow { size: 17, capacity: 16 })
    ));
    mutator.commit().unwrap();
    // Writing a committed block past its fixed size overflows too.
    let mut mutator = pack.mutate().unwrap();
    assert!(matches!(
        mutator.write(a, &[0; 17]),
        Err(PackError::Overflow { .. })
    ));
    mutator.rollback().unwrap();
}

#[test]
fn test_open_rejects_foreign_and_hard_files() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.pack");
    std::fs::write(&path, vec![b'x'; 256]).unwrap();
    assert!(matches!(Opener::open(&path), Err(PackError::Signature)));
    let path = dir.path().join("short.pack");
    std::fs::write(&path, b"tiny").unwrap();
    assert!(matches!(Opener::open(&path), Err(PackError::FileSize { .. })));
    let path = dir.path().join("hard.pack");
    {
        let pack = small_creator().create(&path).unwrap();
        let mut mutator = pack.mutate().unwrap();
        let a = mutator.allocate(8).unwrap();
        mutator.write(a, &[1; 8]).unwrap();
        mutator.commit().unwrap();
        pack.close().unwrap();
    }
    // Simulate a crash: the in-use stamp on an otherwise quiescent file.
    {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        file.write_all_at(&HARD_SHUTDOWN.to_le_bytes(), 8).unwrap();
    }
    assert!(matches!(Opener::open(&path), Err(PackError::Shutdown)));
    Medic::recover(&path).unwrap();
    let opened = Opener::open(&path).unwrap();
    let reader = opened.pack.mutate().unwrap();
    // The block written before the "crash" is still there.
    let statics = opened.pack.static_blocks();
    assert!(statics.is_empty());
    drop(reader);
}

#[test]
fn test_recovery_replays_persisted_journals_idempotently() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("recover.pack");
    let (a, b) = {
        let pack = small_creator().create(&path).unwrap();
        let mut mutator = pack.mutate().unwrap();
        let a = mutator.allocate(16).unwrap();
        let b = mutator.allocate(16).unwrap();
        mutator.write(a, &[0xAA; 16]).unwrap();
        mutator.write(b, &[0xBB; 16]).unwrap();
        mutator.commit().unwrap();
        pack.close().unwrap();
        (a, b)
    };
    // Craft a crash image: stamp HARD and persist two identical journals
    // freeing `a`, as if the crash struck after the fsync of both header
    // slots but before playback.
    {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.write_all_at(&HARD_SHUTDOWN.to_le_bytes(), 8).unwrap();
        let len = file.metadata().unwrap().len();
        let journal_page = crate::common::align_up(len, 1024);
        let mut bytes = [0u8; 32];
        let mut at = JournalRecord::Free { address: a }.encode(&mut bytes);
        at += JournalRecord::Commit.encode(&mut bytes[at..]);
        at += JournalRecord::Terminate.encode(&mut bytes[at..]);
        file.write_all_at(&bytes[..at], journal_page).unwrap();
        file.write_all_at(&journal_page.to_le_bytes(), JOURNAL_SLOTS_OFFSET)
            .unwrap();
        file.write_all_at(&journal_page.to_le_bytes(), JOURNAL_SLOTS_OFFSET + 8)
            .unwrap();
        file.sync_data().unwrap();
    }
    // Replaying the same free twice is observationally a single free.
    Medic::recover(&path).unwrap();
    let opened = Opener::open(&path).unwrap();
    let reader = opened.pack.mutate().unwrap();
    assert!(matches!(
        reader.read(a),
        Err(PackError::FreedAddress { .. })
    ));
    assert_eq!(reader.read(b).unwrap(), vec![0xBB; 16]);
}

#[test]
fn test_block_page_accounting_invariant() {
    init_logging();
    let dir = tempdir().unwrap();
    let pack = small_creator().create(dir.path().join("inv.pack")).unwrap();
    let mut mutator = pack.mutate().unwrap();
    let addresses: Vec<u64> = [16u64, 100, 250, 32]
        .iter()
        .map(|&n| mutator.allocate(n).unwrap())
        .collect();
    mutator.commit().unwrap();
    let mut seen = BTreeSet::new();
    for &address in &addresses {
        let raw = pack.inner.boundary.dereference(address).unwrap();
        if !seen.insert(raw.position()) {
            continue;
        }
        let page = crate::page::BlockPage::new(raw);
        // Invariant 2: strides plus header plus remaining cover the page.
        let used: u32 = page.entries().unwrap().iter().map(|e| e.stride).sum();
        assert_eq!(
            used + 8 + page.remaining().unwrap(),
            pack.page_size() as u32
        );
        // Invariant 1: every live block's back reference dereferences to
        // this very page.
        for entry in page.entries().unwrap() {
            assert_eq!(
                pack.inner.boundary.dereference(entry.back).unwrap().position(),
                page.position()
            );
        }
    }
}

#[test]
fn test_vacuum_releases_fully_freed_page() {
    init_logging();
    let dir = tempdir().unwrap();
    let pack = small_creator().create(dir.path().join("empty.pack")).unwrap();
    let mut mutator = pack.mutate().unwrap();
    let addresses: Vec<u64> = (0..4).map(|_| mutator.allocate(64).unwrap()).collect();
    mutator.commit().unwrap();
    let page = pack.inner.boundary.dereference(addresses[0]).unwrap().position();
    let mut mutator = pack.mutate().unwrap();
    for &address in &addresses {
        mutator.free(address).unwrap();
    }
    mutator.commit().unwrap();
    pack.vacuum().unwrap();
    // The emptied page returned to the pool as a durable hole.
    assert!(pack.inner.interim.remove(page));
    pack.inner.interim.seed([page]);
    let mut mutator = pack.mutate().unwrap();
    let fresh = mutator.allocate(64).unwrap();
    mutator.write(fresh, &[0x42; 64]).unwrap();
    mutator.commit().unwrap();
    let reader = pack.mutate().unwrap();
    assert_eq!(reader.read(fresh).unwrap(), vec![0x42; 64]);
    // Freed addresses stay dead unless the slot was recycled by `fresh`.
    for &address in addresses.iter().filter(|&&a| a != fresh) {
        assert!(matches!(
            reader.read(address),
            Err(PackError::FreedAddress { .. })
        ));
    }
}

#[test]
fn test_multi_page_journal_commit() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("big.pack");
    let pack = small_creator().create(&path).unwrap();
    // Enough operations that the journal must chain across pages.
    let mut mutator = pack.mutate().unwrap();
    let mut written = Vec::new();
    for i in 0..150u32 {
        let address = mutator.allocate(24).unwrap();
        let mut payload = vec![0u8; 24];
        payload[..4].copy_from_slice(&i.to_le_bytes());
        mutator.write(address, &payload).unwrap();
        written.push((address, payload));
    }
    mutator.commit().unwrap();
    let reader = pack.mutate().unwrap();
    for (address, payload) in &written {
        assert_eq!(&reader.read(*address).unwrap(), payload);
    }
    drop(reader);
    pack.close().unwrap();
    let opened = Opener::open(&path).unwrap();
    let reader = opened.pack.mutate().unwrap();
    for (address, payload) in &written {
        assert_eq!(&reader.read(*address).unwrap(), payload);
    }
}

#[test]
fn test_repeated_open_close_cycles() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("cycles.pack");
    let mut survivors: Vec<(u64, u8)> = Vec::new();
    {
        let pack = small_creator().create(&path).unwrap();
        let mut mutator = pack.mutate().unwrap();
        for i in 0..10u8 {
            let address = mutator.allocate(16).unwrap();
            mutator.write(address, &[i; 16]).unwrap();
            survivors.push((address, i));
        }
        mutator.commit().unwrap();
        pack.close().unwrap();
    }
    for round in 0..4u8 {
        let opened = Opener::open(&path).unwrap();
        let mut mutator = opened.pack.mutate().unwrap();
        for &(address, tag) in &survivors {
            assert_eq!(mutator.read(address).unwrap(), vec![tag; 16]);
        }
        // Drop one block, add one block, every round.
        let (gone, _) = survivors.remove(round as usize);
        mutator.free(gone).unwrap();
        let address = mutator.allocate(16).unwrap();
        let tag = 100 + round;
        mutator.write(address, &[tag; 16]).unwrap();
        survivors.push((address, tag));
        mutator.commit().unwrap();
        opened.pack.close().unwrap();
    }
    let opened = Opener::open(&path).unwrap();
    let reader = opened.pack.mutate().unwrap();
    for &(address, tag) in &survivors {
        assert_eq!(reader.read(address).unwrap(), vec![tag; 16]);
    }
}

#[test]
fn test_commit_then_clear_reuses_mutator() {
    init_logging();
    let dir = tempdir().unwrap();
    let pack = small_creator().create(dir.path().join("cl.pack")).unwrap();
    let mut mutator = pack.mutate().unwrap();
    let a = mutator.allocate(16).unwrap();
    mutator.write(a, &[1; 16]).unwrap();
    mutator.commit().unwrap();
    mutator.clear().unwrap();
    let b = mutator.allocate(16).unwrap();
    mutator.write(b, &[2; 16]).unwrap();
    // The first commit's block reads back through the re-armed mutator.
    assert_eq!(mutator.read(a).unwrap(), vec![1; 16]);
    mutator.commit().unwrap();
    let reader = pack.mutate().unwrap();
    assert_eq!(reader.read(a).unwrap(), vec![1; 16]);
    assert_eq!(reader.read(b).unwrap(), vec![2; 16]);
}

#[test]
fn test_read_of_never_allocated_address() {
    init_logging();
    let dir = tempdir().unwrap();
    let pack = small_creator().create(dir.path().join("na.pack")).unwrap();
    let reader = pack.mutate().unwrap();
    // A slot position inside the first address page that nothing reserved.
    let bogus = pack.inner.boundary.position() - pack.page_size() + 8 * 100;
    assert!(matches!(
        reader.read(bogus),
        Err(PackError::FreedAddress { .. })
    ));
}

#[test]
fn test_read_into_and_geometry_accessors() {
    init_logging();
    let dir = tempdir().unwrap();
    let pack = small_creator().create(dir.path().join("geo.pack")).unwrap();
    assert_eq!(pack.page_size(), 1024);
    assert_eq!(pack.alignment(), 64);
    assert_eq!(pack.maximum_block_size(), 1024 - 8 - 12);
    let mut mutator = pack.mutate().unwrap();
    let a = mutator.allocate(16).unwrap();
    mutator.write(a, &[9; 16]).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(mutator.read_into(a, &mut buf).unwrap(), 4);
    assert_eq!(buf, [9; 4]);
    mutator.commit().unwrap();
}
