//! Concurrent mutators: several threads allocating and committing against
//! one pack, then a vacuum pass after a round of frees.

use std::collections::BTreeMap;
use std::time::Instant;

use blockpack::Creator;

const THREADS: usize = 4;
const BLOCKS_PER_THREAD: usize = 500;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let dir = std::env::temp_dir().join("blockpack-concurrent");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("demo.pack");

    let creator = Creator {
        page_size: 4096,
        alignment: 64,
        journal_headers: 8,
        address_pool_minimum: 1,
        static_blocks: BTreeMap::new(),
    };
    let pack = creator.create(&path)?;

    let started = Instant::now();
    let mut all = Vec::new();
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let pack = &pack;
                scope.spawn(move || {
                    let mut mutator = pack.mutate().unwrap();
                    let mut out = Vec::with_capacity(BLOCKS_PER_THREAD);
                    for i in 0..BLOCKS_PER_THREAD {
                        let address = mutator.allocate(96).unwrap();
                        mutator
                            .write(address, format!("thread {t} block {i}").as_bytes())
                            .unwrap();
                        out.push(address);
                    }
                    mutator.commit().unwrap();
                    out
                })
            })
            .collect();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
    });
    println!(
        "{} blocks committed from {THREADS} threads in {:?}",
        all.len(),
        started.elapsed()
    );

    let mut mutator = pack.mutate()?;
    for address in all.iter().step_by(3) {
        mutator.free(*address)?;
    }
    mutator.commit()?;
    let started = Instant::now();
    pack.vacuum()?;
    println!("vacuum after freeing a third took {:?}", started.elapsed());

    let reader = pack.mutate()?;
    let sample = all[1];
    println!(
        "sample surviving block: {:?}",
        String::from_utf8_lossy(&reader.read(sample)?[..16])
    );
    drop(reader);
    pack.close()?;
    std::fs::remove_file(&path)?;
    Ok(())
}
