//! Basic usage: create a pack, store a few blocks, reopen and read them.

use std::collections::BTreeMap;

use blockpack::{Creator, Opener};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let dir = std::env::temp_dir().join("blockpack-basic");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("demo.pack");

    let creator = Creator {
        page_size: 4096,
        alignment: 64,
        journal_headers: 8,
        address_pool_minimum: 1,
        static_blocks: BTreeMap::from([("demo://greeting".to_string(), 64)]),
    };
    let pack = creator.create(&path)?;
    let greeting = pack.static_blocks()["demo://greeting"];

    let mut mutator = pack.mutate()?;
    mutator.write(greeting, b"hello, blockpack")?;
    let note = mutator.allocate(128)?;
    mutator.write(note, b"blocks keep their address for life")?;
    mutator.commit()?;
    println!("wrote greeting at {greeting}, note at {note}");
    pack.close()?;

    let opened = Opener::open(&path)?;
    let reader = opened.pack.mutate()?;
    let payload = reader.read(note)?;
    println!(
        "after reopen: {:?}",
        String::from_utf8_lossy(&payload[..34])
    );
    drop(reader);
    opened.pack.close()?;
    std::fs::remove_file(&path)?;
    Ok(())
}
