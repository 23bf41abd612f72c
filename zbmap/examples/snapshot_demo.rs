use tracing_subscriber::EnvFilter;
use zbmap::{AnonMmap, StringU64Map, U64U64Map, ZbMap, ZbMapConfig, ZbMapSerializer};

fn main() -> zbmap::Result<()> {
    // splits, merges and snapshot sizes are logged at debug
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,zbmap=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("=== ZbMap Demo ===\n");

    // Example 1: Growing and shrinking a u64 map
    demo_split_and_merge()?;

    // Example 2: String keys in anonymous memory
    demo_string_keys()?;

    // Example 3: Snapshot to a file and back
    demo_snapshot()?;

    Ok(())
}

fn demo_split_and_merge() -> zbmap::Result<()> {
    println!("1. Split and merge:");
    let config = ZbMapConfig::new().initial_table_size(4).min_block_count(2);
    let mut map: U64U64Map = ZbMap::new(config)?;

    for key in 0..10_000u64 {
        map.put(&key, &(key * key))?;
    }
    println!(
        "   {} records, table size {}, {} buckets, load factor {:.2}",
        map.len(),
        map.table_size(),
        map.bucket_count(),
        map.load_factor()
    );
    assert_eq!(map.get(&99)?, Some(99 * 99));

    for key in 0..9_990u64 {
        map.remove(&key)?;
    }
    println!(
        "   {} records after removal, table size {}",
        map.len(),
        map.table_size()
    );
    for entry in map.iter() {
        let (key, value) = entry?;
        println!("   {key} -> {value}");
    }
    println!();
    Ok(())
}

fn demo_string_keys() -> zbmap::Result<()> {
    println!("2. String keys backed by anonymous memory maps:");
    let config = ZbMapConfig::new().max_key_length(16);
    let mut map: StringU64Map<AnonMmap> = ZbMap::new(config)?;

    for (i, word) in ["zeebe", "broker", "partition", "snapshot"].iter().enumerate() {
        map.put(word, &(i as u64))?;
    }
    map.put("zeebe", &42)?;

    for word in ["zeebe", "partition", "gateway"] {
        println!("   {word}: {:?}", map.get(word)?);
    }
    println!("{}", map.buckets());
    map.close();
    Ok(())
}

fn demo_snapshot() -> zbmap::Result<()> {
    println!("3. Snapshot round trip:");
    let dir = std::env::temp_dir().join("zbmap-demo");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("map.snapshot");

    let config = ZbMapConfig::new().io_buffer_size(512);
    let mut map: U64U64Map = ZbMap::new(config.clone())?;
    for key in 0..1_000u64 {
        map.put(&key, &(key + 1))?;
    }

    let mut serializer = ZbMapSerializer::for_config(&config)?;
    let written = serializer.save(&map, &path)?;
    println!("   wrote {written} bytes to {}", path.display());

    let mut restored: U64U64Map = ZbMap::new(config)?;
    serializer.load(&mut restored, &path)?;
    println!(
        "   restored {} records, key 500 -> {:?}",
        restored.len(),
        restored.get(&500)?
    );

    std::fs::remove_file(&path)?;
    Ok(())
}
