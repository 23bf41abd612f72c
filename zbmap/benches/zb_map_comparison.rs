use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rand::{Rng, distr::Alphanumeric};
use std::collections::HashMap;
use std::time::Duration;
use tempfile::tempdir;
use zbmap::{AnonMmap, U64BytesMap, VecStore, ZbMap, ZbMapConfig, ZbMapSerializer};

const MAX_VALUE_LEN: usize = 32;

/// Random u64 keys with short alphanumeric values.
fn generate_data(size: usize) -> Vec<(u64, Vec<u8>)> {
    let mut rng = rand::rng();
    (0..size)
        .map(|_| {
            let key = rng.random::<u64>();
            let val_len = rng.random_range(1..=MAX_VALUE_LEN);
            let value = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(val_len)
                .collect();
            (key, value)
        })
        .collect()
}

fn config() -> ZbMapConfig {
    ZbMapConfig::new()
        .max_value_length(MAX_VALUE_LEN)
        .min_block_count(16)
}

fn filled<BS: zbmap::ByteStore>(data: &[(u64, Vec<u8>)]) -> U64BytesMap<BS> {
    let mut map = ZbMap::new(config()).unwrap();
    for (k, v) in data.iter() {
        map.put(k, v).unwrap();
    }
    map
}

fn benchmark_zb_map_comparisons(c: &mut Criterion) {
    for &size in &[100_000, 1_000_000] {
        let mut group = c.benchmark_group(format!("size={size}"));
        if size >= 1_000_000 {
            // Reduce sample count for large benchmarks
            group.sample_size(10);
            group.measurement_time(Duration::from_secs(30));
        }

        let data = generate_data(size);

        // --- std::collections::HashMap ---
        group.bench_function("std::HashMap - insert", |b| {
            b.iter(|| {
                let mut map = HashMap::new();
                for (k, v) in data.iter() {
                    map.insert(black_box(*k), black_box(v.clone()));
                }
            })
        });

        let std_map: HashMap<u64, Vec<u8>> = data.iter().cloned().collect();
        group.bench_function("std::HashMap - get", |b| {
            b.iter(|| {
                for (k, _) in data.iter() {
                    black_box(std_map.get(black_box(k)));
                }
            })
        });

        // --- ZbMap on the heap ---
        group.bench_function("ZbMap<Vec> - insert", |b| {
            b.iter(|| black_box(filled::<VecStore>(&data)))
        });

        let vec_map = filled::<VecStore>(&data);
        group.bench_function("ZbMap<Vec> - get", |b| {
            b.iter(|| {
                for (k, _) in data.iter() {
                    black_box(vec_map.get(black_box(k)).unwrap());
                }
            })
        });

        // --- ZbMap on anonymous memory maps ---
        group.bench_function("ZbMap<AnonMmap> - insert", |b| {
            b.iter(|| black_box(filled::<AnonMmap>(&data)))
        });

        let mmap_map = filled::<AnonMmap>(&data);
        group.bench_function("ZbMap<AnonMmap> - get", |b| {
            b.iter(|| {
                for (k, _) in data.iter() {
                    black_box(mmap_map.get(black_box(k)).unwrap());
                }
            })
        });

        // --- Snapshot ---
        let mut serializer = ZbMapSerializer::for_config(vec_map.config()).unwrap();
        let mut snapshot = Vec::with_capacity(serializer.serialized_len(&vec_map) as usize);
        group.bench_function("ZbMap<Vec> - snapshot write", |b| {
            b.iter(|| {
                snapshot.clear();
                black_box(serializer.write(&vec_map, &mut snapshot).unwrap());
            })
        });

        // --- Sled DB ---
        group.bench_function("Sled - insert", |b| {
            b.iter_with_setup(
                || tempdir().unwrap(),
                |dir| {
                    let db = sled::open(dir.path()).unwrap();
                    for (k, v) in data.iter() {
                        db.insert(black_box(k.to_le_bytes()), black_box(v.as_slice()))
                            .unwrap();
                    }
                    db.flush().unwrap();
                },
            )
        });

        let sled_dir_get = tempdir().unwrap();
        let sled_db_get = sled::open(sled_dir_get.path()).unwrap();
        for (k, v) in data.iter() {
            sled_db_get.insert(k.to_le_bytes(), v.as_slice()).unwrap();
        }
        sled_db_get.flush().unwrap();
        group.bench_function("Sled - get", |b| {
            b.iter(|| {
                for (k, _) in data.iter() {
                    black_box(sled_db_get.get(black_box(k.to_le_bytes())).unwrap());
                }
            })
        });
    }
}

criterion_group!(benches, benchmark_zb_map_comparisons);
criterion_main!(benches);
