use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use kvssd_ftl::{FtlConfig, KvDevice};
use kvssd_types::Geometry;

fn device() -> KvDevice {
    let cfg = FtlConfig {
        geometry: Geometry::new(4, 2, 64, 32, 4).unwrap(),
        max_cached_tpages: 8,
        wb_flush_size: 16,
        gc_thres_lines: 2,
        store_key_fp: true,
        inv_mapping_log: false,
    };
    KvDevice::new(cfg).unwrap()
}

fn bench_store(c: &mut Criterion) {
    c.bench_function("store_1k_values", |b| {
        b.iter_batched(
            device,
            |mut dev| {
                for i in 0..256u32 {
                    let key = i.to_le_bytes();
                    dev.store(&key, &[0xab; 1000]).unwrap();
                }
                dev
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_retrieve(c: &mut Criterion) {
    c.bench_function("retrieve_hot_set", |b| {
        let mut dev = device();
        for i in 0..256u32 {
            dev.store(&i.to_le_bytes(), &[0xcd; 1000]).unwrap();
        }
        let mut i = 0u32;
        b.iter(|| {
            i = (i + 1) % 256;
            dev.retrieve(&i.to_le_bytes()).unwrap()
        });
    });
}

fn bench_overwrite_churn(c: &mut Criterion) {
    c.bench_function("overwrite_churn_with_gc", |b| {
        b.iter_batched(
            device,
            |mut dev| {
                for round in 0..8u32 {
                    for k in 0..64u32 {
                        let key = k.to_le_bytes();
                        dev.store(&key, &[(round * 64 + k) as u8; 512]).unwrap();
                    }
                }
                dev
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_store, bench_retrieve, bench_overwrite_churn);
criterion_main!(benches);
