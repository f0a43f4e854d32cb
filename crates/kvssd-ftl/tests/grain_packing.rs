//! Flush-pipeline packing: mixed grain lengths are bucketed longest-first
//! into user-stream pages, and unpackable tails are padded with
//! tombstoned, invalidated grains.

use kvssd_ftl::{FtlConfig, KvDevice};
use kvssd_types::{Geometry, GrainAddr, GRAIN_PER_PAGE, GRAIN_SIZE, OOB_TOMBSTONE};

fn device(wb_flush_size: usize) -> KvDevice {
    let cfg = FtlConfig {
        geometry: Geometry::new(2, 2, 16, 8, 4).unwrap(),
        max_cached_tpages: 4,
        wb_flush_size,
        gc_thres_lines: 2,
        store_key_fp: true,
        inv_mapping_log: false,
    };
    KvDevice::new(cfg).unwrap()
}

/// Value sized to occupy exactly `grains` grains next to a 2-byte key.
fn sized_value(grains: usize, tag: u8) -> Vec<u8> {
    // Header is 5 bytes, key 2: leave 8 spare and round to 4.
    let len = grains * GRAIN_SIZE - 16;
    vec![tag; len]
}

#[test]
fn mixed_lengths_pack_tightly() {
    let mut dev = device(3);
    // 2 + 1 + 1 grains fill one page exactly.
    dev.store(b"aa", &sized_value(2, 1)).unwrap();
    dev.store(b"bb", &sized_value(1, 2)).unwrap();
    dev.store(b"cc", &sized_value(1, 3)).unwrap();

    assert_eq!(dev.stats().data_w, 1);
    for offset in 0..GRAIN_PER_PAGE {
        assert!(dev.shard().grain_valid(GrainAddr::new(0, offset)));
    }
    assert_eq!(dev.shard().lines().line(0).igc, 0, "tight page got padding");

    for (key, grains, tag) in [(b"aa", 2, 1u8), (b"bb", 1, 2), (b"cc", 1, 3)] {
        assert_eq!(
            dev.retrieve(key).unwrap().value.unwrap(),
            sized_value(grains, tag)
        );
    }
    dev.shard().check_invariants();
}

#[test]
fn unpackable_tail_is_tombstoned() {
    let mut dev = device(2);
    // Two 3-grain pairs cannot share a 4-grain page: each page carries one
    // pair and a single tombstoned grain.
    dev.store(b"xx", &sized_value(3, 7)).unwrap();
    dev.store(b"yy", &sized_value(3, 8)).unwrap();

    assert_eq!(dev.stats().data_w, 2);
    let shard = dev.shard();
    for page in [0u32, 1] {
        assert_eq!(shard.oob_word(page, 3), OOB_TOMBSTONE);
        assert!(!shard.grain_valid(GrainAddr::new(page, 3)));
        assert_eq!(shard.lines().line(0).igc, 2);
    }

    assert_eq!(dev.retrieve(b"xx").unwrap().value.unwrap(), sized_value(3, 7));
    assert_eq!(dev.retrieve(b"yy").unwrap().value.unwrap(), sized_value(3, 8));
    dev.shard().check_invariants();
}

#[test]
fn multi_grain_overwrite_frees_whole_run() {
    let mut dev = device(2);
    dev.store(b"mg", &sized_value(3, 1)).unwrap();
    dev.store(b"p0", &sized_value(1, 0)).unwrap();

    // Overwrite with a shorter value; the whole 3-grain run must die.
    dev.store(b"mg", &sized_value(1, 2)).unwrap();
    dev.store(b"p1", &sized_value(1, 0)).unwrap();

    let line0 = dev.shard().lines().line(0);
    // First flush: 3-grain run + 1-grain p0 filled page 0. Second flush
    // invalidated the run.
    assert!(line0.igc >= 3);
    assert_eq!(dev.retrieve(b"mg").unwrap().value.unwrap(), sized_value(1, 2));
    assert_eq!(dev.retrieve(b"p0").unwrap().value.unwrap(), sized_value(1, 0));
    dev.shard().check_invariants();
}
