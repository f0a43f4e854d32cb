//! Device-level command semantics: write-buffer hits, flush boundaries,
//! overwrite invalidation, and the store/retrieve/delete round-trip laws.

use kvssd_ftl::{FtlConfig, KvDevice, KvError, ValueSource};
use kvssd_types::{Geometry, GrainAddr, GRAIN_PER_PAGE};

fn config() -> FtlConfig {
    FtlConfig {
        geometry: Geometry::new(2, 2, 16, 8, 4).unwrap(),
        max_cached_tpages: 4,
        wb_flush_size: 4,
        gc_thres_lines: 2,
        store_key_fp: true,
        inv_mapping_log: false,
    }
}

fn device() -> KvDevice {
    KvDevice::new(config()).unwrap()
}

/// Single-grain filler values so four stores pack exactly one page.
fn val(tag: u8) -> Vec<u8> {
    vec![tag; 16]
}

#[test]
fn wb_hit_serves_before_any_page_is_assigned() {
    let mut dev = device();
    dev.store(b"a", &val(0x58)).unwrap();

    let reply = dev.retrieve(b"a").unwrap();
    assert_eq!(reply.source, ValueSource::WriteBuffer);
    assert_eq!(reply.value.unwrap(), val(0x58));
    assert_eq!(dev.stats().wb_hit, 1);

    // Nothing reached flash: no data page written, no grains assigned.
    assert_eq!(dev.stats().data_w, 0);
    assert_eq!(dev.shard().write_buffer_len(), 1);
    assert_eq!(dev.shard().lines().line(0).vgc, 0);
}

#[test]
fn filling_the_buffer_causes_exactly_one_flush() {
    let mut dev = device();
    for (i, key) in [b"k1", b"k2", b"k3", b"k4"].iter().enumerate() {
        dev.store(*key, &val(i as u8)).unwrap();
    }

    // One flush, one fully-occupied user-stream page.
    assert_eq!(dev.stats().data_w, 1);
    assert_eq!(dev.shard().write_buffer_len(), 0);
    for offset in 0..GRAIN_PER_PAGE {
        assert!(dev.shard().grain_valid(GrainAddr::new(0, offset)));
    }
    let cache = dev.shard().cache();
    assert!(cache.nr_cached_tpages() <= cache.max_cached_tpages());

    for (i, key) in [b"k1", b"k2", b"k3", b"k4"].iter().enumerate() {
        let reply = dev.retrieve(*key).unwrap();
        assert_eq!(reply.source, ValueSource::Flash);
        assert_eq!(reply.value.unwrap(), val(i as u8));
    }
    dev.shard().check_invariants();
}

#[test]
fn overwrite_invalidates_the_previous_grains() {
    let mut dev = device();

    dev.store(b"key", &val(1)).unwrap();
    for k in [b"d1", b"d2", b"d3"] {
        dev.store(k, &val(9)).unwrap();
    }
    assert_eq!(dev.shard().lines().line(0).igc, 0);

    dev.store(b"key", &val(2)).unwrap();
    for k in [b"d4", b"d5", b"d6"] {
        dev.store(k, &val(9)).unwrap();
    }

    // The first flush's copy of "key" died with the second flush: one grain
    // of invalidation on the first line, committed before the new mapping.
    assert_eq!(dev.shard().lines().line(0).igc, 1);
    assert_eq!(dev.retrieve(b"key").unwrap().value.unwrap(), val(2));
    dev.shard().check_invariants();
}

#[test]
fn store_then_retrieve_survives_interleaved_traffic() {
    let mut dev = device();
    dev.store(b"anchor", &val(0x77)).unwrap();
    for i in 0..40u8 {
        let key = [b'x', i];
        dev.store(&key, &val(i)).unwrap();
    }
    assert_eq!(dev.retrieve(b"anchor").unwrap().value.unwrap(), val(0x77));
}

#[test]
fn overwrite_law_latest_value_wins() {
    let mut dev = device();
    dev.store(b"k", &val(1)).unwrap();
    for k in [b"f1", b"f2", b"f3"] {
        dev.store(k, &val(0)).unwrap();
    }
    dev.store(b"k", &val(2)).unwrap();

    // Buffered overwrite wins immediately.
    assert_eq!(dev.retrieve(b"k").unwrap().value.unwrap(), val(2));

    // And still wins after it reaches flash.
    for k in [b"f4", b"f5", b"f6"] {
        dev.store(k, &val(0)).unwrap();
    }
    let reply = dev.retrieve(b"k").unwrap();
    assert_eq!(reply.source, ValueSource::Flash);
    assert_eq!(reply.value.unwrap(), val(2));
}

#[test]
fn delete_is_idempotent() {
    let mut dev = device();

    // Deleting a buffered pair removes it outright.
    dev.store(b"gone", &val(5)).unwrap();
    dev.delete(b"gone").unwrap();
    assert!(matches!(
        dev.retrieve(b"gone").unwrap_err(),
        KvError::KeyNotExist
    ));

    // Deleting a flushed pair tombstones its grains.
    dev.store(b"flushed", &val(6)).unwrap();
    for k in [b"p1", b"p2", b"p3"] {
        dev.store(k, &val(0)).unwrap();
    }
    dev.delete(b"flushed").unwrap();
    assert!(matches!(
        dev.retrieve(b"flushed").unwrap_err(),
        KvError::KeyNotExist
    ));
    assert!(matches!(
        dev.delete(b"flushed").unwrap_err(),
        KvError::KeyNotExist
    ));
    dev.shard().check_invariants();
}

#[test]
fn command_argument_validation() {
    let mut dev = device();
    assert!(matches!(
        dev.store(b"this key is far too long", &val(0)),
        Err(KvError::KeyTooLong)
    ));
    assert!(matches!(
        dev.store(b"k", b"odd"),
        Err(KvError::BadValueLength)
    ));
    assert!(matches!(dev.store(b"k", b""), Err(KvError::BadValueLength)));
    assert!(matches!(
        dev.store(b"k", &vec![0u8; 8192]),
        Err(KvError::ValueTooLarge)
    ));
}

#[test]
fn flush_reports_device_idle_time() {
    let mut dev = device();
    for i in 0..8u8 {
        dev.store(&[b'q', i], &val(i)).unwrap();
    }
    let idle = dev.flush();
    assert!(idle > 0);
    // Idle time never goes backwards.
    assert!(dev.flush() >= idle);
}
