//! Keys that probe to the same LPA must both survive, resolved through the
//! on-disk key check and bounded retry. Fingerprint compare is disabled so
//! every occupied-slot probe goes through the data check, the same shape
//! the no-fingerprint build of the cache takes.

use kvssd_ftl::{FtlConfig, HashMeta, KvDevice, KvError};
use kvssd_types::{Geometry, Key};

fn config() -> FtlConfig {
    FtlConfig {
        geometry: Geometry::new(2, 2, 16, 8, 4).unwrap(),
        max_cached_tpages: 4,
        wb_flush_size: 4,
        gc_thres_lines: 2,
        store_key_fp: false,
        inv_mapping_log: false,
    }
}

/// Brute-force two distinct keys whose first probe lands on the same LPA.
fn colliding_pair(nr_entries: u32) -> (Vec<u8>, Vec<u8>) {
    let mut seen: std::collections::HashMap<u32, Vec<u8>> = std::collections::HashMap::new();
    for i in 0u32.. {
        let key = format!("col{i:05}").into_bytes();
        let meta = HashMeta::new(&Key::new(&key).unwrap());
        let lpa = meta.lpa(nr_entries);
        if let Some(first) = seen.get(&lpa) {
            return (first.clone(), key);
        }
        seen.insert(lpa, key);
    }
    unreachable!()
}

#[test]
fn colliding_keys_both_survive() {
    let mut dev = KvDevice::new(config()).unwrap();
    let nr_entries = dev.shard().config().nr_valid_tentries();
    let (k1, k2) = colliding_pair(nr_entries);
    assert_ne!(k1, k2);

    dev.store(&k1, b"first-of-pair!!!").unwrap();
    // Flush so k1 is on flash before k2's mapping update probes the slot.
    for pad in [b"pad0", b"pad1", b"pad2"] {
        dev.store(pad, b"fill").unwrap();
    }
    dev.store(&k2, b"secondofpair!!!!").unwrap();
    for pad in [b"pad3", b"pad4", b"pad5"] {
        dev.store(pad, b"fill").unwrap();
    }

    // The insert of k2 read k1's record, saw a different key, and moved to
    // the next probe.
    assert!(dev.stats().fp_collision_w >= 1);
    assert!(dev.shard().max_try() >= 1);

    assert_eq!(dev.retrieve(&k1).unwrap().value.unwrap(), b"first-of-pair!!!");
    assert_eq!(dev.retrieve(&k2).unwrap().value.unwrap(), b"secondofpair!!!!");

    // Reading k2 walks through k1's slot first.
    assert!(dev.stats().fp_collision_r >= 1);
    let retries: u64 = dev.stats().r_hash_collision_cnt[1..].iter().sum();
    assert!(retries >= 1, "retried read was not recorded");
    dev.shard().check_invariants();
}

#[test]
fn tombstone_in_probe_chain_does_not_orphan_deeper_keys() {
    let mut dev = KvDevice::new(config()).unwrap();
    let nr_entries = dev.shard().config().nr_valid_tentries();
    let (k1, k2) = colliding_pair(nr_entries);

    // k1 takes the shared slot; k2 probes past it to a deeper one.
    dev.store(&k1, b"shallow-occupant").unwrap();
    for pad in [b"fa05", b"fa15", b"fa25"] {
        dev.store(pad, b"fill").unwrap();
    }
    dev.store(&k2, b"the-deeper-key!!").unwrap();
    for pad in [b"fa35", b"fa45", b"fa55"] {
        dev.store(pad, b"fill").unwrap();
    }

    // Tombstoning the shallow slot must not cut the chain short.
    dev.delete(&k1).unwrap();
    assert!(matches!(
        dev.retrieve(&k1).unwrap_err(),
        KvError::KeyNotExist
    ));
    assert_eq!(
        dev.retrieve(&k2).unwrap().value.unwrap(),
        b"the-deeper-key!!"
    );

    // Without fingerprints the tombstone is unclaimable: a re-store of k1
    // probes past it rather than reusing it, and both keys stay readable.
    dev.store(&k1, b"shallow-again!!!").unwrap();
    for pad in [b"fa65", b"fa75", b"fa85"] {
        dev.store(pad, b"fill").unwrap();
    }
    assert_eq!(
        dev.retrieve(&k1).unwrap().value.unwrap(),
        b"shallow-again!!!"
    );
    assert_eq!(
        dev.retrieve(&k2).unwrap().value.unwrap(),
        b"the-deeper-key!!"
    );

    // And deleting the deeper key converges to not-found for both orders.
    dev.delete(&k2).unwrap();
    assert!(matches!(
        dev.retrieve(&k2).unwrap_err(),
        KvError::KeyNotExist
    ));
    assert!(matches!(dev.delete(&k2).unwrap_err(), KvError::KeyNotExist));
    assert_eq!(
        dev.retrieve(&k1).unwrap().value.unwrap(),
        b"shallow-again!!!"
    );
    dev.shard().check_invariants();
}
