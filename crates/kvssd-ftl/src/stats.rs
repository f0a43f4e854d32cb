/// Upper bound on the per-count hash-collision histograms. Retries beyond
/// this land in the last bucket.
pub const MAX_HASH_COLLISION: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Rw {
    Read,
    Write,
}

/// Operation counters, mirrored from the device for inspection. All counts
/// are cumulative since device creation.
pub struct Stats {
    /// Retrieves answered straight from the write buffer.
    pub wb_hit: u64,

    pub data_r: u64,
    pub data_w: u64,
    pub trans_r: u64,
    pub trans_w: u64,

    pub d_read_on_read: u64,
    pub d_read_on_write: u64,
    pub t_read_on_read: u64,
    pub t_read_on_write: u64,
    pub t_write_on_read: u64,
    pub t_write_on_write: u64,

    /// Data/translation traffic caused by data-partition GC.
    pub data_r_dgc: u64,
    pub data_w_dgc: u64,
    pub trans_r_dgc: u64,
    pub trans_w_dgc: u64,
    /// Translation traffic caused by map-partition GC.
    pub trans_r_tgc: u64,
    pub trans_w_tgc: u64,

    pub fp_match_r: u64,
    pub fp_match_w: u64,
    pub fp_collision_r: u64,
    pub fp_collision_w: u64,

    pub clean_evict: u64,
    pub dirty_evict: u64,

    /// Invalid-mapping log pages written (non-standard GC mode).
    pub inv_mapping_w: u64,

    pub gc_cycles: u64,
    pub map_gc_cycles: u64,

    /// Probe counts observed at read/write completion, bucketed by number
    /// of retries.
    pub r_hash_collision_cnt: [u64; MAX_HASH_COLLISION],
    pub w_hash_collision_cnt: [u64; MAX_HASH_COLLISION],
}

impl Default for Stats {
    fn default() -> Self {
        Stats {
            wb_hit: 0,
            data_r: 0,
            data_w: 0,
            trans_r: 0,
            trans_w: 0,
            d_read_on_read: 0,
            d_read_on_write: 0,
            t_read_on_read: 0,
            t_read_on_write: 0,
            t_write_on_read: 0,
            t_write_on_write: 0,
            data_r_dgc: 0,
            data_w_dgc: 0,
            trans_r_dgc: 0,
            trans_w_dgc: 0,
            trans_r_tgc: 0,
            trans_w_tgc: 0,
            fp_match_r: 0,
            fp_match_w: 0,
            fp_collision_r: 0,
            fp_collision_w: 0,
            clean_evict: 0,
            dirty_evict: 0,
            inv_mapping_w: 0,
            gc_cycles: 0,
            map_gc_cycles: 0,
            r_hash_collision_cnt: [0; MAX_HASH_COLLISION],
            w_hash_collision_cnt: [0; MAX_HASH_COLLISION],
        }
    }
}

impl Stats {
    pub fn record_hash_collisions(&mut self, cnt: u32, dir: Rw) {
        let bucket = (cnt as usize).min(MAX_HASH_COLLISION - 1);
        match dir {
            Rw::Read => self.r_hash_collision_cnt[bucket] += 1,
            Rw::Write => self.w_hash_collision_cnt[bucket] += 1,
        }
    }
}
