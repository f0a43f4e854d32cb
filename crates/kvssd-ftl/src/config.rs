use kvssd_types::{Geometry, EPP, GRAIN_PER_PAGE};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("geometry leaves no room for a map partition")]
    NoMapPartition,
    #[error("data partition needs at least {0} lines")]
    DataPartitionTooSmall(u32),
    #[error("translation cache capacity must be at least 1 page")]
    CacheTooSmall,
    #[error("write buffer flush size must be at least 1")]
    WriteBufferTooSmall,
    #[error("hash space too small: need more than 3 translation entries")]
    HashSpaceTooSmall,
}

/// Device-wide FTL tuning. Geometry is fixed for the device lifetime;
/// everything else gates policy.
#[derive(Clone, Copy, Debug)]
pub struct FtlConfig {
    pub geometry: Geometry,

    /// Translation pages the cache may hold resident.
    pub max_cached_tpages: usize,

    /// Write-buffer entries that trigger a flush.
    pub wb_flush_size: usize,

    /// Free-line low-water mark below which foreground GC runs.
    pub gc_thres_lines: u32,

    /// Compare stored fingerprints before issuing a data check. Disabling
    /// this sends every probe of an occupied LPA to the on-disk key
    /// compare.
    pub store_key_fp: bool,

    /// Record `(lpa, ppa)` invalidations to on-flash log pages
    /// (non-standard GC mode).
    pub inv_mapping_log: bool,
}

impl FtlConfig {
    /// Lines reserved for the map partition, derived from the grain count
    /// the way the partition split is sized: one map block per
    /// `pgs_per_blk * EPP` grains, at least one line.
    pub fn map_lines(&self) -> u32 {
        let g = &self.geometry;
        let grains_per_mapblk = u64::from(g.pgs_per_blk) * EPP as u64;
        let wanted = (g.tt_grains() / grains_per_mapblk) as u32;
        wanted.clamp(2, (g.tt_lines() / 2).max(2))
    }

    pub fn data_lines(&self) -> u32 {
        self.geometry.tt_lines() - self.map_lines()
    }

    /// Size of the logical hash space. Half of the data-partition grain
    /// count: small pairs dominate, and over-provisioning the hash space
    /// only inflates the translation table.
    pub fn nr_valid_tentries(&self) -> u32 {
        self.data_lines() * self.geometry.pgs_per_line() * (GRAIN_PER_PAGE as u32 / 2)
    }

    /// Translation pages needed to cover the hash space.
    pub fn nr_valid_tpages(&self) -> u32 {
        self.nr_valid_tentries().div_ceil(EPP as u32)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.geometry;
        if g.tt_lines() < 4 {
            return Err(ConfigError::NoMapPartition);
        }
        // User stream, GC reserve, and the GC low-water mark all need lines.
        let min_data = self.gc_thres_lines + 2;
        if self.data_lines() < min_data {
            return Err(ConfigError::DataPartitionTooSmall(min_data));
        }
        if self.max_cached_tpages == 0 {
            return Err(ConfigError::CacheTooSmall);
        }
        if self.wb_flush_size == 0 {
            return Err(ConfigError::WriteBufferTooSmall);
        }
        if self.nr_valid_tentries() <= 3 {
            return Err(ConfigError::HashSpaceTooSmall);
        }
        Ok(())
    }
}
