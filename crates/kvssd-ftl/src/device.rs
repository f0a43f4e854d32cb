use kvssd_media::{FixedLatency, FlashMedia, MemMedia, NandTiming};
use kvssd_types::Key;

use crate::config::{ConfigError, FtlConfig};
use crate::error::{KvError, Result};
use crate::shard::DemandShard;
use crate::stats::Stats;

/// Where a retrieve was served from. The command layer uses this to pick
/// an inline host-memory copy over a disk copy for pairs that have not
/// reached flash yet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValueSource {
    WriteBuffer,
    Flash,
}

/// Completion of one KV command.
#[derive(Debug)]
pub struct Reply {
    /// Completion timestamp in simulated nanoseconds.
    pub nsecs: u64,
    /// Retrieved value; `None` for store and delete.
    pub value: Option<Vec<u8>>,
    pub source: ValueSource,
}

/// The KV device frontend: validates command arguments and hands them to
/// the shard.
pub struct KvDevice {
    shard: DemandShard,
}

impl KvDevice {
    /// Device over an in-memory flash image and the fixed-latency timing
    /// model.
    pub fn new(cfg: FtlConfig) -> std::result::Result<Self, ConfigError> {
        let geom = cfg.geometry;
        let media = Box::new(MemMedia::new(geom.flash_bytes()));
        let nand = Box::new(FixedLatency::new(geom.nchs, geom.luns_per_ch));
        Self::with_parts(cfg, media, nand)
    }

    /// Device over caller-supplied media and timing implementations.
    pub fn with_parts(
        cfg: FtlConfig,
        media: Box<dyn FlashMedia>,
        nand: Box<dyn NandTiming>,
    ) -> std::result::Result<Self, ConfigError> {
        Ok(KvDevice {
            shard: DemandShard::new(cfg, media, nand)?,
        })
    }

    pub fn store(&mut self, key: &[u8], value: &[u8]) -> Result<Reply> {
        let key = Key::new(key).ok_or(KvError::KeyTooLong)?;
        self.shard.store(key, value)
    }

    pub fn retrieve(&mut self, key: &[u8]) -> Result<Reply> {
        let key = Key::new(key).ok_or(KvError::KeyTooLong)?;
        self.shard.retrieve(key)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<Reply> {
        let key = Key::new(key).ok_or(KvError::KeyTooLong)?;
        self.shard.delete(key)
    }

    /// Wait for in-flight device traffic; returns the idle timestamp.
    pub fn flush(&mut self) -> u64 {
        self.shard.flush()
    }

    pub fn stats(&self) -> &Stats {
        self.shard.stats()
    }

    /// Direct access to the shard, for inspection and tests.
    pub fn shard(&self) -> &DemandShard {
        &self.shard
    }

    pub fn shard_mut(&mut self) -> &mut DemandShard {
        &mut self.shard
    }
}
