//! Demand-based flash translation layer for a key-value SSD.
//!
//! The device exposes store/retrieve/delete over variable-length keys and
//! runs a log-structured flash with sub-page ("grain") allocation behind
//! them: keys hash to logical page addresses, translation pages are cached
//! on demand with LRU write-back, and a garbage collector reclaims grains
//! under a credit-based admission gate.
//!
//! ```
//! use kvssd_ftl::{FtlConfig, KvDevice};
//! use kvssd_types::Geometry;
//!
//! let cfg = FtlConfig {
//!     geometry: Geometry::new(2, 2, 16, 8, 4).unwrap(),
//!     max_cached_tpages: 4,
//!     wb_flush_size: 4,
//!     gc_thres_lines: 2,
//!     store_key_fp: true,
//!     inv_mapping_log: false,
//! };
//! let mut dev = KvDevice::new(cfg).unwrap();
//! dev.store(b"key", b"valu").unwrap();
//! assert_eq!(dev.retrieve(b"key").unwrap().value.unwrap(), b"valu");
//! ```

mod cache;
mod config;
mod device;
mod error;
mod gc;
mod hash;
mod invlog;
mod lines;
mod oob;
mod partition;
mod shard;
mod stats;
mod wb;

pub use cache::{Cmt, CmtState, PtEntry, NO_TPAGE};
pub use config::{ConfigError, FtlConfig};
pub use device::{KvDevice, Reply, ValueSource};
pub use error::{KvError, Result, KV_ERR_KEY_NOT_EXIST};
pub use hash::HashMeta;
pub use lines::{IoStream, Line, LineManager, LineState};
pub use partition::{BlockManager, GcTarget, Partition, PartitionError, PartitionedBlockManager};
pub use shard::{DemandShard, Jump, PageState};
pub use stats::{Rw, Stats, MAX_HASH_COLLISION};
