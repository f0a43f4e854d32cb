//! Interfaces to the components the FTL core collaborates with but does not
//! own: the flash byte image and the NAND/PCIe timing models. The core only
//! sees the traits; tests and the device frontend plug in the in-memory and
//! fixed-latency implementations from this crate.

mod media;
mod timing;

pub use media::{FlashMedia, MemMedia};
pub use timing::{FixedLatency, NandOp, NandOpKind, NandTiming, PcieLatency};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("access at offset {offset} len {len} out of bounds (capacity {capacity})")]
    OutOfBounds { offset: u64, len: usize, capacity: u64 },
    #[error("offset arithmetic overflow")]
    OffsetOverflow,
}

pub type Result<T> = std::result::Result<T, MediaError>;
