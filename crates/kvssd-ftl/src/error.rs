use kvssd_media::MediaError;
use kvssd_types::MAX_KEY_LEN;
use thiserror::Error;

/// NVMe KV status code for a missed retrieve/delete.
pub const KV_ERR_KEY_NOT_EXIST: u16 = 0x310;

#[derive(Debug, Error)]
pub enum KvError {
    /// The retrieve/delete probe sequence exhausted `max_try` without a key
    /// match.
    #[error("key does not exist")]
    KeyNotExist,

    #[error("key must be 1..={MAX_KEY_LEN} bytes")]
    KeyTooLong,

    /// Store values are transferred in 4-byte units.
    #[error("value length must be a non-zero multiple of 4 bytes")]
    BadValueLength,

    /// A pair occupies contiguous grains inside one flash page, which bounds
    /// the record size.
    #[error("encoded pair does not fit in one flash page")]
    ValueTooLarge,

    #[error(transparent)]
    Media(#[from] MediaError),
}

impl KvError {
    /// Wire status for the command layer.
    pub fn status(&self) -> u16 {
        match self {
            KvError::KeyNotExist => KV_ERR_KEY_NOT_EXIST,
            // Everything else surfaces as a generic invalid-field error.
            _ => 0x2,
        }
    }
}

pub type Result<T> = std::result::Result<T, KvError>;
