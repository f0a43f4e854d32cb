//! Umbrella crate for the KV-SSD demand FTL workspace. Re-exports the
//! member crates so integration tests and downstream tools can reach the
//! whole stack through one dependency.

pub use kvssd_collections as collections;
pub use kvssd_ftl as ftl;
pub use kvssd_media as media;
pub use kvssd_types as types;
