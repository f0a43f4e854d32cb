//! Containers used across the FTL core: an ordered skiplist for the write
//! buffer, an indexed min-priority queue for victim-line selection, and a
//! bulk-loadable max-heap for the block partition manager's GC targets.
//!
//! Plain FIFO and ordered-map needs are covered by `std::collections`
//! (`VecDeque`, `BTreeMap`) and are not duplicated here.

mod bulk_heap;
mod skiplist;
mod victim_queue;

pub use bulk_heap::BulkHeap;
pub use skiplist::SkipList;
pub use victim_queue::VictimQueue;
