//! Windowed stream-stream joins.

mod bloom;
mod handler;
mod hash_table;
mod nested_loop;
mod page;

pub use bloom::{BloomFilterStats, PageFilter};
pub use handler::{JoinAlgorithm, JoinInput, JoinedRecord, StreamJoinHandler};
pub use hash_table::{HashTableStats, SealedHashTable, StreamJoinHashTable};
pub use nested_loop::NestedLoopPartition;
pub use page::{FixedPage, JoinEntry, PageAllocator, RecordSlot};
