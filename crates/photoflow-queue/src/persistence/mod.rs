//! Task persistence layer
//!
//! The `QueueStore` trait defines durable queue storage; `SqliteQueueStore`
//! is the production implementation and `InMemoryQueueStore` backs tests.

mod memory;
mod sqlite;
mod store;

pub use memory::InMemoryQueueStore;
pub use sqlite::SqliteQueueStore;
pub use store::{
    ClearBreakdown, ClearFilter, QueueCounts, QueueStore, StoreError, TaskFailureOutcome,
    TaskFilter, TaskRecord, TaskStatus,
};
