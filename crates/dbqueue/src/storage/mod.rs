//! Queue storage: one [`QueueStore`] per shard

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryQueueStore;
pub use postgres::{schema_sql, PostgresQueueStore};
pub use store::{NewTask, QueueStore, StoreError, StoreTransaction};
