pub mod adapter;
pub mod docdb_adapter;
pub mod error;
pub mod factory;
pub mod fs_store;
pub mod redis_adapter;
pub mod retry;
pub mod sqlite_adapter;

pub use adapter::WorkItemAdapter;
pub use docdb_adapter::DocDbAdapter;
pub use error::AdapterError;
pub use factory::create_adapter;
pub use fs_store::FsBlobStore;
pub use redis_adapter::RedisAdapter;
pub use retry::{with_retry, RetryPolicy};
pub use sqlite_adapter::SqliteAdapter;
