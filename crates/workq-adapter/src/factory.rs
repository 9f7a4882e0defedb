use std::sync::Arc;

use tracing::info;
use workq_config::{AdapterKind, WorkItemsConfig};

use crate::adapter::WorkItemAdapter;
use crate::docdb_adapter::DocDbAdapter;
use crate::error::AdapterError;
use crate::redis_adapter::RedisAdapter;
use crate::sqlite_adapter::SqliteAdapter;

/// Build the backend selected by `config.adapter` and hand it out behind
/// the contract trait. Callers hold the trait object; nothing else in the
/// process knows which backend is live.
pub async fn create_adapter(
    config: &WorkItemsConfig,
) -> Result<Arc<dyn WorkItemAdapter>, AdapterError> {
    info!(adapter = %config.adapter, queue = %config.queue, "creating work-item adapter");
    match config.adapter {
        AdapterKind::Sqlite => Ok(Arc::new(SqliteAdapter::connect(config).await?)),
        AdapterKind::Redis => Ok(Arc::new(RedisAdapter::connect(config).await?)),
        AdapterKind::DocDb => Ok(Arc::new(DocDbAdapter::connect(config).await?)),
    }
}
