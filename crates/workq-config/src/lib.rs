pub mod error;
mod settings;

pub use error::ConfigError;
pub use settings::{
    AdapterKind, DocDbSettings, RedisSettings, SqliteSettings, WorkItemsConfig,
};
