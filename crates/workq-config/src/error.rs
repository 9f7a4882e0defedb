use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVariable(&'static str),

    #[error("invalid value for {variable}: {message}")]
    InvalidValue { variable: &'static str, message: String },

    #[error("unknown adapter selector: {0} (expected sqlite, redis or docdb)")]
    UnknownAdapter(String),
}
