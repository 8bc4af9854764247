use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid shard configuration: {0}")]
    InvalidShardConfig(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection pool timeout: {0}")]
    PoolTimeout(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Cluster is closed")]
    ClusterClosed,

    #[error("Mapping error: {0}")]
    MappingError(String),

    #[error("Parameter error: {0}")]
    ParameterError(String),

    #[error("More than one record found: {0}")]
    AmbiguousResult(String),

    #[error("Shard task panicked: {0}")]
    TaskPanicked(String),

    #[error("Task on shard {shard_id} failed: {source}")]
    ShardTaskFailed {
        shard_id: u32,
        #[source]
        source: Box<DbError>,
    },

    #[error("Batch replace aborted at element {index} (id {id:?}): {source}")]
    BatchReplaceFailed {
        index: usize,
        id: Option<String>,
        #[source]
        source: Box<DbError>,
    },

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Prefixes a mapping error with the field it happened on.
    pub fn in_field(self, field: &str) -> Self {
        match self {
            Self::MappingError(msg) => Self::MappingError(format!("field '{}': {}", field, msg)),
            other => other,
        }
    }

    /// Unwraps fan-out and batch wrappers down to the failure that caused them.
    pub fn root_cause(&self) -> &DbError {
        match self {
            Self::ShardTaskFailed { source, .. } | Self::BatchReplaceFailed { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => Self::ConnectionError(err.to_string()),
            other => Self::QueryError(other.to_string()),
        }
    }
}
