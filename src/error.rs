use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Problems with the process configuration. These are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set.")]
    MissingVar(&'static str),

    #[error("{name} has an invalid value {value:?}: {reason}")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid table name {0:?}, expected letters, digits and underscores.")]
    InvalidTableName(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Could not connect to {url} after {attempts} attempts: {source}")]
    Connection {
        url: String,
        attempts: u32,
        #[source]
        source: diesel::ConnectionError,
    },

    #[error("Database error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize handler: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to enqueue new jobs.")]
    NotEnqueued,

    #[error("No handler registered for kind {kind:?}, expected one of: {known}.")]
    UnknownKind { kind: String, known: String },

    #[error("Worker {0} stopped after a store error.")]
    WorkerAborted(String),

    #[error("Job {0} does not exist.")]
    NotFound(String),
}
