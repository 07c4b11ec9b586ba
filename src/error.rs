use thiserror::Error;

/// Crate-wide result type.
pub type TqdbResult<T> = std::result::Result<T, TqdbError>;

#[derive(Debug, Error)]
pub enum TqdbError {
    // =========
    // Config / startup
    // =========
    #[error("configuration file IO error: {0}")]
    ConfigIo(std::io::Error),

    #[error("failed to parse TOML config: {0}")]
    ConfigToml(#[from] toml::de::Error),

    #[error("missing configuration field: {0}")]
    MissingConfig(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========
    // Wire-protocol framing
    // =========
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    // =========
    // Backend I/O
    // =========
    #[error("backend dial error for {addr}: {source}")]
    BackendDial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend I/O error: {0}")]
    BackendIo(std::io::Error),

    // =========
    // Write-batch engine
    // =========
    #[error("batch manager is closed")]
    ManagerClosed,

    #[error("batch wait timed out after 30s")]
    Timeout,

    #[error("batch request canceled: {0}")]
    Canceled(String),

    #[error("batch execution error: {0}")]
    BatchExec(String),

    // =========
    // Backend pool
    // =========
    #[error("no backend available for shard '{0}'")]
    NoBackendAvailable(String),

    #[error("unknown shard: {0}")]
    UnknownShard(String),

    // =========
    // Metrics
    // =========
    #[error("prometheus registry error: {0}")]
    Prometheus(#[from] prometheus::Error),

    // =========
    // Catch-all
    // =========
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for TqdbError {
    fn from(e: std::io::Error) -> Self {
        TqdbError::BackendIo(e)
    }
}
