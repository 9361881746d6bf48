//! Client error types for the Batata config client

/// Error type for config client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request timeout")]
    Timeout,

    #[error("no available server for {path}")]
    NoAvailableServer { path: String },

    #[error("server returned error: code={code}, message={message}")]
    ServerError { code: u16, message: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("config is being modified concurrently: {0}")]
    Conflict(String),

    #[error("server list is empty: {0}")]
    EmptyServerList(String),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    /// Whether the error came from the transport rather than the application layer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Http(_) | ClientError::Timeout | ClientError::NoAvailableServer { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
