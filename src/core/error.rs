use thiserror::Error;

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Value parse error: {0}")]
    ValueParse(String),

    #[error("Unknown metric type: {0}")]
    UnknownMetricType(String),

    #[error("Metric name is empty")]
    EmptyName,

    #[error("Metric not found: {0}")]
    NotFound(String),

    #[error("Metric already exists: {0}")]
    AlreadyExists(String),

    #[error("HMAC signature mismatch")]
    BadHmac,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Server responded with status {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("Request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Retry amount exceeded after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<TallyError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout error: operation took longer than {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("GRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Async task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type alias for Tally operations
pub type Result<T> = std::result::Result<T, TallyError>;

impl TallyError {
    /// Creates a new value parse error
    pub fn value_parse<S: Into<String>>(msg: S) -> Self {
        Self::ValueParse(msg.into())
    }

    /// Creates a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates a new crypto error
    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Self::Crypto(msg.into())
    }

    /// Creates a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if the failed operation may succeed when repeated.
    ///
    /// Transport failures and 5xx responses are transient; everything the
    /// peer rejected explicitly (4xx) is not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::ServerError { .. } | Self::Timeout { .. } => true,
            // Refused connections surface as `Unknown` or `Unavailable`
            // depending on the channel state.
            Self::Grpc(status) => matches!(
                status.code(),
                tonic::Code::Unavailable
                    | tonic::Code::Unknown
                    | tonic::Code::DeadlineExceeded
                    | tonic::Code::Internal
            ),
            _ => false,
        }
    }

    /// Returns the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::ValueParse(_) | Self::UnknownMetricType(_) | Self::EmptyName => "validation",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "conflict",
            Self::BadHmac | Self::Forbidden(_) | Self::BadRequest(_) => "auth",
            Self::Transport(_)
            | Self::ServerError { .. }
            | Self::Rejected { .. }
            | Self::RetriesExhausted { .. }
            | Self::Grpc(_) => "network",
            Self::Config(_) => "config",
            Self::Storage(_) | Self::Sqlite(_) => "storage",
            Self::Crypto(_) => "crypto",
            Self::Cancelled => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Join(_) => "async",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status code this error is reported with by the ingest API.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ValueParse(_)
            | Self::UnknownMetricType(_)
            | Self::BadHmac
            | Self::BadRequest(_)
            | Self::Serialization(_) => 400,
            Self::EmptyName | Self::NotFound(_) => 404,
            Self::Forbidden(_) => 403,
            _ => 500,
        }
    }
}

impl From<TallyError> for tonic::Status {
    fn from(err: TallyError) -> Self {
        match err {
            TallyError::NotFound(_) | TallyError::EmptyName => tonic::Status::not_found(err.to_string()),
            TallyError::ValueParse(_)
            | TallyError::UnknownMetricType(_)
            | TallyError::BadHmac
            | TallyError::BadRequest(_) => tonic::Status::invalid_argument(err.to_string()),
            TallyError::Forbidden(_) => tonic::Status::permission_denied(err.to_string()),
            TallyError::Grpc(status) => status,
            _ => tonic::Status::internal("internal server error"),
        }
    }
}
