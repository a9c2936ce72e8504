use thiserror::Error;

/// The stable error taxonomy shared by every component. `code()` returns the
/// wire-stable string used in `ResponseEnvelope.error.code` and in metric
/// labels; `message` is the human-readable text carried by [`Error::Display`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("pool is draining")]
    PoolDraining,

    #[error("acquire timed out after {0:?}")]
    AcquireTimeout(std::time::Duration),

    #[error("rpc call timed out")]
    Timeout,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("exchange assertion failed: {0}")]
    Exchange(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    /// A handler threw an error carrying no explicit `code`.
    #[error("handler error: {0}")]
    Handler(String),

    #[error("no handler registered for command {0}")]
    HandlerNotFound(String),

    #[error("client is closing")]
    ClientClosing,

    #[error("request was cancelled")]
    Cancelled,

    /// Escape hatch for handler-supplied errors that already carry their own
    /// stable code (e.g. a domain error raised inside an `RpcServer` handler).
    #[error("{message}")]
    Custom {
        code: String,
        message: String,
        details: Option<serde_json::Value>,
    },
}

impl Error {
    pub fn code(&self) -> &str {
        match self {
            Error::Connection(_) => "CONNECTION_ERROR",
            Error::Channel(_) => "CHANNEL_ERROR",
            Error::PoolDraining => "POOL_DRAINING",
            Error::AcquireTimeout(_) => "ACQUIRE_TIMEOUT",
            Error::Timeout => "TIMEOUT_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Publish(_) => "PUBLISH_ERROR",
            Error::Exchange(_) => "EXCHANGE_ERROR",
            Error::Decode(_) => "DECODE_ERROR",
            Error::Handler(_) => "HANDLER_ERROR",
            Error::HandlerNotFound(_) => "HANDLER_NOT_FOUND",
            Error::ClientClosing => "CLIENT_CLOSING",
            Error::Cancelled => "CANCELLED",
            Error::Custom { code, .. } => code,
        }
    }

    pub fn details(&self) -> Option<&serde_json::Value> {
        match self {
            Error::Custom { details, .. } => details.as_ref(),
            _ => None,
        }
    }

    pub fn custom(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Custom {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        if let Error::Custom { details: d, .. } = &mut self {
            *d = Some(details);
        }
        self
    }
}

impl From<lapin::Error> for Error {
    fn from(e: lapin::Error) -> Self {
        Error::Channel(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
