use http::StatusCode;
use thiserror::Error;

/// Core error type for the relay.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Client sent something that is not a conversation request.
    #[error("malformed message: {0}")]
    MessageFormat(String),

    /// The upstream could not be reached (DNS, connect, reset mid-body).
    #[error("upstream {upstream} unreachable: {reason}")]
    Connection { upstream: String, reason: String },

    #[error("upstream {upstream} answered {status}: {body}")]
    HttpStatus {
        upstream: String,
        status: StatusCode,
        body: String,
    },

    #[error("upstream {upstream} returned an empty body")]
    EmptyBody { upstream: String },

    /// One event line could not be parsed. Never surfaced to clients.
    #[error("undecodable event line: {0}")]
    Decode(String),

    #[error("upstream response timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("an exchange is already in progress")]
    Busy,

    #[error("task submission failed: {message}")]
    Submit {
        message: String,
        detail: Option<serde_json::Value>,
    },

    #[error("text extraction failed: {0}")]
    Ocr(String),

    #[error("credential {env} is not set")]
    MissingCredential { env: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Reason placed into `{error}` frames sent to websocket clients.
    pub fn client_message(&self) -> String {
        match self {
            Self::HttpStatus { status, .. } => {
                format!("upstream request failed with status {}", status.as_u16())
            }
            Self::Connection { .. } => "upstream unreachable".to_string(),
            Self::Io(_) | Self::Other(_) => "internal relay error".to_string(),
            other => other.to_string(),
        }
    }

    /// Short machine-readable kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageFormat(_) => "message_format",
            Self::Connection { .. } => "connection",
            Self::HttpStatus { .. } => "http_status",
            Self::EmptyBody { .. } => "empty_body",
            Self::Decode(_) => "decode",
            Self::Timeout { .. } => "timeout",
            Self::Busy => "busy",
            Self::Submit { .. } => "submit",
            Self::Ocr(_) => "ocr",
            Self::MissingCredential { .. } => "missing_credential",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, RelayError>;
