use serde::Deserialize;
use serde_json::Value;

/// Failure reported by the chat transport.
///
/// Every transport failure lands in one of four kinds so callers can decide
/// whether the backend was unreachable, answered with an error, or answered
/// with something we could not read.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Unable to reach the server: {message}")]
    Network { message: String },
    #[error("{message}")]
    Server {
        status: u16,
        code: String,
        message: String,
    },
    #[error("Failed to read server response: {message}")]
    Parse { status: u16, message: String },
    #[error("{message}")]
    Unknown { status: u16, message: String },
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn server(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn parse(status: u16, message: impl Into<String>) -> Self {
        Self::Parse {
            status,
            message: message.into(),
        }
    }

    pub fn unknown(status: u16, message: impl Into<String>) -> Self {
        Self::Unknown {
            status,
            message: message.into(),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            return Self::network(err.to_string());
        }
        match err.status() {
            Some(status) => Self::unknown(status.as_u16(), err.to_string()),
            None if err.is_decode() || err.is_body() => Self::network(err.to_string()),
            None => Self::unknown(0, err.to_string()),
        }
    }

    /// Classify a non-success response body.
    ///
    /// Structured bodies (the `{success, error}` envelope or a `{detail}`
    /// object) become `Server`; anything else is `Unknown` with the status.
    pub fn from_response(status: u16, body: &str) -> Self {
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
            if let Some(error) = envelope.error {
                return Self::server(status, error.machine_code(), error.message);
            }
            if let Some(detail) = envelope.detail {
                return match detail {
                    ErrorDetail::Text(message) => Self::server(status, "HTTP_ERROR", message),
                    ErrorDetail::Structured(error) => {
                        Self::server(status, error.machine_code(), error.message)
                    }
                };
            }
        }
        let trimmed = body.trim();
        let message = if trimmed.is_empty() {
            format!("Request failed with status {status}")
        } else {
            truncate(trimmed, 200)
        };
        Self::unknown(status, message)
    }

    /// HTTP-like status; `0` means the server was never reached.
    pub fn status(&self) -> u16 {
        match self {
            Self::Network { .. } => 0,
            Self::Server { status, .. }
            | Self::Parse { status, .. }
            | Self::Unknown { status, .. } => *status,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Network { .. } => "NETWORK_ERROR",
            Self::Server { code, .. } => code,
            Self::Parse { .. } => "PARSE_ERROR",
            Self::Unknown { .. } => "UNKNOWN_ERROR",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Network { message }
            | Self::Server { message, .. }
            | Self::Parse { message, .. }
            | Self::Unknown { message, .. } => message,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Rejection of user input before anything reaches the transport.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message cannot be empty")]
    Empty,
    #[error("Message is too long ({actual} characters, maximum is {max})")]
    TooLong { max: usize, actual: usize },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid session file: {0}")]
    InvalidFormat(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ChatError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ApiErrorBody>,
    #[serde(default)]
    detail: Option<ErrorDetail>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Text(String),
    Structured(ApiErrorBody),
}

/// Error object carried by the API envelope and by stream error records.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default, alias = "error")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
}

impl ApiErrorBody {
    /// Prefer the string `type`, then the backend's `error` tag, then `code`.
    pub fn machine_code(&self) -> String {
        if let Some(kind) = self.kind.as_deref().filter(|k| !k.is_empty()) {
            return kind.to_string();
        }
        if let Some(tag) = self.error_code.as_deref().filter(|k| !k.is_empty()) {
            return tag.to_string();
        }
        match &self.code {
            Some(Value::String(code)) => code.clone(),
            Some(Value::Number(code)) => code.to_string(),
            _ => "SERVER_ERROR".to_string(),
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}
