//! Unified error handling for the looptrace SDK.
//!
//! The SDK distinguishes caller mistakes, auth failures, reachable-but-failing
//! server replies, and transport faults, because each class is handled
//! differently: auth errors and 4xx replies are never retried, transport
//! faults and 5xx replies are. The span pipeline itself never surfaces errors
//! to user code: export failures become a log line, a retry-queue enqueue,
//! and eventually a drop.
//!
//! # Error Classification
//!
//! ```rust
//! use looptrace::error::LoopError;
//!
//! # fn handle(error: LoopError) {
//! if error.is_retryable() {
//!     // transport fault or server 5xx
//! } else if error.is_auth_error() {
//!     // fix credentials, do not retry
//! }
//! # }
//! ```

use thiserror::Error;

/// Main error type for the looptrace SDK.
#[derive(Error, Debug, Clone)]
pub enum LoopError {
    /// Caller mistake at the public surface (missing option, bad argument)
    #[error("Invalid parameter: {message}")]
    InvalidParam { message: String },

    /// Authentication or authorization failure; never retried
    #[error("Auth error ({code}): {message}")]
    AuthError { code: String, message: String },

    /// The server was reachable and replied with a failure
    #[error("Remote service error: http {http_code}, code {err_code}, log id {log_id}: {message}")]
    RemoteService {
        http_code: u16,
        err_code: i64,
        log_id: String,
        message: String,
    },

    /// The server was not reachable (connect, DNS, timeout, body read)
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Propagation header could not be parsed
    #[error("Header parse error: {message}")]
    HeaderParse { message: String },

    /// The operation was canceled by the caller's deadline
    #[error("Operation canceled: {message}")]
    Canceled { message: String },

    /// Public call after the client was closed
    #[error("Client is closed")]
    ClientClosed,

    /// Auth credentials are missing entirely
    #[error("Auth info is required: set an API token or a JWT OAuth triple")]
    AuthInfoRequired,

    /// Unexpected internal failure
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LoopError {
    /// Create an InvalidParam error
    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::InvalidParam {
            message: message.into(),
        }
    }

    /// Create an AuthError
    pub fn auth_error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthError {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a RemoteService error
    pub fn remote_service(
        http_code: u16,
        err_code: i64,
        log_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::RemoteService {
            http_code,
            err_code,
            log_id: log_id.into(),
            message: message.into(),
        }
    }

    /// Create a Transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a HeaderParse error
    pub fn header_parse(message: impl Into<String>) -> Self {
        Self::HeaderParse {
            message: message.into(),
        }
    }

    /// Create a Canceled error
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::Canceled {
            message: message.into(),
        }
    }

    /// Create an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Retry iff the server was unreachable or replied with a 5xx.
    ///
    /// Auth errors and sub-500 replies are caller or configuration problems
    /// and retrying them cannot help.
    pub fn is_retryable(&self) -> bool {
        match self {
            LoopError::Transport { .. } => true,
            LoopError::RemoteService { http_code, .. } => *http_code >= 500,
            _ => false,
        }
    }

    /// Whether this is an authentication/authorization failure
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            LoopError::AuthError { .. } | LoopError::AuthInfoRequired
        )
    }
}

impl From<reqwest::Error> for LoopError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            LoopError::transport(format!("request timed out: {}", error))
        } else {
            LoopError::transport(format!("request failed: {}", error))
        }
    }
}

impl From<serde_json::Error> for LoopError {
    fn from(error: serde_json::Error) -> Self {
        LoopError::internal(format!("JSON serialization failed: {}", error))
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, LoopError>;
