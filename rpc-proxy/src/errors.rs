use http::StatusCode;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for rpc-proxy operations
pub type Result<T, E = RpcProxyError> = std::result::Result<T, E>;

/// Errors that can occur while serving a gateway request.
///
/// Every variant maps to an HTTP status and a JSON error body, see
/// [`RpcProxyError::status`] and [`RpcProxyError::to_body`].
#[derive(Error, Debug)]
pub enum RpcProxyError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Request body must be a JSON object")]
    InvalidRequest,

    #[error("chainId must be a positive integer")]
    InvalidChainId,

    #[error("method must be a non-empty string")]
    InvalidMethod,

    #[error("params must be an array")]
    InvalidParams,

    #[error("requests must be an array")]
    InvalidBatch,

    #[error("Batch size {size} exceeds the maximum of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("Unsupported chain: {0}")]
    UnsupportedChain(u64),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Failed to read request body: {0}")]
    RequestBodyError(String),

    #[error("Invalid CSRF token")]
    InvalidCsrfToken,

    #[error("Rate limit exceeded. Retry after {retry_after_secs} seconds.")]
    RateLimited { retry_after_secs: u64 },

    #[error("Not found")]
    NotFound,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Upstream did not respond within {}s", .0.as_secs_f32())]
    UpstreamTimeout(Duration),

    #[error("Upstream returned {status}")]
    UpstreamStatus { status: StatusCode },

    #[error("Upstream request failed: {0}")]
    UpstreamRequestFailed(String),

    #[error("Invalid upstream response: {0}")]
    InvalidUpstreamResponse(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Errors that stop the gateway from starting. These never reach a caller.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Chain table error: {0}")]
    ChainTable(#[from] crate::chains::ChainTableError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// JSON body of every error response, and of every failed entry of a batch.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// HTTP status of the failed call. Only set on batch entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorBody {
    fn new(error: &str) -> Self {
        ErrorBody {
            error: error.to_string(),
            message: None,
            details: None,
            status: None,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl RpcProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            RpcProxyError::InvalidJson(_)
            | RpcProxyError::InvalidRequest
            | RpcProxyError::InvalidChainId
            | RpcProxyError::InvalidMethod
            | RpcProxyError::InvalidParams
            | RpcProxyError::InvalidBatch
            | RpcProxyError::BatchTooLarge { .. }
            | RpcProxyError::UnsupportedChain(_)
            | RpcProxyError::RequestBodyError(_) => StatusCode::BAD_REQUEST,
            RpcProxyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            RpcProxyError::InvalidCsrfToken => StatusCode::FORBIDDEN,
            RpcProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RpcProxyError::NotFound => StatusCode::NOT_FOUND,
            RpcProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RpcProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RpcProxyError::UpstreamStatus { status } => *status,
            RpcProxyError::UpstreamRequestFailed(_)
            | RpcProxyError::InvalidUpstreamResponse(_)
            | RpcProxyError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for failures caused by the caller's input, as opposed to the
    /// upstream or the gateway itself.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, RpcProxyError::UpstreamStatus { .. }) && self.status().is_client_error()
    }

    pub fn to_body(&self) -> ErrorBody {
        match self {
            RpcProxyError::InvalidJson(details) => {
                ErrorBody::new("Invalid JSON").with_details(details.clone())
            }
            RpcProxyError::InvalidRequest => {
                ErrorBody::new("Invalid request").with_message(self.to_string())
            }
            RpcProxyError::InvalidChainId => {
                ErrorBody::new("Invalid chainId").with_message(self.to_string())
            }
            RpcProxyError::InvalidMethod => {
                ErrorBody::new("Invalid method").with_message(self.to_string())
            }
            RpcProxyError::InvalidParams => {
                ErrorBody::new("Invalid params").with_message(self.to_string())
            }
            RpcProxyError::InvalidBatch => {
                ErrorBody::new("Invalid batch").with_message(self.to_string())
            }
            RpcProxyError::BatchTooLarge { .. } => {
                ErrorBody::new("Batch too large").with_message(self.to_string())
            }
            RpcProxyError::UnsupportedChain(_) => ErrorBody::new("Unsupported chain"),
            RpcProxyError::PayloadTooLarge(_) => {
                ErrorBody::new("Payload too large").with_message(self.to_string())
            }
            RpcProxyError::RequestBodyError(details) => {
                ErrorBody::new("Invalid request body").with_details(details.clone())
            }
            RpcProxyError::InvalidCsrfToken => ErrorBody::new("Invalid CSRF token"),
            RpcProxyError::RateLimited { .. } => {
                ErrorBody::new("Too many requests").with_message(self.to_string())
            }
            RpcProxyError::NotFound => ErrorBody::new("Not found"),
            RpcProxyError::MethodNotAllowed => ErrorBody::new("Method not allowed"),
            RpcProxyError::UpstreamTimeout(_) => {
                ErrorBody::new("Gateway timeout").with_message(self.to_string())
            }
            RpcProxyError::UpstreamStatus { status } => {
                ErrorBody::new("Upstream error").with_message(status.to_string())
            }
            RpcProxyError::UpstreamRequestFailed(message)
            | RpcProxyError::InvalidUpstreamResponse(message) => {
                ErrorBody::new("RPC request failed").with_message(message.clone())
            }
            RpcProxyError::InternalError(_) => ErrorBody::new("Internal server error"),
        }
    }

    /// Error entry for one position of a batch response.
    pub fn to_batch_entry(&self) -> ErrorBody {
        ErrorBody {
            status: Some(self.status().as_u16()),
            ..self.to_body()
        }
    }
}
