//! Error taxonomy of the request runtime.
//!
//! Every failure that can reach a caller is an [`InvocationError`]. Collaborators
//! raise their own narrower enums ([`RateLimitError`], [`IdentityLinkError`],
//! [`ChannelRegistryError`]) which convert into it at the dispatch boundary.

use http::StatusCode;

/// Why a rate limiter refused a call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit reached for {scope}")]
    LimitReached { scope: String },
    #[error("address not allowed: {address}")]
    AddressNotAllowed { address: String },
    #[error("rate limiting failed: {0}")]
    Other(String),
}

impl RateLimitError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::LimitReached { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::AddressNotAllowed { .. } => StatusCode::FORBIDDEN,
            Self::Other(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Failure of the secondary identity link that follows authentication.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityLinkError {
    /// The secondary system refused the login. Logged, never fatal.
    #[error("identity link failed: {0}")]
    Failed(String),
    /// The secondary system does not understand the security type.
    #[error("unexpected security type for identity link: {0}")]
    UnexpectedSecurityType(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelRegistryError {
    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("duplicate channel id {id}")]
    DuplicateId { id: u64 },
}

/// Errors raised while dispatching a request or invoking a service.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("no channel matches the request")]
    RouteNotFound,
    #[error("method not allowed: {method}")]
    MethodNotAllowed { method: String },
    #[error("channel `{name}` is not active")]
    ChannelInactive { name: String },
    #[error("{message}")]
    NotFound { message: String },
    #[error("unauthorized: {message}")]
    Unauthorized {
        message: String,
        /// Value for the `WWW-Authenticate` response header.
        challenge: Option<String>,
    },
    #[error("forbidden: {message}")]
    Forbidden { message: String },
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error("schema validation failed: {short}")]
    SchemaValidation {
        short: String,
        details: String,
        needs_details: bool,
    },
    #[error("bad request: {message}")]
    BadRequest {
        message: String,
        /// The message may be shown to any caller, not only admins.
        needs_raw_message: bool,
    },
    #[error("service `{name}` is not active")]
    ServiceNotActive { name: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invocation of `{service}` timed out after {timeout_ms}ms")]
    Timeout { service: String, timeout_ms: u64 },
    #[error("invocation of `{service}` was cancelled")]
    Cancelled { service: String },
    #[error("server overloaded, try again later")]
    Overloaded,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl InvocationError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
            needs_raw_message: false,
        }
    }

    pub fn unauthorized(message: impl Into<String>, challenge: Option<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
            challenge,
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::Internal(anyhow::anyhow!("{message}"))
    }

    /// Maps the error to its response status. The table is closed: anything
    /// not listed is an internal error.
    #[must_use]
    pub fn status_for(&self) -> StatusCode {
        match self {
            Self::RouteNotFound | Self::ChannelInactive { .. } | Self::NotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::RateLimit(e) => e.status(),
            Self::SchemaValidation { .. } | Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::ServiceNotActive { .. } | Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Configuration(_) | Self::Cancelled { .. } | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short label used in logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RouteNotFound => "route_not_found",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::ChannelInactive { .. } => "channel_inactive",
            Self::NotFound { .. } => "not_found",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::RateLimit(_) => "rate_limit",
            Self::SchemaValidation { .. } => "schema_validation",
            Self::BadRequest { .. } => "bad_request",
            Self::ServiceNotActive { .. } => "service_not_active",
            Self::Configuration(_) => "configuration",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Overloaded => "overloaded",
            Self::Internal(_) => "internal",
        }
    }
}
