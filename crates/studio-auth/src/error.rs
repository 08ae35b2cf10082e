//! Authentication error types.

use thiserror::Error;

/// A result type using `AuthError`.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors that can occur during authentication.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A required credential was not supplied.
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    /// The user ID is not a valid UUID.
    #[error("invalid user ID format")]
    InvalidUserId,

    /// The API key is malformed.
    #[error("invalid API key format: {0}")]
    InvalidApiKey(String),

    /// The platform rejected the credentials.
    #[error("credentials rejected: {0}")]
    Rejected(String),

    /// Too many authentication attempts, rate limited.
    #[error("rate limited")]
    RateLimited,

    /// The authentication service could not be reached.
    #[error("authentication service unavailable: {0}")]
    Unavailable(String),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Returns `true` if the same credentials may succeed on a later attempt.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Unavailable(_))
    }

    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::MissingCredential(_)
            | Self::InvalidUserId
            | Self::InvalidApiKey(_)
            | Self::Rejected(_) => 401,
            Self::RateLimited => 429,
            Self::Unavailable(_) => 503,
            Self::Internal(_) => 500,
        }
    }
}
