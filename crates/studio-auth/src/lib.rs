//! API-key authentication for the studio control plane.
//!
//! Every control-plane operation runs on behalf of a [`Principal`]. A
//! principal is obtained by handing [`Credentials`] (a user ID and an API
//! key, usually from the environment) to an [`Authenticator`].
//!
//! # Example
//!
//! ```no_run
//! use studio_auth::{ApiKeyAuthenticator, AuthConfig, Authenticator, Credentials};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let auth = ApiKeyAuthenticator::new(AuthConfig::from_env());
//! let principal = auth.authenticate(&Credentials::from_env()).await?;
//! println!("User: {}", principal.user_id());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod authenticator;
pub mod credentials;
pub mod error;

pub use authenticator::{ApiKeyAuthenticator, Authenticator};
pub use credentials::{ApiKey, Credentials, Principal, API_KEY_ENV, USER_ID_ENV};
pub use error::{AuthError, Result};

#[cfg(any(test, feature = "test-utils"))]
pub use authenticator::MockAuthenticator;

/// Configuration for API-key verification.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Base URL of the platform API.
    pub base_url: String,
    /// How long a successful verification is reused, in seconds.
    pub verify_cache_seconds: u64,
    /// Per-request timeout, in seconds.
    pub request_timeout_seconds: u64,
}

impl AuthConfig {
    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `STUDIO_API_URL`: Base URL of the platform API
    /// - `STUDIO_AUTH_CACHE_SECS`: How long a verification is reused
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("STUDIO_API_URL") {
            config.base_url = val;
        }
        if let Ok(val) = std::env::var("STUDIO_AUTH_CACHE_SECS") {
            if let Ok(secs) = val.parse() {
                config.verify_cache_seconds = secs;
            }
        }

        config
    }

    /// Get the identity endpoint URL.
    #[must_use]
    pub fn whoami_url(&self) -> String {
        format!("{}/v1/auth/whoami", self.base_url.trim_end_matches('/'))
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.studio.dev".to_string(),
            verify_cache_seconds: 300,
            request_timeout_seconds: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = AuthConfig::default();
        assert_eq!(config.base_url, "https://api.studio.dev");
        assert_eq!(config.verify_cache_seconds, 300);
    }

    #[test]
    fn whoami_url_trims_trailing_slash() {
        let config = AuthConfig {
            base_url: "http://localhost:8080/".to_string(),
            ..AuthConfig::default()
        };
        assert_eq!(config.whoami_url(), "http://localhost:8080/v1/auth/whoami");
    }

    #[test]
    fn auth_error_status_codes() {
        assert_eq!(AuthError::MissingCredential("api key").http_status_code(), 401);
        assert_eq!(AuthError::InvalidUserId.http_status_code(), 401);
        assert_eq!(AuthError::RateLimited.http_status_code(), 429);
        assert_eq!(AuthError::Unavailable("x".into()).http_status_code(), 503);
    }

    #[test]
    fn auth_error_retriable() {
        assert!(AuthError::RateLimited.is_retriable());
        assert!(AuthError::Unavailable("down".into()).is_retriable());
        assert!(!AuthError::Rejected("no".into()).is_retriable());
        assert!(!AuthError::MissingCredential("user id").is_retriable());
    }
}
