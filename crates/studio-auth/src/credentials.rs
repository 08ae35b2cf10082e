//! Credentials and the authenticated principal.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use studio_core::UserId;

use crate::error::{AuthError, Result};

/// Environment variable holding the user ID.
pub const USER_ID_ENV: &str = "STUDIO_USER_ID";
/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "STUDIO_API_KEY";

/// Minimum accepted API key length.
const MIN_API_KEY_LEN: usize = 16;

/// A secret API key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Return the raw key for use in transport headers.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub(crate) fn from_test(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

/// Raw, unvalidated credentials as supplied by the caller or environment.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    user_id: Option<String>,
    api_key: Option<ApiKey>,
}

impl Credentials {
    /// Credentials from explicit values.
    #[must_use]
    pub fn new(user_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            api_key: Some(ApiKey(api_key.into())),
        }
    }

    /// Credentials from values that may be missing, e.g. optional CLI flags.
    #[must_use]
    pub fn from_parts(user_id: Option<String>, api_key: Option<String>) -> Self {
        Self {
            user_id,
            api_key: api_key.map(ApiKey),
        }
    }

    /// Credentials from `STUDIO_USER_ID` and `STUDIO_API_KEY`.
    ///
    /// Missing variables are reported when the credentials are checked, not here.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            user_id: std::env::var(USER_ID_ENV).ok(),
            api_key: std::env::var(API_KEY_ENV).ok().map(ApiKey),
        }
    }

    /// Check that both values are present and well-formed.
    ///
    /// # Errors
    ///
    /// Returns `MissingCredential` if a value is absent or blank,
    /// `InvalidUserId` if the user ID is not a UUID, and `InvalidApiKey`
    /// if the key is too short or contains whitespace.
    pub fn check(&self) -> Result<(UserId, ApiKey)> {
        let user_id = self
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MissingCredential("user id"))?;
        let api_key = self
            .api_key
            .as_ref()
            .filter(|k| !k.0.trim().is_empty())
            .ok_or(AuthError::MissingCredential("api key"))?;

        let user_id = UserId::from_str(user_id).map_err(|_| AuthError::InvalidUserId)?;

        if api_key.0.chars().any(char::is_whitespace) {
            return Err(AuthError::InvalidApiKey("contains whitespace".to_string()));
        }
        if api_key.0.len() < MIN_API_KEY_LEN {
            return Err(AuthError::InvalidApiKey(format!(
                "must be at least {MIN_API_KEY_LEN} characters"
            )));
        }

        Ok((user_id, api_key.clone()))
    }
}

/// A verified caller. Only an [`Authenticator`](crate::Authenticator) can produce one.
#[derive(Clone)]
pub struct Principal {
    user_id: UserId,
    api_key: ApiKey,
    verified_at: DateTime<Utc>,
}

impl Principal {
    pub(crate) fn new(user_id: UserId, api_key: ApiKey) -> Self {
        Self {
            user_id,
            api_key,
            verified_at: Utc::now(),
        }
    }

    /// The authenticated user.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The API key used for subsequent backend calls.
    #[must_use]
    pub const fn api_key(&self) -> &ApiKey {
        &self.api_key
    }

    /// When the credentials were verified.
    #[must_use]
    pub const fn verified_at(&self) -> DateTime<Utc> {
        self.verified_at
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal")
            .field("user_id", &self.user_id)
            .field("verified_at", &self.verified_at)
            .finish_non_exhaustive()
    }
}
