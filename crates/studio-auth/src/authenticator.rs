//! Credential verification against the platform.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;

use studio_core::UserId;

use crate::credentials::{ApiKey, Credentials, Principal};
use crate::error::{AuthError, Result};
use crate::AuthConfig;

/// Trait for turning credentials into a verified principal.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials are missing, malformed or rejected.
    async fn authenticate(&self, credentials: &Credentials) -> Result<Principal>;
}

#[derive(Debug, Deserialize)]
struct WhoAmIResponse {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    code: String,
    message: Option<String>,
}

struct CachedPrincipal {
    principal: Principal,
    verified: Instant,
}

/// Verifies API keys over HTTP and caches successful results.
pub struct ApiKeyAuthenticator {
    config: AuthConfig,
    client: reqwest::Client,
    cache: RwLock<HashMap<UserId, CachedPrincipal>>,
}

impl ApiKeyAuthenticator {
    /// Create a new authenticator with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should never happen with default TLS).
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .expect("failed to create HTTP client");

        Self {
            config,
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, user_id: &UserId, api_key: &ApiKey) -> Option<Principal> {
        let cache = self.cache.read();
        let ttl = Duration::from_secs(self.config.verify_cache_seconds);
        cache
            .get(user_id)
            .filter(|entry| entry.verified.elapsed() < ttl)
            .filter(|entry| entry.principal.api_key() == api_key)
            .map(|entry| entry.principal.clone())
    }

    /// Drop all cached verifications.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    async fn verify(&self, user_id: UserId, api_key: ApiKey) -> Result<Principal> {
        let url = self.config.whoami_url();
        tracing::debug!(url = %url, user_id = %user_id, "Verifying API key");

        let response = self
            .client
            .get(&url)
            .basic_auth(user_id.to_string(), Some(api_key.expose()))
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let body: WhoAmIResponse = response
                .json()
                .await
                .map_err(|e| AuthError::Internal(format!("invalid response: {e}")))?;
            let confirmed = UserId::from_str(&body.user_id)
                .map_err(|_| AuthError::Internal("invalid user_id in response".to_string()))?;
            if confirmed != user_id {
                return Err(AuthError::Rejected(
                    "API key belongs to a different user".to_string(),
                ));
            }
            return Ok(Principal::new(user_id, api_key));
        }

        let error_response: Option<ErrorResponse> = response.json().await.ok();
        match error_response {
            Some(err) => match err.code.as_str() {
                "UNAUTHORIZED" | "FORBIDDEN" => Err(AuthError::Rejected(
                    err.message.unwrap_or_else(|| "invalid credentials".to_string()),
                )),
                "RATE_LIMITED" => Err(AuthError::RateLimited),
                code => Err(AuthError::Internal(format!("error code: {code}"))),
            },
            None => match status.as_u16() {
                401 | 403 => Err(AuthError::Rejected("invalid credentials".to_string())),
                429 => Err(AuthError::RateLimited),
                s if s >= 500 => Err(AuthError::Unavailable(format!("HTTP {status}"))),
                _ => Err(AuthError::Internal(format!("HTTP {status}"))),
            },
        }
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Principal> {
        let (user_id, api_key) = credentials.check()?;

        if let Some(principal) = self.cached(&user_id, &api_key) {
            return Ok(principal);
        }

        let principal = self.verify(user_id, api_key).await?;
        tracing::info!(user_id = %principal.user_id(), "Authenticated");

        self.cache.write().insert(
            user_id,
            CachedPrincipal {
                principal: principal.clone(),
                verified: Instant::now(),
            },
        );
        Ok(principal)
    }
}

/// A mock authenticator for testing.
///
/// Accepts any well-formed credentials unless built with [`MockAuthenticator::rejecting`].
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct MockAuthenticator {
    reject: bool,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockAuthenticator {
    /// An authenticator that rejects every credential.
    #[must_use]
    pub const fn rejecting() -> Self {
        Self { reject: true }
    }

    /// A principal for `user_id` without going through credential checks.
    #[must_use]
    pub fn principal(user_id: UserId) -> Principal {
        Principal::new(user_id, ApiKey::from_test("mock-api-key-0000"))
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Principal> {
        let (user_id, api_key) = credentials.check()?;
        if self.reject {
            return Err(AuthError::Rejected("invalid credentials".to_string()));
        }
        Ok(Principal::new(user_id, api_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const USER: &str = "7ea7d20d-b9eb-4a85-8a6e-614b414c272e";
    const KEY: &str = "f3b1c0de-0000-4a3c-9e11-aa00bb11cc22";

    fn config(base_url: String) -> AuthConfig {
        AuthConfig {
            base_url,
            ..AuthConfig::default()
        }
    }

    #[tokio::test]
    async fn verifies_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/auth/whoami"))
            .and(header_exists("authorization"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "user_id": USER })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let auth = ApiKeyAuthenticator::new(config(server.uri()));
        let creds = Credentials::new(USER, KEY);

        let first = auth.authenticate(&creds).await.unwrap();
        assert_eq!(first.user_id().to_string(), USER);

        // Served from cache; the mock expects exactly one call.
        let second = auth.authenticate(&creds).await.unwrap();
        assert_eq!(second.user_id(), first.user_id());
    }

    #[tokio::test]
    async fn unauthorized_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/auth/whoami"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "code": "UNAUTHORIZED",
                "message": "bad key"
            })))
            .mount(&server)
            .await;

        let auth = ApiKeyAuthenticator::new(config(server.uri()));
        let err = auth
            .authenticate(&Credentials::new(USER, KEY))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Rejected(ref m) if m == "bad key"));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn server_error_is_retriable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let auth = ApiKeyAuthenticator::new(config(server.uri()));
        let err = auth
            .authenticate(&Credentials::new(USER, KEY))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unavailable(_)));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn mismatched_user_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "user_id": "550e8400-e29b-41d4-a716-446655440000"
            })))
            .mount(&server)
            .await;

        let auth = ApiKeyAuthenticator::new(config(server.uri()));
        let result = auth.authenticate(&Credentials::new(USER, KEY)).await;
        assert!(matches!(result, Err(AuthError::Rejected(_))));
    }

    #[tokio::test]
    async fn malformed_credentials_never_reach_the_network() {
        // No server: a request would fail with Unavailable.
        let auth = ApiKeyAuthenticator::new(config("http://127.0.0.1:9".to_string()));
        let result = auth.authenticate(&Credentials::new("nope", KEY)).await;
        assert!(matches!(result, Err(AuthError::InvalidUserId)));
    }

    #[tokio::test]
    async fn mock_authenticator() {
        let creds = Credentials::new(USER, KEY);
        let principal = MockAuthenticator::default()
            .authenticate(&creds)
            .await
            .unwrap();
        assert_eq!(principal.user_id().to_string(), USER);

        let result = MockAuthenticator::rejecting().authenticate(&creds).await;
        assert!(matches!(result, Err(AuthError::Rejected(_))));
    }
}
