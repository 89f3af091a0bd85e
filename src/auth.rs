//! Short-lived OAuth credential cache.
//!
//! Holds one bearer token for the upstream API and refreshes it via the
//! `client_credentials` grant when it nears expiry. The refresh runs while
//! the token mutex is held, so concurrent callers coalesce into a single
//! upstream exchange.

use crate::config::OauthConfig;
use crate::error::{EmbedditError, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::info;

/// Tokens are treated as expired this long before their declared expiry.
const EXPIRY_MARGIN_SECS: u64 = 300;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Clone)]
struct Credential {
    token: String,
    expires_at: SystemTime,
}

/// Cached bearer credential for the upstream token endpoint.
pub struct CredentialCache {
    http: Client,
    client_id: String,
    client_secret: String,
    token_url: String,
    current: Mutex<Option<Credential>>,
}

impl CredentialCache {
    pub fn new(http: Client, oauth: &OauthConfig, token_url: impl Into<String>) -> Self {
        Self {
            http,
            client_id: oauth.client_id.clone(),
            client_secret: oauth.client_secret.clone(),
            token_url: token_url.into(),
            current: Mutex::new(None),
        }
    }

    /// Return the cached token, refreshing it first if it has expired.
    ///
    /// Auth failures are not retried here; the caller surfaces them.
    pub async fn token(&self) -> Result<String> {
        let mut current = self.current.lock().await;
        if let Some(cred) = current.as_ref() {
            if SystemTime::now() < cred.expires_at {
                return Ok(cred.token.clone());
            }
        }

        let cred = self.refresh().await?;
        let expiry: DateTime<Utc> = cred.expires_at.into();
        info!("Refreshed access token, expires at {}", expiry.to_rfc3339());
        let token = cred.token.clone();
        *current = Some(cred);
        Ok(token)
    }

    async fn refresh(&self) -> Result<Credential> {
        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| EmbedditError::AuthError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EmbedditError::AuthError(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| EmbedditError::AuthError(format!("invalid token response: {e}")))?;

        let lifetime =
            Duration::from_secs(body.expires_in.saturating_sub(EXPIRY_MARGIN_SECS));
        Ok(Credential {
            token: body.access_token,
            expires_at: SystemTime::now() + lifetime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn oauth_config() -> OauthConfig {
        OauthConfig {
            client_id: "test-id".to_string(),
            client_secret: "test-secret".to_string(),
        }
    }

    fn token_body(token: &str, expires_in: u64) -> serde_json::Value {
        serde_json::json!({ "access_token": token, "expires_in": expires_in })
    }

    #[tokio::test]
    async fn token_is_cached_within_expiry_margin() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/access_token"))
            .and(header_exists("authorization"))
            .and(body_string("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok1", 3600)))
            .expect(1)
            .mount(&server)
            .await;

        let cache = CredentialCache::new(
            Client::new(),
            &oauth_config(),
            format!("{}/api/v1/access_token", server.uri()),
        );

        assert_eq!(cache.token().await.unwrap(), "tok1");
        assert_eq!(cache.token().await.unwrap(), "tok1");
    }

    #[tokio::test]
    async fn expired_token_triggers_exactly_one_refresh() {
        let server = MockServer::start().await;
        // expires_in equal to the margin yields a zero lifetime, so every
        // call observes an expired credential.
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok", 300)))
            .expect(2)
            .mount(&server)
            .await;

        let cache = CredentialCache::new(Client::new(), &oauth_config(), server.uri());
        cache.token().await.unwrap();
        cache.token().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("tok1", 3600))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = CredentialCache::new(Client::new(), &oauth_config(), server.uri());
        let (a, b) = tokio::join!(cache.token(), cache.token());
        assert_eq!(a.unwrap(), "tok1");
        assert_eq!(b.unwrap(), "tok1");
    }

    #[tokio::test]
    async fn non_success_response_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let cache = CredentialCache::new(Client::new(), &oauth_config(), server.uri());
        let err = cache.token().await.unwrap_err();
        assert!(matches!(err, EmbedditError::AuthError(_)));
    }
}
