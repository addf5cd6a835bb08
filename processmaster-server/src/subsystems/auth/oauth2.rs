//! OAuth2 authorization-code flow against a generic issuer
//! (`<issuer>/auth`, `<issuer>/token`, `<issuer>/userinfo`).

use std::time::Duration;

use moka::sync::Cache;
use processmaster_core::config::OAuth2Config;
use processmaster_core::models::AuthProvider;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use super::tokens::generate_opaque_token;
use super::{AuthError, VerifiedIdentity};

/// How long an issued `state` stays redeemable.
const STATE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    id: Option<String>,
    email: Option<String>,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
}

pub struct OAuth2Client {
    http: Client,
    config: OAuth2Config,
    pending_states: Cache<String, ()>,
}

impl OAuth2Client {
    pub fn new(config: OAuth2Config) -> Result<Self, AuthError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::Provider(e.to_string()))?;

        Ok(Self {
            http,
            config,
            pending_states: Cache::builder()
                .time_to_live(STATE_TTL)
                .max_capacity(10_000)
                .build(),
        })
    }

    fn issuer(&self) -> &str {
        self.config.issuer_url.trim_end_matches('/')
    }

    /// Build the issuer redirect and remember its `state`.
    pub fn authorize_url(&self) -> Result<String, AuthError> {
        let state = generate_opaque_token();
        let url = Url::parse_with_params(
            &format!("{}/auth", self.issuer()),
            &[
                ("response_type", "code"),
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("scope", self.config.scope.as_str()),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| AuthError::Provider(format!("invalid issuer url: {}", e)))?;

        self.pending_states.insert(state, ());
        Ok(url.to_string())
    }

    /// Consume `state`, exchange `code` for an access token and fetch the profile.
    pub async fn exchange(&self, code: &str, state: &str) -> Result<VerifiedIdentity, AuthError> {
        if self.pending_states.remove(state).is_none() {
            return Err(AuthError::InvalidState);
        }

        let token_resp = self
            .http
            .post(format!("{}/token", self.issuer()))
            .header("accept", "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Provider(e.to_string()))?;

        if !token_resp.status().is_success() {
            let status = token_resp.status().as_u16();
            let body = token_resp.text().await.unwrap_or_default();
            tracing::warn!(status, body = %body, "OAuth2 token exchange rejected");
            return Err(AuthError::InvalidCredentials);
        }

        let token: TokenResponse = token_resp
            .json()
            .await
            .map_err(|e| AuthError::Provider(format!("bad token response: {}", e)))?;

        let info_resp = self
            .http
            .get(format!("{}/userinfo", self.issuer()))
            .bearer_auth(&token.access_token)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| AuthError::Provider(e.to_string()))?;

        if !info_resp.status().is_success() {
            return Err(AuthError::Provider(format!(
                "userinfo returned {}",
                info_resp.status()
            )));
        }

        let info: UserInfo = info_resp
            .json()
            .await
            .map_err(|e| AuthError::Provider(format!("bad userinfo response: {}", e)))?;

        let email = info
            .email
            .filter(|e| !e.is_empty())
            .ok_or_else(|| AuthError::Provider("userinfo has no email".to_string()))?;

        Ok(VerifiedIdentity {
            email,
            first_name: info.given_name,
            last_name: info.family_name,
            provider: AuthProvider::OAuth2,
            provider_id: info.sub.or(info.id),
            role: None,
            existing_user: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(issuer: &str) -> OAuth2Client {
        OAuth2Client::new(OAuth2Config {
            issuer_url: issuer.to_string(),
            client_id: "pm-client".to_string(),
            client_secret: "pm-secret".to_string(),
            redirect_uri: "http://localhost:3001/auth/oauth2/callback".to_string(),
            scope: "openid profile email".to_string(),
        })
        .unwrap()
    }

    fn state_of(url: &str) -> String {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[test]
    fn test_authorize_url_shape() {
        let c = client("https://idp.example.com/");
        let url = c.authorize_url().unwrap();
        assert!(url.starts_with("https://idp.example.com/auth?response_type=code"));
        assert!(url.contains("client_id=pm-client"));
        assert!(url.contains("scope=openid+profile+email"));
        assert_eq!(state_of(&url).len(), 43);
    }

    #[tokio::test]
    async fn test_unknown_state_is_rejected() {
        let c = client("https://idp.example.com");
        assert!(matches!(
            c.exchange("code", "forged").await,
            Err(AuthError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn test_code_exchange_and_userinfo() {
        let server = MockServer::start().await;
        let c = client(&server.uri());

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-1", "token_type": "Bearer", "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(header("authorization", "Bearer at-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sub": "idp-42",
                "email": "grace@example.com",
                "given_name": "Grace",
                "family_name": "Hopper"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let state = state_of(&c.authorize_url().unwrap());
        let identity = c.exchange("abc123", &state).await.unwrap();
        assert_eq!(identity.email, "grace@example.com");
        assert_eq!(identity.provider_id.as_deref(), Some("idp-42"));
        assert_eq!(identity.first_name.as_deref(), Some("Grace"));

        // state is single-use
        assert!(matches!(
            c.exchange("abc123", &state).await,
            Err(AuthError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn test_rejected_code_is_invalid_credentials() {
        let server = MockServer::start().await;
        let c = client(&server.uri());

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant"
            })))
            .mount(&server)
            .await;

        let state = state_of(&c.authorize_url().unwrap());
        assert!(matches!(
            c.exchange("bad", &state).await,
            Err(AuthError::InvalidCredentials)
        ));
    }
}
