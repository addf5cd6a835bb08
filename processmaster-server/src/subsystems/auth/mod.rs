//! Auth gateway
//!
//! Issues and validates bearer tokens and delegates credential checks to a
//! [`CredentialVerifier`] per provider. The registry is built from
//! configuration: local is always present, LDAP when enabled. OAuth2 does
//! not take passwords; it goes through the authorize/callback redirect pair.

pub mod ldap;
pub mod local;
pub mod oauth2;
pub mod tokens;
pub mod users;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use processmaster_core::config::AuthConfig;
use processmaster_core::models::{AuthProvider, Role, User, UserProfile};
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::error::ApiError;

pub use ldap::LdapVerifier;
pub use local::LocalVerifier;
pub use oauth2::OAuth2Client;
pub use tokens::AuthUser;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("Access token required")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Authentication provider '{0}' is not configured")]
    ProviderNotConfigured(AuthProvider),

    #[error("OAuth2 logins must use /auth/oauth2/authorize")]
    UseAuthorizeEndpoint,

    #[error("Invalid or expired OAuth2 state")]
    InvalidState,

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Identity provider error: {0}")]
    Provider(String),

    #[error("{0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        let message = e.to_string();
        match e {
            AuthError::InvalidCredentials => ApiError::unauthorized("INVALID_CREDENTIALS", message),
            AuthError::AccountDisabled => ApiError::unauthorized("ACCOUNT_DISABLED", message),
            AuthError::MissingToken => ApiError::unauthorized("NO_TOKEN", message),
            AuthError::InvalidToken => ApiError::unauthorized("INVALID_TOKEN", message),
            AuthError::TokenExpired => ApiError::unauthorized("TOKEN_EXPIRED", message),
            AuthError::InvalidRefreshToken => {
                ApiError::unauthorized("INVALID_REFRESH_TOKEN", message)
            }
            AuthError::ProviderNotConfigured(_) => ApiError::BadRequest {
                code: "PROVIDER_NOT_CONFIGURED",
                message,
            },
            AuthError::UseAuthorizeEndpoint => ApiError::BadRequest {
                code: "USE_OAUTH2_AUTHORIZE",
                message,
            },
            AuthError::InvalidState => ApiError::BadRequest {
                code: "INVALID_STATE",
                message,
            },
            AuthError::Directory(_) => ApiError::Upstream {
                code: "DIRECTORY_ERROR",
                message,
            },
            AuthError::Provider(_) => ApiError::Upstream {
                code: "OAUTH2_ERROR",
                message,
            },
            AuthError::Internal(msg) => ApiError::Internal(msg),
            AuthError::Database(db) => ApiError::Database(db),
        }
    }
}

/// An identity a provider has vouched for.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub provider: AuthProvider,
    pub provider_id: Option<String>,
    /// Role asserted by the provider, used only when the user is created.
    pub role: Option<Role>,
    /// Set by providers that authenticate against an existing row.
    pub existing_user: Option<User>,
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    fn provider(&self) -> AuthProvider;

    async fn verify(&self, username: &str, password: &str) -> Result<VerifiedIdentity, AuthError>;
}

/// Token pair handed out by every successful login.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResult {
    pub user: UserProfile,
    pub token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

pub struct AuthGateway {
    pool: PgPool,
    config: AuthConfig,
    verifiers: HashMap<AuthProvider, Arc<dyn CredentialVerifier>>,
    oauth2: Option<OAuth2Client>,
}

impl AuthGateway {
    pub fn new(pool: PgPool, config: AuthConfig) -> Self {
        Self {
            pool,
            config,
            verifiers: HashMap::new(),
            oauth2: None,
        }
    }

    /// Registry as configured: local always, LDAP when enabled, OAuth2 when
    /// an issuer is set.
    pub fn from_config(pool: PgPool, mut config: AuthConfig) -> Result<Self, AuthError> {
        if config.jwt_secret.is_empty() {
            tracing::warn!("auth.jwt_secret is empty; using an ephemeral secret");
            config.jwt_secret = tokens::generate_opaque_token();
        }

        let mut gateway = Self::new(pool.clone(), config.clone());
        gateway.register(Arc::new(LocalVerifier::new(pool)));

        if config.ldap.enabled {
            gateway.register(Arc::new(LdapVerifier::from_config(&config.ldap)));
        }

        if let Some(oauth2) = config.oauth2.clone() {
            gateway.oauth2 = Some(OAuth2Client::new(oauth2)?);
        }

        tracing::info!(
            providers = ?gateway.verifiers.keys().map(|p| p.as_str()).collect::<Vec<_>>(),
            oauth2 = gateway.oauth2.is_some(),
            "Auth gateway ready"
        );
        Ok(gateway)
    }

    pub fn register(&mut self, verifier: Arc<dyn CredentialVerifier>) {
        self.verifiers.insert(verifier.provider(), verifier);
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Password login through the provider's verifier.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        provider: AuthProvider,
    ) -> Result<LoginResult, AuthError> {
        if provider == AuthProvider::OAuth2 {
            return Err(AuthError::UseAuthorizeEndpoint);
        }

        let verifier = self
            .verifiers
            .get(&provider)
            .ok_or(AuthError::ProviderNotConfigured(provider))?;

        let identity = verifier.verify(username, password).await?;
        let user = match identity.existing_user.clone() {
            Some(user) => {
                users::touch_last_login(&self.pool, user.id).await?;
                user
            }
            None => users::provision(&self.pool, &identity).await?,
        };

        self.open_session(&user).await
    }

    pub fn oauth2_authorize_url(&self) -> Result<String, AuthError> {
        self.oauth2
            .as_ref()
            .ok_or(AuthError::ProviderNotConfigured(AuthProvider::OAuth2))?
            .authorize_url()
    }

    /// Finish the authorization-code flow and return the web redirect.
    pub async fn oauth2_callback(&self, code: &str, state: &str) -> Result<String, AuthError> {
        let client = self
            .oauth2
            .as_ref()
            .ok_or(AuthError::ProviderNotConfigured(AuthProvider::OAuth2))?;

        let identity = client.exchange(code, state).await?;
        let user = users::provision(&self.pool, &identity).await?;
        let session = self.open_session(&user).await?;

        callback_redirect(&self.config.web_base_url, &session)
    }

    /// New access token for a live refresh token. The refresh token is not rotated.
    pub async fn refresh(&self, refresh_token: &str) -> Result<String, AuthError> {
        let user = users::user_for_refresh_token(&self.pool, &tokens::hash_token(refresh_token))
            .await?
            .ok_or(AuthError::InvalidRefreshToken)?;

        tokens::issue_access_token(&user, &self.config.jwt_secret, self.config.access_ttl_secs)
    }

    pub async fn logout(&self, refresh_token: &str) -> Result<(), AuthError> {
        let removed =
            users::revoke_refresh_token(&self.pool, &tokens::hash_token(refresh_token)).await?;
        tracing::debug!(removed, "Refresh token revoked");
        Ok(())
    }

    pub async fn profile(&self, user_id: Uuid) -> Result<UserProfile, AuthError> {
        let user = users::find_by_id(&self.pool, user_id)
            .await?
            .ok_or(AuthError::InvalidToken)?;
        Ok(UserProfile::from(&user))
    }

    /// Stateless bearer check; the database is not consulted.
    pub fn authenticate_bearer(&self, token: &str) -> Result<AuthUser, AuthError> {
        tokens::verify_access_token(token, &self.config.jwt_secret)
    }

    /// Create a local account (operator bootstrap).
    pub async fn create_local_user(
        &self,
        email: &str,
        password: &str,
        role: Role,
    ) -> Result<User, AuthError> {
        let owned = password.to_string();
        let phc = tokio::task::spawn_blocking(move || tokens::hash_password(&owned))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))??;

        let user = users::create_user(
            &self.pool,
            users::NewUser {
                email,
                first_name: None,
                last_name: None,
                password_hash: Some(&phc),
                provider: AuthProvider::Local,
                provider_id: None,
                role,
            },
        )
        .await?;
        Ok(user)
    }

    async fn open_session(&self, user: &User) -> Result<LoginResult, AuthError> {
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }

        let token =
            tokens::issue_access_token(user, &self.config.jwt_secret, self.config.access_ttl_secs)?;
        let refresh_token = tokens::generate_opaque_token();
        users::save_refresh_token(
            &self.pool,
            user.id,
            &tokens::hash_token(&refresh_token),
            self.config.refresh_ttl_secs,
        )
        .await?;

        tracing::info!(user_id = %user.id, provider = %user.provider, "Login succeeded");

        Ok(LoginResult {
            user: UserProfile::from(user),
            token,
            refresh_token,
            expires_in: self.config.access_ttl_secs,
        })
    }
}

/// `<web_base_url>/auth/callback?token=..&refreshToken=..`
pub fn callback_redirect(web_base_url: &str, session: &LoginResult) -> Result<String, AuthError> {
    let url = Url::parse_with_params(
        &format!("{}/auth/callback", web_base_url.trim_end_matches('/')),
        &[
            ("token", session.token.as_str()),
            ("refreshToken", session.refresh_token.as_str()),
        ],
    )
    .map_err(|e| AuthError::Internal(format!("invalid web_base_url: {}", e)))?;
    Ok(url.to_string())
}
