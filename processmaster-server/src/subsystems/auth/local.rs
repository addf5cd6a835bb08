//! Local accounts: argon2 hashes in the `users` table.

use async_trait::async_trait;
use processmaster_core::models::AuthProvider;
use sqlx::PgPool;

use super::{tokens, users, AuthError, CredentialVerifier, VerifiedIdentity};

pub struct LocalVerifier {
    pool: PgPool,
}

impl LocalVerifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialVerifier for LocalVerifier {
    fn provider(&self) -> AuthProvider {
        AuthProvider::Local
    }

    async fn verify(&self, username: &str, password: &str) -> Result<VerifiedIdentity, AuthError> {
        let user = users::find_by_email(&self.pool, username)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        let Some(phc) = user.password_hash.clone() else {
            return Err(AuthError::InvalidCredentials);
        };

        // argon2 is deliberately slow; keep it off the async workers.
        let candidate = password.to_string();
        let matches =
            tokio::task::spawn_blocking(move || tokens::verify_password(&candidate, &phc))
                .await
                .map_err(|e| AuthError::Internal(e.to_string()))?;

        if !matches {
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }

        Ok(VerifiedIdentity {
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            provider: AuthProvider::Local,
            provider_id: None,
            role: Some(user.role),
            existing_user: Some(user),
        })
    }
}
