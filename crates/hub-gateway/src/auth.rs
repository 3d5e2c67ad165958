use std::sync::Arc;

use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::{debug, error};
use uuid::Uuid;

use hub_db::Store;
use hub_types::api::Claims;

/// The user a verified token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("token subject {0} is not a known user")]
    UnknownUser(Uuid),

    #[error("user lookup failed: {0:#}")]
    Store(anyhow::Error),
}

impl AuthError {
    /// True for failures caused by the credential itself, as opposed to the
    /// server being unable to check it.
    pub fn is_unauthorized(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

/// Validates the bearer token presented at WebSocket upgrade. Runs before
/// any session exists; there is no retry.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
    store: Arc<dyn Store>,
}

impl TokenVerifier {
    pub fn new(secret: &str, store: Arc<dyn Store>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
            store,
        }
    }

    pub async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| {
                debug!("Rejected token: {}", e);
                AuthError::InvalidToken(e)
            })?
            .claims;

        // The token must still name an existing user.
        let store = self.store.clone();
        let user_id = claims.sub;
        let user = tokio::task::spawn_blocking(move || store.get_user(user_id))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                AuthError::Store(anyhow::anyhow!("user lookup task failed: {}", e))
            })?
            .map_err(AuthError::Store)?
            .ok_or(AuthError::UnknownUser(user_id))?;

        Ok(Identity {
            user_id: user.id,
            email: user.email,
        })
    }
}
