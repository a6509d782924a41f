//! Session verification: identity assertion in, local account out.

use std::sync::Arc;
use std::time::Duration;

use cf_core::error::{AppError, Result};
use cf_core::models::{Role, User};
use cf_core::traits::{IdentityVerifier, Store};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::StoreResultExt;

/// The caller of an engine operation, resolved once per request.
///
/// The account snapshot is taken at verification time and is not refreshed
/// for the lifetime of the session.
#[derive(Debug, Clone)]
pub struct Session {
    user: User,
    verified_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user: User) -> Self {
        Self {
            user,
            verified_at: Utc::now(),
        }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn user_id(&self) -> Uuid {
        self.user.id
    }

    pub fn role(&self) -> Role {
        self.user.role
    }

    pub fn verified_at(&self) -> DateTime<Utc> {
        self.verified_at
    }
}

pub struct SessionVerifier {
    identity: Arc<dyn IdentityVerifier>,
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl SessionVerifier {
    pub fn new(identity: Arc<dyn IdentityVerifier>, store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self {
            identity,
            store,
            timeout,
        }
    }

    /// Exchanges an identity assertion for a [`Session`].
    ///
    /// First sight of a subject creates a citizen account; later calls only
    /// refresh display-profile fields. Blocked accounts still resolve here:
    /// blocking is enforced at authorization time.
    ///
    /// # Errors
    /// `InvalidToken` when the assertion is rejected, `Unavailable` when the
    /// identity provider or the store cannot be reached in time.
    pub async fn verify(&self, token: &str) -> Result<Session> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::InvalidToken("missing token".into()));
        }

        let claims = match tokio::time::timeout(self.timeout, self.identity.verify(token)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "identity provider timed out");
                return Err(AppError::Unavailable("identity provider timed out".into()));
            }
        };
        if claims.subject.trim().is_empty() {
            return Err(AppError::InvalidToken("assertion carries no subject".into()));
        }

        let user = self
            .store
            .upsert_identity(&claims)
            .await
            .or_unavailable("upsert identity")?;
        tracing::debug!(user_id = %user.id, role = %user.role, "session verified");
        Ok(Session::new(user))
    }
}
