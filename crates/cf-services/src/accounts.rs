//! Administrator governance over accounts: blocking, staff provisioning
//! and removal.

use std::sync::Arc;

use cf_core::error::{AppError, Result};
use cf_core::models::{IdentityClaims, Role, User};
use cf_core::traits::Store;
use uuid::Uuid;

use crate::authz::{authorize, Action};
use crate::session::Session;
use crate::StoreResultExt;

pub struct AccountAdmin {
    store: Arc<dyn Store>,
}

impl AccountAdmin {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Blocks or unblocks an account. Admin accounts cannot be blocked.
    pub async fn set_blocked(&self, session: &Session, user_id: Uuid, blocked: bool) -> Result<User> {
        authorize(session.user(), Action::Administer)?;
        let target = self
            .store
            .find_user(user_id)
            .await
            .or_unavailable("find user")?
            .ok_or_else(|| AppError::user_not_found(user_id))?;
        if target.role == Role::Admin {
            return Err(AppError::Forbidden);
        }

        let updated = self
            .store
            .set_blocked(user_id, blocked)
            .await
            .or_unavailable("set blocked")?
            .ok_or_else(|| AppError::user_not_found(user_id))?;
        tracing::info!(
            admin_id = %session.user_id(),
            user_id = %user_id,
            blocked,
            "account block flag changed"
        );
        Ok(updated)
    }

    /// Registers a staff account for an identity-provider subject that has
    /// not signed in before.
    pub async fn provision_staff(&self, session: &Session, claims: IdentityClaims) -> Result<User> {
        authorize(session.user(), Action::Administer)?;
        if claims.subject.trim().is_empty() {
            return Err(AppError::ValidationError("staff subject must not be empty".into()));
        }

        let staff = User::from_identity(&claims, Role::Staff);
        if !self
            .store
            .insert_user(staff.clone())
            .await
            .or_unavailable("insert staff")?
        {
            return Err(AppError::Conflict(format!(
                "subject {} already has an account",
                claims.subject
            )));
        }
        tracing::info!(admin_id = %session.user_id(), staff_id = %staff.id, "staff provisioned");
        Ok(staff)
    }

    /// Hard-deletes a staff account; its assignments are cleared.
    pub async fn remove_staff(&self, session: &Session, staff_id: Uuid) -> Result<()> {
        authorize(session.user(), Action::Administer)?;
        if !self
            .store
            .delete_staff(staff_id)
            .await
            .or_unavailable("delete staff")?
        {
            return Err(AppError::NotFound("Staff".into(), staff_id.to_string()));
        }
        tracing::info!(admin_id = %session.user_id(), staff_id = %staff_id, "staff removed");
        Ok(())
    }

    pub async fn list_users(&self, session: &Session, role: Option<Role>) -> Result<Vec<User>> {
        authorize(session.user(), Action::Administer)?;
        self.store.list_users(role).await.or_unavailable("list users")
    }
}
