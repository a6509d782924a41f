//! Entitlements derived from account state rather than role: the free-tier
//! creation quota and the validity of boost and premium purchases.

use std::sync::Arc;

use cf_core::error::{AppError, Result};
use cf_core::models::{Issue, User};
use cf_core::traits::Store;

use crate::authz::{authorize, Action};
use crate::StoreResultExt;

/// Issues a non-premium citizen may file over the life of the account.
pub const DEFAULT_FREE_ISSUE_LIMIT: u32 = 3;

#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn Store>,
    free_issue_limit: u32,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn Store>, free_issue_limit: u32) -> Self {
        Self {
            store,
            free_issue_limit,
        }
    }

    pub fn free_issue_limit(&self) -> u32 {
        self.free_issue_limit
    }

    /// The limit the store must re-check when inserting; `None` is unlimited.
    pub fn creation_quota(&self, user: &User) -> Option<u32> {
        if user.is_premium {
            None
        } else {
            Some(self.free_issue_limit)
        }
    }

    /// Advisory answer for UI purposes. Creation re-validates atomically.
    /// Accounts that may not create at all (staff, admins, blocked users)
    /// get `false`.
    pub async fn can_create_issue(&self, user: &User) -> Result<bool> {
        if authorize(user, Action::CreateIssue).is_err() {
            return Ok(false);
        }
        let Some(limit) = self.creation_quota(user) else {
            return Ok(true);
        };
        let filed = self
            .store
            .issues_filed_by(user.id)
            .await
            .or_unavailable("count filed issues")?;
        Ok(filed < u64::from(limit))
    }

    pub fn check_boost(&self, issue: &Issue) -> Result<()> {
        if issue.is_boosted {
            return Err(AppError::Conflict("issue is already boosted".into()));
        }
        if issue.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "cannot boost an issue that is {}",
                issue.status
            )));
        }
        Ok(())
    }

    pub fn check_premium(&self, user: &User) -> Result<()> {
        if user.is_premium {
            return Err(AppError::Conflict("account is already premium".into()));
        }
        Ok(())
    }
}
