//! # Authorization
//!
//! The single place where role, ownership and account status decide whether
//! an action may proceed. Each role has its own exhaustive `match` over
//! [`Action`], so adding a role or an action fails to compile until every
//! rule has been written down.
//!
//! | Action         | citizen owner    | citizen other | staff assigned | staff other | admin |
//! |----------------|------------------|---------------|----------------|-------------|-------|
//! | create         | yes              | -             | no             | no          | no    |
//! | edit content   | while pending    | no            | no             | no          | no    |
//! | delete         | while pending    | no            | no             | no          | yes   |
//! | upvote         | never own        | yes           | yes            | yes         | yes   |
//! | change status  | no               | no            | yes, not reject| no          | yes   |
//! | assign staff   | no               | no            | no             | no          | yes   |
//! | boost          | yes              | no            | no             | no          | no    |
//!
//! Blocked accounts are refused everything with `Blocked`, before any other
//! rule is looked at.

use cf_core::error::{AppError, Result};
use cf_core::models::{Issue, IssueStatus, Role, User};

/// Something a user is trying to do, with the issue it concerns.
#[derive(Debug, Clone, Copy)]
pub enum Action<'a> {
    CreateIssue,
    EditIssue(&'a Issue),
    DeleteIssue(&'a Issue),
    Upvote(&'a Issue),
    ChangeStatus(&'a Issue, IssueStatus),
    AssignStaff,
    Boost(&'a Issue),
    PurchasePremium,
    ViewAssignedIssues,
    /// User, staff and payment governance.
    Administer,
}

/// Decides whether `user` may perform `action`.
///
/// # Errors
/// `Blocked` for blocked accounts, `SelfUpvoteForbidden` for upvoting one's
/// own issue, `Forbidden` for every other refusal.
pub fn authorize(user: &User, action: Action<'_>) -> Result<()> {
    if user.is_blocked {
        return Err(AppError::Blocked);
    }
    if let Action::Upvote(issue) = action {
        if issue.submitter_id == user.id {
            return Err(AppError::SelfUpvoteForbidden);
        }
    }

    let allowed = match user.role {
        Role::Citizen => citizen_may(user, action),
        Role::Staff => staff_may(user, action),
        Role::Admin => admin_may(action),
    };
    if allowed {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

fn citizen_may(user: &User, action: Action<'_>) -> bool {
    let owns = |issue: &Issue| issue.submitter_id == user.id;
    match action {
        Action::CreateIssue | Action::PurchasePremium => true,
        Action::EditIssue(issue) | Action::DeleteIssue(issue) => {
            owns(issue) && issue.status == IssueStatus::Pending
        }
        Action::Upvote(_) => true,
        Action::Boost(issue) => owns(issue),
        Action::ChangeStatus(..)
        | Action::AssignStaff
        | Action::ViewAssignedIssues
        | Action::Administer => false,
    }
}

fn staff_may(user: &User, action: Action<'_>) -> bool {
    match action {
        Action::Upvote(_) | Action::ViewAssignedIssues => true,
        Action::ChangeStatus(issue, next) => {
            issue.assigned_staff_id == Some(user.id) && next != IssueStatus::Rejected
        }
        Action::CreateIssue
        | Action::EditIssue(_)
        | Action::DeleteIssue(_)
        | Action::AssignStaff
        | Action::Boost(_)
        | Action::PurchasePremium
        | Action::Administer => false,
    }
}

fn admin_may(action: Action<'_>) -> bool {
    match action {
        Action::DeleteIssue(_)
        | Action::Upvote(_)
        | Action::ChangeStatus(..)
        | Action::AssignStaff
        | Action::Administer => true,
        Action::CreateIssue
        | Action::EditIssue(_)
        | Action::Boost(_)
        | Action::PurchasePremium
        | Action::ViewAssignedIssues => false,
    }
}
