//! # Issue Workflow
//!
//! Creation, content edits, deletion, upvotes, assignment and status
//! transitions. Permission comes from [`authorize`]; the legal status graph
//! comes from [`IssueStatus::can_transition_to`]; atomicity comes from the
//! store's compare-and-set style methods.

use std::sync::Arc;

use cf_core::error::{AppError, Result};
use cf_core::models::{
    Actor, Issue, IssueFilter, IssuePatch, IssuePayload, IssueStatus, Role, TimelineEntry,
};
use cf_core::traits::{AssignOutcome, DeleteOutcome, QuotaCheck, Store, VoteOutcome};
use uuid::Uuid;

use crate::authz::{authorize, Action};
use crate::entitlement::EntitlementService;
use crate::session::Session;
use crate::timeline::TimelineRecorder;
use crate::StoreResultExt;

const CREATED_NOTE: &str = "Issue reported";

pub struct IssueWorkflow {
    store: Arc<dyn Store>,
    entitlements: EntitlementService,
    timeline: TimelineRecorder,
    status_attempts: u32,
}

impl IssueWorkflow {
    pub fn new(
        store: Arc<dyn Store>,
        entitlements: EntitlementService,
        timeline: TimelineRecorder,
        status_attempts: u32,
    ) -> Self {
        Self {
            store,
            entitlements,
            timeline,
            status_attempts: status_attempts.max(1),
        }
    }

    async fn load(&self, id: Uuid) -> Result<Issue> {
        self.store
            .find_issue(id)
            .await
            .or_unavailable("find issue")?
            .ok_or_else(|| AppError::issue_not_found(id))
    }

    pub async fn create(&self, session: &Session, payload: IssuePayload) -> Result<Issue> {
        let user = session.user();
        authorize(user, Action::CreateIssue)?;
        validate_payload(&payload)?;

        let quota = self.entitlements.creation_quota(user);
        let issue = Issue::new(user.id, payload);
        let created =
            TimelineRecorder::entry(issue.id, IssueStatus::Pending, CREATED_NOTE, Actor::User(user.id));

        match self
            .store
            .insert_issue_within_quota(issue.clone(), created, quota)
            .await
            .or_unavailable("insert issue")?
        {
            QuotaCheck::Inserted => {
                tracing::info!(issue_id = %issue.id, user_id = %user.id, "issue created");
                Ok(issue)
            }
            QuotaCheck::Exceeded => {
                let limit = quota.unwrap_or(self.entitlements.free_issue_limit());
                tracing::info!(user_id = %user.id, limit, "issue quota exhausted");
                Err(AppError::QuotaExceeded { limit })
            }
        }
    }

    pub async fn edit(&self, session: &Session, id: Uuid, patch: IssuePatch) -> Result<Issue> {
        let issue = self.load(id).await?;
        authorize(session.user(), Action::EditIssue(&issue))?;
        validate_patch(&patch)?;

        // A concurrent status change can take the issue out of pending
        // between the check above and the write.
        self.store
            .update_content_if_pending(id, &patch)
            .await
            .or_unavailable("update issue")?
            .ok_or(AppError::Forbidden)
    }

    pub async fn delete(&self, session: &Session, id: Uuid) -> Result<()> {
        let issue = self.load(id).await?;
        let user = session.user();
        authorize(user, Action::DeleteIssue(&issue))?;

        let only_if_pending = match user.role {
            Role::Citizen => true,
            Role::Staff | Role::Admin => false,
        };
        match self
            .store
            .delete_issue(id, only_if_pending)
            .await
            .or_unavailable("delete issue")?
        {
            DeleteOutcome::Deleted => {
                tracing::info!(issue_id = %id, user_id = %user.id, role = %user.role, "issue deleted");
                Ok(())
            }
            DeleteOutcome::NotPending => Err(AppError::Forbidden),
            DeleteOutcome::PaymentPending => Err(AppError::Conflict(
                "a boost checkout for this issue is still open".into(),
            )),
            DeleteOutcome::Missing => Err(AppError::issue_not_found(id)),
        }
    }

    pub async fn upvote(&self, session: &Session, id: Uuid) -> Result<Issue> {
        let issue = self.load(id).await?;
        let user = session.user();
        authorize(user, Action::Upvote(&issue))?;

        match self
            .store
            .record_upvote(id, user.id)
            .await
            .or_unavailable("record upvote")?
        {
            VoteOutcome::Counted(issue) => {
                tracing::debug!(issue_id = %id, user_id = %user.id, upvotes = issue.upvotes, "upvote counted");
                Ok(issue)
            }
            VoteOutcome::AlreadyVoted => Err(AppError::AlreadyVoted),
            VoteOutcome::Missing => Err(AppError::issue_not_found(id)),
        }
    }

    pub async fn assign_staff(&self, session: &Session, id: Uuid, staff_id: Uuid) -> Result<Issue> {
        authorize(session.user(), Action::AssignStaff)?;
        let issue = self.load(id).await?;
        if issue.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "cannot assign staff to a {} issue",
                issue.status
            )));
        }

        let staff = self
            .store
            .find_user(staff_id)
            .await
            .or_unavailable("find staff")?
            .ok_or_else(|| AppError::user_not_found(staff_id))?;
        if staff.role != Role::Staff {
            return Err(AppError::ValidationError("assignee must be a staff member".into()));
        }
        if staff.is_blocked {
            return Err(AppError::ValidationError("assignee is blocked".into()));
        }

        // The store re-checks the assignee, which may have been removed or
        // blocked since the lookup above.
        match self
            .store
            .assign_staff(id, staff_id)
            .await
            .or_unavailable("assign staff")?
        {
            AssignOutcome::Assigned(updated) => {
                tracing::info!(issue_id = %id, staff_id = %staff_id, "staff assigned");
                Ok(updated)
            }
            AssignOutcome::NotAssignable => Err(AppError::ValidationError(
                "assignee is no longer an active staff member".into(),
            )),
            AssignOutcome::Missing => Err(AppError::issue_not_found(id)),
        }
    }

    /// Moves an issue along the status graph and records one timeline entry.
    ///
    /// The write is a compare-and-set on the status that was validated; if
    /// another writer moved the issue first, the request is re-validated
    /// against the new status.
    ///
    /// # Errors
    /// `Forbidden` before anything else for callers without the right,
    /// `InvalidTransition` for edges not in the graph, `ValidationError` for a
    /// blank note.
    pub async fn change_status(
        &self,
        session: &Session,
        id: Uuid,
        next: IssueStatus,
        note: &str,
    ) -> Result<Issue> {
        let user = session.user();
        for attempt in 1..=self.status_attempts {
            let issue = self.load(id).await?;
            authorize(user, Action::ChangeStatus(&issue, next))?;
            if !issue.status.can_transition_to(next) {
                return Err(AppError::InvalidTransition {
                    from: issue.status,
                    to: next,
                });
            }
            if note.trim().is_empty() {
                return Err(AppError::ValidationError("a status change needs a note".into()));
            }
            self.warn_on_timeline_drift(&issue).await?;

            let entry = TimelineRecorder::entry(id, next, note, Actor::User(user.id));
            if let Some(updated) = self
                .store
                .compare_and_set_status(id, issue.status, next, entry)
                .await
                .or_unavailable("change status")?
            {
                tracing::info!(
                    issue_id = %id,
                    user_id = %user.id,
                    from = %issue.status,
                    to = %next,
                    "status changed"
                );
                return Ok(updated);
            }
            tracing::debug!(issue_id = %id, attempt, "status moved underneath, re-validating");
        }
        Err(AppError::Unavailable(format!(
            "issue {id} is being changed concurrently, try again"
        )))
    }

    async fn warn_on_timeline_drift(&self, issue: &Issue) -> Result<()> {
        let last = self.timeline.last_status(issue.id).await?;
        if last.is_some_and(|status| status != issue.status) {
            tracing::warn!(
                issue_id = %issue.id,
                status = %issue.status,
                timeline = ?last,
                "timeline disagrees with issue status"
            );
        }
        Ok(())
    }

    pub async fn details(&self, id: Uuid) -> Result<(Issue, Vec<TimelineEntry>)> {
        let issue = self.load(id).await?;
        let history = self.timeline.history(id).await?;
        Ok((issue, history))
    }

    /// Public listing; the page size is capped at [`IssueFilter::MAX_LIMIT`].
    pub async fn list(&self, filter: &IssueFilter) -> Result<Vec<Issue>> {
        self.query(&filter.clone().clamped()).await
    }

    async fn query(&self, filter: &IssueFilter) -> Result<Vec<Issue>> {
        self.store.list_issues(filter).await.or_unavailable("list issues")
    }

    pub async fn submitted_by(&self, session: &Session) -> Result<Vec<Issue>> {
        let filter = IssueFilter {
            submitter_id: Some(session.user_id()),
            limit: u32::MAX,
            ..IssueFilter::default()
        };
        self.query(&filter).await
    }

    pub async fn assigned_to(&self, session: &Session) -> Result<Vec<Issue>> {
        authorize(session.user(), Action::ViewAssignedIssues)?;
        let filter = IssueFilter {
            assigned_staff_id: Some(session.user_id()),
            limit: u32::MAX,
            ..IssueFilter::default()
        };
        self.query(&filter).await
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::ValidationError(format!("{field} must not be empty")));
    }
    Ok(())
}

fn validate_payload(payload: &IssuePayload) -> Result<()> {
    require_text("title", &payload.title)?;
    require_text("category", &payload.category)?;
    require_text("location", &payload.location)
}

fn validate_patch(patch: &IssuePatch) -> Result<()> {
    if patch.is_empty() {
        return Err(AppError::ValidationError("nothing to update".into()));
    }
    for (field, value) in [
        ("title", &patch.title),
        ("category", &patch.category),
        ("location", &patch.location),
    ] {
        if let Some(value) = value {
            require_text(field, value)?;
        }
    }
    Ok(())
}
