//! # Core Traits (Ports)
//!
//! Any plugin must implement these traits to be used by the binary.
//!
//! Store methods that read-then-write are single calls so that each adapter
//! can make them atomic (a guarded SQL statement, a lock, a unique key).
//! Store failures come back as `anyhow::Error`; the engine treats every one
//! of them as the backing store being unavailable.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{GatewayError, IdentityError};
use crate::models::{
    CheckoutRequest, CheckoutSession, GatewaySession, IdentityClaims, Issue, IssueFilter,
    IssuePatch, IssueStatus, Payment, Role, TimelineEntry, User,
};

/// Result of an atomic count-and-insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCheck {
    Inserted,
    Exceeded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VoteOutcome {
    Counted(Issue),
    AlreadyVoted,
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    /// This call flipped the payment to completed and applied its effect.
    Applied(Payment),
    /// Another call got there first; nothing was applied.
    AlreadySettled(Payment),
    /// The boosted issue or the upgraded account no longer exists. The
    /// payment stays pending.
    TargetMissing(Payment),
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Refused because the issue has left `pending`.
    NotPending,
    /// Refused because a boost checkout for the issue is still open.
    PaymentPending,
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssignOutcome {
    Assigned(Issue),
    /// The assignee is not an active staff account at write time.
    NotAssignable,
    Missing,
}

/// Persistence contract for user accounts.
#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn find_user(&self, id: Uuid) -> anyhow::Result<Option<User>>;
    async fn find_user_by_subject(&self, subject: &str) -> anyhow::Result<Option<User>>;

    /// Creates a citizen for an unseen subject, otherwise refreshes the
    /// display profile of the existing account. Role and flags are untouched.
    async fn upsert_identity(&self, claims: &IdentityClaims) -> anyhow::Result<User>;

    /// Inserts a fully formed account. Returns `false` when the subject exists.
    async fn insert_user(&self, user: User) -> anyhow::Result<bool>;

    async fn set_blocked(&self, id: Uuid, blocked: bool) -> anyhow::Result<Option<User>>;

    /// Hard-deletes a staff account and clears it from every issue it was
    /// assigned to. Returns `false` if no staff account has this id.
    async fn delete_staff(&self, id: Uuid) -> anyhow::Result<bool>;

    async fn list_users(&self, role: Option<Role>) -> anyhow::Result<Vec<User>>;
}

/// Persistence contract for issues, votes and the status timeline.
#[async_trait]
pub trait IssueRepo: Send + Sync {
    /// Inserts `issue` with its creation entry, provided the submitter has
    /// filed fewer than `quota` issues so far. `None` means unlimited. Every
    /// accepted insert counts towards the submitter's lifetime total, even
    /// when the issue is later deleted.
    async fn insert_issue_within_quota(
        &self,
        issue: Issue,
        created: TimelineEntry,
        quota: Option<u32>,
    ) -> anyhow::Result<QuotaCheck>;

    async fn find_issue(&self, id: Uuid) -> anyhow::Result<Option<Issue>>;
    /// Lifetime number of issues filed by `submitter_id`.
    async fn issues_filed_by(&self, submitter_id: Uuid) -> anyhow::Result<u64>;
    async fn list_issues(&self, filter: &IssueFilter) -> anyhow::Result<Vec<Issue>>;

    /// Applies `patch` only while the issue is still pending.
    async fn update_content_if_pending(
        &self,
        id: Uuid,
        patch: &IssuePatch,
    ) -> anyhow::Result<Option<Issue>>;

    /// Removes the issue with its votes and timeline. With `only_if_pending`
    /// the delete is skipped unless the issue is pending. An issue with a
    /// pending boost payment is never deleted.
    async fn delete_issue(&self, id: Uuid, only_if_pending: bool) -> anyhow::Result<DeleteOutcome>;

    /// Counts one vote per (issue, voter).
    async fn record_upvote(&self, id: Uuid, voter_id: Uuid) -> anyhow::Result<VoteOutcome>;

    /// Moves the issue from `expected` to `next` and appends `entry`, or does
    /// nothing and returns `None` if the issue is no longer in `expected`.
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: IssueStatus,
        next: IssueStatus,
        entry: TimelineEntry,
    ) -> anyhow::Result<Option<Issue>>;

    /// Assigns only if `staff_id` is an unblocked staff account when the
    /// write happens.
    async fn assign_staff(&self, id: Uuid, staff_id: Uuid) -> anyhow::Result<AssignOutcome>;

    /// Entries oldest first.
    async fn timeline(&self, issue_id: Uuid) -> anyhow::Result<Vec<TimelineEntry>>;
}

/// Persistence contract for payments.
#[async_trait]
pub trait PaymentRepo: Send + Sync {
    /// Returns `false` when a payment with the same external session exists.
    async fn insert_payment(&self, payment: Payment) -> anyhow::Result<bool>;

    async fn find_payment_by_session(&self, session_id: &str) -> anyhow::Result<Option<Payment>>;

    /// Flips a pending payment to completed and, in the same atomic unit,
    /// marks the target issue boosted or the user premium.
    async fn settle_payment(&self, session_id: &str) -> anyhow::Result<SettleOutcome>;

    async fn list_payments(&self) -> anyhow::Result<Vec<Payment>>;
}

/// Everything the engine needs from persistence.
pub trait Store: UserRepo + IssueRepo + PaymentRepo {}

impl<T: UserRepo + IssueRepo + PaymentRepo> Store for T {}

/// Validates identity-provider assertions.
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<IdentityClaims, IdentityError>;
}

/// Client for the external payment gateway.
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError>;

    /// `Ok(None)` when the gateway has no such session.
    async fn fetch_session(&self, session_id: &str) -> Result<Option<GatewaySession>, GatewayError>;
}
