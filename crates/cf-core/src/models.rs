//! # Domain Models
//!
//! These structs represent the core entities of Civic-Fix.
//! We use UUID v7 for time-ordered, globally unique identification.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raised when a stored or submitted tag does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Implements `as_str`, `Display` and `FromStr` over a fixed tag table.
macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $tag:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $tag,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag => Ok(Self::$variant),)+
                    other => Err(UnknownVariant { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

// ─── Users ───────────────────────────────────────────────────────────

/// Closed set of account roles. Adding a role forces every `match` in the
/// authorization module to be revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Citizen,
    Staff,
    Admin,
}

string_enum!(Role, "role", {
    Citizen => "citizen",
    Staff => "staff",
    Admin => "admin",
});

/// A local account, keyed by the identity provider's subject id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Stable subject id issued by the identity provider. Never changes.
    pub subject: String,
    pub role: Role,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    /// Set and cleared by administrators only.
    pub is_blocked: bool,
    /// Set by the payment reconciler only.
    pub is_premium: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Builds a fresh account for a subject seen for the first time.
    pub fn from_identity(claims: &IdentityClaims, role: Role) -> Self {
        Self {
            id: Uuid::now_v7(),
            subject: claims.subject.clone(),
            role,
            display_name: claims.display_name.clone(),
            email: claims.email.clone(),
            avatar_url: claims.avatar_url.clone(),
            is_blocked: false,
            is_premium: false,
            created_at: Utc::now(),
        }
    }
}

/// What an identity verifier extracts from a valid assertion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub subject: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

// ─── Issues ──────────────────────────────────────────────────────────

/// Lifecycle status of an issue.
///
/// ```text
/// Pending ──▶ InProgress | Working | Resolved | Closed | Rejected
/// InProgress | Working ──▶ InProgress | Working | Resolved | Closed
/// Resolved, Closed, Rejected: terminal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueStatus {
    Pending,
    InProgress,
    Working,
    Resolved,
    Closed,
    Rejected,
}

string_enum!(IssueStatus, "issue status", {
    Pending => "pending",
    InProgress => "in-progress",
    Working => "working",
    Resolved => "resolved",
    Closed => "closed",
    Rejected => "rejected",
});

impl IssueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Closed | Self::Rejected)
    }

    /// Whether the lifecycle graph has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: IssueStatus) -> bool {
        use IssueStatus::*;
        match self {
            Pending => matches!(next, InProgress | Working | Resolved | Closed | Rejected),
            InProgress | Working => matches!(next, InProgress | Working | Resolved | Closed),
            Resolved | Closed | Rejected => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

string_enum!(Priority, "priority", {
    Normal => "normal",
    High => "high",
});

/// User-supplied content of an issue. Opaque to the engine apart from
/// basic shape checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuePayload {
    pub title: String,
    pub description: String,
    pub category: String,
    pub location: String,
}

/// Partial content update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub location: Option<String>,
}

impl IssuePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.location.is_none()
    }

    pub fn apply_to(&self, issue: &mut Issue) {
        if let Some(title) = &self.title {
            issue.title = title.clone();
        }
        if let Some(description) = &self.description {
            issue.description = description.clone();
        }
        if let Some(category) = &self.category {
            issue.category = category.clone();
        }
        if let Some(location) = &self.location {
            issue.location = location.clone();
        }
    }
}

/// A reported public-infrastructure problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    /// Owning citizen. Immutable.
    pub submitter_id: Uuid,
    pub title: String,
    pub description: String,
    pub category: String,
    pub location: String,
    pub status: IssueStatus,
    pub priority: Priority,
    pub upvotes: u32,
    /// Monotonic: once true, never reverts.
    pub is_boosted: bool,
    /// Must reference a user with `Role::Staff` when present.
    pub assigned_staff_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn new(submitter_id: Uuid, payload: IssuePayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            submitter_id,
            title: payload.title,
            description: payload.description,
            category: payload.category,
            location: payload.location,
            status: IssueStatus::Pending,
            priority: Priority::Normal,
            upvotes: 0,
            is_boosted: false,
            assigned_staff_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Query over the issue list. Boosted issues sort first, then newest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueFilter {
    pub status: Option<IssueStatus>,
    pub category: Option<String>,
    pub submitter_id: Option<Uuid>,
    pub assigned_staff_id: Option<Uuid>,
    /// Case-insensitive substring match over title and location.
    pub search: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for IssueFilter {
    fn default() -> Self {
        Self {
            status: None,
            category: None,
            submitter_id: None,
            assigned_staff_id: None,
            search: None,
            limit: 20,
            offset: 0,
        }
    }
}

impl IssueFilter {
    /// Largest page a caller may request.
    pub const MAX_LIMIT: u32 = 100;

    pub fn clamped(mut self) -> Self {
        self.limit = self.limit.min(Self::MAX_LIMIT);
        self
    }

    /// Predicate form of the filter, for stores that scan in memory.
    pub fn matches(&self, issue: &Issue) -> bool {
        if self.status.is_some_and(|s| s != issue.status) {
            return false;
        }
        if self.category.as_deref().is_some_and(|c| c != issue.category) {
            return false;
        }
        if self.submitter_id.is_some_and(|id| id != issue.submitter_id) {
            return false;
        }
        if self.assigned_staff_id.is_some() && self.assigned_staff_id != issue.assigned_staff_id {
            return false;
        }
        if let Some(needle) = &self.search {
            let needle = needle.to_lowercase();
            return issue.title.to_lowercase().contains(&needle)
                || issue.location.to_lowercase().contains(&needle);
        }
        true
    }
}

// ─── Timeline ────────────────────────────────────────────────────────

/// Who caused a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Actor {
    User(Uuid),
    System,
}

impl Actor {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::User(id) => Some(*id),
            Self::System => None,
        }
    }
}

/// Immutable audit record of one status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: Uuid,
    pub issue_id: Uuid,
    /// Status the issue holds after the transition.
    pub status: IssueStatus,
    pub note: String,
    pub actor: Actor,
    pub created_at: DateTime<Utc>,
}

// ─── Payments ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentPurpose {
    Boost,
    Premium,
}

string_enum!(PaymentPurpose, "payment purpose", {
    Boost => "boost",
    Premium => "premium",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
}

string_enum!(PaymentStatus, "payment status", {
    Pending => "pending",
    Completed => "completed",
});

/// A checkout attempt and, once confirmed, its settlement record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub purpose: PaymentPurpose,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    /// Gateway checkout session id. Unique across all payments.
    pub external_session_id: String,
    pub status: PaymentStatus,
    /// Boosted issue; `None` for premium.
    pub target_issue_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Metadata attached to a checkout session so that the gateway can tell us
/// what a session was for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutMetadata {
    pub user_id: Uuid,
    pub purpose: PaymentPurpose,
    pub issue_id: Option<Uuid>,
}

/// Input to `PaymentGateway::create_checkout`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub metadata: CheckoutMetadata,
    pub success_url: String,
    pub cancel_url: String,
}

/// A created checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub session_id: String,
    pub url: String,
}

/// The gateway's view of a session at confirmation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySession {
    pub session_id: String,
    pub paid: bool,
    pub amount_total: Option<i64>,
    /// ISO currency code as reported by the gateway, lowercase.
    pub currency: Option<String>,
    pub metadata: Option<CheckoutMetadata>,
}

/// What `confirm_payment` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub purpose: PaymentPurpose,
    pub target_issue_id: Option<Uuid>,
    pub user_id: Uuid,
}
