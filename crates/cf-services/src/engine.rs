//! # Engine
//!
//! The facade the API layer talks to. It wires the components together
//! over one store, one identity verifier and one payment gateway, and
//! exposes each operation as an async `Result`-returning method.

use std::sync::Arc;
use std::time::Duration;

use cf_core::error::Result;
use cf_core::models::{
    CheckoutSession, IdentityClaims, Issue, IssueFilter, IssuePatch, IssuePayload, IssueStatus,
    Payment, PaymentConfirmation, Role, TimelineEntry, User,
};
use cf_core::traits::{IdentityVerifier, PaymentGateway, Store};
use uuid::Uuid;

use crate::accounts::AccountAdmin;
use crate::entitlement::{EntitlementService, DEFAULT_FREE_ISSUE_LIMIT};
use crate::payments::{PaymentReconciler, PaymentSettings};
use crate::session::{Session, SessionVerifier};
use crate::timeline::TimelineRecorder;
use crate::workflow::IssueWorkflow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub free_issue_limit: u32,
    pub payments: PaymentSettings,
    pub identity_timeout: Duration,
    pub gateway_timeout: Duration,
    /// Compare-and-set rounds a status change gets under contention.
    pub status_change_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            free_issue_limit: DEFAULT_FREE_ISSUE_LIMIT,
            payments: PaymentSettings::default(),
            identity_timeout: Duration::from_secs(5),
            gateway_timeout: Duration::from_secs(10),
            status_change_attempts: 3,
        }
    }
}

pub struct Engine {
    sessions: SessionVerifier,
    entitlements: EntitlementService,
    workflow: IssueWorkflow,
    payments: PaymentReconciler,
    accounts: AccountAdmin,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        identity: Arc<dyn IdentityVerifier>,
        gateway: Arc<dyn PaymentGateway>,
        settings: EngineSettings,
    ) -> Self {
        let entitlements = EntitlementService::new(store.clone(), settings.free_issue_limit);
        let timeline = TimelineRecorder::new(store.clone());
        Self {
            sessions: SessionVerifier::new(identity, store.clone(), settings.identity_timeout),
            workflow: IssueWorkflow::new(
                store.clone(),
                entitlements.clone(),
                timeline,
                settings.status_change_attempts,
            ),
            payments: PaymentReconciler::new(
                store.clone(),
                gateway,
                entitlements.clone(),
                settings.payments,
                settings.gateway_timeout,
            ),
            accounts: AccountAdmin::new(store),
            entitlements,
        }
    }

    // ─── Identity ────────────────────────────────────────────────────

    pub async fn verify_session(&self, token: &str) -> Result<Session> {
        self.sessions.verify(token).await
    }

    pub async fn can_create_issue(&self, session: &Session) -> Result<bool> {
        self.entitlements.can_create_issue(session.user()).await
    }

    // ─── Issues ──────────────────────────────────────────────────────

    pub async fn create_issue(&self, session: &Session, payload: IssuePayload) -> Result<Issue> {
        self.workflow.create(session, payload).await
    }

    pub async fn edit_issue(&self, session: &Session, issue_id: Uuid, patch: IssuePatch) -> Result<Issue> {
        self.workflow.edit(session, issue_id, patch).await
    }

    pub async fn delete_issue(&self, session: &Session, issue_id: Uuid) -> Result<()> {
        self.workflow.delete(session, issue_id).await
    }

    pub async fn upvote(&self, session: &Session, issue_id: Uuid) -> Result<Issue> {
        self.workflow.upvote(session, issue_id).await
    }

    pub async fn assign_staff(&self, session: &Session, issue_id: Uuid, staff_id: Uuid) -> Result<Issue> {
        self.workflow.assign_staff(session, issue_id, staff_id).await
    }

    pub async fn change_status(
        &self,
        session: &Session,
        issue_id: Uuid,
        next: IssueStatus,
        note: &str,
    ) -> Result<Issue> {
        self.workflow.change_status(session, issue_id, next, note).await
    }

    pub async fn issue_details(&self, issue_id: Uuid) -> Result<(Issue, Vec<TimelineEntry>)> {
        self.workflow.details(issue_id).await
    }

    pub async fn list_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>> {
        self.workflow.list(filter).await
    }

    pub async fn my_issues(&self, session: &Session) -> Result<Vec<Issue>> {
        self.workflow.submitted_by(session).await
    }

    pub async fn assigned_issues(&self, session: &Session) -> Result<Vec<Issue>> {
        self.workflow.assigned_to(session).await
    }

    // ─── Payments ────────────────────────────────────────────────────

    pub async fn initiate_boost_checkout(&self, session: &Session, issue_id: Uuid) -> Result<CheckoutSession> {
        self.payments.initiate_boost_checkout(session, issue_id).await
    }

    pub async fn initiate_premium_checkout(&self, session: &Session) -> Result<CheckoutSession> {
        self.payments.initiate_premium_checkout(session).await
    }

    pub async fn confirm_payment(&self, external_session_id: &str) -> Result<PaymentConfirmation> {
        self.payments.confirm(external_session_id).await
    }

    pub async fn list_payments(&self, session: &Session) -> Result<Vec<Payment>> {
        self.payments.list(session).await
    }

    // ─── Administration ──────────────────────────────────────────────

    pub async fn set_blocked(&self, session: &Session, user_id: Uuid, blocked: bool) -> Result<User> {
        self.accounts.set_blocked(session, user_id, blocked).await
    }

    pub async fn provision_staff(&self, session: &Session, claims: IdentityClaims) -> Result<User> {
        self.accounts.provision_staff(session, claims).await
    }

    pub async fn remove_staff(&self, session: &Session, staff_id: Uuid) -> Result<()> {
        self.accounts.remove_staff(session, staff_id).await
    }

    pub async fn list_users(&self, session: &Session, role: Option<Role>) -> Result<Vec<User>> {
        self.accounts.list_users(session, role).await
    }
}
