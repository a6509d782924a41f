//! # cf-db-memory
//!
//! In-process implementation of the store ports, backed by `DashMap`.
//! Used by tests and single-node demos; state is lost on restart.
//!
//! # Locking
//! Creation takes a per-submitter async lock around count-and-insert.
//! Everything else relies on DashMap shard locks, always acquired in the
//! order payments → issues → votes/timeline, users last.

use std::sync::Arc;

use async_trait::async_trait;
use cf_core::models::{
    IdentityClaims, Issue, IssueFilter, IssuePatch, IssueStatus, Payment, PaymentPurpose,
    PaymentStatus, Priority, Role, TimelineEntry, User,
};
use cf_core::traits::{
    AssignOutcome, DeleteOutcome, IssueRepo, PaymentRepo, QuotaCheck, SettleOutcome, UserRepo,
    VoteOutcome,
};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    /// subject -> user id
    subjects: DashMap<String, Uuid>,
    issues: DashMap<Uuid, Issue>,
    votes: DashMap<(Uuid, Uuid), ()>,
    timelines: DashMap<Uuid, Vec<TimelineEntry>>,
    /// external session id -> payment
    payments: DashMap<String, Payment>,
    submitter_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// submitter id -> issues ever filed
    filed: DashMap<Uuid, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn submitter_lock(&self, submitter_id: Uuid) -> Arc<Mutex<()>> {
        self.submitter_locks.entry(submitter_id).or_default().clone()
    }

    fn filed(&self, submitter_id: Uuid) -> u64 {
        self.filed.get(&submitter_id).map_or(0, |n| *n)
    }

    fn boost_pending_for(&self, issue_id: Uuid) -> bool {
        self.payments.iter().any(|p| {
            p.purpose == PaymentPurpose::Boost
                && p.status == PaymentStatus::Pending
                && p.target_issue_id == Some(issue_id)
        })
    }

    /// Returns `false` when the target is gone and nothing was changed.
    fn apply_effect(&self, payment: &Payment) -> bool {
        match payment.purpose {
            PaymentPurpose::Boost => {
                let Some(issue_id) = payment.target_issue_id else {
                    return false;
                };
                let Some(mut issue) = self.issues.get_mut(&issue_id) else {
                    return false;
                };
                issue.is_boosted = true;
                issue.priority = Priority::High;
                issue.updated_at = Utc::now();
                true
            }
            PaymentPurpose::Premium => {
                let Some(mut user) = self.users.get_mut(&payment.user_id) else {
                    return false;
                };
                user.is_premium = true;
                true
            }
        }
    }
}

#[async_trait]
impl UserRepo for MemoryStore {
    async fn find_user(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn find_user_by_subject(&self, subject: &str) -> anyhow::Result<Option<User>> {
        let Some(id) = self.subjects.get(subject).map(|id| *id) else {
            return Ok(None);
        };
        self.find_user(id).await
    }

    async fn upsert_identity(&self, claims: &IdentityClaims) -> anyhow::Result<User> {
        match self.subjects.entry(claims.subject.clone()) {
            Entry::Occupied(slot) => {
                let id = *slot.get();
                let mut user = self
                    .users
                    .get_mut(&id)
                    .ok_or_else(|| anyhow::anyhow!("subject index points at missing user {id}"))?;
                user.display_name = claims.display_name.clone();
                user.email = claims.email.clone();
                user.avatar_url = claims.avatar_url.clone();
                Ok(user.clone())
            }
            Entry::Vacant(slot) => {
                let user = User::from_identity(claims, Role::Citizen);
                self.users.insert(user.id, user.clone());
                slot.insert(user.id);
                Ok(user)
            }
        }
    }

    async fn insert_user(&self, user: User) -> anyhow::Result<bool> {
        match self.subjects.entry(user.subject.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(user.id);
                self.users.insert(user.id, user);
                Ok(true)
            }
        }
    }

    async fn set_blocked(&self, id: Uuid, blocked: bool) -> anyhow::Result<Option<User>> {
        Ok(self.users.get_mut(&id).map(|mut user| {
            user.is_blocked = blocked;
            user.clone()
        }))
    }

    async fn delete_staff(&self, id: Uuid) -> anyhow::Result<bool> {
        let Some((_, staff)) = self.users.remove_if(&id, |_, u| u.role == Role::Staff) else {
            return Ok(false);
        };
        self.subjects.remove(&staff.subject);
        for mut issue in self.issues.iter_mut() {
            if issue.assigned_staff_id == Some(id) {
                issue.assigned_staff_id = None;
            }
        }
        Ok(true)
    }

    async fn list_users(&self, role: Option<Role>) -> anyhow::Result<Vec<User>> {
        let mut users: Vec<User> = self
            .users
            .iter()
            .filter(|u| role.map_or(true, |r| r == u.role))
            .map(|u| u.clone())
            .collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }
}

#[async_trait]
impl IssueRepo for MemoryStore {
    async fn insert_issue_within_quota(
        &self,
        issue: Issue,
        created: TimelineEntry,
        quota: Option<u32>,
    ) -> anyhow::Result<QuotaCheck> {
        let lock = self.submitter_lock(issue.submitter_id);
        let _guard = lock.lock().await;

        if let Some(limit) = quota {
            if self.filed(issue.submitter_id) >= u64::from(limit) {
                return Ok(QuotaCheck::Exceeded);
            }
        }
        *self.filed.entry(issue.submitter_id).or_default() += 1;
        self.timelines.insert(issue.id, vec![created]);
        self.issues.insert(issue.id, issue);
        Ok(QuotaCheck::Inserted)
    }

    async fn find_issue(&self, id: Uuid) -> anyhow::Result<Option<Issue>> {
        Ok(self.issues.get(&id).map(|i| i.clone()))
    }

    async fn issues_filed_by(&self, submitter_id: Uuid) -> anyhow::Result<u64> {
        Ok(self.filed(submitter_id))
    }

    async fn list_issues(&self, filter: &IssueFilter) -> anyhow::Result<Vec<Issue>> {
        let mut issues: Vec<Issue> = self
            .issues
            .iter()
            .filter(|i| filter.matches(i))
            .map(|i| i.clone())
            .collect();
        issues.sort_by(|a, b| {
            b.is_boosted
                .cmp(&a.is_boosted)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(issues
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn update_content_if_pending(
        &self,
        id: Uuid,
        patch: &IssuePatch,
    ) -> anyhow::Result<Option<Issue>> {
        let Some(mut issue) = self.issues.get_mut(&id) else {
            return Ok(None);
        };
        if issue.status != IssueStatus::Pending {
            return Ok(None);
        }
        patch.apply_to(&mut issue);
        issue.updated_at = Utc::now();
        Ok(Some(issue.clone()))
    }

    /// The payment scan runs before the issue shard is locked, keeping the
    /// payments → issues lock order. A checkout opened in that gap is caught
    /// at settlement as `TargetMissing`.
    async fn delete_issue(&self, id: Uuid, only_if_pending: bool) -> anyhow::Result<DeleteOutcome> {
        if self.boost_pending_for(id) {
            return Ok(if self.issues.contains_key(&id) {
                DeleteOutcome::PaymentPending
            } else {
                DeleteOutcome::Missing
            });
        }
        let removed = self
            .issues
            .remove_if(&id, |_, issue| !only_if_pending || issue.status == IssueStatus::Pending);
        if removed.is_none() {
            return Ok(if self.issues.contains_key(&id) {
                DeleteOutcome::NotPending
            } else {
                DeleteOutcome::Missing
            });
        }
        self.timelines.remove(&id);
        self.votes.retain(|(issue_id, _), _| *issue_id != id);
        Ok(DeleteOutcome::Deleted)
    }

    async fn record_upvote(&self, id: Uuid, voter_id: Uuid) -> anyhow::Result<VoteOutcome> {
        let Some(mut issue) = self.issues.get_mut(&id) else {
            return Ok(VoteOutcome::Missing);
        };
        match self.votes.entry((id, voter_id)) {
            Entry::Occupied(_) => Ok(VoteOutcome::AlreadyVoted),
            Entry::Vacant(slot) => {
                slot.insert(());
                issue.upvotes += 1;
                Ok(VoteOutcome::Counted(issue.clone()))
            }
        }
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: IssueStatus,
        next: IssueStatus,
        entry: TimelineEntry,
    ) -> anyhow::Result<Option<Issue>> {
        let Some(mut issue) = self.issues.get_mut(&id) else {
            return Ok(None);
        };
        if issue.status != expected {
            return Ok(None);
        }
        issue.status = next;
        issue.updated_at = entry.created_at;
        self.timelines.entry(id).or_default().push(entry);
        Ok(Some(issue.clone()))
    }

    /// The assignee is checked while the issue entry is held, so a
    /// concurrent `delete_staff` either sees the assignment and clears it or
    /// has already removed the account.
    async fn assign_staff(&self, id: Uuid, staff_id: Uuid) -> anyhow::Result<AssignOutcome> {
        let Some(mut issue) = self.issues.get_mut(&id) else {
            return Ok(AssignOutcome::Missing);
        };
        let assignable = self
            .users
            .get(&staff_id)
            .is_some_and(|u| u.role == Role::Staff && !u.is_blocked);
        if !assignable {
            return Ok(AssignOutcome::NotAssignable);
        }
        issue.assigned_staff_id = Some(staff_id);
        issue.updated_at = Utc::now();
        Ok(AssignOutcome::Assigned(issue.clone()))
    }

    async fn timeline(&self, issue_id: Uuid) -> anyhow::Result<Vec<TimelineEntry>> {
        Ok(self
            .timelines
            .get(&issue_id)
            .map(|entries| entries.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl PaymentRepo for MemoryStore {
    async fn insert_payment(&self, payment: Payment) -> anyhow::Result<bool> {
        match self.payments.entry(payment.external_session_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(payment);
                Ok(true)
            }
        }
    }

    async fn find_payment_by_session(&self, session_id: &str) -> anyhow::Result<Option<Payment>> {
        Ok(self.payments.get(session_id).map(|p| p.clone()))
    }

    async fn settle_payment(&self, session_id: &str) -> anyhow::Result<SettleOutcome> {
        let Some(mut payment) = self.payments.get_mut(session_id) else {
            return Ok(SettleOutcome::Missing);
        };
        if payment.status == PaymentStatus::Completed {
            return Ok(SettleOutcome::AlreadySettled(payment.clone()));
        }
        if !self.apply_effect(&payment) {
            return Ok(SettleOutcome::TargetMissing(payment.clone()));
        }
        payment.status = PaymentStatus::Completed;
        payment.completed_at = Some(Utc::now());
        Ok(SettleOutcome::Applied(payment.clone()))
    }

    async fn list_payments(&self) -> anyhow::Result<Vec<Payment>> {
        let mut payments: Vec<Payment> = self.payments.iter().map(|p| p.clone()).collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::models::{Actor, IssuePayload};

    async fn citizen(store: &MemoryStore, subject: &str) -> User {
        let user = User::from_identity(
            &IdentityClaims {
                subject: subject.into(),
                ..Default::default()
            },
            Role::Citizen,
        );
        assert!(store.insert_user(user.clone()).await.unwrap());
        user
    }

    fn issue_for(user: &User) -> (Issue, TimelineEntry) {
        let issue = Issue::new(
            user.id,
            IssuePayload {
                title: "Pothole".into(),
                description: "Deep".into(),
                category: "road".into(),
                location: "Elm St".into(),
            },
        );
        let entry = TimelineEntry {
            id: Uuid::now_v7(),
            issue_id: issue.id,
            status: IssueStatus::Pending,
            note: "reported".into(),
            actor: Actor::User(user.id),
            created_at: Utc::now(),
        };
        (issue, entry)
    }

    #[tokio::test]
    async fn quota_is_enforced_at_insert() {
        let store = MemoryStore::new();
        let user = citizen(&store, "sub-1").await;
        for _ in 0..2 {
            let (issue, entry) = issue_for(&user);
            let res = store.insert_issue_within_quota(issue, entry, Some(2)).await.unwrap();
            assert_eq!(res, QuotaCheck::Inserted);
        }
        let (issue, entry) = issue_for(&user);
        let res = store.insert_issue_within_quota(issue, entry, Some(2)).await.unwrap();
        assert_eq!(res, QuotaCheck::Exceeded);
        assert_eq!(store.issues_filed_by(user.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_creation_never_overshoots_quota() {
        let store = Arc::new(MemoryStore::new());
        let user = citizen(&store, "racer").await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let (issue, entry) = issue_for(&user);
            handles.push(tokio::spawn(async move {
                store.insert_issue_within_quota(issue, entry, Some(3)).await.unwrap()
            }));
        }
        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == QuotaCheck::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 3);
        assert_eq!(store.issues_filed_by(user.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn second_vote_from_same_voter_is_not_counted() {
        let store = MemoryStore::new();
        let owner = User::from_identity(&IdentityClaims::default(), Role::Citizen);
        let (issue, entry) = issue_for(&owner);
        let id = issue.id;
        store.insert_issue_within_quota(issue, entry, None).await.unwrap();

        let voter = Uuid::now_v7();
        assert!(matches!(
            store.record_upvote(id, voter).await.unwrap(),
            VoteOutcome::Counted(ref i) if i.upvotes == 1
        ));
        assert_eq!(store.record_upvote(id, voter).await.unwrap(), VoteOutcome::AlreadyVoted);
        assert_eq!(store.find_issue(id).await.unwrap().unwrap().upvotes, 1);
        assert_eq!(
            store.record_upvote(Uuid::now_v7(), voter).await.unwrap(),
            VoteOutcome::Missing
        );
    }

    #[tokio::test]
    async fn deleting_staff_clears_assignments() {
        let store = MemoryStore::new();
        let owner = User::from_identity(&IdentityClaims::default(), Role::Citizen);
        let staff = User::from_identity(
            &IdentityClaims {
                subject: "staff-1".into(),
                ..Default::default()
            },
            Role::Staff,
        );
        store.insert_user(staff.clone()).await.unwrap();
        let (issue, entry) = issue_for(&owner);
        let id = issue.id;
        store.insert_issue_within_quota(issue, entry, None).await.unwrap();
        store.assign_staff(id, staff.id).await.unwrap();

        assert!(store.delete_staff(staff.id).await.unwrap());
        assert!(store.find_user(staff.id).await.unwrap().is_none());
        assert!(store.find_user_by_subject("staff-1").await.unwrap().is_none());
        assert_eq!(store.find_issue(id).await.unwrap().unwrap().assigned_staff_id, None);
        assert!(!store.delete_staff(owner.id).await.unwrap());
    }

    fn boost_payment(owner: &User, issue_id: Uuid, session: &str) -> Payment {
        Payment {
            id: Uuid::now_v7(),
            user_id: owner.id,
            purpose: PaymentPurpose::Boost,
            amount: 100,
            currency: "usd".into(),
            external_session_id: session.into(),
            status: PaymentStatus::Pending,
            target_issue_id: Some(issue_id),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn open_boost_checkout_blocks_deletion() {
        let store = MemoryStore::new();
        let owner = citizen(&store, "owner").await;
        let (issue, entry) = issue_for(&owner);
        let id = issue.id;
        store.insert_issue_within_quota(issue, entry, None).await.unwrap();
        store.insert_payment(boost_payment(&owner, id, "sess_b")).await.unwrap();

        assert_eq!(store.delete_issue(id, true).await.unwrap(), DeleteOutcome::PaymentPending);
        assert!(store.find_issue(id).await.unwrap().is_some());

        assert!(matches!(store.settle_payment("sess_b").await.unwrap(), SettleOutcome::Applied(_)));
        assert_eq!(store.delete_issue(id, false).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.delete_issue(id, false).await.unwrap(), DeleteOutcome::Missing);
    }

    #[tokio::test]
    async fn boost_for_a_vanished_issue_stays_pending() {
        let store = MemoryStore::new();
        let owner = citizen(&store, "owner").await;
        store
            .insert_payment(boost_payment(&owner, Uuid::now_v7(), "sess_gone"))
            .await
            .unwrap();

        let outcome = store.settle_payment("sess_gone").await.unwrap();
        assert!(matches!(outcome, SettleOutcome::TargetMissing(ref p) if p.status == PaymentStatus::Pending));
        let stored = store.find_payment_by_session("sess_gone").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert!(stored.completed_at.is_none());
    }

    #[tokio::test]
    async fn assignment_requires_an_active_staff_account_at_write_time() {
        let store = MemoryStore::new();
        let owner = citizen(&store, "owner").await;
        let staff = User::from_identity(
            &IdentityClaims {
                subject: "staff-1".into(),
                ..Default::default()
            },
            Role::Staff,
        );
        store.insert_user(staff.clone()).await.unwrap();
        let (issue, entry) = issue_for(&owner);
        let id = issue.id;
        store.insert_issue_within_quota(issue, entry, None).await.unwrap();

        assert_eq!(store.assign_staff(id, owner.id).await.unwrap(), AssignOutcome::NotAssignable);
        store.set_blocked(staff.id, true).await.unwrap();
        assert_eq!(store.assign_staff(id, staff.id).await.unwrap(), AssignOutcome::NotAssignable);
        store.set_blocked(staff.id, false).await.unwrap();
        assert!(matches!(
            store.assign_staff(id, staff.id).await.unwrap(),
            AssignOutcome::Assigned(ref i) if i.assigned_staff_id == Some(staff.id)
        ));

        store.delete_staff(staff.id).await.unwrap();
        assert_eq!(store.assign_staff(id, staff.id).await.unwrap(), AssignOutcome::NotAssignable);
        assert_eq!(
            store.assign_staff(Uuid::now_v7(), staff.id).await.unwrap(),
            AssignOutcome::Missing
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_votes_from_one_voter_count_once() {
        let store = Arc::new(MemoryStore::new());
        let owner = citizen(&store, "owner").await;
        let (issue, entry) = issue_for(&owner);
        let id = issue.id;
        store.insert_issue_within_quota(issue, entry, None).await.unwrap();

        let voter = Uuid::now_v7();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.record_upvote(id, voter).await.unwrap() }));
        }
        let mut counted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), VoteOutcome::Counted(_)) {
                counted += 1;
            }
        }
        assert_eq!(counted, 1);
        assert_eq!(store.find_issue(id).await.unwrap().unwrap().upvotes, 1);
    }
}
