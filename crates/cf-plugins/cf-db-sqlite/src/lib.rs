//! # cf-db-sqlite Implementation
//!
//! This module implements the data mapping between the SQLite relational model
//! and the `cf-core` domain models.
//!
//! Every read-then-write port method is either one guarded statement
//! (`INSERT ... SELECT ... WHERE`, `UPDATE ... WHERE status = ?`) or a
//! transaction whose first statement is that guarded write, so SQLite's
//! single-writer lock makes the check and the write indivisible.

use std::str::FromStr;

use async_trait::async_trait;
use cf_core::models::{
    Actor, IdentityClaims, Issue, IssueFilter, IssuePatch, IssueStatus, Payment, PaymentPurpose,
    PaymentStatus, Priority, Role, TimelineEntry, User,
};
use cf_core::traits::{
    AssignOutcome, DeleteOutcome, IssueRepo, PaymentRepo, QuotaCheck, SettleOutcome, UserRepo,
    VoteOutcome,
};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use uuid::Uuid;

const SCHEMA: &str = include_str!("schema.sql");

macro_rules! user_columns {
    () => {
        "id, subject, role, display_name, email, avatar_url, is_blocked, is_premium, created_at"
    };
}

macro_rules! issue_columns {
    () => {
        "id, submitter_id, title, description, category, location, status, priority, upvotes, \
         is_boosted, assigned_staff_id, created_at, updated_at"
    };
}

macro_rules! payment_columns {
    () => {
        "id, user_id, purpose, amount, currency, external_session_id, status, target_issue_id, \
         created_at, completed_at"
    };
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `url` and applies the schema.
    ///
    /// In-memory URLs get a single pinned connection; every connection to
    /// `sqlite::memory:` would otherwise see its own empty database.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(url, "sqlite store ready");
        Ok(store)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Creates the account for `claims` if needed and sets its role.
    ///
    /// Privileged roles are never granted through sign-in; this is the
    /// out-of-band path used by the seed tool. An account that stops being
    /// staff loses its issue assignments in the same transaction.
    pub async fn ensure_role(&self, claims: &IdentityClaims, role: Role) -> anyhow::Result<User> {
        let mut tx = self.pool.begin().await?;
        upsert_identity_in(&mut tx, claims).await?;
        let row = sqlx::query(concat!(
            "UPDATE users SET role = ? WHERE subject = ? RETURNING ",
            user_columns!()
        ))
        .bind(role.as_str())
        .bind(&claims.subject)
        .fetch_one(&mut *tx)
        .await?;
        let user = user_from_row(&row)?;
        if user.role != Role::Staff {
            let cleared = sqlx::query(
                "UPDATE issues SET assigned_staff_id = NULL, updated_at = ? WHERE assigned_staff_id = ?",
            )
            .bind(Utc::now())
            .bind(user.id)
            .execute(&mut *tx)
            .await?;
            if cleared.rows_affected() > 0 {
                tracing::info!(user_id = %user.id, role = %user.role, unassigned = cleared.rows_affected(), "assignments cleared on role change");
            }
        }
        tx.commit().await?;
        Ok(user)
    }
}

/// Escapes `LIKE` wildcards so `search` matches as a plain substring.
fn like_pattern(search: &str) -> String {
    let mut pattern = String::with_capacity(search.len() + 2);
    pattern.push('%');
    for c in search.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

async fn upsert_identity_in(conn: &mut SqliteConnection, claims: &IdentityClaims) -> anyhow::Result<User> {
    let fresh = User::from_identity(claims, Role::Citizen);
    let row = sqlx::query(concat!(
        "INSERT INTO users (id, subject, role, display_name, email, avatar_url, is_blocked, is_premium, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?) \
         ON CONFLICT(subject) DO UPDATE SET \
             display_name = excluded.display_name, \
             email = excluded.email, \
             avatar_url = excluded.avatar_url \
         RETURNING ",
        user_columns!()
    ))
    .bind(fresh.id)
    .bind(&fresh.subject)
    .bind(fresh.role.as_str())
    .bind(&fresh.display_name)
    .bind(&fresh.email)
    .bind(&fresh.avatar_url)
    .bind(fresh.created_at)
    .fetch_one(&mut *conn)
    .await?;
    user_from_row(&row)
}

async fn insert_timeline_entry(conn: &mut SqliteConnection, entry: &TimelineEntry) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO timeline (id, issue_id, status, note, actor_id, created_at) VALUES (?, ?, ?, ?, ?, ?)")
        .bind(entry.id)
        .bind(entry.issue_id)
        .bind(entry.status.as_str())
        .bind(&entry.note)
        .bind(entry.actor.user_id())
        .bind(entry.created_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ─── Row mapping ─────────────────────────────────────────────────────

fn user_from_row(row: &SqliteRow) -> anyhow::Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        subject: row.try_get("subject")?,
        role: row.try_get::<String, _>("role")?.parse()?,
        display_name: row.try_get("display_name")?,
        email: row.try_get("email")?,
        avatar_url: row.try_get("avatar_url")?,
        is_blocked: row.try_get("is_blocked")?,
        is_premium: row.try_get("is_premium")?,
        created_at: row.try_get("created_at")?,
    })
}

fn issue_from_row(row: &SqliteRow) -> anyhow::Result<Issue> {
    Ok(Issue {
        id: row.try_get("id")?,
        submitter_id: row.try_get("submitter_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        location: row.try_get("location")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        priority: row.try_get::<String, _>("priority")?.parse()?,
        upvotes: u32::try_from(row.try_get::<i64, _>("upvotes")?)?,
        is_boosted: row.try_get("is_boosted")?,
        assigned_staff_id: row.try_get("assigned_staff_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn timeline_from_row(row: &SqliteRow) -> anyhow::Result<TimelineEntry> {
    let actor = match row.try_get::<Option<Uuid>, _>("actor_id")? {
        Some(id) => Actor::User(id),
        None => Actor::System,
    };
    Ok(TimelineEntry {
        id: row.try_get("id")?,
        issue_id: row.try_get("issue_id")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        note: row.try_get("note")?,
        actor,
        created_at: row.try_get("created_at")?,
    })
}

fn payment_from_row(row: &SqliteRow) -> anyhow::Result<Payment> {
    Ok(Payment {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        purpose: row.try_get::<String, _>("purpose")?.parse()?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        external_session_id: row.try_get("external_session_id")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        target_issue_id: row.try_get("target_issue_id")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn collect<T>(rows: Vec<SqliteRow>, map: fn(&SqliteRow) -> anyhow::Result<T>) -> anyhow::Result<Vec<T>> {
    rows.iter().map(map).collect()
}

// ─── Users ───────────────────────────────────────────────────────────

#[async_trait]
impl UserRepo for SqliteStore {
    async fn find_user(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let row = sqlx::query(concat!("SELECT ", user_columns!(), " FROM users WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_subject(&self, subject: &str) -> anyhow::Result<Option<User>> {
        let row = sqlx::query(concat!("SELECT ", user_columns!(), " FROM users WHERE subject = ?"))
            .bind(subject)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn upsert_identity(&self, claims: &IdentityClaims) -> anyhow::Result<User> {
        let mut conn = self.pool.acquire().await?;
        upsert_identity_in(&mut conn, claims).await
    }

    async fn insert_user(&self, user: User) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO users (id, subject, role, display_name, email, avatar_url, is_blocked, is_premium, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind(&user.subject)
        .bind(user.role.as_str())
        .bind(&user.display_name)
        .bind(&user.email)
        .bind(&user.avatar_url)
        .bind(user.is_blocked)
        .bind(user.is_premium)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_blocked(&self, id: Uuid, blocked: bool) -> anyhow::Result<Option<User>> {
        let row = sqlx::query(concat!(
            "UPDATE users SET is_blocked = ? WHERE id = ? RETURNING ",
            user_columns!()
        ))
        .bind(blocked)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn delete_staff(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM users WHERE id = ? AND role = ?")
            .bind(id)
            .bind(Role::Staff.as_str())
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Ok(false);
        }

        let cleared = sqlx::query(
            "UPDATE issues SET assigned_staff_id = NULL, updated_at = ? WHERE assigned_staff_id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::debug!(staff_id = %id, unassigned = cleared.rows_affected(), "staff row deleted");
        Ok(true)
    }

    async fn list_users(&self, role: Option<Role>) -> anyhow::Result<Vec<User>> {
        let role = role.map(|r| r.as_str());
        let rows = sqlx::query(concat!(
            "SELECT ",
            user_columns!(),
            " FROM users WHERE ? IS NULL OR role = ? ORDER BY created_at ASC"
        ))
        .bind(role)
        .bind(role)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, user_from_row)
    }
}

// ─── Issues ──────────────────────────────────────────────────────────

#[async_trait]
impl IssueRepo for SqliteStore {
    /// The guarded counter bump takes the write lock first, so a
    /// concurrent insert for the same submitter sees the new total.
    async fn insert_issue_within_quota(
        &self,
        issue: Issue,
        created: TimelineEntry,
        quota: Option<u32>,
    ) -> anyhow::Result<QuotaCheck> {
        let quota = quota.map(i64::from);
        let mut tx = self.pool.begin().await?;

        let counted = sqlx::query(
            "UPDATE users SET issues_filed = issues_filed + 1 \
             WHERE id = ? AND (? IS NULL OR issues_filed < ?)",
        )
        .bind(issue.submitter_id)
        .bind(quota)
        .bind(quota)
        .execute(&mut *tx)
        .await?;
        if quota.is_some() && counted.rows_affected() == 0 {
            return Ok(QuotaCheck::Exceeded);
        }

        sqlx::query(
            "INSERT INTO issues (id, submitter_id, title, description, category, location, status, priority, upvotes, is_boosted, assigned_staff_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(issue.id)
        .bind(issue.submitter_id)
        .bind(&issue.title)
        .bind(&issue.description)
        .bind(&issue.category)
        .bind(&issue.location)
        .bind(issue.status.as_str())
        .bind(issue.priority.as_str())
        .bind(i64::from(issue.upvotes))
        .bind(issue.is_boosted)
        .bind(issue.assigned_staff_id)
        .bind(issue.created_at)
        .bind(issue.updated_at)
        .execute(&mut *tx)
        .await?;

        insert_timeline_entry(&mut tx, &created).await?;
        tx.commit().await?;
        Ok(QuotaCheck::Inserted)
    }

    async fn find_issue(&self, id: Uuid) -> anyhow::Result<Option<Issue>> {
        let row = sqlx::query(concat!("SELECT ", issue_columns!(), " FROM issues WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(issue_from_row).transpose()
    }

    async fn issues_filed_by(&self, submitter_id: Uuid) -> anyhow::Result<u64> {
        let count: Option<i64> = sqlx::query_scalar("SELECT issues_filed FROM users WHERE id = ?")
            .bind(submitter_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(u64::try_from(count.unwrap_or(0))?)
    }

    async fn list_issues(&self, filter: &IssueFilter) -> anyhow::Result<Vec<Issue>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(concat!("SELECT ", issue_columns!(), " FROM issues WHERE 1 = 1"));
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(category) = &filter.category {
            query.push(" AND category = ").push_bind(category.clone());
        }
        if let Some(submitter_id) = filter.submitter_id {
            query.push(" AND submitter_id = ").push_bind(submitter_id);
        }
        if let Some(staff_id) = filter.assigned_staff_id {
            query.push(" AND assigned_staff_id = ").push_bind(staff_id);
        }
        if let Some(search) = &filter.search {
            let pattern = like_pattern(search);
            query
                .push(" AND (title LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR location LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }
        query
            .push(" ORDER BY is_boosted DESC, created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(filter.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset));

        let rows = query.build().fetch_all(&self.pool).await?;
        collect(rows, issue_from_row)
    }

    async fn update_content_if_pending(
        &self,
        id: Uuid,
        patch: &IssuePatch,
    ) -> anyhow::Result<Option<Issue>> {
        let row = sqlx::query(concat!(
            "UPDATE issues SET \
                 title = COALESCE(?, title), \
                 description = COALESCE(?, description), \
                 category = COALESCE(?, category), \
                 location = COALESCE(?, location), \
                 updated_at = ? \
             WHERE id = ? AND status = ? RETURNING ",
            issue_columns!()
        ))
        .bind(&patch.title)
        .bind(&patch.description)
        .bind(&patch.category)
        .bind(&patch.location)
        .bind(Utc::now())
        .bind(id)
        .bind(IssueStatus::Pending.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(issue_from_row).transpose()
    }

    async fn delete_issue(&self, id: Uuid, only_if_pending: bool) -> anyhow::Result<DeleteOutcome> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(
            "DELETE FROM issues WHERE id = ? AND (? = 0 OR status = ?) \
             AND NOT EXISTS (SELECT 1 FROM payments \
                 WHERE target_issue_id = ? AND purpose = ? AND status = ?)",
        )
        .bind(id)
        .bind(only_if_pending)
        .bind(IssueStatus::Pending.as_str())
        .bind(id)
        .bind(PaymentPurpose::Boost.as_str())
        .bind(PaymentStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;
        if deleted.rows_affected() == 0 {
            let status: Option<String> = sqlx::query_scalar("SELECT status FROM issues WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(status) = status else {
                return Ok(DeleteOutcome::Missing);
            };
            if only_if_pending && status != IssueStatus::Pending.as_str() {
                return Ok(DeleteOutcome::NotPending);
            }
            return Ok(DeleteOutcome::PaymentPending);
        }

        sqlx::query("DELETE FROM issue_votes WHERE issue_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM timeline WHERE issue_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(DeleteOutcome::Deleted)
    }

    async fn record_upvote(&self, id: Uuid, voter_id: Uuid) -> anyhow::Result<VoteOutcome> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO issue_votes (issue_id, voter_id, created_at) \
             SELECT ?, ?, ? WHERE EXISTS (SELECT 1 FROM issues WHERE id = ?)",
        )
        .bind(id)
        .bind(voter_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM issues WHERE id = ?)")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            return Ok(if exists {
                VoteOutcome::AlreadyVoted
            } else {
                VoteOutcome::Missing
            });
        }

        let row = sqlx::query(concat!(
            "UPDATE issues SET upvotes = upvotes + 1 WHERE id = ? RETURNING ",
            issue_columns!()
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        let issue = issue_from_row(&row)?;
        tx.commit().await?;
        Ok(VoteOutcome::Counted(issue))
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: IssueStatus,
        next: IssueStatus,
        entry: TimelineEntry,
    ) -> anyhow::Result<Option<Issue>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(concat!(
            "UPDATE issues SET status = ?, updated_at = ? WHERE id = ? AND status = ? RETURNING ",
            issue_columns!()
        ))
        .bind(next.as_str())
        .bind(entry.created_at)
        .bind(id)
        .bind(expected.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let issue = issue_from_row(&row)?;

        insert_timeline_entry(&mut tx, &entry).await?;
        tx.commit().await?;
        Ok(Some(issue))
    }

    async fn assign_staff(&self, id: Uuid, staff_id: Uuid) -> anyhow::Result<AssignOutcome> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(concat!(
            "UPDATE issues SET assigned_staff_id = ?, updated_at = ? WHERE id = ? \
             AND EXISTS (SELECT 1 FROM users WHERE id = ? AND role = ? AND is_blocked = 0) \
             RETURNING ",
            issue_columns!()
        ))
        .bind(staff_id)
        .bind(Utc::now())
        .bind(id)
        .bind(staff_id)
        .bind(Role::Staff.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let outcome = match row {
            Some(row) => AssignOutcome::Assigned(issue_from_row(&row)?),
            None => {
                let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM issues WHERE id = ?)")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
                if exists {
                    AssignOutcome::NotAssignable
                } else {
                    AssignOutcome::Missing
                }
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn timeline(&self, issue_id: Uuid) -> anyhow::Result<Vec<TimelineEntry>> {
        let rows = sqlx::query(
            "SELECT id, issue_id, status, note, actor_id, created_at FROM timeline \
             WHERE issue_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, timeline_from_row)
    }
}

// ─── Payments ────────────────────────────────────────────────────────

#[async_trait]
impl PaymentRepo for SqliteStore {
    async fn insert_payment(&self, payment: Payment) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO payments (id, user_id, purpose, amount, currency, external_session_id, status, target_issue_id, created_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(payment.id)
        .bind(payment.user_id)
        .bind(payment.purpose.as_str())
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(&payment.external_session_id)
        .bind(payment.status.as_str())
        .bind(payment.target_issue_id)
        .bind(payment.created_at)
        .bind(payment.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_payment_by_session(&self, session_id: &str) -> anyhow::Result<Option<Payment>> {
        let row = sqlx::query(concat!(
            "SELECT ",
            payment_columns!(),
            " FROM payments WHERE external_session_id = ?"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    /// The `pending → completed` flip is the guard: only the transaction
    /// whose update matched a pending row applies the effect.
    async fn settle_payment(&self, session_id: &str) -> anyhow::Result<SettleOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(concat!(
            "UPDATE payments SET status = ?, completed_at = ? \
             WHERE external_session_id = ? AND status = ? RETURNING ",
            payment_columns!()
        ))
        .bind(PaymentStatus::Completed.as_str())
        .bind(now)
        .bind(session_id)
        .bind(PaymentStatus::Pending.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let existing = sqlx::query(concat!(
                "SELECT ",
                payment_columns!(),
                " FROM payments WHERE external_session_id = ?"
            ))
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;
            return Ok(match existing {
                Some(row) => SettleOutcome::AlreadySettled(payment_from_row(&row)?),
                None => SettleOutcome::Missing,
            });
        };
        let payment = payment_from_row(&row)?;

        let applied = match (payment.purpose, payment.target_issue_id) {
            (PaymentPurpose::Boost, Some(issue_id)) => {
                sqlx::query("UPDATE issues SET is_boosted = 1, priority = ?, updated_at = ? WHERE id = ?")
                    .bind(Priority::High.as_str())
                    .bind(now)
                    .bind(issue_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
            (PaymentPurpose::Boost, None) => 0,
            (PaymentPurpose::Premium, _) => {
                sqlx::query("UPDATE users SET is_premium = 1 WHERE id = ?")
                    .bind(payment.user_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
        };
        if applied == 0 {
            tx.rollback().await?;
            return Ok(SettleOutcome::TargetMissing(Payment {
                status: PaymentStatus::Pending,
                completed_at: None,
                ..payment
            }));
        }
        tx.commit().await?;
        Ok(SettleOutcome::Applied(payment))
    }

    async fn list_payments(&self) -> anyhow::Result<Vec<Payment>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            payment_columns!(),
            " FROM payments ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, payment_from_row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::models::IssuePayload;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    async fn citizen(store: &SqliteStore, subject: &str) -> User {
        store
            .upsert_identity(&IdentityClaims {
                subject: subject.into(),
                display_name: Some(subject.to_uppercase()),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    fn issue_for(user: &User, title: &str) -> (Issue, TimelineEntry) {
        let issue = Issue::new(
            user.id,
            IssuePayload {
                title: title.into(),
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
            created_at: issue.created_at,
        };
        (issue, entry)
    }

    async fn insert(store: &SqliteStore, user: &User, title: &str) -> Issue {
        let (issue, entry) = issue_for(user, title);
        let res = store
            .insert_issue_within_quota(issue.clone(), entry, None)
            .await
            .unwrap();
        assert_eq!(res, QuotaCheck::Inserted);
        issue
    }

    #[tokio::test]
    async fn upsert_refreshes_profile_but_keeps_role_and_flags() {
        let store = store().await;
        let first = citizen(&store, "sub-1").await;
        store.set_blocked(first.id, true).await.unwrap();

        let again = store
            .upsert_identity(&IdentityClaims {
                subject: "sub-1".into(),
                display_name: Some("Renamed".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.role, Role::Citizen);
        assert_eq!(again.display_name.as_deref(), Some("Renamed"));
        assert!(again.is_blocked);
    }

    #[tokio::test]
    async fn insert_user_refuses_duplicate_subject() {
        let store = store().await;
        citizen(&store, "taken").await;
        let dup = User::from_identity(
            &IdentityClaims {
                subject: "taken".into(),
                ..Default::default()
            },
            Role::Staff,
        );
        assert!(!store.insert_user(dup).await.unwrap());
    }

    #[tokio::test]
    async fn quota_is_enforced_by_the_insert_itself() {
        let store = store().await;
        let user = citizen(&store, "sub-1").await;
        for n in 0..3 {
            let (issue, entry) = issue_for(&user, &format!("issue {n}"));
            let res = store.insert_issue_within_quota(issue, entry, Some(3)).await.unwrap();
            assert_eq!(res, QuotaCheck::Inserted);
        }
        let (issue, entry) = issue_for(&user, "fourth");
        let id = issue.id;
        let res = store.insert_issue_within_quota(issue, entry, Some(3)).await.unwrap();
        assert_eq!(res, QuotaCheck::Exceeded);
        assert!(store.find_issue(id).await.unwrap().is_none());
        assert!(store.timeline(id).await.unwrap().is_empty());
        assert_eq!(store.issues_filed_by(user.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn votes_are_counted_once_per_voter() {
        let store = store().await;
        let owner = citizen(&store, "owner").await;
        let issue = insert(&store, &owner, "Pothole").await;
        let voter = Uuid::now_v7();

        match store.record_upvote(issue.id, voter).await.unwrap() {
            VoteOutcome::Counted(updated) => assert_eq!(updated.upvotes, 1),
            other => panic!("expected a counted vote, got {other:?}"),
        }
        assert_eq!(
            store.record_upvote(issue.id, voter).await.unwrap(),
            VoteOutcome::AlreadyVoted
        );
        assert_eq!(
            store.record_upvote(Uuid::now_v7(), voter).await.unwrap(),
            VoteOutcome::Missing
        );
    }

    #[tokio::test]
    async fn status_write_is_compare_and_set() {
        let store = store().await;
        let owner = citizen(&store, "owner").await;
        let issue = insert(&store, &owner, "Leak").await;
        let entry = |status| TimelineEntry {
            id: Uuid::now_v7(),
            issue_id: issue.id,
            status,
            note: "moved".into(),
            actor: Actor::System,
            created_at: Utc::now(),
        };

        let moved = store
            .compare_and_set_status(issue.id, IssueStatus::Pending, IssueStatus::Working, entry(IssueStatus::Working))
            .await
            .unwrap();
        assert_eq!(moved.map(|i| i.status), Some(IssueStatus::Working));

        let stale = store
            .compare_and_set_status(issue.id, IssueStatus::Pending, IssueStatus::Rejected, entry(IssueStatus::Rejected))
            .await
            .unwrap();
        assert!(stale.is_none());

        let timeline = store.timeline(issue.id).await.unwrap();
        let statuses: Vec<_> = timeline.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![IssueStatus::Pending, IssueStatus::Working]);
        assert_eq!(timeline[1].actor, Actor::System);
    }

    #[tokio::test]
    async fn content_edits_stop_once_work_starts() {
        let store = store().await;
        let owner = citizen(&store, "owner").await;
        let issue = insert(&store, &owner, "Old title").await;
        let patch = IssuePatch {
            title: Some("New title".into()),
            ..IssuePatch::default()
        };

        let edited = store.update_content_if_pending(issue.id, &patch).await.unwrap().unwrap();
        assert_eq!(edited.title, "New title");
        assert_eq!(edited.location, "Elm St");

        let entry = TimelineEntry {
            id: Uuid::now_v7(),
            issue_id: issue.id,
            status: IssueStatus::InProgress,
            note: "started".into(),
            actor: Actor::System,
            created_at: Utc::now(),
        };
        store
            .compare_and_set_status(issue.id, IssueStatus::Pending, IssueStatus::InProgress, entry)
            .await
            .unwrap();
        assert!(store.update_content_if_pending(issue.id, &patch).await.unwrap().is_none());
        assert_eq!(store.delete_issue(issue.id, true).await.unwrap(), DeleteOutcome::NotPending);
        assert_eq!(store.delete_issue(issue.id, false).await.unwrap(), DeleteOutcome::Deleted);
        assert!(store.timeline(issue.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settling_applies_the_effect_exactly_once() {
        let store = store().await;
        let owner = citizen(&store, "owner").await;
        let issue = insert(&store, &owner, "Broken light").await;
        let payment = Payment {
            id: Uuid::now_v7(),
            user_id: owner.id,
            purpose: PaymentPurpose::Boost,
            amount: 100,
            currency: "usd".into(),
            external_session_id: "sess_1".into(),
            status: PaymentStatus::Pending,
            target_issue_id: Some(issue.id),
            created_at: Utc::now(),
            completed_at: None,
        };
        assert!(store.insert_payment(payment.clone()).await.unwrap());
        assert!(!store.insert_payment(payment).await.unwrap());

        let first = store.settle_payment("sess_1").await.unwrap();
        assert!(matches!(first, SettleOutcome::Applied(ref p) if p.status == PaymentStatus::Completed));
        let second = store.settle_payment("sess_1").await.unwrap();
        assert!(matches!(second, SettleOutcome::AlreadySettled(_)));
        assert_eq!(store.settle_payment("sess_x").await.unwrap(), SettleOutcome::Missing);

        let boosted = store.find_issue(issue.id).await.unwrap().unwrap();
        assert!(boosted.is_boosted);
        assert_eq!(boosted.priority, Priority::High);
        assert_eq!(store.list_payments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn listing_filters_and_puts_boosted_first() {
        let store = store().await;
        let owner = citizen(&store, "owner").await;
        let older = insert(&store, &owner, "Flooded tunnel").await;
        let newer = insert(&store, &owner, "Pothole").await;

        let all = store.list_issues(&IssueFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|i| i.id).collect::<Vec<_>>(), vec![newer.id, older.id]);

        sqlx::query("UPDATE issues SET is_boosted = 1 WHERE id = ?")
            .bind(older.id)
            .execute(&store.pool)
            .await
            .unwrap();
        let all = store.list_issues(&IssueFilter::default()).await.unwrap();
        assert_eq!(all[0].id, older.id);

        let search = IssueFilter {
            search: Some("pot".into()),
            ..IssueFilter::default()
        };
        let found = store.list_issues(&search).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, newer.id);
    }

    #[tokio::test]
    async fn deleting_staff_clears_their_assignments() {
        let store = store().await;
        let owner = citizen(&store, "owner").await;
        let staff = store
            .ensure_role(
                &IdentityClaims {
                    subject: "staff-1".into(),
                    ..Default::default()
                },
                Role::Staff,
            )
            .await
            .unwrap();
        assert_eq!(staff.role, Role::Staff);
        let issue = insert(&store, &owner, "Graffiti").await;
        store.assign_staff(issue.id, staff.id).await.unwrap();

        assert!(!store.delete_staff(owner.id).await.unwrap());
        assert!(store.delete_staff(staff.id).await.unwrap());
        let issue = store.find_issue(issue.id).await.unwrap().unwrap();
        assert_eq!(issue.assigned_staff_id, None);
        assert!(store.find_user(staff.id).await.unwrap().is_none());
        assert_eq!(store.list_users(Some(Role::Staff)).await.unwrap().len(), 0);
        assert_eq!(store.list_users(None).await.unwrap().len(), 1);
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

    async fn staff_member(store: &SqliteStore, subject: &str) -> User {
        store
            .ensure_role(
                &IdentityClaims {
                    subject: subject.into(),
                    ..Default::default()
                },
                Role::Staff,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn open_boost_checkout_blocks_deletion() {
        let store = store().await;
        let owner = citizen(&store, "owner").await;
        let issue = insert(&store, &owner, "Pothole").await;
        store.insert_payment(boost_payment(&owner, issue.id, "sess_b")).await.unwrap();

        assert_eq!(store.delete_issue(issue.id, true).await.unwrap(), DeleteOutcome::PaymentPending);
        assert_eq!(store.delete_issue(issue.id, false).await.unwrap(), DeleteOutcome::PaymentPending);
        assert!(store.find_issue(issue.id).await.unwrap().is_some());

        assert!(matches!(store.settle_payment("sess_b").await.unwrap(), SettleOutcome::Applied(_)));
        assert_eq!(store.delete_issue(issue.id, true).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.delete_issue(issue.id, true).await.unwrap(), DeleteOutcome::Missing);
    }

    #[tokio::test]
    async fn settling_a_boost_for_a_vanished_issue_rolls_back() {
        let store = store().await;
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
    async fn only_active_staff_can_hold_an_assignment() {
        let store = store().await;
        let owner = citizen(&store, "owner").await;
        let staff = staff_member(&store, "staff-1").await;
        let issue = insert(&store, &owner, "Graffiti").await;

        assert_eq!(store.assign_staff(issue.id, owner.id).await.unwrap(), AssignOutcome::NotAssignable);
        store.set_blocked(staff.id, true).await.unwrap();
        assert_eq!(store.assign_staff(issue.id, staff.id).await.unwrap(), AssignOutcome::NotAssignable);
        store.set_blocked(staff.id, false).await.unwrap();
        assert!(matches!(
            store.assign_staff(issue.id, staff.id).await.unwrap(),
            AssignOutcome::Assigned(ref i) if i.assigned_staff_id == Some(staff.id)
        ));
        assert_eq!(
            store.assign_staff(Uuid::now_v7(), staff.id).await.unwrap(),
            AssignOutcome::Missing
        );

        let promoted = store
            .ensure_role(
                &IdentityClaims {
                    subject: "staff-1".into(),
                    ..Default::default()
                },
                Role::Admin,
            )
            .await
            .unwrap();
        assert_eq!(promoted.role, Role::Admin);
        let issue = store.find_issue(issue.id).await.unwrap().unwrap();
        assert_eq!(issue.assigned_staff_id, None);
        assert_eq!(store.assign_staff(issue.id, staff.id).await.unwrap(), AssignOutcome::NotAssignable);
    }

    #[tokio::test]
    async fn search_treats_wildcards_literally() {
        let store = store().await;
        let owner = citizen(&store, "owner").await;
        let percent = insert(&store, &owner, "Lights 50% out").await;
        insert(&store, &owner, "Lights 500 out").await;
        let underscore = insert(&store, &owner, "sign_post bent").await;
        insert(&store, &owner, "signXpost bent").await;

        let search = |needle: &str| IssueFilter {
            search: Some(needle.into()),
            ..IssueFilter::default()
        };
        let found = store.list_issues(&search("50%")).await.unwrap();
        assert_eq!(found.iter().map(|i| i.id).collect::<Vec<_>>(), vec![percent.id]);
        let found = store.list_issues(&search("n_p")).await.unwrap();
        assert_eq!(found.iter().map(|i| i.id).collect::<Vec<_>>(), vec![underscore.id]);
    }

    /// A file database gets a real multi-connection pool, unlike
    /// `sqlite::memory:`, so writers actually contend here.
    struct FileDb {
        path: std::path::PathBuf,
    }

    impl FileDb {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!("cf-db-sqlite-{}.db", Uuid::now_v7()));
            Self { path }
        }

        fn url(&self) -> String {
            format!("sqlite://{}", self.path.display())
        }
    }

    impl Drop for FileDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut file = self.path.clone().into_os_string();
                file.push(suffix);
                let _ = std::fs::remove_file(file);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn file_database_holds_quota_and_votes_under_contention() {
        let db = FileDb::new();
        let store = std::sync::Arc::new(SqliteStore::connect(&db.url()).await.unwrap());
        let user = citizen(&store, "racer").await;

        let mut handles = Vec::new();
        for n in 0..10 {
            let store = store.clone();
            let (issue, entry) = issue_for(&user, &format!("issue {n}"));
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
        let owned = IssueFilter {
            submitter_id: Some(user.id),
            ..IssueFilter::default()
        };
        let issues = store.list_issues(&owned).await.unwrap();
        assert_eq!(issues.len(), 3);

        let target = issues[0].id;
        let voter = Uuid::now_v7();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.record_upvote(target, voter).await.unwrap() }));
        }
        let mut counted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), VoteOutcome::Counted(_)) {
                counted += 1;
            }
        }
        assert_eq!(counted, 1);
        assert_eq!(store.find_issue(target).await.unwrap().unwrap().upvotes, 1);
    }
}
