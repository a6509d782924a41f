//! Append-only audit trail of issue status changes.
//!
//! Entries are written by the store in the same atomic unit as the status
//! change they describe; this module builds them and reads them back.

use std::sync::Arc;

use cf_core::error::Result;
use cf_core::models::{Actor, IssueStatus, TimelineEntry};
use cf_core::traits::Store;
use chrono::Utc;
use uuid::Uuid;

use crate::StoreResultExt;

#[derive(Clone)]
pub struct TimelineRecorder {
    store: Arc<dyn Store>,
}

impl TimelineRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn entry(issue_id: Uuid, status: IssueStatus, note: &str, actor: Actor) -> TimelineEntry {
        TimelineEntry {
            id: Uuid::now_v7(),
            issue_id,
            status,
            note: note.trim().to_string(),
            actor,
            created_at: Utc::now(),
        }
    }

    /// Newest first, as the issue page shows it.
    pub async fn history(&self, issue_id: Uuid) -> Result<Vec<TimelineEntry>> {
        let mut entries = self.store.timeline(issue_id).await.or_unavailable("read timeline")?;
        entries.reverse();
        Ok(entries)
    }

    pub async fn last_status(&self, issue_id: Uuid) -> Result<Option<IssueStatus>> {
        let entries = self.store.timeline(issue_id).await.or_unavailable("read timeline")?;
        Ok(entries.last().map(|entry| entry.status))
    }
}
