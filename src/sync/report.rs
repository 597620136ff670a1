//! Batch report aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::{EntityState, RecordOutcome, SyncAction};

/// Aggregated result of one synchronization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Issues created.
    pub created: usize,
    /// Issues updated.
    pub updated: usize,
    /// Entities that already matched; nothing sent.
    pub unchanged: usize,
    /// Entities whose identity resolved to an existing issue.
    pub identity_hits: usize,
    /// Entities dropped after terminal or exhausted mutations.
    pub dropped: usize,
    /// Registered identities whose remote issue is gone.
    pub orphaned: usize,
    /// Records skipped because their parent epic was unavailable.
    pub blocked: usize,
    /// Per-record outcome detail.
    pub outcomes: Vec<RecordOutcome>,
}

impl SyncReport {
    /// Start a new report.
    #[must_use]
    pub fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            created: 0,
            updated: 0,
            unchanged: 0,
            identity_hits: 0,
            dropped: 0,
            orphaned: 0,
            blocked: 0,
            outcomes: Vec::new(),
        }
    }

    /// Fold one record outcome into the counters.
    pub fn record(&mut self, outcome: RecordOutcome) {
        if outcome.identity_hit {
            self.identity_hits += 1;
        }
        match outcome.state {
            EntityState::Registered => match outcome.action {
                Some(SyncAction::Created) => self.created += 1,
                Some(SyncAction::Updated) => self.updated += 1,
                Some(SyncAction::Unchanged) | None => self.unchanged += 1,
            },
            EntityState::Dropped => self.dropped += 1,
            EntityState::Orphaned => self.orphaned += 1,
            EntityState::Blocked => self.blocked += 1,
        }
        self.outcomes.push(outcome);
    }

    /// Close the report.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Total records accounted for.
    #[must_use]
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether every record reached a registered state.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.dropped == 0 && self.orphaned == 0 && self.blocked == 0
    }
}
