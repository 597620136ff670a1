//! Order records and per-entity outcome types.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::fieldmap::{FieldValue, IssueKind, IssueSpec};
use crate::identity::IdentityKey;
use crate::status::canonicalize;

/// One logical unit of work from the source batch.
///
/// Immutable once read; an epic-level record carries no instance index,
/// story records carry the instance of the line item they represent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Order id, e.g. `WPO00098660`.
    pub order_id: String,

    /// Instance index for story records; `None` for the epic record.
    #[serde(default)]
    pub instance: Option<u32>,

    /// Logical project key the order belongs to.
    pub project: String,

    /// Human-readable order name.
    #[serde(default)]
    pub name: String,

    /// Product attribute.
    #[serde(default)]
    pub product: String,

    /// Domain attribute.
    #[serde(default)]
    pub domain: String,

    /// Customer attribute.
    #[serde(default)]
    pub customer: String,

    /// Raw order status as spelled in the batch.
    #[serde(default)]
    pub status: String,

    /// Planned start date (ISO 8601 date).
    #[serde(default)]
    pub start_date: Option<String>,

    /// Due date (ISO 8601 date).
    #[serde(default)]
    pub due_date: Option<String>,
}

impl OrderRecord {
    /// Whether this record describes the order's epic.
    #[must_use]
    pub fn is_epic(&self) -> bool {
        self.instance.is_none()
    }

    /// Issue kind this record maps to.
    #[must_use]
    pub fn kind(&self) -> IssueKind {
        if self.is_epic() {
            IssueKind::Epic
        } else {
            IssueKind::Story
        }
    }

    /// Identity key of the tracker entity this record drives.
    #[must_use]
    pub fn identity_key(&self) -> IdentityKey {
        match self.instance {
            Some(instance) => IdentityKey::story(&self.project, &self.order_id, instance),
            None => IdentityKey::epic(&self.project, &self.order_id),
        }
    }

    /// Issue subject line.
    #[must_use]
    pub fn subject(&self) -> String {
        let name = self.name.trim();
        match (self.instance, name.is_empty()) {
            (None, true) => self.order_id.clone(),
            (None, false) => format!("{} {}", self.order_id, name),
            (Some(instance), true) => format!("{} #{instance}", self.order_id),
            (Some(instance), false) => format!("{} #{instance} {}", self.order_id, name),
        }
    }

    /// Markdown description body listing the order attributes.
    #[must_use]
    pub fn description(&self) -> String {
        let mut lines = Vec::new();
        for (label, value) in [
            ("Customer", &self.customer),
            ("Product", &self.product),
            ("Domain", &self.domain),
        ] {
            if !value.trim().is_empty() {
                lines.push(format!("- {label}: {}", value.trim()));
            }
        }
        if let Some(start) = &self.start_date {
            if !start.trim().is_empty() {
                lines.push(format!("- Start: {}", start.trim()));
            }
        }
        lines.join("\n")
    }

    /// Logical issue description for payload building.
    ///
    /// The order id is stamped onto the issue as a custom field so an
    /// issue whose registration was lost can be found again remotely.
    /// The status value is canonicalized before it becomes an
    /// enumerated field.
    #[must_use]
    pub fn issue_spec(&self, parent_key: Option<String>) -> IssueSpec {
        let mut custom = vec![(
            "Order ID".to_string(),
            FieldValue::Text(self.order_id.clone()),
        )];
        if !self.status.trim().is_empty() {
            custom.push((
                "Order Status".to_string(),
                FieldValue::Enumerated(canonicalize(&self.status)),
            ));
        }
        for (name, value) in [
            ("Product", &self.product),
            ("Domain", &self.domain),
            ("Customer", &self.customer),
        ] {
            if !value.trim().is_empty() {
                custom.push((name.to_string(), FieldValue::Text(value.trim().to_string())));
            }
        }
        IssueSpec {
            kind: self.kind(),
            subject: self.subject(),
            description: self.description(),
            due_date: self.due_date.clone(),
            parent_key,
            custom,
        }
    }
}

/// Terminal state of one entity after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Identity resolved or created and registered.
    Registered,
    /// Mutation failed terminally or exhausted its retry budget.
    Dropped,
    /// The registered issue no longer exists remotely.
    Orphaned,
    /// Skipped because the parent epic was not available.
    Blocked,
}

/// What the run actually did for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// A new issue was created.
    Created,
    /// The existing issue was updated.
    Updated,
    /// The existing issue already matched; nothing was sent.
    Unchanged,
}

/// Per-record outcome detail for the batch report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// Identity key of the entity.
    pub key: IdentityKey,
    /// Terminal state.
    pub state: EntityState,
    /// Action taken, when the entity reached a registered state.
    pub action: Option<SyncAction>,
    /// Tracker issue key, when known.
    pub issue_key: Option<String>,
    /// Remote call attempts made for this entity.
    pub attempts: u32,
    /// Whether identity resolution found an already-registered issue.
    pub identity_hit: bool,
    /// Logical fields omitted from the payload because they did not
    /// resolve.
    pub omitted_fields: Vec<String>,
    /// Classified error kind for non-registered states.
    pub error: Option<ErrorKind>,
    /// Human-readable failure detail.
    pub detail: Option<String>,
}

impl RecordOutcome {
    /// Outcome for a successfully registered entity.
    #[must_use]
    pub fn registered(key: IdentityKey, action: SyncAction, issue_key: String) -> Self {
        Self {
            key,
            state: EntityState::Registered,
            action: Some(action),
            issue_key: Some(issue_key),
            attempts: 0,
            identity_hit: false,
            omitted_fields: Vec::new(),
            error: None,
            detail: None,
        }
    }

    /// Outcome for a dropped entity.
    #[must_use]
    pub fn dropped(key: IdentityKey, error: Option<ErrorKind>, detail: impl Into<String>) -> Self {
        Self {
            key,
            state: EntityState::Dropped,
            action: None,
            issue_key: None,
            attempts: 0,
            identity_hit: false,
            omitted_fields: Vec::new(),
            error,
            detail: Some(detail.into()),
        }
    }

    /// Outcome for an orphaned identity.
    #[must_use]
    pub fn orphaned(key: IdentityKey, issue_key: String) -> Self {
        Self {
            key,
            state: EntityState::Orphaned,
            action: None,
            issue_key: Some(issue_key),
            attempts: 0,
            identity_hit: true,
            omitted_fields: Vec::new(),
            error: Some(ErrorKind::EntityGone),
            detail: None,
        }
    }

    /// Outcome for a record blocked on its parent epic.
    #[must_use]
    pub fn blocked(key: IdentityKey, detail: impl Into<String>) -> Self {
        Self {
            key,
            state: EntityState::Blocked,
            action: None,
            issue_key: None,
            attempts: 0,
            identity_hit: false,
            omitted_fields: Vec::new(),
            error: None,
            detail: Some(detail.into()),
        }
    }

    /// Set the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Mark that identity resolution found an existing issue.
    #[must_use]
    pub fn with_identity_hit(mut self) -> Self {
        self.identity_hit = true;
        self
    }

    /// Attach the omitted logical field names.
    #[must_use]
    pub fn with_omitted(mut self, omitted: Vec<String>) -> Self {
        self.omitted_fields = omitted;
        self
    }
}
