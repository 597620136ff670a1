//! Order-to-issue synchronization engine.
//!
//! Turns batches of external work-order records into a hierarchy of
//! tracker issues (one epic per order, one story per instance) in an
//! OpenProject-style tracker, guaranteeing each logical order/instance
//! maps to at most one tracker issue across repeated runs.
//!
//! # Architecture
//!
//! - [`client`] — thin HAL+JSON REST client; single requests, no
//!   resilience.
//! - [`fieldmap`] — custom field discovery, override merging and wire
//!   payload building.
//! - [`status`] — order status canonicalization and tracker status
//!   suggestion.
//! - [`identity`] — the durable identity map (dedup authority) and
//!   per-key locking.
//! - [`executor`] — create/update with retry, backoff, conflict
//!   refresh and terminal classification.
//! - [`sync`] — the reconciliation orchestrator and batch report.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ordersync::config::{RetryConfig, SyncConfig, TrackerConfig};
//! use ordersync::identity::MemoryIdentityStore;
//! use ordersync::sync::{OrderRecord, SyncContext, SyncEngine};
//!
//! # async fn run(batch: Vec<OrderRecord>) -> ordersync::error::SyncResult<()> {
//! let tracker = TrackerConfig::from_env()?;
//! let store = Arc::new(MemoryIdentityStore::new());
//! let context = SyncContext::new(
//!     &tracker,
//!     RetryConfig::default(),
//!     SyncConfig::default(),
//!     store,
//! )?;
//! let report = SyncEngine::new(Arc::new(context)).run(batch).await;
//! println!("created {} issues", report.created);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod fieldmap;
pub mod identity;
pub mod status;
pub mod sync;

pub use client::TrackerClient;
pub use config::{RetryConfig, SyncConfig, TrackerConfig};
pub use error::{SyncError, SyncResult};
pub use executor::{MutationExecutor, MutationOutcome};
pub use fieldmap::{FieldMap, FieldOverrides, IssueKind, IssueSpec};
pub use identity::{IdentityKey, IdentityStore, MemoryIdentityStore};
pub use status::{canonicalize, suggest_tracker_status, CanonicalStatus};
pub use sync::{OrderRecord, SyncContext, SyncEngine, SyncReport};
