//! Order status canonicalization and tracker status suggestion.
//!
//! Source batches spell statuses inconsistently ("acknowledge",
//! "Acknowledged", "canceled", ...). Canonicalization folds them into a
//! fixed vocabulary before they reach payload building.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::client::StatusRef;

/// Synonym table: lowercased input → canonical vocabulary value.
///
/// Canonical values map to themselves under case folding, which is what
/// makes [`canonicalize`] idempotent.
const SYNONYMS: &[(&str, &str)] = &[
    ("pending acknowledgement", "Pending Acknowledgement"),
    ("pending acknowledgment", "Pending Acknowledgement"),
    ("acknowledge", "Acknowledged"),
    ("acknowledged", "Acknowledged"),
    ("pending approval", "Pending Approval"),
    ("approved", "Approved"),
    ("objected", "Objected"),
    ("rejected", "Rejected"),
    ("cancelled", "Cancelled"),
    ("canceled", "Cancelled"),
    ("waiting for order submission", "Waiting for order submission"),
];

/// A canonicalized status with an optional tracker-side suggestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalStatus {
    /// Canonical vocabulary value.
    pub value: String,
    /// Tracker status name to use, when one matched.
    pub suggested: String,
    /// Whether `suggested` is an exact (case-insensitive) catalog match.
    pub matched: bool,
}

/// Normalize a raw order status into the canonical vocabulary.
///
/// Trims, case-folds and applies the synonym table. Inputs outside the
/// vocabulary are returned trimmed but otherwise untouched, so the
/// function stays idempotent for every input.
#[must_use]
pub fn canonicalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_lowercase();
    SYNONYMS
        .iter()
        .find(|(from, _)| *from == lower)
        .map_or_else(|| trimmed.to_string(), |(_, to)| (*to).to_string())
}

/// Canonicalize `raw` and search the tracker status catalog for an
/// exact case-insensitive name match.
///
/// Falls back to the canonical string with `matched = false` when the
/// catalog has no such status.
#[must_use]
pub fn suggest_tracker_status(
    raw: &str,
    catalog: &HashMap<String, StatusRef>,
) -> CanonicalStatus {
    let value = canonicalize(raw);
    match catalog.get(&value.to_lowercase()) {
        Some(status) => CanonicalStatus {
            value,
            suggested: status.name.clone(),
            matched: true,
        },
        None => CanonicalStatus {
            suggested: value.clone(),
            value,
            matched: false,
        },
    }
}
