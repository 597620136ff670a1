//! Field mapping discovery, override merging and wire payload building.
//!
//! The tracker addresses custom fields by opaque attribute names
//! (`customField{id}`) and enumerated values by option hrefs. This
//! module discovers both catalogs, merges operator-supplied override
//! tables over them (overrides always win) and turns logical field
//! values into wire payloads.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::client::{ProjectRef, TrackerClient};
use crate::config::TrackerConfig;
use crate::error::{SyncError, SyncResult};

/// Operator-supplied override tables, loaded from two JSON documents.
#[derive(Debug, Clone, Default)]
pub struct FieldOverrides {
    /// Logical field name (lower) → numeric tracker field id.
    pub field_ids: HashMap<String, u64>,
    /// Tracker field attribute → {value string → option href}.
    pub options: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FieldIdEntry {
    Number(u64),
    Text(String),
}

impl FieldOverrides {
    /// Load both override documents named by the tracker config.
    ///
    /// A missing path means no overrides for that table; an unreadable
    /// or malformed file is an error — silently dropping an operator's
    /// overrides would defeat their purpose.
    pub fn load(config: &TrackerConfig) -> SyncResult<Self> {
        let mut overrides = Self::default();
        if let Some(path) = &config.field_overrides_path {
            overrides.field_ids = load_field_ids(path)?;
        }
        if let Some(path) = &config.option_overrides_path {
            let raw = std::fs::read_to_string(path)?;
            overrides.options = serde_json::from_str(&raw)?;
        }
        Ok(overrides)
    }
}

fn load_field_ids(path: &Path) -> SyncResult<HashMap<String, u64>> {
    let raw = std::fs::read_to_string(path)?;
    let entries: HashMap<String, FieldIdEntry> = serde_json::from_str(&raw)?;
    let mut field_ids = HashMap::new();
    for (name, entry) in entries {
        let id = match entry {
            FieldIdEntry::Number(n) => n,
            FieldIdEntry::Text(s) => s
                .trim()
                .trim_start_matches("customField")
                .parse::<u64>()
                .map_err(|_| SyncError::Configuration {
                    message: format!("invalid field id override for '{name}': {s}"),
                })?,
        };
        field_ids.insert(name.trim().to_lowercase(), id);
    }
    Ok(field_ids)
}

/// Merged view of discovered field metadata and override tables.
#[derive(Debug, Clone)]
pub struct FieldMap {
    /// The resolved tracker project.
    pub project: ProjectRef,
    /// Work package type name (lower) → type id.
    pub types: HashMap<String, String>,
    /// Logical field name (lower) → `customField{id}` attribute.
    pub fields: HashMap<String, String>,
    /// Field attribute → {value string → option href}; overrides only.
    pub option_overrides: HashMap<String, HashMap<String, String>>,
    /// Discovered global option catalog: title (lower) → href.
    pub option_catalog: HashMap<String, String>,
}

/// A built wire payload plus the logical fields that could not be
/// resolved and were omitted.
#[derive(Debug, Clone)]
pub struct PayloadBuild {
    /// The wire payload to send.
    pub payload: Value,
    /// Logical field names omitted because they did not resolve.
    pub omitted: Vec<String>,
}

/// Issue kind within the order hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Top-level issue representing one order.
    Epic,
    /// Child issue representing one instance under an order.
    Story,
}

impl IssueKind {
    /// Tracker type names to try, most specific first.
    #[must_use]
    pub fn type_candidates(self) -> &'static [&'static str] {
        match self {
            IssueKind::Epic => &["epic"],
            IssueKind::Story => &["story", "user story", "task"],
        }
    }
}

/// A logical field value destined for a custom field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Plain text value.
    Text(String),
    /// Enumerated value that must resolve to an option href.
    Enumerated(String),
}

/// Logical description of one issue to create or update.
#[derive(Debug, Clone)]
pub struct IssueSpec {
    /// Epic or story.
    pub kind: IssueKind,
    /// Issue subject line.
    pub subject: String,
    /// Markdown description body.
    pub description: String,
    /// Due date (ISO 8601 date), when known.
    pub due_date: Option<String>,
    /// Parent issue key (stories link to their epic).
    pub parent_key: Option<String>,
    /// Logical name → value for custom fields.
    pub custom: Vec<(String, FieldValue)>,
}

/// Discover the raw custom field catalog.
///
/// Fails soft: a discovery error yields an empty map so the run can
/// degrade to override-only operation instead of aborting.
pub async fn discover_field_catalog(client: &TrackerClient) -> HashMap<String, String> {
    match client.list_custom_fields().await {
        Ok(catalog) => catalog,
        Err(error) => {
            warn!(%error, "custom field discovery failed; continuing with empty catalog");
            HashMap::new()
        }
    }
}

/// Discover tracker metadata for a project and merge the override
/// tables over it.
///
/// Field id overrides win over discovered entries field-by-field. The
/// option catalog is discovery-only; per-field option overrides are
/// consulted first at payload build time.
pub async fn discover_fieldmap(
    client: &TrackerClient,
    project_key: &str,
    overrides: &FieldOverrides,
) -> SyncResult<FieldMap> {
    let project = client.resolve_project(project_key).await?.ok_or_else(|| {
        SyncError::Configuration {
            message: format!("project '{project_key}' not found in tracker"),
        }
    })?;
    let types = client.list_types(&project.id).await.unwrap_or_else(|e| {
        warn!(error = %e, "type discovery failed; continuing with empty type map");
        HashMap::new()
    });

    let mut fields = discover_field_catalog(client).await;
    for (name, id) in &overrides.field_ids {
        fields.insert(name.clone(), format!("customField{id}"));
    }

    let option_catalog = match client.list_custom_options().await {
        Ok(catalog) => catalog,
        Err(error) => {
            warn!(%error, "custom option discovery failed; continuing with empty catalog");
            HashMap::new()
        }
    };

    debug!(
        project = %project.identifier,
        fields = fields.len(),
        types = types.len(),
        options = option_catalog.len(),
        "field map ready"
    );
    Ok(FieldMap {
        project,
        types,
        fields,
        option_overrides: overrides.options.clone(),
        option_catalog,
    })
}

impl FieldMap {
    /// Resolve a logical field name to its tracker attribute.
    #[must_use]
    pub fn field_attribute(&self, logical_name: &str) -> Option<&str> {
        self.fields
            .get(&logical_name.trim().to_lowercase())
            .map(String::as_str)
    }

    /// Resolve the type id for an issue kind.
    #[must_use]
    pub fn type_id(&self, kind: IssueKind) -> Option<&str> {
        kind.type_candidates()
            .iter()
            .find_map(|name| self.types.get(*name))
            .map(String::as_str)
    }

    /// Resolve an enumerated value to an option href.
    ///
    /// The per-field override table wins; the discovered global option
    /// catalog is the fallback.
    #[must_use]
    pub fn option_href(&self, attribute: &str, value: &str) -> Option<String> {
        if let Some(per_field) = self.option_overrides.get(attribute) {
            if let Some(href) = per_field
                .get(value)
                .or_else(|| per_field.get(value.trim()))
            {
                return Some(href.clone());
            }
        }
        self.option_catalog
            .get(&value.trim().to_lowercase())
            .cloned()
    }

    /// Build a wire payload from a logical issue spec.
    ///
    /// Logical fields that cannot be resolved are omitted, not fatal;
    /// their names are reported back for the caller's record. Blank
    /// custom values are skipped to avoid server-side "can't be blank"
    /// violations.
    #[must_use]
    pub fn build_payload(&self, spec: &IssueSpec) -> PayloadBuild {
        let mut payload = Map::new();
        let mut omitted = Vec::new();

        payload.insert("subject".to_string(), Value::String(spec.subject.clone()));
        payload.insert(
            "description".to_string(),
            json!({"raw": spec.description, "format": "markdown"}),
        );
        if let Some(due) = &spec.due_date {
            if !due.trim().is_empty() {
                payload.insert("dueDate".to_string(), Value::String(due.clone()));
            }
        }

        let mut links = Map::new();
        links.insert(
            "project".to_string(),
            json!({"href": format!("/api/v3/projects/{}", self.project.id)}),
        );
        match self.type_id(spec.kind) {
            Some(type_id) => {
                links.insert(
                    "type".to_string(),
                    json!({"href": format!("/api/v3/types/{type_id}")}),
                );
            }
            None => omitted.push("type".to_string()),
        }
        if let Some(parent) = &spec.parent_key {
            links.insert(
                "parent".to_string(),
                json!({"href": format!("/api/v3/work_packages/{parent}")}),
            );
        }
        payload.insert("_links".to_string(), Value::Object(links));

        for (name, value) in &spec.custom {
            let raw = match value {
                FieldValue::Text(s) | FieldValue::Enumerated(s) => s,
            };
            if raw.trim().is_empty() {
                continue;
            }
            let Some(attribute) = self.field_attribute(name) else {
                omitted.push(name.clone());
                continue;
            };
            let wire_value = match value {
                FieldValue::Text(s) => Value::String(s.clone()),
                FieldValue::Enumerated(s) => match self.option_href(attribute, s) {
                    Some(href) => json!({"href": href}),
                    // Unresolvable option: send the raw string and let
                    // the tracker validate.
                    None => Value::String(s.clone()),
                },
            };
            payload.insert(attribute.to_string(), wire_value);
        }

        PayloadBuild {
            payload: Value::Object(payload),
            omitted,
        }
    }
}

/// Compute the update diff between a planned payload and the current
/// remote fields.
///
/// Only changed top-level fields are carried; `_links` membership is
/// create-only and never diffed. The description compares on its raw
/// text.
#[must_use]
pub fn compute_diff(planned: &Value, current: &Value) -> Value {
    let mut diff = Map::new();
    let Some(planned_map) = planned.as_object() else {
        return Value::Object(diff);
    };
    for (key, value) in planned_map {
        match key.as_str() {
            "_links" => {}
            "description" => {
                let planned_raw = value["raw"].as_str().unwrap_or("");
                let current_raw = current["description"]["raw"].as_str().unwrap_or("");
                if planned_raw != current_raw {
                    diff.insert(key.clone(), value.clone());
                }
            }
            _ => {
                if current.get(key) != Some(value) {
                    diff.insert(key.clone(), value.clone());
                }
            }
        }
    }
    Value::Object(diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fieldmap() -> FieldMap {
        FieldMap {
            project: ProjectRef {
                id: "14".to_string(),
                identifier: "net-rollout".to_string(),
                name: "Network Rollout".to_string(),
            },
            types: HashMap::from([
                ("epic".to_string(), "7".to_string()),
                ("user story".to_string(), "8".to_string()),
            ]),
            fields: HashMap::from([
                ("order id".to_string(), "customField12".to_string()),
                ("order status".to_string(), "customField10".to_string()),
            ]),
            option_overrides: HashMap::from([(
                "customField10".to_string(),
                HashMap::from([(
                    "Approved".to_string(),
                    "/api/v3/custom_options/55".to_string(),
                )]),
            )]),
            option_catalog: HashMap::from([
                ("approved".to_string(), "/api/v3/custom_options/99".to_string()),
                ("rejected".to_string(), "/api/v3/custom_options/61".to_string()),
            ]),
        }
    }

    fn spec() -> IssueSpec {
        IssueSpec {
            kind: IssueKind::Epic,
            subject: "WPO00098660 Fiber rollout".to_string(),
            description: "- customer: Acme".to_string(),
            due_date: Some("2025-06-01".to_string()),
            parent_key: None,
            custom: vec![
                (
                    "Order ID".to_string(),
                    FieldValue::Text("WPO00098660".to_string()),
                ),
                (
                    "Order Status".to_string(),
                    FieldValue::Enumerated("Approved".to_string()),
                ),
            ],
        }
    }

    #[test]
    fn builds_payload_with_links_and_custom_fields() {
        let build = fieldmap().build_payload(&spec());
        let payload = &build.payload;
        assert_eq!(payload["subject"], "WPO00098660 Fiber rollout");
        assert_eq!(payload["dueDate"], "2025-06-01");
        assert_eq!(payload["_links"]["project"]["href"], "/api/v3/projects/14");
        assert_eq!(payload["_links"]["type"]["href"], "/api/v3/types/7");
        assert_eq!(payload["customField12"], "WPO00098660");
        assert!(build.omitted.is_empty());
    }

    #[test]
    fn override_option_wins_over_catalog() {
        // Both the override table and the discovered catalog know
        // "Approved"; the override href must win.
        let build = fieldmap().build_payload(&spec());
        assert_eq!(
            build.payload["customField10"]["href"],
            "/api/v3/custom_options/55"
        );
    }

    #[test]
    fn catalog_resolves_when_no_override() {
        let map = fieldmap();
        assert_eq!(
            map.option_href("customField10", "Rejected"),
            Some("/api/v3/custom_options/61".to_string())
        );
    }

    #[test]
    fn unresolvable_field_is_omitted_not_fatal() {
        let mut s = spec();
        s.custom.push((
            "Customer Region".to_string(),
            FieldValue::Text("EMEA".to_string()),
        ));
        let build = fieldmap().build_payload(&s);
        assert_eq!(build.omitted, vec!["Customer Region".to_string()]);
        assert!(build.payload["subject"].is_string());
    }

    #[test]
    fn unresolvable_option_falls_back_to_raw_string() {
        let mut s = spec();
        s.custom = vec![(
            "Order Status".to_string(),
            FieldValue::Enumerated("Totally Unknown".to_string()),
        )];
        let build = fieldmap().build_payload(&s);
        assert_eq!(build.payload["customField10"], "Totally Unknown");
    }

    #[test]
    fn blank_custom_values_are_skipped() {
        let mut s = spec();
        s.custom = vec![("Order ID".to_string(), FieldValue::Text("  ".to_string()))];
        let build = fieldmap().build_payload(&s);
        assert!(build.payload.get("customField12").is_none());
        assert!(build.omitted.is_empty());
    }

    #[test]
    fn story_type_falls_back_through_candidates() {
        let map = fieldmap();
        assert_eq!(map.type_id(IssueKind::Story), Some("8"));
    }

    #[test]
    fn field_id_overrides_win_over_discovery() {
        let overrides = FieldOverrides {
            field_ids: HashMap::from([("order id".to_string(), 77)]),
            options: HashMap::new(),
        };
        let mut map = fieldmap();
        // Simulate the merge done by discover_fieldmap.
        for (name, id) in &overrides.field_ids {
            map.fields.insert(name.clone(), format!("customField{id}"));
        }
        assert_eq!(map.field_attribute("Order ID"), Some("customField77"));
    }

    #[test]
    fn diff_carries_only_changed_fields() {
        let planned = json!({
            "subject": "new subject",
            "dueDate": "2025-06-01",
            "description": {"raw": "text", "format": "markdown"},
            "customField12": "WPO00098660",
            "_links": {"project": {"href": "/api/v3/projects/14"}}
        });
        let current = json!({
            "subject": "old subject",
            "dueDate": "2025-06-01",
            "description": {"raw": "text"},
            "customField12": "WPO00098660"
        });
        let diff = compute_diff(&planned, &current);
        let map = diff.as_object().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(diff["subject"], "new subject");
    }

    #[test]
    fn identical_payload_yields_empty_diff() {
        let planned = json!({
            "subject": "s",
            "description": {"raw": "d", "format": "markdown"},
            "_links": {}
        });
        let current = json!({"subject": "s", "description": {"raw": "d"}});
        let diff = compute_diff(&planned, &current);
        assert!(diff.as_object().unwrap().is_empty());
    }

    #[test]
    fn loads_override_files() {
        let dir = tempfile::tempdir().unwrap();
        let field_path = dir.path().join("fields.json");
        let option_path = dir.path().join("options.json");
        std::fs::write(&field_path, r#"{"Order ID": 12, "Order Status": "customField10"}"#)
            .unwrap();
        std::fs::write(
            &option_path,
            r#"{"customField10": {"Approved": "/api/v3/custom_options/55"}}"#,
        )
        .unwrap();

        let config = crate::config::TrackerConfig::new("https://t.example.com", "key")
            .with_field_overrides(&field_path)
            .with_option_overrides(&option_path);
        let overrides = FieldOverrides::load(&config).unwrap();
        assert_eq!(overrides.field_ids["order id"], 12);
        assert_eq!(overrides.field_ids["order status"], 10);
        assert_eq!(
            overrides.options["customField10"]["Approved"],
            "/api/v3/custom_options/55"
        );
    }

    #[test]
    fn malformed_override_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fields.json");
        std::fs::write(&path, "not json").unwrap();
        let config = crate::config::TrackerConfig::new("https://t.example.com", "key")
            .with_field_overrides(&path);
        assert!(FieldOverrides::load(&config).is_err());
    }
}
