//! Thin HTTP client for the tracker's HAL+JSON v3 API.
//!
//! The client is intentionally dumb: it performs single requests and
//! reports status and body as-is. Resilience (retry, backoff, conflict
//! handling) lives in [`crate::executor`].

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{header, Client, Method, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::TrackerConfig;
use crate::error::{SyncError, SyncResult};

/// A resolved tracker project.
#[derive(Debug, Clone)]
pub struct ProjectRef {
    /// Numeric project id.
    pub id: String,
    /// URL-safe identifier.
    pub identifier: String,
    /// Display name.
    pub name: String,
}

/// A tracker workflow status.
#[derive(Debug, Clone)]
pub struct StatusRef {
    /// Numeric status id.
    pub id: String,
    /// API href.
    pub href: String,
    /// Display name.
    pub name: String,
}

/// Raw response from a mutation call.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body (empty object when the body was not JSON).
    pub body: Value,
    /// Parsed Retry-After header, if present.
    pub retry_after_secs: Option<u64>,
}

impl ApiResponse {
    /// Whether the call succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client for the tracker REST API.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    base_url: String,
    basic_user: String,
    api_key: String,
    http: Client,
}

impl TrackerClient {
    /// Build a client from the tracker configuration.
    pub fn new(config: &TrackerConfig) -> SyncResult<Self> {
        config.validate()?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("ordersync/0.1")
            .build()
            .map_err(|e| SyncError::Configuration {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            basic_user: config.basic_user.clone(),
            api_key: config.api_key.clone(),
            http,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.http
            .request(method, url)
            .basic_auth(&self.basic_user, Some(&self.api_key))
            .header(header::ACCEPT, "application/hal+json, application/json")
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: Option<&[(&str, String)]>,
        body: Option<&Value>,
    ) -> SyncResult<ApiResponse> {
        let mut builder = self.request(method.clone(), path);
        if let Some(query) = query {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let retry_after_secs = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.json::<Value>().await.unwrap_or_else(|_| json!({}));
        debug!(method = %method, path, status, "tracker request");
        Ok(ApiResponse {
            status,
            body,
            retry_after_secs,
        })
    }

    /// GET a path, returning `None` on 404.
    async fn get_optional(&self, path: &str) -> SyncResult<Option<Value>> {
        let response = self.send(Method::GET, path, None, None).await?;
        if response.status == StatusCode::NOT_FOUND.as_u16() {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(SyncError::Validation {
                status: response.status,
                message: crate::error::error_message(&response.body),
            });
        }
        Ok(Some(response.body))
    }

    /// Fetch every element of an offset-paginated collection.
    async fn get_paginated(&self, path: &str) -> SyncResult<Vec<Value>> {
        const PAGE_SIZE: usize = 100;
        let mut items = Vec::new();
        let mut page = 1usize;
        loop {
            let query = [
                ("pageSize", PAGE_SIZE.to_string()),
                ("offset", page.to_string()),
            ];
            let response = self.send(Method::GET, path, Some(&query), None).await?;
            if !response.is_success() {
                return Err(SyncError::Validation {
                    status: response.status,
                    message: crate::error::error_message(&response.body),
                });
            }
            let elements = response.body["_embedded"]["elements"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let count = elements.len();
            items.extend(elements);
            let total = response.body["total"].as_u64().unwrap_or(0) as usize;
            if count < PAGE_SIZE || page * PAGE_SIZE >= total {
                break;
            }
            page += 1;
        }
        Ok(items)
    }

    /// Resolve a project by numeric id or identifier (lowercase fallback).
    pub async fn resolve_project(&self, key: &str) -> SyncResult<Option<ProjectRef>> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(None);
        }
        if key.chars().all(|c| c.is_ascii_digit()) {
            if let Some(body) = self.get_optional(&format!("/api/v3/projects/{key}")).await? {
                return Ok(Some(project_ref(&body)));
            }
        }
        for candidate in [key.to_string(), key.to_lowercase()] {
            let filters = json!([{"identifier": {"operator": "=", "values": [candidate]}}]);
            let query = [
                ("filters", filters.to_string()),
                ("pageSize", "1".to_string()),
            ];
            let response = self
                .send(Method::GET, "/api/v3/projects", Some(&query), None)
                .await?;
            if let Some(first) = response.body["_embedded"]["elements"]
                .as_array()
                .and_then(|e| e.first())
            {
                return Ok(Some(project_ref(first)));
            }
        }
        Ok(None)
    }

    /// List work package types available in a project: name(lower) → id.
    pub async fn list_types(&self, project_id: &str) -> SyncResult<HashMap<String, String>> {
        let body = self
            .get_optional(&format!("/api/v3/projects/{project_id}/types"))
            .await?
            .unwrap_or_else(|| json!({}));
        let mut by_name = HashMap::new();
        for element in body["_embedded"]["elements"].as_array().unwrap_or(&vec![]) {
            let name = element["name"].as_str().unwrap_or("").trim().to_lowercase();
            if let (false, Some(id)) = (name.is_empty(), json_id(element)) {
                by_name.insert(name, id);
            }
        }
        Ok(by_name)
    }

    /// List custom fields: display name(lower) → `customField{id}` attribute.
    pub async fn list_custom_fields(&self) -> SyncResult<HashMap<String, String>> {
        let items = self.get_paginated("/api/v3/custom_fields").await?;
        let mut fields = HashMap::new();
        for element in &items {
            let name = element["name"].as_str().unwrap_or("").trim().to_lowercase();
            if let (false, Some(id)) = (name.is_empty(), json_id(element)) {
                fields.insert(name, format!("customField{id}"));
            }
        }
        Ok(fields)
    }

    /// List workflow statuses: name(lower) → [`StatusRef`].
    pub async fn list_statuses(&self) -> SyncResult<HashMap<String, StatusRef>> {
        let body = self
            .get_optional("/api/v3/statuses")
            .await?
            .unwrap_or_else(|| json!({}));
        let mut by_name = HashMap::new();
        for element in body["_embedded"]["elements"].as_array().unwrap_or(&vec![]) {
            let name = element["name"].as_str().unwrap_or("").trim().to_string();
            let Some(id) = json_id(element) else { continue };
            if name.is_empty() {
                continue;
            }
            let href = element["_links"]["self"]["href"]
                .as_str()
                .map_or_else(|| format!("/api/v3/statuses/{id}"), ToString::to_string);
            by_name.insert(name.to_lowercase(), StatusRef { id, href, name });
        }
        Ok(by_name)
    }

    /// List global custom field options: title(lower) → option href.
    pub async fn list_custom_options(&self) -> SyncResult<HashMap<String, String>> {
        let items = self.get_paginated("/api/v3/custom_options").await?;
        let mut options = HashMap::new();
        for element in &items {
            let title = element["value"]
                .as_str()
                .or_else(|| element["title"].as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            if title.is_empty() {
                continue;
            }
            let href = element["_links"]["self"]["href"]
                .as_str()
                .map(ToString::to_string)
                .or_else(|| json_id(element).map(|id| format!("/api/v3/custom_options/{id}")));
            if let Some(href) = href {
                options.insert(title.to_lowercase(), href);
            }
        }
        Ok(options)
    }

    /// Fetch a work package, `None` when it does not exist.
    pub async fn get_work_package(&self, key: &str) -> SyncResult<Option<Value>> {
        self.get_optional(&format!("/api/v3/work_packages/{key}"))
            .await
    }

    /// Create a work package. Status and body are returned unclassified.
    pub async fn create_work_package(&self, payload: &Value) -> SyncResult<ApiResponse> {
        self.send(Method::POST, "/api/v3/work_packages", None, Some(payload))
            .await
    }

    /// Update a work package (the payload must carry `lockVersion`).
    pub async fn update_work_package(
        &self,
        key: &str,
        payload: &Value,
    ) -> SyncResult<ApiResponse> {
        self.send(
            Method::PATCH,
            &format!("/api/v3/work_packages/{key}"),
            None,
            Some(payload),
        )
        .await
    }
}

fn project_ref(body: &Value) -> ProjectRef {
    ProjectRef {
        id: json_id(body).unwrap_or_default(),
        identifier: body["identifier"].as_str().unwrap_or("").to_string(),
        name: body["name"].as_str().unwrap_or("").to_string(),
    }
}

/// Extract an id that the API may serialize as number or string.
fn json_id(body: &Value) -> Option<String> {
    match &body["id"] {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}
