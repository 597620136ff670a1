//! Resilient mutation execution against the tracker.
//!
//! Wraps the thin [`TrackerClient`] with retry, exponential backoff,
//! optimistic-concurrency conflict handling and terminal-failure
//! classification. Exhausted retries produce a *dropped* outcome
//! instead of an error so batch processing continues past individual
//! failures.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::client::{ApiResponse, TrackerClient};
use crate::config::RetryConfig;
use crate::error::{is_gone_response, ErrorKind, SyncError};

/// Result of one remote mutation, over all attempts.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    /// Whether the mutation succeeded.
    pub ok: bool,
    /// Issue key of the affected work package, when known.
    pub issue_key: Option<String>,
    /// Last response body, for diagnostics.
    pub body: Value,
    /// Number of calls actually made.
    pub attempts: u32,
    /// Whether the mutation was dropped after exhausting retries.
    pub dropped: bool,
    /// Classified failure kind when `ok` is false.
    pub error: Option<ErrorKind>,
}

impl MutationOutcome {
    fn success(issue_key: Option<String>, body: Value, attempts: u32) -> Self {
        Self {
            ok: true,
            issue_key,
            body,
            attempts,
            dropped: false,
            error: None,
        }
    }

    fn failure(kind: ErrorKind, body: Value, attempts: u32, dropped: bool) -> Self {
        Self {
            ok: false,
            issue_key: None,
            body,
            attempts,
            dropped,
            error: Some(kind),
        }
    }

    /// Whether the update target was found gone (orphaned identity).
    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.error == Some(ErrorKind::EntityGone)
    }
}

/// Executes create/update mutations with retry and a shared request
/// quota.
#[derive(Clone)]
pub struct MutationExecutor {
    client: Arc<TrackerClient>,
    retry: RetryConfig,
    quota: Arc<Semaphore>,
}

enum Attempt {
    Response(ApiResponse),
    Transport(SyncError),
}

impl MutationExecutor {
    /// Create an executor sharing the given request quota.
    #[must_use]
    pub fn new(client: Arc<TrackerClient>, retry: RetryConfig, quota: Arc<Semaphore>) -> Self {
        Self {
            client,
            retry,
            quota,
        }
    }

    /// Create a work package.
    ///
    /// Retries transient failures (network errors, 5xx, 429) with
    /// exponential backoff; validation failures are terminal on the
    /// first response.
    pub async fn create(&self, payload: &Value) -> MutationOutcome {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let attempt = self.call_create(payload).await;
            match attempt {
                Attempt::Response(response) if response.is_success() => {
                    let issue_key = extract_issue_key(&response.body);
                    debug!(attempts, issue_key = issue_key.as_deref(), "created issue");
                    return MutationOutcome::success(issue_key, response.body, attempts);
                }
                Attempt::Response(response) => {
                    let kind = ErrorKind::from_status(response.status)
                        .unwrap_or(ErrorKind::TransientNetwork);
                    if !kind.is_retryable() {
                        return MutationOutcome::failure(kind, response.body, attempts, false);
                    }
                    if self.budget_exhausted(attempts) {
                        warn!(attempts, status = response.status, "create dropped");
                        return MutationOutcome::failure(kind, response.body, attempts, true);
                    }
                    self.wait(attempts, response.retry_after_secs).await;
                }
                Attempt::Transport(error) => {
                    if self.budget_exhausted(attempts) {
                        warn!(attempts, %error, "create dropped after transport failures");
                        return MutationOutcome::failure(
                            ErrorKind::TransientNetwork,
                            json!({"message": error.to_string()}),
                            attempts,
                            true,
                        );
                    }
                    self.wait(attempts, None).await;
                }
            }
        }
    }

    /// Update a work package with optimistic concurrency.
    ///
    /// Fetches the current version token first. On a version conflict
    /// the token is refreshed once and the update retried exactly once;
    /// a second conflict is terminal. A gone target is terminal and
    /// classified [`ErrorKind::EntityGone`].
    pub async fn update(&self, issue_key: &str, diff: &Value) -> MutationOutcome {
        let (fetch_attempts, fetched) = self.fetch_lock_version(issue_key).await;
        let mut lock_version = match fetched {
            Ok(Some(version)) => version,
            Ok(None) => {
                return MutationOutcome::failure(
                    ErrorKind::EntityGone,
                    json!({"message": format!("work package {issue_key} could not be found")}),
                    fetch_attempts,
                    false,
                );
            }
            Err(error) => {
                let kind = fetch_error_kind(&error);
                return MutationOutcome::failure(
                    kind,
                    json!({"message": error.to_string()}),
                    fetch_attempts,
                    kind.is_retryable(),
                );
            }
        };

        let mut attempts = 0u32;
        let mut conflict_refreshed = false;
        loop {
            attempts += 1;
            let mut payload = diff.clone();
            if let Some(map) = payload.as_object_mut() {
                map.insert("lockVersion".to_string(), json!(lock_version));
            }
            let attempt = self.call_update(issue_key, &payload).await;
            match attempt {
                Attempt::Response(response) if response.is_success() => {
                    debug!(issue_key, attempts, "updated issue");
                    return MutationOutcome::success(
                        Some(issue_key.to_string()),
                        response.body,
                        attempts,
                    );
                }
                Attempt::Response(response) if response.status == 409 => {
                    if conflict_refreshed {
                        warn!(issue_key, "second version conflict; giving up");
                        return MutationOutcome::failure(
                            ErrorKind::VersionConflict,
                            response.body,
                            attempts,
                            false,
                        );
                    }
                    conflict_refreshed = true;
                    let (_, refreshed) = self.fetch_lock_version(issue_key).await;
                    match refreshed {
                        Ok(Some(version)) => lock_version = version,
                        Ok(None) => {
                            return MutationOutcome::failure(
                                ErrorKind::EntityGone,
                                response.body,
                                attempts,
                                false,
                            );
                        }
                        Err(error) => {
                            return MutationOutcome::failure(
                                ErrorKind::TransientNetwork,
                                json!({"message": error.to_string()}),
                                attempts,
                                true,
                            );
                        }
                    }
                }
                Attempt::Response(response) => {
                    if is_gone_response(&response.body) || response.status == 404 {
                        warn!(issue_key, "update target is gone; orphaned identity");
                        return MutationOutcome::failure(
                            ErrorKind::EntityGone,
                            response.body,
                            attempts,
                            false,
                        );
                    }
                    let kind = ErrorKind::from_status(response.status)
                        .unwrap_or(ErrorKind::TransientNetwork);
                    if !kind.is_retryable() {
                        return MutationOutcome::failure(kind, response.body, attempts, false);
                    }
                    if self.budget_exhausted(attempts) {
                        warn!(issue_key, attempts, status = response.status, "update dropped");
                        return MutationOutcome::failure(kind, response.body, attempts, true);
                    }
                    self.wait(attempts, response.retry_after_secs).await;
                }
                Attempt::Transport(error) => {
                    if self.budget_exhausted(attempts) {
                        warn!(issue_key, attempts, %error, "update dropped after transport failures");
                        return MutationOutcome::failure(
                            ErrorKind::TransientNetwork,
                            json!({"message": error.to_string()}),
                            attempts,
                            true,
                        );
                    }
                    self.wait(attempts, None).await;
                }
            }
        }
    }

    async fn call_create(&self, payload: &Value) -> Attempt {
        let _permit = self.quota.acquire().await;
        match self.client.create_work_package(payload).await {
            Ok(response) => Attempt::Response(response),
            Err(error) => Attempt::Transport(error),
        }
    }

    async fn call_update(&self, issue_key: &str, payload: &Value) -> Attempt {
        let _permit = self.quota.acquire().await;
        match self.client.update_work_package(issue_key, payload).await {
            Ok(response) => Attempt::Response(response),
            Err(error) => Attempt::Transport(error),
        }
    }

    /// Fetch the current version token, retrying transient failures on
    /// the same schedule as mutations.
    async fn fetch_lock_version(&self, issue_key: &str) -> (u32, Result<Option<i64>, SyncError>) {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let result = {
                let _permit = self.quota.acquire().await;
                self.client.get_work_package(issue_key).await
            };
            match result {
                Ok(body) => {
                    return (
                        attempts,
                        Ok(body.map(|wp| wp["lockVersion"].as_i64().unwrap_or(0))),
                    );
                }
                Err(error) => {
                    if !fetch_error_kind(&error).is_retryable() || self.budget_exhausted(attempts)
                    {
                        return (attempts, Err(error));
                    }
                    debug!(issue_key, attempts, %error, "retrying version token fetch");
                    self.wait(attempts, None).await;
                }
            }
        }
    }

    fn budget_exhausted(&self, attempts: u32) -> bool {
        attempts > self.retry.max_retries
    }

    async fn wait(&self, attempts: u32, retry_after_secs: Option<u64>) {
        let delay = retry_after_secs.map_or_else(
            || self.retry.backoff_for(attempts),
            std::time::Duration::from_secs,
        );
        debug!(attempts, delay_ms = delay.as_millis() as u64, "backing off");
        tokio::time::sleep(delay).await;
    }
}

/// Classify a client error from the version-token fetch.
fn fetch_error_kind(error: &SyncError) -> ErrorKind {
    match error {
        SyncError::Validation { status, .. } => {
            ErrorKind::from_status(*status).unwrap_or(ErrorKind::Validation)
        }
        SyncError::RateLimited { .. } => ErrorKind::RateLimited,
        _ => ErrorKind::TransientNetwork,
    }
}

/// Extract the created issue key from a success body.
///
/// Prefers the `id` field, falling back to the tail of the
/// `_links.self.href` when the body omits it.
fn extract_issue_key(body: &Value) -> Option<String> {
    match &body["id"] {
        Value::Number(n) => return Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => return Some(s.trim().to_string()),
        _ => {}
    }
    let href = body["_links"]["self"]["href"].as_str()?;
    let tail = href.trim_end_matches('/').rsplit('/').next()?;
    if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
        Some(tail.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn executor_for(server: &MockServer, max_retries: u32) -> MutationExecutor {
        let config = TrackerConfig::new(server.uri(), "test-key");
        let client = Arc::new(TrackerClient::new(&config).unwrap());
        let retry = RetryConfig::new(max_retries)
            .with_backoff_base(1)
            .without_jitter();
        MutationExecutor::new(client, retry, Arc::new(Semaphore::new(4)))
    }

    #[test]
    fn extracts_issue_key_from_id_or_href() {
        assert_eq!(
            extract_issue_key(&json!({"id": 4711})),
            Some("4711".to_string())
        );
        assert_eq!(
            extract_issue_key(&json!({"_links": {"self": {"href": "/api/v3/work_packages/99"}}})),
            Some("99".to_string())
        );
        assert_eq!(extract_issue_key(&json!({})), None);
    }

    #[tokio::test]
    async fn create_succeeds_first_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/work_packages"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"id": 4711, "lockVersion": 0})),
            )
            .mount(&server)
            .await;

        let outcome = executor_for(&server, 3).create(&json!({"subject": "x"})).await;
        assert!(outcome.ok);
        assert_eq!(outcome.issue_key, Some("4711".to_string()));
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.dropped);
    }

    #[tokio::test]
    async fn persistent_5xx_yields_dropped_after_bounded_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/work_packages"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let outcome = executor_for(&server, 2).create(&json!({"subject": "x"})).await;
        assert!(!outcome.ok);
        assert!(outcome.dropped);
        assert_eq!(outcome.attempts, 3); // max_retries + 1
        assert_eq!(outcome.error, Some(ErrorKind::TransientNetwork));
    }

    #[tokio::test]
    async fn validation_error_is_terminal_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/work_packages"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "errorIdentifier": "urn:openproject-org:api:v3:errors:PropertyConstraintViolation",
                "message": "Subject can't be blank."
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = executor_for(&server, 3).create(&json!({})).await;
        assert!(!outcome.ok);
        assert!(!outcome.dropped);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.error, Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn rate_limit_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/work_packages"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v3/work_packages"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7})))
            .mount(&server)
            .await;

        let outcome = executor_for(&server, 3).create(&json!({"subject": "x"})).await;
        assert!(outcome.ok);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn update_refreshes_token_once_on_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/work_packages/42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 42, "lockVersion": 3})),
            )
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/api/v3/work_packages/42"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "errorIdentifier": "urn:openproject-org:api:v3:errors:UpdateConflict",
                "message": "Update conflict"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/api/v3/work_packages/42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 42, "lockVersion": 4})),
            )
            .mount(&server)
            .await;

        let outcome = executor_for(&server, 3)
            .update("42", &json!({"subject": "new"}))
            .await;
        assert!(outcome.ok);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn second_conflict_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/work_packages/42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 42, "lockVersion": 3})),
            )
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/api/v3/work_packages/42"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "errorIdentifier": "urn:openproject-org:api:v3:errors:UpdateConflict",
                "message": "Update conflict"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let outcome = executor_for(&server, 5)
            .update("42", &json!({"subject": "new"}))
            .await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error, Some(ErrorKind::VersionConflict));
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn gone_target_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/work_packages/42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 42, "lockVersion": 1})),
            )
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/api/v3/work_packages/42"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "errorIdentifier": "urn:openproject-org:api:v3:errors:NotFound",
                "message": "The requested resource could not be found."
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = executor_for(&server, 5)
            .update("42", &json!({"subject": "new"}))
            .await;
        assert!(!outcome.ok);
        assert!(outcome.is_gone());
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn retry_after_header_overrides_backoff_schedule() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/work_packages"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v3/work_packages"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 8})))
            .mount(&server)
            .await;

        let config = TrackerConfig::new(server.uri(), "test-key");
        let client = Arc::new(TrackerClient::new(&config).unwrap());
        // Exponential schedule would wait 5s; the header says now.
        let retry = RetryConfig::new(3).with_backoff_base(5_000).without_jitter();
        let executor = MutationExecutor::new(client, retry, Arc::new(Semaphore::new(4)));

        let started = std::time::Instant::now();
        let outcome = executor.create(&json!({"subject": "x"})).await;
        assert!(outcome.ok);
        assert_eq!(outcome.attempts, 2);
        assert!(started.elapsed() < std::time::Duration::from_millis(2_500));
    }

    #[tokio::test]
    async fn transient_token_fetch_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/work_packages/42"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v3/work_packages/42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 42, "lockVersion": 5})),
            )
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/api/v3/work_packages/42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 42, "lockVersion": 6})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let outcome = executor_for(&server, 2)
            .update("42", &json!({"subject": "new"}))
            .await;
        assert!(outcome.ok);
    }

    #[tokio::test]
    async fn exhausted_token_fetch_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/work_packages/42"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let outcome = executor_for(&server, 2)
            .update("42", &json!({"subject": "new"}))
            .await;
        assert!(!outcome.ok);
        assert!(outcome.dropped);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.error, Some(ErrorKind::TransientNetwork));
    }

    #[tokio::test]
    async fn missing_target_on_fetch_is_gone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/work_packages/42"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "errorIdentifier": "urn:openproject-org:api:v3:errors:NotFound",
                "message": "The requested resource could not be found."
            })))
            .mount(&server)
            .await;

        let outcome = executor_for(&server, 5)
            .update("42", &json!({"subject": "new"}))
            .await;
        assert!(outcome.is_gone());
    }
}
