// ServiceNow REST client - rate limited, circuit broken, retrying transport

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    Credential, CredentialProvider, EncodedQuery, LeakyBucket, QueryOp, ServiceNowApi,
};
use crate::config::{RateLimitConfig, UpstreamConfig};
use crate::error::{CoreError, CoreResult};
use crate::upstream::{display_string, CircuitBreaker};
use chrono::{DateTime, NaiveDateTime, Utc};
use snowbridge_shared::{JournalElement, JournalEntry};

/// Parse an upstream glide timestamp (`YYYY-MM-DD HH:MM:SS`, UTC), with an
/// RFC 3339 fallback for display-value formats.
pub fn parse_sn_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub struct ServiceNowClient {
    http: reqwest::Client,
    origin: String,
    credentials: Arc<dyn CredentialProvider>,
    limiter: LeakyBucket,
    breaker: CircuitBreaker,
    max_retries: u32,
    backoff_base: Duration,
    rate_limit_hits: AtomicU64,
}

impl ServiceNowClient {
    pub fn new(
        config: &UpstreamConfig,
        limits: &RateLimitConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CoreError::Fatal(format!("http client init failed: {}", e)))?;

        let origin = url::Url::parse(&config.instance_url)
            .map_err(|e| {
                CoreError::Fatal(format!(
                    "invalid instance url '{}': {}",
                    config.instance_url, e
                ))
            })?
            .as_str()
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http,
            breaker: CircuitBreaker::new(
                origin.clone(),
                config.circuit_failure_threshold,
                Duration::from_secs(config.circuit_cooldown_secs),
            ),
            origin,
            credentials,
            limiter: LeakyBucket::new(limits.per_minute, limits.burst_size),
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            rate_limit_hits: AtomicU64::new(0),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// How many upstream 429s this client has absorbed, for telemetry.
    pub fn rate_limit_hits(&self) -> u64 {
        self.rate_limit_hits.load(Ordering::Relaxed)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/api/now/table/{}", self.origin, table)
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.backoff_base.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(8));
        let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
        tokio::time::sleep(Duration::from_millis(exp + jitter)).await;
    }

    /// Send a request with the full failure protocol: leaky-bucket pacing,
    /// circuit breaking, backoff retries on network/5xx, one credential
    /// refresh on 401, retry-after on 429. `Ok(None)` means upstream 404.
    async fn execute<F>(&self, build: F) -> CoreResult<Option<reqwest::Response>>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        self.limiter.acquire(&self.origin).await;

        let mut attempt: u32 = 0;
        let mut refreshed = false;
        loop {
            self.breaker.preflight()?;

            let request = match self.credentials.credential().await? {
                Credential::Basic { username, password } => {
                    build(&self.http).basic_auth(username, Some(password))
                }
                Credential::Bearer(token) => build(&self.http).bearer_auth(token),
            };

            match request.header(ACCEPT, "application/json").send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        self.breaker.record_success();
                        return Ok(Some(response));
                    }

                    match status {
                        StatusCode::UNAUTHORIZED => {
                            if refreshed {
                                self.breaker.record_failure();
                                return Err(CoreError::AuthExpired);
                            }
                            debug!(origin = %self.origin, "401 from upstream, refreshing credential");
                            self.credentials.refresh().await?;
                            refreshed = true;
                        }
                        StatusCode::NOT_FOUND => {
                            self.breaker.record_success();
                            return Ok(None);
                        }
                        StatusCode::TOO_MANY_REQUESTS => {
                            self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
                            let wait = response
                                .headers()
                                .get(RETRY_AFTER)
                                .and_then(|v| v.to_str().ok())
                                .and_then(|s| s.parse::<u64>().ok())
                                .unwrap_or(1);
                            if attempt >= self.max_retries {
                                return Err(CoreError::RateLimited {
                                    rate_source: self.origin.clone(),
                                    reset_secs: wait,
                                });
                            }
                            warn!(origin = %self.origin, wait_secs = wait, "upstream 429, honoring retry-after");
                            attempt += 1;
                            tokio::time::sleep(Duration::from_secs(wait)).await;
                        }
                        s if s.is_server_error() => {
                            self.breaker.record_failure();
                            if attempt >= self.max_retries {
                                return Err(CoreError::TransientUpstream {
                                    attempts: attempt + 1,
                                    message: format!("upstream returned {}", s),
                                });
                            }
                            self.backoff(attempt).await;
                            attempt += 1;
                        }
                        s => {
                            let body = response.text().await.unwrap_or_default();
                            return Err(CoreError::validation(
                                "request",
                                format!("upstream returned {}: {}", s, body),
                            ));
                        }
                    }
                }
                Err(err) => {
                    self.breaker.record_failure();
                    if attempt >= self.max_retries {
                        return Err(CoreError::TransientUpstream {
                            attempts: attempt + 1,
                            message: err.to_string(),
                        });
                    }
                    self.backoff(attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn json_result(response: reqwest::Response) -> CoreResult<Value> {
        let body: Value = response.json().await.map_err(|e| {
            CoreError::validation("response", format!("malformed upstream body: {}", e))
        })?;
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ServiceNowApi for ServiceNowClient {
    async fn query(
        &self,
        table: &str,
        encoded_query: &str,
        limit: u32,
        offset: u32,
    ) -> CoreResult<Vec<Value>> {
        let url = self.table_url(table);
        let query = encoded_query.to_string();
        let response = self
            .execute(move |http| {
                http.request(Method::GET, url.as_str()).query(&[
                    ("sysparm_query", query.as_str()),
                    ("sysparm_limit", &limit.to_string()),
                    ("sysparm_offset", &offset.to_string()),
                    ("sysparm_display_value", "all"),
                ])
            })
            .await?;

        match response {
            Some(resp) => match Self::json_result(resp).await? {
                Value::Array(records) => Ok(records),
                Value::Null => Ok(Vec::new()),
                single => Ok(vec![single]),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn get_record(&self, table: &str, sys_id: &str) -> CoreResult<Option<Value>> {
        let url = format!("{}/{}", self.table_url(table), sys_id);
        let response = self
            .execute(move |http| {
                http.request(Method::GET, url.as_str())
                    .query(&[("sysparm_display_value", "all")])
            })
            .await?;

        match response {
            Some(resp) => Ok(Some(Self::json_result(resp).await?)),
            None => Ok(None),
        }
    }

    async fn create_record(&self, table: &str, body: &Value) -> CoreResult<Value> {
        let url = self.table_url(table);
        let payload = body.clone();
        let response = self
            .execute(move |http| http.request(Method::POST, url.as_str()).json(&payload))
            .await?
            .ok_or_else(|| CoreError::not_found(format!("table {}", table)))?;
        Self::json_result(response).await
    }

    async fn update_record(
        &self,
        table: &str,
        sys_id: &str,
        changes: &Value,
    ) -> CoreResult<Value> {
        let url = format!("{}/{}", self.table_url(table), sys_id);
        let payload = changes.clone();
        let response = self
            .execute(move |http| http.request(Method::PATCH, url.as_str()).json(&payload))
            .await?
            .ok_or_else(|| CoreError::not_found(format!("{} {}", table, sys_id)))?;
        Self::json_result(response).await
    }

    async fn delete_record(&self, table: &str, sys_id: &str) -> CoreResult<bool> {
        let url = format!("{}/{}", self.table_url(table), sys_id);
        let response = self
            .execute(move |http| http.request(Method::DELETE, url.as_str()))
            .await?;
        Ok(response.is_some())
    }

    async fn fetch_journal(
        &self,
        element_id: &str,
        element: JournalElement,
    ) -> CoreResult<Vec<JournalEntry>> {
        let query = EncodedQuery::new()
            .and("element_id", QueryOp::Eq, element_id)
            .and("element", QueryOp::Eq, element.as_str())
            .order_by("sys_created_on")
            .build();

        let records = self.query("sys_journal_field", &query, 1000, 0).await?;

        let entries = records
            .iter()
            .filter_map(|record| {
                let value = record.get("value").and_then(display_string)?;
                let created_raw = record
                    .get("sys_created_on")
                    .and_then(super::raw_string)?;
                Some(JournalEntry {
                    element_id: element_id.to_string(),
                    element,
                    value,
                    created_at: parse_sn_datetime(&created_raw)?,
                    created_by: record
                        .get("sys_created_by")
                        .and_then(display_string)
                        .unwrap_or_default(),
                })
            })
            .collect();

        Ok(entries)
    }

    async fn upload_attachment(
        &self,
        table: &str,
        sys_id: &str,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> CoreResult<Value> {
        let url = format!("{}/api/now/attachment/file", self.origin);
        let table = table.to_string();
        let sys_id = sys_id.to_string();
        let file_name = file_name.to_string();
        let content_type = content_type.to_string();
        let sys_id_for_error = sys_id.clone();

        let response = self
            .execute(move |http| {
                http.request(Method::POST, url.as_str())
                    .query(&[
                        ("table_name", table.as_str()),
                        ("table_sys_id", sys_id.as_str()),
                        ("file_name", file_name.as_str()),
                    ])
                    .header(CONTENT_TYPE, content_type.as_str())
                    .body(bytes.clone())
            })
            .await?
            .ok_or_else(|| CoreError::not_found(format!("attachment target {}", sys_id_for_error)))?;
        Self::json_result(response).await
    }

    async fn download_attachment(&self, attachment_sys_id: &str) -> CoreResult<Option<Vec<u8>>> {
        let url = format!(
            "{}/api/now/attachment/{}/file",
            self.origin, attachment_sys_id
        );
        let response = self
            .execute(move |http| http.request(Method::GET, url.as_str()))
            .await?;

        match response {
            Some(resp) => {
                let bytes = resp.bytes().await.map_err(|e| {
                    CoreError::validation("response", format!("attachment read failed: {}", e))
                })?;
                Ok(Some(bytes.to_vec()))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::StaticCredentials;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(url: &str) -> UpstreamConfig {
        UpstreamConfig {
            instance_url: url.to_string(),
            username: "bridge".into(),
            password: "secret".into(),
            timeout_secs: 5,
            max_retries: 2,
            backoff_base_ms: 1,
            circuit_failure_threshold: 10,
            circuit_cooldown_secs: 1,
        }
    }

    fn test_limits() -> RateLimitConfig {
        RateLimitConfig {
            per_minute: 6000,
            per_hour: 100_000,
            burst_size: 100,
        }
    }

    fn client(url: &str) -> ServiceNowClient {
        ServiceNowClient::new(
            &test_config(url),
            &test_limits(),
            Arc::new(StaticCredentials::basic("bridge", "secret")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_query_parses_result_array() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident"))
            .and(query_param("sysparm_limit", "50"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [{"sys_id": "a".repeat(32), "number": "INC0000001"}]
            })))
            .mount(&server)
            .await;

        let records = client(&server.uri())
            .query("incident", "state=2", 50, 0)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["number"], "INC0000001");
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident/abc"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident/abc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"result": {"sys_id": "abc"}})),
            )
            .mount(&server)
            .await;

        let record = client(&server.uri())
            .get_record("incident", "abc")
            .await
            .unwrap();
        assert_eq!(record.unwrap()["sys_id"], "abc");
    }

    #[tokio::test]
    async fn test_surfaces_after_retry_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident/abc"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .get_record("incident", "abc")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TRANSIENT_UPSTREAM");
    }

    #[tokio::test]
    async fn test_404_maps_to_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let record = client(&server.uri())
            .get_record("incident", "missing")
            .await
            .unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_401_refreshes_once_then_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident/abc"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident/abc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"result": {"sys_id": "abc"}})),
            )
            .mount(&server)
            .await;

        let record = client(&server.uri())
            .get_record("incident", "abc")
            .await
            .unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn test_second_401_surfaces_auth_expired() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident/abc"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .get_record("incident", "abc")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "AUTH_EXPIRED");
    }

    #[tokio::test]
    async fn test_429_honors_retry_after_and_counts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident/abc"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident/abc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"result": {"sys_id": "abc"}})),
            )
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let record = client.get_record("incident", "abc").await.unwrap();
        assert!(record.is_some());
        assert_eq!(client.rate_limit_hits(), 1);
    }

    #[tokio::test]
    async fn test_journal_fetch_maps_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/sys_journal_field"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [
                    {
                        "value": {"display_value": "restarted the mail relay", "value": "restarted the mail relay"},
                        "sys_created_on": {"display_value": "2025-06-01 09:15:00", "value": "2025-06-01 09:15:00"},
                        "sys_created_by": "ops.bot"
                    }
                ]
            })))
            .mount(&server)
            .await;

        let entries = client(&server.uri())
            .fetch_journal("abc", JournalElement::WorkNotes)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, "restarted the mail relay");
        assert_eq!(entries[0].element, JournalElement::WorkNotes);
        assert_eq!(entries[0].created_by, "ops.bot");
    }

    #[test]
    fn test_parse_sn_datetime() {
        let parsed = parse_sn_datetime("2025-06-01 09:15:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-06-01T09:15:00+00:00");
        assert!(parse_sn_datetime("2025-06-01T09:15:00Z").is_some());
        assert!(parse_sn_datetime("junk").is_none());
    }
}
