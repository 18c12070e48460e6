//! PostgREST client for the hosted relational backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{header, Client, Method, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::RemoteError;
use crate::models::{DailyRecord, ProcedureCall, Profile};
use crate::remote::Remote;

// ============================================================================
// Constants
// ============================================================================

/// Path prefix of the REST surface under the backend base URL.
const REST_PREFIX: &str = "/rest/v1";

const DAILY_TABLE: &str = "daily_records";
const DAILY_CONFLICT_COLUMNS: &str = "user,date";
const PROFILE_TABLE: &str = "profiles";
const PROFILE_CONFLICT_COLUMNS: &str = "id";

/// HTTP request timeout in seconds for data calls.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Upserts merge on the conflict columns and echo the stored rows back.
const PREFER_UPSERT: &str = "resolution=merge-duplicates,return=representation";

/// REST client for the backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: String,
    token: Option<String>,
}

impl RestBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            token: None,
        })
    }

    /// A client acting as the signed-in user, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            token: Some(token),
        }
    }

    /// The URL the reachability monitor probes for the backend.
    pub fn probe_url(&self) -> String {
        format!("{}{}/", self.base_url, REST_PREFIX)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}{}/{}", self.base_url, REST_PREFIX, table)
    }

    fn rpc_url(&self, procedure: &str) -> String {
        format!("{}{}/rpc/{}", self.base_url, REST_PREFIX, procedure)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        // Without a user token the anon key doubles as the bearer
        let bearer = self.token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .header(header::ACCEPT, "application/json")
            .bearer_auth(bearer)
    }

    /// Send a request, retrying on 429 with exponential backoff.
    async fn send(
        &self,
        build: impl Fn() -> RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response, RemoteError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build().send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }
            if status.as_u16() == 429 {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(RemoteError::RateLimited);
                }
                warn!(url, retry = retries, backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, &body));
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, RemoteError> {
        let response = self
            .send(|| self.request(Method::GET, url).query(query), url)
            .await?;
        Ok(response.json().await?)
    }

    async fn upsert<T: Serialize + DeserializeOwned>(
        &self,
        table: &str,
        conflict_columns: &str,
        rows: &[T],
    ) -> Result<Vec<T>, RemoteError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.table_url(table);
        let response = self
            .send(
                || {
                    self.request(Method::POST, &url)
                        .query(&[("on_conflict", conflict_columns)])
                        .header("Prefer", PREFER_UPSERT)
                        .json(rows)
                },
                &url,
            )
            .await?;
        let stored: Vec<T> = response.json().await?;
        debug!(table, sent = rows.len(), stored = stored.len(), "Upsert confirmed");
        Ok(stored)
    }
}

/// PostgREST `in.(...)` filter value.
fn in_filter(dates: &[NaiveDate]) -> String {
    let list: Vec<String> = dates.iter().map(|d| d.format("%Y-%m-%d").to_string()).collect();
    format!("in.({})", list.join(","))
}

#[async_trait]
impl Remote for RestBackend {
    async fn upsert_daily(&self, records: &[DailyRecord]) -> Result<Vec<DailyRecord>, RemoteError> {
        self.upsert(DAILY_TABLE, DAILY_CONFLICT_COLUMNS, records).await
    }

    async fn upsert_profiles(&self, profiles: &[Profile]) -> Result<Vec<Profile>, RemoteError> {
        self.upsert(PROFILE_TABLE, PROFILE_CONFLICT_COLUMNS, profiles)
            .await
    }

    async fn delete_daily(&self, user: &str, dates: &[NaiveDate]) -> Result<(), RemoteError> {
        if dates.is_empty() {
            return Ok(());
        }
        let url = self.table_url(DAILY_TABLE);
        let query = [
            ("user", format!("eq.{}", user)),
            ("date", in_filter(dates)),
        ];
        self.send(|| self.request(Method::DELETE, &url).query(&query), &url)
            .await?;
        debug!(user, count = dates.len(), "Delete confirmed");
        Ok(())
    }

    async fn call_procedure(&self, call: &ProcedureCall) -> Result<Value, RemoteError> {
        let url = self.rpc_url(&call.procedure);
        let response = self
            .send(|| self.request(Method::POST, &url).json(&call.args), &url)
            .await?;
        // Void procedures answer 204 with an empty body
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", call.procedure, e)))
    }

    async fn fetch_daily(
        &self,
        user: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyRecord>, RemoteError> {
        let rows: Vec<DailyRecord> = self
            .get_json(
                &self.table_url(DAILY_TABLE),
                &[
                    ("user", format!("eq.{}", user)),
                    ("date", format!("eq.{}", date.format("%Y-%m-%d"))),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_daily_range(
        &self,
        user: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyRecord>, RemoteError> {
        self.get_json(
            &self.table_url(DAILY_TABLE),
            &[
                ("user", format!("eq.{}", user)),
                ("date", format!("gte.{}", start.format("%Y-%m-%d"))),
                ("date", format!("lte.{}", end.format("%Y-%m-%d"))),
                ("order", "date.asc".to_string()),
            ],
        )
        .await
    }

    async fn fetch_profile(&self, user: &str) -> Result<Option<Profile>, RemoteError> {
        let rows: Vec<Profile> = self
            .get_json(
                &self.table_url(PROFILE_TABLE),
                &[("id", format!("eq.{}", user)), ("limit", "1".to_string())],
            )
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let backend = RestBackend::new("https://db.example.org/", "anon").unwrap();
        assert_eq!(backend.probe_url(), "https://db.example.org/rest/v1/");
        assert_eq!(
            backend.table_url(DAILY_TABLE),
            "https://db.example.org/rest/v1/daily_records"
        );
        assert_eq!(
            backend.rpc_url("claim_territory"),
            "https://db.example.org/rest/v1/rpc/claim_territory"
        );
    }

    #[test]
    fn test_in_filter() {
        let dates = [
            NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
        ];
        assert_eq!(in_filter(&dates), "in.(2025-01-05,2025-01-06)");
    }

    #[test]
    fn test_with_token_keeps_base() {
        let backend = RestBackend::new("https://db.example.org", "anon").unwrap();
        let user = backend.with_token("jwt".to_string());
        assert_eq!(user.token.as_deref(), Some("jwt"));
        assert_eq!(user.base_url, backend.base_url);
        assert!(backend.token.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        let backend = RestBackend::new("http://127.0.0.1:9", "anon").unwrap();
        let err = backend
            .fetch_profile("u1")
            .await
            .expect_err("nothing listens on port 9");
        assert!(!err.reason().is_permanent());
    }
}
