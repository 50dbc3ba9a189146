use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

use crate::FlagError;

const DEFAULT_TABLE: &str = "feature_flags";
const MAX_RETRIES: u32 = 3;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote table of flags.
///
/// Rows are returned untyped so that the store can drop malformed rows
/// individually instead of failing the whole result set.
#[async_trait]
pub trait FlagSource {
    async fn fetch_all(&self) -> Result<Vec<Value>, FlagError>;
}

/// Queries a PostgREST-compatible endpoint for `(name, enabled)` rows.
pub struct RestSource {
    base_url: String,
    table: String,
    http_client: reqwest::Client,
    headers: HeaderMap,
    max_retries: u32,
}

impl RestSource {
    pub fn builder() -> RestSourceBuilder {
        RestSourceBuilder::new()
    }

    fn query_url(&self) -> String {
        format!(
            "{}/rest/v1/{}?select=name,enabled&order=name.asc",
            self.base_url.trim_end_matches('/'),
            self.table
        )
    }

    async fn fetch_once(&self) -> Result<Vec<Value>, FlagError> {
        let response = self
            .http_client
            .get(self.query_url())
            .headers(self.headers.clone())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FlagError::ApiError(format!(
                "Unexpected status code: {}",
                response.status()
            )));
        }

        match response.json::<Value>().await? {
            Value::Array(rows) => Ok(rows),
            other => Err(FlagError::ApiError(format!(
                "Expected an array of flag rows, got {}",
                kind_of(&other)
            ))),
        }
    }
}

#[async_trait]
impl FlagSource for RestSource {
    async fn fetch_all(&self) -> Result<Vec<Value>, FlagError> {
        let mut last_error = None;

        for retry in 0..self.max_retries {
            match self.fetch_once().await {
                Ok(rows) => return Ok(rows),
                Err(e) => {
                    warn!("Flag query attempt {} failed: {}", retry + 1, e);
                    last_error = Some(e);
                    if retry + 1 < self.max_retries {
                        tokio::time::sleep(Duration::from_secs((retry + 1) as u64)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FlagError::ApiError("No query attempts were made".to_string())))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub struct RestSourceBuilder {
    base_url: Option<String>,
    api_key: Option<String>,
    table: String,
    max_retries: u32,
    timeout: Duration,
}

impl RestSourceBuilder {
    fn new() -> Self {
        Self {
            base_url: None,
            api_key: None,
            table: DEFAULT_TABLE.to_string(),
            max_retries: MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = Some(base_url.to_string());
        self
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<RestSource, FlagError> {
        let base_url = match self.base_url {
            Some(url) if !url.is_empty() => url,
            _ => return Err(FlagError::ConfigError("Base URL is required".to_string())),
        };
        if self.table.is_empty() {
            return Err(FlagError::ConfigError("Table name is required".to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", HeaderValue::from_static("Flagstore-Rust"));
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        if let Some(api_key) = &self.api_key {
            let key = HeaderValue::from_str(api_key)
                .map_err(|_| FlagError::ConfigError("API key is not a valid header value".to_string()))?;
            let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|_| FlagError::ConfigError("API key is not a valid header value".to_string()))?;
            headers.insert("apikey", key);
            headers.insert(AUTHORIZATION, bearer);
        }

        let http_client = reqwest::Client::builder().timeout(self.timeout).build()?;

        Ok(RestSource {
            base_url,
            table: self.table,
            http_client,
            headers,
            max_retries: self.max_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn source_for(server: &MockServer) -> RestSource {
        RestSource::builder()
            .with_base_url(&server.uri())
            .with_api_key("anon-key")
            .with_max_retries(1)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_base_url() {
        let err = RestSource::builder().build().err().unwrap();
        assert!(matches!(err, FlagError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_fetch_all_queries_projected_ordered_rows() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/feature_flags"))
            .and(query_param("select", "name,enabled"))
            .and(query_param("order", "name.asc"))
            .and(header("apikey", "anon-key"))
            .and(header("authorization", "Bearer anon-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "beta_marketplace", "enabled": true},
                {"name": "quiz_v2", "enabled": false}
            ])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let rows = source_for(&mock_server).fetch_all().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "beta_marketplace");
    }

    #[tokio::test]
    async fn test_fetch_all_reports_status_errors() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let err = source_for(&mock_server).fetch_all().await.unwrap_err();
        assert!(matches!(err, FlagError::ApiError(_)));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_fetch_all_rejects_non_array_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"flags": []})))
            .mount(&mock_server)
            .await;

        let err = source_for(&mock_server).fetch_all().await.unwrap_err();
        assert!(err.to_string().contains("an object"));
    }

    #[tokio::test]
    async fn test_fetch_all_retries_before_failing() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&mock_server)
            .await;

        let source = RestSource::builder()
            .with_base_url(&mock_server.uri())
            .with_max_retries(2)
            .build()
            .unwrap();

        assert!(source.fetch_all().await.is_err());
    }
}
