use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use crate::config::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_MS};
use crate::domain::ResourcePointer;
use crate::error::BtcError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogFilters {
    pub owner: Option<String>,
    pub language: Option<String>,
    pub resource_id: Option<String>,
    pub subject: Option<String>,
    pub stage: Option<String>,
}

impl CatalogFilters {
    pub fn for_pointer(pointer: &ResourcePointer, stage: &str) -> Self {
        Self {
            owner: Some(pointer.owner.clone()),
            language: Some(pointer.language.clone()),
            resource_id: Some(pointer.resource_id.clone()),
            subject: None,
            stage: Some(stage.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enrichment {
    pub readme: Option<String>,
    pub license: Option<String>,
}

/// Remote catalog operations the engine depends on.
pub trait CatalogClient: Send + Sync {
    fn search_catalog(&self, filters: &CatalogFilters) -> Result<Vec<Value>, BtcError>;
    fn fetch_text_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<String, BtcError>;
    fn download_release_archive(
        &self,
        owner: &str,
        repo: &str,
        reference: &str,
    ) -> Result<Vec<u8>, BtcError>;
    fn enrich_metadata(&self, raw: &Value) -> Result<Enrichment, BtcError>;
}

/// Retry schedule for transient catalog failures: attempt `n` (from 0) waits
/// `backoff * (n + 1)` before the next try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt `attempt`, or `None` once
    /// retries are exhausted.
    pub fn delay_after(&self, attempt: usize) -> Option<Duration> {
        (attempt < self.max_retries).then(|| self.backoff * (attempt as u32 + 1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

/// Blocking client for a Door43/Gitea catalog server.
#[derive(Clone)]
pub struct Door43HttpClient {
    client: Client,
    server: String,
    retry: RetryPolicy,
}

impl Door43HttpClient {
    pub fn new(server: &str) -> Result<Self, BtcError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("btc-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BtcError::CatalogHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| BtcError::CatalogHttp(err.to_string()))?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn search_url(&self) -> String {
        format!("{}/api/v1/catalog/search", self.server)
    }

    pub fn raw_url(&self, owner: &str, repo: &str, path: &str) -> String {
        format!(
            "{}/api/v1/repos/{owner}/{repo}/raw/{}",
            self.server,
            path.trim_start_matches("./")
        )
    }

    pub fn archive_url(&self, owner: &str, repo: &str, reference: &str) -> String {
        format!("{}/{owner}/{repo}/archive/{reference}.zip", self.server)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, BtcError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "catalog request failed".to_string());
        Err(BtcError::CatalogStatus { status, message })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, BtcError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let outcome = make_req().send();
            let transient = match &outcome {
                Ok(resp) => is_transient_status(resp.status().as_u16()),
                Err(err) => err.is_timeout() || err.is_connect(),
            };
            match self.retry.delay_after(attempt) {
                Some(delay) if transient => {
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying catalog request");
                    thread::sleep(delay);
                    attempt += 1;
                }
                _ => return outcome.map_err(|err| BtcError::CatalogHttp(err.to_string())),
            }
        }
    }

    fn get_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String, BtcError> {
        let response = self.send_with_retries(|| self.client.get(url).query(query))?;
        let response = Self::handle_status(response)?;
        response
            .text()
            .map_err(|err| BtcError::CatalogHttp(err.to_string()))
    }
}

impl CatalogClient for Door43HttpClient {
    fn search_catalog(&self, filters: &CatalogFilters) -> Result<Vec<Value>, BtcError> {
        let mut query = Vec::new();
        if let Some(owner) = &filters.owner {
            query.push(("owner", owner.as_str()));
        }
        if let Some(language) = &filters.language {
            query.push(("lang", language.as_str()));
        }
        if let Some(subject) = &filters.subject {
            query.push(("subject", subject.as_str()));
        }
        if let Some(stage) = &filters.stage {
            query.push(("stage", stage.as_str()));
        }
        let repo = match (&filters.language, &filters.resource_id) {
            (Some(language), Some(id)) => Some(format!("{language}_{id}")),
            _ => None,
        };
        if let Some(repo) = &repo {
            query.push(("name", repo.as_str()));
        }

        let url = self.search_url();
        let response = self.send_with_retries(|| self.client.get(&url).query(&query))?;
        let response = Self::handle_status(response)?;
        let body: Value = response
            .json()
            .map_err(|err| BtcError::CatalogHttp(err.to_string()))?;
        let entries = body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .or_else(|| body.as_array().cloned())
            .unwrap_or_default();
        Ok(entries)
    }

    fn fetch_text_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<String, BtcError> {
        self.get_text(&self.raw_url(owner, repo, path), &[("ref", reference)])
    }

    fn download_release_archive(
        &self,
        owner: &str,
        repo: &str,
        reference: &str,
    ) -> Result<Vec<u8>, BtcError> {
        let url = self.archive_url(owner, repo, reference);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        let response = Self::handle_status(response)?;
        let bytes = response
            .bytes()
            .map_err(|err| BtcError::CatalogHttp(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn enrich_metadata(&self, raw: &Value) -> Result<Enrichment, BtcError> {
        let owner = raw
            .get("owner")
            .and_then(Value::as_str)
            .ok_or_else(|| BtcError::MalformedRecord("missing owner".to_string()))?;
        let repo = raw
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BtcError::MalformedRecord("missing repository name".to_string()))?;
        let reference = raw
            .get("release")
            .and_then(|release| release.get("tag_name"))
            .and_then(Value::as_str)
            .or_else(|| raw.get("branch_or_tag_name").and_then(Value::as_str))
            .unwrap_or("master");

        // A resource without a README or LICENSE is normal.
        let readme = self
            .fetch_text_content(owner, repo, "README.md", reference)
            .ok();
        let license = self
            .fetch_text_content(owner, repo, "LICENSE.md", reference)
            .ok();
        Ok(Enrichment { readme, license })
    }
}

fn is_transient_status(status: u16) -> bool {
    status == 429 || ((500..600).contains(&status) && status != 501)
}
