//! Document index providers
//!
//! The index enumerates candidate legacy ids once, before any mutation.
//! [`QueryServiceIndex`] asks the cluster's query service;
//! [`StaticIndex`] replays a fixed list.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use keymend_core::{DocumentId, KvError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::migration::{MigrationError, Result};

/// Source of candidate document ids
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Ids matching a `LIKE` pattern given as a JSON string literal
    async fn query(&self, like_pattern: &str) -> Result<Vec<DocumentId>>;
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    statement: &'a str,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    results: Vec<IdRow>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: String,
}

/// Query-service backed index
pub struct QueryServiceIndex {
    client: reqwest::Client,
    url: String,
    bucket: String,
    username: String,
    password: String,
}

impl QueryServiceIndex {
    pub fn new(
        url: impl Into<String>,
        bucket: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        verify_tls: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| MigrationError::ClusterQuery(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            bucket: bucket.into(),
            username: username.into(),
            password: password.into(),
        })
    }

    /// The statement sent for `like_pattern`
    pub fn statement(&self, like_pattern: &str) -> String {
        format!(
            "select meta().id from `{}` where meta().id like {}",
            self.bucket, like_pattern
        )
    }
}

#[async_trait]
impl DocumentIndex for QueryServiceIndex {
    async fn query(&self, like_pattern: &str) -> Result<Vec<DocumentId>> {
        let statement = self.statement(like_pattern);
        debug!(url = %self.url, %statement, "querying document index");

        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&QueryRequest {
                statement: &statement,
            })
            .send()
            .await
            .map_err(|e| MigrationError::ClusterQuery(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MigrationError::ClusterQuery(format!("reading response: {}", e)))?;
        if !status.is_success() {
            return Err(MigrationError::ClusterQuery(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let parsed: QueryResponse = serde_json::from_str(&body)
            .map_err(|e| MigrationError::ClusterQuery(format!("malformed response: {}", e)))?;
        if !parsed.errors.is_empty() {
            return Err(MigrationError::ClusterQuery(
                serde_json::Value::Array(parsed.errors).to_string(),
            ));
        }
        if !parsed.status.is_empty() && parsed.status != "success" {
            return Err(MigrationError::ClusterQuery(format!(
                "query ended with status {:?}",
                parsed.status
            )));
        }

        let ids: Vec<DocumentId> = parsed
            .results
            .into_iter()
            .map(|row| DocumentId::from(row.id))
            .collect();
        info!(count = ids.len(), "indexed legacy document ids");
        Ok(ids)
    }
}

/// A fixed id list
#[derive(Debug, Clone, Default)]
pub struct StaticIndex {
    ids: Vec<DocumentId>,
}

impl StaticIndex {
    pub fn new(ids: Vec<DocumentId>) -> Self {
        Self { ids }
    }

    /// Read one id per line
    ///
    /// A line starting with `"` is a JSON string literal, which is how
    /// ids with control bytes are written (and how keymend logs them).
    /// Blank lines are ignored.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            KvError::Config(format!("Failed to read ids file {:?}: {}", path, e))
        })?;
        Self::parse_str(&contents)
    }

    pub fn parse_str(contents: &str) -> Result<Self> {
        let mut ids = Vec::new();
        for (n, line) in contents.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let id = if line.starts_with('"') {
                serde_json::from_str::<String>(line).map_err(|e| {
                    KvError::Config(format!("ids file line {}: {}", n + 1, e))
                })?
            } else {
                line.to_string()
            };
            ids.push(DocumentId::from(id));
        }
        Ok(Self { ids })
    }

    pub fn ids(&self) -> &[DocumentId] {
        &self.ids
    }
}

#[async_trait]
impl DocumentIndex for StaticIndex {
    async fn query(&self, _like_pattern: &str) -> Result<Vec<DocumentId>> {
        Ok(self.ids.clone())
    }
}
