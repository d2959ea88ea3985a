//! Vendor-neutral JSON-over-HTTP remote tier.
//!
//! Endpoints, relative to the configured base URL:
//! - `PUT    /memories/{id}` with a [`MemoryRecord`] body
//! - `GET    /memories/{id}` returning a record, or 404
//! - `DELETE /memories/{id}` returning 2xx, or 404 when absent
//! - `POST   /memories/query` with `{embedding, filter, limit}` returning
//!   `[{record, similarity}]`

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{QueryFilter, StorageAdapter};
use crate::config::RemoteConfig;
use crate::memory::types::{MemoryRecord, ScoredRecord};

pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    embedding: &'a [f32],
    filter: &'a QueryFilter,
    limit: usize,
}

#[derive(Deserialize)]
struct QueryHit {
    record: MemoryRecord,
    similarity: f32,
}

impl HttpRemoteStore {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        if config.url.is_empty() {
            bail!("remote.url must be set for the http provider");
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn record_url(&self, id: &str) -> String {
        format!("{}/memories/{}", self.base_url, id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) if !key.is_empty() => request.bearer_auth(key),
            _ => request,
        }
    }
}

async fn ensure_success(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    bail!("remote {what} returned HTTP {status}: {body}")
}

#[async_trait]
impl StorageAdapter for HttpRemoteStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn put(&self, record: &MemoryRecord) -> Result<()> {
        let response = self
            .authorize(self.client.put(self.record_url(&record.id)))
            .json(record)
            .send()
            .await
            .context("remote put failed")?;
        ensure_success(response, "put").await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let response = self
            .authorize(self.client.get(self.record_url(id)))
            .send()
            .await
            .context("remote get failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = ensure_success(response, "get")
            .await?
            .json::<MemoryRecord>()
            .await
            .context("remote get returned an invalid record")?;
        Ok(Some(record))
    }

    async fn query(
        &self,
        embedding: &[f32],
        filter: &QueryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let response = self
            .authorize(self.client.post(format!("{}/memories/query", self.base_url)))
            .json(&QueryRequest {
                embedding,
                filter,
                limit,
            })
            .send()
            .await
            .context("remote query failed")?;
        let hits = ensure_success(response, "query")
            .await?
            .json::<Vec<QueryHit>>()
            .await
            .context("remote query returned invalid results")?;

        Ok(hits
            .into_iter()
            .map(|h| ScoredRecord {
                record: h.record,
                similarity: h.similarity,
            })
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let response = self
            .authorize(self.client.delete(self.record_url(id)))
            .send()
            .await
            .context("remote delete failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(response, "delete").await?;
        Ok(true)
    }
}
