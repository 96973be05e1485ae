//! HTTP client for the remote feed service.

use crate::error::SourceError;
use crate::source::{CacheSource, EntityPage, FeedSource, HealthCheck, SourceRecord};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use feedsync_engine::{FeedBatch, FeedVersion};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// JSON-over-HTTP source.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    base_url: String,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| SourceError::Protocol(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(request: RequestBuilder) -> Result<Response, SourceError> {
        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SourceError::Unavailable(format!("server returned {}", status)));
        }
        if !status.is_success() {
            return Err(SourceError::Protocol(format!("server returned {}", status)));
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, SourceError> {
        let response = Self::send(request).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        serde_json::from_slice(&body)
            .map_err(|e| SourceError::Protocol(format!("invalid response body: {}", e)))
    }
}

#[async_trait]
impl FeedSource for HttpSource {
    async fn fetch_feed(
        &self,
        entity_type: &str,
        from_version: Option<FeedVersion>,
        limit: usize,
    ) -> Result<FeedBatch<SourceRecord>, SourceError> {
        let mut request = self
            .client
            .get(self.url(&format!("feed/{}", entity_type)))
            .query(&[("resultsLimit", limit.to_string())]);
        if let Some(version) = from_version {
            request = request.query(&[("fromVersion", version.to_string())]);
        }

        let batch: FeedBatch<SourceRecord> = Self::get_json(request).await?;
        tracing::debug!(
            entity_type = %entity_type,
            records = batch.len(),
            to_version = %batch.to_version,
            "Feed page received"
        );
        Ok(batch)
    }
}

#[async_trait]
impl CacheSource for HttpSource {
    async fn fetch_page(
        &self,
        entity_type: &str,
        changed_since: Option<DateTime<Utc>>,
        page: Option<&str>,
        limit: usize,
    ) -> Result<EntityPage, SourceError> {
        let mut request = self
            .client
            .get(self.url(&format!("entities/{}", entity_type)))
            .query(&[("resultsLimit", limit.to_string())]);
        if let Some(since) = changed_since {
            request = request.query(&[("changedSince", since.to_rfc3339_opts(SecondsFormat::Millis, true))]);
        }
        if let Some(page) = page {
            request = request.query(&[("page", page)]);
        }

        Self::get_json(request).await
    }
}

#[async_trait]
impl HealthCheck for HttpSource {
    async fn health(&self) -> Result<(), SourceError> {
        Self::send(self.client.get(self.url("health"))).await?;
        Ok(())
    }
}
