//! Relay REST control plane
//!
//! Every request carries `Authorization: Bearer <api key>` and
//! `Content-Type: application/json`. Responses are classified as:
//! - no response at all: [`RelayError::Network`]
//! - status outside 200-299: [`RelayError::Api`], body ignored
//! - 2xx with a body of the wrong shape: [`RelayError::Decode`]

mod models;

pub use models::{HistoryMessage, HistoryQuery, QueueInfo, DEFAULT_HISTORY_LIMIT};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use models::CreateQueueRequest;

use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

/// Typed client for the Relay REST API
#[derive(Debug, Clone)]
pub struct RestGateway {
    http: reqwest::Client,
    base: Url,
    api_key: String,
}

impl RestGateway {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let base = config.api_base()?;
        let http = reqwest::Client::builder()
            .read_timeout(config.request_timeout)
            .timeout(config.resource_timeout)
            .build()
            .map_err(|e| RelayError::InvalidConfiguration(e.to_string()))?;

        Ok(Self {
            http,
            base,
            api_key: config.api_key.clone(),
        })
    }

    /// Base URL every endpoint is resolved against
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RelayError::InvalidResponse(format!("'{}' cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);

        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }

        Ok(url)
    }

    /// Send a request and decode a JSON response
    pub async fn request<T, B>(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(segments, query)?;
        debug!(method = %method, url = %url, "REST request");

        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json");

        if let Some(body) = body {
            request = request.body(serde_json::to_vec(body)?);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            debug!(method = %method, url = %url, status = status.as_u16(), "REST request rejected");
            return Err(RelayError::api(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// `POST /queues`
    pub async fn create_queue(&self, name: &str) -> Result<QueueInfo> {
        self.request(
            Method::POST,
            &["queues"],
            &[],
            Some(&CreateQueueRequest { name }),
        )
        .await
    }

    /// `GET /queues/{name}`
    pub async fn get_queue_info(&self, name: &str) -> Result<QueueInfo> {
        self.request::<_, ()>(Method::GET, &["queues", name], &[], None)
            .await
    }

    /// `GET /history/{subject}`
    ///
    /// Never returns more than `query.limit` entries; server order is kept.
    pub async fn get_history(&self, query: &HistoryQuery) -> Result<Vec<HistoryMessage>> {
        let pairs = query.query_pairs();
        let mut messages: Vec<HistoryMessage> = self
            .request::<_, ()>(Method::GET, &["history", query.subject.as_str()], &pairs, None)
            .await?;

        let limit = query.limit as usize;
        if messages.len() > limit {
            warn!(
                subject = %query.subject,
                limit,
                returned = messages.len(),
                "History response exceeded limit, truncating"
            );
            messages.truncate(limit);
        }

        Ok(messages)
    }
}
