//! HTTP client for the adapter service
//!
//! Both endpoints take a JSON `QueryParams` body and answer with a
//! `{success, data, errorMsg}` envelope.

use crate::error::{AdapterError, AdapterResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracelens_core::{
    flatten_groups, ApmError, ApmResult, QueryParams, Span, SpanGroup, TraceAdapter,
};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    /// `null` when the backend has nothing
    data: Option<Vec<T>>,
    #[serde(default)]
    error_msg: String,
}

/// Adapter backed by the `/trace/list` and `/trace/detail` endpoints
pub struct HttpAdapter {
    client: Client,
    list_url: String,
    detail_url: String,
}

impl HttpAdapter {
    /// Create a client for `address`, given as `host:port` or a full URL
    pub fn new(address: &str, timeout: Duration) -> AdapterResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("tracelens/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        let base_url = base_url(address);
        Ok(Self {
            client,
            list_url: format!("{}/trace/list", base_url),
            detail_url: format!("{}/trace/detail", base_url),
        })
    }

    /// Spans of the whole trace, flattened from the returned span groups
    pub async fn list(&self, params: &QueryParams) -> AdapterResult<Vec<Span>> {
        let groups: Vec<SpanGroup> = self.post(&self.list_url, params).await?;
        Ok(flatten_groups(groups))
    }

    /// Spans of one node's time window
    pub async fn detail(&self, params: &QueryParams) -> AdapterResult<Vec<Span>> {
        self.post(&self.detail_url, params).await
    }

    async fn post<T: DeserializeOwned>(&self, url: &str, params: &QueryParams) -> AdapterResult<Vec<T>> {
        debug!(
            url,
            trace_id = %params.trace_id,
            apm_type = %params.apm_type,
            "Querying adapter"
        );
        let response = self.client.post(url).json(params).send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "Adapter returned an error status");
            return Err(AdapterError::server(status.as_u16(), body));
        }

        let envelope: Envelope<T> = serde_json::from_str(&body)?;
        if !envelope.success {
            return Err(AdapterError::Rejected(envelope.error_msg));
        }
        Ok(envelope.data.unwrap_or_default())
    }
}

fn base_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

#[async_trait]
impl TraceAdapter for HttpAdapter {
    async fn query_list(&self, params: &QueryParams) -> ApmResult<Vec<Span>> {
        let spans = self.list(params).await?;
        if spans.is_empty() {
            return Err(ApmError::TraceNotFound(params.trace_id.clone()));
        }
        Ok(spans)
    }

    async fn query_detail(&self, params: &QueryParams) -> ApmResult<Vec<Span>> {
        Ok(self.detail(params).await?)
    }
}
