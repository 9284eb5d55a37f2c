use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// A fully prepared outbound request. Body bytes are `Bytes` so retries
/// reuse the same buffer without copying.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// What the caller gets back from the upstream: status, content type when
/// the upstream set one, and the raw body.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Capability seam for the outbound HTTP call, so forwarding can be tested
/// without a network.
#[async_trait]
pub trait HttpDispatch: Send + Sync {
    async fn dispatch(&self, request: &OutboundRequest) -> Result<UpstreamResponse>;
}

/// Production dispatcher over a shared reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestDispatch {
    client: reqwest::Client,
}

impl ReqwestDispatch {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpDispatch for ReqwestDispatch {
    async fn dispatch(&self, request: &OutboundRequest) -> Result<UpstreamResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.context("outbound request send")?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.context("reading upstream body")?;

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Executes outbound requests under the bounded retry policy.
///
/// Attempt budget is `retry_count + 1`. Transport failures and 5xx
/// responses are retried while attempts remain, with no delay between
/// attempts; the final outcome is returned as-is — a 5xx that survives the
/// budget is relayed to the caller, not rewritten as a proxy error.
pub struct RequestForwarder {
    dispatch: Arc<dyn HttpDispatch>,
    retry_count: u32,
}

impl RequestForwarder {
    pub fn new(dispatch: Arc<dyn HttpDispatch>, retry_count: u32) -> Self {
        Self {
            dispatch,
            retry_count,
        }
    }

    pub async fn forward(&self, request: &OutboundRequest) -> Result<UpstreamResponse> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let attempts_remain = attempt <= self.retry_count;

            match self.dispatch.dispatch(request).await {
                Ok(response) if response.status.is_server_error() && attempts_remain => {
                    warn!(
                        attempt = attempt,
                        status = %response.status,
                        url = %request.url,
                        "upstream returned 5xx, retrying"
                    );
                }
                Ok(response) => {
                    debug!(
                        attempt = attempt,
                        status = %response.status,
                        url = %request.url,
                        "forwarding complete"
                    );
                    return Ok(response);
                }
                Err(err) if attempts_remain => {
                    warn!(
                        attempt = attempt,
                        error = %err,
                        url = %request.url,
                        "outbound call failed, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}
