pub mod forward;
pub mod target;

use anyhow::{Context, Result};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error};
use url::Url;
use uuid::Uuid;

use crate::commands::helper::CommandRunner;
use crate::config::Config;
use crate::proxy::forward::{HttpDispatch, OutboundRequest, RequestForwarder, UpstreamResponse};
use crate::proxy::target::extract_target;
use crate::security::{CredentialCache, CredentialProvider};

/// A failure the listener can answer with: 400 for bad targets, 500 for
/// everything else. The message lands in the JSON error body.
#[derive(Debug)]
pub struct ProxyFailure {
    pub status: StatusCode,
    pub message: String,
}

impl ProxyFailure {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

/// Per-request orchestration: extract target, resolve credential, build the
/// outbound request, forward it. Explicitly constructed with its external
/// capabilities injected so tests can substitute both.
pub struct ProxyService {
    cache: CredentialCache,
    provider: CredentialProvider,
    forwarder: RequestForwarder,
    prefix: String,
    cookie_name: String,
}

impl ProxyService {
    pub fn new(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
        dispatch: Arc<dyn HttpDispatch>,
    ) -> Self {
        Self {
            cache: CredentialCache::new(config.cache_timeout_ms),
            provider: CredentialProvider::new(runner, config.helper.clone()),
            forwarder: RequestForwarder::new(dispatch, config.retry_count),
            prefix: config.proxy_prefix.clone(),
            cookie_name: config.cookie_name.clone(),
        }
    }

    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }

    /// Handle one inbound request end to end.
    pub async fn handle(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<UpstreamResponse, ProxyFailure> {
        let request_id = Uuid::new_v4();

        let target = extract_target(path_and_query, &self.prefix)
            .map_err(|err| ProxyFailure::bad_request(err.to_string()))?;
        debug!(
            request_id = %request_id,
            method = %method,
            target = %target,
            "proxying request"
        );

        let authority = authority_key(&target);
        let token = match self.cache.get(&authority).await {
            Some(token) => token,
            None => {
                let origin = origin_of(&target);
                let token = self.provider.obtain(&origin).await.map_err(|err| {
                    error!(
                        request_id = %request_id,
                        origin = %origin,
                        error = %err,
                        "credential acquisition failed"
                    );
                    ProxyFailure::internal(format!("{err:#}"))
                })?;
                self.cache.put(&authority, token.clone()).await;
                token
            }
        };

        let outbound = build_outbound(method, target, headers, body, &self.cookie_name, &token)
            .map_err(|err| ProxyFailure::internal(format!("{err:#}")))?;

        self.forwarder.forward(&outbound).await.map_err(|err| {
            error!(
                request_id = %request_id,
                url = %outbound.url,
                error = %err,
                "forwarding exhausted retry budget"
            );
            ProxyFailure::internal(format!("{err:#}"))
        })
    }
}

/// Cache key: host, plus the port when the target names a non-default one.
fn authority_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Origin handed to the credential helper: scheme://host[:port].
fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Copy inbound headers (minus any name starting with `host`), inject the
/// credential cookie, and attach the body for mutating methods, defaulting
/// Content-Type to JSON only when the caller set none.
fn build_outbound(
    method: Method,
    url: Url,
    headers: &HeaderMap,
    body: Option<Bytes>,
    cookie_name: &str,
    token: &str,
) -> Result<OutboundRequest> {
    let mut out_headers = HeaderMap::new();
    for (name, value) in headers {
        if name.as_str().starts_with("host") {
            continue;
        }
        out_headers.append(name.clone(), value.clone());
    }

    let cookie = format!("{cookie_name}={token}");
    out_headers.insert(
        header::COOKIE,
        HeaderValue::from_str(&cookie).context("building credential cookie header")?,
    );

    let body = if is_mutating(&method) { body } else { None };
    if body.is_some() && !out_headers.contains_key(header::CONTENT_TYPE) {
        out_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }

    Ok(OutboundRequest {
        method,
        url,
        headers: out_headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_authority_key_with_and_without_port() {
        assert_eq!(authority_key(&url("https://example.com/a")), "example.com");
        assert_eq!(
            authority_key(&url("https://example.com:8443/a")),
            "example.com:8443"
        );
        // Default ports collapse away
        assert_eq!(authority_key(&url("https://example.com:443/a")), "example.com");
    }

    #[test]
    fn test_origin_of_drops_path_and_query() {
        assert_eq!(
            origin_of(&url("https://example.com/deep/path?q=1")),
            "https://example.com"
        );
        assert_eq!(
            origin_of(&url("http://example.com:8080/x")),
            "http://example.com:8080"
        );
    }

    #[test]
    fn test_build_outbound_filters_host_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("proxy.local"));
        headers.insert("host-override", HeaderValue::from_static("x"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));

        let out = build_outbound(
            Method::GET,
            url("https://example.com/a"),
            &headers,
            None,
            "CF_Authorization",
            "tok",
        )
        .unwrap();

        assert!(out.headers.get("host").is_none());
        assert!(out.headers.get("host-override").is_none());
        assert_eq!(out.headers.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn test_build_outbound_injects_cookie() {
        let out = build_outbound(
            Method::GET,
            url("https://example.com/a"),
            &HeaderMap::new(),
            None,
            "CF_Authorization",
            "tok-123",
        )
        .unwrap();

        assert_eq!(
            out.headers.get(header::COOKIE).unwrap(),
            "CF_Authorization=tok-123"
        );
    }

    #[test]
    fn test_body_attached_only_for_mutating_methods() {
        let body = Bytes::from_static(b"{\"k\":1}");

        let get = build_outbound(
            Method::GET,
            url("https://example.com/a"),
            &HeaderMap::new(),
            Some(body.clone()),
            "c",
            "t",
        )
        .unwrap();
        assert!(get.body.is_none());

        let post = build_outbound(
            Method::POST,
            url("https://example.com/a"),
            &HeaderMap::new(),
            Some(body.clone()),
            "c",
            "t",
        )
        .unwrap();
        assert_eq!(post.body, Some(body));
    }

    #[test]
    fn test_content_type_defaulted_only_when_absent() {
        let body = Bytes::from_static(b"payload");

        let defaulted = build_outbound(
            Method::POST,
            url("https://example.com/a"),
            &HeaderMap::new(),
            Some(body.clone()),
            "c",
            "t",
        )
        .unwrap();
        assert_eq!(
            defaulted.headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/csv"));
        let kept = build_outbound(
            Method::POST,
            url("https://example.com/a"),
            &headers,
            Some(body),
            "c",
            "t",
        )
        .unwrap();
        assert_eq!(kept.headers.get(header::CONTENT_TYPE).unwrap(), "text/csv");

        // No body, no defaulting
        let get = build_outbound(
            Method::GET,
            url("https://example.com/a"),
            &HeaderMap::new(),
            None,
            "c",
            "t",
        )
        .unwrap();
        assert!(get.headers.get(header::CONTENT_TYPE).is_none());
    }

    /// Runner that fails the test if the credential helper is ever invoked.
    struct ForbiddenRunner {
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl CommandRunner for ForbiddenRunner {
        async fn run(&self, _program: &str, _args: &[String]) -> Result<String> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("helper must not be invoked"))
        }
    }

    /// Dispatcher that records the request it saw and answers 200.
    struct RecordingDispatch {
        seen: Mutex<Vec<OutboundRequest>>,
    }

    #[async_trait]
    impl HttpDispatch for RecordingDispatch {
        async fn dispatch(&self, request: &OutboundRequest) -> Result<UpstreamResponse> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(UpstreamResponse {
                status: StatusCode::OK,
                content_type: Some("text/plain".to_string()),
                body: Bytes::from_static(b"upstream ok"),
            })
        }
    }

    fn service(
        runner: Arc<dyn CommandRunner>,
        dispatch: Arc<dyn HttpDispatch>,
    ) -> ProxyService {
        ProxyService::new(&Config::default(), runner, dispatch)
    }

    #[tokio::test]
    async fn test_handle_cache_hit_skips_helper() {
        let runner = Arc::new(ForbiddenRunner {
            invocations: AtomicUsize::new(0),
        });
        let dispatch = Arc::new(RecordingDispatch {
            seen: Mutex::new(Vec::new()),
        });
        let svc = service(runner.clone(), dispatch.clone());
        svc.cache().put("example.com", "cached-tok".to_string()).await;

        let response = svc
            .handle(
                Method::GET,
                "/curl/https://example.com/success",
                &HeaderMap::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"upstream ok");
        assert_eq!(runner.invocations.load(Ordering::SeqCst), 0);

        let seen = dispatch.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0].headers.get(header::COOKIE).unwrap(),
            "CF_Authorization=cached-tok"
        );
    }

    #[tokio::test]
    async fn test_handle_bad_target_is_400() {
        let runner = Arc::new(ForbiddenRunner {
            invocations: AtomicUsize::new(0),
        });
        let dispatch = Arc::new(RecordingDispatch {
            seen: Mutex::new(Vec::new()),
        });
        let svc = service(runner, dispatch);

        let failure = svc
            .handle(Method::GET, "/health", &HeaderMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(failure.status, StatusCode::BAD_REQUEST);

        let failure = svc
            .handle(
                Method::GET,
                "/curl/file:///etc/passwd",
                &HeaderMap::new(),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(failure.status, StatusCode::BAD_REQUEST);
        assert!(failure.message.contains("file"));
    }

    #[tokio::test]
    async fn test_handle_provider_failure_is_500() {
        let runner = Arc::new(ForbiddenRunner {
            invocations: AtomicUsize::new(0),
        });
        let dispatch = Arc::new(RecordingDispatch {
            seen: Mutex::new(Vec::new()),
        });
        let svc = service(runner.clone(), dispatch);

        let failure = svc
            .handle(
                Method::GET,
                "/curl/https://example.com/a",
                &HeaderMap::new(),
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(failure.status, StatusCode::INTERNAL_SERVER_ERROR);
        // Empty cache: token fetch then login both hit the failing runner
        assert_eq!(runner.invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handle_caches_token_after_obtain() {
        struct OneTokenRunner;

        #[async_trait]
        impl CommandRunner for OneTokenRunner {
            async fn run(&self, _program: &str, _args: &[String]) -> Result<String> {
                Ok("minted-tok\n".to_string())
            }
        }

        let dispatch = Arc::new(RecordingDispatch {
            seen: Mutex::new(Vec::new()),
        });
        let svc = service(Arc::new(OneTokenRunner), dispatch);

        svc.handle(
            Method::GET,
            "/curl/https://example.com/a",
            &HeaderMap::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            svc.cache().get("example.com").await,
            Some("minted-tok".to_string())
        );
    }
}
