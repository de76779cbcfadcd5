//! HTTP transport
//!
//! The pipeline talks to the network only through `HttpTransport`, so the
//! request/refresh logic can run against a scripted transport in tests.
//! `ReqwestTransport` is the production implementation; it owns a
//! host-scoped cookie store that the Request Adapter purges before each call.

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Method;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::http_retry::{send_with_retry, RetryPolicy};
use super::ProviderError;
use crate::config::PipelineConfig;

/// Fully built request, ready for the transport
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url, timeout: Duration) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_len(&self) -> u64 {
        self.body.as_ref().map(|b| b.len() as u64).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Response whose body arrives as a stream of chunks
pub struct StreamingResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Vec<u8>, ProviderError>>,
}

impl StreamingResponse {
    /// Drain the body into memory (used for error responses)
    pub async fn collect(self) -> HttpResponse {
        let mut body = Vec::new();
        let mut stream = self.body;
        while let Some(Ok(chunk)) = stream.next().await {
            body.extend_from_slice(&chunk);
        }
        HttpResponse {
            status: self.status,
            headers: self.headers,
            body,
        }
    }
}

/// Called with the cumulative number of request-body bytes handed to the network
pub type BytesSent = Arc<dyn Fn(u64) + Send + Sync>;

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a request and buffer the whole response
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError>;

    /// Send a request and stream the response body
    async fn download(&self, request: HttpRequest) -> Result<StreamingResponse, ProviderError>;

    /// Send a request whose body is streamed in chunks, reporting bytes sent
    async fn upload(&self, request: HttpRequest, on_sent: BytesSent) -> Result<HttpResponse, ProviderError>;

    /// Forget every cookie stored for the host of `url`
    fn clear_cookies(&self, url: &Url);
}

/// Cookie jar over `cookie_store`, the store behind reqwest's own `Jar`.
///
/// Domain, Path, Expires and Max-Age are honored on insert. Unlike `Jar`,
/// every cookie a host would receive can be purged at once.
#[derive(Debug, Default)]
pub struct HostCookieStore {
    store: RwLock<cookie_store::CookieStore>,
}

impl HostCookieStore {
    /// Drop every cookie that would be sent to `url`'s host
    pub fn purge(&self, url: &Url) {
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        let doomed: Vec<(String, String, String)> = store
            .iter_any()
            .filter(|cookie| cookie.domain.matches(url))
            .map(|cookie| {
                (
                    String::from(&cookie.domain),
                    String::from(&cookie.path),
                    cookie.name().to_string(),
                )
            })
            .collect();
        for (domain, path, name) in &doomed {
            store.remove(domain, path, name);
        }
        if !doomed.is_empty() {
            debug!("Purged {} cookie(s) for {}", doomed.len(), url.host_str().unwrap_or_default());
        }
    }

    /// Unexpired cookies that would be sent to `url`
    pub fn cookie_count(&self, url: &Url) -> usize {
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        store.matches(url).len()
    }
}

impl reqwest::cookie::CookieStore for HostCookieStore {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let cookies = cookie_headers
            .filter_map(|header| header.to_str().ok())
            .filter_map(|value| cookie_store::RawCookie::parse(value).ok())
            .map(|cookie| cookie.into_owned())
            .collect::<Vec<_>>();
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        store.store_response_cookies(cookies.into_iter(), url);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        let value = store
            .get_request_values(url)
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        if value.is_empty() {
            return None;
        }
        HeaderValue::from_str(&value).ok()
    }
}

/// Production transport backed by reqwest
pub struct ReqwestTransport {
    client: reqwest::Client,
    cookies: Arc<HostCookieStore>,
    retry: RetryPolicy,
    chunk_size: usize,
}

impl ReqwestTransport {
    pub fn new(config: &PipelineConfig) -> Result<Self, ProviderError> {
        let cookies = Arc::new(HostCookieStore::default());
        let client = reqwest::Client::builder()
            .cookie_provider(cookies.clone())
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            cookies,
            retry: RetryPolicy::from(&config.retry),
            chunk_size: config.upload_chunk_size.max(1),
        })
    }

    pub fn cookie_store(&self) -> Arc<HostCookieStore> {
        self.cookies.clone()
    }

    fn to_reqwest(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .timeout(request.timeout);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        builder
    }
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Transport("Request timed out".to_string())
    } else if err.is_connect() {
        ProviderError::Transport(format!("Connection failed: {}", err))
    } else {
        ProviderError::Transport(err.to_string())
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError> {
        let request = self.to_reqwest(request).build().map_err(map_reqwest_error)?;
        let response = send_with_retry(&self.client, request, &self.retry)
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();
        Ok(HttpResponse { status, headers, body })
    }

    async fn download(&self, request: HttpRequest) -> Result<StreamingResponse, ProviderError> {
        let response = self.to_reqwest(request).send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let content_length = response.content_length().or_else(|| content_length(&headers));
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(map_reqwest_error))
            .boxed();
        Ok(StreamingResponse { status, headers, content_length, body })
    }

    async fn upload(&self, mut request: HttpRequest, on_sent: BytesSent) -> Result<HttpResponse, ProviderError> {
        let data = request.body.take().unwrap_or_default();
        let total = data.len();
        let chunks: Vec<Vec<u8>> = data.chunks(self.chunk_size).map(<[u8]>::to_vec).collect();
        let sent = Arc::new(AtomicU64::new(0));
        let stream = futures_util::stream::iter(chunks.into_iter().map(move |chunk| {
            let done = sent.fetch_add(chunk.len() as u64, Ordering::SeqCst) + chunk.len() as u64;
            on_sent(done);
            Ok::<_, std::io::Error>(chunk)
        }));

        let response = self
            .to_reqwest(request)
            .header(CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();
        Ok(HttpResponse { status, headers, body })
    }

    fn clear_cookies(&self, url: &Url) {
        self.cookies.purge(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::cookie::CookieStore;

    fn store_cookie(store: &HostCookieStore, url: &Url, header: &'static str) {
        let header = HeaderValue::from_static(header);
        store.set_cookies(&mut std::iter::once(&header), url);
    }

    #[test]
    fn test_cookie_store_scoped_by_host() {
        let store = HostCookieStore::default();
        let portal_a = Url::parse("https://a.example.com/api/2.0/files/@my").unwrap();
        let portal_b = Url::parse("https://b.example.com/").unwrap();
        store_cookie(&store, &portal_a, "session=one; Path=/");
        store_cookie(&store, &portal_b, "session=two");

        assert_eq!(store.cookies(&portal_a).unwrap(), "session=one");
        store.purge(&portal_a);
        assert!(store.cookies(&portal_a).is_none());
        assert_eq!(store.cookie_count(&portal_b), 1);
    }

    #[test]
    fn test_cookie_store_max_age_zero_deletes() {
        let store = HostCookieStore::default();
        let url = Url::parse("https://a.example.com/").unwrap();
        store_cookie(&store, &url, "token=x; Path=/");
        assert_eq!(store.cookie_count(&url), 1);
        store_cookie(&store, &url, "token=x; Path=/; Max-Age=0");
        assert_eq!(store.cookie_count(&url), 0);
        assert!(store.cookies(&url).is_none());
    }

    #[test]
    fn test_cookie_store_honors_path_and_domain() {
        let store = HostCookieStore::default();
        let docs = Url::parse("https://a.example.com/docs/list").unwrap();
        let root = Url::parse("https://a.example.com/").unwrap();
        let sibling = Url::parse("https://b.example.com/").unwrap();
        store_cookie(&store, &docs, "scoped=1; Path=/docs");
        store_cookie(&store, &docs, "shared=2; Domain=example.com; Path=/");

        assert_eq!(store.cookie_count(&docs), 2);
        assert_eq!(store.cookies(&root).unwrap(), "shared=2");
        assert_eq!(store.cookie_count(&sibling), 1);

        // Purging a.example.com removes everything it would have been sent
        store.purge(&docs);
        assert_eq!(store.cookie_count(&docs), 0);
        assert_eq!(store.cookie_count(&root), 0);
    }

    #[test]
    fn test_response_helpers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        let response = HttpResponse { status: 204, headers, body: Vec::new() };
        assert!(response.is_success());
        assert_eq!(response.content_type(), Some("application/json; charset=utf-8"));
    }
}
