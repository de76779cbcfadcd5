//! Scripted `HttpTransport` for unit tests

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use super::http::{BytesSent, HttpRequest, HttpResponse, HttpTransport, StreamingResponse};
use super::ProviderError;

/// Canned answer to one request
#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
    delay: Duration,
    error: Option<ProviderError>,
    /// Share of an upload body reported as sent before answering
    sent_fraction: f64,
    chunks: usize,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
            delay: Duration::ZERO,
            error: None,
            sent_fraction: 1.0,
            chunks: 4,
        }
    }

    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self::status(status)
            .header("content-type", "application/json; charset=utf-8")
            .body(value.to_string().into_bytes())
    }

    pub fn text(status: u16, content_type: &str, body: &str) -> Self {
        Self::status(status).header("content-type", content_type).body(body.as_bytes().to_vec())
    }

    pub fn error(error: ProviderError) -> Self {
        Self { error: Some(error), ..Self::status(0) }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        let name = HeaderName::from_bytes(name.as_bytes()).unwrap();
        self.headers.insert(name, HeaderValue::from_str(value).unwrap());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn after_sending(mut self, fraction: f64) -> Self {
        self.sent_fraction = fraction;
        self
    }

    pub fn chunks(mut self, chunks: usize) -> Self {
        self.chunks = chunks.max(1);
        self
    }

    fn response(&self) -> HttpResponse {
        HttpResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

type Handler = Box<dyn Fn(&HttpRequest) -> Reply + Send + Sync>;

/// Transport answering from a closure and recording what it was asked
pub struct ScriptedTransport {
    handler: Handler,
    log: Mutex<Vec<HttpRequest>>,
    cleared: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(handler: impl Fn(&HttpRequest) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
            cleared: Mutex::new(Vec::new()),
        })
    }

    /// Replies in order; once exhausted every request gets a 500
    pub fn sequence(replies: Vec<Reply>) -> Arc<Self> {
        let queue = Mutex::new(VecDeque::from(replies));
        Self::new(move |_| queue.lock().unwrap().pop_front().unwrap_or_else(|| Reply::status(500)))
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Requests whose path ends with `suffix`
    pub fn count_path(&self, suffix: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|r| r.url.path().ends_with(suffix)).count()
    }

    pub fn cleared_hosts(&self) -> Vec<String> {
        self.cleared.lock().unwrap().clone()
    }

    async fn answer(&self, request: &HttpRequest) -> Result<Reply, ProviderError> {
        self.log.lock().unwrap().push(request.clone());
        let reply = (self.handler)(request);
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        match reply.error.clone() {
            Some(err) => Err(err),
            None => Ok(reply),
        }
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError> {
        Ok(self.answer(&request).await?.response())
    }

    async fn download(&self, request: HttpRequest) -> Result<StreamingResponse, ProviderError> {
        let reply = self.answer(&request).await?;
        let size = reply.body.len().div_ceil(reply.chunks).max(1);
        let chunks: Vec<Result<Vec<u8>, ProviderError>> =
            reply.body.chunks(size).map(|c| Ok(c.to_vec())).collect();
        Ok(StreamingResponse {
            status: reply.status,
            content_length: Some(reply.body.len() as u64),
            headers: reply.headers.clone(),
            body: futures_util::stream::iter(chunks).boxed(),
        })
    }

    async fn upload(&self, request: HttpRequest, on_sent: BytesSent) -> Result<HttpResponse, ProviderError> {
        let total = request.body_len();
        let reply = (self.handler)(&request);
        self.log.lock().unwrap().push(request);
        let limit = (total as f64 * reply.sent_fraction) as u64;
        let step = (total / reply.chunks as u64).max(1);
        let mut sent = 0;
        while sent < limit {
            sent = (sent + step).min(limit);
            on_sent(sent);
            tokio::task::yield_now().await;
        }
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        match reply.error.clone() {
            Some(err) => Err(err),
            None => Ok(reply.response()),
        }
    }

    fn clear_cookies(&self, url: &Url) {
        if let Some(host) = url.host_str() {
            self.cleared.lock().unwrap().push(host.to_string());
        }
    }
}

