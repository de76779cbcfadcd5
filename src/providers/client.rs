//! Generic authenticated HTTP client
//!
//! One client per provider instance, composed of the Request Adapter, the
//! transport, the shared `RefreshCoordinator` and the instance's own
//! `SessionManager`. Every call follows the same sequence:
//!
//! 1. build the request (encoding errors surface here, before any I/O)
//! 2. take the current credential from the coordinator
//! 3. purge cookies for the target host, send inside the session
//! 4. on an auth failure, let the coordinator refresh (single-flight) and
//!    retry exactly once; a second auth failure is returned as `Auth`

use futures_util::stream::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::auth::RefreshCoordinator;
use super::http::{BytesSent, HttpRequest, HttpResponse, HttpTransport};
use super::normalize::ErrorNormalizer;
use super::request::{decode_json, Envelope, RequestAdapter, RequestSpec};
use super::session::{SessionManager, TaskKind};
use super::{progress_fraction, ProgressCallback, ProviderError, TransferOutcome};

pub struct AuthenticatedClient {
    adapter: RequestAdapter,
    transport: Arc<dyn HttpTransport>,
    auth: RefreshCoordinator,
    session: SessionManager,
    normalizer: ErrorNormalizer,
    envelope: Envelope,
}

impl AuthenticatedClient {
    pub fn new(
        adapter: RequestAdapter,
        transport: Arc<dyn HttpTransport>,
        auth: RefreshCoordinator,
        normalizer: ErrorNormalizer,
        envelope: Envelope,
        transfer_timeout: Duration,
    ) -> Self {
        let label = adapter.base().host_str().unwrap_or("provider").to_string();
        Self {
            session: SessionManager::new(&label, transfer_timeout),
            adapter,
            transport,
            auth,
            normalizer,
            envelope,
        }
    }

    /// Also authorize requests to `address`
    pub fn trusting(mut self, address: &str) -> Result<Self, ProviderError> {
        self.adapter = self.adapter.trusting(address)?;
        Ok(self)
    }

    /// Same backend and credential, separate in-flight set
    pub fn fork(&self) -> Self {
        Self {
            adapter: self.adapter.clone(),
            transport: self.transport.clone(),
            auth: self.auth.clone(),
            session: self.session.fork(),
            normalizer: self.normalizer.clone(),
            envelope: self.envelope,
        }
    }

    pub fn adapter(&self) -> &RequestAdapter {
        &self.adapter
    }

    pub fn auth(&self) -> &RefreshCoordinator {
        &self.auth
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn normalizer(&self) -> &ErrorNormalizer {
        &self.normalizer
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    /// Send and return the response, whatever its status, once auth is settled
    pub async fn send_raw(&self, spec: &RequestSpec) -> Result<HttpResponse, ProviderError> {
        let request = self.adapter.build(spec)?;
        self.session
            .run(TaskKind::Request, async {
                let mut retried = false;
                loop {
                    let authorization = self.auth.authorize().await?;
                    let mut attempt = request.clone();
                    self.adapter.authorize(&mut attempt, Some(authorization.header));
                    self.transport.clear_cookies(&attempt.url);

                    debug!("{} {}", attempt.method, attempt.url.path());
                    let response = self.transport.execute(attempt).await?;
                    debug!("{} {} -> {}", request.method, request.url.path(), response.status);

                    if !self.auth.is_auth_failure(&response) {
                        return Ok(response);
                    }
                    if retried {
                        return Err(self.normalizer.auth_error(&response));
                    }
                    retried = true;
                    self.auth.recover(authorization.generation).await?;
                }
            })
            .await
    }

    /// Send without credentials; used for reachability probes
    pub async fn send_anonymous(&self, spec: &RequestSpec) -> Result<HttpResponse, ProviderError> {
        let mut request = self.adapter.build(spec)?;
        self.adapter.authorize(&mut request, None);
        self.session
            .run(TaskKind::Request, async {
                self.transport.clear_cookies(&request.url);
                self.transport.execute(request.clone()).await
            })
            .await
    }

    /// Send and decode the JSON payload with this client's envelope
    pub async fn send_json(&self, spec: &RequestSpec) -> Result<Value, ProviderError> {
        let response = self.send_raw(spec).await?;
        decode_json(&response, self.envelope, &self.normalizer)
    }

    pub async fn send_typed<T: DeserializeOwned>(&self, spec: &RequestSpec) -> Result<T, ProviderError> {
        let payload = self.send_json(spec).await?;
        serde_json::from_value(payload).map_err(|e| ProviderError::Validation(format!("Unexpected payload: {}", e)))
    }

    /// Send and require a 2xx status, ignoring the body
    pub async fn send_expecting_success(&self, spec: &RequestSpec) -> Result<HttpResponse, ProviderError> {
        let response = self.send_raw(spec).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(self.normalizer.from_response(&response))
        }
    }

    /// Upload `spec`'s body on an ephemeral transfer session
    pub async fn upload_raw(
        &self,
        spec: &RequestSpec,
        progress: Option<ProgressCallback>,
    ) -> TransferOutcome<HttpResponse> {
        TransferOutcome::from_result(self.upload_inner(spec, progress).await)
    }

    /// Upload and decode the JSON payload of the response
    pub async fn upload(&self, spec: &RequestSpec, progress: Option<ProgressCallback>) -> TransferOutcome<Value> {
        let result = self
            .upload_inner(spec, progress)
            .await
            .and_then(|response| decode_json(&response, self.envelope, &self.normalizer));
        TransferOutcome::from_result(result)
    }

    async fn upload_inner(
        &self,
        spec: &RequestSpec,
        progress: Option<ProgressCallback>,
    ) -> Result<HttpResponse, ProviderError> {
        let mut request = self.adapter.build(spec)?;
        let lease = self.session.open_transfer(TaskKind::Upload);
        request.timeout = lease.timeout();
        let total = request.body_len();

        lease
            .run(async {
                let mut retried = false;
                loop {
                    let authorization = self.auth.authorize().await?;
                    let mut attempt = request.clone();
                    self.adapter.authorize(&mut attempt, Some(authorization.header));
                    self.transport.clear_cookies(&attempt.url);

                    let reporter = progress.clone();
                    let on_sent: BytesSent = Arc::new(move |sent: u64| {
                        if let Some(reporter) = &reporter {
                            reporter(progress_fraction(sent, total));
                        }
                    });
                    let response = self.transport.upload(attempt, on_sent).await?;

                    if self.auth.is_auth_failure(&response) {
                        // Progress already reported does not make an auth failure ignorable
                        if retried {
                            return Err(self.normalizer.auth_error(&response));
                        }
                        retried = true;
                        self.auth.recover(authorization.generation).await?;
                        continue;
                    }
                    if !response.is_success() {
                        return Err(self.normalizer.from_response(&response));
                    }
                    if let Some(progress) = &progress {
                        progress(1.0);
                    }
                    return Ok(response);
                }
            })
            .await
    }

    /// Download into memory
    pub async fn download(&self, spec: &RequestSpec, progress: Option<ProgressCallback>) -> TransferOutcome<Vec<u8>> {
        let mut data = Vec::new();
        let result = self
            .download_inner(spec, progress, |chunk| {
                data.extend_from_slice(&chunk);
                async { Ok(()) }
            })
            .await;
        TransferOutcome::from_result(result.map(|_| data))
    }

    /// Stream the body into `destination`, returning the bytes written
    pub async fn download_to(
        &self,
        spec: &RequestSpec,
        destination: &Path,
        progress: Option<ProgressCallback>,
    ) -> TransferOutcome<u64> {
        let file = match tokio::fs::File::create(destination).await {
            Ok(file) => file,
            Err(e) => return TransferOutcome::Failed(ProviderError::from(e)),
        };
        let file = Arc::new(tokio::sync::Mutex::new(file));
        let result = self
            .download_inner(spec, progress, |chunk| {
                let file = file.clone();
                async move { file.lock().await.write_all(&chunk).await.map_err(ProviderError::from) }
            })
            .await;
        let result = match result {
            Ok(written) => file.lock().await.flush().await.map(|_| written).map_err(ProviderError::from),
            Err(err) => {
                let _ = tokio::fs::remove_file(destination).await;
                Err(err)
            }
        };
        TransferOutcome::from_result(result)
    }

    async fn download_inner<F, Fut>(
        &self,
        spec: &RequestSpec,
        progress: Option<ProgressCallback>,
        mut sink: F,
    ) -> Result<u64, ProviderError>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: std::future::Future<Output = Result<(), ProviderError>>,
    {
        let mut request: HttpRequest = self.adapter.build(spec)?;
        let lease = self.session.open_transfer(TaskKind::Download);
        request.timeout = lease.timeout();

        lease
            .run(async {
                let mut retried = false;
                let streaming = loop {
                    let authorization = self.auth.authorize().await?;
                    let mut attempt = request.clone();
                    self.adapter.authorize(&mut attempt, Some(authorization.header));
                    self.transport.clear_cookies(&attempt.url);

                    let streaming = self.transport.download(attempt).await?;
                    if (200..300).contains(&streaming.status) {
                        break streaming;
                    }
                    let response = streaming.collect().await;
                    if !self.auth.is_auth_failure(&response) {
                        return Err(self.normalizer.from_response(&response));
                    }
                    if retried {
                        return Err(self.normalizer.auth_error(&response));
                    }
                    retried = true;
                    self.auth.recover(authorization.generation).await?;
                };

                let total = streaming.content_length;
                let mut body = streaming.body;
                let mut received = 0u64;
                while let Some(chunk) = body.next().await {
                    let chunk = chunk?;
                    received += chunk.len() as u64;
                    sink(chunk).await?;
                    if let (Some(progress), Some(total)) = (&progress, total) {
                        progress(progress_fraction(received, total));
                    }
                }
                if let Some(progress) = &progress {
                    progress(1.0);
                }
                Ok(received)
            })
            .await
    }
}
