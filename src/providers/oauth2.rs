//! OAuth2 token refresh
//!
//! Cloud backends (Google Drive, Dropbox, OneDrive) hold bearer tokens that
//! expire. Sign-in happens outside this crate; here we only renew the access
//! token with the stored refresh token, using oauth2's typed token response.
//! The exchange goes through the pipeline's `HttpTransport`, so it shares the
//! cookie handling and can be scripted in tests.

use async_trait::async_trait;
use oauth2::{
    basic::BasicClient, ClientId, ClientSecret, EndpointNotSet, EndpointSet, RefreshToken,
    RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

use super::auth::AuthStrategy;
use super::credential::{AuthScheme, Credential};
use super::http::{HttpRequest, HttpTransport};
use super::ProviderError;

/// OAuth2 client with only the token endpoint set (v5 typestates)
type RefreshClient = BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Error wrapper for the oauth2 HTTP client adapter.
#[derive(Debug)]
pub struct OAuth2TransportError(String);

impl std::fmt::Display for OAuth2TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OAuth2TransportError {}

/// Bridges oauth2 v5's `AsyncHttpClient` onto an `HttpTransport`.
struct TransportClient {
    transport: Arc<dyn HttpTransport>,
    timeout: Duration,
}

impl<'c> oauth2::AsyncHttpClient<'c> for TransportClient {
    type Error = oauth2::HttpClientError<OAuth2TransportError>;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<oauth2::HttpResponse, Self::Error>> + Send + 'c>,
    >;

    fn call(&'c self, request: oauth2::HttpRequest) -> Self::Future {
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let url = Url::parse(&parts.uri.to_string())
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let mut outgoing = HttpRequest::new(parts.method, url, self.timeout);
            outgoing.headers = parts.headers;
            outgoing.body = Some(body);

            let response = self
                .transport
                .execute(outgoing)
                .await
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let mut builder = http::Response::builder().status(
                http::StatusCode::from_u16(response.status).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR),
            );
            for (name, value) in response.headers.iter() {
                builder = builder.header(name, value);
            }
            builder
                .body(response.body)
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))
        })
    }
}

/// OAuth2 provider types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Google,
    Dropbox,
    OneDrive,
}

impl std::fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OAuthProvider::Google => write!(f, "Google Drive"),
            OAuthProvider::Dropbox => write!(f, "Dropbox"),
            OAuthProvider::OneDrive => write!(f, "OneDrive"),
        }
    }
}

/// Token endpoint and client registration of one OAuth2 provider
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub provider: OAuthProvider,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub token_url: String,
    /// Sent with refresh requests where the provider needs them (OneDrive)
    pub scopes: Vec<String>,
}

impl OAuthConfig {
    pub fn google(client_id: &str, client_secret: Option<&str>) -> Self {
        Self {
            provider: OAuthProvider::Google,
            client_id: client_id.to_string(),
            client_secret: client_secret.map(str::to_string),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scopes: Vec::new(),
        }
    }

    pub fn dropbox(client_id: &str, client_secret: Option<&str>) -> Self {
        Self {
            provider: OAuthProvider::Dropbox,
            client_id: client_id.to_string(),
            client_secret: client_secret.map(str::to_string),
            token_url: "https://api.dropboxapi.com/oauth2/token".to_string(),
            scopes: Vec::new(),
        }
    }

    pub fn onedrive(client_id: &str, client_secret: Option<&str>) -> Self {
        Self {
            provider: OAuthProvider::OneDrive,
            client_id: client_id.to_string(),
            client_secret: client_secret.map(str::to_string),
            token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string(),
            scopes: vec![
                "Files.ReadWrite".to_string(),
                "Files.ReadWrite.All".to_string(),
                "offline_access".to_string(),
            ],
        }
    }

    pub fn with_token_url(mut self, token_url: &str) -> Self {
        self.token_url = token_url.to_string();
        self
    }

    /// Create OAuth2 client from config (v5 builder API)
    fn create_client(&self) -> Result<RefreshClient, ProviderError> {
        let token_url = TokenUrl::new(self.token_url.clone())
            .map_err(|e| ProviderError::InvalidConfig(format!("Invalid token URL: {}", e)))?;

        let mut client = BasicClient::new(ClientId::new(self.client_id.clone())).set_token_uri(token_url);
        if let Some(ref secret) = self.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret.clone()));
        }
        Ok(client)
    }
}

/// Refresh-token exchange against the provider's token endpoint
pub struct OAuthRefresh {
    config: OAuthConfig,
    timeout: Duration,
}

impl OAuthRefresh {
    pub fn new(config: OAuthConfig, timeout: Duration) -> Result<Self, ProviderError> {
        // Reject a bad endpoint at construction rather than on the first 401
        config.create_client()?;
        Ok(Self { config, timeout })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }
}

#[async_trait]
impl AuthStrategy for OAuthRefresh {
    async fn refresh(
        &self,
        transport: Arc<dyn HttpTransport>,
        credential: &Credential,
    ) -> Result<Credential, ProviderError> {
        let Some(refresh_token) = credential.refresh_token.as_ref() else {
            return Err(ProviderError::Auth(
                "Token expired and no refresh token available".to_string(),
            ));
        };
        let refresh_token = refresh_token.expose_secret().to_string();

        let client = self.config.create_client()?;
        let http_client = TransportClient { transport, timeout: self.timeout };
        let token_result = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .add_scopes(self.config.scopes.iter().cloned().map(Scope::new))
            .request_async(&http_client)
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(response) => {
                    ProviderError::Auth(format!("Token refresh failed: {}", response))
                }
                RequestTokenError::Request(err) => {
                    ProviderError::Transport(format!("Token refresh failed: {}", err))
                }
                RequestTokenError::Parse(err, _) => {
                    ProviderError::Validation(format!("Token refresh failed: {}", err))
                }
                RequestTokenError::Other(message) => {
                    ProviderError::Auth(format!("Token refresh failed: {}", message))
                }
            })?;

        let expires_at = token_result
            .expires_in()
            .map(|d| chrono::Utc::now().timestamp() + d.as_secs() as i64);

        info!("OAuth2 tokens refreshed for {}", self.config.provider);

        Ok(Credential {
            scheme: AuthScheme::Bearer,
            access_token: SecretString::from(token_result.access_token().secret().clone()),
            username: credential.username.clone(),
            refresh_token: Some(SecretString::from(
                token_result
                    .refresh_token()
                    .map(|t| t.secret().clone())
                    .unwrap_or(refresh_token), // Keep old refresh token if not returned
            )),
            expires_at,
        })
    }
}
