//! Storage Providers Module
//!
//! This module provides a unified abstraction layer for different storage backends.
//! All providers implement the `StorageProvider` trait, so the registry and the
//! folder picker can work with the device, the document portal and third-party
//! drives through one interface.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │           StorageProvider Trait             │
//! │  fetch, reset, reachability, cancel, copy   │
//! └─────────────────────────────────────────────┘
//!                      │
//!    ┌───────┬─────────┼─────────┬────────┬────────┐
//!    ▼       ▼         ▼         ▼        ▼        ▼
//! ┌─────┐ ┌──────┐ ┌───────┐ ┌────────┐ ┌──────┐ ┌──────┐
//! │Local│ │Portal│ │Dropbox│ │OneDrive│ │GDrive│ │WebDAV│
//! └─────┘ └──────┘ └───────┘ └────────┘ └──────┘ └──────┘
//!            │          │         │          │        │
//!            └──────────┴── AuthenticatedClient ──────┘
//!                 adapter · session · refresh · errors
//! ```

pub mod auth;
pub mod client;
pub mod credential;
pub mod dropbox;
pub mod google_drive;
pub mod http;
pub mod http_retry;
pub mod local;
pub mod normalize;
pub mod oauth2;
pub mod onedrive;
pub mod portal;
pub mod request;
pub mod session;
pub mod types;
pub mod webdav;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{AuthStrategy, CredentialState, RefreshCoordinator};
pub use client::AuthenticatedClient;
pub use credential::{AuthScheme, Credential, CredentialRecord};
pub use dropbox::DropboxProvider;
pub use google_drive::GoogleDriveProvider;
pub use http::{HttpTransport, ReqwestTransport};
pub use local::LocalProvider;
pub use normalize::ErrorNormalizer;
pub use oauth2::{OAuthConfig, OAuthProvider, OAuthRefresh};
pub use onedrive::OneDriveProvider;
pub use portal::PortalProvider;
pub use session::{SessionManager, TaskKind};
pub use types::*;
pub use webdav::WebDavProvider;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::PipelineConfig;
use normalize::ErrorNormalizer as Normalizer;
use request::{Envelope, RequestAdapter};

/// Unified storage provider trait
///
/// One implementation per backend kind. Instances are shared as
/// `Arc<dyn StorageProvider>`; all state changes go through interior
/// mutability so that `cancel_all` can run while a fetch is pending.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Stable instance identifier
    fn id(&self) -> &str;

    /// Get the provider type identifier
    fn provider_type(&self) -> ProviderType;

    /// Get display name for this provider instance
    fn display_name(&self) -> String;

    /// Address used in messages, e.g. "The <address> server is not available."
    fn base_address(&self) -> String;

    /// Top folder of this provider
    fn root_folder(&self) -> RemoteEntry;

    /// List children of `folder`
    async fn fetch(&self, folder: &RemoteEntry, params: &FetchParams) -> Result<FetchPage, ProviderError>;

    /// Drop cached listing state so the next `fetch` starts over
    fn reset(&self);

    /// Lightweight connectivity probe, run before first use
    async fn is_reachable(&self) -> Result<(), ProviderError>;

    /// Cancel every outstanding request and transfer; returns how many were cancelled
    fn cancel_all(&self) -> usize;

    /// Number of outstanding requests and transfers
    fn in_flight(&self) -> usize;

    /// Independent instance with the same credential and its own in-flight set
    fn copy(&self) -> Arc<dyn StorageProvider>;

    /// Config and current credential, for the registry store
    fn record(&self) -> ProviderRecord;

    /// Credential holder of network backends
    fn auth(&self) -> Option<&RefreshCoordinator> {
        None
    }

    /// Fixed top-level folders to offer instead of the root listing (portal categories)
    fn category_roots(&self) -> Vec<RemoteEntry> {
        Vec::new()
    }

    // Optional capabilities - providers can override these

    async fn user_info(&self) -> Result<UserInfo, ProviderError> {
        Err(ProviderError::NotSupported("user info".to_string()))
    }

    async fn create_folder(&self, _parent: &RemoteEntry, _name: &str) -> Result<RemoteEntry, ProviderError> {
        Err(ProviderError::NotSupported("create folder".to_string()))
    }

    async fn rename(&self, _entry: &RemoteEntry, _new_name: &str) -> Result<RemoteEntry, ProviderError> {
        Err(ProviderError::NotSupported("rename".to_string()))
    }

    async fn delete(&self, _entries: &[RemoteEntry]) -> Result<(), ProviderError> {
        Err(ProviderError::NotSupported("delete".to_string()))
    }

    /// Copy or move `items` into `destination` on this provider
    async fn transfer(
        &self,
        _items: &[RemoteEntry],
        _destination: &RemoteEntry,
        _mode: TransferMode,
        _overwrite: bool,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::NotSupported("copy/move".to_string()))
    }

    /// Names of `items` that already exist in `destination`
    async fn check_transfer(
        &self,
        items: &[RemoteEntry],
        destination: &RemoteEntry,
    ) -> Result<Vec<String>, ProviderError> {
        let existing = self.fetch(destination, &FetchParams::default()).await?;
        Ok(conflicting_names(items, &existing.entries))
    }

    async fn download(
        &self,
        _entry: &RemoteEntry,
        _destination: &Path,
        _progress: Option<ProgressCallback>,
    ) -> TransferOutcome<u64> {
        TransferOutcome::Failed(ProviderError::NotSupported("download".to_string()))
    }

    async fn upload(
        &self,
        _folder: &RemoteEntry,
        _name: &str,
        _data: Vec<u8>,
        _overwrite: bool,
        _progress: Option<ProgressCallback>,
    ) -> TransferOutcome<RemoteEntry> {
        TransferOutcome::Failed(ProviderError::NotSupported("upload".to_string()))
    }
}

/// Titles of `items` already present among `existing`
pub fn conflicting_names(items: &[RemoteEntry], existing: &[RemoteEntry]) -> Vec<String> {
    items
        .iter()
        .filter(|item| existing.iter().any(|e| e.name == item.name))
        .map(|item| item.name.clone())
        .collect()
}

/// Shared dependencies handed to every provider the factory builds
#[derive(Clone)]
pub struct ProviderEnv {
    pub config: PipelineConfig,
    pub transport: Arc<dyn HttpTransport>,
    /// Root folder of the on-device provider
    pub local_root: PathBuf,
}

impl ProviderEnv {
    /// Production environment with a reqwest transport
    pub fn new(config: PipelineConfig) -> Result<Self, ProviderError> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: PipelineConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let local_root = dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self { config, transport, local_root }
    }

    pub fn with_local_root(mut self, local_root: &Path) -> Self {
        self.local_root = local_root.to_path_buf();
        self
    }

    /// Authenticated client for a network backend
    pub(crate) fn client(
        &self,
        config: &ProviderConfig,
        strategy: Arc<dyn AuthStrategy>,
        credential: Option<Credential>,
        envelope: Envelope,
        error_pointers: &'static [&'static str],
    ) -> Result<AuthenticatedClient, ProviderError> {
        let base = config.resolved_base_url()?;
        let adapter = RequestAdapter::new(&base, self.config.request_timeout())?;
        let auth = RefreshCoordinator::new(
            &config.name,
            strategy,
            self.transport.clone(),
            credential,
            self.config.refresh_timeout(),
        );
        Ok(AuthenticatedClient::new(
            adapter,
            self.transport.clone(),
            auth,
            Normalizer::new(&base).with_pointers(error_pointers),
            envelope,
            self.config.transfer_timeout(),
        ))
    }

    /// Refresh strategy of an OAuth2 backend, from `client_id`/`client_secret`/`token_url` extras
    pub(crate) fn oauth_strategy(&self, config: &ProviderConfig) -> Result<Arc<dyn AuthStrategy>, ProviderError> {
        let client_id = config
            .extra
            .get("client_id")
            .ok_or_else(|| ProviderError::InvalidConfig(format!("{} requires a client_id", config.provider_type)))?;
        let secret = config.extra.get("client_secret").map(String::as_str);
        let mut oauth = match config.provider_type {
            ProviderType::Dropbox => OAuthConfig::dropbox(client_id, secret),
            ProviderType::OneDrive => OAuthConfig::onedrive(client_id, secret),
            ProviderType::GoogleDrive => OAuthConfig::google(client_id, secret),
            other => {
                return Err(ProviderError::InvalidConfig(format!("{} does not use OAuth2", other)));
            }
        };
        if let Some(token_url) = config.extra.get("token_url") {
            oauth = oauth.with_token_url(token_url);
        }
        Ok(Arc::new(OAuthRefresh::new(oauth, self.config.refresh_timeout())?))
    }
}

/// Factory for creating providers from persisted records
pub struct ProviderFactory;

impl ProviderFactory {
    /// Create a provider from its record
    pub fn create(record: &ProviderRecord, env: &ProviderEnv) -> Result<Arc<dyn StorageProvider>, ProviderError> {
        let config = record.config.clone();
        let credential = record.credential.as_ref().map(Credential::from);
        info!("Creating {} provider '{}'", config.provider_type, config.name);

        let provider: Arc<dyn StorageProvider> = match config.provider_type {
            ProviderType::Local => {
                let root = config.extra.get("root").map(PathBuf::from).unwrap_or_else(|| env.local_root.clone());
                Arc::new(LocalProvider::new(config, root))
            }
            ProviderType::Portal => Arc::new(PortalProvider::new(config, credential, env)?),
            ProviderType::Dropbox => Arc::new(DropboxProvider::new(config, credential, env)?),
            ProviderType::OneDrive => Arc::new(OneDriveProvider::new(config, credential, env)?),
            ProviderType::GoogleDrive => Arc::new(GoogleDriveProvider::new(config, credential, env)?),
            ProviderType::WebDav
            | ProviderType::Nextcloud
            | ProviderType::OwnCloud
            | ProviderType::KDrive
            | ProviderType::Yandex => Arc::new(WebDavProvider::new(config, credential, env)?),
        };
        Ok(provider)
    }

    /// Get list of supported provider types
    pub fn supported_types() -> Vec<ProviderType> {
        vec![
            ProviderType::Local,
            ProviderType::Portal,
            ProviderType::Dropbox,
            ProviderType::OneDrive,
            ProviderType::GoogleDrive,
            ProviderType::WebDav,
            ProviderType::Nextcloud,
            ProviderType::OwnCloud,
            ProviderType::KDrive,
            ProviderType::Yandex,
        ]
    }
}
