//! Provider Registry - connected storages
//!
//! Holds every connected provider plus the one that is active for browsing.
//! The registry is an explicit object created at start-up and torn down at
//! logout; callers pass it to whatever needs it. Persistence goes through an
//! injected [`ProviderStore`] so the registry never assumes where records live.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::providers::{Credential, ProviderEnv, ProviderError, ProviderFactory, ProviderRecord, StorageProvider};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read provider store: {0}")]
    Read(std::io::Error),
    #[error("Failed to write provider store: {0}")]
    Write(std::io::Error),
    #[error("Corrupt provider store: {0}")]
    Parse(serde_json::Error),
    #[error("Failed to serialize providers: {0}")]
    Serialize(serde_json::Error),
}

impl From<StoreError> for ProviderError {
    fn from(err: StoreError) -> Self {
        ProviderError::InvalidConfig(err.to_string())
    }
}

/// Keyed persistence for provider records
#[async_trait]
pub trait ProviderStore: Send + Sync {
    /// Every stored record, in connection order
    async fn load(&self) -> Result<Vec<ProviderRecord>, StoreError>;

    /// Insert or replace the record with the same id
    async fn put(&self, record: &ProviderRecord) -> Result<(), StoreError>;

    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

fn upsert(records: &mut Vec<ProviderRecord>, record: &ProviderRecord) {
    match records.iter_mut().find(|r| r.config.id == record.config.id) {
        Some(existing) => *existing = record.clone(),
        None => records.push(record.clone()),
    }
}

/// Store kept in memory only
#[derive(Default)]
pub struct MemoryProviderStore {
    records: Mutex<Vec<ProviderRecord>>,
}

impl MemoryProviderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProviderStore for MemoryProviderStore {
    async fn load(&self) -> Result<Vec<ProviderRecord>, StoreError> {
        Ok(self.records.lock().await.clone())
    }

    async fn put(&self, record: &ProviderRecord) -> Result<(), StoreError> {
        upsert(&mut *self.records.lock().await, record);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.records.lock().await.retain(|r| r.config.id != id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.records.lock().await.clear();
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    providers: Vec<ProviderRecord>,
}

/// JSON file store. Credentials are inside, so the file is owner-only on Unix.
pub struct FileProviderStore {
    path: PathBuf,
    // Serializes read-modify-write cycles
    lock: Mutex<()>,
}

/// Default location of the provider store
pub fn default_store_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    config_dir.join("docbridge").join("providers.json")
}

impl FileProviderStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<StoreFile, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => serde_json::from_slice(&data).map_err(StoreError::Parse),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(StoreError::Read(e)),
        }
    }

    async fn write(&self, file: &StoreFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(StoreError::Write)?;
        }
        let data = serde_json::to_vec_pretty(file).map_err(StoreError::Serialize)?;
        // Write then rename so a crash never leaves a truncated store
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await.map_err(StoreError::Write)?;
        ensure_owner_only(&tmp).await?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(StoreError::Write)
    }
}

async fn ensure_owner_only(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(StoreError::Write)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[async_trait]
impl ProviderStore for FileProviderStore {
    async fn load(&self) -> Result<Vec<ProviderRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.providers)
    }

    async fn put(&self, record: &ProviderRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        upsert(&mut file.providers, record);
        self.write(&file).await
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        file.providers.retain(|r| r.config.id != id);
        self.write(&file).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.write(&StoreFile::default()).await
    }
}

/// Connected providers and the active one
pub struct ProviderRegistry {
    env: ProviderEnv,
    store: Arc<dyn ProviderStore>,
    providers: RwLock<Vec<Arc<dyn StorageProvider>>>,
    active: RwLock<Option<String>>,
}

impl ProviderRegistry {
    pub fn new(env: ProviderEnv, store: Arc<dyn ProviderStore>) -> Self {
        Self {
            env,
            store,
            providers: RwLock::new(Vec::new()),
            active: RwLock::new(None),
        }
    }

    pub fn env(&self) -> &ProviderEnv {
        &self.env
    }

    /// Persist refreshed credentials of `provider` as they change
    fn watch_credentials(&self, provider: &Arc<dyn StorageProvider>) {
        let Some(auth) = provider.auth() else {
            return;
        };
        let store = self.store.clone();
        let config = provider.record().config;
        auth.on_refresh(Arc::new(move |credential: &Credential| {
            let record = ProviderRecord {
                config: config.clone(),
                credential: Some(credential.to_record()),
            };
            let store = store.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = store.put(&record).await {
                            warn!("Failed to persist refreshed credential for {}: {}", record.config.name, e);
                        }
                    });
                }
                Err(_) => warn!("No runtime to persist refreshed credential for {}", record.config.name),
            }
        }));
    }

    /// Add a provider, replacing any with the same id, and persist it.
    /// The first connected provider becomes active.
    pub async fn connect(&self, provider: Arc<dyn StorageProvider>) -> Result<(), ProviderError> {
        self.watch_credentials(&provider);
        self.store.put(&provider.record()).await?;

        let id = provider.id().to_string();
        {
            let mut providers = self.providers.write().await;
            if let Some(slot) = providers.iter_mut().find(|p| p.id() == id) {
                let replaced = std::mem::replace(slot, provider.clone());
                replaced.cancel_all();
            } else {
                providers.push(provider.clone());
            }
        }

        let mut active = self.active.write().await;
        if active.is_none() {
            *active = Some(id.clone());
        }
        info!("Connected {} ({})", provider.display_name(), provider.provider_type());
        Ok(())
    }

    /// Build a provider from `record` and connect it
    pub async fn connect_record(&self, record: &ProviderRecord) -> Result<Arc<dyn StorageProvider>, ProviderError> {
        let provider = ProviderFactory::create(record, &self.env)?;
        self.connect(provider.clone()).await?;
        Ok(provider)
    }

    /// Remove a provider, cancel its work and forget its credential
    pub async fn disconnect(&self, id: &str) -> Result<(), ProviderError> {
        let removed = {
            let mut providers = self.providers.write().await;
            let index = providers
                .iter()
                .position(|p| p.id() == id)
                .ok_or_else(|| ProviderError::NotFound(format!("provider {}", id)))?;
            let removed = providers.remove(index);

            let mut active = self.active.write().await;
            if active.as_deref() == Some(id) {
                *active = providers.first().map(|p| p.id().to_string());
            }
            removed
        };

        let cancelled = removed.cancel_all();
        if let Some(auth) = removed.auth() {
            auth.sign_out();
        }
        self.store.remove(id).await?;
        info!("Disconnected {} ({} task(s) cancelled)", removed.display_name(), cancelled);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn StorageProvider>> {
        self.providers.read().await.iter().find(|p| p.id() == id).cloned()
    }

    /// Connected providers in connection order
    pub async fn list(&self) -> Vec<Arc<dyn StorageProvider>> {
        self.providers.read().await.clone()
    }

    pub async fn active(&self) -> Option<Arc<dyn StorageProvider>> {
        let id = self.active.read().await.clone()?;
        self.get(&id).await
    }

    /// Switch the active provider. Work of the previously active one is cancelled.
    pub async fn set_active(&self, id: &str) -> Result<Arc<dyn StorageProvider>, ProviderError> {
        let provider = self
            .get(id)
            .await
            .ok_or_else(|| ProviderError::NotFound(format!("provider {}", id)))?;

        let previous = self.active.write().await.replace(id.to_string());
        if let Some(previous) = previous.filter(|p| p != id) {
            if let Some(old) = self.get(&previous).await {
                let cancelled = old.cancel_all();
                info!("Switched from {} to {} ({} task(s) cancelled)", old.display_name(), provider.display_name(), cancelled);
            }
        }
        Ok(provider)
    }

    /// Rebuild providers from the store. Records that fail to build are skipped.
    pub async fn restore(&self) -> Result<usize, ProviderError> {
        let records = self.store.load().await?;
        let mut restored = Vec::with_capacity(records.len());
        for record in &records {
            match ProviderFactory::create(record, &self.env) {
                Ok(provider) => {
                    self.watch_credentials(&provider);
                    restored.push(provider);
                }
                Err(e) => warn!("Skipping stored provider {}: {}", record.config.name, e),
            }
        }

        let count = restored.len();
        let first = restored.first().map(|p| p.id().to_string());
        let known: Vec<String> = restored.iter().map(|p| p.id().to_string()).collect();
        *self.providers.write().await = restored;
        let mut active = self.active.write().await;
        if !active.as_ref().is_some_and(|id| known.contains(id)) {
            *active = first;
        }
        info!("Restored {} of {} stored provider(s)", count, records.len());
        Ok(count)
    }

    /// Cancel every provider, forget every credential and empty the store.
    /// Returns the number of cancelled tasks.
    pub async fn logout(&self) -> Result<usize, ProviderError> {
        let providers = std::mem::take(&mut *self.providers.write().await);
        *self.active.write().await = None;

        let mut cancelled = 0;
        for provider in &providers {
            cancelled += provider.cancel_all();
            if let Some(auth) = provider.auth() {
                auth.sign_out();
            }
        }
        self.store.clear().await?;
        info!("Logged out of {} provider(s), {} task(s) cancelled", providers.len(), cancelled);
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::providers::testing::{Reply, ScriptedTransport};
    use crate::providers::{CredentialRecord, ProviderConfig, ProviderType};
    use serde_json::json;
    use std::time::Duration;

    fn env(transport: Arc<ScriptedTransport>, root: &Path) -> ProviderEnv {
        ProviderEnv::with_transport(PipelineConfig::default(), transport).with_local_root(root)
    }

    fn local_record(name: &str) -> ProviderRecord {
        ProviderRecord {
            config: ProviderConfig::new(ProviderType::Local, name),
            credential: None,
        }
    }

    fn dropbox_record() -> ProviderRecord {
        ProviderRecord {
            config: ProviderConfig::new(ProviderType::Dropbox, "Dropbox")
                .with_extra("client_id", "app")
                .with_extra("token_url", "https://auth.example.com/token"),
            credential: Some(Credential::bearer("old", Some("rt"), None).to_record()),
        }
    }

    #[tokio::test]
    async fn test_connect_sets_first_active_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryProviderStore::new());
        let registry = ProviderRegistry::new(env(ScriptedTransport::new(|_| Reply::status(200)), dir.path()), store.clone());

        let first = registry.connect_record(&local_record("Device")).await.unwrap();
        let second = registry.connect_record(&local_record("Other")).await.unwrap();

        assert_eq!(registry.active().await.unwrap().id(), first.id());
        assert_eq!(registry.list().await.len(), 2);
        let stored = store.load().await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].config.id, second.id());
    }

    #[tokio::test]
    async fn test_disconnect_moves_active_and_forgets_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryProviderStore::new());
        let registry = ProviderRegistry::new(env(ScriptedTransport::new(|_| Reply::status(200)), dir.path()), store.clone());
        let first = registry.connect_record(&local_record("Device")).await.unwrap();
        let second = registry.connect_record(&local_record("Other")).await.unwrap();

        registry.disconnect(first.id()).await.unwrap();
        assert_eq!(registry.active().await.unwrap().id(), second.id());
        assert!(registry.get(first.id()).await.is_none());
        assert_eq!(store.load().await.unwrap().len(), 1);
        assert!(matches!(registry.disconnect("missing").await, Err(ProviderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_restore_rebuilds_from_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("providers.json");
        let transport = ScriptedTransport::new(|_| Reply::status(200));
        {
            let store = Arc::new(FileProviderStore::new(&path));
            let registry = ProviderRegistry::new(env(transport.clone(), dir.path()), store);
            registry.connect_record(&local_record("Device")).await.unwrap();
            registry.connect_record(&dropbox_record()).await.unwrap();
        }

        let store = Arc::new(FileProviderStore::new(&path));
        let registry = ProviderRegistry::new(env(transport, dir.path()), store);
        assert_eq!(registry.restore().await.unwrap(), 2);
        let providers = registry.list().await;
        assert_eq!(providers[1].provider_type(), ProviderType::Dropbox);
        let credential = providers[1].record().credential.unwrap();
        assert_eq!(credential.access_token, "old");
        assert_eq!(registry.active().await.unwrap().provider_type(), ProviderType::Local);
    }

    #[tokio::test]
    async fn test_restore_skips_broken_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryProviderStore::new());
        store.put(&local_record("Device")).await.unwrap();
        // Portal without an address cannot be built
        store
            .put(&ProviderRecord {
                config: ProviderConfig::new(ProviderType::Portal, "Broken"),
                credential: None,
            })
            .await
            .unwrap();
        let registry = ProviderRegistry::new(env(ScriptedTransport::new(|_| Reply::status(200)), dir.path()), store);
        assert_eq!(registry.restore().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_refreshed_credential_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryProviderStore::new());
        let transport = ScriptedTransport::new(|_| {
            Reply::json(200, json!({"access_token": "fresh", "token_type": "bearer", "expires_in": 3600}))
        });
        let registry = ProviderRegistry::new(env(transport, dir.path()), store.clone());
        let provider = registry.connect_record(&dropbox_record()).await.unwrap();

        provider.auth().unwrap().refresh_now().await.unwrap();

        let mut persisted: Option<CredentialRecord> = None;
        for _ in 0..50 {
            persisted = store.load().await.unwrap()[0].credential.clone();
            if persisted.as_ref().is_some_and(|c| c.access_token == "fresh") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let persisted = persisted.unwrap();
        assert_eq!(persisted.access_token, "fresh");
        assert_eq!(persisted.refresh_token.as_deref(), Some("rt"));
    }

    #[tokio::test]
    async fn test_set_active_cancels_previous_provider() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(|_| Reply::json(200, json!({})).delay(Duration::from_secs(30)));
        let store = Arc::new(MemoryProviderStore::new());
        let registry = Arc::new(ProviderRegistry::new(env(transport, dir.path()), store));
        let dropbox = registry.connect_record(&dropbox_record()).await.unwrap();
        let local = registry.connect_record(&local_record("Device")).await.unwrap();

        let pending = {
            let dropbox = dropbox.clone();
            tokio::spawn(async move { dropbox.user_info().await })
        };
        for _ in 0..50 {
            if dropbox.in_flight() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(dropbox.in_flight(), 1);

        registry.set_active(local.id()).await.unwrap();
        assert_eq!(dropbox.in_flight(), 0);
        assert!(matches!(pending.await.unwrap(), Err(ProviderError::Cancelled)));
    }

    #[tokio::test]
    async fn test_logout_cancels_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryProviderStore::new());
        let registry = ProviderRegistry::new(env(ScriptedTransport::new(|_| Reply::status(200)), dir.path()), store.clone());
        let dropbox = registry.connect_record(&dropbox_record()).await.unwrap();
        registry.connect_record(&local_record("Device")).await.unwrap();

        registry.logout().await.unwrap();
        assert!(registry.list().await.is_empty());
        assert!(registry.active().await.is_none());
        assert!(store.load().await.unwrap().is_empty());
        assert!(dropbox.record().credential.is_none());
    }
}
