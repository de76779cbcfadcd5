//! Dropbox Storage Provider
//!
//! Implements StorageProvider for Dropbox using the Dropbox API v2.
//! Uses OAuth2 for authentication.
//!
//! RPC endpoints take a JSON body on `api.dropboxapi.com`; file content goes
//! through `content.dropboxapi.com` with the arguments in a `Dropbox-API-Arg`
//! header. Entries are addressed by path (`""` is the root).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::client::AuthenticatedClient;
use super::credential::Credential;
use super::request::{Envelope, RequestSpec};
use super::{
    FetchPage, FetchParams, ProgressCallback, ProviderConfig, ProviderEnv, ProviderError, ProviderRecord,
    ProviderType, RefreshCoordinator, RemoteEntry, StorageProvider, TransferMode, TransferOutcome, UserInfo,
};

/// Dropbox content endpoints
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2/";

/// Errors come as `{"error_summary": "path/not_found/..", "error": {".tag": ..}}`
const ERROR_POINTERS: &[&str] = &["/error_summary"];

/// Dropbox file metadata
#[derive(Debug, Deserialize)]
struct DropboxMetadata {
    #[serde(rename = ".tag", default)]
    tag: Option<String>,
    name: String,
    path_lower: Option<String>,
    path_display: Option<String>,
    id: Option<String>,
    #[serde(default)]
    size: u64,
    server_modified: Option<String>,
    rev: Option<String>,
}

impl DropboxMetadata {
    fn into_entry(self, parent_id: Option<&str>) -> RemoteEntry {
        let path = self
            .path_display
            .or(self.path_lower)
            .unwrap_or_else(|| format!("/{}", self.name));
        let id = self.id.unwrap_or_else(|| path.clone());
        let mut entry = if self.tag.as_deref() == Some("file") {
            RemoteEntry::file(&id, &self.name, &path, self.size)
        } else {
            RemoteEntry::directory(&id, &self.name, &path)
        };
        entry.parent_id = parent_id.map(str::to_string);
        entry.modified = self.server_modified;
        if let Some(rev) = self.rev {
            entry.metadata.insert("rev".to_string(), rev);
        }
        entry
    }
}

/// List folder response
#[derive(Debug, Deserialize)]
struct ListFolderResult {
    entries: Vec<DropboxMetadata>,
    cursor: String,
    has_more: bool,
}

/// Result of the `_v2` file operations
#[derive(Debug, Deserialize)]
struct MetadataResult {
    metadata: DropboxMetadata,
}

#[derive(Debug, Deserialize)]
struct AccountName {
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct Account {
    account_id: String,
    name: AccountName,
    email: Option<String>,
}

/// Normalize path for Dropbox API (empty string = root, paths start with /)
fn normalize_path(path: &str) -> String {
    let path = path.trim_matches('/');
    if path.is_empty() {
        String::new()
    } else {
        format!("/{}", path)
    }
}

fn child_path(folder: &str, name: &str) -> String {
    format!("{}/{}", normalize_path(folder), name)
}

/// `Dropbox-API-Arg` must be ASCII; other characters are sent as `\uXXXX`
fn header_safe_json(value: &Value) -> String {
    let mut out = String::new();
    for c in value.to_string().chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Dropbox reports missing paths as a 409 with a `.../not_found/...` summary
fn classify(err: ProviderError) -> ProviderError {
    match err {
        ProviderError::Api { ref message, .. } if message.contains("not_found") => {
            ProviderError::NotFound(message.clone())
        }
        other => other,
    }
}

/// Dropbox storage provider
pub struct DropboxProvider {
    config: ProviderConfig,
    client: AuthenticatedClient,
}

impl DropboxProvider {
    pub fn new(
        config: ProviderConfig,
        credential: Option<Credential>,
        env: &ProviderEnv,
    ) -> Result<Self, ProviderError> {
        let strategy = env.oauth_strategy(&config)?;
        let client = env
            .client(&config, strategy, credential, Envelope::TopLevel, ERROR_POINTERS)?
            .trusting(CONTENT_BASE)?;
        Ok(Self { config, client })
    }

    /// Make API call with RPC style
    async fn rpc_call<T: serde::de::DeserializeOwned>(&self, endpoint: &str, body: &Value) -> Result<T, ProviderError> {
        let spec = RequestSpec::post(endpoint).json_body(body)?;
        self.client.send_typed(&spec).await.map_err(classify)
    }

    /// List folder with pagination
    async fn list_folder_all(&self, path: &str) -> Result<Vec<DropboxMetadata>, ProviderError> {
        let body = json!({
            "path": normalize_path(path),
            "recursive": false,
            "include_deleted": false,
            "include_mounted_folders": true
        });

        let mut result: ListFolderResult = self.rpc_call("files/list_folder", &body).await?;
        let mut all_entries = result.entries;

        while result.has_more {
            let continue_body = json!({ "cursor": result.cursor });
            result = self.rpc_call("files/list_folder/continue", &continue_body).await?;
            all_entries.extend(result.entries);
        }

        Ok(all_entries)
    }

    async fn relocation(&self, endpoint: &str, from: &str, to: &str) -> Result<DropboxMetadata, ProviderError> {
        let body = json!({
            "from_path": normalize_path(from),
            "to_path": normalize_path(to),
            "autorename": false
        });
        let result: MetadataResult = self.rpc_call(endpoint, &body).await?;
        Ok(result.metadata)
    }
}

#[async_trait]
impl StorageProvider for DropboxProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Dropbox
    }

    fn display_name(&self) -> String {
        self.config.name.clone()
    }

    fn base_address(&self) -> String {
        self.client.normalizer().base_address().to_string()
    }

    fn root_folder(&self) -> RemoteEntry {
        RemoteEntry::directory("", &self.config.name, "/")
    }

    async fn fetch(&self, folder: &RemoteEntry, params: &FetchParams) -> Result<FetchPage, ProviderError> {
        let entries = self
            .list_folder_all(&folder.path)
            .await?
            .into_iter()
            .map(|meta| meta.into_entry(Some(&folder.id)))
            .collect();
        Ok(params.paginate(entries))
    }

    fn reset(&self) {}

    async fn is_reachable(&self) -> Result<(), ProviderError> {
        self.user_info().await.map(|_| ())
    }

    fn cancel_all(&self) -> usize {
        self.client.session().cancel_all()
    }

    fn in_flight(&self) -> usize {
        self.client.session().in_flight()
    }

    fn copy(&self) -> Arc<dyn StorageProvider> {
        Arc::new(Self {
            config: self.config.clone(),
            client: self.client.fork(),
        })
    }

    fn record(&self) -> ProviderRecord {
        ProviderRecord {
            config: self.config.clone(),
            credential: self.client.auth().credential().map(|c| c.to_record()),
        }
    }

    fn auth(&self) -> Option<&RefreshCoordinator> {
        Some(self.client.auth())
    }

    async fn user_info(&self) -> Result<UserInfo, ProviderError> {
        let account: Account = self.rpc_call("users/get_current_account", &Value::Null).await?;
        Ok(UserInfo {
            id: account.account_id,
            display_name: account.name.display_name,
            email: account.email,
        })
    }

    async fn create_folder(&self, parent: &RemoteEntry, name: &str) -> Result<RemoteEntry, ProviderError> {
        let body = json!({
            "path": child_path(&parent.path, name),
            "autorename": false
        });
        let result: MetadataResult = self.rpc_call("files/create_folder_v2", &body).await?;
        // Folder metadata from create_folder_v2 carries no `.tag`
        let mut entry = result.metadata.into_entry(Some(&parent.id));
        entry.is_dir = true;
        entry.mime_type = None;

        info!("Created folder: {}", entry.path);
        Ok(entry)
    }

    async fn rename(&self, entry: &RemoteEntry, new_name: &str) -> Result<RemoteEntry, ProviderError> {
        let parent = entry.path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
        let meta = self
            .relocation("files/move_v2", &entry.path, &child_path(parent, new_name))
            .await?;

        info!("Renamed {} to {}", entry.path, new_name);
        Ok(meta.into_entry(entry.parent_id.as_deref()))
    }

    async fn delete(&self, entries: &[RemoteEntry]) -> Result<(), ProviderError> {
        for entry in entries {
            let body = json!({ "path": normalize_path(&entry.path) });
            let _: Value = self.rpc_call("files/delete_v2", &body).await?;
            info!("Deleted: {}", entry.path);
        }
        Ok(())
    }

    async fn transfer(
        &self,
        items: &[RemoteEntry],
        destination: &RemoteEntry,
        mode: TransferMode,
        overwrite: bool,
    ) -> Result<(), ProviderError> {
        let endpoint = match mode {
            TransferMode::Copy => "files/copy_v2",
            TransferMode::Move => "files/move_v2",
        };
        for item in items {
            let target = child_path(&destination.path, &item.name);
            match self.relocation(endpoint, &item.path, &target).await {
                Ok(_) => {}
                // Dropbox has no overwrite flag on copy/move: clear the target and try once more
                Err(ProviderError::Api { ref message, .. }) if overwrite && message.contains("to/conflict") => {
                    let _: Value = self.rpc_call("files/delete_v2", &json!({ "path": target })).await?;
                    self.relocation(endpoint, &item.path, &target).await?;
                }
                Err(err) => return Err(err),
            }
        }
        info!("Dropbox {:?} of {} item(s) into {}", mode, items.len(), destination.path);
        Ok(())
    }

    async fn download(
        &self,
        entry: &RemoteEntry,
        destination: &Path,
        progress: Option<ProgressCallback>,
    ) -> TransferOutcome<u64> {
        let arg = json!({ "path": normalize_path(&entry.path) });
        let spec = RequestSpec::post(&format!("{}files/download", CONTENT_BASE))
            .header("Dropbox-API-Arg", &header_safe_json(&arg));
        self.client.download_to(&spec, destination, progress).await
    }

    async fn upload(
        &self,
        folder: &RemoteEntry,
        name: &str,
        data: Vec<u8>,
        overwrite: bool,
        progress: Option<ProgressCallback>,
    ) -> TransferOutcome<RemoteEntry> {
        let arg = json!({
            "path": child_path(&folder.path, name),
            "mode": if overwrite { "overwrite" } else { "add" },
            "autorename": !overwrite,
            "mute": true
        });
        let spec = RequestSpec::post(&format!("{}files/upload", CONTENT_BASE))
            .header("Dropbox-API-Arg", &header_safe_json(&arg))
            .header("Content-Type", "application/octet-stream")
            .body(data);
        let parent_id = folder.id.clone();
        self.client.upload(&spec, progress).await.and_then(|payload| {
            let meta: DropboxMetadata = serde_json::from_value(payload)
                .map_err(|e| ProviderError::Validation(format!("Unexpected payload: {}", e)))?;
            Ok(meta.into_entry(Some(&parent_id)))
        })
    }
}
