//! Document portal provider
//!
//! REST API under `api/2.0/` with every payload wrapped as
//! `{"response": ...}`. Folders and files are addressed by numeric id, the
//! top-level categories by `@my`, `@share`, `@common` and `@projects`.
//!
//! The `Authorization` header depends on the server build: 10.0 and later
//! expect `Bearer <token>`, older servers the raw token. The build is read
//! from `settings/version/build` during `is_reachable` and cached until `reset`.
//!
//! Copy, move and delete are asynchronous on the server; the provider polls
//! `files/fileops` until the first operation reports completion.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use super::auth::PortalAuth;
use super::client::AuthenticatedClient;
use super::credential::{AuthScheme, Credential};
use super::request::{decode_json, Envelope, ParamEncoding, RequestSpec};
use super::session::TaskKind;
use super::{
    EntryFilter, FetchPage, FetchParams, PageTracker, ProgressCallback, ProviderConfig, ProviderEnv,
    ProviderError, ProviderRecord, ProviderType, RefreshCoordinator, RemoteEntry, SortField,
    StorageProvider, TransferMode, TransferOutcome, UserInfo,
};

/// Top-level folders offered as browse and copy/move roots
pub const CATEGORIES: &[(&str, &str)] = &[
    ("@my", "My Documents"),
    ("@share", "Shared with Me"),
    ("@common", "Common Documents"),
    ("@projects", "Project Documents"),
];

/// Oldest server build that accepts `Bearer` tokens
const BEARER_MIN_VERSION: (u32, u32) = (10, 0);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Tried after `error.message`
const ERROR_POINTERS: &[&str] = &["/error", "/message"];

const VERSION_PATH: &str = "api/2.0/settings/version/build";
const OPERATIONS_PATH: &str = "api/2.0/files/fileops";
const DOWNLOAD_HANDLER: &str = "Products/Files/HttpHandlers/filehandler.ashx";

/// Ids arrive as numbers from most endpoints and as strings from some
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
enum PortalId {
    Num(i64),
    Text(String),
}

impl fmt::Display for PortalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortalId::Num(id) => write!(f, "{}", id),
            PortalId::Text(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortalFolder {
    id: PortalId,
    title: String,
    #[serde(default)]
    parent_id: Option<PortalId>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    files_count: Option<u64>,
    #[serde(default)]
    folders_count: Option<u64>,
}

impl PortalFolder {
    fn into_entry(self, path: String) -> RemoteEntry {
        let mut entry = RemoteEntry::directory(&self.id.to_string(), &self.title, &path);
        entry.parent_id = self.parent_id.map(|id| id.to_string());
        entry.modified = self.updated;
        if let Some(count) = self.files_count {
            entry.metadata.insert("files_count".to_string(), count.to_string());
        }
        if let Some(count) = self.folders_count {
            entry.metadata.insert("folders_count".to_string(), count.to_string());
        }
        entry
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortalFile {
    id: PortalId,
    title: String,
    #[serde(default)]
    folder_id: Option<PortalId>,
    #[serde(default)]
    pure_content_length: Option<u64>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    view_url: Option<String>,
}

impl PortalFile {
    fn into_entry(self, path: String) -> RemoteEntry {
        let size = self.pure_content_length.unwrap_or(0);
        let mut entry = RemoteEntry::file(&self.id.to_string(), &self.title, &path, size);
        entry.parent_id = self.folder_id.map(|id| id.to_string());
        entry.modified = self.updated;
        if let Some(url) = self.view_url {
            entry.metadata.insert("view_url".to_string(), url);
        }
        entry
    }
}

#[derive(Debug, Deserialize)]
struct FolderListing {
    #[serde(default)]
    current: Option<PortalFolder>,
    #[serde(default)]
    folders: Vec<PortalFolder>,
    #[serde(default)]
    files: Vec<PortalFile>,
    #[serde(default)]
    total: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortalUser {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileOperation {
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    finished: bool,
}

/// Server build as read from `settings/version/build`
#[derive(Debug, Clone, PartialEq)]
struct Negotiated {
    version: Option<String>,
    scheme: AuthScheme,
}

/// Header scheme for a `communityServer` build string
pub fn scheme_for_version(version: Option<&str>) -> AuthScheme {
    let Some(version) = version else {
        return AuthScheme::LegacyRaw;
    };
    let mut parts = version.trim().split('.').map(|part| part.parse::<u32>().ok());
    let major = parts.next().flatten();
    let minor = parts.next().flatten().unwrap_or(0);
    match major {
        Some(major) if (major, minor) >= BEARER_MIN_VERSION => AuthScheme::Bearer,
        _ => AuthScheme::LegacyRaw,
    }
}

fn join_path(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

fn renamed_path(path: &str, new_name: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) => join_path(parent, new_name),
        None => new_name.to_string(),
    }
}

/// Numeric ids travel as JSON numbers
fn id_value(id: &str) -> Value {
    id.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::from(id))
}

fn split_ids(items: &[RemoteEntry]) -> (Vec<Value>, Vec<Value>) {
    let folders = items.iter().filter(|e| e.is_dir).map(|e| id_value(&e.id)).collect();
    let files = items.iter().filter(|e| !e.is_dir).map(|e| id_value(&e.id)).collect();
    (folders, files)
}

fn filter_type(filter: EntryFilter) -> Option<u8> {
    match filter {
        EntryFilter::All => None,
        EntryFilter::FilesOnly => Some(1),
        EntryFilter::FoldersOnly => Some(2),
    }
}

fn sort_by(field: SortField) -> &'static str {
    match field {
        SortField::Title => "title",
        SortField::Modified => "DateAndTime",
        SortField::Size => "size",
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, ProviderError> {
    serde_json::from_value(payload).map_err(|e| ProviderError::Validation(format!("Unexpected payload: {}", e)))
}

pub struct PortalProvider {
    config: ProviderConfig,
    client: AuthenticatedClient,
    pages: PageTracker,
    negotiated: RwLock<Option<Negotiated>>,
    poll_interval: Duration,
}

impl PortalProvider {
    pub fn new(
        config: ProviderConfig,
        credential: Option<Credential>,
        env: &ProviderEnv,
    ) -> Result<Self, ProviderError> {
        let client = env.client(&config, Arc::new(PortalAuth), credential, Envelope::Response, ERROR_POINTERS)?;
        Ok(Self {
            config,
            client,
            pages: PageTracker::default(),
            negotiated: RwLock::new(None),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Delay between `files/fileops` polls
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Store a fresh session token, presented with the negotiated scheme
    pub fn sign_in(&self, token: &str, expires_at: Option<i64>) {
        let scheme = self.negotiated().map(|n| n.scheme).unwrap_or(AuthScheme::LegacyRaw);
        self.client.auth().set_credential(Credential::portal(token, expires_at).with_scheme(scheme));
    }

    /// `communityServer` build, once negotiated
    pub fn server_version(&self) -> Option<String> {
        self.negotiated().and_then(|n| n.version)
    }

    fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn negotiate(&self) -> Result<AuthScheme, ProviderError> {
        if let Some(negotiated) = self.negotiated() {
            return Ok(negotiated.scheme);
        }
        let response = self.client.send_anonymous(&RequestSpec::get(VERSION_PATH)).await?;
        let payload = decode_json(&response, Envelope::Response, self.client.normalizer())?;
        let version = payload
            .get("communityServer")
            .and_then(Value::as_str)
            .map(str::to_string);
        let scheme = scheme_for_version(version.as_deref());
        info!(
            "Portal {} runs build {}, using {:?} tokens",
            self.base_address(),
            version.as_deref().unwrap_or("unknown"),
            scheme
        );
        self.client.auth().set_scheme(scheme);
        *self.negotiated.write().unwrap_or_else(|e| e.into_inner()) = Some(Negotiated { version, scheme });
        Ok(scheme)
    }

    /// Poll until the server's current file operation finishes
    async fn wait_for_operation(&self) -> Result<(), ProviderError> {
        loop {
            let operations: Vec<FileOperation> = self.client.send_typed(&RequestSpec::get(OPERATIONS_PATH)).await?;
            let Some(operation) = operations.into_iter().next() else {
                return Err(ProviderError::Validation("Invalid server data.".to_string()));
            };
            if let Some(message) = operation.error.filter(|e| !e.trim().is_empty()) {
                return Err(ProviderError::Api { status: None, message, raw: None });
            }
            let progress = operation.progress.unwrap_or(0.0);
            if operation.finished || progress >= 100.0 {
                return Ok(());
            }
            debug!("File operation at {}%", progress);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Start a file operation and wait for it inside one cancellable task
    async fn run_operation(&self, spec: RequestSpec) -> Result<(), ProviderError> {
        self.client
            .session()
            .run(TaskKind::Request, async {
                self.client.send_expecting_success(&spec).await?;
                self.wait_for_operation().await
            })
            .await
    }
}

#[async_trait]
impl StorageProvider for PortalProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Portal
    }

    fn display_name(&self) -> String {
        self.config.name.clone()
    }

    fn base_address(&self) -> String {
        self.client.normalizer().base_address().to_string()
    }

    fn root_folder(&self) -> RemoteEntry {
        RemoteEntry::directory("@root", &self.config.name, "/")
    }

    async fn fetch(&self, folder: &RemoteEntry, params: &FetchParams) -> Result<FetchPage, ProviderError> {
        self.pages.check(&folder.id, params.start_index)?;

        let mut spec = RequestSpec::templated(Method::GET, "api/2.0/files/{}", &[&folder.id])?
            .param("startIndex", params.start_index);
        if let Some(count) = params.count {
            spec = spec.param("count", count);
        }
        if let Some(code) = filter_type(params.filter) {
            spec = spec.param("filterType", code);
        }
        if let Some(text) = params.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            spec = spec
                .param("filterBy", "title")
                .param("filterOp", "contains")
                .param("filterValue", text);
        }
        if let Some(sort) = params.sort {
            spec = spec
                .param("sortBy", sort_by(sort.field))
                .param("sortOrder", if sort.descending { "descending" } else { "ascending" });
        }

        let listing: FolderListing = self.client.send_typed(&spec).await?;
        let total = listing
            .total
            .unwrap_or(listing.folders.len() + listing.files.len());
        self.pages.record(&folder.id, total);

        let entries = listing
            .folders
            .into_iter()
            .map(|f| {
                let path = join_path(&folder.path, &f.title);
                f.into_entry(path)
            })
            .chain(listing.files.into_iter().map(|f| {
                let path = join_path(&folder.path, &f.title);
                f.into_entry(path)
            }))
            .collect();

        Ok(FetchPage {
            current: listing.current.map(|c| c.into_entry(folder.path.clone())),
            entries,
            total: Some(total),
        })
    }

    fn reset(&self) {
        self.pages.clear();
        *self.negotiated.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    async fn is_reachable(&self) -> Result<(), ProviderError> {
        self.negotiate().await.map(|_| ())
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
            pages: PageTracker::default(),
            negotiated: RwLock::new(self.negotiated()),
            poll_interval: self.poll_interval,
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

    fn category_roots(&self) -> Vec<RemoteEntry> {
        CATEGORIES
            .iter()
            .map(|(id, title)| RemoteEntry::directory(id, title, &format!("/{}", title)))
            .collect()
    }

    async fn user_info(&self) -> Result<UserInfo, ProviderError> {
        let user: PortalUser = self.client.send_typed(&RequestSpec::get("api/2.0/people/@self")).await?;
        Ok(UserInfo {
            display_name: user
                .display_name
                .or(user.user_name)
                .unwrap_or_else(|| user.id.clone()),
            id: user.id,
            email: user.email,
        })
    }

    async fn create_folder(&self, parent: &RemoteEntry, name: &str) -> Result<RemoteEntry, ProviderError> {
        let spec = RequestSpec::templated(Method::POST, "api/2.0/files/folder/{}", &[&parent.id])?.param("title", name);
        let folder: PortalFolder = self.client.send_typed(&spec).await?;
        let path = join_path(&parent.path, &folder.title);
        Ok(folder.into_entry(path))
    }

    async fn rename(&self, entry: &RemoteEntry, new_name: &str) -> Result<RemoteEntry, ProviderError> {
        let template = if entry.is_dir { "api/2.0/files/folder/{}" } else { "api/2.0/files/file/{}" };
        let spec = RequestSpec::templated(Method::PUT, template, &[&entry.id])?.param("title", new_name);
        let payload = self.client.send_json(&spec).await?;
        let path = renamed_path(&entry.path, new_name);
        if entry.is_dir {
            Ok(parse_payload::<PortalFolder>(payload)?.into_entry(path))
        } else {
            Ok(parse_payload::<PortalFile>(payload)?.into_entry(path))
        }
    }

    async fn delete(&self, entries: &[RemoteEntry]) -> Result<(), ProviderError> {
        let (folder_ids, file_ids) = split_ids(entries);
        let spec = RequestSpec::new(Method::PUT, "api/2.0/files/fileops/delete").json_body(&json!({
            "folderIds": folder_ids,
            "fileIds": file_ids,
            "deleteAfter": false,
            "immediately": false,
        }))?;
        self.run_operation(spec).await
    }

    async fn transfer(
        &self,
        items: &[RemoteEntry],
        destination: &RemoteEntry,
        mode: TransferMode,
        overwrite: bool,
    ) -> Result<(), ProviderError> {
        let (folder_ids, file_ids) = split_ids(items);
        let mut body = json!({
            "destFolderId": id_value(&destination.id),
            // 0 = skip, 1 = overwrite
            "conflictResolveType": if overwrite { 1 } else { 0 },
        });
        if !folder_ids.is_empty() {
            body["folderIds"] = Value::Array(folder_ids);
        }
        if !file_ids.is_empty() {
            body["fileIds"] = Value::Array(file_ids);
        }
        let path = match mode {
            TransferMode::Copy => "api/2.0/files/fileops/copy",
            TransferMode::Move => "api/2.0/files/fileops/move",
        };
        info!("Portal {:?} of {} item(s) into {}", mode, items.len(), destination.id);
        self.run_operation(RequestSpec::new(Method::PUT, path).json_body(&body)?).await
    }

    async fn check_transfer(
        &self,
        items: &[RemoteEntry],
        destination: &RemoteEntry,
    ) -> Result<Vec<String>, ProviderError> {
        let (folder_ids, file_ids) = split_ids(items);
        let mut spec = RequestSpec::get("api/2.0/files/fileops/move").param("destFolderId", id_value(&destination.id));
        if !folder_ids.is_empty() {
            spec = spec.param("folderIds", Value::Array(folder_ids));
        }
        if !file_ids.is_empty() {
            spec = spec.param("fileIds", Value::Array(file_ids));
        }
        let conflicts: Vec<PortalFile> = self.client.send_typed(&spec).await?;
        Ok(conflicts.into_iter().map(|f| f.title).collect())
    }

    async fn download(
        &self,
        entry: &RemoteEntry,
        destination: &Path,
        progress: Option<ProgressCallback>,
    ) -> TransferOutcome<u64> {
        let spec = match entry.metadata.get("view_url") {
            Some(url) => RequestSpec::get(url),
            None => RequestSpec::get(DOWNLOAD_HANDLER)
                .param("action", "download")
                .param("fileid", entry.id.as_str()),
        };
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
        let spec = match RequestSpec::templated(Method::POST, "api/2.0/files/{}/upload", &[&folder.id]) {
            Ok(spec) => spec,
            Err(err) => return TransferOutcome::Failed(err),
        };
        let mime = mime_guess::from_path(name).first_or_octet_stream();
        let spec = spec
            .param("title", name)
            .param("overwrite", overwrite)
            .encoding(ParamEncoding::Query)
            .header("Content-Type", mime.essence_str())
            .body(data);
        let path = join_path(&folder.path, name);
        self.client
            .upload(&spec, progress)
            .await
            .and_then(|payload| Ok(parse_payload::<PortalFile>(payload)?.into_entry(path)))
    }
}
