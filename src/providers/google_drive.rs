//! Google Drive Storage Provider
//!
//! Implements StorageProvider for Google Drive using the Drive API v3.
//! Uses OAuth2 for authentication. Drive addresses files by id and allows
//! duplicate names inside a folder.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::client::AuthenticatedClient;
use super::credential::Credential;
use super::request::{Envelope, ParamEncoding, RequestSpec};
use super::{
    EntryFilter, FetchPage, FetchParams, ProgressCallback, ProviderConfig, ProviderEnv, ProviderError,
    ProviderRecord, ProviderType, RefreshCoordinator, RemoteEntry, StorageProvider, TransferMode,
    TransferOutcome, UserInfo,
};

const UPLOAD_API_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const ROOT_ID: &str = "root";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,size,modifiedTime,parents";
const UPLOAD_BOUNDARY: &str = "docbridge_boundary";

/// Google Drive file metadata
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    // Drive reports sizes as strings
    size: Option<String>,
    modified_time: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
}

impl DriveFile {
    fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    fn into_entry(self, parent_path: &str) -> RemoteEntry {
        let path = format!("{}/{}", parent_path.trim_end_matches('/'), self.name);
        let mut entry = if self.is_folder() {
            RemoteEntry::directory(&self.id, &self.name, &path)
        } else {
            let size = self.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
            let mut entry = RemoteEntry::file(&self.id, &self.name, &path, size);
            entry.mime_type = Some(self.mime_type.clone());
            entry
        };
        entry.parent_id = self.parents.into_iter().next();
        entry.modified = self.modified_time;
        entry
    }
}

/// File list response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct About {
    user: DriveUser,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveUser {
    display_name: Option<String>,
    email_address: Option<String>,
    permission_id: Option<String>,
}

/// Quote a value for use inside a Drive query string literal
fn query_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Drive search expression for the children of `folder_id`
fn children_query(folder_id: &str, params: &FetchParams) -> String {
    let mut query = format!("{} in parents and trashed=false", query_literal(folder_id));
    match params.filter {
        EntryFilter::FoldersOnly => query.push_str(&format!(" and mimeType='{}'", FOLDER_MIME)),
        EntryFilter::FilesOnly => query.push_str(&format!(" and mimeType!='{}'", FOLDER_MIME)),
        EntryFilter::All => {}
    }
    if let Some(text) = params.search.as_deref().filter(|t| !t.is_empty()) {
        query.push_str(&format!(" and name contains {}", query_literal(text)));
    }
    query
}

fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// `multipart/related` body carrying metadata and content in one request
fn multipart_body(metadata: &serde_json::Value, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", UPLOAD_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("--{}\r\n", UPLOAD_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--", UPLOAD_BOUNDARY).as_bytes());
    body
}

/// Google Drive storage provider
pub struct GoogleDriveProvider {
    config: ProviderConfig,
    client: AuthenticatedClient,
}

impl GoogleDriveProvider {
    pub fn new(
        config: ProviderConfig,
        credential: Option<Credential>,
        env: &ProviderEnv,
    ) -> Result<Self, ProviderError> {
        let strategy = env.oauth_strategy(&config)?;
        let client = env.client(&config, strategy, credential, Envelope::TopLevel, &[])?;
        Ok(Self { config, client })
    }

    /// List a folder, following `nextPageToken`
    async fn list_folder(&self, folder_id: &str, params: &FetchParams) -> Result<Vec<DriveFile>, ProviderError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut spec = RequestSpec::get("files")
                .param("q", children_query(folder_id, params))
                .param("fields", format!("files({}),nextPageToken", FILE_FIELDS))
                .param("pageSize", 1000);
            if let Some(token) = page_token.take() {
                spec = spec.param("pageToken", token);
            }

            let mut list: DriveFileList = self.client.send_typed(&spec).await?;
            files.append(&mut list.files);

            match list.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!("Drive folder {} holds {} matching item(s)", folder_id, files.len());
        Ok(files)
    }

    /// Find a non-trashed file by name in a folder
    async fn find_by_name(&self, name: &str, parent_id: &str) -> Result<Option<DriveFile>, ProviderError> {
        let query = format!(
            "name={} and {} in parents and trashed=false",
            query_literal(name),
            query_literal(parent_id)
        );
        let spec = RequestSpec::get("files")
            .param("q", query)
            .param("fields", format!("files({})", FILE_FIELDS));
        let list: DriveFileList = self.client.send_typed(&spec).await?;
        Ok(list.files.into_iter().find(|f| !f.is_folder()))
    }

    fn upload_spec(
        &self,
        existing: Option<&DriveFile>,
        folder: &RemoteEntry,
        name: &str,
        data: Vec<u8>,
    ) -> Result<RequestSpec, ProviderError> {
        let mime = mime_guess::from_path(name).first_or_octet_stream().to_string();
        let spec = match existing {
            // Overwrite replaces the content of the existing file and keeps its id
            Some(file) => RequestSpec::new(Method::PATCH, &format!("{}/files/{}", UPLOAD_API_BASE, file.id))
                .param("uploadType", "media")
                .header("Content-Type", &mime)
                .body(data),
            None => {
                let metadata = json!({
                    "name": name,
                    "mimeType": mime,
                    "parents": [folder.id]
                });
                RequestSpec::post(&format!("{}/files", UPLOAD_API_BASE))
                    .param("uploadType", "multipart")
                    .header("Content-Type", &format!("multipart/related; boundary={}", UPLOAD_BOUNDARY))
                    .body(multipart_body(&metadata, &data))
            }
        };
        Ok(spec.param("fields", FILE_FIELDS).encoding(ParamEncoding::Query))
    }
}

#[async_trait]
impl StorageProvider for GoogleDriveProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::GoogleDrive
    }

    fn display_name(&self) -> String {
        self.config.name.clone()
    }

    fn base_address(&self) -> String {
        self.client.normalizer().base_address().to_string()
    }

    fn root_folder(&self) -> RemoteEntry {
        RemoteEntry::directory(ROOT_ID, &self.config.name, "/")
    }

    async fn fetch(&self, folder: &RemoteEntry, params: &FetchParams) -> Result<FetchPage, ProviderError> {
        let entries = self
            .list_folder(&folder.id, params)
            .await?
            .into_iter()
            .map(|file| file.into_entry(&folder.path))
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
        let about: About = self.client.send_typed(&RequestSpec::get("about").param("fields", "user")).await?;
        let user = about.user;
        let id = user
            .permission_id
            .or_else(|| user.email_address.clone())
            .unwrap_or_default();
        Ok(UserInfo {
            display_name: user.display_name.unwrap_or_else(|| id.clone()),
            email: user.email_address,
            id,
        })
    }

    async fn create_folder(&self, parent: &RemoteEntry, name: &str) -> Result<RemoteEntry, ProviderError> {
        let spec = RequestSpec::post("files")
            .param("fields", FILE_FIELDS)
            .encoding(ParamEncoding::Query)
            .json_body(&json!({
                "name": name,
                "mimeType": FOLDER_MIME,
                "parents": [parent.id]
            }))?;
        let file: DriveFile = self.client.send_typed(&spec).await?;

        info!("Created folder: {}", name);
        Ok(file.into_entry(&parent.path))
    }

    async fn rename(&self, entry: &RemoteEntry, new_name: &str) -> Result<RemoteEntry, ProviderError> {
        let spec = RequestSpec::templated(Method::PATCH, "files/{}", &[&entry.id])?
            .param("fields", FILE_FIELDS)
            .encoding(ParamEncoding::Query)
            .json_body(&json!({ "name": new_name }))?;
        let file: DriveFile = self.client.send_typed(&spec).await?;

        info!("Renamed {} to {}", entry.name, new_name);
        Ok(file.into_entry(parent_path(&entry.path)))
    }

    async fn delete(&self, entries: &[RemoteEntry]) -> Result<(), ProviderError> {
        for entry in entries {
            let spec = RequestSpec::templated(Method::DELETE, "files/{}", &[&entry.id])?;
            self.client.send_expecting_success(&spec).await?;
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
        for item in items {
            if overwrite && !item.is_dir {
                if let Some(existing) = self.find_by_name(&item.name, &destination.id).await? {
                    if existing.id != item.id {
                        let spec = RequestSpec::templated(Method::DELETE, "files/{}", &[&existing.id])?;
                        self.client.send_expecting_success(&spec).await?;
                    }
                }
            }

            let spec = match mode {
                TransferMode::Move => {
                    let mut spec = RequestSpec::templated(Method::PATCH, "files/{}", &[&item.id])?
                        .param("addParents", destination.id.as_str());
                    if let Some(parent) = item.parent_id.as_deref() {
                        spec = spec.param("removeParents", parent);
                    }
                    spec.encoding(ParamEncoding::Query).json_body(&json!({}))?
                }
                TransferMode::Copy => {
                    if item.is_dir {
                        return Err(ProviderError::NotSupported(
                            "Google Drive cannot copy folders".to_string(),
                        ));
                    }
                    RequestSpec::templated(Method::POST, "files/{}/copy", &[&item.id])?.json_body(&json!({
                        "name": item.name,
                        "parents": [destination.id]
                    }))?
                }
            };
            self.client.send_expecting_success(&spec).await?;
        }
        info!("Google Drive {:?} of {} item(s) into {}", mode, items.len(), destination.path);
        Ok(())
    }

    async fn download(
        &self,
        entry: &RemoteEntry,
        destination: &Path,
        progress: Option<ProgressCallback>,
    ) -> TransferOutcome<u64> {
        match RequestSpec::templated(Method::GET, "files/{}", &[&entry.id]) {
            Ok(spec) => {
                self.client
                    .download_to(&spec.param("alt", "media"), destination, progress)
                    .await
            }
            Err(err) => TransferOutcome::Failed(err),
        }
    }

    async fn upload(
        &self,
        folder: &RemoteEntry,
        name: &str,
        data: Vec<u8>,
        overwrite: bool,
        progress: Option<ProgressCallback>,
    ) -> TransferOutcome<RemoteEntry> {
        let existing = if overwrite {
            match self.find_by_name(name, &folder.id).await {
                Ok(existing) => existing,
                Err(err) => return TransferOutcome::from_result(Err(err)),
            }
        } else {
            None
        };
        let spec = match self.upload_spec(existing.as_ref(), folder, name, data) {
            Ok(spec) => spec,
            Err(err) => return TransferOutcome::Failed(err),
        };
        let folder_path = folder.path.clone();
        self.client.upload(&spec, progress).await.and_then(|payload| {
            let file: DriveFile = serde_json::from_value(payload)
                .map_err(|e| ProviderError::Validation(format!("Unexpected payload: {}", e)))?;
            Ok(file.into_entry(&folder_path))
        })
    }
}
