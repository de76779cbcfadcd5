//! OneDrive Storage Provider
//!
//! Implements StorageProvider for Microsoft OneDrive using the Microsoft Graph API.
//! Uses OAuth2 for authentication. Items are addressed by id; the drive root is `root`.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::client::AuthenticatedClient;
use super::credential::Credential;
use super::request::{Envelope, ParamEncoding, RequestSpec};
use super::{
    FetchPage, FetchParams, ProgressCallback, ProviderConfig, ProviderEnv, ProviderError, ProviderRecord,
    ProviderType, RefreshCoordinator, RemoteEntry, StorageProvider, TransferMode, TransferOutcome, UserInfo,
};

const ROOT_ID: &str = "root";

const CONFLICT_BEHAVIOR: &str = "@microsoft.graph.conflictBehavior";

/// OneDrive item metadata
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    name: String,
    #[serde(default)]
    size: u64,
    last_modified_date_time: Option<String>,
    #[serde(default)]
    folder: Option<FolderFacet>,
    #[serde(default)]
    file: Option<FileFacet>,
    #[serde(default)]
    parent_reference: Option<ParentReference>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FolderFacet {
    child_count: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FileFacet {
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParentReference {
    id: Option<String>,
}

impl DriveItem {
    fn into_entry(self, parent_path: &str) -> RemoteEntry {
        let path = format!("{}/{}", parent_path.trim_end_matches('/'), self.name);
        let mut entry = match self.folder {
            Some(folder) => {
                let mut entry = RemoteEntry::directory(&self.id, &self.name, &path);
                if let Some(count) = folder.child_count {
                    entry.metadata.insert("child_count".to_string(), count.to_string());
                }
                entry
            }
            None => {
                let mut entry = RemoteEntry::file(&self.id, &self.name, &path, self.size);
                if let Some(mime) = self.file.and_then(|f| f.mime_type) {
                    entry.mime_type = Some(mime);
                }
                entry
            }
        };
        entry.parent_id = self.parent_reference.and_then(|p| p.id);
        entry.modified = self.last_modified_date_time;
        entry
    }
}

/// List children response
#[derive(Debug, Deserialize)]
struct ChildrenResponse {
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    id: String,
    display_name: Option<String>,
    mail: Option<String>,
    user_principal_name: Option<String>,
}

fn conflict_behavior(overwrite: bool) -> &'static str {
    if overwrite { "replace" } else { "fail" }
}

fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// OneDrive storage provider
pub struct OneDriveProvider {
    config: ProviderConfig,
    client: AuthenticatedClient,
}

impl OneDriveProvider {
    pub fn new(
        config: ProviderConfig,
        credential: Option<Credential>,
        env: &ProviderEnv,
    ) -> Result<Self, ProviderError> {
        let strategy = env.oauth_strategy(&config)?;
        let client = env.client(&config, strategy, credential, Envelope::TopLevel, &[])?;
        Ok(Self { config, client })
    }

    fn item(&self, template: &str, item_id: &str) -> Result<RequestSpec, ProviderError> {
        RequestSpec::templated(Method::GET, template, &[item_id])
    }

    /// List all children, following `@odata.nextLink`
    async fn list_children(&self, item_id: &str) -> Result<Vec<DriveItem>, ProviderError> {
        let mut page: ChildrenResponse = self
            .client
            .send_typed(&self.item("me/drive/items/{}/children", item_id)?)
            .await?;
        let mut items = page.value;
        while let Some(next) = page.next_link.take() {
            page = self.client.send_typed(&RequestSpec::get(&next)).await?;
            items.append(&mut page.value);
        }
        Ok(items)
    }
}

#[async_trait]
impl StorageProvider for OneDriveProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::OneDrive
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
            .list_children(&folder.id)
            .await?
            .into_iter()
            .map(|item| item.into_entry(&folder.path))
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
        let user: GraphUser = self.client.send_typed(&RequestSpec::get("me")).await?;
        Ok(UserInfo {
            display_name: user.display_name.unwrap_or_else(|| user.id.clone()),
            email: user.mail.or(user.user_principal_name),
            id: user.id,
        })
    }

    async fn create_folder(&self, parent: &RemoteEntry, name: &str) -> Result<RemoteEntry, ProviderError> {
        let spec = RequestSpec::templated(Method::POST, "me/drive/items/{}/children", &[&parent.id])?.json_body(&json!({
            "name": name,
            "folder": {},
            CONFLICT_BEHAVIOR: "fail"
        }))?;
        let item: DriveItem = self.client.send_typed(&spec).await?;

        info!("Created folder: {}", name);
        Ok(item.into_entry(&parent.path))
    }

    async fn rename(&self, entry: &RemoteEntry, new_name: &str) -> Result<RemoteEntry, ProviderError> {
        let spec = RequestSpec::templated(Method::PATCH, "me/drive/items/{}", &[&entry.id])?
            .json_body(&json!({ "name": new_name }))?;
        let item: DriveItem = self.client.send_typed(&spec).await?;

        info!("Renamed {} to {}", entry.name, new_name);
        Ok(item.into_entry(parent_path(&entry.path)))
    }

    async fn delete(&self, entries: &[RemoteEntry]) -> Result<(), ProviderError> {
        for entry in entries {
            let spec = RequestSpec::templated(Method::DELETE, "me/drive/items/{}", &[&entry.id])?;
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
            let spec = match mode {
                TransferMode::Move => RequestSpec::templated(Method::PATCH, "me/drive/items/{}", &[&item.id])?
                    .param(CONFLICT_BEHAVIOR, conflict_behavior(overwrite))
                    .encoding(ParamEncoding::Query)
                    .json_body(&json!({ "parentReference": { "id": destination.id } }))?,
                // Copy is asynchronous on the server and answers 202 Accepted
                TransferMode::Copy => RequestSpec::templated(Method::POST, "me/drive/items/{}/copy", &[&item.id])?
                    .param(CONFLICT_BEHAVIOR, conflict_behavior(overwrite))
                    .encoding(ParamEncoding::Query)
                    .json_body(&json!({
                        "parentReference": { "id": destination.id },
                        "name": item.name
                    }))?,
            };
            self.client.send_expecting_success(&spec).await?;
        }
        info!("OneDrive {:?} of {} item(s) into {}", mode, items.len(), destination.path);
        Ok(())
    }

    async fn download(
        &self,
        entry: &RemoteEntry,
        destination: &Path,
        progress: Option<ProgressCallback>,
    ) -> TransferOutcome<u64> {
        match RequestSpec::templated(Method::GET, "me/drive/items/{}/content", &[&entry.id]) {
            Ok(spec) => self.client.download_to(&spec, destination, progress).await,
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
        let spec = match RequestSpec::templated(Method::PUT, "me/drive/items/{}:/{}:/content", &[&folder.id, name]) {
            Ok(spec) => spec,
            Err(err) => return TransferOutcome::Failed(err),
        };
        let spec = spec
            .param(CONFLICT_BEHAVIOR, conflict_behavior(overwrite))
            .encoding(ParamEncoding::Query)
            .header("Content-Type", "application/octet-stream")
            .body(data);
        let folder_path = folder.path.clone();
        self.client.upload(&spec, progress).await.and_then(|payload| {
            let item: DriveItem = serde_json::from_value(payload)
                .map_err(|e| ProviderError::Validation(format!("Unexpected payload: {}", e)))?;
            Ok(item.into_entry(&folder_path))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::providers::testing::{Reply, ScriptedTransport};
    use serde_json::Value;

    fn provider(transport: Arc<ScriptedTransport>) -> OneDriveProvider {
        let env = ProviderEnv::with_transport(PipelineConfig::default(), transport);
        let config = ProviderConfig::new(ProviderType::OneDrive, "OneDrive")
            .with_extra("client_id", "app")
            .with_extra("token_url", "https://auth.example.com/token");
        OneDriveProvider::new(config, Some(Credential::bearer("at", Some("rt"), None)), &env).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_follows_next_link() {
        let transport = ScriptedTransport::new(|req| {
            if req.url.query().is_some_and(|q| q.contains("skiptoken")) {
                Reply::json(200, json!({"value": [
                    {"id": "F2", "name": "b.txt", "size": 3, "file": {"mimeType": "text/plain"},
                     "parentReference": {"id": "root"}}
                ]}))
            } else {
                Reply::json(200, json!({
                    "value": [{"id": "D1", "name": "Photos", "folder": {"childCount": 4},
                               "parentReference": {"id": "root"}}],
                    "@odata.nextLink": "https://graph.microsoft.com/v1.0/me/drive/items/root/children?$skiptoken=abc"
                }))
            }
        });
        let onedrive = provider(transport.clone());
        let page = onedrive
            .fetch(&onedrive.root_folder(), &FetchParams::default())
            .await
            .unwrap();

        assert_eq!(page.total, Some(2));
        assert!(page.entries[0].is_dir);
        assert_eq!(page.entries[0].path, "/Photos");
        assert_eq!(page.entries[0].metadata["child_count"], "4");
        assert_eq!(page.entries[1].mime_type.as_deref(), Some("text/plain"));
        assert_eq!(page.entries[1].parent_id.as_deref(), Some("root"));

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].url.path(), "/v1.0/me/drive/items/root/children");
        assert_eq!(requests[1].header("authorization"), Some("Bearer at"));
    }

    #[tokio::test]
    async fn test_graph_error_message_surfaces() {
        let transport = ScriptedTransport::new(|_| {
            Reply::json(404, json!({"error": {"code": "itemNotFound", "message": "Item does not exist"}}))
        });
        let onedrive = provider(transport);
        let folder = RemoteEntry::directory("X", "Gone", "/Gone");
        let err = onedrive.fetch(&folder, &FetchParams::default()).await.unwrap_err();
        assert_eq!(err.message(), "Item does not exist");
    }

    #[tokio::test]
    async fn test_move_patches_parent_reference() {
        let transport = ScriptedTransport::new(|_| Reply::json(200, json!({"id": "F1", "name": "a.txt"})));
        let onedrive = provider(transport.clone());
        let items = vec![RemoteEntry::file("F1", "a.txt", "/a.txt", 1)];
        let destination = RemoteEntry::directory("D9", "Archive", "/Archive");
        onedrive.transfer(&items, &destination, TransferMode::Move, true).await.unwrap();

        let request = &transport.requests()[0];
        assert_eq!(request.method, Method::PATCH);
        assert_eq!(request.url.path(), "/v1.0/me/drive/items/F1");
        assert_eq!(request.url.query(), Some("%40microsoft.graph.conflictBehavior=replace"));
        let body: Value = serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["parentReference"]["id"], "D9");
    }

    #[tokio::test]
    async fn test_copy_accepts_202() {
        let transport = ScriptedTransport::new(|_| Reply::status(202).header("location", "https://monitor.example.com/1"));
        let onedrive = provider(transport.clone());
        let items = vec![RemoteEntry::file("F1", "a.txt", "/a.txt", 1)];
        let destination = RemoteEntry::directory("D9", "Archive", "/Archive");
        onedrive.transfer(&items, &destination, TransferMode::Copy, false).await.unwrap();
        assert_eq!(transport.requests()[0].url.path(), "/v1.0/me/drive/items/F1/copy");
    }

    #[tokio::test]
    async fn test_upload_encodes_name_into_path() {
        let transport = ScriptedTransport::new(|_| {
            Reply::json(201, json!({"id": "F5", "name": "q 1.txt", "size": 4, "file": {}}))
        });
        let onedrive = provider(transport.clone());
        let folder = RemoteEntry::directory("D1", "Docs", "/Docs");
        let entry = onedrive
            .upload(&folder, "q 1.txt", b"data".to_vec(), false, None)
            .await
            .into_result()
            .unwrap();
        assert_eq!(entry.path, "/Docs/q 1.txt");
        assert_eq!(transport.requests()[0].url.path(), "/v1.0/me/drive/items/D1:/q%201.txt:/content");
    }

    #[tokio::test]
    async fn test_user_info_falls_back_to_principal_name() {
        let transport = ScriptedTransport::new(|_| {
            Reply::json(200, json!({"id": "u1", "displayName": "Ann", "userPrincipalName": "ann@contoso.com"}))
        });
        let onedrive = provider(transport);
        let user = onedrive.user_info().await.unwrap();
        assert_eq!(user.email.as_deref(), Some("ann@contoso.com"));
    }
}
