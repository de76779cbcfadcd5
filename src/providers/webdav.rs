//! WebDAV Storage Provider
//!
//! Implementation of the StorageProvider trait for the WebDAV protocol.
//! Serves generic WebDAV servers plus Nextcloud, ownCloud, kDrive and Yandex Disk,
//! which differ only in where the DAV tree starts.
//!
//! WebDAV extends HTTP with methods like PROPFIND, MKCOL, MOVE, COPY, and DELETE.
//! Entries are addressed by their path below the DAV root; the path is also the id.

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Method;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::auth::StaticAuth;
use super::client::AuthenticatedClient;
use super::credential::Credential;
use super::http::HttpResponse;
use super::request::{decode_path, encode_path, encode_segment, Envelope, RequestSpec};
use super::{
    FetchPage, FetchParams, ProgressCallback, ProviderConfig, ProviderEnv, ProviderError, ProviderRecord,
    ProviderType, RefreshCoordinator, RemoteEntry, StorageProvider, TransferMode, TransferOutcome, UserInfo,
};

const ERROR_POINTERS: &[&str] = &["/ocs/meta/message"];

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
    <d:getlastmodified/>
    <d:getcontenttype/>
    <d:getetag/>
  </d:prop>
</d:propfind>"#;

/// Custom HTTP methods for WebDAV
fn dav_method(name: &'static str) -> Result<Method, ProviderError> {
    Method::from_bytes(name.as_bytes()).map_err(|e| ProviderError::Encoding(format!("{}: {}", name, e)))
}

/// One `<response>` of a multistatus body
#[derive(Debug, Default, Clone, PartialEq)]
struct DavResource {
    href: String,
    is_dir: bool,
    size: u64,
    modified: Option<String>,
    content_type: Option<String>,
    etag: Option<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum DavField {
    Href,
    ContentLength,
    LastModified,
    ContentType,
    Etag,
}

fn entity_text(name: &[u8]) -> &'static str {
    match name {
        b"amp" => "&",
        b"lt" => "<",
        b"gt" => ">",
        b"quot" => "\"",
        b"apos" => "'",
        _ => "",
    }
}

/// Parse a PROPFIND multistatus body. Namespace prefixes vary by server
/// (`d:`, `D:`, `lp1:`...), so elements are matched on their local name.
fn parse_multistatus(xml: &str) -> Result<Vec<DavResource>, ProviderError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut resources = Vec::new();
    let mut current: Option<DavResource> = None;
    let mut field: Option<DavField> = None;
    let mut text = String::new();
    let mut in_resourcetype = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"response" => current = Some(DavResource::default()),
                b"resourcetype" => in_resourcetype = true,
                b"collection" if in_resourcetype => {
                    if let Some(resource) = current.as_mut() {
                        resource.is_dir = true;
                    }
                }
                name => {
                    field = match name {
                        b"href" => Some(DavField::Href),
                        b"getcontentlength" => Some(DavField::ContentLength),
                        b"getlastmodified" => Some(DavField::LastModified),
                        b"getcontenttype" => Some(DavField::ContentType),
                        b"getetag" => Some(DavField::Etag),
                        _ => None,
                    };
                    text.clear();
                }
            },
            Ok(Event::Empty(ref e)) => {
                if in_resourcetype && e.local_name().as_ref() == b"collection" {
                    if let Some(resource) = current.as_mut() {
                        resource.is_dir = true;
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                if field.is_some() {
                    text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::GeneralRef(ref e)) => {
                if field.is_some() {
                    text.push_str(entity_text(e.as_ref()));
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(resource) = current.take() {
                        if !resource.href.is_empty() {
                            resources.push(resource);
                        }
                    }
                }
                b"resourcetype" => in_resourcetype = false,
                _ => {
                    if let (Some(done), Some(resource)) = (field.take(), current.as_mut()) {
                        let value = text.trim().to_string();
                        match done {
                            DavField::Href => resource.href = value,
                            DavField::ContentLength => resource.size = value.parse().unwrap_or(0),
                            DavField::LastModified => resource.modified = Some(value).filter(|v| !v.is_empty()),
                            DavField::ContentType => resource.content_type = Some(value).filter(|v| !v.is_empty()),
                            DavField::Etag => {
                                resource.etag = Some(value.trim_matches('"').to_string()).filter(|v| !v.is_empty())
                            }
                        }
                    }
                }
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ProviderError::Validation(format!(
                    "Malformed multistatus at {}: {}",
                    reader.buffer_position(),
                    e
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(resources)
}

/// `<s:message>` of a Sabre-style XML error body
fn xml_error_message(body: &[u8]) -> Option<String> {
    let xml = std::str::from_utf8(body).ok()?;
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_message = false;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => in_message = e.local_name().as_ref() == b"message",
            Ok(Event::Text(ref e)) if in_message => {
                let message = String::from_utf8_lossy(e.as_ref()).trim().to_string();
                return Some(message).filter(|m| !m.is_empty());
            }
            Ok(Event::End(_)) => in_message = false,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// RFC 2822 `getlastmodified` as RFC 3339, so entries sort chronologically
fn normalize_timestamp(value: &str) -> String {
    chrono::DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|_| value.to_string())
}

fn join_path(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

fn parent_path(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

/// Where the DAV tree starts, relative to the server address
fn dav_prefix(config: &ProviderConfig, base: &str) -> Result<String, ProviderError> {
    match config.provider_type {
        ProviderType::Nextcloud | ProviderType::OwnCloud if !base.contains("/remote.php/") => {
            let username = config.username.as_deref().filter(|u| !u.is_empty()).ok_or_else(|| {
                ProviderError::InvalidConfig(format!("{} requires a username", config.provider_type))
            })?;
            Ok(format!("remote.php/dav/files/{}/", encode_segment(username)?))
        }
        _ => Ok(String::new()),
    }
}

#[derive(Debug, Deserialize)]
struct OcsEnvelope {
    ocs: OcsBody,
}

#[derive(Debug, Deserialize)]
struct OcsBody {
    data: OcsUser,
}

#[derive(Debug, Deserialize)]
struct OcsUser {
    id: String,
    #[serde(rename = "display-name", alias = "displayname")]
    display_name: Option<String>,
    email: Option<String>,
}

/// WebDAV Storage Provider
pub struct WebDavProvider {
    config: ProviderConfig,
    client: AuthenticatedClient,
    /// Encoded DAV root relative to the server address, with a trailing slash when set
    prefix: String,
    /// Decoded URL path of the DAV root, used to map hrefs back to entry paths
    root_path: String,
}

impl WebDavProvider {
    pub fn new(
        config: ProviderConfig,
        credential: Option<Credential>,
        env: &ProviderEnv,
    ) -> Result<Self, ProviderError> {
        let base = config.resolved_base_url()?;
        let prefix = dav_prefix(&config, &base)?;
        let client = env.client(&config, Arc::new(StaticAuth), credential, Envelope::TopLevel, ERROR_POINTERS)?;
        let root_url = client.adapter().resolve(&prefix)?;
        let root_path = decode_path(root_url.path())?.trim_end_matches('/').to_string();
        Ok(Self {
            config,
            client,
            prefix,
            root_path,
        })
    }

    /// Username and password for basic auth
    pub fn sign_in(&self, password: &str) -> Result<(), ProviderError> {
        let username = self
            .config
            .username
            .as_deref()
            .ok_or_else(|| ProviderError::InvalidConfig("WebDAV sign-in requires a username".to_string()))?;
        self.client.auth().set_credential(Credential::basic(username, password));
        Ok(())
    }

    /// Encoded request path for an entry path below the DAV root
    fn dav_path(&self, path: &str, collection: bool) -> Result<String, ProviderError> {
        let encoded = encode_path(path.trim_start_matches('/'))?;
        let mut full = format!("{}{}", self.prefix, encoded);
        if collection && !full.is_empty() && !full.ends_with('/') {
            full.push('/');
        }
        Ok(full)
    }

    /// Absolute URL for the `Destination` header
    fn destination(&self, path: &str, collection: bool) -> Result<String, ProviderError> {
        Ok(self.client.adapter().resolve(&self.dav_path(path, collection)?)?.to_string())
    }

    /// Entry path of an href, relative to the DAV root
    fn entry_path(&self, href: &str) -> Result<String, ProviderError> {
        // Some servers answer with absolute URLs
        let href_path = match url::Url::parse(href) {
            Ok(url) => url.path().to_string(),
            Err(_) => href.to_string(),
        };
        let decoded = decode_path(&href_path)?;
        let relative = decoded.strip_prefix(&self.root_path).unwrap_or(&decoded);
        Ok(format!("/{}", relative.trim_matches('/')))
    }

    fn into_entry(&self, resource: DavResource, parent_id: &str) -> Result<RemoteEntry, ProviderError> {
        let path = self.entry_path(&resource.href)?;
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        let mut entry = if resource.is_dir {
            RemoteEntry::directory(&path, &name, &path)
        } else {
            let mut entry = RemoteEntry::file(&path, &name, &path, resource.size);
            if resource.content_type.is_some() {
                entry.mime_type = resource.content_type;
            }
            entry
        };
        entry.modified = resource.modified.as_deref().map(normalize_timestamp);
        if let Some(etag) = resource.etag {
            entry.metadata.insert("etag".to_string(), etag);
        }
        Ok(entry.with_parent(parent_id))
    }

    async fn propfind(&self, path: &str, depth: &str) -> Result<Vec<DavResource>, ProviderError> {
        let spec = RequestSpec::new(dav_method("PROPFIND")?, &self.dav_path(path, true)?)
            .header("Depth", depth)
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY.as_bytes().to_vec());
        let response = self.send_checked(&spec, path).await?;
        let xml = String::from_utf8_lossy(&response.body);
        parse_multistatus(&xml)
    }

    /// Send and map DAV status codes onto errors
    async fn send_checked(&self, spec: &RequestSpec, target: &str) -> Result<HttpResponse, ProviderError> {
        let response = self.client.send_raw(spec).await?;
        if response.is_success() {
            return Ok(response);
        }
        Err(self.dav_error(&response, target))
    }

    fn dav_error(&self, response: &HttpResponse, target: &str) -> ProviderError {
        match response.status {
            404 => ProviderError::NotFound(target.to_string()),
            412 => ProviderError::Api {
                status: Some(412),
                message: format!("{} already exists", target),
                raw: None,
            },
            status => match xml_error_message(&response.body) {
                Some(message) => ProviderError::Api {
                    status: Some(status),
                    message,
                    raw: Some(String::from_utf8_lossy(&response.body).into_owned()),
                },
                None => self.client.normalizer().from_response(response),
            },
        }
    }

    async fn relocate(
        &self,
        method: &'static str,
        entry: &RemoteEntry,
        target: &str,
        overwrite: bool,
    ) -> Result<(), ProviderError> {
        let spec = RequestSpec::new(dav_method(method)?, &self.dav_path(&entry.path, entry.is_dir)?)
            .header("Destination", &self.destination(target, entry.is_dir)?)
            .header("Overwrite", if overwrite { "T" } else { "F" });
        self.send_checked(&spec, target).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for WebDavProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn provider_type(&self) -> ProviderType {
        self.config.provider_type
    }

    fn display_name(&self) -> String {
        self.config.name.clone()
    }

    fn base_address(&self) -> String {
        self.client.normalizer().base_address().to_string()
    }

    fn root_folder(&self) -> RemoteEntry {
        RemoteEntry::directory("/", &self.config.name, "/")
    }

    async fn fetch(&self, folder: &RemoteEntry, params: &FetchParams) -> Result<FetchPage, ProviderError> {
        let own_path = folder.path.trim_matches('/');
        let mut entries = Vec::new();
        for resource in self.propfind(&folder.path, "1").await? {
            let entry = self.into_entry(resource, &folder.id)?;
            // Depth 1 includes the collection itself
            if entry.path.trim_matches('/') == own_path {
                continue;
            }
            entries.push(entry);
        }
        debug!("WebDAV {} lists {} entries", folder.path, entries.len());
        Ok(params.paginate(entries))
    }

    fn reset(&self) {}

    async fn is_reachable(&self) -> Result<(), ProviderError> {
        self.propfind("/", "0").await.map(|_| ())
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
            prefix: self.prefix.clone(),
            root_path: self.root_path.clone(),
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
        match self.config.provider_type {
            ProviderType::Nextcloud | ProviderType::OwnCloud => {
                let spec = RequestSpec::get("ocs/v1.php/cloud/user")
                    .param("format", "json")
                    .header("OCS-APIRequest", "true");
                let envelope: OcsEnvelope = self.client.send_typed(&spec).await?;
                let user = envelope.ocs.data;
                Ok(UserInfo {
                    display_name: user.display_name.unwrap_or_else(|| user.id.clone()),
                    email: user.email.filter(|e| !e.is_empty()),
                    id: user.id,
                })
            }
            // Plain WebDAV has no account endpoint; the login is the identity
            _ => {
                let username = self
                    .config
                    .username
                    .clone()
                    .ok_or_else(|| ProviderError::NotSupported("WebDAV user info without a username".to_string()))?;
                Ok(UserInfo {
                    id: username.clone(),
                    display_name: username,
                    email: None,
                })
            }
        }
    }

    async fn create_folder(&self, parent: &RemoteEntry, name: &str) -> Result<RemoteEntry, ProviderError> {
        let path = join_path(&parent.path, name);
        let spec = RequestSpec::new(dav_method("MKCOL")?, &self.dav_path(&path, true)?);
        self.send_checked(&spec, &path).await?;

        info!("Created folder: {}", path);
        Ok(RemoteEntry::directory(&path, name, &path).with_parent(&parent.id))
    }

    async fn rename(&self, entry: &RemoteEntry, new_name: &str) -> Result<RemoteEntry, ProviderError> {
        let parent = parent_path(&entry.path);
        let target = join_path(parent, new_name);
        self.relocate("MOVE", entry, &target, false).await?;

        info!("Renamed {} to {}", entry.path, target);
        let mut renamed = entry.clone();
        renamed.id = target.clone();
        renamed.name = new_name.to_string();
        renamed.path = target;
        Ok(renamed)
    }

    async fn delete(&self, entries: &[RemoteEntry]) -> Result<(), ProviderError> {
        for entry in entries {
            // DELETE on a collection is recursive
            let spec = RequestSpec::new(Method::DELETE, &self.dav_path(&entry.path, entry.is_dir)?);
            self.send_checked(&spec, &entry.path).await?;
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
        let method = match mode {
            TransferMode::Copy => "COPY",
            TransferMode::Move => "MOVE",
        };
        for item in items {
            let target = join_path(&destination.path, &item.name);
            self.relocate(method, item, &target, overwrite).await?;
        }
        info!("WebDAV {} of {} item(s) into {}", method, items.len(), destination.path);
        Ok(())
    }

    async fn download(
        &self,
        entry: &RemoteEntry,
        destination: &Path,
        progress: Option<ProgressCallback>,
    ) -> TransferOutcome<u64> {
        match self.dav_path(&entry.path, false) {
            Ok(path) => self.client.download_to(&RequestSpec::get(&path), destination, progress).await,
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
        let path = join_path(&folder.path, name);
        let dav_path = match self.dav_path(&path, false) {
            Ok(dav_path) => dav_path,
            Err(err) => return TransferOutcome::Failed(err),
        };
        let size = data.len() as u64;
        let mime = mime_guess::from_path(name).first_or_octet_stream().to_string();
        let mut spec = RequestSpec::new(Method::PUT, &dav_path)
            .header("Content-Type", &mime)
            .body(data);
        if !overwrite {
            // Fails with 412 when the target exists
            spec = spec.header("If-None-Match", "*");
        }

        let folder_id = folder.id.clone();
        self.client.upload_raw(&spec, progress).await.and_then(|_| {
            let mut entry = RemoteEntry::file(&path, name, &path, size).with_parent(&folder_id);
            entry.mime_type = Some(mime);
            Ok(entry)
        })
    }
}
