//! Shared types for storage providers
//!
//! This module contains the types used across every backend: provider
//! configuration, folder entries, fetch parameters, transfer outcomes and the
//! error taxonomy surfaced to callers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::credential::CredentialRecord;

/// Supported storage provider types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Files stored on this device
    Local,
    /// Collaboration server (document portal)
    Portal,
    /// Dropbox (OAuth2)
    Dropbox,
    /// Microsoft OneDrive (OAuth2)
    OneDrive,
    /// Google Drive (OAuth2)
    GoogleDrive,
    /// Plain WebDAV server
    WebDav,
    /// Nextcloud (WebDAV + OCS)
    Nextcloud,
    /// ownCloud (WebDAV + OCS)
    OwnCloud,
    /// Infomaniak kDrive (WebDAV)
    KDrive,
    /// Yandex Disk (WebDAV)
    Yandex,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderType::Local => write!(f, "On Device"),
            ProviderType::Portal => write!(f, "Portal"),
            ProviderType::Dropbox => write!(f, "Dropbox"),
            ProviderType::OneDrive => write!(f, "OneDrive"),
            ProviderType::GoogleDrive => write!(f, "Google Drive"),
            ProviderType::WebDav => write!(f, "WebDAV"),
            ProviderType::Nextcloud => write!(f, "Nextcloud"),
            ProviderType::OwnCloud => write!(f, "ownCloud"),
            ProviderType::KDrive => write!(f, "kDrive"),
            ProviderType::Yandex => write!(f, "Yandex Disk"),
        }
    }
}

impl ProviderType {
    /// Backends reached through the WebDAV protocol
    pub fn is_webdav(&self) -> bool {
        matches!(
            self,
            ProviderType::WebDav
                | ProviderType::Nextcloud
                | ProviderType::OwnCloud
                | ProviderType::KDrive
                | ProviderType::Yandex
        )
    }

    /// Check if this provider authenticates with OAuth2 bearer tokens
    pub fn requires_oauth2(&self) -> bool {
        matches!(
            self,
            ProviderType::Dropbox | ProviderType::OneDrive | ProviderType::GoogleDrive
        )
    }

    /// Fixed API base for hosted backends. Self-hosted ones take it from config.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderType::Dropbox => Some("https://api.dropboxapi.com/2/"),
            ProviderType::OneDrive => Some("https://graph.microsoft.com/v1.0/"),
            ProviderType::GoogleDrive => Some("https://www.googleapis.com/drive/v3/"),
            ProviderType::KDrive => Some("https://connect.drive.infomaniak.com/"),
            ProviderType::Yandex => Some("https://webdav.yandex.ru/"),
            _ => None,
        }
    }
}

/// Connection settings for one provider instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// Stable instance identifier
    pub id: String,
    /// Display name for this connection
    pub name: String,
    /// Backend kind
    pub provider_type: ProviderType,
    /// Base address; required for self-hosted backends
    #[serde(default)]
    pub base_url: Option<String>,
    /// Login for basic-auth backends
    #[serde(default)]
    pub username: Option<String>,
    /// Backend-specific settings (client_id, client_secret, root path...)
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn new(provider_type: ProviderType, name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            provider_type,
            base_url: None,
            username: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = Some(base_url.to_string());
        self
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    pub fn with_extra(mut self, key: &str, value: &str) -> Self {
        self.extra.insert(key.to_string(), value.to_string());
        self
    }

    /// Base address from config, or the backend's fixed one
    pub fn resolved_base_url(&self) -> Result<String, ProviderError> {
        self.base_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| self.provider_type.default_base_url().map(str::to_string))
            .ok_or_else(|| {
                ProviderError::InvalidConfig(format!("{} requires a server address", self.provider_type))
            })
    }
}

/// Persisted form of a connected provider, written to the registry store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub config: ProviderConfig,
    #[serde(default)]
    pub credential: Option<CredentialRecord>,
}

/// Remote file or folder entry
///
/// Unified representation of a file or directory across all providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteEntry {
    /// Backend identifier (portal numeric id, Dropbox `id:`, Graph item id, path for WebDAV)
    pub id: String,
    /// File or directory name
    pub name: String,
    /// Full path from root, as the backend addresses it
    pub path: String,
    /// Identifier of the containing folder
    pub parent_id: Option<String>,
    /// Whether this is a directory
    pub is_dir: bool,
    /// File size in bytes (0 for directories)
    pub size: u64,
    /// Last modification time (ISO 8601 string)
    pub modified: Option<String>,
    /// MIME type (if known)
    pub mime_type: Option<String>,
    /// Provider-specific metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RemoteEntry {
    /// Create a new directory entry
    pub fn directory(id: &str, name: &str, path: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            parent_id: None,
            is_dir: true,
            size: 0,
            modified: None,
            mime_type: None,
            metadata: HashMap::new(),
        }
    }

    /// Create a new file entry
    pub fn file(id: &str, name: &str, path: &str, size: u64) -> Self {
        Self {
            is_dir: false,
            size,
            mime_type: mime_guess::from_path(name).first().map(|m| m.essence_str().to_string()),
            ..Self::directory(id, name, path)
        }
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }
}

/// Which entries a listing should return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryFilter {
    #[default]
    All,
    FoldersOnly,
    FilesOnly,
}

impl EntryFilter {
    pub fn accepts(&self, entry: &RemoteEntry) -> bool {
        match self {
            EntryFilter::All => true,
            EntryFilter::FoldersOnly => entry.is_dir,
            EntryFilter::FilesOnly => !entry.is_dir,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Title,
    Modified,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: SortField,
    pub descending: bool,
}

/// Filter, paging and sort settings for a `fetch`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchParams {
    pub filter: EntryFilter,
    /// Index of the first entry to return
    pub start_index: usize,
    /// Page size; `None` lists everything
    pub count: Option<usize>,
    pub sort: Option<SortSpec>,
    /// Case-insensitive title substring
    pub search: Option<String>,
}

impl FetchParams {
    pub fn folders_only(count: usize) -> Self {
        Self {
            filter: EntryFilter::FoldersOnly,
            count: Some(count),
            ..Self::default()
        }
    }

    pub fn starting_at(mut self, start_index: usize) -> Self {
        self.start_index = start_index;
        self
    }

    pub fn searching(mut self, text: &str) -> Self {
        self.search = Some(text.trim().to_string());
        self
    }

    pub fn sorted(mut self, field: SortField, descending: bool) -> Self {
        self.sort = Some(SortSpec { field, descending });
        self
    }

    /// Client-side filter, search, sort and paging for backends without server support
    pub fn apply(&self, mut entries: Vec<RemoteEntry>) -> Vec<RemoteEntry> {
        entries.retain(|e| self.filter.accepts(e));
        if let Some(text) = self.search.as_deref().filter(|t| !t.is_empty()) {
            let needle = text.to_lowercase();
            entries.retain(|e| e.name.to_lowercase().contains(&needle));
        }
        if let Some(sort) = self.sort {
            entries.sort_by(|a, b| {
                let ordering = match sort.field {
                    SortField::Title => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
                    SortField::Modified => a.modified.cmp(&b.modified),
                    SortField::Size => a.size.cmp(&b.size),
                };
                if sort.descending { ordering.reverse() } else { ordering }
            });
        }
        let page = entries.into_iter().skip(self.start_index);
        match self.count {
            Some(count) => page.take(count).collect(),
            None => page.collect(),
        }
    }
}

impl FetchParams {
    /// Page of a complete listing, with the total counted after filter and search
    pub fn paginate(&self, entries: Vec<RemoteEntry>) -> FetchPage {
        let matching = FetchParams {
            start_index: 0,
            count: None,
            ..self.clone()
        }
        .apply(entries);
        let total = matching.len();
        let page = matching.into_iter().skip(self.start_index);
        let entries = match self.count {
            Some(count) => page.take(count).collect(),
            None => page.collect(),
        };
        FetchPage {
            current: None,
            entries,
            total: Some(total),
        }
    }
}

/// One page of a folder listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchPage {
    /// The listed folder as the server describes it, when it does
    pub current: Option<RemoteEntry>,
    pub entries: Vec<RemoteEntry>,
    /// Total number of children matching the filter, when known
    pub total: Option<usize>,
}

/// Known listing totals per folder, dropped by `reset`
#[derive(Debug, Default)]
pub struct PageTracker {
    totals: Mutex<HashMap<String, usize>>,
}

impl PageTracker {
    /// Reject a page request past the last known end of the listing
    pub fn check(&self, folder_id: &str, start_index: usize) -> Result<(), ProviderError> {
        if start_index == 0 {
            return Ok(());
        }
        let totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        match totals.get(folder_id) {
            Some(total) if *total < start_index => {
                Err(ProviderError::Validation("Invalid server data.".to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn record(&self, folder_id: &str, total: usize) {
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.insert(folder_id.to_string(), total);
    }

    pub fn clear(&self) {
        self.totals.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Signed-in account details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub display_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Copy,
    Move,
}

/// Progress as a fraction in [0, 1]
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Progress fraction for `done` of `total` bytes, clamped to [0, 1]
pub fn progress_fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64).clamp(0.0, 1.0)
}

/// Terminal result of an upload or download
///
/// Auth failures are their own variant so callers can never mistake them for
/// an ignorable failure, however many bytes were already moved.
#[derive(Debug)]
pub enum TransferOutcome<T> {
    Success(T),
    AuthFailure(ProviderError),
    Failed(ProviderError),
}

impl<T> TransferOutcome<T> {
    /// Sort a result into the three outcomes
    pub fn from_result(result: Result<T, ProviderError>) -> Self {
        match result {
            Ok(value) => TransferOutcome::Success(value),
            Err(err) if err.kind() == ErrorKind::Auth => TransferOutcome::AuthFailure(err),
            Err(err) => TransferOutcome::Failed(err),
        }
    }

    pub fn into_result(self) -> Result<T, ProviderError> {
        match self {
            TransferOutcome::Success(value) => Ok(value),
            TransferOutcome::AuthFailure(err) | TransferOutcome::Failed(err) => Err(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Success(_))
    }

    /// Post-process a successful transfer; an error from `f` is sorted like any other
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Result<U, ProviderError>) -> TransferOutcome<U> {
        match self {
            TransferOutcome::Success(value) => TransferOutcome::from_result(f(value)),
            TransferOutcome::AuthFailure(err) => TransferOutcome::AuthFailure(err),
            TransferOutcome::Failed(err) => TransferOutcome::Failed(err),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TransferOutcome<U> {
        match self {
            TransferOutcome::Success(value) => TransferOutcome::Success(f(value)),
            TransferOutcome::AuthFailure(err) => TransferOutcome::AuthFailure(err),
            TransferOutcome::Failed(err) => TransferOutcome::Failed(err),
        }
    }
}

/// Error category, independent of which backend produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Auth,
    Validation,
    Api,
    Encoding,
    Cancelled,
    NotSupported,
    InvalidConfig,
    NotFound,
    Io,
}

/// Provider error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Transport(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid server response: {0}")]
    Validation(String),

    #[error("{message}")]
    Api {
        status: Option<u16>,
        message: String,
        raw: Option<String>,
    },

    #[error("Invalid request path: {0}")]
    Encoding(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Transport(_) => ErrorKind::Transport,
            ProviderError::Auth(_) => ErrorKind::Auth,
            ProviderError::Validation(_) => ErrorKind::Validation,
            ProviderError::Api { .. } => ErrorKind::Api,
            ProviderError::Encoding(_) => ErrorKind::Encoding,
            ProviderError::Cancelled => ErrorKind::Cancelled,
            ProviderError::NotSupported(_) => ErrorKind::NotSupported,
            ProviderError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            ProviderError::NotFound(_) => ErrorKind::NotFound,
            ProviderError::Io(_) => ErrorKind::Io,
        }
    }

    /// Human-readable message for the presentation layer
    pub fn message(&self) -> String {
        self.to_string()
    }

    pub fn raw_response(&self) -> Option<&str> {
        match self {
            ProviderError::Api { raw, .. } => raw.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProviderError::Transport(_) => true,
            ProviderError::Api { status: Some(status), .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn normalized(&self) -> NormalizedError {
        NormalizedError {
            kind: self.kind(),
            message: self.message(),
            raw: self.raw_response().map(str::to_string),
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ProviderError::NotFound(err.to_string()),
            _ => ProviderError::Io(err.to_string()),
        }
    }
}

/// Kind, message and raw body of a failed call, produced once per failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedError {
    pub kind: ErrorKind,
    pub message: String,
    pub raw: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<RemoteEntry> {
        vec![
            RemoteEntry::directory("1", "Reports", "/Reports"),
            RemoteEntry::file("2", "budget.xlsx", "/budget.xlsx", 300),
            RemoteEntry::directory("3", "archive", "/archive"),
            RemoteEntry::file("4", "Notes.docx", "/Notes.docx", 10),
        ]
    }

    #[test]
    fn test_provider_type_flags() {
        assert!(ProviderType::Nextcloud.is_webdav());
        assert!(!ProviderType::Portal.is_webdav());
        assert!(ProviderType::OneDrive.requires_oauth2());
        assert!(!ProviderType::Yandex.requires_oauth2());
    }

    #[test]
    fn test_resolved_base_url_requires_address_for_self_hosted() {
        let config = ProviderConfig::new(ProviderType::Portal, "Office");
        assert!(matches!(config.resolved_base_url(), Err(ProviderError::InvalidConfig(_))));

        let config = ProviderConfig::new(ProviderType::Dropbox, "Dropbox");
        assert_eq!(config.resolved_base_url().unwrap(), "https://api.dropboxapi.com/2/");
    }

    #[test]
    fn test_fetch_params_folders_only() {
        let page = FetchParams::folders_only(1000).apply(entries());
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|e| e.is_dir));
    }

    #[test]
    fn test_fetch_params_search_sort_and_page() {
        let params = FetchParams::default()
            .sorted(SortField::Title, false)
            .searching("o")
            .starting_at(1);
        let names: Vec<_> = params.apply(entries()).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["Reports"]);
    }

    #[test]
    fn test_paginate_counts_matching_entries() {
        let page = FetchParams::folders_only(1).paginate(entries());
        assert_eq!(page.total, Some(2));
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].name, "Reports");
    }

    #[test]
    fn test_page_tracker_rejects_start_past_total() {
        let tracker = PageTracker::default();
        assert!(tracker.check("42", 100).is_ok());
        tracker.record("42", 10);
        assert!(tracker.check("42", 10).is_ok());
        assert_eq!(
            tracker.check("42", 11),
            Err(ProviderError::Validation("Invalid server data.".to_string()))
        );
        tracker.clear();
        assert!(tracker.check("42", 11).is_ok());
    }

    #[test]
    fn test_progress_fraction_clamped() {
        assert_eq!(progress_fraction(0, 0), 0.0);
        assert_eq!(progress_fraction(50, 100), 0.5);
        assert_eq!(progress_fraction(150, 100), 1.0);
    }

    #[test]
    fn test_transfer_outcome_keeps_auth_failures_apart() {
        let outcome: TransferOutcome<()> =
            TransferOutcome::from_result(Err(ProviderError::Auth("expired".into())));
        assert!(matches!(outcome, TransferOutcome::AuthFailure(_)));

        let outcome: TransferOutcome<()> =
            TransferOutcome::from_result(Err(ProviderError::Transport("reset".into())));
        assert!(matches!(outcome, TransferOutcome::Failed(_)));
    }

    #[test]
    fn test_error_kind_and_message() {
        let err = ProviderError::Api {
            status: Some(403),
            message: "Access denied".into(),
            raw: Some("{}".into()),
        };
        assert_eq!(err.kind(), ErrorKind::Api);
        assert_eq!(err.message(), "Access denied");
        assert_eq!(err.raw_response(), Some("{}"));
        assert!(!err.is_recoverable());
        assert!(ProviderError::Transport("timeout".into()).is_recoverable());
    }

    #[test]
    fn test_file_entry_guesses_mime() {
        let entry = RemoteEntry::file("1", "report.pdf", "/report.pdf", 1);
        assert_eq!(entry.mime_type.as_deref(), Some("application/pdf"));
    }
}
