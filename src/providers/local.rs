//! On-device storage provider
//!
//! Serves a folder of the local filesystem through the same interface as the
//! network backends. Entry ids and paths are `/`-separated and relative to the
//! provider root; `..` never resolves outside it.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::session::{SessionManager, TaskKind};
use super::{
    FetchPage, FetchParams, ProgressCallback, ProviderConfig, ProviderError, ProviderRecord, ProviderType,
    RemoteEntry, StorageProvider, TransferMode, TransferOutcome,
};
use crate::config::PipelineConfig;

const COPY_BUFFER: usize = 64 * 1024;

/// Reject `..`, NUL bytes and absolute components before touching the disk
fn validate_path(path: &str) -> Result<(), ProviderError> {
    if path.len() > 4096 {
        return Err(ProviderError::Encoding("Path exceeds 4096 character limit".to_string()));
    }
    if path.contains('\0') {
        return Err(ProviderError::Encoding("Path contains null bytes".to_string()));
    }
    for component in Path::new(path.trim_start_matches('/')).components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(ProviderError::Encoding(format!("Path '{}' leaves the provider root", path)));
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), ProviderError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(ProviderError::Encoding(format!("Invalid name '{}'", name)));
    }
    Ok(())
}

fn join_path(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

fn modified_time(metadata: &std::fs::Metadata) -> Option<String> {
    let time: SystemTime = metadata.modified().ok()?;
    Some(chrono::DateTime::<chrono::Utc>::from(time).to_rfc3339())
}

fn already_exists(name: &str) -> ProviderError {
    ProviderError::Api {
        status: None,
        message: format!("'{}' already exists", name),
        raw: None,
    }
}

async fn remove_any(path: &Path) -> Result<(), ProviderError> {
    if tokio::fs::metadata(path).await?.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

/// Copy a file or a whole tree
async fn copy_tree(from: &Path, to: &Path) -> Result<(), ProviderError> {
    if !tokio::fs::metadata(from).await?.is_dir() {
        tokio::fs::copy(from, to).await?;
        return Ok(());
    }
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((source, target)) = pending.pop() {
        tokio::fs::create_dir_all(&target).await?;
        let mut dir = tokio::fs::read_dir(&source).await?;
        while let Some(child) = dir.next_entry().await? {
            let child_target = target.join(child.file_name());
            if child.file_type().await?.is_dir() {
                pending.push((child.path(), child_target));
            } else {
                tokio::fs::copy(child.path(), child_target).await?;
            }
        }
    }
    Ok(())
}

/// Local filesystem provider
pub struct LocalProvider {
    config: ProviderConfig,
    root: PathBuf,
    session: SessionManager,
}

impl LocalProvider {
    pub fn new(config: ProviderConfig, root: PathBuf) -> Self {
        let session = SessionManager::new(&config.name, PipelineConfig::default().transfer_timeout());
        Self { config, root, session }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem location of an entry path
    fn resolve(&self, path: &str) -> Result<PathBuf, ProviderError> {
        validate_path(path)?;
        let relative = path.trim_matches('/');
        Ok(if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        })
    }

    fn entry_for(&self, path: &str, metadata: &std::fs::Metadata) -> RemoteEntry {
        let name = path.rsplit('/').next().unwrap_or_default();
        let mut entry = if metadata.is_dir() {
            RemoteEntry::directory(path, name, path)
        } else {
            RemoteEntry::file(path, name, path, metadata.len())
        };
        entry.modified = modified_time(metadata);
        entry
    }

    async fn list(&self, folder: &RemoteEntry) -> Result<Vec<RemoteEntry>, ProviderError> {
        let dir_path = self.resolve(&folder.path)?;
        let mut dir = tokio::fs::read_dir(&dir_path).await?;
        let mut entries = Vec::new();
        while let Some(child) = dir.next_entry().await? {
            let name = child.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let metadata = match child.metadata().await {
                Ok(metadata) => metadata,
                // Broken links and entries removed mid-listing
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    continue;
                }
            };
            let path = join_path(&folder.path, &name);
            entries.push(self.entry_for(&path, &metadata).with_parent(&folder.id));
        }
        Ok(entries)
    }

    /// Make room for `target`, or refuse when overwriting is not allowed
    async fn prepare_target(&self, target: &Path, name: &str, overwrite: bool) -> Result<(), ProviderError> {
        if tokio::fs::try_exists(target).await? {
            if !overwrite {
                return Err(already_exists(name));
            }
            remove_any(target).await?;
        }
        Ok(())
    }

    async fn copy_with_progress(
        &self,
        source: &Path,
        destination: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64, ProviderError> {
        let mut reader = tokio::fs::File::open(source).await?;
        let total = reader.metadata().await?.len();
        let mut writer = tokio::fs::File::create(destination).await?;
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut written = 0u64;
        loop {
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            writer.write_all(&buf[..read]).await?;
            written += read as u64;
            if let Some(progress) = progress {
                progress(super::progress_fraction(written, total));
            }
        }
        writer.flush().await?;
        if let Some(progress) = progress {
            progress(1.0);
        }
        Ok(written)
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Local
    }

    fn display_name(&self) -> String {
        self.config.name.clone()
    }

    fn base_address(&self) -> String {
        self.root.display().to_string()
    }

    fn root_folder(&self) -> RemoteEntry {
        RemoteEntry::directory("/", &self.config.name, "/")
    }

    async fn fetch(&self, folder: &RemoteEntry, params: &FetchParams) -> Result<FetchPage, ProviderError> {
        let entries = self.session.run(TaskKind::Request, self.list(folder)).await?;
        Ok(params.paginate(entries))
    }

    fn reset(&self) {}

    async fn is_reachable(&self) -> Result<(), ProviderError> {
        let metadata = tokio::fs::metadata(&self.root).await?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(ProviderError::InvalidConfig(format!("{} is not a folder", self.root.display())))
        }
    }

    fn cancel_all(&self) -> usize {
        self.session.cancel_all()
    }

    fn in_flight(&self) -> usize {
        self.session.in_flight()
    }

    fn copy(&self) -> Arc<dyn StorageProvider> {
        Arc::new(Self {
            config: self.config.clone(),
            root: self.root.clone(),
            session: self.session.fork(),
        })
    }

    fn record(&self) -> ProviderRecord {
        ProviderRecord {
            config: self.config.clone(),
            credential: None,
        }
    }

    async fn create_folder(&self, parent: &RemoteEntry, name: &str) -> Result<RemoteEntry, ProviderError> {
        validate_name(name)?;
        let path = join_path(&parent.path, name);
        let target = self.resolve(&path)?;
        if tokio::fs::try_exists(&target).await? {
            return Err(already_exists(name));
        }
        tokio::fs::create_dir(&target).await?;
        let metadata = tokio::fs::metadata(&target).await?;

        info!("Created folder: {}", target.display());
        Ok(self.entry_for(&path, &metadata).with_parent(&parent.id))
    }

    async fn rename(&self, entry: &RemoteEntry, new_name: &str) -> Result<RemoteEntry, ProviderError> {
        validate_name(new_name)?;
        let source = self.resolve(&entry.path)?;
        let parent = entry.path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("");
        let path = join_path(parent, new_name);
        let target = self.resolve(&path)?;
        if tokio::fs::try_exists(&target).await? {
            return Err(already_exists(new_name));
        }
        tokio::fs::rename(&source, &target).await?;
        let metadata = tokio::fs::metadata(&target).await?;

        info!("Renamed {} to {}", entry.path, path);
        let mut renamed = self.entry_for(&path, &metadata);
        renamed.parent_id = entry.parent_id.clone();
        Ok(renamed)
    }

    async fn delete(&self, entries: &[RemoteEntry]) -> Result<(), ProviderError> {
        for entry in entries {
            remove_any(&self.resolve(&entry.path)?).await?;
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
        let folder = self.resolve(&destination.path)?;
        for item in items {
            let source = self.resolve(&item.path)?;
            let target = folder.join(&item.name);
            if target == source {
                continue;
            }
            if folder.starts_with(&source) {
                return Err(ProviderError::Validation(format!(
                    "'{}' cannot be placed inside itself",
                    item.name
                )));
            }
            self.prepare_target(&target, &item.name, overwrite).await?;
            match mode {
                TransferMode::Copy => copy_tree(&source, &target).await?,
                TransferMode::Move => tokio::fs::rename(&source, &target).await?,
            }
        }
        info!("Local {:?} of {} item(s) into {}", mode, items.len(), destination.path);
        Ok(())
    }

    async fn download(
        &self,
        entry: &RemoteEntry,
        destination: &Path,
        progress: Option<ProgressCallback>,
    ) -> TransferOutcome<u64> {
        let source = match self.resolve(&entry.path) {
            Ok(source) => source,
            Err(err) => return TransferOutcome::Failed(err),
        };
        let lease = self.session.open_transfer(TaskKind::Download);
        let result = lease
            .run(self.copy_with_progress(&source, destination, progress.as_ref()))
            .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(destination).await;
        }
        TransferOutcome::from_result(result)
    }

    async fn upload(
        &self,
        folder: &RemoteEntry,
        name: &str,
        data: Vec<u8>,
        overwrite: bool,
        progress: Option<ProgressCallback>,
    ) -> TransferOutcome<RemoteEntry> {
        let lease = self.session.open_transfer(TaskKind::Upload);
        let result = lease
            .run(async {
                validate_name(name)?;
                let path = join_path(&folder.path, name);
                let target = self.resolve(&path)?;
                self.prepare_target(&target, name, overwrite).await?;

                let total = data.len() as u64;
                let mut file = tokio::fs::File::create(&target).await?;
                let mut written = 0u64;
                for chunk in data.chunks(COPY_BUFFER) {
                    file.write_all(chunk).await?;
                    written += chunk.len() as u64;
                    if let Some(progress) = &progress {
                        progress(super::progress_fraction(written, total));
                    }
                }
                file.flush().await?;
                if let Some(progress) = &progress {
                    progress(1.0);
                }
                let metadata = tokio::fs::metadata(&target).await?;
                Ok(self.entry_for(&path, &metadata).with_parent(&folder.id))
            })
            .await;
        TransferOutcome::from_result(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn provider(dir: &tempfile::TempDir) -> LocalProvider {
        LocalProvider::new(ProviderConfig::new(ProviderType::Local, "On Device"), dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn test_fetch_lists_and_pages() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Reports")).unwrap();
        std::fs::create_dir(dir.path().join("Archive")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();
        let local = provider(&dir);

        let all = local.fetch(&local.root_folder(), &FetchParams::default()).await.unwrap();
        assert_eq!(all.total, Some(3));

        let folders = local
            .fetch(
                &local.root_folder(),
                &FetchParams::folders_only(1).sorted(crate::providers::SortField::Title, false),
            )
            .await
            .unwrap();
        assert_eq!(folders.total, Some(2));
        assert_eq!(folders.entries.len(), 1);
        assert_eq!(folders.entries[0].path, "/Archive");
        assert_eq!(folders.entries[0].parent_id.as_deref(), Some("/"));
        assert_eq!(local.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_paths_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let local = provider(&dir);
        let outside = RemoteEntry::directory("/../etc", "etc", "/../etc");
        let err = local.fetch(&outside, &FetchParams::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Encoding(_)));
        assert!(local.create_folder(&local.root_folder(), "..").await.is_err());
    }

    #[tokio::test]
    async fn test_create_rename_delete() {
        let dir = tempfile::tempdir().unwrap();
        let local = provider(&dir);
        let folder = local.create_folder(&local.root_folder(), "Drafts").await.unwrap();
        assert!(dir.path().join("Drafts").is_dir());
        assert!(local.create_folder(&local.root_folder(), "Drafts").await.is_err());

        let renamed = local.rename(&folder, "Final").await.unwrap();
        assert_eq!(renamed.path, "/Final");
        assert!(dir.path().join("Final").is_dir());

        local.delete(&[renamed]).await.unwrap();
        assert!(!dir.path().join("Final").exists());
    }

    #[tokio::test]
    async fn test_transfer_respects_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/inner")).unwrap();
        std::fs::write(dir.path().join("src/inner/a.txt"), b"new").unwrap();
        std::fs::create_dir(dir.path().join("dest")).unwrap();
        std::fs::write(dir.path().join("dest/a.txt"), b"old").unwrap();
        let local = provider(&dir);

        let file = RemoteEntry::file("/src/inner/a.txt", "a.txt", "/src/inner/a.txt", 3);
        let dest = RemoteEntry::directory("/dest", "dest", "/dest");
        assert_eq!(local.check_transfer(&[file.clone()], &dest).await.unwrap(), vec!["a.txt"]);
        assert!(local.transfer(&[file.clone()], &dest, TransferMode::Copy, false).await.is_err());

        local.transfer(&[file], &dest, TransferMode::Copy, true).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("dest/a.txt")).unwrap(), b"new");

        let tree = RemoteEntry::directory("/src", "src", "/src");
        local.transfer(&[tree], &dest, TransferMode::Move, false).await.unwrap();
        assert!(dir.path().join("dest/src/inner/a.txt").is_file());
        assert!(!dir.path().join("src").exists());
    }

    #[tokio::test]
    async fn test_folder_cannot_move_into_itself() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let local = provider(&dir);
        let folder = RemoteEntry::directory("/a", "a", "/a");
        let child = RemoteEntry::directory("/a/b", "b", "/a/b");
        let err = local.transfer(&[folder], &child, TransferMode::Move, true).await.unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[tokio::test]
    async fn test_upload_and_download_report_progress() {
        let dir = tempfile::tempdir().unwrap();
        let local = provider(&dir);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressCallback = Arc::new(move |p: f64| sink.lock().unwrap().push(p));

        let data = vec![7u8; COPY_BUFFER * 2 + 10];
        let entry = local
            .upload(&local.root_folder(), "blob.bin", data.clone(), false, Some(progress))
            .await
            .into_result()
            .unwrap();
        assert_eq!(entry.size, data.len() as u64);
        assert_eq!(seen.lock().unwrap().last().copied(), Some(1.0));

        let again = local.upload(&local.root_folder(), "blob.bin", vec![1], false, None).await;
        assert!(!again.is_success());

        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("copy.bin");
        let written = local.download(&entry, &target, None).await.into_result().unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_copy_has_its_own_session() {
        let dir = tempfile::tempdir().unwrap();
        let local = provider(&dir);
        let copy = local.copy();
        assert_eq!(copy.id(), local.id());
        assert_eq!(copy.cancel_all(), 0);
        assert!(copy.is_reachable().await.is_ok());
        assert!(copy.record().credential.is_none());
    }
}
