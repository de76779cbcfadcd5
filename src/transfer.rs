//! Transfer destination picker
//!
//! Builds a virtual tree over every connected provider so the user can pick
//! where copied or moved items should go:
//!
//! ```text
//! (virtual root)
//!  ├── On Device            local provider root
//!  ├── Portal               pseudo-root, expands into the category folders
//!  │    ├── My Documents
//!  │    └── ...
//!  └── Dropbox, OneDrive... one root per connected cloud
//! ```
//!
//! Nodes expand lazily with one folders-only `fetch` and keep their children
//! until the picker is dropped. The picker browses through `copy()` instances
//! of the providers, so dismissing it cancels only its own requests.

use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::providers::{
    FetchParams, ProgressCallback, ProviderError, ProviderType, RemoteEntry, StorageProvider, TransferMode,
};

/// What a node stands for in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Parent of every provider root; never a destination
    VirtualRoot,
    /// Root of the on-device provider
    Device,
    /// Portal root; lists categories and is never a destination itself
    PortalRoot,
    /// Portal category folder
    Category,
    /// Root of a third-party cloud
    CloudRoot,
    Folder,
}

/// One folder of the picker tree.
///
/// Holds only a weak reference to its provider; the picker owns the providers.
pub struct FolderNode {
    kind: NodeKind,
    entry: RemoteEntry,
    provider: Option<Weak<dyn StorageProvider>>,
    provider_id: Option<String>,
    /// Ids from the provider root down to this node's parent
    ancestors: Vec<String>,
    /// Titles from the provider root down to this node
    titles: Vec<String>,
    children: OnceCell<Vec<Arc<FolderNode>>>,
}

impl FolderNode {
    fn virtual_root(children: Vec<Arc<FolderNode>>) -> Arc<Self> {
        Arc::new(Self {
            kind: NodeKind::VirtualRoot,
            entry: RemoteEntry::directory("", "", "/"),
            provider: None,
            provider_id: None,
            ancestors: Vec::new(),
            titles: Vec::new(),
            children: OnceCell::new_with(Some(children)),
        })
    }

    fn provider_root(provider: &Arc<dyn StorageProvider>) -> Arc<Self> {
        let kind = match provider.provider_type() {
            ProviderType::Local => NodeKind::Device,
            _ if !provider.category_roots().is_empty() => NodeKind::PortalRoot,
            _ => NodeKind::CloudRoot,
        };
        let mut entry = provider.root_folder();
        entry.name = provider.display_name();
        Arc::new(Self {
            kind,
            titles: vec![entry.name.clone()],
            entry,
            provider: Some(Arc::downgrade(provider)),
            provider_id: Some(provider.id().to_string()),
            ancestors: Vec::new(),
            children: OnceCell::new(),
        })
    }

    fn child(self: &Arc<Self>, kind: NodeKind, entry: RemoteEntry) -> Arc<Self> {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.entry.id.clone());
        let mut titles = self.titles.clone();
        titles.push(entry.name.clone());
        Arc::new(Self {
            kind,
            entry,
            provider: self.provider.clone(),
            provider_id: self.provider_id.clone(),
            ancestors,
            titles,
            children: OnceCell::new(),
        })
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn title(&self) -> &str {
        &self.entry.name
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.ancestors.last().map(String::as_str)
    }

    pub fn entry(&self) -> &RemoteEntry {
        &self.entry
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.provider_id.as_deref()
    }

    /// Titles from the provider root down to this node, for display
    pub fn path(&self) -> &[String] {
        &self.titles
    }

    /// The provider, while the picker still holds it
    pub fn provider(&self) -> Option<Arc<dyn StorageProvider>> {
        self.provider.as_ref().and_then(Weak::upgrade)
    }

    /// Cached children, if the node was expanded
    pub fn children(&self) -> Option<&[Arc<FolderNode>]> {
        self.children.get().map(Vec::as_slice)
    }
}

impl std::fmt::Debug for FolderNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderNode")
            .field("kind", &self.kind)
            .field("id", &self.entry.id)
            .field("title", &self.entry.name)
            .field("path", &self.titles)
            .finish()
    }
}

/// Items to copy or move and where they come from
#[derive(Clone)]
pub struct TransferRequest {
    pub source: Arc<dyn StorageProvider>,
    pub items: Vec<RemoteEntry>,
    pub mode: TransferMode,
    /// Folder the items currently live in
    pub source_folder: Option<RemoteEntry>,
}

impl TransferRequest {
    pub fn new(source: Arc<dyn StorageProvider>, items: Vec<RemoteEntry>, mode: TransferMode) -> Self {
        Self {
            source,
            items,
            mode,
            source_folder: None,
        }
    }

    pub fn from_folder(mut self, folder: &RemoteEntry) -> Self {
        self.source_folder = Some(folder.clone());
        self
    }

    fn source_folder_id(&self) -> Option<&str> {
        self.source_folder
            .as_ref()
            .map(|f| f.id.as_str())
            .or_else(|| self.items.first().and_then(|i| i.parent_id.as_deref()))
    }
}

/// Destination picker over a set of connected providers
pub struct TransferPicker {
    config: PipelineConfig,
    request: TransferRequest,
    source_ids: HashSet<String>,
    /// Copy of the request's source that relays read from
    source: Arc<dyn StorageProvider>,
    root: Arc<FolderNode>,
    copies: Mutex<Vec<Arc<dyn StorageProvider>>>,
}

impl TransferPicker {
    /// Picker over `providers`, in display order. Each one is browsed through a copy.
    pub fn new(config: PipelineConfig, providers: &[Arc<dyn StorageProvider>], request: TransferRequest) -> Self {
        let mut copies: Vec<Arc<dyn StorageProvider>> = providers.iter().map(|p| p.copy()).collect();

        // Device first, then the portal, then clouds
        let mut roots: Vec<Arc<FolderNode>> = copies.iter().map(FolderNode::provider_root).collect();
        roots.sort_by_key(|node| match node.kind {
            NodeKind::Device => 0,
            NodeKind::PortalRoot => 1,
            _ => 2,
        });

        // Relays go through a tracked copy too, so dismiss() reaches them
        let source = match copies.iter().find(|p| p.id() == request.source.id()) {
            Some(copy) => copy.clone(),
            None => {
                let copy = request.source.copy();
                copies.push(copy.clone());
                copy
            }
        };

        let source_ids = request.items.iter().map(|i| i.id.clone()).collect();
        info!("Opened picker over {} provider(s) for {} item(s)", providers.len(), request.items.len());
        Self {
            config,
            request,
            source_ids,
            source,
            root: FolderNode::virtual_root(roots),
            copies: Mutex::new(copies),
        }
    }

    pub fn root(&self) -> &Arc<FolderNode> {
        &self.root
    }

    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    fn is_source_provider(&self, node: &FolderNode) -> bool {
        node.provider_id() == Some(self.request.source.id())
    }

    /// False when the node or one of its ancestors is an item being transferred.
    /// Pure id check, no network.
    pub fn is_selectable(&self, node: &FolderNode) -> bool {
        if node.kind == NodeKind::VirtualRoot || !self.is_source_provider(node) {
            return true;
        }
        !std::iter::once(&node.entry.id)
            .chain(node.ancestors.iter())
            .any(|id| self.source_ids.contains(id))
    }

    /// Whether the node can receive the items
    pub fn can_commit(&self, node: &FolderNode) -> bool {
        if matches!(node.kind, NodeKind::VirtualRoot | NodeKind::PortalRoot) || !self.is_selectable(node) {
            return false;
        }
        let current_folder = self.is_source_provider(node) && self.request.source_folder_id() == Some(node.id());
        !current_folder
    }

    /// Children of `node`, fetched on first call and cached afterwards
    pub async fn expand(&self, node: &Arc<FolderNode>) -> Result<Vec<Arc<FolderNode>>, ProviderError> {
        if !self.is_selectable(node) {
            return Err(ProviderError::Validation(format!(
                "'{}' is being transferred and cannot be opened",
                node.title()
            )));
        }
        let children = node
            .children
            .get_or_try_init(|| async {
                let provider = node.provider().ok_or(ProviderError::Cancelled)?;
                if node.kind == NodeKind::PortalRoot {
                    Ok(self.list_categories(node, provider).await)
                } else {
                    self.list_folders(node, provider).await
                }
            })
            .await?;
        Ok(children.clone())
    }

    async fn list_folders(
        &self,
        node: &Arc<FolderNode>,
        provider: Arc<dyn StorageProvider>,
    ) -> Result<Vec<Arc<FolderNode>>, ProviderError> {
        let params = FetchParams::folders_only(self.config.folder_page_size);
        let page = provider.fetch(&node.entry, &params).await?;
        debug!("Expanded {:?} into {} folder(s)", node.titles, page.entries.len());
        Ok(page
            .entries
            .into_iter()
            .filter(|e| e.is_dir)
            .map(|entry| node.child(NodeKind::Folder, entry))
            .collect())
    }

    /// Probe every category with a small folders-only fetch, a bounded number
    /// at a time. Failed categories are left out; the rest keep their order.
    async fn list_categories(&self, node: &Arc<FolderNode>, provider: Arc<dyn StorageProvider>) -> Vec<Arc<FolderNode>> {
        let gate = Semaphore::new(self.config.category_fetch_concurrency.max(1));
        let params = FetchParams::folders_only(self.config.category_probe_page_size);
        let (gate, params) = (&gate, &params);
        let probes = provider.category_roots().into_iter().map(move |category| {
            let provider = provider.clone();
            async move {
                let _permit = gate.acquire().await.ok()?;
                match provider.fetch(&category, params).await {
                    // The server's description of the folder wins over the static one
                    Ok(page) => Some(page.current.unwrap_or(category)),
                    Err(e) => {
                        warn!("Category {} unavailable: {}", category.id, e);
                        None
                    }
                }
            }
        });
        join_all(probes)
            .await
            .into_iter()
            .flatten()
            .map(|entry| node.child(NodeKind::Category, entry))
            .collect()
    }

    /// Names that already exist in the destination
    pub async fn conflicts(&self, node: &FolderNode) -> Result<Vec<String>, ProviderError> {
        let provider = node.provider().ok_or(ProviderError::Cancelled)?;
        provider.check_transfer(&self.request.items, &node.entry).await
    }

    /// Copy or move the items into `node`.
    ///
    /// Within one provider the backend does the work; across providers files
    /// are relayed through a temporary download.
    pub async fn commit(
        &self,
        node: &FolderNode,
        overwrite: bool,
        progress: Option<ProgressCallback>,
    ) -> Result<(), ProviderError> {
        if !self.can_commit(node) {
            return Err(ProviderError::Validation(format!(
                "'{}' cannot receive these items",
                node.title()
            )));
        }
        let destination = node.provider().ok_or(ProviderError::Cancelled)?;
        let request = &self.request;

        if self.is_source_provider(node) {
            return destination
                .transfer(&request.items, &node.entry, request.mode, overwrite)
                .await;
        }

        let total = request.items.len().max(1) as f64;
        for (index, item) in request.items.iter().enumerate() {
            let item_progress = progress.clone().map(|outer| -> ProgressCallback {
                Arc::new(move |fraction: f64| outer((index as f64 + fraction) / total))
            });
            relay(&self.source, &destination, item, &node.entry, overwrite, item_progress).await?;
            if request.mode == TransferMode::Move {
                self.source.delete(std::slice::from_ref(item)).await?;
            }
        }
        info!(
            "{:?} {} item(s) from {} to {}",
            request.mode,
            request.items.len(),
            request.source.display_name(),
            destination.display_name()
        );
        Ok(())
    }

    /// Cancel everything the picker started and release its providers.
    /// Returns the number of cancelled tasks.
    pub fn dismiss(&self) -> usize {
        let copies = std::mem::take(&mut *self.copies.lock().unwrap_or_else(|e| e.into_inner()));
        let cancelled = copies.iter().map(|p| p.cancel_all()).sum();
        debug!("Picker dismissed, {} task(s) cancelled", cancelled);
        cancelled
    }
}

/// Download one file from `source` and upload it into `folder` on `destination`
async fn relay(
    source: &Arc<dyn StorageProvider>,
    destination: &Arc<dyn StorageProvider>,
    item: &RemoteEntry,
    folder: &RemoteEntry,
    overwrite: bool,
    progress: Option<ProgressCallback>,
) -> Result<(), ProviderError> {
    if item.is_dir {
        return Err(ProviderError::NotSupported(format!(
            "Folder '{}' cannot be transferred between storages",
            item.name
        )));
    }
    let staging = std::env::temp_dir().join(format!("docbridge-{}", uuid::Uuid::new_v4()));
    let downloaded = source.download(item, &staging, None).await.into_result();
    let data = match downloaded {
        Ok(_) => tokio::fs::read(&staging).await.map_err(ProviderError::from),
        Err(e) => Err(e),
    };
    let _ = tokio::fs::remove_file(&staging).await;
    destination
        .upload(folder, &item.name, data?, overwrite, progress)
        .await
        .into_result()
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::session::{SessionManager, TaskKind};
    use crate::providers::{FetchPage, LocalProvider, ProviderConfig, ProviderRecord};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Meter {
        calls: Mutex<Vec<String>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    /// In-memory provider with a fixed folder tree
    struct TreeProvider {
        config: ProviderConfig,
        categories: Vec<RemoteEntry>,
        tree: HashMap<String, Vec<RemoteEntry>>,
        failing: HashSet<String>,
        delay: Duration,
        meter: Arc<Meter>,
        session: SessionManager,
    }

    impl TreeProvider {
        fn new(provider_type: ProviderType, name: &str) -> Self {
            Self {
                config: ProviderConfig::new(provider_type, name),
                categories: Vec::new(),
                tree: HashMap::new(),
                failing: HashSet::new(),
                delay: Duration::from_millis(5),
                meter: Arc::new(Meter::default()),
                session: SessionManager::new(name, Duration::from_secs(60)),
            }
        }

        fn folder(mut self, parent: &str, id: &str) -> Self {
            let entry = RemoteEntry::directory(id, &id.to_uppercase(), &format!("/{}", id)).with_parent(parent);
            self.tree.entry(parent.to_string()).or_default().push(entry);
            self
        }

        fn file(mut self, parent: &str, id: &str) -> Self {
            let entry = RemoteEntry::file(id, id, &format!("/{}", id), 1).with_parent(parent);
            self.tree.entry(parent.to_string()).or_default().push(entry);
            self
        }

        fn with_categories(mut self, ids: &[&str]) -> Self {
            self.categories = ids.iter().map(|id| RemoteEntry::directory(id, id, &format!("/{}", id))).collect();
            self
        }

        fn failing(mut self, id: &str) -> Self {
            self.failing.insert(id.to_string());
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> Vec<String> {
            self.meter.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StorageProvider for TreeProvider {
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
            "memory".to_string()
        }

        fn root_folder(&self) -> RemoteEntry {
            RemoteEntry::directory("root", &self.config.name, "/")
        }

        async fn fetch(&self, folder: &RemoteEntry, params: &FetchParams) -> Result<FetchPage, ProviderError> {
            self.meter.calls.lock().unwrap().push(folder.id.clone());
            self.session
                .run(TaskKind::Request, async {
                    let now = self.meter.active.fetch_add(1, Ordering::SeqCst) + 1;
                    self.meter.peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(self.delay).await;
                    self.meter.active.fetch_sub(1, Ordering::SeqCst);
                    if self.failing.contains(&folder.id) {
                        return Err(ProviderError::Transport("offline".to_string()));
                    }
                    let entries = self.tree.get(&folder.id).cloned().unwrap_or_default();
                    let mut page = params.paginate(entries);
                    let mut current = folder.clone();
                    current.name = format!("{} (server)", folder.name);
                    page.current = Some(current);
                    Ok(page)
                })
                .await
        }

        fn reset(&self) {}

        async fn is_reachable(&self) -> Result<(), ProviderError> {
            Ok(())
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
                categories: self.categories.clone(),
                tree: self.tree.clone(),
                failing: self.failing.clone(),
                delay: self.delay,
                meter: self.meter.clone(),
                session: self.session.fork(),
            })
        }

        fn record(&self) -> ProviderRecord {
            ProviderRecord {
                config: self.config.clone(),
                credential: None,
            }
        }

        fn category_roots(&self) -> Vec<RemoteEntry> {
            self.categories.clone()
        }

        async fn download(
            &self,
            entry: &RemoteEntry,
            destination: &std::path::Path,
            _progress: Option<ProgressCallback>,
        ) -> crate::providers::TransferOutcome<u64> {
            let result = self
                .session
                .run(TaskKind::Download, async {
                    self.meter.calls.lock().unwrap().push(format!("download:{}", entry.id));
                    tokio::time::sleep(self.delay).await;
                    tokio::fs::write(destination, entry.name.as_bytes()).await?;
                    Ok(entry.name.len() as u64)
                })
                .await;
            crate::providers::TransferOutcome::from_result(result)
        }
    }

    fn cloud() -> Arc<TreeProvider> {
        Arc::new(
            TreeProvider::new(ProviderType::Dropbox, "Dropbox")
                .folder("root", "docs")
                .folder("root", "photos")
                .file("root", "readme.txt")
                .folder("docs", "reports")
                .folder("reports", "q1"),
        )
    }

    fn picker_for(
        providers: &[Arc<dyn StorageProvider>],
        source: Arc<dyn StorageProvider>,
        items: Vec<RemoteEntry>,
    ) -> TransferPicker {
        TransferPicker::new(
            PipelineConfig::default(),
            providers,
            TransferRequest::new(source, items, TransferMode::Move),
        )
    }

    async fn child(picker: &TransferPicker, node: &Arc<FolderNode>, id: &str) -> Arc<FolderNode> {
        picker
            .expand(node)
            .await
            .unwrap()
            .into_iter()
            .find(|n| n.id() == id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_root_orders_device_portal_clouds() {
        let portal: Arc<dyn StorageProvider> =
            Arc::new(TreeProvider::new(ProviderType::Portal, "Portal").with_categories(&["@my"]));
        let device: Arc<dyn StorageProvider> = Arc::new(TreeProvider::new(ProviderType::Local, "On Device"));
        let drive: Arc<dyn StorageProvider> = cloud();
        let picker = picker_for(&[drive.clone(), portal, device], drive, Vec::new());

        let kinds: Vec<NodeKind> = picker.expand(picker.root()).await.unwrap().iter().map(|n| n.kind()).collect();
        assert_eq!(kinds, vec![NodeKind::Device, NodeKind::PortalRoot, NodeKind::CloudRoot]);
        assert!(!picker.can_commit(picker.root()));
    }

    #[tokio::test]
    async fn test_expand_fetches_once_and_only_folders() {
        let drive = cloud();
        let shared: Arc<dyn StorageProvider> = drive.clone();
        let picker = picker_for(&[shared.clone()], shared, Vec::new());
        let root = picker.expand(picker.root()).await.unwrap()[0].clone();

        let first = picker.expand(&root).await.unwrap();
        let second = picker.expand(&root).await.unwrap();
        let ids: Vec<&str> = first.iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec!["docs", "photos"]);
        assert_eq!(second.len(), 2);
        assert_eq!(drive.calls(), vec!["root"]);
        assert_eq!(root.children().unwrap().len(), 2);

        let docs = &first[0];
        let reports = child(&picker, docs, "reports").await;
        assert_eq!(reports.path(), ["Dropbox", "DOCS", "REPORTS"]);
        assert_eq!(reports.parent_id(), Some("docs"));
    }

    #[tokio::test]
    async fn test_items_and_descendants_are_blocked_without_network() {
        let drive = cloud();
        let shared: Arc<dyn StorageProvider> = drive.clone();
        let moving = RemoteEntry::directory("docs", "DOCS", "/docs").with_parent("root");
        let picker = picker_for(&[shared.clone()], shared, vec![moving]);

        let root = picker.expand(picker.root()).await.unwrap()[0].clone();
        let children = picker.expand(&root).await.unwrap();
        let docs = children.iter().find(|n| n.id() == "docs").unwrap();
        let photos = children.iter().find(|n| n.id() == "photos").unwrap();

        assert!(!picker.is_selectable(docs));
        assert!(picker.is_selectable(photos));
        let calls_before = drive.calls().len();
        assert!(picker.expand(docs).await.is_err());
        assert_eq!(drive.calls().len(), calls_before);

        // The current folder of the items is browsable but not a target
        assert!(picker.is_selectable(&root));
        assert!(!picker.can_commit(&root));
        assert!(picker.can_commit(photos));
    }

    #[tokio::test]
    async fn test_descendant_of_moved_folder_is_blocked() {
        let drive = cloud();
        let shared: Arc<dyn StorageProvider> = drive.clone();
        let picker = picker_for(&[shared.clone()], shared, Vec::new());
        let root = picker.expand(picker.root()).await.unwrap()[0].clone();
        let docs = child(&picker, &root, "docs").await;
        let reports = child(&picker, &docs, "reports").await;
        let q1 = child(&picker, &reports, "q1").await;

        let moving = RemoteEntry::directory("docs", "DOCS", "/docs");
        let blocked = TransferPicker::new(
            PipelineConfig::default(),
            &[],
            TransferRequest::new(drive.clone(), vec![moving], TransferMode::Move),
        );
        assert!(!blocked.is_selectable(&q1));
        assert!(!blocked.can_commit(&reports));
    }

    #[tokio::test]
    async fn test_categories_are_serialized_and_failures_omitted() {
        let portal = Arc::new(
            TreeProvider::new(ProviderType::Portal, "Portal")
                .with_categories(&["@my", "@share", "@common", "@projects"])
                .failing("@share"),
        );
        let shared: Arc<dyn StorageProvider> = portal.clone();
        let picker = picker_for(&[shared.clone()], shared, Vec::new());
        let portal_root = picker.expand(picker.root()).await.unwrap()[0].clone();
        assert_eq!(portal_root.kind(), NodeKind::PortalRoot);
        assert!(!picker.can_commit(&portal_root));

        let categories = picker.expand(&portal_root).await.unwrap();
        let ids: Vec<&str> = categories.iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec!["@my", "@common", "@projects"]);
        assert_eq!(categories[0].title(), "@my (server)");
        assert_eq!(categories[0].kind(), NodeKind::Category);
        assert_eq!(portal.calls(), vec!["@my", "@share", "@common", "@projects"]);
        assert_eq!(portal.meter.peak.load(Ordering::SeqCst), 1);
        assert!(picker.can_commit(&categories[0]));
    }

    #[tokio::test]
    async fn test_category_concurrency_is_configurable() {
        let portal = Arc::new(
            TreeProvider::new(ProviderType::Portal, "Portal")
                .with_categories(&["@my", "@share", "@common", "@projects"])
                .slow(Duration::from_millis(30)),
        );
        let shared: Arc<dyn StorageProvider> = portal.clone();
        let config = PipelineConfig {
            category_fetch_concurrency: 4,
            ..PipelineConfig::default()
        };
        let picker = TransferPicker::new(config, &[shared.clone()], TransferRequest::new(shared, Vec::new(), TransferMode::Copy));
        let portal_root = picker.expand(picker.root()).await.unwrap()[0].clone();
        assert_eq!(picker.expand(&portal_root).await.unwrap().len(), 4);
        assert!(portal.meter.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_dismiss_cancels_only_picker_requests() {
        let drive = Arc::new(cloud().copy_tree_slow(Duration::from_secs(30)));
        let shared: Arc<dyn StorageProvider> = drive.clone();
        let picker = Arc::new(picker_for(&[shared.clone()], shared.clone(), Vec::new()));
        let root = picker.expand(picker.root()).await.unwrap()[0].clone();

        let pending = {
            let picker = picker.clone();
            let root = root.clone();
            tokio::spawn(async move { picker.expand(&root).await })
        };
        for _ in 0..100 {
            if drive.meter.active.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(picker.dismiss(), 1);
        assert!(matches!(pending.await.unwrap(), Err(ProviderError::Cancelled)));
        assert_eq!(shared.in_flight(), 0);
        // Copies are gone, so nodes can no longer reach a provider
        assert!(root.provider().is_none());
        assert!(matches!(picker.expand(&root).await, Err(ProviderError::Cancelled)));
    }

    impl TreeProvider {
        fn copy_tree_slow(&self, delay: Duration) -> Self {
            Self {
                config: self.config.clone(),
                categories: self.categories.clone(),
                tree: self.tree.clone(),
                failing: self.failing.clone(),
                delay,
                meter: Arc::new(Meter::default()),
                session: SessionManager::new(&self.config.name, Duration::from_secs(60)),
            }
        }
    }

    #[tokio::test]
    async fn test_commit_relays_between_providers() {
        let from_dir = tempfile::tempdir().unwrap();
        let to_dir = tempfile::tempdir().unwrap();
        std::fs::write(from_dir.path().join("memo.txt"), b"quarterly").unwrap();
        std::fs::create_dir(to_dir.path().join("inbox")).unwrap();

        let source: Arc<dyn StorageProvider> = Arc::new(LocalProvider::new(
            ProviderConfig::new(ProviderType::Local, "Phone"),
            from_dir.path().to_path_buf(),
        ));
        let target: Arc<dyn StorageProvider> = Arc::new(LocalProvider::new(
            ProviderConfig::new(ProviderType::Local, "Card"),
            to_dir.path().to_path_buf(),
        ));
        let memo = RemoteEntry::file("/memo.txt", "memo.txt", "/memo.txt", 9).with_parent("/");
        let picker = picker_for(&[target.clone()], source, vec![memo]);

        let card = picker.expand(picker.root()).await.unwrap()[0].clone();
        let inbox = child(&picker, &card, "/inbox").await;
        assert!(picker.conflicts(&inbox).await.unwrap().is_empty());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressCallback = Arc::new(move |p: f64| sink.lock().unwrap().push(p));
        picker.commit(&inbox, false, Some(progress)).await.unwrap();

        assert_eq!(std::fs::read(to_dir.path().join("inbox/memo.txt")).unwrap(), b"quarterly");
        assert!(!from_dir.path().join("memo.txt").exists());
        assert_eq!(seen.lock().unwrap().last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn test_dismiss_cancels_relay_in_progress() {
        let drive = Arc::new(cloud().copy_tree_slow(Duration::from_secs(30)));
        let source: Arc<dyn StorageProvider> = drive.clone();
        let phone_dir = tempfile::tempdir().unwrap();
        let phone: Arc<dyn StorageProvider> = Arc::new(LocalProvider::new(
            ProviderConfig::new(ProviderType::Local, "Phone"),
            phone_dir.path().to_path_buf(),
        ));
        let readme = RemoteEntry::file("readme.txt", "readme.txt", "/readme.txt", 1).with_parent("root");
        // The source is not one of the browsed providers
        let picker = Arc::new(picker_for(&[phone], source.clone(), vec![readme]));
        let device = picker.expand(picker.root()).await.unwrap()[0].clone();

        let pending = {
            let picker = picker.clone();
            let device = device.clone();
            tokio::spawn(async move { picker.commit(&device, false, None).await })
        };
        for _ in 0..100 {
            if !drive.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(drive.calls(), vec!["download:readme.txt".to_string()]);

        assert_eq!(picker.dismiss(), 1);
        assert!(matches!(pending.await.unwrap(), Err(ProviderError::Cancelled)));
        assert_eq!(source.in_flight(), 0);
        assert!(!phone_dir.path().join("readme.txt").exists());
    }

    #[tokio::test]
    async fn test_commit_refuses_blocked_destination() {
        let drive = cloud();
        let shared: Arc<dyn StorageProvider> = drive.clone();
        let picker = picker_for(&[shared.clone()], shared, vec![RemoteEntry::directory("docs", "DOCS", "/docs")]);
        let root = picker.expand(picker.root()).await.unwrap()[0].clone();
        let docs = child(&picker, &root, "docs").await;
        assert!(matches!(picker.commit(&docs, false, None).await, Err(ProviderError::Validation(_))));
    }
}
