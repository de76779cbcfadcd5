//! docbridge - one document browser over many storage backends
//!
//! A collaboration portal, Dropbox, Google Drive, OneDrive, WebDAV servers
//! and the local device are all reached through [`providers::StorageProvider`].
//! Network backends share one authenticated request pipeline (credential
//! refresh, request shaping, cancellation, error normalization) and are kept in
//! a [`registry::ProviderRegistry`] backed by a pluggable store. The
//! [`transfer::TransferPicker`] browses every connected provider at once to
//! choose a copy or move destination.

pub mod config;
pub mod logging;
pub mod providers;
pub mod registry;
pub mod transfer;

pub use config::{load_config, PipelineConfig};
pub use providers::{
    FetchPage, FetchParams, ProviderConfig, ProviderEnv, ProviderError, ProviderFactory, ProviderRecord,
    ProviderType, RemoteEntry, StorageProvider, TransferMode, TransferOutcome,
};
pub use registry::{FileProviderStore, MemoryProviderStore, ProviderRegistry, ProviderStore};
pub use transfer::{FolderNode, NodeKind, TransferPicker, TransferRequest};
