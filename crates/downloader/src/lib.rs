// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Episode download engine.
//!
//! Episodes are queued per source, transferred by a scheduler that keeps a
//! bounded number of sources busy, and finalized atomically into
//! `<root>/<source>/<entry>/<episode>`. A directory cache answers "is this
//! downloaded" without touching the filesystem, and the queue survives
//! restarts.

mod byte_cache;
mod cache;
mod config;
pub mod disk;
mod engine;
mod error;
mod item;
mod manager;
pub mod metrics;
mod notifier;
mod path;
mod pending;
mod queue;
mod source;
mod store;
mod transfer;
mod types;

#[cfg(test)]
mod test_util;

pub use byte_cache::{ByteCache, CachedAsset};
pub use cache::DirectoryCache;
pub use config::{DownloaderConfig, StorageRoot};
pub use disk::{FreeSpace, SystemFreeSpace};
pub use engine::{Downloader, EngineHooks};
pub use error::DownloadError;
pub use item::DownloadItem;
pub use manager::DownloadManager;
pub use notifier::{NoopLifecycle, Notifier, ServiceLifecycle, TracingNotifier};
pub use path::{PathResolver, TMP_DIR_SUFFIX, VIDEO_EXTENSIONS, sanitize};
pub use pending::PendingDeleter;
pub use queue::{DownloadQueue, QueueEvent};
pub use source::{
    ByteStream, Catalog, Fetched, HttpSource, Manifest, ManifestCatalog, ManifestEntry,
    ManifestEpisode, ManifestSource, Source, SourceError,
};
pub use store::{QueueRecord, QueueStore};
pub use transfer::{PARTIAL_EXTENSION, TransferProgress};
pub use types::{Asset, DownloadStatus, EngineState, Entry, Episode, ItemKey, SourceId};
