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

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use snafu::{OptionExt, ResultExt};
use tokio::{fs, sync::watch};
use tracing::{debug, error, info, warn};

use crate::{
    byte_cache::ByteCache,
    cache::DirectoryCache,
    config::{DownloaderConfig, StorageRoot},
    disk,
    engine::{Downloader, EngineHooks},
    error::{ConfigurationSnafu, DownloadError, FileWriteSnafu, UnknownSourceSnafu},
    item::DownloadItem,
    path::{PathResolver, TMP_DIR_SUFFIX},
    pending::PendingDeleter,
    queue::DownloadQueue,
    source::{Catalog, Source},
    store::{QueueRecord, QueueStore},
    types::{EngineState, Entry, Episode, ItemKey, SourceId},
};

/// Entry point to the download subsystem.
///
/// Owns the queue, the directory cache and the engine, and keeps the three
/// consistent with each other and with the disk.
pub struct DownloadManager {
    config:     DownloaderConfig,
    catalog:    Arc<dyn Catalog>,
    resolver:   PathResolver,
    cache:      Arc<DirectoryCache>,
    queue:      Arc<DownloadQueue>,
    downloader: Downloader,
    pending:    PendingDeleter,
    hooks:      EngineHooks,
}

impl DownloadManager {
    /// Build the subsystem rooted at `config.root_dir` and restore the queue
    /// left by the previous run.
    pub async fn open(
        config: DownloaderConfig,
        catalog: Arc<dyn Catalog>,
        hooks: EngineHooks,
    ) -> Result<Self, DownloadError> {
        let root = StorageRoot::new(config.root_dir.clone());
        Self::open_with_root(config, root, catalog, hooks).await
    }

    /// Like [`DownloadManager::open`], with a storage root the caller can move
    /// later.
    pub async fn open_with_root(
        config: DownloaderConfig,
        root: StorageRoot,
        catalog: Arc<dyn Catalog>,
        hooks: EngineHooks,
    ) -> Result<Self, DownloadError> {
        let root_dir = root.get();
        fs::create_dir_all(&root_dir)
            .await
            .context(ConfigurationSnafu {
                path: root_dir.clone(),
            })?;
        disk::create_no_media_file(&root_dir).await;

        let resolver = PathResolver::new(root.clone());
        let cache = Arc::new(DirectoryCache::new(
            Arc::clone(&catalog),
            root,
            config.renew_interval,
        ));
        let store = QueueStore::new(config.queue_file());
        let records = store.load()?;
        let queue = Arc::new(DownloadQueue::new(store));

        let byte_cache = config
            .cache_transfers
            .then(|| ByteCache::new(config.byte_cache_dir.clone(), config.byte_cache_ttl));
        if let Some(byte_cache) = &byte_cache {
            let purged = byte_cache.purge_expired().await;
            if purged > 0 {
                debug!(purged, "Purged expired byte cache entries");
            }
        }

        let downloader = Downloader::new(
            config.clone(),
            resolver.clone(),
            Arc::clone(&cache),
            Arc::clone(&queue),
            byte_cache,
            hooks.clone(),
        );
        let manager = Self {
            pending: PendingDeleter::new(config.pending_file()),
            config,
            catalog,
            resolver,
            cache,
            queue,
            downloader,
            hooks,
        };
        manager.restore(records).await;
        Ok(manager)
    }

    async fn restore(&self, records: Vec<QueueRecord>) {
        if records.is_empty() {
            return;
        }
        let total = records.len();
        let mut items = Vec::with_capacity(total);
        for record in records {
            let Some(source) = self.catalog.source(record.source_id) else {
                warn!(source = record.source_id, "Dropping queued download of unknown source");
                continue;
            };
            let Some((entry, episode)) = self
                .catalog
                .hydrate(record.source_id, record.entry_id, record.episode_id)
                .await
            else {
                warn!(
                    entry = record.entry_id,
                    episode = record.episode_id,
                    "Dropping queued download of unknown episode"
                );
                continue;
            };
            if self.cache.is_downloaded(&entry, &episode).await {
                continue;
            }
            items.push(DownloadItem::new(Arc::new(entry), Arc::new(episode), source));
        }
        let restored = self.queue.add(items);
        if restored < total {
            // Rewrite the store without the dropped records.
            self.queue.reorder(self.queue.snapshot());
        }
        info!(restored, dropped = total - restored, "Restored download queue");
    }

    #[must_use]
    pub const fn config(&self) -> &DownloaderConfig { &self.config }

    #[must_use]
    pub const fn resolver(&self) -> &PathResolver { &self.resolver }

    #[must_use]
    pub const fn cache(&self) -> &Arc<DirectoryCache> { &self.cache }

    #[must_use]
    pub const fn queue(&self) -> &Arc<DownloadQueue> { &self.queue }

    #[must_use]
    pub const fn downloader(&self) -> &Downloader { &self.downloader }

    #[must_use]
    pub fn state(&self) -> EngineState { self.downloader.state() }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.downloader.subscribe_state()
    }

    #[must_use]
    pub fn is_running(&self) -> bool { self.downloader.is_running() }

    /// Queue the episodes of `entry` that are neither on disk nor already
    /// queued, newest first. Returns how many were queued.
    pub async fn enqueue(&self, entry: &Entry, episodes: &[Episode], auto_start: bool) -> usize {
        if episodes.is_empty() {
            return 0;
        }
        let Some(source) = self.catalog.source(entry.source_id) else {
            warn!(source = entry.source_id, entry = %entry.title, "Cannot queue downloads of unknown source");
            return 0;
        };
        let was_empty = self.queue.is_empty();

        let mut wanted = Vec::with_capacity(episodes.len());
        for episode in episodes {
            if self.queue.contains(entry, episode) || self.cache.is_downloaded(entry, episode).await {
                continue;
            }
            wanted.push(episode.clone());
        }
        wanted.sort_by(|a, b| b.source_order.cmp(&a.source_order));

        let entry = Arc::new(entry.clone());
        let items = wanted
            .into_iter()
            .map(|episode| DownloadItem::new(Arc::clone(&entry), Arc::new(episode), Arc::clone(&source)))
            .collect();
        let added = self.queue.add(items);
        debug!(entry = %entry.title, added, "Queued downloads");

        if added > 0 && auto_start && was_empty {
            self.warn_if_queue_large();
            self.downloader.start();
        }
        added
    }

    fn warn_if_queue_large(&self) {
        let items = self.queue.snapshot();
        let mut per_source: HashMap<SourceId, usize> = HashMap::new();
        for item in &items {
            *per_source.entry(item.entry().source_id).or_default() += 1;
        }
        let busiest = per_source.values().copied().max().unwrap_or(0);
        if items.len() > self.config.queue_warning_threshold
            || busiest > self.config.source_warning_threshold
        {
            self.hooks.notifier.on_warning(&format!(
                "{} downloads queued, {busiest} from a single source. Large batches may get the \
                 client rate limited.",
                items.len()
            ));
        }
    }

    pub fn start(&self) -> bool { self.downloader.start() }

    pub async fn pause(&self) { self.downloader.pause().await; }

    pub async fn stop(&self, reason: Option<&str>) { self.downloader.stop(reason).await; }

    pub async fn clear_queue(&self) { self.downloader.clear_queue(true).await; }

    /// Move the items identified by `keys` to the front, in that order. Items
    /// not listed keep their relative order behind them.
    pub async fn reorder(&self, keys: &[ItemKey]) {
        let current = self.queue.snapshot();
        let mut order: Vec<Arc<DownloadItem>> = keys
            .iter()
            .filter_map(|key| current.iter().find(|item| item.key() == *key).cloned())
            .collect();
        order.extend(
            current
                .into_iter()
                .filter(|item| !keys.contains(&item.key())),
        );
        self.apply_order(order).await;
    }

    /// Put the episode at the head of the queue, queueing it if needed, and
    /// make sure the engine runs.
    pub async fn start_download_now(
        &self,
        entry: &Entry,
        episode: &Episode,
    ) -> Result<(), DownloadError> {
        let key = ItemKey::of(entry, episode);
        let current = self.queue.snapshot();
        let item = match current.iter().find(|item| item.key() == key) {
            Some(item) => Arc::clone(item),
            None => {
                let source = self
                    .catalog
                    .source(entry.source_id)
                    .context(UnknownSourceSnafu {
                        source_id: entry.source_id,
                    })?;
                DownloadItem::new(Arc::new(entry.clone()), Arc::new(episode.clone()), source)
            }
        };

        let mut order = vec![item];
        order.extend(current.into_iter().filter(|queued| queued.key() != key));
        self.apply_order(order).await;
        if !self.downloader.is_running() {
            self.downloader.start();
        }
        Ok(())
    }

    /// Remove queued items without touching their files.
    pub async fn cancel_queued(&self, keys: &[ItemKey]) {
        self.dequeue(|item| keys.contains(&item.key())).await;
    }

    async fn apply_order(&self, order: Vec<Arc<DownloadItem>>) {
        if order.is_empty() {
            self.downloader.clear_queue(true).await;
            return;
        }
        let was_running = self.downloader.suspend().await;
        self.queue.reorder(order);
        if was_running {
            self.downloader.start();
        }
    }

    /// Remove matching items, halting the engine around the change so no
    /// worker is writing into a directory that is about to disappear.
    async fn dequeue(&self, predicate: impl Fn(&DownloadItem) -> bool) {
        let was_running = self.downloader.suspend().await;
        let keep: Vec<_> = self
            .queue
            .snapshot()
            .into_iter()
            .filter(|item| !predicate(&**item))
            .collect();
        if keep.len() == self.queue.len() {
            if was_running {
                self.downloader.start();
            }
            return;
        }
        self.queue.reorder(keep);
        if was_running {
            if self.queue.is_empty() {
                self.downloader.stop(None).await;
            } else {
                self.downloader.start();
            }
        }
    }

    pub async fn is_downloaded(&self, entry: &Entry, episode: &Episode) -> bool {
        self.cache.is_downloaded(entry, episode).await
    }

    pub async fn downloaded_count(&self, entry: &Entry) -> usize {
        self.cache.downloaded_count(entry).await
    }

    pub async fn total_downloaded_count(&self) -> usize {
        self.cache.total_downloaded_count().await
    }

    /// Bytes stored for `entry`.
    pub async fn downloaded_size(&self, entry: &Entry) -> u64 {
        self.cache.downloaded_size(entry).await
    }

    pub async fn total_downloaded_size(&self) -> u64 { self.cache.total_downloaded_size().await }

    /// Find the episode on disk, under any of its known names.
    pub async fn find_episode_dir(&self, entry: &Entry, episode: &Episode) -> Option<PathBuf> {
        let entry_dir = self.locate_entry_dir(entry).await?;
        for candidate in PathResolver::episode_candidates(&entry_dir, episode) {
            if fs::try_exists(&candidate).await.unwrap_or(false) {
                return Some(candidate);
            }
        }
        None
    }

    async fn locate_entry_dir(&self, entry: &Entry) -> Option<PathBuf> {
        if let Some(dir) = self.cache.entry_dir(entry).await {
            return Some(dir);
        }
        let source = self.catalog.source(entry.source_id)?;
        Some(self.resolver.entry_dir(source.as_ref(), entry))
    }

    /// Dequeue and delete the given episodes. The entry directory goes too
    /// once it is empty.
    pub async fn delete_episodes(
        &self,
        entry: &Entry,
        episodes: &[Episode],
    ) -> Result<(), DownloadError> {
        if episodes.is_empty() {
            return Ok(());
        }
        let ids: Vec<u64> = episodes.iter().map(|episode| episode.id).collect();
        self.dequeue(|item| item.entry().id == entry.id && ids.contains(&item.episode().id))
            .await;

        let Some(entry_dir) = self.locate_entry_dir(entry).await else {
            return Ok(());
        };
        for episode in episodes {
            for candidate in PathResolver::episode_candidates(&entry_dir, episode) {
                if disk::remove_path(&candidate)
                    .await
                    .context(FileWriteSnafu {
                        path: candidate.clone(),
                    })?
                {
                    debug!(path = %candidate.display(), "Deleted episode");
                }
            }
        }
        self.cache.remove_episodes(entry, episodes).await;

        if disk::is_dir_empty(&entry_dir).await {
            self.remove_entry_dir(entry, &entry_dir).await?;
        }
        Ok(())
    }

    /// Dequeue every episode of `entry` and delete its directory.
    pub async fn delete_entry(&self, entry: &Entry) -> Result<(), DownloadError> {
        self.dequeue(|item| {
            item.entry().id == entry.id && item.entry().source_id == entry.source_id
        })
        .await;
        if let Some(entry_dir) = self.locate_entry_dir(entry).await {
            self.remove_entry_dir(entry, &entry_dir).await?;
        }
        Ok(())
    }

    async fn remove_entry_dir(&self, entry: &Entry, entry_dir: &Path) -> Result<(), DownloadError> {
        disk::remove_path(entry_dir)
            .await
            .context(FileWriteSnafu {
                path: entry_dir.to_path_buf(),
            })?;
        self.cache.remove_entry(entry).await;
        info!(entry = %entry.title, "Deleted downloads of entry");

        let Some(source_dir) = entry_dir.parent() else {
            return Ok(());
        };
        if source_dir != self.resolver.root() && disk::is_dir_empty(source_dir).await {
            fs::remove_dir(source_dir).await.context(FileWriteSnafu {
                path: source_dir.to_path_buf(),
            })?;
            self.cache.remove_source(entry.source_id).await;
        }
        Ok(())
    }

    /// Move a downloaded episode to the directory its new metadata maps to.
    /// Returns `false` when no download of `old` exists.
    pub async fn rename_episode(
        &self,
        entry: &Entry,
        old: &Episode,
        new: &Episode,
    ) -> Result<bool, DownloadError> {
        let Some(entry_dir) = self.locate_entry_dir(entry).await else {
            return Ok(false);
        };
        let mut found = None;
        for name in PathResolver::valid_episode_dir_names(old) {
            if fs::try_exists(entry_dir.join(&name)).await.unwrap_or(false) {
                found = Some(name);
                break;
            }
        }
        let Some(old_name) = found else {
            error!(entry = %entry.title, episode = %old.name, "Could not find downloaded episode to rename");
            return Ok(false);
        };

        let new_name = PathResolver::episode_dir_name(new);
        if old_name != new_name {
            let target = entry_dir.join(&new_name);
            fs::rename(entry_dir.join(&old_name), &target)
                .await
                .context(FileWriteSnafu { path: target })?;
        }
        self.cache.remove_episode(entry, old).await;
        self.cache.add_episode(entry, &new_name, &entry_dir).await;
        Ok(true)
    }

    /// Rename the directory of a source whose display name changed. Returns
    /// `false` when the old directory does not exist.
    pub async fn rename_source(
        &self,
        old: &dyn Source,
        new: &dyn Source,
    ) -> Result<bool, DownloadError> {
        let root = self.resolver.root();
        let old_name = PathResolver::source_dir_name(old);
        let new_name = PathResolver::source_dir_name(new);
        let old_dir = root.join(&old_name);
        if old_name == new_name || !fs::try_exists(&old_dir).await.unwrap_or(false) {
            return Ok(false);
        }

        let new_dir = root.join(&new_name);
        if old_name.to_lowercase() == new_name.to_lowercase() {
            // Case-insensitive filesystems treat both names as one directory.
            let hop = root.join(format!("{new_name}{TMP_DIR_SUFFIX}"));
            fs::rename(&old_dir, &hop)
                .await
                .context(FileWriteSnafu { path: hop.clone() })?;
            fs::rename(&hop, &new_dir)
                .await
                .context(FileWriteSnafu {
                    path: new_dir.clone(),
                })?;
        } else {
            fs::rename(&old_dir, &new_dir)
                .await
                .context(FileWriteSnafu {
                    path: new_dir.clone(),
                })?;
        }
        self.cache.invalidate().await;
        info!(from = %old_name, to = %new_name, "Renamed source directory");
        Ok(true)
    }

    /// Remember episodes to delete later with [`DownloadManager::delete_pending`].
    pub async fn enqueue_for_deletion(
        &self,
        entry: &Entry,
        episodes: &[Episode],
    ) -> Result<usize, DownloadError> {
        self.pending.add(entry, episodes).await
    }

    /// Delete every episode recorded by [`DownloadManager::enqueue_for_deletion`].
    /// Returns the number of episodes processed.
    pub async fn delete_pending(&self) -> Result<usize, DownloadError> {
        let mut deleted = 0;
        for (entry, episodes) in self.pending.take().await? {
            self.delete_episodes(&entry, &episodes).await?;
            deleted += episodes.len();
        }
        Ok(deleted)
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("root", &self.resolver.root())
            .field("downloader", &self.downloader)
            .finish_non_exhaustive()
    }
}
