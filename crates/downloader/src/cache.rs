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

//! In-memory mirror of the download tree.
//!
//! Existence checks are answered from a `source -> entry -> episodes` index
//! instead of the filesystem. The index is rebuilt from disk when it is older
//! than the renewal interval, when the storage root moves, or after
//! [`DirectoryCache::invalidate`]. Between rebuilds the engine and the manager
//! keep it current through incremental updates.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::{
    fs,
    sync::{RwLock, watch},
};
use tracing::{debug, info};

use crate::{
    config::StorageRoot,
    disk,
    path::{PathResolver, TMP_DIR_SUFFIX, VIDEO_EXTENSIONS},
    source::Catalog,
    types::{Entry, Episode, SourceId},
};

#[derive(Debug, Default)]
struct SourceNode {
    dir:     PathBuf,
    entries: HashMap<String, EntryNode>,
}

#[derive(Debug, Default)]
struct EntryNode {
    dir:      PathBuf,
    episodes: HashSet<String>,
}

#[derive(Debug, Default)]
struct Index {
    sources:    HashMap<SourceId, SourceNode>,
    renewed_at: Option<Instant>,
}

impl Index {
    fn entry(&self, entry: &Entry) -> Option<&EntryNode> {
        self.sources
            .get(&entry.source_id)?
            .entries
            .get(&PathResolver::entry_dir_name(entry))
    }

    fn entry_mut(&mut self, entry: &Entry) -> Option<&mut EntryNode> {
        self.sources
            .get_mut(&entry.source_id)?
            .entries
            .get_mut(&PathResolver::entry_dir_name(entry))
    }

    fn is_due(&self, interval: Duration) -> bool {
        self.renewed_at
            .is_none_or(|renewed| renewed.elapsed() >= interval)
    }
}

pub struct DirectoryCache {
    catalog:        Arc<dyn Catalog>,
    root:           StorageRoot,
    renew_interval: Duration,
    index:          RwLock<Index>,
    root_changes:   Mutex<watch::Receiver<PathBuf>>,
    generation:     watch::Sender<u64>,
}

impl DirectoryCache {
    pub fn new(catalog: Arc<dyn Catalog>, root: StorageRoot, renew_interval: Duration) -> Self {
        let root_changes = Mutex::new(root.subscribe());
        let (generation, _) = watch::channel(0);
        Self {
            catalog,
            root,
            renew_interval,
            index: RwLock::new(Index::default()),
            root_changes,
            generation,
        }
    }

    /// Whether the episode is stored under any of its known directory names.
    pub async fn is_downloaded(&self, entry: &Entry, episode: &Episode) -> bool {
        self.renew_if_due().await;
        let index = self.index.read().await;
        index.entry(entry).is_some_and(|node| {
            PathResolver::valid_episode_dir_names(episode)
                .iter()
                .any(|name| node.episodes.contains(name))
        })
    }

    /// Number of finished episodes of `entry`.
    pub async fn downloaded_count(&self, entry: &Entry) -> usize {
        self.renew_if_due().await;
        let index = self.index.read().await;
        index.entry(entry).map_or(0, |node| count_finished(&node.episodes))
    }

    /// Number of finished episodes across the whole tree.
    pub async fn total_downloaded_count(&self) -> usize {
        self.renew_if_due().await;
        let index = self.index.read().await;
        index
            .sources
            .values()
            .flat_map(|source| source.entries.values())
            .map(|node| count_finished(&node.episodes))
            .sum()
    }

    /// Bytes stored for `entry`, measured on disk.
    pub async fn downloaded_size(&self, entry: &Entry) -> u64 {
        match self.entry_dir(entry).await {
            Some(dir) => disk::dir_size(&dir).await,
            None => 0,
        }
    }

    /// Bytes stored under every known source directory.
    pub async fn total_downloaded_size(&self) -> u64 {
        self.renew_if_due().await;
        let dirs: Vec<PathBuf> = {
            let index = self.index.read().await;
            index.sources.values().map(|source| source.dir.clone()).collect()
        };
        join_all(dirs.iter().map(|dir| disk::dir_size(dir)))
            .await
            .into_iter()
            .sum()
    }

    /// Directory of `entry` as last seen on disk.
    pub async fn entry_dir(&self, entry: &Entry) -> Option<PathBuf> {
        self.renew_if_due().await;
        let index = self.index.read().await;
        index.entry(entry).map(|node| node.dir.clone())
    }

    /// Force the next query to rebuild the index from disk.
    pub async fn invalidate(&self) { self.index.write().await.renewed_at = None; }

    /// Rebuild the index from disk now.
    pub async fn renew(&self) {
        let mut index = self.index.write().await;
        self.rebuild(&mut index).await;
        drop(index);
        self.bump();
    }

    /// Record a finished episode directory without touching disk.
    pub async fn add_episode(&self, entry: &Entry, episode_dir_name: &str, entry_dir: &Path) {
        {
            let mut index = self.index.write().await;
            let source = index
                .sources
                .entry(entry.source_id)
                .or_insert_with(|| SourceNode {
                    dir:     entry_dir.parent().map(Path::to_path_buf).unwrap_or_default(),
                    entries: HashMap::new(),
                });
            source
                .entries
                .entry(PathResolver::entry_dir_name(entry))
                .or_insert_with(|| EntryNode {
                    dir:      entry_dir.to_path_buf(),
                    episodes: HashSet::new(),
                })
                .episodes
                .insert(episode_dir_name.to_string());
        }
        self.bump();
    }

    pub async fn remove_episode(&self, entry: &Entry, episode: &Episode) {
        self.remove_episodes(entry, std::slice::from_ref(episode))
            .await;
    }

    /// Forget every known directory name of `episodes`.
    pub async fn remove_episodes(&self, entry: &Entry, episodes: &[Episode]) {
        {
            let mut index = self.index.write().await;
            let Some(node) = index.entry_mut(entry) else {
                return;
            };
            for episode in episodes {
                for name in PathResolver::valid_episode_dir_names(episode) {
                    node.episodes.remove(&name);
                }
            }
        }
        self.bump();
    }

    pub async fn remove_entry(&self, entry: &Entry) {
        let removed = {
            let mut index = self.index.write().await;
            index
                .sources
                .get_mut(&entry.source_id)
                .and_then(|source| source.entries.remove(&PathResolver::entry_dir_name(entry)))
                .is_some()
        };
        if removed {
            self.bump();
        }
    }

    pub async fn remove_source(&self, source_id: SourceId) {
        let removed = self.index.write().await.sources.remove(&source_id).is_some();
        if removed {
            self.bump();
        }
    }

    /// Watch the index generation, bumped on every change.
    #[must_use]
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> { self.generation.subscribe() }

    async fn renew_if_due(&self) {
        let root_moved = {
            let mut changes = self.root_changes.lock();
            let moved = changes.has_changed().unwrap_or(false);
            if moved {
                changes.borrow_and_update();
            }
            moved
        };

        if !root_moved && !self.index.read().await.is_due(self.renew_interval) {
            return;
        }

        let mut index = self.index.write().await;
        // Another query may have renewed while we waited for the lock.
        if !root_moved && !index.is_due(self.renew_interval) {
            return;
        }
        self.rebuild(&mut index).await;
        drop(index);
        self.bump();
    }

    async fn rebuild(&self, index: &mut Index) {
        let root = self.root.get();
        let known: HashMap<String, SourceId> = self
            .catalog
            .sources()
            .iter()
            .map(|source| {
                (
                    PathResolver::source_dir_name(source.as_ref()).to_lowercase(),
                    source.id(),
                )
            })
            .collect();

        let mut sources = HashMap::new();
        for (name, dir) in list_dirs(&root).await {
            if let Some(id) = known.get(&name.to_lowercase()) {
                sources.insert(*id, SourceNode {
                    dir,
                    entries: HashMap::new(),
                });
            }
        }

        join_all(sources.values_mut().map(|source| async move {
            for (name, dir) in list_dirs(&source.dir).await {
                let episodes = list_episodes(&dir).await;
                source.entries.insert(name, EntryNode { dir, episodes });
            }
        }))
        .await;

        let episodes: usize = sources
            .values()
            .flat_map(|source| source.entries.values())
            .map(|entry| entry.episodes.len())
            .sum();
        info!(root = %root.display(), sources = sources.len(), episodes, "Rebuilt download index");

        index.sources = sources;
        index.renewed_at = Some(Instant::now());
    }

    fn bump(&self) { self.generation.send_modify(|generation| *generation += 1); }
}

impl std::fmt::Debug for DirectoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryCache")
            .field("root", &self.root.get())
            .field("renew_interval", &self.renew_interval)
            .finish_non_exhaustive()
    }
}

fn count_finished(episodes: &HashSet<String>) -> usize {
    episodes
        .iter()
        .filter(|name| !name.ends_with(TMP_DIR_SUFFIX))
        .count()
}

fn video_stem(name: &str) -> Option<&str> {
    let (stem, ext) = name.rsplit_once('.')?;
    (VIDEO_EXTENSIONS.contains(&ext) && !stem.is_empty()).then_some(stem)
}

async fn list_dirs(dir: &Path) -> Vec<(String, PathBuf)> {
    let mut dirs = Vec::new();
    let mut children = match fs::read_dir(dir).await {
        Ok(children) => children,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
            return dirs;
        }
    };
    while let Ok(Some(child)) = children.next_entry().await {
        let is_dir = child.file_type().await.is_ok_and(|kind| kind.is_dir());
        let name = child.file_name().to_string_lossy().into_owned();
        if is_dir && !name.trim().is_empty() {
            dirs.push((name, child.path()));
        }
    }
    dirs
}

async fn list_episodes(dir: &Path) -> HashSet<String> {
    let mut episodes = HashSet::new();
    let Ok(mut children) = fs::read_dir(dir).await else {
        return episodes;
    };
    while let Ok(Some(child)) = children.next_entry().await {
        let name = child.file_name().to_string_lossy().into_owned();
        if name.ends_with(TMP_DIR_SUFFIX) {
            continue;
        }
        let Ok(kind) = child.file_type().await else {
            continue;
        };
        if kind.is_dir() {
            episodes.insert(name);
        } else if let Some(stem) = video_stem(&name) {
            episodes.insert(stem.to_string());
        }
    }
    episodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{StaticCatalog, entry, episode};

    fn cache_at(root: &Path, catalog: StaticCatalog) -> DirectoryCache {
        DirectoryCache::new(
            Arc::new(catalog),
            StorageRoot::new(root),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn renew_reads_directories_and_video_files() {
        let dir = tempfile::tempdir().unwrap();
        let show = dir.path().join("example/Show A");
        std::fs::create_dir_all(show.join("Ep 1")).unwrap();
        std::fs::create_dir_all(show.join("Ep 2_tmp")).unwrap();
        std::fs::write(show.join("Ep 3.mkv"), b"").unwrap();
        std::fs::write(show.join("notes.txt"), b"").unwrap();
        std::fs::create_dir_all(dir.path().join("Unknown/Show A/Ep 1")).unwrap();

        let cache = cache_at(dir.path(), StaticCatalog::with_source(1, "Example"));
        let show_a = entry(1, 10, "Show A");

        assert!(cache.is_downloaded(&show_a, &episode(10, 1, "Ep 1")).await);
        assert!(!cache.is_downloaded(&show_a, &episode(10, 2, "Ep 2")).await);
        assert!(cache.is_downloaded(&show_a, &episode(10, 3, "Ep 3")).await);
        assert!(!cache.is_downloaded(&show_a, &episode(10, 4, "notes")).await);
        assert_eq!(cache.downloaded_count(&show_a).await, 2);
        assert_eq!(cache.total_downloaded_count().await, 2);
    }

    #[tokio::test]
    async fn sizes_cover_known_sources_only() {
        let dir = tempfile::tempdir().unwrap();
        let show = dir.path().join("Example/Show A");
        std::fs::create_dir_all(show.join("Ep 1")).unwrap();
        std::fs::write(show.join("Ep 1/Ep 1.mp4"), [0u8; 100]).unwrap();
        std::fs::write(show.join("Ep 2.mkv"), [0u8; 20]).unwrap();
        std::fs::create_dir_all(dir.path().join("Example/Show B")).unwrap();
        std::fs::write(dir.path().join("Example/Show B/Ep 1.mp4"), [0u8; 5]).unwrap();
        std::fs::create_dir_all(dir.path().join("Unknown/Show A")).unwrap();
        std::fs::write(dir.path().join("Unknown/Show A/Ep 1.mp4"), [0u8; 7]).unwrap();
        std::fs::write(dir.path().join("stray.bin"), [0u8; 1000]).unwrap();

        let cache = cache_at(dir.path(), StaticCatalog::with_source(1, "Example"));
        assert_eq!(cache.downloaded_size(&entry(1, 10, "Show A")).await, 120);
        assert_eq!(cache.downloaded_size(&entry(1, 12, "Missing")).await, 0);
        assert_eq!(cache.total_downloaded_size().await, 125);
    }

    #[tokio::test]
    async fn queries_do_not_touch_disk_between_renewals() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), StaticCatalog::with_source(1, "Example"));
        let show_a = entry(1, 10, "Show A");
        let ep1 = episode(10, 1, "Ep 1");

        assert!(!cache.is_downloaded(&show_a, &ep1).await);
        cache
            .add_episode(&show_a, "Ep 1", &dir.path().join("Example/Show A"))
            .await;
        // Nothing exists on disk, the index alone answers.
        assert!(cache.is_downloaded(&show_a, &ep1).await);

        cache.remove_episode(&show_a, &ep1).await;
        assert!(!cache.is_downloaded(&show_a, &ep1).await);

        cache
            .add_episode(&show_a, "Ep 1", &dir.path().join("Example/Show A"))
            .await;
        cache.invalidate().await;
        assert!(!cache.is_downloaded(&show_a, &ep1).await);
    }

    #[tokio::test]
    async fn root_change_triggers_renewal() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(second.path().join("Example/Show A/Ep 1")).unwrap();

        let root = StorageRoot::new(first.path());
        let cache = DirectoryCache::new(
            Arc::new(StaticCatalog::with_source(1, "Example")),
            root.clone(),
            Duration::from_secs(3600),
        );
        let show_a = entry(1, 10, "Show A");
        let ep1 = episode(10, 1, "Ep 1");
        assert!(!cache.is_downloaded(&show_a, &ep1).await);

        let mut changes = cache.subscribe_changes();
        root.set(second.path());
        assert!(cache.is_downloaded(&show_a, &ep1).await);
        assert!(changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn removing_entries_and_sources() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), StaticCatalog::with_source(1, "Example"));
        let show_a = entry(1, 10, "Show A");
        let show_b = entry(1, 11, "Show B");
        let entry_dir = dir.path().join("Example");

        cache.renew().await;
        cache.add_episode(&show_a, "Ep 1", &entry_dir.join("Show A")).await;
        cache.add_episode(&show_b, "Ep 1", &entry_dir.join("Show B")).await;
        assert_eq!(cache.total_downloaded_count().await, 2);

        cache.remove_entry(&show_a).await;
        assert_eq!(cache.downloaded_count(&show_a).await, 0);
        assert_eq!(cache.total_downloaded_count().await, 1);

        cache.remove_source(1).await;
        assert_eq!(cache.total_downloaded_count().await, 0);
    }
}
