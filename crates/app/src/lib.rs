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

mod config;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

pub use config::{AppConfig, DownloadSettings};
use kura_downloader::{
    DownloadManager, DownloadStatus, EngineHooks, EngineState, Entry, Episode, HttpSource,
    Manifest, ManifestCatalog, ServiceLifecycle,
};
use snafu::{OptionExt, ResultExt, Whatever};
use tracing::{info, warn};

/// Tracks whether the engine holds the process busy.
#[derive(Debug, Default)]
pub struct AppLifecycle {
    running: AtomicBool,
}

impl AppLifecycle {
    #[must_use]
    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }
}

impl ServiceLifecycle for AppLifecycle {
    fn on_start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("Download service started");
    }

    fn on_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Download service stopped");
    }
}

/// One line of `kura status`.
#[derive(Debug, Clone)]
pub struct QueuedLine {
    pub source:   String,
    pub entry:    String,
    pub episode:  String,
    pub status:   DownloadStatus,
    pub progress: u8,
}

/// One line of `kura list`.
#[derive(Debug, Clone)]
pub struct LibraryLine {
    pub entry_id:   u64,
    pub title:      String,
    pub downloaded: usize,
    pub available:  usize,
    /// Bytes on disk.
    pub size:       u64,
}

/// Result of a [`App::fetch`] run.
#[derive(Debug, Clone, Copy)]
pub struct FetchSummary {
    pub queued:    usize,
    pub remaining: usize,
    pub state:     EngineState,
}

/// The application: a manifest catalog driving a download manager.
pub struct App {
    catalog:   Arc<ManifestCatalog>,
    manager:   DownloadManager,
    lifecycle: Arc<AppLifecycle>,
}

impl App {
    /// Load the manifest and open the download manager. Restores the queue
    /// left by the previous run without starting it.
    pub async fn open(config: &AppConfig) -> Result<Self, Whatever> {
        let downloader_config = config.downloads.to_config();
        let manifest = Manifest::load(&config.manifest)
            .await
            .whatever_context("Failed to load manifest")?;
        let client = HttpSource::build_client(&downloader_config)
            .whatever_context("Failed to build HTTP client")?;
        let catalog = Arc::new(ManifestCatalog::new(manifest, &client));

        let lifecycle = Arc::new(AppLifecycle::default());
        let hooks = EngineHooks {
            lifecycle: Arc::clone(&lifecycle) as _,
            ..EngineHooks::default()
        };
        let manager = DownloadManager::open(downloader_config, Arc::clone(&catalog) as _, hooks)
            .await
            .whatever_context("Failed to open download manager")?;
        info!(
            root = %manager.resolver().root().display(),
            entries = catalog.entries().len(),
            queued = manager.queue().len(),
            "Kura ready"
        );

        Ok(Self {
            catalog,
            manager,
            lifecycle,
        })
    }

    #[must_use]
    pub const fn manager(&self) -> &DownloadManager { &self.manager }

    #[must_use]
    pub fn is_busy(&self) -> bool { self.lifecycle.is_running() }

    fn entry(&self, entry_id: u64) -> Result<&(Entry, Vec<Episode>), Whatever> {
        self.catalog
            .find_entry(entry_id)
            .whatever_context(format!("Entry {entry_id} is not in the manifest"))
    }

    /// Queue every episode of the given entries, or of the whole manifest
    /// when `entry_ids` is empty, then download until the engine stops or the
    /// process is interrupted, which pauses it.
    pub async fn fetch(&self, entry_ids: &[u64]) -> Result<FetchSummary, Whatever> {
        let selected: Vec<&(Entry, Vec<Episode>)> = if entry_ids.is_empty() {
            self.catalog.entries().iter().collect()
        } else {
            entry_ids
                .iter()
                .map(|id| self.entry(*id))
                .collect::<Result<_, _>>()?
        };

        let mut queued = 0;
        for (entry, episodes) in selected {
            queued += self.manager.enqueue(entry, episodes, true).await;
        }
        // Restored items are not started by `enqueue`.
        if !self.manager.is_running() {
            self.manager.start();
        }

        let mut state = self.manager.subscribe_state();
        tokio::select! {
            _ = state.wait_for(|state| *state != EngineState::Running) => {}
            () = shutdown_signal() => {
                warn!("Interrupted, pausing downloads");
                self.manager.pause().await;
            }
        }

        Ok(FetchSummary {
            queued,
            remaining: self.manager.queue().len(),
            state: self.manager.state(),
        })
    }

    /// The persisted queue, as restored at startup.
    #[must_use]
    pub fn queued(&self) -> Vec<QueuedLine> {
        self.manager
            .queue()
            .snapshot()
            .iter()
            .map(|item| QueuedLine {
                source:   item.source().name().to_string(),
                entry:    item.entry().title.clone(),
                episode:  item.episode().name.clone(),
                status:   item.status(),
                progress: item.progress(),
            })
            .collect()
    }

    /// Downloaded and available episode counts of every manifest entry,
    /// rescanning the download tree first.
    pub async fn library(&self) -> Vec<LibraryLine> {
        self.manager.cache().renew().await;
        let mut lines = Vec::with_capacity(self.catalog.entries().len());
        for (entry, episodes) in self.catalog.entries() {
            lines.push(LibraryLine {
                entry_id:   entry.id,
                title:      entry.title.clone(),
                downloaded: self.manager.downloaded_count(entry).await,
                available:  episodes.len(),
                size:       self.manager.downloaded_size(entry).await,
            });
        }
        lines
    }

    /// Delete downloads of an entry: the listed episodes, or all of them.
    /// With `defer`, episodes are only recorded for a later [`App::purge`].
    pub async fn delete(
        &self,
        entry_id: u64,
        episode_ids: &[u64],
        defer: bool,
    ) -> Result<usize, Whatever> {
        let (entry, episodes) = self.entry(entry_id)?;
        if episode_ids.is_empty() && !defer {
            self.manager
                .delete_entry(entry)
                .await
                .whatever_context("Failed to delete entry")?;
            return Ok(episodes.len());
        }

        let selected: Vec<Episode> = episodes
            .iter()
            .filter(|episode| episode_ids.is_empty() || episode_ids.contains(&episode.id))
            .cloned()
            .collect();
        if defer {
            return self
                .manager
                .enqueue_for_deletion(entry, &selected)
                .await
                .whatever_context("Failed to record pending deletion");
        }
        self.manager
            .delete_episodes(entry, &selected)
            .await
            .whatever_context("Failed to delete episodes")?;
        Ok(selected.len())
    }

    /// Delete everything recorded with a deferred delete.
    pub async fn purge(&self) -> Result<usize, Whatever> {
        self.manager
            .delete_pending()
            .await
            .whatever_context("Failed to delete pending episodes")
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C signal"); },
        () = terminate => { info!("Received terminate signal"); },
    }
}
