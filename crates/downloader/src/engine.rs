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

//! The download engine.
//!
//! A single scheduler task watches the queue and keeps one worker task per
//! active source group. A source group is the set of pending items of one
//! source; only its first item in queue order runs, and at most
//! `max_source_groups` groups run at once. Whenever the queue changes or a
//! worker ends, the active set is recomputed: new heads get a worker, workers
//! whose item left the active set are cancelled.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use smart_default::SmartDefault;
use snafu::{OptionExt, ResultExt, ensure};
use tokio::{
    fs,
    sync::{broadcast::error::RecvError, watch},
    task::{self, JoinHandle, JoinSet},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    byte_cache::ByteCache,
    cache::DirectoryCache,
    config::DownloaderConfig,
    disk::{self, FreeSpace, SystemFreeSpace},
    error::{
        AssetResolutionSnafu, CancelledSnafu, ConfigurationSnafu, DownloadError,
        FileReadSnafu, FileWriteSnafu, FinalizeIntegritySnafu, InsufficientSpaceSnafu,
    },
    item::DownloadItem,
    metrics::{ACTIVE_SOURCE_GROUPS, DOWNLOADS_COMPLETED, DOWNLOADS_FAILED},
    notifier::{NoopLifecycle, Notifier, ServiceLifecycle, TracingNotifier},
    path::{PathResolver, TMP_DIR_SUFFIX},
    queue::{DownloadQueue, QueueEvent},
    transfer::{self, PARTIAL_EXTENSION, Transfer, TransferProgress},
    types::{DownloadStatus, EngineState, ItemKey, SourceId},
};

/// Collaborators the engine reports to and asks for free space.
#[derive(Clone, SmartDefault)]
pub struct EngineHooks {
    #[default(_code = "Arc::new(TracingNotifier)")]
    pub notifier:   Arc<dyn Notifier>,
    #[default(_code = "Arc::new(NoopLifecycle)")]
    pub lifecycle:  Arc<dyn ServiceLifecycle>,
    #[default(_code = "Arc::new(SystemFreeSpace)")]
    pub free_space: Arc<dyn FreeSpace>,
}

struct Job {
    id:     u64,
    token:  CancellationToken,
    handle: JoinHandle<()>,
}

struct Worker {
    task:  task::Id,
    token: CancellationToken,
}

struct Inner {
    config:     DownloaderConfig,
    resolver:   PathResolver,
    cache:      Arc<DirectoryCache>,
    queue:      Arc<DownloadQueue>,
    byte_cache: Option<ByteCache>,
    hooks:      EngineHooks,
    state:      watch::Sender<EngineState>,
    job:        Mutex<Option<Job>>,
    next_job:   AtomicU64,
    /// Whether the lifecycle collaborator has seen `on_start` without a
    /// matching `on_stop`.
    held:       AtomicBool,
}

/// Runs the queued downloads.
///
/// Cheap to clone; clones drive the same engine.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<Inner>,
}

impl Downloader {
    pub fn new(
        config: DownloaderConfig,
        resolver: PathResolver,
        cache: Arc<DirectoryCache>,
        queue: Arc<DownloadQueue>,
        byte_cache: Option<ByteCache>,
        hooks: EngineHooks,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Stopped);
        Self {
            inner: Arc::new(Inner {
                config,
                resolver,
                cache,
                queue,
                byte_cache,
                hooks,
                state,
                job: Mutex::new(None),
                next_job: AtomicU64::new(0),
                held: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> EngineState { *self.inner.state.borrow() }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> { self.inner.state.subscribe() }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .job
            .lock()
            .as_ref()
            .is_some_and(|job| !job.token.is_cancelled() && !job.handle.is_finished())
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<DownloadQueue> { &self.inner.queue }

    /// Start processing the queue. Returns `false` when the engine is already
    /// running or there is nothing to download.
    pub fn start(&self) -> bool {
        let mut slot = self.inner.job.lock();
        let running = slot
            .as_ref()
            .is_some_and(|job| !job.token.is_cancelled() && !job.handle.is_finished());
        if running || self.inner.queue.is_empty() {
            return false;
        }

        let pending: Vec<_> = self
            .inner
            .queue
            .snapshot()
            .into_iter()
            .filter(|item| item.status() != DownloadStatus::Downloaded)
            .collect();
        if pending.is_empty() {
            return false;
        }
        for item in &pending {
            item.set_status(DownloadStatus::Queued);
        }

        // Publish the state before the scheduler can finish and overwrite it.
        self.inner.state.send_replace(EngineState::Running);
        self.inner.acquire();
        *slot = Some(Inner::spawn_job(&self.inner));
        info!(items = pending.len(), "Download engine started");
        true
    }

    /// Halt the scheduler and put interrupted items back to queued.
    pub async fn pause(&self) {
        if !self.suspend().await {
            return;
        }
        self.inner.state.send_replace(EngineState::Paused);
        self.inner.hooks.notifier.on_paused();
        info!("Download engine paused");
    }

    /// Halt the scheduler without reporting it, so the queue can be
    /// rearranged before [`Downloader::start`] resumes it. Interrupted items
    /// go back to queued. Returns whether a job was running.
    pub(crate) async fn suspend(&self) -> bool {
        if !self.halt().await {
            return false;
        }
        for item in self.inner.queue.snapshot() {
            if item.status() == DownloadStatus::Downloading {
                item.set_status(DownloadStatus::Queued);
            }
        }
        true
    }

    /// Halt the scheduler and fail interrupted items. A `reason` is reported
    /// as a warning; without one the user sees a paused or completed
    /// notification depending on what is left.
    pub async fn stop(&self, reason: Option<&str>) {
        self.halt().await;
        for item in self.inner.queue.snapshot() {
            if item.status() == DownloadStatus::Downloading {
                item.set_status(DownloadStatus::Error);
            }
        }
        self.inner.release();
        match reason {
            Some(reason) => {
                warn!(reason, "Download engine stopped");
                self.inner.hooks.notifier.on_warning(reason);
            }
            None => self.inner.notify_halted(),
        }
    }

    /// Halt the scheduler and empty the queue and its persisted copy.
    pub async fn clear_queue(&self, reset_statuses: bool) {
        self.halt().await;
        self.inner.queue.clear(reset_statuses);
        self.inner.release();
        self.inner.hooks.notifier.dismiss_progress();
    }

    /// Cancel the running job, if any, and wait for its scheduler to exit.
    async fn halt(&self) -> bool {
        let job = self.inner.job.lock().take();
        let Some(job) = job else {
            return false;
        };
        job.token.cancel();
        if let Err(e) = job.handle.await {
            if e.is_panic() {
                error!("Download scheduler panicked while halting");
            }
        }
        ACTIVE_SOURCE_GROUPS.set(0);
        true
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("state", &self.state())
            .field("queued", &self.inner.queue.len())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn spawn_job(self: &Arc<Self>) -> Job {
        let id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let handle = tokio::spawn(schedule(Arc::clone(self), id, token.clone()));
        Job { id, token, handle }
    }

    fn acquire(&self) {
        if !self.held.swap(true, Ordering::AcqRel) {
            self.hooks.lifecycle.on_start();
        }
    }

    fn release(&self) {
        self.state.send_replace(EngineState::Stopped);
        if self.held.swap(false, Ordering::AcqRel) {
            self.hooks.lifecycle.on_stop();
        }
    }

    fn notify_halted(&self) {
        if self.queue.is_empty() {
            self.hooks.notifier.on_complete();
        } else {
            self.hooks.notifier.on_paused();
        }
    }

    /// Called by the scheduler when it runs out of work or fails. Only the job
    /// that still owns the slot may change the engine state.
    fn finish(self: &Arc<Self>, job_id: u64, failed: bool) {
        {
            let mut slot = self.job.lock();
            if !slot.as_ref().is_some_and(|job| job.id == job_id) {
                return;
            }
            // A `start` racing with the last scan saw this job alive and
            // returned, so work queued since then is picked up here.
            let queued = select_active(&self.queue.snapshot(), self.config.max_source_groups);
            if !failed && !queued.is_empty() {
                debug!(items = queued.len(), "Work arrived while the scheduler was finishing");
                *slot = Some(Self::spawn_job(self));
                return;
            }
            slot.take();
        }

        ACTIVE_SOURCE_GROUPS.set(0);
        if failed {
            for item in self.queue.snapshot() {
                if item.status() == DownloadStatus::Downloading {
                    item.set_status(DownloadStatus::Error);
                }
            }
        }
        self.release();
        if !failed {
            self.notify_halted();
        }
        info!(remaining = self.queue.len(), "Download engine stopped");
    }
}

/// The head item of the first `max_groups` source groups, in queue order.
fn select_active(items: &[Arc<DownloadItem>], max_groups: usize) -> Vec<Arc<DownloadItem>> {
    let mut groups: Vec<SourceId> = Vec::new();
    let mut active = Vec::new();
    for item in items {
        if !item.status().is_pending() {
            continue;
        }
        let source = item.source().id();
        if groups.contains(&source) {
            continue;
        }
        if groups.len() == max_groups {
            break;
        }
        groups.push(source);
        active.push(Arc::clone(item));
    }
    active
}

async fn schedule(inner: Arc<Inner>, job_id: u64, token: CancellationToken) {
    let mut events = inner.queue.subscribe();
    let mut workers: HashMap<ItemKey, Worker> = HashMap::new();
    // Cancelled tasks still winding down, with the item they worked on.
    let mut draining: HashMap<task::Id, ItemKey> = HashMap::new();
    let mut tasks: JoinSet<(ItemKey, Option<DownloadError>)> = JoinSet::new();
    let mut failed = false;

    loop {
        let active = select_active(&inner.queue.snapshot(), inner.config.max_source_groups);
        workers.retain(|key, worker| {
            let keep = active.iter().any(|item| item.key() == *key);
            if !keep {
                debug!(?key, "Cancelling download that left the active set");
                worker.token.cancel();
                draining.insert(worker.task, *key);
            }
            keep
        });
        for item in active {
            let key = item.key();
            // One task per item at a time: a re-queued item waits for its
            // cancelled task to leave the workspace.
            if workers.contains_key(&key) || draining.values().any(|k| *k == key) {
                continue;
            }
            let worker = token.child_token();
            let handle = tasks.spawn(process(Arc::clone(&inner), item, worker.clone()));
            workers.insert(key, Worker {
                task:  handle.id(),
                token: worker,
            });
        }
        #[allow(clippy::cast_possible_wrap)]
        ACTIVE_SOURCE_GROUPS.set(workers.len() as i64);

        if tasks.is_empty() {
            break;
        }

        // Wait for something that may change the active set.
        loop {
            tokio::select! {
                () = token.cancelled() => {
                    while tasks.join_next().await.is_some() {}
                    return;
                }
                Some(joined) = tasks.join_next_with_id() => {
                    let fault = match joined {
                        Ok((id, (key, fatal))) => {
                            draining.remove(&id);
                            if workers.get(&key).is_some_and(|worker| worker.task == id) {
                                workers.remove(&key);
                            }
                            fatal.map(|e| e.to_string())
                        }
                        Err(e) => {
                            draining.remove(&e.id());
                            Some(format!("Download task failed: {e}"))
                        }
                    };
                    if let Some(fault) = fault {
                        error!(error = %fault, "Download engine failed");
                        inner.hooks.notifier.on_error(&fault, None);
                        failed = true;
                        token.cancel();
                        while tasks.join_next().await.is_some() {}
                    }
                    break;
                }
                event = events.recv() => match event {
                    Ok(QueueEvent::Changed) | Err(RecvError::Lagged(_)) => break,
                    Ok(QueueEvent::Status { key, .. }) if !workers.contains_key(&key) => break,
                    Ok(_) => {}
                    Err(RecvError::Closed) => {
                        token.cancel();
                        while tasks.join_next().await.is_some() {}
                        return;
                    }
                },
            }
        }
        if failed {
            break;
        }
    }

    inner.finish(job_id, failed);
}

/// Run one item to completion. Returns its key and, when the failure
/// concerns the whole download tree rather than the item, the error that
/// must stop the engine.
async fn process(
    inner: Arc<Inner>,
    item: Arc<DownloadItem>,
    token: CancellationToken,
) -> (ItemKey, Option<DownloadError>) {
    let key = item.key();
    let source = item.source().name().to_string();
    item.set_status(DownloadStatus::Downloading);

    match download(&inner, &item, &token).await {
        Ok(()) => {
            item.set_status(DownloadStatus::Downloaded);
            DOWNLOADS_COMPLETED.with_label_values(&[source.as_str()]).inc();
            info!(entry = %item.entry().title, episode = %item.episode().name, "Download finished");
            inner.queue.remove(&item);
        }
        Err(e) if e.is_cancelled() || token.is_cancelled() => {
            debug!(?key, error = %e, "Download interrupted");
        }
        Err(e) if e.is_fatal() => {
            item.set_status(DownloadStatus::Error);
            DOWNLOADS_FAILED.with_label_values(&[source.as_str()]).inc();
            return (key, Some(e));
        }
        Err(e) => {
            item.set_status(DownloadStatus::Error);
            DOWNLOADS_FAILED.with_label_values(&[source.as_str()]).inc();
            error!(entry = %item.entry().title, episode = %item.episode().name, error = %e, "Download failed");
            inner.hooks.notifier.on_error(&e.to_string(), Some(&item));
        }
    }
    (key, None)
}

async fn download(
    inner: &Inner,
    item: &Arc<DownloadItem>,
    token: &CancellationToken,
) -> Result<(), DownloadError> {
    let source = item.source();
    let entry_dir = inner.resolver.entry_dir(source.as_ref(), item.entry());
    fs::create_dir_all(&entry_dir)
        .await
        .context(ConfigurationSnafu {
            path: entry_dir.clone(),
        })?;

    let free_space = Arc::clone(&inner.hooks.free_space);
    let target_dir = entry_dir.clone();
    let available = tokio::task::spawn_blocking(move || free_space.available(&target_dir))
        .await
        .ok()
        .flatten();
    ensure!(!token.is_cancelled(), CancelledSnafu);
    if let Some(available) = available {
        ensure!(
            available >= inner.config.min_free_space,
            InsufficientSpaceSnafu {
                available,
                required: inner.config.min_free_space,
            }
        );
    }

    let asset = if let Some(asset) = item.asset() {
        asset
    } else {
        let listed = tokio::select! {
            biased;
            () = token.cancelled() => return CancelledSnafu.fail(),
            listed = source.list_assets(item.entry(), item.episode()) => listed,
        };
        let asset = listed
            .map_err(|e| DownloadError::AssetResolution {
                episode: item.episode().name.clone(),
                message: e.to_string(),
            })?
            .into_iter()
            .next()
            .context(AssetResolutionSnafu {
                episode: item.episode().name.clone(),
                message: "source returned no assets",
            })?;
        item.set_asset(asset.clone());
        asset
    };

    let dir_name = PathResolver::episode_dir_name(item.episode());
    let workspace = entry_dir.join(format!("{dir_name}{TMP_DIR_SUFFIX}"));
    fs::create_dir_all(&workspace)
        .await
        .context(FileWriteSnafu {
            path: workspace.clone(),
        })?;
    let stale = transfer::remove_partial_files(&workspace).await?;
    if stale > 0 {
        debug!(workspace = %workspace.display(), stale, "Removed unfinished fragments");
    }

    item.set_progress(0);
    item.set_downloaded_parts(0);
    let progress = Arc::new(TransferProgress::new(asset.part_count()));
    let sampler = spawn_sampler(
        Arc::clone(item),
        Arc::clone(&progress),
        Arc::clone(&inner.hooks.notifier),
        inner.config.progress_interval,
    );
    let transferred = Transfer {
        source: source.as_ref(),
        byte_cache: inner.byte_cache.as_ref(),
        backoff: inner.config.backoff(),
        max_parts: inner.config.max_part_fetches,
        cancel: token,
        progress: &progress,
    }
    .run(&asset, &workspace, &PathResolver::video_file_stem(item.episode()))
    .await;
    sampler.abort();
    item.set_downloaded_parts(progress.parts_done());
    transferred?;
    item.set_progress(100);

    finalize(inner, item, &entry_dir, &workspace, &dir_name).await
}

fn spawn_sampler(
    item: Arc<DownloadItem>,
    progress: Arc<TransferProgress>,
    notifier: Arc<dyn Notifier>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            item.set_progress(progress.percent());
            item.set_downloaded_parts(progress.parts_done());
            notifier.on_progress(&item);
        }
    })
}

/// Promote a complete workspace to the canonical episode directory.
async fn finalize(
    inner: &Inner,
    item: &DownloadItem,
    entry_dir: &Path,
    workspace: &Path,
    dir_name: &str,
) -> Result<(), DownloadError> {
    let mut finished: usize = 0;
    let mut children = fs::read_dir(workspace).await.context(FileReadSnafu {
        path: workspace.to_path_buf(),
    })?;
    while let Some(child) = children.next_entry().await.context(FileReadSnafu {
        path: workspace.to_path_buf(),
    })? {
        let path = child.path();
        let is_file = child.file_type().await.is_ok_and(|kind| kind.is_file());
        let partial = path.extension().is_some_and(|ext| ext == PARTIAL_EXTENSION);
        let marker = child.file_name() == disk::NO_MEDIA_FILE;
        if is_file && !partial && !marker {
            finished += 1;
        }
    }
    ensure!(
        finished == 1,
        FinalizeIntegritySnafu {
            dir:   workspace.to_path_buf(),
            found: finished,
        }
    );

    // At most one copy per episode: an earlier download, under any of its
    // names, gives way to this one.
    for existing in PathResolver::episode_candidates(entry_dir, item.episode()) {
        let removed = disk::remove_path(&existing)
            .await
            .context(FileWriteSnafu {
                path: existing.clone(),
            })?;
        if removed {
            debug!(path = %existing.display(), "Replacing earlier download");
        }
    }
    inner.cache.remove_episode(item.entry(), item.episode()).await;

    let target = entry_dir.join(dir_name);
    fs::rename(workspace, &target)
        .await
        .context(FileWriteSnafu {
            path: target.clone(),
        })?;
    disk::create_no_media_file(&target).await;
    inner
        .cache
        .add_episode(item.entry(), dir_name, entry_dir)
        .await;
    Ok(())
}
