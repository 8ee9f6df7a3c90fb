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

#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use kura_downloader::{
    Asset, Catalog, DownloadManager, DownloaderConfig, EngineHooks, EngineState, Entry, Episode,
    Fetched, FreeSpace, Notifier, ServiceLifecycle, Source, SourceError, SourceId,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::watch;

pub fn create_temp_dir(prefix: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(&format!("kura-{prefix}-"))
        .tempdir()
        .expect("failed to create temp dir")
}

/// Config rooted in `dir` with fast retries and no byte cache.
pub fn test_config(dir: &Path) -> DownloaderConfig {
    DownloaderConfig::builder()
        .root_dir(dir.join("library"))
        .state_dir(dir.join("state"))
        .byte_cache_dir(dir.join("byte-cache"))
        .cache_transfers(false)
        .min_free_space(0)
        .retry_min_delay(Duration::from_millis(1))
        .retry_max_delay(Duration::from_millis(5))
        .progress_interval(Duration::from_millis(5))
        .build()
}

pub fn entry(source_id: SourceId, id: u64, title: &str) -> Entry {
    Entry::builder()
        .source_id(source_id)
        .id(id)
        .title(title)
        .build()
}

pub fn episode(entry_id: u64, id: u64, name: &str, source_order: i64) -> Episode {
    Episode::builder()
        .id(id)
        .entry_id(entry_id)
        .name(name)
        .source_order(source_order)
        .build()
}

/// Media bytes served for an episode.
pub fn content_of(entry_id: u64, episode_id: u64) -> Vec<u8> {
    format!("media-{entry_id}-{episode_id}|").repeat(256).into_bytes()
}

/// Concurrency bookkeeping shared by every [`MockSource`] of a test.
#[derive(Debug, Default)]
pub struct Tracker {
    active:     AtomicUsize,
    max_active: AtomicUsize,
    per_source: Mutex<HashMap<SourceId, usize>>,
    /// Highest number of simultaneous fetches seen for one source.
    max_per_source: AtomicUsize,
}

impl Tracker {
    pub fn max_active(&self) -> usize { self.max_active.load(Ordering::SeqCst) }

    pub fn max_per_source(&self) -> usize { self.max_per_source.load(Ordering::SeqCst) }

    fn enter(&self, source: SourceId) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let mut per_source = self.per_source.lock();
        let count = per_source.entry(source).or_default();
        *count += 1;
        self.max_per_source.fetch_max(*count, Ordering::SeqCst);
    }

    fn exit(&self, source: SourceId) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(count) = self.per_source.lock().get_mut(&source) {
            *count -= 1;
        }
    }
}

/// In-memory source. Every episode resolves to a single `mp4` asset whose
/// body is [`content_of`].
pub struct MockSource {
    id:        SourceId,
    name:      String,
    /// Fetches that fail before the first success, per URL
    failures:  Mutex<HashMap<String, usize>>,
    fetches:   AtomicUsize,
    delay:     Duration,
    gate:      Option<watch::Receiver<bool>>,
    tracker:   Arc<Tracker>,
    multipart: bool,
}

impl MockSource {
    pub fn new(id: SourceId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            failures: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
            delay: Duration::ZERO,
            gate: None,
            tracker: Arc::new(Tracker::default()),
            multipart: false,
        }
    }

    /// Hold every fetch for `delay`.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Block every fetch until the gate reads `true`.
    #[must_use]
    pub fn with_gate(mut self, gate: watch::Receiver<bool>) -> Self {
        self.gate = Some(gate);
        self
    }

    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<Tracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Serve every episode as a three-part asset.
    #[must_use]
    pub const fn multipart(mut self) -> Self {
        self.multipart = true;
        self
    }

    /// Make the next `count` fetches of the episode fail with a transient
    /// error.
    pub fn fail_next(&self, entry_id: u64, episode_id: u64, count: usize) {
        self.failures
            .lock()
            .insert(Self::url(entry_id, episode_id), count);
    }

    pub fn fetches(&self) -> usize { self.fetches.load(Ordering::SeqCst) }

    fn url(entry_id: u64, episode_id: u64) -> String {
        format!("mock://{entry_id}/{episode_id}")
    }

    fn body(url: &str) -> Option<Vec<u8>> {
        let rest = url.strip_prefix("mock://")?;
        let (ids, part) = match rest.split_once('#') {
            Some((ids, part)) => (ids, Some(part.parse::<usize>().ok()?)),
            None => (rest, None),
        };
        let (entry_id, episode_id) = ids.split_once('/')?;
        let content = content_of(entry_id.parse().ok()?, episode_id.parse().ok()?);
        Some(match part {
            None => content,
            Some(index) => {
                let third = content.len().div_ceil(3);
                content
                    .chunks(third)
                    .nth(index)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default()
            }
        })
    }
}

#[async_trait]
impl Source for MockSource {
    fn id(&self) -> SourceId { self.id }

    fn name(&self) -> &str { &self.name }

    async fn list_assets(&self, entry: &Entry, episode: &Episode) -> Result<Vec<Asset>, SourceError> {
        let url = Self::url(entry.id, episode.id);
        let parts = if self.multipart {
            (0..3).map(|index| format!("{url}#{index}")).collect()
        } else {
            Vec::new()
        };
        Ok(vec![Asset::builder().url(url).format("mp4").parts(parts).build()])
    }

    async fn fetch(&self, asset: &Asset) -> Result<Fetched, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.tracker.enter(self.id);
        if let Some(mut gate) = self.gate.clone() {
            let _ = gate.wait_for(|open| *open).await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.tracker.exit(self.id);

        let episode_url = asset.url.split('#').next().unwrap_or_default().to_string();
        {
            let mut failures = self.failures.lock();
            if let Some(left) = failures.get_mut(&episode_url) {
                if *left > 0 {
                    *left -= 1;
                    return Err(SourceError::Unavailable {
                        message: format!("{} is flaky", asset.url),
                    });
                }
            }
        }

        let body = Self::body(&asset.url).ok_or_else(|| SourceError::Unavailable {
            message: format!("no such asset {}", asset.url),
        })?;
        let chunks: Vec<Result<Bytes, SourceError>> = body
            .chunks(1024)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(Fetched {
            content_length: Some(body.len() as u64),
            stream:         futures::stream::iter(chunks).boxed(),
        })
    }
}

/// Catalog over a fixed set of sources and entries.
#[derive(Default)]
pub struct MockCatalog {
    sources: Vec<Arc<MockSource>>,
    entries: Vec<(Entry, Vec<Episode>)>,
}

impl MockCatalog {
    #[must_use]
    pub fn with_source(mut self, source: Arc<MockSource>) -> Self {
        self.sources.push(source);
        self
    }

    #[must_use]
    pub fn with_entry(mut self, entry: Entry, episodes: Vec<Episode>) -> Self {
        self.entries.push((entry, episodes));
        self
    }
}

#[async_trait]
impl Catalog for MockCatalog {
    fn source(&self, id: SourceId) -> Option<Arc<dyn Source>> {
        self.sources
            .iter()
            .find(|source| source.id == id)
            .map(|source| Arc::clone(source) as Arc<dyn Source>)
    }

    fn sources(&self) -> Vec<Arc<dyn Source>> {
        self.sources
            .iter()
            .map(|source| Arc::clone(source) as Arc<dyn Source>)
            .collect()
    }

    async fn hydrate(
        &self,
        source_id: SourceId,
        entry_id: u64,
        episode_id: u64,
    ) -> Option<(Entry, Episode)> {
        let (entry, episodes) = self
            .entries
            .iter()
            .find(|(entry, _)| entry.source_id == source_id && entry.id == entry_id)?;
        let episode = episodes.iter().find(|episode| episode.id == episode_id)?;
        Some((entry.clone(), episode.clone()))
    }
}

/// Notifier that records what it was told.
#[derive(Default)]
pub struct RecordingNotifier {
    pub warnings:  Mutex<Vec<String>>,
    pub errors:    Mutex<Vec<String>>,
    pub paused:    AtomicUsize,
    pub completed: AtomicUsize,
}

impl Notifier for RecordingNotifier {
    fn on_warning(&self, message: &str) { self.warnings.lock().push(message.to_string()); }

    fn on_error(&self, message: &str, _item: Option<&kura_downloader::DownloadItem>) {
        self.errors.lock().push(message.to_string());
    }

    fn on_paused(&self) { self.paused.fetch_add(1, Ordering::SeqCst); }

    fn on_complete(&self) { self.completed.fetch_add(1, Ordering::SeqCst); }
}

/// Reports a fixed number of free bytes.
pub struct FixedFreeSpace(pub u64);

impl FreeSpace for FixedFreeSpace {
    fn available(&self, _: &Path) -> Option<u64> { Some(self.0) }
}

/// Takes `delay` to answer and leaves the check to the engine's default by
/// reporting nothing. Counts how often it was asked.
pub struct SlowFreeSpace {
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowFreeSpace {
    pub const fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

impl FreeSpace for SlowFreeSpace {
    fn available(&self, _: &Path) -> Option<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        None
    }
}

/// Lifecycle that counts its calls.
#[derive(Default)]
pub struct CountingLifecycle {
    pub starts: AtomicUsize,
    pub stops:  AtomicUsize,
}

impl ServiceLifecycle for CountingLifecycle {
    fn on_start(&self) { self.starts.fetch_add(1, Ordering::SeqCst); }

    fn on_stop(&self) { self.stops.fetch_add(1, Ordering::SeqCst); }
}

pub fn hooks(notifier: Arc<RecordingNotifier>) -> EngineHooks {
    EngineHooks {
        notifier,
        ..EngineHooks::default()
    }
}

/// Wait until the engine has stopped.
pub async fn wait_until_stopped(manager: &DownloadManager) {
    let mut state = manager.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|state| *state == EngineState::Stopped),
    )
    .await
    .expect("engine did not stop in time")
    .expect("engine state channel closed");
}
