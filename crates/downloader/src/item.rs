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
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::{
    queue::QueueEvent,
    source::Source,
    types::{Asset, DownloadStatus, Entry, Episode, ItemKey},
};

/// One episode waiting for, or going through, a download.
///
/// Status and progress are published through watch channels so observers
/// always see the latest value. While the item sits in a queue, changes are
/// also announced on that queue's event channel.
pub struct DownloadItem {
    entry:            Arc<Entry>,
    episode:          Arc<Episode>,
    source:           Arc<dyn Source>,
    status:           watch::Sender<DownloadStatus>,
    progress:         watch::Sender<u8>,
    asset:            Mutex<Option<Asset>>,
    downloaded_parts: AtomicUsize,
    events:           Mutex<Option<broadcast::Sender<QueueEvent>>>,
}

impl DownloadItem {
    pub fn new(entry: Arc<Entry>, episode: Arc<Episode>, source: Arc<dyn Source>) -> Arc<Self> {
        let (status, _) = watch::channel(DownloadStatus::NotDownloaded);
        let (progress, _) = watch::channel(0);
        Arc::new(Self {
            entry,
            episode,
            source,
            status,
            progress,
            asset: Mutex::new(None),
            downloaded_parts: AtomicUsize::new(0),
            events: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn key(&self) -> ItemKey {
        ItemKey {
            entry_id:   self.entry.id,
            episode_id: self.episode.id,
        }
    }

    #[must_use]
    pub const fn entry(&self) -> &Arc<Entry> { &self.entry }

    #[must_use]
    pub const fn episode(&self) -> &Arc<Episode> { &self.episode }

    #[must_use]
    pub const fn source(&self) -> &Arc<dyn Source> { &self.source }

    #[must_use]
    pub fn status(&self) -> DownloadStatus { *self.status.borrow() }

    pub fn set_status(&self, status: DownloadStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            self.emit(QueueEvent::Status {
                key: self.key(),
                status,
            });
        }
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<DownloadStatus> { self.status.subscribe() }

    /// Transfer progress in percent.
    #[must_use]
    pub fn progress(&self) -> u8 { *self.progress.borrow() }

    pub(crate) fn set_progress(&self, progress: u8) {
        let progress = progress.min(100);
        let changed = self.progress.send_if_modified(|current| {
            if *current == progress {
                false
            } else {
                *current = progress;
                true
            }
        });
        if changed {
            self.emit(QueueEvent::Progress {
                key: self.key(),
                progress,
            });
        }
    }

    #[must_use]
    pub fn subscribe_progress(&self) -> watch::Receiver<u8> { self.progress.subscribe() }

    /// The asset chosen on the first successful resolution.
    #[must_use]
    pub fn asset(&self) -> Option<Asset> { self.asset.lock().clone() }

    pub(crate) fn set_asset(&self, asset: Asset) { *self.asset.lock() = Some(asset); }

    #[must_use]
    pub fn downloaded_parts(&self) -> usize { self.downloaded_parts.load(Ordering::Relaxed) }

    pub(crate) fn set_downloaded_parts(&self, parts: usize) {
        self.downloaded_parts.store(parts, Ordering::Relaxed);
    }

    pub(crate) fn attach(&self, events: broadcast::Sender<QueueEvent>) {
        *self.events.lock() = Some(events);
    }

    pub(crate) fn detach(&self) { *self.events.lock() = None; }

    fn emit(&self, event: QueueEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            // No subscribers is fine.
            let _ = events.send(event);
        }
    }
}

impl fmt::Debug for DownloadItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadItem")
            .field("source", &self.source.id())
            .field("entry", &self.entry.id)
            .field("episode", &self.episode.id)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .finish_non_exhaustive()
    }
}
