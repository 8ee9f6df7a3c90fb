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

use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::error;

use crate::{
    item::DownloadItem,
    store::{QueueRecord, QueueStore},
    types::{DownloadStatus, Entry, Episode, ItemKey},
};

const EVENT_CAPACITY: usize = 256;

/// Something observable happened to the queue or one of its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// Items were added, removed or reordered.
    Changed,
    Status { key: ItemKey, status: DownloadStatus },
    Progress { key: ItemKey, progress: u8 },
}

/// The ordered list of pending downloads.
///
/// Every mutation is written through to the [`QueueStore`] before the call
/// returns.
#[derive(Debug)]
pub struct DownloadQueue {
    items:  Mutex<Vec<Arc<DownloadItem>>>,
    store:  QueueStore,
    events: broadcast::Sender<QueueEvent>,
}

impl DownloadQueue {
    pub fn new(store: QueueStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            items: Mutex::new(Vec::new()),
            store,
            events,
        }
    }

    /// Subscribe to queue events. Slow subscribers lose the oldest events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> { self.events.subscribe() }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<DownloadItem>> { self.items.lock().clone() }

    #[must_use]
    pub fn len(&self) -> usize { self.items.lock().len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.items.lock().is_empty() }

    #[must_use]
    pub fn contains(&self, entry: &Entry, episode: &Episode) -> bool {
        let key = ItemKey::of(entry, episode);
        self.items.lock().iter().any(|item| item.key() == key)
    }

    #[must_use]
    pub fn find(&self, key: ItemKey) -> Option<Arc<DownloadItem>> {
        self.items
            .lock()
            .iter()
            .find(|item| item.key() == key)
            .cloned()
    }

    /// Append `items`, skipping any whose key is already queued. Returns the
    /// number of items added.
    pub fn add(&self, items: Vec<Arc<DownloadItem>>) -> usize {
        let added = {
            let mut queued = self.items.lock();
            let mut keys: HashSet<ItemKey> = queued.iter().map(|item| item.key()).collect();
            let mut added = 0;
            for item in items {
                if !keys.insert(item.key()) {
                    continue;
                }
                item.attach(self.events.clone());
                item.set_status(DownloadStatus::Queued);
                queued.push(item);
                added += 1;
            }
            if added > 0 {
                self.persist(&queued);
            }
            added
        };
        if added > 0 {
            self.notify();
        }
        added
    }

    pub fn remove(&self, item: &DownloadItem) -> bool {
        let key = item.key();
        self.remove_where(|queued| queued.key() == key, true) > 0
    }

    pub fn remove_episodes(&self, episodes: &[Episode]) -> usize {
        let keys: HashSet<ItemKey> = episodes
            .iter()
            .map(|episode| ItemKey {
                entry_id:   episode.entry_id,
                episode_id: episode.id,
            })
            .collect();
        self.remove_where(|item| keys.contains(&item.key()), true)
    }

    pub fn remove_entry(&self, entry: &Entry) -> usize {
        self.remove_where(
            |item| item.entry().id == entry.id && item.entry().source_id == entry.source_id,
            true,
        )
    }

    /// Empty the queue. With `reset_statuses`, queued and downloading items
    /// go back to [`DownloadStatus::NotDownloaded`].
    pub fn clear(&self, reset_statuses: bool) { self.remove_where(|_| true, reset_statuses); }

    /// Replace the queue with `order`. Items missing from `order` are removed;
    /// new ones are attached and queued.
    pub fn reorder(&self, order: Vec<Arc<DownloadItem>>) {
        {
            let mut queued = self.items.lock();
            let mut keys = HashSet::new();
            let order: Vec<_> = order
                .into_iter()
                .filter(|item| keys.insert(item.key()))
                .collect();

            for item in queued.iter() {
                if !keys.contains(&item.key()) {
                    Self::release(item, true);
                }
            }
            for item in &order {
                item.attach(self.events.clone());
                if item.status() == DownloadStatus::NotDownloaded {
                    item.set_status(DownloadStatus::Queued);
                }
            }
            *queued = order;
            self.persist(&queued);
        }
        self.notify();
    }

    fn remove_where(&self, predicate: impl Fn(&DownloadItem) -> bool, reset: bool) -> usize {
        let removed = {
            let mut queued = self.items.lock();
            let before = queued.len();
            queued.retain(|item| {
                if predicate(&**item) {
                    Self::release(item, reset);
                    false
                } else {
                    true
                }
            });
            let removed = before - queued.len();
            if removed > 0 {
                self.persist(&queued);
            }
            removed
        };
        if removed > 0 {
            self.notify();
        }
        removed
    }

    fn release(item: &DownloadItem, reset: bool) {
        if reset
            && matches!(
                item.status(),
                DownloadStatus::Queued | DownloadStatus::Downloading
            )
        {
            item.set_status(DownloadStatus::NotDownloaded);
        }
        item.detach();
    }

    fn persist(&self, items: &[Arc<DownloadItem>]) {
        let records: Vec<QueueRecord> = items
            .iter()
            .enumerate()
            .map(|(order, item)| QueueRecord {
                source_id: item.entry().source_id,
                entry_id: item.entry().id,
                episode_id: item.episode().id,
                order,
            })
            .collect();
        if let Err(e) = self.store.save(&records) {
            error!(error = %e, "Failed to persist download queue");
        }
    }

    fn notify(&self) { let _ = self.events.send(QueueEvent::Changed); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{entry, episode, source};

    fn item(entry_id: u64, episode_id: u64) -> Arc<DownloadItem> {
        DownloadItem::new(
            Arc::new(entry(1, entry_id, "Show")),
            Arc::new(episode(entry_id, episode_id, &format!("Ep {episode_id}"))),
            source(1, "Example"),
        )
    }

    fn queue_in(dir: &std::path::Path) -> DownloadQueue {
        DownloadQueue::new(QueueStore::new(dir.join("queue.json")))
    }

    #[test]
    fn add_skips_duplicates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(dir.path());
        let first = item(10, 1);

        assert_eq!(queue.add(vec![first.clone(), item(10, 1), item(10, 2)]), 2);
        assert_eq!(queue.add(vec![item(10, 2)]), 0);
        assert_eq!(first.status(), DownloadStatus::Queued);
        assert_eq!(queue.len(), 2);

        let records = QueueStore::new(dir.path().join("queue.json")).load().unwrap();
        let episodes: Vec<u64> = records.iter().map(|record| record.episode_id).collect();
        assert_eq!(episodes, vec![1, 2]);
    }

    #[test]
    fn removal_resets_pending_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(dir.path());
        let queued = item(10, 1);
        let downloading = item(10, 2);
        let failed = item(11, 3);
        queue.add(vec![queued.clone(), downloading.clone(), failed.clone()]);
        downloading.set_status(DownloadStatus::Downloading);
        failed.set_status(DownloadStatus::Error);

        assert_eq!(queue.remove_episodes(&[(**downloading.episode()).clone()]), 1);
        assert_eq!(downloading.status(), DownloadStatus::NotDownloaded);

        assert_eq!(queue.remove_entry(failed.entry()), 1);
        assert_eq!(failed.status(), DownloadStatus::Error);

        assert!(queue.remove(&queued));
        assert_eq!(queued.status(), DownloadStatus::NotDownloaded);
        assert!(queue.is_empty());
    }

    #[test]
    fn episodes_are_matched_with_their_entry() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(dir.path());
        let (show, other) = (item(10, 1), item(11, 1));
        queue.add(vec![show.clone(), other.clone()]);

        assert!(Arc::ptr_eq(&queue.find(other.key()).unwrap(), &other));
        assert_eq!(queue.remove_episodes(&[(**show.episode()).clone()]), 1);
        assert_eq!(show.status(), DownloadStatus::NotDownloaded);
        assert_eq!(other.status(), DownloadStatus::Queued);
        assert!(queue.find(show.key()).is_none());
        assert!(queue.find(other.key()).is_some());
    }

    #[test]
    fn clear_optionally_keeps_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(dir.path());
        let kept = item(10, 1);
        queue.add(vec![kept.clone()]);
        queue.clear(false);
        assert_eq!(kept.status(), DownloadStatus::Queued);

        let reset = item(10, 2);
        queue.add(vec![reset.clone()]);
        queue.clear(true);
        assert_eq!(reset.status(), DownloadStatus::NotDownloaded);
        assert!(
            QueueStore::new(dir.path().join("queue.json"))
                .load()
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn reorder_replaces_order_and_drops_missing() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(dir.path());
        let (a, b, c) = (item(10, 1), item(10, 2), item(10, 3));
        queue.add(vec![a.clone(), b.clone(), c.clone()]);

        queue.reorder(vec![c.clone(), a.clone(), c.clone()]);
        let order: Vec<u64> = queue.snapshot().iter().map(|i| i.episode().id).collect();
        assert_eq!(order, vec![3, 1]);
        assert_eq!(b.status(), DownloadStatus::NotDownloaded);
        assert!(queue.find(b.key()).is_none());
        assert!(queue.contains(a.entry(), a.episode()));
    }

    #[tokio::test]
    async fn events_follow_queue_and_item_changes() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue_in(dir.path());
        let mut events = queue.subscribe();
        let queued = item(10, 1);

        queue.add(vec![queued.clone()]);
        assert_eq!(
            events.recv().await.unwrap(),
            QueueEvent::Status {
                key:    queued.key(),
                status: DownloadStatus::Queued,
            }
        );
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Changed);

        queued.set_progress(40);
        assert_eq!(
            events.recv().await.unwrap(),
            QueueEvent::Progress {
                key:      queued.key(),
                progress: 40,
            }
        );

        queue.remove(&queued);
        let _ = events.recv().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Changed);

        // Detached items stay silent.
        queued.set_progress(80);
        assert!(events.try_recv().is_err());
    }
}
