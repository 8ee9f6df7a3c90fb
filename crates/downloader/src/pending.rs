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

use std::{collections::BTreeMap, io, path::PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::{fs, sync::Mutex};
use tracing::warn;

use crate::{
    error::{DownloadError, FileReadSnafu, FileWriteSnafu},
    types::{Entry, Episode},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingEntry {
    entry:    Entry,
    episodes: Vec<Episode>,
}

/// Episodes whose files should be deleted later, typically once they are no
/// longer open anywhere.
///
/// Stored as JSON keyed by `<source>:<entry>`, each entry listing its
/// episodes once.
#[derive(Debug)]
pub struct PendingDeleter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PendingDeleter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Record `episodes` of `entry` for deletion. Returns how many were new.
    pub async fn add(&self, entry: &Entry, episodes: &[Episode]) -> Result<usize, DownloadError> {
        let _guard = self.lock.lock().await;
        let mut pending = self.read().await?;
        let slot = pending
            .entry(key(entry))
            .or_insert_with(|| PendingEntry {
                entry:    entry.clone(),
                episodes: Vec::new(),
            });
        slot.entry = entry.clone();

        let mut added = 0;
        for episode in episodes {
            if slot.episodes.iter().all(|known| known.id != episode.id) {
                slot.episodes.push(episode.clone());
                added += 1;
            }
        }
        if added > 0 {
            self.write(&pending).await?;
        }
        Ok(added)
    }

    /// Take every recorded deletion, leaving the store empty.
    pub async fn take(&self) -> Result<Vec<(Entry, Vec<Episode>)>, DownloadError> {
        let _guard = self.lock.lock().await;
        let pending = self.read().await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        self.write(&BTreeMap::new()).await?;
        Ok(pending
            .into_values()
            .map(|slot| (slot.entry, slot.episodes))
            .collect())
    }

    async fn read(&self) -> Result<BTreeMap<String, PendingEntry>, DownloadError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(e).context(FileReadSnafu {
                    path: self.path.clone(),
                });
            }
        };
        Ok(serde_json::from_slice(&raw).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Discarding unreadable pending deletions");
            BTreeMap::new()
        }))
    }

    async fn write(&self, pending: &BTreeMap<String, PendingEntry>) -> Result<(), DownloadError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.context(FileWriteSnafu {
                path: parent.to_path_buf(),
            })?;
        }
        let json = serde_json::to_vec_pretty(pending).map_err(|e| DownloadError::Store {
            path:    self.path.clone(),
            message: e.to_string(),
        })?;
        fs::write(&self.path, json).await.context(FileWriteSnafu {
            path: self.path.clone(),
        })
    }
}

fn key(entry: &Entry) -> String { format!("{}:{}", entry.source_id, entry.id) }
