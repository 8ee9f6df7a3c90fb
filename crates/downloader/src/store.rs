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
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{error::DownloadError, types::SourceId};

/// A queued download as persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub source_id:  SourceId,
    pub entry_id:   u64,
    pub episode_id: u64,
    pub order:      usize,
}

/// Durable copy of the download queue, kept in a single JSON file.
///
/// Writes go to a sibling temp file that is renamed over the previous copy,
/// so a crash leaves either the old or the new queue behind.
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    #[must_use]
    pub fn path(&self) -> &Path { &self.path }

    /// Replace the persisted queue with `records`.
    pub fn save(&self, records: &[QueueRecord]) -> Result<(), DownloadError> {
        let json = serde_json::to_vec_pretty(records).map_err(|e| self.error(&e))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.error(&e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(|e| self.error(&e))?;
        file.write_all(&json).map_err(|e| self.error(&e))?;
        file.sync_all().map_err(|e| self.error(&e))?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(|e| self.error(&e))?;
        Ok(())
    }

    /// Read the persisted queue in its stored order.
    ///
    /// A missing file is an empty queue. A corrupted file is discarded with a
    /// warning instead of blocking startup.
    pub fn load(&self) -> Result<Vec<QueueRecord>, DownloadError> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.error(&e)),
        };
        match serde_json::from_slice::<Vec<QueueRecord>>(&content) {
            Ok(mut records) => {
                records.sort_by_key(|record| record.order);
                Ok(records)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Discarding unreadable download queue");
                Ok(Vec::new())
            }
        }
    }

    pub fn clear(&self) -> Result<(), DownloadError> { self.save(&[]) }

    fn error(&self, e: &dyn std::error::Error) -> DownloadError {
        DownloadError::Store {
            path:    self.path.clone(),
            message: e.to_string(),
        }
    }
}
