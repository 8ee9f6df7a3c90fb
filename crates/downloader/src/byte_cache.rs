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

//! Short-lived cache of fetched assets keyed by their remote URL.

use std::path::{Path, PathBuf};

use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use tokio::{fs, io::AsyncReadExt};
use tracing::{debug, warn};

use crate::{
    error::{DownloadError, FileReadSnafu, FileWriteSnafu},
    metrics::BYTE_CACHE_HITS,
};

const CONTENT_FILE: &str = "content";
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheMetadata {
    url:       String,
    sha256:    String,
    size:      u64,
    /// Unix seconds
    cached_at: i64,
}

/// A cache hit.
#[derive(Debug, Clone)]
pub struct CachedAsset {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ByteCache {
    dir: PathBuf,
    ttl: SignedDuration,
}

impl ByteCache {
    pub const fn new(dir: PathBuf, ttl: SignedDuration) -> Self { Self { dir, ttl } }

    /// Look up `url`. Expired, mismatching or corrupted slots are dropped and
    /// reported as a miss.
    pub async fn get(&self, url: &str) -> Result<Option<CachedAsset>, DownloadError> {
        let slot = self.slot(url);
        let Some(metadata) = read_metadata(&slot).await else {
            return Ok(None);
        };
        if metadata.url != url {
            return Ok(None);
        }
        if self.is_expired(&metadata) {
            debug!(url, "Cached asset expired");
            remove_slot(&slot).await;
            return Ok(None);
        }

        let content = slot.join(CONTENT_FILE);
        if !fs::try_exists(&content).await.unwrap_or(false) {
            remove_slot(&slot).await;
            return Ok(None);
        }
        if sha256_of(&content).await? != metadata.sha256 {
            warn!(url, "Cached asset is corrupted, dropping it");
            remove_slot(&slot).await;
            return Ok(None);
        }

        BYTE_CACHE_HITS.inc();
        Ok(Some(CachedAsset {
            path: content,
            size: metadata.size,
        }))
    }

    /// Keep a copy of the finished transfer at `file` for `url`.
    pub async fn store(&self, url: &str, file: &Path) -> Result<(), DownloadError> {
        let slot = self.slot(url);
        fs::create_dir_all(&slot)
            .await
            .context(FileWriteSnafu { path: slot.clone() })?;

        let content = slot.join(CONTENT_FILE);
        let _ = fs::remove_file(&content).await;
        link_or_copy(file, &content).await?;

        let metadata = CacheMetadata {
            url:       url.to_string(),
            sha256:    sha256_of(&content).await?,
            size:      fs::metadata(&content)
                .await
                .context(FileReadSnafu {
                    path: content.clone(),
                })?
                .len(),
            cached_at: Timestamp::now().as_second(),
        };
        let json = serde_json::to_vec_pretty(&metadata).map_err(|e| DownloadError::Store {
            path:    slot.join(METADATA_FILE),
            message: e.to_string(),
        })?;
        let metadata_path = slot.join(METADATA_FILE);
        fs::write(&metadata_path, json)
            .await
            .context(FileWriteSnafu {
                path: metadata_path,
            })
    }

    /// Materialize a hit at `dest`.
    pub async fn restore(&self, cached: &CachedAsset, dest: &Path) -> Result<(), DownloadError> {
        let _ = fs::remove_file(dest).await;
        link_or_copy(&cached.path, dest).await
    }

    /// Drop every expired slot. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let Ok(mut slots) = fs::read_dir(&self.dir).await else {
            return 0;
        };
        let mut removed = 0;
        while let Ok(Some(slot)) = slots.next_entry().await {
            let path = slot.path();
            let expired = match read_metadata(&path).await {
                Some(metadata) => self.is_expired(&metadata),
                None => true,
            };
            if expired {
                remove_slot(&path).await;
                removed += 1;
            }
        }
        removed
    }

    fn slot(&self, url: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        self.dir.join(format!("{:x}", hasher.finalize()))
    }

    fn is_expired(&self, metadata: &CacheMetadata) -> bool {
        let age = Timestamp::now().as_second() - metadata.cached_at;
        age > self.ttl.as_secs()
    }
}

async fn read_metadata(slot: &Path) -> Option<CacheMetadata> {
    let raw = fs::read(slot.join(METADATA_FILE)).await.ok()?;
    serde_json::from_slice(&raw).ok()
}

async fn remove_slot(slot: &Path) { let _ = fs::remove_dir_all(slot).await; }

// Hard link first, copy across filesystems.
async fn link_or_copy(from: &Path, to: &Path) -> Result<(), DownloadError> {
    if fs::hard_link(from, to).await.is_err() {
        fs::copy(from, to)
            .await
            .context(FileWriteSnafu { path: to.to_path_buf() })?;
    }
    Ok(())
}

async fn sha256_of(path: &Path) -> Result<String, DownloadError> {
    let mut file = fs::File::open(path).await.context(FileReadSnafu {
        path: path.to_path_buf(),
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buffer).await.context(FileReadSnafu {
            path: path.to_path_buf(),
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
