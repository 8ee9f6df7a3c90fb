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
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use backon::ExponentialBuilder;
use bon::Builder;
use jiff::SignedDuration;
use smart_default::SmartDefault;
use tokio::sync::watch;

const MIB: u64 = 1024 * 1024;

fn default_root_dir() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("kura")
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("kura")
}

fn default_byte_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("kura")
}

/// Configuration for the download engine
#[derive(Debug, Clone, SmartDefault, Builder)]
pub struct DownloaderConfig {
    /// Root of the download tree (default: user download dir / kura)
    #[default(default_root_dir())]
    #[builder(default = default_root_dir(), into)]
    pub root_dir: PathBuf,

    /// Where the persisted queue and pending deletions live (default: user
    /// data dir / kura)
    #[default(default_state_dir())]
    #[builder(default = default_state_dir(), into)]
    pub state_dir: PathBuf,

    /// Directory of the URL-keyed byte cache
    #[default(default_byte_cache_dir())]
    #[builder(default = default_byte_cache_dir(), into)]
    pub byte_cache_dir: PathBuf,

    /// How long a cached transfer stays usable
    #[default(SignedDuration::from_hours(24))]
    #[builder(default = SignedDuration::from_hours(24))]
    pub byte_cache_ttl: SignedDuration,

    /// Keep finished transfers in the byte cache
    #[default = true]
    #[builder(default = true)]
    pub cache_transfers: bool,

    /// Number of sources downloading at the same time
    #[default = 5]
    #[builder(default = 5)]
    pub max_source_groups: usize,

    /// Number of parts of one asset fetched at the same time
    #[default = 5]
    #[builder(default = 5)]
    pub max_part_fetches: usize,

    /// Minimum free space in bytes required before a download starts
    #[default(50 * MIB)]
    #[builder(default = 50 * MIB)]
    pub min_free_space: u64,

    /// Maximum age of the directory cache before it is rebuilt
    #[default(Duration::from_secs(60 * 60))]
    #[builder(default = Duration::from_secs(60 * 60))]
    pub renew_interval: Duration,

    /// How often progress is published while transferring
    #[default(Duration::from_millis(50))]
    #[builder(default = Duration::from_millis(50))]
    pub progress_interval: Duration,

    /// Retries of a failed fetch before the item fails
    #[default = 3]
    #[builder(default = 3)]
    pub max_retries: usize,

    /// Delay before the first retry, doubled on every further retry
    #[default(Duration::from_secs(2))]
    #[builder(default = Duration::from_secs(2))]
    pub retry_min_delay: Duration,

    /// Upper bound of the retry delay
    #[default(Duration::from_secs(8))]
    #[builder(default = Duration::from_secs(8))]
    pub retry_max_delay: Duration,

    /// Warn when an auto-started batch queues more items than this
    #[default = 20]
    #[builder(default = 20)]
    pub queue_warning_threshold: usize,

    /// Warn when an auto-started batch queues more items of one source than
    /// this
    #[default = 10]
    #[builder(default = 10)]
    pub source_warning_threshold: usize,

    /// Timeout for HTTP requests
    #[default(SignedDuration::from_secs(30))]
    #[builder(default = SignedDuration::from_secs(30))]
    pub http_timeout: SignedDuration,

    /// Custom User-Agent header
    pub user_agent: Option<String>,
}

impl DownloaderConfig {
    #[must_use]
    pub fn queue_file(&self) -> PathBuf { self.state_dir.join("queue.json") }

    #[must_use]
    pub fn pending_file(&self) -> PathBuf { self.state_dir.join("pending_deletions.json") }

    pub(crate) fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.retry_min_delay)
            .with_max_delay(self.retry_max_delay)
            .with_max_times(self.max_retries)
    }
}

/// The mutable location of the download tree.
///
/// Clones share the same value; readers always see the latest root and can
/// subscribe to changes.
#[derive(Debug, Clone)]
pub struct StorageRoot {
    tx: Arc<watch::Sender<PathBuf>>,
}

impl StorageRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (tx, _rx) = watch::channel(path.into());
        Self { tx: Arc::new(tx) }
    }

    #[must_use]
    pub fn get(&self) -> PathBuf { self.tx.borrow().clone() }

    pub fn set(&self, path: impl Into<PathBuf>) { self.tx.send_replace(path.into()); }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PathBuf> { self.tx.subscribe() }

    #[must_use]
    pub fn is(&self, path: &Path) -> bool { *self.tx.borrow() == path }
}
