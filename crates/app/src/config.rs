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

use std::path::{Path, PathBuf};

use bon::Builder;
use kura_common_telemetry::LoggingOptions;
use kura_downloader::DownloaderConfig;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::{ResultExt, Whatever};

const MIB: u64 = 1024 * 1024;

/// Configuration of the application, read from an optional JSON file.
#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault, Builder)]
#[serde(default)]
pub struct AppConfig {
    /// Manifest listing sources, entries and their media
    #[default(PathBuf::from("manifest.json"))]
    #[builder(default = PathBuf::from("manifest.json"), into)]
    pub manifest:  PathBuf,
    #[builder(default)]
    pub logging:   LoggingOptions,
    #[builder(default)]
    pub downloads: DownloadSettings,
}

/// User-facing subset of the download engine settings.
///
/// Unset directories fall back to the platform defaults of
/// [`DownloaderConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct DownloadSettings {
    pub root_dir:          Option<PathBuf>,
    pub state_dir:         Option<PathBuf>,
    pub byte_cache_dir:    Option<PathBuf>,
    #[default = 5]
    pub max_source_groups: usize,
    #[default = 50]
    pub min_free_space_mb: u64,
    #[default = 3]
    pub max_retries:       usize,
    #[default = true]
    pub cache_transfers:   bool,
    #[default = 30]
    pub http_timeout_secs: u64,
    pub user_agent:        Option<String>,
}

impl DownloadSettings {
    #[must_use]
    pub fn to_config(&self) -> DownloaderConfig {
        let mut config = DownloaderConfig {
            max_source_groups: self.max_source_groups.max(1),
            min_free_space: self.min_free_space_mb.saturating_mul(MIB),
            max_retries: self.max_retries,
            cache_transfers: self.cache_transfers,
            http_timeout: std::time::Duration::from_secs(self.http_timeout_secs)
                .try_into()
                .unwrap_or_default(),
            user_agent: self.user_agent.clone(),
            ..DownloaderConfig::default()
        };
        if let Some(dir) = &self.root_dir {
            config.root_dir.clone_from(dir);
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir.clone_from(dir);
        }
        if let Some(dir) = &self.byte_cache_dir {
            config.byte_cache_dir.clone_from(dir);
        }
        config
    }
}

impl AppConfig {
    /// Read the configuration at `path`, or the defaults when no path is
    /// given.
    pub fn load(path: Option<&Path>) -> Result<Self, Whatever> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_whatever_context(|_| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_whatever_context(|_| format!("Invalid config {}", path.display()))
    }
}
