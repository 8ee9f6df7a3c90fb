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

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Identifier of a remote source.
pub type SourceId = u64;

/// A title (series, show) offered by a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Builder)]
pub struct Entry {
    pub source_id: SourceId,
    pub id:        u64,
    #[builder(into)]
    pub title:     String,
    #[serde(default)]
    #[builder(default, into)]
    pub url:       String,
}

/// A single downloadable unit belonging to an [`Entry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Builder)]
pub struct Episode {
    pub id:           u64,
    pub entry_id:     u64,
    #[builder(into)]
    pub name:         String,
    /// Release group, part of the directory name when present
    #[serde(default)]
    #[builder(into)]
    pub scanlator:    Option<String>,
    /// Position in the source listing, higher means newer
    #[serde(default)]
    #[builder(default)]
    pub source_order: i64,
    #[serde(default)]
    #[builder(default, into)]
    pub url:          String,
}

/// A resolved media asset of an episode.
///
/// An asset without `parts` is fetched from `url` in one piece. An asset with
/// parts is fetched part by part and concatenated in order into a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct Asset {
    #[builder(into)]
    pub url:    String,
    /// Container format, used as the extension of the finished file
    #[builder(into)]
    pub format: String,
    #[serde(default)]
    #[builder(default)]
    pub parts:  Vec<String>,
}

impl Asset {
    #[must_use]
    pub fn is_multi_part(&self) -> bool { !self.parts.is_empty() }

    #[must_use]
    pub fn part_count(&self) -> usize {
        if self.parts.is_empty() {
            1
        } else {
            self.parts.len()
        }
    }

    /// The single-piece asset fetching one part of `self`.
    pub(crate) fn part(&self, url: &str) -> Self {
        Self {
            url:    url.to_string(),
            format: self.format.clone(),
            parts:  Vec::new(),
        }
    }
}

/// Status of a download item.
///
/// The declaration order is meaningful: everything up to and including
/// [`DownloadStatus::Downloading`] is still work for the engine.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum DownloadStatus {
    NotDownloaded,
    Queued,
    Downloading,
    Downloaded,
    Error,
}

impl DownloadStatus {
    #[must_use]
    pub fn is_pending(self) -> bool { self <= Self::Downloading }
}

/// Run state of the download engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Running,
    Paused,
}

/// Identity of a download item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub entry_id:   u64,
    pub episode_id: u64,
}

impl ItemKey {
    #[must_use]
    pub const fn of(entry: &Entry, episode: &Episode) -> Self {
        Self {
            entry_id:   entry.id,
            episode_id: episode.id,
        }
    }
}
