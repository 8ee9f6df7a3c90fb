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

//! Naming of the on-disk download tree:
//! `<root>/<source>/<entry>/<episode>`.

use std::path::{Path, PathBuf};

use crate::{
    config::StorageRoot,
    source::Source,
    types::{Entry, Episode},
};

/// Suffix of directories whose download has not finished.
pub const TMP_DIR_SUFFIX: &str = "_tmp";

/// Extensions of finished episodes stored as a bare file.
pub const VIDEO_EXTENSIONS: [&str; 2] = ["mkv", "mp4"];

const MAX_NAME_BYTES: usize = 240;

const BLANK_EPISODE_NAME: &str = "Episode";

/// Make `name` usable as a single path component on every common filesystem.
///
/// Returns an empty string when nothing usable is left.
#[must_use]
pub fn sanitize(name: &str) -> String {
    let trimmed = name.trim_matches(|c: char| c == '.' || c == ' ');
    let mut out = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        let invalid = c.is_ascii_control()
            || matches!(c, '"' | '*' | '/' | ':' | '<' | '>' | '?' | '\\' | '|');
        let c = if invalid { '_' } else { c };
        if out.len() + c.len_utf8() > MAX_NAME_BYTES {
            break;
        }
        out.push(c);
    }
    out
}

fn sanitize_or(name: &str, fallback: impl FnOnce() -> String) -> String {
    let sanitized = sanitize(name);
    if sanitized.is_empty() {
        fallback()
    } else {
        sanitized
    }
}

/// Resolves names and locations inside the download tree.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: StorageRoot,
}

impl PathResolver {
    pub const fn new(root: StorageRoot) -> Self { Self { root } }

    #[must_use]
    pub fn root(&self) -> PathBuf { self.root.get() }

    #[must_use]
    pub const fn storage_root(&self) -> &StorageRoot { &self.root }

    #[must_use]
    pub fn source_dir(&self, source: &dyn Source) -> PathBuf {
        self.root().join(Self::source_dir_name(source))
    }

    #[must_use]
    pub fn entry_dir(&self, source: &dyn Source, entry: &Entry) -> PathBuf {
        self.source_dir(source).join(Self::entry_dir_name(entry))
    }

    #[must_use]
    pub fn episode_dir(&self, source: &dyn Source, entry: &Entry, episode: &Episode) -> PathBuf {
        self.entry_dir(source, entry)
            .join(Self::episode_dir_name(episode))
    }

    #[must_use]
    pub fn source_dir_name(source: &dyn Source) -> String {
        sanitize_or(source.name(), || source.id().to_string())
    }

    #[must_use]
    pub fn entry_dir_name(entry: &Entry) -> String {
        sanitize_or(&entry.title, || entry.id.to_string())
    }

    /// Directory name of an episode under the current naming scheme.
    #[must_use]
    pub fn episode_dir_name(episode: &Episode) -> String {
        let name = if episode.name.trim().is_empty() {
            BLANK_EPISODE_NAME
        } else {
            episode.name.as_str()
        };
        let raw = match non_blank(episode.scanlator.as_deref()) {
            Some(scanlator) => format!("{scanlator}_{name}"),
            None => name.to_string(),
        };
        sanitize_or(&raw, || episode.id.to_string())
    }

    /// File name, without extension, of the media file inside an episode
    /// directory.
    #[must_use]
    pub fn video_file_stem(episode: &Episode) -> String {
        sanitize_or(&episode.name, || BLANK_EPISODE_NAME.to_string())
    }

    /// Every directory name an episode may have been stored under, current
    /// scheme first.
    #[must_use]
    pub fn valid_episode_dir_names(episode: &Episode) -> Vec<String> {
        let mut names = vec![Self::episode_dir_name(episode)];
        let legacy = match episode.scanlator.as_deref() {
            Some(scanlator) => sanitize(&format!("{scanlator}_{}", episode.name)),
            None => sanitize(&episode.name),
        };
        if !legacy.is_empty() && !names.contains(&legacy) {
            names.push(legacy);
        }
        names
    }

    /// Candidate paths of a finished episode inside `entry_dir`: the episode
    /// directories plus bare video files named after them.
    #[must_use]
    pub fn episode_candidates(entry_dir: &Path, episode: &Episode) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for name in Self::valid_episode_dir_names(episode) {
            paths.push(entry_dir.join(&name));
            for ext in VIDEO_EXTENSIONS {
                paths.push(entry_dir.join(format!("{name}.{ext}")));
            }
        }
        paths
    }

    /// Whether a metadata update moves the episode to another directory.
    #[must_use]
    pub fn episode_dir_name_changed(old: &Episode, new: &Episode) -> bool {
        old.name != new.name
            || non_blank(old.scanlator.as_deref()) != non_blank(new.scanlator.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> { value.filter(|v| !v.trim().is_empty()) }
