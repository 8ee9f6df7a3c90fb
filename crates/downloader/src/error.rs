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

use std::path::PathBuf;

use snafu::Snafu;

use crate::source::SourceError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DownloadError {
    #[snafu(display("Download location {} is unusable: {source}", path.display()))]
    Configuration {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Not enough free space: {available} bytes available, {required} required"))]
    InsufficientSpace { available: u64, required: u64 },

    #[snafu(display("No asset for episode '{episode}': {message}"))]
    AssetResolution { episode: String, message: String },

    #[snafu(display("Fetch of {url} failed: {source}"))]
    Fetch { url: String, source: SourceError },

    #[snafu(display("Transfer of {url} failed after {attempts} attempts: {message}"))]
    Transfer {
        url:      String,
        attempts: usize,
        message:  String,
    },

    #[snafu(display("Expected exactly one file in {}, found {found}", dir.display()))]
    FinalizeIntegrity { dir: PathBuf, found: usize },

    #[snafu(display("File write error at {}: {source}", path.display()))]
    FileWrite {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("File read error at {}: {source}", path.display()))]
    FileRead {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Queue store error at {}: {message}", path.display()))]
    Store { path: PathBuf, message: String },

    #[snafu(display("Unknown source {source_id}"))]
    UnknownSource { source_id: u64 },

    #[snafu(display("Download cancelled"))]
    Cancelled,
}

impl DownloadError {
    /// Whether another attempt of the same fetch may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch { source, .. } => source.is_retryable(),
            Self::FileWrite { .. } | Self::FileRead { .. } => true,
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool { matches!(self, Self::Cancelled) }

    /// Whether the error makes every further download fail, so the engine
    /// stops instead of moving on to the next item.
    #[must_use]
    pub const fn is_fatal(&self) -> bool { matches!(self, Self::Configuration { .. }) }
}
