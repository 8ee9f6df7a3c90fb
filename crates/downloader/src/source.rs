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

//! Remote collaborators: sources that resolve and serve episode assets, and
//! the catalog that knows every installed source.

mod http;

use std::{fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use snafu::Snafu;

pub use self::http::{
    HttpSource, Manifest, ManifestCatalog, ManifestEntry, ManifestEpisode, ManifestSource,
};
use crate::types::{Asset, Entry, Episode, SourceId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    #[snafu(display("Network error: {source}"))]
    Network { source: reqwest::Error },

    #[snafu(display("HTTP error {status} for URL: {url}"))]
    Http { status: u16, url: String },

    #[snafu(display("Episode {episode_id} of entry {entry_id} is unknown to this source"))]
    UnknownEpisode { entry_id: u64, episode_id: u64 },

    #[snafu(display("Source unavailable: {message}"))]
    Unavailable { message: String },

    #[snafu(display("Invalid manifest {}: {message}", path.display()))]
    Manifest { path: PathBuf, message: String },
}

impl SourceError {
    /// Client errors and unknown episodes are final; everything else is
    /// worth another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => !(*status >= 400 && *status < 500),
            Self::UnknownEpisode { .. } | Self::Manifest { .. } => false,
            Self::Network { .. } | Self::Unavailable { .. } => true,
        }
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, SourceError>>;

/// An opened asset body.
pub struct Fetched {
    pub content_length: Option<u64>,
    pub stream:         ByteStream,
}

impl fmt::Debug for Fetched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetched")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// A remote provider of entries and their media.
#[async_trait]
pub trait Source: Send + Sync {
    fn id(&self) -> SourceId;

    /// Display name, also the name of the source directory on disk.
    fn name(&self) -> &str;

    /// Resolve the downloadable assets of an episode, best candidate first.
    async fn list_assets(&self, entry: &Entry, episode: &Episode)
    -> Result<Vec<Asset>, SourceError>;

    /// Open the body of a single-piece asset.
    async fn fetch(&self, asset: &Asset) -> Result<Fetched, SourceError>;
}

/// The set of installed sources.
#[async_trait]
pub trait Catalog: Send + Sync {
    fn source(&self, id: SourceId) -> Option<Arc<dyn Source>>;

    fn sources(&self) -> Vec<Arc<dyn Source>>;

    /// Look up full entry and episode metadata from their identifiers.
    async fn hydrate(
        &self,
        source_id: SourceId,
        entry_id: u64,
        episode_id: u64,
    ) -> Option<(Entry, Episode)>;
}
