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

use std::{collections::HashMap, path::Path, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tracing::debug;

use super::{
    Catalog, Fetched, HttpSnafu, NetworkSnafu, Source, SourceError, UnknownEpisodeSnafu,
};
use crate::{
    config::DownloaderConfig,
    types::{Asset, Entry, Episode, SourceId},
};

/// A JSON description of sources, their entries, and where each episode's
/// media lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub sources: Vec<ManifestSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSource {
    pub id:      SourceId,
    pub name:    String,
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id:       u64,
    pub title:    String,
    #[serde(default)]
    pub url:      String,
    #[serde(default)]
    pub episodes: Vec<ManifestEpisode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEpisode {
    pub id:           u64,
    pub name:         String,
    #[serde(default)]
    pub scanlator:    Option<String>,
    #[serde(default)]
    pub source_order: i64,
    #[serde(default)]
    pub url:          String,
    #[serde(default)]
    pub assets:       Vec<Asset>,
}

impl Manifest {
    pub async fn load(path: &Path) -> Result<Self, SourceError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| SourceError::Manifest {
                    path:    path.to_path_buf(),
                    message: e.to_string(),
                })?;
        serde_json::from_str(&content).map_err(|e| SourceError::Manifest {
            path:    path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// A source whose assets are plain HTTP(S) URLs.
#[derive(Debug, Clone)]
pub struct HttpSource {
    id:     SourceId,
    name:   String,
    client: reqwest::Client,
    assets: HashMap<(u64, u64), Vec<Asset>>,
}

impl HttpSource {
    pub fn new(id: SourceId, name: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            id,
            name: name.into(),
            client,
            assets: HashMap::new(),
        }
    }

    /// Register the assets of one episode.
    #[must_use]
    pub fn with_assets(mut self, entry_id: u64, episode_id: u64, assets: Vec<Asset>) -> Self {
        self.assets.insert((entry_id, episode_id), assets);
        self
    }

    pub fn build_client(config: &DownloaderConfig) -> Result<reqwest::Client, SourceError> {
        // Bodies are streamed, so the timeout bounds each read rather than
        // the whole transfer.
        let idle = config.http_timeout.unsigned_abs();
        let mut builder = reqwest::Client::builder()
            .connect_timeout(idle)
            .read_timeout(idle);

        if let Some(ref ua) = config.user_agent {
            builder = builder.user_agent(ua);
        }

        builder.build().context(NetworkSnafu)
    }
}

#[async_trait]
impl Source for HttpSource {
    fn id(&self) -> SourceId { self.id }

    fn name(&self) -> &str { &self.name }

    async fn list_assets(
        &self,
        entry: &Entry,
        episode: &Episode,
    ) -> Result<Vec<Asset>, SourceError> {
        self.assets
            .get(&(entry.id, episode.id))
            .cloned()
            .ok_or_else(|| {
                UnknownEpisodeSnafu {
                    entry_id:   entry.id,
                    episode_id: episode.id,
                }
                .build()
            })
    }

    async fn fetch(&self, asset: &Asset) -> Result<Fetched, SourceError> {
        debug!(url = %asset.url, "Requesting asset");
        let response = self
            .client
            .get(&asset.url)
            .send()
            .await
            .context(NetworkSnafu)?;

        let status = response.status();
        ensure!(
            status.is_success(),
            HttpSnafu {
                status: status.as_u16(),
                url:    asset.url.clone(),
            }
        );

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.context(NetworkSnafu))
            .boxed();

        Ok(Fetched {
            content_length,
            stream,
        })
    }
}

/// A [`Catalog`] backed by a [`Manifest`].
#[derive(Debug, Clone)]
pub struct ManifestCatalog {
    sources: Vec<Arc<HttpSource>>,
    entries: Vec<(Entry, Vec<Episode>)>,
}

impl ManifestCatalog {
    pub fn new(manifest: Manifest, client: &reqwest::Client) -> Self {
        let mut sources = Vec::with_capacity(manifest.sources.len());
        let mut entries = Vec::new();

        for listed in manifest.sources {
            let mut source = HttpSource::new(listed.id, listed.name, client.clone());
            for listed_entry in listed.entries {
                let entry = Entry {
                    source_id: listed.id,
                    id:        listed_entry.id,
                    title:     listed_entry.title,
                    url:       listed_entry.url,
                };
                let mut episodes = Vec::with_capacity(listed_entry.episodes.len());
                for listed_episode in listed_entry.episodes {
                    source = source.with_assets(entry.id, listed_episode.id, listed_episode.assets);
                    episodes.push(Episode {
                        id:           listed_episode.id,
                        entry_id:     entry.id,
                        name:         listed_episode.name,
                        scanlator:    listed_episode.scanlator,
                        source_order: listed_episode.source_order,
                        url:          listed_episode.url,
                    });
                }
                entries.push((entry, episodes));
            }
            sources.push(Arc::new(source));
        }

        Self { sources, entries }
    }

    /// Every entry with its episodes, in manifest order.
    pub fn entries(&self) -> &[(Entry, Vec<Episode>)] { &self.entries }

    pub fn find_entry(&self, entry_id: u64) -> Option<&(Entry, Vec<Episode>)> {
        self.entries.iter().find(|(entry, _)| entry.id == entry_id)
    }
}

#[async_trait]
impl Catalog for ManifestCatalog {
    fn source(&self, id: SourceId) -> Option<Arc<dyn Source>> {
        self.sources
            .iter()
            .find(|source| source.id == id)
            .map(|source| Arc::clone(source) as Arc<dyn Source>)
    }

    fn sources(&self) -> Vec<Arc<dyn Source>> {
        self.sources
            .iter()
            .map(|source| Arc::clone(source) as Arc<dyn Source>)
            .collect()
    }

    async fn hydrate(
        &self,
        source_id: SourceId,
        entry_id: u64,
        episode_id: u64,
    ) -> Option<(Entry, Episode)> {
        let (entry, episodes) = self
            .entries
            .iter()
            .find(|(entry, _)| entry.source_id == source_id && entry.id == entry_id)?;
        let episode = episodes.iter().find(|episode| episode.id == episode_id)?;
        Some((entry.clone(), episode.clone()))
    }
}
