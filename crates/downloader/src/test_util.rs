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

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    source::{Catalog, Fetched, Source, SourceError},
    types::{Asset, Entry, Episode, SourceId},
};

/// A source that knows its name and nothing else.
#[derive(Debug)]
pub struct NamedSource {
    pub id:   SourceId,
    pub name: String,
}

#[async_trait]
impl Source for NamedSource {
    fn id(&self) -> SourceId { self.id }

    fn name(&self) -> &str { &self.name }

    async fn list_assets(&self, _: &Entry, _: &Episode) -> Result<Vec<Asset>, SourceError> {
        Ok(Vec::new())
    }

    async fn fetch(&self, asset: &Asset) -> Result<Fetched, SourceError> {
        Err(SourceError::Unavailable {
            message: format!("{} cannot fetch {}", self.name, asset.url),
        })
    }
}

pub fn source(id: SourceId, name: &str) -> Arc<dyn Source> {
    Arc::new(NamedSource {
        id,
        name: name.to_string(),
    })
}

#[derive(Default)]
pub struct StaticCatalog {
    sources: Vec<Arc<dyn Source>>,
}

impl StaticCatalog {
    pub fn with_source(id: SourceId, name: &str) -> Self {
        Self {
            sources: vec![source(id, name)],
        }
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    fn source(&self, id: SourceId) -> Option<Arc<dyn Source>> {
        self.sources.iter().find(|source| source.id() == id).cloned()
    }

    fn sources(&self) -> Vec<Arc<dyn Source>> { self.sources.clone() }

    async fn hydrate(&self, _: SourceId, _: u64, _: u64) -> Option<(Entry, Episode)> { None }
}

pub fn entry(source_id: SourceId, id: u64, title: &str) -> Entry {
    Entry::builder()
        .source_id(source_id)
        .id(id)
        .title(title)
        .build()
}

pub fn episode(entry_id: u64, id: u64, name: &str) -> Episode {
    Episode::builder()
        .id(id)
        .entry_id(entry_id)
        .name(name)
        .build()
}
