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

//! Moves the bytes of one asset from its source into the item workspace.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use futures::{FutureExt, StreamExt, TryStreamExt, future::BoxFuture, stream};
use snafu::ResultExt;
use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt, BufWriter},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    byte_cache::ByteCache,
    error::{CancelledSnafu, DownloadError, FetchSnafu, FileReadSnafu, FileWriteSnafu},
    metrics::{BYTES_TRANSFERRED, TRANSFER_RETRIES},
    source::Source,
    types::Asset,
};

const WRITE_BUFFER: usize = 512 * 1024;

/// Extension of unfinished files inside a workspace.
pub const PARTIAL_EXTENSION: &str = "tmp";

/// Shared transfer counters, read by the progress sampler.
#[derive(Debug)]
pub struct TransferProgress {
    parts_total: usize,
    parts_done:  AtomicUsize,
    received:    AtomicU64,
    expected:    AtomicU64,
}

impl TransferProgress {
    pub const fn new(parts_total: usize) -> Self {
        Self {
            parts_total,
            parts_done: AtomicUsize::new(0),
            received: AtomicU64::new(0),
            expected: AtomicU64::new(0),
        }
    }

    pub fn parts_done(&self) -> usize { self.parts_done.load(Ordering::Relaxed) }

    /// Completion in percent. Multi-part assets count parts, single-part
    /// assets count bytes against the announced length.
    pub fn percent(&self) -> u8 {
        let ratio = if self.parts_total > 1 {
            (self.parts_done() * 100) / self.parts_total
        } else {
            let expected = self.expected.load(Ordering::Relaxed);
            if expected == 0 {
                return 0;
            }
            #[allow(clippy::cast_possible_truncation)]
            let ratio = (self.received.load(Ordering::Relaxed).saturating_mul(100) / expected) as usize;
            ratio
        };
        #[allow(clippy::cast_possible_truncation)]
        let percent = ratio.min(100) as u8;
        percent
    }

    fn expect(&self, bytes: u64) { self.expected.store(bytes, Ordering::Relaxed); }

    fn receive(&self, bytes: u64) { self.received.fetch_add(bytes, Ordering::Relaxed); }

    fn rewind(&self, bytes: u64) { self.received.fetch_sub(bytes, Ordering::Relaxed); }

    fn part_done(&self) { self.parts_done.fetch_add(1, Ordering::Relaxed); }
}

/// Fetches one asset into a workspace directory.
pub struct Transfer<'a> {
    pub source:     &'a dyn Source,
    pub byte_cache: Option<&'a ByteCache>,
    pub backoff:    ExponentialBuilder,
    pub max_parts:  usize,
    pub cancel:     &'a CancellationToken,
    pub progress:   &'a TransferProgress,
}

impl Transfer<'_> {
    /// Materialize `asset` as `<workspace>/<file_stem>.<format>` and return
    /// its path. A file already at that path is reused.
    pub async fn run(
        &self,
        asset: &Asset,
        workspace: &Path,
        file_stem: &str,
    ) -> Result<PathBuf, DownloadError> {
        let target = workspace.join(format!("{file_stem}.{}", asset.format));
        if fs::try_exists(&target).await.unwrap_or(false) {
            debug!(path = %target.display(), "Reusing finished asset");
            return Ok(target);
        }

        let partial = workspace.join(format!("{file_stem}.{PARTIAL_EXTENSION}"));
        if asset.is_multi_part() {
            let parts = self.fetch_parts(asset, workspace).await?;
            concatenate(&parts, &partial).await?;
        } else {
            self.fetch_to(asset, &partial).await?;
            self.progress.part_done();
        }

        fs::rename(&partial, &target)
            .await
            .context(FileWriteSnafu {
                path: target.clone(),
            })?;
        Ok(target)
    }

    async fn fetch_parts(
        &self,
        asset: &Asset,
        workspace: &Path,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        let parts: Vec<(Asset, PathBuf)> = asset
            .parts
            .iter()
            .enumerate()
            .map(|(index, url)| {
                (
                    asset.part(url),
                    workspace.join(format!("part-{index:04}.{PARTIAL_EXTENSION}")),
                )
            })
            .collect();

        let fetches: Vec<BoxFuture<'_, Result<(), DownloadError>>> = parts
            .iter()
            .map(|(part, path)| {
                async move {
                    self.fetch_to(part, path).await?;
                    self.progress.part_done();
                    Ok(())
                }
                .boxed()
            })
            .collect();
        stream::iter(fetches)
            .buffer_unordered(self.max_parts.max(1))
            .try_collect::<Vec<()>>()
            .await?;

        Ok(parts.into_iter().map(|(_, path)| path).collect())
    }

    /// Fetch a single-piece asset to `dest`, from the byte cache when
    /// possible, retrying transient failures.
    async fn fetch_to(&self, asset: &Asset, dest: &Path) -> Result<(), DownloadError> {
        if let Some(cache) = self.byte_cache {
            match cache.get(&asset.url).await {
                Ok(Some(cached)) => {
                    cache.restore(&cached, dest).await?;
                    self.progress.expect(cached.size);
                    self.progress.receive(cached.size);
                    debug!(url = %asset.url, "Served from byte cache");
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => debug!(url = %asset.url, error = %e, "Byte cache lookup failed"),
            }
        }

        let attempts = AtomicUsize::new(0);
        let fetched = (|| self.try_fetch(asset, dest, &attempts))
            .retry(self.backoff)
            .when(|e: &DownloadError| e.is_retryable())
            .notify(|e: &DownloadError, delay: Duration| {
                TRANSFER_RETRIES.inc();
                warn!(url = %asset.url, error = %e, ?delay, "Fetch failed, retrying");
            });
        // Backoff sleeps must not delay a pause.
        let fetched = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return CancelledSnafu.fail(),
            fetched = fetched => fetched,
        };
        fetched.map_err(|e| {
            if e.is_retryable() {
                DownloadError::Transfer {
                    url:      asset.url.clone(),
                    attempts: attempts.load(Ordering::Relaxed),
                    message:  e.to_string(),
                }
            } else {
                e
            }
        })?;

        if let Some(cache) = self.byte_cache {
            if let Err(e) = cache.store(&asset.url, dest).await {
                debug!(url = %asset.url, error = %e, "Unable to keep transfer in byte cache");
            }
        }
        Ok(())
    }

    async fn try_fetch(
        &self,
        asset: &Asset,
        dest: &Path,
        attempts: &AtomicUsize,
    ) -> Result<(), DownloadError> {
        attempts.fetch_add(1, Ordering::Relaxed);
        let mut received = 0;
        let result = self.stream_into(asset, dest, &mut received).await;
        if result.is_err() {
            self.progress.rewind(received);
        }
        result
    }

    async fn stream_into(
        &self,
        asset: &Asset,
        dest: &Path,
        received: &mut u64,
    ) -> Result<(), DownloadError> {
        let fetched = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return CancelledSnafu.fail(),
            fetched = self.source.fetch(asset) => fetched.context(FetchSnafu { url: asset.url.clone() })?,
        };
        if let Some(length) = fetched.content_length {
            self.progress.expect(length);
        }

        let file = File::create(dest).await.context(FileWriteSnafu {
            path: dest.to_path_buf(),
        })?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);
        let mut body = fetched.stream;

        loop {
            let chunk = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return CancelledSnafu.fail(),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.context(FetchSnafu {
                url: asset.url.clone(),
            })?;
            writer.write_all(&chunk).await.context(FileWriteSnafu {
                path: dest.to_path_buf(),
            })?;
            let len = chunk.len() as u64;
            *received += len;
            self.progress.receive(len);
            BYTES_TRANSFERRED.inc_by(len);
        }

        writer.flush().await.context(FileWriteSnafu {
            path: dest.to_path_buf(),
        })?;
        writer
            .get_mut()
            .sync_all()
            .await
            .context(FileWriteSnafu {
                path: dest.to_path_buf(),
            })
    }
}

/// Append `parts` to `dest` in order, removing each part once copied.
async fn concatenate(parts: &[PathBuf], dest: &Path) -> Result<(), DownloadError> {
    let file = File::create(dest).await.context(FileWriteSnafu {
        path: dest.to_path_buf(),
    })?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);

    for part in parts {
        let mut reader = File::open(part)
            .await
            .context(FileReadSnafu { path: part.clone() })?;
        tokio::io::copy(&mut reader, &mut writer)
            .await
            .context(FileWriteSnafu {
                path: dest.to_path_buf(),
            })?;
        let _ = fs::remove_file(part).await;
    }

    writer.flush().await.context(FileWriteSnafu {
        path: dest.to_path_buf(),
    })?;
    writer
        .get_mut()
        .sync_all()
        .await
        .context(FileWriteSnafu {
            path: dest.to_path_buf(),
        })
}

/// Delete unfinished fragments left in `workspace` by an earlier attempt.
pub async fn remove_partial_files(workspace: &Path) -> Result<usize, DownloadError> {
    let mut children = fs::read_dir(workspace).await.context(FileReadSnafu {
        path: workspace.to_path_buf(),
    })?;
    let mut removed = 0;
    while let Some(child) = children.next_entry().await.context(FileReadSnafu {
        path: workspace.to_path_buf(),
    })? {
        let path = child.path();
        let partial = path
            .extension()
            .is_some_and(|ext| ext == PARTIAL_EXTENSION);
        if partial && child.file_type().await.is_ok_and(|kind| kind.is_file()) {
            fs::remove_file(&path).await.context(FileWriteSnafu { path })?;
            removed += 1;
        }
    }
    Ok(removed)
}
