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
    io,
    path::{Path, PathBuf},
};

use sysinfo::Disks;
use tokio::fs;
use tracing::debug;

/// Marker that keeps media scanners out of the download tree.
pub const NO_MEDIA_FILE: &str = ".nomedia";

/// Reports the space left on the filesystem holding a path.
pub trait FreeSpace: Send + Sync {
    /// Available bytes, or `None` when it cannot be determined.
    fn available(&self, path: &Path) -> Option<u64>;
}

/// [`FreeSpace`] backed by the mounted disks of this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFreeSpace;

impl FreeSpace for SystemFreeSpace {
    fn available(&self, path: &Path) -> Option<u64> {
        let path = std::fs::canonicalize(path).ok()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(sysinfo::Disk::available_space)
    }
}

/// Write the no-media marker into `dir` unless it is already there.
pub async fn create_no_media_file(dir: &Path) {
    let marker = dir.join(NO_MEDIA_FILE);
    if fs::try_exists(&marker).await.unwrap_or(false) {
        return;
    }
    if let Err(e) = fs::write(&marker, b"").await {
        debug!(path = %marker.display(), error = %e, "Unable to write no-media marker");
    }
}

/// Whether `dir` has no children. Unreadable directories count as not empty.
pub async fn is_dir_empty(dir: &Path) -> bool {
    match fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

/// Remove a file or a directory tree. A missing path is not an error.
pub async fn remove_path(path: &Path) -> io::Result<bool> {
    let metadata = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path).await?;
    } else {
        fs::remove_file(path).await?;
    }
    Ok(true)
}

/// Bytes of every file under `dir`, following no symlinks. Unreadable parts
/// count as empty.
pub async fn dir_size(dir: &Path) -> u64 {
    let mut total = 0;
    let mut pending: Vec<PathBuf> = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(mut children) = fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(child)) = children.next_entry().await {
            let Ok(metadata) = fs::symlink_metadata(child.path()).await else {
                continue;
            };
            if metadata.is_dir() {
                pending.push(child.path());
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
    }
    total
}
