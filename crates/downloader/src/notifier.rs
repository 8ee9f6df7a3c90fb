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

//! Hooks through which the engine reports to the outside world.

use tracing::{error, info, trace, warn};

use crate::item::DownloadItem;

/// Receives user-facing download notifications.
pub trait Notifier: Send + Sync {
    fn on_progress(&self, _item: &DownloadItem) {}

    fn on_warning(&self, _message: &str) {}

    fn on_error(&self, _message: &str, _item: Option<&DownloadItem>) {}

    /// The engine halted with work left in the queue.
    fn on_paused(&self) {}

    /// The engine halted with an empty queue.
    fn on_complete(&self) {}

    fn dismiss_progress(&self) {}
}

/// Holds whatever keeps the host process alive while the engine runs.
pub trait ServiceLifecycle: Send + Sync {
    fn on_start(&self) {}

    fn on_stop(&self) {}
}

/// [`Notifier`] that writes every notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn on_progress(&self, item: &DownloadItem) {
        trace!(
            entry = %item.entry().title,
            episode = %item.episode().name,
            progress = item.progress(),
            "Download progress"
        );
    }

    fn on_warning(&self, message: &str) {
        warn!(message, "Download warning");
    }

    fn on_error(&self, message: &str, item: Option<&DownloadItem>) {
        match item {
            Some(item) => error!(
                entry = %item.entry().title,
                episode = %item.episode().name,
                message,
                "Download failed"
            ),
            None => error!(message, "Download engine failed"),
        }
    }

    fn on_paused(&self) {
        info!("Downloads paused");
    }

    fn on_complete(&self) {
        info!("All downloads finished");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifecycle;

impl ServiceLifecycle for NoopLifecycle {}
