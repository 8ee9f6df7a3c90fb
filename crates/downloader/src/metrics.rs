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

use std::sync::LazyLock;

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, TextEncoder, register_int_counter,
    register_int_counter_vec, register_int_gauge,
};

pub const SOURCE_LABEL: &str = "source";

pub static DOWNLOADS_COMPLETED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "kura_downloads_completed_total",
        "Total number of episodes downloaded",
        &[SOURCE_LABEL]
    )
    .unwrap()
});

pub static DOWNLOADS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "kura_downloads_failed_total",
        "Total number of episode downloads that ended in error",
        &[SOURCE_LABEL]
    )
    .unwrap()
});

pub static TRANSFER_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "kura_transfer_retries_total",
        "Total number of retried asset fetches"
    )
    .unwrap()
});

pub static BYTES_TRANSFERRED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "kura_bytes_transferred_total",
        "Total number of bytes received from sources"
    )
    .unwrap()
});

pub static BYTE_CACHE_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "kura_byte_cache_hits_total",
        "Total number of fetches served from the byte cache"
    )
    .unwrap()
});

pub static ACTIVE_SOURCE_GROUPS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "kura_active_source_groups",
        "Number of sources currently downloading"
    )
    .unwrap()
});

/// Render every registered metric in the prometheus text format.
#[must_use]
pub fn render() -> String {
    let mut buffer = Vec::new();
    if TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
