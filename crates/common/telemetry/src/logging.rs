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
    env,
    io::IsTerminal,
    sync::{LazyLock, Mutex, Once, OnceLock},
};

use bon::Builder;
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing::Subscriber;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter, fmt::MakeWriter, layer::SubscriberExt, registry::LookupSpan,
    reload,
};

/// Deserializes a string value, using `Default::default()` if the string is
/// empty.
///
/// # Errors
/// Returns an error if the non-empty string is not a valid `T`.
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        Ok(T::default())
    } else {
        T::deserialize(de::value::StrDeserializer::new(&s)).map_err(|e: de::value::Error| {
            de::Error::custom(format!("invalid value, expect empty string, err: {e}"))
        })
    }
}

/// Default directory for log files when a relative path is wanted.
pub const DEFAULT_LOGGING_DIR: &str = "logs";

/// Fallback filter when neither the options nor `RUST_LOG` set one.
const DEFAULT_LOG_TARGETS: &str = "info";

/// Handle for changing the log filter at runtime. Set by
/// [`init_global_logging`].
static RELOAD_HANDLE: OnceLock<reload::Handle<filter::Targets, Registry>> = OnceLock::new();

/// Configuration of the logging system.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for rotated log files. Empty disables file logging.
    #[default = ""]
    #[builder(default, into)]
    pub dir: String,

    /// Filter such as `"info"` or `"info,kura_downloader=debug"`. Falls back
    /// to `RUST_LOG`, then to `info`.
    #[builder(into)]
    pub level: Option<String>,

    #[serde(default, deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Rotated files kept per log stream (hourly rotation).
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    /// Also write to stderr. Standard output stays free for command output.
    #[default = true]
    #[builder(default = true)]
    pub append_stderr: bool,
}

/// Available log output formats.
#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, for log aggregation.
    Json,
    #[default]
    Text,
}

/// Error returned by [`reload_level`].
#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum ReloadError {
    #[display("logging has not been initialized")]
    NotInitialized,
    #[display("invalid log filter {filter:?}")]
    InvalidFilter {
        filter: String,
        source: filter::ParseError,
    },
    #[display("failed to swap log filter")]
    Swap { source: reload::Error },
}

/// Initialize logging for unit and integration tests.
///
/// Logs go to `UNITTEST_LOG_DIR` (default `/tmp/__unittest_logs`) with the
/// filter in `UNITTEST_LOG_LEVEL`. Safe to call from every test.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());
        let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| {
            "debug,hyper=warn,hyper_util=warn,tower=warn,reqwest=warn,h2=info".to_string()
        });
        let opts = LoggingOptions {
            dir: dir.clone(),
            level: Some(level),
            append_stderr: false,
            ..Default::default()
        };
        let guards = init_global_logging("unittest", &opts);
        if let Ok(mut slot) = GLOBAL_UT_LOG_GUARD.lock() {
            *slot = Some(guards);
        }

        tracing::info!("logs dir = {}", dir);
    });
}

/// Keeps the unit test writers alive for the whole test binary.
static GLOBAL_UT_LOG_GUARD: LazyLock<Mutex<Option<Vec<WorkerGuard>>>> =
    LazyLock::new(|| Mutex::new(None));

fn fmt_layer<S, W>(writer: W, format: LogFormat, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::Layer::new()
            .json()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::Layer::new()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
    }
}

fn rolling_appender(prefix: &str, opts: &LoggingOptions) -> RollingFileAppender {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(opts.max_log_files)
        .build(&opts.dir)
        .unwrap_or_else(|e| {
            panic!(
                "initializing rolling file appender at {} failed: {}",
                &opts.dir, e
            )
        })
}

/// Install the global subscriber.
///
/// Layers: stderr (when `append_stderr`), `<app_name>.*` files and
/// `<app_name>-err.*` error-only files (when `dir` is set). The returned
/// guards flush the background writers on drop and must outlive logging.
/// Only the first call has any effect.
///
/// # Panics
/// Panics when the log directory cannot be used, the filter does not parse,
/// or another global subscriber is already installed.
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Vec<WorkerGuard> {
    static START: Once = Once::new();
    let mut guards = vec![];

    START.call_once(|| {
        LogTracer::init().expect("log tracer must be valid");

        let stderr_layer = if opts.append_stderr {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            guards.push(guard);
            Some(fmt_layer(writer, opts.log_format, std::io::stderr().is_terminal()))
        } else {
            None
        };

        let (file_layer, err_file_layer) = if opts.dir.is_empty() {
            (None, None)
        } else {
            let (writer, guard) = tracing_appender::non_blocking(rolling_appender(app_name, opts));
            guards.push(guard);
            let file_layer = fmt_layer(writer, opts.log_format, false);

            let (writer, guard) = tracing_appender::non_blocking(rolling_appender(
                &format!("{app_name}-err"),
                opts,
            ));
            guards.push(guard);
            let err_layer = fmt_layer(writer, opts.log_format, false)
                .with_filter(filter::LevelFilter::ERROR)
                .boxed();
            (Some(file_layer), Some(err_layer))
        };

        let filter = opts
            .level
            .as_deref()
            .or(env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
            .unwrap_or(DEFAULT_LOG_TARGETS)
            .parse::<filter::Targets>()
            .expect("error parsing log level string");
        let (dyn_filter, reload_handle) = reload::Layer::new(filter);
        RELOAD_HANDLE
            .set(reload_handle)
            .expect("reload handle already set, maybe init_global_logging get called twice?");

        let subscriber = Registry::default()
            .with(dyn_filter)
            .with(stderr_layer)
            .with(file_layer)
            .with(err_file_layer);
        tracing::subscriber::set_global_default(subscriber)
            .expect("error setting global tracing subscriber");
    });

    guards
}

/// Replace the active log filter.
///
/// # Errors
/// Fails before [`init_global_logging`] ran or when `level` does not parse.
pub fn reload_level(level: &str) -> Result<(), ReloadError> {
    let handle = RELOAD_HANDLE.get().ok_or(ReloadError::NotInitialized)?;
    let targets = level
        .parse::<filter::Targets>()
        .map_err(|source| ReloadError::InvalidFilter {
            filter: level.to_string(),
            source,
        })?;
    handle
        .reload(targets)
        .map_err(|source| ReloadError::Swap { source })
}
