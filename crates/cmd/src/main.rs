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

use clap::{Args, Parser, Subcommand};
use kura_app::{App, AppConfig};
use kura_common_telemetry as telemetry;
use snafu::Whatever;

mod build_info;

#[derive(Debug, Parser)]
#[clap(
name = "kura",
about = "Download episodes listed in a manifest into a local library",
author = build_info::AUTHOR,
version = build_info::FULL_VERSION)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Manifest to use instead of the configured one
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    /// Library root to use instead of the configured one
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "info,kura_downloader=trace"
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    commands: Commands,
}

impl Cli {
    fn app_config(&self) -> Result<AppConfig, Whatever> {
        let mut config = AppConfig::load(self.config.as_deref())?;
        if let Some(manifest) = &self.manifest {
            config.manifest.clone_from(manifest);
        }
        if let Some(root) = &self.root {
            config.downloads.root_dir = Some(root.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = Some(level.clone());
        }
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Fetch(FetchArgs),
    Status(StatusArgs),
    List(ListArgs),
    Delete(DeleteArgs),
    Purge(PurgeArgs),
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Queue the episodes of the manifest that are not downloaded yet and download
them. Ctrl+C pauses; the queue is resumed by the next fetch.
Examples:

kura fetch
kura fetch --entry 10 --entry 11

")]
struct FetchArgs {
    /// Only fetch these entries
    #[arg(long = "entry")]
    entries: Vec<u64>,

    /// Print engine metrics when done
    #[arg(long)]
    metrics: bool,
}

impl FetchArgs {
    async fn run(&self, app: &App) -> Result<(), Whatever> {
        let summary = app.fetch(&self.entries).await?;
        println!(
            "queued {}, {} left in queue, engine {}",
            summary.queued, summary.remaining, summary.state
        );
        if self.metrics {
            print!("{}", kura_downloader::metrics::render());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Print the persisted download queue.
Examples:

kura status

")]
struct StatusArgs {}

impl StatusArgs {
    fn run(&self, app: &App) {
        let queued = app.queued();
        if queued.is_empty() {
            println!("queue is empty");
            return;
        }
        for line in queued {
            println!(
                "{:<12} {:>3}%  {} / {} / {}",
                line.status, line.progress, line.source, line.entry, line.episode
            );
        }
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Print how many episodes of each manifest entry are downloaded.
Examples:

kura list

")]
struct ListArgs {}

impl ListArgs {
    async fn run(&self, app: &App) {
        for line in app.library().await {
            println!(
                "{:>6}  {:>4}/{:<4} {:>10}  {}",
                line.entry_id,
                line.downloaded,
                line.available,
                format_size(line.size),
                line.title
            );
        }
        let total = app.manager().total_downloaded_size().await;
        println!("total {}", format_size(total));
    }
}

#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Delete downloaded episodes of an entry, or the whole entry.
Examples:

kura delete 10
kura delete 10 --episode 3 --episode 4
kura delete 10 --defer

")]
struct DeleteArgs {
    entry: u64,

    /// Only delete these episodes
    #[arg(long = "episode")]
    episodes: Vec<u64>,

    /// Record the episodes and delete them on the next purge
    #[arg(long)]
    defer: bool,
}

impl DeleteArgs {
    async fn run(&self, app: &App) -> Result<(), Whatever> {
        let count = app.delete(self.entry, &self.episodes, self.defer).await?;
        if self.defer {
            println!("{count} episodes marked for deletion");
        } else {
            println!("deleted {count} episodes");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Delete every episode marked with `kura delete --defer`.
Examples:

kura purge

")]
struct PurgeArgs {}

impl PurgeArgs {
    async fn run(&self, app: &App) -> Result<(), Whatever> {
        let count = app.purge().await?;
        println!("purged {count} episodes");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    let config = cli.app_config()?;
    let _guards = telemetry::init_global_logging("kura", &config.logging);
    telemetry::set_panic_hook();
    tracing::info!(version = build_info::FULL_VERSION, "Starting kura");

    let app = App::open(&config).await?;
    match &cli.commands {
        Commands::Fetch(args) => args.run(&app).await,
        Commands::Status(args) => {
            args.run(&app);
            Ok(())
        }
        Commands::List(args) => {
            args.run(&app).await;
            Ok(())
        }
        Commands::Delete(args) => args.run(&app).await,
        Commands::Purge(args) => args.run(&app).await,
    }
}
