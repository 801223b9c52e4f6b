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
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use blockdelta_common_telemetry::{
    logging::{LogFormat, LoggingOptions, init_global_logging, log_filter},
    panic_hook::set_panic_hook,
};
use blockdelta_downloader::{
    BlockMap, BlockMapSource, DEFAULT_FILE_NAME, DifferentialDownloader, DownloadOutcome,
    DownloadSession, DownloaderConfig, EmbeddedBlockMapSource, ExternalBlockMapSource,
    PlanBuilder, ProgressCallback, ProgressInfo, source::append_embedded_block_map,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reqwest::{
    Url,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use sha2::{Digest, Sha512};
use snafu::{ResultExt, Whatever, whatever};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod settings;
use settings::Settings;

#[derive(Debug, Parser)]
#[clap(
    name = "blockdelta",
    about = "Differential downloads driven by block maps",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Configuration file (toml, yaml or json)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log filter, e.g. "debug" or "info,blockdelta_downloader=trace"
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Write rotated log files into this directory
    #[arg(long, global = true)]
    log_dir: Option<String>,

    #[arg(long, global = true, value_enum)]
    log_format: Option<CliLogFormat>,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Text,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Text => Self::Text,
            CliLogFormat::Json => Self::Json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Plan(PlanArgs),
    Blockmap(BlockmapArgs),
    Download(DownloadArgs),
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Compare two block map documents and print the COPY/DOWNLOAD plan.
Examples:

blockdelta plan --old app-1.0.0.bin.blockmap --new app-1.1.0.bin.blockmap

")]
struct PlanArgs {
    /// Block map of the installed version
    #[arg(long)]
    old:  PathBuf,
    /// Block map of the new version
    #[arg(long)]
    new:  PathBuf,
    /// Print the full plan as JSON
    #[arg(long)]
    json: bool,
}

impl PlanArgs {
    async fn run(&self, config: &DownloaderConfig) -> Result<(), Whatever> {
        let old = read_block_map(&self.old).await?;
        let new = read_block_map(&self.new).await?;
        let plan = PlanBuilder::new(config.plan.clone())
            .build(&old, &new)
            .whatever_context("Failed to build plan")?;

        if self.json {
            let json =
                serde_json::to_string_pretty(&plan).whatever_context("Failed to encode plan")?;
            println!("{json}");
        } else {
            for op in &plan.operations {
                println!("{op:?}");
            }
            let summary = plan.summary();
            println!(
                "download {} bytes in {} operations, copy {} bytes in {} operations, {} changed \
                 blocks",
                summary.download_bytes,
                summary.download_operations,
                summary.copy_bytes,
                summary.copy_operations,
                summary.changed_blocks
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Describe a file with fixed-size blocks.
Examples:

blockdelta blockmap app-1.1.0.bin --gzip --output app-1.1.0.bin.blockmap
blockdelta blockmap app-1.1.0.bin --embed --output app-1.1.0.bin.delta

")]
struct BlockmapArgs {
    file:       PathBuf,
    #[arg(long, default_value_t = 64 * 1024)]
    block_size: u32,
    /// Write a gzip document instead of plain JSON
    #[arg(long, conflicts_with = "embed")]
    gzip:       bool,
    /// Write the file followed by its embedded block map trailer
    #[arg(long)]
    embed:      bool,
    /// Entry name inside the document; old and new maps must agree on it
    #[arg(long, default_value = DEFAULT_FILE_NAME)]
    name:       String,
    #[arg(long)]
    output:     PathBuf,
}

impl BlockmapArgs {
    async fn run(&self) -> Result<(), Whatever> {
        if self.block_size == 0 {
            whatever!("--block-size must be positive");
        }
        let data = tokio::fs::read(&self.file)
            .await
            .with_whatever_context(|_| format!("Failed to read {}", self.file.display()))?;
        let map = BlockMap::from_fixed_blocks(&self.name, &data, self.block_size);

        let (bytes, digest) = if self.embed {
            let mut out = data;
            append_embedded_block_map(&mut out, &map)
                .whatever_context("Failed to embed block map")?;
            let sum = Sha512::digest(&out);
            (out, sum)
        } else {
            let encoded = if self.gzip {
                map.encode_gzip()
            } else {
                map.to_json()
            }
            .whatever_context("Failed to encode block map")?;
            (encoded, Sha512::digest(&data))
        };

        tokio::fs::write(&self.output, &bytes)
            .await
            .with_whatever_context(|_| format!("Failed to write {}", self.output.display()))?;
        info!(
            output = %self.output.display(),
            blocks = map.files.first().map_or(0, |f| f.sizes.len()),
            "Block map written"
        );
        println!("sha512: {}", STANDARD.encode(digest));
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Rebuild a new version from an installed one, fetching only changed blocks.
Examples:

blockdelta download --old-file app-1.0.0.bin --url https://host/v/1.1.0/app-1.1.0.bin \
    --old-version 1.0.0 --new-version 1.1.0 --sha512 <digest> --output app-1.1.0.bin

")]
struct DownloadArgs {
    #[arg(long)]
    old_file:       PathBuf,
    #[arg(long)]
    url:            Url,
    #[arg(long)]
    output:         PathBuf,
    /// Expected SHA-512 of the new file, hex or base64
    #[arg(long)]
    sha512:         String,
    /// Read block maps from the artifacts' trailers
    #[arg(long, conflicts_with_all = ["old_version", "new_version"])]
    embedded:       bool,
    #[arg(long, requires = "new_version")]
    old_version:    Option<String>,
    #[arg(long, requires = "old_version")]
    new_version:    Option<String>,
    /// Size of the complete new file
    #[arg(long)]
    size:           Option<u64>,
    /// Compressed size of the new embedded block map
    #[arg(long, requires = "embedded")]
    block_map_size: Option<u32>,
    /// Fetch every changed range with its own request
    #[arg(long)]
    no_multi_range: bool,
    /// Extra request header, `Name: value`
    #[arg(long = "header")]
    headers:        Vec<String>,
}

impl DownloadArgs {
    async fn run(&self, config: DownloaderConfig) -> Result<(), Whatever> {
        let source: Box<dyn BlockMapSource> = if self.embedded {
            Box::new(
                EmbeddedBlockMapSource::builder()
                    .maybe_new_block_map_size(self.block_map_size)
                    .maybe_new_file_size(self.size)
                    .build(),
            )
        } else {
            match (&self.old_version, &self.new_version) {
                (Some(old), Some(new)) => Box::new(
                    ExternalBlockMapSource::builder()
                        .old_version(old)
                        .new_version(new)
                        .build(),
                ),
                _ => whatever!("Either --embedded or --old-version with --new-version is required"),
            }
        };

        let token = CancellationToken::new();
        let handler_token = token.clone();
        ctrlc::set_handler(move || {
            warn!("Interrupted, cancelling download");
            handler_token.cancel();
        })
        .whatever_context("Failed to install Ctrl+C handler")?;

        let session = DownloadSession::builder()
            .old_file(&self.old_file)
            .new_url(self.url.clone())
            .output_path(&self.output)
            .maybe_new_size(self.size)
            .sha512(&self.sha512)
            .headers(parse_headers(&self.headers)?)
            .cancellation(token)
            .multi_range(!self.no_multi_range)
            .progress(progress_logger())
            .build();

        let downloader =
            DifferentialDownloader::new(config).whatever_context("Failed to create downloader")?;
        match downloader
            .download(source.as_ref(), &session)
            .await
            .whatever_context("Differential download failed")?
        {
            DownloadOutcome::Completed(result) => {
                println!(
                    "{} ({} bytes, downloaded {} bytes in {})",
                    result.path.display(),
                    result.size,
                    result.summary.download_bytes,
                    result.duration
                );
                Ok(())
            }
            DownloadOutcome::Cancelled => whatever!("Download cancelled"),
        }
    }
}

/// Log progress at every tenth of the download.
fn progress_logger() -> ProgressCallback {
    let last_decile = AtomicU64::new(0);
    ProgressCallback::new(move |info: ProgressInfo| {
        if info.total == 0 {
            return;
        }
        let decile = info.transferred * 10 / info.total;
        if last_decile.fetch_max(decile, Ordering::Relaxed) < decile {
            info!(
                transferred = info.transferred,
                total = info.total,
                "Downloaded {}%",
                decile * 10
            );
        }
    })
}

fn parse_headers(raw: &[String]) -> Result<HeaderMap, Whatever> {
    let mut headers = HeaderMap::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once(':') else {
            whatever!("Header {entry:?} is not in `Name: value` form");
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .with_whatever_context(|_| format!("Invalid header name in {entry:?}"))?;
        let value = HeaderValue::from_str(value.trim())
            .with_whatever_context(|_| format!("Invalid header value in {entry:?}"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

async fn read_block_map(path: &Path) -> Result<BlockMap, Whatever> {
    let data = tokio::fs::read(path)
        .await
        .with_whatever_context(|_| format!("Failed to read {}", path.display()))?;
    BlockMap::decode(&data)
        .with_whatever_context(|_| format!("Failed to decode block map {}", path.display()))
}

/// Overlay the logging flags onto the loaded options and check the level.
fn apply_logging_flags(cli: &Cli, logging: &mut LoggingOptions) -> Result<(), Whatever> {
    if let Some(level) = &cli.log_level {
        logging.level = Some(level.clone());
    }
    if let Some(dir) = &cli.log_dir {
        logging.dir.clone_from(dir);
    }
    if let Some(format) = cli.log_format {
        logging.log_format = format.into();
    }
    log_filter(logging).with_whatever_context(|_| {
        format!("Invalid log level {:?}", logging.level.as_deref().unwrap_or_default())
    })?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    let mut settings =
        Settings::load(cli.config.as_deref()).whatever_context("Failed to load settings")?;
    apply_logging_flags(&cli, &mut settings.logging)?;

    let _guards = init_global_logging("blockdelta", &settings.logging);
    set_panic_hook();

    match cli.commands {
        Commands::Plan(args) => args.run(&settings.downloader).await,
        Commands::Blockmap(args) => args.run().await,
        Commands::Download(args) => args.run(settings.downloader).await,
    }
}
