//! dirsize - directory size scanner.
//!
//! Entry point for the CLI application.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dirsize::core::config::{EngineConfig, Strategy, DEFAULT_YIELD_EVERY_N};
use dirsize::core::telemetry::logging::{init_logging, init_logging_with_default};
use dirsize::models::entry::format_size;
use dirsize::models::{Entry, ScanEvent};
use dirsize::services::fs::path::normalize_path;
use dirsize::services::scan::sort::{default_direction, sort_entries};
use dirsize::services::scan::{ScanEngine, SortKey};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(
    name = "dirsize",
    version,
    about = "Incremental directory size scanner",
    long_about = "Computes the size of every directory under a root, bottom-up, \
                  reporting each directory once all of its subdirectories are measured."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Outstanding read/stat operations (live scans)
    #[arg(short = 'c', long, global = true, value_name = "NUM")]
    concurrency: Option<usize>,

    /// Directories finalized between cooperative yields
    #[arg(long, global = true, default_value_t = DEFAULT_YIELD_EVERY_N, value_name = "NUM")]
    yield_every: usize,

    /// Hide entries smaller than this many bytes in the output
    #[arg(long, global = true, default_value_t = 0, value_name = "BYTES")]
    min_size: u64,

    /// Aggregation strategy for in-memory scans: depth or kahn
    #[arg(long, global = true, value_name = "NAME")]
    strategy: Option<Strategy>,

    /// Output ordering: name, size or type
    #[arg(long, global = true, default_value = "size", value_name = "KEY")]
    sort: SortKey,

    /// Do not emit partial directory sizes
    #[arg(long, global = true)]
    no_progress: bool,

    /// Debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk a directory on the live filesystem
    Scan {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Gather every entry upfront, then aggregate in memory
    Collect {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Serve scans over WebSocket at /ws
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080", value_name = "ADDR")]
        addr: SocketAddr,
    },
}

impl Cli {
    fn engine_config(&self, live: bool) -> EngineConfig {
        let mut config = if live {
            EngineConfig::live()
        } else {
            EngineConfig::default()
        };
        if self.concurrency.is_some() {
            config.concurrency_limit = self.concurrency;
        }
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        config.yield_every_n = self.yield_every;
        config.size_filter_bytes = self.min_size;
        config.emit_progress = !self.no_progress;
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        init_logging_with_default("debug");
    } else {
        init_logging();
    }

    match &cli.command {
        Command::Scan { path } => {
            let config = cli.engine_config(true);
            config.validate().context("Invalid configuration")?;
            let root = normalize_path(path);
            let (engine, mut events) = ScanEngine::new(config).context("Failed to start engine")?;
            engine
                .start_scan(&root, None)
                .with_context(|| format!("Failed to scan {}", path.display()))?;
            let summary = drive(&engine, &mut events).await?;
            print_listing(&engine, &root, &cli, &summary);
        }
        Command::Collect { path } => {
            let config = cli.engine_config(false);
            config.validate().context("Invalid configuration")?;
            let collected = collect_entries(path)
                .with_context(|| format!("Failed to collect {}", path.display()))?;
            info!(
                entries = collected.entries.len(),
                failures = collected.failures,
                "collected entries"
            );
            let (engine, mut events) = ScanEngine::new(config).context("Failed to start engine")?;
            engine.scan_entries(collected.entries, None);
            let summary = drive(&engine, &mut events).await?;
            print_listing(&engine, "", &cli, &summary);
            if collected.failures > 0 {
                eprintln!("warning: {} entries could not be read", collected.failures);
            }
        }
        Command::Serve { addr } => {
            dirsize::server::serve(*addr, cli.engine_config(true))
                .await
                .context("Server failed")?;
        }
    }
    Ok(())
}

/// Every file and directory under `root`, with root-relative paths.
/// Entries that cannot be read are logged and skipped; a file whose size
/// cannot be read is kept with size 0.
fn collect_entries(root: &Path) -> Result<Collected> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let mut collected = Collected::default();
    for item in WalkDir::new(root).follow_links(false).min_depth(1) {
        let item = match item {
            Ok(item) => item,
            Err(err) => {
                let path = err.path().map(normalize_path).unwrap_or_default();
                warn!(path = %path, error = %err, "cannot read entry");
                collected.failures += 1;
                continue;
            }
        };
        let relative = item.path().strip_prefix(root).unwrap_or(item.path());
        let path = normalize_path(relative);
        if item.file_type().is_dir() {
            collected.entries.push(Entry::directory(&path));
            continue;
        }
        let size = match item.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!(path = %path, error = %err, "cannot read size");
                collected.failures += 1;
                0
            }
        };
        collected.entries.push(Entry::file(&path, size));
    }
    Ok(collected)
}

#[derive(Default)]
struct Collected {
    entries: Vec<Entry>,
    failures: usize,
}

struct Summary {
    total_entries: u64,
    elapsed_ms: u64,
    total_bytes: u64,
}

async fn drive(engine: &ScanEngine, events: &mut UnboundedReceiver<ScanEvent>) -> Result<Summary> {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                engine.cancel_scan();
                bail!("interrupted");
            }
        };
        match event {
            Some(ScanEvent::Error {
                path: Some(path),
                message,
            }) => eprintln!("warning: {path}: {message}"),
            Some(ScanEvent::Error { path: None, message }) => bail!(message),
            Some(ScanEvent::SizeFinal { path, size }) => debug!(path = %path, size, "final"),
            Some(ScanEvent::ScanComplete {
                total_entries,
                elapsed_ms,
                total_bytes,
            }) => {
                return Ok(Summary {
                    total_entries,
                    elapsed_ms,
                    total_bytes,
                })
            }
            Some(_) => {}
            None => bail!("scan ended without completing"),
        }
    }
}

fn print_listing(engine: &ScanEngine, root: &str, cli: &Cli, summary: &Summary) {
    let cache = engine.cache();
    let mut children = cache
        .get_filtered(root, engine.config().size_filter_bytes)
        .unwrap_or_default();
    sort_entries(&mut children, cli.sort, default_direction(cli.sort));

    for child in &children {
        let marker = if child.is_directory { "/" } else { "" };
        println!(
            "{:>12}  {:>5.1}%  {}{}",
            child.display_size(),
            child.share_of(summary.total_bytes) * 100.0,
            child.name,
            marker
        );
    }
    println!(
        "{:>12}  total ({} entries, {} ms)",
        format_size(summary.total_bytes),
        summary.total_entries,
        summary.elapsed_ms
    );
}
