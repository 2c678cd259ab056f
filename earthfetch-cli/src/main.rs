//! Earthfetch CLI: catalog inspection, downloads and cache management.
//!
//! Commands:
//! - `list`: show the sources of a catalog and their backend
//! - `plan`: print the files a fetch would write, without network access
//! - `fetch`: download one or more sources into their local caches
//! - `cache status`: planned files versus what is already on disk
//! - `cache verify`: re-hash cached files against their manifests

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use earthfetch_core::data::{classify_url, make_downloader, DownloadOptions, LogProgress};
use earthfetch_core::read_sources;
use earthfetch_core::source::SourceCatalog;
use earthfetch_runner::{
    cache_status, fetch_sources, parse_date, resolve_times, verify_cache, FetchRequest,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "earthfetch",
    version,
    about = "Earthfetch: download earth-observation data into local caches"
)]
struct Cli {
    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Window {
    /// Start date (YYYY-MM-DD). Defaults to the source's time.start.
    #[arg(long)]
    start: Option<String>,

    /// End date (YYYY-MM-DD). Defaults to time.end, then today.
    #[arg(long)]
    end: Option<String>,
}

impl Window {
    fn request(&self) -> Result<FetchRequest> {
        let parse = |raw: &Option<String>| -> Result<Option<NaiveDateTime>> {
            raw.as_deref()
                .map(|s| parse_date(s).with_context(|| format!("bad date '{s}'")))
                .transpose()
        };
        Ok(FetchRequest {
            start: parse(&self.start)?,
            end: parse(&self.end)?,
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the sources of a catalog.
    List {
        /// YAML source catalog.
        #[arg(long)]
        config: PathBuf,
    },
    /// Print the remote and local path of every file a fetch would touch.
    Plan {
        #[arg(long)]
        config: PathBuf,

        /// Source name.
        source: String,

        #[command(flatten)]
        window: Window,
    },
    /// Download sources into their local caches.
    Fetch {
        #[arg(long)]
        config: PathBuf,

        /// Sources to fetch. Defaults to every source in the catalog.
        sources: Vec<String>,

        #[command(flatten)]
        window: Window,

        /// Parallel transfers per file-cache batch.
        #[arg(long, default_value_t = 4)]
        jobs: usize,

        /// Retries per request on transient failures.
        #[arg(long, default_value_t = 3)]
        retries: u32,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report which files of a source are already cached.
    Status {
        #[arg(long)]
        config: PathBuf,

        source: String,

        #[command(flatten)]
        window: Window,

        /// Print the full status as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Check cached files against their checksum manifests.
    Verify {
        /// Cache root to walk.
        root: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::List { config } => run_list(&config),
        Commands::Plan {
            config,
            source,
            window,
        } => run_plan(&config, &source, &window),
        Commands::Fetch {
            config,
            sources,
            window,
            jobs,
            retries,
            timeout,
        } => run_fetch(&config, &sources, &window, jobs, retries, timeout),
        Commands::Cache { action } => match action {
            CacheAction::Status {
                config,
                source,
                window,
                json,
            } => run_cache_status(&config, &source, &window, json),
            CacheAction::Verify { root } => run_cache_verify(&root),
        },
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_catalog(path: &Path) -> Result<SourceCatalog> {
    read_sources(path).with_context(|| format!("failed to load catalog {}", path.display()))
}

fn run_list(config: &Path) -> Result<()> {
    let catalog = load_catalog(config)?;
    println!("{:<24} {:<18} URL", "Source", "Backend");
    println!("{}", "-".repeat(72));
    for source in catalog.iter() {
        let backend = match classify_url(source) {
            Ok(kind) => kind.to_string(),
            Err(_) => "invalid".to_string(),
        };
        println!(
            "{:<24} {:<18} {}",
            source.name,
            backend,
            source.url.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn run_plan(config: &Path, name: &str, window: &Window) -> Result<()> {
    let catalog = load_catalog(config)?;
    let source = catalog.get(name)?;
    let downloader = make_downloader(source, &DownloadOptions::default())?;
    let times = resolve_times(source, &window.request()?)?;
    for planned in downloader.plan(&times)? {
        println!(
            "{}  {}  {}",
            earthfetch_core::timestamp::display(planned.time),
            planned.remote,
            planned.local.display()
        );
    }
    Ok(())
}

fn run_fetch(
    config: &Path,
    sources: &[String],
    window: &Window,
    jobs: usize,
    retries: u32,
    timeout: u64,
) -> Result<()> {
    if jobs == 0 {
        bail!("--jobs must be at least 1");
    }
    let catalog = load_catalog(config)?;
    let mut options = DownloadOptions {
        jobs,
        ..Default::default()
    };
    options.transport.max_retries = retries;
    options.transport.timeout = Duration::from_secs(timeout);

    let summary = fetch_sources(&catalog, sources, &window.request()?, &options, &LogProgress)?;

    for (name, report) in &summary.reports {
        println!(
            "{name}: {} files ({} downloaded, {} cached, {} missing)",
            report.files.len(),
            report.downloaded,
            report.cached,
            report.missing.len()
        );
    }

    if !summary.all_succeeded() {
        for (name, err) in &summary.errors {
            eprintln!("Error for {name}: {err}");
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_cache_status(config: &Path, name: &str, window: &Window, json: bool) -> Result<()> {
    let catalog = load_catalog(config)?;
    let source = catalog.get(name)?;
    let downloader = make_downloader(source, &DownloadOptions::default())?;
    let times = resolve_times(source, &window.request()?)?;
    let status = cache_status(downloader.as_ref(), &times)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Source: {}", status.source);
    println!("Cached: {}/{}", status.cached(), status.entries.len());
    for entry in status.entries.iter().filter(|e| !e.is_cached()) {
        println!(
            "  missing {}  {}",
            earthfetch_core::timestamp::display(entry.time),
            entry.local.display()
        );
    }
    Ok(())
}

fn run_cache_verify(root: &Path) -> Result<()> {
    if !root.exists() {
        println!("Cache directory does not exist: {}", root.display());
        return Ok(());
    }
    let report = verify_cache(root)
        .with_context(|| format!("failed to verify cache {}", root.display()))?;

    println!("Manifests: {}", report.manifests);
    println!("Checked:   {}", report.checked);
    println!("Intact:    {}", report.intact);
    for path in &report.corrupt {
        println!("Quarantined: {}", path.display());
    }
    for path in &report.missing {
        println!("Missing:     {}", path.display());
    }

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}
