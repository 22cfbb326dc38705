// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use llama_warden::config::{
    parse_timeout_secs, EnvSnapshot, ENV_LOG, ENV_RELEASES_DIR, ENV_START_TIMEOUT, ENV_TAG,
};
use llama_warden::release::{
    GithubReleaseIndex, HttpDownloader, ReleaseManager, ReleaseSettings, ReleasesDir,
    TagSelection, LATEST_TAG,
};
use llama_warden::server::{LlamaServer, ServerOptions};
use llama_warden::WardenError;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// llama-warden - download, launch and supervise llama.cpp's llama-server.
#[derive(Parser)]
#[command(name = "llama-warden")]
#[command(version = VERSION)]
#[command(about = "Download, launch and supervise llama.cpp's llama-server.")]
#[command(long_about = "llama-warden - run llama-server as a managed process\n\n\
    Download a release:  llama-warden fetch --tag latest\n\
    See what's offered:  llama-warden assets\n\
    Run the server:      llama-warden serve --port 8080 -- -hf ggml-org/gemma-3-1b-it-GGUF\n\
    Inspect the cache:   llama-warden cache")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log filter (e.g. "debug", "llama_warden=trace,llama-server=off")
    #[arg(long, global = true, env = ENV_LOG)]
    log_level: Option<String>,

    /// Release cache directory
    #[arg(long, global = true, env = ENV_RELEASES_DIR)]
    releases_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a llama-server binary and print its directory
    ///
    /// Examples:
    ///   llama-warden fetch
    ///   llama-warden fetch --tag b6780 --priority cuda
    ///   llama-warden fetch --archive-url https://.../llama-b6780-bin-ubuntu-x64.zip
    Fetch {
        #[command(flatten)]
        release: ReleaseArgs,
        /// Download again even if the release is cached
        #[arg(long)]
        force: bool,
    },

    /// List a release's archives and mark the one this host would use
    Assets {
        /// Release tag (default: latest)
        #[arg(long)]
        tag: Option<String>,
        #[arg(long = "priority", value_name = "PATTERN")]
        priority: Vec<String>,
        #[arg(long = "exclude", value_name = "PATTERN")]
        exclude: Vec<String>,
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start llama-server and keep it running until Ctrl-C
    ///
    /// Arguments after `--` are passed to llama-server verbatim.
    Serve {
        #[command(flatten)]
        release: ReleaseArgs,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Seconds to wait for the server to become ready
        #[arg(long, env = ENV_START_TIMEOUT)]
        timeout: Option<String>,
        /// Relay llama-server's own output
        #[arg(short, long)]
        verbose: bool,
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Show the release cache
    Cache,
}

#[derive(Args)]
struct ReleaseArgs {
    /// Release tag, or "latest"
    #[arg(long, conflicts_with_all = ["archive_url", "binary_dir"])]
    tag: Option<String>,
    /// Direct URL of a release archive
    #[arg(long, conflicts_with = "binary_dir")]
    archive_url: Option<String>,
    /// Existing directory containing llama-server
    #[arg(long)]
    binary_dir: Option<PathBuf>,
    /// Preferred build substrings (repeatable)
    #[arg(long = "priority", value_name = "PATTERN")]
    priority: Vec<String>,
    /// Build substrings to never select (repeatable)
    #[arg(long = "exclude", value_name = "PATTERN")]
    exclude: Vec<String>,
}

impl ReleaseArgs {
    fn settings(&self) -> ReleaseSettings {
        ReleaseSettings {
            local_dir: self.binary_dir.clone(),
            archive_url: self.archive_url.clone(),
            tag: self.tag.clone(),
            priority_patterns: non_empty(&self.priority),
            exclude_patterns: non_empty(&self.exclude),
        }
    }

    fn apply(&self, mut options: ServerOptions) -> ServerOptions {
        if let Some(dir) = &self.binary_dir {
            options = options.binary_dir(dir);
        }
        if let Some(url) = &self.archive_url {
            options = options.archive_url(url);
        }
        if let Some(tag) = &self.tag {
            options = options.tag(tag);
        }
        if !self.priority.is_empty() {
            options = options.priority_patterns(self.priority.iter().cloned());
        }
        if !self.exclude.is_empty() {
            options = options.exclude_patterns(self.exclude.iter().cloned());
        }
        options
    }
}

fn non_empty(patterns: &[String]) -> Option<Vec<String>> {
    (!patterns.is_empty()).then(|| patterns.to_vec())
}

fn init_tracing(filter: Option<&str>) {
    let filter = filter
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .ok();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    if let Err(e) = run(cli) {
        match e.downcast_ref::<WardenError>() {
            Some(err) => eprintln!("{}", err.report()),
            None => eprintln!("{} {:#}", "[✗]".red().bold(), e),
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let env = EnvSnapshot::capture();
    let releases = match &cli.releases_dir {
        Some(dir) => ReleasesDir::at(dir),
        None => ReleasesDir::from_env(&env)?,
    };

    match cli.command {
        Commands::Fetch { release, force } => fetch(&env, releases, &release, force),
        Commands::Assets {
            tag,
            priority,
            exclude,
            json,
        } => {
            let tag = tag
                .or_else(|| env.get(ENV_TAG).map(str::to_string))
                .unwrap_or_else(|| LATEST_TAG.to_string());
            let mut selection = TagSelection::new(tag);
            if !priority.is_empty() {
                selection = selection.with_priority(priority);
            }
            if !exclude.is_empty() {
                selection = selection.with_exclude(exclude);
            }
            assets(releases, &selection, json)
        }
        Commands::Serve {
            release,
            host,
            port,
            timeout,
            verbose,
            args,
        } => {
            let mut options = release
                .apply(ServerOptions::new().environment(env))
                .releases_dir(releases.root())
                .download_progress(true)
                .verbose(verbose)
                .args(args);
            if let Some(host) = host {
                options = options.host(host);
            }
            if let Some(port) = port {
                options = options.port(port);
            }
            if let Some(raw) = timeout {
                options = options.start_timeout(parse_timeout_secs("--timeout", &raw)?);
            }
            serve(options)
        }
        Commands::Cache => cache(&releases),
    }
}

fn github_manager(releases: ReleasesDir) -> Result<ReleaseManager> {
    Ok(ReleaseManager::with_sources(
        releases,
        Arc::new(GithubReleaseIndex::llama_cpp()?),
        Arc::new(HttpDownloader::new().with_progress(true)),
    ))
}

fn fetch(env: &EnvSnapshot, releases: ReleasesDir, release: &ReleaseArgs, force: bool) -> Result<()> {
    let config = release.settings().resolve(env)?;
    let manager = github_manager(releases)?;

    println!("{} Resolving {}", "[↓]".yellow(), config.describe());
    let resolved = manager.resolve_with(&config, force)?;
    println!("{} llama-server ready in {}", "[✓]".green(), resolved.dir().display());
    println!("{}", resolved.executable().display());
    Ok(())
}

fn assets(releases: ReleasesDir, selection: &TagSelection, json: bool) -> Result<()> {
    let manager = github_manager(releases)?;
    let fetcher = manager.fetcher();

    let tag = fetcher.resolve_tag(&selection.tag)?;
    let all = fetcher.archive_assets(&tag)?;
    let chosen = fetcher.choose_asset(&tag, selection).ok();

    if json {
        let listing = serde_json::json!({
            "tag": tag,
            "platform": fetcher.platform().to_string(),
            "selected": chosen.as_ref().map(|c| c.name.as_str()),
            "assets": all,
        });
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    println!("{} {} ({})", "Release".bold(), tag.cyan(), fetcher.platform());
    for asset in &all {
        let size = asset
            .size
            .map(|b| format!("{:>6.1} MB", b as f64 / (1024.0 * 1024.0)))
            .unwrap_or_else(|| "     ? MB".to_string());
        let is_chosen = chosen.as_ref().is_some_and(|c| c.name == asset.name);
        if is_chosen {
            println!("  {} {}  {}", "→".green().bold(), size.dimmed(), asset.name.green().bold());
        } else {
            println!("    {}  {}", size.dimmed(), asset.name);
        }
    }
    if chosen.is_none() {
        println!("{} No archive matches this host", "[!]".yellow());
    }
    Ok(())
}

fn serve(options: ServerOptions) -> Result<()> {
    let server = LlamaServer::new(options)?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let guard = server.start_scoped()?;
    println!("{} llama-server is ready", "[✓]".green());
    println!("      URL:     {}", guard.server_url()?.cyan());
    println!("      OpenAI:  {}", guard.openai_base_url()?.cyan());
    if let Some(pid) = guard.pid() {
        println!("      PID:     {}", pid);
    }
    println!("      {}", "Press Ctrl-C to stop.".dimmed());

    let _ = rx.recv();

    println!("{} Stopping llama-server...", "[■]".yellow());
    guard.finish()?;
    println!("{} Stopped", "[✓]".green());
    Ok(())
}

fn cache(releases: &ReleasesDir) -> Result<()> {
    println!("{} {}", "Cache:".bold(), releases.root().display());
    let entries = releases.entries()?;
    if entries.is_empty() {
        println!("  {}", "(empty)".dimmed());
    }
    for entry in entries {
        let name = entry
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        println!("  {}", name);
    }
    Ok(())
}
