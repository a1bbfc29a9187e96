//! CLI entrypoint: `newsreap crawl <startUrl> [...]` starts a single crawl job and blocks
//! until it finishes or is interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use newsreap::{CrawlConfig, CrawlMode, Engine};

#[derive(Parser)]
#[command(name = "newsreap", version, about = "Polite, resilient, large-scale news crawler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl starting from a single seed URL.
    Crawl(CrawlArgs),
}

#[derive(Args)]
struct CrawlArgs {
    /// Seed URL to start the crawl from.
    start_url: String,

    #[arg(long = "type", value_enum, default_value_t = CrawlTypeArg::Basic)]
    crawl_type: CrawlTypeArg,

    #[arg(long = "max-downloads")]
    max_downloads: Option<usize>,

    #[arg(long = "max-depth")]
    max_depth: Option<u32>,

    #[arg(long = "rate-limit")]
    rate_limit: Option<u64>,

    #[arg(long = "db")]
    db: Option<PathBuf>,

    #[arg(long = "prefer-cache", default_value_t = false)]
    prefer_cache: bool,

    #[arg(long = "verbose", short = 'v', default_value_t = 0)]
    verbose: u8,
}

#[derive(Copy, Clone, ValueEnum)]
enum CrawlTypeArg {
    Basic,
    Intelligent,
    Gazetteer,
    #[value(name = "structure-only")]
    StructureOnly,
}

impl From<CrawlTypeArg> for CrawlMode {
    fn from(value: CrawlTypeArg) -> Self {
        match value {
            CrawlTypeArg::Basic => CrawlMode::Basic,
            CrawlTypeArg::Intelligent => CrawlMode::Intelligent,
            CrawlTypeArg::Gazetteer => CrawlMode::Gazetteer,
            CrawlTypeArg::StructureOnly => CrawlMode::StructureOnly,
        }
    }
}

fn init_logging(verbose: u8) {
    let default_directive = match verbose {
        0 => "newsreap=info",
        1 => "newsreap=debug",
        _ => "newsreap=trace",
    };
    let filter = std::env::var("NEWSREAP_LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .try_init()
        .ok();
}

/// Forward `NEWSREAP_HEADLESS_BINARY` into the `CHROMIUM_PATH` variable
/// `browser_setup::find_browser_executable` already honors, without overriding an
/// explicit `CHROMIUM_PATH` the operator set directly.
fn apply_headless_binary_env() {
    if std::env::var_os("CHROMIUM_PATH").is_none() {
        if let Ok(path) = std::env::var("NEWSREAP_HEADLESS_BINARY") {
            // SAFETY: single-threaded startup, before any other thread reads the environment.
            unsafe { std::env::set_var("CHROMIUM_PATH", path) };
        }
    }
}

fn build_config(args: CrawlArgs) -> anyhow::Result<CrawlConfig> {
    let data_dir = std::env::var("NEWSREAP_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"));
    let db_path = args
        .db
        .or_else(|| std::env::var("NEWSREAP_DB_PATH").ok().map(PathBuf::from));

    let mut builder = CrawlConfig::builder()
        .start_url(args.start_url)
        .crawl_type(args.crawl_type.into())
        .data_dir(data_dir)
        .prefer_cache(args.prefer_cache)
        .verbose(args.verbose);

    if let Some(db_path) = db_path {
        builder = builder.db_path(db_path);
    }
    if let Some(n) = args.max_downloads {
        builder = builder.max_downloads(n);
    }
    if let Some(n) = args.max_depth {
        builder = builder.max_depth(n);
    }
    if let Some(ms) = args.rate_limit {
        builder = builder.rate_limit_ms(ms);
    }

    builder.build()
}

async fn run_crawl(args: CrawlArgs) -> anyhow::Result<ExitCode> {
    init_logging(args.verbose);
    apply_headless_binary_env();

    let config = build_config(args)?;
    let engine = Engine::new(config).await?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(not(unix))]
    let sigterm = futures::future::pending::<()>();

    #[cfg(unix)]
    let sigterm_recv = async { sigterm.recv().await };
    #[cfg(not(unix))]
    let sigterm_recv = sigterm;

    let result = tokio::select! {
        stats = engine.run() => {
            match stats {
                Ok(stats) => {
                    info!(fetched = stats.fetched, articles = stats.articles, errors = stats.errors, "crawl finished");
                    Ok(ExitCode::from(0))
                }
                Err(err) => {
                    error!(%err, "crawl failed");
                    Ok(ExitCode::from(1))
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            handle_abort_then_wait(&engine).await
        }
        _ = sigterm_recv => {
            handle_abort_then_wait(&engine).await
        }
    };

    engine.shutdown().await.ok();
    result
}

/// First interrupt: request graceful shutdown and wait up to `shutdownGraceMs` for
/// in-flight work to settle. A second interrupt while waiting hard-stops immediately.
async fn handle_abort_then_wait(engine: &std::sync::Arc<Engine>) -> anyhow::Result<ExitCode> {
    warn!("interrupt received, requesting graceful shutdown");
    engine.request_abort();
    let grace = std::time::Duration::from_millis(engine.shutdown_grace_ms());

    tokio::select! {
        _ = tokio::time::sleep(grace) => {
            engine.request_hard_stop();
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("second interrupt received, hard stopping");
            engine.request_hard_stop();
        }
    }
    Ok(ExitCode::from(130))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Command::Crawl(args) = cli.command;

    match run_crawl(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("newsreap: {err:#}");
            ExitCode::from(1)
        }
    }
}
