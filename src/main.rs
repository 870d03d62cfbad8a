use attire_cache::{CacheOptions, ContentCache, ContentHash, Roots, ValidationOutcome};
use attire_config::Config;
use attire_sync::Session;
use attire_transfer::{EventBus, StaticToken, TransferOrchestrator};
use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use exn::{OptionExt, ResultExt};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

type Result<T> = std::result::Result<T, exn::Exn<ErrorKind>>;

#[derive(Debug, Display, Error)]
enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("could not open the cache")]
    Cache,
    #[display("invalid content hash: {_0}")]
    InvalidHash(#[error(not(source))] String),
    #[display("no broker endpoint configured (broker.endpoint or ATTIRE_BROKER__ENDPOINT)")]
    NotConnected,
    #[display("transfer failed")]
    Sync,
}

#[derive(Parser, Debug)]
#[command(name = "attire", version, about = "Content-addressed appearance file cache")]
struct Cli {
    /// Config file (TOML, YAML or JSON).
    #[arg(short, long, env = "ATTIRE_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// More output; repeat for more still. `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch files from the broker into the cache.
    Download { hashes: Vec<String> },
    /// Offer cached files to the broker.
    Upload { hashes: Vec<String> },
    /// Show (and index) the cache entry for files on disk.
    Resolve { paths: Vec<PathBuf> },
    /// Revalidate every indexed entry against the filesystem.
    Verify,
    /// Evict least recently used cache files down to a size.
    Prune {
        /// Bytes to keep. Defaults to `cache.max_size`.
        #[arg(long)]
        max_size: Option<u64>,
    },
    /// Delete every file uploaded to the broker.
    DeleteRemote,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            ExitCode::FAILURE
        },
    }
}

fn parse_hashes(hashes: &[String]) -> Result<Vec<ContentHash>> {
    hashes
        .iter()
        .map(|hash| hash.parse::<ContentHash>().or_raise(|| ErrorKind::InvalidHash(hash.clone())))
        .collect()
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let roots = Roots::new(&config.cache.directory, config.cache.external_directory.clone())
        .or_raise(|| ErrorKind::Config)?;
    let options = CacheOptions { index_file: None, persist_debounce: config.cache.persist_debounce() };
    let cache = ContentCache::open(roots, options).await.or_raise(|| ErrorKind::Cache)?;

    let (_settings, receiver) = watch::channel(config.transfer.clone());
    let tokens = Arc::new(StaticToken::new(config.broker.token.clone()));
    let orchestrator = Arc::new(TransferOrchestrator::new(receiver, tokens, EventBus::default()));
    orchestrator.watch_settings();
    let session = Session::new(orchestrator, cache);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let uploads = Arc::clone(session.uploads());
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted; cancelling");
                cancel.cancel();
                uploads.cancel();
            }
        });
    }

    let result = execute(&session, &config, cli.command, &cancel).await;
    // Keep what was indexed even when the command failed.
    if let Err(err) = session.shutdown().await {
        tracing::error!(error = ?err, "Could not persist cache index");
    }
    result
}

async fn execute(session: &Session, config: &Config, command: Command, cancel: &CancellationToken) -> Result<()> {
    let connect = || -> Result<()> {
        let endpoint = config.broker.endpoint.clone().ok_or_raise(|| ErrorKind::NotConnected)?;
        session.connect(endpoint);
        Ok(())
    };

    match command {
        Command::Download { hashes } => {
            let hashes = parse_hashes(&hashes)?;
            connect()?;
            let report = session.downloads().download_files(&hashes, cancel).await.or_raise(|| ErrorKind::Sync)?;
            let lines = [
                ("downloaded", &report.downloaded),
                ("forbidden", &report.forbidden),
                ("in-progress", &report.in_progress),
                ("failed", &report.failed),
            ];
            for (label, hashes) in lines {
                for hash in hashes {
                    println!("{label}\t{hash}");
                }
            }
        },
        Command::Upload { hashes } => {
            let hashes = parse_hashes(&hashes)?;
            connect()?;
            let report = session.uploads().upload(&hashes).await.or_raise(|| ErrorKind::Sync)?;
            let lines = [
                ("uploaded", &report.uploaded),
                ("skipped", &report.skipped),
                ("missing", &report.missing),
                ("forbidden", &report.forbidden),
                ("failed", &report.failed),
            ];
            for (label, hashes) in lines {
                for hash in hashes {
                    println!("{label}\t{hash}");
                }
            }
        },
        Command::Resolve { paths } => {
            for path in paths {
                match session.cache().resolve(&path).await {
                    Some(entry) => println!("{}\t{}\t{}", entry.hash, entry.size, entry.logical_path),
                    None => println!("-\t-\t{}", path.display()),
                }
            }
        },
        Command::Verify => {
            for entry in session.cache().entries().await {
                let outcome = match session.cache().revalidate(&entry).await {
                    ValidationOutcome::Valid => continue,
                    ValidationOutcome::Updated(hash) => format!("updated\t{hash}"),
                    ValidationOutcome::Deleted => "deleted".to_string(),
                };
                println!("{}\t{outcome}", entry.logical_path);
            }
        },
        Command::Prune { max_size } => {
            let Some(max_size) = max_size.or(config.cache.max_size) else {
                tracing::warn!("No size limit given or configured; nothing to prune");
                return Ok(());
            };
            let report = session.cache().enforce_size_limit(max_size).await;
            println!("freed {} bytes from {} files", report.freed_bytes, report.removed.len());
        },
        Command::DeleteRemote => {
            connect()?;
            session.uploads().delete_all_files(cancel).await.or_raise(|| ErrorKind::Sync)?;
        },
    }
    Ok(())
}
