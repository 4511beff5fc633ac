use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};

use mockrelay::{
    config::{Config, Mode, TargetConfig},
    storage::{Storage, StorageBackend},
    transfer,
};

#[derive(Debug, Parser)]
#[command(name = "mockrelay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the server.
    Start {
        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,
        /// Operating mode: proxy, mock, or intercept.
        #[arg(long)]
        mode: Option<String>,
        /// Upstream target URL for forward modes.
        #[arg(long)]
        target: Option<String>,
        /// Matching strategy: exact, smart, or fuzzy.
        #[arg(long)]
        strategy: Option<String>,
        /// Log level override.
        #[arg(long)]
        log_level: Option<String>,
        /// Path to config YAML.
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        storage: StorageArgs,
    },
    /// List recorded entries.
    List {
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Delete every recorded entry.
    Clear {
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Delete one recorded entry by id.
    Delete {
        id: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Export recorded entries to a journal document.
    Export {
        file: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Import recorded entries from a journal document.
    Import {
        file: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        storage: StorageArgs,
    },
}

#[derive(Debug, Args)]
struct StorageArgs {
    /// Storage backing: lowdb or sqlite.
    #[arg(long)]
    storage_type: Option<String>,
    /// Storage path.
    #[arg(long)]
    storage_path: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start {
            port,
            mode,
            target,
            strategy,
            log_level,
            config,
            storage,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(mode) = mode {
                config.server.mode = mode.parse::<Mode>()?;
            }
            if let Some(url) = target {
                let timeout_ms = config
                    .target
                    .as_ref()
                    .map(|target| target.timeout_ms)
                    .unwrap_or(mockrelay::config::DEFAULT_UPSTREAM_TIMEOUT_MS);
                config.target = Some(TargetConfig { url, timeout_ms });
            }
            if let Some(strategy) = strategy {
                config.matching.strategy = strategy.parse()?;
            }
            apply_storage_args(&mut config, &storage)?;

            let log_options = mockrelay::logging::LogOptions::resolve(&config, log_level.as_deref())?;
            mockrelay::logging::init(log_options)?;
            let proxy = mockrelay::proxy::serve(&config).await?;
            eprintln!("listening on {}", proxy.listen_addr);

            wait_for_shutdown_signal().await?;
            proxy.shutdown().await;
        }
        Command::List { config, storage } => {
            let storage = open_storage(config.as_deref(), &storage)?;
            let entries = storage.list().await?;
            for entry in &entries {
                println!(
                    "{}  {}  {} {} -> {}",
                    entry.id,
                    entry.created_at_unix_ms,
                    entry.request.method,
                    entry.request.path,
                    entry.response.status,
                );
            }
            eprintln!("{} entries", entries.len());
            storage.close();
        }
        Command::Clear { config, storage } => {
            let storage = open_storage(config.as_deref(), &storage)?;
            storage.clear().await?;
            eprintln!("cleared");
            storage.close();
        }
        Command::Delete {
            id,
            config,
            storage,
        } => {
            let storage = open_storage(config.as_deref(), &storage)?;
            let deleted = storage.delete(&id).await?;
            storage.close();
            if !deleted {
                anyhow::bail!("no entry with id `{id}`");
            }
            eprintln!("deleted {id}");
        }
        Command::Export {
            file,
            config,
            storage,
        } => {
            let storage = open_storage(config.as_deref(), &storage)?;
            let exported = transfer::export_to_path(&storage, &file).await?;
            eprintln!("exported {exported} entries to {}", file.display());
            storage.close();
        }
        Command::Import {
            file,
            config,
            storage,
        } => {
            let storage = open_storage(config.as_deref(), &storage)?;
            let imported = transfer::import_from_path(&storage, &file).await?;
            eprintln!("imported {imported} entries from {}", file.display());
            storage.close();
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::from_path(path),
        None => Ok(Config::default()),
    }
}

fn apply_storage_args(config: &mut Config, args: &StorageArgs) -> anyhow::Result<()> {
    if let Some(backend) = args.storage_type.as_deref() {
        config.storage.backend = parse_backend(backend)?;
    }
    if let Some(path) = args.storage_path.as_deref() {
        config.storage.path = path.to_owned();
    }
    Ok(())
}

fn parse_backend(raw: &str) -> anyhow::Result<StorageBackend> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "lowdb" => Ok(StorageBackend::Journal),
        "sqlite" => Ok(StorageBackend::Sqlite),
        other => anyhow::bail!("invalid storage type `{other}`; expected lowdb or sqlite"),
    }
}

/// Opens the same storage the server would, honoring config and overrides.
fn open_storage(
    config_path: Option<&std::path::Path>,
    args: &StorageArgs,
) -> anyhow::Result<Storage> {
    let mut config = load_config(config_path)?;
    apply_storage_args(&mut config, args)?;
    Storage::open(config.storage.backend, config.storage.path.as_str()).context("open storage")
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("install SIGINT handler")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
