use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use relay::backends::{FileStateStore, MemoryBackend, MemoryStateStore, RestBackend};
use relay::config::Config;
use relay::core::{
    QueueSnapshot,
    StateStore,
    UploadEvent,
    UploadFile,
    UploadId,
    UploadManager,
};
use relay::thumbnail::ThumbnailGenerator;
use relay::utils::{format_bytes, format_item};

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Resumable chunked media uploads")]
#[command(args_conflicts_with_subcommands = true)]
struct CliArgs {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "relay.toml", global = true)]
    config: PathBuf,

    /// Draft the uploaded media belongs to.
    #[arg(short, long, default_value = "default")]
    draft: String,

    /// Priority of the enqueued files, higher starts first.
    #[arg(short, long)]
    priority: Option<i32>,

    /// Upload into an in-memory backend instead of the configured one.
    #[arg(long)]
    dry_run: bool,

    /// Files to upload.
    files: Vec<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the persisted queue.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let config = Config::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command {
        Some(Command::Status) => status(&config).await,
        None => upload(&config, args).await,
    }
}

async fn status(config: &Config) -> anyhow::Result<()> {
    let store = FileStateStore::new(&config.upload.state_dir);
    let Some(data) = store.load(&config.upload.state_key).await? else {
        println!("No queue state in {}", store.dir().display());
        return Ok(());
    };

    let snapshot: QueueSnapshot = serde_json::from_str(&data).context("reading queue state")?;
    if snapshot.items.is_empty() {
        println!("Queue is empty");
    }
    for item in &snapshot.items {
        println!("{}", format_item(item));
    }

    Ok(())
}

async fn upload(config: &Config, args: CliArgs) -> anyhow::Result<()> {
    if args.files.is_empty() {
        bail!("no files given");
    }

    let mut queue_config = match config.queue_config() {
        Ok(queue_config) => queue_config,
        Err(_) if args.dry_run => {
            let mut fallback = config.clone();
            fallback.upload.owner_id.get_or_insert_with(|| "dry-run".to_string());
            fallback.queue_config()?
        }
        Err(err) => return Err(err.into()),
    };

    if let Some(priority) = args.priority {
        queue_config.default_priority = priority;
    }

    let builder = UploadManager::builder(queue_config)
        .thumbnails(ThumbnailGenerator::new(config.thumbnail_config()));
    let builder = if args.dry_run {
        let backend = Arc::new(MemoryBackend::new());
        builder
            .storage(backend.clone())
            .metadata(backend)
            .state_store(Arc::new(MemoryStateStore::new()))
    } else {
        let backend = Arc::new(RestBackend::new(config.rest_config()?)?);
        tokio::fs::create_dir_all(&config.upload.state_dir)
            .await
            .with_context(|| format!("creating {}", config.upload.state_dir.display()))?;
        builder
            .storage(backend.clone())
            .metadata(backend)
            .state_store(Arc::new(FileStateStore::new(&config.upload.state_dir)))
    };

    let handle = builder.build()?;
    let manager = handle.manager.clone();
    let mut events = manager.subscribe();

    let mut pending = HashSet::new();
    for path in &args.files {
        let file = UploadFile::from_path(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        tracing::info!(file = %file.name, size = %format_bytes(file.size()), "queueing");
        pending.insert(manager.enqueue(file, args.draft.clone()).await?);
    }

    let mut failed: Vec<UploadId> = Vec::new();
    while !pending.is_empty() {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(remaining = pending.len(), "interrupted");
                break;
            }
        };

        match event {
            Ok(UploadEvent::Progress { upload_id, progress }) => {
                tracing::info!(upload_id = %upload_id, progress, "progress");
            }
            Ok(UploadEvent::Completed { upload_id, public_url, .. }) => {
                println!("{} {}", upload_id, public_url);
                pending.remove(&upload_id);
            }
            Ok(UploadEvent::Failed { upload_id, error }) => {
                tracing::error!(upload_id = %upload_id, error = %error, "upload failed");
                pending.remove(&upload_id);
                failed.push(upload_id);
            }
            Ok(UploadEvent::Removed { upload_id }) => {
                pending.remove(&upload_id);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event receiver lagged, polling queue");
                for item in manager.items().await? {
                    if item.status.is_terminal() && pending.remove(&item.id) && item.error.is_some() {
                        failed.push(item.id);
                    }
                }
            }
            Err(RecvError::Closed) => break,
        }
    }

    drop(manager);
    handle.shutdown().await?;

    if !failed.is_empty() {
        bail!("{} upload(s) failed", failed.len());
    }

    Ok(())
}
