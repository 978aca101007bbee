use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;
use url::Url;
use vdisk_overlay::{
    delete_vm_overlays, list_vms_with_overlays, BaseSourceConfig, BlockDevice, BlockSource,
    CowBlockDevice, DiskIdentity, ExportBundle, FsOverlayDb, OverlayConfig, OverlayStore,
    DEFAULT_BLOCK_SIZE, DEFAULT_FLUSH_THRESHOLD,
};

#[derive(Parser, Debug)]
#[command(
    name = "vdisk-overlay",
    version,
    about = "Inspect, back up and clone VM disk overlays stored in a filesystem overlay store."
)]
struct Cli {
    /// Root directory of the overlay store.
    ///
    /// Environment variable: `VDISK_DB_ROOT`.
    #[arg(long, env = "VDISK_DB_ROOT", global = true)]
    db_root: Option<PathBuf>,

    /// Overlay block size in bytes.
    ///
    /// Environment variable: `VDISK_BLOCK_SIZE`.
    #[arg(long, env = "VDISK_BLOCK_SIZE", default_value_t = DEFAULT_BLOCK_SIZE, global = true)]
    block_size: usize,

    /// Number of buffered writes that triggers a flush.
    ///
    /// Environment variable: `VDISK_FLUSH_THRESHOLD`.
    #[arg(long, env = "VDISK_FLUSH_THRESHOLD", default_value_t = DEFAULT_FLUSH_THRESHOLD, global = true)]
    flush_threshold: usize,

    /// Log filter (tracing-subscriber EnvFilter syntax). `RUST_LOG` takes precedence.
    ///
    /// Environment variable: `VDISK_LOG_LEVEL`.
    #[arg(long, env = "VDISK_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, action = clap::ArgAction::SetTrue, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct DiskArgs {
    /// VM id.
    #[arg(long = "vm")]
    vm_id: String,

    /// Disk id within the VM.
    #[arg(long = "disk")]
    disk_id: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the block count and byte footprint of a disk's overlay.
    Stats(DiskArgs),
    /// Print the modified block ranges of a disk's overlay.
    Ranges(DiskArgs),
    /// Record a snapshot descriptor for a disk.
    Snapshot {
        #[command(flatten)]
        disk: DiskArgs,
        #[arg(long)]
        description: Option<String>,
    },
    /// List snapshot descriptors for a disk, oldest first.
    Snapshots(DiskArgs),
    /// Write every overlay block of a disk to a bundle file.
    Export {
        #[command(flatten)]
        disk: DiskArgs,
        #[arg(long, value_name = "PATH")]
        out: PathBuf,
        /// Allow overwriting an existing bundle file.
        #[arg(long, action = clap::ArgAction::SetTrue)]
        force: bool,
    },
    /// Replace a disk's overlay with the contents of a bundle file.
    Import {
        #[command(flatten)]
        disk: DiskArgs,
        #[arg(long, value_name = "PATH")]
        input: PathBuf,
    },
    /// List VM ids that have overlay data.
    ListVms,
    /// Delete every overlay block and snapshot of a VM.
    DeleteVm {
        #[arg(long = "vm")]
        vm_id: String,
    },
    /// Resolve one block through the overlay and an optional base image.
    ReadBlock {
        #[command(flatten)]
        disk: DiskArgs,
        #[arg(long)]
        index: u64,
        #[arg(long, value_name = "PATH", conflicts_with = "base_url")]
        base_file: Option<PathBuf>,
        #[arg(long, value_name = "URL")]
        base_url: Option<Url>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsOutput {
    vm_id: String,
    disk_id: String,
    block_size: usize,
    block_count: u64,
    total_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadBlockOutput {
    index: u64,
    source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref(), cli.json_logs)?;
    run(cli).await
}

fn init_logging(log_level: Option<&str>, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.unwrap_or("info")))
        .context("invalid log filter")?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = OverlayConfig::default()
        .with_block_size(cli.block_size)
        .with_flush_threshold(cli.flush_threshold);
    config.validate().context("invalid overlay configuration")?;

    let Some(db_root) = cli.db_root else {
        bail!("--db-root (or VDISK_DB_ROOT) is required");
    };
    let db = FsOverlayDb::shared(&db_root)
        .await
        .with_context(|| format!("open overlay store {}", db_root.display()))?;

    let result = dispatch(cli.command, db, config).await;
    FsOverlayDb::shutdown_shared(&db_root).context("close overlay store")?;
    result
}

async fn dispatch(
    command: Command,
    db: Arc<FsOverlayDb>,
    config: OverlayConfig,
) -> anyhow::Result<()> {
    match command {
        Command::Stats(disk) => {
            let store = open_store(&db, &disk, &config).await?;
            let stats = store.stats().await?;
            print_json(&StatsOutput {
                vm_id: disk.vm_id,
                disk_id: disk.disk_id,
                block_size: config.block_size,
                block_count: stats.block_count,
                total_bytes: stats.total_bytes,
            })?;
            store.close().await?;
        }
        Command::Ranges(disk) => {
            let store = open_store(&db, &disk, &config).await?;
            print_json(&store.modified_ranges().await?)?;
            store.close().await?;
        }
        Command::Snapshot { disk, description } => {
            let store = open_store(&db, &disk, &config).await?;
            let descriptor = store.create_snapshot(description).await?;
            print_json(&descriptor)?;
            store.close().await?;
        }
        Command::Snapshots(disk) => {
            let store = open_store(&db, &disk, &config).await?;
            print_json(&store.list_snapshots().await?)?;
            store.close().await?;
        }
        Command::Export { disk, out, force } => {
            if out.exists() && !force {
                bail!(
                    "refusing to overwrite {} (use --force to override)",
                    out.display()
                );
            }
            let store = open_store(&db, &disk, &config).await?;
            let bundle = store.export().await?;
            let file =
                File::create(&out).with_context(|| format!("create {}", out.display()))?;
            bundle
                .write_to(BufWriter::new(file))
                .with_context(|| format!("write bundle {}", out.display()))?;
            tracing::info!(path = %out.display(), blocks = bundle.blocks.len(), "wrote bundle");
            print_json(&bundle.metadata)?;
            store.close().await?;
        }
        Command::Import { disk, input } => {
            let file =
                File::open(&input).with_context(|| format!("open {}", input.display()))?;
            let bundle = ExportBundle::read_from(BufReader::new(file))
                .with_context(|| format!("read bundle {}", input.display()))?;
            let metadata = bundle.metadata.clone();
            let store = open_store(&db, &disk, &config).await?;
            store
                .import(bundle)
                .await
                .with_context(|| format!("import into {}", store.identity()))?;
            print_json(&metadata)?;
            store.close().await?;
        }
        Command::ListVms => {
            print_json(&list_vms_with_overlays(db.as_ref()).await?)?;
        }
        Command::DeleteVm { vm_id } => {
            delete_vm_overlays(db.as_ref(), &vm_id).await?;
        }
        Command::ReadBlock {
            disk,
            index,
            base_file,
            base_url,
        } => {
            let base = match (base_file, base_url) {
                (Some(path), _) => BaseSourceConfig::File { path },
                (None, Some(url)) => BaseSourceConfig::Http {
                    url,
                    headers: Vec::new(),
                },
                (None, None) => BaseSourceConfig::Memory { bytes: Vec::new() },
            };
            let base = base.open().await.context("open base image")?;
            let cow = CowBlockDevice::new(base, open_store(&db, &disk, &config).await?);
            let resolved = cow.read_block_with_source(index).await?;
            let output = match resolved {
                Some((data, source)) => ReadBlockOutput {
                    index,
                    source: match source {
                        BlockSource::Overlay => "overlay",
                        BlockSource::Base => "base",
                    },
                    sha256: Some(hex::encode(Sha256::digest(&data))),
                },
                None => ReadBlockOutput {
                    index,
                    source: "none",
                    sha256: None,
                },
            };
            print_json(&output)?;
            cow.close().await?;
        }
    }
    Ok(())
}

async fn open_store(
    db: &Arc<FsOverlayDb>,
    disk: &DiskArgs,
    config: &OverlayConfig,
) -> anyhow::Result<OverlayStore<FsOverlayDb>> {
    let identity = DiskIdentity::new(disk.vm_id.clone(), disk.disk_id.clone())?;
    let store = OverlayStore::open(db.clone(), identity, *config)
        .await
        .with_context(|| format!("open overlay {}/{}", disk.vm_id, disk.disk_id))?;
    Ok(store)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}
