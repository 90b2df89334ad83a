//! Packrat backup server daemon and maintenance CLI.

use clap::{Parser, Subcommand};
use packratd::cleanup::CleanupEngine;
use packratd::config::Config;
use packratd::coordinator::{ClientCoordinator, CoreContext};
use packratd::db;
use packratd::extents::ExtentIterator;
use packratd::hashing::sidecar::{self, SidecarFile};
use packratd::patcher;
use packratd::protocol::TcpConnector;
use packratd::store::{FileStore, SpaceReclaimer};
use packratd::vhd::VhdFile;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "packratd")]
#[command(about = "Packrat deduplicating backup server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server: coordinators, staging flusher, nightly cleanup
    Serve,
    /// Run a retention pass now
    Cleanup {
        /// Urgent mode: free at least this many bytes
        #[arg(long)]
        urgent: Option<u64>,
    },
    /// Materialize the raw volume image out of a VHD
    MountVhd {
        /// VHD file
        path: PathBuf,
        /// Output file for the raw image
        mountpoint: PathBuf,
        /// Byte offset into the virtual disk (e.g. a partition start)
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Apply a patch stream against a base file
    PatchApply {
        base: PathBuf,
        patch: PathBuf,
        output: PathBuf,
        /// Sparse-extent table received with the patch
        #[arg(long)]
        sparse_extents: Option<PathBuf>,
    },
    /// Recompute a file's hash sidecar and compare
    VerifySidecar {
        file: PathBuf,
        hash: PathBuf,
    },
    /// Client registration
    Client {
        #[command(subcommand)]
        command: ClientCommands,
    },
}

#[derive(Subcommand)]
enum ClientCommands {
    /// Register a client and its agent address
    Add {
        name: String,
        addr: String,
    },
    /// List registered clients
    List,
}

/// Exit codes: 0 ok, 1 failure, 2 usage (clap), 3 IO, 4 hash mismatch.
#[derive(Debug, thiserror::Error)]
#[error("hash mismatch")]
struct HashMismatch;

fn classify(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<HashMismatch>().is_some() {
        return 4;
    }
    let is_io = err.downcast_ref::<std::io::Error>().is_some()
        || matches!(err.downcast_ref::<packratd::vhd::VhdError>(), Some(packratd::vhd::VhdError::Io(_)))
        || matches!(
            err.downcast_ref::<packratd::patcher::PatchError>(),
            Some(packratd::patcher::PatchError::Io(_))
        );
    if is_io {
        3
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "packratd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("bad configuration: {e}");
            return ExitCode::from(2);
        }
    };

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve => run_server(config).await,
        Commands::Cleanup { urgent } => run_cleanup(config, urgent).await,
        Commands::MountVhd { path, mountpoint, offset } => mount_vhd(&path, &mountpoint, offset),
        Commands::PatchApply { base, patch, output, sparse_extents } => {
            patch_apply(&base, &patch, &output, sparse_extents.as_deref())
        }
        Commands::VerifySidecar { file, hash } => verify_sidecar(&file, &hash),
        Commands::Client { command } => match command {
            ClientCommands::Add { name, addr } => client_add(config, &name, &addr).await,
            ClientCommands::List => client_list(config).await,
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(classify(&e))
        }
    }
}

async fn open_core(config: &Config) -> anyhow::Result<(db::DbPool, Arc<FileStore>, Arc<CleanupEngine>)> {
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    let store = FileStore::new(pool.clone());
    let cleanup = CleanupEngine::new(pool.clone(), Arc::clone(&store), config.clone());
    store.set_reclaimer(Arc::clone(&cleanup) as Arc<dyn SpaceReclaimer>);
    Ok((pool, store, cleanup))
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.backup_root)?;
    let (pool, store, cleanup) = open_core(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = store.spawn_flusher(shutdown_rx.clone());
    let cleaner = cleanup.spawn_scheduled(shutdown_rx.clone());

    let ctx = CoreContext::new(pool.clone(), store, cleanup, config.clone());
    let connector = Arc::new(TcpConnector);

    let mut handles = Vec::new();
    for client in db::clients::list(&pool).await? {
        let Some(addr) = client.addr.clone() else {
            tracing::info!(client = %client.name, "no agent address, skipping");
            continue;
        };
        let handle =
            ClientCoordinator::spawn(ctx.clone(), Arc::clone(&connector), &client.name, &addr)
                .await?;
        tracing::info!(client = %client.name, addr = %addr, "coordinator online");
        handles.push(handle);
    }
    tracing::info!(clients = handles.len(), "packratd serving");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    shutdown_tx.send(true).ok();
    for handle in &handles {
        handle
            .commands
            .send(packratd::coordinator::ClientCommand::Exit)
            .await
            .ok();
    }
    for handle in handles {
        handle.join.await.ok();
    }
    flusher.await.ok();
    cleaner.await.ok();
    Ok(())
}

async fn run_cleanup(config: Config, urgent: Option<u64>) -> anyhow::Result<()> {
    let (pool, _store, cleanup) = open_core(&config).await?;
    match urgent {
        Some(bytes) => {
            if !cleanup.urgent_cleanup(bytes).await? {
                anyhow::bail!("could not free {bytes} bytes");
            }
            println!("freed the requested {bytes} bytes");
        }
        None => {
            cleanup.run_scheduled().await?;
            println!("cleanup pass complete");
        }
    }
    let stats = packratd::cleanup::summarize(&pool).await?;
    println!(
        "{} clients, {} backups, {} file entries, {} backup bytes",
        stats.total_clients, stats.total_backups, stats.total_file_entries, stats.total_backup_bytes
    );
    Ok(())
}

fn mount_vhd(path: &std::path::Path, mountpoint: &std::path::Path, offset: u64) -> anyhow::Result<()> {
    let mut vhd = VhdFile::open(path)?;
    let mut out = File::create(mountpoint)?;

    let size = vhd.drive_size();
    if offset >= size {
        anyhow::bail!("offset {offset} beyond virtual disk size {size}");
    }
    let mut buf = vec![0u8; 1 << 20];
    let mut pos = offset;
    while pos < size {
        let take = buf.len().min((size - pos) as usize);
        vhd.read_at(pos, &mut buf[..take])?;
        out.write_all(&buf[..take])?;
        pos += take as u64;
    }
    out.sync_all()?;
    println!("materialized {} bytes to {}", size - offset, mountpoint.display());
    Ok(())
}

fn patch_apply(
    base: &std::path::Path,
    patch: &std::path::Path,
    output: &std::path::Path,
    sparse_extents: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let mut base_f = File::open(base)?;
    let mut patch_f = File::open(patch)?;
    let mut extent_iter = match sparse_extents {
        Some(p) => Some(ExtentIterator::new(File::open(p)?)?),
        None => None,
    };
    let out = File::options().read(true).write(true).create(true).truncate(true).open(output)?;

    let (file, extents) =
        patcher::apply_to_file(&mut base_f, &mut patch_f, extent_iter.as_mut(), out)?;
    let size = file.metadata()?.len();
    println!("wrote {} bytes ({} sparse extents) to {}", size, extents.len(), output.display());
    Ok(())
}

fn verify_sidecar(file: &std::path::Path, hash: &std::path::Path) -> anyhow::Result<()> {
    let mut input = File::open(file)?;
    let mut sc = SidecarFile::open_readonly(hash)?;
    let bad = sidecar::verify_sidecar(&mut input, &mut sc)?;
    if bad.is_empty() {
        println!("sidecar matches");
        Ok(())
    } else {
        for offset in &bad {
            eprintln!("block at offset {offset} does not match");
        }
        Err(HashMismatch.into())
    }
}

async fn client_add(config: Config, name: &str, addr: &str) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    let client = db::clients::get_or_create(&pool, name).await?;
    db::clients::set_addr(&pool, client.id, addr).await?;
    println!("client {} registered at {}", name, addr);
    Ok(())
}

async fn client_list(config: Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    let clients = db::clients::list(&pool).await?;
    if clients.is_empty() {
        println!("no clients");
    } else {
        for client in clients {
            println!(
                "{} - {} (files: {} bytes, images: {} bytes)",
                client.name,
                client.addr.as_deref().unwrap_or("-"),
                client.bytes_used_files,
                client.bytes_used_images
            );
        }
    }
    Ok(())
}
