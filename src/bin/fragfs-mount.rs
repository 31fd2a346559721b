//! CLI entry point: `fragfs-mount <MOUNTPOINT> [--config <FILE>]`.
//!
//! Loads configuration, wires the remote blob client and catalog
//! store, mounts the FUSE filesystem, and spawns the Synchroniser
//! (C7) and Evictor (C8) background sweeps. A `SIGINT`/`SIGTERM`
//! unmounts cleanly and waits for the sweeps to observe shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fragfs::catalog::{Catalog, EtcdCatalog};
use fragfs::config::Config;
use fragfs::directory::Directory;
use fragfs::mountpoint::FragFs;
use fragfs::remote::{BlobStore, HttpBlobStore};
use fragfs::{config, evictor, sync};
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fragfs-mount", about = "Mount a chunked, remote-backed filesystem")]
struct Args {
    /// Directory to mount the filesystem at.
    mountpoint: PathBuf,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let handle = runtime.handle().clone();

    let catalog: Arc<dyn Catalog> = Arc::new(
        runtime
            .block_on(EtcdCatalog::connect(&config.etcd_endpoints))
            .context("connecting to catalog store")?,
    );
    let store: Arc<dyn BlobStore> = Arc::new(HttpBlobStore::new(
        config.remote_base_url.clone(),
        config.remote_token.clone(),
        config.remote_bucket.clone(),
        config::DOWNLOAD_CONCURRENCY,
    ));
    let directory = Arc::new(Directory::new());

    info!("running initial catalog sync before mount");
    runtime.block_on(sync::sync_once(catalog.as_ref(), directory.as_ref(), &config.tmp_dir));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sync_task = sync::spawn(
        catalog.clone(),
        directory.clone(),
        config.tmp_dir.clone(),
        config.files_update_interval(),
        shutdown_rx.clone(),
    );
    let evictor_task = evictor::spawn(
        directory.clone(),
        config.gc_delay(),
        config.ram_ttl(),
        config.file_ttl(),
        shutdown_rx.clone(),
    );

    let fs = FragFs::new(directory, catalog, store, config, handle.clone());

    let mount_options = vec![fuser::MountOption::RW, fuser::MountOption::FSName("fragfs".to_string())];
    let session = fuser::spawn_mount2(fs, &args.mountpoint, &mount_options)
        .with_context(|| format!("mounting fragfs at `{}`", args.mountpoint.display()))?;

    runtime.block_on(async {
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("installing SIGINT handler");
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, unmounting"),
            _ = sigterm.recv() => info!("received SIGTERM, unmounting"),
        }
    });

    drop(session);
    if shutdown_tx.send(true).is_err() {
        warn!("shutdown channel had no receivers");
    }
    runtime.block_on(async {
        let _ = sync_task.await;
        let _ = evictor_task.await;
    });

    Ok(())
}
