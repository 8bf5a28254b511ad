//! pxebootfs
//!
//! Mounts the boot-configuration filesystem a TFTP server serves from.
//! Reading `<KEY>` provisions that node's root on first access.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime::Handle;
use tracing::{error, info};

use netroot_pxebootfs::logging::{self, LogFormat};
use netroot_pxebootfs::mountinfo::MOUNTINFO_PATH;
use netroot_pxebootfs::{
    fuse, startup, ExportIdAllocator, ExportfsPublisher, ProvisioningStore, PxeFs,
    UnionMountProvisioner,
};

#[derive(Debug, Parser)]
#[command(name = "pxebootfs", version, about = "On-demand root provisioning for network-boot clients")]
struct Args {
    /// Where to mount the boot-configuration filesystem.
    mountpoint: PathBuf,

    /// Configuration file, read after the default locations.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Let users other than the mounting user (e.g. the TFTP daemon) read.
    #[arg(long)]
    allow_other: bool,

    /// Override the configured log format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logging is not up yet; the error reaches stderr through main's return.
    let config = startup::load_config(args.config.as_deref())
        .context("failed to load configuration")?;
    logging::init(&config.log_level, args.log_format.unwrap_or(config.log_format))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting pxebootfs");

    let template = match startup::prepare(&config) {
        Ok(template) => template,
        Err(e) => {
            error!(reason_code = e.reason_code(), error = %e, "Startup verification failed");
            return Err(e.into());
        }
    };

    info!(
        node_dir = %config.node_dir.display(),
        root_dir = %config.root_dir.display(),
        overlay_dir = %config.overlay_dir.display(),
        union_fs = config.union_fs.fs_type(),
        start_fsid = %config.start_fsid,
        "Configuration loaded"
    );

    let layout = config.layout();
    let provisioner = Arc::new(UnionMountProvisioner::new(
        layout.clone(),
        config.union_fs,
        MOUNTINFO_PATH,
    ));
    let publisher = Arc::new(ExportfsPublisher::new(
        config.exportfs_path.clone(),
        config.export_options.clone(),
    ));
    let store = Arc::new(ProvisioningStore::new(
        layout,
        ExportIdAllocator::new(config.start_fsid),
        provisioner,
        publisher,
    ));
    let fs = Arc::new(PxeFs::new(store, Arc::new(template), MOUNTINFO_PATH));

    let session = fuse::mount(fs, Handle::current(), &args.mountpoint, args.allow_other)
        .with_context(|| format!("failed to mount {}", args.mountpoint.display()))?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutdown signal received, unmounting");
    drop(session);

    Ok(())
}
