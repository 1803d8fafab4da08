//! sftpfs - Mount a remote file store as a FUSE filesystem.
//!
//! Usage: sftpfs <REMOTE> <MOUNTPOINT>
//!
//! REMOTE is either `sftp://[user@]host[:port][/path]` or a local directory.
//!
//! ## Debugging with tokio-console
//!
//! Build with the `tokio-console` feature for async task introspection:
//! ```bash
//! cargo build -p sftpfs-fuse --features tokio-console
//! ```
//!
//! Then run `tokio-console` in another terminal to connect (default: 127.0.0.1:6669).

use anyhow::{Context, Result};
use clap::Parser;
use sftpfs_core::{LocalStore, RemoteStore};
use sftpfs_fuse::{MountConfig, SftpFs};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
#[cfg(feature = "sftp")]
use zeroize::Zeroizing;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "sftpfs")]
#[command(about = "Mount a remote file store as a FUSE filesystem")]
#[command(version)]
struct Cli {
    /// Remote to mount: sftp://[user@]host[:port][/path] or a local directory
    remote: String,

    /// Mountpoint for the filesystem
    mount: PathBuf,

    /// SSH password (if not provided, will prompt or use SFTPFS_PASSWORD env var)
    #[arg(short, long, env = "SFTPFS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Authenticate with the running SSH agent instead of a password
    #[arg(long, conflicts_with = "password")]
    agent: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Mount as read-only (default: read-write)
    #[arg(long)]
    read_only: bool,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Seconds a cached entry is trusted before it is re-checked remotely
    #[arg(long, env = "SFTPFS_ATTR_TTL")]
    attr_ttl: Option<u64>,

    /// Seconds before a single remote operation fails with ETIMEDOUT
    #[arg(long, env = "SFTPFS_IO_TIMEOUT")]
    io_timeout: Option<u64>,

    /// Soft bound on cached nodes
    #[arg(long, env = "SFTPFS_MAX_NODES")]
    max_nodes: Option<usize>,
}

impl Cli {
    fn is_sftp(&self) -> bool {
        self.remote.starts_with("sftp://")
    }

    fn mount_config(&self) -> MountConfig {
        let mut config = if self.is_sftp() {
            MountConfig::default()
        } else {
            MountConfig::local()
        };
        config = config
            .read_only(self.read_only)
            .allow_other(self.allow_other)
            .fs_name(format!("sftpfs:{}", self.remote));
        if let Some(secs) = self.attr_ttl {
            config = config.attr_ttl(Duration::from_secs(secs));
        }
        if let Some(secs) = self.io_timeout {
            config = config.io_timeout(Duration::from_secs(secs));
        }
        if let Some(max) = self.max_nodes {
            config = config.max_nodes(max);
        }
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("sftpfs-io")
        .build()
        .context("Failed to create tokio runtime")?;

    #[cfg(feature = "tokio-console")]
    {
        use std::net::SocketAddr;
        use tracing_subscriber::Layer;

        let console_port: u16 = std::env::var("TOKIO_CONSOLE_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(6669);

        let console_addr: SocketAddr = ([127, 0, 0, 1], console_port).into();
        let port_available = std::net::TcpListener::bind(console_addr).is_ok();

        let fmt_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

        if port_available {
            let _guard = runtime.enter();
            let console_layer = console_subscriber::ConsoleLayer::builder()
                .server_addr(console_addr)
                .spawn();
            tracing_subscriber::registry()
                .with(console_layer)
                .with(tracing_subscriber::fmt::layer().with_filter(fmt_filter))
                .init();
            info!(
                "tokio-console enabled, connect with: tokio-console http://127.0.0.1:{}",
                console_port
            );
        } else {
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(fmt_filter))
                .init();
            warn!(
                "tokio-console port {} already in use, running without console instrumentation. \
                 Set TOKIO_CONSOLE_PORT to use a different port.",
                console_port
            );
        }
    }

    #[cfg(not(feature = "tokio-console"))]
    {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
            )
            .init();
    }

    run_mount(&cli, &runtime)
}

fn run_mount(cli: &Cli, runtime: &tokio::runtime::Runtime) -> Result<()> {
    if !cli.mount.exists() {
        anyhow::bail!("Mountpoint does not exist: {}", cli.mount.display());
    }

    let remote = open_remote(cli, runtime)?;
    let config = cli.mount_config();

    info!(remote = %remote.describe(), mount = %cli.mount.display(), "Mounting remote");

    let fs = SftpFs::with_runtime_handle(remote, runtime.handle().clone(), config);
    mount_and_wait(cli, fs)
}

/// Connects to the remote named on the command line.
fn open_remote(cli: &Cli, runtime: &tokio::runtime::Runtime) -> Result<Arc<dyn RemoteStore>> {
    if cli.is_sftp() {
        return open_sftp(cli, runtime);
    }
    let store = LocalStore::new(&cli.remote)
        .with_context(|| format!("Remote directory is not usable: {}", cli.remote))?;
    Ok(Arc::new(store))
}

#[cfg(feature = "sftp")]
fn open_sftp(cli: &Cli, runtime: &tokio::runtime::Runtime) -> Result<Arc<dyn RemoteStore>> {
    use sftpfs_core::{SftpAuth, SftpStore, SftpTarget};

    let target = SftpTarget::parse(&cli.remote).context("Invalid sftp URL")?;
    let auth = if cli.agent {
        SftpAuth::Agent
    } else {
        SftpAuth::Password(get_password(cli, &target)?)
    };

    info!(host = %target.host, port = target.port, user = %target.username, "Connecting");
    let store = runtime
        .block_on(SftpStore::connect(target, auth))
        .context("Failed to connect to SFTP server")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sftp"))]
fn open_sftp(cli: &Cli, _runtime: &tokio::runtime::Runtime) -> Result<Arc<dyn RemoteStore>> {
    Err(sftpfs_fuse::FuseError::InvalidRemote(cli.remote.clone()))
        .context("This build has no SFTP support (enable the `sftp` feature)")
}

/// Get password from CLI/environment or prompt.
#[cfg(feature = "sftp")]
fn get_password(cli: &Cli, target: &sftpfs_core::SftpTarget) -> Result<Zeroizing<String>> {
    if let Some(ref pwd) = cli.password {
        Ok(Zeroizing::new(pwd.clone()))
    } else {
        Ok(Zeroizing::new(
            rpassword::prompt_password(format!("{}@{}'s password: ", target.username, target.host))
                .context("Failed to read password")?,
        ))
    }
}

/// Mount the filesystem and wait for Ctrl+C.
fn mount_and_wait(cli: &Cli, fs: SftpFs) -> Result<()> {
    let (tx, rx) = mpsc::channel::<()>();

    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;

    info!("Mounting filesystem (press Ctrl+C to unmount)");

    let handle = sftpfs_fuse::mount(fs, &cli.mount).context("Failed to mount filesystem")?;

    info!("Filesystem mounted at {}", cli.mount.display());

    match rx.recv() {
        Ok(()) => {
            info!("Received interrupt signal, unmounting...");
        }
        Err(_) => {
            warn!("Signal channel closed unexpectedly");
        }
    }

    let stats = handle.stats().snapshot();
    drop(handle);
    info!(
        remote_calls = stats.remote_calls,
        remote_errors = stats.remote_errors,
        bytes_read = stats.bytes_read,
        bytes_written = stats.bytes_written,
        "Filesystem unmounted"
    );
    Ok(())
}
