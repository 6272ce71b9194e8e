use hostgate::admin::{AdminServer, PKG_NAME, VERSION};
use hostgate::config::Config;
use hostgate::provision::Provisioner;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hostgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let provisioner = Arc::new(Provisioner::from_config(&config).map_err(|e| {
        error!(error = %e, "Failed to initialize provisioner");
        e
    })?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(
                bind = %config.server.bind,
                admin_port = config.server.admin_port,
                error = %e,
                "Invalid admin bind address"
            );
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(
            token = %token,
            "Generated admin API token (configure admin_token to set a fixed value)"
        );
        token
    });

    let admin_server =
        AdminServer::new(admin_addr, Arc::clone(&provisioner), shutdown_rx, admin_token);

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    wait_for_shutdown().await?;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Truncate only once the lock is held so a running instance's PID survives
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting provisioning service");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        "Admin API configuration"
    );
    info!(
        database = %config.paths.database.display(),
        hosts_file = %config.paths.hosts_file.display(),
        vhost_config = %config.paths.vhost_config.display(),
        sites_root = %config.paths.sites_root.display(),
        audit_log = %config.paths.audit_log.display(),
        "Managed paths"
    );
    info!(
        local_suffix = %config.sites.local_suffix,
        loopback = %config.sites.loopback_address,
        alias_backend = ?config.sites.alias_backend,
        protected = ?config.sites.protected_domains,
        "Site policy"
    );
    info!(
        script_count = config.scripts.len(),
        scripts = ?config.scripts.keys().collect::<Vec<_>>(),
        timeout_secs = config.dispatch.timeout_secs,
        "Whitelisted scripts"
    );
}
