use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use wakegate::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use wakegate::backend::StaticRegistry;
use wakegate::config::Config;
use wakegate::coordinator::WakeCoordinator;
use wakegate::probe;
use wakegate::registry::TaskRegistry;
use wakegate::router::InitialRouter;
use wakegate::session::WebhookSubstrate;
use wakegate::throttle::WakeThrottle;
use wakegate::wake::HttpWakeSender;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wakegate.toml"));

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

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Wire up the coordinator
    let timings = config.wake.timings();
    let registry = Arc::new(StaticRegistry::new(config.backends.clone(), config.wake.clone()));
    let throttle = Arc::new(WakeThrottle::new(timings.wake_cooldown));
    let substrate = Arc::new(WebhookSubstrate::new(
        config.server.callback_url.clone(),
        Duration::from_secs(config.server.callback_timeout_secs),
    )?);
    let sender = Arc::new(HttpWakeSender::new(config.wake.wake_timeout())?);

    let coordinator = WakeCoordinator::new(
        Arc::new(TaskRegistry::new()),
        Arc::clone(&throttle),
        probe::from_kind(&config.wake.probe),
        sender,
        substrate.clone(),
        timings,
    );
    let router = Arc::new(InitialRouter::new(
        Arc::clone(&coordinator),
        registry.clone(),
        config.server.fallback_order.clone(),
    ));

    let state = Arc::new(AdminState {
        coordinator: Arc::clone(&coordinator),
        router,
        registry,
        substrate,
        config_path: Some(config_path.clone()),
    });

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&state), shutdown_rx.clone(), admin_token);

    // Spawn throttle cleanup task
    let cleanup_coordinator = Arc::clone(&coordinator);
    let cleanup_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        throttle_cleanup_loop(cleanup_coordinator, cleanup_shutdown_rx).await;
    });

    // Spawn admin server
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    match state.reload() {
                        Ok(result) => {
                            if !result.added.is_empty() {
                                info!(backends = ?result.added, "New backends available");
                            }
                            if !result.removed.is_empty() {
                                info!(backends = ?result.removed, "Backends removed");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reload configuration");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop every waiting session
    coordinator.shutdown();

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn throttle_cleanup_loop(coordinator: Arc<WakeCoordinator>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = Duration::from_secs(30);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                coordinator.purge_expired();
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
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
            .truncate(true)
            .open(path)?;

        // Non-blocking exclusive lock; held as long as the file stays open
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

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
    info!(name = PKG_NAME, version = VERSION, "Starting wake gateway");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        callback_url = ?config.server.callback_url,
        fallback_order = ?config.server.fallback_order,
        "Server configuration"
    );
    info!(
        probe = ?config.wake.probe,
        probe_timeout_secs = config.wake.probe_timeout_secs,
        poll_interval_secs = config.wake.poll_interval_secs,
        initial_poll_delay_secs = config.wake.initial_poll_delay_secs,
        max_poll_attempts = config.wake.max_poll_attempts,
        "Poll settings"
    );
    info!(
        wake_cooldown_secs = config.wake.wake_cooldown_secs,
        wake_timeout_secs = config.wake.wake_timeout_secs,
        control_path = %config.wake.control_path,
        "Wake settings"
    );
    info!(
        backend_count = config.backends.len(),
        backends = ?config.backends.keys().collect::<Vec<_>>(),
        "Configured backends"
    );
}
