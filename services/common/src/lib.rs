use std::{
    env,
    fs,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    panic,
    str::FromStr,
    thread,
    time::{Duration, SystemTime},
};
use tokio::net::TcpListener;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_LOG_DIR: &str = "/var/log/dtm";

pub struct TracingGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Where and for how long service logs are kept on disk.
struct LogFiles {
    root: PathBuf,
    retention: Duration,
    sweep_every: Duration,
}

impl LogFiles {
    fn from_env(service_name: &str) -> Self {
        let dir = env_opt("LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string());
        Self {
            root: PathBuf::from(dir).join(service_name),
            retention: Duration::from_secs(env_or("LOG_RETENTION_DAYS", 14u64) * 24 * 60 * 60),
            sweep_every: Duration::from_secs(env_or("LOG_CLEANUP_INTERVAL_MINUTES", 360u64) * 60),
        }
    }

    /// Daily-rolling writer, or `None` when the directory is unusable.
    fn writer(&self, service_name: &str) -> Option<(NonBlocking, WorkerGuard)> {
        fs::create_dir_all(&self.root).ok()?;
        // The rolling appender panics when it cannot open its first file.
        let appender = panic::catch_unwind(|| {
            tracing_appender::rolling::daily(&self.root, format!("{service_name}.log"))
        })
        .ok()?;
        Some(tracing_appender::non_blocking(appender))
    }
}

pub fn init_tracing(service_name: &str) -> TracingGuards {
    // RUST_LOG wins over the default level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let files = LogFiles::from_env(service_name);
    let (file_layer, file_guard) = match files.writer(service_name) {
        Some((writer, guard)) => (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        ),
        None => (None, None),
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt::layer().with_writer(io::stdout))
        .with(file_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);

    if file_guard.is_some() {
        spawn_log_cleanup(files);
    } else {
        tracing::warn!(path = %files.root.display(), "file logging disabled");
    }

    TracingGuards {
        _file_guard: file_guard,
    }
}

/// Parses a typed environment value, falling back to `default` when the
/// variable is missing or does not parse.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

/// Reads a string variable, treating empty values as unset.
pub fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Boolean flag where `0`, `false`, `no` and `off` disable.
pub fn env_flag(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(value) => parse_flag(&value),
        None => default,
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

fn spawn_log_cleanup(files: LogFiles) {
    if files.retention.is_zero() || files.sweep_every.is_zero() {
        return;
    }
    thread::spawn(move || loop {
        if let Some(cutoff) = SystemTime::now().checked_sub(files.retention) {
            cleanup_old_logs(&files.root, cutoff);
        }
        thread::sleep(files.sweep_every);
    });
}

/// Removes files under `root` (recursively) last modified before `cutoff`.
fn cleanup_old_logs(root: &Path, cutoff: SystemTime) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for path in entries.flatten().map(|entry| entry.path()) {
        if path.is_dir() {
            cleanup_old_logs(&path, cutoff);
        } else if is_stale(&path, cutoff) {
            if let Err(err) = fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %err, "log cleanup skipped file");
            }
        }
    }
}

fn is_stale(path: &Path, cutoff: SystemTime) -> bool {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map(|modified| modified < cutoff)
        .unwrap_or(false)
}

/// Listens on every interface so the service is reachable from other containers.
pub async fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    Ok(listener)
}

/// Resolves on ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "sigterm handler unavailable");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    tracing::info!("shutdown signal received");
}
