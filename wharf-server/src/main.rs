//! # Wharf
//!
//! Serves static content over HTTP and HTTPS. The configuration file and the
//! TLS certificate and key are watched; a material change to any of them
//! restarts the listeners with the new settings without restarting the
//! process.

use std::{
    future::Future,
    io,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};
use tracing::{debug, error, info, warn};

use wharf_config::{
    CanonicalSettings, ConfigLoader, Settings, SettingsOverrides, SettingsStore, load_env_file,
};
use wharf_core::{
    GenerationContext, StopCause,
    logging::{self, LogMode, LoggingOptions, RotatingWriter},
    watch::{
        ChangeDetector, EVENT_CHANNEL_CAPACITY, EventSource, Fingerprinter, Op, WatchError,
        canonical_target, spawn_debouncer,
    },
};
use wharf_server::{ListenerOptions, Listeners, Supervisor, tls};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "wharf", version)]
#[command(about = "Static content server that restarts its listeners when configuration or certificates change")]
struct Cli {
    /// Configuration file (TOML). Falls back to CONFIG_PATH, then config/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP port (overrides HTTP_PORT and the configuration file)
    #[arg(long)]
    http_port: Option<u16>,

    /// HTTPS port (overrides HTTPS_PORT and the configuration file)
    #[arg(long)]
    https_port: Option<u16>,

    /// Bind address (overrides BIND_HOST and the configuration file)
    #[arg(long)]
    host: Option<String>,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Static content directory, relative to the data directory
    #[arg(long)]
    web_root: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Where log events go: stdout or file
    #[arg(long, env = "LOG_MODE", default_value_t = LogMode::Stdout)]
    log_mode: LogMode,

    /// Active log file in file mode. Defaults to <data-dir>/logs/messages.log
    #[arg(long, env = "LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `info,wharf_core=trace`. Overrides RUST_LOG
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Quiet period after the last file event before rechecking
    #[arg(long, env = "DEBOUNCE_MS", default_value_t = 200)]
    debounce_ms: u64,

    /// Delay before a failed listener is restarted
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 1000)]
    retry_backoff_ms: u64,

    /// Time in-flight requests get when a generation shuts down
    #[arg(long, env = "SHUTDOWN_GRACE_MS", default_value_t = 5000)]
    shutdown_grace_ms: u64,
}

impl Cli {
    fn loader(&self) -> ConfigLoader {
        let loader = ConfigLoader::new().with_overrides(SettingsOverrides {
            http_port: self.http_port,
            https_port: self.https_port,
            host: self.host.clone(),
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
            web_root: self.web_root.clone(),
            data_dir: self.data_dir.clone(),
        });
        match &self.config {
            Some(path) => loader.with_config_path(path),
            None => loader,
        }
    }

    fn logging_options(&self, settings: &Settings) -> LoggingOptions {
        let file = self
            .log_file
            .clone()
            .unwrap_or_else(|| settings.data_dir.join("logs").join("messages.log"));
        let mut options = LoggingOptions::new(self.log_mode, file);
        options.level = self.log_level.clone();
        options
    }

    fn listener_options(&self) -> ListenerOptions {
        ListenerOptions {
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env_file(None).context("failed to load .env")?;
    let cli = Cli::parse();

    let (store, warnings) =
        SettingsStore::load(cli.loader()).context("failed to load configuration")?;
    let store = Arc::new(store);

    let guard = logging::init(&cli.logging_options(&store.snapshot()))
        .context("failed to initialise logging")?;
    for warning in &warnings.items {
        warn!(message = %warning.message, hint = ?warning.hint, "configuration warning");
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %store.config_path().display(),
        log_mode = %cli.log_mode,
        "starting wharf"
    );

    tls::install_crypto_provider();

    let result = run(&cli, store, guard.writer().cloned()).await;
    match &result {
        Ok(StopCause::Terminated) => info!("shutdown complete"),
        Ok(cause) => info!(%cause, "server stopped"),
        Err(err) => error!(error = ?err, "server failed"),
    }
    drop(guard);
    result.map(|_| ())
}

async fn run(
    cli: &Cli,
    store: Arc<SettingsStore>,
    logs: Option<RotatingWriter>,
) -> anyhow::Result<StopCause> {
    let settings = store.snapshot();
    let config_path = canonical_target(store.config_path())
        .with_context(|| format!("failed to resolve {}", store.config_path().display()))?;
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let source = Arc::new(EventSource::open().context("failed to open the file watcher")?);
    let mut candidates = vec![config_path.clone()];
    if let Some((cert, key)) = settings.tls_paths() {
        candidates.push(cert.to_path_buf());
        candidates.push(key.to_path_buf());
    }
    for path in &candidates {
        match source.add_watch(path, Op::REPLACE) {
            Ok(()) => {}
            Err(WatchError::AlreadyWatched(path)) => {
                debug!(path = %path.display(), "already watched")
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to watch {}", path.display()));
            }
        }
    }

    let targets = source.watched();
    let fingerprinter = Fingerprinter::new(&config_path, Arc::new(CanonicalSettings));
    let detector = ChangeDetector::new(fingerprinter, &targets);
    info!(targets = ?targets, fingerprint = %detector.current(), "watching for changes");

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (signal_tx, signal_rx) = mpsc::channel(1);
    let watcher = {
        let source = Arc::clone(&source);
        tokio::spawn(async move {
            match source.watch(event_tx).await {
                Ok(()) | Err(WatchError::Closed) => debug!("file watcher stopped"),
                Err(err) => error!(error = %err, "file watcher failed"),
            }
        })
    };
    let debouncer = spawn_debouncer(
        event_rx,
        signal_tx,
        Duration::from_millis(cli.debounce_ms),
    );

    let root = GenerationContext::root();
    let terminate = termination_signal().context("failed to install signal handlers")?;
    {
        let root = root.clone();
        tokio::spawn(async move {
            let name = terminate.await;
            info!(signal = name, "termination signal received");
            root.cancel(StopCause::Terminated);
        });
    }

    let factory = Listeners::new(cli.listener_options()).with_logs(logs);
    let cause = Supervisor::new(factory, store, detector, targets)
        .run(root, signal_rx)
        .await;

    source.close();
    let _ = watcher.await;
    let _ = debouncer.await;
    Ok(cause)
}

/// Resolves with the name of the first SIGTERM, SIGINT or SIGQUIT.
fn termination_signal() -> io::Result<impl Future<Output = &'static str>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(async move {
        tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
            _ = quit.recv() => "SIGQUIT",
        }
    })
}
