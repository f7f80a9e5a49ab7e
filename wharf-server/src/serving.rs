//! Launching the listeners of one generation.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, error, info};
use wharf_config::Settings;
use wharf_core::{GenerationContext, logging::RotatingWriter};

use crate::{
    listener::{AxumListener, Bound, DEFAULT_RETRY_BACKOFF, DEFAULT_SHUTDOWN_GRACE, run_listener},
    routes::{self, AppState},
    tls,
};

/// Starts the serving layer for a generation.
///
/// Every task spawned into the returned set must finish once `ctx` is
/// cancelled.
#[async_trait]
pub trait GenerationFactory: Send + Sync + 'static {
    async fn launch(
        &self,
        generation: u64,
        settings: Arc<Settings>,
        ctx: GenerationContext,
    ) -> JoinSet<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct ListenerOptions {
    pub retry_backoff: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// The production factory: an HTTP runner and, when TLS material is
/// configured and loadable, an HTTPS runner.
#[derive(Clone, Default)]
pub struct Listeners {
    options: ListenerOptions,
    logs: Option<RotatingWriter>,
    report: Option<mpsc::UnboundedSender<Bound>>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("options", &self.options)
            .field("file_logging", &self.logs.is_some())
            .finish_non_exhaustive()
    }
}

impl Listeners {
    pub fn new(options: ListenerOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Expose this log file through `/vapi/logs`.
    pub fn with_logs(mut self, logs: Option<RotatingWriter>) -> Self {
        self.logs = logs;
        self
    }

    /// Send every bound address to `report`.
    pub fn with_report(mut self, report: mpsc::UnboundedSender<Bound>) -> Self {
        self.report = Some(report);
        self
    }

    fn listener(&self, listener: AxumListener) -> AxumListener {
        listener
            .with_grace(self.options.shutdown_grace)
            .with_report(self.report.clone())
    }
}

#[async_trait]
impl GenerationFactory for Listeners {
    async fn launch(
        &self,
        generation: u64,
        settings: Arc<Settings>,
        ctx: GenerationContext,
    ) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        let router = routes::router(AppState::new(Arc::clone(&settings), self.logs.clone()));
        let backoff = self.options.retry_backoff;

        match settings.http_addr() {
            Ok(addr) => {
                let http = self.listener(AxumListener::http(generation, addr, router.clone()));
                tasks.spawn(run_listener(http, ctx.clone(), backoff));
            }
            Err(err) => error!(
                generation,
                host = %settings.host,
                error = %err,
                "invalid HTTP bind address"
            ),
        }

        let Some((cert, key)) = settings.tls_paths() else {
            debug!(generation, "TLS not configured; serving HTTP only");
            return tasks;
        };

        let config = match tls::load_rustls_config(cert, key).await {
            Ok(config) => config,
            Err(err) if err.is_missing() => {
                info!(generation, error = %err, "TLS certificate is not found");
                return tasks;
            }
            Err(err) => {
                error!(generation, error = %err, "failed to load TLS configuration");
                return tasks;
            }
        };

        match settings.https_addr() {
            Ok(addr) => {
                let https = self.listener(AxumListener::https(generation, addr, router, config));
                tasks.spawn(run_listener(https, ctx, backoff));
            }
            Err(err) => error!(
                generation,
                host = %settings.host,
                error = %err,
                "invalid HTTPS bind address"
            ),
        }

        tasks
    }
}
