//! Per-protocol listener loop.
//!
//! A runner binds and serves until its generation is cancelled. Any other
//! end of serving is treated as transient: it is logged and retried after a
//! fixed backoff, for as long as the generation lives.

use std::{fmt, io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use axum::Router;
use axum_server::{Handle, tls_rustls::RustlsConfig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wharf_core::GenerationContext;

pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Https => f.write_str("https"),
        }
    }
}

/// Address a listener actually bound, reported once per successful bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bound {
    pub generation: u64,
    pub protocol: Protocol,
    pub addr: SocketAddr,
}

/// One bind-and-serve attempt.
///
/// Implementations return when serving stops, either because `ctx` was
/// cancelled (after a graceful shutdown) or because of a failure.
#[async_trait]
pub trait Serve: Send + Sync + 'static {
    fn protocol(&self) -> Protocol;

    async fn serve(&self, ctx: &GenerationContext) -> io::Result<()>;
}

/// Serve `server` until `ctx` is cancelled, retrying after `backoff`.
pub async fn run_listener<S: Serve>(server: S, ctx: GenerationContext, backoff: Duration) {
    let protocol = server.protocol();

    loop {
        if ctx.is_cancelled() {
            break;
        }

        let result = server.serve(&ctx).await;
        if ctx.is_cancelled() {
            break;
        }

        match result {
            Ok(()) => warn!(%protocol, "listener stopped unexpectedly; retrying"),
            Err(err) => warn!(%protocol, error = %err, "listener failed; retrying"),
        }

        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    debug!(%protocol, cause = ?ctx.cause(), "listener exited");
}

/// An axum router bound to one address, with TLS for HTTPS.
#[derive(Clone)]
pub struct AxumListener {
    generation: u64,
    addr: SocketAddr,
    router: Router,
    tls: Option<RustlsConfig>,
    grace: Duration,
    report: Option<mpsc::UnboundedSender<Bound>>,
}

impl fmt::Debug for AxumListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AxumListener")
            .field("generation", &self.generation)
            .field("protocol", &self.protocol())
            .field("addr", &self.addr)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl AxumListener {
    pub fn http(generation: u64, addr: SocketAddr, router: Router) -> Self {
        Self {
            generation,
            addr,
            router,
            tls: None,
            grace: DEFAULT_SHUTDOWN_GRACE,
            report: None,
        }
    }

    pub fn https(generation: u64, addr: SocketAddr, router: Router, tls: RustlsConfig) -> Self {
        Self {
            tls: Some(tls),
            ..Self::http(generation, addr, router)
        }
    }

    /// Time in-flight connections get to finish once the generation ends.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_report(mut self, report: Option<mpsc::UnboundedSender<Bound>>) -> Self {
        self.report = report;
        self
    }
}

#[async_trait]
impl Serve for AxumListener {
    fn protocol(&self) -> Protocol {
        if self.tls.is_some() {
            Protocol::Https
        } else {
            Protocol::Http
        }
    }

    async fn serve(&self, ctx: &GenerationContext) -> io::Result<()> {
        let handle = Handle::new();
        let shutdown = handle.clone();
        let token = ctx.token().clone();
        let grace = self.grace;
        let report = self.report.clone();
        let (generation, protocol) = (self.generation, self.protocol());

        let watcher = tokio::spawn(async move {
            tokio::select! {
                bound = shutdown.listening() => {
                    if let Some(addr) = bound {
                        info!(generation, %protocol, %addr, "listening");
                        if let Some(report) = report {
                            let _ = report.send(Bound { generation, protocol, addr });
                        }
                    }
                }
                _ = token.cancelled() => {}
            }
            token.cancelled().await;
            shutdown.graceful_shutdown(Some(grace));
        });

        let service = self.router.clone().into_make_service();
        let result = match &self.tls {
            Some(tls) => {
                axum_server::bind_rustls(self.addr, tls.clone())
                    .handle(handle)
                    .serve(service)
                    .await
            }
            None => axum_server::bind(self.addr).handle(handle).serve(service).await,
        };

        watcher.abort();
        result
    }
}
