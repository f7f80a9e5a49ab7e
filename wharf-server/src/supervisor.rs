//! Owns serving generations and replaces them on material change.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, error, info, warn};
use wharf_config::SettingsStore;
use wharf_core::{
    GenerationContext, StopCause,
    watch::{ChangeDetector, ChangeSignal},
};

use crate::serving::GenerationFactory;

/// How long a superseded generation gets to release its listeners before
/// the next one starts anyway.
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);

struct Generation {
    id: u64,
    ctx: GenerationContext,
    tasks: JoinSet<()>,
}

impl Generation {
    /// Wait for every listener of this generation, then log why it ended.
    async fn wait(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result
                && err.is_panic()
            {
                error!(generation = self.id, error = %err, "listener task panicked");
            }
        }

        // Listeners only return once their context is cancelled.
        match self.ctx.cause() {
            Some(StopCause::ConfigChanged) => {
                debug!(generation = self.id, "generation superseded")
            }
            _ => info!(generation = self.id, "server stopped"),
        }
    }
}

/// Runs generation 0, then a fresh generation after every material change,
/// until the root context is cancelled.
pub struct Supervisor<F> {
    factory: F,
    store: Arc<SettingsStore>,
    detector: ChangeDetector,
    targets: Vec<PathBuf>,
    handoff_timeout: Duration,
    next_id: u64,
}

impl<F> std::fmt::Debug for Supervisor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("targets", &self.targets)
            .field("fingerprint", &self.detector.current())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl<F: GenerationFactory> Supervisor<F> {
    /// `targets` are the watched paths in registration order; `detector`
    /// holds the baseline fingerprint over them.
    pub fn new(
        factory: F,
        store: Arc<SettingsStore>,
        detector: ChangeDetector,
        targets: Vec<PathBuf>,
    ) -> Self {
        Self {
            factory,
            store,
            detector,
            targets,
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
            next_id: 0,
        }
    }

    pub fn with_handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = timeout;
        self
    }

    /// Supervise until `root` is cancelled, then wait for every generation.
    /// Returns the root's stop cause.
    pub async fn run(
        mut self,
        root: GenerationContext,
        mut signals: mpsc::Receiver<ChangeSignal>,
    ) -> StopCause {
        let mut current = self.start(&root).await;
        let mut retired: Vec<Generation> = Vec::new();
        let mut watching = true;

        loop {
            tokio::select! {
                _ = root.cancelled() => break,
                signal = signals.recv(), if watching => match signal {
                    Some(ChangeSignal) => {
                        if self.material_change() {
                            self.restart(&mut current, &root, &mut retired).await;
                        }
                    }
                    None => {
                        warn!("change signals closed; configuration changes will not be picked up");
                        watching = false;
                    }
                },
            }
        }

        current.wait().await;
        for generation in &mut retired {
            generation.wait().await;
        }
        root.cause().unwrap_or(StopCause::Terminated)
    }

    async fn start(&mut self, root: &GenerationContext) -> Generation {
        let id = self.next_id;
        self.next_id += 1;

        let ctx = root.child();
        let settings = self.store.snapshot();
        info!(
            generation = id,
            http_port = settings.http_port,
            https_port = settings.https_port,
            "starting server"
        );
        let tasks = self.factory.launch(id, settings, ctx.clone()).await;
        Generation { id, ctx, tasks }
    }

    /// Reload the settings and decide whether the watched content changed.
    fn material_change(&mut self) -> bool {
        let reloaded = match self.store.reload() {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "configuration reload failed; keeping previous settings");
                false
            }
        };

        let changed = self.detector.recheck(&self.targets);
        if !changed {
            debug!("watched files unchanged");
            return false;
        }
        if !reloaded {
            warn!("watched files changed but the configuration is invalid; not restarting");
            return false;
        }
        true
    }

    /// Cancel `current`, wait for it within the hand-off timeout, then
    /// replace it with a new generation.
    async fn restart(
        &mut self,
        current: &mut Generation,
        root: &GenerationContext,
        retired: &mut Vec<Generation>,
    ) {
        info!(generation = current.id, "configuration changed; restarting server");
        current.ctx.cancel(StopCause::ConfigChanged);

        let released = tokio::time::timeout(self.handoff_timeout, current.wait())
            .await
            .is_ok();
        if !released {
            warn!(
                generation = current.id,
                timeout = ?self.handoff_timeout,
                "previous generation still shutting down; starting the next one"
            );
        }

        let next = self.start(root).await;
        let previous = std::mem::replace(current, next);
        if !released {
            retired.push(previous);
        }
    }
}
