//! Cancellation scopes that remember why they were cancelled.
//!
//! A [`GenerationContext`] wraps a [`CancellationToken`] and records the
//! [`StopCause`] of the first cancellation. Child contexts are cancelled with
//! their parent and report the parent's cause unless they were cancelled
//! directly first.

use std::{fmt, sync::Arc, sync::OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Reason a serving generation (or the whole process) stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopCause {
    /// A material configuration change superseded the generation.
    ConfigChanged,
    /// The process received a termination signal.
    Terminated,
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::ConfigChanged => f.write_str("config changed"),
            StopCause::Terminated => f.write_str("terminated by signal"),
        }
    }
}

/// Cancellable scope carrying a [`StopCause`].
#[derive(Clone)]
pub struct GenerationContext {
    token: CancellationToken,
    cause: Arc<OnceLock<StopCause>>,
    parent: Option<Arc<GenerationContext>>,
}

impl fmt::Debug for GenerationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationContext")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.cause())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

impl Default for GenerationContext {
    fn default() -> Self {
        Self::root()
    }
}

impl GenerationContext {
    /// Create a root context with no parent.
    pub fn root() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(OnceLock::new()),
            parent: None,
        }
    }

    /// Derive a child that is cancelled whenever `self` is.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            cause: Arc::new(OnceLock::new()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Cancel this context (and its children). Only the first cause sticks.
    pub fn cancel(&self, cause: StopCause) {
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// The cause of cancellation, inherited from the nearest cancelled
    /// ancestor when this context was not cancelled directly.
    pub fn cause(&self) -> Option<StopCause> {
        if !self.token.is_cancelled() {
            return None;
        }
        if let Some(cause) = self.cause.get() {
            return Some(*cause);
        }
        self.parent.as_ref().and_then(|parent| parent.cause())
    }

    /// The underlying token, for APIs that take a plain [`CancellationToken`].
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
