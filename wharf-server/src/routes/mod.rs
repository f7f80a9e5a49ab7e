//! HTTP surface of a generation: the operator API under `/vapi` and static
//! files for everything else.

pub mod api;
pub mod static_files;

use std::{fmt, sync::Arc};

use axum::{Router, routing::get};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use wharf_config::Settings;
use wharf_core::logging::RotatingWriter;

use crate::errors;

/// Handler state, fixed for the lifetime of one generation.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    /// The active log file when logging to a file.
    pub logs: Option<RotatingWriter>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("settings", &self.settings)
            .field("file_logging", &self.logs.is_some())
            .finish()
    }
}

impl AppState {
    pub fn new(settings: Arc<Settings>, logs: Option<RotatingWriter>) -> Self {
        Self { settings, logs }
    }
}

pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/vapi/version", get(api::version))
        .route("/vapi/logs", get(api::get_logs).delete(api::delete_logs))
        .fallback(static_files::serve);
    with_layers(routes).with_state(state)
}

/// Request tracing, plus recovery from handler panics as a JSON 500.
fn with_layers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(CatchPanicLayer::custom(errors::panic_response))
        .layer(TraceLayer::new_for_http())
}
