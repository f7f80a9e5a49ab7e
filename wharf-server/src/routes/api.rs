use std::io;

use axum::{Json, extract::State, http::StatusCode};
use wharf_core::logging::{LogEntry, read_entries};

use super::AppState;
use crate::errors::{AppError, AppResult};

pub async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Entries of the active log file, oldest first. Empty when logging to
/// stdout or before anything was written.
pub async fn get_logs(State(state): State<AppState>) -> AppResult<Json<Vec<LogEntry>>> {
    let Some(writer) = state.logs else {
        return Ok(Json(Vec::new()));
    };

    let path = writer.path().to_path_buf();
    let entries = tokio::task::spawn_blocking(move || read_entries(&path))
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;

    match entries {
        Ok(entries) => Ok(Json(entries)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Json(Vec::new())),
        Err(err) => Err(err.into()),
    }
}

/// Start a new log segment.
pub async fn delete_logs(State(state): State<AppState>) -> AppResult<StatusCode> {
    let Some(writer) = state.logs else {
        return Err(AppError::conflict(
            "logging to stdout; there is no log file to rotate",
        ));
    };

    tokio::task::spawn_blocking(move || writer.rotate())
        .await
        .map_err(|err| AppError::internal(err.to_string()))??;
    Ok(StatusCode::OK)
}
