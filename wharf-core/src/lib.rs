//! # Wharf Core
//!
//! Reload core for the Wharf static content server.
//!
//! ## Overview
//!
//! - **Change detection**: [`watch`] turns raw inotify events on the
//!   configuration file and TLS material into debounced change signals, and
//!   decides with a content fingerprint whether a change is material.
//! - **Generations**: [`context`] provides the cancellable scope that every
//!   serving generation runs under, carrying the reason it stopped.
//! - **Logging**: [`logging`] installs the tracing subscriber and provides the
//!   size-bounded rotating file sink with background retention and zstd
//!   compression of backups.
//!
//! The supervisor that ties these together lives in `wharf-server`.

pub mod context;
pub mod logging;
pub mod watch;

pub use context::{GenerationContext, StopCause};
