//! Filesystem change detection.
//!
//! The pipeline is [`EventSource`] (raw inotify events for registered
//! targets) → [`spawn_debouncer`] (one [`ChangeSignal`] per quiet burst) →
//! [`ChangeDetector`] (content digest comparison deciding whether a change is
//! material).

use std::io;
use std::path::PathBuf;

pub mod debounce;
pub mod decode;
pub mod fingerprint;
pub mod mask;
#[cfg(target_os = "linux")]
pub mod source;
mod table;

pub use debounce::{ChangeSignal, DEFAULT_DEBOUNCE_WINDOW, spawn_debouncer};
pub use fingerprint::{
    CanonicalConfig, ChangeDetector, Fingerprint, FingerprintReport, Fingerprinter,
};
pub use mask::{Mask, Op};
#[cfg(target_os = "linux")]
pub use source::EventSource;
pub use table::{WatchTarget, canonical_target};

/// Capacity of the channel between the event source and the debouncer.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A decoded event for one registered target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Registered target the event refers to.
    pub path: PathBuf,
    /// Operations observed. Empty for a queue overflow.
    pub op: Op,
    /// Raw kernel bits.
    pub mask: Mask,
}

/// Errors raised by the filesystem event source.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The canonical path is already registered.
    #[error("already watched: {}", .0.display())]
    AlreadyWatched(PathBuf),

    /// Targets are watched through their directory, so one is required.
    #[error("watch target has no parent directory: {}", .0.display())]
    NoParent(PathBuf),

    /// The target's directory could not be canonicalised.
    #[error("failed to resolve watch target {}", path.display())]
    Resolve {
        /// Target as given by the caller.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// `inotify_init1` failed.
    #[error("failed to initialise inotify")]
    Init(#[source] io::Error),

    /// `inotify_add_watch` failed for a directory.
    #[error("failed to watch directory {}", path.display())]
    AddWatch {
        /// Directory that could not be watched.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// Reading the inotify descriptor failed.
    #[error("failed to read filesystem events")]
    Read(#[source] io::Error),

    /// [`EventSource::close`] was called.
    #[error("event source closed")]
    Closed,
}
