//! # Wharf Server
//!
//! Static content server that restarts its listeners when its configuration
//! or TLS material changes on disk.
//!
//! ## Architecture
//!
//! - [`supervisor`] owns serving generations. A debounced change signal
//!   triggers a settings reload and a fingerprint recheck; a material change
//!   cancels the current generation and starts the next one.
//! - [`serving`] launches one generation: an HTTP runner and, when TLS is
//!   configured, an HTTPS runner.
//! - [`listener`] retries a failed listener after a fixed backoff until its
//!   generation is cancelled.
//! - [`routes`] serves static files and the `/vapi` operator endpoints.

pub mod errors;
pub mod listener;
pub mod routes;
pub mod serving;
pub mod supervisor;
pub mod tls;

pub use routes::AppState;
pub use serving::{GenerationFactory, ListenerOptions, Listeners};
pub use supervisor::Supervisor;
