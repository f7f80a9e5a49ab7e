//! Settings for the Wharf server.
//!
//! [`ConfigLoader`] composes a [`Settings`] snapshot from CLI overrides, the
//! environment, a TOML file and the defaults. [`SettingsStore`] holds the
//! current snapshot and swaps it whole on reload. [`CanonicalSettings`] feeds
//! the configuration file into the change fingerprint.

pub mod loader;
pub mod settings;
pub mod sources;
pub mod store;

pub use loader::{
    CanonicalSettings, ConfigLoad, ConfigLoadError, ConfigLoader, ConfigPathProvenance,
    ConfigWarning, ConfigWarnings, DEFAULT_CONFIG_PATH, load_env_file,
};
pub use settings::Settings;
pub use sources::{EnvConfig, FileConfig, SettingsOverrides};
pub use store::SettingsStore;
