use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::loader::{ConfigLoadError, ConfigLoader, ConfigWarnings};
use crate::settings::Settings;

/// Shared holder of the current [`Settings`] snapshot.
///
/// Readers clone the `Arc` and keep a consistent view for as long as they
/// hold it; [`reload`](Self::reload) swaps in a whole new snapshot.
#[derive(Debug)]
pub struct SettingsStore {
    loader: ConfigLoader,
    config_path: PathBuf,
    current: RwLock<Arc<Settings>>,
}

impl SettingsStore {
    /// Load the initial snapshot.
    pub fn load(loader: ConfigLoader) -> Result<(Self, ConfigWarnings), ConfigLoadError> {
        let load = loader.load()?;
        let store = Self {
            loader,
            config_path: load.config_path,
            current: RwLock::new(Arc::new(load.settings)),
        };
        Ok((store, load.warnings))
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        Arc::clone(&self.current.read())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Re-read every source and replace the snapshot. On error the previous
    /// snapshot stays in place.
    pub fn reload(&self) -> Result<Arc<Settings>, ConfigLoadError> {
        let load = self.loader.load()?;
        for warning in &load.warnings.items {
            warn!(message = %warning.message, "configuration warning");
        }

        let next = Arc::new(load.settings);
        let previous = std::mem::replace(&mut *self.current.write(), Arc::clone(&next));
        if *previous != *next {
            info!(path = %self.config_path.display(), "settings reloaded");
        }
        Ok(next)
    }
}
