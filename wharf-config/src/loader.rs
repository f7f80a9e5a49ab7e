use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;
use wharf_core::watch::CanonicalConfig;

use crate::{
    settings::Settings,
    sources::{EnvConfig, FileConfig, SettingsLayer, SettingsOverrides},
};

/// Configuration file used when neither `--config` nor `CONFIG_PATH` is set.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Composes [`Settings`] from CLI overrides, environment, the TOML file and
/// defaults, in that order of precedence.
#[derive(Debug, Default, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    overrides: SettingsOverrides,
    /// Environment to read instead of the process environment.
    env: Option<EnvConfig>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_overrides(mut self, overrides: SettingsOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.env = Some(env);
        self
    }

    fn env(&self) -> EnvConfig {
        self.env.clone().unwrap_or_else(EnvConfig::gather)
    }

    /// The configuration file this loader reads, and where that choice came
    /// from.
    pub fn config_path(&self) -> (PathBuf, ConfigPathProvenance) {
        self.resolve_config_path(&self.env())
    }

    fn resolve_config_path(&self, env: &EnvConfig) -> (PathBuf, ConfigPathProvenance) {
        if let Some(explicit) = &self.config_path {
            return (explicit.clone(), ConfigPathProvenance::Explicit);
        }
        if let Some(from_env) = &env.config_path {
            return (from_env.clone(), ConfigPathProvenance::Env);
        }
        (PathBuf::from(DEFAULT_CONFIG_PATH), ConfigPathProvenance::Default)
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env = self.env();
        let (config_path, provenance) = self.resolve_config_path(&env);
        let mut warnings = ConfigWarnings::default();

        for (name, value) in &env.rejected {
            warnings.push_with_hint(
                format!("ignoring {name}={value:?}: not a valid port"),
                "Use a number between 0 and 65535",
            );
        }

        let file_config = match read_file_config(&config_path)? {
            Some(file_config) => file_config,
            None => {
                warnings.push_with_hint(
                    format!(
                        "No configuration file at {}; using defaults",
                        config_path.display()
                    ),
                    "Create the file to configure ports, TLS and directories; it is picked up without a restart",
                );
                FileConfig::default()
            }
        };

        let settings = compose(file_config, env, self.overrides.clone());
        debug!(path = %config_path.display(), ?provenance, "configuration loaded");

        Ok(ConfigLoad {
            settings,
            config_path,
            provenance,
            warnings,
        })
    }
}

/// Apply the layers over the defaults, lowest precedence first.
fn compose(file: FileConfig, env: EnvConfig, overrides: SettingsOverrides) -> Settings {
    let settings = SettingsLayer::from(file).apply(Settings::default());
    let settings = SettingsLayer::from(env).apply(settings);
    SettingsLayer::from(overrides).apply(settings)
}

/// Parse the file at `path`; `Ok(None)` when it does not exist.
pub fn read_file_config(path: &Path) -> Result<Option<FileConfig>, ConfigLoadError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigLoadError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Canonical byte form of the configuration file: the file layer over the
/// defaults, serialised as JSON. Environment and CLI values are excluded
/// since they cannot change while the process runs. An absent or invalid
/// file yields the defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct CanonicalSettings;

impl CanonicalSettings {
    pub fn bytes(path: &Path) -> Vec<u8> {
        let settings = match read_file_config(path) {
            Ok(Some(file)) => file.over_defaults(),
            Ok(None) => Settings::default(),
            Err(err) => {
                debug!(error = %err, "configuration unreadable; fingerprinting defaults");
                Settings::default()
            }
        };
        serde_json::to_vec(&settings).unwrap_or_default()
    }
}

impl CanonicalConfig for CanonicalSettings {
    fn canonical_bytes(&self, path: &Path) -> Vec<u8> {
        Self::bytes(path)
    }
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub settings: Settings,
    pub config_path: PathBuf,
    pub provenance: ConfigPathProvenance,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Load `.env` (or `path`) into the process environment. Returns whether a
/// file was found.
pub fn load_env_file(path: Option<&Path>) -> Result<bool, ConfigLoadError> {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path).map(|_| true),
        None => dotenvy::dotenv().map(|_| true),
    };
    match loaded {
        Ok(found) => Ok(found),
        Err(dotenvy::Error::Io(_)) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn loader(dir: &TempDir, env: EnvConfig) -> ConfigLoader {
        ConfigLoader::new()
            .with_config_path(dir.path().join("config.toml"))
            .with_env(env)
    }

    #[test]
    fn missing_file_yields_defaults_and_a_warning() {
        let dir = TempDir::new().unwrap();

        let load = loader(&dir, EnvConfig::default()).load().unwrap();

        assert_eq!(load.settings, Settings::default());
        assert_eq!(load.provenance, ConfigPathProvenance::Explicit);
        assert_eq!(load.warnings.items.len(), 1);
    }

    #[test]
    fn precedence_is_cli_then_env_then_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.toml"),
            "http_port = 8000\nhttps_port = 8443\nhost = \"127.0.0.1\"\n",
        )
        .unwrap();
        let env = EnvConfig {
            https_port: Some(9443),
            host: Some("::1".into()),
            ..EnvConfig::default()
        };
        let overrides = SettingsOverrides {
            host: Some("10.0.0.1".into()),
            ..SettingsOverrides::default()
        };

        let load = loader(&dir, env).with_overrides(overrides).load().unwrap();

        assert_eq!(load.settings.http_port, 8000);
        assert_eq!(load.settings.https_port, 9443);
        assert_eq!(load.settings.host, "10.0.0.1");
        assert!(load.warnings.is_empty());
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config.toml"), "http_port = \"eighty\"").unwrap();

        let err = loader(&dir, EnvConfig::default()).load().unwrap_err();
        assert!(matches!(err, ConfigLoadError::Parse { .. }));
    }

    #[test]
    fn config_path_prefers_explicit_then_env() {
        let env = EnvConfig {
            config_path: Some("/etc/wharf/config.toml".into()),
            ..EnvConfig::default()
        };
        let from_env = ConfigLoader::new().with_env(env.clone());
        assert_eq!(
            from_env.config_path(),
            (PathBuf::from("/etc/wharf/config.toml"), ConfigPathProvenance::Env)
        );

        let explicit = from_env.with_config_path("custom.toml");
        assert_eq!(explicit.config_path().1, ConfigPathProvenance::Explicit);

        let fallback = ConfigLoader::new().with_env(EnvConfig::default());
        assert_eq!(
            fallback.config_path(),
            (PathBuf::from(DEFAULT_CONFIG_PATH), ConfigPathProvenance::Default)
        );
    }

    #[test]
    fn canonical_bytes_ignore_formatting() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        fs::write(&path, "http_port = 8080\n").unwrap();
        let compact = CanonicalSettings::bytes(&path);
        fs::write(&path, "# comment\n\nhttp_port   =   8080\n").unwrap();
        let spaced = CanonicalSettings::bytes(&path);
        fs::write(&path, "http_port = 8081\n").unwrap();
        let changed = CanonicalSettings::bytes(&path);

        assert_eq!(compact, spaced);
        assert_ne!(compact, changed);
    }

    #[test]
    fn canonical_bytes_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let absent = CanonicalSettings::bytes(&path);

        fs::write(&path, "not = [valid").unwrap();
        assert_eq!(CanonicalSettings::bytes(&path), absent);

        fs::write(&path, "").unwrap();
        assert_eq!(CanonicalSettings::bytes(&path), absent);
    }
}
