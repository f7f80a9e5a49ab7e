use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::settings::Settings;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "CONFIG_PATH";

/// Raw configuration as defined in a TOML file. Absent keys fall back to the
/// next source.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl FileConfig {
    /// This layer applied over the defaults.
    pub fn over_defaults(&self) -> Settings {
        SettingsLayer::from(self.clone()).apply(Settings::default())
    }
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
    pub host: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub web_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    /// Variables that were set but could not be parsed, as `(name, value)`.
    pub rejected: Vec<(String, String)>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env_config = Self::default();

        env_config.config_path = lookup(CONFIG_PATH_VAR).map(PathBuf::from);
        env_config.http_port = env_config.port(&lookup, "HTTP_PORT");
        env_config.https_port = env_config.port(&lookup, "HTTPS_PORT");
        env_config.host = lookup("BIND_HOST");
        env_config.tls_cert = lookup("TLS_CERT").map(PathBuf::from);
        env_config.tls_key = lookup("TLS_KEY").map(PathBuf::from);
        env_config.web_root = lookup("WEB_ROOT").map(PathBuf::from);
        env_config.data_dir = lookup("DATA_DIR").map(PathBuf::from);

        env_config
    }

    fn port<F>(&mut self, lookup: &F, key: &str) -> Option<u16>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup(key)?;
        match raw.trim().parse() {
            Ok(port) => Some(port),
            Err(_) => {
                self.rejected.push((key.to_string(), raw));
                None
            }
        }
    }
}

/// Explicit values from the command line. Highest precedence.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SettingsOverrides {
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
    pub host: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub web_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

/// One source's optional values, uniform across file, environment and CLI.
#[derive(Debug, Default, Clone)]
pub(crate) struct SettingsLayer {
    http_port: Option<u16>,
    https_port: Option<u16>,
    host: Option<String>,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
    web_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
}

impl SettingsLayer {
    /// Values set here win over those in `base`.
    pub(crate) fn apply(self, base: Settings) -> Settings {
        Settings {
            http_port: self.http_port.unwrap_or(base.http_port),
            https_port: self.https_port.unwrap_or(base.https_port),
            host: self.host.unwrap_or(base.host),
            tls_cert: self.tls_cert.or(base.tls_cert),
            tls_key: self.tls_key.or(base.tls_key),
            web_root: self.web_root.unwrap_or(base.web_root),
            data_dir: self.data_dir.unwrap_or(base.data_dir),
        }
    }
}

impl From<FileConfig> for SettingsLayer {
    fn from(file: FileConfig) -> Self {
        Self {
            http_port: file.http_port,
            https_port: file.https_port,
            host: file.host,
            tls_cert: file.tls_cert,
            tls_key: file.tls_key,
            web_root: file.web_root,
            data_dir: file.data_dir,
        }
    }
}

impl From<EnvConfig> for SettingsLayer {
    fn from(env: EnvConfig) -> Self {
        Self {
            http_port: env.http_port,
            https_port: env.https_port,
            host: env.host,
            tls_cert: env.tls_cert,
            tls_key: env.tls_key,
            web_root: env.web_root,
            data_dir: env.data_dir,
        }
    }
}

impl From<SettingsOverrides> for SettingsLayer {
    fn from(cli: SettingsOverrides) -> Self {
        Self {
            http_port: cli.http_port,
            https_port: cli.https_port,
            host: cli.host,
            tls_cert: cli.tls_cert,
            tls_key: cli.tls_key,
            web_root: cli.web_root,
            data_dir: cli.data_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn gathers_known_variables() {
        let env = EnvConfig::from_lookup(lookup(&[
            ("HTTP_PORT", "8080"),
            ("BIND_HOST", "127.0.0.1"),
            ("TLS_CERT", "/etc/wharf/cert.pem"),
            ("CONFIG_PATH", "/etc/wharf/config.toml"),
        ]));

        assert_eq!(env.http_port, Some(8080));
        assert_eq!(env.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(env.tls_cert, Some(PathBuf::from("/etc/wharf/cert.pem")));
        assert_eq!(env.config_path, Some(PathBuf::from("/etc/wharf/config.toml")));
        assert!(env.rejected.is_empty());
    }

    #[test]
    fn unparsable_ports_are_rejected_not_defaulted() {
        let env = EnvConfig::from_lookup(lookup(&[("HTTPS_PORT", "https")]));

        assert_eq!(env.https_port, None);
        assert_eq!(env.rejected, vec![("HTTPS_PORT".to_string(), "https".to_string())]);
    }

    #[test]
    fn file_layer_fills_only_what_it_sets() {
        let file: FileConfig =
            toml::from_str("https_port = 8443\nweb_root = \"public\"\n").unwrap();
        let settings = file.over_defaults();

        assert_eq!(settings.https_port, 8443);
        assert_eq!(settings.web_root, PathBuf::from("public"));
        assert_eq!(settings.http_port, 80);
        assert_eq!(settings.data_dir, PathBuf::from("data"));
    }
}
