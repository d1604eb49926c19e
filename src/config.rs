use crate::service::ServiceSet;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from devstack.toml.
///
/// Resolved once at startup (file values, then CLI overrides) and passed by
/// reference from then on.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LocalConfig {
    pub run: RunConfig,
    pub build: BuildConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub controller: ControllerConfig,
    pub kubeconfig: KubeconfigConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Services to start, e.g. `["storage", "api", "controller"]`.
    pub services: ServiceSet,
    /// Run the build commands before starting anything.
    pub build: bool,
    /// Pause after starting a service that others depend on.
    pub warmup_secs: u64,
    /// How long to wait for watchers to reap their processes once the
    /// session is stopping.
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BuildConfig {
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub binary: PathBuf,
    /// External storage endpoint, used when storage is not run locally.
    pub endpoint: Option<String>,
    pub echo_output: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub binary: PathBuf,
    pub secure_port: u16,
    pub insecure_port: u16,
    pub bind_address: String,
    pub disable_delegated_auth: bool,
    pub echo_output: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub binary: PathBuf,
    pub echo_output: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KubeconfigConfig {
    /// Where the connection descriptor is written.
    pub path: PathBuf,
    /// Directory holding the apiserver certificate and key, relative to the
    /// working directory.
    pub cert_dir: PathBuf,
}

// --- Default implementations ---

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            services: ServiceSet::all(),
            build: true,
            warmup_secs: 2,
            shutdown_timeout_secs: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("etcd"),
            endpoint: None,
            echo_output: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("bin/apiserver"),
            secure_port: 9443,
            insecure_port: 8080,
            bind_address: "127.0.0.1".to_string(),
            disable_delegated_auth: true,
            echo_output: true,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("bin/controller-manager"),
            echo_output: true,
        }
    }
}

impl Default for KubeconfigConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("kubeconfig"),
            cert_dir: PathBuf::from("apiserver.local.config/certificates"),
        }
    }
}

impl RunConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Errors that can occur while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load config from `path`. A missing file yields the defaults; a file that
/// exists but cannot be read or parsed is an error.
pub fn load_config(path: &Path) -> Result<LocalConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(LocalConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceKind;

    #[test]
    fn test_defaults() {
        let config = LocalConfig::default();
        assert_eq!(config.run.services, ServiceSet::all());
        assert!(config.run.build);
        assert_eq!(config.run.warmup(), Duration::from_secs(2));
        assert_eq!(config.api.secure_port, 9443);
        assert_eq!(config.api.insecure_port, 8080);
        assert!(config.api.disable_delegated_auth);
        assert!(!config.storage.echo_output);
        assert!(config.controller.echo_output);
        assert_eq!(config.kubeconfig.path, PathBuf::from("kubeconfig"));
        assert!(config.build.commands.is_empty());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("devstack.toml")).unwrap();
        assert_eq!(config.api.secure_port, 9443);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devstack.toml");
        std::fs::write(
            &path,
            r#"
[run]
services = ["etcd", "apiserver"]
warmup_secs = 5

[api]
secure_port = 10443
disable_delegated_auth = false

[build]
commands = ["make build"]
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        let kinds: Vec<ServiceKind> = config.run.services.iter().collect();
        assert_eq!(kinds, [ServiceKind::Storage, ServiceKind::Api]);
        assert_eq!(config.run.warmup_secs, 5);
        assert!(config.run.build);
        assert_eq!(config.api.secure_port, 10443);
        assert_eq!(config.api.insecure_port, 8080);
        assert!(!config.api.disable_delegated_auth);
        assert_eq!(config.build.commands, ["make build"]);
        assert_eq!(config.controller.binary, PathBuf::from("bin/controller-manager"));
    }

    #[test]
    fn test_empty_services_list() {
        let config: LocalConfig = toml::from_str("[run]\nservices = []\n").unwrap();
        assert!(config.run.services.is_empty());
    }

    #[test]
    fn test_unknown_service_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devstack.toml");
        std::fs::write(&path, "[run]\nservices = [\"scheduler\"]\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("invalid config"));
    }

    #[test]
    fn test_unreadable_path_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory exists but cannot be read as a file.
        let err = load_config(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
