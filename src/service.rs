/// Service descriptors: which daemons make up a local session and the exact
/// command line each one is launched with.
use crate::config::{ApiConfig, ControllerConfig, LocalConfig, StorageConfig};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Listen endpoint of a storage daemon started by the supervisor.
pub const STORAGE_ENDPOINT: &str = "http://localhost:2379";

/// The kinds of service a session can run, declared in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    #[serde(alias = "etcd")]
    Storage,
    #[serde(alias = "apiserver")]
    Api,
    #[serde(alias = "controller-manager")]
    Controller,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [ServiceKind::Storage, ServiceKind::Api, ServiceKind::Controller];

    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::Storage => "storage",
            ServiceKind::Api => "api",
            ServiceKind::Controller => "controller",
        }
    }

    /// Whether later services rely on this one being up before they start.
    pub fn has_dependents(self) -> bool {
        matches!(self, ServiceKind::Storage | ServiceKind::Api)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "storage" | "etcd" => Ok(ServiceKind::Storage),
            "api" | "apiserver" => Ok(ServiceKind::Api),
            "controller" | "controller-manager" => Ok(ServiceKind::Controller),
            other => Err(format!(
                "unknown service '{other}' (expected storage, api or controller)"
            )),
        }
    }
}

/// The set of services requested for a session. Iterates in dependency order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<ServiceKind>")]
pub struct ServiceSet(BTreeSet<ServiceKind>);

impl ServiceSet {
    pub fn all() -> Self {
        ServiceKind::ALL.into_iter().collect()
    }

    pub fn contains(&self, kind: ServiceKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ServiceKind> + '_ {
        self.0.iter().copied()
    }
}

impl Default for ServiceSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<ServiceKind> for ServiceSet {
    fn from_iter<I: IntoIterator<Item = ServiceKind>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<ServiceKind>> for ServiceSet {
    fn from(kinds: Vec<ServiceKind>) -> Self {
        kinds.into_iter().collect()
    }
}

impl fmt::Display for ServiceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(ServiceKind::name).collect();
        f.write_str(&names.join(","))
    }
}

/// Static definition of one managed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    kind: ServiceKind,
    executable: PathBuf,
    args: Vec<String>,
    echo_output: bool,
}

impl ServiceDescriptor {
    pub fn new(
        kind: ServiceKind,
        executable: impl Into<PathBuf>,
        args: Vec<String>,
        echo_output: bool,
    ) -> Self {
        Self {
            kind,
            executable: executable.into(),
            args,
            echo_output,
        }
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Whether the child's stdout/stderr are connected to ours.
    pub fn echo_output(&self) -> bool {
        self.echo_output
    }

    /// The command line as it would be typed in a shell, for logs.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.executable.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Required configuration missing when assembling descriptors.
#[derive(Debug, PartialEq, Eq)]
pub enum DescriptorError {
    /// A requested service has no executable configured.
    EmptyBinary(ServiceKind),
    /// The API service needs a storage endpoint, but storage is not run
    /// locally and no external endpoint was given.
    MissingStorageEndpoint,
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorError::EmptyBinary(kind) => {
                write!(f, "no executable configured for the {kind} service")
            }
            DescriptorError::MissingStorageEndpoint => write!(
                f,
                "the api service needs a storage endpoint: run the storage service or set storage.endpoint"
            ),
        }
    }
}

impl std::error::Error for DescriptorError {}

fn executable(kind: ServiceKind, binary: &Path) -> Result<PathBuf, DescriptorError> {
    if binary.as_os_str().is_empty() {
        return Err(DescriptorError::EmptyBinary(kind));
    }
    Ok(binary.to_path_buf())
}

pub fn storage(config: &StorageConfig) -> Result<ServiceDescriptor, DescriptorError> {
    Ok(ServiceDescriptor::new(
        ServiceKind::Storage,
        executable(ServiceKind::Storage, &config.binary)?,
        Vec::new(),
        config.echo_output,
    ))
}

/// Build the api service command line, pointed at `storage_endpoint`.
pub fn api(config: &ApiConfig, storage_endpoint: &str) -> Result<ServiceDescriptor, DescriptorError> {
    let mut args = vec![
        format!("--etcd-servers={storage_endpoint}"),
        format!("--secure-port={}", config.secure_port),
        format!("--insecure-port={}", config.insecure_port),
        format!("--insecure-bind-address={}", config.bind_address),
    ];
    if config.disable_delegated_auth {
        args.push("--delegated-auth=false".to_string());
    }

    Ok(ServiceDescriptor::new(
        ServiceKind::Api,
        executable(ServiceKind::Api, &config.binary)?,
        args,
        config.echo_output,
    ))
}

pub fn controller(
    config: &ControllerConfig,
    kubeconfig: &Path,
) -> Result<ServiceDescriptor, DescriptorError> {
    Ok(ServiceDescriptor::new(
        ServiceKind::Controller,
        executable(ServiceKind::Controller, &config.binary)?,
        vec![format!("--kubeconfig={}", kubeconfig.display())],
        config.echo_output,
    ))
}

/// The endpoint the api service should use for storage.
///
/// A locally started storage daemon always listens on [`STORAGE_ENDPOINT`];
/// otherwise the configured external endpoint is used.
pub fn storage_endpoint(config: &LocalConfig) -> Result<String, DescriptorError> {
    if config.run.services.contains(ServiceKind::Storage) {
        return Ok(STORAGE_ENDPOINT.to_string());
    }
    match config.storage.endpoint.as_deref().map(str::trim) {
        Some(endpoint) if !endpoint.is_empty() => Ok(endpoint.to_string()),
        _ => Err(DescriptorError::MissingStorageEndpoint),
    }
}

/// Assemble descriptors for every requested service, in dependency order.
///
/// Fails before anything is spawned if required configuration is missing.
pub fn plan(config: &LocalConfig) -> Result<Vec<ServiceDescriptor>, DescriptorError> {
    config
        .run
        .services
        .iter()
        .map(|kind| match kind {
            ServiceKind::Storage => storage(&config.storage),
            ServiceKind::Api => api(&config.api, &storage_endpoint(config)?),
            ServiceKind::Controller => controller(&config.controller, &config.kubeconfig.path),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_config() -> ApiConfig {
        ApiConfig {
            binary: PathBuf::from("bin/apiserver"),
            secure_port: 9443,
            insecure_port: 8080,
            bind_address: "127.0.0.1".to_string(),
            disable_delegated_auth: false,
            echo_output: true,
        }
    }

    #[test]
    fn test_api_args_without_delegated_auth_flag() {
        let desc = api(&api_config(), "http://localhost:2379").unwrap();
        assert_eq!(
            desc.args(),
            [
                "--etcd-servers=http://localhost:2379",
                "--secure-port=9443",
                "--insecure-port=8080",
                "--insecure-bind-address=127.0.0.1",
            ]
        );
        assert_eq!(desc.executable(), Path::new("bin/apiserver"));
        assert!(desc.echo_output());
    }

    #[test]
    fn test_api_args_with_delegated_auth_disabled() {
        let config = ApiConfig {
            secure_port: 10443,
            insecure_port: 18080,
            disable_delegated_auth: true,
            ..api_config()
        };
        let desc = api(&config, "http://10.0.0.5:2379").unwrap();
        assert_eq!(
            desc.args(),
            [
                "--etcd-servers=http://10.0.0.5:2379",
                "--secure-port=10443",
                "--insecure-port=18080",
                "--insecure-bind-address=127.0.0.1",
                "--delegated-auth=false",
            ]
        );
    }

    #[test]
    fn test_storage_has_no_args() {
        let desc = storage(&StorageConfig::default()).unwrap();
        assert_eq!(desc.kind(), ServiceKind::Storage);
        assert_eq!(desc.executable(), Path::new("etcd"));
        assert!(desc.args().is_empty());
        assert!(!desc.echo_output());
    }

    #[test]
    fn test_controller_points_at_kubeconfig() {
        let desc = controller(&ControllerConfig::default(), Path::new("kubeconfig")).unwrap();
        assert_eq!(desc.args(), ["--kubeconfig=kubeconfig"]);
        assert_eq!(desc.command_line(), "bin/controller-manager --kubeconfig=kubeconfig");
    }

    #[test]
    fn test_empty_binary_is_rejected() {
        let config = ControllerConfig {
            binary: PathBuf::new(),
            ..Default::default()
        };
        let err = controller(&config, Path::new("kubeconfig")).unwrap_err();
        assert_eq!(err, DescriptorError::EmptyBinary(ServiceKind::Controller));
        assert!(err.to_string().contains("controller"));
    }

    #[test]
    fn test_plan_all_services_in_dependency_order() {
        let config = LocalConfig::default();
        let kinds: Vec<ServiceKind> = plan(&config).unwrap().iter().map(|d| d.kind()).collect();
        assert_eq!(kinds, ServiceKind::ALL);
    }

    #[test]
    fn test_plan_local_storage_uses_fixed_endpoint() {
        let mut config = LocalConfig::default();
        config.storage.endpoint = Some("http://elsewhere:2379".to_string());
        let descs = plan(&config).unwrap();
        assert_eq!(descs[1].args()[0], format!("--etcd-servers={STORAGE_ENDPOINT}"));
    }

    #[test]
    fn test_plan_external_storage_endpoint() {
        let mut config = LocalConfig::default();
        config.run.services = [ServiceKind::Api].into_iter().collect();
        config.storage.endpoint = Some("http://10.0.0.5:2379".to_string());
        let descs = plan(&config).unwrap();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].args()[0], "--etcd-servers=http://10.0.0.5:2379");
    }

    #[test]
    fn test_plan_api_without_storage_endpoint_fails() {
        let mut config = LocalConfig::default();
        config.run.services = [ServiceKind::Api, ServiceKind::Controller].into_iter().collect();
        assert_eq!(plan(&config).unwrap_err(), DescriptorError::MissingStorageEndpoint);

        config.storage.endpoint = Some("   ".to_string());
        assert_eq!(plan(&config).unwrap_err(), DescriptorError::MissingStorageEndpoint);
    }

    #[test]
    fn test_plan_empty_set() {
        let mut config = LocalConfig::default();
        config.run.services = ServiceSet::from(Vec::new());
        assert!(plan(&config).unwrap().is_empty());
    }

    #[test]
    fn test_service_set_iterates_in_dependency_order() {
        let set: ServiceSet = vec![ServiceKind::Controller, ServiceKind::Storage, ServiceKind::Controller].into();
        let kinds: Vec<ServiceKind> = set.iter().collect();
        assert_eq!(kinds, [ServiceKind::Storage, ServiceKind::Controller]);
        assert_eq!(set.iter().count(), 2);
        assert_eq!(set.to_string(), "storage,controller");
    }

    #[test]
    fn test_service_kind_accepts_legacy_names() {
        assert_eq!("etcd".parse::<ServiceKind>().unwrap(), ServiceKind::Storage);
        assert_eq!("apiserver".parse::<ServiceKind>().unwrap(), ServiceKind::Api);
        assert_eq!(
            "controller-manager".parse::<ServiceKind>().unwrap(),
            ServiceKind::Controller
        );
        assert!("scheduler".parse::<ServiceKind>().is_err());
    }
}
