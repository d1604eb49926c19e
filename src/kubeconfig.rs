/// Connection descriptor (kubeconfig) for reaching the local API server.
///
/// Written once per run, before any service starts, and never overwritten:
/// an existing file at the target path is left untouched. The file only
/// appears once its full contents are on disk.
use crate::config::KubeconfigConfig;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// File name stem of the apiserver certificate and key inside the cert dir.
const CERT_STEM: &str = "apiserver";

/// Endpoint and credential locations rendered into the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Path prefix of the certificate pair; `.crt` and `.key` are appended.
    cert_prefix: PathBuf,
    port: u16,
}

impl ConnectionDescriptor {
    pub fn new(cert_prefix: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            cert_prefix: cert_prefix.into(),
            port,
        }
    }

    /// Descriptor for certificates under `cert_dir`, resolved against `base`.
    pub fn in_dir(base: &Path, cert_dir: &Path, port: u16) -> Self {
        Self::new(base.join(cert_dir).join(CERT_STEM), port)
    }

    pub fn render(&self) -> String {
        let prefix = self.cert_prefix.display();
        let port = self.port;
        format!(
            "
apiVersion: v1
clusters:
- cluster:
    certificate-authority: {prefix}.crt
    server: https://localhost:{port}
  name: apiserver
contexts:
- context:
    cluster: apiserver
    user: apiserver
  name: apiserver
current-context: apiserver
kind: Config
preferences: {{}}
users:
- name: apiserver
  user:
    client-certificate: {prefix}.crt
    client-key: {prefix}.key
"
        )
    }
}

/// Errors that abort the run before any service is started.
#[derive(Debug)]
pub enum EmitError {
    WorkingDir { source: std::io::Error },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmitError::WorkingDir { source } => {
                write!(f, "cannot get working directory: {}", source)
            }
            EmitError::Write { path, source } => {
                write!(f, "failed to write kubeconfig {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for EmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EmitError::WorkingDir { source } => Some(source),
            EmitError::Write { source, .. } => Some(source),
        }
    }
}

/// Write `contents` to `path` unless something already exists there.
///
/// Returns `Ok(true)` if the file was written, `Ok(false)` if it already
/// existed. Missing parent directories are created.
pub fn write_if_not_found(path: &Path, contents: &str) -> Result<bool, EmitError> {
    persist_new(path, |file| file.write_all(contents.as_bytes()))
}

/// Fill a temp file next to `path` with `fill`, then move it into place
/// unless `path` already exists. A failed fill leaves nothing at `path`.
fn persist_new(
    path: &Path,
    fill: impl FnOnce(&mut File) -> std::io::Result<()>,
) -> Result<bool, EmitError> {
    let write_err = |e| EmitError::Write {
        path: path.to_path_buf(),
        source: e,
    };

    if path.exists() {
        tracing::debug!(path = %path.display(), "kubeconfig already exists, not overwriting");
        return Ok(false);
    }

    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            std::fs::create_dir_all(parent).map_err(write_err)?;
            parent
        }
        None => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
    fill(tmp.as_file_mut()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;

    match tmp.persist_noclobber(path) {
        Ok(_) => {}
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            tracing::debug!(path = %path.display(), "kubeconfig appeared concurrently, not overwriting");
            return Ok(false);
        }
        Err(e) => return Err(write_err(e.error)),
    }

    tracing::info!(path = %path.display(), "wrote kubeconfig");
    Ok(true)
}

/// Emit the descriptor with certificate paths and the target resolved
/// against `base`.
pub fn emit_in(base: &Path, config: &KubeconfigConfig, port: u16) -> Result<bool, EmitError> {
    let descriptor = ConnectionDescriptor::in_dir(base, &config.cert_dir, port);
    write_if_not_found(&base.join(&config.path), &descriptor.render())
}

/// Emit the descriptor relative to the current working directory.
pub fn emit(config: &KubeconfigConfig, port: u16) -> Result<bool, EmitError> {
    let cwd = std::env::current_dir().map_err(|e| EmitError::WorkingDir { source: e })?;
    emit_in(&cwd, config, port)
}
