/// Build step run before supervision: each configured command must succeed,
/// otherwise the run is aborted before anything is started.
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;

#[derive(Debug)]
pub enum BuildError {
    /// A configured command string has no program in it.
    Empty,
    Spawn {
        command: String,
        source: std::io::Error,
    },
    Failed {
        command: String,
        status: ExitStatus,
    },
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::Empty => write!(f, "build command is empty"),
            BuildError::Spawn { command, source } => {
                write!(f, "failed to run build command ({}): {}", command, source)
            }
            BuildError::Failed { command, status } => {
                write!(f, "build command ({}) failed: {}", command, status)
            }
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BuildError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Run one whitespace-separated command line with inherited output.
async fn run_command(cmd_str: &str) -> Result<(), BuildError> {
    let parts: Vec<&str> = cmd_str.split_whitespace().collect();
    let Some((program, args)) = parts.split_first() else {
        return Err(BuildError::Empty);
    };

    tracing::info!(command = %cmd_str, "running build command");
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| BuildError::Spawn {
            command: cmd_str.to_string(),
            source: e,
        })?;

    if !status.success() {
        return Err(BuildError::Failed {
            command: cmd_str.to_string(),
            status,
        });
    }
    Ok(())
}

/// Run every build command in order, stopping at the first failure.
pub async fn run_build(commands: &[String]) -> Result<(), BuildError> {
    if commands.is_empty() {
        tracing::debug!("no build commands configured");
        return Ok(());
    }
    for cmd in commands {
        run_command(cmd).await?;
    }
    tracing::info!(commands = commands.len(), "build finished");
    Ok(())
}
