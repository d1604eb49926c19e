mod config;
mod kubeconfig;
mod prebuild;
mod process;
mod readiness;
mod service;
mod signals;
mod supervisor;
mod token;

use clap::{ArgAction, Parser};
use config::LocalConfig;
use service::{ServiceDescriptor, ServiceKind};
use std::path::PathBuf;
use supervisor::Supervisor;
use token::CancelToken;

/// Run the storage daemon, API server and controller manager locally.
///
/// All services live and die together: when any one of them exits, or on
/// Ctrl-C, every other one is killed and the session ends.
#[derive(Parser, Debug)]
#[command(name = "devstack", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "devstack.toml")]
    config: PathBuf,

    /// Services to run, comma separated (storage, api, controller)
    #[arg(long, value_delimiter = ',', num_args = 0..)]
    run: Option<Vec<ServiceKind>>,

    /// Build the binaries before running
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    build: Option<bool>,

    /// Use this storage endpoint instead of starting a storage daemon
    #[arg(long = "etcd", value_name = "URL")]
    storage_endpoint: Option<String>,

    /// Path to the storage daemon binary
    #[arg(long = "etcd-binary", value_name = "PATH")]
    storage_binary: Option<PathBuf>,

    /// Path to the apiserver binary
    #[arg(long = "apiserver", value_name = "PATH")]
    api_binary: Option<PathBuf>,

    /// Path to the controller-manager binary
    #[arg(long = "controller-manager", value_name = "PATH")]
    controller_binary: Option<PathBuf>,

    /// Path of the kubeconfig to write for kubectl
    #[arg(long, value_name = "PATH")]
    kubeconfig: Option<PathBuf>,

    /// Secure port the apiserver serves on
    #[arg(long)]
    secure_port: Option<u16>,

    /// Insecure port the apiserver serves on
    #[arg(long)]
    insecure_port: Option<u16>,

    /// Pass --delegated-auth=false to the apiserver
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    disable_delegated_auth: Option<bool>,

    /// Pipe the storage daemon's stdout and stderr
    #[arg(long, alias = "printetcd", action = ArgAction::Set, value_name = "BOOL")]
    print_etcd: Option<bool>,

    /// Pipe the apiserver's stdout and stderr
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    print_apiserver: Option<bool>,

    /// Pipe the controller-manager's stdout and stderr
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    print_controller_manager: Option<bool>,

    /// Seconds to wait after starting a service before starting its dependents
    #[arg(long, value_name = "SECS")]
    warmup: Option<u64>,

    /// Print resolved settings and command lines, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (warm-up pauses, termination details)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    /// Apply command line overrides on top of the file config.
    fn apply(&self, config: &mut LocalConfig) {
        if let Some(ref run) = self.run {
            config.run.services = run.iter().copied().collect();
        }
        if let Some(build) = self.build {
            config.run.build = build;
        }
        if let Some(warmup) = self.warmup {
            config.run.warmup_secs = warmup;
        }
        if let Some(ref endpoint) = self.storage_endpoint {
            config.storage.endpoint = Some(endpoint.clone());
        }
        if let Some(ref binary) = self.storage_binary {
            config.storage.binary = binary.clone();
        }
        if let Some(ref binary) = self.api_binary {
            config.api.binary = binary.clone();
        }
        if let Some(ref binary) = self.controller_binary {
            config.controller.binary = binary.clone();
        }
        if let Some(ref path) = self.kubeconfig {
            config.kubeconfig.path = path.clone();
        }
        if let Some(port) = self.secure_port {
            config.api.secure_port = port;
        }
        if let Some(port) = self.insecure_port {
            config.api.insecure_port = port;
        }
        if let Some(disable) = self.disable_delegated_auth {
            config.api.disable_delegated_auth = disable;
        }
        if let Some(echo) = self.print_etcd {
            config.storage.echo_output = echo;
        }
        if let Some(echo) = self.print_apiserver {
            config.api.echo_output = echo;
        }
        if let Some(echo) = self.print_controller_manager {
            config.controller.echo_output = echo;
        }
    }

    fn log_filter(&self) -> &'static str {
        if self.verbose {
            "devstack=debug"
        } else if self.quiet {
            "devstack=warn"
        } else {
            "devstack=info"
        }
    }
}

fn print_plan(config: &LocalConfig, descriptors: &[ServiceDescriptor]) {
    println!("devstack v{}", env!("CARGO_PKG_VERSION"));
    println!("services:    {}", config.run.services);
    println!("build:       {}", config.run.build);
    for cmd in &config.build.commands {
        println!("  build command: {cmd}");
    }
    println!("warm-up:     {}s", config.run.warmup_secs);
    println!("kubeconfig:  {}", config.kubeconfig.path.display());
    for desc in descriptors {
        let echo = if desc.echo_output() { "" } else { " (output discarded)" };
        println!("  {:<10} {}{}", desc.kind(), desc.command_line(), echo);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = config::load_config(&cli.config)?;
    cli.apply(&mut config);
    let config = config;

    let descriptors = service::plan(&config)?;

    if cli.dry_run {
        print_plan(&config, &descriptors);
        println!("Dry run mode: not running.");
        return Ok(());
    }

    if config.run.build {
        prebuild::run_build(&config.build.commands).await?;
    }

    kubeconfig::emit(&config.kubeconfig, config.api.secure_port)?;

    let token = CancelToken::new();
    signals::install(token.clone())?;

    let running = Supervisor::new(descriptors, config.run.warmup(), token.clone())
        .shutdown_timeout(config.run.shutdown_timeout())
        .start()
        .await;

    if running.is_empty() && !token.is_triggered() {
        tracing::info!("no services requested, waiting for interrupt");
    } else if !token.is_triggered() {
        tracing::info!(services = running.len(), "session running");
    }
    if config.run.services.contains(ServiceKind::Api) && !token.is_triggered() {
        tracing::info!(
            "to test the server run `kubectl --kubeconfig {} api-versions`",
            config.kubeconfig.path.display()
        );
    }

    let report = running.wait().await;
    for r in &report.reports {
        tracing::debug!(
            service = %r.kind,
            pid = ?r.pid,
            ending = ?r.ending,
            uptime_secs = (r.ended_at - r.started_at).as_secs(),
            ok = r.outcome.is_ok(),
            "watcher finished"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_filter())),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "devstack failed");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
